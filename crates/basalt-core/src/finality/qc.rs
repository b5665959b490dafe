use crate::crypto::bls::ct_eq;
use crate::crypto::{
    aggregate_public_keys, aggregate_signatures, verify, BlsPublicKey, BlsSignature, Digest,
    BLS_SIGNATURE_LEN,
};
use crate::finality::bitset::FinalizerBitset;
use crate::finality::policy::FinalizerPolicy;
use crate::wire::{expect_consumed, read_exact, WireError};
use std::sync::Arc;
use thiserror::Error;

/// Outcome of feeding one vote into a pending quorum certificate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VoteStatus {
    /// Vote accepted and folded into the aggregate.
    Added,
    /// This finalizer already voted in this set; state unchanged.
    Duplicate,
    /// Index out of range, or the key does not match the policy entry at
    /// that index.
    UnknownFinalizer,
    /// The vote's signature does not verify over the proposal id. Rejected
    /// before touching the aggregate.
    BadSignature,
}

#[derive(Debug, Error)]
pub enum QcError {
    #[error("Strong quorum not reached: weight {have} of required {need}")]
    QuorumNotReached { have: u64, need: u64 },
}

/// A finished quorum certificate: which finalizers signed one proposal id,
/// and their aggregate signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QuorumCertificate {
    pub proposal_id: Digest,
    /// One bit per finalizer index of the policy the QC was formed under.
    pub active_finalizers: FinalizerBitset,
    pub active_agg_sig: BlsSignature,
}

impl QuorumCertificate {
    /// Check a certificate against a policy: the bitset must cover the
    /// policy exactly, the signers' weight must reach the threshold, and
    /// the aggregate signature must verify over the proposal id against the
    /// aggregate of the signers' keys. Returns a plain bool; an invalid QC
    /// is not an error, just not a quorum.
    pub fn verify(&self, policy: &FinalizerPolicy) -> bool {
        if self.active_finalizers.len() != policy.finalizers().len() {
            return false;
        }

        let signers: Vec<&BlsPublicKey> = self
            .active_finalizers
            .iter_set()
            .map(|i| &policy.finalizers()[i].public_key)
            .collect();
        if signers.is_empty() {
            return false;
        }

        if self.signer_weight(policy) < policy.threshold() {
            return false;
        }

        let Ok(agg_key) = aggregate_public_keys(&signers) else {
            return false;
        };
        verify(&agg_key, self.proposal_id.as_bytes(), &self.active_agg_sig)
    }

    /// Total weight of the finalizers whose bits are set.
    pub fn signer_weight(&self, policy: &FinalizerPolicy) -> u64 {
        self.active_finalizers
            .iter_set()
            .filter_map(|i| policy.finalizers().get(i))
            .map(|f| f.weight)
            .sum()
    }

    /// Append the canonical wire form:
    /// `proposal_id[32] || bitset || agg_sig[192]`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.proposal_id.as_bytes());
        self.active_finalizers.encode(out);
        out.extend_from_slice(self.active_agg_sig.affine_le_bytes());
    }

    pub fn decode(input: &mut &[u8], finalizer_count: usize) -> Result<Self, WireError> {
        let id_bytes = read_exact(input, 32, "qc proposal id")?;
        let proposal_id = Digest::from_bytes(id_bytes).expect("read_exact returned 32 bytes");
        let active_finalizers = FinalizerBitset::decode(input, finalizer_count)?;
        let sig_bytes = read_exact(input, BLS_SIGNATURE_LEN, "qc aggregate signature")?;
        let active_agg_sig = BlsSignature::from_bytes(sig_bytes).map_err(|e| {
            WireError::InvalidPoint { context: "qc aggregate signature", reason: e.to_string() }
        })?;
        Ok(Self { proposal_id, active_finalizers, active_agg_sig })
    }

    pub fn decode_exact(mut input: &[u8], finalizer_count: usize) -> Result<Self, WireError> {
        let qc = Self::decode(&mut input, finalizer_count)?;
        expect_consumed(input, "quorum certificate")?;
        Ok(qc)
    }
}

/// Verify a batch of certificates on the rayon pool, one bool per input.
///
/// For bulk paths (replaying a block log, syncing a span of headers) where
/// per-certificate latency does not matter but throughput does. Callers that
/// prune targets while this runs must re-check membership before applying a
/// late result.
pub fn verify_batch(items: &[(&QuorumCertificate, &FinalizerPolicy)]) -> Vec<bool> {
    use rayon::prelude::*;
    items.par_iter().map(|&(qc, policy)| qc.verify(policy)).collect()
}

/// Vote collector for one proposal, owned by the proposal's leader.
///
/// Strong and weak votes accumulate in separate bitsets with separate
/// running aggregates. Each vote's signature is verified individually
/// before it enters the running aggregate, so one rogue signature cannot
/// poison a quorum's worth of valid votes. Only the strong aggregate is
/// ever published; the weak set is carried for diagnostics.
#[derive(Clone, Debug)]
pub struct PendingQuorumCertificate {
    proposal_id: Digest,
    policy: Arc<FinalizerPolicy>,
    strong_votes: FinalizerBitset,
    weak_votes: FinalizerBitset,
    strong_weight: u64,
    weak_weight: u64,
    strong_sig: Option<BlsSignature>,
    weak_sig: Option<BlsSignature>,
}

impl PendingQuorumCertificate {
    pub fn new(proposal_id: Digest, policy: Arc<FinalizerPolicy>) -> Self {
        let len = policy.finalizers().len();
        Self {
            proposal_id,
            policy,
            strong_votes: FinalizerBitset::with_len(len),
            weak_votes: FinalizerBitset::with_len(len),
            strong_weight: 0,
            weak_weight: 0,
            strong_sig: None,
            weak_sig: None,
        }
    }

    pub fn proposal_id(&self) -> Digest {
        self.proposal_id
    }

    /// Feed one vote in. Duplicates are idempotent, not errors; every other
    /// rejection leaves the aggregate exactly as it was.
    pub fn add_vote(
        &mut self,
        strong: bool,
        finalizer_index: u32,
        public_key: &BlsPublicKey,
        signature: &BlsSignature,
    ) -> VoteStatus {
        let weight = {
            let Some(authority) = self.policy.finalizers().get(finalizer_index as usize) else {
                return VoteStatus::UnknownFinalizer;
            };
            // The claimed key must be the policy's key for that index.
            // Constant-time compare: vote handling is hot path, attacker-facing.
            if !ct_eq(
                authority.public_key.affine_le_bytes(),
                public_key.affine_le_bytes(),
            ) {
                return VoteStatus::UnknownFinalizer;
            }
            authority.weight
        };

        let index = finalizer_index as usize;
        let already = if strong { self.strong_votes.test(index) } else { self.weak_votes.test(index) };
        if already {
            return VoteStatus::Duplicate;
        }

        if !verify(public_key, self.proposal_id.as_bytes(), signature) {
            return VoteStatus::BadSignature;
        }

        let (votes, agg, total) = if strong {
            (&mut self.strong_votes, &mut self.strong_sig, &mut self.strong_weight)
        } else {
            (&mut self.weak_votes, &mut self.weak_sig, &mut self.weak_weight)
        };
        votes.set(index);
        *agg = Some(match agg.take() {
            None => signature.clone(),
            Some(prev) => aggregate_signatures(&[&prev, signature])
                .expect("two signatures are never an empty aggregation"),
        });
        *total += weight;
        VoteStatus::Added
    }

    /// Whether the given vote set has reached the policy threshold.
    pub fn is_quorum(&self, strong: bool) -> bool {
        let weight = if strong { self.strong_weight } else { self.weak_weight };
        weight >= self.policy.threshold()
    }

    pub fn strong_weight(&self) -> u64 {
        self.strong_weight
    }

    pub fn weak_weight(&self) -> u64 {
        self.weak_weight
    }

    /// Produce the certificate. Requires a strong quorum.
    pub fn finalize(&self) -> Result<QuorumCertificate, QcError> {
        if !self.is_quorum(true) {
            return Err(QcError::QuorumNotReached {
                have: self.strong_weight,
                need: self.policy.threshold(),
            });
        }
        let active_agg_sig = self
            .strong_sig
            .clone()
            .expect("strong quorum implies at least one strong vote");
        Ok(QuorumCertificate {
            proposal_id: self.proposal_id,
            active_finalizers: self.strong_votes.clone(),
            active_agg_sig,
        })
    }
}
