use crate::crypto::BlsPublicKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors constructing a finalizer policy.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("A finalizer policy needs at least one finalizer")]
    EmptyFinalizerSet,

    #[error("Duplicate finalizer key at index {index}")]
    DuplicateKey { index: usize },

    #[error(
        "Threshold {threshold} outside the BFT-safe range ({min_exclusive}, {total}] for total weight {total}"
    )]
    InvalidThreshold { threshold: u64, min_exclusive: u64, total: u64 },
}

/// One voting member of a finalizer policy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizerAuthority {
    /// Operator-chosen label; not consensus-relevant.
    pub description: String,
    /// Weight this finalizer's vote contributes toward the threshold.
    pub weight: u64,
    pub public_key: BlsPublicKey,
}

/// A versioned, ordered set of finalizers with a weight threshold.
///
/// Immutable once installed for a generation: finalizer indices (and
/// therefore vote-bitset positions) are stable for the policy's lifetime.
/// Two successive policies may overlap in membership, but their indices are
/// independent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PolicyData", into = "PolicyData")]
pub struct FinalizerPolicy {
    generation: u32,
    threshold: u64,
    finalizers: Vec<FinalizerAuthority>,
    /// Finalizer indices sorted by public-key bytes, for O(log n) lookup.
    by_key: Vec<u32>,
}

/// Serde shadow of [`FinalizerPolicy`]; deserializing revalidates and
/// rebuilds the lookup index.
#[derive(Serialize, Deserialize)]
struct PolicyData {
    generation: u32,
    threshold: u64,
    finalizers: Vec<FinalizerAuthority>,
}

impl FinalizerPolicy {
    /// Validate and install a policy. The threshold must be strictly more
    /// than half the total weight (the canonical instantiation uses more
    /// than two thirds; the policy stores whatever was chosen) and not more
    /// than the total.
    pub fn new(
        generation: u32,
        threshold: u64,
        finalizers: Vec<FinalizerAuthority>,
    ) -> Result<Self, PolicyError> {
        if finalizers.is_empty() {
            return Err(PolicyError::EmptyFinalizerSet);
        }

        let total: u64 = finalizers.iter().map(|f| f.weight).sum();
        if threshold <= total / 2 || threshold > total {
            return Err(PolicyError::InvalidThreshold {
                threshold,
                min_exclusive: total / 2,
                total,
            });
        }

        let mut by_key: Vec<u32> = (0..finalizers.len() as u32).collect();
        by_key.sort_by(|&a, &b| {
            finalizers[a as usize]
                .public_key
                .cmp(&finalizers[b as usize].public_key)
        });
        for pair in by_key.windows(2) {
            if finalizers[pair[0] as usize].public_key == finalizers[pair[1] as usize].public_key {
                return Err(PolicyError::DuplicateKey { index: pair[1] as usize });
            }
        }

        Ok(Self { generation, threshold, finalizers, by_key })
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn finalizers(&self) -> &[FinalizerAuthority] {
        &self.finalizers
    }

    pub fn total_weight(&self) -> u64 {
        self.finalizers.iter().map(|f| f.weight).sum()
    }

    /// Index of a finalizer by public key, or `None` if the key is not in
    /// this policy. Binary search over the sorted key index.
    pub fn finalizer_index(&self, key: &BlsPublicKey) -> Option<u32> {
        self.by_key
            .binary_search_by(|&i| self.finalizers[i as usize].public_key.cmp(key))
            .ok()
            .map(|pos| self.by_key[pos])
    }

    pub fn contains(&self, key: &BlsPublicKey) -> bool {
        self.finalizer_index(key).is_some()
    }
}

impl TryFrom<PolicyData> for FinalizerPolicy {
    type Error = PolicyError;

    fn try_from(data: PolicyData) -> Result<Self, Self::Error> {
        Self::new(data.generation, data.threshold, data.finalizers)
    }
}

impl From<FinalizerPolicy> for PolicyData {
    fn from(policy: FinalizerPolicy) -> Self {
        PolicyData {
            generation: policy.generation,
            threshold: policy.threshold,
            finalizers: policy.finalizers,
        }
    }
}
