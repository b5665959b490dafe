use crate::crypto::{BlsPublicKey, BLS_PUBLIC_KEY_LEN};
use crate::finality::policy::{FinalizerAuthority, FinalizerPolicy};
use crate::wire::{
    expect_consumed, read_bool, read_exact, read_u32_le, read_u64_le, read_u8, read_varint,
    read_varstr, write_varint, write_varstr, WireError,
};
use serde::{Deserialize, Serialize};

/// Extension id of the transition-era finalizer set. Carried by the last
/// pre-finality blocks to announce the first finalizer policy.
pub const FINALIZER_SET_EXTENSION_ID: u16 = 2;

/// Extension id of the instant-finality extension, the successor of the
/// finalizer set extension once finality is active. Same id, different era;
/// the active protocol feature decides which decoder applies.
pub const INSTANT_FINALITY_EXTENSION_ID: u16 = 2;

/// Extension id of the per-block proposal info.
pub const PROPOSAL_INFO_EXTENSION_ID: u16 = 3;

/// The QC a block header claims for one of its ancestors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QcClaim {
    /// Height of the most recent ancestor with a QC; 0 when there is none
    /// yet (genesis).
    pub height: u64,
    pub strong: bool,
}

/// Schedule of block proposers, announced ahead of its activation time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposerPolicy {
    pub schema_version: u8,
    /// Slot at which this schedule becomes active.
    pub active_slot: u64,
    /// Producer names in schedule order.
    pub producers: Vec<String>,
}

impl ProposerPolicy {
    pub const CURRENT_SCHEMA_VERSION: u8 = 1;
}

/// The instant-finality header extension: a QC claim plus optional policy
/// announcements.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstantFinalityExtension {
    pub qc_claim: QcClaim,
    pub new_finalizer_policy: Option<FinalizerPolicy>,
    pub new_proposer_policy: Option<ProposerPolicy>,
}

/// Per-block pointer at the latest QC-justified ancestor.
///
/// One type serves both historical spellings of this structure; their wire
/// forms were identical.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalInfo {
    pub last_qc_block_height: u32,
    pub is_last_qc_strong: bool,
}

/// Reject header extension lists that repeat an id. Each extension may
/// appear at most once per header.
pub fn validate_unique_extensions(ids: impl IntoIterator<Item = u16>) -> Result<(), WireError> {
    let mut seen = Vec::new();
    for id in ids {
        if seen.contains(&id) {
            return Err(WireError::DuplicateExtension { id });
        }
        seen.push(id);
    }
    Ok(())
}

/// Whether id 2 carries the transition-era finalizer set or its
/// instant-finality successor. Decided by the active protocol feature, not
/// by anything on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtensionEra {
    Transition,
    InstantFinality,
}

/// A block header's extension list, validated and decoded.
///
/// Construction rejects duplicate ids up front; the typed accessors below
/// are then simple lookups. Unknown ids are preserved untouched, since
/// future protocol features append new extensions that older nodes must
/// carry through.
#[derive(Clone, Debug, Default)]
pub struct HeaderExtensions {
    entries: Vec<(u16, Vec<u8>)>,
}

impl HeaderExtensions {
    pub fn from_entries(entries: Vec<(u16, Vec<u8>)>) -> Result<Self, WireError> {
        validate_unique_extensions(entries.iter().map(|(id, _)| *id))?;
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn raw(&self, id: u16) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(entry_id, _)| *entry_id == id)
            .map(|(_, bytes)| bytes.as_slice())
    }

    /// The id-2 extension under the given era, decoded. `None` when the
    /// header carries no id-2 extension at all.
    pub fn finalizer_set(&self, era: ExtensionEra) -> Option<Result<FinalizerPolicy, WireError>> {
        match era {
            ExtensionEra::Transition => self
                .raw(FINALIZER_SET_EXTENSION_ID)
                .map(decode_finalizer_set_extension),
            ExtensionEra::InstantFinality => None,
        }
    }

    pub fn instant_finality(
        &self,
        era: ExtensionEra,
    ) -> Option<Result<InstantFinalityExtension, WireError>> {
        match era {
            ExtensionEra::Transition => None,
            ExtensionEra::InstantFinality => self
                .raw(INSTANT_FINALITY_EXTENSION_ID)
                .map(decode_instant_finality_extension),
        }
    }

    pub fn proposal_info(&self) -> Option<Result<ProposalInfo, WireError>> {
        self.raw(PROPOSAL_INFO_EXTENSION_ID)
            .map(decode_proposal_info_extension)
    }
}

fn write_policy_body(out: &mut Vec<u8>, policy: &FinalizerPolicy) {
    out.extend_from_slice(&policy.generation().to_le_bytes());
    out.extend_from_slice(&policy.threshold().to_le_bytes());
    write_varint(out, policy.finalizers().len() as u64);
    for f in policy.finalizers() {
        write_varstr(out, &f.description);
        out.extend_from_slice(&f.weight.to_le_bytes());
        out.extend_from_slice(f.public_key.affine_le_bytes());
    }
}

fn read_policy_body(input: &mut &[u8]) -> Result<FinalizerPolicy, WireError> {
    let generation = read_u32_le(input, "policy generation")?;
    let threshold = read_u64_le(input, "policy threshold")?;
    let count = read_varint(input)? as usize;
    let mut finalizers = Vec::with_capacity(count);
    for _ in 0..count {
        let description = read_varstr(input, "finalizer description")?;
        let weight = read_u64_le(input, "finalizer weight")?;
        let pk_bytes = read_exact(input, BLS_PUBLIC_KEY_LEN, "finalizer public key")?;
        let public_key = BlsPublicKey::from_bytes(pk_bytes).map_err(|e| {
            WireError::InvalidPoint { context: "finalizer public key", reason: e.to_string() }
        })?;
        finalizers.push(FinalizerAuthority { description, weight, public_key });
    }
    FinalizerPolicy::new(generation, threshold, finalizers)
        .map_err(|e| WireError::InvalidPolicy { reason: e.to_string() })
}

/// Encode the transition-era finalizer set extension (id 2):
/// `version u32 LE || threshold u64 LE || finalizers`.
pub fn encode_finalizer_set_extension(policy: &FinalizerPolicy) -> Vec<u8> {
    let mut out = Vec::new();
    write_policy_body(&mut out, policy);
    out
}

/// Decode the transition-era finalizer set extension into a policy. The
/// historical `version` field becomes the policy generation.
pub fn decode_finalizer_set_extension(mut input: &[u8]) -> Result<FinalizerPolicy, WireError> {
    let policy = read_policy_body(&mut input)?;
    expect_consumed(input, "finalizer set extension")?;
    Ok(policy)
}

/// Encode the instant-finality extension (id 2, successor era):
/// `qc_claim || optional finalizer policy || optional proposer policy`.
/// Options are a presence byte followed by the body.
pub fn encode_instant_finality_extension(ext: &InstantFinalityExtension) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&ext.qc_claim.height.to_le_bytes());
    out.push(ext.qc_claim.strong as u8);

    match &ext.new_finalizer_policy {
        None => out.push(0),
        Some(policy) => {
            out.push(1);
            write_policy_body(&mut out, policy);
        }
    }

    match &ext.new_proposer_policy {
        None => out.push(0),
        Some(policy) => {
            out.push(1);
            out.push(policy.schema_version);
            out.extend_from_slice(&policy.active_slot.to_le_bytes());
            write_varint(&mut out, policy.producers.len() as u64);
            for producer in &policy.producers {
                write_varstr(&mut out, producer);
            }
        }
    }

    out
}

pub fn decode_instant_finality_extension(
    mut input: &[u8],
) -> Result<InstantFinalityExtension, WireError> {
    let height = read_u64_le(&mut input, "qc claim height")?;
    let strong = read_bool(&mut input, "qc claim strong flag")?;
    let qc_claim = QcClaim { height, strong };

    let new_finalizer_policy = if read_bool(&mut input, "finalizer policy presence")? {
        Some(read_policy_body(&mut input)?)
    } else {
        None
    };

    let new_proposer_policy = if read_bool(&mut input, "proposer policy presence")? {
        let schema_version = read_u8(&mut input, "proposer policy schema version")?;
        let active_slot = read_u64_le(&mut input, "proposer policy active slot")?;
        let count = read_varint(&mut input)? as usize;
        let mut producers = Vec::with_capacity(count);
        for _ in 0..count {
            producers.push(read_varstr(&mut input, "producer name")?);
        }
        Some(ProposerPolicy { schema_version, active_slot, producers })
    } else {
        None
    };

    expect_consumed(input, "instant finality extension")?;
    Ok(InstantFinalityExtension { qc_claim, new_finalizer_policy, new_proposer_policy })
}

/// Encode the proposal info extension (id 3):
/// `last_qc_block_height u32 LE || is_last_qc_strong`.
pub fn encode_proposal_info_extension(info: &ProposalInfo) -> Vec<u8> {
    let mut out = Vec::with_capacity(5);
    out.extend_from_slice(&info.last_qc_block_height.to_le_bytes());
    out.push(info.is_last_qc_strong as u8);
    out
}

pub fn decode_proposal_info_extension(mut input: &[u8]) -> Result<ProposalInfo, WireError> {
    let last_qc_block_height = read_u32_le(&mut input, "last qc block height")?;
    let is_last_qc_strong = read_bool(&mut input, "last qc strong flag")?;
    expect_consumed(input, "proposal info extension")?;
    Ok(ProposalInfo { last_qc_block_height, is_last_qc_strong })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::BlsPrivateKey;

    fn test_policy() -> FinalizerPolicy {
        let finalizers = (0..4u8)
            .map(|i| FinalizerAuthority {
                description: format!("finalizer-{}", i),
                weight: u64::from(i) + 1,
                public_key: BlsPrivateKey::generate(&[i + 1; 32]).unwrap().public_key(),
            })
            .collect();
        FinalizerPolicy::new(3, 6, finalizers).unwrap()
    }

    #[test]
    fn test_finalizer_set_round_trip() {
        let policy = test_policy();
        let wire = encode_finalizer_set_extension(&policy);
        let back = decode_finalizer_set_extension(&wire).unwrap();
        assert_eq!(policy, back);
    }

    #[test]
    fn test_finalizer_set_rejects_truncation() {
        let wire = encode_finalizer_set_extension(&test_policy());
        for cut in [0, 3, 12, wire.len() - 1] {
            assert!(decode_finalizer_set_extension(&wire[..cut]).is_err(), "cut {}", cut);
        }
    }

    #[test]
    fn test_finalizer_set_rejects_bad_threshold_on_the_wire() {
        let policy = test_policy();
        let mut wire = encode_finalizer_set_extension(&policy);
        // threshold sits after the 4-byte version; total weight is 10
        wire[4..12].copy_from_slice(&2u64.to_le_bytes());
        assert!(matches!(
            decode_finalizer_set_extension(&wire),
            Err(WireError::InvalidPolicy { .. })
        ));
    }

    #[test]
    fn test_instant_finality_round_trip_minimal() {
        let ext = InstantFinalityExtension {
            qc_claim: QcClaim { height: (90u64 << 32) | 1, strong: true },
            new_finalizer_policy: None,
            new_proposer_policy: None,
        };
        let wire = encode_instant_finality_extension(&ext);
        assert_eq!(wire.len(), 8 + 1 + 1 + 1);
        assert_eq!(decode_instant_finality_extension(&wire).unwrap(), ext);
    }

    #[test]
    fn test_instant_finality_round_trip_full() {
        let ext = InstantFinalityExtension {
            qc_claim: QcClaim { height: 17, strong: false },
            new_finalizer_policy: Some(test_policy()),
            new_proposer_policy: Some(ProposerPolicy {
                schema_version: ProposerPolicy::CURRENT_SCHEMA_VERSION,
                active_slot: 1_234_567,
                producers: vec!["alpha".into(), "bravo".into(), "charlie".into()],
            }),
        };
        let wire = encode_instant_finality_extension(&ext);
        assert_eq!(decode_instant_finality_extension(&wire).unwrap(), ext);
    }

    #[test]
    fn test_proposal_info_round_trip() {
        let info = ProposalInfo { last_qc_block_height: 90, is_last_qc_strong: true };
        let wire = encode_proposal_info_extension(&info);
        assert_eq!(wire, [90, 0, 0, 0, 1]);
        assert_eq!(decode_proposal_info_extension(&wire).unwrap(), info);

        // Presence flags are strict booleans
        let mut bad = wire;
        bad[4] = 7;
        assert!(decode_proposal_info_extension(&bad).is_err());
    }

    #[test]
    fn test_duplicate_extension_ids_rejected() {
        assert!(validate_unique_extensions([2u16, 3]).is_ok());
        assert!(matches!(
            validate_unique_extensions([2u16, 3, 2]),
            Err(WireError::DuplicateExtension { id: 2 })
        ));
    }

    #[test]
    fn test_header_extensions_typed_accessors() {
        let policy = test_policy();
        let info = ProposalInfo { last_qc_block_height: 12, is_last_qc_strong: true };
        let header = HeaderExtensions::from_entries(vec![
            (FINALIZER_SET_EXTENSION_ID, encode_finalizer_set_extension(&policy)),
            (PROPOSAL_INFO_EXTENSION_ID, encode_proposal_info_extension(&info)),
            (9, vec![1, 2, 3]), // unknown id rides along untouched
        ])
        .unwrap();

        assert_eq!(
            header.finalizer_set(ExtensionEra::Transition).unwrap().unwrap(),
            policy
        );
        assert_eq!(header.proposal_info().unwrap().unwrap(), info);
        // The same id-2 bytes are not an instant-finality extension
        assert!(header.instant_finality(ExtensionEra::Transition).is_none());

        // Post-transition, id 2 decodes as the instant-finality extension
        let ext = InstantFinalityExtension {
            qc_claim: QcClaim { height: 5, strong: true },
            new_finalizer_policy: None,
            new_proposer_policy: None,
        };
        let header = HeaderExtensions::from_entries(vec![(
            INSTANT_FINALITY_EXTENSION_ID,
            encode_instant_finality_extension(&ext),
        )])
        .unwrap();
        assert_eq!(
            header.instant_finality(ExtensionEra::InstantFinality).unwrap().unwrap(),
            ext
        );
        assert!(header.finalizer_set(ExtensionEra::InstantFinality).is_none());
        assert!(header.proposal_info().is_none());
    }

    #[test]
    fn test_header_extensions_reject_duplicates() {
        let info = encode_proposal_info_extension(&ProposalInfo::default());
        assert!(matches!(
            HeaderExtensions::from_entries(vec![
                (PROPOSAL_INFO_EXTENSION_ID, info.clone()),
                (PROPOSAL_INFO_EXTENSION_ID, info),
            ]),
            Err(WireError::DuplicateExtension { id: 3 })
        ));
    }
}
