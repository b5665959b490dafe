//! Finalizer policies, vote bitsets and quorum certificates.

pub mod bitset;
pub mod policy;
pub mod qc;

pub use bitset::FinalizerBitset;
pub use policy::{FinalizerAuthority, FinalizerPolicy, PolicyError};
pub use qc::{verify_batch, PendingQuorumCertificate, QcError, QuorumCertificate, VoteStatus};
