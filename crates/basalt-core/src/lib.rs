//! # Basalt Core
//!
//! Pure Rust instant-finality core.
//!
//! This crate contains **no networking code** and **no host-node
//! dependencies**. It is the deterministic heart of the finality protocol:
//! every digest, Merkle root and quorum certificate passes through the code
//! here before anything is trusted.
//!
//! ## What lives here
//!
//! - **Digest primitives** (`crypto::digest`): SHA-256 digests, the
//!   `hash_combine` pair hash, and the legacy left/right position tags.
//! - **BLS aggregation** (`crypto::bls`): BLS12-381 keys and signatures in
//!   their canonical 96/192-byte affine little-endian form, aggregation and
//!   verification. One aggregate verification per quorum certificate, never
//!   per-signer pairings.
//! - **Merkle computations** (`merkle`): the log-space incremental
//!   accumulator, the batch root it must always agree with, and the legacy
//!   pre-transition scheme.
//! - **Finality types** (`finality`): finalizer policies with weighted
//!   thresholds, vote bitsets, and quorum-certificate aggregation.
//! - **Wire formats** (`wire`): hand-written, bit-exact codecs for the
//!   on-wire QC and the block-header extensions.
//!
//! The consensus state machine that consumes all of this lives in
//! `basalt-chain`.

pub mod crypto;
pub mod finality;
pub mod merkle;
pub mod wire;

// Re-export commonly used types for convenience
pub use crypto::{
    aggregate_public_keys, aggregate_signatures, hash_combine, verify, BlsError, BlsPrivateKey,
    BlsPublicKey, BlsSignature, Digest,
};
pub use finality::{
    FinalizerAuthority, FinalizerBitset, FinalizerPolicy, PendingQuorumCertificate, PolicyError,
    QcError, QuorumCertificate, VoteStatus,
};
pub use merkle::{calculate_merkle, calculate_merkle_legacy, IncrementalMerkle};
pub use wire::{
    ExtensionEra, HeaderExtensions, InstantFinalityExtension, ProposalInfo, ProposerPolicy,
    QcClaim, WireError,
};
