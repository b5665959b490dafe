//! # Basalt Chain
//!
//! The consensus state machine and liveness layer of basalt's instant
//! finality.
//!
//! `basalt-core` provides the deterministic material (digests, Merkle roots,
//! BLS quorum certificates); this crate turns it into a running protocol:
//!
//! - **Messages** (`messages`): the `Proposal` / `Vote` / `NewView` sum type
//!   dispatched under the consensus mutex.
//! - **Safety state** (`safety`): the per-finalizer `(v_height, b_lock)`
//!   variables, flushed atomically before any signed vote leaves the
//!   process.
//! - **Fork store** (`fork_store`): competing proposal branches, pruned as
//!   commits advance.
//! - **QC chain** (`qc_chain`): proposal/vote/new-view processing, the
//!   two-chain lock and the three-chain commit rule.
//! - **Pacemaker** (`pacemaker`): leader rotation from the producer
//!   schedule, the block-production beat, the view timer, and the snapshot
//!   the RPC layer reads without touching the consensus mutex.
//! - **Host interface** (`host`): the narrow contract with the embedding
//!   node: chain head in, outbound message relays and peer warnings out.
//!
//! ## Threading model
//!
//! A single mutex inside [`ChainPacemaker`] serializes every entry into the
//! state machine; outbound fan-out happens strictly after it is released.
//! The fork store and safety state have no locking of their own because
//! nothing else can reach them.

pub mod fork_store;
pub mod host;
pub mod messages;
pub mod pacemaker;
pub mod qc_chain;
pub mod safety;
pub mod schedule;
pub mod testing;

pub use fork_store::{ForkStore, ForkStoreError};
pub use host::{HeadBlock, HostNode};
pub use messages::{
    compute_height, ConnectionId, HotstuffMessage, NewViewMessage, ProposalMessage, VoteMessage,
};
pub use pacemaker::{ChainPacemaker, FinalizerStateSnapshot, PacemakerConfig};
pub use qc_chain::{BlockContext, ChainError, Outbound, QcChain, QcChainConfig};
pub use safety::{SafetyError, SafetyRecord, SafetyState};
pub use schedule::{BlockTimestamp, ProducerSchedule};
