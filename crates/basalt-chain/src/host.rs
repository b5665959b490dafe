use crate::messages::{ConnectionId, NewViewMessage, ProposalMessage, VoteMessage};
use crate::schedule::{BlockTimestamp, ProducerSchedule};
use basalt_core::crypto::Digest;

/// Everything the pacemaker needs to know about the block at the head of
/// the chain.
#[derive(Clone, Debug)]
pub struct HeadBlock {
    pub id: Digest,
    pub num: u64,
    pub timestamp: BlockTimestamp,
    /// Root over the block's action digests, part of the proposal id.
    pub action_mroot: Digest,
    pub schedule: ProducerSchedule,
}

/// The host node's side of the bargain.
///
/// The consensus core owns no sockets and no block production: the embedding
/// node supplies the chain head and relays outbound messages over its P2P
/// layer. The `commit_*` calls are invoked only after the consensus mutex
/// has been released and must not call back into the pacemaker
/// synchronously.
pub trait HostNode: Send + Sync + 'static {
    fn head_block(&self) -> HeadBlock;

    /// Relay a proposal to all peers, except the optional originator.
    fn commit_hs_proposal(&self, msg: ProposalMessage, exclude: Option<ConnectionId>);

    /// Relay a vote toward the proposal's leader.
    fn commit_hs_vote(&self, msg: VoteMessage, exclude: Option<ConnectionId>);

    /// Relay a view change to all peers.
    fn commit_hs_new_view(&self, msg: NewViewMessage, exclude: Option<ConnectionId>);

    /// A peer sent something malformed or mis-signed. The host may score or
    /// disconnect it.
    fn warn_peer(&self, connection: ConnectionId, reason: &str);
}
