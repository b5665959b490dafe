use basalt_core::crypto::{BlsPublicKey, BlsSignature, Digest};
use basalt_core::finality::QuorumCertificate;

/// Identifier of the peer connection a message arrived on. `None` means the
/// message originated locally (a beat, a timer).
pub type ConnectionId = u32;

/// The three consensus message kinds, dispatched by the pacemaker under the
/// consensus mutex.
#[derive(Clone, Debug)]
pub enum HotstuffMessage {
    Proposal(ProposalMessage),
    Vote(VoteMessage),
    NewView(NewViewMessage),
}

impl HotstuffMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            HotstuffMessage::Proposal(_) => "proposal",
            HotstuffMessage::Vote(_) => "vote",
            HotstuffMessage::NewView(_) => "new_view",
        }
    }
}

/// A leader's proposal: a block position plus the QC justifying it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProposalMessage {
    /// Collision-resistant digest over the block header, the Merkle
    /// commitments and the justify id; see [`ProposalMessage::compute_id`].
    pub proposal_id: Digest,
    pub block_num: u64,
    /// Orders multiple proposals within one block; the pair
    /// `(block_num, phase_counter)` is the proposal height.
    pub phase_counter: u8,
    /// Id of the proposal this one extends; the zero digest for a root
    /// proposal.
    pub parent_id: Digest,
    /// The highest QC the proposer had; `None` only for the genesis
    /// proposal.
    pub justify: Option<QuorumCertificate>,
}

impl ProposalMessage {
    /// Height used by the safety rules and the commit rule. Block numbers
    /// are 32-bit on the wire; the phase counter occupies the low bits so
    /// that later phases of one block rank above earlier ones.
    pub fn height(&self) -> u64 {
        compute_height(self.block_num, self.phase_counter)
    }

    /// Id of the proposal the justify QC points at, if any.
    pub fn justify_id(&self) -> Option<Digest> {
        self.justify.as_ref().map(|qc| qc.proposal_id)
    }

    /// Derive the proposal id from everything a proposal commits to.
    pub fn compute_id(
        block_id: Digest,
        action_mroot: Digest,
        parent_id: Digest,
        block_num: u64,
        phase_counter: u8,
        justify_id: Option<Digest>,
    ) -> Digest {
        let mut data = Vec::with_capacity(32 * 4 + 9);
        data.extend_from_slice(block_id.as_bytes());
        data.extend_from_slice(action_mroot.as_bytes());
        data.extend_from_slice(parent_id.as_bytes());
        data.extend_from_slice(&block_num.to_le_bytes());
        data.push(phase_counter);
        data.extend_from_slice(justify_id.unwrap_or(Digest::ZERO).as_bytes());
        Digest::hash(&data)
    }
}

/// Pack a block number and phase counter into one orderable height.
pub fn compute_height(block_num: u64, phase_counter: u8) -> u64 {
    ((block_num & u64::from(u32::MAX)) << 32) | u64::from(phase_counter)
}

/// A finalizer's signed vote on one proposal id, returned to the proposal's
/// leader for aggregation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VoteMessage {
    pub proposal_id: Digest,
    /// Strong votes commit to the proposal's branch; weak votes only attest
    /// liveness.
    pub strong: bool,
    pub finalizer_key: BlsPublicKey,
    pub signature: BlsSignature,
}

/// A stalled replica's view change: carries the highest QC it knows so the
/// next leader can catch up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewViewMessage {
    pub high_qc: Option<QuorumCertificate>,
}
