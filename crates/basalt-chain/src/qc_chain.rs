use crate::fork_store::{ForkStore, ForkStoreError};
use crate::messages::{ConnectionId, NewViewMessage, ProposalMessage, VoteMessage};
use crate::safety::{SafetyError, SafetyState};
use basalt_core::crypto::{BlsPrivateKey, Digest};
use basalt_core::finality::{FinalizerPolicy, PendingQuorumCertificate, QuorumCertificate, VoteStatus};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Errors that escalate out of the consensus state machine. Everything
/// recoverable (malformed messages, unknown antecedents, full stores) is
/// handled in place; what reaches the caller is fatal for the consensus
/// thread.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("Safety persistence failed: {0}")]
    Persistence(#[from] SafetyError),

    #[error("Safety rule violation: {reason}")]
    SafetyViolation { reason: String },
}

/// An outbound action queued by the state machine while the consensus mutex
/// is held. The pacemaker drains the queue and fans out only after the
/// mutex is released.
#[derive(Clone, Debug)]
pub enum Outbound {
    Proposal { msg: ProposalMessage, exclude: Option<ConnectionId> },
    Vote { msg: VoteMessage, exclude: Option<ConnectionId> },
    NewView { msg: NewViewMessage, exclude: Option<ConnectionId> },
    WarnPeer { connection: ConnectionId, reason: String },
}

/// What the pacemaker hands to [`QcChain::on_beat`] about the block being
/// produced: its header id, number and action Merkle root, which together
/// pin the proposal id.
#[derive(Clone, Copy, Debug)]
pub struct BlockContext {
    pub block_id: Digest,
    pub block_num: u64,
    pub action_mroot: Digest,
}

pub struct QcChainConfig {
    /// Replica name, used as a field on every consensus event.
    pub replica: String,
    /// BLS keys this node votes with. Empty for a pure observer.
    pub finalizer_keys: Vec<BlsPrivateKey>,
    /// Maximum proposals held in the fork store before aggressive pruning.
    pub fork_store_capacity: usize,
    /// How long an out-of-order proposal may wait for its antecedents.
    pub orphan_ttl_ms: u64,
    /// Bound on buffered out-of-order proposals.
    pub orphan_capacity: usize,
}

impl Default for QcChainConfig {
    fn default() -> Self {
        Self {
            replica: String::from("replica"),
            finalizer_keys: Vec::new(),
            fork_store_capacity: 4096,
            orphan_ttl_ms: 5_000,
            orphan_capacity: 128,
        }
    }
}

/// Milliseconds clock, injectable so tests control time.
pub type Clock = Box<dyn Fn() -> u64 + Send>;

fn system_clock() -> Clock {
    Box::new(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    })
}

struct Orphan {
    expires_at_ms: u64,
    source: Option<ConnectionId>,
    proposal: ProposalMessage,
}

/// The HotStuff-style consensus state machine.
///
/// Owns the fork store and the safety state; the pacemaker serializes every
/// entry point under a single mutex, so nothing in here locks. Handlers
/// never send directly: they queue [`Outbound`] actions for the pacemaker
/// to dispatch after unlock.
///
/// The three chain pointers:
/// - `b_leaf`: highest proposal observed, what the next proposal extends;
/// - `b_lock`: the ancestor a correct finalizer will not vote against;
/// - `b_exec`: the last finalized proposal, tip of the irreversible chain.
pub struct QcChain {
    config: QcChainConfig,
    policy: Arc<FinalizerPolicy>,
    fork: ForkStore,
    safety: SafetyState,
    clock: Clock,

    b_leaf: Digest,
    b_lock: Digest,
    b_exec: Digest,
    high_qc: Option<QuorumCertificate>,

    /// Vote collectors for proposals this node produced, by proposal id.
    pending: HashMap<Digest, PendingQuorumCertificate>,
    /// Out-of-order proposals waiting for their parent or justify target.
    orphans: VecDeque<Orphan>,
    /// Last (block id, phase) proposed, to advance the phase counter when
    /// several beats land on one block.
    last_proposed: Option<(Digest, u8)>,

    outbound: Vec<Outbound>,
    progress: bool,
}

impl QcChain {
    pub fn new(config: QcChainConfig, policy: Arc<FinalizerPolicy>, safety: SafetyState) -> Self {
        Self::with_clock(config, policy, safety, system_clock())
    }

    pub fn with_clock(
        config: QcChainConfig,
        policy: Arc<FinalizerPolicy>,
        safety: SafetyState,
        clock: Clock,
    ) -> Self {
        let fork = ForkStore::new(config.fork_store_capacity);
        Self {
            config,
            policy,
            fork,
            safety,
            clock,
            b_leaf: Digest::ZERO,
            b_lock: Digest::ZERO,
            b_exec: Digest::ZERO,
            high_qc: None,
            pending: HashMap::new(),
            orphans: VecDeque::new(),
            last_proposed: None,
            outbound: Vec::new(),
            progress: false,
        }
    }

    pub fn replica(&self) -> &str {
        &self.config.replica
    }

    pub fn policy(&self) -> &Arc<FinalizerPolicy> {
        &self.policy
    }

    pub fn b_leaf(&self) -> Digest {
        self.b_leaf
    }

    pub fn b_lock(&self) -> Digest {
        self.b_lock
    }

    pub fn b_exec(&self) -> Digest {
        self.b_exec
    }

    pub fn high_qc(&self) -> Option<&QuorumCertificate> {
        self.high_qc.as_ref()
    }

    pub fn fork_store(&self) -> &ForkStore {
        &self.fork
    }

    /// Drain the queued outbound actions. Called by the pacemaker right
    /// before releasing the consensus mutex.
    pub fn take_outbound(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbound)
    }

    /// Whether the chain advanced (adopted a higher QC or finalized) since
    /// the last call. Drives view-timer resets.
    pub fn take_progress(&mut self) -> bool {
        std::mem::take(&mut self.progress)
    }

    fn now_ms(&self) -> u64 {
        (self.clock)()
    }

    fn warn_peer(&mut self, source: Option<ConnectionId>, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(replica = %self.config.replica, %reason, "discarding message");
        if let Some(connection) = source {
            self.outbound.push(Outbound::WarnPeer { connection, reason });
        }
    }

    fn height_or_zero(&self, id: &Digest) -> u64 {
        if id.is_zero() {
            0
        } else {
            self.fork.height_of(id).unwrap_or(0)
        }
    }

    // ---- proposal handling -------------------------------------------------

    /// Handle an inbound proposal: validate its justify, store it, vote if
    /// the safety rules allow, and re-evaluate the commit rule. Buffered
    /// orphans whose antecedents arrive are replayed in the same call.
    pub fn on_proposal(
        &mut self,
        source: Option<ConnectionId>,
        msg: ProposalMessage,
    ) -> Result<(), ChainError> {
        let mut queue = VecDeque::from([(source, msg)]);
        while let Some((src, proposal)) = queue.pop_front() {
            self.process_proposal(src, proposal)?;
            self.drain_ready_orphans(&mut queue);
        }
        Ok(())
    }

    fn process_proposal(
        &mut self,
        source: Option<ConnectionId>,
        msg: ProposalMessage,
    ) -> Result<(), ChainError> {
        let id = msg.proposal_id;
        if self.fork.contains(&id) {
            trace!(replica = %self.config.replica, proposal = %id, "duplicate proposal");
            return Ok(());
        }

        // 1. The embedded QC must verify against the current policy before
        //    anything else is believed about this proposal.
        if let Some(qc) = &msg.justify {
            if !qc.verify(&self.policy) {
                self.warn_peer(source, format!("proposal {} carries an invalid QC", id));
                return Ok(());
            }
        }

        // 2. The parent (and the justify target) must be known, unless this
        //    is a root proposal. Out-of-order arrivals wait in the orphan
        //    buffer for their antecedents.
        let parent_known = msg.parent_id.is_zero() || self.fork.contains(&msg.parent_id);
        let justify_known = msg
            .justify_id()
            .map_or(true, |jid| self.fork.contains(&jid));
        if !parent_known || !justify_known {
            self.buffer_orphan(source, msg);
            return Ok(());
        }

        // 3. Heights must grow along parent links.
        if !msg.parent_id.is_zero() && self.height_or_zero(&msg.parent_id) >= msg.height() {
            self.warn_peer(source, format!("proposal {} does not outrank its parent", id));
            return Ok(());
        }

        // 4. Insert, pruning under capacity pressure.
        let justify = msg.justify.clone();
        let height = msg.height();
        if let Err(ForkStoreError::Full { capacity }) = self.fork.insert(msg.clone()) {
            let protected = self.protected_ids();
            let evicted = self.fork.prune_aggressively(&protected);
            debug!(replica = %self.config.replica, capacity, evicted, "fork store full, pruned");
            if self.fork.insert(msg.clone()).is_err() {
                self.warn_peer(source, format!("fork store full, dropping proposal {}", id));
                return Ok(());
            }
        }
        trace!(replica = %self.config.replica, proposal = %id, height, "stored proposal");

        if height > self.height_or_zero(&self.b_leaf) {
            self.b_leaf = id;
        }

        // 5. The justify QC is new information: adopt it and re-run the
        //    commit rule before deciding whether to vote.
        if let Some(qc) = justify {
            self.on_new_qc(qc)?;
        }

        // 6. Vote if the safety rules allow.
        self.maybe_vote(&msg)?;
        Ok(())
    }

    fn buffer_orphan(&mut self, source: Option<ConnectionId>, proposal: ProposalMessage) {
        if self.orphans.len() >= self.config.orphan_capacity {
            self.orphans.pop_front();
        }
        trace!(
            replica = %self.config.replica,
            proposal = %proposal.proposal_id,
            parent = %proposal.parent_id,
            "buffering proposal until its antecedents arrive"
        );
        self.orphans.push_back(Orphan {
            expires_at_ms: self.now_ms() + self.config.orphan_ttl_ms,
            source,
            proposal,
        });
    }

    fn drain_ready_orphans(&mut self, queue: &mut VecDeque<(Option<ConnectionId>, ProposalMessage)>) {
        let now = self.now_ms();
        let mut waiting = VecDeque::new();
        while let Some(orphan) = self.orphans.pop_front() {
            let parent_known = orphan.proposal.parent_id.is_zero()
                || self.fork.contains(&orphan.proposal.parent_id);
            let justify_known = orphan
                .proposal
                .justify_id()
                .map_or(true, |jid| self.fork.contains(&jid));
            if parent_known && justify_known {
                queue.push_back((orphan.source, orphan.proposal));
            } else if orphan.expires_at_ms > now {
                waiting.push_back(orphan);
            } else {
                trace!(
                    replica = %self.config.replica,
                    proposal = %orphan.proposal.proposal_id,
                    "expiring orphaned proposal"
                );
            }
        }
        self.orphans = waiting;
    }

    /// Decide a vote on `proposal` for one finalizer: `None` to abstain,
    /// otherwise whether the vote is strong.
    ///
    /// Three checks:
    /// - vote monotonicity: never at or below the persisted `v_height`;
    /// - liveness rule: the justify must not be older than the lock;
    /// - safety: a strong vote requires the justify to extend `b_lock`;
    ///   otherwise the vote degrades to weak.
    fn vote_decision(&self, proposal: &ProposalMessage, v_height: u64) -> Option<bool> {
        let height = proposal.height();
        if height <= v_height {
            return None;
        }

        let lock_height = self.height_or_zero(&self.b_lock);
        let justify_height = match proposal.justify_id() {
            None => 0,
            Some(jid) => match self.fork.height_of(&jid) {
                Some(h) => h,
                // Unresolvable justify: cannot evaluate the rules, abstain
                None => return None,
            },
        };
        if justify_height < lock_height {
            return None;
        }

        let extends = match proposal.justify_id() {
            None => self.b_lock.is_zero(),
            Some(jid) => self.b_lock.is_zero() || self.fork.is_descendant(jid, self.b_lock),
        };
        Some(extends)
    }

    fn maybe_vote(&mut self, proposal: &ProposalMessage) -> Result<(), ChainError> {
        if self.config.finalizer_keys.is_empty() {
            return Ok(());
        }

        let generation = self.policy.generation();
        let mut votes = Vec::new();
        for key in &self.config.finalizer_keys {
            let public_key = key.public_key();
            if !self.policy.contains(&public_key) {
                continue;
            }
            let record = self.safety.record(generation, &public_key);
            let Some(strong) = self.vote_decision(proposal, record.v_height) else {
                debug!(
                    replica = %self.config.replica,
                    proposal = %proposal.proposal_id,
                    v_height = record.v_height,
                    "abstaining"
                );
                continue;
            };
            votes.push(VoteMessage {
                proposal_id: proposal.proposal_id,
                strong,
                finalizer_key: public_key,
                signature: key.sign(proposal.proposal_id.as_bytes()),
            });
        }
        if votes.is_empty() {
            return Ok(());
        }

        // The safety state must be durable before any of these votes can
        // leave the process. One flush covers all local keys.
        for vote in &votes {
            self.safety
                .note_vote(generation, &vote.finalizer_key, proposal.height());
        }
        self.safety.flush()?;

        for vote in votes {
            debug!(
                replica = %self.config.replica,
                proposal = %vote.proposal_id,
                strong = vote.strong,
                "voting"
            );
            // A leader collecting votes for this proposal counts its own
            // immediately; the broadcast copy it receives back deduplicates.
            self.absorb_own_vote(&vote)?;
            self.outbound.push(Outbound::Vote { msg: vote, exclude: None });
        }
        Ok(())
    }

    fn absorb_own_vote(&mut self, vote: &VoteMessage) -> Result<(), ChainError> {
        let Some(index) = self.policy.finalizer_index(&vote.finalizer_key) else {
            return Ok(());
        };
        let freshly_formed = match self.pending.get_mut(&vote.proposal_id) {
            None => return Ok(()),
            Some(pending) => {
                let was_quorum = pending.is_quorum(true);
                let status = pending.add_vote(vote.strong, index, &vote.finalizer_key, &vote.signature);
                (status == VoteStatus::Added && !was_quorum && pending.is_quorum(true))
                    .then(|| pending.finalize().expect("strong quorum was just observed"))
            }
        };
        if let Some(qc) = freshly_formed {
            self.publish_qc(qc)?;
        }
        Ok(())
    }

    // ---- vote handling -----------------------------------------------------

    /// Handle an inbound vote. Only meaningful on the leader that produced
    /// the target proposal; everyone else drops it silently.
    pub fn on_vote(&mut self, source: Option<ConnectionId>, vote: VoteMessage) -> Result<(), ChainError> {
        let Some(index) = self.policy.finalizer_index(&vote.finalizer_key) else {
            self.warn_peer(source, format!("vote from unknown finalizer on {}", vote.proposal_id));
            return Ok(());
        };
        let Some(pending) = self.pending.get_mut(&vote.proposal_id) else {
            trace!(
                replica = %self.config.replica,
                proposal = %vote.proposal_id,
                "vote for a proposal we did not produce"
            );
            return Ok(());
        };

        let was_quorum = pending.is_quorum(true);
        match pending.add_vote(vote.strong, index, &vote.finalizer_key, &vote.signature) {
            VoteStatus::Added => {
                trace!(
                    replica = %self.config.replica,
                    proposal = %vote.proposal_id,
                    strong_weight = pending.strong_weight(),
                    "vote recorded"
                );
                if pending.is_quorum(true) {
                    let qc = pending
                        .finalize()
                        .expect("strong quorum was just observed");
                    if was_quorum {
                        // Already announced; late votes only upgrade the
                        // stored certificate's weight.
                        self.fork.set_qc(qc, &self.policy);
                    } else {
                        self.publish_qc(qc)?;
                    }
                }
            }
            VoteStatus::Duplicate => {}
            VoteStatus::UnknownFinalizer => {
                self.warn_peer(source, format!("vote key mismatch on {}", vote.proposal_id));
            }
            VoteStatus::BadSignature => {
                self.warn_peer(source, format!("bad vote signature on {}", vote.proposal_id));
            }
        }
        Ok(())
    }

    fn publish_qc(&mut self, qc: QuorumCertificate) -> Result<(), ChainError> {
        info!(
            replica = %self.config.replica,
            proposal = %qc.proposal_id,
            signers = qc.active_finalizers.count(),
            "quorum reached"
        );
        self.on_new_qc(qc)?;
        // Disseminate the fresh certificate: followers (and whoever leads
        // next) adopt it from the new-view before the next proposal lands.
        let msg = self.new_view_message();
        self.outbound.push(Outbound::NewView { msg, exclude: None });
        Ok(())
    }

    // ---- new-view handling -------------------------------------------------

    /// Handle a view change: adopt the carried QC when its target outranks
    /// our leaf. Timer resets are the pacemaker's business, signalled via
    /// the progress flag.
    pub fn on_new_view(
        &mut self,
        source: Option<ConnectionId>,
        msg: NewViewMessage,
    ) -> Result<(), ChainError> {
        let Some(qc) = msg.high_qc else {
            return Ok(());
        };
        if !qc.verify(&self.policy) {
            self.warn_peer(source, format!("new-view carries an invalid QC for {}", qc.proposal_id));
            return Ok(());
        }
        if !self.fork.contains(&qc.proposal_id) {
            trace!(
                replica = %self.config.replica,
                proposal = %qc.proposal_id,
                "new-view QC targets an unknown proposal"
            );
            return Ok(());
        }
        // Adoption is monotone by target height; anything older at most
        // upgrades the stored certificate's weight.
        self.on_new_qc(qc)
    }

    // ---- block production --------------------------------------------------

    /// Produce one proposal for the block being built. The pacemaker calls
    /// this only when this node is the scheduled leader; at most one
    /// proposal comes out per call.
    pub fn on_beat(&mut self, ctx: BlockContext) -> Result<Digest, ChainError> {
        let phase_counter = match &self.last_proposed {
            Some((block_id, phase)) if *block_id == ctx.block_id => phase.wrapping_add(1),
            _ => 0,
        };
        let parent_id = self.b_leaf;
        let justify = self.high_qc.clone();
        let proposal_id = ProposalMessage::compute_id(
            ctx.block_id,
            ctx.action_mroot,
            parent_id,
            ctx.block_num,
            phase_counter,
            justify.as_ref().map(|qc| qc.proposal_id),
        );
        let msg = ProposalMessage {
            proposal_id,
            block_num: ctx.block_num,
            phase_counter,
            parent_id,
            justify,
        };

        info!(
            replica = %self.config.replica,
            proposal = %proposal_id,
            block_num = ctx.block_num,
            phase = phase_counter,
            "proposing"
        );
        self.last_proposed = Some((ctx.block_id, phase_counter));
        self.pending
            .insert(proposal_id, PendingQuorumCertificate::new(proposal_id, self.policy.clone()));
        self.outbound.push(Outbound::Proposal { msg: msg.clone(), exclude: None });

        // Run our own proposal through the normal path: store it, move the
        // leaf, and cast our own votes into the fresh collector.
        self.process_proposal(None, msg)?;
        Ok(proposal_id)
    }

    /// Build the view-change message for a stalled view.
    pub fn new_view_message(&self) -> NewViewMessage {
        NewViewMessage { high_qc: self.high_qc.clone() }
    }

    // ---- QC adoption and the commit rule ----------------------------------

    /// Fold a QC into chain state: attach it to its proposal, adopt it as
    /// the high QC if its target outranks the current one, then re-evaluate
    /// the two-chain lock and three-chain commit. QCs for pruned proposals
    /// are dropped without effect.
    fn on_new_qc(&mut self, qc: QuorumCertificate) -> Result<(), ChainError> {
        let target_id = qc.proposal_id;
        let Some(target_height) = self.fork.height_of(&target_id) else {
            trace!(replica = %self.config.replica, proposal = %target_id, "QC for unknown or pruned proposal");
            return Ok(());
        };
        self.fork.set_qc(qc.clone(), &self.policy);

        let current = match &self.high_qc {
            None => 0,
            Some(qc) => self.height_or_zero(&qc.proposal_id),
        };
        if target_height > current || self.high_qc.is_none() {
            trace!(replica = %self.config.replica, proposal = %target_id, height = target_height, "adopted high QC");
            self.high_qc = Some(qc);
            self.progress = true;
        }

        self.evaluate_commit_rule(target_id)
    }

    /// The two-chain lock and three-chain commit, evaluated at a proposal
    /// `b` that just received a QC.
    ///
    /// Walking justify links: `b -> b1 -> b2 -> b3`. Every link must also be
    /// a direct parent link; the first break stops the walk. Two links move
    /// the lock to `b2`; three links finalize `b3`.
    fn evaluate_commit_rule(&mut self, b: Digest) -> Result<(), ChainError> {
        let Some((b1, parent_ok)) = self.justify_step(&b) else {
            return Ok(());
        };
        if !parent_ok {
            return Ok(());
        }

        let Some((b2, parent_ok)) = self.justify_step(&b1) else {
            return Ok(());
        };
        if !parent_ok {
            return Ok(());
        }

        // Two-chain: lock on b2, monotonically by height.
        if self.height_or_zero(&b2) > self.height_or_zero(&self.b_lock) {
            debug!(replica = %self.config.replica, proposal = %b2, "locking");
            self.b_lock = b2;
            let generation = self.policy.generation();
            let keys: Vec<_> = self.config.finalizer_keys.iter().map(|k| k.public_key()).collect();
            for key in keys {
                if self.policy.contains(&key) {
                    self.safety.set_lock(generation, &key, b2);
                }
            }
            self.safety.flush()?;
        }

        let Some((b3, parent_ok)) = self.justify_step(&b2) else {
            return Ok(());
        };
        if !parent_ok {
            return Ok(());
        }

        // Three-chain: b3 is final.
        if self.height_or_zero(&b3) > self.height_or_zero(&self.b_exec) {
            self.commit(b3)?;
        }
        Ok(())
    }

    /// Follow one justify link from `id`. Returns the justify target and
    /// whether it is also the direct parent; `None` when there is no
    /// resolvable justify.
    fn justify_step(&self, id: &Digest) -> Option<(Digest, bool)> {
        let node = self.fork.get(id)?;
        let target = node.justify_id()?;
        if !self.fork.contains(&target) {
            return None;
        }
        Some((target, target == node.parent_id))
    }

    fn commit(&mut self, b_exec: Digest) -> Result<(), ChainError> {
        let node = self
            .fork
            .get(&b_exec)
            .cloned()
            .ok_or_else(|| ChainError::SafetyViolation {
                reason: format!("commit target {} vanished from the fork store", b_exec),
            })?;
        info!(
            replica = %self.config.replica,
            proposal = %b_exec,
            block_num = node.block_num,
            "finalized"
        );
        self.b_exec = b_exec;
        self.progress = true;

        let evicted = self.fork.prune_to(b_exec);
        if evicted > 0 {
            debug!(replica = %self.config.replica, evicted, "pruned dead forks");
        }

        // Pointers into evicted forks are stale now; fall back to the
        // commit target, the highest surviving QC target will re-raise them.
        if !self.fork.contains(&self.b_leaf) {
            self.b_leaf = b_exec;
        }
        if !self.b_lock.is_zero() && !self.fork.contains(&self.b_lock) {
            self.b_lock = b_exec;
        }
        if let Some(qc) = &self.high_qc {
            if !self.fork.contains(&qc.proposal_id) {
                self.high_qc = None;
            }
        }
        self.pending.retain(|id, _| self.fork.contains(id));
        Ok(())
    }

    fn protected_ids(&self) -> Vec<Digest> {
        let mut ids = vec![self.b_leaf, self.b_lock, self.b_exec];
        if let Some(qc) = &self.high_qc {
            ids.push(qc.proposal_id);
        }
        ids.retain(|id| !id.is_zero());
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_finalizer_keys, test_policy};
    use basalt_core::finality::FinalizerBitset;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn proposal(tag: &str, block_num: u64, parent: Digest) -> ProposalMessage {
        ProposalMessage {
            proposal_id: Digest::hash(tag.as_bytes()),
            block_num,
            phase_counter: 0,
            parent_id: parent,
            justify: None,
        }
    }

    fn observer_with_clock(now: Arc<AtomicU64>) -> QcChain {
        let keys = test_finalizer_keys(1);
        let policy = test_policy(&keys, 1);
        let clock = Box::new(move || now.load(Ordering::Relaxed));
        QcChain::with_clock(
            QcChainConfig { replica: "unit".into(), ..Default::default() },
            policy,
            SafetyState::in_memory(),
            clock,
        )
    }

    #[test]
    fn test_orphans_expire_by_the_injected_clock() {
        let now = Arc::new(AtomicU64::new(0));
        let mut chain = observer_with_clock(now.clone());

        // Child arrives first and waits for its parent
        let parent = proposal("parent", 1, Digest::ZERO);
        let child = proposal("child", 2, parent.proposal_id);
        chain.on_proposal(Some(1), child).unwrap();
        assert_eq!(chain.fork_store().len(), 0);
        assert_eq!(chain.orphans.len(), 1);

        // Past the TTL the buffered proposal is dropped, not replayed
        now.store(chain.config.orphan_ttl_ms + 1, Ordering::Relaxed);
        chain.on_proposal(Some(1), proposal("unrelated", 1, Digest::ZERO)).unwrap();
        assert!(chain.orphans.is_empty());

        // The parent arriving now no longer resurrects the child
        chain.on_proposal(Some(1), parent).unwrap();
        assert_eq!(chain.fork_store().len(), 2);
    }

    #[test]
    fn test_orphan_replayed_when_parent_arrives_in_time() {
        let now = Arc::new(AtomicU64::new(0));
        let mut chain = observer_with_clock(now);

        let parent = proposal("parent", 1, Digest::ZERO);
        let child = proposal("child", 2, parent.proposal_id);
        chain.on_proposal(Some(1), child.clone()).unwrap();
        chain.on_proposal(Some(1), parent).unwrap();

        assert_eq!(chain.fork_store().len(), 2);
        assert!(chain.fork_store().contains(&child.proposal_id));
        assert_eq!(chain.b_leaf(), child.proposal_id);
    }

    #[test]
    fn test_proposal_with_invalid_qc_warns_the_peer() {
        let now = Arc::new(AtomicU64::new(0));
        let mut chain = observer_with_clock(now);

        let root = proposal("root", 1, Digest::ZERO);
        chain.on_proposal(Some(1), root.clone()).unwrap();

        // A justify QC whose aggregate was never signed by anyone
        let forged = QuorumCertificate {
            proposal_id: root.proposal_id,
            active_finalizers: {
                let mut bits = FinalizerBitset::with_len(1);
                bits.set(0);
                bits
            },
            active_agg_sig: test_finalizer_keys(1)[0].sign(b"something else entirely"),
        };
        let mut bad = proposal("bad", 2, root.proposal_id);
        bad.justify = Some(forged);

        chain.on_proposal(Some(9), bad.clone()).unwrap();
        assert!(!chain.fork_store().contains(&bad.proposal_id));
        let outbound = chain.take_outbound();
        assert!(outbound
            .iter()
            .any(|o| matches!(o, Outbound::WarnPeer { connection: 9, .. })));
    }

    #[test]
    fn test_proposal_must_outrank_its_parent() {
        let now = Arc::new(AtomicU64::new(0));
        let mut chain = observer_with_clock(now);

        let root = proposal("root", 5, Digest::ZERO);
        chain.on_proposal(Some(1), root.clone()).unwrap();

        // Same block number, same phase: not an extension
        let stunted = proposal("stunted", 5, root.proposal_id);
        chain.on_proposal(Some(3), stunted.clone()).unwrap();
        assert!(!chain.fork_store().contains(&stunted.proposal_id));
        assert!(chain
            .take_outbound()
            .iter()
            .any(|o| matches!(o, Outbound::WarnPeer { connection: 3, .. })));
    }
}
