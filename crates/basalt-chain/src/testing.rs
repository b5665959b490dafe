//! Deterministic multi-replica harness for consensus tests.
//!
//! No sockets, no timers, no threads: replicas are plain [`QcChain`]s, the
//! "network" is a message queue, and delivery happens only when a test calls
//! [`TestNetwork::propagate`]. Peer warnings are captured instead of acted
//! on, so tests can assert on them.

use crate::messages::{HotstuffMessage, NewViewMessage, ProposalMessage, VoteMessage};
use crate::qc_chain::{BlockContext, ChainError, Outbound, QcChain, QcChainConfig};
use crate::safety::SafetyState;
use basalt_core::crypto::{BlsPrivateKey, Digest};
use basalt_core::finality::{FinalizerAuthority, FinalizerPolicy};
use std::collections::VecDeque;
use std::sync::Arc;

/// Deterministic BLS keys for a test finalizer set.
pub fn test_finalizer_keys(count: usize) -> Vec<BlsPrivateKey> {
    (0..count)
        .map(|i| BlsPrivateKey::generate(&[i as u8 + 1; 32]).expect("static test ikm"))
        .collect()
}

/// An equal-weight policy over `keys` with the given threshold.
pub fn test_policy(keys: &[BlsPrivateKey], threshold: u64) -> Arc<FinalizerPolicy> {
    let finalizers = keys
        .iter()
        .enumerate()
        .map(|(i, key)| FinalizerAuthority {
            description: format!("finalizer-{}", i),
            weight: 1,
            public_key: key.public_key(),
        })
        .collect();
    Arc::new(FinalizerPolicy::new(1, threshold, finalizers).expect("valid test policy"))
}

/// A replica with one finalizer key, an in-memory safety state and a frozen
/// clock.
pub fn test_replica(name: &str, key: BlsPrivateKey, policy: Arc<FinalizerPolicy>) -> QcChain {
    let config = QcChainConfig {
        replica: name.to_string(),
        finalizer_keys: vec![key],
        ..QcChainConfig::default()
    };
    QcChain::with_clock(config, policy, SafetyState::in_memory(), Box::new(|| 0))
}

/// Block context for block `num`, derived deterministically from the
/// number.
pub fn test_block(num: u64) -> BlockContext {
    BlockContext {
        block_id: Digest::hash(format!("block-{}", num).as_bytes()),
        block_num: num,
        action_mroot: Digest::hash(format!("actions-{}", num).as_bytes()),
    }
}

struct QueuedMessage {
    origin: String,
    msg: HotstuffMessage,
}

/// A set of replicas joined by an in-memory broadcast queue.
#[derive(Default)]
pub struct TestNetwork {
    replicas: Vec<(String, QcChain)>,
    queue: VecDeque<QueuedMessage>,
    /// `(replica, reason)` for every peer warning any replica emitted.
    pub warnings: Vec<(String, String)>,
}

impl TestNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_replica(&mut self, chain: QcChain) {
        self.replicas.push((chain.replica().to_string(), chain));
    }

    pub fn chain(&self, name: &str) -> &QcChain {
        &self
            .replicas
            .iter()
            .find(|(n, _)| n == name)
            .unwrap_or_else(|| panic!("unknown replica {}", name))
            .1
    }

    pub fn chain_mut(&mut self, name: &str) -> &mut QcChain {
        &mut self
            .replicas
            .iter_mut()
            .find(|(n, _)| n == name)
            .unwrap_or_else(|| panic!("unknown replica {}", name))
            .1
    }

    /// Have `leader` produce a proposal for `ctx`. The proposal (and the
    /// leader's own vote) land in the queue; nothing is delivered yet.
    pub fn beat(&mut self, leader: &str, ctx: BlockContext) -> Result<Digest, ChainError> {
        let id = self.chain_mut(leader).on_beat(ctx)?;
        self.collect_outbound(leader);
        Ok(id)
    }

    /// Deliver queued messages to every replica but the originator until
    /// the network is quiet. Returns how many deliveries happened.
    pub fn propagate(&mut self) -> Result<usize, ChainError> {
        let mut delivered = 0;
        while let Some(QueuedMessage { origin, msg }) = self.queue.pop_front() {
            let names: Vec<String> = self
                .replicas
                .iter()
                .map(|(n, _)| n.clone())
                .filter(|n| *n != origin)
                .collect();
            for name in names {
                self.deliver_to(&name, msg.clone())?;
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    /// Deliver one message to one replica and collect whatever it emits.
    pub fn deliver_to(&mut self, name: &str, msg: HotstuffMessage) -> Result<(), ChainError> {
        {
            let chain = self.chain_mut(name);
            match msg {
                HotstuffMessage::Proposal(p) => chain.on_proposal(Some(0), p)?,
                HotstuffMessage::Vote(v) => chain.on_vote(Some(0), v)?,
                HotstuffMessage::NewView(nv) => chain.on_new_view(Some(0), nv)?,
            }
        }
        self.collect_outbound(name);
        Ok(())
    }

    /// Current queue length, for tests asserting on traffic.
    pub fn pending_messages(&self) -> usize {
        self.queue.len()
    }

    fn collect_outbound(&mut self, origin: &str) {
        let outbound: Vec<Outbound> = self.chain_mut(origin).take_outbound();
        for action in outbound {
            match action {
                Outbound::Proposal { msg, .. } => self.enqueue(origin, HotstuffMessage::Proposal(msg)),
                Outbound::Vote { msg, .. } => self.enqueue(origin, HotstuffMessage::Vote(msg)),
                Outbound::NewView { msg, .. } => self.enqueue(origin, HotstuffMessage::NewView(msg)),
                Outbound::WarnPeer { reason, .. } => {
                    self.warnings.push((origin.to_string(), reason));
                }
            }
        }
    }

    fn enqueue(&mut self, origin: &str, msg: HotstuffMessage) {
        self.queue.push_back(QueuedMessage { origin: origin.to_string(), msg });
    }
}

/// Convenience constructors for messages in reordering tests.
pub fn proposal_msg(p: ProposalMessage) -> HotstuffMessage {
    HotstuffMessage::Proposal(p)
}

pub fn vote_msg(v: VoteMessage) -> HotstuffMessage {
    HotstuffMessage::Vote(v)
}

pub fn new_view_msg(nv: NewViewMessage) -> HotstuffMessage {
    HotstuffMessage::NewView(nv)
}
