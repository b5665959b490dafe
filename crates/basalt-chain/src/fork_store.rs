use crate::messages::ProposalMessage;
use basalt_core::crypto::Digest;
use basalt_core::finality::{FinalizerPolicy, QuorumCertificate};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForkStoreError {
    #[error("Fork store is full at {capacity} proposals")]
    Full { capacity: usize },
}

/// In-memory store of competing proposal branches.
///
/// Proposals are shared-immutable once inserted (`Arc`); cycles are
/// impossible because a parent link is a one-way digest. Besides the primary
/// id map the store keeps a height index (pruning walks it bottom-up) and a
/// children index (descendant checks, leaf detection). A proposal's QC slot
/// is written at most twice: once when the QC forms, and once more only for
/// an upgrade with strictly greater signer weight.
pub struct ForkStore {
    nodes: HashMap<Digest, Arc<ProposalMessage>>,
    by_height: BTreeMap<u64, Vec<Digest>>,
    children: HashMap<Digest, Vec<Digest>>,
    qcs: HashMap<Digest, QuorumCertificate>,
    capacity: usize,
}

impl ForkStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            nodes: HashMap::new(),
            by_height: BTreeMap::new(),
            children: HashMap::new(),
            qcs: HashMap::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &Digest) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn get(&self, id: &Digest) -> Option<&Arc<ProposalMessage>> {
        self.nodes.get(id)
    }

    pub fn height_of(&self, id: &Digest) -> Option<u64> {
        self.nodes.get(id).map(|n| n.height())
    }

    pub fn children_of(&self, id: &Digest) -> &[Digest] {
        self.children.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Insert a proposal. Idempotent: re-inserting a known id returns the
    /// stored node. Errors when the store is at capacity; the caller prunes
    /// and retries.
    pub fn insert(&mut self, proposal: ProposalMessage) -> Result<Arc<ProposalMessage>, ForkStoreError> {
        if let Some(existing) = self.nodes.get(&proposal.proposal_id) {
            return Ok(existing.clone());
        }
        if self.nodes.len() >= self.capacity {
            return Err(ForkStoreError::Full { capacity: self.capacity });
        }

        let node = Arc::new(proposal);
        self.by_height.entry(node.height()).or_default().push(node.proposal_id);
        if !node.parent_id.is_zero() {
            self.children.entry(node.parent_id).or_default().push(node.proposal_id);
        }
        self.nodes.insert(node.proposal_id, node.clone());
        Ok(node)
    }

    pub fn qc_of(&self, id: &Digest) -> Option<&QuorumCertificate> {
        self.qcs.get(id)
    }

    /// Attach a QC to its proposal. An existing QC is only replaced by one
    /// with strictly greater signer weight (the weak-to-strong upgrade);
    /// anything else leaves the slot untouched. Returns whether the slot
    /// changed.
    pub fn set_qc(&mut self, qc: QuorumCertificate, policy: &FinalizerPolicy) -> bool {
        if !self.nodes.contains_key(&qc.proposal_id) {
            return false;
        }
        match self.qcs.get(&qc.proposal_id) {
            None => {
                self.qcs.insert(qc.proposal_id, qc);
                true
            }
            Some(existing) => {
                if qc.signer_weight(policy) > existing.signer_weight(policy) {
                    self.qcs.insert(qc.proposal_id, qc);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Whether `id` equals `ancestor` or descends from it through parent
    /// links. An unknown link breaks the walk.
    pub fn is_descendant(&self, id: Digest, ancestor: Digest) -> bool {
        let mut cursor = id;
        loop {
            if cursor == ancestor {
                return true;
            }
            match self.nodes.get(&cursor) {
                Some(node) if !node.parent_id.is_zero() => cursor = node.parent_id,
                _ => return false,
            }
        }
    }

    /// Commit-time prune: after `exec_id` finalizes, every fork that does
    /// not descend from it is dead and gets evicted, descendants included.
    /// Ancestors of `exec_id` (finalized history) are kept; the lazy
    /// below-commit sweep and the capacity-pressure prune clear them later.
    /// Returns how many proposals were evicted.
    pub fn prune_to(&mut self, exec_id: Digest) -> usize {
        let Some(exec) = self.nodes.get(&exec_id).cloned() else {
            return 0;
        };

        let mut keep: HashSet<Digest> = HashSet::new();
        let mut frontier = VecDeque::from([exec_id]);
        while let Some(id) = frontier.pop_front() {
            if keep.insert(id) {
                frontier.extend(self.children_of(&id).iter().copied());
            }
        }
        let mut cursor = exec.parent_id;
        while !cursor.is_zero() {
            keep.insert(cursor);
            match self.nodes.get(&cursor) {
                Some(node) => cursor = node.parent_id,
                None => break,
            }
        }

        let doomed: Vec<Digest> =
            self.nodes.keys().filter(|id| !keep.contains(*id)).copied().collect();
        let evicted = doomed.len();
        for id in doomed {
            self.remove(&id);
        }
        evicted + self.sweep_below(exec.block_num)
    }

    /// Lazy sweep: evict proposals below the committed block number that
    /// have no descendants left, unwinding dead chains tip-first. Bottom-up
    /// over the height index.
    pub fn sweep_below(&mut self, exec_block_num: u64) -> usize {
        let mut evicted = 0;
        loop {
            let doomed: Vec<Digest> = self
                .by_height
                .values()
                .flatten()
                .copied()
                .filter(|id| {
                    let node = &self.nodes[id];
                    node.block_num < exec_block_num && self.children_of(id).is_empty()
                })
                .collect();
            if doomed.is_empty() {
                return evicted;
            }
            evicted += doomed.len();
            for id in &doomed {
                self.remove(id);
            }
        }
    }

    /// Capacity-pressure prune: evict the oldest (lowest-height) proposals
    /// that are not protected, until the store is comfortably below
    /// capacity or nothing evictable remains. `protected` ids and their
    /// whole ancestor chains survive.
    pub fn prune_aggressively(&mut self, protected: &[Digest]) -> usize {
        let mut keep: HashSet<Digest> = HashSet::new();
        for &id in protected {
            let mut cursor = id;
            while !cursor.is_zero() && keep.insert(cursor) {
                match self.nodes.get(&cursor) {
                    Some(node) => cursor = node.parent_id,
                    None => break,
                }
            }
        }

        // Leave headroom for an eighth of the capacity so one prune does
        // not immediately lead to another.
        let target = self.capacity - self.capacity / 8;
        let mut evicted = 0;
        let candidates: Vec<Digest> = self.by_height.values().flatten().copied().collect();
        for id in candidates {
            if self.nodes.len() <= target {
                break;
            }
            if !keep.contains(&id) {
                self.remove(&id);
                evicted += 1;
            }
        }
        evicted
    }

    fn remove(&mut self, id: &Digest) {
        let Some(node) = self.nodes.remove(id) else {
            return;
        };
        self.qcs.remove(id);
        self.children.remove(id);
        if let Some(siblings) = self.children.get_mut(&node.parent_id) {
            siblings.retain(|c| c != id);
            if siblings.is_empty() {
                self.children.remove(&node.parent_id);
            }
        }
        if let Some(level) = self.by_height.get_mut(&node.height()) {
            level.retain(|c| c != id);
            if level.is_empty() {
                self.by_height.remove(&node.height());
            }
        }
    }
}
