use crate::host::HostNode;
use crate::messages::{ConnectionId, HotstuffMessage};
use crate::qc_chain::{BlockContext, ChainError, Outbound, QcChain};
use basalt_core::crypto::Digest;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Read-only view of the chain pointers, published for the RPC layer so it
/// never contends with the consensus mutex. Versions only grow; a reader
/// comparing versions sees a monotonically advancing chain.
#[derive(Clone, Debug, Default, Serialize)]
pub struct FinalizerStateSnapshot {
    pub version: u64,
    pub b_leaf: Digest,
    pub b_lock: Digest,
    pub b_exec: Digest,
    pub b_exec_block_num: u64,
    /// Height of the highest QC target, 0 before any QC forms.
    pub high_qc_height: u64,
    pub policy_generation: u32,
}

pub struct PacemakerConfig {
    /// How long a view may make no progress before a NewView goes out.
    pub view_timeout: Duration,
}

impl Default for PacemakerConfig {
    fn default() -> Self {
        Self { view_timeout: Duration::from_secs(5) }
    }
}

/// The liveness layer around [`QcChain`].
///
/// One mutex serializes every entry into the state machine, whether the
/// message came off the network or from a local timer. Outbound fan-out
/// happens strictly after that mutex is released, from the queue the state
/// machine filled while it was held. A second reader-writer lock publishes
/// the snapshot for RPC readers, versioned by an atomic counter.
pub struct ChainPacemaker<H: HostNode> {
    host: Arc<H>,
    replica: String,
    hotstuff: Mutex<QcChain>,
    snapshot: RwLock<FinalizerStateSnapshot>,
    snapshot_version: AtomicU64,
    view_timeout: Duration,
    view_deadline: Mutex<Instant>,
    view_cv: Condvar,
    shutdown: AtomicBool,
}

impl<H: HostNode> ChainPacemaker<H> {
    pub fn new(host: Arc<H>, chain: QcChain, config: PacemakerConfig) -> Arc<Self> {
        let replica = chain.replica().to_string();
        Arc::new(Self {
            host,
            replica,
            hotstuff: Mutex::new(chain),
            snapshot: RwLock::new(FinalizerStateSnapshot::default()),
            snapshot_version: AtomicU64::new(0),
            view_timeout: config.view_timeout,
            view_deadline: Mutex::new(Instant::now() + config.view_timeout),
            view_cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
        })
    }

    // ---- producer schedule queries ----------------------------------------

    /// Producer of the block currently being built.
    pub fn get_proposer(&self) -> Option<String> {
        let head = self.host.head_block();
        head.schedule.scheduled_producer(head.timestamp).map(str::to_string)
    }

    /// Leader of the current view. With slot-derived rotation the leader is
    /// the scheduled producer.
    pub fn get_leader(&self) -> Option<String> {
        self.get_proposer()
    }

    /// Leader of the next slot; where votes will be worth sending after a
    /// view change.
    pub fn get_next_leader(&self) -> Option<String> {
        let head = self.host.head_block();
        head.schedule
            .scheduled_producer(head.timestamp.next())
            .map(str::to_string)
    }

    // ---- entry points, serialized by the consensus mutex ------------------

    /// Block-production timer tick. No-op unless this replica is the
    /// scheduled leader; otherwise produces exactly one proposal.
    pub fn beat(&self) -> Result<(), ChainError> {
        let head = self.host.head_block();
        let is_leader = head
            .schedule
            .scheduled_producer(head.timestamp)
            .is_some_and(|leader| leader == self.replica);
        if !is_leader {
            return Ok(());
        }

        let ctx = BlockContext {
            block_id: head.id,
            block_num: head.num,
            action_mroot: head.action_mroot,
        };
        let (outbound, progressed) = {
            let mut chain = self.lock_chain();
            chain.on_beat(ctx)?;
            let progressed = chain.take_progress();
            let outbound = chain.take_outbound();
            self.refresh_snapshot(&chain);
            (outbound, progressed)
        };
        if progressed {
            self.note_progress();
        }
        self.dispatch(outbound);
        Ok(())
    }

    /// Inbound consensus message from the host's network layer.
    pub fn on_hs_message(
        &self,
        connection: ConnectionId,
        msg: HotstuffMessage,
    ) -> Result<(), ChainError> {
        debug!(replica = %self.replica, connection, kind = msg.kind(), "inbound message");
        let (outbound, progressed) = {
            let mut chain = self.lock_chain();
            match msg {
                HotstuffMessage::Proposal(p) => chain.on_proposal(Some(connection), p)?,
                HotstuffMessage::Vote(v) => chain.on_vote(Some(connection), v)?,
                HotstuffMessage::NewView(nv) => chain.on_new_view(Some(connection), nv)?,
            }
            let progressed = chain.take_progress();
            let outbound = chain.take_outbound();
            self.refresh_snapshot(&chain);
            (outbound, progressed)
        };
        if progressed {
            self.note_progress();
        }
        self.dispatch(outbound);
        Ok(())
    }

    // ---- host signals ------------------------------------------------------

    /// The host accepted a new head block; if we lead its slot, propose.
    pub fn on_accepted_block(&self) -> Result<(), ChainError> {
        self.beat()
    }

    /// Start-of-block hook; nothing to do yet, the beat carries the work.
    pub fn on_block_start(&self, _block_num: u64) {}

    /// The host's irreversibility marker advanced (e.g. replayed from the
    /// block log); informational.
    pub fn on_irreversible_block(&self, block_num: u64) {
        debug!(replica = %self.replica, block_num, "host irreversible block");
    }

    // ---- snapshot for the RPC layer ---------------------------------------

    /// Cached, non-blocking view of the chain pointers.
    pub fn get_finalizer_state(&self) -> FinalizerStateSnapshot {
        self.snapshot.read().expect("snapshot lock poisoned").clone()
    }

    pub fn snapshot_version(&self) -> u64 {
        self.snapshot_version.load(Ordering::Acquire)
    }

    fn refresh_snapshot(&self, chain: &QcChain) {
        let mut snapshot = FinalizerStateSnapshot {
            version: 0,
            b_leaf: chain.b_leaf(),
            b_lock: chain.b_lock(),
            b_exec: chain.b_exec(),
            b_exec_block_num: chain
                .fork_store()
                .get(&chain.b_exec())
                .map(|n| n.block_num)
                .unwrap_or(0),
            high_qc_height: chain
                .high_qc()
                .and_then(|qc| chain.fork_store().height_of(&qc.proposal_id))
                .unwrap_or(0),
            policy_generation: chain.policy().generation(),
        };
        let mut guard = self.snapshot.write().expect("snapshot lock poisoned");
        let version = self.snapshot_version.load(Ordering::Relaxed) + 1;
        snapshot.version = version;
        *guard = snapshot;
        self.snapshot_version.store(version, Ordering::Release);
    }

    // ---- view timer --------------------------------------------------------

    /// A view made no progress in time: broadcast our highest QC so the next
    /// leader can catch up. Also callable directly by tests.
    pub fn on_view_timeout(&self) {
        info!(replica = %self.replica, "view timed out, sending new-view");
        let msg = {
            let chain = self.lock_chain();
            chain.new_view_message()
        };
        self.host.commit_hs_new_view(msg, None);
        self.note_progress();
    }

    /// Push the no-progress deadline out; called whenever a higher QC is
    /// adopted or a block finalizes.
    pub fn note_progress(&self) {
        let mut deadline = self.view_deadline.lock().expect("view lock poisoned");
        *deadline = Instant::now() + self.view_timeout;
        self.view_cv.notify_all();
    }

    /// Run the view timer on a dedicated thread until [`Self::stop`].
    /// Call on a clone of the pacemaker handle: the thread keeps it alive.
    pub fn start_view_timer(self: Arc<Self>) -> thread::JoinHandle<()> {
        let this = self;
        thread::Builder::new()
            .name(format!("{}-view-timer", this.replica))
            .spawn(move || {
                let mut guard = this.view_deadline.lock().expect("view lock poisoned");
                loop {
                    if this.shutdown.load(Ordering::Relaxed) {
                        return;
                    }
                    let now = Instant::now();
                    if now >= *guard {
                        *guard = now + this.view_timeout;
                        drop(guard);
                        this.on_view_timeout();
                        guard = this.view_deadline.lock().expect("view lock poisoned");
                    } else {
                        let wait = *guard - now;
                        let (g, _) = this
                            .view_cv
                            .wait_timeout(guard, wait)
                            .expect("view lock poisoned");
                        guard = g;
                    }
                }
            })
            .expect("spawning the view timer thread")
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.view_cv.notify_all();
    }

    // ---- internals ---------------------------------------------------------

    fn lock_chain(&self) -> std::sync::MutexGuard<'_, QcChain> {
        self.hotstuff.lock().expect("consensus mutex poisoned")
    }

    /// Fan out everything the state machine queued. Runs with no locks
    /// held.
    fn dispatch(&self, outbound: Vec<Outbound>) {
        for action in outbound {
            match action {
                Outbound::Proposal { msg, exclude } => self.host.commit_hs_proposal(msg, exclude),
                Outbound::Vote { msg, exclude } => self.host.commit_hs_vote(msg, exclude),
                Outbound::NewView { msg, exclude } => self.host.commit_hs_new_view(msg, exclude),
                Outbound::WarnPeer { connection, reason } => {
                    error!(replica = %self.replica, connection, %reason, "warning peer");
                    self.host.warn_peer(connection, &reason);
                }
            }
        }
    }
}
