//! KvServer - replicated key-value store on top of the Paxos log
//!
//! Every client operation is placed in the next free log slot; decided slots are
//! applied strictly in order. Any replica can serve any request.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::config::KvConfig;
use super::paxos_core::SlotStatus;
use super::paxos_node::{PaxosNode, SharedCore};
use crate::state_machine::{ApplyResult, Command, Op, StateMachine};
use crate::transport::Transport;

/// How often a pending slot is re-checked locally before asking peers
const GAP_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Number of slots asked about at once while catching up
const LEARN_WINDOW: u64 = 32;

/// Errors returned to clients
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum KvError {
    /// This replica could not get the operation decided in time
    #[error("request not completed at this replica; retry elsewhere")]
    RetryElsewhere,
    /// The replica's background loop has stopped
    #[error("server is shutting down")]
    ShuttingDown,
    /// The operation could not be encoded as a slot value
    #[error("failed to encode operation: {0}")]
    Encoding(String),
}

/// Last completed request of one client
#[derive(Debug, Clone)]
struct DedupEntry {
    request_seq: u64,
    result: ApplyResult,
}

/// Everything the apply path mutates; guarded by one mutex
struct ApplyState {
    machine: Box<dyn StateMachine>,
    /// Highest slot applied to `machine`
    max_applied: Option<u64>,
    /// Lowest slot this replica has not yet handed to a local request
    next_claim: u64,
    dedup: HashMap<u64, DedupEntry>,
}

impl ApplyState {
    fn next_to_apply(&self) -> u64 {
        self.max_applied.map_or(0, |m| m.saturating_add(1))
    }

    fn cached(&self, op: &Op) -> Option<ApplyResult> {
        self.dedup
            .get(&op.client_id)
            .filter(|entry| op.request_seq <= entry.request_seq)
            .map(|entry| entry.result.clone())
    }

    fn apply_slot(&mut self, node: u64, seq: u64, value: &str) {
        match Command::decode(value) {
            Some(Command::Client(op)) => {
                if self.cached(&op).is_some() {
                    debug!(node, seq, client = op.client_id, request = op.request_seq, "skipping duplicate");
                } else {
                    let result = self.machine.apply(&op);
                    self.dedup.insert(
                        op.client_id,
                        DedupEntry {
                            request_seq: op.request_seq,
                            result,
                        },
                    );
                }
            }
            Some(Command::Noop) => {}
            None => warn!(node, seq, "skipping undecodable slot value"),
        }
        self.max_applied = Some(seq);
    }
}

/// Snapshot of a replica's progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvStatus {
    pub node_id: u64,
    pub max_applied: Option<u64>,
    pub min: u64,
    pub max: Option<u64>,
}

struct Inner<T: Transport> {
    node: PaxosNode<T>,
    apply: Mutex<ApplyState>,
    /// Slots a local request is currently proposing into
    claims: parking_lot::Mutex<HashSet<u64>>,
    config: KvConfig,
    shutting_down: AtomicBool,
}

/// Handle for stopping a running KvServer background loop
#[derive(Clone)]
pub struct KvHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl KvHandle {
    /// Stop the background loop; in-flight and later requests fail with `ShuttingDown`
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// A slot handed to a local request; released when dropped
struct Claim<'a> {
    seq: u64,
    claims: &'a parking_lot::Mutex<HashSet<u64>>,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.claims.lock().remove(&self.seq);
    }
}

/// Replicated key-value server
pub struct KvServer<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for KvServer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport + 'static> KvServer<T> {
    /// Create a new KvServer with default config
    pub fn new(node: PaxosNode<T>, machine: Box<dyn StateMachine>) -> Self {
        Self::with_config(node, machine, KvConfig::default())
    }

    /// Create a new KvServer with custom config
    pub fn with_config(node: PaxosNode<T>, machine: Box<dyn StateMachine>, config: KvConfig) -> Self {
        let apply = ApplyState {
            machine,
            max_applied: None,
            next_claim: 0,
            dedup: HashMap::new(),
        };
        Self {
            inner: Arc::new(Inner {
                node,
                apply: Mutex::new(apply),
                claims: parking_lot::Mutex::new(HashSet::new()),
                config,
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// This replica's id
    pub fn id(&self) -> u64 {
        self.inner.node.id()
    }

    /// The underlying consensus node
    pub fn node(&self) -> &PaxosNode<T> {
        &self.inner.node
    }

    /// Shared core, for serving replica RPCs
    pub fn shared_core(&self) -> SharedCore {
        self.inner.node.shared_core()
    }

    /// Highest slot applied locally
    pub async fn max_applied(&self) -> Option<u64> {
        self.inner.apply.lock().await.max_applied
    }

    /// Progress report for monitoring
    pub async fn status(&self) -> KvStatus {
        let max_applied = self.max_applied().await;
        KvStatus {
            node_id: self.id(),
            max_applied,
            min: self.inner.node.min().await,
            max: self.inner.node.max().await,
        }
    }

    /// Execute a client operation through the replicated log.
    ///
    /// Runs on its own task so a caller that goes away does not abandon a
    /// half-finished proposal.
    pub async fn handle(&self, op: Op) -> Result<ApplyResult, KvError> {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return Err(KvError::ShuttingDown);
        }

        let server = self.clone();
        let timeout = self.inner.config.request_timeout;
        let task = tokio::spawn(async move { tokio::time::timeout(timeout, server.execute(op)).await });

        match task.await {
            Ok(Ok(result)) => result,
            Ok(Err(_elapsed)) => {
                debug!(node = self.id(), "request timed out");
                Err(KvError::RetryElsewhere)
            }
            Err(err) if err.is_panic() => {
                error!(node = self.id(), error = %err, "request task panicked");
                Err(KvError::RetryElsewhere)
            }
            Err(_) => Err(KvError::ShuttingDown),
        }
    }

    async fn execute(&self, op: Op) -> Result<ApplyResult, KvError> {
        let value = Command::Client(op.clone())
            .encode()
            .map_err(|e| KvError::Encoding(e.to_string()))?;

        loop {
            if self.inner.shutting_down.load(Ordering::Acquire) {
                return Err(KvError::ShuttingDown);
            }
            if let Some(result) = self.inner.apply.lock().await.cached(&op) {
                return Ok(result);
            }

            let claim = self.claim_seq().await;
            let seq = claim.seq;
            let outcome = self.inner.node.propose(seq, value.clone()).await;
            drop(claim);
            match outcome {
                Ok(decided) => {
                    let ours = matches!(Command::decode(&decided), Some(Command::Client(d)) if d.same_request(&op));
                    if !ours {
                        debug!(node = self.id(), seq, "slot taken by another operation, retrying");
                    }
                    self.catch_up(seq).await;
                }
                // Slot forgotten, so it was applied everywhere; claim again
                Err(err) => debug!(node = self.id(), seq, %err, "proposal failed"),
            }
        }
    }

    /// Pick the next sequence number that neither this replica nor any peer it
    /// heard from has used
    async fn claim_seq(&self) -> Claim<'_> {
        let mut state = self.inner.apply.lock().await;
        let seen = self.inner.node.max().await.map_or(0, |m| m.saturating_add(1));
        let seq = state.next_claim.max(state.next_to_apply()).max(seen);
        state.next_claim = seq.saturating_add(1);
        self.inner.claims.lock().insert(seq);
        Claim {
            seq,
            claims: &self.inner.claims,
        }
    }

    /// Apply every decided slot directly after `max_applied`.
    /// Returns the first slot that could not be applied yet.
    pub async fn apply_decided(&self) -> u64 {
        let id = self.id();
        let mut state = self.inner.apply.lock().await;
        loop {
            let next = state.next_to_apply();
            match self.inner.node.status(next).await {
                SlotStatus::Decided(value) => state.apply_slot(id, next, &value),
                SlotStatus::Pending => return next,
                SlotStatus::Forgotten => {
                    error!(node = id, seq = next, "next slot to apply was forgotten");
                    return next;
                }
            }
        }
    }

    /// Apply everything through `target`, filling gaps as needed.
    /// Returns false if some slot could not be decided in time.
    pub async fn catch_up(&self, target: u64) -> bool {
        loop {
            let next = self.apply_decided().await;
            if next > target {
                return true;
            }
            if !self.fill_gap(next, target).await {
                return false;
            }
        }
    }

    /// Get `seq` decided. A slot no local request is proposing into is first
    /// learned from peers together with the slots after it, up to `target`.
    /// Otherwise wait for its proposer, then ask peers, then propose a no-op.
    async fn fill_gap(&self, seq: u64, target: u64) -> bool {
        let node = &self.inner.node;
        let claimed_here = self.inner.claims.lock().contains(&seq);
        if !claimed_here {
            let end = target.min(seq.saturating_add(LEARN_WINDOW - 1));
            let learned = join_all((seq..=end).map(|s| node.learn(s))).await;
            if learned.first().is_some_and(|status| *status != SlotStatus::Pending) {
                return true;
            }
        }

        let deadline = Instant::now() + self.inner.config.gap_fill_delay;
        loop {
            if node.status(seq).await != SlotStatus::Pending {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(GAP_POLL_INTERVAL.min(deadline - now)).await;
        }

        if node.learn(seq).await != SlotStatus::Pending {
            return true;
        }

        let noop = match Command::Noop.encode() {
            Ok(noop) => noop,
            Err(e) => {
                error!(node = node.id(), seq, error = %e, "failed to encode no-op");
                return false;
            }
        };
        debug!(node = node.id(), seq, "filling gap with no-op");
        match tokio::time::timeout(self.inner.config.request_timeout, node.propose(seq, noop)).await {
            Ok(Ok(_)) => true,
            Ok(Err(err)) => {
                warn!(node = node.id(), seq, %err, "gap fill failed");
                false
            }
            Err(_) => false,
        }
    }

    /// Start the background apply / Done loop and return a handle for stopping it
    pub fn start(&self) -> KvHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        tokio::spawn(self.clone().run(shutdown_rx));
        KvHandle { shutdown_tx }
    }

    /// Background loop
    async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) {
        let mut apply_interval = interval(self.inner.config.apply_interval);
        apply_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut done_interval = interval(self.inner.config.done_interval);
        done_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(node = self.id(), "replica started");
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    break;
                }
                _ = apply_interval.tick() => {
                    match self.inner.node.max().await {
                        Some(target) => {
                            self.catch_up(target).await;
                        }
                        None => {
                            self.apply_decided().await;
                        }
                    }
                }
                _ = done_interval.tick() => {
                    if let Some(applied) = self.max_applied().await {
                        self.inner.node.done(applied).await;
                    }
                    let server = self.clone();
                    tokio::spawn(async move { server.inner.node.broadcast_done().await });
                }
            }
        }

        self.inner.shutting_down.store(true, Ordering::Release);
        info!(node = self.id(), "replica stopped");
    }
}
