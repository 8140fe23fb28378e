//! In-memory transport implementation for testing
//!
//! Every replica gets an mpsc inbox; a `NodeHandle` drains it against the replica's
//! `PaxosCore`. A shared `Network` decides which messages get through, so tests can
//! partition replicas, kill them, or drop a fraction of requests and replies.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::core::paxos_core::{
    AcceptArgs, AcceptResult, DecidedArgs, DecidedResult, DoneArgs, DoneResult, PaxosCore,
    PrepareArgs, PrepareResult, StatusArgs, StatusResult,
};
use crate::core::paxos_node::SharedCore;
use crate::transport::{Transport, TransportError};

/// Probability that an unreliable network loses a request before delivery
const DROP_REQUEST_RATE: f64 = 0.1;
/// Probability that an unreliable network loses a reply after the request was processed
const DROP_REPLY_RATE: f64 = 0.2;

/// Request types that can be sent to a node
pub(crate) enum Request {
    Prepare {
        args: PrepareArgs,
        reply: oneshot::Sender<PrepareResult>,
    },
    Accept {
        args: AcceptArgs,
        reply: oneshot::Sender<AcceptResult>,
    },
    Decided {
        args: DecidedArgs,
        reply: oneshot::Sender<DecidedResult>,
    },
    Done {
        args: DoneArgs,
        reply: oneshot::Sender<DoneResult>,
    },
    Status {
        args: StatusArgs,
        reply: oneshot::Sender<StatusResult>,
    },
}

#[derive(Debug, Default)]
struct NetworkState {
    /// Partition group per node; nodes without an entry share the default group
    groups: HashMap<u64, usize>,
    next_group: usize,
    dead: HashSet<u64>,
    unreliable: bool,
}

/// Fault injection shared by every transport of a test cluster
#[derive(Debug, Default)]
pub struct Network {
    state: RwLock<NetworkState>,
}

impl Network {
    /// Create a fully connected, reliable network
    pub fn new() -> Arc<Self> {
        Arc::new(Network::default())
    }

    /// Cut `node` off from every other node
    pub fn isolate(&self, node: u64) {
        let mut state = self.state.write();
        state.next_group += 1;
        let group = state.next_group;
        state.groups.insert(node, group);
    }

    /// Split the cluster: nodes can only reach nodes in the same group
    pub fn partition(&self, groups: &[&[u64]]) {
        let mut state = self.state.write();
        state.groups.clear();
        for members in groups {
            state.next_group += 1;
            let group = state.next_group;
            for &node in members.iter() {
                state.groups.insert(node, group);
            }
        }
    }

    /// Remove every partition
    pub fn heal(&self) {
        self.state.write().groups.clear();
    }

    /// Stop all traffic to and from `node`
    pub fn kill(&self, node: u64) {
        self.state.write().dead.insert(node);
    }

    /// Let a killed node talk again
    pub fn revive(&self, node: u64) {
        self.state.write().dead.remove(&node);
    }

    /// Whether `node` is currently killed
    pub fn is_dead(&self, node: u64) -> bool {
        self.state.read().dead.contains(&node)
    }

    /// Start or stop randomly dropping requests and replies
    pub fn set_unreliable(&self, unreliable: bool) {
        self.state.write().unreliable = unreliable;
    }

    /// Whether a message from `from` currently reaches `to`
    pub fn can_reach(&self, from: u64, to: u64) -> bool {
        let state = self.state.read();
        if state.dead.contains(&from) || state.dead.contains(&to) {
            return false;
        }
        state.groups.get(&from).copied().unwrap_or(0) == state.groups.get(&to).copied().unwrap_or(0)
    }

    pub(crate) fn drop_request(&self) -> bool {
        self.state.read().unreliable && rand::rng().random_bool(DROP_REQUEST_RATE)
    }

    pub(crate) fn drop_reply(&self) -> bool {
        self.state.read().unreliable && rand::rng().random_bool(DROP_REPLY_RATE)
    }
}

/// In-memory transport that uses channels for communication
pub struct InMemoryTransport {
    /// Node this transport sends from
    from: u64,
    /// Senders to each peer's request channel
    senders: HashMap<u64, mpsc::Sender<Request>>,
    /// Shared fault injection
    network: Arc<Network>,
    /// Optional timeout for RPC calls
    timeout: Option<Duration>,
}

impl InMemoryTransport {
    /// Create a new in-memory transport (no timeout)
    pub fn new(from: u64, senders: HashMap<u64, mpsc::Sender<Request>>, network: Arc<Network>) -> Self {
        Self {
            from,
            senders,
            network,
            timeout: None,
        }
    }

    /// Create a new in-memory transport with a timeout
    pub fn with_timeout(
        from: u64,
        senders: HashMap<u64, mpsc::Sender<Request>>,
        network: Arc<Network>,
        timeout: Duration,
    ) -> Self {
        Self {
            from,
            senders,
            network,
            timeout: Some(timeout),
        }
    }

    /// Network this transport is attached to
    pub fn network(&self) -> Arc<Network> {
        self.network.clone()
    }

    async fn call<R>(
        &self,
        target: u64,
        make: impl FnOnce(oneshot::Sender<R>) -> Request + Send,
    ) -> Result<R, TransportError>
    where
        R: Send,
    {
        let sender = self.senders.get(&target).ok_or(TransportError::NodeNotFound)?;

        if !self.network.can_reach(self.from, target) || self.network.drop_request() {
            return Err(TransportError::ConnectionFailed);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(make(reply_tx))
            .await
            .map_err(|_| TransportError::ConnectionFailed)?;

        // Apply timeout if configured
        let reply = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, reply_rx)
                .await
                .map_err(|_| TransportError::Timeout)?
                .map_err(|_| TransportError::ConnectionFailed)?,
            None => reply_rx.await.map_err(|_| TransportError::ConnectionFailed)?,
        };

        // The request took effect on the target even if its reply is lost
        if !self.network.can_reach(target, self.from) || self.network.drop_reply() {
            return Err(TransportError::ConnectionFailed);
        }
        Ok(reply)
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn prepare(&self, target: u64, args: PrepareArgs) -> Result<PrepareResult, TransportError> {
        self.call(target, |reply| Request::Prepare { args, reply }).await
    }

    async fn accept(&self, target: u64, args: AcceptArgs) -> Result<AcceptResult, TransportError> {
        self.call(target, |reply| Request::Accept { args, reply }).await
    }

    async fn decided(&self, target: u64, args: DecidedArgs) -> Result<DecidedResult, TransportError> {
        self.call(target, |reply| Request::Decided { args, reply }).await
    }

    async fn done(&self, target: u64, args: DoneArgs) -> Result<DoneResult, TransportError> {
        self.call(target, |reply| Request::Done { args, reply }).await
    }

    async fn status(&self, target: u64, args: StatusArgs) -> Result<StatusResult, TransportError> {
        self.call(target, |reply| Request::Status { args, reply }).await
    }
}

/// Handle for a node that processes incoming requests
pub struct NodeHandle {
    receiver: mpsc::Receiver<Request>,
}

impl NodeHandle {
    /// Process one incoming request using the given PaxosCore
    pub async fn process_one(&mut self, core: &mut PaxosCore) -> bool {
        match self.receiver.recv().await {
            Some(request) => {
                Self::handle_request(request, core);
                true
            }
            None => false,
        }
    }

    /// Process one request using a shared core.
    /// Receives the request first, then briefly locks to process it
    pub async fn process_one_shared(&mut self, core: &SharedCore) -> bool {
        match self.receiver.recv().await {
            Some(request) => {
                let mut core = core.lock().await;
                Self::handle_request(request, &mut core);
                true
            }
            None => false,
        }
    }

    /// Keep processing requests in the background until every sender is gone
    pub fn serve(mut self, core: SharedCore) -> JoinHandle<()> {
        tokio::spawn(async move { while self.process_one_shared(&core).await {} })
    }

    fn handle_request(request: Request, core: &mut PaxosCore) {
        match request {
            Request::Prepare { args, reply } => {
                let _ = reply.send(core.handle_prepare(&args));
            }
            Request::Accept { args, reply } => {
                let _ = reply.send(core.handle_accept(&args));
            }
            Request::Decided { args, reply } => {
                let _ = reply.send(core.handle_decided(&args));
            }
            Request::Done { args, reply } => {
                let _ = reply.send(core.handle_done(&args));
            }
            Request::Status { args, reply } => {
                let _ = reply.send(core.handle_status(&args));
            }
        }
    }
}

/// Create transports and handles for a cluster of nodes on a fresh reliable network
pub fn create_cluster(node_ids: &[u64]) -> (HashMap<u64, InMemoryTransport>, HashMap<u64, NodeHandle>) {
    create_cluster_with_network(node_ids, Network::new(), None)
}

/// Create transports and handles for a cluster of nodes with optional timeout
pub fn create_cluster_with_timeout(
    node_ids: &[u64],
    timeout: Option<Duration>,
) -> (HashMap<u64, InMemoryTransport>, HashMap<u64, NodeHandle>) {
    create_cluster_with_network(node_ids, Network::new(), timeout)
}

/// Create transports and handles for a cluster of nodes sharing `network`
pub fn create_cluster_with_network(
    node_ids: &[u64],
    network: Arc<Network>,
    timeout: Option<Duration>,
) -> (HashMap<u64, InMemoryTransport>, HashMap<u64, NodeHandle>) {
    let mut senders: HashMap<u64, mpsc::Sender<Request>> = HashMap::new();
    let mut handles: HashMap<u64, NodeHandle> = HashMap::new();

    // Create a channel for each node
    for &id in node_ids {
        let (tx, rx) = mpsc::channel(256);
        senders.insert(id, tx);
        handles.insert(id, NodeHandle { receiver: rx });
    }

    // Create a transport for each node with senders to all other nodes
    let mut transports: HashMap<u64, InMemoryTransport> = HashMap::new();
    for &id in node_ids {
        let other_senders: HashMap<u64, mpsc::Sender<Request>> = senders
            .iter()
            .filter(|(&k, _)| k != id)
            .map(|(&k, v)| (k, v.clone()))
            .collect();
        let transport = match timeout {
            Some(t) => InMemoryTransport::with_timeout(id, other_senders, network.clone(), t),
            None => InMemoryTransport::new(id, other_senders, network.clone()),
        };
        transports.insert(id, transport);
    }

    (transports, handles)
}
