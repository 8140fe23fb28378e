//! Testing utilities for cluster integration tests
//!
//! - `TestCluster`: in-process replicas over the in-memory transports, with
//!   partition / kill / unreliable-network controls
//! - `HttpTestCluster`: replicas serving real HTTP on localhost

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::oneshot;

use crate::api::create_app;
use crate::client::clerk::{Clerk, ClerkConfig};
use crate::client::http::HttpClientTransport;
use crate::client::inmemory::InMemoryClientTransport;
use crate::core::config::{KvConfig, PaxosConfig};
use crate::core::kv_server::{KvHandle, KvServer};
use crate::core::paxos_core::{PaxosCore, SlotStatus};
use crate::core::paxos_node::PaxosNode;
use crate::state_machine::kv::{KeyValueStore, SharedKvStore};
use crate::transport::http::HttpTransport;
use crate::transport::inmemory::{create_cluster_with_network, InMemoryTransport, Network};

/// Timeout for replica-to-replica calls in test clusters
const RPC_TIMEOUT: Duration = Duration::from_millis(100);

/// Faster timings for tests
pub fn test_kv_config() -> KvConfig {
    KvConfig::default()
        .with_request_timeout(Duration::from_secs(1))
        .with_gap_fill_delay(Duration::from_millis(10))
        .with_apply_interval(Duration::from_millis(10))
        .with_done_interval(Duration::from_millis(50))
}

/// Clerk settings that tolerate long outages
pub fn test_clerk_config() -> ClerkConfig {
    ClerkConfig::default()
        .with_call_timeout(Duration::from_secs(2))
        .with_max_rounds(100)
        .with_backoff(Duration::from_millis(10))
}

fn peers_of(id: u64, node_ids: &[u64]) -> Vec<u64> {
    node_ids.iter().copied().filter(|&p| p != id).collect()
}

/// A single in-process replica
pub struct TestReplica {
    pub id: u64,
    pub server: KvServer<InMemoryTransport>,
    pub store: SharedKvStore,
    handle: KvHandle,
}

/// A cluster of replicas connected by in-memory channels
pub struct TestCluster {
    pub replicas: Vec<TestReplica>,
    network: Arc<Network>,
}

impl TestCluster {
    /// Create and start a new 3-replica cluster
    pub async fn new() -> Self {
        Self::with_replicas(3).await
    }

    /// Create and start a cluster with the specified number of replicas
    pub async fn with_replicas(count: u64) -> Self {
        Self::with_config(count, test_kv_config(), PaxosConfig::default()).await
    }

    /// Create and start a cluster with custom timings
    pub async fn with_config(count: u64, kv_config: KvConfig, paxos_config: PaxosConfig) -> Self {
        let node_ids: Vec<u64> = (1..=count).collect();
        let network = Network::new();
        let (mut transports, mut handles) =
            create_cluster_with_network(&node_ids, network.clone(), Some(RPC_TIMEOUT));

        let mut replicas = Vec::new();
        for &id in &node_ids {
            let transport = transports.remove(&id).expect("transport for every replica");
            let inbox = handles.remove(&id).expect("handle for every replica");

            let core = PaxosCore::new(id, peers_of(id, &node_ids));
            let node = PaxosNode::with_config(core, transport, paxos_config.clone());
            inbox.serve(node.shared_core());

            let store: SharedKvStore = Arc::new(parking_lot::Mutex::new(KeyValueStore::new()));
            let server = KvServer::with_config(node, Box::new(store.clone()), kv_config.clone());
            let handle = server.start();

            replicas.push(TestReplica {
                id,
                server,
                store,
                handle,
            });
        }

        TestCluster { replicas, network }
    }

    /// Shared fault injection for this cluster
    pub fn network(&self) -> Arc<Network> {
        self.network.clone()
    }

    pub fn ids(&self) -> Vec<u64> {
        self.replicas.iter().map(|r| r.id).collect()
    }

    pub fn replica(&self, id: u64) -> &TestReplica {
        self.replicas
            .iter()
            .find(|r| r.id == id)
            .expect("replica id belongs to the cluster")
    }

    /// Clerk that may talk to every replica
    pub fn clerk(&self) -> Clerk<InMemoryClientTransport> {
        self.clerk_for(&self.ids())
    }

    /// Clerk that only knows the given replicas
    pub fn clerk_for(&self, ids: &[u64]) -> Clerk<InMemoryClientTransport> {
        let servers = self
            .replicas
            .iter()
            .filter(|r| ids.contains(&r.id))
            .map(|r| (r.id, r.server.clone()))
            .collect();
        let transport = InMemoryClientTransport::new(servers, self.network.clone());
        Clerk::with_config(ids.to_vec(), transport, test_clerk_config())
    }

    /// Value of `key` in replica `id`'s local store
    pub fn value(&self, id: u64, key: &str) -> Option<String> {
        self.replica(id).store.lock().get(key)
    }

    /// Status of `seq` on every replica
    pub async fn slot_statuses(&self, seq: u64) -> Vec<SlotStatus> {
        let mut statuses = Vec::new();
        for replica in &self.replicas {
            statuses.push(replica.server.node().status(seq).await);
        }
        statuses
    }

    /// Wait until every listed replica holds the same value for `key`
    pub async fn wait_converged(&self, ids: &[u64], key: &str, timeout: Duration) -> Option<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let values: Vec<Option<String>> = ids.iter().map(|&id| self.value(id, key)).collect();
            if values.windows(2).all(|w| w[0] == w[1]) {
                if let Some(first) = values.into_iter().next() {
                    return first;
                }
                return None;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("replicas {:?} did not converge on {:?}", ids, key);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until every listed replica has applied at least through `seq`
    pub async fn wait_applied(&self, ids: &[u64], seq: u64, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let mut caught_up = true;
            for &id in ids {
                if self.replica(id).server.max_applied().await.map_or(true, |m| m < seq) {
                    caught_up = false;
                }
            }
            if caught_up {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("replicas {:?} did not apply slot {}", ids, seq);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn isolate(&self, id: u64) {
        self.network.isolate(id);
    }

    pub fn partition(&self, groups: &[&[u64]]) {
        self.network.partition(groups);
    }

    pub fn heal(&self) {
        self.network.heal();
    }

    pub fn kill(&self, id: u64) {
        self.network.kill(id);
    }

    pub fn revive(&self, id: u64) {
        self.network.revive(id);
    }

    pub fn set_unreliable(&self, unreliable: bool) {
        self.network.set_unreliable(unreliable);
    }

    /// Stop every replica's background loop
    pub async fn shutdown(self) {
        for replica in &self.replicas {
            replica.handle.shutdown().await;
        }
    }
}

/// A single replica serving HTTP
pub struct HttpTestNode {
    pub id: u64,
    pub addr: SocketAddr,
    pub store: SharedKvStore,
    http_shutdown_tx: Option<oneshot::Sender<()>>,
    handle: KvHandle,
}

/// A cluster of replicas talking HTTP on localhost
pub struct HttpTestCluster {
    pub nodes: Vec<HttpTestNode>,
}

impl HttpTestCluster {
    /// Create and start a cluster with the specified number of replicas
    pub async fn with_replicas(count: u64) -> Self {
        let node_ids: Vec<u64> = (1..=count).collect();

        // First, bind all listeners to get addresses
        let mut listeners = Vec::new();
        let mut addrs = HashMap::new();
        for &id in &node_ids {
            let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test listener");
            let addr = listener.local_addr().expect("listener address");
            addrs.insert(id, addr.to_string());
            listeners.push((id, listener, addr));
        }

        let mut nodes = Vec::new();
        for (id, listener, addr) in listeners {
            let peers: HashMap<u64, String> = addrs
                .iter()
                .filter(|(&peer_id, _)| peer_id != id)
                .map(|(&peer_id, addr)| (peer_id, addr.clone()))
                .collect();

            let transport = HttpTransport::new(peers, Duration::from_millis(500)).expect("http client");
            let node = PaxosNode::new(PaxosCore::new(id, peers_of(id, &node_ids)), transport);

            let store: SharedKvStore = Arc::new(parking_lot::Mutex::new(KeyValueStore::new()));
            let server = KvServer::with_config(node, Box::new(store.clone()), test_kv_config());
            let handle = server.start();
            let app = create_app(server);

            let (http_shutdown_tx, http_shutdown_rx) = oneshot::channel();
            tokio::spawn(async move {
                let _ = axum::serve(listener, app)
                    .with_graceful_shutdown(async {
                        let _ = http_shutdown_rx.await;
                    })
                    .await;
            });

            nodes.push(HttpTestNode {
                id,
                addr,
                store,
                http_shutdown_tx: Some(http_shutdown_tx),
                handle,
            });
        }

        // Give servers time to start
        tokio::time::sleep(Duration::from_millis(50)).await;

        HttpTestCluster { nodes }
    }

    /// Replica id to address
    pub fn addrs(&self) -> HashMap<u64, String> {
        self.nodes.iter().map(|n| (n.id, n.addr.to_string())).collect()
    }

    /// Clerk over HTTP that knows every replica
    pub fn clerk(&self) -> Clerk<HttpClientTransport> {
        let transport = HttpClientTransport::new(self.addrs(), Duration::from_secs(2)).expect("http client");
        let ids = self.nodes.iter().map(|n| n.id).collect();
        Clerk::with_config(ids, transport, test_clerk_config())
    }

    /// Stop one replica (HTTP server and background loop)
    pub async fn shutdown_node(&mut self, index: usize) {
        let node = &mut self.nodes[index];
        if let Some(tx) = node.http_shutdown_tx.take() {
            let _ = tx.send(());
        }
        node.handle.shutdown().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    /// Shutdown all replicas
    pub async fn shutdown(mut self) {
        for node in &mut self.nodes {
            if let Some(tx) = node.http_shutdown_tx.take() {
                let _ = tx.send(());
            }
            node.handle.shutdown().await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
