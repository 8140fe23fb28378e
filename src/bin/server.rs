//! Replicated key-value server binary
//!
//! Runs a single replica serving both replica RPCs (/paxos/*) and the client API
//! (/kv/*) on one HTTP listener.
//!
//! Example for a 3-replica cluster:
//!   kvpaxos-server --id 1 --listen 127.0.0.1:8001 --peers 2=127.0.0.1:8002,3=127.0.0.1:8003
//!   kvpaxos-server --id 2 --listen 127.0.0.1:8002 --peers 1=127.0.0.1:8001,3=127.0.0.1:8003
//!   kvpaxos-server --id 3 --listen 127.0.0.1:8003 --peers 1=127.0.0.1:8001,2=127.0.0.1:8002

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use kvpaxos::api::create_app;
use kvpaxos::core::config::KvConfig;
use kvpaxos::core::kv_server::KvServer;
use kvpaxos::core::paxos_core::PaxosCore;
use kvpaxos::core::paxos_node::PaxosNode;
use kvpaxos::state_machine::kv::{KeyValueStore, SharedKvStore};
use kvpaxos::transport::http::HttpTransport;

#[derive(Debug, Parser)]
#[command(name = "kvpaxos-server", about = "Paxos-replicated key-value server")]
struct Args {
    /// This replica's id
    #[arg(long)]
    id: u64,

    /// Address to serve on
    #[arg(long)]
    listen: SocketAddr,

    /// Other replicas, as id=host:port pairs separated by commas
    #[arg(long, value_parser = parse_peers)]
    peers: Option<HashMap<u64, String>>,

    /// How long one client request may take before the client is told to retry elsewhere
    #[arg(long, default_value_t = 2000)]
    request_timeout_ms: u64,

    /// Timeout for calls to other replicas
    #[arg(long, default_value_t = 500)]
    rpc_timeout_ms: u64,
}

/// Parse "2=127.0.0.1:8002,3=127.0.0.1:8003"
fn parse_peers(arg: &str) -> Result<HashMap<u64, String>, String> {
    let mut peers = HashMap::new();
    for entry in arg.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (id, addr) = entry
            .split_once('=')
            .ok_or_else(|| format!("expected id=addr, got {:?}", entry))?;
        let id: u64 = id.parse().map_err(|e| format!("invalid peer id {:?}: {}", id, e))?;
        peers.insert(id, addr.to_string());
    }
    Ok(peers)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let peers = args.peers.unwrap_or_default();
    if peers.contains_key(&args.id) {
        return Err(format!("--peers must not contain this replica's own id {}", args.id).into());
    }

    let peer_ids: Vec<u64> = peers.keys().copied().collect();
    info!(node = args.id, listen = %args.listen, peers = ?peers, "starting replica");

    let transport = HttpTransport::new(peers, Duration::from_millis(args.rpc_timeout_ms))?;
    let node = PaxosNode::new(PaxosCore::new(args.id, peer_ids), transport);

    let store: SharedKvStore = Arc::new(parking_lot::Mutex::new(KeyValueStore::new()));
    let config = KvConfig::default().with_request_timeout(Duration::from_millis(args.request_timeout_ms));
    let server = KvServer::with_config(node, Box::new(store), config);
    let handle = server.start();

    let listener = TcpListener::bind(args.listen).await?;
    axum::serve(listener, create_app(server))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    handle.shutdown().await;
    info!(node = args.id, "replica exited");
    Ok(())
}
