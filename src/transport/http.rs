//! HTTP transport implementation for Paxos RPC
//!
//! Uses axum for the server and reqwest for the client.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use axum::{extract::State, routing::post, Json, Router};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::core::paxos_core::{
    AcceptArgs, AcceptResult, DecidedArgs, DecidedResult, DoneArgs, DoneResult, PrepareArgs,
    PrepareResult, StatusArgs, StatusResult,
};
use crate::core::paxos_node::SharedCore;
use crate::transport::{Transport, TransportError};

/// HTTP transport for Paxos RPC communication
pub struct HttpTransport {
    /// Map of node ID to address (e.g., "127.0.0.1:8001")
    peers: HashMap<u64, String>,
    /// HTTP client with timeout
    client: reqwest::Client,
}

impl HttpTransport {
    /// Create a new HTTP transport with peer addresses
    pub fn new(peers: HashMap<u64, String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(HttpTransport { peers, client })
    }

    async fn post<A, R>(&self, target: u64, path: &str, args: &A) -> Result<R, TransportError>
    where
        A: Serialize + Sync,
        R: DeserializeOwned + Send,
    {
        let addr = self.peers.get(&target).ok_or(TransportError::NodeNotFound)?;
        let url = format!("http://{}/paxos/{}", addr, path);

        let response = self
            .client
            .post(&url)
            .json(args)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        response.json::<R>().await.map_err(|_| TransportError::ConnectionFailed)
    }
}

pub(crate) fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::ConnectionFailed
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn prepare(&self, target: u64, args: PrepareArgs) -> Result<PrepareResult, TransportError> {
        self.post(target, "prepare", &args).await
    }

    async fn accept(&self, target: u64, args: AcceptArgs) -> Result<AcceptResult, TransportError> {
        self.post(target, "accept", &args).await
    }

    async fn decided(&self, target: u64, args: DecidedArgs) -> Result<DecidedResult, TransportError> {
        self.post(target, "decided", &args).await
    }

    async fn done(&self, target: u64, args: DoneArgs) -> Result<DoneResult, TransportError> {
        self.post(target, "done", &args).await
    }

    async fn status(&self, target: u64, args: StatusArgs) -> Result<StatusResult, TransportError> {
        self.post(target, "status", &args).await
    }
}

/// Create an axum router for handling Paxos RPCs
pub fn create_router(core: SharedCore) -> Router {
    Router::new()
        .route("/paxos/prepare", post(handle_prepare))
        .route("/paxos/accept", post(handle_accept))
        .route("/paxos/decided", post(handle_decided))
        .route("/paxos/done", post(handle_done))
        .route("/paxos/status", post(handle_status))
        .with_state(core)
}

async fn handle_prepare(State(core): State<SharedCore>, Json(args): Json<PrepareArgs>) -> Json<PrepareResult> {
    Json(core.lock().await.handle_prepare(&args))
}

async fn handle_accept(State(core): State<SharedCore>, Json(args): Json<AcceptArgs>) -> Json<AcceptResult> {
    Json(core.lock().await.handle_accept(&args))
}

async fn handle_decided(State(core): State<SharedCore>, Json(args): Json<DecidedArgs>) -> Json<DecidedResult> {
    Json(core.lock().await.handle_decided(&args))
}

async fn handle_done(State(core): State<SharedCore>, Json(args): Json<DoneArgs>) -> Json<DoneResult> {
    Json(core.lock().await.handle_done(&args))
}

async fn handle_status(State(core): State<SharedCore>, Json(args): Json<StatusArgs>) -> Json<StatusResult> {
    Json(core.lock().await.handle_status(&args))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::sync::Mutex;

    use crate::core::ballot::Ballot;
    use crate::core::paxos_core::{PaxosCore, SlotStatus};

    async fn spawn_node(core: SharedCore) -> String {
        let router = create_router(core);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        // Give server time to start
        tokio::time::sleep(Duration::from_millis(10)).await;
        addr.to_string()
    }

    #[tokio::test]
    async fn test_http_prepare_and_accept() {
        let core2 = Arc::new(Mutex::new(PaxosCore::new(2, vec![1, 3])));
        let addr = spawn_node(core2.clone()).await;

        let mut peers = HashMap::new();
        peers.insert(2, addr);
        let transport = HttpTransport::new(peers, Duration::from_secs(5)).unwrap();

        let ballot = Ballot::new(1, 1);
        let promise = transport
            .prepare(2, PrepareArgs { seq: 0, ballot, from: 1, done: None })
            .await
            .unwrap();
        assert_eq!(promise, PrepareResult::Promise { accepted: None });

        let accepted = transport
            .accept(
                2,
                AcceptArgs {
                    seq: 0,
                    ballot,
                    value: "v".to_string(),
                    from: 1,
                    done: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(accepted, AcceptResult::Accepted);
    }

    #[tokio::test]
    async fn test_http_decided_then_status() {
        let core2 = Arc::new(Mutex::new(PaxosCore::new(2, vec![1])));
        let addr = spawn_node(core2.clone()).await;

        let mut peers = HashMap::new();
        peers.insert(2, addr);
        let transport = HttpTransport::new(peers, Duration::from_secs(5)).unwrap();

        let ack = transport
            .decided(2, DecidedArgs { seq: 4, value: "v".to_string(), from: 1, done: None })
            .await
            .unwrap();
        assert!(ack.ack);

        let status = transport.status(2, StatusArgs { seq: 4 }).await.unwrap();
        assert_eq!(status.status, SlotStatus::Decided("v".to_string()));

        let ack = transport
            .done(2, DoneArgs { from: 1, done: Some(4), max_seq: Some(9) })
            .await
            .unwrap();
        assert!(ack.ack);
        assert_eq!(core2.lock().await.max(), Some(9));
    }

    #[tokio::test]
    async fn test_http_timeout() {
        // Create transport pointing to non-existent server
        let mut peers = HashMap::new();
        peers.insert(2, "127.0.0.1:59999".to_string());
        let transport = HttpTransport::new(peers, Duration::from_millis(100)).unwrap();

        let result = transport.status(2, StatusArgs { seq: 0 }).await;

        assert!(matches!(
            result,
            Err(TransportError::ConnectionFailed) | Err(TransportError::Timeout)
        ));
    }

    #[tokio::test]
    async fn test_http_node_not_found() {
        let transport = HttpTransport::new(HashMap::new(), Duration::from_secs(5)).unwrap();
        let result = transport.status(2, StatusArgs { seq: 0 }).await;
        assert!(matches!(result, Err(TransportError::NodeNotFound)));
    }
}
