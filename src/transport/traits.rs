//! Transport abstraction for Paxos RPC

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::paxos_core::{
    AcceptArgs, AcceptResult, DecidedArgs, DecidedResult, DoneArgs, DoneResult, PrepareArgs,
    PrepareResult, StatusArgs, StatusResult,
};

/// Transport abstraction for replica-to-replica communication.
///
/// Each call is delivered at most once and may be lost; retrying is the caller's job.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a Prepare (phase 1a) to a peer
    async fn prepare(&self, target: u64, args: PrepareArgs) -> Result<PrepareResult, TransportError>;

    /// Send an Accept (phase 2a) to a peer
    async fn accept(&self, target: u64, args: AcceptArgs) -> Result<AcceptResult, TransportError>;

    /// Tell a peer the value decided for a slot
    async fn decided(&self, target: u64, args: DecidedArgs) -> Result<DecidedResult, TransportError>;

    /// Report this replica's Done watermark to a peer
    async fn done(&self, target: u64, args: DoneArgs) -> Result<DoneResult, TransportError>;

    /// Ask a peer what it knows about a slot
    async fn status(&self, target: u64, args: StatusArgs) -> Result<StatusResult, TransportError>;
}

/// Errors that can occur during transport operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum TransportError {
    /// Connection to the target node failed (or the message was lost)
    #[error("connection failed")]
    ConnectionFailed,
    /// Request timed out
    #[error("request timed out")]
    Timeout,
    /// Target node not found
    #[error("node not found")]
    NodeNotFound,
}
