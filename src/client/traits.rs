//! Client RPC abstraction
//!
//! Every request carries the client id and request sequence so a replica can
//! recognize retries of a request it has already executed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::kv_server::KvError;
use crate::state_machine::Op;
use crate::transport::TransportError;

/// Get RPC arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetArgs {
    pub key: String,
    pub client_id: u64,
    pub request_seq: u64,
}

impl GetArgs {
    pub fn into_op(self) -> Op {
        Op::get(self.key, self.client_id, self.request_seq)
    }
}

/// Get RPC results
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetReply {
    pub value: String,
    pub found: bool,
}

/// Put and Append RPC arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutAppendArgs {
    pub key: String,
    pub value: String,
    pub client_id: u64,
    pub request_seq: u64,
}

/// Put and Append RPC results
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutAppendReply {
    pub ok: bool,
}

/// Why a single client call did not complete
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("rejected by server: {0}")]
    Rejected(#[from] KvError),
}

/// Client RPC transport; `server` is a replica id
#[async_trait]
pub trait ClientTransport: Send + Sync {
    async fn get(&self, server: u64, args: GetArgs) -> Result<GetReply, CallError>;

    async fn put(&self, server: u64, args: PutAppendArgs) -> Result<PutAppendReply, CallError>;

    async fn append(&self, server: u64, args: PutAppendArgs) -> Result<PutAppendReply, CallError>;
}
