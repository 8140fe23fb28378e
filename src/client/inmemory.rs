//! In-memory client transport for testing
//!
//! Calls `KvServer::handle` directly, subject to the same `Network` faults as the
//! replica transports. Clerks are treated as a node of their own that is never
//! partitioned, so only killed servers and unreliable delivery affect them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::traits::{CallError, ClientTransport, GetArgs, GetReply, PutAppendArgs, PutAppendReply};
use crate::core::kv_server::KvServer;
use crate::state_machine::{ApplyResult, Op};
use crate::transport::inmemory::{InMemoryTransport, Network};
use crate::transport::TransportError;

/// In-memory transport from a Clerk to a set of servers
pub struct InMemoryClientTransport {
    servers: HashMap<u64, KvServer<InMemoryTransport>>,
    network: Arc<Network>,
}

impl InMemoryClientTransport {
    pub fn new(servers: HashMap<u64, KvServer<InMemoryTransport>>, network: Arc<Network>) -> Self {
        Self { servers, network }
    }

    async fn call(&self, server: u64, op: Op) -> Result<ApplyResult, CallError> {
        let target = self.servers.get(&server).ok_or(TransportError::NodeNotFound)?;
        if self.network.is_dead(server) || self.network.drop_request() {
            return Err(TransportError::ConnectionFailed.into());
        }

        let result = target.handle(op).await?;

        // The operation took effect even if its reply is lost
        if self.network.is_dead(server) || self.network.drop_reply() {
            return Err(TransportError::ConnectionFailed.into());
        }
        Ok(result)
    }
}

#[async_trait]
impl ClientTransport for InMemoryClientTransport {
    async fn get(&self, server: u64, args: GetArgs) -> Result<GetReply, CallError> {
        let result = self.call(server, args.into_op()).await?;
        Ok(GetReply {
            value: result.value,
            found: result.found,
        })
    }

    async fn put(&self, server: u64, args: PutAppendArgs) -> Result<PutAppendReply, CallError> {
        let op = Op::put(args.key, args.value, args.client_id, args.request_seq);
        self.call(server, op).await?;
        Ok(PutAppendReply { ok: true })
    }

    async fn append(&self, server: u64, args: PutAppendArgs) -> Result<PutAppendReply, CallError> {
        let op = Op::append(args.key, args.value, args.client_id, args.request_seq);
        self.call(server, op).await?;
        Ok(PutAppendReply { ok: true })
    }
}
