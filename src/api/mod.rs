//! HTTP surface of a replica

pub mod client_http;

use axum::Router;

use crate::core::kv_server::KvServer;
use crate::transport::http::create_router;
use crate::transport::Transport;

/// Replica RPC routes and client routes on one router
pub fn create_app<T: Transport + 'static>(server: KvServer<T>) -> Router {
    create_router(server.shared_core()).merge(client_http::create_client_router(server))
}
