//! HTTP client API for the replicated store
//!
//! Provides HTTP endpoints for Clerks and operators:
//! - Get/Put/Append, each carrying the client id and request sequence
//! - Replica progress (applied, min and max sequence numbers)

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::client::traits::{GetArgs, GetReply, PutAppendArgs, PutAppendReply};
use crate::core::kv_server::{KvError, KvServer, KvStatus};
use crate::state_machine::Op;
use crate::transport::Transport;

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Machine-readable reason, so clients know whether to retry elsewhere
    pub kind: KvError,
}

/// Status code and body returned for a failed request
pub type ApiError = (StatusCode, Json<ErrorResponse>);

fn error_response(err: KvError) -> ApiError {
    let status = match err {
        KvError::RetryElsewhere | KvError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        KvError::Encoding(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            kind: err,
        }),
    )
}

/// Create an axum router for the client HTTP API
pub fn create_client_router<T: Transport + 'static>(server: KvServer<T>) -> Router {
    Router::new()
        .route("/kv/get", post(handle_get::<T>))
        .route("/kv/put", post(handle_put::<T>))
        .route("/kv/append", post(handle_append::<T>))
        .route("/kv/status", get(handle_status::<T>))
        .with_state(server)
}

/// Handle POST /kv/get
pub async fn handle_get<T: Transport + 'static>(
    State(server): State<KvServer<T>>,
    Json(args): Json<GetArgs>,
) -> Result<Json<GetReply>, ApiError> {
    let result = server.handle(args.into_op()).await.map_err(error_response)?;
    Ok(Json(GetReply {
        value: result.value,
        found: result.found,
    }))
}

/// Handle POST /kv/put
pub async fn handle_put<T: Transport + 'static>(
    State(server): State<KvServer<T>>,
    Json(args): Json<PutAppendArgs>,
) -> Result<Json<PutAppendReply>, ApiError> {
    let op = Op::put(args.key, args.value, args.client_id, args.request_seq);
    server.handle(op).await.map_err(error_response)?;
    Ok(Json(PutAppendReply { ok: true }))
}

/// Handle POST /kv/append
pub async fn handle_append<T: Transport + 'static>(
    State(server): State<KvServer<T>>,
    Json(args): Json<PutAppendArgs>,
) -> Result<Json<PutAppendReply>, ApiError> {
    let op = Op::append(args.key, args.value, args.client_id, args.request_seq);
    server.handle(op).await.map_err(error_response)?;
    Ok(Json(PutAppendReply { ok: true }))
}

/// Handle GET /kv/status
pub async fn handle_status<T: Transport + 'static>(State(server): State<KvServer<T>>) -> Json<KvStatus> {
    Json(server.status().await)
}
