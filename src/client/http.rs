//! HTTP client transport for the replicated store
//!
//! Talks to the `/kv/*` routes served by `api::client_http`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::traits::{CallError, ClientTransport, GetArgs, GetReply, PutAppendArgs, PutAppendReply};
use crate::api::client_http::ErrorResponse;
use crate::transport::http::map_reqwest_error;
use crate::transport::TransportError;

/// HTTP transport from a Clerk to the servers
pub struct HttpClientTransport {
    /// Map of server ID to address (e.g., "127.0.0.1:8001")
    servers: HashMap<u64, String>,
    client: reqwest::Client,
}

impl HttpClientTransport {
    pub fn new(servers: HashMap<u64, String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { servers, client })
    }

    async fn post<A, R>(&self, server: u64, path: &str, args: &A) -> Result<R, CallError>
    where
        A: Serialize + Sync,
        R: DeserializeOwned + Send,
    {
        let addr = self.servers.get(&server).ok_or(TransportError::NodeNotFound)?;
        let url = format!("http://{}/kv/{}", addr, path);

        let response = self
            .client
            .post(&url)
            .json(args)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        if response.status().is_success() {
            return response
                .json::<R>()
                .await
                .map_err(|_| TransportError::ConnectionFailed.into());
        }

        // Servers explain refusals; anything else is treated as a broken connection
        match response.json::<ErrorResponse>().await {
            Ok(error) => Err(CallError::Rejected(error.kind)),
            Err(_) => Err(TransportError::ConnectionFailed.into()),
        }
    }
}

#[async_trait]
impl ClientTransport for HttpClientTransport {
    async fn get(&self, server: u64, args: GetArgs) -> Result<GetReply, CallError> {
        self.post(server, "get", &args).await
    }

    async fn put(&self, server: u64, args: PutAppendArgs) -> Result<PutAppendReply, CallError> {
        self.post(server, "put", &args).await
    }

    async fn append(&self, server: u64, args: PutAppendArgs) -> Result<PutAppendReply, CallError> {
        self.post(server, "append", &args).await
    }
}
