//! Clerk - client-side request dispatcher
//!
//! A Clerk sends each logical request to one replica at a time. When a replica is
//! unreachable, slow, or asks the client to go elsewhere, the same request (same
//! client id and request sequence) is resent to the next replica, so the store's
//! duplicate suppression treats all attempts as one request.
//!
//! A Clerk has at most one request outstanding. Concurrent calls on a shared
//! Clerk queue up behind each other, so request sequence numbers reach the
//! replicas in order.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use super::traits::{CallError, ClientTransport, GetArgs, PutAppendArgs};

/// Upper bound for the pause between passes over the server list
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Configuration for Clerk retries
#[derive(Debug, Clone)]
pub struct ClerkConfig {
    /// Maximum time to wait for one server to answer (default: 3s)
    pub call_timeout: Duration,
    /// Passes over the whole server list before giving up (default: 20)
    pub max_rounds: u32,
    /// Pause after the first failed pass; doubles after each further pass (default: 20ms)
    pub backoff: Duration,
}

impl Default for ClerkConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(3),
            max_rounds: 20,
            backoff: Duration::from_millis(20),
        }
    }
}

impl ClerkConfig {
    /// Create a new config with custom per-call timeout
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Create a new config with a custom number of passes (at least one)
    pub fn with_max_rounds(mut self, rounds: u32) -> Self {
        self.max_rounds = rounds.max(1);
        self
    }

    /// Create a new config with custom initial backoff
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Errors surfaced to Clerk users
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClerkError {
    #[error("no servers configured")]
    NoServers,
    #[error("no server completed the request after {rounds} rounds")]
    Exhausted { rounds: u32 },
}

/// Client handle to the replicated store
pub struct Clerk<C: ClientTransport> {
    client_id: u64,
    /// Last request sequence handed out; locked for the duration of a call
    request_seq: Mutex<u64>,
    /// Replica ids in randomized order
    servers: Vec<u64>,
    /// Index into `servers` of the last replica that answered
    preferred: AtomicUsize,
    transport: C,
    config: ClerkConfig,
}

impl<C: ClientTransport> Clerk<C> {
    /// Create a new Clerk with default config
    pub fn new(servers: Vec<u64>, transport: C) -> Self {
        Self::with_config(servers, transport, ClerkConfig::default())
    }

    /// Create a new Clerk with custom config
    pub fn with_config(mut servers: Vec<u64>, transport: C, config: ClerkConfig) -> Self {
        let mut rng = rand::rng();
        servers.shuffle(&mut rng);
        Self {
            client_id: rng.random(),
            request_seq: Mutex::new(0),
            servers,
            preferred: AtomicUsize::new(0),
            transport,
            config,
        }
    }

    /// Identifier sent with every request from this Clerk
    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    /// Servers in the order this Clerk tries them
    pub fn servers(&self) -> &[u64] {
        &self.servers
    }

    /// Wait for any outstanding call to finish, then take the next request sequence.
    /// The call owns the sequence until the returned guard is dropped.
    async fn begin_request(&self) -> MutexGuard<'_, u64> {
        let mut request_seq = self.request_seq.lock().await;
        *request_seq += 1;
        request_seq
    }

    /// Current value of `key`, or None if it was never written
    pub async fn get(&self, key: &str) -> Result<Option<String>, ClerkError> {
        let request = self.begin_request().await;
        let args = GetArgs {
            key: key.to_string(),
            client_id: self.client_id,
            request_seq: *request,
        };
        let reply = self.call(|server| self.transport.get(server, args.clone())).await?;
        Ok(reply.found.then_some(reply.value))
    }

    /// Set `key` to `value`
    pub async fn put(&self, key: &str, value: &str) -> Result<(), ClerkError> {
        let request = self.begin_request().await;
        let args = self.put_append_args(key, value, *request);
        self.call(|server| self.transport.put(server, args.clone())).await?;
        Ok(())
    }

    /// Append `value` to the current value of `key`
    pub async fn append(&self, key: &str, value: &str) -> Result<(), ClerkError> {
        let request = self.begin_request().await;
        let args = self.put_append_args(key, value, *request);
        self.call(|server| self.transport.append(server, args.clone())).await?;
        Ok(())
    }

    fn put_append_args(&self, key: &str, value: &str, request_seq: u64) -> PutAppendArgs {
        PutAppendArgs {
            key: key.to_string(),
            value: value.to_string(),
            client_id: self.client_id,
            request_seq,
        }
    }

    /// Try servers in order, starting with the preferred one, until one answers
    async fn call<R, F, Fut>(&self, mut attempt: F) -> Result<R, ClerkError>
    where
        F: FnMut(u64) -> Fut,
        Fut: Future<Output = Result<R, CallError>>,
    {
        if self.servers.is_empty() {
            return Err(ClerkError::NoServers);
        }

        let mut backoff = self.config.backoff;
        for round in 0..self.config.max_rounds {
            let start = self.preferred.load(Ordering::Relaxed);
            for offset in 0..self.servers.len() {
                let index = (start + offset) % self.servers.len();
                let server = self.servers[index];
                match tokio::time::timeout(self.config.call_timeout, attempt(server)).await {
                    Ok(Ok(reply)) => {
                        self.preferred.store(index, Ordering::Relaxed);
                        return Ok(reply);
                    }
                    Ok(Err(err)) => {
                        debug!(client = self.client_id, server, %err, "call failed, trying next server")
                    }
                    Err(_) => debug!(client = self.client_id, server, "call timed out, trying next server"),
                }
            }

            if round + 1 < self.config.max_rounds {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }

        warn!(client = self.client_id, rounds = self.config.max_rounds, "giving up on request");
        Err(ClerkError::Exhausted {
            rounds: self.config.max_rounds,
        })
    }
}
