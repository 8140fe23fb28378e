//! Transport layer for replica-to-replica Paxos RPC
//!
//! - `InMemoryTransport`: Channel-based transport with fault injection for testing
//! - `HttpTransport`: HTTP/JSON transport for production

pub mod http;
pub mod inmemory;
pub mod traits;

pub use traits::{Transport, TransportError};
