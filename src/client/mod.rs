//! Client side of the replicated store
//!
//! - `Clerk`: issues Get/Put/Append against any replica, retrying elsewhere
//! - `ClientTransport`: how a Clerk reaches a replica (in-memory or HTTP)

pub mod clerk;
pub mod http;
pub mod inmemory;
pub mod traits;

pub use clerk::{Clerk, ClerkConfig, ClerkError};
pub use traits::{CallError, ClientTransport, GetArgs, GetReply, PutAppendArgs, PutAppendReply};
