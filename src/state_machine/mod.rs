//! State machine layer for the replicated store
//!
//! - `Op` / `Command`: what gets placed into a Paxos slot
//! - `KeyValueStore`: Get/Put/Append over string keys
//! - `TestStateMachine`: Records applied operations for testing

pub mod command;
pub mod kv;
pub mod traits;

pub use command::{Command, Op, OpKind};
pub use kv::{KeyValueStore, SharedKvStore};
pub use traits::{AppliedOps, ApplyResult, StateMachine, TestStateMachine};
