//! Paxos-replicated key-value store
//!
//! Replicas agree on the order of client operations with single-decree Paxos per
//! log slot and apply them in that order, so every replica converges to the same
//! key-value state.

pub mod api;
pub mod client;
pub mod core;
pub mod state_machine;
pub mod transport;

/// Testing utilities for integration tests.
pub mod testing;
