//! Consensus engine and the replicated store built on it

pub mod ballot;
pub mod config;
pub mod done_tracker;
pub mod kv_server;
pub mod paxos_core;
pub mod paxos_node;
