//! State machine abstraction for the replicated store
//!
//! Decided client operations are applied to the state machine in slot order.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::command::{Op, OpKind};

/// Result of applying one operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResult {
    /// Value read by a Get; empty for Put/Append and for missing keys
    pub value: String,
    /// Whether a Get found its key
    pub found: bool,
}

impl ApplyResult {
    /// Result of a Get
    pub fn read(value: Option<String>) -> Self {
        match value {
            Some(value) => ApplyResult { value, found: true },
            None => ApplyResult::default(),
        }
    }
}

/// State machine trait - the application logic the replicas agree on
///
/// Implementations must be deterministic: applying the same operations
/// in the same order must produce the same state on all replicas.
pub trait StateMachine: Send {
    /// Apply an operation and return its result
    fn apply(&mut self, op: &Op) -> ApplyResult;
}

/// Shared record of applied operations for testing
pub type AppliedOps = Arc<Mutex<Vec<Op>>>;

/// Test state machine that records all applied operations to a shared vec
pub struct TestStateMachine {
    applied: AppliedOps,
}

impl TestStateMachine {
    pub fn new() -> Self {
        TestStateMachine {
            applied: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create with a shared vec to inspect applied operations from outside
    pub fn new_shared(applied: AppliedOps) -> Self {
        TestStateMachine { applied }
    }
}

impl Default for TestStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine for TestStateMachine {
    fn apply(&mut self, op: &Op) -> ApplyResult {
        self.applied.lock().push(op.clone());
        match op.kind {
            OpKind::Get => ApplyResult::read(None),
            OpKind::Put | OpKind::Append => ApplyResult::default(),
        }
    }
}
