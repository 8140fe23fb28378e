//! Simple key-value store state machine
//!
//! - `Get key` reads the current value
//! - `Put key value` overwrites
//! - `Append key value` concatenates onto the current value (missing key = empty)

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::command::{Op, OpKind};
use super::{ApplyResult, StateMachine};

/// Simple in-memory key-value store
#[derive(Debug, Default)]
pub struct KeyValueStore {
    data: HashMap<String, String>,
}

impl KeyValueStore {
    pub fn new() -> Self {
        KeyValueStore {
            data: HashMap::new(),
        }
    }

    /// Read a value directly, outside the replicated order (inspection only)
    pub fn get(&self, key: &str) -> Option<String> {
        self.data.get(key).cloned()
    }
}

/// Shared key-value store, applied to by the server and readable from outside
pub type SharedKvStore = Arc<Mutex<KeyValueStore>>;

impl StateMachine for SharedKvStore {
    fn apply(&mut self, op: &Op) -> ApplyResult {
        self.lock().apply(op)
    }
}

impl StateMachine for KeyValueStore {
    fn apply(&mut self, op: &Op) -> ApplyResult {
        match op.kind {
            OpKind::Get => ApplyResult::read(self.get(&op.key)),
            OpKind::Put => {
                self.data.insert(op.key.clone(), op.value.clone());
                ApplyResult::default()
            }
            OpKind::Append => {
                self.data.entry(op.key.clone()).or_default().push_str(&op.value);
                ApplyResult::default()
            }
        }
    }
}
