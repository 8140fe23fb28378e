//! Operations and slot commands
//!
//! The consensus engine treats slot values as opaque strings; the store encodes a
//! `Command` as JSON before proposing it.

use serde::{Deserialize, Serialize};

/// Kind of client operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Get,
    Put,
    Append,
}

/// A client operation, tagged with the identity used for duplicate suppression
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Op {
    pub kind: OpKind,
    pub key: String,
    /// Ignored for Get
    pub value: String,
    pub client_id: u64,
    /// Per-client request number; retries of one logical call reuse it
    pub request_seq: u64,
}

impl Op {
    pub fn get(key: impl Into<String>, client_id: u64, request_seq: u64) -> Self {
        Op {
            kind: OpKind::Get,
            key: key.into(),
            value: String::new(),
            client_id,
            request_seq,
        }
    }

    pub fn put(key: impl Into<String>, value: impl Into<String>, client_id: u64, request_seq: u64) -> Self {
        Op {
            kind: OpKind::Put,
            key: key.into(),
            value: value.into(),
            client_id,
            request_seq,
        }
    }

    pub fn append(key: impl Into<String>, value: impl Into<String>, client_id: u64, request_seq: u64) -> Self {
        Op {
            kind: OpKind::Append,
            key: key.into(),
            value: value.into(),
            client_id,
            request_seq,
        }
    }

    /// Whether `other` is the same logical request (a retry of this one)
    pub fn same_request(&self, other: &Op) -> bool {
        self.client_id == other.client_id && self.request_seq == other.request_seq
    }
}

/// Value placed in a log slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Client(Op),
    /// Gap filler; applying it changes nothing
    Noop,
}

impl Command {
    /// Encode as a slot value
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode a slot value; None if it is not a command
    pub fn decode(value: &str) -> Option<Command> {
        serde_json::from_str(value).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_client_command() {
        let op = Op::append("k", "x", 3, 9);
        let encoded = Command::Client(op.clone()).encode().unwrap();
        assert_eq!(Command::decode(&encoded), Some(Command::Client(op)));
    }

    #[test]
    fn test_noop_distinct_from_ops() {
        let encoded = Command::Noop.encode().unwrap();
        assert_eq!(Command::decode(&encoded), Some(Command::Noop));
    }

    #[test]
    fn test_decode_garbage() {
        assert_eq!(Command::decode("not json"), None);
        assert_eq!(Command::decode(""), None);
    }

    #[test]
    fn test_same_request() {
        let first = Op::put("a", "1", 5, 2);
        assert!(first.same_request(&Op::put("a", "1", 5, 2)));
        assert!(!first.same_request(&Op::put("a", "1", 5, 3)));
        assert!(!first.same_request(&Op::put("a", "1", 6, 2)));
    }
}
