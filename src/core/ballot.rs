//! Paxos proposal numbers

use std::fmt;

use serde::{Deserialize, Serialize};

/// A proposal number.
///
/// Ordered by `round` first and by the proposing replica's id second, so two
/// replicas can never pick the same ballot. Field order matters for the derived `Ord`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ballot {
    /// Monotonic round counter
    pub round: u64,
    /// Id of the replica that owns this ballot
    pub node: u64,
}

impl Ballot {
    pub fn new(round: u64, node: u64) -> Self {
        Ballot { round, node }
    }

    /// Smallest ballot owned by `node` that is strictly greater than `seen`
    pub fn successor(seen: Option<Ballot>, node: u64) -> Self {
        match seen {
            None => Ballot::new(1, node),
            Some(b) if node > b.node => Ballot::new(b.round, node),
            Some(b) => Ballot::new(b.round.saturating_add(1), node),
        }
    }
}

impl fmt::Display for Ballot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.round, self.node)
    }
}
