//! Done/Min watermark bookkeeping
//!
//! Every replica reports the highest sequence number it has applied and no longer
//! needs. Slots at or below the smallest reported watermark are unreachable for
//! every replica and can be reclaimed.

use std::collections::HashMap;

use tracing::warn;

/// Per-replica "safe to forget" watermarks
#[derive(Debug, Clone)]
pub struct DoneTracker {
    /// Highest sequence each known replica has marked done (None = nothing yet)
    done: HashMap<u64, Option<u64>>,
}

impl DoneTracker {
    /// Create a tracker for the given replica ids (self included)
    pub fn new(replicas: impl IntoIterator<Item = u64>) -> Self {
        DoneTracker {
            done: replicas.into_iter().map(|id| (id, None)).collect(),
        }
    }

    /// Record that `replica` no longer needs any slot `<= seq`.
    /// Watermarks only move forward; returns true if the watermark advanced.
    pub fn record(&mut self, replica: u64, seq: u64) -> bool {
        match self.done.get_mut(&replica) {
            Some(current) => {
                if current.map_or(true, |c| seq > c) {
                    *current = Some(seq);
                    true
                } else {
                    false
                }
            }
            None => {
                warn!(replica, seq, "ignoring Done from unknown replica");
                false
            }
        }
    }

    /// Watermark last reported by `replica`
    pub fn watermark(&self, replica: u64) -> Option<u64> {
        self.done.get(&replica).copied().flatten()
    }

    /// Lowest sequence number that is still retained.
    /// Every slot below this value is forgotten.
    pub fn min(&self) -> u64 {
        let mut lowest: Option<u64> = None;
        for watermark in self.done.values() {
            match watermark {
                None => return 0,
                Some(w) => lowest = Some(lowest.map_or(*w, |l| l.min(*w))),
            }
        }
        lowest.map_or(0, |l| l.saturating_add(1))
    }
}
