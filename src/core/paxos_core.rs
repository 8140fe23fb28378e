//! Single-decree Paxos per log slot
//!
//! `PaxosCore` holds the acceptor and learner state of one replica for every live
//! slot. It is synchronous and transport-agnostic: `PaxosNode` drives the proposer
//! side over a `Transport` and feeds replies back in here.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use super::ballot::Ballot;
use super::done_tracker::DoneTracker;

/// Lifecycle of a slot as seen by one replica
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// No Prepare/Accept has reached this replica yet
    Unseen,
    /// This replica has promised (and possibly accepted) some ballot
    Promised,
    /// The value is fixed
    Decided,
    /// Reclaimed by the Done/Min protocol
    Forgotten,
}

/// Answer to a local or remote status query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotStatus {
    Decided(String),
    Pending,
    Forgotten,
}

/// A value an acceptor has accepted, with the ballot it was accepted under
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accepted {
    pub ballot: Ballot,
    pub value: String,
}

/// Acceptor and learner state for a single slot
#[derive(Debug, Clone, Default)]
pub struct Slot {
    /// Highest ballot this acceptor promised
    pub promised: Option<Ballot>,
    /// Highest ballot accepted and its value
    pub accepted: Option<Accepted>,
    /// Decided value, fixed once set
    pub decided: Option<String>,
    /// Highest ballot observed for this slot from any proposer, own included
    highest_seen: Option<Ballot>,
}

impl Slot {
    fn state(&self) -> SlotState {
        if self.decided.is_some() {
            SlotState::Decided
        } else if self.promised.is_some() {
            SlotState::Promised
        } else {
            SlotState::Unseen
        }
    }

    fn observe(&mut self, ballot: Ballot) {
        if self.highest_seen.map_or(true, |b| ballot > b) {
            self.highest_seen = Some(ballot);
        }
    }
}

/// Prepare (phase 1a) RPC arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareArgs {
    pub seq: u64,
    pub ballot: Ballot,
    /// Sending replica
    pub from: u64,
    /// Sender's Done watermark (piggy-backed)
    pub done: Option<u64>,
}

/// Prepare (phase 1b) RPC results
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrepareResult {
    /// Promise not to accept lower ballots, with the highest accepted value if any
    Promise { accepted: Option<Accepted> },
    /// Already promised a ballot at least as high
    Reject { promised: Ballot },
    /// Slot is already decided here
    Decided { value: String },
    /// Slot was reclaimed here
    Forgotten,
}

/// Accept (phase 2a) RPC arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptArgs {
    pub seq: u64,
    pub ballot: Ballot,
    pub value: String,
    pub from: u64,
    pub done: Option<u64>,
}

/// Accept (phase 2b) RPC results
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcceptResult {
    Accepted,
    Reject { promised: Ballot },
    Decided { value: String },
    Forgotten,
}

/// Decided RPC arguments (learner notification)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecidedArgs {
    pub seq: u64,
    pub value: String,
    pub from: u64,
    pub done: Option<u64>,
}

/// Decided RPC results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecidedResult {
    pub ack: bool,
}

/// Done RPC arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoneArgs {
    pub from: u64,
    pub done: Option<u64>,
    /// Highest sequence the sender has seen, so lagging replicas know to catch up
    pub max_seq: Option<u64>,
}

/// Done RPC results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoneResult {
    pub ack: bool,
}

/// Status RPC arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusArgs {
    pub seq: u64,
}

/// Status RPC results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResult {
    pub seq: u64,
    pub status: SlotStatus,
}

/// Acceptor/learner state of one replica (sync, transport-agnostic)
pub struct PaxosCore {
    /// Unique identifier for this replica
    pub id: u64,
    /// IDs of the other replicas
    pub peers: Vec<u64>,
    /// Live slots, keyed by sequence number
    slots: BTreeMap<u64, Slot>,
    /// Done watermarks of every replica, self included
    done: DoneTracker,
    /// Highest sequence number seen in any message or local call
    max_seq: Option<u64>,
}

impl PaxosCore {
    pub fn new(id: u64, peers: Vec<u64>) -> Self {
        let done = DoneTracker::new(std::iter::once(id).chain(peers.iter().copied()));
        PaxosCore {
            id,
            peers,
            slots: BTreeMap::new(),
            done,
            max_seq: None,
        }
    }

    /// Number of replicas forming a majority of the whole group
    pub fn majority(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    fn is_forgotten(&self, seq: u64) -> bool {
        seq < self.done.min()
    }

    fn observe_seq(&mut self, seq: u64) {
        if self.max_seq.map_or(true, |m| seq > m) {
            self.max_seq = Some(seq);
        }
    }

    fn observe_done(&mut self, from: u64, done: Option<u64>) {
        if let Some(seq) = done {
            if self.done.record(from, seq) {
                self.forget();
            }
        }
    }

    /// Slot for `seq`, created on first contact. Callers check `is_forgotten` first.
    fn slot_mut(&mut self, seq: u64) -> &mut Slot {
        self.observe_seq(seq);
        self.slots.entry(seq).or_default()
    }

    /// Handle a Prepare request: promise iff the ballot beats every earlier promise
    pub fn handle_prepare(&mut self, args: &PrepareArgs) -> PrepareResult {
        self.observe_done(args.from, args.done);
        if self.is_forgotten(args.seq) {
            return PrepareResult::Forgotten;
        }

        let id = self.id;
        let slot = self.slot_mut(args.seq);
        slot.observe(args.ballot);

        if let Some(value) = &slot.decided {
            return PrepareResult::Decided { value: value.clone() };
        }

        match slot.promised {
            Some(promised) if args.ballot <= promised => {
                debug!(node = id, seq = args.seq, ballot = %args.ballot, promised = %promised, "rejecting prepare");
                PrepareResult::Reject { promised }
            }
            _ => {
                slot.promised = Some(args.ballot);
                PrepareResult::Promise {
                    accepted: slot.accepted.clone(),
                }
            }
        }
    }

    /// Handle an Accept request: accept iff no higher ballot has been promised
    pub fn handle_accept(&mut self, args: &AcceptArgs) -> AcceptResult {
        self.observe_done(args.from, args.done);
        if self.is_forgotten(args.seq) {
            return AcceptResult::Forgotten;
        }

        let id = self.id;
        let slot = self.slot_mut(args.seq);
        slot.observe(args.ballot);

        if let Some(value) = &slot.decided {
            return AcceptResult::Decided { value: value.clone() };
        }

        match slot.promised {
            Some(promised) if args.ballot < promised => {
                debug!(node = id, seq = args.seq, ballot = %args.ballot, promised = %promised, "rejecting accept");
                AcceptResult::Reject { promised }
            }
            _ => {
                slot.promised = Some(args.ballot);
                slot.accepted = Some(Accepted {
                    ballot: args.ballot,
                    value: args.value.clone(),
                });
                AcceptResult::Accepted
            }
        }
    }

    /// Handle a Decided notification from a proposer
    pub fn handle_decided(&mut self, args: &DecidedArgs) -> DecidedResult {
        self.observe_done(args.from, args.done);
        self.learn(args.seq, args.value.clone());
        DecidedResult { ack: true }
    }

    /// Handle a Done broadcast
    pub fn handle_done(&mut self, args: &DoneArgs) -> DoneResult {
        if let Some(seq) = args.max_seq {
            self.observe_seq(seq);
        }
        self.observe_done(args.from, args.done);
        DoneResult { ack: true }
    }

    /// Handle a Status query from a peer
    pub fn handle_status(&self, args: &StatusArgs) -> StatusResult {
        StatusResult {
            seq: args.seq,
            status: self.status(args.seq),
        }
    }

    /// Record the decided value for `seq`.
    /// Returns true if this replica did not know the decision before.
    pub fn learn(&mut self, seq: u64, value: String) -> bool {
        if self.is_forgotten(seq) {
            return false;
        }
        let id = self.id;
        let slot = self.slot_mut(seq);
        match &slot.decided {
            Some(existing) => {
                if *existing != value {
                    error!(node = id, seq, existing = %existing, conflicting = %value, "agreement violated: conflicting decision");
                }
                false
            }
            None => {
                slot.decided = Some(value);
                true
            }
        }
    }

    /// Local status of `seq`; never touches the network
    pub fn status(&self, seq: u64) -> SlotStatus {
        if self.is_forgotten(seq) {
            return SlotStatus::Forgotten;
        }
        match self.slots.get(&seq).and_then(|s| s.decided.as_ref()) {
            Some(value) => SlotStatus::Decided(value.clone()),
            None => SlotStatus::Pending,
        }
    }

    /// Lifecycle state of `seq` on this replica
    pub fn slot_state(&self, seq: u64) -> SlotState {
        if self.is_forgotten(seq) {
            return SlotState::Forgotten;
        }
        self.slots.get(&seq).map_or(SlotState::Unseen, Slot::state)
    }

    /// Pick a fresh ballot for proposing at `seq`, strictly above anything seen there
    pub fn next_ballot(&mut self, seq: u64) -> Ballot {
        let id = self.id;
        let slot = self.slot_mut(seq);
        let ballot = Ballot::successor(slot.highest_seen, id);
        slot.observe(ballot);
        ballot
    }

    /// Remember a ballot seen in a peer's reply so the next attempt outbids it
    pub fn observe_ballot(&mut self, seq: u64, ballot: Ballot) {
        if !self.is_forgotten(seq) {
            self.slot_mut(seq).observe(ballot);
        }
    }

    /// This replica no longer needs slots `<= seq`
    pub fn done(&mut self, seq: u64) {
        if self.done.record(self.id, seq) {
            self.forget();
        }
    }

    /// This replica's own Done watermark
    pub fn done_watermark(&self) -> Option<u64> {
        self.done.watermark(self.id)
    }

    /// Lowest sequence number still retained; everything below is forgotten
    pub fn min(&self) -> u64 {
        self.done.min()
    }

    /// Highest sequence number this replica has heard of
    pub fn max(&self) -> Option<u64> {
        self.max_seq
    }

    /// Number of slots currently held in memory
    pub fn live_slots(&self) -> usize {
        self.slots.len()
    }

    /// Drop every slot below the Min watermark
    fn forget(&mut self) {
        let min = self.done.min();
        self.slots = self.slots.split_off(&min);
    }
}
