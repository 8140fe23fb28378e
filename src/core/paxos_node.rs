//! PaxosNode - proposer side of the consensus engine
//!
//! Drives Prepare/Accept rounds for a slot over a `Transport`, counting this
//! replica's own acceptor as one of the votes.

use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use super::ballot::Ballot;
use super::config::PaxosConfig;
use super::paxos_core::{
    AcceptArgs, AcceptResult, Accepted, DecidedArgs, DoneArgs, PaxosCore, PrepareArgs,
    PrepareResult, SlotStatus, StatusArgs, StatusResult,
};
use crate::transport::Transport;

/// Shared reference to PaxosCore
pub type SharedCore = Arc<Mutex<PaxosCore>>;

/// Reasons a single Paxos round can fail
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PaxosError {
    /// Too few replicas answered to form a majority
    #[error("not enough replicas reachable to form a majority")]
    NetworkUnavailable,
    /// Some acceptor had already promised a higher ballot
    #[error("proposal outraced by ballot {ballot}")]
    ProposalOutraced { ballot: Ballot },
    /// The slot was reclaimed by the Done/Min protocol
    #[error("slot {0} has been forgotten")]
    SlotForgotten(u64),
}

/// Outcome of a successful Prepare phase
enum Prepared {
    /// A majority promised; carries the highest-ballot accepted value, if any
    Promised(Option<Accepted>),
    /// Some acceptor already knows the decision
    Decided(String),
}

/// Running count of replies for one phase
struct Tally {
    majority: usize,
    total: usize,
    granted: usize,
    rejected: usize,
    highest_reject: Option<Ballot>,
}

impl Tally {
    fn new(majority: usize, total: usize) -> Self {
        Tally {
            majority,
            total,
            granted: 0,
            rejected: 0,
            highest_reject: None,
        }
    }

    fn reject(&mut self, promised: Ballot) {
        self.rejected += 1;
        if self.highest_reject.map_or(true, |b| promised > b) {
            self.highest_reject = Some(promised);
        }
    }

    fn won(&self) -> bool {
        self.granted >= self.majority
    }

    /// Enough rejections that a majority of grants is no longer possible
    fn lost(&self) -> bool {
        self.rejected > self.total - self.majority
    }

    fn failure(&self) -> PaxosError {
        match self.highest_reject {
            Some(ballot) => PaxosError::ProposalOutraced { ballot },
            None => PaxosError::NetworkUnavailable,
        }
    }
}

/// Proposer/learner driver for one replica
pub struct PaxosNode<T: Transport> {
    id: u64,
    peers: Vec<u64>,
    core: SharedCore,
    transport: Arc<T>,
    config: PaxosConfig,
}

impl<T: Transport + 'static> PaxosNode<T> {
    /// Create a new PaxosNode with default config
    pub fn new(core: PaxosCore, transport: T) -> Self {
        Self::with_config(core, transport, PaxosConfig::default())
    }

    /// Create a new PaxosNode with custom config
    pub fn with_config(core: PaxosCore, transport: T, config: PaxosConfig) -> Self {
        Self {
            id: core.id,
            peers: core.peers.clone(),
            core: Arc::new(Mutex::new(core)),
            transport: Arc::new(transport),
            config,
        }
    }

    /// This replica's id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Get a shared reference to the core (for incoming RPC handling)
    pub fn shared_core(&self) -> SharedCore {
        self.core.clone()
    }

    /// Drive agreement on `seq`, proposing `value` if nothing has been accepted yet.
    ///
    /// Returns the decided value, which may differ from `value` when a competing
    /// proposal won. Retries forever with fresh ballots; callers bound it with a timeout.
    pub async fn propose(&self, seq: u64, value: String) -> Result<String, PaxosError> {
        loop {
            match self.status(seq).await {
                SlotStatus::Decided(decided) => return Ok(decided),
                SlotStatus::Forgotten => return Err(PaxosError::SlotForgotten(seq)),
                SlotStatus::Pending => {}
            }

            match self.propose_round(seq, &value).await {
                Ok(decided) => return Ok(decided),
                Err(PaxosError::SlotForgotten(seq)) => return Err(PaxosError::SlotForgotten(seq)),
                Err(err) => {
                    debug!(node = self.id, seq, %err, "round failed, retrying");
                    tokio::time::sleep(self.config.random_backoff()).await;
                }
            }
        }
    }

    /// One Prepare/Accept attempt with a fresh ballot
    pub async fn propose_round(&self, seq: u64, value: &str) -> Result<String, PaxosError> {
        let (ballot, done, majority) = {
            let mut core = self.core.lock().await;
            (core.next_ballot(seq), core.done_watermark(), core.majority())
        };
        trace!(node = self.id, seq, %ballot, "starting round");

        let prepare = PrepareArgs {
            seq,
            ballot,
            from: self.id,
            done,
        };
        let chosen = match self.prepare_phase(prepare, majority).await? {
            Prepared::Decided(decided) => return Ok(decided),
            Prepared::Promised(Some(accepted)) => accepted.value,
            Prepared::Promised(None) => value.to_string(),
        };

        let accept = AcceptArgs {
            seq,
            ballot,
            value: chosen,
            from: self.id,
            done,
        };
        let decided = self.accept_phase(accept, majority).await?;

        let newly_learned = self.core.lock().await.learn(seq, decided.clone());
        if newly_learned {
            debug!(node = self.id, seq, %ballot, "slot decided");
        }
        self.broadcast_decided(seq, decided.clone(), done);
        Ok(decided)
    }

    async fn prepare_phase(&self, args: PrepareArgs, majority: usize) -> Result<Prepared, PaxosError> {
        let seq = args.seq;
        let mut tally = Tally::new(majority, self.peers.len() + 1);
        let mut highest: Option<Accepted> = None;

        let local = self.core.lock().await.handle_prepare(&args);
        let mut replies = vec![local];

        let mut futures: FuturesUnordered<_> = self
            .peers
            .iter()
            .map(|&peer_id| {
                let args = args.clone();
                let transport = &self.transport;
                async move { transport.prepare(peer_id, args).await }
            })
            .collect();

        loop {
            for reply in replies.drain(..) {
                match reply {
                    PrepareResult::Promise { accepted } => {
                        tally.granted += 1;
                        if let Some(accepted) = accepted {
                            if highest.as_ref().map_or(true, |h| accepted.ballot > h.ballot) {
                                highest = Some(accepted);
                            }
                        }
                    }
                    PrepareResult::Reject { promised } => {
                        tally.reject(promised);
                        self.core.lock().await.observe_ballot(seq, promised);
                    }
                    PrepareResult::Decided { value } => {
                        self.core.lock().await.learn(seq, value.clone());
                        return Ok(Prepared::Decided(value));
                    }
                    PrepareResult::Forgotten => return Err(PaxosError::SlotForgotten(seq)),
                }
            }

            if tally.won() {
                return Ok(Prepared::Promised(highest));
            }
            if tally.lost() {
                return Err(tally.failure());
            }

            // Stragglers are dropped once the outcome is known; their acceptors
            // still process the request, which is harmless
            match futures.next().await {
                Some(Ok(reply)) => replies.push(reply),
                Some(Err(_)) => {}
                None => return Err(tally.failure()),
            }
        }
    }

    async fn accept_phase(&self, args: AcceptArgs, majority: usize) -> Result<String, PaxosError> {
        let seq = args.seq;
        let mut tally = Tally::new(majority, self.peers.len() + 1);

        let local = self.core.lock().await.handle_accept(&args);
        let mut replies = vec![local];

        let mut futures: FuturesUnordered<_> = self
            .peers
            .iter()
            .map(|&peer_id| {
                let args = args.clone();
                let transport = &self.transport;
                async move { transport.accept(peer_id, args).await }
            })
            .collect();

        loop {
            for reply in replies.drain(..) {
                match reply {
                    AcceptResult::Accepted => tally.granted += 1,
                    AcceptResult::Reject { promised } => {
                        tally.reject(promised);
                        self.core.lock().await.observe_ballot(seq, promised);
                    }
                    AcceptResult::Decided { value } => {
                        self.core.lock().await.learn(seq, value.clone());
                        return Ok(value);
                    }
                    AcceptResult::Forgotten => return Err(PaxosError::SlotForgotten(seq)),
                }
            }

            if tally.won() {
                return Ok(args.value);
            }
            if tally.lost() {
                return Err(tally.failure());
            }

            match futures.next().await {
                Some(Ok(reply)) => replies.push(reply),
                Some(Err(_)) => {}
                None => return Err(tally.failure()),
            }
        }
    }

    /// Tell every peer about a decision without waiting for them
    fn broadcast_decided(&self, seq: u64, value: String, done: Option<u64>) {
        let transport = self.transport.clone();
        let peers = self.peers.clone();
        let from = self.id;
        tokio::spawn(async move {
            let mut futures: FuturesUnordered<_> = peers
                .iter()
                .map(|&peer_id| {
                    let args = DecidedArgs {
                        seq,
                        value: value.clone(),
                        from,
                        done,
                    };
                    let transport = &transport;
                    async move { transport.decided(peer_id, args).await }
                })
                .collect();
            while futures.next().await.is_some() {}
        });
    }

    /// Ask peers whether `seq` has been decided and adopt the first decision found.
    /// Returns the resulting local status.
    pub async fn learn(&self, seq: u64) -> SlotStatus {
        let local = self.status(seq).await;
        if local != SlotStatus::Pending {
            return local;
        }

        let mut futures: FuturesUnordered<_> = self
            .peers
            .iter()
            .map(|&peer_id| {
                let transport = &self.transport;
                async move { transport.status(peer_id, StatusArgs { seq }).await }
            })
            .collect();

        while let Some(result) = futures.next().await {
            if let Ok(StatusResult {
                status: SlotStatus::Decided(value),
                ..
            }) = result
            {
                if self.core.lock().await.learn(seq, value) {
                    debug!(node = self.id, seq, "learned decision from peer");
                }
                break;
            }
        }

        self.status(seq).await
    }

    /// Send this replica's Done watermark and highest known sequence to every peer
    pub async fn broadcast_done(&self) {
        let args = {
            let core = self.core.lock().await;
            DoneArgs {
                from: self.id,
                done: core.done_watermark(),
                max_seq: core.max(),
            }
        };

        let mut futures: FuturesUnordered<_> = self
            .peers
            .iter()
            .map(|&peer_id| {
                let args = args.clone();
                let transport = &self.transport;
                async move { transport.done(peer_id, args).await }
            })
            .collect();
        while futures.next().await.is_some() {}
    }

    /// Local status of `seq`
    pub async fn status(&self, seq: u64) -> SlotStatus {
        self.core.lock().await.status(seq)
    }

    /// This replica no longer needs slots `<= seq`
    pub async fn done(&self, seq: u64) {
        self.core.lock().await.done(seq);
    }

    /// Lowest sequence number still retained
    pub async fn min(&self) -> u64 {
        self.core.lock().await.min()
    }

    /// Highest sequence number seen
    pub async fn max(&self) -> Option<u64> {
        self.core.lock().await.max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use crate::transport::inmemory::{create_cluster_with_network, InMemoryTransport, Network};

    struct TestNodes {
        nodes: HashMap<u64, Arc<PaxosNode<InMemoryTransport>>>,
        network: Arc<Network>,
    }

    impl TestNodes {
        fn node(&self, id: u64) -> Arc<PaxosNode<InMemoryTransport>> {
            self.nodes[&id].clone()
        }

        async fn status(&self, id: u64, seq: u64) -> SlotStatus {
            self.nodes[&id].status(seq).await
        }
    }

    /// Start `count` nodes whose inboxes are served in the background
    fn start_nodes(count: u64) -> TestNodes {
        let node_ids: Vec<u64> = (1..=count).collect();
        let network = Network::new();
        let (mut transports, mut handles) =
            create_cluster_with_network(&node_ids, network.clone(), Some(Duration::from_millis(100)));

        let config = PaxosConfig::default().with_backoff(Duration::from_millis(1), Duration::from_millis(10));
        let mut nodes = HashMap::new();
        for &id in &node_ids {
            let peers = node_ids.iter().copied().filter(|&p| p != id).collect();
            let node = PaxosNode::with_config(
                PaxosCore::new(id, peers),
                transports.remove(&id).unwrap(),
                config.clone(),
            );
            handles.remove(&id).unwrap().serve(node.shared_core());
            nodes.insert(id, Arc::new(node));
        }
        TestNodes { nodes, network }
    }

    /// Wait until `id` reports `seq` decided (Decided broadcasts are asynchronous)
    async fn wait_decided(nodes: &TestNodes, id: u64, seq: u64) -> String {
        for _ in 0..200 {
            if let SlotStatus::Decided(value) = nodes.status(id, seq).await {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("node {} never learned slot {}", id, seq);
    }

    #[tokio::test]
    async fn test_single_proposer_decides() {
        let nodes = start_nodes(3);
        let decided = nodes.node(1).propose(0, "a".to_string()).await.unwrap();
        assert_eq!(decided, "a");

        for id in 1..=3 {
            assert_eq!(wait_decided(&nodes, id, 0).await, "a");
        }
    }

    #[tokio::test]
    async fn test_single_node_cluster() {
        let nodes = start_nodes(1);
        assert_eq!(nodes.node(1).propose(0, "solo".to_string()).await.unwrap(), "solo");
        assert_eq!(nodes.node(1).max().await, Some(0));
    }

    #[tokio::test]
    async fn test_concurrent_proposers_agree() {
        let nodes = start_nodes(3);
        for seq in 0..5 {
            let (n1, n2, n3) = (nodes.node(1), nodes.node(2), nodes.node(3));
            let (a, b, c) = tokio::join!(
                n1.propose(seq, format!("a{}", seq)),
                n2.propose(seq, format!("b{}", seq)),
                n3.propose(seq, format!("c{}", seq)),
            );
            let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());
            assert_eq!(a, b);
            assert_eq!(b, c);
            // Validity: the decision is one of the proposals
            assert!([format!("a{}", seq), format!("b{}", seq), format!("c{}", seq)].contains(&a));
        }
    }

    #[tokio::test]
    async fn test_adopts_previously_accepted_value() {
        let nodes = start_nodes(3);
        // Nodes 2 and 3 accepted "old" under an earlier ballot that never finished
        for id in [2, 3] {
            let core = nodes.node(id).shared_core();
            let mut core = core.lock().await;
            let result = core.handle_accept(&AcceptArgs {
                seq: 0,
                ballot: Ballot::new(1, 2),
                value: "old".to_string(),
                from: 2,
                done: None,
            });
            assert_eq!(result, AcceptResult::Accepted);
        }

        let decided = nodes.node(1).propose(0, "new".to_string()).await.unwrap();
        assert_eq!(decided, "old");
    }

    #[tokio::test]
    async fn test_minority_cannot_decide() {
        let nodes = start_nodes(3);
        nodes.network.isolate(1);

        let result = nodes.node(1).propose_round(0, "lonely").await;
        assert_eq!(result, Err(PaxosError::NetworkUnavailable));

        let bounded = tokio::time::timeout(Duration::from_millis(200), nodes.node(1).propose(0, "lonely".to_string())).await;
        assert!(bounded.is_err(), "propose must not return without a majority");
        assert_eq!(nodes.status(1, 0).await, SlotStatus::Pending);
    }

    #[tokio::test]
    async fn test_majority_progresses_with_one_isolated() {
        let nodes = start_nodes(3);
        nodes.network.isolate(3);

        assert_eq!(nodes.node(1).propose(0, "x".to_string()).await.unwrap(), "x");
        assert_eq!(wait_decided(&nodes, 2, 0).await, "x");
        assert_eq!(nodes.status(3, 0).await, SlotStatus::Pending);

        // After healing, node 3 discovers the decision by asking its peers
        nodes.network.heal();
        assert_eq!(nodes.node(3).learn(0).await, SlotStatus::Decided("x".to_string()));
    }

    #[tokio::test]
    async fn test_outraced_proposer_retries_with_higher_ballot() {
        let nodes = start_nodes(3);
        // Node 3's acceptor promised a high ballot, so node 1's first attempt loses there
        {
            let core = nodes.node(3).shared_core();
            core.lock().await.handle_prepare(&PrepareArgs {
                seq: 0,
                ballot: Ballot::new(50, 3),
                from: 3,
                done: None,
            });
        }
        {
            let core = nodes.node(2).shared_core();
            core.lock().await.handle_prepare(&PrepareArgs {
                seq: 0,
                ballot: Ballot::new(50, 3),
                from: 3,
                done: None,
            });
        }

        let first = nodes.node(1).propose_round(0, "v").await;
        assert_eq!(first, Err(PaxosError::ProposalOutraced { ballot: Ballot::new(50, 3) }));

        // The retry outbids the observed ballot and wins
        assert_eq!(nodes.node(1).propose(0, "v".to_string()).await.unwrap(), "v");
    }

    #[tokio::test]
    async fn test_learn_from_peer() {
        let nodes = start_nodes(3);
        nodes.node(2).shared_core().lock().await.learn(7, "seven".to_string());

        assert_eq!(nodes.node(1).learn(7).await, SlotStatus::Decided("seven".to_string()));
        assert_eq!(nodes.status(1, 7).await, SlotStatus::Decided("seven".to_string()));
        assert_eq!(nodes.node(1).learn(8).await, SlotStatus::Pending);
    }

    #[tokio::test]
    async fn test_forgotten_after_everyone_done() {
        let nodes = start_nodes(3);
        for seq in 0..=12 {
            nodes.node(1).propose(seq, format!("v{}", seq)).await.unwrap();
        }
        for id in 1..=3 {
            wait_decided(&nodes, id, 12).await;
        }

        for id in 1..=3 {
            nodes.node(id).done(10).await;
        }
        for id in 1..=3 {
            nodes.node(id).broadcast_done().await;
        }

        for id in 1..=3 {
            assert_eq!(nodes.node(id).min().await, 11);
            assert_eq!(nodes.status(id, 5).await, SlotStatus::Forgotten);
            assert_eq!(nodes.status(id, 11).await, SlotStatus::Decided("v11".to_string()));
        }

        let result = nodes.node(2).propose(5, "late".to_string()).await;
        assert_eq!(result, Err(PaxosError::SlotForgotten(5)));
    }

    #[tokio::test]
    async fn test_min_waits_for_slowest_replica() {
        let nodes = start_nodes(3);
        for seq in 0..3 {
            nodes.node(1).propose(seq, format!("v{}", seq)).await.unwrap();
        }
        nodes.node(1).done(2).await;
        nodes.node(2).done(2).await;
        nodes.node(1).broadcast_done().await;
        nodes.node(2).broadcast_done().await;

        // Node 3 has not reported yet
        assert_eq!(nodes.node(1).min().await, 0);
        assert_eq!(nodes.status(1, 1).await, SlotStatus::Decided("v1".to_string()));
    }

    #[tokio::test]
    async fn test_unreliable_network_agreement() {
        let nodes = start_nodes(3);
        nodes.network.set_unreliable(true);

        for seq in 0..6 {
            let (n1, n2, n3) = (nodes.node(1), nodes.node(2), nodes.node(3));
            let (a, b, c) = tokio::join!(
                n1.propose(seq, format!("a{}", seq)),
                n2.propose(seq, format!("b{}", seq)),
                n3.propose(seq, format!("c{}", seq)),
            );
            assert_eq!(a.as_ref().unwrap(), b.as_ref().unwrap());
            assert_eq!(b.as_ref().unwrap(), c.as_ref().unwrap());
        }
        nodes.network.set_unreliable(false);
    }
}
