//! In-process cluster tests
//!
//! Three (or five) replicas over the in-memory transports, driven through Clerks
//! while the network is partitioned, replicas are killed, or messages are dropped.

use std::collections::HashMap;
use std::time::Duration;

use kvpaxos::core::kv_server::KvError;
use kvpaxos::core::paxos_core::SlotStatus;
use kvpaxos::state_machine::Op;
use kvpaxos::testing::TestCluster;

const CONVERGE: Duration = Duration::from_secs(5);

/// Every replica that reports a slot decided reports the same value
fn assert_agreement(seq: u64, statuses: &[SlotStatus]) {
    let decided: Vec<&String> = statuses
        .iter()
        .filter_map(|s| match s {
            SlotStatus::Decided(v) => Some(v),
            _ => None,
        })
        .collect();
    assert!(
        decided.windows(2).all(|w| w[0] == w[1]),
        "slot {} decided differently: {:?}",
        seq,
        statuses
    );
}

#[tokio::test]
async fn test_basic_put_get_append() {
    let cluster = TestCluster::new().await;
    let clerk = cluster.clerk();

    assert_eq!(clerk.get("a").await.unwrap(), None);
    clerk.put("a", "x").await.unwrap();
    clerk.append("a", "y").await.unwrap();
    assert_eq!(clerk.get("a").await.unwrap(), Some("xy".to_string()));

    clerk.put("a", "z").await.unwrap();
    assert_eq!(clerk.get("a").await.unwrap(), Some("z".to_string()));

    // A second clerk sees the first one's writes
    let other = cluster.clerk();
    assert_eq!(other.get("a").await.unwrap(), Some("z".to_string()));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_appends_converge() {
    let cluster = TestCluster::new().await;
    let clerk = cluster.clerk();
    clerk.put("x", "1").await.unwrap();

    let clerk1 = cluster.clerk_for(&[1]);
    let clerk2 = cluster.clerk_for(&[2]);
    let (a, b) = tokio::join!(clerk1.append("x", "a"), clerk2.append("x", "b"));
    a.unwrap();
    b.unwrap();

    let value = clerk.get("x").await.unwrap().unwrap();
    assert!(value == "1ab" || value == "1ba", "unexpected value {}", value);

    let converged = cluster.wait_converged(&[1, 2, 3], "x", CONVERGE).await;
    assert_eq!(converged, Some(value));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_isolated_replica_catches_up() {
    let cluster = TestCluster::new().await;
    let clerk = cluster.clerk();
    clerk.put("k", "0").await.unwrap();

    cluster.isolate(3);
    let majority = cluster.clerk_for(&[1, 2]);
    for i in 1..=5 {
        majority.append("k", &i.to_string()).await.unwrap();
    }
    assert_eq!(majority.get("k").await.unwrap(), Some("012345".to_string()));
    assert_ne!(cluster.value(3, "k"), Some("012345".to_string()));

    cluster.heal();
    let converged = cluster.wait_converged(&[1, 2, 3], "k", CONVERGE).await;
    assert_eq!(converged, Some("012345".to_string()));

    // The recovered replica serves requests again
    let lagging = cluster.clerk_for(&[3]);
    assert_eq!(lagging.get("k").await.unwrap(), Some("012345".to_string()));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_minority_stalls_majority_progresses() {
    let cluster = TestCluster::new().await;
    cluster.partition(&[&[1], &[2, 3]]);

    let stalled = cluster.replica(1).server.handle(Op::put("m", "lost?", 77, 1)).await;
    assert_eq!(stalled, Err(KvError::RetryElsewhere));

    let majority = cluster.clerk_for(&[2, 3]);
    majority.put("m", "ok").await.unwrap();
    assert_eq!(majority.get("m").await.unwrap(), Some("ok".to_string()));

    cluster.heal();
    // Replica 1's abandoned proposal may still be decided later, but only once
    // and in a single agreed position
    let value = cluster.wait_converged(&[1, 2, 3], "m", CONVERGE).await;
    assert!(value == Some("ok".to_string()) || value == Some("lost?".to_string()));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_killed_replica_is_skipped() {
    let cluster = TestCluster::new().await;
    let clerk = cluster.clerk();

    cluster.kill(2);
    for i in 0..5 {
        clerk.append("log", &i.to_string()).await.unwrap();
    }
    assert_eq!(clerk.get("log").await.unwrap(), Some("01234".to_string()));

    cluster.revive(2);
    let converged = cluster.wait_converged(&[1, 2, 3], "log", CONVERGE).await;
    assert_eq!(converged, Some("01234".to_string()));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_append_applied_once() {
    let cluster = TestCluster::new().await;

    let op = Op::append("dup", "x", 42, 1);
    cluster.replica(1).server.handle(op.clone()).await.unwrap();
    // Retries of the same request at other replicas
    cluster.replica(2).server.handle(op.clone()).await.unwrap();
    cluster.replica(3).server.handle(op).await.unwrap();

    let clerk = cluster.clerk();
    assert_eq!(clerk.get("dup").await.unwrap(), Some("x".to_string()));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_old_slots_forgotten_after_done() {
    let cluster = TestCluster::new().await;
    let clerk = cluster.clerk();

    for i in 0..12 {
        clerk.put("k", &i.to_string()).await.unwrap();
    }
    cluster.wait_applied(&[1, 2, 3], 11, CONVERGE).await;

    // Every replica reports Done up to what it applied; wait for the broadcasts
    let deadline = tokio::time::Instant::now() + CONVERGE;
    loop {
        let mut all_past = true;
        for replica in &cluster.replicas {
            if replica.server.node().min().await <= 10 {
                all_past = false;
            }
        }
        if all_past {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "min never advanced past 10");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    for status in cluster.slot_statuses(5).await {
        assert_eq!(status, SlotStatus::Forgotten);
    }
    // State is unaffected by reclaiming the log
    assert_eq!(clerk.get("k").await.unwrap(), Some("11".to_string()));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_unreliable_network_agreement_and_idempotence() {
    let cluster = TestCluster::with_replicas(5).await;
    cluster.set_unreliable(true);

    let mut tasks = Vec::new();
    for c in 0..3 {
        let clerk = cluster.clerk();
        tasks.push(tokio::spawn(async move {
            for i in 0..5 {
                clerk.append("log", &format!("[{}.{}]", c, i)).await.unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    cluster.set_unreliable(false);

    let clerk = cluster.clerk();
    let value = clerk.get("log").await.unwrap().unwrap_or_default();

    // Each append took effect exactly once despite dropped replies and retries
    let mut counts: HashMap<String, usize> = HashMap::new();
    for part in value.split(']').filter(|p| !p.is_empty()) {
        *counts.entry(format!("{}]", part)).or_default() += 1;
    }
    assert_eq!(counts.len(), 15, "value was {}", value);
    assert!(counts.values().all(|&n| n == 1), "value was {}", value);

    let ids = cluster.ids();
    let converged = cluster.wait_converged(&ids, "log", CONVERGE).await;
    assert_eq!(converged, Some(value));

    let max = cluster.replica(1).server.node().max().await.unwrap_or(0);
    for seq in 0..=max {
        assert_agreement(seq, &cluster.slot_statuses(seq).await);
    }

    cluster.shutdown().await;
}
