//! Append-history ordering checks
//!
//! Several clerks append uniquely tagged records to one key while others read it.
//! Because every Append is applied in one agreed order, every value ever observed
//! must be a prefix of the final value, each record must appear exactly once, and
//! each clerk's records must appear in the order that clerk issued them.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use kvpaxos::testing::TestCluster;

const KEY: &str = "history";

/// Split "c0.0;c1.0;c0.1;" into records
fn records(value: &str) -> Vec<&str> {
    value.split(';').filter(|r| !r.is_empty()).collect()
}

fn check_history(final_value: &str, observed: &[String], clients: usize, per_client: usize) {
    for seen in observed {
        assert!(
            final_value.starts_with(seen.as_str()),
            "observed {:?} is not a prefix of final {:?}",
            seen,
            final_value
        );
    }

    let all = records(final_value);
    assert_eq!(all.len(), clients * per_client, "final value {:?}", final_value);

    for c in 0..clients {
        let mine: Vec<&str> = all
            .iter()
            .copied()
            .filter(|r| r.starts_with(&format!("c{}.", c)))
            .collect();
        let expected: Vec<String> = (0..per_client).map(|i| format!("c{}.{}", c, i)).collect();
        assert_eq!(mine, expected, "client {} records out of order or duplicated", c);
    }
}

async fn run_history(cluster: &TestCluster, clients: usize, per_client: usize) -> (String, Vec<String>) {
    let observed = Arc::new(Mutex::new(Vec::new()));

    let mut writers = Vec::new();
    for c in 0..clients {
        let clerk = cluster.clerk();
        writers.push(tokio::spawn(async move {
            for i in 0..per_client {
                clerk.append(KEY, &format!("c{}.{};", c, i)).await.unwrap();
            }
        }));
    }

    let reader = {
        let clerk = cluster.clerk();
        let observed = observed.clone();
        tokio::spawn(async move {
            for _ in 0..10 {
                if let Some(value) = clerk.get(KEY).await.unwrap() {
                    observed.lock().push(value);
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    };

    for writer in writers {
        writer.await.unwrap();
    }
    reader.await.unwrap();

    let final_value = cluster.clerk().get(KEY).await.unwrap().unwrap_or_default();
    let observed = observed.lock().clone();
    (final_value, observed)
}

#[tokio::test]
async fn test_append_history_healthy() {
    let cluster = TestCluster::new().await;
    let (final_value, observed) = run_history(&cluster, 3, 6).await;
    check_history(&final_value, &observed, 3, 6);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_append_history_unreliable() {
    let cluster = TestCluster::new().await;
    cluster.set_unreliable(true);
    let (final_value, observed) = run_history(&cluster, 3, 4).await;
    cluster.set_unreliable(false);
    check_history(&final_value, &observed, 3, 4);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_reads_observe_growing_prefixes() {
    let cluster = TestCluster::new().await;
    let writer = cluster.clerk();
    let reader = cluster.clerk();

    let mut previous = String::new();
    for i in 0..8 {
        writer.append(KEY, &format!("c0.{};", i)).await.unwrap();
        // A read that starts after an append completed sees that append
        let now = reader.get(KEY).await.unwrap().unwrap_or_default();
        assert!(now.starts_with(&previous));
        assert!(now.ends_with(&format!("c0.{};", i)));
        previous = now;
    }

    cluster.shutdown().await;
}
