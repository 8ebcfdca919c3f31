use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use changefeed_processor::ChangeFeedProcessor;
use changefeed_processor::InMemoryFeedContainer;
use changefeed_processor::InMemoryLeaseContainer;
use changefeed_processor::SystemClock;
use tokio::time::sleep;
use tokio::time::Instant;
use tracing_test::traced_test;

use crate::common::eventually;
use crate::common::expected_ids;
use crate::common::processor;
use crate::common::write;
use crate::common::PartitionedLeaseContainer;
use crate::common::Received;
use crate::common::ACQUIRE_MS;
use crate::common::EXPIRATION_MS;

async fn owners(processor: &ChangeFeedProcessor) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for state in processor.get_current_state().await.unwrap() {
        if let Some(host) = state.host_name {
            *counts.entry(host).or_insert(0) += 1;
        }
    }
    counts
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leases_spread_evenly_over_three_hosts() {
    let feed = Arc::new(InMemoryFeedContainer::with_partition_count("orders", 6, Arc::new(SystemClock)));
    let leases = Arc::new(InMemoryLeaseContainer::new("leases"));
    write(&feed, 0, 120);

    let received = Received::default();
    let hosts: Vec<ChangeFeedProcessor> = ["a", "b", "c"]
        .iter()
        .map(|h| processor(h, feed.clone(), leases.clone(), received.clone()))
        .collect();
    for host in &hosts {
        host.start().await.unwrap();
    }

    let expected = expected_ids(0, 120);
    assert!(eventually(Duration::from_secs(10), || received.distinct() == expected).await);

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let counts = owners(&hosts[0]).await;
        if counts.len() == 3 && counts.values().all(|c| *c == 2) {
            break;
        }
        assert!(Instant::now() < deadline, "ownership never balanced: {counts:?}");
        sleep(Duration::from_millis(25)).await;
    }

    for host in &hosts {
        host.stop().await.unwrap();
    }
    assert!(owners(&hosts[0]).await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[traced_test]
async fn crashed_host_leases_move_within_expiration_plus_acquire_interval() {
    let feed = Arc::new(InMemoryFeedContainer::with_partition_count("orders", 2, Arc::new(SystemClock)));
    let shared = Arc::new(InMemoryLeaseContainer::new("leases"));
    let a_view = PartitionedLeaseContainer::new(shared.clone());
    write(&feed, 0, 20);

    let received_a = Received::default();
    let a = processor("a", feed.clone(), a_view.clone(), received_a.clone());
    a.start().await.unwrap();
    let expected = expected_ids(0, 20);
    assert!(eventually(Duration::from_secs(5), || received_a.distinct() == expected).await);

    let received_b = Received::default();
    let b = processor("b", feed.clone(), shared.clone(), received_b.clone());
    b.start().await.unwrap();

    a_view.cut();
    let cut_at = Instant::now();
    let bound = Duration::from_millis(EXPIRATION_MS + ACQUIRE_MS);
    let slack = Duration::from_millis(500);
    loop {
        let counts = owners(&b).await;
        if counts.get("b") == Some(&2) {
            break;
        }
        assert!(
            cut_at.elapsed() < bound + slack,
            "leases not reassigned after {:?}: {counts:?}",
            cut_at.elapsed()
        );
        sleep(Duration::from_millis(10)).await;
    }

    write(&feed, 20, 40);
    let expected = expected_ids(20, 40);
    assert!(eventually(Duration::from_secs(5), || received_b.distinct().is_superset(&expected)).await);

    b.stop().await.unwrap();
    a.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stopped_host_hands_over_immediately() {
    let feed = Arc::new(InMemoryFeedContainer::with_partition_count("orders", 4, Arc::new(SystemClock)));
    let leases = Arc::new(InMemoryLeaseContainer::new("leases"));

    let a = processor("a", feed.clone(), leases.clone(), Received::default());
    a.start().await.unwrap();
    assert!(eventually(Duration::from_secs(5), || a.is_started()).await);
    let deadline = Instant::now() + Duration::from_secs(5);
    while owners(&a).await.get("a") != Some(&4) {
        assert!(Instant::now() < deadline, "host a never took every lease");
        sleep(Duration::from_millis(10)).await;
    }

    let received_b = Received::default();
    let b = processor("b", feed.clone(), leases.clone(), received_b.clone());
    b.start().await.unwrap();
    a.stop().await.unwrap();

    // Released leases are taken on the next acquire cycle, long before they
    // would have expired.
    let stopped_at = Instant::now();
    while owners(&b).await.get("b") != Some(&4) {
        assert!(
            stopped_at.elapsed() < Duration::from_millis(EXPIRATION_MS),
            "released leases were not picked up before expiration"
        );
        sleep(Duration::from_millis(10)).await;
    }
    b.stop().await.unwrap();
}
