use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use changefeed_processor::ChangeFeedOperationType;
use changefeed_processor::ChangeFeedProcessorBuilder;
use changefeed_processor::ChangeFeedProcessorContext;
use changefeed_processor::ChangeFeedProcessorItem;
use changefeed_processor::ChangeFeedProcessorOptions;
use changefeed_processor::InMemoryFeedContainer;
use changefeed_processor::InMemoryLeaseContainer;
use changefeed_processor::SystemClock;
use parking_lot::Mutex;
use serde_json::json;
use serde_json::Value;
use tokio::time::sleep;
use tokio::time::Instant;

use crate::common::eventually;
use crate::common::expected_ids;
use crate::common::options;
use crate::common::processor;
use crate::common::write;
use crate::common::PartitionedLeaseContainer;
use crate::common::Received;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_delegate_gets_the_same_batch_again() {
    let feed = Arc::new(InMemoryFeedContainer::new("orders"));
    let leases = Arc::new(InMemoryLeaseContainer::new("leases"));
    write(&feed, 0, 10);

    let received = Received::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let (sink, counter) = (received.clone(), calls.clone());
    let processor = ChangeFeedProcessorBuilder::new()
        .host_name("a")
        .feed_container(feed.clone())
        .lease_container(leases.clone())
        .options(options())
        .handle_changes(move |docs: Vec<Value>, _ctx: &ChangeFeedProcessorContext| {
            if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                return Err("downstream is down".into());
            }
            sink.push(&docs);
            Ok(())
        })
        .build()
        .unwrap();
    processor.start().await.unwrap();

    let expected = expected_ids(0, 10);
    assert!(eventually(Duration::from_secs(5), || received.distinct() == expected).await);
    assert!(calls.load(Ordering::SeqCst) >= 4);
    // Nothing was skipped and the acknowledged batch was delivered once.
    assert_eq!(received.ids().len(), 10);

    processor.stop().await.unwrap();
    let state = processor.get_current_state().await.unwrap();
    assert_eq!(state[0].continuation_token.as_deref(), Some("lsn:10"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn batch_delivered_but_not_checkpointed_is_redelivered_elsewhere() {
    let feed = Arc::new(InMemoryFeedContainer::new("orders"));
    let shared = Arc::new(InMemoryLeaseContainer::new("leases"));
    let a_view = PartitionedLeaseContainer::new(shared.clone());
    write(&feed, 0, 10);

    // Host "a" loses the lease container right after its delegate returns,
    // so the checkpoint of that batch never lands.
    let received_a = Received::default();
    let (sink, view) = (received_a.clone(), a_view.clone());
    let a = ChangeFeedProcessorBuilder::new()
        .host_name("a")
        .feed_container(feed.clone())
        .lease_container(a_view.clone())
        .options(options())
        .handle_changes(move |docs: Vec<Value>, _ctx: &ChangeFeedProcessorContext| {
            sink.push(&docs);
            view.cut();
            Ok(())
        })
        .build()
        .unwrap();
    a.start().await.unwrap();
    let expected = expected_ids(0, 10);
    assert!(eventually(Duration::from_secs(5), || received_a.distinct() == expected).await);

    let received_b = Received::default();
    let b = processor("b", feed.clone(), shared.clone(), received_b.clone());
    b.start().await.unwrap();

    assert!(eventually(Duration::from_secs(5), || received_b.distinct() == expected).await);

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let state = b.get_current_state().await.unwrap();
        if state[0].continuation_token.as_deref() == Some("lsn:10") {
            break;
        }
        assert!(Instant::now() < deadline, "checkpoint never advanced: {state:?}");
        sleep(Duration::from_millis(10)).await;
    }

    b.stop().await.unwrap();
    a.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn split_partition_keeps_delivering() {
    let feed = Arc::new(InMemoryFeedContainer::new("orders"));
    let leases = Arc::new(InMemoryLeaseContainer::new("leases"));
    write(&feed, 0, 30);

    let received = Received::default();
    let p = processor("a", feed.clone(), leases.clone(), received.clone());
    p.start().await.unwrap();
    assert!(eventually(Duration::from_secs(5), || received.distinct() == expected_ids(0, 30)).await);

    let (left, right) = feed.split("0").unwrap();
    write(&feed, 30, 60);
    assert!(eventually(Duration::from_secs(5), || received.distinct() == expected_ids(0, 60)).await);

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let mut tokens: Vec<_> = p
            .get_current_state()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.lease_token)
            .collect();
        tokens.sort();
        if tokens == vec![left.clone(), right.clone()] {
            break;
        }
        assert!(Instant::now() < deadline, "child leases missing: {tokens:?}");
        sleep(Duration::from_millis(10)).await;
    }

    p.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn merged_partitions_keep_delivering() {
    let feed = Arc::new(InMemoryFeedContainer::with_partition_count("orders", 2, Arc::new(SystemClock)));
    let leases = Arc::new(InMemoryLeaseContainer::new("leases"));
    write(&feed, 0, 30);

    let received = Received::default();
    let p = processor("a", feed.clone(), leases.clone(), received.clone());
    p.start().await.unwrap();
    assert!(eventually(Duration::from_secs(5), || received.distinct() == expected_ids(0, 30)).await);

    let child = feed.merge("0", "1").unwrap();
    write(&feed, 30, 45);
    assert!(eventually(Duration::from_secs(5), || received.distinct() == expected_ids(0, 45)).await);

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let state = p.get_current_state().await.unwrap();
        if state.len() == 1 && state[0].lease_token == child {
            break;
        }
        assert!(Instant::now() < deadline, "merged lease missing: {state:?}");
        sleep(Duration::from_millis(10)).await;
    }

    p.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn full_fidelity_consumer_sees_deletes() {
    let feed = Arc::new(InMemoryFeedContainer::new("orders"));
    let leases = Arc::new(InMemoryLeaseContainer::new("leases"));

    let items: Arc<Mutex<Vec<ChangeFeedProcessorItem>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = items.clone();
    let p = ChangeFeedProcessorBuilder::new()
        .host_name("a")
        .feed_container(feed.clone())
        .lease_container(leases.clone())
        .options(ChangeFeedProcessorOptions {
            start_from_beginning: false,
            ..options()
        })
        .handle_full_fidelity_changes(move |batch: Vec<ChangeFeedProcessorItem>, _ctx: &ChangeFeedProcessorContext| {
            sink.lock().extend(batch);
            Ok(())
        })
        .build()
        .unwrap();
    p.start().await.unwrap();

    // Starting "now": wait until the pump has taken its first cursor.
    let deadline = Instant::now() + Duration::from_secs(5);
    while p.get_current_state().await.unwrap().iter().all(|s| s.host_name.is_none()) {
        assert!(Instant::now() < deadline, "lease never acquired");
        sleep(Duration::from_millis(10)).await;
    }
    sleep(Duration::from_millis(200)).await;

    feed.upsert("pk", json!({ "id": "order-1", "total": 10 })).unwrap();
    feed.upsert("pk", json!({ "id": "order-1", "total": 12 })).unwrap();
    feed.delete("pk", "order-1").unwrap();

    assert!(eventually(Duration::from_secs(5), || items.lock().len() == 3).await);
    let operations: Vec<_> = items.lock().iter().map(|i| i.metadata.operation_type).collect();
    assert_eq!(
        operations,
        vec![
            ChangeFeedOperationType::Create,
            ChangeFeedOperationType::Replace,
            ChangeFeedOperationType::Delete
        ]
    );
    assert!(items.lock()[2].current.is_none());

    p.stop().await.unwrap();
}
