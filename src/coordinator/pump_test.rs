use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;

use super::*;
use crate::test_utils::fast_options;
use crate::test_utils::fast_policy;
use crate::test_utils::lease_store;
use crate::test_utils::recording_delegate;
use crate::test_utils::wait_until;
use crate::ChangeFeedDelegate;
use crate::ChangeFeedProcessorContext;
use crate::DelegateResult;
use crate::FeedRange;
use crate::InMemoryFeedContainer;
use crate::InMemoryLeaseContainer;
use crate::Lease;
use crate::LeaseStoreManager;
use crate::SystemClock;
use crate::DRAINED_PROPERTY;

struct Fixture {
    feed: Arc<InMemoryFeedContainer>,
    store: Arc<LeaseStoreManager>,
}

impl Fixture {
    fn new() -> Self {
        let leases = Arc::new(InMemoryLeaseContainer::new("leases"));
        Self {
            feed: Arc::new(InMemoryFeedContainer::new("feed")),
            store: lease_store(leases, Arc::new(SystemClock)),
        }
    }

    async fn owned_lease(&self) -> Lease {
        let lease = self
            .store
            .create_lease_if_not_exists("0", FeedRange::full(), None, None)
            .await
            .unwrap()
            .unwrap();
        self.store.acquire(&lease, "a").await.unwrap()
    }

    fn pump(
        &self,
        lease: Lease,
        delegate: ChangeFeedDelegate,
        state: Arc<PumpState>,
        cancel: CancellationToken,
    ) -> PartitionPump {
        PartitionPump {
            host_name: "a".to_string(),
            lease,
            store: self.store.clone(),
            feed: self.feed.clone(),
            delegate,
            options: fast_options(),
            checkpoint_policy: fast_policy(),
            state,
            cancel,
            metrics: None,
        }
    }

    fn write(
        &self,
        count: usize,
    ) {
        for i in 0..count {
            self.feed
                .upsert(&format!("pk{i}"), json!({ "id": i.to_string() }))
                .unwrap();
        }
    }
}

/// Fails (or panics) on the first call, records afterwards.
fn flaky_delegate(panic: bool) -> (ChangeFeedDelegate, Arc<Mutex<Vec<Value>>>, Arc<AtomicUsize>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let calls = Arc::new(AtomicUsize::new(0));
    let (sink, counter) = (seen.clone(), calls.clone());
    let delegate = ChangeFeedDelegate::Incremental(Arc::new(
        move |docs: Vec<Value>, _ctx: &ChangeFeedProcessorContext| -> DelegateResult {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                if panic {
                    panic!("delegate blew up");
                }
                return Err("downstream unavailable".into());
            }
            sink.lock().extend(docs);
            Ok(())
        },
    ));
    (delegate, seen, calls)
}

#[tokio::test]
async fn delivers_changes_and_checkpoints_after_the_delegate_returns() {
    let f = Fixture::new();
    f.write(3);
    let lease = f.owned_lease().await;

    let (delegate, seen) = recording_delegate();
    let state = Arc::new(PumpState::new(None));
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(f.pump(lease, delegate, state.clone(), cancel.clone()).run());

    assert!(wait_until(Duration::from_secs(2), || seen.lock().len() == 3).await);
    assert!(wait_until(Duration::from_secs(2), || state.continuation().is_some()).await);

    cancel.cancel();
    assert!(matches!(handle.await.unwrap(), PumpExit::Stopped));

    let stored = f.store.read_lease("0").await.unwrap();
    assert_eq!(stored.continuation_token.as_deref(), Some("lsn:3"));
    assert!(stored.is_owned_by("a"));
}

#[tokio::test]
async fn resumes_from_the_stored_continuation() {
    let f = Fixture::new();
    f.write(2);
    let lease = f.owned_lease().await;
    let lease = f.store.checkpoint(&lease, "a", "lsn:1").await.unwrap();

    let (delegate, seen) = recording_delegate();
    let state = Arc::new(PumpState::new(lease.continuation_token.clone()));
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(f.pump(lease, delegate, state, cancel.clone()).run());

    assert!(wait_until(Duration::from_secs(2), || seen.lock().len() == 1).await);
    cancel.cancel();
    handle.await.unwrap();
    assert_eq!(seen.lock()[0]["id"], "1");
}

#[tokio::test]
#[traced_test]
async fn failed_batch_is_redelivered() {
    let f = Fixture::new();
    f.write(2);
    let lease = f.owned_lease().await;

    let (delegate, seen, calls) = flaky_delegate(false);
    let state = Arc::new(PumpState::new(None));
    let cancel = CancellationToken::new();
    let pump = f.pump(lease, delegate, state, cancel.clone());

    // Driven inline so that the pump's events land in this test's span.
    let watcher = async {
        assert!(wait_until(Duration::from_secs(2), || seen.lock().len() == 2).await);
        cancel.cancel();
    };
    let (exit, ()) = tokio::join!(pump.run(), watcher);
    assert!(matches!(exit, PumpExit::Stopped));

    assert!(calls.load(Ordering::SeqCst) >= 2);
    assert!(logs_contain("the batch will be redelivered"));
    let stored = f.store.read_lease("0").await.unwrap();
    assert_eq!(stored.continuation_token.as_deref(), Some("lsn:2"));
}

#[tokio::test]
async fn delegate_panic_does_not_kill_the_pump() {
    let f = Fixture::new();
    f.write(1);
    let lease = f.owned_lease().await;

    let (delegate, seen, _) = flaky_delegate(true);
    let state = Arc::new(PumpState::new(None));
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(f.pump(lease, delegate, state, cancel.clone()).run());

    assert!(wait_until(Duration::from_secs(2), || seen.lock().len() == 1).await);
    cancel.cancel();
    assert!(matches!(handle.await.unwrap(), PumpExit::Stopped));
}

#[tokio::test]
async fn lease_lost_during_delivery_skips_the_checkpoint() {
    let f = Fixture::new();
    f.write(1);
    let lease = f.owned_lease().await;

    let state = Arc::new(PumpState::new(None));
    let flag = state.clone();
    let delegate = ChangeFeedDelegate::Incremental(Arc::new(
        move |_docs: Vec<Value>, _ctx: &ChangeFeedProcessorContext| -> DelegateResult {
            flag.mark_lost();
            Ok(())
        },
    ));

    let exit = f.pump(lease, delegate, state, CancellationToken::new()).run().await;
    assert!(matches!(exit, PumpExit::Lost));
    let stored = f.store.read_lease("0").await.unwrap();
    assert_eq!(stored.continuation_token, None);
}

#[tokio::test]
async fn checkpoint_against_a_stolen_lease_reports_lost() {
    let f = Fixture::new();
    f.write(1);
    let lease = f.owned_lease().await;

    let released = f.store.release(&lease, "a").await.unwrap();
    f.store.acquire(&released, "b").await.unwrap();

    let (delegate, seen) = recording_delegate();
    let exit = f
        .pump(lease, delegate, Arc::new(PumpState::new(None)), CancellationToken::new())
        .run()
        .await;
    assert!(matches!(exit, PumpExit::Lost));
    assert_eq!(seen.lock().len(), 1);
}

#[tokio::test]
async fn split_partition_exits_with_the_last_continuation() {
    let f = Fixture::new();
    f.write(2);
    let lease = f.owned_lease().await;
    f.feed.split("0").unwrap();

    let (delegate, seen) = recording_delegate();
    let exit = f
        .pump(lease, delegate, Arc::new(PumpState::new(None)), CancellationToken::new())
        .run()
        .await;

    assert_eq!(seen.lock().len(), 2);
    match exit {
        PumpExit::PartitionGone(lease) => {
            assert_eq!(lease.continuation_token.as_deref(), Some("lsn:2"));
        }
        other => panic!("unexpected exit {other:?}"),
    }
}

#[tokio::test]
async fn drained_lease_goes_straight_to_sync() {
    let f = Fixture::new();
    let mut lease = f.owned_lease().await;
    lease.properties = HashMap::from([(DRAINED_PROPERTY.to_string(), "true".to_string())]);

    let (delegate, seen) = recording_delegate();
    let exit = f
        .pump(lease, delegate, Arc::new(PumpState::new(None)), CancellationToken::new())
        .run()
        .await;
    assert!(matches!(exit, PumpExit::PartitionGone(_)));
    assert!(seen.lock().is_empty());
}

#[tokio::test]
async fn deleted_feed_container_is_fatal() {
    let f = Fixture::new();
    let lease = f.owned_lease().await;
    f.feed.delete_container();

    let (delegate, _) = recording_delegate();
    let exit = f
        .pump(lease, delegate, Arc::new(PumpState::new(None)), CancellationToken::new())
        .run()
        .await;
    assert!(matches!(exit, PumpExit::Fatal(e) if e.is_fatal()));
}
