use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use serde_json::Value;

use super::*;
use crate::test_utils::fast_options;
use crate::test_utils::wait_until;
use crate::ChangeFeedProcessorOptions;
use crate::Error;
use crate::InMemoryFeedContainer;
use crate::InMemoryLeaseContainer;
use crate::ProcessorError;

struct Fixture {
    feed: Arc<InMemoryFeedContainer>,
    leases: Arc<InMemoryLeaseContainer>,
    seen: Arc<parking_lot::Mutex<Vec<Value>>>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            feed: Arc::new(InMemoryFeedContainer::new("orders")),
            leases: Arc::new(InMemoryLeaseContainer::new("leases")),
            seen: Arc::new(parking_lot::Mutex::new(Vec::new())),
        }
    }

    fn processor(
        &self,
        options: ChangeFeedProcessorOptions,
    ) -> ChangeFeedProcessor {
        let sink = self.seen.clone();
        ChangeFeedProcessorBuilder::new()
            .host_name("host-1")
            .feed_container(self.feed.clone())
            .lease_container(self.leases.clone())
            .handle_changes(move |docs: Vec<Value>, _ctx: &ChangeFeedProcessorContext| {
                sink.lock().extend(docs);
                Ok(())
            })
            .options(options)
            .build()
            .unwrap()
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

#[tokio::test]
async fn lifecycle_only_moves_forward() {
    let f = Fixture::new();
    let processor = f.processor(fast_options());

    processor.start().await.unwrap();
    assert!(processor.is_started());
    assert!(matches!(
        processor.start().await,
        Err(Error::Processor(ProcessorError::AlreadyStarted(_)))
    ));

    processor.stop().await.unwrap();
    assert_eq!(processor.state(), LifecycleState::Stopped);
    assert!(!processor.is_started());
    assert!(matches!(
        processor.start().await,
        Err(Error::Processor(ProcessorError::AlreadyStopped(_)))
    ));
    processor.stop().await.unwrap();
}

#[tokio::test]
async fn stop_before_start_is_a_no_op() {
    let f = Fixture::new();
    let processor = f.processor(fast_options());

    processor.stop().await.unwrap();
    assert_eq!(processor.state(), LifecycleState::Created);

    processor.start().await.unwrap();
    processor.stop().await.unwrap();
}

#[tokio::test]
async fn lag_and_state_are_empty_until_started() {
    let f = Fixture::new();
    f.write(3);
    let processor = f.processor(fast_options());

    assert!(processor.get_estimated_lag().await.unwrap().is_empty());
    assert!(processor.get_current_state().await.unwrap().is_empty());
}

#[tokio::test]
async fn processes_changes_and_reports_progress() {
    let f = Fixture::new();
    f.write(5);
    let processor = f.processor(fast_options());
    processor.start().await.unwrap();

    assert!(wait_until(Duration::from_secs(5), || f.seen.lock().len() == 5).await);

    let mut lag = processor.get_estimated_lag().await.unwrap();
    for _ in 0..100 {
        if lag.get("host-1_0") == Some(&0) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        lag = processor.get_estimated_lag().await.unwrap();
    }
    assert_eq!(lag.get("host-1_0"), Some(&0));

    let state = processor.get_current_state().await.unwrap();
    assert_eq!(state.len(), 1);
    assert_eq!(state[0].host_name.as_deref(), Some("host-1"));
    assert_eq!(state[0].continuation_token.as_deref(), Some("lsn:5"));

    processor.stop().await.unwrap();

    let lag = processor.get_estimated_lag().await.unwrap();
    assert_eq!(lag.get("_0"), Some(&0));
    let state = processor.get_current_state().await.unwrap();
    assert_eq!(state[0].host_name, None);
}

#[tokio::test]
async fn lease_container_loss_surfaces_as_fatal_error() {
    let f = Fixture::new();
    f.leases.delete_container();
    let processor = f.processor(fast_options());
    processor.start().await.unwrap();

    assert!(wait_until(Duration::from_secs(5), || processor.fatal_error().is_some()).await);
    assert!(!processor.is_started());
    processor.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_gives_up_after_the_shutdown_timeout() {
    let f = Fixture::new();
    f.write(1);
    let processor = ChangeFeedProcessorBuilder::new()
        .host_name("host-1")
        .feed_container(f.feed.clone())
        .lease_container(f.leases.clone())
        .handle_changes(|_docs: Vec<Value>, _ctx: &ChangeFeedProcessorContext| {
            std::thread::sleep(Duration::from_millis(1_000));
            Ok(())
        })
        .options(ChangeFeedProcessorOptions {
            shutdown_timeout_ms: Some(100),
            ..fast_options()
        })
        .build()
        .unwrap();

    processor.start().await.unwrap();
    // Give the pump time to hand the batch to the delegate.
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(matches!(
        processor.stop().await,
        Err(Error::Processor(ProcessorError::ShutdownTimeout(_)))
    ));
    assert_eq!(processor.state(), LifecycleState::Stopped);
}
