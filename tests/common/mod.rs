use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use changefeed_processor::ChangeFeedProcessor;
use changefeed_processor::ChangeFeedProcessorBuilder;
use changefeed_processor::ChangeFeedProcessorContext;
use changefeed_processor::ChangeFeedProcessorOptions;
use changefeed_processor::FeedContainer;
use changefeed_processor::InMemoryFeedContainer;
use changefeed_processor::InMemoryLeaseContainer;
use changefeed_processor::LeaseContainer;
use changefeed_processor::LeaseError;
use changefeed_processor::Result;
use changefeed_processor::StoredItem;
use parking_lot::Mutex;
use serde_json::json;
use serde_json::Value;

pub const EXPIRATION_MS: u64 = 600;
pub const ACQUIRE_MS: u64 = 100;

pub fn options() -> ChangeFeedProcessorOptions {
    ChangeFeedProcessorOptions {
        lease_renew_interval_ms: 100,
        lease_acquire_interval_ms: ACQUIRE_MS,
        lease_expiration_interval_ms: EXPIRATION_MS,
        feed_poll_delay_ms: 20,
        max_items_per_batch: 50,
        start_from_beginning: true,
        ..Default::default()
    }
}

/// Every document id a processor was handed, in delivery order.
#[derive(Clone, Default)]
pub struct Received(Arc<Mutex<Vec<String>>>);

impl Received {
    pub fn push(
        &self,
        docs: &[Value],
    ) {
        let mut ids = self.0.lock();
        for doc in docs {
            if let Some(id) = doc.get("id").and_then(Value::as_str) {
                ids.push(id.to_string());
            }
        }
    }

    pub fn ids(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn distinct(&self) -> HashSet<String> {
        self.0.lock().iter().cloned().collect()
    }
}

pub fn processor(
    host: &str,
    feed: Arc<dyn FeedContainer>,
    leases: Arc<dyn LeaseContainer>,
    received: Received,
) -> ChangeFeedProcessor {
    ChangeFeedProcessorBuilder::new()
        .host_name(host)
        .feed_container(feed)
        .lease_container(leases)
        .options(options())
        .handle_changes(move |docs: Vec<Value>, _ctx: &ChangeFeedProcessorContext| {
            received.push(&docs);
            Ok(())
        })
        .build()
        .expect("valid processor configuration")
}

/// Writes documents `from..to`, spread over 13 partition keys.
pub fn write(
    feed: &InMemoryFeedContainer,
    from: usize,
    to: usize,
) {
    for i in from..to {
        feed.upsert(&format!("pk{}", i % 13), json!({ "id": i.to_string() }))
            .expect("write succeeds");
    }
}

pub fn expected_ids(
    from: usize,
    to: usize,
) -> HashSet<String> {
    (from..to).map(|i| i.to_string()).collect()
}

pub async fn eventually<F>(
    timeout: Duration,
    condition: F,
) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Lease container view that can be cut off from the shared store, to
/// simulate a host that crashed or lost its network.
pub struct PartitionedLeaseContainer {
    inner: Arc<InMemoryLeaseContainer>,
    cut: AtomicBool,
}

impl PartitionedLeaseContainer {
    pub fn new(inner: Arc<InMemoryLeaseContainer>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            cut: AtomicBool::new(false),
        })
    }

    pub fn cut(&self) {
        self.cut.store(true, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.cut.load(Ordering::SeqCst) {
            return Err(LeaseError::Unavailable("network partition".to_string()).into());
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseContainer for PartitionedLeaseContainer {
    fn id(&self) -> String {
        self.inner.id()
    }

    async fn create_item(
        &self,
        item: Value,
    ) -> Result<StoredItem> {
        self.check()?;
        self.inner.create_item(item).await
    }

    async fn read_item(
        &self,
        id: &str,
    ) -> Result<StoredItem> {
        self.check()?;
        self.inner.read_item(id).await
    }

    async fn replace_item(
        &self,
        item: Value,
        if_match: &str,
    ) -> Result<StoredItem> {
        self.check()?;
        self.inner.replace_item(item, if_match).await
    }

    async fn upsert_item(
        &self,
        item: Value,
    ) -> Result<StoredItem> {
        self.check()?;
        self.inner.upsert_item(item).await
    }

    async fn delete_item(
        &self,
        id: &str,
        if_match: Option<String>,
    ) -> Result<()> {
        self.check()?;
        self.inner.delete_item(id, if_match).await
    }

    async fn query_items_by_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<StoredItem>> {
        self.check()?;
        self.inner.query_items_by_prefix(prefix).await
    }
}
