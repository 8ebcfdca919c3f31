use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;

use crate::BackoffPolicy;
use crate::ChangeFeedDelegate;
use crate::ChangeFeedProcessorContext;
use crate::ChangeFeedProcessorOptions;
use crate::Clock;
use crate::DelegateResult;
use crate::FeedRange;
use crate::HostRegistration;
use crate::Lease;
use crate::LeaseContainer;
use crate::LeaseStoreManager;

pub(crate) const EXPIRATION_MS: u64 = 60_000;

pub(crate) fn fast_policy() -> BackoffPolicy {
    BackoffPolicy {
        max_retries: 3,
        timeout_ms: 1_000,
        base_delay_ms: 1,
        max_delay_ms: 5,
    }
}

pub(crate) fn lease_store(
    container: Arc<dyn LeaseContainer>,
    clock: Arc<dyn Clock>,
) -> Arc<LeaseStoreManager> {
    Arc::new(LeaseStoreManager::new(
        container,
        "",
        "feed",
        clock,
        fast_policy(),
        Duration::from_millis(EXPIRATION_MS),
    ))
}

/// Millisecond-scale intervals so that loops tick quickly in tests.
pub(crate) fn fast_options() -> ChangeFeedProcessorOptions {
    ChangeFeedProcessorOptions {
        lease_renew_interval_ms: 50,
        lease_acquire_interval_ms: 50,
        lease_expiration_interval_ms: 400,
        feed_poll_delay_ms: 10,
        max_items_per_batch: 100,
        start_from_beginning: true,
        ..Default::default()
    }
}

pub(crate) fn lease(
    token: &str,
    owner: Option<&str>,
    timestamp: u64,
) -> Lease {
    Lease {
        id: format!("feed..lease.{token}"),
        lease_token: token.to_string(),
        feed_range: FeedRange::full(),
        owner: owner.map(str::to_string),
        continuation_token: None,
        timestamp,
        properties: HashMap::new(),
        etag: String::new(),
    }
}

pub(crate) fn host(
    name: &str,
    last_activity: u64,
) -> HostRegistration {
    HostRegistration {
        id: format!("feed..host.{name}"),
        host_name: name.to_string(),
        owned_leases: Vec::new(),
        last_activity,
    }
}

/// Polls `condition` every few milliseconds; false if it is still unmet
/// after `timeout`.
pub(crate) async fn wait_until<F>(
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
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Delegate that records every document it receives.
pub(crate) fn recording_delegate() -> (ChangeFeedDelegate, Arc<Mutex<Vec<Value>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let delegate = ChangeFeedDelegate::Incremental(Arc::new(move |docs: Vec<Value>, _ctx: &ChangeFeedProcessorContext| -> DelegateResult {
        sink.lock().extend(docs);
        Ok(())
    }));
    (delegate, seen)
}
