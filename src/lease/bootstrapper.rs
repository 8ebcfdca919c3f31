use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::LeaseStoreManager;
use crate::utils::task_with_timeout_and_exponential_backoff;
use crate::BackoffPolicy;
use crate::FeedContainer;
use crate::Result;

/// Creates one lease per partition the first time any host starts.
///
/// Exactly one host populates the store: it takes the initialisation lock,
/// creates the missing leases, writes the info marker and drops the lock.
/// Everyone else waits until the marker shows up.
#[derive(Debug)]
pub struct Bootstrapper {
    store: Arc<LeaseStoreManager>,
    feed: Arc<dyn FeedContainer>,
    host_name: String,
    lock_ttl: Duration,
    wait_interval: Duration,
    policy: BackoffPolicy,
}

impl Bootstrapper {
    pub fn new(
        store: Arc<LeaseStoreManager>,
        feed: Arc<dyn FeedContainer>,
        host_name: impl Into<String>,
        lock_ttl: Duration,
        wait_interval: Duration,
        policy: BackoffPolicy,
    ) -> Self {
        Self {
            store,
            feed,
            host_name: host_name.into(),
            lock_ttl,
            wait_interval,
            policy,
        }
    }

    /// Returns once the store is initialised, `shutdown` fires, or a fatal
    /// error occurs. Transient failures are retried every `wait_interval`.
    pub async fn initialize(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        loop {
            match self.try_initialize().await {
                Ok(true) => return Ok(()),
                Ok(false) => debug!(host = %self.host_name, "lease store is being initialised by another host"),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(host = %self.host_name, "lease store initialisation failed: {e}"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = sleep(self.wait_interval) => {}
            }
        }
    }

    async fn try_initialize(&self) -> Result<bool> {
        if self.store.is_initialized().await? {
            return Ok(true);
        }

        let ttl_ms = self.lock_ttl.as_millis() as u64;
        if !self.store.try_acquire_init_lock(&self.host_name, ttl_ms).await? {
            return Ok(false);
        }

        let created = self.create_leases().await;
        let marked = match created {
            Ok(count) => {
                info!(host = %self.host_name, "lease store initialised with {count} new leases");
                self.store.mark_initialized(&self.host_name).await
            }
            Err(e) => Err(e),
        };
        let released = self.store.release_init_lock(&self.host_name).await;

        marked?;
        released?;
        Ok(true)
    }

    async fn create_leases(&self) -> Result<usize> {
        let ranges =
            task_with_timeout_and_exponential_backoff(|| self.feed.read_partition_key_ranges(), self.policy).await?;

        let mut created = 0;
        for range in ranges {
            let lease = task_with_timeout_and_exponential_backoff(
                || {
                    self.store
                        .create_lease_if_not_exists(&range.id, range.range.clone(), None, None)
                },
                self.policy,
            )
            .await?;
            if lease.is_some() {
                created += 1;
            }
        }
        Ok(created)
    }
}
