use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::utils::task_with_timeout_and_exponential_backoff;
use crate::BackoffPolicy;
use crate::ChangeFeedDelegate;
use crate::ChangeFeedProcessorContext;
use crate::ChangeFeedProcessorOptions;
use crate::ChangeFeedRequest;
use crate::ChangeFeedStartFrom;
use crate::Error;
use crate::FeedContainer;
use crate::FeedError;
use crate::FeedPage;
use crate::Lease;
use crate::LeaseError;
use crate::LeaseStoreManager;
use crate::ProcessorMetrics;

/// State shared between a running pump and the coordinator.
#[derive(Debug, Default)]
pub(crate) struct PumpState {
    lost: AtomicBool,
    continuation: Mutex<Option<String>>,
}

impl PumpState {
    pub(crate) fn new(continuation: Option<String>) -> Self {
        Self {
            lost: AtomicBool::new(false),
            continuation: Mutex::new(continuation),
        }
    }

    /// Tells the pump not to checkpoint the batch it is delivering.
    pub(crate) fn mark_lost(&self) {
        self.lost.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    pub(crate) fn continuation(&self) -> Option<String> {
        self.continuation.lock().clone()
    }

    fn set_continuation(
        &self,
        continuation: String,
    ) {
        *self.continuation.lock() = Some(continuation);
    }
}

#[derive(Debug)]
pub(crate) enum PumpExit {
    /// Cancelled by shutdown or a voluntary release
    Stopped,
    /// Ownership moved to another host
    Lost,
    /// The partition was split or merged away and fully read; carries the
    /// lease with the last continuation reached
    PartitionGone(Lease),
    Fatal(Error),
}

/// Reads one partition and feeds its changes to the delegate.
///
/// The continuation is persisted only after the delegate returned
/// successfully, so a batch is redelivered until it is acknowledged.
#[derive(Debug)]
pub(crate) struct PartitionPump {
    pub(crate) host_name: String,
    pub(crate) lease: Lease,
    pub(crate) store: Arc<LeaseStoreManager>,
    pub(crate) feed: Arc<dyn FeedContainer>,
    pub(crate) delegate: ChangeFeedDelegate,
    pub(crate) options: ChangeFeedProcessorOptions,
    pub(crate) checkpoint_policy: BackoffPolicy,
    pub(crate) state: Arc<PumpState>,
    pub(crate) cancel: CancellationToken,
    pub(crate) metrics: Option<ProcessorMetrics>,
}

impl PartitionPump {
    pub(crate) async fn run(mut self) -> PumpExit {
        if self.lease.is_drained() {
            return PumpExit::PartitionGone(self.lease);
        }
        debug!(host = %self.host_name, lease_token = %self.lease.lease_token, "partition pump started");

        loop {
            if self.cancel.is_cancelled() {
                return PumpExit::Stopped;
            }

            let request = ChangeFeedRequest {
                partition_key_range_id: self.lease.lease_token.clone(),
                start_from: self.start_from(),
                max_item_count: self.options.max_items_per_batch,
                mode: self.delegate.mode(),
            };

            let read = tokio::select! {
                _ = self.cancel.cancelled() => return PumpExit::Stopped,
                read = self.feed.read_change_feed(&request) => read,
            };

            match read {
                Ok(page) if page.items.is_empty() => {
                    trace!(lease_token = %self.lease.lease_token, "no new changes");
                    self.state.set_continuation(page.continuation);
                    if !self.idle(self.options.feed_poll_delay()).await {
                        return PumpExit::Stopped;
                    }
                }
                Ok(page) => {
                    if let Some(exit) = self.process(page).await {
                        return exit;
                    }
                }
                Err(Error::Feed(FeedError::PartitionGone { .. })) => {
                    debug!(lease_token = %self.lease.lease_token, "partition is gone");
                    let mut lease = self.lease.clone();
                    if let Some(continuation) = self.state.continuation() {
                        lease.continuation_token = Some(continuation);
                    }
                    return PumpExit::PartitionGone(lease);
                }
                Err(Error::Feed(FeedError::Throttled { retry_after })) => {
                    debug!(lease_token = %self.lease.lease_token, "throttled, retrying in {retry_after:?}");
                    if !self.idle(retry_after).await {
                        return PumpExit::Stopped;
                    }
                }
                Err(e) if e.is_fatal() => return PumpExit::Fatal(e),
                Err(e) => {
                    warn!(lease_token = %self.lease.lease_token, "change feed read failed: {e}");
                    if !self.idle(self.options.feed_poll_delay()).await {
                        return PumpExit::Stopped;
                    }
                }
            }
        }
    }

    fn start_from(&self) -> ChangeFeedStartFrom {
        match self.state.continuation() {
            Some(token) => ChangeFeedStartFrom::Continuation(token),
            None => self.options.initial_start_from(),
        }
    }

    /// Delivers one page and checkpoints it. `Some` ends the pump.
    async fn process(
        &mut self,
        page: FeedPage,
    ) -> Option<PumpExit> {
        let lease_token = self.lease.lease_token.clone();
        let item_count = page.items.len();
        let context = ChangeFeedProcessorContext {
            host_name: self.host_name.clone(),
            lease_token: lease_token.clone(),
            feed_range: self.lease.feed_range.clone(),
        };

        let started = Instant::now();
        let delivered = self.delegate.deliver(page.items, context).await;
        if let Some(m) = &self.metrics {
            m.delivery_latency_ms
                .with_label_values(&[&self.host_name])
                .observe(started.elapsed().as_secs_f64() * 1000.0);
        }

        if let Err(e) = delivered {
            warn!(host = %self.host_name, %lease_token, "{e}; the batch will be redelivered");
            if let Some(m) = &self.metrics {
                m.delegate_failures
                    .with_label_values(&[&self.host_name, &lease_token])
                    .inc();
            }
            return self.stop_unless_idle(self.options.feed_poll_delay()).await;
        }

        if let Some(m) = &self.metrics {
            m.batches_delivered
                .with_label_values(&[&self.host_name, &lease_token])
                .inc();
            m.items_delivered
                .with_label_values(&[&self.host_name, &lease_token])
                .inc_by(item_count as u64);
        }

        if self.state.is_lost() {
            debug!(%lease_token, "lease lost during delivery, skipping checkpoint");
            return Some(PumpExit::Lost);
        }

        let checkpoint = task_with_timeout_and_exponential_backoff(
            || {
                self.store
                    .checkpoint(&self.lease, &self.host_name, &page.continuation)
            },
            self.checkpoint_policy,
        )
        .await;

        match checkpoint {
            Ok(lease) => {
                trace!(%lease_token, continuation = %page.continuation, "checkpointed");
                self.lease = lease;
                self.state.set_continuation(page.continuation);
                if let Some(m) = &self.metrics {
                    m.checkpoints.with_label_values(&[&self.host_name, &lease_token]).inc();
                }
                None
            }
            Err(Error::Lease(LeaseError::Lost { .. })) => {
                self.state.mark_lost();
                Some(PumpExit::Lost)
            }
            Err(e) if e.is_fatal() => Some(PumpExit::Fatal(e)),
            Err(e) => {
                warn!(%lease_token, "checkpoint failed: {e}; the batch will be redelivered");
                self.stop_unless_idle(self.options.feed_poll_delay()).await
            }
        }
    }

    /// Sleeps for `delay`; false if cancelled first.
    async fn idle(
        &self,
        delay: Duration,
    ) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = sleep(delay) => true,
        }
    }

    async fn stop_unless_idle(
        &self,
        delay: Duration,
    ) -> Option<PumpExit> {
        if self.idle(delay).await {
            None
        } else {
            Some(PumpExit::Stopped)
        }
    }
}
