use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::ChangeFeedProcessorState;
use super::LifecycleState;
use super::ProcessorConfig;
use crate::LagEstimator;
use crate::Lease;
use crate::LeaseOwnershipCoordinator;
use crate::LeaseStoreManager;
use crate::ProcessorError;
use crate::Result;

enum Lifecycle {
    Created,
    Started {
        shutdown: CancellationToken,
        task: JoinHandle<Result<()>>,
    },
    Stopped,
}

/// Distributes the partitions of a change feed over every processor sharing
/// the same lease container and feeds their changes to the delegate.
///
/// `start()` hands control to a [`LeaseOwnershipCoordinator`] running in the
/// background; `stop()` lets in-flight batches finish, then releases the
/// leases of this host. A stopped processor cannot be restarted.
pub struct ChangeFeedProcessor {
    config: Arc<ProcessorConfig>,
    store: Arc<LeaseStoreManager>,
    estimator: LagEstimator,
    lifecycle: Mutex<Lifecycle>,
    coordinator: ArcSwapOption<LeaseOwnershipCoordinator>,
}

impl std::fmt::Debug for ChangeFeedProcessor {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("ChangeFeedProcessor")
            .field("host_name", &self.config.host_name)
            .field("state", &self.state())
            .finish()
    }
}

impl ChangeFeedProcessor {
    pub(crate) fn new(config: Arc<ProcessorConfig>) -> Self {
        let store = Arc::new(LeaseStoreManager::new(
            config.leases.clone(),
            &config.options.lease_prefix,
            &config.feed.id(),
            config.clock.clone(),
            config.retry.lease_store,
            config.options.lease_expiration_interval(),
        ));
        let estimator = LagEstimator::new(
            config.feed.clone(),
            config.delegate.mode(),
            config.options.initial_start_from(),
        );

        Self {
            config,
            store,
            estimator,
            lifecycle: Mutex::new(Lifecycle::Created),
            coordinator: ArcSwapOption::empty(),
        }
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn state(&self) -> LifecycleState {
        match *self.lifecycle.lock() {
            Lifecycle::Created => LifecycleState::Created,
            Lifecycle::Started { .. } => LifecycleState::Started,
            Lifecycle::Stopped => LifecycleState::Stopped,
        }
    }

    /// Starts competing for leases. Returns as soon as the coordinator is
    /// scheduled; leases are acquired in the background.
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Created => {}
            Lifecycle::Started { .. } => {
                return Err(ProcessorError::AlreadyStarted(self.config.host_name.clone()).into());
            }
            Lifecycle::Stopped => {
                return Err(ProcessorError::AlreadyStopped(self.config.host_name.clone()).into());
            }
        }

        let shutdown = CancellationToken::new();
        let coordinator = Arc::new(LeaseOwnershipCoordinator::new(
            self.config.host_name.clone(),
            self.store.clone(),
            self.config.feed.clone(),
            self.config.delegate.clone(),
            self.config.options.clone(),
            self.config.retry.clone(),
            self.config.metrics.clone(),
            shutdown.clone(),
        ));
        let task = tokio::spawn(coordinator.clone().run());

        self.coordinator.store(Some(coordinator));
        *lifecycle = Lifecycle::Started { shutdown, task };
        info!(host = %self.config.host_name, mode = ?self.config.mode(), "change feed processor started");
        Ok(())
    }

    /// Stops the processor. Does nothing unless it is running.
    ///
    /// Waits for in-flight batches and the release of this host's leases,
    /// bounded by `shutdown_timeout_ms` when set. On timeout the leases are
    /// left to expire.
    pub async fn stop(&self) -> Result<()> {
        let (shutdown, task) = {
            let mut lifecycle = self.lifecycle.lock();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
                Lifecycle::Started { shutdown, task } => (shutdown, task),
                other => {
                    *lifecycle = other;
                    return Ok(());
                }
            }
        };

        info!(host = %self.config.host_name, "stopping change feed processor");
        shutdown.cancel();

        let joined = match self.config.options.shutdown_timeout() {
            Some(limit) => match tokio::time::timeout(limit, task).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(host = %self.config.host_name, "shutdown did not finish within {limit:?}");
                    return Err(ProcessorError::ShutdownTimeout(limit).into());
                }
            },
            None => task.await,
        };

        match joined? {
            Ok(()) => {}
            Err(e) => debug!(host = %self.config.host_name, "coordinator ended with: {e}"),
        }
        info!(host = %self.config.host_name, "change feed processor stopped");
        Ok(())
    }

    /// True while started and not stopped by a fatal error.
    pub fn is_started(&self) -> bool {
        self.state() == LifecycleState::Started && self.fatal_error().is_none()
    }

    /// The error that stopped the coordinator, if any.
    pub fn fatal_error(&self) -> Option<String> {
        self.coordinator
            .load_full()
            .and_then(|coordinator| coordinator.fatal_error())
    }

    /// Undelivered changes per lease, keyed `"{owner}_{lease_token}"` (owner
    /// empty for unowned leases). Empty if the processor was never started.
    pub async fn get_estimated_lag(&self) -> Result<HashMap<String, u64>> {
        let mut lag = HashMap::new();
        for (lease, estimate) in self.estimate_all().await? {
            let owner = lease.owner.as_deref().unwrap_or_default();
            lag.insert(format!("{owner}_{}", lease.lease_token), estimate);
        }
        Ok(lag)
    }

    /// One snapshot per lease: owner, continuation and estimated lag.
    pub async fn get_current_state(&self) -> Result<Vec<ChangeFeedProcessorState>> {
        Ok(self
            .estimate_all()
            .await?
            .into_iter()
            .map(|(lease, estimated_lag)| ChangeFeedProcessorState {
                host_name: lease.owner,
                lease_token: lease.lease_token,
                continuation_token: lease.continuation_token,
                estimated_lag,
            })
            .collect())
    }

    async fn estimate_all(&self) -> Result<Vec<(Lease, u64)>> {
        if self.state() == LifecycleState::Created {
            return Ok(Vec::new());
        }

        let leases = self.store.list_leases().await?;
        let mut estimates = Vec::with_capacity(leases.len());
        for lease in leases {
            let lag = self.estimator.estimate(&lease).await?;
            if let Some(m) = &self.config.metrics {
                m.estimated_lag
                    .with_label_values(&[&self.config.host_name, &lease.lease_token])
                    .set(lag as i64);
            }
            estimates.push((lease, lag));
        }
        Ok(estimates)
    }
}
