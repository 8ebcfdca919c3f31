use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use nanoid::nanoid;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio::time::sleep;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use super::EqualPartitionsBalancingStrategy;
use super::PartitionPump;
use super::PartitionSynchronizer;
use super::PumpExit;
use super::PumpState;
use super::SyncOutcome;
use crate::Bootstrapper;
use crate::ChangeFeedDelegate;
use crate::ChangeFeedProcessorOptions;
use crate::Error;
use crate::FeedContainer;
use crate::Lease;
use crate::LeaseError;
use crate::LeaseStoreManager;
use crate::ProcessorMetrics;
use crate::Result;
use crate::RetryPolicies;

/// Registrations idle for this many expiration intervals are deleted.
const STALE_HOST_EXPIRATIONS: u64 = 5;

#[derive(Debug)]
struct PumpHandle {
    id: String,
    state: Arc<PumpState>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Debug)]
struct OwnedLease {
    lease: Lease,
    /// `None` while the lease waits for merge siblings or a sync retry
    pump: Option<PumpHandle>,
}

/// Competes for leases on behalf of one host and runs a pump per owned lease.
///
/// Two loops drive it: the acquire loop balances ownership against the other
/// hosts, the renew loop heartbeats this host and keeps its leases alive. A
/// fatal error in either loop, or in a pump, cancels `shutdown`; `run` then
/// stops the pumps and releases every lease it still holds.
#[derive(Debug)]
pub struct LeaseOwnershipCoordinator {
    host_name: String,
    store: Arc<LeaseStoreManager>,
    feed: Arc<dyn FeedContainer>,
    delegate: ChangeFeedDelegate,
    options: ChangeFeedProcessorOptions,
    retry: RetryPolicies,
    balancer: EqualPartitionsBalancingStrategy,
    synchronizer: PartitionSynchronizer,
    metrics: Option<ProcessorMetrics>,

    owned: DashMap<String, OwnedLease>,
    recently_owned: Mutex<HashSet<String>>,
    acquire_guard: tokio::sync::Mutex<()>,
    fatal: Mutex<Option<String>>,
    shutdown: CancellationToken,
}

impl LeaseOwnershipCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        host_name: impl Into<String>,
        store: Arc<LeaseStoreManager>,
        feed: Arc<dyn FeedContainer>,
        delegate: ChangeFeedDelegate,
        options: ChangeFeedProcessorOptions,
        retry: RetryPolicies,
        metrics: Option<ProcessorMetrics>,
        shutdown: CancellationToken,
    ) -> Self {
        let host_name = host_name.into();
        let balancer = EqualPartitionsBalancingStrategy::new(
            host_name.clone(),
            options.max_scale_count,
            options.lease_expiration_interval(),
        );
        let synchronizer = PartitionSynchronizer::new(host_name.clone(), store.clone(), feed.clone());

        Self {
            host_name,
            store,
            feed,
            delegate,
            options,
            retry,
            balancer,
            synchronizer,
            metrics,
            owned: DashMap::new(),
            recently_owned: Mutex::new(HashSet::new()),
            acquire_guard: tokio::sync::Mutex::new(()),
            fatal: Mutex::new(None),
            shutdown,
        }
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    /// Tokens of the leases this host currently holds.
    pub fn owned_lease_tokens(&self) -> Vec<String> {
        let mut tokens: Vec<String> = self.owned.iter().map(|e| e.key().clone()).collect();
        tokens.sort();
        tokens
    }

    pub fn fatal_error(&self) -> Option<String> {
        self.fatal.lock().clone()
    }

    /// Bootstraps the lease store, then runs the acquire and renew loops
    /// until shutdown.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let bootstrapper = Bootstrapper::new(
            self.store.clone(),
            self.feed.clone(),
            self.host_name.clone(),
            self.options.lease_expiration_interval(),
            self.options.lease_acquire_interval(),
            self.retry.bootstrap,
        );
        if let Err(e) = bootstrapper.initialize(&self.shutdown).await {
            self.record_fatal(&e);
            return Err(e);
        }
        if self.shutdown.is_cancelled() {
            return Ok(());
        }

        if let Err(e) = self.store.register_host(&self.host_name, Vec::new()).await {
            warn!(host = %self.host_name, "host registration failed: {e}");
        }
        info!(host = %self.host_name, "lease ownership coordinator started");

        let acquire = tokio::spawn(self.clone().run_acquire_loop());
        let renew = tokio::spawn(self.clone().run_renew_loop());
        let (acquire, renew) = tokio::join!(acquire, renew);
        if let Err(e) = acquire.and(renew) {
            error!(host = %self.host_name, "coordinator loop panicked: {e}");
        }

        self.release_all().await;
        if let Err(e) = self.store.unregister_host(&self.host_name).await {
            warn!(host = %self.host_name, "host unregistration failed: {e}");
        }
        info!(host = %self.host_name, "lease ownership coordinator stopped");

        match self.fatal_error() {
            Some(reason) => Err(Error::Fatal(reason)),
            None => Ok(()),
        }
    }

    async fn run_acquire_loop(self: Arc<Self>) {
        let mut ticker = interval(self.options.lease_acquire_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.acquire_available_leases().await {
                        self.on_cycle_error("acquire", e);
                    }
                }
            }
        }
    }

    async fn run_renew_loop(self: Arc<Self>) {
        let mut ticker = interval(self.options.lease_renew_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.renew_owned_leases().await {
                        self.on_cycle_error("renew", e);
                    }
                }
            }
        }
    }

    fn on_cycle_error(
        &self,
        cycle: &str,
        e: Error,
    ) {
        if e.is_fatal() {
            self.record_fatal(&e);
        } else {
            warn!(host = %self.host_name, "{cycle} cycle failed: {e}");
        }
    }

    /// Keeps the first fatal error and stops the coordinator.
    fn record_fatal(
        &self,
        e: &Error,
    ) {
        error!(host = %self.host_name, "fatal error, stopping: {e}");
        {
            let mut fatal = self.fatal.lock();
            if fatal.is_none() {
                *fatal = Some(e.to_string());
            }
        }
        self.shutdown.cancel();
    }

    /// One acquire cycle: list leases and hosts, compute this host's share,
    /// give back the surplus and take what is missing.
    #[instrument(skip(self), fields(host = %self.host_name))]
    pub async fn acquire_available_leases(self: &Arc<Self>) -> Result<()> {
        let _guard = self.acquire_guard.lock().await;
        if self.shutdown.is_cancelled() {
            return Ok(());
        }

        let max_idle_ms = self.store.expiration_ms().saturating_mul(STALE_HOST_EXPIRATIONS);
        match self.store.remove_stale_hosts(max_idle_ms).await {
            Ok(0) => {}
            Ok(removed) => debug!(host = %self.host_name, removed, "pruned stale host registrations"),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => warn!(host = %self.host_name, "pruning host registrations failed: {e}"),
        }

        let now = self.store.now_millis();
        let leases = self.store.list_leases().await?;
        let hosts = self.store.list_hosts().await?;
        let recently_owned = self.recently_owned.lock().clone();
        let plan = self.balancer.plan(&leases, &hosts, &recently_owned, now);
        debug!(
            host = %self.host_name,
            leases = leases.len(),
            active_hosts = plan.active_hosts,
            target = plan.target,
            acquire = plan.to_acquire.len(),
            release = plan.to_release.len(),
            "acquire cycle"
        );

        for lease in &plan.to_release {
            self.release_lease(lease).await?;
        }

        for lease in plan.to_acquire {
            if self.shutdown.is_cancelled() {
                break;
            }
            match self.store.acquire(&lease, &self.host_name).await {
                Ok(acquired) => {
                    info!(host = %self.host_name, lease_token = %acquired.lease_token, "lease acquired");
                    self.recently_owned.lock().remove(&acquired.lease_token);
                    if let Some(m) = &self.metrics {
                        m.leases_acquired.with_label_values(&[&self.host_name]).inc();
                    }
                    self.start_pump(acquired);
                }
                Err(Error::Lease(LeaseError::Lost { lease_token })) => {
                    debug!(host = %self.host_name, %lease_token, "another host took the lease first");
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(host = %self.host_name, lease_token = %lease.lease_token, "acquire failed: {e}"),
            }
        }
        Ok(())
    }

    /// One renew cycle: heartbeat the host registration, then renew every
    /// owned lease. Leases that moved to another host stop their pump.
    #[instrument(skip(self), fields(host = %self.host_name))]
    pub async fn renew_owned_leases(&self) -> Result<()> {
        let owned: Vec<(String, Lease)> = self
            .owned
            .iter()
            .map(|e| (e.key().clone(), e.value().lease.clone()))
            .collect();

        let tokens = owned.iter().map(|(token, _)| token.clone()).collect();
        match self.store.register_host(&self.host_name, tokens).await {
            Ok(()) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => warn!(host = %self.host_name, "heartbeat failed: {e}"),
        }

        let expiration_ms = self.store.expiration_ms();
        for (token, lease) in owned {
            match self.store.renew(&lease, &self.host_name).await {
                Ok(renewed) => {
                    if let Some(mut entry) = self.owned.get_mut(&token) {
                        entry.lease = renewed;
                    }
                }
                Err(Error::Lease(LeaseError::Lost { .. })) => {
                    info!(host = %self.host_name, lease_token = %token, "lease lost to another host");
                    self.lose(&token);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(host = %self.host_name, lease_token = %token, "renew failed: {e}");
                    if lease.is_expired(self.store.now_millis(), expiration_ms) {
                        info!(host = %self.host_name, lease_token = %token, "lease expired without renewal");
                        self.lose(&token);
                    }
                }
            }
        }
        Ok(())
    }

    /// Spawns a pump for `lease` unless one is already running.
    fn start_pump(
        self: &Arc<Self>,
        lease: Lease,
    ) {
        let token = lease.lease_token.clone();
        if let Some(mut entry) = self.owned.get_mut(&token) {
            entry.lease = lease.clone();
            if entry.pump.as_ref().is_some_and(|p| !p.handle.is_finished()) {
                return;
            }
        }

        let pump_id = nanoid!();
        let state = Arc::new(PumpState::new(lease.continuation_token.clone()));
        let cancel = self.shutdown.child_token();
        let pump = PartitionPump {
            host_name: self.host_name.clone(),
            lease: lease.clone(),
            store: self.store.clone(),
            feed: self.feed.clone(),
            delegate: self.delegate.clone(),
            options: self.options.clone(),
            checkpoint_policy: self.retry.lease_store,
            state: state.clone(),
            cancel: cancel.clone(),
            metrics: self.metrics.clone(),
        };

        // The pump waits until its entry is registered so that an immediate
        // exit still finds it.
        let (registered_tx, registered_rx) = oneshot::channel::<()>();
        let coordinator = self.clone();
        let exit_token = token.clone();
        let exit_pump_id = pump_id.clone();
        let handle = tokio::spawn(async move {
            let _ = registered_rx.await;
            let exit = pump.run().await;
            coordinator.on_pump_exit(exit_token, exit_pump_id, exit).await;
        });

        self.owned.insert(
            token,
            OwnedLease {
                lease,
                pump: Some(PumpHandle {
                    id: pump_id,
                    state,
                    cancel,
                    handle,
                }),
            },
        );
        let _ = registered_tx.send(());
    }

    async fn on_pump_exit(
        self: Arc<Self>,
        token: String,
        pump_id: String,
        exit: PumpExit,
    ) {
        match exit {
            PumpExit::Stopped => {}
            PumpExit::Lost => {
                if self.forget(&token, &pump_id) {
                    info!(host = %self.host_name, lease_token = %token, "lease lost while pumping");
                    self.count_lost(&token);
                }
            }
            PumpExit::Fatal(e) => self.record_fatal(&e),
            PumpExit::PartitionGone(lease) => {
                if !self.detach_pump(&token, &pump_id) {
                    return;
                }
                self.synchronize(lease).await;
            }
        }
    }

    pub(super) async fn synchronize(
        self: &Arc<Self>,
        lease: Lease,
    ) {
        let token = lease.lease_token.clone();
        let retry = match self.synchronizer.handle_partition_gone(&lease).await {
            Ok(SyncOutcome::Replaced(children)) => {
                self.owned.remove(&token);
                for child in children {
                    if !self.shutdown.is_cancelled() {
                        self.start_pump(child);
                        continue;
                    }
                    // Shutdown already released everything it knew about.
                    if let Err(e) = self.release_lease(&child).await {
                        warn!(host = %self.host_name, lease_token = %child.lease_token, "release of child lease failed: {e}");
                    }
                }
                return;
            }
            Ok(SyncOutcome::AwaitingSiblings(drained)) => drained,
            Err(Error::Lease(LeaseError::Lost { .. })) => {
                self.owned.remove(&token);
                self.count_lost(&token);
                return;
            }
            Err(e) if e.is_fatal() => {
                self.record_fatal(&e);
                return;
            }
            Err(e) => {
                warn!(host = %self.host_name, lease_token = %token, "partition sync failed: {e}");
                lease
            }
        };

        if let Some(mut entry) = self.owned.get_mut(&token) {
            entry.lease = retry.clone();
        }
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = sleep(self.options.feed_poll_delay()) => {
                if self.owned.get(&token).is_some_and(|e| e.pump.is_none()) {
                    self.start_pump(retry);
                }
            }
        }
    }

    /// Drops the entry if `pump_id` is still its pump.
    fn forget(
        &self,
        token: &str,
        pump_id: &str,
    ) -> bool {
        self.owned
            .remove_if(token, |_, e| e.pump.as_ref().is_some_and(|p| p.id == pump_id))
            .is_some()
    }

    /// Keeps the entry but clears its pump, if `pump_id` is still its pump.
    fn detach_pump(
        &self,
        token: &str,
        pump_id: &str,
    ) -> bool {
        match self.owned.get_mut(token) {
            Some(mut entry) if entry.pump.as_ref().is_some_and(|p| p.id == pump_id) => {
                entry.pump = None;
                true
            }
            _ => false,
        }
    }

    /// Stops tracking a lease that now belongs to someone else. The pump
    /// skips the checkpoint of its in-flight batch.
    fn lose(
        &self,
        token: &str,
    ) {
        if let Some((_, entry)) = self.owned.remove(token) {
            if let Some(pump) = entry.pump {
                pump.state.mark_lost();
                pump.cancel.cancel();
            }
            self.count_lost(token);
        }
    }

    fn count_lost(
        &self,
        token: &str,
    ) {
        self.recently_owned.lock().insert(token.to_string());
        if let Some(m) = &self.metrics {
            m.leases_lost.with_label_values(&[&self.host_name]).inc();
        }
    }

    /// Stops the pump of a lease, waits for its in-flight batch, then
    /// releases the lease.
    async fn release_lease(
        &self,
        lease: &Lease,
    ) -> Result<()> {
        let token = lease.lease_token.as_str();
        self.recently_owned.lock().remove(token);
        if let Some((_, entry)) = self.owned.remove(token) {
            if let Some(pump) = entry.pump {
                pump.cancel.cancel();
                if let Err(e) = pump.handle.await {
                    warn!(host = %self.host_name, lease_token = %token, "pump task failed: {e}");
                }
            }
        }

        // The pump may have checkpointed since `lease` was read.
        let lease = match self.store.read_lease(token).await {
            Ok(latest) => latest,
            Err(_) => lease.clone(),
        };
        match self.store.release(&lease, &self.host_name).await {
            Ok(_) => {
                info!(host = %self.host_name, lease_token = %token, "lease released");
                if let Some(m) = &self.metrics {
                    m.leases_released.with_label_values(&[&self.host_name]).inc();
                }
                Ok(())
            }
            Err(Error::Lease(LeaseError::Lost { .. })) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(host = %self.host_name, lease_token = %token, "release failed: {e}");
                Ok(())
            }
        }
    }

    async fn release_all(&self) {
        let pumps: Vec<PumpHandle> = self
            .owned
            .iter_mut()
            .filter_map(|mut e| e.value_mut().pump.take())
            .collect();
        for pump in &pumps {
            pump.cancel.cancel();
        }
        for result in join_all(pumps.into_iter().map(|p| p.handle)).await {
            if let Err(e) = result {
                warn!(host = %self.host_name, "pump task failed: {e}");
            }
        }

        let leases: Vec<Lease> = self.owned.iter().map(|e| e.value().lease.clone()).collect();
        for lease in leases {
            if let Err(e) = self.release_lease(&lease).await {
                warn!(host = %self.host_name, lease_token = %lease.lease_token, "release on shutdown failed: {e}");
            }
        }
    }
}
