//! Fluent construction of a [`ChangeFeedProcessor`].
//!
//! Every argument is validated synchronously by [`ChangeFeedProcessorBuilder::build`];
//! the resulting [`ProcessorConfig`] is immutable and shared behind an `Arc`.
//!
//! ## Example
//! ```ignore
//! let processor = ChangeFeedProcessorBuilder::new()
//!     .host_name("host-1")
//!     .feed_container(feed)
//!     .lease_container(leases)
//!     .handle_changes(|docs, ctx| {
//!         println!("{} changes from {}", docs.len(), ctx.lease_token);
//!         Ok(())
//!     })
//!     .build()?;
//! processor.start().await?;
//! ```

use std::sync::Arc;

use serde_json::Value;

use super::ChangeFeedDelegate;
use super::ChangeFeedProcessor;
use super::ChangeFeedProcessorContext;
use super::DelegateResult;
use super::FullFidelityHandler;
use super::IncrementalHandler;
use crate::BuilderError;
use crate::ChangeFeedMode;
use crate::ChangeFeedProcessorItem;
use crate::ChangeFeedProcessorOptions;
use crate::Clock;
use crate::FeedContainer;
use crate::LeaseContainer;
use crate::ProcessorMetrics;
use crate::Result;
use crate::RetryPolicies;
use crate::Settings;
use crate::SystemClock;

/// Validated processor configuration. No setters: it cannot change once built.
#[derive(Debug)]
pub struct ProcessorConfig {
    pub(crate) host_name: String,
    pub(crate) feed: Arc<dyn FeedContainer>,
    pub(crate) leases: Arc<dyn LeaseContainer>,
    pub(crate) delegate: ChangeFeedDelegate,
    pub(crate) options: ChangeFeedProcessorOptions,
    pub(crate) retry: RetryPolicies,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) metrics: Option<ProcessorMetrics>,
}

impl ProcessorConfig {
    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn mode(&self) -> ChangeFeedMode {
        self.delegate.mode()
    }

    pub fn options(&self) -> &ChangeFeedProcessorOptions {
        &self.options
    }

    pub fn retry_policies(&self) -> &RetryPolicies {
        &self.retry
    }
}

pub struct ChangeFeedProcessorBuilder {
    host_name: Option<String>,
    feed: Option<Arc<dyn FeedContainer>>,
    leases: Option<Arc<dyn LeaseContainer>>,
    incremental: Option<Arc<IncrementalHandler>>,
    full_fidelity: Option<Arc<FullFidelityHandler>>,
    mode: Option<ChangeFeedMode>,
    options: ChangeFeedProcessorOptions,
    retry: RetryPolicies,
    clock: Arc<dyn Clock>,
    metrics: Option<ProcessorMetrics>,
}

impl Default for ChangeFeedProcessorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeFeedProcessorBuilder {
    pub fn new() -> Self {
        Self {
            host_name: None,
            feed: None,
            leases: None,
            incremental: None,
            full_fidelity: None,
            mode: None,
            options: ChangeFeedProcessorOptions::default(),
            retry: RetryPolicies::default(),
            clock: Arc::new(SystemClock),
            metrics: None,
        }
    }

    /// Identity of this host in the lease container. Must be unique among
    /// the hosts sharing the lease container.
    pub fn host_name(
        mut self,
        host_name: impl Into<String>,
    ) -> Self {
        self.host_name = Some(host_name.into());
        self
    }

    /// The container whose changes are processed.
    pub fn feed_container(
        mut self,
        feed: Arc<dyn FeedContainer>,
    ) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn lease_container(
        mut self,
        leases: Arc<dyn LeaseContainer>,
    ) -> Self {
        self.leases = Some(leases);
        self
    }

    /// Incremental consumer: receives the latest version of changed documents.
    pub fn handle_changes<F>(
        mut self,
        handler: F,
    ) -> Self
    where
        F: Fn(Vec<Value>, &ChangeFeedProcessorContext) -> DelegateResult + Send + Sync + 'static,
    {
        self.incremental = Some(Arc::new(handler));
        self
    }

    /// Full fidelity consumer: receives every change, deletes included.
    pub fn handle_full_fidelity_changes<F>(
        mut self,
        handler: F,
    ) -> Self
    where
        F: Fn(Vec<ChangeFeedProcessorItem>, &ChangeFeedProcessorContext) -> DelegateResult + Send + Sync + 'static,
    {
        self.full_fidelity = Some(Arc::new(handler));
        self
    }

    /// Optional; must agree with the consumer kind when set.
    pub fn change_feed_mode(
        mut self,
        mode: ChangeFeedMode,
    ) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn options(
        mut self,
        options: ChangeFeedProcessorOptions,
    ) -> Self {
        self.options = options;
        self
    }

    pub fn retry_policies(
        mut self,
        retry: RetryPolicies,
    ) -> Self {
        self.retry = retry;
        self
    }

    /// Takes the processor options and retry policies from loaded settings.
    pub fn settings(
        mut self,
        settings: &Settings,
    ) -> Self {
        self.options = settings.processor.clone();
        self.retry = settings.retry.clone();
        self
    }

    pub fn clock(
        mut self,
        clock: Arc<dyn Clock>,
    ) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(
        mut self,
        metrics: ProcessorMetrics,
    ) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<ChangeFeedProcessor> {
        let host_name = match self.host_name {
            Some(h) if !h.trim().is_empty() => h,
            _ => return Err(invalid_argument("hostName cannot be null or empty")),
        };
        let feed = self
            .feed
            .ok_or_else(|| invalid_argument("feedContainer cannot be null"))?;
        let leases = self
            .leases
            .ok_or_else(|| invalid_argument("leaseContainer cannot be null"))?;

        let delegate = match (self.incremental, self.full_fidelity) {
            (None, None) => return Err(invalid_argument("Change feed processor consumer is not set")),
            (Some(_), Some(_)) => {
                return Err(invalid_argument(
                    "expecting either incremental or full fidelity consumer, not both",
                ))
            }
            (Some(handler), None) => ChangeFeedDelegate::Incremental(handler),
            (None, Some(handler)) => ChangeFeedDelegate::FullFidelity(handler),
        };

        self.options
            .validate()
            .and_then(|()| self.retry.validate())
            .map_err(|e| invalid_argument(&e.to_string()))?;

        let mode = self.mode.unwrap_or_else(|| delegate.mode());
        if mode == ChangeFeedMode::FullFidelity
            && (self.options.start_from_beginning || self.options.start_time_ms.is_some())
        {
            return Err(invalid_state(
                "full fidelity change feed mode does not support a start time or starting from the beginning",
            ));
        }
        if mode != delegate.mode() {
            return Err(invalid_state(&format!(
                "change feed mode {mode:?} does not match the {:?} consumer",
                delegate.mode()
            )));
        }

        let config = ProcessorConfig {
            host_name,
            feed,
            leases,
            delegate,
            options: self.options,
            retry: self.retry,
            clock: self.clock,
            metrics: self.metrics,
        };
        Ok(ChangeFeedProcessor::new(Arc::new(config)))
    }
}

fn invalid_argument(message: &str) -> crate::Error {
    BuilderError::InvalidArgument(message.to_string()).into()
}

fn invalid_state(message: &str) -> crate::Error {
    BuilderError::InvalidState(message.to_string()).into()
}
