//! Change Feed Processor Error Hierarchy
//!
//! Errors are grouped by the layer that raises them. The grouping mirrors how
//! the processor reacts to them:
//! - builder and configuration errors fail fast, before `start()`
//! - lease and feed errors are mostly transient and retried on the next tick
//! - fatal errors stop the coordinator and become queryable on the processor

use std::time::Duration;

use config::ConfigError;
use tokio::task::JoinError;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Builder validation failures (raised synchronously by `build()`)
    #[error(transparent)]
    Builder(#[from] BuilderError),

    /// Options validation and settings loading failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Lease container and lease ownership failures
    #[error(transparent)]
    Lease(#[from] LeaseError),

    /// Monitored container failures
    #[error(transparent)]
    Feed(#[from] FeedError),

    /// Invalid use of the diagnostics recorders
    #[error(transparent)]
    Diagnostics(#[from] DiagnosticsError),

    /// Processor lifecycle violations
    #[error(transparent)]
    Processor(#[from] ProcessorError),

    /// Metric registration failures
    #[error(transparent)]
    Metrics(#[from] prometheus::Error),

    /// Unrecoverable failures; the coordinator stops when it sees one
    #[error("Fatal error: {0}")]
    Fatal(String),
}

/// Raised by `ChangeFeedProcessorBuilder::build()`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuilderError {
    /// A required argument is missing or malformed
    #[error("{0}")]
    InvalidArgument(String),

    /// The combination of arguments is not allowed
    #[error("{0}")]
    InvalidState(String),
}

#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    /// Create of an item whose id already exists
    #[error("Item {id} already exists in the lease container")]
    Conflict { id: String },

    /// Read, replace or delete of an unknown item
    #[error("Item {id} not found in the lease container")]
    NotFound { id: String },

    /// ETag guard failed: the item was modified since it was read
    #[error("Item {id} was modified concurrently (etag mismatch)")]
    PreconditionFailed { id: String },

    /// The lease container could not be reached
    #[error("Lease container unavailable: {0}")]
    Unavailable(String),

    /// Another host owns the lease now
    #[error("Lease {lease_token} is no longer owned by this host")]
    Lost { lease_token: String },

    /// The lease container itself is gone or misconfigured
    #[error("Lease container {0} does not exist")]
    ContainerNotFound(String),

    /// Item without a string `id`
    #[error("Invalid lease container item: {0}")]
    InvalidItem(String),

    /// Lease document could not be (de)serialized
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl LeaseError {
    /// Errors that the next acquire/renew tick is expected to get past.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LeaseError::Unavailable(_) | LeaseError::PreconditionFailed { .. } | LeaseError::Conflict { .. }
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, LeaseError::ContainerNotFound(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// The partition key range was split or merged and has been drained
    #[error("Partition key range {range_id} is gone")]
    PartitionGone { range_id: String },

    /// The monitored container was deleted
    #[error("Monitored container {0} does not exist")]
    ContainerNotFound(String),

    /// Request rate too large
    #[error("Monitored container throttled the request, retry after {retry_after:?}")]
    Throttled { retry_after: Duration },

    /// The monitored container could not be reached
    #[error("Monitored container unavailable: {0}")]
    Unavailable(String),

    /// Document without a string `id`
    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    /// Malformed or unusable feed range
    #[error("Invalid feed range: {0}")]
    InvalidRange(String),

    /// The continuation token could not be interpreted
    #[error("Malformed continuation token: {0}")]
    InvalidContinuation(String),
}

impl FeedError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, FeedError::ContainerNotFound(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiagnosticsError {
    /// `record_address_resolution_end` without a matching start
    #[error("Address resolution {id} was never started")]
    UnknownAddressResolution { id: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("Change feed processor for host {0} is already started")]
    AlreadyStarted(String),

    #[error("Change feed processor for host {0} has been stopped and cannot be restarted")]
    AlreadyStopped(String),

    #[error("Change feed processor did not stop within {0:?}")]
    ShutdownTimeout(Duration),

    /// The user delegate failed or panicked for one batch
    #[error("Delegate failed for lease {lease_token}: {message}")]
    Delegate { lease_token: String, message: String },

    #[error("Background task failed: {0}")]
    TaskFailed(#[from] JoinError),

    #[error("Retry timeout after {0:?}")]
    RetryTimeout(Duration),

    #[error("{0}")]
    RetryTaskFailed(String),
}

// ============== Conversion Implementations ============== //
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Lease(LeaseError::Serialization(e))
    }
}

impl From<JoinError> for Error {
    fn from(e: JoinError) -> Self {
        Error::Processor(ProcessorError::TaskFailed(e))
    }
}

impl Error {
    /// True for errors after which the coordinator must stop.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Fatal(_) => true,
            Error::Lease(e) => e.is_fatal(),
            Error::Feed(e) => e.is_fatal(),
            _ => false,
        }
    }

    /// True for errors worth another attempt within the same operation.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Lease(e) => e.is_transient(),
            Error::Feed(FeedError::Unavailable(_)) | Error::Feed(FeedError::Throttled { .. }) => true,
            Error::Processor(ProcessorError::RetryTimeout(_)) => true,
            _ => false,
        }
    }
}
