use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::ChangeFeedMode;
use crate::ChangeFeedProcessorItem;
use crate::FeedRange;
use crate::ProcessorError;
use crate::Result;

/// What a delegate returns; an error makes the processor retry the batch.
pub type DelegateResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Identifies the partition a batch came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeFeedProcessorContext {
    pub host_name: String,
    pub lease_token: String,
    pub feed_range: FeedRange,
}

pub type IncrementalHandler = dyn Fn(Vec<Value>, &ChangeFeedProcessorContext) -> DelegateResult + Send + Sync;

pub type FullFidelityHandler =
    dyn Fn(Vec<ChangeFeedProcessorItem>, &ChangeFeedProcessorContext) -> DelegateResult + Send + Sync;

/// The user callback, one of two mutually exclusive shapes.
#[derive(Clone)]
pub enum ChangeFeedDelegate {
    /// Latest version of each changed document
    Incremental(Arc<IncrementalHandler>),
    /// Every change including deletes, with metadata
    FullFidelity(Arc<FullFidelityHandler>),
}

impl fmt::Debug for ChangeFeedDelegate {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            ChangeFeedDelegate::Incremental(_) => f.write_str("ChangeFeedDelegate::Incremental"),
            ChangeFeedDelegate::FullFidelity(_) => f.write_str("ChangeFeedDelegate::FullFidelity"),
        }
    }
}

impl ChangeFeedDelegate {
    pub fn mode(&self) -> ChangeFeedMode {
        match self {
            ChangeFeedDelegate::Incremental(_) => ChangeFeedMode::Incremental,
            ChangeFeedDelegate::FullFidelity(_) => ChangeFeedMode::FullFidelity,
        }
    }

    /// Runs the delegate on the blocking pool and waits for it.
    ///
    /// Errors and panics both come back as `ProcessorError::Delegate`.
    pub(crate) async fn deliver(
        &self,
        items: Vec<ChangeFeedProcessorItem>,
        context: ChangeFeedProcessorContext,
    ) -> Result<()> {
        let delegate = self.clone();
        let lease_token = context.lease_token.clone();

        let outcome = tokio::task::spawn_blocking(move || match &delegate {
            ChangeFeedDelegate::Incremental(handler) => {
                let documents = items.into_iter().filter_map(|item| item.current).collect();
                handler(documents, &context)
            }
            ChangeFeedDelegate::FullFidelity(handler) => handler(items, &context),
        })
        .await;

        let message = match outcome {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e.to_string(),
            Err(join_error) if join_error.is_panic() => "delegate panicked".to_string(),
            Err(join_error) => join_error.to_string(),
        };
        Err(ProcessorError::Delegate { lease_token, message }.into())
    }
}
