//! Per-operation request diagnostics.
//!
//! [`ClientSideRequestStatistics`] collects what happened on the wire for one
//! request, possibly from several racing retry attempts.
//! [`DiagnosticsContext`] groups those collectors for one logical operation and
//! decides whether the operation was slow or expensive enough to log in detail.

mod context;
mod statistics;
mod thresholds;
pub use context::*;
pub use statistics::*;
pub use thresholds::*;

use serde::Deserialize;
use serde::Serialize;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationType {
    Create,
    Read,
    Replace,
    Upsert,
    Delete,
    Patch,
    Query,
    ReadFeed,
    Batch,
    Head,
    HeadFeed,
}

impl OperationType {
    /// Single-item operations, judged against the point latency threshold.
    pub fn is_point_operation(self) -> bool {
        matches!(
            self,
            OperationType::Create
                | OperationType::Read
                | OperationType::Replace
                | OperationType::Upsert
                | OperationType::Delete
                | OperationType::Patch
        )
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceType {
    Document,
    DocumentCollection,
    Database,
    PartitionKeyRange,
    Address,
    Offer,
    StoredProcedure,
}

impl ResourceType {
    pub fn is_metadata(self) -> bool {
        !matches!(self, ResourceType::Document)
    }
}
