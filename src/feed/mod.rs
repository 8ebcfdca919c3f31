//! Monitored container abstraction.
//!
//! The processor only needs three things from the container it watches: the
//! current partition layout, the ranges overlapping a given range, and a page
//! of changes for one partition starting at a cursor.

mod memory;
mod range;
pub use memory::*;
pub use range::*;
#[cfg(test)]
mod range_test;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::Result;

/// Which versions of a document the feed yields.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ChangeFeedMode {
    /// Latest version of each changed document, deletes are not visible
    #[default]
    Incremental,
    /// Every create, replace and delete with operation metadata
    FullFidelity,
}

/// Where a lease without a continuation starts reading.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum ChangeFeedStartFrom {
    Beginning,
    Now,
    /// Epoch milliseconds
    PointInTime(u64),
    /// Opaque cursor returned by a previous page
    Continuation(String),
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChangeFeedOperationType {
    Create,
    Replace,
    Delete,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChangeFeedMetaData {
    /// Log sequence number of this change
    pub lsn: u64,
    /// Conflict resolution timestamp (epoch milliseconds)
    pub crts: u64,
    pub operation_type: ChangeFeedOperationType,
    /// Lsn of the version this change replaced
    pub previous_lsn: Option<u64>,
    #[serde(default)]
    pub time_to_live_expired: bool,
}

/// One change as seen by a full fidelity consumer.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChangeFeedProcessorItem {
    pub current: Option<Value>,
    pub previous: Option<Value>,
    pub metadata: ChangeFeedMetaData,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ChangeFeedRequest {
    pub partition_key_range_id: String,
    pub start_from: ChangeFeedStartFrom,
    pub max_item_count: usize,
    pub mode: ChangeFeedMode,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FeedPage {
    pub items: Vec<ChangeFeedProcessorItem>,
    /// Cursor to resume after this page
    pub continuation: String,
    /// More changes are immediately available after `continuation`
    pub has_more: bool,
    /// Latest lsn written to the partition when the page was served
    pub latest_lsn: u64,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait FeedContainer: Send + Sync + 'static {
    fn id(&self) -> String;

    /// Current (live) partition layout.
    async fn read_partition_key_ranges(&self) -> Result<Vec<PartitionKeyRange>>;

    /// Live partitions overlapping `range`.
    async fn get_overlapping_ranges(
        &self,
        range: &FeedRange,
    ) -> Result<Vec<PartitionKeyRange>>;

    /// Reads the next page of changes for one partition.
    ///
    /// Fails with `FeedError::PartitionGone` once the partition has been split
    /// or merged away and every change written to it before that was read.
    async fn read_change_feed(
        &self,
        request: &ChangeFeedRequest,
    ) -> Result<FeedPage>;
}

impl std::fmt::Debug for dyn FeedContainer {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "FeedContainer({})", self.id())
    }
}
