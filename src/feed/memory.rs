use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::Hash;
use std::hash::Hasher;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use super::ChangeFeedMetaData;
use super::ChangeFeedMode;
use super::ChangeFeedOperationType;
use super::ChangeFeedProcessorItem;
use super::ChangeFeedRequest;
use super::ChangeFeedStartFrom;
use super::FeedContainer;
use super::FeedPage;
use super::FeedRange;
use super::PartitionKeyRange;
use super::MAX_EPK;
use crate::Clock;
use crate::FeedError;
use crate::Result;
use crate::SystemClock;

const CONTINUATION_PREFIX: &str = "lsn:";

/// Upper bound of the hashed key space, matches `MAX_EPK`
const EPK_SPACE: u64 = 0xFF00_0000_0000_0000;

/// Maps a partition key value onto the effective partition key space.
pub fn effective_partition_key(partition_key: &str) -> String {
    let mut hasher = DefaultHasher::new();
    partition_key.hash(&mut hasher);
    format!("{:016X}", hasher.finish() % EPK_SPACE)
}

/// Monitored container held in process memory.
///
/// Keeps a single change log ordered by lsn; every partition reads the slice
/// of the log that falls into its key range. Splits and merges retire the
/// old partitions at the current lsn: a retired partition keeps serving what
/// was written before it retired and reports `PartitionGone` afterwards.
#[derive(Debug)]
pub struct InMemoryFeedContainer {
    id: String,
    clock: Arc<dyn Clock>,
    state: RwLock<FeedState>,
}

#[derive(Debug, Default)]
struct FeedState {
    deleted: bool,
    unavailable: bool,
    last_lsn: u64,
    next_range_id: u64,
    live: BTreeMap<String, PartitionKeyRange>,
    retired: HashMap<String, RetiredRange>,
    log: Vec<LogEntry>,
    documents: HashMap<DocumentKey, (Value, u64)>,
    latest_lsn_by_key: HashMap<DocumentKey, u64>,
}

type DocumentKey = (String, String);

#[derive(Debug)]
struct RetiredRange {
    range: PartitionKeyRange,
    retired_at: u64,
}

#[derive(Debug, Clone)]
struct LogEntry {
    lsn: u64,
    crts: u64,
    epk: String,
    key: DocumentKey,
    operation_type: ChangeFeedOperationType,
    current: Option<Value>,
    previous: Option<Value>,
    previous_lsn: Option<u64>,
}

impl InMemoryFeedContainer {
    /// Container with a single partition covering the whole key space.
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_partition_count(id, 1, Arc::new(SystemClock))
    }

    /// Container pre-split into `count` partitions of equal width, ids `"0"..`.
    pub fn with_partition_count(
        id: impl Into<String>,
        count: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let count = count.max(1) as u64;
        let width = EPK_SPACE / count;
        let mut live = BTreeMap::new();
        for i in 0..count {
            let min = if i == 0 {
                String::new()
            } else {
                format!("{:016X}", i * width)
            };
            let max = if i + 1 == count {
                MAX_EPK.to_string()
            } else {
                format!("{:016X}", (i + 1) * width)
            };
            let range_id = i.to_string();
            live.insert(range_id.clone(), PartitionKeyRange::new(range_id, FeedRange::new(min, max)));
        }

        Self {
            id: id.into(),
            clock,
            state: RwLock::new(FeedState {
                next_range_id: count,
                live,
                ..Default::default()
            }),
        }
    }

    /// Creates or replaces a document; the document must carry a string `id`.
    ///
    /// Returns the lsn of the change.
    pub fn upsert(
        &self,
        partition_key: &str,
        document: Value,
    ) -> Result<u64> {
        let id = document
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| FeedError::InvalidDocument("document has no string id".to_string()))?;
        let crts = self.clock.now_millis();

        let mut state = self.state.write();
        state.ensure_exists(&self.id)?;

        let key = (partition_key.to_string(), id);
        let previous = state.documents.get(&key).cloned();
        let operation_type = if previous.is_some() {
            ChangeFeedOperationType::Replace
        } else {
            ChangeFeedOperationType::Create
        };

        state.last_lsn += 1;
        let lsn = state.last_lsn;
        state.documents.insert(key.clone(), (document.clone(), lsn));
        state.latest_lsn_by_key.insert(key.clone(), lsn);
        state.log.push(LogEntry {
            lsn,
            crts,
            epk: effective_partition_key(partition_key),
            key,
            operation_type,
            current: Some(document),
            previous: previous.as_ref().map(|(doc, _)| doc.clone()),
            previous_lsn: previous.map(|(_, lsn)| lsn),
        });
        Ok(lsn)
    }

    /// Deletes a document. Returns the lsn of the change, `None` when the
    /// document did not exist.
    pub fn delete(
        &self,
        partition_key: &str,
        id: &str,
    ) -> Result<Option<u64>> {
        let crts = self.clock.now_millis();
        let mut state = self.state.write();
        state.ensure_exists(&self.id)?;

        let key = (partition_key.to_string(), id.to_string());
        let Some((previous, previous_lsn)) = state.documents.remove(&key) else {
            return Ok(None);
        };

        state.last_lsn += 1;
        let lsn = state.last_lsn;
        state.latest_lsn_by_key.insert(key.clone(), lsn);
        state.log.push(LogEntry {
            lsn,
            crts,
            epk: effective_partition_key(partition_key),
            key,
            operation_type: ChangeFeedOperationType::Delete,
            current: None,
            previous: Some(previous),
            previous_lsn: Some(previous_lsn),
        });
        Ok(Some(lsn))
    }

    /// Splits a live partition into two children at its midpoint.
    pub fn split(
        &self,
        range_id: &str,
    ) -> Result<(String, String)> {
        let mut state = self.state.write();
        state.ensure_exists(&self.id)?;

        let parent = state.retire(range_id)?;
        let (left, right) = parent.range.split()?;
        let left_id = state.add_child(left, vec![parent.id.clone()]);
        let right_id = state.add_child(right, vec![parent.id.clone()]);

        debug!(container = %self.id, %range_id, %left_id, %right_id, "partition split");
        Ok((left_id, right_id))
    }

    /// Merges two adjacent live partitions into one.
    pub fn merge(
        &self,
        first_id: &str,
        second_id: &str,
    ) -> Result<String> {
        let mut state = self.state.write();
        state.ensure_exists(&self.id)?;

        let first = state
            .live
            .get(first_id)
            .cloned()
            .ok_or_else(|| FeedError::InvalidRange(format!("partition {first_id} is not live")))?;
        let second = state
            .live
            .get(second_id)
            .cloned()
            .ok_or_else(|| FeedError::InvalidRange(format!("partition {second_id} is not live")))?;
        let merged = first.range.union(&second.range)?;

        state.retire(first_id)?;
        state.retire(second_id)?;
        let child_id = state.add_child(merged, vec![first.id, second.id]);

        debug!(container = %self.id, %first_id, %second_id, %child_id, "partitions merged");
        Ok(child_id)
    }

    /// Drops the container; every later call fails with `ContainerNotFound`.
    pub fn delete_container(&self) {
        self.state.write().deleted = true;
    }

    /// Makes every read fail with `FeedError::Unavailable` while set.
    pub fn set_unavailable(
        &self,
        unavailable: bool,
    ) {
        self.state.write().unavailable = unavailable;
    }

    pub fn last_lsn(&self) -> u64 {
        self.state.read().last_lsn
    }

    /// Live partition currently holding `partition_key`.
    pub fn range_id_for(
        &self,
        partition_key: &str,
    ) -> Option<String> {
        let epk = effective_partition_key(partition_key);
        self.state
            .read()
            .live
            .values()
            .find(|r| r.range.contains_epk(&epk))
            .map(|r| r.id.clone())
    }
}

impl FeedState {
    fn ensure_exists(
        &self,
        container_id: &str,
    ) -> Result<()> {
        if self.deleted {
            return Err(FeedError::ContainerNotFound(container_id.to_string()).into());
        }
        Ok(())
    }

    fn retire(
        &mut self,
        range_id: &str,
    ) -> Result<PartitionKeyRange> {
        let range = self
            .live
            .remove(range_id)
            .ok_or_else(|| FeedError::InvalidRange(format!("partition {range_id} is not live")))?;
        self.retired.insert(
            range_id.to_string(),
            RetiredRange {
                range: range.clone(),
                retired_at: self.last_lsn,
            },
        );
        Ok(range)
    }

    fn add_child(
        &mut self,
        range: FeedRange,
        parents: Vec<String>,
    ) -> String {
        let id = self.next_range_id.to_string();
        self.next_range_id += 1;
        self.live.insert(
            id.clone(),
            PartitionKeyRange {
                id: id.clone(),
                range,
                parents,
            },
        );
        id
    }

    fn start_lsn(
        &self,
        start_from: &ChangeFeedStartFrom,
        upper: u64,
    ) -> Result<u64> {
        match start_from {
            ChangeFeedStartFrom::Beginning => Ok(0),
            ChangeFeedStartFrom::Now => Ok(upper),
            ChangeFeedStartFrom::PointInTime(ms) => Ok(self
                .log
                .iter()
                .find(|e| e.crts >= *ms)
                .map(|e| e.lsn - 1)
                .unwrap_or(upper)
                .min(upper)),
            ChangeFeedStartFrom::Continuation(token) => parse_continuation(token),
        }
    }

    fn is_visible(
        &self,
        entry: &LogEntry,
        mode: ChangeFeedMode,
    ) -> bool {
        match mode {
            ChangeFeedMode::FullFidelity => true,
            ChangeFeedMode::Incremental => {
                entry.operation_type != ChangeFeedOperationType::Delete
                    && self.latest_lsn_by_key.get(&entry.key) == Some(&entry.lsn)
            }
        }
    }
}

fn parse_continuation(token: &str) -> Result<u64> {
    token
        .strip_prefix(CONTINUATION_PREFIX)
        .and_then(|lsn| lsn.parse().ok())
        .ok_or_else(|| FeedError::InvalidContinuation(token.to_string()).into())
}

fn continuation(lsn: u64) -> String {
    format!("{CONTINUATION_PREFIX}{lsn}")
}

#[async_trait]
impl FeedContainer for InMemoryFeedContainer {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn read_partition_key_ranges(&self) -> Result<Vec<PartitionKeyRange>> {
        let state = self.state.read();
        state.ensure_exists(&self.id)?;
        if state.unavailable {
            return Err(FeedError::Unavailable(self.id.clone()).into());
        }
        Ok(state.live.values().cloned().collect())
    }

    async fn get_overlapping_ranges(
        &self,
        range: &FeedRange,
    ) -> Result<Vec<PartitionKeyRange>> {
        let state = self.state.read();
        state.ensure_exists(&self.id)?;
        if state.unavailable {
            return Err(FeedError::Unavailable(self.id.clone()).into());
        }
        Ok(state.live.values().filter(|r| r.range.overlaps(range)).cloned().collect())
    }

    async fn read_change_feed(
        &self,
        request: &ChangeFeedRequest,
    ) -> Result<FeedPage> {
        let state = self.state.read();
        state.ensure_exists(&self.id)?;
        if state.unavailable {
            return Err(FeedError::Unavailable(self.id.clone()).into());
        }

        let (range, upper, retired) = if let Some(live) = state.live.get(&request.partition_key_range_id) {
            (live.range.clone(), state.last_lsn, false)
        } else if let Some(r) = state.retired.get(&request.partition_key_range_id) {
            (r.range.range.clone(), r.retired_at, true)
        } else {
            return Err(FeedError::PartitionGone {
                range_id: request.partition_key_range_id.clone(),
            }
            .into());
        };

        let cursor = state.start_lsn(&request.start_from, upper)?;
        let mut pending = state
            .log
            .iter()
            .filter(|e| e.lsn > cursor && e.lsn <= upper && range.contains_epk(&e.epk))
            .peekable();

        if retired && pending.peek().is_none() {
            return Err(FeedError::PartitionGone {
                range_id: request.partition_key_range_id.clone(),
            }
            .into());
        }

        let max_items = request.max_item_count.max(1);
        let mut items = Vec::new();
        let mut last_scanned = cursor;
        let mut has_more = false;
        for entry in pending {
            if !state.is_visible(entry, request.mode) {
                last_scanned = entry.lsn;
                continue;
            }
            if items.len() == max_items {
                has_more = true;
                break;
            }
            last_scanned = entry.lsn;
            items.push(ChangeFeedProcessorItem {
                current: entry.current.clone(),
                previous: entry.previous.clone(),
                metadata: ChangeFeedMetaData {
                    lsn: entry.lsn,
                    crts: entry.crts,
                    operation_type: entry.operation_type,
                    previous_lsn: entry.previous_lsn,
                    time_to_live_expired: false,
                },
            });
        }

        let latest_lsn = state
            .log
            .iter()
            .rev()
            .filter(|e| e.lsn <= upper && range.contains_epk(&e.epk))
            .map(|e| e.lsn)
            .next()
            .unwrap_or(0);

        Ok(FeedPage {
            items,
            continuation: continuation(if has_more { last_scanned } else { upper.max(cursor) }),
            has_more,
            latest_lsn,
        })
    }
}
