use std::sync::Arc;

use crate::ChangeFeedMode;
use crate::ChangeFeedRequest;
use crate::ChangeFeedStartFrom;
use crate::Error;
use crate::FeedContainer;
use crate::FeedError;
use crate::Lease;
use crate::Result;

const ESTIMATE_PAGE_SIZE: usize = 1_000;

/// Estimates how many changes a lease has not delivered yet.
///
/// Pages through the lease's partition from its continuation and counts the
/// pending changes. Lsns are not dense per partition, so their distance
/// would also count writes to other partitions.
#[derive(Debug)]
pub struct LagEstimator {
    feed: Arc<dyn FeedContainer>,
    mode: ChangeFeedMode,
    initial_start_from: ChangeFeedStartFrom,
}

impl LagEstimator {
    pub fn new(
        feed: Arc<dyn FeedContainer>,
        mode: ChangeFeedMode,
        initial_start_from: ChangeFeedStartFrom,
    ) -> Self {
        Self {
            feed,
            mode,
            initial_start_from,
        }
    }

    pub async fn estimate(
        &self,
        lease: &Lease,
    ) -> Result<u64> {
        if lease.is_drained() {
            return Ok(0);
        }

        let mut request = ChangeFeedRequest {
            partition_key_range_id: lease.lease_token.clone(),
            start_from: lease
                .continuation_token
                .clone()
                .map(ChangeFeedStartFrom::Continuation)
                .unwrap_or_else(|| self.initial_start_from.clone()),
            max_item_count: ESTIMATE_PAGE_SIZE,
            mode: self.mode,
        };

        let mut pending = 0;
        loop {
            let page = match self.feed.read_change_feed(&request).await {
                Ok(page) => page,
                Err(Error::Feed(FeedError::PartitionGone { .. })) => return Ok(pending),
                Err(e) => return Err(e),
            };
            pending += page.items.len() as u64;
            if !page.has_more {
                return Ok(pending);
            }
            request.start_from = ChangeFeedStartFrom::Continuation(page.continuation);
        }
    }
}
