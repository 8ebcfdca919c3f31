use std::sync::Arc;

use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::FeedContainer;
use crate::FeedError;
use crate::Lease;
use crate::LeaseStoreManager;
use crate::PartitionKeyRange;
use crate::Result;

#[derive(Debug, PartialEq)]
pub(crate) enum SyncOutcome {
    /// The gone lease was deleted; these leases, owned by this host, replace it
    Replaced(Vec<Lease>),
    /// Merge parent drained, but a sibling parent is still being read
    AwaitingSiblings(Lease),
}

/// Replaces the lease of a partition that was split or merged away.
///
/// Split: one child lease per new partition, each starting at the parent's
/// continuation. Merge: each parent lease is marked drained; the last parent
/// to drain creates the child lease and deletes all parents.
#[derive(Debug)]
pub(crate) struct PartitionSynchronizer {
    host_name: String,
    store: Arc<LeaseStoreManager>,
    feed: Arc<dyn FeedContainer>,
}

impl PartitionSynchronizer {
    pub(crate) fn new(
        host_name: impl Into<String>,
        store: Arc<LeaseStoreManager>,
        feed: Arc<dyn FeedContainer>,
    ) -> Self {
        Self {
            host_name: host_name.into(),
            store,
            feed,
        }
    }

    pub(crate) async fn handle_partition_gone(
        &self,
        lease: &Lease,
    ) -> Result<SyncOutcome> {
        let ranges = self.feed.get_overlapping_ranges(&lease.feed_range).await?;

        if let Some(merged) = ranges
            .iter()
            .find(|r| r.range.contains_range(&lease.feed_range) && !r.range.same_as(&lease.feed_range))
        {
            return self.handle_merge(lease, merged).await;
        }

        if ranges.is_empty() || !ranges.iter().all(|r| lease.feed_range.contains_range(&r.range)) {
            return Err(FeedError::InvalidRange(format!(
                "lease {} covers {} which no longer maps onto live partitions",
                lease.lease_token, lease.feed_range
            ))
            .into());
        }

        self.handle_split(lease, &ranges).await
    }

    async fn handle_split(
        &self,
        lease: &Lease,
        children: &[PartitionKeyRange],
    ) -> Result<SyncOutcome> {
        let mut created = Vec::with_capacity(children.len());
        for child in children {
            match self
                .store
                .create_lease_if_not_exists(
                    &child.id,
                    child.range.clone(),
                    lease.continuation_token.clone(),
                    Some(&self.host_name),
                )
                .await?
            {
                Some(l) => created.push(l),
                None => debug!(child = %child.id, "child lease already exists"),
            }
        }

        if let Err(e) = self.store.delete(lease, &self.host_name).await {
            // Whoever ends up deleting the parent picks the children up.
            for child in &created {
                if let Err(release) = self.store.release(child, &self.host_name).await {
                    warn!(child = %child.lease_token, "could not release child lease: {release}");
                }
            }
            return Err(e);
        }
        info!(
            host = %self.host_name,
            parent = %lease.lease_token,
            children = ?children.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(),
            "partition split, lease replaced"
        );
        Ok(SyncOutcome::Replaced(created))
    }

    async fn handle_merge(
        &self,
        lease: &Lease,
        child: &PartitionKeyRange,
    ) -> Result<SyncOutcome> {
        let drained = if lease.is_drained() {
            lease.clone()
        } else {
            self.store
                .mark_drained(lease, &self.host_name, lease.continuation_token.clone())
                .await?
        };

        let leases = self.store.list_leases().await?;
        if leases.iter().any(|l| l.lease_token == child.id) {
            debug!(child = %child.id, "merged lease already exists");
            self.store.delete(&drained, &self.host_name).await?;
            return Ok(SyncOutcome::Replaced(Vec::new()));
        }

        let mut parents: Vec<&Lease> = leases
            .iter()
            .filter(|l| child.range.contains_range(&l.feed_range))
            .collect();
        if !parents.iter().all(|l| l.is_drained()) {
            debug!(lease_token = %lease.lease_token, child = %child.id, "waiting for sibling partitions to drain");
            return Ok(SyncOutcome::AwaitingSiblings(drained));
        }

        // Every parent was read up to the merge point, so any of their
        // continuations is a safe start for the child.
        parents.sort_by(|a, b| a.lease_token.cmp(&b.lease_token));
        let continuation = parents.iter().find_map(|l| l.continuation_token.clone());

        let created = self
            .store
            .create_lease_if_not_exists(&child.id, child.range.clone(), continuation, Some(&self.host_name))
            .await?;
        for parent in &parents {
            self.store.delete(parent, &self.host_name).await?;
        }

        info!(
            host = %self.host_name,
            child = %child.id,
            parents = ?parents.iter().map(|l| l.lease_token.as_str()).collect::<Vec<_>>(),
            "partitions merged, leases replaced"
        );
        Ok(SyncOutcome::Replaced(created.into_iter().collect()))
    }
}
