//! Lease documents and the store they live in.
//!
//! The lease container is the only state shared between competing hosts.
//! Every mutation goes through [`LeaseStoreManager`], which guards each write
//! with the ETag of the copy it read.

mod bootstrapper;
mod memory;
mod store;
pub use bootstrapper::*;
pub use memory::*;
pub use store::*;

use std::collections::HashMap;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::FeedRange;
use crate::Result;

/// Property set on a lease whose partition was merged away and fully read.
pub const DRAINED_PROPERTY: &str = "drained";

/// Ownership record of one partition's change feed cursor.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Lease {
    pub id: String,
    /// Partition key range id the lease covers
    pub lease_token: String,
    pub feed_range: FeedRange,
    /// `None` = unowned
    pub owner: Option<String>,
    /// Opaque cursor; `None` = start according to the processor options
    pub continuation_token: Option<String>,
    /// Last renewal, epoch milliseconds
    pub timestamp: u64,
    #[serde(default)]
    pub properties: HashMap<String, String>,
    /// Version assigned by the lease container, filled in on read
    #[serde(skip)]
    pub etag: String,
}

impl Lease {
    pub fn is_owned_by(
        &self,
        host_name: &str,
    ) -> bool {
        self.owner.as_deref() == Some(host_name)
    }

    /// An owned lease not renewed within `expiration_ms` is expired.
    pub fn is_expired(
        &self,
        now_ms: u64,
        expiration_ms: u64,
    ) -> bool {
        self.owner.is_some() && now_ms.saturating_sub(self.timestamp) > expiration_ms
    }

    /// Owned by a host that is still renewing it.
    pub fn is_live(
        &self,
        now_ms: u64,
        expiration_ms: u64,
    ) -> bool {
        self.owner.is_some() && !self.is_expired(now_ms, expiration_ms)
    }

    pub fn is_drained(&self) -> bool {
        self.properties.get(DRAINED_PROPERTY).map(String::as_str) == Some("true")
    }

    pub(crate) fn from_stored(item: StoredItem) -> Result<Self> {
        let mut lease: Lease = serde_json::from_value(item.body)?;
        lease.etag = item.etag;
        Ok(lease)
    }
}

/// Heartbeat document of one running processor host.
///
/// Host names are supplied by the caller; two hosts using the same name share
/// one registration and will fight over the same leases.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct HostRegistration {
    pub id: String,
    pub host_name: String,
    pub owned_leases: Vec<String>,
    /// Epoch milliseconds
    pub last_activity: u64,
}

impl HostRegistration {
    pub fn is_active(
        &self,
        now_ms: u64,
        expiration_ms: u64,
    ) -> bool {
        now_ms.saturating_sub(self.last_activity) <= expiration_ms
    }
}

/// An item as returned by the lease container.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredItem {
    pub id: String,
    pub etag: String,
    pub body: Value,
}

/// Generic item store holding the lease documents.
///
/// Items are JSON objects carrying a string `id`. Implementations must assign
/// a fresh ETag on every successful write and reject guarded writes whose
/// ETag no longer matches with `LeaseError::PreconditionFailed`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LeaseContainer: Send + Sync + 'static {
    fn id(&self) -> String;

    /// Fails with `LeaseError::Conflict` when the id exists.
    async fn create_item(
        &self,
        item: Value,
    ) -> Result<StoredItem>;

    async fn read_item(
        &self,
        id: &str,
    ) -> Result<StoredItem>;

    /// Replaces the item only if its current ETag equals `if_match`.
    async fn replace_item(
        &self,
        item: Value,
        if_match: &str,
    ) -> Result<StoredItem>;

    async fn upsert_item(
        &self,
        item: Value,
    ) -> Result<StoredItem>;

    /// Deletes the item, guarded by `if_match` when given.
    async fn delete_item(
        &self,
        id: &str,
        if_match: Option<String>,
    ) -> Result<()>;

    /// All items whose id starts with `prefix`, ordered by id.
    async fn query_items_by_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<StoredItem>>;
}

impl std::fmt::Debug for dyn LeaseContainer {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "LeaseContainer({})", self.id())
    }
}
