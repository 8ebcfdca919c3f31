use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;

use super::LeaseContainer;
use super::StoredItem;
use crate::LeaseError;
use crate::Result;

/// Lease container held in process memory.
///
/// Shared between hosts of one process through an `Arc`, which is enough to
/// run several competing processors against the same leases.
#[derive(Debug)]
pub struct InMemoryLeaseContainer {
    id: String,
    items: DashMap<String, (String, Value)>,
    unavailable: AtomicBool,
    deleted: AtomicBool,
}

impl InMemoryLeaseContainer {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            items: DashMap::new(),
            unavailable: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
        }
    }

    /// Makes every call fail with `LeaseError::Unavailable` while set.
    pub fn set_unavailable(
        &self,
        unavailable: bool,
    ) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Drops the container; every later call fails with `ContainerNotFound`.
    pub fn delete_container(&self) {
        self.deleted.store(true, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn check(&self) -> Result<()> {
        if self.deleted.load(Ordering::SeqCst) {
            return Err(LeaseError::ContainerNotFound(self.id.clone()).into());
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LeaseError::Unavailable(self.id.clone()).into());
        }
        Ok(())
    }
}

fn item_id(item: &Value) -> Result<String> {
    item.get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| LeaseError::InvalidItem("item has no string id".to_string()).into())
}

fn new_etag() -> String {
    nanoid::nanoid!()
}

#[async_trait]
impl LeaseContainer for InMemoryLeaseContainer {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn create_item(
        &self,
        item: Value,
    ) -> Result<StoredItem> {
        self.check()?;
        let id = item_id(&item)?;
        match self.items.entry(id.clone()) {
            Entry::Occupied(_) => Err(LeaseError::Conflict { id }.into()),
            Entry::Vacant(slot) => {
                let etag = new_etag();
                slot.insert((etag.clone(), item.clone()));
                Ok(StoredItem { id, etag, body: item })
            }
        }
    }

    async fn read_item(
        &self,
        id: &str,
    ) -> Result<StoredItem> {
        self.check()?;
        self.items
            .get(id)
            .map(|entry| StoredItem {
                id: id.to_string(),
                etag: entry.0.clone(),
                body: entry.1.clone(),
            })
            .ok_or_else(|| LeaseError::NotFound { id: id.to_string() }.into())
    }

    async fn replace_item(
        &self,
        item: Value,
        if_match: &str,
    ) -> Result<StoredItem> {
        self.check()?;
        let id = item_id(&item)?;
        let mut entry = self
            .items
            .get_mut(&id)
            .ok_or_else(|| LeaseError::NotFound { id: id.clone() })?;
        if entry.0 != if_match {
            return Err(LeaseError::PreconditionFailed { id }.into());
        }
        let etag = new_etag();
        *entry = (etag.clone(), item.clone());
        Ok(StoredItem { id, etag, body: item })
    }

    async fn upsert_item(
        &self,
        item: Value,
    ) -> Result<StoredItem> {
        self.check()?;
        let id = item_id(&item)?;
        let etag = new_etag();
        self.items.insert(id.clone(), (etag.clone(), item.clone()));
        Ok(StoredItem { id, etag, body: item })
    }

    async fn delete_item(
        &self,
        id: &str,
        if_match: Option<String>,
    ) -> Result<()> {
        self.check()?;
        let removed = match if_match {
            Some(etag) => self.items.remove_if(id, |_, (current, _)| *current == etag),
            None => self.items.remove(id),
        };
        if removed.is_some() {
            return Ok(());
        }
        if self.items.contains_key(id) {
            Err(LeaseError::PreconditionFailed { id: id.to_string() }.into())
        } else {
            Err(LeaseError::NotFound { id: id.to_string() }.into())
        }
    }

    async fn query_items_by_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<StoredItem>> {
        self.check()?;
        let mut items: Vec<StoredItem> = self
            .items
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| StoredItem {
                id: entry.key().clone(),
                etag: entry.value().0.clone(),
                body: entry.value().1.clone(),
            })
            .collect();
        items.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(items)
    }
}
