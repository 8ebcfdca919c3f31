use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use serde_json::Value;
use tokio::time::timeout;
use tracing::debug;
use tracing::trace;

use super::HostRegistration;
use super::Lease;
use super::LeaseContainer;
use super::DRAINED_PROPERTY;
use crate::BackoffPolicy;
use crate::Clock;
use crate::Error;
use crate::FeedRange;
use crate::LeaseError;
use crate::Result;

/// ETag-guarded operations on the lease documents of one processor.
///
/// Every document this manager touches has an id starting with
/// `"{lease_prefix}{feed_container_id}.."`, so several processors can share
/// one lease container.
///
/// Mutations follow read-ETag / write / verify: a write rejected because the
/// document changed re-reads the server copy and re-applies the mutation if
/// the ownership it requires still holds. Otherwise the call fails with
/// `LeaseError::Lost`.
#[derive(Debug)]
pub struct LeaseStoreManager {
    container: Arc<dyn LeaseContainer>,
    prefix: String,
    clock: Arc<dyn Clock>,
    policy: BackoffPolicy,
    expiration_ms: u64,
}

impl LeaseStoreManager {
    pub fn new(
        container: Arc<dyn LeaseContainer>,
        lease_prefix: &str,
        feed_container_id: &str,
        clock: Arc<dyn Clock>,
        policy: BackoffPolicy,
        expiration: Duration,
    ) -> Self {
        Self {
            container,
            prefix: format!("{lease_prefix}{feed_container_id}.."),
            clock,
            policy,
            expiration_ms: expiration.as_millis() as u64,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn lease_id(
        &self,
        lease_token: &str,
    ) -> String {
        format!("{}lease.{lease_token}", self.prefix)
    }

    fn host_id(
        &self,
        host_name: &str,
    ) -> String {
        format!("{}host.{host_name}", self.prefix)
    }

    fn info_id(&self) -> String {
        format!("{}info", self.prefix)
    }

    fn lock_id(&self) -> String {
        format!("{}lock", self.prefix)
    }

    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    pub fn expiration_ms(&self) -> u64 {
        self.expiration_ms
    }

    /// Bounds one container call by the per-attempt timeout.
    async fn call<T>(
        &self,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let limit = Duration::from_millis(self.policy.timeout_ms);
        match timeout(limit, fut).await {
            Ok(r) => r,
            Err(_) => Err(LeaseError::Unavailable(format!(
                "lease container {} did not answer within {:?}",
                self.container.id(),
                limit
            ))
            .into()),
        }
    }

    pub async fn list_leases(&self) -> Result<Vec<Lease>> {
        let prefix = format!("{}lease.", self.prefix);
        let items = self.call(self.container.query_items_by_prefix(&prefix)).await?;
        items.into_iter().map(Lease::from_stored).collect()
    }

    pub async fn read_lease(
        &self,
        lease_token: &str,
    ) -> Result<Lease> {
        let item = self.call(self.container.read_item(&self.lease_id(lease_token))).await?;
        Lease::from_stored(item)
    }

    /// Creates the lease for a partition. Returns `None` when it already exists.
    pub async fn create_lease_if_not_exists(
        &self,
        lease_token: &str,
        feed_range: FeedRange,
        continuation_token: Option<String>,
        owner: Option<&str>,
    ) -> Result<Option<Lease>> {
        let lease = Lease {
            id: self.lease_id(lease_token),
            lease_token: lease_token.to_string(),
            feed_range,
            owner: owner.map(str::to_string),
            continuation_token,
            timestamp: self.clock.now_millis(),
            properties: HashMap::new(),
            etag: String::new(),
        };

        match self.call(self.container.create_item(serde_json::to_value(&lease)?)).await {
            Ok(stored) => {
                debug!(%lease_token, "lease created");
                Lease::from_stored(stored).map(Some)
            }
            Err(Error::Lease(LeaseError::Conflict { .. })) => {
                trace!(%lease_token, "lease already exists");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Takes a lease that is unowned, expired, or already ours.
    pub async fn acquire(
        &self,
        lease: &Lease,
        host_name: &str,
    ) -> Result<Lease> {
        let now = self.clock.now_millis();
        let expiration_ms = self.expiration_ms;
        self.update(lease, |l| {
            if l.is_live(now, expiration_ms) && !l.is_owned_by(host_name) {
                return Err(lost(l));
            }
            l.owner = Some(host_name.to_string());
            l.timestamp = now;
            Ok(())
        })
        .await
    }

    /// Refreshes the timestamp of a lease this host owns. The stored
    /// continuation is carried forward untouched.
    pub async fn renew(
        &self,
        lease: &Lease,
        host_name: &str,
    ) -> Result<Lease> {
        let now = self.clock.now_millis();
        self.update(lease, |l| {
            if !l.is_owned_by(host_name) {
                return Err(lost(l));
            }
            l.timestamp = now;
            Ok(())
        })
        .await
    }

    /// Clears the owner so that other hosts can take the lease immediately.
    pub async fn release(
        &self,
        lease: &Lease,
        host_name: &str,
    ) -> Result<Lease> {
        let now = self.clock.now_millis();
        self.update(lease, |l| {
            if !l.is_owned_by(host_name) {
                return Err(lost(l));
            }
            l.owner = None;
            l.timestamp = now;
            Ok(())
        })
        .await
    }

    /// Persists the cursor after a batch was delivered.
    pub async fn checkpoint(
        &self,
        lease: &Lease,
        host_name: &str,
        continuation_token: &str,
    ) -> Result<Lease> {
        let now = self.clock.now_millis();
        self.update(lease, |l| {
            if !l.is_owned_by(host_name) {
                return Err(lost(l));
            }
            l.continuation_token = Some(continuation_token.to_string());
            l.timestamp = now;
            Ok(())
        })
        .await
    }

    /// Records that the lease's partition was merged away and read to the end.
    pub async fn mark_drained(
        &self,
        lease: &Lease,
        host_name: &str,
        continuation_token: Option<String>,
    ) -> Result<Lease> {
        let now = self.clock.now_millis();
        self.update(lease, |l| {
            if !l.is_owned_by(host_name) {
                return Err(lost(l));
            }
            if continuation_token.is_some() {
                l.continuation_token = continuation_token.clone();
            }
            l.properties.insert(DRAINED_PROPERTY.to_string(), "true".to_string());
            l.timestamp = now;
            Ok(())
        })
        .await
    }

    /// Deletes a lease this host owns, or one that is drained. Deleting a
    /// missing lease succeeds.
    ///
    /// The delete is guarded by the ETag of the copy it last read; a rejected
    /// delete re-reads the lease and fails with `LeaseError::Lost` once
    /// another host holds it.
    pub async fn delete(
        &self,
        lease: &Lease,
        host_name: &str,
    ) -> Result<()> {
        let mut current = lease.clone();
        let attempts = self.policy.max_retries.max(1);

        for attempt in 0..attempts {
            if !current.is_owned_by(host_name) && !current.is_drained() {
                return Err(lost(lease));
            }

            match self
                .call(self.container.delete_item(&lease.id, Some(current.etag.clone())))
                .await
            {
                Ok(()) | Err(Error::Lease(LeaseError::NotFound { .. })) => return Ok(()),
                Err(Error::Lease(LeaseError::PreconditionFailed { .. })) => {
                    trace!(lease_token = %lease.lease_token, attempt, "etag mismatch on delete, re-reading lease");
                    current = match self.call(self.container.read_item(&lease.id)).await {
                        Ok(item) => Lease::from_stored(item)?,
                        Err(Error::Lease(LeaseError::NotFound { .. })) => return Ok(()),
                        Err(e) => return Err(e),
                    };
                }
                Err(e) => return Err(e),
            }
        }

        Err(LeaseError::PreconditionFailed { id: lease.id.clone() }.into())
    }

    async fn update<F>(
        &self,
        lease: &Lease,
        mutate: F,
    ) -> Result<Lease>
    where
        F: Fn(&mut Lease) -> Result<()> + Send + Sync,
    {
        let mut current = lease.clone();
        let attempts = self.policy.max_retries.max(1);

        for attempt in 0..attempts {
            let mut candidate = current.clone();
            mutate(&mut candidate)?;
            let body = serde_json::to_value(&candidate)?;

            match self.call(self.container.replace_item(body, &current.etag)).await {
                Ok(stored) => return Lease::from_stored(stored),
                Err(Error::Lease(LeaseError::PreconditionFailed { .. })) => {
                    trace!(lease_token = %lease.lease_token, attempt, "etag mismatch, re-reading lease");
                    current = match self.call(self.container.read_item(&lease.id)).await {
                        Ok(item) => Lease::from_stored(item)?,
                        Err(Error::Lease(LeaseError::NotFound { .. })) => return Err(lost(lease)),
                        Err(e) => return Err(e),
                    };
                }
                Err(Error::Lease(LeaseError::NotFound { .. })) => return Err(lost(lease)),
                Err(e) => return Err(e),
            }
        }

        Err(LeaseError::PreconditionFailed { id: lease.id.clone() }.into())
    }

    // ---------------------------------------------------------------------
    // Host registrations

    pub async fn register_host(
        &self,
        host_name: &str,
        owned_leases: Vec<String>,
    ) -> Result<()> {
        let registration = HostRegistration {
            id: self.host_id(host_name),
            host_name: host_name.to_string(),
            owned_leases,
            last_activity: self.clock.now_millis(),
        };
        self.call(self.container.upsert_item(serde_json::to_value(&registration)?))
            .await?;
        Ok(())
    }

    pub async fn unregister_host(
        &self,
        host_name: &str,
    ) -> Result<()> {
        match self.call(self.container.delete_item(&self.host_id(host_name), None)).await {
            Ok(()) | Err(Error::Lease(LeaseError::NotFound { .. })) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn list_hosts(&self) -> Result<Vec<HostRegistration>> {
        let prefix = format!("{}host.", self.prefix);
        let items = self.call(self.container.query_items_by_prefix(&prefix)).await?;
        items
            .into_iter()
            .map(|item| serde_json::from_value(item.body).map_err(Error::from))
            .collect()
    }

    /// Deletes registrations not refreshed within `max_idle_ms`, left behind
    /// by hosts that crashed. Returns how many were removed.
    pub async fn remove_stale_hosts(
        &self,
        max_idle_ms: u64,
    ) -> Result<usize> {
        let prefix = format!("{}host.", self.prefix);
        let now = self.clock.now_millis();
        let mut removed = 0;
        for item in self.call(self.container.query_items_by_prefix(&prefix)).await? {
            let registration: HostRegistration = serde_json::from_value(item.body)?;
            if registration.is_active(now, max_idle_ms) {
                continue;
            }
            // A host that came back in the meantime changed the ETag.
            match self.call(self.container.delete_item(&item.id, Some(item.etag))).await {
                Ok(()) => {
                    debug!(host = %registration.host_name, "stale host registration removed");
                    removed += 1;
                }
                Err(Error::Lease(LeaseError::NotFound { .. })) | Err(Error::Lease(LeaseError::PreconditionFailed { .. })) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(removed)
    }

    // ---------------------------------------------------------------------
    // Store initialisation bookkeeping

    pub async fn is_initialized(&self) -> Result<bool> {
        match self.call(self.container.read_item(&self.info_id())).await {
            Ok(_) => Ok(true),
            Err(Error::Lease(LeaseError::NotFound { .. })) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn mark_initialized(
        &self,
        host_name: &str,
    ) -> Result<()> {
        let info = json!({
            "id": self.info_id(),
            "initialized_by": host_name,
            "timestamp": self.clock.now_millis(),
        });
        match self.call(self.container.create_item(info)).await {
            Ok(_) | Err(Error::Lease(LeaseError::Conflict { .. })) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Takes the initialisation lock. A lock older than `ttl_ms` is considered
    /// abandoned and taken over.
    pub async fn try_acquire_init_lock(
        &self,
        host_name: &str,
        ttl_ms: u64,
    ) -> Result<bool> {
        let now = self.clock.now_millis();
        let lock = json!({
            "id": self.lock_id(),
            "owner": host_name,
            "timestamp": now,
        });

        match self.call(self.container.create_item(lock.clone())).await {
            Ok(_) => return Ok(true),
            Err(Error::Lease(LeaseError::Conflict { .. })) => {}
            Err(e) => return Err(e),
        }

        let existing = match self.call(self.container.read_item(&self.lock_id())).await {
            Ok(item) => item,
            Err(Error::Lease(LeaseError::NotFound { .. })) => return Ok(false),
            Err(e) => return Err(e),
        };
        let taken_at = existing.body.get("timestamp").and_then(Value::as_u64).unwrap_or(0);
        if now.saturating_sub(taken_at) <= ttl_ms {
            return Ok(false);
        }

        debug!(%host_name, "taking over abandoned initialisation lock");
        match self.call(self.container.replace_item(lock, &existing.etag)).await {
            Ok(_) => Ok(true),
            Err(Error::Lease(LeaseError::PreconditionFailed { .. })) | Err(Error::Lease(LeaseError::NotFound { .. })) => {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn release_init_lock(
        &self,
        host_name: &str,
    ) -> Result<()> {
        let existing = match self.call(self.container.read_item(&self.lock_id())).await {
            Ok(item) => item,
            Err(Error::Lease(LeaseError::NotFound { .. })) => return Ok(()),
            Err(e) => return Err(e),
        };
        if existing.body.get("owner").and_then(Value::as_str) != Some(host_name) {
            return Ok(());
        }
        match self
            .call(self.container.delete_item(&existing.id, Some(existing.etag.clone())))
            .await
        {
            Ok(()) | Err(Error::Lease(LeaseError::NotFound { .. })) => Ok(()),
            Err(Error::Lease(LeaseError::PreconditionFailed { .. })) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn lost(lease: &Lease) -> Error {
    LeaseError::Lost {
        lease_token: lease.lease_token.clone(),
    }
    .into()
}
