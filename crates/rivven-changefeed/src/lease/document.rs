//! Lease manager over a document store with per-item etag concurrency
//!
//! Every ownership change is a read-modify-write guarded by the etag read in
//! the same attempt. A lost race re-reads the document and re-applies the
//! change, so a caller holding a stale [`Lease`] still gets a consistent
//! decision based on the stored owner.
//!
//! Besides the lease documents the manager keeps two markers under the prefix:
//!
//! ```text
//! <prefix>.info   store initialized
//! <prefix>.lock   bootstrap lock, expires after the requested duration
//! ```

use super::{Lease, LeaseContainer, LeaseManager, LeaseStore};
use crate::error::{ChangeFeedError, Result};
use crate::state::FeedRange;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Attempts of one conditional update before giving up
const MAX_UPDATE_RETRIES: usize = 5;

/// A document as returned by the store
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub id: String,
    pub etag: String,
    pub body: serde_json::Value,
}

/// Key/document store with optimistic concurrency
#[async_trait]
pub trait LeaseDocumentStore: Send + Sync {
    async fn read(&self, id: &str) -> Result<Option<StoredDocument>>;

    /// Insert a new document; `Conflict` if the id is taken.
    /// A document created with `ttl` disappears once it elapses.
    async fn create(
        &self,
        id: &str,
        body: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<StoredDocument>;

    /// Overwrite a document; `PreconditionFailed` when `if_match` is stale,
    /// `LeaseNotFound` when the document is missing
    async fn replace(
        &self,
        id: &str,
        body: serde_json::Value,
        if_match: &str,
    ) -> Result<StoredDocument>;

    /// Remove a document; `false` when it did not exist
    async fn delete(&self, id: &str, if_match: Option<&str>) -> Result<bool>;

    /// All documents whose id starts with `prefix`, ordered by id
    async fn list(&self, prefix: &str) -> Result<Vec<StoredDocument>>;
}

/// [`LeaseManager`], [`LeaseContainer`] and [`LeaseStore`] for one host over a
/// [`LeaseDocumentStore`]
pub struct DocumentLeaseManager<S> {
    store: Arc<S>,
    prefix: String,
    host_name: String,
}

impl<S> Clone for DocumentLeaseManager<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            prefix: self.prefix.clone(),
            host_name: self.host_name.clone(),
        }
    }
}

impl<S: LeaseDocumentStore> DocumentLeaseManager<S> {
    pub fn new(store: Arc<S>, prefix: impl Into<String>, host_name: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            host_name: host_name.into(),
        }
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn info_id(&self) -> String {
        format!("{}.info", self.prefix)
    }

    fn lock_id(&self) -> String {
        format!("{}.lock", self.prefix)
    }

    fn is_marker(&self, id: &str) -> bool {
        id == self.info_id() || id == self.lock_id()
    }

    fn decode(document: StoredDocument) -> Result<Lease> {
        let mut lease: Lease = serde_json::from_value(document.body)?;
        lease.etag = Some(document.etag);
        Ok(lease)
    }

    async fn read_lease(&self, id: &str) -> Result<Option<Lease>> {
        self.store.read(id).await?.map(Self::decode).transpose()
    }

    async fn read_existing(&self, lease: &Lease) -> Result<Lease> {
        self.read_lease(&lease.id).await?.ok_or_else(|| {
            ChangeFeedError::LeaseLost(format!("lease {} no longer exists", lease.id))
        })
    }

    /// Apply `mutate` to the stored lease and write it back conditionally
    async fn update<F>(&self, lease: &Lease, mut mutate: F) -> Result<Lease>
    where
        F: FnMut(&mut Lease) -> Result<()> + Send,
    {
        let mut current = self.read_existing(lease).await?;

        for attempt in 1..=MAX_UPDATE_RETRIES {
            let mut updated = current.clone();
            mutate(&mut updated)?;
            updated.timestamp = Utc::now();

            let etag = current.etag.clone().unwrap_or_default();
            let body = serde_json::to_value(&updated)?;
            match self.store.replace(&updated.id, body, &etag).await {
                Ok(document) => {
                    updated.etag = Some(document.etag);
                    return Ok(updated);
                }
                Err(ChangeFeedError::PreconditionFailed(_)) => {
                    debug!(
                        lease_token = %lease.lease_token,
                        attempt,
                        "Lease changed concurrently, re-reading"
                    );
                    current = self.read_existing(lease).await?;
                }
                Err(ChangeFeedError::LeaseNotFound(_)) => {
                    return Err(ChangeFeedError::LeaseLost(format!(
                        "lease {} no longer exists",
                        lease.id
                    )));
                }
                Err(e) => return Err(e),
            }
        }

        warn!(
            lease_token = %lease.lease_token,
            "Giving up on lease update after {} conflicts", MAX_UPDATE_RETRIES
        );
        Err(ChangeFeedError::PreconditionFailed(lease.id.clone()))
    }

    fn require_owner(&self, stored: &Lease) -> Result<()> {
        if stored.is_owned_by(&self.host_name) {
            Ok(())
        } else {
            Err(ChangeFeedError::LeaseLost(format!(
                "lease {} is owned by {}",
                stored.lease_token,
                stored.owner.as_deref().unwrap_or("nobody")
            )))
        }
    }
}

#[async_trait]
impl<S: LeaseDocumentStore + 'static> LeaseManager for DocumentLeaseManager<S> {
    async fn create_lease_if_not_exist(
        &self,
        feed_range: FeedRange,
        continuation_token: Option<String>,
    ) -> Result<Option<Lease>> {
        let mut lease = match feed_range {
            FeedRange::Epk(range) => Lease::for_range(&self.prefix, range, continuation_token),
            FeedRange::PartitionKeyRange(id) => {
                Lease::for_partition_key_range(&self.prefix, id, continuation_token)
            }
        };

        let body = serde_json::to_value(&lease)?;
        match self.store.create(&lease.id, body, None).await {
            Ok(document) => {
                info!(lease_token = %lease.lease_token, "Created lease");
                lease.etag = Some(document.etag);
                Ok(Some(lease))
            }
            Err(ChangeFeedError::Conflict(_)) => {
                debug!(lease_token = %lease.lease_token, "Lease already exists");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn acquire(&self, lease: &Lease) -> Result<Lease> {
        let host = self.host_name.clone();
        let acquired = self
            .update(lease, |stored| {
                if !stored.is_unowned() && stored.owner != lease.owner {
                    return Err(ChangeFeedError::LeaseLost(format!(
                        "lease {} was taken by {}",
                        stored.lease_token,
                        stored.owner.as_deref().unwrap_or_default()
                    )));
                }
                stored.owner = Some(host.clone());
                stored.properties = lease.properties.clone();
                Ok(())
            })
            .await?;

        info!(
            lease_token = %acquired.lease_token,
            owner = %self.host_name,
            previous_owner = lease.owner.as_deref().unwrap_or(""),
            "Acquired lease"
        );
        Ok(acquired)
    }

    async fn renew(&self, lease: &Lease) -> Result<Lease> {
        let renewed = self
            .update(lease, |stored| self.require_owner(stored))
            .await?;
        debug!(lease_token = %renewed.lease_token, "Renewed lease");
        Ok(renewed)
    }

    async fn release(&self, lease: &Lease) -> Result<()> {
        self.update(lease, |stored| {
            self.require_owner(stored)?;
            stored.owner = None;
            Ok(())
        })
        .await?;
        info!(lease_token = %lease.lease_token, owner = %self.host_name, "Released lease");
        Ok(())
    }

    async fn delete(&self, lease: &Lease) -> Result<()> {
        if self.store.delete(&lease.id, None).await? {
            info!(lease_token = %lease.lease_token, "Deleted lease");
        } else {
            debug!(lease_token = %lease.lease_token, "Lease already deleted");
        }
        Ok(())
    }

    async fn update_properties(&self, lease: &Lease) -> Result<Lease> {
        self.update(lease, |stored| {
            self.require_owner(stored)?;
            stored.properties = lease.properties.clone();
            Ok(())
        })
        .await
    }

    async fn checkpoint(&self, lease: &Lease, continuation_token: String) -> Result<Lease> {
        let checkpointed = self
            .update(lease, |stored| {
                self.require_owner(stored)?;
                stored.continuation_token = Some(continuation_token.clone());
                Ok(())
            })
            .await?;
        debug!(lease_token = %lease.lease_token, "Checkpointed lease");
        Ok(checkpointed)
    }
}

#[async_trait]
impl<S: LeaseDocumentStore + 'static> LeaseContainer for DocumentLeaseManager<S> {
    async fn get_all_leases(&self) -> Result<Vec<Lease>> {
        self.store
            .list(&self.prefix)
            .await?
            .into_iter()
            .filter(|document| !self.is_marker(&document.id))
            .map(Self::decode)
            .collect()
    }

    async fn get_owned_leases(&self) -> Result<Vec<Lease>> {
        Ok(self
            .get_all_leases()
            .await?
            .into_iter()
            .filter(|lease| lease.is_owned_by(&self.host_name))
            .collect())
    }
}

#[async_trait]
impl<S: LeaseDocumentStore + 'static> LeaseStore for DocumentLeaseManager<S> {
    async fn is_initialized(&self) -> Result<bool> {
        Ok(self.store.read(&self.info_id()).await?.is_some())
    }

    async fn mark_initialized(&self) -> Result<()> {
        let id = self.info_id();
        let body = json!({ "id": id, "initializedBy": self.host_name });
        match self.store.create(&id, body, None).await {
            Ok(_) => {
                info!(prefix = %self.prefix, "Lease store initialized");
                Ok(())
            }
            Err(ChangeFeedError::Conflict(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn acquire_initialization_lock(&self, lock_duration: Duration) -> Result<bool> {
        let id = self.lock_id();
        let body = json!({ "id": id, "owner": self.host_name });
        match self.store.create(&id, body, Some(lock_duration)).await {
            Ok(_) => {
                debug!(owner = %self.host_name, "Acquired initialization lock");
                Ok(true)
            }
            Err(ChangeFeedError::Conflict(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn release_initialization_lock(&self) -> Result<bool> {
        let id = self.lock_id();
        let Some(document) = self.store.read(&id).await? else {
            return Ok(false);
        };
        if document.body.get("owner").and_then(|v| v.as_str()) != Some(self.host_name.as_str()) {
            warn!(owner = %self.host_name, "Initialization lock is held by another host");
            return Ok(false);
        }
        match self.store.delete(&id, Some(&document.etag)).await {
            Ok(deleted) => Ok(deleted),
            Err(ChangeFeedError::PreconditionFailed(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::InMemoryDocumentStore;
    use crate::range::Range;

    fn managers() -> (
        DocumentLeaseManager<InMemoryDocumentStore>,
        DocumentLeaseManager<InMemoryDocumentStore>,
    ) {
        let store = Arc::new(InMemoryDocumentStore::new());
        (
            DocumentLeaseManager::new(store.clone(), "orders.", "host-a"),
            DocumentLeaseManager::new(store, "orders.", "host-b"),
        )
    }

    async fn create(manager: &DocumentLeaseManager<InMemoryDocumentStore>) -> Lease {
        manager
            .create_lease_if_not_exist(FeedRange::Epk(Range::new("AA", "CC")), None)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let (a, _) = managers();
        let lease = create(&a).await;
        assert_eq!(lease.id, "orders.AA-CC");
        assert!(lease.etag.is_some());

        let again = a
            .create_lease_if_not_exist(FeedRange::Epk(Range::new("AA", "CC")), None)
            .await
            .unwrap();
        assert!(again.is_none());
        assert_eq!(a.get_all_leases().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_acquire_renew_release() {
        let (a, _) = managers();
        let lease = create(&a).await;

        let owned = a.acquire(&lease).await.unwrap();
        assert!(owned.is_owned_by("host-a"));
        assert_eq!(a.get_owned_leases().await.unwrap().len(), 1);

        let renewed = a.renew(&owned).await.unwrap();
        assert_ne!(renewed.etag, owned.etag);

        a.release(&renewed).await.unwrap();
        let stored = a.get_all_leases().await.unwrap().remove(0);
        assert!(stored.is_unowned());
    }

    #[tokio::test]
    async fn test_acquire_with_stale_owner_view_fails() {
        let (a, b) = managers();
        let unowned = create(&a).await;

        a.acquire(&unowned).await.unwrap();
        let err = b.acquire(&unowned).await.unwrap_err();
        assert!(err.is_lease_lost());
    }

    #[tokio::test]
    async fn test_takeover_of_observed_owner() {
        let (a, b) = managers();
        let lease = create(&a).await;
        a.acquire(&lease).await.unwrap();

        let observed = b.get_all_leases().await.unwrap().remove(0);
        let taken = b.acquire(&observed).await.unwrap();
        assert!(taken.is_owned_by("host-b"));

        let err = a.renew(&observed).await.unwrap_err();
        assert!(matches!(err, ChangeFeedError::LeaseLost(_)));
    }

    #[tokio::test]
    async fn test_checkpoint_requires_ownership() {
        let (a, b) = managers();
        let lease = a.acquire(&create(&a).await).await.unwrap();

        let err = b.checkpoint(&lease, "token".into()).await.unwrap_err();
        assert!(err.is_lease_lost());

        let stale = lease.clone();
        a.renew(&lease).await.unwrap();
        let checkpointed = a.checkpoint(&stale, "token".into()).await.unwrap();
        assert_eq!(checkpointed.continuation_token.as_deref(), Some("token"));
    }

    #[tokio::test]
    async fn test_missing_lease_is_lost() {
        let (a, _) = managers();
        let lease = a.acquire(&create(&a).await).await.unwrap();
        a.delete(&lease).await.unwrap();
        a.delete(&lease).await.unwrap();

        assert!(a.renew(&lease).await.unwrap_err().is_lease_lost());
        assert!(a.get_all_leases().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_initialization_lock_is_exclusive() {
        let (a, b) = managers();
        assert!(!a.is_initialized().await.unwrap());

        assert!(a.acquire_initialization_lock(Duration::from_secs(60)).await.unwrap());
        assert!(!b.acquire_initialization_lock(Duration::from_secs(60)).await.unwrap());
        assert!(!b.release_initialization_lock().await.unwrap());

        a.mark_initialized().await.unwrap();
        a.mark_initialized().await.unwrap();
        assert!(b.is_initialized().await.unwrap());
        assert!(a.release_initialization_lock().await.unwrap());
        assert!(b.acquire_initialization_lock(Duration::from_secs(60)).await.unwrap());

        // markers are not leases
        assert!(a.get_all_leases().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_top_leases_ordered_by_id() {
        let (a, _) = managers();
        for (min, max) in [("CC", "FF"), ("", "AA"), ("AA", "CC")] {
            a.create_lease_if_not_exist(FeedRange::Epk(Range::new(min, max)), None)
                .await
                .unwrap();
        }
        let top = a.get_top_leases(2).await.unwrap();
        let tokens: Vec<_> = top.iter().map(|l| l.lease_token.as_str()).collect();
        assert_eq!(tokens, vec!["-AA", "AA-CC"]);
    }
}
