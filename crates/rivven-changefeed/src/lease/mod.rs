//! Lease model and lease storage contracts
//!
//! A [`Lease`] is the durable ownership and progress record for one feed range.
//! Exclusivity is decided solely by the store's conditional update: the
//! in-process bookkeeping of the controller is a cache, never the source of
//! truth.
//!
//! | Trait | Role |
//! |-------|------|
//! | [`LeaseManager`] | ownership transitions and checkpoints of single leases |
//! | [`LeaseContainer`] | enumeration of leases |
//! | [`LeaseStore`] | store-wide initialization flag and bootstrap lock |
//! | [`LeaseDocumentStore`] | the backing key/document store with etag concurrency |

mod document;
mod memory;

pub use document::{DocumentLeaseManager, LeaseDocumentStore, StoredDocument};
pub use memory::InMemoryDocumentStore;

use crate::error::Result;
use crate::range::Range;
use crate::state::{ChangeFeedState, FeedRange};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Keying scheme of a lease set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeaseSchemeVersion {
    /// Legacy: one lease per physical partition key range id
    PkRangeId,
    /// One lease per effective-partition-key range
    EpochRange,
}

/// Ownership and progress record for one feed range
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub id: String,

    #[serde(rename = "LeaseToken")]
    pub lease_token: String,

    #[serde(rename = "Owner", default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,

    #[serde(rename = "feedRange")]
    pub feed_range: FeedRange,

    /// Opaque serialized [`ChangeFeedState`] (or a raw server token for legacy leases)
    #[serde(
        rename = "ContinuationToken",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub continuation_token: Option<String>,

    /// Last time the lease document was written
    pub timestamp: DateTime<Utc>,

    /// Concurrency version assigned by the store; never part of the document body
    #[serde(skip)]
    pub etag: Option<String>,

    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl Lease {
    /// New unowned lease for an effective-key range
    pub fn for_range(prefix: &str, range: Range, continuation_token: Option<String>) -> Self {
        let lease_token = range.lease_token();
        Self {
            id: format!("{}{}", prefix, lease_token),
            lease_token,
            owner: None,
            feed_range: FeedRange::Epk(range),
            continuation_token,
            timestamp: Utc::now(),
            etag: None,
            properties: HashMap::new(),
        }
    }

    /// New unowned lease keyed by a physical partition key range id
    pub fn for_partition_key_range(
        prefix: &str,
        range_id: impl Into<String>,
        continuation_token: Option<String>,
    ) -> Self {
        let lease_token = range_id.into();
        Self {
            id: format!("{}{}", prefix, lease_token),
            lease_token: lease_token.clone(),
            owner: None,
            feed_range: FeedRange::PartitionKeyRange(lease_token),
            continuation_token,
            timestamp: Utc::now(),
            etag: None,
            properties: HashMap::new(),
        }
    }

    pub fn scheme(&self) -> LeaseSchemeVersion {
        match self.feed_range {
            FeedRange::Epk(_) => LeaseSchemeVersion::EpochRange,
            FeedRange::PartitionKeyRange(_) => LeaseSchemeVersion::PkRangeId,
        }
    }

    pub fn epk_range(&self) -> Option<&Range> {
        self.feed_range.epk()
    }

    pub fn is_owned_by(&self, host_name: &str) -> bool {
        self.owner.as_deref() == Some(host_name)
    }

    pub fn is_unowned(&self) -> bool {
        self.owner.as_deref().map(str::is_empty).unwrap_or(true)
    }

    /// Owner has not written the lease within `expiration`
    pub fn is_expired(&self, expiration: Duration, now: DateTime<Utc>) -> bool {
        let expiration = chrono::Duration::from_std(expiration)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        self.timestamp
            .checked_add_signed(expiration)
            .map(|deadline| deadline < now)
            .unwrap_or(false)
    }

    /// Decode the checkpointed progress, if any
    pub fn continuation_state(&self) -> Result<Option<ChangeFeedState>> {
        self.continuation_token
            .as_deref()
            .map(str::parse::<ChangeFeedState>)
            .transpose()
    }
}

/// Ownership transitions and checkpoints for single leases
#[async_trait]
pub trait LeaseManager: Send + Sync {
    /// Create a lease for `feed_range`; `None` when one already exists
    async fn create_lease_if_not_exist(
        &self,
        feed_range: FeedRange,
        continuation_token: Option<String>,
    ) -> Result<Option<Lease>>;

    /// Take ownership; fails with `LeaseLost` if the owner changed since `lease` was read
    async fn acquire(&self, lease: &Lease) -> Result<Lease>;

    /// Refresh the timestamp of a lease owned by this host
    async fn renew(&self, lease: &Lease) -> Result<Lease>;

    /// Give up ownership of a lease owned by this host
    async fn release(&self, lease: &Lease) -> Result<()>;

    /// Remove the lease; a missing lease is not an error
    async fn delete(&self, lease: &Lease) -> Result<()>;

    async fn delete_all(&self, leases: &[Lease]) -> Result<()> {
        for lease in leases {
            self.delete(lease).await?;
        }
        Ok(())
    }

    /// Persist `lease.properties` for a lease owned by this host
    async fn update_properties(&self, lease: &Lease) -> Result<Lease>;

    /// Persist progress for a lease owned by this host
    async fn checkpoint(&self, lease: &Lease, continuation_token: String) -> Result<Lease>;
}

/// Enumeration of the lease set
#[async_trait]
pub trait LeaseContainer: Send + Sync {
    async fn get_all_leases(&self) -> Result<Vec<Lease>>;

    async fn get_owned_leases(&self) -> Result<Vec<Lease>>;

    /// First `count` leases ordered by id
    async fn get_top_leases(&self, count: usize) -> Result<Vec<Lease>> {
        let mut leases = self.get_all_leases().await?;
        leases.sort_by(|a, b| a.id.cmp(&b.id));
        leases.truncate(count);
        Ok(leases)
    }
}

/// Store-wide initialization state
#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn is_initialized(&self) -> Result<bool>;

    async fn mark_initialized(&self) -> Result<()>;

    /// `false` when another host holds the lock
    async fn acquire_initialization_lock(&self, lock_duration: Duration) -> Result<bool>;

    async fn release_initialization_lock(&self) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epk_lease_identity() {
        let lease = Lease::for_range("orders.", Range::new("AA", "CC"), None);
        assert_eq!(lease.id, "orders.AA-CC");
        assert_eq!(lease.lease_token, "AA-CC");
        assert_eq!(lease.scheme(), LeaseSchemeVersion::EpochRange);
        assert!(lease.is_unowned());
    }

    #[test]
    fn test_legacy_lease_scheme() {
        let lease = Lease::for_partition_key_range("", "3", Some("\"17\"".into()));
        assert_eq!(lease.scheme(), LeaseSchemeVersion::PkRangeId);
        assert!(lease.epk_range().is_none());
    }

    #[test]
    fn test_expiry() {
        let mut lease = Lease::for_range("", Range::full(), None);
        lease.owner = Some("host-a".into());
        let now = lease.timestamp + chrono::Duration::seconds(61);
        assert!(lease.is_expired(Duration::from_secs(60), now));
        assert!(!lease.is_expired(Duration::from_secs(120), now));
        assert!(lease.is_owned_by("host-a"));
    }

    #[test]
    fn test_document_body_excludes_etag() {
        let mut lease = Lease::for_range("", Range::full(), None);
        lease.etag = Some("7".into());
        let body = serde_json::to_value(&lease).unwrap();
        assert!(body.get("etag").is_none());
        assert_eq!(body["LeaseToken"], "-FF");
        assert_eq!(body["feedRange"]["Range"]["max"], "FF");

        let decoded: Lease = serde_json::from_value(body).unwrap();
        assert_eq!(decoded.etag, None);
        assert_eq!(decoded.lease_token, lease.lease_token);
    }
}
