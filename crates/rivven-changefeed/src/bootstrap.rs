//! One-time initialization of the lease set
//!
//! ```text
//! initialized? ──yes──> AlreadyInitialized
//!      │ no
//! legacy store initialized? ──yes──> migrate legacy leases ──> Migrated
//!      │ no
//! lock acquired? ──no──> LockHeldElsewhere (caller retries)
//!      │ yes
//! create leases, mark initialized, release lock ──> Initialized
//! ```
//!
//! Initialization is safe to run on every host at once: only the lock holder
//! mints leases, and lease creation itself is idempotent.

use crate::error::{ChangeFeedError, Result};
use crate::lease::{Lease, LeaseContainer, LeaseManager, LeaseSchemeVersion, LeaseStore};
use crate::sync::PartitionSynchronizer;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Handles onto a lease set written with the per-partition-id scheme
#[derive(Clone)]
pub struct LegacyLeases {
    pub store: Arc<dyn LeaseStore>,
    pub container: Arc<dyn LeaseContainer>,
    pub manager: Arc<dyn LeaseManager>,
}

/// Lease layout the bootstrapper starts from
#[derive(Clone)]
pub enum LeaseScheme {
    /// Range leases only
    EpochRange,
    /// A legacy per-partition lease set exists next to the range leases
    PkRangeId(LegacyLeases),
}

impl LeaseScheme {
    pub fn version(&self) -> LeaseSchemeVersion {
        match self {
            LeaseScheme::EpochRange => LeaseSchemeVersion::EpochRange,
            LeaseScheme::PkRangeId(_) => LeaseSchemeVersion::PkRangeId,
        }
    }
}

/// Result of one [`Bootstrapper::initialize`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// Nothing to do
    AlreadyInitialized,
    /// Leases were created for the current layout
    Initialized,
    /// Leases were converted from the legacy lease set
    Migrated,
    /// Another host is initializing; try again later
    LockHeldElsewhere,
}

/// Initializes the lease store exactly once across all hosts
pub struct Bootstrapper {
    synchronizer: Arc<dyn PartitionSynchronizer>,
    store: Arc<dyn LeaseStore>,
    container: Arc<dyn LeaseContainer>,
    lock_duration: Duration,
    scheme: LeaseScheme,
}

impl Bootstrapper {
    pub fn new(
        synchronizer: Arc<dyn PartitionSynchronizer>,
        store: Arc<dyn LeaseStore>,
        container: Arc<dyn LeaseContainer>,
        lock_duration: Duration,
        scheme: LeaseScheme,
    ) -> Self {
        Self {
            synchronizer,
            store,
            container,
            lock_duration,
            scheme,
        }
    }

    pub fn scheme(&self) -> LeaseSchemeVersion {
        self.scheme.version()
    }

    pub async fn initialize(&self) -> Result<BootstrapOutcome> {
        if self.store.is_initialized().await? {
            debug!("Lease store already initialized");
            return Ok(BootstrapOutcome::AlreadyInitialized);
        }

        if let LeaseScheme::PkRangeId(legacy) = &self.scheme {
            if legacy.store.is_initialized().await? {
                return self.migrate(legacy).await;
            }
        }

        if !self.store.acquire_initialization_lock(self.lock_duration).await? {
            info!("Another host is initializing the lease store");
            return Ok(BootstrapOutcome::LockHeldElsewhere);
        }

        let outcome = self.initialize_locked().await;
        match self.store.release_initialization_lock().await {
            Ok(true) => {}
            Ok(false) => warn!("Initialization lock expired before it was released"),
            Err(e) => warn!(error = %e, "Failed to release initialization lock"),
        }
        outcome
    }

    /// Convert an initialized legacy lease set. No new ranges are minted, so the
    /// store lock is not taken.
    async fn migrate(&self, legacy: &LegacyLeases) -> Result<BootstrapOutcome> {
        let existing = legacy.container.get_all_leases().await?;
        info!(leases = existing.len(), "Migrating legacy leases");

        self.synchronizer.create_missing_leases_from(&existing).await?;
        self.store.mark_initialized().await?;
        legacy.manager.delete_all(&existing).await?;

        info!("Legacy lease migration complete");
        Ok(BootstrapOutcome::Migrated)
    }

    async fn initialize_locked(&self) -> Result<BootstrapOutcome> {
        if self.store.is_initialized().await? {
            return Ok(BootstrapOutcome::AlreadyInitialized);
        }

        let leases = self.container.get_all_leases().await?;
        if !leases.is_empty() {
            self.reject_mixed_versions(&leases).await?;
        }

        self.synchronizer.create_missing_leases().await?;
        self.store.mark_initialized().await?;
        info!("Lease store initialized");
        Ok(BootstrapOutcome::Initialized)
    }

    /// Fail if legacy leases with progress exist beside an uninitialized store
    async fn reject_mixed_versions(&self, leases: &[Lease]) -> Result<()> {
        let probe = match &self.scheme {
            LeaseScheme::PkRangeId(legacy) => legacy.container.get_top_leases(1).await?,
            LeaseScheme::EpochRange => leases
                .iter()
                .filter(|lease| lease.scheme() == LeaseSchemeVersion::PkRangeId)
                .take(1)
                .cloned()
                .collect(),
        };

        if let Some(lease) = probe
            .iter()
            .find(|lease| lease.continuation_token.is_some())
        {
            return Err(ChangeFeedError::illegal_state(format!(
                "legacy lease {} carries a continuation token; the lease container is used \
                 by processors with different lease versions",
                lease.lease_token
            )));
        }
        Ok(())
    }
}
