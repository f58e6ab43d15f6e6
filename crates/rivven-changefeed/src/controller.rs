//! Ownership of the per-lease workers on one host
//!
//! ```text
//!              add_or_update_lease
//!                     │
//!        ┌── running? ┴── no ──> acquire ──> spawn supervisor
//!        │ yes                                     │
//!  update_properties                    supervisor finished
//!                                                  │
//!                           FeedRangeGone? ── yes ─┴─> gone handler:
//!                                  │                   start / leave replacements,
//!                                  │                   delete the gone lease
//!                                  v
//!                           release lease, drop worker entry
//! ```
//!
//! The worker map only caches what the lease store decides; a failed acquire
//! leaves no entry behind. A worker releases its lease before removing its own
//! entry, so a concurrent `add_or_update_lease` cannot start a second worker
//! for a lease that is about to be released.

use crate::error::{ChangeFeedError, Result};
use crate::lease::{Lease, LeaseContainer, LeaseManager};
use crate::supervisor::PartitionSupervisorFactory;
use crate::sync::PartitionSynchronizer;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

enum WorkerState {
    /// Acquisition in flight
    Acquiring,
    Running {
        cancel: CancellationToken,
        handle: JoinHandle<()>,
    },
}

struct WorkerEntry {
    generation: u64,
    state: WorkerState,
}

impl WorkerEntry {
    fn is_active(&self) -> bool {
        match &self.state {
            WorkerState::Acquiring => true,
            WorkerState::Running { handle, .. } => !handle.is_finished(),
        }
    }
}

struct ControllerInner {
    host_name: String,
    manager: Arc<dyn LeaseManager>,
    container: Arc<dyn LeaseContainer>,
    synchronizer: Arc<dyn PartitionSynchronizer>,
    factory: Arc<dyn PartitionSupervisorFactory>,
    workers: Mutex<HashMap<String, WorkerEntry>>,
    next_generation: AtomicU64,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

/// Starts, reconciles and stops the partition workers of one host
#[derive(Clone)]
pub struct PartitionController {
    inner: Arc<ControllerInner>,
}

enum Admission {
    Start(u64),
    Running,
    Acquiring,
}

impl PartitionController {
    pub fn new(
        host_name: impl Into<String>,
        manager: Arc<dyn LeaseManager>,
        container: Arc<dyn LeaseContainer>,
        synchronizer: Arc<dyn PartitionSynchronizer>,
        factory: Arc<dyn PartitionSupervisorFactory>,
    ) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                host_name: host_name.into(),
                manager,
                container,
                synchronizer,
                factory,
                workers: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    pub fn host_name(&self) -> &str {
        &self.inner.host_name
    }

    /// Resume every lease the store still records as owned by this host
    pub async fn initialize(&self) -> Result<()> {
        let owned = self.inner.container.get_owned_leases().await?;
        info!(
            host = %self.inner.host_name,
            leases = owned.len(),
            "Resuming owned leases"
        );
        for lease in owned {
            if let Err(e) = self.add_or_update_lease(lease.clone()).await {
                warn!(lease_token = %lease.lease_token, error = %e, "Failed to resume lease");
            }
        }
        Ok(())
    }

    /// Make sure a worker runs for `lease`, acquiring the lease if necessary.
    ///
    /// `Ok` means a worker task exists for the lease. A call that overlaps an
    /// acquisition still in flight on this host fails with
    /// [`ChangeFeedError::AcquisitionInProgress`].
    pub async fn add_or_update_lease(&self, lease: Lease) -> Result<Lease> {
        if self.inner.shutdown.is_cancelled() {
            return Err(ChangeFeedError::ShuttingDown);
        }

        let generation = match self.admit(&lease.lease_token) {
            Admission::Running => {
                let updated = self.inner.manager.update_properties(&lease).await?;
                debug!(lease_token = %lease.lease_token, "Updated properties of running lease");
                return Ok(updated);
            }
            Admission::Acquiring => {
                debug!(lease_token = %lease.lease_token, "Lease acquisition already in progress");
                return Err(ChangeFeedError::AcquisitionInProgress(lease.lease_token));
            }
            Admission::Start(generation) => generation,
        };

        let acquired = match self.inner.manager.acquire(&lease).await {
            Ok(acquired) => acquired,
            Err(e) => {
                self.remove_worker(&lease.lease_token, generation);
                debug!(lease_token = %lease.lease_token, error = %e, "Lease not acquired");
                return Err(e);
            }
        };

        let cancel = self.inner.shutdown.child_token();
        let task = self.process_partition(acquired.clone(), generation, cancel.clone());
        let handle = self.inner.tracker.spawn(task);
        if let Some(entry) = self
            .inner
            .workers
            .lock()
            .get_mut(&acquired.lease_token)
            .filter(|entry| entry.generation == generation)
        {
            entry.state = WorkerState::Running { cancel, handle };
        }

        info!(
            lease_token = %acquired.lease_token,
            host = %self.inner.host_name,
            "Partition worker started"
        );
        Ok(acquired)
    }

    fn admit(&self, lease_token: &str) -> Admission {
        let mut workers = self.inner.workers.lock();
        if let Some(entry) = workers.get(lease_token).filter(|entry| entry.is_active()) {
            return match entry.state {
                WorkerState::Acquiring => Admission::Acquiring,
                WorkerState::Running { .. } => Admission::Running,
            };
        }
        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
        workers.insert(
            lease_token.to_string(),
            WorkerEntry {
                generation,
                state: WorkerState::Acquiring,
            },
        );
        Admission::Start(generation)
    }

    fn remove_worker(&self, lease_token: &str, generation: u64) {
        let mut workers = self.inner.workers.lock();
        if workers
            .get(lease_token)
            .is_some_and(|entry| entry.generation == generation)
        {
            workers.remove(lease_token);
        }
    }

    /// Supervise one lease to completion, then reconcile and release it.
    /// Boxed because reconciliation may start further workers.
    fn process_partition(
        &self,
        lease: Lease,
        generation: u64,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, ()> {
        let controller = self.clone();
        async move {
            let supervisor = controller.inner.factory.create(lease.clone());
            let outcome = supervisor.run(cancel).await;

            let mut deleted = false;
            match outcome {
                Ok(()) => debug!(lease_token = %lease.lease_token, "Partition worker cancelled"),
                Err(ChangeFeedError::FeedRangeGone {
                    last_continuation, ..
                }) => match controller
                    .handle_feed_range_gone(&lease, last_continuation)
                    .await
                {
                    Ok(removed) => deleted = removed,
                    Err(e) => warn!(
                        lease_token = %lease.lease_token,
                        error = %e,
                        "Failed to reconcile gone feed range"
                    ),
                },
                Err(e) => warn!(
                    lease_token = %lease.lease_token,
                    error = %e,
                    "Partition worker stopped"
                ),
            }

            match controller.inner.manager.release(&lease).await {
                Ok(()) => {}
                Err(e) if deleted || e.is_lease_lost() => {
                    debug!(
                        lease_token = %lease.lease_token,
                        error = %e,
                        "Lease already gone on release"
                    )
                }
                Err(e) => {
                    warn!(lease_token = %lease.lease_token, error = %e, "Failed to release lease")
                }
            }
            controller.remove_worker(&lease.lease_token, generation);
        }
        .boxed()
    }

    /// Returns whether the gone lease was deleted
    async fn handle_feed_range_gone(
        &self,
        lease: &Lease,
        last_continuation: Option<String>,
    ) -> Result<bool> {
        let mut gone = lease.clone();
        if last_continuation.is_some() {
            gone.continuation_token = last_continuation;
        }

        let handler = self.inner.synchronizer.get_feed_range_gone_handler(&gone).await?;
        let replacements = handler.handle_partition_gone().await?;

        if handler.should_skip_direct_lease_assignment() {
            info!(
                lease_token = %gone.lease_token,
                replacements = replacements.len(),
                "Leaving replacement leases to the load balancer"
            );
        } else {
            for mut replacement in replacements {
                replacement.properties = gone.properties.clone();
                if let Err(e) = self.add_or_update_lease(replacement.clone()).await {
                    warn!(
                        lease_token = %replacement.lease_token,
                        error = %e,
                        "Failed to start replacement lease"
                    );
                }
            }
        }

        if handler.should_delete_current_lease() {
            self.inner.manager.delete(&gone).await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Lease tokens with a live worker
    pub fn active_leases(&self) -> Vec<String> {
        let mut tokens: Vec<String> = self
            .inner
            .workers
            .lock()
            .iter()
            .filter(|(_, entry)| {
                matches!(entry.state, WorkerState::Running { .. }) && entry.is_active()
            })
            .map(|(token, _)| token.clone())
            .collect();
        tokens.sort();
        tokens
    }

    /// Stop a single worker; its lease is released once it has drained
    pub fn stop_lease(&self, lease_token: &str) -> bool {
        match self.inner.workers.lock().get(lease_token) {
            Some(WorkerEntry {
                state: WorkerState::Running { cancel, .. },
                ..
            }) => {
                cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Cancel every worker and wait until all of them released their lease
    pub async fn shutdown(&self) {
        info!(host = %self.inner.host_name, "Shutting down partition controller");
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!(host = %self.inner.host_name, "Partition controller stopped");
    }
}
