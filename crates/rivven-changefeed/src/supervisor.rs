//! Supervision of one owned lease
//!
//! A supervisor runs the processor and the renewer side by side under one
//! child cancellation token and polls both. The first failure, a stalled
//! processor or cancellation of the parent token ends the run; both loops are
//! drained before the observer is closed and the outcome returned.

use crate::config::ProcessorOptions;
use crate::error::{ChangeFeedError, Result};
use crate::feed::ChangeFeedReader;
use crate::lease::{Lease, LeaseManager};
use crate::observer::{ChangeFeedObserver, ChangeFeedObserverFactory, CloseReason};
use crate::processor::PartitionProcessor;
use crate::renewer::LeaseRenewer;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Silence beyond this many renew intervals is reported as degraded
pub const DEGRADED_RENEW_MULTIPLIER: u32 = 23;

/// Silence longer than this many renew intervals stops the partition
pub const STALLED_RENEW_MULTIPLIER: u32 = 25;

/// Health of a processor judged by the time since its last successful read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Healthy,
    /// Within `[23, 25]` renew intervals: keep going
    Degraded,
    /// More than 25 renew intervals
    Stalled,
}

impl Liveness {
    pub fn assess(elapsed: Duration, renew_interval: Duration) -> Self {
        if elapsed > renew_interval * STALLED_RENEW_MULTIPLIER {
            Liveness::Stalled
        } else if elapsed >= renew_interval * DEGRADED_RENEW_MULTIPLIER {
            Liveness::Degraded
        } else {
            Liveness::Healthy
        }
    }
}

/// Runs the processor and renewer of one lease
pub struct PartitionSupervisor {
    lease: Lease,
    observer: Arc<dyn ChangeFeedObserver>,
    processor: PartitionProcessor,
    renewer: LeaseRenewer,
    renew_interval: Duration,
    poll_interval: Duration,
}

impl PartitionSupervisor {
    pub fn new(
        lease: Lease,
        observer: Arc<dyn ChangeFeedObserver>,
        processor: PartitionProcessor,
        renewer: LeaseRenewer,
        renew_interval: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            lease,
            observer,
            processor,
            renewer,
            renew_interval,
            poll_interval,
        }
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let context = self.processor.context().clone();
        self.observer.open(&context).await?;
        info!(lease_token = %self.lease.lease_token, "Partition supervisor started");

        let workers = cancel.child_token();
        let (outcome, (), ()) = tokio::join!(
            self.monitor(&cancel, &workers),
            self.processor.run(workers.clone()),
            self.renewer.run(workers.clone()),
        );

        let reason = CloseReason::from_outcome(&outcome);
        if let Err(e) = self.observer.close(&context, reason).await {
            warn!(lease_token = %self.lease.lease_token, error = %e, "Observer close failed");
        }
        info!(
            lease_token = %self.lease.lease_token,
            reason = %reason,
            "Partition supervisor stopped"
        );
        outcome
    }

    /// Poll until the lease must stop, then cancel both workers
    async fn monitor(&self, cancel: &CancellationToken, workers: &CancellationToken) -> Result<()> {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut degraded = false;

        let outcome = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                _ = ticker.tick() => {}
            }

            if let Some(e) = self.processor.result_error() {
                break Err(e);
            }
            if let Some(e) = self.renewer.result_error() {
                break Err(e);
            }

            let elapsed = self.processor.last_processed_time().elapsed();
            match Liveness::assess(elapsed, self.renew_interval) {
                Liveness::Healthy => degraded = false,
                Liveness::Degraded => {
                    if !degraded {
                        warn!(
                            lease_token = %self.lease.lease_token,
                            elapsed_ms = elapsed.as_millis() as u64,
                            "Partition processor is falling behind"
                        );
                        degraded = true;
                    }
                }
                Liveness::Stalled => {
                    break Err(ChangeFeedError::Stalled {
                        lease_token: self.lease.lease_token.clone(),
                        elapsed_ms: elapsed.as_millis() as u64,
                    });
                }
            }
        };

        debug!(lease_token = %self.lease.lease_token, "Stopping partition workers");
        workers.cancel();
        outcome
    }
}

/// Builds the supervisor for a freshly acquired lease
pub trait PartitionSupervisorFactory: Send + Sync {
    fn create(&self, lease: Lease) -> PartitionSupervisor;
}

/// Wires processor, renewer and a new observer for each lease
pub struct DefaultPartitionSupervisorFactory {
    observer_factory: Arc<dyn ChangeFeedObserverFactory>,
    reader: Arc<dyn ChangeFeedReader>,
    manager: Arc<dyn LeaseManager>,
    options: ProcessorOptions,
}

impl DefaultPartitionSupervisorFactory {
    pub fn new(
        observer_factory: Arc<dyn ChangeFeedObserverFactory>,
        reader: Arc<dyn ChangeFeedReader>,
        manager: Arc<dyn LeaseManager>,
        options: ProcessorOptions,
    ) -> Self {
        Self {
            observer_factory,
            reader,
            manager,
            options,
        }
    }
}

impl PartitionSupervisorFactory for DefaultPartitionSupervisorFactory {
    fn create(&self, lease: Lease) -> PartitionSupervisor {
        let processed_batches = Arc::new(AtomicBool::new(false));
        let observer = self.observer_factory.create_observer();
        let processor = PartitionProcessor::new(
            lease.clone(),
            self.reader.clone(),
            observer.clone(),
            self.manager.clone(),
            self.options.clone(),
            processed_batches.clone(),
        );
        let renewer = LeaseRenewer::new(
            lease.clone(),
            self.manager.clone(),
            self.options.lease_renew_interval,
            processed_batches,
        );
        PartitionSupervisor::new(
            lease,
            observer,
            processor,
            renewer,
            self.options.lease_renew_interval,
            self.options.supervisor_poll_interval,
        )
    }
}
