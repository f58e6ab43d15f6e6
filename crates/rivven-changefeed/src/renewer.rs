//! Periodic renewal of one owned lease

use crate::error::ChangeFeedError;
use crate::lease::{Lease, LeaseManager};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Keeps a lease alive while its processor makes progress.
///
/// The processor raises `processed_batches`; each verification window the
/// renewer swaps it back to `false` and renews only if it was set. A failed
/// renewal ends the loop and is left for the supervisor to collect.
pub struct LeaseRenewer {
    lease: Mutex<Lease>,
    manager: Arc<dyn LeaseManager>,
    renew_interval: Duration,
    processed_batches: Arc<AtomicBool>,
    result_error: Mutex<Option<ChangeFeedError>>,
}

impl LeaseRenewer {
    pub fn new(
        lease: Lease,
        manager: Arc<dyn LeaseManager>,
        renew_interval: Duration,
        processed_batches: Arc<AtomicBool>,
    ) -> Self {
        Self {
            lease: Mutex::new(lease),
            manager,
            renew_interval,
            processed_batches,
            result_error: Mutex::new(None),
        }
    }

    pub fn lease(&self) -> Lease {
        self.lease.lock().clone()
    }

    pub fn result_error(&self) -> Option<ChangeFeedError> {
        self.result_error.lock().clone()
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = interval(self.renew_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_verification = Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let now = Instant::now();
            if now.duration_since(last_verification) < self.renew_interval {
                continue;
            }
            last_verification = now;

            if !self.processed_batches.swap(false, Ordering::SeqCst) {
                debug!(
                    lease_token = %self.lease.lock().lease_token,
                    "No progress since last renewal, skipping"
                );
                continue;
            }

            let lease = self.lease();
            match self.manager.renew(&lease).await {
                Ok(renewed) => *self.lease.lock() = renewed,
                Err(e) => {
                    warn!(lease_token = %lease.lease_token, error = %e, "Lease renewal failed");
                    *self.result_error.lock() = Some(e);
                    break;
                }
            }
        }
    }
}
