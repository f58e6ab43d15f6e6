//! Per-lease change feed pump
//!
//! ```text
//! read page ──empty──> sleep feed_poll_delay ──┐
//!     │ changes                               │
//!     v                                       │
//! observer.process_changes                    │
//!     v                                       │
//! checkpoint continuation ────────────────────┘
//! ```
//!
//! A checkpoint is written only after the observer accepted the page, so a
//! restart may redeliver a page but never skips one. `processed_batches` is
//! raised only after a checkpointed batch, so an idle partition causes no lease
//! writes. `last_processed` moves on every successful read.

use crate::config::ProcessorOptions;
use crate::error::{ChangeFeedError, Result};
use crate::feed::ChangeFeedReader;
use crate::lease::{Lease, LeaseManager};
use crate::observer::{ChangeFeedObserver, ObserverContext};
use crate::state::{ChangeFeedState, FeedRange};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Writes progress through the owning lease
pub struct PartitionCheckpointer {
    manager: Arc<dyn LeaseManager>,
    lease: Mutex<Lease>,
}

impl PartitionCheckpointer {
    pub fn new(manager: Arc<dyn LeaseManager>, lease: Lease) -> Self {
        Self {
            manager,
            lease: Mutex::new(lease),
        }
    }

    /// Persist `state` and return the stored continuation token
    pub async fn checkpoint(&self, state: &ChangeFeedState) -> Result<String> {
        let token = state.to_string();
        let lease = self.lease.lock().clone();
        let updated = self.manager.checkpoint(&lease, token.clone()).await?;
        *self.lease.lock() = updated;
        Ok(token)
    }

    pub fn lease(&self) -> Lease {
        self.lease.lock().clone()
    }
}

/// Reads the feed for one lease and hands pages to the observer
pub struct PartitionProcessor {
    lease: Lease,
    reader: Arc<dyn ChangeFeedReader>,
    observer: Arc<dyn ChangeFeedObserver>,
    context: ObserverContext,
    checkpointer: PartitionCheckpointer,
    options: ProcessorOptions,
    processed_batches: Arc<AtomicBool>,
    last_processed: Mutex<Instant>,
    result_error: Mutex<Option<ChangeFeedError>>,
}

impl PartitionProcessor {
    pub fn new(
        lease: Lease,
        reader: Arc<dyn ChangeFeedReader>,
        observer: Arc<dyn ChangeFeedObserver>,
        manager: Arc<dyn LeaseManager>,
        options: ProcessorOptions,
        processed_batches: Arc<AtomicBool>,
    ) -> Self {
        let context = ObserverContext {
            lease_token: lease.lease_token.clone(),
            host_name: options.host_name.clone(),
        };
        Self {
            checkpointer: PartitionCheckpointer::new(manager, lease.clone()),
            lease,
            reader,
            observer,
            context,
            options,
            processed_batches,
            last_processed: Mutex::new(Instant::now()),
            result_error: Mutex::new(None),
        }
    }

    /// Last time a page was read successfully
    pub fn last_processed_time(&self) -> Instant {
        *self.last_processed.lock()
    }

    pub fn result_error(&self) -> Option<ChangeFeedError> {
        self.result_error.lock().clone()
    }

    pub fn context(&self) -> &ObserverContext {
        &self.context
    }

    fn initial_state(&self) -> Result<ChangeFeedState> {
        if let Some(state) = self.lease.continuation_state()? {
            return Ok(state);
        }
        match &self.lease.feed_range {
            FeedRange::Epk(range) => Ok(ChangeFeedState::from_start(
                self.reader.resource_id(),
                range.clone(),
                self.options.mode,
                self.options.start_from.clone(),
            )),
            FeedRange::PartitionKeyRange(id) => Err(ChangeFeedError::illegal_state(format!(
                "lease {} uses partition key range {} and must be migrated first",
                self.lease.lease_token, id
            ))),
        }
    }

    fn fail(&self, error: ChangeFeedError) {
        *self.result_error.lock() = Some(error);
    }

    pub async fn run(&self, cancel: CancellationToken) {
        *self.last_processed.lock() = Instant::now();
        let mut state = match self.initial_state() {
            Ok(state) => state,
            Err(e) => {
                warn!(
                    lease_token = %self.lease.lease_token,
                    error = %e,
                    "Invalid lease continuation"
                );
                self.fail(e);
                return;
            }
        };
        info!(lease_token = %self.lease.lease_token, "Partition processor started");

        loop {
            let page = tokio::select! {
                _ = cancel.cancelled() => break,
                page = self.reader.read_page(&state, self.options.max_items_per_page) => page,
            };

            let page = match page {
                Ok(page) => page,
                Err(e) if e.is_partition_gone() => {
                    info!(lease_token = %self.lease.lease_token, reason = %e, "Feed range gone");
                    self.fail(ChangeFeedError::FeedRangeGone {
                        lease_token: self.lease.lease_token.clone(),
                        last_continuation: Some(state.to_string()),
                    });
                    break;
                }
                Err(e) => {
                    warn!(
                        lease_token = %self.lease.lease_token,
                        error = %e,
                        "Change feed read failed"
                    );
                    self.fail(e);
                    break;
                }
            };

            *self.last_processed.lock() = Instant::now();
            state = page.continuation;

            if page.changes.is_empty() {
                if self.idle(&cancel, self.options.feed_poll_delay).await {
                    break;
                }
                continue;
            }

            let count = page.changes.len();
            if let Err(e) = self.observer.process_changes(&self.context, page.changes).await {
                warn!(lease_token = %self.lease.lease_token, error = %e, "Observer failed");
                self.fail(match e {
                    ChangeFeedError::Observer(_) => e,
                    other => ChangeFeedError::observer(other.to_string()),
                });
                break;
            }

            if let Err(e) = self.checkpointer.checkpoint(&state).await {
                warn!(lease_token = %self.lease.lease_token, error = %e, "Checkpoint failed");
                self.fail(e);
                break;
            }

            self.processed_batches.store(true, Ordering::SeqCst);
            debug!(lease_token = %self.lease.lease_token, count, "Processed batch");
        }

        debug!(lease_token = %self.lease.lease_token, "Partition processor stopped");
    }

    /// Sleep unless cancelled; `true` when cancelled
    async fn idle(&self, cancel: &CancellationToken, delay: Duration) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }
}
