//! Business callbacks driven by the processor
//!
//! One observer instance is created per owned lease. It is opened before the
//! first page is read, receives every non-empty page in order, and is closed
//! with the reason the lease stopped being processed.

use crate::error::{ChangeFeedError, Result};
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Identifies the lease an observer call belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObserverContext {
    pub lease_token: String,
    pub host_name: String,
}

/// Why an observer was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    Unknown,
    /// Host or controller shut down
    Shutdown,
    /// Ownership moved to another host
    LeaseLost,
    /// The lease's range was split or merged
    LeaseGone,
    /// `process_changes` failed
    ObserverError,
    /// No progress within the liveness window
    Stalled,
}

impl CloseReason {
    /// Classify the outcome of a supervised run
    pub fn from_outcome(outcome: &Result<()>) -> Self {
        match outcome {
            Ok(()) | Err(ChangeFeedError::ShuttingDown) => CloseReason::Shutdown,
            Err(ChangeFeedError::FeedRangeGone { .. }) => CloseReason::LeaseGone,
            Err(e) if e.is_partition_gone() => CloseReason::LeaseGone,
            Err(e) if e.is_lease_lost() => CloseReason::LeaseLost,
            Err(ChangeFeedError::Observer(_)) => CloseReason::ObserverError,
            Err(ChangeFeedError::Stalled { .. }) => CloseReason::Stalled,
            Err(_) => CloseReason::Unknown,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CloseReason::Unknown => "unknown",
            CloseReason::Shutdown => "shutdown",
            CloseReason::LeaseLost => "lease_lost",
            CloseReason::LeaseGone => "lease_gone",
            CloseReason::ObserverError => "observer_error",
            CloseReason::Stalled => "stalled",
        };
        f.write_str(name)
    }
}

/// Consumer of change batches for one lease
#[async_trait]
pub trait ChangeFeedObserver: Send + Sync {
    async fn open(&self, _context: &ObserverContext) -> Result<()> {
        Ok(())
    }

    /// Handle one page; the page is checkpointed only after this returns `Ok`
    async fn process_changes(
        &self,
        context: &ObserverContext,
        changes: Vec<serde_json::Value>,
    ) -> Result<()>;

    async fn close(&self, _context: &ObserverContext, _reason: CloseReason) -> Result<()> {
        Ok(())
    }
}

/// Creates one observer per owned lease
pub trait ChangeFeedObserverFactory: Send + Sync {
    fn create_observer(&self) -> Arc<dyn ChangeFeedObserver>;
}

/// Observer backed by an async closure
pub struct FnObserver<F> {
    handler: Arc<F>,
}

#[async_trait]
impl<F, Fut> ChangeFeedObserver for FnObserver<F>
where
    F: Fn(ObserverContext, Vec<serde_json::Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn process_changes(
        &self,
        context: &ObserverContext,
        changes: Vec<serde_json::Value>,
    ) -> Result<()> {
        (self.handler)(context.clone(), changes).await
    }
}

/// Factory handing out [`FnObserver`]s that share one closure
///
/// ```rust,ignore
/// let factory = FnObserverFactory::new(|ctx, changes| async move {
///     tracing::info!(lease_token = %ctx.lease_token, count = changes.len(), "batch");
///     Ok(())
/// });
/// ```
pub struct FnObserverFactory<F> {
    handler: Arc<F>,
}

impl<F> FnObserverFactory<F> {
    pub fn new(handler: F) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }
}

impl<F, Fut> ChangeFeedObserverFactory for FnObserverFactory<F>
where
    F: Fn(ObserverContext, Vec<serde_json::Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn create_observer(&self) -> Arc<dyn ChangeFeedObserver> {
        Arc::new(FnObserver {
            handler: self.handler.clone(),
        })
    }
}
