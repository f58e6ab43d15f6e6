//! Shared harness for the change feed integration tests
//!
//! Wrappers around the real components that count how often each lease was
//! touched, so tests can assert on exact call counts.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use rivven_changefeed::{
    ChangeFeedObserver, ChangeFeedObserverFactory, ChangeFeedReader, ChangeFeedState,
    CloseReason, DefaultPartitionSupervisorFactory, DocumentLeaseManager, FeedPage, FeedRange,
    FeedRangeGoneHandler, InMemoryChangeFeed, InMemoryDocumentStore, Lease, LeaseContainer,
    LeaseManager, LeaseStore, ObserverContext, PartitionSupervisor, PartitionSupervisorFactory,
    PartitionSynchronizer, ProcessorOptions, RangePartitionSynchronizer, Result,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ============================================================================
// Lease manager
// ============================================================================

/// Lease manager call being counted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Create,
    Acquire,
    Renew,
    Release,
    Delete,
    UpdateProperties,
    Checkpoint,
}

/// [`DocumentLeaseManager`] that records every call per lease token
pub struct RecordingLeaseManager {
    inner: DocumentLeaseManager<InMemoryDocumentStore>,
    calls: Mutex<HashMap<(Op, String), usize>>,
    lock_acquisitions: AtomicUsize,
    acquire_gate: Mutex<Option<Arc<Notify>>>,
}

impl RecordingLeaseManager {
    pub fn new(store: Arc<InMemoryDocumentStore>, prefix: &str, host_name: &str) -> Arc<Self> {
        Arc::new(Self {
            inner: DocumentLeaseManager::new(store, prefix, host_name),
            calls: Mutex::new(HashMap::new()),
            lock_acquisitions: AtomicUsize::new(0),
            acquire_gate: Mutex::new(None),
        })
    }

    /// Hold every later `acquire` until the returned gate is notified once per call
    pub fn gate_acquisitions(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.acquire_gate.lock() = Some(gate.clone());
        gate
    }

    fn record(&self, op: Op, lease_token: &str) {
        *self
            .calls
            .lock()
            .entry((op, lease_token.to_string()))
            .or_default() += 1;
    }

    pub fn count(&self, op: Op, lease_token: &str) -> usize {
        self.calls
            .lock()
            .get(&(op, lease_token.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn total(&self, op: Op) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|((recorded, _), _)| *recorded == op)
            .map(|(_, count)| count)
            .sum()
    }

    pub fn lock_acquisitions(&self) -> usize {
        self.lock_acquisitions.load(Ordering::SeqCst)
    }

    pub async fn lease(&self, lease_token: &str) -> Option<Lease> {
        self.inner
            .get_all_leases()
            .await
            .ok()?
            .into_iter()
            .find(|lease| lease.lease_token == lease_token)
    }

    pub async fn tokens(&self) -> BTreeSet<String> {
        self.inner
            .get_all_leases()
            .await
            .map(|leases| leases.into_iter().map(|lease| lease.lease_token).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LeaseManager for RecordingLeaseManager {
    async fn create_lease_if_not_exist(
        &self,
        feed_range: FeedRange,
        continuation_token: Option<String>,
    ) -> Result<Option<Lease>> {
        let created = self
            .inner
            .create_lease_if_not_exist(feed_range, continuation_token)
            .await?;
        if let Some(lease) = &created {
            self.record(Op::Create, &lease.lease_token);
        }
        Ok(created)
    }

    async fn acquire(&self, lease: &Lease) -> Result<Lease> {
        self.record(Op::Acquire, &lease.lease_token);
        let gate = self.acquire_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.inner.acquire(lease).await
    }

    async fn renew(&self, lease: &Lease) -> Result<Lease> {
        self.record(Op::Renew, &lease.lease_token);
        self.inner.renew(lease).await
    }

    async fn release(&self, lease: &Lease) -> Result<()> {
        self.record(Op::Release, &lease.lease_token);
        self.inner.release(lease).await
    }

    async fn delete(&self, lease: &Lease) -> Result<()> {
        self.record(Op::Delete, &lease.lease_token);
        self.inner.delete(lease).await
    }

    async fn update_properties(&self, lease: &Lease) -> Result<Lease> {
        self.record(Op::UpdateProperties, &lease.lease_token);
        self.inner.update_properties(lease).await
    }

    async fn checkpoint(&self, lease: &Lease, continuation_token: String) -> Result<Lease> {
        self.record(Op::Checkpoint, &lease.lease_token);
        self.inner.checkpoint(lease, continuation_token).await
    }
}

#[async_trait]
impl LeaseContainer for RecordingLeaseManager {
    async fn get_all_leases(&self) -> Result<Vec<Lease>> {
        self.inner.get_all_leases().await
    }

    async fn get_owned_leases(&self) -> Result<Vec<Lease>> {
        self.inner.get_owned_leases().await
    }
}

#[async_trait]
impl LeaseStore for RecordingLeaseManager {
    async fn is_initialized(&self) -> Result<bool> {
        self.inner.is_initialized().await
    }

    async fn mark_initialized(&self) -> Result<()> {
        self.inner.mark_initialized().await
    }

    async fn acquire_initialization_lock(&self, lock_duration: Duration) -> Result<bool> {
        self.lock_acquisitions.fetch_add(1, Ordering::SeqCst);
        self.inner.acquire_initialization_lock(lock_duration).await
    }

    async fn release_initialization_lock(&self) -> Result<bool> {
        self.inner.release_initialization_lock().await
    }
}

// ============================================================================
// Synchronizer
// ============================================================================

/// [`RangePartitionSynchronizer`] counting its entry points
pub struct RecordingSynchronizer {
    inner: RangePartitionSynchronizer,
    create_missing: AtomicUsize,
    create_missing_from: AtomicUsize,
    gone_handled: Arc<Mutex<Vec<String>>>,
}

impl RecordingSynchronizer {
    pub fn new(
        feed: Arc<InMemoryChangeFeed>,
        manager: Arc<RecordingLeaseManager>,
        options: &ProcessorOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: RangePartitionSynchronizer::new(
                feed.resource_id(),
                feed,
                manager.clone(),
                manager,
                options,
            ),
            create_missing: AtomicUsize::new(0),
            create_missing_from: AtomicUsize::new(0),
            gone_handled: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn create_missing_calls(&self) -> usize {
        self.create_missing.load(Ordering::SeqCst)
    }

    pub fn create_missing_from_calls(&self) -> usize {
        self.create_missing_from.load(Ordering::SeqCst)
    }

    /// Lease tokens passed to `handle_partition_gone`, in call order
    pub fn gone_handled(&self) -> Vec<String> {
        self.gone_handled.lock().clone()
    }
}

#[async_trait]
impl PartitionSynchronizer for RecordingSynchronizer {
    async fn create_missing_leases(&self) -> Result<()> {
        self.create_missing.fetch_add(1, Ordering::SeqCst);
        self.inner.create_missing_leases().await
    }

    async fn create_missing_leases_from(&self, legacy_leases: &[Lease]) -> Result<()> {
        self.create_missing_from.fetch_add(1, Ordering::SeqCst);
        self.inner.create_missing_leases_from(legacy_leases).await
    }

    async fn get_feed_range_gone_handler(
        &self,
        lease: &Lease,
    ) -> Result<Box<dyn FeedRangeGoneHandler>> {
        let handler = self.inner.get_feed_range_gone_handler(lease).await?;
        Ok(Box::new(RecordingGoneHandler {
            lease_token: lease.lease_token.clone(),
            inner: handler,
            handled: self.gone_handled.clone(),
        }))
    }
}

struct RecordingGoneHandler {
    lease_token: String,
    inner: Box<dyn FeedRangeGoneHandler>,
    handled: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl FeedRangeGoneHandler for RecordingGoneHandler {
    async fn handle_partition_gone(&self) -> Result<Vec<Lease>> {
        self.handled.lock().push(self.lease_token.clone());
        self.inner.handle_partition_gone().await
    }

    fn should_delete_current_lease(&self) -> bool {
        self.inner.should_delete_current_lease()
    }

    fn should_skip_direct_lease_assignment(&self) -> bool {
        self.inner.should_skip_direct_lease_assignment()
    }
}

// ============================================================================
// Supervisors and observers
// ============================================================================

/// [`DefaultPartitionSupervisorFactory`] counting supervisors per lease token
pub struct CountingSupervisorFactory {
    inner: DefaultPartitionSupervisorFactory,
    created: Mutex<HashMap<String, usize>>,
}

impl CountingSupervisorFactory {
    pub fn new(inner: DefaultPartitionSupervisorFactory) -> Arc<Self> {
        Arc::new(Self {
            inner,
            created: Mutex::new(HashMap::new()),
        })
    }

    pub fn created(&self, lease_token: &str) -> usize {
        self.created.lock().get(lease_token).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.created.lock().values().sum()
    }
}

impl PartitionSupervisorFactory for CountingSupervisorFactory {
    fn create(&self, lease: Lease) -> PartitionSupervisor {
        *self
            .created
            .lock()
            .entry(lease.lease_token.clone())
            .or_default() += 1;
        self.inner.create(lease)
    }
}

/// Everything the observers of one host have seen
#[derive(Default)]
pub struct Recording {
    pub lsns: Mutex<Vec<u64>>,
    pub by_lease: Mutex<HashMap<String, usize>>,
    pub closed: Mutex<Vec<(String, CloseReason)>>,
}

impl Recording {
    pub fn distinct_lsns(&self) -> BTreeSet<u64> {
        self.lsns.lock().iter().copied().collect()
    }

    pub fn seen_by(&self, lease_token: &str) -> usize {
        self.by_lease.lock().get(lease_token).copied().unwrap_or(0)
    }

    pub fn close_reasons(&self, lease_token: &str) -> Vec<CloseReason> {
        self.closed
            .lock()
            .iter()
            .filter(|(token, _)| token == lease_token)
            .map(|(_, reason)| *reason)
            .collect()
    }
}

pub struct RecordingObserverFactory {
    recording: Arc<Recording>,
}

impl RecordingObserverFactory {
    pub fn new() -> (Arc<Self>, Arc<Recording>) {
        let recording = Arc::new(Recording::default());
        (
            Arc::new(Self {
                recording: recording.clone(),
            }),
            recording,
        )
    }
}

impl ChangeFeedObserverFactory for RecordingObserverFactory {
    fn create_observer(&self) -> Arc<dyn ChangeFeedObserver> {
        Arc::new(RecordingObserver {
            recording: self.recording.clone(),
        })
    }
}

struct RecordingObserver {
    recording: Arc<Recording>,
}

#[async_trait]
impl ChangeFeedObserver for RecordingObserver {
    async fn process_changes(
        &self,
        context: &ObserverContext,
        changes: Vec<serde_json::Value>,
    ) -> Result<()> {
        let lsns: Vec<u64> = changes
            .iter()
            .filter_map(|change| change["_lsn"].as_u64())
            .collect();
        *self
            .recording
            .by_lease
            .lock()
            .entry(context.lease_token.clone())
            .or_default() += lsns.len();
        self.recording.lsns.lock().extend(lsns);
        Ok(())
    }

    async fn close(&self, context: &ObserverContext, reason: CloseReason) -> Result<()> {
        self.recording
            .closed
            .lock()
            .push((context.lease_token.clone(), reason));
        Ok(())
    }
}

/// Reader whose reads never complete
pub struct StallingReader;

#[async_trait]
impl ChangeFeedReader for StallingReader {
    fn resource_id(&self) -> String {
        "stalled".to_string()
    }

    async fn read_page(&self, _state: &ChangeFeedState, _max_items: usize) -> Result<FeedPage> {
        futures::future::pending::<Result<FeedPage>>().await
    }
}

// ============================================================================
// Fixture
// ============================================================================

/// One host's worth of components over a shared store and feed
pub struct Host {
    pub options: ProcessorOptions,
    pub manager: Arc<RecordingLeaseManager>,
    pub synchronizer: Arc<RecordingSynchronizer>,
    pub supervisors: Arc<CountingSupervisorFactory>,
    pub recording: Arc<Recording>,
}

impl Host {
    pub fn new(
        options: ProcessorOptions,
        store: Arc<InMemoryDocumentStore>,
        feed: Arc<InMemoryChangeFeed>,
    ) -> Self {
        let manager = RecordingLeaseManager::new(store, &options.lease_prefix, &options.host_name);
        let synchronizer = RecordingSynchronizer::new(feed.clone(), manager.clone(), &options);
        let (observers, recording) = RecordingObserverFactory::new();
        let supervisors = CountingSupervisorFactory::new(DefaultPartitionSupervisorFactory::new(
            observers,
            feed,
            manager.clone(),
            options.clone(),
        ));
        Self {
            options,
            manager,
            synchronizer,
            supervisors,
            recording,
        }
    }

    pub fn controller(&self) -> rivven_changefeed::PartitionController {
        rivven_changefeed::PartitionController::new(
            self.options.host_name.clone(),
            self.manager.clone(),
            self.manager.clone(),
            self.synchronizer.clone(),
            self.supervisors.clone(),
        )
    }
}
