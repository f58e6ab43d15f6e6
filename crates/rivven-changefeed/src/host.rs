//! Host-facing change feed processor
//!
//! ```rust,ignore
//! let processor = ChangeFeedProcessor::builder()
//!     .options(ProcessorOptions::builder().host_name("worker-1").build()?)
//!     .feed(feed.clone())
//!     .leases(Arc::new(DocumentLeaseManager::new(store, "orders.", "worker-1")))
//!     .observer_factory(Arc::new(FnObserverFactory::new(handle_changes)))
//!     .build()?;
//!
//! processor.start().await?;
//! // ...
//! processor.stop().await;
//! ```

use crate::balancer::{
    EqualPartitionsBalancingStrategy, PartitionLoadBalancer, PartitionLoadBalancingStrategy,
};
use crate::bootstrap::{BootstrapOutcome, Bootstrapper, LeaseScheme, LegacyLeases};
use crate::config::ProcessorOptions;
use crate::controller::PartitionController;
use crate::error::{ChangeFeedError, Result};
use crate::feed::{ChangeFeedReader, PartitionKeyRangeProvider};
use crate::lease::{LeaseContainer, LeaseManager, LeaseStore};
use crate::observer::ChangeFeedObserverFactory;
use crate::supervisor::DefaultPartitionSupervisorFactory;
use crate::sync::RangePartitionSynchronizer;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Snapshot of one lease for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaseStateInfo {
    pub lease_token: String,
    pub owner: Option<String>,
    pub continuation_token: Option<String>,
}

/// Builder for [`ChangeFeedProcessor`]
#[derive(Default)]
pub struct ChangeFeedProcessorBuilder {
    options: Option<ProcessorOptions>,
    reader: Option<Arc<dyn ChangeFeedReader>>,
    ranges: Option<Arc<dyn PartitionKeyRangeProvider>>,
    manager: Option<Arc<dyn LeaseManager>>,
    container: Option<Arc<dyn LeaseContainer>>,
    store: Option<Arc<dyn LeaseStore>>,
    observer_factory: Option<Arc<dyn ChangeFeedObserverFactory>>,
    strategy: Option<Arc<dyn PartitionLoadBalancingStrategy>>,
    legacy: Option<LegacyLeases>,
}

impl ChangeFeedProcessorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn options(mut self, options: ProcessorOptions) -> Self {
        self.options = Some(options);
        self
    }

    /// Feed that is both read and asked for its partition layout
    pub fn feed<F>(mut self, feed: Arc<F>) -> Self
    where
        F: ChangeFeedReader + PartitionKeyRangeProvider + 'static,
    {
        self.reader = Some(feed.clone());
        self.ranges = Some(feed);
        self
    }

    pub fn reader(mut self, reader: Arc<dyn ChangeFeedReader>) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn partition_key_ranges(mut self, ranges: Arc<dyn PartitionKeyRangeProvider>) -> Self {
        self.ranges = Some(ranges);
        self
    }

    /// Lease backend implementing every lease contract
    pub fn leases<L>(mut self, leases: Arc<L>) -> Self
    where
        L: LeaseManager + LeaseContainer + LeaseStore + 'static,
    {
        self.manager = Some(leases.clone());
        self.container = Some(leases.clone());
        self.store = Some(leases);
        self
    }

    pub fn observer_factory(mut self, factory: Arc<dyn ChangeFeedObserverFactory>) -> Self {
        self.observer_factory = Some(factory);
        self
    }

    /// Replace the default [`EqualPartitionsBalancingStrategy`]
    pub fn strategy(mut self, strategy: Arc<dyn PartitionLoadBalancingStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Migrate from a per-partition lease set on first start
    pub fn legacy_leases(mut self, legacy: LegacyLeases) -> Self {
        self.legacy = Some(legacy);
        self
    }

    pub fn build(self) -> Result<ChangeFeedProcessor> {
        let options = self.options.unwrap_or_default();
        options.validate()?;

        fn required<T>(value: Option<T>, name: &str) -> Result<T> {
            value.ok_or_else(|| ChangeFeedError::config(format!("{} is required", name)))
        }

        let strategy: Arc<dyn PartitionLoadBalancingStrategy> = match self.strategy {
            Some(strategy) => strategy,
            None => Arc::new(EqualPartitionsBalancingStrategy::new(
                options.host_name.clone(),
                options.min_partition_count,
                options.max_partition_count,
                options.lease_expiration_interval,
            )),
        };
        let scheme = match self.legacy {
            Some(legacy) => LeaseScheme::PkRangeId(legacy),
            None => LeaseScheme::EpochRange,
        };

        Ok(ChangeFeedProcessor {
            reader: required(self.reader, "change feed reader")?,
            ranges: required(self.ranges, "partition key range provider")?,
            manager: required(self.manager, "lease manager")?,
            container: required(self.container, "lease container")?,
            store: required(self.store, "lease store")?,
            observer_factory: required(self.observer_factory, "observer factory")?,
            strategy,
            scheme,
            options,
            running: tokio::sync::Mutex::new(None),
        })
    }
}

/// Consumes a change feed on one host in cooperation with other hosts
/// sharing the same lease store
pub struct ChangeFeedProcessor {
    options: ProcessorOptions,
    reader: Arc<dyn ChangeFeedReader>,
    ranges: Arc<dyn PartitionKeyRangeProvider>,
    manager: Arc<dyn LeaseManager>,
    container: Arc<dyn LeaseContainer>,
    store: Arc<dyn LeaseStore>,
    observer_factory: Arc<dyn ChangeFeedObserverFactory>,
    strategy: Arc<dyn PartitionLoadBalancingStrategy>,
    scheme: LeaseScheme,
    running: tokio::sync::Mutex<Option<PartitionLoadBalancer>>,
}

impl ChangeFeedProcessor {
    pub fn builder() -> ChangeFeedProcessorBuilder {
        ChangeFeedProcessorBuilder::new()
    }

    pub fn options(&self) -> &ProcessorOptions {
        &self.options
    }

    /// Bootstrap the lease store, resume owned leases and start balancing
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let synchronizer = Arc::new(RangePartitionSynchronizer::new(
            self.reader.resource_id(),
            self.ranges.clone(),
            self.manager.clone(),
            self.container.clone(),
            &self.options,
        ));

        let bootstrapper = Bootstrapper::new(
            synchronizer.clone(),
            self.store.clone(),
            self.container.clone(),
            self.options.initialization_lock_duration,
            self.scheme.clone(),
        );
        loop {
            match bootstrapper.initialize().await? {
                BootstrapOutcome::LockHeldElsewhere => {
                    tokio::time::sleep(self.options.bootstrap_retry_delay).await;
                }
                outcome => {
                    info!(host = %self.options.host_name, ?outcome, "Lease store ready");
                    break;
                }
            }
        }

        let factory = Arc::new(DefaultPartitionSupervisorFactory::new(
            self.observer_factory.clone(),
            self.reader.clone(),
            self.manager.clone(),
            self.options.clone(),
        ));
        let controller = PartitionController::new(
            self.options.host_name.clone(),
            self.manager.clone(),
            self.container.clone(),
            synchronizer,
            factory,
        );
        controller.initialize().await?;

        let balancer = PartitionLoadBalancer::new(
            controller,
            self.container.clone(),
            self.strategy.clone(),
            self.options.lease_acquire_interval,
        );
        balancer.start();
        *running = Some(balancer);

        info!(host = %self.options.host_name, "Change feed processor started");
        Ok(())
    }

    /// Stop balancing and release every lease held by this host
    pub async fn stop(&self) {
        let balancer = self.running.lock().await.take();
        if let Some(balancer) = balancer {
            balancer.stop().await;
            info!(host = %self.options.host_name, "Change feed processor stopped");
        }
    }

    pub async fn is_started(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Lease tokens with a running worker on this host
    pub async fn active_leases(&self) -> Vec<String> {
        match self.running.lock().await.as_ref() {
            Some(balancer) => balancer.controller().active_leases(),
            None => Vec::new(),
        }
    }

    /// Ownership and progress of every lease in the store
    pub async fn current_state(&self) -> Result<Vec<LeaseStateInfo>> {
        let mut leases = self.container.get_all_leases().await?;
        leases.sort_by(|a, b| a.lease_token.cmp(&b.lease_token));
        Ok(leases
            .into_iter()
            .map(|lease| LeaseStateInfo {
                lease_token: lease.lease_token,
                owner: lease.owner,
                continuation_token: lease.continuation_token,
            })
            .collect())
    }
}
