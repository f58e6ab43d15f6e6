//! Periodic lease acquisition
//!
//! Every `lease_acquire_interval` the balancer lists all leases, asks the
//! strategy which ones this host should take and hands them to the
//! controller. A failed cycle is logged and retried on the next tick; this is
//! the only retry path for leases released after an error.

use crate::controller::PartitionController;
use crate::error::Result;
use crate::lease::{Lease, LeaseContainer};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Chooses the leases this host should try to acquire
pub trait PartitionLoadBalancingStrategy: Send + Sync {
    fn select_leases_to_take(&self, all_leases: &[Lease]) -> Result<Vec<Lease>>;
}

/// Spread leases evenly over the hosts that currently own any.
///
/// Unowned and expired leases are taken first, up to this host's share. With
/// none available, one lease is taken from the most loaded host when that host
/// holds more than its share.
#[derive(Debug, Clone)]
pub struct EqualPartitionsBalancingStrategy {
    host_name: String,
    min_partition_count: usize,
    max_partition_count: usize,
    lease_expiration_interval: Duration,
}

impl EqualPartitionsBalancingStrategy {
    pub fn new(
        host_name: impl Into<String>,
        min_partition_count: usize,
        max_partition_count: usize,
        lease_expiration_interval: Duration,
    ) -> Self {
        Self {
            host_name: host_name.into(),
            min_partition_count,
            max_partition_count,
            lease_expiration_interval,
        }
    }

    fn target_count(&self, lease_count: usize, worker_count: usize) -> usize {
        let mut target = lease_count.div_ceil(worker_count.max(1));
        if self.max_partition_count > 0 {
            target = target.min(self.max_partition_count);
        }
        if self.min_partition_count > 0 {
            target = target.max(self.min_partition_count);
        }
        target
    }
}

impl PartitionLoadBalancingStrategy for EqualPartitionsBalancingStrategy {
    fn select_leases_to_take(&self, all_leases: &[Lease]) -> Result<Vec<Lease>> {
        let now = Utc::now();
        let mut available = Vec::new();
        let mut owned: HashMap<&str, Vec<&Lease>> = HashMap::new();

        for lease in all_leases {
            match lease.owner.as_deref() {
                Some(owner)
                    if !owner.is_empty()
                        && !lease.is_expired(self.lease_expiration_interval, now) =>
                {
                    owned.entry(owner).or_default().push(lease)
                }
                _ => available.push(lease.clone()),
            }
        }
        owned.entry(self.host_name.as_str()).or_default();

        let mine = owned.get(self.host_name.as_str()).map(Vec::len).unwrap_or(0);
        let target = self.target_count(all_leases.len(), owned.len());
        if mine >= target {
            return Ok(Vec::new());
        }
        let needed = target - mine;

        if !available.is_empty() {
            available.truncate(needed);
            debug!(
                host = %self.host_name,
                target,
                taking = available.len(),
                "Taking available leases"
            );
            return Ok(available);
        }

        let busiest = owned
            .iter()
            .filter(|(owner, _)| **owner != self.host_name)
            .max_by(|a, b| a.1.len().cmp(&b.1.len()).then_with(|| b.0.cmp(a.0)));
        if let Some((owner, leases)) = busiest {
            if leases.len() > target {
                if let Some(lease) = leases.first() {
                    info!(
                        host = %self.host_name,
                        from = %owner,
                        lease_token = %lease.lease_token,
                        "Stealing lease"
                    );
                    return Ok(vec![(*lease).clone()]);
                }
            }
        }
        Ok(Vec::new())
    }
}

/// Drives the controller from the strategy
pub struct PartitionLoadBalancer {
    controller: PartitionController,
    container: Arc<dyn LeaseContainer>,
    strategy: Arc<dyn PartitionLoadBalancingStrategy>,
    acquire_interval: Duration,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PartitionLoadBalancer {
    pub fn new(
        controller: PartitionController,
        container: Arc<dyn LeaseContainer>,
        strategy: Arc<dyn PartitionLoadBalancingStrategy>,
        acquire_interval: Duration,
    ) -> Self {
        Self {
            controller,
            container,
            strategy,
            acquire_interval,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn controller(&self) -> &PartitionController {
        &self.controller
    }

    /// Spawn the balancing loop; a second call is a no-op
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let controller = self.controller.clone();
        let container = self.container.clone();
        let strategy = self.strategy.clone();
        let acquire_interval = self.acquire_interval;
        let cancel = self.cancel.clone();
        *task = Some(tokio::spawn(async move {
            run(controller, container, strategy, acquire_interval, cancel).await
        }));
        info!("Partition load balancer started");
    }

    /// Stop balancing and release every lease held by the controller
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Load balancer task failed");
            }
        }
        self.controller.shutdown().await;
        info!("Partition load balancer stopped");
    }
}

async fn run(
    controller: PartitionController,
    container: Arc<dyn LeaseContainer>,
    strategy: Arc<dyn PartitionLoadBalancingStrategy>,
    acquire_interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(acquire_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if let Err(e) = balance_once(&controller, container.as_ref(), strategy.as_ref()).await {
            warn!(error = %e, "Load balancing cycle failed");
        }
    }
}

async fn balance_once(
    controller: &PartitionController,
    container: &dyn LeaseContainer,
    strategy: &dyn PartitionLoadBalancingStrategy,
) -> Result<()> {
    let leases = container.get_all_leases().await?;
    let selected = strategy.select_leases_to_take(&leases)?;
    if !selected.is_empty() {
        debug!(
            host = %controller.host_name(),
            total = leases.len(),
            selected = selected.len(),
            "Acquiring selected leases"
        );
    }

    for lease in selected {
        if let Err(e) = controller.add_or_update_lease(lease.clone()).await {
            debug!(lease_token = %lease.lease_token, error = %e, "Could not take lease");
        }
    }
    Ok(())
}
