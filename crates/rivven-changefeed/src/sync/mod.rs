//! Reconciliation of the lease set against the partition layout
//!
//! The synchronizer mints leases for partitions that have none, converts legacy
//! per-partition leases into range leases, and decides how a lease whose range
//! disappeared is replaced.
//!
//! ```text
//! overlapping partitions for the gone lease
//!   0  -> error, the layout does not cover the range
//!   1  -> merge: keep the lease
//!   n  -> split: one child lease per partition
//! ```

mod gone;

pub use gone::{FeedRangeGoneHandler, FeedRangeGoneMergeHandler, FeedRangeGoneSplitHandler};

use crate::config::ProcessorOptions;
use crate::error::{ChangeFeedError, Result};
use crate::feed::PartitionKeyRangeProvider;
use crate::lease::{Lease, LeaseContainer, LeaseManager};
use crate::range::{PartitionKeyRange, Range};
use crate::state::{ChangeFeedMode, ChangeFeedStartFrom, ChangeFeedState, FeedRange};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Keeps the lease set aligned with the partition layout
#[async_trait]
pub trait PartitionSynchronizer: Send + Sync {
    /// Create a lease for every partition not covered by an existing lease
    async fn create_missing_leases(&self) -> Result<()>;

    /// Create range leases replacing `legacy_leases`, carrying over their progress
    async fn create_missing_leases_from(&self, legacy_leases: &[Lease]) -> Result<()>;

    /// Handler for a lease whose range is gone
    async fn get_feed_range_gone_handler(
        &self,
        lease: &Lease,
    ) -> Result<Box<dyn FeedRangeGoneHandler>>;
}

/// [`PartitionSynchronizer`] over effective-partition-key range leases
pub struct RangePartitionSynchronizer {
    resource_id: String,
    ranges: Arc<dyn PartitionKeyRangeProvider>,
    manager: Arc<dyn LeaseManager>,
    container: Arc<dyn LeaseContainer>,
    mode: ChangeFeedMode,
    start_from: ChangeFeedStartFrom,
    skip_direct_split_assignment: bool,
}

impl RangePartitionSynchronizer {
    pub fn new(
        resource_id: impl Into<String>,
        ranges: Arc<dyn PartitionKeyRangeProvider>,
        manager: Arc<dyn LeaseManager>,
        container: Arc<dyn LeaseContainer>,
        options: &ProcessorOptions,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            ranges,
            manager,
            container,
            mode: options.mode,
            start_from: options.start_from.clone(),
            skip_direct_split_assignment: options.skip_direct_split_assignment,
        }
    }

    /// Key range of a lease, resolving legacy partition ids through the layout
    async fn lease_range(&self, lease: &Lease) -> Result<Range> {
        match &lease.feed_range {
            FeedRange::Epk(range) => Ok(range.clone()),
            FeedRange::PartitionKeyRange(id) => self
                .ranges
                .get_partition_key_range(id)
                .await?
                .map(|partition| partition.to_range())
                .ok_or_else(|| {
                    ChangeFeedError::illegal_state(format!("unknown partition key range {}", id))
                }),
        }
    }

    /// Progress of a lease as a range state
    fn lease_state(&self, lease: &Lease, range: &Range) -> Result<ChangeFeedState> {
        match (&lease.feed_range, lease.continuation_token.as_deref()) {
            (FeedRange::Epk(_), Some(_)) => lease
                .continuation_state()?
                .ok_or_else(|| ChangeFeedError::illegal_state("lease lost its continuation")),
            (FeedRange::PartitionKeyRange(id), token) => Ok(ChangeFeedState::from_legacy(
                self.resource_id.clone(),
                &PartitionKeyRange::new(id.clone(), range.min.clone(), range.max.clone()),
                token.map(str::to_string),
                self.mode,
                self.start_from.clone(),
            )),
            (FeedRange::Epk(_), None) => Ok(ChangeFeedState::from_start(
                self.resource_id.clone(),
                range.clone(),
                self.mode,
                self.start_from.clone(),
            )),
        }
    }

    /// Live partitions that replace a legacy partition id
    async fn resolve_legacy_partition(&self, id: &str) -> Result<(Range, Vec<PartitionKeyRange>)> {
        if let Some(partition) = self.ranges.get_partition_key_range(id).await? {
            let range = partition.to_range();
            let live = self.ranges.get_overlapping_ranges(&range).await?;
            return Ok((range, live));
        }

        let children = self.ranges.get_child_ranges(id).await?;
        let (Some(first), Some(last)) = (children.first(), children.last()) else {
            return Err(ChangeFeedError::illegal_state(format!(
                "legacy lease references unknown partition key range {}",
                id
            )));
        };
        let range = Range::new(first.min_inclusive.clone(), last.max_exclusive.clone());
        Ok((range, children))
    }
}

#[async_trait]
impl PartitionSynchronizer for RangePartitionSynchronizer {
    async fn create_missing_leases(&self) -> Result<()> {
        let partitions = self.ranges.get_overlapping_ranges(&Range::full()).await?;
        let covered: Vec<Range> = self
            .container
            .get_all_leases()
            .await?
            .iter()
            .filter_map(|lease| lease.epk_range().cloned())
            .collect();

        let mut created = 0usize;
        for partition in partitions {
            let range = partition.to_range();
            if covered.iter().any(|existing| existing.overlaps(&range)) {
                debug!(partition = %partition.id, range = %range, "Partition already leased");
                continue;
            }
            if self
                .manager
                .create_lease_if_not_exist(FeedRange::Epk(range), None)
                .await?
                .is_some()
            {
                created += 1;
            }
        }

        info!(created, "Created missing leases");
        Ok(())
    }

    async fn create_missing_leases_from(&self, legacy_leases: &[Lease]) -> Result<()> {
        let mut created = 0usize;
        for legacy in legacy_leases {
            let (range, partitions) = match &legacy.feed_range {
                FeedRange::PartitionKeyRange(id) => self.resolve_legacy_partition(id).await?,
                FeedRange::Epk(range) => {
                    let partitions = self.ranges.get_overlapping_ranges(range).await?;
                    (range.clone(), partitions)
                }
            };
            let state = self.lease_state(legacy, &range)?;

            for partition in partitions {
                let Some(target) = partition.to_range().intersect(&range) else {
                    continue;
                };
                let migrated = state.extract_for_range(&target)?;
                if self
                    .manager
                    .create_lease_if_not_exist(FeedRange::Epk(target), Some(migrated.to_string()))
                    .await?
                    .is_some()
                {
                    created += 1;
                }
            }
        }

        info!(
            legacy = legacy_leases.len(),
            created, "Migrated legacy leases"
        );
        Ok(())
    }

    async fn get_feed_range_gone_handler(
        &self,
        lease: &Lease,
    ) -> Result<Box<dyn FeedRangeGoneHandler>> {
        let range = self.lease_range(lease).await?;
        let overlapping = self.ranges.get_overlapping_ranges(&range).await?;

        match overlapping.len() {
            0 => {
                warn!(
                    lease_token = %lease.lease_token,
                    range = %range,
                    "No partition overlaps lease"
                );
                Err(ChangeFeedError::illegal_state(format!(
                    "no partition key range overlaps lease {}",
                    lease.lease_token
                )))
            }
            1 => {
                debug!(lease_token = %lease.lease_token, "Lease range was merged");
                Ok(Box::new(FeedRangeGoneMergeHandler::new(lease.clone())))
            }
            n => {
                debug!(lease_token = %lease.lease_token, partitions = n, "Lease range was split");
                let child_ranges = overlapping
                    .iter()
                    .filter_map(|partition| partition.to_range().intersect(&range))
                    .collect();
                let parent_state = self.lease_state(lease, &range)?;
                Ok(Box::new(FeedRangeGoneSplitHandler::new(
                    lease.clone(),
                    parent_state,
                    child_ranges,
                    self.manager.clone(),
                    self.skip_direct_split_assignment,
                )))
            }
        }
    }
}
