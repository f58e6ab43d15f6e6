//! Reactions to a lease whose range disappeared
//!
//! A handler is built per event by the synchronizer and holds everything it
//! needs. Apart from creating the replacement leases it has no side effects;
//! deleting and releasing the gone lease is left to the controller.

use crate::error::Result;
use crate::lease::{Lease, LeaseManager};
use crate::range::Range;
use crate::state::{ChangeFeedState, FeedRange};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Decision for one split or merge event
#[async_trait]
pub trait FeedRangeGoneHandler: Send + Sync {
    /// Leases that replace the gone lease
    async fn handle_partition_gone(&self) -> Result<Vec<Lease>>;

    /// The gone lease must be removed from the store
    fn should_delete_current_lease(&self) -> bool;

    /// Replacements are left for the load balancer instead of being started
    /// on this host
    fn should_skip_direct_lease_assignment(&self) -> bool;
}

/// The lease's range now spans several partitions: one child lease per partition
pub struct FeedRangeGoneSplitHandler {
    lease: Lease,
    parent_state: ChangeFeedState,
    child_ranges: Vec<Range>,
    manager: Arc<dyn LeaseManager>,
    skip_direct_assignment: bool,
}

impl FeedRangeGoneSplitHandler {
    pub fn new(
        lease: Lease,
        parent_state: ChangeFeedState,
        child_ranges: Vec<Range>,
        manager: Arc<dyn LeaseManager>,
        skip_direct_assignment: bool,
    ) -> Self {
        Self {
            lease,
            parent_state,
            child_ranges,
            manager,
            skip_direct_assignment,
        }
    }

    pub fn child_ranges(&self) -> &[Range] {
        &self.child_ranges
    }
}

#[async_trait]
impl FeedRangeGoneHandler for FeedRangeGoneSplitHandler {
    async fn handle_partition_gone(&self) -> Result<Vec<Lease>> {
        let mut children = Vec::with_capacity(self.child_ranges.len());
        for range in &self.child_ranges {
            let state = self.parent_state.extract_for_range(range)?;
            match self
                .manager
                .create_lease_if_not_exist(FeedRange::Epk(range.clone()), Some(state.to_string()))
                .await?
            {
                Some(child) => children.push(child),
                None => debug!(
                    parent = %self.lease.lease_token,
                    child = %range.lease_token(),
                    "Child lease already exists"
                ),
            }
        }

        info!(
            lease_token = %self.lease.lease_token,
            children = children.len(),
            "Split lease into child leases"
        );
        Ok(children)
    }

    fn should_delete_current_lease(&self) -> bool {
        true
    }

    fn should_skip_direct_lease_assignment(&self) -> bool {
        self.skip_direct_assignment
    }
}

/// The lease's range is now part of a larger partition: keep the lease
pub struct FeedRangeGoneMergeHandler {
    lease: Lease,
}

impl FeedRangeGoneMergeHandler {
    pub fn new(lease: Lease) -> Self {
        Self { lease }
    }
}

#[async_trait]
impl FeedRangeGoneHandler for FeedRangeGoneMergeHandler {
    async fn handle_partition_gone(&self) -> Result<Vec<Lease>> {
        info!(lease_token = %self.lease.lease_token, "Lease range merged, reusing lease");
        Ok(vec![self.lease.clone()])
    }

    fn should_delete_current_lease(&self) -> bool {
        false
    }

    fn should_skip_direct_lease_assignment(&self) -> bool {
        false
    }
}
