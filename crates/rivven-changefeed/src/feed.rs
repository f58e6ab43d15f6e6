//! Change feed read API and partition topology
//!
//! Both traits describe the service being consumed. The processor never talks
//! to the transport directly, it only sees pages and the typed
//! [`ChangeFeedError::PartitionGone`] / [`ChangeFeedError::PartitionSplitting`]
//! signals.
//!
//! [`ChangeFeedError::PartitionGone`]: crate::ChangeFeedError::PartitionGone
//! [`ChangeFeedError::PartitionSplitting`]: crate::ChangeFeedError::PartitionSplitting

use crate::error::Result;
use crate::range::{PartitionKeyRange, Range};
use crate::state::ChangeFeedState;
use async_trait::async_trait;

/// One page of changes
#[derive(Debug, Clone)]
pub struct FeedPage {
    pub changes: Vec<serde_json::Value>,
    /// State to resume from after this page has been processed
    pub continuation: ChangeFeedState,
}

impl FeedPage {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Reads pages of changes for the cursor at the head of a [`ChangeFeedState`]
#[async_trait]
pub trait ChangeFeedReader: Send + Sync {
    /// Identifier of the monitored collection, recorded in every state
    fn resource_id(&self) -> String;

    /// Read up to `max_items` changes for `state.current()`.
    ///
    /// Fails with `PartitionGone` or `PartitionSplitting` when the cursor's
    /// range no longer maps onto a single physical partition.
    async fn read_page(&self, state: &ChangeFeedState, max_items: usize) -> Result<FeedPage>;
}

/// Current physical partition layout of the monitored collection
#[async_trait]
pub trait PartitionKeyRangeProvider: Send + Sync {
    /// Live partitions overlapping `range`, ordered by key
    async fn get_overlapping_ranges(&self, range: &Range) -> Result<Vec<PartitionKeyRange>>;

    /// Partition by id, including partitions retired by a split or merge
    async fn get_partition_key_range(&self, id: &str) -> Result<Option<PartitionKeyRange>>;

    /// Live partitions descending from `parent_id`
    async fn get_child_ranges(&self, parent_id: &str) -> Result<Vec<PartitionKeyRange>>;
}
