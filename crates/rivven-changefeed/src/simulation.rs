//! In-process change feed with a mutable partition layout
//!
//! [`InMemoryChangeFeed`] keeps one append-only log ordered by a global LSN.
//! Each record carries an effective partition key, and a continuation token is
//! simply the highest LSN already returned for a cursor. Splitting or merging
//! partitions changes which reads are accepted:
//!
//! - a cursor whose range spans more than one live partition gets `PartitionGone`
//! - a cursor inside a partition retired by a merge gets `PartitionGone` once
//!
//! ```rust,ignore
//! let feed = Arc::new(InMemoryChangeFeed::new("orders", 2));
//! feed.append(InMemoryChangeFeed::key_for(7), json!({"id": 7}));
//! let (left, right) = feed.split("0", "40")?;
//! ```

use crate::error::{ChangeFeedError, Result};
use crate::feed::{ChangeFeedReader, FeedPage, PartitionKeyRangeProvider};
use crate::range::{PartitionKeyRange, Range, MAX_KEY, MIN_KEY};
use crate::state::{ChangeFeedStartFrom, ChangeFeedState};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::json;
use std::collections::HashMap;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct ChangeRecord {
    lsn: u64,
    key: String,
    timestamp_ms: i64,
    body: serde_json::Value,
}

impl ChangeRecord {
    fn to_change(&self) -> serde_json::Value {
        json!({
            "_lsn": self.lsn,
            "_key": self.key,
            "_ts": self.timestamp_ms,
            "data": self.body,
        })
    }
}

#[derive(Debug, Default)]
struct FeedInner {
    records: Vec<ChangeRecord>,
    last_lsn: u64,
    live: Vec<PartitionKeyRange>,
    all: HashMap<String, PartitionKeyRange>,
    /// Ranges retired by a merge that still owe one `PartitionGone`
    pending_gone: Vec<Range>,
    next_range_id: u64,
}

impl FeedInner {
    fn add_range(&mut self, range: PartitionKeyRange) {
        self.all.insert(range.id.clone(), range.clone());
        self.live.push(range);
        self.live.sort_by(|a, b| a.min_inclusive.cmp(&b.min_inclusive));
    }

    fn allocate_id(&mut self) -> String {
        let id = self.next_range_id.to_string();
        self.next_range_id += 1;
        id
    }

    fn take_live(&mut self, id: &str) -> Result<PartitionKeyRange> {
        let position = self
            .live
            .iter()
            .position(|range| range.id == id)
            .ok_or_else(|| ChangeFeedError::illegal_state(format!("no live partition {}", id)))?;
        Ok(self.live.remove(position))
    }

    fn start_lsn(&self, start_from: &ChangeFeedStartFrom) -> u64 {
        match start_from {
            ChangeFeedStartFrom::Beginning => 0,
            ChangeFeedStartFrom::Now => self.last_lsn,
            ChangeFeedStartFrom::PointInTime { point_in_time_ms } => self
                .records
                .iter()
                .take_while(|record| record.timestamp_ms < *point_in_time_ms)
                .last()
                .map(|record| record.lsn)
                .unwrap_or(0),
        }
    }
}

/// Simulated partitioned change feed
#[derive(Debug)]
pub struct InMemoryChangeFeed {
    resource_id: String,
    inner: RwLock<FeedInner>,
}

impl InMemoryChangeFeed {
    /// Feed with `partition_count` equally sized partitions over the key space
    pub fn new(resource_id: impl Into<String>, partition_count: usize) -> Self {
        let count = partition_count.clamp(1, 255);
        let bounds: Vec<String> = (0..=count)
            .map(|i| match i {
                0 => MIN_KEY.to_string(),
                i if i == count => MAX_KEY.to_string(),
                i => format!("{:02X}", i * 256 / count),
            })
            .collect();
        let ranges = bounds
            .windows(2)
            .enumerate()
            .map(|(id, pair)| {
                PartitionKeyRange::new(id.to_string(), pair[0].clone(), pair[1].clone())
            })
            .collect();
        Self::with_ranges(resource_id, ranges)
    }

    pub fn with_ranges(resource_id: impl Into<String>, ranges: Vec<PartitionKeyRange>) -> Self {
        let mut inner = FeedInner::default();
        for range in ranges {
            if let Ok(id) = range.id.parse::<u64>() {
                inner.next_range_id = inner.next_range_id.max(id + 1);
            }
            inner.add_range(range);
        }
        Self {
            resource_id: resource_id.into(),
            inner: RwLock::new(inner),
        }
    }

    /// Two-digit hex key for an arbitrary number, spread over the key space
    pub fn key_for(n: u64) -> String {
        format!("{:02X}", n % 255)
    }

    /// Append a change and return its LSN
    pub fn append(&self, key: impl Into<String>, body: serde_json::Value) -> u64 {
        let mut inner = self.inner.write();
        inner.last_lsn += 1;
        let record = ChangeRecord {
            lsn: inner.last_lsn,
            key: key.into(),
            timestamp_ms: Utc::now().timestamp_millis(),
            body,
        };
        inner.records.push(record);
        inner.last_lsn
    }

    pub fn last_lsn(&self) -> u64 {
        self.inner.read().last_lsn
    }

    /// Live partitions ordered by key
    pub fn partitions(&self) -> Vec<PartitionKeyRange> {
        self.inner.read().live.clone()
    }

    /// Split a live partition at `at_key` and return the ids of both halves
    pub fn split(&self, range_id: &str, at_key: &str) -> Result<(String, String)> {
        let mut inner = self.inner.write();
        let parent = inner.take_live(range_id)?;
        if at_key <= parent.min_inclusive.as_str() || at_key >= parent.max_exclusive.as_str() {
            inner.add_range(parent.clone());
            return Err(ChangeFeedError::illegal_state(format!(
                "split key {} outside partition {} [{},{})",
                at_key, parent.id, parent.min_inclusive, parent.max_exclusive
            )));
        }

        let mut parents = parent.parents.clone();
        parents.push(parent.id.clone());

        let left_id = inner.allocate_id();
        let right_id = inner.allocate_id();
        inner.add_range(
            PartitionKeyRange::new(&left_id, &parent.min_inclusive, at_key)
                .with_parents(parents.clone()),
        );
        inner.add_range(
            PartitionKeyRange::new(&right_id, at_key, &parent.max_exclusive).with_parents(parents),
        );

        info!(
            partition = %parent.id,
            left = %left_id,
            right = %right_id,
            at = at_key,
            "Split partition"
        );
        Ok((left_id, right_id))
    }

    /// Merge two adjacent live partitions and return the id of the result
    pub fn merge(&self, left_id: &str, right_id: &str) -> Result<String> {
        let mut inner = self.inner.write();
        let left = inner.take_live(left_id)?;
        let right = match inner.take_live(right_id) {
            Ok(right) => right,
            Err(e) => {
                inner.add_range(left);
                return Err(e);
            }
        };
        if left.max_exclusive != right.min_inclusive {
            let message = format!("partitions {} and {} are not adjacent", left.id, right.id);
            inner.add_range(left);
            inner.add_range(right);
            return Err(ChangeFeedError::illegal_state(message));
        }

        let mut parents = left.parents.clone();
        parents.extend(right.parents.iter().cloned());
        parents.push(left.id.clone());
        parents.push(right.id.clone());

        let merged_id = inner.allocate_id();
        inner.pending_gone.push(left.to_range());
        inner.pending_gone.push(right.to_range());
        inner.add_range(
            PartitionKeyRange::new(&merged_id, &left.min_inclusive, &right.max_exclusive)
                .with_parents(parents),
        );

        info!(left = %left.id, right = %right.id, merged = %merged_id, "Merged partitions");
        Ok(merged_id)
    }
}

fn parse_lsn(token: &str) -> Result<u64> {
    token
        .trim_matches('"')
        .parse()
        .map_err(|_| ChangeFeedError::Read(format!("invalid continuation token {}", token)))
}

#[async_trait]
impl ChangeFeedReader for InMemoryChangeFeed {
    fn resource_id(&self) -> String {
        self.resource_id.clone()
    }

    async fn read_page(&self, state: &ChangeFeedState, max_items: usize) -> Result<FeedPage> {
        let cursor = state
            .current()
            .ok_or_else(|| ChangeFeedError::illegal_state("change feed state has no cursor"))?;

        let mut inner = self.inner.write();

        if let Some(position) = inner
            .pending_gone
            .iter()
            .position(|retired| retired.contains_range(&cursor.range))
        {
            let retired = inner.pending_gone.remove(position);
            debug!(range = %cursor.range, retired = %retired, "Read against merged partition");
            return Err(ChangeFeedError::PartitionGone(format!(
                "partition {} was merged",
                retired
            )));
        }

        let serving = inner
            .live
            .iter()
            .filter(|partition| partition.to_range().overlaps(&cursor.range))
            .count();
        if serving != 1 {
            return Err(ChangeFeedError::PartitionGone(format!(
                "range {} is served by {} partitions",
                cursor.range, serving
            )));
        }

        let start = match cursor.token.as_deref() {
            Some(token) => parse_lsn(token)?,
            None => inner.start_lsn(state.start_from()),
        };

        let changes: Vec<&ChangeRecord> = inner
            .records
            .iter()
            .filter(|record| record.lsn > start && cursor.range.contains_key(&record.key))
            .take(max_items)
            .collect();

        let next = if changes.len() < max_items {
            inner.last_lsn.max(start)
        } else {
            changes.last().map(|record| record.lsn).unwrap_or(start)
        };

        let changes = changes.into_iter().map(ChangeRecord::to_change).collect();
        let mut continuation = state.clone();
        continuation.advance(next.to_string());
        Ok(FeedPage {
            changes,
            continuation,
        })
    }
}

#[async_trait]
impl PartitionKeyRangeProvider for InMemoryChangeFeed {
    async fn get_overlapping_ranges(&self, range: &Range) -> Result<Vec<PartitionKeyRange>> {
        Ok(self
            .inner
            .read()
            .live
            .iter()
            .filter(|partition| partition.to_range().overlaps(range))
            .cloned()
            .collect())
    }

    async fn get_partition_key_range(&self, id: &str) -> Result<Option<PartitionKeyRange>> {
        Ok(self.inner.read().all.get(id).cloned())
    }

    async fn get_child_ranges(&self, parent_id: &str) -> Result<Vec<PartitionKeyRange>> {
        Ok(self
            .inner
            .read()
            .live
            .iter()
            .filter(|partition| partition.parents.iter().any(|p| p == parent_id))
            .cloned()
            .collect())
    }
}
