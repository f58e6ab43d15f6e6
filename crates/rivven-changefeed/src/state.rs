//! Durable change feed progress
//!
//! A [`ChangeFeedState`] is what a lease checkpoints. It records which range is
//! being consumed and one continuation cursor per sub-range. A range may carry
//! several cursors when the server split it beneath a single lease; their order
//! is significant and is preserved across serialization.
//!
//! # Wire format
//!
//! ```text
//! {"V":1,"Rid":"coll-rid","Mode":"INCREMENTAL","StartFrom":{"Type":"BEGINNING"},
//!  "Range":{"min":"AA","max":"CC",...},
//!  "Continuation":[{"token":"42","range":{"min":"AA","max":"BB",...}}, ...]}
//! ```
//!
//! Legacy states name a physical range with `"PKRangeId":"3"` instead of `"Range"`.
//! The opaque form stored in [`crate::Lease::continuation_token`] is the base64 of
//! that JSON.

use crate::error::{ChangeFeedError, Result};
use crate::range::{PartitionKeyRange, Range};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Current state format version
pub const STATE_VERSION: u32 = 1;

/// Which changes the feed reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeFeedMode {
    /// Latest version of each changed item
    #[default]
    Incremental,
    /// Every intermediate version including deletes
    FullFidelity,
}

/// Where a range without a continuation starts reading
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(tag = "Type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeFeedStartFrom {
    #[default]
    Beginning,
    Now,
    PointInTime {
        /// Milliseconds since the Unix epoch
        #[serde(rename = "PointInTimeMs")]
        point_in_time_ms: i64,
    },
}

/// Range descriptor: an effective-key range or a legacy physical range id
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeedRange {
    #[serde(rename = "Range")]
    Epk(Range),
    #[serde(rename = "PKRangeId")]
    PartitionKeyRange(String),
}

impl FeedRange {
    pub fn epk(&self) -> Option<&Range> {
        match self {
            FeedRange::Epk(range) => Some(range),
            FeedRange::PartitionKeyRange(_) => None,
        }
    }
}

impl fmt::Display for FeedRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedRange::Epk(range) => write!(f, "{}", range),
            FeedRange::PartitionKeyRange(id) => write!(f, "pkrange:{}", id),
        }
    }
}

/// One continuation cursor for a sub-range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeContinuationToken {
    /// Server continuation, `None` before the first read
    pub token: Option<String>,
    pub range: Range,
}

impl CompositeContinuationToken {
    pub fn new(token: Option<String>, range: Range) -> Self {
        Self { token, range }
    }
}

/// Progress marker for one lease
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "StateWire", into = "StateWire")]
pub struct ChangeFeedState {
    resource_id: String,
    feed_range: FeedRange,
    mode: ChangeFeedMode,
    start_from: ChangeFeedStartFrom,
    continuation: Vec<CompositeContinuationToken>,
}

impl ChangeFeedState {
    pub fn new(
        resource_id: impl Into<String>,
        feed_range: FeedRange,
        mode: ChangeFeedMode,
        start_from: ChangeFeedStartFrom,
        continuation: Vec<CompositeContinuationToken>,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            feed_range,
            mode,
            start_from,
            continuation,
        }
    }

    /// Fresh state for an epk range: a single cursor that has not read anything yet
    pub fn from_start(
        resource_id: impl Into<String>,
        range: Range,
        mode: ChangeFeedMode,
        start_from: ChangeFeedStartFrom,
    ) -> Self {
        let continuation = vec![CompositeContinuationToken::new(None, range.clone())];
        Self::new(
            resource_id,
            FeedRange::Epk(range),
            mode,
            start_from,
            continuation,
        )
    }

    /// Convert the raw continuation of a pk-range-id lease into an epk state
    pub fn from_legacy(
        resource_id: impl Into<String>,
        partition: &PartitionKeyRange,
        token: Option<String>,
        mode: ChangeFeedMode,
        start_from: ChangeFeedStartFrom,
    ) -> Self {
        let range = partition.to_range();
        Self::new(
            resource_id,
            FeedRange::Epk(range.clone()),
            mode,
            start_from,
            vec![CompositeContinuationToken::new(token, range)],
        )
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub fn feed_range(&self) -> &FeedRange {
        &self.feed_range
    }

    pub fn mode(&self) -> ChangeFeedMode {
        self.mode
    }

    pub fn start_from(&self) -> &ChangeFeedStartFrom {
        &self.start_from
    }

    pub fn continuation(&self) -> &[CompositeContinuationToken] {
        &self.continuation
    }

    /// Cursor the next read resumes from
    pub fn current(&self) -> Option<&CompositeContinuationToken> {
        self.continuation.first()
    }

    /// Record the server continuation for the current cursor and move on to the
    /// next sub-range so disjoint cursors are drained round-robin.
    pub fn advance(&mut self, token: impl Into<String>) {
        if let Some(current) = self.continuation.first_mut() {
            current.token = Some(token.into());
        }
        if self.continuation.len() > 1 {
            self.continuation.rotate_left(1);
        }
    }

    /// Narrow the state to `range`, keeping each overlapping cursor clipped to it.
    ///
    /// Used when a parent lease is split: each child resumes exactly where the
    /// parent left off for its part of the key space.
    pub fn extract_for_range(&self, range: &Range) -> Result<Self> {
        let continuation: Vec<_> = self
            .continuation
            .iter()
            .filter_map(|entry| {
                entry
                    .range
                    .intersect(range)
                    .map(|clipped| CompositeContinuationToken::new(entry.token.clone(), clipped))
            })
            .collect();

        if continuation.is_empty() {
            return Err(ChangeFeedError::illegal_state(format!(
                "no continuation of {} overlaps {}",
                self.feed_range, range
            )));
        }

        Ok(Self {
            resource_id: self.resource_id.clone(),
            feed_range: FeedRange::Epk(range.clone()),
            mode: self.mode,
            start_from: self.start_from.clone(),
            continuation,
        })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

impl fmt::Display for ChangeFeedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(json);
        f.write_str(&encoded)
    }
}

impl FromStr for ChangeFeedState {
    type Err = ChangeFeedError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = base64::engine::general_purpose::STANDARD.decode(s.trim())?;
        let json = String::from_utf8(bytes).map_err(|e| {
            ChangeFeedError::Serialization(format!("continuation is not UTF-8: {}", e))
        })?;
        Self::from_json(&json)
    }
}

#[derive(Serialize, Deserialize)]
struct StateWire {
    #[serde(rename = "V")]
    version: u32,
    #[serde(rename = "Rid")]
    resource_id: String,
    #[serde(rename = "Mode", default)]
    mode: ChangeFeedMode,
    #[serde(rename = "StartFrom", default)]
    start_from: ChangeFeedStartFrom,
    #[serde(rename = "Range", default, skip_serializing_if = "Option::is_none")]
    range: Option<Range>,
    #[serde(rename = "PKRangeId", default, skip_serializing_if = "Option::is_none")]
    pk_range_id: Option<String>,
    #[serde(rename = "Continuation", default)]
    continuation: Vec<CompositeContinuationToken>,
}

impl TryFrom<StateWire> for ChangeFeedState {
    type Error = ChangeFeedError;

    fn try_from(wire: StateWire) -> Result<Self> {
        if wire.version != STATE_VERSION {
            return Err(ChangeFeedError::Serialization(format!(
                "unsupported change feed state version {}",
                wire.version
            )));
        }
        let feed_range = match (wire.range, wire.pk_range_id) {
            (Some(range), None) => FeedRange::Epk(range),
            (None, Some(id)) => FeedRange::PartitionKeyRange(id),
            _ => {
                return Err(ChangeFeedError::Serialization(
                    "change feed state needs exactly one of Range or PKRangeId".to_string(),
                ))
            }
        };
        Ok(Self {
            resource_id: wire.resource_id,
            feed_range,
            mode: wire.mode,
            start_from: wire.start_from,
            continuation: wire.continuation,
        })
    }
}

impl From<ChangeFeedState> for StateWire {
    fn from(state: ChangeFeedState) -> Self {
        let (range, pk_range_id) = match state.feed_range {
            FeedRange::Epk(range) => (Some(range), None),
            FeedRange::PartitionKeyRange(id) => (None, Some(id)),
        };
        Self {
            version: STATE_VERSION,
            resource_id: state.resource_id,
            mode: state.mode,
            start_from: state.start_from,
            range,
            pk_range_id,
            continuation: state.continuation,
        }
    }
}
