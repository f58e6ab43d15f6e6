//! Effective partition key ranges
//!
//! Keys are upper-case hex strings compared lexicographically. The full key
//! space is `["", "FF")`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Inclusive lower bound of the key space
pub const MIN_KEY: &str = "";

/// Exclusive upper bound of the key space
pub const MAX_KEY: &str = "FF";

/// Key range with configurable bound inclusivity (half-open by default)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    pub min: String,
    pub max: String,
    #[serde(rename = "isMinInclusive", default = "default_true")]
    pub is_min_inclusive: bool,
    #[serde(rename = "isMaxInclusive", default)]
    pub is_max_inclusive: bool,
}

fn default_true() -> bool {
    true
}

impl Range {
    /// Half-open range `[min, max)`
    pub fn new(min: impl Into<String>, max: impl Into<String>) -> Self {
        Self {
            min: min.into(),
            max: max.into(),
            is_min_inclusive: true,
            is_max_inclusive: false,
        }
    }

    /// The whole key space
    pub fn full() -> Self {
        Self::new(MIN_KEY, MAX_KEY)
    }

    pub fn is_full(&self) -> bool {
        self.min == MIN_KEY && self.max == MAX_KEY
    }

    pub fn is_empty(&self) -> bool {
        match self.min.cmp(&self.max) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Equal => !(self.is_min_inclusive && self.is_max_inclusive),
            std::cmp::Ordering::Less => false,
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        let above_min = if self.is_min_inclusive {
            key >= self.min.as_str()
        } else {
            key > self.min.as_str()
        };
        let below_max = if self.is_max_inclusive {
            key <= self.max.as_str()
        } else {
            key < self.max.as_str()
        };
        above_min && below_max
    }

    /// Check whether the two ranges share at least one key
    pub fn overlaps(&self, other: &Range) -> bool {
        self.intersect(other).is_some()
    }

    /// Check whether `other` lies entirely within this range
    pub fn contains_range(&self, other: &Range) -> bool {
        let min_ok = match self.min.cmp(&other.min) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Equal => self.is_min_inclusive || !other.is_min_inclusive,
            std::cmp::Ordering::Greater => false,
        };
        let max_ok = match self.max.cmp(&other.max) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Equal => self.is_max_inclusive || !other.is_max_inclusive,
            std::cmp::Ordering::Less => false,
        };
        min_ok && max_ok
    }

    /// Intersection of two ranges, `None` when they are disjoint
    pub fn intersect(&self, other: &Range) -> Option<Range> {
        let (min, is_min_inclusive) = match self.min.cmp(&other.min) {
            std::cmp::Ordering::Greater => (self.min.clone(), self.is_min_inclusive),
            std::cmp::Ordering::Less => (other.min.clone(), other.is_min_inclusive),
            std::cmp::Ordering::Equal => (
                self.min.clone(),
                self.is_min_inclusive && other.is_min_inclusive,
            ),
        };
        let (max, is_max_inclusive) = match self.max.cmp(&other.max) {
            std::cmp::Ordering::Less => (self.max.clone(), self.is_max_inclusive),
            std::cmp::Ordering::Greater => (other.max.clone(), other.is_max_inclusive),
            std::cmp::Ordering::Equal => (
                self.max.clone(),
                self.is_max_inclusive && other.is_max_inclusive,
            ),
        };

        let range = Range {
            min,
            max,
            is_min_inclusive,
            is_max_inclusive,
        };
        if range.is_empty() {
            None
        } else {
            Some(range)
        }
    }

    /// Human-readable lease token, e.g. `AA-CC`
    pub fn lease_token(&self) -> String {
        format!("{}-{}", self.min, self.max)
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{},{}{}",
            if self.is_min_inclusive { '[' } else { '(' },
            self.min,
            self.max,
            if self.is_max_inclusive { ']' } else { ')' }
        )
    }
}

/// A physical partition of the monitored container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionKeyRange {
    pub id: String,
    #[serde(rename = "minInclusive")]
    pub min_inclusive: String,
    #[serde(rename = "maxExclusive")]
    pub max_exclusive: String,
    /// Ids of the ranges this one was split or merged from
    #[serde(default)]
    pub parents: Vec<String>,
}

impl PartitionKeyRange {
    pub fn new(
        id: impl Into<String>,
        min_inclusive: impl Into<String>,
        max_exclusive: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            min_inclusive: min_inclusive.into(),
            max_exclusive: max_exclusive.into(),
            parents: Vec::new(),
        }
    }

    pub fn with_parents(mut self, parents: Vec<String>) -> Self {
        self.parents = parents;
        self
    }

    pub fn to_range(&self) -> Range {
        Range::new(self.min_inclusive.clone(), self.max_exclusive.clone())
    }
}
