//! Effective partition key ranges and feed ranges.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Smallest effective partition key
pub const MIN_INCLUSIVE: &str = "";

/// Largest effective partition key (exclusive)
pub const MAX_EXCLUSIVE: &str = "FF";

/// Half-open interval `[min, max)` of effective partition keys.
///
/// Keys are upper-case hex strings compared lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Range {
    pub min: String,
    pub max: String,
}

impl Range {
    pub fn new(min: impl Into<String>, max: impl Into<String>) -> Self {
        Self {
            min: min.into(),
            max: max.into(),
        }
    }

    /// The whole key space
    pub fn full() -> Self {
        Self::new(MIN_INCLUSIVE, MAX_EXCLUSIVE)
    }

    pub fn is_empty(&self) -> bool {
        self.min >= self.max
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.min.as_str() <= key && key < self.max.as_str()
    }

    /// True when `other` lies entirely inside this range
    pub fn contains(&self, other: &Range) -> bool {
        self.min <= other.min && other.max <= self.max
    }

    pub fn overlaps(&self, other: &Range) -> bool {
        self.min < other.max && other.min < self.max
    }

    /// Overlapping part of two ranges, if any
    pub fn intersect(&self, other: &Range) -> Option<Range> {
        if !self.overlaps(other) {
            return None;
        }
        let min = std::cmp::max(&self.min, &other.min).clone();
        let max = std::cmp::min(&self.max, &other.max).clone();
        Some(Range { min, max })
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{})", self.min, self.max)
    }
}

/// A physical partition of the monitored container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionKeyRange {
    pub id: String,
    pub range: Range,
    /// Ids of the ranges this one was created from
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<String>,
}

impl PartitionKeyRange {
    pub fn new(id: impl Into<String>, range: Range) -> Self {
        Self {
            id: id.into(),
            range,
            parents: Vec::new(),
        }
    }
}

/// The unit of partition identity a lease is bound to.
///
/// Legacy leases name a physical partition key range; key-range leases name
/// an effective partition key interval that survives physical re-partitioning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeedRange {
    PartitionKeyRange {
        #[serde(rename = "PKRangeId")]
        id: String,
        #[serde(rename = "Range")]
        range: Range,
    },
    Epk {
        #[serde(rename = "Range")]
        range: Range,
    },
}

impl FeedRange {
    pub fn partition_key_range(pk_range: &PartitionKeyRange) -> Self {
        FeedRange::PartitionKeyRange {
            id: pk_range.id.clone(),
            range: pk_range.range.clone(),
        }
    }

    pub fn epk(range: Range) -> Self {
        FeedRange::Epk { range }
    }

    pub fn range(&self) -> &Range {
        match self {
            FeedRange::PartitionKeyRange { range, .. } | FeedRange::Epk { range } => range,
        }
    }

    /// Lease token derived from this feed range
    pub fn lease_token(&self) -> String {
        match self {
            FeedRange::PartitionKeyRange { id, .. } => id.clone(),
            FeedRange::Epk { range } => format!("{}-{}", range.min, range.max),
        }
    }

    pub fn is_partition_key_range(&self) -> bool {
        matches!(self, FeedRange::PartitionKeyRange { .. })
    }
}

impl fmt::Display for FeedRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedRange::PartitionKeyRange { id, range } => write!(f, "pkrange {} {}", id, range),
            FeedRange::Epk { range } => write!(f, "epk {}", range),
        }
    }
}
