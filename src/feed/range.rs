use serde::Deserialize;
use serde::Serialize;

use crate::FeedError;
use crate::Result;

/// Lowest effective partition key
pub const MIN_EPK: &str = "";
/// Exclusive upper bound of the effective partition key space
pub const MAX_EPK: &str = "FF";

const EPK_DIGITS: usize = 16;

/// Half-open interval `[min_inclusive, max_exclusive)` over hex effective
/// partition keys.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FeedRange {
    pub min_inclusive: String,
    pub max_exclusive: String,
}

impl FeedRange {
    pub fn new(
        min_inclusive: impl Into<String>,
        max_exclusive: impl Into<String>,
    ) -> Self {
        Self {
            min_inclusive: min_inclusive.into(),
            max_exclusive: max_exclusive.into(),
        }
    }

    pub fn full() -> Self {
        Self::new(MIN_EPK, MAX_EPK)
    }

    pub fn contains_epk(
        &self,
        epk: &str,
    ) -> bool {
        let epk = normalize(epk);
        normalize(&self.min_inclusive) <= epk && epk < normalize(&self.max_exclusive)
    }

    pub fn overlaps(
        &self,
        other: &FeedRange,
    ) -> bool {
        normalize(&self.min_inclusive) < normalize(&other.max_exclusive)
            && normalize(&other.min_inclusive) < normalize(&self.max_exclusive)
    }

    /// True when `other` lies entirely inside `self`.
    pub fn contains_range(
        &self,
        other: &FeedRange,
    ) -> bool {
        normalize(&self.min_inclusive) <= normalize(&other.min_inclusive)
            && normalize(&other.max_exclusive) <= normalize(&self.max_exclusive)
    }

    pub fn same_as(
        &self,
        other: &FeedRange,
    ) -> bool {
        normalize(&self.min_inclusive) == normalize(&other.min_inclusive)
            && normalize(&self.max_exclusive) == normalize(&other.max_exclusive)
    }

    /// True when `other` starts exactly where `self` ends or the other way round.
    pub fn is_adjacent_to(
        &self,
        other: &FeedRange,
    ) -> bool {
        normalize(&self.max_exclusive) == normalize(&other.min_inclusive)
            || normalize(&other.max_exclusive) == normalize(&self.min_inclusive)
    }

    /// Splits the range at its numeric midpoint.
    pub fn split(&self) -> Result<(FeedRange, FeedRange)> {
        let lo = parse_epk(&self.min_inclusive)?;
        let hi = parse_epk(&self.max_exclusive)?;
        if hi <= lo + 1 {
            return Err(FeedError::InvalidRange(format!("{self} is too narrow to split")).into());
        }
        let mid = format!("{:0width$X}", lo + (hi - lo) / 2, width = EPK_DIGITS);
        Ok((
            FeedRange::new(self.min_inclusive.clone(), mid.clone()),
            FeedRange::new(mid, self.max_exclusive.clone()),
        ))
    }

    /// Smallest range covering both inputs; the inputs must be adjacent.
    pub fn union(
        &self,
        other: &FeedRange,
    ) -> Result<FeedRange> {
        if !self.is_adjacent_to(other) {
            return Err(FeedError::InvalidRange(format!("{self} and {other} are not adjacent")).into());
        }
        let (first, second) = if normalize(&self.min_inclusive) < normalize(&other.min_inclusive) {
            (self, other)
        } else {
            (other, self)
        };
        Ok(FeedRange::new(first.min_inclusive.clone(), second.max_exclusive.clone()))
    }
}

impl std::fmt::Display for FeedRange {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "[{}, {})", self.min_inclusive, self.max_exclusive)
    }
}

/// A physical partition of the monitored container.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PartitionKeyRange {
    pub id: String,
    pub range: FeedRange,
    /// Ids of the ranges this one was split from or merged out of
    #[serde(default)]
    pub parents: Vec<String>,
}

impl PartitionKeyRange {
    pub fn new(
        id: impl Into<String>,
        range: FeedRange,
    ) -> Self {
        Self {
            id: id.into(),
            range,
            parents: Vec::new(),
        }
    }
}

/// Pads the key to a fixed width so that string order equals numeric order.
fn normalize(epk: &str) -> String {
    let mut s = epk.to_ascii_uppercase();
    while s.len() < EPK_DIGITS {
        s.push('0');
    }
    s
}

fn parse_epk(epk: &str) -> Result<u64> {
    if epk.len() > EPK_DIGITS {
        return Err(FeedError::InvalidRange(format!("effective partition key {epk} is too long")).into());
    }
    u64::from_str_radix(&normalize(epk), 16)
        .map_err(|e| FeedError::InvalidRange(format!("effective partition key {epk}: {e}")).into())
}
