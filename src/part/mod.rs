//! Part identity and the block-range algebra the queue reasons with.
//!
//! A part name encodes everything the queue needs to know about a part:
//! the partition it belongs to, the half-open range of insert block numbers
//! it covers, the merge level it was produced at and the mutation version it
//! was last rewritten to. Names are the only part representation that crosses
//! the wire; [`PartInfo`] is their parsed form.

mod virtual_set;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::virtual_set::VirtualPartSet;

/// A part name that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot parse part name {0:?}")]
pub struct PartNameError(pub String);

/// Parsed form of a part name: `partition_min_max_level[_mutation]`.
///
/// The partition id never contains `_`. The mutation suffix is present only
/// for parts rewritten by a mutation; `0` means "never mutated".
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartInfo {
    /// Partition the part belongs to.
    pub partition_id: String,
    /// Smallest insert block number covered by the part.
    pub min_block: i64,
    /// Largest insert block number covered by the part.
    pub max_block: i64,
    /// Merge depth: 0 for freshly inserted parts, parents are one above the
    /// deepest child.
    pub level: u32,
    /// Mutation version the part was last rewritten to, 0 if none.
    pub mutation: i64,
}

impl PartInfo {
    /// Build a part info for a plain (unmutated) part.
    pub fn new(partition_id: impl Into<String>, min_block: i64, max_block: i64, level: u32) -> Self {
        PartInfo {
            partition_id: partition_id.into(),
            min_block,
            max_block,
            level,
            mutation: 0,
        }
    }

    /// Parse a part name.
    pub fn parse(name: &str) -> Result<Self, PartNameError> {
        let err = || PartNameError(name.to_owned());

        let segments: Vec<&str> = name.split('_').collect();
        if segments.len() != 4 && segments.len() != 5 {
            return Err(err());
        }
        if segments[0].is_empty() {
            return Err(err());
        }

        let min_block: i64 = segments[1].parse().map_err(|_| err())?;
        let max_block: i64 = segments[2].parse().map_err(|_| err())?;
        let level: u32 = segments[3].parse().map_err(|_| err())?;
        let mutation: i64 = match segments.get(4) {
            Some(segment) => segment.parse().map_err(|_| err())?,
            None => 0,
        };

        Ok(PartInfo {
            partition_id: segments[0].to_owned(),
            min_block,
            max_block,
            level,
            mutation,
        })
    }

    /// Render the canonical part name. The inverse of [`PartInfo::parse`]
    /// (an explicit `_0` mutation suffix is normalised away).
    pub fn name(&self) -> String {
        if self.mutation != 0 {
            format!(
                "{}_{}_{}_{}_{}",
                self.partition_id, self.min_block, self.max_block, self.level, self.mutation
            )
        } else {
            format!(
                "{}_{}_{}_{}",
                self.partition_id, self.min_block, self.max_block, self.level
            )
        }
    }

    /// Whether `self` covers `other`: same partition, enclosing block range,
    /// and at least as deep a merge level.
    pub fn contains(&self, other: &PartInfo) -> bool {
        self.partition_id == other.partition_id
            && self.min_block <= other.min_block
            && other.max_block <= self.max_block
            && self.level >= other.level
    }

    /// Whether the block ranges of two parts in the same partition overlap.
    pub fn intersects(&self, other: &PartInfo) -> bool {
        self.partition_id == other.partition_id
            && self.min_block <= other.max_block
            && other.min_block <= self.max_block
    }

    /// The data version the mutation index compares against: the mutation
    /// version when the part has been mutated, otherwise its min block number.
    pub fn data_version(&self) -> i64 {
        if self.mutation != 0 {
            self.mutation
        } else {
            self.min_block
        }
    }
}

impl fmt::Display for PartInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}
