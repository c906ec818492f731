//! Failure domains and admission verdicts of the replication queue.

use thiserror::Error;

use crate::{coordinator::CoordinatorError, entry::EntryParseError, part::PartNameError};

/// Errors surfaced by queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),
    /// A child with a name the protocol does not produce turned up in a
    /// coordinator directory. Aborts the pull; the data is not trustworthy.
    #[error("unexpected node {name} in {dir}")]
    UnexpectedNode { name: String, dir: String },
    /// A node body did not hold what the protocol put there.
    #[error("invalid coordinator data at {path}: {reason}")]
    InvalidData { path: String, reason: String },
    #[error("log entry parse error: {0}")]
    Entry(#[from] EntryParseError),
    #[error(transparent)]
    PartName(#[from] PartNameError),
    /// A range operation is blocked by entries that are still executing.
    #[error("{0}")]
    Unfinished(String),
    /// An internal invariant does not hold.
    #[error("logical error: {0}")]
    Logical(String),
}

/// Why admission refused to run a queued entry right now. Recorded on the
/// entry and re-evaluated on the next selection pass.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PostponeReason {
    #[error(
        "not executing log entry for part {part} because another log entry \
         for the same part is being processed"
    )]
    AnotherEntryForSamePart { part: String },
    #[error(
        "not executing log entry for part {part} because it is covered by \
         part {covering} that is being produced"
    )]
    CoveredByFuturePart { part: String, covering: String },
    #[error(
        "not merging into part {new_part} because part {source_part} is not ready \
         yet (log entry for that part is being processed)"
    )]
    SourcePartNotReady { new_part: String, source_part: String },
    #[error("not executing log entry for part {new_part} because merges are cancelled now")]
    MergesCancelled { new_part: String },
    #[error(
        "not executing log entry for part {new_part} because its size \
         ({sum_bytes} bytes) is greater than the current maximum ({max_bytes} bytes)"
    )]
    MergeIsLargerThanCurrentMax {
        new_part: String,
        sum_bytes: u64,
        max_bytes: u64,
    },
    #[error("{description}")]
    ClearColumnConflicts { description: String },
}

/// Why a pair of parts may not be merged right now.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeBlocked {
    #[error("cannot merge the part {0} with itself")]
    SamePart(String),
    #[error("parts {0} and {1} belong to different partitions")]
    DifferentPartitions(String, String),
    #[error("entry for part {0} hasn't been read from the replication log yet")]
    NotInReplicationLog(String),
    #[error("a merge has already been assigned for {0}")]
    MergeAlreadyAssigned(String),
    #[error("part {0} is the most recent part with a satisfied quorum")]
    LastQuorumPart(String),
    #[error("quorum insert for part {0} is currently in progress")]
    QuorumInsertInProgress(String),
    #[error("block number {block} is still being inserted between parts {left} and {right}")]
    EphemeralInsertInGap {
        block: i64,
        left: String,
        right: String,
    },
    #[error(
        "there are {count} parts (from {first} to {last}) that are still not \
         ready between {left} and {right}"
    )]
    UnreadyPartsInGap {
        count: usize,
        first: String,
        last: String,
        left: String,
        right: String,
    },
    #[error(
        "current mutation versions of parts {left} and {right} differ: \
         {left_version} and {right_version} respectively"
    )]
    MutationVersionsDiffer {
        left: String,
        right: String,
        left_version: i64,
        right_version: i64,
    },
}
