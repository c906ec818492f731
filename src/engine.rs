//! Interfaces to the surrounding table engine.
//!
//! The queue does not execute anything itself; it only decides. These traits
//! are the two facts it needs from the engine to decide: what the merge
//! executor currently admits, and how big the candidate source parts are on
//! local disk.

/// Lifecycle state of a part in the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartState {
    /// Written but not yet visible to reads.
    PreCommitted,
    /// Visible to reads.
    Committed,
    /// Replaced by a covering part, pending cleanup.
    Outdated,
}

/// Admission facts from the merge executor.
pub trait MergeControl: Send + Sync {
    /// Whether merges are cooperatively cancelled right now.
    fn merges_cancelled(&self) -> bool;

    /// Current ceiling on the total byte size of a merge's source parts.
    /// Shrinks as the executor pool saturates; equals the configured pool
    /// maximum when the pool is free.
    fn max_parts_size_for_merge(&self) -> u64;
}

/// Size lookups against the local on-disk part store.
pub trait PartStore: Send + Sync {
    /// Bytes the named part occupies on disk, when it exists locally in one
    /// of the given states.
    fn part_bytes_on_disk(&self, part_name: &str, states: &[PartState]) -> Option<u64>;
}
