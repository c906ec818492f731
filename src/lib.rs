//! Per-replica replication queue for a coordinator-backed, sharded table
//! engine.
//!
//! Replicas of a table coordinate through a strongly-consistent service (an
//! ordered tree of versioned nodes with watches) holding a totally-ordered
//! replication log of data-modifying actions: part inserts, merges,
//! mutations, range drops, column clears. Each replica runs a
//! [`ReplicationQueue`] that pulls the log into a local queue, admits entries
//! when they are safe to execute, and retires them once done. The queue also
//! answers the merge planner's admission questions ([`can_merge_parts`],
//! [`can_mutate_part`]).
//!
//! The coordinator itself, the on-disk part store and the merge executor are
//! external: the queue consumes them through the [`Coordinator`],
//! [`PartStore`] and [`MergeControl`] traits.
//!
//! [`can_merge_parts`]: ReplicationQueue::can_merge_parts
//! [`can_mutate_part`]: ReplicationQueue::can_mutate_part

mod logging;

pub mod coordinator;
pub mod engine;
pub mod entry;
pub mod option;
pub mod part;
pub mod queue;

pub use crate::{
    coordinator::{Coordinator, CoordinatorError, QueuePaths, Watch},
    engine::{MergeControl, PartState, PartStore},
    entry::{EntryAction, EntryKind, LogEntry, MutationEntry},
    option::QueueOptions,
    part::{PartInfo, PartNameError, VirtualPartSet},
    queue::{
        CurrentlyExecuting, EntrySnapshot, InsertTimes, MergeBlocked, PostponeReason, QueueError,
        QueueStatus, ReplicationQueue,
    },
};
