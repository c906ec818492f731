//! Read-only snapshots exposed to status readers.

use crate::entry::{EntryKind, ExecutionState, LogEntry};

/// Aggregate counters over the local queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStatus {
    /// Parts currently being produced by in-flight entries.
    pub future_parts: usize,
    /// Entries in the local queue.
    pub queue_size: usize,
    pub inserts_in_queue: usize,
    pub merges_in_queue: usize,
    pub part_mutations_in_queue: usize,
    /// Oldest known `create_time` over all queued entries, 0 if unknown.
    pub queue_oldest_time: i64,
    pub inserts_oldest_time: i64,
    pub merges_oldest_time: i64,
    pub part_mutations_oldest_time: i64,
    /// Target part of the oldest queued insert.
    pub oldest_part_to_get: String,
    /// Target part of the oldest queued merge.
    pub oldest_part_to_merge_to: String,
    /// Target part of the oldest queued mutation.
    pub oldest_part_to_mutate_to: String,
    /// Wall clock of the last successful log pull, 0 before the first.
    pub last_queue_update: i64,
}

/// Point-in-time copy of one queued entry.
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    pub znode_name: String,
    pub kind: EntryKind,
    pub new_part_name: String,
    pub source_parts: Vec<String>,
    pub create_time: i64,
    pub execution: ExecutionState,
}

impl EntrySnapshot {
    pub(crate) fn capture(entry: &LogEntry) -> Self {
        EntrySnapshot {
            znode_name: entry.znode_name.clone(),
            kind: entry.kind(),
            new_part_name: entry.new_part_name.clone(),
            source_parts: entry.source_parts().to_vec(),
            create_time: entry.create_time,
            execution: entry.execution_state(),
        }
    }
}

/// Insert-time watermarks mirrored to the coordinator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertTimes {
    /// Lower bound on the `create_time` of still-queued inserts, 0 when the
    /// queue holds none.
    pub min_unprocessed_insert_time: i64,
    /// Largest `create_time` of any insert executed so far.
    pub max_processed_insert_time: i64,
}
