//! Replica-local queue state. Everything in here is guarded by the queue's
//! state mutex; the methods assume it is held.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    sync::Arc,
};

use crate::{
    entry::{EntryKind, LogEntry, MutationEntry},
    part::{PartInfo, VirtualPartSet},
};

#[derive(Debug, Default)]
pub(crate) struct QueueState {
    /// Execution order is front to back; drop-range entries jump the line and
    /// reordered merge siblings are spliced to the back.
    pub queue: VecDeque<Arc<LogEntry>>,
    /// Parts the replica expects to materialise, as of the last completed
    /// pull.
    pub virtual_parts: VirtualPartSet,
    /// Lookahead over `virtual_parts`: also covers entries seen in the log
    /// but not yet admitted into `virtual_parts`.
    pub next_virtual_parts: VirtualPartSet,
    /// Parts currently being produced by in-flight entries, by name.
    pub future_parts: HashMap<String, PartInfo>,
    /// Queued inserts keyed by `(create_time, znode_name)`.
    pub inserts_by_time: BTreeSet<(i64, String)>,
    /// Ephemeral block numbers of inserts in progress on any replica, per
    /// partition. Refreshed on every pull.
    pub current_inserts: HashMap<String, BTreeSet<i64>>,
    /// Known mutations in ascending `znode_name` order.
    pub mutations: VecDeque<Arc<MutationEntry>>,
    /// Partition to (mutation block number to mutation).
    pub mutations_by_partition: HashMap<String, BTreeMap<i64, Arc<MutationEntry>>>,
    /// Latest part name with a satisfied write quorum, empty if none.
    pub last_quorum_part: String,
    /// Part name with a quorum write in progress, empty if none.
    pub inprogress_quorum_part: String,
    pub min_unprocessed_insert_time: i64,
    pub max_processed_insert_time: i64,
    pub last_queue_update: i64,
}

impl QueueState {
    /// Insert an entry into the queue and every derived index. Returns the
    /// new `min_unprocessed_insert_time` when the entry lowered it.
    pub fn insert_entry(&mut self, entry: Arc<LogEntry>) -> Option<i64> {
        self.next_virtual_parts.add(entry.part_info().clone());

        let kind = entry.kind();
        let mut min_changed = None;
        if kind == EntryKind::GetPart {
            self.inserts_by_time
                .insert((entry.create_time, entry.znode_name.clone()));
            if entry.create_time != 0
                && (self.min_unprocessed_insert_time == 0
                    || entry.create_time < self.min_unprocessed_insert_time)
            {
                self.min_unprocessed_insert_time = entry.create_time;
                min_changed = Some(entry.create_time);
            }
        }

        // Drop-range entries go first so the replica does not fetch parts it
        // is about to delete anyway.
        if kind == EntryKind::DropRange {
            self.queue.push_front(entry);
        } else {
            self.queue.push_back(entry);
        }

        min_changed
    }

    /// Maintain the insert-time watermarks after removing `entry` from the
    /// queue. Returns the changed `(min_unprocessed, max_processed)` values.
    pub fn update_times_on_removal(&mut self, entry: &LogEntry) -> (Option<i64>, Option<i64>) {
        if entry.kind() != EntryKind::GetPart {
            return (None, None);
        }

        self.inserts_by_time
            .remove(&(entry.create_time, entry.znode_name.clone()));

        let mut min_changed = None;
        if self.inserts_by_time.is_empty() {
            if self.min_unprocessed_insert_time != 0 {
                self.min_unprocessed_insert_time = 0;
                min_changed = Some(0);
            }
        } else if let Some((first_time, _)) = self.inserts_by_time.first() {
            if *first_time > self.min_unprocessed_insert_time {
                self.min_unprocessed_insert_time = *first_time;
                min_changed = Some(*first_time);
            }
        }

        let mut max_changed = None;
        if entry.create_time > self.max_processed_insert_time {
            self.max_processed_insert_time = entry.create_time;
            max_changed = Some(entry.create_time);
        }

        (min_changed, max_changed)
    }

    /// Largest mutation version at or below the part's data version, -1 when
    /// the partition has none. (0 is a valid mutation block number.)
    pub fn current_mutation_version(&self, part_info: &PartInfo) -> i64 {
        let Some(in_partition) = self.mutations_by_partition.get(&part_info.partition_id) else {
            return -1;
        };
        in_partition
            .range(..=part_info.data_version())
            .next_back()
            .map(|(version, _)| *version)
            .unwrap_or(-1)
    }

    /// Drop a mutation from the per-partition index.
    pub fn unindex_mutation(&mut self, mutation: &MutationEntry) {
        for (partition_id, block_number) in &mutation.block_numbers {
            if let Some(in_partition) = self.mutations_by_partition.get_mut(partition_id) {
                in_partition.remove(block_number);
                if in_partition.is_empty() {
                    self.mutations_by_partition.remove(partition_id);
                }
            }
        }
    }
}
