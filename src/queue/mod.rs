//! The per-replica replication queue.
//!
//! Every replica runs one [`ReplicationQueue`]: it advances a durable cursor
//! through the shared replication log, mirrors the entries it passes into a
//! local queue (both in the coordinator and in RAM), decides when each entry
//! is safe to execute, and retires finished entries from both places. It is
//! also the admission oracle the merge planner consults before assigning new
//! merges or mutations.
//!
//! Locking: one state mutex guards all replica-local state (never held
//! across coordinator I/O), and two async locks serialize log pulls and
//! mutation refreshes, each held across the I/O they order.

pub mod error;
mod executing;
mod state;
mod status;

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    ops::Bound,
    panic::{self, AssertUnwindSafe},
    process,
    sync::Arc,
};

use futures::future;
use itertools::Itertools;
use log::Level;
use parking_lot::Mutex;
use serde::Deserialize;

use crate::{
    coordinator::{Coordinator, Op, OpResult, QueuePaths, Watch},
    engine::{MergeControl, PartState, PartStore},
    entry::{unix_time, EntryKind, LogEntry, MutationEntry},
    logging::queue_log,
    option::QueueOptions,
    part::PartInfo,
    queue::state::QueueState,
};

pub use self::{
    error::{MergeBlocked, PostponeReason, QueueError},
    executing::CurrentlyExecuting,
    status::{EntrySnapshot, InsertTimes, QueueStatus},
};

/// Part states a merge may take its source bytes from.
const MERGEABLE_STATES: [PartState; 3] = [
    PartState::PreCommitted,
    PartState::Committed,
    PartState::Outdated,
];

pub(crate) struct QueueShared {
    paths: QueuePaths,
    options: QueueOptions,
    state: Mutex<QueueState>,
    /// At most one log pull at a time; held across the pull's coordinator
    /// I/O. Loading the local queue takes it too, because both publish into
    /// the same queue directory.
    pull_logs_lock: async_lock::Mutex<()>,
    /// Same guarantee for mutation refreshes.
    update_mutations_lock: async_lock::Mutex<()>,
}

/// The replication queue of one replica.
///
/// Cheap to clone; clones share all state. Coordinator handles are passed
/// per call so the caller controls session renewal.
#[derive(Clone)]
pub struct ReplicationQueue {
    shared: Arc<QueueShared>,
}

#[derive(Debug, Deserialize)]
struct QuorumStatus {
    part_name: String,
}

impl ReplicationQueue {
    pub fn new(paths: QueuePaths, options: QueueOptions) -> Self {
        ReplicationQueue {
            shared: Arc::new(QueueShared {
                paths,
                options,
                state: Mutex::new(QueueState::default()),
                pull_logs_lock: async_lock::Mutex::new(()),
                update_mutations_lock: async_lock::Mutex::new(()),
            }),
        }
    }

    pub fn paths(&self) -> &QueuePaths {
        &self.shared.paths
    }

    /// Seed the virtual-part sets from the parts committed locally, then
    /// load the persisted queue. Called once on startup before any pull.
    pub async fn initialize(
        &self,
        coordinator: &dyn Coordinator,
        local_parts: impl IntoIterator<Item = PartInfo>,
    ) -> Result<bool, QueueError> {
        self.init_virtual_parts(local_parts);
        self.load(coordinator).await
    }

    /// Seed `next_virtual_parts` from the names of committed local parts and
    /// copy it into `virtual_parts`.
    pub fn init_virtual_parts(&self, local_parts: impl IntoIterator<Item = PartInfo>) {
        let mut state = self.shared.state.lock();
        for part in local_parts {
            state.next_virtual_parts.add(part);
        }
        state.virtual_parts = state.next_virtual_parts.clone();
    }

    /// Load queue entries persisted under the replica's queue directory.
    /// Idempotent: entries already in RAM are skipped. Returns whether
    /// anything new was loaded.
    pub async fn load(&self, coordinator: &dyn Coordinator) -> Result<bool, QueueError> {
        // Serialized with pulls: a concurrent pull publishes into the same
        // queue directory and would double-insert what this listing saw.
        let _pull_guard = self.shared.pull_logs_lock.lock().await;
        let paths = &self.shared.paths;
        queue_log!(Level::Debug, "loading_queue", "path={}", paths.queue_dir());

        let already_loaded: HashSet<String> = {
            let state = self.shared.state.lock();
            state
                .queue
                .iter()
                .map(|entry| entry.znode_name.clone())
                .collect()
        };

        let mut children = coordinator.get_children(&paths.queue_dir(), None).await?;
        let listed = children.len();
        children.retain(|child| !already_loaded.contains(child));
        children.sort();
        queue_log!(
            Level::Debug,
            "queue_children",
            "to_load={} already_loaded={}",
            children.len(),
            listed - children.len()
        );

        let child_paths: Vec<String> = children.iter().map(|c| paths.queue_entry(c)).collect();
        let bodies =
            future::try_join_all(child_paths.iter().map(|path| coordinator.get(path))).await?;

        let mut parsed = Vec::with_capacity(children.len());
        for (child, body) in children.into_iter().zip(bodies) {
            let mut entry = LogEntry::parse(&body)?;
            entry.znode_name = child;
            parsed.push(entry);
        }

        let updated = !parsed.is_empty();
        let mut min_changed = None;
        {
            let mut state = self.shared.state.lock();
            for entry in parsed {
                if let Some(time) = state.insert_entry(Arc::new(entry)) {
                    min_changed = Some(time);
                }
            }
        }

        self.update_times_in_coordinator(coordinator, min_changed, None)
            .await;
        Ok(updated)
    }

    /// Insert a self-originated entry. The caller has already published the
    /// entry's znode under the queue directory; this mirrors it into RAM.
    pub async fn insert(&self, coordinator: &dyn Coordinator, entry: Arc<LogEntry>) {
        let min_changed = {
            let mut state = self.shared.state.lock();
            state.insert_entry(entry)
        };
        self.update_times_in_coordinator(coordinator, min_changed, None)
            .await;
    }

    /// Copy fresh shared-log entries into the local queue and advance the
    /// log pointer, atomically per batch. Returns whether anything was
    /// copied. When a watch is supplied it fires on the next change of the
    /// shared log's children.
    pub async fn pull_logs_to_queue(
        &self,
        coordinator: &dyn Coordinator,
        watch: Option<Watch>,
    ) -> Result<bool, QueueError> {
        let _pull_guard = self.shared.pull_logs_lock.lock().await;
        let paths = self.shared.paths.clone();

        let pointer_bytes = coordinator.get(&paths.log_pointer()).await?;
        let children = coordinator.get_children(&paths.log_dir(), watch).await?;
        let mut log_children = Vec::with_capacity(children.len());
        for child in children {
            let index = parse_log_child(&child, &paths.log_dir())?;
            log_children.push((index, child));
        }

        // Mutations are refreshed before the new entries are inserted, so a
        // queue state observed at any later point reflects at least the
        // mutations known when these entries entered the queue.
        self.update_mutations(coordinator, None).await?;

        let pointer_text = String::from_utf8_lossy(&pointer_bytes);
        let pointer_text = pointer_text.trim();
        let index = if pointer_text.is_empty() {
            // No pointer yet: start at the first entry still in the log.
            let index = log_children
                .iter()
                .map(|(index, _)| *index)
                .min()
                .unwrap_or(0);
            coordinator
                .set(&paths.log_pointer(), index.to_string().into_bytes())
                .await?;
            index
        } else {
            pointer_text
                .parse::<u64>()
                .map_err(|parse_error| QueueError::InvalidData {
                    path: paths.log_pointer(),
                    reason: parse_error.to_string(),
                })?
        };

        let mut min_log_entry = QueuePaths::log_child(index);
        log_children.retain(|(child_index, _)| *child_index >= index);
        log_children.sort();

        let copied_any = !log_children.is_empty();

        for chunk in log_children.chunks(self.shared.options.pull_batch_size.max(1)) {
            let Some((last_index, _)) = chunk.last() else {
                continue;
            };
            let last_index = *last_index;
            queue_log!(
                Level::Debug,
                "pulling_entries",
                "count={} first={} last={}",
                chunk.len(),
                chunk[0].1,
                chunk[chunk.len() - 1].1
            );

            let entry_paths: Vec<String> =
                chunk.iter().map(|(_, child)| paths.log_entry(child)).collect();
            let bodies =
                future::try_join_all(entry_paths.iter().map(|path| coordinator.get(path))).await?;

            // One atomic multi: publish every entry into the replica queue
            // and advance the pointer together, or do neither.
            let mut copied_entries = Vec::with_capacity(chunk.len());
            let mut ops = Vec::with_capacity(chunk.len() + 2);
            let mut min_changed = None;
            for body in bodies {
                let entry = LogEntry::parse(&body)?;
                ops.push(Op::Create {
                    path: paths.queue_create_prefix(),
                    data: body,
                    sequential: true,
                });
                if entry.kind() == EntryKind::GetPart && entry.create_time != 0 {
                    let mut state = self.shared.state.lock();
                    if state.min_unprocessed_insert_time == 0
                        || entry.create_time < state.min_unprocessed_insert_time
                    {
                        state.min_unprocessed_insert_time = entry.create_time;
                        min_changed = Some(entry.create_time);
                    }
                }
                copied_entries.push(entry);
            }
            ops.push(Op::Set {
                path: paths.log_pointer(),
                data: (last_index + 1).to_string().into_bytes(),
            });
            if let Some(time) = min_changed {
                ops.push(Op::Set {
                    path: paths.min_unprocessed_insert_time(),
                    data: time.to_string().into_bytes(),
                });
            }

            let responses = coordinator.multi(ops).await?;

            // The coordinator accepted the batch; RAM must now follow. A
            // failure here leaves RAM behind the coordinator and would
            // corrupt every later commit.
            abort_on_state_divergence("inserting pulled log entries", || {
                let mut state = self.shared.state.lock();
                for (mut entry, response) in copied_entries.drain(..).zip(&responses) {
                    let OpResult::Created { path } = response else {
                        panic!("pulled log entry got a non-create response");
                    };
                    entry.znode_name = path
                        .rsplit('/')
                        .next()
                        .unwrap_or_default()
                        .to_owned();
                    state.insert_entry(Arc::new(entry));
                }
                state.last_queue_update = unix_time();
            });

            min_log_entry = QueuePaths::log_child(last_index + 1);
            queue_log!(Level::Debug, "pulled_entries", "count={}", chunk.len());
        }

        // Refresh the lookahead: ephemeral inserts, quorum state, and the
        // produced-part names of every log entry at or past the new cursor.
        let new_current_inserts = self.load_current_inserts(coordinator).await?;

        let new_last_quorum_part = match coordinator.try_get(&paths.quorum_last_part()).await? {
            Some(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            None => String::new(),
        };
        let new_inprogress_quorum_part = match coordinator.try_get(&paths.quorum_status()).await? {
            Some(bytes) => serde_json::from_slice::<QuorumStatus>(&bytes)
                .map_err(|parse_error| QueueError::InvalidData {
                    path: paths.quorum_status(),
                    reason: parse_error.to_string(),
                })?
                .part_name,
            None => String::new(),
        };

        let mut lookahead_children = coordinator.get_children(&paths.log_dir(), None).await?;
        lookahead_children.retain(|child| child.as_str() >= min_log_entry.as_str());
        let lookahead_paths: Vec<String> = lookahead_children
            .iter()
            .map(|child| paths.log_entry(child))
            .collect();
        let lookahead_bodies =
            future::try_join_all(lookahead_paths.iter().map(|path| coordinator.try_get(path)))
                .await?;
        let mut lookahead_parts = Vec::new();
        for body in lookahead_bodies.into_iter().flatten() {
            lookahead_parts.push(LogEntry::parse(&body)?.part_info().clone());
        }

        {
            let mut state = self.shared.state.lock();
            state.virtual_parts = state.next_virtual_parts.clone();
            state.current_inserts = new_current_inserts;
            state.last_quorum_part = new_last_quorum_part;
            state.inprogress_quorum_part = new_inprogress_quorum_part;
            for part in lookahead_parts {
                state.next_virtual_parts.add(part);
            }
        }

        Ok(copied_any)
    }

    /// Refresh the mutation list from the coordinator: drop mutations it no
    /// longer knows, append the ones it gained. Returns whether anything was
    /// appended.
    pub async fn update_mutations(
        &self,
        coordinator: &dyn Coordinator,
        watch: Option<Watch>,
    ) -> Result<bool, QueueError> {
        let _refresh_guard = self.shared.update_mutations_lock.lock().await;
        let paths = &self.shared.paths;

        let mut children = coordinator.get_children(&paths.mutations_dir(), watch).await?;
        children.sort();

        let entries_to_load: Vec<String> = {
            let mut state = self.shared.state.lock();
            if children.is_empty() {
                state.mutations.clear();
                state.mutations_by_partition.clear();
            } else {
                while state
                    .mutations
                    .front()
                    .is_some_and(|mutation| mutation.znode_name < children[0])
                {
                    let Some(obsolete) = state.mutations.pop_front() else {
                        break;
                    };
                    queue_log!(
                        Level::Debug,
                        "drop_obsolete_mutation",
                        "znode={}",
                        obsolete.znode_name
                    );
                    state.unindex_mutation(&obsolete);
                }
            }
            match state.mutations.back() {
                None => children,
                Some(back) => children
                    .into_iter()
                    .filter(|child| *child > back.znode_name)
                    .collect(),
            }
        };

        if entries_to_load.is_empty() {
            return Ok(false);
        }
        queue_log!(
            Level::Info,
            "loading_mutations",
            "count={} first={} last={}",
            entries_to_load.len(),
            entries_to_load[0],
            entries_to_load[entries_to_load.len() - 1]
        );

        let entry_paths: Vec<String> = entries_to_load
            .iter()
            .map(|child| paths.mutation_entry(child))
            .collect();
        let bodies =
            future::try_join_all(entry_paths.iter().map(|path| coordinator.get(path))).await?;

        let mut new_mutations = Vec::with_capacity(entries_to_load.len());
        for (child, body) in entries_to_load.into_iter().zip(bodies) {
            new_mutations.push(Arc::new(MutationEntry::parse(&body, child)?));
        }

        {
            let mut state = self.shared.state.lock();
            for mutation in &new_mutations {
                for (partition_id, block_number) in &mutation.block_numbers {
                    state
                        .mutations_by_partition
                        .entry(partition_id.clone())
                        .or_default()
                        .insert(*block_number, mutation.clone());
                }
            }
            state.mutations.extend(new_mutations);
        }

        Ok(true)
    }

    /// Collect the ephemeral block numbers of inserts in progress on any
    /// replica: a block is live while its body names a lock node that still
    /// exists under the temp directory.
    async fn load_current_inserts(
        &self,
        coordinator: &dyn Coordinator,
    ) -> Result<HashMap<String, BTreeSet<i64>>, QueueError> {
        let paths = &self.shared.paths;
        let mut result: HashMap<String, BTreeSet<i64>> = HashMap::new();

        let mut lock_holders = HashSet::new();
        for child in coordinator.get_children(&paths.temp_dir(), None).await? {
            if child.starts_with("abandonable_lock-") {
                lock_holders.insert(paths.temp_child(&child));
            }
        }
        if lock_holders.is_empty() {
            return Ok(result);
        }

        let partitions = coordinator
            .get_children(&paths.block_numbers_dir(), None)
            .await?;
        let partition_dirs: Vec<String> = partitions
            .iter()
            .map(|partition| paths.partition_blocks_dir(partition))
            .collect();
        let listings = future::try_join_all(
            partition_dirs
                .iter()
                .map(|dir| coordinator.get_children(dir, None)),
        )
        .await?;

        let mut blocks = Vec::new();
        for (partition, children) in partitions.iter().zip(listings) {
            for child in children {
                let number: i64 = child
                    .strip_prefix("block-")
                    .and_then(|digits| digits.parse().ok())
                    .ok_or_else(|| QueueError::UnexpectedNode {
                        name: child.clone(),
                        dir: paths.partition_blocks_dir(partition),
                    })?;
                blocks.push((
                    partition.clone(),
                    number,
                    paths.partition_block(partition, &child),
                ));
            }
        }

        let bodies = future::try_join_all(
            blocks
                .iter()
                .map(|(_, _, block_path)| coordinator.try_get(block_path)),
        )
        .await?;
        for ((partition, number, _), body) in blocks.into_iter().zip(bodies) {
            let Some(body) = body else { continue };
            let Ok(holder) = String::from_utf8(body) else {
                continue;
            };
            if lock_holders.contains(&holder) {
                result.entry(partition).or_default().insert(number);
            }
        }

        Ok(result)
    }

    /// Best-effort publication of changed insert-time watermarks. A raced or
    /// failed update briefly publishes a stale value; the next pull
    /// reconciles.
    async fn update_times_in_coordinator(
        &self,
        coordinator: &dyn Coordinator,
        min_changed: Option<i64>,
        max_changed: Option<i64>,
    ) {
        let paths = &self.shared.paths;
        let mut ops = Vec::new();
        if let Some(time) = min_changed {
            ops.push(Op::Set {
                path: paths.min_unprocessed_insert_time(),
                data: time.to_string().into_bytes(),
            });
        }
        if let Some(time) = max_changed {
            ops.push(Op::Set {
                path: paths.max_processed_insert_time(),
                data: time.to_string().into_bytes(),
            });
        }
        if ops.is_empty() {
            return;
        }
        if let Err(error) = coordinator.multi(ops).await {
            queue_log!(
                Level::Error,
                "insert_times_update_failed",
                "err={error}; this shouldn't happen often"
            );
        }
    }

    /// Retire an executed entry from the coordinator and from RAM.
    pub async fn remove(&self, coordinator: &dyn Coordinator, entry: &Arc<LogEntry>) {
        if let Err(error) = coordinator
            .remove(&self.shared.paths.queue_entry(&entry.znode_name))
            .await
        {
            queue_log!(
                Level::Error,
                "queue_znode_remove_failed",
                "znode={} err={error}; this shouldn't happen often",
                entry.znode_name
            );
        }

        let (min_changed, max_changed) = {
            let mut state = self.shared.state.lock();
            // Entries picked for execution were just spliced to the back, so
            // the entry being retired is almost always near the end.
            if let Some(position) = state
                .queue
                .iter()
                .rposition(|queued| Arc::ptr_eq(queued, entry))
            {
                state.queue.remove(position);
            }
            state.update_times_on_removal(entry)
        };

        self.update_times_in_coordinator(coordinator, min_changed, max_changed)
            .await;
    }

    /// Remove the first queued entry producing `part_name`, from RAM and the
    /// coordinator. Returns whether one was found.
    pub async fn remove_part(&self, coordinator: &dyn Coordinator, part_name: &str) -> bool {
        let (found, min_changed, max_changed) = {
            let mut state = self.shared.state.lock();
            match state
                .queue
                .iter()
                .position(|queued| queued.new_part_name == part_name)
            {
                Some(position) => match state.queue.remove(position) {
                    Some(entry) => {
                        let (min_changed, max_changed) = state.update_times_on_removal(&entry);
                        (Some(entry), min_changed, max_changed)
                    }
                    None => (None, None, None),
                },
                None => (None, None, None),
            }
        };

        let Some(entry) = found else {
            return false;
        };
        if let Err(error) = coordinator
            .remove(&self.shared.paths.queue_entry(&entry.znode_name))
            .await
        {
            queue_log!(
                Level::Error,
                "queue_znode_remove_failed",
                "znode={} err={error}; this shouldn't happen often",
                entry.znode_name
            );
        }
        self.update_times_in_coordinator(coordinator, min_changed, max_changed)
            .await;
        true
    }

    /// Remove every queued part-producing entry whose output is covered by
    /// `part_name`, then wait until the removed entries that were already
    /// executing have finished.
    pub async fn remove_part_producing_ops_in_range(
        &self,
        coordinator: &dyn Coordinator,
        part_name: &str,
    ) -> Result<(), QueueError> {
        let range = PartInfo::parse(part_name)?;

        let mut to_wait = Vec::new();
        let mut removed_znodes = Vec::new();
        let (min_changed, max_changed) = {
            let mut state = self.shared.state.lock();
            let mut min_changed = None;
            let mut max_changed = None;
            let mut index = 0;
            while index < state.queue.len() {
                let produces_covered_part = {
                    let queued = &state.queue[index];
                    matches!(
                        queued.kind(),
                        EntryKind::GetPart | EntryKind::MergeParts | EntryKind::MutatePart
                    ) && range.contains(queued.part_info())
                };
                if !produces_covered_part {
                    index += 1;
                    continue;
                }
                let Some(queued) = state.queue.remove(index) else {
                    break;
                };
                if queued.is_executing() {
                    to_wait.push(queued.clone());
                }
                removed_znodes.push(queued.znode_name.clone());
                let (min_c, max_c) = state.update_times_on_removal(&queued);
                if min_c.is_some() {
                    min_changed = min_c;
                }
                if max_c.is_some() {
                    max_changed = max_c;
                }
            }
            (min_changed, max_changed)
        };

        for znode_name in &removed_znodes {
            if let Err(error) = coordinator
                .remove(&self.shared.paths.queue_entry(znode_name))
                .await
            {
                queue_log!(
                    Level::Info,
                    "queue_znode_remove_failed",
                    "znode={znode_name} err={error}"
                );
            }
        }
        self.update_times_in_coordinator(coordinator, min_changed, max_changed)
            .await;

        queue_log!(
            Level::Debug,
            "removed_range_ops",
            "range={part_name} removed={} waiting={}",
            removed_znodes.len(),
            to_wait.len()
        );

        for entry in to_wait {
            entry.wait_until_not_executing().await;
        }
        Ok(())
    }

    /// Find the first queued merge or mutation consuming `part_name` and
    /// splice every earlier producer of its sibling parts to the back of the
    /// queue, preserving their relative order. Returns the sibling set, empty
    /// when no such merge is queued.
    pub fn move_sibling_parts_for_merge_to_end_of_queue(
        &self,
        part_name: &str,
    ) -> HashSet<String> {
        let mut state = self.shared.state.lock();

        let mut parts_for_merge = HashSet::new();
        let mut merge_position = None;
        for (position, queued) in state.queue.iter().enumerate() {
            if matches!(queued.kind(), EntryKind::MergeParts | EntryKind::MutatePart)
                && queued.source_parts().iter().any(|part| part == part_name)
            {
                parts_for_merge = queued.source_parts().iter().cloned().collect();
                merge_position = Some(position);
                break;
            }
        }

        if let Some(mut boundary) = merge_position {
            let mut index = 0;
            while index < boundary {
                let is_sibling_producer = {
                    let queued = &state.queue[index];
                    matches!(
                        queued.kind(),
                        EntryKind::MergeParts | EntryKind::GetPart | EntryKind::MutatePart
                    ) && parts_for_merge.contains(&queued.new_part_name)
                };
                if is_sibling_producer {
                    if let Some(queued) = state.queue.remove(index) {
                        state.queue.push_back(queued);
                    }
                    boundary -= 1;
                } else {
                    index += 1;
                }
            }
        }

        parts_for_merge
    }

    /// All currently-executing entries (other than `entry` itself) whose
    /// work overlaps a column clear over `entry`'s range, plus a rendered
    /// description.
    fn conflicts_for_clear_column(
        state: &QueueState,
        entry: &LogEntry,
    ) -> (Vec<Arc<LogEntry>>, String) {
        let mut conflicts = Vec::new();
        for queued in &state.queue {
            if !queued.is_executing() || queued.znode_name == entry.znode_name {
                continue;
            }
            match queued.kind() {
                EntryKind::MergeParts
                | EntryKind::GetPart
                | EntryKind::MutatePart
                | EntryKind::AttachPart => {
                    if entry.part_info().contains(queued.part_info()) {
                        conflicts.push(queued.clone());
                    }
                }
                EntryKind::ClearColumn => {
                    if queued.part_info().partition_id == entry.part_info().partition_id {
                        conflicts.push(queued.clone());
                    }
                }
                EntryKind::DropRange => {}
            }
        }

        let description = format!(
            "cannot execute {} entry {}: {} currently executing entries are blocking it: {}",
            entry.kind().type_name(),
            entry.znode_name,
            conflicts.len(),
            conflicts
                .iter()
                .map(|conflict| format!(
                    "{} {} {}",
                    conflict.kind().type_name(),
                    conflict.new_part_name,
                    conflict.znode_name
                ))
                .join(", ")
        );
        (conflicts, description)
    }

    /// Verify that a column clear over `entry`'s range can start: nothing
    /// conflicting is executing, and the range is tagged as a future part
    /// (the caller must have blocked merges and fetches in it first).
    pub fn disable_merges_and_fetches_in_range(&self, entry: &LogEntry) -> Result<(), QueueError> {
        let state = self.shared.state.lock();
        let (conflicts, description) = Self::conflicts_for_clear_column(&state, entry);
        if !conflicts.is_empty() {
            return Err(QueueError::Unfinished(description));
        }
        if !state.future_parts.contains_key(&entry.new_part_name) {
            return Err(QueueError::Logical(format!(
                "expected merges and fetches to be blocked in range {}",
                entry.new_part_name
            )));
        }
        Ok(())
    }

    /// Permanently block merge assignment inside the range: a covering
    /// virtual part makes `can_merge_parts` refuse everything under it.
    pub fn disable_merges_in_range(&self, part_name: &str) -> Result<(), QueueError> {
        let part = PartInfo::parse(part_name)?;
        self.shared.state.lock().virtual_parts.add(part);
        Ok(())
    }

    /// Tag `part_name` as a future part of `entry` unless an in-flight entry
    /// already produces or covers it. Used by the executor once quorum
    /// resolution picks the concrete part it will produce.
    pub fn add_future_part_if_not_covered_by_them(
        &self,
        entry: &LogEntry,
        part_name: &str,
    ) -> Result<bool, QueueError> {
        let part = PartInfo::parse(part_name)?;
        let mut state = self.shared.state.lock();
        match is_not_covered_by_future_parts(&state, part_name, &part) {
            Ok(()) => {
                CurrentlyExecuting::set_actual_part_name(
                    entry,
                    part_name.to_owned(),
                    part,
                    &mut state,
                );
                Ok(true)
            }
            Err(reason) => {
                queue_log!(Level::Debug, "actual_part_rejected", "{reason}");
                Ok(false)
            }
        }
    }

    /// Pick the first queue entry that admission allows, tag it as executing
    /// and splice it to the back of the queue (so entries that keep failing
    /// drift behind ones that can make progress). Entries refused by
    /// admission get their postpone counters bumped.
    pub fn select_entry_to_process(
        &self,
        merge_control: &dyn MergeControl,
        part_store: &dyn PartStore,
    ) -> Option<(Arc<LogEntry>, CurrentlyExecuting)> {
        let mut state = self.shared.state.lock();

        let mut selected = None;
        for index in 0..state.queue.len() {
            let entry = state.queue[index].clone();
            if entry.is_executing() {
                continue;
            }
            match should_execute_log_entry(
                &state,
                &entry,
                merge_control,
                part_store,
                &self.shared.options,
            ) {
                Ok(()) => {
                    state.queue.remove(index);
                    state.queue.push_back(entry.clone());
                    selected = Some(entry);
                    break;
                }
                Err(reason) => {
                    queue_log!(
                        Level::Debug,
                        "postponed_entry",
                        "znode={} reason={reason}",
                        entry.znode_name
                    );
                    entry.record_postpone(reason.to_string());
                }
            }
        }

        let entry = selected?;
        let guard = CurrentlyExecuting::new(entry.clone(), self.shared.clone(), &mut state);
        Some((entry, guard))
    }

    /// Run `func` on a selected entry; retire the entry when it reports
    /// completion. A failure is recorded on the entry and leaves it queued
    /// for another attempt.
    pub async fn process_entry<F>(
        &self,
        get_coordinator: impl Fn() -> Arc<dyn Coordinator>,
        entry: &Arc<LogEntry>,
        func: F,
    ) -> bool
    where
        F: FnOnce(&Arc<LogEntry>) -> Result<bool, Box<dyn std::error::Error + Send + Sync>>,
    {
        match func(entry) {
            Ok(true) => {
                self.remove(get_coordinator().as_ref(), entry).await;
                true
            }
            Ok(false) => true,
            Err(error) => {
                queue_log!(
                    Level::Warn,
                    "entry_execution_failed",
                    "znode={} err={error}",
                    entry.znode_name
                );
                entry.record_exception(error.to_string());
                false
            }
        }
    }

    /// Whether the merge planner may merge two adjacent parts right now.
    ///
    /// Symmetric in its arguments.
    pub fn can_merge_parts(&self, left: &PartInfo, right: &PartInfo) -> Result<(), MergeBlocked> {
        // The first two cases would be planner bugs, but the answer is still
        // well defined.
        if left.name() == right.name() {
            return Err(MergeBlocked::SamePart(left.name()));
        }
        if left.partition_id != right.partition_id {
            return Err(MergeBlocked::DifferentPartitions(left.name(), right.name()));
        }

        let state = self.shared.state.lock();

        for part in [left, right] {
            match state.virtual_parts.get_containing_part(part) {
                None => return Err(MergeBlocked::NotInReplicationLog(part.name())),
                Some(containing) if containing != part => {
                    return Err(MergeBlocked::MergeAlreadyAssigned(part.name()));
                }
                Some(_) => {}
            }
            if part.name() == state.last_quorum_part {
                return Err(MergeBlocked::LastQuorumPart(part.name()));
            }
            if part.name() == state.inprogress_quorum_part {
                return Err(MergeBlocked::QuorumInsertInProgress(part.name()));
            }
        }

        let mut left_max = left.max_block;
        let mut right_min = right.min_block;
        if left_max > right_min {
            std::mem::swap(&mut left_max, &mut right_min);
        }

        if left_max + 1 < right_min {
            // The gap between the parts must hold neither an insert that is
            // still being written nor a part this replica has yet to get.
            if let Some(ephemeral) = state.current_inserts.get(&left.partition_id) {
                if let Some(&block) = ephemeral
                    .range((Bound::Excluded(left_max), Bound::Unbounded))
                    .next()
                {
                    if block < right_min {
                        return Err(MergeBlocked::EphemeralInsertInGap {
                            block,
                            left: left.name(),
                            right: right.name(),
                        });
                    }
                }
            }

            let gap = PartInfo {
                partition_id: left.partition_id.clone(),
                min_block: left_max + 1,
                max_block: right_min - 1,
                level: u32::MAX,
                mutation: 0,
            };
            let covered = state.next_virtual_parts.parts_covered_by(&gap);
            if let (Some(first), Some(last)) = (covered.first(), covered.last()) {
                return Err(MergeBlocked::UnreadyPartsInGap {
                    count: covered.len(),
                    first: first.clone(),
                    last: last.clone(),
                    left: left.name(),
                    right: right.name(),
                });
            }
        }

        let left_version = state.current_mutation_version(left);
        let right_version = state.current_mutation_version(right);
        if left_version != right_version {
            return Err(MergeBlocked::MutationVersionsDiffer {
                left: left.name(),
                right: right.name(),
                left_version,
                right_version,
            });
        }

        Ok(())
    }

    /// Whether a mutation is waiting for this part: the part must be its own
    /// containing virtual part (no covering merge assigned) and a mutation
    /// version above its data version must exist. Returns the version to
    /// mutate to.
    pub fn can_mutate_part(&self, part_info: &PartInfo) -> Option<i64> {
        let state = self.shared.state.lock();
        let in_partition = state.mutations_by_partition.get(&part_info.partition_id)?;
        if state.virtual_parts.get_containing_part(part_info) != Some(part_info) {
            return None;
        }
        let current_version = state.current_mutation_version(part_info);
        let desired_version = *in_partition.last_key_value()?.0;
        (current_version < desired_version).then_some(desired_version)
    }

    /// Commands of every mutation with a version in
    /// `(data_version(part), desired_version]`, concatenated in version
    /// order.
    pub fn get_mutation_commands(
        &self,
        part_info: &PartInfo,
        desired_version: i64,
    ) -> Result<Vec<String>, QueueError> {
        let state = self.shared.state.lock();
        let in_partition = state
            .mutations_by_partition
            .get(&part_info.partition_id)
            .ok_or_else(|| {
                QueueError::Logical(format!(
                    "there are no mutations for partition {} (trying to mutate part to version {desired_version})",
                    part_info.partition_id
                ))
            })?;
        if !in_partition.contains_key(&desired_version) {
            return Err(QueueError::Logical(format!(
                "mutation with version {desired_version} not found in partition {}",
                part_info.partition_id
            )));
        }
        let data_version = part_info.data_version();
        if desired_version <= data_version {
            return Err(QueueError::Logical(format!(
                "part {} already carries data version {data_version}, nothing to mutate up to {desired_version}",
                part_info.name()
            )));
        }
        Ok(in_partition
            .range((Bound::Excluded(data_version), Bound::Included(desired_version)))
            .flat_map(|(_, mutation)| mutation.commands.iter().cloned())
            .collect())
    }

    /// Aggregate counters for status reporting.
    pub fn status(&self) -> QueueStatus {
        let state = self.shared.state.lock();

        let mut status = QueueStatus {
            future_parts: state.future_parts.len(),
            queue_size: state.queue.len(),
            last_queue_update: state.last_queue_update,
            ..QueueStatus::default()
        };

        for entry in &state.queue {
            let time = entry.create_time;
            if time != 0 && (status.queue_oldest_time == 0 || time < status.queue_oldest_time) {
                status.queue_oldest_time = time;
            }
            match entry.kind() {
                EntryKind::GetPart => {
                    status.inserts_in_queue += 1;
                    if time != 0
                        && (status.inserts_oldest_time == 0 || time < status.inserts_oldest_time)
                    {
                        status.inserts_oldest_time = time;
                        status.oldest_part_to_get = entry.new_part_name.clone();
                    }
                }
                EntryKind::MergeParts => {
                    status.merges_in_queue += 1;
                    if time != 0
                        && (status.merges_oldest_time == 0 || time < status.merges_oldest_time)
                    {
                        status.merges_oldest_time = time;
                        status.oldest_part_to_merge_to = entry.new_part_name.clone();
                    }
                }
                EntryKind::MutatePart => {
                    status.part_mutations_in_queue += 1;
                    if time != 0
                        && (status.part_mutations_oldest_time == 0
                            || time < status.part_mutations_oldest_time)
                    {
                        status.part_mutations_oldest_time = time;
                        status.oldest_part_to_mutate_to = entry.new_part_name.clone();
                    }
                }
                _ => {}
            }
        }

        status
    }

    /// Point-in-time copies of every queued entry, in queue order.
    pub fn entries(&self) -> Vec<EntrySnapshot> {
        let state = self.shared.state.lock();
        state
            .queue
            .iter()
            .map(|entry| EntrySnapshot::capture(entry))
            .collect()
    }

    /// Queued merges plus queued part mutations; the planner compares this
    /// against its concurrency budget.
    pub fn count_merges_and_part_mutations(&self) -> usize {
        let state = self.shared.state.lock();
        state
            .queue
            .iter()
            .filter(|entry| {
                matches!(entry.kind(), EntryKind::MergeParts | EntryKind::MutatePart)
            })
            .count()
    }

    /// Current insert-time watermarks.
    pub fn insert_times(&self) -> InsertTimes {
        let state = self.shared.state.lock();
        InsertTimes {
            min_unprocessed_insert_time: state.min_unprocessed_insert_time,
            max_processed_insert_time: state.max_processed_insert_time,
        }
    }

    #[cfg(test)]
    pub(crate) fn lock_state_for_test(&self) -> parking_lot::MutexGuard<'_, QueueState> {
        self.shared.state.lock()
    }
}

/// Fails when `part_name` is itself in flight or covered by an in-flight
/// part.
fn is_not_covered_by_future_parts(
    state: &QueueState,
    part_name: &str,
    part: &PartInfo,
) -> Result<(), PostponeReason> {
    // Cheap exact check first; it also gives the more precise reason.
    if state.future_parts.contains_key(part_name) {
        return Err(PostponeReason::AnotherEntryForSamePart {
            part: part_name.to_owned(),
        });
    }
    // `future_parts` stays small (bounded by the worker pool), so a scan is
    // fine.
    for (future_name, future_part) in &state.future_parts {
        if future_part.contains(part) {
            return Err(PostponeReason::CoveredByFuturePart {
                part: part_name.to_owned(),
                covering: future_name.clone(),
            });
        }
    }
    Ok(())
}

/// The admission predicate: may this entry run right now? Assumes the state
/// mutex is held.
fn should_execute_log_entry(
    state: &QueueState,
    entry: &LogEntry,
    merge_control: &dyn MergeControl,
    part_store: &dyn PartStore,
    options: &QueueOptions,
) -> Result<(), PostponeReason> {
    if matches!(
        entry.kind(),
        EntryKind::MergeParts | EntryKind::GetPart | EntryKind::AttachPart | EntryKind::MutatePart
    ) {
        is_not_covered_by_future_parts(state, &entry.new_part_name, entry.part_info())?;
    }

    if matches!(entry.kind(), EntryKind::MergeParts | EntryKind::MutatePart) {
        // If a source part is being fetched or produced right now, wait for
        // it. A source part that is merely absent is no obstacle: execution
        // falls back to fetching the result part instead.
        let mut sum_parts_bytes = 0u64;
        for source in entry.source_parts() {
            if state.future_parts.contains_key(source) {
                return Err(PostponeReason::SourcePartNotReady {
                    new_part: entry.new_part_name.clone(),
                    source_part: source.clone(),
                });
            }
            if let Some(bytes) = part_store.part_bytes_on_disk(source, &MERGEABLE_STATES) {
                sum_parts_bytes += bytes;
            }
        }

        if merge_control.merges_cancelled() {
            return Err(PostponeReason::MergesCancelled {
                new_part: entry.new_part_name.clone(),
            });
        }

        // When the executor pool is saturated its ceiling shrinks below the
        // configured maximum; let small merges through and hold the big ones
        // until capacity frees up. At the full ceiling anything goes (the
        // merge may have been ordered explicitly with different settings).
        let max_parts_size = merge_control.max_parts_size_for_merge();
        if max_parts_size != options.max_bytes_to_merge_at_max_space_in_pool
            && sum_parts_bytes > max_parts_size
        {
            return Err(PostponeReason::MergeIsLargerThanCurrentMax {
                new_part: entry.new_part_name.clone(),
                sum_bytes: sum_parts_bytes,
                max_bytes: max_parts_size,
            });
        }
    }

    if entry.kind() == EntryKind::ClearColumn {
        let (conflicts, description) = ReplicationQueue::conflicts_for_clear_column(state, entry);
        if !conflicts.is_empty() {
            return Err(PostponeReason::ClearColumnConflicts { description });
        }
    }

    Ok(())
}

fn parse_log_child(name: &str, dir: &str) -> Result<u64, QueueError> {
    name.strip_prefix("log-")
        .and_then(|digits| digits.parse::<u64>().ok())
        .ok_or_else(|| QueueError::UnexpectedNode {
            name: name.to_owned(),
            dir: dir.to_owned(),
        })
}

/// Run the RAM reconciliation that must follow a successful coordinator
/// commit. If it fails, RAM and coordinator have diverged and every later
/// commit would compound the damage, so the process dies.
fn abort_on_state_divergence<T>(context: &str, reconcile: impl FnOnce() -> T) -> T {
    match panic::catch_unwind(AssertUnwindSafe(reconcile)) {
        Ok(value) => value,
        Err(_) => {
            queue_log!(
                Level::Error,
                "state_divergence",
                "aborting while {context}: RAM no longer matches the coordinator"
            );
            process::abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::atomic::{AtomicBool, AtomicU64, Ordering},
        time::Duration,
    };

    use tokio::sync::Notify;

    use super::*;
    use crate::{
        coordinator::{memory::InMemoryCoordinator, pad_index},
        entry::EntryAction,
    };

    const ROOT: &str = "/tables/t1";
    const REPLICA: &str = "/tables/t1/replicas/r1";

    struct TestMergeControl {
        cancelled: AtomicBool,
        max_parts_size: AtomicU64,
    }

    impl TestMergeControl {
        fn admit_all() -> Self {
            TestMergeControl {
                cancelled: AtomicBool::new(false),
                max_parts_size: AtomicU64::new(
                    QueueOptions::default().max_bytes_to_merge_at_max_space_in_pool,
                ),
            }
        }
    }

    impl MergeControl for TestMergeControl {
        fn merges_cancelled(&self) -> bool {
            self.cancelled.load(Ordering::Relaxed)
        }

        fn max_parts_size_for_merge(&self) -> u64 {
            self.max_parts_size.load(Ordering::Relaxed)
        }
    }

    struct TestPartStore(HashMap<String, u64>);

    impl TestPartStore {
        fn empty() -> Self {
            TestPartStore(HashMap::new())
        }
    }

    impl PartStore for TestPartStore {
        fn part_bytes_on_disk(&self, part_name: &str, _states: &[PartState]) -> Option<u64> {
            self.0.get(part_name).copied()
        }
    }

    async fn setup() -> (Arc<InMemoryCoordinator>, ReplicationQueue) {
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let paths = QueuePaths::new(ROOT, REPLICA);
        for path in [
            paths.log_pointer(),
            paths.min_unprocessed_insert_time(),
            paths.max_processed_insert_time(),
        ] {
            coordinator.create(&path, Vec::new(), false).await.unwrap();
        }
        let queue = ReplicationQueue::new(paths, QueueOptions::default());
        (coordinator, queue)
    }

    fn info(name: &str) -> PartInfo {
        PartInfo::parse(name).unwrap()
    }

    fn get_part(part: &str, create_time: i64) -> LogEntry {
        LogEntry::new(EntryAction::GetPart, part, "r2", create_time).unwrap()
    }

    fn merge(sources: &[&str], new_part: &str) -> LogEntry {
        LogEntry::new(
            EntryAction::MergeParts {
                parts: sources.iter().map(|source| source.to_string()).collect(),
            },
            new_part,
            "r2",
            0,
        )
        .unwrap()
    }

    fn clear_column(column: &str, range: &str) -> LogEntry {
        LogEntry::new(
            EntryAction::ClearColumn {
                column: column.to_owned(),
            },
            range,
            "r2",
            0,
        )
        .unwrap()
    }

    async fn push_log(
        coordinator: &InMemoryCoordinator,
        queue: &ReplicationQueue,
        index: u64,
        entry: &LogEntry,
    ) {
        coordinator
            .create(
                &queue.paths().log_entry(&QueuePaths::log_child(index)),
                entry.to_bytes(),
                false,
            )
            .await
            .unwrap();
    }

    async fn push_mutation(
        coordinator: &InMemoryCoordinator,
        queue: &ReplicationQueue,
        znode: &str,
        blocks: &[(&str, i64)],
        commands: &[&str],
    ) {
        let mutation = MutationEntry {
            znode_name: String::new(),
            create_time: 0,
            block_numbers: blocks
                .iter()
                .map(|(partition, block)| (partition.to_string(), *block))
                .collect(),
            commands: commands.iter().map(|command| command.to_string()).collect(),
        };
        coordinator
            .create(&queue.paths().mutation_entry(znode), mutation.to_bytes(), false)
            .await
            .unwrap();
    }

    async fn pointer_value(coordinator: &InMemoryCoordinator, queue: &ReplicationQueue) -> String {
        String::from_utf8(coordinator.get(&queue.paths().log_pointer()).await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn pull_into_empty_replica() {
        let (coordinator, queue) = setup().await;
        push_log(&coordinator, &queue, 0, &get_part("all_1_1_0", 100)).await;

        assert!(queue
            .pull_logs_to_queue(coordinator.as_ref(), None)
            .await
            .unwrap());

        assert_eq!(pointer_value(&coordinator, &queue).await, "1");
        let snapshots = queue.entries();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].kind, EntryKind::GetPart);
        assert_eq!(snapshots[0].new_part_name, "all_1_1_0");
        assert_eq!(snapshots[0].znode_name, format!("queue-{}", pad_index(0)));

        let state = queue.lock_state_for_test();
        assert_eq!(
            state.virtual_parts.iter().map(PartInfo::name).collect::<Vec<_>>(),
            ["all_1_1_0"]
        );
        drop(state);

        // The queue znode body matches the shared-log body.
        let queue_children = coordinator
            .get_children(&queue.paths().queue_dir(), None)
            .await
            .unwrap();
        assert_eq!(queue_children, [format!("queue-{}", pad_index(0))]);
    }

    #[tokio::test]
    async fn pull_without_new_entries_keeps_pointer() {
        let (coordinator, queue) = setup().await;
        push_log(&coordinator, &queue, 0, &get_part("all_1_1_0", 0)).await;

        assert!(queue
            .pull_logs_to_queue(coordinator.as_ref(), None)
            .await
            .unwrap());
        assert!(!queue
            .pull_logs_to_queue(coordinator.as_ref(), None)
            .await
            .unwrap());
        assert_eq!(pointer_value(&coordinator, &queue).await, "1");
        assert_eq!(queue.entries().len(), 1);
    }

    #[tokio::test]
    async fn pull_rejects_unexpected_log_children() {
        let (coordinator, queue) = setup().await;
        coordinator
            .create(&format!("{ROOT}/log/garbage"), Vec::new(), false)
            .await
            .unwrap();

        let error = queue
            .pull_logs_to_queue(coordinator.as_ref(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            QueueError::UnexpectedNode { name, .. } if name == "garbage"
        ));
    }

    #[tokio::test]
    async fn pull_sets_watch_on_log_children() {
        let (coordinator, queue) = setup().await;
        let watch: Watch = Arc::new(Notify::new());
        queue
            .pull_logs_to_queue(coordinator.as_ref(), Some(watch.clone()))
            .await
            .unwrap();

        let notified = watch.notified();
        push_log(&coordinator, &queue, 0, &get_part("all_1_1_0", 0)).await;
        tokio::time::timeout(Duration::from_secs(1), notified)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn load_is_idempotent() {
        let (coordinator, queue) = setup().await;
        push_log(&coordinator, &queue, 0, &get_part("all_1_1_0", 10)).await;
        queue
            .pull_logs_to_queue(coordinator.as_ref(), None)
            .await
            .unwrap();

        assert!(!queue.load(coordinator.as_ref()).await.unwrap());
        assert_eq!(queue.entries().len(), 1);

        // A fresh queue instance loads the persisted entry once.
        let restarted =
            ReplicationQueue::new(QueuePaths::new(ROOT, REPLICA), QueueOptions::default());
        assert!(restarted
            .initialize(coordinator.as_ref(), std::iter::empty::<PartInfo>())
            .await
            .unwrap());
        assert!(!restarted.load(coordinator.as_ref()).await.unwrap());
        assert_eq!(restarted.entries().len(), 1);
    }

    #[tokio::test]
    async fn merge_admission_refuses_already_assigned_parts() {
        let (coordinator, queue) = setup().await;
        push_log(&coordinator, &queue, 0, &get_part("all_1_1_0", 0)).await;
        push_log(&coordinator, &queue, 1, &get_part("all_2_2_0", 0)).await;
        push_log(
            &coordinator,
            &queue,
            2,
            &merge(&["all_1_1_0", "all_2_2_0"], "all_1_2_1"),
        )
        .await;
        queue
            .pull_logs_to_queue(coordinator.as_ref(), None)
            .await
            .unwrap();

        let blocked = queue
            .can_merge_parts(&info("all_1_1_0"), &info("all_2_2_0"))
            .unwrap_err();
        assert_eq!(
            blocked,
            MergeBlocked::MergeAlreadyAssigned("all_1_1_0".to_owned())
        );
        assert!(blocked
            .to_string()
            .contains("a merge has already been assigned"));
    }

    #[tokio::test]
    async fn merge_admission_allows_adjacent_parts_symmetrically() {
        let (coordinator, queue) = setup().await;
        push_log(&coordinator, &queue, 0, &get_part("all_1_1_0", 0)).await;
        push_log(&coordinator, &queue, 1, &get_part("all_2_2_0", 0)).await;
        queue
            .pull_logs_to_queue(coordinator.as_ref(), None)
            .await
            .unwrap();

        queue
            .can_merge_parts(&info("all_1_1_0"), &info("all_2_2_0"))
            .unwrap();
        queue
            .can_merge_parts(&info("all_2_2_0"), &info("all_1_1_0"))
            .unwrap();

        assert_eq!(
            queue
                .can_merge_parts(&info("all_1_1_0"), &info("all_1_1_0"))
                .unwrap_err(),
            MergeBlocked::SamePart("all_1_1_0".to_owned())
        );
    }

    #[tokio::test]
    async fn merge_admission_sees_ephemeral_inserts_in_gap() {
        let (coordinator, queue) = setup().await;
        push_log(&coordinator, &queue, 0, &get_part("all_1_1_0", 0)).await;
        push_log(&coordinator, &queue, 1, &get_part("all_5_5_0", 0)).await;

        // An insert holds block 3 between the two parts.
        let lock_path = format!("{ROOT}/temp/abandonable_lock-0000000007");
        coordinator
            .create(&lock_path, Vec::new(), false)
            .await
            .unwrap();
        coordinator
            .create(
                &format!("{ROOT}/block_numbers/all/block-3"),
                lock_path.clone().into_bytes(),
                false,
            )
            .await
            .unwrap();

        queue
            .pull_logs_to_queue(coordinator.as_ref(), None)
            .await
            .unwrap();

        let expected = MergeBlocked::EphemeralInsertInGap {
            block: 3,
            left: "all_1_1_0".to_owned(),
            right: "all_5_5_0".to_owned(),
        };
        assert_eq!(
            queue
                .can_merge_parts(&info("all_1_1_0"), &info("all_5_5_0"))
                .unwrap_err(),
            expected
        );
        // Operand order does not matter for the verdict.
        assert!(matches!(
            queue
                .can_merge_parts(&info("all_5_5_0"), &info("all_1_1_0"))
                .unwrap_err(),
            MergeBlocked::EphemeralInsertInGap { block: 3, .. }
        ));

        // Abandoning the lock frees the gap on the next pull.
        coordinator.remove(&lock_path).await.unwrap();
        queue
            .pull_logs_to_queue(coordinator.as_ref(), None)
            .await
            .unwrap();
        queue
            .can_merge_parts(&info("all_1_1_0"), &info("all_5_5_0"))
            .unwrap();
    }

    #[tokio::test]
    async fn merge_admission_sees_unready_parts_in_gap() {
        let (coordinator, queue) = setup().await;
        push_log(&coordinator, &queue, 0, &get_part("all_1_1_0", 0)).await;
        push_log(&coordinator, &queue, 1, &get_part("all_3_3_0", 0)).await;
        push_log(&coordinator, &queue, 2, &get_part("all_5_5_0", 0)).await;
        queue
            .pull_logs_to_queue(coordinator.as_ref(), None)
            .await
            .unwrap();

        let blocked = queue
            .can_merge_parts(&info("all_1_1_0"), &info("all_5_5_0"))
            .unwrap_err();
        assert_eq!(
            blocked,
            MergeBlocked::UnreadyPartsInGap {
                count: 1,
                first: "all_3_3_0".to_owned(),
                last: "all_3_3_0".to_owned(),
                left: "all_1_1_0".to_owned(),
                right: "all_5_5_0".to_owned(),
            }
        );
    }

    #[tokio::test]
    async fn merge_admission_respects_quorum_parts() {
        let (coordinator, queue) = setup().await;
        push_log(&coordinator, &queue, 0, &get_part("all_1_1_0", 0)).await;
        push_log(&coordinator, &queue, 1, &get_part("all_2_2_0", 0)).await;
        coordinator
            .create(
                &queue.paths().quorum_last_part(),
                b"all_1_1_0".to_vec(),
                false,
            )
            .await
            .unwrap();
        coordinator
            .create(
                &queue.paths().quorum_status(),
                br#"{"part_name":"all_2_2_0","replicas":["r2"]}"#.to_vec(),
                false,
            )
            .await
            .unwrap();
        queue
            .pull_logs_to_queue(coordinator.as_ref(), None)
            .await
            .unwrap();

        assert_eq!(
            queue
                .can_merge_parts(&info("all_1_1_0"), &info("all_2_2_0"))
                .unwrap_err(),
            MergeBlocked::LastQuorumPart("all_1_1_0".to_owned())
        );
        assert_eq!(
            queue
                .can_merge_parts(&info("all_2_2_0"), &info("all_1_1_0"))
                .unwrap_err(),
            MergeBlocked::QuorumInsertInProgress("all_2_2_0".to_owned())
        );
    }

    #[tokio::test]
    async fn merge_admission_requires_equal_mutation_versions() {
        let (coordinator, queue) = setup().await;
        push_log(&coordinator, &queue, 0, &get_part("all_1_1_0", 0)).await;
        push_log(&coordinator, &queue, 1, &get_part("all_2_2_0", 0)).await;
        push_mutation(
            &coordinator,
            &queue,
            "0000000001",
            &[("all", 2)],
            &["DELETE WHERE value = 0"],
        )
        .await;
        queue
            .pull_logs_to_queue(coordinator.as_ref(), None)
            .await
            .unwrap();

        // all_1_1_0 predates mutation 2, all_2_2_0 is at it.
        assert_eq!(
            queue
                .can_merge_parts(&info("all_1_1_0"), &info("all_2_2_0"))
                .unwrap_err(),
            MergeBlocked::MutationVersionsDiffer {
                left: "all_1_1_0".to_owned(),
                right: "all_2_2_0".to_owned(),
                left_version: -1,
                right_version: 2,
            }
        );
    }

    #[tokio::test]
    async fn clear_column_is_postponed_while_conflicting_merge_executes() {
        let (coordinator, queue) = setup().await;
        push_log(
            &coordinator,
            &queue,
            0,
            &merge(&["all_3_3_0", "all_4_4_0"], "all_3_4_1"),
        )
        .await;
        push_log(&coordinator, &queue, 1, &clear_column("value", "all_0_9_2")).await;
        queue
            .pull_logs_to_queue(coordinator.as_ref(), None)
            .await
            .unwrap();

        let control = TestMergeControl::admit_all();
        let store = TestPartStore::empty();
        let (merge_entry, merge_guard) = queue
            .select_entry_to_process(&control, &store)
            .expect("the merge is admissible");
        assert_eq!(merge_entry.new_part_name, "all_3_4_1");

        // While the merge runs, the clear must wait and say why.
        assert!(queue.select_entry_to_process(&control, &store).is_none());
        let clear_snapshot = queue
            .entries()
            .into_iter()
            .find(|snapshot| snapshot.kind == EntryKind::ClearColumn)
            .unwrap();
        assert_eq!(clear_snapshot.execution.num_postponed, 1);
        assert!(clear_snapshot
            .execution
            .postpone_reason
            .contains("MERGE_PARTS all_3_4_1"));

        // And a range disable sees the same conflict.
        let state_entry = {
            let state = queue.lock_state_for_test();
            state
                .queue
                .iter()
                .find(|entry| entry.kind() == EntryKind::ClearColumn)
                .cloned()
                .unwrap()
        };
        assert!(matches!(
            queue.disable_merges_and_fetches_in_range(&state_entry),
            Err(QueueError::Unfinished(_))
        ));

        // Once the merge finishes, the clear is admissible.
        drop(merge_guard);
        let (clear_entry, _clear_guard) = queue
            .select_entry_to_process(&control, &store)
            .expect("the clear runs after the merge");
        assert_eq!(clear_entry.kind(), EntryKind::ClearColumn);
    }

    #[tokio::test]
    async fn remove_range_ops_waits_for_executing_entries() {
        let (coordinator, queue) = setup().await;
        push_log(&coordinator, &queue, 0, &get_part("all_5_5_0", 0)).await;
        queue
            .pull_logs_to_queue(coordinator.as_ref(), None)
            .await
            .unwrap();

        let control = TestMergeControl::admit_all();
        let store = TestPartStore::empty();
        let (_entry, guard) = queue.select_entry_to_process(&control, &store).unwrap();

        let waiter_queue = queue.clone();
        let waiter_coordinator = coordinator.clone();
        let waiter = tokio::spawn(async move {
            waiter_queue
                .remove_part_producing_ops_in_range(waiter_coordinator.as_ref(), "all_0_10_3")
                .await
                .unwrap();
        });

        // The entry is executing, so the removal blocks on it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        assert!(queue.entries().is_empty());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();

        assert!(coordinator
            .get_children(&queue.paths().queue_dir(), None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn drop_range_jumps_to_the_front() {
        let (coordinator, queue) = setup().await;
        push_log(&coordinator, &queue, 0, &get_part("all_1_1_0", 0)).await;
        push_log(
            &coordinator,
            &queue,
            1,
            &LogEntry::new(EntryAction::DropRange, "all_0_10_999999999", "r2", 0).unwrap(),
        )
        .await;
        queue
            .pull_logs_to_queue(coordinator.as_ref(), None)
            .await
            .unwrap();

        let snapshots = queue.entries();
        assert_eq!(snapshots[0].kind, EntryKind::DropRange);
        assert_eq!(snapshots[1].kind, EntryKind::GetPart);
        // Front position despite the later znode name.
        assert!(snapshots[0].znode_name > snapshots[1].znode_name);
    }

    #[tokio::test]
    async fn mutation_flow_reports_desired_version_and_commands() {
        let (coordinator, queue) = setup().await;
        push_log(&coordinator, &queue, 0, &get_part("partA_3_3_0", 0)).await;
        push_mutation(
            &coordinator,
            &queue,
            "0000000001",
            &[("partA", 2)],
            &["UPDATE value = 1 WHERE 1"],
        )
        .await;
        push_mutation(
            &coordinator,
            &queue,
            "0000000002",
            &[("partA", 7), ("partB", 9)],
            &["DELETE WHERE value = 0"],
        )
        .await;
        queue
            .pull_logs_to_queue(coordinator.as_ref(), None)
            .await
            .unwrap();

        let part = info("partA_3_3_0");
        assert_eq!(queue.can_mutate_part(&part), Some(7));
        assert_eq!(
            queue.get_mutation_commands(&part, 7).unwrap(),
            ["DELETE WHERE value = 0"]
        );

        // Version 4 does not exist.
        assert!(matches!(
            queue.get_mutation_commands(&part, 4),
            Err(QueueError::Logical(_))
        ));

        // A part already at version 7 has nothing to do.
        assert_eq!(queue.can_mutate_part(&info("partA_3_3_0_7")), None);

        // An unknown partition has no mutations.
        assert_eq!(queue.can_mutate_part(&info("partC_1_1_0")), None);
    }

    #[tokio::test]
    async fn mutation_version_is_monotonic_under_refresh() {
        let (coordinator, queue) = setup().await;
        push_log(&coordinator, &queue, 0, &get_part("partA_3_3_0", 0)).await;
        push_mutation(&coordinator, &queue, "0000000001", &[("partA", 2)], &["A"]).await;
        queue
            .pull_logs_to_queue(coordinator.as_ref(), None)
            .await
            .unwrap();

        let part = info("partA_3_3_0");
        let before = queue.lock_state_for_test().current_mutation_version(&part);
        assert_eq!(before, 2);

        push_mutation(&coordinator, &queue, "0000000002", &[("partA", 3)], &["B"]).await;
        assert!(queue
            .update_mutations(coordinator.as_ref(), None)
            .await
            .unwrap());
        let after = queue.lock_state_for_test().current_mutation_version(&part);
        assert_eq!(after, 3);
    }

    #[tokio::test]
    async fn obsolete_mutations_are_purged_on_refresh() {
        let (coordinator, queue) = setup().await;
        push_mutation(&coordinator, &queue, "0000000001", &[("partA", 2)], &["A"]).await;
        push_mutation(&coordinator, &queue, "0000000002", &[("partA", 7)], &["B"]).await;
        queue
            .update_mutations(coordinator.as_ref(), None)
            .await
            .unwrap();

        // The coordinator garbage-collects the first mutation.
        coordinator
            .remove(&queue.paths().mutation_entry("0000000001"))
            .await
            .unwrap();
        assert!(!queue
            .update_mutations(coordinator.as_ref(), None)
            .await
            .unwrap());

        let state = queue.lock_state_for_test();
        assert_eq!(state.mutations.len(), 1);
        assert_eq!(state.mutations[0].znode_name, "0000000002");
        assert_eq!(
            state.current_mutation_version(&info("partA_3_3_0")),
            -1,
            "version 2 is gone"
        );
    }

    #[tokio::test]
    async fn selection_splices_picked_entry_to_the_back() {
        let (coordinator, queue) = setup().await;
        push_log(&coordinator, &queue, 0, &get_part("all_1_1_0", 0)).await;
        push_log(&coordinator, &queue, 1, &get_part("all_2_2_0", 0)).await;
        queue
            .pull_logs_to_queue(coordinator.as_ref(), None)
            .await
            .unwrap();

        let control = TestMergeControl::admit_all();
        let store = TestPartStore::empty();
        let (entry, guard) = queue.select_entry_to_process(&control, &store).unwrap();
        assert_eq!(entry.new_part_name, "all_1_1_0");
        assert_eq!(entry.execution_state().num_tries, 1);

        let order: Vec<String> = queue
            .entries()
            .into_iter()
            .map(|snapshot| snapshot.new_part_name)
            .collect();
        assert_eq!(order, ["all_2_2_0", "all_1_1_0"]);

        // The invariant: executing entries are tagged in future_parts.
        {
            let state = queue.lock_state_for_test();
            assert!(state.future_parts.contains_key("all_1_1_0"));
        }
        drop(guard);
        let state = queue.lock_state_for_test();
        assert!(state.future_parts.is_empty());
    }

    #[tokio::test]
    async fn covered_entries_are_postponed_with_reasons() {
        let (coordinator, queue) = setup().await;
        push_log(
            &coordinator,
            &queue,
            0,
            &merge(&["all_1_1_0", "all_2_2_0"], "all_1_2_1"),
        )
        .await;
        push_log(&coordinator, &queue, 1, &get_part("all_1_1_0", 0)).await;
        queue
            .pull_logs_to_queue(coordinator.as_ref(), None)
            .await
            .unwrap();

        let control = TestMergeControl::admit_all();
        let store = TestPartStore::empty();
        let (_merge_entry, _guard) = queue.select_entry_to_process(&control, &store).unwrap();

        // The fetch of a part covered by the executing merge must wait.
        assert!(queue.select_entry_to_process(&control, &store).is_none());
        let snapshot = queue
            .entries()
            .into_iter()
            .find(|snapshot| snapshot.kind == EntryKind::GetPart)
            .unwrap();
        assert_eq!(snapshot.execution.num_postponed, 1);
        assert!(snapshot
            .execution
            .postpone_reason
            .contains("covered by part all_1_2_1"));
        assert!(snapshot.execution.last_postpone_time > 0);
    }

    #[tokio::test]
    async fn merges_are_postponed_while_cancelled_or_oversized() {
        let (coordinator, queue) = setup().await;
        push_log(&coordinator, &queue, 0, &get_part("all_1_1_0", 0)).await;
        push_log(&coordinator, &queue, 1, &get_part("all_2_2_0", 0)).await;
        push_log(
            &coordinator,
            &queue,
            2,
            &merge(&["all_1_1_0", "all_2_2_0"], "all_1_2_1"),
        )
        .await;
        queue
            .pull_logs_to_queue(coordinator.as_ref(), None)
            .await
            .unwrap();
        // Retire the two fetches so only the merge is left.
        assert!(queue.remove_part(coordinator.as_ref(), "all_1_1_0").await);
        assert!(queue.remove_part(coordinator.as_ref(), "all_2_2_0").await);

        let control = TestMergeControl::admit_all();
        let store = TestPartStore(HashMap::from([
            ("all_1_1_0".to_owned(), 600),
            ("all_2_2_0".to_owned(), 600),
        ]));

        control.cancelled.store(true, Ordering::Relaxed);
        assert!(queue.select_entry_to_process(&control, &store).is_none());
        control.cancelled.store(false, Ordering::Relaxed);

        // A shrunken ceiling refuses the 1200-byte merge...
        control.max_parts_size.store(1000, Ordering::Relaxed);
        assert!(queue.select_entry_to_process(&control, &store).is_none());
        let snapshot = &queue.entries()[0];
        assert!(snapshot
            .execution
            .postpone_reason
            .contains("greater than the current maximum"));

        // ...but the configured pool maximum admits anything.
        control.max_parts_size.store(
            QueueOptions::default().max_bytes_to_merge_at_max_space_in_pool,
            Ordering::Relaxed,
        );
        assert!(queue.select_entry_to_process(&control, &store).is_some());
    }

    #[tokio::test]
    async fn merges_wait_for_sources_still_in_flight() {
        let (coordinator, queue) = setup().await;
        push_log(&coordinator, &queue, 0, &get_part("all_1_1_0", 0)).await;
        push_log(
            &coordinator,
            &queue,
            1,
            &merge(&["all_1_1_0", "all_2_2_0"], "all_1_2_1"),
        )
        .await;
        queue
            .pull_logs_to_queue(coordinator.as_ref(), None)
            .await
            .unwrap();

        let control = TestMergeControl::admit_all();
        let store = TestPartStore::empty();
        let (fetch_entry, guard) = queue.select_entry_to_process(&control, &store).unwrap();
        assert_eq!(fetch_entry.new_part_name, "all_1_1_0");

        // The merge's source part is being fetched right now.
        assert!(queue.select_entry_to_process(&control, &store).is_none());
        let snapshot = queue
            .entries()
            .into_iter()
            .find(|snapshot| snapshot.kind == EntryKind::MergeParts)
            .unwrap();
        assert!(snapshot
            .execution
            .postpone_reason
            .contains("part all_1_1_0 is not ready yet"));

        drop(guard);
        // Fetch retired, merge becomes admissible.
        queue.remove(coordinator.as_ref(), &fetch_entry).await;
        let (merge_entry, _guard) = queue.select_entry_to_process(&control, &store).unwrap();
        assert_eq!(merge_entry.new_part_name, "all_1_2_1");
    }

    #[tokio::test]
    async fn process_entry_retires_on_success_and_records_failures() {
        let (coordinator, queue) = setup().await;
        push_log(&coordinator, &queue, 0, &get_part("all_1_1_0", 0)).await;
        queue
            .pull_logs_to_queue(coordinator.as_ref(), None)
            .await
            .unwrap();

        let control = TestMergeControl::admit_all();
        let store = TestPartStore::empty();
        let get_coordinator = {
            let coordinator = coordinator.clone();
            move || coordinator.clone() as Arc<dyn Coordinator>
        };

        let (entry, guard) = queue.select_entry_to_process(&control, &store).unwrap();
        assert!(
            !queue
                .process_entry(get_coordinator.clone(), &entry, |_| Err("disk full".into()))
                .await
        );
        assert_eq!(
            entry.execution_state().last_exception.as_deref(),
            Some("disk full")
        );
        assert_eq!(queue.entries().len(), 1);
        drop(guard);

        let (entry, guard) = queue.select_entry_to_process(&control, &store).unwrap();
        assert_eq!(entry.execution_state().num_tries, 2);
        assert!(
            queue
                .process_entry(get_coordinator, &entry, |_| Ok(true))
                .await
        );
        drop(guard);

        assert!(queue.entries().is_empty());
        assert!(coordinator
            .get_children(&queue.paths().queue_dir(), None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn sibling_parts_are_spliced_behind_their_merge() {
        let (coordinator, queue) = setup().await;
        push_log(&coordinator, &queue, 0, &get_part("all_1_1_0", 0)).await;
        push_log(&coordinator, &queue, 1, &get_part("all_3_3_0", 0)).await;
        push_log(
            &coordinator,
            &queue,
            2,
            &merge(&["all_1_1_0", "all_2_2_0"], "all_1_2_1"),
        )
        .await;
        push_log(&coordinator, &queue, 3, &get_part("all_2_2_0", 0)).await;
        queue
            .pull_logs_to_queue(coordinator.as_ref(), None)
            .await
            .unwrap();

        let siblings = queue.move_sibling_parts_for_merge_to_end_of_queue("all_1_1_0");
        assert_eq!(
            siblings,
            HashSet::from(["all_1_1_0".to_owned(), "all_2_2_0".to_owned()])
        );

        let order: Vec<String> = queue
            .entries()
            .into_iter()
            .map(|snapshot| snapshot.new_part_name)
            .collect();
        assert_eq!(order, ["all_3_3_0", "all_1_2_1", "all_2_2_0", "all_1_1_0"]);

        // A part no queued merge consumes yields an empty sibling set.
        assert!(queue
            .move_sibling_parts_for_merge_to_end_of_queue("all_9_9_0")
            .is_empty());
    }

    #[tokio::test]
    async fn insert_time_watermarks_are_maintained_and_published() {
        let (coordinator, queue) = setup().await;
        push_log(&coordinator, &queue, 0, &get_part("all_1_1_0", 100)).await;
        push_log(&coordinator, &queue, 1, &get_part("all_2_2_0", 50)).await;
        queue
            .pull_logs_to_queue(coordinator.as_ref(), None)
            .await
            .unwrap();

        assert_eq!(
            queue.insert_times(),
            InsertTimes {
                min_unprocessed_insert_time: 50,
                max_processed_insert_time: 0,
            }
        );
        assert_eq!(
            coordinator
                .get(&queue.paths().min_unprocessed_insert_time())
                .await
                .unwrap(),
            b"50"
        );

        assert!(queue.remove_part(coordinator.as_ref(), "all_2_2_0").await);
        assert_eq!(
            queue.insert_times(),
            InsertTimes {
                min_unprocessed_insert_time: 100,
                max_processed_insert_time: 50,
            }
        );
        assert_eq!(
            coordinator
                .get(&queue.paths().min_unprocessed_insert_time())
                .await
                .unwrap(),
            b"100"
        );
        assert_eq!(
            coordinator
                .get(&queue.paths().max_processed_insert_time())
                .await
                .unwrap(),
            b"50"
        );

        assert!(queue.remove_part(coordinator.as_ref(), "all_1_1_0").await);
        assert_eq!(
            queue.insert_times(),
            InsertTimes {
                min_unprocessed_insert_time: 0,
                max_processed_insert_time: 100,
            }
        );
    }

    #[tokio::test]
    async fn status_counts_entries_by_kind() {
        let (coordinator, queue) = setup().await;
        push_log(&coordinator, &queue, 0, &get_part("all_1_1_0", 30)).await;
        push_log(&coordinator, &queue, 1, &get_part("all_2_2_0", 20)).await;
        push_log(
            &coordinator,
            &queue,
            2,
            &merge(&["all_1_1_0", "all_2_2_0"], "all_1_2_1"),
        )
        .await;
        queue
            .pull_logs_to_queue(coordinator.as_ref(), None)
            .await
            .unwrap();

        let status = queue.status();
        assert_eq!(status.queue_size, 3);
        assert_eq!(status.inserts_in_queue, 2);
        assert_eq!(status.merges_in_queue, 1);
        assert_eq!(status.part_mutations_in_queue, 0);
        assert_eq!(status.queue_oldest_time, 20);
        assert_eq!(status.inserts_oldest_time, 20);
        assert_eq!(status.oldest_part_to_get, "all_2_2_0");
        assert!(status.last_queue_update > 0);
        assert_eq!(queue.count_merges_and_part_mutations(), 1);
    }

    #[tokio::test]
    async fn actual_part_names_join_future_parts_until_release() {
        let (coordinator, queue) = setup().await;
        push_log(&coordinator, &queue, 0, &get_part("all_1_1_0", 0)).await;
        queue
            .pull_logs_to_queue(coordinator.as_ref(), None)
            .await
            .unwrap();

        let control = TestMergeControl::admit_all();
        let store = TestPartStore::empty();
        let (entry, guard) = queue.select_entry_to_process(&control, &store).unwrap();

        // Quorum resolution settles on a wider part.
        assert!(queue
            .add_future_part_if_not_covered_by_them(&entry, "all_0_1_1")
            .unwrap());
        {
            let state = queue.lock_state_for_test();
            assert!(state.future_parts.contains_key("all_1_1_0"));
            assert!(state.future_parts.contains_key("all_0_1_1"));
        }

        drop(guard);
        assert!(queue.lock_state_for_test().future_parts.is_empty());
    }

    #[tokio::test]
    async fn covered_actual_part_names_are_rejected() {
        let (coordinator, queue) = setup().await;
        push_log(
            &coordinator,
            &queue,
            0,
            &merge(&["all_1_1_0", "all_2_2_0"], "all_1_2_1"),
        )
        .await;
        push_log(&coordinator, &queue, 1, &get_part("all_1_1_0", 0)).await;
        queue
            .pull_logs_to_queue(coordinator.as_ref(), None)
            .await
            .unwrap();

        let control = TestMergeControl::admit_all();
        let store = TestPartStore::empty();
        let (_merge_entry, _guard) = queue.select_entry_to_process(&control, &store).unwrap();

        let fetch_entry = {
            let state = queue.lock_state_for_test();
            state
                .queue
                .iter()
                .find(|entry| entry.kind() == EntryKind::GetPart)
                .cloned()
                .unwrap()
        };
        assert!(!queue
            .add_future_part_if_not_covered_by_them(&fetch_entry, "all_1_1_0")
            .unwrap());
        assert!(fetch_entry.execution_state().actual_new_part_name.is_none());
    }

    #[tokio::test]
    async fn self_originated_entries_are_inserted_with_times() {
        let (coordinator, queue) = setup().await;
        let mut entry = get_part("all_1_1_0", 77);
        let created = coordinator
            .create(
                &queue.paths().queue_create_prefix(),
                entry.to_bytes(),
                true,
            )
            .await
            .unwrap();
        entry.znode_name = created.rsplit('/').next().unwrap().to_owned();

        queue.insert(coordinator.as_ref(), Arc::new(entry)).await;

        assert_eq!(queue.entries().len(), 1);
        assert_eq!(queue.insert_times().min_unprocessed_insert_time, 77);
        assert_eq!(
            coordinator
                .get(&queue.paths().min_unprocessed_insert_time())
                .await
                .unwrap(),
            b"77"
        );
    }

    #[tokio::test]
    async fn initialize_seeds_virtual_parts_from_local_parts() {
        let (coordinator, queue) = setup().await;
        queue
            .initialize(coordinator.as_ref(), [info("all_1_2_1")])
            .await
            .unwrap();

        // Local parts count as read-from-log for merge admission.
        let state = queue.lock_state_for_test();
        assert_eq!(
            state.virtual_parts.get_containing_part(&info("all_1_1_0")),
            Some(&info("all_1_2_1"))
        );
        drop(state);

        assert!(matches!(
            queue
                .can_merge_parts(&info("all_1_1_0"), &info("all_2_2_0"))
                .unwrap_err(),
            MergeBlocked::MergeAlreadyAssigned(_)
        ));
    }

    #[tokio::test]
    async fn disable_merges_in_range_blocks_future_assignment() {
        let (coordinator, queue) = setup().await;
        push_log(&coordinator, &queue, 0, &get_part("all_1_1_0", 0)).await;
        push_log(&coordinator, &queue, 1, &get_part("all_2_2_0", 0)).await;
        queue
            .pull_logs_to_queue(coordinator.as_ref(), None)
            .await
            .unwrap();

        queue
            .can_merge_parts(&info("all_1_1_0"), &info("all_2_2_0"))
            .unwrap();
        queue.disable_merges_in_range("all_0_10_999999999").unwrap();
        assert!(matches!(
            queue
                .can_merge_parts(&info("all_1_1_0"), &info("all_2_2_0"))
                .unwrap_err(),
            MergeBlocked::MergeAlreadyAssigned(_)
        ));
    }

    #[tokio::test]
    async fn pull_batches_respect_the_multi_op_cap() {
        let (coordinator, queue) = {
            let coordinator = Arc::new(InMemoryCoordinator::new());
            let paths = QueuePaths::new(ROOT, REPLICA);
            for path in [
                paths.log_pointer(),
                paths.min_unprocessed_insert_time(),
                paths.max_processed_insert_time(),
            ] {
                coordinator.create(&path, Vec::new(), false).await.unwrap();
            }
            let options = QueueOptions {
                pull_batch_size: 2,
                ..QueueOptions::default()
            };
            (coordinator.clone(), ReplicationQueue::new(paths, options))
        };

        for index in 0..5u64 {
            push_log(
                &coordinator,
                &queue,
                index,
                &get_part(&format!("all_{index}_{index}_0"), 0),
            )
            .await;
        }
        assert!(queue
            .pull_logs_to_queue(coordinator.as_ref(), None)
            .await
            .unwrap());

        assert_eq!(queue.entries().len(), 5);
        assert_eq!(pointer_value(&coordinator, &queue).await, "5");
        // Queue order mirrors log order across batch boundaries.
        let order: Vec<String> = queue
            .entries()
            .into_iter()
            .map(|snapshot| snapshot.znode_name)
            .collect();
        let mut sorted = order.clone();
        sorted.sort();
        assert_eq!(order, sorted);
    }
}
