//! Scoped tag marking a queue entry as in flight.

use std::sync::Arc;

use log::Level;

use crate::{
    entry::{unix_time, LogEntry},
    logging::queue_log,
    part::PartInfo,
    queue::{state::QueueState, QueueShared},
};

/// Tags an entry as currently executing for as long as the handle lives.
///
/// Created only under the state mutex (by entry selection); dropping it
/// reacquires the mutex, untags the entry's future parts and wakes removal
/// waiters.
pub struct CurrentlyExecuting {
    entry: Arc<LogEntry>,
    shared: Arc<QueueShared>,
}

impl CurrentlyExecuting {
    /// Tag `entry`. The caller holds the state mutex that `state` came from.
    ///
    /// Panics when the produced part is already tagged: two in-flight entries
    /// for one part mean admission is broken.
    pub(crate) fn new(
        entry: Arc<LogEntry>,
        shared: Arc<QueueShared>,
        state: &mut QueueState,
    ) -> Self {
        {
            let mut exec = entry.exec();
            exec.currently_executing = true;
            exec.num_tries += 1;
            exec.last_attempt_time = unix_time();
        }

        let tagged = state
            .future_parts
            .insert(entry.new_part_name.clone(), entry.part_info().clone());
        assert!(
            tagged.is_none(),
            "tagging already tagged future part {}; this is a bug",
            entry.new_part_name
        );

        CurrentlyExecuting { entry, shared }
    }

    /// Record the concrete part the executor will produce. When it differs
    /// from the planned name, the actual name is tagged as a future part too
    /// so nothing else starts producing it.
    ///
    /// Panics when an actual name was already recorded or is already tagged.
    pub(crate) fn set_actual_part_name(
        entry: &LogEntry,
        actual_part_name: String,
        actual_part_info: PartInfo,
        state: &mut QueueState,
    ) {
        {
            let mut exec = entry.exec();
            assert!(
                exec.actual_new_part_name.is_none(),
                "entry actual part name is already set; this is a bug"
            );
            exec.actual_new_part_name = Some(actual_part_name.clone());
        }

        if actual_part_name == entry.new_part_name {
            return;
        }

        let tagged = state
            .future_parts
            .insert(actual_part_name.clone(), actual_part_info);
        assert!(
            tagged.is_none(),
            "attaching already existing future part {actual_part_name}; this is a bug"
        );
    }
}

impl Drop for CurrentlyExecuting {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();

        let actual_part_name = {
            let mut exec = self.entry.exec();
            exec.currently_executing = false;
            exec.actual_new_part_name.take()
        };
        self.entry.notify_execution_complete();

        if state.future_parts.remove(&self.entry.new_part_name).is_none() {
            queue_log!(
                Level::Error,
                "untag_future_part",
                "untagging already untagged future part {}; this is a bug",
                self.entry.new_part_name
            );
        }

        if let Some(actual) = actual_part_name {
            if actual != self.entry.new_part_name && state.future_parts.remove(&actual).is_none() {
                queue_log!(
                    Level::Error,
                    "untag_future_part",
                    "untagging already untagged future part {actual}; this is a bug"
                );
            }
        }
    }
}
