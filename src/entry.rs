//! Replication log entries and mutation entries.
//!
//! A [`LogEntry`] is immutable once parsed off the wire; everything that
//! changes while the entry sits in the local queue lives in a separate
//! execution-state cell so the entry can be shared freely between the queue,
//! the worker holding it and status readers.

use std::{
    collections::BTreeMap,
    time::{SystemTime, UNIX_EPOCH},
};

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;

use crate::part::{PartInfo, PartNameError};

/// Wall-clock seconds since the Unix epoch; the wire time representation.
pub(crate) fn unix_time() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

/// A log entry body that could not be decoded.
#[derive(Debug, Error)]
pub enum EntryParseError {
    #[error("malformed entry body: {0}")]
    Codec(#[from] serde_json::Error),
    #[error(transparent)]
    PartName(#[from] PartNameError),
}

/// Action payload of a log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum EntryAction {
    /// Fetch the part from a replica that has it.
    GetPart,
    /// Adopt an externally produced part.
    AttachPart,
    /// Merge the listed parts into the new part.
    MergeParts { parts: Vec<String> },
    /// Rewrite the listed part at the new mutation version.
    MutatePart { parts: Vec<String> },
    /// Clear one column in every part of the named range.
    ClearColumn { column: String },
    /// Drop every part covered by the named range.
    DropRange,
}

/// Fieldless discriminant of [`EntryAction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    GetPart,
    AttachPart,
    MergeParts,
    MutatePart,
    ClearColumn,
    DropRange,
}

impl EntryKind {
    /// Wire-style upper-case name, for log lines and conflict descriptions.
    pub fn type_name(self) -> &'static str {
        match self {
            EntryKind::GetPart => "GET_PART",
            EntryKind::AttachPart => "ATTACH_PART",
            EntryKind::MergeParts => "MERGE_PARTS",
            EntryKind::MutatePart => "MUTATE_PART",
            EntryKind::ClearColumn => "CLEAR_COLUMN",
            EntryKind::DropRange => "DROP_RANGE",
        }
    }
}

/// Mutable execution bookkeeping of a queued entry.
#[derive(Debug, Clone, Default)]
pub struct ExecutionState {
    /// Set while a worker holds the entry.
    pub currently_executing: bool,
    /// Execution attempts so far.
    pub num_tries: u32,
    /// Wall clock of the last attempt, 0 if never attempted.
    pub last_attempt_time: i64,
    /// How often admission postponed the entry.
    pub num_postponed: u32,
    /// Wall clock of the last postponement, 0 if never postponed.
    pub last_postpone_time: i64,
    /// Why the entry was last postponed.
    pub postpone_reason: String,
    /// Rendering of the last execution failure.
    pub last_exception: Option<String>,
    /// Concrete output part the executor settled on, when it differs from
    /// the planned one (quorum resolution can pick another name).
    pub actual_new_part_name: Option<String>,
}

/// One entry of the shared replication log, as held in the local queue.
#[derive(Debug, Serialize, Deserialize)]
pub struct LogEntry {
    /// Name of this entry's node under the replica queue. Assigned after the
    /// coordinator write; not part of the wire body.
    #[serde(skip)]
    pub znode_name: String,
    /// Replica that issued the action.
    #[serde(default)]
    pub source_replica: String,
    /// What to do.
    pub action: EntryAction,
    /// Part the action produces.
    pub new_part_name: String,
    /// Wall clock of log submission, 0 if unknown.
    #[serde(default)]
    pub create_time: i64,
    #[serde(skip)]
    part_info: PartInfo,
    #[serde(skip)]
    exec: Mutex<ExecutionState>,
    #[serde(skip)]
    execution_complete: Notify,
}

impl LogEntry {
    /// Build a self-originated entry. Fails when the part name does not
    /// parse.
    pub fn new(
        action: EntryAction,
        new_part_name: impl Into<String>,
        source_replica: impl Into<String>,
        create_time: i64,
    ) -> Result<Self, PartNameError> {
        let new_part_name = new_part_name.into();
        let part_info = PartInfo::parse(&new_part_name)?;
        Ok(LogEntry {
            znode_name: String::new(),
            source_replica: source_replica.into(),
            action,
            new_part_name,
            create_time,
            part_info,
            exec: Mutex::default(),
            execution_complete: Notify::new(),
        })
    }

    /// Decode a wire body. The znode name is assigned by the caller once the
    /// coordinator write it came from (or goes to) is known.
    pub fn parse(body: &[u8]) -> Result<Self, EntryParseError> {
        let mut entry: LogEntry = serde_json::from_slice(body)?;
        entry.part_info = PartInfo::parse(&entry.new_part_name)?;
        Ok(entry)
    }

    /// Encode the wire body. Identical for the shared log and replica queues.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("log entry serialization is infallible")
    }

    pub fn kind(&self) -> EntryKind {
        match self.action {
            EntryAction::GetPart => EntryKind::GetPart,
            EntryAction::AttachPart => EntryKind::AttachPart,
            EntryAction::MergeParts { .. } => EntryKind::MergeParts,
            EntryAction::MutatePart { .. } => EntryKind::MutatePart,
            EntryAction::ClearColumn { .. } => EntryKind::ClearColumn,
            EntryAction::DropRange => EntryKind::DropRange,
        }
    }

    /// Parsed form of [`LogEntry::new_part_name`].
    pub fn part_info(&self) -> &PartInfo {
        &self.part_info
    }

    /// Parts that must exist locally before the action can run (merge and
    /// mutation prerequisites).
    pub fn source_parts(&self) -> &[String] {
        match &self.action {
            EntryAction::MergeParts { parts } | EntryAction::MutatePart { parts } => parts,
            _ => &[],
        }
    }

    /// Snapshot of the execution state.
    pub fn execution_state(&self) -> ExecutionState {
        self.exec.lock().clone()
    }

    pub fn is_executing(&self) -> bool {
        self.exec.lock().currently_executing
    }

    pub(crate) fn exec(&self) -> MutexGuard<'_, ExecutionState> {
        self.exec.lock()
    }

    pub(crate) fn record_postpone(&self, reason: String) {
        let mut exec = self.exec.lock();
        exec.num_postponed += 1;
        exec.last_postpone_time = unix_time();
        exec.postpone_reason = reason;
    }

    pub(crate) fn record_exception(&self, rendered: String) {
        self.exec.lock().last_exception = Some(rendered);
    }

    pub(crate) fn notify_execution_complete(&self) {
        self.execution_complete.notify_waiters();
    }

    /// Wait until no worker holds the entry. Returns immediately when the
    /// entry is idle.
    pub async fn wait_until_not_executing(&self) {
        loop {
            let notified = self.execution_complete.notified();
            if !self.is_executing() {
                return;
            }
            notified.await;
        }
    }
}

/// One entry of the shared mutation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationEntry {
    /// Name of the entry's node under the shared mutations directory.
    /// Monotonically ordered; not part of the wire body.
    #[serde(skip)]
    pub znode_name: String,
    /// Wall clock of mutation submission, 0 if unknown.
    #[serde(default)]
    pub create_time: i64,
    /// Per-partition mutation version: parts with a data version at or below
    /// this block number are subject to the mutation.
    pub block_numbers: BTreeMap<String, i64>,
    /// Commands to apply, opaque to the queue.
    pub commands: Vec<String>,
}

impl MutationEntry {
    /// Decode a wire body; the znode name comes from the child listing.
    pub fn parse(body: &[u8], znode_name: impl Into<String>) -> Result<Self, EntryParseError> {
        let mut entry: MutationEntry = serde_json::from_slice(body)?;
        entry.znode_name = znode_name.into();
        Ok(entry)
    }

    /// Encode the wire body.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("mutation entry serialization is infallible")
    }
}
