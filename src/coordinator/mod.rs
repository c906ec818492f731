//! Narrow client interface to the coordination service.
//!
//! The coordinator is an ordered tree of versioned nodes with child watches;
//! it is the source of truth for everything durable. The queue consumes it
//! through [`Coordinator`], a deliberately small trait: plain reads, child
//! listings with an optional watch, and an atomic multi-op for the pull
//! commit. [`memory::InMemoryCoordinator`] is the bundled single-process
//! backend; production deployments implement the trait over their metadata
//! service client.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Notify;

/// One-shot notification handle registered with a child listing.
///
/// The coordinator signals it (at most once per registration) when the
/// watched node's children change.
pub type Watch = Arc<Notify>;

/// Errors surfaced by a coordinator backend.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// The addressed node does not exist.
    #[error("no node at {0}")]
    NoNode(String),
    /// A create collided with an existing node.
    #[error("node already exists at {0}")]
    NodeExists(String),
    /// Backend-specific failure (connection loss, session expiry, ...).
    #[error("coordinator backend error: {0}")]
    Backend(String),
}

/// One operation of an atomic multi-request.
#[derive(Debug, Clone)]
pub enum Op {
    /// Create a node. With `sequential`, `path` is a prefix and the backend
    /// appends a zero-padded, monotonically increasing counter.
    Create {
        path: String,
        data: Vec<u8>,
        sequential: bool,
    },
    /// Overwrite the data of an existing node.
    Set { path: String, data: Vec<u8> },
    /// Remove an existing node.
    Remove { path: String },
}

/// Per-op response of a successful multi-request, in op order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpResult {
    /// The full path of the created node.
    Created { path: String },
    /// The set was applied.
    Set,
    /// The node was removed.
    Removed,
}

/// Client interface the queue drives the coordination service through.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Read a node's data. Fails with [`CoordinatorError::NoNode`] when
    /// absent.
    async fn get(&self, path: &str) -> Result<Vec<u8>, CoordinatorError>;

    /// Read a node's data, `None` when absent.
    async fn try_get(&self, path: &str) -> Result<Option<Vec<u8>>, CoordinatorError>;

    /// List the names of a node's children, in unspecified order. When a
    /// watch is supplied it fires on the next change to the child set.
    async fn get_children(
        &self,
        path: &str,
        watch: Option<Watch>,
    ) -> Result<Vec<String>, CoordinatorError>;

    /// Create a node, returning the full path (which differs from `path` for
    /// sequential creates).
    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        sequential: bool,
    ) -> Result<String, CoordinatorError>;

    /// Overwrite the data of an existing node.
    async fn set(&self, path: &str, data: Vec<u8>) -> Result<(), CoordinatorError>;

    /// Remove a node.
    async fn remove(&self, path: &str) -> Result<(), CoordinatorError>;

    /// Apply all ops atomically: either every op succeeds and the responses
    /// come back in op order, or none is applied.
    async fn multi(&self, ops: Vec<Op>) -> Result<Vec<OpResult>, CoordinatorError>;
}

/// Zero-pad a shared-log index the way log child names encode it.
pub fn pad_index(index: u64) -> String {
    format!("{index:010}")
}

/// Path layout of the coordinator tree for one table and one replica.
///
/// `root` is shared by every replica of the table; `replica` is this
/// replica's private subtree.
#[derive(Debug, Clone)]
pub struct QueuePaths {
    root: String,
    replica: String,
}

impl QueuePaths {
    pub fn new(root: impl Into<String>, replica: impl Into<String>) -> Self {
        let trim = |s: String| s.trim_end_matches('/').to_owned();
        QueuePaths {
            root: trim(root.into()),
            replica: trim(replica.into()),
        }
    }

    /// Shared subtree root.
    pub fn root(&self) -> &str {
        &self.root
    }

    /// This replica's subtree root.
    pub fn replica(&self) -> &str {
        &self.replica
    }

    pub fn log_dir(&self) -> String {
        format!("{}/log", self.root)
    }

    pub fn log_entry(&self, child: &str) -> String {
        format!("{}/log/{}", self.root, child)
    }

    /// Name of the log child holding the entry at `index`.
    pub fn log_child(index: u64) -> String {
        format!("log-{}", pad_index(index))
    }

    pub fn mutations_dir(&self) -> String {
        format!("{}/mutations", self.root)
    }

    pub fn mutation_entry(&self, child: &str) -> String {
        format!("{}/mutations/{}", self.root, child)
    }

    pub fn temp_dir(&self) -> String {
        format!("{}/temp", self.root)
    }

    pub fn temp_child(&self, child: &str) -> String {
        format!("{}/temp/{}", self.root, child)
    }

    pub fn block_numbers_dir(&self) -> String {
        format!("{}/block_numbers", self.root)
    }

    pub fn partition_blocks_dir(&self, partition_id: &str) -> String {
        format!("{}/block_numbers/{}", self.root, partition_id)
    }

    pub fn partition_block(&self, partition_id: &str, child: &str) -> String {
        format!("{}/block_numbers/{}/{}", self.root, partition_id, child)
    }

    pub fn quorum_last_part(&self) -> String {
        format!("{}/quorum/last_part", self.root)
    }

    pub fn quorum_status(&self) -> String {
        format!("{}/quorum/status", self.root)
    }

    pub fn queue_dir(&self) -> String {
        format!("{}/queue", self.replica)
    }

    pub fn queue_entry(&self, znode_name: &str) -> String {
        format!("{}/queue/{}", self.replica, znode_name)
    }

    /// Prefix for sequential creates of local queue entries.
    pub fn queue_create_prefix(&self) -> String {
        format!("{}/queue/queue-", self.replica)
    }

    pub fn log_pointer(&self) -> String {
        format!("{}/log_pointer", self.replica)
    }

    pub fn min_unprocessed_insert_time(&self) -> String {
        format!("{}/min_unprocessed_insert_time", self.replica)
    }

    pub fn max_processed_insert_time(&self) -> String {
        format!("{}/max_processed_insert_time", self.replica)
    }
}
