//! Single-process coordinator backend.
//!
//! Keeps the whole node tree in one ordered map. Parent nodes are implicit:
//! a node exists iff it was created, and a child listing collects the first
//! path segment below the listed node. Good enough to drive the queue in
//! tests and single-process embeddings; the consistency guarantees the queue
//! relies on (total order of sequential creates, atomic multi) hold trivially
//! under the single lock.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::coordinator::{pad_index, Coordinator, CoordinatorError, Op, OpResult, Watch};

#[derive(Debug, Default, Clone)]
struct MemoryTree {
    nodes: BTreeMap<String, Vec<u8>>,
    seq_counters: HashMap<String, u64>,
}

impl MemoryTree {
    fn apply(&mut self, op: &Op) -> Result<(OpResult, String), CoordinatorError> {
        match op {
            Op::Create {
                path,
                data,
                sequential,
            } => {
                let full_path = if *sequential {
                    let counter = self.seq_counters.entry(path.clone()).or_insert(0);
                    let full = format!("{}{}", path, pad_index(*counter));
                    *counter += 1;
                    full
                } else {
                    path.clone()
                };
                if self.nodes.contains_key(&full_path) {
                    return Err(CoordinatorError::NodeExists(full_path));
                }
                self.nodes.insert(full_path.clone(), data.clone());
                let parent = parent_of(&full_path);
                Ok((OpResult::Created { path: full_path }, parent))
            }
            Op::Set { path, data } => {
                match self.nodes.get_mut(path) {
                    Some(existing) => *existing = data.clone(),
                    None => return Err(CoordinatorError::NoNode(path.clone())),
                }
                Ok((OpResult::Set, parent_of(path)))
            }
            Op::Remove { path } => {
                if self.nodes.remove(path).is_none() {
                    return Err(CoordinatorError::NoNode(path.clone()));
                }
                Ok((OpResult::Removed, parent_of(path)))
            }
        }
    }
}

fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(idx) => path[..idx].to_owned(),
        None => String::new(),
    }
}

/// In-memory [`Coordinator`] implementation.
#[derive(Debug, Default)]
pub struct InMemoryCoordinator {
    tree: Mutex<MemoryTree>,
    watches: Mutex<HashMap<String, Vec<Watch>>>,
}

impl InMemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn commit(&self, ops: &[Op]) -> Result<Vec<OpResult>, CoordinatorError> {
        let mut tree = self.tree.lock();
        // Validate against a scratch copy so a failing op leaves the tree
        // (and the sequential counters) untouched.
        let mut scratch = tree.clone();
        let mut results = Vec::with_capacity(ops.len());
        let mut touched_parents = Vec::new();
        for op in ops {
            let (result, parent) = scratch.apply(op)?;
            results.push(result);
            touched_parents.push(parent);
        }
        *tree = scratch;
        drop(tree);

        let mut watches = self.watches.lock();
        for parent in touched_parents {
            if let Some(registered) = watches.remove(&parent) {
                for watch in registered {
                    watch.notify_waiters();
                }
            }
        }
        Ok(results)
    }
}

#[async_trait]
impl Coordinator for InMemoryCoordinator {
    async fn get(&self, path: &str) -> Result<Vec<u8>, CoordinatorError> {
        self.tree
            .lock()
            .nodes
            .get(path)
            .cloned()
            .ok_or_else(|| CoordinatorError::NoNode(path.to_owned()))
    }

    async fn try_get(&self, path: &str) -> Result<Option<Vec<u8>>, CoordinatorError> {
        Ok(self.tree.lock().nodes.get(path).cloned())
    }

    async fn get_children(
        &self,
        path: &str,
        watch: Option<Watch>,
    ) -> Result<Vec<String>, CoordinatorError> {
        let prefix = format!("{path}/");
        let children: Vec<String> = {
            let tree = self.tree.lock();
            let names: BTreeSet<String> = tree
                .nodes
                .range(prefix.clone()..)
                .take_while(|(node, _)| node.starts_with(&prefix))
                .filter_map(|(node, _)| node[prefix.len()..].split('/').next())
                .map(str::to_owned)
                .collect();
            names.into_iter().collect()
        };
        if let Some(watch) = watch {
            self.watches
                .lock()
                .entry(path.to_owned())
                .or_default()
                .push(watch);
        }
        Ok(children)
    }

    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        sequential: bool,
    ) -> Result<String, CoordinatorError> {
        let results = self
            .commit(&[Op::Create {
                path: path.to_owned(),
                data,
                sequential,
            }])?;
        match results.into_iter().next() {
            Some(OpResult::Created { path }) => Ok(path),
            _ => unreachable!("create op yields a created result"),
        }
    }

    async fn set(&self, path: &str, data: Vec<u8>) -> Result<(), CoordinatorError> {
        self.commit(&[Op::Set {
            path: path.to_owned(),
            data,
        }])?;
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), CoordinatorError> {
        self.commit(&[Op::Remove {
            path: path.to_owned(),
        }])?;
        Ok(())
    }

    async fn multi(&self, ops: Vec<Op>) -> Result<Vec<OpResult>, CoordinatorError> {
        self.commit(&ops)
    }
}
