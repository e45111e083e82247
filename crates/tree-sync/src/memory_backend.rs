//! In-memory backend for tests and the fixture inspector.
//!
//! Holds complete trees and pushes signals on the shared bus the way a real
//! backend process would.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::debug;

use crate::backend::{Backend, BackendError, Result, RowsOfInterest};
use crate::controller::LoadState;
use crate::events::{NodeChange, Signal, SignalDispatcher};
use crate::identity::Guid;
use crate::node::{CachedNode, DirStats, SinglePathIdentifier};

struct MemoryTree {
    root: CachedNode,
    children: HashMap<SinglePathIdentifier, Vec<CachedNode>>,
    rows: RowsOfInterest,
}

pub struct InMemoryBackend {
    bus: Arc<SignalDispatcher>,
    trees: RwLock<HashMap<String, MemoryTree>>,
    failures: Mutex<Vec<BackendError>>,
    latency: Mutex<Option<Duration>>,
    get_children_calls: AtomicUsize,
}

impl InMemoryBackend {
    pub fn new(bus: Arc<SignalDispatcher>) -> Self {
        Self {
            bus,
            trees: RwLock::new(HashMap::new()),
            failures: Mutex::new(Vec::new()),
            latency: Mutex::new(None),
            get_children_calls: AtomicUsize::new(0),
        }
    }

    /// Registers an empty tree rooted at `root`.
    pub fn add_tree(&self, tree_id: &str, root: CachedNode) {
        let mut trees = self.trees.write().unwrap_or_else(|e| e.into_inner());
        trees.insert(
            tree_id.to_string(),
            MemoryTree {
                root,
                children: HashMap::new(),
                rows: RowsOfInterest::default(),
            },
        );
    }

    pub fn root(&self, tree_id: &str) -> Option<CachedNode> {
        let trees = self.trees.read().unwrap_or_else(|e| e.into_inner());
        trees.get(tree_id).map(|t| t.root.clone())
    }

    /// Sets the children of `parent` without publishing anything.
    pub fn set_children(&self, tree_id: &str, parent: &SinglePathIdentifier, children: Vec<CachedNode>) {
        let mut trees = self.trees.write().unwrap_or_else(|e| e.into_inner());
        if let Some(tree) = trees.get_mut(tree_id) {
            tree.children.insert(parent.clone(), children);
        }
    }

    /// Adds or replaces `node` under `parent` and pushes `NodeUpserted`.
    pub fn upsert_node(&self, tree_id: &str, parent: &SinglePathIdentifier, node: CachedNode) {
        {
            let mut trees = self.trees.write().unwrap_or_else(|e| e.into_inner());
            let Some(tree) = trees.get_mut(tree_id) else {
                return;
            };
            let list = tree.children.entry(parent.clone()).or_default();
            match list.iter_mut().find(|c| c.spid == node.spid) {
                Some(existing) => *existing = node.clone(),
                None => list.push(node.clone()),
            }
        }

        self.bus.publish(
            Signal::NodeUpserted {
                tree_id: tree_id.to_string(),
                change: NodeChange {
                    parent: parent.clone(),
                    node,
                },
            },
            tree_id,
        );
    }

    /// Removes `node` and everything below it, then pushes `NodeRemoved`.
    pub fn remove_node(&self, tree_id: &str, parent: &SinglePathIdentifier, node: &CachedNode) {
        {
            let mut trees = self.trees.write().unwrap_or_else(|e| e.into_inner());
            let Some(tree) = trees.get_mut(tree_id) else {
                return;
            };
            if let Some(list) = tree.children.get_mut(parent) {
                list.retain(|c| c.spid != node.spid);
            }
            let mut queue = vec![node.spid.clone()];
            while let Some(spid) = queue.pop() {
                if let Some(list) = tree.children.remove(&spid) {
                    queue.extend(list.into_iter().map(|c| c.spid));
                }
            }
        }

        self.bus.publish(
            Signal::NodeRemoved {
                tree_id: tree_id.to_string(),
                change: NodeChange {
                    parent: parent.clone(),
                    node: node.clone(),
                },
            },
            tree_id,
        );
    }

    /// Computes directory stats for the whole tree and pushes `StatsUpdated`.
    pub fn refresh_stats(&self, tree_id: &str) {
        let stats = {
            let mut trees = self.trees.write().unwrap_or_else(|e| e.into_inner());
            let Some(tree) = trees.get_mut(tree_id) else {
                return;
            };
            let mut computed = HashMap::new();
            let root = tree.root.spid.clone();
            compute_stats(tree, &root, &mut computed);
            for list in tree.children.values_mut() {
                for child in list.iter_mut() {
                    if let Some(stats) = computed.get(&child.spid) {
                        child.node.set_stats(*stats);
                    }
                }
            }
            computed.remove(&root);
            computed.into_iter().collect::<Vec<_>>()
        };

        self.bus.publish(
            Signal::StatsUpdated {
                tree_id: tree_id.to_string(),
                stats,
            },
            tree_id,
        );
    }

    /// Pushes a load-state transition for `tree_id`.
    pub fn publish_load_state(&self, tree_id: &str, state: LoadState) {
        self.bus.publish(
            Signal::TreeLoadStateUpdated {
                tree_id: tree_id.to_string(),
                state,
            },
            tree_id,
        );
    }

    /// Makes the next calls fail with `error`, once per queued entry.
    pub fn fail_next(&self, error: BackendError) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(error);
    }

    /// Delays every `get_children` answer.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = latency;
    }

    pub fn get_children_calls(&self) -> usize {
        self.get_children_calls.load(Ordering::Relaxed)
    }

    pub fn rows_of_interest(&self, tree_id: &str) -> RowsOfInterest {
        let trees = self.trees.read().unwrap_or_else(|e| e.into_inner());
        trees.get(tree_id).map(|t| t.rows.clone()).unwrap_or_default()
    }

    fn take_failure(&self) -> Result<()> {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures.remove(0))
        }
    }

    fn with_rows<T>(&self, tree_id: &str, f: impl FnOnce(&mut RowsOfInterest) -> T) -> Result<T> {
        self.take_failure()?;
        let mut trees = self.trees.write().unwrap_or_else(|e| e.into_inner());
        let tree = trees
            .get_mut(tree_id)
            .ok_or_else(|| BackendError::TreeNotFound(tree_id.to_string()))?;
        Ok(f(&mut tree.rows))
    }
}

fn compute_stats(
    tree: &MemoryTree,
    spid: &SinglePathIdentifier,
    out: &mut HashMap<SinglePathIdentifier, DirStats>,
) -> DirStats {
    let mut stats = DirStats::default();
    if let Some(children) = tree.children.get(spid) {
        for child in children {
            if child.is_dir() {
                let sub = compute_stats(tree, &child.spid, out);
                stats.dir_count += 1 + sub.dir_count;
                stats.file_count += sub.file_count;
                stats.size_bytes += sub.size_bytes;
            } else {
                stats.file_count += 1;
                stats.size_bytes += child.node.size_bytes().unwrap_or(0);
            }
        }
    }
    out.insert(spid.clone(), stats);
    stats
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn start_subtree_load(&self, tree_id: &str) -> Result<()> {
        self.take_failure()?;
        if self.root(tree_id).is_none() {
            return Err(BackendError::TreeNotFound(tree_id.to_string()));
        }
        debug!(tree_id, "Starting in-memory subtree load");
        self.publish_load_state(tree_id, LoadState::LoadStarted);
        self.publish_load_state(tree_id, LoadState::CompletelyLoaded);
        Ok(())
    }

    async fn get_children(
        &self,
        parent: &SinglePathIdentifier,
        tree_id: &str,
        max_results: Option<u32>,
    ) -> Result<Vec<CachedNode>> {
        self.get_children_calls.fetch_add(1, Ordering::Relaxed);
        let latency = *self.latency.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.take_failure()?;

        let trees = self.trees.read().unwrap_or_else(|e| e.into_inner());
        let tree = trees
            .get(tree_id)
            .ok_or_else(|| BackendError::TreeNotFound(tree_id.to_string()))?;
        let children = tree.children.get(parent).cloned().unwrap_or_default();
        if let Some(max) = max_results {
            if children.len() > max as usize {
                return Err(BackendError::TooManyResults {
                    actual: children.len() as u32,
                });
            }
        }
        Ok(children)
    }

    async fn get_rows_of_interest(&self, tree_id: &str) -> Result<RowsOfInterest> {
        self.with_rows(tree_id, |rows| rows.clone())
    }

    async fn set_selected_rows(&self, selected: &HashSet<Guid>, tree_id: &str) -> Result<()> {
        self.with_rows(tree_id, |rows| rows.selected = selected.clone())
    }

    async fn add_expanded_row(&self, row: Guid, tree_id: &str) -> Result<()> {
        self.with_rows(tree_id, |rows| {
            rows.expanded.insert(row);
        })
    }

    async fn remove_expanded_row(&self, row: Guid, tree_id: &str) -> Result<()> {
        self.with_rows(tree_id, |rows| {
            rows.expanded.remove(&row);
        })
    }
}
