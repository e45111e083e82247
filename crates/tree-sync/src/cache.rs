//! Display cache: the materialized part of the remote tree.
//!
//! Parent GUID -> ordered child GUIDs, plus one record per GUID. A parent with
//! no entry in `children` is unmaterialized; its rows exist remotely but have
//! not been fetched (or were dropped on collapse).
//!
//! Not thread-safe on its own. The owning controller serializes access.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::identity::{Guid, IdentityMapper};
use crate::node::{CachedNode, DirStats};

pub struct NodeCache {
    mapper: Arc<IdentityMapper>,
    root: Option<CachedNode>,
    nodes: HashMap<Guid, CachedNode>,
    children: HashMap<Guid, Vec<Guid>>,
    parents: HashMap<Guid, Guid>,
}

impl NodeCache {
    pub fn new(mapper: Arc<IdentityMapper>) -> Self {
        Self {
            mapper,
            root: None,
            nodes: HashMap::new(),
            children: HashMap::new(),
            parents: HashMap::new(),
        }
    }

    pub fn mapper(&self) -> &Arc<IdentityMapper> {
        &self.mapper
    }

    pub fn guid_of(&self, node: &CachedNode) -> Guid {
        self.mapper.guid_for_spid(&node.spid)
    }

    /// Clears everything and reseeds with the top-level rows.
    pub fn replace_root_children(&mut self, root: CachedNode, children: Vec<CachedNode>) {
        self.nodes.clear();
        self.children.clear();
        self.parents.clear();
        self.root = Some(root);
        self.children.insert(Guid::NULL, Vec::new());
        self.set_children(Guid::NULL, children);
    }

    /// Replaces the child list of `parent`.
    ///
    /// Children that are no longer listed are dropped along with their
    /// descendants. A child currently listed under another parent moves here.
    pub fn set_children(&mut self, parent: Guid, children: Vec<CachedNode>) {
        let mut new_list = Vec::with_capacity(children.len());
        let mut seen = HashSet::with_capacity(children.len());

        for child in children {
            let guid = self.guid_of(&child);
            if guid == parent || !seen.insert(guid) {
                continue;
            }
            if let Some(old_parent) = self.parents.get(&guid).copied() {
                if old_parent != parent {
                    self.detach(guid, old_parent);
                }
            }
            self.nodes.insert(guid, child);
            self.parents.insert(guid, parent);
            new_list.push(guid);
        }

        let old_list = self.children.insert(parent, new_list).unwrap_or_default();
        for stale in old_list {
            if !seen.contains(&stale) {
                self.remove_descendants(stale);
                self.nodes.remove(&stale);
                self.parents.remove(&stale);
                self.children.remove(&stale);
            }
        }
    }

    /// Inserts or overwrites a node under `parent`.
    ///
    /// Returns whether the node was already present. A new node whose parent is
    /// not materialized is dropped; it will be fetched when the parent expands.
    pub fn upsert(&mut self, node: CachedNode, parent: Guid) -> bool {
        let guid = self.guid_of(&node);

        if self.nodes.contains_key(&guid) {
            let old_parent = self.parents.get(&guid).copied();
            if old_parent != Some(parent) {
                if let Some(old_parent) = old_parent {
                    self.detach(guid, old_parent);
                }
                match self.children.get_mut(&parent) {
                    Some(list) => {
                        list.push(guid);
                        self.parents.insert(guid, parent);
                    }
                    None => {
                        // Moved somewhere we do not display
                        self.remove_descendants(guid);
                        self.nodes.remove(&guid);
                        self.children.remove(&guid);
                        return true;
                    }
                }
            }
            self.nodes.insert(guid, node);
            return true;
        }

        let Some(list) = self.children.get_mut(&parent) else {
            return false;
        };
        list.push(guid);
        self.parents.insert(guid, parent);
        self.nodes.insert(guid, node);
        false
    }

    /// Removes a single record and its position. Does not cascade.
    pub fn remove(&mut self, guid: Guid) -> bool {
        if self.nodes.remove(&guid).is_none() {
            return false;
        }
        if let Some(parent) = self.parents.get(&guid).copied() {
            self.detach(guid, parent);
        }
        true
    }

    /// Drops everything below `guid`, leaving `guid` itself unmaterialized.
    ///
    /// Returns the GUIDs that were dropped.
    pub fn remove_descendants(&mut self, guid: Guid) -> Vec<Guid> {
        let mut dropped = Vec::new();
        let mut queue = VecDeque::new();
        if let Some(list) = self.children.remove(&guid) {
            queue.extend(list);
        }

        while let Some(next) = queue.pop_front() {
            if let Some(list) = self.children.remove(&next) {
                queue.extend(list);
            }
            self.nodes.remove(&next);
            self.parents.remove(&next);
            dropped.push(next);
        }
        dropped
    }

    pub fn get(&self, guid: Guid) -> Option<&CachedNode> {
        self.nodes.get(&guid)
    }

    pub fn get_child(&self, parent: Guid, index: usize) -> Option<&CachedNode> {
        self.children
            .get(&parent)
            .and_then(|list| list.get(index))
            .and_then(|guid| self.nodes.get(guid))
    }

    pub fn get_children(&self, parent: Guid) -> Vec<CachedNode> {
        self.child_guids(parent)
            .iter()
            .filter_map(|guid| self.nodes.get(guid).cloned())
            .collect()
    }

    pub fn child_guids(&self, parent: Guid) -> &[Guid] {
        self.children.get(&parent).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn child_count(&self, parent: Guid) -> usize {
        self.child_guids(parent).len()
    }

    pub fn parent_of(&self, guid: Guid) -> Option<Guid> {
        self.parents.get(&guid).copied()
    }

    /// True when the children of `guid` are present in the cache.
    pub fn is_materialized(&self, guid: Guid) -> bool {
        self.children.contains_key(&guid)
    }

    pub fn root(&self) -> Option<&CachedNode> {
        self.root.as_ref()
    }

    pub fn contains(&self, guid: Guid) -> bool {
        self.nodes.contains_key(&guid)
    }

    /// Number of cached records, excluding the root.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All materialized GUIDs below `guid`, breadth-first.
    pub fn descendants(&self, guid: Guid) -> Vec<Guid> {
        let mut out = Vec::new();
        let mut queue: VecDeque<Guid> = self.child_guids(guid).iter().copied().collect();
        while let Some(next) = queue.pop_front() {
            queue.extend(self.child_guids(next).iter().copied());
            out.push(next);
        }
        out
    }

    /// Merges backend-computed stats into a cached directory.
    pub fn merge_stats(&mut self, guid: Guid, stats: DirStats) -> bool {
        match self.nodes.get_mut(&guid) {
            Some(cached) => cached.node.set_stats(stats),
            None => false,
        }
    }

    fn detach(&mut self, guid: Guid, parent: Guid) {
        if let Some(list) = self.children.get_mut(&parent) {
            list.retain(|g| *g != guid);
        }
        self.parents.remove(&guid);
    }
}
