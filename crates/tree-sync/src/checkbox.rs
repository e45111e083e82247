//! Tri-state checkboxes for change-review trees.
//!
//! Only some rows carry an explicit state. Everything else inherits from the
//! nearest explicit ancestor: children of a checked row are checked, children
//! of an unchecked or mixed row are unchecked. Whenever a row turns mixed its
//! children are pinned to explicit states so inheritance cannot contradict it.
//!
//! Aggregation always uses the backend's complete child list, never just the
//! rows that happen to be cached.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::cache::NodeCache;
use crate::controller::{ControllerError, Result, TreeController};
use crate::identity::Guid;
use crate::node::{CachedNode, SinglePathIdentifier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CheckState {
    Unchecked,
    Checked,
    Mixed,
}

impl CheckState {
    pub fn from_checked(checked: bool) -> Self {
        if checked {
            CheckState::Checked
        } else {
            CheckState::Unchecked
        }
    }

    /// State an implicit child takes from a parent in this state.
    pub fn inherited(self) -> Self {
        match self {
            CheckState::Checked => CheckState::Checked,
            CheckState::Unchecked | CheckState::Mixed => CheckState::Unchecked,
        }
    }

    /// Uniform child states aggregate to that state, anything else is mixed.
    /// `None` when there are no children.
    pub fn aggregate(states: impl IntoIterator<Item = CheckState>) -> Option<CheckState> {
        let mut states = states.into_iter();
        let first = states.next()?;
        if first == CheckState::Mixed || states.any(|s| s != first) {
            Some(CheckState::Mixed)
        } else {
            Some(first)
        }
    }
}

/// Explicit checkbox states plus the parent each was recorded under.
///
/// Parents are remembered so entries below collapsed rows can still be found
/// and purged after the cache has forgotten them.
#[derive(Debug, Default)]
pub struct CheckboxStateTracker {
    states: HashMap<Guid, CheckState>,
    parents: HashMap<Guid, Guid>,
}

impl CheckboxStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn explicit(&self, guid: Guid) -> Option<CheckState> {
        self.states.get(&guid).copied()
    }

    /// Records an explicit state. Returns the previous explicit state.
    pub fn set(&mut self, guid: Guid, state: CheckState, parent: Option<Guid>) -> Option<CheckState> {
        if let Some(parent) = parent.filter(|p| !p.is_null()) {
            self.parents.insert(guid, parent);
        }
        self.states.insert(guid, state)
    }

    /// Effective state of a cached row.
    pub fn state_of(&self, guid: Guid, cache: &NodeCache) -> CheckState {
        let mut current = guid;
        for _ in 0..=self.parents.len() + cache.len() {
            if let Some(state) = self.states.get(&current) {
                return if current == guid { *state } else { state.inherited() };
            }
            match cache
                .parent_of(current)
                .or_else(|| self.parents.get(&current).copied())
            {
                Some(parent) if !parent.is_null() => current = parent,
                _ => break,
            }
        }
        CheckState::Unchecked
    }

    /// Effective state of a child whose parent is in `parent_state`.
    pub fn child_state(&self, child: Guid, parent_state: CheckState) -> CheckState {
        self.explicit(child).unwrap_or_else(|| parent_state.inherited())
    }

    /// Sets `guid` and every cached row below it, and drops explicit states of
    /// uncached rows below it so they inherit the new value.
    pub fn set_subtree(&mut self, guid: Guid, checked: bool, cache: &NodeCache) {
        let state = CheckState::from_checked(checked);
        self.forget_descendants(guid);
        self.set(guid, state, cache.parent_of(guid));
        for descendant in cache.descendants(guid) {
            if cache.get(descendant).is_some_and(|n| n.node.is_ephemeral()) {
                continue;
            }
            self.set(descendant, state, cache.parent_of(descendant));
        }
    }

    /// Drops every explicit state recorded below `guid`.
    pub fn forget_descendants(&mut self, guid: Guid) {
        let below: Vec<Guid> = self
            .states
            .keys()
            .copied()
            .filter(|g| *g != guid && self.is_below(*g, guid))
            .collect();
        for g in below {
            self.states.remove(&g);
            self.parents.remove(&g);
        }
    }

    /// Drops `guid` and everything recorded below it.
    pub fn forget_subtree(&mut self, guid: Guid) {
        self.forget_descendants(guid);
        self.states.remove(&guid);
        self.parents.remove(&guid);
    }

    pub fn clear(&mut self) {
        self.states.clear();
        self.parents.clear();
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    fn is_below(&self, guid: Guid, ancestor: Guid) -> bool {
        let mut current = guid;
        for _ in 0..=self.parents.len() {
            match self.parents.get(&current) {
                Some(parent) if *parent == ancestor => return true,
                Some(parent) => current = *parent,
                None => return false,
            }
        }
        false
    }
}

impl<B: Backend> TreeController<B> {
    /// Checks or unchecks `guid` and everything below it, then recomputes its ancestors.
    pub async fn toggle_checkbox(&self, guid: Guid, checked: bool) -> Result<()> {
        let parent = {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            if !state.binding.has_checkboxes {
                return Err(ControllerError::CheckboxesDisabled(state.binding.tree_id.clone()));
            }
            if !state.cache.get(guid).is_some_and(|n| !n.node.is_ephemeral()) {
                debug!(%guid, "Ignoring checkbox toggle on unknown row");
                return Ok(());
            }
            state.checkboxes.set_subtree(guid, checked, &state.cache);
            state.cache.parent_of(guid).filter(|p| !p.is_null())
        };

        let top = match parent {
            Some(parent) => self.recompute_upward(parent).await,
            None => Ok(None),
        };
        match top {
            Ok(top) => {
                self.surface.refresh_subtree(top.unwrap_or(guid));
                Ok(())
            }
            Err(e) => {
                self.surface.refresh_subtree(guid);
                Err(e)
            }
        }
    }

    /// Effective checkbox state of a cached row, or `None` when the tree has no checkboxes.
    pub fn checkbox_state(&self, guid: Guid) -> Option<CheckState> {
        let state = self.lock_state();
        if !state.binding.has_checkboxes || !state.cache.contains(guid) {
            return None;
        }
        Some(state.checkboxes.state_of(guid, &state.cache))
    }

    /// Recomputes `start` and its ancestors from their complete child lists.
    ///
    /// Stops at the first ancestor whose state did not change or at a row that
    /// left the cache. Returns the highest row updated. A backend failure is
    /// published as `ErrorOccurred` and returned.
    pub(crate) async fn recompute_upward(&self, start: Guid) -> Result<Option<Guid>> {
        let mut ancestor = start;
        let mut top = None;

        while !ancestor.is_null() {
            let (tree_id, generation, spid) = {
                let state = self.lock_state();
                match state.cache.get(ancestor) {
                    Some(node) => (state.binding.tree_id.clone(), state.generation, node.spid.clone()),
                    None => {
                        debug!(%ancestor, "Ancestor left the cache; stopping propagation");
                        break;
                    }
                }
            };

            let children = match self.backend.get_children(&spid, &tree_id, None).await {
                Ok(children) => children,
                Err(e) => {
                    warn!(%ancestor, "Failed to fetch children for checkbox state: {}", e);
                    self.report_error(
                        &tree_id,
                        format!("Failed to update checkbox state of {}", spid.path),
                        Some(e.to_string()),
                    );
                    return Err(e.into());
                }
            };

            let mut guard = self.lock_state();
            let state = &mut *guard;
            if state.generation != generation {
                debug!(%ancestor, "Tree reloaded during propagation; stopping");
                break;
            }

            let inherited = state.checkboxes.state_of(ancestor, &state.cache);
            let child_states: Vec<(Guid, CheckState)> = children
                .iter()
                .filter(|c| !c.node.is_ephemeral())
                .map(|c| {
                    let guid = self.mapper.guid_for_spid(&c.spid);
                    (guid, state.checkboxes.child_state(guid, inherited))
                })
                .collect();
            let Some(computed) = CheckState::aggregate(child_states.iter().map(|(_, s)| *s)) else {
                break;
            };

            if computed == CheckState::Mixed {
                for (child, child_state) in &child_states {
                    if state.checkboxes.explicit(*child).is_none() {
                        state.checkboxes.set(*child, *child_state, Some(ancestor));
                    }
                }
            }

            let parent = state.cache.parent_of(ancestor);
            let previous = state.checkboxes.set(ancestor, computed, parent);
            top = Some(ancestor);
            if previous == Some(computed) {
                break;
            }
            match parent {
                Some(parent) => ancestor = parent,
                None => break,
            }
        }

        Ok(top)
    }

    /// Every checked row whose parent is not checked, expanded to include all
    /// of its descendants.
    ///
    /// Walks the backend's complete tree, so uncached rows are included.
    pub async fn collect_checked_subset(&self) -> Result<Vec<SinglePathIdentifier>> {
        let (tree_id, root) = {
            let state = self.lock_state();
            if !state.binding.has_checkboxes {
                return Err(ControllerError::CheckboxesDisabled(state.binding.tree_id.clone()));
            }
            (state.binding.tree_id.clone(), state.binding.root.spid.clone())
        };

        // Mixed rows are walked to find where checked subtrees begin.
        let mut checked = VecDeque::new();
        let mut mixed = VecDeque::from([(root, CheckState::Unchecked)]);
        while let Some((parent, parent_state)) = mixed.pop_front() {
            let children = self.checked_children_of(&parent, &tree_id).await?;
            let state = self.lock_state();
            for child in children.into_iter().filter(|c| !c.node.is_ephemeral()) {
                let guid = self.mapper.guid_for_spid(&child.spid);
                match state.checkboxes.child_state(guid, parent_state) {
                    CheckState::Checked => checked.push_back(child),
                    CheckState::Mixed if child.is_dir() => mixed.push_back((child.spid, CheckState::Mixed)),
                    _ => {}
                }
            }
        }

        let mut out = Vec::new();
        while let Some(node) = checked.pop_front() {
            if node.is_dir() {
                let children = self.checked_children_of(&node.spid, &tree_id).await?;
                checked.extend(children.into_iter().filter(|c| !c.node.is_ephemeral()));
            }
            out.push(node.spid);
        }
        debug!(tree_id = %tree_id, count = out.len(), "Collected checked rows");
        Ok(out)
    }

    /// Complete child list for change-set collection. A partial set is never
    /// returned, so failures abort the walk.
    async fn checked_children_of(
        &self,
        parent: &SinglePathIdentifier,
        tree_id: &str,
    ) -> Result<Vec<CachedNode>> {
        self.backend.get_children(parent, tree_id, None).await.map_err(|e| {
            warn!(parent = %parent.path, "Failed to collect checked rows: {}", e);
            self.report_error(
                tree_id,
                format!("Failed to collect checked rows under {}", parent.path),
                Some(e.to_string()),
            );
            ControllerError::from(e)
        })
    }
}
