//! TreeController: keeps one displayed tree in sync with the backend.
//!
//! Three inputs feed the cache:
//!
//! 1. Pull responses from `Backend::get_children` (load, expand, repopulate)
//! 2. Push signals from the bus (upserts, removals, stats, load state)
//! 3. Local UI actions (expand/collapse, selection, checkbox toggles)
//!
//! All cache and checkbox mutations happen under `state`, which is never held
//! across an await. Backend calls run with the lock released and their results
//! are applied only if the controller's generation has not moved on. Bus
//! callbacks only enqueue; signals are applied by a single consumer
//! (`process_pending_signals` or the task from `spawn_signal_loop`).

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, BackendError, RowsOfInterest};
use crate::cache::NodeCache;
use crate::checkbox::{CheckState, CheckboxStateTracker};
use crate::config::ControllerConfig;
use crate::events::{NodeChange, SenderFilter, Signal, SignalDispatcher, SignalKind, Subscription};
use crate::identity::{Guid, IdentityMapper};
use crate::node::{CachedNode, DirStats, NodeError, SinglePathIdentifier};

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Tree {0} does not show checkboxes")]
    CheckboxesDisabled(String),

    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

pub type Result<T> = std::result::Result<T, ControllerError>;

/// Load lifecycle of the bound tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadState {
    NotLoaded,
    LoadStarted,
    CompletelyLoaded,
    Error,
}

/// Which tree a controller shows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeBinding {
    pub tree_id: String,
    pub root: CachedNode,
    /// Change-review trees show tri-state checkboxes.
    #[serde(default)]
    pub has_checkboxes: bool,
}

impl TreeBinding {
    pub fn new(tree_id: impl Into<String>, root: CachedNode, has_checkboxes: bool) -> Self {
        Self {
            tree_id: tree_id.into(),
            root,
            has_checkboxes,
        }
    }
}

/// The outline widget that displays the tree.
pub trait RenderSurface: Send + Sync {
    /// `guid` and everything below it should be re-rendered. `Guid::NULL` means the whole view.
    fn refresh_subtree(&self, guid: Guid);

    /// Called after a reload with the selection the backend remembered.
    fn restore_selection(&self, _selected: &HashSet<Guid>) {}
}

/// Surface for headless use.
pub struct NullSurface;

impl RenderSurface for NullSurface {
    fn refresh_subtree(&self, _guid: Guid) {}
}

pub(crate) struct ControllerState {
    pub(crate) binding: TreeBinding,
    pub(crate) load_state: LoadState,
    /// Bumped on every load request and rebind; pulls tagged with an older value are discarded.
    pub(crate) generation: u64,
    pub(crate) updates_enabled: bool,
    pub(crate) cache: NodeCache,
    pub(crate) checkboxes: CheckboxStateTracker,
    pub(crate) expanded: HashSet<Guid>,
    pub(crate) selected: HashSet<Guid>,
}

impl ControllerState {
    /// Cache key of the node listed as `parent` in a change.
    pub(crate) fn parent_key(&self, parent: &SinglePathIdentifier) -> Guid {
        if *parent == self.binding.root.spid {
            Guid::NULL
        } else {
            self.cache.mapper().guid_for_spid(parent)
        }
    }
}

/// Where an upserted node ended up.
enum Upserted {
    /// Already cached under the same parent; overwritten in place.
    Updated(Guid),
    /// New under `parent`, or dropped because `parent` is not materialized.
    Inserted { parent: Guid },
    /// Was cached under `from`; now listed under `to` if that is materialized.
    Moved { from: Guid, to: Guid },
}

/// Outcome of one child fetch.
pub(crate) enum Fetched {
    Children(Vec<CachedNode>),
    Capped(u32),
    Failed(BackendError),
}

pub struct TreeController<B: Backend> {
    pub(crate) backend: B,
    bus: Arc<SignalDispatcher>,
    pub(crate) mapper: Arc<IdentityMapper>,
    pub(crate) surface: Arc<dyn RenderSurface>,
    config: ControllerConfig,
    state: Mutex<ControllerState>,
    subscriptions: Mutex<Vec<Subscription>>,
    signal_tx: mpsc::UnboundedSender<Signal>,
    signal_rx: Mutex<Option<mpsc::UnboundedReceiver<Signal>>>,
}

impl<B: Backend> TreeController<B> {
    /// Binds a controller to `binding` and subscribes to its tree's signals.
    ///
    /// Nothing is loaded until `request_load` is called.
    pub fn new(
        binding: TreeBinding,
        backend: B,
        bus: Arc<SignalDispatcher>,
        mapper: Arc<IdentityMapper>,
        surface: Arc<dyn RenderSurface>,
        config: ControllerConfig,
    ) -> Self {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let state = ControllerState {
            cache: NodeCache::new(Arc::clone(&mapper)),
            binding,
            load_state: LoadState::NotLoaded,
            generation: 0,
            updates_enabled: false,
            checkboxes: CheckboxStateTracker::new(),
            expanded: HashSet::new(),
            selected: HashSet::new(),
        };
        let controller = Self {
            backend,
            bus,
            mapper,
            surface,
            config,
            state: Mutex::new(state),
            subscriptions: Mutex::new(Vec::new()),
            signal_tx,
            signal_rx: Mutex::new(Some(signal_rx)),
        };
        let tree_id = controller.tree_id();
        *controller.lock_subscriptions() = controller.subscribe_for(&tree_id);
        controller
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_subscriptions(&self) -> MutexGuard<'_, Vec<Subscription>> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn listener_id(&self, tree_id: &str) -> String {
        format!("{}:{}", self.config.listener_prefix, tree_id)
    }

    fn subscribe_for(&self, tree_id: &str) -> Vec<Subscription> {
        let listener_id = self.listener_id(tree_id);
        [
            SignalKind::TreeLoadStateUpdated,
            SignalKind::DisplayTreeChanged,
            SignalKind::NodeUpserted,
            SignalKind::NodeRemoved,
            SignalKind::SubtreeNodesChanged,
            SignalKind::StatsUpdated,
        ]
        .into_iter()
        .map(|kind| {
            let tx = self.signal_tx.clone();
            self.bus.subscribe(
                kind,
                listener_id.clone(),
                SenderFilter::only(tree_id),
                move |signal| {
                    tx.send(signal.clone())?;
                    Ok(())
                },
            )
        })
        .collect()
    }

    // ------------------------------------------------------------------
    // Reads for the rendering surface
    // ------------------------------------------------------------------

    pub fn tree_id(&self) -> String {
        self.lock_state().binding.tree_id.clone()
    }

    pub fn binding(&self) -> TreeBinding {
        self.lock_state().binding.clone()
    }

    pub fn load_state(&self) -> LoadState {
        self.lock_state().load_state
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn guid_of(&self, node: &CachedNode) -> Guid {
        self.mapper.guid_for_spid(&node.spid)
    }

    pub fn child_count(&self, parent: Guid) -> usize {
        self.lock_state().cache.child_count(parent)
    }

    pub fn child_at(&self, parent: Guid, index: usize) -> Option<CachedNode> {
        self.lock_state().cache.get_child(parent, index).cloned()
    }

    pub fn children(&self, parent: Guid) -> Vec<CachedNode> {
        self.lock_state().cache.get_children(parent)
    }

    pub fn node(&self, guid: Guid) -> Option<CachedNode> {
        self.lock_state().cache.get(guid).cloned()
    }

    pub fn parent_of(&self, guid: Guid) -> Option<Guid> {
        self.lock_state().cache.parent_of(guid)
    }

    pub fn is_expandable(&self, guid: Guid) -> bool {
        self.lock_state()
            .cache
            .get(guid)
            .is_some_and(|n| n.is_dir() && !n.node.is_ephemeral())
    }

    pub fn is_expanded(&self, guid: Guid) -> bool {
        self.lock_state().expanded.contains(&guid)
    }

    pub fn selected_rows(&self) -> HashSet<Guid> {
        self.lock_state().selected.clone()
    }

    // ------------------------------------------------------------------
    // Signal intake
    // ------------------------------------------------------------------

    /// Applies every queued signal. Returns how many were handled.
    ///
    /// Does nothing once `spawn_signal_loop` has taken the queue.
    pub async fn process_pending_signals(&self) -> usize {
        let mut handled = 0;
        loop {
            let next = {
                let mut rx = self.signal_rx.lock().unwrap_or_else(|e| e.into_inner());
                match rx.as_mut() {
                    Some(rx) => rx.try_recv().ok(),
                    None => None,
                }
            };
            let Some(signal) = next else {
                break;
            };
            self.handle_signal(signal).await;
            handled += 1;
        }
        handled
    }

    /// Moves signal handling onto a background task.
    ///
    /// The task ends once the controller is dropped.
    pub fn spawn_signal_loop(self: &Arc<Self>) -> Option<JoinHandle<()>>
    where
        B: 'static,
    {
        let mut rx = self
            .signal_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()?;
        let weak = Arc::downgrade(self);
        Some(tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                let Some(controller) = weak.upgrade() else {
                    break;
                };
                controller.handle_signal(signal).await;
            }
            debug!("Signal loop finished");
        }))
    }

    async fn handle_signal(&self, signal: Signal) {
        let current = self.tree_id();
        if signal.tree_id() != current {
            debug!(signal_tree = signal.tree_id(), current_tree = %current, kind = ?signal.kind(), "Dropping signal for a previous tree");
            return;
        }

        match signal {
            Signal::TreeLoadStateUpdated { state, .. } => self.on_tree_load_state_updated(state).await,
            Signal::DisplayTreeChanged { binding, .. } => self.rebind(binding).await,
            Signal::NodeUpserted { change, .. } => self.on_node_upserted(change).await,
            Signal::NodeRemoved { change, .. } => self.on_node_removed(change).await,
            Signal::SubtreeNodesChanged {
                subtree_root,
                upserted,
                removed,
                ..
            } => {
                self.on_subtree_nodes_changed(subtree_root, upserted, removed)
                    .await
            }
            Signal::StatsUpdated { stats, .. } => self.on_stats_updated(stats),
            Signal::ErrorOccurred { .. } => {}
        }
    }

    // ------------------------------------------------------------------
    // Load lifecycle
    // ------------------------------------------------------------------

    /// Shows a loading row and asks the backend to load the tree.
    ///
    /// Incremental updates stay off until the backend reports the load started.
    pub async fn request_load(&self) {
        let (tree_id, generation) = {
            let mut state = self.lock_state();
            state.generation += 1;
            state.updates_enabled = false;
            state.load_state = LoadState::LoadStarted;
            let root = state.binding.root.clone();
            let placeholder = CachedNode::loading_placeholder(&root.spid);
            state.cache.replace_root_children(root, vec![placeholder]);
            (state.binding.tree_id.clone(), state.generation)
        };
        self.surface.refresh_subtree(Guid::NULL);

        info!(tree_id = %tree_id, generation, "Requesting tree load");
        if let Err(e) = self.backend.start_subtree_load(&tree_id).await {
            error!(tree_id = %tree_id, "Failed to start tree load: {}", e);
            self.fail_load(generation, format!("Failed to load tree: {}", e));
        }
    }

    pub async fn on_tree_load_state_updated(&self, new_state: LoadState) {
        match new_state {
            LoadState::LoadStarted | LoadState::CompletelyLoaded => {
                let populate = {
                    let mut state = self.lock_state();
                    let was_enabled = state.updates_enabled;
                    state.updates_enabled = true;
                    state.load_state = new_state;
                    (!was_enabled).then_some(state.generation)
                };
                info!(tree_id = %self.tree_id(), state = ?new_state, "Tree load state updated");
                if let Some(generation) = populate {
                    self.populate(generation).await;
                }
            }
            LoadState::Error => {
                let generation = self.lock_state().generation;
                self.fail_load(generation, "Backend failed to load tree".to_string());
            }
            LoadState::NotLoaded => {
                let mut state = self.lock_state();
                state.load_state = LoadState::NotLoaded;
                state.updates_enabled = false;
            }
        }
    }

    /// Replaces the view with an inline error row.
    fn fail_load(&self, generation: u64, message: String) {
        let tree_id = {
            let mut state = self.lock_state();
            if state.generation != generation {
                debug!(generation, current = state.generation, "Ignoring failure of a superseded load");
                return;
            }
            state.load_state = LoadState::Error;
            let root = state.binding.root.clone();
            let marker = CachedNode::error_marker(&root.spid, message.clone());
            state.cache.replace_root_children(root, vec![marker]);
            state.binding.tree_id.clone()
        };
        self.surface.refresh_subtree(Guid::NULL);
        self.report_error(&tree_id, message, None);
    }

    pub(crate) fn report_error(&self, tree_id: &str, message: String, secondary: Option<String>) {
        self.bus.publish(
            Signal::ErrorOccurred {
                tree_id: tree_id.to_string(),
                message,
                secondary,
            },
            tree_id,
        );
    }

    pub(crate) async fn fetch_children(&self, parent: &SinglePathIdentifier, tree_id: &str) -> Fetched {
        match self
            .backend
            .get_children(parent, tree_id, Some(self.config.max_displayable_children))
            .await
        {
            Ok(children) => Fetched::Children(children),
            Err(BackendError::TooManyResults { actual }) => Fetched::Capped(actual),
            Err(e) => Fetched::Failed(e),
        }
    }

    /// Turns a fetch outcome into the rows to show under `parent`.
    ///
    /// Failures are reported only while `generation` is still current.
    fn rows_for(
        &self,
        parent: &SinglePathIdentifier,
        tree_id: &str,
        generation: u64,
        fetched: Fetched,
    ) -> Vec<CachedNode> {
        match fetched {
            Fetched::Children(children) => children,
            Fetched::Capped(actual) => {
                debug!(parent = %parent.path, actual, "Too many children to display");
                vec![CachedNode::error_marker(
                    parent,
                    format!("Too many items to display ({})", actual),
                )]
            }
            Fetched::Failed(e) => {
                warn!(parent = %parent.path, "Failed to fetch children: {}", e);
                if self.lock_state().generation == generation {
                    self.report_error(tree_id, format!("Failed to load {}", parent.path), Some(e.to_string()));
                } else {
                    debug!(parent = %parent.path, generation, "Not reporting failure of a superseded fetch");
                }
                vec![CachedNode::error_marker(parent, format!("Error: {}", e))]
            }
        }
    }

    /// Rebuilds the view from scratch, re-expanding the rows the backend remembers.
    async fn populate(&self, generation: u64) {
        let binding = self.binding();
        let tree_id = binding.tree_id.clone();
        let root = binding.root;

        let rows = match self.backend.get_rows_of_interest(&tree_id).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(tree_id = %tree_id, "Failed to fetch rows of interest: {}", e);
                RowsOfInterest::default()
            }
        };

        let top = match self.fetch_children(&root.spid, &tree_id).await {
            Fetched::Failed(e) => {
                error!(tree_id = %tree_id, "Failed to fetch top-level rows: {}", e);
                self.fail_load(generation, format!("Failed to load tree: {}", e));
                return;
            }
            fetched => self.rows_for(&root.spid, &tree_id, generation, fetched),
        };

        let mut frontier = {
            let mut state = self.lock_state();
            if state.generation != generation {
                debug!(generation, current = state.generation, "Discarding stale top-level rows");
                return;
            }
            state.cache.replace_root_children(root, top);
            state.expanded.clear();
            state.selected = rows.selected.clone();
            expandable_rows(&state.cache, Guid::NULL, &rows.expanded)
        };

        // Breadth-first, one level of fetches at a time.
        let mut fetched_rows = 0usize;
        while !frontier.is_empty() {
            let results = join_all(frontier.into_iter().map(|(guid, spid)| {
                let tree_id = tree_id.clone();
                async move {
                    let fetched = self.fetch_children(&spid, &tree_id).await;
                    (guid, spid, fetched)
                }
            }))
            .await;

            let results: Vec<(Guid, Vec<CachedNode>)> = results
                .into_iter()
                .map(|(guid, spid, fetched)| (guid, self.rows_for(&spid, &tree_id, generation, fetched)))
                .collect();

            frontier = {
                let mut state = self.lock_state();
                if state.generation != generation {
                    debug!(generation, current = state.generation, "Discarding stale repopulation results");
                    return;
                }
                let mut next = Vec::new();
                for (guid, children) in results {
                    if !state.cache.contains(guid) {
                        continue;
                    }
                    fetched_rows += children.len();
                    state.cache.set_children(guid, children);
                    state.expanded.insert(guid);
                    next.extend(expandable_rows(&state.cache, guid, &rows.expanded));
                }
                next
            };
        }

        info!(tree_id = %tree_id, fetched_rows, "Repopulated tree");
        self.surface.refresh_subtree(Guid::NULL);
        self.surface.restore_selection(&rows.selected);
    }

    // ------------------------------------------------------------------
    // Push notifications
    // ------------------------------------------------------------------

    /// Applies an upsert. Refreshes the node if it was cached under the same
    /// parent, else its parent. A node that changed parents refreshes both.
    pub async fn on_node_upserted(&self, change: NodeChange) {
        let (refresh, recompute): (Vec<Guid>, Vec<Guid>) = {
            let mut state = self.lock_state();
            if !state.updates_enabled {
                debug!(path = %change.node.spid.path, "Updates disabled; ignoring upsert");
                return;
            }
            match self.apply_upsert(&mut state, change) {
                Upserted::Updated(guid) => (vec![guid], Vec::new()),
                Upserted::Inserted { parent } => (vec![parent], Vec::new()),
                Upserted::Moved { from, to } => {
                    let recompute = if state.binding.has_checkboxes {
                        [from, to].into_iter().filter(|g| !g.is_null()).collect()
                    } else {
                        Vec::new()
                    };
                    (vec![from, to], recompute)
                }
            }
        };

        for parent in recompute {
            self.recompute_after_change(parent).await;
        }
        for guid in refresh {
            self.surface.refresh_subtree(guid);
        }
    }

    /// Applies a removal. Refreshes both the removed row and its parent.
    pub async fn on_node_removed(&self, change: NodeChange) {
        let (guid, parent, recompute) = {
            let mut state = self.lock_state();
            if !state.updates_enabled {
                debug!(path = %change.node.spid.path, "Updates disabled; ignoring removal");
                return;
            }
            let parent = state.parent_key(&change.parent);
            let guid = self.mapper.guid_for_spid(&change.node.spid);
            if !self.drop_row(&mut state, guid) {
                debug!(%guid, "Removed node was not cached");
                return;
            }
            (guid, parent, state.binding.has_checkboxes && !parent.is_null())
        };

        if recompute {
            self.recompute_after_change(parent).await;
        }
        self.surface.refresh_subtree(guid);
        self.surface.refresh_subtree(parent);
    }

    /// Applies a batch of changes below `subtree_root`.
    pub async fn on_subtree_nodes_changed(
        &self,
        subtree_root: SinglePathIdentifier,
        upserted: Vec<NodeChange>,
        removed: Vec<NodeChange>,
    ) {
        let (refresh, recompute) = {
            let mut state = self.lock_state();
            if !state.updates_enabled {
                debug!(path = %subtree_root.path, "Updates disabled; ignoring subtree change");
                return;
            }
            let mut recompute = HashSet::new();
            for change in removed {
                let parent = state.parent_key(&change.parent);
                let guid = self.mapper.guid_for_spid(&change.node.spid);
                if self.drop_row(&mut state, guid) && !parent.is_null() {
                    recompute.insert(parent);
                }
            }
            for change in upserted {
                if let Upserted::Moved { from, to } = self.apply_upsert(&mut state, change) {
                    recompute.extend([from, to].into_iter().filter(|g| !g.is_null()));
                }
            }
            if !state.binding.has_checkboxes {
                recompute.clear();
            }
            (state.parent_key(&subtree_root), recompute)
        };

        for parent in recompute {
            self.recompute_after_change(parent).await;
        }
        self.surface.refresh_subtree(refresh);
    }

    /// Merges backend-computed directory stats.
    pub fn on_stats_updated(&self, stats: Vec<(SinglePathIdentifier, DirStats)>) {
        let merged = {
            let mut state = self.lock_state();
            if !state.updates_enabled {
                return;
            }
            let mut merged = 0usize;
            for (spid, stats) in stats {
                let guid = self.mapper.guid_for_spid(&spid);
                if state.cache.merge_stats(guid, stats) {
                    merged += 1;
                }
            }
            merged
        };
        debug!(merged, "Merged directory stats");
        if merged > 0 {
            self.surface.refresh_subtree(Guid::NULL);
        }
    }

    /// Upserts into the cache. A node already cached under another parent is
    /// removed first, so its subtree and row state go with it.
    fn apply_upsert(&self, state: &mut ControllerState, change: NodeChange) -> Upserted {
        let parent = state.parent_key(&change.parent);
        let guid = self.mapper.guid_for_spid(&change.node.spid);
        if let Some(from) = state.cache.parent_of(guid).filter(|from| *from != parent) {
            debug!(%guid, %from, to = %parent, "Node moved to a new parent");
            self.drop_row(state, guid);
            state.cache.upsert(change.node, parent);
            return Upserted::Moved { from, to: parent };
        }
        if state.cache.upsert(change.node, parent) {
            Upserted::Updated(guid)
        } else {
            Upserted::Inserted { parent }
        }
    }

    /// Recomputes checkbox ancestors after a push; failures were already reported.
    async fn recompute_after_change(&self, parent: Guid) {
        if let Err(e) = self.recompute_upward(parent).await {
            debug!(%parent, "Checkbox recompute abandoned: {}", e);
        }
    }

    fn drop_row(&self, state: &mut ControllerState, guid: Guid) -> bool {
        let dropped = state.cache.remove_descendants(guid);
        for g in &dropped {
            state.expanded.remove(g);
            state.selected.remove(g);
        }
        state.expanded.remove(&guid);
        state.selected.remove(&guid);
        state.checkboxes.forget_subtree(guid);
        state.cache.remove(guid)
    }

    // ------------------------------------------------------------------
    // Root swap
    // ------------------------------------------------------------------

    /// Points the controller at a different tree or root and reloads.
    pub async fn rebind(&self, binding: TreeBinding) {
        let old_tree_id = {
            let mut state = self.lock_state();
            if state.binding == binding {
                debug!(tree_id = %binding.tree_id, "Rebind to the same root; nothing to do");
                return;
            }
            let old = state.binding.tree_id.clone();
            state.binding = binding.clone();
            state.load_state = LoadState::NotLoaded;
            state.updates_enabled = false;
            state.generation += 1;
            state.checkboxes.clear();
            state.expanded.clear();
            state.selected.clear();
            old
        };

        {
            let mut subscriptions = self.lock_subscriptions();
            subscriptions.clear();
            *subscriptions = self.subscribe_for(&binding.tree_id);
        }

        info!(old_tree = %old_tree_id, new_tree = %binding.tree_id, root = %binding.root.spid.path, "Rebound tree controller");
        self.request_load().await;
    }

    // ------------------------------------------------------------------
    // UI actions
    // ------------------------------------------------------------------

    /// Fetches and shows the children of `guid`. Returns the rows now shown.
    pub async fn expand(&self, guid: Guid) -> Vec<CachedNode> {
        let (tree_id, generation, spid) = {
            let state = self.lock_state();
            match state.cache.get(guid) {
                Some(node) if node.is_dir() && !node.node.is_ephemeral() => (
                    state.binding.tree_id.clone(),
                    state.generation,
                    node.spid.clone(),
                ),
                Some(_) => return Vec::new(),
                None => {
                    debug!(%guid, "Cannot expand unknown row");
                    return Vec::new();
                }
            }
        };

        let fetched = self.fetch_children(&spid, &tree_id).await;
        let children = self.rows_for(&spid, &tree_id, generation, fetched);

        let shown = {
            let mut state = self.lock_state();
            if state.generation != generation || !state.cache.contains(guid) {
                debug!(%guid, "Discarding children of a stale or evicted row");
                return Vec::new();
            }
            state.cache.set_children(guid, children);
            state.expanded.insert(guid);
            state.cache.get_children(guid)
        };

        if let Err(e) = self.backend.add_expanded_row(guid, &tree_id).await {
            warn!(%guid, "Failed to record expanded row: {}", e);
        }
        self.surface.refresh_subtree(guid);
        shown
    }

    /// Drops the cached subtree of `guid`.
    pub async fn collapse(&self, guid: Guid) {
        let tree_id = {
            let mut state = self.lock_state();
            if !state.cache.contains(guid) {
                return;
            }
            let mixed = state.binding.has_checkboxes
                && state.checkboxes.state_of(guid, &state.cache) == CheckState::Mixed;
            if state.binding.has_checkboxes && !mixed {
                state.checkboxes.forget_descendants(guid);
            }
            let dropped = state.cache.remove_descendants(guid);
            for g in &dropped {
                state.expanded.remove(g);
            }
            state.expanded.remove(&guid);
            state.binding.tree_id.clone()
        };

        if let Err(e) = self.backend.remove_expanded_row(guid, &tree_id).await {
            warn!(%guid, "Failed to remove expanded row: {}", e);
        }
        self.surface.refresh_subtree(guid);
    }

    /// Records the selection locally and mirrors it to the backend.
    pub async fn set_selected_rows(&self, selected: HashSet<Guid>) {
        let tree_id = {
            let mut state = self.lock_state();
            state.selected = selected.clone();
            state.binding.tree_id.clone()
        };
        if let Err(e) = self.backend.set_selected_rows(&selected, &tree_id).await {
            warn!(tree_id = %tree_id, "Failed to mirror selection: {}", e);
        }
    }
}

/// Children of `parent` that should be re-expanded.
fn expandable_rows(
    cache: &NodeCache,
    parent: Guid,
    expanded: &HashSet<Guid>,
) -> Vec<(Guid, SinglePathIdentifier)> {
    cache
        .child_guids(parent)
        .iter()
        .filter(|guid| expanded.contains(*guid))
        .filter_map(|guid| cache.get(*guid).map(|node| (*guid, node)))
        .filter(|(_, node)| node.is_dir() && !node.node.is_ephemeral())
        .map(|(guid, node)| (guid, node.spid.clone()))
        .collect()
}
