//! Signal infrastructure for tree-sync.
//!
//! Provides `Signal`, the closed set of notifications exchanged between the
//! backend and controllers, and `SignalDispatcher` for keyed subscriptions
//! with per-listener sender filtering.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tracing::{error, warn};

use crate::controller::{LoadState, TreeBinding};
use crate::node::{CachedNode, DirStats, SinglePathIdentifier};

/// Subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalKind {
    TreeLoadStateUpdated,
    DisplayTreeChanged,
    NodeUpserted,
    NodeRemoved,
    SubtreeNodesChanged,
    StatsUpdated,
    ErrorOccurred,
}

/// A node together with the parent it is listed under.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeChange {
    pub parent: SinglePathIdentifier,
    pub node: CachedNode,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Signal {
    /// The backend's load of a tree moved to a new state.
    #[serde(rename_all = "camelCase")]
    TreeLoadStateUpdated { tree_id: String, state: LoadState },
    /// The tree shown under `tree_id` now has a different root.
    #[serde(rename_all = "camelCase")]
    DisplayTreeChanged { tree_id: String, binding: TreeBinding },
    #[serde(rename_all = "camelCase")]
    NodeUpserted { tree_id: String, change: NodeChange },
    #[serde(rename_all = "camelCase")]
    NodeRemoved { tree_id: String, change: NodeChange },
    /// Batch of changes below `subtree_root`.
    #[serde(rename_all = "camelCase")]
    SubtreeNodesChanged {
        tree_id: String,
        subtree_root: SinglePathIdentifier,
        upserted: Vec<NodeChange>,
        removed: Vec<NodeChange>,
    },
    #[serde(rename_all = "camelCase")]
    StatsUpdated {
        tree_id: String,
        stats: Vec<(SinglePathIdentifier, DirStats)>,
    },
    /// Something the user should hear about (toast-style).
    #[serde(rename_all = "camelCase")]
    ErrorOccurred {
        tree_id: String,
        message: String,
        secondary: Option<String>,
    },
}

impl Signal {
    pub fn kind(&self) -> SignalKind {
        match self {
            Signal::TreeLoadStateUpdated { .. } => SignalKind::TreeLoadStateUpdated,
            Signal::DisplayTreeChanged { .. } => SignalKind::DisplayTreeChanged,
            Signal::NodeUpserted { .. } => SignalKind::NodeUpserted,
            Signal::NodeRemoved { .. } => SignalKind::NodeRemoved,
            Signal::SubtreeNodesChanged { .. } => SignalKind::SubtreeNodesChanged,
            Signal::StatsUpdated { .. } => SignalKind::StatsUpdated,
            Signal::ErrorOccurred { .. } => SignalKind::ErrorOccurred,
        }
    }

    pub fn tree_id(&self) -> &str {
        match self {
            Signal::TreeLoadStateUpdated { tree_id, .. }
            | Signal::DisplayTreeChanged { tree_id, .. }
            | Signal::NodeUpserted { tree_id, .. }
            | Signal::NodeRemoved { tree_id, .. }
            | Signal::SubtreeNodesChanged { tree_id, .. }
            | Signal::StatsUpdated { tree_id, .. }
            | Signal::ErrorOccurred { tree_id, .. } => tree_id,
        }
    }
}

/// Which senders a listener wants to hear from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SenderFilter {
    #[default]
    Any,
    Only(HashSet<String>),
    Except(HashSet<String>),
}

impl SenderFilter {
    pub fn only(sender: impl Into<String>) -> Self {
        SenderFilter::Only(HashSet::from([sender.into()]))
    }

    pub fn except(sender: impl Into<String>) -> Self {
        SenderFilter::Except(HashSet::from([sender.into()]))
    }

    pub fn accepts(&self, sender: &str) -> bool {
        match self {
            SenderFilter::Any => true,
            SenderFilter::Only(senders) => senders.contains(sender),
            SenderFilter::Except(senders) => !senders.contains(sender),
        }
    }
}

pub type ListenerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

type Callback = Arc<dyn Fn(&Signal) -> ListenerResult + Send + Sync>;

struct Listener {
    id: usize,
    filter: SenderFilter,
    callback: Callback,
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Hold this value to keep receiving signals. If the same
/// `(kind, listener_id)` was registered again in the meantime, dropping the
/// older handle leaves the newer registration alone.
pub struct Subscription {
    bus: Weak<SignalDispatcher>,
    kind: SignalKind,
    listener_id: String,
    id: usize,
}

impl Subscription {
    pub fn kind(&self) -> SignalKind {
        self.kind
    }

    pub fn listener_id(&self) -> &str {
        &self.listener_id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.kind, &self.listener_id, self.id);
        }
    }
}

/// Publish/subscribe bus keyed by signal kind.
///
/// Thread-safe. Wrap in `Arc` to enable subscriptions.
pub struct SignalDispatcher {
    listeners: RwLock<HashMap<SignalKind, HashMap<String, Listener>>>,
    next_id: AtomicUsize,
}

impl Default for SignalDispatcher {
    fn default() -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl SignalDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` for `kind` under `listener_id`.
    ///
    /// Registering the same pair again replaces the earlier callback.
    pub fn subscribe(
        self: &Arc<Self>,
        kind: SignalKind,
        listener_id: impl Into<String>,
        filter: SenderFilter,
        callback: impl Fn(&Signal) -> ListenerResult + Send + Sync + 'static,
    ) -> Subscription {
        let listener_id = listener_id.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let replaced = self
            .listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(kind)
            .or_default()
            .insert(
                listener_id.clone(),
                Listener {
                    id,
                    filter,
                    callback: Arc::new(callback),
                },
            );
        if replaced.is_some() {
            warn!(?kind, listener_id = %listener_id, "Listener re-registered; previous subscription overwritten");
        }

        Subscription {
            bus: Arc::downgrade(self),
            kind,
            listener_id,
            id,
        }
    }

    fn unsubscribe(&self, kind: SignalKind, listener_id: &str, id: usize) {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        if let Some(by_id) = listeners.get_mut(&kind) {
            if by_id.get(listener_id).is_some_and(|l| l.id == id) {
                by_id.remove(listener_id);
            }
        }
    }

    /// Removes every registration held by `listener_id`.
    pub fn disconnect_all(&self, listener_id: &str) {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        for by_id in listeners.values_mut() {
            by_id.remove(listener_id);
        }
    }

    pub fn listener_count(&self, kind: SignalKind) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    /// Delivers `signal` synchronously to every accepting listener.
    ///
    /// A failing or panicking listener is logged and skipped.
    pub fn publish(&self, signal: Signal, sender_id: &str) {
        let kind = signal.kind();
        // Collect first so callbacks may subscribe or publish without deadlocking.
        let targets: Vec<(String, Callback)> = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .map(|by_id| {
                by_id
                    .iter()
                    .filter(|(_, l)| l.filter.accepts(sender_id))
                    .map(|(listener_id, l)| (listener_id.clone(), Arc::clone(&l.callback)))
                    .collect()
            })
            .unwrap_or_default();

        for (listener_id, callback) in targets {
            match panic::catch_unwind(AssertUnwindSafe(|| callback(&signal))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(?kind, listener_id = %listener_id, sender = %sender_id, "Listener failed: {}", e);
                }
                Err(_) => {
                    error!(?kind, listener_id = %listener_id, sender = %sender_id, "Listener panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn error_signal(tree_id: &str) -> Signal {
        Signal::ErrorOccurred {
            tree_id: tree_id.into(),
            message: "boom".into(),
            secondary: None,
        }
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&Signal) -> ListenerResult + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        (count, move |_: &Signal| {
            count_clone.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
    }

    #[test]
    fn test_subscribe_and_publish() {
        let bus = Arc::new(SignalDispatcher::new());
        let (count, cb) = counter();
        let _sub = bus.subscribe(SignalKind::ErrorOccurred, "ui", SenderFilter::Any, cb);

        bus.publish(error_signal("t1"), "t1");
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_only_matching_kind_is_delivered() {
        let bus = Arc::new(SignalDispatcher::new());
        let (count, cb) = counter();
        let _sub = bus.subscribe(SignalKind::NodeUpserted, "ui", SenderFilter::Any, cb);

        bus.publish(error_signal("t1"), "t1");
        assert_eq!(count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_sender_whitelist_and_blacklist() {
        let bus = Arc::new(SignalDispatcher::new());
        let (only_count, only_cb) = counter();
        let (except_count, except_cb) = counter();
        let _a = bus.subscribe(SignalKind::ErrorOccurred, "a", SenderFilter::only("t1"), only_cb);
        let _b = bus.subscribe(SignalKind::ErrorOccurred, "b", SenderFilter::except("t1"), except_cb);

        bus.publish(error_signal("t1"), "t1");
        bus.publish(error_signal("t2"), "t2");

        assert_eq!(only_count.load(Ordering::Relaxed), 1);
        assert_eq!(except_count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_subscription_unsubscribes_on_drop() {
        let bus = Arc::new(SignalDispatcher::new());
        let (count, cb) = counter();
        {
            let _sub = bus.subscribe(SignalKind::ErrorOccurred, "ui", SenderFilter::Any, cb);
            bus.publish(error_signal("t1"), "t1");
        }
        bus.publish(error_signal("t1"), "t1");
        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert_eq!(bus.listener_count(SignalKind::ErrorOccurred), 0);
    }

    #[test]
    fn test_reregistering_overwrites_and_old_handle_is_inert() {
        let bus = Arc::new(SignalDispatcher::new());
        let (first, first_cb) = counter();
        let (second, second_cb) = counter();

        let old = bus.subscribe(SignalKind::ErrorOccurred, "ui", SenderFilter::Any, first_cb);
        let _new = bus.subscribe(SignalKind::ErrorOccurred, "ui", SenderFilter::Any, second_cb);
        assert_eq!(bus.listener_count(SignalKind::ErrorOccurred), 1);

        drop(old);
        bus.publish(error_signal("t1"), "t1");

        assert_eq!(first.load(Ordering::Relaxed), 0);
        assert_eq!(second.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_failing_listeners_do_not_stop_delivery() {
        let bus = Arc::new(SignalDispatcher::new());
        let (count, cb) = counter();
        let _err = bus.subscribe(SignalKind::ErrorOccurred, "err", SenderFilter::Any, |_| {
            Err("listener refused".into())
        });
        let _panic = bus.subscribe(SignalKind::ErrorOccurred, "panic", SenderFilter::Any, |_| {
            panic!("listener blew up")
        });
        let _ok = bus.subscribe(SignalKind::ErrorOccurred, "ok", SenderFilter::Any, cb);

        bus.publish(error_signal("t1"), "t1");
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_disconnect_all() {
        let bus = Arc::new(SignalDispatcher::new());
        let (count, cb) = counter();
        let (count2, cb2) = counter();
        let _a = bus.subscribe(SignalKind::ErrorOccurred, "ctl", SenderFilter::Any, cb);
        let _b = bus.subscribe(SignalKind::NodeRemoved, "ctl", SenderFilter::Any, cb2);

        bus.disconnect_all("ctl");
        bus.publish(error_signal("t1"), "t1");
        assert_eq!(count.load(Ordering::Relaxed), 0);
        assert_eq!(count2.load(Ordering::Relaxed), 0);
        assert_eq!(bus.listener_count(SignalKind::NodeRemoved), 0);
    }

    #[test]
    fn test_no_replay_for_late_subscribers() {
        let bus = Arc::new(SignalDispatcher::new());
        bus.publish(error_signal("t1"), "t1");
        let (count, cb) = counter();
        let _sub = bus.subscribe(SignalKind::ErrorOccurred, "late", SenderFilter::Any, cb);
        assert_eq!(count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_signal_serialization() {
        let json = serde_json::to_string(&error_signal("t1")).unwrap();
        assert!(json.contains("\"type\":\"errorOccurred\""));
        assert!(json.contains("\"treeId\":\"t1\""));
    }
}
