//! End-to-end tests for tree-sync.
//!
//! Drives a TreeController against the in-memory backend: loading, lazy
//! expansion, push notifications, root swaps and checkbox propagation.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tree_sync::{
    Backend, BackendError, CachedNode, CheckState, ControllerConfig, ControllerError, Guid,
    IdentityMapper, InMemoryBackend, LoadState, Node, NullSurface, SenderFilter, Signal,
    SignalDispatcher, SignalKind, SinglePathIdentifier, Subscription, TreeBinding, TreeController,
    TreeKind,
};

const KIND: TreeKind = TreeKind::RemoteStorage;

fn spid(uid: u64, path: &str) -> SinglePathIdentifier {
    SinglePathIdentifier::new(KIND, uid, path)
}

fn name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn dir(uid: u64, path: &str) -> CachedNode {
    CachedNode::new(spid(uid, path), Node::dir(spid(uid, path), name_of(path)))
}

fn file(uid: u64, path: &str) -> CachedNode {
    CachedNode::new(spid(uid, path), Node::file(spid(uid, path), name_of(path), 10))
}

fn names(rows: &[CachedNode]) -> Vec<String> {
    rows.iter().map(|r| r.name().to_string()).collect()
}

struct Harness {
    bus: Arc<SignalDispatcher>,
    backend: Arc<InMemoryBackend>,
    controller: TreeController<Arc<InMemoryBackend>>,
}

impl Harness {
    /// Tree "t":
    ///
    /// ```text
    /// /r
    ///   A/      A1, A2
    ///   D/      X, Y, Z
    ///   P/      Q/ (q1, q2), S
    ///   B
    /// ```
    fn new(has_checkboxes: bool) -> Self {
        let bus = Arc::new(SignalDispatcher::new());
        let backend = Arc::new(InMemoryBackend::new(Arc::clone(&bus)));
        let root = dir(1, "/r");
        backend.add_tree("t", root.clone());
        backend.set_children(
            "t",
            &root.spid,
            vec![dir(10, "/r/A"), dir(11, "/r/D"), dir(12, "/r/P"), file(13, "/r/B")],
        );
        backend.set_children("t", &spid(10, "/r/A"), vec![file(20, "/r/A/A1"), file(21, "/r/A/A2")]);
        backend.set_children(
            "t",
            &spid(11, "/r/D"),
            vec![file(30, "/r/D/X"), file(31, "/r/D/Y"), file(32, "/r/D/Z")],
        );
        backend.set_children("t", &spid(12, "/r/P"), vec![dir(40, "/r/P/Q"), file(41, "/r/P/S")]);
        backend.set_children("t", &spid(40, "/r/P/Q"), vec![file(50, "/r/P/Q/q1"), file(51, "/r/P/Q/q2")]);

        let controller = TreeController::new(
            TreeBinding::new("t", root, has_checkboxes),
            Arc::clone(&backend),
            Arc::clone(&bus),
            Arc::new(IdentityMapper::new()),
            Arc::new(NullSurface),
            ControllerConfig::default(),
        );
        Self {
            bus,
            backend,
            controller,
        }
    }

    async fn loaded(has_checkboxes: bool) -> Self {
        let harness = Self::new(has_checkboxes);
        harness.controller.request_load().await;
        harness.controller.process_pending_signals().await;
        assert_eq!(harness.controller.load_state(), LoadState::CompletelyLoaded);
        harness
    }

    /// GUID of the top-level or nested row called `name` among the cached children of `parent`.
    fn row(&self, parent: Guid, name: &str) -> Guid {
        let node = self
            .controller
            .children(parent)
            .into_iter()
            .find(|c| c.name() == name)
            .unwrap_or_else(|| panic!("no row {name} under {parent}"));
        self.controller.guid_of(&node)
    }

    /// Collects the messages of `ErrorOccurred` signals for tree "t".
    fn record_errors(&self) -> (Arc<Mutex<Vec<String>>>, Subscription) {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let errors_clone = Arc::clone(&errors);
        let subscription = self.bus.subscribe(
            SignalKind::ErrorOccurred,
            "test",
            SenderFilter::only("t"),
            move |signal| {
                if let Signal::ErrorOccurred { message, .. } = signal {
                    errors_clone.lock().unwrap().push(message.clone());
                }
                Ok(())
            },
        );
        (errors, subscription)
    }

    async fn checked_paths(&self) -> HashSet<String> {
        self.controller
            .collect_checked_subset()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.path)
            .collect()
    }

    async fn expand_path(&self, names: &[&str]) -> Guid {
        let mut guid = Guid::NULL;
        for name in names {
            guid = self.row(guid, name);
            self.controller.expand(guid).await;
        }
        guid
    }
}

#[tokio::test]
async fn test_load_populates_top_level() {
    let h = Harness::loaded(false).await;
    assert_eq!(names(&h.controller.children(Guid::NULL)), vec!["A", "D", "P", "B"]);
    // Remote-storage rows get minted GUIDs
    assert!(h.row(Guid::NULL, "A").as_i64() < 0);
}

#[tokio::test]
async fn test_collapse_and_reexpand_round_trip() {
    let h = Harness::loaded(false).await;
    let a = h.expand_path(&["A"]).await;
    let before: Vec<Guid> = h.controller.children(a).iter().map(|c| h.controller.guid_of(c)).collect();
    assert_eq!(before.len(), 2);
    assert!(h.backend.rows_of_interest("t").expanded.contains(&a));

    h.controller.collapse(a).await;
    assert_eq!(h.controller.child_count(a), 0);
    assert!(h.controller.node(before[0]).is_none());
    assert!(!h.backend.rows_of_interest("t").expanded.contains(&a));

    h.controller.expand(a).await;
    let after: Vec<Guid> = h.controller.children(a).iter().map(|c| h.controller.guid_of(c)).collect();
    assert_eq!(after, before);
}

#[tokio::test]
async fn test_duplicate_upserts_are_idempotent() {
    let h = Harness::loaded(false).await;
    let a = h.expand_path(&["A"]).await;

    h.backend.upsert_node("t", &spid(10, "/r/A"), file(22, "/r/A/A3"));
    h.backend.upsert_node("t", &spid(10, "/r/A"), file(22, "/r/A/A3"));
    h.controller.process_pending_signals().await;

    assert_eq!(names(&h.controller.children(a)), vec!["A1", "A2", "A3"]);
}

#[tokio::test]
async fn test_removal_of_uncached_node_is_noop() {
    let h = Harness::loaded(false).await;
    let d = h.row(Guid::NULL, "D");

    h.backend.remove_node("t", &spid(11, "/r/D"), &file(30, "/r/D/X"));
    h.controller.process_pending_signals().await;

    assert_eq!(h.controller.child_count(Guid::NULL), 4);
    assert_eq!(names(&h.controller.expand(d).await), vec!["Y", "Z"]);
}

#[tokio::test(start_paused = true)]
async fn test_stale_expand_is_discarded_after_reload() {
    let h = Harness::loaded(false).await;
    let a = h.row(Guid::NULL, "A");
    h.backend.set_latency(Some(Duration::from_millis(50)));

    let (shown, _) = tokio::join!(h.controller.expand(a), h.controller.request_load());
    assert!(shown.is_empty());

    h.backend.set_latency(None);
    h.controller.process_pending_signals().await;
    let a = h.row(Guid::NULL, "A");
    assert_eq!(h.controller.child_count(a), 0);
    assert!(!h.controller.is_expanded(a));
}

#[tokio::test(start_paused = true)]
async fn test_failure_of_superseded_expand_is_not_reported() {
    let h = Harness::loaded(false).await;
    let (errors, _sub) = h.record_errors();
    let a = h.row(Guid::NULL, "A");
    h.backend.set_latency(Some(Duration::from_millis(50)));

    // The failure lands on the expand, which answers after the reload began
    let (shown, _) = tokio::join!(h.controller.expand(a), async {
        h.controller.request_load().await;
        h.backend.fail_next(BackendError::Unavailable("late".into()));
    });
    assert!(shown.is_empty());
    assert!(errors.lock().unwrap().is_empty());

    h.backend.set_latency(None);
    h.controller.process_pending_signals().await;
    assert_eq!(h.controller.load_state(), LoadState::CompletelyLoaded);
    assert!(errors.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_display_tree_changed_rebinds() {
    let h = Harness::loaded(false).await;
    let other_root = dir(100, "/other");
    h.backend.add_tree("u", other_root.clone());
    h.backend.set_children("u", &other_root.spid, vec![file(101, "/other/only")]);

    h.bus.publish(
        Signal::DisplayTreeChanged {
            tree_id: "t".into(),
            binding: TreeBinding::new("u", other_root, false),
        },
        "t",
    );
    h.controller.process_pending_signals().await;
    h.controller.process_pending_signals().await;

    assert_eq!(h.controller.tree_id(), "u");
    assert_eq!(h.controller.load_state(), LoadState::CompletelyLoaded);
    assert_eq!(names(&h.controller.children(Guid::NULL)), vec!["only"]);

    // Old tree's notifications no longer reach the controller
    h.backend.upsert_node("t", &spid(1, "/r"), file(14, "/r/late"));
    assert_eq!(h.controller.process_pending_signals().await, 0);
    assert_eq!(h.bus.listener_count(SignalKind::NodeUpserted), 1);
}

#[tokio::test]
async fn test_error_signal_published_on_failed_expand() {
    let h = Harness::loaded(false).await;
    let (errors, _sub) = h.record_errors();

    let a = h.row(Guid::NULL, "A");
    h.backend.fail_next(BackendError::Unavailable("disk gone".into()));
    let shown = h.controller.expand(a).await;

    assert_eq!(shown.len(), 1);
    assert!(shown[0].node.is_ephemeral());
    assert_eq!(errors.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_signal_loop_applies_updates() {
    let h = Harness::new(false);
    let controller = Arc::new(h.controller);
    let handle = controller.spawn_signal_loop().unwrap();
    assert!(controller.spawn_signal_loop().is_none());

    controller.request_load().await;
    for _ in 0..100 {
        if controller.load_state() == LoadState::CompletelyLoaded {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(controller.load_state(), LoadState::CompletelyLoaded);
    assert_eq!(controller.child_count(Guid::NULL), 4);

    drop(controller);
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_checkboxes_disabled() {
    let h = Harness::loaded(false).await;
    let a = h.row(Guid::NULL, "A");
    assert!(matches!(
        h.controller.toggle_checkbox(a, true).await,
        Err(ControllerError::CheckboxesDisabled(_))
    ));
    assert_eq!(h.controller.checkbox_state(a), None);
}

#[tokio::test]
async fn test_mixed_then_checked_directory() {
    let h = Harness::loaded(true).await;
    let d = h.expand_path(&["D"]).await;
    let x = h.row(d, "X");
    let y = h.row(d, "Y");
    let z = h.row(d, "Z");

    h.controller.toggle_checkbox(x, true).await.unwrap();
    assert_eq!(h.controller.checkbox_state(d), Some(CheckState::Mixed));
    assert_eq!(h.controller.checkbox_state(y), Some(CheckState::Unchecked));

    h.controller.toggle_checkbox(y, true).await.unwrap();
    h.controller.toggle_checkbox(z, false).await.unwrap();
    assert_eq!(h.controller.checkbox_state(d), Some(CheckState::Mixed));

    h.controller.toggle_checkbox(z, true).await.unwrap();
    assert_eq!(h.controller.checkbox_state(d), Some(CheckState::Checked));
}

#[tokio::test]
async fn test_checking_directory_cascades_and_unchecking_child_mixes_it() {
    let h = Harness::loaded(true).await;
    let d = h.expand_path(&["D"]).await;

    h.controller.toggle_checkbox(d, true).await.unwrap();
    for name in ["X", "Y", "Z"] {
        assert_eq!(h.controller.checkbox_state(h.row(d, name)), Some(CheckState::Checked));
    }

    h.controller.toggle_checkbox(h.row(d, "Y"), false).await.unwrap();
    assert_eq!(h.controller.checkbox_state(d), Some(CheckState::Mixed));
    assert_eq!(h.controller.checkbox_state(h.row(d, "X")), Some(CheckState::Checked));
}

#[tokio::test]
async fn test_mixed_state_survives_collapse() {
    let h = Harness::loaded(true).await;
    let p = h.expand_path(&["P"]).await;
    let q = h.expand_path(&["P", "Q"]).await;

    h.controller.toggle_checkbox(h.row(q, "q1"), true).await.unwrap();
    assert_eq!(h.controller.checkbox_state(q), Some(CheckState::Mixed));
    assert_eq!(h.controller.checkbox_state(p), Some(CheckState::Mixed));

    // S is checked while Q's children are no longer cached
    h.controller.collapse(q).await;
    h.controller.toggle_checkbox(h.row(p, "S"), true).await.unwrap();
    assert_eq!(h.controller.checkbox_state(p), Some(CheckState::Mixed));

    assert_eq!(
        h.checked_paths().await,
        HashSet::from(["/r/P/S".to_string(), "/r/P/Q/q1".to_string()])
    );
}

#[tokio::test]
async fn test_parent_state_follows_backend_children_not_cache() {
    let h = Harness::loaded(true).await;
    let d = h.expand_path(&["D"]).await;

    // W exists remotely but was never pushed, so it is not cached
    h.backend.set_children(
        "t",
        &spid(11, "/r/D"),
        vec![file(30, "/r/D/X"), file(31, "/r/D/Y"), file(32, "/r/D/Z"), file(33, "/r/D/W")],
    );
    for name in ["X", "Y", "Z"] {
        h.controller.toggle_checkbox(h.row(d, name), true).await.unwrap();
    }

    assert_eq!(h.controller.child_count(d), 3);
    assert_eq!(h.controller.checkbox_state(d), Some(CheckState::Mixed));
    assert_eq!(
        h.checked_paths().await,
        HashSet::from(["/r/D/X".to_string(), "/r/D/Y".to_string(), "/r/D/Z".to_string()])
    );
}

#[tokio::test]
async fn test_failed_checkbox_propagation_is_reported() {
    let h = Harness::loaded(true).await;
    let (errors, _sub) = h.record_errors();
    let a = h.expand_path(&["A"]).await;
    let a1 = h.row(a, "A1");

    h.backend.fail_next(BackendError::Unavailable("offline".into()));
    assert!(matches!(
        h.controller.toggle_checkbox(a1, true).await,
        Err(ControllerError::Backend(BackendError::Unavailable(_)))
    ));
    assert_eq!(errors.lock().unwrap().len(), 1);

    // Retrying once the backend is back repairs the parent
    h.controller.toggle_checkbox(a1, true).await.unwrap();
    assert_eq!(h.controller.checkbox_state(a), Some(CheckState::Mixed));
    assert_eq!(errors.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_checked_subset_fails_instead_of_truncating() {
    let h = Harness::loaded(true).await;
    let (errors, _sub) = h.record_errors();
    h.controller.toggle_checkbox(h.row(Guid::NULL, "D"), true).await.unwrap();
    let a = h.expand_path(&["A"]).await;
    h.controller.toggle_checkbox(h.row(a, "A1"), true).await.unwrap();

    h.backend.fail_next(BackendError::Unavailable("offline".into()));
    assert!(matches!(
        h.controller.collect_checked_subset().await,
        Err(ControllerError::Backend(_))
    ));
    assert_eq!(errors.lock().unwrap().len(), 1);

    assert_eq!(
        h.checked_paths().await,
        HashSet::from([
            "/r/D".to_string(),
            "/r/D/X".to_string(),
            "/r/D/Y".to_string(),
            "/r/D/Z".to_string(),
            "/r/A/A1".to_string(),
        ])
    );
}

#[tokio::test]
async fn test_checked_subset_includes_uncached_descendants() {
    let h = Harness::loaded(true).await;
    let a = h.row(Guid::NULL, "A");
    h.controller.toggle_checkbox(a, true).await.unwrap();

    let checked: Vec<String> = h
        .controller
        .collect_checked_subset()
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.path)
        .collect();
    assert_eq!(checked, vec!["/r/A", "/r/A/A1", "/r/A/A2"]);
}

#[tokio::test]
async fn test_backend_trait_object() {
    let bus = Arc::new(SignalDispatcher::new());
    let backend: Arc<dyn Backend> = Arc::new(InMemoryBackend::new(bus));
    assert!(backend.start_subtree_load("missing").await.is_err());
}
