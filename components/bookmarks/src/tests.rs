/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! End-to-end scenarios against a scripted in-memory backend: offline
//! dispatch and catch-up sync, cross-tab fan-out, server-originated
//! deletes, baseline hydration superseding local drift, and the
//! replay/idempotence laws.

use crate::backend::{Backend, DeliveryOutcome, EventStream, StreamEvent, SubtreeBaseline};
use crate::bus::BusMessage;
use crate::config::KernelConfig;
use crate::error::{Error, Result};
use crate::guid::Guid;
use crate::kernel::SyncKernel;
use crate::oplog::{replay, OpEnvelope, Operation};
use crate::stream::SseState;
use crate::tree::{NodeData, NodeKind, NodeSnapshot, ROOT_GUID};
use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

#[derive(Default)]
struct MockBackend {
    reachable: AtomicBool,
    fail_deliveries: AtomicBool,
    deliveries: Mutex<Vec<OpEnvelope>>,
    duplicate_ids: Mutex<HashSet<Guid>>,
    baseline: Mutex<Option<SubtreeBaseline>>,
    stream_tx: Mutex<Option<tokio::sync::mpsc::UnboundedSender<StreamEvent>>>,
}

impl MockBackend {
    fn new() -> Arc<Self> {
        let mock = MockBackend::default();
        mock.reachable.store(true, Ordering::SeqCst);
        Arc::new(mock)
    }

    fn delivered_ids(&self) -> Vec<Guid> {
        self.deliveries.lock().iter().map(|e| e.id.clone()).collect()
    }

    fn set_baseline(&self, node: NodeData, children: Vec<NodeData>) {
        *self.baseline.lock() = Some(SubtreeBaseline { node, children });
    }

    fn push_event(&self, event: StreamEvent) {
        let tx = self.stream_tx.lock();
        tx.as_ref()
            .expect("stream not open")
            .send(event)
            .expect("stream receiver dropped");
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn deliver(&self, _namespace: &str, envelope: &OpEnvelope) -> Result<DeliveryOutcome> {
        self.deliveries.lock().push(envelope.clone());
        if self.fail_deliveries.load(Ordering::SeqCst) {
            return Ok(DeliveryOutcome::Failure {
                status: Some(503),
                message: "service unavailable".into(),
            });
        }
        if self.duplicate_ids.lock().contains(&envelope.id) {
            return Ok(DeliveryOutcome::Duplicate);
        }
        Ok(DeliveryOutcome::Success { data: None })
    }

    async fn fetch_subtree(&self, _namespace: &str, _node: &Guid) -> Result<SubtreeBaseline> {
        match self.baseline.lock().clone() {
            Some(baseline) => Ok(baseline),
            None => Err(Error::StreamError("no baseline scripted".into())),
        }
    }

    async fn open_stream(&self, _namespace: &str) -> Result<EventStream> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        *self.stream_tx.lock() = Some(tx);
        Ok(Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (Ok(event), rx))
        })))
    }

    async fn probe(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}

fn test_config() -> KernelConfig {
    let mut config = KernelConfig::new(
        "ns-test",
        Url::parse("https://sync.example.com/api").unwrap(),
    );
    config.timeout_ms = 1000;
    config.sync.batch_window_ms = 10;
    config.sync.retry_delays_ms = vec![20, 20, 20];
    config.sync.max_retries = 3;
    // Keep the periodic probe out of short tests.
    config.reachability.interval_ms = 3_600_000;
    config
}

async fn new_kernel(backend: Arc<MockBackend>) -> SyncKernel {
    let _ = env_logger::try_init();
    SyncKernel::new(test_config(), backend).await.unwrap()
}

/// Polls until `check` passes or a generous deadline hits.
async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_for_drain(kernel: &SyncKernel) {
    let shared = Arc::clone(kernel.shared());
    wait_until("pending operations to drain", move || {
        shared.sync_status_snapshot().pending_count == 0
    })
    .await;
}

fn folder_data(id: &str, parent: Option<&str>) -> NodeData {
    NodeData {
        id: id.into(),
        parent_id: parent.map(Guid::from),
        kind: NodeKind::Folder,
        title: format!("folder {}", id),
        url: None,
        is_open: true,
        is_loaded: false,
        order_key: None,
        created_at: None,
        updated_at: None,
    }
}

fn bookmark_data(id: &str, parent: &str) -> NodeData {
    NodeData {
        id: id.into(),
        parent_id: Some(parent.into()),
        kind: NodeKind::Bookmark,
        title: format!("bookmark {}", id),
        url: Some(format!("https://example.com/{}", id)),
        is_open: false,
        is_loaded: false,
        order_key: None,
        created_at: None,
        updated_at: None,
    }
}

fn json_event(kind: &str, id: &str, payload: serde_json::Value) -> StreamEvent {
    StreamEvent {
        event: kind.into(),
        id: Some(id.into()),
        data: payload.to_string(),
    }
}

#[tokio::test]
async fn offline_create_then_reconnect_ships_the_envelope() {
    let backend = MockBackend::new();
    let kernel = new_kernel(Arc::clone(&backend)).await;

    kernel.set_online(false).await;
    let folder = kernel.create_folder(None, "A", None).await.unwrap();

    let status = kernel.get_sync_status().await;
    assert_eq!(status.pending_count, 1);
    assert!(!status.is_online);

    // The batch window fires while offline; nothing may go out.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(backend.deliveries.lock().is_empty());

    kernel.set_online(true).await;
    wait_for_drain(&kernel).await;

    let log = kernel.get_operation_log().await;
    let env = log.iter().find(|e| *e.op.target() == folder).unwrap();
    assert!(env.processed);
    assert_eq!(backend.deliveries.lock().len(), 1);
    // Delivery acknowledged; the tree itself is untouched by syncing.
    assert!(kernel.get_node(&folder).await.is_some());
}

#[tokio::test]
async fn fanout_reaches_a_second_tab() {
    let backend = MockBackend::new();
    let kernel = new_kernel(backend).await;
    let mut tab2 = kernel.subscribe();

    let bookmark = kernel
        .create_bookmark(None, "x", "https://example.com/u", None)
        .await
        .unwrap();

    // The first message out is the applied operation.
    let msg = tab2.recv().await.unwrap();
    match msg {
        BusMessage::OperationProcessed { envelope } => {
            assert_eq!(envelope.op.target(), &bookmark);
            assert!(!envelope.remote);
        }
        other => panic!("expected operation_processed, got {:?}", other),
    }

    let tree = kernel.get_tree().await;
    let child = tree
        .children
        .iter()
        .find(|c| c.id == bookmark)
        .expect("bookmark visible at the root");
    assert_eq!(child.url.as_deref(), Some("https://example.com/u"));
}

#[tokio::test]
async fn server_delete_removes_the_whole_subtree() {
    let backend = MockBackend::new();
    let kernel = new_kernel(backend).await;

    let f = kernel.create_folder(None, "F", None).await.unwrap();
    let b1 = kernel
        .create_bookmark(Some(f.clone()), "b1", "https://example.com/1", None)
        .await
        .unwrap();
    let b2 = kernel
        .create_bookmark(Some(f.clone()), "b2", "https://example.com/2", None)
        .await
        .unwrap();
    let sub = kernel.create_folder(Some(f.clone()), "sub", None).await.unwrap();
    let b3 = kernel
        .create_bookmark(Some(sub.clone()), "b3", "https://example.com/3", None)
        .await
        .unwrap();

    kernel.shared().handle_stream_event(json_event(
        "folder_deleted",
        "ev-del-1",
        serde_json::json!({"id": f.as_str()}),
    ));

    for gone in [&f, &b1, &b2, &sub, &b3] {
        assert!(kernel.get_node(gone).await.is_none(), "{} should be gone", gone);
    }
    let log = kernel.get_operation_log().await;
    let removals: Vec<_> = log
        .iter()
        .filter(|e| matches!(e.op, Operation::RemoveNode { .. }))
        .collect();
    assert_eq!(removals.len(), 1);
    assert!(removals[0].remote);
    assert_eq!(removals[0].id.as_str(), "ev-del-1");
}

#[tokio::test]
async fn reorder_only_rekeys_the_moved_sibling() {
    let backend = MockBackend::new();
    let kernel = new_kernel(backend).await;
    let root: Guid = ROOT_GUID.into();

    let a = kernel
        .create_bookmark(None, "a", "https://example.com/a", None)
        .await
        .unwrap();
    let b = kernel
        .create_bookmark(None, "b", "https://example.com/b", None)
        .await
        .unwrap();
    let c = kernel
        .create_bookmark(None, "c", "https://example.com/c", None)
        .await
        .unwrap();

    let key_of = |children: &[NodeSnapshot], id: &Guid| {
        children
            .iter()
            .find(|n| &n.id == id)
            .map(|n| n.order_key.clone())
            .unwrap()
    };
    let before = kernel.get_children(&root).await.unwrap();
    let (ka, kb) = (key_of(&before, &a), key_of(&before, &b));

    kernel.reorder_nodes(&root, 2, 0).await.unwrap();

    let after = kernel.get_children(&root).await.unwrap();
    let order: Vec<&Guid> = after.iter().map(|n| &n.id).collect();
    assert_eq!(order, vec![&c, &a, &b]);
    assert!(key_of(&after, &c) < key_of(&after, &a));
    assert_eq!(key_of(&after, &a), ka);
    assert_eq!(key_of(&after, &b), kb);
}

#[tokio::test]
async fn cyclic_moves_are_rejected_without_an_envelope() {
    let backend = MockBackend::new();
    let kernel = new_kernel(backend).await;

    let parent = kernel.create_folder(None, "parent", None).await.unwrap();
    let child = kernel
        .create_folder(Some(parent.clone()), "child", None)
        .await
        .unwrap();
    let before = kernel.get_operation_log().await.len();
    let tree_before = kernel.get_tree().await;

    let err = kernel.move_node(&parent, &child, None).await.unwrap_err();
    assert!(matches!(err, Error::CycleForbidden(_, _)));
    assert!(err.is_validation());

    assert_eq!(kernel.get_operation_log().await.len(), before);
    assert_eq!(kernel.get_tree().await, tree_before);
}

#[tokio::test]
async fn baseline_supersedes_local_drift_but_keeps_it_pending() {
    let backend = MockBackend::new();
    let kernel = new_kernel(Arc::clone(&backend)).await;

    kernel.set_online(false).await;
    let x = kernel.create_folder(None, "X", None).await.unwrap();
    let y = kernel
        .create_bookmark(Some(x.clone()), "Y", "https://example.com/y", None)
        .await
        .unwrap();
    assert_eq!(kernel.get_sync_status().await.pending_count, 2);

    // The server's view has no X: a reconnect baseline replaces ours.
    let mut root_data = folder_data(ROOT_GUID, None);
    root_data.is_loaded = true;
    backend.set_baseline(root_data, vec![bookmark_data("server-b", ROOT_GUID)]);
    crate::kernel::rehydrate_root(kernel.shared()).await.unwrap();

    assert!(kernel.get_node(&x).await.is_none());
    assert!(kernel.get_node(&y).await.is_none());
    assert!(kernel.get_node(&"server-b".into()).await.is_some());

    // The envelopes survived the baseline and are still deliverable.
    let log = kernel.get_operation_log().await;
    for target in [&x, &y] {
        let env = log.iter().find(|e| e.op.target() == target).unwrap();
        assert!(!env.processed);
        assert!(!env.remote);
    }
    assert_eq!(kernel.get_sync_status().await.pending_count, 2);

    kernel.set_online(true).await;
    wait_for_drain(&kernel).await;

    let delivered = backend.delivered_ids();
    for env in log.iter().filter(|e| !e.remote) {
        assert!(delivered.contains(&env.id), "{} was never delivered", env.id);
    }
}

#[tokio::test]
async fn batch_window_coalesces_and_preserves_order() {
    let backend = MockBackend::new();
    let kernel = new_kernel(Arc::clone(&backend)).await;

    let a = kernel
        .create_bookmark(None, "a", "https://example.com/a", None)
        .await
        .unwrap();
    let b = kernel
        .create_bookmark(None, "b", "https://example.com/b", None)
        .await
        .unwrap();
    // Still inside the window: nothing out yet.
    assert!(backend.deliveries.lock().is_empty());

    wait_for_drain(&kernel).await;

    let log = kernel.get_operation_log().await;
    let delivered = backend.deliveries.lock().clone();
    assert_eq!(delivered.len(), 2);
    // ts order within the batch.
    assert!(delivered[0].ts <= delivered[1].ts);
    assert_eq!(delivered[0].op.target(), &a);
    assert_eq!(delivered[1].op.target(), &b);
    assert!(log.iter().all(|e| e.processed));
}

#[tokio::test]
async fn failures_retry_on_the_delay_table() {
    let backend = MockBackend::new();
    backend.fail_deliveries.store(true, Ordering::SeqCst);
    let kernel = new_kernel(Arc::clone(&backend)).await;

    let id = kernel
        .create_bookmark(None, "flaky", "https://example.com/f", None)
        .await
        .unwrap();

    let b = Arc::clone(&backend);
    wait_until("first failed attempt", move || !b.deliveries.lock().is_empty()).await;
    {
        let shared = kernel.shared();
        let core = shared.core.lock();
        let env = core.log.pending().find(|e| e.op.target() == &id).unwrap();
        assert!(!env.processed);
    }

    // Service recovers; a scheduled retry gets through.
    backend.fail_deliveries.store(false, Ordering::SeqCst);
    wait_for_drain(&kernel).await;
    assert!(backend.deliveries.lock().len() >= 2);
}

#[tokio::test]
async fn duplicate_acknowledgement_counts_as_processed() {
    let backend = MockBackend::new();
    let kernel = new_kernel(Arc::clone(&backend)).await;

    let id = kernel
        .create_bookmark(None, "dup", "https://example.com/d", None)
        .await
        .unwrap();
    let env_id = {
        let log = kernel.get_operation_log().await;
        log.iter().find(|e| e.op.target() == &id).unwrap().id.clone()
    };
    backend.duplicate_ids.lock().insert(env_id.clone());

    assert!(kernel.sync_operation_immediately(&env_id).await);
    let log = kernel.get_operation_log().await;
    assert!(log.iter().find(|e| e.id == env_id).unwrap().processed);
}

#[tokio::test]
async fn remote_envelopes_apply_idempotently() {
    let backend = MockBackend::new();
    let kernel = new_kernel(backend).await;

    let event = json_event(
        "bookmark_created",
        "ev-42",
        serde_json::json!({
            "id": "remote-b",
            "parentId": ROOT_GUID,
            "title": "remote",
            "url": "https://example.com/remote"
        }),
    );
    kernel.shared().handle_stream_event(event.clone());
    let tree_once = kernel.get_tree().await;
    let log_once = kernel.get_operation_log().await.len();

    kernel.shared().handle_stream_event(event);
    assert_eq!(kernel.get_tree().await, tree_once);
    assert_eq!(kernel.get_operation_log().await.len(), log_once);
    // Remote envelopes never count as pending.
    assert_eq!(kernel.get_sync_status().await.pending_count, 0);
}

#[tokio::test]
async fn replaying_the_log_rebuilds_the_live_tree() {
    let backend = MockBackend::new();
    let kernel = new_kernel(backend).await;
    let root: Guid = ROOT_GUID.into();

    let f = kernel.create_folder(None, "work", None).await.unwrap();
    let b = kernel
        .create_bookmark(Some(f.clone()), "doc", "https://example.com/doc", None)
        .await
        .unwrap();
    kernel.toggle_folder(&f, Some(true)).await.unwrap();
    kernel.move_node(&b, &root, Some(0)).await.unwrap();
    kernel.shared().handle_stream_event(json_event(
        "folder_created",
        "ev-rf",
        serde_json::json!({"id": "remote-f", "parentId": ROOT_GUID, "title": "remote"}),
    ));
    kernel.reorder_nodes(&root, 0, 1).await.unwrap();

    let log = kernel.get_operation_log().await;
    let replayed = replay(log.iter());
    let live = kernel.get_tree().await;
    assert_eq!(
        serde_json::to_value(replayed.snapshot()).unwrap(),
        serde_json::to_value(&live).unwrap()
    );
    replayed.check_consistency().unwrap();
}

#[tokio::test]
async fn pending_count_matches_the_log() {
    let backend = MockBackend::new();
    let kernel = new_kernel(backend).await;

    kernel.set_online(false).await;
    for i in 0..3 {
        kernel
            .create_bookmark(None, format!("b{}", i), format!("https://example.com/{}", i), None)
            .await
            .unwrap();
    }
    kernel.shared().handle_stream_event(json_event(
        "bookmark_created",
        "ev-r",
        serde_json::json!({"id": "r", "parentId": ROOT_GUID, "title": "r", "url": "https://example.com/r"}),
    ));

    let log = kernel.get_operation_log().await;
    let expected = log.iter().filter(|e| !e.remote && !e.processed).count() as u32;
    assert_eq!(kernel.get_sync_status().await.pending_count, expected);
    assert_eq!(expected, 3);
}

#[tokio::test]
async fn toggle_round_trips_and_advances_updated_at() {
    let backend = MockBackend::new();
    let kernel = new_kernel(backend).await;

    let f = kernel.create_folder(None, "f", None).await.unwrap();
    let before = kernel.get_node(&f).await.unwrap();

    assert!(kernel.toggle_folder(&f, Some(true)).await.unwrap());
    assert!(!kernel.toggle_folder(&f, Some(false)).await.unwrap());

    let after = kernel.get_node(&f).await.unwrap();
    assert_eq!(after.is_open, before.is_open);
    assert!(after.updated_at >= before.updated_at);
}

#[tokio::test]
async fn move_round_trip_restores_membership_and_order() {
    let backend = MockBackend::new();
    let kernel = new_kernel(backend).await;
    let root: Guid = ROOT_GUID.into();

    let f = kernel.create_folder(None, "f", None).await.unwrap();
    let a = kernel
        .create_bookmark(None, "a", "https://example.com/a", None)
        .await
        .unwrap();
    let _b = kernel
        .create_bookmark(None, "b", "https://example.com/b", None)
        .await
        .unwrap();
    let order_before: Vec<Guid> = kernel
        .get_children(&root)
        .await
        .unwrap()
        .iter()
        .map(|n| n.id.clone())
        .collect();

    // a sat at index 1 under the root (after folder f).
    kernel.move_node(&a, &f, None).await.unwrap();
    kernel.move_node(&a, &root, Some(1)).await.unwrap();

    let order_after: Vec<Guid> = kernel
        .get_children(&root)
        .await
        .unwrap()
        .iter()
        .map(|n| n.id.clone())
        .collect();
    assert_eq!(order_before, order_after);
}

#[tokio::test]
async fn stream_events_flow_through_a_connected_tab_session() {
    let backend = MockBackend::new();
    // No scripted baseline: the initial hydration fails quietly.
    let kernel = new_kernel(Arc::clone(&backend)).await;
    let mut rx = kernel.subscribe();

    kernel.connect("tab-1").await;
    let b = Arc::clone(&backend);
    wait_until("stream to open", move || b.stream_tx.lock().is_some()).await;

    backend.push_event(json_event(
        "bookmark_created",
        "ev-live",
        serde_json::json!({
            "id": "live-b",
            "parentId": ROOT_GUID,
            "title": "live",
            "url": "https://example.com/live"
        }),
    ));

    let shared = Arc::clone(kernel.shared());
    wait_until("event to apply", move || {
        shared.core.lock().tree.get(&"live-b".into()).is_some()
    })
    .await;

    // Somewhere in the fan-out there's the applied remote operation.
    let mut saw_remote_op = false;
    while let Ok(msg) = rx.try_recv() {
        if let BusMessage::OperationProcessed { envelope } = msg {
            if envelope.remote && envelope.id.as_str() == "ev-live" {
                saw_remote_op = true;
            }
        }
    }
    assert!(saw_remote_op);

    assert!(kernel.ping("tab-1").await);
    assert!(!kernel.ping("tab-unknown").await);
    kernel.disconnect("tab-1").await;
    assert_eq!(kernel.get_sse_state().await, SseState::Disconnected);
    kernel.shutdown().await;
}

#[tokio::test]
async fn namespace_switch_clears_and_rehydrates() {
    let backend = MockBackend::new();
    let kernel = new_kernel(Arc::clone(&backend)).await;

    let stale = kernel
        .create_bookmark(None, "stale", "https://example.com/s", None)
        .await
        .unwrap();

    let mut root_data = folder_data(ROOT_GUID, None);
    root_data.title = "other tree".into();
    backend.set_baseline(root_data, vec![bookmark_data("fresh", ROOT_GUID)]);

    kernel.set_namespace("ns-other").await.unwrap();

    assert_eq!(kernel.get_sync_status().await.namespace, "ns-other");
    assert!(kernel.get_node(&stale).await.is_none());
    assert!(kernel.get_node(&"fresh".into()).await.is_some());
    assert_eq!(kernel.get_tree().await.title, "other tree");
    assert_eq!(kernel.get_operation_log().await.len(), 1);
}

#[tokio::test]
async fn restart_replays_persisted_state() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("bookmarks.db");
    let backend = MockBackend::new();

    let (folder, bookmark) = {
        let mut config = test_config();
        config.db_path = Some(db_path.clone());
        let kernel = SyncKernel::new(config, Arc::clone(&backend) as Arc<dyn Backend>)
            .await
            .unwrap();
        kernel.set_online(false).await;
        let f = kernel.create_folder(None, "kept", None).await.unwrap();
        let b = kernel
            .create_bookmark(Some(f.clone()), "kept-b", "https://example.com/kept", None)
            .await
            .unwrap();
        kernel.shutdown().await;
        (f, b)
    };

    let mut config = test_config();
    config.db_path = Some(db_path);
    let kernel = SyncKernel::new(config, backend as Arc<dyn Backend>).await.unwrap();

    assert!(kernel.get_node(&folder).await.is_some());
    assert!(kernel.get_node(&bookmark).await.is_some());
    // Unacknowledged work survives the restart too.
    assert_eq!(kernel.get_sync_status().await.pending_count, 2);
}

#[tokio::test]
async fn force_sync_rearms_exhausted_operations() {
    let backend = MockBackend::new();
    backend.fail_deliveries.store(true, Ordering::SeqCst);
    let kernel = new_kernel(Arc::clone(&backend)).await;

    let id = kernel
        .create_bookmark(None, "tired", "https://example.com/t", None)
        .await
        .unwrap();
    let env_id = {
        let log = kernel.get_operation_log().await;
        log.iter().find(|e| e.op.target() == &id).unwrap().id.clone()
    };

    // Let it burn through the retry budget.
    let shared = Arc::clone(kernel.shared());
    let watched = env_id.clone();
    wait_until("retries to exhaust", move || {
        shared
            .core
            .lock()
            .log
            .get(&watched)
            .map(|e| e.retry_count >= 3)
            .unwrap_or(false)
    })
    .await;
    let failed_status = kernel.get_sync_status().await;
    assert!(failed_status.failed_count >= 1);
    assert_eq!(failed_status.pending_count, 1);

    backend.fail_deliveries.store(false, Ordering::SeqCst);
    kernel.force_sync_operation(&env_id).await.unwrap();
    wait_for_drain(&kernel).await;

    assert!(kernel.force_sync_operation(&"missing".into()).await.is_err());
}
