/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The synchronization kernel: one instance per origin, shared by every
//! tab. Owns the log, the tree, the storage connection and the background
//! tasks (event stream, reachability probe), and exposes the typed API
//! tabs call over their message port.
//!
//! Single-writer discipline: user-facing mutations go through the typed
//! methods, which assign ids and timestamps; the remote path
//! (`apply_remote_op`) is reserved for envelopes synthesized from server
//! data.

use crate::backend::{Backend, StreamEvent, SubtreeBaseline};
use crate::bus::{Bus, BusMessage};
use crate::config::KernelConfig;
use crate::error::{Error, Result};
use crate::guid::Guid;
use crate::oplog::{apply_op, replay, ApplyResult, OpEnvelope, Operation, OperationLog};
use crate::scheduler::{self, SchedState};
use crate::storage::{BookmarksStorage, FolderMetadata, SyncMeta};
use crate::stream::event::{translate, NodeUpdate, ServerEvent, Translated};
use crate::stream::{self, SseState};
use crate::tree::{Node, NodeSnapshot, Tree, ROOT_GUID};
use crate::types::{MonotonicClock, SyncStatus, Timestamp};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// A tab that hasn't pinged for this long is presumed gone.
const TAB_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug)]
pub(crate) struct TabConnection {
    pub(crate) connected_at: Instant,
    pub(crate) last_ping: Instant,
}

/// Everything guarded by the kernel's one state lock. Held only for
/// synchronous sections, never across an await.
pub(crate) struct Core {
    pub(crate) namespace: String,
    pub(crate) tree: Tree,
    pub(crate) log: OperationLog,
    pub(crate) storage: BookmarksStorage,
    pub(crate) clock: MonotonicClock,
    pub(crate) client_id: Guid,
    pub(crate) last_sync_at: Option<Timestamp>,
    pub(crate) sse_state: SseState,
    pub(crate) tabs: HashMap<String, TabConnection>,
    pub(crate) store_failures: u32,
}

impl Core {
    fn load(storage: BookmarksStorage, namespace: String) -> Result<Core> {
        let entries = storage.get_all_operations(&namespace)?;
        let log = OperationLog::from_entries(entries);
        let tree = replay(log.entries());
        let clock = MonotonicClock::starting_at(log.max_ts());
        let client_id = storage.ensure_client_id(&namespace)?;
        let last_sync_at = storage
            .get_sync_meta(&namespace)?
            .and_then(|m| m.last_sync_at);
        let mut core = Core {
            namespace,
            tree,
            log,
            storage,
            clock,
            client_id,
            last_sync_at,
            sse_state: SseState::Disconnected,
            tabs: HashMap::new(),
            store_failures: 0,
        };
        // Make sure the root's row exists even before the first mutation.
        if let Some(root) = core.tree.get(&ROOT_GUID.into()) {
            let namespace = core.namespace.clone();
            if let Err(e) = core.storage.put_node(&namespace, root) {
                log::warn!("failed to persist root node: {}", e);
                core.store_failures += 1;
            }
        }
        Ok(core)
    }

    /// Clears the outgoing namespace and reloads state for the new one.
    fn switch_namespace(&mut self, namespace: &str) -> Result<()> {
        let old = self.namespace.clone();
        if let Err(e) = self.storage.clear(&old) {
            log::warn!("failed to clear namespace {:?}: {}", old, e);
            self.store_failures += 1;
        }
        self.namespace = namespace.to_string();
        let entries = self.storage.get_all_operations(namespace).unwrap_or_else(|e| {
            log::warn!("failed to load log for {:?}: {}", namespace, e);
            Vec::new()
        });
        self.log = OperationLog::from_entries(entries);
        self.tree = replay(self.log.entries());
        self.clock = MonotonicClock::starting_at(self.log.max_ts());
        self.client_id = self
            .storage
            .ensure_client_id(namespace)
            .unwrap_or_else(|_| Guid::random());
        self.last_sync_at = self
            .storage
            .get_sync_meta(namespace)
            .ok()
            .flatten()
            .and_then(|m| m.last_sync_at);
        Ok(())
    }

    /// Mirrors an applied envelope to storage. Best-effort: the in-memory
    /// model is authoritative and a failed write just gets counted.
    pub(crate) fn persist_apply(&mut self, env: &OpEnvelope, result: &ApplyResult) {
        let namespace = self.namespace.clone();
        if let Err(e) = self.storage.append_operation(&namespace, env) {
            log::warn!("failed to persist envelope {}: {}", env.id, e);
            self.store_failures += 1;
        }
        for id in &result.upserted {
            if let Some(node) = self.tree.get(id) {
                if let Err(e) = self.storage.put_node(&namespace, node) {
                    log::warn!("failed to persist node {}: {}", id, e);
                    self.store_failures += 1;
                }
            }
        }
        for id in &result.removed {
            if let Err(e) = self.storage.delete_node(&namespace, id) {
                log::warn!("failed to delete node {}: {}", id, e);
                self.store_failures += 1;
            }
        }
        self.persist_sync_meta();
    }

    pub(crate) fn persist_sync_meta(&mut self) {
        let namespace = self.namespace.clone();
        let meta = SyncMeta {
            last_sync_at: self.last_sync_at,
            pending_count: self.log.pending_count(),
            client_id: self.client_id.clone(),
        };
        if let Err(e) = self.storage.put_sync_meta(&namespace, &meta) {
            log::warn!("failed to persist sync metadata: {}", e);
            self.store_failures += 1;
        }
    }

    fn failed_count(&self, max_retries: u32) -> u32 {
        let exhausted = self
            .log
            .pending()
            .filter(|e| e.retry_count >= max_retries)
            .count() as u32;
        exhausted + self.store_failures
    }
}

struct TaskHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    fn stop(self) {
        // Graceful signal first; the abort only matters if the task is
        // parked somewhere that ignores it.
        let _ = self.shutdown.send(true);
        self.handle.abort();
    }
}

#[derive(Default)]
struct Tasks {
    stream: Option<TaskHandle>,
    prober: Option<TaskHandle>,
}

/// State shared between the kernel facade and its background tasks.
pub(crate) struct KernelShared {
    pub(crate) config: KernelConfig,
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) core: Mutex<Core>,
    pub(crate) sched: Mutex<SchedState>,
    pub(crate) bus: Bus,
    pub(crate) online: AtomicBool,
    tasks: Mutex<Tasks>,
}

impl KernelShared {
    pub(crate) fn namespace(&self) -> String {
        self.core.lock().namespace.clone()
    }

    pub(crate) fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub(crate) fn set_sse_state(&self, state: SseState) {
        let changed = {
            let mut core = self.core.lock();
            if core.sse_state == state {
                false
            } else {
                core.sse_state = state;
                true
            }
        };
        if changed {
            self.bus.publish(BusMessage::SseStateChanged { state });
        }
    }

    pub(crate) fn sync_status_snapshot(&self) -> SyncStatus {
        let (namespace, pending_count, failed_count, last_sync_at) = {
            let core = self.core.lock();
            (
                core.namespace.clone(),
                core.log.pending_count(),
                core.failed_count(self.config.sync.max_retries),
                core.last_sync_at,
            )
        };
        let is_syncing = self.sched.lock().cycle_running;
        SyncStatus {
            namespace,
            is_syncing,
            pending_count,
            failed_count,
            is_online: self.is_online(),
            last_sync_at,
        }
    }

    pub(crate) fn publish_sync_status(&self) {
        let status = self.sync_status_snapshot();
        self.bus.publish(BusMessage::SyncStatusChanged { status });
    }

    /// Stamps, applies, appends and persists a server-originated
    /// operation. `wire_id` keys idempotence: an id we've already applied
    /// is a no-op and returns `None`.
    pub(crate) fn apply_remote_op(
        &self,
        op: Operation,
        wire_id: Option<Guid>,
    ) -> Result<Option<OpEnvelope>> {
        let env = {
            let mut core = self.core.lock();
            let id = wire_id.unwrap_or_else(Guid::random);
            if core.log.contains(&id) {
                log::debug!("remote envelope {} already applied", id);
                return Ok(None);
            }
            let ts = core.clock.next();
            let env = OpEnvelope {
                id,
                ts,
                op,
                processed: true,
                remote: true,
                retry_count: 0,
            };
            let result = apply_op(&mut core.tree, &env.op, env.ts)?;
            if let Err(e) = core.log.append(env.clone()) {
                log::warn!("log append raced for {}: {}", env.id, e);
                return Ok(None);
            }
            core.persist_apply(&env, &result);
            env
        };
        self.bus.publish(BusMessage::OperationProcessed {
            envelope: env.clone(),
        });
        Ok(Some(env))
    }

    /// Converts one decoded stream event into an envelope and applies it.
    /// Anything malformed or inapplicable is logged and dropped; the
    /// stream itself never fails over bad data.
    pub(crate) fn handle_stream_event(self: &Arc<Self>, raw: StreamEvent) {
        let payload: serde_json::Value = match serde_json::from_str(&raw.data) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("dropping {} event with undecodable payload: {}", raw.event, e);
                return;
            }
        };
        let event = ServerEvent {
            kind: raw.event.clone(),
            id: raw.id.clone(),
            payload,
        };
        let op = match translate(&event) {
            Ok(Some(Translated::Op(op))) => op,
            Ok(Some(Translated::Update(update))) => {
                let merged = {
                    let core = self.core.lock();
                    merge_update(&core.tree, update)
                };
                match merged {
                    Some(op) => op,
                    None => {
                        log::warn!("dropping update event for unknown node");
                        return;
                    }
                }
            }
            Ok(None) => return,
            Err(e) => {
                log::warn!("dropping malformed {:?} event: {}", raw.event, e);
                return;
            }
        };
        match self.apply_remote_op(op, raw.id.map(Guid::from)) {
            Ok(_) => {}
            Err(e) => log::warn!("dropping inapplicable {:?} event: {}", raw.event, e),
        }
    }

    fn ensure_stream(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if tasks.stream.is_some() {
            return;
        }
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(stream::run(Arc::clone(self), rx));
        tasks.stream = Some(TaskHandle { shutdown, handle });
    }

    fn ensure_prober(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if tasks.prober.is_some() {
            return;
        }
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler::probe_loop(Arc::clone(self), rx));
        tasks.prober = Some(TaskHandle { shutdown, handle });
    }

    pub(crate) fn stop_stream(&self) {
        if let Some(handle) = self.tasks.lock().stream.take() {
            handle.stop();
        }
        self.set_sse_state(SseState::Disconnected);
    }

    fn stop_all_tasks(&self) {
        let (stream, prober) = {
            let mut tasks = self.tasks.lock();
            (tasks.stream.take(), tasks.prober.take())
        };
        if let Some(handle) = stream {
            handle.stop();
        }
        if let Some(handle) = prober {
            handle.stop();
        }
        self.set_sse_state(SseState::Disconnected);
    }

    /// Drops tab connections that stopped pinging; tears the stream down
    /// when the last one goes.
    pub(crate) fn reap_stale_tabs(&self) {
        let now = Instant::now();
        let became_empty = {
            let mut core = self.core.lock();
            let before = core.tabs.len();
            core.tabs.retain(|tab_id, tab| {
                let live = now.duration_since(tab.last_ping) < TAB_TTL;
                if !live {
                    log::info!("reaping unresponsive tab {:?}", tab_id);
                }
                live
            });
            before > 0 && core.tabs.is_empty()
        };
        if became_empty {
            self.stop_stream();
        }
    }
}

/// Builds the hydration that realizes a field-level update: the node's
/// current state overlaid with the provided fields, children preserved.
fn merge_update(tree: &Tree, update: NodeUpdate) -> Option<Operation> {
    let node = tree.get(&update.id)?;
    let mut data = node.to_data();
    if let Some(title) = update.title {
        data.title = title;
    }
    if let Some(url) = update.url {
        data.url = Some(url);
    }
    if let Some(open) = update.is_open {
        data.is_open = open;
    }
    let children = if node.is_folder() {
        tree.child_ids(&update.id)
            .ok()?
            .iter()
            .filter_map(|id| tree.get(id))
            .map(|n| n.to_data())
            .collect()
    } else {
        Vec::new()
    };
    Some(Operation::HydrateNode {
        node_id: update.id,
        node_data: data,
        children,
    })
}

/// Fetches the authoritative root subtree and applies it as a baseline.
/// Called on reconnect, on namespace switches, and for a namespace's very
/// first session.
pub(crate) async fn rehydrate_root(shared: &Arc<KernelShared>) -> Result<()> {
    let namespace = shared.namespace();
    let root: Guid = ROOT_GUID.into();
    let fetched = match tokio::time::timeout(
        shared.config.timeout(),
        shared.backend.fetch_subtree(&namespace, &root),
    )
    .await
    {
        Err(_) => Err(Error::OutboundTimeout),
        Ok(r) => r,
    };
    let baseline = match fetched {
        Ok(b) => b,
        Err(e) => {
            shared.bus.publish(BusMessage::RootHydrationFailed {
                namespace,
                error: e.to_string(),
            });
            return Err(e);
        }
    };
    apply_baseline(shared, &root, baseline)?;
    shared.bus.publish(BusMessage::RootHydrated {
        namespace: namespace.clone(),
    });
    shared.bus.publish(BusMessage::TreeReloaded { namespace });
    // Local edits the baseline superseded are still unacknowledged; the
    // scheduler redelivers them and a later baseline reflects them.
    let pending = shared.core.lock().log.pending_count();
    if pending > 0 && shared.is_online() {
        scheduler::spawn_cycle(shared);
    }
    Ok(())
}

/// Applies a fetched baseline as a `hydrate_node` envelope and records
/// folder load metadata.
pub(crate) fn apply_baseline(
    shared: &Arc<KernelShared>,
    node_id: &Guid,
    baseline: SubtreeBaseline,
) -> Result<()> {
    let mut data = baseline.node;
    // Our id for the node is canonical locally, whatever the service
    // calls it.
    data.id = node_id.clone();
    let children_count = baseline.children.len() as u32;
    shared.apply_remote_op(
        Operation::HydrateNode {
            node_id: node_id.clone(),
            node_data: data,
            children: baseline.children,
        },
        None,
    )?;
    let namespace = {
        let mut core = shared.core.lock();
        let namespace = core.namespace.clone();
        let meta = FolderMetadata {
            has_loaded_children: true,
            last_loaded_at: Some(Timestamp::now()),
            children_count,
        };
        if let Err(e) = core.storage.put_folder_metadata(&namespace, node_id, &meta) {
            log::warn!("failed to persist folder metadata for {}: {}", node_id, e);
            core.store_failures += 1;
        }
        namespace
    };
    shared.bus.publish(BusMessage::HydrateNode {
        namespace,
        node_id: node_id.clone(),
    });
    Ok(())
}

/// The public face of the kernel. Cheap to clone; everything lives behind
/// one shared state.
#[derive(Clone)]
pub struct SyncKernel {
    shared: Arc<KernelShared>,
}

impl SyncKernel {
    /// Builds a kernel against a backend, replaying any persisted log into
    /// the in-memory tree. Background tasks start with the first tab
    /// connection.
    pub async fn new(config: KernelConfig, backend: Arc<dyn Backend>) -> Result<SyncKernel> {
        let storage = match &config.db_path {
            Some(path) => BookmarksStorage::new(path)?,
            None => BookmarksStorage::new_in_memory()?,
        };
        let core = Core::load(storage, config.namespace.clone())?;
        log::info!(
            "kernel up for {:?}: {} log entries, {} pending",
            core.namespace,
            core.log.entries().len(),
            core.log.pending_count()
        );
        let shared = Arc::new(KernelShared {
            config,
            backend,
            core: Mutex::new(core),
            sched: Mutex::new(SchedState::default()),
            bus: Bus::new(),
            online: AtomicBool::new(true),
            tasks: Mutex::new(Tasks::default()),
        });
        Ok(SyncKernel { shared })
    }

    /// A receiver on the fan-out bus: the tab's end of the message port.
    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.shared.bus.subscribe()
    }

    /// Single entry point for local mutations: applies to the tree,
    /// appends to the log, persists, fans out and arms the batch window.
    /// Validation failures append nothing.
    fn dispatch_local(&self, op: Operation) -> Result<OpEnvelope> {
        let env = {
            let mut core = self.shared.core.lock();
            let id = Guid::random();
            let ts = core.clock.next();
            let result = apply_op(&mut core.tree, &op, ts)?;
            let env = OpEnvelope {
                id,
                ts,
                op,
                processed: false,
                remote: false,
                retry_count: 0,
            };
            if let Err(e) = core.log.append(env.clone()) {
                log::warn!("freshly minted envelope id collided: {}", e);
            }
            core.persist_apply(&env, &result);
            env
        };
        self.shared.bus.publish(BusMessage::OperationProcessed {
            envelope: env.clone(),
        });
        self.shared.publish_sync_status();
        scheduler::arm_batch(&self.shared);
        Ok(env)
    }

    // --- tree mutations ---

    pub async fn create_folder(
        &self,
        parent_id: Option<Guid>,
        title: impl Into<String>,
        index: Option<usize>,
    ) -> Result<Guid> {
        let id = Guid::random();
        self.dispatch_local(Operation::CreateFolder {
            id: id.clone(),
            parent_id,
            title: title.into(),
            is_open: false,
            // Locally created folders have, by definition, all their
            // children.
            is_loaded: true,
            index,
        })?;
        Ok(id)
    }

    pub async fn create_bookmark(
        &self,
        parent_id: Option<Guid>,
        title: impl Into<String>,
        url: impl Into<String>,
        index: Option<usize>,
    ) -> Result<Guid> {
        let url = url.into();
        if url.is_empty() {
            return Err(Error::BadArgument("bookmarks need a url".into()));
        }
        let id = Guid::random();
        self.dispatch_local(Operation::CreateBookmark {
            id: id.clone(),
            parent_id,
            title: title.into(),
            url,
            index,
        })?;
        Ok(id)
    }

    pub async fn remove_node(&self, node_id: &Guid) -> Result<()> {
        self.dispatch_local(Operation::RemoveNode {
            node_id: node_id.clone(),
        })?;
        Ok(())
    }

    pub async fn move_node(
        &self,
        node_id: &Guid,
        to_folder_id: &Guid,
        index: Option<usize>,
    ) -> Result<()> {
        self.dispatch_local(Operation::MoveNode {
            node_id: node_id.clone(),
            to_folder_id: to_folder_id.clone(),
            index,
        })?;
        Ok(())
    }

    pub async fn reorder_nodes(
        &self,
        folder_id: &Guid,
        from_index: usize,
        to_index: usize,
    ) -> Result<()> {
        self.dispatch_local(Operation::Reorder {
            folder_id: folder_id.clone(),
            from_index,
            to_index,
        })?;
        Ok(())
    }

    /// Sets or flips a folder's open state; returns the new value.
    pub async fn toggle_folder(&self, folder_id: &Guid, open: Option<bool>) -> Result<bool> {
        self.dispatch_local(Operation::ToggleFolder {
            folder_id: folder_id.clone(),
            open,
        })?;
        let open = match self.shared.core.lock().tree.get(folder_id) {
            Some(Node::Folder(f)) => f.is_open,
            _ => false,
        };
        Ok(open)
    }

    pub async fn mark_folder_as_loaded(&self, folder_id: &Guid) -> Result<()> {
        self.dispatch_local(Operation::MarkFolderLoaded {
            folder_id: folder_id.clone(),
        })?;
        let mut core = self.shared.core.lock();
        let namespace = core.namespace.clone();
        let children_count = core
            .tree
            .child_ids(folder_id)
            .map(|c| c.len() as u32)
            .unwrap_or(0);
        let meta = FolderMetadata {
            has_loaded_children: true,
            last_loaded_at: Some(Timestamp::now()),
            children_count,
        };
        if let Err(e) = core.storage.put_folder_metadata(&namespace, folder_id, &meta) {
            log::warn!("failed to persist folder metadata for {}: {}", folder_id, e);
            core.store_failures += 1;
        }
        Ok(())
    }

    /// Fetches a folder's authoritative children and hydrates them in.
    /// Returns `None` when the service is unreachable; local state is
    /// untouched in that case.
    pub async fn load_folder_data(&self, folder_id: &Guid) -> Result<Option<NodeSnapshot>> {
        {
            let core = self.shared.core.lock();
            core.tree.require_folder(folder_id)?;
        }
        let namespace = self.shared.namespace();
        let fetched = match tokio::time::timeout(
            self.shared.config.timeout(),
            self.shared.backend.fetch_subtree(&namespace, folder_id),
        )
        .await
        {
            Err(_) => Err(Error::OutboundTimeout),
            Ok(r) => r,
        };
        match fetched {
            Err(e) => {
                log::warn!("loading folder {} failed: {}", folder_id, e);
                Ok(None)
            }
            Ok(baseline) => {
                apply_baseline(&self.shared, folder_id, baseline)?;
                Ok(self.shared.core.lock().tree.node_snapshot(folder_id))
            }
        }
    }

    // --- state queries ---

    /// An immutable snapshot of the whole tree, rooted at the namespace
    /// root.
    pub async fn get_tree(&self) -> NodeSnapshot {
        self.shared.core.lock().tree.snapshot()
    }

    pub async fn get_node(&self, node_id: &Guid) -> Option<NodeSnapshot> {
        self.shared.core.lock().tree.node_snapshot(node_id)
    }

    pub async fn get_children(&self, folder_id: &Guid) -> Result<Vec<NodeSnapshot>> {
        let core = self.shared.core.lock();
        let ids: Vec<Guid> = core.tree.child_ids(folder_id)?.to_vec();
        Ok(ids
            .iter()
            .filter_map(|id| core.tree.node_snapshot(id))
            .collect())
    }

    pub async fn get_operation_log(&self) -> Vec<OpEnvelope> {
        self.shared.core.lock().log.snapshot()
    }

    // --- connection accounting ---

    /// Registers a tab. The first connection brings up the background
    /// tasks and, for a namespace we've never hydrated, fetches the
    /// initial baseline.
    pub async fn connect(&self, tab_id: impl Into<String>) {
        let tab_id = tab_id.into();
        let (first, never_hydrated) = {
            let mut core = self.shared.core.lock();
            let first = core.tabs.is_empty();
            let now = Instant::now();
            core.tabs.insert(
                tab_id.clone(),
                TabConnection {
                    connected_at: now,
                    last_ping: now,
                },
            );
            (
                first,
                core.tree.node_count() == 1 && core.log.entries().is_empty(),
            )
        };
        log::info!("tab {:?} connected", tab_id);
        if first {
            self.shared.ensure_prober();
            self.shared.ensure_stream();
            if never_hydrated {
                let shared = Arc::clone(&self.shared);
                tokio::spawn(async move {
                    if let Err(e) = rehydrate_root(&shared).await {
                        log::warn!("initial baseline fetch failed: {}", e);
                    }
                });
            }
        }
    }

    /// Deregisters a tab; the last one out tears the stream down.
    pub async fn disconnect(&self, tab_id: &str) {
        let last = {
            let mut core = self.shared.core.lock();
            core.tabs.remove(tab_id);
            core.tabs.is_empty()
        };
        log::info!("tab {:?} disconnected", tab_id);
        if last {
            self.shared.stop_stream();
        }
    }

    /// Keepalive from a tab; returns false for tabs we don't know (they
    /// should reconnect).
    pub async fn ping(&self, tab_id: &str) -> bool {
        let mut core = self.shared.core.lock();
        match core.tabs.get_mut(tab_id) {
            Some(tab) => {
                tab.last_ping = Instant::now();
                true
            }
            None => false,
        }
    }

    pub async fn get_sse_state(&self) -> SseState {
        self.shared.core.lock().sse_state
    }

    pub async fn get_sync_status(&self) -> SyncStatus {
        self.shared.sync_status_snapshot()
    }

    /// Host-provided connectivity hint (the OS's online/offline events);
    /// the periodic probe supplements this.
    pub async fn set_online(&self, online: bool) {
        scheduler::note_connectivity(&self.shared, online);
    }

    // --- sync controls ---

    /// Re-arms a (possibly retry-exhausted) operation and kicks a cycle.
    pub async fn force_sync_operation(&self, id: &Guid) -> Result<()> {
        {
            let mut core = self.shared.core.lock();
            if core.log.get(id).is_none() {
                return Err(Error::BadArgument(format!("unknown operation {}", id)));
            }
            core.log.reset_retry(id);
            let namespace = core.namespace.clone();
            if let Err(e) = core.storage.reset_retries(&namespace, id) {
                log::warn!("failed to reset retries for {}: {}", id, e);
                core.store_failures += 1;
            }
        }
        self.shared.sched.lock().not_before.remove(id);
        scheduler::spawn_cycle(&self.shared);
        Ok(())
    }

    /// Delivers one pending operation right now, skipping the batch
    /// window. The only API that surfaces transport trouble, and then
    /// only as `false`.
    pub async fn sync_operation_immediately(&self, id: &Guid) -> bool {
        let env = {
            let core = self.shared.core.lock();
            match core.log.get(id) {
                None => return false,
                Some(e) if e.processed => return true,
                Some(e) if e.remote => return false,
                Some(e) => e.clone(),
            }
        };
        scheduler::deliver_envelope(&self.shared, &env).await
    }

    /// Switches the kernel to a different namespace: stream down, store
    /// cleared, baseline fetched, stream back up.
    pub async fn set_namespace(&self, namespace: impl Into<String>) -> Result<()> {
        let namespace = namespace.into();
        if namespace == self.shared.namespace() {
            return Ok(());
        }
        log::info!("switching namespace to {:?}", namespace);
        self.shared.stop_stream();
        {
            let mut core = self.shared.core.lock();
            core.switch_namespace(&namespace)?;
        }
        self.shared.sched.lock().not_before.clear();
        self.shared.bus.publish(BusMessage::TreeReloaded {
            namespace: namespace.clone(),
        });
        if let Err(e) = rehydrate_root(&self.shared).await {
            log::warn!("baseline fetch for {:?} failed: {}", namespace, e);
        }
        let has_tabs = !self.shared.core.lock().tabs.is_empty();
        if has_tabs {
            self.shared.ensure_stream();
        }
        Ok(())
    }

    /// Stops every background task. The kernel can be dropped afterwards;
    /// tabs reconnecting later get a fresh instance.
    pub async fn shutdown(&self) {
        log::info!("kernel shutting down");
        self.shared.stop_all_tasks();
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<KernelShared> {
        &self.shared
    }
}
