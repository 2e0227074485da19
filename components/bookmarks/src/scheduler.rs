/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The outbound sync scheduler: batches freshly-dispatched operations
//! behind a short window, ships them to the service one call per
//! operation in `ts` order, and retries failures on a fixed delay table.
//! At most one cycle runs at a time; going offline suppresses cycles
//! without blocking local dispatches.

use crate::backend::DeliveryOutcome;
use crate::bus::BusMessage;
use crate::error::Error;
use crate::guid::Guid;
use crate::kernel::KernelShared;
use crate::oplog::OpEnvelope;
use crate::types::Timestamp;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, Default)]
pub(crate) struct SchedState {
    /// A batch window is counting down; new dispatches don't extend it.
    pub(crate) batch_armed: bool,
    /// A delivery cycle is in flight; a second one starting now would be a
    /// no-op anyway, so it doesn't start.
    pub(crate) cycle_running: bool,
    /// Per-operation earliest next attempt, from the retry delay table.
    pub(crate) not_before: HashMap<Guid, Instant>,
}

/// Starts the batch window if one isn't already counting down. Called on
/// every local dispatch.
pub(crate) fn arm_batch(shared: &Arc<KernelShared>) {
    {
        let mut sched = shared.sched.lock();
        if sched.batch_armed {
            return;
        }
        sched.batch_armed = true;
    }
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        tokio::time::sleep(shared.config.sync.batch_window()).await;
        shared.sched.lock().batch_armed = false;
        run_cycle(shared).await;
    });
}

/// Fire-and-forget cycle start.
pub(crate) fn spawn_cycle(shared: &Arc<KernelShared>) {
    let shared = Arc::clone(shared);
    tokio::spawn(run_cycle(shared));
}

/// One delivery cycle: drains everything currently deliverable, oldest
/// first. Concurrent starts collapse into the running cycle.
pub(crate) async fn run_cycle(shared: Arc<KernelShared>) {
    if !shared.is_online() {
        log::debug!("sync cycle suppressed while offline");
        return;
    }
    {
        let mut sched = shared.sched.lock();
        if sched.cycle_running {
            return;
        }
        sched.cycle_running = true;
    }
    shared.publish_sync_status();

    let max_retries = shared.config.sync.max_retries;
    loop {
        let next: Option<OpEnvelope> = {
            let core = shared.core.lock();
            let sched = shared.sched.lock();
            let now = Instant::now();
            let found = core
                .log
                .pending()
                .filter(|e| e.retry_count < max_retries)
                .find(|e| sched.not_before.get(&e.id).map_or(true, |t| *t <= now))
                .cloned();
            found
        };
        let env = match next {
            Some(env) => env,
            None => break,
        };
        deliver_envelope(&shared, &env).await;
        if !shared.is_online() {
            // Connectivity dropped mid-cycle; whatever is left waits.
            break;
        }
    }

    shared.sched.lock().cycle_running = false;
    shared.publish_sync_status();
}

/// Ships one envelope and records the outcome. Returns true when the
/// service acknowledged it (including idempotent duplicates).
pub(crate) async fn deliver_envelope(shared: &Arc<KernelShared>, env: &OpEnvelope) -> bool {
    let namespace = shared.namespace();
    let outcome = match tokio::time::timeout(
        shared.config.timeout(),
        shared.backend.deliver(&namespace, env),
    )
    .await
    {
        Err(_) => Err(Error::OutboundTimeout),
        Ok(r) => r,
    };
    match outcome {
        Ok(DeliveryOutcome::Success { data }) => {
            complete_success(shared, env, data);
            true
        }
        Ok(DeliveryOutcome::Duplicate) => {
            complete_success(shared, env, None);
            true
        }
        Ok(DeliveryOutcome::Failure { status, message }) => {
            log::warn!(
                "delivery of {} failed (status {:?}): {}",
                env.id,
                status,
                message
            );
            note_failure(shared, env);
            false
        }
        Err(e) => {
            log::warn!("delivery of {} failed: {}", env.id, e);
            note_failure(shared, env);
            false
        }
    }
}

fn complete_success(shared: &Arc<KernelShared>, env: &OpEnvelope, data: Option<Value>) {
    let retry_count;
    {
        let mut core = shared.core.lock();
        if !core.log.mark_processed(&env.id) {
            // Raced with another path (an immediate sync, say); nothing
            // more to record.
            return;
        }
        retry_count = core.log.get(&env.id).map(|e| e.retry_count).unwrap_or(0);
        core.last_sync_at = Some(Timestamp::now());
        let namespace = core.namespace.clone();
        if let Err(e) = core.storage.mark_processed(&namespace, &[env.id.clone()]) {
            log::warn!("failed to persist processed flag for {}: {}", env.id, e);
            core.store_failures += 1;
        }
        if let Some(data) = &data {
            apply_reconciliation(&mut core, data);
        }
        core.persist_sync_meta();
    }
    shared.sched.lock().not_before.remove(&env.id);
    shared.bus.publish(BusMessage::OperationSyncCompleted {
        id: env.id.clone(),
        success: true,
        retry_count,
    });
    shared.publish_sync_status();
}

fn note_failure(shared: &Arc<KernelShared>, env: &OpEnvelope) {
    let max_retries = shared.config.sync.max_retries;
    let retry_count = {
        let mut core = shared.core.lock();
        let namespace = core.namespace.clone();
        let rc = core.log.bump_retry(&env.id).unwrap_or(0);
        if let Err(e) = core.storage.mark_failed(&namespace, &[env.id.clone()]) {
            log::warn!("failed to persist retry count for {}: {}", env.id, e);
            core.store_failures += 1;
        }
        rc
    };
    if retry_count < max_retries {
        let delay = shared.config.sync.retry_delay(retry_count);
        shared
            .sched
            .lock()
            .not_before
            .insert(env.id.clone(), Instant::now() + delay);
        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            run_cycle(shared).await;
        });
    } else {
        // Out of automatic retries; wait for a force or a connectivity
        // change.
        shared.sched.lock().not_before.remove(&env.id);
        shared.bus.publish(BusMessage::OperationSyncCompleted {
            id: env.id.clone(),
            success: false,
            retry_count,
        });
        shared.publish_sync_status();
    }
}

/// Applies canonical fields from a delivery response (server timestamps,
/// mostly) as a targeted store write. The log itself is never reordered.
fn apply_reconciliation(core: &mut crate::kernel::Core, data: &Value) {
    let node_obj = data.get("node").unwrap_or(data);
    let id: Guid = match node_obj.get("id").and_then(Value::as_str) {
        Some(id) => id.into(),
        None => return,
    };
    let created = node_obj
        .get("createdAt")
        .and_then(Value::as_u64)
        .map(Timestamp);
    let updated = node_obj
        .get("updatedAt")
        .and_then(Value::as_u64)
        .map(Timestamp);
    if created.is_none() && updated.is_none() {
        return;
    }
    if core.tree.reconcile_timestamps(&id, created, updated) {
        let namespace = core.namespace.clone();
        if let Some(node) = core.tree.get(&id) {
            if let Err(e) = core.storage.put_node(&namespace, node) {
                log::warn!("failed to persist reconciled node {}: {}", id, e);
                core.store_failures += 1;
            }
        }
    }
}

/// Periodic reachability probe, doubling as the tab-connection reaper.
/// OS-level online/offline notifications come in through
/// `SyncKernel::set_online` and complement this.
pub(crate) async fn probe_loop(shared: Arc<KernelShared>, mut shutdown: watch::Receiver<bool>) {
    let interval = shared.config.reachability.interval();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {}
        }
        if *shutdown.borrow() {
            break;
        }
        let reachable = tokio::time::timeout(
            shared.config.reachability.timeout(),
            shared.backend.probe(),
        )
        .await
        .unwrap_or(false);
        note_connectivity(&shared, reachable);
        shared.reap_stale_tabs();
    }
}

/// Records a connectivity transition. Coming back online immediately
/// schedules a cycle when anything is pending, with retry budgets reset
/// so even operations that exhausted them get another run.
pub(crate) fn note_connectivity(shared: &Arc<KernelShared>, online: bool) {
    let was = shared.online.swap(online, std::sync::atomic::Ordering::SeqCst);
    if was == online {
        return;
    }
    log::info!("connectivity changed: online={}", online);
    if online {
        let pending: Vec<Guid> = {
            let mut core = shared.core.lock();
            let namespace = core.namespace.clone();
            let ids: Vec<Guid> = core.log.pending().map(|e| e.id.clone()).collect();
            for id in &ids {
                core.log.reset_retry(id);
                if let Err(e) = core.storage.reset_retries(&namespace, id) {
                    log::warn!("failed to reset retries for {}: {}", id, e);
                    core.store_failures += 1;
                }
            }
            ids
        };
        {
            let mut sched = shared.sched.lock();
            for id in &pending {
                sched.not_before.remove(id);
            }
        }
        if !pending.is_empty() {
            spawn_cycle(shared);
        }
    }
    shared.publish_sync_status();
}
