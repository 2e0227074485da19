/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The fan-out bus: every applied operation and state transition is posted
//! here, and each connected tab observes through its own receiver. Sends
//! never block and never wait for acknowledgement; a receiver that lags
//! just loses the oldest messages, which is fine because every message is
//! coalescable (a tab can always re-query).

use crate::guid::Guid;
use crate::oplog::OpEnvelope;
use crate::stream::SseState;
use crate::types::SyncStatus;
use serde::Serialize;
use tokio::sync::broadcast;

/// Messages published by the kernel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum BusMessage {
    /// A mutation was applied locally (either a tab dispatch or a
    /// server-originated envelope).
    OperationProcessed { envelope: OpEnvelope },
    /// The whole tree changed shape: baseline hydration or a namespace
    /// switch. Tabs should re-query.
    TreeReloaded { namespace: String },
    /// A subtree was hydrated from authoritative data.
    HydrateNode { namespace: String, node_id: Guid },
    RootHydrated { namespace: String },
    RootHydrationFailed { namespace: String, error: String },
    SseStateChanged { state: SseState },
    SyncStatusChanged { status: SyncStatus },
    /// Terminal outcome of delivering one operation to the service.
    OperationSyncCompleted {
        id: Guid,
        success: bool,
        retry_count: u32,
    },
}

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct Bus {
    tx: broadcast::Sender<BusMessage>,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Bus { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.tx.subscribe()
    }

    /// Posts a message to every subscriber. Fire and forget; having no
    /// subscribers is not an error.
    pub fn publish(&self, msg: BusMessage) {
        let receivers = self.tx.receiver_count();
        log::trace!("bus: publishing to {} receivers: {:?}", receivers, msg);
        let _ = self.tx.send(msg);
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
