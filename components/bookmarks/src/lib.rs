/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! An offline-first, multi-tab synchronization kernel for a hierarchical
//! bookmark tree, scoped by namespace.
//!
//! One [`SyncKernel`] runs per origin in a shared background context.
//! Every tab gets an immediately-consistent local view: mutations append
//! to a durable operation log and apply to an in-memory tree right away,
//! a scheduler ships them to the remote service when connectivity allows,
//! and server-originated changes stream back in and fan out to every tab
//! over the broadcast bus.

#![allow(unknown_lints)]
#![warn(rust_2018_idioms)]

pub mod backend;
mod bus;
pub mod config;
mod error;
mod guid;
mod kernel;
mod oplog;
mod scheduler;
pub mod storage;
mod stream;
mod tree;
mod types;

#[cfg(test)]
mod tests;

pub use backend::{
    Backend, DeliveryOutcome, EventStream, HttpBackend, OperationResponse, StreamEvent,
    SubtreeBaseline, DUPLICATE_MESSAGE,
};
pub use bus::{Bus, BusMessage};
pub use config::{KernelConfig, ReachabilityConfig, ReconnectConfig, SyncConfig};
pub use error::{Error, Result};
pub use guid::Guid;
pub use kernel::SyncKernel;
pub use oplog::{apply_op, replay, OpEnvelope, Operation, OperationLog};
pub use stream::{ServerEvent, SseState};
pub use tree::{
    BookmarkNode, FolderNode, Node, NodeData, NodeKind, NodeSnapshot, Tree, ROOT_GUID,
};
pub use types::{SyncStatus, Timestamp};
