/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The operation log: the ordered, persisted history of tree mutations and
//! the canonical source of local truth. The tree is derived state and can
//! be rebuilt at any time by replaying the log.

use crate::error::{Error, Result};
use crate::guid::Guid;
use crate::tree::{BookmarkNode, FolderNode, Node, NodeData, Tree};
use crate::types::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One tree mutation. The tagged representation doubles as the wire shape
/// of an operation body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Operation {
    CreateFolder {
        id: Guid,
        #[serde(default)]
        parent_id: Option<Guid>,
        title: String,
        #[serde(default)]
        is_open: bool,
        #[serde(default)]
        is_loaded: bool,
        #[serde(default)]
        index: Option<usize>,
    },
    CreateBookmark {
        id: Guid,
        #[serde(default)]
        parent_id: Option<Guid>,
        title: String,
        url: String,
        #[serde(default)]
        index: Option<usize>,
    },
    RemoveNode {
        node_id: Guid,
    },
    MoveNode {
        node_id: Guid,
        to_folder_id: Guid,
        #[serde(default)]
        index: Option<usize>,
    },
    Reorder {
        folder_id: Guid,
        from_index: usize,
        to_index: usize,
    },
    ToggleFolder {
        folder_id: Guid,
        #[serde(default)]
        open: Option<bool>,
    },
    MarkFolderLoaded {
        folder_id: Guid,
    },
    /// Baseline: authoritative replacement of a subtree. Supersedes every
    /// earlier envelope touching that subtree.
    HydrateNode {
        node_id: Guid,
        node_data: NodeData,
        #[serde(default)]
        children: Vec<NodeData>,
    },
}

impl Operation {
    /// The wire tag, also used as the endpoint action name.
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::CreateFolder { .. } => "create_folder",
            Operation::CreateBookmark { .. } => "create_bookmark",
            Operation::RemoveNode { .. } => "remove_node",
            Operation::MoveNode { .. } => "move_node",
            Operation::Reorder { .. } => "reorder",
            Operation::ToggleFolder { .. } => "toggle_folder",
            Operation::MarkFolderLoaded { .. } => "mark_folder_loaded",
            Operation::HydrateNode { .. } => "hydrate_node",
        }
    }

    /// The node this operation is about.
    pub fn target(&self) -> &Guid {
        match self {
            Operation::CreateFolder { id, .. } => id,
            Operation::CreateBookmark { id, .. } => id,
            Operation::RemoveNode { node_id } => node_id,
            Operation::MoveNode { node_id, .. } => node_id,
            Operation::Reorder { folder_id, .. } => folder_id,
            Operation::ToggleFolder { folder_id, .. } => folder_id,
            Operation::MarkFolderLoaded { folder_id } => folder_id,
            Operation::HydrateNode { node_id, .. } => node_id,
        }
    }
}

/// A log entry wrapping one operation with its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpEnvelope {
    pub id: Guid,
    pub ts: Timestamp,
    pub op: Operation,
    /// True once the server acknowledged this envelope.
    #[serde(default)]
    pub processed: bool,
    /// True for envelopes synthesized from the server stream.
    #[serde(default)]
    pub remote: bool,
    #[serde(default)]
    pub retry_count: u32,
}

/// What applying an operation touched, so the caller can mirror the change
/// to storage.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ApplyResult {
    pub upserted: Vec<Guid>,
    pub removed: Vec<Guid>,
}

/// Applies one operation to the tree. Validation failures leave the tree
/// untouched.
pub fn apply_op(tree: &mut Tree, op: &Operation, ts: Timestamp) -> Result<ApplyResult> {
    let root = tree.root().clone();
    match op {
        Operation::CreateFolder {
            id,
            parent_id,
            title,
            is_open,
            is_loaded,
            index,
        } => {
            let parent = parent_id.clone().unwrap_or(root);
            tree.insert(
                Node::Folder(FolderNode {
                    guid: id.clone(),
                    parent: Some(parent),
                    title: title.clone(),
                    is_open: *is_open,
                    is_loaded: *is_loaded,
                    order_key: String::new(),
                    created_at: ts,
                    updated_at: ts,
                }),
                *index,
            )?;
            Ok(ApplyResult {
                upserted: vec![id.clone()],
                ..Default::default()
            })
        }
        Operation::CreateBookmark {
            id,
            parent_id,
            title,
            url,
            index,
        } => {
            let parent = parent_id.clone().unwrap_or(root);
            tree.insert(
                Node::Bookmark(BookmarkNode {
                    guid: id.clone(),
                    parent,
                    title: title.clone(),
                    url: url.clone(),
                    order_key: String::new(),
                    created_at: ts,
                    updated_at: ts,
                }),
                *index,
            )?;
            Ok(ApplyResult {
                upserted: vec![id.clone()],
                ..Default::default()
            })
        }
        Operation::RemoveNode { node_id } => {
            let removed = tree.remove(node_id)?;
            Ok(ApplyResult {
                removed,
                ..Default::default()
            })
        }
        Operation::MoveNode {
            node_id,
            to_folder_id,
            index,
        } => {
            tree.move_node(node_id, to_folder_id, *index, ts)?;
            Ok(ApplyResult {
                upserted: vec![node_id.clone()],
                ..Default::default()
            })
        }
        Operation::Reorder {
            folder_id,
            from_index,
            to_index,
        } => {
            let moved = tree.reorder(folder_id, *from_index, *to_index, ts)?;
            Ok(ApplyResult {
                upserted: vec![moved],
                ..Default::default()
            })
        }
        Operation::ToggleFolder { folder_id, open } => {
            tree.toggle_open(folder_id, *open, ts)?;
            Ok(ApplyResult {
                upserted: vec![folder_id.clone()],
                ..Default::default()
            })
        }
        Operation::MarkFolderLoaded { folder_id } => {
            tree.mark_loaded(folder_id, ts)?;
            Ok(ApplyResult {
                upserted: vec![folder_id.clone()],
                ..Default::default()
            })
        }
        Operation::HydrateNode {
            node_id,
            node_data,
            children,
        } => {
            let change = tree.replace_subtree(node_id, node_data, children, ts)?;
            Ok(ApplyResult {
                upserted: change.upserted,
                removed: change.removed,
            })
        }
    }
}

/// The append-only in-memory log. Entries are kept in append order, which
/// by construction is `ts` order (the kernel's clock never goes
/// backwards).
#[derive(Debug, Default)]
pub struct OperationLog {
    entries: Vec<OpEnvelope>,
    ids: HashSet<Guid>,
}

impl OperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the log from persisted envelopes, already sorted by
    /// `(ts, seq)`.
    pub fn from_entries(entries: Vec<OpEnvelope>) -> Self {
        let ids = entries.iter().map(|e| e.id.clone()).collect();
        OperationLog { entries, ids }
    }

    pub fn contains(&self, id: &Guid) -> bool {
        self.ids.contains(id)
    }

    pub fn append(&mut self, env: OpEnvelope) -> Result<()> {
        if self.ids.contains(&env.id) {
            return Err(Error::DuplicateId(env.id));
        }
        self.ids.insert(env.id.clone());
        self.entries.push(env);
        Ok(())
    }

    pub fn entries(&self) -> &[OpEnvelope] {
        &self.entries
    }

    /// Immutable snapshot of the whole log.
    pub fn snapshot(&self) -> Vec<OpEnvelope> {
        self.entries.clone()
    }

    pub fn get(&self, id: &Guid) -> Option<&OpEnvelope> {
        self.entries.iter().find(|e| &e.id == id)
    }

    pub fn mark_processed(&mut self, id: &Guid) -> bool {
        match self.entries.iter_mut().find(|e| &e.id == id) {
            Some(e) if !e.processed => {
                e.processed = true;
                true
            }
            _ => false,
        }
    }

    /// Increments and returns the retry count for a failed delivery.
    pub fn bump_retry(&mut self, id: &Guid) -> Option<u32> {
        self.entries.iter_mut().find(|e| &e.id == id).map(|e| {
            e.retry_count += 1;
            e.retry_count
        })
    }

    pub fn reset_retry(&mut self, id: &Guid) {
        if let Some(e) = self.entries.iter_mut().find(|e| &e.id == id) {
            e.retry_count = 0;
        }
    }

    /// Local envelopes the server hasn't acknowledged, in `ts` order.
    pub fn pending(&self) -> impl Iterator<Item = &OpEnvelope> {
        self.entries.iter().filter(|e| !e.remote && !e.processed)
    }

    pub fn pending_count(&self) -> u32 {
        self.pending().count() as u32
    }

    /// The newest timestamp in the log, as a floor for the clock after a
    /// restart.
    pub fn max_ts(&self) -> Timestamp {
        self.entries.last().map(|e| e.ts).unwrap_or(Timestamp(0))
    }
}

/// Rebuilds a tree from scratch by applying envelopes in order. An
/// envelope that no longer applies (its subtree was superseded by a later
/// baseline in a previous life, say) is skipped, not fatal.
pub fn replay<'a>(entries: impl IntoIterator<Item = &'a OpEnvelope>) -> Tree {
    let mut tree = Tree::new();
    for env in entries {
        if let Err(e) = apply_op(&mut tree, &env.op, env.ts) {
            log::warn!("replay: skipping {} ({}): {}", env.op.kind(), env.id, e);
        }
    }
    tree
}
