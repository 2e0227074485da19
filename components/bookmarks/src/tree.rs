/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The in-memory bookmark tree, materialized from the operation log.
//!
//! Nodes live in a flat id-keyed map; parent/child relationships are
//! encoded by id only, with an ordered child list per folder. Sibling order
//! is the lexicographic order of fractional index keys (ties broken by id),
//! so inserting or moving a node never renumbers its neighbors.

use crate::error::{Error, Result};
use crate::guid::Guid;
use crate::types::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The distinguished root folder of every namespace.
pub const ROOT_GUID: &str = "root________";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Folder,
    Bookmark,
}

/// The wire shape of a node, used for baselines, hydration payloads and
/// inbound events. Everything but the id is optional-ish so that partial
/// server payloads deserialize; the tree fills in the gaps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeData {
    pub id: Guid,
    #[serde(default)]
    pub parent_id: Option<Guid>,
    pub kind: NodeKind,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub is_open: bool,
    #[serde(default)]
    pub is_loaded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FolderNode {
    pub guid: Guid,
    /// `None` only for the root.
    pub parent: Option<Guid>,
    pub title: String,
    pub is_open: bool,
    /// True once this folder's children have been delivered by the server,
    /// or the folder was created locally.
    pub is_loaded: bool,
    pub order_key: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BookmarkNode {
    pub guid: Guid,
    pub parent: Guid,
    pub title: String,
    pub url: String,
    pub order_key: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Folder(FolderNode),
    Bookmark(BookmarkNode),
}

impl Node {
    pub fn guid(&self) -> &Guid {
        match self {
            Node::Folder(f) => &f.guid,
            Node::Bookmark(b) => &b.guid,
        }
    }

    pub fn parent(&self) -> Option<&Guid> {
        match self {
            Node::Folder(f) => f.parent.as_ref(),
            Node::Bookmark(b) => Some(&b.parent),
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Folder(_) => NodeKind::Folder,
            Node::Bookmark(_) => NodeKind::Bookmark,
        }
    }

    pub fn is_folder(&self) -> bool {
        matches!(self, Node::Folder(_))
    }

    pub fn title(&self) -> &str {
        match self {
            Node::Folder(f) => &f.title,
            Node::Bookmark(b) => &b.title,
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            Node::Folder(_) => None,
            Node::Bookmark(b) => Some(&b.url),
        }
    }

    pub fn order_key(&self) -> &str {
        match self {
            Node::Folder(f) => &f.order_key,
            Node::Bookmark(b) => &b.order_key,
        }
    }

    pub fn created_at(&self) -> Timestamp {
        match self {
            Node::Folder(f) => f.created_at,
            Node::Bookmark(b) => b.created_at,
        }
    }

    pub fn updated_at(&self) -> Timestamp {
        match self {
            Node::Folder(f) => f.updated_at,
            Node::Bookmark(b) => b.updated_at,
        }
    }

    fn set_order_key(&mut self, key: String) {
        match self {
            Node::Folder(f) => f.order_key = key,
            Node::Bookmark(b) => b.order_key = key,
        }
    }

    fn set_parent(&mut self, parent: Guid) {
        match self {
            Node::Folder(f) => f.parent = Some(parent),
            Node::Bookmark(b) => b.parent = parent,
        }
    }

    fn touch(&mut self, ts: Timestamp) {
        match self {
            Node::Folder(f) => f.updated_at = f.updated_at.max(ts),
            Node::Bookmark(b) => b.updated_at = b.updated_at.max(ts),
        }
    }

    pub fn to_data(&self) -> NodeData {
        NodeData {
            id: self.guid().clone(),
            parent_id: self.parent().cloned(),
            kind: self.kind(),
            title: self.title().into(),
            url: self.url().map(Into::into),
            is_open: matches!(self, Node::Folder(f) if f.is_open),
            is_loaded: matches!(self, Node::Folder(f) if f.is_loaded),
            order_key: Some(self.order_key().into()),
            created_at: Some(self.created_at()),
            updated_at: Some(self.updated_at()),
        }
    }
}

/// A nested, immutable view of a subtree, returned over the tab RPC
/// surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSnapshot {
    pub id: Guid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Guid>,
    pub kind: NodeKind,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub order_key: String,
    pub is_open: bool,
    pub is_loaded: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    #[serde(default)]
    pub children: Vec<NodeSnapshot>,
}

/// What a subtree replacement touched, so the caller can mirror it to
/// storage.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SubtreeChange {
    pub removed: Vec<Guid>,
    pub upserted: Vec<Guid>,
}

fn node_from_data(data: &NodeData, parent: Guid, key: String, ts: Timestamp) -> Node {
    let created = data.created_at.unwrap_or(ts);
    let updated = data.updated_at.unwrap_or(ts);
    match data.kind {
        NodeKind::Folder => Node::Folder(FolderNode {
            guid: data.id.clone(),
            parent: Some(parent),
            title: data.title.clone(),
            is_open: data.is_open,
            is_loaded: data.is_loaded,
            order_key: key,
            created_at: created,
            updated_at: updated,
        }),
        NodeKind::Bookmark => Node::Bookmark(BookmarkNode {
            guid: data.id.clone(),
            parent,
            title: data.title.clone(),
            url: data.url.clone().unwrap_or_default(),
            order_key: key,
            created_at: created,
            updated_at: updated,
        }),
    }
}

#[derive(Debug, Clone)]
pub struct Tree {
    root: Guid,
    nodes: HashMap<Guid, Node>,
    /// Ordered child ids per folder, sorted by `(order_key, guid)`.
    children: HashMap<Guid, Vec<Guid>>,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    pub fn new() -> Self {
        let root = Guid::from(ROOT_GUID);
        let mut nodes = HashMap::new();
        let mut children = HashMap::new();
        nodes.insert(
            root.clone(),
            Node::Folder(FolderNode {
                guid: root.clone(),
                parent: None,
                title: String::new(),
                is_open: true,
                is_loaded: false,
                order_key: fracdex::key_between(None, None).expect("constant bounds"),
                created_at: Timestamp(0),
                updated_at: Timestamp(0),
            }),
        );
        children.insert(root.clone(), Vec::new());
        Tree {
            root,
            nodes,
            children,
        }
    }

    pub fn root(&self) -> &Guid {
        &self.root
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn get(&self, guid: &Guid) -> Option<&Node> {
        self.nodes.get(guid)
    }

    pub fn require(&self, guid: &Guid) -> Result<&Node> {
        self.nodes
            .get(guid)
            .ok_or_else(|| Error::NodeMissing(guid.clone()))
    }

    pub fn require_folder(&self, guid: &Guid) -> Result<&FolderNode> {
        match self.require(guid)? {
            Node::Folder(f) => Ok(f),
            Node::Bookmark(_) => Err(Error::NotAFolder(guid.clone())),
        }
    }

    /// Ordered child ids of a folder.
    pub fn child_ids(&self, folder: &Guid) -> Result<&[Guid]> {
        self.require_folder(folder)?;
        Ok(self.children.get(folder).map(Vec::as_slice).unwrap_or(&[]))
    }

    /// Children of a folder, in sibling order.
    pub fn list_children(&self, folder: &Guid) -> Result<Vec<&Node>> {
        Ok(self
            .child_ids(folder)?
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .collect())
    }

    /// Whether `guid` is `ancestor` itself or sits anywhere below it.
    pub fn is_self_or_descendant(&self, guid: &Guid, ancestor: &Guid) -> bool {
        let mut cur = Some(guid);
        // The parent chain is acyclic by construction; the bound guards
        // against a corrupted map looping forever.
        for _ in 0..=self.nodes.len() {
            match cur {
                None => return false,
                Some(id) if id == ancestor => return true,
                Some(id) => cur = self.nodes.get(id).and_then(|n| n.parent()),
            }
        }
        false
    }

    /// All ids below `guid`, depth-first. Does not include `guid` itself.
    pub fn descendants(&self, guid: &Guid) -> Vec<Guid> {
        let mut out = Vec::new();
        let mut stack: Vec<Guid> = self
            .children
            .get(guid)
            .map(|c| c.iter().rev().cloned().collect())
            .unwrap_or_default();
        while let Some(id) = stack.pop() {
            if let Some(kids) = self.children.get(&id) {
                stack.extend(kids.iter().rev().cloned());
            }
            out.push(id);
        }
        out
    }

    /// Picks an order key for a node entering `parent` at `index`
    /// (appending when `index` is `None` or past the end). `exclude` is the
    /// node being repositioned, if any, so it doesn't count as its own
    /// neighbor.
    fn key_at(&self, parent: &Guid, index: Option<usize>, exclude: Option<&Guid>) -> Result<String> {
        let siblings: Vec<&Guid> = self
            .children
            .get(parent)
            .map(|c| c.iter().filter(|id| Some(*id) != exclude).collect())
            .unwrap_or_default();
        let at = index.unwrap_or(siblings.len()).min(siblings.len());
        let left = at
            .checked_sub(1)
            .and_then(|i| siblings.get(i))
            .map(|id| self.nodes[*id].order_key());
        let right = siblings.get(at).map(|id| self.nodes[*id].order_key());
        Ok(fracdex::key_between(left, right)?)
    }

    fn place_in_parent(&mut self, parent: &Guid, guid: Guid) {
        let key = self.nodes[&guid].order_key().to_string();
        let at = {
            let list: &[Guid] = self.children.get(parent).map(Vec::as_slice).unwrap_or(&[]);
            list.iter()
                .position(|id| {
                    let k = self.nodes[id].order_key();
                    (k, id.as_str()) > (key.as_str(), guid.as_str())
                })
                .unwrap_or(list.len())
        };
        self.children
            .entry(parent.clone())
            .or_default()
            .insert(at, guid);
    }

    /// Inserts a new node. The node's parent field names the target folder;
    /// its order key is chosen here from the neighbors at `index`.
    pub fn insert(&mut self, mut node: Node, index: Option<usize>) -> Result<()> {
        let guid = node.guid().clone();
        if self.nodes.contains_key(&guid) {
            return Err(Error::DuplicateId(guid));
        }
        let parent = node
            .parent()
            .cloned()
            .ok_or_else(|| Error::BadArgument("new nodes need a parent folder".into()))?;
        self.require_folder(&parent)?;
        let key = self.key_at(&parent, index, None)?;
        node.set_order_key(key);
        if let Node::Folder(_) = node {
            self.children.entry(guid.clone()).or_default();
        }
        self.nodes.insert(guid.clone(), node);
        self.place_in_parent(&parent, guid);
        Ok(())
    }

    /// Removes a node from its parent's child list. The node record itself
    /// stays in the map until a removal completes.
    pub fn detach(&mut self, guid: &Guid) -> Result<()> {
        let parent = self
            .require(guid)?
            .parent()
            .cloned()
            .ok_or_else(|| Error::BadArgument("cannot detach the root folder".into()))?;
        if let Some(list) = self.children.get_mut(&parent) {
            list.retain(|id| id != guid);
        }
        Ok(())
    }

    /// Moves a node under `to_folder` at `index`. Rejects moves that would
    /// make a folder its own ancestor. A move within the same parent only
    /// consults the target neighbors for its new key.
    pub fn move_node(
        &mut self,
        guid: &Guid,
        to_folder: &Guid,
        index: Option<usize>,
        ts: Timestamp,
    ) -> Result<()> {
        let node = self.require(guid)?;
        if node.parent().is_none() {
            return Err(Error::BadArgument("cannot move the root folder".into()));
        }
        self.require_folder(to_folder)?;
        if self.is_self_or_descendant(to_folder, guid) {
            return Err(Error::CycleForbidden(guid.clone(), to_folder.clone()));
        }
        let key = self.key_at(to_folder, index, Some(guid))?;
        self.detach(guid)?;
        let node = self.nodes.get_mut(guid).expect("checked above");
        node.set_parent(to_folder.clone());
        node.set_order_key(key);
        node.touch(ts);
        self.place_in_parent(&to_folder.clone(), guid.clone());
        Ok(())
    }

    /// Deletes a node and everything below it. Returns the removed ids,
    /// deepest-last, starting with `guid`.
    pub fn remove(&mut self, guid: &Guid) -> Result<Vec<Guid>> {
        let node = self.require(guid)?;
        if node.parent().is_none() {
            return Err(Error::BadArgument("cannot remove the root folder".into()));
        }
        self.detach(guid)?;
        let mut removed = vec![guid.clone()];
        removed.extend(self.descendants(guid));
        for id in &removed {
            self.nodes.remove(id);
            self.children.remove(id);
        }
        Ok(removed)
    }

    /// Repositions the child at `from` to sit at `to` among its siblings.
    /// Only the moved child gets a new order key. Returns its id.
    pub fn reorder(
        &mut self,
        folder: &Guid,
        from: usize,
        to: usize,
        ts: Timestamp,
    ) -> Result<Guid> {
        let len = self.child_ids(folder)?.len();
        if from >= len {
            return Err(Error::BadArgument(format!(
                "reorder index {} out of range for {} children",
                from, len
            )));
        }
        let moved = self.children[folder][from].clone();
        // `to` is a position in the list without the moved child; clamp
        // rather than reject so "move to end" is easy to express.
        let to = to.min(len - 1);
        let key = self.key_at(folder, Some(to), Some(&moved))?;
        if let Some(list) = self.children.get_mut(folder) {
            list.retain(|id| id != &moved);
        }
        let node = self.nodes.get_mut(&moved).expect("child ids are live");
        node.set_order_key(key);
        node.touch(ts);
        self.place_in_parent(&folder.clone(), moved.clone());
        Ok(moved)
    }

    /// Sets or flips a folder's open state; returns the new value.
    pub fn toggle_open(&mut self, folder: &Guid, open: Option<bool>, ts: Timestamp) -> Result<bool> {
        self.require_folder(folder)?;
        match self.nodes.get_mut(folder) {
            Some(Node::Folder(f)) => {
                f.is_open = open.unwrap_or(!f.is_open);
                f.updated_at = f.updated_at.max(ts);
                Ok(f.is_open)
            }
            _ => unreachable!("require_folder above"),
        }
    }

    pub fn mark_loaded(&mut self, folder: &Guid, ts: Timestamp) -> Result<()> {
        self.require_folder(folder)?;
        if let Some(Node::Folder(f)) = self.nodes.get_mut(folder) {
            f.is_loaded = true;
            f.updated_at = f.updated_at.max(ts);
        }
        Ok(())
    }

    /// Replaces the subtree rooted at `node_id` with authoritative data:
    /// the node keeps its place among its siblings, every old descendant
    /// goes away, and `children` become its new (only) children. Folders
    /// among the new children start unloaded unless the data says
    /// otherwise; their contents arrive through later hydrations.
    pub fn replace_subtree(
        &mut self,
        node_id: &Guid,
        data: &NodeData,
        children: &[NodeData],
        ts: Timestamp,
    ) -> Result<SubtreeChange> {
        if &data.id != node_id {
            return Err(Error::BadArgument(
                "hydration data id does not match target".into(),
            ));
        }
        let mut change = SubtreeChange::default();

        // Drop the old descendants first.
        change.removed = self.descendants(node_id);
        for id in &change.removed {
            self.nodes.remove(id);
            self.children.remove(id);
        }

        match self.nodes.get(node_id).cloned() {
            Some(old) => {
                // Keep identity and position; take the rest from the data.
                let mut replacement = match old {
                    Node::Folder(ref f) if f.parent.is_none() => {
                        // The root keeps its special shape.
                        Node::Folder(FolderNode {
                            title: data.title.clone(),
                            is_open: data.is_open,
                            updated_at: ts,
                            ..f.clone()
                        })
                    }
                    _ => {
                        let parent = old.parent().cloned().expect("non-root has a parent");
                        node_from_data(data, parent, old.order_key().to_string(), ts)
                    }
                };
                if let Node::Folder(f) = &mut replacement {
                    f.is_loaded = true;
                }
                self.nodes.insert(node_id.clone(), replacement);
            }
            None => {
                // A node we've never seen: attach it under its stated
                // parent, appended at the end.
                let parent = data
                    .parent_id
                    .clone()
                    .ok_or_else(|| Error::BadArgument("hydration data without a parent".into()))?;
                self.require_folder(&parent)?;
                let key = self.key_at(&parent, None, None)?;
                let mut node = node_from_data(data, parent.clone(), key, ts);
                if let Node::Folder(f) = &mut node {
                    f.is_loaded = true;
                }
                self.nodes.insert(node_id.clone(), node);
                self.place_in_parent(&parent, node_id.clone());
            }
        }
        change.upserted.push(node_id.clone());

        if self.nodes[node_id].is_folder() {
            // Fresh child list: server keys when they're usable, generated
            // ones otherwise.
            let mut list = Vec::with_capacity(children.len());
            let mut prev_key: Option<String> = None;
            for child in children {
                let key = match &child.order_key {
                    Some(k)
                        if fracdex::is_valid_key(k)
                            && prev_key.as_deref().map_or(true, |p| p < k.as_str()) =>
                    {
                        k.clone()
                    }
                    _ => fracdex::key_between(prev_key.as_deref(), None)?,
                };
                prev_key = Some(key.clone());
                let node = node_from_data(child, node_id.clone(), key, ts);
                if node.is_folder() {
                    self.children.entry(child.id.clone()).or_default();
                }
                self.nodes.insert(child.id.clone(), node);
                list.push(child.id.clone());
                change.upserted.push(child.id.clone());
            }
            list.sort_by(|a, b| {
                (self.nodes[a].order_key(), a.as_str()).cmp(&(self.nodes[b].order_key(), b.as_str()))
            });
            self.children.insert(node_id.clone(), list);
        } else {
            // The node changed kind out of folderhood; no child list.
            self.children.remove(node_id);
        }
        Ok(change)
    }

    /// Overwrites a node's timestamps with server-canonical values, as a
    /// targeted reconciliation after a delivery. Returns false if the node
    /// is gone (superseded meanwhile), which is fine.
    pub fn reconcile_timestamps(
        &mut self,
        guid: &Guid,
        created: Option<Timestamp>,
        updated: Option<Timestamp>,
    ) -> bool {
        match self.nodes.get_mut(guid) {
            None => false,
            Some(node) => {
                match node {
                    Node::Folder(f) => {
                        if let Some(c) = created {
                            f.created_at = c;
                        }
                        if let Some(u) = updated {
                            f.updated_at = u;
                        }
                    }
                    Node::Bookmark(b) => {
                        if let Some(c) = created {
                            b.created_at = c;
                        }
                        if let Some(u) = updated {
                            b.updated_at = u;
                        }
                    }
                }
                true
            }
        }
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        self.node_snapshot(&self.root)
            .expect("the root always exists")
    }

    pub fn node_snapshot(&self, guid: &Guid) -> Option<NodeSnapshot> {
        let node = self.nodes.get(guid)?;
        let children = self
            .children
            .get(guid)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.node_snapshot(id))
                    .collect()
            })
            .unwrap_or_default();
        Some(NodeSnapshot {
            id: node.guid().clone(),
            parent_id: node.parent().cloned(),
            kind: node.kind(),
            title: node.title().into(),
            url: node.url().map(Into::into),
            order_key: node.order_key().into(),
            is_open: matches!(node, Node::Folder(f) if f.is_open),
            is_loaded: matches!(node, Node::Folder(f) if f.is_loaded),
            created_at: node.created_at(),
            updated_at: node.updated_at(),
            children,
        })
    }

    /// Structural self-check used by tests: referential integrity, child
    /// ordering, acyclicity.
    pub fn check_consistency(&self) -> std::result::Result<(), String> {
        for (guid, node) in &self.nodes {
            match node.parent() {
                None => {
                    if guid != &self.root {
                        return Err(format!("{} has no parent but is not the root", guid));
                    }
                }
                Some(parent) => {
                    match self.nodes.get(parent) {
                        Some(Node::Folder(_)) => {}
                        Some(_) => return Err(format!("parent of {} is not a folder", guid)),
                        None => return Err(format!("parent of {} is missing", guid)),
                    }
                    if !self
                        .children
                        .get(parent)
                        .map_or(false, |c| c.contains(guid))
                    {
                        return Err(format!("{} missing from parent's child list", guid));
                    }
                    if !self.is_self_or_descendant(guid, &self.root) {
                        return Err(format!("{} does not reach the root", guid));
                    }
                }
            }
        }
        for (folder, ids) in &self.children {
            if !matches!(self.nodes.get(folder), Some(Node::Folder(_))) {
                return Err(format!("child list for non-folder {}", folder));
            }
            for id in ids {
                match self.nodes.get(id) {
                    Some(n) if n.parent() == Some(folder) => {}
                    Some(_) => return Err(format!("{} listed under wrong parent", id)),
                    None => return Err(format!("child list references missing {}", id)),
                }
            }
            let mut sorted = ids.clone();
            sorted.sort_by(|a, b| {
                (self.nodes[a].order_key(), a.as_str()).cmp(&(self.nodes[b].order_key(), b.as_str()))
            });
            if &sorted != ids {
                return Err(format!("children of {} out of order", folder));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn folder(guid: &str, parent: &Guid) -> Node {
        Node::Folder(FolderNode {
            guid: guid.into(),
            parent: Some(parent.clone()),
            title: format!("folder {}", guid),
            is_open: false,
            is_loaded: true,
            order_key: String::new(),
            created_at: Timestamp(1),
            updated_at: Timestamp(1),
        })
    }

    fn bookmark(guid: &str, parent: &Guid) -> Node {
        Node::Bookmark(BookmarkNode {
            guid: guid.into(),
            parent: parent.clone(),
            title: format!("bookmark {}", guid),
            url: format!("https://example.com/{}", guid),
            order_key: String::new(),
            created_at: Timestamp(1),
            updated_at: Timestamp(1),
        })
    }

    fn titles(tree: &Tree, folder: &Guid) -> Vec<String> {
        tree.list_children(folder)
            .unwrap()
            .iter()
            .map(|n| n.guid().to_string())
            .collect()
    }

    #[test]
    fn starts_with_a_root() {
        let tree = Tree::new();
        assert_eq!(tree.root().as_str(), ROOT_GUID);
        assert!(tree.require_folder(tree.root()).is_ok());
        assert!(tree.list_children(tree.root()).unwrap().is_empty());
        tree.check_consistency().unwrap();
    }

    #[test]
    fn insert_and_order() {
        let mut tree = Tree::new();
        let root = tree.root().clone();
        tree.insert(bookmark("b1", &root), None).unwrap();
        tree.insert(bookmark("b2", &root), None).unwrap();
        // An index inserts before the sibling currently at that position.
        tree.insert(bookmark("b0", &root), Some(0)).unwrap();
        assert_eq!(titles(&tree, &root), vec!["b0", "b1", "b2"]);
        tree.check_consistency().unwrap();
    }

    #[test]
    fn insert_rejects_bad_targets() {
        let mut tree = Tree::new();
        let root = tree.root().clone();
        tree.insert(bookmark("b1", &root), None).unwrap();
        assert!(matches!(
            tree.insert(bookmark("b1", &root), None),
            Err(Error::DuplicateId(_))
        ));
        assert!(matches!(
            tree.insert(bookmark("b2", &Guid::from("nope")), None),
            Err(Error::NodeMissing(_))
        ));
        let b1 = Guid::from("b1");
        assert!(matches!(
            tree.insert(bookmark("b3", &b1), None),
            Err(Error::NotAFolder(_))
        ));
    }

    #[test]
    fn move_between_folders() {
        let mut tree = Tree::new();
        let root = tree.root().clone();
        tree.insert(folder("f1", &root), None).unwrap();
        tree.insert(folder("f2", &root), None).unwrap();
        let f1 = Guid::from("f1");
        let f2 = Guid::from("f2");
        tree.insert(bookmark("b1", &f1), None).unwrap();
        let b1 = Guid::from("b1");

        tree.move_node(&b1, &f2, None, Timestamp(5)).unwrap();
        assert!(titles(&tree, &f1).is_empty());
        assert_eq!(titles(&tree, &f2), vec!["b1"]);
        assert_eq!(tree.get(&b1).unwrap().parent(), Some(&f2));
        tree.check_consistency().unwrap();
    }

    #[test]
    fn move_rejects_cycles() {
        let mut tree = Tree::new();
        let root = tree.root().clone();
        tree.insert(folder("outer", &root), None).unwrap();
        let outer = Guid::from("outer");
        tree.insert(folder("inner", &outer), None).unwrap();
        let inner = Guid::from("inner");

        assert!(matches!(
            tree.move_node(&outer, &inner, None, Timestamp(5)),
            Err(Error::CycleForbidden(_, _))
        ));
        assert!(matches!(
            tree.move_node(&outer, &outer, None, Timestamp(5)),
            Err(Error::CycleForbidden(_, _))
        ));
        // Nothing changed.
        assert_eq!(tree.get(&outer).unwrap().parent(), Some(&root));
        tree.check_consistency().unwrap();
    }

    #[test]
    fn same_parent_move_uses_target_neighbors() {
        let mut tree = Tree::new();
        let root = tree.root().clone();
        for g in ["a", "b", "c"] {
            tree.insert(bookmark(g, &root), None).unwrap();
        }
        let c = Guid::from("c");
        tree.move_node(&c, &root, Some(0), Timestamp(5)).unwrap();
        assert_eq!(titles(&tree, &root), vec!["c", "a", "b"]);
        tree.check_consistency().unwrap();
    }

    #[test]
    fn reorder_only_rekeys_the_moved_child() {
        let mut tree = Tree::new();
        let root = tree.root().clone();
        for g in ["a", "b", "c"] {
            tree.insert(bookmark(g, &root), None).unwrap();
        }
        let key = |tree: &Tree, g: &str| {
            tree.get(&Guid::from(g)).unwrap().order_key().to_string()
        };
        let (ka, kb) = (key(&tree, "a"), key(&tree, "b"));

        tree.reorder(&root, 2, 0, Timestamp(5)).unwrap();
        assert_eq!(titles(&tree, &root), vec!["c", "a", "b"]);
        assert!(key(&tree, "c") < key(&tree, "a"));
        assert_eq!(key(&tree, "a"), ka);
        assert_eq!(key(&tree, "b"), kb);
        tree.check_consistency().unwrap();

        assert!(matches!(
            tree.reorder(&root, 7, 0, Timestamp(6)),
            Err(Error::BadArgument(_))
        ));
    }

    #[test]
    fn remove_deletes_the_whole_subtree() {
        let mut tree = Tree::new();
        let root = tree.root().clone();
        tree.insert(folder("f", &root), None).unwrap();
        let f = Guid::from("f");
        tree.insert(bookmark("b1", &f), None).unwrap();
        tree.insert(folder("sub", &f), None).unwrap();
        tree.insert(bookmark("b2", &Guid::from("sub")), None).unwrap();

        let removed = tree.remove(&f).unwrap();
        assert_eq!(removed.len(), 4);
        for g in ["f", "b1", "sub", "b2"] {
            assert!(tree.get(&Guid::from(g)).is_none(), "{} should be gone", g);
        }
        assert!(matches!(
            tree.remove(&tree.root().clone()),
            Err(Error::BadArgument(_))
        ));
        tree.check_consistency().unwrap();
    }

    #[test]
    fn toggle_round_trips() {
        let mut tree = Tree::new();
        let root = tree.root().clone();
        tree.insert(folder("f", &root), None).unwrap();
        let f = Guid::from("f");
        let before = tree.get(&f).unwrap().updated_at();

        assert!(tree.toggle_open(&f, Some(true), Timestamp(10)).unwrap());
        assert!(!tree.toggle_open(&f, None, Timestamp(11)).unwrap());
        let after = tree.get(&f).unwrap();
        match after {
            Node::Folder(fo) => assert!(!fo.is_open),
            _ => unreachable!(),
        }
        assert!(after.updated_at() >= before);
    }

    #[test]
    fn replace_subtree_is_wholesale() {
        let mut tree = Tree::new();
        let root = tree.root().clone();
        tree.insert(folder("f", &root), None).unwrap();
        let f = Guid::from("f");
        tree.insert(bookmark("stale", &f), None).unwrap();

        let data = NodeData {
            id: f.clone(),
            parent_id: Some(root.clone()),
            kind: NodeKind::Folder,
            title: "fresh".into(),
            url: None,
            is_open: true,
            is_loaded: true,
            order_key: None,
            created_at: None,
            updated_at: None,
        };
        let children = vec![
            NodeData {
                id: "new1".into(),
                parent_id: Some(f.clone()),
                kind: NodeKind::Bookmark,
                title: "one".into(),
                url: Some("https://example.com/1".into()),
                is_open: false,
                is_loaded: false,
                order_key: None,
                created_at: None,
                updated_at: None,
            },
            NodeData {
                id: "new2".into(),
                parent_id: Some(f.clone()),
                kind: NodeKind::Folder,
                title: "two".into(),
                url: None,
                is_open: false,
                is_loaded: false,
                order_key: None,
                created_at: None,
                updated_at: None,
            },
        ];
        let change = tree.replace_subtree(&f, &data, &children, Timestamp(20)).unwrap();
        assert_eq!(change.removed, vec![Guid::from("stale")]);
        assert_eq!(change.upserted.len(), 3);
        assert!(tree.get(&Guid::from("stale")).is_none());
        assert_eq!(titles(&tree, &f), vec!["new1", "new2"]);
        assert_eq!(tree.get(&f).unwrap().title(), "fresh");
        // A hydrated folder child is present but unloaded.
        match tree.get(&Guid::from("new2")).unwrap() {
            Node::Folder(sub) => assert!(!sub.is_loaded),
            _ => unreachable!(),
        }
        tree.check_consistency().unwrap();
    }

    #[test]
    fn snapshots_nest_in_order() {
        let mut tree = Tree::new();
        let root = tree.root().clone();
        tree.insert(folder("f", &root), None).unwrap();
        tree.insert(bookmark("b", &root), Some(0)).unwrap();
        tree.insert(bookmark("inner", &Guid::from("f")), None).unwrap();

        let snap = tree.snapshot();
        assert_eq!(snap.id.as_str(), ROOT_GUID);
        let ids: Vec<&str> = snap.children.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "f"]);
        assert_eq!(snap.children[1].children[0].id.as_str(), "inner");
    }
}
