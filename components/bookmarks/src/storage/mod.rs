/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Durable storage for the kernel: the operation log, the materialized
//! nodes, per-folder load metadata and per-namespace sync metadata.
//!
//! Writes are best-effort from the kernel's point of view: the in-memory
//! model is authoritative and a transiently failed write is retried on the
//! next operation. A database whose schema version we don't recognize gets
//! one supervised reset (delete and recreate).

mod schema;

use crate::error::Result;
use crate::guid::Guid;
use crate::oplog::{OpEnvelope, Operation};
use crate::tree::{BookmarkNode, FolderNode, Node};
use crate::types::Timestamp;
use rusqlite::{named_params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};

const KIND_BOOKMARK: i64 = 1;
const KIND_FOLDER: i64 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FolderMetadata {
    pub has_loaded_children: bool,
    pub last_loaded_at: Option<Timestamp>,
    pub children_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncMeta {
    pub last_sync_at: Option<Timestamp>,
    pub pending_count: u32,
    pub client_id: Guid,
}

enum DatabaseLocation {
    File(PathBuf),
    Memory,
}

impl DatabaseLocation {
    fn open(&self) -> Result<Connection> {
        match self {
            DatabaseLocation::Memory => Ok(Connection::open_in_memory()?),
            DatabaseLocation::File(path) => Ok(Connection::open(path)?),
        }
    }

    fn delete(&self) -> Result<()> {
        if let DatabaseLocation::File(path) = self {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

pub struct BookmarksStorage {
    conn: Connection,
}

impl BookmarksStorage {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(DatabaseLocation::File(path.as_ref().to_path_buf()))
    }

    pub fn new_in_memory() -> Result<Self> {
        Self::open(DatabaseLocation::Memory)
    }

    fn open(location: DatabaseLocation) -> Result<Self> {
        let conn = location.open()?;
        match schema::init(&conn) {
            Ok(()) => Ok(BookmarksStorage { conn }),
            Err(e) => {
                // One supervised reset: delete the file and start over.
                log::warn!("bookmarks storage: resetting database: {}", e);
                drop(conn);
                location.delete()?;
                let conn = location.open()?;
                schema::init(&conn)?;
                Ok(BookmarksStorage { conn })
            }
        }
    }

    // --- operations ---

    pub fn append_operation(&self, namespace: &str, env: &OpEnvelope) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO operations
                 (guid, namespace, ts, payload, processed, remote, retry_count)
             VALUES (:guid, :namespace, :ts, :payload, :processed, :remote, :retry_count)",
            named_params! {
                ":guid": env.id,
                ":namespace": namespace,
                ":ts": env.ts,
                ":payload": serde_json::to_string(&env.op)?,
                ":processed": env.processed,
                ":remote": env.remote,
                ":retry_count": env.retry_count,
            },
        )?;
        Ok(())
    }

    fn envelope_from_row(row: &Row<'_>) -> rusqlite::Result<(Guid, Timestamp, String, bool, bool, u32)> {
        Ok((
            row.get("guid")?,
            row.get("ts")?,
            row.get("payload")?,
            row.get("processed")?,
            row.get("remote")?,
            row.get("retry_count")?,
        ))
    }

    fn collect_envelopes(rows: Vec<(Guid, Timestamp, String, bool, bool, u32)>) -> Vec<OpEnvelope> {
        rows.into_iter()
            .filter_map(|(id, ts, payload, processed, remote, retry_count)| {
                match serde_json::from_str::<Operation>(&payload) {
                    Ok(op) => Some(OpEnvelope {
                        id,
                        ts,
                        op,
                        processed,
                        remote,
                        retry_count,
                    }),
                    Err(e) => {
                        log::warn!("dropping undecodable operation {}: {}", id, e);
                        None
                    }
                }
            })
            .collect()
    }

    /// The whole log for a namespace, ordered by `(ts, insertion order)`.
    pub fn get_all_operations(&self, namespace: &str) -> Result<Vec<OpEnvelope>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT guid, ts, payload, processed, remote, retry_count
             FROM operations WHERE namespace = :namespace
             ORDER BY ts, rowid",
        )?;
        let rows = stmt
            .query_map(named_params! { ":namespace": namespace }, |row| {
                Self::envelope_from_row(row)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(Self::collect_envelopes(rows))
    }

    /// Local unacknowledged operations, oldest first.
    pub fn get_pending(&self, namespace: &str) -> Result<Vec<OpEnvelope>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT guid, ts, payload, processed, remote, retry_count
             FROM operations
             WHERE namespace = :namespace AND processed = 0 AND remote = 0
             ORDER BY ts, rowid",
        )?;
        let rows = stmt
            .query_map(named_params! { ":namespace": namespace }, |row| {
                Self::envelope_from_row(row)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(Self::collect_envelopes(rows))
    }

    pub fn mark_processed(&self, namespace: &str, ids: &[Guid]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "UPDATE operations SET processed = 1
                 WHERE namespace = :namespace AND guid = :guid",
            )?;
            for id in ids {
                stmt.execute(named_params! { ":namespace": namespace, ":guid": id })?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Records failed deliveries, bumping each operation's retry count.
    pub fn mark_failed(&self, namespace: &str, ids: &[Guid]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "UPDATE operations SET retry_count = retry_count + 1
                 WHERE namespace = :namespace AND guid = :guid",
            )?;
            for id in ids {
                stmt.execute(named_params! { ":namespace": namespace, ":guid": id })?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn reset_retries(&self, namespace: &str, id: &Guid) -> Result<()> {
        self.conn.execute(
            "UPDATE operations SET retry_count = 0
             WHERE namespace = :namespace AND guid = :guid",
            named_params! { ":namespace": namespace, ":guid": id },
        )?;
        Ok(())
    }

    pub fn pending_count(&self, namespace: &str) -> Result<u32> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM operations
             WHERE namespace = :namespace AND processed = 0 AND remote = 0",
            named_params! { ":namespace": namespace },
            |row| row.get(0),
        )?)
    }

    // --- nodes ---

    pub fn put_node(&self, namespace: &str, node: &Node) -> Result<()> {
        let (kind, url, is_open, is_loaded) = match node {
            Node::Folder(f) => (KIND_FOLDER, None, f.is_open, f.is_loaded),
            Node::Bookmark(b) => (KIND_BOOKMARK, Some(b.url.as_str()), false, false),
        };
        self.conn.execute(
            "INSERT OR REPLACE INTO nodes
                 (guid, namespace, parent_guid, kind, title, url, order_key,
                  is_open, is_loaded, created_at, updated_at)
             VALUES (:guid, :namespace, :parent, :kind, :title, :url, :order_key,
                     :is_open, :is_loaded, :created_at, :updated_at)",
            named_params! {
                ":guid": node.guid(),
                ":namespace": namespace,
                ":parent": node.parent(),
                ":kind": kind,
                ":title": node.title(),
                ":url": url,
                ":order_key": node.order_key(),
                ":is_open": is_open,
                ":is_loaded": is_loaded,
                ":created_at": node.created_at(),
                ":updated_at": node.updated_at(),
            },
        )?;
        Ok(())
    }

    fn node_from_row(row: &Row<'_>) -> rusqlite::Result<Node> {
        let kind: i64 = row.get("kind")?;
        let guid: Guid = row.get("guid")?;
        let parent: Option<Guid> = row.get("parent_guid")?;
        let title: String = row.get("title")?;
        let order_key: String = row.get("order_key")?;
        let created_at: Timestamp = row.get("created_at")?;
        let updated_at: Timestamp = row.get("updated_at")?;
        Ok(if kind == KIND_BOOKMARK {
            Node::Bookmark(BookmarkNode {
                guid,
                parent: parent.unwrap_or_else(|| crate::tree::ROOT_GUID.into()),
                title,
                url: row.get::<_, Option<String>>("url")?.unwrap_or_default(),
                order_key,
                created_at,
                updated_at,
            })
        } else {
            Node::Folder(FolderNode {
                guid,
                parent,
                title,
                is_open: row.get("is_open")?,
                is_loaded: row.get("is_loaded")?,
                order_key,
                created_at,
                updated_at,
            })
        })
    }

    pub fn get_node(&self, namespace: &str, guid: &Guid) -> Result<Option<Node>> {
        Ok(self
            .conn
            .query_row(
                "SELECT guid, parent_guid, kind, title, url, order_key,
                        is_open, is_loaded, created_at, updated_at
                 FROM nodes WHERE namespace = :namespace AND guid = :guid",
                named_params! { ":namespace": namespace, ":guid": guid },
                Self::node_from_row,
            )
            .optional()?)
    }

    pub fn delete_node(&self, namespace: &str, guid: &Guid) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM nodes WHERE namespace = :namespace AND guid = :guid",
            named_params! { ":namespace": namespace, ":guid": guid },
        )?;
        tx.execute(
            "DELETE FROM folder_metadata
             WHERE namespace = :namespace AND folder_guid = :guid",
            named_params! { ":namespace": namespace, ":guid": guid },
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Children of a folder in sibling order.
    pub fn children_of(&self, namespace: &str, folder: &Guid) -> Result<Vec<Node>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT guid, parent_guid, kind, title, url, order_key,
                    is_open, is_loaded, created_at, updated_at
             FROM nodes WHERE namespace = :namespace AND parent_guid = :parent
             ORDER BY order_key, guid",
        )?;
        let rows = stmt.query_map(
            named_params! { ":namespace": namespace, ":parent": folder },
            Self::node_from_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Parentless nodes of a namespace; in practice just the root folder.
    pub fn roots_of(&self, namespace: &str) -> Result<Vec<Node>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT guid, parent_guid, kind, title, url, order_key,
                    is_open, is_loaded, created_at, updated_at
             FROM nodes WHERE namespace = :namespace AND parent_guid IS NULL
             ORDER BY guid",
        )?;
        let rows = stmt.query_map(named_params! { ":namespace": namespace }, Self::node_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // --- folder metadata ---

    pub fn put_folder_metadata(
        &self,
        namespace: &str,
        folder: &Guid,
        meta: &FolderMetadata,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO folder_metadata
                 (namespace, folder_guid, has_loaded_children, last_loaded_at, children_count)
             VALUES (:namespace, :folder, :loaded, :last_loaded_at, :children_count)",
            named_params! {
                ":namespace": namespace,
                ":folder": folder,
                ":loaded": meta.has_loaded_children,
                ":last_loaded_at": meta.last_loaded_at,
                ":children_count": meta.children_count,
            },
        )?;
        Ok(())
    }

    pub fn get_folder_metadata(
        &self,
        namespace: &str,
        folder: &Guid,
    ) -> Result<Option<FolderMetadata>> {
        Ok(self
            .conn
            .query_row(
                "SELECT has_loaded_children, last_loaded_at, children_count
                 FROM folder_metadata
                 WHERE namespace = :namespace AND folder_guid = :folder",
                named_params! { ":namespace": namespace, ":folder": folder },
                |row| {
                    Ok(FolderMetadata {
                        has_loaded_children: row.get(0)?,
                        last_loaded_at: row.get(1)?,
                        children_count: row.get(2)?,
                    })
                },
            )
            .optional()?)
    }

    // --- sync metadata ---

    pub fn get_sync_meta(&self, namespace: &str) -> Result<Option<SyncMeta>> {
        Ok(self
            .conn
            .query_row(
                "SELECT last_sync_at, pending_count, client_id
                 FROM sync_meta WHERE namespace = :namespace",
                named_params! { ":namespace": namespace },
                |row| {
                    Ok(SyncMeta {
                        last_sync_at: row.get(0)?,
                        pending_count: row.get(1)?,
                        client_id: row.get(2)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn put_sync_meta(&self, namespace: &str, meta: &SyncMeta) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO sync_meta
                 (namespace, last_sync_at, pending_count, client_id)
             VALUES (:namespace, :last_sync_at, :pending_count, :client_id)",
            named_params! {
                ":namespace": namespace,
                ":last_sync_at": meta.last_sync_at,
                ":pending_count": meta.pending_count,
                ":client_id": meta.client_id,
            },
        )?;
        Ok(())
    }

    /// Returns the namespace's stable client id, minting one on first use.
    pub fn ensure_client_id(&self, namespace: &str) -> Result<Guid> {
        if let Some(meta) = self.get_sync_meta(namespace)? {
            return Ok(meta.client_id);
        }
        let client_id = Guid::random();
        self.put_sync_meta(
            namespace,
            &SyncMeta {
                last_sync_at: None,
                pending_count: 0,
                client_id: client_id.clone(),
            },
        )?;
        Ok(client_id)
    }

    /// Wipes every collection for a namespace; used when switching.
    pub fn clear(&self, namespace: &str) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        for table in ["operations", "nodes", "folder_metadata", "sync_meta"] {
            tx.execute(
                &format!("DELETE FROM {} WHERE namespace = :namespace", table),
                named_params! { ":namespace": namespace },
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timestamp;

    fn storage() -> BookmarksStorage {
        BookmarksStorage::new_in_memory().unwrap()
    }

    fn envelope(id: &str, ts: u64) -> OpEnvelope {
        OpEnvelope {
            id: id.into(),
            ts: Timestamp(ts),
            op: Operation::CreateBookmark {
                id: format!("node-{}", id).as_str().into(),
                parent_id: None,
                title: "a title".into(),
                url: "https://example.com/".into(),
                index: None,
            },
            processed: false,
            remote: false,
            retry_count: 0,
        }
    }

    #[test]
    fn operations_round_trip_in_order() {
        let store = storage();
        // Equal timestamps keep insertion order.
        store.append_operation("ns", &envelope("e2", 10)).unwrap();
        store.append_operation("ns", &envelope("e3", 10)).unwrap();
        store.append_operation("ns", &envelope("e1", 5)).unwrap();
        store.append_operation("other", &envelope("ex", 1)).unwrap();

        let all = store.get_all_operations("ns").unwrap();
        let ids: Vec<&str> = all.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["e1", "e2", "e3"]);
        assert_eq!(all[0].op, envelope("e1", 5).op);
    }

    #[test]
    fn pending_and_processed() {
        let store = storage();
        store.append_operation("ns", &envelope("e1", 1)).unwrap();
        let mut remote = envelope("e2", 2);
        remote.remote = true;
        store.append_operation("ns", &remote).unwrap();
        assert_eq!(store.pending_count("ns").unwrap(), 1);

        store.mark_failed("ns", &["e1".into()]).unwrap();
        let pending = store.get_pending("ns").unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].retry_count, 1);

        store.mark_processed("ns", &["e1".into()]).unwrap();
        assert!(store.get_pending("ns").unwrap().is_empty());
        assert_eq!(store.pending_count("ns").unwrap(), 0);
    }

    #[test]
    fn nodes_round_trip_and_order() {
        let store = storage();
        let root: Guid = crate::tree::ROOT_GUID.into();
        store
            .put_node(
                "ns",
                &Node::Folder(FolderNode {
                    guid: root.clone(),
                    parent: None,
                    title: String::new(),
                    is_open: true,
                    is_loaded: false,
                    order_key: "a0".into(),
                    created_at: Timestamp(0),
                    updated_at: Timestamp(0),
                }),
            )
            .unwrap();
        for (guid, key) in [("b2", "a2"), ("b1", "a1")] {
            store
                .put_node(
                    "ns",
                    &Node::Bookmark(BookmarkNode {
                        guid: guid.into(),
                        parent: root.clone(),
                        title: guid.into(),
                        url: format!("https://example.com/{}", guid),
                        order_key: key.into(),
                        created_at: Timestamp(1),
                        updated_at: Timestamp(2),
                    }),
                )
                .unwrap();
        }

        let roots = store.roots_of("ns").unwrap();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].guid(), &root);

        let children = store.children_of("ns", &root).unwrap();
        let ids: Vec<&str> = children.iter().map(|n| n.guid().as_str()).collect();
        assert_eq!(ids, vec!["b1", "b2"]);

        let b1 = store.get_node("ns", &"b1".into()).unwrap().unwrap();
        assert_eq!(b1.url(), Some("https://example.com/b1"));

        store.delete_node("ns", &"b1".into()).unwrap();
        assert!(store.get_node("ns", &"b1".into()).unwrap().is_none());
    }

    #[test]
    fn metadata_round_trips() {
        let store = storage();
        let meta = FolderMetadata {
            has_loaded_children: true,
            last_loaded_at: Some(Timestamp(123)),
            children_count: 7,
        };
        store.put_folder_metadata("ns", &"f1".into(), &meta).unwrap();
        assert_eq!(
            store.get_folder_metadata("ns", &"f1".into()).unwrap(),
            Some(meta)
        );
        assert_eq!(store.get_folder_metadata("ns", &"f2".into()).unwrap(), None);

        let client_id = store.ensure_client_id("ns").unwrap();
        assert_eq!(store.ensure_client_id("ns").unwrap(), client_id);
    }

    #[test]
    fn clear_wipes_one_namespace() {
        let store = storage();
        store.append_operation("ns", &envelope("e1", 1)).unwrap();
        store.append_operation("other", &envelope("e2", 1)).unwrap();
        store.ensure_client_id("ns").unwrap();

        store.clear("ns").unwrap();
        assert!(store.get_all_operations("ns").unwrap().is_empty());
        assert!(store.get_sync_meta("ns").unwrap().is_none());
        assert_eq!(store.get_all_operations("other").unwrap().len(), 1);
    }

    #[test]
    fn unknown_version_resets_the_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bookmarks.db");
        {
            let store = BookmarksStorage::new(&path).unwrap();
            store.append_operation("ns", &envelope("e1", 1)).unwrap();
        }
        {
            // Pretend a future version wrote this file.
            let conn = Connection::open(&path).unwrap();
            conn.pragma_update(None, "user_version", 99).unwrap();
        }
        let store = BookmarksStorage::new(&path).unwrap();
        // The reset dropped the old contents.
        assert!(store.get_all_operations("ns").unwrap().is_empty());
    }
}
