/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use crate::error::{Error, Result};
use rusqlite::Connection;

/// Current schema version, stored in `PRAGMA user_version`. A database
/// reporting a different non-zero version triggers a supervised reset in
/// [`super::BookmarksStorage`].
pub(super) const VERSION: u32 = 1;

const CREATE_SCHEMA_SQL: &str = "
    CREATE TABLE IF NOT EXISTS operations (
        guid            TEXT NOT NULL PRIMARY KEY,
        namespace       TEXT NOT NULL,
        ts              INTEGER NOT NULL,
        payload         TEXT NOT NULL,
        processed       INTEGER NOT NULL DEFAULT 0,
        remote          INTEGER NOT NULL DEFAULT 0,
        retry_count     INTEGER NOT NULL DEFAULT 0
    );
    -- Ordered scans; ties on ts fall back to insertion order via rowid.
    CREATE INDEX IF NOT EXISTS idx_operations_scan
        ON operations(namespace, ts);
    CREATE INDEX IF NOT EXISTS idx_operations_pending
        ON operations(namespace, processed, remote);

    CREATE TABLE IF NOT EXISTS nodes (
        guid            TEXT NOT NULL,
        namespace       TEXT NOT NULL,
        parent_guid     TEXT,
        kind            INTEGER NOT NULL,
        title           TEXT NOT NULL DEFAULT '',
        url             TEXT,
        order_key       TEXT NOT NULL,
        is_open         INTEGER NOT NULL DEFAULT 0,
        is_loaded       INTEGER NOT NULL DEFAULT 0,
        created_at      INTEGER NOT NULL,
        updated_at      INTEGER NOT NULL,
        PRIMARY KEY (namespace, guid)
    );
    CREATE INDEX IF NOT EXISTS idx_nodes_parent
        ON nodes(namespace, parent_guid);

    CREATE TABLE IF NOT EXISTS folder_metadata (
        namespace           TEXT NOT NULL,
        folder_guid         TEXT NOT NULL,
        has_loaded_children INTEGER NOT NULL DEFAULT 0,
        last_loaded_at      INTEGER,
        children_count      INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (namespace, folder_guid)
    );

    CREATE TABLE IF NOT EXISTS sync_meta (
        namespace       TEXT NOT NULL PRIMARY KEY,
        last_sync_at    INTEGER,
        pending_count   INTEGER NOT NULL DEFAULT 0,
        client_id       TEXT NOT NULL
    );
";

pub(super) fn prepare(conn: &Connection) -> Result<()> {
    let initial_pragmas = "
        -- We don't care about temp tables being persisted to disk.
        PRAGMA temp_store = 2;
        -- we unconditionally want write-ahead-logging mode.
        PRAGMA journal_mode = WAL;
        PRAGMA foreign_keys = ON;
    ";
    conn.execute_batch(initial_pragmas)?;
    conn.set_prepared_statement_cache_capacity(128);
    Ok(())
}

/// Initializes or verifies the schema on an open connection.
pub(super) fn init(conn: &Connection) -> Result<()> {
    prepare(conn)?;
    let version = get_version(conn)?;
    match version {
        0 => {
            log::debug!("bookmarks storage: creating schema v{}", VERSION);
            let tx = conn.unchecked_transaction()?;
            tx.execute_batch(CREATE_SCHEMA_SQL)?;
            tx.pragma_update(None, "user_version", VERSION)?;
            tx.commit()?;
            Ok(())
        }
        VERSION => Ok(()),
        other => Err(Error::VersionMismatch(other)),
    }
}

fn get_version(conn: &Connection) -> Result<u32> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_schema_twice() {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn).unwrap();
        conn.execute_batch(CREATE_SCHEMA_SQL)
            .expect("should allow running twice");
        assert_eq!(get_version(&conn).unwrap(), VERSION);
    }

    #[test]
    fn version_mismatch_is_reported() {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", 99).unwrap();
        assert!(matches!(init(&conn), Err(Error::VersionMismatch(99))));
    }
}
