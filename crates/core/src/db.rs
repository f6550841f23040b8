// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! SQLite-backed persistent store.
//!
//! The [`Database`] struct is the single source of truth for sync metadata
//! (sync_state), the offline queue (queue_items), conflict records
//! (conflicts), the synchronized domain rows (resources) and the inbound
//! dedup ledger (applied_changes).

use rusqlite::{params, Connection, OptionalExtension, Row};
use sha2::{Digest, Sha256};
use std::path::Path;

use crate::error::{Error, Result};
use crate::model::{
    Action, Conflict, ConflictSide, NewConflict, QueueItem, QueueStatus, Resolution, Resource,
    ResourceKey, SyncState, SyncStatus,
};
use crate::vclock::VectorClock;

/// SQL schema for the sync store.
pub const SCHEMA: &str = r#"
-- Per-resource sync metadata, one row per (org, type, id)
CREATE TABLE IF NOT EXISTS sync_state (
    org_id TEXT NOT NULL,
    resource_type TEXT NOT NULL,
    resource_id TEXT NOT NULL,
    local_version INTEGER NOT NULL DEFAULT 1 CHECK (local_version >= 1),
    remote_version INTEGER NOT NULL DEFAULT 1 CHECK (remote_version >= 1),
    vector_clock TEXT NOT NULL DEFAULT '{}',
    content_address TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    last_synced_at INTEGER,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (org_id, resource_type, resource_id)
);

-- Durable outbound operation log
CREATE TABLE IF NOT EXISTS queue_items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    org_id TEXT NOT NULL,
    action TEXT NOT NULL,
    resource_type TEXT NOT NULL,
    resource_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    version INTEGER NOT NULL,
    vector_clock TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
    last_retry_at INTEGER,
    status TEXT NOT NULL DEFAULT 'pending',
    last_error TEXT
);

-- Divergences, resolved automatically (lww) or waiting for a human (manual)
CREATE TABLE IF NOT EXISTS conflicts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    org_id TEXT NOT NULL,
    resource_type TEXT NOT NULL,
    resource_id TEXT NOT NULL,
    local_data TEXT,
    local_clock TEXT NOT NULL,
    local_version INTEGER NOT NULL,
    remote_data TEXT,
    remote_clock TEXT NOT NULL,
    remote_version INTEGER NOT NULL,
    remote_author TEXT,
    remote_known INTEGER NOT NULL DEFAULT 1,
    resolution_strategy TEXT NOT NULL,
    resolved INTEGER NOT NULL DEFAULT 0,
    resolution TEXT,              -- local|remote|custom|NULL
    resolved_at INTEGER,
    resolved_by TEXT,
    created_at INTEGER NOT NULL
);

-- Synchronized domain rows (knowledge entries, members, projects, ...)
CREATE TABLE IF NOT EXISTS resources (
    org_id TEXT NOT NULL,
    resource_type TEXT NOT NULL,
    resource_id TEXT NOT NULL,
    data TEXT NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (org_id, resource_type, resource_id)
);

-- Inbound changes already processed (dedup by resource + version + author)
CREATE TABLE IF NOT EXISTS applied_changes (
    org_id TEXT NOT NULL,
    resource_type TEXT NOT NULL,
    resource_id TEXT NOT NULL,
    version INTEGER NOT NULL,
    author TEXT NOT NULL,
    applied_at INTEGER NOT NULL,
    PRIMARY KEY (org_id, resource_type, resource_id, version, author)
);

-- Indexes
CREATE INDEX IF NOT EXISTS idx_queue_drain ON queue_items(org_id, status, created_at);
CREATE INDEX IF NOT EXISTS idx_queue_type ON queue_items(org_id, resource_type, status);
CREATE INDEX IF NOT EXISTS idx_conflicts_open ON conflicts(org_id, resolved);
CREATE INDEX IF NOT EXISTS idx_conflicts_resource ON conflicts(org_id, resource_type, resource_id);
CREATE INDEX IF NOT EXISTS idx_sync_state_changed ON sync_state(org_id, resource_type, updated_at);
"#;

/// Parse a string value from the database, returning a rusqlite error on parse failure.
fn parse_db<T: std::str::FromStr>(
    value: &str,
    column: &str,
) -> std::result::Result<T, rusqlite::Error> {
    value.parse().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(Error::CorruptedData(format!(
                "invalid value '{value}' in column '{column}'"
            ))),
        )
    })
}

/// Parse a stored JSON document.
fn parse_json(value: &str, column: &str) -> std::result::Result<serde_json::Value, rusqlite::Error> {
    serde_json::from_str(value).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(Error::CorruptedData(format!("invalid json in column '{column}'"))),
        )
    })
}

fn parse_json_opt(
    value: Option<String>,
    column: &str,
) -> std::result::Result<Option<serde_json::Value>, rusqlite::Error> {
    value.map(|v| parse_json(&v, column)).transpose()
}

/// Content address of a JSON document: SHA-256 over its compact encoding.
pub fn content_address(data: &serde_json::Value) -> String {
    let bytes = data.to_string();
    hex::encode(Sha256::digest(bytes.as_bytes()))
}

/// Run schema creation on a database connection.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

const SYNC_STATE_COLUMNS: &str = "org_id, resource_type, resource_id, local_version,
    remote_version, vector_clock, content_address, status, last_synced_at, updated_at";

const QUEUE_COLUMNS: &str = "id, org_id, action, resource_type, resource_id, payload,
    version, vector_clock, created_at, retry_count, last_retry_at, status, last_error";

const CONFLICT_COLUMNS: &str = "id, org_id, resource_type, resource_id, local_data,
    local_clock, local_version, remote_data, remote_clock, remote_version, remote_author,
    resolution_strategy, resolved, resolution, resolved_at, resolved_by, created_at, remote_known";

fn row_to_sync_state(row: &Row<'_>) -> std::result::Result<SyncState, rusqlite::Error> {
    let clock: String = row.get(5)?;
    let status: String = row.get(7)?;
    Ok(SyncState {
        org_id: row.get(0)?,
        resource_type: row.get(1)?,
        resource_id: row.get(2)?,
        local_version: row.get(3)?,
        remote_version: row.get(4)?,
        vector_clock: parse_db(&clock, "vector_clock")?,
        content_address: row.get(6)?,
        status: parse_db(&status, "status")?,
        last_synced_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn row_to_queue_item(row: &Row<'_>) -> std::result::Result<QueueItem, rusqlite::Error> {
    let action: String = row.get(2)?;
    let payload: String = row.get(5)?;
    let clock: String = row.get(7)?;
    let status: String = row.get(11)?;
    Ok(QueueItem {
        id: row.get(0)?,
        org_id: row.get(1)?,
        action: parse_db(&action, "action")?,
        resource_type: row.get(3)?,
        resource_id: row.get(4)?,
        payload: parse_json(&payload, "payload")?,
        version: row.get(6)?,
        vector_clock: parse_db(&clock, "vector_clock")?,
        created_at: row.get(8)?,
        retry_count: row.get(9)?,
        last_retry_at: row.get(10)?,
        status: parse_db(&status, "status")?,
        last_error: row.get(12)?,
    })
}

fn row_to_conflict(row: &Row<'_>) -> std::result::Result<Conflict, rusqlite::Error> {
    let local_clock: String = row.get(5)?;
    let remote_clock: String = row.get(8)?;
    let strategy: String = row.get(11)?;
    let resolution: Option<String> = row.get(13)?;
    Ok(Conflict {
        id: row.get(0)?,
        org_id: row.get(1)?,
        resource_type: row.get(2)?,
        resource_id: row.get(3)?,
        local: ConflictSide::known(
            parse_json_opt(row.get(4)?, "local_data")?,
            parse_db(&local_clock, "local_clock")?,
            row.get(6)?,
        ),
        remote: ConflictSide {
            data: parse_json_opt(row.get(7)?, "remote_data")?,
            vector_clock: parse_db(&remote_clock, "remote_clock")?,
            version: row.get(9)?,
            known: row.get(17)?,
        },
        remote_author: row.get(10)?,
        resolution_strategy: parse_db(&strategy, "resolution_strategy")?,
        resolved: row.get(12)?,
        resolution: resolution.map(|r| parse_db(&r, "resolution")).transpose()?,
        resolved_at: row.get(14)?,
        resolved_by: row.get(15)?,
        created_at: row.get(16)?,
    })
}

/// Fields needed to insert a queue row.
#[derive(Debug, Clone)]
pub struct NewQueueItem<'a> {
    pub key: &'a ResourceKey,
    pub action: Action,
    pub payload: &'a serde_json::Value,
    pub version: i64,
    pub vector_clock: &'a VectorClock,
}

/// A [`Database`] shared between async tasks.
///
/// The lock is never held across a transport call.
pub type SharedDatabase = std::sync::Arc<tokio::sync::Mutex<Database>>;

/// SQLite database connection with sync store operations.
pub struct Database {
    /// The underlying SQLite connection.
    pub conn: Connection,
}

impl Database {
    /// Open a database connection at the given path, creating and migrating if needed.
    pub fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = FULL;
             PRAGMA busy_timeout = 5000;",
        )?;

        let db = Database { conn };
        run_migrations(&db.conn)?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database { conn };
        run_migrations(&db.conn)?;
        Ok(db)
    }

    /// Wraps the database for sharing between tasks.
    pub fn shared(self) -> SharedDatabase {
        std::sync::Arc::new(tokio::sync::Mutex::new(self))
    }

    /// Runs `f` as one atomic unit.
    ///
    /// Backed by a savepoint, so calls nest: an inner unit commits into the
    /// outer one and an error rolls back only its own writes.
    pub fn atomically<T>(&self, f: impl FnOnce(&Database) -> Result<T>) -> Result<T> {
        self.conn.execute_batch("SAVEPOINT orgsync")?;
        match f(self) {
            Ok(value) => {
                self.conn.execute_batch("RELEASE orgsync")?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = self.conn.execute_batch("ROLLBACK TO orgsync; RELEASE orgsync") {
                    tracing::error!(error = %rollback, "savepoint rollback failed");
                }
                Err(e)
            }
        }
    }

    // -- sync_state ---------------------------------------------------------

    /// Get the sync state of a resource, if it is tracked.
    pub fn get_sync_state(&self, key: &ResourceKey) -> Result<Option<SyncState>> {
        let sql = format!(
            "SELECT {SYNC_STATE_COLUMNS} FROM sync_state
             WHERE org_id = ?1 AND resource_type = ?2 AND resource_id = ?3"
        );
        let state = self
            .conn
            .query_row(
                &sql,
                params![key.org_id, key.resource_type, key.resource_id],
                row_to_sync_state,
            )
            .optional()?;
        Ok(state)
    }

    /// Insert or replace the sync state row for a resource.
    pub fn put_sync_state(&self, state: &SyncState) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sync_state (org_id, resource_type, resource_id, local_version,
             remote_version, vector_clock, content_address, status, last_synced_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT (org_id, resource_type, resource_id) DO UPDATE SET
                local_version = excluded.local_version,
                remote_version = excluded.remote_version,
                vector_clock = excluded.vector_clock,
                content_address = excluded.content_address,
                status = excluded.status,
                last_synced_at = excluded.last_synced_at,
                updated_at = excluded.updated_at",
            params![
                state.org_id,
                state.resource_type,
                state.resource_id,
                state.local_version,
                state.remote_version,
                state.vector_clock.to_json()?,
                state.content_address,
                state.status.as_str(),
                state.last_synced_at,
                state.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Update only the status of a tracked resource.
    pub fn set_sync_status(&self, key: &ResourceKey, status: SyncStatus) -> Result<bool> {
        let affected = self.conn.execute(
            "UPDATE sync_state SET status = ?1
             WHERE org_id = ?2 AND resource_type = ?3 AND resource_id = ?4",
            params![status.as_str(), key.org_id, key.resource_type, key.resource_id],
        )?;
        Ok(affected > 0)
    }

    /// Mark a delivered version as synced.
    ///
    /// Only applies when the state is still at `local_version`; a newer local
    /// edit made while the delivery was in flight keeps the row pending.
    pub fn mark_synced(&self, key: &ResourceKey, local_version: i64, now: i64) -> Result<bool> {
        let affected = self.conn.execute(
            "UPDATE sync_state SET status = 'synced', last_synced_at = ?1
             WHERE org_id = ?2 AND resource_type = ?3 AND resource_id = ?4
               AND local_version = ?5 AND status = 'pending'",
            params![now, key.org_id, key.resource_type, key.resource_id, local_version],
        )?;
        Ok(affected > 0)
    }

    /// Sync states of the given types that changed after `since`.
    pub fn changed_since(
        &self,
        org_id: &str,
        resource_types: &[String],
        since: i64,
    ) -> Result<Vec<SyncState>> {
        let mut out = Vec::new();
        let sql = format!(
            "SELECT {SYNC_STATE_COLUMNS} FROM sync_state
             WHERE org_id = ?1 AND resource_type = ?2 AND updated_at > ?3
             ORDER BY updated_at, resource_id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        for resource_type in resource_types {
            let rows = stmt
                .query_map(params![org_id, resource_type, since], row_to_sync_state)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            out.extend(rows);
        }
        Ok(out)
    }

    /// Count tracked resources by status.
    pub fn count_sync_status(&self, org_id: &str, status: SyncStatus) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sync_state WHERE org_id = ?1 AND status = ?2",
            params![org_id, status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // -- resources ----------------------------------------------------------

    /// Get a domain row, including tombstones.
    pub fn get_resource(&self, key: &ResourceKey) -> Result<Option<Resource>> {
        let resource = self
            .conn
            .query_row(
                "SELECT org_id, resource_type, resource_id, data, deleted, updated_at
                 FROM resources WHERE org_id = ?1 AND resource_type = ?2 AND resource_id = ?3",
                params![key.org_id, key.resource_type, key.resource_id],
                |row| {
                    let data: String = row.get(3)?;
                    Ok(Resource {
                        org_id: row.get(0)?,
                        resource_type: row.get(1)?,
                        resource_id: row.get(2)?,
                        data: parse_json(&data, "data")?,
                        deleted: row.get(4)?,
                        updated_at: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(resource)
    }

    /// Write a domain row and return its content address.
    ///
    /// Deletes are stored as tombstones so a late concurrent update can still
    /// be compared against them.
    pub fn put_resource(
        &self,
        key: &ResourceKey,
        data: &serde_json::Value,
        deleted: bool,
        now: i64,
    ) -> Result<String> {
        self.conn.execute(
            "INSERT INTO resources (org_id, resource_type, resource_id, data, deleted, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (org_id, resource_type, resource_id) DO UPDATE SET
                data = excluded.data,
                deleted = excluded.deleted,
                updated_at = excluded.updated_at",
            params![
                key.org_id,
                key.resource_type,
                key.resource_id,
                data.to_string(),
                deleted,
                now
            ],
        )?;
        Ok(content_address(data))
    }

    /// Physically remove a resource together with its sync state.
    pub fn purge_resource(&self, key: &ResourceKey) -> Result<bool> {
        self.atomically(|db| {
            let removed = db.conn.execute(
                "DELETE FROM resources WHERE org_id = ?1 AND resource_type = ?2 AND resource_id = ?3",
                params![key.org_id, key.resource_type, key.resource_id],
            )?;
            db.conn.execute(
                "DELETE FROM sync_state WHERE org_id = ?1 AND resource_type = ?2 AND resource_id = ?3",
                params![key.org_id, key.resource_type, key.resource_id],
            )?;
            Ok(removed > 0)
        })
    }

    /// Live (non-deleted) rows of one type.
    pub fn list_resources(&self, org_id: &str, resource_type: &str) -> Result<Vec<Resource>> {
        let mut stmt = self.conn.prepare(
            "SELECT org_id, resource_type, resource_id, data, deleted, updated_at
             FROM resources WHERE org_id = ?1 AND resource_type = ?2 AND deleted = 0
             ORDER BY resource_id",
        )?;
        let rows = stmt
            .query_map(params![org_id, resource_type], |row| {
                let data: String = row.get(3)?;
                Ok(Resource {
                    org_id: row.get(0)?,
                    resource_type: row.get(1)?,
                    resource_id: row.get(2)?,
                    data: parse_json(&data, "data")?,
                    deleted: row.get(4)?,
                    updated_at: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -- queue_items --------------------------------------------------------

    /// Append an outbound change to the queue.
    pub fn insert_queue_item(&self, item: &NewQueueItem<'_>, now: i64) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO queue_items (org_id, action, resource_type, resource_id, payload,
             version, vector_clock, created_at, retry_count, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, 'pending')",
            params![
                item.key.org_id,
                item.action.as_str(),
                item.key.resource_type,
                item.key.resource_id,
                item.payload.to_string(),
                item.version,
                item.vector_clock.to_json()?,
                now,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_queue_item(&self, id: i64) -> Result<Option<QueueItem>> {
        let sql = format!("SELECT {QUEUE_COLUMNS} FROM queue_items WHERE id = ?1");
        let item = self.conn.query_row(&sql, params![id], row_to_queue_item).optional()?;
        Ok(item)
    }

    /// Pending items in creation order.
    ///
    /// `resource_type` narrows to one table; `limit` caps the batch.
    pub fn pending_queue_items(
        &self,
        org_id: &str,
        resource_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<QueueItem>> {
        let sql = format!(
            "SELECT {QUEUE_COLUMNS} FROM queue_items
             WHERE org_id = ?1 AND status = 'pending'
               AND (?2 IS NULL OR resource_type = ?2)
             ORDER BY created_at, id
             LIMIT ?3"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let items = stmt
            .query_map(params![org_id, resource_type, limit], row_to_queue_item)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(items)
    }

    /// Items whose retries are exhausted.
    pub fn failed_queue_items(&self, org_id: &str) -> Result<Vec<QueueItem>> {
        let sql = format!(
            "SELECT {QUEUE_COLUMNS} FROM queue_items
             WHERE org_id = ?1 AND status = 'failed'
             ORDER BY created_at, id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let items = stmt
            .query_map(params![org_id], row_to_queue_item)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(items)
    }

    /// Count queue items in `status`, optionally for one resource type.
    pub fn count_queue_items(
        &self,
        org_id: &str,
        resource_type: Option<&str>,
        status: QueueStatus,
    ) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM queue_items
             WHERE org_id = ?1 AND status = ?2 AND (?3 IS NULL OR resource_type = ?3)",
            params![org_id, status.as_str(), resource_type],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Claim a pending item for delivery. Returns false if someone else did.
    pub fn mark_in_flight(&self, id: i64) -> Result<bool> {
        let affected = self.conn.execute(
            "UPDATE queue_items SET status = 'in_flight' WHERE id = ?1 AND status = 'pending'",
            params![id],
        )?;
        Ok(affected > 0)
    }

    /// Remove a delivered item.
    pub fn remove_queue_item(&self, id: i64) -> Result<bool> {
        let affected = self.conn.execute("DELETE FROM queue_items WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }

    /// Put an in-flight item back to pending without touching its retries.
    pub fn release_queue_item(&self, id: i64) -> Result<bool> {
        let affected = self.conn.execute(
            "UPDATE queue_items SET status = 'pending' WHERE id = ?1 AND status = 'in_flight'",
            params![id],
        )?;
        Ok(affected > 0)
    }

    /// Record a failed delivery attempt and return the item's new status.
    ///
    /// The item stays pending while `retry_count <= max_retry_count` and
    /// becomes failed once the count goes past it.
    pub fn record_queue_failure(
        &self,
        id: i64,
        error: &str,
        max_retry_count: u32,
        now: i64,
    ) -> Result<QueueStatus> {
        self.conn.execute(
            "UPDATE queue_items SET
                retry_count = retry_count + 1,
                last_retry_at = ?1,
                last_error = ?2,
                status = CASE WHEN retry_count + 1 > ?3 THEN 'failed' ELSE 'pending' END
             WHERE id = ?4",
            params![now, error, max_retry_count, id],
        )?;
        let status: String = self.conn.query_row(
            "SELECT status FROM queue_items WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        status.parse()
    }

    /// Drop pending items of `key` older than `version`.
    ///
    /// Each change carries the full document, so only the newest pending
    /// version of a resource needs to be delivered. In-flight items are left
    /// alone.
    pub fn supersede_queue_items(&self, key: &ResourceKey, version: i64) -> Result<usize> {
        let affected = self.conn.execute(
            "DELETE FROM queue_items
             WHERE org_id = ?1 AND resource_type = ?2 AND resource_id = ?3
               AND status = 'pending' AND version < ?4",
            params![key.org_id, key.resource_type, key.resource_id, version],
        )?;
        Ok(affected)
    }

    /// Put failed items back into the automatic drain with a fresh budget.
    pub fn reset_failed_queue_items(&self, org_id: &str) -> Result<usize> {
        let affected = self.conn.execute(
            "UPDATE queue_items SET status = 'pending', retry_count = 0, last_retry_at = NULL
             WHERE org_id = ?1 AND status = 'failed'",
            params![org_id],
        )?;
        Ok(affected)
    }

    /// Return items stranded in flight (e.g. by a crash) to pending.
    pub fn recover_in_flight(&self) -> Result<usize> {
        let affected = self.conn.execute(
            "UPDATE queue_items SET status = 'pending' WHERE status = 'in_flight'",
            [],
        )?;
        Ok(affected)
    }

    // -- conflicts ----------------------------------------------------------

    /// Insert a conflict record. Resolved records get their audit fields now.
    pub fn insert_conflict(&self, conflict: &NewConflict, now: i64) -> Result<i64> {
        let resolved = conflict.resolution.is_some();
        self.conn.execute(
            "INSERT INTO conflicts (org_id, resource_type, resource_id, local_data, local_clock,
             local_version, remote_data, remote_clock, remote_version, remote_author,
             resolution_strategy, resolved, resolution, resolved_at, resolved_by, created_at,
             remote_known)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                conflict.key.org_id,
                conflict.key.resource_type,
                conflict.key.resource_id,
                conflict.local.data.as_ref().map(|d| d.to_string()),
                conflict.local.vector_clock.to_json()?,
                conflict.local.version,
                conflict.remote.data.as_ref().map(|d| d.to_string()),
                conflict.remote.vector_clock.to_json()?,
                conflict.remote.version,
                conflict.remote_author,
                conflict.strategy.as_str(),
                resolved,
                conflict.resolution.map(|r| r.as_str()),
                resolved.then_some(now),
                conflict.resolved_by,
                now,
                conflict.remote.known,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_conflict(&self, id: i64) -> Result<Conflict> {
        let sql = format!("SELECT {CONFLICT_COLUMNS} FROM conflicts WHERE id = ?1");
        let conflict = self.conn.query_row(&sql, params![id], row_to_conflict).optional()?;
        conflict.ok_or(Error::ConflictNotFound(id))
    }

    /// Unresolved conflicts of an organization, oldest first.
    pub fn unresolved_conflicts(&self, org_id: &str) -> Result<Vec<Conflict>> {
        let sql = format!(
            "SELECT {CONFLICT_COLUMNS} FROM conflicts
             WHERE org_id = ?1 AND resolved = 0 ORDER BY created_at, id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let conflicts = stmt
            .query_map(params![org_id], row_to_conflict)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(conflicts)
    }

    /// All conflict records (resolved or not) for one resource.
    pub fn conflicts_for(&self, key: &ResourceKey) -> Result<Vec<Conflict>> {
        let sql = format!(
            "SELECT {CONFLICT_COLUMNS} FROM conflicts
             WHERE org_id = ?1 AND resource_type = ?2 AND resource_id = ?3
             ORDER BY created_at, id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let conflicts = stmt
            .query_map(params![key.org_id, key.resource_type, key.resource_id], row_to_conflict)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(conflicts)
    }

    /// The open conflict of a resource, if any.
    pub fn open_conflict_for(&self, key: &ResourceKey) -> Result<Option<Conflict>> {
        let sql = format!(
            "SELECT {CONFLICT_COLUMNS} FROM conflicts
             WHERE org_id = ?1 AND resource_type = ?2 AND resource_id = ?3 AND resolved = 0
             ORDER BY id DESC LIMIT 1"
        );
        let conflict = self
            .conn
            .query_row(
                &sql,
                params![key.org_id, key.resource_type, key.resource_id],
                row_to_conflict,
            )
            .optional()?;
        Ok(conflict)
    }

    /// Replace the remote side of an open conflict with a newer observation.
    ///
    /// Returns false if the conflict is missing or already resolved.
    pub fn update_conflict_remote(
        &self,
        id: i64,
        remote: &ConflictSide,
        remote_author: Option<&str>,
    ) -> Result<bool> {
        let affected = self.conn.execute(
            "UPDATE conflicts SET remote_data = ?1, remote_clock = ?2, remote_version = ?3,
             remote_author = COALESCE(?4, remote_author), remote_known = ?5
             WHERE id = ?6 AND resolved = 0",
            params![
                remote.data.as_ref().map(|d| d.to_string()),
                remote.vector_clock.to_json()?,
                remote.version,
                remote_author,
                remote.known,
                id,
            ],
        )?;
        Ok(affected > 0)
    }

    /// Close an open conflict. Fails if it is already resolved.
    pub fn mark_conflict_resolved(
        &self,
        id: i64,
        resolution: Resolution,
        resolved_by: &str,
        now: i64,
    ) -> Result<()> {
        let affected = self.conn.execute(
            "UPDATE conflicts SET resolved = 1, resolution = ?1, resolved_by = ?2, resolved_at = ?3
             WHERE id = ?4 AND resolved = 0",
            params![resolution.as_str(), resolved_by, now, id],
        )?;
        if affected == 0 {
            // Distinguish a missing row from a closed one
            let conflict = self.get_conflict(id)?;
            return Err(Error::ConflictAlreadyResolved(conflict.id));
        }
        Ok(())
    }

    /// Count unresolved conflicts, optionally for one resource type.
    pub fn count_unresolved_conflicts(
        &self,
        org_id: &str,
        resource_type: Option<&str>,
    ) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM conflicts
             WHERE org_id = ?1 AND resolved = 0 AND (?2 IS NULL OR resource_type = ?2)",
            params![org_id, resource_type],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // -- applied_changes ----------------------------------------------------

    /// Record an inbound change. Returns false if it was already recorded.
    pub fn record_applied(
        &self,
        key: &ResourceKey,
        version: i64,
        author: &str,
        now: i64,
    ) -> Result<bool> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO applied_changes
             (org_id, resource_type, resource_id, version, author, applied_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![key.org_id, key.resource_type, key.resource_id, version, author, now],
        )?;
        Ok(inserted > 0)
    }

    pub fn is_applied(&self, key: &ResourceKey, version: i64, author: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM applied_changes
             WHERE org_id = ?1 AND resource_type = ?2 AND resource_id = ?3
               AND version = ?4 AND author = ?5",
            params![key.org_id, key.resource_type, key.resource_id, version, author],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

#[cfg(test)]
#[path = "db_tests.rs"]
mod tests;
