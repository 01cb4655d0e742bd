use rusqlite::Connection;

use crate::error::StorageError;

pub const SCHEMA_VERSION: i32 = 1;

fn apply_pragmas(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA cache_size = -32000;
        PRAGMA busy_timeout = 5000;
    ",
    )?;
    Ok(())
}

/// Create the authoritative server tables if they do not exist yet.
pub fn init_server_schema(conn: &Connection) -> Result<(), StorageError> {
    apply_pragmas(conn)?;
    conn.execute_batch(SERVER_SCHEMA_SQL)?;
    tracing::debug!(version = SCHEMA_VERSION, "server schema ready");
    Ok(())
}

/// Create the device-local tables if they do not exist yet.
pub fn init_client_schema(conn: &Connection) -> Result<(), StorageError> {
    apply_pragmas(conn)?;
    conn.execute_batch(CLIENT_SCHEMA_SQL)?;
    tracing::debug!(version = SCHEMA_VERSION, "client schema ready");
    Ok(())
}

const SERVER_SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);
INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, unixepoch());

CREATE TABLE IF NOT EXISTS entity_versions (
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    version INTEGER NOT NULL CHECK (version >= 0),
    payload TEXT NOT NULL,
    last_modified BLOB NOT NULL CHECK (length(last_modified) = 12),
    last_device_id BLOB NOT NULL CHECK (length(last_device_id) = 16),
    last_operation TEXT NOT NULL CHECK (last_operation IN ('create', 'update', 'delete')),
    PRIMARY KEY (entity_type, entity_id)
);
CREATE INDEX IF NOT EXISTS idx_entity_versions_changed
    ON entity_versions (last_modified, entity_type, entity_id);

CREATE TABLE IF NOT EXISTS sync_batches (
    batch_id BLOB PRIMARY KEY CHECK (length(batch_id) = 16),
    device_id BLOB NOT NULL CHECK (length(device_id) = 16),
    created_at INTEGER NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('pending', 'applied', 'partial_conflict', 'conflict')),
    delta_count INTEGER NOT NULL DEFAULT 0,
    applied_count INTEGER NOT NULL DEFAULT 0,
    conflict_count INTEGER NOT NULL DEFAULT 0,
    rejected_count INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_sync_batches_device ON sync_batches (device_id, created_at);

CREATE TABLE IF NOT EXISTS applied_deltas (
    delta_id BLOB PRIMARY KEY CHECK (length(delta_id) = 16),
    batch_id BLOB NOT NULL REFERENCES sync_batches (batch_id),
    position INTEGER NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    fingerprint BLOB NOT NULL CHECK (length(fingerprint) = 32),
    outcome TEXT NOT NULL CHECK (outcome IN ('applied', 'conflict')),
    conflict_id BLOB CHECK (conflict_id IS NULL OR length(conflict_id) = 16),
    recorded_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_applied_deltas_batch ON applied_deltas (batch_id, position);

CREATE TABLE IF NOT EXISTS conflicts (
    conflict_id BLOB PRIMARY KEY CHECK (length(conflict_id) = 16),
    batch_id BLOB NOT NULL REFERENCES sync_batches (batch_id),
    delta_id BLOB NOT NULL CHECK (length(delta_id) = 16),
    device_id BLOB NOT NULL CHECK (length(device_id) = 16),
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    operation TEXT NOT NULL CHECK (operation IN ('create', 'update', 'delete')),
    client_payload TEXT NOT NULL,
    server_payload TEXT,
    client_version INTEGER NOT NULL,
    server_version INTEGER NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('unresolved', 'client_wins', 'server_wins', 'merged', 'superseded')),
    resolved_payload TEXT,
    resolved_version INTEGER,
    resolved_at INTEGER,
    detected_at INTEGER NOT NULL,
    superseded_by BLOB CHECK (superseded_by IS NULL OR length(superseded_by) = 16)
);
CREATE INDEX IF NOT EXISTS idx_conflicts_detected ON conflicts (detected_at);
CREATE INDEX IF NOT EXISTS idx_conflicts_device ON conflicts (device_id, status);
CREATE INDEX IF NOT EXISTS idx_conflicts_batch ON conflicts (batch_id);
";

const CLIENT_SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);
INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, unixepoch());

CREATE TABLE IF NOT EXISTS local_entities (
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    payload TEXT,
    server_version INTEGER NOT NULL DEFAULT 0 CHECK (server_version >= 0),
    deleted INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (entity_type, entity_id)
);

CREATE TABLE IF NOT EXISTS outbox (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    entry_id BLOB NOT NULL UNIQUE CHECK (length(entry_id) = 16),
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    operation TEXT NOT NULL CHECK (operation IN ('create', 'update', 'delete')),
    payload TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    device_id BLOB NOT NULL CHECK (length(device_id) = 16),
    base_version INTEGER NOT NULL,
    target_version INTEGER NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL CHECK (status IN ('pending', 'syncing', 'synced', 'failed')),
    last_error TEXT,
    rejected INTEGER NOT NULL DEFAULT 0 CHECK (rejected IN (0, 1)),
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_outbox_status ON outbox (status, seq);
CREATE INDEX IF NOT EXISTS idx_outbox_entity ON outbox (entity_type, entity_id, status);

CREATE TABLE IF NOT EXISTS sync_meta (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    updated_at INTEGER NOT NULL
);
";
