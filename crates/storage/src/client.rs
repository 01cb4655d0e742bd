use std::path::Path;

use rusqlite::{Connection, OptionalExtension};

use fieldsync_core::{
    DeltaPayload, DeviceId, EntityRef, Hlc, Operation, OutboxEntryId, SyncVersion,
};

use crate::error::StorageError;
use crate::rows::{
    read_entity, read_operation, read_payload, read_required_payload, read_version, to_array,
    tunnel, unix_millis, version_param,
};
use crate::traits::{
    LocalEntity, LocalEntityStore, OutboxCounts, OutboxEntry, OutboxStatus, OutboxStore,
    PullCursor, SyncMetaStore,
};

pub const META_LAST_SYNC_TIMESTAMP: &str = "lastSyncTimestamp";
pub const META_PULL_CURSOR: &str = "pullCursor";

/// Device-local store: local entity copies, the outbox and sync metadata.
pub struct SqliteClientStore {
    conn: Connection,
}

impl SqliteClientStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        crate::schema::init_client_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_client_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    fn newest_unsynced_target(&self, entity: &EntityRef) -> Result<Option<SyncVersion>, StorageError> {
        let raw: Option<i64> = self.conn.query_row(
            "SELECT MAX(target_version) FROM outbox
             WHERE entity_type = ?1 AND entity_id = ?2 AND status != 'synced' AND rejected = 0",
            rusqlite::params![entity.entity_type, entity.entity_id],
            |row| row.get(0),
        )?;
        Ok(raw.map(SyncVersion::from_i64).transpose()?)
    }

    fn query_outbox(
        &self,
        filter: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<OutboxEntry>, StorageError> {
        let sql = format!("SELECT {OUTBOX_COLUMNS} FROM outbox WHERE {filter} ORDER BY seq");
        let mut stmt = self.conn.prepare(&sql)?;
        let entries = stmt
            .query_map(params, |row| read_outbox_entry(row).map_err(tunnel))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    fn set_status(
        &self,
        ids: &[OutboxEntryId],
        status: OutboxStatus,
    ) -> Result<(), StorageError> {
        let now = unix_millis();
        let mut stmt = self
            .conn
            .prepare("UPDATE outbox SET status = ?1, updated_at = ?2 WHERE entry_id = ?3")?;
        for id in ids {
            stmt.execute(rusqlite::params![status.as_str(), now, id.as_bytes().as_slice()])?;
        }
        Ok(())
    }
}

const OUTBOX_COLUMNS: &str = "entry_id, seq, entity_type, entity_id, operation, payload, timestamp, device_id, base_version, target_version, retry_count, status, last_error, rejected";

fn read_outbox_entry(row: &rusqlite::Row) -> Result<OutboxEntry, StorageError> {
    let id_bytes: Vec<u8> = row.get(0)?;
    let device_bytes: Vec<u8> = row.get(7)?;
    let status: String = row.get(11)?;
    Ok(OutboxEntry {
        id: OutboxEntryId::from_bytes(to_array::<16>(id_bytes, "entry_id")?),
        seq: row.get(1)?,
        entity: read_entity(row, 2, 3)?,
        operation: read_operation(row, 4)?,
        payload: read_required_payload(row, 5, "outbox payload")?,
        timestamp: row.get(6)?,
        device_id: DeviceId::from_bytes(to_array::<16>(device_bytes, "device_id")?),
        base_version: read_version(row, 8)?,
        target_version: read_version(row, 9)?,
        retry_count: row.get(10)?,
        status: OutboxStatus::parse(&status)?,
        last_error: row.get(12)?,
        rejected: row.get(13)?,
    })
}

impl OutboxStore for SqliteClientStore {
    fn enqueue(
        &mut self,
        entity: &EntityRef,
        operation: Operation,
        payload: &DeltaPayload,
        device_id: DeviceId,
        timestamp: i64,
    ) -> Result<OutboxEntry, StorageError> {
        let known = self.server_version(entity)?;
        let base = match self.newest_unsynced_target(entity)? {
            Some(target) if target > known => target,
            _ => known,
        };
        let target = base.next()?;
        let id = OutboxEntryId::new();
        let now = unix_millis();

        self.conn.execute(
            "INSERT INTO outbox (entry_id, entity_type, entity_id, operation, payload, timestamp, device_id, base_version, target_version, retry_count, status, last_error, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, 'pending', NULL, ?10)",
            rusqlite::params![
                id.as_bytes().as_slice(),
                entity.entity_type,
                entity.entity_id,
                operation.as_str(),
                payload.as_str(),
                timestamp,
                device_id.as_bytes().as_slice(),
                version_param(base)?,
                version_param(target)?,
                now,
            ],
        )?;

        Ok(OutboxEntry {
            id,
            seq: self.conn.last_insert_rowid(),
            entity: entity.clone(),
            operation,
            payload: payload.clone(),
            timestamp,
            device_id,
            base_version: base,
            target_version: target,
            retry_count: 0,
            status: OutboxStatus::Pending,
            last_error: None,
            rejected: false,
        })
    }

    fn get(&self, id: OutboxEntryId) -> Result<Option<OutboxEntry>, StorageError> {
        let sql = format!("SELECT {OUTBOX_COLUMNS} FROM outbox WHERE entry_id = ?1");
        let entry = self
            .conn
            .query_row(&sql, rusqlite::params![id.as_bytes().as_slice()], |row| {
                read_outbox_entry(row).map_err(tunnel)
            })
            .optional()?;
        Ok(entry)
    }

    fn get_pending(&self) -> Result<Vec<OutboxEntry>, StorageError> {
        self.query_outbox("status = 'pending'", [])
    }

    fn get_failed(&self) -> Result<Vec<OutboxEntry>, StorageError> {
        self.query_outbox("status = 'failed'", [])
    }

    fn get_unsynced(&self) -> Result<Vec<OutboxEntry>, StorageError> {
        self.query_outbox("status != 'synced'", [])
    }

    fn mark_syncing(&mut self, ids: &[OutboxEntryId]) -> Result<(), StorageError> {
        self.set_status(ids, OutboxStatus::Syncing)
    }

    fn mark_synced(&mut self, ids: &[OutboxEntryId]) -> Result<(), StorageError> {
        let now = unix_millis();
        let mut stmt = self.conn.prepare(
            "UPDATE outbox SET status = 'synced', last_error = NULL, updated_at = ?1 WHERE entry_id = ?2",
        )?;
        for id in ids {
            stmt.execute(rusqlite::params![now, id.as_bytes().as_slice()])?;
        }
        Ok(())
    }

    fn mark_failed(&mut self, ids: &[OutboxEntryId], error: &str) -> Result<(), StorageError> {
        let now = unix_millis();
        let mut stmt = self.conn.prepare(
            "UPDATE outbox SET status = 'failed', retry_count = retry_count + 1, last_error = ?1, updated_at = ?2
             WHERE entry_id = ?3",
        )?;
        for id in ids {
            stmt.execute(rusqlite::params![error, now, id.as_bytes().as_slice()])?;
        }
        Ok(())
    }

    fn mark_rejected(&mut self, id: OutboxEntryId, reason: &str) -> Result<usize, StorageError> {
        let entry = self
            .get(id)?
            .ok_or_else(|| StorageError::NotFound(format!("outbox entry {id}")))?;
        let now = unix_millis();
        self.conn.execute(
            "UPDATE outbox SET status = 'failed', rejected = 1, retry_count = retry_count + 1, last_error = ?1, updated_at = ?2
             WHERE entry_id = ?3",
            rusqlite::params![reason, now, id.as_bytes().as_slice()],
        )?;
        if entry.rejected {
            return Ok(0);
        }

        let later = self.query_outbox(
            "entity_type = ?1 AND entity_id = ?2 AND seq > ?3 AND status != 'synced' AND rejected = 0",
            rusqlite::params![entry.entity.entity_type, entry.entity.entity_id, entry.seq],
        )?;
        let mut stmt = self.conn.prepare(
            "UPDATE outbox SET base_version = ?1, target_version = ?2, updated_at = ?3 WHERE entry_id = ?4",
        )?;
        let mut chained_on = entry.target_version;
        let mut base = entry.base_version;
        let mut moved = 0;
        for link in later {
            if link.base_version != chained_on {
                break;
            }
            let target = base.next()?;
            stmt.execute(rusqlite::params![
                version_param(base)?,
                version_param(target)?,
                now,
                link.id.as_bytes().as_slice(),
            ])?;
            chained_on = link.target_version;
            base = target;
            moved += 1;
        }
        if moved > 0 {
            tracing::debug!(
                entry_id = %id,
                entity = %entry.entity,
                moved,
                "rebased entries chained on a rejected entry"
            );
        }
        Ok(moved)
    }

    fn count_by_status(&self) -> Result<OutboxCounts, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM outbox GROUP BY status")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut counts = OutboxCounts::default();
        for (status, n) in rows {
            let n = n as u64;
            match OutboxStatus::parse(&status)? {
                OutboxStatus::Pending => counts.pending = n,
                OutboxStatus::Syncing => counts.syncing = n,
                OutboxStatus::Synced => counts.synced = n,
                OutboxStatus::Failed => counts.failed = n,
            }
        }
        Ok(counts)
    }

    fn purge_synced(&mut self, older_than: i64) -> Result<usize, StorageError> {
        let removed = self.conn.execute(
            "DELETE FROM outbox WHERE status = 'synced' AND updated_at < ?1",
            rusqlite::params![older_than],
        )?;
        Ok(removed)
    }
}

impl SyncMetaStore for SqliteClientStore {
    fn get_meta(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM sync_meta WHERE key = ?1",
                rusqlite::params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set_meta(&mut self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO sync_meta (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            rusqlite::params![key, value, unix_millis()],
        )?;
        Ok(())
    }

    fn last_sync_timestamp(&self) -> Result<Option<Hlc>, StorageError> {
        self.get_meta(META_LAST_SYNC_TIMESTAMP)?
            .map(|bytes| Hlc::from_slice(&bytes).map_err(StorageError::from))
            .transpose()
    }

    fn pull_cursor(&self) -> Result<Option<PullCursor>, StorageError> {
        self.get_meta(META_PULL_CURSOR)?
            .map(|bytes| {
                rmp_serde::from_slice(&bytes).map_err(|e| StorageError::Serialization(e.to_string()))
            })
            .transpose()
    }

    fn set_pull_cursor(&mut self, cursor: &PullCursor) -> Result<(), StorageError> {
        let encoded =
            rmp_serde::to_vec(cursor).map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.set_meta(META_PULL_CURSOR, &encoded)?;
        self.set_meta(META_LAST_SYNC_TIMESTAMP, &cursor.last_modified.to_bytes())
    }
}

const LOCAL_COLUMNS: &str = "entity_type, entity_id, payload, server_version, deleted, updated_at";

fn read_local(row: &rusqlite::Row) -> Result<LocalEntity, StorageError> {
    Ok(LocalEntity {
        entity: read_entity(row, 0, 1)?,
        payload: read_payload(row, 2)?,
        server_version: read_version(row, 3)?,
        deleted: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

impl LocalEntityStore for SqliteClientStore {
    fn get_local(&self, entity: &EntityRef) -> Result<Option<LocalEntity>, StorageError> {
        let sql = format!(
            "SELECT {LOCAL_COLUMNS} FROM local_entities WHERE entity_type = ?1 AND entity_id = ?2"
        );
        let local = self
            .conn
            .query_row(
                &sql,
                rusqlite::params![entity.entity_type, entity.entity_id],
                |row| read_local(row).map_err(tunnel),
            )
            .optional()?;
        Ok(local)
    }

    fn list_local(&self, entity_type: &str) -> Result<Vec<LocalEntity>, StorageError> {
        let sql = format!(
            "SELECT {LOCAL_COLUMNS} FROM local_entities WHERE entity_type = ?1 ORDER BY entity_id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params![entity_type], |row| {
                read_local(row).map_err(tunnel)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn server_version(&self, entity: &EntityRef) -> Result<SyncVersion, StorageError> {
        let raw: Option<i64> = self
            .conn
            .query_row(
                "SELECT server_version FROM local_entities WHERE entity_type = ?1 AND entity_id = ?2",
                rusqlite::params![entity.entity_type, entity.entity_id],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(v) => Ok(SyncVersion::from_i64(v)?),
            None => Ok(SyncVersion::INITIAL),
        }
    }

    fn put_server_state(
        &mut self,
        entity: &EntityRef,
        payload: &DeltaPayload,
        version: SyncVersion,
        deleted: bool,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO local_entities (entity_type, entity_id, payload, server_version, deleted, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(entity_type, entity_id) DO UPDATE SET
                payload = excluded.payload,
                server_version = excluded.server_version,
                deleted = excluded.deleted,
                updated_at = excluded.updated_at",
            rusqlite::params![
                entity.entity_type,
                entity.entity_id,
                payload.as_str(),
                version_param(version)?,
                deleted,
                unix_millis(),
            ],
        )?;
        Ok(())
    }

    fn put_local_edit(
        &mut self,
        entity: &EntityRef,
        payload: &DeltaPayload,
        deleted: bool,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO local_entities (entity_type, entity_id, payload, server_version, deleted, updated_at)
             VALUES (?1, ?2, ?3, 0, ?4, ?5)
             ON CONFLICT(entity_type, entity_id) DO UPDATE SET
                payload = excluded.payload,
                deleted = excluded.deleted,
                updated_at = excluded.updated_at",
            rusqlite::params![
                entity.entity_type,
                entity.entity_id,
                payload.as_str(),
                deleted,
                unix_millis(),
            ],
        )?;
        Ok(())
    }

    fn raise_server_version(
        &mut self,
        entity: &EntityRef,
        version: SyncVersion,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO local_entities (entity_type, entity_id, payload, server_version, deleted, updated_at)
             VALUES (?1, ?2, NULL, ?3, 0, ?4)
             ON CONFLICT(entity_type, entity_id) DO UPDATE SET
                server_version = MAX(server_version, excluded.server_version)",
            rusqlite::params![
                entity.entity_type,
                entity.entity_id,
                version_param(version)?,
                unix_millis(),
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(s: &str) -> DeltaPayload {
        DeltaPayload::parse(s).unwrap()
    }

    #[test]
    fn enqueue_chains_versions_per_entity() {
        let mut store = SqliteClientStore::open_in_memory().unwrap();
        let device = DeviceId::new();
        let inst = EntityRef::new("installation", "inst-1");
        let photo = EntityRef::new("photo", "p1");

        let e1 = store.enqueue(&inst, Operation::Create, &payload("{}"), device, 1).unwrap();
        let e2 = store.enqueue(&inst, Operation::Update, &payload("{}"), device, 2).unwrap();
        let p1 = store.enqueue(&photo, Operation::Create, &payload("{}"), device, 3).unwrap();

        assert_eq!((e1.base_version.get(), e1.target_version.get()), (0, 1));
        assert_eq!((e2.base_version.get(), e2.target_version.get()), (1, 2));
        assert_eq!((p1.base_version.get(), p1.target_version.get()), (0, 1));
        assert!(e1.seq < e2.seq && e2.seq < p1.seq);
    }

    #[test]
    fn enqueue_starts_from_known_server_version() {
        let mut store = SqliteClientStore::open_in_memory().unwrap();
        let inst = EntityRef::new("installation", "inst-1");
        store
            .put_server_state(&inst, &payload(r#"{"v":5}"#), SyncVersion::new(5), false)
            .unwrap();
        let e = store
            .enqueue(&inst, Operation::Update, &payload("{}"), DeviceId::new(), 1)
            .unwrap();
        assert_eq!(e.base_version, SyncVersion::new(5));
        assert_eq!(e.target_version, SyncVersion::new(6));
    }

    #[test]
    fn status_transitions_and_counts() {
        let mut store = SqliteClientStore::open_in_memory().unwrap();
        let device = DeviceId::new();
        let a = store
            .enqueue(&EntityRef::new("photo", "a"), Operation::Create, &payload("{}"), device, 1)
            .unwrap();
        let b = store
            .enqueue(&EntityRef::new("photo", "b"), Operation::Create, &payload("{}"), device, 2)
            .unwrap();

        store.mark_syncing(&[a.id, b.id]).unwrap();
        store.mark_synced(&[a.id]).unwrap();
        store.mark_failed(&[b.id], "offline").unwrap();
        store.mark_failed(&[b.id], "offline").unwrap();

        let failed = store.get_failed().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].retry_count, 2);
        assert_eq!(failed[0].last_error.as_deref(), Some("offline"));
        assert!(store.get_pending().unwrap().is_empty());

        let counts = store.count_by_status().unwrap();
        assert_eq!((counts.synced, counts.failed, counts.unsynced()), (1, 1, 1));

        assert_eq!(store.purge_synced(unix_millis() + 1).unwrap(), 1);
        assert!(store.get(a.id).unwrap().is_none());
        assert!(store.get(b.id).unwrap().is_some());
    }

    #[test]
    fn rejected_entry_drops_out_of_the_chain() {
        let mut store = SqliteClientStore::open_in_memory().unwrap();
        let device = DeviceId::new();
        let inst = EntityRef::new("installation", "inst-1");
        store
            .put_server_state(&inst, &payload("{}"), SyncVersion::new(1), false)
            .unwrap();

        let bad = store.enqueue(&inst, Operation::Update, &payload("{}"), device, 1).unwrap();
        let next = store.enqueue(&inst, Operation::Update, &payload("{}"), device, 2).unwrap();
        let last = store.enqueue(&inst, Operation::Update, &payload("{}"), device, 3).unwrap();
        assert_eq!(last.base_version, SyncVersion::new(3));

        assert_eq!(store.mark_rejected(bad.id, "too large").unwrap(), 2);
        let next = store.get(next.id).unwrap().unwrap();
        let last = store.get(last.id).unwrap().unwrap();
        assert_eq!((next.base_version.get(), next.target_version.get()), (1, 2));
        assert_eq!((last.base_version.get(), last.target_version.get()), (2, 3));

        let bad = store.get(bad.id).unwrap().unwrap();
        assert!(bad.rejected);
        assert_eq!(bad.status, OutboxStatus::Failed);
        assert_eq!(bad.last_error.as_deref(), Some("too large"));

        // New edits chain on the surviving entries, and a repeated rejection
        // moves nothing.
        let fresh = store.enqueue(&inst, Operation::Update, &payload("{}"), device, 4).unwrap();
        assert_eq!(fresh.base_version, SyncVersion::new(3));
        assert_eq!(store.mark_rejected(bad.id, "too large").unwrap(), 0);
        assert_eq!(store.get(bad.id).unwrap().unwrap().retry_count, 2);
        assert_eq!(
            store.get(fresh.id).unwrap().unwrap().base_version,
            SyncVersion::new(3)
        );
    }

    #[test]
    fn raise_server_version_never_lowers() {
        let mut store = SqliteClientStore::open_in_memory().unwrap();
        let inst = EntityRef::new("installation", "inst-1");
        store.raise_server_version(&inst, SyncVersion::new(4)).unwrap();
        store.raise_server_version(&inst, SyncVersion::new(2)).unwrap();
        assert_eq!(store.server_version(&inst).unwrap(), SyncVersion::new(4));
    }

    #[test]
    fn pull_cursor_roundtrip() {
        let mut store = SqliteClientStore::open_in_memory().unwrap();
        assert!(store.pull_cursor().unwrap().is_none());
        let cursor = PullCursor {
            last_modified: Hlc::new(1_700_000_000_000, 2),
            entity_type: "photo".into(),
            entity_id: "p9".into(),
        };
        store.set_pull_cursor(&cursor).unwrap();
        assert_eq!(store.pull_cursor().unwrap(), Some(cursor.clone()));
        assert_eq!(store.last_sync_timestamp().unwrap(), Some(cursor.last_modified));
    }
}
