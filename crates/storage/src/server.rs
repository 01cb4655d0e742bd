use std::path::Path;

use rusqlite::{Connection, OptionalExtension};

use fieldsync_core::{
    BatchId, ConflictId, DeltaId, DeltaPayload, DeviceId, EntityRef, Hlc, HlcClock, Operation,
    SyncVersion,
};

use crate::error::StorageError;
use crate::rows::{
    read_entity, read_operation, read_payload, read_required_payload, read_version, to_array,
    tunnel, version_param,
};
use crate::traits::{
    AppliedDeltaRecord, BatchRecord, BatchStatus, BatchStore, ConflictRecord, ConflictResolution,
    ConflictStatus, ConflictStore, DeltaOutcome, Ledger, LedgerEntry, LedgerPage, PullCursor,
};

/// Server-side store: entity ledger, batches, delta outcomes and conflicts.
///
/// Methods run single statements against the connection. Callers that need
/// several of them to be atomic wrap them in `BEGIN IMMEDIATE` / `COMMIT` on
/// [`SqliteServerStore::conn`].
pub struct SqliteServerStore {
    conn: Connection,
    clock: HlcClock,
}

impl SqliteServerStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        crate::schema::init_server_schema(&conn)?;
        Ok(Self {
            conn,
            clock: HlcClock::new(),
        })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_server_schema(&conn)?;
        Ok(Self {
            conn,
            clock: HlcClock::new(),
        })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    fn max_last_modified(&self) -> Result<Option<Hlc>, StorageError> {
        let raw: Option<Vec<u8>> = self.conn.query_row(
            "SELECT MAX(last_modified) FROM entity_versions",
            [],
            |row| row.get(0),
        )?;
        raw.map(|b| Hlc::from_slice(&b).map_err(StorageError::from))
            .transpose()
    }
}

const LEDGER_COLUMNS: &str =
    "entity_type, entity_id, version, payload, last_modified, last_device_id, last_operation";

fn read_ledger_entry(row: &rusqlite::Row) -> Result<LedgerEntry, StorageError> {
    let hlc_bytes: Vec<u8> = row.get(4)?;
    let device_bytes: Vec<u8> = row.get(5)?;
    Ok(LedgerEntry {
        entity: read_entity(row, 0, 1)?,
        version: read_version(row, 2)?,
        payload: read_required_payload(row, 3, "ledger payload")?,
        last_modified: Hlc::from_bytes(&to_array::<12>(hlc_bytes, "last_modified")?),
        last_device_id: DeviceId::from_bytes(to_array::<16>(device_bytes, "last_device_id")?),
        last_operation: read_operation(row, 6)?,
    })
}

impl Ledger for SqliteServerStore {
    fn get_current_version(&self, entity: &EntityRef) -> Result<SyncVersion, StorageError> {
        let raw: Option<i64> = self
            .conn
            .query_row(
                "SELECT version FROM entity_versions WHERE entity_type = ?1 AND entity_id = ?2",
                rusqlite::params![entity.entity_type, entity.entity_id],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(v) => Ok(SyncVersion::from_i64(v)?),
            None => Ok(SyncVersion::INITIAL),
        }
    }

    fn get_current_payload(
        &self,
        entity: &EntityRef,
    ) -> Result<Option<DeltaPayload>, StorageError> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT payload FROM entity_versions WHERE entity_type = ?1 AND entity_id = ?2",
                rusqlite::params![entity.entity_type, entity.entity_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.map(DeltaPayload::from_raw))
    }

    fn get_entry(&self, entity: &EntityRef) -> Result<Option<LedgerEntry>, StorageError> {
        let sql = format!(
            "SELECT {LEDGER_COLUMNS} FROM entity_versions WHERE entity_type = ?1 AND entity_id = ?2"
        );
        let entry = self
            .conn
            .query_row(
                &sql,
                rusqlite::params![entity.entity_type, entity.entity_id],
                |row| read_ledger_entry(row).map_err(tunnel),
            )
            .optional()?;
        Ok(entry)
    }

    fn set_version(
        &mut self,
        entity: &EntityRef,
        version: SyncVersion,
        payload: &DeltaPayload,
        device_id: DeviceId,
        operation: Operation,
    ) -> Result<Hlc, StorageError> {
        if let Some(latest) = self.max_last_modified()? {
            self.clock.observe(&latest)?;
        }
        let stamped = self.clock.tick()?;

        self.conn.execute(
            "INSERT INTO entity_versions (entity_type, entity_id, version, payload, last_modified, last_device_id, last_operation)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(entity_type, entity_id) DO UPDATE SET
                version = excluded.version,
                payload = excluded.payload,
                last_modified = excluded.last_modified,
                last_device_id = excluded.last_device_id,
                last_operation = excluded.last_operation",
            rusqlite::params![
                entity.entity_type,
                entity.entity_id,
                version_param(version)?,
                payload.as_str(),
                &stamped.to_bytes()[..],
                device_id.as_bytes().as_slice(),
                operation.as_str(),
            ],
        )?;
        Ok(stamped)
    }

    fn get_changed_since(
        &self,
        since: Hlc,
        cursor: Option<&PullCursor>,
        limit: u32,
    ) -> Result<LedgerPage, StorageError> {
        // One extra row tells us whether another page exists.
        let fetch = i64::from(limit) + 1;
        let mut entries = match cursor {
            Some(c) => {
                let sql = format!(
                    "SELECT {LEDGER_COLUMNS} FROM entity_versions
                     WHERE (last_modified, entity_type, entity_id) > (?1, ?2, ?3)
                     ORDER BY last_modified, entity_type, entity_id LIMIT ?4"
                );
                let mut stmt = self.conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(
                        rusqlite::params![
                            &c.last_modified.to_bytes()[..],
                            c.entity_type,
                            c.entity_id,
                            fetch
                        ],
                        |row| read_ledger_entry(row).map_err(tunnel),
                    )?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let sql = format!(
                    "SELECT {LEDGER_COLUMNS} FROM entity_versions
                     WHERE last_modified > ?1
                     ORDER BY last_modified, entity_type, entity_id LIMIT ?2"
                );
                let mut stmt = self.conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params![&since.to_bytes()[..], fetch], |row| {
                        read_ledger_entry(row).map_err(tunnel)
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };

        let has_more = entries.len() > limit as usize;
        entries.truncate(limit as usize);
        let next_cursor = entries.last().map(PullCursor::after);
        Ok(LedgerPage {
            entries,
            next_cursor,
            has_more,
        })
    }
}

const BATCH_COLUMNS: &str = "batch_id, device_id, created_at, status, delta_count, applied_count, conflict_count, rejected_count";

fn read_batch(row: &rusqlite::Row) -> Result<BatchRecord, StorageError> {
    let batch_bytes: Vec<u8> = row.get(0)?;
    let device_bytes: Vec<u8> = row.get(1)?;
    let status: String = row.get(3)?;
    Ok(BatchRecord {
        batch_id: BatchId::from_bytes(to_array::<16>(batch_bytes, "batch_id")?),
        device_id: DeviceId::from_bytes(to_array::<16>(device_bytes, "device_id")?),
        created_at: row.get(2)?,
        status: BatchStatus::parse(&status)?,
        delta_count: row.get(4)?,
        applied_count: row.get(5)?,
        conflict_count: row.get(6)?,
        rejected_count: row.get(7)?,
    })
}

const OUTCOME_COLUMNS: &str =
    "delta_id, batch_id, position, entity_type, entity_id, fingerprint, outcome, conflict_id, recorded_at";

fn read_outcome(row: &rusqlite::Row) -> Result<AppliedDeltaRecord, StorageError> {
    let delta_bytes: Vec<u8> = row.get(0)?;
    let batch_bytes: Vec<u8> = row.get(1)?;
    let fingerprint: Vec<u8> = row.get(5)?;
    let kind: String = row.get(6)?;
    let conflict_bytes: Option<Vec<u8>> = row.get(7)?;

    let outcome = match (kind.as_str(), conflict_bytes) {
        ("applied", _) => DeltaOutcome::Applied,
        ("conflict", Some(bytes)) => DeltaOutcome::Conflict {
            conflict_id: ConflictId::from_bytes(to_array::<16>(bytes, "conflict_id")?),
        },
        (other, _) => {
            return Err(StorageError::Serialization(format!(
                "invalid delta outcome: {other}"
            )));
        }
    };

    Ok(AppliedDeltaRecord {
        delta_id: DeltaId::from_bytes(to_array::<16>(delta_bytes, "delta_id")?),
        batch_id: BatchId::from_bytes(to_array::<16>(batch_bytes, "batch_id")?),
        position: row.get(2)?,
        entity: read_entity(row, 3, 4)?,
        fingerprint: to_array::<32>(fingerprint, "fingerprint")?,
        outcome,
        recorded_at: row.get(8)?,
    })
}

impl BatchStore for SqliteServerStore {
    fn insert_batch(&mut self, record: &BatchRecord) -> Result<bool, StorageError> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO sync_batches (batch_id, device_id, created_at, status, delta_count, applied_count, conflict_count, rejected_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                record.batch_id.as_bytes().as_slice(),
                record.device_id.as_bytes().as_slice(),
                record.created_at,
                record.status.as_str(),
                record.delta_count,
                record.applied_count,
                record.conflict_count,
                record.rejected_count,
            ],
        )?;
        Ok(inserted == 1)
    }

    fn update_batch_summary(&mut self, record: &BatchRecord) -> Result<(), StorageError> {
        let changed = self.conn.execute(
            "UPDATE sync_batches SET status = ?1, delta_count = ?2, applied_count = ?3, conflict_count = ?4, rejected_count = ?5
             WHERE batch_id = ?6",
            rusqlite::params![
                record.status.as_str(),
                record.delta_count,
                record.applied_count,
                record.conflict_count,
                record.rejected_count,
                record.batch_id.as_bytes().as_slice(),
            ],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound(format!("batch {}", record.batch_id)));
        }
        Ok(())
    }

    fn get_batch(&self, batch_id: BatchId) -> Result<Option<BatchRecord>, StorageError> {
        let sql = format!("SELECT {BATCH_COLUMNS} FROM sync_batches WHERE batch_id = ?1");
        let batch = self
            .conn
            .query_row(
                &sql,
                rusqlite::params![batch_id.as_bytes().as_slice()],
                |row| read_batch(row).map_err(tunnel),
            )
            .optional()?;
        Ok(batch)
    }

    fn record_delta_outcome(&mut self, record: &AppliedDeltaRecord) -> Result<(), StorageError> {
        let (kind, conflict_id) = match record.outcome {
            DeltaOutcome::Applied => ("applied", None),
            DeltaOutcome::Conflict { conflict_id } => ("conflict", Some(conflict_id)),
        };
        let result = self.conn.execute(
            "INSERT INTO applied_deltas (delta_id, batch_id, position, entity_type, entity_id, fingerprint, outcome, conflict_id, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                record.delta_id.as_bytes().as_slice(),
                record.batch_id.as_bytes().as_slice(),
                record.position,
                record.entity.entity_type,
                record.entity.entity_id,
                &record.fingerprint[..],
                kind,
                conflict_id.as_ref().map(|c| c.as_bytes().as_slice()),
                record.recorded_at,
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StorageError::ConstraintViolation(format!(
                    "delta {} already has an outcome",
                    record.delta_id
                )))
            }
            Err(e) => Err(StorageError::Sqlite(e)),
        }
    }

    fn get_delta_outcome(
        &self,
        delta_id: DeltaId,
    ) -> Result<Option<AppliedDeltaRecord>, StorageError> {
        let sql = format!("SELECT {OUTCOME_COLUMNS} FROM applied_deltas WHERE delta_id = ?1");
        let record = self
            .conn
            .query_row(
                &sql,
                rusqlite::params![delta_id.as_bytes().as_slice()],
                |row| read_outcome(row).map_err(tunnel),
            )
            .optional()?;
        Ok(record)
    }

    fn list_delta_outcomes(
        &self,
        batch_id: BatchId,
    ) -> Result<Vec<AppliedDeltaRecord>, StorageError> {
        let sql = format!(
            "SELECT {OUTCOME_COLUMNS} FROM applied_deltas WHERE batch_id = ?1 ORDER BY recorded_at, position"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let records = stmt
            .query_map(rusqlite::params![batch_id.as_bytes().as_slice()], |row| {
                read_outcome(row).map_err(tunnel)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }
}

const CONFLICT_COLUMNS: &str = "conflict_id, batch_id, delta_id, device_id, entity_type, entity_id, operation, client_payload, server_payload, client_version, server_version, status, resolved_payload, resolved_version, resolved_at, detected_at, superseded_by";

fn read_conflict(row: &rusqlite::Row) -> Result<ConflictRecord, StorageError> {
    let conflict_bytes: Vec<u8> = row.get(0)?;
    let batch_bytes: Vec<u8> = row.get(1)?;
    let delta_bytes: Vec<u8> = row.get(2)?;
    let device_bytes: Vec<u8> = row.get(3)?;
    let status: String = row.get(11)?;
    let resolved_version: Option<i64> = row.get(13)?;
    let superseded_bytes: Option<Vec<u8>> = row.get(16)?;

    Ok(ConflictRecord {
        conflict_id: ConflictId::from_bytes(to_array::<16>(conflict_bytes, "conflict_id")?),
        batch_id: BatchId::from_bytes(to_array::<16>(batch_bytes, "batch_id")?),
        delta_id: DeltaId::from_bytes(to_array::<16>(delta_bytes, "delta_id")?),
        device_id: DeviceId::from_bytes(to_array::<16>(device_bytes, "device_id")?),
        entity: read_entity(row, 4, 5)?,
        operation: read_operation(row, 6)?,
        client_payload: read_required_payload(row, 7, "client_payload")?,
        server_payload: read_payload(row, 8)?,
        client_version: read_version(row, 9)?,
        server_version: read_version(row, 10)?,
        status: ConflictStatus::parse(&status)?,
        resolved_payload: read_payload(row, 12)?,
        resolved_version: resolved_version.map(SyncVersion::from_i64).transpose()?,
        resolved_at: row.get(14)?,
        detected_at: row.get(15)?,
        superseded_by: superseded_bytes
            .map(|b| to_array::<16>(b, "superseded_by").map(ConflictId::from_bytes))
            .transpose()?,
    })
}

impl ConflictStore for SqliteServerStore {
    fn insert_conflict(&mut self, record: &ConflictRecord) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO conflicts (conflict_id, batch_id, delta_id, device_id, entity_type, entity_id, operation, client_payload, server_payload, client_version, server_version, status, resolved_payload, resolved_version, resolved_at, detected_at, superseded_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            rusqlite::params![
                record.conflict_id.as_bytes().as_slice(),
                record.batch_id.as_bytes().as_slice(),
                record.delta_id.as_bytes().as_slice(),
                record.device_id.as_bytes().as_slice(),
                record.entity.entity_type,
                record.entity.entity_id,
                record.operation.as_str(),
                record.client_payload.as_str(),
                record.server_payload.as_ref().map(|p| p.as_str()),
                version_param(record.client_version)?,
                version_param(record.server_version)?,
                record.status.as_str(),
                record.resolved_payload.as_ref().map(|p| p.as_str()),
                record.resolved_version.map(version_param).transpose()?,
                record.resolved_at,
                record.detected_at,
                record.superseded_by.as_ref().map(|c| c.as_bytes().as_slice()),
            ],
        )?;
        Ok(())
    }

    fn get_conflict(
        &self,
        conflict_id: ConflictId,
    ) -> Result<Option<ConflictRecord>, StorageError> {
        let sql = format!("SELECT {CONFLICT_COLUMNS} FROM conflicts WHERE conflict_id = ?1");
        let record = self
            .conn
            .query_row(
                &sql,
                rusqlite::params![conflict_id.as_bytes().as_slice()],
                |row| read_conflict(row).map_err(tunnel),
            )
            .optional()?;
        Ok(record)
    }

    fn list_conflicts(
        &self,
        device_id: Option<DeviceId>,
        status: Option<ConflictStatus>,
    ) -> Result<Vec<ConflictRecord>, StorageError> {
        let sql = format!(
            "SELECT {CONFLICT_COLUMNS} FROM conflicts
             WHERE (?1 IS NULL OR device_id = ?1) AND (?2 IS NULL OR status = ?2)
             ORDER BY detected_at, rowid"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let records = stmt
            .query_map(
                rusqlite::params![
                    device_id.as_ref().map(|d| d.as_bytes().as_slice()),
                    status.map(|s| s.as_str()),
                ],
                |row| read_conflict(row).map_err(tunnel),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn list_conflicts_for_batch(
        &self,
        batch_id: BatchId,
    ) -> Result<Vec<ConflictRecord>, StorageError> {
        let sql = format!(
            "SELECT {CONFLICT_COLUMNS} FROM conflicts WHERE batch_id = ?1 ORDER BY detected_at, rowid"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let records = stmt
            .query_map(rusqlite::params![batch_id.as_bytes().as_slice()], |row| {
                read_conflict(row).map_err(tunnel)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn update_conflict_resolution(
        &mut self,
        conflict_id: ConflictId,
        resolution: &ConflictResolution,
    ) -> Result<(), StorageError> {
        let changed = self.conn.execute(
            "UPDATE conflicts SET status = ?1, resolved_payload = ?2, resolved_version = ?3, resolved_at = ?4, superseded_by = ?5
             WHERE conflict_id = ?6 AND status = 'unresolved'",
            rusqlite::params![
                resolution.status.as_str(),
                resolution.resolved_payload.as_ref().map(|p| p.as_str()),
                resolution.resolved_version.map(version_param).transpose()?,
                resolution.resolved_at,
                resolution.superseded_by.as_ref().map(|c| c.as_bytes().as_slice()),
                conflict_id.as_bytes().as_slice(),
            ],
        )?;
        if changed == 0 {
            return Err(StorageError::ConstraintViolation(format!(
                "conflict {conflict_id} is not unresolved"
            )));
        }
        Ok(())
    }
}
