//! Helpers shared by the SQLite stores for moving values in and out of rows.

use std::time::{SystemTime, UNIX_EPOCH};

use fieldsync_core::{DeltaPayload, EntityRef, Operation, SyncVersion};

use crate::error::StorageError;

/// Wall-clock milliseconds since the Unix epoch.
pub fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub(crate) fn to_array<const N: usize>(v: Vec<u8>, label: &str) -> Result<[u8; N], StorageError> {
    v.try_into()
        .map_err(|_| StorageError::Serialization(format!("invalid {label} length")))
}

pub(crate) fn version_param(v: SyncVersion) -> Result<i64, StorageError> {
    Ok(v.to_i64()?)
}

pub(crate) fn read_version(row: &rusqlite::Row, idx: usize) -> Result<SyncVersion, StorageError> {
    let raw: i64 = row.get(idx)?;
    Ok(SyncVersion::from_i64(raw)?)
}

pub(crate) fn read_operation(row: &rusqlite::Row, idx: usize) -> Result<Operation, StorageError> {
    let raw: String = row.get(idx)?;
    Ok(Operation::parse(&raw)?)
}

pub(crate) fn read_entity(
    row: &rusqlite::Row,
    type_idx: usize,
    id_idx: usize,
) -> Result<EntityRef, StorageError> {
    Ok(EntityRef::new(
        row.get::<_, String>(type_idx)?,
        row.get::<_, String>(id_idx)?,
    ))
}

/// Payloads were checked on the way in, so they are read back without
/// re-validation.
pub(crate) fn read_payload(
    row: &rusqlite::Row,
    idx: usize,
) -> Result<Option<DeltaPayload>, StorageError> {
    let raw: Option<String> = row.get(idx)?;
    Ok(raw.map(DeltaPayload::from_raw))
}

pub(crate) fn read_required_payload(
    row: &rusqlite::Row,
    idx: usize,
    label: &str,
) -> Result<DeltaPayload, StorageError> {
    read_payload(row, idx)?
        .ok_or_else(|| StorageError::Serialization(format!("{label} is null")))
}

/// Convert a `StorageError` raised while decoding a row into the
/// `rusqlite::Error` that `query_map` closures must return.
pub(crate) fn tunnel(e: StorageError) -> rusqlite::Error {
    match e {
        StorageError::Sqlite(sq) => sq,
        other => rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Blob,
            Box::new(OpaqueStorageError(other.to_string())),
        ),
    }
}

/// Wrapper error type used to tunnel StorageError through rusqlite's error system
/// in query_map closures that must return rusqlite::Error.
#[derive(Debug)]
struct OpaqueStorageError(String);

impl std::fmt::Display for OpaqueStorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for OpaqueStorageError {}
