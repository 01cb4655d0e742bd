//! Boundary checks applied to each incoming delta before it touches the ledger.

use std::collections::HashSet;

use fieldsync_core::{DeltaId, SyncDelta};

use crate::config::ServerConfig;

/// Why a delta was rejected. Rejections are reported per delta and never abort
/// the rest of the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    BlankEntity,
    UnknownEntityType(String),
    VersionStep { from: u64, to: u64 },
    MalformedPayload(String),
    PayloadTooLarge { size: usize, max: usize },
    DuplicateInBatch,
    IdReused,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BlankEntity => write!(f, "entity type and id must be non-empty"),
            Self::UnknownEntityType(t) => write!(f, "entity type '{t}' is not accepted"),
            Self::VersionStep { from, to } => {
                write!(f, "to_version {to} must be from_version {from} + 1")
            }
            Self::MalformedPayload(e) => write!(f, "{e}"),
            Self::PayloadTooLarge { size, max } => {
                write!(f, "payload is {size} bytes, limit is {max}")
            }
            Self::DuplicateInBatch => write!(f, "delta id appears twice in the batch"),
            Self::IdReused => write!(f, "delta id reused with different content"),
        }
    }
}

/// Check one delta. `seen` collects ids of earlier deltas in the same batch.
pub fn check_delta(
    config: &ServerConfig,
    delta: &SyncDelta,
    seen: &mut HashSet<DeltaId>,
) -> Result<(), Rejection> {
    if !seen.insert(delta.id) {
        return Err(Rejection::DuplicateInBatch);
    }
    if delta.entity.is_blank() {
        return Err(Rejection::BlankEntity);
    }
    if !config.accepts_entity_type(&delta.entity.entity_type) {
        return Err(Rejection::UnknownEntityType(delta.entity.entity_type.clone()));
    }
    if !delta.steps_by_one() {
        return Err(Rejection::VersionStep {
            from: delta.from_version.get(),
            to: delta.to_version.get(),
        });
    }
    if delta.payload.len() > config.max_payload_bytes {
        return Err(Rejection::PayloadTooLarge {
            size: delta.payload.len(),
            max: config.max_payload_bytes,
        });
    }
    delta
        .payload
        .validate()
        .map_err(|e| Rejection::MalformedPayload(e.to_string()))
}
