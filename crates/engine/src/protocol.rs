//! Messages exchanged between devices and the sync service.
//!
//! Every message is a serde type; on the wire it travels as MessagePack with
//! named fields.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use fieldsync_core::{BatchId, ConflictId, DeltaId, DeltaPayload, DeviceId, Hlc, SyncDelta};
use fieldsync_storage::{
    BatchRecord, BatchStatus, ConflictRecord, ConflictStatus, LedgerEntry, PullCursor,
    ResolutionStrategy,
};

use crate::error::EngineError;

pub trait WireMessage: Serialize + DeserializeOwned {
    fn to_msgpack(&self) -> Result<Vec<u8>, EngineError> {
        rmp_serde::to_vec_named(self).map_err(|e| EngineError::Codec(e.to_string()))
    }

    fn from_msgpack(bytes: &[u8]) -> Result<Self, EngineError> {
        rmp_serde::from_slice(bytes).map_err(|e| EngineError::Codec(e.to_string()))
    }
}

// ============================================================================
// Push
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRequest {
    /// Chosen by the device; a resent request keeps it.
    pub batch_id: BatchId,
    pub device_id: DeviceId,
    pub deltas: Vec<SyncDelta>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaStatus {
    Applied,
    Conflict { conflict_id: ConflictId },
    Rejected { reason: String },
    /// Not attempted: it builds on a delta rejected earlier in the same batch.
    /// Nothing is recorded, so the device may resend it rebased.
    Blocked { by: DeltaId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaResult {
    pub delta_id: DeltaId,
    pub status: DeltaStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushResponse {
    pub batch_id: BatchId,
    pub status: BatchStatus,
    /// Current state of every conflict a delta in this request ended up in.
    pub conflicts: Vec<ConflictRecord>,
    /// One result per delta, in request order.
    pub results: Vec<DeltaResult>,
}

impl PushResponse {
    pub fn applied_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.status, DeltaStatus::Applied))
            .count()
    }

    pub fn conflict(&self, conflict_id: ConflictId) -> Option<&ConflictRecord> {
        self.conflicts.iter().find(|c| c.conflict_id == conflict_id)
    }
}

// ============================================================================
// Pull
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub since: Hlc,
    pub cursor: Option<PullCursor>,
    /// Clamped by the server; `None` asks for its default page size.
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullResponse {
    pub entries: Vec<LedgerEntry>,
    pub next_cursor: Option<PullCursor>,
    pub has_more: bool,
}

// ============================================================================
// Conflicts and batches
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListConflictsRequest {
    pub device_id: Option<DeviceId>,
    pub status: Option<ConflictStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveConflictRequest {
    pub conflict_id: ConflictId,
    pub strategy: ResolutionStrategy,
    pub merged_payload: Option<DeltaPayload>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveConflictResponse {
    /// The conflict as it stands after the attempt: resolved, or superseded.
    pub conflict: ConflictRecord,
    /// Fresh unresolved conflict raised because the ledger moved since the
    /// original was detected.
    pub replacement: Option<ConflictRecord>,
}

impl ResolveConflictResponse {
    pub fn is_resolved(&self) -> bool {
        self.conflict.status.is_resolved()
    }
}

/// Persisted summary of one push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch: BatchRecord,
    /// Persisted outcomes, in the order they were recorded.
    pub results: Vec<DeltaResult>,
    pub conflicts: Vec<ConflictRecord>,
}

// ============================================================================
// Envelopes
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Request {
    Push(PushRequest),
    Pull(PullRequest),
    ListConflicts(ListConflictsRequest),
    ResolveConflict(ResolveConflictRequest),
    GetBatch { batch_id: BatchId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    Push(PushResponse),
    Pull(PullResponse),
    ListConflicts(Vec<ConflictRecord>),
    ResolveConflict(ResolveConflictResponse),
    GetBatch(Option<BatchSummary>),
    Error(WireError),
}

impl WireMessage for Request {}
impl WireMessage for Response {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    ConflictNotFound,
    ConflictAlreadyResolved,
    MissingMergedPayload,
    InvalidPayload,
    Internal,
}

/// Error carried back to the device in place of a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: ErrorCode,
    pub message: String,
}

impl From<&EngineError> for WireError {
    fn from(err: &EngineError) -> Self {
        let (code, message) = match err {
            EngineError::InvalidRequest(m) => (ErrorCode::InvalidRequest, m.clone()),
            EngineError::ConflictNotFound(m) => (ErrorCode::ConflictNotFound, m.clone()),
            EngineError::ConflictAlreadyResolved(m) => {
                (ErrorCode::ConflictAlreadyResolved, m.clone())
            }
            EngineError::MissingMergedPayload(m) => (ErrorCode::MissingMergedPayload, m.clone()),
            EngineError::InvalidPayload(m) => (ErrorCode::InvalidPayload, m.clone()),
            other => (ErrorCode::Internal, other.to_string()),
        };
        Self { code, message }
    }
}

impl From<WireError> for EngineError {
    fn from(err: WireError) -> Self {
        match err.code {
            ErrorCode::InvalidRequest => EngineError::InvalidRequest(err.message),
            ErrorCode::ConflictNotFound => EngineError::ConflictNotFound(err.message),
            ErrorCode::ConflictAlreadyResolved => EngineError::ConflictAlreadyResolved(err.message),
            ErrorCode::MissingMergedPayload => EngineError::MissingMergedPayload(err.message),
            ErrorCode::InvalidPayload => EngineError::InvalidPayload(err.message),
            ErrorCode::Internal => {
                EngineError::Transport(crate::error::TransportError::Server(err.message))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_core::{EntityRef, Operation, SyncVersion};

    #[test]
    fn push_request_survives_the_wire() {
        let delta = SyncDelta::new(
            EntityRef::new("installation", "inst-1"),
            Operation::Create,
            SyncVersion::INITIAL,
            DeltaPayload::parse(r#"{"status":"planned"}"#).unwrap(),
            1_700_000_000_000,
        )
        .unwrap();
        let request = Request::Push(PushRequest {
            batch_id: BatchId::new(),
            device_id: DeviceId::new(),
            deltas: vec![delta],
        });

        let bytes = request.to_msgpack().unwrap();
        assert_eq!(Request::from_msgpack(&bytes).unwrap(), request);
    }

    #[test]
    fn pull_request_carries_cursor() {
        let request = Request::Pull(PullRequest {
            since: Hlc::new(5, 1),
            cursor: Some(PullCursor {
                last_modified: Hlc::new(5, 1),
                entity_type: "photo".into(),
                entity_id: "p1".into(),
            }),
            limit: Some(50),
        });
        let bytes = request.to_msgpack().unwrap();
        assert_eq!(Request::from_msgpack(&bytes).unwrap(), request);
    }

    #[test]
    fn truncated_message_is_a_codec_error() {
        let bytes = Request::GetBatch {
            batch_id: BatchId::new(),
        }
        .to_msgpack()
        .unwrap();
        let err = Request::from_msgpack(&bytes[..bytes.len() / 2]).unwrap_err();
        assert!(matches!(err, EngineError::Codec(_)));
    }

    #[test]
    fn wire_errors_map_back_to_engine_errors() {
        let wire = WireError::from(&EngineError::ConflictAlreadyResolved("c1".into()));
        assert_eq!(wire.code, ErrorCode::ConflictAlreadyResolved);
        assert!(matches!(
            EngineError::from(wire),
            EngineError::ConflictAlreadyResolved(_)
        ));

        let internal = WireError::from(&EngineError::Cancelled);
        assert_eq!(internal.code, ErrorCode::Internal);
        assert!(EngineError::from(internal).is_retryable());
    }
}
