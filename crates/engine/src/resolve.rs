//! Conflict resolution: turns an unresolved conflict into a terminal one and,
//! for client-wins and merged, writes the result to the ledger.

use fieldsync_core::{ConflictId, DeltaPayload, Operation, SyncVersion};
use fieldsync_storage::{
    ConflictRecord, ConflictResolution, ConflictStatus, ResolutionStrategy, unix_millis,
};

use crate::batch::ServerStore;
use crate::config::ServerConfig;
use crate::error::EngineError;
use crate::protocol::ResolveConflictResponse;

/// Resolve `conflict_id` with `strategy`. The caller owns the transaction.
///
/// Client-wins re-reads the ledger first. If it advanced past the version the
/// conflict was detected against, the conflict is marked superseded and a
/// fresh unresolved conflict against the new server state is returned in
/// `replacement` instead of overwriting that change. Merged always writes at
/// the current version plus one: the caller supplied the result to keep.
pub fn resolve<S: ServerStore>(
    store: &mut S,
    config: &ServerConfig,
    conflict_id: ConflictId,
    strategy: ResolutionStrategy,
    merged_payload: Option<DeltaPayload>,
) -> Result<ResolveConflictResponse, EngineError> {
    let conflict = store
        .get_conflict(conflict_id)?
        .ok_or_else(|| EngineError::ConflictNotFound(conflict_id.to_string()))?;

    if conflict.status != ConflictStatus::Unresolved {
        return Err(EngineError::ConflictAlreadyResolved(format!(
            "{conflict_id} is {}",
            conflict.status.as_str()
        )));
    }

    let merged_payload = match strategy {
        ResolutionStrategy::Merged => {
            let payload = merged_payload
                .ok_or_else(|| EngineError::MissingMergedPayload(conflict_id.to_string()))?;
            check_payload(config, &payload)?;
            Some(payload)
        }
        _ => None,
    };

    let now = unix_millis();

    if strategy == ResolutionStrategy::ServerWins {
        let resolution = ConflictResolution {
            status: ConflictStatus::ServerWins,
            resolved_payload: conflict.server_payload.clone(),
            resolved_version: Some(conflict.server_version),
            resolved_at: now,
            superseded_by: None,
        };
        return finish(store, conflict, resolution, None);
    }

    let current = store.get_entry(&conflict.entity)?;
    let current_version = current
        .as_ref()
        .map(|e| e.version)
        .unwrap_or(SyncVersion::INITIAL);

    if strategy == ResolutionStrategy::ClientWins && current_version != conflict.server_version {
        let replacement = ConflictRecord {
            conflict_id: ConflictId::new(),
            server_payload: current.map(|e| e.payload),
            server_version: current_version,
            status: ConflictStatus::Unresolved,
            resolved_payload: None,
            resolved_version: None,
            resolved_at: None,
            detected_at: now,
            superseded_by: None,
            ..conflict.clone()
        };
        store.insert_conflict(&replacement)?;
        tracing::warn!(
            conflict_id = %conflict_id,
            replacement = %replacement.conflict_id,
            entity = %conflict.entity,
            expected = %conflict.server_version,
            current = %current_version,
            "ledger moved since conflict was detected; raised a fresh conflict"
        );
        let resolution = ConflictResolution {
            status: ConflictStatus::Superseded,
            resolved_payload: None,
            resolved_version: None,
            resolved_at: now,
            superseded_by: Some(replacement.conflict_id),
        };
        return finish(store, conflict, resolution, Some(replacement));
    }

    let (version, payload, operation) = match merged_payload {
        Some(merged) => (current_version.next()?, merged, Operation::Update),
        None => (
            conflict.client_version.max(current_version.next()?),
            conflict.client_payload.clone(),
            conflict.operation,
        ),
    };
    store.set_version(
        &conflict.entity,
        version,
        &payload,
        conflict.device_id,
        operation,
    )?;

    let resolution = ConflictResolution {
        status: strategy.status(),
        resolved_payload: Some(payload),
        resolved_version: Some(version),
        resolved_at: now,
        superseded_by: None,
    };
    finish(store, conflict, resolution, None)
}

fn check_payload(config: &ServerConfig, payload: &DeltaPayload) -> Result<(), EngineError> {
    if payload.len() > config.max_payload_bytes {
        return Err(EngineError::InvalidPayload(format!(
            "payload is {} bytes, limit is {}",
            payload.len(),
            config.max_payload_bytes
        )));
    }
    payload
        .validate()
        .map_err(|e| EngineError::InvalidPayload(e.to_string()))
}

fn finish<S: ServerStore>(
    store: &mut S,
    mut conflict: ConflictRecord,
    resolution: ConflictResolution,
    replacement: Option<ConflictRecord>,
) -> Result<ResolveConflictResponse, EngineError> {
    store.update_conflict_resolution(conflict.conflict_id, &resolution)?;

    conflict.status = resolution.status;
    conflict.resolved_payload = resolution.resolved_payload;
    conflict.resolved_version = resolution.resolved_version;
    conflict.resolved_at = Some(resolution.resolved_at);
    conflict.superseded_by = resolution.superseded_by;

    if conflict.status.is_resolved() {
        tracing::info!(
            conflict_id = %conflict.conflict_id,
            entity = %conflict.entity,
            strategy = conflict.status.as_str(),
            version = ?conflict.resolved_version.map(|v| v.get()),
            "conflict resolved"
        );
    }

    Ok(ResolveConflictResponse {
        conflict,
        replacement,
    })
}
