//! The Sync Batch aggregate: applies one device's push against the ledger.

use std::collections::{HashMap, HashSet};

use fieldsync_core::{BatchId, ConflictId, DeltaId, DeviceId, EntityRef, SyncDelta, SyncVersion};
use fieldsync_storage::{
    AppliedDeltaRecord, BatchRecord, BatchStatus, BatchStore, ConflictRecord, ConflictStatus,
    ConflictStore, DeltaOutcome, Ledger, unix_millis,
};

use crate::config::ServerConfig;
use crate::error::EngineError;
use crate::protocol::{DeltaResult, DeltaStatus, PushResponse};
use crate::validate::{Rejection, check_delta};

/// Everything the batch algorithm needs from the server store.
pub trait ServerStore: Ledger + BatchStore + ConflictStore {}

impl<T: Ledger + BatchStore + ConflictStore> ServerStore for T {}

/// Longest `superseded_by` chain followed before giving up.
const MAX_SUPERSEDE_HOPS: usize = 64;

pub struct SyncBatch {
    pub id: BatchId,
    pub device_id: DeviceId,
    pub created_at: i64,
    pub status: BatchStatus,
    pub deltas: Vec<SyncDelta>,
    pub results: Vec<DeltaResult>,
    pub conflicts: Vec<ConflictRecord>,
}

impl SyncBatch {
    pub fn new(id: BatchId, device_id: DeviceId, deltas: Vec<SyncDelta>) -> Self {
        Self {
            id,
            device_id,
            created_at: unix_millis(),
            status: BatchStatus::Pending,
            deltas,
            results: Vec::new(),
            conflicts: Vec::new(),
        }
    }

    fn count(&self, pred: impl Fn(&DeltaStatus) -> bool) -> u32 {
        self.results.iter().filter(|r| pred(&r.status)).count() as u32
    }

    pub fn applied_count(&self) -> u32 {
        self.count(|s| matches!(s, DeltaStatus::Applied))
    }

    pub fn conflict_count(&self) -> u32 {
        self.count(|s| matches!(s, DeltaStatus::Conflict { .. }))
    }

    pub fn rejected_count(&self) -> u32 {
        self.count(|s| matches!(s, DeltaStatus::Rejected { .. }))
    }

    pub fn blocked_count(&self) -> u32 {
        self.count(|s| matches!(s, DeltaStatus::Blocked { .. }))
    }

    pub fn record(&self) -> BatchRecord {
        BatchRecord {
            batch_id: self.id,
            device_id: self.device_id,
            created_at: self.created_at,
            status: self.status,
            delta_count: self.deltas.len() as u32,
            applied_count: self.applied_count(),
            conflict_count: self.conflict_count(),
            rejected_count: self.rejected_count(),
        }
    }

    /// Run every delta against the ledger. The caller owns the transaction;
    /// everything written here commits or rolls back together.
    pub fn apply<S: ServerStore>(
        &mut self,
        store: &mut S,
        config: &ServerConfig,
    ) -> Result<(), EngineError> {
        let fresh = store.insert_batch(&self.record())?;
        if !fresh {
            let existing = store
                .get_batch(self.id)?
                .ok_or_else(|| EngineError::InvalidRequest(format!("batch {} vanished", self.id)))?;
            if existing.device_id != self.device_id {
                return Err(EngineError::InvalidRequest(format!(
                    "batch {} belongs to another device",
                    self.id
                )));
            }
            tracing::debug!(batch_id = %self.id, "batch id seen before, replaying");
        }

        let mut seen: HashSet<DeltaId> = HashSet::new();
        let mut frozen: HashSet<EntityRef> = HashSet::new();
        let mut rejected: HashMap<EntityRef, (DeltaId, SyncVersion)> = HashMap::new();
        let deltas = std::mem::take(&mut self.deltas);

        for (position, delta) in deltas.iter().enumerate() {
            let chains = Chains {
                seen: &mut seen,
                frozen: &mut frozen,
                rejected: &mut rejected,
            };
            let status = self.apply_one(store, config, delta, position as u32, chains)?;
            self.results.push(DeltaResult {
                delta_id: delta.id,
                status,
            });
        }
        self.deltas = deltas;

        self.status = match (self.applied_count(), self.conflict_count()) {
            (_, 0) => BatchStatus::Applied,
            (0, _) => BatchStatus::Conflict,
            _ => BatchStatus::PartialConflict,
        };
        if fresh {
            store.update_batch_summary(&self.record())?;
        }
        Ok(())
    }

    fn apply_one<S: ServerStore>(
        &mut self,
        store: &mut S,
        config: &ServerConfig,
        delta: &SyncDelta,
        position: u32,
        chains: Chains<'_>,
    ) -> Result<DeltaStatus, EngineError> {
        let Chains {
            seen,
            frozen,
            rejected,
        } = chains;

        if let Err(rejection) = check_delta(config, delta, seen) {
            rejected.insert(delta.entity.clone(), (delta.id, delta.to_version));
            return Ok(self.reject(delta, rejection));
        }

        let fingerprint = delta.fingerprint();
        if let Some(prior) = store.get_delta_outcome(delta.id)? {
            if prior.fingerprint != fingerprint {
                rejected.insert(delta.entity.clone(), (delta.id, delta.to_version));
                return Ok(self.reject(delta, Rejection::IdReused));
            }
            return match prior.outcome {
                DeltaOutcome::Applied => {
                    tracing::debug!(
                        delta_id = %delta.id,
                        entity = %delta.entity,
                        "replayed applied delta"
                    );
                    Ok(DeltaStatus::Applied)
                }
                DeltaOutcome::Conflict { conflict_id } => {
                    let live = live_conflict(store, conflict_id)?;
                    tracing::debug!(
                        delta_id = %delta.id,
                        conflict_id = %live.conflict_id,
                        status = live.status.as_str(),
                        "replayed conflicted delta"
                    );
                    frozen.insert(delta.entity.clone());
                    let conflict_id = live.conflict_id;
                    self.note_conflict(live);
                    Ok(DeltaStatus::Conflict { conflict_id })
                }
            };
        }

        let current = store.get_entry(&delta.entity)?;
        let current_version = current
            .as_ref()
            .map(|e| e.version)
            .unwrap_or(SyncVersion::INITIAL);

        // A delta that only misses the ledger because it was built on top of a
        // rejected one is held back rather than turned into a conflict.
        if let Some(&(by, tip)) = rejected.get(&delta.entity) {
            if !frozen.contains(&delta.entity)
                && delta.from_version == tip
                && current_version != delta.from_version
            {
                rejected.insert(delta.entity.clone(), (by, delta.to_version));
                tracing::debug!(
                    delta_id = %delta.id,
                    entity = %delta.entity,
                    blocked_by = %by,
                    "delta builds on a rejected delta"
                );
                return Ok(DeltaStatus::Blocked { by });
            }
        }

        let outcome = if !frozen.contains(&delta.entity) && current_version == delta.from_version {
            store.set_version(
                &delta.entity,
                delta.to_version,
                &delta.payload,
                self.device_id,
                delta.operation,
            )?;
            tracing::debug!(
                delta_id = %delta.id,
                entity = %delta.entity,
                version = %delta.to_version,
                "delta applied"
            );
            DeltaOutcome::Applied
        } else {
            let record = ConflictRecord {
                conflict_id: ConflictId::new(),
                batch_id: self.id,
                delta_id: delta.id,
                device_id: self.device_id,
                entity: delta.entity.clone(),
                operation: delta.operation,
                client_payload: delta.payload.clone(),
                server_payload: current.map(|e| e.payload),
                client_version: delta.to_version,
                server_version: current_version,
                status: ConflictStatus::Unresolved,
                resolved_payload: None,
                resolved_version: None,
                resolved_at: None,
                detected_at: unix_millis(),
                superseded_by: None,
            };
            store.insert_conflict(&record)?;
            tracing::debug!(
                delta_id = %delta.id,
                entity = %delta.entity,
                from = %delta.from_version,
                server = %current_version,
                conflict_id = %record.conflict_id,
                "delta conflicted"
            );
            frozen.insert(delta.entity.clone());
            let conflict_id = record.conflict_id;
            self.note_conflict(record);
            DeltaOutcome::Conflict { conflict_id }
        };

        store.record_delta_outcome(&AppliedDeltaRecord {
            delta_id: delta.id,
            batch_id: self.id,
            position,
            entity: delta.entity.clone(),
            fingerprint,
            outcome,
            recorded_at: unix_millis(),
        })?;

        Ok(match outcome {
            DeltaOutcome::Applied => DeltaStatus::Applied,
            DeltaOutcome::Conflict { conflict_id } => DeltaStatus::Conflict { conflict_id },
        })
    }

    fn reject(&self, delta: &SyncDelta, rejection: Rejection) -> DeltaStatus {
        tracing::warn!(
            batch_id = %self.id,
            delta_id = %delta.id,
            entity = %delta.entity,
            reason = %rejection,
            "delta rejected"
        );
        DeltaStatus::Rejected {
            reason: rejection.to_string(),
        }
    }

    fn note_conflict(&mut self, record: ConflictRecord) {
        if !self.conflicts.iter().any(|c| c.conflict_id == record.conflict_id) {
            self.conflicts.push(record);
        }
    }

    pub fn into_response(self) -> PushResponse {
        PushResponse {
            batch_id: self.id,
            status: self.status,
            conflicts: self.conflicts,
            results: self.results,
        }
    }
}

/// Per-entity state carried from one delta to the next within a batch.
struct Chains<'a> {
    /// Ids already seen in this batch.
    seen: &'a mut HashSet<DeltaId>,
    /// Entities with a conflict earlier in the batch.
    frozen: &'a mut HashSet<EntityRef>,
    /// Entities with a rejected delta: the rejected id and the version a
    /// delta chained on it would start from.
    rejected: &'a mut HashMap<EntityRef, (DeltaId, SyncVersion)>,
}

/// Follow `superseded_by` links to the conflict currently standing in for
/// `conflict_id`.
pub(crate) fn live_conflict<S: ConflictStore + ?Sized>(
    store: &S,
    conflict_id: ConflictId,
) -> Result<ConflictRecord, EngineError> {
    let mut id = conflict_id;
    for _ in 0..MAX_SUPERSEDE_HOPS {
        let record = store
            .get_conflict(id)?
            .ok_or_else(|| EngineError::ConflictNotFound(id.to_string()))?;
        match (record.status, record.superseded_by) {
            (ConflictStatus::Superseded, Some(next)) => id = next,
            _ => return Ok(record),
        }
    }
    Err(EngineError::InvalidRequest(format!(
        "conflict {conflict_id} supersede chain too long"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_core::{DeltaPayload, Operation};
    use fieldsync_storage::SqliteServerStore;

    fn delta(entity: &EntityRef, from: u64, body: &str) -> SyncDelta {
        let operation = if from == 0 { Operation::Create } else { Operation::Update };
        SyncDelta::new(
            entity.clone(),
            operation,
            SyncVersion::new(from),
            DeltaPayload::from_raw(body),
            0,
        )
        .unwrap()
    }

    fn push(store: &mut SqliteServerStore, device: DeviceId, deltas: Vec<SyncDelta>) -> SyncBatch {
        let mut batch = SyncBatch::new(BatchId::new(), device, deltas);
        batch.apply(store, &ServerConfig::default()).unwrap();
        batch
    }

    #[test]
    fn stale_base_version_conflicts_and_leaves_ledger_alone() {
        let mut store = SqliteServerStore::open_in_memory().unwrap();
        let e = EntityRef::new("installation", "E");

        let first = push(&mut store, DeviceId::new(), vec![delta(&e, 0, r#"{"n":1}"#)]);
        assert_eq!(first.status, BatchStatus::Applied);

        let second = push(&mut store, DeviceId::new(), vec![delta(&e, 0, r#"{"n":2}"#)]);
        assert_eq!(second.status, BatchStatus::Conflict);
        let conflict = &second.conflicts[0];
        assert_eq!(conflict.server_version, SyncVersion::new(1));
        assert_eq!(conflict.client_version, SyncVersion::new(1));
        assert_eq!(conflict.server_payload, Some(DeltaPayload::from_raw(r#"{"n":1}"#)));

        let entry = store.get_entry(&e).unwrap().unwrap();
        assert_eq!(entry.payload, DeltaPayload::from_raw(r#"{"n":1}"#));
    }

    #[test]
    fn mixed_outcomes_give_partial_conflict() {
        let mut store = SqliteServerStore::open_in_memory().unwrap();
        let a = EntityRef::new("photo", "a");
        let b = EntityRef::new("photo", "b");
        push(&mut store, DeviceId::new(), vec![delta(&a, 0, "{}")]);

        let batch = push(
            &mut store,
            DeviceId::new(),
            vec![delta(&a, 0, "{}"), delta(&b, 0, "{}")],
        );
        assert_eq!(batch.status, BatchStatus::PartialConflict);
        assert_eq!(batch.applied_count(), 1);
        assert_eq!(batch.conflict_count(), 1);

        let stored = store.get_batch(batch.id).unwrap().unwrap();
        assert_eq!(stored.status, BatchStatus::PartialConflict);
        assert_eq!(stored.conflict_count, 1);
    }

    #[test]
    fn chain_after_a_conflict_is_not_compared() {
        let mut store = SqliteServerStore::open_in_memory().unwrap();
        let e = EntityRef::new("installation", "E");
        push(&mut store, DeviceId::new(), vec![delta(&e, 0, "{}")]);

        // The second delta's base happens to equal the ledger version, but it
        // was built on top of the conflicted first one.
        let batch = push(
            &mut store,
            DeviceId::new(),
            vec![delta(&e, 0, r#"{"a":1}"#), delta(&e, 1, r#"{"a":2}"#)],
        );
        assert_eq!(batch.conflict_count(), 2);
        assert_eq!(batch.conflicts.len(), 2);
        assert_eq!(store.get_current_version(&e).unwrap(), SyncVersion::new(1));
    }

    #[test]
    fn chain_after_a_rejection_is_blocked_not_conflicted() {
        let mut store = SqliteServerStore::open_in_memory().unwrap();
        let e = EntityRef::new("photo", "p1");
        push(&mut store, DeviceId::new(), vec![delta(&e, 0, "{}")]);

        let device = DeviceId::new();
        let bad = delta(&e, 1, "{not json");
        let follower = delta(&e, 2, r#"{"n":2}"#);
        let batch = push(&mut store, device, vec![bad.clone(), follower.clone()]);
        assert!(matches!(batch.results[0].status, DeltaStatus::Rejected { .. }));
        assert_eq!(batch.results[1].status, DeltaStatus::Blocked { by: bad.id });
        assert_eq!(batch.status, BatchStatus::Applied);
        assert!(batch.conflicts.is_empty());
        assert!(store.get_delta_outcome(follower.id).unwrap().is_none());

        // Resent on top of the last accepted version, it applies under the
        // same id.
        let mut rebased = follower;
        rebased.from_version = SyncVersion::new(1);
        rebased.to_version = SyncVersion::new(2);
        let retry = push(&mut store, device, vec![bad, rebased]);
        assert_eq!(retry.results[1].status, DeltaStatus::Applied);
        assert_eq!(store.get_current_version(&e).unwrap(), SyncVersion::new(2));
    }

    #[test]
    fn replayed_delta_reports_prior_outcome() {
        let mut store = SqliteServerStore::open_in_memory().unwrap();
        let device = DeviceId::new();
        let e = EntityRef::new("installation", "E");
        push(&mut store, DeviceId::new(), vec![delta(&e, 0, "{}")]);

        let stale = delta(&e, 0, r#"{"late":true}"#);
        let first = push(&mut store, device, vec![stale.clone()]);
        let replay = push(&mut store, device, vec![stale.clone()]);
        assert_eq!(replay.results, first.results);
        assert_eq!(replay.conflicts[0].conflict_id, first.conflicts[0].conflict_id);
        assert_eq!(store.list_conflicts(None, None).unwrap().len(), 1);

        let mut altered = stale;
        altered.payload = DeltaPayload::from_raw(r#"{"late":false}"#);
        let reused = push(&mut store, device, vec![altered]);
        assert!(matches!(reused.results[0].status, DeltaStatus::Rejected { .. }));
    }

    #[test]
    fn live_conflict_follows_supersede_links() {
        let mut store = SqliteServerStore::open_in_memory().unwrap();
        let e = EntityRef::new("installation", "E");
        push(&mut store, DeviceId::new(), vec![delta(&e, 0, "{}")]);
        let batch = push(&mut store, DeviceId::new(), vec![delta(&e, 0, "{}")]);
        let original = batch.conflicts[0].clone();

        let replacement = ConflictRecord {
            conflict_id: ConflictId::new(),
            ..original.clone()
        };
        store.insert_conflict(&replacement).unwrap();
        store
            .update_conflict_resolution(
                original.conflict_id,
                &fieldsync_storage::ConflictResolution {
                    status: ConflictStatus::Superseded,
                    resolved_payload: None,
                    resolved_version: None,
                    resolved_at: unix_millis(),
                    superseded_by: Some(replacement.conflict_id),
                },
            )
            .unwrap();

        let live = live_conflict(&store, original.conflict_id).unwrap();
        assert_eq!(live.conflict_id, replacement.conflict_id);
        assert_eq!(live.status, ConflictStatus::Unresolved);
    }
}
