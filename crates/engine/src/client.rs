//! Device side of sync: local writes, push from the outbox, pull into local
//! storage.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use fieldsync_core::{
    BatchId, ConflictId, DeltaId, DeltaPayload, EntityRef, Hlc, Operation, OutboxEntryId,
    SyncDelta,
};
use fieldsync_storage::{
    BatchStatus, ConflictRecord, ConflictStatus, LocalEntityStore, OutboxEntry, OutboxStore,
    PullCursor, ResolutionStrategy, SqliteClientStore, StorageError, SyncMetaStore, unix_millis,
};

use crate::config::{ClientConfig, RetryConfig};
use crate::direct_write::DirectWriteRegistry;
use crate::error::EngineError;
use crate::protocol::{
    DeltaStatus, ListConflictsRequest, PullRequest, PushRequest, PushResponse,
    ResolveConflictResponse,
};
use crate::transport::SyncTransport;

/// Shared cancellation flag for a sync in progress.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), EngineError> {
        if self.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    /// `None` when the outbox had nothing to send.
    pub batch_id: Option<BatchId>,
    pub status: Option<BatchStatus>,
    pub sent: usize,
    pub applied: usize,
    pub conflicted: usize,
    pub rejected: usize,
    /// Entries whose conflict had already been resolved on the server.
    pub settled: usize,
    /// Entries left for a later push to keep the batch within size.
    pub deferred: usize,
    /// Entries the server held back because they built on a rejected entry,
    /// as of the last round sent.
    pub blocked: usize,
    /// Entries moved down their entity's chain after a rejection.
    pub rebased: usize,
    /// Conflicts still waiting for a resolution.
    pub conflicts: Vec<ConflictRecord>,
}

impl PushReport {
    /// Fold a follow-up round into this report. Counts add up; batch id,
    /// status and `blocked` come from the later round.
    fn absorb(&mut self, round: PushReport) {
        if round.batch_id.is_some() {
            self.batch_id = round.batch_id;
            self.status = round.status;
        }
        self.sent += round.sent;
        self.applied += round.applied;
        self.conflicted += round.conflicted;
        self.rejected += round.rejected;
        self.settled += round.settled;
        self.blocked = round.blocked;
        self.rebased += round.rebased;
        for conflict in round.conflicts {
            if !self.conflicts.iter().any(|c| c.conflict_id == conflict.conflict_id) {
                self.conflicts.push(conflict);
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullReport {
    pub pages: usize,
    pub received: usize,
    pub applied: usize,
    /// Entries at or below the version this device already holds.
    pub skipped: usize,
    pub cursor: Option<PullCursor>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub pushed: usize,
    pub pulled: usize,
    pub conflicts: Vec<ConflictRecord>,
    pub push: PushReport,
    pub pull: PullReport,
}

/// Orchestrates sync for one device.
///
/// Every sync entry point takes `&mut self`, so push and pull never overlap on
/// one manager.
pub struct SyncManager<T: SyncTransport> {
    store: SqliteClientStore,
    transport: T,
    config: ClientConfig,
    registry: DirectWriteRegistry,
}

impl<T: SyncTransport> SyncManager<T> {
    /// A manager that stores every pulled entity type in `local_entities`.
    pub fn new(store: SqliteClientStore, transport: T, config: ClientConfig) -> Self {
        Self::with_registry(store, transport, config, DirectWriteRegistry::store_all())
    }

    pub fn with_registry(
        store: SqliteClientStore,
        transport: T,
        config: ClientConfig,
        registry: DirectWriteRegistry,
    ) -> Self {
        Self {
            store,
            transport,
            config,
            registry,
        }
    }

    pub fn store(&self) -> &SqliteClientStore {
        &self.store
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    // ========================================================================
    // Local writes
    // ========================================================================

    /// Apply a local mutation and queue it for push, in one local transaction.
    pub fn write_local(
        &mut self,
        entity: EntityRef,
        operation: Operation,
        payload: DeltaPayload,
    ) -> Result<OutboxEntry, EngineError> {
        if entity.is_blank() {
            return Err(EngineError::InvalidRequest(
                "entity type and id must be non-empty".into(),
            ));
        }
        payload
            .validate()
            .map_err(|e| EngineError::InvalidPayload(e.to_string()))?;

        let device_id = self.config.device_id;
        let entry = with_transaction(&mut self.store, |store| {
            store.put_local_edit(&entity, &payload, operation == Operation::Delete)?;
            Ok(store.enqueue(&entity, operation, &payload, device_id, unix_millis())?)
        })?;

        tracing::debug!(
            entry_id = %entry.id,
            entity = %entity,
            base = %entry.base_version,
            target = %entry.target_version,
            "local write queued"
        );
        Ok(entry)
    }

    // ========================================================================
    // Push
    // ========================================================================

    /// Send one batch of unsynced outbox entries and record the outcome of
    /// each on its entry. Entries held back behind a rejected entry are
    /// rebased by the rejection and sent again straight away.
    pub fn push(&mut self) -> Result<PushReport, EngineError> {
        let (mut report, mut held) = self.push_round(None)?;
        let mut again = !held.is_empty() && report.rebased > 0;
        while again {
            let (round, next) = self.push_round(Some(&held))?;
            again = !next.is_empty() && round.rebased > 0;
            held = next;
            report.absorb(round);
        }
        Ok(report)
    }

    /// One batch. With `only`, just the non-rejected entries of those
    /// entities are sent. Also returns the entities the server held back.
    fn push_round(
        &mut self,
        only: Option<&HashSet<EntityRef>>,
    ) -> Result<(PushReport, HashSet<EntityRef>), EngineError> {
        let mut unsynced = self.store.get_unsynced()?;
        if let Some(only) = only {
            unsynced.retain(|e| !e.rejected && only.contains(&e.entity));
        }
        if unsynced.is_empty() {
            return Ok((PushReport::default(), HashSet::new()));
        }

        let limit = self.config.push_batch_size.max(1) as usize;
        let (entries, deferred) = select_batch(unsynced, limit);
        let ids: Vec<OutboxEntryId> = entries.iter().map(|e| e.id).collect();

        with_transaction(&mut self.store, |store| Ok(store.mark_syncing(&ids)?))?;

        let request = PushRequest {
            batch_id: BatchId::new(),
            device_id: self.config.device_id,
            deltas: entries.iter().map(delta_for).collect(),
        };

        let transport = &self.transport;
        let response = match with_retry(&self.config.retry, "push", || transport.push(&request)) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(
                    batch_id = %request.batch_id,
                    entries = ids.len(),
                    error = %e,
                    "push failed"
                );
                let reason = e.to_string();
                with_transaction(&mut self.store, |store| {
                    Ok(store.mark_failed(&ids, &reason)?)
                })?;
                return Err(e);
            }
        };

        let mut held = HashSet::new();
        let mut report = with_transaction(&mut self.store, |store| {
            record_push_outcome(store, &entries, &response, &mut held)
        })?;
        report.deferred = deferred;

        tracing::info!(
            batch_id = %response.batch_id,
            status = response.status.as_str(),
            sent = report.sent,
            applied = report.applied,
            conflicts = report.conflicted,
            rejected = report.rejected,
            blocked = report.blocked,
            deferred,
            "push complete"
        );
        Ok((report, held))
    }

    // ========================================================================
    // Pull
    // ========================================================================

    pub fn pull(&mut self) -> Result<PullReport, EngineError> {
        self.pull_with_cancel(&CancelFlag::new())
    }

    /// Fetch changes page by page. Each page is applied and the cursor
    /// advanced in one local transaction; the flag is checked between pages.
    pub fn pull_with_cancel(&mut self, cancel: &CancelFlag) -> Result<PullReport, EngineError> {
        let mut report = PullReport::default();

        loop {
            cancel.check()?;

            let request = PullRequest {
                since: self.store.last_sync_timestamp()?.unwrap_or(Hlc::ZERO),
                cursor: self.store.pull_cursor()?,
                limit: Some(self.config.pull_page_size),
            };
            let transport = &self.transport;
            let response = with_retry(&self.config.retry, "pull", || transport.pull(&request))?;

            let registry = &self.registry;
            let (applied, skipped) = with_transaction(&mut self.store, |store| {
                let mut applied = 0;
                let mut skipped = 0;
                for entry in &response.entries {
                    if entry.version <= store.server_version(&entry.entity)? {
                        skipped += 1;
                        continue;
                    }
                    registry.apply(&mut *store, entry)?;
                    applied += 1;
                }
                if let Some(cursor) = &response.next_cursor {
                    store.set_pull_cursor(cursor)?;
                }
                Ok((applied, skipped))
            })?;

            report.pages += 1;
            report.received += response.entries.len();
            report.applied += applied;
            report.skipped += skipped;
            if response.next_cursor.is_some() {
                report.cursor = response.next_cursor;
            }

            tracing::debug!(
                entries = response.entries.len(),
                applied,
                skipped,
                has_more = response.has_more,
                "pull page applied"
            );

            if !response.has_more {
                break;
            }
        }

        tracing::info!(
            pages = report.pages,
            applied = report.applied,
            skipped = report.skipped,
            "pull complete"
        );
        Ok(report)
    }

    // ========================================================================
    // Sync
    // ========================================================================

    pub fn sync(&mut self) -> Result<SyncReport, EngineError> {
        self.sync_with_cancel(&CancelFlag::new())
    }

    /// Push, then pull. Progress made before a cancellation stays persisted.
    pub fn sync_with_cancel(&mut self, cancel: &CancelFlag) -> Result<SyncReport, EngineError> {
        cancel.check()?;
        let push = self.push()?;
        cancel.check()?;
        let pull = self.pull_with_cancel(cancel)?;
        Ok(SyncReport {
            pushed: push.applied,
            pulled: pull.applied,
            conflicts: push.conflicts.clone(),
            push,
            pull,
        })
    }

    // ========================================================================
    // Conflicts
    // ========================================================================

    /// This device's conflicts on the server.
    pub fn list_conflicts(
        &self,
        status: Option<ConflictStatus>,
    ) -> Result<Vec<ConflictRecord>, EngineError> {
        let request = ListConflictsRequest {
            device_id: Some(self.config.device_id),
            status,
        };
        with_retry(&self.config.retry, "list_conflicts", || {
            self.transport.list_conflicts(&request)
        })
    }

    /// Resolve a conflict on the server. A resolution that took effect is
    /// written to local storage straight away; the outbox entry that caused
    /// the conflict is settled on the next push.
    pub fn resolve_conflict(
        &mut self,
        conflict_id: ConflictId,
        strategy: ResolutionStrategy,
        merged_payload: Option<DeltaPayload>,
    ) -> Result<ResolveConflictResponse, EngineError> {
        let response = self
            .transport
            .resolve_conflict(conflict_id, strategy, merged_payload)?;
        if response.is_resolved() {
            let conflict = &response.conflict;
            with_transaction(&mut self.store, |store| apply_resolution(store, conflict))?;
        }
        Ok(response)
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Run `f` inside `BEGIN IMMEDIATE`, committing on success and rolling back on
/// error.
fn with_transaction<R>(
    store: &mut SqliteClientStore,
    f: impl FnOnce(&mut SqliteClientStore) -> Result<R, EngineError>,
) -> Result<R, EngineError> {
    exec(store, "BEGIN IMMEDIATE")?;
    match f(store) {
        Ok(value) => {
            exec(store, "COMMIT")?;
            Ok(value)
        }
        Err(e) => {
            let _ = exec(store, "ROLLBACK");
            Err(e)
        }
    }
}

fn exec(store: &SqliteClientStore, sql: &str) -> Result<(), EngineError> {
    store
        .conn()
        .execute_batch(sql)
        .map_err(|e| EngineError::Storage(StorageError::Sqlite(e)))
}

/// Call `op` until it succeeds, fails with a non-retryable error, or runs out
/// of attempts. The same request is resent on every attempt.
fn with_retry<R>(
    retry: &RetryConfig,
    call: &str,
    mut op: impl FnMut() -> Result<R, EngineError>,
) -> Result<R, EngineError> {
    let attempts = retry.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                attempt += 1;
                let delay = retry.delay_for_attempt(attempt);
                tracing::warn!(
                    call,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying after transient failure"
                );
                std::thread::sleep(delay);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Pick entries for one push, oldest first, without splitting an entity's
/// chain. Returns the selection in `seq` order and the number deferred.
fn select_batch(entries: Vec<OutboxEntry>, limit: usize) -> (Vec<OutboxEntry>, usize) {
    let mut groups: Vec<Vec<OutboxEntry>> = Vec::new();
    let mut by_entity: HashMap<EntityRef, usize> = HashMap::new();
    for entry in entries {
        match by_entity.get(&entry.entity) {
            Some(&i) => groups[i].push(entry),
            None => {
                by_entity.insert(entry.entity.clone(), groups.len());
                groups.push(vec![entry]);
            }
        }
    }

    let mut selected = Vec::new();
    let mut deferred = 0;
    for group in groups {
        let alone = selected.is_empty() && group.len() > limit;
        if alone || selected.len() + group.len() <= limit {
            selected.extend(group);
        } else {
            deferred += group.len();
        }
    }
    selected.sort_by_key(|e| e.seq);
    (selected, deferred)
}

fn delta_for(entry: &OutboxEntry) -> SyncDelta {
    SyncDelta {
        id: DeltaId::from(entry.id),
        entity: entry.entity.clone(),
        operation: entry.operation,
        from_version: entry.base_version,
        to_version: entry.target_version,
        payload: entry.payload.clone(),
        timestamp: entry.timestamp,
    }
}

fn record_push_outcome(
    store: &mut SqliteClientStore,
    entries: &[OutboxEntry],
    response: &PushResponse,
    held: &mut HashSet<EntityRef>,
) -> Result<PushReport, EngineError> {
    let mut report = PushReport {
        batch_id: Some(response.batch_id),
        status: Some(response.status),
        sent: entries.len(),
        ..PushReport::default()
    };
    let by_delta: HashMap<DeltaId, &OutboxEntry> =
        entries.iter().map(|e| (DeltaId::from(e.id), e)).collect();

    let mut answered = Vec::with_capacity(response.results.len());
    for result in &response.results {
        let Some(entry) = by_delta.get(&result.delta_id) else {
            continue;
        };
        answered.push(entry.id);
        match &result.status {
            DeltaStatus::Applied => {
                store.mark_synced(&[entry.id])?;
                store.raise_server_version(&entry.entity, entry.target_version)?;
                report.applied += 1;
            }
            DeltaStatus::Conflict { conflict_id } => {
                let conflict = response.conflict(*conflict_id);
                match conflict {
                    Some(c) if c.status.is_resolved() => {
                        store.mark_synced(&[entry.id])?;
                        apply_resolution(store, c)?;
                        report.settled += 1;
                    }
                    _ => {
                        store.mark_failed(&[entry.id], &format!("conflict {conflict_id}"))?;
                        report.conflicted += 1;
                        if let Some(c) = conflict {
                            if !report.conflicts.iter().any(|k| k.conflict_id == c.conflict_id) {
                                report.conflicts.push(c.clone());
                            }
                        }
                    }
                }
            }
            DeltaStatus::Rejected { reason } => {
                report.rebased += store.mark_rejected(entry.id, reason)?;
                report.rejected += 1;
            }
            DeltaStatus::Blocked { by } => {
                store.mark_failed(&[entry.id], &format!("waiting on rejected delta {by}"))?;
                report.blocked += 1;
                held.insert(entry.entity.clone());
            }
        }
    }

    let missing: Vec<OutboxEntryId> = entries
        .iter()
        .map(|e| e.id)
        .filter(|id| !answered.contains(id))
        .collect();
    if !missing.is_empty() {
        store.mark_failed(&missing, "no result in push response")?;
    }
    Ok(report)
}

/// Bring the local copy in line with a resolved conflict, unless this device
/// already holds a newer version.
fn apply_resolution(
    store: &mut SqliteClientStore,
    conflict: &ConflictRecord,
) -> Result<(), EngineError> {
    let (Some(payload), Some(version)) = (&conflict.resolved_payload, conflict.resolved_version)
    else {
        return Ok(());
    };
    if version < store.server_version(&conflict.entity)? {
        return Ok(());
    }
    let deleted =
        conflict.status == ConflictStatus::ClientWins && conflict.operation == Operation::Delete;
    store.put_server_state(&conflict.entity, payload, version, deleted)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_core::{DeviceId, SyncVersion};
    use fieldsync_storage::OutboxStatus;

    fn entry(seq: i64, entity_id: &str) -> OutboxEntry {
        OutboxEntry {
            id: OutboxEntryId::new(),
            seq,
            entity: EntityRef::new("installation", entity_id),
            operation: Operation::Update,
            payload: DeltaPayload::null(),
            timestamp: 0,
            device_id: DeviceId::new(),
            base_version: SyncVersion::new(seq as u64),
            target_version: SyncVersion::new(seq as u64 + 1),
            retry_count: 0,
            status: OutboxStatus::Pending,
            last_error: None,
            rejected: false,
        }
    }

    fn seqs(entries: &[OutboxEntry]) -> Vec<i64> {
        entries.iter().map(|e| e.seq).collect()
    }

    #[test]
    fn selection_keeps_entity_chains_together() {
        let entries = vec![entry(1, "a"), entry(2, "b"), entry(3, "a"), entry(4, "c")];
        let (selected, deferred) = select_batch(entries, 2);
        // "a" has two entries and fills the batch; "b" and "c" wait.
        assert_eq!(seqs(&selected), vec![1, 3]);
        assert_eq!(deferred, 2);
    }

    #[test]
    fn selection_skips_a_group_that_does_not_fit() {
        let entries = vec![entry(1, "a"), entry(2, "b"), entry(3, "b"), entry(4, "c")];
        let (selected, deferred) = select_batch(entries, 2);
        assert_eq!(seqs(&selected), vec![1, 4]);
        assert_eq!(deferred, 2);
    }

    #[test]
    fn oversized_chain_goes_alone() {
        let entries = vec![entry(1, "a"), entry(2, "a"), entry(3, "a"), entry(4, "b")];
        let (selected, deferred) = select_batch(entries, 2);
        assert_eq!(seqs(&selected), vec![1, 2, 3]);
        assert_eq!(deferred, 1);
    }

    #[test]
    fn delta_reuses_entry_id_and_versions() {
        let e = entry(7, "a");
        let delta = delta_for(&e);
        assert_eq!(delta.id, DeltaId::from(e.id));
        assert_eq!(delta.from_version, SyncVersion::new(7));
        assert!(delta.steps_by_one());
    }

    #[test]
    fn retry_stops_at_non_retryable_errors() {
        let retry = RetryConfig::new(5).with_initial_delay(std::time::Duration::ZERO);
        let mut calls = 0;
        let result: Result<(), _> = with_retry(&retry, "test", || {
            calls += 1;
            Err(EngineError::InvalidRequest("bad".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);

        let mut calls = 0;
        let result = with_retry(&retry, "test", || {
            calls += 1;
            if calls < 3 {
                Err(crate::error::TransportError::Timeout("slow".into()).into())
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let handle = flag.clone();
        assert!(flag.check().is_ok());
        handle.cancel();
        assert!(matches!(flag.check(), Err(EngineError::Cancelled)));
        flag.reset();
        assert!(!handle.is_cancelled());
    }
}
