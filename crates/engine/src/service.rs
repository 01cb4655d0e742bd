use std::path::Path;

use fieldsync_core::{BatchId, ConflictId, DeltaPayload, DeviceId};
use fieldsync_storage::{
    BatchStore, ConflictRecord, ConflictStatus, ConflictStore, DeltaOutcome, Ledger,
    ResolutionStrategy, SqliteServerStore, StorageError,
};

use crate::batch::SyncBatch;
use crate::config::ServerConfig;
use crate::error::EngineError;
use crate::protocol::{
    BatchSummary, DeltaResult, DeltaStatus, PullRequest, PullResponse, PushRequest, PushResponse,
    Request, ResolveConflictRequest, ResolveConflictResponse, Response, WireError, WireMessage,
};
use crate::resolve::resolve;

/// The server boundary. Each push and each resolution runs in one
/// `BEGIN IMMEDIATE` transaction, so concurrent writers against the same
/// database file serialize on SQLite's write lock.
pub struct SyncService {
    store: SqliteServerStore,
    config: ServerConfig,
}

impl SyncService {
    pub fn new(store: SqliteServerStore, config: ServerConfig) -> Self {
        Self { store, config }
    }

    pub fn open(path: impl AsRef<Path>, config: ServerConfig) -> Result<Self, EngineError> {
        Ok(Self::new(SqliteServerStore::open(path)?, config))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn store(&self) -> &SqliteServerStore {
        &self.store
    }

    /// Execute a batch SQL statement on the underlying connection, mapping errors.
    fn exec_batch(&self, sql: &str) -> Result<(), EngineError> {
        self.store
            .conn()
            .execute_batch(sql)
            .map_err(|e| EngineError::Storage(StorageError::Sqlite(e)))
    }

    // ========================================================================
    // Push
    // ========================================================================

    pub fn push_batch(&mut self, request: PushRequest) -> Result<PushResponse, EngineError> {
        if request.deltas.len() > self.config.max_push_batch as usize {
            return Err(EngineError::InvalidRequest(format!(
                "batch has {} deltas, limit is {}",
                request.deltas.len(),
                self.config.max_push_batch
            )));
        }

        let mut batch = SyncBatch::new(request.batch_id, request.device_id, request.deltas);

        self.exec_batch("BEGIN IMMEDIATE")?;

        let result = (|| -> Result<(), EngineError> {
            batch.apply(&mut self.store, &self.config)
        })();

        match result {
            Ok(()) => {
                self.exec_batch("COMMIT")?;
            }
            Err(e) => {
                let _ = self.exec_batch("ROLLBACK");
                return Err(e);
            }
        }

        tracing::info!(
            batch_id = %batch.id,
            device = %batch.device_id,
            status = batch.status.as_str(),
            applied = batch.applied_count(),
            conflicts = batch.conflict_count(),
            rejected = batch.rejected_count(),
            blocked = batch.blocked_count(),
            "batch processed"
        );
        Ok(batch.into_response())
    }

    // ========================================================================
    // Pull
    // ========================================================================

    pub fn pull_changes(&self, request: &PullRequest) -> Result<PullResponse, EngineError> {
        let limit = self.config.clamp_pull_limit(request.limit);
        let page = self
            .store
            .get_changed_since(request.since, request.cursor.as_ref(), limit)?;
        tracing::info!(
            entries = page.entries.len(),
            has_more = page.has_more,
            limit,
            "pull page served"
        );
        Ok(PullResponse {
            entries: page.entries,
            next_cursor: page.next_cursor,
            has_more: page.has_more,
        })
    }

    // ========================================================================
    // Conflicts
    // ========================================================================

    pub fn list_conflicts(
        &self,
        device_id: Option<DeviceId>,
        status: Option<ConflictStatus>,
    ) -> Result<Vec<ConflictRecord>, EngineError> {
        Ok(self.store.list_conflicts(device_id, status)?)
    }

    pub fn get_conflict(&self, conflict_id: ConflictId) -> Result<Option<ConflictRecord>, EngineError> {
        Ok(self.store.get_conflict(conflict_id)?)
    }

    pub fn resolve_conflict(
        &mut self,
        conflict_id: ConflictId,
        strategy: ResolutionStrategy,
        merged_payload: Option<DeltaPayload>,
    ) -> Result<ResolveConflictResponse, EngineError> {
        self.exec_batch("BEGIN IMMEDIATE")?;

        let result = (|| -> Result<ResolveConflictResponse, EngineError> {
            resolve(
                &mut self.store,
                &self.config,
                conflict_id,
                strategy,
                merged_payload,
            )
        })();

        match result {
            Ok(response) => {
                self.exec_batch("COMMIT")?;
                Ok(response)
            }
            Err(e) => {
                let _ = self.exec_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    // ========================================================================
    // Batches
    // ========================================================================

    pub fn get_batch(&self, batch_id: BatchId) -> Result<Option<BatchSummary>, EngineError> {
        let Some(batch) = self.store.get_batch(batch_id)? else {
            return Ok(None);
        };
        let results = self
            .store
            .list_delta_outcomes(batch_id)?
            .into_iter()
            .map(|r| DeltaResult {
                delta_id: r.delta_id,
                status: match r.outcome {
                    DeltaOutcome::Applied => DeltaStatus::Applied,
                    DeltaOutcome::Conflict { conflict_id } => DeltaStatus::Conflict { conflict_id },
                },
            })
            .collect();
        let conflicts = self.store.list_conflicts_for_batch(batch_id)?;
        Ok(Some(BatchSummary {
            batch,
            results,
            conflicts,
        }))
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Serve one request. Failures become [`Response::Error`].
    pub fn handle(&mut self, request: Request) -> Response {
        let result = match request {
            Request::Push(push) => self.push_batch(push).map(Response::Push),
            Request::Pull(pull) => self.pull_changes(&pull).map(Response::Pull),
            Request::ListConflicts(list) => self
                .list_conflicts(list.device_id, list.status)
                .map(Response::ListConflicts),
            Request::ResolveConflict(ResolveConflictRequest {
                conflict_id,
                strategy,
                merged_payload,
            }) => self
                .resolve_conflict(conflict_id, strategy, merged_payload)
                .map(Response::ResolveConflict),
            Request::GetBatch { batch_id } => self.get_batch(batch_id).map(Response::GetBatch),
        };
        result.unwrap_or_else(|e| {
            if !e.is_client_error() {
                tracing::warn!(error = %e, "request failed");
            }
            Response::Error(WireError::from(&e))
        })
    }

    /// Serve one MessagePack-encoded request and encode the reply.
    pub fn handle_bytes(&mut self, bytes: &[u8]) -> Result<Vec<u8>, EngineError> {
        let response = match Request::from_msgpack(bytes) {
            Ok(request) => self.handle(request),
            Err(e) => Response::Error(WireError::from(&EngineError::InvalidRequest(e.to_string()))),
        };
        response.to_msgpack()
    }
}
