//! How a device reaches the sync service.

use fieldsync_core::{BatchId, ConflictId, DeltaPayload};
use fieldsync_storage::{ConflictRecord, ResolutionStrategy};

use crate::error::{EngineError, TransportError};
use crate::protocol::{
    BatchSummary, ListConflictsRequest, PullRequest, PullResponse, PushRequest, PushResponse,
    Request, ResolveConflictRequest, ResolveConflictResponse, Response,
};

/// A request/response channel to the sync service.
///
/// Implementors only provide [`exchange`](Self::exchange); the typed calls
/// unwrap the matching response variant and turn [`Response::Error`] back into
/// an [`EngineError`].
pub trait SyncTransport: Send {
    fn exchange(&self, request: &Request) -> Result<Response, EngineError>;

    fn push(&self, request: &PushRequest) -> Result<PushResponse, EngineError> {
        match self.exchange(&Request::Push(request.clone()))? {
            Response::Push(response) => Ok(response),
            other => Err(unexpected("push", other)),
        }
    }

    fn pull(&self, request: &PullRequest) -> Result<PullResponse, EngineError> {
        match self.exchange(&Request::Pull(request.clone()))? {
            Response::Pull(response) => Ok(response),
            other => Err(unexpected("pull", other)),
        }
    }

    fn list_conflicts(
        &self,
        request: &ListConflictsRequest,
    ) -> Result<Vec<ConflictRecord>, EngineError> {
        match self.exchange(&Request::ListConflicts(request.clone()))? {
            Response::ListConflicts(conflicts) => Ok(conflicts),
            other => Err(unexpected("list_conflicts", other)),
        }
    }

    fn resolve_conflict(
        &self,
        conflict_id: ConflictId,
        strategy: ResolutionStrategy,
        merged_payload: Option<DeltaPayload>,
    ) -> Result<ResolveConflictResponse, EngineError> {
        let request = Request::ResolveConflict(ResolveConflictRequest {
            conflict_id,
            strategy,
            merged_payload,
        });
        match self.exchange(&request)? {
            Response::ResolveConflict(response) => Ok(response),
            other => Err(unexpected("resolve_conflict", other)),
        }
    }

    fn get_batch(&self, batch_id: BatchId) -> Result<Option<BatchSummary>, EngineError> {
        match self.exchange(&Request::GetBatch { batch_id })? {
            Response::GetBatch(summary) => Ok(summary),
            other => Err(unexpected("get_batch", other)),
        }
    }
}

fn unexpected(call: &str, response: Response) -> EngineError {
    match response {
        Response::Error(err) => err.into(),
        other => TransportError::Codec(format!(
            "{call}: unexpected response variant {}",
            variant_name(&other)
        ))
        .into(),
    }
}

fn variant_name(response: &Response) -> &'static str {
    match response {
        Response::Push(_) => "push",
        Response::Pull(_) => "pull",
        Response::ListConflicts(_) => "list_conflicts",
        Response::ResolveConflict(_) => "resolve_conflict",
        Response::GetBatch(_) => "get_batch",
        Response::Error(_) => "error",
    }
}
