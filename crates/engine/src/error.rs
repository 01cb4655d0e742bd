use fieldsync_core::CoreError;
use fieldsync_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("conflict not found: {0}")]
    ConflictNotFound(String),

    #[error("conflict already resolved: {0}")]
    ConflictAlreadyResolved(String),

    #[error("merged resolution needs a payload: {0}")]
    MissingMergedPayload(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("no direct-write handler for entity type: {0}")]
    UnknownEntityType(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("sync cancelled")]
    Cancelled,

    #[error("codec error: {0}")]
    Codec(String),
}

impl EngineError {
    /// Errors caused by the request itself; resending it unchanged cannot succeed.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidRequest(_)
                | Self::ConflictNotFound(_)
                | Self::ConflictAlreadyResolved(_)
                | Self::MissingMergedPayload(_)
                | Self::InvalidPayload(_)
                | Self::UnknownEntityType(_)
        )
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(t) => t.is_retryable(),
            Self::Storage(s) => s.is_busy(),
            _ => false,
        }
    }
}

/// Failures between a device and the server.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("server unavailable: {0}")]
    Unavailable(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("codec error: {0}")]
    Codec(String),
}

impl TransportError {
    /// Whether resending the same request may succeed. A timeout is ambiguous:
    /// the server may already have applied the request, which is safe because
    /// pushes are idempotent per delta id.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_) | Self::Server(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_retry_classification() {
        assert!(TransportError::Timeout("push".into()).is_retryable());
        assert!(TransportError::Unavailable("offline".into()).is_retryable());
        assert!(TransportError::Server("busy".into()).is_retryable());
        assert!(!TransportError::Codec("truncated".into()).is_retryable());
    }

    #[test]
    fn engine_error_classification() {
        let err: EngineError = TransportError::Timeout("push".into()).into();
        assert!(err.is_retryable());
        assert!(!err.is_client_error());

        let err = EngineError::ConflictAlreadyResolved("c1".into());
        assert!(err.is_client_error());
        assert!(!err.is_retryable());
        assert!(!EngineError::Cancelled.is_retryable());
    }
}
