pub mod batch;
pub mod client;
pub mod config;
pub mod direct_write;
pub mod error;
pub mod protocol;
pub mod resolve;
pub mod service;
pub mod transport;
pub mod validate;

pub use batch::{ServerStore, SyncBatch};
pub use client::{CancelFlag, PullReport, PushReport, SyncManager, SyncReport};
pub use config::{ClientConfig, RetryConfig, ServerConfig};
pub use direct_write::{DirectWriteHandler, DirectWriteRegistry, StoreEntityHandler};
pub use error::{EngineError, TransportError};
pub use protocol::{
    BatchSummary, DeltaResult, DeltaStatus, ErrorCode, ListConflictsRequest, PullRequest,
    PullResponse, PushRequest, PushResponse, Request, ResolveConflictRequest,
    ResolveConflictResponse, Response, WireError, WireMessage,
};
pub use service::SyncService;
pub use transport::SyncTransport;
pub use validate::Rejection;
