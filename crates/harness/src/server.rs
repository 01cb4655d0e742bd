use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use fieldsync_core::{EntityRef, SyncVersion};
use fieldsync_engine::{EngineError, ServerConfig, SyncService};
use fieldsync_storage::{Ledger, LedgerEntry};
use tempfile::TempDir;

/// A sync server backed by a SQLite file in a temporary directory.
///
/// The service sits behind a mutex so several loopback transports can share
/// it; [`TestServer::open_service`] opens independent connections to the same
/// file for tests that race real writers.
pub struct TestServer {
    service: Arc<Mutex<SyncService>>,
    config: ServerConfig,
    path: PathBuf,
    _dir: TempDir,
}

impl TestServer {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        Self::with_config(ServerConfig::default())
    }

    pub fn with_config(config: ServerConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("server.db");
        let service = SyncService::open(&path, config.clone())?;
        Ok(Self {
            service: Arc::new(Mutex::new(service)),
            config,
            path,
            _dir: dir,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn shared(&self) -> Arc<Mutex<SyncService>> {
        Arc::clone(&self.service)
    }

    pub fn service(&self) -> MutexGuard<'_, SyncService> {
        self.service.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A separate service with its own connection to the same database.
    pub fn open_service(&self) -> Result<SyncService, EngineError> {
        SyncService::open(&self.path, self.config.clone())
    }

    pub fn ledger_entry(&self, entity: &EntityRef) -> Result<Option<LedgerEntry>, EngineError> {
        Ok(self.service().store().get_entry(entity)?)
    }

    pub fn ledger_version(&self, entity: &EntityRef) -> Result<SyncVersion, EngineError> {
        Ok(self.service().store().get_current_version(entity)?)
    }

    /// Number of rows in the ledger.
    pub fn ledger_len(&self) -> Result<u64, EngineError> {
        let service = self.service();
        let count: i64 = service
            .store()
            .conn()
            .query_row("SELECT COUNT(*) FROM entity_versions", [], |row| row.get(0))
            .map_err(|e| EngineError::Storage(e.into()))?;
        Ok(count as u64)
    }
}
