use fieldsync_core::{DeltaPayload, DeviceId, EntityRef, Operation, SyncVersion};
use fieldsync_engine::{ClientConfig, EngineError, SyncManager};
use fieldsync_storage::{
    LocalEntity, LocalEntityStore, OutboxCounts, OutboxEntry, OutboxStore, SqliteClientStore,
};

use crate::network::{FaultPlan, LoopbackTransport};

/// A device with its own local database, syncing over a loopback transport.
pub struct TestDevice {
    pub manager: SyncManager<LoopbackTransport>,
}

impl TestDevice {
    pub fn new(store: SqliteClientStore, transport: LoopbackTransport, config: ClientConfig) -> Self {
        Self {
            manager: SyncManager::new(store, transport, config),
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.manager.config().device_id
    }

    pub fn faults(&self) -> &FaultPlan {
        self.manager.transport().faults()
    }

    /// Write a JSON value locally under `entity_type/entity_id`.
    pub fn write(
        &mut self,
        entity_type: &str,
        entity_id: &str,
        operation: Operation,
        value: serde_json::Value,
    ) -> Result<OutboxEntry, EngineError> {
        let payload = DeltaPayload::from_value(&value)?;
        self.manager
            .write_local(EntityRef::new(entity_type, entity_id), operation, payload)
    }

    pub fn create(
        &mut self,
        entity_type: &str,
        entity_id: &str,
        value: serde_json::Value,
    ) -> Result<OutboxEntry, EngineError> {
        self.write(entity_type, entity_id, Operation::Create, value)
    }

    pub fn update(
        &mut self,
        entity_type: &str,
        entity_id: &str,
        value: serde_json::Value,
    ) -> Result<OutboxEntry, EngineError> {
        self.write(entity_type, entity_id, Operation::Update, value)
    }

    pub fn local(&self, entity_type: &str, entity_id: &str) -> Result<Option<LocalEntity>, EngineError> {
        Ok(self
            .manager
            .store()
            .get_local(&EntityRef::new(entity_type, entity_id))?)
    }

    /// The local payload parsed back to JSON.
    pub fn local_value(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<serde_json::Value>, EngineError> {
        match self.local(entity_type, entity_id)?.and_then(|l| l.payload) {
            Some(payload) => Ok(Some(payload.to_value()?)),
            None => Ok(None),
        }
    }

    pub fn server_version(&self, entity_type: &str, entity_id: &str) -> Result<SyncVersion, EngineError> {
        Ok(self
            .manager
            .store()
            .server_version(&EntityRef::new(entity_type, entity_id))?)
    }

    pub fn outbox(&self) -> Result<OutboxCounts, EngineError> {
        Ok(self.manager.store().count_by_status()?)
    }

    pub fn unsynced(&self) -> Result<Vec<OutboxEntry>, EngineError> {
        Ok(self.manager.store().get_unsynced()?)
    }
}
