//! Applying pulled ledger entries to local storage.
//!
//! Pulled changes go straight to the local store through a handler registered
//! for the entity type. They never pass through the outbox, so applying them
//! cannot produce deltas that would be pushed back to the server.

use std::collections::HashMap;

use fieldsync_core::Operation;
use fieldsync_storage::{LedgerEntry, LocalEntityStore};

use crate::error::EngineError;

pub trait DirectWriteHandler: Send {
    fn apply(&self, store: &mut dyn LocalEntityStore, entry: &LedgerEntry)
        -> Result<(), EngineError>;
}

/// Copies the ledger state verbatim into `local_entities`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreEntityHandler;

impl DirectWriteHandler for StoreEntityHandler {
    fn apply(
        &self,
        store: &mut dyn LocalEntityStore,
        entry: &LedgerEntry,
    ) -> Result<(), EngineError> {
        store.put_server_state(
            &entry.entity,
            &entry.payload,
            entry.version,
            entry.last_operation == Operation::Delete,
        )?;
        Ok(())
    }
}

/// Handlers keyed by entity type.
#[derive(Default)]
pub struct DirectWriteRegistry {
    handlers: HashMap<String, Box<dyn DirectWriteHandler>>,
    fallback: Option<Box<dyn DirectWriteHandler>>,
}

impl DirectWriteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that stores every entity type with [`StoreEntityHandler`].
    pub fn store_all() -> Self {
        Self::new().with_fallback(StoreEntityHandler)
    }

    pub fn register(
        &mut self,
        entity_type: impl Into<String>,
        handler: impl DirectWriteHandler + 'static,
    ) -> &mut Self {
        self.handlers.insert(entity_type.into(), Box::new(handler));
        self
    }

    /// Handler for types without a registration of their own.
    pub fn with_fallback(mut self, handler: impl DirectWriteHandler + 'static) -> Self {
        self.fallback = Some(Box::new(handler));
        self
    }

    pub fn handles(&self, entity_type: &str) -> bool {
        self.fallback.is_some() || self.handlers.contains_key(entity_type)
    }

    pub fn apply(
        &self,
        store: &mut dyn LocalEntityStore,
        entry: &LedgerEntry,
    ) -> Result<(), EngineError> {
        let handler = self
            .handlers
            .get(&entry.entity.entity_type)
            .or(self.fallback.as_ref())
            .ok_or_else(|| EngineError::UnknownEntityType(entry.entity.entity_type.clone()))?;
        handler.apply(store, entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use fieldsync_core::{DeltaPayload, DeviceId, EntityRef, Hlc, SyncVersion};
    use fieldsync_storage::SqliteClientStore;

    fn entry(entity_type: &str, operation: Operation) -> LedgerEntry {
        LedgerEntry {
            entity: EntityRef::new(entity_type, "e1"),
            version: SyncVersion::new(4),
            payload: DeltaPayload::parse(r#"{"v":4}"#).unwrap(),
            last_modified: Hlc::new(10, 0),
            last_device_id: DeviceId::new(),
            last_operation: operation,
        }
    }

    struct Recording(Arc<Mutex<Vec<String>>>);

    impl DirectWriteHandler for Recording {
        fn apply(
            &self,
            _store: &mut dyn LocalEntityStore,
            entry: &LedgerEntry,
        ) -> Result<(), EngineError> {
            self.0.lock().unwrap().push(entry.entity.to_string());
            Ok(())
        }
    }

    #[test]
    fn store_handler_writes_server_state() {
        let mut store = SqliteClientStore::open_in_memory().unwrap();
        let registry = DirectWriteRegistry::store_all();

        registry.apply(&mut store, &entry("photo", Operation::Update)).unwrap();
        let local = store.get_local(&EntityRef::new("photo", "e1")).unwrap().unwrap();
        assert_eq!(local.server_version, SyncVersion::new(4));
        assert!(!local.deleted);

        registry.apply(&mut store, &entry("photo", Operation::Delete)).unwrap();
        let local = store.get_local(&EntityRef::new("photo", "e1")).unwrap().unwrap();
        assert!(local.deleted);
    }

    #[test]
    fn registered_handler_takes_precedence() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = DirectWriteRegistry::store_all();
        registry.register("installation", Recording(seen.clone()));

        let mut store = SqliteClientStore::open_in_memory().unwrap();
        registry
            .apply(&mut store, &entry("installation", Operation::Create))
            .unwrap();

        assert_eq!(seen.lock().unwrap().as_slice(), ["installation/e1"]);
        assert!(store
            .get_local(&EntityRef::new("installation", "e1"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn unknown_type_without_fallback_is_an_error() {
        let registry = DirectWriteRegistry::new();
        let mut store = SqliteClientStore::open_in_memory().unwrap();
        let err = registry
            .apply(&mut store, &entry("measurement", Operation::Create))
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownEntityType(t) if t == "measurement"));
        assert!(!registry.handles("measurement"));
    }
}
