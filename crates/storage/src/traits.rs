use serde::{Deserialize, Serialize};

use fieldsync_core::{
    BatchId, ConflictId, DeltaId, DeltaPayload, DeviceId, EntityRef, Hlc, Operation,
    OutboxEntryId, SyncVersion,
};

use crate::error::StorageError;

// ============================================================================
// Status enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Applied,
    PartialConflict,
    Conflict,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Applied => "applied",
            Self::PartialConflict => "partial_conflict",
            Self::Conflict => "conflict",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StorageError> {
        match s {
            "pending" => Ok(Self::Pending),
            "applied" => Ok(Self::Applied),
            "partial_conflict" => Ok(Self::PartialConflict),
            "conflict" => Ok(Self::Conflict),
            _ => Err(StorageError::Serialization(format!("unknown batch status: {s}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Unresolved,
    ClientWins,
    ServerWins,
    Merged,
    /// The ledger moved again before the resolution landed; see `superseded_by`.
    Superseded,
}

impl ConflictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unresolved => "unresolved",
            Self::ClientWins => "client_wins",
            Self::ServerWins => "server_wins",
            Self::Merged => "merged",
            Self::Superseded => "superseded",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StorageError> {
        match s {
            "unresolved" => Ok(Self::Unresolved),
            "client_wins" => Ok(Self::ClientWins),
            "server_wins" => Ok(Self::ServerWins),
            "merged" => Ok(Self::Merged),
            "superseded" => Ok(Self::Superseded),
            _ => Err(StorageError::Serialization(format!("unknown conflict status: {s}"))),
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::ClientWins | Self::ServerWins | Self::Merged)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    ClientWins,
    ServerWins,
    Merged,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        self.status().as_str()
    }

    /// Terminal status a successful resolution leaves behind.
    pub fn status(&self) -> ConflictStatus {
        match self {
            Self::ClientWins => ConflictStatus::ClientWins,
            Self::ServerWins => ConflictStatus::ServerWins,
            Self::Merged => ConflictStatus::Merged,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Syncing,
    Synced,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StorageError> {
        match s {
            "pending" => Ok(Self::Pending),
            "syncing" => Ok(Self::Syncing),
            "synced" => Ok(Self::Synced),
            "failed" => Ok(Self::Failed),
            _ => Err(StorageError::Serialization(format!("unknown outbox status: {s}"))),
        }
    }
}

// ============================================================================
// Server records
// ============================================================================

/// One ledger row: the authoritative state of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub entity: EntityRef,
    pub version: SyncVersion,
    pub payload: DeltaPayload,
    pub last_modified: Hlc,
    pub last_device_id: DeviceId,
    pub last_operation: Operation,
}

/// Keyset position in the `(last_modified, entity_type, entity_id)` order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PullCursor {
    pub last_modified: Hlc,
    pub entity_type: String,
    pub entity_id: String,
}

impl PullCursor {
    pub fn after(entry: &LedgerEntry) -> Self {
        Self {
            last_modified: entry.last_modified,
            entity_type: entry.entity.entity_type.clone(),
            entity_id: entry.entity.entity_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerPage {
    pub entries: Vec<LedgerEntry>,
    /// Position of the last entry returned; `None` on an empty page.
    pub next_cursor: Option<PullCursor>,
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub batch_id: BatchId,
    pub device_id: DeviceId,
    pub created_at: i64,
    pub status: BatchStatus,
    pub delta_count: u32,
    pub applied_count: u32,
    pub conflict_count: u32,
    pub rejected_count: u32,
}

/// Persisted outcome of a delta, keyed by delta id. Rejected deltas never get one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaOutcome {
    Applied,
    Conflict { conflict_id: ConflictId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedDeltaRecord {
    pub delta_id: DeltaId,
    pub batch_id: BatchId,
    pub position: u32,
    pub entity: EntityRef,
    pub fingerprint: [u8; 32],
    pub outcome: DeltaOutcome,
    pub recorded_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub conflict_id: ConflictId,
    pub batch_id: BatchId,
    pub delta_id: DeltaId,
    pub device_id: DeviceId,
    pub entity: EntityRef,
    pub operation: Operation,
    pub client_payload: DeltaPayload,
    /// `None` when the ledger had no row for the entity.
    pub server_payload: Option<DeltaPayload>,
    pub client_version: SyncVersion,
    pub server_version: SyncVersion,
    pub status: ConflictStatus,
    pub resolved_payload: Option<DeltaPayload>,
    pub resolved_version: Option<SyncVersion>,
    pub resolved_at: Option<i64>,
    pub detected_at: i64,
    pub superseded_by: Option<ConflictId>,
}

/// Terminal state written onto a conflict row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictResolution {
    pub status: ConflictStatus,
    pub resolved_payload: Option<DeltaPayload>,
    pub resolved_version: Option<SyncVersion>,
    pub resolved_at: i64,
    pub superseded_by: Option<ConflictId>,
}

// ============================================================================
// Client records
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: OutboxEntryId,
    /// Insertion order; entries are pushed in ascending `seq`.
    pub seq: i64,
    pub entity: EntityRef,
    pub operation: Operation,
    pub payload: DeltaPayload,
    pub timestamp: i64,
    pub device_id: DeviceId,
    pub base_version: SyncVersion,
    pub target_version: SyncVersion,
    pub retry_count: u32,
    pub status: OutboxStatus,
    pub last_error: Option<String>,
    /// The server refused this entry's content. Later edits of the entity do
    /// not chain on it.
    pub rejected: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxCounts {
    pub pending: u64,
    pub syncing: u64,
    pub synced: u64,
    pub failed: u64,
}

impl OutboxCounts {
    pub fn unsynced(&self) -> u64 {
        self.pending + self.syncing + self.failed
    }
}

/// Device-local copy of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalEntity {
    pub entity: EntityRef,
    pub payload: Option<DeltaPayload>,
    /// Last ledger version this device knows; the `from_version` of its next delta.
    pub server_version: SyncVersion,
    pub deleted: bool,
    pub updated_at: i64,
}

// ============================================================================
// Server traits
// ============================================================================

/// Authoritative per-entity version store. Performs no compare-and-swap; the
/// caller reads and writes inside one transaction.
pub trait Ledger {
    fn get_current_version(&self, entity: &EntityRef) -> Result<SyncVersion, StorageError>;

    fn get_current_payload(&self, entity: &EntityRef)
        -> Result<Option<DeltaPayload>, StorageError>;

    fn get_entry(&self, entity: &EntityRef) -> Result<Option<LedgerEntry>, StorageError>;

    /// Unconditional upsert, stamped with a timestamp later than every stored
    /// `last_modified`. Returns that timestamp.
    fn set_version(
        &mut self,
        entity: &EntityRef,
        version: SyncVersion,
        payload: &DeltaPayload,
        device_id: DeviceId,
        operation: Operation,
    ) -> Result<Hlc, StorageError>;

    /// Entries changed after `since`, or after `cursor` when given, in
    /// `(last_modified, entity_type, entity_id)` order.
    fn get_changed_since(
        &self,
        since: Hlc,
        cursor: Option<&PullCursor>,
        limit: u32,
    ) -> Result<LedgerPage, StorageError>;
}

pub trait BatchStore {
    /// Returns false if a batch with this id already exists.
    fn insert_batch(&mut self, record: &BatchRecord) -> Result<bool, StorageError>;

    fn update_batch_summary(&mut self, record: &BatchRecord) -> Result<(), StorageError>;

    fn get_batch(&self, batch_id: BatchId) -> Result<Option<BatchRecord>, StorageError>;

    fn record_delta_outcome(&mut self, record: &AppliedDeltaRecord) -> Result<(), StorageError>;

    fn get_delta_outcome(&self, delta_id: DeltaId)
        -> Result<Option<AppliedDeltaRecord>, StorageError>;

    fn list_delta_outcomes(&self, batch_id: BatchId)
        -> Result<Vec<AppliedDeltaRecord>, StorageError>;
}

pub trait ConflictStore {
    fn insert_conflict(&mut self, record: &ConflictRecord) -> Result<(), StorageError>;

    fn get_conflict(&self, conflict_id: ConflictId)
        -> Result<Option<ConflictRecord>, StorageError>;

    /// Ordered by detection time.
    fn list_conflicts(
        &self,
        device_id: Option<DeviceId>,
        status: Option<ConflictStatus>,
    ) -> Result<Vec<ConflictRecord>, StorageError>;

    fn list_conflicts_for_batch(&self, batch_id: BatchId)
        -> Result<Vec<ConflictRecord>, StorageError>;

    /// Moves an unresolved conflict to a terminal state. Fails with
    /// `ConstraintViolation` if the row is no longer unresolved.
    fn update_conflict_resolution(
        &mut self,
        conflict_id: ConflictId,
        resolution: &ConflictResolution,
    ) -> Result<(), StorageError>;
}

// ============================================================================
// Client traits
// ============================================================================

pub trait OutboxStore {
    /// Append an entry, assigning `base_version`/`target_version` so entries for
    /// one entity chain in enqueue order.
    fn enqueue(
        &mut self,
        entity: &EntityRef,
        operation: Operation,
        payload: &DeltaPayload,
        device_id: DeviceId,
        timestamp: i64,
    ) -> Result<OutboxEntry, StorageError>;

    fn get(&self, id: OutboxEntryId) -> Result<Option<OutboxEntry>, StorageError>;

    fn get_pending(&self) -> Result<Vec<OutboxEntry>, StorageError>;

    fn get_failed(&self) -> Result<Vec<OutboxEntry>, StorageError>;

    /// Every entry not yet synced, oldest first.
    fn get_unsynced(&self) -> Result<Vec<OutboxEntry>, StorageError>;

    fn mark_syncing(&mut self, ids: &[OutboxEntryId]) -> Result<(), StorageError>;

    fn mark_synced(&mut self, ids: &[OutboxEntryId]) -> Result<(), StorageError>;

    /// Increments `retry_count`. Entries are never deleted on failure.
    fn mark_failed(&mut self, ids: &[OutboxEntryId], error: &str) -> Result<(), StorageError>;

    /// Mark an entry failed because the server refused its content. On the
    /// first rejection, unsynced entries chained on it move down one version
    /// so they build on the entry before it. Returns how many moved.
    fn mark_rejected(&mut self, id: OutboxEntryId, reason: &str) -> Result<usize, StorageError>;

    fn count_by_status(&self) -> Result<OutboxCounts, StorageError>;

    /// Delete synced entries last touched before `older_than` (ms since epoch).
    fn purge_synced(&mut self, older_than: i64) -> Result<usize, StorageError>;
}

pub trait SyncMetaStore {
    fn get_meta(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    fn set_meta(&mut self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    fn last_sync_timestamp(&self) -> Result<Option<Hlc>, StorageError>;

    fn pull_cursor(&self) -> Result<Option<PullCursor>, StorageError>;

    /// Store the cursor and its timestamp as `lastSyncTimestamp`.
    fn set_pull_cursor(&mut self, cursor: &PullCursor) -> Result<(), StorageError>;
}

/// Device-local entity state. This is the only surface pulled changes are
/// written through.
pub trait LocalEntityStore {
    fn get_local(&self, entity: &EntityRef) -> Result<Option<LocalEntity>, StorageError>;

    fn list_local(&self, entity_type: &str) -> Result<Vec<LocalEntity>, StorageError>;

    /// Last ledger version known for the entity; `INITIAL` if none.
    fn server_version(&self, entity: &EntityRef) -> Result<SyncVersion, StorageError>;

    /// Overwrite the local copy with server state at `version`.
    fn put_server_state(
        &mut self,
        entity: &EntityRef,
        payload: &DeltaPayload,
        version: SyncVersion,
        deleted: bool,
    ) -> Result<(), StorageError>;

    /// Record a local edit without touching `server_version`.
    fn put_local_edit(
        &mut self,
        entity: &EntityRef,
        payload: &DeltaPayload,
        deleted: bool,
    ) -> Result<(), StorageError>;

    /// Raise `server_version` to `version` if it is lower.
    fn raise_server_version(
        &mut self,
        entity: &EntityRef,
        version: SyncVersion,
    ) -> Result<(), StorageError>;
}
