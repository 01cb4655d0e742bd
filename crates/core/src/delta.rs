use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoreError;
use crate::ids::{DeltaId, EntityRef};
use crate::payload::DeltaPayload;
use crate::version::SyncVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    /// String name for storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(CoreError::InvalidData(format!("unknown operation '{other}'"))),
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Self::Create => 1,
            Self::Update => 2,
            Self::Delete => 3,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One proposed change to one entity, from a known prior version to the next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncDelta {
    pub id: DeltaId,
    pub entity: EntityRef,
    pub operation: Operation,
    pub from_version: SyncVersion,
    pub to_version: SyncVersion,
    pub payload: DeltaPayload,
    /// Client wall clock (ms since epoch) when the mutation was made.
    pub timestamp: i64,
}

impl SyncDelta {
    /// Build a delta stepping `from_version` by one, under a fresh id.
    pub fn new(
        entity: EntityRef,
        operation: Operation,
        from_version: SyncVersion,
        payload: DeltaPayload,
        timestamp: i64,
    ) -> Result<Self, CoreError> {
        Ok(Self {
            id: DeltaId::new(),
            entity,
            operation,
            from_version,
            to_version: from_version.next()?,
            payload,
            timestamp,
        })
    }

    pub fn with_id(mut self, id: DeltaId) -> Self {
        self.id = id;
        self
    }

    pub fn steps_by_one(&self) -> bool {
        self.from_version.next().is_ok_and(|v| v == self.to_version)
    }

    fn fingerprint_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(64 + self.payload.len());
        bytes.extend_from_slice(self.id.as_bytes());
        for part in [&self.entity.entity_type, &self.entity.entity_id] {
            bytes.extend_from_slice(&(part.len() as u64).to_be_bytes());
            bytes.extend_from_slice(part.as_bytes());
        }
        bytes.push(self.operation.tag());
        bytes.extend_from_slice(&self.from_version.get().to_be_bytes());
        bytes.extend_from_slice(&self.to_version.get().to_be_bytes());
        bytes.extend_from_slice(self.payload.as_str().as_bytes());
        bytes
    }

    /// blake3 over the content that identifies this delta. The client
    /// timestamp is left out so a re-sent delta keeps its fingerprint.
    pub fn fingerprint(&self) -> [u8; 32] {
        *blake3::hash(&self.fingerprint_bytes()).as_bytes()
    }
}
