use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoreError;

/// Per-entity version counter. Compared for equality under optimistic
/// concurrency; only ever increases in the ledger.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SyncVersion(u64);

impl SyncVersion {
    /// Version of an entity the ledger has never seen.
    pub const INITIAL: SyncVersion = SyncVersion(0);

    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Result<Self, CoreError> {
        self.0
            .checked_add(1)
            .map(Self)
            .ok_or_else(|| CoreError::InvalidOperation("version overflow".into()))
    }

    pub fn is_initial(self) -> bool {
        self == Self::INITIAL
    }

    /// SQLite stores integers as i64.
    pub fn to_i64(self) -> Result<i64, CoreError> {
        i64::try_from(self.0)
            .map_err(|_| CoreError::InvalidData(format!("version {} exceeds i64", self.0)))
    }

    pub fn from_i64(v: i64) -> Result<Self, CoreError> {
        u64::try_from(v)
            .map(Self)
            .map_err(|_| CoreError::InvalidData(format!("negative version {v}")))
    }
}

impl From<u64> for SyncVersion {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl fmt::Display for SyncVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}
