//! Table identity with an optional snapshot version.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// A table or view id plus an optional immutable snapshot version.
///
/// A missing version means "the current, mutable state".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdAndVersion {
    /// Numeric object id.
    pub id: u64,
    /// Snapshot version, or `None` for the current state.
    pub version: Option<u64>,
}

impl IdAndVersion {
    /// Reference the current state of `id`.
    pub fn current(id: u64) -> Self {
        Self { id, version: None }
    }

    /// Reference snapshot `version` of `id`.
    pub fn versioned(id: u64, version: u64) -> Self {
        Self {
            id,
            version: Some(version),
        }
    }

    /// True when no snapshot version is attached.
    pub fn is_current(&self) -> bool {
        self.version.is_none()
    }

    /// The same id without its version.
    pub fn as_current(&self) -> Self {
        Self::current(self.id)
    }

    /// Name of the physical index table, `T<id>` or `T<id>_<version>`.
    pub fn index_table_name(&self) -> String {
        match self.version {
            Some(v) => format!("T{}_{}", self.id, v),
            None => format!("T{}", self.id),
        }
    }

    /// Name of the secondary table unnesting list column `column_id`.
    pub fn list_index_table_name(&self, column_id: u64) -> String {
        format!("{}_INDEX_C{}_", self.index_table_name(), column_id)
    }

    /// Name of the temporary copy used to validate schema changes.
    pub fn temp_table_name(&self) -> String {
        format!("TEMP{}", self.index_table_name())
    }

    /// Key used for table-scoped locks.
    pub fn lock_key(&self) -> String {
        format!("TABLE-LOCK-{}", self.index_table_name())
    }

    /// Key serializing writers of the table's change log.
    pub fn write_lock_key(&self) -> String {
        format!("TABLE-WRITE-LOCK-{}", self.index_table_name())
    }
}

impl fmt::Display for IdAndVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.version {
            Some(v) => write!(f, "syn{}.{}", self.id, v),
            None => write!(f, "syn{}", self.id),
        }
    }
}

impl FromStr for IdAndVersion {
    type Err = EngineError;

    /// Accepts `123`, `syn123` and `syn123.4` (prefix is case-insensitive).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let body = match trimmed.get(..3) {
            Some(prefix) if prefix.eq_ignore_ascii_case("syn") => &trimmed[3..],
            _ => trimmed,
        };
        let invalid = || EngineError::invalid_argument(format!("Invalid table identifier: '{s}'"));

        let (id, version) = match body.split_once('.') {
            Some((id, version)) => (id, Some(version)),
            None => (body, None),
        };
        let id = id.parse::<u64>().map_err(|_| invalid())?;
        let version = version
            .map(|v| v.parse::<u64>().map_err(|_| invalid()))
            .transpose()?;
        Ok(Self { id, version })
    }
}
