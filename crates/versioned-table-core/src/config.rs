//! Engine configuration.
//!
//! [`EngineConfig`] groups the budgets and timeouts used by the schema
//! manager, index builder, query engine, transaction manager and query cache.
//! Every field has a default so a partial JSON document is enough:
//!
//! ```json
//! { "max_columns_per_table": 100, "cache_ttl": 60 }
//! ```
//!
//! Durations are expressed as whole seconds.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::error::{EngineResult, SerializationSnafu};

/// Operational mode of the deployment hosting the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StackStatus {
    /// Reads and writes are allowed.
    ReadWrite,
    /// Maintenance mode: every write path is rejected.
    ReadOnly,
    /// Nothing is served.
    Down,
}

impl fmt::Display for StackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StackStatus::ReadWrite => "READ_WRITE",
            StackStatus::ReadOnly => "READ_ONLY",
            StackStatus::Down => "DOWN",
        };
        f.write_str(s)
    }
}

/// Budgets, limits and timeouts for the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum weighted bytes of a single row.
    pub max_bytes_per_row: u64,
    /// Maximum number of columns bound to a table.
    pub max_columns_per_table: usize,
    /// Maximum number of secondary indices on a physical index table.
    pub max_index_count: usize,
    /// Byte budget of one page of query results.
    pub max_bytes_per_request: u64,
    /// Size applied to string columns that do not declare one.
    pub default_max_string_size: u64,
    /// Memory available to a query worker, used to derive the large-text cap.
    pub available_memory_bytes: u64,
    /// Fraction of `available_memory_bytes` that large-text columns may use.
    pub large_text_memory_fraction: f64,
    /// Worst-case bytes of a single large-text cell.
    pub large_text_cell_bytes: u64,
    /// Maximum number of change records a table may accumulate.
    pub max_versions_per_table: u64,
    /// Timeout for the exclusive table lock.
    #[serde(with = "duration_secs")]
    pub exclusive_lock_timeout: Duration,
    /// Timeout for the shared (read) table lock.
    #[serde(with = "duration_secs")]
    pub read_lock_timeout: Duration,
    /// Lifetime of a cached query result.
    #[serde(with = "duration_secs")]
    pub cache_ttl: Duration,
    /// Cap on the number of values returned by a value-count facet.
    pub facet_value_limit: u64,
    /// A table still processing after this long is restarted.
    #[serde(with = "duration_secs")]
    pub table_processing_timeout: Duration,
    /// Operational mode.
    pub stack_status: StackStatus,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_bytes_per_row: 64_000,
            max_columns_per_table: 152,
            max_index_count: 60,
            max_bytes_per_request: 1024 * 1024,
            default_max_string_size: 1000,
            available_memory_bytes: 512 * 1024 * 1024,
            large_text_memory_fraction: 0.1,
            large_text_cell_bytes: 1024 * 1024,
            max_versions_per_table: 30_000,
            exclusive_lock_timeout: Duration::from_secs(5),
            read_lock_timeout: Duration::from_secs(60),
            cache_ttl: Duration::from_secs(300),
            facet_value_limit: 100,
            table_processing_timeout: Duration::from_secs(600),
            stack_status: StackStatus::ReadWrite,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> EngineResult<Self> {
        serde_json::from_str(json).context(SerializationSnafu {
            what: "engine configuration",
        })
    }

    /// Maximum number of large-text columns a schema may carry.
    ///
    /// Derived from the memory budget rather than fixed: the large-text share
    /// of available memory divided by the worst-case size of one cell.
    pub fn max_large_text_columns(&self) -> usize {
        if self.large_text_cell_bytes == 0 {
            return usize::MAX;
        }
        let budget = (self.available_memory_bytes as f64 * self.large_text_memory_fraction).floor();
        (budget as u64 / self.large_text_cell_bytes) as usize
    }

    /// True when writes are currently accepted.
    pub fn is_writable(&self) -> bool {
        self.stack_status == StackStatus::ReadWrite
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
