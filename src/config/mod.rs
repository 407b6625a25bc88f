//! Database open-time configuration.
//!
//! Options are supplied programmatically to [`Database::open`] and validated
//! there; a recognized-but-invalid combination fails open with a
//! configuration error instead of surfacing later at query time.
//!
//! [`Database::open`]: crate::database::Database::open

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};

/// Storage location denoting a non-persistent instance.
pub const IN_MEMORY_PATH: &str = ":memory:";

/// How the engine opens the backing storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    /// Let the engine pick based on the path.
    #[default]
    Automatic,
    /// Fail writes; requires persistent storage.
    ReadOnly,
    /// Read and write access.
    ReadWrite,
}

/// Result coercions applied at decode time.
///
/// Coercions change only the logical type exposed to the caller where the
/// byte layout allows, and value-convert otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueryConfig {
    /// Expose millisecond-timestamp result columns as date values.
    pub cast_timestamp_to_date64: bool,
    /// Expose 64-bit integer result columns as doubles.
    pub cast_bigint_to_double: bool,
}

impl QueryConfig {
    /// Whether any coercion is active.
    pub fn has_any_cast(&self) -> bool {
        self.cast_timestamp_to_date64 || self.cast_bigint_to_double
    }
}

/// Options for opening a database instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseOptions {
    /// Storage location identifier; [`IN_MEMORY_PATH`] for a transient
    /// instance.
    pub path: String,
    /// Storage access mode.
    pub access_mode: AccessMode,
    /// Result coercion flags.
    pub query: QueryConfig,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            path: IN_MEMORY_PATH.to_string(),
            access_mode: AccessMode::default(),
            query: QueryConfig::default(),
        }
    }
}

impl DatabaseOptions {
    /// In-memory instance with default settings.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Instance backed by the given storage path.
    pub fn with_path(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Whether this instance is transient.
    pub fn is_in_memory(&self) -> bool {
        self.path == IN_MEMORY_PATH
    }

    /// Validate the option combination.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an empty path or for a read-only
    /// in-memory instance (a transient database can never have content to
    /// read).
    pub fn validate(&self) -> BridgeResult<()> {
        if self.path.is_empty() {
            return Err(BridgeError::Config(
                "path must not be empty (use \":memory:\" for a transient instance)".to_string(),
            ));
        }
        if self.access_mode == AccessMode::ReadOnly && self.is_in_memory() {
            return Err(BridgeError::Config(
                "read-only access is contradictory for an in-memory instance".to_string(),
            ));
        }
        Ok(())
    }
}
