//! # Skiff
//!
//! An asynchronous client bridge to an embedded analytical database engine
//! that executes in an isolated host context.
//!
//! The engine has its own memory and execution state and is reachable only
//! through message passing; this crate provides the caller side of that
//! bridge: session lifecycle, a correlated request/response and streaming
//! protocol, decode of columnar result batches, configured type coercions,
//! and the virtual file namespace.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     Caller (async)                      │
//! │   Database ──── Connection ──── QueryResult             │
//! │      │               │               │                  │
//! │      │  VirtualFileStore      ColumnarDecode            │
//! │      └───────────────┴───────────────┘                  │
//! │                      │                                  │
//! │               MessageChannel                            │
//! │        (correlation ids, streaming, cancel)             │
//! └──────────────────────┼──────────────────────────────────┘
//!                        │ Transport (message passing only)
//! ┌──────────────────────▼──────────────────────────────────┐
//! │        Engine host (isolated execution context)         │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use skiff::{Database, DatabaseOptions};
//!
//! let db = Database::new(transport);
//! db.open(DatabaseOptions::in_memory()).await?;
//!
//! let conn = db.connect().await?;
//! let mut result = conn.query("SELECT 1").await?;
//! let batches = result.collect().await?;
//!
//! conn.close().await?;
//! ```

pub mod channel;
pub mod config;
pub mod connection;
pub mod database;
pub mod decode;
pub mod error;
pub mod files;
pub mod protocol;
pub mod transport;

pub use config::{AccessMode, DatabaseOptions, QueryConfig, IN_MEMORY_PATH};
pub use connection::{Connection, ConnectionState, QueryResult};
pub use database::Database;
pub use error::{BridgeError, BridgeResult};
pub use files::VirtualFileStore;

// Re-exported so callers can name decoded batch and array types without a
// separate arrow dependency.
pub use arrow::record_batch::RecordBatch;
