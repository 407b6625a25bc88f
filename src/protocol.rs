//! Wire protocol between the caller and the engine host.
//!
//! Every message carries a correlation id and a kind-tagged payload. The
//! host answers a request either with a single response payload (unary
//! operations such as open/connect/flush) or with a stream of `data-chunk`
//! payloads terminated by `end-of-stream` (queries). Error payloads reject
//! the pending request they correlate to.

use serde::{Deserialize, Serialize};

use crate::config::DatabaseOptions;

/// A single protocol message, caller → host or host → caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Correlation id. Assigned by the caller, monotonically increasing;
    /// host messages echo the id of the request they answer.
    pub id: u64,
    /// Kind-tagged payload.
    #[serde(flatten)]
    pub payload: Payload,
}

impl Message {
    pub fn new(id: u64, payload: Payload) -> Self {
        Self { id, payload }
    }
}

/// Message payloads, tagged by `kind` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "kebab-case")]
pub enum Payload {
    /// Configure the engine instance.
    OpenRequest {
        options: DatabaseOptions,
    },
    OpenResponse,

    /// Open a logical session.
    ConnectRequest,
    ConnectResponse {
        /// Session identifier recognized by the host.
        session: u32,
    },

    /// Release a session.
    DisconnectRequest {
        session: u32,
    },
    DisconnectResponse,

    /// Execute a SQL statement on a session. Answered by a stream of
    /// `DataChunk` payloads followed by `EndOfStream`, or by `Error`.
    QueryRequest {
        session: u32,
        sql: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        params: Option<Vec<serde_json::Value>>,
    },

    /// One columnar IPC-encoded record batch.
    DataChunk {
        buffer: Vec<u8>,
    },

    /// The host rejected the correlated request.
    Error {
        error: ErrorInfo,
    },

    /// The correlated stream is complete.
    EndOfStream,

    /// Ask the host to stop executing the request identified by `target`.
    CancelRequest {
        target: u64,
    },
    /// The host stopped (or never started) the targeted request.
    CancelAck,

    /// Register a named byte buffer in the host's file namespace.
    RegisterFileRequest {
        name: String,
        buffer: Vec<u8>,
    },
    RegisterFileResponse,

    /// Make all pending virtual file writes visible to the engine.
    FlushRequest,
    FlushResponse,

    /// Drop a single named buffer.
    DropFileRequest {
        name: String,
    },
    DropFileResponse,

    /// Drop every registered buffer.
    DropRequest,
    DropResponse,
}

impl Payload {
    /// Wire kind name, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::OpenRequest { .. } => "open-request",
            Payload::OpenResponse => "open-response",
            Payload::ConnectRequest => "connect-request",
            Payload::ConnectResponse { .. } => "connect-response",
            Payload::DisconnectRequest { .. } => "disconnect-request",
            Payload::DisconnectResponse => "disconnect-response",
            Payload::QueryRequest { .. } => "query-request",
            Payload::DataChunk { .. } => "data-chunk",
            Payload::Error { .. } => "error",
            Payload::EndOfStream => "end-of-stream",
            Payload::CancelRequest { .. } => "cancel-request",
            Payload::CancelAck => "cancel-ack",
            Payload::RegisterFileRequest { .. } => "register-file-request",
            Payload::RegisterFileResponse => "register-file-response",
            Payload::FlushRequest => "flush-request",
            Payload::FlushResponse => "flush-response",
            Payload::DropFileRequest { .. } => "drop-file-request",
            Payload::DropFileResponse => "drop-file-response",
            Payload::DropRequest => "drop-request",
            Payload::DropResponse => "drop-response",
        }
    }
}

/// Structured error descriptor in a failed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Error code.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}
