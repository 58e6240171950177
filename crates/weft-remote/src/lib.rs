//! Weft Remote - adapter for out-of-process tool workers
//!
//! Speaks line-delimited JSON-RPC 2.0 to a worker over a spawned child
//! process (stdio) or HTTP. The adapter surface is three methods:
//! discovery of the worker's tool specs, single invocation, and streamed
//! invocation. Transport failures are distinguished from server-reported
//! failures so callers can classify them for retry.

pub mod client;
pub mod protocol;
pub mod transport;

pub use client::RemoteClient;
pub use protocol::{JsonRpcRequest, JsonRpcResponse, WorkerMessage};
pub use transport::{HttpTransport, StdioTransport, Transport};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Adapter protocol revision sent during discovery
pub const PROTOCOL_VERSION: &str = "2025-06-01";

/// Tool spec as advertised by a remote worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerToolSpec {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// Remote adapter errors
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// The transport failed before a response arrived
    #[error("transport error: {0}")]
    Transport(String),

    /// The worker answered with an error record
    #[error("worker error ({kind}): {message}")]
    Server { kind: String, message: String },

    /// The worker answered with something that is not the protocol
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("request timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,
}

impl RemoteError {
    /// Stable tag for cross-crate classification
    pub fn kind(&self) -> &str {
        match self {
            RemoteError::Transport(_) => "transport",
            RemoteError::Server { kind, .. } => kind,
            RemoteError::Protocol(_) => "protocol",
            RemoteError::Timeout => "timeout",
            RemoteError::Closed => "closed",
        }
    }
}
