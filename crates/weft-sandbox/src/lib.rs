//! Weft Sandbox - Restricted execution for planner-emitted code
//!
//! This crate runs orchestration fragments (Rhai source) against injected
//! tool bindings. Fragments are validated before execution: forbidden
//! symbols fail compilation and a walk over the compiled AST rejects calls
//! to denied names, so a rejected fragment never invokes a tool. At run
//! time the only reachable names are curated builtins, the tool bindings,
//! and caller-supplied variables; there is no filesystem, network, or
//! dynamic-evaluation surface.

pub mod bindings;
pub mod executor;
pub mod validate;

pub use bindings::{OutputFilter, RedactFn, SandboxTool, ToolCallRecord, ToolHost};
pub use executor::{Sandbox, SandboxOutcome};
pub use validate::validate_fragment;

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Sandbox limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Tool calls allowed per fragment run
    pub max_tool_calls: usize,
    /// Wall-clock cap for one fragment run
    pub timeout: Duration,
    /// Interpreter operation cap, a backstop against pure spin loops
    pub max_operations: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_tool_calls: 100,
            timeout: Duration::from_secs(30),
            max_operations: 10_000_000,
        }
    }
}

/// Sandbox errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum SandboxError {
    #[error("forbidden construct: {0}")]
    Security(String),
    #[error("fragment invalid: {0}")]
    Validation(String),
    #[error("fragment exceeded the {0:?} wall-clock cap")]
    Timeout(Duration),
    #[error("tool call limit of {0} reached")]
    CallLimit(usize),
    #[error("tool {tool} failed: {message}")]
    Tool { tool: String, message: String },
    #[error("fragment cancelled")]
    Cancelled,
    #[error("sandbox internal error: {0}")]
    Internal(String),
}

impl SandboxError {
    /// Stable tag for reports and cross-crate mapping
    pub fn kind(&self) -> &'static str {
        match self {
            SandboxError::Security(_) => "security",
            SandboxError::Validation(_) => "validation",
            SandboxError::Timeout(_) => "timeout",
            SandboxError::CallLimit(_) => "call_limit",
            SandboxError::Tool { .. } => "tool",
            SandboxError::Cancelled => "cancelled",
            SandboxError::Internal(_) => "internal",
        }
    }

    pub fn to_record(&self) -> SandboxErrorRecord {
        SandboxErrorRecord {
            kind: self.kind().to_string(),
            message: self.to_string(),
        }
    }
}

/// Serializable error entry in a sandbox outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxErrorRecord {
    pub kind: String,
    pub message: String,
}
