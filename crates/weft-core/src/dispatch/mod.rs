//! Sub-agent dispatch
//!
//! Fans a set of sub-agent invocations out in parallel under guardrails
//! (concurrency, cost, duration, rate, recursion), deduplicates idempotent
//! requests, and reduces the results through an aggregation strategy.

mod aggregate;
mod dispatcher;
mod idempotency;
mod limits;

pub use aggregate::{AggregationStrategy, aggregate};
pub use dispatcher::{DispatchOutcome, Dispatcher, RequestReport, TrippedGuardrail};
pub use idempotency::{IdempotencyCache, canonical_json, idempotency_cache, idempotency_key};
pub use limits::{DispatchBudget, ExecutionScope, Guardrails, RateLimitConfig, RateLimiter};

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Caller-facing configuration for one sub-agent invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    /// Prompt template; `{{key}}` tokens are filled from `arguments`
    pub template: String,
    #[serde(default)]
    pub arguments: HashMap<String, Value>,
    /// Explicit idempotency identity; derived from content when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
}

impl AgentConfig {
    pub fn new(name: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            template: template.into(),
            arguments: HashMap::new(),
            identity: None,
        }
    }

    pub fn with_argument(mut self, key: impl Into<String>, value: Value) -> Self {
        self.arguments.insert(key.into(), value);
        self
    }
}

/// A fully rendered request ready for the runner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentRequest {
    pub agent: String,
    pub prompt: String,
    pub arguments: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
}

/// What a sub-agent run produced, including its charged cost
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub value: Value,
    #[serde(default)]
    pub cost: f64,
}

/// Executes one sub-agent request
///
/// Implementations are expected to observe the cancellation token at their
/// suspension points and return promptly once it fires.
#[async_trait]
pub trait SubAgentRunner: Send + Sync {
    async fn run(&self, request: &SubAgentRequest, cancel: &CancellationToken)
    -> Result<AgentOutcome>;
}

/// Per-request lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Queued,
    Throttled,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
    DedupCached,
}

impl RequestState {
    /// States that carry a usable result value
    pub fn has_value(self) -> bool {
        matches!(self, RequestState::Succeeded | RequestState::DedupCached)
    }
}

/// Render `{{key}}` tokens in `template` from the argument map
///
/// Templates containing control characters (beyond whitespace) are rejected
/// outright; they have no business in a prompt and can exploit downstream
/// parsers. A token with no matching key is an error, never a silent blank.
pub fn render_template(template: &str, arguments: &HashMap<String, Value>) -> Result<String> {
    if template
        .chars()
        .any(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t'))
    {
        return Err(Error::Security(
            "template contains control characters".into(),
        ));
    }

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            out.push_str(&rest[open..]);
            return Ok(out);
        };
        let key = after[..close].trim();
        let value = arguments
            .get(key)
            .ok_or_else(|| Error::Validation(format!("template references absent key {key}")))?;
        match value {
            Value::String(s) => out.push_str(s),
            other => out.push_str(&other.to_string()),
        }
        rest = &after[close + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_substitutes_values() {
        let args = HashMap::from([
            ("topic".to_string(), json!("rust")),
            ("depth".to_string(), json!(2)),
        ]);
        let out = render_template("Research {{topic}} to depth {{depth}}", &args).unwrap();
        assert_eq!(out, "Research rust to depth 2");
    }

    #[test]
    fn test_absent_key_is_error() {
        let err = render_template("hello {{missing}}", &HashMap::new()).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_control_characters_rejected() {
        let err = render_template("payload \u{1b}[0m here", &HashMap::new()).unwrap_err();
        assert!(matches!(err, Error::Security(_)));
        // Ordinary whitespace is fine.
        assert!(render_template("line one\nline two\ttabbed", &HashMap::new()).is_ok());
    }

    #[test]
    fn test_unclosed_token_preserved() {
        let out = render_template("broken {{token", &HashMap::new()).unwrap();
        assert_eq!(out, "broken {{token");
    }

    #[test]
    fn test_request_state_values() {
        assert!(RequestState::Succeeded.has_value());
        assert!(RequestState::DedupCached.has_value());
        assert!(!RequestState::Cancelled.has_value());
        assert_eq!(
            serde_json::to_string(&RequestState::DedupCached).unwrap(),
            "\"dedup_cached\""
        );
    }
}
