//! Tool bindings injected into the sandbox
//!
//! Every tool reachable from a fragment is wrapped: arguments are checked
//! against the tool's schema, the per-session call cap and wall-clock cap
//! are enforced, and a call-log entry is recorded with redacted arguments.
//! Large results can be filtered before they re-enter the fragment.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{SandboxConfig, SandboxError};

/// One invocable capability exposed to fragments
#[async_trait]
pub trait SandboxTool: Send + Sync {
    fn name(&self) -> &str;

    /// Validate and normalize arguments; the error string names the
    /// violated constraint
    fn check_args(&self, args: &Value) -> Result<Value, String>;

    async fn call(&self, args: Value) -> Result<Value, String>;

    /// Opt-in result filtering for tools with very large payloads
    fn output_filter(&self) -> Option<OutputFilter> {
        None
    }
}

/// Redaction hook applied to logged arguments and filtered outputs
pub type RedactFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// Truncation settings for large tool results
#[derive(Debug, Clone)]
pub struct OutputFilter {
    /// Cap on any single string value, in bytes
    pub max_bytes: usize,
    /// Cap on array lengths
    pub max_rows: usize,
    /// Pass the result through the host's redactor as well
    pub redact: bool,
}

impl OutputFilter {
    /// Truncate `value`, preserving top-level structure and attaching a
    /// summary wherever something was dropped
    pub fn apply(&self, value: &Value) -> Value {
        match value {
            Value::String(s) if s.len() > self.max_bytes => {
                let cut = floor_char_boundary(s, self.max_bytes);
                Value::String(format!(
                    "{}...[truncated {} of {} bytes]",
                    &s[..cut],
                    s.len() - cut,
                    s.len()
                ))
            }
            Value::Array(items) if items.len() > self.max_rows => {
                let mut kept: Vec<Value> =
                    items.iter().take(self.max_rows).map(|v| self.apply(v)).collect();
                kept.push(serde_json::json!({
                    "truncated": true,
                    "omitted_rows": items.len() - self.max_rows,
                }));
                Value::Array(kept)
            }
            Value::Array(items) => Value::Array(items.iter().map(|v| self.apply(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.apply(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Call-log entry tying a tool call to one sandbox invocation
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolCallRecord {
    pub tool: String,
    /// Arguments after redaction; never the raw values
    pub arguments: Value,
    pub result_bytes: usize,
    pub timestamp: DateTime<Utc>,
    /// Synthetic identifier of the sandbox invocation that made the call
    pub caller: String,
}

/// The tool surface and accounting for one fragment run
pub struct ToolHost {
    tools: HashMap<String, Arc<dyn SandboxTool>>,
    redact: Option<RedactFn>,
    caller: String,
    max_calls: usize,
    timeout: std::time::Duration,
    deadline: Mutex<Option<Instant>>,
    cancel: CancellationToken,
    count: AtomicUsize,
    log: Mutex<Vec<ToolCallRecord>>,
}

impl ToolHost {
    pub fn new(caller: impl Into<String>, config: &SandboxConfig) -> Self {
        Self {
            tools: HashMap::new(),
            redact: None,
            caller: caller.into(),
            max_calls: config.max_tool_calls,
            timeout: config.timeout,
            deadline: Mutex::new(None),
            cancel: CancellationToken::new(),
            count: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn with_tool(mut self, tool: Arc<dyn SandboxTool>) -> Self {
        self.tools.insert(tool.name().to_string(), tool);
        self
    }

    pub fn with_redactor(mut self, redact: RedactFn) -> Self {
        self.redact = Some(redact);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn arm_deadline(&self, deadline: Instant) {
        *self.deadline.lock() = Some(deadline);
    }

    pub(crate) fn deadline_passed(&self) -> bool {
        self.deadline.lock().is_some_and(|d| Instant::now() >= d)
    }

    /// Drain the call log after a run
    pub fn take_log(&self) -> Vec<ToolCallRecord> {
        std::mem::take(&mut self.log.lock())
    }

    pub(crate) async fn call_tool(&self, name: &str, args: Value) -> Result<Value, SandboxError> {
        if self.cancel.is_cancelled() {
            return Err(SandboxError::Cancelled);
        }
        if self.deadline_passed() {
            return Err(SandboxError::Timeout(self.timeout));
        }
        let call_number = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        if call_number > self.max_calls {
            return Err(SandboxError::CallLimit(self.max_calls));
        }

        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| SandboxError::Validation(format!("unknown tool {name}")))?;

        let checked = tool
            .check_args(&args)
            .map_err(|message| SandboxError::Validation(format!("tool {name}: {message}")))?;

        let logged_args = match &self.redact {
            Some(redact) => redact(&checked),
            None => checked.clone(),
        };

        let result = tool
            .call(checked)
            .await
            .map_err(|message| SandboxError::Tool {
                tool: name.to_string(),
                message,
            })?;

        let filtered = match tool.output_filter() {
            Some(filter) => {
                let truncated = filter.apply(&result);
                if filter.redact {
                    match &self.redact {
                        Some(redact) => redact(&truncated),
                        None => truncated,
                    }
                } else {
                    truncated
                }
            }
            None => result,
        };

        let result_bytes = serde_json::to_vec(&filtered).map(|b| b.len()).unwrap_or(0);
        debug!(tool = name, call = call_number, result_bytes, "sandbox tool call");
        self.log.lock().push(ToolCallRecord {
            tool: name.to_string(),
            arguments: logged_args,
            result_bytes,
            timestamp: Utc::now(),
            caller: self.caller.clone(),
        });

        Ok(filtered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl SandboxTool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn check_args(&self, args: &Value) -> Result<Value, String> {
            if args.get("text").map(|t| t.is_string()) != Some(true) {
                return Err("text must be a string".into());
            }
            Ok(args.clone())
        }

        async fn call(&self, args: Value) -> Result<Value, String> {
            Ok(json!({"echoed": args["text"]}))
        }
    }

    fn host() -> ToolHost {
        ToolHost::new("test-caller", &SandboxConfig::default()).with_tool(Arc::new(EchoTool))
    }

    #[tokio::test]
    async fn test_call_logged_with_caller() {
        let host = host();
        let out = host
            .call_tool("echo", json!({"text": "hi"}))
            .await
            .unwrap();
        assert_eq!(out["echoed"], json!("hi"));
        let log = host.take_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].tool, "echo");
        assert_eq!(log[0].caller, "test-caller");
        assert!(log[0].result_bytes > 0);
    }

    #[tokio::test]
    async fn test_schema_violation_never_calls_tool() {
        let host = host();
        let err = host.call_tool("echo", json!({"text": 7})).await.unwrap_err();
        assert!(matches!(err, SandboxError::Validation(_)));
        assert!(host.take_log().is_empty());
    }

    #[tokio::test]
    async fn test_call_cap() {
        let config = SandboxConfig {
            max_tool_calls: 2,
            ..SandboxConfig::default()
        };
        let host = ToolHost::new("caller", &config).with_tool(Arc::new(EchoTool));
        for _ in 0..2 {
            host.call_tool("echo", json!({"text": "x"})).await.unwrap();
        }
        let err = host
            .call_tool("echo", json!({"text": "x"}))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::CallLimit(2)));
    }

    #[tokio::test]
    async fn test_redactor_applies_to_log_only() {
        let redact: RedactFn = Arc::new(|v| {
            let mut out = v.clone();
            if let Some(obj) = out.as_object_mut() {
                obj.insert("text".into(), json!("[redacted]"));
            }
            out
        });
        let host = host().with_redactor(redact);
        let out = host
            .call_tool("echo", json!({"text": "secret@example.com"}))
            .await
            .unwrap();
        // The tool saw the real value; the log did not.
        assert_eq!(out["echoed"], json!("secret@example.com"));
        let log = host.take_log();
        assert_eq!(log[0].arguments["text"], json!("[redacted]"));
    }

    #[test]
    fn test_output_filter_truncates() {
        let filter = OutputFilter {
            max_bytes: 8,
            max_rows: 2,
            redact: false,
        };
        let out = filter.apply(&json!({
            "body": "0123456789abcdef",
            "rows": [1, 2, 3, 4],
        }));
        assert!(out["body"].as_str().unwrap().contains("truncated"));
        let rows = out["rows"].as_array().unwrap();
        assert_eq!(rows.len(), 3); // two kept plus the summary
        assert_eq!(rows[2]["omitted_rows"], json!(2));
    }
}
