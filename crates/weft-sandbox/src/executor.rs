//! Fragment execution
//!
//! The interpreter runs on a blocking thread with a curated engine: no
//! module resolution, disabled `eval`/`import`/`export`, an operation cap,
//! and a progress hook that observes cancellation and the wall-clock
//! deadline. Tool bindings bridge back onto the async runtime. Only the
//! fragment's declared `output`, its captured stdout, and the call log
//! leave the sandbox; intermediate values stay in the interpreter heap.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rhai::serde::{from_dynamic, to_dynamic};
use rhai::{Dynamic, Engine, EvalAltResult, Position, Scope};
use serde_json::Value;
use tracing::{debug, error};

use crate::bindings::ToolHost;
use crate::{SandboxConfig, SandboxError, SandboxErrorRecord, validate};

/// Structured result of one fragment run
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SandboxOutcome {
    /// Captured print/debug stream
    pub stdout: String,
    /// Value bound to `output` when the fragment finished, if any
    pub output: Option<Value>,
    /// Full tool-call log
    pub calls: Vec<crate::bindings::ToolCallRecord>,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<SandboxErrorRecord>,
}

/// Restricted executor for orchestration fragments
pub struct Sandbox {
    config: SandboxConfig,
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    /// Validate and run a fragment against the host's tool surface
    ///
    /// Never returns `Err`: failures of any class land in the outcome's
    /// error record with whatever stdout and call log accumulated.
    pub async fn run(
        &self,
        fragment: &str,
        host: Arc<ToolHost>,
        variables: HashMap<String, Value>,
    ) -> SandboxOutcome {
        let started = Instant::now();

        // A fragment rejected by validation executes nothing.
        if let Err(e) = validate::validate_fragment(fragment) {
            error!(kind = e.kind(), error = %e, "fragment rejected");
            return SandboxOutcome {
                stdout: String::new(),
                output: None,
                calls: Vec::new(),
                elapsed_ms: started.elapsed().as_millis() as u64,
                error: Some(e.to_record()),
            };
        }

        let deadline = started + self.config.timeout;
        host.arm_deadline(deadline);

        let handle = tokio::runtime::Handle::current();
        let config = self.config.clone();
        let source = fragment.to_string();
        let run_host = host.clone();
        let join = tokio::task::spawn_blocking(move || {
            run_blocking(handle, config, source, run_host, variables, deadline)
        });

        // The progress hook stops the interpreter at the deadline; the outer
        // timeout is a backstop with a little slack for teardown.
        let slack = Duration::from_millis(500);
        let run = match tokio::time::timeout(self.config.timeout + slack, join).await {
            Ok(Ok(run)) => run,
            Ok(Err(e)) => BlockingRun {
                stdout: String::new(),
                output: None,
                error: Some(SandboxError::Internal(format!("sandbox thread failed: {e}"))),
            },
            Err(_) => BlockingRun {
                stdout: String::new(),
                output: None,
                error: Some(SandboxError::Timeout(self.config.timeout)),
            },
        };

        SandboxOutcome {
            stdout: run.stdout,
            output: run.output,
            calls: host.take_log(),
            elapsed_ms: started.elapsed().as_millis() as u64,
            error: run.error.map(|e| e.to_record()),
        }
    }
}

struct BlockingRun {
    stdout: String,
    output: Option<Value>,
    error: Option<SandboxError>,
}

fn runtime_err(message: impl Into<String>) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(
        message.into().into(),
        Position::NONE,
    ))
}

fn run_blocking(
    handle: tokio::runtime::Handle,
    config: SandboxConfig,
    fragment: String,
    host: Arc<ToolHost>,
    variables: HashMap<String, Value>,
    deadline: Instant,
) -> BlockingRun {
    let mut engine = Engine::new();
    validate::apply_restrictions(&mut engine);
    engine.set_max_operations(config.max_operations);

    let cancel = host.cancel_token();
    engine.on_progress(move |ops| {
        if ops & 0x3ff != 0 {
            return None;
        }
        if cancel.is_cancelled() {
            return Some(Dynamic::from("cancelled"));
        }
        if Instant::now() >= deadline {
            return Some(Dynamic::from("timeout"));
        }
        None
    });

    let stdout = Arc::new(Mutex::new(String::new()));
    let sink = stdout.clone();
    engine.on_print(move |text| {
        let mut buffer = sink.lock();
        buffer.push_str(text);
        buffer.push('\n');
    });
    let sink = stdout.clone();
    engine.on_debug(move |text, _source, _pos| {
        let mut buffer = sink.lock();
        buffer.push_str(text);
        buffer.push('\n');
    });

    engine.register_fn("to_json", |value: Dynamic| -> Result<String, Box<EvalAltResult>> {
        let json: Value = from_dynamic(&value)?;
        Ok(json.to_string())
    });
    engine.register_fn("from_json", |text: &str| -> Result<Dynamic, Box<EvalAltResult>> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| runtime_err(format!("invalid JSON: {e}")))?;
        to_dynamic(&value)
    });

    // The only externally reachable names besides builtins: one binding per
    // tool (map-argument and zero-argument arities) plus `gather`.
    let first_error: Arc<Mutex<Option<SandboxError>>> = Arc::new(Mutex::new(None));
    for name in host.tool_names() {
        let tool = name.clone();
        let call_host = host.clone();
        let call_handle = handle.clone();
        let pending = first_error.clone();
        engine.register_fn(
            name.as_str(),
            move |args: rhai::Map| -> Result<Dynamic, Box<EvalAltResult>> {
                let json_args: Value = from_dynamic(&Dynamic::from_map(args))?;
                dispatch_tool(&call_handle, &call_host, &tool, json_args, &pending)
            },
        );
        let tool = name.clone();
        let call_host = host.clone();
        let call_handle = handle.clone();
        let pending = first_error.clone();
        engine.register_fn(
            name.as_str(),
            move || -> Result<Dynamic, Box<EvalAltResult>> {
                dispatch_tool(
                    &call_handle,
                    &call_host,
                    &tool,
                    Value::Object(serde_json::Map::new()),
                    &pending,
                )
            },
        );
    }

    let gather_host = host.clone();
    let gather_handle = handle.clone();
    let pending = first_error.clone();
    engine.register_fn(
        "gather",
        move |requests: rhai::Array| -> Result<Dynamic, Box<EvalAltResult>> {
            let mut parsed: Vec<(String, Value)> = Vec::with_capacity(requests.len());
            for item in requests {
                let pair = item
                    .try_cast::<rhai::Array>()
                    .ok_or_else(|| runtime_err("gather expects [tool, args] pairs"))?;
                if pair.len() != 2 {
                    return Err(runtime_err("gather expects [tool, args] pairs"));
                }
                let tool = pair[0]
                    .clone()
                    .into_immutable_string()
                    .map_err(|_| runtime_err("gather: tool name must be a string"))?;
                let args: Value = from_dynamic(&pair[1])?;
                parsed.push((tool.to_string(), args));
            }

            let host = gather_host.clone();
            let results = gather_handle.block_on(async move {
                futures::future::join_all(parsed.into_iter().map(|(tool, args)| {
                    let host = host.clone();
                    async move { host.call_tool(&tool, args).await }
                }))
                .await
            });

            let mut out = rhai::Array::with_capacity(results.len());
            for result in results {
                match result {
                    Ok(value) => out.push(to_dynamic(&value)?),
                    Err(e) => {
                        pending.lock().get_or_insert(e.clone());
                        return Err(runtime_err(e.to_string()));
                    }
                }
            }
            Ok(Dynamic::from_array(out))
        },
    );

    let mut scope = Scope::new();
    for (name, value) in &variables {
        match to_dynamic(value) {
            Ok(dynamic) => {
                scope.push_constant_dynamic(name.as_str(), dynamic);
            }
            Err(e) => {
                return BlockingRun {
                    stdout: String::new(),
                    output: None,
                    error: Some(SandboxError::Validation(format!(
                        "variable {name} cannot enter the sandbox: {e}"
                    ))),
                };
            }
        }
    }
    scope.push_dynamic("output", Dynamic::UNIT);

    let ast = match engine.compile(&fragment) {
        Ok(ast) => ast,
        Err(e) => {
            return BlockingRun {
                stdout: String::new(),
                output: None,
                error: Some(SandboxError::Validation(e.to_string())),
            };
        }
    };

    let eval_result = engine.eval_ast_with_scope::<Dynamic>(&mut scope, &ast);
    let error = match eval_result {
        Ok(_) => {
            // A fragment may catch and handle tool failures, but guardrail
            // trips survive being caught.
            let pending = first_error.lock().take();
            match pending {
                Some(
                    e @ (SandboxError::CallLimit(_)
                    | SandboxError::Timeout(_)
                    | SandboxError::Cancelled),
                ) => Some(e),
                _ => None,
            }
        }
        Err(boxed) => Some(classify_eval_error(*boxed, &config, &first_error)),
    };

    let output = scope
        .get_value::<Dynamic>("output")
        .filter(|d| !d.is_unit())
        .and_then(|d| from_dynamic::<Value>(&d).ok());

    debug!(
        has_output = output.is_some(),
        error = error.as_ref().map(|e| e.kind()),
        "fragment finished"
    );

    BlockingRun {
        stdout: stdout.lock().clone(),
        output,
        error,
    }
}

fn dispatch_tool(
    handle: &tokio::runtime::Handle,
    host: &Arc<ToolHost>,
    tool: &str,
    args: Value,
    pending: &Arc<Mutex<Option<SandboxError>>>,
) -> Result<Dynamic, Box<EvalAltResult>> {
    let result = handle.block_on(host.call_tool(tool, args));
    match result {
        Ok(value) => to_dynamic(&value),
        Err(e) => {
            pending.lock().get_or_insert(e.clone());
            Err(runtime_err(e.to_string()))
        }
    }
}

fn classify_eval_error(
    error: EvalAltResult,
    config: &SandboxConfig,
    first_error: &Arc<Mutex<Option<SandboxError>>>,
) -> SandboxError {
    match error {
        EvalAltResult::ErrorTerminated(token, _) => {
            let cancelled = token
                .into_immutable_string()
                .map(|s| s == "cancelled")
                .unwrap_or(false);
            if cancelled {
                SandboxError::Cancelled
            } else {
                SandboxError::Timeout(config.timeout)
            }
        }
        EvalAltResult::ErrorTooManyOperations(_) => SandboxError::Timeout(config.timeout),
        other => first_error
            .lock()
            .take()
            .unwrap_or_else(|| SandboxError::Validation(format!("fragment runtime error: {other}"))),
    }
}
