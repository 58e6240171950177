//! Tool invocation layer
//!
//! Every tool call funnels through [`ToolInvoker::invoke`]: the definition
//! is resolved, arguments are validated against its parameter schema, and a
//! kind-specific [`KindInvoker`] carries out the call. The catalog is never
//! owned by a tool implementation; invokers receive a handle at call time.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::dispatch::{SubAgentRunner, render_template};
use crate::error::{Error, Result};
use crate::registry::{ParameterSpec, ToolDefinition, ToolKind, ToolRegistry, schema};

/// A tool implemented in-process
#[async_trait]
pub trait NativeTool: Send + Sync {
    /// Tool name (unique within a registry)
    fn name(&self) -> &str;

    /// Description surfaced to the planner
    fn description(&self) -> &str;

    /// Parameter surface; arguments are validated against it before `call`
    fn parameters(&self) -> Vec<ParameterSpec>;

    /// Optional domain tag for filtered enumeration
    fn domain(&self) -> Option<&str> {
        None
    }

    /// Execute with validated arguments
    async fn call(&self, args: Value) -> Result<Value>;
}

/// Kind-specific invocation strategy
///
/// One implementation per [`ToolKind`]; all conform to the same seam so the
/// executor never branches on kind itself.
#[async_trait]
pub trait KindInvoker: Send + Sync {
    async fn invoke(
        &self,
        invoker: &Arc<ToolInvoker>,
        definition: &ToolDefinition,
        args: Value,
        cancel: &CancellationToken,
    ) -> Result<Value>;
}

/// Resolves definitions and dispatches to per-kind invokers
pub struct ToolInvoker {
    registry: Arc<ToolRegistry>,
    invokers: HashMap<ToolKind, Arc<dyn KindInvoker>>,
}

impl ToolInvoker {
    /// Invoker with the native strategy pre-wired
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        let mut invokers: HashMap<ToolKind, Arc<dyn KindInvoker>> = HashMap::new();
        invokers.insert(ToolKind::Native, Arc::new(NativeInvoker));
        Self { registry, invokers }
    }

    /// Install or replace the strategy for a kind
    pub fn with_invoker(mut self, kind: ToolKind, strategy: Arc<dyn KindInvoker>) -> Self {
        self.invokers.insert(kind, strategy);
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Invoke `tool` with `input`
    ///
    /// Arguments are schema-validated (defaults applied) before any
    /// strategy runs; a validation failure never reaches the tool.
    pub async fn invoke(
        self: &Arc<Self>,
        tool: &str,
        input: Value,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let definition = self.registry.get(tool)?.clone();
        let args = schema::validate_args(&definition.parameters, &input)?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let strategy = self.invokers.get(&definition.kind).ok_or_else(|| {
            Error::Internal(format!(
                "no invoker installed for kind {}",
                definition.kind.as_str()
            ))
        })?;
        debug!(tool, kind = definition.kind.as_str(), "invoking tool");
        strategy.invoke(self, &definition, args, cancel).await
    }
}

/// Invoker for [`ToolKind::Native`]: looks up the implementation registered
/// beside the definition
pub struct NativeInvoker;

#[async_trait]
impl KindInvoker for NativeInvoker {
    async fn invoke(
        &self,
        invoker: &Arc<ToolInvoker>,
        definition: &ToolDefinition,
        args: Value,
        _cancel: &CancellationToken,
    ) -> Result<Value> {
        let tool = invoker.registry.native(&definition.name).ok_or_else(|| {
            Error::Internal(format!(
                "native tool {} has no registered implementation",
                definition.name
            ))
        })?;
        tool.call(args).await
    }
}

/// Invoker for [`ToolKind::SubAgent`]: renders the definition's prompt
/// template from the arguments and delegates to the configured runner
pub struct SubAgentToolInvoker {
    runner: Arc<dyn SubAgentRunner>,
}

impl SubAgentToolInvoker {
    pub fn new(runner: Arc<dyn SubAgentRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl KindInvoker for SubAgentToolInvoker {
    async fn invoke(
        &self,
        _invoker: &Arc<ToolInvoker>,
        definition: &ToolDefinition,
        args: Value,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let template = definition
            .metadata
            .get("template")
            .and_then(|t| t.as_str())
            .ok_or_else(|| {
                Error::Validation(format!(
                    "sub-agent tool {} has no prompt template",
                    definition.name
                ))
            })?;
        let arguments: HashMap<String, Value> = match &args {
            Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            _ => HashMap::new(),
        };
        let agent = definition
            .metadata
            .get("agent")
            .and_then(|a| a.as_str())
            .unwrap_or(&definition.name);
        let prompt = render_template(template, &arguments)?;
        let request = crate::dispatch::SubAgentRequest {
            agent: agent.to_string(),
            prompt,
            arguments,
            identity: None,
        };
        let outcome = self.runner.run(&request, cancel).await?;
        Ok(outcome.value)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{ConstTool, DoubleTool};
    use super::*;
    use serde_json::json;

    fn invoker() -> Arc<ToolInvoker> {
        let mut registry = ToolRegistry::new("test");
        registry
            .register_native(Arc::new(ConstTool {
                name: "three".into(),
                value: 3,
            }))
            .unwrap();
        registry.register_native(Arc::new(DoubleTool)).unwrap();
        Arc::new(ToolInvoker::new(Arc::new(registry)))
    }

    #[tokio::test]
    async fn test_native_invocation() {
        let invoker = invoker();
        let cancel = CancellationToken::new();
        let out = invoker.invoke("three", json!({}), &cancel).await.unwrap();
        assert_eq!(out, json!({"n": 3}));
        let out = invoker
            .invoke("double", json!({"v": 5}), &cancel)
            .await
            .unwrap();
        assert_eq!(out, json!({"v": 10}));
    }

    #[tokio::test]
    async fn test_unknown_tool_and_bad_args() {
        let invoker = invoker();
        let cancel = CancellationToken::new();
        assert!(matches!(
            invoker.invoke("missing", json!({}), &cancel).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            invoker.invoke("double", json!({"v": "five"}), &cancel).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_before_dispatch() {
        let invoker = invoker();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            invoker.invoke("three", json!({}), &cancel).await,
            Err(Error::Cancelled)
        ));
    }
}
