//! Glue between the invocation layer and the leaf crates
//!
//! Remote workers and the code sandbox live in their own crates with their
//! own error types; the adapters here conform them to [`KindInvoker`] and
//! translate their failures into the core taxonomy.

#[cfg(feature = "remote")]
pub mod remote {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::Value;
    use tokio_util::sync::CancellationToken;

    use weft_remote::{RemoteClient, RemoteError, WorkerToolSpec};

    use crate::error::{Error, Result};
    use crate::invoke::{KindInvoker, ToolInvoker};
    use crate::registry::{ParamType, ParameterSpec, ToolDefinition, ToolKind};

    /// Invoker for [`ToolKind::Remote`]: forwards to the worker connection
    pub struct RemoteToolInvoker {
        client: Arc<RemoteClient>,
    }

    impl RemoteToolInvoker {
        pub fn new(client: Arc<RemoteClient>) -> Self {
            Self { client }
        }
    }

    #[async_trait]
    impl KindInvoker for RemoteToolInvoker {
        async fn invoke(
            &self,
            _invoker: &Arc<ToolInvoker>,
            definition: &ToolDefinition,
            args: Value,
            cancel: &CancellationToken,
        ) -> Result<Value> {
            tokio::select! {
                _ = cancel.cancelled() => Err(Error::Cancelled),
                result = self.client.invoke(&definition.name, args) => {
                    result.map_err(map_remote_error)
                }
            }
        }
    }

    /// Translate adapter failures into the core taxonomy
    pub fn map_remote_error(error: RemoteError) -> Error {
        match error {
            RemoteError::Transport(m) => Error::Transient(m),
            RemoteError::Timeout => Error::Transient("remote worker timed out".into()),
            RemoteError::Closed => Error::Transient("remote connection closed".into()),
            RemoteError::Protocol(m) => Error::Internal(m),
            RemoteError::Server { kind, message } => match kind.as_str() {
                "not_found" => Error::NotFound(message),
                "validation" => Error::Validation(message),
                "security" => Error::Security(message),
                "transient" | "server" => Error::Transient(message),
                _ => Error::Internal(message),
            },
        }
    }

    /// Convert discovered worker specs into registrable definitions
    pub fn definitions_from_specs(
        specs: &[WorkerToolSpec],
        domain: Option<&str>,
    ) -> Vec<ToolDefinition> {
        specs
            .iter()
            .map(|spec| {
                let mut definition =
                    ToolDefinition::new(&spec.name, ToolKind::Remote, &spec.description);
                if let Some(domain) = domain {
                    definition.domain = Some(domain.to_string());
                }
                definition.parameters = parameters_from_schema(&spec.input_schema);
                definition
            })
            .collect()
    }

    fn parameters_from_schema(schema: &Value) -> Vec<ParameterSpec> {
        let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) else {
            return Vec::new();
        };
        let required: Vec<&str> = schema
            .get("required")
            .and_then(|r| r.as_array())
            .map(|items| items.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default();

        properties
            .iter()
            .map(|(name, property)| {
                let param_type = property
                    .get("type")
                    .and_then(|t| t.as_str())
                    .and_then(parse_type)
                    .unwrap_or(ParamType::Object);
                let mut spec = ParameterSpec::new(name, param_type);
                if required.contains(&name.as_str()) {
                    spec = spec.required();
                }
                if let Some(description) = property.get("description").and_then(|d| d.as_str()) {
                    spec = spec.with_description(description);
                }
                if let Some(values) = property.get("enum").and_then(|e| e.as_array()) {
                    spec = spec.with_enum(values.clone());
                }
                if let Some(default) = property.get("default") {
                    spec = spec.with_default(default.clone());
                }
                if let Some(items) = property.get("items") {
                    spec = spec.with_items(items.clone());
                }
                spec
            })
            .collect()
    }

    fn parse_type(tag: &str) -> Option<ParamType> {
        match tag {
            "string" => Some(ParamType::String),
            "integer" => Some(ParamType::Integer),
            "number" => Some(ParamType::Number),
            "boolean" => Some(ParamType::Boolean),
            "array" => Some(ParamType::Array),
            "object" => Some(ParamType::Object),
            _ => None,
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use serde_json::json;

        #[test]
        fn test_specs_become_definitions() {
            let specs = vec![WorkerToolSpec {
                name: "fetch".into(),
                description: "Fetch a page".into(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "url": {"type": "string", "description": "Target URL"},
                        "retries": {"type": "integer", "default": 2},
                    },
                    "required": ["url"],
                }),
            }];
            let definitions = definitions_from_specs(&specs, Some("web"));
            assert_eq!(definitions.len(), 1);
            let fetch = &definitions[0];
            assert_eq!(fetch.kind, ToolKind::Remote);
            assert_eq!(fetch.domain.as_deref(), Some("web"));
            let url = fetch.parameters.iter().find(|p| p.name == "url").unwrap();
            assert!(url.required);
            assert_eq!(url.param_type, ParamType::String);
            let retries = fetch.parameters.iter().find(|p| p.name == "retries").unwrap();
            assert_eq!(retries.default, Some(json!(2)));
        }

        #[test]
        fn test_error_translation() {
            assert!(matches!(
                map_remote_error(RemoteError::Transport("reset".into())),
                Error::Transient(_)
            ));
            assert!(matches!(
                map_remote_error(RemoteError::Server {
                    kind: "not_found".into(),
                    message: "no tool".into()
                }),
                Error::NotFound(_)
            ));
            assert!(matches!(
                map_remote_error(RemoteError::Server {
                    kind: "server".into(),
                    message: "500".into()
                }),
                Error::Transient(_)
            ));
            assert!(matches!(
                map_remote_error(RemoteError::Protocol("garbled".into())),
                Error::Internal(_)
            ));
        }
    }
}

#[cfg(feature = "sandbox")]
pub mod sandbox {
    use std::collections::HashMap;
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::Value;
    use tokio_util::sync::CancellationToken;

    use weft_sandbox::{
        RedactFn, Sandbox, SandboxConfig, SandboxOutcome, SandboxTool, ToolHost,
    };

    use crate::error::{Error, Result};
    use crate::invoke::{KindInvoker, ToolInvoker};
    use crate::redact::Redactor;
    use crate::registry::{ParameterSpec, ToolDefinition, ToolKind, schema};

    /// A catalog tool exposed inside the sandbox
    ///
    /// Argument checking delegates to the shared schema validator, so the
    /// call-log invariant (logged calls always satisfied the schema) holds
    /// by construction.
    struct BoundTool {
        name: String,
        parameters: Vec<ParameterSpec>,
        invoker: Arc<ToolInvoker>,
        cancel: CancellationToken,
    }

    #[async_trait]
    impl SandboxTool for BoundTool {
        fn name(&self) -> &str {
            &self.name
        }

        fn check_args(&self, args: &Value) -> std::result::Result<Value, String> {
            schema::validate_args(&self.parameters, args).map_err(|e| e.to_string())
        }

        async fn call(&self, args: Value) -> std::result::Result<Value, String> {
            self.invoker
                .invoke(&self.name, args, &self.cancel)
                .await
                .map_err(|e| e.to_string())
        }
    }

    /// Runs planner-emitted orchestration code with the catalog bound
    pub struct SandboxRunner {
        invoker: Arc<ToolInvoker>,
        config: SandboxConfig,
        redactor: Arc<Redactor>,
    }

    impl SandboxRunner {
        pub fn new(invoker: Arc<ToolInvoker>, config: SandboxConfig, redactor: Arc<Redactor>) -> Self {
            Self {
                invoker,
                config,
                redactor,
            }
        }

        /// Execute a fragment with every catalog tool bound and the given
        /// variables in scope
        pub async fn run_code(
            &self,
            fragment: &str,
            variables: HashMap<String, Value>,
            cancel: &CancellationToken,
        ) -> SandboxOutcome {
            let caller = uuid::Uuid::new_v4().to_string();
            let redactor = self.redactor.clone();
            let redact: RedactFn = Arc::new(move |value| redactor.redact_value(value));

            let mut host = ToolHost::new(caller, &self.config)
                .with_cancellation(cancel.child_token())
                .with_redactor(redact);
            for definition in self.invoker.registry().snapshot().iter() {
                // Sandboxed-code tools are reachable through the invoker
                // like any other kind; binding them re-enters this runner.
                host = host.with_tool(Arc::new(BoundTool {
                    name: definition.name.clone(),
                    parameters: definition.parameters.clone(),
                    invoker: self.invoker.clone(),
                    cancel: cancel.clone(),
                }) as Arc<dyn SandboxTool>);
            }

            Sandbox::new(self.config.clone())
                .run(fragment, Arc::new(host), variables)
                .await
        }
    }

    /// Invoker for [`ToolKind::SandboxedCode`]: runs the fragment registered
    /// beside the definition, with the invocation arguments in scope
    pub struct SandboxedCodeInvoker {
        config: SandboxConfig,
        redactor: Arc<Redactor>,
    }

    impl SandboxedCodeInvoker {
        pub fn new(config: SandboxConfig, redactor: Arc<Redactor>) -> Self {
            Self { config, redactor }
        }
    }

    #[async_trait]
    impl KindInvoker for SandboxedCodeInvoker {
        async fn invoke(
            &self,
            invoker: &Arc<ToolInvoker>,
            definition: &ToolDefinition,
            args: Value,
            cancel: &CancellationToken,
        ) -> Result<Value> {
            debug_assert_eq!(definition.kind, ToolKind::SandboxedCode);
            let fragment = invoker
                .registry()
                .fragment(&definition.name)
                .ok_or_else(|| {
                    Error::Internal(format!(
                        "sandboxed tool {} has no registered fragment",
                        definition.name
                    ))
                })?
                .to_string();

            let variables: HashMap<String, Value> = match args {
                Value::Object(map) => map.into_iter().collect(),
                _ => HashMap::new(),
            };

            let runner =
                SandboxRunner::new(invoker.clone(), self.config.clone(), self.redactor.clone());
            let outcome = runner.run_code(&fragment, variables, cancel).await;
            match outcome.error {
                None => Ok(outcome.output.unwrap_or(Value::Null)),
                Some(record) => Err(map_sandbox_error(&record.kind, record.message)),
            }
        }
    }

    /// Translate sandbox failure tags into the core taxonomy
    pub fn map_sandbox_error(kind: &str, message: String) -> Error {
        match kind {
            "security" => Error::Security(message),
            "validation" => Error::Validation(message),
            "timeout" => Error::Transient(message),
            "call_limit" => Error::BudgetExceeded(message),
            "cancelled" => Error::Cancelled,
            _ => Error::Internal(message),
        }
    }

}
