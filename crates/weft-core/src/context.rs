//! System context
//!
//! One explicit value constructed at startup replaces every would-be
//! singleton: the catalog, the search engine, the invocation layer, the
//! dispatcher, and the shared caches all hang off a [`SystemContext`] and
//! are handed out as `Arc` handles. Tests inject their own backends through
//! the builder.

use std::sync::Arc;

use crate::config::SystemConfig;
use crate::dispatch::{Dispatcher, IdempotencyCache, SubAgentRunner, idempotency_cache};
use crate::invoke::{SubAgentToolInvoker, ToolInvoker};
use crate::plan::PlanExecutor;
use crate::redact::Redactor;
use crate::registry::{ToolKind, ToolRegistry};
use crate::search::SearchEngine;
use crate::search::embed::Embedder;

/// Root object owning the shared subsystems
///
/// The registry is owned here and read-only after construction; components
/// hold reference handles, never the catalog itself.
pub struct SystemContext {
    config: SystemConfig,
    registry: Arc<ToolRegistry>,
    search: Arc<SearchEngine>,
    invoker: Arc<ToolInvoker>,
    redactor: Arc<Redactor>,
    idempotency: Arc<IdempotencyCache>,
    dispatcher: Option<Arc<Dispatcher>>,
}

impl SystemContext {
    pub fn builder(config: SystemConfig, registry: ToolRegistry) -> SystemContextBuilder {
        SystemContextBuilder {
            config,
            registry,
            embedder_factory: None,
            runner: None,
            redaction_secret: None,
            #[cfg(feature = "remote")]
            remote_client: None,
        }
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn search(&self) -> &Arc<SearchEngine> {
        &self.search
    }

    pub fn invoker(&self) -> &Arc<ToolInvoker> {
        &self.invoker
    }

    pub fn redactor(&self) -> &Arc<Redactor> {
        &self.redactor
    }

    pub fn idempotency(&self) -> &Arc<IdempotencyCache> {
        &self.idempotency
    }

    /// The sub-agent dispatcher, present when a runner was configured
    pub fn dispatcher(&self) -> Option<&Arc<Dispatcher>> {
        self.dispatcher.as_ref()
    }

    /// A plan executor over this context's invocation layer
    pub fn plan_executor(&self) -> PlanExecutor {
        PlanExecutor::new(self.invoker.clone(), self.config.executor.clone())
    }

    /// A sandbox runner for planner-emitted orchestration code
    #[cfg(feature = "sandbox")]
    pub fn sandbox_runner(&self) -> crate::adapters::sandbox::SandboxRunner {
        crate::adapters::sandbox::SandboxRunner::new(
            self.invoker.clone(),
            weft_sandbox::SandboxConfig::default(),
            self.redactor.clone(),
        )
    }
}

type EmbedderFactoryFn = Box<dyn Fn() -> crate::error::Result<Arc<dyn Embedder>> + Send + Sync>;

pub struct SystemContextBuilder {
    config: SystemConfig,
    registry: ToolRegistry,
    embedder_factory: Option<EmbedderFactoryFn>,
    runner: Option<Arc<dyn SubAgentRunner>>,
    redaction_secret: Option<String>,
    #[cfg(feature = "remote")]
    remote_client: Option<Arc<weft_remote::RemoteClient>>,
}

impl SystemContextBuilder {
    /// Install the embedding backend used by semantic search
    pub fn with_embedder_factory(
        mut self,
        factory: impl Fn() -> crate::error::Result<Arc<dyn Embedder>> + Send + Sync + 'static,
    ) -> Self {
        self.embedder_factory = Some(Box::new(factory));
        self
    }

    /// Install the sub-agent runner; enables the dispatcher and sub-agent
    /// tool invocation
    pub fn with_sub_agent_runner(mut self, runner: Arc<dyn SubAgentRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Secret for the sensitive-data tokenizer; unkeyed markers otherwise
    pub fn with_redaction_secret(mut self, secret: impl Into<String>) -> Self {
        self.redaction_secret = Some(secret.into());
        self
    }

    /// Connect a remote worker; enables remote tool invocation
    #[cfg(feature = "remote")]
    pub fn with_remote_client(mut self, client: Arc<weft_remote::RemoteClient>) -> Self {
        self.remote_client = Some(client);
        self
    }

    pub fn build(self) -> SystemContext {
        let registry = Arc::new(self.registry);
        let redactor = Arc::new(match &self.redaction_secret {
            Some(secret) => Redactor::new(secret.clone()),
            None => Redactor::unkeyed(),
        });

        let mut search = SearchEngine::new(self.config.search.clone());
        if let Some(factory) = self.embedder_factory {
            search = search.with_embedder_factory(factory);
        }

        let mut invoker = ToolInvoker::new(registry.clone());
        if let Some(runner) = &self.runner {
            invoker = invoker.with_invoker(
                ToolKind::SubAgent,
                Arc::new(SubAgentToolInvoker::new(runner.clone())),
            );
        }
        #[cfg(feature = "remote")]
        if let Some(client) = self.remote_client {
            invoker = invoker.with_invoker(
                ToolKind::Remote,
                Arc::new(crate::adapters::remote::RemoteToolInvoker::new(client)),
            );
        }
        #[cfg(feature = "sandbox")]
        {
            invoker = invoker.with_invoker(
                ToolKind::SandboxedCode,
                Arc::new(crate::adapters::sandbox::SandboxedCodeInvoker::new(
                    weft_sandbox::SandboxConfig::default(),
                    redactor.clone(),
                )),
            );
        }

        let idempotency = Arc::new(idempotency_cache(std::time::Duration::from_secs(
            crate::config::defaults::IDEMPOTENCY_TTL_SECS,
        )));
        let dispatcher = self.runner.map(|runner| {
            Arc::new(Dispatcher::new(runner).with_idempotency_cache(idempotency.clone()))
        });

        SystemContext {
            config: self.config,
            registry,
            search: Arc::new(search),
            invoker: Arc::new(invoker),
            redactor,
            idempotency,
            dispatcher,
        }
    }
}
