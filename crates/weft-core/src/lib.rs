//! Weft Core - execution core for AI-tool orchestration
//!
//! This crate converts structured plans (DAGs of tool invocations) into
//! results under safety, cost, and concurrency guardrails:
//! - Tool registry with schema-validated parameters and catalog snapshots
//! - Hybrid lexical + semantic tool search with caching and fallback
//! - Plan executor with dependency levels, reference substitution, retries,
//!   and partial-failure semantics
//! - Sub-agent dispatcher with cost/time/rate/recursion guardrails,
//!   idempotency, and pluggable aggregation
//! - Adapters binding remote workers and the code sandbox into one
//!   invocation seam

pub mod adapters;
pub mod cache;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod invoke;
pub mod plan;
pub mod redact;
pub mod registry;
pub mod search;
pub mod skills;

pub use cache::TtlCache;
pub use config::{ExecutorConfig, SearchConfig, SystemConfig, defaults};
pub use context::{SystemContext, SystemContextBuilder};
pub use dispatch::{
    AgentConfig, AgentOutcome, AggregationStrategy, DispatchBudget, DispatchOutcome, Dispatcher,
    ExecutionScope, Guardrails, RateLimitConfig, RequestReport, RequestState, SubAgentRequest,
    SubAgentRunner, TrippedGuardrail, idempotency_key, render_template,
};
pub use error::{Error, ErrorKind, ErrorRecord, Result};
pub use invoke::{KindInvoker, NativeTool, ToolInvoker};
pub use plan::{
    ExecutionContext, Plan, PlanExecutor, PlanOutcome, PlanReport, RetryPolicy, Step, StepRecord,
    StepState, SynthesisSpec,
};
pub use redact::{Redactor, SensitiveKind};
pub use registry::{
    DetailLevel, ParamType, ParameterSpec, PlannerFormatOptions, ToolCatalog, ToolDefinition,
    ToolFilter, ToolKind, ToolRegistry, to_planner_format,
};
pub use search::{ScoredTool, SearchEngine, embed::Embedder};
pub use skills::{SkillMeta, SkillQuotas, SkillStore, SkillVersion, VersionBump};

#[cfg(feature = "sandbox")]
pub use adapters::sandbox::SandboxRunner;
