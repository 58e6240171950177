//! Plan model and execution
//!
//! A plan is a DAG of tool invocations. The executor resolves dependencies
//! into levels, substitutes inter-step references, and drives every step to
//! a terminal state exactly once. Step results accumulate in an
//! [`ExecutionContext`] that is returned to the caller whatever the outcome.

mod executor;
mod graph;
mod refs;

pub use executor::{PlanExecutor, render_synthesis};
pub use graph::{execution_levels, validate_plan};
pub use refs::resolve_references;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorRecord, Result};

/// A DAG of tool invocations with an optional synthesis template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub request_id: String,
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_synthesis: Option<SynthesisSpec>,
}

impl Plan {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            steps: Vec::new(),
            final_synthesis: None,
        }
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_synthesis(mut self, prompt_template: impl Into<String>) -> Self {
        self.final_synthesis = Some(SynthesisSpec {
            prompt_template: prompt_template.into(),
        });
        self
    }

    /// Parse a plan from its JSON wire form and validate its structure
    pub fn from_json(text: &str) -> Result<Self> {
        let plan: Plan = serde_json::from_str(text)?;
        graph::validate_plan(&plan)?;
        Ok(plan)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisSpec {
    pub prompt_template: String,
}

/// One node in a plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub tool: String,
    #[serde(default)]
    pub input: Value,
    /// Explicit dependencies; references in `input` are added implicitly
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Step {
    pub fn new(id: impl Into<String>, tool: impl Into<String>, input: Value) -> Self {
        Self {
            id: id.into(),
            tool: tool.into(),
            input,
            depends_on: Vec::new(),
            retry: None,
            timeout_ms: None,
        }
    }

    pub fn with_dependency(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on.push(step_id.into());
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, backoff_ms: u64) -> Self {
        self.retry = Some(RetryPolicy {
            max_attempts,
            backoff_ms,
        });
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff_ms: u64,
}

/// Per-step lifecycle; transitions are monotonic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Skipped,
    Cancelled,
}

impl StepState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepState::Succeeded
                | StepState::Failed
                | StepState::TimedOut
                | StepState::Skipped
                | StepState::Cancelled
        )
    }
}

/// Everything known about one step after execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub state: StepState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
    /// The failed dependency this step was skipped for
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped_due_to: Option<String>,
    pub attempts: u32,
    pub elapsed_ms: u64,
}

impl StepRecord {
    fn pending() -> Self {
        Self {
            state: StepState::Pending,
            value: None,
            error: None,
            skipped_due_to: None,
            attempts: 0,
            elapsed_ms: 0,
        }
    }
}

/// Overall result class of a plan execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanOutcome {
    Success,
    Partial,
    Failed,
}

/// Per-plan mutable store of step results and variables
///
/// Owned by exactly one plan execution; reference resolvers see immutable
/// snapshots of the result map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub results: HashMap<String, StepRecord>,
    pub variables: HashMap<String, Value>,
    pub cost: f64,
    pub elapsed_ms: u64,
    pub recursion_depth: u32,
}

impl ExecutionContext {
    pub fn new(variables: HashMap<String, Value>) -> Self {
        Self {
            results: HashMap::new(),
            variables,
            cost: 0.0,
            elapsed_ms: 0,
            recursion_depth: 0,
        }
    }

    pub(crate) fn init_steps(&mut self, plan: &Plan) {
        for step in &plan.steps {
            self.results.insert(step.id.clone(), StepRecord::pending());
        }
    }

    pub fn record(&self, step_id: &str) -> Option<&StepRecord> {
        self.results.get(step_id)
    }

    /// Result value of a succeeded step
    pub fn value(&self, step_id: &str) -> Option<&Value> {
        self.results.get(step_id).and_then(|r| r.value.as_ref())
    }
}

/// What the caller receives: outcome class, the full context, and the
/// rendered synthesis when the plan declared one
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanReport {
    pub request_id: String,
    pub outcome: PlanOutcome,
    pub context: ExecutionContext,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synthesis: Option<String>,
    pub wall_ms: u64,
    pub cost: f64,
}
