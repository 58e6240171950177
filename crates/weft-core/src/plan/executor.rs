//! Plan executor
//!
//! Drives a validated plan level by level: every step in a level is
//! dispatched before any step of the next level starts. A failed step marks
//! its dependents skipped while independent branches keep running. The full
//! execution context is returned whatever the outcome.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ExecutorConfig;
use crate::error::{Error, Result};
use crate::invoke::ToolInvoker;
use crate::plan::{
    ExecutionContext, Plan, PlanOutcome, PlanReport, Step, StepRecord, StepState, graph, refs,
};

/// Executes plans against a tool invoker
pub struct PlanExecutor {
    invoker: Arc<ToolInvoker>,
    config: ExecutorConfig,
}

impl PlanExecutor {
    pub fn new(invoker: Arc<ToolInvoker>, config: ExecutorConfig) -> Self {
        Self { invoker, config }
    }

    /// Execute `plan` to completion or failure
    ///
    /// Returns `Err` only for a structurally invalid plan; per-step failures
    /// are reported inside the [`PlanReport`].
    pub async fn execute(
        &self,
        plan: &Plan,
        variables: HashMap<String, Value>,
        cancel: CancellationToken,
    ) -> Result<PlanReport> {
        graph::validate_plan(plan)?;
        let levels = graph::execution_levels(plan);

        let mut ctx = ExecutionContext::new(variables);
        ctx.init_steps(plan);

        let started = Instant::now();
        let deadline = self.config.plan_budget().map(|budget| started + budget);
        let semaphore = self
            .config
            .max_in_flight
            .map(|n| Arc::new(Semaphore::new(n)));

        for level in &levels {
            if cancel.is_cancelled() {
                self.mark_unfinished_cancelled(&mut ctx);
                break;
            }

            let mut in_flight: JoinSet<(String, StepRecord)> = JoinSet::new();
            for &index in level {
                let step = &plan.steps[index];
                if let Some(blocker) = self.blocking_dependency(step, &ctx) {
                    if let Some(record) = ctx.results.get_mut(&step.id) {
                        record.state = StepState::Skipped;
                        record.skipped_due_to = Some(blocker.clone());
                    }
                    debug!(step = %step.id, due_to = %blocker, "step skipped");
                    continue;
                }

                if let Some(record) = ctx.results.get_mut(&step.id) {
                    record.state = StepState::Running;
                }

                let invoker = self.invoker.clone();
                let step = step.clone();
                let snapshot = ctx.clone();
                let cancel = cancel.clone();
                let semaphore = semaphore.clone();
                let default_timeout = self.config.step_timeout();
                in_flight.spawn(async move {
                    let id = step.id.clone();
                    let record = run_step(
                        invoker,
                        &step,
                        &snapshot,
                        default_timeout,
                        deadline,
                        semaphore,
                        cancel,
                    )
                    .await;
                    (id, record)
                });
            }

            while let Some(joined) = in_flight.join_next().await {
                match joined {
                    Ok((id, record)) => {
                        ctx.cost += record.attempts as f64 * self.config.attempt_cost;
                        ctx.results.insert(id, record);
                    }
                    Err(e) => {
                        warn!(error = %e, "step task aborted");
                    }
                }
            }
        }

        ctx.elapsed_ms = started.elapsed().as_millis() as u64;

        let outcome = plan_outcome(plan, &ctx);
        let synthesis = plan
            .final_synthesis
            .as_ref()
            .map(|s| render_synthesis(&s.prompt_template, &ctx));

        Ok(PlanReport {
            request_id: plan.request_id.clone(),
            outcome,
            wall_ms: ctx.elapsed_ms,
            cost: ctx.cost,
            synthesis,
            context: ctx,
        })
    }

    /// First dependency that did not succeed, if any
    fn blocking_dependency(&self, step: &Step, ctx: &ExecutionContext) -> Option<String> {
        graph::step_dependencies(step)
            .into_iter()
            .find(|dep| {
                ctx.results
                    .get(dep)
                    .map(|r| r.state != StepState::Succeeded)
                    .unwrap_or(true)
            })
    }

    fn mark_unfinished_cancelled(&self, ctx: &mut ExecutionContext) {
        for record in ctx.results.values_mut() {
            if !record.state.is_terminal() {
                record.state = StepState::Cancelled;
                record.error = Some(Error::Cancelled.to_record());
            }
        }
    }
}

fn plan_outcome(plan: &Plan, ctx: &ExecutionContext) -> PlanOutcome {
    if plan.steps.is_empty() {
        return PlanOutcome::Success;
    }
    let succeeded = ctx
        .results
        .values()
        .filter(|r| r.state == StepState::Succeeded)
        .count();
    if succeeded == plan.steps.len() {
        PlanOutcome::Success
    } else if succeeded > 0 {
        PlanOutcome::Partial
    } else {
        PlanOutcome::Failed
    }
}

async fn run_step(
    invoker: Arc<ToolInvoker>,
    step: &Step,
    snapshot: &ExecutionContext,
    default_timeout: Duration,
    deadline: Option<Instant>,
    semaphore: Option<Arc<Semaphore>>,
    cancel: CancellationToken,
) -> StepRecord {
    let started = Instant::now();
    let timeout = step
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(default_timeout);
    let max_attempts = step.retry.as_ref().map(|r| r.max_attempts).unwrap_or(1);
    let backoff = Duration::from_millis(step.retry.as_ref().map(|r| r.backoff_ms).unwrap_or(0));

    // Reference resolution happens once, against an immutable snapshot of
    // the results so far. A miss fails the step with no retry.
    let input = match refs::resolve_references(&step.input, snapshot) {
        Ok(input) => input,
        Err(e) => {
            return StepRecord {
                state: StepState::Failed,
                value: None,
                error: Some(e.to_record()),
                skipped_due_to: None,
                attempts: 0,
                elapsed_ms: started.elapsed().as_millis() as u64,
            };
        }
    };

    let _permit = match &semaphore {
        Some(semaphore) => match semaphore.clone().acquire_owned().await {
            Ok(permit) => Some(permit),
            Err(_) => None,
        },
        None => None,
    };

    let mut attempts = 0;
    loop {
        attempts += 1;

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                return finish(StepState::Cancelled, None, Some(Error::Cancelled), attempts, started);
            }
            result = tokio::time::timeout(timeout, invoker.invoke(&step.tool, input.clone(), &cancel)) => result,
        };

        match outcome {
            Ok(Ok(value)) => {
                return finish(StepState::Succeeded, Some(value), None, attempts, started);
            }
            Ok(Err(Error::Cancelled)) => {
                return finish(StepState::Cancelled, None, Some(Error::Cancelled), attempts, started);
            }
            Ok(Err(e)) if e.is_retryable() && attempts < max_attempts => {
                debug!(step = %step.id, attempt = attempts, error = %e, "retrying after transient failure");
                tokio::time::sleep(backoff).await;
            }
            Ok(Err(e)) => {
                return finish(StepState::Failed, None, Some(e), attempts, started);
            }
            Err(_) => {
                // A timeout is transient until the plan-level wall budget is
                // spent, after which it is terminal.
                let budget_spent = deadline.is_some_and(|d| Instant::now() >= d);
                if !budget_spent && attempts < max_attempts {
                    debug!(step = %step.id, attempt = attempts, "retrying after step timeout");
                    tokio::time::sleep(backoff).await;
                    continue;
                }
                let error = Error::Transient(format!(
                    "step {} timed out after {}ms",
                    step.id,
                    timeout.as_millis()
                ));
                return finish(StepState::TimedOut, None, Some(error), attempts, started);
            }
        }
    }
}

fn finish(
    state: StepState,
    value: Option<Value>,
    error: Option<Error>,
    attempts: u32,
    started: Instant,
) -> StepRecord {
    StepRecord {
        state,
        value,
        error: error.map(|e| e.to_record()),
        skipped_due_to: None,
        attempts,
        elapsed_ms: started.elapsed().as_millis() as u64,
    }
}

/// Render a synthesis template over the finished context
///
/// `{{step:<id>[.path]}}` and `{{variable}}` tokens are replaced by their
/// values; tokens that cannot resolve (for instance because the step failed)
/// become explicit `[unresolved: ...]` markers rather than errors, since
/// synthesis runs regardless of plan outcome.
pub fn render_synthesis(template: &str, ctx: &ExecutionContext) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            out.push_str(&rest[open..]);
            return out;
        };
        let token = after[..close].trim();
        match refs::resolve_token(token, ctx) {
            Ok(Value::String(s)) => out.push_str(&s),
            Ok(other) => out.push_str(&other.to_string()),
            Err(_) => {
                out.push_str("[unresolved: ");
                out.push_str(token);
                out.push(']');
            }
        }
        rest = &after[close + 2..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoke::NativeTool;
    use crate::invoke::testing::{ConstTool, DoubleTool};
    use crate::registry::{ParamType, ParameterSpec, ToolRegistry};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    /// Fails with a transient error until the configured attempt succeeds
    struct FlakyTool {
        succeed_on: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl NativeTool for FlakyTool {
        fn name(&self) -> &str {
            "flaky"
        }
        fn description(&self) -> &str {
            "Fail transiently, then succeed"
        }
        fn parameters(&self) -> Vec<ParameterSpec> {
            Vec::new()
        }
        async fn call(&self, _args: Value) -> Result<Value> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call < self.succeed_on {
                Err(Error::Transient("remote 503".into()))
            } else {
                Ok(json!({"ok": true, "call": call}))
            }
        }
    }

    /// Always fails permanently
    struct BrokenTool;

    #[async_trait]
    impl NativeTool for BrokenTool {
        fn name(&self) -> &str {
            "broken"
        }
        fn description(&self) -> &str {
            "Always fail"
        }
        fn parameters(&self) -> Vec<ParameterSpec> {
            Vec::new()
        }
        async fn call(&self, _args: Value) -> Result<Value> {
            Err(Error::Validation("bad tool".into()))
        }
    }

    /// Waits on a shared barrier; completes only when `n` calls overlap
    struct BarrierTool {
        barrier: Arc<tokio::sync::Barrier>,
    }

    #[async_trait]
    impl NativeTool for BarrierTool {
        fn name(&self) -> &str {
            "rendezvous"
        }
        fn description(&self) -> &str {
            "Wait for peers"
        }
        fn parameters(&self) -> Vec<ParameterSpec> {
            Vec::new()
        }
        async fn call(&self, _args: Value) -> Result<Value> {
            self.barrier.wait().await;
            Ok(json!({"met": true}))
        }
    }

    /// Sleeps long enough to trip a short step timeout
    struct SlowTool;

    #[async_trait]
    impl NativeTool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "Sleep"
        }
        fn parameters(&self) -> Vec<ParameterSpec> {
            Vec::new()
        }
        async fn call(&self, _args: Value) -> Result<Value> {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(json!({"late": true}))
        }
    }

    /// Tracks the peak number of concurrent calls
    struct GaugeTool {
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl NativeTool for GaugeTool {
        fn name(&self) -> &str {
            "gauge"
        }
        fn description(&self) -> &str {
            "Track concurrency"
        }
        fn parameters(&self) -> Vec<ParameterSpec> {
            Vec::new()
        }
        async fn call(&self, _args: Value) -> Result<Value> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(json!({}))
        }
    }

    fn executor_with(tools: Vec<Arc<dyn NativeTool>>, config: ExecutorConfig) -> PlanExecutor {
        let mut registry = ToolRegistry::new("test");
        for tool in tools {
            registry.register_native(tool).unwrap();
        }
        PlanExecutor::new(Arc::new(ToolInvoker::new(Arc::new(registry))), config)
    }

    #[tokio::test]
    async fn test_linear_chain() {
        let executor = executor_with(
            vec![
                Arc::new(ConstTool {
                    name: "three".into(),
                    value: 3,
                }),
                Arc::new(DoubleTool),
            ],
            ExecutorConfig::default(),
        );
        let plan = Plan::new("req")
            .with_step(Step::new("a", "three", json!({})))
            .with_step(Step::new("b", "double", json!({"v": "step:a.n"})));

        let report = executor
            .execute(&plan, HashMap::new(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.outcome, PlanOutcome::Success);
        assert_eq!(report.context.record("a").unwrap().state, StepState::Succeeded);
        assert_eq!(report.context.record("b").unwrap().state, StepState::Succeeded);
        assert_eq!(report.context.value("b").unwrap()["v"], json!(6));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fan_out_runs_concurrently() {
        let barrier = Arc::new(tokio::sync::Barrier::new(3));
        let executor = executor_with(
            vec![Arc::new(BarrierTool { barrier })],
            ExecutorConfig::default(),
        );
        let plan = Plan::new("req")
            .with_step(Step::new("x", "rendezvous", json!({})))
            .with_step(Step::new("y", "rendezvous", json!({})))
            .with_step(Step::new("z", "rendezvous", json!({})));

        // The barrier only releases when all three steps overlap; a
        // serialized executor would hang here.
        let report = tokio::time::timeout(
            Duration::from_secs(5),
            executor.execute(&plan, HashMap::new(), CancellationToken::new()),
        )
        .await
        .expect("fan-out must overlap")
        .unwrap();

        assert_eq!(report.outcome, PlanOutcome::Success);
        for id in ["x", "y", "z"] {
            assert_eq!(report.context.record(id).unwrap().state, StepState::Succeeded);
        }
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_independent_branch() {
        let executor = executor_with(
            vec![
                Arc::new(ConstTool {
                    name: "ok".into(),
                    value: 1,
                }),
                Arc::new(BrokenTool),
                Arc::new(DoubleTool),
            ],
            ExecutorConfig::default(),
        );
        // a -> b (fails), c -> d: the c/d branch is unaffected.
        let plan = Plan::new("req")
            .with_step(Step::new("a", "ok", json!({})))
            .with_step(Step::new("b", "broken", json!({})).with_dependency("a"))
            .with_step(Step::new("c", "ok", json!({})))
            .with_step(Step::new("d", "double", json!({"v": "step:c.n"})));

        let report = executor
            .execute(&plan, HashMap::new(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.outcome, PlanOutcome::Partial);
        assert_eq!(report.context.record("a").unwrap().state, StepState::Succeeded);
        assert_eq!(report.context.record("b").unwrap().state, StepState::Failed);
        assert_eq!(report.context.record("c").unwrap().state, StepState::Succeeded);
        assert_eq!(report.context.record("d").unwrap().state, StepState::Succeeded);
    }

    #[tokio::test]
    async fn test_dependents_of_failure_are_skipped() {
        let executor = executor_with(
            vec![Arc::new(BrokenTool), Arc::new(DoubleTool)],
            ExecutorConfig::default(),
        );
        let plan = Plan::new("req")
            .with_step(Step::new("a", "broken", json!({})))
            .with_step(Step::new("b", "double", json!({"v": "step:a.n"})));

        let report = executor
            .execute(&plan, HashMap::new(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.outcome, PlanOutcome::Failed);
        let b = report.context.record("b").unwrap();
        assert_eq!(b.state, StepState::Skipped);
        assert_eq!(b.skipped_due_to.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_retry_on_transient_until_success() {
        let executor = executor_with(
            vec![Arc::new(FlakyTool {
                succeed_on: 3,
                calls: AtomicU32::new(0),
            })],
            ExecutorConfig::default(),
        );
        let plan =
            Plan::new("req").with_step(Step::new("a", "flaky", json!({})).with_retry(3, 1));

        let report = executor
            .execute(&plan, HashMap::new(), CancellationToken::new())
            .await
            .unwrap();

        let a = report.context.record("a").unwrap();
        assert_eq!(a.state, StepState::Succeeded);
        assert_eq!(a.attempts, 3);
        assert_eq!(report.cost, 3.0); // one unit per attempt
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let executor = executor_with(vec![Arc::new(BrokenTool)], ExecutorConfig::default());
        let plan =
            Plan::new("req").with_step(Step::new("a", "broken", json!({})).with_retry(5, 1));

        let report = executor
            .execute(&plan, HashMap::new(), CancellationToken::new())
            .await
            .unwrap();

        let a = report.context.record("a").unwrap();
        assert_eq!(a.state, StepState::Failed);
        assert_eq!(a.attempts, 1);
    }

    #[tokio::test]
    async fn test_reference_error_fails_without_invocation() {
        let executor = executor_with(vec![Arc::new(DoubleTool)], ExecutorConfig::default());
        // b references a path a's result does not contain
        let plan = Plan::new("req")
            .with_step(Step::new("a", "double", json!({"v": 1})))
            .with_step(Step::new("b", "double", json!({"v": "step:a.missing"})).with_retry(3, 1));

        let report = executor
            .execute(&plan, HashMap::new(), CancellationToken::new())
            .await
            .unwrap();

        let b = report.context.record("b").unwrap();
        assert_eq!(b.state, StepState::Failed);
        assert_eq!(b.attempts, 0); // never dispatched
        assert_eq!(
            b.error.as_ref().unwrap().kind,
            crate::error::ErrorKind::Validation
        );
    }

    #[tokio::test]
    async fn test_step_timeout() {
        let executor = executor_with(vec![Arc::new(SlowTool)], ExecutorConfig::default());
        let plan =
            Plan::new("req").with_step(Step::new("a", "slow", json!({})).with_timeout_ms(50));

        let report = executor
            .execute(&plan, HashMap::new(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.context.record("a").unwrap().state, StepState::TimedOut);
        assert_eq!(report.outcome, PlanOutcome::Failed);
    }

    #[tokio::test]
    async fn test_timeout_terminal_once_plan_budget_spent() {
        // With the plan wall budget already gone, a step timeout must not
        // retry even though attempts remain.
        let executor = executor_with(
            vec![Arc::new(SlowTool)],
            ExecutorConfig {
                plan_budget_ms: Some(10),
                ..ExecutorConfig::default()
            },
        );
        let plan = Plan::new("req").with_step(
            Step::new("a", "slow", json!({}))
                .with_timeout_ms(60)
                .with_retry(3, 1),
        );

        let report = executor
            .execute(&plan, HashMap::new(), CancellationToken::new())
            .await
            .unwrap();

        let a = report.context.record("a").unwrap();
        assert_eq!(a.state, StepState::TimedOut);
        assert_eq!(a.attempts, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_max_in_flight_bounds_concurrency() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let executor = executor_with(
            vec![Arc::new(GaugeTool {
                current: current.clone(),
                peak: peak.clone(),
            })],
            ExecutorConfig {
                max_in_flight: Some(2),
                ..ExecutorConfig::default()
            },
        );
        let mut plan = Plan::new("req");
        for i in 0..6 {
            plan = plan.with_step(Step::new(format!("s{i}"), "gauge", json!({})));
        }

        let report = executor
            .execute(&plan, HashMap::new(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.outcome, PlanOutcome::Success);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_every_step_gets_exactly_one_status() {
        let executor = executor_with(
            vec![
                Arc::new(ConstTool {
                    name: "ok".into(),
                    value: 1,
                }),
                Arc::new(BrokenTool),
            ],
            ExecutorConfig::default(),
        );
        let plan = Plan::new("req")
            .with_step(Step::new("a", "ok", json!({})))
            .with_step(Step::new("b", "broken", json!({})))
            .with_step(Step::new("c", "ok", json!({})).with_dependency("b"));

        let report = executor
            .execute(&plan, HashMap::new(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.context.results.len(), 3);
        for record in report.context.results.values() {
            assert!(record.state.is_terminal());
        }
    }

    #[tokio::test]
    async fn test_synthesis_rendered_with_context() {
        let executor = executor_with(
            vec![Arc::new(ConstTool {
                name: "three".into(),
                value: 3,
            })],
            ExecutorConfig::default(),
        );
        let plan = Plan::new("req")
            .with_step(Step::new("a", "three", json!({})))
            .with_synthesis("n was {{step:a.n}}; user is {{user}}; {{step:ghost}}");

        let report = executor
            .execute(
                &plan,
                HashMap::from([("user".to_string(), json!("ada"))]),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(
            report.synthesis.as_deref(),
            Some("n was 3; user is ada; [unresolved: step:ghost]")
        );
    }

    #[tokio::test]
    async fn test_cancellation_reports_cancelled() {
        let executor = executor_with(vec![Arc::new(SlowTool)], ExecutorConfig::default());
        let plan = Plan::new("req").with_step(Step::new("a", "slow", json!({})));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let report = executor.execute(&plan, HashMap::new(), cancel).await.unwrap();
        assert_eq!(report.context.record("a").unwrap().state, StepState::Cancelled);
    }
}
