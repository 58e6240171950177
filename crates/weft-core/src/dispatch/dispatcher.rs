//! Bounded parallel fan-out engine
//!
//! Releases up to `max_concurrency` requests at a time, charges cost on
//! completion and checks it before every start, watches wall time, and
//! collapses idempotent duplicates. A single request failing never cancels
//! its siblings; a guardrail tripping cancels everything still pending.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::dispatch::aggregate::{AggregationStrategy, aggregate};
use crate::dispatch::idempotency::{IdempotencyCache, idempotency_cache, idempotency_key};
use crate::dispatch::limits::{DispatchBudget, ExecutionScope, Guardrails, RateLimiter};
use crate::dispatch::{AgentConfig, RequestState, SubAgentRequest, SubAgentRunner, render_template};
use crate::error::{Error, ErrorRecord, Result};

/// Which dispatch-wide guardrail ended the run early
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrippedGuardrail {
    Cost,
    Duration,
}

/// Final state of one request in the dispatch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestReport {
    pub index: usize,
    pub agent: String,
    pub state: RequestState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
    pub cost: f64,
    pub elapsed_ms: u64,
    /// Served from the idempotency cache or an in-dispatch duplicate
    #[serde(default)]
    pub dedup: bool,
}

/// Aggregated decision plus the full success/failure breakdown
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchOutcome {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregated: Option<Value>,
    pub reports: Vec<RequestReport>,
    pub total_cost: f64,
    pub wall_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tripped: Option<TrippedGuardrail>,
}

/// Parallel sub-agent dispatcher
pub struct Dispatcher {
    runner: Arc<dyn SubAgentRunner>,
    idempotency: Arc<IdempotencyCache>,
}

impl Dispatcher {
    pub fn new(runner: Arc<dyn SubAgentRunner>) -> Self {
        Self {
            runner,
            idempotency: Arc::new(idempotency_cache(Duration::from_secs(
                crate::config::defaults::IDEMPOTENCY_TTL_SECS,
            ))),
        }
    }

    /// Share an idempotency cache across dispatchers
    pub fn with_idempotency_cache(mut self, cache: Arc<IdempotencyCache>) -> Self {
        self.idempotency = cache;
        self
    }

    /// Fan out `configs` and aggregate the results
    ///
    /// Returns `Err` only when the recursion guardrail refuses the dispatch
    /// outright; every per-request failure is reported in the outcome.
    pub async fn dispatch(
        &self,
        configs: &[AgentConfig],
        strategy: &AggregationStrategy,
        guardrails: &Guardrails,
        scope: &ExecutionScope,
        cancel: &CancellationToken,
    ) -> Result<DispatchOutcome> {
        if scope.depth >= guardrails.max_recursion_depth {
            return Err(Error::RecursionLimit(format!(
                "depth {} at limit {}",
                scope.depth, guardrails.max_recursion_depth
            )));
        }

        let started = Instant::now();
        let use_idempotency = !guardrails.idempotency_ttl.is_zero();

        // Render every template up front; a bad template fails its own
        // request without touching siblings.
        let mut slots: Vec<Option<RequestReport>> = vec![None; configs.len()];
        let mut prepared: Vec<(usize, SubAgentRequest, String)> = Vec::new();
        for (index, config) in configs.iter().enumerate() {
            match render_template(&config.template, &config.arguments) {
                Ok(prompt) => {
                    let key = config.identity.clone().unwrap_or_else(|| {
                        idempotency_key(&config.name, &prompt, &config.arguments)
                    });
                    prepared.push((
                        index,
                        SubAgentRequest {
                            agent: config.name.clone(),
                            prompt,
                            arguments: config.arguments.clone(),
                            identity: config.identity.clone(),
                        },
                        key,
                    ));
                }
                Err(e) => {
                    if matches!(e, Error::Security(_)) {
                        error!(agent = %config.name, error = %e, "template rejected");
                    }
                    slots[index] = Some(RequestReport {
                        index,
                        agent: config.name.clone(),
                        state: RequestState::Failed,
                        value: None,
                        error: Some(e.to_record()),
                        cost: 0.0,
                        elapsed_ms: 0,
                        dedup: false,
                    });
                }
            }
        }

        // In-dispatch deduplication: later requests with a key already seen
        // become followers of the first and are resolved from its report.
        let mut leaders: Vec<(usize, SubAgentRequest, String)> = Vec::new();
        let mut followers: Vec<(usize, String, usize)> = Vec::new();
        if guardrails.deduplicate {
            let mut seen: std::collections::HashMap<String, usize> =
                std::collections::HashMap::new();
            for (index, request, key) in prepared {
                match seen.get(&key) {
                    Some(&leader_index) => followers.push((index, key, leader_index)),
                    None => {
                        seen.insert(key.clone(), index);
                        leaders.push((index, request, key));
                    }
                }
            }
        } else {
            leaders = prepared;
        }

        let budget = Arc::new(DispatchBudget::new(guardrails.max_cost));
        let tripped: Arc<Mutex<Option<TrippedGuardrail>>> = Arc::new(Mutex::new(None));
        let dispatch_cancel = cancel.child_token();
        let semaphore = Arc::new(Semaphore::new(guardrails.max_concurrency.max(1)));
        let limiter = guardrails
            .rate_limit
            .clone()
            .map(|config| Arc::new(RateLimiter::new(config)));

        let watchdog = guardrails.max_duration.map(|limit| {
            let tripped = tripped.clone();
            let dispatch_cancel = dispatch_cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                warn!("dispatch wall-clock guardrail tripped");
                tripped.lock().get_or_insert(TrippedGuardrail::Duration);
                dispatch_cancel.cancel();
            })
        });

        let mut in_flight: JoinSet<(usize, RequestReport)> = JoinSet::new();
        for (index, request, key) in leaders {
            let runner = self.runner.clone();
            let idempotency = self.idempotency.clone();
            let budget = budget.clone();
            let ancestor = scope.budget.clone();
            let tripped = tripped.clone();
            let dispatch_cancel = dispatch_cancel.clone();
            let semaphore = semaphore.clone();
            let limiter = limiter.clone();
            in_flight.spawn(async move {
                let report = run_request(
                    index,
                    request,
                    key,
                    runner,
                    idempotency,
                    use_idempotency,
                    budget,
                    ancestor,
                    tripped,
                    dispatch_cancel,
                    semaphore,
                    limiter,
                )
                .await;
                (index, report)
            });
        }

        while let Some(joined) = in_flight.join_next().await {
            match joined {
                Ok((index, report)) => slots[index] = Some(report),
                Err(e) => warn!(error = %e, "dispatch task aborted"),
            }
        }
        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }

        // Fan leader results back to their followers.
        for (index, _key, leader_index) in followers {
            let leader = slots[leader_index].clone();
            slots[index] = Some(match leader {
                Some(leader) if leader.state.has_value() => RequestReport {
                    index,
                    agent: leader.agent.clone(),
                    state: RequestState::DedupCached,
                    value: leader.value.clone(),
                    error: None,
                    cost: 0.0,
                    elapsed_ms: 0,
                    dedup: true,
                },
                Some(leader) => RequestReport {
                    index,
                    dedup: true,
                    cost: 0.0,
                    elapsed_ms: 0,
                    ..leader
                },
                None => RequestReport {
                    index,
                    agent: String::new(),
                    state: RequestState::Failed,
                    value: None,
                    error: Some(Error::Internal("dedup leader produced no report".into()).to_record()),
                    cost: 0.0,
                    elapsed_ms: 0,
                    dedup: true,
                },
            });
        }

        let reports: Vec<RequestReport> = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or(RequestReport {
                    index,
                    agent: String::new(),
                    state: RequestState::Failed,
                    value: None,
                    error: Some(Error::Internal("request produced no report".into()).to_record()),
                    cost: 0.0,
                    elapsed_ms: 0,
                    dedup: false,
                })
            })
            .collect();

        let aggregated = aggregate(strategy, &reports)?;
        debug!(
            requests = reports.len(),
            cost = budget.spent(),
            "dispatch finished"
        );

        Ok(DispatchOutcome {
            aggregated,
            reports,
            total_cost: budget.spent(),
            wall_ms: started.elapsed().as_millis() as u64,
            tripped: *tripped.lock(),
        })
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_request(
    index: usize,
    request: SubAgentRequest,
    key: String,
    runner: Arc<dyn SubAgentRunner>,
    idempotency: Arc<IdempotencyCache>,
    use_idempotency: bool,
    budget: Arc<DispatchBudget>,
    ancestor: Arc<DispatchBudget>,
    tripped: Arc<Mutex<Option<TrippedGuardrail>>>,
    dispatch_cancel: CancellationToken,
    semaphore: Arc<Semaphore>,
    limiter: Option<Arc<RateLimiter>>,
) -> RequestReport {
    let started = Instant::now();
    let finish = |state: RequestState, value: Option<Value>, error: Option<Error>, cost: f64, dedup: bool| {
        RequestReport {
            index,
            agent: request.agent.clone(),
            state,
            value,
            error: error.map(|e| e.to_record()),
            cost,
            elapsed_ms: started.elapsed().as_millis() as u64,
            dedup,
        }
    };

    if use_idempotency && let Some(cached) = idempotency.get(&key) {
        return finish(RequestState::DedupCached, Some(cached), None, 0.0, true);
    }

    if let Some(limiter) = &limiter
        && let Err(e) = limiter.acquire(&request.agent).await
    {
        return finish(RequestState::Failed, None, Some(e), 0.0, false);
    }

    // Queued until a slot frees; a guardrail trip while waiting means this
    // request never started.
    let _permit = tokio::select! {
        _ = dispatch_cancel.cancelled() => {
            let (state, error) = unstarted_outcome(*tripped.lock());
            return finish(state, None, Some(error), 0.0, false);
        }
        permit = semaphore.clone().acquire_owned() => permit.ok(),
    };

    // Cost is checked before every start, against this dispatch's budget
    // and the ancestor record shared across nesting levels.
    if let Err(e) = budget.check().and_then(|()| ancestor.check()) {
        return finish(RequestState::Failed, None, Some(e), 0.0, false);
    }

    let outcome = tokio::select! {
        _ = dispatch_cancel.cancelled() => {
            let (state, error) = cancelled_outcome(*tripped.lock());
            return finish(state, None, Some(error), 0.0, false);
        }
        outcome = runner.run(&request, &dispatch_cancel) => outcome,
    };

    match outcome {
        Ok(result) => {
            let local_tripped = budget.charge(result.cost);
            let ancestor_tripped = ancestor.charge(result.cost);
            if local_tripped || ancestor_tripped {
                tripped.lock().get_or_insert(TrippedGuardrail::Cost);
                dispatch_cancel.cancel();
            }
            if use_idempotency {
                idempotency.insert(key, result.value.clone());
            }
            finish(
                RequestState::Succeeded,
                Some(result.value),
                None,
                result.cost,
                false,
            )
        }
        Err(Error::Cancelled) => {
            let (state, error) = cancelled_outcome(*tripped.lock());
            finish(state, None, Some(error), 0.0, false)
        }
        Err(e) => finish(RequestState::Failed, None, Some(e), 0.0, false),
    }
}

fn unstarted_outcome(tripped: Option<TrippedGuardrail>) -> (RequestState, Error) {
    match tripped {
        Some(TrippedGuardrail::Cost) => (
            RequestState::Failed,
            Error::BudgetExceeded("dispatch cost ceiling reached before start".into()),
        ),
        Some(TrippedGuardrail::Duration) => (
            RequestState::TimedOut,
            Error::Transient("dispatch wall-clock budget exhausted".into()),
        ),
        None => (RequestState::Cancelled, Error::Cancelled),
    }
}

fn cancelled_outcome(tripped: Option<TrippedGuardrail>) -> (RequestState, Error) {
    match tripped {
        Some(TrippedGuardrail::Cost) => (
            RequestState::Cancelled,
            Error::BudgetExceeded("cancelled by dispatch cost ceiling".into()),
        ),
        Some(TrippedGuardrail::Duration) => (
            RequestState::TimedOut,
            Error::Transient("dispatch wall-clock budget exhausted".into()),
        ),
        None => (RequestState::Cancelled, Error::Cancelled),
    }
}
