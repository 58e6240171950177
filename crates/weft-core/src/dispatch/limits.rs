//! Dispatch guardrails: cost budgets, rate limits, recursion scope
//!
//! A [`DispatchBudget`] is shared across nesting levels through the ambient
//! [`ExecutionScope`], so a child dispatch spends from the same record as
//! its ancestors. Rate limiting is a keyed token bucket with a bounded
//! grace wait.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::defaults;
use crate::error::{Error, Result};

/// Limit bundle for one dispatch call
#[derive(Debug, Clone)]
pub struct Guardrails {
    /// Requests in flight simultaneously
    pub max_concurrency: usize,
    /// Cumulative cost ceiling across this dispatch, in currency units
    pub max_cost: Option<f64>,
    /// Wall-clock ceiling for the whole dispatch
    pub max_duration: Option<Duration>,
    /// Per-agent token bucket, when set
    pub rate_limit: Option<RateLimitConfig>,
    /// Ancestor-dispatch count before RecursionLimit
    pub max_recursion_depth: u32,
    /// Idempotency cache TTL; zero disables caching
    pub idempotency_ttl: Duration,
    /// Collapse identical requests within one dispatch to one invocation
    pub deduplicate: bool,
}

impl Default for Guardrails {
    fn default() -> Self {
        Self {
            max_concurrency: defaults::MAX_CONCURRENCY,
            max_cost: None,
            max_duration: None,
            rate_limit: None,
            max_recursion_depth: defaults::MAX_RECURSION_DEPTH,
            idempotency_ttl: Duration::from_secs(defaults::IDEMPOTENCY_TTL_SECS),
            deduplicate: false,
        }
    }
}

/// Token-bucket settings: `capacity` requests per `window`, with callers
/// willing to wait up to `grace` for a token
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub window: Duration,
    pub grace: Duration,
}

struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(config: &RateLimitConfig) -> Self {
        Self {
            tokens: config.capacity as f64,
            capacity: config.capacity as f64,
            refill_per_sec: config.capacity as f64 / config.window.as_secs_f64(),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
    }

    fn try_consume(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn retry_after(&mut self) -> Duration {
        self.refill();
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.refill_per_sec)
        }
    }
}

/// Keyed token buckets shared across a dispatch
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Take one token for `key`, waiting up to the configured grace
    pub async fn acquire(&self, key: &str) -> Result<()> {
        let deadline = Instant::now() + self.config.grace;
        loop {
            let wait = {
                let mut buckets = self.buckets.lock();
                let bucket = buckets
                    .entry(key.to_string())
                    .or_insert_with(|| TokenBucket::new(&self.config));
                if bucket.try_consume() {
                    return Ok(());
                }
                bucket.retry_after()
            };
            let now = Instant::now();
            if now + wait > deadline {
                return Err(Error::RateLimited(format!("key {key}")));
            }
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }
}

/// Shared cost record for one dispatch tree
///
/// Charged on completion; checked before each attempt. The overshoot is
/// bounded by whatever was in flight when the ceiling was crossed.
#[derive(Debug)]
pub struct DispatchBudget {
    limit: Option<f64>,
    spent: Mutex<f64>,
}

impl DispatchBudget {
    pub fn new(limit: Option<f64>) -> Self {
        Self {
            limit,
            spent: Mutex::new(0.0),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None)
    }

    /// Refuse the next attempt once the ceiling is reached
    pub fn check(&self) -> Result<()> {
        if let Some(limit) = self.limit {
            let spent = *self.spent.lock();
            if spent >= limit {
                return Err(Error::BudgetExceeded(format!(
                    "spent {spent:.2} of {limit:.2}"
                )));
            }
        }
        Ok(())
    }

    /// Record a completed request's cost; returns true when the ceiling is
    /// now reached
    pub fn charge(&self, cost: f64) -> bool {
        let mut spent = self.spent.lock();
        *spent += cost;
        self.limit.is_some_and(|limit| *spent >= limit)
    }

    pub fn spent(&self) -> f64 {
        *self.spent.lock()
    }
}

/// Ambient dispatch context: recursion depth plus the budget record shared
/// with every ancestor dispatch
#[derive(Debug, Clone)]
pub struct ExecutionScope {
    pub depth: u32,
    pub budget: Arc<DispatchBudget>,
}

impl ExecutionScope {
    pub fn root() -> Self {
        Self {
            depth: 0,
            budget: Arc::new(DispatchBudget::unlimited()),
        }
    }

    pub fn with_budget(budget: Arc<DispatchBudget>) -> Self {
        Self { depth: 0, budget }
    }

    /// Scope passed to a child dispatch: one level deeper, same budget
    pub fn child(&self) -> Self {
        Self {
            depth: self.depth + 1,
            budget: self.budget.clone(),
        }
    }
}
