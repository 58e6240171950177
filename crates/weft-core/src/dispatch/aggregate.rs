//! Aggregation strategies
//!
//! A strategy reduces the per-request breakdown to a single decision value.
//! Only value-bearing results feed the reduction, but `collect_all`
//! preserves every input slot so callers can see cancelled and failed
//! requests in position.

use std::sync::Arc;

use serde_json::{Value, json};

use crate::dispatch::RequestReport;
use crate::dispatch::idempotency::canonical_json;
use crate::error::{Error, Result};

/// Caller-supplied reducer over the successful result values
pub type CustomReducer = Arc<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>;

#[derive(Clone)]
pub enum AggregationStrategy {
    /// Full per-request list in input order; non-successes keep their slot
    /// with a status and no value
    CollectAll,
    /// Most frequent canonicalized result wins; ties go to the first seen
    MajorityVote,
    /// Result with the highest numeric `score` field wins
    BestScore,
    Custom(CustomReducer),
}

impl std::fmt::Debug for AggregationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AggregationStrategy::CollectAll => write!(f, "CollectAll"),
            AggregationStrategy::MajorityVote => write!(f, "MajorityVote"),
            AggregationStrategy::BestScore => write!(f, "BestScore"),
            AggregationStrategy::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Reduce the finished reports to an aggregate value
///
/// Returns `None` when no result carries a value (nothing to aggregate).
pub fn aggregate(
    strategy: &AggregationStrategy,
    reports: &[RequestReport],
) -> Result<Option<Value>> {
    let successes: Vec<&Value> = reports
        .iter()
        .filter(|r| r.state.has_value())
        .filter_map(|r| r.value.as_ref())
        .collect();

    match strategy {
        AggregationStrategy::CollectAll => {
            let entries: Vec<Value> = reports
                .iter()
                .map(|r| {
                    json!({
                        "status": r.state,
                        "value": r.value.clone().unwrap_or(Value::Null),
                    })
                })
                .collect();
            Ok(Some(Value::Array(entries)))
        }
        AggregationStrategy::MajorityVote => {
            if successes.is_empty() {
                return Ok(None);
            }
            // Count by canonical form, keeping the first-seen original for
            // the winner so object key order cannot split a vote.
            let mut counts: Vec<(String, &Value, usize)> = Vec::new();
            for value in &successes {
                let form = canonical_json(value);
                match counts.iter_mut().find(|(f, _, _)| *f == form) {
                    Some((_, _, n)) => *n += 1,
                    None => counts.push((form, value, 1)),
                }
            }
            // Strictly-greater comparison keeps the first-seen entry on ties.
            let mut winner = 0;
            for (i, entry) in counts.iter().enumerate() {
                if entry.2 > counts[winner].2 {
                    winner = i;
                }
            }
            Ok(Some(json!({
                "value": counts[winner].1,
                "votes": counts[winner].2,
            })))
        }
        AggregationStrategy::BestScore => {
            if successes.is_empty() {
                return Ok(None);
            }
            let mut best: Option<(f64, &Value)> = None;
            for value in &successes {
                let score = value
                    .get("score")
                    .and_then(|s| s.as_f64())
                    .ok_or_else(|| {
                        Error::Validation(
                            "best_score aggregation requires a numeric score field".into(),
                        )
                    })?;
                let better = match best {
                    Some((current, _)) => score > current,
                    None => true,
                };
                if better {
                    best = Some((score, value));
                }
            }
            Ok(best.map(|(_, v)| v.clone()))
        }
        AggregationStrategy::Custom(reducer) => {
            let owned: Vec<Value> = successes.into_iter().cloned().collect();
            reducer(&owned).map(Some)
        }
    }
}
