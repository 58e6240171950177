//! Idempotency keys and result cache
//!
//! A request's key is SHA-256 over agent name, rendered prompt, and the
//! canonicalized argument map. Canonicalization sorts object keys at every
//! depth so semantically equal argument maps always hash the same.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::cache::TtlCache;

/// Render a JSON value with object keys sorted at every level
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        other => other.to_string(),
    }
}

/// Stable key over (agent, rendered prompt, canonical args)
pub fn idempotency_key(agent: &str, prompt: &str, arguments: &HashMap<String, Value>) -> String {
    let args_value = Value::Object(
        arguments
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    );
    let mut hasher = Sha256::new();
    hasher.update(agent.as_bytes());
    hasher.update([0]);
    hasher.update(prompt.as_bytes());
    hasher.update([0]);
    hasher.update(canonical_json(&args_value).as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Stored sub-agent results, keyed by idempotency key
pub type IdempotencyCache = TtlCache<String, Value>;

/// Cache with the given TTL; a zero TTL still constructs but the dispatcher
/// skips it entirely
pub fn idempotency_cache(ttl: Duration) -> IdempotencyCache {
    TtlCache::new(Some(ttl))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorts_keys() {
        let a = json!({"b": 1, "a": {"d": 2, "c": 3}});
        let b = json!({"a": {"c": 3, "d": 2}, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(canonical_json(&a), r#"{"a":{"c":3,"d":2},"b":1}"#);
    }

    #[test]
    fn test_key_stable_across_argument_order() {
        let mut args_one = HashMap::new();
        args_one.insert("x".to_string(), json!(1));
        args_one.insert("y".to_string(), json!({"b": 2, "a": 1}));
        let mut args_two = HashMap::new();
        args_two.insert("y".to_string(), json!({"a": 1, "b": 2}));
        args_two.insert("x".to_string(), json!(1));

        assert_eq!(
            idempotency_key("agent", "prompt", &args_one),
            idempotency_key("agent", "prompt", &args_two)
        );
    }

    #[test]
    fn test_key_distinguishes_inputs() {
        let args = HashMap::new();
        let base = idempotency_key("agent", "prompt", &args);
        assert_ne!(base, idempotency_key("other", "prompt", &args));
        assert_ne!(base, idempotency_key("agent", "different", &args));
        let mut with_arg = HashMap::new();
        with_arg.insert("k".to_string(), json!(true));
        assert_ne!(base, idempotency_key("agent", "prompt", &with_arg));
    }
}
