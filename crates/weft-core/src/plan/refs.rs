//! Reference substitution
//!
//! Before a step is dispatched its input tree is rewritten: a string that is
//! exactly `step:<id>` (optionally with a dotted path) becomes that step's
//! result value, and `{{variable}}` placeholders are filled from the
//! context's variable map. Resolution failures are validation errors and
//! fail the step without retry.

use serde_json::Value;

use crate::error::{Error, Result};
use crate::plan::ExecutionContext;

/// Rewrite `input` with all references resolved against `ctx`
pub fn resolve_references(input: &Value, ctx: &ExecutionContext) -> Result<Value> {
    match input {
        Value::String(s) => resolve_string(s, ctx),
        Value::Array(items) => {
            let resolved: Result<Vec<Value>> =
                items.iter().map(|v| resolve_references(v, ctx)).collect();
            Ok(Value::Array(resolved?))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), resolve_references(v, ctx)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_string(s: &str, ctx: &ExecutionContext) -> Result<Value> {
    if let Some(rest) = s.strip_prefix("step:") {
        return resolve_step_path(rest, ctx);
    }
    // A string that is exactly one placeholder keeps the variable's type;
    // placeholders embedded in longer text substitute stringified values.
    if let Some(name) = single_placeholder(s) {
        return lookup_variable(name, ctx).cloned();
    }
    if s.contains("{{") {
        return Ok(Value::String(render_placeholders(s, ctx)?));
    }
    Ok(Value::String(s.to_string()))
}

fn single_placeholder(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("{{")?.strip_suffix("}}")?;
    let inner = inner.trim();
    if inner.is_empty() || inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner)
}

fn lookup_variable<'a>(name: &str, ctx: &'a ExecutionContext) -> Result<&'a Value> {
    ctx.variables
        .get(name)
        .ok_or_else(|| Error::Validation(format!("unresolved variable {{{{{name}}}}}")))
}

fn render_placeholders(s: &str, ctx: &ExecutionContext) -> Result<String> {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            out.push_str(&rest[open..]);
            return Ok(out);
        };
        let name = after[..close].trim();
        let value = lookup_variable(name, ctx)?;
        out.push_str(&value_to_text(value));
        rest = &after[close + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Resolve a synthesis-template token: either `step:<id>[.path]` or a
/// variable name
pub(crate) fn resolve_token(token: &str, ctx: &ExecutionContext) -> Result<Value> {
    if let Some(rest) = token.strip_prefix("step:") {
        return resolve_step_path(rest, ctx);
    }
    lookup_variable(token, ctx).cloned()
}

/// Resolve `"<id>"` or `"<id>.<dotted.path>"` against step results
fn resolve_step_path(reference: &str, ctx: &ExecutionContext) -> Result<Value> {
    let (id, path) = match reference.split_once('.') {
        Some((id, path)) => (id, Some(path)),
        None => (reference, None),
    };

    let record = ctx
        .results
        .get(id)
        .ok_or_else(|| Error::Validation(format!("reference to unknown step {id}")))?;
    let value = record.value.as_ref().ok_or_else(|| {
        Error::Validation(format!("reference to step {id} which produced no result"))
    })?;

    let Some(path) = path else {
        return Ok(value.clone());
    };

    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment).ok_or_else(|| {
                Error::Validation(format!("step:{id}.{path}: missing key {segment}"))
            })?,
            Value::Array(items) => {
                let index: usize = segment.parse().map_err(|_| {
                    Error::Validation(format!(
                        "step:{id}.{path}: {segment} is not an array index"
                    ))
                })?;
                items.get(index).ok_or_else(|| {
                    Error::Validation(format!(
                        "step:{id}.{path}: index {index} out of bounds"
                    ))
                })?
            }
            _ => {
                return Err(Error::Validation(format!(
                    "step:{id}.{path}: cannot descend into {segment}"
                )));
            }
        };
    }
    Ok(current.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{StepRecord, StepState};
    use serde_json::json;
    use std::collections::HashMap;

    fn ctx() -> ExecutionContext {
        let mut ctx = ExecutionContext::new(HashMap::from([
            ("name".to_string(), json!("weft")),
            ("count".to_string(), json!(3)),
        ]));
        ctx.results.insert(
            "a".to_string(),
            StepRecord {
                state: StepState::Succeeded,
                value: Some(json!({"n": 3, "items": [{"x": 1}, {"x": 2}]})),
                error: None,
                skipped_due_to: None,
                attempts: 1,
                elapsed_ms: 5,
            },
        );
        ctx
    }

    #[test]
    fn test_whole_step_reference() {
        let out = resolve_references(&json!({"v": "step:a"}), &ctx()).unwrap();
        assert_eq!(out["v"]["n"], json!(3));
    }

    #[test]
    fn test_dotted_path_into_maps_and_arrays() {
        let out = resolve_references(&json!({"v": "step:a.n"}), &ctx()).unwrap();
        assert_eq!(out["v"], json!(3));
        let out = resolve_references(&json!({"v": "step:a.items.1.x"}), &ctx()).unwrap();
        assert_eq!(out["v"], json!(2));
    }

    #[test]
    fn test_missing_step_and_path() {
        assert!(resolve_references(&json!("step:ghost"), &ctx()).is_err());
        assert!(resolve_references(&json!("step:a.missing"), &ctx()).is_err());
        assert!(resolve_references(&json!("step:a.items.9.x"), &ctx()).is_err());
    }

    #[test]
    fn test_variable_placeholders() {
        let out = resolve_references(&json!({"greeting": "hello {{name}}"}), &ctx()).unwrap();
        assert_eq!(out["greeting"], json!("hello weft"));
        // A lone placeholder keeps the variable's JSON type.
        let out = resolve_references(&json!({"c": "{{count}}"}), &ctx()).unwrap();
        assert_eq!(out["c"], json!(3));
    }

    #[test]
    fn test_missing_variable_fails() {
        let err = resolve_references(&json!("{{ghost}}"), &ctx()).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_plain_strings_untouched() {
        let input = json!({"text": "no references here", "n": 7, "b": true});
        assert_eq!(resolve_references(&input, &ctx()).unwrap(), input);
    }

    #[test]
    fn test_nested_structures() {
        let input = json!({"outer": [{"inner": "step:a.n"}, "{{name}}"]});
        let out = resolve_references(&input, &ctx()).unwrap();
        assert_eq!(out["outer"][0]["inner"], json!(3));
        assert_eq!(out["outer"][1], json!("weft"));
    }
}
