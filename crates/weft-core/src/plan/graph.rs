//! Dependency graph analysis
//!
//! Steps declare dependencies explicitly via `depends_on`; references of the
//! form `step:<id>` inside a step's input imply the rest. Validation rejects
//! duplicate ids, unknown dependencies, and cycles; scheduling groups steps
//! into levels by longest path from a root.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::error::{Error, Result};
use crate::plan::{Plan, Step};

/// All dependencies of a step: declared plus inferred from references
pub fn step_dependencies(step: &Step) -> Vec<String> {
    let mut deps: Vec<String> = step.depends_on.clone();
    let mut seen: HashSet<String> = deps.iter().cloned().collect();
    collect_reference_ids(&step.input, &mut |id| {
        if seen.insert(id.to_string()) {
            deps.push(id.to_string());
        }
    });
    deps
}

fn collect_reference_ids(value: &Value, found: &mut impl FnMut(&str)) {
    match value {
        Value::String(s) => {
            if let Some(rest) = s.strip_prefix("step:") {
                let id = rest.split('.').next().unwrap_or(rest);
                if !id.is_empty() {
                    found(id);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_reference_ids(item, found);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_reference_ids(item, found);
            }
        }
        _ => {}
    }
}

/// Structural validation: unique ids, known dependencies, no cycles, sane
/// retry policies
pub fn validate_plan(plan: &Plan) -> Result<()> {
    let mut ids = HashSet::new();
    for step in &plan.steps {
        if !ids.insert(step.id.as_str()) {
            return Err(Error::Validation(format!(
                "duplicate step id {}",
                step.id
            )));
        }
        if let Some(retry) = &step.retry
            && retry.max_attempts == 0
        {
            return Err(Error::Validation(format!(
                "step {}: max_attempts must be at least 1",
                step.id
            )));
        }
    }

    let deps: HashMap<&str, Vec<String>> = plan
        .steps
        .iter()
        .map(|s| (s.id.as_str(), step_dependencies(s)))
        .collect();

    for (id, step_deps) in &deps {
        for dep in step_deps {
            if !ids.contains(dep.as_str()) {
                return Err(Error::Validation(format!(
                    "step {id} depends on unknown step {dep}"
                )));
            }
        }
    }

    // Depth-first cycle check with a three-color marking.
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    fn visit(
        id: &str,
        deps: &HashMap<&str, Vec<String>>,
        marks: &mut HashMap<String, Mark>,
    ) -> Result<()> {
        match marks.get(id).copied().unwrap_or(Mark::Unvisited) {
            Mark::Done => return Ok(()),
            Mark::InProgress => {
                return Err(Error::Validation(format!(
                    "dependency cycle involving step {id}"
                )));
            }
            Mark::Unvisited => {}
        }
        marks.insert(id.to_string(), Mark::InProgress);
        if let Some(step_deps) = deps.get(id) {
            for dep in step_deps {
                visit(dep, deps, marks)?;
            }
        }
        marks.insert(id.to_string(), Mark::Done);
        Ok(())
    }

    let mut marks = HashMap::new();
    for step in &plan.steps {
        visit(&step.id, &deps, &mut marks)?;
    }
    Ok(())
}

/// Group step indices into execution levels by longest path from a root
///
/// Level N only contains steps whose longest dependency chain has length N;
/// all steps in one level may run concurrently.
pub fn execution_levels(plan: &Plan) -> Vec<Vec<usize>> {
    let index: HashMap<&str, usize> = plan
        .steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();
    let deps: Vec<Vec<String>> = plan.steps.iter().map(step_dependencies).collect();

    fn depth(
        i: usize,
        deps: &[Vec<String>],
        index: &HashMap<&str, usize>,
        memo: &mut Vec<Option<usize>>,
    ) -> usize {
        if let Some(d) = memo[i] {
            return d;
        }
        let d = deps[i]
            .iter()
            .filter_map(|dep| index.get(dep.as_str()))
            .map(|&j| depth(j, deps, index, memo) + 1)
            .max()
            .unwrap_or(0);
        memo[i] = Some(d);
        d
    }

    let mut memo = vec![None; plan.steps.len()];
    let mut levels: Vec<Vec<usize>> = Vec::new();
    for i in 0..plan.steps.len() {
        let d = depth(i, &deps, &index, &mut memo);
        while levels.len() <= d {
            levels.push(Vec::new());
        }
        levels[d].push(i);
    }
    levels
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(id: &str, input: Value) -> Step {
        Step::new(id, "tool", input)
    }

    #[test]
    fn test_inferred_dependencies_from_references() {
        let s = step("b", json!({"v": "step:a.n", "w": ["step:c"], "x": {"y": "step:a"}}));
        let mut deps = step_dependencies(&s);
        deps.sort();
        assert_eq!(deps, vec!["a", "c"]);
    }

    #[test]
    fn test_explicit_and_inferred_deduplicated() {
        let s = Step::new("b", "tool", json!({"v": "step:a"})).with_dependency("a");
        assert_eq!(step_dependencies(&s), vec!["a"]);
    }

    #[test]
    fn test_cycle_detected() {
        let plan = Plan::new("req")
            .with_step(step("a", json!({"v": "step:b"})))
            .with_step(step("b", json!({"v": "step:a"})));
        let err = validate_plan(&plan).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_self_cycle_detected() {
        let plan = Plan::new("req").with_step(step("a", json!({"v": "step:a"})));
        assert!(validate_plan(&plan).is_err());
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let plan = Plan::new("req").with_step(step("a", json!({"v": "step:ghost"})));
        let err = validate_plan(&plan).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_levels_by_longest_path() {
        // a -> b -> d, a -> c, e isolated
        let plan = Plan::new("req")
            .with_step(step("a", json!({})))
            .with_step(step("b", json!({"v": "step:a"})))
            .with_step(step("c", json!({"v": "step:a"})))
            .with_step(step("d", json!({"v": "step:b", "w": "step:c"})))
            .with_step(step("e", json!({})));
        validate_plan(&plan).unwrap();
        let levels = execution_levels(&plan);
        assert_eq!(levels.len(), 3);
        assert_eq!(levels[0], vec![0, 4]); // a, e
        assert_eq!(levels[1], vec![1, 2]); // b, c
        assert_eq!(levels[2], vec![3]); // d
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let plan = Plan::new("req").with_step(Step::new("a", "t", json!({})).with_retry(0, 10));
        assert!(validate_plan(&plan).is_err());
    }
}
