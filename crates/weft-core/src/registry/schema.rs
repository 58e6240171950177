//! Parameter schema validation
//!
//! Two checks live here: registration-time self-consistency of a
//! definition's parameter specs, and invocation-time validation of an
//! argument object against those specs. The latter is shared by the plan
//! executor, the sandbox tool bindings, and the remote invoker.

use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::registry::{ParamType, ParameterSpec, ToolDefinition};

/// Check that a definition's parameter specs are self-consistent
pub fn validate_definition(definition: &ToolDefinition) -> Result<()> {
    if definition.name.is_empty() {
        return Err(Error::Validation("tool name must not be empty".into()));
    }
    let mut seen = std::collections::HashSet::new();
    for spec in &definition.parameters {
        if spec.name.is_empty() {
            return Err(Error::Validation(format!(
                "tool {}: parameter name must not be empty",
                definition.name
            )));
        }
        if !seen.insert(spec.name.as_str()) {
            return Err(Error::Validation(format!(
                "tool {}: duplicate parameter {}",
                definition.name, spec.name
            )));
        }
        validate_spec(&definition.name, spec)?;
    }
    Ok(())
}

fn validate_spec(tool: &str, spec: &ParameterSpec) -> Result<()> {
    if let Some(values) = &spec.enum_values {
        if values.is_empty() {
            return Err(Error::Validation(format!(
                "tool {tool}: parameter {} has an empty enum",
                spec.name
            )));
        }
        for value in values {
            if !spec.param_type.matches(value) {
                return Err(Error::Validation(format!(
                    "tool {tool}: enum value {value} does not match type {}",
                    spec.param_type.as_str()
                )));
            }
        }
    }
    if let Some(default) = &spec.default {
        if spec.required {
            return Err(Error::Validation(format!(
                "tool {tool}: required parameter {} cannot carry a default",
                spec.name
            )));
        }
        if !spec.param_type.matches(default) {
            return Err(Error::Validation(format!(
                "tool {tool}: default for {} does not match type {}",
                spec.name,
                spec.param_type.as_str()
            )));
        }
        if let Some(values) = &spec.enum_values
            && !values.contains(default)
        {
            return Err(Error::Validation(format!(
                "tool {tool}: default for {} is not an enum member",
                spec.name
            )));
        }
    }
    if spec.items.is_some() && spec.param_type != ParamType::Array {
        return Err(Error::Validation(format!(
            "tool {tool}: items schema on non-array parameter {}",
            spec.name
        )));
    }
    if spec.properties.is_some() && spec.param_type != ParamType::Object {
        return Err(Error::Validation(format!(
            "tool {tool}: properties schema on non-object parameter {}",
            spec.name
        )));
    }
    Ok(())
}

/// Validate an argument object against parameter specs
///
/// Returns the effective arguments: defaults are filled in for absent
/// optional parameters. Unknown keys are rejected so a planner typo cannot
/// silently vanish into a tool.
pub fn validate_args(specs: &[ParameterSpec], args: &Value) -> Result<Value> {
    let empty = Map::new();
    let object = match args {
        Value::Object(map) => map,
        Value::Null => &empty,
        other => {
            return Err(Error::Validation(format!(
                "arguments must be an object, got {}",
                type_name(other)
            )));
        }
    };

    let known: std::collections::HashMap<&str, &ParameterSpec> =
        specs.iter().map(|s| (s.name.as_str(), s)).collect();
    for key in object.keys() {
        if !known.contains_key(key.as_str()) {
            return Err(Error::Validation(format!("unknown argument {key}")));
        }
    }

    let mut effective = object.clone();
    for spec in specs {
        match object.get(&spec.name) {
            Some(value) => validate_value(spec, value)?,
            None if spec.required => {
                return Err(Error::Validation(format!(
                    "missing required argument {}",
                    spec.name
                )));
            }
            None => {
                if let Some(default) = &spec.default {
                    effective.insert(spec.name.clone(), default.clone());
                }
            }
        }
    }
    Ok(Value::Object(effective))
}

fn validate_value(spec: &ParameterSpec, value: &Value) -> Result<()> {
    if !spec.param_type.matches(value) {
        return Err(Error::Validation(format!(
            "argument {} must be {}, got {}",
            spec.name,
            spec.param_type.as_str(),
            type_name(value)
        )));
    }
    if let Some(values) = &spec.enum_values
        && !values.contains(value)
    {
        return Err(Error::Validation(format!(
            "argument {} must be one of {}",
            spec.name,
            serde_json::to_string(values).unwrap_or_default()
        )));
    }
    if let (Some(items), Value::Array(elements)) = (&spec.items, value) {
        let item_type = items.get("type").and_then(|t| t.as_str());
        if let Some(expected) = item_type.and_then(parse_type) {
            for (i, element) in elements.iter().enumerate() {
                if !expected.matches(element) {
                    return Err(Error::Validation(format!(
                        "argument {}[{i}] must be {}, got {}",
                        spec.name,
                        expected.as_str(),
                        type_name(element)
                    )));
                }
            }
        }
    }
    if let (Some(properties), Value::Object(fields)) = (&spec.properties, value)
        && let Some(property_map) = properties.as_object()
    {
        for (key, schema) in property_map {
            if let Some(field) = fields.get(key) {
                let expected = schema.get("type").and_then(|t| t.as_str()).and_then(parse_type);
                if let Some(expected) = expected
                    && !expected.matches(field)
                {
                    return Err(Error::Validation(format!(
                        "argument {}.{key} must be {}, got {}",
                        spec.name,
                        expected.as_str(),
                        type_name(field)
                    )));
                }
            }
        }
    }
    Ok(())
}

fn parse_type(tag: &str) -> Option<ParamType> {
    match tag {
        "string" => Some(ParamType::String),
        "integer" => Some(ParamType::Integer),
        "number" => Some(ParamType::Number),
        "boolean" => Some(ParamType::Boolean),
        "array" => Some(ParamType::Array),
        "object" => Some(ParamType::Object),
        _ => None,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
