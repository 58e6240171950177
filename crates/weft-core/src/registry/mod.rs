//! Tool registry and catalog
//!
//! The registry is the canonical set of invocable tools. Registration is
//! append-only: the only way to remove a tool is to build a new registry.
//! [`ToolRegistry::snapshot`] freezes the current contents into an immutable
//! [`ToolCatalog`] whose content hash doubles as a cache key downstream.

pub mod schema;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::invoke::NativeTool;

/// Invocation kind of a tool, a closed set with stable wire tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Native,
    Remote,
    SandboxedCode,
    SubAgent,
}

impl ToolKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolKind::Native => "native",
            ToolKind::Remote => "remote",
            ToolKind::SandboxedCode => "sandboxed_code",
            ToolKind::SubAgent => "sub_agent",
        }
    }
}

/// JSON-Schema parameter types accepted by tool definitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    pub fn as_str(self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
        }
    }

    /// Whether a JSON value conforms to this type
    pub fn matches(self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Integer => {
                value.is_i64()
                    || value.is_u64()
                    || value.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Array => value.is_array(),
            ParamType::Object => value.is_object(),
        }
    }
}

/// One parameter of a tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
    /// Allowed values, when the parameter is an enumeration
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
    /// Applied when an optional parameter is absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Nested property schema for object parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<Value>,
    /// Item schema for array parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Value>,
}

impl ParameterSpec {
    pub fn new(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: false,
            description: String::new(),
            enum_values: None,
            default: None,
            properties: None,
            items: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_enum(mut self, values: Vec<Value>) -> Self {
        self.enum_values = Some(values);
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_items(mut self, items: Value) -> Self {
        self.items = Some(items);
        self
    }

    pub fn with_properties(mut self, properties: Value) -> Self {
        self.properties = Some(properties);
        self
    }
}

/// A registered tool: identity, kind, and typed parameter surface
///
/// Immutable once registered; catalogs version over the sorted set of
/// `(name, kind, parameter signature)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub kind: ToolKind,
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub returns: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub examples: Vec<Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, kind: ToolKind, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            description: description.into(),
            parameters: Vec::new(),
            returns: None,
            domain: None,
            examples: Vec::new(),
            metadata: Map::new(),
        }
    }

    pub fn with_parameter(mut self, parameter: ParameterSpec) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn with_returns(mut self, returns: Value) -> Self {
        self.returns = Some(returns);
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_example(mut self, example: Value) -> Self {
        self.examples.push(example);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Stable parameter signature used in the catalog content hash.
    /// Doc-only edits must not change it.
    pub fn signature(&self) -> String {
        self.parameters
            .iter()
            .map(|p| format!("{}:{}:{}", p.name, p.param_type.as_str(), p.required))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Text embedded and indexed for semantic search
    pub fn search_text(&self) -> String {
        let mut text = format!("{} {}", self.name, self.description);
        for p in &self.parameters {
            text.push(' ');
            text.push_str(&p.name);
            if !p.description.is_empty() {
                text.push(' ');
                text.push_str(&p.description);
            }
        }
        text
    }
}

/// How much of each definition a planner-facing projection carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailLevel {
    /// Identifier only
    Name,
    /// Adds description and parameter names
    Summary,
    /// Adds parameter schemas, examples, and return schema
    Full,
}

/// Options for [`to_planner_format`]
#[derive(Debug, Clone, Copy)]
pub struct PlannerFormatOptions {
    pub detail_level: DetailLevel,
    pub include_examples: bool,
}

impl Default for PlannerFormatOptions {
    fn default() -> Self {
        Self {
            detail_level: DetailLevel::Full,
            include_examples: true,
        }
    }
}

/// Immutable, hash-addressed collection of tool definitions
///
/// Insertion order is preserved for deterministic serialization.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCatalog {
    definitions: Vec<ToolDefinition>,
    #[serde(skip)]
    index: HashMap<String, usize>,
    pub source: String,
    pub discovered_at: DateTime<Utc>,
    hash: String,
}

impl ToolCatalog {
    fn build(definitions: Vec<ToolDefinition>, source: String) -> Self {
        let index = definitions
            .iter()
            .enumerate()
            .map(|(i, d)| (d.name.clone(), i))
            .collect();
        let hash = content_hash(&definitions);
        Self {
            definitions,
            index,
            source,
            discovered_at: Utc::now(),
            hash,
        }
    }

    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.index.get(name).map(|&i| &self.definitions[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolDefinition> {
        self.definitions.iter()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// SHA-256 over the sorted `(name, kind, signature)` triples
    pub fn content_hash(&self) -> &str {
        &self.hash
    }
}

fn content_hash(definitions: &[ToolDefinition]) -> String {
    let mut lines: Vec<String> = definitions
        .iter()
        .map(|d| format!("{}\x1f{}\x1f{}", d.name, d.kind.as_str(), d.signature()))
        .collect();
    lines.sort();
    let mut hasher = Sha256::new();
    for line in &lines {
        hasher.update(line.as_bytes());
        hasher.update([b'\n']);
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Filter for [`ToolRegistry::list`]
#[derive(Debug, Clone, Default)]
pub struct ToolFilter {
    pub kind: Option<ToolKind>,
    pub domain: Option<String>,
    pub source: Option<String>,
}

impl ToolFilter {
    pub fn kind(kind: ToolKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    fn matches(&self, definition: &ToolDefinition, registry_source: &str) -> bool {
        if self.kind.is_some_and(|k| k != definition.kind) {
            return false;
        }
        if let Some(domain) = &self.domain
            && definition.domain.as_deref() != Some(domain.as_str())
        {
            return false;
        }
        if let Some(source) = &self.source
            && source != registry_source
        {
            return false;
        }
        true
    }
}

/// Registry of available tools
///
/// Mutated during startup discovery, then shared read-only behind an `Arc`.
/// Native implementations and sandboxed fragments live beside their
/// definitions; catalog snapshots are pure data.
pub struct ToolRegistry {
    definitions: Vec<ToolDefinition>,
    index: HashMap<String, usize>,
    natives: HashMap<String, Arc<dyn NativeTool>>,
    fragments: HashMap<String, String>,
    source: String,
    snapshot: Mutex<Option<Arc<ToolCatalog>>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new("builtin")
    }
}

impl ToolRegistry {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            definitions: Vec::new(),
            index: HashMap::new(),
            natives: HashMap::new(),
            fragments: HashMap::new(),
            source: source.into(),
            snapshot: Mutex::new(None),
        }
    }

    /// Register a tool definition
    ///
    /// Fails with `DuplicateName` when the name is taken and with
    /// `Validation` when the schema is not self-consistent. A failed
    /// registration leaves the registry untouched.
    pub fn register(&mut self, definition: ToolDefinition) -> Result<()> {
        if self.index.contains_key(&definition.name) {
            return Err(Error::DuplicateName(definition.name));
        }
        schema::validate_definition(&definition)?;
        self.index
            .insert(definition.name.clone(), self.definitions.len());
        self.definitions.push(definition);
        *self.snapshot.lock() = None;
        Ok(())
    }

    /// Register a native tool, deriving its definition from the trait
    pub fn register_native(&mut self, tool: Arc<dyn NativeTool>) -> Result<()> {
        let mut definition =
            ToolDefinition::new(tool.name(), ToolKind::Native, tool.description());
        definition.parameters = tool.parameters();
        if let Some(domain) = tool.domain() {
            definition.domain = Some(domain.to_string());
        }
        let name = definition.name.clone();
        self.register(definition)?;
        self.natives.insert(name, tool);
        Ok(())
    }

    /// Register a sandboxed-code tool: a definition plus the code fragment
    /// executed on invocation
    pub fn register_sandboxed(
        &mut self,
        definition: ToolDefinition,
        fragment: impl Into<String>,
    ) -> Result<()> {
        if definition.kind != ToolKind::SandboxedCode {
            return Err(Error::Validation(format!(
                "tool {} must have kind sandboxed_code",
                definition.name
            )));
        }
        let name = definition.name.clone();
        self.register(definition)?;
        self.fragments.insert(name, fragment.into());
        Ok(())
    }

    /// Look up a definition by name
    pub fn get(&self, name: &str) -> Result<&ToolDefinition> {
        self.index
            .get(name)
            .map(|&i| &self.definitions[i])
            .ok_or_else(|| Error::NotFound(format!("tool {name}")))
    }

    pub(crate) fn native(&self, name: &str) -> Option<Arc<dyn NativeTool>> {
        self.natives.get(name).cloned()
    }

    pub(crate) fn fragment(&self, name: &str) -> Option<&str> {
        self.fragments.get(name).map(|s| s.as_str())
    }

    /// Matching definitions in insertion order
    pub fn list(&self, filter: &ToolFilter) -> Vec<&ToolDefinition> {
        self.definitions
            .iter()
            .filter(|d| filter.matches(d, &self.source))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Freeze the current contents into an immutable catalog
    ///
    /// Snapshots are cached: repeated calls without intervening
    /// registrations return the same `Arc`.
    pub fn snapshot(&self) -> Arc<ToolCatalog> {
        let mut cached = self.snapshot.lock();
        if let Some(snapshot) = cached.as_ref() {
            return snapshot.clone();
        }
        let catalog = Arc::new(ToolCatalog::build(
            self.definitions.clone(),
            self.source.clone(),
        ));
        *cached = Some(catalog.clone());
        catalog
    }
}

/// Render a single definition at the requested detail level
///
/// Key ordering is deterministic (serde_json maps are sorted), so the same
/// catalog always serializes to the same bytes.
pub fn render_definition(definition: &ToolDefinition, opts: &PlannerFormatOptions) -> Value {
    match opts.detail_level {
        DetailLevel::Name => json!({ "name": definition.name }),
        DetailLevel::Summary => json!({
            "name": definition.name,
            "description": definition.description,
            "parameters": definition.parameters.iter().map(|p| p.name.clone()).collect::<Vec<_>>(),
        }),
        DetailLevel::Full => {
            let mut properties = Map::new();
            let mut required = Vec::new();
            for p in &definition.parameters {
                let mut prop = Map::new();
                prop.insert("type".into(), json!(p.param_type.as_str()));
                if !p.description.is_empty() {
                    prop.insert("description".into(), json!(p.description));
                }
                if let Some(values) = &p.enum_values {
                    prop.insert("enum".into(), json!(values));
                }
                if let Some(default) = &p.default {
                    prop.insert("default".into(), default.clone());
                }
                if let Some(items) = &p.items {
                    prop.insert("items".into(), items.clone());
                }
                if let Some(nested) = &p.properties {
                    prop.insert("properties".into(), nested.clone());
                }
                if p.required {
                    required.push(p.name.clone());
                }
                properties.insert(p.name.clone(), Value::Object(prop));
            }
            let mut out = Map::new();
            out.insert("name".into(), json!(definition.name));
            out.insert("description".into(), json!(definition.description));
            out.insert(
                "parameters".into(),
                json!({
                    "type": "object",
                    "properties": properties,
                    "required": required,
                }),
            );
            if let Some(returns) = &definition.returns {
                out.insert("returns".into(), returns.clone());
            }
            if opts.include_examples && !definition.examples.is_empty() {
                out.insert("examples".into(), json!(definition.examples));
            }
            Value::Object(out)
        }
    }
}

/// Render a catalog to the provider-neutral planner format
pub fn to_planner_format(catalog: &ToolCatalog, opts: &PlannerFormatOptions) -> Vec<Value> {
    catalog.iter().map(|d| render_definition(d, opts)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_definition() -> ToolDefinition {
        ToolDefinition::new("echo", ToolKind::Native, "Echo the input back")
            .with_parameter(
                ParameterSpec::new("text", ParamType::String)
                    .required()
                    .with_description("Text to echo"),
            )
            .with_parameter(
                ParameterSpec::new("repeat", ParamType::Integer).with_default(json!(1)),
            )
    }

    #[test]
    fn test_register_and_get() {
        let mut registry = ToolRegistry::new("test");
        registry.register(echo_definition()).unwrap();
        let definition = registry.get("echo").unwrap();
        assert_eq!(definition.kind, ToolKind::Native);
        assert!(matches!(
            registry.get("missing"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut registry = ToolRegistry::new("test");
        registry.register(echo_definition()).unwrap();
        let err = registry.register(echo_definition()).unwrap_err();
        assert!(matches!(err, Error::DuplicateName(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_failed_registration_leaves_catalog_intact() {
        let mut registry = ToolRegistry::new("test");
        registry.register(echo_definition()).unwrap();
        // default outside the declared enum
        let bad = ToolDefinition::new("pick", ToolKind::Native, "Pick one").with_parameter(
            ParameterSpec::new("choice", ParamType::String)
                .with_enum(vec![json!("a"), json!("b")])
                .with_default(json!("c")),
        );
        assert!(registry.register(bad).is_err());
        assert_eq!(registry.len(), 1);
        assert!(registry.get("pick").is_err());
    }

    #[test]
    fn test_list_filters_by_kind_and_domain() {
        let mut registry = ToolRegistry::new("test");
        registry.register(echo_definition()).unwrap();
        registry
            .register(
                ToolDefinition::new("fetch", ToolKind::Remote, "Fetch a URL")
                    .with_domain("web"),
            )
            .unwrap();

        let remote = registry.list(&ToolFilter::kind(ToolKind::Remote));
        assert_eq!(remote.len(), 1);
        assert_eq!(remote[0].name, "fetch");

        let web = registry.list(&ToolFilter {
            domain: Some("web".into()),
            ..ToolFilter::default()
        });
        assert_eq!(web.len(), 1);

        let all = registry.list(&ToolFilter::default());
        assert_eq!(all[0].name, "echo"); // insertion order
    }

    #[test]
    fn test_snapshot_stable_until_registration() {
        let mut registry = ToolRegistry::new("test");
        registry.register(echo_definition()).unwrap();
        let a = registry.snapshot();
        let b = registry.snapshot();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.content_hash(), b.content_hash());

        registry
            .register(ToolDefinition::new("other", ToolKind::Remote, "Other"))
            .unwrap();
        let c = registry.snapshot();
        assert_ne!(a.content_hash(), c.content_hash());
    }

    #[test]
    fn test_content_hash_ignores_descriptions() {
        let mut a = ToolRegistry::new("test");
        a.register(echo_definition()).unwrap();
        let mut b = ToolRegistry::new("test");
        let mut reworded = echo_definition();
        reworded.description = "Echoes text".into();
        b.register(reworded).unwrap();
        assert_eq!(a.snapshot().content_hash(), b.snapshot().content_hash());
    }

    #[test]
    fn test_planner_format_detail_levels() {
        let mut registry = ToolRegistry::new("test");
        registry
            .register(echo_definition().with_example(json!({"text": "hi"})))
            .unwrap();
        let catalog = registry.snapshot();

        let names = to_planner_format(
            &catalog,
            &PlannerFormatOptions {
                detail_level: DetailLevel::Name,
                include_examples: false,
            },
        );
        assert_eq!(names[0], json!({"name": "echo"}));

        let summaries = to_planner_format(
            &catalog,
            &PlannerFormatOptions {
                detail_level: DetailLevel::Summary,
                include_examples: false,
            },
        );
        assert_eq!(summaries[0]["parameters"], json!(["text", "repeat"]));

        let full = to_planner_format(&catalog, &PlannerFormatOptions::default());
        assert_eq!(full[0]["parameters"]["type"], json!("object"));
        assert_eq!(full[0]["parameters"]["required"], json!(["text"]));
        assert_eq!(
            full[0]["parameters"]["properties"]["repeat"]["default"],
            json!(1)
        );
        assert!(full[0]["examples"].is_array());
    }

    #[test]
    fn test_planner_format_round_trip() {
        let mut registry = ToolRegistry::new("test");
        registry.register(echo_definition()).unwrap();
        let catalog = registry.snapshot();
        let rendered = to_planner_format(&catalog, &PlannerFormatOptions::default());

        // Parse the planner projection back and compare identity on names
        // and parameter schemas.
        let parsed = &rendered[0];
        assert_eq!(parsed["name"], json!("echo"));
        let original = catalog.get("echo").unwrap();
        for p in &original.parameters {
            assert_eq!(
                parsed["parameters"]["properties"][&p.name]["type"],
                json!(p.param_type.as_str())
            );
        }
    }

    #[test]
    fn test_definition_serde_stable_tags() {
        let definition = echo_definition();
        let json = serde_json::to_value(&definition).unwrap();
        assert_eq!(json["kind"], json!("native"));
        let back: ToolDefinition = serde_json::from_value(json).unwrap();
        assert_eq!(back.name, definition.name);
        assert_eq!(back.parameters, definition.parameters);
    }
}
