//! Parameter resolution
//!
//! Resolves `${scope.path}` placeholders inside arbitrarily nested JSON values
//! against named scopes (`parameters`, `metadata`, and every dataset a previous
//! step produced). Resolution is a pure path lookup; there is no expression
//! evaluation.
//!
//! Unresolvable references always raise. A placeholder is never left in place
//! and never replaced with an empty string.
//!
//! Missing top-level `parameters` entries fall back through the configured
//! defaults and then the built-in defaults. Every reference records which
//! source satisfied it.

use crate::error::{Result, StrataError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

pub mod template;

pub use template::{collect_references, PathSegment, Reference, Template};

/// Scope holding the effective job parameters
pub const PARAMETERS_SCOPE: &str = "parameters";

/// Where a resolved reference got its value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    /// Caller-supplied parameter override
    Override,
    /// Default declared by the strategy
    Strategy,
    /// Engine configuration or `STRATA_PARAM_*` environment default
    Environment,
    /// Built-in engine default
    BuiltIn,
    /// Any non-parameter scope (metadata, datasets, statistics)
    Context,
}

impl fmt::Display for ResolutionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResolutionSource::Override => "override",
            ResolutionSource::Strategy => "strategy",
            ResolutionSource::Environment => "environment",
            ResolutionSource::BuiltIn => "built_in",
            ResolutionSource::Context => "context",
        };
        f.write_str(name)
    }
}

/// One reference and the source that satisfied it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedReference {
    pub reference: String,
    pub source: ResolutionSource,
}

/// Output of a resolution: the value plus the trace of every reference used
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub value: Value,
    pub trace: Vec<ResolvedReference>,
}

/// The namespaces placeholders can reach.
///
/// Values are either owned or borrowed from the job context, so building
/// scopes for a step does not copy earlier step outputs.
#[derive(Debug, Clone, Default)]
pub struct Scopes<'a> {
    values: BTreeMap<String, Cow<'a, Value>>,
    parameter_sources: HashMap<String, ResolutionSource>,
}

impl<'a> Scopes<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, scope: impl Into<String>, value: Value) {
        self.values.insert(scope.into(), Cow::Owned(value));
    }

    /// Expose `value` without copying it
    pub fn insert_borrowed(&mut self, scope: impl Into<String>, value: &'a Value) {
        self.values.insert(scope.into(), Cow::Borrowed(value));
    }

    pub fn with_scope(mut self, scope: impl Into<String>, value: Value) -> Self {
        self.insert(scope, value);
        self
    }

    /// Record where an effective parameter came from
    pub fn set_parameter_source(&mut self, name: impl Into<String>, source: ResolutionSource) {
        self.parameter_sources.insert(name.into(), source);
    }

    pub fn get(&self, scope: &str) -> Option<&Value> {
        self.values.get(scope).map(|value| &**value)
    }

    pub fn contains(&self, scope: &str) -> bool {
        self.values.contains_key(scope)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    fn parameter_source(&self, name: &str) -> ResolutionSource {
        self.parameter_sources
            .get(name)
            .copied()
            .unwrap_or(ResolutionSource::Strategy)
    }
}

/// Fallback tiers for missing top-level parameters
#[derive(Debug, Clone)]
pub struct ParameterDefaults {
    configured: Map<String, Value>,
    built_in: Map<String, Value>,
}

impl ParameterDefaults {
    /// Configured defaults on top of the built-in ones
    pub fn new(configured: Map<String, Value>) -> Self {
        Self {
            configured,
            built_in: built_in_defaults(),
        }
    }

    /// No fallbacks at all
    pub fn none() -> Self {
        Self {
            configured: Map::new(),
            built_in: Map::new(),
        }
    }

    fn lookup(&self, name: &str) -> Option<(&Value, ResolutionSource)> {
        self.configured
            .get(name)
            .map(|value| (value, ResolutionSource::Environment))
            .or_else(|| {
                self.built_in
                    .get(name)
                    .map(|value| (value, ResolutionSource::BuiltIn))
            })
    }
}

impl Default for ParameterDefaults {
    fn default() -> Self {
        Self::new(Map::new())
    }
}

/// Built-in parameter defaults.
///
/// - `output_dir`: `"./output"`
/// - `chunk_size`: `10000`
/// - `threshold`: `0.8`
pub fn built_in_defaults() -> Map<String, Value> {
    let mut defaults = Map::new();
    defaults.insert("output_dir".to_string(), json!("./output"));
    defaults.insert("chunk_size".to_string(), json!(10000));
    defaults.insert("threshold".to_string(), json!(0.8));
    defaults
}

/// Resolves placeholders in nested values
#[derive(Debug, Clone, Default)]
pub struct ParameterResolver {
    defaults: ParameterDefaults,
}

impl ParameterResolver {
    pub fn new(defaults: ParameterDefaults) -> Self {
        Self { defaults }
    }

    /// Resolve every placeholder in `value` against `scopes`
    pub fn resolve(&self, value: &Value, scopes: &Scopes) -> Result<Resolution> {
        let mut walk = Walk {
            scopes,
            defaults: &self.defaults,
            stack: Vec::new(),
            trace: Vec::new(),
        };
        let value = walk.value(value)?;
        Ok(Resolution {
            value,
            trace: walk.trace,
        })
    }

    /// Resolve a single string; embedded placeholders render as text
    pub fn resolve_str(&self, input: &str, scopes: &Scopes) -> Result<Value> {
        self.resolve(&Value::String(input.to_string()), scopes)
            .map(|resolution| resolution.value)
    }
}

/// Resolve with built-in defaults only
pub fn resolve(value: &Value, scopes: &Scopes) -> Result<Value> {
    ParameterResolver::default()
        .resolve(value, scopes)
        .map(|resolution| resolution.value)
}

/// State of one `resolve` call
struct Walk<'a> {
    scopes: &'a Scopes<'a>,
    defaults: &'a ParameterDefaults,
    /// References currently being expanded, outermost first
    stack: Vec<String>,
    trace: Vec<ResolvedReference>,
}

impl Walk<'_> {
    fn value(&mut self, value: &Value) -> Result<Value> {
        match value {
            Value::String(s) if template::has_placeholder(s) => self.string(s),
            Value::Array(items) => items
                .iter()
                .map(|item| self.value(item))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut resolved = Map::with_capacity(map.len());
                for (key, item) in map {
                    resolved.insert(key.clone(), self.value(item)?);
                }
                Ok(Value::Object(resolved))
            }
            other => Ok(other.clone()),
        }
    }

    fn string(&mut self, input: &str) -> Result<Value> {
        let template = Template::parse(input)?;

        // A lone placeholder keeps the referenced value's type
        if let Some(reference) = template.as_single_reference() {
            return self.reference(reference);
        }

        let mut rendered = String::with_capacity(input.len());
        for segment in &template.segments {
            match segment {
                template::Segment::Literal(text) => rendered.push_str(text),
                template::Segment::Placeholder(reference) => {
                    let value = self.reference(reference)?;
                    rendered.push_str(&value_to_text(&value));
                }
            }
        }
        Ok(Value::String(rendered))
    }

    fn reference(&mut self, reference: &Reference) -> Result<Value> {
        let key = reference.to_string();

        if let Some(pos) = self.stack.iter().position(|entry| *entry == key) {
            let mut cycle = self.stack[pos..].to_vec();
            cycle.push(key);
            return Err(StrataError::CircularReference { cycle });
        }

        let (raw, source) = self.lookup(reference)?;
        self.trace.push(ResolvedReference {
            reference: key.clone(),
            source,
        });

        self.stack.push(key);
        let resolved = self.value(&raw);
        self.stack.pop();
        resolved
    }

    fn lookup(&self, reference: &Reference) -> Result<(Value, ResolutionSource)> {
        let key = reference.to_string();

        if reference.scope == PARAMETERS_SCOPE {
            if let Some(name) = reference.top_level_key() {
                let declared = self
                    .scopes
                    .get(PARAMETERS_SCOPE)
                    .and_then(|params| params.get(name));

                let (root, source) = match declared {
                    Some(value) => (value, self.scopes.parameter_source(name)),
                    None => self.defaults.lookup(name).ok_or_else(|| {
                        StrataError::resolution(
                            &key,
                            format!(
                                "parameter '{name}' has no override, strategy default, \
                                 configured default or built-in default"
                            ),
                        )
                    })?,
                };

                let prefix = format!("{PARAMETERS_SCOPE}.{name}");
                let value = traverse(root, &reference.path[1..], &key, prefix)?;
                return Ok((value, source));
            }
        }

        let root = self.scopes.get(&reference.scope).ok_or_else(|| {
            let mut available: Vec<&str> = self.scopes.names().collect();
            available.sort_unstable();
            StrataError::resolution(
                &key,
                format!(
                    "unknown scope '{}' (available: {})",
                    reference.scope,
                    available.join(", ")
                ),
            )
        })?;

        let value = traverse(root, &reference.path, &key, reference.scope.clone())?;
        Ok((value, ResolutionSource::Context))
    }
}

/// Walk `path` down from `root`. `walked` names the part already traversed.
fn traverse(root: &Value, path: &[PathSegment], key: &str, mut walked: String) -> Result<Value> {
    let mut current = root;

    for segment in path {
        current = match (segment, current) {
            (PathSegment::Key(name), Value::Object(map)) => map.get(name).ok_or_else(|| {
                StrataError::resolution(key, format!("'{walked}' has no field '{name}'"))
            })?,
            (PathSegment::Index(index), Value::Array(items)) => {
                items.get(*index).ok_or_else(|| {
                    StrataError::resolution(
                        key,
                        format!(
                            "index {index} is out of range for '{walked}' (length {})",
                            items.len()
                        ),
                    )
                })?
            }
            (PathSegment::Key(name), other) => {
                return Err(StrataError::resolution(
                    key,
                    format!(
                        "cannot read field '{name}' of '{walked}': it is {}",
                        type_name(other)
                    ),
                ))
            }
            (PathSegment::Index(index), other) => {
                return Err(StrataError::resolution(
                    key,
                    format!(
                        "cannot index [{index}] into '{walked}': it is {}",
                        type_name(other)
                    ),
                ))
            }
        };

        match segment {
            PathSegment::Key(name) => {
                walked.push('.');
                walked.push_str(name);
            }
            PathSegment::Index(index) => walked.push_str(&format!("[{index}]")),
        }
    }

    Ok(current.clone())
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Text form of a value embedded in a larger string
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
