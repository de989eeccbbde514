//! Loading strategy definitions from YAML or JSON
//!
//! Definitions are first read into loosely typed raw structs so that every
//! missing or malformed field can be reported at once, path-qualified.

use super::validation::{scope_warnings, validate_strategy};
use super::{FailurePolicy, Step, Strategy, StrategyCatalog};
use crate::chunk::ChunkingConfig;
use crate::error::{DefinitionIssue, Result, StrataError};
use crate::retry::StepRetryConfig;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Serialization format of a definition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Yaml,
    Json,
}

impl SourceFormat {
    /// JSON for `.json`, YAML for everything else
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Yaml,
        }
    }
}

/// A definition plus where it came from
#[derive(Debug, Clone)]
pub struct StrategySource {
    /// Storage location, used in diagnostics and recorded on the strategy
    pub origin: String,
    /// Storage-level identifier (file stem), checked against the declared name
    pub stem: Option<String>,
    pub format: SourceFormat,
    pub content: String,
}

impl StrategySource {
    pub fn yaml(origin: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            stem: None,
            format: SourceFormat::Yaml,
            content: content.into(),
        }
    }

    pub fn json(origin: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            stem: None,
            format: SourceFormat::Json,
            content: content.into(),
        }
    }

    pub fn with_stem(mut self, stem: impl Into<String>) -> Self {
        self.stem = Some(stem.into());
        self
    }

    /// Read a definition file
    pub async fn from_path(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Ok(Self {
            origin: path.display().to_string(),
            stem: path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .map(str::to_string),
            format: SourceFormat::from_path(path),
            content,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticLevel {
    Warning,
    Error,
}

impl fmt::Display for DiagnosticLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticLevel::Warning => f.write_str("warning"),
            DiagnosticLevel::Error => f.write_str("error"),
        }
    }
}

/// Something the loader noticed about a definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderDiagnostic {
    pub level: DiagnosticLevel,
    pub origin: String,
    pub message: String,
}

impl LoaderDiagnostic {
    pub fn warning(origin: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Warning,
            origin: origin.into(),
            message: message.into(),
        }
    }

    pub fn error(origin: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Error,
            origin: origin.into(),
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.level == DiagnosticLevel::Error
    }
}

impl fmt::Display for LoaderDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.level, self.origin, self.message)
    }
}

#[derive(Debug, Deserialize)]
struct RawStrategy {
    name: Option<Value>,
    description: Option<String>,
    parameters: Option<Value>,
    metadata: Option<Value>,
    steps: Option<Value>,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RawStep {
    name: Option<Value>,
    action_type: Option<Value>,
    params: Option<Value>,
    failure_policy: Option<Value>,
    output_key: Option<Value>,
    timeout: Option<Value>,
    retry: Option<Value>,
    chunking: Option<Value>,
    description: Option<String>,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

/// Collects issues while converting raw values into typed fields
struct Conversion {
    issues: Vec<DefinitionIssue>,
    warnings: Vec<String>,
}

impl Conversion {
    fn issue(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.issues.push(DefinitionIssue::new(field, message));
    }

    fn string(&mut self, field: &str, value: Option<Value>, required: bool) -> Option<String> {
        match value {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s),
            Some(Value::String(_)) => {
                self.issue(field, "must not be empty");
                None
            }
            Some(Value::Null) | None => {
                if required {
                    self.issue(field, "is required");
                }
                None
            }
            Some(other) => {
                self.issue(field, format!("must be a string, got {other}"));
                None
            }
        }
    }

    fn mapping(&mut self, field: &str, value: Option<Value>) -> Map<String, Value> {
        match value {
            Some(Value::Object(map)) => map,
            Some(Value::Null) | None => Map::new(),
            Some(other) => {
                self.issue(field, format!("must be a mapping, got {other}"));
                Map::new()
            }
        }
    }

    fn typed<T: serde::de::DeserializeOwned>(&mut self, field: &str, value: Option<Value>) -> Option<T> {
        match value {
            Some(Value::Null) | None => None,
            Some(value) => match serde_json::from_value(value) {
                Ok(typed) => Some(typed),
                Err(e) => {
                    self.issue(field, e.to_string());
                    None
                }
            },
        }
    }

    fn timeout(&mut self, field: &str, value: Option<Value>) -> Option<Duration> {
        match value {
            Some(Value::Null) | None => None,
            Some(Value::Number(n)) => match n.as_f64() {
                Some(secs) if secs.is_finite() && secs >= 0.0 => Some(Duration::from_secs_f64(secs)),
                _ => {
                    self.issue(field, format!("'{n}' is not a valid number of seconds"));
                    None
                }
            },
            Some(Value::String(s)) => match humantime_serde::re::humantime::parse_duration(&s) {
                Ok(duration) => Some(duration),
                Err(e) => {
                    self.issue(field, format!("'{s}' is not a duration: {e}"));
                    None
                }
            },
            Some(other) => {
                self.issue(field, format!("must be a duration such as \"30s\", got {other}"));
                None
            }
        }
    }

    fn step(&mut self, index: usize, raw: RawStep) -> Step {
        let field = |name: &str| format!("steps[{index}].{name}");

        for key in raw.extra.keys() {
            self.warnings
                .push(format!("{} is not a recognised step field", field(key)));
        }

        let name = self.string(&field("name"), raw.name, true).unwrap_or_default();
        let action_type = self
            .string(&field("action_type"), raw.action_type, true)
            .unwrap_or_default();
        let output_key = self.string(&field("output_key"), raw.output_key, false);

        let failure_policy = match raw.failure_policy {
            Some(Value::String(policy)) => FailurePolicy::parse(&policy).unwrap_or_else(|| {
                self.issue(
                    field("failure_policy"),
                    format!("'{policy}' is not one of hard, soft"),
                );
                FailurePolicy::Hard
            }),
            Some(Value::Null) | None => FailurePolicy::Hard,
            Some(other) => {
                self.issue(
                    field("failure_policy"),
                    format!("'{other}' is not one of hard, soft"),
                );
                FailurePolicy::Hard
            }
        };

        let params = match raw.params {
            Some(Value::Null) | None => Value::Object(Map::new()),
            Some(params) => params,
        };

        Step {
            name,
            action_type,
            params,
            failure_policy,
            output_key,
            timeout: self.timeout(&field("timeout"), raw.timeout),
            retry: self.typed::<StepRetryConfig>(&field("retry"), raw.retry),
            chunking: self.typed::<ChunkingConfig>(&field("chunking"), raw.chunking),
            description: raw.description,
        }
    }
}

/// Loads and validates strategy definitions
#[derive(Debug, Clone, Default)]
pub struct StrategyLoader {
    known_actions: Option<BTreeSet<String>>,
}

impl StrategyLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Warn about action types outside this set. The registry still has the
    /// final say when a job runs.
    pub fn with_known_actions<I, S>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.known_actions = Some(actions.into_iter().map(Into::into).collect());
        self
    }

    /// Load one definition, failing with every offending field listed
    pub fn load(&self, source: &StrategySource) -> Result<Strategy> {
        self.load_with_diagnostics(source).map(|(strategy, _)| strategy)
    }

    /// Load one definition and return the warnings it produced
    pub fn load_with_diagnostics(
        &self,
        source: &StrategySource,
    ) -> Result<(Strategy, Vec<LoaderDiagnostic>)> {
        let document: Value = match source.format {
            SourceFormat::Yaml => serde_yaml::from_str(&source.content)
                .map_err(|e| parse_error(&source.origin, e.to_string()))?,
            SourceFormat::Json => serde_json::from_str(&source.content)
                .map_err(|e| parse_error(&source.origin, e.to_string()))?,
        };
        let raw: RawStrategy = serde_json::from_value(document)
            .map_err(|e| parse_error(&source.origin, e.to_string()))?;

        let mut conversion = Conversion {
            issues: Vec::new(),
            warnings: Vec::new(),
        };

        for key in raw.extra.keys() {
            conversion
                .warnings
                .push(format!("'{key}' is not a recognised strategy field"));
        }

        let name = conversion.string("name", raw.name, true).unwrap_or_default();
        let parameters = conversion.mapping("parameters", raw.parameters);
        let metadata = conversion.mapping("metadata", raw.metadata);

        let raw_steps: Vec<Value> = match raw.steps {
            Some(Value::Array(steps)) => steps,
            Some(Value::Null) | None => {
                conversion.issue("steps", "is required");
                Vec::new()
            }
            Some(other) => {
                conversion.issue("steps", format!("must be a list, got {other}"));
                Vec::new()
            }
        };

        let mut steps = Vec::with_capacity(raw_steps.len());
        for (index, value) in raw_steps.into_iter().enumerate() {
            match serde_json::from_value::<RawStep>(value) {
                Ok(raw_step) => steps.push(conversion.step(index, raw_step)),
                Err(e) => conversion.issue(format!("steps[{index}]"), e.to_string()),
            }
        }

        let strategy = Strategy {
            name,
            description: raw.description,
            parameters,
            metadata,
            steps,
            source: Some(source.origin.clone()),
        };

        // Structural checks on what could be converted; "is required" issues
        // already cover empty names, so skip the duplicates
        let mut issues = conversion.issues;
        for issue in validate_strategy(&strategy) {
            if !issues.iter().any(|existing| existing.field == issue.field) {
                issues.push(issue);
            }
        }

        if !issues.is_empty() {
            let origin = if strategy.name.is_empty() {
                source.origin.clone()
            } else {
                strategy.name.clone()
            };
            return Err(StrataError::Definition { origin, issues });
        }

        let mut diagnostics: Vec<LoaderDiagnostic> = conversion
            .warnings
            .into_iter()
            .chain(scope_warnings(&strategy))
            .map(|message| LoaderDiagnostic::warning(&source.origin, message))
            .collect();

        if let Some(stem) = &source.stem {
            if stem != &strategy.name {
                diagnostics.push(LoaderDiagnostic::warning(
                    &source.origin,
                    format!(
                        "declared name '{}' differs from file name '{}'; '{}' is used",
                        strategy.name, stem, strategy.name
                    ),
                ));
            }
        }

        if let Some(known) = &self.known_actions {
            for (index, step) in strategy.steps.iter().enumerate() {
                for action_type in step.action_types() {
                    if !known.contains(action_type) {
                        diagnostics.push(LoaderDiagnostic::warning(
                            &source.origin,
                            format!("steps[{index}] uses unregistered action type '{action_type}'"),
                        ));
                    }
                }
            }
        }

        for diagnostic in &diagnostics {
            warn!("{}", diagnostic);
        }
        debug!(
            "Loaded strategy '{}' with {} steps",
            strategy.name,
            strategy.steps.len()
        );

        Ok((strategy, diagnostics))
    }

    /// Load many definitions; failures and duplicates become diagnostics
    pub fn load_collection<I>(&self, sources: I) -> StrategyCatalog
    where
        I: IntoIterator<Item = StrategySource>,
    {
        let mut catalog = StrategyCatalog::new();
        for source in sources {
            match self.load_with_diagnostics(&source) {
                Ok((strategy, diagnostics)) => {
                    for diagnostic in diagnostics {
                        catalog.push_diagnostic(diagnostic);
                    }
                    catalog.insert(strategy);
                }
                Err(e) => {
                    warn!("Skipping {}: {}", source.origin, e);
                    catalog.push_diagnostic(LoaderDiagnostic::error(&source.origin, e.user_message()));
                }
            }
        }
        catalog
    }

    /// Load every `*.yaml`, `*.yml` and `*.json` file below `dir`
    pub async fn load_dir(&self, dir: &Path) -> Result<StrategyCatalog> {
        if !dir.is_dir() {
            return Err(StrataError::config(format!(
                "strategy directory {} does not exist",
                dir.display()
            ))
            .with_path(dir));
        }

        let mut paths: Vec<_> = WalkDir::new(dir)
            .follow_links(true)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| matches!(ext.to_ascii_lowercase().as_str(), "yaml" | "yml" | "json"))
            })
            .collect();
        paths.sort();

        let mut sources = Vec::with_capacity(paths.len());
        let mut unreadable = Vec::new();
        for path in &paths {
            match StrategySource::from_path(path).await {
                Ok(source) => sources.push(source),
                Err(e) => unreadable.push(LoaderDiagnostic::error(
                    path.display().to_string(),
                    e.user_message(),
                )),
            }
        }

        let mut catalog = self.load_collection(sources);
        for diagnostic in unreadable {
            catalog.push_diagnostic(diagnostic);
        }
        debug!(
            "Loaded {} strategies from {}",
            catalog.len(),
            dir.display()
        );
        Ok(catalog)
    }
}

fn parse_error(origin: &str, message: String) -> StrataError {
    StrataError::definition(origin, "<document>", message)
}
