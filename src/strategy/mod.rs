//! Strategy definitions
//!
//! A strategy is a named, ordered list of steps. Each step names a registered
//! action and carries parameters that may contain `${scope.path}` templates.
//! Strategies are immutable once loaded and are shared between jobs behind an
//! `Arc`.

use crate::chunk::ChunkingConfig;
use crate::error::{Result, StrataError};
use crate::retry::StepRetryConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub mod loader;
pub mod validation;

pub use loader::{
    DiagnosticLevel, LoaderDiagnostic, SourceFormat, StrategyLoader, StrategySource,
};

/// What happens to the job when a step fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Abort the job
    #[default]
    Hard,
    /// Record the failure and continue with the next step
    Soft,
}

impl FailurePolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "hard" => Some(Self::Hard),
            "soft" => Some(Self::Soft),
            _ => None,
        }
    }
}

/// One unit of work in a strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub action_type: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Dataset key the step's result is stored under; `None` discards the data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_key: Option<String>,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<StepRetryConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunking: Option<ChunkingConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Step {
    /// Create a hard-failing step with no output
    pub fn new(name: impl Into<String>, action_type: impl Into<String>, params: Value) -> Self {
        Self {
            name: name.into(),
            action_type: action_type.into(),
            params,
            failure_policy: FailurePolicy::Hard,
            output_key: None,
            timeout: None,
            retry: None,
            chunking: None,
            description: None,
        }
    }

    pub fn with_output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = Some(key.into());
        self
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: StepRetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_chunking(mut self, chunking: ChunkingConfig) -> Self {
        self.chunking = Some(chunking);
        self
    }

    /// Every action type this step may dispatch to, fallback included
    pub fn action_types(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.action_type.as_str()).chain(
            self.retry
                .as_ref()
                .and_then(|retry| retry.fallback_action.as_deref()),
        )
    }
}

/// A validated strategy definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Strategy {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub steps: Vec<Step>,
    /// Storage location the definition was read from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl Strategy {
    /// Build a strategy in code; runs the same validation as the loader
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Result<Self> {
        let strategy = Self {
            name: name.into(),
            description: None,
            parameters: Map::new(),
            metadata: Map::new(),
            steps,
            source: None,
        };
        let issues = validation::validate_strategy(&strategy);
        if issues.is_empty() {
            Ok(strategy)
        } else {
            Err(StrataError::Definition {
                origin: strategy.name.clone(),
                issues,
            })
        }
    }

    pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|step| step.name == name)
    }
}

/// Strategies keyed by their declared name, plus what went wrong loading them
#[derive(Debug, Clone, Default)]
pub struct StrategyCatalog {
    strategies: BTreeMap<String, Arc<Strategy>>,
    diagnostics: Vec<LoaderDiagnostic>,
}

impl StrategyCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a strategy; a name that is already present is rejected with a diagnostic
    pub fn insert(&mut self, strategy: Strategy) -> bool {
        if self.strategies.contains_key(&strategy.name) {
            let origin = strategy
                .source
                .clone()
                .unwrap_or_else(|| strategy.name.clone());
            self.diagnostics.push(LoaderDiagnostic::error(
                origin,
                format!(
                    "duplicate strategy name '{}', keeping the first definition",
                    strategy.name
                ),
            ));
            return false;
        }
        self.strategies
            .insert(strategy.name.clone(), Arc::new(strategy));
        true
    }

    pub fn push_diagnostic(&mut self, diagnostic: LoaderDiagnostic) {
        self.diagnostics.push(diagnostic);
    }

    pub fn get(&self, name: &str) -> Result<Arc<Strategy>> {
        self.strategies
            .get(name)
            .cloned()
            .ok_or_else(|| StrataError::StrategyNotFound {
                name: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.strategies.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.strategies.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Strategy>> {
        self.strategies.values()
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub fn diagnostics(&self) -> &[LoaderDiagnostic] {
        &self.diagnostics
    }
}

impl FromIterator<Strategy> for StrategyCatalog {
    fn from_iter<I: IntoIterator<Item = Strategy>>(iter: I) -> Self {
        let mut catalog = Self::new();
        for strategy in iter {
            catalog.insert(strategy);
        }
        catalog
    }
}
