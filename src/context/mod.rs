//! Per-job execution context
//!
//! The context is the mutable namespace one running job threads through its
//! steps. It is owned by exactly one job and never shared across jobs.

use crate::error::{Result, StrataError};
use crate::resolver::{ResolutionSource, Scopes, PARAMETERS_SCOPE};
use crate::strategy::Strategy;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Scope names a step output can never use
pub const RESERVED_SCOPES: [&str; 4] = ["parameters", "metadata", "statistics", "output_files"];

pub fn is_reserved_scope(name: &str) -> bool {
    RESERVED_SCOPES.contains(&name)
}

/// Bounded pool for blocking work delegated by actions.
///
/// Work runs on tokio's blocking threads; the semaphore caps how many of them
/// the engine occupies at once.
#[derive(Debug, Clone)]
pub struct BlockingPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl BlockingPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Permits not currently held by running work
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `f` on a blocking thread once a permit is free
    pub async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| StrataError::Io(std::io::Error::other(e.to_string())))?;

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        })
        .await
        .map_err(|e| StrataError::Io(std::io::Error::other(format!("blocking task failed: {e}"))))
    }
}

impl Default for BlockingPool {
    fn default() -> Self {
        Self::new(8)
    }
}

/// Serializable view of a context, returned as the job result
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub job_id: String,
    pub strategy_name: String,
    pub parameters: Map<String, Value>,
    pub metadata: Map<String, Value>,
    pub datasets: Map<String, Value>,
    pub statistics: Map<String, Value>,
    pub output_files: BTreeMap<String, PathBuf>,
}

/// Mutable namespace threaded across the steps of one job
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub job_id: String,
    pub strategy_name: String,
    /// Effective parameters after overrides were merged in
    pub parameters: Map<String, Value>,
    pub metadata: Map<String, Value>,
    /// Outputs of earlier steps keyed by `output_key`. Shared so that
    /// rollback copies of the context do not duplicate them.
    datasets: BTreeMap<String, Arc<Value>>,
    pub statistics: Map<String, Value>,
    pub output_files: BTreeMap<String, PathBuf>,
    parameter_sources: HashMap<String, ResolutionSource>,
    blocking: BlockingPool,
}

impl ExecutionContext {
    /// An empty context, mostly useful for driving actions directly
    pub fn new(job_id: impl Into<String>, strategy_name: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            strategy_name: strategy_name.into(),
            parameters: Map::new(),
            metadata: Map::new(),
            datasets: BTreeMap::new(),
            statistics: Map::new(),
            output_files: BTreeMap::new(),
            parameter_sources: HashMap::new(),
            blocking: BlockingPool::default(),
        }
    }

    /// Seed a context from a strategy's declared parameters and metadata,
    /// with caller overrides taking precedence
    pub fn for_strategy(
        job_id: impl Into<String>,
        strategy: &Strategy,
        overrides: &Map<String, Value>,
    ) -> Self {
        let mut context = Self::new(job_id, strategy.name.clone());
        context.metadata = strategy.metadata.clone();

        for (name, value) in &strategy.parameters {
            context.parameters.insert(name.clone(), value.clone());
            context
                .parameter_sources
                .insert(name.clone(), ResolutionSource::Strategy);
        }
        for (name, value) in overrides {
            context.parameters.insert(name.clone(), value.clone());
            context
                .parameter_sources
                .insert(name.clone(), ResolutionSource::Override);
        }

        context
    }

    pub fn with_blocking_pool(mut self, pool: BlockingPool) -> Self {
        self.blocking = pool;
        self
    }

    pub fn blocking(&self) -> &BlockingPool {
        &self.blocking
    }

    pub fn parameter_source(&self, name: &str) -> Option<ResolutionSource> {
        self.parameter_sources.get(name).copied()
    }

    pub fn dataset(&self, key: &str) -> Option<&Value> {
        self.datasets.get(key).map(Arc::as_ref)
    }

    pub fn set_dataset(&mut self, key: impl Into<String>, value: Value) {
        self.datasets.insert(key.into(), Arc::new(value));
    }

    pub fn dataset_keys(&self) -> impl Iterator<Item = &str> {
        self.datasets.keys().map(String::as_str)
    }

    pub fn record_statistic(&mut self, key: impl Into<String>, value: Value) {
        self.statistics.insert(key.into(), value);
    }

    pub fn add_output_file(&mut self, key: impl Into<String>, path: impl Into<PathBuf>) {
        self.output_files.insert(key.into(), path.into());
    }

    /// The namespaces placeholders can reach, as of now
    pub fn scopes(&self) -> Scopes<'_> {
        let mut scopes = Scopes::new();
        for (name, value) in &self.datasets {
            scopes.insert_borrowed(name.clone(), value);
        }
        scopes.insert(PARAMETERS_SCOPE, Value::Object(self.parameters.clone()));
        scopes.insert("metadata", Value::Object(self.metadata.clone()));
        scopes.insert("statistics", Value::Object(self.statistics.clone()));
        let files: Map<String, Value> = self
            .output_files
            .iter()
            .map(|(key, path)| (key.clone(), Value::String(path.display().to_string())))
            .collect();
        scopes.insert("output_files", Value::Object(files));

        for (name, source) in &self.parameter_sources {
            scopes.set_parameter_source(name.clone(), *source);
        }
        scopes
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            job_id: self.job_id.clone(),
            strategy_name: self.strategy_name.clone(),
            parameters: self.parameters.clone(),
            metadata: self.metadata.clone(),
            datasets: self
                .datasets
                .iter()
                .map(|(key, value)| (key.clone(), Value::clone(value)))
                .collect(),
            statistics: self.statistics.clone(),
            output_files: self.output_files.clone(),
        }
    }
}
