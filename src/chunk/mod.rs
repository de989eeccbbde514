//! Chunked execution of oversized datasets
//!
//! [`ChunkProcessor`] wraps an action and feeds it the dataset found under one
//! params key in bounded partitions, folding the partial results with an
//! [`Aggregator`]. For a row-wise action and a matching aggregator the folded
//! result equals one unwrapped call over the whole dataset, whatever the
//! partition size.
//!
//! Progress is checkpointed after every partition so a restarted job resumes
//! at the first unprocessed partition. Partition size adapts between
//! partitions when a memory budget and probe are configured.

use crate::actions::{Action, ActionError, ActionResult};
use crate::context::ExecutionContext;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub mod aggregate;
pub mod checkpoint;
pub mod memory;

pub use aggregate::{Aggregator, AggregatorKind};
pub use checkpoint::{
    fingerprint, CheckpointStore, ChunkCheckpoint, FileCheckpointStore, MemoryCheckpointStore,
};
pub use memory::{FixedProbe, MemoryProbe, SysinfoProbe};

const BYTES_PER_MB: u64 = 1024 * 1024;

fn default_min_rows() -> usize {
    1
}

fn default_adaptive() -> bool {
    true
}

/// Chunking block of a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Params key holding the dataset (a list of rows)
    pub dataset_param: String,

    /// Fixed partition size in rows
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_rows: Option<usize>,

    /// Memory budget per partition; takes precedence over `partition_rows`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_budget_mb: Option<u64>,

    #[serde(default)]
    pub aggregator: AggregatorKind,

    #[serde(default = "default_min_rows")]
    pub min_rows: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rows: Option<usize>,

    /// Resize partitions from measured memory usage
    #[serde(default = "default_adaptive")]
    pub adaptive: bool,
}

impl ChunkingConfig {
    pub fn rows(dataset_param: impl Into<String>, partition_rows: usize) -> Self {
        Self {
            dataset_param: dataset_param.into(),
            partition_rows: Some(partition_rows),
            memory_budget_mb: None,
            aggregator: AggregatorKind::default(),
            min_rows: default_min_rows(),
            max_rows: None,
            adaptive: default_adaptive(),
        }
    }

    pub fn with_aggregator(mut self, aggregator: AggregatorKind) -> Self {
        self.aggregator = aggregator;
        self
    }

    pub fn bound(&self) -> Option<PartitionBound> {
        match (self.memory_budget_mb, self.partition_rows) {
            (Some(mb), _) => Some(PartitionBound::MemoryBytes(mb.saturating_mul(BYTES_PER_MB))),
            (None, Some(rows)) => Some(PartitionBound::Rows(rows)),
            (None, None) => None,
        }
    }

    /// Problems with this block, as `(field, message)` pairs relative to it
    pub fn issues(&self) -> Vec<(&'static str, String)> {
        let mut issues = Vec::new();
        if self.dataset_param.trim().is_empty() {
            issues.push(("dataset_param", "must name the params key holding the dataset".to_string()));
        }
        if self.partition_rows.is_none() && self.memory_budget_mb.is_none() {
            issues.push((
                "partition_rows",
                "either partition_rows or memory_budget_mb is required".to_string(),
            ));
        }
        if self.partition_rows == Some(0) {
            issues.push(("partition_rows", "must be at least 1".to_string()));
        }
        if self.memory_budget_mb == Some(0) {
            issues.push(("memory_budget_mb", "must be at least 1".to_string()));
        }
        if let Some(max) = self.max_rows {
            if max < self.min_rows.max(1) {
                issues.push(("max_rows", "must not be smaller than min_rows".to_string()));
            }
        }
        issues
    }
}

/// How large a partition may be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionBound {
    Rows(usize),
    /// Estimated serialized size of a partition
    MemoryBytes(u64),
}

/// Next partition size: halve above budget, grow by half below half of it
pub fn adapt_partition_rows(
    current: usize,
    used: u64,
    budget: u64,
    min_rows: usize,
    max_rows: Option<usize>,
) -> usize {
    let next = if used > budget {
        current / 2
    } else if used < budget / 2 {
        current.saturating_add((current / 2).max(1))
    } else {
        current
    };
    let min = min_rows.max(1);
    let max = max_rows.unwrap_or(usize::MAX).max(min);
    next.clamp(min, max)
}

/// Replace the dataset key of `params` with `partition`
fn with_partition(params: &Value, key: &str, partition: Vec<Value>) -> Value {
    let mut params = params.clone();
    if let Value::Object(map) = &mut params {
        map.insert(key.to_string(), Value::Array(partition));
    }
    params
}

/// Wraps an action to process its dataset in partitions
pub struct ChunkProcessor {
    inner: Arc<dyn Action>,
    dataset_param: String,
    bound: PartitionBound,
    aggregator: Arc<dyn Aggregator>,
    min_rows: usize,
    max_rows: Option<usize>,
    checkpoints: Option<(Arc<dyn CheckpointStore>, String)>,
    probe: Option<Arc<dyn MemoryProbe>>,
}

impl ChunkProcessor {
    pub fn wrap(
        inner: Arc<dyn Action>,
        dataset_param: impl Into<String>,
        bound: PartitionBound,
        aggregator: Arc<dyn Aggregator>,
    ) -> Self {
        Self {
            inner,
            dataset_param: dataset_param.into(),
            bound,
            aggregator,
            min_rows: default_min_rows(),
            max_rows: None,
            checkpoints: None,
            probe: None,
        }
    }

    /// Build from a step's chunking block. Memory-bounded adaptive blocks get a
    /// `sysinfo` probe.
    pub fn from_config(inner: Arc<dyn Action>, config: &ChunkingConfig) -> Self {
        let bound = config
            .bound()
            .unwrap_or(PartitionBound::Rows(config.partition_rows.unwrap_or(1)));
        let mut processor = Self::wrap(
            inner,
            config.dataset_param.clone(),
            bound,
            config.aggregator.build(),
        )
        .with_row_limits(config.min_rows, config.max_rows.or(config.partition_rows));

        if config.adaptive && matches!(bound, PartitionBound::MemoryBytes(_)) {
            processor = processor.with_memory_probe(Arc::new(SysinfoProbe::new()));
        }
        processor
    }

    pub fn with_row_limits(mut self, min_rows: usize, max_rows: Option<usize>) -> Self {
        self.min_rows = min_rows.max(1);
        self.max_rows = max_rows;
        self
    }

    pub fn with_checkpoints(mut self, store: Arc<dyn CheckpointStore>, key: impl Into<String>) -> Self {
        self.checkpoints = Some((store, key.into()));
        self
    }

    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Current reading of the memory probe, if one is attached
    pub fn memory_usage(&self) -> Option<u64> {
        self.probe.as_ref().and_then(|probe| probe.used_bytes())
    }

    fn budget(&self) -> Option<u64> {
        match self.bound {
            PartitionBound::MemoryBytes(bytes) => Some(bytes),
            PartitionBound::Rows(_) => None,
        }
    }

    /// First partition size; a memory bound divides by the average row size
    fn initial_partition_rows(&self, rows: &[Value]) -> usize {
        let rows_for_bound = match self.bound {
            PartitionBound::Rows(n) => n,
            PartitionBound::MemoryBytes(budget) => {
                if rows.is_empty() {
                    1
                } else {
                    let total: usize = rows.iter().map(|row| row.to_string().len()).sum();
                    let average = (total / rows.len()).max(1) as u64;
                    usize::try_from(budget / average).unwrap_or(usize::MAX)
                }
            }
        };
        let min = self.min_rows.max(1);
        rows_for_bound
            .max(min)
            .min(self.max_rows.unwrap_or(usize::MAX).max(min))
    }

    async fn resume_state(&self, fingerprint: &str, total: usize) -> Result<Option<ChunkCheckpoint>, ActionError> {
        let Some((store, key)) = &self.checkpoints else {
            return Ok(None);
        };
        match store.load(key).await.map_err(ActionError::from)? {
            Some(saved) if saved.fingerprint == fingerprint && saved.next_row <= total => {
                info!(
                    "Resuming '{}' at partition {} (row {})",
                    key, saved.partitions_completed, saved.next_row
                );
                Ok(Some(saved))
            }
            Some(_) => {
                warn!("Discarding checkpoint '{}' recorded for different input", key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn save_state(&self, state: &ChunkCheckpoint) -> Result<(), ActionError> {
        if let Some((store, key)) = &self.checkpoints {
            store.save(key, state).await.map_err(ActionError::from)?;
        }
        Ok(())
    }

    async fn clear_state(&self) -> Result<(), ActionError> {
        if let Some((store, key)) = &self.checkpoints {
            store.clear(key).await.map_err(ActionError::from)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Action for ChunkProcessor {
    async fn execute(&self, params: &Value, context: &mut ExecutionContext) -> ActionResult {
        let rows = match params.get(&self.dataset_param) {
            Some(Value::Array(rows)) => rows,
            Some(_) => {
                return ActionResult::from_error(ActionError::validation(format!(
                    "chunked parameter '{}' must be a list of rows",
                    self.dataset_param
                )))
            }
            None => {
                return ActionResult::from_error(ActionError::validation(format!(
                    "chunked parameter '{}' is missing",
                    self.dataset_param
                )))
            }
        };
        let total = rows.len();

        if total == 0 {
            let result = self
                .inner
                .execute(&with_partition(params, &self.dataset_param, Vec::new()), context)
                .await;
            if !result.success {
                return result;
            }
            return match self.aggregator.combine(None, result.data.clone().unwrap_or(Value::Null)) {
                Ok(data) => ActionResult {
                    data: Some(data),
                    ..result
                },
                Err(e) => ActionResult::from_error(e),
            };
        }

        let fingerprint = fingerprint(params);
        let mut state = match self.resume_state(&fingerprint, total).await {
            Ok(Some(saved)) => saved,
            Ok(None) => {
                let mut fresh = ChunkCheckpoint::new(fingerprint);
                fresh.partition_rows = self.initial_partition_rows(rows);
                fresh
            }
            Err(e) => return ActionResult::from_error(e),
        };

        let baseline = self.memory_usage().unwrap_or(0);
        let mut retries = 0u32;
        let mut served_by = None;

        while state.next_row < total {
            let start = state.next_row;
            let end = start.saturating_add(state.partition_rows.max(1)).min(total);
            debug!(
                "Partition {} covers rows {}..{} of {}",
                state.partitions_completed, start, end, total
            );

            let partition = rows[start..end].to_vec();
            let result = self
                .inner
                .execute(&with_partition(params, &self.dataset_param, partition), context)
                .await;
            retries += result.retries;
            if !result.success {
                let error = result.error_or_default();
                return ActionResult::from_error(ActionError::new(
                    error.kind,
                    format!(
                        "partition {} (rows {}..{}): {}",
                        state.partitions_completed, start, end, error.message
                    ),
                ))
                .with_retries(retries);
            }
            if result.served_by.is_some() {
                served_by = result.served_by;
            }

            let partial = result.data.unwrap_or(Value::Null);
            state.aggregate = match self.aggregator.combine(state.aggregate.take(), partial) {
                Ok(aggregate) => Some(aggregate),
                Err(e) => return ActionResult::from_error(e).with_retries(retries),
            };
            state.partitions_completed += 1;
            state.next_row = end;
            state.updated_at = Utc::now();

            if let (Some(budget), Some(used)) = (self.budget(), self.memory_usage()) {
                let next = adapt_partition_rows(
                    state.partition_rows,
                    used.saturating_sub(baseline),
                    budget,
                    self.min_rows,
                    self.max_rows,
                );
                if next != state.partition_rows {
                    debug!("Partition size {} -> {} rows", state.partition_rows, next);
                    state.partition_rows = next;
                }
            }

            if let Err(e) = self.save_state(&state).await {
                return ActionResult::from_error(e).with_retries(retries);
            }
        }

        if let Err(e) = self.clear_state().await {
            return ActionResult::from_error(e).with_retries(retries);
        }

        let mut result = ActionResult::success(state.aggregate.unwrap_or(Value::Null)).with_retries(retries);
        result.served_by = served_by;
        result
    }

    fn description(&self) -> &str {
        self.inner.description()
    }
}
