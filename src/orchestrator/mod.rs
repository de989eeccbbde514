//! Job orchestration
//!
//! The orchestrator accepts execution requests, runs each job's steps in
//! declaration order, and keeps every job record until the caller takes it.
//! Jobs beyond `max_concurrent_jobs` wait in `PENDING` for a free slot.

pub mod job;
mod runner;

pub use job::{
    transition, AuditEntry, ExecutionRequest, Job, JobFailure, JobId, JobResult, JobStatus,
    JobStatusReport, StepStatus,
};
pub use runner::CancellationFlag;

use crate::actions::ActionRegistry;
use crate::chunk::{CheckpointStore, FileCheckpointStore};
use crate::config::EngineConfig;
use crate::context::BlockingPool;
use crate::error::{Result, StrataError};
use crate::redact::Redactor;
use crate::resolver::{ParameterDefaults, ParameterResolver};
use crate::strategy::StrategyCatalog;
use runner::{Engine, JobHandle};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::{debug, info};

struct Inner {
    engine: Engine,
    catalog: Arc<StrategyCatalog>,
    slots: Arc<Semaphore>,
    jobs: RwLock<HashMap<JobId, JobHandle>>,
}

/// Builder for [`Orchestrator`]
pub struct OrchestratorBuilder {
    registry: ActionRegistry,
    catalog: StrategyCatalog,
    config: EngineConfig,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    redactor: Option<Redactor>,
}

impl OrchestratorBuilder {
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Store chunk checkpoints here instead of under `checkpoint_dir`
    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// Replace the redactor derived from `secret_env_keys`
    pub fn with_redactor(mut self, redactor: Redactor) -> Self {
        self.redactor = Some(redactor);
        self
    }

    pub fn build(self) -> Orchestrator {
        let config = self.config;
        let checkpoints = self
            .checkpoints
            .unwrap_or_else(|| Arc::new(FileCheckpointStore::new(config.checkpoint_dir.clone())));
        let redactor = self.redactor.unwrap_or_else(|| config.redactor());

        let engine = Engine {
            registry: self.registry,
            resolver: ParameterResolver::new(ParameterDefaults::new(
                config.parameter_defaults.clone(),
            )),
            checkpoints,
            redactor,
            blocking: BlockingPool::new(config.blocking_pool_size),
            default_step_timeout: config.default_step_timeout,
            default_job_timeout: config.job_timeout,
        };

        Orchestrator {
            inner: Arc::new(Inner {
                engine,
                catalog: Arc::new(self.catalog),
                slots: Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1))),
                jobs: RwLock::new(HashMap::new()),
            }),
        }
    }
}

/// Runs strategies as jobs
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn builder(registry: ActionRegistry, catalog: StrategyCatalog) -> OrchestratorBuilder {
        OrchestratorBuilder {
            registry,
            catalog,
            config: EngineConfig::default(),
            checkpoints: None,
            redactor: None,
        }
    }

    pub fn new(registry: ActionRegistry, catalog: StrategyCatalog) -> Self {
        Self::builder(registry, catalog).build()
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.inner.engine.registry
    }

    pub fn catalog(&self) -> &StrategyCatalog {
        &self.inner.catalog
    }

    /// Queue a job and return its id immediately
    pub async fn submit(&self, request: ExecutionRequest) -> Result<JobId> {
        let strategy = self.inner.catalog.get(&request.strategy_name)?;
        let handle = self.register(request).await;
        let id = handle.job.read().await.id;
        info!("Submitted job {} for strategy '{}'", id, strategy.name);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let Ok(_permit) = Arc::clone(&inner.slots).acquire_owned().await else {
                return;
            };
            inner.engine.run_job(strategy, handle).await;
        });

        Ok(id)
    }

    /// Run a job on the calling task and return its final record
    pub async fn run(&self, request: ExecutionRequest) -> Result<Job> {
        let strategy = self.inner.catalog.get(&request.strategy_name)?;
        let handle = self.register(request).await;
        let _permit = self.acquire_slot().await?;
        self.inner.engine.run_job(strategy, handle.clone()).await;
        let job = handle.job.read().await.clone();
        Ok(job)
    }

    pub async fn status(&self, id: JobId) -> Result<JobStatusReport> {
        let handle = self.handle(id).await?;
        let report = handle.job.read().await.report();
        Ok(report)
    }

    pub async fn result(&self, id: JobId) -> Result<JobResult> {
        let handle = self.handle(id).await?;
        let outcome = handle.job.read().await.outcome();
        Ok(outcome)
    }

    /// Request cancellation.
    ///
    /// A pending job is cancelled at once; a running job stops before its
    /// next step. Returns the status as of the call.
    pub async fn cancel(&self, id: JobId) -> Result<JobStatus> {
        let handle = self.handle(id).await?;
        handle.cancel.cancel();

        if handle.cancel_if_pending().await {
            info!("Cancelled pending job {}", id);
            return Ok(JobStatus::Cancelled);
        }

        let status = handle.job.read().await.status;
        debug!("Cancellation requested for job {} ({})", id, status);
        Ok(status)
    }

    /// Wait until the job reaches a terminal status
    pub async fn wait(&self, id: JobId) -> Result<Job> {
        let handle = self.handle(id).await?;
        let mut status = handle.status.subscribe();
        loop {
            if status.borrow_and_update().is_terminal() {
                break;
            }
            if status.changed().await.is_err() {
                break;
            }
        }
        let job = handle.job.read().await.clone();
        Ok(job)
    }

    /// Remove a finished job's record. Unfinished jobs stay and yield `None`.
    pub async fn take(&self, id: JobId) -> Result<Option<Job>> {
        let mut jobs = self.inner.jobs.write().await;
        let handle = jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| StrataError::JobNotFound {
                job_id: id.to_string(),
            })?;

        let job = handle.job.read().await.clone();
        if !job.status.is_terminal() {
            return Ok(None);
        }
        jobs.remove(&id);
        Ok(Some(job))
    }

    /// Every retained job with its current status
    pub async fn jobs(&self) -> Vec<(JobId, JobStatus)> {
        let handles: Vec<JobHandle> = self.inner.jobs.read().await.values().cloned().collect();
        let mut listing = Vec::with_capacity(handles.len());
        for handle in handles {
            let job = handle.job.read().await;
            listing.push((job.id, job.status));
        }
        listing
    }

    async fn register(&self, request: ExecutionRequest) -> JobHandle {
        let job = Job::new(request);
        let id = job.id;
        let handle = JobHandle::new(job);
        self.inner.jobs.write().await.insert(id, handle.clone());
        handle
    }

    async fn handle(&self, id: JobId) -> Result<JobHandle> {
        self.inner
            .jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| StrataError::JobNotFound {
                job_id: id.to_string(),
            })
    }

    async fn acquire_slot(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.inner.slots)
            .acquire_owned()
            .await
            .map_err(|e| StrataError::Io(std::io::Error::other(e)))
    }
}
