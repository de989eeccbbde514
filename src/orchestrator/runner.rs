//! Step-by-step execution of a single job

use super::job::{AuditEntry, Job, JobFailure, JobStatus, StepStatus};
use crate::actions::{Action, ActionError, ActionRegistry};
use crate::chunk::{CheckpointStore, ChunkProcessor};
use crate::context::{BlockingPool, ExecutionContext};
use crate::error::{Result, StrataError};
use crate::redact::Redactor;
use crate::resolver::{ParameterResolver, ResolvedReference};
use crate::retry::RetryingAction;
use crate::strategy::{FailurePolicy, Step, Strategy};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Cooperative cancellation, observed between steps
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Shared view of one job: the record, a status channel, and its cancel flag
#[derive(Clone)]
pub(crate) struct JobHandle {
    pub job: Arc<RwLock<Job>>,
    pub status: Arc<watch::Sender<JobStatus>>,
    pub cancel: CancellationFlag,
}

impl JobHandle {
    pub fn new(job: Job) -> Self {
        let (status, _) = watch::channel(job.status);
        Self {
            job: Arc::new(RwLock::new(job)),
            status: Arc::new(status),
            cancel: CancellationFlag::new(),
        }
    }

    /// Apply a transition and publish the new status
    pub async fn transition(&self, next: JobStatus) -> Result<()> {
        let mut job = self.job.write().await;
        job.transition_to(next)?;
        self.status.send_replace(job.status);
        Ok(())
    }

    /// Cancel the job only if no runner has started it. The check and the
    /// transition happen under one write guard.
    pub async fn cancel_if_pending(&self) -> bool {
        let mut job = self.job.write().await;
        if job.status != JobStatus::Pending || job.transition_to(JobStatus::Cancelled).is_err() {
            return false;
        }
        self.status.send_replace(job.status);
        true
    }

    async fn record(&self, entry: AuditEntry) {
        self.job.write().await.audit_trail.push(entry);
    }

    /// Move to a terminal status and store the final context and failure.
    /// A refused transition leaves the record as it was.
    async fn finish(
        &self,
        status: JobStatus,
        context: &ExecutionContext,
        failure: Option<JobFailure>,
    ) {
        let mut job = self.job.write().await;
        if let Err(e) = job.transition_to(status) {
            warn!("Job {} could not finish as {}: {}", job.id, status, e);
            return;
        }
        job.context = Some(context.snapshot());
        job.failure = failure;
        self.status.send_replace(job.status);
    }
}

enum StepOutcome {
    Succeeded {
        data: Option<Value>,
        served_by: Option<String>,
        retries: u32,
        trace: Vec<ResolvedReference>,
    },
    Failed {
        error: ActionError,
        served_by: Option<String>,
        retries: u32,
        trace: Vec<ResolvedReference>,
        /// The job deadline, not the step's own limit, cut the step short
        job_timed_out: bool,
    },
}

impl StepOutcome {
    fn failed(error: ActionError, trace: Vec<ResolvedReference>) -> Self {
        StepOutcome::Failed {
            error,
            served_by: None,
            retries: 0,
            trace,
            job_timed_out: false,
        }
    }
}

/// Everything a job needs that is shared across jobs
pub(crate) struct Engine {
    pub registry: ActionRegistry,
    pub resolver: ParameterResolver,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub redactor: Redactor,
    pub blocking: BlockingPool,
    pub default_step_timeout: Option<Duration>,
    pub default_job_timeout: Option<Duration>,
}

impl Engine {
    /// Drive `handle`'s job to a terminal status
    pub async fn run_job(&self, strategy: Arc<Strategy>, handle: JobHandle) {
        let (job_id, request) = {
            let job = handle.job.read().await;
            if job.status.is_terminal() {
                debug!("Job {} finished before it started ({})", job.id, job.status);
                return;
            }
            (job.id, job.request.clone())
        };

        let mut context = ExecutionContext::for_strategy(
            job_id.to_string(),
            &strategy,
            &request.parameter_overrides,
        )
        .with_blocking_pool(self.blocking.clone());

        if let Err(e) = handle.transition(JobStatus::Running).await {
            warn!("Job {} could not start: {}", job_id, e);
            return;
        }
        info!(
            "Job {} started strategy '{}' ({} steps)",
            job_id,
            strategy.name,
            strategy.steps.len()
        );

        if let Some(failure) = self.preflight(&strategy, &handle).await {
            warn!("Job {} failed before running any step: {}", job_id, failure);
            handle
                .finish(JobStatus::Failed, &context, Some(failure))
                .await;
            return;
        }

        let deadline = request
            .job_timeout
            .or(self.default_job_timeout)
            .map(|timeout| (Instant::now() + timeout, timeout));
        let resume_key = request
            .resume_key
            .clone()
            .unwrap_or_else(|| job_id.to_string());

        for (index, step) in strategy.steps.iter().enumerate() {
            if handle.cancel.is_cancelled() {
                info!("Job {} cancelled before step '{}'", job_id, step.name);
                handle.finish(JobStatus::Cancelled, &context, None).await;
                return;
            }

            let remaining = match deadline {
                Some((at, limit)) => {
                    let now = Instant::now();
                    if now >= at {
                        let failure = self.failure(
                            Some(step),
                            ActionError::from(StrataError::Timeout {
                                scope: "job".to_string(),
                                limit,
                            }),
                        );
                        warn!("Job {} timed out before step '{}'", job_id, step.name);
                        handle
                            .finish(JobStatus::Failed, &context, Some(failure))
                            .await;
                        return;
                    }
                    Some(at - now)
                }
                None => None,
            };

            let rollback = (step.failure_policy == FailurePolicy::Soft).then(|| context.clone());
            let started_at = Utc::now();
            let clock = Instant::now();
            debug!("Job {} running step {} '{}'", job_id, index, step.name);

            let outcome = self
                .execute_step(step, &mut context, &resume_key, remaining)
                .await;
            let duration_ms = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX);

            match outcome {
                StepOutcome::Succeeded {
                    data,
                    served_by,
                    retries,
                    trace,
                } => {
                    if let Some(key) = &step.output_key {
                        context.set_dataset(key.clone(), data.unwrap_or(Value::Null));
                    }
                    handle
                        .record(self.audit(index, step, started_at, duration_ms, None, served_by, retries, trace))
                        .await;
                    debug!("Job {} step '{}' succeeded in {}ms", job_id, step.name, duration_ms);
                }
                StepOutcome::Failed {
                    error,
                    served_by,
                    retries,
                    trace,
                    job_timed_out,
                } => {
                    let error = ActionError::new(error.kind, self.redactor.redact(&error.message));
                    warn!(
                        "Job {} step '{}' ({}) failed: {}",
                        job_id, step.name, step.action_type, error
                    );
                    handle
                        .record(self.audit(
                            index,
                            step,
                            started_at,
                            duration_ms,
                            Some(error.clone()),
                            served_by,
                            retries,
                            trace,
                        ))
                        .await;

                    if job_timed_out || step.failure_policy == FailurePolicy::Hard {
                        let failure = self.failure(Some(step), error);
                        handle
                            .finish(JobStatus::Failed, &context, Some(failure))
                            .await;
                        return;
                    }

                    if let Some(previous) = rollback {
                        context = previous;
                    }
                }
            }
        }

        info!("Job {} completed strategy '{}'", job_id, strategy.name);
        handle.finish(JobStatus::Completed, &context, None).await;
    }

    /// Check every action type before any step runs
    async fn preflight(&self, strategy: &Strategy, handle: &JobHandle) -> Option<JobFailure> {
        for (index, step) in strategy.steps.iter().enumerate() {
            let Some(missing) = step
                .action_types()
                .find(|action_type| !self.registry.contains(action_type))
            else {
                continue;
            };

            let error = ActionError::from(StrataError::ActionNotFound {
                action_type: missing.to_string(),
            });
            handle
                .record(self.audit(index, step, Utc::now(), 0, Some(error.clone()), None, 0, Vec::new()))
                .await;
            return Some(self.failure(Some(step), error));
        }
        None
    }

    async fn execute_step(
        &self,
        step: &Step,
        context: &mut ExecutionContext,
        resume_key: &str,
        remaining: Option<Duration>,
    ) -> StepOutcome {
        let resolution = match self.resolver.resolve(&step.params, &context.scopes()) {
            Ok(resolution) => resolution,
            Err(e) => return StepOutcome::failed(ActionError::from(&e), Vec::new()),
        };

        let action = match self.build_action(step, resume_key) {
            Ok(action) => action,
            Err(e) => return StepOutcome::failed(ActionError::from(&e), resolution.trace),
        };

        let step_limit = step.timeout.or(self.default_step_timeout);
        let (limit, job_bound) = match (step_limit, remaining) {
            (Some(own), Some(left)) if left < own => (Some(left), true),
            (Some(own), _) => (Some(own), false),
            (None, Some(left)) => (Some(left), true),
            (None, None) => (None, false),
        };

        let result = match limit {
            Some(limit) => {
                match tokio::time::timeout(limit, action.execute(&resolution.value, context)).await {
                    Ok(result) => result,
                    Err(_) => {
                        let scope = if job_bound {
                            "job".to_string()
                        } else {
                            format!("step '{}'", step.name)
                        };
                        return StepOutcome::Failed {
                            error: ActionError::from(StrataError::Timeout { scope, limit }),
                            served_by: None,
                            retries: 0,
                            trace: resolution.trace,
                            job_timed_out: job_bound,
                        };
                    }
                }
            }
            None => action.execute(&resolution.value, context).await,
        };

        if result.success {
            StepOutcome::Succeeded {
                data: result.data,
                served_by: result.served_by,
                retries: result.retries,
                trace: resolution.trace,
            }
        } else {
            StepOutcome::Failed {
                error: result.error_or_default(),
                served_by: result.served_by,
                retries: result.retries,
                trace: resolution.trace,
                job_timed_out: false,
            }
        }
    }

    /// Resolve the step's action and apply its retry and chunking wrappers
    fn build_action(&self, step: &Step, resume_key: &str) -> Result<Arc<dyn Action>> {
        let mut action = self.registry.resolve(&step.action_type)?;

        if let Some(retry) = &step.retry {
            let mut wrapped =
                RetryingAction::new(action, step.action_type.clone(), retry.policy.clone())
                    .with_redactor(self.redactor.clone());
            if let Some(fallback) = &retry.fallback_action {
                wrapped = wrapped.with_fallback(fallback.clone(), self.registry.resolve(fallback)?);
            }
            action = Arc::new(wrapped);
        }

        if let Some(chunking) = &step.chunking {
            action = Arc::new(
                ChunkProcessor::from_config(action, chunking).with_checkpoints(
                    Arc::clone(&self.checkpoints),
                    format!("{resume_key}/{}", step.name),
                ),
            );
        }

        Ok(action)
    }

    #[allow(clippy::too_many_arguments)]
    fn audit(
        &self,
        index: usize,
        step: &Step,
        started_at: DateTime<Utc>,
        duration_ms: u64,
        error: Option<ActionError>,
        served_by: Option<String>,
        retries: u32,
        resolved: Vec<ResolvedReference>,
    ) -> AuditEntry {
        AuditEntry {
            step_index: index,
            step_name: step.name.clone(),
            action_type: step.action_type.clone(),
            status: if error.is_some() {
                StepStatus::Failed
            } else {
                StepStatus::Succeeded
            },
            failure_policy: step.failure_policy,
            started_at,
            duration_ms,
            error,
            served_by,
            retries,
            resolved,
        }
    }

    fn failure(&self, step: Option<&Step>, error: ActionError) -> JobFailure {
        JobFailure {
            step_name: step.map(|step| step.name.clone()),
            action_type: step.map(|step| step.action_type.clone()),
            kind: error.kind,
            message: self.redactor.redact(&error.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::job::ExecutionRequest;
    use serde_json::json;

    fn handle() -> JobHandle {
        JobHandle::new(Job::new(ExecutionRequest::new("demo")))
    }

    #[tokio::test]
    async fn test_cancel_if_pending_cancels_waiting_job() {
        let handle = handle();
        assert!(handle.cancel_if_pending().await);
        assert_eq!(handle.job.read().await.status, JobStatus::Cancelled);
        assert_eq!(*handle.status.borrow(), JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_if_pending_leaves_started_job_running() {
        let handle = handle();
        handle.transition(JobStatus::Running).await.unwrap();

        assert!(!handle.cancel_if_pending().await);
        assert_eq!(handle.job.read().await.status, JobStatus::Running);
        assert_eq!(*handle.status.borrow(), JobStatus::Running);
    }

    #[tokio::test]
    async fn test_refused_finish_keeps_the_terminal_record() {
        let handle = handle();
        assert!(handle.cancel_if_pending().await);

        let mut context = ExecutionContext::new("job", "demo");
        context.set_dataset("late", json!(1));
        let failure = JobFailure {
            step_name: Some("late".to_string()),
            action_type: Some("set".to_string()),
            kind: crate::error::ErrorKind::ActionExecution,
            message: "too late".to_string(),
        };
        handle
            .finish(JobStatus::Failed, &context, Some(failure))
            .await;

        let job = handle.job.read().await;
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.context.is_none());
        assert!(job.failure.is_none());
    }

    #[tokio::test]
    async fn test_started_job_ignores_late_pending_cancel() {
        let handle = handle();
        handle.transition(JobStatus::Running).await.unwrap();
        handle.cancel.cancel();
        assert!(!handle.cancel_if_pending().await);

        let context = ExecutionContext::new("job", "demo");
        handle.finish(JobStatus::Cancelled, &context, None).await;

        let job = handle.job.read().await;
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.context.is_some());
    }
}
