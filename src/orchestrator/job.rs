//! Job records and the pure job state machine

use crate::actions::ActionError;
use crate::context::ContextSnapshot;
use crate::error::{ErrorKind, Result, StrataError};
use crate::resolver::ResolvedReference;
use crate::strategy::FailurePolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Unique job identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for JobId {
    type Err = StrataError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| StrataError::JobNotFound {
                job_id: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validate a status change.
///
/// `PENDING -> RUNNING -> COMPLETED | FAILED | CANCELLED`; a pending job may
/// also be cancelled or fail before it starts. Terminal states are final.
pub fn transition(from: JobStatus, to: JobStatus) -> Result<JobStatus> {
    use JobStatus::*;
    match (from, to) {
        (Pending, Running)
        | (Pending, Cancelled)
        | (Pending, Failed)
        | (Running, Completed)
        | (Running, Failed)
        | (Running, Cancelled) => Ok(to),
        _ => Err(StrataError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
}

/// Outcome of one step, in execution order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub step_index: usize,
    pub step_name: String,
    pub action_type: String,
    pub status: StepStatus,
    pub failure_policy: FailurePolicy,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Redacted failure detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ActionError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub served_by: Option<String>,
    #[serde(default)]
    pub retries: u32,
    /// Which source satisfied each placeholder in the step's params
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resolved: Vec<ResolvedReference>,
}

impl AuditEntry {
    pub fn succeeded(&self) -> bool {
        self.status == StepStatus::Succeeded
    }
}

/// User-visible summary of why a job failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_type: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.step_name, &self.action_type) {
            (Some(step), Some(action)) => write!(
                f,
                "step '{}' ({}) failed with {}: {}",
                step, action, self.kind, self.message
            ),
            _ => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

/// Request to run a strategy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub strategy_name: String,
    #[serde(default)]
    pub parameter_overrides: Map<String, Value>,
    /// Overrides the configured job timeout
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub job_timeout: Option<Duration>,
    /// Checkpoint namespace for chunked steps; defaults to the job id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_key: Option<String>,
}

impl ExecutionRequest {
    pub fn new(strategy_name: impl Into<String>) -> Self {
        Self {
            strategy_name: strategy_name.into(),
            ..Self::default()
        }
    }

    pub fn with_override(mut self, name: impl Into<String>, value: Value) -> Self {
        self.parameter_overrides.insert(name.into(), value);
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }

    pub fn with_resume_key(mut self, key: impl Into<String>) -> Self {
        self.resume_key = Some(key.into());
        self
    }
}

/// One execution of a strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub strategy_name: String,
    pub status: JobStatus,
    pub request: ExecutionRequest,
    pub audit_trail: Vec<AuditEntry>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<JobFailure>,
    /// Context as of the end of the job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextSnapshot>,
}

impl Job {
    pub fn new(request: ExecutionRequest) -> Self {
        Self {
            id: JobId::new(),
            strategy_name: request.strategy_name.clone(),
            status: JobStatus::Pending,
            request,
            audit_trail: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            failure: None,
            context: None,
        }
    }

    /// Move to `next`, stamping start and finish times
    pub fn transition_to(&mut self, next: JobStatus) -> Result<()> {
        self.status = transition(self.status, next)?;
        match next {
            JobStatus::Running => self.started_at = Some(Utc::now()),
            status if status.is_terminal() => self.finished_at = Some(Utc::now()),
            _ => {}
        }
        Ok(())
    }

    /// Steps that ran and succeeded
    pub fn completed_steps(&self) -> usize {
        self.audit_trail
            .iter()
            .filter(|entry| entry.succeeded())
            .count()
    }

    pub fn report(&self) -> JobStatusReport {
        JobStatusReport {
            job_id: self.id,
            strategy_name: self.strategy_name.clone(),
            status: self.status,
            audit_trail: self.audit_trail.clone(),
        }
    }

    pub fn outcome(&self) -> JobResult {
        match self.status {
            JobStatus::Completed => JobResult::Completed {
                context: self.context.clone().unwrap_or_default(),
            },
            JobStatus::Failed => JobResult::Failed {
                failure: self.failure.clone().unwrap_or(JobFailure {
                    step_name: None,
                    action_type: None,
                    kind: ErrorKind::ActionExecution,
                    message: "job failed".to_string(),
                }),
            },
            JobStatus::Cancelled => JobResult::Cancelled {
                completed_steps: self.completed_steps(),
            },
            current => JobResult::InProgress { current },
        }
    }
}

/// Answer to a status query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusReport {
    pub job_id: JobId,
    pub strategy_name: String,
    pub status: JobStatus,
    pub audit_trail: Vec<AuditEntry>,
}

/// Answer to a result query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobResult {
    Completed { context: ContextSnapshot },
    Failed { failure: JobFailure },
    Cancelled { completed_steps: usize },
    InProgress { current: JobStatus },
}
