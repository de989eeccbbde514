use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub mod codes;

pub use codes::{describe_error_code, ErrorCode};

/// Result alias used across the engine
pub type Result<T> = std::result::Result<T, StrataError>;

/// Discriminant shared by engine errors and action-reported failures.
///
/// This is what ends up in the audit trail, so it is serialized in
/// `snake_case` and never carries free-form data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Definition,
    ActionNotFound,
    DuplicateAction,
    ParameterResolution,
    CircularReference,
    ActionExecution,
    Timeout,
    Cancelled,
    RateLimited,
    Network,
    ServiceUnavailable,
    Validation,
    NotFound,
    StrategyNotFound,
    JobNotFound,
    InvalidTransition,
    Checkpoint,
    Config,
    Io,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Definition => "definition",
            ErrorKind::ActionNotFound => "action_not_found",
            ErrorKind::DuplicateAction => "duplicate_action",
            ErrorKind::ParameterResolution => "parameter_resolution",
            ErrorKind::CircularReference => "circular_reference",
            ErrorKind::ActionExecution => "action_execution",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Network => "network",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::StrategyNotFound => "strategy_not_found",
            ErrorKind::JobNotFound => "job_not_found",
            ErrorKind::InvalidTransition => "invalid_transition",
            ErrorKind::Checkpoint => "checkpoint",
            ErrorKind::Config => "config",
            ErrorKind::Io => "io",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single problem found while validating a strategy definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefinitionIssue {
    /// Path-qualified field, e.g. `steps[2].action_type`
    pub field: String,
    pub message: String,
}

impl DefinitionIssue {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for DefinitionIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn join_issues(issues: &[DefinitionIssue]) -> String {
    issues
        .iter()
        .map(|issue| issue.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// The unified error type for the strata engine
#[derive(Error, Debug)]
pub enum StrataError {
    #[error("[E{code:04}] Configuration error: {message}", code = ErrorCode::CONFIG_GENERIC)]
    Config {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error(
        "[E{code:04}] Invalid strategy definition '{origin}': {issues}",
        code = ErrorCode::DEFINITION_INVALID,
        issues = join_issues(.issues)
    )]
    Definition {
        /// Declared name or storage location of the offending definition
        origin: String,
        issues: Vec<DefinitionIssue>,
    },

    #[error("[E{code:04}] Action type '{action_type}' is not registered", code = ErrorCode::EXEC_ACTION_NOT_FOUND)]
    ActionNotFound { action_type: String },

    #[error("[E{code:04}] Action type '{action_type}' is already registered", code = ErrorCode::EXEC_DUPLICATE_ACTION)]
    DuplicateAction { action_type: String },

    #[error(
        "[E{code:04}] Cannot resolve '${{{reference}}}': {reason}",
        code = ErrorCode::EXEC_PARAMETER_RESOLUTION
    )]
    ParameterResolution { reference: String, reason: String },

    #[error(
        "[E{code:04}] Circular parameter reference: {chain}",
        code = ErrorCode::EXEC_CIRCULAR_REFERENCE,
        chain = .cycle.join(" -> ")
    )]
    CircularReference { cycle: Vec<String> },

    #[error("[E{code:04}] Action '{action_type}' failed: {message}", code = ErrorCode::EXEC_ACTION_FAILED)]
    ActionExecution { action_type: String, message: String },

    #[error("[E{code:04}] {scope} timed out after {limit:?}", code = ErrorCode::EXEC_TIMEOUT)]
    Timeout { scope: String, limit: Duration },

    #[error("[E{code:04}] Job {job_id} was cancelled", code = ErrorCode::JOB_CANCELLED)]
    Cancelled { job_id: String },

    #[error("[E{code:04}] Strategy '{name}' not found", code = ErrorCode::JOB_STRATEGY_NOT_FOUND)]
    StrategyNotFound { name: String },

    #[error("[E{code:04}] Job {job_id} not found", code = ErrorCode::JOB_NOT_FOUND)]
    JobNotFound { job_id: String },

    #[error(
        "[E{code:04}] Invalid job transition from {from} to {to}",
        code = ErrorCode::JOB_INVALID_TRANSITION
    )]
    InvalidTransition { from: String, to: String },

    #[error("[E{code:04}] Checkpoint error: {message}", code = ErrorCode::EXEC_CHECKPOINT_ERROR)]
    Checkpoint {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[E{code:04}] I/O error: {0}", code = ErrorCode::OTHER_IO)]
    Io(#[from] std::io::Error),
}

impl StrataError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            path: None,
            source: None,
        }
    }

    /// Create a definition error with a single issue
    pub fn definition(
        origin: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Definition {
            origin: origin.into(),
            issues: vec![DefinitionIssue::new(field, message)],
        }
    }

    /// Create a parameter resolution error
    pub fn resolution(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ParameterResolution {
            reference: reference.into(),
            reason: reason.into(),
        }
    }

    /// Create a checkpoint error
    pub fn checkpoint(message: impl Into<String>, path: Option<PathBuf>) -> Self {
        Self::Checkpoint {
            message: message.into(),
            path,
            source: None,
        }
    }

    /// Add a source error to variants that carry one
    pub fn with_source(
        mut self,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        match &mut self {
            Self::Config { source: src, .. } | Self::Checkpoint { source: src, .. } => {
                *src = Some(source.into());
            }
            _ => {}
        }
        self
    }

    /// Attach a path to configuration and checkpoint errors
    pub fn with_path(mut self, new_path: impl Into<PathBuf>) -> Self {
        match &mut self {
            Self::Config { path, .. } | Self::Checkpoint { path, .. } => {
                *path = Some(new_path.into());
            }
            _ => {}
        }
        self
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config { .. } => ErrorKind::Config,
            Self::Definition { .. } => ErrorKind::Definition,
            Self::ActionNotFound { .. } => ErrorKind::ActionNotFound,
            Self::DuplicateAction { .. } => ErrorKind::DuplicateAction,
            Self::ParameterResolution { .. } => ErrorKind::ParameterResolution,
            Self::CircularReference { .. } => ErrorKind::CircularReference,
            Self::ActionExecution { .. } => ErrorKind::ActionExecution,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::StrategyNotFound { .. } => ErrorKind::StrategyNotFound,
            Self::JobNotFound { .. } => ErrorKind::JobNotFound,
            Self::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Self::Checkpoint { .. } => ErrorKind::Checkpoint,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// Get the error code
    pub fn code(&self) -> u16 {
        match self {
            Self::Config { .. } => ErrorCode::CONFIG_GENERIC,
            Self::Definition { .. } => ErrorCode::DEFINITION_INVALID,
            Self::ActionNotFound { .. } => ErrorCode::EXEC_ACTION_NOT_FOUND,
            Self::DuplicateAction { .. } => ErrorCode::EXEC_DUPLICATE_ACTION,
            Self::ParameterResolution { .. } => ErrorCode::EXEC_PARAMETER_RESOLUTION,
            Self::CircularReference { .. } => ErrorCode::EXEC_CIRCULAR_REFERENCE,
            Self::ActionExecution { .. } => ErrorCode::EXEC_ACTION_FAILED,
            Self::Timeout { .. } => ErrorCode::EXEC_TIMEOUT,
            Self::Cancelled { .. } => ErrorCode::JOB_CANCELLED,
            Self::StrategyNotFound { .. } => ErrorCode::JOB_STRATEGY_NOT_FOUND,
            Self::JobNotFound { .. } => ErrorCode::JOB_NOT_FOUND,
            Self::InvalidTransition { .. } => ErrorCode::JOB_INVALID_TRANSITION,
            Self::Checkpoint { .. } => ErrorCode::EXEC_CHECKPOINT_ERROR,
            Self::Io(_) => ErrorCode::OTHER_IO,
        }
    }

    /// Get the exit code the CLI reports for this error
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::Config => 2,
            ErrorKind::Definition | ErrorKind::StrategyNotFound => 3,
            ErrorKind::Cancelled => 130,
            _ => 1,
        }
    }

    /// Message without the `[E####]` prefix
    pub fn user_message(&self) -> String {
        let rendered = self.to_string();
        match rendered.split_once("] ") {
            Some((prefix, rest)) if prefix.starts_with("[E") => rest.to_string(),
            _ => rendered,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition_error_lists_every_field() {
        let err = StrataError::Definition {
            origin: "demo".into(),
            issues: vec![
                DefinitionIssue::new("name", "is required"),
                DefinitionIssue::new("steps[0].action_type", "is required"),
            ],
        };

        let msg = err.to_string();
        assert!(msg.starts_with("[E1100]"));
        assert!(msg.contains("name: is required"));
        assert!(msg.contains("steps[0].action_type: is required"));
        assert_eq!(err.kind(), ErrorKind::Definition);
    }

    #[test]
    fn test_circular_reference_names_the_cycle() {
        let err = StrataError::CircularReference {
            cycle: vec![
                "parameters.a".into(),
                "parameters.b".into(),
                "parameters.a".into(),
            ],
        };
        assert!(err
            .to_string()
            .contains("parameters.a -> parameters.b -> parameters.a"));
    }

    #[test]
    fn test_user_message_strips_code() {
        let err = StrataError::ActionNotFound {
            action_type: "MISSING".into(),
        };
        assert_eq!(err.user_message(), "Action type 'MISSING' is not registered");
        assert_eq!(err.code(), ErrorCode::EXEC_ACTION_NOT_FOUND);
    }

    #[test]
    fn test_resolution_error_renders_placeholder() {
        let err = StrataError::resolution("parameters.x", "key 'x' not found");
        assert!(err.to_string().contains("'${parameters.x}'"));
    }

    #[test]
    fn test_with_path_only_touches_path_variants() {
        let err = StrataError::checkpoint("corrupt", None).with_path("/tmp/cp.json");
        match err {
            StrataError::Checkpoint { path, .. } => {
                assert_eq!(path, Some(PathBuf::from("/tmp/cp.json")))
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
