//! Result types for action execution

use crate::error::{ErrorKind, StrataError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Failure reported by an action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct ActionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ActionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ActionExecution, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }
}

impl From<&StrataError> for ActionError {
    fn from(err: &StrataError) -> Self {
        Self::new(err.kind(), err.user_message())
    }
}

impl From<StrataError> for ActionError {
    fn from(err: StrataError) -> Self {
        Self::from(&err)
    }
}

/// Result from executing an action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    /// Whether the action succeeded
    pub success: bool,

    /// Data to merge into the context under the step's `output_key`
    pub data: Option<Value>,

    /// Error if the action failed
    pub error: Option<ActionError>,

    /// Implementation that produced the result, when a wrapper chose between several
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub served_by: Option<String>,

    /// Retries performed by a retry wrapper
    #[serde(default)]
    pub retries: u32,
}

impl ActionResult {
    /// Creates a successful result
    pub fn success(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            served_by: None,
            retries: 0,
        }
    }

    /// Creates a successful result without data
    pub fn empty() -> Self {
        Self {
            success: true,
            data: None,
            error: None,
            served_by: None,
            retries: 0,
        }
    }

    /// Creates a failed result
    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::from_error(ActionError::new(kind, message))
    }

    pub fn from_error(error: ActionError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            served_by: None,
            retries: 0,
        }
    }

    pub fn with_served_by(mut self, name: impl Into<String>) -> Self {
        self.served_by = Some(name.into());
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    /// The reported error, or a generic one for a failure that carried none
    pub fn error_or_default(&self) -> ActionError {
        self.error
            .clone()
            .unwrap_or_else(|| ActionError::execution("action failed without an error message"))
    }

    /// Converts to a `Result`
    pub fn into_result(self) -> Result<Value, ActionError> {
        if self.success {
            Ok(self.data.unwrap_or(Value::Null))
        } else {
            Err(self.error_or_default())
        }
    }
}

impl From<Result<Value, ActionError>> for ActionResult {
    fn from(result: Result<Value, ActionError>) -> Self {
        match result {
            Ok(data) => Self::success(data),
            Err(error) => Self::from_error(error),
        }
    }
}
