//! Pluggable step actions
//!
//! Every step of a strategy dispatches to an [`Action`] looked up by its
//! `action_type` in an [`ActionRegistry`]. Actions are async so I/O-bound work
//! suspends instead of occupying a worker thread; blocking work goes through
//! the context's [`BlockingPool`](crate::context::BlockingPool).

use crate::context::ExecutionContext;
use async_trait::async_trait;
use serde_json::Value;

pub mod builtin;
pub mod registry;
pub mod result;

pub use registry::{ActionFactory, ActionRegistry, ActionRegistryBuilder};
pub use result::{ActionError, ActionResult};

/// Core trait that all step actions implement.
///
/// An action communicates its outcome through the returned [`ActionResult`].
/// It must not mutate the context except through `data`, unless it documents
/// itself as a direct-context-mutating action.
#[async_trait]
pub trait Action: Send + Sync {
    /// Execute with fully resolved parameters
    async fn execute(&self, params: &Value, context: &mut ExecutionContext) -> ActionResult;

    /// Short human readable description
    fn description(&self) -> &str {
        ""
    }
}

/// Fetch a required string parameter
pub(crate) fn required_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, ActionError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ActionError::validation(format!("missing required string parameter '{key}'")))
}
