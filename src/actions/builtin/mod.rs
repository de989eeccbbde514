//! Generic built-in actions
//!
//! These are domain-neutral building blocks: `set` publishes a value,
//! `count` counts rows, and `load_dataset` / `write_dataset` move tabular
//! data between files and the context.

use super::{Action, ActionError, ActionRegistryBuilder, ActionResult};
use crate::context::ExecutionContext;
use crate::error::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

pub mod dataset;

pub use dataset::{DatasetFormat, LoadDatasetAction, WriteDatasetAction};

/// Register every built-in under its conventional key
pub fn register_builtins(builder: &mut ActionRegistryBuilder) -> Result<()> {
    builder.register_action("set", SetAction)?;
    builder.register_action("count", CountAction)?;
    builder.register_action("load_dataset", LoadDatasetAction)?;
    builder.register_action("write_dataset", WriteDatasetAction)?;
    Ok(())
}

/// Returns `params.value`, or the whole params object when there is no `value` key
pub struct SetAction;

#[async_trait]
impl Action for SetAction {
    async fn execute(&self, params: &Value, _context: &mut ExecutionContext) -> ActionResult {
        let value = params.get("value").cloned().unwrap_or_else(|| params.clone());
        ActionResult::success(value)
    }

    fn description(&self) -> &str {
        "Publish a (resolved) value as the step output"
    }
}

/// Counts the rows of `params.rows`, returning `{"count": n}`
pub struct CountAction;

#[async_trait]
impl Action for CountAction {
    async fn execute(&self, params: &Value, _context: &mut ExecutionContext) -> ActionResult {
        match params.get("rows") {
            Some(Value::Array(rows)) => ActionResult::success(json!({ "count": rows.len() })),
            Some(other) => ActionResult::from_error(ActionError::validation(format!(
                "'rows' must be a list, got {}",
                type_name(other)
            ))),
            None => ActionResult::from_error(ActionError::validation(
                "missing required parameter 'rows'",
            )),
        }
    }

    fn description(&self) -> &str {
        "Count the rows of a dataset"
    }
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "mapping",
    }
}
