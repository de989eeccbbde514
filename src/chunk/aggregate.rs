//! Combining partial results of partitions

use crate::actions::ActionError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::HashSet;
use std::sync::Arc;

/// Folds partition results into one
pub trait Aggregator: Send + Sync {
    fn name(&self) -> &str;

    /// Fold `partial` into the running aggregate
    fn combine(&self, aggregate: Option<Value>, partial: Value) -> Result<Value, ActionError>;
}

/// Built-in aggregators selectable from a strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregatorKind {
    /// Concatenate lists in partition order
    #[default]
    Concat,
    /// Add numbers, field by field for mappings
    Sum,
    /// Concatenate lists, dropping repeated items
    Union,
    /// Deep-merge mappings: lists concatenate, numbers add, nested mappings merge
    Merge,
}

impl AggregatorKind {
    pub fn build(self) -> Arc<dyn Aggregator> {
        match self {
            AggregatorKind::Concat => Arc::new(Concat),
            AggregatorKind::Sum => Arc::new(Sum),
            AggregatorKind::Union => Arc::new(Union),
            AggregatorKind::Merge => Arc::new(Merge),
        }
    }
}

fn expect_list(value: Value, aggregator: &str) -> Result<Vec<Value>, ActionError> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Null => Ok(Vec::new()),
        other => Err(ActionError::validation(format!(
            "{aggregator} aggregator expects list results, got {other}"
        ))),
    }
}

pub struct Concat;

impl Aggregator for Concat {
    fn name(&self) -> &str {
        "concat"
    }

    fn combine(&self, aggregate: Option<Value>, partial: Value) -> Result<Value, ActionError> {
        let mut items = match aggregate {
            Some(value) => expect_list(value, self.name())?,
            None => Vec::new(),
        };
        items.extend(expect_list(partial, self.name())?);
        Ok(Value::Array(items))
    }
}

pub struct Union;

impl Aggregator for Union {
    fn name(&self) -> &str {
        "union"
    }

    fn combine(&self, aggregate: Option<Value>, partial: Value) -> Result<Value, ActionError> {
        let mut items = match aggregate {
            Some(value) => expect_list(value, self.name())?,
            None => Vec::new(),
        };
        let mut seen: HashSet<String> = items.iter().map(Value::to_string).collect();
        for item in expect_list(partial, self.name())? {
            if seen.insert(item.to_string()) {
                items.push(item);
            }
        }
        Ok(Value::Array(items))
    }
}

pub struct Sum;

impl Aggregator for Sum {
    fn name(&self) -> &str {
        "sum"
    }

    fn combine(&self, aggregate: Option<Value>, partial: Value) -> Result<Value, ActionError> {
        match aggregate {
            None => Ok(partial),
            Some(aggregate) => add(aggregate, partial),
        }
    }
}

fn add(left: Value, right: Value) -> Result<Value, ActionError> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => Ok(Value::Number(add_numbers(&a, &b)?)),
        (Value::Object(mut a), Value::Object(b)) => {
            for (key, value) in b {
                let merged = match a.remove(&key) {
                    Some(existing) => add(existing, value)?,
                    None => value,
                };
                a.insert(key, merged);
            }
            Ok(Value::Object(a))
        }
        (Value::Null, other) | (other, Value::Null) => Ok(other),
        (a, b) => Err(ActionError::validation(format!(
            "sum aggregator cannot add {a} and {b}"
        ))),
    }
}

fn add_numbers(a: &Number, b: &Number) -> Result<Number, ActionError> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(total) = x.checked_add(y) {
            return Ok(Number::from(total));
        }
    }
    let total = a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0);
    Number::from_f64(total)
        .ok_or_else(|| ActionError::validation(format!("sum of {a} and {b} is not finite")))
}

pub struct Merge;

impl Aggregator for Merge {
    fn name(&self) -> &str {
        "merge"
    }

    fn combine(&self, aggregate: Option<Value>, partial: Value) -> Result<Value, ActionError> {
        let Some(aggregate) = aggregate else {
            return Ok(partial);
        };
        match (aggregate, partial) {
            (Value::Object(a), Value::Object(b)) => Ok(Value::Object(merge_maps(a, b)?)),
            (a, b) => Err(ActionError::validation(format!(
                "merge aggregator expects mapping results, got {a} and {b}"
            ))),
        }
    }
}

fn merge_maps(
    mut left: Map<String, Value>,
    right: Map<String, Value>,
) -> Result<Map<String, Value>, ActionError> {
    for (key, value) in right {
        let merged = match (left.remove(&key), value) {
            (None, value) => value,
            (Some(Value::Array(mut a)), Value::Array(b)) => {
                a.extend(b);
                Value::Array(a)
            }
            (Some(Value::Number(a)), Value::Number(b)) => Value::Number(add_numbers(&a, &b)?),
            (Some(Value::Object(a)), Value::Object(b)) => Value::Object(merge_maps(a, b)?),
            // scalars: the later partition wins
            (Some(_), value) => value,
        };
        left.insert(key, merged);
    }
    Ok(left)
}
