//! Structural validation of strategy definitions

use super::Strategy;
use crate::context::is_reserved_scope;
use crate::error::DefinitionIssue;
use crate::resolver::collect_references;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeSet, HashSet};

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]*$").expect("valid identifier pattern"));

pub fn is_identifier(value: &str) -> bool {
    IDENTIFIER.is_match(value)
}

/// Every structural problem of `strategy`, with path-qualified field names
pub fn validate_strategy(strategy: &Strategy) -> Vec<DefinitionIssue> {
    let mut issues = Vec::new();

    if strategy.name.trim().is_empty() {
        issues.push(DefinitionIssue::new("name", "must not be empty"));
    }
    if strategy.steps.is_empty() {
        issues.push(DefinitionIssue::new("steps", "must contain at least one step"));
    }

    let mut seen_names = HashSet::new();
    for (index, step) in strategy.steps.iter().enumerate() {
        let field = |name: &str| format!("steps[{index}].{name}");

        if step.name.trim().is_empty() {
            issues.push(DefinitionIssue::new(field("name"), "must not be empty"));
        } else if !seen_names.insert(step.name.as_str()) {
            issues.push(DefinitionIssue::new(
                field("name"),
                format!("duplicate step name '{}'", step.name),
            ));
        }

        if step.action_type.trim().is_empty() {
            issues.push(DefinitionIssue::new(field("action_type"), "must not be empty"));
        }

        if let Some(key) = &step.output_key {
            if !is_identifier(key) {
                issues.push(DefinitionIssue::new(
                    field("output_key"),
                    format!("'{key}' is not a valid identifier"),
                ));
            } else if is_reserved_scope(key) {
                issues.push(DefinitionIssue::new(
                    field("output_key"),
                    format!("'{key}' shadows a reserved scope"),
                ));
            }
        }

        if let Err(e) = collect_references(&step.params) {
            issues.push(DefinitionIssue::new(field("params"), e.user_message()));
        }

        if step.timeout.is_some_and(|timeout| timeout.is_zero()) {
            issues.push(DefinitionIssue::new(field("timeout"), "must be greater than zero"));
        }

        if let Some(retry) = &step.retry {
            if retry
                .fallback_action
                .as_deref()
                .is_some_and(|fallback| fallback.trim().is_empty())
            {
                issues.push(DefinitionIssue::new(
                    field("retry.fallback_action"),
                    "must not be empty",
                ));
            }
        }

        if let Some(chunking) = &step.chunking {
            for (name, message) in chunking.issues() {
                issues.push(DefinitionIssue::new(field(&format!("chunking.{name}")), message));
            }
        }
    }

    issues
}

/// References to scopes that no earlier step produces.
///
/// These are not errors: a direct-context-mutating action may create the
/// scope at run time.
pub fn scope_warnings(strategy: &Strategy) -> Vec<String> {
    let mut warnings = Vec::new();
    let mut available: BTreeSet<&str> = BTreeSet::new();

    for (index, step) in strategy.steps.iter().enumerate() {
        if let Ok(references) = collect_references(&step.params) {
            for reference in references {
                let scope = reference.scope.as_str();
                if !is_reserved_scope(scope) && !available.contains(scope) {
                    warnings.push(format!(
                        "steps[{index}].params references '${{{reference}}}' but no earlier step produces '{scope}'"
                    ));
                }
            }
        }
        if let Some(key) = &step.output_key {
            available.insert(key.as_str());
        }
    }

    warnings
}
