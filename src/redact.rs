//! Secret masking for error text
//!
//! Everything that reaches the audit trail or a log line goes through a
//! [`Redactor`] first. Two layers are applied: exact values of configured
//! secrets, then generic credential-shaped patterns.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

/// Replacement text for masked values
pub const MASK: &str = "***MASKED***";

static CREDENTIAL_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    vec![
        // key=value / key: value for common secret names
        (
            Regex::new(
                r#"(?i)\b((?:api[_-]?key|access[_-]?token|auth[_-]?token|token|secret|password|passwd|pwd)\s*[=:]\s*)("[^"]*"|'[^']*'|[^\s,;&]+)"#,
            )
            .expect("valid credential pattern"),
            "${1}***MASKED***",
        ),
        // Authorization headers
        (
            Regex::new(r"(?i)\b(bearer|basic)\s+[A-Za-z0-9._~+/=-]{8,}")
                .expect("valid bearer pattern"),
            "${1} ***MASKED***",
        ),
        // user:password@host in URLs
        (
            Regex::new(r"(?i)\b([a-z][a-z0-9+.-]*://)([^/\s:@]+):([^/\s@]+)@")
                .expect("valid url credential pattern"),
            "${1}${2}:***MASKED***@",
        ),
    ]
});

/// Masks secrets in free-form text
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    secrets: Vec<String>,
}

impl Redactor {
    /// Create a redactor that only applies the generic patterns
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a redactor from secret env keys, masking the values those keys
    /// hold in `env`
    pub fn from_env_keys(secret_keys: &[String], env: &HashMap<String, String>) -> Self {
        let mut redactor = Self::new();
        for key in secret_keys {
            if let Some(value) = env.get(key) {
                redactor.add_secret(value.clone());
            }
        }
        redactor
    }

    /// Register a literal secret value
    pub fn add_secret(&mut self, value: impl Into<String>) {
        let value = value.into();
        // Blank or trivially short values would mask unrelated text
        if value.trim().len() < 4 || self.secrets.contains(&value) {
            return;
        }
        self.secrets.push(value);
        // Longest first so overlapping secrets are fully masked
        self.secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));
    }

    pub fn with_secret(mut self, value: impl Into<String>) -> Self {
        self.add_secret(value);
        self
    }

    /// Mask every known secret and credential-shaped substring
    pub fn redact(&self, text: &str) -> String {
        let mut masked = text.to_string();
        for secret in &self.secrets {
            masked = masked.replace(secret.as_str(), MASK);
        }
        for (pattern, replacement) in CREDENTIAL_PATTERNS.iter() {
            masked = pattern.replace_all(&masked, *replacement).into_owned();
        }
        masked
    }
}
