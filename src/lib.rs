//! # Strata
//!
//! A configuration-driven pipeline engine. Strategies are declarative lists of
//! steps loaded from YAML or JSON; each step names an action type, parameters
//! with `${scope.path}` placeholders, and optional retry, chunking, timeout and
//! failure-policy settings.
//!
//! ## Modules
//!
//! - `actions` - The `Action` trait, registry and built-in actions
//! - `chunk` - Partitioned execution with checkpoints and adaptive sizing
//! - `config` - Engine configuration from TOML and `STRATA_*` variables
//! - `context` - Per-job execution context and the blocking pool
//! - `error` - Error taxonomy with stable codes
//! - `orchestrator` - Job lifecycle: submit, status, result, cancel
//! - `redact` - Secret scrubbing for logs and audit entries
//! - `resolver` - Placeholder resolution against context scopes
//! - `retry` - Backoff policy and fallback routing
//! - `strategy` - Strategy model, loader and validation
pub mod actions;
pub mod chunk;
pub mod config;
pub mod context;
pub mod error;
pub mod orchestrator;
pub mod redact;
pub mod resolver;
pub mod retry;
pub mod strategy;

pub use actions::{Action, ActionError, ActionRegistry, ActionResult};
pub use config::EngineConfig;
pub use context::ExecutionContext;
pub use error::{ErrorKind, Result, StrataError};
pub use orchestrator::{ExecutionRequest, Job, JobId, JobResult, JobStatus, Orchestrator};
pub use strategy::{Step, Strategy, StrategyCatalog, StrategyLoader};
