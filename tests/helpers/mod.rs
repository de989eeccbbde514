//! Shared actions and builders for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use strata::actions::ActionRegistryBuilder;
use strata::chunk::{CheckpointStore, MemoryCheckpointStore};
use strata::config::EngineConfig;
use strata::strategy::{StrategyCatalog, StrategySource};
use strata::{
    Action, ActionRegistry, ActionResult, ErrorKind, ExecutionContext, Orchestrator, Strategy,
    StrategyLoader,
};
use tokio::sync::{watch, Notify, Semaphore};
use tracing_subscriber::fmt::MakeWriter;

/// Parse a YAML strategy, panicking on definition errors
pub fn strategy(yaml: &str) -> Strategy {
    StrategyLoader::new()
        .load(&StrategySource::yaml("test.yaml", yaml))
        .unwrap_or_else(|e| panic!("invalid test strategy: {e}"))
}

pub fn catalog(yamls: &[&str]) -> StrategyCatalog {
    yamls.iter().map(|yaml| strategy(yaml)).collect()
}

/// Registry with the built-ins plus whatever `extra` registers
pub fn registry(extra: impl FnOnce(&mut ActionRegistryBuilder)) -> ActionRegistry {
    let mut builder = ActionRegistry::builder();
    builder.with_builtins().unwrap();
    extra(&mut builder);
    builder.build()
}

/// Orchestrator over an in-memory checkpoint store
pub fn orchestrator(registry: ActionRegistry, catalog: StrategyCatalog) -> Orchestrator {
    orchestrator_with(registry, catalog, EngineConfig::default(), Arc::new(MemoryCheckpointStore::new()))
}

pub fn orchestrator_with(
    registry: ActionRegistry,
    catalog: StrategyCatalog,
    config: EngineConfig,
    checkpoints: Arc<dyn CheckpointStore>,
) -> Orchestrator {
    Orchestrator::builder(registry, catalog)
        .with_config(config)
        .with_checkpoint_store(checkpoints)
        .build()
}

/// Appends `params.label` to a shared log and returns it
#[derive(Clone, Default)]
pub struct Recorder {
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Action for Recorder {
    async fn execute(&self, params: &Value, _context: &mut ExecutionContext) -> ActionResult {
        let label = params
            .get("label")
            .and_then(Value::as_str)
            .unwrap_or("?")
            .to_string();
        self.calls.lock().unwrap().push(label.clone());
        ActionResult::success(json!(label))
    }
}

/// Always fails with the given kind and message
#[derive(Clone)]
pub struct Failing {
    pub kind: ErrorKind,
    pub message: String,
}

impl Failing {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[async_trait]
impl Action for Failing {
    async fn execute(&self, _params: &Value, _context: &mut ExecutionContext) -> ActionResult {
        ActionResult::failure(self.kind, self.message.clone())
    }
}

/// Writes a dataset straight into the context, then fails
#[derive(Clone)]
pub struct ScribbleThenFail;

#[async_trait]
impl Action for ScribbleThenFail {
    async fn execute(&self, _params: &Value, context: &mut ExecutionContext) -> ActionResult {
        context.set_dataset("scratch", json!("half-written"));
        context.record_statistic("scribbled", json!(true));
        ActionResult::failure(ErrorKind::ActionExecution, "gave up halfway")
    }
}

/// Sleeps for `params.ms` milliseconds
#[derive(Clone)]
pub struct Sleeper;

#[async_trait]
impl Action for Sleeper {
    async fn execute(&self, params: &Value, _context: &mut ExecutionContext) -> ActionResult {
        let ms = params.get("ms").and_then(Value::as_u64).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        ActionResult::success(json!({ "slept_ms": ms }))
    }
}

/// Signals `started`, then blocks until `release` is notified
#[derive(Clone, Default)]
pub struct Gate {
    pub started: Arc<Notify>,
    pub release: Arc<Notify>,
}

#[async_trait]
impl Action for Gate {
    async fn execute(&self, _params: &Value, _context: &mut ExecutionContext) -> ActionResult {
        self.started.notify_one();
        self.release.notified().await;
        ActionResult::success(json!("opened"))
    }
}

/// Holds every caller until `open`, then returns `params.label`.
/// Unlike [`Gate`], it counts how many callers have arrived.
#[derive(Clone)]
pub struct Hold {
    arrived: Arc<Semaphore>,
    opened: Arc<watch::Sender<bool>>,
}

impl Default for Hold {
    fn default() -> Self {
        Self {
            arrived: Arc::new(Semaphore::new(0)),
            opened: Arc::new(watch::channel(false).0),
        }
    }
}

impl Hold {
    /// Wait until `n` more callers are inside the action
    pub async fn arrivals(&self, n: u32) {
        self.arrived.acquire_many(n).await.unwrap().forget();
    }

    pub fn open(&self) {
        self.opened.send_replace(true);
    }
}

#[async_trait]
impl Action for Hold {
    async fn execute(&self, params: &Value, _context: &mut ExecutionContext) -> ActionResult {
        let mut opened = self.opened.subscribe();
        self.arrived.add_permits(1);
        if opened.wait_for(|open| *open).await.is_err() {
            return ActionResult::failure(ErrorKind::ActionExecution, "hold dropped");
        }
        ActionResult::success(params.get("label").cloned().unwrap_or(Value::Null))
    }
}

/// In-memory sink for `tracing` output
#[derive(Clone, Default)]
pub struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    /// Install a subscriber writing to this capture for the current thread
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(self.clone())
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock().unwrap()).into_owned()
    }
}

impl std::io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogCapture;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Fails with `kind` for the first `failures` calls, then succeeds
#[derive(Clone)]
pub struct Flaky {
    pub failures: u32,
    pub kind: ErrorKind,
    pub calls: Arc<AtomicU32>,
}

impl Flaky {
    pub fn new(failures: u32, kind: ErrorKind) -> Self {
        Self {
            failures,
            kind,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Action for Flaky {
    async fn execute(&self, _params: &Value, _context: &mut ExecutionContext) -> ActionResult {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            ActionResult::failure(self.kind, "upstream returned 503")
        } else {
            ActionResult::success(json!("primary"))
        }
    }
}

/// Multiplies `params.rows[*].id` by ten; fails on row `fail_on` while armed.
/// Records the first id of every partition it sees.
#[derive(Clone)]
pub struct Fragile {
    pub fail_on: u64,
    pub armed: Arc<AtomicBool>,
    pub partitions: Arc<Mutex<Vec<u64>>>,
}

impl Fragile {
    pub fn new(fail_on: u64) -> Self {
        Self {
            fail_on,
            armed: Arc::new(AtomicBool::new(true)),
            partitions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }

    pub fn take_partitions(&self) -> Vec<u64> {
        std::mem::take(&mut *self.partitions.lock().unwrap())
    }
}

#[async_trait]
impl Action for Fragile {
    async fn execute(&self, params: &Value, _context: &mut ExecutionContext) -> ActionResult {
        let ids: Vec<u64> = params
            .get("rows")
            .and_then(Value::as_array)
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| row.get("id").and_then(Value::as_u64))
                    .collect()
            })
            .unwrap_or_default();

        if let Some(first) = ids.first() {
            self.partitions.lock().unwrap().push(*first);
        }
        if self.armed.load(Ordering::SeqCst) && ids.contains(&self.fail_on) {
            return ActionResult::failure(ErrorKind::ActionExecution, "worker crashed");
        }

        let scaled: Vec<Value> = ids.iter().map(|id| json!({ "id": id * 10 })).collect();
        ActionResult::success(Value::Array(scaled))
    }
}

/// `n` rows shaped `{"id": i}`
pub fn rows(n: u64) -> Value {
    Value::Array((0..n).map(|i| json!({ "id": i })).collect())
}
