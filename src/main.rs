use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use strata::config::ConfigLoader;
use strata::strategy::{StrategyCatalog, StrategySource};
use strata::{ActionRegistry, EngineConfig, ExecutionRequest, JobStatus, Orchestrator, StrategyLoader};
use tracing::{debug, error, trace};
use tracing_subscriber::EnvFilter;

/// Run configuration-driven strategy pipelines
#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Load, validate and run strategy pipelines", long_about = None)]
struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to configuration file
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    /// Directory containing strategy definitions
    #[arg(long, global = true)]
    strategies_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List loaded strategies and registered action types
    List,
    /// Validate strategy files without running them
    Validate {
        /// Files or directories to check (default: the strategies directory)
        paths: Vec<PathBuf>,
    },
    /// Run a strategy and print the job record as JSON
    Run {
        /// Strategy name
        name: String,

        /// Parameter override, e.g. --set threshold=0.9 (repeatable)
        #[arg(long = "set", value_name = "KEY=VALUE")]
        overrides: Vec<String>,

        /// Job timeout, e.g. "30s" or "5m"
        #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration)]
        timeout: Option<Duration>,

        /// Checkpoint namespace, reuse it to resume chunked steps
        #[arg(long)]
        resume_key: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_path(path);
    }
    let config = match loader.load().await {
        Ok(mut config) => {
            if let Some(dir) = &cli.strategies_dir {
                config.strategies_dir = dir.clone();
            }
            config
        }
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(2);
        }
    };

    let log_level = match cli.verbose {
        0 => config.log_level.clone().unwrap_or_else(|| "info".to_string()),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .with_target(cli.verbose >= 2)
        .with_writer(std::io::stderr)
        .init();

    debug!("strata started with verbosity level: {}", cli.verbose);
    trace!("Full CLI args: {:?}", std::env::args().collect::<Vec<_>>());

    let result = match cli.command {
        Commands::List => run_list(&config).await,
        Commands::Validate { paths } => run_validate(&config, paths).await,
        Commands::Run {
            name,
            overrides,
            timeout,
            resume_key,
        } => run_strategy(config, name, overrides, timeout, resume_key).await,
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("Fatal error: {:#}", e);
            eprintln!("Error: {e:#}");
            let code = e
                .downcast_ref::<strata::StrataError>()
                .map(|e| e.exit_code())
                .unwrap_or(1);
            std::process::exit(code);
        }
    }
}

fn registry() -> Result<ActionRegistry> {
    ActionRegistry::with_builtins().context("Failed to register built-in actions")
}

async fn load_catalog(config: &EngineConfig, registry: &ActionRegistry) -> Result<StrategyCatalog> {
    let loader = StrategyLoader::new().with_known_actions(registry.keys());
    let catalog = loader.load_dir(&config.strategies_dir).await?;
    Ok(catalog)
}

async fn run_list(config: &EngineConfig) -> Result<i32> {
    let registry = registry()?;
    let catalog = load_catalog(config, &registry).await?;

    println!("Strategies ({}):", catalog.len());
    for strategy in catalog.iter() {
        let description = strategy
            .description
            .as_deref()
            .map(|d| format!(" - {d}"))
            .unwrap_or_default();
        println!("  {} ({} steps){}", strategy.name, strategy.steps.len(), description);
    }

    println!("Action types:");
    for key in registry.keys() {
        println!("  {key}");
    }

    for diagnostic in catalog.diagnostics() {
        eprintln!("{diagnostic}");
    }
    Ok(0)
}

async fn run_validate(config: &EngineConfig, paths: Vec<PathBuf>) -> Result<i32> {
    let registry = registry()?;
    let loader = StrategyLoader::new().with_known_actions(registry.keys());
    let paths = if paths.is_empty() {
        vec![config.strategies_dir.clone()]
    } else {
        paths
    };

    let mut failed = false;
    for path in &paths {
        let catalog = load_path(&loader, path).await?;
        for strategy in catalog.iter() {
            println!("ok   {} ({} steps)", strategy.name, strategy.steps.len());
        }
        for diagnostic in catalog.diagnostics() {
            failed |= diagnostic.is_error();
            println!("{diagnostic}");
        }
    }

    Ok(if failed { 3 } else { 0 })
}

async fn load_path(loader: &StrategyLoader, path: &Path) -> Result<StrategyCatalog> {
    if path.is_dir() {
        return Ok(loader.load_dir(path).await?);
    }
    let source = StrategySource::from_path(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(loader.load_collection([source]))
}

async fn run_strategy(
    config: EngineConfig,
    name: String,
    overrides: Vec<String>,
    timeout: Option<Duration>,
    resume_key: Option<String>,
) -> Result<i32> {
    let registry = registry()?;
    let catalog = load_catalog(&config, &registry).await?;
    for diagnostic in catalog.diagnostics() {
        eprintln!("{diagnostic}");
    }

    let mut request = ExecutionRequest::new(name);
    for entry in &overrides {
        let (key, value) = parse_override(entry)?;
        request = request.with_override(key, value);
    }
    if let Some(timeout) = timeout {
        request = request.with_job_timeout(timeout);
    }
    if let Some(key) = resume_key {
        request = request.with_resume_key(key);
    }

    let orchestrator = Orchestrator::builder(registry, catalog)
        .with_config(config)
        .build();
    let job = orchestrator.run(request).await?;

    println!(
        "{}",
        serde_json::to_string_pretty(&job).context("Failed to serialize job record")?
    );

    if let Some(failure) = &job.failure {
        eprintln!("Job {} failed: {}", job.id, failure);
    }

    Ok(match job.status {
        JobStatus::Completed => 0,
        JobStatus::Cancelled => 130,
        _ => 1,
    })
}

/// `key=value`; the value is JSON when it parses as JSON, a string otherwise
fn parse_override(entry: &str) -> Result<(String, Value)> {
    let (key, raw) = entry
        .split_once('=')
        .ok_or_else(|| anyhow!("Invalid override '{}', expected KEY=VALUE", entry))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(anyhow!("Invalid override '{}', key is empty", entry));
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}
