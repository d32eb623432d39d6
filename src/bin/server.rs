// Workflow Engine - Worker
// Runs the event loop and the reconciliation ticker
// Run with: cargo run --bin server

//! # Workflow Engine Worker Binary
//!
//! Starts an in-memory [`WorkflowEngine`], optionally loads definition files,
//! then dispatches engine events until Ctrl-C. A ticker republishes failed
//! emissions every `reconcile.interval_secs`.
//!
//! ## Rust Learning Notes:
//!
//! ### `tokio::select!`
//! The main loop waits on two futures at once: the next reconciliation tick
//! and the Ctrl-C signal. Whichever finishes first runs its branch.
//!
//! ### `anyhow::Result` in `main`
//! Library code returns the typed `WorkflowError`; the binary only needs to
//! report failures, so `anyhow` absorbs every error type with `?`.

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use workflow_engine::{CallerContext, EngineConfig, WorkflowDefinition, WorkflowEngine};

#[derive(Parser)]
#[command(name = "workflow-engine-server")]
#[command(about = "Workflow engine worker - dispatches events and reconciles failed emissions")]
#[command(version = "0.1")]
struct Cli {
    /// Configuration file (defaults to workflow-engine.toml when present)
    #[arg(short, long, env = "WORKFLOW_CONFIG")]
    config: Option<String>,

    /// Organization whose emissions are reconciled
    #[arg(long, env = "WORKFLOW_ORG", default_value = "default")]
    org: String,

    /// Workflow definition JSON files to load at startup
    #[arg(long = "definition")]
    definitions: Vec<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    let dotenv_result = dotenv();
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(err) = dotenv_result {
        warn!(error = %err, "no .env file loaded");
    }

    let config = EngineConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let interval = config.reconcile_interval();
    info!(
        org = %cli.org,
        reconcile_interval_secs = interval.as_secs(),
        max_attempts = config.reconcile.max_attempts,
        "starting workflow engine"
    );

    let engine = Arc::new(WorkflowEngine::in_memory(config)?);
    let rx = engine.subscribe();
    let caller = CallerContext::system(cli.org.clone());

    for path in &cli.definitions {
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let definition: WorkflowDefinition =
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        let definition = engine.create_definition(&caller, definition).await?;
        info!(definition_id = %definition.id, name = %definition.name, "loaded definition");
    }

    let dispatcher = engine.clone().run(rx);

    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match engine.reconcile(&caller).await {
                    Ok(report) if report.scanned > 0 => info!(
                        recovered = report.recovered,
                        retried = report.retried,
                        terminal = report.terminal,
                        "reconciled failed emissions"
                    ),
                    Ok(_) => {}
                    Err(err) => error!(error = %err, "reconciliation failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }

    dispatcher.abort();
    info!("workflow engine stopped");
    Ok(())
}
