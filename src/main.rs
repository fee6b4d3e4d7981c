use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use draftflow::api::{AppState, run_server};
use draftflow::capability::{CapabilityRegistry, HttpCapability};
use draftflow::config::DraftflowConfig;
use draftflow::definition::PipelineDefinition;
use draftflow::graph::PipelineEngine;
use draftflow::notify::{Dispatcher, WebhookChannel};
use draftflow::review::{Clock, ReviewScheduler, SystemClock};
use draftflow::store::{CheckpointStore, StoreHandle};

#[derive(Parser)]
#[command(name = "draftflow")]
#[command(version, about = "Staged content pipeline orchestrator")]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API and the review SLA sweep
    Serve,
    /// Validate a pipeline definition file without running it
    Check {
        /// Path to a JSON pipeline definition
        definition: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = DraftflowConfig::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Check { definition } => check(&definition),
    }
}

async fn serve(config: DraftflowConfig) -> Result<()> {
    let store = StoreHandle::new(
        CheckpointStore::open(&config.server.db_path).context("Failed to open checkpoint store")?,
    );
    let client = reqwest::Client::new();

    let mut registry = CapabilityRegistry::new();
    for (name, endpoint) in &config.stages {
        registry.register_stage(name, Arc::new(HttpCapability::new(client.clone(), endpoint)));
    }
    for (name, endpoint) in &config.checks {
        registry.register_check(name, Arc::new(HttpCapability::new(client.clone(), endpoint)));
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let channel = Arc::new(WebhookChannel::new(client, &config.notify.webhook_url));
    let dispatcher = Arc::new(Dispatcher::new(channel, store.clone(), clock.clone()));
    let scheduler = Arc::new(ReviewScheduler::new(
        store.clone(),
        dispatcher.clone(),
        clock.clone(),
        &config.review.base_url,
    ));
    let engine = Arc::new(PipelineEngine::new(
        store.clone(),
        registry,
        scheduler.clone(),
        dispatcher,
        clock,
        config.engine_config(),
        &config.review.base_url,
    ));

    let state = AppState {
        engine,
        scheduler,
        store,
    };
    run_server(state, config.server.listen, config.tick_interval()).await
}

fn check(path: &PathBuf) -> Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let definition: PipelineDefinition =
        serde_json::from_str(&raw).with_context(|| format!("Invalid JSON in {}", path.display()))?;
    definition.validate()?;

    let gated = definition.stages.iter().filter(|s| s.gate.is_some()).count();
    println!(
        "OK: {} stages ({} gated), dependency graph is acyclic",
        definition.stages.len(),
        gated
    );
    Ok(())
}
