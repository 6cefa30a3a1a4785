//! Foreman executor binary.
//!
//! Wires the tracker, advisor, gate runner, and agent supervisor into the
//! event loop and runs it until interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dispatch::budget::{BudgetState, StaticCostTracker};
use dispatch::config::{ExecutorConfig, FailureMode};
use dispatch::MemoryTracker;
use foreman::advisor::HttpAdvisor;
use foreman::agent::AgentKind;
use foreman::gates::CommandGateRunner;
use foreman::{Advisor, Executor};

#[derive(Debug, Parser)]
#[command(name = "foreman", about = "Autonomous code-execution orchestrator")]
struct Cli {
    /// Working directory the agents operate in.
    #[arg(long, default_value = ".")]
    workdir: PathBuf,

    /// Optional TOML config file; environment variables otherwise.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the preflight failure mode (block|warn|ignore).
    #[arg(long)]
    failure_mode: Option<String>,

    /// Which agent CLI to supervise (claude|amp).
    #[arg(long, default_value = "claude")]
    agent: String,

    /// Run a single tick and exit instead of looping.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ExecutorConfig::load(path)?,
        None => ExecutorConfig::default(),
    };
    if let Some(mode) = &cli.failure_mode {
        config.failure_mode = FailureMode::parse(mode)
            .with_context(|| format!("invalid failure mode {mode:?}"))?;
    }

    let agent_kind = match cli.agent.as_str() {
        "claude" => AgentKind::Claude,
        "amp" => AgentKind::Amp,
        other => anyhow::bail!("unsupported agent {other:?} (expected claude|amp)"),
    };

    let workdir = cli
        .workdir
        .canonicalize()
        .with_context(|| format!("workdir {} does not exist", cli.workdir.display()))?;

    // Tracker storage is required. The in-memory backend serves
    // single-process runs; shared deployments plug a durable TrackerStore
    // in here.
    let tracker = Arc::new(MemoryTracker::new());

    let advisor = if config.enable_ai_supervision {
        let url = config
            .advisor_url
            .clone()
            .context("enable_ai_supervision requires advisor_url")?;
        let advisor = HttpAdvisor::new(url.clone(), Duration::from_secs(120))
            .map_err(|e| anyhow::anyhow!("failed to build advisor client: {e}"))?;
        match advisor.health_check().await {
            Ok(()) => info!(url, "advisor reachable"),
            Err(e) => warn!(url, error = %e, "advisor not reachable at startup"),
        }
        Some(Arc::new(advisor) as Arc<dyn foreman::Advisor>)
    } else {
        None
    };

    let gates = config
        .enable_quality_gates
        .then(|| Arc::new(CommandGateRunner::default()) as Arc<dyn foreman::gates::GateRunner>);

    let shutdown = CancellationToken::new();
    let executor = Executor::new(
        config,
        tracker,
        advisor,
        gates,
        Arc::new(StaticCostTracker(BudgetState::Ok)),
        workdir,
        agent_kind,
        shutdown.clone(),
    )?;

    if cli.once {
        executor.tick().await?;
        return Ok(());
    }

    // Ctrl-C cancels the root token; the in-flight agent is preempted
    // through its watchdog handle and cleanup runs on the way out.
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal_token.cancel();
        }
    });

    executor.run().await
}
