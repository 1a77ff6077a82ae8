use std::path::Path;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use storyforge::anthropic::AnthropicClient;
use storyforge::assigner::WorkflowAssigner;
use storyforge::cli::{Cli, Command};
use storyforge::config::PipelineConfig;
use storyforge::monitor::PerformanceMonitor;
use storyforge::orchestrator::PipelineOrchestrator;
use storyforge::persistence::{HttpProductionStore, SqliteStore};
use storyforge::state_machine::{EpisodeId, EpisodeInput};
use storyforge::ui;

fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_env("STORYFORGE_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    let mut config = PipelineConfig::load(cli.config.as_deref())?;
    if let Some(pct) = cli.rollout {
        config.rollout.percentage = pct;
        config.validate()?;
    }

    match cli.command {
        Command::Run { episodes } => run(config, &episodes).await,
        Command::Assign { episode_ids } => {
            let monitor = load_monitor(&config)?;
            let assigner = WorkflowAssigner::from_config(&config.rollout);
            let assignments: Vec<_> = episode_ids
                .into_iter()
                .map(|id| {
                    let assignment = assigner.assign(&EpisodeId::from(id.as_str()), monitor.breaker());
                    (id, assignment)
                })
                .collect();
            ui::print_assignments(&assignments);
            Ok(())
        }
        Command::Status => {
            let monitor = load_monitor(&config)?;
            let db_path = &config.persistence.local_db_path;
            let store = if db_path.exists() {
                Some(SqliteStore::open(db_path)?.totals()?)
            } else {
                None
            };
            ui::print_status(&config, &monitor, store);
            Ok(())
        }
        Command::ResetBreaker => {
            let mut monitor = load_monitor(&config)?;
            monitor.reset_breaker();
            monitor.save(&config.reporting.metrics_path)?;
            info!(path = %config.reporting.metrics_path.display(), "circuit breaker reset");
            println!("circuit breaker closed, metric windows cleared");
            Ok(())
        }
    }
}

fn load_monitor(config: &PipelineConfig) -> Result<PerformanceMonitor> {
    PerformanceMonitor::load(config.breaker.clone(), &config.reporting.metrics_path)
}

async fn run(config: PipelineConfig, episodes: &Path) -> Result<()> {
    if config.api_key.is_empty() {
        bail!("ANTHROPIC_API_KEY is not set");
    }
    let contents = std::fs::read_to_string(episodes)
        .with_context(|| format!("reading episodes from {}", episodes.display()))?;
    let inputs: Vec<EpisodeInput> = serde_json::from_str(&contents)
        .with_context(|| format!("parsing episodes from {}", episodes.display()))?;

    let client = match &config.generation.api_base_url {
        Some(url) => AnthropicClient::with_base_url(config.api_key.clone(), url.clone())?,
        None => AnthropicClient::new(config.api_key.clone())?,
    };
    let local = SqliteStore::open(&config.persistence.local_db_path)?;
    let production = if config.persistence.sync_to_production
        && !config.persistence.production_url.is_empty()
    {
        Some(HttpProductionStore::new(
            config.persistence.production_url.clone(),
            config.persistence.production_token.clone(),
        )?)
    } else {
        None
    };
    let monitor = load_monitor(&config)?;
    let report_dir = config.reporting.report_dir.clone();

    let orchestrator = PipelineOrchestrator::new(config, client, local, production, monitor);
    let progress = ui::RunProgress::new();
    let report = orchestrator.run(inputs, |event| progress.update(event)).await;
    progress.finish();

    orchestrator.save_metrics()?;
    let path = report.write_to(&report_dir)?;
    ui::print_report(&report, Some(&path));
    Ok(())
}
