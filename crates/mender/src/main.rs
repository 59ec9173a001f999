//! `mender` — autonomous CI repair agent binary.
//!
//! Wires the four external-interface adapters (GitHub code host, Docker
//! sandbox, SQLite store, HTTP LLM client) into a [`PipelineContext`] and
//! exposes it two ways: a long-running webhook server (`serve`) and a
//! one-shot local debugging tool (`replay`) that calls straight into
//! [`mender_core::run_pipeline`] without going through HTTP.

mod config;
mod server;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use config::AppConfig;
use mender_codehost::GitHubCodeHost;
use mender_core::llm::HttpLlmClient;
use mender_core::webhook::IngestEvent;
use mender_core::{NewFailure, PipelineContext, PipelineOutcome};
use mender_sandbox::DockerSandboxDriver;
use mender_store::SqliteStore;
use notify::Notifier;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mender")]
#[command(about = "Autonomous CI repair agent")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the webhook ingestion server and the background janitor.
    Serve {
        /// Directory each pipeline run clones its workspace into.
        #[arg(long, default_value = "workspaces")]
        workspace_root: PathBuf,
    },
    /// Replay one captured event file straight through the pipeline,
    /// bypassing the HTTP webhook — useful for reproducing a specific
    /// failure locally.
    Replay {
        /// Path to a JSON file matching the webhook's event shape
        /// (`repo`, `run_id`, `sha`, `branch`, `workflow_name`, `action`,
        /// `conclusion`).
        #[arg(long)]
        event_file: PathBuf,

        /// Directory to clone the replayed run's workspace into.
        #[arg(long, default_value = "workspaces")]
        workspace_root: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mender=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env()?;
    let pipeline = Arc::new(build_pipeline_context(&config).await?);

    match cli.command {
        Commands::Serve { workspace_root } => {
            std::fs::create_dir_all(&workspace_root).context("creating workspace root")?;

            let janitor_sandbox = Arc::clone(&pipeline.sandbox);
            let janitor_workspace_root = workspace_root.clone();
            tokio::spawn(async move {
                mender_core::janitor::run(janitor_sandbox.as_ref(), &janitor_workspace_root).await;
            });

            server::serve(pipeline, &config, workspace_root).await
        }
        Commands::Replay {
            event_file,
            workspace_root,
        } => {
            std::fs::create_dir_all(&workspace_root).context("creating workspace root")?;
            replay(&pipeline, &event_file, &workspace_root).await
        }
    }
}

async fn build_pipeline_context(config: &AppConfig) -> Result<PipelineContext> {
    let store = SqliteStore::connect(&config.database_url)
        .await
        .context("connecting to the durable store")?;
    let sandbox = DockerSandboxDriver::connect().context("connecting to the Docker daemon")?;
    let codehost =
        GitHubCodeHost::new(config.github_token.clone()).context("building the GitHub client")?;
    let llm = HttpLlmClient::new(
        config.llm_base_url.clone(),
        config.llm_model.clone(),
        config.llm_api_key.clone(),
    );
    let notifier = Notifier::from_env();

    Ok(PipelineContext {
        llm: Arc::new(llm),
        sandbox: Arc::new(sandbox),
        codehost: Arc::new(codehost),
        store: Arc::new(store),
        notifier: Arc::new(notifier),
        sandbox_image: config.sandbox_image.clone(),
    })
}

/// Run one event through the pipeline to completion and print its outcome,
/// rather than spawning it fire-and-forget the way the webhook handler
/// does — a replay is a single debugging run, not a server handling
/// concurrent ingestions.
async fn replay(pipeline: &Arc<PipelineContext>, event_file: &Path, workspace_root: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(event_file)
        .with_context(|| format!("reading {}", event_file.display()))?;
    let event: IngestEvent = serde_json::from_str(&raw).context("parsing event file")?;

    if !event.is_failure() {
        info!(conclusion = %event.conclusion, "event is not a failure, nothing to replay");
        println!("{}", "not a completed failure, nothing to replay".yellow());
        return Ok(());
    }

    let failure = pipeline
        .store
        .upsert_failure(NewFailure {
            run_id: event.run_id,
            repo: event.repo.clone(),
            sha: event.sha.clone(),
            branch: event.branch.clone(),
            workflow_name: event.workflow_name.clone(),
        })
        .await
        .context("recording the replayed failure")?;

    let run_dir = workspace_root.join(format!("{}-{}", failure.id, failure.run_id));
    let outcome = mender_core::run_pipeline(pipeline, failure.id, &run_dir, CancellationToken::new())
        .await
        .context("running the pipeline")?;
    info!(?outcome, "replay finished");
    print_outcome(&outcome);
    Ok(())
}

fn print_outcome(outcome: &PipelineOutcome) {
    match outcome {
        PipelineOutcome::Fixed { pr_url } => {
            println!("{} {}", "✓ fixed:".green().bold(), pr_url);
        }
        PipelineOutcome::Escalated { reason, issue_url } => {
            println!("{} {reason}", "⚠ escalated:".yellow().bold());
            println!("  {issue_url}");
        }
        PipelineOutcome::NotReproduced => {
            println!("{}", "✗ failure did not reproduce".red().bold());
        }
    }
}
