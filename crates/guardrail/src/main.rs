//! guardrail-server binary.

use anyhow::Context;
use clap::Parser;
use tracing::info;

use guardrail::{AppState, Config};
use guardrail_logging::{init_logging, LogConfig};

#[derive(Debug, Parser)]
#[command(name = "guardrail-server", about = "Active guardrail MCP server")]
struct Cli {
    /// Mirror the file log filter on stderr.
    #[arg(short, long)]
    verbose: bool,

    /// Run a rule sync from the configured source directories and exit.
    #[arg(long)]
    sync_only: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(LogConfig {
        app_name: "guardrail-server",
        verbose: cli.verbose,
    })
    .context("Failed to initialize logging")?;

    let config = Config::from_env().context("Configuration error")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build runtime")?;

    runtime.block_on(async move {
        let state = AppState::build(config).await?;

        if cli.sync_only {
            return run_sync_only(&state).await;
        }

        guardrail::run(state).await
    })
}

async fn run_sync_only(state: &AppState) -> anyhow::Result<()> {
    let dirs = state.inner.config.rule_source_dirs.clone();
    if dirs.is_empty() {
        anyhow::bail!("RULE_SOURCE_DIRS is empty; nothing to sync");
    }
    let report = guardrail_ingest::run_sync(
        &state.inner.pool,
        &guardrail_ingest::SyncOptions {
            paths: dirs,
            source: guardrail_engine::RuleSource::Markdown,
        },
    )
    .await?;
    info!(
        job_id = %report.job_id,
        added = report.rules_added,
        updated = report.rules_updated,
        orphaned = report.rules_orphaned,
        errors = report.errors.len(),
        "sync finished"
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
