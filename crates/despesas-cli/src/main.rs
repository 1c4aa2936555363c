use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use despesas_core::{IngestionRunResult, RunStatus};
use despesas_sync::{build_pipeline, recent_runs_markdown, IngestConfig, PipelineError};
use despesas_warehouse::ExistingKeyIndex;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str =
    "despesas=info,despesas_cli=info,despesas_sync=info,despesas_source=info,despesas_storage=info,despesas_warehouse=info";

#[derive(Debug, Parser)]
#[command(name = "despesas-cli")]
#[command(about = "Incremental ingestion of Queimados expense records")]
struct Cli {
    /// YAML config file; defaults to ./ingest.yaml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once.
    Sync,
    /// Run the pipeline on the configured cron until Ctrl-C.
    Schedule,
    /// Count the keys currently in the target table.
    Keys,
    /// Summarize the most recent runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_summary(result: &IngestionRunResult) {
    println!(
        "run {} {:?}: fetched={} existing={} intra_run={} appended={} table={}",
        result.run_id,
        result.status,
        result.total(|c| c.fetched),
        result.total(|c| c.rejected_existing),
        result.total(|c| c.rejected_intra_run),
        result.rows_appended,
        result.table
    );
    for (year, failure) in result.failures() {
        println!("  {year}: {:?} {}", failure.kind, failure.message);
    }
    if let Some(warning) = &result.index_warning {
        println!("  index degraded ({:?}): {}", warning.reason, warning.detail);
    }
}

async fn sync(config: &IngestConfig) -> Result<ExitCode> {
    let pipeline = build_pipeline(config)?;
    match pipeline.run_until(despesas_sync::ctrl_c()).await {
        Ok(result) => {
            print_summary(&result);
            Ok(match result.status {
                RunStatus::Succeeded | RunStatus::Partial => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            })
        }
        Err(PipelineError::Config(err)) => Err(err),
        Err(err) => {
            if let Some(result) = err.result() {
                print_summary(result);
            }
            eprintln!("{err}");
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn schedule(config: &IngestConfig) -> Result<ExitCode> {
    let pipeline = Arc::new(build_pipeline(config)?);
    let mut sched = despesas_sync::build_scheduler(pipeline, &config.schedule_cron).await?;
    sched.start().await.context("starting scheduler")?;
    info!(cron = %config.schedule_cron, "scheduler running; ctrl-c to stop");
    despesas_sync::ctrl_c().await;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(ExitCode::SUCCESS)
}

async fn keys(config: &IngestConfig) -> Result<ExitCode> {
    let pipeline = build_pipeline(config)?;
    let load = ExistingKeyIndex::new(pipeline.warehouse(), config.warehouse_timeout())
        .load()
        .await;
    println!("{} existing keys in {}", load.keys.len(), pipeline.warehouse().target());
    if let Some(warning) = load.warning {
        println!("index degraded ({:?}): {}", warning.reason, warning.detail);
    }
    Ok(ExitCode::SUCCESS)
}

fn report(config: &IngestConfig, runs: usize) -> Result<ExitCode> {
    let root = config
        .reports_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("reports"));
    println!("{}", recent_runs_markdown(&root, runs)?);
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = IngestConfig::load(cli.config.as_deref(), Path::new("."))?;

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => sync(&config).await,
        Commands::Schedule => schedule(&config).await,
        Commands::Keys => keys(&config).await,
        Commands::Report { runs } => report(&config, runs),
    }
}
