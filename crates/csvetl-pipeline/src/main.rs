//! csvetl - load delimited files into PostgreSQL

use anyhow::{Context, Result};
use clap::Parser;
use csvetl_common::logging::{init_logging, LogLevel};
use csvetl_pipeline::config::PipelineConfig;
use csvetl_pipeline::load::{PostgresSink, Sink};
use csvetl_pipeline::pipeline::Orchestrator;
use csvetl_pipeline::transform::{Extensions, RulePolicy};
use csvetl_pipeline::RunSummary;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Every file archived
const EXIT_SUCCESS: i32 = 0;
/// At least one file errored
const EXIT_DEGRADED: i32 = 1;
/// Nothing was processed: bad configuration or no database
const EXIT_SETUP: i32 = 2;

#[derive(Parser, Debug)]
#[command(name = "csvetl")]
#[command(author, version, about = "Load delimited files into PostgreSQL")]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "CSVETL_CONFIG")]
    config: Option<PathBuf>,

    /// Target table
    #[arg(long)]
    table: Option<String>,

    /// Target database schema
    #[arg(long)]
    schema: Option<String>,

    /// Directory scanned for input files
    #[arg(long)]
    input_dir: Option<PathBuf>,

    /// Number of files processed concurrently
    #[arg(long)]
    max_workers: Option<usize>,

    /// Rule evaluation policy (collect-all or short-circuit)
    #[arg(long)]
    policy: Option<RulePolicy>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn load_config(&self) -> Result<PipelineConfig> {
        let mut config = PipelineConfig::load(self.config.as_deref())?;

        if let Some(table) = &self.table {
            config.target.table = table.clone();
        }
        if let Some(schema) = &self.schema {
            config.target.schema = Some(schema.clone());
        }
        if let Some(dir) = &self.input_dir {
            config.csv.input_dir = dir.clone();
        }
        if let Some(workers) = self.max_workers {
            config.processing.max_workers = workers;
        }
        if let Some(policy) = self.policy {
            config.processing.policy = policy;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match cli.load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e:#}");
            process::exit(EXIT_SETUP);
        },
    };

    let mut log_config = match config.log_config().with_env_overrides() {
        Ok(log_config) => log_config,
        Err(e) => {
            eprintln!("Error: {e:#}");
            process::exit(EXIT_SETUP);
        },
    };
    if cli.verbose {
        log_config.level = LogLevel::Debug;
    }

    let code = {
        // keep the guard alive until file logs are flushed
        let _guard = match init_logging(&log_config) {
            Ok(guard) => guard,
            Err(e) => {
                eprintln!("Error: {e:#}");
                process::exit(EXIT_SETUP);
            },
        };

        match run(config).await {
            Ok(summary) if summary.is_success() => EXIT_SUCCESS,
            Ok(summary) => {
                warn!(errored = summary.errored(), "Run degraded");
                EXIT_DEGRADED
            },
            Err(e) => {
                error!("Run aborted: {e:#}");
                EXIT_SETUP
            },
        }
    };

    process::exit(code);
}

async fn run(config: PipelineConfig) -> Result<RunSummary> {
    info!(
        table = %config.target.table,
        input_dir = %config.csv.input_dir.display(),
        workers = config.processing.max_workers,
        policy = %config.processing.policy,
        "Starting csvetl"
    );

    // compile before connecting so a bad rule never costs a database round trip
    let validator = config
        .validator(&Extensions::default())
        .context("Invalid target configuration")?;
    let sink = PostgresSink::connect(
        &config.connect_options(),
        config.target.schema.as_deref(),
        &config.target.table,
        validator.schema(),
    )
    .await
    .context("Failed to connect to database")?;
    info!(sink = %sink.describe(), columns = validator.schema().columns().len(), "Connected");

    let cancel = CancellationToken::new();
    let orchestrator = Orchestrator::with_validator(&config, validator, Arc::new(sink), cancel.clone())?;

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing in-flight batches");
            cancel.cancel();
        }
    });

    let summary = orchestrator.run().await.context("Run failed")?;
    Ok(summary)
}
