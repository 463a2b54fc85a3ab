use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use volley::{
    Options, Reporter, RunSummary, Scheduler,
    config::duration,
    error::ConfigError,
    report::{JsonReporter, StdoutReporter},
    workloads::{GrpcWorkload, HttpWorkload, WorkloadConfig, WsWorkload},
};

/// Exit status when the run completed but a threshold failed.
const THRESHOLDS_FAILED: u8 = 99;

#[derive(Parser, Debug)]
#[command(name = "volley", version)]
#[command(about = "Load testing with virtual users over HTTP, gRPC and WebSocket")]
struct Cli {
    /// Default log filter when neither VOLLEY_LOG nor RUST_LOG is set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a test described by an options file
    Run(RunArgs),
    /// Parse and validate an options file without running it
    Validate {
        /// Options file (YAML or JSON)
        options: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Options file (YAML or JSON)
    options: PathBuf,

    /// Run a single constant-vus scenario with this many VUs
    #[arg(long)]
    vus: Option<u64>,

    /// Duration of the command-line scenario, e.g. 30s or 1m30s
    #[arg(long, value_parser = duration::parse)]
    duration: Option<Duration>,

    /// Write the summary as JSON to this file
    #[arg(long)]
    summary_export: Option<PathBuf>,

    /// Print the summary as JSON instead of text
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    volley::logging::init(&cli.log_level);

    let result = match cli.command {
        Command::Run(args) => run(args).await,
        Command::Validate { options } => validate(&options).map(|()| ExitCode::SUCCESS),
    };
    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn load(path: &Path) -> Result<Options> {
    Options::from_path(path).with_context(|| format!("loading {}", path.display()))
}

fn validate(path: &Path) -> Result<()> {
    let options = load(path)?;
    options.validate()?;
    let scenarios = options.scenarios()?;
    info!(scenarios = scenarios.len(), "Options are valid");
    Ok(())
}

async fn run(args: RunArgs) -> Result<ExitCode> {
    let mut options = load(&args.options)?;
    options.apply_overrides(args.vus, args.duration);
    options.validate()?;

    let scheduler = Scheduler::from_options(&options)?;
    let insecure = options.insecure_skip_tls_verify;
    let summary = match options.workload.ok_or(ConfigError::MissingWorkload)? {
        WorkloadConfig::Http(config) => {
            scheduler.run(HttpWorkload::new(config, insecure)?).await?
        }
        WorkloadConfig::Grpc(config) => scheduler.run(GrpcWorkload::new(config, insecure)).await?,
        WorkloadConfig::Websocket(config) => scheduler.run(WsWorkload::new(config)).await?,
    };

    report(&summary, &args).await?;

    if summary.thresholds_passed() {
        Ok(ExitCode::SUCCESS)
    } else {
        error!("Some thresholds have failed");
        Ok(ExitCode::from(THRESHOLDS_FAILED))
    }
}

async fn report(summary: &RunSummary, args: &RunArgs) -> Result<()> {
    if args.json {
        JsonReporter { path: None }.report(summary).await?;
    } else {
        StdoutReporter.report(summary).await?;
    }
    if let Some(path) = &args.summary_export {
        JsonReporter {
            path: Some(path.clone()),
        }
        .report(summary)
        .await?;
    }
    Ok(())
}
