//! Operator command-line interface
//!
//! Thin composition root: parse arguments, build a [`Core`], dispatch.
//! The real surfaces (HTTP/SSE front-end, agent layer) live outside this
//! repository and talk to the same `Core` interfaces.

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};

use aonp_store::CancelOutcome;

use crate::config::Config;
use crate::core::Core;
use crate::logging;

/// Orchestration core for neutronics Monte Carlo studies.
#[derive(Debug, Parser)]
#[command(name = "aonp", version, about)]
struct Cli {
    /// Emit logs as single-line JSON.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// Run worker loops (and the lease reaper) until interrupted.
    Worker {
        /// Number of concurrent claim loops.
        #[arg(long, default_value_t = 1)]
        workers: usize,
    },
    /// Submit a study spec (YAML or JSON file) and print the receipt.
    Submit {
        /// Path to the study spec document.
        file: Utf8PathBuf,
    },
    /// Print a run's current state as JSON.
    Status {
        /// Run identifier.
        run_id: String,
    },
    /// Follow a run's event stream until it ends.
    Watch {
        /// Run identifier.
        run_id: String,
    },
    /// Request cancellation of a run.
    Cancel {
        /// Run identifier.
        run_id: String,
    },
}

/// Entry point for the `aonp` binary.
///
/// # Errors
///
/// Any startup or command failure, already contextualized for display.
pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.json_logs);

    let config = Config::from_env().context("invalid environment configuration")?;
    let core = Core::open(config).context("cannot open the run store")?;

    match cli.command {
        CliCommand::Worker { workers } => run_workers(&core, workers).await,
        CliCommand::Submit { file } => submit(&core, &file).await,
        CliCommand::Status { run_id } => status(&core, &run_id).await,
        CliCommand::Watch { run_id } => watch(&core, &run_id).await,
        CliCommand::Cancel { run_id } => cancel(&core, &run_id).await,
    }
}

async fn run_workers(core: &Core, workers: usize) -> Result<()> {
    let count = workers.max(1);
    tracing::info!(workers = count, runs_root = %core.config().runs_root, "starting workers");
    let set = core.start_workers(count);
    tokio::signal::ctrl_c().await.context("cannot listen for ctrl-c")?;
    tracing::info!("shutdown requested");
    set.shutdown().await;
    Ok(())
}

async fn submit(core: &Core, file: &Utf8PathBuf) -> Result<()> {
    let text = std::fs::read_to_string(file.as_std_path())
        .with_context(|| format!("cannot read spec file {file}"))?;
    let receipt = core.submit_study_yaml(&text).await?;
    println!("{}", serde_json::to_string_pretty(&receipt)?);
    Ok(())
}

async fn status(core: &Core, run_id: &str) -> Result<()> {
    let run = core.get_run(run_id).await?;
    println!("{}", serde_json::to_string_pretty(&run)?);
    if let Some(summary) = core.get_summary(run_id).await? {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }
    Ok(())
}

async fn watch(core: &Core, run_id: &str) -> Result<()> {
    let mut stream = core.stream_run(run_id).await?;
    while let Some(event) = stream.next().await {
        println!(
            "{} {:<18} {}",
            event.ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            event.kind,
            event.payload
        );
    }
    Ok(())
}

async fn cancel(core: &Core, run_id: &str) -> Result<()> {
    match core.cancel_run(run_id).await? {
        CancelOutcome::Requested(_) => println!("cancellation requested for {run_id}"),
        CancelOutcome::AlreadyTerminal => println!("{run_id} is already terminal"),
    }
    Ok(())
}
