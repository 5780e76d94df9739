// SPDX-License-Identifier: MIT OR Apache-2.0
//! mech-worker command-line interface.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

/// Decentralized compute worker for the mech marketplace.
///
/// Environment overrides (all optional): MECH_PRIVATE_KEY, MECH_RPC_URL,
/// MECH_CHAIN_ID, MECH_SERVICE_ID, MECH_GATEWAY_URL, MECH_INDEXER_URL,
/// MECH_BROKER_URL, MECH_WORKSPACE_DIR, MECH_REPO_DIR, MECH_SSH_HOST_ALIAS,
/// MECH_HEALTH_PORT, MECH_TICK_INTERVAL_MS, MECH_IN_FLIGHT_CAP.
#[derive(Debug, Parser)]
#[command(name = "mech-worker", version, about, verbatim_doc_comment)]
struct Cli {
    /// Path to the worker config file.
    #[arg(long, global = true, default_value = "mech.toml")]
    config: PathBuf,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the worker: claim, execute, and deliver requests.
    Run,
    /// Show the health snapshot of a running worker.
    Status,
    /// One-shot refresh: resolve the service safe and staking state.
    Sync,
    /// List undelivered requests directed at this worker's mech.
    List,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            use clap::error::ErrorKind;
            let _ = err.print();
            return match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
        }
    };

    mech_telemetry::init(cli.json_logs);

    let result = match cli.command {
        Command::Run => commands::run(&cli.config).await,
        Command::Status => commands::status(&cli.config).await,
        Command::Sync => commands::sync(&cli.config).await,
        Command::List => commands::list(&cli.config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
