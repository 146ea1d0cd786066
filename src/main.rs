mod cli;
mod cmd;
mod command;
mod config;
mod credentials;
mod layout;
mod logger;
mod sandbox;
mod vault;
mod workset;

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use crate::layout::BoxError;

fn main() -> ExitCode {
    let cli = cli::Cli::parse();
    if let Err(err) = logger::init(cli.verbose) {
        eprintln!("warning: logging disabled: {:#}", err);
    }
    info!(args = ?std::env::args().collect::<Vec<_>>(), "agentbox start");

    match cli::run(cli) {
        Ok(()) => {
            info!("agentbox finished successfully");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = ?err, "agentbox failed");
            eprintln!("error: {:#}", err);
            ExitCode::from(exit_code(&err))
        }
    }
}

/// Exit status for a failed command: the domain error's code if one is in
/// the chain, 1 otherwise.
fn exit_code(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<BoxError>())
        .and_then(|e| u8::try_from(e.exit_code()).ok())
        .unwrap_or(1)
}
