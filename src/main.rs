//! Strata automation surface
//!
//! Thin command line over the lifecycle service: manage policies, import
//! targets and access signals, run evaluation and execution cycles, and
//! query decisions, queue state and the execution log.

mod commands;

use std::process::ExitCode;

use clap::Parser;
use commands::Cli;
use common::cli::utils;
use lifecycle::LifecycleError;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    utils::init_logging(&cli.common);

    match cli.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            for cause in e.chain().skip(1) {
                eprintln!("  caused by: {cause}");
            }
            ExitCode::from(exit_code(&e))
        }
    }
}

/// Validation failures exit with their sub-kind code, everything else with 1.
fn exit_code(error: &anyhow::Error) -> u8 {
    match error.downcast_ref::<LifecycleError>() {
        Some(LifecycleError::Validation(validation)) => validation.kind().exit_code(),
        _ => 1,
    }
}
