pub mod config;
pub mod downloader;
pub mod logging;

mod commands;

use std::process::ExitCode;

use clap::Parser;

use commands::Cli;

/// CLI entry point: parse arguments, install logging, run one command
pub fn run() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = logging::init_subscriber(cli.log_json, cli.verbose) {
        eprintln!("Warning: logging unavailable: {}", e);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(commands::execute(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
