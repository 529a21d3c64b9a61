//! pv-migrate binary entrypoint.

use std::process::ExitCode;

use clap::Parser;

use pv_migrate_cli::cli::{Cli, Commands};
use pv_migrate_cli::commands::MigrateCommand;
use pv_migrate_cli::{CliError, logging};

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = logging::init(&cli.log_level, cli.log_format) {
        eprintln!("Error: {e}");
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Commands::Migrate(args) => MigrateCommand::new(args, cli.log_format).execute().await,
    }
}
