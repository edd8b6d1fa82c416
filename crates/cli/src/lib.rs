pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "greenlight",
    about = "Greenlight operator CLI",
    long_about = "Operate the Greenlight approval engine: migrations, timeout sweeps, config inspection, and readiness checks.",
    after_help = "Examples:\n  greenlight doctor --json\n  greenlight config\n  greenlight sweep"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Scan pending approvals and dispatch overdue step timeouts")]
    Sweep {
        #[arg(long, help = "Keep sweeping at the configured interval until interrupted")]
        watch: bool,
    },
    #[command(
        about = "Inspect effective configuration values with source attribution"
    )]
    Config,
    #[command(
        about = "Run readiness checks: config, database, stored templates, approval queue"
    )]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Sweep { watch } => commands::sweep::run(watch),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
