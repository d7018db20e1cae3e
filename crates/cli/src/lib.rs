pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "leadflow",
    about = "Leadflow operator CLI",
    long_about = "Inspect effective configuration, run readiness checks, and perform the \
                  one-time CRM authorization exchange for the lead conversation service.",
    after_help = "Examples:\n  leadflow doctor --json\n  leadflow config\n  leadflow auth --code def502..."
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Validate config, stored credentials, and reasoning key readiness")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Exchange a one-time authorization code and persist the credential file")]
    Auth {
        #[arg(long, help = "One-time authorization code from the OAuth redirect")]
        code: String,
        #[arg(long, help = "Explicit config file path (defaults to the standard lookup)")]
        config: Option<PathBuf>,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Doctor { json } => commands::doctor::run(json),
        Command::Config { json } => commands::config::run(json),
        Command::Auth { code, config } => commands::auth::run(&code, config.as_deref()),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
