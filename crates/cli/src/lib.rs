pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "kcart",
    about = "KCart operator CLI",
    long_about = "Inspect KCart configuration, run readiness checks, and send chat turns to a running server.",
    after_help = "Examples:\n  kcart doctor --json\n  kcart config\n  kcart chat --session demo-1 \"I'm a supplier\""
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, collaborator readiness, and optionally check a running server")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
        #[arg(long, help = "Base URL of a running kcart-server to check, e.g. http://127.0.0.1:8080")]
        server_url: Option<String>,
    },
    #[command(about = "Send one chat turn to a running kcart-server and print the reply")]
    Chat {
        #[arg(long, help = "Session id to continue; omitted starts a new session")]
        session: Option<String>,
        #[arg(long, help = "Base URL of the server; defaults to the configured bind address")]
        server_url: Option<String>,
        #[arg(help = "Message text")]
        message: String,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json, server_url } => commands::doctor::run(json, server_url.as_deref()),
        Command::Chat { session, server_url, message } => {
            commands::chat::run(server_url.as_deref(), session, &message)
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
