pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "concierge",
    about = "Concierge operator CLI",
    long_about = "Check runtime readiness, apply migrations, inspect configuration, \
                  and run conversations through an in-process router.",
    after_help = "Examples:\n  concierge doctor --json\n  concierge config\n  \
                  concierge chat --caller demo --tier pro \"where is order 1042?\""
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, database connectivity, and migration state")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Send messages as one caller through an offline in-process router")]
    Chat {
        #[arg(long, help = "Caller identifier the conversation belongs to")]
        caller: String,
        #[arg(long, default_value = "free", help = "Caller tier: free, pro or enterprise")]
        tier: String,
        #[arg(long, default_value = "chat", help = "Channel: chat, email or social")]
        channel: String,
        #[arg(required = true, help = "Messages, sent in order within one conversation")]
        messages: Vec<String>,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => commands::doctor::run(json),
        Command::Chat { caller, tier, channel, messages } => {
            commands::chat::run(commands::chat::ChatRequest { caller, tier, channel, messages })
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
