pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "vocario",
    about = "Vocario operator CLI",
    long_about = "Operate the Vocario WhatsApp document assistant: readiness checks, session \
                  schema migrations, config inspection and a local console conversation.",
    after_help = "Examples:\n  vocario doctor --json\n  vocario migrate\n  vocario chat"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending session-store migrations and print a JSON status line")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, delivery readiness, wkhtmltopdf and DB connectivity")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Hold a WhatsApp conversation in the terminal against an in-memory session")]
    Chat {
        #[arg(long, default_value = "33600000000", help = "Phone number the session belongs to")]
        phone: String,
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
        Command::Chat { phone } => commands::chat::run(&phone),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
