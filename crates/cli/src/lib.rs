pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "banter",
    about = "Banter operator CLI",
    long_about = "Operate Banter readiness checks, migrations, and conversations from the terminal.",
    after_help = "Examples:\n  banter doctor --json\n  banter migrate\n  banter chat \"what is the weather in Paris?\" --stream\n  banter history --conversation support-1042"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Validate config, model registry readiness, and DB connectivity checks")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Send one message through the agent and print the assistant reply")]
    Chat {
        #[arg(help = "Message text to send")]
        message: String,
        #[arg(long, default_value = "default", help = "Conversation identifier")]
        conversation: String,
        #[arg(long, default_value = "operator", help = "User identifier")]
        user: String,
        #[arg(long, help = "Print reply tokens as they arrive instead of waiting for the full reply")]
        stream: bool,
    },
    #[command(about = "Print the stored message history for a conversation")]
    History {
        #[arg(long, default_value = "default", help = "Conversation identifier")]
        conversation: String,
    },
    #[command(about = "Delete the stored history for a conversation (succeeds when already empty)")]
    Clear {
        #[arg(long, default_value = "default", help = "Conversation identifier")]
        conversation: String,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Chat { message, conversation, user, stream } => {
            commands::chat::run(&message, &conversation, &user, stream)
        }
        Command::History { conversation } => commands::history::run(&conversation),
        Command::Clear { conversation } => commands::clear::run(&conversation),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
