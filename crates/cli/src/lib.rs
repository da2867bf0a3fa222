pub mod commands;
pub mod logging;
pub mod plan;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

use commands::run::RunArgs;

#[derive(Debug, Parser)]
#[command(
    name = "autotriage",
    about = "Autotriage operator CLI",
    long_about = "Apply rule plans to the issue tracker under quotas and a change ceiling, and inspect the results.",
    after_help = "Examples:\n  autotriage run --plan plan.json\n  autotriage run --plan plan.json --production\n  autotriage ledger --rule stalled"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Run the rules of a plan file (dry run unless --production)")]
    Run(RunArgs),
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Inspect effective configuration values with source attribution and redaction")]
    Config,
    #[command(about = "List the most recent ledger records of a rule")]
    Ledger {
        #[arg(long, help = "Rule whose applied changes are listed")]
        rule: String,
        #[arg(long, default_value_t = 20, help = "Maximum number of records")]
        limit: u32,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Run(args) => commands::run::run(&args),
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Ledger { rule, limit } => commands::ledger::run(&rule, limit),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
