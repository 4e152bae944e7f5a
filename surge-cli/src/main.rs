//! Surge CLI - Command-line interface
//!
//! Runs speed tests from the terminal and hosts the web surface.

mod commands;

use clap::Parser;
use surge_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "surge")]
#[command(about = "A network speed test engine")]
struct Cli {
    /// Console log level; the log file always records everything
    #[arg(long, global = true, value_enum, default_value_t = CliLogLevel::Warn)]
    log_level: CliLogLevel,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_tracing_level(), None)?;

    commands::handle_command(cli.command).await
}
