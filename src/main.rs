mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::commands::{
    config::ConfigArgs,
    reprocess::ReprocessArgs,
    start::StartArgs,
    status::StatusArgs,
};

#[derive(Parser)]
#[command(author, version, about = "Narrow-to-wide time-series table synchronizer")]
struct Cli {
    /// Path to the configuration file. Defaults to ./.widesync/config.toml
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the migration engine
    Start(StartArgs),
    /// Show per-entity progress from the ledger and the failure list
    Status(StatusArgs),
    /// Replay windows from the failure list
    Reprocess(ReprocessArgs),
    /// Show or update the configuration
    Config(ConfigArgs),
}

fn main() -> Result<()> {
    let Cli { config, command } = Cli::parse();

    match command {
        Commands::Start(args) => commands::start::execute(config, args)?,
        Commands::Status(args) => commands::status::execute(config, args)?,
        Commands::Reprocess(args) => commands::reprocess::execute(config, args)?,
        Commands::Config(args) => commands::config::execute(config, args)?,
    }

    Ok(())
}
