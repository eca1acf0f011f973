use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use widesync::{config::load_or_default, monitor};

#[derive(Args, Clone)]
pub struct StatusArgs {
    /// Emit machine-readable JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

pub fn execute(config_path: Option<PathBuf>, args: StatusArgs) -> Result<()> {
    let (config, _) = load_or_default(config_path)?;
    let statuses = monitor::collect_status(&config)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
        return Ok(());
    }

    if statuses.is_empty() {
        println!("no entities configured");
        return Ok(());
    }

    println!(
        "{:<14} {:<25} {:<25} {:>12} {:>12} {:>14}",
        "ENTITY", "BACKFILL MARK", "LIVE MARK", "BACKLOG", "LAST WINDOW", "FAILED WINDOWS"
    );
    for status in statuses {
        println!(
            "{:<14} {:<25} {:<25} {:>12} {:>12} {:>14}",
            status.entity,
            status
                .backfill_mark
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| "-".into()),
            status
                .live_mark
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| "-".into()),
            status
                .backlog_secs
                .map(|secs| format!("{secs}s"))
                .unwrap_or_else(|| "-".into()),
            status
                .last_window_secs
                .map(|secs| format!("{secs:.1}s"))
                .unwrap_or_else(|| "-".into()),
            status.failed_windows
        );
    }
    Ok(())
}
