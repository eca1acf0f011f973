use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use widesync::config::{load_or_default, ConfigUpdate};

#[derive(Args, Clone)]
pub struct ConfigArgs {
    /// New data directory
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// New backfill window size in hours
    #[arg(long)]
    pub window_hours: Option<i64>,

    /// New live poll interval in seconds
    #[arg(long)]
    pub poll_interval: Option<u64>,

    /// New worker lane cap
    #[arg(long)]
    pub max_workers: Option<usize>,
}

impl ConfigArgs {
    fn is_update(&self) -> bool {
        self.data_dir.is_some()
            || self.window_hours.is_some()
            || self.poll_interval.is_some()
            || self.max_workers.is_some()
    }
}

pub fn execute(config_path: Option<PathBuf>, args: ConfigArgs) -> Result<()> {
    let (mut config, path) = load_or_default(config_path)?;

    if !args.is_update() {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    config.apply_update(ConfigUpdate {
        data_dir: args.data_dir,
        window_hours: args.window_hours,
        poll_interval_secs: args.poll_interval,
        max_workers: args.max_workers,
    });
    config.validate()?;
    config.save(&path)?;
    println!("configuration updated: {}", path.display());
    Ok(())
}
