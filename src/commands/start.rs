use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use tracing::info;

use widesync::{
    backfill::BackfillEngine,
    config::{load_or_default, Config},
    ledger::ProgressLedger,
    live::LiveSyncProcessor,
    logging,
    monitor::{FailureLog, StatusRegistry},
    pool::Pool,
    router::AttributeRouter,
    scheduler::{RunMode, StopSignal, WorkerScheduler},
    store::{postgres::PostgresProvider, StoreProvider},
};

#[derive(Args, Clone)]
pub struct StartArgs {
    /// What to run: historical backfill, live sync, or both
    #[arg(long, value_enum, default_value_t = ModeArg::Concurrent)]
    pub mode: ModeArg,

    /// Override the configured data directory
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
}

#[derive(Copy, Clone, Debug, ValueEnum, PartialEq, Eq)]
pub enum ModeArg {
    Backfill,
    Live,
    #[value(alias = "both")]
    Concurrent,
}

impl From<ModeArg> for RunMode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Backfill => RunMode::Backfill,
            ModeArg::Live => RunMode::Live,
            ModeArg::Concurrent => RunMode::Concurrent,
        }
    }
}

pub fn execute(config_path: Option<PathBuf>, args: StartArgs) -> Result<()> {
    let (mut config, path) = load_or_default(config_path)?;
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
        config.ensure_data_dir()?;
    }
    logging::init(&config.log_dir())?;
    info!(config = %path.display(), mode = ?args.mode, "starting");

    let stop = StopSignal::new();
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || {
            info!("shutdown requested");
            stop.trigger();
        })
        .context("failed to install shutdown handler")?;
    }

    let scheduler = build_scheduler(&config, stop)?;
    scheduler.run(args.mode.into())?;
    Ok(())
}

fn build_scheduler(config: &Config, stop: StopSignal) -> Result<WorkerScheduler> {
    let router = Arc::new(AttributeRouter::load(&config.groups)?);
    let provider = Arc::new(PostgresProvider::new(
        config.source.clone(),
        config.destination.clone(),
        Arc::clone(&router),
    ));

    // Backfill lanes and live lanes each need their own source session.
    let source_pool_size = config.lane_count() + config.entities.len();
    let sources = Pool::build(source_pool_size, || provider.open_source())
        .context("failed to open source connections")?;
    let destinations = Pool::build(config.pool_size() + config.entities.len(), || {
        provider.open_destination()
    })
    .context("failed to open destination connections")?;

    let ledger = Arc::new(ProgressLedger::open(&config.progress_dir())?);
    let failures = Arc::new(FailureLog::open(&config.failure_list_path()));
    let status = StatusRegistry::new();

    let engine = Arc::new(BackfillEngine::new(
        config,
        Arc::clone(&router),
        Arc::clone(&ledger),
        sources.clone(),
        destinations.clone(),
        Arc::clone(&failures),
        status.clone(),
        stop.clone(),
    ));
    let live = Arc::new(LiveSyncProcessor::new(
        config,
        router,
        ledger,
        sources,
        destinations,
        status.clone(),
        stop.clone(),
    ));

    Ok(WorkerScheduler::new(config, engine, live, status, stop))
}
