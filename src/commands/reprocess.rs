use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use widesync::{
    backfill::BackfillEngine,
    config::load_or_default,
    ledger::ProgressLedger,
    logging,
    monitor::{FailureLog, StatusRegistry},
    pool::Pool,
    reprocess::Reprocessor,
    router::AttributeRouter,
    scheduler::StopSignal,
    store::{postgres::PostgresProvider, StoreProvider},
};

#[derive(Args, Clone)]
pub struct ReprocessArgs {
    /// List the windows that would be replayed without touching anything
    #[arg(long)]
    pub dry_run: bool,

    /// Only replay windows recorded for this entity
    #[arg(long)]
    pub entity: Option<String>,
}

pub fn execute(config_path: Option<PathBuf>, args: ReprocessArgs) -> Result<()> {
    let (config, path) = load_or_default(config_path)?;
    logging::init(&config.log_dir())?;
    info!(config = %path.display(), dry_run = args.dry_run, "reprocessing failure list");

    let stop = StopSignal::new();
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.trigger())
            .context("failed to install shutdown handler")?;
    }

    let router = Arc::new(AttributeRouter::load(&config.groups)?);
    let provider = Arc::new(PostgresProvider::new(
        config.source.clone(),
        config.destination.clone(),
        Arc::clone(&router),
    ));
    let sources = Pool::build(1, || provider.open_source())
        .context("failed to open source connection")?;
    let destinations = Pool::build(config.groups.len().max(1), || provider.open_destination())
        .context("failed to open destination connections")?;

    let ledger = Arc::new(ProgressLedger::open(&config.progress_dir())?);
    let failures = Arc::new(FailureLog::open(&config.failure_list_path()));
    let engine = Arc::new(BackfillEngine::new(
        &config,
        router,
        ledger,
        sources,
        destinations,
        Arc::clone(&failures),
        StatusRegistry::new(),
        stop.clone(),
    ));

    let reprocessor = Reprocessor::new(&config, engine, failures, stop);
    let report = reprocessor.run(args.dry_run, args.entity.as_deref())?;

    println!(
        "attempted {}  succeeded {}  still failing {}",
        report.attempted, report.succeeded, report.still_failing
    );
    Ok(())
}
