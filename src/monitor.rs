use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    config::Config,
    error::{Result, SyncError},
    ledger::ProgressLedger,
};

/// One window that exhausted its retries. The source range is recorded so
/// the reprocessor can replay it verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedWindow {
    pub entity: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Append-only CSV of failed windows. Appends are serialized so concurrent
/// lanes cannot interleave partial records.
pub struct FailureLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FailureLog {
    pub fn open(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, window: &FailedWindow) -> Result<()> {
        let _guard = self.lock.lock();
        let exists = self.path.exists();
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(!exists)
            .from_writer(file);
        writer
            .serialize(window)
            .map_err(|err| SyncError::Serialization(err.to_string()))?;
        writer
            .flush()
            .map_err(|err| SyncError::Serialization(err.to_string()))?;
        info!(
            entity = %window.entity,
            start = %window.start,
            end = %window.end,
            "window recorded for reprocessing"
        );
        Ok(())
    }

    pub fn load(&self) -> Result<Vec<FailedWindow>> {
        let _guard = self.lock.lock();
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::Reader::from_path(&self.path)
            .map_err(|err| SyncError::Serialization(err.to_string()))?;
        let mut windows = Vec::new();
        for record in reader.deserialize() {
            let window: FailedWindow =
                record.map_err(|err| SyncError::Serialization(err.to_string()))?;
            windows.push(window);
        }
        Ok(windows)
    }

    /// Overwrite the list with the windows that are still failing.
    pub fn replace(&self, windows: &[FailedWindow]) -> Result<()> {
        let _guard = self.lock.lock();
        if windows.is_empty() {
            if self.path.exists() {
                fs::remove_file(&self.path)?;
            }
            return Ok(());
        }
        let mut writer = csv::Writer::from_path(&self.path)
            .map_err(|err| SyncError::Serialization(err.to_string()))?;
        for window in windows {
            writer
                .serialize(window)
                .map_err(|err| SyncError::Serialization(err.to_string()))?;
        }
        writer
            .flush()
            .map_err(|err| SyncError::Serialization(err.to_string()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityPhase {
    Pending,
    Backfilling,
    Live,
    Done,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EntityProgress {
    pub phase: Option<EntityPhase>,
    pub windows_completed: u64,
    pub rows_written: u64,
    pub windows_failed: u64,
    pub last_window_secs: Option<f64>,
}

/// Shared in-process progress counters, updated by the worker lanes and read
/// by the periodic progress report.
#[derive(Clone, Default)]
pub struct StatusRegistry {
    entities: Arc<RwLock<HashMap<String, EntityProgress>>>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_phase(&self, entity: &str, phase: EntityPhase) {
        let mut entities = self.entities.write();
        entities.entry(entity.to_string()).or_default().phase = Some(phase);
    }

    pub fn window_completed(&self, entity: &str, rows: u64, elapsed: Duration) {
        let mut entities = self.entities.write();
        let entry = entities.entry(entity.to_string()).or_default();
        entry.windows_completed += 1;
        entry.rows_written += rows;
        entry.last_window_secs = Some(elapsed.as_secs_f64());
    }

    pub fn window_failed(&self, entity: &str) {
        let mut entities = self.entities.write();
        entities.entry(entity.to_string()).or_default().windows_failed += 1;
    }

    pub fn rows_written(&self, entity: &str, rows: u64) {
        let mut entities = self.entities.write();
        entities.entry(entity.to_string()).or_default().rows_written += rows;
    }

    pub fn snapshot(&self) -> BTreeMap<String, EntityProgress> {
        self.entities
            .read()
            .iter()
            .map(|(entity, progress)| (entity.clone(), progress.clone()))
            .collect()
    }

    pub fn log_summary(&self) {
        for (entity, progress) in self.snapshot() {
            info!(
                entity = %entity,
                phase = ?progress.phase,
                windows = progress.windows_completed,
                rows = progress.rows_written,
                failed = progress.windows_failed,
                "progress"
            );
        }
    }
}

/// Offline status line for one entity, assembled from the ledger and the
/// failure list without touching either database.
#[derive(Debug, Clone, Serialize)]
pub struct EntityStatus {
    pub entity: String,
    pub backfill_mark: Option<DateTime<Utc>>,
    pub live_mark: Option<DateTime<Utc>>,
    /// Seconds of history still to backfill before the live boundary.
    pub backlog_secs: Option<i64>,
    /// Wall time of the most recently completed backfill window.
    pub last_window_secs: Option<f64>,
    pub failed_windows: usize,
}

pub fn collect_status(config: &Config) -> Result<Vec<EntityStatus>> {
    let ledger = ProgressLedger::open(&config.progress_dir())?;
    let failures = FailureLog::open(&config.failure_list_path());
    let failed = failures.load()?;

    let mut statuses = Vec::with_capacity(config.entities.len());
    for entity in &config.entities {
        let mark = ledger.load(entity)?;
        let failed_windows = failed.iter().filter(|w| &w.entity == entity).count();
        let backlog_secs = match (mark.backfill, mark.live) {
            (Some(backfill), Some(live)) => Some((live - backfill).num_seconds().max(0)),
            _ => None,
        };
        statuses.push(EntityStatus {
            entity: entity.clone(),
            backfill_mark: mark.backfill,
            live_mark: mark.live,
            backlog_secs,
            last_window_secs: mark.last_window_secs,
            failed_windows,
        });
    }
    Ok(statuses)
}
