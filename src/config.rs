use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

pub const DEFAULT_WINDOW_HOURS: i64 = 2;
pub const DEFAULT_MAX_ROWS_PER_WINDOW: usize = 1_000_000;
pub const DEFAULT_PAGE_SIZE: usize = 50_000;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_LIVE_LOOKBACK_SECS: i64 = 120;
pub const DEFAULT_MAX_WORKERS: usize = 8;
pub const DEFAULT_WINDOW_RETRIES: u32 = 3;
pub const DEFAULT_POOL_WAIT_SECS: u64 = 30;

/// One destination group: a named partition of the attribute space backed by
/// its own wide table per entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub id: u16,
    pub name: String,
    pub attributes_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub connection: String,
    pub schema: String,
    pub table: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            connection: "postgresql://localhost:5432/timeseries".into(),
            schema: "tenant".into(),
            table: "tbl_data_timeseries".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub connection: String,
    pub schema: String,
    /// Explicit SQL types for columns whose inferred type is wrong.
    #[serde(default)]
    pub column_types: BTreeMap<String, String>,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            connection: "postgresql://localhost:5432/timeseries".into(),
            schema: "tenant".into(),
            column_types: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub entities: Vec<String>,
    pub groups: Vec<GroupConfig>,
    pub source: SourceConfig,
    pub destination: DestinationConfig,

    pub window_hours: i64,
    pub max_rows_per_window: usize,
    pub page_size: usize,
    pub max_window_retries: u32,

    pub poll_interval_secs: u64,
    pub live_lookback_secs: i64,
    /// Dedup cache trailing window, expressed in poll intervals.
    pub dedup_window_ticks: u32,
    pub dedup_cache_capacity: usize,

    pub max_workers: usize,
    pub pool_wait_secs: u64,
    pub reprocess_delay_ms: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for Config {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            data_dir: default_data_dir(),
            entities: Vec::new(),
            groups: Vec::new(),
            source: SourceConfig::default(),
            destination: DestinationConfig::default(),
            window_hours: DEFAULT_WINDOW_HOURS,
            max_rows_per_window: DEFAULT_MAX_ROWS_PER_WINDOW,
            page_size: DEFAULT_PAGE_SIZE,
            max_window_retries: DEFAULT_WINDOW_RETRIES,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            live_lookback_secs: DEFAULT_LIVE_LOOKBACK_SECS,
            dedup_window_ticks: 4,
            dedup_cache_capacity: 4096,
            max_workers: DEFAULT_MAX_WORKERS,
            pool_wait_secs: DEFAULT_POOL_WAIT_SECS,
            reprocess_delay_ms: 500,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigUpdate {
    pub data_dir: Option<PathBuf>,
    pub window_hours: Option<i64>,
    pub poll_interval_secs: Option<u64>,
    pub max_workers: Option<usize>,
}

pub fn default_config_path() -> Result<PathBuf> {
    let mut path = env::current_dir().map_err(|err| SyncError::Config(err.to_string()))?;
    path.push(".widesync");
    path.push("config.toml");
    Ok(path)
}

pub fn load_or_default(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let config_path = if let Some(path) = path {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        path
    } else {
        default_config_path()?
    };

    if config_path.exists() {
        let contents = fs::read_to_string(&config_path)?;
        let cfg: Config = toml::from_str(&contents)?;
        cfg.validate()?;
        cfg.ensure_data_dir()?;
        Ok((cfg, config_path))
    } else {
        let cfg = Config::default();
        cfg.ensure_data_dir()?;
        cfg.save(&config_path)?;
        Ok((cfg, config_path))
    }
}

impl Config {
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn apply_update(&mut self, update: ConfigUpdate) {
        if let Some(dir) = update.data_dir {
            self.data_dir = dir;
        }
        if let Some(hours) = update.window_hours {
            self.window_hours = hours;
        }
        if let Some(secs) = update.poll_interval_secs {
            self.poll_interval_secs = secs;
        }
        if let Some(workers) = update.max_workers {
            self.max_workers = workers;
        }
        self.updated_at = Utc::now();
    }

    pub fn validate(&self) -> Result<()> {
        if self.window_hours <= 0 {
            return Err(SyncError::Config("window_hours must be positive".into()));
        }
        if self.page_size == 0 || self.max_rows_per_window == 0 {
            return Err(SyncError::Config(
                "page_size and max_rows_per_window must be positive".into(),
            ));
        }
        if self.max_workers == 0 {
            return Err(SyncError::Config("max_workers must be positive".into()));
        }
        let mut seen = std::collections::BTreeSet::new();
        for group in &self.groups {
            if !seen.insert(group.id) {
                return Err(SyncError::Config(format!(
                    "duplicate group id {} in configuration",
                    group.id
                )));
            }
        }
        Ok(())
    }

    pub fn ensure_data_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        fs::create_dir_all(self.progress_dir())?;
        Ok(())
    }

    pub fn progress_dir(&self) -> PathBuf {
        self.data_dir.join("progress")
    }

    pub fn failure_list_path(&self) -> PathBuf {
        self.data_dir.join("failed_windows.csv")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Number of lanes that will actually run for the configured entity set.
    pub fn lane_count(&self) -> usize {
        self.entities.len().min(self.max_workers).max(1)
    }

    /// Destination pool size: each lane may hold one connection per group so
    /// that a window can load all of its destination tables without waiting
    /// on a sibling lane.
    pub fn pool_size(&self) -> usize {
        let groups = self.groups.len().max(1);
        self.lane_count() * groups
    }
}

fn default_data_dir() -> PathBuf {
    let Ok(current_dir) = env::current_dir() else {
        return PathBuf::from(".widesync");
    };
    current_dir.join(".widesync")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config_with(entities: usize, groups: usize, max_workers: usize) -> Config {
        let mut cfg = Config::default();
        cfg.entities = (0..entities).map(|i| format!("IMO{i:07}")).collect();
        cfg.groups = (0..groups)
            .map(|i| GroupConfig {
                id: i as u16 + 1,
                name: format!("group_{}", i + 1),
                attributes_file: PathBuf::from(format!("attrs_{}.txt", i + 1)),
            })
            .collect();
        cfg.max_workers = max_workers;
        cfg
    }

    #[test]
    fn pool_is_sized_for_lanes_times_groups() {
        let cfg = config_with(8, 3, 16);
        assert_eq!(cfg.lane_count(), 8);
        assert_eq!(cfg.pool_size(), 24);

        let capped = config_with(20, 3, 4);
        assert_eq!(capped.lane_count(), 4);
        assert_eq!(capped.pool_size(), 12);
    }

    #[test]
    fn round_trips_through_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut cfg = config_with(2, 3, 4);
        cfg.data_dir = dir.path().join("data");
        cfg.save(&path).unwrap();

        let (loaded, loaded_path) = load_or_default(Some(path.clone())).unwrap();
        assert_eq!(loaded_path, path);
        assert_eq!(loaded.entities, cfg.entities);
        assert_eq!(loaded.groups.len(), 3);
        assert_eq!(loaded.window_hours, DEFAULT_WINDOW_HOURS);
    }

    #[test]
    fn rejects_duplicate_group_ids() {
        let mut cfg = config_with(1, 2, 2);
        cfg.groups[1].id = cfg.groups[0].id;
        assert!(matches!(cfg.validate(), Err(SyncError::Config(_))));
    }

    #[test]
    fn creates_default_config_on_first_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let (cfg, _) = load_or_default(Some(path.clone())).unwrap();
        assert!(path.exists());
        assert_eq!(cfg.max_workers, DEFAULT_MAX_WORKERS);
    }
}
