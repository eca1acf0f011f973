use std::io;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("classification error: {0}")]
    Classification(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("progress ledger error: {0}")]
    Ledger(String),
    #[error("backfill boundary for {entity} would move backward: {current} -> {attempted}")]
    LedgerRegression {
        entity: String,
        current: DateTime<Utc>,
        attempted: DateTime<Utc>,
    },
    #[error("resource pool exhausted after waiting {0:?}")]
    PoolExhausted(Duration),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl SyncError {
    /// Transient failures that the window/tick retry loop may re-attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::PoolExhausted(_) | Self::Io(_))
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
