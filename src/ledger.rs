use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, SyncError};

/// Persistent per-entity progress marks. The backfill mark is the exclusive
/// upper bound of work already completed; the live mark is the inclusive
/// lower bound of the next live poll. Written atomically so a crash can only
/// lose the most recent advance, never corrupt the file.
///
/// Both marks share one file per entity, so updates are serialized behind a
/// lock: in concurrent mode the backfill and live lanes for an entity write
/// through the same path, and an unserialized read-modify-write would drop
/// the other lane's freshly persisted mark.
pub struct ProgressLedger {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressMark {
    pub backfill: Option<DateTime<Utc>>,
    pub live: Option<DateTime<Utc>>,
    /// Wall time of the most recently completed backfill window, in seconds.
    #[serde(default)]
    pub last_window_secs: Option<f64>,
}

impl ProgressLedger {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    fn entity_path(&self, entity: &str) -> PathBuf {
        // Entity ids are plain identifiers; guard against path traversal in
        // a hand-edited config anyway.
        let safe: String = entity
            .chars()
            .map(|ch| if ch.is_alphanumeric() || ch == '-' { ch } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }

    pub fn load(&self, entity: &str) -> Result<ProgressMark> {
        let path = self.entity_path(entity);
        if !path.exists() {
            return Ok(ProgressMark::default());
        }
        let contents = fs::read_to_string(&path)?;
        let mark: ProgressMark = serde_json::from_str(&contents).map_err(|err| {
            SyncError::Ledger(format!(
                "corrupt progress file {}: {}",
                path.display(),
                err
            ))
        })?;
        Ok(mark)
    }

    /// Advance the backfill mark. Regression is a hard error: a mark that
    /// moves backward would re-cover a range the ledger already declared
    /// complete and masks a scheduling bug.
    pub fn advance_backfill(&self, entity: &str, to: DateTime<Utc>) -> Result<()> {
        self.advance_backfill_inner(entity, to, None)
    }

    /// Like `advance_backfill`, recording how long the completed window took.
    pub fn advance_backfill_timed(
        &self,
        entity: &str,
        to: DateTime<Utc>,
        elapsed: Duration,
    ) -> Result<()> {
        self.advance_backfill_inner(entity, to, Some(elapsed))
    }

    fn advance_backfill_inner(
        &self,
        entity: &str,
        to: DateTime<Utc>,
        elapsed: Option<Duration>,
    ) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut mark = self.load(entity)?;
        if let Some(current) = mark.backfill {
            if to < current {
                return Err(SyncError::LedgerRegression {
                    entity: entity.to_string(),
                    current,
                    attempted: to,
                });
            }
        }
        mark.backfill = Some(to);
        if let Some(elapsed) = elapsed {
            mark.last_window_secs = Some(elapsed.as_secs_f64());
        }
        self.persist(entity, &mark)?;
        debug!(entity, mark = %to, "backfill mark advanced");
        Ok(())
    }

    /// Record the live mark after a completed poll. The live mark may move
    /// in either direction across restarts (it is re-seeded from the clock),
    /// so no monotonic check applies.
    pub fn advance_live(&self, entity: &str, to: DateTime<Utc>) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut mark = self.load(entity)?;
        mark.live = Some(to);
        self.persist(entity, &mark)?;
        debug!(entity, mark = %to, "live mark advanced");
        Ok(())
    }

    /// Seed the live mark before the first live poll. Persisted before any
    /// live processing so the backfill boundary is durable: backfill never
    /// crosses this point even if the process dies immediately after.
    pub fn seed_live(&self, entity: &str, seed: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let _guard = self.write_lock.lock();
        let mut mark = self.load(entity)?;
        if let Some(existing) = mark.live {
            debug!(entity, mark = %existing, "live mark already seeded");
            return Ok(existing);
        }
        mark.live = Some(seed);
        self.persist(entity, &mark)?;
        info!(entity, seed = %seed, "live mark seeded");
        Ok(seed)
    }

    fn persist(&self, entity: &str, mark: &ProgressMark) -> Result<()> {
        let path = self.entity_path(entity);
        let tmp = path.with_extension("json.tmp");
        let contents = serde_json::to_vec_pretty(mark)?;
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&contents)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn fresh_entity_has_empty_marks() {
        let dir = tempdir().unwrap();
        let ledger = ProgressLedger::open(dir.path()).unwrap();
        assert_eq!(ledger.load("IMO1234567").unwrap(), ProgressMark::default());
    }

    #[test]
    fn backfill_mark_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let ledger = ProgressLedger::open(dir.path()).unwrap();
            ledger.advance_backfill("IMO1234567", at(12)).unwrap();
        }
        let ledger = ProgressLedger::open(dir.path()).unwrap();
        assert_eq!(ledger.load("IMO1234567").unwrap().backfill, Some(at(12)));
    }

    #[test]
    fn backfill_regression_is_rejected() {
        let dir = tempdir().unwrap();
        let ledger = ProgressLedger::open(dir.path()).unwrap();
        ledger.advance_backfill("IMO1234567", at(12)).unwrap();

        let err = ledger.advance_backfill("IMO1234567", at(10)).unwrap_err();
        assert!(matches!(err, SyncError::LedgerRegression { .. }));
        // The stored mark is untouched.
        assert_eq!(ledger.load("IMO1234567").unwrap().backfill, Some(at(12)));
    }

    #[test]
    fn equal_mark_is_accepted() {
        let dir = tempdir().unwrap();
        let ledger = ProgressLedger::open(dir.path()).unwrap();
        ledger.advance_backfill("IMO1234567", at(12)).unwrap();
        ledger.advance_backfill("IMO1234567", at(12)).unwrap();
    }

    #[test]
    fn seed_live_is_idempotent() {
        let dir = tempdir().unwrap();
        let ledger = ProgressLedger::open(dir.path()).unwrap();

        let first = ledger.seed_live("IMO1234567", at(9)).unwrap();
        assert_eq!(first, at(9));

        // A later seed attempt keeps the original value.
        let second = ledger.seed_live("IMO1234567", at(11)).unwrap();
        assert_eq!(second, at(9));
    }

    #[test]
    fn marks_are_independent_per_entity_and_mode() {
        let dir = tempdir().unwrap();
        let ledger = ProgressLedger::open(dir.path()).unwrap();

        ledger.advance_backfill("IMO0000001", at(8)).unwrap();
        ledger.advance_live("IMO0000001", at(14)).unwrap();
        ledger.advance_backfill("IMO0000002", at(6)).unwrap();

        let first = ledger.load("IMO0000001").unwrap();
        assert_eq!(first.backfill, Some(at(8)));
        assert_eq!(first.live, Some(at(14)));

        let second = ledger.load("IMO0000002").unwrap();
        assert_eq!(second.backfill, Some(at(6)));
        assert_eq!(second.live, None);
    }

    #[test]
    fn timed_advance_records_window_duration() {
        let dir = tempdir().unwrap();
        let ledger = ProgressLedger::open(dir.path()).unwrap();

        ledger
            .advance_backfill_timed("IMO1234567", at(12), Duration::from_millis(2500))
            .unwrap();
        let mark = ledger.load("IMO1234567").unwrap();
        assert_eq!(mark.last_window_secs, Some(2.5));

        // An untimed advance keeps the last recorded duration.
        ledger.advance_backfill("IMO1234567", at(14)).unwrap();
        assert_eq!(
            ledger.load("IMO1234567").unwrap().last_window_secs,
            Some(2.5)
        );
    }

    #[test]
    fn concurrent_mode_lanes_never_clobber_each_other() {
        use std::{sync::Arc, thread};

        let dir = tempdir().unwrap();
        let ledger = Arc::new(ProgressLedger::open(dir.path()).unwrap());
        let minute = |m: u32| Utc.with_ymd_and_hms(2024, 5, 1, 10, m, 0).unwrap();

        // One lane per mark, both writing through the same entity file.
        let backfill = {
            let ledger = Arc::clone(&ledger);
            thread::spawn(move || {
                for m in 0..50 {
                    ledger.advance_backfill("IMO1234567", minute(m)).unwrap();
                }
            })
        };
        let live = {
            let ledger = Arc::clone(&ledger);
            thread::spawn(move || {
                for m in 0..50 {
                    ledger.advance_live("IMO1234567", minute(m)).unwrap();
                }
            })
        };
        backfill.join().unwrap();
        live.join().unwrap();

        let mark = ledger.load("IMO1234567").unwrap();
        assert_eq!(mark.backfill, Some(minute(49)));
        assert_eq!(mark.live, Some(minute(49)));
    }

    #[test]
    fn corrupt_file_is_reported_not_silently_reset() {
        let dir = tempdir().unwrap();
        let ledger = ProgressLedger::open(dir.path()).unwrap();
        fs::write(dir.path().join("IMO1234567.json"), b"{not json").unwrap();
        assert!(matches!(
            ledger.load("IMO1234567").unwrap_err(),
            SyncError::Ledger(_)
        ));
    }
}
