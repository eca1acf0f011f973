use std::{collections::BTreeSet, sync::Arc, time::Duration};

use tracing::{info, warn};

use crate::{
    backfill::{BackfillEngine, WindowStatus},
    config::Config,
    error::Result,
    monitor::FailureLog,
    scheduler::StopSignal,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReprocessReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub still_failing: usize,
}

/// Replays the failure list through the regular window path. Meant to run
/// while the engine itself is stopped; it rewrites the failure list when it
/// finishes.
pub struct Reprocessor {
    engine: Arc<BackfillEngine>,
    failures: Arc<FailureLog>,
    delay: Duration,
    stop: StopSignal,
}

impl Reprocessor {
    pub fn new(
        config: &Config,
        engine: Arc<BackfillEngine>,
        failures: Arc<FailureLog>,
        stop: StopSignal,
    ) -> Self {
        Self {
            engine,
            failures,
            delay: Duration::from_millis(config.reprocess_delay_ms),
            stop,
        }
    }

    /// Replay recorded windows, optionally restricted to one entity. With
    /// `dry_run` the list is only printed. Windows that fail again stay on
    /// the list, as do windows outside the entity filter; everything else
    /// is removed.
    pub fn run(&self, dry_run: bool, entity_filter: Option<&str>) -> Result<ReprocessReport> {
        let all = self.failures.load()?;
        let (windows, skipped): (Vec<_>, Vec<_>) = all.into_iter().partition(|window| {
            entity_filter
                .map(|entity| window.entity == entity)
                .unwrap_or(true)
        });
        if windows.is_empty() {
            info!("failure list has no matching windows; nothing to reprocess");
            return Ok(ReprocessReport::default());
        }

        if dry_run {
            for window in &windows {
                info!(
                    entity = %window.entity,
                    start = %window.start,
                    end = %window.end,
                    "would reprocess"
                );
            }
            return Ok(ReprocessReport {
                attempted: 0,
                succeeded: 0,
                still_failing: windows.len(),
            });
        }

        let entities: BTreeSet<&str> =
            windows.iter().map(|window| window.entity.as_str()).collect();
        for entity in entities {
            self.engine.ensure_tables(entity)?;
        }

        let mut report = ReprocessReport::default();
        let mut still_failing = Vec::new();
        for (index, window) in windows.iter().enumerate() {
            if self.stop.is_set() {
                // Untried windows keep their place on the list.
                still_failing.extend(windows[index..].iter().cloned());
                break;
            }
            report.attempted += 1;
            info!(
                entity = %window.entity,
                start = %window.start,
                end = %window.end,
                "reprocessing window"
            );
            match self
                .engine
                .process_window(&window.entity, window.start, window.end)?
            {
                WindowStatus::Completed => report.succeeded += 1,
                WindowStatus::Failed => {
                    warn!(
                        entity = %window.entity,
                        start = %window.start,
                        end = %window.end,
                        "window failed again"
                    );
                    still_failing.push(window.clone());
                }
            }
            self.stop.sleep(self.delay);
        }

        report.still_failing = still_failing.len();
        let mut retained = skipped;
        retained.extend(still_failing);
        self.failures.replace(&retained)?;
        info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            still_failing = report.still_failing,
            "reprocessing finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GroupConfig;
    use crate::ledger::ProgressLedger;
    use crate::monitor::{FailedWindow, StatusRegistry};
    use crate::pool::Pool;
    use crate::reshape::{FieldValue, NarrowRecord, ValueKind};
    use crate::router::{AttributeRouter, GroupId};
    use crate::store::memory::MemoryStore;
    use crate::store::StoreProvider;
    use chrono::{DateTime, TimeZone, Utc};
    use std::io::Write as _;
    use tempfile::TempDir;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
    }

    struct Fixture {
        reprocessor: Reprocessor,
        store: MemoryStore,
        failures: Arc<FailureLog>,
        _dir: TempDir,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("g1.txt");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "attr/a").unwrap();
        let router = Arc::new(
            AttributeRouter::load(&[GroupConfig {
                id: 1,
                name: "group1".into(),
                attributes_file: path,
            }])
            .unwrap(),
        );

        let mut config = Config::default();
        config.entities = vec!["E1".into()];
        config.max_window_retries = 1;
        config.pool_wait_secs = 1;
        config.reprocess_delay_ms = 0;

        let ledger = Arc::new(ProgressLedger::open(&dir.path().join("progress")).unwrap());
        let failures = Arc::new(FailureLog::open(&dir.path().join("failed.csv")));
        let store = MemoryStore::new();
        let sources = Pool::build(1, || store.open_source()).unwrap();
        let destinations = Pool::build(1, || store.open_destination()).unwrap();

        let engine = Arc::new(BackfillEngine::new(
            &config,
            router,
            ledger,
            sources,
            destinations,
            Arc::clone(&failures),
            StatusRegistry::new(),
            StopSignal::new(),
        ));
        let reprocessor = Reprocessor::new(
            &config,
            engine,
            Arc::clone(&failures),
            StopSignal::new(),
        );
        Fixture {
            reprocessor,
            store,
            failures,
            _dir: dir,
        }
    }

    fn narrow(at: DateTime<Utc>) -> NarrowRecord {
        NarrowRecord {
            entity_id: "E1".into(),
            attribute_id: "attr/a".into(),
            timestamp: at,
            kind: ValueKind::Decimal,
            value: FieldValue::Float(1.0),
        }
    }

    fn failed(hour: u32) -> FailedWindow {
        FailedWindow {
            entity: "E1".into(),
            start: ts(hour),
            end: ts(hour + 2),
        }
    }

    #[test]
    fn successful_replay_clears_the_list() {
        let fx = fixture();
        fx.store.push_rows([narrow(ts(9))]);
        fx.failures.append(&failed(8)).unwrap();

        let report = fx.reprocessor.run(false, None).unwrap();
        assert_eq!(
            report,
            ReprocessReport {
                attempted: 1,
                succeeded: 1,
                still_failing: 0
            }
        );
        assert!(fx.failures.load().unwrap().is_empty());
        assert_eq!(fx.store.row_count("E1", GroupId(1)), 1);
    }

    #[test]
    fn entity_filter_leaves_other_windows_listed() {
        let fx = fixture();
        fx.store.push_rows([narrow(ts(9))]);
        fx.failures.append(&failed(8)).unwrap();
        let other = FailedWindow {
            entity: "E2".into(),
            start: ts(8),
            end: ts(10),
        };
        fx.failures.append(&other).unwrap();

        let report = fx.reprocessor.run(false, Some("E1")).unwrap();
        assert_eq!(report.attempted, 1);
        assert_eq!(report.succeeded, 1);
        // E2's window was never tried and survives the rewrite.
        assert_eq!(fx.failures.load().unwrap(), vec![other]);
    }

    #[test]
    fn still_failing_windows_stay_listed() {
        let fx = fixture();
        fx.store.push_rows([narrow(ts(9))]);
        fx.failures.append(&failed(8)).unwrap();
        fx.store.fail_next_fetches(1);

        let report = fx.reprocessor.run(false, None).unwrap();
        assert_eq!(report.attempted, 1);
        assert_eq!(report.succeeded, 0);
        assert_eq!(report.still_failing, 1);
        assert_eq!(fx.failures.load().unwrap(), vec![failed(8)]);
    }

    #[test]
    fn dry_run_changes_nothing() {
        let fx = fixture();
        fx.failures.append(&failed(8)).unwrap();

        let report = fx.reprocessor.run(true, None).unwrap();
        assert_eq!(report.attempted, 0);
        assert_eq!(report.still_failing, 1);
        assert_eq!(fx.failures.load().unwrap(), vec![failed(8)]);
        assert_eq!(fx.store.upsert_calls(), 0);
    }

    #[test]
    fn empty_list_is_a_no_op() {
        let fx = fixture();
        let report = fx.reprocessor.run(false, None).unwrap();
        assert_eq!(report, ReprocessReport::default());
    }
}
