use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use metrics::counter;
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    error::{Result, SyncError},
    ledger::ProgressLedger,
    monitor::{EntityPhase, FailedWindow, FailureLog, StatusRegistry},
    pool::Pool,
    reshape::{reshape, WideRecord},
    router::{AttributeRouter, GroupId},
    scheduler::StopSignal,
    store::{DestinationStore, SourceStore, NO_LIMIT},
};

/// Terminal state of one processed window. `Failed` means the window was
/// recorded on the failure list and the entity moves on; it is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowStatus {
    Completed,
    Failed,
}

/// Windows narrower than this are loaded whole even when over-full; the
/// rows share so few distinct timestamps that splitting cannot help.
fn min_window() -> chrono::Duration {
    chrono::Duration::seconds(1)
}

pub struct BackfillEngine {
    window: chrono::Duration,
    max_rows_per_window: usize,
    page_size: usize,
    max_retries: u32,
    pool_wait: Duration,
    router: Arc<AttributeRouter>,
    ledger: Arc<ProgressLedger>,
    sources: Pool<Box<dyn SourceStore>>,
    destinations: Pool<Box<dyn DestinationStore>>,
    failures: Arc<FailureLog>,
    status: StatusRegistry,
    stop: StopSignal,
}

impl BackfillEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &Config,
        router: Arc<AttributeRouter>,
        ledger: Arc<ProgressLedger>,
        sources: Pool<Box<dyn SourceStore>>,
        destinations: Pool<Box<dyn DestinationStore>>,
        failures: Arc<FailureLog>,
        status: StatusRegistry,
        stop: StopSignal,
    ) -> Self {
        Self {
            window: chrono::Duration::hours(config.window_hours),
            max_rows_per_window: config.max_rows_per_window,
            page_size: config.page_size,
            max_retries: config.max_window_retries.max(1),
            pool_wait: Duration::from_secs(config.pool_wait_secs),
            router,
            ledger,
            sources,
            destinations,
            failures,
            status,
            stop,
        }
    }

    /// Create every destination table this entity will load into.
    pub fn ensure_tables(&self, entity: &str) -> Result<()> {
        let mut destination = self.destinations.checkout(self.pool_wait)?;
        for group in self.router.all_groups() {
            let columns = self.router.columns_of(group);
            destination.ensure_table(entity, group, &columns)?;
        }
        Ok(())
    }

    /// Drain one entity's history up to its live mark. The live mark must
    /// already be seeded; it is the fixed upper bound backfill never crosses.
    pub fn run_entity(&self, entity: &str) -> Result<()> {
        self.status.set_phase(entity, EntityPhase::Backfilling);
        self.ensure_tables(entity)?;

        let mark = self.ledger.load(entity)?;
        let Some(boundary) = mark.live else {
            return Err(SyncError::Ledger(format!(
                "entity {entity} has no live mark; backfill has no upper bound"
            )));
        };

        let mut cursor = match mark.backfill {
            Some(at) => at,
            None => {
                let mut source = self.sources.checkout(self.pool_wait)?;
                match source.earliest_timestamp(entity, boundary)? {
                    Some(at) => at,
                    None => {
                        info!(entity, "no history before live mark; backfill complete");
                        self.ledger.advance_backfill(entity, boundary)?;
                        return Ok(());
                    }
                }
            }
        };

        info!(entity, from = %cursor, until = %boundary, "backfill starting");

        while cursor < boundary {
            if self.stop.is_set() {
                info!(entity, at = %cursor, "backfill interrupted by shutdown");
                return Ok(());
            }
            let end = (cursor + self.window).min(boundary);
            let begun = Instant::now();
            match self.process_window(entity, cursor, end)? {
                WindowStatus::Completed => {
                    self.ledger
                        .advance_backfill_timed(entity, end, begun.elapsed())?;
                }
                WindowStatus::Failed => {
                    // Recorded for reprocessing; the mark is not advanced by
                    // a failure. A later completed window moves it past this
                    // range, which stays covered by the failure list.
                }
            }
            cursor = end;
        }

        info!(entity, "backfill caught up to live mark");
        Ok(())
    }

    /// Process one half-open window through extract, reshape and load.
    /// Over-full windows are split in half recursively; each completed left
    /// half advances the ledger so a crash resumes mid-window.
    pub fn process_window(
        &self,
        entity: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<WindowStatus> {
        let begun = Instant::now();
        // One above capacity so an over-full window is detected without
        // transferring the excess.
        let mut rows = match self.fetch_with_retry(entity, start, end, self.max_rows_per_window + 1)
        {
            Ok(rows) => rows,
            Err(err) if err.is_retryable() => {
                return self.record_failure(entity, start, end, &err);
            }
            Err(err) => return Err(err),
        };

        if rows.len() > self.max_rows_per_window {
            if end - start > min_window() {
                let mid = start + (end - start) / 2;
                debug!(
                    entity,
                    rows = rows.len(),
                    %start,
                    %end,
                    %mid,
                    "window over capacity; splitting"
                );
                drop(rows);

                let first = self.process_window(entity, start, mid)?;
                if first == WindowStatus::Completed {
                    self.advance_if_forward(entity, mid)?;
                }
                let second = self.process_window(entity, mid, end)?;
                return Ok(match (first, second) {
                    (WindowStatus::Completed, WindowStatus::Completed) => WindowStatus::Completed,
                    _ => WindowStatus::Failed,
                });
            }

            // At the subdivision floor splitting cannot help. Refetch the
            // window without the cap so the ledger never advances past rows
            // the capped fetch left behind.
            warn!(
                entity,
                %start,
                %end,
                cap = self.max_rows_per_window,
                "window over capacity at the subdivision floor; loading it whole"
            );
            rows = match self.fetch_with_retry(entity, start, end, NO_LIMIT) {
                Ok(rows) => rows,
                Err(err) if err.is_retryable() => {
                    return self.record_failure(entity, start, end, &err);
                }
                Err(err) => return Err(err),
            };
        }

        let wide = reshape(&self.router, &rows);
        let row_count = rows.len();
        drop(rows);

        match self.load_window(entity, &wide) {
            Ok(written) => {
                counter!(
                    "widesync_rows_migrated_total",
                    written,
                    "entity" => entity.to_string()
                );
                self.status.window_completed(entity, written, begun.elapsed());
                debug!(entity, %start, %end, source_rows = row_count, written, "window loaded");
                Ok(WindowStatus::Completed)
            }
            Err(err) if err.is_retryable() => self.record_failure(entity, start, end, &err),
            Err(err) => Err(err),
        }
    }

    fn record_failure(
        &self,
        entity: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        err: &SyncError,
    ) -> Result<WindowStatus> {
        warn!(entity, %start, %end, error = %err, "window failed after retries");
        self.failures.append(&FailedWindow {
            entity: entity.to_string(),
            start,
            end,
        })?;
        self.status.window_failed(entity);
        counter!(
            "widesync_windows_failed_total",
            1,
            "entity" => entity.to_string()
        );
        Ok(WindowStatus::Failed)
    }

    fn fetch_with_retry(
        &self,
        entity: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<crate::reshape::NarrowRecord>> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = self
                .sources
                .checkout(self.pool_wait)
                .and_then(|mut source| source.fetch_range(entity, start, end, limit));
            match result {
                Ok(rows) => return Ok(rows),
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    warn!(entity, attempt, error = %err, "fetch failed; retrying");
                    thread::sleep(backoff_delay(attempt));
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Load reshaped rows group by group, in pages, with per-page retries.
    fn load_window(&self, entity: &str, wide: &[WideRecord]) -> Result<u64> {
        let mut written = 0u64;
        for group in self.router.all_groups() {
            let rows: Vec<WideRecord> = wide
                .iter()
                .filter(|row| row.group == group)
                .cloned()
                .collect();
            if rows.is_empty() {
                continue;
            }
            for page in rows.chunks(self.page_size) {
                written += self.upsert_with_retry(entity, group, page)?;
            }
        }
        Ok(written)
    }

    fn upsert_with_retry(
        &self,
        entity: &str,
        group: GroupId,
        page: &[WideRecord],
    ) -> Result<u64> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = self
                .destinations
                .checkout(self.pool_wait)
                .and_then(|mut destination| destination.bulk_upsert(entity, group, page));
            match result {
                Ok(written) => return Ok(written),
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    warn!(entity, %group, attempt, error = %err, "load failed; retrying");
                    thread::sleep(backoff_delay(attempt));
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Advance the backfill mark only when it moves forward. Used for
    /// mid-window checkpoints and failure replays, which may run behind a
    /// mark that later windows already pushed ahead.
    fn advance_if_forward(&self, entity: &str, to: DateTime<Utc>) -> Result<()> {
        let mark = self.ledger.load(entity)?;
        if mark.backfill.map(|current| to > current).unwrap_or(true) {
            self.ledger.advance_backfill(entity, to)?;
        }
        Ok(())
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    match attempt {
        0 | 1 => Duration::from_secs(1),
        2 => Duration::from_secs(2),
        3 => Duration::from_secs(4),
        _ => Duration::from_secs(10),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GroupConfig;
    use crate::ledger::ProgressLedger;
    use crate::reshape::{FieldValue, NarrowRecord, ValueKind};
    use crate::store::memory::MemoryStore;
    use crate::store::StoreProvider;
    use chrono::TimeZone;
    use std::io::Write as _;
    use tempfile::TempDir;

    fn ts(hour: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, min, 0).unwrap()
    }

    fn narrow(entity: &str, attr: &str, at: DateTime<Utc>, value: f64) -> NarrowRecord {
        NarrowRecord {
            entity_id: entity.into(),
            attribute_id: attr.into(),
            timestamp: at,
            kind: ValueKind::Decimal,
            value: FieldValue::Float(value),
        }
    }

    fn router_fixture(dir: &TempDir) -> Arc<AttributeRouter> {
        let path = dir.path().join("g1.txt");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "attr/a").unwrap();
        writeln!(file, "attr/b").unwrap();
        let specs = vec![GroupConfig {
            id: 1,
            name: "group1".into(),
            attributes_file: path,
        }];
        Arc::new(AttributeRouter::load(&specs).unwrap())
    }

    struct Fixture {
        engine: BackfillEngine,
        store: MemoryStore,
        ledger: Arc<ProgressLedger>,
        failures: Arc<FailureLog>,
        _dir: TempDir,
    }

    fn fixture(configure: impl FnOnce(&mut Config)) -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.entities = vec!["E1".into()];
        config.max_window_retries = 1;
        config.pool_wait_secs = 1;
        configure(&mut config);

        let router = router_fixture(&dir);
        let ledger = Arc::new(ProgressLedger::open(&dir.path().join("progress")).unwrap());
        let failures = Arc::new(FailureLog::open(&dir.path().join("failed.csv")));
        let store = MemoryStore::new();

        let sources = Pool::build(2, || store.open_source()).unwrap();
        let destinations = Pool::build(2, || store.open_destination()).unwrap();

        let engine = BackfillEngine::new(
            &config,
            router,
            Arc::clone(&ledger),
            sources,
            destinations,
            Arc::clone(&failures),
            StatusRegistry::new(),
            StopSignal::new(),
        );
        Fixture {
            engine,
            store,
            ledger,
            failures,
            _dir: dir,
        }
    }

    #[test]
    fn backfill_stops_at_the_live_mark() {
        let fx = fixture(|_| {});
        fx.store.push_rows([
            narrow("E1", "attr/a", ts(8, 0), 1.0),
            narrow("E1", "attr/a", ts(9, 0), 2.0),
            // Beyond the live mark; belongs to live sync.
            narrow("E1", "attr/a", ts(12, 30), 3.0),
        ]);
        fx.ledger.seed_live("E1", ts(12, 0)).unwrap();

        fx.engine.run_entity("E1").unwrap();

        assert_eq!(fx.store.row_count("E1", GroupId(1)), 2);
        assert_eq!(fx.ledger.load("E1").unwrap().backfill, Some(ts(12, 0)));
    }

    #[test]
    fn entity_without_history_completes_immediately() {
        let fx = fixture(|_| {});
        fx.ledger.seed_live("E1", ts(12, 0)).unwrap();
        fx.engine.run_entity("E1").unwrap();
        assert_eq!(fx.ledger.load("E1").unwrap().backfill, Some(ts(12, 0)));
        assert_eq!(fx.store.upsert_calls(), 0);
    }

    #[test]
    fn overfull_window_is_subdivided_and_fully_loaded() {
        let fx = fixture(|config| {
            config.max_rows_per_window = 2;
            config.window_hours = 4;
        });
        fx.store.push_rows([
            narrow("E1", "attr/a", ts(8, 0), 1.0),
            narrow("E1", "attr/a", ts(8, 30), 2.0),
            narrow("E1", "attr/a", ts(10, 15), 3.0),
            narrow("E1", "attr/a", ts(11, 45), 4.0),
        ]);
        fx.ledger.seed_live("E1", ts(12, 0)).unwrap();

        fx.engine.run_entity("E1").unwrap();

        assert_eq!(fx.store.row_count("E1", GroupId(1)), 4);
        assert_eq!(fx.ledger.load("E1").unwrap().backfill, Some(ts(12, 0)));
        assert!(fx.failures.load().unwrap().is_empty());
    }

    #[test]
    fn floor_window_over_capacity_is_loaded_whole() {
        let fx = fixture(|config| {
            config.max_rows_per_window = 2;
            config.window_hours = 1;
        });
        // Four rows inside one second; subdivision bottoms out and the
        // window must be taken whole rather than truncated.
        let base = ts(8, 0);
        fx.store.push_rows([
            narrow("E1", "attr/a", base, 1.0),
            narrow("E1", "attr/a", base + chrono::Duration::microseconds(1), 2.0),
            narrow("E1", "attr/a", base + chrono::Duration::microseconds(2), 3.0),
            narrow("E1", "attr/b", base + chrono::Duration::microseconds(3), 4.0),
        ]);
        fx.ledger.seed_live("E1", ts(12, 0)).unwrap();

        fx.engine.run_entity("E1").unwrap();

        assert_eq!(fx.store.row_count("E1", GroupId(1)), 4);
        assert!(fx.failures.load().unwrap().is_empty());
        assert_eq!(fx.ledger.load("E1").unwrap().backfill, Some(ts(12, 0)));
    }

    #[test]
    fn exhausted_window_lands_on_failure_list_and_engine_continues() {
        let fx = fixture(|config| {
            config.window_hours = 2;
        });
        fx.store.push_rows([
            narrow("E1", "attr/a", ts(8, 15), 1.0),
            narrow("E1", "attr/a", ts(10, 15), 2.0),
        ]);
        fx.ledger.seed_live("E1", ts(12, 0)).unwrap();
        // First window's single fetch attempt fails; retries are capped at 1.
        fx.store.fail_next_fetches(1);

        fx.engine.run_entity("E1").unwrap();

        let failed = fx.failures.load().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].entity, "E1");
        assert_eq!(failed[0].start, ts(8, 15));
        assert_eq!(failed[0].end, ts(10, 15));

        // The later window still ran and pushed the mark to the boundary.
        assert_eq!(fx.store.row_count("E1", GroupId(1)), 1);
        assert_eq!(fx.ledger.load("E1").unwrap().backfill, Some(ts(12, 0)));
    }

    #[test]
    fn failed_window_alone_leaves_the_mark_untouched() {
        let fx = fixture(|config| {
            config.window_hours = 12;
        });
        fx.store.push_rows([narrow("E1", "attr/a", ts(8, 0), 1.0)]);
        fx.ledger.seed_live("E1", ts(12, 0)).unwrap();
        fx.store.fail_next_fetches(1);

        fx.engine.run_entity("E1").unwrap();

        assert_eq!(fx.ledger.load("E1").unwrap().backfill, None);
        assert_eq!(fx.failures.load().unwrap().len(), 1);
    }

    #[test]
    fn rerun_is_idempotent() {
        let fx = fixture(|_| {});
        fx.store.push_rows([
            narrow("E1", "attr/a", ts(8, 0), 1.0),
            narrow("E1", "attr/b", ts(8, 0), 2.0),
        ]);
        fx.ledger.seed_live("E1", ts(12, 0)).unwrap();

        fx.engine.run_entity("E1").unwrap();
        let after_first = fx.store.row_count("E1", GroupId(1));

        // Simulate a re-run over the same range.
        fx.engine.process_window("E1", ts(7, 0), ts(12, 0)).unwrap();
        assert_eq!(fx.store.row_count("E1", GroupId(1)), after_first);
    }

    #[test]
    fn run_requires_a_seeded_live_mark() {
        let fx = fixture(|_| {});
        assert!(matches!(
            fx.engine.run_entity("E1").unwrap_err(),
            SyncError::Ledger(_)
        ));
    }
}
