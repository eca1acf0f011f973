use std::{num::NonZeroUsize, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use lru::LruCache;
use metrics::counter;
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    error::{Result, SyncError},
    ledger::ProgressLedger,
    monitor::{EntityPhase, StatusRegistry},
    pool::Pool,
    reshape::{reshape, WideRecord},
    router::AttributeRouter,
    scheduler::StopSignal,
    store::{DestinationStore, SourceStore, NO_LIMIT},
};

/// Recently written timestamps for one entity. Every poll re-reads a
/// trailing slice of the source, so most rows it sees were already written
/// by an earlier tick; the cache lets those be skipped without a round trip.
///
/// The cache is advisory. A hit is re-verified against the destination
/// before the row is skipped, so an eviction or a process restart can only
/// cost a redundant upsert, never a lost row.
pub struct DedupCache {
    entries: LruCache<DateTime<Utc>, ()>,
    window: chrono::Duration,
}

impl DedupCache {
    pub fn new(capacity: usize, window: chrono::Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            window,
        }
    }

    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        self.entries.contains(&timestamp)
    }

    pub fn record(&mut self, timestamp: DateTime<Utc>) {
        self.entries.put(timestamp, ());
    }

    /// Drop entries that fell out of the trailing window; polls can no
    /// longer see their timestamps, so they only waste capacity.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let horizon = now - self.window;
        let expired: Vec<DateTime<Utc>> = self
            .entries
            .iter()
            .filter(|(timestamp, _)| **timestamp < horizon)
            .map(|(timestamp, _)| *timestamp)
            .collect();
        for timestamp in expired {
            self.entries.pop(&timestamp);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Per-entity live loop state.
pub struct LiveState {
    entity: String,
    /// Inclusive lower bound of the next poll: the live mark, which tracks
    /// the highest timestamp written so far. Never before the seed, that
    /// range belongs to backfill.
    cursor: DateTime<Utc>,
    cache: DedupCache,
}

impl LiveState {
    pub fn entity(&self) -> &str {
        &self.entity
    }
}

pub struct LiveSyncProcessor {
    poll_interval: Duration,
    lookback: chrono::Duration,
    fetch_cap: usize,
    pool_wait: Duration,
    router: Arc<AttributeRouter>,
    ledger: Arc<ProgressLedger>,
    sources: Pool<Box<dyn SourceStore>>,
    destinations: Pool<Box<dyn DestinationStore>>,
    status: StatusRegistry,
    stop: StopSignal,
    cache_capacity: usize,
    cache_window: chrono::Duration,
}

impl LiveSyncProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &Config,
        router: Arc<AttributeRouter>,
        ledger: Arc<ProgressLedger>,
        sources: Pool<Box<dyn SourceStore>>,
        destinations: Pool<Box<dyn DestinationStore>>,
        status: StatusRegistry,
        stop: StopSignal,
    ) -> Self {
        let cache_window = chrono::Duration::seconds(
            (config.poll_interval_secs * u64::from(config.dedup_window_ticks)) as i64,
        );
        Self {
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            lookback: chrono::Duration::seconds(config.live_lookback_secs),
            fetch_cap: config.max_rows_per_window,
            pool_wait: Duration::from_secs(config.pool_wait_secs),
            router,
            ledger,
            sources,
            destinations,
            status,
            stop,
            cache_capacity: config.dedup_cache_capacity,
            cache_window,
        }
    }

    /// Seed the live mark if this entity has none yet. The seed is persisted
    /// before any processing so the backfill boundary is durable.
    pub fn seed(&self, entity: &str) -> Result<DateTime<Utc>> {
        let mut source = self.sources.checkout(self.pool_wait)?;
        let now = source.server_time()?;
        drop(source);
        self.ledger.seed_live(entity, now - self.lookback)
    }

    pub fn start_state(&self, entity: &str) -> Result<LiveState> {
        let mark = self.ledger.load(entity)?;
        let Some(cursor) = mark.live else {
            return Err(SyncError::Ledger(format!(
                "entity {entity} has no live mark; seed it before starting live sync"
            )));
        };
        Ok(LiveState {
            entity: entity.to_string(),
            cursor,
            cache: DedupCache::new(self.cache_capacity, self.cache_window),
        })
    }

    /// One live tick: read rows with timestamps at or after the mark, write
    /// what is not already in the destination, then advance the mark to the
    /// highest timestamp written. Returns the number of rows written.
    ///
    /// The lower bound is inclusive, so the boundary row is re-read on every
    /// tick and a late arrival sharing the boundary timestamp is never lost;
    /// the dedup cache absorbs the repeat.
    pub fn poll(&self, state: &mut LiveState) -> Result<u64> {
        let entity = state.entity.clone();

        let mut source = self.sources.checkout(self.pool_wait)?;
        let now = source.server_time()?;
        if state.cursor > now {
            return Ok(0);
        }
        let mut rows = source.fetch_range(&entity, state.cursor, now, self.fetch_cap)?;
        if rows.len() >= self.fetch_cap {
            // The cap may cut inside a run of equal timestamps. A partial
            // wide row at the cut would be cached and then skipped forever,
            // so finish the cut timestamp in full and defer only what lies
            // beyond it to the next tick.
            if let Some(cut) = rows.iter().map(|row| row.timestamp).max() {
                warn!(
                    entity = %entity,
                    cap = self.fetch_cap,
                    boundary = %cut,
                    "live slice hit the fetch cap; completing the boundary timestamp and deferring the rest"
                );
                rows.retain(|row| row.timestamp < cut);
                let boundary = source.fetch_range(
                    &entity,
                    cut,
                    cut + chrono::Duration::microseconds(1),
                    NO_LIMIT,
                )?;
                rows.extend(boundary);
            }
        }
        drop(source);

        let wide = reshape(&self.router, &rows);
        drop(rows);

        let mut written = 0u64;
        let mut confirmed: Vec<DateTime<Utc>> = Vec::new();
        for group in self.router.all_groups() {
            let mut destination = self.destinations.checkout(self.pool_wait)?;
            let mut pending: Vec<WideRecord> = Vec::new();
            for row in wide.iter().filter(|row| row.group == group) {
                if state.cache.contains(row.timestamp)
                    && destination.contains_timestamp(&entity, group, row.timestamp)?
                {
                    counter!(
                        "widesync_dedup_hits_total",
                        1,
                        "entity" => entity.clone()
                    );
                    continue;
                }
                pending.push(row.clone());
            }
            if pending.is_empty() {
                continue;
            }
            let timestamps: Vec<DateTime<Utc>> =
                pending.iter().map(|row| row.timestamp).collect();
            written += destination.bulk_upsert(&entity, group, &pending)?;
            confirmed.extend(timestamps);
        }

        // Only confirmed writes enter the cache and move the mark.
        let advanced = confirmed.iter().max().copied();
        for timestamp in confirmed {
            state.cache.record(timestamp);
        }
        state.cache.prune(now);

        if let Some(max_written) = advanced {
            state.cursor = max_written;
            self.ledger.advance_live(&entity, max_written)?;
        }
        if written > 0 {
            counter!(
                "widesync_live_rows_total",
                written,
                "entity" => entity.clone()
            );
            self.status.rows_written(&entity, written);
        }
        debug!(
            entity = %entity,
            mark = %state.cursor,
            %now,
            written,
            cached = state.cache.len(),
            "live tick"
        );
        Ok(written)
    }

    /// Poll until shutdown. Retryable errors are logged and the tick is
    /// retried at the next interval; anything else ends the loop.
    pub fn run_entity(&self, entity: &str) -> Result<()> {
        self.status.set_phase(entity, EntityPhase::Live);
        let mut state = self.start_state(entity)?;
        info!(entity, mark = %state.cursor, "live sync started");

        while !self.stop.is_set() {
            match self.poll(&mut state) {
                Ok(_) => {}
                Err(err) if err.is_retryable() => {
                    warn!(entity, error = %err, "live tick failed; will retry next interval");
                }
                Err(err) => return Err(err),
            }
            self.stop.sleep(self.poll_interval);
        }

        info!(entity, "live sync stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GroupConfig;
    use crate::reshape::{FieldValue, NarrowRecord, ValueKind};
    use crate::router::GroupId;
    use crate::store::memory::MemoryStore;
    use crate::store::StoreProvider;
    use chrono::TimeZone;
    use std::io::Write as _;
    use tempfile::TempDir;

    fn ts(min: u32, sec: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, min, sec).unwrap()
    }

    fn narrow(attr: &str, at: DateTime<Utc>, value: f64) -> NarrowRecord {
        NarrowRecord {
            entity_id: "E1".into(),
            attribute_id: attr.into(),
            timestamp: at,
            kind: ValueKind::Decimal,
            value: FieldValue::Float(value),
        }
    }

    struct Fixture {
        live: LiveSyncProcessor,
        store: MemoryStore,
        ledger: Arc<ProgressLedger>,
        _dir: TempDir,
    }

    fn fixture() -> Fixture {
        fixture_with(&["attr/a"], |_| {})
    }

    fn fixture_with(attrs: &[&str], configure: impl FnOnce(&mut Config)) -> Fixture {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("g1.txt");
        let mut file = std::fs::File::create(&path).unwrap();
        for attr in attrs {
            writeln!(file, "{attr}").unwrap();
        }
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
        config.live_lookback_secs = 120;
        config.pool_wait_secs = 1;
        configure(&mut config);

        let ledger = Arc::new(ProgressLedger::open(&dir.path().join("progress")).unwrap());
        let store = MemoryStore::new();
        let sources = Pool::build(1, || store.open_source()).unwrap();
        let destinations = Pool::build(1, || store.open_destination()).unwrap();

        let live = LiveSyncProcessor::new(
            &config,
            router,
            Arc::clone(&ledger),
            sources,
            destinations,
            StatusRegistry::new(),
            StopSignal::new(),
        );
        Fixture {
            live,
            store,
            ledger,
            _dir: dir,
        }
    }

    fn ensure_table(store: &MemoryStore) {
        let mut destination = store.open_destination().unwrap();
        destination
            .ensure_table("E1", GroupId(1), &["attr_a".into()])
            .unwrap();
    }

    #[test]
    fn seed_persists_lookback_behind_server_time() {
        let fx = fixture();
        fx.store.set_server_time(ts(10, 0));

        let seed = fx.live.seed("E1").unwrap();
        assert_eq!(seed, ts(8, 0));
        assert_eq!(fx.ledger.load("E1").unwrap().live, Some(ts(8, 0)));

        // Re-seeding keeps the original value.
        fx.store.set_server_time(ts(30, 0));
        assert_eq!(fx.live.seed("E1").unwrap(), ts(8, 0));
    }

    #[test]
    fn overlapping_polls_write_each_row_once() {
        let fx = fixture();
        ensure_table(&fx.store);
        fx.store.set_server_time(ts(10, 0));
        fx.live.seed("E1").unwrap();
        fx.store.push_rows([narrow("attr/a", ts(9, 0), 1.0)]);

        let mut state = fx.live.start_state("E1").unwrap();
        assert_eq!(fx.live.poll(&mut state).unwrap(), 1);
        let calls_after_first = fx.store.upsert_calls();

        // The mark sits on the written row, so the next tick re-reads it;
        // the dedup cache keeps it from being rewritten.
        fx.store.set_server_time(ts(10, 30));
        assert_eq!(fx.live.poll(&mut state).unwrap(), 0);
        assert_eq!(fx.store.upsert_calls(), calls_after_first);
        assert_eq!(fx.store.row_count("E1", GroupId(1)), 1);
    }

    #[test]
    fn poll_never_reads_before_the_seed() {
        let fx = fixture();
        ensure_table(&fx.store);
        fx.store.set_server_time(ts(10, 0));
        fx.live.seed("E1").unwrap();
        // Older than the seed; belongs to backfill.
        fx.store.push_rows([narrow("attr/a", ts(5, 0), 1.0)]);

        let mut state = fx.live.start_state("E1").unwrap();
        assert_eq!(fx.live.poll(&mut state).unwrap(), 0);
        assert_eq!(fx.store.row_count("E1", GroupId(1)), 0);
    }

    #[test]
    fn first_tick_covers_everything_since_the_seed() {
        let fx = fixture();
        ensure_table(&fx.store);
        fx.store.set_server_time(ts(10, 0));
        fx.live.seed("E1").unwrap();

        // Several poll intervals pass before the first tick runs; nothing
        // between the seed and now may be skipped.
        fx.store.push_rows([narrow("attr/a", ts(8, 30), 1.0), narrow("attr/a", ts(12, 0), 2.0)]);
        fx.store.set_server_time(ts(15, 0));

        let mut state = fx.live.start_state("E1").unwrap();
        assert_eq!(fx.live.poll(&mut state).unwrap(), 2);
        assert_eq!(fx.ledger.load("E1").unwrap().live, Some(ts(12, 0)));
    }

    #[test]
    fn restart_rewrites_at_most_the_boundary_row() {
        let fx = fixture();
        ensure_table(&fx.store);
        fx.store.set_server_time(ts(10, 0));
        fx.live.seed("E1").unwrap();
        fx.store.push_rows([narrow("attr/a", ts(9, 0), 1.0)]);

        let mut state = fx.live.start_state("E1").unwrap();
        assert_eq!(fx.live.poll(&mut state).unwrap(), 1);
        drop(state);

        // New process, empty cache: the boundary row is re-upserted, which
        // changes nothing, and new rows still flow.
        fx.store.push_rows([narrow("attr/a", ts(10, 30), 2.0)]);
        fx.store.set_server_time(ts(11, 0));
        let mut fresh = fx.live.start_state("E1").unwrap();
        assert_eq!(fx.live.poll(&mut fresh).unwrap(), 2);
        assert_eq!(fx.store.row_count("E1", GroupId(1)), 2);
        assert_eq!(fx.ledger.load("E1").unwrap().live, Some(ts(10, 30)));
    }

    #[test]
    fn mark_tracks_the_highest_timestamp_written() {
        let fx = fixture();
        ensure_table(&fx.store);
        fx.store.set_server_time(ts(9, 0));
        fx.live.seed("E1").unwrap();
        fx.store.push_rows([narrow("attr/a", ts(8, 0), 1.0)]);

        fx.store.set_server_time(ts(10, 0));
        let mut state = fx.live.start_state("E1").unwrap();
        fx.live.poll(&mut state).unwrap();
        assert_eq!(fx.ledger.load("E1").unwrap().live, Some(ts(8, 0)));

        // A quiet tick leaves the mark where it is.
        fx.store.set_server_time(ts(11, 0));
        assert_eq!(fx.live.poll(&mut state).unwrap(), 0);
        assert_eq!(fx.ledger.load("E1").unwrap().live, Some(ts(8, 0)));
    }

    #[test]
    fn capped_tick_completes_the_boundary_timestamp() {
        let fx = fixture_with(&["attr/a", "attr/b", "attr/c"], |config| {
            config.max_rows_per_window = 2;
        });
        ensure_table(&fx.store);
        fx.store.set_server_time(ts(10, 0));
        fx.live.seed("E1").unwrap();
        // Three attributes share one timestamp; the fetch cap cuts inside
        // the run. The whole timestamp must still land in one piece or the
        // dedup skip would freeze a partial wide row.
        fx.store.push_rows([
            narrow("attr/a", ts(9, 0), 1.0),
            narrow("attr/b", ts(9, 0), 2.0),
            narrow("attr/c", ts(9, 0), 3.0),
        ]);

        let mut state = fx.live.start_state("E1").unwrap();
        assert_eq!(fx.live.poll(&mut state).unwrap(), 1);
        assert_eq!(
            fx.store.cell("E1", GroupId(1), ts(9, 0), "attr_c"),
            Some(FieldValue::Float(3.0))
        );
        assert_eq!(fx.ledger.load("E1").unwrap().live, Some(ts(9, 0)));

        // Later ticks re-read the capped slice but rewrite nothing.
        let calls = fx.store.upsert_calls();
        fx.store.set_server_time(ts(10, 30));
        assert_eq!(fx.live.poll(&mut state).unwrap(), 0);
        assert_eq!(fx.store.upsert_calls(), calls);
    }

    #[test]
    fn cache_prunes_outside_trailing_window() {
        let mut cache = DedupCache::new(16, chrono::Duration::minutes(4));
        cache.record(ts(0, 0));
        cache.record(ts(9, 0));
        cache.prune(ts(10, 0));

        assert!(!cache.contains(ts(0, 0)));
        assert!(cache.contains(ts(9, 0)));
        assert_eq!(cache.len(), 1);
    }
}
