use chrono::{DateTime, Utc};

use crate::{
    error::Result,
    reshape::{NarrowRecord, WideRecord},
    router::GroupId,
};

pub mod memory;
pub mod postgres;

/// Effectively unbounded `fetch_range` limit, used when a caller has ruled
/// out every cheaper option and must take a range whole. Fits in the i64 the
/// SQL `LIMIT` clause is bound to.
pub const NO_LIMIT: usize = i64::MAX as usize;

/// Read side of the pipeline: the narrow time-series table.
///
/// All range arguments are half-open `[start, end)`; implementations return
/// rows ordered by timestamp.
pub trait SourceStore: Send {
    /// Clock of the machine hosting the source data. All window arithmetic
    /// uses this clock, never the local one, so a skewed migration host
    /// cannot open windows into the source's future.
    fn server_time(&mut self) -> Result<DateTime<Utc>>;

    /// Earliest timestamp recorded for an entity strictly before `before`,
    /// or `None` when the entity has no history in that range.
    fn earliest_timestamp(
        &mut self,
        entity: &str,
        before: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>>;

    /// Up to `limit` rows of one entity in `[start, end)`. Callers pass a
    /// limit one above their acceptable row count to detect over-full
    /// windows without transferring the excess.
    fn fetch_range(
        &mut self,
        entity: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<NarrowRecord>>;
}

/// Write side: one wide table per (entity, destination group).
pub trait DestinationStore: Send {
    /// Create the entity's wide table for `group` if missing, with the
    /// declared columns. Idempotent.
    fn ensure_table(&mut self, entity: &str, group: GroupId, columns: &[String]) -> Result<()>;

    /// Upsert reshaped rows keyed by timestamp. Re-delivery of the same rows
    /// converges to the same table state. Returns the number of rows written.
    fn bulk_upsert(&mut self, entity: &str, group: GroupId, rows: &[WideRecord]) -> Result<u64>;

    /// Whether a row already exists at `timestamp`, used to re-verify dedup
    /// cache hits against the store of record.
    fn contains_timestamp(
        &mut self,
        entity: &str,
        group: GroupId,
        timestamp: DateTime<Utc>,
    ) -> Result<bool>;
}

/// Factory for pooled connections. One provider serves the whole process;
/// each call opens an independent session safe to hand to a worker lane.
pub trait StoreProvider: Send + Sync {
    fn open_source(&self) -> Result<Box<dyn SourceStore>>;
    fn open_destination(&self) -> Result<Box<dyn DestinationStore>>;
}

/// Destination table name for one (entity, group) pair.
pub fn table_name(entity: &str, group_name: &str) -> String {
    let entity = entity.to_ascii_lowercase();
    format!("tbl_{entity}_{group_name}")
}
