use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::{
    error::{Result, SyncError},
    reshape::{FieldValue, NarrowRecord, WideRecord},
    router::GroupId,
};

use super::{DestinationStore, SourceStore, StoreProvider};

type TableKey = (String, GroupId);
type WideTable = BTreeMap<DateTime<Utc>, BTreeMap<String, FieldValue>>;

#[derive(Default)]
struct MemoryState {
    source_rows: Vec<NarrowRecord>,
    server_time: Option<DateTime<Utc>>,
    tables: HashMap<TableKey, WideTable>,
    created: HashSet<TableKey>,
    upsert_calls: u64,
    fail_fetches: u32,
    fail_upserts: u32,
}

/// In-process store backing both trait seams, shared by every connection it
/// opens. Used by the integration tests and by dry runs; supports fault
/// injection so retry and failure-list paths can be exercised without a
/// database.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_rows(&self, rows: impl IntoIterator<Item = NarrowRecord>) {
        let mut state = self.state.lock();
        state.source_rows.extend(rows);
        state.source_rows.sort_by_key(|row| row.timestamp);
    }

    /// Pin the simulated source clock. Unset, `server_time` follows the real
    /// clock.
    pub fn set_server_time(&self, at: DateTime<Utc>) {
        self.state.lock().server_time = Some(at);
    }

    /// Make the next `count` fetches fail with a retryable storage error.
    pub fn fail_next_fetches(&self, count: u32) {
        self.state.lock().fail_fetches = count;
    }

    /// Make the next `count` upserts fail with a retryable storage error.
    pub fn fail_next_upserts(&self, count: u32) {
        self.state.lock().fail_upserts = count;
    }

    pub fn upsert_calls(&self) -> u64 {
        self.state.lock().upsert_calls
    }

    pub fn row_count(&self, entity: &str, group: GroupId) -> usize {
        self.state
            .lock()
            .tables
            .get(&(entity.to_string(), group))
            .map(|table| table.len())
            .unwrap_or(0)
    }

    pub fn cell(
        &self,
        entity: &str,
        group: GroupId,
        timestamp: DateTime<Utc>,
        column: &str,
    ) -> Option<FieldValue> {
        self.state
            .lock()
            .tables
            .get(&(entity.to_string(), group))
            .and_then(|table| table.get(&timestamp))
            .and_then(|row| row.get(column))
            .cloned()
    }
}

impl StoreProvider for MemoryStore {
    fn open_source(&self) -> Result<Box<dyn SourceStore>> {
        Ok(Box::new(MemorySource {
            state: Arc::clone(&self.state),
        }))
    }

    fn open_destination(&self) -> Result<Box<dyn DestinationStore>> {
        Ok(Box::new(MemoryDestination {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MemorySource {
    state: Arc<Mutex<MemoryState>>,
}

impl SourceStore for MemorySource {
    fn server_time(&mut self) -> Result<DateTime<Utc>> {
        Ok(self.state.lock().server_time.unwrap_or_else(Utc::now))
    }

    fn earliest_timestamp(
        &mut self,
        entity: &str,
        before: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let state = self.state.lock();
        Ok(state
            .source_rows
            .iter()
            .filter(|row| row.entity_id == entity && row.timestamp < before)
            .map(|row| row.timestamp)
            .min())
    }

    fn fetch_range(
        &mut self,
        entity: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<NarrowRecord>> {
        let mut state = self.state.lock();
        if state.fail_fetches > 0 {
            state.fail_fetches -= 1;
            return Err(SyncError::Storage("injected fetch failure".into()));
        }
        Ok(state
            .source_rows
            .iter()
            .filter(|row| {
                row.entity_id == entity && row.timestamp >= start && row.timestamp < end
            })
            .take(limit)
            .cloned()
            .collect())
    }
}

struct MemoryDestination {
    state: Arc<Mutex<MemoryState>>,
}

impl DestinationStore for MemoryDestination {
    fn ensure_table(&mut self, entity: &str, group: GroupId, _columns: &[String]) -> Result<()> {
        self.state
            .lock()
            .created
            .insert((entity.to_string(), group));
        Ok(())
    }

    fn bulk_upsert(&mut self, entity: &str, group: GroupId, rows: &[WideRecord]) -> Result<u64> {
        let mut state = self.state.lock();
        if state.fail_upserts > 0 {
            state.fail_upserts -= 1;
            return Err(SyncError::Storage("injected upsert failure".into()));
        }
        let key = (entity.to_string(), group);
        if !state.created.contains(&key) {
            return Err(SyncError::Storage(format!(
                "table for entity {entity} group {group} does not exist"
            )));
        }
        state.upsert_calls += 1;
        let table = state.tables.entry(key).or_default();
        for row in rows {
            let cells = table.entry(row.timestamp).or_default();
            for (column, value) in &row.cells {
                cells.insert(column.clone(), value.clone());
            }
        }
        Ok(rows.len() as u64)
    }

    fn contains_timestamp(
        &mut self,
        entity: &str,
        group: GroupId,
        timestamp: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .tables
            .get(&(entity.to_string(), group))
            .map(|table| table.contains_key(&timestamp))
            .unwrap_or(false))
    }
}
