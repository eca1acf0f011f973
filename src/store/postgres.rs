use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use postgres::{types::ToSql, Client, NoTls};
use tracing::{debug, info, warn};

use crate::{
    config::{DestinationConfig, SourceConfig},
    error::{Result, SyncError},
    reshape::{FieldValue, NarrowRecord, ValueKind, WideRecord},
    router::{AttributeRouter, GroupId},
};

use super::{table_name, DestinationStore, SourceStore, StoreProvider};

/// Opens independent postgres sessions against the narrow source table and
/// the wide destination schema.
pub struct PostgresProvider {
    source: SourceConfig,
    destination: DestinationConfig,
    router: Arc<AttributeRouter>,
}

impl PostgresProvider {
    pub fn new(
        source: SourceConfig,
        destination: DestinationConfig,
        router: Arc<AttributeRouter>,
    ) -> Self {
        Self {
            source,
            destination,
            router,
        }
    }
}

impl StoreProvider for PostgresProvider {
    fn open_source(&self) -> Result<Box<dyn SourceStore>> {
        let client = connect(&self.source.connection)?;
        Ok(Box::new(PostgresSource {
            client,
            schema: self.source.schema.clone(),
            table: self.source.table.clone(),
        }))
    }

    fn open_destination(&self) -> Result<Box<dyn DestinationStore>> {
        let client = connect(&self.destination.connection)?;
        Ok(Box::new(PostgresDestination {
            client,
            schema: self.destination.schema.clone(),
            overrides: self.destination.column_types.clone(),
            router: Arc::clone(&self.router),
            columns: HashMap::new(),
        }))
    }
}

fn connect(connection: &str) -> Result<Client> {
    Client::connect(connection, NoTls)
        .map_err(|err| SyncError::Storage(format!("postgres connect failed: {err}")))
}

struct PostgresSource {
    client: Client,
    schema: String,
    table: String,
}

impl PostgresSource {
    fn relation(&self) -> String {
        format!("\"{}\".\"{}\"", self.schema, self.table)
    }
}

impl SourceStore for PostgresSource {
    fn server_time(&mut self) -> Result<DateTime<Utc>> {
        let row = self
            .client
            .query_one("SELECT now()", &[])
            .map_err(|err| SyncError::Storage(err.to_string()))?;
        Ok(row.get(0))
    }

    fn earliest_timestamp(
        &mut self,
        entity: &str,
        before: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        // LIMIT 1 probe along the timestamp index instead of an aggregate.
        let sql = format!(
            "SELECT created_time FROM {} \
             WHERE ship_id = $1 AND created_time < $2 \
             ORDER BY created_time \
             LIMIT 1",
            self.relation()
        );
        let row = self
            .client
            .query_opt(&sql, &[&entity, &before])
            .map_err(|err| SyncError::Storage(err.to_string()))?;
        Ok(row.map(|row| row.get(0)))
    }

    fn fetch_range(
        &mut self,
        entity: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<NarrowRecord>> {
        let sql = format!(
            "SELECT data_channel_id, created_time, value_format, value \
             FROM {} \
             WHERE ship_id = $1 AND created_time >= $2 AND created_time < $3 \
             ORDER BY created_time \
             LIMIT $4",
            self.relation()
        );
        let limit = limit as i64;
        let rows = self
            .client
            .query(&sql, &[&entity, &start, &end, &limit])
            .map_err(|err| SyncError::Storage(err.to_string()))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let attribute_id: String = row.get(0);
            let timestamp: DateTime<Utc> = row.get(1);
            let format: String = row.get(2);
            let raw: Option<String> = row.get(3);
            let kind = ValueKind::parse(&format);
            let value = parse_raw_value(&kind, raw.as_deref());
            records.push(NarrowRecord {
                entity_id: entity.to_string(),
                attribute_id,
                timestamp,
                kind,
                value,
            });
        }
        Ok(records)
    }
}

/// Interpret the narrow table's text payload under its declared format.
/// Unparseable payloads become null rather than failing the fetch.
fn parse_raw_value(kind: &ValueKind, raw: Option<&str>) -> FieldValue {
    let Some(raw) = raw else {
        return FieldValue::Null;
    };
    match kind {
        ValueKind::Boolean => match raw {
            "true" | "TRUE" | "1" => FieldValue::Bool(true),
            "false" | "FALSE" | "0" => FieldValue::Bool(false),
            _ => FieldValue::Null,
        },
        ValueKind::String => FieldValue::Text(raw.to_string()),
        ValueKind::Integer => raw
            .parse::<i64>()
            .map(FieldValue::Int)
            .unwrap_or(FieldValue::Null),
        ValueKind::Decimal => raw
            .parse::<f64>()
            .map(FieldValue::Float)
            .unwrap_or(FieldValue::Null),
        ValueKind::Other(_) => FieldValue::Null,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Bool,
    Text,
    Int,
    Float,
}

impl ColumnKind {
    fn sql_type(self) -> &'static str {
        match self {
            Self::Bool => "BOOLEAN",
            Self::Text => "TEXT",
            Self::Int => "BIGINT",
            Self::Float => "DOUBLE PRECISION",
        }
    }

    fn of_value(value: &FieldValue) -> Option<Self> {
        match value {
            FieldValue::Bool(_) => Some(Self::Bool),
            FieldValue::Text(_) => Some(Self::Text),
            FieldValue::Int(_) => Some(Self::Int),
            FieldValue::Float(_) => Some(Self::Float),
            FieldValue::Null => None,
        }
    }

    fn of_sql_type(sql: &str) -> Self {
        let upper = sql.to_ascii_uppercase();
        if upper.contains("BOOL") {
            Self::Bool
        } else if upper.contains("INT") {
            Self::Int
        } else if upper.contains("DOUBLE") || upper.contains("REAL") || upper.contains("NUMERIC") {
            Self::Float
        } else {
            Self::Text
        }
    }
}

struct PostgresDestination {
    client: Client,
    schema: String,
    overrides: std::collections::BTreeMap<String, String>,
    router: Arc<AttributeRouter>,
    /// Columns known to exist per destination table, with their kinds.
    columns: HashMap<(String, GroupId), HashMap<String, ColumnKind>>,
}

impl PostgresDestination {
    fn relation(&self, entity: &str, group: GroupId) -> String {
        let group_name = self
            .router
            .group_name(group)
            .map(str::to_string)
            .unwrap_or_else(|| format!("group{group}"));
        format!("\"{}\".\"{}\"", self.schema, table_name(entity, &group_name))
    }

    fn index_name(&self, entity: &str, group: GroupId) -> String {
        let group_name = self
            .router
            .group_name(group)
            .map(str::to_string)
            .unwrap_or_else(|| format!("group{group}"));
        format!("idx_{}_created_time", table_name(entity, &group_name))
    }

    /// Create any column in `wanted` the table does not have yet, typing it
    /// from the first non-null value observed (config overrides win).
    fn ensure_columns(
        &mut self,
        entity: &str,
        group: GroupId,
        wanted: &HashMap<String, ColumnKind>,
    ) -> Result<()> {
        let relation = self.relation(entity, group);
        let known = self
            .columns
            .entry((entity.to_string(), group))
            .or_default();

        for (column, inferred) in wanted {
            if known.contains_key(column) {
                continue;
            }
            let kind = self
                .overrides
                .get(column)
                .map(|sql| ColumnKind::of_sql_type(sql))
                .unwrap_or(*inferred);
            let sql_type = self
                .overrides
                .get(column)
                .cloned()
                .unwrap_or_else(|| kind.sql_type().to_string());
            let sql = format!(
                "ALTER TABLE {relation} ADD COLUMN IF NOT EXISTS \"{column}\" {sql_type}"
            );
            self.client
                .execute(&sql, &[])
                .map_err(|err| SyncError::Storage(err.to_string()))?;
            debug!(column, %sql_type, table = %relation, "column added");
            known.insert(column.clone(), kind);
        }
        Ok(())
    }
}

impl DestinationStore for PostgresDestination {
    fn ensure_table(&mut self, entity: &str, group: GroupId, _columns: &[String]) -> Result<()> {
        let relation = self.relation(entity, group);
        let create = format!(
            "CREATE TABLE IF NOT EXISTS {relation} (created_time TIMESTAMPTZ PRIMARY KEY)"
        );
        self.client
            .execute(&create, &[])
            .map_err(|err| SyncError::Storage(err.to_string()))?;

        let index = format!(
            "CREATE INDEX IF NOT EXISTS \"{}\" ON {relation} USING BRIN (created_time)",
            self.index_name(entity, group)
        );
        self.client
            .execute(&index, &[])
            .map_err(|err| SyncError::Storage(err.to_string()))?;

        info!(table = %relation, "destination table ready");
        Ok(())
    }

    fn bulk_upsert(&mut self, entity: &str, group: GroupId, rows: &[WideRecord]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        // Columns are created on first non-null sighting; a column that has
        // only ever been null does not exist yet and is skipped.
        let mut wanted: HashMap<String, ColumnKind> = HashMap::new();
        for row in rows {
            for (column, value) in &row.cells {
                if let Some(kind) = ColumnKind::of_value(value) {
                    wanted.entry(column.clone()).or_insert(kind);
                }
            }
        }
        self.ensure_columns(entity, group, &wanted)?;

        let known = self
            .columns
            .get(&(entity.to_string(), group))
            .cloned()
            .unwrap_or_default();
        let columns: BTreeSet<String> = rows
            .iter()
            .flat_map(|row| row.cells.keys())
            .filter(|column| known.contains_key(*column))
            .cloned()
            .collect();
        if columns.is_empty() {
            return Ok(0);
        }

        let relation = self.relation(entity, group);
        let column_list: Vec<String> = columns.iter().map(|c| format!("\"{c}\"")).collect();
        let placeholders: Vec<String> = (0..=columns.len()).map(|i| format!("${}", i + 1)).collect();
        let assignments: Vec<String> = columns
            .iter()
            .map(|c| format!("\"{c}\" = EXCLUDED.\"{c}\""))
            .collect();
        let sql = format!(
            "INSERT INTO {relation} (created_time, {}) VALUES ({}) \
             ON CONFLICT (created_time) DO UPDATE SET {}",
            column_list.join(", "),
            placeholders.join(", "),
            assignments.join(", ")
        );

        let mut txn = self
            .client
            .transaction()
            .map_err(|err| SyncError::Storage(err.to_string()))?;
        let mut written = 0u64;
        for row in rows {
            let mut params: Vec<Box<dyn ToSql + Sync>> = Vec::with_capacity(columns.len() + 1);
            params.push(Box::new(row.timestamp));
            for column in &columns {
                let value = row.cells.get(column).unwrap_or(&FieldValue::Null);
                params.push(sql_param(value, known[column]));
            }
            let refs: Vec<&(dyn ToSql + Sync)> = params.iter().map(|p| p.as_ref()).collect();
            txn.execute(&sql, &refs)
                .map_err(|err| SyncError::Storage(err.to_string()))?;
            written += 1;
        }
        txn.commit()
            .map_err(|err| SyncError::Storage(err.to_string()))?;

        debug!(table = %relation, rows = written, "batch upserted");
        Ok(written)
    }

    fn contains_timestamp(
        &mut self,
        entity: &str,
        group: GroupId,
        timestamp: DateTime<Utc>,
    ) -> Result<bool> {
        let relation = self.relation(entity, group);
        let sql = format!("SELECT 1 FROM {relation} WHERE created_time = $1 LIMIT 1");
        match self.client.query_opt(&sql, &[&timestamp]) {
            Ok(row) => Ok(row.is_some()),
            Err(err) => {
                // Table not created yet means the row cannot exist.
                warn!(table = %relation, error = %err, "existence probe failed");
                Ok(false)
            }
        }
    }
}

fn sql_param(value: &FieldValue, kind: ColumnKind) -> Box<dyn ToSql + Sync> {
    match value {
        FieldValue::Bool(b) => Box::new(*b),
        FieldValue::Text(s) => Box::new(s.clone()),
        FieldValue::Int(i) => Box::new(*i),
        FieldValue::Float(f) => Box::new(*f),
        FieldValue::Null => match kind {
            ColumnKind::Bool => Box::new(Option::<bool>::None),
            ColumnKind::Text => Box::new(Option::<String>::None),
            ColumnKind::Int => Box::new(Option::<i64>::None),
            ColumnKind::Float => Box::new(Option::<f64>::None),
        },
    }
}
