use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::router::{column_name, AttributeRouter, GroupId};

/// The source `value_format` discriminator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueKind {
    Boolean,
    String,
    Integer,
    Decimal,
    Other(String),
}

impl ValueKind {
    pub fn parse(tag: &str) -> Self {
        match tag {
            "Boolean" => Self::Boolean,
            "String" => Self::String,
            "Integer" => Self::Integer,
            "Decimal" => Self::Decimal,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Boolean => "Boolean",
            Self::String => "String",
            Self::Integer => "Integer",
            Self::Decimal => "Decimal",
            Self::Other(tag) => tag,
        }
    }
}

/// A typed cell value in a wide row. Absent attributes are explicit `Null`,
/// never omitted from the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Bool(bool),
    Text(String),
    Int(i64),
    Float(f64),
    Null,
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

/// One row of the source narrow table. Immutable; identity is
/// (entity_id, attribute_id, timestamp).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrowRecord {
    pub entity_id: String,
    pub attribute_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: ValueKind,
    pub value: FieldValue,
}

/// One reshaped destination row: all resolved attributes of a single
/// (entity, timestamp, group), keyed by destination column name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WideRecord {
    pub timestamp: DateTime<Utc>,
    pub group: GroupId,
    pub cells: BTreeMap<String, FieldValue>,
}

impl WideRecord {
    /// True when at least one cell carries a non-null value.
    pub fn has_data(&self) -> bool {
        self.cells.values().any(|value| !value.is_null())
    }
}

/// Resolve the typed value declared by `kind`. A tag the pipeline does not
/// recognize, or a value that does not match its declared kind, degrades to
/// `Null` with a warning; it never aborts the batch.
pub fn resolve_value(record: &NarrowRecord) -> FieldValue {
    let matches = match (&record.kind, &record.value) {
        (ValueKind::Boolean, FieldValue::Bool(_))
        | (ValueKind::String, FieldValue::Text(_))
        | (ValueKind::Integer, FieldValue::Int(_))
        | (ValueKind::Decimal, FieldValue::Float(_)) => true,
        (_, FieldValue::Null) => true,
        _ => false,
    };

    if let ValueKind::Other(tag) = &record.kind {
        warn!(
            attribute = %record.attribute_id,
            kind = %tag,
            "unrecognized value kind; storing null"
        );
        return FieldValue::Null;
    }

    if !matches {
        warn!(
            attribute = %record.attribute_id,
            kind = record.kind.as_str(),
            "value does not match its declared kind; storing null"
        );
        return FieldValue::Null;
    }

    record.value.clone()
}

/// Group narrow rows by timestamp, route every attribute to its destination
/// group, and build one [`WideRecord`] per (timestamp, group) that resolved
/// at least one attribute. Pure: no I/O, caller supplies rows of a single
/// entity.
///
/// Unclassified attributes are dropped (and counted on the router); the rest
/// of the timestamp group is still processed.
pub fn reshape(router: &AttributeRouter, rows: &[NarrowRecord]) -> Vec<WideRecord> {
    let mut buckets: BTreeMap<(DateTime<Utc>, GroupId), BTreeMap<String, FieldValue>> =
        BTreeMap::new();

    for row in rows {
        let Some(group) = router.resolve(&row.attribute_id) else {
            router.record_miss(&row.attribute_id);
            continue;
        };
        let value = resolve_value(row);
        buckets
            .entry((row.timestamp, group))
            .or_default()
            .insert(column_name(&row.attribute_id), value);
    }

    buckets
        .into_iter()
        .map(|((timestamp, group), mut cells)| {
            // Pad the declared schema so absent attributes are explicit
            // nulls rather than missing columns.
            if let Some(attributes) = router.attributes_of(group) {
                for attribute in attributes {
                    cells.entry(column_name(attribute)).or_insert(FieldValue::Null);
                }
            }
            WideRecord {
                timestamp,
                group,
                cells,
            }
        })
        .filter(WideRecord::has_data)
        .collect()
}
