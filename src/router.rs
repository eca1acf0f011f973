use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt, fs,
    io::{BufRead, BufReader},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    config::GroupConfig,
    error::{Result, SyncError},
};

/// Identifier of a destination group, `1..N`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct GroupId(pub u16);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct GroupEntry {
    name: String,
    attributes: BTreeSet<String>,
}

/// Static attribute -> destination-group mapping, loaded once at startup and
/// immutable for the process lifetime. Unclassified attributes are counted
/// and logged, never fatal.
pub struct AttributeRouter {
    by_attribute: HashMap<String, GroupId>,
    groups: BTreeMap<GroupId, GroupEntry>,
    misses: Mutex<HashMap<String, u64>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouterStats {
    pub total_attributes: usize,
    pub by_group: BTreeMap<u16, usize>,
    pub unclassified_seen: usize,
}

impl AttributeRouter {
    /// Load the classification from the per-group attribute list files.
    /// An attribute listed in more than one group keeps its first assignment;
    /// the duplicate is logged so the definition can be fixed.
    pub fn load(specs: &[GroupConfig]) -> Result<Self> {
        if specs.is_empty() {
            return Err(SyncError::Classification(
                "no destination groups configured".into(),
            ));
        }

        let mut by_attribute: HashMap<String, GroupId> = HashMap::new();
        let mut groups: BTreeMap<GroupId, GroupEntry> = BTreeMap::new();
        let mut duplicates = 0usize;

        for spec in specs {
            let group = GroupId(spec.id);
            let attributes = read_attribute_file(spec)?;
            debug!(
                group = %group,
                file = %spec.attributes_file.display(),
                count = attributes.len(),
                "loaded attribute list"
            );

            let mut kept = BTreeSet::new();
            for attribute in attributes {
                match by_attribute.get(&attribute) {
                    Some(existing) => {
                        duplicates += 1;
                        warn!(
                            attribute = %attribute,
                            first = %existing,
                            duplicate = %group,
                            "attribute classified twice; keeping first assignment"
                        );
                    }
                    None => {
                        by_attribute.insert(attribute.clone(), group);
                        kept.insert(attribute);
                    }
                }
            }

            groups.insert(
                group,
                GroupEntry {
                    name: spec.name.clone(),
                    attributes: kept,
                },
            );
        }

        let router = Self {
            by_attribute,
            groups,
            misses: Mutex::new(HashMap::new()),
        };

        let stats = router.stats();
        info!(
            total = stats.total_attributes,
            groups = router.groups.len(),
            duplicates,
            "attribute router initialized"
        );
        for (group, count) in &stats.by_group {
            info!(group, count, "group attribute count");
        }

        Ok(router)
    }

    /// O(1) lookup. `None` means the attribute is not classified; callers
    /// should report it through [`AttributeRouter::record_miss`] and drop it.
    pub fn resolve(&self, attribute_id: &str) -> Option<GroupId> {
        self.by_attribute.get(attribute_id).copied()
    }

    /// Count an unclassified attribute. Warns the first time each attribute
    /// is seen so the log is not flooded at high row rates.
    pub fn record_miss(&self, attribute_id: &str) {
        let mut misses = self.misses.lock();
        let count = misses.entry(attribute_id.to_string()).or_insert(0);
        *count += 1;
        if *count == 1 {
            warn!(attribute = attribute_id, "unclassified attribute dropped");
        }
    }

    pub fn miss_count(&self) -> u64 {
        self.misses.lock().values().sum()
    }

    pub fn all_groups(&self) -> Vec<GroupId> {
        self.groups.keys().copied().collect()
    }

    pub fn group_name(&self, group: GroupId) -> Option<&str> {
        self.groups.get(&group).map(|entry| entry.name.as_str())
    }

    pub fn attributes_of(&self, group: GroupId) -> Option<&BTreeSet<String>> {
        self.groups.get(&group).map(|entry| &entry.attributes)
    }

    /// Sorted column names for a group's declared schema, used for table
    /// creation and column-existence checks.
    pub fn columns_of(&self, group: GroupId) -> Vec<String> {
        self.attributes_of(group)
            .map(|attributes| attributes.iter().map(|attr| column_name(attr)).collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            total_attributes: self.by_attribute.len(),
            by_group: self
                .groups
                .iter()
                .map(|(group, entry)| (group.0, entry.attributes.len()))
                .collect(),
            unclassified_seen: self.misses.lock().len(),
        }
    }
}

/// Derive a destination column name from an attribute identifier: path
/// separators become underscores, runs are squeezed, edges trimmed.
/// `hs4sd_v1/ab/fuel/oil///use` -> `hs4sd_v1_ab_fuel_oil_use`.
pub fn column_name(attribute_id: &str) -> String {
    let mut out = String::with_capacity(attribute_id.len());
    let mut last_was_sep = true;
    for ch in attribute_id.chars() {
        if ch == '/' || ch == '_' {
            if !last_was_sep {
                out.push('_');
                last_was_sep = true;
            }
        } else {
            out.push(ch);
            last_was_sep = false;
        }
    }
    if out.ends_with('_') {
        out.pop();
    }
    out
}

fn read_attribute_file(spec: &GroupConfig) -> Result<BTreeSet<String>> {
    let file = fs::File::open(&spec.attributes_file).map_err(|err| {
        SyncError::Classification(format!(
            "cannot open attribute list {} for group {}: {}",
            spec.attributes_file.display(),
            spec.id,
            err
        ))
    })?;

    let mut attributes = BTreeSet::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        attributes.insert(trimmed.to_string());
    }
    Ok(attributes)
}
