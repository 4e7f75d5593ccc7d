use crate::{Luid, Marker};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Stable identity of one (source, sink) provider pair; the partition key
/// of the mapping store and the unit of pass mutual exclusion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairKey {
    pub source_uid: String,
    pub sink_uid: String,
}

impl PairKey {
    pub fn new(source_uid: impl Into<String>, sink_uid: impl Into<String>) -> Self {
        Self {
            source_uid: source_uid.into(),
            sink_uid: sink_uid.into(),
        }
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source_uid, self.sink_uid)
    }
}

/// Persisted correspondence between one source item and one sink item,
/// with the last-known marker on each side. Created on first successful
/// transfer, updated on later syncs, removed on confirmed deletion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mapping {
    pub source_luid: Luid,
    pub sink_luid: Luid,
    pub source_marker: Marker,
    pub sink_marker: Marker,
}

impl Mapping {
    pub fn new(
        source_luid: impl Into<Luid>,
        sink_luid: impl Into<Luid>,
        source_marker: Marker,
        sink_marker: Marker,
    ) -> Self {
        Self {
            source_luid: source_luid.into(),
            sink_luid: sink_luid.into(),
            source_marker,
            sink_marker,
        }
    }
}

/// In-memory mapping partition for one pair.
///
/// Uniqueness holds in both directions: at most one mapping per source luid
/// and at most one per sink luid. `put` evicts whatever entry shares either
/// luid with the incoming mapping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappingTable {
    by_source: BTreeMap<Luid, Mapping>,
    by_sink: BTreeMap<Luid, Luid>,
}

impl MappingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows(rows: Vec<Mapping>) -> Self {
        let mut table = Self::new();
        for row in rows {
            table.put(row);
        }
        table
    }

    pub fn lookup_by_source(&self, luid: &str) -> Option<&Mapping> {
        self.by_source.get(luid)
    }

    pub fn lookup_by_sink(&self, luid: &str) -> Option<&Mapping> {
        let source = self.by_sink.get(luid)?;
        self.by_source.get(source)
    }

    pub fn put(&mut self, mapping: Mapping) {
        self.remove_by_source(&mapping.source_luid);
        if let Some(source) = self.by_sink.get(&mapping.sink_luid).cloned() {
            self.remove_by_source(&source);
        }
        self.by_sink
            .insert(mapping.sink_luid.clone(), mapping.source_luid.clone());
        self.by_source.insert(mapping.source_luid.clone(), mapping);
    }

    pub fn remove_by_source(&mut self, luid: &str) -> Option<Mapping> {
        let mapping = self.by_source.remove(luid)?;
        self.by_sink.remove(&mapping.sink_luid);
        Some(mapping)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mapping> {
        self.by_source.values()
    }

    pub fn len(&self) -> usize {
        self.by_source.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_source.is_empty()
    }
}
