use crate::mapping::{Mapping, MappingTable};
use crate::{Luid, Marker};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Which end of a pair a listing belongs to; decides which mapping index
/// and which recorded marker to compare against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Source,
    Sink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictKind {
    ModifiedModified,
    DeletedModified,
    ModifiedDeleted,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConflictKind::ModifiedModified => "modified-modified",
            ConflictKind::DeletedModified => "deleted-modified",
            ConflictKind::ModifiedDeleted => "modified-deleted",
        };
        f.write_str(s)
    }
}

/// One side's changes relative to the persisted mapping table.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChangeSet {
    /// Luids present with no mapping.
    pub added: Vec<Luid>,
    /// Mapped luids whose current marker differs from the recorded one.
    pub modified: Vec<Luid>,
    /// Mapped luids no longer present.
    pub deleted: Vec<Luid>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len()
    }
}

/// Classify one side's current listing against the table. `present` maps
/// every luid the provider currently reports to its current marker.
pub fn side_changes(
    present: &BTreeMap<Luid, Marker>,
    table: &MappingTable,
    side: Side,
) -> ChangeSet {
    let mut changes = ChangeSet::default();

    for (luid, marker) in present {
        let mapping = match side {
            Side::Source => table.lookup_by_source(luid),
            Side::Sink => table.lookup_by_sink(luid),
        };
        match mapping {
            None => changes.added.push(luid.clone()),
            Some(mapping) => {
                let recorded = match side {
                    Side::Source => &mapping.source_marker,
                    Side::Sink => &mapping.sink_marker,
                };
                if recorded != marker {
                    changes.modified.push(luid.clone());
                }
            }
        }
    }

    for mapping in table.iter() {
        let luid = match side {
            Side::Source => &mapping.source_luid,
            Side::Sink => &mapping.sink_luid,
        };
        if !present.contains_key(luid) {
            changes.deleted.push(luid.clone());
        }
    }

    changes
}

/// Per-pair action plan produced by correlating both sides' change sets
/// through the mapping table. Luids in the copy vectors belong to the
/// originating side; deletions carry the full mapping so the engine knows
/// both luids.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PairDelta {
    pub copy_to_sink: Vec<Luid>,
    pub copy_to_source: Vec<Luid>,
    pub delete_on_sink: Vec<Mapping>,
    pub delete_on_source: Vec<Mapping>,
    pub conflicts: Vec<(Mapping, ConflictKind)>,
    /// Deleted on both sides: the mapping is retired without touching
    /// either provider.
    pub retired: Vec<Mapping>,
}

impl PairDelta {
    pub fn is_empty(&self) -> bool {
        self.copy_to_sink.is_empty()
            && self.copy_to_source.is_empty()
            && self.delete_on_sink.is_empty()
            && self.delete_on_source.is_empty()
            && self.conflicts.is_empty()
            && self.retired.is_empty()
    }
}

/// Correlate the two sides. `sink` is `None` in one-way mode: sink-side
/// changes are never enumerated, so nothing flows back and no conflicts can
/// arise.
pub fn correlate(source: &ChangeSet, sink: Option<&ChangeSet>, table: &MappingTable) -> PairDelta {
    let empty = ChangeSet::default();
    let sink = sink.unwrap_or(&empty);
    let mut delta = PairDelta::default();

    let sink_modified: HashSet<&str> = sink.modified.iter().map(String::as_str).collect();
    let sink_deleted: HashSet<&str> = sink.deleted.iter().map(String::as_str).collect();

    delta.copy_to_sink.extend(source.added.iter().cloned());

    for luid in &source.modified {
        let Some(mapping) = table.lookup_by_source(luid) else {
            continue;
        };
        if sink_modified.contains(mapping.sink_luid.as_str()) {
            delta
                .conflicts
                .push((mapping.clone(), ConflictKind::ModifiedModified));
        } else if sink_deleted.contains(mapping.sink_luid.as_str()) {
            delta
                .conflicts
                .push((mapping.clone(), ConflictKind::ModifiedDeleted));
        } else {
            delta.copy_to_sink.push(luid.clone());
        }
    }

    for luid in &source.deleted {
        let Some(mapping) = table.lookup_by_source(luid) else {
            continue;
        };
        if sink_modified.contains(mapping.sink_luid.as_str()) {
            delta
                .conflicts
                .push((mapping.clone(), ConflictKind::DeletedModified));
        } else if sink_deleted.contains(mapping.sink_luid.as_str()) {
            delta.retired.push(mapping.clone());
        } else {
            delta.delete_on_sink.push(mapping.clone());
        }
    }

    // Sink-side changes whose mapped counterpart changed too were classified
    // above; the rest flow back toward the source.
    let source_changed: HashSet<&str> = source
        .modified
        .iter()
        .chain(source.deleted.iter())
        .map(String::as_str)
        .collect();

    delta.copy_to_source.extend(sink.added.iter().cloned());

    for luid in &sink.modified {
        let Some(mapping) = table.lookup_by_sink(luid) else {
            continue;
        };
        if !source_changed.contains(mapping.source_luid.as_str()) {
            delta.copy_to_source.push(luid.clone());
        }
    }

    for luid in &sink.deleted {
        let Some(mapping) = table.lookup_by_sink(luid) else {
            continue;
        };
        if !source_changed.contains(mapping.source_luid.as_str()) {
            delta.delete_on_source.push(mapping.clone());
        }
    }

    delta
}
