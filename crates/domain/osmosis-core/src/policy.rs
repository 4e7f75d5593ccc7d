use crate::delta::ConflictKind;
use crate::mapping::{Mapping, PairKey};
use crate::{Item, SyncMode};
use serde::{Deserialize, Serialize};

/// What to do when both sides changed the same mapped item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    #[default]
    Skip,
    Ask,
    Replace,
    Duplicate,
}

/// What to do when a deletion meets a modification (and how plain
/// deletions propagate).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeletedPolicy {
    #[default]
    Skip,
    Ask,
    Replace,
}

/// Immutable for the duration of one pass. Serde round-trips the caller
/// surface `{"conflict": "...", "deleted": "..."}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncPolicy {
    pub conflict: ConflictPolicy,
    pub deleted: DeletedPolicy,
}

impl SyncPolicy {
    pub fn new(conflict: ConflictPolicy, deleted: DeletedPolicy) -> Self {
        Self { conflict, deleted }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    SourceToSink,
    SinkToSource,
}

/// Outcome of resolving one conflict. For `Replace`, the direction is the
/// one the winning content (or the deletion) flows in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Skip,
    Replace(Direction),
    Duplicate,
    Defer,
}

/// A detected conflict. Lives only during a pass, or in the report's
/// pending list awaiting out-of-band resolution. A `None` side means that
/// side's item was deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub pair: PairKey,
    pub kind: ConflictKind,
    pub mapping: Mapping,
    pub source: Option<Item>,
    pub sink: Option<Item>,
}

/// Map a conflict plus the configured policy to an action. Pure: no IO, no
/// provider calls.
///
/// Modify-modify conflicts follow `policy.conflict`; under `replace` the
/// source wins one-way syncs, the newer marker wins two-way syncs, and a
/// tie goes to the source. Deletion conflicts follow `policy.deleted`;
/// under `replace` the deletion propagates to the surviving side. `Defer`
/// is produced only by `ask`.
pub fn resolve(conflict: &Conflict, policy: &SyncPolicy, mode: SyncMode) -> Resolution {
    match conflict.kind {
        ConflictKind::ModifiedModified => match policy.conflict {
            ConflictPolicy::Skip => Resolution::Skip,
            ConflictPolicy::Ask => Resolution::Defer,
            ConflictPolicy::Duplicate => Resolution::Duplicate,
            ConflictPolicy::Replace => Resolution::Replace(replace_direction(conflict, mode)),
        },
        ConflictKind::DeletedModified => match policy.deleted {
            DeletedPolicy::Skip => Resolution::Skip,
            DeletedPolicy::Ask => Resolution::Defer,
            DeletedPolicy::Replace => Resolution::Replace(Direction::SourceToSink),
        },
        ConflictKind::ModifiedDeleted => match policy.deleted {
            DeletedPolicy::Skip => Resolution::Skip,
            DeletedPolicy::Ask => Resolution::Defer,
            DeletedPolicy::Replace => Resolution::Replace(Direction::SinkToSource),
        },
    }
}

fn replace_direction(conflict: &Conflict, mode: SyncMode) -> Direction {
    if mode == SyncMode::OneWay {
        return Direction::SourceToSink;
    }
    match (&conflict.source, &conflict.sink) {
        (Some(source), Some(sink)) if sink.marker.newer_than(&source.marker) => {
            Direction::SinkToSource
        }
        // Newer source, a tie, or a missing side: the source wins.
        _ => Direction::SourceToSink,
    }
}
