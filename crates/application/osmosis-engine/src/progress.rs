use osmosis_core::delta::ConflictKind;
use osmosis_core::mapping::PairKey;
use osmosis_core::Luid;

use crate::{SyncPhase, SyncStatus};

/// Best-effort progress events emitted on the options' channel during a
/// pass. Delivery is lossy under backpressure; the final [`crate::SyncReport`]
/// is the authoritative record.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    PassStarted { run_id: String, pairs: Vec<PairKey> },
    PhaseChanged { phase: SyncPhase },
    ItemCopied { pair: PairKey, luid: Luid, bytes: u64 },
    ItemDeleted { pair: PairKey, luid: Luid },
    ItemFailed { pair: PairKey, luid: Luid, error: String },
    ConflictDetected { pair: PairKey, luid: Luid, kind: ConflictKind },
    ConflictDeferred { pair: PairKey, luid: Luid },
    PassFinished { status: SyncStatus },
}

/// Rolling view of a pass for a UI tick loop.
#[derive(Debug, Clone)]
pub struct PassSnapshot {
    pub run_id: String,
    pub status: SyncStatus,
    pub phase: Option<SyncPhase>,
    pub items_copied: u64,
    pub items_deleted: u64,
    pub items_failed: u64,
    pub conflicts: u64,
    pub deferred: u64,
    pub bytes_copied: u64,
}

/// Folds [`SyncEvent`]s into a [`PassSnapshot`].
pub struct ProgressTracker {
    snapshot: PassSnapshot,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            snapshot: PassSnapshot {
                run_id: String::new(),
                status: SyncStatus::NotStarted,
                phase: None,
                items_copied: 0,
                items_deleted: 0,
                items_failed: 0,
                conflicts: 0,
                deferred: 0,
                bytes_copied: 0,
            },
        }
    }

    pub fn update(&mut self, event: SyncEvent) {
        match event {
            SyncEvent::PassStarted { run_id, .. } => {
                self.snapshot.run_id = run_id;
                self.snapshot.status = SyncStatus::InProgress;
            }
            SyncEvent::PhaseChanged { phase } => {
                self.snapshot.phase = Some(phase);
            }
            SyncEvent::ItemCopied { bytes, .. } => {
                self.snapshot.items_copied += 1;
                self.snapshot.bytes_copied += bytes;
            }
            SyncEvent::ItemDeleted { .. } => {
                self.snapshot.items_deleted += 1;
            }
            SyncEvent::ItemFailed { .. } => {
                self.snapshot.items_failed += 1;
            }
            SyncEvent::ConflictDetected { .. } => {
                self.snapshot.conflicts += 1;
            }
            SyncEvent::ConflictDeferred { .. } => {
                self.snapshot.deferred += 1;
            }
            SyncEvent::PassFinished { status } => {
                self.snapshot.status = status;
            }
        }
    }

    pub fn snapshot(&self) -> PassSnapshot {
        self.snapshot.clone()
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}
