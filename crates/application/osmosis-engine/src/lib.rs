use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

use osmosis_core::mapping::PairKey;
use osmosis_core::policy::Conflict;
use osmosis_core::Luid;
use osmosis_persistence::StorageError;

pub mod conduit;
pub mod engine;
pub mod progress;
pub mod resolver;

pub use conduit::{Conduit, ConduitBuilder, ConduitError};
pub use engine::{PairPlan, SyncEngine};
pub use progress::{PassSnapshot, ProgressTracker, SyncEvent};
pub use resolver::{ConflictResolver, DeferAll};

/// Pass phase, reported through the progress event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncPhase {
    Refreshing,
    Diffing,
    Transferring,
    Finishing,
}

/// Overall outcome of a pass. `sync` only ever returns the four terminal
/// values; `NotStarted` and `InProgress` exist for trackers and UIs that
/// mirror the pass lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncStatus {
    NotStarted,
    InProgress,
    Completed,
    Conflict,
    Error,
    Aborted,
}

/// Per-pass knobs. The policy and topology live on the [`Conduit`]; these
/// are the things a caller varies run to run.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Bound on the whole pass. On expiry the pass takes the abort path:
    /// remaining items are skipped, providers are finished, nothing commits.
    pub timeout: Option<Duration>,
    /// External abort request, observed between item transfers and at phase
    /// boundaries.
    pub cancellation: Option<CancellationToken>,
    /// Progress events, sent best-effort (never blocks the pass).
    pub progress: Option<Sender<SyncEvent>>,
    /// Escalate to an aborted pass once this many item failures accumulate.
    /// `None` never escalates: item failures stay isolated.
    pub max_item_errors: Option<usize>,
}

/// Fatal-before-pass errors. Anything that happens after Refreshing begins
/// is reported in the [`SyncReport`] instead, so providers are always
/// finished and the caller always learns how far the pass got.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("configuration: {0}")]
    Configuration(String),
    #[error("pair {0} is already syncing")]
    PairBusy(PairKey),
    #[error("refresh failed for '{uid}': {message}")]
    Refresh { uid: String, message: String },
    #[error("provider '{uid}' failed: {message}")]
    Provider { uid: String, message: String },
    #[error("transfer failed for '{luid}': {message}")]
    Transfer { luid: Luid, message: String },
    #[error(transparent)]
    Store(#[from] StorageError),
}

/// The operation that failed for one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferOp {
    Read,
    Copy,
    Delete,
}

/// One isolated item failure: the pass continued, this item did not.
#[derive(Debug, Clone, Serialize)]
pub struct ItemFailure {
    pub luid: Luid,
    pub op: TransferOp,
    pub error: String,
}

/// A provider that failed to refresh, aborting the pass.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshFailure {
    pub uid: String,
    pub error: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TransferStats {
    pub items_copied: u64,
    pub items_deleted: u64,
    pub items_skipped: u64,
    pub conflicts_resolved: u64,
    pub bytes_copied: u64,
}

/// Outcome of one sink's share of a pass.
#[derive(Debug, Clone, Serialize)]
pub struct SinkReport {
    pub sink_uid: String,
    pub stats: TransferStats,
    pub failures: Vec<ItemFailure>,
    /// Conflicts deferred under the `ask` policy, awaiting out-of-band
    /// resolution.
    pub pending: Vec<Conflict>,
    /// Set when this sink's whole share failed (its enumeration broke);
    /// the pair's mappings were left untouched. Other sinks are unaffected.
    pub error: Option<String>,
}

/// What one pass did, returned by `sync` whatever the outcome.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub run_id: String,
    pub status: SyncStatus,
    pub elapsed: Duration,
    pub refresh_failures: Vec<RefreshFailure>,
    pub commit_error: Option<String>,
    pub sinks: Vec<SinkReport>,
}

impl SyncReport {
    pub fn aborted(&self) -> bool {
        self.status == SyncStatus::Aborted
    }

    /// Any failure was tallied: refresh, item transfer, or commit.
    pub fn errored(&self) -> bool {
        !self.refresh_failures.is_empty()
            || self.commit_error.is_some()
            || self.sinks.iter().any(|s| !s.failures.is_empty() || s.error.is_some())
    }

    /// Any conflict ended the pass unresolved.
    pub fn conflicted(&self) -> bool {
        self.sinks.iter().any(|s| !s.pending.is_empty())
    }

    pub fn pending_conflicts(&self) -> impl Iterator<Item = &Conflict> {
        self.sinks.iter().flat_map(|s| s.pending.iter())
    }

    pub fn stats_total(&self) -> TransferStats {
        let mut total = TransferStats::default();
        for sink in &self.sinks {
            total.items_copied += sink.stats.items_copied;
            total.items_deleted += sink.stats.items_deleted;
            total.items_skipped += sink.stats.items_skipped;
            total.conflicts_resolved += sink.stats.conflicts_resolved;
            total.bytes_copied += sink.stats.bytes_copied;
        }
        total
    }

    pub fn failure_count(&self) -> usize {
        self.sinks.iter().map(|s| s.failures.len()).sum()
    }
}
