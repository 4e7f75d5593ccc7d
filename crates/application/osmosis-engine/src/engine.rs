use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::mpsc::Sender;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use osmosis_core::delta::{correlate, side_changes, ConflictKind, PairDelta, Side};
use osmosis_core::mapping::{Mapping, MappingTable, PairKey};
use osmosis_core::policy::{resolve, Conflict, DeletedPolicy, Direction, Resolution, SyncPolicy};
use osmosis_core::provider::{DataProvider, ProviderError};
use osmosis_core::{FinishStatus, Item, Luid, Marker, SyncMode};
use osmosis_persistence::MappingStore;

use crate::{
    Conduit, ConflictResolver, ItemFailure, RefreshFailure, SinkReport, SyncError, SyncEvent,
    SyncOptions, SyncPhase, SyncReport, SyncStatus, TransferOp, TransferStats,
};

/// Preview of one pair's share of a pass: the delta a sync would act on,
/// computed without transferring or committing anything.
#[derive(Debug, Clone, Serialize)]
pub struct PairPlan {
    pub pair: PairKey,
    pub delta: PairDelta,
    /// Set when the sink could not be enumerated; the delta is empty then.
    pub error: Option<String>,
}

impl PairPlan {
    pub fn is_empty(&self) -> bool {
        self.delta.is_empty()
    }
}

/// Drives sync passes over [`Conduit`]s against one mapping store.
///
/// A pass never returns `Err` once Refreshing has begun: everything after
/// that point is reported in the [`SyncReport`], providers are always
/// finished, and mapping updates commit only when the pass was not aborted.
pub struct SyncEngine {
    store: Arc<dyn MappingStore>,
    resolver: Option<Arc<dyn ConflictResolver>>,
    locks: PairLocks,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn MappingStore>) -> Self {
        Self {
            store,
            resolver: None,
            locks: PairLocks::default(),
        }
    }

    /// Attach a resolver consulted mid-pass for conflicts the `ask` policy
    /// defers. Without one, deferred conflicts end the pass pending.
    pub fn with_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Run one pass. Fails fast (before any provider is touched) on a busy
    /// pair or an unreadable store; every later outcome is in the report.
    pub async fn sync(
        &self,
        conduit: &Conduit,
        options: &SyncOptions,
    ) -> Result<SyncReport, SyncError> {
        let started = Instant::now();
        let run_id = Uuid::new_v4().to_string();
        let pairs = conduit.pairs();
        let events = EventSink::new(options.progress.clone());

        let _guard = self.locks.acquire(&pairs)?;
        let mut tables = Vec::with_capacity(pairs.len());
        for pair in &pairs {
            tables.push(self.store.load_pair(pair)?);
        }

        let token = match &options.cancellation {
            Some(external) => external.child_token(),
            None => CancellationToken::new(),
        };
        let deadline = options.timeout.map(|limit| {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                warn!(?limit, "pass deadline reached, aborting");
                token.cancel();
            })
        });

        info!(%run_id, pairs = pairs.len(), mode = ?conduit.mode(), "sync pass started");
        events.emit(SyncEvent::PassStarted {
            run_id: run_id.clone(),
            pairs,
        });

        let report = self
            .run_pass(conduit, options, run_id, tables, &token, &events, started)
            .await;

        if let Some(handle) = deadline {
            handle.abort();
        }
        events.emit(SyncEvent::PassFinished {
            status: report.status,
        });
        info!(run_id = %report.run_id, status = ?report.status, elapsed = ?report.elapsed, "sync pass finished");
        Ok(report)
    }

    async fn run_pass(
        &self,
        conduit: &Conduit,
        options: &SyncOptions,
        run_id: String,
        tables: Vec<MappingTable>,
        token: &CancellationToken,
        events: &EventSink,
        started: Instant,
    ) -> SyncReport {
        let providers: Vec<Arc<dyn DataProvider>> = std::iter::once(conduit.source().clone())
            .chain(conduit.sinks().iter().cloned())
            .collect();

        events.emit(SyncEvent::PhaseChanged {
            phase: SyncPhase::Refreshing,
        });
        let (refreshed, refresh_failures) = refresh_all(&providers).await;

        if !refresh_failures.is_empty() {
            error!(failed = refresh_failures.len(), "refresh failed, aborting pass");
            let status = FinishStatus {
                aborted: true,
                errored: true,
                conflicted: false,
            };
            finish_all(&providers, &refreshed, status).await;
            return SyncReport {
                run_id,
                status: SyncStatus::Aborted,
                elapsed: started.elapsed(),
                refresh_failures,
                commit_error: None,
                sinks: untouched_sinks(conduit),
            };
        }

        if token.is_cancelled() {
            let status = FinishStatus {
                aborted: true,
                errored: false,
                conflicted: false,
            };
            finish_all(&providers, &refreshed, status).await;
            return SyncReport {
                run_id,
                status: SyncStatus::Aborted,
                elapsed: started.elapsed(),
                refresh_failures: Vec::new(),
                commit_error: None,
                sinks: untouched_sinks(conduit),
            };
        }

        events.emit(SyncEvent::PhaseChanged {
            phase: SyncPhase::Diffing,
        });
        let listing = match conduit.source().get_all().await {
            Ok(listing) => Arc::new(listing),
            Err(enumeration) => {
                error!(uid = conduit.source().uid(), error = %enumeration, "source enumeration failed");
                let status = FinishStatus {
                    aborted: false,
                    errored: true,
                    conflicted: false,
                };
                finish_all(&providers, &refreshed, status).await;
                let mut sinks = untouched_sinks(conduit);
                for sink in &mut sinks {
                    sink.error = Some(enumeration.to_string());
                }
                return SyncReport {
                    run_id,
                    status: SyncStatus::Error,
                    elapsed: started.elapsed(),
                    refresh_failures: Vec::new(),
                    commit_error: None,
                    sinks,
                };
            }
        };

        let tally = Arc::new(ErrorTally::new(options.max_item_errors, token.clone()));
        let source_cache = Arc::new(ItemCache::default());
        let mut tasks: Vec<PairTask> = conduit
            .sinks()
            .iter()
            .cloned()
            .zip(tables)
            .map(|(sink, table)| PairTask {
                pair: PairKey::new(conduit.source().uid(), sink.uid()),
                source: conduit.source().clone(),
                sink,
                mode: conduit.mode(),
                policy: conduit.policy(),
                resolver: self.resolver.clone(),
                listing: listing.clone(),
                source_cache: source_cache.clone(),
                sink_cache: ItemCache::default(),
                table,
                token: token.clone(),
                tally: tally.clone(),
                events: events.clone(),
                delta: None,
                stats: TransferStats::default(),
                failures: Vec::new(),
                pending: Vec::new(),
                error: None,
                dirty: false,
            })
            .collect();

        join_all(tasks.iter_mut().map(|task| task.diff())).await;

        events.emit(SyncEvent::PhaseChanged {
            phase: SyncPhase::Transferring,
        });
        let outcomes = join_all(tasks.into_iter().map(|task| task.execute())).await;

        events.emit(SyncEvent::PhaseChanged {
            phase: SyncPhase::Finishing,
        });
        let aborted = token.is_cancelled();
        let errored = outcomes
            .iter()
            .any(|o| !o.report.failures.is_empty() || o.report.error.is_some());
        let conflicted = outcomes.iter().any(|o| !o.report.pending.is_empty());
        let status = FinishStatus {
            aborted,
            errored,
            conflicted,
        };
        finish_all(&providers, &refreshed, status).await;

        let mut commit_error = None;
        if aborted {
            info!(%run_id, "pass aborted, mapping updates discarded");
        } else {
            let updates: Vec<(PairKey, MappingTable)> = outcomes
                .iter()
                .filter(|o| o.dirty)
                .map(|o| (o.pair.clone(), o.table.clone()))
                .collect();
            if !updates.is_empty() {
                if let Err(commit) = self.store.commit_pairs(&updates) {
                    error!(error = %commit, "mapping commit failed, pass downgraded to error");
                    commit_error = Some(commit.to_string());
                }
            }
        }

        let status = if aborted {
            SyncStatus::Aborted
        } else if conflicted {
            SyncStatus::Conflict
        } else if errored || commit_error.is_some() {
            SyncStatus::Error
        } else {
            SyncStatus::Completed
        };

        SyncReport {
            run_id,
            status,
            elapsed: started.elapsed(),
            refresh_failures: Vec::new(),
            commit_error,
            sinks: outcomes.into_iter().map(|o| o.report).collect(),
        }
    }

    /// Compute what a pass would do, transferring and committing nothing.
    /// Providers are still refreshed and finished (with all-clear flags);
    /// a failed refresh aborts the plan the way it would abort a pass.
    pub async fn plan(&self, conduit: &Conduit) -> Result<Vec<PairPlan>, SyncError> {
        let pairs = conduit.pairs();
        let _guard = self.locks.acquire(&pairs)?;
        let mut tables = Vec::with_capacity(pairs.len());
        for pair in &pairs {
            tables.push(self.store.load_pair(pair)?);
        }

        let providers: Vec<Arc<dyn DataProvider>> = std::iter::once(conduit.source().clone())
            .chain(conduit.sinks().iter().cloned())
            .collect();
        let (refreshed, refresh_failures) = refresh_all(&providers).await;
        if let Some(failure) = refresh_failures.into_iter().next() {
            let status = FinishStatus {
                aborted: true,
                errored: true,
                conflicted: false,
            };
            finish_all(&providers, &refreshed, status).await;
            return Err(SyncError::Refresh {
                uid: failure.uid,
                message: failure.error,
            });
        }

        let listing = match conduit.source().get_all().await {
            Ok(listing) => Arc::new(listing),
            Err(enumeration) => {
                let status = FinishStatus {
                    aborted: false,
                    errored: true,
                    conflicted: false,
                };
                finish_all(&providers, &refreshed, status).await;
                return Err(SyncError::Provider {
                    uid: conduit.source().uid().to_string(),
                    message: enumeration.to_string(),
                });
            }
        };

        let token = CancellationToken::new();
        let tally = Arc::new(ErrorTally::new(None, token.clone()));
        let source_cache = Arc::new(ItemCache::default());
        let mut tasks: Vec<PairTask> = conduit
            .sinks()
            .iter()
            .cloned()
            .zip(tables)
            .map(|(sink, table)| PairTask {
                pair: PairKey::new(conduit.source().uid(), sink.uid()),
                source: conduit.source().clone(),
                sink,
                mode: conduit.mode(),
                policy: conduit.policy(),
                resolver: None,
                listing: listing.clone(),
                source_cache: source_cache.clone(),
                sink_cache: ItemCache::default(),
                table,
                token: token.clone(),
                tally: tally.clone(),
                events: EventSink::new(None),
                delta: None,
                stats: TransferStats::default(),
                failures: Vec::new(),
                pending: Vec::new(),
                error: None,
                dirty: false,
            })
            .collect();

        join_all(tasks.iter_mut().map(|task| task.diff())).await;
        finish_all(&providers, &refreshed, FinishStatus::default()).await;

        Ok(tasks
            .into_iter()
            .map(|task| PairPlan {
                pair: task.pair,
                delta: task.delta.unwrap_or_default(),
                error: task.error,
            })
            .collect())
    }

    /// Settle a conflict a previous pass deferred, out of band. Runs a
    /// one-item pass over the conflict's pair: refresh both ends, apply the
    /// resolution, finish both ends, commit the mapping update.
    pub async fn apply_resolution(
        &self,
        conduit: &Conduit,
        sink_uid: &str,
        conflict: &Conflict,
        resolution: Resolution,
    ) -> Result<(), SyncError> {
        if resolution == Resolution::Defer {
            return Err(SyncError::Configuration(
                "defer does not resolve a conflict".into(),
            ));
        }
        let sink = conduit
            .sink_by_uid(sink_uid)
            .ok_or_else(|| {
                SyncError::Configuration(format!("no sink '{sink_uid}' in this conduit"))
            })?
            .clone();
        let source = conduit.source().clone();
        let pair = PairKey::new(source.uid(), sink_uid);
        if conflict.pair != pair {
            return Err(SyncError::Configuration(format!(
                "conflict belongs to {}, not {}",
                conflict.pair, pair
            )));
        }

        let _guard = self.locks.acquire(std::slice::from_ref(&pair))?;
        let mut table = self.store.load_pair(&pair)?;

        source.refresh().await.map_err(|error| SyncError::Refresh {
            uid: source.uid().to_string(),
            message: error.to_string(),
        })?;
        if let Err(error) = sink.refresh().await {
            let status = FinishStatus {
                aborted: true,
                errored: true,
                conflicted: false,
            };
            if let Err(finish_error) = source.finish(status).await {
                warn!(uid = source.uid(), error = %finish_error, "finish failed");
            }
            return Err(SyncError::Refresh {
                uid: sink.uid().to_string(),
                message: error.to_string(),
            });
        }

        let result = apply_to_pair(&source, &sink, conflict, resolution, &mut table).await;

        let status = FinishStatus {
            aborted: false,
            errored: result.is_err(),
            conflicted: false,
        };
        for provider in [&source, &sink] {
            if let Err(error) = provider.finish(status).await {
                warn!(uid = provider.uid(), error = %error, "finish failed");
            }
        }
        result?;

        info!(%pair, luid = %conflict.mapping.source_luid, ?resolution, "conflict resolved out of band");
        self.store.commit_pairs(&[(pair, table)])?;
        Ok(())
    }
}

/// Apply one resolution against live providers, updating the in-memory
/// table. `Replace` moves the winning state in its direction; when that
/// state is a deletion, the survivor is deleted instead of overwritten.
async fn apply_to_pair(
    source: &Arc<dyn DataProvider>,
    sink: &Arc<dyn DataProvider>,
    conflict: &Conflict,
    resolution: Resolution,
    table: &mut MappingTable,
) -> Result<(), SyncError> {
    let mapping = &conflict.mapping;
    match resolution {
        Resolution::Defer => Err(SyncError::Configuration(
            "defer does not resolve a conflict".into(),
        )),
        Resolution::Skip => {
            match conflict.kind {
                // Both versions stand. Restamp the mapping with the current
                // markers so neither side re-reads as changed next pass.
                ConflictKind::ModifiedModified => {
                    let source_item = source
                        .get(&mapping.source_luid)
                        .await
                        .map_err(|e| transfer_error(&mapping.source_luid, e))?;
                    let sink_item = sink
                        .get(&mapping.sink_luid)
                        .await
                        .map_err(|e| transfer_error(&mapping.sink_luid, e))?;
                    table.put(Mapping::new(
                        mapping.source_luid.clone(),
                        mapping.sink_luid.clone(),
                        source_item.marker,
                        sink_item.marker,
                    ));
                }
                // One side is gone: retire the pairing. The survivor keeps
                // its item and, two-way, flows back as an add next pass.
                _ => {
                    table.remove_by_source(&mapping.source_luid);
                }
            }
            Ok(())
        }
        Resolution::Duplicate => {
            let item = source
                .get(&mapping.source_luid)
                .await
                .map_err(|e| transfer_error(&mapping.source_luid, e))?;
            let stored = sink
                .put(&item, false, None)
                .await
                .map_err(|e| transfer_error(&item.luid, e))?;
            let stored_item = sink
                .get(&stored)
                .await
                .map_err(|e| transfer_error(&stored, e))?;
            table.put(Mapping::new(
                mapping.source_luid.clone(),
                stored,
                item.marker,
                stored_item.marker,
            ));
            Ok(())
        }
        Resolution::Replace(direction) => {
            let deletion_wins = matches!(
                (conflict.kind, direction),
                (ConflictKind::DeletedModified, Direction::SourceToSink)
                    | (ConflictKind::ModifiedDeleted, Direction::SinkToSource)
            );
            if deletion_wins {
                let (provider, luid) = match direction {
                    Direction::SourceToSink => (sink, mapping.sink_luid.as_str()),
                    Direction::SinkToSource => (source, mapping.source_luid.as_str()),
                };
                provider
                    .delete(luid)
                    .await
                    .map_err(|e| transfer_error(luid, e))?;
                table.remove_by_source(&mapping.source_luid);
            } else {
                let (origin, destination, origin_luid, destination_luid) = match direction {
                    Direction::SourceToSink => {
                        (source, sink, &mapping.source_luid, &mapping.sink_luid)
                    }
                    Direction::SinkToSource => {
                        (sink, source, &mapping.sink_luid, &mapping.source_luid)
                    }
                };
                let item = origin
                    .get(origin_luid)
                    .await
                    .map_err(|e| transfer_error(origin_luid, e))?;
                let stored = destination
                    .put(&item, true, Some(destination_luid))
                    .await
                    .map_err(|e| transfer_error(origin_luid, e))?;
                let stored_item = destination
                    .get(&stored)
                    .await
                    .map_err(|e| transfer_error(&stored, e))?;
                let updated = match direction {
                    Direction::SourceToSink => Mapping::new(
                        origin_luid.clone(),
                        stored,
                        item.marker,
                        stored_item.marker,
                    ),
                    Direction::SinkToSource => Mapping::new(
                        stored,
                        origin_luid.clone(),
                        stored_item.marker,
                        item.marker,
                    ),
                };
                table.put(updated);
            }
            Ok(())
        }
    }
}

fn transfer_error(luid: &str, error: ProviderError) -> SyncError {
    SyncError::Transfer {
        luid: luid.to_string(),
        message: error.to_string(),
    }
}

/// One pass is exclusive per pair: overlapping `sync`, `plan` or
/// `apply_resolution` calls on the same pair fail fast with `PairBusy`.
#[derive(Clone, Default)]
struct PairLocks {
    held: Arc<Mutex<HashSet<PairKey>>>,
}

impl PairLocks {
    fn acquire(&self, pairs: &[PairKey]) -> Result<PairLockGuard, SyncError> {
        let mut held = self.held.lock().expect("pair lock registry poisoned");
        if let Some(busy) = pairs.iter().find(|pair| held.contains(*pair)) {
            return Err(SyncError::PairBusy(busy.clone()));
        }
        for pair in pairs {
            held.insert(pair.clone());
        }
        Ok(PairLockGuard {
            registry: self.held.clone(),
            pairs: pairs.to_vec(),
        })
    }
}

struct PairLockGuard {
    registry: Arc<Mutex<HashSet<PairKey>>>,
    pairs: Vec<PairKey>,
}

impl Drop for PairLockGuard {
    fn drop(&mut self) {
        let mut held = self.registry.lock().expect("pair lock registry poisoned");
        for pair in &self.pairs {
            held.remove(pair);
        }
    }
}

/// Pass-wide item failure count. Reaching the configured limit cancels the
/// pass token, so escalation takes the same abort path as an external
/// cancellation: remaining items skipped, finish flagged, nothing committed.
struct ErrorTally {
    count: AtomicUsize,
    limit: Option<usize>,
    token: CancellationToken,
}

impl ErrorTally {
    fn new(limit: Option<usize>, token: CancellationToken) -> Self {
        Self {
            count: AtomicUsize::new(0),
            limit,
            token,
        }
    }

    fn record(&self) {
        let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(limit) = self.limit {
            if count >= limit && !self.token.is_cancelled() {
                error!(failures = count, limit, "item failure limit reached, aborting pass");
                self.token.cancel();
            }
        }
    }
}

/// Best-effort event emission: a full or absent channel never stalls the
/// pass, the report stays authoritative.
#[derive(Clone)]
struct EventSink(Option<Sender<SyncEvent>>);

impl EventSink {
    fn new(sender: Option<Sender<SyncEvent>>) -> Self {
        Self(sender)
    }

    fn emit(&self, event: SyncEvent) {
        if let Some(sender) = &self.0 {
            let _ = sender.try_send(event);
        }
    }
}

/// Materialized items for one provider, keyed by luid and shared for the
/// rest of the pass so diffing and transfer fetch each item once.
#[derive(Default)]
struct ItemCache {
    items: AsyncMutex<HashMap<Luid, Arc<Item>>>,
}

impl ItemCache {
    async fn fetch(
        &self,
        provider: &Arc<dyn DataProvider>,
        luid: &str,
    ) -> Result<Arc<Item>, ProviderError> {
        if let Some(item) = self.items.lock().await.get(luid) {
            return Ok(item.clone());
        }
        let item = Arc::new(provider.get(luid).await?);
        self.items
            .lock()
            .await
            .insert(luid.to_string(), item.clone());
        Ok(item)
    }
}

/// One sink's share of a pass. Sinks run independently: a failure here
/// never touches another pair's providers, table or report.
struct PairTask {
    pair: PairKey,
    source: Arc<dyn DataProvider>,
    sink: Arc<dyn DataProvider>,
    mode: SyncMode,
    policy: SyncPolicy,
    resolver: Option<Arc<dyn ConflictResolver>>,
    listing: Arc<Vec<Luid>>,
    source_cache: Arc<ItemCache>,
    sink_cache: ItemCache,
    table: MappingTable,
    token: CancellationToken,
    tally: Arc<ErrorTally>,
    events: EventSink,
    delta: Option<PairDelta>,
    stats: TransferStats,
    failures: Vec<ItemFailure>,
    pending: Vec<Conflict>,
    error: Option<String>,
    dirty: bool,
}

struct PairOutcome {
    pair: PairKey,
    report: SinkReport,
    table: MappingTable,
    dirty: bool,
}

impl PairTask {
    async fn diff(&mut self) {
        let listing = self.listing.clone();
        let source_present = self.present_markers(Side::Source, &listing).await;
        let source_changes = side_changes(&source_present, &self.table, Side::Source);

        let sink_changes = if self.mode.is_two_way() {
            let sink_listing = match self.sink.get_all().await {
                Ok(listing) => listing,
                Err(enumeration) => {
                    error!(pair = %self.pair, error = %enumeration, "sink enumeration failed, pair left untouched");
                    self.error = Some(enumeration.to_string());
                    return;
                }
            };
            let sink_present = self.present_markers(Side::Sink, &sink_listing).await;
            Some(side_changes(&sink_present, &self.table, Side::Sink))
        } else {
            None
        };

        let delta = correlate(&source_changes, sink_changes.as_ref(), &self.table);
        debug!(
            pair = %self.pair,
            to_sink = delta.copy_to_sink.len(),
            to_source = delta.copy_to_source.len(),
            deletions = delta.delete_on_sink.len() + delta.delete_on_source.len(),
            conflicts = delta.conflicts.len(),
            retired = delta.retired.len(),
            "pair delta",
        );
        self.delta = Some(delta);
    }

    async fn execute(mut self) -> PairOutcome {
        let Some(delta) = self.delta.take() else {
            return self.into_outcome();
        };

        for (mapping, kind) in delta.conflicts {
            if self.token.is_cancelled() {
                return self.into_outcome();
            }
            self.handle_conflict(mapping, kind).await;
        }
        for luid in delta.copy_to_sink {
            if self.token.is_cancelled() {
                return self.into_outcome();
            }
            self.copy_item(Direction::SourceToSink, &luid).await;
        }
        for luid in delta.copy_to_source {
            if self.token.is_cancelled() {
                return self.into_outcome();
            }
            self.copy_item(Direction::SinkToSource, &luid).await;
        }
        for mapping in delta.delete_on_sink {
            if self.token.is_cancelled() {
                return self.into_outcome();
            }
            self.plain_delete(Direction::SourceToSink, &mapping).await;
        }
        for mapping in delta.delete_on_source {
            if self.token.is_cancelled() {
                return self.into_outcome();
            }
            self.plain_delete(Direction::SinkToSource, &mapping).await;
        }
        if !self.token.is_cancelled() {
            for mapping in delta.retired {
                debug!(pair = %self.pair, luid = %mapping.source_luid, "deleted on both sides, mapping retired");
                self.table.remove_by_source(&mapping.source_luid);
                self.dirty = true;
            }
        }
        self.into_outcome()
    }

    /// Current marker for every listed luid, materialized through the item
    /// cache. An unreadable mapped item is reported as a failure and kept
    /// at its recorded marker, so it is neither transferred nor mistaken
    /// for a deletion; an unreadable unmapped item is left out entirely.
    async fn present_markers(&mut self, side: Side, listing: &[Luid]) -> BTreeMap<Luid, Marker> {
        let mut present = BTreeMap::new();
        for luid in listing {
            if self.token.is_cancelled() {
                break;
            }
            let recorded = match side {
                Side::Source => self
                    .table
                    .lookup_by_source(luid)
                    .map(|m| m.source_marker.clone()),
                Side::Sink => self
                    .table
                    .lookup_by_sink(luid)
                    .map(|m| m.sink_marker.clone()),
            };
            match self.fetch(side, luid).await {
                Ok(item) => {
                    present.insert(luid.clone(), item.marker.clone());
                }
                Err(read) => {
                    self.record_failure(luid, TransferOp::Read, &read);
                    if let Some(marker) = recorded {
                        present.insert(luid.clone(), marker);
                    }
                }
            }
        }
        present
    }

    async fn fetch(&self, side: Side, luid: &str) -> Result<Arc<Item>, ProviderError> {
        match side {
            Side::Source => self.source_cache.fetch(&self.source, luid).await,
            Side::Sink => self.sink_cache.fetch(&self.sink, luid).await,
        }
    }

    fn record_failure(&mut self, luid: &str, op: TransferOp, error: &ProviderError) {
        warn!(pair = %self.pair, %luid, ?op, error = %error, "item failed, pass continues");
        self.events.emit(SyncEvent::ItemFailed {
            pair: self.pair.clone(),
            luid: luid.to_string(),
            error: error.to_string(),
        });
        self.failures.push(ItemFailure {
            luid: luid.to_string(),
            op,
            error: error.to_string(),
        });
        self.tally.record();
    }

    /// Copy one item in `direction`, mapping the luid the destination
    /// actually stored under. Mapped items overwrite their counterpart;
    /// unmapped items are fresh adds the destination may rename.
    async fn copy_item(&mut self, direction: Direction, origin_luid: &str) -> bool {
        let origin_side = match direction {
            Direction::SourceToSink => Side::Source,
            Direction::SinkToSource => Side::Sink,
        };
        let item = match self.fetch(origin_side, origin_luid).await {
            Ok(item) => item,
            Err(read) => {
                self.record_failure(origin_luid, TransferOp::Read, &read);
                return false;
            }
        };

        let mapped = match direction {
            Direction::SourceToSink => self.table.lookup_by_source(origin_luid),
            Direction::SinkToSource => self.table.lookup_by_sink(origin_luid),
        };
        let existing = mapped.map(|m| match direction {
            Direction::SourceToSink => m.sink_luid.clone(),
            Direction::SinkToSource => m.source_luid.clone(),
        });
        let destination = match direction {
            Direction::SourceToSink => self.sink.clone(),
            Direction::SinkToSource => self.source.clone(),
        };

        let stored = match destination
            .put(&item, existing.is_some(), existing.as_deref())
            .await
        {
            Ok(stored) => stored,
            Err(put) => {
                self.record_failure(origin_luid, TransferOp::Copy, &put);
                return false;
            }
        };
        // Read the stored item back so the mapping records the marker the
        // destination will report on the next pass.
        let stored_item = match destination.get(&stored).await {
            Ok(stored_item) => stored_item,
            Err(read) => {
                self.record_failure(&stored, TransferOp::Read, &read);
                return false;
            }
        };

        let updated = match direction {
            Direction::SourceToSink => Mapping::new(
                origin_luid,
                stored.clone(),
                item.marker.clone(),
                stored_item.marker,
            ),
            Direction::SinkToSource => Mapping::new(
                stored.clone(),
                origin_luid,
                stored_item.marker,
                item.marker.clone(),
            ),
        };
        self.table.put(updated);
        self.dirty = true;
        self.stats.items_copied += 1;
        self.stats.bytes_copied += item.payload.len() as u64;
        debug!(pair = %self.pair, from = origin_luid, to = %stored, bytes = item.payload.len(), "item copied");
        self.events.emit(SyncEvent::ItemCopied {
            pair: self.pair.clone(),
            luid: origin_luid.to_string(),
            bytes: item.payload.len() as u64,
        });
        true
    }

    /// Propagate one uncontested deletion, subject to the deleted policy.
    async fn plain_delete(&mut self, direction: Direction, mapping: &Mapping) {
        match self.policy.deleted {
            DeletedPolicy::Replace => {
                self.delete_mapped(direction, mapping).await;
            }
            DeletedPolicy::Skip => {
                debug!(pair = %self.pair, luid = %mapping.source_luid, "deletion not propagated (policy: skip)");
                self.stats.items_skipped += 1;
            }
            // No surviving change to weigh the deletion against, so there
            // is nothing to ask: hold the item and re-detect next pass.
            DeletedPolicy::Ask => {
                warn!(pair = %self.pair, luid = %mapping.source_luid, "deletion held back (policy: ask)");
                self.stats.items_skipped += 1;
            }
        }
    }

    /// Delete the item on the side `direction` points to and retire the
    /// mapping.
    async fn delete_mapped(&mut self, direction: Direction, mapping: &Mapping) -> bool {
        let (provider, luid) = match direction {
            Direction::SourceToSink => (self.sink.clone(), mapping.sink_luid.as_str()),
            Direction::SinkToSource => (self.source.clone(), mapping.source_luid.as_str()),
        };
        match provider.delete(luid).await {
            Ok(()) => {
                self.table.remove_by_source(&mapping.source_luid);
                self.dirty = true;
                self.stats.items_deleted += 1;
                debug!(pair = %self.pair, %luid, "deletion propagated");
                self.events.emit(SyncEvent::ItemDeleted {
                    pair: self.pair.clone(),
                    luid: luid.to_string(),
                });
                true
            }
            Err(delete) => {
                self.record_failure(luid, TransferOp::Delete, &delete);
                false
            }
        }
    }

    async fn handle_conflict(&mut self, mapping: Mapping, kind: ConflictKind) {
        let source = match kind {
            ConflictKind::DeletedModified => None,
            _ => match self.fetch(Side::Source, &mapping.source_luid).await {
                Ok(item) => Some((*item).clone()),
                Err(read) => {
                    self.record_failure(&mapping.source_luid, TransferOp::Read, &read);
                    return;
                }
            },
        };
        let sink = match kind {
            ConflictKind::ModifiedDeleted => None,
            _ => match self.fetch(Side::Sink, &mapping.sink_luid).await {
                Ok(item) => Some((*item).clone()),
                Err(read) => {
                    self.record_failure(&mapping.sink_luid, TransferOp::Read, &read);
                    return;
                }
            },
        };
        let conflict = Conflict {
            pair: self.pair.clone(),
            kind,
            mapping,
            source,
            sink,
        };
        self.events.emit(SyncEvent::ConflictDetected {
            pair: self.pair.clone(),
            luid: conflict.mapping.source_luid.clone(),
            kind,
        });

        let mut resolution = resolve(&conflict, &self.policy, self.mode);
        if resolution == Resolution::Defer {
            if let Some(resolver) = self.resolver.clone() {
                resolution = resolver.resolve(&conflict).await;
            }
        }

        match resolution {
            Resolution::Skip => {
                debug!(pair = %self.pair, luid = %conflict.mapping.source_luid, %kind, "conflict skipped, both sides kept");
                self.stats.items_skipped += 1;
            }
            Resolution::Defer => {
                warn!(pair = %self.pair, luid = %conflict.mapping.source_luid, %kind, "conflict deferred");
                self.events.emit(SyncEvent::ConflictDeferred {
                    pair: self.pair.clone(),
                    luid: conflict.mapping.source_luid.clone(),
                });
                self.pending.push(conflict);
            }
            Resolution::Duplicate => {
                if self.duplicate_item(&conflict).await {
                    self.stats.conflicts_resolved += 1;
                }
            }
            Resolution::Replace(direction) => {
                let done = match kind {
                    ConflictKind::ModifiedModified => {
                        let origin_luid = match direction {
                            Direction::SourceToSink => conflict.mapping.source_luid.clone(),
                            Direction::SinkToSource => conflict.mapping.sink_luid.clone(),
                        };
                        self.copy_item(direction, &origin_luid).await
                    }
                    // The deletion is the winning state: clear the survivor.
                    ConflictKind::DeletedModified | ConflictKind::ModifiedDeleted => {
                        self.delete_mapped(direction, &conflict.mapping).await
                    }
                };
                if done {
                    self.stats.conflicts_resolved += 1;
                }
            }
        }
    }

    /// Keep both versions: the source's copy lands beside the sink's under
    /// a fresh luid and takes over the mapping. The sink's own version
    /// becomes unmapped and, two-way, flows back as an add next pass.
    async fn duplicate_item(&mut self, conflict: &Conflict) -> bool {
        let Some(item) = conflict.source.as_ref() else {
            return false;
        };
        let stored = match self.sink.put(item, false, None).await {
            Ok(stored) => stored,
            Err(put) => {
                self.record_failure(&conflict.mapping.source_luid, TransferOp::Copy, &put);
                return false;
            }
        };
        let stored_item = match self.sink.get(&stored).await {
            Ok(stored_item) => stored_item,
            Err(read) => {
                self.record_failure(&stored, TransferOp::Read, &read);
                return false;
            }
        };
        self.table.put(Mapping::new(
            conflict.mapping.source_luid.clone(),
            stored.clone(),
            item.marker.clone(),
            stored_item.marker,
        ));
        self.dirty = true;
        self.stats.items_copied += 1;
        self.stats.bytes_copied += item.payload.len() as u64;
        debug!(pair = %self.pair, luid = %conflict.mapping.source_luid, duplicate = %stored, "conflict duplicated");
        self.events.emit(SyncEvent::ItemCopied {
            pair: self.pair.clone(),
            luid: conflict.mapping.source_luid.clone(),
            bytes: item.payload.len() as u64,
        });
        true
    }

    fn into_outcome(self) -> PairOutcome {
        let report = SinkReport {
            sink_uid: self.sink.uid().to_string(),
            stats: self.stats,
            failures: self.failures,
            pending: self.pending,
            error: self.error,
        };
        PairOutcome {
            pair: self.pair,
            report,
            table: self.table,
            dirty: self.dirty,
        }
    }
}

async fn refresh_all(
    providers: &[Arc<dyn DataProvider>],
) -> (Vec<bool>, Vec<RefreshFailure>) {
    let results = join_all(providers.iter().map(|provider| provider.refresh())).await;
    let mut refreshed = Vec::with_capacity(providers.len());
    let mut failures = Vec::new();
    for (provider, result) in providers.iter().zip(results) {
        match result {
            Ok(()) => refreshed.push(true),
            Err(refresh) => {
                error!(uid = provider.uid(), error = %refresh, "refresh failed");
                failures.push(RefreshFailure {
                    uid: provider.uid().to_string(),
                    error: refresh.to_string(),
                });
                refreshed.push(false);
            }
        }
    }
    (refreshed, failures)
}

/// Finish every provider whose refresh succeeded, exactly once. Finish
/// errors are logged and never change the pass outcome.
async fn finish_all(
    providers: &[Arc<dyn DataProvider>],
    refreshed: &[bool],
    status: FinishStatus,
) {
    let finishing = providers
        .iter()
        .zip(refreshed)
        .filter(|(_, refreshed)| **refreshed)
        .map(|(provider, _)| async move {
            if let Err(finish) = provider.finish(status).await {
                warn!(uid = provider.uid(), error = %finish, "finish failed");
            }
        });
    join_all(finishing).await;
}

fn untouched_sinks(conduit: &Conduit) -> Vec<SinkReport> {
    conduit
        .sinks()
        .iter()
        .map(|sink| SinkReport {
            sink_uid: sink.uid().to_string(),
            stats: TransferStats::default(),
            failures: Vec::new(),
            pending: Vec::new(),
            error: None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use osmosis_persistence::MemoryMappingStore;
    use osmosis_providers::MemoryProvider;

    #[test]
    fn pair_locks_are_exclusive_until_released() {
        let locks = PairLocks::default();
        let pair = PairKey::new("a", "b");
        let other = PairKey::new("a", "c");

        let guard = locks.acquire(&[pair.clone(), other.clone()]).unwrap();
        let busy = locks.acquire(std::slice::from_ref(&pair));
        assert!(matches!(busy, Err(SyncError::PairBusy(p)) if p == pair));

        drop(guard);
        assert!(locks.acquire(&[pair, other]).is_ok());
    }

    #[test]
    fn overlap_on_any_pair_blocks_the_whole_acquisition() {
        let locks = PairLocks::default();
        let held = locks.acquire(&[PairKey::new("a", "b")]).unwrap();

        let busy = locks.acquire(&[PairKey::new("a", "c"), PairKey::new("a", "b")]);
        assert!(busy.is_err());
        // The failed acquisition must not leave its free pair locked.
        drop(held);
        assert!(locks
            .acquire(&[PairKey::new("a", "c"), PairKey::new("a", "b")])
            .is_ok());
    }

    #[test]
    fn tally_cancels_the_pass_token_at_the_limit() {
        let token = CancellationToken::new();
        let tally = ErrorTally::new(Some(2), token.clone());

        tally.record();
        assert!(!token.is_cancelled());
        tally.record();
        assert!(token.is_cancelled());
    }

    #[test]
    fn unlimited_tally_never_cancels() {
        let token = CancellationToken::new();
        let tally = ErrorTally::new(None, token.clone());
        for _ in 0..100 {
            tally.record();
        }
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn minimal_pass_moves_one_item() {
        let engine = SyncEngine::new(Arc::new(MemoryMappingStore::new()));
        let source = Arc::new(MemoryProvider::new("src"));
        source.seed("hello.txt", b"hi".to_vec());
        let sink = Arc::new(MemoryProvider::new("dst"));
        let conduit = Conduit::builder(source)
            .sink(sink.clone())
            .build()
            .unwrap();

        let report = engine.sync(&conduit, &SyncOptions::default()).await.unwrap();

        assert_eq!(report.status, SyncStatus::Completed);
        assert_eq!(report.stats_total().items_copied, 1);
        assert_eq!(sink.payload("hello.txt").unwrap(), b"hi");
    }
}
