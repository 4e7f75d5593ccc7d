use crate::{mode_for, CliConflictPolicy, CliDeletedPolicy};
use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use directories::ProjectDirs;
use humansize::{format_size, DECIMAL};
use indicatif::{ProgressBar, ProgressStyle};
use osmosis_core::mapping::{Mapping, PairKey};
use osmosis_core::policy::SyncPolicy;
use osmosis_core::{Capability, SyncMode};
use osmosis_engine::{Conduit, PairPlan, ProgressTracker, SyncEngine, SyncOptions, SyncReport};
use osmosis_persistence::{MappingStore, RedbMappingStore};
use osmosis_providers::FolderProvider;
use std::sync::Arc;
use std::time::Duration;

const QUALIFIER: &str = "com";
const ORG: &str = "osmosis";
const APP: &str = "osmosis";

#[allow(clippy::too_many_arguments)]
pub async fn cmd_sync(
    source: Utf8PathBuf,
    sinks: Vec<Utf8PathBuf>,
    two_way: bool,
    conflict: CliConflictPolicy,
    deleted: CliDeletedPolicy,
    timeout_secs: Option<u64>,
    max_item_errors: Option<usize>,
    state_dir: Option<Utf8PathBuf>,
) -> Result<SyncReport> {
    println!(":: Synchronizing...");
    println!("   Source: {}", source);
    for sink in &sinks {
        println!("   Sink:   {}", sink);
    }

    let engine = SyncEngine::new(Arc::new(open_store(state_dir)?));
    let conduit = build_conduit(
        &source,
        &sinks,
        mode_for(two_way),
        SyncPolicy::new(conflict.into(), deleted.into()),
    )?;

    let (tx, mut rx) = tokio::sync::mpsc::channel(100);
    let options = SyncOptions {
        timeout: timeout_secs.map(Duration::from_secs),
        progress: Some(tx),
        max_item_errors,
        ..SyncOptions::default()
    };
    let engine_handle = tokio::spawn(async move { engine.sync(&conduit, &options).await });

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap(),
    );
    pb.enable_steady_tick(Duration::from_millis(100));

    let mut tracker = ProgressTracker::new();
    while let Some(event) = rx.recv().await {
        tracker.update(event);
        let snap = tracker.snapshot();
        pb.set_message(format!(
            "Copied {} ({}), deleted {}, {} conflicts, {} failures",
            snap.items_copied,
            format_size(snap.bytes_copied, DECIMAL),
            snap.items_deleted,
            snap.conflicts,
            snap.items_failed,
        ));
    }

    let report = engine_handle.await??;
    pb.finish_and_clear();

    print_report(&report);
    Ok(report)
}

pub async fn cmd_status(
    source: Utf8PathBuf,
    sinks: Vec<Utf8PathBuf>,
    two_way: bool,
    json: bool,
    state_dir: Option<Utf8PathBuf>,
) -> Result<Vec<PairPlan>> {
    let engine = SyncEngine::new(Arc::new(open_store(state_dir)?));
    let conduit = build_conduit(&source, &sinks, mode_for(two_way), SyncPolicy::default())?;

    let plans = engine.plan(&conduit).await.context("Planning failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plans)?);
        return Ok(plans);
    }

    println!(":: Pending Changes");
    for plan in &plans {
        println!("   {}", plan.pair);
        if let Some(error) = &plan.error {
            println!("     Enumeration failed: {}", error);
            continue;
        }
        if plan.is_empty() {
            println!("     Up to date");
            continue;
        }
        println!("     Copy to sink:     {}", plan.delta.copy_to_sink.len());
        println!("     Copy to source:   {}", plan.delta.copy_to_source.len());
        println!("     Delete on sink:   {}", plan.delta.delete_on_sink.len());
        println!("     Delete on source: {}", plan.delta.delete_on_source.len());
        println!("     Conflicts:        {}", plan.delta.conflicts.len());
        println!("     Retired mappings: {}", plan.delta.retired.len());
    }

    Ok(plans)
}

pub fn cmd_mappings(
    source: Option<Utf8PathBuf>,
    sink: Option<Utf8PathBuf>,
    json: bool,
    state_dir: Option<Utf8PathBuf>,
) -> Result<()> {
    let store = open_store(state_dir)?;

    let (source, sink) = match (source, sink) {
        (Some(source), Some(sink)) => (source, sink),
        (None, None) => {
            let pairs = store.list_pairs().context("Failed to list pairs")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&pairs)?);
                return Ok(());
            }
            println!(":: Known Pairs");
            if pairs.is_empty() {
                println!("   (none)");
            }
            for pair in pairs {
                let rows = store.load_pair(&pair)?.len();
                println!("   {} ({} mappings)", pair, rows);
            }
            return Ok(());
        }
        _ => anyhow::bail!("--source and --sink go together"),
    };

    let pair = PairKey::new(absolute(&source)?, absolute(&sink)?);
    let table = store.load_pair(&pair).context("Failed to load mappings")?;
    let rows: Vec<&Mapping> = table.iter().collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!(":: Mappings for {}", pair);
    if rows.is_empty() {
        println!("   (none; run `osmosis sync` first)");
    }
    for mapping in rows {
        println!(
            "   '{}' <-> '{}' (mtime {} / {})",
            mapping.source_luid,
            mapping.sink_luid,
            mapping.source_marker.mtime,
            mapping.sink_marker.mtime,
        );
    }

    Ok(())
}

pub fn cmd_reset(
    source: Utf8PathBuf,
    sink: Utf8PathBuf,
    state_dir: Option<Utf8PathBuf>,
) -> Result<usize> {
    let store = open_store(state_dir)?;
    let pair = PairKey::new(absolute(&source)?, absolute(&sink)?);
    let removed = store.clear_pair(&pair).context("Failed to clear mappings")?;

    println!(":: Cleared {} mappings for {}", removed, pair);
    println!("   The next sync re-pairs items from scratch; same-named items are duplicated.");

    Ok(removed)
}

fn print_report(report: &SyncReport) {
    let totals = report.stats_total();

    println!("\n:: Sync Result");
    println!("   Status:    {:?}", report.status);
    println!(
        "   Copied:    {} ({})",
        totals.items_copied,
        format_size(totals.bytes_copied, DECIMAL)
    );
    println!("   Deleted:   {}", totals.items_deleted);
    println!("   Skipped:   {}", totals.items_skipped);
    println!("   Resolved:  {}", totals.conflicts_resolved);

    for refresh in &report.refresh_failures {
        println!("   Refresh:   '{}' failed: {}", refresh.uid, refresh.error);
    }
    if report.failure_count() > 0 {
        println!("   Failures:  {}", report.failure_count());
        for sink in &report.sinks {
            for failure in &sink.failures {
                println!("     [{:?}] '{}': {}", failure.op, failure.luid, failure.error);
            }
        }
    }
    let deferred = report.pending_conflicts().count();
    if deferred > 0 {
        println!("   Deferred:  {} (re-run with --conflict replace/duplicate to settle)", deferred);
        for conflict in report.pending_conflicts() {
            println!("     [{:?}] '{}'", conflict.kind, conflict.mapping.source_luid);
        }
    }
    if let Some(error) = &report.commit_error {
        println!("   Commit:    FAILED: {}", error);
    }
}

fn open_store(state_dir: Option<Utf8PathBuf>) -> Result<RedbMappingStore> {
    let dir = match state_dir {
        Some(dir) => dir,
        None => default_state_dir()?,
    };
    Ok(RedbMappingStore::in_dir(&dir))
}

fn default_state_dir() -> Result<Utf8PathBuf> {
    let proj_dirs = ProjectDirs::from(QUALIFIER, ORG, APP)
        .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?;
    Utf8PathBuf::from_path_buf(proj_dirs.data_dir().to_path_buf())
        .map_err(|path| anyhow::anyhow!("Data directory is not UTF-8: {}", path.display()))
}

fn build_conduit(
    source: &Utf8Path,
    sinks: &[Utf8PathBuf],
    mode: SyncMode,
    policy: SyncPolicy,
) -> Result<Conduit> {
    let (source_capability, sink_capability) = match mode {
        SyncMode::OneWay => (Capability::Source, Capability::Sink),
        SyncMode::TwoWay => (Capability::TwoWay, Capability::TwoWay),
    };

    let mut builder = Conduit::builder(Arc::new(folder(source, source_capability)?));
    for sink in sinks {
        builder = builder.sink(Arc::new(folder(sink, sink_capability)?));
    }
    builder
        .mode(mode)
        .policy(policy)
        .build()
        .context("Invalid sync configuration")
}

fn folder(path: &Utf8Path, capability: Capability) -> Result<FolderProvider> {
    let root = absolute(path)?;
    if !root.is_dir() {
        anyhow::bail!("{} is not a directory", root);
    }
    Ok(FolderProvider::new(root.as_str(), root.clone()).with_capability(capability))
}

/// Lexically absolute path, usable as a stable provider uid. Unlike
/// `canonicalize` this works for paths whose folder is gone, so `mappings`
/// and `reset` still address pairs after a folder is deleted.
fn absolute(path: &Utf8Path) -> Result<Utf8PathBuf> {
    let absolute = std::path::absolute(path.as_std_path())
        .with_context(|| format!("Cannot resolve {}", path))?;
    Utf8PathBuf::from_path_buf(absolute)
        .map_err(|path| anyhow::anyhow!("Path is not UTF-8: {}", path.display()))
}
