use camino::{Utf8Path, Utf8PathBuf};
use osmosis_cli::{commands, CliConflictPolicy, CliDeletedPolicy};
use osmosis_core::delta::ConflictKind;
use osmosis_engine::SyncStatus;
use std::fs;
use std::time::{Duration, SystemTime};
use tempfile::tempdir;

fn utf8(dir: &tempfile::TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 tempdir")
}

fn backdate(path: &Utf8Path, seconds: u64) {
    let then = SystemTime::now() - Duration::from_secs(seconds);
    filetime::set_file_mtime(path.as_std_path(), filetime::FileTime::from_system_time(then))
        .expect("set mtime");
}

async fn sync(
    source: &Utf8Path,
    sink: &Utf8Path,
    two_way: bool,
    conflict: CliConflictPolicy,
    state: &Utf8Path,
) -> osmosis_engine::SyncReport {
    commands::cmd_sync(
        source.to_owned(),
        vec![sink.to_owned()],
        two_way,
        conflict,
        CliDeletedPolicy::Skip,
        None,
        None,
        Some(state.to_owned()),
    )
    .await
    .expect("sync pass failed")
}

#[tokio::test]
async fn full_user_lifecycle_workflow() {
    let state_dir = tempdir().expect("state dir");
    let left_dir = tempdir().expect("left dir");
    let right_dir = tempdir().expect("right dir");
    let state = utf8(&state_dir);
    let left = utf8(&left_dir);
    let right = utf8(&right_dir);

    fs::write(left.join("alpha.txt"), b"alpha-v1").expect("seed alpha");
    fs::create_dir_all(left.join("docs")).expect("seed docs");
    fs::write(left.join("docs/beta.md"), b"beta-v1").expect("seed beta");

    // Phase 1: fresh one-way sync copies the whole tree.
    let report = sync(&left, &right, false, CliConflictPolicy::Skip, &state).await;
    assert_eq!(report.status, SyncStatus::Completed);
    assert_eq!(report.stats_total().items_copied, 2);
    assert_eq!(
        fs::read(right.join("alpha.txt")).expect("alpha landed"),
        b"alpha-v1"
    );
    assert_eq!(
        fs::read(right.join("docs/beta.md")).expect("beta landed"),
        b"beta-v1"
    );

    // Phase 2: warm preview reports nothing to do, mappings are inspectable.
    let plans = commands::cmd_status(
        left.clone(),
        vec![right.clone()],
        false,
        true,
        Some(state.clone()),
    )
    .await
    .expect("Phase 2 status failed");
    assert_eq!(plans.len(), 1);
    assert!(plans[0].is_empty());

    commands::cmd_mappings(None, None, false, Some(state.clone())).expect("list pairs");
    commands::cmd_mappings(
        Some(left.clone()),
        Some(right.clone()),
        true,
        Some(state.clone()),
    )
    .expect("dump pair");

    // Phase 3: a source edit shows up in the preview, then syncs over.
    fs::write(left.join("alpha.txt"), b"alpha-v2").expect("edit alpha");
    let plans = commands::cmd_status(
        left.clone(),
        vec![right.clone()],
        false,
        false,
        Some(state.clone()),
    )
    .await
    .expect("Phase 3 status failed");
    assert_eq!(plans[0].delta.copy_to_sink, vec!["alpha.txt".to_string()]);

    let report = sync(&left, &right, false, CliConflictPolicy::Skip, &state).await;
    assert_eq!(report.stats_total().items_copied, 1);
    assert_eq!(
        fs::read(right.join("alpha.txt")).expect("alpha updated"),
        b"alpha-v2"
    );

    // Phase 4: both ends edit the same item; `ask` defers and nothing moves.
    fs::write(left.join("docs/beta.md"), b"beta-left").expect("edit beta left");
    fs::write(right.join("docs/beta.md"), b"beta-right").expect("edit beta right");
    backdate(&right.join("docs/beta.md"), 120);

    let report = sync(&left, &right, true, CliConflictPolicy::Ask, &state).await;
    assert_eq!(report.status, SyncStatus::Conflict);
    let pending: Vec<_> = report.pending_conflicts().collect();
    assert_eq!(pending.len(), 1);
    assert!(matches!(pending[0].kind, ConflictKind::ModifiedModified));
    assert_eq!(
        fs::read(left.join("docs/beta.md")).expect("left untouched"),
        b"beta-left"
    );
    assert_eq!(
        fs::read(right.join("docs/beta.md")).expect("right untouched"),
        b"beta-right"
    );

    // Phase 5: `replace` under two-way lets the newer side win.
    let report = sync(&left, &right, true, CliConflictPolicy::Replace, &state).await;
    assert_eq!(report.status, SyncStatus::Completed);
    assert_eq!(report.stats_total().conflicts_resolved, 1);
    assert_eq!(
        fs::read(right.join("docs/beta.md")).expect("right converged"),
        b"beta-left"
    );
    assert_eq!(
        fs::read(left.join("docs/beta.md")).expect("left kept"),
        b"beta-left"
    );

    // Phase 6: reset forgets the pairings; the next pass re-pairs from
    // scratch, so same-named twins get duplicated instead of overwritten.
    let removed = commands::cmd_reset(left.clone(), right.clone(), Some(state.clone()))
        .expect("Phase 6 reset failed");
    assert_eq!(removed, 2);

    let report = sync(&left, &right, false, CliConflictPolicy::Skip, &state).await;
    assert_eq!(report.status, SyncStatus::Completed);
    assert_eq!(report.stats_total().items_copied, 2);
    assert_eq!(
        fs::read(right.join("alpha (1).txt")).expect("alpha duplicated"),
        b"alpha-v2"
    );
    assert_eq!(
        fs::read(right.join("docs/beta (1).md")).expect("beta duplicated"),
        b"beta-left"
    );

    // The re-paired state is steady again.
    let plans = commands::cmd_status(
        left.clone(),
        vec![right.clone()],
        false,
        true,
        Some(state.clone()),
    )
    .await
    .expect("final status failed");
    assert!(plans[0].is_empty());
}
