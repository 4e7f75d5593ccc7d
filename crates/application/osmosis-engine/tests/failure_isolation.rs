use std::sync::Arc;

use osmosis_core::mapping::PairKey;
use osmosis_engine::{Conduit, SinkReport, SyncEngine, SyncOptions, SyncReport, SyncStatus, TransferOp};
use osmosis_persistence::{MappingStore, MemoryMappingStore};
use osmosis_providers::MemoryProvider;

fn engine() -> (SyncEngine, Arc<MemoryMappingStore>) {
    let store = Arc::new(MemoryMappingStore::new());
    (SyncEngine::new(store.clone()), store)
}

fn one_way(source: &Arc<MemoryProvider>, sink: &Arc<MemoryProvider>) -> Conduit {
    Conduit::builder(source.clone())
        .sink(sink.clone())
        .build()
        .expect("conduit")
}

fn sink_report<'r>(report: &'r SyncReport, uid: &str) -> &'r SinkReport {
    report
        .sinks
        .iter()
        .find(|s| s.sink_uid == uid)
        .expect("sink report")
}

#[tokio::test]
async fn put_failures_stay_per_item_and_the_rest_lands() {
    let (engine, store) = engine();
    let source = Arc::new(MemoryProvider::new("src"));
    let sink = Arc::new(MemoryProvider::new("dst"));
    for n in 0..5u8 {
        source.seed(format!("item-{n}.txt"), vec![n]);
    }
    sink.fail_puts_after(2);
    let conduit = one_way(&source, &sink);

    let report = engine
        .sync(&conduit, &SyncOptions::default())
        .await
        .expect("degraded pass");
    assert_eq!(report.status, SyncStatus::Error);
    assert!(report.errored());
    assert!(!report.aborted());
    assert_eq!(report.stats_total().items_copied, 2);
    assert_eq!(report.failure_count(), 3);
    for failure in &sink_report(&report, "dst").failures {
        assert_eq!(failure.op, TransferOp::Copy);
        assert!(failure.error.contains("injected put failure"));
    }

    // What landed is mapped and stays mapped; what failed is not.
    let table = store.load_pair(&PairKey::new("src", "dst")).expect("table");
    assert_eq!(table.len(), 2);
    assert_eq!(sink.len(), 2);

    // Once the sink recovers, the next pass moves exactly the leftovers.
    sink.clear_faults();
    let report = engine
        .sync(&conduit, &SyncOptions::default())
        .await
        .expect("recovery pass");
    assert_eq!(report.status, SyncStatus::Completed);
    assert_eq!(report.stats_total().items_copied, 3);
    assert_eq!(sink.len(), 5);
    assert_eq!(
        store
            .load_pair(&PairKey::new("src", "dst"))
            .expect("table")
            .len(),
        5
    );
}

#[tokio::test]
async fn unreadable_mapped_items_do_not_read_as_deletions() {
    let (engine, store) = engine();
    let source = Arc::new(MemoryProvider::new("src"));
    let sink = Arc::new(MemoryProvider::new("dst"));
    source.seed("a.txt", b"a".to_vec());
    source.seed("b.txt", b"b".to_vec());
    let conduit = one_way(&source, &sink);
    engine
        .sync(&conduit, &SyncOptions::default())
        .await
        .expect("seed pass");

    source.fail_get("a.txt");
    let report = engine
        .sync(&conduit, &SyncOptions::default())
        .await
        .expect("degraded pass");
    assert_eq!(report.status, SyncStatus::Error);
    assert_eq!(report.failure_count(), 1);
    assert_eq!(sink_report(&report, "dst").failures[0].op, TransferOp::Read);
    // The unreadable item is held at its recorded marker: no deletion is
    // inferred and nothing is transferred for it.
    assert_eq!(sink.call_counts().delete, 0);
    assert!(sink.contains("a.txt"));
    assert_eq!(
        store
            .load_pair(&PairKey::new("src", "dst"))
            .expect("table")
            .len(),
        2
    );

    source.clear_faults();
    let report = engine
        .sync(&conduit, &SyncOptions::default())
        .await
        .expect("recovery pass");
    assert_eq!(report.status, SyncStatus::Completed);
    assert_eq!(report.stats_total().items_copied, 0);
}

#[tokio::test]
async fn unreadable_new_items_sit_out_the_pass() {
    let (engine, store) = engine();
    let source = Arc::new(MemoryProvider::new("src"));
    let sink = Arc::new(MemoryProvider::new("dst"));
    source.seed("fine.txt", b"f".to_vec());
    source.seed("broken.txt", b"x".to_vec());
    source.fail_get("broken.txt");
    let conduit = one_way(&source, &sink);

    let report = engine
        .sync(&conduit, &SyncOptions::default())
        .await
        .expect("degraded pass");
    assert_eq!(report.status, SyncStatus::Error);
    assert_eq!(report.stats_total().items_copied, 1);
    assert_eq!(report.failure_count(), 1);
    assert!(sink.contains("fine.txt"));
    assert!(!sink.contains("broken.txt"));
    // No mapping exists for an item that was never materialized.
    assert_eq!(
        store
            .load_pair(&PairKey::new("src", "dst"))
            .expect("table")
            .len(),
        1
    );

    source.clear_faults();
    let report = engine
        .sync(&conduit, &SyncOptions::default())
        .await
        .expect("recovery pass");
    assert_eq!(report.status, SyncStatus::Completed);
    assert_eq!(report.stats_total().items_copied, 1);
    assert!(sink.contains("broken.txt"));
}

#[tokio::test]
async fn the_failure_limit_escalates_to_an_abort() {
    let (engine, store) = engine();
    let source = Arc::new(MemoryProvider::new("src"));
    let sink = Arc::new(MemoryProvider::new("dst"));
    for n in 0..5u8 {
        source.seed(format!("item-{n}.txt"), vec![n]);
    }
    sink.fail_puts_after(0);
    let conduit = one_way(&source, &sink);

    let options = SyncOptions {
        max_item_errors: Some(2),
        ..SyncOptions::default()
    };
    let report = engine.sync(&conduit, &options).await.expect("pass");
    assert_eq!(report.status, SyncStatus::Aborted);
    assert!(report.aborted());
    // The limit cuts the pass off: failures stop accruing at the cap.
    assert_eq!(report.failure_count(), 2);
    assert_eq!(sink.call_counts().put, 2);

    // An aborted pass commits nothing.
    assert!(store
        .load_pair(&PairKey::new("src", "dst"))
        .expect("table")
        .is_empty());
    let finish = *sink.finishes().last().expect("finish");
    assert!(finish.aborted);
    assert!(finish.errored);
}

#[tokio::test]
async fn a_failing_sink_never_contaminates_its_sibling() {
    let (engine, store) = engine();
    let source = Arc::new(MemoryProvider::new("src"));
    let good = Arc::new(MemoryProvider::new("good"));
    let bad = Arc::new(MemoryProvider::new("bad"));
    source.seed("one.txt", b"11".to_vec());
    source.seed("two.txt", b"22".to_vec());
    bad.fail_puts_after(0);
    let conduit = Conduit::builder(source.clone())
        .sink(good.clone())
        .sink(bad.clone())
        .build()
        .expect("conduit");

    let report = engine
        .sync(&conduit, &SyncOptions::default())
        .await
        .expect("fan-out pass");
    assert_eq!(report.status, SyncStatus::Error);

    let healthy = sink_report(&report, "good");
    assert_eq!(healthy.stats.items_copied, 2);
    assert_eq!(healthy.stats.bytes_copied, 4);
    assert!(healthy.failures.is_empty());

    let broken = sink_report(&report, "bad");
    assert_eq!(broken.stats.items_copied, 0);
    assert_eq!(broken.failures.len(), 2);

    assert_eq!(good.len(), 2);
    assert_eq!(bad.len(), 0);
    assert_eq!(
        store
            .load_pair(&PairKey::new("src", "good"))
            .expect("table")
            .len(),
        2
    );
    assert!(store
        .load_pair(&PairKey::new("src", "bad"))
        .expect("table")
        .is_empty());
}
