use std::sync::Arc;

use osmosis_core::mapping::PairKey;
use osmosis_core::policy::{ConflictPolicy, DeletedPolicy, SyncPolicy};
use osmosis_engine::{Conduit, SyncEngine, SyncOptions, SyncStatus};
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

#[tokio::test]
async fn fresh_pass_copies_everything_and_reruns_are_noops() {
    let (engine, store) = engine();
    let source = Arc::new(MemoryProvider::new("src"));
    let sink = Arc::new(MemoryProvider::new("dst"));
    for n in 0..5u8 {
        source.seed(format!("item-{n}.txt"), vec![n]);
    }
    let conduit = one_way(&source, &sink);

    let report = engine
        .sync(&conduit, &SyncOptions::default())
        .await
        .expect("first pass");
    assert_eq!(report.status, SyncStatus::Completed);
    assert_eq!(report.stats_total().items_copied, 5);
    assert_eq!(sink.len(), 5);
    assert_eq!(sink.call_counts().put, 5);

    let table = store.load_pair(&PairKey::new("src", "dst")).expect("table");
    assert_eq!(table.len(), 5);

    // Unchanged corpus: the second pass must not touch the sink at all.
    let report = engine
        .sync(&conduit, &SyncOptions::default())
        .await
        .expect("second pass");
    assert_eq!(report.status, SyncStatus::Completed);
    assert_eq!(report.stats_total().items_copied, 0);
    assert_eq!(sink.call_counts().put, 5);
    assert_eq!(sink.call_counts().delete, 0);

    // Reports serialize, for UIs and --json consumers.
    let json = serde_json::to_string(&report).expect("report json");
    assert!(json.contains("\"completed\""));
}

#[tokio::test]
async fn source_edit_overwrites_the_mapped_sink_item() {
    let (engine, _store) = engine();
    let source = Arc::new(MemoryProvider::new("src"));
    let sink = Arc::new(MemoryProvider::new("dst"));
    source.seed("note.txt", b"v1".to_vec());
    let conduit = one_way(&source, &sink);

    engine
        .sync(&conduit, &SyncOptions::default())
        .await
        .expect("seed pass");
    source.seed("note.txt", b"v2".to_vec());

    let report = engine
        .sync(&conduit, &SyncOptions::default())
        .await
        .expect("edit pass");
    assert_eq!(report.status, SyncStatus::Completed);
    assert_eq!(report.stats_total().items_copied, 1);
    assert_eq!(sink.payload("note.txt").expect("payload"), b"v2");
    assert_eq!(sink.len(), 1, "overwrite must not grow the sink");
}

#[tokio::test]
async fn source_deletions_follow_the_deleted_policy() {
    // Default policy (skip): the sink keeps its copy and the mapping stays,
    // so the deletion is re-detected on every pass until policy says go.
    let (engine, store) = engine();
    let source = Arc::new(MemoryProvider::new("src"));
    let sink = Arc::new(MemoryProvider::new("dst"));
    source.seed("keep.txt", b"k".to_vec());
    source.seed("gone.txt", b"g".to_vec());
    let conduit = one_way(&source, &sink);
    engine
        .sync(&conduit, &SyncOptions::default())
        .await
        .expect("seed pass");

    source.remove_item("gone.txt");
    let report = engine
        .sync(&conduit, &SyncOptions::default())
        .await
        .expect("skip pass");
    assert_eq!(report.status, SyncStatus::Completed);
    assert_eq!(report.stats_total().items_skipped, 1);
    assert!(sink.contains("gone.txt"));
    assert_eq!(
        store
            .load_pair(&PairKey::new("src", "dst"))
            .expect("table")
            .len(),
        2
    );

    // Replace: the deletion propagates and the mapping is retired.
    let replacing = Conduit::builder(source.clone())
        .sink(sink.clone())
        .policy(SyncPolicy::new(ConflictPolicy::Skip, DeletedPolicy::Replace))
        .build()
        .expect("conduit");
    let report = engine
        .sync(&replacing, &SyncOptions::default())
        .await
        .expect("replace pass");
    assert_eq!(report.status, SyncStatus::Completed);
    assert_eq!(report.stats_total().items_deleted, 1);
    assert!(!sink.contains("gone.txt"));
    assert!(sink.contains("keep.txt"));
    assert_eq!(
        store
            .load_pair(&PairKey::new("src", "dst"))
            .expect("table")
            .len(),
        1
    );
}

#[tokio::test]
async fn sink_side_changes_are_never_enumerated() {
    let (engine, _store) = engine();
    let source = Arc::new(MemoryProvider::new("src"));
    let sink = Arc::new(MemoryProvider::new("dst"));
    source.seed("note.txt", b"original".to_vec());
    let conduit = one_way(&source, &sink);
    engine
        .sync(&conduit, &SyncOptions::default())
        .await
        .expect("seed pass");

    // Local tampering and strays on the sink are invisible one-way.
    sink.seed("note.txt", b"tampered".to_vec());
    sink.seed("stray.txt", b"stray".to_vec());

    let report = engine
        .sync(&conduit, &SyncOptions::default())
        .await
        .expect("second pass");
    assert_eq!(report.status, SyncStatus::Completed);
    assert_eq!(report.stats_total().items_copied, 0);
    assert_eq!(sink.payload("note.txt").expect("payload"), b"tampered");
    assert!(sink.contains("stray.txt"));
    assert_eq!(sink.call_counts().get_all, 0, "one-way never lists the sink");
}

#[tokio::test]
async fn overlapping_passes_on_one_pair_fail_fast() {
    use async_trait::async_trait;
    use osmosis_core::provider::{DataProvider, ProviderError};
    use osmosis_core::{Capability, FinishStatus, Item, Luid, ProviderConfig};
    use tokio::sync::Notify;

    // Parks in refresh until released, and announces when it got there, so
    // the test can overlap a second pass with certainty.
    struct Parked {
        inner: MemoryProvider,
        reached: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl DataProvider for Parked {
        fn uid(&self) -> &str {
            self.inner.uid()
        }
        fn capability(&self) -> Capability {
            self.inner.capability()
        }
        fn set_configuration(&mut self, config: &ProviderConfig) -> Result<(), ProviderError> {
            self.inner.set_configuration(config)
        }
        fn get_configuration(&self) -> ProviderConfig {
            self.inner.get_configuration()
        }
        async fn refresh(&self) -> Result<(), ProviderError> {
            self.reached.notify_one();
            self.release.notified().await;
            self.inner.refresh().await
        }
        async fn get_all(&self) -> Result<Vec<Luid>, ProviderError> {
            self.inner.get_all().await
        }
        async fn get(&self, luid: &str) -> Result<Item, ProviderError> {
            self.inner.get(luid).await
        }
        async fn put(
            &self,
            item: &Item,
            overwrite: bool,
            existing: Option<&str>,
        ) -> Result<Luid, ProviderError> {
            self.inner.put(item, overwrite, existing).await
        }
        async fn delete(&self, luid: &str) -> Result<(), ProviderError> {
            self.inner.delete(luid).await
        }
        async fn finish(&self, status: FinishStatus) -> Result<(), ProviderError> {
            self.inner.finish(status).await
        }
    }

    let (engine, _store) = engine();
    let reached = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let inner = MemoryProvider::new("src");
    inner.seed("a.txt", b"a".to_vec());
    let source = Arc::new(Parked {
        inner,
        reached: reached.clone(),
        release: release.clone(),
    });
    let sink = Arc::new(MemoryProvider::new("dst"));
    let conduit = Arc::new(
        Conduit::builder(source)
            .sink(sink.clone())
            .build()
            .expect("conduit"),
    );

    let engine = Arc::new(engine);
    let first = {
        let engine = engine.clone();
        let conduit = conduit.clone();
        tokio::spawn(async move { engine.sync(&conduit, &SyncOptions::default()).await })
    };
    // Once refresh is reached, the first pass holds the pair lock.
    reached.notified().await;

    let second = engine.sync(&conduit, &SyncOptions::default()).await;
    match second {
        Err(osmosis_engine::SyncError::PairBusy(pair)) => {
            assert_eq!(pair, PairKey::new("src", "dst"));
        }
        other => panic!("expected PairBusy, got {other:?}"),
    }

    release.notify_one();
    let report = first.await.expect("join").expect("first pass");
    assert_eq!(report.status, SyncStatus::Completed);
    assert_eq!(sink.len(), 1);

    // With the lock released, a fresh pass goes through.
    release.notify_one();
    let retried = {
        let engine = engine.clone();
        let conduit = conduit.clone();
        tokio::spawn(async move { engine.sync(&conduit, &SyncOptions::default()).await })
    };
    let report = retried.await.expect("join").expect("retried pass");
    assert_eq!(report.status, SyncStatus::Completed);
}
