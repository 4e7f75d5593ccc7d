use camino::Utf8PathBuf;
use osmosis_core::mapping::{Mapping, MappingTable, PairKey};
use osmosis_core::Marker;
use osmosis_persistence::{MappingStore, RedbMappingStore};

#[test]
fn corrupt_store_is_quarantined_and_recreated_empty() {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    let db_path = root.join("osmosis.redb");

    std::fs::write(&db_path, b"definitely-not-a-redb-database").unwrap();
    assert!(db_path.exists());

    let store = RedbMappingStore::in_dir(&root);
    let pair = PairKey::new("left", "right");

    // First touch quarantines the bad file and starts over empty.
    let loaded = store.load_pair(&pair).unwrap();
    assert!(loaded.is_empty());

    let quarantines: Vec<_> = std::fs::read_dir(&root)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|n| n.starts_with("osmosis.redb.corrupt."))
        .collect();
    assert_eq!(quarantines.len(), 1, "expected exactly one quarantine");
    assert!(db_path.exists(), "fresh store should replace the corrupt one");

    // The fresh store is fully usable.
    let mut table = MappingTable::new();
    table.put(Mapping::new(
        "a.txt",
        "a.txt",
        Marker::new(1, "x"),
        Marker::new(1, "y"),
    ));
    store.commit_pairs(&[(pair.clone(), table)]).unwrap();
    assert_eq!(store.load_pair(&pair).unwrap().len(), 1);
}
