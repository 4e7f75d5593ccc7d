use osmosis_core::mapping::{MappingTable, PairKey};

pub const OSMOSIS_REDB_FILENAME: &str = "osmosis.redb";
pub const CURRENT_SCHEMA: u32 = 1;

/// Persistent home of mapping partitions, one partition per (source, sink)
/// pair.
///
/// `commit_pairs` must be atomic across every pair it is handed: a sync
/// pass either lands all of its mapping updates or none of them, so a
/// retried pass re-diffs from the last known-good state.
pub trait MappingStore: Send + Sync {
    /// Load one pair's partition. An unknown pair yields an empty table.
    fn load_pair(&self, pair: &PairKey) -> Result<MappingTable, crate::StorageError>;

    /// Replace the stored partitions with the given tables, atomically.
    fn commit_pairs(&self, updates: &[(PairKey, MappingTable)]) -> Result<(), crate::StorageError>;

    fn list_pairs(&self) -> Result<Vec<PairKey>, crate::StorageError>;

    /// Drop every mapping for the pair, forcing the next pass to re-sync
    /// from scratch. Returns how many mappings were removed.
    fn clear_pair(&self, pair: &PairKey) -> Result<usize, crate::StorageError>;
}
