use crate::api::MappingStore;
use crate::StorageError;
use osmosis_core::mapping::{MappingTable, PairKey};
use std::collections::HashMap;
use std::sync::Mutex;

/// Volatile [`MappingStore`] backed by a process-local map.
///
/// Every pass starts from whatever the previous pass committed in this
/// process and nothing survives a restart, which makes every item look
/// new again. Useful for tests and for one-shot syncs where persisting
/// pairings is not wanted.
#[derive(Default)]
pub struct MemoryMappingStore {
    pairs: Mutex<HashMap<PairKey, MappingTable>>,
}

impl MemoryMappingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MappingStore for MemoryMappingStore {
    fn load_pair(&self, pair: &PairKey) -> Result<MappingTable, StorageError> {
        let pairs = self.pairs.lock().expect("mapping store lock poisoned");
        Ok(pairs.get(pair).cloned().unwrap_or_default())
    }

    fn commit_pairs(&self, updates: &[(PairKey, MappingTable)]) -> Result<(), StorageError> {
        let mut pairs = self.pairs.lock().expect("mapping store lock poisoned");
        for (pair, table) in updates {
            pairs.insert(pair.clone(), table.clone());
        }
        Ok(())
    }

    fn list_pairs(&self) -> Result<Vec<PairKey>, StorageError> {
        let pairs = self.pairs.lock().expect("mapping store lock poisoned");
        let mut keys: Vec<PairKey> = pairs.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    fn clear_pair(&self, pair: &PairKey) -> Result<usize, StorageError> {
        let mut pairs = self.pairs.lock().expect("mapping store lock poisoned");
        Ok(pairs.remove(pair).map(|table| table.len()).unwrap_or(0))
    }
}
