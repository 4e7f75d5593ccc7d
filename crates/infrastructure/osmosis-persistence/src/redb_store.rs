use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, OnceLock};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use redb::{Database, ReadableTable, TableDefinition};

use osmosis_core::mapping::{MappingTable, PairKey};

use crate::api::{MappingStore, CURRENT_SCHEMA, OSMOSIS_REDB_FILENAME};
use crate::codec::{decode_mapping, encode_mapping};
use crate::maintenance::quarantine_corrupt_file;
use crate::pair_key::MappingKey;
use crate::StorageError;

const META: TableDefinition<&str, &str> = TableDefinition::new("meta");
const MAPPINGS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("mappings");

const META_FORMAT_KEY: &str = "format";
const META_FORMAT_VALUE: &str = "osmosis-redb";
const META_SCHEMA_VERSION: &str = "schema_version";
const META_CREATED_AT: &str = "created_at";
const META_LAST_SYNC_AT: &str = "last_sync_at";

/// Durable [`MappingStore`] on a single redb file.
///
/// A missing file reads as an empty store; an unreadable one is quarantined
/// and replaced with a fresh empty store, so every pass degrades to "treat
/// everything as new" rather than failing. A file written by a newer schema
/// is the one case left alone: it is reported as [`StorageError::NewerSchema`]
/// and never quarantined.
#[derive(Debug, Clone)]
pub struct RedbMappingStore {
    path: Utf8PathBuf,
}

impl RedbMappingStore {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store under `dir` with the default file name.
    pub fn in_dir(dir: &Utf8Path) -> Self {
        Self::new(dir.join(OSMOSIS_REDB_FILENAME))
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn is_corrupt_open_error(err: &redb::DatabaseError) -> bool {
        match err {
            redb::DatabaseError::Storage(storage) => match storage {
                redb::StorageError::Corrupted(_) => true,
                redb::StorageError::Io(ioe) => matches!(
                    ioe.kind(),
                    std::io::ErrorKind::InvalidData | std::io::ErrorKind::UnexpectedEof
                ),
                _ => false,
            },
            _ => false,
        }
    }

    fn db_cache() -> &'static Mutex<HashMap<Utf8PathBuf, Arc<Database>>> {
        static CACHE: OnceLock<Mutex<HashMap<Utf8PathBuf, Arc<Database>>>> = OnceLock::new();
        CACHE.get_or_init(|| Mutex::new(HashMap::new()))
    }

    fn open_or_create(&self) -> Result<Arc<Database>, StorageError> {
        let path = &self.path;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut cache = Self::db_cache().lock().expect("db cache lock poisoned");
        if let Some(existing) = cache.get(path) {
            if !path.exists() {
                cache.remove(path);
            } else {
                return Ok(existing.clone());
            }
        }

        let db = if path.exists() {
            match Database::open(path.as_std_path()) {
                Ok(db) => db,
                Err(redb::DatabaseError::DatabaseAlreadyOpen) => {
                    return Err(StorageError::DatabaseAlreadyOpen);
                }
                Err(e) if Self::is_corrupt_open_error(&e) => {
                    quarantine_corrupt_file(path)?;
                    Database::create(path.as_std_path())?
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            Database::create(path.as_std_path())?
        };

        let db = match self.ensure_schema(&db) {
            Ok(()) => db,
            Err(StorageError::Corrupt) => {
                drop(db);
                quarantine_corrupt_file(path)?;
                let fresh = Database::create(path.as_std_path())?;
                self.ensure_schema(&fresh)?;
                fresh
            }
            Err(e) => {
                drop(db);
                return Err(e);
            }
        };

        let db = Arc::new(db);
        cache.insert(path.clone(), db.clone());
        Ok(db)
    }

    fn ensure_schema(&self, db: &Database) -> Result<(), StorageError> {
        // Create tables and required meta keys on first open.
        let write_tx = db.begin_write()?;
        {
            let mut meta = write_tx.open_table(META)?;
            let format: Option<String> = meta.get(META_FORMAT_KEY)?.map(|g| g.value().to_string());
            if format.is_none() {
                let schema_version = CURRENT_SCHEMA.to_string();
                let created_at = Utc::now().to_rfc3339();
                meta.insert(META_FORMAT_KEY, META_FORMAT_VALUE)?;
                meta.insert(META_SCHEMA_VERSION, schema_version.as_str())?;
                meta.insert(META_CREATED_AT, created_at.as_str())?;
            } else if format.as_deref() != Some(META_FORMAT_VALUE) {
                return Err(StorageError::Corrupt);
            }
        }
        let _ = write_tx.open_table(MAPPINGS)?;
        write_tx.commit()?;

        // Validate schema version.
        let read_tx = db.begin_read()?;
        let meta = read_tx.open_table(META)?;
        let schema_version = meta
            .get(META_SCHEMA_VERSION)?
            .and_then(|g| g.value().parse::<u32>().ok())
            .unwrap_or(0);
        if schema_version == 0 {
            return Err(StorageError::Corrupt);
        }
        if schema_version > CURRENT_SCHEMA {
            return Err(StorageError::NewerSchema {
                found: schema_version,
                supported: CURRENT_SCHEMA,
            });
        }
        if schema_version != CURRENT_SCHEMA {
            return Err(StorageError::Corrupt);
        }
        Ok(())
    }
}

impl MappingStore for RedbMappingStore {
    fn load_pair(&self, pair: &PairKey) -> Result<MappingTable, StorageError> {
        if !self.path.exists() {
            return Ok(MappingTable::new());
        }
        let db = self.open_or_create()?;
        let (start, end) = MappingKey::range_for_pair(pair)?;
        let read_tx = db.begin_read()?;
        let table = read_tx.open_table(MAPPINGS)?;

        let mut rows = Vec::new();
        for row in table.range(start.as_slice()..end.as_slice())? {
            let (_, v) = row?;
            rows.push(decode_mapping(v.value())?);
        }
        Ok(MappingTable::from_rows(rows))
    }

    fn commit_pairs(&self, updates: &[(PairKey, MappingTable)]) -> Result<(), StorageError> {
        let db = self.open_or_create()?;
        let write_tx = db.begin_write()?;
        {
            let mut table = write_tx.open_table(MAPPINGS)?;
            for (pair, mappings) in updates {
                // Replace the pair's partition wholesale: delete stale rows,
                // then write the new snapshot.
                let (start, end) = MappingKey::range_for_pair(pair)?;
                let mut stale = Vec::new();
                for row in table.range(start.as_slice()..end.as_slice())? {
                    let (k, _) = row?;
                    stale.push(k.value().to_vec());
                }
                for k in stale {
                    let _ = table.remove(k.as_slice())?;
                }
                for mapping in mappings.iter() {
                    let key = MappingKey::new(pair, &mapping.source_luid).to_bytes()?;
                    let value = encode_mapping(mapping)?;
                    table.insert(key.as_slice(), value.as_slice())?;
                }
            }

            let ts = Utc::now().to_rfc3339();
            let mut meta = write_tx.open_table(META)?;
            meta.insert(META_LAST_SYNC_AT, ts.as_str())?;
        }
        write_tx.commit()?;
        tracing::debug!(pairs = updates.len(), "committed mapping snapshot");
        Ok(())
    }

    fn list_pairs(&self) -> Result<Vec<PairKey>, StorageError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let db = self.open_or_create()?;
        let read_tx = db.begin_read()?;
        let table = read_tx.open_table(MAPPINGS)?;

        let mut pairs = BTreeSet::new();
        for row in table.iter()? {
            let (k, _) = row?;
            if let Some(pair) = MappingKey::pair_from_key(k.value()) {
                pairs.insert(pair);
            }
        }
        Ok(pairs.into_iter().collect())
    }

    fn clear_pair(&self, pair: &PairKey) -> Result<usize, StorageError> {
        if !self.path.exists() {
            return Ok(0);
        }
        let db = self.open_or_create()?;
        let (start, end) = MappingKey::range_for_pair(pair)?;
        let write_tx = db.begin_write()?;
        let removed = {
            let mut table = write_tx.open_table(MAPPINGS)?;
            let mut keys = Vec::new();
            for row in table.range(start.as_slice()..end.as_slice())? {
                let (k, _) = row?;
                keys.push(k.value().to_vec());
            }
            for k in &keys {
                let _ = table.remove(k.as_slice())?;
            }
            keys.len()
        };
        write_tx.commit()?;
        Ok(removed)
    }
}
