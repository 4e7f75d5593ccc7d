use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::sync::Mutex;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use rayon::prelude::*;
use tracing::{debug, info};
use walkdir::WalkDir;

use osmosis_core::provider::{DataProvider, ProviderError};
use osmosis_core::{Capability, FinishStatus, Item, Luid, Marker, ProviderConfig};

const CONFIG_ROOT: &str = "root";
const CONFIG_UID: &str = "uid";
const CONFIG_CAPABILITY: &str = "capability";

/// Dataprovider over a directory tree. Luids are slash-separated paths
/// relative to the root; hidden entries (dot-prefixed names) are ignored.
///
/// `refresh` walks the tree once and fingerprints every file off the async
/// runtime; the snapshot it builds backs `get_all` and marker lookups for
/// the rest of the pass. Writes land via a temp file and rename so a
/// half-written item is never observable under its final name.
pub struct FolderProvider {
    uid: String,
    capability: Capability,
    root: Utf8PathBuf,
    snapshot: Mutex<Option<BTreeMap<Luid, Marker>>>,
}

impl FolderProvider {
    pub fn new(uid: impl Into<String>, root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            uid: uid.into(),
            capability: Capability::TwoWay,
            root: root.into(),
            snapshot: Mutex::new(None),
        }
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capability = capability;
        self
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn mtime(meta: &fs::Metadata) -> u64 {
        meta.modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    /// Luids are wire format: forward slashes, relative, no traversal.
    fn validate_luid(luid: &str) -> Result<(), ProviderError> {
        let p = std::path::Path::new(luid);
        let safe = !luid.is_empty()
            && !luid.contains('\\')
            && !p.is_absolute()
            && !p.components().any(|c| {
                matches!(
                    c,
                    std::path::Component::ParentDir | std::path::Component::Prefix(_)
                )
            });
        if !safe {
            return Err(ProviderError::InvalidLuid(luid.to_string()));
        }
        Ok(())
    }

    fn path_for(&self, luid: &str) -> Result<Utf8PathBuf, ProviderError> {
        Self::validate_luid(luid)?;
        Ok(self.root.join(luid))
    }

    fn fingerprint_file(path: &Utf8Path) -> std::io::Result<String> {
        let file = fs::File::open(path)?;
        let mut reader = std::io::BufReader::new(file);
        let mut hasher = md5::Context::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.consume(&buf[..n]);
        }
        Ok(format!("{:X}", hasher.finalize()))
    }

    fn scan(root: &Utf8Path) -> Result<BTreeMap<Luid, Marker>, ProviderError> {
        let files: Vec<Utf8PathBuf> = WalkDir::new(root)
            .into_iter()
            .filter_entry(|e| !e.file_name().to_string_lossy().starts_with('.'))
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| Utf8PathBuf::from_path_buf(e.path().to_path_buf()).ok())
            .collect();

        let entries: Result<Vec<(Luid, Marker)>, ProviderError> = files
            .par_iter()
            .map(|path| {
                let meta = fs::metadata(path)?;
                let luid = path
                    .strip_prefix(root)
                    .map_err(|_| ProviderError::InvalidLuid(path.to_string()))?
                    .as_str()
                    .replace('\\', "/");
                let fingerprint = Self::fingerprint_file(path)?;
                Ok((luid, Marker::new(Self::mtime(&meta), fingerprint)))
            })
            .collect();

        Ok(entries?.into_iter().collect())
    }

    fn snapshot_luids(&self) -> Result<Vec<Luid>, ProviderError> {
        let snapshot = self.snapshot.lock().expect("snapshot lock poisoned");
        snapshot
            .as_ref()
            .map(|s| s.keys().cloned().collect())
            .ok_or(ProviderError::NotRefreshed)
    }

    fn snapshot_marker(&self, luid: &str) -> Result<Marker, ProviderError> {
        let snapshot = self.snapshot.lock().expect("snapshot lock poisoned");
        let snapshot = snapshot.as_ref().ok_or(ProviderError::NotRefreshed)?;
        snapshot
            .get(luid)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(luid.to_string()))
    }

    /// Next free name for a fresh add whose luid is already taken:
    /// `report.txt` becomes `report (1).txt`, then `report (2).txt`.
    fn uniquify(&self, luid: &str) -> Result<Luid, ProviderError> {
        let path = Utf8Path::new(luid);
        let stem = path.file_stem().unwrap_or(luid);
        let parent = path.parent().filter(|p| !p.as_str().is_empty());
        for n in 1u32.. {
            let name = match path.extension() {
                Some(ext) => format!("{stem} ({n}).{ext}"),
                None => format!("{stem} ({n})"),
            };
            let candidate = match parent {
                Some(dir) => dir.join(name).to_string(),
                None => name,
            };
            if !self.root.join(&candidate).exists() {
                return Ok(candidate);
            }
        }
        Err(ProviderError::AlreadyExists(luid.to_string()))
    }

    fn record(&self, luid: &str, marker: Marker) {
        let mut snapshot = self.snapshot.lock().expect("snapshot lock poisoned");
        if let Some(snapshot) = snapshot.as_mut() {
            snapshot.insert(luid.to_string(), marker);
        }
    }
}

#[async_trait]
impl DataProvider for FolderProvider {
    fn uid(&self) -> &str {
        &self.uid
    }

    fn capability(&self) -> Capability {
        self.capability
    }

    fn set_configuration(&mut self, config: &ProviderConfig) -> Result<(), ProviderError> {
        if let Some(root) = config.get(CONFIG_ROOT) {
            self.root = Utf8PathBuf::from(root);
        }
        if let Some(uid) = config.get(CONFIG_UID) {
            self.uid = uid.clone();
        }
        if let Some(capability) = config.get(CONFIG_CAPABILITY) {
            self.capability = match capability.as_str() {
                "source" => Capability::Source,
                "sink" => Capability::Sink,
                "two-way" => Capability::TwoWay,
                other => {
                    return Err(ProviderError::Other(format!(
                        "unknown capability '{other}' (expected source, sink or two-way)"
                    )))
                }
            };
        }
        Ok(())
    }

    fn get_configuration(&self) -> ProviderConfig {
        let capability = match self.capability {
            Capability::Source => "source",
            Capability::Sink => "sink",
            Capability::TwoWay => "two-way",
        };
        ProviderConfig::from([
            (CONFIG_ROOT.to_string(), self.root.to_string()),
            (CONFIG_UID.to_string(), self.uid.clone()),
            (CONFIG_CAPABILITY.to_string(), capability.to_string()),
        ])
    }

    async fn refresh(&self) -> Result<(), ProviderError> {
        if !self.root.is_dir() {
            return Err(ProviderError::Refresh(format!(
                "{} is not a directory",
                self.root
            )));
        }
        let root = self.root.clone();
        let scanned = tokio::task::spawn_blocking(move || Self::scan(&root))
            .await
            .map_err(|e| ProviderError::Other(e.to_string()))??;

        info!(uid = %self.uid, items = scanned.len(), "folder refreshed");
        *self.snapshot.lock().expect("snapshot lock poisoned") = Some(scanned);
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<Luid>, ProviderError> {
        self.snapshot_luids()
    }

    async fn get(&self, luid: &str) -> Result<Item, ProviderError> {
        let marker = self.snapshot_marker(luid)?;
        let payload = fs::read(self.path_for(luid)?)?;
        Ok(Item::new(luid, marker, payload))
    }

    async fn put(
        &self,
        item: &Item,
        overwrite: bool,
        existing: Option<&str>,
    ) -> Result<Luid, ProviderError> {
        {
            let snapshot = self.snapshot.lock().expect("snapshot lock poisoned");
            if snapshot.is_none() {
                return Err(ProviderError::NotRefreshed);
            }
        }

        let mut luid = existing.unwrap_or(&item.luid).to_string();
        Self::validate_luid(&luid)?;
        if !overwrite && self.root.join(&luid).exists() {
            luid = self.uniquify(&luid)?;
        }

        let path = self.path_for(&luid)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_file_name(format!(
            ".{}.osmosis-tmp",
            path.file_name().unwrap_or("item")
        ));
        fs::write(&tmp, &item.payload)?;
        fs::rename(&tmp, &path)?;

        let meta = fs::metadata(&path)?;
        let marker = Marker::new(Self::mtime(&meta), crate::fingerprint(&item.payload));
        self.record(&luid, marker);
        debug!(uid = %self.uid, %luid, bytes = item.payload.len(), "stored item");
        Ok(luid)
    }

    async fn delete(&self, luid: &str) -> Result<(), ProviderError> {
        {
            let snapshot = self.snapshot.lock().expect("snapshot lock poisoned");
            if snapshot.is_none() {
                return Err(ProviderError::NotRefreshed);
            }
        }
        let path = self.path_for(luid)?;
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProviderError::NotFound(luid.to_string()));
            }
            Err(e) => return Err(e.into()),
        }
        let mut snapshot = self.snapshot.lock().expect("snapshot lock poisoned");
        if let Some(snapshot) = snapshot.as_mut() {
            snapshot.remove(luid);
        }
        debug!(uid = %self.uid, %luid, "deleted item");
        Ok(())
    }

    async fn finish(&self, status: FinishStatus) -> Result<(), ProviderError> {
        debug!(uid = %self.uid, ?status, "folder finished");
        *self.snapshot.lock().expect("snapshot lock poisoned") = None;
        Ok(())
    }
}
