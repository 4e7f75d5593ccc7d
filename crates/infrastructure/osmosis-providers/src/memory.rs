use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;

use osmosis_core::provider::{DataProvider, ProviderError};
use osmosis_core::{Capability, FinishStatus, Item, Luid, Marker, ProviderConfig};

/// Per-operation call tally, readable after a pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub refresh: u64,
    pub get_all: u64,
    pub get: u64,
    pub put: u64,
    pub delete: u64,
    pub finish: u64,
}

#[derive(Debug, Clone)]
struct StoredItem {
    payload: Vec<u8>,
    mtime: u64,
}

#[derive(Debug, Default)]
struct Faults {
    fail_refresh: bool,
    fail_puts_after: Option<u64>,
    fail_get: BTreeSet<Luid>,
    fail_delete: BTreeSet<Luid>,
}

#[derive(Debug, Default)]
struct Inner {
    items: BTreeMap<Luid, StoredItem>,
    refreshed: bool,
    clock: u64,
    counts: CallCounts,
    faults: Faults,
    finishes: Vec<FinishStatus>,
}

/// In-process dataprovider with seedable contents, injectable faults and
/// observable call history. Mtimes come from a logical clock that ticks on
/// every mutation, so "newer" is deterministic without real time.
pub struct MemoryProvider {
    uid: String,
    capability: Capability,
    inner: Mutex<Inner>,
}

impl MemoryProvider {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            capability: Capability::TwoWay,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capability = capability;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory provider lock poisoned")
    }

    /// Insert or replace an item, ticking the logical clock.
    pub fn seed(&self, luid: impl Into<Luid>, payload: impl Into<Vec<u8>>) {
        let mut inner = self.lock();
        inner.clock += 1;
        let mtime = inner.clock;
        inner.items.insert(
            luid.into(),
            StoredItem {
                payload: payload.into(),
                mtime,
            },
        );
    }

    /// Replace an item's payload at a fixed mtime, for staging ties.
    pub fn seed_at(&self, luid: impl Into<Luid>, payload: impl Into<Vec<u8>>, mtime: u64) {
        let mut inner = self.lock();
        inner.clock = inner.clock.max(mtime);
        inner.items.insert(
            luid.into(),
            StoredItem {
                payload: payload.into(),
                mtime,
            },
        );
    }

    pub fn remove_item(&self, luid: &str) {
        self.lock().items.remove(luid);
    }

    pub fn contains(&self, luid: &str) -> bool {
        self.lock().items.contains_key(luid)
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn luids(&self) -> Vec<Luid> {
        self.lock().items.keys().cloned().collect()
    }

    pub fn payload(&self, luid: &str) -> Option<Vec<u8>> {
        self.lock().items.get(luid).map(|i| i.payload.clone())
    }

    pub fn mtime(&self, luid: &str) -> Option<u64> {
        self.lock().items.get(luid).map(|i| i.mtime)
    }

    pub fn finishes(&self) -> Vec<FinishStatus> {
        self.lock().finishes.clone()
    }

    pub fn call_counts(&self) -> CallCounts {
        self.lock().counts
    }

    /// Make the next refresh fail, simulating an unreachable backend.
    pub fn fail_next_refresh(&self) {
        self.lock().faults.fail_refresh = true;
    }

    /// Let the first `n` puts succeed, then fail every one after.
    pub fn fail_puts_after(&self, n: u64) {
        self.lock().faults.fail_puts_after = Some(n);
    }

    pub fn fail_get(&self, luid: impl Into<Luid>) {
        self.lock().faults.fail_get.insert(luid.into());
    }

    pub fn fail_delete(&self, luid: impl Into<Luid>) {
        self.lock().faults.fail_delete.insert(luid.into());
    }

    /// Drop every injected fault, simulating a backend that recovered.
    pub fn clear_faults(&self) {
        self.lock().faults = Faults::default();
    }
}

#[async_trait]
impl DataProvider for MemoryProvider {
    fn uid(&self) -> &str {
        &self.uid
    }

    fn capability(&self) -> Capability {
        self.capability
    }

    fn set_configuration(&mut self, config: &ProviderConfig) -> Result<(), ProviderError> {
        if let Some(uid) = config.get("uid") {
            self.uid = uid.clone();
        }
        if let Some(capability) = config.get("capability") {
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
            ("uid".to_string(), self.uid.clone()),
            ("capability".to_string(), capability.to_string()),
        ])
    }

    async fn refresh(&self) -> Result<(), ProviderError> {
        let mut inner = self.lock();
        inner.counts.refresh += 1;
        if inner.faults.fail_refresh {
            inner.faults.fail_refresh = false;
            return Err(ProviderError::Refresh("injected refresh failure".into()));
        }
        inner.refreshed = true;
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<Luid>, ProviderError> {
        let mut inner = self.lock();
        inner.counts.get_all += 1;
        if !inner.refreshed {
            return Err(ProviderError::NotRefreshed);
        }
        Ok(inner.items.keys().cloned().collect())
    }

    async fn get(&self, luid: &str) -> Result<Item, ProviderError> {
        let mut inner = self.lock();
        inner.counts.get += 1;
        if !inner.refreshed {
            return Err(ProviderError::NotRefreshed);
        }
        if inner.faults.fail_get.contains(luid) {
            return Err(ProviderError::Other(format!("injected get failure: {luid}")));
        }
        let stored = inner
            .items
            .get(luid)
            .ok_or_else(|| ProviderError::NotFound(luid.to_string()))?;
        Ok(Item::new(
            luid,
            Marker::new(stored.mtime, crate::fingerprint(&stored.payload)),
            stored.payload.clone(),
        ))
    }

    async fn put(
        &self,
        item: &Item,
        overwrite: bool,
        existing: Option<&str>,
    ) -> Result<Luid, ProviderError> {
        let mut inner = self.lock();
        inner.counts.put += 1;
        if !inner.refreshed {
            return Err(ProviderError::NotRefreshed);
        }
        if let Some(allowed) = inner.faults.fail_puts_after {
            if inner.counts.put > allowed {
                return Err(ProviderError::Other(format!(
                    "injected put failure: {}",
                    item.luid
                )));
            }
        }

        let mut luid = existing.unwrap_or(&item.luid).to_string();
        if luid.is_empty() {
            return Err(ProviderError::InvalidLuid(luid));
        }
        if !overwrite && inner.items.contains_key(&luid) {
            let mut n = 1u64;
            let base = luid.clone();
            while inner.items.contains_key(&luid) {
                luid = format!("{base} ({n})");
                n += 1;
            }
        }

        inner.clock += 1;
        let mtime = inner.clock;
        inner.items.insert(
            luid.clone(),
            StoredItem {
                payload: item.payload.clone(),
                mtime,
            },
        );
        Ok(luid)
    }

    async fn delete(&self, luid: &str) -> Result<(), ProviderError> {
        let mut inner = self.lock();
        inner.counts.delete += 1;
        if !inner.refreshed {
            return Err(ProviderError::NotRefreshed);
        }
        if inner.faults.fail_delete.contains(luid) {
            return Err(ProviderError::Other(format!(
                "injected delete failure: {luid}"
            )));
        }
        inner
            .items
            .remove(luid)
            .ok_or_else(|| ProviderError::NotFound(luid.to_string()))?;
        Ok(())
    }

    async fn finish(&self, status: FinishStatus) -> Result<(), ProviderError> {
        let mut inner = self.lock();
        inner.counts.finish += 1;
        inner.refreshed = false;
        inner.finishes.push(status);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn items_are_invisible_until_refresh() {
        let provider = MemoryProvider::new("mem-a");
        provider.seed("one", b"1".to_vec());

        assert!(matches!(
            provider.get_all().await,
            Err(ProviderError::NotRefreshed)
        ));
        provider.refresh().await.unwrap();
        assert_eq!(provider.get_all().await.unwrap(), vec!["one".to_string()]);
    }

    #[tokio::test]
    async fn injected_refresh_failure_fires_once() {
        let provider = MemoryProvider::new("mem-a");
        provider.fail_next_refresh();

        assert!(matches!(
            provider.refresh().await,
            Err(ProviderError::Refresh(_))
        ));
        provider.refresh().await.unwrap();
        assert_eq!(provider.call_counts().refresh, 2);
    }

    #[tokio::test]
    async fn puts_fail_after_the_allowed_count() {
        let provider = MemoryProvider::new("mem-a");
        provider.refresh().await.unwrap();
        provider.fail_puts_after(2);

        let item = |luid: &str| Item::new(luid, Marker::new(1, "x"), b"p".to_vec());
        assert!(provider.put(&item("a"), false, None).await.is_ok());
        assert!(provider.put(&item("b"), false, None).await.is_ok());
        assert!(provider.put(&item("c"), false, None).await.is_err());
        assert!(provider.put(&item("d"), false, None).await.is_err());
        assert_eq!(provider.len(), 2);
    }

    #[tokio::test]
    async fn put_without_overwrite_uniquifies() {
        let provider = MemoryProvider::new("mem-a");
        provider.seed("note", b"old".to_vec());
        provider.refresh().await.unwrap();

        let item = Item::new("note", Marker::new(1, "x"), b"new".to_vec());
        let stored = provider.put(&item, false, None).await.unwrap();
        assert_eq!(stored, "note (1)");
        assert_eq!(provider.payload("note").unwrap(), b"old");
        assert_eq!(provider.payload("note (1)").unwrap(), b"new");
    }

    #[tokio::test]
    async fn logical_clock_orders_mutations() {
        let provider = MemoryProvider::new("mem-a");
        provider.seed("a", b"1".to_vec());
        provider.seed("b", b"2".to_vec());
        assert!(provider.mtime("b").unwrap() > provider.mtime("a").unwrap());

        provider.seed("a", b"3".to_vec());
        assert!(provider.mtime("a").unwrap() > provider.mtime("b").unwrap());
    }

    #[tokio::test]
    async fn finish_records_status_and_drops_the_session() {
        let provider = MemoryProvider::new("mem-a");
        provider.refresh().await.unwrap();
        provider
            .finish(FinishStatus {
                aborted: true,
                ..FinishStatus::default()
            })
            .await
            .unwrap();

        assert!(matches!(
            provider.get_all().await,
            Err(ProviderError::NotRefreshed)
        ));
        let finishes = provider.finishes();
        assert_eq!(finishes.len(), 1);
        assert!(finishes[0].aborted);
    }
}
