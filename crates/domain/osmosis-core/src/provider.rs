use crate::{Capability, FinishStatus, Item, Luid, ProviderConfig};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("refresh failed: {0}")]
    Refresh(String),
    #[error("provider used before refresh")]
    NotRefreshed,
    #[error("unknown item: {0}")]
    NotFound(Luid),
    #[error("invalid luid: {0}")]
    InvalidLuid(String),
    #[error("item already exists: {0}")]
    AlreadyExists(Luid),
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

/// The capability contract a backend exposes to the sync engine.
///
/// Lifecycle per pass: `refresh` acquires resources and snapshots the
/// backend; `get_all`/`get`/`put`/`delete` operate on that snapshot; a
/// successful `refresh` is matched by exactly one `finish`, whatever the
/// pass outcome. Calls may be arbitrarily slow (network, device I/O), so
/// every item operation is a suspension point.
#[async_trait]
pub trait DataProvider: Send + Sync {
    /// Stable identity used to key mapping partitions. Non-empty, no NUL
    /// bytes, and stable across process restarts.
    fn uid(&self) -> &str;

    fn capability(&self) -> Capability;

    /// Apply explicit configuration. Called before the provider joins a
    /// conduit, never during a pass.
    fn set_configuration(&mut self, config: &ProviderConfig) -> Result<(), ProviderError>;

    fn get_configuration(&self) -> ProviderConfig;

    async fn refresh(&self) -> Result<(), ProviderError>;

    /// Enumerate the luids of every item currently held.
    async fn get_all(&self) -> Result<Vec<Luid>, ProviderError>;

    /// Materialize one item, payload and current marker included.
    async fn get(&self, luid: &str) -> Result<Item, ProviderError>;

    /// Store an item. `existing` carries the mapped destination luid when a
    /// mapped item is being replaced; `overwrite` is false for fresh adds.
    /// Returns the luid the destination actually stored under, which may
    /// differ from both `existing` and `item.luid`.
    async fn put(
        &self,
        item: &Item,
        overwrite: bool,
        existing: Option<&str>,
    ) -> Result<Luid, ProviderError>;

    async fn delete(&self, luid: &str) -> Result<(), ProviderError>;

    /// Release whatever `refresh` acquired. The flags tell the provider how
    /// the pass ended.
    async fn finish(&self, status: FinishStatus) -> Result<(), ProviderError>;
}
