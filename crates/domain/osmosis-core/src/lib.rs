use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod delta;
pub mod mapping;
pub mod policy;
pub mod provider;

/// Local unique identifier: the string handle a dataprovider uses to name
/// one of its items, stable across refreshes for unchanged items.
pub type Luid = String;

/// String-keyed configuration handed to a dataprovider before a pass.
/// Explicit and per-provider; there is no ambient configuration state.
pub type ProviderConfig = BTreeMap<String, String>;

/// Change-detection stamp for one item. Equal markers mean "unchanged since
/// recorded"; `mtime` orders the two sides of a conflict for newer-wins
/// resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marker {
    /// Modification time in seconds (wall clock for filesystems, a logical
    /// clock for stores without one).
    pub mtime: u64,
    /// Content fingerprint (MD5 hex digest).
    pub fingerprint: String,
}

impl Marker {
    pub fn new(mtime: u64, fingerprint: impl Into<String>) -> Self {
        Self {
            mtime,
            fingerprint: fingerprint.into(),
        }
    }

    /// Strictly newer than `other` by modification time. Ties are not newer;
    /// the caller decides who wins a tie.
    pub fn newer_than(&self, other: &Marker) -> bool {
        self.mtime > other.mtime
    }
}

/// One materialized item. The payload is opaque to the engine: it is moved
/// between providers, never inspected or mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub luid: Luid,
    pub marker: Marker,
    pub payload: Vec<u8>,
}

impl Item {
    pub fn new(luid: impl Into<Luid>, marker: Marker, payload: Vec<u8>) -> Self {
        Self {
            luid: luid.into(),
            marker,
            payload,
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Capability tag of a dataprovider, checked once when a conduit is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    Source,
    Sink,
    TwoWay,
}

impl Capability {
    /// Can items be enumerated and read from this provider?
    pub fn can_read(self) -> bool {
        matches!(self, Capability::Source | Capability::TwoWay)
    }

    /// Can items be written to and deleted from this provider?
    pub fn can_write(self) -> bool {
        matches!(self, Capability::Sink | Capability::TwoWay)
    }
}

/// Direction of change flow for one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    OneWay,
    TwoWay,
}

impl SyncMode {
    pub fn is_two_way(self) -> bool {
        self == SyncMode::TwoWay
    }
}

/// Outcome flags passed to `finish` so a provider can react to how the pass
/// ended while releasing its resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FinishStatus {
    pub aborted: bool,
    pub errored: bool,
    pub conflicted: bool,
}
