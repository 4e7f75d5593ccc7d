use std::sync::Arc;

use osmosis_core::mapping::PairKey;
use osmosis_core::policy::SyncPolicy;
use osmosis_core::provider::DataProvider;
use osmosis_core::SyncMode;

#[derive(Debug, thiserror::Error)]
pub enum ConduitError {
    #[error("a conduit needs at least one sink")]
    NoSinks,
    #[error("provider uid '{0}' is not a valid pair component")]
    InvalidUid(String),
    #[error("provider uid '{0}' appears twice in one conduit")]
    DuplicateUid(String),
    #[error("source '{0}' cannot be read from")]
    SourceCannotRead(String),
    #[error("sink '{0}' cannot be written to")]
    SinkCannotWrite(String),
    #[error("two-way sync requires two-way providers, '{0}' is not")]
    NotTwoWay(String),
}

/// A configured sync topology: one source, one or more sinks, a mode and a
/// policy. Capability and uid checks run once here, so a conduit that
/// builds is a conduit the engine can run without per-call role checks.
pub struct Conduit {
    source: Arc<dyn DataProvider>,
    sinks: Vec<Arc<dyn DataProvider>>,
    mode: SyncMode,
    policy: SyncPolicy,
}

impl std::fmt::Debug for Conduit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conduit")
            .field("source", &self.source.uid())
            .field(
                "sinks",
                &self.sinks.iter().map(|s| s.uid()).collect::<Vec<_>>(),
            )
            .field("mode", &self.mode)
            .field("policy", &self.policy)
            .finish()
    }
}

impl Conduit {
    pub fn builder(source: Arc<dyn DataProvider>) -> ConduitBuilder {
        ConduitBuilder {
            source,
            sinks: Vec::new(),
            mode: SyncMode::OneWay,
            policy: SyncPolicy::default(),
        }
    }

    pub fn source(&self) -> &Arc<dyn DataProvider> {
        &self.source
    }

    pub fn sinks(&self) -> &[Arc<dyn DataProvider>] {
        &self.sinks
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    pub fn policy(&self) -> SyncPolicy {
        self.policy
    }

    /// The (source, sink) pairs this conduit spans, in sink order.
    pub fn pairs(&self) -> Vec<PairKey> {
        self.sinks
            .iter()
            .map(|sink| PairKey::new(self.source.uid(), sink.uid()))
            .collect()
    }

    pub fn sink_by_uid(&self, uid: &str) -> Option<&Arc<dyn DataProvider>> {
        self.sinks.iter().find(|s| s.uid() == uid)
    }
}

pub struct ConduitBuilder {
    source: Arc<dyn DataProvider>,
    sinks: Vec<Arc<dyn DataProvider>>,
    mode: SyncMode,
    policy: SyncPolicy,
}

impl ConduitBuilder {
    pub fn sink(mut self, sink: Arc<dyn DataProvider>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn mode(mut self, mode: SyncMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn policy(mut self, policy: SyncPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn build(self) -> Result<Conduit, ConduitError> {
        if self.sinks.is_empty() {
            return Err(ConduitError::NoSinks);
        }

        let mut seen = std::collections::HashSet::new();
        for provider in std::iter::once(&self.source).chain(self.sinks.iter()) {
            let uid = provider.uid();
            // Uids key mapping partitions; the store encoding forbids NUL.
            if uid.is_empty() || uid.contains('\0') {
                return Err(ConduitError::InvalidUid(uid.to_string()));
            }
            if !seen.insert(uid.to_string()) {
                return Err(ConduitError::DuplicateUid(uid.to_string()));
            }
        }

        match self.mode {
            SyncMode::OneWay => {
                if !self.source.capability().can_read() {
                    return Err(ConduitError::SourceCannotRead(self.source.uid().into()));
                }
                for sink in &self.sinks {
                    if !sink.capability().can_write() {
                        return Err(ConduitError::SinkCannotWrite(sink.uid().into()));
                    }
                }
            }
            SyncMode::TwoWay => {
                for provider in std::iter::once(&self.source).chain(self.sinks.iter()) {
                    let capability = provider.capability();
                    if !(capability.can_read() && capability.can_write()) {
                        return Err(ConduitError::NotTwoWay(provider.uid().into()));
                    }
                }
            }
        }

        Ok(Conduit {
            source: self.source,
            sinks: self.sinks,
            mode: self.mode,
            policy: self.policy,
        })
    }
}
