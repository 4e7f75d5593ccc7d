use async_trait::async_trait;

use osmosis_core::policy::{Conflict, Resolution};

/// External collaborator consulted for conflicts the `ask` policy defers.
///
/// Called per conflicting item, mid-pass, without blocking other items.
/// Returning [`Resolution::Defer`] leaves the conflict in the report's
/// pending list for out-of-band resolution via
/// [`crate::SyncEngine::apply_resolution`].
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    async fn resolve(&self, conflict: &Conflict) -> Resolution;
}

/// Default resolver: answers nothing, every asked conflict stays pending.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeferAll;

#[async_trait]
impl ConflictResolver for DeferAll {
    async fn resolve(&self, _conflict: &Conflict) -> Resolution {
        Resolution::Defer
    }
}
