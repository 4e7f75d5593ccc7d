mod folder;
mod memory;

pub use folder::FolderProvider;
pub use memory::{CallCounts, MemoryProvider};

/// MD5 hex digest used as the content fingerprint for item markers.
pub(crate) fn fingerprint(payload: &[u8]) -> String {
    let mut hasher = md5::Context::new();
    hasher.consume(payload);
    format!("{:X}", hasher.finalize())
}
