mod api;
mod codec;
mod error;
mod maintenance;
mod memory;
mod pair_key;
mod redb_store;

pub use api::*;
pub use error::*;
pub use memory::MemoryMappingStore;
pub use redb_store::RedbMappingStore;
