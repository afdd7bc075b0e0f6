mod fjall_store;
mod memory;
mod record;
mod traits;

pub use fjall_store::FjallMetaStore;
pub use memory::MemoryMetaStore;
pub use record::{FileRecord, Filter, Sort, SortKey, SortOrder};
pub use traits::{Durability, MetaError, MetaStore};
