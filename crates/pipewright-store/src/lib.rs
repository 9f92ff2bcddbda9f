pub mod memory;
pub mod sqlite;

pub use memory::MemoryGraphStore;
pub use sqlite::SqliteGraphStore;
