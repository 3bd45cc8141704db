pub mod checkpoint;
pub mod duckdb;
pub mod memory;
pub mod traits;

pub use checkpoint::{Checkpoint, CheckpointError, CheckpointManager};
pub use duckdb::DuckDbStore;
pub use memory::MemoryStore;
pub use traits::{CheckpointStore, DeadLetter, StorageError};
