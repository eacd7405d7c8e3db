//! Backing store implementations
//!
//! - `file`: one directory per queue, for production use
//! - `memory`: in-process storage for transient queues and tests
//! - `test`: a memory store with synchronisation helpers for tests

pub mod file;
pub mod memory;
pub mod test;

pub use file::{FileBackingStore, FileBackingStoreBuilder};
pub use memory::MemoryBackingStore;
pub use test::TestBackingStore;
