//! Storage implementations for raw documents and structured records.
//!
//! Available backends:
//! - [`MemoryRawStore`] / [`MemoryRecordStore`] - In-memory storage (for testing)
//! - [`FsRawStore`] / [`FsRecordStore`] - One file per document or batch

pub mod fs;
pub mod memory;

pub use fs::{read_batch_file, FsRawStore, FsRecordStore, SkippedEntry};
pub use memory::{MemoryRawStore, MemoryRecordStore};
