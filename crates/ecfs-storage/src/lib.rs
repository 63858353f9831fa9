//! ecfs Storage Engine - per-node segment and block storage
//!
//! This crate implements the storage side of an OSD:
//! - Memory arena for segment and block payloads
//! - File access with a bounded open-handle cache
//! - Transfer sessions staging incoming segments and blocks
//! - Block store with delta blocks and merge
//! - Segment disk cache with recency-ordered eviction

pub mod arena;
pub mod cache;
pub mod file_store;
pub mod layout;
pub mod pending;
pub mod segment_store;
pub mod session;

// Re-exports
pub use arena::{Arena, ArenaBuf, ArenaStats};
pub use cache::{CacheStats, DiskCacheEntry, SegmentCache};
pub use file_store::FileStore;
pub use layout::{BlockFile, Layout};
pub use pending::PendingCounter;
pub use segment_store::SegmentStore;
pub use session::{TransferKey, TransferSession};
