//! Error types for ecfs
//!
//! This module defines the common error types used throughout the system.

use crate::types::{BlockKey, SegmentId};
use thiserror::Error;

/// Common result type for ecfs operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for ecfs
#[derive(Debug, Error)]
pub enum Error {
    // Storage errors
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("block not found: {0}")]
    BlockNotFound(BlockKey),

    #[error("segment not cached: {0}")]
    SegmentNotCached(SegmentId),

    #[error("insufficient block space: required {required} bytes, available {available} bytes")]
    InsufficientSpace { required: u64, available: u64 },

    #[error("segment of {size} bytes exceeds cache capacity of {capacity} bytes")]
    SegmentTooLarge { size: u64, capacity: u64 },

    #[error("storage error: {0}")]
    Storage(String),

    // Transfer errors
    #[error("no transfer session for {0}")]
    SessionNotFound(String),

    #[error("transfer session already exists for {0}")]
    SessionExists(String),

    #[error("transfer {key} incomplete: {pending} chunks pending")]
    TransferIncomplete { key: String, pending: u64 },

    #[error("chunk out of bounds: offset {offset} + {length} > {capacity}")]
    ChunkOutOfBounds {
        offset: usize,
        length: usize,
        capacity: usize,
    },

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    // Coding errors
    #[error("insufficient surviving blocks to reconstruct segment {0}")]
    InsufficientBlocks(SegmentId),

    #[error("coding error: {0}")]
    Coding(String),

    // Cluster errors
    #[error("placement returned {available} nodes, need {required}")]
    InsufficientNodes { available: usize, required: usize },

    #[error("rpc error: {0}")]
    Rpc(String),

    // Internal errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an rpc error
    pub fn rpc(msg: impl Into<String>) -> Self {
        Self::Rpc(msg.into())
    }

    /// Check if this is a retryable error
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Rpc(_) | Self::InsufficientNodes { .. })
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::BlockNotFound(_) | Self::SegmentNotCached(_) | Self::SessionNotFound(_)
        )
    }
}
