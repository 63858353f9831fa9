//! Checksum utilities for ecfs
//!
//! Segments are identified by a hex SHA-256 content hash that the client
//! supplies at upload and the OSD verifies before encoding. Blocks carry the
//! cheaper CRC32C/xxHash pair for in-flight verification.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Checksum values computed for a block of data
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    /// CRC32C checksum (fast, for inline verification)
    pub crc32c: u32,
    /// xxHash64 (fast, for comparison)
    pub xxhash64: u64,
}

impl Checksum {
    /// Compute checksum from data
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self {
            crc32c: crc32c::crc32c(data),
            xxhash64: xxhash_rust::xxh64::xxh64(data, 0),
        }
    }

    /// Verify data against this checksum (fast check using CRC32C)
    #[must_use]
    pub fn verify_fast(&self, data: &[u8]) -> bool {
        crc32c::crc32c(data) == self.crc32c
    }

    /// Verify data against both hashes
    #[must_use]
    pub fn verify(&self, data: &[u8]) -> bool {
        self.verify_fast(data) && xxhash_rust::xxh64::xxh64(data, 0) == self.xxhash64
    }
}

/// Hex SHA-256 of a segment's content
#[must_use]
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_verify() {
        let data = b"hello, world!";
        let checksum = Checksum::compute(data);

        assert!(checksum.verify_fast(data));
        assert!(checksum.verify(data));

        // Corrupted data should fail
        let corrupted = b"hello, world?";
        assert!(!checksum.verify_fast(corrupted));
        assert!(!checksum.verify(corrupted));
    }

    #[test]
    fn test_content_hash() {
        assert_eq!(
            content_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_ne!(content_hash(b"ABCDE"), content_hash(b"ABCDF"));
        assert_eq!(content_hash(b"ABCDE").len(), 64);
    }
}
