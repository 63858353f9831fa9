//! Block type for coded segment data

use bytes::Bytes;
use ecfs_common::{BlockId, Checksum};

/// One coded output unit of a segment
#[derive(Clone, Debug)]
pub struct Block {
    /// Index of this block within the coding scheme
    pub block_id: BlockId,
    /// Whether this is a parity block (vs data or replica block)
    pub is_parity: bool,
    /// The block data
    pub data: Bytes,
    /// Checksum for integrity verification
    pub checksum: Checksum,
}

impl Block {
    /// Create a new block
    #[must_use]
    pub fn new(block_id: BlockId, data: Bytes, is_parity: bool) -> Self {
        let checksum = Checksum::compute(&data);
        Self {
            block_id,
            is_parity,
            data,
            checksum,
        }
    }

    /// Verify the block's checksum
    #[must_use]
    pub fn verify(&self) -> bool {
        self.checksum.verify_fast(&self.data)
    }

    /// Get the size of the block data
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_creation() {
        let data = Bytes::from_static(b"test data");
        let block = Block::new(2, data.clone(), true);

        assert_eq!(block.block_id, 2);
        assert!(block.is_parity);
        assert_eq!(block.data, data);
        assert_eq!(block.size(), 9);
        assert!(block.verify());
    }

    #[test]
    fn test_block_verify_detects_corruption() {
        let mut block = Block::new(0, Bytes::from_static(b"test data"), false);
        block.data = Bytes::from_static(b"test dada");
        assert!(!block.verify());
    }
}
