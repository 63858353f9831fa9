//! n-way replication
//!
//! Every block is a verbatim copy of the segment. Any one healthy copy is
//! enough to serve a read or regenerate the others.

use super::{Scheme, block_id, is_usable, parse_param};
use crate::codec::CodingError;
use crate::sparse::SparseBlocks;
use bytes::Bytes;
use ecfs_common::{BlockId, SymbolSet};

/// Maximum number of replicas accepted in a setting
const MAX_COPIES: usize = 255;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Replication {
    copies: usize,
}

impl Replication {
    /// Parse a setting of the form `n`
    pub fn from_setting(setting: &str) -> Result<Self, CodingError> {
        let copies = parse_param(setting, "replication factor")?;
        if copies > MAX_COPIES {
            return Err(CodingError::InvalidSetting(format!(
                "replication factor must be <= {MAX_COPIES}"
            )));
        }
        Ok(Self { copies })
    }

    fn first_usable(&self, health: &[bool], failed: &[BlockId]) -> Option<usize> {
        (0..self.copies).find(|&i| is_usable(health, failed, i))
    }
}

impl Scheme for Replication {
    fn block_count(&self) -> usize {
        self.copies
    }

    fn min_healthy(&self) -> usize {
        1
    }

    fn block_size(&self, segment_size: usize) -> usize {
        segment_size
    }

    fn segment_alignment(&self) -> usize {
        1
    }

    fn is_parity(&self, _block_id: BlockId) -> bool {
        false
    }

    fn encode(&self, segment: &[u8]) -> Result<Vec<Bytes>, CodingError> {
        let copy = Bytes::copy_from_slice(segment);
        Ok(vec![copy; self.copies])
    }

    fn decode(&self, blocks: &SparseBlocks, segment_size: usize) -> Result<Vec<u8>, CodingError> {
        blocks
            .ids()
            .find_map(|id| blocks.range(id, 0, segment_size))
            .map(<[u8]>::to_vec)
            .ok_or_else(|| CodingError::DecodingFailed("no complete replica collected".into()))
    }

    fn required_symbols(&self, health: &[bool], segment_size: usize) -> SymbolSet {
        let mut symbols = SymbolSet::new();
        if let Some(index) = self.first_usable(health, &[]) {
            symbols.insert_full(block_id(index), segment_size);
        }
        symbols
    }

    fn repair_symbols(
        &self,
        failed: &[BlockId],
        health: &[bool],
        segment_size: usize,
    ) -> SymbolSet {
        let mut symbols = SymbolSet::new();
        if let Some(index) = self.first_usable(health, failed) {
            symbols.insert_full(block_id(index), segment_size);
        }
        symbols
    }

    fn repair(
        &self,
        failed: &[BlockId],
        blocks: &SparseBlocks,
        segment_size: usize,
    ) -> Result<Vec<Bytes>, CodingError> {
        let source = Bytes::from(self.decode(blocks, segment_size)?);
        Ok(failed.iter().map(|_| source.clone()).collect())
    }
}
