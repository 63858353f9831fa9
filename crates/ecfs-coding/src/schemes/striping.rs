//! Striping without redundancy
//!
//! The segment is cut into `k` consecutive strips of `ceil(size / k)` bytes;
//! trailing strips absorb the remainder and may be shorter or empty. Every
//! strip is needed for a read, and a lost strip cannot be regenerated.

use super::{Scheme, block_id, parse_param};
use crate::codec::CodingError;
use crate::sparse::SparseBlocks;
use bytes::Bytes;
use ecfs_common::{BlockId, SymbolSet};

const MAX_STRIPES: usize = 255;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Striping {
    stripes: usize,
}

impl Striping {
    /// Parse a setting of the form `k`
    pub fn from_setting(setting: &str) -> Result<Self, CodingError> {
        let stripes = parse_param(setting, "stripe count")?;
        if stripes > MAX_STRIPES {
            return Err(CodingError::InvalidSetting(format!(
                "stripe count must be <= {MAX_STRIPES}"
            )));
        }
        Ok(Self { stripes })
    }

    /// Length of strip `index` for a segment of `segment_size`
    fn strip_len(&self, index: usize, segment_size: usize) -> usize {
        let strip = self.block_size(segment_size);
        segment_size.saturating_sub(index * strip).min(strip)
    }
}

impl Scheme for Striping {
    fn block_count(&self) -> usize {
        self.stripes
    }

    fn min_healthy(&self) -> usize {
        self.stripes
    }

    fn block_size(&self, segment_size: usize) -> usize {
        segment_size.div_ceil(self.stripes)
    }

    fn segment_alignment(&self) -> usize {
        self.stripes
    }

    fn is_parity(&self, _block_id: BlockId) -> bool {
        false
    }

    fn encode(&self, segment: &[u8]) -> Result<Vec<Bytes>, CodingError> {
        let strip = self.block_size(segment.len());
        let mut blocks = Vec::with_capacity(self.stripes);
        for i in 0..self.stripes {
            let start = (i * strip).min(segment.len());
            let len = self.strip_len(i, segment.len());
            blocks.push(Bytes::copy_from_slice(&segment[start..start + len]));
        }
        Ok(blocks)
    }

    fn decode(&self, blocks: &SparseBlocks, segment_size: usize) -> Result<Vec<u8>, CodingError> {
        let mut segment = Vec::with_capacity(segment_size);
        for i in 0..self.stripes {
            let len = self.strip_len(i, segment_size);
            let strip = blocks.range(block_id(i), 0, len).ok_or_else(|| {
                CodingError::DecodingFailed(format!("strip {i} was not collected"))
            })?;
            segment.extend_from_slice(strip);
        }
        Ok(segment)
    }

    fn required_symbols(&self, health: &[bool], segment_size: usize) -> SymbolSet {
        let mut symbols = SymbolSet::new();
        let all_healthy =
            (0..self.stripes).all(|i| health.get(i).copied().unwrap_or(false));
        if all_healthy {
            for i in 0..self.stripes {
                symbols.insert_full(block_id(i), self.strip_len(i, segment_size));
            }
        }
        symbols
    }

    fn repair_symbols(
        &self,
        _failed: &[BlockId],
        _health: &[bool],
        _segment_size: usize,
    ) -> SymbolSet {
        SymbolSet::new()
    }

    fn repair(
        &self,
        failed: &[BlockId],
        _blocks: &SparseBlocks,
        _segment_size: usize,
    ) -> Result<Vec<Bytes>, CodingError> {
        Err(CodingError::InsufficientBlocks {
            available: self.stripes - failed.len().min(self.stripes),
            required: self.stripes,
        })
    }
}
