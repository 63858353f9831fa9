//! Partially collected blocks
//!
//! Peers answer a symbol request with the requested ranges concatenated in
//! request order. [`SparseBlocks`] scatters those bytes back to their block
//! offsets so schemes can address them by position and ask whether a range
//! was actually collected.

use crate::codec::CodingError;
use bytes::Bytes;
use ecfs_common::{BlockId, Symbol, SymbolSet};
use std::collections::BTreeMap;

/// Collected bytes per block id, each the concatenation of its symbols
pub type BlockMap = BTreeMap<BlockId, Bytes>;

struct SparseBlock {
    data: Vec<u8>,
    /// Covered ranges, sorted and merged
    covered: Vec<Symbol>,
}

impl SparseBlock {
    fn covers(&self, offset: usize, length: usize) -> bool {
        if length == 0 {
            return true;
        }
        let end = offset + length;
        self.covered
            .iter()
            .any(|s| s.offset <= offset && s.end() >= end)
    }
}

/// Blocks rebuilt at their natural offsets from collected symbols
pub struct SparseBlocks {
    block_size: usize,
    blocks: BTreeMap<BlockId, SparseBlock>,
}

impl SparseBlocks {
    /// Scatter the collected data of every block named in `symbols`
    pub fn gather(
        block_size: usize,
        collected: &BlockMap,
        symbols: &SymbolSet,
    ) -> Result<Self, CodingError> {
        let mut blocks = BTreeMap::new();

        for (block_id, list) in symbols.iter() {
            let bytes = collected
                .get(&block_id)
                .ok_or(CodingError::MissingSymbols { block_id })?;

            let expected: usize = list.iter().map(|s| s.length).sum();
            if bytes.len() != expected {
                return Err(CodingError::SymbolSizeMismatch {
                    block_id,
                    expected,
                    actual: bytes.len(),
                });
            }

            let mut data = vec![0u8; block_size];
            let mut cursor = 0;
            for symbol in list {
                if symbol.end() > block_size {
                    return Err(CodingError::SymbolOutOfRange {
                        block_id,
                        end: symbol.end(),
                        block_size,
                    });
                }
                data[symbol.offset..symbol.end()]
                    .copy_from_slice(&bytes[cursor..cursor + symbol.length]);
                cursor += symbol.length;
            }

            blocks.insert(
                block_id,
                SparseBlock {
                    data,
                    covered: merge_ranges(list),
                },
            );
        }

        Ok(Self { block_size, blocks })
    }

    #[must_use]
    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    /// Whether the block was collected at all
    #[must_use]
    pub fn contains(&self, block_id: BlockId) -> bool {
        self.blocks.contains_key(&block_id)
    }

    /// Block ids present, ascending
    pub fn ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks.keys().copied()
    }

    /// A byte range of a block, if every byte of it was collected
    #[must_use]
    pub fn range(&self, block_id: BlockId, offset: usize, length: usize) -> Option<&[u8]> {
        let block = self.blocks.get(&block_id)?;
        if offset + length > self.block_size || !block.covers(offset, length) {
            return None;
        }
        Some(&block.data[offset..offset + length])
    }

    /// The whole block, if it was collected entirely
    #[must_use]
    pub fn full(&self, block_id: BlockId) -> Option<&[u8]> {
        self.range(block_id, 0, self.block_size)
    }
}

/// Sort ranges and fuse overlapping or adjacent ones
#[must_use]
pub fn merge_ranges(symbols: &[Symbol]) -> Vec<Symbol> {
    let mut sorted: Vec<Symbol> = symbols.iter().copied().filter(|s| s.length > 0).collect();
    sorted.sort_by_key(|s| s.offset);

    let mut merged: Vec<Symbol> = Vec::with_capacity(sorted.len());
    for symbol in sorted {
        match merged.last_mut() {
            Some(last) if symbol.offset <= last.end() => {
                let end = last.end().max(symbol.end());
                last.length = end - last.offset;
            }
            _ => merged.push(symbol),
        }
    }
    merged
}

/// XOR `src` into `dst` byte by byte
pub fn xor_into(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

/// Round `value` up to a multiple of `align`
#[must_use]
pub const fn round_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}
