//! Single XOR parity (RAID-5 style)
//!
//! `n - 1` equally sized data blocks followed by one parity block holding
//! their XOR. Any `n - 1` blocks reconstruct the segment.

use super::{Scheme, block_id, is_usable, parse_param};
use crate::codec::CodingError;
use crate::sparse::{SparseBlocks, xor_into};
use bytes::Bytes;
use ecfs_common::{BlockId, SymbolSet};

const MAX_BLOCKS: usize = 255;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Raid5 {
    data_blocks: usize,
}

impl Raid5 {
    /// Parse a setting of the form `n` (total blocks, at least 2)
    pub fn from_setting(setting: &str) -> Result<Self, CodingError> {
        let total = parse_param(setting, "block count")?;
        if !(2..=MAX_BLOCKS).contains(&total) {
            return Err(CodingError::InvalidSetting(format!(
                "raid5 block count must be in 2..={MAX_BLOCKS}, got {total}"
            )));
        }
        Ok(Self {
            data_blocks: total - 1,
        })
    }

    const fn parity_index(&self) -> usize {
        self.data_blocks
    }

    /// XOR of every listed block, each taken in full
    fn xor_of(
        &self,
        blocks: &SparseBlocks,
        sources: impl Iterator<Item = usize>,
    ) -> Result<Vec<u8>, CodingError> {
        let mut out = vec![0u8; blocks.block_size()];
        for index in sources {
            let block = blocks.full(block_id(index)).ok_or_else(|| {
                CodingError::DecodingFailed(format!("block {index} was not collected in full"))
            })?;
            xor_into(&mut out, block);
        }
        Ok(out)
    }
}

impl Scheme for Raid5 {
    fn block_count(&self) -> usize {
        self.data_blocks + 1
    }

    fn min_healthy(&self) -> usize {
        self.data_blocks
    }

    fn block_size(&self, segment_size: usize) -> usize {
        segment_size.div_ceil(self.data_blocks)
    }

    fn segment_alignment(&self) -> usize {
        self.data_blocks
    }

    fn is_parity(&self, block_id: BlockId) -> bool {
        block_id as usize == self.parity_index()
    }

    fn encode(&self, segment: &[u8]) -> Result<Vec<Bytes>, CodingError> {
        let size = self.block_size(segment.len());
        let mut parity = vec![0u8; size];
        let mut blocks = Vec::with_capacity(self.block_count());

        for i in 0..self.data_blocks {
            let start = (i * size).min(segment.len());
            let end = (start + size).min(segment.len());
            let mut block = vec![0u8; size];
            block[..end - start].copy_from_slice(&segment[start..end]);
            xor_into(&mut parity, &block);
            blocks.push(Bytes::from(block));
        }
        blocks.push(Bytes::from(parity));
        Ok(blocks)
    }

    fn decode(&self, blocks: &SparseBlocks, segment_size: usize) -> Result<Vec<u8>, CodingError> {
        let size = blocks.block_size();
        let mut segment = Vec::with_capacity(size * self.data_blocks);

        for i in 0..self.data_blocks {
            if let Some(block) = blocks.full(block_id(i)) {
                segment.extend_from_slice(block);
            } else {
                let others = (0..self.block_count()).filter(|&j| j != i);
                segment.extend_from_slice(&self.xor_of(blocks, others)?);
            }
        }

        segment.truncate(segment_size);
        Ok(segment)
    }

    fn required_symbols(&self, health: &[bool], segment_size: usize) -> SymbolSet {
        let size = self.block_size(segment_size);
        let missing: Vec<usize> = (0..self.data_blocks)
            .filter(|&i| !is_usable(health, &[], i))
            .collect();

        let mut symbols = SymbolSet::new();
        match missing.as_slice() {
            [] => {
                for i in 0..self.data_blocks {
                    symbols.insert_full(block_id(i), size);
                }
            }
            [lost] if is_usable(health, &[], self.parity_index()) => {
                for i in (0..self.block_count()).filter(|i| i != lost) {
                    symbols.insert_full(block_id(i), size);
                }
            }
            _ => {}
        }
        symbols
    }

    fn repair_symbols(
        &self,
        failed: &[BlockId],
        health: &[bool],
        segment_size: usize,
    ) -> SymbolSet {
        let size = self.block_size(segment_size);
        let survivors: Vec<usize> = (0..self.block_count())
            .filter(|&i| is_usable(health, failed, i))
            .collect();

        let mut symbols = SymbolSet::new();
        if failed.len() == 1 && survivors.len() == self.data_blocks {
            for i in survivors {
                symbols.insert_full(block_id(i), size);
            }
        }
        symbols
    }

    fn repair(
        &self,
        failed: &[BlockId],
        blocks: &SparseBlocks,
        _segment_size: usize,
    ) -> Result<Vec<Bytes>, CodingError> {
        let [lost] = failed else {
            return Err(CodingError::InsufficientBlocks {
                available: self.block_count().saturating_sub(failed.len()),
                required: self.data_blocks,
            });
        };
        let others = (0..self.block_count()).filter(|&j| j != *lost as usize);
        Ok(vec![Bytes::from(self.xor_of(blocks, others)?)])
    }
}
