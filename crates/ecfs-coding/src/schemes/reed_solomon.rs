//! Systematic Reed-Solomon coding using reed-solomon-simd
//!
//! The segment is padded and split into `k` original shards; `m` recovery
//! shards follow them. Any `k` shards reconstruct the originals. The crate
//! automatically uses SIMD instructions where available (SSE, AVX, NEON).

use super::{Scheme, block_id, is_usable};
use crate::codec::CodingError;
use crate::sparse::{SparseBlocks, round_up};
use bytes::Bytes;
use ecfs_common::{BlockId, SymbolSet};
use reed_solomon_simd::{ReedSolomonDecoder, ReedSolomonEncoder};

/// Shard sizes are kept on this boundary for the SIMD kernels
const SHARD_ALIGNMENT: usize = 64;

const MAX_TOTAL_SHARDS: usize = 255;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReedSolomon {
    data_shards: usize,
    parity_shards: usize,
}

impl ReedSolomon {
    /// Parse a setting of the form `k:m` (or `k,m`)
    pub fn from_setting(setting: &str) -> Result<Self, CodingError> {
        let parse = |s: &str| s.trim().parse::<usize>().ok();
        let (k, m) = setting
            .split_once([':', ','])
            .and_then(|(k, m)| Some((parse(k)?, parse(m)?)))
            .ok_or_else(|| {
                CodingError::InvalidSetting(format!("expected k:m, got {setting:?}"))
            })?;
        Self::new(k, m)
    }

    /// Create a scheme with `k` data shards and `m` parity shards
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self, CodingError> {
        if data_shards == 0 {
            return Err(CodingError::InvalidSetting("data_shards must be > 0".into()));
        }
        if parity_shards == 0 {
            return Err(CodingError::InvalidSetting("parity_shards must be > 0".into()));
        }
        if data_shards + parity_shards > MAX_TOTAL_SHARDS {
            return Err(CodingError::InvalidSetting(format!(
                "total shards must be <= {MAX_TOTAL_SHARDS}"
            )));
        }
        Ok(Self {
            data_shards,
            parity_shards,
        })
    }

    /// Recovery shards computed from `k` original shards
    fn parity_of(&self, originals: &[&[u8]], shard_size: usize) -> Result<Vec<Bytes>, CodingError> {
        let mut encoder = ReedSolomonEncoder::new(self.data_shards, self.parity_shards, shard_size)
            .map_err(|e| CodingError::InvalidSetting(e.to_string()))?;

        for shard in originals {
            encoder
                .add_original_shard(shard)
                .map_err(|e| CodingError::EncodingFailed(e.to_string()))?;
        }

        let result = encoder
            .encode()
            .map_err(|e| CodingError::EncodingFailed(e.to_string()))?;

        Ok(result.recovery_iter().map(Bytes::copy_from_slice).collect())
    }

    /// All `k` original shards, restoring the ones that were not collected
    fn originals(&self, blocks: &SparseBlocks) -> Result<Vec<Vec<u8>>, CodingError> {
        let k = self.data_shards;
        let shard_size = blocks.block_size();

        if (0..k).all(|i| blocks.full(block_id(i)).is_some()) {
            return Ok((0..k)
                .filter_map(|i| blocks.full(block_id(i)).map(<[u8]>::to_vec))
                .collect());
        }

        let available = (0..self.block_count())
            .filter(|&i| blocks.full(block_id(i)).is_some())
            .count();
        if available < k {
            return Err(CodingError::InsufficientBlocks {
                available,
                required: k,
            });
        }

        let mut decoder = ReedSolomonDecoder::new(k, self.parity_shards, shard_size)
            .map_err(|e| CodingError::InvalidSetting(e.to_string()))?;

        // Feed exactly k shards, originals first
        let mut fed = 0;
        for i in 0..self.block_count() {
            if fed == k {
                break;
            }
            let Some(shard) = blocks.full(block_id(i)) else {
                continue;
            };
            let added = if i < k {
                decoder.add_original_shard(i, shard)
            } else {
                decoder.add_recovery_shard(i - k, shard)
            };
            added.map_err(|e| CodingError::DecodingFailed(e.to_string()))?;
            fed += 1;
        }

        let result = decoder
            .decode()
            .map_err(|e| CodingError::DecodingFailed(e.to_string()))?;

        (0..k)
            .map(|i| {
                blocks
                    .full(block_id(i))
                    .or_else(|| result.restored_original(i))
                    .map(<[u8]>::to_vec)
                    .ok_or_else(|| {
                        CodingError::DecodingFailed(format!("failed to restore data shard {i}"))
                    })
            })
            .collect()
    }

    /// First `k` usable blocks in ascending order, originals before recovery
    fn pick_sources(&self, health: &[bool], failed: &[BlockId]) -> Option<Vec<usize>> {
        let sources: Vec<usize> = (0..self.block_count())
            .filter(|&i| is_usable(health, failed, i))
            .take(self.data_shards)
            .collect();
        (sources.len() == self.data_shards).then_some(sources)
    }
}

fn full_blocks(sources: &[usize], size: usize) -> SymbolSet {
    let mut symbols = SymbolSet::new();
    for &i in sources {
        symbols.insert_full(block_id(i), size);
    }
    symbols
}

impl Scheme for ReedSolomon {
    fn block_count(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    fn min_healthy(&self) -> usize {
        self.data_shards
    }

    fn block_size(&self, segment_size: usize) -> usize {
        round_up(segment_size.div_ceil(self.data_shards), SHARD_ALIGNMENT).max(SHARD_ALIGNMENT)
    }

    fn segment_alignment(&self) -> usize {
        SHARD_ALIGNMENT * self.data_shards
    }

    fn is_parity(&self, block_id: BlockId) -> bool {
        block_id as usize >= self.data_shards
    }

    fn encode(&self, segment: &[u8]) -> Result<Vec<Bytes>, CodingError> {
        let shard_size = self.block_size(segment.len());
        let mut padded = vec![0u8; shard_size * self.data_shards];
        padded[..segment.len()].copy_from_slice(segment);

        let originals: Vec<&[u8]> = padded.chunks(shard_size).collect();
        let parity = self.parity_of(&originals, shard_size)?;

        let mut blocks: Vec<Bytes> = originals.into_iter().map(Bytes::copy_from_slice).collect();
        blocks.extend(parity);
        Ok(blocks)
    }

    fn decode(&self, blocks: &SparseBlocks, segment_size: usize) -> Result<Vec<u8>, CodingError> {
        let mut segment = self.originals(blocks)?.concat();
        segment.truncate(segment_size);
        Ok(segment)
    }

    fn required_symbols(&self, health: &[bool], segment_size: usize) -> SymbolSet {
        self.pick_sources(health, &[])
            .map(|sources| full_blocks(&sources, self.block_size(segment_size)))
            .unwrap_or_default()
    }

    fn repair_symbols(
        &self,
        failed: &[BlockId],
        health: &[bool],
        segment_size: usize,
    ) -> SymbolSet {
        self.pick_sources(health, failed)
            .map(|sources| full_blocks(&sources, self.block_size(segment_size)))
            .unwrap_or_default()
    }

    fn repair(
        &self,
        failed: &[BlockId],
        blocks: &SparseBlocks,
        _segment_size: usize,
    ) -> Result<Vec<Bytes>, CodingError> {
        let originals = self.originals(blocks)?;
        let needs_parity = failed.iter().any(|&id| self.is_parity(id));
        let parity = if needs_parity {
            let refs: Vec<&[u8]> = originals.iter().map(Vec::as_slice).collect();
            self.parity_of(&refs, blocks.block_size())?
        } else {
            Vec::new()
        };

        failed
            .iter()
            .map(|&id| {
                let index = id as usize;
                if index < self.data_shards {
                    Ok(Bytes::copy_from_slice(&originals[index]))
                } else {
                    parity.get(index - self.data_shards).cloned().ok_or_else(|| {
                        CodingError::InvalidSetting(format!("block {id} out of range"))
                    })
                }
            })
            .collect()
    }
}
