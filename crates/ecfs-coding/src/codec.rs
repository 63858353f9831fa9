//! Coding engine
//!
//! [`CodingEngine`] is the single entry point the storage node uses: it is
//! built from a segment's `(coding scheme, coding setting)` pair and
//! dispatches to the matching scheme.
//!
//! ```
//! use ecfs_coding::CodingEngine;
//! use ecfs_common::CodingScheme;
//!
//! let engine = CodingEngine::new(CodingScheme::Replication, "3").unwrap();
//! let blocks = engine.encode(b"ABCDE").unwrap();
//! assert_eq!(blocks.len(), 3);
//! ```

use crate::block::Block;
use crate::schemes::{Raid5, Rdp, ReedSolomon, Replication, Scheme, Striping};
use crate::sparse::{BlockMap, SparseBlocks};
use ecfs_common::{BlockId, CodingScheme, Error as CommonError, SymbolSet};
use thiserror::Error;
use tracing::debug;

/// Errors specific to coding operations
#[derive(Debug, Error)]
pub enum CodingError {
    #[error("invalid coding setting: {0}")]
    InvalidSetting(String),

    #[error("encoding failed: {0}")]
    EncodingFailed(String),

    #[error("decoding failed: {0}")]
    DecodingFailed(String),

    #[error("symbols of block {block_id} were not collected")]
    MissingSymbols { block_id: BlockId },

    #[error("block {block_id}: collected {actual} bytes, symbols cover {expected}")]
    SymbolSizeMismatch {
        block_id: BlockId,
        expected: usize,
        actual: usize,
    },

    #[error("block {block_id}: symbol ends at {end}, beyond block size {block_size}")]
    SymbolOutOfRange {
        block_id: BlockId,
        end: usize,
        block_size: usize,
    },

    #[error("insufficient blocks: have {available}, need {required}")]
    InsufficientBlocks { available: usize, required: usize },
}

impl From<CodingError> for CommonError {
    fn from(e: CodingError) -> Self {
        Self::Coding(e.to_string())
    }
}

/// One coding scheme with its parsed setting
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CodingEngine {
    Replication(Replication),
    Striping(Striping),
    Raid5(Raid5),
    ReedSolomon(ReedSolomon),
    Rdp(Rdp),
}

impl CodingEngine {
    /// Build the engine for a scheme and its setting string
    pub fn new(scheme: CodingScheme, setting: &str) -> Result<Self, CodingError> {
        Ok(match scheme {
            CodingScheme::Replication => Self::Replication(Replication::from_setting(setting)?),
            CodingScheme::Striping => Self::Striping(Striping::from_setting(setting)?),
            CodingScheme::Raid5 => Self::Raid5(Raid5::from_setting(setting)?),
            CodingScheme::ReedSolomon => Self::ReedSolomon(ReedSolomon::from_setting(setting)?),
            CodingScheme::Rdp => Self::Rdp(Rdp::from_setting(setting)?),
        })
    }

    fn inner(&self) -> &dyn Scheme {
        match self {
            Self::Replication(s) => s,
            Self::Striping(s) => s,
            Self::Raid5(s) => s,
            Self::ReedSolomon(s) => s,
            Self::Rdp(s) => s,
        }
    }

    #[must_use]
    pub const fn scheme(&self) -> CodingScheme {
        match self {
            Self::Replication(_) => CodingScheme::Replication,
            Self::Striping(_) => CodingScheme::Striping,
            Self::Raid5(_) => CodingScheme::Raid5,
            Self::ReedSolomon(_) => CodingScheme::ReedSolomon,
            Self::Rdp(_) => CodingScheme::Rdp,
        }
    }

    /// Number of blocks a segment is coded into
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.inner().block_count()
    }

    /// Fewest healthy blocks that still allow a decode
    #[must_use]
    pub fn min_healthy(&self) -> usize {
        self.inner().min_healthy()
    }

    /// Size of the largest block for a segment of `segment_size` bytes
    #[must_use]
    pub fn block_size(&self, segment_size: usize) -> usize {
        self.inner().block_size(segment_size)
    }

    /// Segment size granularity at which blocks carry no padding
    #[must_use]
    pub fn segment_alignment(&self) -> usize {
        self.inner().segment_alignment()
    }

    #[must_use]
    pub fn is_parity(&self, block_id: BlockId) -> bool {
        self.inner().is_parity(block_id)
    }

    /// Code a segment into blocks with ids `0..block_count()`
    pub fn encode(&self, segment: &[u8]) -> Result<Vec<Block>, CodingError> {
        let blocks = self.inner().encode(segment)?;
        debug!(
            scheme = %self.scheme(),
            segment_size = segment.len(),
            blocks = blocks.len(),
            "encoded segment"
        );
        Ok(blocks
            .into_iter()
            .enumerate()
            .map(|(i, data)| {
                let id = crate::schemes::block_id(i);
                Block::new(id, data, self.is_parity(id))
            })
            .collect())
    }

    /// Rebuild a segment from the blocks named in `required`
    ///
    /// `blocks` maps each block id to the concatenation of its required
    /// symbols, in the order they appear in `required`.
    pub fn decode(
        &self,
        blocks: &BlockMap,
        required: &SymbolSet,
        segment_size: usize,
    ) -> Result<Vec<u8>, CodingError> {
        if required.is_empty() {
            return Err(CodingError::InsufficientBlocks {
                available: 0,
                required: self.min_healthy(),
            });
        }
        let sparse = SparseBlocks::gather(self.block_size(segment_size), blocks, required)?;
        self.inner().decode(&sparse, segment_size)
    }

    /// Minimal symbols needed to decode, empty if `health` leaves too few blocks
    #[must_use]
    pub fn required_symbols(&self, health: &[bool], segment_size: usize) -> SymbolSet {
        self.inner().required_symbols(health, segment_size)
    }

    /// Symbols of surviving blocks needed to regenerate `failed`
    #[must_use]
    pub fn repair_symbols(
        &self,
        failed: &[BlockId],
        health: &[bool],
        segment_size: usize,
    ) -> SymbolSet {
        if failed.is_empty() {
            return SymbolSet::new();
        }
        self.inner().repair_symbols(failed, health, segment_size)
    }

    /// Regenerate each failed block from the collected repair symbols
    pub fn repair(
        &self,
        failed: &[BlockId],
        collected: &BlockMap,
        symbols: &SymbolSet,
        segment_size: usize,
    ) -> Result<Vec<Block>, CodingError> {
        if let Some(&id) = failed.iter().find(|&&id| id as usize >= self.block_count()) {
            return Err(CodingError::InvalidSetting(format!(
                "block {id} out of range for {} blocks",
                self.block_count()
            )));
        }
        let sparse = SparseBlocks::gather(self.block_size(segment_size), collected, symbols)?;
        let repaired = self.inner().repair(failed, &sparse, segment_size)?;
        debug!(
            scheme = %self.scheme(),
            failed = ?failed,
            read = symbols.total_bytes(),
            "repaired blocks"
        );
        Ok(failed
            .iter()
            .zip(repaired)
            .map(|(&id, data)| Block::new(id, data, self.is_parity(id)))
            .collect())
    }
}
