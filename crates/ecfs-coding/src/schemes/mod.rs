//! Coding scheme implementations
//!
//! Each scheme is a small parameter struct implementing [`Scheme`]. The set is
//! closed: [`crate::CodingEngine`] holds exactly one of them and dispatches.

mod raid5;
mod rdp;
mod reed_solomon;
mod replication;
mod striping;

pub use raid5::Raid5;
pub use rdp::Rdp;
pub use reed_solomon::ReedSolomon;
pub use replication::Replication;
pub use striping::Striping;

use crate::codec::CodingError;
use crate::sparse::SparseBlocks;
use bytes::Bytes;
use ecfs_common::{BlockId, SymbolSet};

/// Operations every coding scheme provides
pub trait Scheme: Send + Sync {
    /// Number of blocks one segment is coded into
    fn block_count(&self) -> usize;

    /// Fewest healthy blocks that still allow a decode
    fn min_healthy(&self) -> usize;

    /// Size of the largest block produced for a segment of `segment_size`
    fn block_size(&self, segment_size: usize) -> usize;

    /// Segment sizes that are a multiple of this fill every block exactly
    fn segment_alignment(&self) -> usize;

    /// Whether a block id holds parity rather than segment bytes
    fn is_parity(&self, block_id: BlockId) -> bool;

    /// Code a segment into `block_count()` blocks
    fn encode(&self, segment: &[u8]) -> Result<Vec<Bytes>, CodingError>;

    /// Rebuild the segment from the collected symbols
    fn decode(&self, blocks: &SparseBlocks, segment_size: usize) -> Result<Vec<u8>, CodingError>;

    /// Minimal symbols for a full decode, empty when unsatisfiable
    fn required_symbols(&self, health: &[bool], segment_size: usize) -> SymbolSet;

    /// Symbols of surviving blocks needed to regenerate `failed`, empty when unsatisfiable
    fn repair_symbols(&self, failed: &[BlockId], health: &[bool], segment_size: usize)
    -> SymbolSet;

    /// Regenerate the full content of each failed block, in `failed` order
    fn repair(
        &self,
        failed: &[BlockId],
        blocks: &SparseBlocks,
        segment_size: usize,
    ) -> Result<Vec<Bytes>, CodingError>;
}

/// A block counts as usable when it is marked healthy and not being repaired
pub(crate) fn is_usable(health: &[bool], failed: &[BlockId], index: usize) -> bool {
    health.get(index).copied().unwrap_or(false)
        && !failed.iter().any(|&f| f as usize == index)
}

/// Block ids as `u32`; scheme block counts are bounded by setting parsing
#[allow(clippy::cast_possible_truncation)]
pub(crate) const fn block_id(index: usize) -> BlockId {
    index as BlockId
}

/// Parse a positive integer scheme parameter
pub(crate) fn parse_param(setting: &str, name: &str) -> Result<usize, CodingError> {
    setting
        .trim()
        .parse::<usize>()
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| CodingError::InvalidSetting(format!("{name} must be a positive integer, got {setting:?}")))
}
