//! Core type definitions for ecfs
//!
//! This module defines the identifiers and metadata structures shared by the
//! coding engine, the storage module and the OSD request processors.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Index of a block within a segment's coding scheme
pub type BlockId = u32;

/// Monotonic identifier of a pending delta update of one block
pub type DeltaId = u32;

/// Identifier of a segment (a fixed-size chunk of a file)
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into, Display,
)]
#[display("{_0}")]
pub struct SegmentId(u64);

impl SegmentId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Identifier of a storage node (OSD)
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into, Display,
)]
#[display("{_0}")]
pub struct NodeId(u32);

impl NodeId {
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

/// Composite key of one block of one segment, rendered as `seg.blk`
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockKey {
    pub segment_id: SegmentId,
    pub block_id: BlockId,
}

impl BlockKey {
    #[must_use]
    pub const fn new(segment_id: SegmentId, block_id: BlockId) -> Self {
        Self {
            segment_id,
            block_id,
        }
    }
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.segment_id, self.block_id)
    }
}

/// A contiguous byte range within a block
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol {
    pub offset: usize,
    pub length: usize,
}

impl Symbol {
    #[must_use]
    pub const fn new(offset: usize, length: usize) -> Self {
        Self { offset, length }
    }

    /// One past the last byte covered by this symbol
    #[must_use]
    pub const fn end(&self) -> usize {
        self.offset + self.length
    }
}

/// Map from block id to the ordered list of symbols needed from that block
///
/// An empty set is the "unsatisfiable" signal of the coding engine: the
/// available blocks are not enough to reconstruct the requested data.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolSet(BTreeMap<BlockId, Vec<Symbol>>);

impl SymbolSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the whole `[0, length)` range of a block
    pub fn insert_full(&mut self, block_id: BlockId, length: usize) {
        self.0.insert(block_id, vec![Symbol::new(0, length)]);
    }

    /// Append a symbol to a block's list
    pub fn push(&mut self, block_id: BlockId, symbol: Symbol) {
        self.0.entry(block_id).or_default().push(symbol);
    }

    /// Replace a block's symbol list
    pub fn set(&mut self, block_id: BlockId, symbols: Vec<Symbol>) {
        self.0.insert(block_id, symbols);
    }

    #[must_use]
    pub fn get(&self, block_id: BlockId) -> Option<&[Symbol]> {
        self.0.get(&block_id).map(Vec::as_slice)
    }

    #[must_use]
    pub fn contains(&self, block_id: BlockId) -> bool {
        self.0.contains_key(&block_id)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of blocks referenced
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Block ids in ascending order
    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.0.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (BlockId, &[Symbol])> {
        self.0.iter().map(|(id, symbols)| (*id, symbols.as_slice()))
    }

    /// Total number of bytes requested from one block
    #[must_use]
    pub fn bytes_for(&self, block_id: BlockId) -> usize {
        self.get(block_id)
            .map_or(0, |symbols| symbols.iter().map(|s| s.length).sum())
    }

    /// Total number of bytes requested across all blocks
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.0.values().flatten().map(|s| s.length).sum()
    }
}

impl FromIterator<(BlockId, Vec<Symbol>)> for SymbolSet {
    fn from_iter<T: IntoIterator<Item = (BlockId, Vec<Symbol>)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Coding schemes supported by the storage engine
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodingScheme {
    /// `n` identical full copies
    Replication,
    /// `k` disjoint stripes, no redundancy
    Striping,
    /// `n - 1` data blocks and one XOR parity block
    Raid5,
    /// `k` data blocks and `m` Reed-Solomon parity blocks
    ReedSolomon,
    /// Row-diagonal parity: `k` data blocks, one row and one diagonal parity
    Rdp,
}

impl CodingScheme {
    pub const ALL: [Self; 5] = [
        Self::Replication,
        Self::Striping,
        Self::Raid5,
        Self::ReedSolomon,
        Self::Rdp,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Replication => "replication",
            Self::Striping => "striping",
            Self::Raid5 => "raid5",
            Self::ReedSolomon => "reed_solomon",
            Self::Rdp => "rdp",
        }
    }
}

impl fmt::Display for CodingScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CodingScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "replication" | "raid1" => Ok(Self::Replication),
            "striping" | "raid0" => Ok(Self::Striping),
            "raid5" => Ok(Self::Raid5),
            "reed_solomon" | "rs" => Ok(Self::ReedSolomon),
            "rdp" => Ok(Self::Rdp),
            other => Err(format!("unknown coding scheme: {other}")),
        }
    }
}

/// Coding metadata of a committed segment, as kept by the metadata service
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInfo {
    pub segment_id: SegmentId,
    /// Segment length in bytes
    pub size: u64,
    pub coding_scheme: CodingScheme,
    /// Scheme parameters, e.g. `3` for replication or `4:2` for Reed-Solomon
    pub coding_setting: String,
    /// Hex content hash of the segment bytes
    pub checksum: String,
    /// Owner of each block, indexed by block id
    pub node_list: Vec<NodeId>,
}

impl SegmentInfo {
    /// Node that owns a block, if the block id is in range
    #[must_use]
    pub fn owner_of(&self, block_id: BlockId) -> Option<NodeId> {
        self.node_list.get(block_id as usize).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_key_display() {
        let key = BlockKey::new(SegmentId::new(42), 3);
        assert_eq!(key.to_string(), "42.3");
    }

    #[test]
    fn test_symbol_set_accounting() {
        let mut set = SymbolSet::new();
        assert!(set.is_empty());

        set.insert_full(2, 100);
        set.push(0, Symbol::new(0, 10));
        set.push(0, Symbol::new(20, 5));

        assert_eq!(set.len(), 2);
        assert_eq!(set.block_ids().collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(set.bytes_for(0), 15);
        assert_eq!(set.bytes_for(1), 0);
        assert_eq!(set.total_bytes(), 115);
        assert_eq!(set.get(0).map(<[Symbol]>::len), Some(2));
    }

    #[test]
    fn test_coding_scheme_parse() {
        for scheme in CodingScheme::ALL {
            assert_eq!(scheme.as_str().parse::<CodingScheme>(), Ok(scheme));
        }
        assert_eq!("RAID1".parse::<CodingScheme>(), Ok(CodingScheme::Replication));
        assert!("evenodd".parse::<CodingScheme>().is_err());
    }

    #[test]
    fn test_segment_owner() {
        let info = SegmentInfo {
            segment_id: SegmentId::new(1),
            size: 10,
            coding_scheme: CodingScheme::Replication,
            coding_setting: "2".into(),
            checksum: String::new(),
            node_list: vec![NodeId::new(7), NodeId::new(9)],
        };
        assert_eq!(info.owner_of(1), Some(NodeId::new(9)));
        assert_eq!(info.owner_of(2), None);
    }
}
