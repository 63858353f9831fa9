//! On-disk layout
//!
//! ```text
//! <segment_cache_dir>/<segment_id>                    cached segment
//! <segment_cache_dir>/<segment_id>.<seq>.tmp          segment being cached
//! <block_dir>/<segment_id>.<block_id>                 block
//! <block_dir>/<segment_id>.<block_id>.<delta_id>      pending delta of a block
//! ```

use ecfs_common::{BlockKey, DeltaId, SegmentId};
use std::path::{Path, PathBuf};

/// A file found in the block directory
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockFile {
    Block(BlockKey),
    Delta(BlockKey, DeltaId),
}

/// Path derivation for every file the store owns
#[derive(Clone, Debug)]
pub struct Layout {
    block_dir: PathBuf,
    segment_dir: PathBuf,
}

impl Layout {
    #[must_use]
    pub fn new(block_dir: impl Into<PathBuf>, segment_dir: impl Into<PathBuf>) -> Self {
        Self {
            block_dir: block_dir.into(),
            segment_dir: segment_dir.into(),
        }
    }

    #[must_use]
    pub fn block_dir(&self) -> &Path {
        &self.block_dir
    }

    #[must_use]
    pub fn segment_dir(&self) -> &Path {
        &self.segment_dir
    }

    #[must_use]
    pub fn segment_path(&self, segment_id: SegmentId) -> PathBuf {
        self.segment_dir.join(segment_id.to_string())
    }

    /// Where a segment is written before it becomes visible in the cache
    #[must_use]
    pub fn segment_staging_path(&self, segment_id: SegmentId, seq: u64) -> PathBuf {
        self.segment_dir.join(format!("{segment_id}.{seq}.tmp"))
    }

    #[must_use]
    pub fn block_path(&self, key: BlockKey) -> PathBuf {
        self.block_dir.join(key.to_string())
    }

    #[must_use]
    pub fn delta_path(&self, key: BlockKey, delta_id: DeltaId) -> PathBuf {
        self.block_dir.join(format!("{key}.{delta_id}"))
    }

    /// Classify a file name from the block directory
    #[must_use]
    pub fn parse_block_file(name: &str) -> Option<BlockFile> {
        let mut parts = name.split('.');
        let segment_id = SegmentId::new(parts.next()?.parse().ok()?);
        let block_id = parts.next()?.parse().ok()?;
        let key = BlockKey::new(segment_id, block_id);
        match (parts.next(), parts.next()) {
            (None, _) => Some(BlockFile::Block(key)),
            (Some(delta), None) => Some(BlockFile::Delta(key, delta.parse().ok()?)),
            _ => None,
        }
    }

    /// Whether a file in the segment cache directory is an unfinished write
    #[must_use]
    pub fn is_staging_file(name: &str) -> bool {
        name.ends_with(".tmp")
    }

    /// Segment id of a file name from the segment cache directory
    #[must_use]
    pub fn parse_segment_file(name: &str) -> Option<SegmentId> {
        name.parse().ok().map(SegmentId::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let layout = Layout::new("/data/blocks", "/data/segments");
        let key = BlockKey::new(SegmentId::new(12), 3);

        assert_eq!(
            layout.segment_path(SegmentId::new(12)),
            PathBuf::from("/data/segments/12")
        );
        assert_eq!(layout.block_path(key), PathBuf::from("/data/blocks/12.3"));
        assert_eq!(layout.delta_path(key, 7), PathBuf::from("/data/blocks/12.3.7"));
        assert_eq!(
            layout.segment_staging_path(SegmentId::new(12), 4),
            PathBuf::from("/data/segments/12.4.tmp")
        );
    }

    #[test]
    fn test_parse_block_file() {
        let key = BlockKey::new(SegmentId::new(12), 3);
        assert_eq!(Layout::parse_block_file("12.3"), Some(BlockFile::Block(key)));
        assert_eq!(
            Layout::parse_block_file("12.3.7"),
            Some(BlockFile::Delta(key, 7))
        );
        assert_eq!(Layout::parse_block_file("12"), None);
        assert_eq!(Layout::parse_block_file("12.3.7.1"), None);
        assert_eq!(Layout::parse_block_file("tmp.3"), None);
    }

    #[test]
    fn test_parse_segment_file() {
        assert_eq!(Layout::parse_segment_file("42"), Some(SegmentId::new(42)));
        assert_eq!(Layout::parse_segment_file("42.tmp"), None);
        assert_eq!(Layout::parse_segment_file("42.0.tmp"), None);
        assert!(Layout::is_staging_file("42.0.tmp"));
        assert!(!Layout::is_staging_file("42"));
    }
}
