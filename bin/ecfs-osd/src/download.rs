//! Segment download with request coalescing and degraded read
//!
//! Concurrent downloads of one segment share a slot: the first caller to
//! take the slot's lock reconstructs the segment (or reads it from the disk
//! cache) while the others wait on that lock and then reuse the result. The
//! slot holds a shared handle to the bytes; it is dropped with the last
//! caller, and the memory with the last outstanding handle.
//!
//! A local-retrieve request only makes sure the segment ends up in this
//! node's disk cache; it never receives bytes.

use crate::osd::{Osd, bounded};
use crate::stats::OsdStats;
use bytes::Bytes;
use ecfs_coding::{BlockMap, CodingEngine};
use ecfs_common::{
    BlockId, BlockKey, Error, Result, SegmentId, SegmentInfo, SymbolSet, content_hash,
};
use ecfs_storage::PendingCounter;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Answer to a download
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SegmentReply {
    /// The segment bytes
    Data(Bytes),
    /// Local retrieve: the segment is in this node's disk cache
    Cached,
}

impl SegmentReply {
    #[must_use]
    pub fn into_data(self) -> Option<Bytes> {
        match self {
            Self::Data(data) => Some(data),
            Self::Cached => None,
        }
    }
}

pub(crate) struct DownloadSlot {
    callers: usize,
    data: Arc<tokio::sync::Mutex<Option<Bytes>>>,
}

/// Leaves the coalescing slot when dropped, including on cancellation
struct SlotGuard<'a> {
    osd: &'a Osd,
    segment_id: SegmentId,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let mut slots = self.osd.slots.lock();
        if let Some(slot) = slots.get_mut(&self.segment_id) {
            slot.callers -= 1;
            if slot.callers == 0 {
                slots.remove(&self.segment_id);
            }
        }
    }
}

/// Blocks a reconstruction expects peers to push back
pub(crate) struct BlockCollector {
    expected: BTreeSet<BlockId>,
    blocks: Mutex<BlockMap>,
    pending: PendingCounter,
}

impl BlockCollector {
    fn new(expected: BTreeSet<BlockId>) -> Self {
        let pending = PendingCounter::new(expected.len() as u64);
        Self {
            expected,
            blocks: Mutex::new(BlockMap::new()),
            pending,
        }
    }

    pub(crate) fn expects(&self, block_id: BlockId) -> bool {
        self.expected.contains(&block_id)
    }

    /// Hand over one fetched block; a repeated delivery is rejected without
    /// counting
    pub(crate) fn deliver(&self, block_id: BlockId, data: Bytes) -> Result<()> {
        let mut blocks = self.blocks.lock();
        if blocks.contains_key(&block_id) {
            return Err(Error::invalid_argument(format!(
                "block {block_id} delivered twice"
            )));
        }
        blocks.insert(block_id, data);
        drop(blocks);
        self.pending.complete_one()?;
        Ok(())
    }

    async fn wait(&self) -> BlockMap {
        self.pending.wait().await;
        std::mem::take(&mut *self.blocks.lock())
    }
}

/// Unregisters a collector when dropped
struct CollectorGuard<'a> {
    osd: &'a Osd,
    segment_id: SegmentId,
}

impl Drop for CollectorGuard<'_> {
    fn drop(&mut self) {
        self.osd.collectors.lock().remove(&self.segment_id);
    }
}

impl Osd {
    /// Download a segment, reconstructing it from its blocks if it is not in
    /// the disk cache
    pub async fn get_segment(
        &self,
        segment_id: SegmentId,
        local_retrieve: bool,
    ) -> Result<SegmentReply> {
        let slot = {
            let mut slots = self.slots.lock();
            let slot = slots.entry(segment_id).or_insert_with(|| DownloadSlot {
                callers: 0,
                data: Arc::new(tokio::sync::Mutex::new(None)),
            });
            slot.callers += 1;
            Arc::clone(&slot.data)
        };
        let _guard = SlotGuard {
            osd: self,
            segment_id,
        };

        let mut data = slot.lock().await;
        if let Some(bytes) = data.as_ref() {
            OsdStats::incr(&self.stats.coalesced_waits);
            debug!(segment = %segment_id, local_retrieve, "Download served by coalesced request");
            return Ok(reply(bytes.clone(), local_retrieve));
        }

        if local_retrieve {
            if self.store.is_cached(segment_id) {
                OsdStats::incr(&self.stats.cache_hits);
                return Ok(SegmentReply::Cached);
            }
        } else {
            match self.store.get_from_disk_cache(segment_id) {
                Ok(bytes) => {
                    OsdStats::incr(&self.stats.cache_hits);
                    debug!(segment = %segment_id, "Download served from disk cache");
                    *data = Some(bytes.clone());
                    return Ok(SegmentReply::Data(bytes));
                }
                Err(Error::SegmentNotCached(_)) => {}
                Err(e) => {
                    // The blocks are still authoritative; drop the bad entry and rebuild
                    warn!(segment = %segment_id, error = %e, "Cached segment unreadable");
                    self.store.remove_from_disk_cache(segment_id);
                }
            }
        }

        // The slot stays empty on failure so the next caller retries
        let bytes = self.reconstruct(segment_id).await.inspect_err(|e| {
            error!(segment = %segment_id, error = %e, "Segment reconstruction failed");
        })?;
        self.cache_segment(segment_id, &bytes);
        *data = Some(bytes.clone());
        Ok(reply(bytes, local_retrieve))
    }

    async fn reconstruct(&self, segment_id: SegmentId) -> Result<Bytes> {
        let info = self.mds.get_segment_info(segment_id).await?;
        let engine = CodingEngine::new(info.coding_scheme, &info.coding_setting)?;
        let size = usize::try_from(info.size)
            .map_err(|_| Error::invalid_argument(format!("segment size {}", info.size)))?;

        let health = self.monitor.get_node_health(&info.node_list).await?;
        let required = engine.required_symbols(&health, size);
        if required.is_empty() {
            return Err(Error::InsufficientBlocks(segment_id));
        }
        debug!(
            segment = %segment_id,
            blocks = ?required.block_ids().collect::<Vec<_>>(),
            bytes = required.total_bytes(),
            "Collecting blocks"
        );

        let blocks = self.collect_blocks(&info, &required).await?;
        let segment = engine.decode(&blocks, &required, size)?;
        OsdStats::incr(&self.stats.decodes);

        let actual = content_hash(&segment);
        if actual != info.checksum {
            return Err(Error::ChecksumMismatch {
                expected: info.checksum,
                actual,
            });
        }
        info!(segment = %segment_id, size, scheme = %info.coding_scheme, "Segment reconstructed");
        Ok(Bytes::from(segment))
    }

    /// Read local blocks directly and have owners push the remote ones
    async fn collect_blocks(&self, info: &SegmentInfo, required: &SymbolSet) -> Result<BlockMap> {
        let segment_id = info.segment_id;
        let mut blocks = BlockMap::new();
        let mut remote = Vec::new();
        for (block_id, symbols) in required.iter() {
            let owner = info.owner_of(block_id).ok_or_else(|| {
                Error::internal(format!("segment {segment_id} has no owner for block {block_id}"))
            })?;
            let key = BlockKey::new(segment_id, block_id);
            if owner == self.node_id {
                blocks.insert(block_id, self.store.read_block(key, symbols)?.freeze());
            } else {
                remote.push((owner, key, symbols.to_vec()));
            }
        }
        if remote.is_empty() {
            return Ok(blocks);
        }

        let collector = Arc::new(BlockCollector::new(
            remote.iter().map(|(_, key, _)| key.block_id).collect(),
        ));
        self.collectors
            .lock()
            .insert(segment_id, Arc::clone(&collector));
        let _registration = CollectorGuard {
            osd: self,
            segment_id,
        };

        bounded(
            self.transfer.recovery_workers,
            remote,
            |(owner, key, symbols)| async move {
                OsdStats::incr(&self.stats.remote_block_requests);
                self.peers.get_block(owner, self.node_id, key, symbols).await
            },
        )
        .await?;

        blocks.extend(collector.wait().await);
        Ok(blocks)
    }
}

fn reply(bytes: Bytes, local_retrieve: bool) -> SegmentReply {
    if local_retrieve {
        SegmentReply::Cached
    } else {
        SegmentReply::Data(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_collector_waits_for_every_block() {
        let collector = Arc::new(BlockCollector::new([1, 3].into_iter().collect()));
        assert!(collector.expects(1));
        assert!(!collector.expects(2));

        let waiter = {
            let collector = Arc::clone(&collector);
            tokio::spawn(async move { collector.wait().await })
        };
        collector.deliver(3, Bytes::from_static(b"c")).unwrap();
        assert!(collector.deliver(3, Bytes::from_static(b"c")).is_err());
        collector.deliver(1, Bytes::from_static(b"a")).unwrap();

        let blocks = waiter.await.unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(&blocks[&1][..], b"a");
    }

    #[test]
    fn test_reply() {
        let bytes = Bytes::from_static(b"seg");
        assert_eq!(reply(bytes.clone(), true), SegmentReply::Cached);
        assert_eq!(
            reply(bytes.clone(), false).into_data(),
            Some(bytes)
        );
    }
}
