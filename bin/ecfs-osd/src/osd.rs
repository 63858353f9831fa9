//! OSD request orchestrator
//!
//! [`Osd`] drives the segment protocols of one storage node on top of its
//! [`SegmentStore`]: upload (encode and distribute), the block
//! sub-protocol, coalesced download with degraded read, and repair. Each
//! protocol keeps its own per-segment state in a separately locked map.

use crate::client::{MetadataClient, MonitorClient, PeerClient};
use crate::download::{BlockCollector, DownloadSlot};
use crate::stats::OsdStats;
use crate::upload::PendingUpload;
use bytes::Bytes;
use ecfs_coding::Block;
use ecfs_common::config::TransferConfig;
use ecfs_common::{BlockKey, Error, NodeId, Result, SegmentId};
use ecfs_storage::{SegmentStore, TransferKey};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Storage node request orchestrator
pub struct Osd {
    pub(crate) node_id: NodeId,
    pub(crate) store: Arc<SegmentStore>,
    pub(crate) transfer: TransferConfig,
    pub(crate) peers: Arc<dyn PeerClient>,
    pub(crate) mds: Arc<dyn MetadataClient>,
    pub(crate) monitor: Arc<dyn MonitorClient>,
    /// Segment uploads between Init and End
    pub(crate) uploads: Mutex<HashMap<SegmentId, PendingUpload>>,
    /// Reconstructions waiting for blocks pushed by peers
    pub(crate) collectors: Mutex<HashMap<SegmentId, Arc<BlockCollector>>>,
    /// Coalescing slots of in-flight downloads
    pub(crate) slots: Mutex<HashMap<SegmentId, DownloadSlot>>,
    /// Chunk offsets already counted, per open transfer
    pub(crate) received: Mutex<HashMap<TransferKey, HashSet<u64>>>,
    pub(crate) stats: OsdStats,
}

impl Osd {
    #[must_use]
    pub fn new(
        node_id: NodeId,
        store: Arc<SegmentStore>,
        transfer: TransferConfig,
        peers: Arc<dyn PeerClient>,
        mds: Arc<dyn MetadataClient>,
        monitor: Arc<dyn MonitorClient>,
    ) -> Self {
        Self {
            node_id,
            store,
            transfer,
            peers,
            mds,
            monitor,
            uploads: Mutex::new(HashMap::new()),
            collectors: Mutex::new(HashMap::new()),
            slots: Mutex::new(HashMap::new()),
            received: Mutex::new(HashMap::new()),
            stats: OsdStats::default(),
        }
    }

    #[must_use]
    pub const fn node_id(&self) -> NodeId {
        self.node_id
    }

    #[must_use]
    pub fn store(&self) -> &SegmentStore {
        &self.store
    }

    #[must_use]
    pub const fn stats(&self) -> &OsdStats {
        &self.stats
    }

    /// Count a written chunk once, however often it is delivered, returning
    /// how many chunks are still outstanding
    pub(crate) fn chunk_received(&self, key: TransferKey, offset: u64) -> Result<u64> {
        let first = self.received.lock().entry(key).or_default().insert(offset);
        if first {
            return self.store.chunk_done(key);
        }
        let pending = self.store.session(key)?.pending();
        debug!(%key, offset, pending, "Duplicate chunk not counted");
        Ok(pending)
    }

    /// Drop the chunk record of a transfer that was opened or closed
    pub(crate) fn forget_chunks(&self, key: TransferKey) {
        self.received.lock().remove(&key);
    }

    /// Place every block on its target node, at most `distribution_workers`
    /// at a time, returning once all placements have completed
    pub(crate) async fn distribute(
        &self,
        segment_id: SegmentId,
        placements: Vec<(Block, NodeId)>,
    ) -> Result<()> {
        let count = placements.len();
        bounded(
            self.transfer.distribution_workers,
            placements,
            |(block, target)| self.place_block(segment_id, block, target),
        )
        .await?;
        debug!(segment = %segment_id, blocks = count, "Blocks distributed");
        Ok(())
    }

    async fn place_block(&self, segment_id: SegmentId, block: Block, target: NodeId) -> Result<()> {
        let key = BlockKey::new(segment_id, block.block_id);
        if !block.verify() {
            return Err(Error::internal(format!("block {key} corrupted before placement")));
        }
        if target == self.node_id {
            self.store.store_block(key, &block.data)?;
        } else {
            self.send_block(target, key, block.data.clone()).await?;
        }
        OsdStats::incr(&self.stats.blocks_distributed);
        debug!(block = %key, %target, bytes = block.data.len(), "Block placed");
        Ok(())
    }

    /// Push a block to a peer through the block sub-protocol in
    /// `chunk_size` pieces
    pub(crate) async fn send_block(&self, target: NodeId, key: BlockKey, data: Bytes) -> Result<()> {
        let chunk_size = self.transfer.chunk_size.max(1);
        let chunk_count = data.len().div_ceil(chunk_size) as u64;

        self.peers
            .put_block_init(target, self.node_id, key, data.len() as u64, chunk_count)
            .await?;
        for offset in (0..data.len()).step_by(chunk_size) {
            let end = (offset + chunk_size).min(data.len());
            self.peers
                .put_block_data(target, key, offset as u64, data.slice(offset..end))
                .await?;
        }
        self.peers.put_block_end(target, key).await
    }

    /// Write a segment to the local disk cache; failure only costs a future
    /// cache miss
    pub(crate) fn cache_segment(&self, segment_id: SegmentId, data: &[u8]) {
        match self.store.put_to_disk_cache(segment_id, data) {
            Ok(()) => {}
            Err(Error::SegmentTooLarge { size, capacity }) => {
                debug!(segment = %segment_id, size, capacity, "Segment too large to cache");
            }
            Err(e) => {
                warn!(segment = %segment_id, error = %e, "Failed to cache segment");
            }
        }
    }
}

/// Run `task` over every item with at most `limit` in flight, waiting for
/// all of them
///
/// Results come back in item order; the first error is returned after every
/// task has finished.
pub(crate) async fn bounded<I, F, Fut, T>(limit: usize, items: I, task: F) -> Result<Vec<T>>
where
    I: IntoIterator,
    F: Fn(I::Item) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let semaphore = Semaphore::new(limit.max(1));
    let semaphore = &semaphore;
    let futures = items.into_iter().map(|item| {
        let fut = task(item);
        async move {
            let _permit = semaphore
                .acquire()
                .await
                .map_err(|_| Error::internal("worker pool closed"))?;
            fut.await
        }
    });
    join_all(futures).await.into_iter().collect()
}
