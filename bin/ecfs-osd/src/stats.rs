//! OSD request statistics

use std::sync::atomic::{AtomicU64, Ordering};

/// Protocol counters of one OSD
#[derive(Debug, Default)]
pub struct OsdStats {
    /// Segments encoded and committed
    pub segments_uploaded: AtomicU64,
    /// Uploads rejected by the checksum check
    pub checksum_failures: AtomicU64,
    /// Blocks placed on a node, local or remote
    pub blocks_distributed: AtomicU64,
    /// Segment reconstructions (one per coalesced download)
    pub decodes: AtomicU64,
    /// Block fetches issued to peers for downloads
    pub remote_block_requests: AtomicU64,
    /// Downloads served by waiting on another caller's reconstruction
    pub coalesced_waits: AtomicU64,
    /// Downloads served from the disk cache
    pub cache_hits: AtomicU64,
    /// Repair requests completed
    pub repairs: AtomicU64,
}

impl OsdStats {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy for reporting
    #[must_use]
    pub fn snapshot(&self) -> OsdStatsSnapshot {
        OsdStatsSnapshot {
            segments_uploaded: self.segments_uploaded.load(Ordering::Relaxed),
            checksum_failures: self.checksum_failures.load(Ordering::Relaxed),
            blocks_distributed: self.blocks_distributed.load(Ordering::Relaxed),
            decodes: self.decodes.load(Ordering::Relaxed),
            remote_block_requests: self.remote_block_requests.load(Ordering::Relaxed),
            coalesced_waits: self.coalesced_waits.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            repairs: self.repairs.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of [`OsdStats`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OsdStatsSnapshot {
    pub segments_uploaded: u64,
    pub checksum_failures: u64,
    pub blocks_distributed: u64,
    pub decodes: u64,
    pub remote_block_requests: u64,
    pub coalesced_waits: u64,
    pub cache_hits: u64,
    pub repairs: u64,
}
