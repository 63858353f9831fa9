//! Segment upload protocol
//!
//! `Init` opens a transfer session, each `Data` chunk is copied in and
//! counted, and `End` waits for the last chunk, verifies the checksum,
//! encodes, distributes the blocks to the placed nodes and commits the
//! segment to the metadata service. The staged bytes are then kept in the
//! disk cache and the session is closed whether or not the upload succeeded.

use crate::osd::Osd;
use crate::stats::OsdStats;
use ecfs_coding::CodingEngine;
use ecfs_common::{CodingScheme, Error, Result, SegmentId, SegmentInfo, content_hash};
use tracing::{debug, error, info, warn};

/// Parameters announced by an upload's `Init`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadRequest {
    /// Segment length in bytes
    pub length: u64,
    /// Number of `Data` chunks that will follow
    pub chunk_count: u64,
    pub coding_scheme: CodingScheme,
    pub coding_setting: String,
    /// Hex SHA-256 of the segment bytes
    pub checksum: String,
}

pub(crate) struct PendingUpload {
    request: UploadRequest,
    engine: CodingEngine,
}

impl Osd {
    /// Start receiving a segment
    ///
    /// The coding setting is validated here so a bad request fails before
    /// any data is sent.
    pub fn put_segment_init(&self, segment_id: SegmentId, request: UploadRequest) -> Result<()> {
        let engine = CodingEngine::new(request.coding_scheme, &request.coding_setting)?;
        let length = usize::try_from(request.length)
            .map_err(|_| Error::invalid_argument(format!("segment length {}", request.length)))?;

        let mut uploads = self.uploads.lock();
        self.store
            .begin_transfer(segment_id, length, request.chunk_count)?;
        self.forget_chunks(segment_id.into());
        info!(
            segment = %segment_id,
            length,
            chunks = request.chunk_count,
            scheme = %request.coding_scheme,
            setting = %request.coding_setting,
            "Upload started"
        );
        uploads.insert(segment_id, PendingUpload { request, engine });
        Ok(())
    }

    /// Accept one chunk, returning how many are still outstanding
    ///
    /// A chunk that cannot be written is not counted, and a chunk delivered
    /// again at the same offset is written but counted only once.
    pub fn put_segment_data(&self, segment_id: SegmentId, offset: u64, data: &[u8]) -> Result<u64> {
        let at = usize::try_from(offset)
            .map_err(|_| Error::invalid_argument(format!("chunk offset {offset}")))?;
        self.store.write_chunk(segment_id, at, data)?;
        self.chunk_received(segment_id.into(), offset)
    }

    /// Finish an upload once every chunk has arrived
    ///
    /// Returns the committed segment metadata.
    pub async fn put_segment_end(&self, segment_id: SegmentId) -> Result<SegmentInfo> {
        let upload = self
            .uploads
            .lock()
            .remove(&segment_id)
            .ok_or_else(|| Error::SessionNotFound(format!("upload of segment {segment_id}")))?;

        let result = self.commit_upload(segment_id, upload).await;
        if let Err(e) = self.store.close_transfer(segment_id) {
            warn!(segment = %segment_id, error = %e, "Upload session already closed");
        }
        self.forget_chunks(segment_id.into());
        if let Err(e) = &result {
            error!(segment = %segment_id, error = %e, "Upload failed");
        }
        result
    }

    async fn commit_upload(&self, segment_id: SegmentId, upload: PendingUpload) -> Result<SegmentInfo> {
        let PendingUpload { request, engine } = upload;

        self.store.wait_transfer(segment_id).await?;
        let staged = self.store.end_transfer(segment_id)?;

        let actual = content_hash(&staged);
        if actual != request.checksum {
            OsdStats::incr(&self.stats.checksum_failures);
            return Err(Error::ChecksumMismatch {
                expected: request.checksum,
                actual,
            });
        }

        let blocks = engine.encode(&staged)?;
        let block_size = engine.block_size(staged.len()) as u64;
        let nodes = self
            .monitor
            .get_placement(blocks.len(), None, block_size)
            .await?;
        if nodes.len() < blocks.len() {
            return Err(Error::InsufficientNodes {
                available: nodes.len(),
                required: blocks.len(),
            });
        }
        let node_list = nodes[..blocks.len()].to_vec();
        debug!(segment = %segment_id, nodes = ?node_list, block_size, "Placement received");

        self.distribute(segment_id, blocks.into_iter().zip(node_list.iter().copied()).collect())
            .await?;

        let info = SegmentInfo {
            segment_id,
            size: request.length,
            coding_scheme: request.coding_scheme,
            coding_setting: request.coding_setting,
            checksum: request.checksum,
            node_list,
        };
        self.mds.ack_segment_upload(info.clone()).await?;
        OsdStats::incr(&self.stats.segments_uploaded);
        info!(segment = %segment_id, size = info.size, nodes = ?info.node_list, "Upload committed");

        self.cache_segment(segment_id, &staged);
        Ok(info)
    }
}
