//! Collaborator facades
//!
//! The OSD talks to three external services: peer OSDs, the metadata
//! service (MDS) and the cluster monitor. Transport and wire format live
//! behind these traits; the orchestrator only sees typed calls.

use async_trait::async_trait;
use bytes::Bytes;
use ecfs_common::{BlockId, BlockKey, NodeId, Result, SegmentId, SegmentInfo, Symbol};

/// Requests sent to another OSD
///
/// Every call names the `target` node; implementations route it there and
/// resolve once the target has handled it.
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Announce a block transfer of `length` bytes in `chunk_count` chunks
    async fn put_block_init(
        &self,
        target: NodeId,
        from: NodeId,
        key: BlockKey,
        length: u64,
        chunk_count: u64,
    ) -> Result<()>;

    /// Deliver one chunk of a block transfer
    async fn put_block_data(&self, target: NodeId, key: BlockKey, offset: u64, data: Bytes)
    -> Result<()>;

    /// Finish a block transfer
    async fn put_block_end(&self, target: NodeId, key: BlockKey) -> Result<()>;

    /// Ask `target` to push the given ranges of a block back to `requester`
    /// through the block sub-protocol
    async fn get_block(
        &self,
        target: NodeId,
        requester: NodeId,
        key: BlockKey,
        symbols: Vec<Symbol>,
    ) -> Result<()>;

    /// Fetch the given ranges of a block for repair, concatenated in order
    async fn get_recovery_block(
        &self,
        target: NodeId,
        key: BlockKey,
        symbols: Vec<Symbol>,
    ) -> Result<Bytes>;
}

/// Metadata service
#[async_trait]
pub trait MetadataClient: Send + Sync {
    /// Coding metadata and block owners of a committed segment
    async fn get_segment_info(&self, segment_id: SegmentId) -> Result<SegmentInfo>;

    /// Commit a freshly uploaded segment
    async fn ack_segment_upload(&self, info: SegmentInfo) -> Result<()>;

    /// Record the new owners of repaired blocks
    async fn ack_repair(
        &self,
        segment_id: SegmentId,
        repaired: Vec<BlockId>,
        nodes: Vec<NodeId>,
    ) -> Result<()>;
}

/// Cluster monitor
#[async_trait]
pub trait MonitorClient: Send + Sync {
    /// Liveness of each node, in request order
    async fn get_node_health(&self, nodes: &[NodeId]) -> Result<Vec<bool>>;

    /// Pick `count` nodes for a segment's blocks, one per block in order
    async fn get_placement(
        &self,
        count: usize,
        exclude: Option<NodeId>,
        block_size_hint: u64,
    ) -> Result<Vec<NodeId>>;
}
