//! In-process cluster for protocol tests
//!
//! [`Loopback`] plays peer transport, metadata service and monitor for a set
//! of [`Osd`] instances. Peer calls are dispatched straight to the target
//! node's handlers after an optional delay.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use ecfs_common::config::{StorageConfig, TransferConfig};
use ecfs_common::{
    BlockId, BlockKey, CodingScheme, Error, NodeId, Result, SegmentId, SegmentInfo, Symbol,
    content_hash,
};
use ecfs_osd::{MetadataClient, MonitorClient, Osd, PeerClient, UploadRequest};
use ecfs_storage::SegmentStore;
use parking_lot::Mutex;
use rand::Rng;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tempfile::TempDir;

pub const CHUNK_SIZE: usize = 1000;

#[derive(Default)]
pub struct Loopback {
    nodes: Mutex<HashMap<NodeId, Weak<Osd>>>,
    latency: Duration,
    down: Mutex<HashSet<NodeId>>,
    segments: Mutex<HashMap<SegmentId, SegmentInfo>>,
    repairs: Mutex<Vec<(SegmentId, Vec<BlockId>, Vec<NodeId>)>>,
    /// Fixed answer for placement requests
    placement: Mutex<Option<Vec<NodeId>>>,
    pub get_block_calls: AtomicUsize,
    pub recovery_calls: AtomicUsize,
    /// Bytes requested through `get_recovery_block`
    pub recovery_bytes: AtomicUsize,
}

impl Loopback {
    fn node(&self, id: NodeId) -> Result<Arc<Osd>> {
        if self.down.lock().contains(&id) {
            return Err(Error::rpc(format!("node {id} is down")));
        }
        self.nodes
            .lock()
            .get(&id)
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::rpc(format!("node {id} unknown")))
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    pub fn set_down(&self, id: NodeId) {
        self.down.lock().insert(id);
    }

    pub fn set_placement(&self, nodes: Vec<NodeId>) {
        *self.placement.lock() = Some(nodes);
    }

    pub fn segment(&self, segment_id: SegmentId) -> Option<SegmentInfo> {
        self.segments.lock().get(&segment_id).cloned()
    }

    pub fn repairs(&self) -> Vec<(SegmentId, Vec<BlockId>, Vec<NodeId>)> {
        self.repairs.lock().clone()
    }
}

#[async_trait]
impl PeerClient for Loopback {
    async fn put_block_init(
        &self,
        target: NodeId,
        from: NodeId,
        key: BlockKey,
        length: u64,
        chunk_count: u64,
    ) -> Result<()> {
        self.delay().await;
        self.node(target)?
            .put_block_init(from, key, length, chunk_count)
    }

    async fn put_block_data(
        &self,
        target: NodeId,
        key: BlockKey,
        offset: u64,
        data: Bytes,
    ) -> Result<()> {
        self.delay().await;
        self.node(target)?.put_block_data(key, offset, &data)?;
        Ok(())
    }

    async fn put_block_end(&self, target: NodeId, key: BlockKey) -> Result<()> {
        self.delay().await;
        self.node(target)?.put_block_end(key).await
    }

    async fn get_block(
        &self,
        target: NodeId,
        requester: NodeId,
        key: BlockKey,
        symbols: Vec<Symbol>,
    ) -> Result<()> {
        self.get_block_calls.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        self.node(target)?.get_block(requester, key, symbols).await
    }

    async fn get_recovery_block(
        &self,
        target: NodeId,
        key: BlockKey,
        symbols: Vec<Symbol>,
    ) -> Result<Bytes> {
        self.recovery_calls.fetch_add(1, Ordering::SeqCst);
        let bytes: usize = symbols.iter().map(|s| s.length).sum();
        self.recovery_bytes.fetch_add(bytes, Ordering::SeqCst);
        self.delay().await;
        self.node(target)?.get_recovery_block(key, &symbols)
    }
}

#[async_trait]
impl MetadataClient for Loopback {
    async fn get_segment_info(&self, segment_id: SegmentId) -> Result<SegmentInfo> {
        self.segment(segment_id)
            .ok_or_else(|| Error::rpc(format!("segment {segment_id} unknown")))
    }

    async fn ack_segment_upload(&self, info: SegmentInfo) -> Result<()> {
        self.segments.lock().insert(info.segment_id, info);
        Ok(())
    }

    async fn ack_repair(
        &self,
        segment_id: SegmentId,
        repaired: Vec<BlockId>,
        nodes: Vec<NodeId>,
    ) -> Result<()> {
        if let Some(info) = self.segments.lock().get_mut(&segment_id) {
            for (&block_id, &node) in repaired.iter().zip(&nodes) {
                info.node_list[block_id as usize] = node;
            }
        }
        self.repairs.lock().push((segment_id, repaired, nodes));
        Ok(())
    }
}

#[async_trait]
impl MonitorClient for Loopback {
    async fn get_node_health(&self, nodes: &[NodeId]) -> Result<Vec<bool>> {
        let down = self.down.lock();
        Ok(nodes.iter().map(|id| !down.contains(id)).collect())
    }

    async fn get_placement(
        &self,
        count: usize,
        _exclude: Option<NodeId>,
        _block_size_hint: u64,
    ) -> Result<Vec<NodeId>> {
        if let Some(fixed) = self.placement.lock().clone() {
            return Ok(fixed);
        }
        let mut ids: Vec<NodeId> = self.nodes.lock().keys().copied().collect();
        ids.sort();
        Ok((0..count).map(|i| ids[i % ids.len()]).collect())
    }
}

pub struct Cluster {
    pub net: Arc<Loopback>,
    pub nodes: Vec<Arc<Osd>>,
    _dirs: Vec<TempDir>,
}

impl Cluster {
    pub fn new(size: u32) -> Self {
        Self::with_latency(size, Duration::ZERO)
    }

    pub fn with_latency(size: u32, latency: Duration) -> Self {
        let net = Arc::new(Loopback {
            latency,
            ..Loopback::default()
        });
        let mut nodes = Vec::new();
        let mut dirs = Vec::new();
        for id in 0..size {
            let dir = TempDir::new().unwrap();
            let storage = StorageConfig {
                block_dir: dir.path().join("blocks"),
                segment_cache_dir: dir.path().join("segments"),
                block_capacity: 64 * 1024 * 1024,
                segment_cache_capacity: 1024 * 1024,
                max_open_files: 16,
            };
            let transfer = TransferConfig {
                chunk_size: CHUNK_SIZE,
                distribution_workers: 4,
                recovery_workers: 4,
            };
            let osd = Arc::new(Osd::new(
                NodeId::new(id),
                Arc::new(SegmentStore::open(&storage).unwrap()),
                transfer,
                net.clone(),
                net.clone(),
                net.clone(),
            ));
            net.nodes
                .lock()
                .insert(NodeId::new(id), Arc::downgrade(&osd));
            nodes.push(osd);
            dirs.push(dir);
        }
        Self {
            net,
            nodes,
            _dirs: dirs,
        }
    }

    pub fn node(&self, id: u32) -> &Arc<Osd> {
        &self.nodes[id as usize]
    }
}

pub fn random_segment(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill(&mut data[..]);
    data
}

pub fn upload_request(data: &[u8], scheme: CodingScheme, setting: &str) -> UploadRequest {
    UploadRequest {
        length: data.len() as u64,
        chunk_count: data.len().div_ceil(CHUNK_SIZE) as u64,
        coding_scheme: scheme,
        coding_setting: setting.to_string(),
        checksum: content_hash(data),
    }
}

/// Send every chunk of `data` in random order
pub fn send_chunks(osd: &Osd, segment_id: SegmentId, data: &[u8]) {
    let mut offsets: Vec<usize> = (0..data.len()).step_by(CHUNK_SIZE).collect();
    offsets.shuffle(&mut rand::thread_rng());
    for offset in offsets {
        let end = (offset + CHUNK_SIZE).min(data.len());
        osd.put_segment_data(segment_id, offset as u64, &data[offset..end])
            .unwrap();
    }
}

/// Run a complete upload through `osd`
pub async fn upload(
    osd: &Osd,
    segment_id: SegmentId,
    data: &[u8],
    scheme: CodingScheme,
    setting: &str,
) -> Result<SegmentInfo> {
    osd.put_segment_init(segment_id, upload_request(data, scheme, setting))?;
    send_chunks(osd, segment_id, data);
    osd.put_segment_end(segment_id).await
}
