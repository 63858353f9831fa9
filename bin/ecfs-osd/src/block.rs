//! Block sub-protocol and block-level requests
//!
//! Blocks arrive with the same Init/Data/End shape as segments, scoped per
//! `(segment, block)`. On `End` a block that an in-progress download of
//! this node is waiting for goes to that download instead of to disk.

use crate::osd::Osd;
use bytes::Bytes;
use ecfs_common::{BlockKey, DeltaId, Error, NodeId, Result, Symbol};
use tracing::{debug, warn};

impl Osd {
    /// Start receiving a block from `from`
    pub fn put_block_init(
        &self,
        from: NodeId,
        key: BlockKey,
        length: u64,
        chunk_count: u64,
    ) -> Result<()> {
        let length = usize::try_from(length)
            .map_err(|_| Error::invalid_argument(format!("block length {length}")))?;
        self.store.begin_transfer(key, length, chunk_count)?;
        self.forget_chunks(key.into());
        debug!(block = %key, %from, length, chunk_count, "Block transfer started");
        Ok(())
    }

    /// Accept one chunk of a block, returning how many are still outstanding
    ///
    /// Repeated deliveries of a chunk are counted once.
    pub fn put_block_data(&self, key: BlockKey, offset: u64, data: &[u8]) -> Result<u64> {
        let at = usize::try_from(offset)
            .map_err(|_| Error::invalid_argument(format!("chunk offset {offset}")))?;
        self.store.write_chunk(key, at, data)?;
        self.chunk_received(key.into(), offset)
    }

    /// Finish a block transfer once every chunk has arrived
    pub async fn put_block_end(&self, key: BlockKey) -> Result<()> {
        self.store.wait_transfer(key).await?;
        let result = self
            .store
            .end_transfer(key)
            .and_then(|data| self.accept_block(key, data));
        if let Err(e) = self.store.close_transfer(key) {
            warn!(block = %key, error = %e, "Block session already closed");
        }
        self.forget_chunks(key.into());
        result
    }

    fn accept_block(&self, key: BlockKey, data: Bytes) -> Result<()> {
        let collector = self.collectors.lock().get(&key.segment_id).cloned();
        match collector {
            Some(collector) if collector.expects(key.block_id) => {
                debug!(block = %key, bytes = data.len(), "Block routed to download");
                collector.deliver(key.block_id, data)
            }
            _ => {
                self.store.store_block(key, &data)?;
                debug!(block = %key, bytes = data.len(), "Block stored");
                Ok(())
            }
        }
    }

    /// Serve a download of `requester`: read the ranges locally and push
    /// them back through the block sub-protocol
    pub async fn get_block(
        &self,
        requester: NodeId,
        key: BlockKey,
        symbols: Vec<Symbol>,
    ) -> Result<()> {
        let data = self.store.read_block(key, &symbols)?.freeze();
        debug!(block = %key, %requester, bytes = data.len(), "Serving block");
        self.send_block(requester, key, data).await
    }

    /// Serve a repair: the requested ranges of a local block, concatenated
    pub fn get_recovery_block(&self, key: BlockKey, symbols: &[Symbol]) -> Result<Bytes> {
        Ok(self.store.read_block(key, symbols)?.freeze())
    }

    /// Remove a block and its pending deltas
    pub fn delete_block(&self, key: BlockKey) -> Result<()> {
        self.store.delete_block(key)
    }

    /// Record an in-place update of a block as the next delta
    ///
    /// `data` holds the new contents of the `symbols` ranges; parity owners
    /// receive the XOR difference instead.
    pub fn update_block(&self, key: BlockKey, data: &[u8], symbols: Vec<Symbol>) -> Result<DeltaId> {
        if !self.store.has_block(key) {
            return Err(Error::BlockNotFound(key));
        }
        let delta_id = self.store.next_delta_id(key);
        self.store.write_delta_block(key, delta_id, data, symbols)?;
        Ok(delta_id)
    }

    /// Fold the pending deltas of a block into its base file
    pub fn merge_block(&self, key: BlockKey, is_parity: bool) -> Result<usize> {
        let merged = self.store.merge_block(key, is_parity)?;
        if merged > 0 {
            debug!(block = %key, deltas = merged, "Deltas merged");
        }
        Ok(merged)
    }
}
