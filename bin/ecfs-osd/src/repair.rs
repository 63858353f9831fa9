//! Block repair
//!
//! Regenerates failed blocks of a segment from the symbols the coding
//! scheme asks for, places each regenerated block on its replacement node
//! and records the new owners with the metadata service.

use crate::osd::{Osd, bounded};
use crate::stats::OsdStats;
use ecfs_coding::{BlockMap, CodingEngine};
use ecfs_common::{BlockId, BlockKey, Error, NodeId, Result, SegmentId, SegmentInfo, SymbolSet};
use tracing::{debug, info};

impl Osd {
    /// Rebuild `failed` blocks, placing `failed[i]` on `targets[i]`
    pub async fn repair_segment(
        &self,
        segment_id: SegmentId,
        failed: Vec<BlockId>,
        targets: Vec<NodeId>,
    ) -> Result<()> {
        if failed.len() != targets.len() {
            return Err(Error::invalid_argument(format!(
                "{} failed blocks but {} replacement nodes",
                failed.len(),
                targets.len()
            )));
        }
        if failed.is_empty() {
            return Ok(());
        }

        let info = self.mds.get_segment_info(segment_id).await?;
        let engine = CodingEngine::new(info.coding_scheme, &info.coding_setting)?;
        let size = usize::try_from(info.size)
            .map_err(|_| Error::invalid_argument(format!("segment size {}", info.size)))?;

        let mut health = self.monitor.get_node_health(&info.node_list).await?;
        for &block_id in &failed {
            if let Some(healthy) = health.get_mut(block_id as usize) {
                *healthy = false;
            }
        }

        let symbols = engine.repair_symbols(&failed, &health, size);
        if symbols.is_empty() {
            return Err(Error::InsufficientBlocks(segment_id));
        }
        info!(
            segment = %segment_id,
            failed = ?failed,
            sources = ?symbols.block_ids().collect::<Vec<_>>(),
            bytes = symbols.total_bytes(),
            "Repairing blocks"
        );

        let collected = self.fetch_repair_symbols(&info, &symbols).await?;
        let repaired = engine.repair(&failed, &collected, &symbols, size)?;
        self.distribute(segment_id, repaired.into_iter().zip(targets.iter().copied()).collect())
            .await?;

        self.mds.ack_repair(segment_id, failed, targets).await?;
        OsdStats::incr(&self.stats.repairs);
        info!(segment = %segment_id, "Repair complete");
        Ok(())
    }

    /// Gather repair symbols from every source block, at most
    /// `recovery_workers` fetches at a time
    async fn fetch_repair_symbols(&self, info: &SegmentInfo, symbols: &SymbolSet) -> Result<BlockMap> {
        let segment_id = info.segment_id;
        let sources = symbols
            .iter()
            .map(|(block_id, list)| {
                info.owner_of(block_id)
                    .map(|owner| (owner, BlockKey::new(segment_id, block_id), list.to_vec()))
                    .ok_or_else(|| {
                        Error::internal(format!(
                            "segment {segment_id} has no owner for block {block_id}"
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        let fetched = bounded(
            self.transfer.recovery_workers,
            sources,
            |(owner, key, list)| async move {
                let data = if owner == self.node_id {
                    self.store.read_block(key, &list)?.freeze()
                } else {
                    self.peers.get_recovery_block(owner, key, list).await?
                };
                debug!(block = %key, %owner, bytes = data.len(), "Repair symbols fetched");
                Ok::<_, Error>((key.block_id, data))
            },
        )
        .await?;
        Ok(fetched.into_iter().collect())
    }
}
