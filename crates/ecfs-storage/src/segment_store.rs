//! Segment store
//!
//! Owns every file and arena buffer of a node:
//! - transfer sessions staging incoming segments and blocks
//! - the block store (one file per block, capacity accounted, no eviction)
//! - pending delta blocks and their merge into base blocks
//! - the segment disk cache (capacity bounded, evicts oldest first)

use crate::arena::{Arena, ArenaBuf};
use crate::cache::{DiskCacheEntry, SegmentCache};
use crate::file_store::FileStore;
use crate::layout::{BlockFile, Layout};
use crate::session::{TransferKey, TransferSession};
use bytes::Bytes;
use ecfs_common::config::StorageConfig;
use ecfs_common::{BlockKey, DeltaId, Error, Result, SegmentId, Symbol};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Bytes of free arena buffers kept around for reuse
const ARENA_RETAIN_LIMIT: u64 = 256 * 1024 * 1024;

/// Byte budget of the block store
///
/// `free + used == capacity` holds after every reservation and release.
struct BlockSpace {
    capacity: u64,
    used: Mutex<u64>,
}

impl BlockSpace {
    fn reserve(&self, bytes: u64) -> Result<()> {
        let mut used = self.used.lock();
        let available = self.capacity.saturating_sub(*used);
        if bytes > available {
            return Err(Error::InsufficientSpace {
                required: bytes,
                available,
            });
        }
        *used += bytes;
        Ok(())
    }

    fn release(&self, bytes: u64) {
        let mut used = self.used.lock();
        *used = used.saturating_sub(bytes);
    }
}

/// Pending deltas of one block
#[derive(Default)]
struct DeltaLog {
    /// Next id handed out by `next_delta_id`
    next_id: DeltaId,
    /// Written deltas and the block ranges they cover, ascending by id
    pending: BTreeMap<DeltaId, Vec<Symbol>>,
}

/// Storage engine of one OSD node
pub struct SegmentStore {
    layout: Layout,
    files: FileStore,
    arena: Arena,
    sessions: Mutex<HashMap<TransferKey, Arc<TransferSession>>>,
    /// Size of every block file
    blocks: Mutex<HashMap<BlockKey, u64>>,
    space: BlockSpace,
    deltas: Mutex<HashMap<BlockKey, DeltaLog>>,
    /// Serializes replacement, delta writes and merges of one block
    block_locks: Mutex<HashMap<BlockKey, Arc<Mutex<()>>>>,
    cache: SegmentCache,
    /// Distinguishes concurrent staging files of the disk cache
    staging_seq: AtomicU64,
}

impl SegmentStore {
    /// Open the store, creating missing directories and rebuilding the
    /// block accounting and disk cache index from the files found
    pub fn open(config: &StorageConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.block_dir)?;
        std::fs::create_dir_all(&config.segment_cache_dir)?;

        let store = Self {
            layout: Layout::new(&config.block_dir, &config.segment_cache_dir),
            files: FileStore::new(config.max_open_files),
            arena: Arena::new(ARENA_RETAIN_LIMIT),
            sessions: Mutex::new(HashMap::new()),
            blocks: Mutex::new(HashMap::new()),
            space: BlockSpace {
                capacity: config.block_capacity,
                used: Mutex::new(0),
            },
            deltas: Mutex::new(HashMap::new()),
            block_locks: Mutex::new(HashMap::new()),
            cache: SegmentCache::new(config.segment_cache_capacity),
            staging_seq: AtomicU64::new(0),
        };
        store.rescan_blocks()?;
        store.rescan_cache()?;

        info!(
            block_dir = %config.block_dir.display(),
            segment_cache_dir = %config.segment_cache_dir.display(),
            blocks = store.block_count(),
            block_usage = store.block_usage(),
            cached_segments = store.cache.len(),
            cache_usage = store.cache.usage(),
            "Segment store opened"
        );
        Ok(store)
    }

    fn rescan_blocks(&self) -> Result<()> {
        let mut blocks = self.blocks.lock();
        let mut used = self.space.used.lock();
        for entry in std::fs::read_dir(self.layout.block_dir())? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(file) = name.to_str().and_then(Layout::parse_block_file) else {
                debug!(file = ?name, "Skipping unrecognized file in block directory");
                continue;
            };
            match file {
                BlockFile::Block(key) => {
                    let len = entry.metadata()?.len();
                    blocks.insert(key, len);
                    *used += len;
                }
                BlockFile::Delta(key, delta_id) => {
                    // Delta ranges are not persisted, so a leftover delta cannot be merged
                    warn!(block = %key, delta_id, "Removing orphaned delta file");
                    std::fs::remove_file(entry.path())?;
                }
            }
        }
        if *used > self.space.capacity {
            warn!(
                used = *used,
                capacity = self.space.capacity,
                "Existing blocks exceed configured block capacity"
            );
        }
        Ok(())
    }

    fn rescan_cache(&self) -> Result<()> {
        let mut found = Vec::new();
        for entry in std::fs::read_dir(self.layout.segment_dir())? {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_str().is_some_and(Layout::is_staging_file) {
                warn!(file = ?name, "Removing unfinished cached segment");
                std::fs::remove_file(entry.path())?;
                continue;
            }
            let Some(segment_id) = name.to_str().and_then(Layout::parse_segment_file) else {
                debug!(file = ?name, "Skipping unrecognized file in segment cache directory");
                continue;
            };
            let metadata = entry.metadata()?;
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((modified, segment_id, metadata.len()));
        }

        // Oldest first, so recency order survives a restart
        found.sort();
        for (_, segment_id, len) in found {
            let path = self.layout.segment_path(segment_id);
            match self.cache.insert(segment_id, path.clone(), len) {
                Ok(evicted) => self.delete_evicted(&evicted),
                Err(e) => {
                    warn!(segment = %segment_id, error = %e, "Dropping cached segment at startup");
                    self.remove_file(&path);
                }
            }
        }
        Ok(())
    }

    // ---- transfer sessions ----

    /// Start staging a payload of `length` bytes that arrives in `chunk_count` chunks
    pub fn begin_transfer(
        &self,
        key: impl Into<TransferKey>,
        length: usize,
        chunk_count: u64,
    ) -> Result<Arc<TransferSession>> {
        let key = key.into();
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(&key) {
            return Err(Error::SessionExists(key.to_string()));
        }
        let session = Arc::new(TransferSession::new(
            key,
            self.arena.acquire(length),
            chunk_count,
        ));
        sessions.insert(key, Arc::clone(&session));
        debug!(%key, length, chunk_count, "Transfer started");
        Ok(session)
    }

    /// Look up an active session
    pub fn session(&self, key: impl Into<TransferKey>) -> Result<Arc<TransferSession>> {
        let key = key.into();
        self.sessions
            .lock()
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::SessionNotFound(key.to_string()))
    }

    /// Copy a chunk into the session buffer at `offset`
    ///
    /// Does not count the chunk as done; see [`Self::chunk_done`].
    pub fn write_chunk(&self, key: impl Into<TransferKey>, offset: usize, data: &[u8]) -> Result<()> {
        self.session(key)?.write(offset, data)
    }

    /// Account for one received chunk, returning how many remain
    pub fn chunk_done(&self, key: impl Into<TransferKey>) -> Result<u64> {
        self.session(key)?.complete_chunk()
    }

    /// Wait until every chunk of the session is accounted for
    pub async fn wait_transfer(&self, key: impl Into<TransferKey>) -> Result<()> {
        let session = self.session(key)?;
        session.wait().await;
        Ok(())
    }

    /// Staged payload of a completed transfer
    ///
    /// The session stays open until [`Self::close_transfer`].
    pub fn end_transfer(&self, key: impl Into<TransferKey>) -> Result<Bytes> {
        self.session(key)?.stage()
    }

    /// Remove the session, releasing its buffer once no staged handle remains
    pub fn close_transfer(&self, key: impl Into<TransferKey>) -> Result<()> {
        let key = key.into();
        self.sessions
            .lock()
            .remove(&key)
            .map(|_| debug!(%key, "Transfer closed"))
            .ok_or_else(|| Error::SessionNotFound(key.to_string()))
    }

    #[must_use]
    pub fn active_transfers(&self) -> usize {
        self.sessions.lock().len()
    }

    // ---- block store ----

    /// Create (or replace) a zero-filled block file of `len` bytes
    ///
    /// Replacing a block discards its pending deltas, which described the
    /// old contents.
    pub fn create_block(&self, key: BlockKey, len: u64) -> Result<()> {
        self.with_block_lock(key, || {
            self.space.reserve(len)?;
            if let Err(e) = self.files.create(&self.layout.block_path(key), len) {
                self.space.release(len);
                return Err(e);
            }
            let replaced = self.blocks.lock().insert(key, len);
            if let Some(old) = replaced {
                self.space.release(old);
                self.discard_deltas(key);
            }
            Ok(())
        })
    }

    /// Write `data` into an existing block at `offset`
    pub fn write_block(&self, key: BlockKey, offset: u64, data: &[u8]) -> Result<()> {
        let size = self.block_size(key).ok_or(Error::BlockNotFound(key))?;
        check_range(offset, data.len() as u64, size)?;
        self.files.write(&self.layout.block_path(key), offset, data)
    }

    /// Force a block's contents to durable storage
    pub fn flush_block(&self, key: BlockKey) -> Result<()> {
        if !self.has_block(key) {
            return Err(Error::BlockNotFound(key));
        }
        self.files.flush(&self.layout.block_path(key))
    }

    /// Create, fill and flush a block in one step
    pub fn store_block(&self, key: BlockKey, data: &[u8]) -> Result<()> {
        self.create_block(key, data.len() as u64)?;
        self.write_block(key, 0, data)?;
        self.flush_block(key)
    }

    /// Read the requested ranges of a block, concatenated in request order
    pub fn read_block(&self, key: BlockKey, symbols: &[Symbol]) -> Result<ArenaBuf> {
        let size = self.block_size(key).ok_or(Error::BlockNotFound(key))?;
        let total = symbols.iter().map(|s| s.length).sum();
        let path = self.layout.block_path(key);

        let mut buf = self.arena.acquire(total);
        let mut at = 0;
        for symbol in symbols {
            check_range(symbol.offset as u64, symbol.length as u64, size)?;
            self.files
                .read_into(&path, symbol.offset as u64, &mut buf[at..at + symbol.length])?;
            at += symbol.length;
        }
        Ok(buf)
    }

    /// Read a whole block
    pub fn read_full_block(&self, key: BlockKey) -> Result<ArenaBuf> {
        let size = self.block_size(key).ok_or(Error::BlockNotFound(key))?;
        let len = usize::try_from(size)
            .map_err(|_| Error::storage(format!("block {key} too large to read")))?;
        self.read_block(key, &[Symbol::new(0, len)])
    }

    /// Delete a block together with any pending deltas
    pub fn delete_block(&self, key: BlockKey) -> Result<()> {
        self.with_block_lock(key, || {
            let size = self
                .blocks
                .lock()
                .remove(&key)
                .ok_or(Error::BlockNotFound(key))?;
            self.files.remove(&self.layout.block_path(key))?;
            self.space.release(size);

            let log = self.deltas.lock().remove(&key);
            if let Some(log) = log {
                for (delta_id, symbols) in log.pending {
                    self.remove_file(&self.layout.delta_path(key, delta_id));
                    self.space.release(symbol_bytes(&symbols));
                }
            }
            debug!(block = %key, "Block deleted");
            Ok(())
        })
    }

    #[must_use]
    pub fn block_size(&self, key: BlockKey) -> Option<u64> {
        self.blocks.lock().get(&key).copied()
    }

    #[must_use]
    pub fn has_block(&self, key: BlockKey) -> bool {
        self.blocks.lock().contains_key(&key)
    }

    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.lock().len()
    }

    #[must_use]
    pub const fn block_capacity(&self) -> u64 {
        self.space.capacity
    }

    #[must_use]
    pub fn block_usage(&self) -> u64 {
        *self.space.used.lock()
    }

    #[must_use]
    pub fn block_free_space(&self) -> u64 {
        self.space.capacity.saturating_sub(self.block_usage())
    }

    // ---- delta blocks ----

    /// Allocate the next delta id of a block
    pub fn next_delta_id(&self, key: BlockKey) -> DeltaId {
        let mut deltas = self.deltas.lock();
        let log = deltas.entry(key).or_default();
        let id = log.next_id;
        log.next_id += 1;
        id
    }

    /// Persist a delta update of a block
    ///
    /// `data` holds the new contents of the `symbols` ranges, concatenated in
    /// order.
    pub fn write_delta_block(
        &self,
        key: BlockKey,
        delta_id: DeltaId,
        data: &[u8],
        symbols: Vec<Symbol>,
    ) -> Result<()> {
        self.with_block_lock(key, || self.write_delta_locked(key, delta_id, data, symbols))
    }

    fn write_delta_locked(
        &self,
        key: BlockKey,
        delta_id: DeltaId,
        data: &[u8],
        symbols: Vec<Symbol>,
    ) -> Result<()> {
        let size = self.block_size(key).ok_or(Error::BlockNotFound(key))?;
        let covered = symbol_bytes(&symbols);
        if covered != data.len() as u64 {
            return Err(Error::invalid_argument(format!(
                "delta {delta_id} of block {key} carries {} bytes for {covered} bytes of ranges",
                data.len()
            )));
        }
        for symbol in &symbols {
            check_range(symbol.offset as u64, symbol.length as u64, size)?;
        }

        self.space.reserve(covered)?;
        let path = self.layout.delta_path(key, delta_id);
        let written = self
            .files
            .create(&path, covered)
            .and_then(|()| self.files.write(&path, 0, data))
            .and_then(|()| self.files.flush(&path));
        if let Err(e) = written {
            self.space.release(covered);
            return Err(e);
        }

        let mut deltas = self.deltas.lock();
        let log = deltas.entry(key).or_default();
        log.next_id = log.next_id.max(delta_id.saturating_add(1));
        if let Some(replaced) = log.pending.insert(delta_id, symbols) {
            self.space.release(symbol_bytes(&replaced));
        }
        debug!(block = %key, delta_id, bytes = covered, "Delta written");
        Ok(())
    }

    /// Number of deltas waiting to be merged into a block
    #[must_use]
    pub fn delta_count(&self, key: BlockKey) -> usize {
        self.deltas
            .lock()
            .get(&key)
            .map_or(0, |log| log.pending.len())
    }

    /// Base block with every pending delta applied in ascending id order
    ///
    /// Parity blocks accumulate deltas by XOR; data blocks take the delta
    /// bytes as the new contents.
    pub fn read_merged_block(&self, key: BlockKey, is_parity: bool) -> Result<ArenaBuf> {
        let mut merged = self.read_full_block(key)?;
        for (delta_id, symbols) in self.pending_deltas(key) {
            let path = self.layout.delta_path(key, delta_id);
            let mut at = 0u64;
            for symbol in symbols {
                check_range(symbol.offset as u64, symbol.length as u64, merged.len() as u64)?;
                let target = &mut merged[symbol.offset..symbol.end()];
                if is_parity {
                    let mut delta = self.arena.acquire(symbol.length);
                    self.files.read_into(&path, at, &mut delta)?;
                    target
                        .iter_mut()
                        .zip(delta.iter())
                        .for_each(|(t, d)| *t ^= d);
                } else {
                    self.files.read_into(&path, at, target)?;
                }
                at += symbol.length as u64;
            }
        }
        Ok(merged)
    }

    /// Fold pending deltas into the base block and delete them
    ///
    /// Returns the number of deltas merged; zero pending deltas is a no-op.
    pub fn merge_block(&self, key: BlockKey, is_parity: bool) -> Result<usize> {
        self.with_block_lock(key, || self.merge_locked(key, is_parity))
    }

    fn merge_locked(&self, key: BlockKey, is_parity: bool) -> Result<usize> {
        let pending = self.pending_deltas(key);
        if pending.is_empty() {
            return Ok(0);
        }

        let merged = self.read_merged_block(key, is_parity)?;
        self.write_block(key, 0, &merged)?;
        self.flush_block(key)?;

        let mut deltas = self.deltas.lock();
        if let Some(log) = deltas.get_mut(&key) {
            for (delta_id, _) in &pending {
                if let Some(symbols) = log.pending.remove(delta_id) {
                    self.remove_file(&self.layout.delta_path(key, *delta_id));
                    self.space.release(symbol_bytes(&symbols));
                }
            }
        }
        drop(deltas);

        debug!(block = %key, deltas = pending.len(), is_parity, "Block merged");
        Ok(pending.len())
    }

    /// Drop the pending deltas of a block; its delta id counter keeps running
    fn discard_deltas(&self, key: BlockKey) {
        let stale = self
            .deltas
            .lock()
            .get_mut(&key)
            .map(|log| std::mem::take(&mut log.pending))
            .unwrap_or_default();
        if stale.is_empty() {
            return;
        }
        for (delta_id, symbols) in &stale {
            self.remove_file(&self.layout.delta_path(key, *delta_id));
            self.space.release(symbol_bytes(symbols));
        }
        debug!(block = %key, deltas = stale.len(), "Discarded deltas of replaced block");
    }

    /// Run `f` holding the lock of one block
    fn with_block_lock<T>(&self, key: BlockKey, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = Arc::clone(self.block_locks.lock().entry(key).or_default());
        let result = {
            let _held = lock.lock();
            f()
        };

        // Clones are only taken under the map lock, so a count of one means
        // nobody else is waiting on this block
        let mut locks = self.block_locks.lock();
        drop(lock);
        if locks.get(&key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&key);
        }
        result
    }

    fn pending_deltas(&self, key: BlockKey) -> Vec<(DeltaId, Vec<Symbol>)> {
        self.deltas.lock().get(&key).map_or_else(Vec::new, |log| {
            log.pending
                .iter()
                .map(|(id, symbols)| (*id, symbols.clone()))
                .collect()
        })
    }

    // ---- segment disk cache ----

    /// Whether a segment is cached; a hit refreshes its recency
    #[must_use]
    pub fn is_cached(&self, segment_id: SegmentId) -> bool {
        self.cache.touch(segment_id).is_some()
    }

    /// Write a segment to the disk cache, evicting oldest entries as needed
    ///
    /// A segment larger than the whole cache fails with
    /// [`Error::SegmentTooLarge`] and leaves the cache untouched.
    ///
    /// The segment is written and flushed under a staging name and renamed
    /// into place before it is indexed, so readers never see a partial file.
    pub fn put_to_disk_cache(&self, segment_id: SegmentId, data: &[u8]) -> Result<()> {
        let length = data.len() as u64;
        self.cache.admit(length)?;

        let seq = self.staging_seq.fetch_add(1, Ordering::Relaxed);
        let staging = self.layout.segment_staging_path(segment_id, seq);
        let path = self.layout.segment_path(segment_id);
        let written = self
            .files
            .create(&staging, length)
            .and_then(|()| self.files.write(&staging, 0, data))
            .and_then(|()| self.files.flush(&staging))
            .and_then(|()| self.files.rename(&staging, &path));
        if let Err(e) = written {
            self.remove_file(&staging);
            return Err(e);
        }

        let evicted = match self.cache.insert(segment_id, path.clone(), length) {
            Ok(evicted) => evicted,
            Err(e) => {
                self.remove_file(&path);
                return Err(e);
            }
        };
        // A previous copy of this segment lived at the path just written
        let evicted: Vec<DiskCacheEntry> = evicted
            .into_iter()
            .filter(|entry| entry.segment_id != segment_id)
            .collect();
        self.delete_evicted(&evicted);
        debug!(segment = %segment_id, bytes = data.len(), evicted = evicted.len(), "Segment cached");
        Ok(())
    }

    /// Read a cached segment, refreshing its recency
    pub fn get_from_disk_cache(&self, segment_id: SegmentId) -> Result<Bytes> {
        let entry = self
            .cache
            .touch(segment_id)
            .ok_or(Error::SegmentNotCached(segment_id))?;
        let len = usize::try_from(entry.length)
            .map_err(|_| Error::storage(format!("cached segment {segment_id} too large to read")))?;
        let mut buf = self.arena.acquire(len);
        self.files.read_into(&entry.path, 0, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Drop a segment from the disk cache, returning whether it was cached
    pub fn remove_from_disk_cache(&self, segment_id: SegmentId) -> bool {
        let Some(entry) = self.cache.remove(segment_id) else {
            return false;
        };
        self.remove_file(&entry.path);
        true
    }

    /// Drop every cached segment
    pub fn clear_disk_cache(&self) {
        let drained = self.cache.drain();
        info!(segments = drained.len(), "Clearing disk cache");
        self.delete_evicted(&drained);
    }

    #[must_use]
    pub const fn disk_cache(&self) -> &SegmentCache {
        &self.cache
    }

    #[must_use]
    pub const fn arena(&self) -> &Arena {
        &self.arena
    }

    #[must_use]
    pub const fn layout(&self) -> &Layout {
        &self.layout
    }

    fn delete_evicted(&self, evicted: &[DiskCacheEntry]) {
        for entry in evicted {
            debug!(segment = %entry.segment_id, bytes = entry.length, "Evicting cached segment");
            self.remove_file(&entry.path);
        }
    }

    /// Best-effort delete; accounting has already been released
    fn remove_file(&self, path: &Path) {
        if let Err(e) = self.files.remove(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove file");
        }
    }
}

fn check_range(offset: u64, length: u64, size: u64) -> Result<()> {
    if offset.checked_add(length).is_none_or(|end| end > size) {
        return Err(Error::ChunkOutOfBounds {
            offset: usize::try_from(offset).unwrap_or(usize::MAX),
            length: usize::try_from(length).unwrap_or(usize::MAX),
            capacity: usize::try_from(size).unwrap_or(usize::MAX),
        });
    }
    Ok(())
}

fn symbol_bytes(symbols: &[Symbol]) -> u64 {
    symbols.iter().map(|s| s.length as u64).sum()
}
