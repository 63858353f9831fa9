//! Segment disk cache index
//!
//! Tracks which encoded segments are kept on local disk for fast re-serve,
//! their sizes and their recency order. Eviction removes from the front of
//! the queue (least recently inserted or touched). The index never performs
//! I/O; [`crate::SegmentStore`] deletes evicted files and writes new ones.
//!
//! Accounting invariant: `free_space() + usage() == capacity()` after every
//! mutation.

use ecfs_common::{Error, Result, SegmentId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Accounting record of one cached segment
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiskCacheEntry {
    pub segment_id: SegmentId,
    pub path: PathBuf,
    pub length: u64,
    pub last_access: SystemTime,
    /// Position in the recency queue
    tick: u64,
}

/// Cache statistics for monitoring
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Number of lookups that found the segment
    pub hits: AtomicU64,
    /// Number of lookups that did not
    pub misses: AtomicU64,
    /// Number of segments inserted
    pub inserts: AtomicU64,
    /// Number of entries evicted
    pub evictions: AtomicU64,
    /// Number of inserts refused because the segment exceeds capacity
    pub rejections: AtomicU64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<SegmentId, DiskCacheEntry>,
    /// Recency queue, front is evicted first
    queue: BTreeMap<u64, SegmentId>,
    clock: u64,
    usage: u64,
    free: u64,
}

impl CacheState {
    fn next_tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn touch(&mut self, segment_id: SegmentId) -> Option<DiskCacheEntry> {
        let tick = self.next_tick();
        let entry = self.entries.get_mut(&segment_id)?;
        self.queue.remove(&entry.tick);
        entry.tick = tick;
        entry.last_access = SystemTime::now();
        self.queue.insert(tick, segment_id);
        Some(entry.clone())
    }

    fn remove(&mut self, segment_id: SegmentId) -> Option<DiskCacheEntry> {
        let entry = self.entries.remove(&segment_id)?;
        self.queue.remove(&entry.tick);
        self.usage -= entry.length;
        self.free += entry.length;
        Some(entry)
    }
}

/// Capacity-bounded recency index of cached segments
pub struct SegmentCache {
    state: Mutex<CacheState>,
    capacity: u64,
    stats: CacheStats,
}

impl SegmentCache {
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        Self {
            state: Mutex::new(CacheState {
                free: capacity,
                ..CacheState::default()
            }),
            capacity,
            stats: CacheStats::default(),
        }
    }

    /// Look up a segment and move it to the back of the eviction queue
    pub fn touch(&self, segment_id: SegmentId) -> Option<DiskCacheEntry> {
        let entry = self.state.lock().touch(segment_id);
        let counter = if entry.is_some() {
            &self.stats.hits
        } else {
            &self.stats.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        entry
    }

    /// Whether a segment is indexed, without refreshing its recency
    #[must_use]
    pub fn contains(&self, segment_id: SegmentId) -> bool {
        self.state.lock().entries.contains_key(&segment_id)
    }

    /// Admit a segment of `length` bytes, evicting from the front as needed
    ///
    /// Returns the evicted entries, whose files the caller must delete. A
    /// segment larger than the whole cache is refused without evicting
    /// anything.
    pub fn insert(
        &self,
        segment_id: SegmentId,
        path: PathBuf,
        length: u64,
    ) -> Result<Vec<DiskCacheEntry>> {
        self.admit(length)?;

        let mut state = self.state.lock();
        let mut evicted = Vec::new();
        if let Some(previous) = state.remove(segment_id) {
            evicted.push(previous);
        }
        while state.free < length {
            let Some((_, &victim)) = state.queue.first_key_value() else {
                break;
            };
            if let Some(entry) = state.remove(victim) {
                evicted.push(entry);
            }
        }

        let tick = state.next_tick();
        state.queue.insert(tick, segment_id);
        state.entries.insert(
            segment_id,
            DiskCacheEntry {
                segment_id,
                path,
                length,
                last_access: SystemTime::now(),
                tick,
            },
        );
        state.usage += length;
        state.free -= length;
        drop(state);

        self.stats.inserts.fetch_add(1, Ordering::Relaxed);
        self.stats
            .evictions
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        Ok(evicted)
    }

    /// Check that a segment of `length` bytes can ever fit
    pub fn admit(&self, length: u64) -> Result<()> {
        if length > self.capacity {
            self.stats.rejections.fetch_add(1, Ordering::Relaxed);
            return Err(Error::SegmentTooLarge {
                size: length,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Drop a segment from the index
    pub fn remove(&self, segment_id: SegmentId) -> Option<DiskCacheEntry> {
        self.state.lock().remove(segment_id)
    }

    /// Drop every entry, oldest first
    pub fn drain(&self) -> Vec<DiskCacheEntry> {
        let mut state = self.state.lock();
        let order: Vec<SegmentId> = state.queue.values().copied().collect();
        order
            .into_iter()
            .filter_map(|segment_id| state.remove(segment_id))
            .collect()
    }

    /// Cached segment ids, oldest first
    #[must_use]
    pub fn segments(&self) -> Vec<SegmentId> {
        self.state.lock().queue.values().copied().collect()
    }

    #[must_use]
    pub const fn capacity(&self) -> u64 {
        self.capacity
    }

    #[must_use]
    pub fn usage(&self) -> u64 {
        self.state.lock().usage
    }

    #[must_use]
    pub fn free_space(&self) -> u64 {
        self.state.lock().free
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn stats(&self) -> &CacheStats {
        &self.stats
    }
}
