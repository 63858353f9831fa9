//! Memory arena for segment and block payloads
//!
//! Buffers are handed out zero-initialized and return to a size-classed free
//! list when dropped. An [`ArenaBuf`] is exclusively owned; freezing it yields
//! a [`Bytes`] handle that can be shared by count, and the memory goes back to
//! the arena when the last clone is dropped.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Smallest size class handed out
const MIN_CLASS: usize = 4096;

/// Arena statistics for monitoring
#[derive(Debug, Default)]
pub struct ArenaStats {
    /// Buffers handed out and not yet returned
    pub outstanding_buffers: AtomicU64,
    /// Bytes requested by outstanding buffers
    pub outstanding_bytes: AtomicU64,
    /// Total acquisitions
    pub acquisitions: AtomicU64,
    /// Acquisitions served from the free list
    pub reuses: AtomicU64,
}

struct ArenaInner {
    /// Free buffers by size class
    free: Mutex<HashMap<usize, Vec<Vec<u8>>>>,
    /// Bytes currently parked in the free list
    retained: AtomicU64,
    /// Upper bound on `retained`
    retain_limit: u64,
    stats: ArenaStats,
}

impl ArenaInner {
    fn recycle(&self, data: Vec<u8>, len: usize) {
        self.stats.outstanding_buffers.fetch_sub(1, Ordering::Relaxed);
        self.stats
            .outstanding_bytes
            .fetch_sub(len as u64, Ordering::Relaxed);

        let class = data.len();
        if class < MIN_CLASS {
            return;
        }
        let retained = self.retained.load(Ordering::Relaxed);
        if retained + class as u64 > self.retain_limit {
            return;
        }
        self.retained.fetch_add(class as u64, Ordering::Relaxed);
        self.free.lock().entry(class).or_default().push(data);
    }
}

/// Pool of reusable byte buffers
#[derive(Clone)]
pub struct Arena {
    inner: Arc<ArenaInner>,
}

impl Arena {
    /// Create an arena that parks at most `retain_limit` bytes of free buffers
    #[must_use]
    pub fn new(retain_limit: u64) -> Self {
        Self {
            inner: Arc::new(ArenaInner {
                free: Mutex::new(HashMap::new()),
                retained: AtomicU64::new(0),
                retain_limit,
                stats: ArenaStats::default(),
            }),
        }
    }

    /// Acquire a zero-initialized buffer of exactly `len` bytes
    #[must_use]
    pub fn acquire(&self, len: usize) -> ArenaBuf {
        let stats = &self.inner.stats;
        stats.acquisitions.fetch_add(1, Ordering::Relaxed);
        stats.outstanding_buffers.fetch_add(1, Ordering::Relaxed);
        stats
            .outstanding_bytes
            .fetch_add(len as u64, Ordering::Relaxed);

        let class = size_class(len);
        let reused = if class >= MIN_CLASS {
            self.inner
                .free
                .lock()
                .get_mut(&class)
                .and_then(Vec::pop)
        } else {
            None
        };

        let data = match reused {
            Some(mut data) => {
                self.inner
                    .retained
                    .fetch_sub(class as u64, Ordering::Relaxed);
                stats.reuses.fetch_add(1, Ordering::Relaxed);
                data[..len].fill(0);
                data
            }
            None => vec![0u8; class],
        };

        ArenaBuf {
            data,
            len,
            arena: Arc::clone(&self.inner),
        }
    }

    /// Copy `src` into a freshly acquired buffer
    #[must_use]
    pub fn copy_from(&self, src: &[u8]) -> ArenaBuf {
        let mut buf = self.acquire(src.len());
        buf.copy_from_slice(src);
        buf
    }

    #[must_use]
    pub fn stats(&self) -> &ArenaStats {
        &self.inner.stats
    }

    /// Number of buffers handed out and not yet returned
    #[must_use]
    pub fn outstanding(&self) -> u64 {
        self.inner.stats.outstanding_buffers.load(Ordering::Relaxed)
    }

    /// Bytes parked in the free list
    #[must_use]
    pub fn retained_bytes(&self) -> u64 {
        self.inner.retained.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("outstanding", &self.outstanding())
            .field("retained_bytes", &self.retained_bytes())
            .finish()
    }
}

/// Buffers are rounded up to a power of two so they can be reused
fn size_class(len: usize) -> usize {
    if len == 0 {
        0
    } else {
        len.next_power_of_two().max(MIN_CLASS)
    }
}

/// An exclusively owned arena buffer, returned to the arena on drop
pub struct ArenaBuf {
    data: Vec<u8>,
    len: usize,
    arena: Arc<ArenaInner>,
}

impl ArenaBuf {
    /// Convert into a shared handle; the buffer returns to the arena when the
    /// last clone is dropped
    #[must_use]
    pub fn freeze(self) -> Bytes {
        Bytes::from_owner(self)
    }
}

impl Deref for ArenaBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

impl DerefMut for ArenaBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }
}

impl AsRef<[u8]> for ArenaBuf {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl fmt::Debug for ArenaBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArenaBuf({} bytes)", self.len)
    }
}

impl Drop for ArenaBuf {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        self.arena.recycle(data, self.len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_is_zeroed() {
        let arena = Arena::new(1 << 20);
        let mut buf = arena.acquire(100);
        assert_eq!(buf.len(), 100);
        assert!(buf.iter().all(|&b| b == 0));

        buf.fill(0xab);
        drop(buf);

        // The recycled buffer comes back clean
        let buf = arena.acquire(100);
        assert!(buf.iter().all(|&b| b == 0));
        assert_eq!(arena.stats().reuses.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_outstanding_accounting() {
        let arena = Arena::new(1 << 20);
        let a = arena.acquire(10);
        let b = arena.acquire(5000);
        assert_eq!(arena.outstanding(), 2);
        assert_eq!(
            arena.stats().outstanding_bytes.load(Ordering::Relaxed),
            5010
        );

        drop(a);
        drop(b);
        assert_eq!(arena.outstanding(), 0);
        assert_eq!(arena.stats().outstanding_bytes.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_frozen_released_on_last_clone() {
        let arena = Arena::new(1 << 20);
        let shared = arena.copy_from(b"segment bytes").freeze();
        let other = shared.clone();
        assert_eq!(&other[..], b"segment bytes");

        drop(shared);
        assert_eq!(arena.outstanding(), 1);
        drop(other);
        assert_eq!(arena.outstanding(), 0);
    }

    #[test]
    fn test_retain_limit() {
        let arena = Arena::new(MIN_CLASS as u64);
        let a = arena.acquire(MIN_CLASS);
        let b = arena.acquire(MIN_CLASS);
        drop(a);
        drop(b);
        assert_eq!(arena.retained_bytes(), MIN_CLASS as u64);
    }

    #[test]
    fn test_zero_length() {
        let arena = Arena::new(1 << 20);
        let buf = arena.acquire(0);
        assert!(buf.is_empty());
        assert_eq!(&buf.freeze()[..], b"");
        assert_eq!(arena.outstanding(), 0);
    }
}
