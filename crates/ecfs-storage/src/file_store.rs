//! Named files with a bounded open-handle cache
//!
//! Block, delta and cached-segment files are addressed by path and accessed
//! with positional reads and writes. At most `max_open` handles stay open;
//! admitting a new one closes the least recently used. Callers that still
//! hold a handle keep it usable until they finish.

use ecfs_common::Result;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::trace;

struct OpenFile {
    file: Arc<File>,
    tick: u64,
}

/// Open handles ordered by last use
#[derive(Default)]
struct HandleCache {
    open: HashMap<PathBuf, OpenFile>,
    /// Last-use tick to path, oldest first
    order: BTreeMap<u64, PathBuf>,
    clock: u64,
}

impl HandleCache {
    fn touch(&mut self, path: &Path) -> Option<Arc<File>> {
        let clock = self.clock + 1;
        let entry = self.open.get_mut(path)?;
        self.order.remove(&entry.tick);
        entry.tick = clock;
        self.order.insert(clock, path.to_path_buf());
        self.clock = clock;
        Some(Arc::clone(&entry.file))
    }

    fn insert(&mut self, path: PathBuf, file: Arc<File>, max_open: usize) {
        if let Some(old) = self.open.remove(&path) {
            self.order.remove(&old.tick);
        }
        while self.open.len() >= max_open {
            let Some((_, victim)) = self.order.pop_first() else {
                break;
            };
            trace!(path = %victim.display(), "closing least recently used file");
            self.open.remove(&victim);
        }
        self.clock += 1;
        self.order.insert(self.clock, path.clone());
        self.open.insert(
            path,
            OpenFile {
                file,
                tick: self.clock,
            },
        );
    }

    fn remove(&mut self, path: &Path) {
        if let Some(old) = self.open.remove(path) {
            self.order.remove(&old.tick);
        }
    }
}

/// File access with at most `max_open` concurrently cached handles
pub struct FileStore {
    handles: Mutex<HandleCache>,
    max_open: usize,
}

impl FileStore {
    #[must_use]
    pub fn new(max_open: usize) -> Self {
        Self {
            handles: Mutex::new(HandleCache::default()),
            max_open: max_open.max(1),
        }
    }

    /// Create (or truncate) a file of `len` bytes and keep it open
    pub fn create(&self, path: &Path, len: u64) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len)?;
        self.handles
            .lock()
            .insert(path.to_path_buf(), Arc::new(file), self.max_open);
        Ok(())
    }

    /// Get a handle, opening the file if it is not cached
    pub fn open(&self, path: &Path) -> Result<Arc<File>> {
        let mut handles = self.handles.lock();
        if let Some(file) = handles.touch(path) {
            return Ok(file);
        }
        let file = Arc::new(OpenOptions::new().read(true).write(true).open(path)?);
        handles.insert(path.to_path_buf(), Arc::clone(&file), self.max_open);
        Ok(file)
    }

    /// Drop the cached handle of a file
    pub fn close(&self, path: &Path) {
        self.handles.lock().remove(path);
    }

    /// Read exactly `buf.len()` bytes at `offset`
    pub fn read_into(&self, path: &Path, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.open(path)?.read_exact_at(buf, offset)?;
        Ok(())
    }

    /// Write all of `buf` at `offset`
    pub fn write(&self, path: &Path, offset: u64, buf: &[u8]) -> Result<()> {
        self.open(path)?.write_all_at(buf, offset)?;
        Ok(())
    }

    /// Force file contents to durable storage
    pub fn flush(&self, path: &Path) -> Result<()> {
        self.open(path)?.sync_data()?;
        Ok(())
    }

    /// Atomically move a file over `to`, dropping cached handles of both names
    pub fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let mut handles = self.handles.lock();
        handles.remove(from);
        handles.remove(to);
        std::fs::rename(from, to)?;
        Ok(())
    }

    /// Close and delete a file
    pub fn remove(&self, path: &Path) -> Result<()> {
        self.close(path);
        std::fs::remove_file(path)?;
        Ok(())
    }

    /// Number of handles currently cached
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.handles.lock().open.len()
    }

    #[must_use]
    pub fn is_open(&self, path: &Path) -> bool {
        self.handles.lock().open.contains_key(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_write_read() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(4);
        let path = dir.path().join("block");

        store.create(&path, 16).unwrap();
        store.write(&path, 4, b"data").unwrap();
        store.flush(&path).unwrap();

        let mut buf = [0u8; 8];
        store.read_into(&path, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"\0\0\0\0data");
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 16);
    }

    #[test]
    fn test_handle_limit_evicts_lru() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(2);
        let paths: Vec<PathBuf> = (0..3).map(|i| dir.path().join(i.to_string())).collect();

        store.create(&paths[0], 1).unwrap();
        store.create(&paths[1], 1).unwrap();
        // Touch 0 so 1 becomes the least recently used
        store.open(&paths[0]).unwrap();
        store.create(&paths[2], 1).unwrap();

        assert_eq!(store.open_count(), 2);
        assert!(store.is_open(&paths[0]));
        assert!(!store.is_open(&paths[1]));
        assert!(store.is_open(&paths[2]));

        // Evicted files reopen transparently
        store.write(&paths[1], 0, b"x").unwrap();
        assert_eq!(store.open_count(), 2);
        assert!(!store.is_open(&paths[0]));
    }

    #[test]
    fn test_read_past_end_fails() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(2);
        let path = dir.path().join("short");
        store.create(&path, 2).unwrap();

        let mut buf = [0u8; 4];
        assert!(store.read_into(&path, 0, &mut buf).is_err());
    }

    #[test]
    fn test_remove() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(2);
        let path = dir.path().join("gone");
        store.create(&path, 1).unwrap();

        store.remove(&path).unwrap();
        assert!(!path.exists());
        assert_eq!(store.open_count(), 0);
        assert!(store.open(&path).is_err());
    }

    #[test]
    fn test_rename_replaces_target() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(4);
        let staging = dir.path().join("seg.tmp");
        let target = dir.path().join("seg");

        store.create(&target, 3).unwrap();
        store.write(&target, 0, b"old").unwrap();
        store.create(&staging, 3).unwrap();
        store.write(&staging, 0, b"new").unwrap();

        store.rename(&staging, &target).unwrap();
        assert!(!staging.exists());
        assert!(!store.is_open(&staging));

        // The target's stale handle was dropped, so reads see the new file
        let mut buf = [0u8; 3];
        store.read_into(&target, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"new");
    }
}
