//! Transfer sessions
//!
//! A session stages one incoming payload (a whole segment during upload, or
//! one block during the block sub-protocol) in an arena buffer while its
//! chunks arrive in any order. Chunk writes and completion accounting are
//! separate steps: the store copies bytes, the caller decides when a chunk
//! counts as done.

use crate::arena::ArenaBuf;
use crate::pending::PendingCounter;
use bytes::Bytes;
use ecfs_common::{BlockKey, Error, Result, SegmentId};
use parking_lot::Mutex;
use std::fmt;

/// Identity of a transfer session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransferKey {
    Segment(SegmentId),
    Block(BlockKey),
}

impl fmt::Display for TransferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Segment(segment_id) => write!(f, "segment {segment_id}"),
            Self::Block(key) => write!(f, "block {key}"),
        }
    }
}

impl From<SegmentId> for TransferKey {
    fn from(segment_id: SegmentId) -> Self {
        Self::Segment(segment_id)
    }
}

impl From<BlockKey> for TransferKey {
    fn from(key: BlockKey) -> Self {
        Self::Block(key)
    }
}

enum SessionBuffer {
    /// Chunks are still being copied in
    Writing(ArenaBuf),
    /// All chunks accounted for; shared read-only from here on
    Staged(Bytes),
}

/// One in-flight transfer
pub struct TransferSession {
    key: TransferKey,
    length: usize,
    buffer: Mutex<SessionBuffer>,
    pending: PendingCounter,
}

impl TransferSession {
    pub(crate) fn new(key: TransferKey, buffer: ArenaBuf, chunk_count: u64) -> Self {
        Self {
            key,
            length: buffer.len(),
            buffer: Mutex::new(SessionBuffer::Writing(buffer)),
            pending: PendingCounter::new(chunk_count),
        }
    }

    #[must_use]
    pub const fn key(&self) -> TransferKey {
        self.key
    }

    /// Total payload length
    #[must_use]
    pub const fn length(&self) -> usize {
        self.length
    }

    /// Chunks not yet accounted for
    #[must_use]
    pub fn pending(&self) -> u64 {
        self.pending.pending()
    }

    pub(crate) fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(data.len())
            .filter(|&end| end <= self.length)
            .ok_or(Error::ChunkOutOfBounds {
                offset,
                length: data.len(),
                capacity: self.length,
            })?;
        match &mut *self.buffer.lock() {
            SessionBuffer::Writing(buf) => {
                buf[offset..end].copy_from_slice(data);
                Ok(())
            }
            SessionBuffer::Staged(_) => Err(Error::invalid_argument(format!(
                "chunk for {} arrived after the transfer was staged",
                self.key
            ))),
        }
    }

    pub(crate) fn complete_chunk(&self) -> Result<u64> {
        self.pending.complete_one()
    }

    pub(crate) async fn wait(&self) {
        self.pending.wait().await;
    }

    /// Freeze the buffer once every chunk is accounted for
    pub(crate) fn stage(&self) -> Result<Bytes> {
        let pending = self.pending.pending();
        if pending > 0 {
            return Err(Error::TransferIncomplete {
                key: self.key.to_string(),
                pending,
            });
        }
        let mut buffer = self.buffer.lock();
        let staged = match std::mem::replace(&mut *buffer, SessionBuffer::Staged(Bytes::new())) {
            SessionBuffer::Writing(buf) => buf.freeze(),
            SessionBuffer::Staged(bytes) => bytes,
        };
        *buffer = SessionBuffer::Staged(staged.clone());
        Ok(staged)
    }
}

impl fmt::Debug for TransferSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferSession")
            .field("key", &self.key)
            .field("length", &self.length)
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;

    fn session(len: usize, chunks: u64) -> TransferSession {
        let arena = Arena::new(0);
        TransferSession::new(SegmentId::new(1).into(), arena.acquire(len), chunks)
    }

    #[test]
    fn test_key_display() {
        let key = BlockKey::new(SegmentId::new(4), 2);
        assert_eq!(TransferKey::from(key).to_string(), "block 4.2");
        assert_eq!(
            TransferKey::from(SegmentId::new(4)).to_string(),
            "segment 4"
        );
    }

    #[test]
    fn test_out_of_order_chunks() {
        let session = session(6, 2);
        session.write(3, b"def").unwrap();
        session.write(0, b"abc").unwrap();
        session.complete_chunk().unwrap();
        session.complete_chunk().unwrap();

        assert_eq!(&session.stage().unwrap()[..], b"abcdef");
        // Staging again hands out the same bytes
        assert_eq!(&session.stage().unwrap()[..], b"abcdef");
    }

    #[test]
    fn test_chunk_bounds() {
        let session = session(4, 1);
        assert!(matches!(
            session.write(2, b"xyz"),
            Err(Error::ChunkOutOfBounds { .. })
        ));
        assert!(session.write(usize::MAX, b"x").is_err());
    }

    #[test]
    fn test_stage_requires_all_chunks() {
        let session = session(4, 2);
        session.complete_chunk().unwrap();
        assert!(matches!(
            session.stage(),
            Err(Error::TransferIncomplete { pending: 1, .. })
        ));
    }

    #[test]
    fn test_write_after_stage_rejected() {
        let session = session(2, 0);
        session.stage().unwrap();
        assert!(session.write(0, b"x").is_err());
    }
}
