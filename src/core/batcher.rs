//! # Batcher
//!
//! Coalesces outgoing payloads into size-bounded batches.
//!
//! Each payload becomes one frame, `u32 length` (little-endian) followed by the
//! payload bytes, appended to the open batch. A batch never grows past the
//! threshold: when the next frame would not fit, a new batch is started and
//! the previous one becomes retrievable. A payload whose frame alone exceeds
//! the threshold is rejected and never appears in any batch.
//!
//! ## Wire Format
//! ```text
//! [len(4)] [payload(len)] [len(4)] [payload(len)] ...   (total <= threshold)
//! ```

use std::collections::VecDeque;

use tracing::trace;

use crate::error::{ProtocolError, Result};
use crate::utils::buffer_pool::{PooledWriter, WriterPool};

/// Size of the length header in front of every frame
pub const FRAME_HEADER_SIZE: usize = 4;

pub struct Batcher {
    threshold: usize,
    batches: VecDeque<PooledWriter>,
    /// Whether the newest batch still accepts frames
    open: bool,
    pool: WriterPool,
}

impl Batcher {
    pub fn new(threshold: usize, pool: WriterPool) -> Self {
        Self {
            threshold,
            batches: VecDeque::new(),
            open: false,
            pool,
        }
    }

    #[inline]
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Append `payload` as one frame
    ///
    /// # Errors
    /// Returns [`ProtocolError::OversizedPayload`] if the frame cannot fit in
    /// an empty batch. Nothing is enqueued in that case.
    pub fn enqueue(&mut self, payload: &[u8]) -> Result<()> {
        let size = payload.len() + FRAME_HEADER_SIZE;
        if size > self.threshold {
            return Err(ProtocolError::OversizedPayload {
                size,
                threshold: self.threshold,
            });
        }

        let needs_new_batch = match self.batches.back() {
            Some(batch) if self.open => batch.position() + size > self.threshold,
            _ => true,
        };
        if needs_new_batch {
            self.batches.push_back(self.pool.acquire());
            self.open = true;
        }

        if let Some(batch) = self.batches.back_mut() {
            batch.write(payload.len() as u32);
            batch.write_bytes(payload);
            trace!(
                bytes = payload.len(),
                batch_size = batch.position(),
                "Frame batched"
            );
        }
        Ok(())
    }

    /// Take the oldest batch. Taking the last batch closes it, so the next
    /// enqueue starts a fresh one.
    pub fn try_dequeue(&mut self) -> Option<PooledWriter> {
        let batch = self.batches.pop_front()?;
        if self.batches.is_empty() {
            self.open = false;
        }
        Some(batch)
    }

    /// Number of batches waiting to be sent, including the open one
    #[inline]
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Drop every pending batch, returning the writers to the pool
    pub fn clear(&mut self) {
        self.batches.clear();
        self.open = false;
    }
}

impl std::fmt::Debug for Batcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batcher")
            .field("threshold", &self.threshold)
            .field("batches", &self.batches.len())
            .field("open", &self.open)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batcher(threshold: usize) -> Batcher {
        Batcher::new(threshold, WriterPool::new(2))
    }

    #[test]
    fn test_small_payloads_share_one_batch() {
        let mut batcher = batcher(1024);
        batcher.enqueue(b"aaaa").unwrap();
        batcher.enqueue(b"bb").unwrap();

        let batch = batcher.try_dequeue().unwrap();
        assert_eq!(
            batch.as_slice(),
            &[4, 0, 0, 0, b'a', b'a', b'a', b'a', 2, 0, 0, 0, b'b', b'b']
        );
        assert!(batcher.try_dequeue().is_none());
    }

    #[test]
    fn test_frame_exactly_at_threshold() {
        let mut batcher = batcher(10);
        batcher.enqueue(&[1u8; 6]).unwrap();
        batcher.enqueue(&[2u8; 6]).unwrap();
        assert_eq!(batcher.len(), 2);
        assert_eq!(batcher.try_dequeue().unwrap().position(), 10);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let mut batcher = batcher(10);
        let err = batcher.enqueue(&[0u8; 7]).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::OversizedPayload {
                size: 11,
                threshold: 10
            }
        ));
        assert!(batcher.is_empty());
    }

    #[test]
    fn test_dequeue_closes_open_batch() {
        let mut batcher = batcher(1024);
        batcher.enqueue(b"first").unwrap();
        let first = batcher.try_dequeue().unwrap();

        batcher.enqueue(b"second").unwrap();
        let second = batcher.try_dequeue().unwrap();

        assert_eq!(first.position(), 9);
        assert_eq!(second.position(), 10);
    }

    #[test]
    fn test_dequeue_leaves_open_batch_when_more_pending() {
        let mut batcher = batcher(12);
        batcher.enqueue(&[1u8; 8]).unwrap();
        batcher.enqueue(&[2u8; 2]).unwrap();
        assert_eq!(batcher.len(), 2);

        let _oldest = batcher.try_dequeue().unwrap();
        // The newer batch is still open and accepts more frames
        batcher.enqueue(&[3u8; 2]).unwrap();
        assert_eq!(batcher.len(), 1);
        assert_eq!(batcher.try_dequeue().unwrap().position(), 12);
    }

    #[test]
    fn test_clear_returns_writers() {
        let pool = WriterPool::new(2);
        let mut batcher = Batcher::new(8, pool.clone());
        batcher.enqueue(&[0u8; 4]).unwrap();
        batcher.enqueue(&[0u8; 4]).unwrap();
        assert_eq!(pool.available(), 0);

        batcher.clear();
        assert_eq!(pool.available(), 2);
        assert!(batcher.try_dequeue().is_none());
    }
}
