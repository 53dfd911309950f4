//! # Unbatcher
//!
//! Reassembles frames from received byte chunks.
//!
//! A stream transport may split or merge batches arbitrarily. Chunks are
//! appended to one backlog and frames are cut out of it as soon as they are
//! complete, so a frame split across any number of chunks (down to single
//! bytes) comes out whole and in order. Completed frames share the backlog's
//! allocation instead of being copied.

use bytes::{Buf, Bytes, BytesMut};

use crate::core::batcher::FRAME_HEADER_SIZE;
use crate::error::{ProtocolError, Result};

pub struct Unbatcher {
    backlog: BytesMut,
    /// Payload length of the frame being assembled, once its header is read
    pending_len: Option<usize>,
    max_frame: usize,
}

impl Unbatcher {
    /// Create an unbatcher that rejects frames larger than `max_frame` bytes,
    /// header included
    pub fn new(max_frame: usize) -> Self {
        Self {
            backlog: BytesMut::new(),
            pending_len: None,
            max_frame,
        }
    }

    /// Append a received chunk. No frames are cut until [`Self::try_dequeue`].
    pub fn enqueue(&mut self, chunk: &[u8]) {
        self.backlog.extend_from_slice(chunk);
    }

    /// Cut the next complete frame out of the backlog
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    ///
    /// # Errors
    /// [`ProtocolError::OversizedFrame`] if a length header announces a frame
    /// above the limit. The stream cannot be resynchronised after that.
    pub fn try_dequeue(&mut self) -> Result<Option<Bytes>> {
        let len = match self.pending_len {
            Some(len) => len,
            None => {
                if self.backlog.len() < FRAME_HEADER_SIZE {
                    return Ok(None);
                }

                let mut header = [0u8; FRAME_HEADER_SIZE];
                header.copy_from_slice(&self.backlog[..FRAME_HEADER_SIZE]);
                let len = u32::from_le_bytes(header) as usize;

                let size = len.saturating_add(FRAME_HEADER_SIZE);
                if size > self.max_frame {
                    return Err(ProtocolError::OversizedFrame {
                        size,
                        limit: self.max_frame,
                    });
                }

                self.backlog.advance(FRAME_HEADER_SIZE);
                self.pending_len = Some(len);
                len
            }
        };

        if self.backlog.len() < len {
            return Ok(None);
        }

        self.pending_len = None;
        Ok(Some(self.backlog.split_to(len).freeze()))
    }

    /// Bytes received but not yet returned as frames
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Discard the backlog and any partially read frame
    pub fn clear(&mut self) {
        self.backlog.clear();
        self.pending_len = None;
    }
}

impl std::fmt::Debug for Unbatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unbatcher")
            .field("backlog", &self.backlog.len())
            .field("pending_len", &self.pending_len)
            .field("max_frame", &self.max_frame)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut out = (payload.len() as u32).to_le_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_whole_frames() {
        let mut unbatcher = Unbatcher::new(1024);
        let mut data = frame(b"one");
        data.extend(frame(b"two"));
        unbatcher.enqueue(&data);

        assert_eq!(&unbatcher.try_dequeue().unwrap().unwrap()[..], b"one");
        assert_eq!(&unbatcher.try_dequeue().unwrap().unwrap()[..], b"two");
        assert!(unbatcher.try_dequeue().unwrap().is_none());
    }

    #[test]
    fn test_single_byte_chunks() {
        let mut unbatcher = Unbatcher::new(1024);
        let data = frame(b"split payload");
        let mut frames = Vec::new();

        for byte in &data {
            unbatcher.enqueue(std::slice::from_ref(byte));
            while let Some(frame) = unbatcher.try_dequeue().unwrap() {
                frames.push(frame);
            }
        }

        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"split payload");
        assert_eq!(unbatcher.backlog_len(), 0);
    }

    #[test]
    fn test_header_split_from_payload() {
        let mut unbatcher = Unbatcher::new(1024);
        let data = frame(b"abc");
        unbatcher.enqueue(&data[..4]);
        assert!(unbatcher.try_dequeue().unwrap().is_none());
        unbatcher.enqueue(&data[4..]);
        assert_eq!(&unbatcher.try_dequeue().unwrap().unwrap()[..], b"abc");
    }

    #[test]
    fn test_empty_frame() {
        let mut unbatcher = Unbatcher::new(1024);
        unbatcher.enqueue(&frame(b""));
        assert_eq!(unbatcher.try_dequeue().unwrap().unwrap().len(), 0);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut unbatcher = Unbatcher::new(16);
        unbatcher.enqueue(&100u32.to_le_bytes());
        assert!(matches!(
            unbatcher.try_dequeue(),
            Err(ProtocolError::OversizedFrame {
                size: 104,
                limit: 16
            })
        ));
    }

    #[test]
    fn test_clear_resets_partial_frame() {
        let mut unbatcher = Unbatcher::new(1024);
        let data = frame(b"abcdef");
        unbatcher.enqueue(&data[..6]);
        assert!(unbatcher.try_dequeue().unwrap().is_none());

        unbatcher.clear();
        unbatcher.enqueue(&frame(b"xy"));
        assert_eq!(&unbatcher.try_dequeue().unwrap().unwrap()[..], b"xy");
    }
}
