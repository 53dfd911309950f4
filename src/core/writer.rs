//! # Network Writer
//!
//! Growable byte buffer used to encode outgoing data.
//!
//! The buffer grows geometrically (at least doubling, at least enough for the
//! pending write). Growth copies the written prefix, so bytes already written
//! are never lost. [`NetworkWriter::clear`] resets the position while keeping
//! the capacity, which is what makes pooled writers cheap to reuse.

use bytes::Bytes;
use zerocopy::IntoBytes;

use crate::core::codec::{Blittable, Wire, NULL_LENGTH};
use crate::error::{ProtocolError, Result};

/// Initial capacity of a freshly allocated writer
pub const DEFAULT_WRITER_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct NetworkWriter {
    buffer: Vec<u8>,
}

impl Default for NetworkWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkWriter {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_WRITER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Number of bytes written so far
    #[inline]
    pub fn position(&self) -> usize {
        self.buffer.len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// View of the written bytes. Does not copy.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    /// Copy the written bytes into an owned, shareable buffer
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.buffer)
    }

    /// Reset the position to zero, keeping the allocated capacity
    #[inline]
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Append raw bytes without a length prefix
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.ensure_capacity(bytes.len());
        self.buffer.extend_from_slice(bytes);
    }

    /// Append a primitive value
    #[inline]
    pub fn write<T: Wire>(&mut self, value: T) {
        value.write_to(self);
    }

    /// Append `i32 length` followed by the bytes, or `-1` when absent
    pub fn write_bytes_with_length(&mut self, bytes: Option<&[u8]>) -> Result<()> {
        match bytes {
            Some(bytes) => {
                self.write_length(bytes.len())?;
                self.write_bytes(bytes);
            }
            None => self.write(NULL_LENGTH),
        }
        Ok(())
    }

    /// Append a UTF-8 string with an `i32` byte-length prefix
    pub fn write_str(&mut self, text: &str) -> Result<()> {
        self.write_bytes_with_length(Some(text.as_bytes()))
    }

    /// Append an optional string; `None` is encoded as length `-1`
    pub fn write_string(&mut self, text: Option<&str>) -> Result<()> {
        self.write_bytes_with_length(text.map(str::as_bytes))
    }

    /// Append the raw bytes of a blittable value
    #[inline]
    pub fn write_blittable<T: Blittable>(&mut self, value: &T) {
        self.write_bytes(value.as_bytes());
    }

    /// Append `i32 count` followed by the packed elements, or `-1` when absent
    pub fn write_blittable_slice<T: Blittable>(&mut self, values: Option<&[T]>) -> Result<()> {
        match values {
            Some(values) => {
                self.write_length(values.len())?;
                self.write_bytes(values.as_bytes());
            }
            None => self.write(NULL_LENGTH),
        }
        Ok(())
    }

    fn write_length(&mut self, len: usize) -> Result<()> {
        let len = i32::try_from(len)
            .map_err(|_| ProtocolError::InvalidData(format!("length {len} does not fit in i32")))?;
        self.write(len);
        Ok(())
    }

    fn ensure_capacity(&mut self, additional: usize) {
        let target = self.buffer.len() + additional;
        let current = self.buffer.capacity();

        if target <= current {
            return;
        }

        let new_capacity = target.max(current * 2);
        self.buffer.reserve_exact(new_capacity - self.buffer.len());
    }
}

impl AsRef<[u8]> for NetworkWriter {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_growth_at_least_doubles() {
        let mut writer = NetworkWriter::with_capacity(4);
        writer.write_bytes(&[1, 2, 3, 4]);
        assert_eq!(writer.capacity(), 4);

        writer.write(5u8);
        assert!(writer.capacity() >= 8);
        assert_eq!(writer.as_slice(), &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_growth_covers_large_write() {
        let mut writer = NetworkWriter::with_capacity(4);
        writer.write_bytes(&[9u8; 100]);
        assert!(writer.capacity() >= 100);
        assert_eq!(writer.position(), 100);
    }

    #[test]
    fn test_clear_keeps_capacity() {
        let mut writer = NetworkWriter::new();
        writer.write_bytes(&[0u8; 1000]);
        let capacity = writer.capacity();

        writer.clear();
        assert_eq!(writer.position(), 0);
        assert_eq!(writer.capacity(), capacity);
    }

    #[test]
    fn test_string_encoding() {
        let mut writer = NetworkWriter::new();
        writer.write_str("Hi").unwrap();
        writer.write_string(None).unwrap();
        assert_eq!(
            writer.as_slice(),
            &[2, 0, 0, 0, b'H', b'i', 0xFF, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn test_blittable_slice_encoding() {
        let mut writer = NetworkWriter::new();
        writer.write_blittable_slice(Some(&[1u16, 2u16][..])).unwrap();
        writer.write_blittable_slice::<u16>(None).unwrap();
        assert_eq!(writer.position(), 4 + 4 + 4);
    }
}
