//! # Network Reader
//!
//! Cursor over a received byte buffer.
//!
//! Every read is bounds-checked. A read that would run past the end returns
//! [`ProtocolError::EndOfData`] and leaves the position unchanged, so a caller
//! can report the failure without the reader ending up half-advanced.
//! Slices returned by [`NetworkReader::read_bytes`] share the underlying
//! buffer instead of copying it.

use bytes::Bytes;

use crate::core::codec::{Blittable, Wire, NULL_LENGTH};
use crate::error::{ProtocolError, Result};

#[derive(Debug, Clone)]
pub struct NetworkReader {
    buffer: Bytes,
    position: usize,
}

impl NetworkReader {
    pub fn new(buffer: Bytes) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    /// Build a reader over a copy of `data`
    pub fn from_slice(data: &[u8]) -> Self {
        Self::new(Bytes::copy_from_slice(data))
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.position
    }

    /// Total length of the underlying buffer
    #[inline]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.position
    }

    /// Unread bytes, without advancing
    pub fn remaining_bytes(&self) -> Bytes {
        self.buffer.slice(self.position..)
    }

    /// Take `count` bytes as a shared slice of the buffer
    pub fn read_bytes(&mut self, count: usize) -> Result<Bytes> {
        self.ensure(count)?;
        let slice = self.buffer.slice(self.position..self.position + count);
        self.position += count;
        Ok(slice)
    }

    /// Fill `out` from the buffer
    pub fn read_into(&mut self, out: &mut [u8]) -> Result<()> {
        self.ensure(out.len())?;
        out.copy_from_slice(&self.buffer[self.position..self.position + out.len()]);
        self.position += out.len();
        Ok(())
    }

    /// Skip `count` bytes
    pub fn skip(&mut self, count: usize) -> Result<()> {
        self.ensure(count)?;
        self.position += count;
        Ok(())
    }

    #[inline]
    pub fn read<T: Wire>(&mut self) -> Result<T> {
        T::read_from(self)
    }

    /// Read an `i32` length prefix. `-1` means absent, any other negative value is rejected.
    pub fn read_length(&mut self) -> Result<Option<usize>> {
        let start = self.position;
        let len = self.read::<i32>()?;
        match len {
            NULL_LENGTH => Ok(None),
            len if len < 0 => {
                self.position = start;
                Err(ProtocolError::InvalidLength(len))
            }
            len => Ok(Some(len as usize)),
        }
    }

    pub fn read_bytes_with_length(&mut self) -> Result<Option<Bytes>> {
        let start = self.position;
        let Some(len) = self.read_length()? else {
            return Ok(None);
        };
        self.read_bytes(len).map(Some).inspect_err(|_| self.position = start)
    }

    /// Read an optional UTF-8 string written by [`NetworkWriter::write_string`]
    ///
    /// [`NetworkWriter::write_string`]: crate::core::writer::NetworkWriter::write_string
    pub fn read_string(&mut self) -> Result<Option<String>> {
        let start = self.position;
        let Some(bytes) = self.read_bytes_with_length()? else {
            return Ok(None);
        };
        match std::str::from_utf8(&bytes) {
            Ok(text) => Ok(Some(text.to_owned())),
            Err(err) => {
                self.position = start;
                Err(ProtocolError::InvalidUtf8(err))
            }
        }
    }

    pub fn read_blittable<T: Blittable>(&mut self) -> Result<T> {
        self.ensure(T::SIZE)?;
        let end = self.position + T::SIZE;
        let value = T::read_from_bytes(&self.buffer[self.position..end])
            .map_err(|_| ProtocolError::InvalidData("blittable size mismatch".to_string()))?;
        self.position = end;
        Ok(value)
    }

    /// Read a sequence written by [`NetworkWriter::write_blittable_slice`]
    ///
    /// The element count is validated against the remaining bytes before
    /// anything is allocated.
    ///
    /// [`NetworkWriter::write_blittable_slice`]: crate::core::writer::NetworkWriter::write_blittable_slice
    pub fn read_blittable_vec<T: Blittable>(&mut self) -> Result<Option<Vec<T>>> {
        let start = self.position;
        let Some(count) = self.read_length()? else {
            return Ok(None);
        };

        let needed = count.checked_mul(T::SIZE.max(1)).unwrap_or(usize::MAX);
        if needed > self.remaining() {
            let remaining = self.remaining();
            self.position = start;
            return Err(ProtocolError::EndOfData { needed, remaining });
        }

        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(self.read_blittable::<T>()?);
        }
        Ok(Some(values))
    }

    #[inline]
    fn ensure(&self, needed: usize) -> Result<()> {
        let remaining = self.remaining();
        if needed > remaining {
            return Err(ProtocolError::EndOfData { needed, remaining });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::writer::NetworkWriter;

    #[test]
    fn test_read_bytes_shares_buffer() {
        let data = Bytes::from_static(b"hello world");
        let mut reader = NetworkReader::new(data.clone());
        let hello = reader.read_bytes(5).unwrap();
        assert_eq!(&hello[..], b"hello");
        assert_eq!(reader.remaining(), 6);
        assert_eq!(&reader.remaining_bytes()[..], b" world");
    }

    #[test]
    fn test_end_of_data_leaves_position() {
        let mut reader = NetworkReader::from_slice(&[1, 2, 3]);
        reader.read::<u8>().unwrap();
        assert!(matches!(
            reader.read::<u32>(),
            Err(ProtocolError::EndOfData {
                needed: 4,
                remaining: 2
            })
        ));
        assert_eq!(reader.position(), 1);
    }

    #[test]
    fn test_string_roundtrip() {
        let mut writer = NetworkWriter::new();
        writer.write_str("héllo").unwrap();
        writer.write_string(None).unwrap();
        writer.write_str("").unwrap();

        let mut reader = NetworkReader::new(writer.to_bytes());
        assert_eq!(reader.read_string().unwrap().as_deref(), Some("héllo"));
        assert_eq!(reader.read_string().unwrap(), None);
        assert_eq!(reader.read_string().unwrap().as_deref(), Some(""));
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_negative_length_rejected() {
        let mut reader = NetworkReader::from_slice(&(-2i32).to_le_bytes());
        assert!(matches!(
            reader.read_string(),
            Err(ProtocolError::InvalidLength(-2))
        ));
        assert_eq!(reader.position(), 0);
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut writer = NetworkWriter::new();
        writer.write_bytes_with_length(Some(&[0xC3, 0x28])).unwrap();
        let mut reader = NetworkReader::new(writer.to_bytes());
        assert!(matches!(
            reader.read_string(),
            Err(ProtocolError::InvalidUtf8(_))
        ));
    }

    #[test]
    fn test_blittable_vec_roundtrip() {
        let mut writer = NetworkWriter::new();
        writer
            .write_blittable_slice(Some(&[10u32, 20, 30][..]))
            .unwrap();
        writer.write_blittable_slice::<u32>(None).unwrap();

        let mut reader = NetworkReader::new(writer.to_bytes());
        assert_eq!(
            reader.read_blittable_vec::<u32>().unwrap(),
            Some(vec![10, 20, 30])
        );
        assert_eq!(reader.read_blittable_vec::<u32>().unwrap(), None);
    }

    #[test]
    fn test_blittable_vec_count_checked_before_allocation() {
        let mut writer = NetworkWriter::new();
        writer.write(i32::MAX);
        writer.write(1u32);

        let mut reader = NetworkReader::new(writer.to_bytes());
        assert!(matches!(
            reader.read_blittable_vec::<u64>(),
            Err(ProtocolError::EndOfData { .. })
        ));
        assert_eq!(reader.position(), 0);
    }

    #[test]
    fn test_skip() {
        let mut reader = NetworkReader::from_slice(&[1, 2, 3, 4]);
        reader.skip(3).unwrap();
        assert_eq!(reader.read::<u8>().unwrap(), 4);
        assert!(reader.skip(1).is_err());
    }
}
