//! Binary Framing Buffer
//!
//! Endian-correct cursor over a growable byte region. Every binary input
//! message is assembled through this type before it is handed to a channel.

use bytes::BufMut;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("buffer underflow: needed {needed} bytes, {remaining} remaining")]
    Underflow { needed: usize, remaining: usize },
}

/// Write-then-read byte cursor with big-endian typed accessors.
///
/// Writes append at the end of the region and grow it geometrically.
/// `flip()` freezes the written region and rewinds the read cursor, after
/// which the typed `get_*` accessors consume it front to back.
pub struct ByteBuffer {
    data: Vec<u8>,
    read_pos: usize,
    limit: usize,
}

impl ByteBuffer {
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            read_pos: 0,
            limit: 0,
        }
    }

    /// Reset to an empty write-mode buffer. Capacity is retained.
    pub fn clear(&mut self) {
        self.data.clear();
        self.read_pos = 0;
        self.limit = 0;
    }

    /// Switch from writing to reading: limit := written length, cursor := 0.
    pub fn flip(&mut self) {
        self.limit = self.data.len();
        self.read_pos = 0;
    }

    /// Bytes left to read (only meaningful after `flip`).
    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.read_pos)
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The written region, independent of the read cursor.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn put_u8(&mut self, value: u8) {
        self.data.put_u8(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.data.put_u16(value);
    }

    pub fn put_i16(&mut self, value: i16) {
        self.data.put_i16(value);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.data.put_u32(value);
    }

    pub fn put_u64(&mut self, value: u64) {
        self.data.put_u64(value);
    }

    pub fn put_f32(&mut self, value: f32) {
        self.data.put_f32(value);
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.data.put_slice(bytes);
    }

    fn take(&mut self, needed: usize) -> Result<&[u8], BufferError> {
        if self.remaining() < needed {
            return Err(BufferError::Underflow {
                needed,
                remaining: self.remaining(),
            });
        }
        let start = self.read_pos;
        self.read_pos += needed;
        Ok(&self.data[start..self.read_pos])
    }

    pub fn get_u8(&mut self) -> Result<u8, BufferError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16, BufferError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn get_i16(&mut self) -> Result<i16, BufferError> {
        let b = self.take(2)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    pub fn get_u32(&mut self) -> Result<u32, BufferError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_u64(&mut self) -> Result<u64, BufferError> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn get_f32(&mut self) -> Result<f32, BufferError> {
        let b = self.take(4)?;
        Ok(f32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_bytes(&mut self, len: usize) -> Result<&[u8], BufferError> {
        self.take(len)
    }
}

impl Default for ByteBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_round_trip() {
        let mut buf = ByteBuffer::new();
        buf.put_u8(0x7f);
        buf.put_u16(0xBEEF);
        buf.put_i16(-1234);
        buf.put_u32(0xDEADBEEF);
        buf.put_f32(0.25);
        buf.flip();

        assert_eq!(buf.get_u8().unwrap(), 0x7f);
        assert_eq!(buf.get_u16().unwrap(), 0xBEEF);
        assert_eq!(buf.get_i16().unwrap(), -1234);
        assert_eq!(buf.get_u32().unwrap(), 0xDEADBEEF);
        assert_eq!(buf.get_f32().unwrap(), 0.25);
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    fn big_endian_layout() {
        let mut buf = ByteBuffer::new();
        buf.put_u16(0x0102);
        buf.put_u32(0x03040506);
        assert_eq!(buf.as_slice(), &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
    }

    #[test]
    fn underflow_is_reported() {
        let mut buf = ByteBuffer::new();
        buf.put_u8(1);
        buf.flip();
        buf.get_u8().unwrap();
        assert_eq!(
            buf.get_u16(),
            Err(BufferError::Underflow {
                needed: 2,
                remaining: 0
            })
        );
    }

    #[test]
    fn clear_resets_cursor() {
        let mut buf = ByteBuffer::new();
        buf.put_u32(42);
        buf.flip();
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.remaining(), 0);
    }
}
