//! Little-endian byte writer and reader for the R-tree and metadata tiles.

use crate::rtree::{RTreeError, RTreeResult};

/// Appends little-endian values to a growing buffer.
#[derive(Debug, Default)]
pub struct Serializer {
    buffer: Vec<u8>,
}

impl Serializer {
    pub fn new() -> Self {
        Serializer::default()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buffer
    }
}

/// Reads little-endian values from a borrowed buffer.
///
/// Every read fails with [`RTreeError::Serialization`] instead of panicking
/// when the buffer is too short.
#[derive(Debug)]
pub struct Deserializer<'b> {
    buffer: &'b [u8],
    offset: usize,
}

impl<'b> Deserializer<'b> {
    pub fn new(buffer: &'b [u8]) -> Self {
        Deserializer { buffer, offset: 0 }
    }

    pub fn read_u8(&mut self) -> RTreeResult<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u32(&mut self) -> RTreeResult<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_u64(&mut self) -> RTreeResult<u64> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.read_bytes(8)?);
        Ok(u64::from_le_bytes(bytes))
    }

    pub fn read_bytes(&mut self, len: usize) -> RTreeResult<&'b [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.buffer.len())
            .ok_or_else(|| {
                RTreeError::Serialization(format!(
                    "Unexpected end of buffer: needed {} bytes at offset {} but buffer holds {}",
                    len,
                    self.offset,
                    self.buffer.len()
                ))
            })?;
        let bytes = &self.buffer[self.offset..end];
        self.offset = end;
        Ok(bytes)
    }

    /// Reads a `u64` length and converts it for indexing.
    pub fn read_len(&mut self) -> RTreeResult<usize> {
        let len = self.read_u64()?;
        usize::try_from(len)
            .map_err(|_| RTreeError::Serialization(format!("Length {} does not fit in memory", len)))
    }

    pub fn consumed(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.offset
    }
}
