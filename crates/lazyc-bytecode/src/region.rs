//! Region validator
//!
//! Every offset that comes out of a container is attacker-controlled. All
//! object reads go through [`Region`], which refuses any span that does not
//! lie wholly inside the binary-data region.

use std::ops::Range;

use crate::codec::Reader;
use crate::error::{BytecodeError, Result};

/// Check that `offset..offset + len` fits in a region of `region_len` bytes.
///
/// `offset` is relative to the region start. The sum is computed without
/// overflow.
pub fn check_span(region_len: usize, offset: usize, len: usize) -> Result<Range<usize>> {
    match offset.checked_add(len) {
        Some(end) if end <= region_len => Ok(offset..end),
        _ => Err(BytecodeError::out_of_bounds(offset, len, region_len)),
    }
}

/// The binary-data region of an opened container
#[derive(Debug, Clone, Copy)]
pub struct Region<'a> {
    bytes: &'a [u8],
    base: usize,
}

impl<'a> Region<'a> {
    /// Wrap `bytes`, which start at container offset `base`
    pub fn new(bytes: &'a [u8], base: usize) -> Self {
        Self { bytes, base }
    }

    /// Container offset of the first region byte
    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    /// Region length in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Check if the region holds no bytes
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Translate a container offset into a region-relative position.
    ///
    /// The offset must point strictly inside the region.
    pub fn relative(&self, offset: u32) -> Result<usize> {
        let offset = offset as usize;
        match offset.checked_sub(self.base) {
            Some(rel) if rel < self.bytes.len() => Ok(rel),
            _ => Err(BytecodeError::OutOfBounds {
                offset: offset as u64,
                len: 0,
                region_len: self.bytes.len() as u64,
            }),
        }
    }

    /// Borrow `len` bytes starting at region-relative `rel`
    pub fn span(&self, rel: usize, len: usize) -> Result<&'a [u8]> {
        let range = check_span(self.bytes.len(), rel, len)?;
        Ok(&self.bytes[range])
    }

    /// Borrow `len` bytes starting at container offset `offset`
    pub fn slice(&self, offset: u32, len: usize) -> Result<&'a [u8]> {
        let rel = self.relative(offset)?;
        self.span(rel, len)
    }

    /// A reader over everything from container offset `offset` to the region end
    pub fn reader_at(&self, offset: u32) -> Result<Reader<'a>> {
        let rel = self.relative(offset)?;
        Ok(Reader::new(&self.bytes[rel..]))
    }
}
