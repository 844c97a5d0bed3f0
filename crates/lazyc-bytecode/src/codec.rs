//! Primitive codec
//!
//! Fixed-width little-endian integers, unsigned LEB128 varints, the
//! sign-folded signed varint used by long-int blobs, and length-prefixed
//! byte strings. Nothing here knows about the container layout.
//!
//! Widths:
//! - unsigned varints hold at most 64 bits ([`MAX_VARINT_BYTES`] bytes);
//! - fixed-width signed varints cover the whole `i64` range;
//! - arbitrary-precision signed varints are bounded only by their input.
//!
//! The signed form is `varint(sign_bit | (abs(value) << 1))` with the sign in
//! the low bit. It is not zig-zag: `-1` encodes as `3`, not `1`.

use num_bigint::{BigInt, BigUint, Sign};
use num_traits::Zero;

use crate::error::{BytecodeError, Result};

/// Longest encoding of a 64-bit unsigned varint
pub const MAX_VARINT_BYTES: usize = 10;

/// Longest encoding of a fixed-width signed varint (65 folded bits)
pub const MAX_SVARINT_BYTES: usize = 10;

/// Bounds-checked cursor over a byte slice
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Create a reader positioned at the start of `bytes`
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    /// Current cursor position
    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left after the cursor
    #[inline]
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(BytecodeError::Truncated)?;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or(BytecodeError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    /// Read one byte
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Read a little-endian `u16`
    pub fn read_u2(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    /// Read a little-endian `u32`
    pub fn read_u4(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read an IEEE-754 little-endian double
    pub fn read_f64(&mut self) -> Result<f64> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(f64::from_le_bytes(raw))
    }

    /// Read exactly `n` raw bytes
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    /// Read LEB128 groups into a `u128`, accepting at most `max_bytes` bytes.
    ///
    /// The cursor only moves on success.
    fn read_leb_u128(&mut self, max_bytes: usize) -> Result<u128> {
        let mut result: u128 = 0;
        for i in 0..max_bytes {
            let byte = *self
                .bytes
                .get(self.pos + i)
                .ok_or(BytecodeError::MalformedVarint)?;
            result |= u128::from(byte & 0x7f) << (7 * i);
            if byte & 0x80 == 0 {
                self.pos += i + 1;
                return Ok(result);
            }
        }
        Err(BytecodeError::MalformedVarint)
    }

    /// Read an unsigned LEB128 varint of at most 64 bits
    pub fn read_varint(&mut self) -> Result<u64> {
        let value = self.read_leb_u128(MAX_VARINT_BYTES)?;
        u64::try_from(value).map_err(|_| BytecodeError::MalformedVarint)
    }

    /// Read an unsigned varint that must fit in 32 bits
    pub fn read_varint_u32(&mut self) -> Result<u32> {
        let value = self.read_varint()?;
        u32::try_from(value).map_err(|_| BytecodeError::MalformedVarint)
    }

    /// Read a varint used as a length or count
    pub fn read_varint_usize(&mut self) -> Result<usize> {
        let value = self.read_varint()?;
        usize::try_from(value).map_err(|_| BytecodeError::MalformedVarint)
    }

    /// Read a sign-folded varint into an `i64`
    pub fn read_svarint(&mut self) -> Result<i64> {
        let folded = self.read_leb_u128(MAX_SVARINT_BYTES)?;
        let negative = folded & 1 == 1;
        let magnitude = folded >> 1;
        if negative {
            // Magnitude 0 would be negative zero, which the encoder never emits.
            if magnitude == 0 || magnitude > 1u128 << 63 {
                return Err(BytecodeError::MalformedVarint);
            }
            Ok((-(magnitude as i128)) as i64)
        } else {
            i64::try_from(magnitude).map_err(|_| BytecodeError::MalformedVarint)
        }
    }

    /// Read a sign-folded varint of arbitrary precision
    pub fn read_big_svarint(&mut self) -> Result<BigInt> {
        let mut groups = Vec::new();
        let mut cursor = self.pos;
        loop {
            let byte = *self
                .bytes
                .get(cursor)
                .ok_or(BytecodeError::MalformedVarint)?;
            cursor += 1;
            groups.push(byte & 0x7f);
            if byte & 0x80 == 0 {
                break;
            }
        }
        let negative = groups[0] & 1 == 1;
        let folded =
            BigUint::from_radix_le(&groups, 128).ok_or(BytecodeError::MalformedVarint)?;
        let magnitude = folded >> 1u32;
        if negative && magnitude.is_zero() {
            return Err(BytecodeError::MalformedVarint);
        }
        self.pos = cursor;
        let sign = if negative { Sign::Minus } else { Sign::Plus };
        Ok(BigInt::from_biguint(sign, magnitude))
    }

    /// Read a varint byte count followed by that many bytes
    pub fn read_len_prefixed(&mut self) -> Result<&'a [u8]> {
        let len = self.read_varint_usize()?;
        self.read_bytes(len)
    }
}

/// Append-only byte sink with back-patching for fixed-width slots
#[derive(Debug, Clone, Default)]
pub struct Writer {
    bytes: Vec<u8>,
}

impl Writer {
    /// Create an empty writer
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bytes written so far
    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Check if nothing has been written
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Borrow the written bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Consume the writer
    pub fn into_vec(self) -> Vec<u8> {
        self.bytes
    }

    /// Append one byte
    pub fn write_u8(&mut self, v: u8) {
        self.bytes.push(v);
    }

    /// Append a little-endian `u16`
    pub fn write_u2(&mut self, v: u16) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    /// Append a little-endian `u32`
    pub fn write_u4(&mut self, v: u32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    /// Overwrite a previously written `u32` at `at`
    pub fn patch_u4(&mut self, at: usize, v: u32) -> Result<()> {
        let region_len = self.bytes.len();
        let slot = at
            .checked_add(4)
            .and_then(|end| self.bytes.get_mut(at..end))
            .ok_or_else(|| BytecodeError::out_of_bounds(at, 4, region_len))?;
        slot.copy_from_slice(&v.to_le_bytes());
        Ok(())
    }

    /// Append an IEEE-754 little-endian double
    pub fn write_f64(&mut self, v: f64) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    /// Append raw bytes
    pub fn write_bytes(&mut self, b: &[u8]) {
        self.bytes.extend_from_slice(b);
    }

    /// Pad with zero bytes until the length is a multiple of `align`
    pub fn align_to(&mut self, align: usize) {
        while self.bytes.len() % align != 0 {
            self.bytes.push(0);
        }
    }

    fn write_leb_u128(&mut self, mut value: u128) {
        loop {
            let group = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                self.bytes.push(group);
                return;
            }
            self.bytes.push(group | 0x80);
        }
    }

    /// Append an unsigned LEB128 varint
    pub fn write_varint(&mut self, v: u64) {
        self.write_leb_u128(u128::from(v));
    }

    /// Append a sign-folded varint
    pub fn write_svarint(&mut self, v: i64) {
        let folded = (u128::from(v.unsigned_abs()) << 1) | u128::from(v < 0);
        self.write_leb_u128(folded);
    }

    /// Append a sign-folded varint of arbitrary precision
    pub fn write_big_svarint(&mut self, v: &BigInt) {
        let negative = v.sign() == Sign::Minus;
        let folded = (v.magnitude() << 1u32) | BigUint::from(u8::from(negative));
        if folded.is_zero() {
            self.bytes.push(0);
            return;
        }
        let groups = folded.to_radix_le(128);
        let last = groups.len() - 1;
        for (i, group) in groups.into_iter().enumerate() {
            if i == last {
                self.bytes.push(group);
            } else {
                self.bytes.push(group | 0x80);
            }
        }
    }

    /// Append a varint byte count followed by the bytes
    pub fn write_len_prefixed(&mut self, b: &[u8]) {
        self.write_varint(b.len() as u64);
        self.write_bytes(b);
    }
}
