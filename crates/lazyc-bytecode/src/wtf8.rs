//! Permissive UTF-8 for string objects
//!
//! Strings are held as UTF-16 code units so that unpaired surrogates survive
//! a round trip. On the wire an unpaired surrogate is written as the 3-byte
//! sequence its code point would have in UTF-8; a valid pair is written as
//! one 4-byte sequence. Decoding also accepts a pair written as two 3-byte
//! sequences.

use crate::error::{BytecodeError, Result};

/// Decode permissive UTF-8 into UTF-16 code units.
///
/// Rejects stray continuation bytes, truncated sequences, overlong forms and
/// code points past U+10FFFF.
pub fn decode(bytes: &[u8]) -> Result<Vec<u16>> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let lead = bytes[i];
        if lead < 0x80 {
            out.push(u16::from(lead));
            i += 1;
            continue;
        }
        let (extra, min, init) = match lead {
            0xC2..=0xDF => (1, 0x80, u32::from(lead & 0x1f)),
            0xE0..=0xEF => (2, 0x800, u32::from(lead & 0x0f)),
            0xF0..=0xF4 => (3, 0x1_0000, u32::from(lead & 0x07)),
            _ => return Err(BytecodeError::InvalidEncoding { offset: i }),
        };
        let end = i + 1 + extra;
        if end > bytes.len() {
            return Err(BytecodeError::InvalidEncoding { offset: i });
        }
        let mut cp = init;
        for (k, &byte) in bytes[i + 1..end].iter().enumerate() {
            if byte & 0xc0 != 0x80 {
                return Err(BytecodeError::InvalidEncoding { offset: i + 1 + k });
            }
            cp = (cp << 6) | u32::from(byte & 0x3f);
        }
        if cp < min || cp > 0x10_FFFF {
            return Err(BytecodeError::InvalidEncoding { offset: i });
        }
        push_code_point(&mut out, cp);
        i = end;
    }
    Ok(out)
}

fn push_code_point(out: &mut Vec<u16>, cp: u32) {
    if cp >= 0x1_0000 {
        let v = cp - 0x1_0000;
        out.push(0xD800 | (v >> 10) as u16);
        out.push(0xDC00 | (v & 0x3ff) as u16);
    } else {
        out.push(cp as u16);
    }
}

/// Encode UTF-16 code units as permissive UTF-8
pub fn encode(units: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(units.len());
    let mut i = 0;
    while i < units.len() {
        let unit = units[i];
        let cp = match (unit, units.get(i + 1)) {
            (0xD800..=0xDBFF, Some(&low @ 0xDC00..=0xDFFF)) => {
                i += 1;
                0x1_0000 + ((u32::from(unit) - 0xD800) << 10) + (u32::from(low) - 0xDC00)
            }
            _ => u32::from(unit),
        };
        push_utf8(&mut out, cp);
        i += 1;
    }
    out
}

fn push_utf8(out: &mut Vec<u8>, cp: u32) {
    match cp {
        0..=0x7f => out.push(cp as u8),
        0x80..=0x7ff => {
            out.push(0xc0 | (cp >> 6) as u8);
            out.push(0x80 | (cp & 0x3f) as u8);
        }
        0x800..=0xffff => {
            out.push(0xe0 | (cp >> 12) as u8);
            out.push(0x80 | ((cp >> 6) & 0x3f) as u8);
            out.push(0x80 | (cp & 0x3f) as u8);
        }
        _ => {
            out.push(0xf0 | (cp >> 18) as u8);
            out.push(0x80 | ((cp >> 12) & 0x3f) as u8);
            out.push(0x80 | ((cp >> 6) & 0x3f) as u8);
            out.push(0x80 | (cp & 0x3f) as u8);
        }
    }
}

/// UTF-16 units of a Rust string
#[inline]
pub fn units_of(s: &str) -> Vec<u16> {
    s.encode_utf16().collect()
}

/// Render code units, replacing unpaired surrogates with U+FFFD
#[inline]
pub fn to_string_lossy(units: &[u16]) -> String {
    String::from_utf16_lossy(units)
}
