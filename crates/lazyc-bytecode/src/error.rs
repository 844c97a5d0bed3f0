//! Bytecode errors

use thiserror::Error;

/// Offset table a [`BytecodeError::BadIndex`] refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    /// Code object offsets
    Code,
    /// Constant construction record offsets
    Const,
    /// String offsets
    String,
    /// Blob offsets
    Blob,
    /// Constant slots of a single code object
    Slot,
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Code => "code",
            Self::Const => "constant",
            Self::String => "string",
            Self::Blob => "blob",
            Self::Slot => "constant slot",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while reading or writing a container
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BytecodeError {
    /// The input stream ended before a fixed-size read completed
    #[error("Unexpected end of input")]
    Truncated,

    /// An offset/length pair escapes the region it must stay in
    #[error("Range {offset}+{len} escapes region of {region_len} bytes")]
    OutOfBounds {
        /// Offset relative to the start of the region
        offset: u64,
        /// Requested length
        len: u64,
        /// Length of the region
        region_len: u64,
    },

    /// A varint ended mid-sequence or exceeded its maximum width
    #[error("Malformed varint")]
    MalformedVarint,

    /// String bytes that are not even loosely decodable as UTF-8
    #[error("Invalid string encoding at byte {offset}")]
    InvalidEncoding {
        /// Offset of the offending byte within the string payload
        offset: usize,
    },

    /// Magic tag mismatch
    #[error("Invalid magic bytes")]
    InvalidMagic,

    /// Unknown version/flags combination, or a reserved field in use
    #[error("Unsupported version {version} (flags {flags:#06x})")]
    UnsupportedVersion {
        /// Declared format version
        version: u16,
        /// Declared flag word
        flags: u16,
    },

    /// Index out of range for its offset table
    #[error("Bad {table} index {index} (table has {len} entries)")]
    BadIndex {
        /// Table the index refers to
        table: Table,
        /// Offending index
        index: u32,
        /// Number of entries in the table
        len: u32,
    },

    /// Reference to a table entry that is reserved or stored as absent
    #[error("Absent {table} entry {index}")]
    Absent {
        /// Table the index refers to
        table: Table,
        /// Offending index
        index: u32,
    },

    /// Unknown opcode byte
    #[error("Invalid opcode: {0:#04x}")]
    InvalidOpcode(u8),

    /// Malformed instruction operand (e.g. too many EXTENDED_ARG prefixes)
    #[error("Invalid operand at code unit {pc}")]
    InvalidOperand {
        /// Code unit index of the instruction
        pc: usize,
    },

    /// A value does not fit the container's fixed-width fields
    #[error("Value too large for container field: {0}")]
    Overflow(&'static str),
}

impl BytecodeError {
    /// Build an [`BytecodeError::OutOfBounds`] from native sizes
    pub fn out_of_bounds(offset: usize, len: usize, region_len: usize) -> Self {
        Self::OutOfBounds {
            offset: offset as u64,
            len: len as u64,
            region_len: region_len as u64,
        }
    }
}

/// Result type for bytecode operations
pub type Result<T> = std::result::Result<T, BytecodeError>;
