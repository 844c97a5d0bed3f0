//! Container reader
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! header (16 bytes): magic[4] version:u2 flags:u2 metadata_offset:u4 total_size:u4
//! code table:        n:u4 offsets:u4*n
//! constant table:    n:u4 offsets:u4*n
//! string table:      n:u4 offsets:u4*n
//! blob table:        n:u4 offsets:u4*n
//! binary data:       opaque, referenced only through the tables
//! ```
//!
//! Offsets are measured from the first header byte. Offset `0` means
//! "absent". Any bytes an outer file header places before the container are
//! not part of it.

use serde::{Deserialize, Serialize};

use crate::codec::Reader;
use crate::decode::{self, Blob, BlobKind, CodeRecord, Fragment, TableCounts};
use crate::error::{BytecodeError, Result, Table};
use crate::operand::{BlobIndex, CodeIndex, ConstIndex, StringIndex};
use crate::region::Region;
use crate::{CONTAINER_MAGIC, FORMAT_VERSION, HEADER_SIZE};

/// The fixed 16-byte secondary header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Format version
    pub version: u16,
    /// Flag word; must be 0 for version 1
    pub flags: u16,
    /// Reserved metadata offset; must be 0
    pub metadata_offset: u32,
    /// End of the binary and metadata region, from the header start
    pub total_size: u32,
}

impl Header {
    /// Parse and validate the header
    pub fn parse(reader: &mut Reader<'_>) -> Result<Self> {
        if reader.read_bytes(4)? != CONTAINER_MAGIC {
            return Err(BytecodeError::InvalidMagic);
        }
        let version = reader.read_u2()?;
        let flags = reader.read_u2()?;
        let metadata_offset = reader.read_u4()?;
        let total_size = reader.read_u4()?;
        // Version 1 has no flags and no metadata section.
        if version != FORMAT_VERSION || flags != 0 || metadata_offset != 0 {
            return Err(BytecodeError::UnsupportedVersion { version, flags });
        }
        if (total_size as usize) < HEADER_SIZE {
            return Err(BytecodeError::Truncated);
        }
        Ok(Self {
            version,
            flags,
            metadata_offset,
            total_size,
        })
    }
}

/// Summary numbers for a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStats {
    /// Total container size in bytes
    pub total_size: u32,
    /// Size of the binary-data region
    pub binary_size: u32,
    /// Code object entries (including slot 0)
    pub code_objects: u32,
    /// Constant entries (including slot 0)
    pub constants: u32,
    /// String entries (including slot 0)
    pub strings: u32,
    /// Blob entries (including slot 0)
    pub blobs: u32,
}

/// A validated, indexed container
///
/// Immutable once opened, so it can be shared across threads behind an `Arc`.
#[derive(Debug, Clone)]
pub struct Container {
    bytes: Box<[u8]>,
    header: Header,
    code_offsets: Vec<u32>,
    const_offsets: Vec<u32>,
    string_offsets: Vec<u32>,
    blob_offsets: Vec<u32>,
    region_start: usize,
}

fn read_offsets(reader: &mut Reader<'_>) -> Result<Vec<u32>> {
    let count = reader.read_u4()? as usize;
    if count > reader.remaining() / 4 {
        return Err(BytecodeError::Truncated);
    }
    (0..count).map(|_| reader.read_u4()).collect()
}

impl Container {
    /// Open a container.
    ///
    /// `bytes` starts at the secondary header. Anything past `total_size` is
    /// ignored.
    pub fn open(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let mut bytes = bytes.into();
        let header = Header::parse(&mut Reader::new(&bytes))?;
        let total_size = header.total_size as usize;
        if total_size > bytes.len() {
            return Err(BytecodeError::Truncated);
        }
        bytes.truncate(total_size);

        let mut reader = Reader::new(&bytes);
        reader.read_bytes(HEADER_SIZE)?;
        let code_offsets = read_offsets(&mut reader)?;
        let const_offsets = read_offsets(&mut reader)?;
        let string_offsets = read_offsets(&mut reader)?;
        let blob_offsets = read_offsets(&mut reader)?;
        let region_start = reader.position();

        let container = Self {
            bytes: bytes.into_boxed_slice(),
            header,
            code_offsets,
            const_offsets,
            string_offsets,
            blob_offsets,
            region_start,
        };
        container.validate_offsets()?;

        tracing::debug!(
            target: "lazyc::container",
            total_size,
            binary_size = container.region().len(),
            code_objects = container.code_offsets.len(),
            constants = container.const_offsets.len(),
            strings = container.string_offsets.len(),
            blobs = container.blob_offsets.len(),
            "container opened"
        );
        Ok(container)
    }

    /// Every stored offset must be absent or point inside the binary region
    fn validate_offsets(&self) -> Result<()> {
        let region = self.region();
        for offsets in [
            &self.code_offsets,
            &self.const_offsets,
            &self.string_offsets,
            &self.blob_offsets,
        ] {
            for &offset in offsets.iter().filter(|&&o| o != 0) {
                region.relative(offset)?;
            }
        }
        Ok(())
    }

    /// The parsed header
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// The container bytes, header included
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The binary-data region
    pub fn region(&self) -> Region<'_> {
        Region::new(&self.bytes[self.region_start..], self.region_start)
    }

    /// Entry counts of the four tables
    pub fn counts(&self) -> TableCounts {
        TableCounts {
            code: self.code_offsets.len() as u32,
            consts: self.const_offsets.len() as u32,
            strings: self.string_offsets.len() as u32,
            blobs: self.blob_offsets.len() as u32,
        }
    }

    /// Summary numbers
    pub fn stats(&self) -> ContainerStats {
        let counts = self.counts();
        ContainerStats {
            total_size: self.header.total_size,
            binary_size: self.region().len() as u32,
            code_objects: counts.code,
            constants: counts.consts,
            strings: counts.strings,
            blobs: counts.blobs,
        }
    }

    fn entry(table: Table, offsets: &[u32], index: u32) -> Result<Option<u32>> {
        match offsets.get(index as usize) {
            Some(0) => Ok(None),
            Some(&offset) => Ok(Some(offset)),
            None => Err(BytecodeError::BadIndex {
                table,
                index,
                len: offsets.len() as u32,
            }),
        }
    }

    fn require(table: Table, offsets: &[u32], index: u32) -> Result<u32> {
        Self::entry(table, offsets, index)?.ok_or(BytecodeError::Absent { table, index })
    }

    /// Offset of a code object, `None` when absent
    pub fn code_offset(&self, index: CodeIndex) -> Result<Option<u32>> {
        Self::entry(Table::Code, &self.code_offsets, index.0)
    }

    /// Offset of a construction record, `None` when absent
    pub fn const_offset(&self, index: ConstIndex) -> Result<Option<u32>> {
        Self::entry(Table::Const, &self.const_offsets, index.0)
    }

    /// Offset of a string, `None` when absent
    pub fn string_offset(&self, index: StringIndex) -> Result<Option<u32>> {
        Self::entry(Table::String, &self.string_offsets, index.0)
    }

    /// Offset of a blob, `None` when absent
    pub fn blob_offset(&self, index: BlobIndex) -> Result<Option<u32>> {
        Self::entry(Table::Blob, &self.blob_offsets, index.0)
    }

    /// Decode a code object record
    pub fn code(&self, index: CodeIndex) -> Result<CodeRecord<'_>> {
        let offset = Self::require(Table::Code, &self.code_offsets, index.0)?;
        decode::decode_code(&self.region(), offset, &self.counts())
    }

    /// Decode a construction record
    pub fn fragment(&self, index: ConstIndex) -> Result<Fragment<'_>> {
        let offset = Self::require(Table::Const, &self.const_offsets, index.0)?;
        decode::decode_fragment(&self.region(), offset)
    }

    /// Decode a string that must be present
    pub fn string(&self, index: StringIndex) -> Result<Vec<u16>> {
        let offset = Self::require(Table::String, &self.string_offsets, index.0)?;
        decode::decode_string(&self.region(), offset)
    }

    /// Decode a string, `None` when the index is absent
    pub fn optional_string(&self, index: StringIndex) -> Result<Option<Vec<u16>>> {
        match self.string_offset(index)? {
            Some(offset) => decode::decode_string(&self.region(), offset).map(Some),
            None => Ok(None),
        }
    }

    /// Decode a blob that must be present, as the kind the caller expects
    pub fn blob(&self, index: BlobIndex, kind: BlobKind) -> Result<Blob<'_>> {
        let offset = Self::require(Table::Blob, &self.blob_offsets, index.0)?;
        decode::decode_blob(&self.region(), offset, kind)
    }

    /// Decode a byte-string blob; an absent index is the empty string
    pub fn bytes_or_empty(&self, index: BlobIndex) -> Result<&[u8]> {
        match self.blob_offset(index)? {
            Some(offset) => match decode::decode_blob(&self.region(), offset, BlobKind::Bytes)? {
                Blob::Bytes(b) => Ok(b),
                _ => Ok(&[]),
            },
            None => Ok(&[]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Writer;

    fn header(version: u16, flags: u16, metadata: u32, total: u32) -> Writer {
        let mut w = Writer::new();
        w.write_bytes(&CONTAINER_MAGIC);
        w.write_u2(version);
        w.write_u2(flags);
        w.write_u4(metadata);
        w.write_u4(total);
        w
    }

    fn empty_tables(w: &mut Writer) {
        for _ in 0..4 {
            w.write_u4(0);
        }
    }

    #[test]
    fn test_open_empty() {
        let mut w = header(FORMAT_VERSION, 0, 0, 32);
        empty_tables(&mut w);
        let container = Container::open(w.into_vec()).unwrap();
        assert_eq!(container.counts(), TableCounts::default());
        assert!(container.region().is_empty());
    }

    #[test]
    fn test_invalid_magic() {
        let bytes = b"NOPE\x01\x00\x00\x00\x00\x00\x00\x00\x10\x00\x00\x00".to_vec();
        assert_eq!(Container::open(bytes).unwrap_err(), BytecodeError::InvalidMagic);
    }

    #[test]
    fn test_unsupported_version_and_flags() {
        for (version, flags, metadata) in [(2, 0, 0), (1, 1, 0), (1, 0, 64)] {
            let mut w = header(version, flags, metadata, 32);
            empty_tables(&mut w);
            assert!(matches!(
                Container::open(w.into_vec()),
                Err(BytecodeError::UnsupportedVersion { .. })
            ));
        }
    }

    #[test]
    fn test_total_size_past_input() {
        let mut w = header(FORMAT_VERSION, 0, 0, 40);
        empty_tables(&mut w);
        assert_eq!(Container::open(w.into_vec()).unwrap_err(), BytecodeError::Truncated);
    }

    #[test]
    fn test_offset_outside_region_rejected() {
        // One string whose offset points back into the tables.
        let mut w = header(FORMAT_VERSION, 0, 0, 0);
        w.write_u4(0);
        w.write_u4(0);
        w.write_u4(1);
        w.write_u4(20);
        w.write_u4(0);
        w.write_len_prefixed(b"abc");
        let total = w.len() as u32;
        w.patch_u4(12, total).unwrap();
        assert!(matches!(
            Container::open(w.into_vec()),
            Err(BytecodeError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_lookup_absent_and_bad_index() {
        let mut w = header(FORMAT_VERSION, 0, 0, 0);
        w.write_u4(0);
        w.write_u4(0);
        w.write_u4(2);
        w.write_u4(0);
        w.write_u4(40);
        w.write_u4(0);
        w.write_len_prefixed(b"abc");
        let total = w.len() as u32;
        w.patch_u4(12, total).unwrap();
        let container = Container::open(w.into_vec()).unwrap();

        assert_eq!(container.string_offset(StringIndex(0)).unwrap(), None);
        assert_eq!(container.string(StringIndex(1)).unwrap(), vec![97, 98, 99]);
        assert_eq!(container.optional_string(StringIndex(0)).unwrap(), None);
        assert_eq!(
            container.string(StringIndex(0)),
            Err(BytecodeError::Absent {
                table: Table::String,
                index: 0
            })
        );
        assert_eq!(
            container.string(StringIndex(2)),
            Err(BytecodeError::BadIndex {
                table: Table::String,
                index: 2,
                len: 2
            })
        );
    }
}
