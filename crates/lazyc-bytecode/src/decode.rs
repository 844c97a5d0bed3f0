//! Object decoders
//!
//! Decoders take the validated binary region plus a container offset and
//! produce typed values. Every span is checked by [`Region`] before it is
//! touched.

use num_bigint::BigInt;

use crate::codec::Reader;
use crate::error::{BytecodeError, Result, Table};
use crate::instruction::{self, Instruction, Opcode};
use crate::operand::{BlobIndex, ConstIndex, StringIndex};
use crate::region::Region;
use crate::wtf8;

/// Size of the fixed-width prefix of a code object record (14 `u4` fields)
pub const CODE_FIXED_SIZE: usize = 14 * 4;

/// Size of the fixed-width prefix of a construction record
pub const FRAGMENT_HEADER_SIZE: usize = 8;

/// Entry counts of the four offset tables
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableCounts {
    /// Code object table entries
    pub code: u32,
    /// Constant table entries
    pub consts: u32,
    /// String table entries
    pub strings: u32,
    /// Blob table entries
    pub blobs: u32,
}

/// Logical type of a blob, chosen by the instruction that references it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlobKind {
    /// Sign-folded arbitrary-precision integer
    Long,
    /// 8-byte IEEE-754 double
    Float,
    /// Varint-length-prefixed raw bytes
    Bytes,
}

impl BlobKind {
    /// Blob kind an opcode expects, if it references a blob
    pub fn for_opcode(opcode: Opcode) -> Option<Self> {
        match opcode {
            Opcode::MakeLong => Some(Self::Long),
            Opcode::MakeFloat => Some(Self::Float),
            Opcode::MakeBytes => Some(Self::Bytes),
            _ => None,
        }
    }
}

/// A decoded blob
#[derive(Debug, Clone, PartialEq)]
pub enum Blob<'a> {
    /// Long integer
    Long(BigInt),
    /// Float
    Float(f64),
    /// Byte string, borrowed from the region
    Bytes(&'a [u8]),
}

/// Decode a string object: varint byte count, then permissive UTF-8
pub fn decode_string(region: &Region<'_>, offset: u32) -> Result<Vec<u16>> {
    let rel = region.relative(offset)?;
    let mut reader = region.reader_at(offset)?;
    let len = reader.read_varint_usize()?;
    let payload = region.span(rel + reader.position(), len)?;
    wtf8::decode(payload)
}

/// Decode a blob of the kind the caller expects
pub fn decode_blob<'a>(region: &Region<'a>, offset: u32, kind: BlobKind) -> Result<Blob<'a>> {
    match kind {
        BlobKind::Long => {
            let mut reader = region.reader_at(offset)?;
            Ok(Blob::Long(reader.read_big_svarint()?))
        }
        BlobKind::Float => {
            let raw = region.slice(offset, 8)?;
            Ok(Blob::Float(Reader::new(raw).read_f64()?))
        }
        BlobKind::Bytes => {
            let rel = region.relative(offset)?;
            let mut reader = region.reader_at(offset)?;
            let len = reader.read_varint_usize()?;
            Ok(Blob::Bytes(region.span(rel + reader.position(), len)?))
        }
    }
}

/// A constant construction record: stack size plus instruction stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment<'a> {
    /// Value slots the fragment's private stack needs
    pub stack_size: u32,
    /// Number of 2-byte code units
    pub num_instrs: u32,
    /// Raw instruction bytes
    pub code: &'a [u8],
}

impl Fragment<'_> {
    /// Recognize the two-instruction form `[load, RETURN_CONSTANT n]`.
    ///
    /// Such a fragment can be resolved by a direct decode without an
    /// invocation record. Returns the load instruction and `n`.
    pub fn direct_load(&self) -> Option<(Instruction, u32)> {
        let (load, next) = instruction::decode_at(self.code, 0).ok()?;
        let (ret, end) = instruction::decode_at(self.code, next).ok()?;
        if end != instruction::code_units(self.code) || ret.opcode != Opcode::ReturnConstant {
            return None;
        }
        match load.opcode {
            Opcode::MakeString
            | Opcode::MakeInt
            | Opcode::MakeLong
            | Opcode::MakeFloat
            | Opcode::MakeBytes
            | Opcode::MakeCodeObject
            | Opcode::LoadCommonConstant => Some((load, ret.arg)),
            _ => None,
        }
    }
}

/// Decode a construction record header and borrow its instructions
pub fn decode_fragment<'a>(region: &Region<'a>, offset: u32) -> Result<Fragment<'a>> {
    let rel = region.relative(offset)?;
    let mut header = Reader::new(region.span(rel, FRAGMENT_HEADER_SIZE)?);
    let stack_size = header.read_u4()?;
    let num_instrs = header.read_u4()?;
    let code_len = (num_instrs as usize)
        .checked_mul(2)
        .ok_or_else(|| BytecodeError::out_of_bounds(rel, usize::MAX, region.len()))?;
    let code = region.span(rel + FRAGMENT_HEADER_SIZE, code_len)?;
    Ok(Fragment {
        stack_size,
        num_instrs,
        code,
    })
}

/// A code object record as stored in the container (format version 1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeRecord<'a> {
    /// Flag word
    pub flags: u32,
    /// Positional argument count
    pub argcount: u32,
    /// Positional-only argument count
    pub posonlyargcount: u32,
    /// Keyword-only argument count
    pub kwonlyargcount: u32,
    /// Number of local variables
    pub nlocals: u32,
    /// Value stack size of the host code
    pub stacksize: u32,
    /// First source line
    pub firstlineno: u32,
    /// Name (string)
    pub name: StringIndex,
    /// Qualified name (string)
    pub qualname: StringIndex,
    /// Source file name (string)
    pub filename: StringIndex,
    /// Docstring (string, absent when none)
    pub docstring: StringIndex,
    /// Exception table (bytes blob, absent when empty)
    pub exception_table: BlobIndex,
    /// Line table (bytes blob, absent when empty)
    pub line_table: BlobIndex,
    /// Host bytecode
    pub code: &'a [u8],
    /// Names referenced by the code
    pub names: Vec<StringIndex>,
    /// Parameter and local variable names
    pub varnames: Vec<StringIndex>,
    /// Free variable names
    pub freevars: Vec<StringIndex>,
    /// Cell variable names
    pub cellvars: Vec<StringIndex>,
    /// Constant slots, as constant table indices
    pub consts: Vec<ConstIndex>,
}

fn check_index(table: Table, index: u32, len: u32) -> Result<u32> {
    if index < len {
        Ok(index)
    } else {
        Err(BytecodeError::BadIndex { table, index, len })
    }
}

fn read_index_array(
    reader: &mut Reader<'_>,
    rel: usize,
    region_len: usize,
    table: Table,
    len: u32,
) -> Result<Vec<u32>> {
    let count = reader.read_varint_usize()?;
    // Every index takes at least one byte.
    if count > reader.remaining() {
        return Err(BytecodeError::out_of_bounds(
            rel + reader.position(),
            count,
            region_len,
        ));
    }
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let index = reader.read_varint_u32()?;
        out.push(check_index(table, index, len)?);
    }
    Ok(out)
}

/// Decode a code object record, checking every index against `counts`
pub fn decode_code<'a>(
    region: &Region<'a>,
    offset: u32,
    counts: &TableCounts,
) -> Result<CodeRecord<'a>> {
    let rel = region.relative(offset)?;
    let mut fixed = Reader::new(region.span(rel, CODE_FIXED_SIZE)?);
    let mut field = || fixed.read_u4();
    let flags = field()?;
    let argcount = field()?;
    let posonlyargcount = field()?;
    let kwonlyargcount = field()?;
    let nlocals = field()?;
    let stacksize = field()?;
    let firstlineno = field()?;
    let name = field()?;
    let qualname = field()?;
    let filename = field()?;
    let docstring = field()?;
    let exception_table = field()?;
    let line_table = field()?;
    let n_code_units = field()?;

    let string = |index: u32| check_index(Table::String, index, counts.strings).map(StringIndex);
    let blob = |index: u32| check_index(Table::Blob, index, counts.blobs).map(BlobIndex);

    let code_start = rel + CODE_FIXED_SIZE;
    let code_len = (n_code_units as usize)
        .checked_mul(2)
        .ok_or_else(|| BytecodeError::out_of_bounds(code_start, usize::MAX, region.len()))?;
    let code = region.span(code_start, code_len)?;

    let tail_start = code_start + code_len;
    let mut tail = Reader::new(region.span(tail_start, region.len() - tail_start)?);
    let strings = |tail: &mut Reader<'_>| -> Result<Vec<StringIndex>> {
        Ok(
            read_index_array(tail, tail_start, region.len(), Table::String, counts.strings)?
                .into_iter()
                .map(StringIndex)
                .collect(),
        )
    };
    let names = strings(&mut tail)?;
    let varnames = strings(&mut tail)?;
    let freevars = strings(&mut tail)?;
    let cellvars = strings(&mut tail)?;
    let consts = read_index_array(&mut tail, tail_start, region.len(), Table::Const, counts.consts)?
        .into_iter()
        .map(ConstIndex)
        .collect();

    Ok(CodeRecord {
        flags,
        argcount,
        posonlyargcount,
        kwonlyargcount,
        nlocals,
        stacksize,
        firstlineno,
        name: string(name)?,
        qualname: string(qualname)?,
        filename: string(filename)?,
        docstring: string(docstring)?,
        exception_table: blob(exception_table)?,
        line_table: blob(line_table)?,
        code,
        names,
        varnames,
        freevars,
        cellvars,
        consts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Writer;

    fn region_of(w: &Writer) -> Region<'_> {
        Region::new(w.as_slice(), 64)
    }

    #[test]
    fn test_decode_string() {
        let mut w = Writer::new();
        w.write_u8(0xEE);
        w.write_len_prefixed("你好".as_bytes());
        let region = region_of(&w);
        assert_eq!(decode_string(&region, 65).unwrap(), wtf8::units_of("你好"));
    }

    #[test]
    fn test_string_length_escapes_region() {
        let mut w = Writer::new();
        w.write_varint(10);
        w.write_bytes(b"short");
        let region = region_of(&w);
        assert!(matches!(
            decode_string(&region, 64),
            Err(BytecodeError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_decode_blob_kinds() {
        let mut w = Writer::new();
        w.write_big_svarint(&BigInt::from(-123_456_789_012i64));
        let float_at = w.len();
        w.write_f64(3.5);
        let bytes_at = w.len();
        w.write_len_prefixed(b"\x00\x01");
        let region = region_of(&w);

        assert_eq!(
            decode_blob(&region, 64, BlobKind::Long).unwrap(),
            Blob::Long(BigInt::from(-123_456_789_012i64))
        );
        assert_eq!(
            decode_blob(&region, 64 + float_at as u32, BlobKind::Float).unwrap(),
            Blob::Float(3.5)
        );
        assert_eq!(
            decode_blob(&region, 64 + bytes_at as u32, BlobKind::Bytes).unwrap(),
            Blob::Bytes(b"\x00\x01")
        );
        // A float needs 8 bytes; only 3 remain.
        assert!(matches!(
            decode_blob(&region, 64 + bytes_at as u32, BlobKind::Float),
            Err(BytecodeError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_fragment_direct_load() {
        let mut w = Writer::new();
        w.write_u4(1);
        w.write_u4(2);
        w.write_bytes(&[Opcode::MakeFloat.to_byte(), 4, Opcode::ReturnConstant.to_byte(), 9]);
        let region = region_of(&w);
        let fragment = decode_fragment(&region, 64).unwrap();
        assert_eq!(fragment.stack_size, 1);
        assert_eq!(
            fragment.direct_load(),
            Some((Instruction::new(Opcode::MakeFloat, 4), 9))
        );
    }

    #[test]
    fn test_fragment_instruction_count_escapes_region() {
        let mut w = Writer::new();
        w.write_u4(1);
        w.write_u4(u32::MAX);
        let region = region_of(&w);
        assert!(matches!(
            decode_fragment(&region, 64),
            Err(BytecodeError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_code_record_bad_string_index() {
        let mut w = Writer::new();
        for field in 0..14u32 {
            // name (field 7) points past the string table
            w.write_u4(if field == 7 { 5 } else { 0 });
        }
        for _ in 0..5 {
            w.write_varint(0);
        }
        let region = region_of(&w);
        let counts = TableCounts {
            code: 1,
            consts: 1,
            strings: 2,
            blobs: 1,
        };
        assert_eq!(
            decode_code(&region, 64, &counts),
            Err(BytecodeError::BadIndex {
                table: Table::String,
                index: 5,
                len: 2
            })
        );
    }
}
