//! Container writer
//!
//! Objects are added in any order and deduplicated by value. [`ContainerBuilder::finish`]
//! writes the header and the four tables with placeholder offsets, appends
//! every object to the binary-data region, then back-patches the tables and
//! `total_size`.

use std::hash::Hash;

use num_bigint::BigInt;
use rustc_hash::FxHashMap;

use crate::codec::Writer;
use crate::error::{BytecodeError, Result};
use crate::operand::{BlobIndex, CodeIndex, ConstIndex, StringIndex};
use crate::wtf8;
use crate::{CONTAINER_MAGIC, FORMAT_VERSION};

/// Deduplicating table whose indices start at 1 (slot 0 is "absent")
#[derive(Debug, Clone)]
struct Interner<T> {
    items: Vec<T>,
    lookup: FxHashMap<T, u32>,
}

impl<T> Default for Interner<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            lookup: FxHashMap::default(),
        }
    }
}

impl<T: Clone + Eq + Hash> Interner<T> {
    fn intern(&mut self, item: T) -> u32 {
        if let Some(&index) = self.lookup.get(&item) {
            return index;
        }
        let index = self.items.len() as u32 + 1;
        self.lookup.insert(item.clone(), index);
        self.items.push(item);
        index
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// A blob as written; floats are keyed by bit pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum BlobEntry {
    Long(BigInt),
    Float(u64),
    Bytes(Vec<u8>),
}

/// A construction record as written
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FragmentEntry {
    /// Value slots the fragment needs
    pub stack_size: u32,
    /// Instruction bytes, ending in `RETURN_CONSTANT`
    pub code: Vec<u8>,
}

/// A code object record as written, with every reference already an index
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct CodeEntry {
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
    /// Name
    pub name: StringIndex,
    /// Qualified name
    pub qualname: StringIndex,
    /// Source file name
    pub filename: StringIndex,
    /// Docstring
    pub docstring: StringIndex,
    /// Exception table bytes
    pub exception_table: BlobIndex,
    /// Line table bytes
    pub line_table: BlobIndex,
    /// Host bytecode (even length)
    pub code: Vec<u8>,
    /// Names referenced by the code
    pub names: Vec<StringIndex>,
    /// Parameter and local variable names
    pub varnames: Vec<StringIndex>,
    /// Free variable names
    pub freevars: Vec<StringIndex>,
    /// Cell variable names
    pub cellvars: Vec<StringIndex>,
    /// Constant slots
    pub consts: Vec<ConstIndex>,
}

/// Builder for creating containers
#[derive(Debug, Clone, Default)]
pub struct ContainerBuilder {
    codes: Interner<CodeEntry>,
    fragments: Interner<FragmentEntry>,
    strings: Interner<Vec<u16>>,
    blobs: Interner<BlobEntry>,
}

impl ContainerBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a string given as UTF-16 code units (lone surrogates allowed)
    pub fn add_string_units(&mut self, units: Vec<u16>) -> StringIndex {
        StringIndex(self.strings.intern(units))
    }

    /// Add a string
    pub fn add_string(&mut self, s: &str) -> StringIndex {
        self.add_string_units(wtf8::units_of(s))
    }

    /// Add a long-integer blob
    pub fn add_long(&mut self, value: BigInt) -> BlobIndex {
        BlobIndex(self.blobs.intern(BlobEntry::Long(value)))
    }

    /// Add a float blob
    pub fn add_float(&mut self, value: f64) -> BlobIndex {
        BlobIndex(self.blobs.intern(BlobEntry::Float(value.to_bits())))
    }

    /// Add a byte-string blob
    pub fn add_bytes(&mut self, value: Vec<u8>) -> BlobIndex {
        BlobIndex(self.blobs.intern(BlobEntry::Bytes(value)))
    }

    /// Add a byte-string blob, using the absent index for empty input
    pub fn add_optional_bytes(&mut self, value: &[u8]) -> BlobIndex {
        if value.is_empty() {
            BlobIndex::ABSENT
        } else {
            self.add_bytes(value.to_vec())
        }
    }

    /// Add a construction record
    pub fn add_fragment(&mut self, stack_size: u32, code: Vec<u8>) -> ConstIndex {
        ConstIndex(self.fragments.intern(FragmentEntry { stack_size, code }))
    }

    /// Add a code object record
    pub fn add_code(&mut self, entry: CodeEntry) -> CodeIndex {
        CodeIndex(self.codes.intern(entry))
    }

    /// Serialize the container
    pub fn finish(self) -> Result<Vec<u8>> {
        let mut out = Writer::new();
        out.write_bytes(&CONTAINER_MAGIC);
        out.write_u2(FORMAT_VERSION);
        out.write_u2(0);
        out.write_u4(0);
        let total_at = out.len();
        out.write_u4(0);

        let code_at = reserve_table(&mut out, self.codes.len())?;
        let const_at = reserve_table(&mut out, self.fragments.len())?;
        let string_at = reserve_table(&mut out, self.strings.len())?;
        let blob_at = reserve_table(&mut out, self.blobs.len())?;
        let binary_start = out.len();

        let mut code_offsets = Vec::with_capacity(self.codes.len());
        for entry in &self.codes.items {
            out.align_to(4);
            code_offsets.push(position(&out)?);
            encode_code(&mut out, entry)?;
        }

        let mut const_offsets = Vec::with_capacity(self.fragments.len());
        for entry in &self.fragments.items {
            out.align_to(4);
            const_offsets.push(position(&out)?);
            encode_fragment(&mut out, entry)?;
        }

        let mut string_offsets = Vec::with_capacity(self.strings.len());
        for units in &self.strings.items {
            string_offsets.push(position(&out)?);
            out.write_len_prefixed(&wtf8::encode(units));
        }

        let mut blob_offsets = Vec::with_capacity(self.blobs.len());
        for blob in &self.blobs.items {
            if let BlobEntry::Float(_) = blob {
                out.align_to(8);
            }
            blob_offsets.push(position(&out)?);
            match blob {
                BlobEntry::Long(v) => out.write_big_svarint(v),
                BlobEntry::Float(bits) => out.write_f64(f64::from_bits(*bits)),
                BlobEntry::Bytes(b) => out.write_len_prefixed(b),
            }
        }

        patch_table(&mut out, code_at, &code_offsets)?;
        patch_table(&mut out, const_at, &const_offsets)?;
        patch_table(&mut out, string_at, &string_offsets)?;
        patch_table(&mut out, blob_at, &blob_offsets)?;
        let total_size = position(&out)?;
        out.patch_u4(total_at, total_size)?;

        tracing::debug!(
            target: "lazyc::container",
            total_size,
            binary_size = out.len() - binary_start,
            code_objects = self.codes.len(),
            constants = self.fragments.len(),
            strings = self.strings.len(),
            blobs = self.blobs.len(),
            "container written"
        );
        Ok(out.into_vec())
    }
}

fn position(out: &Writer) -> Result<u32> {
    u32::try_from(out.len()).map_err(|_| BytecodeError::Overflow("container size"))
}

/// Write a table count (slot 0 included) and zeroed offsets; returns where
/// the offsets start
fn reserve_table(out: &mut Writer, items: usize) -> Result<usize> {
    let count = u32::try_from(items + 1).map_err(|_| BytecodeError::Overflow("table entries"))?;
    out.write_u4(count);
    let at = out.len();
    for _ in 0..count {
        out.write_u4(0);
    }
    Ok(at)
}

/// Fill in offsets for slots `1..`; slot 0 stays absent
fn patch_table(out: &mut Writer, at: usize, offsets: &[u32]) -> Result<()> {
    for (i, &offset) in offsets.iter().enumerate() {
        out.patch_u4(at + 4 * (i + 1), offset)?;
    }
    Ok(())
}

fn code_units(code: &[u8]) -> Result<u32> {
    if code.len() % 2 != 0 {
        return Err(BytecodeError::InvalidOperand { pc: code.len() / 2 });
    }
    u32::try_from(code.len() / 2).map_err(|_| BytecodeError::Overflow("instruction count"))
}

fn encode_fragment(out: &mut Writer, entry: &FragmentEntry) -> Result<()> {
    out.write_u4(entry.stack_size);
    out.write_u4(code_units(&entry.code)?);
    out.write_bytes(&entry.code);
    Ok(())
}

fn encode_code(out: &mut Writer, entry: &CodeEntry) -> Result<()> {
    for field in [
        entry.flags,
        entry.argcount,
        entry.posonlyargcount,
        entry.kwonlyargcount,
        entry.nlocals,
        entry.stacksize,
        entry.firstlineno,
        entry.name.0,
        entry.qualname.0,
        entry.filename.0,
        entry.docstring.0,
        entry.exception_table.0,
        entry.line_table.0,
        code_units(&entry.code)?,
    ] {
        out.write_u4(field);
    }
    out.write_bytes(&entry.code);
    for array in [
        &entry.names,
        &entry.varnames,
        &entry.freevars,
        &entry.cellvars,
    ] {
        out.write_varint(array.len() as u64);
        for index in array {
            out.write_varint(u64::from(index.0));
        }
    }
    out.write_varint(entry.consts.len() as u64);
    for index in &entry.consts {
        out.write_varint(u64::from(index.0));
    }
    Ok(())
}
