//! Compile-side constants and their construction fragments
//!
//! A [`CodeSpec`] describes a code object with its constants as plain
//! values. [`ContainerBuilder::add_code_spec`] turns every constant into a
//! construction fragment: scalars load directly, containers lazily load each
//! item from a slot of their own, and every fragment ends in
//! `RETURN_CONSTANT` with the slot it fills.

use std::collections::VecDeque;

use num_bigint::BigInt;
use rustc_hash::FxHashMap;

use crate::error::{BytecodeError, Result, Table};
use crate::instruction::{Assembler, CommonConstant, Opcode};
use crate::operand::{CodeIndex, ConstIndex, StringIndex};
use crate::writer::{CodeEntry, ContainerBuilder};
use crate::wtf8;

/// A constant value as the compiler sees it
#[derive(Debug, Clone, PartialEq)]
pub enum ConstValue {
    /// `None`
    None,
    /// `True` / `False`
    Bool(bool),
    /// `...`
    Ellipsis,
    /// Integer of any size
    Int(BigInt),
    /// Float
    Float(f64),
    /// Complex number
    Complex {
        /// Real part
        re: f64,
        /// Imaginary part
        im: f64,
    },
    /// String as UTF-16 code units
    Str(Vec<u16>),
    /// Byte string
    Bytes(Vec<u8>),
    /// Tuple
    Tuple(Vec<ConstValue>),
    /// Frozen set
    FrozenSet(Vec<ConstValue>),
    /// Nested code object
    Code(Box<CodeSpec>),
}

impl ConstValue {
    /// String constant from UTF-8 text
    pub fn str(s: &str) -> Self {
        Self::Str(wtf8::units_of(s))
    }

    /// Integer constant
    pub fn int(v: impl Into<BigInt>) -> Self {
        Self::Int(v.into())
    }

    /// Identity used for slot sharing: floats compare by bit pattern, so
    /// `0.0` and `-0.0` stay distinct and `NaN` matches itself.
    pub fn same(&self, other: &Self) -> bool {
        let mut pending = vec![(self, other)];
        while let Some((a, b)) = pending.pop() {
            let same = match (a, b) {
                (Self::Float(x), Self::Float(y)) => x.to_bits() == y.to_bits(),
                (Self::Complex { re: r1, im: i1 }, Self::Complex { re: r2, im: i2 }) => {
                    r1.to_bits() == r2.to_bits() && i1.to_bits() == i2.to_bits()
                }
                (Self::Tuple(x), Self::Tuple(y)) | (Self::FrozenSet(x), Self::FrozenSet(y)) => {
                    pending.extend(x.iter().zip(y));
                    x.len() == y.len()
                }
                _ => a == b,
            };
            if !same {
                return false;
            }
        }
        true
    }
}

/// A code object with plain-value fields, ready to be written
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CodeSpec {
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
    pub name: String,
    /// Qualified name
    pub qualname: String,
    /// Source file name
    pub filename: String,
    /// Docstring
    pub docstring: Option<String>,
    /// Exception table bytes
    pub exception_table: Vec<u8>,
    /// Line table bytes
    pub line_table: Vec<u8>,
    /// Host bytecode
    pub code: Vec<u8>,
    /// Names referenced by the code
    pub names: Vec<String>,
    /// Parameter and local variable names
    pub varnames: Vec<String>,
    /// Free variable names
    pub freevars: Vec<String>,
    /// Cell variable names
    pub cellvars: Vec<String>,
    /// Constants; slot `i` holds `consts[i]`
    pub consts: Vec<ConstValue>,
}

impl CodeSpec {
    /// Create a spec with a name (qualname defaults to the same)
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            qualname: name.clone(),
            name,
            ..Self::default()
        }
    }

    /// Set the source file name
    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = filename.into();
        self
    }

    /// Set the docstring
    pub fn docstring(mut self, doc: impl Into<String>) -> Self {
        self.docstring = Some(doc.into());
        self
    }

    /// Set the host bytecode
    pub fn code(mut self, code: Vec<u8>) -> Self {
        self.code = code;
        self
    }

    /// Set the argument count
    pub fn argcount(mut self, count: u32) -> Self {
        self.argcount = count;
        self
    }

    /// Add a local variable name
    pub fn varname(mut self, name: impl Into<String>) -> Self {
        self.varnames.push(name.into());
        self.nlocals = self.varnames.len() as u32;
        self
    }

    /// Add a referenced name
    pub fn name_ref(mut self, name: impl Into<String>) -> Self {
        self.names.push(name.into());
        self
    }

    /// Add a constant; returns the builder
    pub fn constant(mut self, value: ConstValue) -> Self {
        self.consts.push(value);
        self
    }
}

/// Constant slots of one code object while its fragments are generated
struct SlotTable<'v> {
    values: Vec<&'v ConstValue>,
    records: Vec<ConstIndex>,
    /// Slots whose fragment is not written yet
    pending: VecDeque<u32>,
}

impl<'v> SlotTable<'v> {
    fn new(top_level: &'v [ConstValue]) -> Self {
        Self {
            values: top_level.iter().collect(),
            records: vec![ConstIndex::ABSENT; top_level.len()],
            pending: (0..top_level.len() as u32).collect(),
        }
    }

    /// The slot holding `item`, allocating one if no equal value has a slot
    fn slot_for(&mut self, item: &'v ConstValue) -> u32 {
        if let Some(existing) = self.values.iter().position(|v| v.same(item)) {
            return existing as u32;
        }
        let slot = self.values.len() as u32;
        self.values.push(item);
        self.records.push(ConstIndex::ABSENT);
        self.pending.push_back(slot);
        slot
    }
}

/// Code specs reachable from `spec`'s constants, in first-seen order
fn nested_code(spec: &CodeSpec) -> Vec<&CodeSpec> {
    let mut found = Vec::new();
    let mut pending: Vec<&ConstValue> = spec.consts.iter().rev().collect();
    while let Some(value) = pending.pop() {
        match value {
            ConstValue::Code(code) => found.push(&**code),
            ConstValue::Tuple(items) | ConstValue::FrozenSet(items) => {
                pending.extend(items.iter().rev())
            }
            _ => {}
        }
    }
    found
}

/// Code indices of the specs written so far, keyed by address
type WrittenCode = FxHashMap<*const CodeSpec, CodeIndex>;

impl ContainerBuilder {
    /// Add a code object together with its constants and nested code.
    ///
    /// Slots `0..consts.len()` hold the declared constants in order; items of
    /// tuples and frozen sets get slots after those, shared when equal.
    /// Nested code objects are written before the code that loads them.
    /// Neither tuple nor code nesting recurses on the native stack.
    pub fn add_code_spec(&mut self, spec: &CodeSpec) -> Result<CodeIndex> {
        let mut written = WrittenCode::default();
        let mut stack: Vec<(&CodeSpec, bool)> = vec![(spec, false)];
        while let Some((current, children_done)) = stack.pop() {
            let key = std::ptr::from_ref(current);
            if written.contains_key(&key) {
                continue;
            }
            if children_done {
                let index = self.add_code_from_spec(current, &written)?;
                written.insert(key, index);
            } else {
                stack.push((current, true));
                stack.extend(nested_code(current).into_iter().rev().map(|c| (c, false)));
            }
        }
        written
            .get(&std::ptr::from_ref(spec))
            .copied()
            .ok_or(BytecodeError::Absent {
                table: Table::Code,
                index: 0,
            })
    }

    fn add_code_from_spec(&mut self, spec: &CodeSpec, written: &WrittenCode) -> Result<CodeIndex> {
        let mut slots = SlotTable::new(&spec.consts);
        while let Some(slot) = slots.pending.pop_front() {
            let value = slots.values[slot as usize];
            let mut asm = Assembler::new();
            self.generate(&mut asm, &mut slots, written, value)?;
            asm.emit(Opcode::ReturnConstant, slot);
            let stack_size = asm.max_depth();
            slots.records[slot as usize] = self.add_fragment(stack_size, asm.into_code());
        }

        let mut strings = |names: &[String]| -> Vec<StringIndex> {
            names.iter().map(|n| self.add_string(n)).collect()
        };
        let names = strings(&spec.names);
        let varnames = strings(&spec.varnames);
        let freevars = strings(&spec.freevars);
        let cellvars = strings(&spec.cellvars);

        let entry = CodeEntry {
            flags: spec.flags,
            argcount: spec.argcount,
            posonlyargcount: spec.posonlyargcount,
            kwonlyargcount: spec.kwonlyargcount,
            nlocals: spec.nlocals,
            stacksize: spec.stacksize,
            firstlineno: spec.firstlineno,
            name: self.add_string(&spec.name),
            qualname: self.add_string(&spec.qualname),
            filename: self.add_string(&spec.filename),
            docstring: match &spec.docstring {
                Some(doc) => self.add_string(doc),
                None => StringIndex::ABSENT,
            },
            exception_table: self.add_optional_bytes(&spec.exception_table),
            line_table: self.add_optional_bytes(&spec.line_table),
            code: spec.code.clone(),
            names,
            varnames,
            freevars,
            cellvars,
            consts: slots.records,
        };
        Ok(self.add_code(entry))
    }

    /// Emit the loads for one slot's value. Items of aggregates are only
    /// given slots here; their fragments are written when the slot comes up.
    fn generate<'v>(
        &mut self,
        asm: &mut Assembler,
        slots: &mut SlotTable<'v>,
        written: &WrittenCode,
        value: &'v ConstValue,
    ) -> Result<()> {
        match value {
            ConstValue::None => {
                asm.emit(Opcode::LoadCommonConstant, CommonConstant::None as u32);
            }
            ConstValue::Bool(b) => {
                let common = if *b {
                    CommonConstant::True
                } else {
                    CommonConstant::False
                };
                asm.emit(Opcode::LoadCommonConstant, common as u32);
            }
            ConstValue::Ellipsis => {
                asm.emit(Opcode::LoadCommonConstant, CommonConstant::Ellipsis as u32);
            }
            ConstValue::Int(v) => {
                if !asm.emit_small_int(v) {
                    let blob = self.add_long(v.clone());
                    asm.emit(Opcode::MakeLong, blob.0);
                }
            }
            ConstValue::Float(x) => {
                let blob = self.add_float(*x);
                asm.emit(Opcode::MakeFloat, blob.0);
            }
            ConstValue::Complex { re, im } => {
                let re = self.add_float(*re);
                let im = self.add_float(*im);
                asm.emit(Opcode::MakeFloat, re.0)
                    .emit(Opcode::MakeFloat, im.0)
                    .emit(Opcode::MakeComplex, 0);
            }
            ConstValue::Str(units) => {
                let index = self.add_string_units(units.clone());
                asm.emit(Opcode::MakeString, index.0);
            }
            ConstValue::Bytes(b) => {
                let blob = self.add_bytes(b.clone());
                asm.emit(Opcode::MakeBytes, blob.0);
            }
            ConstValue::Tuple(items) | ConstValue::FrozenSet(items) => {
                for item in items {
                    let slot = slots.slot_for(item);
                    asm.emit(Opcode::LazyLoadConstant, slot);
                }
                let build = if matches!(value, ConstValue::Tuple(_)) {
                    Opcode::BuildTuple
                } else {
                    Opcode::MakeFrozenSet
                };
                asm.emit(build, items.len() as u32);
            }
            ConstValue::Code(spec) => {
                let index = written
                    .get(&std::ptr::from_ref(&**spec))
                    .copied()
                    .ok_or(BytecodeError::Absent {
                        table: Table::Code,
                        index: 0,
                    })?;
                asm.emit(Opcode::MakeCodeObject, index.0);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::Container;
    use crate::instruction::{Instruction, instructions};

    fn fragment_ops(container: &Container, index: ConstIndex) -> Vec<Instruction> {
        let fragment = container.fragment(index).unwrap();
        instructions(fragment.code)
            .map(|r| r.unwrap().1)
            .collect()
    }

    #[test]
    fn test_scalar_fragments() {
        let spec = CodeSpec::new("f")
            .constant(ConstValue::None)
            .constant(ConstValue::int(1000))
            .constant(ConstValue::int(-1))
            .constant(ConstValue::int(BigInt::from(1u64 << 40)))
            .constant(ConstValue::str("hi"));
        let mut builder = ContainerBuilder::new();
        let code = builder.add_code_spec(&spec).unwrap();
        let container = Container::open(builder.finish().unwrap()).unwrap();
        let record = container.code(code).unwrap();
        assert_eq!(record.consts.len(), 5);

        assert_eq!(
            fragment_ops(&container, record.consts[0]),
            vec![
                Instruction::new(Opcode::LoadCommonConstant, 0),
                Instruction::new(Opcode::ReturnConstant, 0),
            ]
        );
        assert_eq!(
            fragment_ops(&container, record.consts[1]),
            vec![
                Instruction::new(Opcode::MakeInt, 1000),
                Instruction::new(Opcode::ReturnConstant, 1),
            ]
        );
        assert_eq!(
            fragment_ops(&container, record.consts[2]),
            vec![
                Instruction::new(Opcode::MakeInt, 1),
                Instruction::new(Opcode::UnaryNegative, 0),
                Instruction::new(Opcode::ReturnConstant, 2),
            ]
        );
        assert_eq!(
            fragment_ops(&container, record.consts[3])[0].opcode,
            Opcode::MakeLong
        );
        assert_eq!(
            fragment_ops(&container, record.consts[4])[0].opcode,
            Opcode::MakeString
        );
    }

    #[test]
    fn test_tuple_items_get_shared_slots() {
        let spec = CodeSpec::new("f")
            .constant(ConstValue::int(7))
            .constant(ConstValue::Tuple(vec![
                ConstValue::int(7),
                ConstValue::str("a"),
                ConstValue::str("a"),
            ]));
        let mut builder = ContainerBuilder::new();
        let code = builder.add_code_spec(&spec).unwrap();
        let container = Container::open(builder.finish().unwrap()).unwrap();
        let record = container.code(code).unwrap();

        // Slot 0 reused for the 7, one new slot for "a".
        assert_eq!(record.consts.len(), 3);
        assert_eq!(
            fragment_ops(&container, record.consts[1]),
            vec![
                Instruction::new(Opcode::LazyLoadConstant, 0),
                Instruction::new(Opcode::LazyLoadConstant, 2),
                Instruction::new(Opcode::LazyLoadConstant, 2),
                Instruction::new(Opcode::BuildTuple, 3),
                Instruction::new(Opcode::ReturnConstant, 1),
            ]
        );
        assert_eq!(container.fragment(record.consts[1]).unwrap().stack_size, 3);
    }

    #[test]
    fn test_float_identity() {
        assert!(ConstValue::Float(f64::NAN).same(&ConstValue::Float(f64::NAN)));
        assert!(!ConstValue::Float(0.0).same(&ConstValue::Float(-0.0)));
        assert!(!ConstValue::int(1).same(&ConstValue::Bool(true)));
    }

    #[test]
    fn test_nested_code_object() {
        let inner = CodeSpec::new("inner").constant(ConstValue::Float(0.5));
        let outer = CodeSpec::new("outer")
            .docstring("doc")
            .constant(ConstValue::Code(Box::new(inner)));
        let mut builder = ContainerBuilder::new();
        let code = builder.add_code_spec(&outer).unwrap();
        let container = Container::open(builder.finish().unwrap()).unwrap();
        let record = container.code(code).unwrap();
        let ops = fragment_ops(&container, record.consts[0]);
        assert_eq!(ops[0].opcode, Opcode::MakeCodeObject);
        let inner = container.code(CodeIndex(ops[0].arg)).unwrap();
        assert_eq!(container.string(inner.name).unwrap(), wtf8::units_of("inner"));
        assert!(!record.docstring.is_absent());
    }

    #[test]
    fn test_deep_nesting() {
        let mut value = ConstValue::str("leaf");
        for _ in 0..256 {
            value = ConstValue::Tuple(vec![value]);
        }
        let mut spec = CodeSpec::new("innermost");
        for level in 0..200 {
            spec = CodeSpec::new(format!("level{level}"))
                .constant(ConstValue::Code(Box::new(spec)));
        }
        let spec = spec.constant(value);

        let mut builder = ContainerBuilder::new();
        let code = builder.add_code_spec(&spec).unwrap();
        let container = Container::open(builder.finish().unwrap()).unwrap();
        let record = container.code(code).unwrap();

        // Two declared slots, 255 inner tuple levels and the leaf.
        assert_eq!(record.consts.len(), 258);
        for slot in 1..=256u32 {
            assert_eq!(
                fragment_ops(&container, record.consts[slot as usize]),
                vec![
                    Instruction::new(Opcode::LazyLoadConstant, slot + 1),
                    Instruction::new(Opcode::BuildTuple, 1),
                    Instruction::new(Opcode::ReturnConstant, slot),
                ]
            );
        }
        assert_eq!(
            fragment_ops(&container, record.consts[257])[0].opcode,
            Opcode::MakeString
        );

        // Nested code is written before the code that loads it.
        let mut current = code;
        for _ in 0..200 {
            let record = container.code(current).unwrap();
            let ops = fragment_ops(&container, record.consts[0]);
            assert_eq!(ops[0].opcode, Opcode::MakeCodeObject);
            assert!(ops[0].arg < current.0);
            current = CodeIndex(ops[0].arg);
        }
        let innermost = container.code(current).unwrap();
        assert_eq!(
            container.string(innermost.name).unwrap(),
            wtf8::units_of("innermost")
        );
        assert!(innermost.consts.is_empty());
    }

    #[test]
    fn test_shared_nested_code_written_once() {
        let helper =
            ConstValue::Code(Box::new(CodeSpec::new("helper").constant(ConstValue::int(3))));
        let spec = CodeSpec::new("module")
            .constant(helper.clone())
            .constant(ConstValue::Tuple(vec![helper, ConstValue::None]));
        let mut builder = ContainerBuilder::new();
        let code = builder.add_code_spec(&spec).unwrap();
        let container = Container::open(builder.finish().unwrap()).unwrap();
        assert_eq!(container.counts().code, 3);
        assert_eq!(code, CodeIndex(2));

        let record = container.code(code).unwrap();
        assert_eq!(
            fragment_ops(&container, record.consts[1]),
            vec![
                Instruction::new(Opcode::LazyLoadConstant, 0),
                Instruction::new(Opcode::LazyLoadConstant, 2),
                Instruction::new(Opcode::BuildTuple, 2),
                Instruction::new(Opcode::ReturnConstant, 1),
            ]
        );
    }
}
