//! Constant construction engine and host dispatch loop
//!
//! One dispatch loop serves both host code and construction fragments. The
//! engine keeps an explicit stack of invocation records instead of
//! recursing: `LAZY_LOAD_CONSTANT j` on a pending slot pushes a record that
//! saves the active code, program counter and stack pointer, then swaps in
//! the slot's fragment; `RETURN_CONSTANT j` caches the result in the slot,
//! pops the record and restores the saved state. Nesting depth is bounded
//! by [`LoaderConfig::max_record_depth`], never by the native stack.
//!
//! All frames share one value stack. A fragment owns the window
//! `[saved_sp, saved_sp + stack_size)` of it.

use std::rc::Rc;

use lazyc_bytecode::decode::{Blob, BlobKind};
use lazyc_bytecode::instruction::{self, CommonConstant, Instruction, Opcode};
use lazyc_bytecode::{BlobIndex, BytecodeError, StringIndex};
use num_bigint::BigInt;

use crate::code::{CodeObject, ConstSlot};
use crate::config::LoaderConfig;
use crate::error::{VmError, VmResult};
use crate::hydration::HydrationLevel;
use crate::loader::LoaderInner;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Host,
    Fragment,
}

/// The code currently being executed
struct Active {
    owner: Rc<CodeObject>,
    code: Rc<[u8]>,
    /// First stack index owned by this frame
    base: usize,
    /// One past the last stack index this frame may use
    limit: usize,
    kind: FrameKind,
}

/// Saved state of a constant under construction
struct InvocationRecord {
    owner: Rc<CodeObject>,
    slot: u32,
    saved: Option<Active>,
    saved_pc: usize,
    saved_sp: usize,
    /// Push the result onto the caller's stack on return
    push_result: bool,
}

/// Saved state of an entered host code object
struct HostFrame {
    saved: Option<Active>,
    saved_pc: usize,
    saved_sp: usize,
    record_depth: usize,
}

/// Construction engine and host interpreter
pub struct Interpreter {
    config: LoaderConfig,
    stack: Vec<Value>,
    active: Option<Active>,
    /// Program counter, in code units
    pc: usize,
    records: Vec<InvocationRecord>,
    hosts: Vec<HostFrame>,
}

/// Build the value a leaf load instruction pushes
pub(crate) fn load_value(
    loader: &Rc<LoaderInner>,
    instr: Instruction,
    pc: usize,
) -> VmResult<Value> {
    let container = loader.container();
    let arg = instr.arg;
    let value = match instr.opcode {
        Opcode::MakeString => Value::Str(container.string(StringIndex(arg))?.into()),
        Opcode::MakeInt => Value::Int(BigInt::from(arg)),
        Opcode::MakeLong | Opcode::MakeFloat | Opcode::MakeBytes => {
            let kind = BlobKind::for_opcode(instr.opcode)
                .ok_or_else(|| VmError::invariant("blob opcode without blob kind"))?;
            match container.blob(BlobIndex(arg), kind)? {
                Blob::Long(v) => Value::Int(v),
                Blob::Float(x) => Value::Float(x),
                Blob::Bytes(b) => Value::Bytes(b.into()),
            }
        }
        Opcode::MakeCodeObject => {
            let code = loader.code_object(arg)?;
            code.hydrate_to(HydrationLevel::PartiallyHydrated)?;
            Value::Code(code)
        }
        Opcode::LoadCommonConstant => {
            match CommonConstant::from_arg(arg).ok_or(BytecodeError::InvalidOperand { pc })? {
                CommonConstant::None => Value::None,
                CommonConstant::False => Value::Bool(false),
                CommonConstant::True => Value::Bool(true),
                CommonConstant::Ellipsis => Value::Ellipsis,
            }
        }
        other => {
            return Err(VmError::invariant(format!(
                "{} does not load a value",
                other.name()
            )));
        }
    };
    Ok(value)
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter {
    /// Create an interpreter with default limits
    pub fn new() -> Self {
        Self::with_config(LoaderConfig::default())
    }

    /// Create an interpreter with custom limits
    pub fn with_config(config: LoaderConfig) -> Self {
        Self {
            config,
            stack: Vec::with_capacity(64),
            active: None,
            pc: 0,
            records: Vec::new(),
            hosts: Vec::new(),
        }
    }

    /// Current value-stack pointer
    pub fn stack_pointer(&self) -> usize {
        self.stack.len()
    }

    /// Current program counter, in code units
    pub fn pc(&self) -> usize {
        self.pc
    }

    /// Number of active invocation records
    pub fn record_depth(&self) -> usize {
        self.records.len()
    }

    /// The shared value stack
    pub fn stack(&self) -> &[Value] {
        &self.stack
    }

    /// Materialize constant `slot` of `code` and return it.
    ///
    /// An already materialized slot is returned without running anything.
    /// On success the stack pointer, program counter and record depth are
    /// exactly what they were before the call. On failure every record this
    /// call pushed is discarded and the slots they were building go back to
    /// pending.
    pub fn construct(&mut self, code: &Rc<CodeObject>, slot: u32) -> VmResult<Value> {
        code.hydrate_to(HydrationLevel::PartiallyHydrated)?;
        let record = match code.slot(slot)? {
            ConstSlot::Ready(value) => return Ok(value),
            ConstSlot::UnderConstruction(_) => {
                return Err(VmError::CyclicConstant {
                    code: code.index(),
                    slot,
                });
            }
            ConstSlot::Pending(record) => record,
        };

        let entry_depth = self.records.len();
        let result = self
            .push_record(Rc::clone(code), slot, record, false)
            .and_then(|()| self.execute_records(entry_depth));
        match result {
            Ok(()) => code
                .cached_constant(slot)
                .ok_or_else(|| VmError::invariant(format!("slot {slot} finished without a value"))),
            Err(e) => {
                tracing::debug!(
                    target: "lazyc::construct",
                    code = code.index(),
                    slot,
                    error = %e,
                    "construction failed"
                );
                self.unwind(entry_depth);
                Err(e)
            }
        }
    }

    /// Run `code`'s own bytecode until `RETURN_VALUE` and return its result
    pub fn run(&mut self, code: &Rc<CodeObject>) -> VmResult<Value> {
        self.enter(code)?;
        let host_depth = self.hosts.len() - 1;
        loop {
            match self.step() {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => {}
                Err(e) => {
                    self.abort_to(host_depth);
                    return Err(e);
                }
            }
        }
    }

    /// Make `code` the active host code, starting at its first instruction.
    ///
    /// The previous state is restored when the code executes `RETURN_VALUE`.
    pub fn enter(&mut self, code: &Rc<CodeObject>) -> VmResult<()> {
        code.hydrate_to(HydrationLevel::PartiallyHydrated)?;
        let fields = code
            .fields()
            .ok_or_else(|| VmError::invariant("hydrated code object without fields"))?;
        let sp = self.stack.len();
        let frame = Active {
            owner: Rc::clone(code),
            code: Rc::clone(&fields.code),
            base: sp,
            limit: sp.saturating_add(self.config.max_stack_size),
            kind: FrameKind::Host,
        };
        self.hosts.push(HostFrame {
            saved: self.active.replace(frame),
            saved_pc: std::mem::replace(&mut self.pc, 0),
            saved_sp: sp,
            record_depth: self.records.len(),
        });
        Ok(())
    }

    /// Execute one instruction of the active code.
    ///
    /// Returns the result when host code executes `RETURN_VALUE`.
    pub fn step(&mut self) -> VmResult<Option<Value>> {
        let (owner, instr, next) = {
            let active = self.active()?;
            if self.pc >= instruction::code_units(&active.code) {
                return Err(VmError::invariant(match active.kind {
                    FrameKind::Host => "execution ran past the end of host code",
                    FrameKind::Fragment => "construction fragment has no RETURN_CONSTANT",
                }));
            }
            let (instr, next) = instruction::decode_at(&active.code, self.pc)?;
            (Rc::clone(&active.owner), instr, next)
        };
        let pc = self.pc;
        self.pc = next;

        match instr.opcode {
            Opcode::Nop => {}
            Opcode::PopTop => {
                self.pop()?;
            }
            Opcode::UnaryNegative => {
                let value = self.pop()?;
                self.push(value.negate()?)?;
            }
            Opcode::BuildTuple => {
                let items = self.pop_n(instr.arg as usize)?;
                self.push(Value::Tuple(items.into()))?;
            }
            Opcode::MakeFrozenSet => {
                let items = self.pop_n(instr.arg as usize)?;
                self.push(Value::frozen_set(items))?;
            }
            Opcode::MakeComplex => {
                let im = self.pop()?;
                let re = self.pop()?;
                self.push(Value::complex(&re, &im)?)?;
            }
            Opcode::ReturnValue => return self.return_value().map(Some),
            Opcode::ExtendedArg => return Err(BytecodeError::InvalidOperand { pc }.into()),
            Opcode::LazyLoadConstant => self.lazy_load_constant(instr.arg)?,
            Opcode::ReturnConstant => self.return_constant(instr.arg)?,
            Opcode::MakeString
            | Opcode::MakeInt
            | Opcode::MakeLong
            | Opcode::MakeFloat
            | Opcode::MakeBytes
            | Opcode::MakeCodeObject
            | Opcode::LoadCommonConstant => {
                let loader = owner.loader()?;
                let value = load_value(&loader, instr, pc)?;
                self.push(value)?;
            }
        }
        Ok(None)
    }

    /// `LAZY_LOAD_CONSTANT slot` on the active code's owner.
    ///
    /// A materialized slot is pushed directly. A pending slot gets an
    /// invocation record and its fragment becomes the active code; the value
    /// is pushed when the fragment returns.
    pub fn lazy_load_constant(&mut self, slot: u32) -> VmResult<()> {
        let owner = Rc::clone(&self.active()?.owner);
        match owner.slot(slot)? {
            ConstSlot::Ready(value) => self.push(value),
            ConstSlot::UnderConstruction(_) => Err(VmError::CyclicConstant {
                code: owner.index(),
                slot,
            }),
            ConstSlot::Pending(record) => self.push_record(owner, slot, record, true),
        }
    }

    /// `RETURN_CONSTANT slot`: finish the innermost construction
    pub fn return_constant(&mut self, slot: u32) -> VmResult<()> {
        let building = self
            .records
            .last()
            .map(|record| record.slot)
            .ok_or_else(|| VmError::invariant("RETURN_CONSTANT outside a construction"))?;
        if building != slot {
            return Err(VmError::invariant(format!(
                "RETURN_CONSTANT {slot} while constructing slot {building}"
            )));
        }
        let active = self.active()?;
        if active.kind != FrameKind::Fragment {
            return Err(VmError::invariant("RETURN_CONSTANT in host code"));
        }
        let depth = self.stack.len().saturating_sub(active.base);
        if depth != 1 {
            return Err(VmError::StackImbalance { depth, expected: 1 });
        }
        let value = self.pop()?;
        let Some(record) = self.records.pop() else {
            return Err(VmError::invariant("invocation record vanished"));
        };
        record.owner.finish_construction(slot, value.clone());
        self.active = record.saved;
        self.pc = record.saved_pc;
        self.stack.truncate(record.saved_sp);
        tracing::trace!(
            target: "lazyc::construct",
            code = record.owner.index(),
            slot,
            depth = self.records.len(),
            "record popped"
        );
        if record.push_result {
            self.push(value)?;
        }
        Ok(())
    }

    /// Discard every record and host frame, restoring the idle state
    pub fn abort(&mut self) {
        self.abort_to(0);
        self.unwind(0);
    }

    fn active(&self) -> VmResult<&Active> {
        self.active
            .as_ref()
            .ok_or_else(|| VmError::invariant("no active code"))
    }

    fn push(&mut self, value: Value) -> VmResult<()> {
        let active = self.active()?;
        if self.stack.len() >= active.limit {
            return Err(VmError::StackImbalance {
                depth: self.stack.len() - active.base + 1,
                expected: active.limit - active.base,
            });
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> VmResult<Value> {
        let base = self.active()?.base;
        if self.stack.len() <= base {
            return Err(VmError::StackImbalance {
                depth: 0,
                expected: 1,
            });
        }
        self.stack
            .pop()
            .ok_or(VmError::StackImbalance { depth: 0, expected: 1 })
    }

    fn pop_n(&mut self, n: usize) -> VmResult<Vec<Value>> {
        let base = self.active()?.base;
        let depth = self.stack.len() - base;
        if depth < n {
            return Err(VmError::StackImbalance { depth, expected: n });
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    fn push_record(
        &mut self,
        owner: Rc<CodeObject>,
        slot: u32,
        record: lazyc_bytecode::ConstIndex,
        push_result: bool,
    ) -> VmResult<()> {
        if self.records.len() >= self.config.max_record_depth {
            return Err(VmError::RecordOverflow(self.config.max_record_depth));
        }
        let loader = owner.loader()?;
        let (stack_size, code) = {
            let fragment = loader.container().fragment(record)?;
            (fragment.stack_size as usize, Rc::<[u8]>::from(fragment.code))
        };
        if stack_size > self.config.max_stack_size {
            return Err(VmError::StackImbalance {
                depth: stack_size,
                expected: self.config.max_stack_size,
            });
        }
        owner.begin_construction(slot)?;

        let code_index = owner.index();
        let sp = self.stack.len();
        let frame = Active {
            owner: Rc::clone(&owner),
            code,
            base: sp,
            limit: sp + stack_size,
            kind: FrameKind::Fragment,
        };
        let saved = self.active.replace(frame);
        self.records.push(InvocationRecord {
            owner,
            slot,
            saved,
            saved_pc: self.pc,
            saved_sp: sp,
            push_result,
        });
        self.pc = 0;
        tracing::trace!(
            target: "lazyc::construct",
            code = code_index,
            slot,
            depth = self.records.len(),
            "record pushed"
        );
        Ok(())
    }

    fn execute_records(&mut self, entry_depth: usize) -> VmResult<()> {
        while self.records.len() > entry_depth {
            if self.step()?.is_some() {
                return Err(VmError::invariant("RETURN_VALUE inside a construction"));
            }
        }
        Ok(())
    }

    fn return_value(&mut self) -> VmResult<Value> {
        if self.active()?.kind != FrameKind::Host {
            return Err(VmError::invariant("RETURN_VALUE in a construction fragment"));
        }
        let value = self.pop()?;
        self.leave();
        Ok(value)
    }

    /// Pop the innermost host frame and restore what it saved
    fn leave(&mut self) {
        if let Some(frame) = self.hosts.pop() {
            self.active = frame.saved;
            self.pc = frame.saved_pc;
            self.stack.truncate(frame.saved_sp);
        }
    }

    /// Pop records down to `depth`, returning their slots to pending
    fn unwind(&mut self, depth: usize) {
        while self.records.len() > depth {
            let Some(record) = self.records.pop() else {
                break;
            };
            record.owner.abandon_construction(record.slot);
            self.active = record.saved;
            self.pc = record.saved_pc;
            self.stack.truncate(record.saved_sp);
        }
    }

    fn abort_to(&mut self, host_depth: usize) {
        while self.hosts.len() > host_depth {
            let record_depth = self.hosts.last().map_or(0, |frame| frame.record_depth);
            self.unwind(record_depth);
            self.leave();
        }
    }
}

impl std::fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interpreter")
            .field("pc", &self.pc)
            .field("stack_pointer", &self.stack.len())
            .field("record_depth", &self.records.len())
            .field("host_depth", &self.hosts.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::Loader;
    use lazyc_bytecode::{Assembler, CodeEntry, CodeSpec, ConstValue, ContainerBuilder};

    fn assemble(ops: &[(Opcode, u32)]) -> Vec<u8> {
        let mut asm = Assembler::new();
        for &(op, arg) in ops {
            asm.emit(op, arg);
        }
        asm.into_code()
    }

    #[test]
    fn test_construct_nested_tuple() {
        let spec = CodeSpec::new("f").constant(ConstValue::Tuple(vec![
            ConstValue::int(1),
            ConstValue::Tuple(vec![ConstValue::str("x"), ConstValue::Float(2.0)]),
        ]));
        let mut builder = ContainerBuilder::new();
        let index = builder.add_code_spec(&spec).unwrap();
        let loader = Loader::open(builder.finish().unwrap()).unwrap();
        let code = loader.code_object(index.0).unwrap();

        let mut interp = loader.interpreter();
        let value = interp.construct(&code, 0).unwrap();
        assert_eq!(value.to_string(), "(1, (\"x\", 2.0))");
        assert_eq!(interp.stack_pointer(), 0);
        assert_eq!(interp.record_depth(), 0);
        // Item slots were materialized along the way.
        assert!((0..code.num_constants() as u32).all(|s| code.is_materialized(s)));
    }

    #[test]
    fn test_return_constant_mismatch() {
        let mut builder = ContainerBuilder::new();
        let fragment = builder.add_fragment(
            1,
            assemble(&[(Opcode::MakeInt, 4), (Opcode::ReturnConstant, 1)]),
        );
        let name = builder.add_string("bad");
        builder.add_code(CodeEntry {
            name,
            consts: vec![fragment, fragment],
            ..CodeEntry::default()
        });
        let loader = Loader::open(builder.finish().unwrap()).unwrap();
        let code = loader.code_object(1).unwrap();

        let err = loader.interpreter().construct(&code, 0).unwrap_err();
        assert!(matches!(err, VmError::InvariantViolation(_)));
        assert!(!code.is_materialized(0));
        // Slot 1 is exactly what the fragment names.
        assert_eq!(code.constant(1).unwrap(), Value::int(4));
    }

    #[test]
    fn test_stack_imbalance() {
        let mut builder = ContainerBuilder::new();
        let two = builder.add_fragment(
            2,
            assemble(&[
                (Opcode::MakeInt, 1),
                (Opcode::MakeInt, 2),
                (Opcode::ReturnConstant, 0),
            ]),
        );
        let empty = builder.add_fragment(1, assemble(&[(Opcode::ReturnConstant, 1)]));
        let small = builder.add_fragment(
            1,
            assemble(&[
                (Opcode::MakeInt, 1),
                (Opcode::MakeInt, 2),
                (Opcode::BuildTuple, 2),
                (Opcode::ReturnConstant, 2),
            ]),
        );
        builder.add_code(CodeEntry {
            consts: vec![two, empty, small],
            ..CodeEntry::default()
        });
        let loader = Loader::open(builder.finish().unwrap()).unwrap();
        let code = loader.code_object(1).unwrap();
        let mut interp = loader.interpreter();

        for slot in 0..3 {
            let err = interp.construct(&code, slot).unwrap_err();
            assert!(
                matches!(err, VmError::StackImbalance { .. }),
                "slot {slot}: {err}"
            );
            assert_eq!(interp.stack_pointer(), 0);
            assert_eq!(interp.record_depth(), 0);
        }
    }

    #[test]
    fn test_missing_return_constant() {
        let mut builder = ContainerBuilder::new();
        let fragment = builder.add_fragment(1, assemble(&[(Opcode::MakeInt, 1)]));
        builder.add_code(CodeEntry {
            consts: vec![fragment],
            ..CodeEntry::default()
        });
        let loader = Loader::open(builder.finish().unwrap()).unwrap();
        let code = loader.code_object(1).unwrap();
        let err = loader.interpreter().construct(&code, 0).unwrap_err();
        assert!(matches!(err, VmError::InvariantViolation(_)));
    }

    #[test]
    fn test_record_depth_limit() {
        let spec = CodeSpec::new("deep").constant(ConstValue::Tuple(vec![ConstValue::Tuple(
            vec![ConstValue::Tuple(vec![ConstValue::str("leaf")])],
        )]));
        let mut builder = ContainerBuilder::new();
        let index = builder.add_code_spec(&spec).unwrap();
        let container = std::sync::Arc::new(
            lazyc_bytecode::Container::open(builder.finish().unwrap()).unwrap(),
        );
        let loader = Loader::with_config(container, LoaderConfig::new().max_record_depth(2));
        let code = loader.code_object(index.0).unwrap();
        let err = loader.interpreter().construct(&code, 0).unwrap_err();
        assert_eq!(err, VmError::RecordOverflow(2));
        assert_eq!(code.num_constants(), 4);
        assert!((0..4).all(|slot| !code.is_materialized(slot)));
    }

    #[test]
    fn test_common_constants_and_complex() {
        let spec = CodeSpec::new("f")
            .constant(ConstValue::Ellipsis)
            .constant(ConstValue::Complex { re: 1.5, im: -2.0 })
            .constant(ConstValue::FrozenSet(vec![
                ConstValue::Bool(false),
                ConstValue::None,
            ]));
        let mut builder = ContainerBuilder::new();
        let index = builder.add_code_spec(&spec).unwrap();
        let loader = Loader::open(builder.finish().unwrap()).unwrap();
        let code = loader.code_object(index.0).unwrap();
        let mut interp = loader.interpreter();
        assert_eq!(interp.construct(&code, 0).unwrap(), Value::Ellipsis);
        assert_eq!(
            interp.construct(&code, 1).unwrap(),
            Value::Complex { re: 1.5, im: -2.0 }
        );
        assert_eq!(
            interp.construct(&code, 2).unwrap().to_string(),
            "frozenset({False, None})"
        );
    }

    #[test]
    fn test_declared_stack_size_over_limit() {
        let mut builder = ContainerBuilder::new();
        let outer = builder.add_fragment(
            1,
            assemble(&[(Opcode::LazyLoadConstant, 1), (Opcode::ReturnConstant, 0)]),
        );
        let inner = builder.add_fragment(
            8,
            assemble(&[(Opcode::MakeInt, 1), (Opcode::ReturnConstant, 1)]),
        );
        builder.add_code(CodeEntry {
            consts: vec![outer, inner],
            ..CodeEntry::default()
        });
        let container = std::sync::Arc::new(
            lazyc_bytecode::Container::open(builder.finish().unwrap()).unwrap(),
        );
        let loader = Loader::with_config(container, LoaderConfig::new().max_stack_size(4));
        let code = loader.code_object(1).unwrap();
        let mut interp = loader.interpreter();

        for slot in [1, 0, 0] {
            let err = interp.construct(&code, slot).unwrap_err();
            assert_eq!(err, VmError::StackImbalance { depth: 8, expected: 4 });
            assert_eq!(interp.stack_pointer(), 0);
            assert_eq!(interp.record_depth(), 0);
            assert!(!code.is_materialized(0));
            assert!(!code.is_materialized(1));
        }
    }

    #[test]
    fn test_host_load_after_compile_is_detached() {
        let spec =
            CodeSpec::new("f").code(assemble(&[(Opcode::MakeInt, 5), (Opcode::ReturnValue, 0)]));
        let mut builder = ContainerBuilder::new();
        let index = builder.add_code_spec(&spec).unwrap();
        let loader = Loader::open(builder.finish().unwrap()).unwrap();
        let code = loader.code_object(index.0).unwrap();

        let mut interp = loader.interpreter();
        assert_eq!(interp.run(&code).unwrap(), Value::int(5));

        code.hydrate_to(HydrationLevel::Compiled).unwrap();
        assert!(code.is_detached());
        let err = interp.run(&code).unwrap_err();
        assert_eq!(err, VmError::Detached);
        assert_eq!(err.kind(), crate::ErrorKind::Detached);
        assert_eq!(interp.stack_pointer(), 0);
        assert_eq!(interp.pc(), 0);
        assert_eq!(interp.record_depth(), 0);
    }
}
