//! Code objects and their hydration state machine
//!
//! A [`CodeObject`] starts as nothing more than a code-table index. Each
//! [`hydrate_to`](CodeObject::hydrate_to) call moves it forward:
//!
//! - to `PartiallyHydrated` by decoding the record's fields and every string
//!   it names, leaving one pending slot per constant
//! - to `FullyHydrated` by materializing every pending slot, either through
//!   a direct decode or through the construction engine
//! - to `Compiled` by fully hydrating it and every code object reachable
//!   from its constants, then dropping their container references

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use lazyc_bytecode::{BlobIndex, BytecodeError, CodeIndex, ConstIndex, StringIndex, Table, wtf8};
use rustc_hash::FxHashSet;

use crate::error::{VmError, VmResult};
use crate::hydration::HydrationLevel;
use crate::interpreter::{self, Interpreter};
use crate::loader::LoaderInner;
use crate::value::Value;

/// Decoded fields of a code object, independent of the container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeFields {
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
    /// Value stack size for the object's own code
    pub stacksize: u32,
    /// First source line
    pub firstlineno: u32,
    /// Name (empty when absent)
    pub name: Rc<[u16]>,
    /// Qualified name (empty when absent)
    pub qualname: Rc<[u16]>,
    /// Source file name (empty when absent)
    pub filename: Rc<[u16]>,
    /// Docstring
    pub docstring: Option<Rc<[u16]>>,
    /// Instruction bytes
    pub code: Rc<[u8]>,
    /// Names referenced by the code
    pub names: Vec<Rc<[u16]>>,
    /// Parameter and local variable names
    pub varnames: Vec<Rc<[u16]>>,
    /// Free variable names
    pub freevars: Vec<Rc<[u16]>>,
    /// Cell variable names
    pub cellvars: Vec<Rc<[u16]>>,
}

/// State of one constant slot
#[derive(Debug, Clone)]
pub(crate) enum ConstSlot {
    /// Not yet materialized; holds the construction record to run
    Pending(ConstIndex),
    /// An invocation record for this slot is active
    UnderConstruction(ConstIndex),
    /// Materialized
    Ready(Value),
}

#[derive(Default)]
struct CodeState {
    level: HydrationLevel,
    /// `None` once compiled. The loader owns its handles, so the back
    /// reference is weak.
    loader: Option<Weak<LoaderInner>>,
    fields: Option<Rc<CodeFields>>,
    slots: Vec<ConstSlot>,
    exception_table_index: BlobIndex,
    line_table_index: BlobIndex,
    exception_table: Option<Rc<[u8]>>,
    line_table: Option<Rc<[u8]>>,
}

/// A code object handle.
///
/// Handles are shared (`Rc`) and single-threaded; all mutation goes through
/// the hydration methods.
pub struct CodeObject {
    index: u32,
    state: RefCell<CodeState>,
}

impl CodeObject {
    pub(crate) fn new(index: u32, loader: Weak<LoaderInner>) -> Self {
        Self {
            index,
            state: RefCell::new(CodeState {
                loader: Some(loader),
                ..CodeState::default()
            }),
        }
    }

    /// Index in the container's code table
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Current hydration level
    pub fn level(&self) -> HydrationLevel {
        self.state.borrow().level
    }

    /// Whether the container is out of reach: released by compilation, or
    /// the owning loader was dropped
    pub fn is_detached(&self) -> bool {
        self.state
            .borrow()
            .loader
            .as_ref()
            .is_none_or(|loader| loader.strong_count() == 0)
    }

    /// Decoded fields, available from `PartiallyHydrated` on
    pub fn fields(&self) -> Option<Rc<CodeFields>> {
        self.state.borrow().fields.clone()
    }

    /// Name for diagnostics
    pub fn display_name(&self) -> String {
        match self.fields() {
            Some(fields) if !fields.name.is_empty() => wtf8::to_string_lossy(&fields.name),
            _ => format!("#{}", self.index),
        }
    }

    /// Number of constant slots (0 before partial hydration)
    pub fn num_constants(&self) -> usize {
        self.state.borrow().slots.len()
    }

    /// Whether constant `slot` has been materialized
    pub fn is_materialized(&self, slot: u32) -> bool {
        matches!(
            self.state.borrow().slots.get(slot as usize),
            Some(ConstSlot::Ready(_))
        )
    }

    /// The cached value of constant `slot`, without constructing it
    pub fn cached_constant(&self, slot: u32) -> Option<Value> {
        match self.state.borrow().slots.get(slot as usize) {
            Some(ConstSlot::Ready(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Exception table bytes, available from `FullyHydrated` on
    pub fn exception_table(&self) -> Option<Rc<[u8]>> {
        self.state.borrow().exception_table.clone()
    }

    /// Line table bytes, available from `FullyHydrated` on
    pub fn line_table(&self) -> Option<Rc<[u8]>> {
        self.state.borrow().line_table.clone()
    }

    /// Advance to at least `target`.
    ///
    /// A target at or below the current level is a no-op. On failure the
    /// object stays at the last level it fully reached.
    pub fn hydrate_to(self: &Rc<Self>, target: HydrationLevel) -> VmResult<()> {
        if self.level() >= target {
            return Ok(());
        }
        if self.level() < HydrationLevel::PartiallyHydrated {
            self.hydrate_partial()?;
        }
        if target >= HydrationLevel::FullyHydrated && self.level() < HydrationLevel::FullyHydrated
        {
            self.hydrate_full()?;
        }
        if target >= HydrationLevel::Compiled && self.level() < HydrationLevel::Compiled {
            self.compile()?;
        }
        Ok(())
    }

    /// Get constant `slot`, constructing it on first use
    pub fn constant(self: &Rc<Self>, slot: u32) -> VmResult<Value> {
        self.hydrate_to(HydrationLevel::PartiallyHydrated)?;
        if let Some(value) = self.cached_constant(slot) {
            return Ok(value);
        }
        let config = self.loader()?.config().clone();
        Interpreter::with_config(config).construct(self, slot)
    }

    /// All constants in slot order, fully hydrating first
    pub fn constants(self: &Rc<Self>) -> VmResult<Vec<Value>> {
        self.hydrate_to(HydrationLevel::FullyHydrated)?;
        (0..self.num_constants() as u32)
            .map(|slot| {
                self.cached_constant(slot)
                    .ok_or_else(|| VmError::invariant(format!("slot {slot} not materialized")))
            })
            .collect()
    }

    pub(crate) fn loader(&self) -> VmResult<Rc<LoaderInner>> {
        self.state
            .borrow()
            .loader
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or(VmError::Detached)
    }

    pub(crate) fn slot(&self, slot: u32) -> VmResult<ConstSlot> {
        let state = self.state.borrow();
        if state.level < HydrationLevel::PartiallyHydrated {
            return Err(VmError::invariant(format!(
                "code object {} used before hydration",
                self.index
            )));
        }
        state.slots.get(slot as usize).cloned().ok_or_else(|| {
            BytecodeError::BadIndex {
                table: Table::Slot,
                index: slot,
                len: state.slots.len() as u32,
            }
            .into()
        })
    }

    pub(crate) fn begin_construction(&self, slot: u32) -> VmResult<()> {
        let mut state = self.state.borrow_mut();
        let Some(entry) = state.slots.get_mut(slot as usize) else {
            return Err(VmError::invariant(format!("slot {slot} does not exist")));
        };
        match *entry {
            ConstSlot::Pending(record) => {
                *entry = ConstSlot::UnderConstruction(record);
                Ok(())
            }
            ConstSlot::UnderConstruction(_) => Err(VmError::CyclicConstant {
                code: self.index,
                slot,
            }),
            ConstSlot::Ready(_) => Err(VmError::invariant(format!("slot {slot} is already built"))),
        }
    }

    pub(crate) fn finish_construction(&self, slot: u32, value: Value) {
        if let Some(entry) = self.state.borrow_mut().slots.get_mut(slot as usize) {
            *entry = ConstSlot::Ready(value);
        }
    }

    pub(crate) fn abandon_construction(&self, slot: u32) {
        if let Some(entry) = self.state.borrow_mut().slots.get_mut(slot as usize) {
            if let ConstSlot::UnderConstruction(record) = *entry {
                *entry = ConstSlot::Pending(record);
            }
        }
    }

    fn ready_values(&self) -> Vec<Value> {
        self.state
            .borrow()
            .slots
            .iter()
            .filter_map(|slot| match slot {
                ConstSlot::Ready(value) => Some(value.clone()),
                _ => None,
            })
            .collect()
    }

    fn hydrate_partial(&self) -> VmResult<()> {
        let loader = self.loader()?;
        let container = loader.container();
        let record = container.code(CodeIndex(self.index))?;

        let string = |index: StringIndex| -> VmResult<Rc<[u16]>> {
            Ok(container.string(index)?.into())
        };
        let optional = |index: StringIndex| -> VmResult<Option<Rc<[u16]>>> {
            Ok(container.optional_string(index)?.map(Into::into))
        };
        let strings = |indices: &[StringIndex]| -> VmResult<Vec<Rc<[u16]>>> {
            indices.iter().map(|&index| string(index)).collect()
        };

        let fields = CodeFields {
            flags: record.flags,
            argcount: record.argcount,
            posonlyargcount: record.posonlyargcount,
            kwonlyargcount: record.kwonlyargcount,
            nlocals: record.nlocals,
            stacksize: record.stacksize,
            firstlineno: record.firstlineno,
            name: optional(record.name)?.unwrap_or_default(),
            qualname: optional(record.qualname)?.unwrap_or_default(),
            filename: optional(record.filename)?.unwrap_or_default(),
            docstring: optional(record.docstring)?,
            code: record.code.into(),
            names: strings(&record.names)?,
            varnames: strings(&record.varnames)?,
            freevars: strings(&record.freevars)?,
            cellvars: strings(&record.cellvars)?,
        };
        let slots = record.consts.iter().map(|&c| ConstSlot::Pending(c)).collect();

        let mut state = self.state.borrow_mut();
        state.fields = Some(Rc::new(fields));
        state.slots = slots;
        state.exception_table_index = record.exception_table;
        state.line_table_index = record.line_table;
        state.level.advance(HydrationLevel::PartiallyHydrated);
        tracing::debug!(
            target: "lazyc::hydrate",
            code = self.index,
            constants = state.slots.len(),
            level = %state.level,
            "code object hydrated"
        );
        Ok(())
    }

    fn hydrate_full(self: &Rc<Self>) -> VmResult<()> {
        let loader = self.loader()?;
        let mut interpreter = Interpreter::with_config(loader.config().clone());
        for slot in 0..self.num_constants() as u32 {
            let ConstSlot::Pending(record) = self.slot(slot)? else {
                continue;
            };
            if loader.config().direct_decode && self.direct_decode(&loader, slot, record)? {
                continue;
            }
            interpreter.construct(self, slot)?;
        }

        let (exception_index, line_index) = {
            let state = self.state.borrow();
            (state.exception_table_index, state.line_table_index)
        };
        let exception_table: Rc<[u8]> = loader.container().bytes_or_empty(exception_index)?.into();
        let line_table: Rc<[u8]> = loader.container().bytes_or_empty(line_index)?.into();

        let mut state = self.state.borrow_mut();
        state.exception_table = Some(exception_table);
        state.line_table = Some(line_table);
        state.level.advance(HydrationLevel::FullyHydrated);
        tracing::debug!(
            target: "lazyc::hydrate",
            code = self.index,
            level = %state.level,
            "code object hydrated"
        );
        Ok(())
    }

    /// Resolve a two-instruction fragment without an invocation record.
    ///
    /// Returns `false` when the fragment needs the engine.
    fn direct_decode(
        self: &Rc<Self>,
        loader: &Rc<LoaderInner>,
        slot: u32,
        record: ConstIndex,
    ) -> VmResult<bool> {
        let fragment = loader.container().fragment(record)?;
        let Some((load, target)) = fragment.direct_load() else {
            return Ok(false);
        };
        if target != slot || fragment.stack_size < 1 {
            return Ok(false);
        }
        let value = interpreter::load_value(loader, load, 0)?;
        self.finish_construction(slot, value);
        Ok(true)
    }

    /// Fully hydrate this object and every code object reachable through its
    /// constants, then detach them all
    fn compile(self: &Rc<Self>) -> VmResult<()> {
        let mut seen = FxHashSet::default();
        let mut pending = vec![Rc::clone(self)];
        let mut reached = Vec::new();
        while let Some(code) = pending.pop() {
            if code.level() >= HydrationLevel::Compiled || !seen.insert(code.index) {
                continue;
            }
            code.hydrate_to(HydrationLevel::FullyHydrated)?;
            let mut values = code.ready_values();
            while let Some(value) = values.pop() {
                match value {
                    Value::Code(nested) => pending.push(nested),
                    Value::Tuple(items) | Value::FrozenSet(items) => {
                        values.extend(items.iter().cloned())
                    }
                    _ => {}
                }
            }
            reached.push(code);
        }
        for code in &reached {
            code.detach();
        }
        Ok(())
    }

    fn detach(&self) {
        let mut state = self.state.borrow_mut();
        state.loader = None;
        state.level.advance(HydrationLevel::Compiled);
        tracing::debug!(
            target: "lazyc::hydrate",
            code = self.index,
            level = %state.level,
            "code object detached"
        );
    }
}

impl fmt::Debug for CodeObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeObject")
            .field("index", &self.index)
            .field("level", &self.level())
            .field("constants", &self.num_constants())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::Loader;
    use lazyc_bytecode::{CodeSpec, ConstValue, ContainerBuilder};

    fn load(spec: &CodeSpec) -> (Loader, Rc<CodeObject>) {
        let mut builder = ContainerBuilder::new();
        let index = builder.add_code_spec(spec).unwrap();
        let loader = Loader::open(builder.finish().unwrap()).unwrap();
        let code = loader.code_object(index.0).unwrap();
        (loader, code)
    }

    #[test]
    fn test_partial_hydration_decodes_fields() {
        let spec = CodeSpec::new("f")
            .filename("mod.py")
            .argcount(1)
            .varname("x")
            .constant(ConstValue::int(3));
        let (_loader, code) = load(&spec);
        assert_eq!(code.level(), HydrationLevel::Dehydrated);
        assert!(code.fields().is_none());

        code.hydrate_to(HydrationLevel::PartiallyHydrated).unwrap();
        let fields = code.fields().unwrap();
        assert_eq!(fields.argcount, 1);
        assert_eq!(&*fields.filename, wtf8::units_of("mod.py").as_slice());
        assert_eq!(fields.varnames.len(), 1);
        assert!(fields.docstring.is_none());
        assert_eq!(code.num_constants(), 1);
        assert!(!code.is_materialized(0));
        assert_eq!(code.display_name(), "f");
    }

    #[test]
    fn test_constant_is_cached() {
        let spec = CodeSpec::new("f").constant(ConstValue::str("hello"));
        let (_loader, code) = load(&spec);
        let first = code.constant(0).unwrap();
        assert!(code.is_materialized(0));
        assert_eq!(first, Value::str("hello"));
        assert_eq!(code.constant(0).unwrap(), first);
        assert_eq!(code.level(), HydrationLevel::PartiallyHydrated);
    }

    #[test]
    fn test_bad_slot() {
        let (_loader, code) = load(&CodeSpec::new("f"));
        let err = code.constant(4).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::BadIndex);
    }

    #[test]
    fn test_full_hydration_with_and_without_direct_decode() {
        let spec = CodeSpec::new("f")
            .constant(ConstValue::Float(0.5))
            .constant(ConstValue::int(-7))
            .constant(ConstValue::Tuple(vec![ConstValue::None, ConstValue::Bool(true)]));
        let mut builder = ContainerBuilder::new();
        let index = builder.add_code_spec(&spec).unwrap();
        let bytes = builder.finish().unwrap();

        for direct in [true, false] {
            let config = crate::LoaderConfig::new().direct_decode(direct);
            let container = std::sync::Arc::new(lazyc_bytecode::Container::open(bytes.clone()).unwrap());
            let loader = Loader::with_config(container, config);
            let code = loader.code_object(index.0).unwrap();
            let values = code.constants().unwrap();
            assert_eq!(values[0], Value::Float(0.5));
            assert_eq!(values[1], Value::int(-7));
            assert_eq!(
                values[2],
                Value::Tuple(vec![Value::None, Value::Bool(true)].into())
            );
            assert_eq!(code.level(), HydrationLevel::FullyHydrated);
            assert_eq!(code.line_table().as_deref(), Some(&[][..]));
        }
    }

    #[test]
    fn test_debug_output() {
        let (_loader, code) = load(&CodeSpec::new("f"));
        let text = format!("{code:?}");
        assert!(text.contains("Dehydrated"));
    }
}
