//! Instruction set shared by host code and constant construction fragments
//!
//! Instructions are 2-byte units: opcode then an 8-bit argument. Wider
//! arguments are built from up to three `EXTENDED_ARG` prefixes, most
//! significant byte first.

use num_bigint::BigInt;

use crate::error::{BytecodeError, Result};

/// Most `EXTENDED_ARG` prefixes one instruction may carry (32-bit argument)
pub const MAX_EXTENDED_ARGS: usize = 3;

/// Bytecode opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    // ==================== Host ====================
    /// Do nothing
    Nop = 0x00,
    /// Discard the top of stack
    PopTop = 0x01,
    /// Negate the top of stack: tos = -tos
    UnaryNegative = 0x02,
    /// Pop `arg` values and push them as a tuple
    BuildTuple = 0x03,
    /// Return the top of stack from host code
    ReturnValue = 0x04,
    /// Prefix: shift the next argument left by 8 bits
    ExtendedArg = 0x90,

    // ==================== Lazy constants ====================
    /// Push constant slot `arg`, constructing it on first use
    LazyLoadConstant = 0xA0,
    /// Push string `arg`
    MakeString = 0xA1,
    /// Push the small integer `arg`
    MakeInt = 0xA2,
    /// Push blob `arg` decoded as a long integer
    MakeLong = 0xA3,
    /// Push blob `arg` decoded as a float
    MakeFloat = 0xA4,
    /// Pop imaginary and real parts and push a complex number
    MakeComplex = 0xA5,
    /// Pop `arg` values and push them as a frozen set
    MakeFrozenSet = 0xA6,
    /// Push code object `arg`, partially hydrated
    MakeCodeObject = 0xA7,
    /// Push blob `arg` decoded as a byte string
    MakeBytes = 0xA8,
    /// Push a common constant (see [`CommonConstant`])
    LoadCommonConstant = 0xA9,
    /// Finish constructing slot `arg` with the top of stack
    ReturnConstant = 0xAA,
}

impl Opcode {
    /// Convert from raw byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Nop),
            0x01 => Some(Self::PopTop),
            0x02 => Some(Self::UnaryNegative),
            0x03 => Some(Self::BuildTuple),
            0x04 => Some(Self::ReturnValue),
            0x90 => Some(Self::ExtendedArg),

            0xA0 => Some(Self::LazyLoadConstant),
            0xA1 => Some(Self::MakeString),
            0xA2 => Some(Self::MakeInt),
            0xA3 => Some(Self::MakeLong),
            0xA4 => Some(Self::MakeFloat),
            0xA5 => Some(Self::MakeComplex),
            0xA6 => Some(Self::MakeFrozenSet),
            0xA7 => Some(Self::MakeCodeObject),
            0xA8 => Some(Self::MakeBytes),
            0xA9 => Some(Self::LoadCommonConstant),
            0xAA => Some(Self::ReturnConstant),
            _ => None,
        }
    }

    /// Convert to raw byte
    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Get the name of this opcode
    pub const fn name(self) -> &'static str {
        match self {
            Self::Nop => "NOP",
            Self::PopTop => "POP_TOP",
            Self::UnaryNegative => "UNARY_NEGATIVE",
            Self::BuildTuple => "BUILD_TUPLE",
            Self::ReturnValue => "RETURN_VALUE",
            Self::ExtendedArg => "EXTENDED_ARG",
            Self::LazyLoadConstant => "LAZY_LOAD_CONSTANT",
            Self::MakeString => "MAKE_STRING",
            Self::MakeInt => "MAKE_INT",
            Self::MakeLong => "MAKE_LONG",
            Self::MakeFloat => "MAKE_FLOAT",
            Self::MakeComplex => "MAKE_COMPLEX",
            Self::MakeFrozenSet => "MAKE_FROZEN_SET",
            Self::MakeCodeObject => "MAKE_CODE_OBJECT",
            Self::MakeBytes => "MAKE_BYTES",
            Self::LoadCommonConstant => "LOAD_COMMON_CONSTANT",
            Self::ReturnConstant => "RETURN_CONSTANT",
        }
    }

    /// Whether the argument byte means anything for this opcode
    pub const fn has_arg(self) -> bool {
        !matches!(
            self,
            Self::Nop | Self::PopTop | Self::UnaryNegative | Self::ReturnValue | Self::MakeComplex
        )
    }

    /// Net change in stack depth when executed with `arg`
    pub fn stack_effect(self, arg: u32) -> i64 {
        match self {
            Self::Nop | Self::UnaryNegative | Self::ExtendedArg => 0,
            Self::PopTop | Self::ReturnValue | Self::ReturnConstant | Self::MakeComplex => -1,
            Self::BuildTuple | Self::MakeFrozenSet => 1 - i64::from(arg),
            Self::LazyLoadConstant
            | Self::MakeString
            | Self::MakeInt
            | Self::MakeLong
            | Self::MakeFloat
            | Self::MakeCodeObject
            | Self::MakeBytes
            | Self::LoadCommonConstant => 1,
        }
    }
}

/// Singleton constants reachable through `LOAD_COMMON_CONSTANT`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommonConstant {
    /// `None`
    None = 0,
    /// `False`
    False = 1,
    /// `True`
    True = 2,
    /// `...`
    Ellipsis = 3,
}

impl CommonConstant {
    /// Decode an instruction argument
    pub fn from_arg(arg: u32) -> Option<Self> {
        match arg {
            0 => Some(Self::None),
            1 => Some(Self::False),
            2 => Some(Self::True),
            3 => Some(Self::Ellipsis),
            _ => None,
        }
    }
}

/// A decoded instruction with its EXTENDED_ARG prefixes folded in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    /// Operation
    pub opcode: Opcode,
    /// Full argument
    pub arg: u32,
}

impl Instruction {
    /// Create a new instruction
    pub const fn new(opcode: Opcode, arg: u32) -> Self {
        Self { opcode, arg }
    }
}

/// Number of 2-byte code units in `code`
#[inline]
pub fn code_units(code: &[u8]) -> usize {
    code.len() / 2
}

/// Decode the instruction starting at code unit `pc`.
///
/// Returns the instruction and the code unit just past it.
pub fn decode_at(code: &[u8], pc: usize) -> Result<(Instruction, usize)> {
    let mut arg: u32 = 0;
    let mut cursor = pc;
    let mut prefixes = 0;
    loop {
        let at = cursor.checked_mul(2).ok_or(BytecodeError::Truncated)?;
        let unit = code.get(at..at + 2).ok_or(BytecodeError::Truncated)?;
        let opcode = Opcode::from_byte(unit[0]).ok_or(BytecodeError::InvalidOpcode(unit[0]))?;
        arg = (arg << 8) | u32::from(unit[1]);
        cursor += 1;
        if opcode != Opcode::ExtendedArg {
            return Ok((Instruction::new(opcode, arg), cursor));
        }
        prefixes += 1;
        if prefixes > MAX_EXTENDED_ARGS {
            return Err(BytecodeError::InvalidOperand { pc });
        }
    }
}

/// Iterate over the instructions of `code` together with their starting unit
pub fn instructions(code: &[u8]) -> impl Iterator<Item = Result<(usize, Instruction)>> + '_ {
    let end = code_units(code);
    let mut pc = 0;
    let mut failed = false;
    std::iter::from_fn(move || {
        if failed || pc >= end {
            return None;
        }
        match decode_at(code, pc) {
            Ok((instr, next)) => {
                let start = pc;
                pc = next;
                Some(Ok((start, instr)))
            }
            Err(e) => {
                failed = true;
                Some(Err(e))
            }
        }
    })
}

/// Emits instructions and tracks the stack depth they need
#[derive(Debug, Clone, Default)]
pub struct Assembler {
    code: Vec<u8>,
    depth: i64,
    max_depth: i64,
}

impl Assembler {
    /// Create an empty assembler
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit `opcode` with `arg`, prefixing EXTENDED_ARG as needed
    pub fn emit(&mut self, opcode: Opcode, arg: u32) -> &mut Self {
        let bytes = arg.to_be_bytes();
        let first = bytes.iter().position(|&b| b != 0).unwrap_or(3);
        for &b in &bytes[first..3] {
            self.code.push(Opcode::ExtendedArg.to_byte());
            self.code.push(b);
        }
        self.code.push(opcode.to_byte());
        self.code.push(bytes[3]);
        self.depth += opcode.stack_effect(arg);
        self.max_depth = self.max_depth.max(self.depth);
        self
    }

    /// Emit the cheapest instruction sequence that pushes integer `value`.
    ///
    /// Returns `false` when `value` needs a long-int blob instead.
    pub fn emit_small_int(&mut self, value: &BigInt) -> bool {
        if let Ok(v) = i64::try_from(value) {
            if (0..1 << 16).contains(&v) {
                self.emit(Opcode::MakeInt, v as u32);
                return true;
            }
            if (-256..0).contains(&v) {
                self.emit(Opcode::MakeInt, (-v) as u32);
                self.emit(Opcode::UnaryNegative, 0);
                return true;
            }
        }
        false
    }

    /// Current stack depth
    pub fn depth(&self) -> i64 {
        self.depth
    }

    /// Deepest stack seen so far
    pub fn max_depth(&self) -> u32 {
        self.max_depth.max(0) as u32
    }

    /// Number of code units emitted
    pub fn num_units(&self) -> usize {
        code_units(&self.code)
    }

    /// Finish and return the raw code bytes
    pub fn into_code(self) -> Vec<u8> {
        self.code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_roundtrip() {
        let ops = [
            Opcode::Nop,
            Opcode::BuildTuple,
            Opcode::LazyLoadConstant,
            Opcode::MakeFloat,
            Opcode::ReturnConstant,
        ];

        for op in ops {
            assert_eq!(Opcode::from_byte(op.to_byte()), Some(op));
        }
    }

    #[test]
    fn test_invalid_opcode() {
        assert_eq!(Opcode::from_byte(0xFF), None);
        assert_eq!(
            decode_at(&[0xFF, 0x00], 0),
            Err(BytecodeError::InvalidOpcode(0xFF))
        );
    }

    #[test]
    fn test_extended_arg_folding() {
        let mut asm = Assembler::new();
        asm.emit(Opcode::MakeInt, 7)
            .emit(Opcode::MakeString, 0x1234)
            .emit(Opcode::LazyLoadConstant, 0x0102_0304);
        let code = asm.into_code();
        assert_eq!(code_units(&code), 1 + 2 + 4);

        let decoded: Vec<_> = instructions(&code).map(|r| r.unwrap()).collect();
        assert_eq!(
            decoded,
            vec![
                (0, Instruction::new(Opcode::MakeInt, 7)),
                (1, Instruction::new(Opcode::MakeString, 0x1234)),
                (3, Instruction::new(Opcode::LazyLoadConstant, 0x0102_0304)),
            ]
        );
    }

    #[test]
    fn test_too_many_prefixes() {
        let code = [0x90, 1, 0x90, 1, 0x90, 1, 0x90, 1, 0xA2, 0];
        assert_eq!(
            decode_at(&code, 0),
            Err(BytecodeError::InvalidOperand { pc: 0 })
        );
    }

    #[test]
    fn test_dangling_prefix() {
        assert_eq!(decode_at(&[0x90, 1], 0), Err(BytecodeError::Truncated));
    }

    #[test]
    fn test_stack_tracking() {
        let mut asm = Assembler::new();
        asm.emit(Opcode::LazyLoadConstant, 1)
            .emit(Opcode::LazyLoadConstant, 2)
            .emit(Opcode::LazyLoadConstant, 3)
            .emit(Opcode::BuildTuple, 3)
            .emit(Opcode::ReturnConstant, 0);
        assert_eq!(asm.max_depth(), 3);
        assert_eq!(asm.depth(), 0);
    }

    #[test]
    fn test_small_int_forms() {
        let mut asm = Assembler::new();
        assert!(asm.emit_small_int(&BigInt::from(1000)));
        assert!(asm.emit_small_int(&BigInt::from(-1)));
        assert!(!asm.emit_small_int(&BigInt::from(1 << 16)));
        assert!(!asm.emit_small_int(&BigInt::from(-257)));
        assert_eq!(asm.depth(), 2);
    }
}
