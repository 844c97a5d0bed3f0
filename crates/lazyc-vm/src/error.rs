//! VM error types

use lazyc_bytecode::BytecodeError;
use thiserror::Error;

/// Errors raised while hydrating code objects or constructing constants
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VmError {
    /// A construction fragment's private stack is not in the required shape
    #[error("Stack imbalance: depth {depth}, expected {expected}")]
    StackImbalance {
        /// Values actually on the stack (or the requested size)
        depth: usize,
        /// Values the operation required (or the allowed size)
        expected: usize,
    },

    /// Internal consistency check failed (corrupt fragment)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// A constant's fragment tried to load the constant it is building
    #[error("Cyclic constant: slot {slot} of code object {code}")]
    CyclicConstant {
        /// Index of the owning code object
        code: u32,
        /// Constant slot under construction
        slot: u32,
    },

    /// Operand of the wrong type
    #[error("TypeError: {0}")]
    TypeError(String),

    /// Too many nested invocation records
    #[error("Invocation record depth limit {0} exceeded")]
    RecordOverflow(usize),

    /// The code object was compiled and no longer has a container
    #[error("Code object is detached from its container")]
    Detached,

    /// Container or decode failure
    #[error("Bytecode error: {0}")]
    Bytecode(#[from] BytecodeError),
}

/// Fieldless classification of [`VmError`], one entry per failure class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Stream ended early
    Truncated,
    /// Offset/length escapes its region
    OutOfBounds,
    /// Bad varint
    MalformedVarint,
    /// Undecodable string bytes
    InvalidEncoding,
    /// Magic tag mismatch
    InvalidMagic,
    /// Unknown version or flags
    UnsupportedVersion,
    /// Index out of range for its table
    BadIndex,
    /// Absent entry dereferenced
    Absent,
    /// Unknown opcode byte
    InvalidOpcode,
    /// Malformed instruction operand
    InvalidOperand,
    /// Value too large for the format
    Overflow,
    /// Fragment stack shape
    StackImbalance,
    /// Terminal instruction mismatch and similar corruption
    InvariantViolation,
    /// Self-referential constant
    CyclicConstant,
    /// Operand type
    TypeError,
    /// Record depth limit
    RecordOverflow,
    /// Container already dropped
    Detached,
}

impl VmError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::StackImbalance { .. } => ErrorKind::StackImbalance,
            Self::InvariantViolation(_) => ErrorKind::InvariantViolation,
            Self::CyclicConstant { .. } => ErrorKind::CyclicConstant,
            Self::TypeError(_) => ErrorKind::TypeError,
            Self::RecordOverflow(_) => ErrorKind::RecordOverflow,
            Self::Detached => ErrorKind::Detached,
            Self::Bytecode(e) => match e {
                BytecodeError::Truncated => ErrorKind::Truncated,
                BytecodeError::OutOfBounds { .. } => ErrorKind::OutOfBounds,
                BytecodeError::MalformedVarint => ErrorKind::MalformedVarint,
                BytecodeError::InvalidEncoding { .. } => ErrorKind::InvalidEncoding,
                BytecodeError::InvalidMagic => ErrorKind::InvalidMagic,
                BytecodeError::UnsupportedVersion { .. } => ErrorKind::UnsupportedVersion,
                BytecodeError::BadIndex { .. } => ErrorKind::BadIndex,
                BytecodeError::Absent { .. } => ErrorKind::Absent,
                BytecodeError::InvalidOpcode(_) => ErrorKind::InvalidOpcode,
                BytecodeError::InvalidOperand { .. } => ErrorKind::InvalidOperand,
                BytecodeError::Overflow(_) => ErrorKind::Overflow,
            },
        }
    }

    /// Whether this error marks the code object being hydrated as corrupt.
    ///
    /// Such failures are reported per object and never abort a batch.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::StackImbalance | ErrorKind::InvariantViolation | ErrorKind::CyclicConstant
        )
    }

    /// Shorthand for [`VmError::InvariantViolation`]
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }
}

/// Result type for VM operations
pub type VmResult<T> = std::result::Result<T, VmError>;
