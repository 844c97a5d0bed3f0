//! Constant values
//!
//! Values are immutable and cheap to clone: aggregates share their storage
//! through `Rc`.

use std::fmt;
use std::rc::Rc;

use lazyc_bytecode::wtf8;
use num_bigint::BigInt;

use crate::code::CodeObject;
use crate::error::{VmError, VmResult};

/// A materialized constant
#[derive(Debug, Clone)]
pub enum Value {
    /// `None`
    None,
    /// Boolean
    Bool(bool),
    /// `...`
    Ellipsis,
    /// Arbitrary-precision integer
    Int(BigInt),
    /// Double
    Float(f64),
    /// Complex number
    Complex {
        /// Real part
        re: f64,
        /// Imaginary part
        im: f64,
    },
    /// UTF-16 text, possibly with lone surrogates
    Str(Rc<[u16]>),
    /// Byte string
    Bytes(Rc<[u8]>),
    /// Tuple
    Tuple(Rc<[Value]>),
    /// Frozen set, items unique and in first-seen order
    FrozenSet(Rc<[Value]>),
    /// Nested code object
    Code(Rc<CodeObject>),
}

impl Value {
    /// Build a string value from Rust text
    pub fn str(s: &str) -> Self {
        Self::Str(wtf8::units_of(s).into())
    }

    /// Build an integer value
    pub fn int(v: impl Into<BigInt>) -> Self {
        Self::Int(v.into())
    }

    /// Type name for error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::None => "NoneType",
            Self::Bool(_) => "bool",
            Self::Ellipsis => "ellipsis",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Complex { .. } => "complex",
            Self::Str(_) => "str",
            Self::Bytes(_) => "bytes",
            Self::Tuple(_) => "tuple",
            Self::FrozenSet(_) => "frozenset",
            Self::Code(_) => "code",
        }
    }

    /// Get as float
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(x) => Some(*x),
            _ => None,
        }
    }

    /// Get as code object
    pub fn as_code(&self) -> Option<&Rc<CodeObject>> {
        match self {
            Self::Code(code) => Some(code),
            _ => None,
        }
    }

    /// Arithmetic negation
    pub fn negate(&self) -> VmResult<Self> {
        match self {
            Self::Int(v) => Ok(Self::Int(-v)),
            Self::Float(x) => Ok(Self::Float(-x)),
            Self::Complex { re, im } => Ok(Self::Complex { re: -re, im: -im }),
            other => Err(VmError::TypeError(format!(
                "bad operand type for unary -: '{}'",
                other.type_name()
            ))),
        }
    }

    /// Combine real and imaginary parts into a complex number
    pub fn complex(re: &Self, im: &Self) -> VmResult<Self> {
        match (re, im) {
            (Self::Float(re), Self::Float(im)) => Ok(Self::Complex { re: *re, im: *im }),
            (re, im) => Err(VmError::TypeError(format!(
                "complex() parts must be float, not '{}' and '{}'",
                re.type_name(),
                im.type_name()
            ))),
        }
    }

    /// Build a frozen set, dropping duplicates
    pub fn frozen_set(items: Vec<Self>) -> Self {
        let mut unique: Vec<Self> = Vec::with_capacity(items.len());
        for item in items {
            if !unique.contains(&item) {
                unique.push(item);
            }
        }
        Self::FrozenSet(unique.into())
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        let mut pending = vec![(self, other)];
        while let Some((a, b)) = pending.pop() {
            let equal = match (a, b) {
                (Self::None, Self::None) | (Self::Ellipsis, Self::Ellipsis) => true,
                (Self::Bool(x), Self::Bool(y)) => x == y,
                (Self::Int(x), Self::Int(y)) => x == y,
                // Bit equality: 0.0 and -0.0 are distinct constants, NaN equals itself.
                (Self::Float(x), Self::Float(y)) => x.to_bits() == y.to_bits(),
                (Self::Complex { re: r1, im: i1 }, Self::Complex { re: r2, im: i2 }) => {
                    r1.to_bits() == r2.to_bits() && i1.to_bits() == i2.to_bits()
                }
                (Self::Str(x), Self::Str(y)) => x == y,
                (Self::Bytes(x), Self::Bytes(y)) => x == y,
                (Self::Tuple(x), Self::Tuple(y)) | (Self::FrozenSet(x), Self::FrozenSet(y)) => {
                    pending.extend(x.iter().zip(y.iter()));
                    x.len() == y.len()
                }
                (Self::Code(x), Self::Code(y)) => Rc::ptr_eq(x, y),
                _ => false,
            };
            if !equal {
                return false;
            }
        }
        true
    }
}

fn write_float(f: &mut fmt::Formatter<'_>, x: f64) -> fmt::Result {
    if x.is_nan() {
        f.write_str("nan")
    } else if x.is_infinite() {
        f.write_str(if x > 0.0 { "inf" } else { "-inf" })
    } else {
        write!(f, "{x:?}")
    }
}

/// Display work item; aggregates are expanded onto an explicit stack
enum Piece<'a> {
    Value(&'a Value),
    Text(&'static str),
}

fn push_items<'a>(pending: &mut Vec<Piece<'a>>, items: &'a [Value]) {
    for (i, item) in items.iter().enumerate().rev() {
        pending.push(Piece::Value(item));
        if i > 0 {
            pending.push(Piece::Text(", "));
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut pending = vec![Piece::Value(self)];
        while let Some(piece) = pending.pop() {
            let value = match piece {
                Piece::Text(text) => {
                    f.write_str(text)?;
                    continue;
                }
                Piece::Value(value) => value,
            };
            match value {
                Self::None => f.write_str("None")?,
                Self::Bool(true) => f.write_str("True")?,
                Self::Bool(false) => f.write_str("False")?,
                Self::Ellipsis => f.write_str("Ellipsis")?,
                Self::Int(v) => write!(f, "{v}")?,
                Self::Float(x) => write_float(f, *x)?,
                Self::Complex { re, im } => {
                    f.write_str("(")?;
                    write_float(f, *re)?;
                    if !im.is_sign_negative() {
                        f.write_str("+")?;
                    }
                    write_float(f, *im)?;
                    f.write_str("j)")?;
                }
                Self::Str(units) => write!(f, "{:?}", wtf8::to_string_lossy(units))?,
                Self::Bytes(bytes) => {
                    f.write_str("b'")?;
                    for &b in bytes.iter() {
                        match b {
                            b'\\' => f.write_str("\\\\")?,
                            b'\'' => f.write_str("\\'")?,
                            0x20..=0x7e => write!(f, "{}", b as char)?,
                            _ => write!(f, "\\x{b:02x}")?,
                        }
                    }
                    f.write_str("'")?;
                }
                Self::Tuple(items) => {
                    f.write_str("(")?;
                    pending.push(Piece::Text(if items.len() == 1 { ",)" } else { ")" }));
                    push_items(&mut pending, items);
                }
                Self::FrozenSet(items) => {
                    f.write_str("frozenset({")?;
                    pending.push(Piece::Text("})"));
                    push_items(&mut pending, items);
                }
                Self::Code(code) => write!(f, "<code object {}>", code.display_name())?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let tuple = Value::Tuple(vec![Value::int(1), Value::str("a")].into());
        assert_eq!(tuple.to_string(), "(1, \"a\")");
        assert_eq!(Value::Tuple(vec![Value::None].into()).to_string(), "(None,)");
        assert_eq!(Value::Float(3.5).to_string(), "3.5");
        assert_eq!(Value::Float(1.0).to_string(), "1.0");
        assert_eq!(
            Value::Complex { re: 1.0, im: -2.0 }.to_string(),
            "(1.0-2.0j)"
        );
        assert_eq!(Value::Bytes(b"a\x00".to_vec().into()).to_string(), "b'a\\x00'");
    }

    #[test]
    fn test_negate() {
        assert_eq!(Value::int(5).negate().unwrap(), Value::int(-5));
        assert_eq!(Value::Float(2.0).negate().unwrap(), Value::Float(-2.0));
        let err = Value::str("x").negate().unwrap_err();
        assert!(matches!(err, VmError::TypeError(_)));
    }

    #[test]
    fn test_frozen_set_dedups() {
        let set = Value::frozen_set(vec![Value::int(1), Value::int(2), Value::int(1)]);
        match set {
            Value::FrozenSet(items) => assert_eq!(items.len(), 2),
            other => panic!("expected frozenset, got {other}"),
        }
    }

    #[test]
    fn test_float_bit_equality() {
        assert_ne!(Value::Float(0.0), Value::Float(-0.0));
        assert_eq!(Value::Float(f64::NAN), Value::Float(f64::NAN));
    }

    #[test]
    fn test_nested_display_and_equality() {
        let nest = |depth: usize| {
            let mut value = Value::str("x");
            for _ in 0..depth {
                value = Value::Tuple(vec![value].into());
            }
            value
        };
        let deep = nest(1000);
        assert_eq!(deep, nest(1000));
        assert_ne!(deep, nest(999));
        let expected = format!("{}\"x\"{}", "(".repeat(1000), ",)".repeat(1000));
        assert_eq!(deep.to_string(), expected);

        let mixed = Value::Tuple(
            vec![
                Value::Tuple(Vec::<Value>::new().into()),
                Value::frozen_set(vec![Value::int(1), Value::int(2)]),
                Value::int(3),
            ]
            .into(),
        );
        assert_eq!(mixed.to_string(), "((), frozenset({1, 2}), 3)");
    }
}
