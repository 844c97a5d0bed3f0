//! # Lazy-constant bytecode container
//!
//! This crate defines the container that carries a compiled unit's code
//! objects, strings, blobs and constant construction fragments as one
//! offset-indexed blob.
//!
//! ## Design Principles
//!
//! - **Lazy**: objects stay opaque bytes until something asks for them
//! - **Bounds-safe**: every offset is untrusted and checked against the region
//! - **Context-typed blobs**: the referencing instruction picks a blob's type
//! - **Deduplicated**: the writer stores each distinct object once

#![warn(clippy::all)]
#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod codec;
pub mod constant;
pub mod container;
pub mod decode;
pub mod disasm;
pub mod error;
pub mod instruction;
pub mod operand;
pub mod region;
pub mod writer;
pub mod wtf8;

pub use constant::{CodeSpec, ConstValue};
pub use container::{Container, ContainerStats, Header};
pub use decode::{Blob, BlobKind, CodeRecord, Fragment, TableCounts};
pub use error::{BytecodeError, Result, Table};
pub use instruction::{Assembler, CommonConstant, Instruction, Opcode};
pub use operand::{BlobIndex, CodeIndex, ConstIndex, StringIndex};
pub use region::Region;
pub use writer::{CodeEntry, ContainerBuilder};

/// Container format version.
///
/// Version 1: code object records carry fourteen `u4` fields followed by four
/// separate variable-name arrays (names, varnames, freevars, cellvars) and no
/// per-variable kind bytes; the header flag word must be zero.
pub const FORMAT_VERSION: u16 = 1;

/// Magic tag opening the secondary header
pub const CONTAINER_MAGIC: [u8; 4] = *b"LZCN";

/// Size of the secondary header
pub const HEADER_SIZE: usize = 16;
