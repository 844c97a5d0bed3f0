//! # Lazy constant runtime
//!
//! Turns code objects stored in a [`Container`](lazyc_bytecode::Container)
//! into usable in-memory objects, one hydration level at a time, and builds
//! their constants on first use by running each constant's construction
//! fragment.
//!
//! ## Components
//!
//! - [`Loader`]: a hydration context over one container
//! - [`CodeObject`]: per-object hydration state machine and constant slots
//! - [`Interpreter`]: construction engine and host dispatch loop, with an
//!   explicit invocation-record stack instead of native recursion
//!
//! Everything here is single-threaded (`Rc`/`RefCell`). The container itself
//! is immutable and can be shared across threads; give each thread its own
//! [`Loader`].

#![warn(clippy::all)]
#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod code;
pub mod config;
pub mod error;
pub mod hydration;
pub mod interpreter;
pub mod loader;
pub mod value;

pub use code::{CodeFields, CodeObject};
pub use config::LoaderConfig;
pub use error::{ErrorKind, VmError, VmResult};
pub use hydration::HydrationLevel;
pub use interpreter::Interpreter;
pub use loader::{BatchReport, Loader};
pub use value::Value;
