//! LIRIC code generation library.
//!
//! This crate owns the in-memory IR (arena-backed modules, functions,
//! blocks and instructions), the finalization/peephole pass that turns
//! the intrusive IR into dense arrays ready for codegen, and the
//! per-target instruction selectors and machine-code encoders.
//!
//! Textual IR parsing lives in `liric-reader`; JIT page management and
//! dynamic symbol resolution live in `liric-jit`; the streaming builder
//! facade lives in the top-level `liric` crate.

pub mod arena;
pub mod binemit;
pub mod finalize;
pub mod ir;
pub mod isa;
pub mod phi;
pub mod result;

pub use crate::result::{CodegenError, CodegenResult};

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
