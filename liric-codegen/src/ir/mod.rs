//! The arena-owned IR data model (spec §3).
//!
//! Entities are never individually freed; a `Module`'s `Arena` is
//! released as a whole at drop time, and everything that looks like
//! an "entity" — blocks, instructions, functions, globals — is really
//! a `Copy` handle (see `liric_entity`) indexing into a dense
//! `PrimaryMap` owned by the entity's parent. This gives the same
//! pointer-stability and trivial-substructure-cloning the arena
//! version promises, without unsafe raw pointers into bump-allocated
//! memory (see `crate::arena` for the rationale).

mod block;
mod function;
mod global;
mod instr;
mod module;
mod opcode;
mod operand;
mod symtab;
mod types;
mod vreg;

pub use block::{Block, BlockId};
pub use function::{Function, FuncId};
pub use global::{Global, GlobalId, Relocation};
pub use instr::{CallFlags, InstId, Instruction};
pub use module::Module;
pub use opcode::Opcode;
pub use operand::{FCmpPredicate, ICmpPredicate, Operand};
pub use symtab::SymbolTable;
pub use types::Type;
pub use vreg::VReg;
