use crate::ir::{Opcode, Operand, Type, VReg};
use liric_entity::entity_ref;
use smallvec::SmallVec;

entity_ref!(
    /// A reference to an instruction, dense within its owning function's
    /// arena-backed instruction storage. Stable for the function's
    /// lifetime even after the instruction is elided from the
    /// finalized dense array.
    InstId,
    "inst"
);

/// Flags carried only by `call` instructions.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CallFlags {
    /// The callee is an externally-supplied (declared, not defined)
    /// function, resolved through the JIT's symbol-provider chain
    /// rather than a module-local compiled address.
    pub external_abi: bool,
    /// The callee's signature is variadic.
    pub vararg: bool,
}

/// A single IR instruction.
///
/// Operand layout is opcode-dependent (spec §3); this struct stores a
/// flat operand vector plus whatever side data a handful of opcodes
/// need (comparison predicates already live on `Opcode::ICmp`/`FCmp`;
/// `gep`'s base type and `alloca`'s element type reuse the `ty` field;
/// aggregate indices and call flags get their own slots since no
/// other opcode needs them).
#[derive(Clone, Debug)]
pub struct Instruction {
    pub opcode: Opcode,
    /// The instruction's result type. For `call` this is the return
    /// type (possibly void). For `gep` this is the *base* (pointee)
    /// type used for offset computation, not the result pointer type.
    /// For `alloca` this is the element type.
    pub ty: Type,
    /// Destination vreg; `VReg::NONE` iff the opcode produces no value.
    pub dest: VReg,
    pub operands: SmallVec<[Operand; 4]>,
    /// `extractvalue`/`insertvalue` index path.
    pub indices: SmallVec<[u32; 2]>,
    pub call_flags: CallFlags,
}

impl Instruction {
    /// Build an instruction with no side data set.
    pub fn new(opcode: Opcode, ty: Type, dest: VReg, operands: &[Operand]) -> Self {
        Self {
            opcode,
            ty,
            dest,
            operands: operands.iter().cloned().collect(),
            indices: SmallVec::new(),
            call_flags: CallFlags::default(),
        }
    }

    /// Whether this instruction both produces a value and that value
    /// could in principle be dead (i.e. is not itself side-effecting).
    pub fn is_removable_if_dead(&self) -> bool {
        !self.dest.is_none() && !self.opcode.is_side_effecting()
    }
}
