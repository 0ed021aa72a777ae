//! Stack-slot assignment shared by every backend (spec §4.5, "common
//! stack-slot discipline").
//!
//! Every vreg gets an 8-byte slot below the frame pointer, in
//! allocation order; `alloca` additionally reserves element-sized
//! space for the object it names, in encounter order. Slots are never
//! reused — this wastes stack space relative to a real allocator, but
//! it means a slot's offset depends only on `vreg_count()` and the
//! sequence of `alloca`s, not on anything ISel decides, which keeps
//! frame layout simple to reason about and to test independently of
//! any one target.

use crate::finalize::FinalizedFunction;
use crate::ir::{Function, Opcode, VReg};
use std::collections::HashMap;

fn align_up(n: u32, align: u32) -> u32 {
    (n + align - 1) / align * align
}

#[derive(Clone, Debug, Default)]
pub struct StackFrame {
    /// Negative, frame-pointer-relative offset of each vreg's spill
    /// slot, indexed by `VReg::as_u32()`. Index 0 (`VReg::NONE`) is
    /// unused filler.
    vreg_offsets: Vec<i32>,
    /// Extra offset for the storage an `alloca` instruction's
    /// destination vreg points *at* (distinct from the slot holding
    /// the pointer itself).
    alloca_storage_offsets: HashMap<VReg, i32>,
    /// Total frame size in bytes, 16-byte aligned for the calls this
    /// function makes.
    pub total_size: u32,
}

impl StackFrame {
    pub fn build(func: &Function, finalized: &FinalizedFunction, ptr_size: u32) -> Self {
        let n = func.vreg_count();
        let mut vreg_offsets = vec![0i32; (n + 1) as usize];
        let mut offset = 0i32;
        for v in 1..=n {
            offset -= ptr_size as i32;
            vreg_offsets[v as usize] = offset;
        }

        let mut alloca_storage_offsets = HashMap::new();
        for inst in &finalized.linear_insts {
            if inst.opcode == Opcode::Alloca {
                let size = align_up(inst.ty.size().max(1) as u32, ptr_size);
                offset -= size as i32;
                alloca_storage_offsets.insert(inst.dest, offset);
            }
        }

        let raw = (-offset) as u32;
        Self {
            vreg_offsets,
            alloca_storage_offsets,
            total_size: align_up(raw, 16),
        }
    }

    /// `vreg`'s spill-slot offset, relative to the frame pointer.
    pub fn vreg_offset(&self, vreg: VReg) -> i32 {
        self.vreg_offsets[vreg.as_u32() as usize]
    }

    /// The offset of the storage `alloca`-destination `vreg` points
    /// at. Panics if `vreg` isn't an `alloca` destination.
    pub fn alloca_storage_offset(&self, vreg: VReg) -> i32 {
        self.alloca_storage_offsets[&vreg]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::finalize::finalize;
    use crate::ir::{Instruction, Type, VReg};

    #[test]
    fn slots_are_distinct_and_aligned() {
        let mut f = Function::declare("f", Type::I32, vec![Type::I32]);
        f.is_decl = false;
        let entry = f.create_block("entry");
        let a = f.alloc_vreg();
        f.emit(
            entry,
            Instruction::new(Opcode::Alloca, Type::I64, a, &[]),
        );
        f.emit(entry, Instruction::new(Opcode::RetVoid, Type::Void, VReg::NONE, &[]));
        finalize(&mut f);
        let cache = f.finalized().unwrap().clone();
        let frame = StackFrame::build(&f, &cache, 8);
        assert_eq!(frame.total_size % 16, 0);
        assert_ne!(frame.vreg_offset(a), frame.alloca_storage_offset(a));
    }
}
