//! Phi-copy lowering (spec §4.4).
//!
//! Backends here use stack-slot allocation rather than SSA-aware
//! register assignment, so phis are lowered ahead of ISel into
//! ordinary copies appended to each predecessor block. A copy's
//! ordering relative to its siblings matters for parallel-copy
//! correctness (the classic swap-via-phi pattern), so copies for a
//! given predecessor are recorded in *reverse* phi-encounter order —
//! the last source block's last phi is copied first.

use crate::finalize::FinalizedFunction;
use crate::ir::{BlockId, Function, Instruction, Opcode, Operand, Type, VReg};
use liric_entity::SecondaryMap;

/// One predecessor-local move: `dest_vreg = src_op`.
#[derive(Clone, Debug, PartialEq)]
pub struct PhiCopy {
    pub dest_vreg: VReg,
    pub src_op: Operand,
}

/// Lower every `phi` in `func` into per-predecessor copy lists.
///
/// Returns the copies keyed by predecessor block; callers (the
/// session facade, via `add_phi_copy`, or a backend driving this
/// directly) are responsible for inserting each predecessor's copies
/// before that block's terminator.
pub fn lower_phis(func: &Function) -> SecondaryMap<BlockId, Vec<PhiCopy>> {
    let mut copies: SecondaryMap<BlockId, Vec<PhiCopy>> = SecondaryMap::new();

    for &b in &func.block_order {
        // Walk this block's phis in reverse so that, once each
        // predecessor's list is itself reversed back to the original
        // phi order for emission, the *last* phi's copy ends up first
        // in program order within that predecessor (spec: "last phi's
        // copy is emitted first").
        let phis: Vec<_> = func.blocks[b]
            .insts
            .iter()
            .map(|&id| (id, &func.insts[id]))
            .filter(|(_, inst)| inst.opcode == Opcode::Phi)
            .collect();

        for (_, inst) in phis.iter().rev() {
            let dest = inst.dest;
            // operands = [val0, pred0, val1, pred1, ...]
            for pair in inst.operands.chunks_exact(2) {
                let (val, pred) = (&pair[0], &pair[1]);
                let pred_block = pred.as_block().expect("phi predecessor operand must be a block ref");
                copies[pred_block].push(PhiCopy {
                    dest_vreg: dest,
                    src_op: val.clone(),
                });
            }
        }
    }

    copies
}

/// Resolve phis out of a finalized function entirely: drop every `phi`
/// instruction from the blocks that define them, and insert each
/// predecessor's copies (as `Opcode::Copy`) immediately before that
/// predecessor's terminator.
///
/// The result has no `Opcode::Phi` left in it; instruction selection
/// never needs to know phis existed.
pub fn apply_phi_copies(func: &Function, finalized: &FinalizedFunction) -> FinalizedFunction {
    let copies = lower_phis(func);
    let mut block_insts: SecondaryMap<BlockId, Vec<Instruction>> = SecondaryMap::new();

    for &b in &finalized.block_array {
        let mut out: Vec<Instruction> = finalized
            .block_insts
            .get(b)
            .iter()
            .filter(|i| i.opcode != Opcode::Phi)
            .cloned()
            .collect();

        let pred_copies = copies.get(b);
        if !pred_copies.is_empty() {
            let insert_at = out
                .iter()
                .position(|i| i.opcode.is_terminator())
                .unwrap_or(out.len());
            for (offset, copy) in pred_copies.iter().enumerate() {
                let ty = copy.src_op.ty().clone();
                let mut inst = Instruction::new(Opcode::Copy, ty, copy.dest_vreg, &[copy.src_op.clone()]);
                // placeholder dest type correction for Void ty() cases (block refs never appear here)
                if inst.ty == Type::Void {
                    inst.ty = Type::I64;
                }
                out.insert(insert_at + offset, inst);
            }
        }
        block_insts[b] = out;
    }

    let mut linear_insts = Vec::new();
    let mut block_inst_offsets = Vec::with_capacity(finalized.block_array.len() + 1);
    block_inst_offsets.push(0u32);
    for &b in &finalized.block_array {
        linear_insts.extend(block_insts[b].iter().cloned());
        block_inst_offsets.push(linear_insts.len() as u32);
    }

    FinalizedFunction {
        block_array: finalized.block_array.clone(),
        block_insts,
        linear_insts,
        block_inst_offsets,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Instruction, Type};

    #[test]
    fn reverse_phi_order_per_predecessor() {
        let mut f = Function::declare("f", Type::I32, vec![]);
        f.is_decl = false;
        let pred = f.create_block("pred");
        let merge = f.create_block("merge");

        let a = f.alloc_vreg();
        let b = f.alloc_vreg();
        f.emit(
            merge,
            Instruction::new(
                Opcode::Phi,
                Type::I32,
                a,
                &[Operand::ImmI64(1, Type::I32), Operand::BlockRef(pred)],
            ),
        );
        f.emit(
            merge,
            Instruction::new(
                Opcode::Phi,
                Type::I32,
                b,
                &[Operand::ImmI64(2, Type::I32), Operand::BlockRef(pred)],
            ),
        );

        let copies = lower_phis(&f);
        let pred_copies = copies.get(pred);
        assert_eq!(pred_copies.len(), 2);
        // second phi's copy (dest b) comes first.
        assert_eq!(pred_copies[0].dest_vreg, b);
        assert_eq!(pred_copies[1].dest_vreg, a);
    }
}
