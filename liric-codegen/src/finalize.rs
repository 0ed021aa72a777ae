//! Finalization and the peephole pass (spec §4.3).
//!
//! `finalize` is idempotent: call it again after any intrusive-IR
//! mutation and it recomputes the dense caches from scratch rather
//! than patching them incrementally. It never touches the function's
//! arena-owned `Instruction` storage — peephole rewrites live entirely
//! in the returned [`FinalizedFunction`], which backends consume
//! instead of walking `function.blocks` directly.

use crate::ir::{BlockId, Function, ICmpPredicate, InstId, Instruction, Opcode, Operand, VReg};
use liric_entity::SecondaryMap;
use std::collections::HashMap;

/// The dense, peephole-rewritten view of a function that instruction
/// selection consumes.
#[derive(Clone, Debug, Default)]
pub struct FinalizedFunction {
    /// Block allocation order (mirrors `Function::block_order`).
    pub block_array: Vec<BlockId>,
    /// Per-block dense instruction arrays, post-peephole.
    pub block_insts: SecondaryMap<BlockId, Vec<Instruction>>,
    /// `block_insts` concatenated in block order.
    pub linear_insts: Vec<Instruction>,
    /// Sentinel-terminated: `block_inst_offsets[i]` is the start index
    /// of block `i`'s instructions in `linear_insts`;
    /// `block_inst_offsets[len]` equals `linear_insts.len()`.
    pub block_inst_offsets: Vec<u32>,
}

impl FinalizedFunction {
    /// Number of blocks this view covers.
    pub fn num_blocks(&self) -> usize {
        self.block_array.len()
    }

    /// The dense instruction slice for block `i` (by position in
    /// `block_array`, not by `BlockId` value).
    pub fn block_slice(&self, i: usize) -> &[Instruction] {
        let start = self.block_inst_offsets[i] as usize;
        let end = self.block_inst_offsets[i + 1] as usize;
        &self.linear_insts[start..end]
    }
}

/// Resolve `op` through the rewrite map, chasing chains until it lands
/// on a non-eliminated value (a still-live vreg, or a non-vreg operand).
fn resolve(op: &Operand, rewrites: &HashMap<VReg, Operand>) -> Operand {
    let mut cur = op.clone();
    // Rewrite chains are finite in an SSA program (each hop strictly
    // removes one now-dead def); bound the walk defensively anyway.
    for _ in 0..1024 {
        match &cur {
            Operand::VReg(v, _) => match rewrites.get(v) {
                Some(next) => cur = next.clone(),
                None => break,
            },
            _ => break,
        }
    }
    cur
}

fn fold_integer_binop(opcode: Opcode, ty: &crate::ir::Type, lhs: i64, rhs: i64) -> Option<Operand> {
    let v = match opcode {
        Opcode::Add => lhs.wrapping_add(rhs),
        Opcode::Sub => lhs.wrapping_sub(rhs),
        Opcode::Mul => lhs.wrapping_mul(rhs),
        Opcode::SDiv if rhs != 0 => lhs.wrapping_div(rhs),
        Opcode::SRem if rhs != 0 => lhs.wrapping_rem(rhs),
        Opcode::UDiv if rhs != 0 => ((lhs as u64).wrapping_div(rhs as u64)) as i64,
        Opcode::URem if rhs != 0 => ((lhs as u64).wrapping_rem(rhs as u64)) as i64,
        Opcode::And => lhs & rhs,
        Opcode::Or => lhs | rhs,
        Opcode::Xor => lhs ^ rhs,
        Opcode::Shl => lhs.wrapping_shl(rhs as u32),
        Opcode::Ashr => lhs.wrapping_shr(rhs as u32),
        Opcode::Lshr => ((lhs as u64).wrapping_shr(rhs as u32)) as i64,
        _ => return None,
    };
    Some(Operand::ImmI64(v, ty.clone()))
}

/// Identity-eliminate a binary op if one side is the opcode's
/// identity element; returns the operand that should replace the
/// instruction's result.
fn identity_eliminate(opcode: Opcode, lhs: &Operand, rhs: &Operand) -> Option<Operand> {
    let rhs_i = rhs.as_imm_i64();
    let lhs_i = lhs.as_imm_i64();
    match opcode {
        Opcode::Add | Opcode::Or | Opcode::Xor if rhs_i == Some(0) => Some(lhs.clone()),
        Opcode::Add | Opcode::Or | Opcode::Xor if lhs_i == Some(0) => Some(rhs.clone()),
        Opcode::Sub if rhs_i == Some(0) => Some(lhs.clone()),
        Opcode::Mul if rhs_i == Some(1) => Some(lhs.clone()),
        Opcode::Mul if lhs_i == Some(1) => Some(rhs.clone()),
        Opcode::And if rhs_i == Some(-1) => Some(lhs.clone()),
        Opcode::And if lhs_i == Some(-1) => Some(rhs.clone()),
        Opcode::Shl | Opcode::Ashr | Opcode::Lshr if rhs_i == Some(0) => Some(lhs.clone()),
        _ => None,
    }
}

/// Run the fold/identity fixpoint across every instruction in the
/// function, returning the substitution map and the set of
/// now-dead-by-construction instructions.
fn build_algebraic_rewrites(
    func: &Function,
) -> (HashMap<VReg, Operand>, std::collections::HashSet<InstId>) {
    let mut rewrites: HashMap<VReg, Operand> = HashMap::new();
    let mut removed = std::collections::HashSet::new();

    for _ in 0..8 {
        let mut changed = false;
        for &b in &func.block_order {
            for &inst_id in &func.blocks[b].insts {
                if removed.contains(&inst_id) {
                    continue;
                }
                let inst = &func.insts[inst_id];
                if inst.dest.is_none() {
                    continue;
                }
                let resolved: Vec<Operand> =
                    inst.operands.iter().map(|o| resolve(o, &rewrites)).collect();

                let replacement = if inst.opcode.is_binary_integer_arith() && resolved.len() == 2 {
                    match (resolved[0].as_imm_i64(), resolved[1].as_imm_i64()) {
                        (Some(l), Some(r)) => fold_integer_binop(inst.opcode, &inst.ty, l, r),
                        _ => identity_eliminate(inst.opcode, &resolved[0], &resolved[1]),
                    }
                } else {
                    None
                };

                if let Some(replacement) = replacement {
                    if rewrites.get(&inst.dest) != Some(&replacement) {
                        rewrites.insert(inst.dest, replacement);
                        removed.insert(inst_id);
                        changed = true;
                    }
                }
            }
        }
        if !changed {
            break;
        }
    }
    (rewrites, removed)
}

/// Finalize `func`: materialize the dense per-block and linear
/// instruction arrays and apply the peephole rewrites documented in
/// spec §4.3. Safe (and cheap) to call again after mutating `func`.
pub fn finalize(func: &mut Function) {
    let (mut rewrites, mut removed) = build_algebraic_rewrites(func);

    // Redundant load elimination: single block-ordered pass, since it
    // depends on program order rather than pure algebraic identity.
    for &b in &func.block_order {
        // address (resolved operand, compared by value) -> cached value.
        let mut cache: Vec<(Operand, Operand)> = Vec::new();
        for &inst_id in &func.blocks[b].insts {
            if removed.contains(&inst_id) {
                continue;
            }
            let inst = &func.insts[inst_id];
            match inst.opcode {
                Opcode::Load => {
                    let addr = resolve(&inst.operands[0], &rewrites);
                    if let Some((_, value)) = cache.iter().find(|(a, _)| *a == addr) {
                        if !inst.dest.is_none() {
                            rewrites.insert(inst.dest, value.clone());
                            removed.insert(inst_id);
                        }
                    } else {
                        let value = Operand::VReg(inst.dest, inst.ty.clone());
                        cache.push((addr, value));
                    }
                }
                Opcode::Store => {
                    let value = resolve(&inst.operands[0], &rewrites);
                    let addr = resolve(&inst.operands[1], &rewrites);
                    cache.clear();
                    cache.push((addr, value));
                }
                Opcode::Call => cache.clear(),
                _ => {}
            }
        }
    }

    // Materialize the dense per-block arrays: drop eliminated
    // instructions, resolve every surviving operand, and fold
    // constant-condition branches to unconditional ones.
    let mut block_insts: SecondaryMap<BlockId, Vec<Instruction>> = SecondaryMap::new();
    for &b in &func.block_order {
        let mut out = Vec::new();
        for &inst_id in &func.blocks[b].insts {
            if removed.contains(&inst_id) {
                continue;
            }
            let inst = &func.insts[inst_id];
            let mut resolved = inst.clone();
            for op in resolved.operands.iter_mut() {
                *op = resolve(op, &rewrites);
            }
            if resolved.opcode == Opcode::CondBr {
                if let Some(cond) = resolved.operands[0].as_imm_i64() {
                    let target = if cond != 0 {
                        resolved.operands[1].clone()
                    } else {
                        resolved.operands[2].clone()
                    };
                    resolved.opcode = Opcode::Br;
                    resolved.operands = smallvec::smallvec![target];
                }
            }
            out.push(resolved);
        }
        block_insts[b] = out;
    }

    dead_instruction_removal(func, &mut block_insts);

    // Concatenate into the linear array with the sentinel offset table.
    let mut linear_insts = Vec::new();
    let mut block_inst_offsets = Vec::with_capacity(func.block_order.len() + 1);
    block_inst_offsets.push(0u32);
    for &b in &func.block_order {
        linear_insts.extend(block_insts[b].iter().cloned());
        block_inst_offsets.push(linear_insts.len() as u32);
    }

    log::debug!(
        "finalize '{}': {} blocks, {} instructions ({} eliminated)",
        func.name,
        func.block_order.len(),
        linear_insts.len(),
        removed.len(),
    );

    func.cache = Some(FinalizedFunction {
        block_array: func.block_order.clone(),
        block_insts,
        linear_insts,
        block_inst_offsets,
    });
}

/// Backward liveness-based dead-instruction removal over the already
/// fold/identity/load-eliminated dense arrays.
///
/// Per spec §9's open question, `alloca` is always treated as live —
/// a transitively-`ptrtoint`-only alloca is not eliminated, unlike the
/// original implementation's apparent behavior.
fn dead_instruction_removal(
    func: &Function,
    block_insts: &mut SecondaryMap<BlockId, Vec<Instruction>>,
) {
    for _ in 0..4 {
        let mut live: std::collections::HashSet<VReg> = std::collections::HashSet::new();
        for &b in func.block_order.iter().rev() {
            let insts = block_insts[b].clone();
            let mut kept = Vec::with_capacity(insts.len());
            for inst in insts.into_iter().rev() {
                let keep = inst.opcode.is_side_effecting()
                    || inst.dest.is_none()
                    || live.contains(&inst.dest);
                if keep {
                    for op in &inst.operands {
                        if let Some(v) = op.as_vreg() {
                            live.insert(v);
                        }
                    }
                    kept.push(inst);
                }
            }
            kept.reverse();
            block_insts[b] = kept;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Function, Opcode, Operand, Type, VReg};

    fn int_op(v: i64) -> Operand {
        Operand::ImmI64(v, Type::I32)
    }

    #[test]
    fn add_zero_is_eliminated() {
        let mut f = Function::declare("f", Type::I32, vec![Type::I32]);
        f.is_decl = false;
        let entry = f.create_block("entry");
        let p0 = f.param_vregs[0];
        let d1 = f.alloc_vreg();
        f.emit(
            entry,
            Instruction::new(
                Opcode::Add,
                Type::I32,
                d1,
                &[Operand::VReg(p0, Type::I32), int_op(0)],
            ),
        );
        f.emit(
            entry,
            Instruction::new(Opcode::Ret, Type::I32, VReg::NONE, &[Operand::VReg(d1, Type::I32)]),
        );
        finalize(&mut f);
        let cache = f.finalized().unwrap();
        // add is eliminated, only `ret %1` (rewritten to the param) remains.
        assert_eq!(cache.linear_insts.len(), 1);
        assert_eq!(cache.linear_insts[0].opcode, Opcode::Ret);
        assert_eq!(cache.linear_insts[0].operands[0], Operand::VReg(p0, Type::I32));
    }

    #[test]
    fn constant_fold_chains_through_identity() {
        let mut f = Function::declare("f", Type::I32, vec![]);
        f.is_decl = false;
        let entry = f.create_block("entry");
        let a = f.alloc_vreg();
        f.emit(
            entry,
            Instruction::new(Opcode::Add, Type::I32, a, &[int_op(2), int_op(3)]),
        );
        let b = f.alloc_vreg();
        f.emit(
            entry,
            Instruction::new(
                Opcode::Mul,
                Type::I32,
                b,
                &[Operand::VReg(a, Type::I32), int_op(1)],
            ),
        );
        f.emit(
            entry,
            Instruction::new(Opcode::Ret, Type::I32, VReg::NONE, &[Operand::VReg(b, Type::I32)]),
        );
        finalize(&mut f);
        let cache = f.finalized().unwrap();
        assert_eq!(cache.linear_insts.len(), 1);
        assert_eq!(cache.linear_insts[0].operands[0], int_op(5));
    }

    #[test]
    fn condbr_with_constant_condition_simplifies() {
        let mut f = Function::declare("f", Type::I32, vec![]);
        f.is_decl = false;
        let entry = f.create_block("entry");
        let t = f.create_block("t");
        let fl = f.create_block("f");
        f.emit(
            entry,
            Instruction::new(
                Opcode::CondBr,
                Type::Void,
                VReg::NONE,
                &[
                    Operand::ImmI64(1, Type::I1),
                    Operand::BlockRef(t),
                    Operand::BlockRef(fl),
                ],
            ),
        );
        f.emit(t, Instruction::new(Opcode::RetVoid, Type::Void, VReg::NONE, &[]));
        f.emit(fl, Instruction::new(Opcode::RetVoid, Type::Void, VReg::NONE, &[]));
        finalize(&mut f);
        let cache = f.finalized().unwrap();
        assert_eq!(cache.block_slice(0)[0].opcode, Opcode::Br);
        assert_eq!(cache.block_slice(0)[0].operands[0], Operand::BlockRef(t));
    }

    #[test]
    fn redundant_loads_collapse() {
        let mut f = Function::declare("f", Type::I32, vec![Type::Ptr]);
        f.is_decl = false;
        let entry = f.create_block("entry");
        let p = f.param_vregs[0];
        let v1 = f.alloc_vreg();
        f.emit(
            entry,
            Instruction::new(Opcode::Load, Type::I32, v1, &[Operand::VReg(p, Type::Ptr)]),
        );
        let v2 = f.alloc_vreg();
        f.emit(
            entry,
            Instruction::new(Opcode::Load, Type::I32, v2, &[Operand::VReg(p, Type::Ptr)]),
        );
        let v3 = f.alloc_vreg();
        f.emit(
            entry,
            Instruction::new(
                Opcode::Add,
                Type::I32,
                v3,
                &[Operand::VReg(v1, Type::I32), Operand::VReg(v2, Type::I32)],
            ),
        );
        let last = {
            let d = f.alloc_vreg();
            d
        };
        f.emit(
            entry,
            Instruction::new(Opcode::Ret, Type::I32, VReg::NONE, &[Operand::VReg(last, Type::I32)]),
        );
        finalize(&mut f);
        let cache = f.finalized().unwrap();
        let load_count = cache
            .linear_insts
            .iter()
            .filter(|i| i.opcode == Opcode::Load)
            .count();
        assert_eq!(load_count, 1);
    }

    #[test]
    fn block_offsets_match_property() {
        let mut f = Function::declare("f", Type::Void, vec![]);
        f.is_decl = false;
        let a = f.create_block("a");
        let b = f.create_block("b");
        f.emit(a, Instruction::new(Opcode::Br, Type::Void, VReg::NONE, &[Operand::BlockRef(b)]));
        f.emit(b, Instruction::new(Opcode::RetVoid, Type::Void, VReg::NONE, &[]));
        finalize(&mut f);
        let cache = f.finalized().unwrap();
        assert_eq!(cache.block_inst_offsets.len(), cache.num_blocks() + 1);
        for i in 0..cache.num_blocks() {
            let expect = cache.block_inst_offsets[i + 1] - cache.block_inst_offsets[i];
            assert_eq!(expect as usize, cache.block_slice(i).len());
        }
        assert_eq!(
            *cache.block_inst_offsets.last().unwrap() as usize,
            cache.linear_insts.len()
        );
    }
}
