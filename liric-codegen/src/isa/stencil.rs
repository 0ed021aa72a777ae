//! Copy-and-patch fast path for x86_64 (spec §4.9).
//!
//! Each stencil below is a literal byte sequence for one opcode,
//! pre-assembled by hand the same way a `copy-and-patch` JIT's stencil
//! compiler would at build time, with four sentinel `i32` immediates
//! standing in for values only known at lowering time:
//!
//!   - `0x11111111` → src0 stack offset
//!   - `0x22222222` → src1 stack offset
//!   - `0x33333333` → dest stack offset
//!   - `0x44444444` → frame size / materialized i64 immediate
//!
//! [`Stencil::scan`] finds every sentinel's byte offset once, at first
//! use; [`Stencil::copy_patched`] then just `memcpy`s the template and
//! overwrites those positions — no instruction encoding happens on
//! the hot path at all, which is the entire point of the strategy.
//! This is strictly an acceleration of [`crate::isa::x86_64`]'s own
//! lowering for a narrow, syntactically-recognizable subset of
//! functions; anything outside [`is_applicable`] falls back to that
//! backend unchanged.

use crate::binemit::CodeBuffer;
use crate::finalize::FinalizedFunction;
use crate::ir::{Function, Opcode, Operand, Type};
use crate::isa::{CompiledFunction, StackFrame};
use crate::result::{CodegenError, CodegenResult};
use std::collections::HashMap;
use std::sync::OnceLock;

const SRC0: u32 = 0x1111_1111;
const SRC1: u32 = 0x2222_2222;
const DEST: u32 = 0x3333_3333;
const IMM: u32 = 0x4444_4444;

struct Stencil {
    bytes: Vec<u8>,
    positions: HashMap<u32, Vec<usize>>,
}

impl Stencil {
    fn scan(bytes: Vec<u8>, sentinels: &[u32]) -> Self {
        let mut positions: HashMap<u32, Vec<usize>> = HashMap::new();
        for &needle in sentinels {
            let needle_bytes = needle.to_le_bytes();
            let mut hits = Vec::new();
            if bytes.len() >= 4 {
                for i in 0..=bytes.len() - 4 {
                    if bytes[i..i + 4] == needle_bytes {
                        hits.push(i);
                    }
                }
            }
            positions.insert(needle, hits);
        }
        Stencil { bytes, positions }
    }

    /// Copy this stencil's template into `out`, patching every
    /// occurrence of `sentinel` to `value`.
    fn emit_patched(&self, out: &mut Vec<u8>, patches: &[(u32, i32)]) {
        let base = out.len();
        out.extend_from_slice(&self.bytes);
        for &(sentinel, value) in patches {
            if let Some(hits) = self.positions.get(&sentinel) {
                for &pos in hits {
                    out[base + pos..base + pos + 4].copy_from_slice(&value.to_le_bytes());
                }
            }
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum StencilOp {
    Binop(Opcode),
    Ret,
    RetVoid,
    Prologue,
    StoreParam(u8),
    ImmMaterialize,
    AddRetSuper,
}

/// `Opcode` doesn't derive `Hash` (spec's opcode table has no need for
/// it outside this table), so `StencilOp` hashes by a small stable
/// discriminant instead of deriving.
impl std::hash::Hash for StencilOp {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            StencilOp::Binop(op) => (0u8, opcode_discriminant(*op)).hash(state),
            StencilOp::Ret => 1u8.hash(state),
            StencilOp::RetVoid => 2u8.hash(state),
            StencilOp::Prologue => 3u8.hash(state),
            StencilOp::StoreParam(i) => (4u8, i).hash(state),
            StencilOp::ImmMaterialize => 5u8.hash(state),
            StencilOp::AddRetSuper => 6u8.hash(state),
        }
    }
}

fn opcode_discriminant(op: Opcode) -> u8 {
    match op {
        Opcode::Add => 0,
        Opcode::Sub => 1,
        Opcode::And => 2,
        Opcode::Or => 3,
        Opcode::Xor => 4,
        Opcode::Mul => 5,
        Opcode::SDiv => 6,
        Opcode::SRem => 7,
        Opcode::Shl => 8,
        Opcode::Lshr => 9,
        Opcode::Ashr => 10,
        _ => 255,
    }
}

fn sentinels_for(op: StencilOp) -> &'static [u32] {
    match op {
        StencilOp::Binop(_) => &[SRC0, SRC1, DEST],
        StencilOp::Ret => &[SRC0],
        StencilOp::RetVoid => &[],
        StencilOp::Prologue => &[IMM],
        StencilOp::StoreParam(_) => &[DEST],
        StencilOp::ImmMaterialize => &[DEST, IMM],
        StencilOp::AddRetSuper => &[SRC0, SRC1],
    }
}

/// `mod rm64, [rbp+disp32]` ModRM byte for `reg = rax`.
const MODRM_RAX_RBP_DISP32: u8 = 0x85;

fn load_rax(opcode: &[u8]) -> Vec<u8> {
    let mut v = vec![0x48];
    v.extend_from_slice(opcode);
    v.push(MODRM_RAX_RBP_DISP32);
    v.extend_from_slice(&SRC0.to_le_bytes());
    v
}

fn binop_template(opcode: Opcode) -> Vec<u8> {
    let (load_op, alu_op): (u8, Option<&[u8]>) = match opcode {
        Opcode::Add => (0x8B, Some(&[0x03])),
        Opcode::Sub => (0x8B, Some(&[0x2B])),
        Opcode::And => (0x8B, Some(&[0x23])),
        Opcode::Or => (0x8B, Some(&[0x0B])),
        Opcode::Xor => (0x8B, Some(&[0x33])),
        Opcode::Mul => (0x8B, Some(&[0x0F, 0xAF])),
        _ => (0x8B, None),
    };
    let mut bytes = Vec::new();
    // mov rax, [rbp+SRC0]
    bytes.push(0x48);
    bytes.push(load_op);
    bytes.push(MODRM_RAX_RBP_DISP32);
    bytes.extend_from_slice(&SRC0.to_le_bytes());

    match opcode {
        Opcode::SDiv | Opcode::SRem => {
            // mov rcx, [rbp+SRC1]; cqo; idiv rcx
            bytes.extend_from_slice(&[0x48, 0x8B, 0x8D]);
            bytes.extend_from_slice(&SRC1.to_le_bytes());
            bytes.extend_from_slice(&[0x48, 0x99]); // cqo
            bytes.extend_from_slice(&[0x48, 0xF7, 0xF9]); // idiv rcx
            if opcode == Opcode::SRem {
                bytes.extend_from_slice(&[0x48, 0x89, 0xD0]); // mov rax, rdx
            }
        }
        Opcode::Shl | Opcode::Lshr | Opcode::Ashr => {
            // mov rcx, [rbp+SRC1]; shl/shr/sar rax, cl
            bytes.extend_from_slice(&[0x48, 0x8B, 0x8D]);
            bytes.extend_from_slice(&SRC1.to_le_bytes());
            let ext = match opcode {
                Opcode::Shl => 4,
                Opcode::Lshr => 5,
                Opcode::Ashr => 7,
                _ => unreachable!(),
            };
            bytes.extend_from_slice(&[0x48, 0xD3, 0xC0 | (ext << 3)]);
        }
        _ => {
            let alu_op = alu_op.expect("binop_template called with a non-stencil opcode");
            bytes.push(0x48);
            bytes.extend_from_slice(alu_op);
            bytes.push(MODRM_RAX_RBP_DISP32);
            bytes.extend_from_slice(&SRC1.to_le_bytes());
        }
    }

    // mov [rbp+DEST], rax
    bytes.extend_from_slice(&[0x48, 0x89, MODRM_RAX_RBP_DISP32]);
    bytes.extend_from_slice(&DEST.to_le_bytes());
    bytes
}

fn ret_template() -> Vec<u8> {
    let mut bytes = load_rax(&[0x8B]);
    bytes.extend_from_slice(&[0x48, 0x89, 0xEC]); // mov rsp, rbp
    bytes.push(0x5D); // pop rbp
    bytes.push(0xC3); // ret
    bytes
}

fn ret_void_template() -> Vec<u8> {
    vec![0x48, 0x89, 0xEC, 0x5D, 0xC3]
}

fn prologue_template() -> Vec<u8> {
    let mut bytes = vec![0x55]; // push rbp
    bytes.extend_from_slice(&[0x48, 0x89, 0xE5]); // mov rbp, rsp
    bytes.extend_from_slice(&[0x48, 0x81, 0xEC]); // sub rsp, imm32
    bytes.extend_from_slice(&IMM.to_le_bytes());
    bytes
}

/// `mov [rbp+DEST], <argreg>` for one of the six SysV integer argument
/// registers. Unlike the other stencils the *source* register is
/// fixed per variant rather than itself a sentinel — copy-and-patch
/// stencils can only patch immediates, not register-encoding bits, so
/// callers pick the right variant by argument index instead.
fn store_param_template(index: u8) -> Vec<u8> {
    let (rex, modrm): (u8, u8) = match index {
        0 => (0x48, 0xBD), // rdi
        1 => (0x48, 0xB5), // rsi
        2 => (0x48, 0x95), // rdx
        3 => (0x48, 0x8D), // rcx
        4 => (0x4C, 0x85), // r8
        5 => (0x4C, 0x8D), // r9
        _ => unreachable!("only 6 register arguments are applicable to this path"),
    };
    let mut bytes = vec![rex, 0x89, modrm];
    bytes.extend_from_slice(&DEST.to_le_bytes());
    bytes
}

/// `mov qword [rbp+DEST], IMM` (sign-extended 32-bit immediate into a
/// full 64-bit slot, REX.W `C7 /0`).
fn imm_materialize_template() -> Vec<u8> {
    let mut bytes = vec![0x48, 0xC7, 0x85];
    bytes.extend_from_slice(&DEST.to_le_bytes());
    bytes.extend_from_slice(&IMM.to_le_bytes());
    bytes
}

/// Fused `add; ret` super-stencil: skips writing the sum back to its
/// own dest slot when the very next instruction just reloads it.
fn add_ret_super_template() -> Vec<u8> {
    let mut bytes = load_rax(&[0x8B]);
    bytes.extend_from_slice(&[0x48, 0x03, MODRM_RAX_RBP_DISP32]);
    bytes.extend_from_slice(&SRC1.to_le_bytes());
    bytes.extend_from_slice(&[0x48, 0x89, 0xEC]); // mov rsp, rbp
    bytes.push(0x5D); // pop rbp
    bytes.push(0xC3); // ret
    bytes
}

fn template_for(op: StencilOp) -> Vec<u8> {
    match op {
        StencilOp::Binop(opcode) => binop_template(opcode),
        StencilOp::Ret => ret_template(),
        StencilOp::RetVoid => ret_void_template(),
        StencilOp::Prologue => prologue_template(),
        StencilOp::StoreParam(i) => store_param_template(i),
        StencilOp::ImmMaterialize => imm_materialize_template(),
        StencilOp::AddRetSuper => add_ret_super_template(),
    }
}

fn stencil_table() -> &'static HashMap<StencilOp, Stencil> {
    static TABLE: OnceLock<HashMap<StencilOp, Stencil>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = HashMap::new();
        let ops = [
            StencilOp::Binop(Opcode::Add),
            StencilOp::Binop(Opcode::Sub),
            StencilOp::Binop(Opcode::And),
            StencilOp::Binop(Opcode::Or),
            StencilOp::Binop(Opcode::Xor),
            StencilOp::Binop(Opcode::Mul),
            StencilOp::Binop(Opcode::SDiv),
            StencilOp::Binop(Opcode::SRem),
            StencilOp::Binop(Opcode::Shl),
            StencilOp::Binop(Opcode::Lshr),
            StencilOp::Binop(Opcode::Ashr),
            StencilOp::Ret,
            StencilOp::RetVoid,
            StencilOp::Prologue,
            StencilOp::StoreParam(0),
            StencilOp::StoreParam(1),
            StencilOp::StoreParam(2),
            StencilOp::StoreParam(3),
            StencilOp::StoreParam(4),
            StencilOp::StoreParam(5),
            StencilOp::ImmMaterialize,
            StencilOp::AddRetSuper,
        ];
        for op in ops {
            table.insert(op, Stencil::scan(template_for(op), sentinels_for(op)));
        }
        table
    })
}

/// Whether every instruction in `func` is one this path knows how to
/// emit (spec §4.9 applicability criteria).
pub fn is_applicable(func: &Function, finalized: &FinalizedFunction) -> bool {
    if func.is_decl || func.block_order.len() != 1 {
        return false;
    }
    if func.param_types.len() > 6 {
        return false;
    }
    if !matches!(func.ty, Type::I32 | Type::I64) && func.ty != Type::Void {
        return false;
    }
    for inst in &finalized.linear_insts {
        let op_ok = matches!(
            inst.opcode,
            Opcode::Ret
                | Opcode::RetVoid
                | Opcode::Add
                | Opcode::Sub
                | Opcode::And
                | Opcode::Or
                | Opcode::Xor
                | Opcode::Mul
                | Opcode::SDiv
                | Opcode::SRem
                | Opcode::Shl
                | Opcode::Lshr
                | Opcode::Ashr
        );
        if !op_ok {
            return false;
        }
        if !matches!(inst.ty, Type::I32 | Type::I64 | Type::Void) {
            return false;
        }
        for operand in &inst.operands {
            if !matches!(operand, Operand::VReg(..) | Operand::ImmI64(..)) {
                return false;
            }
        }
    }
    true
}

/// Compile `func` via the stencil path, or return `Ok(None)` if it
/// isn't applicable (callers fall back to [`crate::isa::x86_64`]).
pub fn try_compile(func: &Function) -> CodegenResult<Option<CompiledFunction>> {
    let finalized = func
        .finalized()
        .ok_or_else(|| CodegenError::state("function must be finalized before codegen"))?;
    if !is_applicable(func, finalized) {
        return Ok(None);
    }

    let frame = StackFrame::build(func, finalized, 8);
    let table = stencil_table();
    let mut buf = CodeBuffer::new();

    // Immediates materialize into fresh slots below every vreg's own
    // slot; reserve one 8-byte slot per immediate operand up front so
    // the prologue can allocate the whole frame in a single `sub rsp`.
    let imm_slots = count_imm_operands(&finalized.linear_insts);
    let frame_size = align_up(frame.total_size + imm_slots * 8, 16);
    let mut next_imm_slot = -(frame.total_size as i32);

    table[&StencilOp::Prologue].emit_patched(&mut buf.data, &[(IMM, frame_size as i32)]);
    for (i, &pv) in func.param_vregs.iter().enumerate() {
        table[&StencilOp::StoreParam(i as u8)]
            .emit_patched(&mut buf.data, &[(DEST, frame.vreg_offset(pv))]);
    }

    let insts = &finalized.linear_insts;
    let mut i = 0;
    while i < insts.len() {
        let inst = &insts[i];
        // Fuse `add` immediately followed by `ret` of its own result.
        if inst.opcode == Opcode::Add {
            if let (Some(src0), Some(src1)) = (operand_vreg_offset(&inst.operands[0], &frame), operand_vreg_offset(&inst.operands[1], &frame)) {
                if let Some(next) = insts.get(i + 1) {
                    if next.opcode == Opcode::Ret
                        && next.operands[0].as_vreg() == Some(inst.dest)
                    {
                        table[&StencilOp::AddRetSuper]
                            .emit_patched(&mut buf.data, &[(SRC0, src0), (SRC1, src1)]);
                        i += 2;
                        continue;
                    }
                }
            }
        }

        match inst.opcode {
            Opcode::Ret => {
                let src0 = materialize_operand(&mut buf.data, table, &frame, &inst.operands[0], &mut next_imm_slot);
                table[&StencilOp::Ret].emit_patched(&mut buf.data, &[(SRC0, src0)]);
            }
            Opcode::RetVoid => {
                table[&StencilOp::RetVoid].emit_patched(&mut buf.data, &[]);
            }
            _ => {
                let src0 = materialize_operand(&mut buf.data, table, &frame, &inst.operands[0], &mut next_imm_slot);
                let src1 = materialize_operand(&mut buf.data, table, &frame, &inst.operands[1], &mut next_imm_slot);
                let dest = frame.vreg_offset(inst.dest);
                table[&StencilOp::Binop(inst.opcode)]
                    .emit_patched(&mut buf.data, &[(SRC0, src0), (SRC1, src1), (DEST, dest)]);
            }
        }
        i += 1;
    }

    Ok(Some(CompiledFunction {
        code: buf.data,
        relocs: buf.relocs,
        frame_size,
    }))
}

fn operand_vreg_offset(op: &Operand, frame: &StackFrame) -> Option<i32> {
    op.as_vreg().map(|v| frame.vreg_offset(v))
}

fn align_up(n: u32, align: u32) -> u32 {
    (n + align - 1) / align * align
}

/// Count how many operand positions across `insts` will need an
/// immediate materialized into its own slot, so the prologue can
/// reserve that space up front instead of growing the frame mid-body.
fn count_imm_operands(insts: &[crate::ir::Instruction]) -> u32 {
    insts
        .iter()
        .flat_map(|inst| inst.operands.iter())
        .filter(|op| matches!(op, Operand::ImmI64(..)))
        .count() as u32
}

/// Return the stack offset holding `op`'s value, materializing
/// immediates into a fresh scratch slot first (spec §4.9: "the parser
/// guarantees immediates fit when this path is chosen"). `next_imm_slot`
/// walks downward through the space `count_imm_operands` reserved.
fn materialize_operand(
    out: &mut Vec<u8>,
    table: &HashMap<StencilOp, Stencil>,
    frame: &StackFrame,
    op: &Operand,
    next_imm_slot: &mut i32,
) -> i32 {
    match op {
        Operand::VReg(v, _) => frame.vreg_offset(*v),
        Operand::ImmI64(v, _) => {
            *next_imm_slot -= 8;
            let slot = *next_imm_slot;
            table[&StencilOp::ImmMaterialize].emit_patched(out, &[(DEST, slot), (IMM, *v as i32)]);
            slot
        }
        _ => unreachable!("is_applicable already rejected non-vreg, non-immediate operands"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::finalize::finalize;
    use crate::ir::{Instruction, Operand, Type, VReg};

    #[test]
    fn simple_add_ret_is_applicable_and_ends_in_ret() {
        let mut f = Function::declare("add", Type::I64, vec![Type::I64, Type::I64]);
        f.is_decl = false;
        let entry = f.create_block("entry");
        let (p0, p1) = (f.param_vregs[0], f.param_vregs[1]);
        let d = f.alloc_vreg();
        f.emit(
            entry,
            Instruction::new(Opcode::Add, Type::I64, d, &[Operand::VReg(p0, Type::I64), Operand::VReg(p1, Type::I64)]),
        );
        f.emit(entry, Instruction::new(Opcode::Ret, Type::I64, VReg::NONE, &[Operand::VReg(d, Type::I64)]));
        finalize(&mut f);
        let compiled = try_compile(&f).unwrap().expect("stencil path should accept this function");
        assert_eq!(*compiled.code.last().unwrap(), 0xC3);
    }

    #[test]
    fn call_is_not_applicable() {
        let mut f = Function::declare("f", Type::I64, vec![]);
        f.is_decl = false;
        let entry = f.create_block("entry");
        let callee = f.alloc_vreg();
        f.emit(entry, Instruction::new(Opcode::Alloca, Type::I64, callee, &[]));
        f.emit(entry, Instruction::new(Opcode::RetVoid, Type::Void, VReg::NONE, &[]));
        finalize(&mut f);
        assert!(try_compile(&f).unwrap().is_none());
    }

    /// Every sentinel is a patch site the emitter fills in with exactly
    /// one offset/immediate; a template with the same sentinel stamped
    /// twice would silently patch only one of the two occurrences.
    #[test]
    fn every_stencil_has_at_most_one_occurrence_of_each_sentinel() {
        for stencil in stencil_table().values() {
            for (sentinel, hits) in &stencil.positions {
                assert!(
                    hits.len() <= 1,
                    "sentinel {sentinel:#x} appears {} times in one stencil",
                    hits.len()
                );
            }
        }
    }
}
