//! AArch64 instruction selection and encoding (spec §4.7).
//!
//! Same stack-slot discipline as the x86_64 backend (see
//! `crate::isa` module docs), but AArch64 has plenty of integer
//! registers and a fixed 32-bit instruction width, so floating point
//! goes through the same bit-pattern helper trampolines as x86_64
//! rather than native FP instructions — consistency across backends
//! matters more here than using `fadd d0, d1, d2` would have saved.
//!
//! Frame-slot addressing always materializes an absolute address in a
//! scratch register via `ADD`/`SUB` (immediate) rather than emitting
//! `LDUR`/`STUR` with a raw signed 9-bit displacement, so frames
//! larger than +/-256 bytes still work; the immediate form itself is
//! limited to a 12-bit displacement (4095 bytes), comfortably enough
//! for the functions this compiler targets.

use crate::binemit::CodeBuffer;
use crate::ir::{Function, ICmpPredicate, Opcode, Operand};
use crate::isa::x86_64::helpers;
use crate::isa::{CompiledFunction, StackFrame, TargetIsa};
use crate::phi::apply_phi_copies;
use crate::result::{CodegenError, CodegenResult};

const FP: u32 = 29;
const LR: u32 = 30;
const SP: u32 = 31;
const SCRATCH0: u32 = 9; // x9: value scratch (left operand / result)
const SCRATCH1: u32 = 10; // x10: value scratch (right operand)
const ADDR: u32 = 11; // x11: address scratch
const CALL_TARGET: u32 = 16; // x16 (ip0): indirect call target

const ARG_REGS: [u32; 8] = [0, 1, 2, 3, 4, 5, 6, 7];

pub struct Aarch64Isa;

impl Aarch64Isa {
    pub fn new() -> Self {
        Aarch64Isa
    }
}

impl Default for Aarch64Isa {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetIsa for Aarch64Isa {
    fn name(&self) -> &'static str {
        "aarch64"
    }

    fn pointer_size(&self) -> u32 {
        8
    }

    fn compile_function(&self, func: &Function) -> CodegenResult<CompiledFunction> {
        let finalized = func
            .finalized()
            .ok_or_else(|| CodegenError::state("function must be finalized before codegen"))?;
        let resolved = apply_phi_copies(func, finalized);
        let frame = StackFrame::build(func, &resolved, 8);

        let mut buf = CodeBuffer::new();
        let mut branches: Vec<PendingBranch> = Vec::new();
        emit_prologue(&mut buf, func, &frame);
        for (i, &block) in resolved.block_array.iter().enumerate() {
            buf.mark_block(block);
            for inst in resolved.block_slice(i) {
                lower_inst(&mut buf, &frame, inst, &mut branches)?;
            }
        }
        for fx in &branches {
            let target_off = buf.block_offsets[fx.target] as i64;
            let imm_words = (target_off - fx.at as i64) / 4;
            let word = match fx.kind {
                PendingKind::B => 0x14000000u32 | (imm_words as u32 & 0x3FF_FFFF),
                PendingKind::Cbnz(reg) => {
                    0xB5000000u32 | reg | (((imm_words as u32) & 0x7_FFFF) << 5)
                }
            };
            let at = fx.at as usize;
            buf.data[at..at + 4].copy_from_slice(&word.to_le_bytes());
        }

        Ok(CompiledFunction {
            code: buf.data,
            relocs: buf.relocs,
            frame_size: frame.total_size,
        })
    }
}

// ---- raw encoding helpers ----------------------------------------------

fn w32(buf: &mut CodeBuffer, instr: u32) {
    buf.put4_le(instr);
}

fn add_sub_imm(buf: &mut CodeBuffer, sub: bool, rd: u32, rn: u32, imm12: u32) {
    let base = if sub { 0xD1000000 } else { 0x91000000 };
    w32(buf, base | (imm12 << 10) | (rn << 5) | rd);
}

fn mov_reg(buf: &mut CodeBuffer, rd: u32, rm: u32) {
    // ORR Xd, XZR, Xm
    w32(buf, 0xAA0003E0 | (rm << 16) | rd);
}

fn movz(buf: &mut CodeBuffer, rd: u32, imm16: u16, hw: u32) {
    w32(buf, 0xD2800000 | (hw << 21) | ((imm16 as u32) << 5) | rd);
}
fn movk(buf: &mut CodeBuffer, rd: u32, imm16: u16, hw: u32) {
    w32(buf, 0xF2800000 | (hw << 21) | ((imm16 as u32) << 5) | rd);
}

/// Load a full 64-bit immediate into `rd`.
fn mov_imm64(buf: &mut CodeBuffer, rd: u32, imm: i64) {
    let bits = imm as u64;
    movz(buf, rd, bits as u16, 0);
    movk(buf, rd, (bits >> 16) as u16, 1);
    movk(buf, rd, (bits >> 32) as u16, 2);
    movk(buf, rd, (bits >> 48) as u16, 3);
}

fn ldr_imm0(buf: &mut CodeBuffer, rt: u32, rn: u32) {
    w32(buf, 0xF9400000 | (rn << 5) | rt);
}
fn str_imm0(buf: &mut CodeBuffer, rt: u32, rn: u32) {
    w32(buf, 0xF9000000 | (rn << 5) | rt);
}

/// Materialize the absolute address of frame-pointer-relative `disp`
/// into `rd`.
fn compute_addr(buf: &mut CodeBuffer, rd: u32, disp: i32) {
    if disp >= 0 {
        add_sub_imm(buf, false, rd, FP, disp as u32);
    } else {
        add_sub_imm(buf, true, rd, FP, (-disp) as u32);
    }
}

/// `compute_addr` into the shared `ADDR` scratch register, for the
/// common case of a plain slot load/store.
fn frame_addr(buf: &mut CodeBuffer, disp: i32) {
    compute_addr(buf, ADDR, disp)
}

fn load_slot(buf: &mut CodeBuffer, rt: u32, disp: i32) {
    frame_addr(buf, disp);
    ldr_imm0(buf, rt, ADDR);
}
fn store_slot(buf: &mut CodeBuffer, rt: u32, disp: i32) {
    frame_addr(buf, disp);
    str_imm0(buf, rt, ADDR);
}

fn rrr(buf: &mut CodeBuffer, base: u32, rd: u32, rn: u32, rm: u32) {
    w32(buf, base | (rm << 16) | (rn << 5) | rd);
}

fn add_r(buf: &mut CodeBuffer, rd: u32, rn: u32, rm: u32) {
    rrr(buf, 0x8B000000, rd, rn, rm);
}
fn sub_r(buf: &mut CodeBuffer, rd: u32, rn: u32, rm: u32) {
    rrr(buf, 0xCB000000, rd, rn, rm);
}
fn and_r(buf: &mut CodeBuffer, rd: u32, rn: u32, rm: u32) {
    rrr(buf, 0x8A000000, rd, rn, rm);
}
fn orr_r(buf: &mut CodeBuffer, rd: u32, rn: u32, rm: u32) {
    rrr(buf, 0xAA000000, rd, rn, rm);
}
fn eor_r(buf: &mut CodeBuffer, rd: u32, rn: u32, rm: u32) {
    rrr(buf, 0xCA000000, rd, rn, rm);
}
fn mul_r(buf: &mut CodeBuffer, rd: u32, rn: u32, rm: u32) {
    w32(buf, 0x9B007C00 | (rm << 16) | (rn << 5) | rd); // madd rd, rn, rm, xzr
}
fn sdiv_r(buf: &mut CodeBuffer, rd: u32, rn: u32, rm: u32) {
    rrr(buf, 0x9AC00C00, rd, rn, rm);
}
fn udiv_r(buf: &mut CodeBuffer, rd: u32, rn: u32, rm: u32) {
    rrr(buf, 0x9AC00800, rd, rn, rm);
}
fn lslv(buf: &mut CodeBuffer, rd: u32, rn: u32, rm: u32) {
    rrr(buf, 0x9AC02000, rd, rn, rm);
}
fn lsrv(buf: &mut CodeBuffer, rd: u32, rn: u32, rm: u32) {
    rrr(buf, 0x9AC02400, rd, rn, rm);
}
fn asrv(buf: &mut CodeBuffer, rd: u32, rn: u32, rm: u32) {
    rrr(buf, 0x9AC02800, rd, rn, rm);
}
fn cmp_r(buf: &mut CodeBuffer, rn: u32, rm: u32) {
    w32(buf, 0xEB00001F | (rm << 16) | (rn << 5)); // subs xzr, rn, rm
}

/// `cset rd, cond`. AArch64 encodes the *inverted* condition; flipping
/// the low bit of a standard A64 condition code is exactly that
/// inversion (`eq`<->`ne`, `lt`<->`ge`, ... — true for every code but
/// `al`/`nv`, which `cset` never uses).
fn cset(buf: &mut CodeBuffer, rd: u32, cond: u32) {
    let inv = cond ^ 1;
    w32(buf, 0x9A9F07E0 | (inv << 12) | rd);
}

fn icmp_cond(pred: ICmpPredicate) -> u32 {
    match pred {
        ICmpPredicate::Eq => 0x0,
        ICmpPredicate::Ne => 0x1,
        ICmpPredicate::Ult => 0x3, // lo
        ICmpPredicate::Uge => 0x2, // hs
        ICmpPredicate::Ugt => 0x8, // hi
        ICmpPredicate::Ule => 0x9, // ls
        ICmpPredicate::Slt => 0xB, // lt
        ICmpPredicate::Sge => 0xA, // ge
        ICmpPredicate::Sgt => 0xC, // gt
        ICmpPredicate::Sle => 0xD, // le
    }
}

/// A branch whose target block wasn't known yet when it was encoded;
/// `at` is the byte offset of the 4-byte instruction word to patch
/// once every block's address is known.
struct PendingBranch {
    at: u32,
    target: crate::ir::BlockId,
    kind: PendingKind,
}

enum PendingKind {
    /// Unconditional `B`.
    B,
    /// `CBNZ <reg>, target`.
    Cbnz(u32),
}

fn emit_prologue(buf: &mut CodeBuffer, func: &Function, frame: &StackFrame) {
    w32(buf, 0xA9BF7BFD); // stp x29, x30, [sp, -16]!
    add_sub_imm(buf, false, FP, SP, 0); // mov x29, sp
    if frame.total_size > 0 {
        // sub sp, sp, #imm (imm12 only; scope-limited frame size, see module docs)
        add_sub_imm(buf, true, SP, SP, frame.total_size);
    }
    for (i, &pv) in func.param_vregs.iter().enumerate().take(ARG_REGS.len()) {
        store_slot(buf, ARG_REGS[i], frame.vreg_offset(pv));
    }
}

fn emit_epilogue(buf: &mut CodeBuffer, frame: &StackFrame) {
    if frame.total_size > 0 {
        add_sub_imm(buf, false, SP, SP, frame.total_size);
    }
    w32(buf, 0xA8C17BFD); // ldp x29, x30, [sp], 16
    w32(buf, 0xD65F03C0); // ret
}

fn load_operand(buf: &mut CodeBuffer, frame: &StackFrame, op: &Operand, reg: u32) -> CodegenResult<()> {
    match op {
        Operand::VReg(v, _) => load_slot(buf, reg, frame.vreg_offset(*v)),
        Operand::ImmI64(v, _) => mov_imm64(buf, reg, *v),
        Operand::Null(_) | Operand::Undef(_) => mov_imm64(buf, reg, 0),
        Operand::ImmF64(v, _) => mov_imm64(buf, reg, v.to_bits() as i64),
        Operand::BlockRef(_) => return Err(CodegenError::backend("block operand used as a value")),
        Operand::GlobalRef { .. } => {
            return Err(CodegenError::backend(
                "unresolved global reference reached aarch64 instruction selection",
            ))
        }
    }
    Ok(())
}

fn lower_inst(
    buf: &mut CodeBuffer,
    frame: &StackFrame,
    inst: &crate::ir::Instruction,
    branches: &mut Vec<PendingBranch>,
) -> CodegenResult<()> {
    use Opcode::*;
    let dest_off = if inst.dest.is_none() { 0 } else { frame.vreg_offset(inst.dest) };

    match inst.opcode {
        Add | Sub | And | Or | Xor | Mul | SDiv | UDiv | Shl | Ashr | Lshr => {
            load_operand(buf, frame, &inst.operands[0], SCRATCH0)?;
            load_operand(buf, frame, &inst.operands[1], SCRATCH1)?;
            match inst.opcode {
                Add => add_r(buf, SCRATCH0, SCRATCH0, SCRATCH1),
                Sub => sub_r(buf, SCRATCH0, SCRATCH0, SCRATCH1),
                And => and_r(buf, SCRATCH0, SCRATCH0, SCRATCH1),
                Or => orr_r(buf, SCRATCH0, SCRATCH0, SCRATCH1),
                Xor => eor_r(buf, SCRATCH0, SCRATCH0, SCRATCH1),
                Mul => mul_r(buf, SCRATCH0, SCRATCH0, SCRATCH1),
                SDiv => sdiv_r(buf, SCRATCH0, SCRATCH0, SCRATCH1),
                UDiv => udiv_r(buf, SCRATCH0, SCRATCH0, SCRATCH1),
                Shl => lslv(buf, SCRATCH0, SCRATCH0, SCRATCH1),
                Lshr => lsrv(buf, SCRATCH0, SCRATCH0, SCRATCH1),
                Ashr => asrv(buf, SCRATCH0, SCRATCH0, SCRATCH1),
                _ => unreachable!(),
            }
            store_slot(buf, SCRATCH0, dest_off);
        }
        SRem | URem => {
            load_operand(buf, frame, &inst.operands[0], SCRATCH0)?;
            load_operand(buf, frame, &inst.operands[1], SCRATCH1)?;
            if inst.opcode == SRem {
                sdiv_r(buf, ADDR, SCRATCH0, SCRATCH1);
            } else {
                udiv_r(buf, ADDR, SCRATCH0, SCRATCH1);
            }
            mul_r(buf, ADDR, ADDR, SCRATCH1);
            sub_r(buf, SCRATCH0, SCRATCH0, ADDR);
            store_slot(buf, SCRATCH0, dest_off);
        }
        ICmp(pred) => {
            load_operand(buf, frame, &inst.operands[0], SCRATCH0)?;
            load_operand(buf, frame, &inst.operands[1], SCRATCH1)?;
            cmp_r(buf, SCRATCH0, SCRATCH1);
            cset(buf, SCRATCH0, icmp_cond(pred));
            store_slot(buf, SCRATCH0, dest_off);
        }
        FAdd | FSub | FMul | FDiv | FNeg | FCmp(_) | SiToFp | UiToFp | FpToSi | FpToUi => {
            lower_fp_via_helper(buf, frame, inst)?;
        }
        Load => {
            load_operand(buf, frame, &inst.operands[0], SCRATCH0)?;
            ldr_imm0(buf, SCRATCH0, SCRATCH0);
            store_slot(buf, SCRATCH0, dest_off);
        }
        Store => {
            load_operand(buf, frame, &inst.operands[0], SCRATCH0)?;
            load_operand(buf, frame, &inst.operands[1], SCRATCH1)?;
            str_imm0(buf, SCRATCH0, SCRATCH1);
        }
        Alloca => {
            compute_addr(buf, SCRATCH0, frame.alloca_storage_offset(inst.dest));
            store_slot(buf, SCRATCH0, dest_off);
        }
        Gep => {
            let (const_offset, scaled) = crate::isa::gep_offset_plan(&inst.ty, &inst.operands[1..])?;
            load_operand(buf, frame, &inst.operands[0], SCRATCH0)?;
            for (idx, stride) in scaled {
                load_operand(buf, frame, idx, SCRATCH1)?;
                mov_imm64(buf, ADDR, stride as i64);
                mul_r(buf, SCRATCH1, SCRATCH1, ADDR);
                add_r(buf, SCRATCH0, SCRATCH0, SCRATCH1);
            }
            if const_offset != 0 {
                mov_imm64(buf, ADDR, const_offset);
                add_r(buf, SCRATCH0, SCRATCH0, ADDR);
            }
            store_slot(buf, SCRATCH0, dest_off);
        }
        Br => {
            let target = inst.operands[0]
                .as_block()
                .ok_or_else(|| CodegenError::backend("br operand is not a block"))?;
            branches.push(PendingBranch { at: buf.offset(), target, kind: PendingKind::B });
            w32(buf, 0); // placeholder, patched once every block's offset is known
        }
        CondBr => {
            load_operand(buf, frame, &inst.operands[0], SCRATCH0)?;
            let t = inst.operands[1]
                .as_block()
                .ok_or_else(|| CodegenError::backend("condbr true-target is not a block"))?;
            let f = inst.operands[2]
                .as_block()
                .ok_or_else(|| CodegenError::backend("condbr false-target is not a block"))?;
            branches.push(PendingBranch { at: buf.offset(), target: t, kind: PendingKind::Cbnz(SCRATCH0) });
            w32(buf, 0);
            branches.push(PendingBranch { at: buf.offset(), target: f, kind: PendingKind::B });
            w32(buf, 0);
        }
        Ret => {
            load_operand(buf, frame, &inst.operands[0], 0)?;
            emit_epilogue(buf, frame);
        }
        RetVoid => emit_epilogue(buf, frame),
        Unreachable => w32(buf, 0xD4200000), // brk #0
        Sext | Zext => {
            load_operand(buf, frame, &inst.operands[0], SCRATCH0)?;
            if let Some(bits) = inst.operands[0].ty().int_bits() {
                if bits < 64 {
                    // Sign/zero-extend via the same shift-left-then-shift-right
                    // trick the x86_64 backend uses, expressed with the
                    // register-shift-variable forms so the amount is just
                    // another immediate load rather than a new encoding.
                    let shift = (64 - bits) as i64;
                    mov_imm64(buf, ADDR, shift);
                    lslv(buf, SCRATCH0, SCRATCH0, ADDR);
                    if inst.opcode == Sext {
                        asrv(buf, SCRATCH0, SCRATCH0, ADDR);
                    } else {
                        lsrv(buf, SCRATCH0, SCRATCH0, ADDR);
                    }
                }
            }
            store_slot(buf, SCRATCH0, dest_off);
        }
        Trunc | Bitcast | IntToPtr | PtrToInt | FpExt | FpTrunc | Copy => {
            load_operand(buf, frame, &inst.operands[0], SCRATCH0)?;
            store_slot(buf, SCRATCH0, dest_off);
        }
        Select => {
            load_operand(buf, frame, &inst.operands[0], SCRATCH0)?;
            load_operand(buf, frame, &inst.operands[1], SCRATCH1)?;
            load_operand(buf, frame, &inst.operands[2], ADDR)?;
            cmp_r(buf, SCRATCH0, 31); // cmp x9, xzr (register-form rm=31 means xzr)
            // csel x9, scratch1 (true), addr (false), ne
            w32(buf, 0x9A800000 | (ADDR << 16) | (0x1 << 12) | (SCRATCH1 << 5) | SCRATCH0);
            store_slot(buf, SCRATCH0, dest_off);
        }
        Call => {
            for (i, arg) in inst.operands[1..].iter().take(ARG_REGS.len()).enumerate() {
                load_operand(buf, frame, arg, ARG_REGS[i])?;
            }
            load_operand(buf, frame, &inst.operands[0], CALL_TARGET)?;
            w32(buf, 0xD63F0000 | (CALL_TARGET << 5)); // blr x16
            if !inst.dest.is_none() {
                store_slot(buf, 0, dest_off);
            }
        }
        Phi => return Err(CodegenError::state("phi survived phi lowering")),
        ExtractValue | InsertValue => {
            return Err(CodegenError::backend(
                "aggregate-by-value opcodes are not supported by this target backend",
            ))
        }
    }
    Ok(())
}

/// Every floating-point opcode dispatches to the same bit-pattern
/// helpers the x86_64 backend uses (`crate::isa::x86_64::helpers`) via
/// the AAPCS64 integer argument registers, for the same reason: one
/// float implementation shared by every backend beats three.
fn lower_fp_via_helper(buf: &mut CodeBuffer, frame: &StackFrame, inst: &crate::ir::Instruction) -> CodegenResult<()> {
    use Opcode::*;
    let dest_off = if inst.dest.is_none() { 0 } else { frame.vreg_offset(inst.dest) };
    let addr = match inst.opcode {
        FAdd => helpers::liric_helper_fadd_bits as usize,
        FSub => helpers::liric_helper_fsub_bits as usize,
        FMul => helpers::liric_helper_fmul_bits as usize,
        FDiv => helpers::liric_helper_fdiv_bits as usize,
        FNeg => helpers::liric_helper_fneg_bits as usize,
        FCmp(_) => helpers::liric_helper_fcmp_bits as usize,
        SiToFp => helpers::liric_helper_sitofp_bits as usize,
        UiToFp => helpers::liric_helper_uitofp_bits as usize,
        FpToSi => helpers::liric_helper_fptosi_bits as usize,
        FpToUi => helpers::liric_helper_fptoui_bits as usize,
        _ => unreachable!(),
    };
    load_operand(buf, frame, &inst.operands[0], 0)?;
    if inst.operands.len() > 1 {
        load_operand(buf, frame, &inst.operands[1], 1)?;
    }
    if let FCmp(pred) = inst.opcode {
        mov_imm64(buf, 2, helpers::fcmp_predicate_code(pred) as i64);
    }
    mov_imm64(buf, CALL_TARGET, addr as i64);
    w32(buf, 0xD63F0000 | (CALL_TARGET << 5)); // blr x16
    store_slot(buf, 0, dest_off);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::finalize::finalize;
    use crate::ir::{Instruction, Type, VReg};

    #[test]
    fn returns_a_constant() {
        let mut f = Function::declare("ret42", Type::I64, vec![]);
        f.is_decl = false;
        let entry = f.create_block("entry");
        f.emit(
            entry,
            Instruction::new(Opcode::Ret, Type::I64, VReg::NONE, &[Operand::ImmI64(42, Type::I64)]),
        );
        finalize(&mut f);
        let compiled = Aarch64Isa::new().compile_function(&f).unwrap();
        assert_eq!(compiled.code.len() % 4, 0);
        assert_eq!(&compiled.code[compiled.code.len() - 4..], &0xD65F03C0u32.to_le_bytes());
    }
}
