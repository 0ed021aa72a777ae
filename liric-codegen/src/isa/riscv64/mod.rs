//! RISC-V 64 (RV64IM) instruction selection and encoding (spec §4.8).
//!
//! The leanest of the three backends: base RV64I integer/branch/load-
//! store instructions plus the M extension for `mul`/`div`/`rem`, the
//! same stack-slot discipline as the other two backends, and the same
//! bit-pattern float helpers (`crate::isa::x86_64::helpers`) dispatched
//! through `jalr` instead of native floating-point instructions — this
//! target has no guaranteed D extension, so routing every target
//! through the same helper functions is the conservative choice.
//!
//! RV64 has no single instruction that loads an arbitrary 64-bit
//! immediate; `li64` builds one from six 11-bit chunks (`addi` then
//! five rounds of `slli`+`addi`), which is slower than a real linker's
//! `auipc`-relative constant pool but needs no additional data section.

use crate::binemit::CodeBuffer;
use crate::ir::{Function, ICmpPredicate, Opcode, Operand};
use crate::isa::x86_64::helpers;
use crate::isa::{CompiledFunction, StackFrame, TargetIsa};
use crate::phi::apply_phi_copies;
use crate::result::{CodegenError, CodegenResult};

const ZERO: u32 = 0;
const RA: u32 = 1;
const SP: u32 = 2;
const FP: u32 = 8; // s0
const T0: u32 = 5; // scratch0 (left operand / result)
const T1: u32 = 6; // scratch1 (right operand)
const T2: u32 = 7; // address scratch
const T3: u32 = 28; // call target scratch

const ARG_REGS: [u32; 8] = [10, 11, 12, 13, 14, 15, 16, 17]; // a0-a7

pub struct Riscv64Isa;

impl Riscv64Isa {
    pub fn new() -> Self {
        Riscv64Isa
    }
}

impl Default for Riscv64Isa {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetIsa for Riscv64Isa {
    fn name(&self) -> &'static str {
        "riscv64"
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
            let target_off = buf.block_offsets[fx.target] as i32;
            let imm = target_off - fx.at as i32;
            let word = match fx.kind {
                PendingKind::Jal => encode_jal(ZERO, imm),
                PendingKind::Beq(rs1) => encode_b(0b001, rs1, ZERO, imm), // bne rs1, zero, target
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

fn r_type(funct7: u32, rs2: u32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
    (funct7 << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
}

fn i_type(imm12: i32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
    (((imm12 as u32) & 0xFFF) << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
}

fn s_type(imm12: i32, rs2: u32, rs1: u32, funct3: u32, opcode: u32) -> u32 {
    let imm = imm12 as u32 & 0xFFF;
    let hi = (imm >> 5) & 0x7F;
    let lo = imm & 0x1F;
    (hi << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | (lo << 7) | opcode
}

fn encode_b(funct3: u32, rs1: u32, rs2: u32, imm: i32) -> u32 {
    let imm = imm as u32;
    let b12 = (imm >> 12) & 1;
    let b10_5 = (imm >> 5) & 0x3F;
    let b4_1 = (imm >> 1) & 0xF;
    let b11 = (imm >> 11) & 1;
    (b12 << 31) | (b10_5 << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | (b4_1 << 8) | (b11 << 7) | 0x63
}

fn encode_jal(rd: u32, imm: i32) -> u32 {
    let imm = imm as u32;
    let b20 = (imm >> 20) & 1;
    let b10_1 = (imm >> 1) & 0x3FF;
    let b11 = (imm >> 11) & 1;
    let b19_12 = (imm >> 12) & 0xFF;
    (b20 << 31) | (b10_1 << 21) | (b11 << 20) | (b19_12 << 12) | (rd << 7) | 0x6F
}

fn addi(buf: &mut CodeBuffer, rd: u32, rs1: u32, imm12: i32) {
    w32(buf, i_type(imm12, rs1, 0b000, rd, 0x13));
}
fn slli(buf: &mut CodeBuffer, rd: u32, rs1: u32, shamt: u32) {
    w32(buf, i_type(shamt as i32, rs1, 0b001, rd, 0x13));
}
fn xori(buf: &mut CodeBuffer, rd: u32, rs1: u32, imm12: i32) {
    w32(buf, i_type(imm12, rs1, 0b100, rd, 0x13));
}
fn ld(buf: &mut CodeBuffer, rd: u32, rs1: u32, imm12: i32) {
    w32(buf, i_type(imm12, rs1, 0b011, rd, 0x03));
}
fn sd(buf: &mut CodeBuffer, rs2: u32, rs1: u32, imm12: i32) {
    w32(buf, s_type(imm12, rs2, rs1, 0b011, 0x23));
}
fn jalr(buf: &mut CodeBuffer, rd: u32, rs1: u32, imm12: i32) {
    w32(buf, i_type(imm12, rs1, 0b000, rd, 0x67));
}

fn r_op(buf: &mut CodeBuffer, funct7: u32, funct3: u32, rd: u32, rs1: u32, rs2: u32) {
    w32(buf, r_type(funct7, rs2, rs1, funct3, rd, 0x33));
}

/// Materialize an arbitrary 64-bit immediate into `rd` via six 11-bit
/// chunks (see module docs).
fn li64(buf: &mut CodeBuffer, rd: u32, imm: i64) {
    let v = imm as u64;
    let top = imm >> 55;
    addi(buf, rd, ZERO, top as i32);
    for shift in [44i64, 33, 22, 11, 0] {
        slli(buf, rd, rd, 11);
        let chunk = ((v >> shift) & 0x7FF) as i32;
        addi(buf, rd, rd, chunk);
    }
}

fn compute_addr(buf: &mut CodeBuffer, rd: u32, disp: i32) {
    // imm12-limited, see module docs; comfortably enough for the
    // small frames this compiler generates.
    addi(buf, rd, FP, disp);
}

fn load_slot(buf: &mut CodeBuffer, rt: u32, disp: i32) {
    ld(buf, rt, FP, disp);
}
fn store_slot(buf: &mut CodeBuffer, rt: u32, disp: i32) {
    sd(buf, rt, FP, disp);
}

fn icmp_seq(buf: &mut CodeBuffer, pred: ICmpPredicate, rd: u32, a: u32, b: u32) {
    match pred {
        ICmpPredicate::Slt => r_op(buf, 0, 0b010, rd, a, b),
        ICmpPredicate::Ult => r_op(buf, 0, 0b011, rd, a, b),
        ICmpPredicate::Sgt => r_op(buf, 0, 0b010, rd, b, a),
        ICmpPredicate::Ugt => r_op(buf, 0, 0b011, rd, b, a),
        ICmpPredicate::Sge => {
            r_op(buf, 0, 0b010, rd, a, b);
            xori(buf, rd, rd, 1);
        }
        ICmpPredicate::Uge => {
            r_op(buf, 0, 0b011, rd, a, b);
            xori(buf, rd, rd, 1);
        }
        ICmpPredicate::Sle => {
            r_op(buf, 0, 0b010, rd, b, a);
            xori(buf, rd, rd, 1);
        }
        ICmpPredicate::Ule => {
            r_op(buf, 0, 0b011, rd, b, a);
            xori(buf, rd, rd, 1);
        }
        ICmpPredicate::Eq => {
            r_op(buf, 0, 0b100, rd, a, b); // xor
            i_set_lt_immu1(buf, rd, rd);
        }
        ICmpPredicate::Ne => {
            r_op(buf, 0, 0b100, rd, a, b); // xor
            r_op(buf, 0, 0b011, rd, ZERO, rd); // sltu rd, zero, rd
        }
    }
}

/// `sltiu rd, rs1, 1` — `rd = (rs1 == 0) ? 1 : 0`.
fn i_set_lt_immu1(buf: &mut CodeBuffer, rd: u32, rs1: u32) {
    w32(buf, i_type(1, rs1, 0b011, rd, 0x13));
}

struct PendingBranch {
    at: u32,
    target: crate::ir::BlockId,
    kind: PendingKind,
}
enum PendingKind {
    Jal,
    /// `bne <reg>, zero, target`.
    Beq(u32),
}

fn emit_prologue(buf: &mut CodeBuffer, func: &Function, frame: &StackFrame) {
    let total = frame.total_size as i32 + 16; // +16 for the saved ra/fp pair
    addi(buf, SP, SP, -total);
    sd(buf, RA, SP, total - 8);
    sd(buf, FP, SP, total - 16);
    addi(buf, FP, SP, total);
    for (i, &pv) in func.param_vregs.iter().enumerate().take(ARG_REGS.len()) {
        store_slot(buf, ARG_REGS[i], frame.vreg_offset(pv));
    }
}

fn emit_epilogue(buf: &mut CodeBuffer, frame: &StackFrame) {
    let total = frame.total_size as i32 + 16;
    ld(buf, RA, SP, total - 8);
    ld(buf, FP, SP, total - 16);
    addi(buf, SP, SP, total);
    jalr(buf, ZERO, RA, 0);
}

fn load_operand(buf: &mut CodeBuffer, frame: &StackFrame, op: &Operand, reg: u32) -> CodegenResult<()> {
    match op {
        Operand::VReg(v, _) => load_slot(buf, reg, frame.vreg_offset(*v)),
        Operand::ImmI64(v, _) => li64(buf, reg, *v),
        Operand::Null(_) | Operand::Undef(_) => li64(buf, reg, 0),
        Operand::ImmF64(v, _) => li64(buf, reg, v.to_bits() as i64),
        Operand::BlockRef(_) => return Err(CodegenError::backend("block operand used as a value")),
        Operand::GlobalRef { .. } => {
            return Err(CodegenError::backend(
                "unresolved global reference reached riscv64 instruction selection",
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
        Add | Sub | And | Or | Xor | Mul | SDiv | UDiv | SRem | URem | Shl | Ashr | Lshr => {
            load_operand(buf, frame, &inst.operands[0], T0)?;
            load_operand(buf, frame, &inst.operands[1], T1)?;
            match inst.opcode {
                Add => r_op(buf, 0, 0b000, T0, T0, T1),
                Sub => r_op(buf, 0x20, 0b000, T0, T0, T1),
                And => r_op(buf, 0, 0b111, T0, T0, T1),
                Or => r_op(buf, 0, 0b110, T0, T0, T1),
                Xor => r_op(buf, 0, 0b100, T0, T0, T1),
                Mul => r_op(buf, 1, 0b000, T0, T0, T1),
                SDiv => r_op(buf, 1, 0b100, T0, T0, T1),
                UDiv => r_op(buf, 1, 0b101, T0, T0, T1),
                SRem => r_op(buf, 1, 0b110, T0, T0, T1),
                URem => r_op(buf, 1, 0b111, T0, T0, T1),
                Shl => r_op(buf, 0, 0b001, T0, T0, T1),
                Lshr => r_op(buf, 0, 0b101, T0, T0, T1),
                Ashr => r_op(buf, 0x20, 0b101, T0, T0, T1),
                _ => unreachable!(),
            }
            store_slot(buf, T0, dest_off);
        }
        ICmp(pred) => {
            load_operand(buf, frame, &inst.operands[0], T0)?;
            load_operand(buf, frame, &inst.operands[1], T1)?;
            icmp_seq(buf, pred, T0, T0, T1);
            store_slot(buf, T0, dest_off);
        }
        FAdd | FSub | FMul | FDiv | FNeg | FCmp(_) | SiToFp | UiToFp | FpToSi | FpToUi => {
            lower_fp_via_helper(buf, frame, inst)?;
        }
        Load => {
            load_operand(buf, frame, &inst.operands[0], T0)?;
            ld(buf, T0, T0, 0);
            store_slot(buf, T0, dest_off);
        }
        Store => {
            load_operand(buf, frame, &inst.operands[0], T0)?;
            load_operand(buf, frame, &inst.operands[1], T1)?;
            sd(buf, T0, T1, 0);
        }
        Alloca => {
            compute_addr(buf, T0, frame.alloca_storage_offset(inst.dest));
            store_slot(buf, T0, dest_off);
        }
        Gep => {
            let (const_offset, scaled) = crate::isa::gep_offset_plan(&inst.ty, &inst.operands[1..])?;
            load_operand(buf, frame, &inst.operands[0], T0)?;
            for (idx, stride) in scaled {
                load_operand(buf, frame, idx, T1)?;
                li64(buf, T2, stride as i64);
                r_op(buf, 1, 0b000, T1, T1, T2); // mul t1, t1, t2
                r_op(buf, 0, 0b000, T0, T0, T1); // add t0, t0, t1
            }
            if const_offset != 0 {
                li64(buf, T2, const_offset);
                r_op(buf, 0, 0b000, T0, T0, T2); // add t0, t0, t2
            }
            store_slot(buf, T0, dest_off);
        }
        Br => {
            let target = inst.operands[0]
                .as_block()
                .ok_or_else(|| CodegenError::backend("br operand is not a block"))?;
            branches.push(PendingBranch { at: buf.offset(), target, kind: PendingKind::Jal });
            w32(buf, 0);
        }
        CondBr => {
            load_operand(buf, frame, &inst.operands[0], T0)?;
            let t = inst.operands[1]
                .as_block()
                .ok_or_else(|| CodegenError::backend("condbr true-target is not a block"))?;
            let f = inst.operands[2]
                .as_block()
                .ok_or_else(|| CodegenError::backend("condbr false-target is not a block"))?;
            branches.push(PendingBranch { at: buf.offset(), target: t, kind: PendingKind::Beq(T0) });
            w32(buf, 0);
            branches.push(PendingBranch { at: buf.offset(), target: f, kind: PendingKind::Jal });
            w32(buf, 0);
        }
        Ret => {
            load_operand(buf, frame, &inst.operands[0], 10 /* a0 */)?;
            emit_epilogue(buf, frame);
        }
        RetVoid => emit_epilogue(buf, frame),
        Unreachable => w32(buf, 0), // illegal instruction (all-zero word traps on RV64)
        Sext | Zext => {
            load_operand(buf, frame, &inst.operands[0], T0)?;
            if let Some(bits) = inst.operands[0].ty().int_bits() {
                if bits < 64 {
                    let shift = 64 - bits;
                    slli(buf, T0, T0, shift);
                    if inst.opcode == Sext {
                        // srai: funct7=0100000, funct3=101, opcode=0x13
                        w32(buf, i_type(0x400 | shift as i32, T0, 0b101, T0, 0x13));
                    } else {
                        w32(buf, i_type(shift as i32, T0, 0b101, T0, 0x13)); // srli
                    }
                }
            }
            store_slot(buf, T0, dest_off);
        }
        Trunc | Bitcast | IntToPtr | PtrToInt | FpExt | FpTrunc | Copy => {
            load_operand(buf, frame, &inst.operands[0], T0)?;
            store_slot(buf, T0, dest_off);
        }
        Select => {
            load_operand(buf, frame, &inst.operands[0], T0)?;
            load_operand(buf, frame, &inst.operands[1], T1)?;
            load_operand(buf, frame, &inst.operands[2], T2)?;
            // beq t0, zero, +8 ; mv t2, t1 (materialized as addi t2,t1,0)
            w32(buf, encode_b(0b000, T0, ZERO, 8));
            addi(buf, T2, T1, 0);
            store_slot(buf, T2, dest_off);
        }
        Call => {
            for (i, arg) in inst.operands[1..].iter().take(ARG_REGS.len()).enumerate() {
                load_operand(buf, frame, arg, ARG_REGS[i])?;
            }
            load_operand(buf, frame, &inst.operands[0], T3)?;
            jalr(buf, RA, T3, 0);
            if !inst.dest.is_none() {
                store_slot(buf, 10, dest_off); // a0
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
    load_operand(buf, frame, &inst.operands[0], 10)?; // a0
    if inst.operands.len() > 1 {
        load_operand(buf, frame, &inst.operands[1], 11)?; // a1
    }
    if let FCmp(pred) = inst.opcode {
        li64(buf, 12 /* a2 */, helpers::fcmp_predicate_code(pred) as i64);
    }
    li64(buf, T3, addr as i64);
    jalr(buf, RA, T3, 0);
    store_slot(buf, 10, dest_off);
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
        let compiled = Riscv64Isa::new().compile_function(&f).unwrap();
        assert_eq!(compiled.code.len() % 4, 0);
        // jalr x0, 0(ra) is the trailing "ret"
        assert_eq!(&compiled.code[compiled.code.len() - 4..], &0x00008067u32.to_le_bytes());
    }
}
