//! x86_64 instruction selection and encoding (spec §4.6).
//!
//! No register allocator: every vreg reads and writes its
//! [`StackFrame`] slot directly, through `rax`/`rdx`/`rcx`/`r9`/`r10`/
//! `r11` scratch registers. Floating-point opcodes never touch `xmm*`
//! directly — see `helpers` — except at the boundary of an
//! `external_abi` call that genuinely needs one (not exercised by any
//! in-scope JIT scenario, but kept for completeness).
//!
//! The calling convention follows System V's integer register order
//! (`rdi, rsi, rdx, rcx, r8, r9`) for up to six arguments; functions
//! with more parameters, and aggregate-by-value opcodes
//! (`extractvalue`/`insertvalue`), are out of scope for this backend.

pub mod helpers;

use crate::binemit::CodeBuffer;
use crate::finalize::FinalizedFunction;
use crate::ir::{Function, ICmpPredicate, Opcode, Operand, Type, VReg};
use crate::isa::{CompiledFunction, StackFrame, TargetIsa};
use crate::phi::apply_phi_copies;
use crate::result::{CodegenError, CodegenResult};

const RAX: u8 = 0;
const RCX: u8 = 1;
const RDX: u8 = 2;
const RSP: u8 = 4;
const RBP: u8 = 5;
const RDI: u8 = 7;
const R9: u8 = 9;
const R10: u8 = 10;
const R11: u8 = 11;

const ARG_REGS: [u8; 6] = [7, 6, 2, 1, 8, 9]; // rdi, rsi, rdx, rcx, r8, r9

pub struct X86_64Isa;

impl X86_64Isa {
    pub fn new() -> Self {
        X86_64Isa
    }
}

impl Default for X86_64Isa {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetIsa for X86_64Isa {
    fn name(&self) -> &'static str {
        "x86_64"
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
        emit_prologue(&mut buf, func, &frame);
        for (i, &block) in resolved.block_array.iter().enumerate() {
            buf.mark_block(block);
            for inst in resolved.block_slice(i) {
                lower_inst(&mut buf, &frame, inst)?;
            }
        }
        buf.resolve_branches();

        Ok(CompiledFunction {
            code: buf.data,
            relocs: buf.relocs,
            frame_size: frame.total_size,
        })
    }
}

// ---- raw encoding helpers -------------------------------------------------

fn rex(w: bool, r: u8, x: u8, b: u8) -> u8 {
    0x40 | ((w as u8) << 3) | ((r & 1) << 2) | ((x & 1) << 1) | (b & 1)
}

fn reg_bit(r: u8) -> u8 {
    (r >> 3) & 1
}
fn reg_lo(r: u8) -> u8 {
    r & 7
}

/// `opcode /r` with a register-direct ModRM (`mod = 11`).
fn emit_rr(buf: &mut CodeBuffer, opcode: &[u8], reg: u8, rm: u8, w: bool) {
    buf.put1(rex(w, reg_bit(reg), 0, reg_bit(rm)));
    buf.put_bytes(opcode);
    buf.put1(0xC0 | (reg_lo(reg) << 3) | reg_lo(rm));
}

/// `opcode /digit` register-direct, for instructions whose ModRM.reg
/// field is a fixed opcode extension rather than a second register.
fn emit_ext_r(buf: &mut CodeBuffer, opcode: &[u8], ext: u8, rm: u8, w: bool) {
    buf.put1(rex(w, 0, 0, reg_bit(rm)));
    buf.put_bytes(opcode);
    buf.put1(0xC0 | (ext << 3) | reg_lo(rm));
}

/// `[rbp + disp32]` addressed ModRM (`mod = 10, rm = 101`).
fn emit_rbp_disp(buf: &mut CodeBuffer, opcode: &[u8], reg: u8, disp: i32, w: bool) {
    buf.put1(rex(w, reg_bit(reg), 0, 0));
    buf.put_bytes(opcode);
    buf.put1(0x80 | (reg_lo(reg) << 3) | 0x05);
    buf.put4_le(disp as u32);
}

/// `[base]` addressed ModRM with no displacement (`mod = 00`). Only
/// used with `base = rax`, which needs no SIB/disp special-casing.
fn emit_mem0(buf: &mut CodeBuffer, opcode: &[u8], reg: u8, base: u8, w: bool) {
    debug_assert_eq!(base, RAX);
    buf.put1(rex(w, reg_bit(reg), 0, reg_bit(base)));
    buf.put_bytes(opcode);
    buf.put1((reg_lo(reg) << 3) | reg_lo(base));
}

fn mov_imm64(buf: &mut CodeBuffer, reg: u8, imm: i64) {
    buf.put1(rex(true, 0, 0, reg_bit(reg)));
    buf.put1(0xB8 + reg_lo(reg));
    buf.put8_le(imm as u64);
}

/// `mov dst, src` (register to register).
fn mov_rr(buf: &mut CodeBuffer, dst: u8, src: u8) {
    emit_rr(buf, &[0x8B], dst, src, true);
}

fn load_mem_rbp(buf: &mut CodeBuffer, dst: u8, disp: i32) {
    emit_rbp_disp(buf, &[0x8B], dst, disp, true);
}

fn store_mem_rbp(buf: &mut CodeBuffer, disp: i32, src: u8) {
    emit_rbp_disp(buf, &[0x89], src, disp, true);
}

fn lea_rbp(buf: &mut CodeBuffer, dst: u8, disp: i32) {
    emit_rbp_disp(buf, &[0x8D], dst, disp, true);
}

fn load_mem0(buf: &mut CodeBuffer, dst: u8, base: u8) {
    emit_mem0(buf, &[0x8B], dst, base, true);
}

fn store_mem0(buf: &mut CodeBuffer, base: u8, src: u8) {
    emit_mem0(buf, &[0x89], src, base, true);
}

/// `dst (rm) <op>= src (reg)`, e.g. `add dst, src`.
fn binop_rr(buf: &mut CodeBuffer, opcode: u8, dst: u8, src: u8) {
    emit_rr(buf, &[opcode], src, dst, true);
}

fn imul_rr(buf: &mut CodeBuffer, dst: u8, src: u8) {
    emit_rr(buf, &[0x0F, 0xAF], dst, src, true);
}

fn imul_r_imm32(buf: &mut CodeBuffer, dst: u8, src: u8, imm: i32) {
    buf.put1(rex(true, reg_bit(dst), 0, reg_bit(src)));
    buf.put1(0x69);
    buf.put1(0xC0 | (reg_lo(dst) << 3) | reg_lo(src));
    buf.put4_le(imm as u32);
}

fn cqo(buf: &mut CodeBuffer) {
    buf.put1(rex(true, 0, 0, 0));
    buf.put1(0x99);
}

fn idiv_r(buf: &mut CodeBuffer, reg: u8) {
    emit_ext_r(buf, &[0xF7], 7, reg, true);
}
fn div_r(buf: &mut CodeBuffer, reg: u8) {
    emit_ext_r(buf, &[0xF7], 6, reg, true);
}

/// Immediate shift, `op dst, imm8`.
fn shift_imm8(buf: &mut CodeBuffer, ext: u8, dst: u8, imm: u8) {
    emit_ext_r(buf, &[0xC1], ext, dst, true);
    buf.put1(imm);
}

/// `cl`-counted shift, `op dst, cl`. Assumes the count is already in `cl`.
fn shift_cl(buf: &mut CodeBuffer, ext: u8, dst: u8) {
    emit_ext_r(buf, &[0xD3], ext, dst, true);
}

fn test_rr(buf: &mut CodeBuffer, reg: u8) {
    emit_rr(buf, &[0x85], reg, reg, true);
}

fn setcc(buf: &mut CodeBuffer, cc: u8, reg: u8) {
    buf.put1(rex(false, 0, 0, reg_bit(reg)));
    buf.put1(0x0F);
    buf.put1(0x90 + cc);
    buf.put1(0xC0 | reg_lo(reg));
}

fn movzx8(buf: &mut CodeBuffer, dst: u8, src: u8) {
    emit_rr(buf, &[0x0F, 0xB6], dst, src, true);
}

fn call_r(buf: &mut CodeBuffer, reg: u8) {
    emit_ext_r(buf, &[0xFF], 2, reg, false);
}

fn push_r(buf: &mut CodeBuffer, reg: u8) {
    if reg_bit(reg) != 0 {
        buf.put1(rex(false, 0, 0, 1));
    }
    buf.put1(0x50 + reg_lo(reg));
}
fn pop_r(buf: &mut CodeBuffer, reg: u8) {
    if reg_bit(reg) != 0 {
        buf.put1(rex(false, 0, 0, 1));
    }
    buf.put1(0x58 + reg_lo(reg));
}

fn sub_rsp_imm32(buf: &mut CodeBuffer, imm: u32) {
    emit_ext_r(buf, &[0x81], 5, RSP, true);
    buf.put4_le(imm);
}

fn xor_eax_eax(buf: &mut CodeBuffer) {
    buf.put1(0x31);
    buf.put1(0xC0);
}

fn patch_rel32(buf: &mut CodeBuffer, at: u32, target: u32) {
    let rel = target as i64 - (at as i64 + 4);
    let bytes = (rel as i32).to_le_bytes();
    let at = at as usize;
    buf.data[at..at + 4].copy_from_slice(&bytes);
}

fn call_helper(buf: &mut CodeBuffer, addr: usize) {
    mov_imm64(buf, R10, addr as i64);
    call_r(buf, R10);
}

fn icmp_cc(pred: ICmpPredicate) -> u8 {
    match pred {
        ICmpPredicate::Eq => 0x4,
        ICmpPredicate::Ne => 0x5,
        ICmpPredicate::Slt => 0xC,
        ICmpPredicate::Sle => 0xE,
        ICmpPredicate::Sgt => 0xF,
        ICmpPredicate::Sge => 0xD,
        ICmpPredicate::Ult => 0x2,
        ICmpPredicate::Ule => 0x6,
        ICmpPredicate::Ugt => 0x7,
        ICmpPredicate::Uge => 0x3,
    }
}

// ---- ISel -------------------------------------------------------------

fn emit_prologue(buf: &mut CodeBuffer, func: &Function, frame: &StackFrame) {
    push_r(buf, RBP);
    mov_rr(buf, RBP, RSP);
    if frame.total_size > 0 {
        sub_rsp_imm32(buf, frame.total_size);
    }
    for (i, &pv) in func.param_vregs.iter().enumerate().take(ARG_REGS.len()) {
        store_mem_rbp(buf, frame.vreg_offset(pv), ARG_REGS[i]);
    }
}

fn emit_epilogue(buf: &mut CodeBuffer) {
    mov_rr(buf, RSP, RBP);
    pop_r(buf, RBP);
    buf.put1(0xC3);
}

fn load_operand(buf: &mut CodeBuffer, frame: &StackFrame, op: &Operand, reg: u8) -> CodegenResult<()> {
    match op {
        Operand::VReg(v, _) => load_mem_rbp(buf, reg, frame.vreg_offset(*v)),
        Operand::ImmI64(v, _) => mov_imm64(buf, reg, *v),
        Operand::Null(_) | Operand::Undef(_) => mov_imm64(buf, reg, 0),
        Operand::ImmF64(v, _) => mov_imm64(buf, reg, v.to_bits() as i64),
        Operand::BlockRef(_) => return Err(CodegenError::backend("block operand used as a value")),
        Operand::GlobalRef { .. } => {
            return Err(CodegenError::backend(
                "unresolved global reference reached x86_64 instruction selection",
            ))
        }
    }
    Ok(())
}

/// Sign- or zero-extend a sub-64-bit integer value already loaded into
/// `reg`, per its operand's declared width (spec's "arithmetic laws"
/// never mandate a representation, but `ret`/`call` ABI boundaries
/// need the high bits correct).
fn extend_in_place(buf: &mut CodeBuffer, reg: u8, bits: u32, signed: bool) {
    if bits >= 64 {
        return;
    }
    let shift = (64 - bits) as u8;
    shift_imm8(buf, 4, reg, shift); // shl reg, shift
    shift_imm8(buf, if signed { 7 } else { 5 }, reg, shift); // sar/shr reg, shift
}

fn lower_inst(
    buf: &mut CodeBuffer,
    frame: &StackFrame,
    inst: &crate::ir::Instruction,
) -> CodegenResult<()> {
    use Opcode::*;
    let dest_off = if inst.dest.is_none() { 0 } else { frame.vreg_offset(inst.dest) };

    match inst.opcode {
        Add | Sub | And | Or | Xor | Mul => {
            load_operand(buf, frame, &inst.operands[0], RAX)?;
            load_operand(buf, frame, &inst.operands[1], RDX)?;
            match inst.opcode {
                Add => binop_rr(buf, 0x01, RAX, RDX),
                Sub => binop_rr(buf, 0x29, RAX, RDX),
                And => binop_rr(buf, 0x21, RAX, RDX),
                Or => binop_rr(buf, 0x09, RAX, RDX),
                Xor => binop_rr(buf, 0x31, RAX, RDX),
                Mul => imul_rr(buf, RAX, RDX),
                _ => unreachable!(),
            }
            store_mem_rbp(buf, dest_off, RAX);
        }
        SDiv | SRem | UDiv | URem => {
            load_operand(buf, frame, &inst.operands[0], RAX)?;
            load_operand(buf, frame, &inst.operands[1], R9)?;
            let result_in_rdx = matches!(inst.opcode, SRem | URem);
            match inst.opcode {
                SDiv | SRem => {
                    cqo(buf);
                    idiv_r(buf, R9);
                }
                UDiv | URem => {
                    // xor edx, edx
                    buf.put1(0x31);
                    buf.put1(0xD2);
                    div_r(buf, R9);
                }
                _ => unreachable!(),
            }
            store_mem_rbp(buf, dest_off, if result_in_rdx { RDX } else { RAX });
        }
        Shl | Ashr | Lshr => {
            load_operand(buf, frame, &inst.operands[0], RAX)?;
            load_operand(buf, frame, &inst.operands[1], RCX)?;
            let ext = match inst.opcode {
                Shl => 4,
                Lshr => 5,
                Ashr => 7,
                _ => unreachable!(),
            };
            shift_cl(buf, ext, RAX);
            store_mem_rbp(buf, dest_off, RAX);
        }
        ICmp(pred) => {
            load_operand(buf, frame, &inst.operands[0], RAX)?;
            load_operand(buf, frame, &inst.operands[1], RDX)?;
            binop_rr(buf, 0x39, RAX, RDX); // cmp rax, rdx
            setcc(buf, icmp_cc(pred), RAX);
            movzx8(buf, RAX, RAX);
            store_mem_rbp(buf, dest_off, RAX);
        }
        FAdd | FSub | FMul | FDiv => {
            load_operand(buf, frame, &inst.operands[0], RDI)?;
            load_operand(buf, frame, &inst.operands[1], 6 /* rsi */)?;
            let addr = match inst.opcode {
                FAdd => helpers::liric_helper_fadd_bits as usize,
                FSub => helpers::liric_helper_fsub_bits as usize,
                FMul => helpers::liric_helper_fmul_bits as usize,
                FDiv => helpers::liric_helper_fdiv_bits as usize,
                _ => unreachable!(),
            };
            call_helper(buf, addr);
            store_mem_rbp(buf, dest_off, RAX);
        }
        FNeg => {
            load_operand(buf, frame, &inst.operands[0], RDI)?;
            call_helper(buf, helpers::liric_helper_fneg_bits as usize);
            store_mem_rbp(buf, dest_off, RAX);
        }
        FCmp(pred) => {
            load_operand(buf, frame, &inst.operands[0], RDI)?;
            load_operand(buf, frame, &inst.operands[1], 6)?;
            mov_imm64(buf, RDX, helpers::fcmp_predicate_code(pred) as i64);
            call_helper(buf, helpers::liric_helper_fcmp_bits as usize);
            store_mem_rbp(buf, dest_off, RAX);
        }
        SiToFp => {
            load_operand(buf, frame, &inst.operands[0], RDI)?;
            call_helper(buf, helpers::liric_helper_sitofp_bits as usize);
            store_mem_rbp(buf, dest_off, RAX);
        }
        UiToFp => {
            load_operand(buf, frame, &inst.operands[0], RDI)?;
            call_helper(buf, helpers::liric_helper_uitofp_bits as usize);
            store_mem_rbp(buf, dest_off, RAX);
        }
        FpToSi => {
            load_operand(buf, frame, &inst.operands[0], RDI)?;
            call_helper(buf, helpers::liric_helper_fptosi_bits as usize);
            store_mem_rbp(buf, dest_off, RAX);
        }
        FpToUi => {
            load_operand(buf, frame, &inst.operands[0], RDI)?;
            call_helper(buf, helpers::liric_helper_fptoui_bits as usize);
            store_mem_rbp(buf, dest_off, RAX);
        }
        Load => {
            load_operand(buf, frame, &inst.operands[0], RAX)?;
            load_mem0(buf, RAX, RAX);
            store_mem_rbp(buf, dest_off, RAX);
        }
        Store => {
            load_operand(buf, frame, &inst.operands[0], RDX)?;
            load_operand(buf, frame, &inst.operands[1], RAX)?;
            store_mem0(buf, RAX, RDX);
        }
        Alloca => {
            lea_rbp(buf, RAX, frame.alloca_storage_offset(inst.dest));
            store_mem_rbp(buf, dest_off, RAX);
        }
        Gep => {
            let (const_offset, scaled) = crate::isa::gep_offset_plan(&inst.ty, &inst.operands[1..])?;
            load_operand(buf, frame, &inst.operands[0], RAX)?;
            for (idx, stride) in scaled {
                load_operand(buf, frame, idx, RDX)?;
                imul_r_imm32(buf, RDX, RDX, stride as i32);
                binop_rr(buf, 0x01, RAX, RDX); // add
            }
            if const_offset != 0 {
                mov_imm64(buf, RDX, const_offset);
                binop_rr(buf, 0x01, RAX, RDX); // add
            }
            store_mem_rbp(buf, dest_off, RAX);
        }
        Br => {
            let target = inst.operands[0]
                .as_block()
                .ok_or_else(|| CodegenError::backend("br operand is not a block"))?;
            buf.put1(0xE9);
            buf.branch32_fixup(target);
        }
        CondBr => {
            load_operand(buf, frame, &inst.operands[0], RAX)?;
            test_rr(buf, RAX);
            let t = inst.operands[1]
                .as_block()
                .ok_or_else(|| CodegenError::backend("condbr true-target is not a block"))?;
            let f = inst.operands[2]
                .as_block()
                .ok_or_else(|| CodegenError::backend("condbr false-target is not a block"))?;
            buf.put1(0x0F);
            buf.put1(0x85); // jne
            buf.branch32_fixup(t);
            buf.put1(0xE9);
            buf.branch32_fixup(f);
        }
        Ret => {
            load_operand(buf, frame, &inst.operands[0], RAX)?;
            emit_epilogue(buf);
        }
        RetVoid => emit_epilogue(buf),
        Unreachable => {
            buf.put1(0x0F);
            buf.put1(0x0B); // ud2
        }
        Sext | Zext => {
            load_operand(buf, frame, &inst.operands[0], RAX)?;
            if let Some(bits) = inst.operands[0].ty().int_bits() {
                extend_in_place(buf, RAX, bits, inst.opcode == Sext);
            }
            store_mem_rbp(buf, dest_off, RAX);
        }
        Trunc | Bitcast | IntToPtr | PtrToInt | FpExt | FpTrunc => {
            load_operand(buf, frame, &inst.operands[0], RAX)?;
            store_mem_rbp(buf, dest_off, RAX);
        }
        Copy => {
            load_operand(buf, frame, &inst.operands[0], RAX)?;
            store_mem_rbp(buf, dest_off, RAX);
        }
        Select => {
            load_operand(buf, frame, &inst.operands[0], RAX)?;
            test_rr(buf, RAX);
            buf.put1(0x0F);
            buf.put1(0x84); // je
            let je_disp = buf.offset();
            buf.put4_le(0);
            load_operand(buf, frame, &inst.operands[1], RAX)?;
            buf.put1(0xE9); // jmp
            let jmp_disp = buf.offset();
            buf.put4_le(0);
            let false_start = buf.offset();
            load_operand(buf, frame, &inst.operands[2], RAX)?;
            let end = buf.offset();
            patch_rel32(buf, je_disp, false_start);
            patch_rel32(buf, jmp_disp, end);
            store_mem_rbp(buf, dest_off, RAX);
        }
        Call => {
            for (i, arg) in inst.operands[1..].iter().take(ARG_REGS.len()).enumerate() {
                load_operand(buf, frame, arg, ARG_REGS[i])?;
            }
            if inst.call_flags.vararg {
                xor_eax_eax(buf);
            }
            load_operand(buf, frame, &inst.operands[0], R11)?;
            call_r(buf, R11);
            if !inst.dest.is_none() {
                store_mem_rbp(buf, dest_off, RAX);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::finalize::finalize;
    use crate::ir::{Instruction, Operand, Type, VReg};

    fn int_op(v: i64) -> Operand {
        Operand::ImmI64(v, Type::I64)
    }

    #[test]
    fn returns_a_constant() {
        let mut f = Function::declare("ret42", Type::I64, vec![]);
        f.is_decl = false;
        let entry = f.create_block("entry");
        f.emit(entry, Instruction::new(Opcode::Ret, Type::I64, VReg::NONE, &[int_op(42)]));
        finalize(&mut f);
        let compiled = X86_64Isa::new().compile_function(&f).unwrap();
        // push rbp; mov rbp,rsp; movabs rax,42; mov rsp,rbp; pop rbp; ret
        assert!(!compiled.code.is_empty());
        assert_eq!(*compiled.code.last().unwrap(), 0xC3);
    }

    #[test]
    fn adds_two_params() {
        let mut f = Function::declare("add", Type::I64, vec![Type::I64, Type::I64]);
        f.is_decl = false;
        let entry = f.create_block("entry");
        let (p0, p1) = (f.param_vregs[0], f.param_vregs[1]);
        let d = f.alloc_vreg();
        f.emit(
            entry,
            Instruction::new(
                Opcode::Add,
                Type::I64,
                d,
                &[Operand::VReg(p0, Type::I64), Operand::VReg(p1, Type::I64)],
            ),
        );
        f.emit(entry, Instruction::new(Opcode::Ret, Type::I64, VReg::NONE, &[Operand::VReg(d, Type::I64)]));
        finalize(&mut f);
        let compiled = X86_64Isa::new().compile_function(&f).unwrap();
        assert_eq!(*compiled.code.last().unwrap(), 0xC3);
        assert!(compiled.code.windows(2).any(|w| w == [0x01, 0xC2] || w == [0x48, 0x01]));
    }

    #[test]
    fn rejects_unresolved_global() {
        let mut f = Function::declare("f", Type::I64, vec![]);
        f.is_decl = false;
        let entry = f.create_block("entry");
        let g = crate::ir::GlobalId::from_u32(0);
        f.emit(
            entry,
            Instruction::new(Opcode::Ret, Type::I64, VReg::NONE, &[Operand::global(g, Type::I64)]),
        );
        finalize(&mut f);
        assert!(X86_64Isa::new().compile_function(&f).is_err());
    }
}
