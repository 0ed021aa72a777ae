//! Session facade: a module under construction, a JIT, and a
//! streaming IR builder bundled behind one handle (spec §4.11).
//!
//! A session runs in one of two modes. `Direct` compiles each
//! function into the JIT as soon as `func_end` closes it — every
//! other defined function is temporarily marked a declaration so only
//! the one that just finished gets lowered, and a forward reference to
//! a callee that doesn't exist yet is deferred rather than treated as
//! an error (see [`Session::try_compile_one`]). `Ir` only finalizes at
//! `func_end`; nothing reaches the JIT until `emit_object`/`emit_exe`
//! or a `lookup` forces it.

mod dump;

use liric_codegen::finalize::finalize;
use liric_codegen::ir::{
    CallFlags, FCmpPredicate, FuncId, GlobalId, ICmpPredicate, Instruction, InstId, BlockId,
    Module, Opcode, Operand, Type, VReg,
};
use liric_codegen::isa::{host_isa, CompiledFunction, TargetIsa};
use liric_codegen::result::{CodegenError, CodegenResult, ParseError};
pub use liric_jit::CompileMode;
use liric_jit::Jit;
use std::collections::HashMap;
use std::collections::HashSet;
use std::io::Write;

/// Whether a session compiles eagerly as functions are closed, or
/// defers all codegen until something forces it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Direct,
    Ir,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Direct
    }
}

/// Construction parameters for [`Session::create`].
#[derive(Clone, Debug, Default)]
pub struct SessionConfig {
    /// Target triple's architecture name (`"x86_64"`, `"aarch64"`,
    /// `"riscv64"`); the host architecture if `None`.
    pub target: Option<String>,
    /// Overrides `LIRIC_COMPILE_MODE` (spec §6) when set.
    pub compile_mode: Option<CompileMode>,
    pub mode: Mode,
}

fn isa_for_target(name: &str) -> CodegenResult<Box<dyn TargetIsa>> {
    liric_codegen::isa::lookup_by_name(name)
}

fn compile_mode_from_env() -> CompileMode {
    std::env::var("LIRIC_COMPILE_MODE")
        .ok()
        .map(|s| CompileMode::from_env_str(&s))
        .unwrap_or(CompileMode::Isel)
}

fn parse_errors_to_codegen_error(mut errs: Vec<ParseError>) -> CodegenError {
    let first = errs.remove(0);
    if errs.is_empty() {
        return CodegenError::Parse(first);
    }
    let mut message = first.message.clone();
    for e in &errs {
        message.push_str("; ");
        message.push_str(&e.to_string());
    }
    CodegenError::Parse(ParseError::new(first.line, first.col, message))
}

/// Bundles a module under construction, the JIT it compiles into, and
/// the builder cursor (current function/block) used while streaming
/// instructions in (spec §4.11).
pub struct Session {
    module: Module,
    jit: Jit,
    mode: Mode,
    target: Option<String>,
    cur_func: Option<FuncId>,
    cur_block: Option<BlockId>,
    /// Functions whose last `Direct`-mode compile attempt deferred on
    /// an unresolved forward reference; retried whenever another
    /// function finishes compiling or a `lookup` comes in.
    pending_callers: HashSet<FuncId>,
    /// Modules parsed via `compile_ll`/`compile_bc`, kept alive for
    /// the session's lifetime (spec §5: "destruction cascades" through
    /// module, JIT, then auxiliary parsed modules).
    aux_modules: Vec<Module>,
    /// `Ir` mode only: whether `self.module`/`aux_modules` have all
    /// been handed to the JIT since the last mutation.
    ir_synced: bool,
}

impl Session {
    pub fn create(cfg: SessionConfig) -> CodegenResult<Self> {
        let compile_mode = cfg.compile_mode.unwrap_or_else(compile_mode_from_env);
        let jit = match &cfg.target {
            Some(name) => Jit::create_for_target_with_mode(name, compile_mode)?,
            None => Jit::create_with_mode(compile_mode)?,
        };
        Ok(Session {
            module: Module::new(),
            jit,
            mode: cfg.mode,
            target: cfg.target,
            cur_func: None,
            cur_block: None,
            pending_callers: HashSet::new(),
            aux_modules: Vec::new(),
            ir_synced: false,
        })
    }

    /// Release everything the session owns. Equivalent to dropping it;
    /// kept as an explicit call mirroring the C API's `destroy` verb.
    pub fn destroy(self) {}

    // ---- types --------------------------------------------------------

    pub fn type_void(&self) -> Type {
        Type::Void
    }
    pub fn type_i1(&self) -> Type {
        Type::I1
    }
    pub fn type_i8(&self) -> Type {
        Type::I8
    }
    pub fn type_i16(&self) -> Type {
        Type::I16
    }
    pub fn type_i32(&self) -> Type {
        Type::I32
    }
    pub fn type_i64(&self) -> Type {
        Type::I64
    }
    pub fn type_float(&self) -> Type {
        Type::Float
    }
    pub fn type_double(&self) -> Type {
        Type::Double
    }
    pub fn type_ptr(&self) -> Type {
        Type::Ptr
    }
    pub fn type_array(&self, elem: Type, count: u64) -> Type {
        Type::array(elem, count)
    }
    pub fn type_struct(&self, fields: Vec<Type>, packed: bool) -> Type {
        Type::structure(fields, packed)
    }
    pub fn type_function(&self, ret: Type, params: Vec<Type>, vararg: bool) -> Type {
        Type::function(ret, params, vararg)
    }

    // ---- declarations ---------------------------------------------------

    pub fn declare_function(&mut self, name: &str, ret: Type, params: Vec<Type>) -> FuncId {
        self.module.declare_function(name, ret, params)
    }

    pub fn declare_global(&mut self, name: &str, ty: Type, is_const: bool, is_external: bool) -> GlobalId {
        self.ir_synced = false;
        self.module.declare_global(name, ty, is_const, is_external)
    }

    // ---- function/block building ---------------------------------------

    pub fn func_begin(&mut self, name: &str, ret: Type, params: Vec<Type>) -> CodegenResult<FuncId> {
        if self.cur_func.is_some() {
            return Err(CodegenError::state("func_begin called while a function is already open"));
        }
        let id = self.module.declare_function(name, ret, params);
        let f = &mut self.module.funcs[id];
        if !f.is_decl {
            return Err(CodegenError::state(format!("function '{name}' is already defined")));
        }
        f.is_decl = false;
        self.cur_func = Some(id);
        let entry = self.module.funcs[id].create_block("entry");
        self.cur_block = Some(entry);
        Ok(id)
    }

    pub fn func_end(&mut self) -> CodegenResult<()> {
        let id = self
            .cur_func
            .take()
            .ok_or_else(|| CodegenError::state("func_end called without an open function"))?;
        self.cur_block = None;
        let name = {
            let f = &self.module.funcs[id];
            if !f.all_blocks_terminated() {
                self.cur_func = Some(id);
                return Err(CodegenError::state(format!(
                    "function '{}' has an unterminated block",
                    f.name
                )));
            }
            f.name.clone()
        };
        finalize(&mut self.module.funcs[id]);
        self.ir_synced = false;
        log::debug!("func_end: finalized '{name}'");

        if self.mode == Mode::Direct {
            self.try_compile_one(id)?;
            self.retry_pending()?;
        }
        Ok(())
    }

    pub fn param(&self, index: usize) -> CodegenResult<Operand> {
        let f = self.current_func()?;
        let v = *f
            .param_vregs
            .get(index)
            .ok_or_else(|| CodegenError::argument(format!("parameter index {index} out of range")))?;
        Ok(Operand::VReg(v, f.param_types[index].clone()))
    }

    pub fn block(&mut self) -> CodegenResult<BlockId> {
        let f = self.current_func_mut()?;
        let label = format!("bb{}", f.block_order.len());
        Ok(f.create_block(label))
    }

    pub fn set_block(&mut self, block: BlockId) -> CodegenResult<()> {
        self.current_func()?;
        self.cur_block = Some(block);
        Ok(())
    }

    fn current_func(&self) -> CodegenResult<&liric_codegen::ir::Function> {
        let id = self.cur_func.ok_or_else(|| CodegenError::state("no function is open"))?;
        Ok(&self.module.funcs[id])
    }

    fn current_func_mut(&mut self) -> CodegenResult<&mut liric_codegen::ir::Function> {
        let id = self.cur_func.ok_or_else(|| CodegenError::state("no function is open"))?;
        Ok(&mut self.module.funcs[id])
    }

    fn current_block(&self) -> CodegenResult<BlockId> {
        self.cur_block.ok_or_else(|| CodegenError::state("no block is current"))
    }

    // ---- typed operand constructors -------------------------------------

    pub fn vreg(&self, v: VReg, ty: Type) -> Operand {
        Operand::VReg(v, ty)
    }
    pub fn imm_i64(&self, v: i64, ty: Type) -> Operand {
        Operand::ImmI64(v, ty)
    }
    pub fn imm_f64(&self, v: f64, ty: Type) -> Operand {
        Operand::ImmF64(v, ty)
    }
    pub fn global_ref(&self, id: GlobalId, ty: Type) -> Operand {
        Operand::global(id, ty)
    }
    pub fn block_ref(&self, b: BlockId) -> Operand {
        Operand::BlockRef(b)
    }
    pub fn undef(&self, ty: Type) -> Operand {
        Operand::Undef(ty)
    }
    pub fn null(&self, ty: Type) -> Operand {
        Operand::Null(ty)
    }

    // ---- instruction emission --------------------------------------------

    fn emit(&mut self, opcode: Opcode, ty: Type, dest: VReg, operands: &[Operand]) -> CodegenResult<InstId> {
        let block = self.current_block()?;
        let f = self.current_func_mut()?;
        Ok(f.emit(block, Instruction::new(opcode, ty, dest, operands)))
    }

    fn emit_with_result(&mut self, opcode: Opcode, ty: Type, operands: &[Operand]) -> CodegenResult<Operand> {
        let block = self.current_block()?;
        let f = self.current_func_mut()?;
        let dest = f.alloc_vreg();
        f.emit(block, Instruction::new(opcode, ty.clone(), dest, operands));
        Ok(Operand::VReg(dest, ty))
    }

    pub fn emit_add(&mut self, ty: Type, lhs: Operand, rhs: Operand) -> CodegenResult<Operand> {
        self.emit_with_result(Opcode::Add, ty, &[lhs, rhs])
    }
    pub fn emit_sub(&mut self, ty: Type, lhs: Operand, rhs: Operand) -> CodegenResult<Operand> {
        self.emit_with_result(Opcode::Sub, ty, &[lhs, rhs])
    }
    pub fn emit_mul(&mut self, ty: Type, lhs: Operand, rhs: Operand) -> CodegenResult<Operand> {
        self.emit_with_result(Opcode::Mul, ty, &[lhs, rhs])
    }
    pub fn emit_sdiv(&mut self, ty: Type, lhs: Operand, rhs: Operand) -> CodegenResult<Operand> {
        self.emit_with_result(Opcode::SDiv, ty, &[lhs, rhs])
    }
    pub fn emit_udiv(&mut self, ty: Type, lhs: Operand, rhs: Operand) -> CodegenResult<Operand> {
        self.emit_with_result(Opcode::UDiv, ty, &[lhs, rhs])
    }
    pub fn emit_srem(&mut self, ty: Type, lhs: Operand, rhs: Operand) -> CodegenResult<Operand> {
        self.emit_with_result(Opcode::SRem, ty, &[lhs, rhs])
    }
    pub fn emit_urem(&mut self, ty: Type, lhs: Operand, rhs: Operand) -> CodegenResult<Operand> {
        self.emit_with_result(Opcode::URem, ty, &[lhs, rhs])
    }
    pub fn emit_and(&mut self, ty: Type, lhs: Operand, rhs: Operand) -> CodegenResult<Operand> {
        self.emit_with_result(Opcode::And, ty, &[lhs, rhs])
    }
    pub fn emit_or(&mut self, ty: Type, lhs: Operand, rhs: Operand) -> CodegenResult<Operand> {
        self.emit_with_result(Opcode::Or, ty, &[lhs, rhs])
    }
    pub fn emit_xor(&mut self, ty: Type, lhs: Operand, rhs: Operand) -> CodegenResult<Operand> {
        self.emit_with_result(Opcode::Xor, ty, &[lhs, rhs])
    }
    pub fn emit_shl(&mut self, ty: Type, lhs: Operand, rhs: Operand) -> CodegenResult<Operand> {
        self.emit_with_result(Opcode::Shl, ty, &[lhs, rhs])
    }
    pub fn emit_ashr(&mut self, ty: Type, lhs: Operand, rhs: Operand) -> CodegenResult<Operand> {
        self.emit_with_result(Opcode::Ashr, ty, &[lhs, rhs])
    }
    pub fn emit_lshr(&mut self, ty: Type, lhs: Operand, rhs: Operand) -> CodegenResult<Operand> {
        self.emit_with_result(Opcode::Lshr, ty, &[lhs, rhs])
    }
    pub fn emit_fadd(&mut self, ty: Type, lhs: Operand, rhs: Operand) -> CodegenResult<Operand> {
        self.emit_with_result(Opcode::FAdd, ty, &[lhs, rhs])
    }
    pub fn emit_fsub(&mut self, ty: Type, lhs: Operand, rhs: Operand) -> CodegenResult<Operand> {
        self.emit_with_result(Opcode::FSub, ty, &[lhs, rhs])
    }
    pub fn emit_fmul(&mut self, ty: Type, lhs: Operand, rhs: Operand) -> CodegenResult<Operand> {
        self.emit_with_result(Opcode::FMul, ty, &[lhs, rhs])
    }
    pub fn emit_fdiv(&mut self, ty: Type, lhs: Operand, rhs: Operand) -> CodegenResult<Operand> {
        self.emit_with_result(Opcode::FDiv, ty, &[lhs, rhs])
    }
    pub fn emit_fneg(&mut self, ty: Type, v: Operand) -> CodegenResult<Operand> {
        self.emit_with_result(Opcode::FNeg, ty, &[v])
    }

    /// `0 - v`, the way `lc_create_neg` builds integer negation on top
    /// of plain subtraction instead of carrying its own opcode.
    pub fn emit_neg(&mut self, ty: Type, v: Operand) -> CodegenResult<Operand> {
        self.emit_sub(ty.clone(), Operand::ImmI64(0, ty), v)
    }

    /// `v XOR -1`, the way `lc_create_not` builds bitwise complement —
    /// an all-ones immediate at `ty`'s width rather than a dedicated
    /// opcode.
    pub fn emit_not(&mut self, ty: Type, v: Operand) -> CodegenResult<Operand> {
        self.emit_xor(ty.clone(), v, Operand::ImmI64(-1, ty))
    }

    pub fn emit_icmp(&mut self, pred: ICmpPredicate, lhs: Operand, rhs: Operand) -> CodegenResult<Operand> {
        self.emit_with_result(Opcode::ICmp(pred), Type::I1, &[lhs, rhs])
    }
    pub fn emit_fcmp(&mut self, pred: FCmpPredicate, lhs: Operand, rhs: Operand) -> CodegenResult<Operand> {
        self.emit_with_result(Opcode::FCmp(pred), Type::I1, &[lhs, rhs])
    }

    pub fn emit_load(&mut self, ty: Type, ptr: Operand) -> CodegenResult<Operand> {
        self.emit_with_result(Opcode::Load, ty, &[ptr])
    }

    pub fn emit_store(&mut self, val: Operand, ptr: Operand) -> CodegenResult<()> {
        self.emit(Opcode::Store, Type::Void, VReg::NONE, &[val, ptr])?;
        Ok(())
    }

    pub fn emit_alloca(&mut self, elem_ty: Type, count: Option<Operand>) -> CodegenResult<Operand> {
        let block = self.current_block()?;
        let f = self.current_func_mut()?;
        let dest = f.alloc_vreg();
        let operands: Vec<Operand> = count.into_iter().collect();
        f.emit(block, Instruction::new(Opcode::Alloca, elem_ty, dest, &operands));
        Ok(Operand::VReg(dest, Type::Ptr))
    }

    /// `base + indices`, widening any index narrower than `i64` with
    /// an implicit `sext` first — the same canonicalization
    /// `liric_reader` applies when parsing `getelementptr` (spec's GEP
    /// index canonicalization rule).
    pub fn emit_gep(&mut self, base_ty: Type, base: Operand, indices: Vec<Operand>) -> CodegenResult<Operand> {
        let block = self.current_block()?;
        let mut operands = vec![base];
        for idx in indices {
            let widened = match idx.ty().int_bits() {
                Some(bits) if bits < 64 => {
                    let f = self.current_func_mut()?;
                    let tmp = f.alloc_vreg();
                    f.emit(block, Instruction::new(Opcode::Sext, Type::I64, tmp, &[idx]));
                    Operand::VReg(tmp, Type::I64)
                }
                _ => idx,
            };
            operands.push(widened);
        }
        let f = self.current_func_mut()?;
        let dest = f.alloc_vreg();
        f.emit(block, Instruction::new(Opcode::Gep, base_ty, dest, &operands));
        Ok(Operand::VReg(dest, Type::Ptr))
    }

    /// `getelementptr %base_ty, ptr %base, i32 0, i32 field_index` — the
    /// two-index shape `lc_create_struct_gep` builds for "address of
    /// field `n`" so a caller doesn't have to spell out the leading
    /// array-style `0` by hand.
    pub fn emit_struct_gep(&mut self, base_ty: Type, base: Operand, field_index: u32) -> CodegenResult<Operand> {
        self.emit_gep(
            base_ty,
            base,
            vec![Operand::ImmI64(0, Type::I32), Operand::ImmI64(field_index as i64, Type::I32)],
        )
    }

    /// `lc_create_inbounds_gep` carries no distinct semantics in this
    /// IR — there's no separate "inbounds" bit for a backend to act on
    /// — so it's a pure alias, matching how `liric_reader` parses `gep`
    /// and `inbounds gep` identically.
    pub fn emit_inbounds_gep(&mut self, base_ty: Type, base: Operand, indices: Vec<Operand>) -> CodegenResult<Operand> {
        self.emit_gep(base_ty, base, indices)
    }

    pub fn emit_br(&mut self, target: BlockId) -> CodegenResult<()> {
        self.emit(Opcode::Br, Type::Void, VReg::NONE, &[Operand::BlockRef(target)])?;
        Ok(())
    }

    pub fn emit_condbr(&mut self, cond: Operand, if_true: BlockId, if_false: BlockId) -> CodegenResult<()> {
        self.emit(
            Opcode::CondBr,
            Type::Void,
            VReg::NONE,
            &[cond, Operand::BlockRef(if_true), Operand::BlockRef(if_false)],
        )?;
        Ok(())
    }

    pub fn emit_ret(&mut self, val: Operand) -> CodegenResult<()> {
        self.emit(Opcode::Ret, Type::Void, VReg::NONE, &[val])?;
        Ok(())
    }

    pub fn emit_ret_void(&mut self) -> CodegenResult<()> {
        self.emit(Opcode::RetVoid, Type::Void, VReg::NONE, &[])?;
        Ok(())
    }

    pub fn emit_unreachable(&mut self) -> CodegenResult<()> {
        self.emit(Opcode::Unreachable, Type::Void, VReg::NONE, &[])?;
        Ok(())
    }

    fn emit_conv(&mut self, opcode: Opcode, dst_ty: Type, v: Operand) -> CodegenResult<Operand> {
        self.emit_with_result(opcode, dst_ty, &[v])
    }
    pub fn emit_sext(&mut self, dst_ty: Type, v: Operand) -> CodegenResult<Operand> {
        self.emit_conv(Opcode::Sext, dst_ty, v)
    }
    pub fn emit_zext(&mut self, dst_ty: Type, v: Operand) -> CodegenResult<Operand> {
        self.emit_conv(Opcode::Zext, dst_ty, v)
    }
    pub fn emit_trunc(&mut self, dst_ty: Type, v: Operand) -> CodegenResult<Operand> {
        self.emit_conv(Opcode::Trunc, dst_ty, v)
    }
    pub fn emit_sitofp(&mut self, dst_ty: Type, v: Operand) -> CodegenResult<Operand> {
        self.emit_conv(Opcode::SiToFp, dst_ty, v)
    }
    pub fn emit_uitofp(&mut self, dst_ty: Type, v: Operand) -> CodegenResult<Operand> {
        self.emit_conv(Opcode::UiToFp, dst_ty, v)
    }
    pub fn emit_fptosi(&mut self, dst_ty: Type, v: Operand) -> CodegenResult<Operand> {
        self.emit_conv(Opcode::FpToSi, dst_ty, v)
    }
    pub fn emit_fptoui(&mut self, dst_ty: Type, v: Operand) -> CodegenResult<Operand> {
        self.emit_conv(Opcode::FpToUi, dst_ty, v)
    }
    pub fn emit_fpext(&mut self, dst_ty: Type, v: Operand) -> CodegenResult<Operand> {
        self.emit_conv(Opcode::FpExt, dst_ty, v)
    }
    pub fn emit_fptrunc(&mut self, dst_ty: Type, v: Operand) -> CodegenResult<Operand> {
        self.emit_conv(Opcode::FpTrunc, dst_ty, v)
    }
    pub fn emit_bitcast(&mut self, dst_ty: Type, v: Operand) -> CodegenResult<Operand> {
        self.emit_conv(Opcode::Bitcast, dst_ty, v)
    }
    pub fn emit_inttoptr(&mut self, v: Operand) -> CodegenResult<Operand> {
        self.emit_conv(Opcode::IntToPtr, Type::Ptr, v)
    }
    pub fn emit_ptrtoint(&mut self, dst_ty: Type, v: Operand) -> CodegenResult<Operand> {
        self.emit_conv(Opcode::PtrToInt, dst_ty, v)
    }

    /// Width-dispatching integer cast, the way `lc_create_sext_or_trunc`
    /// and `lc_create_zext_or_trunc` spare a caller from checking
    /// widths itself: narrower extends, wider truncates, equal widths
    /// pass through as a `bitcast` rather than a no-op builder call,
    /// since this IR has no untyped "same value, relabeled" operand.
    pub fn emit_sext_or_trunc(&mut self, dst_ty: Type, v: Operand) -> CodegenResult<Operand> {
        self.width_dispatch_cast(Opcode::Sext, dst_ty, v)
    }
    pub fn emit_zext_or_trunc(&mut self, dst_ty: Type, v: Operand) -> CodegenResult<Operand> {
        self.width_dispatch_cast(Opcode::Zext, dst_ty, v)
    }
    fn width_dispatch_cast(&mut self, extend_op: Opcode, dst_ty: Type, v: Operand) -> CodegenResult<Operand> {
        let (src_bits, dst_bits) = (v.ty().int_bits(), dst_ty.int_bits());
        match (src_bits, dst_bits) {
            (Some(src), Some(dst)) if src < dst => self.emit_conv(extend_op, dst_ty, v),
            (Some(src), Some(dst)) if src > dst => self.emit_conv(Opcode::Trunc, dst_ty, v),
            _ => self.emit_conv(Opcode::Bitcast, dst_ty, v),
        }
    }

    pub fn emit_call(
        &mut self,
        ret_ty: Type,
        callee: Operand,
        args: Vec<Operand>,
        vararg: bool,
    ) -> CodegenResult<Operand> {
        let block = self.current_block()?;
        let mut operands = Vec::with_capacity(args.len() + 1);
        operands.push(callee);
        operands.extend(args);
        let f = self.current_func_mut()?;
        let dest = if ret_ty == Type::Void { VReg::NONE } else { f.alloc_vreg() };
        let mut inst = Instruction::new(Opcode::Call, ret_ty.clone(), dest, &operands);
        inst.call_flags = CallFlags { external_abi: false, vararg };
        f.emit(block, inst);
        Ok(Operand::VReg(dest, ret_ty))
    }

    pub fn emit_select(&mut self, cond: Operand, if_true: Operand, if_false: Operand) -> CodegenResult<Operand> {
        let ty = if_true.ty().clone();
        self.emit_with_result(Opcode::Select, ty, &[cond, if_true, if_false])
    }

    pub fn emit_extractvalue(&mut self, agg: Operand, indices: &[u32]) -> CodegenResult<Operand> {
        let block = self.current_block()?;
        let f = self.current_func_mut()?;
        let dest = f.alloc_vreg();
        let mut inst = Instruction::new(Opcode::ExtractValue, Type::I64, dest, &[agg]);
        inst.indices = indices.iter().copied().collect();
        f.emit(block, inst);
        Ok(Operand::VReg(dest, Type::I64))
    }

    pub fn emit_insertvalue(&mut self, agg: Operand, val: Operand, indices: &[u32]) -> CodegenResult<Operand> {
        let ty = agg.ty().clone();
        let block = self.current_block()?;
        let f = self.current_func_mut()?;
        let dest = f.alloc_vreg();
        let mut inst = Instruction::new(Opcode::InsertValue, ty.clone(), dest, &[agg, val]);
        inst.indices = indices.iter().copied().collect();
        f.emit(block, inst);
        Ok(Operand::VReg(dest, ty))
    }

    /// Open a new, empty `phi`; feed it incoming values with
    /// [`Session::add_phi_copy`] as each predecessor becomes known.
    pub fn emit_phi(&mut self, ty: Type) -> CodegenResult<(InstId, Operand)> {
        let block = self.current_block()?;
        let f = self.current_func_mut()?;
        let dest = f.alloc_vreg();
        let id = f.emit(block, Instruction::new(Opcode::Phi, ty.clone(), dest, &[]));
        Ok((id, Operand::VReg(dest, ty)))
    }

    pub fn add_phi_copy(&mut self, phi: InstId, value: Operand, predecessor: BlockId) -> CodegenResult<()> {
        let f = self.current_func_mut()?;
        let inst = f
            .insts
            .get_mut(phi)
            .ok_or_else(|| CodegenError::argument("add_phi_copy: no such instruction"))?;
        if inst.opcode != Opcode::Phi {
            return Err(CodegenError::argument("add_phi_copy target is not a phi instruction"));
        }
        inst.operands.push(value);
        inst.operands.push(Operand::BlockRef(predecessor));
        Ok(())
    }

    // ---- direct-mode compilation -----------------------------------------

    /// Compile `id` through the JIT with every other defined function
    /// temporarily marked as a declaration, so only `id`'s body is
    /// lowered. A call to a not-yet-defined function inside `id`
    /// fails the underlying `add_module` with `NotFound`; that failure
    /// is swallowed here and `id` is parked in `pending_callers`
    /// instead of propagated, matching the spec's "caller's compile
    /// may return null until the callee is later added".
    fn try_compile_one(&mut self, id: FuncId) -> CodegenResult<()> {
        if self.module.funcs[id].is_decl {
            return Ok(());
        }
        let mut reverted = Vec::new();
        for (fid, f) in self.module.funcs.iter_mut() {
            if fid != id && !f.is_decl {
                f.is_decl = true;
                reverted.push(fid);
            }
        }
        let result = self.jit.add_module(&self.module);
        for fid in &reverted {
            self.module.funcs[*fid].is_decl = false;
        }
        match result {
            Ok(()) => {
                self.module.funcs[id].is_decl = true;
                self.pending_callers.remove(&id);
                Ok(())
            }
            Err(CodegenError::NotFound(msg)) => {
                log::debug!("deferring '{}': {msg}", self.module.funcs[id].name);
                self.pending_callers.insert(id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn retry_pending(&mut self) -> CodegenResult<()> {
        let waiting: Vec<FuncId> = self.pending_callers.iter().copied().collect();
        for fid in waiting {
            self.try_compile_one(fid)?;
        }
        Ok(())
    }

    // ---- auxiliary modules -------------------------------------------------

    /// Parse `text` as textual IR (spec §4.2) and fold it in as an
    /// auxiliary module. In `Direct` mode its defined functions are
    /// compiled immediately; in `Ir` mode they wait like everything
    /// else in the session.
    pub fn compile_ll(&mut self, text: &str) -> CodegenResult<()> {
        let parsed = liric_reader::parse(text).map_err(parse_errors_to_codegen_error)?;
        if self.mode == Mode::Direct {
            self.jit.add_module(&parsed)?;
        }
        self.aux_modules.push(parsed);
        self.ir_synced = false;
        Ok(())
    }

    /// Bitcode ingestion is an external-collaborator concern (spec
    /// §6), same as `LIRIC_COMPILE_MODE=llvm` and object-file
    /// emission; none is linked in.
    pub fn compile_bc(&mut self, _bytes: &[u8]) -> CodegenResult<()> {
        Err(CodegenError::backend(
            "bitcode ingestion requires an external collaborator; none is linked in",
        ))
    }

    // ---- emission -----------------------------------------------------------

    fn isa_for_emission(&self) -> CodegenResult<Box<dyn TargetIsa>> {
        match &self.target {
            Some(name) => isa_for_target(name),
            None => Ok(host_isa()),
        }
    }

    /// Object-file/executable emission is provided by an external
    /// collaborator consuming `liric_module`'s iterators (spec §6);
    /// none is linked in, so this always fails. Since the failure is
    /// unconditional, the compiled-function map handed to
    /// `ModuleArtifacts` is left empty rather than spending real ISel
    /// work a collaborator isn't there yet to consume.
    pub fn emit_object(&self, out: &mut dyn Write) -> CodegenResult<()> {
        let isa = self.isa_for_emission()?;
        let empty: HashMap<String, CompiledFunction> = HashMap::new();
        let artifacts = liric_module::ModuleArtifacts::new(&self.module, &empty);
        let target = liric_module::TargetDescriptor { name: isa.name(), pointer_size: isa.pointer_size() as u8 };
        liric_module::emit_object(&artifacts, &target, out)
    }

    pub fn emit_exe(&self, entry: &str, out: &mut dyn Write) -> CodegenResult<()> {
        let isa = self.isa_for_emission()?;
        let empty: HashMap<String, CompiledFunction> = HashMap::new();
        let artifacts = liric_module::ModuleArtifacts::new(&self.module, &empty);
        let target = liric_module::TargetDescriptor { name: isa.name(), pointer_size: isa.pointer_size() as u8 };
        liric_module::emit_exe(&artifacts, &target, entry, out)
    }

    /// Dump the session's module as re-parseable textual IR.
    pub fn dump_ir(&self, out: &mut dyn Write) -> std::io::Result<()> {
        dump::dump_module(&self.module, out)
    }

    /// Resolve `name` to a callable address.
    ///
    /// In `Direct` mode this retries every still-pending caller first,
    /// since the symbol being looked up might be exactly what one of
    /// them was waiting on. In `Ir` mode, the first lookup compiles the
    /// whole session (its module plus every auxiliary parsed module)
    /// in one batch; later lookups reuse that unless something was
    /// added since.
    pub fn lookup(&mut self, name: &str) -> CodegenResult<usize> {
        if let Some(addr) = self.jit.get_function(name) {
            return Ok(addr);
        }
        match self.mode {
            Mode::Direct => self.retry_pending()?,
            Mode::Ir => {
                if !self.ir_synced {
                    self.jit.begin_update()?;
                    self.jit.add_module(&self.module)?;
                    for m in &self.aux_modules {
                        self.jit.add_module(m)?;
                    }
                    self.jit.end_update()?;
                    self.ir_synced = true;
                }
            }
        }
        self.jit
            .get_function(name)
            .ok_or_else(|| CodegenError::NotFound(format!("symbol '{name}' not found")))
    }

    /// Register a host address under `name`, resolvable like a
    /// module-defined symbol but losing the precedence tie (spec
    /// §4.10: a module-defined symbol always wins).
    pub fn add_symbol(&mut self, name: &str, addr: usize) -> CodegenResult<()> {
        self.jit.add_symbol(name, addr)
    }

    pub fn load_library(&mut self, path: &str) -> CodegenResult<()> {
        self.jit.load_library(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_session() -> Session {
        Session::create(SessionConfig::default()).unwrap()
    }

    #[test]
    fn direct_mode_compiles_on_func_end() {
        let mut s = new_session();
        s.func_begin("answer", Type::I64, vec![]).unwrap();
        let forty_two = s.imm_i64(42, Type::I64);
        s.emit_ret(forty_two).unwrap();
        s.func_end().unwrap();

        let addr = s.lookup("answer").unwrap();
        let f: extern "C" fn() -> i64 = unsafe { std::mem::transmute(addr) };
        assert_eq!(f(), 42);
    }

    #[test]
    fn direct_mode_adds_two_params() {
        let mut s = new_session();
        s.func_begin("add", Type::I64, vec![Type::I64, Type::I64]).unwrap();
        let a = s.param(0).unwrap();
        let b = s.param(1).unwrap();
        let sum = s.emit_add(Type::I64, a, b).unwrap();
        s.emit_ret(sum).unwrap();
        s.func_end().unwrap();

        let addr = s.lookup("add").unwrap();
        let f: extern "C" fn(i64, i64) -> i64 = unsafe { std::mem::transmute(addr) };
        assert_eq!(f(10, 32), 42);
    }

    #[test]
    fn direct_mode_defers_a_forward_call_until_the_callee_is_defined() {
        let mut s = new_session();

        s.func_begin("caller", Type::I64, vec![]).unwrap();
        let callee_global = s.declare_global("callee", Type::Ptr, false, true);
        let callee_op = s.global_ref(callee_global, Type::Ptr);
        let r = s.emit_call(Type::I64, callee_op, vec![], false).unwrap();
        s.emit_ret(r).unwrap();
        s.func_end().unwrap();
        // "caller" body references "callee", not yet defined: compile
        // deferred, no error raised.
        assert!(s.jit.get_function("caller").is_none());

        s.func_begin("callee", Type::I64, vec![]).unwrap();
        let five = s.imm_i64(5, Type::I64);
        s.emit_ret(five).unwrap();
        s.func_end().unwrap();
        // finishing "callee" should have retried and compiled "caller".
        let addr = s.lookup("caller").expect("caller should now be compiled");
        let f: extern "C" fn() -> i64 = unsafe { std::mem::transmute(addr) };
        assert_eq!(f(), 5);
    }

    #[test]
    fn ir_mode_only_finalizes_until_a_lookup_forces_codegen() {
        let mut s = Session::create(SessionConfig { mode: Mode::Ir, ..Default::default() }).unwrap();
        s.func_begin("answer", Type::I64, vec![]).unwrap();
        let v = s.imm_i64(7, Type::I64);
        s.emit_ret(v).unwrap();
        s.func_end().unwrap();
        assert!(s.jit.get_function("answer").is_none());

        let addr = s.lookup("answer").unwrap();
        let f: extern "C" fn() -> i64 = unsafe { std::mem::transmute(addr) };
        assert_eq!(f(), 7);
    }

    #[test]
    fn compile_ll_adds_a_callable_function() {
        let mut s = new_session();
        s.compile_ll("define i64 @konst() {\nentry:\n  ret i64 99\n}\n").unwrap();
        let addr = s.lookup("konst").unwrap();
        let f: extern "C" fn() -> i64 = unsafe { std::mem::transmute(addr) };
        assert_eq!(f(), 99);
    }

    #[test]
    fn dump_ir_round_trips_through_the_parser() {
        let mut s = new_session();
        s.func_begin("add", Type::I64, vec![Type::I64, Type::I64]).unwrap();
        let a = s.param(0).unwrap();
        let b = s.param(1).unwrap();
        let sum = s.emit_add(Type::I64, a, b).unwrap();
        s.emit_ret(sum).unwrap();
        s.func_end().unwrap();

        let mut buf = Vec::new();
        s.dump_ir(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let reparsed = liric_reader::parse(&text).expect("dumped IR should re-parse");
        assert!(reparsed.find_function("add").is_some());
    }

    #[test]
    fn target_config_accepts_a_full_triple_not_just_a_bare_arch_name() {
        let cfg = SessionConfig { target: Some("riscv64gc-unknown-linux-gnu".to_string()), ..Default::default() };
        let s = Session::create(cfg).unwrap();
        assert_eq!(s.isa_for_emission().unwrap().name(), "riscv64");
    }

    #[test]
    fn unsupported_target_is_rejected_at_session_creation() {
        let cfg = SessionConfig { target: Some("mips64-unknown-linux-gnu".to_string()), ..Default::default() };
        assert!(Session::create(cfg).is_err());
    }

    #[test]
    fn emit_object_reports_missing_collaborator() {
        let s = new_session();
        let mut buf = Vec::new();
        assert!(s.emit_object(&mut buf).is_err());
    }

    #[test]
    fn phi_collects_incoming_values_from_each_predecessor() {
        let mut s = new_session();
        s.func_begin("sel", Type::I64, vec![Type::I1]).unwrap();
        let cond = s.param(0).unwrap();
        let t = s.block().unwrap();
        let f = s.block().unwrap();
        let j = s.block().unwrap();
        s.emit_condbr(cond, t, f).unwrap();

        s.set_block(t).unwrap();
        let one = s.imm_i64(1, Type::I64);
        s.emit_br(j).unwrap();

        s.set_block(f).unwrap();
        let zero = s.imm_i64(0, Type::I64);
        s.emit_br(j).unwrap();

        s.set_block(j).unwrap();
        let (phi_id, phi_val) = s.emit_phi(Type::I64).unwrap();
        s.add_phi_copy(phi_id, one, t).unwrap();
        s.add_phi_copy(phi_id, zero, f).unwrap();
        s.emit_ret(phi_val).unwrap();
        s.func_end().unwrap();

        let addr = s.lookup("sel").unwrap();
        let func: extern "C" fn(i64) -> i64 = unsafe { std::mem::transmute(addr) };
        assert_eq!(func(1), 1);
        assert_eq!(func(0), 0);
    }

    #[test]
    fn emit_neg_and_not_compose_from_sub_and_xor() {
        let mut s = new_session();
        s.func_begin("negnot", Type::I64, vec![Type::I64]).unwrap();
        let a = s.param(0).unwrap();
        let negated = s.emit_neg(Type::I64, a).unwrap();
        let complemented = s.emit_not(Type::I64, negated).unwrap();
        s.emit_ret(complemented).unwrap();
        s.func_end().unwrap();

        let addr = s.lookup("negnot").unwrap();
        let f: extern "C" fn(i64) -> i64 = unsafe { std::mem::transmute(addr) };
        // !(-a) == a - 1
        assert_eq!(f(5), 4);
    }

    #[test]
    fn emit_struct_gep_addresses_the_second_field_past_padding() {
        let mut s = new_session();
        let struct_ty = Type::structure(vec![Type::I32, Type::I64], false);
        s.func_begin("field1", Type::I64, vec![]).unwrap();
        let base = s.emit_alloca(struct_ty.clone(), None).unwrap();
        let field_ptr = s.emit_struct_gep(struct_ty, base, 1).unwrap();
        let ninety_nine = s.imm_i64(99, Type::I64);
        s.emit_store(ninety_nine, field_ptr.clone()).unwrap();
        let loaded = s.emit_load(Type::I64, field_ptr).unwrap();
        s.emit_ret(loaded).unwrap();
        s.func_end().unwrap();

        let addr = s.lookup("field1").unwrap();
        let f: extern "C" fn() -> i64 = unsafe { std::mem::transmute(addr) };
        assert_eq!(f(), 99);
    }

    #[test]
    fn emit_sext_or_trunc_extends_a_narrower_source() {
        let mut s = new_session();
        s.func_begin("widen", Type::I64, vec![Type::I32]).unwrap();
        let a = s.param(0).unwrap();
        let widened = s.emit_sext_or_trunc(Type::I64, a).unwrap();
        s.emit_ret(widened).unwrap();
        s.func_end().unwrap();

        let addr = s.lookup("widen").unwrap();
        let f: extern "C" fn(i32) -> i64 = unsafe { std::mem::transmute(addr) };
        assert_eq!(f(-1), -1i64);
    }

    #[test]
    fn emit_zext_or_trunc_narrows_a_wider_source() {
        let mut s = new_session();
        s.func_begin("narrow", Type::I32, vec![Type::I64]).unwrap();
        let a = s.param(0).unwrap();
        let narrowed = s.emit_zext_or_trunc(Type::I32, a).unwrap();
        s.emit_ret(narrowed).unwrap();
        s.func_end().unwrap();

        let addr = s.lookup("narrow").unwrap();
        let f: extern "C" fn(i64) -> i32 = unsafe { std::mem::transmute(addr) };
        assert_eq!(f(0x1_0000_0001), 1);
    }
}
