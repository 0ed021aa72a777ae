//! In-process JIT runtime (spec §4.10).
//!
//! A [`Jit`] owns one growable executable memory region
//! ([`memory::CodeMemory`]) and three symbol tables: functions it has
//! compiled itself, host addresses registered through [`Jit::add_symbol`],
//! and shared libraries opened through [`Jit::load_library`]. Adding a
//! module resolves every `global_ref` operand in its defined functions
//! to a concrete address before instruction selection ever sees it —
//! `TargetIsa::compile_function` hard-errors on an unresolved
//! `Operand::GlobalRef` by construction (see `liric_codegen::isa`), so
//! that resolution has to happen here, not in the backend.

mod library;
mod memory;

use liric_codegen::ir::{Function, InstId, Module, Operand};
use liric_codegen::isa::{host_isa, lookup_by_name, CompiledFunction, TargetIsa};
use liric_codegen::result::{CodegenError, CodegenResult};
use memory::{CodeMemory, Mark};
use std::collections::{HashMap, HashSet};

pub use library::Library;

/// Which lowering strategy `add_module` uses to turn IR into machine
/// code (spec §6 `LIRIC_COMPILE_MODE`). The session facade owns
/// reading the environment variable and any explicit override; the
/// JIT just needs to know which one it was told to use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompileMode {
    /// Full instruction selection, every target.
    Isel,
    /// Try the x86_64 copy-and-patch fast path first, falling back to
    /// `Isel` for anything the stencil set doesn't cover.
    CopyPatch,
    /// Delegated to an external LLVM collaborator; absent one, every
    /// operation in this mode fails (spec §6).
    Llvm,
}

impl CompileMode {
    /// Parse a `LIRIC_COMPILE_MODE` value; `stencil` is an accepted
    /// alias for `copy_patch`. Unrecognized values fall back to `Isel`.
    pub fn from_env_str(s: &str) -> CompileMode {
        match s {
            "copy_patch" | "stencil" => CompileMode::CopyPatch,
            "llvm" => CompileMode::Llvm,
            _ => CompileMode::Isel,
        }
    }
}

/// One unresolved `global_ref` operand site within a cloned function
/// body, recorded while the originating [`Module`] (and thus its
/// global symbol names) is still in scope.
struct PendingUse {
    inst: InstId,
    slot: usize,
    symbol: String,
    addend: i64,
}

/// A defined function awaiting global-operand resolution and codegen.
struct PendingFunc {
    func: Function,
    uses: Vec<PendingUse>,
}

/// State held between `begin_update` and `end_update`.
struct Batch {
    mark: Mark,
    worklist: Vec<PendingFunc>,
}

/// The JIT runtime: owns executable memory plus the symbol tables
/// needed to resolve calls and data references across everything
/// added to it (spec §4.10).
pub struct Jit {
    isa: Box<dyn TargetIsa>,
    mode: CompileMode,
    code: CodeMemory,
    defined: HashMap<String, usize>,
    external: HashMap<String, usize>,
    libraries: Vec<Library>,
    batch: Option<Batch>,
}

impl Jit {
    /// Create a JIT targeting the host architecture in `isel` mode.
    pub fn create() -> CodegenResult<Self> {
        Ok(Jit::with_isa(host_isa(), CompileMode::Isel))
    }

    /// Create a JIT targeting `name` (a bare architecture name like
    /// `"x86_64"`/`"aarch64"`/`"riscv64"`, or a full target triple),
    /// which need not match the host, in `isel` mode.
    pub fn create_for_target(name: &str) -> CodegenResult<Self> {
        Ok(Jit::with_isa(lookup_by_name(name)?, CompileMode::Isel))
    }

    /// Create a JIT with an explicit compile mode (spec §6
    /// `LIRIC_COMPILE_MODE`; the session facade resolves the
    /// environment variable and any session-level override into a
    /// [`CompileMode`] before calling this).
    pub fn create_with_mode(mode: CompileMode) -> CodegenResult<Self> {
        Ok(Jit::with_isa(host_isa(), mode))
    }

    /// As [`Jit::create_for_target`], with an explicit compile mode.
    pub fn create_for_target_with_mode(name: &str, mode: CompileMode) -> CodegenResult<Self> {
        Ok(Jit::with_isa(lookup_by_name(name)?, mode))
    }

    fn with_isa(isa: Box<dyn TargetIsa>, mode: CompileMode) -> Self {
        Jit {
            isa,
            mode,
            code: CodeMemory::new(),
            defined: HashMap::new(),
            external: HashMap::new(),
            libraries: Vec::new(),
            batch: None,
        }
    }

    fn compile_one(&self, func: &Function) -> CodegenResult<CompiledFunction> {
        match self.mode {
            CompileMode::Llvm => Err(CodegenError::backend(
                "LLVM compile mode requires an external collaborator; none is linked in",
            )),
            CompileMode::CopyPatch => {
                if let Some(cf) = liric_codegen::isa::stencil::try_compile(func)? {
                    Ok(cf)
                } else {
                    self.isa.compile_function(func)
                }
            }
            CompileMode::Isel => self.isa.compile_function(func),
        }
    }

    /// Release everything this JIT owns. Equivalent to dropping it;
    /// kept as an explicit call so callers mirroring the session
    /// facade's `create`/`destroy` pairing have one to call.
    pub fn destroy(self) {}

    /// Register a host address under `name`, resolvable by later
    /// `global_ref` operands that target it.
    pub fn add_symbol(&mut self, name: &str, addr: usize) -> CodegenResult<()> {
        if addr == 0 {
            return Err(CodegenError::argument("add_symbol address must be non-null"));
        }
        self.external.insert(name.to_string(), addr);
        Ok(())
    }

    /// Open a shared library, making its exported symbols resolvable
    /// through the JIT's global-operand resolution order.
    pub fn load_library(&mut self, path: &str) -> CodegenResult<()> {
        let lib = Library::open(path)?;
        self.libraries.push(lib);
        Ok(())
    }

    /// Begin a multi-module batch: `add_module` calls made before the
    /// matching `end_update` only enqueue work, so a forward reference
    /// from one module to a symbol defined in a module added later in
    /// the same batch resolves instead of failing immediately.
    pub fn begin_update(&mut self) -> CodegenResult<()> {
        if self.batch.is_some() {
            return Err(CodegenError::state("begin_update called while a batch is already open"));
        }
        self.batch = Some(Batch { mark: self.code.mark(), worklist: Vec::new() });
        Ok(())
    }

    /// Resolve and compile everything enqueued since `begin_update`.
    /// An unresolved symbol fails the whole batch atomically: no code
    /// from any of its `add_module` calls ends up in the code buffer
    /// or the defined-symbols table.
    pub fn end_update(&mut self) -> CodegenResult<()> {
        let batch = self
            .batch
            .take()
            .ok_or_else(|| CodegenError::state("end_update called without a matching begin_update"))?;
        match self.resolve_and_place(batch.worklist) {
            Ok(()) => Ok(()),
            Err(e) => {
                log::warn!("end_update: rolling back batch after failure: {e}");
                self.code.truncate(batch.mark);
                Err(e)
            }
        }
    }

    /// Compile every defined function in `module`, resolving global
    /// operands along the way, and make them callable.
    ///
    /// Outside a `begin_update`/`end_update` bracket this resolves and
    /// compiles immediately (a forward reference to a symbol this
    /// call itself doesn't define fails right away). Inside a batch,
    /// the module's functions are only enqueued; see `end_update`.
    pub fn add_module(&mut self, module: &Module) -> CodegenResult<()> {
        let pending = self.collect_pending(module);
        log::debug!("add_module: {} defined function(s)", pending.len());
        match self.batch.as_mut() {
            Some(batch) => {
                batch.worklist.extend(pending);
                Ok(())
            }
            None => {
                let mark = self.code.mark();
                self.resolve_and_place(pending).map_err(|e| {
                    self.code.truncate(mark);
                    e
                })
            }
        }
    }

    /// The address of `name`, if it has been compiled or registered.
    /// A module-defined symbol always wins over a pre-bound external
    /// one of the same name, so self-recursion targets the freshly
    /// compiled body rather than a stale host stub.
    pub fn get_function(&self, name: &str) -> Option<usize> {
        self.defined.get(name).or_else(|| self.external.get(name)).copied()
    }

    fn lookup_existing(&self, name: &str) -> Option<usize> {
        self.defined
            .get(name)
            .or_else(|| self.external.get(name))
            .copied()
            .or_else(|| self.libraries.iter().find_map(|lib| lib.symbol(name)))
            .or_else(|| library::process_symbol(name))
    }

    fn collect_pending(&self, module: &Module) -> Vec<PendingFunc> {
        module
            .defined_functions()
            .map(|(_, func)| {
                let cloned = func.clone();
                let mut uses = Vec::new();
                for (inst_id, inst) in cloned.insts.iter() {
                    for (slot, op) in inst.operands.iter().enumerate() {
                        if let Operand::GlobalRef { id, addend, .. } = op {
                            uses.push(PendingUse {
                                inst: inst_id,
                                slot,
                                symbol: module.globals[*id].name.clone(),
                                addend: *addend,
                            });
                        }
                    }
                }
                PendingFunc { func: cloned, uses }
            })
            .collect()
    }

    /// Resolve every pending function's global operands, compile them,
    /// place the code, and make it callable.
    ///
    /// A function whose only unresolved operands target another
    /// function in this same worklist (a forward reference or
    /// self-recursion) is compiled twice: once with a zero placeholder
    /// so every function's final size and address can be computed,
    /// once more after placement to bake in the real address. Every
    /// backend encodes a resolved global operand as a fixed-width
    /// immediate load, so the second pass never changes a function's
    /// length — only `self.code.overwrite` is needed, not a re-place.
    fn resolve_and_place(&mut self, pending: Vec<PendingFunc>) -> CodegenResult<()> {
        if pending.is_empty() {
            return Ok(());
        }
        let names_in_batch: HashSet<String> = pending.iter().map(|p| p.func.name.clone()).collect();

        struct Staged {
            func: Function,
            uses: Vec<PendingUse>,
            needs_repatch: bool,
            code: CompiledFunction,
        }

        let mut staged = Vec::with_capacity(pending.len());
        for mut item in pending {
            let mut needs_repatch = false;
            for u in &item.uses {
                let addr: usize = if names_in_batch.contains(&u.symbol) {
                    needs_repatch = true;
                    0
                } else {
                    self.lookup_existing(&u.symbol).ok_or_else(|| {
                        CodegenError::NotFound(format!("unresolved global reference '{}'", u.symbol))
                    })?
                };
                let resolved = (addr as i64).wrapping_add(u.addend);
                let ty = item.func.insts[u.inst].operands[u.slot].ty().clone();
                item.func.insts[u.inst].operands[u.slot] = Operand::ImmI64(resolved, ty);
            }
            let code = self.compile_one(&item.func)?;
            staged.push(Staged { func: item.func, uses: item.uses, needs_repatch, code });
        }

        let mut in_progress: HashMap<String, usize> = HashMap::new();
        let mut addrs = Vec::with_capacity(staged.len());
        for s in &staged {
            let addr = self.code.place(&s.code.code)?;
            in_progress.insert(s.func.name.clone(), addr);
            addrs.push(addr);
        }

        for (s, &addr) in staged.iter_mut().zip(addrs.iter()) {
            if !s.needs_repatch {
                continue;
            }
            for u in &s.uses {
                if let Some(&final_addr) = in_progress.get(&u.symbol) {
                    let resolved = (final_addr as i64).wrapping_add(u.addend);
                    let ty = s.func.insts[u.inst].operands[u.slot].ty().clone();
                    s.func.insts[u.inst].operands[u.slot] = Operand::ImmI64(resolved, ty);
                }
            }
            let recompiled = self.compile_one(&s.func)?;
            self.code.overwrite(addr, &recompiled.code)?;
        }

        self.defined.extend(in_progress);
        self.code.finalize()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use liric_codegen::finalize::finalize;
    use liric_codegen::ir::{Instruction, Opcode, Type, VReg};

    fn int_op(v: i64) -> Operand {
        Operand::ImmI64(v, Type::I64)
    }

    #[test]
    fn compiles_and_calls_a_constant_function() {
        let mut module = Module::new();
        let id = module.declare_function("answer", Type::I64, vec![]);
        let f = &mut module.funcs[id];
        f.is_decl = false;
        let entry = f.create_block("entry");
        f.emit(entry, Instruction::new(Opcode::Ret, Type::I64, VReg::NONE, &[int_op(42)]));
        finalize(f);

        let mut jit = Jit::create().unwrap();
        jit.add_module(&module).unwrap();
        let addr = jit.get_function("answer").expect("should be compiled");
        let func: extern "C" fn() -> i64 = unsafe { std::mem::transmute(addr) };
        assert_eq!(func(), 42);
    }

    #[test]
    fn adds_two_params() {
        let mut module = Module::new();
        let id = module.declare_function("add", Type::I64, vec![Type::I64, Type::I64]);
        let f = &mut module.funcs[id];
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
        finalize(f);

        let mut jit = Jit::create().unwrap();
        jit.add_module(&module).unwrap();
        let addr = jit.get_function("add").unwrap();
        let func: extern "C" fn(i64, i64) -> i64 = unsafe { std::mem::transmute(addr) };
        assert_eq!(func(10, 32), 42);
    }

    #[test]
    fn self_recursive_call_resolves_to_its_own_address() {
        // A function whose body calls itself by name; never actually
        // invoked (it would never terminate), just compiled, to
        // exercise resolving a `global_ref` that targets the very
        // function being compiled.
        let mut module = Module::new();
        let id = module.declare_function("loopy", Type::I64, vec![Type::I64]);
        let callee = module.declare_global("loopy", Type::Ptr, false, true);
        let f = &mut module.funcs[id];
        f.is_decl = false;
        let entry = f.create_block("entry");
        let n = f.param_vregs[0];
        let r = f.alloc_vreg();
        f.emit(
            entry,
            Instruction::new(
                Opcode::Call,
                Type::I64,
                r,
                &[Operand::global(callee, Type::Ptr), Operand::VReg(n, Type::I64)],
            ),
        );
        f.emit(entry, Instruction::new(Opcode::Ret, Type::I64, VReg::NONE, &[Operand::VReg(r, Type::I64)]));
        finalize(f);

        let mut jit = Jit::create().unwrap();
        jit.add_module(&module).unwrap();
        let addr = jit.get_function("loopy").expect("should be compiled");
        assert_ne!(addr, 0);
    }

    #[test]
    fn vararg_call_flag_zeroes_al_without_disturbing_integer_args() {
        // SysV requires AL to hold the vector-register argument count
        // ahead of a variadic call; exercise that this doesn't clobber
        // the ordinary integer args passed to a two-parameter host fn.
        extern "C" fn sum(a: i64, b: i64) -> i64 {
            a + b
        }
        let mut module = Module::new();
        let id = module.declare_function("caller", Type::I64, vec![]);
        let callee = module.declare_global("sum", Type::Ptr, false, true);
        let f = &mut module.funcs[id];
        f.is_decl = false;
        let entry = f.create_block("entry");
        let r = f.alloc_vreg();
        let mut call = Instruction::new(
            Opcode::Call,
            Type::I64,
            r,
            &[Operand::global(callee, Type::Ptr), int_op(19), int_op(23)],
        );
        call.call_flags.vararg = true;
        f.emit(entry, call);
        f.emit(entry, Instruction::new(Opcode::Ret, Type::I64, VReg::NONE, &[Operand::VReg(r, Type::I64)]));
        finalize(f);

        let mut jit = Jit::create().unwrap();
        jit.add_symbol("sum", sum as usize).unwrap();
        jit.add_module(&module).unwrap();
        let addr = jit.get_function("caller").unwrap();
        let func: extern "C" fn() -> i64 = unsafe { std::mem::transmute(addr) };
        assert_eq!(func(), 42);
    }

    #[test]
    fn unresolved_symbol_fails_without_mutating_state() {
        let mut module = Module::new();
        let id = module.declare_function("caller", Type::I64, vec![]);
        let callee = module.declare_global("missing_callee", Type::Ptr, false, true);
        let f = &mut module.funcs[id];
        f.is_decl = false;
        let entry = f.create_block("entry");
        f.emit(entry, Instruction::new(Opcode::Ret, Type::I64, VReg::NONE, &[Operand::global(callee, Type::Ptr)]));
        finalize(f);

        let mut jit = Jit::create().unwrap();
        assert!(jit.add_module(&module).is_err());
        assert!(jit.get_function("caller").is_none());
    }

    #[test]
    fn add_symbol_then_lookup() {
        extern "C" fn host_fn() -> i64 {
            7
        }
        let mut jit = Jit::create().unwrap();
        jit.add_symbol("host_fn", host_fn as usize).unwrap();
        assert_eq!(jit.get_function("host_fn"), Some(host_fn as usize));
    }

    #[test]
    fn begin_update_without_end_is_rejected_on_second_begin() {
        let mut jit = Jit::create().unwrap();
        jit.begin_update().unwrap();
        assert!(jit.begin_update().is_err());
        jit.end_update().unwrap();
    }

    #[test]
    fn create_for_target_accepts_a_full_triple() {
        let jit = Jit::create_for_target("aarch64-unknown-linux-gnu").unwrap();
        assert_eq!(jit.isa.name(), "aarch64");
    }

    #[test]
    fn create_for_target_rejects_an_unsupported_architecture() {
        assert!(Jit::create_for_target("mips64-unknown-linux-gnu").is_err());
    }
}
