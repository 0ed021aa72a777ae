//! The object-file/executable emission collaborator interface (spec
//! §6).
//!
//! This crate does not write Mach-O or ELF bytes itself — that's the
//! external collaborator's job. What lives here is the seam: a
//! target descriptor, and iterators over a compiled module's
//! functions and globals in the shape that collaborator expects to
//! consume. [`emit_object`]/[`emit_exe`] are the hooks a real
//! collaborator plugs into; absent one, they report the same
//! `Backend` error the session facade surfaces for `LIRIC_COMPILE_MODE=llvm`
//! when no LLVM collaborator is linked in (spec §6).

use liric_codegen::binemit::Reloc;
use liric_codegen::ir::{Global, Module};
use liric_codegen::result::CodegenError;
use std::io::Write;

/// A function's machine code and outstanding relocations, ready for
/// an object-file emitter to place into a section.
#[derive(Clone, Debug)]
pub struct FunctionRecord<'a> {
    pub name: &'a str,
    pub code: &'a [u8],
    pub relocs: &'a [Reloc],
}

/// A global's initializer bytes (if any) and outstanding relocations.
#[derive(Clone, Debug)]
pub struct GlobalRecord<'a> {
    pub name: &'a str,
    pub init_data: Option<&'a [u8]>,
    pub is_const: bool,
    pub is_external: bool,
}

/// Describes the target an object/executable emitter should produce
/// code for.
#[derive(Clone, Debug)]
pub struct TargetDescriptor {
    pub name: &'static str,
    pub pointer_size: u8,
}

/// Everything an external collaborator needs to place a compiled
/// module's functions and globals into an object file.
///
/// `compiled` pairs each defined function's name with the
/// [`liric_codegen::isa::CompiledFunction`] produced by the ISel
/// backend; callers (the session facade, or a batch driver) are
/// responsible for compiling every defined function before building
/// this view.
pub struct ModuleArtifacts<'a> {
    module: &'a Module,
    compiled: &'a std::collections::HashMap<String, liric_codegen::isa::CompiledFunction>,
    arena_bytes: std::collections::HashMap<usize, Vec<u8>>,
}

impl<'a> ModuleArtifacts<'a> {
    pub fn new(
        module: &'a Module,
        compiled: &'a std::collections::HashMap<String, liric_codegen::isa::CompiledFunction>,
    ) -> Self {
        let mut arena_bytes = std::collections::HashMap::new();
        for (idx, g) in module.globals.iter() {
            if let Some(handle) = g.init_data {
                arena_bytes.insert(idx.as_u32() as usize, module.arena.bytes(handle).to_vec());
            }
        }
        ModuleArtifacts { module, compiled, arena_bytes }
    }

    /// Iterate over every defined (non-declaration) function that has
    /// a compiled artifact.
    pub fn functions(&self) -> impl Iterator<Item = FunctionRecord<'_>> {
        self.module.defined_functions().filter_map(move |(_, f)| {
            self.compiled.get(&f.name).map(|c| FunctionRecord {
                name: &f.name,
                code: &c.code,
                relocs: &c.relocs,
            })
        })
    }

    pub fn globals(&self) -> impl Iterator<Item = GlobalRecord<'_>> {
        self.module.globals.iter().map(move |(idx, g): (_, &Global)| GlobalRecord {
            name: &g.name,
            init_data: self.arena_bytes.get(&(idx.as_u32() as usize)).map(|v| v.as_slice()),
            is_const: g.is_const,
            is_external: g.is_external,
        })
    }
}

/// Write an object file for `artifacts` targeting `target` to `out`.
///
/// Always fails with [`CodegenError::Backend`] — object-file writing
/// is the external collaborator's responsibility (spec §6); this hook
/// exists so the session facade has a single call site to invoke once
/// a real collaborator is linked in.
pub fn emit_object(
    _artifacts: &ModuleArtifacts<'_>,
    _target: &TargetDescriptor,
    _out: &mut dyn Write,
) -> Result<(), CodegenError> {
    Err(CodegenError::backend(
        "object-file emission requires an external collaborator module; none is linked in",
    ))
}

/// Write an executable for `artifacts` targeting `target` to `out`.
///
/// Same caveat as [`emit_object`].
pub fn emit_exe(
    _artifacts: &ModuleArtifacts<'_>,
    _target: &TargetDescriptor,
    _entry: &str,
    _out: &mut dyn Write,
) -> Result<(), CodegenError> {
    Err(CodegenError::backend(
        "executable emission requires an external collaborator module; none is linked in",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use liric_codegen::ir::Type;

    #[test]
    fn iterates_globals_with_init_bytes() {
        let mut module = Module::new();
        let id = module.declare_global("g", Type::I64, true, false);
        let handle = module.arena.strdup(&42i64.to_le_bytes());
        module.globals[id].init_data = Some(handle);
        let compiled = std::collections::HashMap::new();
        let artifacts = ModuleArtifacts::new(&module, &compiled);
        let recs: Vec<_> = artifacts.globals().collect();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].init_data.unwrap(), &42i64.to_le_bytes());
    }

    #[test]
    fn emit_object_reports_missing_collaborator() {
        let module = Module::new();
        let compiled = std::collections::HashMap::new();
        let artifacts = ModuleArtifacts::new(&module, &compiled);
        let target = TargetDescriptor { name: "x86_64", pointer_size: 8 };
        let mut buf = Vec::new();
        assert!(emit_object(&artifacts, &target, &mut buf).is_err());
    }
}
