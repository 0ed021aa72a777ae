//! Target backends: instruction selection and machine-code encoding
//! (spec §4.5-4.9).
//!
//! None of these backends perform real register allocation. Every
//! vreg lives in its own stack slot ([`StackFrame`]); an instruction's
//! operands are loaded into scratch registers, the op is computed, and
//! the result is stored straight back. This is the same discipline
//! phi lowering already assumes (`crate::phi`: phis become
//! predecessor-local stack-slot copies), and it keeps each backend a
//! small, auditable "one IR instruction in, a handful of machine
//! instructions out" function instead of a liveness-driven allocator.

mod stack_frame;

pub mod aarch64;
pub mod riscv64;
pub mod stencil;
pub mod x86_64;

pub use stack_frame::StackFrame;

use crate::binemit::Reloc;
use crate::ir::{Function, Operand, Type};
use crate::result::{CodegenError, CodegenResult};
use target_lexicon::{Architecture, Triple};

/// Walk a `getelementptr`'s full index list the way spec §4.5
/// describes: the first index strides by the pointee type's size, and
/// each later index descends one level into the type reached so far —
/// a constant field index into a struct (via [`Type::field_offset`])
/// or any index into an array, scaled by the element's size. Byte
/// addition is commutative, so the walk collapses to one constant
/// addend plus a list of `(index operand, stride)` pairs a backend
/// still has to multiply and add at runtime — every backend was
/// previously only consuming the first index and silently dropping
/// the rest, which miscompiled any struct-descending or multi-level
/// `gep`.
pub fn gep_offset_plan<'a>(
    base_ty: &Type,
    indices: &'a [Operand],
) -> CodegenResult<(i64, Vec<(&'a Operand, u64)>)> {
    let (first, rest) = indices
        .split_first()
        .ok_or_else(|| CodegenError::backend("getelementptr has no indices"))?;
    let mut const_offset: i64 = 0;
    let mut scaled = vec![(first, base_ty.size().max(1))];
    let mut current = base_ty.clone();
    for idx in rest {
        match &current {
            Type::Struct { fields, .. } => {
                let field = idx.as_imm_i64().ok_or_else(|| {
                    CodegenError::backend("getelementptr struct index must be a constant")
                })? as usize;
                let field_ty = fields
                    .get(field)
                    .cloned()
                    .ok_or_else(|| CodegenError::backend("getelementptr struct index out of range"))?;
                const_offset += current.field_offset(field) as i64;
                current = field_ty;
            }
            Type::Array(elem, _) => {
                scaled.push((idx, elem.size().max(1)));
                current = (**elem).clone();
            }
            _ => {
                return Err(CodegenError::backend(
                    "getelementptr index descends into a non-aggregate type",
                ))
            }
        }
    }
    Ok((const_offset, scaled))
}

/// A fully machine-code-compiled function body.
///
/// Ready for a JIT to copy into executable memory (spec §4.10) or for
/// an external collaborator to place into an object file (spec §6,
/// out of scope here beyond carrying the relocations it would need).
#[derive(Clone, Debug, Default)]
pub struct CompiledFunction {
    pub code: Vec<u8>,
    pub relocs: Vec<Reloc>,
    /// Total stack frame size in bytes, informational.
    pub frame_size: u32,
}

/// A target backend: instruction selection plus encoding for one ISA.
///
/// Every `Operand::GlobalRef` reaching `compile_function` must already
/// have been resolved to `Operand::ImmI64` by the caller (spec §4.10
/// step 1, "resolve global operands" runs before ISel). Object-file
/// emission — which would instead need unresolved globals preserved
/// as link-time relocations — is an explicit non-goal.
pub trait TargetIsa {
    fn name(&self) -> &'static str;
    fn pointer_size(&self) -> u32;
    fn compile_function(&self, func: &Function) -> CodegenResult<CompiledFunction>;
}

/// Look up the backend for an already-parsed target triple (spec
/// §4.10's cross-compilation target selection), the way Cranelift's
/// `isa::lookup` dispatches on `triple.architecture` rather than
/// hand-matching a bare string.
pub fn lookup(triple: &Triple) -> CodegenResult<Box<dyn TargetIsa>> {
    match triple.architecture {
        Architecture::X86_64 => Ok(Box::new(x86_64::X86_64Isa::new())),
        Architecture::Aarch64(_) => Ok(Box::new(aarch64::Aarch64Isa::new())),
        Architecture::Riscv64(_) => Ok(Box::new(riscv64::Riscv64Isa::new())),
        other => Err(CodegenError::NotFound(format!("no backend for architecture '{other}'"))),
    }
}

/// Parse `name` — a bare architecture name (`"x86_64"`) or a full
/// target triple (`"riscv64gc-unknown-linux-gnu"`) — and look up its
/// backend, mirroring Cranelift's `isa::lookup_by_name` convenience
/// wrapper around `isa::lookup`. An unparsable or unsupported target
/// is rejected by `target-lexicon`'s own triple parser rather than by
/// an ad hoc string match.
pub fn lookup_by_name(name: &str) -> CodegenResult<Box<dyn TargetIsa>> {
    let triple: Triple = name
        .parse()
        .map_err(|_| CodegenError::NotFound(format!("not a recognized target triple: '{name}'")))?;
    lookup(&triple)
}

/// Build the backend for the host this process is running on.
pub fn host_isa() -> Box<dyn TargetIsa> {
    #[cfg(target_arch = "x86_64")]
    {
        Box::new(x86_64::X86_64Isa::new())
    }
    #[cfg(target_arch = "aarch64")]
    {
        Box::new(aarch64::Aarch64Isa::new())
    }
    #[cfg(target_arch = "riscv64")]
    {
        Box::new(riscv64::Riscv64Isa::new())
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "riscv64")))]
    {
        compile_error!("no LIRIC backend for this host architecture");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::VReg;

    #[test]
    fn single_index_gep_strides_by_pointee_size() {
        let idx = Operand::ImmI64(3, Type::I64);
        let (const_offset, scaled) = gep_offset_plan(&Type::I64, std::slice::from_ref(&idx)).unwrap();
        assert_eq!(const_offset, 0);
        assert_eq!(scaled.len(), 1);
        assert_eq!(scaled[0].1, 8);
    }

    #[test]
    fn struct_descent_uses_field_offset_as_a_constant_addend() {
        // { i32, i64 } — field 1 starts at byte 8 after i32 + padding.
        let struct_ty = Type::structure(vec![Type::I32, Type::I64], false);
        let indices = [Operand::ImmI64(0, Type::I64), Operand::ImmI64(1, Type::I32)];
        let (const_offset, scaled) = gep_offset_plan(&struct_ty, &indices).unwrap();
        assert_eq!(scaled.len(), 1); // only the leading array-style index is scaled
        assert_eq!(const_offset, struct_ty.field_offset(1) as i64);
        assert_eq!(const_offset, 8);
    }

    #[test]
    fn array_descent_scales_every_index_by_its_own_element_size() {
        // [4 x [2 x i32]] — a 2D array of i32.
        let inner = Type::array(Type::I32, 2);
        let outer = Type::array(inner.clone(), 4);
        let indices = [
            Operand::ImmI64(0, Type::I64),
            Operand::VReg(VReg::from_u32(1), Type::I64),
            Operand::VReg(VReg::from_u32(2), Type::I64),
        ];
        let (const_offset, scaled) = gep_offset_plan(&outer, &indices).unwrap();
        assert_eq!(const_offset, 0);
        assert_eq!(scaled.len(), 3);
        assert_eq!(scaled[0].1, outer.size()); // first index strides by the whole array
        assert_eq!(scaled[1].1, inner.size()); // second descends into [2 x i32]
        assert_eq!(scaled[2].1, Type::I32.size()); // third descends into i32
    }

    #[test]
    fn non_constant_struct_index_is_rejected() {
        let struct_ty = Type::structure(vec![Type::I32, Type::I64], false);
        let indices = [Operand::ImmI64(0, Type::I64), Operand::VReg(VReg::from_u32(1), Type::I32)];
        assert!(gep_offset_plan(&struct_ty, &indices).is_err());
    }

    #[test]
    fn no_indices_is_rejected_rather_than_panicking() {
        assert!(gep_offset_plan(&Type::I64, &[]).is_err());
    }

    #[test]
    fn lookup_by_name_accepts_a_bare_architecture_name() {
        assert_eq!(lookup_by_name("x86_64").unwrap().name(), "x86_64");
        assert_eq!(lookup_by_name("aarch64").unwrap().name(), "aarch64");
        assert_eq!(lookup_by_name("riscv64").unwrap().name(), "riscv64");
    }

    #[test]
    fn lookup_by_name_accepts_a_full_triple() {
        assert_eq!(lookup_by_name("aarch64-unknown-linux-gnu").unwrap().name(), "aarch64");
    }

    #[test]
    fn lookup_by_name_rejects_an_unsupported_architecture() {
        assert!(lookup_by_name("mips64-unknown-linux-gnu").is_err());
    }

    #[test]
    fn lookup_by_name_rejects_a_malformed_triple() {
        assert!(lookup_by_name("a-b-c-d-e").is_err());
    }
}
