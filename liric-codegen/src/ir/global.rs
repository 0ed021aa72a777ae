use crate::arena::ArenaBytes;
use crate::ir::Type;
use liric_entity::entity_ref;

entity_ref!(
    /// A reference to a global, dense within its owning module.
    GlobalId,
    "global"
);

/// A pointer-to-symbol fixup embedded inside an aggregate initializer.
///
/// Recorded instead of bytes whenever a pointer-typed field's
/// initializer names another global or function: the target's final
/// address isn't known until link/JIT time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Relocation {
    /// Byte offset within the global's `init_data`.
    pub offset: u32,
    /// Name of the referenced symbol (global or function).
    pub symbol_name: String,
    /// Constant addend applied to the resolved address.
    pub addend: i64,
}

/// A module-level global variable or external data symbol.
#[derive(Clone, Debug)]
pub struct Global {
    pub name: String,
    pub ty: Type,
    /// Raw little-endian initializer bytes, if any were given.
    /// Pointer-typed fields pointing at other symbols are recorded as
    /// `relocations` instead of bytes (the bytes at that offset are
    /// left zero and patched by the JIT/linker).
    pub init_data: Option<ArenaBytes>,
    pub relocations: Vec<Relocation>,
    pub is_const: bool,
    pub is_external: bool,
}

impl Global {
    pub fn new(name: impl Into<String>, ty: Type, is_const: bool, is_external: bool) -> Self {
        Self {
            name: name.into(),
            ty,
            init_data: None,
            relocations: Vec::new(),
            is_const,
            is_external,
        }
    }
}
