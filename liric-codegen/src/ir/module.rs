use crate::arena::Arena;
use crate::ir::{Function, FuncId, Global, GlobalId, SymbolTable, Type};
use liric_entity::PrimaryMap;

/// An in-memory compilation unit: an arena-owned set of functions and
/// globals plus the module-local symbol table.
///
/// The arena is released as a whole when the module is dropped;
/// nothing inside it is ever individually freed (spec §3 Lifecycle).
#[derive(Debug)]
pub struct Module {
    pub arena: Arena,
    pub funcs: PrimaryMap<FuncId, Function>,
    pub globals: PrimaryMap<GlobalId, Global>,
    pub symtab: SymbolTable,
    func_by_name: std::collections::HashMap<String, FuncId>,
    global_by_name: std::collections::HashMap<String, GlobalId>,
}

impl Module {
    pub fn new() -> Self {
        Self {
            arena: Arena::default(),
            funcs: PrimaryMap::new(),
            globals: PrimaryMap::new(),
            symtab: SymbolTable::new(),
            func_by_name: std::collections::HashMap::new(),
            global_by_name: std::collections::HashMap::new(),
        }
    }

    /// Declare (or re-fetch) a function by name. A second declaration
    /// of the same name returns the existing id, matching the parser's
    /// forward-reference semantics.
    pub fn declare_function(&mut self, name: &str, ty: Type, param_types: Vec<Type>) -> FuncId {
        if let Some(&id) = self.func_by_name.get(name) {
            return id;
        }
        self.symtab.intern(name);
        let id = self.funcs.push(Function::declare(name, ty, param_types));
        self.func_by_name.insert(name.to_string(), id);
        id
    }

    pub fn find_function(&self, name: &str) -> Option<FuncId> {
        self.func_by_name.get(name).copied()
    }

    /// Declare (or re-fetch) a global by name.
    pub fn declare_global(&mut self, name: &str, ty: Type, is_const: bool, is_external: bool) -> GlobalId {
        if let Some(&id) = self.global_by_name.get(name) {
            return id;
        }
        self.symtab.intern(name);
        let id = self
            .globals
            .push(Global::new(name, ty, is_const, is_external));
        self.global_by_name.insert(name.to_string(), id);
        id
    }

    pub fn find_global(&self, name: &str) -> Option<GlobalId> {
        self.global_by_name.get(name).copied()
    }

    /// Iterate over non-declaration functions, in declaration order.
    pub fn defined_functions(&self) -> impl Iterator<Item = (FuncId, &Function)> {
        self.funcs.iter().filter(|(_, f)| !f.is_decl)
    }
}

impl Default for Module {
    fn default() -> Self {
        Self::new()
    }
}
