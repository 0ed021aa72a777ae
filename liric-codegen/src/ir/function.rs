use crate::finalize::FinalizedFunction;
use crate::ir::{Block, BlockId, Instruction, InstId, Type, VReg};
use liric_entity::{entity_ref, PrimaryMap};

entity_ref!(
    /// A reference to a function, dense within its owning module.
    FuncId,
    "func"
);

/// A function: its signature, its arena-owned blocks and instructions,
/// and (once computed) its finalized dense caches.
#[derive(Clone, Debug)]
pub struct Function {
    pub name: String,
    pub ty: Type,
    pub param_types: Vec<Type>,
    /// Dense parameter vregs, `1..=N` in declaration order.
    pub param_vregs: Vec<VReg>,
    next_vreg: u32,
    pub blocks: PrimaryMap<BlockId, Block>,
    /// Block allocation order. `PrimaryMap` iteration order already
    /// matches allocation order, but keeping this explicit mirrors the
    /// spec's "blocks (intrusive list)" and gives callers an ordered
    /// `Vec` without re-deriving it.
    pub block_order: Vec<BlockId>,
    pub insts: PrimaryMap<InstId, Instruction>,
    /// Distinguishes an externally-supplied declaration from a local
    /// definition; declarations have no blocks.
    pub is_decl: bool,
    pub(crate) cache: Option<FinalizedFunction>,
}

impl Function {
    /// Declare a function (no body).
    pub fn declare(name: impl Into<String>, ty: Type, param_types: Vec<Type>) -> Self {
        let n = param_types.len() as u32;
        Self {
            name: name.into(),
            ty,
            param_types,
            param_vregs: (1..=n).map(VReg::from_u32).collect(),
            next_vreg: n + 1,
            blocks: PrimaryMap::new(),
            block_order: Vec::new(),
            insts: PrimaryMap::new(),
            is_decl: true,
            cache: None,
        }
    }

    /// Allocate a fresh, function-local vreg.
    pub fn alloc_vreg(&mut self) -> VReg {
        let v = VReg::from_u32(self.next_vreg);
        self.next_vreg += 1;
        v
    }

    /// Highest vreg id allocated so far (0 if none).
    pub fn vreg_count(&self) -> u32 {
        self.next_vreg - 1
    }

    /// Allocate a new block, in allocation order.
    pub fn create_block(&mut self, name: impl Into<String>) -> BlockId {
        let id = self.blocks.push(Block::new(name));
        self.block_order.push(id);
        id
    }

    /// Append an instruction to the arena and to `block`'s order.
    pub fn emit(&mut self, block: BlockId, inst: Instruction) -> InstId {
        let id = self.insts.push(inst);
        self.blocks[block].push(id);
        self.cache = None;
        id
    }

    /// Whether every block ends in a terminator opcode (spec §3
    /// invariant; checked by the session before `func_end`).
    pub fn all_blocks_terminated(&self) -> bool {
        self.block_order.iter().all(|&b| match self.blocks[b].insts.last() {
            None => true,
            Some(&i) => self.insts[i].opcode.is_terminator(),
        })
    }

    /// The cached finalized view, if `finalize` has been run since the
    /// last mutation.
    pub fn finalized(&self) -> Option<&FinalizedFunction> {
        self.cache.as_ref()
    }
}
