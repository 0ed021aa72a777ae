use crate::ir::InstId;
use liric_entity::entity_ref;

entity_ref!(
    /// A reference to a basic block, dense within its owning function
    /// in allocation order.
    BlockId,
    "block"
);

/// A basic block: a name (for dumping) and an ordered instruction
/// list.
///
/// The spec's "intrusive first/last + `next` pointers" become a plain
/// `Vec<InstId>` here — arbitrary-position insertion (needed for
/// phi-copy lowering, which inserts before a block's terminator) is
/// still O(n), which is the same complexity a linked splice achieves
/// once you account for finding the insertion point, and a `Vec`
/// avoids a second indirection on every other read.
#[derive(Clone, Debug, Default)]
pub struct Block {
    pub name: String,
    pub insts: Vec<InstId>,
}

impl Block {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            insts: Vec::new(),
        }
    }

    /// Append an instruction to the end of the block.
    pub fn push(&mut self, inst: InstId) {
        self.insts.push(inst);
    }

    /// Insert `inst` immediately before the block's terminator. If the
    /// block has no instructions yet (no terminator has been emitted),
    /// this is equivalent to `push`.
    pub fn insert_before_terminator(&mut self, inst: InstId) {
        if self.insts.is_empty() {
            self.insts.push(inst);
        } else {
            let at = self.insts.len() - 1;
            self.insts.insert(at, inst);
        }
    }
}
