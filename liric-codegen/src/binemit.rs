//! The machine-code encoder's output buffer (spec §4, "Machine-code
//! encoder").
//!
//! Backends append raw bytes as they lower each instruction and
//! record fixups for anything that can't be resolved until every
//! block's final offset is known (branch targets) or until link/JIT
//! time (calls to not-yet-compiled functions, global references).
//! `CodeBuffer::resolve_branches` applies the first kind; the second
//! kind is surfaced as [`Reloc`] entries for the caller (the JIT or an
//! external object-file emitter) to patch in.

use crate::ir::BlockId;

/// A byte offset into a function's code buffer.
pub type CodeOffset = u32;

/// The kind of relocation recorded at a call site or data reference
/// whose target address isn't known until link/JIT time.
///
/// Numeric assignments are fixed so an external object-file emitter
/// and this encoder agree on them (spec §6).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum RelocKind {
    X86_64Pc32 = 1,
    Arm64Branch26 = 2,
    Riscv64Jal = 3,
    Abs8 = 4,
}

/// A relocation against an external symbol, recorded at `offset` in
/// the function's code buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reloc {
    pub offset: CodeOffset,
    pub kind: RelocKind,
    pub symbol_name: String,
    pub addend: i64,
}

/// An in-buffer branch fixup: a `len`-byte (1 or 4) relative or
/// absolute immediate at `offset` that must be patched once
/// `target`'s final code offset is known.
#[derive(Clone, Debug)]
pub(crate) struct BranchFixup {
    pub offset: CodeOffset,
    pub target: BlockId,
    pub len: u8,
    pub pc_relative_from: CodeOffset,
}

/// The growable byte buffer a backend encodes into, plus its
/// outstanding fixups.
#[derive(Default)]
pub struct CodeBuffer {
    pub data: Vec<u8>,
    pub(crate) branch_fixups: Vec<BranchFixup>,
    pub relocs: Vec<Reloc>,
    pub(crate) block_offsets: liric_entity::SecondaryMap<BlockId, CodeOffset>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offset(&self) -> CodeOffset {
        self.data.len() as CodeOffset
    }

    pub fn put1(&mut self, b: u8) {
        self.data.push(b);
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn put4_le(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put8_le(&mut self, v: u64) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    /// Record the current offset as `block`'s code address.
    pub fn mark_block(&mut self, block: BlockId) {
        let off = self.offset();
        self.block_offsets[block] = off;
    }

    /// Reserve a 4-byte placeholder for a PC-relative branch and
    /// record it for later patching.
    pub fn branch32_fixup(&mut self, target: BlockId) {
        let offset = self.offset();
        self.put4_le(0);
        self.branch_fixups.push(BranchFixup {
            offset,
            target,
            len: 4,
            pc_relative_from: offset + 4,
        });
    }

    /// Reserve a `len`-byte placeholder (1, 2 or 4 bytes) for a
    /// PC-relative branch whose displacement is measured from
    /// `pc_relative_from` (needed on architectures where the PC base
    /// for the relative offset isn't simply "end of the immediate",
    /// e.g. AArch64's instruction-start-relative encoding).
    pub fn branch_fixup_at(&mut self, len: u8, pc_relative_from_delta: i32, target: BlockId) {
        let offset = self.offset();
        for _ in 0..len {
            self.put1(0);
        }
        let pc_relative_from = (offset as i64 + pc_relative_from_delta as i64) as CodeOffset;
        self.branch_fixups.push(BranchFixup {
            offset,
            target,
            len,
            pc_relative_from,
        });
    }

    pub fn add_reloc(&mut self, kind: RelocKind, symbol_name: impl Into<String>, addend: i64) {
        let offset = self.offset();
        self.relocs.push(Reloc {
            offset,
            kind,
            symbol_name: symbol_name.into(),
            addend,
        });
    }

    /// Patch every recorded branch fixup now that all blocks have
    /// been marked. x86_64/riscv64 fixups are little-endian signed
    /// `len`-byte relative displacements; AArch64 fixups additionally
    /// need shifting into an instruction's immediate field, which the
    /// AArch64 backend does itself by passing a pre-shifted `len`.
    pub fn resolve_branches(&mut self) {
        for fx in &self.branch_fixups {
            let target_off = self.block_offsets[fx.target] as i64;
            let rel = target_off - fx.pc_relative_from as i64;
            let bytes = (rel as i32).to_le_bytes();
            let at = fx.offset as usize;
            self.data[at..at + fx.len as usize].copy_from_slice(&bytes[..fx.len as usize]);
        }
    }
}
