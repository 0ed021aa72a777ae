use std::fmt;

/// The opcode carried by every instruction.
///
/// `udiv`/`urem`/`uitofp`/`fptoui` are kept as distinct opcodes (spec
/// §9 open question) rather than aliased onto their signed
/// counterparts at parse time: the parser accepts all eight
/// conversion/division mnemonics and records which one was written,
/// and ISel lowers the unsigned forms with zero-extending/unsigned
/// sequences. Silently aliasing them would be a correctness bug for
/// any operand whose high bit is set.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Opcode {
    // Arithmetic
    Add,
    Sub,
    Mul,
    SDiv,
    UDiv,
    SRem,
    URem,
    And,
    Or,
    Xor,
    Shl,
    Ashr,
    Lshr,
    FAdd,
    FSub,
    FMul,
    FDiv,
    FNeg,
    // Comparison
    ICmp(crate::ir::ICmpPredicate),
    FCmp(crate::ir::FCmpPredicate),
    // Memory
    Load,
    Store,
    Alloca,
    Gep,
    // Control flow
    Br,
    CondBr,
    Ret,
    RetVoid,
    Unreachable,
    // Conversions
    Sext,
    Zext,
    Trunc,
    SiToFp,
    UiToFp,
    FpToSi,
    FpToUi,
    FpExt,
    FpTrunc,
    Bitcast,
    IntToPtr,
    PtrToInt,
    // Aggregates
    ExtractValue,
    InsertValue,
    // Calls, merges, selects
    Call,
    Phi,
    Select,
    /// Not a textual-IR opcode: introduced by phi lowering
    /// (`crate::phi::apply_phi_copies`) to materialize a
    /// per-predecessor `dest = src` move once phis are resolved into
    /// stack-slot copies ahead of instruction selection.
    Copy,
}

impl Opcode {
    /// Whether this opcode must never be rewritten away by the
    /// peephole pass, regardless of whether its result is used
    /// (spec §4.3: "side-effecting opcodes").
    pub fn is_side_effecting(self) -> bool {
        matches!(
            self,
            Opcode::Store
                | Opcode::Call
                | Opcode::Br
                | Opcode::CondBr
                | Opcode::Ret
                | Opcode::RetVoid
                | Opcode::Unreachable
                | Opcode::Alloca
        )
    }

    /// Whether this opcode ends a basic block.
    pub fn is_terminator(self) -> bool {
        matches!(
            self,
            Opcode::Br | Opcode::CondBr | Opcode::Ret | Opcode::RetVoid | Opcode::Unreachable
        )
    }

    /// Whether this is a plain two-operand integer arithmetic opcode
    /// eligible for constant folding and identity elimination.
    pub fn is_binary_integer_arith(self) -> bool {
        matches!(
            self,
            Opcode::Add
                | Opcode::Sub
                | Opcode::Mul
                | Opcode::SDiv
                | Opcode::UDiv
                | Opcode::SRem
                | Opcode::URem
                | Opcode::And
                | Opcode::Or
                | Opcode::Xor
                | Opcode::Shl
                | Opcode::Ashr
                | Opcode::Lshr
        )
    }

    /// Whether this opcode performs a memory load (relevant to the
    /// redundant-load cache).
    pub fn is_load(self) -> bool {
        matches!(self, Opcode::Load)
    }

    /// Whether this opcode writes memory and thus flushes the
    /// redundant-load cache.
    pub fn flushes_load_cache(self) -> bool {
        matches!(self, Opcode::Store | Opcode::Call)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Opcode::Add => "add",
            Opcode::Sub => "sub",
            Opcode::Mul => "mul",
            Opcode::SDiv => "sdiv",
            Opcode::UDiv => "udiv",
            Opcode::SRem => "srem",
            Opcode::URem => "urem",
            Opcode::And => "and",
            Opcode::Or => "or",
            Opcode::Xor => "xor",
            Opcode::Shl => "shl",
            Opcode::Ashr => "ashr",
            Opcode::Lshr => "lshr",
            Opcode::FAdd => "fadd",
            Opcode::FSub => "fsub",
            Opcode::FMul => "fmul",
            Opcode::FDiv => "fdiv",
            Opcode::FNeg => "fneg",
            Opcode::ICmp(_) => "icmp",
            Opcode::FCmp(_) => "fcmp",
            Opcode::Load => "load",
            Opcode::Store => "store",
            Opcode::Alloca => "alloca",
            Opcode::Gep => "getelementptr",
            Opcode::Br => "br",
            Opcode::CondBr => "br",
            Opcode::Ret => "ret",
            Opcode::RetVoid => "ret",
            Opcode::Unreachable => "unreachable",
            Opcode::Sext => "sext",
            Opcode::Zext => "zext",
            Opcode::Trunc => "trunc",
            Opcode::SiToFp => "sitofp",
            Opcode::UiToFp => "uitofp",
            Opcode::FpToSi => "fptosi",
            Opcode::FpToUi => "fptoui",
            Opcode::FpExt => "fpext",
            Opcode::FpTrunc => "fptrunc",
            Opcode::Bitcast => "bitcast",
            Opcode::IntToPtr => "inttoptr",
            Opcode::PtrToInt => "ptrtoint",
            Opcode::ExtractValue => "extractvalue",
            Opcode::InsertValue => "insertvalue",
            Opcode::Call => "call",
            Opcode::Phi => "phi",
            Opcode::Select => "select",
            Opcode::Copy => "copy",
        };
        write!(f, "{}", s)
    }
}
