use crate::ir::{BlockId, GlobalId, Type, VReg};
use std::fmt;

/// A tagged value carried by an instruction (spec §3).
///
/// An operand's type is advisory for most opcodes — the owning
/// instruction's result type is authoritative for arithmetic — but is
/// load-bearing for `imm_i64`/`imm_f64`/`null`/`undef`, which have no
/// other way to know their width.
#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    VReg(VReg, Type),
    ImmI64(i64, Type),
    ImmF64(f64, Type),
    BlockRef(BlockId),
    /// A reference to a global, optionally offset by `addend` bytes
    /// (used to select a byte offset within an aggregate global).
    GlobalRef {
        id: GlobalId,
        ty: Type,
        addend: i64,
    },
    Null(Type),
    Undef(Type),
}

impl Operand {
    /// Build an unoffset global reference.
    pub fn global(id: GlobalId, ty: Type) -> Operand {
        Operand::GlobalRef { id, ty, addend: 0 }
    }

    /// The operand's advisory type.
    pub fn ty(&self) -> &Type {
        match self {
            Operand::VReg(_, t) => t,
            Operand::ImmI64(_, t) => t,
            Operand::ImmF64(_, t) => t,
            Operand::BlockRef(_) => &Type::Void,
            Operand::GlobalRef { ty, .. } => ty,
            Operand::Null(t) => t,
            Operand::Undef(t) => t,
        }
    }

    /// The vreg this operand reads, if it's a `VReg` operand.
    pub fn as_vreg(&self) -> Option<VReg> {
        match self {
            Operand::VReg(v, _) => Some(*v),
            _ => None,
        }
    }

    /// The block this operand names, if it's a `BlockRef` operand.
    pub fn as_block(&self) -> Option<BlockId> {
        match self {
            Operand::BlockRef(b) => Some(*b),
            _ => None,
        }
    }

    /// The constant integer value this operand carries, if it is a
    /// plain `i64` immediate (not `undef`/`null`).
    pub fn as_imm_i64(&self) -> Option<i64> {
        match self {
            Operand::ImmI64(v, _) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::VReg(v, t) => write!(f, "{} {}", t, v),
            Operand::ImmI64(v, t) => write!(f, "{} {}", t, v),
            Operand::ImmF64(v, t) => write!(f, "{} {}", t, v),
            Operand::BlockRef(b) => write!(f, "label %{}", b),
            Operand::GlobalRef { id, addend, .. } if *addend == 0 => write!(f, "@{}", id),
            Operand::GlobalRef { id, addend, .. } => write!(f, "@{}+{}", id, addend),
            Operand::Null(t) => write!(f, "{} null", t),
            Operand::Undef(t) => write!(f, "{} undef", t),
        }
    }
}

/// Predicate carried by `icmp`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ICmpPredicate {
    Eq,
    Ne,
    Slt,
    Sle,
    Sgt,
    Sge,
    Ult,
    Ule,
    Ugt,
    Uge,
}

impl ICmpPredicate {
    /// Evaluate this predicate on signed operands (the narrow-width
    /// unsigned variants are peephole-folded as signed too — see the
    /// open question in spec §9 about `udiv`/`urem`/unsigned aliasing).
    pub fn eval_i64(self, lhs: i64, rhs: i64) -> bool {
        match self {
            ICmpPredicate::Eq => lhs == rhs,
            ICmpPredicate::Ne => lhs != rhs,
            ICmpPredicate::Slt => lhs < rhs,
            ICmpPredicate::Sle => lhs <= rhs,
            ICmpPredicate::Sgt => lhs > rhs,
            ICmpPredicate::Sge => lhs >= rhs,
            ICmpPredicate::Ult => (lhs as u64) < (rhs as u64),
            ICmpPredicate::Ule => (lhs as u64) <= (rhs as u64),
            ICmpPredicate::Ugt => (lhs as u64) > (rhs as u64),
            ICmpPredicate::Uge => (lhs as u64) >= (rhs as u64),
        }
    }

    /// Textual mnemonic as it appears in the IR (`eq`, `slt`, …).
    pub fn as_str(self) -> &'static str {
        match self {
            ICmpPredicate::Eq => "eq",
            ICmpPredicate::Ne => "ne",
            ICmpPredicate::Slt => "slt",
            ICmpPredicate::Sle => "sle",
            ICmpPredicate::Sgt => "sgt",
            ICmpPredicate::Sge => "sge",
            ICmpPredicate::Ult => "ult",
            ICmpPredicate::Ule => "ule",
            ICmpPredicate::Ugt => "ugt",
            ICmpPredicate::Uge => "uge",
        }
    }

    /// Parse the textual mnemonic used in `icmp <pred> ...`.
    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "eq" => ICmpPredicate::Eq,
            "ne" => ICmpPredicate::Ne,
            "slt" => ICmpPredicate::Slt,
            "sle" => ICmpPredicate::Sle,
            "sgt" => ICmpPredicate::Sgt,
            "sge" => ICmpPredicate::Sge,
            "ult" => ICmpPredicate::Ult,
            "ule" => ICmpPredicate::Ule,
            "ugt" => ICmpPredicate::Ugt,
            "uge" => ICmpPredicate::Uge,
            _ => return None,
        })
    }
}

/// Predicate carried by `fcmp`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FCmpPredicate {
    Oeq,
    One,
    Olt,
    Ole,
    Ogt,
    Oge,
    Ord,
    Ueq,
    Une,
    Ult,
    Ule,
    Ugt,
    Uge,
    Uno,
}

impl FCmpPredicate {
    /// Evaluate against `f64` operands using IEEE-754 comparison
    /// semantics (`NaN` is unordered with everything, including itself).
    pub fn eval_f64(self, lhs: f64, rhs: f64) -> bool {
        let ordered = !lhs.is_nan() && !rhs.is_nan();
        match self {
            FCmpPredicate::Oeq => ordered && lhs == rhs,
            FCmpPredicate::One => ordered && lhs != rhs,
            FCmpPredicate::Olt => ordered && lhs < rhs,
            FCmpPredicate::Ole => ordered && lhs <= rhs,
            FCmpPredicate::Ogt => ordered && lhs > rhs,
            FCmpPredicate::Oge => ordered && lhs >= rhs,
            FCmpPredicate::Ord => ordered,
            FCmpPredicate::Ueq => !ordered || lhs == rhs,
            FCmpPredicate::Une => !ordered || lhs != rhs,
            FCmpPredicate::Ult => !ordered || lhs < rhs,
            FCmpPredicate::Ule => !ordered || lhs <= rhs,
            FCmpPredicate::Ugt => !ordered || lhs > rhs,
            FCmpPredicate::Uge => !ordered || lhs >= rhs,
            FCmpPredicate::Uno => !ordered,
        }
    }

    /// Textual mnemonic as it appears in the IR.
    pub fn as_str(self) -> &'static str {
        match self {
            FCmpPredicate::Oeq => "oeq",
            FCmpPredicate::One => "one",
            FCmpPredicate::Olt => "olt",
            FCmpPredicate::Ole => "ole",
            FCmpPredicate::Ogt => "ogt",
            FCmpPredicate::Oge => "oge",
            FCmpPredicate::Ord => "ord",
            FCmpPredicate::Ueq => "ueq",
            FCmpPredicate::Une => "une",
            FCmpPredicate::Ult => "ult",
            FCmpPredicate::Ule => "ule",
            FCmpPredicate::Ugt => "ugt",
            FCmpPredicate::Uge => "uge",
            FCmpPredicate::Uno => "uno",
        }
    }

    /// Parse the textual mnemonic used in `fcmp <pred> ...`.
    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "oeq" => FCmpPredicate::Oeq,
            "one" => FCmpPredicate::One,
            "olt" => FCmpPredicate::Olt,
            "ole" => FCmpPredicate::Ole,
            "ogt" => FCmpPredicate::Ogt,
            "oge" => FCmpPredicate::Oge,
            "ord" => FCmpPredicate::Ord,
            "ueq" => FCmpPredicate::Ueq,
            "une" => FCmpPredicate::Une,
            "ult" => FCmpPredicate::Ult,
            "ule" => FCmpPredicate::Ule,
            "ugt" => FCmpPredicate::Ugt,
            "uge" => FCmpPredicate::Uge,
            "uno" => FCmpPredicate::Uno,
            _ => return None,
        })
    }
}
