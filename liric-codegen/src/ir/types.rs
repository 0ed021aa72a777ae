//! The type algebra (spec §3).
//!
//! Primitive types are unit variants, so two primitives built at
//! different times already compare equal and cost nothing to share —
//! there is no interning table for them. Compound types (`array`,
//! `struct`, `function`) nest via `Box`/`Vec` and are *not*
//! deduplicated: building `struct { i32 }` twice yields two distinct,
//! structurally-equal `Type` values, exactly as the spec requires.

use std::fmt;

/// A LIRIC IR type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Type {
    /// The empty type; only valid as a function return type.
    Void,
    /// A one-bit boolean-ish integer (the result of comparisons).
    I1,
    I8,
    I16,
    I32,
    I64,
    /// 32-bit IEEE-754 single precision.
    Float,
    /// 64-bit IEEE-754 double precision.
    Double,
    /// An opaque, target-pointer-sized pointer. The pointee is carried
    /// explicitly by `load`/`store`/`gep`, never by the type itself.
    Ptr,
    Array(Box<Type>, u64),
    Struct {
        fields: Vec<Type>,
        packed: bool,
    },
    Function {
        ret: Box<Type>,
        params: Vec<Type>,
        vararg: bool,
    },
}

impl Type {
    /// Construct an array type.
    pub fn array(elem: Type, count: u64) -> Type {
        Type::Array(Box::new(elem), count)
    }

    /// Construct a (non-packed) struct type.
    pub fn structure(fields: Vec<Type>, packed: bool) -> Type {
        Type::Struct { fields, packed }
    }

    /// Construct a function type.
    pub fn function(ret: Type, params: Vec<Type>, vararg: bool) -> Type {
        Type::Function {
            ret: Box::new(ret),
            params,
            vararg,
        }
    }

    /// Is this an integer type (`i1`..`i64`)?
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            Type::I1 | Type::I8 | Type::I16 | Type::I32 | Type::I64
        )
    }

    /// Is this a floating-point type?
    pub fn is_float(&self) -> bool {
        matches!(self, Type::Float | Type::Double)
    }

    /// Bit width of an integer type, if this is one.
    pub fn int_bits(&self) -> Option<u32> {
        match self {
            Type::I1 => Some(1),
            Type::I8 => Some(8),
            Type::I16 => Some(16),
            Type::I32 => Some(32),
            Type::I64 => Some(64),
            _ => None,
        }
    }

    /// Size in bytes, assuming an 8-byte pointer (all three in-scope
    /// targets are 64-bit). Struct fields are laid out in declaration
    /// order with per-field alignment unless `packed`; tail padding
    /// rounds the total up to the struct's own alignment.
    pub fn size(&self) -> u64 {
        match self {
            Type::Void => 0,
            Type::I1 | Type::I8 => 1,
            Type::I16 => 2,
            Type::I32 | Type::Float => 4,
            Type::I64 | Type::Double | Type::Ptr => 8,
            Type::Array(elem, count) => elem.size() * count,
            Type::Struct { fields, packed } => {
                let mut offset = 0u64;
                for f in fields {
                    if !packed {
                        offset = align_up(offset, f.align());
                    }
                    offset += f.size();
                }
                if *packed {
                    offset
                } else {
                    align_up(offset, self.align())
                }
            }
            Type::Function { .. } => 8, // function values decay to code pointers
        }
    }

    /// Natural alignment in bytes.
    pub fn align(&self) -> u64 {
        match self {
            Type::Void => 1,
            Type::I1 | Type::I8 => 1,
            Type::I16 => 2,
            Type::I32 | Type::Float => 4,
            Type::I64 | Type::Double | Type::Ptr | Type::Function { .. } => 8,
            Type::Array(elem, _) => elem.align(),
            Type::Struct { fields, packed } => {
                if *packed {
                    1
                } else {
                    fields.iter().map(Type::align).max().unwrap_or(1)
                }
            }
        }
    }

    /// Byte offset of field `index` within this struct.
    ///
    /// Panics if `self` is not a `Struct` or `index` is out of range —
    /// both are caller bugs (the parser and GEP lowering only ever
    /// call this after checking the type).
    pub fn field_offset(&self, index: usize) -> u64 {
        match self {
            Type::Struct { fields, packed } => {
                let mut offset = 0u64;
                for f in &fields[..index] {
                    if !packed {
                        offset = align_up(offset, f.align());
                    }
                    offset += f.size();
                }
                if !packed {
                    offset = align_up(offset, fields[index].align());
                }
                offset
            }
            _ => panic!("field_offset called on non-struct type"),
        }
    }
}

fn align_up(offset: u64, align: u64) -> u64 {
    if align == 0 {
        offset
    } else {
        (offset + align - 1) / align * align
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::I1 => write!(f, "i1"),
            Type::I8 => write!(f, "i8"),
            Type::I16 => write!(f, "i16"),
            Type::I32 => write!(f, "i32"),
            Type::I64 => write!(f, "i64"),
            Type::Float => write!(f, "float"),
            Type::Double => write!(f, "double"),
            Type::Ptr => write!(f, "ptr"),
            Type::Array(elem, count) => write!(f, "[{} x {}]", count, elem),
            Type::Struct { fields, packed } => {
                let inner = fields
                    .iter()
                    .map(|t| t.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                if *packed {
                    write!(f, "<{{ {} }}>", inner)
                } else {
                    write!(f, "{{ {} }}", inner)
                }
            }
            Type::Function {
                ret,
                params,
                vararg,
            } => {
                let mut parts: Vec<String> = params.iter().map(|t| t.to_string()).collect();
                if *vararg {
                    parts.push("...".to_string());
                }
                write!(f, "{} ({})", ret, parts.join(", "))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn struct_layout_matches_c_rules() {
        // { i8, i32, i8 } -> offsets 0, 4, 8; size rounds to align(4) => 12
        let s = Type::structure(vec![Type::I8, Type::I32, Type::I8], false);
        assert_eq!(s.field_offset(0), 0);
        assert_eq!(s.field_offset(1), 4);
        assert_eq!(s.field_offset(2), 8);
        assert_eq!(s.size(), 12);
        assert_eq!(s.align(), 4);
    }

    #[test]
    fn packed_struct_has_no_padding() {
        let s = Type::structure(vec![Type::I8, Type::I32, Type::I8], true);
        assert_eq!(s.field_offset(1), 1);
        assert_eq!(s.field_offset(2), 5);
        assert_eq!(s.size(), 6);
        assert_eq!(s.align(), 1);
    }

    #[test]
    fn array_size_is_elementwise() {
        let a = Type::array(Type::I64, 4);
        assert_eq!(a.size(), 32);
        assert_eq!(a.align(), 8);
    }

    #[test]
    fn compound_types_are_not_deduplicated() {
        let a = Type::structure(vec![Type::I32], false);
        let b = Type::structure(vec![Type::I32], false);
        assert_eq!(a, b);
        // Structural equality holds, but these really are two allocations;
        // nothing here asserts pointer identity, matching the spec's
        // "interned by construction but not deduplicated" wording.
    }
}
