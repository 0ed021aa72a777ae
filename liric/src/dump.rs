//! Textual IR dumper (spec §4.11): the inverse of `liric_reader`,
//! producing output re-parseable by it for the supported subset.
//!
//! [`liric_codegen::ir::Operand`]'s own `Display` prints a global
//! reference as its dense id (`@global3`) and a block reference as its
//! dense id (`label %block1`), which round-trips for nothing — the
//! parser only ever re-creates symbols and blocks by the names written
//! in the source. Every operand here is formatted through
//! [`DumpCtx::operand`]/[`DumpCtx::global`]/[`DumpCtx::block`] instead,
//! which resolve ids back to the names the module and function already
//! carry for exactly this purpose.

use liric_codegen::ir::{
    BlockId, Function, GlobalId, Instruction, Module, Opcode, Operand, Type,
};
use std::io::{self, Write};

struct DumpCtx<'a> {
    module: &'a Module,
    func: &'a Function,
}

impl<'a> DumpCtx<'a> {
    fn global(&self, id: GlobalId, addend: i64) -> String {
        let name = &self.module.globals[id].name;
        if addend == 0 {
            format!("@{name}")
        } else {
            format!("@{name}+{addend}")
        }
    }

    fn block(&self, id: BlockId) -> &str {
        &self.func.blocks[id].name
    }

    /// Format an operand in `<type> <value>` form, as it appears
    /// everywhere except inside a `phi` bracket.
    fn operand(&self, op: &Operand) -> String {
        match op {
            Operand::GlobalRef { id, ty, addend } => format!("{} {}", ty, self.global(*id, *addend)),
            Operand::BlockRef(b) => format!("label %{}", self.block(*b)),
            other => other.to_string(),
        }
    }

    /// Format an operand's bare value, with no type prefix — the form
    /// `phi`'s bracket entries use.
    fn bare(&self, op: &Operand) -> String {
        match op {
            Operand::GlobalRef { id, addend, .. } => self.global(*id, *addend),
            Operand::VReg(v, _) => v.to_string(),
            Operand::ImmI64(v, _) => v.to_string(),
            Operand::ImmF64(v, _) => v.to_string(),
            Operand::Null(_) => "null".to_string(),
            Operand::Undef(_) => "undef".to_string(),
            Operand::BlockRef(b) => format!("%{}", self.block(*b)),
        }
    }
}

pub fn dump_module(module: &Module, out: &mut dyn Write) -> io::Result<()> {
    let mut any_global = false;
    for (_, g) in module.globals.iter() {
        dump_global(module, g, out)?;
        any_global = true;
    }
    if any_global {
        writeln!(out)?;
    }
    for (_, f) in module.funcs.iter() {
        if f.is_decl {
            dump_declare(f, out)?;
        } else {
            dump_define(module, f, out)?;
            writeln!(out)?;
        }
    }
    Ok(())
}

fn dump_global(module: &Module, g: &liric_codegen::ir::Global, out: &mut dyn Write) -> io::Result<()> {
    let kind = if g.is_const { "constant" } else { "global" };
    let linkage = if g.is_external { "external " } else { "" };
    match g.init_data {
        Some(handle) if !g.is_external => {
            let bytes = module.arena.bytes(handle);
            let init = decode_scalar_init(&g.ty, bytes).unwrap_or_else(|| "zeroinitializer".to_string());
            writeln!(out, "@{} = {}{} {} {}", g.name, linkage, kind, g.ty, init)
        }
        _ => writeln!(out, "@{} = {}{} {}", g.name, linkage, kind, g.ty),
    }
}

/// Decode a scalar initializer's little-endian bytes back to a
/// literal. Aggregate initializers fall back to `zeroinitializer` in
/// the caller — reconstructing their exact literal syntax from raw
/// bytes alone isn't attempted.
fn decode_scalar_init(ty: &Type, bytes: &[u8]) -> Option<String> {
    let read_u64 = |n: usize| -> u64 {
        let mut buf = [0u8; 8];
        let n = n.min(8).min(bytes.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        u64::from_le_bytes(buf)
    };
    match ty {
        Type::I1 | Type::I8 => Some((read_u64(1) as i64).to_string()),
        Type::I16 => Some((read_u64(2) as i64).to_string()),
        Type::I32 => Some((read_u64(4) as i32 as i64).to_string()),
        Type::I64 => Some((read_u64(8) as i64).to_string()),
        Type::Float => {
            let mut buf = [0u8; 4];
            let n = 4.min(bytes.len());
            buf[..n].copy_from_slice(&bytes[..n]);
            Some(f32::from_le_bytes(buf).to_string())
        }
        Type::Double => {
            let mut buf = [0u8; 8];
            let n = 8.min(bytes.len());
            buf[..n].copy_from_slice(&bytes[..n]);
            Some(f64::from_le_bytes(buf).to_string())
        }
        _ => None,
    }
}

fn signature(f: &Function) -> String {
    let params = f
        .param_types
        .iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    format!("{} @{}({})", f.ty, f.name, params)
}

fn dump_declare(f: &Function, out: &mut dyn Write) -> io::Result<()> {
    writeln!(out, "declare {}", signature(f))
}

fn dump_define(module: &Module, f: &Function, out: &mut dyn Write) -> io::Result<()> {
    let ctx = DumpCtx { module, func: f };
    writeln!(out, "define {} {{", signature(f))?;
    for &block in &f.block_order {
        writeln!(out, "{}:", f.blocks[block].name)?;
        for &inst_id in &f.blocks[block].insts {
            let inst = &f.insts[inst_id];
            write!(out, "  ")?;
            if !inst.dest.is_none() {
                write!(out, "{} = ", inst.dest)?;
            }
            dump_instruction(&ctx, inst, out)?;
            writeln!(out)?;
        }
    }
    write!(out, "}}")
}

fn dump_instruction(ctx: &DumpCtx, inst: &Instruction, out: &mut dyn Write) -> io::Result<()> {
    use Opcode::*;
    match inst.opcode {
        Add | Sub | Mul | SDiv | UDiv | SRem | URem | And | Or | Xor | Shl | Ashr | Lshr | FAdd
        | FSub | FMul | FDiv => write!(
            out,
            "{} {} {}, {}",
            inst.opcode,
            inst.ty,
            ctx.bare(&inst.operands[0]),
            ctx.bare(&inst.operands[1])
        ),
        FNeg => write!(out, "fneg {} {}", inst.ty, ctx.bare(&inst.operands[0])),
        ICmp(pred) => write!(
            out,
            "icmp {} {} {}, {}",
            pred.as_str(),
            inst.operands[0].ty(),
            ctx.bare(&inst.operands[0]),
            ctx.bare(&inst.operands[1])
        ),
        FCmp(pred) => write!(
            out,
            "fcmp {} {} {}, {}",
            pred.as_str(),
            inst.operands[0].ty(),
            ctx.bare(&inst.operands[0]),
            ctx.bare(&inst.operands[1])
        ),
        Load => write!(out, "load {}, {}", inst.ty, ctx.operand(&inst.operands[0])),
        Store => write!(
            out,
            "store {}, {}",
            ctx.operand(&inst.operands[0]),
            ctx.operand(&inst.operands[1])
        ),
        Alloca => {
            if inst.operands.is_empty() {
                write!(out, "alloca {}", inst.ty)
            } else {
                write!(out, "alloca {}, {}", inst.ty, ctx.operand(&inst.operands[0]))
            }
        }
        Gep => {
            write!(out, "getelementptr {}, {}", inst.ty, ctx.operand(&inst.operands[0]))?;
            for idx in &inst.operands[1..] {
                write!(out, ", {}", ctx.operand(idx))?;
            }
            Ok(())
        }
        Br => write!(out, "br label %{}", ctx.block(inst.operands[0].as_block().expect("br target"))),
        CondBr => write!(
            out,
            "br {}, label %{}, label %{}",
            ctx.operand(&inst.operands[0]),
            ctx.block(inst.operands[1].as_block().expect("condbr true target")),
            ctx.block(inst.operands[2].as_block().expect("condbr false target")),
        ),
        Ret => write!(out, "ret {}", ctx.operand(&inst.operands[0])),
        RetVoid => write!(out, "ret void"),
        Unreachable => write!(out, "unreachable"),
        Sext | Zext | Trunc | SiToFp | UiToFp | FpToSi | FpToUi | FpExt | FpTrunc | Bitcast
        | IntToPtr | PtrToInt => {
            write!(out, "{} {} to {}", inst.opcode, ctx.operand(&inst.operands[0]), inst.ty)
        }
        Call => {
            write!(out, "call {} {}(", inst.ty, ctx.operand_bare_callee(&inst.operands[0]))?;
            for (i, arg) in inst.operands[1..].iter().enumerate() {
                if i > 0 {
                    write!(out, ", ")?;
                }
                write!(out, "{}", ctx.operand(arg))?;
            }
            if inst.call_flags.vararg {
                if inst.operands.len() > 1 {
                    write!(out, ", ")?;
                }
                write!(out, "...")?;
            }
            write!(out, ")")
        }
        Phi => {
            write!(out, "phi {} ", inst.ty)?;
            for (i, pair) in inst.operands.chunks(2).enumerate() {
                if i > 0 {
                    write!(out, ", ")?;
                }
                let pred = pair[1].as_block().expect("phi predecessor label");
                write!(out, "[ {}, %{} ]", ctx.bare(&pair[0]), ctx.block(pred))?;
            }
            Ok(())
        }
        Select => write!(
            out,
            "select {}, {}, {}",
            ctx.operand(&inst.operands[0]),
            ctx.operand(&inst.operands[1]),
            ctx.operand(&inst.operands[2])
        ),
        ExtractValue => {
            write!(out, "extractvalue {}", ctx.operand(&inst.operands[0]))?;
            for idx in &inst.indices {
                write!(out, ", {}", idx)?;
            }
            Ok(())
        }
        InsertValue => {
            write!(
                out,
                "insertvalue {}, {}",
                ctx.operand(&inst.operands[0]),
                ctx.operand(&inst.operands[1])
            )?;
            for idx in &inst.indices {
                write!(out, ", {}", idx)?;
            }
            Ok(())
        }
        Copy => write!(out, "; copy (phi-lowering artifact, not textual IR)"),
    }
}

impl<'a> DumpCtx<'a> {
    /// The callee position of a `call`: a bare `@name`/`%vreg`, never
    /// type-prefixed (the parser reads the return type separately,
    /// before the callee token).
    fn operand_bare_callee(&self, op: &Operand) -> String {
        match op {
            Operand::GlobalRef { id, addend, .. } => self.global(*id, *addend),
            Operand::VReg(v, _) => v.to_string(),
            other => other.to_string(),
        }
    }
}
