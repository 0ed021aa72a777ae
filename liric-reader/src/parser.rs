//! Recursive-descent parser building a [`liric_codegen::ir::Module`]
//! from the token stream (spec §4.2).
//!
//! The whole source is tokenized up front into a `Vec`, which makes
//! the "skip to the next column-1 top-level token" recovery rule (see
//! [`Parser::recover_to_top_level`]) a matter of scanning forward
//! through an index rather than re-lexing.

use crate::lexer::{Lexer, Token};
use liric_codegen::ir::{
    BlockId, CallFlags, FCmpPredicate, FuncId, ICmpPredicate, Instruction, Module, Opcode,
    Operand, Type, VReg,
};
use liric_codegen::result::ParseError;
use std::collections::HashMap;

pub struct Parser {
    toks: Vec<(Token, u32, u32)>,
    pos: usize,
    module: Module,
    type_aliases: HashMap<String, Type>,
    diagnostics: Vec<ParseError>,
}

/// Parse a full textual IR module.
///
/// On malformed top-level constructs the parser records a diagnostic
/// and skips forward to the next recognizable top-level start (spec's
/// "top-level recovery"), so a single typo doesn't prevent every other
/// function in the file from being reported. If any diagnostics were
/// recorded, the partially-built module is discarded and `Err` is
/// returned with the full list.
pub fn parse(src: &str) -> Result<Module, Vec<ParseError>> {
    let mut p = Parser::new(src);
    p.parse_module();
    if p.diagnostics.is_empty() {
        Ok(p.module)
    } else {
        Err(p.diagnostics)
    }
}

impl Parser {
    fn new(src: &str) -> Self {
        let mut lexer = Lexer::new(src);
        let mut toks = Vec::new();
        loop {
            let t = lexer.next();
            let is_eof = t.0 == Token::Eof;
            toks.push(t);
            if is_eof {
                break;
            }
        }
        Parser {
            toks,
            pos: 0,
            module: Module::new(),
            type_aliases: HashMap::new(),
            diagnostics: Vec::new(),
        }
    }

    fn cur(&self) -> &Token {
        &self.toks[self.pos].0
    }
    fn cur_pos(&self) -> (u32, u32) {
        (self.toks[self.pos].1, self.toks[self.pos].2)
    }
    fn bump(&mut self) -> Token {
        let t = self.toks[self.pos].0.clone();
        if self.pos + 1 < self.toks.len() {
            self.pos += 1;
        }
        t
    }
    fn at_eof(&self) -> bool {
        matches!(self.cur(), Token::Eof)
    }

    fn err(&mut self, msg: impl Into<String>) {
        let (line, col) = self.cur_pos();
        self.diagnostics.push(ParseError::new(line, col, msg));
    }

    fn expect(&mut self, t: &Token) -> bool {
        if self.cur() == t {
            self.bump();
            true
        } else {
            let found = self.cur().clone();
            self.err(format!("expected `{t}`, found `{found}`"));
            false
        }
    }

    fn eat_ident(&mut self, name: &str) -> bool {
        if matches!(self.cur(), Token::Ident(s) if s == name) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect_ident(&mut self) -> String {
        match self.bump() {
            Token::Ident(s) => s,
            other => {
                self.err(format!("expected identifier, found `{other}`"));
                String::new()
            }
        }
    }

    /// Skip forward to the next column-1 `define`/`declare`/`@`/`%`
    /// token, or EOF.
    fn recover_to_top_level(&mut self) {
        self.bump();
        while !self.at_eof() {
            let (_, col) = self.cur_pos();
            let is_anchor = col == 1
                && matches!(
                    self.cur(),
                    Token::GlobalVar(_) | Token::LocalVar(_)
                ) || matches!(self.cur(), Token::Ident(s) if (s == "define" || s == "declare") && col == 1);
            if is_anchor {
                return;
            }
            self.bump();
        }
    }

    fn parse_module(&mut self) {
        while !self.at_eof() {
            match self.cur().clone() {
                Token::Ident(kw) if kw == "define" => self.parse_define(),
                Token::Ident(kw) if kw == "declare" => self.parse_declare(),
                Token::LocalVar(name) => self.parse_type_alias_or_recover(name),
                Token::GlobalVar(name) => self.parse_global(name),
                Token::Ident(kw) if kw == "target" || kw == "source_filename" => {
                    log::debug!("skipping top-level `{kw}` directive");
                    self.recover_to_top_level();
                }
                _ => {
                    self.err(format!("unexpected top-level token `{}`", self.cur()));
                    self.recover_to_top_level();
                }
            }
        }
    }

    fn parse_type_alias_or_recover(&mut self, name: String) {
        let save = self.pos;
        self.bump(); // %name
        if self.cur() == &Token::Equals {
            self.bump();
            if self.eat_ident("type") {
                let ty = self.parse_type();
                self.type_aliases.insert(name, ty);
                return;
            }
        }
        self.pos = save;
        self.err("unrecognized top-level construct");
        self.recover_to_top_level();
    }

    // ---- types ----------------------------------------------------

    fn parse_type(&mut self) -> Type {
        let mut base = match self.bump() {
            Token::Ident(s) => match s.as_str() {
                "void" => Type::Void,
                "i1" => Type::I1,
                "i8" => Type::I8,
                "i16" => Type::I16,
                "i32" => Type::I32,
                "i64" => Type::I64,
                "float" => Type::Float,
                "double" => Type::Double,
                "ptr" => Type::Ptr,
                other => {
                    self.err(format!("unknown type `{other}`"));
                    Type::I64
                }
            },
            Token::LocalVar(name) => self.type_aliases.get(&name).cloned().unwrap_or(Type::Ptr),
            Token::LBracket => {
                let n = self.expect_int_lit();
                self.eat_ident("x");
                let elem = self.parse_type();
                self.expect(&Token::RBracket);
                Type::array(elem, n as u64)
            }
            Token::LBrace => {
                let fields = self.parse_type_list_until(&Token::RBrace);
                Type::structure(fields, false)
            }
            Token::LAngle => {
                if self.cur() == &Token::LBrace {
                    self.bump();
                    let fields = self.parse_type_list_until(&Token::RBrace);
                    self.expect(&Token::RAngle);
                    Type::structure(fields, true)
                } else {
                    // vector `<N x T>`, treated as an array.
                    let n = self.expect_int_lit();
                    self.eat_ident("x");
                    let elem = self.parse_type();
                    self.expect(&Token::RAngle);
                    Type::array(elem, n as u64)
                }
            }
            other => {
                self.err(format!("expected a type, found `{other}`"));
                Type::I64
            }
        };
        while self.cur() == &Token::Star {
            self.bump();
            base = Type::Ptr;
        }
        if self.cur() == &Token::LParen {
            self.bump();
            let (params, vararg) = self.parse_param_type_list();
            base = Type::function(base, params, vararg);
        }
        base
    }

    fn parse_type_list_until(&mut self, end: &Token) -> Vec<Type> {
        let mut out = Vec::new();
        if self.cur() == end {
            self.bump();
            return out;
        }
        loop {
            out.push(self.parse_type());
            if self.cur() == &Token::Comma {
                self.bump();
            } else {
                break;
            }
        }
        self.expect(end);
        out
    }

    /// `(T, T, ...)` after the `(` has already been consumed.
    fn parse_param_type_list(&mut self) -> (Vec<Type>, bool) {
        let mut params = Vec::new();
        let mut vararg = false;
        if self.cur() != &Token::RParen {
            loop {
                if self.cur() == &Token::Ellipsis {
                    self.bump();
                    vararg = true;
                } else {
                    params.push(self.parse_type());
                }
                if self.cur() == &Token::Comma {
                    self.bump();
                } else {
                    break;
                }
            }
        }
        self.expect(&Token::RParen);
        (params, vararg)
    }

    fn expect_int_lit(&mut self) -> i64 {
        match self.bump() {
            Token::IntLit(v) => v,
            other => {
                self.err(format!("expected an integer literal, found `{other}`"));
                0
            }
        }
    }

    // ---- top-level: globals, declare, define -----------------------

    fn parse_global(&mut self, name: String) {
        self.bump(); // @name
        self.expect(&Token::Equals);
        let is_external = self.eat_ident("external");
        let is_const = if self.eat_ident("constant") {
            true
        } else {
            self.eat_ident("global");
            false
        };
        let ty = self.parse_type();
        let id = self.module.declare_global(&name, ty.clone(), is_const, is_external);
        if !is_external {
            let init = if matches!(self.cur(), Token::Ident(s) if s == "zeroinitializer") {
                self.bump();
                None
            } else {
                Some(self.parse_constant(&ty))
            };
            if let Some(bytes) = init {
                let handle = self.module.arena.strdup(&bytes);
                self.module.globals[id].init_data = Some(handle);
            }
        }
    }

    /// Parse a scalar/aggregate constant initializer into little-endian
    /// bytes (spec's "global initializers"). Pointer-to-symbol fields
    /// are not resolved to bytes here; a full constant-expression walk
    /// recording relocations is future work tracked informally rather
    /// than implemented for every aggregate shape.
    fn parse_constant(&mut self, ty: &Type) -> Vec<u8> {
        match ty {
            Type::I1 | Type::I8 => vec![self.expect_int_lit() as u8],
            Type::I16 => (self.expect_int_lit() as u16).to_le_bytes().to_vec(),
            Type::I32 => (self.expect_int_lit() as u32).to_le_bytes().to_vec(),
            Type::I64 | Type::Ptr => (self.expect_int_lit() as u64).to_le_bytes().to_vec(),
            Type::Float => {
                let v = self.expect_float_lit();
                (v as f32).to_le_bytes().to_vec()
            }
            Type::Double => self.expect_float_lit().to_le_bytes().to_vec(),
            Type::Array(elem, count) => {
                if let Token::StringLit(bytes) = self.cur().clone() {
                    self.bump();
                    return bytes;
                }
                self.expect(&Token::LBracket);
                let mut out = Vec::new();
                for i in 0..*count {
                    out.extend(self.parse_constant(elem));
                    if i + 1 < *count {
                        self.expect(&Token::Comma);
                    }
                }
                self.expect(&Token::RBracket);
                out
            }
            Type::Struct { fields, .. } => {
                self.expect(&Token::LBrace);
                let mut out = Vec::new();
                for (i, f) in fields.iter().enumerate() {
                    out.extend(self.parse_constant(f));
                    if i + 1 < fields.len() {
                        self.expect(&Token::Comma);
                    }
                }
                self.expect(&Token::RBrace);
                out
            }
            _ => {
                self.err("unsupported constant initializer shape");
                Vec::new()
            }
        }
    }

    fn expect_float_lit(&mut self) -> f64 {
        match self.bump() {
            Token::FloatLit(v) => v,
            Token::IntLit(v) => v as f64,
            other => {
                self.err(format!("expected a float literal, found `{other}`"));
                0.0
            }
        }
    }

    fn parse_declare(&mut self) {
        self.bump(); // 'declare'
        let ret = self.parse_type();
        let name = self.expect_global_name();
        self.expect(&Token::LParen);
        let (params, _vararg) = self.parse_param_type_list();
        self.module.declare_function(&name, ret, params);
    }

    fn expect_global_name(&mut self) -> String {
        match self.bump() {
            Token::GlobalVar(n) => n,
            other => {
                self.err(format!("expected `@name`, found `{other}`"));
                String::new()
            }
        }
    }

    fn parse_define(&mut self) {
        self.bump(); // 'define'
        let ret = self.parse_type();
        let name = self.expect_global_name();
        self.expect(&Token::LParen);
        let mut param_types = Vec::new();
        let mut param_names = Vec::new();
        if self.cur() != &Token::RParen {
            loop {
                let ty = self.parse_type();
                let pname = match self.cur().clone() {
                    Token::LocalVar(n) => {
                        self.bump();
                        Some(n)
                    }
                    _ => None,
                };
                param_types.push(ty);
                param_names.push(pname);
                if self.cur() == &Token::Comma {
                    self.bump();
                } else {
                    break;
                }
            }
        }
        self.expect(&Token::RParen);
        let id = self.module.declare_function(&name, ret, param_types);
        self.expect(&Token::LBrace);

        let mut vregs: HashMap<String, VReg> = HashMap::new();
        let mut blocks: HashMap<String, BlockId> = HashMap::new();

        {
            let func = &mut self.module.funcs[id];
            func.is_decl = false;
            for (i, pname) in param_names.iter().enumerate() {
                let vreg = func.param_vregs[i];
                let alias = pname.clone().unwrap_or_else(|| (i + 1).to_string());
                vregs.insert(alias, vreg);
            }
        }

        let mut current_block: Option<BlockId> = None;
        while self.cur() != &Token::RBrace && !self.at_eof() {
            // A block label: `name:` at the start of a line.
            if let Token::Ident(label) = self.cur().clone() {
                if self.toks.get(self.pos + 1).map(|t| &t.0) == Some(&Token::Colon) {
                    self.bump();
                    self.bump();
                    let block = *blocks
                        .entry(label.clone())
                        .or_insert_with(|| self.module.funcs[id].create_block(label.clone()));
                    current_block = Some(block);
                    continue;
                }
            }
            let block = *current_block.get_or_insert_with(|| {
                *blocks.entry("entry".to_string()).or_insert_with(|| self.module.funcs[id].create_block("entry"))
            });
            self.parse_instruction(id, block, &mut vregs, &mut blocks);
        }
        self.expect(&Token::RBrace);
    }

    fn block_ref(
        &mut self,
        func: FuncId,
        blocks: &mut HashMap<String, BlockId>,
        name: String,
    ) -> BlockId {
        *blocks
            .entry(name.clone())
            .or_insert_with(|| self.module.funcs[func].create_block(name))
    }

    fn vreg_ref(
        &mut self,
        func: FuncId,
        vregs: &mut HashMap<String, VReg>,
        name: String,
    ) -> VReg {
        if let Some(&v) = vregs.get(&name) {
            return v;
        }
        let v = self.module.funcs[func].alloc_vreg();
        vregs.insert(name, v);
        v
    }

    fn parse_label(
        &mut self,
        func: FuncId,
        blocks: &mut HashMap<String, BlockId>,
    ) -> BlockId {
        self.eat_ident("label");
        match self.bump() {
            Token::LocalVar(n) => self.block_ref(func, blocks, n),
            other => {
                self.err(format!("expected a block label, found `{other}`"));
                self.block_ref(func, blocks, "entry".to_string())
            }
        }
    }

    /// Parse a bare value of known type (no leading type token):
    /// `%name`, an integer, `null`, `undef`, `true`/`false`.
    fn parse_value(&mut self, func: FuncId, vregs: &mut HashMap<String, VReg>, ty: Type) -> Operand {
        match self.bump() {
            Token::LocalVar(n) => Operand::VReg(self.vreg_ref(func, vregs, n), ty),
            Token::GlobalVar(n) => {
                let id = self.module.declare_global(&n, Type::I8, false, true);
                Operand::global(id, ty)
            }
            Token::IntLit(v) => Operand::ImmI64(v, ty),
            Token::FloatLit(v) => Operand::ImmF64(v, ty),
            Token::Ident(s) if s == "null" => Operand::Null(ty),
            Token::Ident(s) if s == "undef" => Operand::Undef(ty),
            Token::Ident(s) if s == "true" => Operand::ImmI64(1, ty),
            Token::Ident(s) if s == "false" => Operand::ImmI64(0, ty),
            other => {
                self.err(format!("expected a value, found `{other}`"));
                Operand::ImmI64(0, ty)
            }
        }
    }

    /// `<type> <value>`.
    fn parse_typed_operand(&mut self, func: FuncId, vregs: &mut HashMap<String, VReg>) -> Operand {
        let ty = self.parse_type();
        self.parse_value(func, vregs, ty)
    }

    fn parse_icmp_pred(&mut self) -> ICmpPredicate {
        let name = self.expect_ident();
        ICmpPredicate::from_str(&name).unwrap_or_else(|| {
            self.err(format!("unknown icmp predicate `{name}`"));
            ICmpPredicate::Eq
        })
    }

    fn parse_fcmp_pred(&mut self) -> FCmpPredicate {
        let name = self.expect_ident();
        FCmpPredicate::from_str(&name).unwrap_or_else(|| {
            self.err(format!("unknown fcmp predicate `{name}`"));
            FCmpPredicate::Oeq
        })
    }

    fn parse_instruction(
        &mut self,
        func: FuncId,
        block: BlockId,
        vregs: &mut HashMap<String, VReg>,
        blocks: &mut HashMap<String, BlockId>,
    ) {
        let mut dest_name: Option<String> = None;
        if let Token::LocalVar(n) = self.cur().clone() {
            if self.toks.get(self.pos + 1).map(|t| &t.0) == Some(&Token::Equals) {
                self.bump();
                self.bump();
                dest_name = Some(n);
            }
        }
        let mnemonic = self.expect_ident();
        let inst = self.parse_instruction_body(&mnemonic, func, block, vregs, blocks);
        let inst = match inst {
            Some(i) => i,
            None => return,
        };
        let dest = match dest_name {
            Some(name) => self.vreg_ref(func, vregs, name),
            None => VReg::NONE,
        };
        let mut inst = inst;
        inst.dest = dest;
        self.module.funcs[func].emit(block, inst);
    }

    fn parse_instruction_body(
        &mut self,
        mnemonic: &str,
        func: FuncId,
        block: BlockId,
        vregs: &mut HashMap<String, VReg>,
        blocks: &mut HashMap<String, BlockId>,
    ) -> Option<Instruction> {
        let binop = match mnemonic {
            "add" => Some(Opcode::Add),
            "sub" => Some(Opcode::Sub),
            "mul" => Some(Opcode::Mul),
            "sdiv" => Some(Opcode::SDiv),
            "udiv" => Some(Opcode::UDiv),
            "srem" => Some(Opcode::SRem),
            "urem" => Some(Opcode::URem),
            "and" => Some(Opcode::And),
            "or" => Some(Opcode::Or),
            "xor" => Some(Opcode::Xor),
            "shl" => Some(Opcode::Shl),
            "ashr" => Some(Opcode::Ashr),
            "lshr" => Some(Opcode::Lshr),
            "fadd" => Some(Opcode::FAdd),
            "fsub" => Some(Opcode::FSub),
            "fmul" => Some(Opcode::FMul),
            "fdiv" => Some(Opcode::FDiv),
            _ => None,
        };
        if let Some(op) = binop {
            let ty = self.parse_type();
            let lhs = self.parse_value(func, vregs, ty.clone());
            self.expect(&Token::Comma);
            let rhs = self.parse_value(func, vregs, ty.clone());
            return Some(Instruction::new(op, ty, VReg::NONE, &[lhs, rhs]));
        }

        match mnemonic {
            "fneg" => {
                let ty = self.parse_type();
                let v = self.parse_value(func, vregs, ty.clone());
                Some(Instruction::new(Opcode::FNeg, ty, VReg::NONE, &[v]))
            }
            "icmp" => {
                let pred = self.parse_icmp_pred();
                let ty = self.parse_type();
                let lhs = self.parse_value(func, vregs, ty.clone());
                self.expect(&Token::Comma);
                let rhs = self.parse_value(func, vregs, ty.clone());
                Some(Instruction::new(Opcode::ICmp(pred), Type::I1, VReg::NONE, &[lhs, rhs]))
            }
            "fcmp" => {
                let pred = self.parse_fcmp_pred();
                let ty = self.parse_type();
                let lhs = self.parse_value(func, vregs, ty.clone());
                self.expect(&Token::Comma);
                let rhs = self.parse_value(func, vregs, ty.clone());
                Some(Instruction::new(Opcode::FCmp(pred), Type::I1, VReg::NONE, &[lhs, rhs]))
            }
            "load" => {
                let ty = self.parse_type();
                self.expect(&Token::Comma);
                let ptr = self.parse_typed_operand(func, vregs);
                Some(Instruction::new(Opcode::Load, ty, VReg::NONE, &[ptr]))
            }
            "store" => {
                let val = self.parse_typed_operand(func, vregs);
                self.expect(&Token::Comma);
                let ptr = self.parse_typed_operand(func, vregs);
                Some(Instruction::new(Opcode::Store, Type::Void, VReg::NONE, &[val, ptr]))
            }
            "alloca" => {
                let ty = self.parse_type();
                let mut operands = vec![];
                if self.cur() == &Token::Comma {
                    self.bump();
                    if self.eat_ident("align") {
                        self.expect_int_lit();
                    } else {
                        operands.push(self.parse_typed_operand(func, vregs));
                    }
                }
                Some(Instruction::new(Opcode::Alloca, ty, VReg::NONE, &operands))
            }
            "getelementptr" => {
                self.eat_ident("inbounds");
                let base_ty = self.parse_type();
                self.expect(&Token::Comma);
                let base = self.parse_typed_operand(func, vregs);
                let mut operands = vec![base];
                while self.cur() == &Token::Comma {
                    self.bump();
                    let idx_ty = self.parse_type();
                    let idx = self.parse_value(func, vregs, idx_ty.clone());
                    // Indices narrower than i64 are canonicalized via an
                    // implicit sext, matching the spec's "GEP index
                    // canonicalization" rule.
                    let idx = match idx_ty.int_bits() {
                        Some(bits) if bits < 64 => {
                            let widened = self.module.funcs[func].alloc_vreg();
                            let sext = Instruction::new(Opcode::Sext, Type::I64, widened, &[idx]);
                            self.module.funcs[func].emit(block, sext);
                            Operand::VReg(widened, Type::I64)
                        }
                        _ => idx,
                    };
                    operands.push(idx);
                }
                Some(Instruction::new(Opcode::Gep, base_ty, VReg::NONE, &operands))
            }
            "br" => {
                if matches!(self.cur(), Token::Ident(s) if s == "label") {
                    let target = self.parse_label(func, blocks);
                    Some(Instruction::new(Opcode::Br, Type::Void, VReg::NONE, &[Operand::BlockRef(target)]))
                } else {
                    let cond = self.parse_typed_operand(func, vregs);
                    self.expect(&Token::Comma);
                    let t = self.parse_label(func, blocks);
                    self.expect(&Token::Comma);
                    let f = self.parse_label(func, blocks);
                    Some(Instruction::new(
                        Opcode::CondBr,
                        Type::Void,
                        VReg::NONE,
                        &[cond, Operand::BlockRef(t), Operand::BlockRef(f)],
                    ))
                }
            }
            "ret" => {
                if self.eat_ident("void") {
                    Some(Instruction::new(Opcode::RetVoid, Type::Void, VReg::NONE, &[]))
                } else {
                    let v = self.parse_typed_operand(func, vregs);
                    Some(Instruction::new(Opcode::Ret, Type::Void, VReg::NONE, &[v]))
                }
            }
            "unreachable" => Some(Instruction::new(Opcode::Unreachable, Type::Void, VReg::NONE, &[])),
            "sext" | "zext" | "trunc" | "sitofp" | "uitofp" | "fptosi" | "fptoui" | "fpext" | "fptrunc" | "bitcast" | "inttoptr" | "ptrtoint" => {
                let v = self.parse_typed_operand(func, vregs);
                self.eat_ident("to");
                let dst_ty = self.parse_type();
                let op = match mnemonic {
                    "sext" => Opcode::Sext,
                    "zext" => Opcode::Zext,
                    "trunc" => Opcode::Trunc,
                    "sitofp" => Opcode::SiToFp,
                    "uitofp" => Opcode::UiToFp,
                    "fptosi" => Opcode::FpToSi,
                    "fptoui" => Opcode::FpToUi,
                    "fpext" => Opcode::FpExt,
                    "fptrunc" => Opcode::FpTrunc,
                    "bitcast" => Opcode::Bitcast,
                    "inttoptr" => Opcode::IntToPtr,
                    _ => Opcode::PtrToInt,
                };
                Some(Instruction::new(op, dst_ty, VReg::NONE, &[v]))
            }
            "call" => {
                let ret_ty = self.parse_type();
                if self.cur() == &Token::LParen {
                    self.bump();
                    self.parse_param_type_list();
                }
                let callee = match self.bump() {
                    Token::GlobalVar(n) => {
                        // Registering both a function declaration (so
                        // `find_function` sees it even if this call is
                        // its only mention) and a same-named global
                        // (so the callee operand resolves through the
                        // same name -> address map the JIT uses for
                        // data symbols) keeps call-target resolution
                        // on one code path instead of two.
                        self.module.declare_function(&n, ret_ty.clone(), vec![]);
                        let gid = self.module.declare_global(&n, Type::Ptr, false, true);
                        Operand::global(gid, Type::Ptr)
                    }
                    Token::LocalVar(n) => Operand::VReg(self.vreg_ref(func, vregs, n), Type::Ptr),
                    other => {
                        self.err(format!("expected a callee, found `{other}`"));
                        Operand::ImmI64(0, Type::Ptr)
                    }
                };
                self.expect(&Token::LParen);
                let mut operands = vec![callee];
                let mut vararg = false;
                if self.cur() != &Token::RParen {
                    loop {
                        if self.cur() == &Token::Ellipsis {
                            self.bump();
                            vararg = true;
                            break;
                        }
                        operands.push(self.parse_typed_operand(func, vregs));
                        if self.cur() == &Token::Comma {
                            self.bump();
                        } else {
                            break;
                        }
                    }
                }
                self.expect(&Token::RParen);
                let mut inst = Instruction::new(Opcode::Call, ret_ty, VReg::NONE, &operands);
                inst.call_flags = CallFlags { external_abi: false, vararg };
                Some(inst)
            }
            "phi" => {
                let ty = self.parse_type();
                let mut operands = Vec::new();
                loop {
                    self.expect(&Token::LBracket);
                    let val = self.parse_value(func, vregs, ty.clone());
                    self.expect(&Token::Comma);
                    let pred_name = match self.bump() {
                        Token::LocalVar(n) => n,
                        other => {
                            self.err(format!("expected a predecessor label, found `{other}`"));
                            String::new()
                        }
                    };
                    let pred = self.block_ref(func, blocks, pred_name);
                    self.expect(&Token::RBracket);
                    operands.push(val);
                    operands.push(Operand::BlockRef(pred));
                    if self.cur() == &Token::Comma {
                        self.bump();
                    } else {
                        break;
                    }
                }
                Some(Instruction::new(Opcode::Phi, ty, VReg::NONE, &operands))
            }
            "select" => {
                let cond = self.parse_typed_operand(func, vregs);
                self.expect(&Token::Comma);
                let t = self.parse_typed_operand(func, vregs);
                self.expect(&Token::Comma);
                let f = self.parse_typed_operand(func, vregs);
                let ty = t.ty().clone();
                Some(Instruction::new(Opcode::Select, ty, VReg::NONE, &[cond, t, f]))
            }
            "extractvalue" => {
                let agg = self.parse_typed_operand(func, vregs);
                let mut indices = smallvec::SmallVec::new();
                while self.cur() == &Token::Comma {
                    self.bump();
                    indices.push(self.expect_int_lit() as u32);
                }
                let mut inst = Instruction::new(Opcode::ExtractValue, Type::I64, VReg::NONE, &[agg]);
                inst.indices = indices;
                Some(inst)
            }
            "insertvalue" => {
                let agg = self.parse_typed_operand(func, vregs);
                self.expect(&Token::Comma);
                let val = self.parse_typed_operand(func, vregs);
                let mut indices = smallvec::SmallVec::new();
                while self.cur() == &Token::Comma {
                    self.bump();
                    indices.push(self.expect_int_lit() as u32);
                }
                let ty = agg.ty().clone();
                let mut inst = Instruction::new(Opcode::InsertValue, ty, VReg::NONE, &[agg, val]);
                inst.indices = indices;
                Some(inst)
            }
            other => {
                self.err(format!("unknown instruction mnemonic `{other}`"));
                None
            }
        }
    }
}
