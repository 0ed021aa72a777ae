//! Textual IR reader: lexer, recursive-descent parser, and the public
//! [`parse`] entry point (spec §4.2).

mod lexer;
mod parser;

pub use parser::parse;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_trivial_function() {
        let src = "define i64 @answer() {\nentry:\n  ret i64 42\n}\n";
        let module = parse(src).expect("should parse");
        let id = module.find_function("answer").expect("function should be declared");
        let func = &module.funcs[id];
        assert!(!func.is_decl);
        assert_eq!(func.block_order.len(), 1);
    }

    #[test]
    fn parses_add_with_named_params() {
        let src = "define i64 @add(i64 %a, i64 %b) {\nentry:\n  %sum = add i64 %a, %b\n  ret i64 %sum\n}\n";
        let module = parse(src).expect("should parse");
        let id = module.find_function("add").unwrap();
        let func = &module.funcs[id];
        assert_eq!(func.param_vregs.len(), 2);
    }

    #[test]
    fn parses_branch_and_phi_with_forward_block_refs() {
        let src = "define i64 @sel(i1 %c) {\nentry:\n  br i1 %c, label %t, label %f\nt:\n  br label %j\nf:\n  br label %j\nj:\n  %v = phi i64 [ 1, %t ], [ 0, %f ]\n  ret i64 %v\n}\n";
        let module = parse(src).expect("should parse");
        let id = module.find_function("sel").unwrap();
        let func = &module.funcs[id];
        assert_eq!(func.block_order.len(), 4);
    }

    #[test]
    fn reports_diagnostics_but_keeps_parsing_later_functions() {
        let src = "define i64 @broken() {\nentry:\n  this_is_not_an_opcode\n}\ndefine i64 @ok() {\nentry:\n  ret i64 1\n}\n";
        let err = parse(src).expect_err("malformed mnemonic should be reported");
        assert!(!err.is_empty());
    }

    #[test]
    fn parses_external_declaration_and_call() {
        let src = "declare i64 @helper(i64)\ndefine i64 @wrapper(i64 %x) {\nentry:\n  %r = call i64 @helper(i64 %x)\n  ret i64 %r\n}\n";
        let module = parse(src).expect("should parse");
        assert!(module.find_function("helper").is_some());
        assert!(module.find_global("helper").is_some());
    }
}
