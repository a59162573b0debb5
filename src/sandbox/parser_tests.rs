//! Unit tests for the strategy language front end - tokens, items, precedence, errors.

#[cfg(test)]
mod parser_tests {
    use crate::sandbox::ast::*;
    use crate::sandbox::lexer::{tokenize, Token};
    use crate::sandbox::parser::parse;

    fn first_function_body(source: &str) -> Vec<Stmt> {
        let program = parse(source).expect("parses");
        match &program.items[0] {
            Item::Function(func) => func.body.clone(),
            other => panic!("expected function, got {:?}", other),
        }
    }

    fn returned_expr(source: &str) -> Expr {
        let body = first_function_body(source);
        match &body[0].kind {
            StmtKind::Return(Some(expr)) => expr.clone(),
            other => panic!("expected return, got {:?}", other),
        }
    }

    // ============= Lexer =============

    #[test]
    fn test_tokenize_numbers_and_strings() {
        let tokens = tokenize("1_000 2.5 1e3 'a\\n' \"b\"").unwrap();
        let kinds: Vec<Token> = tokens.into_iter().map(|t| t.token).collect();
        assert_eq!(
            kinds,
            vec![
                Token::Int(1000),
                Token::Float(2.5),
                Token::Float(1000.0),
                Token::Str("a\n".to_string()),
                Token::Str("b".to_string()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_tokenize_tracks_lines_and_skips_comments() {
        let tokens = tokenize("let x = 1; # note\n\nlet y = 2;").unwrap();
        let y = tokens
            .iter()
            .find(|t| t.token == Token::Ident("y".to_string()))
            .unwrap();
        assert_eq!(y.line, 3);
    }

    #[test]
    fn test_tokenize_unterminated_string() {
        let err = tokenize("let s = 'open;\n").unwrap_err();
        assert_eq!(err.line, 1);
        assert!(err.message.contains("unterminated"));
    }

    #[test]
    fn test_tokenize_rejects_unknown_character() {
        let err = tokenize("let a = 1;\nlet b = a @ 2;").unwrap_err();
        assert_eq!(err.to_string(), "Line 2: unexpected character '@'");
    }

    // ============= Items =============

    #[test]
    fn test_parse_imports() {
        let program = parse("import math;\nimport os.path as p;\nfrom math import sqrt, log;").unwrap();
        assert_eq!(program.items.len(), 3);
        match &program.items[1] {
            Item::Import(import) => {
                assert_eq!(import.module, "os.path");
                assert_eq!(import.alias.as_deref(), Some("p"));
                assert_eq!(import.line, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
        match &program.items[2] {
            Item::Import(import) => assert_eq!(import.names, vec!["sqrt", "log"]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_class_with_methods() {
        let source = r#"
class Momentum {
    fn init(self, params) {
        self.period = params.get("period", "5m");
    }

    fn should_trade(self, data) {
        return Decision(operation: "hold");
    }
}
"#;
        let program = parse(source).unwrap();
        let Item::Class(class) = &program.items[0] else {
            panic!("expected class");
        };
        assert_eq!(class.name, "Momentum");
        assert_eq!(class.line, 2);
        assert_eq!(class.methods.len(), 2);
        assert_eq!(class.method("should_trade").unwrap().params, vec!["self", "data"]);
        assert!(class.method("missing").is_none());
    }

    #[test]
    fn test_parse_top_level_constant() {
        let program = parse("let THRESHOLD = 0.02;").unwrap();
        assert!(matches!(&program.items[0], Item::Let { name, .. } if name == "THRESHOLD"));
    }

    #[test]
    fn test_parse_rejects_statement_at_top_level() {
        let err = parse("x = 1;").unwrap_err();
        assert_eq!(err.line, 1);
        assert!(err.message.starts_with("expected 'import'"));
    }

    #[test]
    fn test_parse_duplicate_parameter() {
        let err = parse("fn f(a, a) { return a; }").unwrap_err();
        assert!(err.message.contains("duplicate parameter"));
    }

    // ============= Statements =============

    #[test]
    fn test_parse_else_if_chain() {
        let body = first_function_body(
            "fn f(x) { if x > 1 { return 1; } else if x > 0 { return 0; } else { return -1; } }",
        );
        match &body[0].kind {
            StmtKind::If {
                branches,
                otherwise,
            } => {
                assert_eq!(branches.len(), 2);
                assert!(otherwise.is_some());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_for_with_two_variables() {
        let body = first_function_body("fn f(d) { for k, v in d.items() { print(k, v); } }");
        match &body[0].kind {
            StmtKind::For { vars, .. } => assert_eq!(vars, &vec!["k".to_string(), "v".to_string()]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_compound_assignment() {
        let body = first_function_body("fn f(self) { self.count += 1; }");
        match &body[0].kind {
            StmtKind::Assign { target, op, .. } => {
                assert_eq!(*op, Some(BinaryOp::Add));
                assert!(matches!(&target.kind, ExprKind::Attribute { name, .. } if name == "count"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_assignment_to_call() {
        let err = parse("fn f() { g() = 1; }").unwrap_err();
        assert_eq!(err.message, "invalid assignment target");
    }

    #[test]
    fn test_parse_missing_semicolon_reports_line() {
        let err = parse("fn f() {\n  let a = 1\n  return a;\n}").unwrap_err();
        assert_eq!(err.line, 3);
        assert_eq!(err.message, "expected ';', found 'return'");
    }

    #[test]
    fn test_parse_unclosed_block() {
        let err = parse("fn f() { return 1;").unwrap_err();
        assert!(err.message.contains("end of input"));
    }

    // ============= Expressions =============

    #[test]
    fn test_multiplication_binds_tighter_than_addition() {
        let expr = returned_expr("fn f() { return 1 + 2 * 3; }");
        match expr.kind {
            ExprKind::Binary { op, rhs, .. } => {
                assert_eq!(op, BinaryOp::Add);
                assert!(matches!(rhs.kind, ExprKind::Binary { op: BinaryOp::Mul, .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_not_binds_looser_than_comparison() {
        let expr = returned_expr("fn f(a, b) { return not a == b and b; }");
        match expr.kind {
            ExprKind::Logical { op, lhs, .. } => {
                assert_eq!(op, LogicalOp::And);
                match lhs.kind {
                    ExprKind::Unary { op, operand } => {
                        assert_eq!(op, UnaryOp::Not);
                        assert!(matches!(operand.kind, ExprKind::Binary { op: BinaryOp::Eq, .. }));
                    }
                    other => panic!("unexpected {:?}", other),
                }
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_keyword_arguments() {
        let expr = returned_expr("fn f() { return Decision(operation: \"buy\", leverage: 2); }");
        match expr.kind {
            ExprKind::Call { args, .. } => {
                let names: Vec<_> = args.iter().map(|a| a.name.clone().unwrap()).collect();
                assert_eq!(names, vec!["operation", "leverage"]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_positional_after_keyword_rejected() {
        let err = parse("fn f() { return g(a: 1, 2); }").unwrap_err();
        assert_eq!(err.message, "positional argument follows keyword argument");
    }

    #[test]
    fn test_list_and_dict_literals_allow_trailing_comma() {
        let expr = returned_expr("fn f() { return [1, {\"a\": 2,},]; }");
        match expr.kind {
            ExprKind::List(items) => {
                assert_eq!(items.len(), 2);
                assert!(matches!(&items[1].kind, ExprKind::Dict(entries) if entries.len() == 1));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_postfix_chain() {
        let expr = returned_expr("fn f(data) { return data.get_klines(\"BTC\", \"5m\")[0].close; }");
        match expr.kind {
            ExprKind::Attribute { object, name } => {
                assert_eq!(name, "close");
                assert!(matches!(object.kind, ExprKind::Index { .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_deep_nesting_is_rejected_not_overflowed() {
        let source = format!("fn f() {{ return {}1{}; }}", "(".repeat(500), ")".repeat(500));
        let err = parse(&source).unwrap_err();
        assert_eq!(err.message, "nesting too deep");
    }

    #[test]
    fn test_long_operator_chain_is_rejected_not_overflowed() {
        let terms = vec!["1"; 10_000].join(" + ");
        let source = format!("fn f() {{ return {}; }}", terms);
        let err = parse(&source).unwrap_err();
        assert_eq!(err.message, "nesting too deep");

        let calls = "x".to_string() + &".f()".repeat(5_000);
        let err = parse(&format!("fn f(x) {{ return {}; }}", calls)).unwrap_err();
        assert_eq!(err.message, "nesting too deep");
    }

    #[test]
    fn test_operator_chain_within_limit_parses() {
        let terms = vec!["1"; 50].join(" + ");
        let expr = returned_expr(&format!("fn f() {{ return {} and true or false; }}", terms));
        assert!(matches!(expr.kind, ExprKind::Logical { op: LogicalOp::Or, .. }));
    }

    #[test]
    fn test_walk_exprs_visits_nested_calls() {
        let program = parse("fn f() { if eval(\"1\") { return g(h()); } }").unwrap();
        let mut calls = Vec::new();
        walk_exprs(&program, &mut |expr| {
            if let ExprKind::Call { callee, .. } = &expr.kind {
                if let ExprKind::Name(name) = &callee.kind {
                    calls.push(name.clone());
                }
            }
        });
        assert_eq!(calls, vec!["eval", "g", "h"]);
    }
}
