//! Parser tests for the robot scripting language.
//!
//! Covers: statements, expression precedence, postfix chains, f-strings,
//! restricted names, import rules, control-flow placement, unsupported
//! syntax, error recovery, and determinism.

use malthusia_lexer::Lexer;
use malthusia_parser::{parse_source, ParseResult, Parser};
use malthusia_types::ast::*;
use malthusia_types::{ErrorCode, SourceFile};

// ─────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────

fn parse(source: &str) -> ParseResult {
    let sf = SourceFile::new("bot", source);
    let lex = Lexer::new(&sf).lex();
    assert!(!lex.errors.has_errors(), "unexpected lex errors");
    Parser::new(lex.tokens, &sf).parse()
}

/// Parse source and return the module, panicking if there are errors.
fn parse_ok(source: &str) -> Module {
    let result = parse(source);
    if result.errors.has_errors() {
        for e in &result.errors.errors {
            eprintln!("  ERROR: {} ({})", e.message, e.code);
        }
        panic!("unexpected parse errors (see above)");
    }
    result.module.expect("no module returned")
}

fn error_codes(source: &str) -> Vec<ErrorCode> {
    parse(source).errors.errors.iter().map(|e| e.code).collect()
}

/// Parse a single expression statement and return its expression.
fn expr(source: &str) -> Expr {
    let module = parse_ok(source);
    assert_eq!(module.body.len(), 1);
    match module.body.into_iter().next().map(|s| s.kind) {
        Some(StmtKind::Expr(e)) => e,
        other => panic!("expected expression statement, got {other:?}"),
    }
}

fn name(e: &Expr) -> &str {
    match &e.kind {
        ExprKind::Name(n) => n,
        other => panic!("expected name, got {other:?}"),
    }
}

// ─────────────────────────────────────────────────────────────────────
// Statements
// ─────────────────────────────────────────────────────────────────────

#[test]
fn test_minimal_bot() {
    let module = parse_ok("def turn():\n    move(Direction.NORTH)\n");
    assert_eq!(module.body.len(), 1);
    let StmtKind::FunctionDef(def) = &module.body[0].kind else {
        panic!("expected def");
    };
    assert_eq!(def.name.name, "turn");
    assert!(def.params.is_empty());
    assert_eq!(def.body.len(), 1);
}

#[test]
fn test_assignment_chain() {
    let module = parse_ok("a = b = 3\n");
    let StmtKind::Assign { targets, value } = &module.body[0].kind else {
        panic!("expected assignment");
    };
    assert_eq!(targets.len(), 2);
    assert_eq!(value.kind, ExprKind::Int(3));
}

#[test]
fn test_tuple_unpacking_assignment() {
    let module = parse_ok("x, y = get_location()\n");
    let StmtKind::Assign { targets, .. } = &module.body[0].kind else {
        panic!("expected assignment");
    };
    assert!(matches!(&targets[0].kind, ExprKind::Tuple(items) if items.len() == 2));
}

#[test]
fn test_augmented_assignment() {
    let module = parse_ok("counter[0] += 2\n");
    let StmtKind::AugAssign { target, op, .. } = &module.body[0].kind else {
        panic!("expected aug-assign");
    };
    assert_eq!(*op, BinOp::Add);
    assert!(matches!(target.kind, ExprKind::Subscript { .. }));
}

#[test]
fn test_if_elif_else_nests() {
    let module = parse_ok("if a:\n    pass\nelif b:\n    pass\nelse:\n    x = 1\n");
    let StmtKind::If { orelse, .. } = &module.body[0].kind else {
        panic!("expected if");
    };
    assert_eq!(orelse.len(), 1);
    let StmtKind::If { orelse: inner, .. } = &orelse[0].kind else {
        panic!("elif should nest as if");
    };
    assert_eq!(inner.len(), 1);
}

#[test]
fn test_for_with_tuple_target_and_else() {
    let module = parse_ok("for k, v in pairs:\n    continue\nelse:\n    pass\n");
    let StmtKind::For { target, orelse, .. } = &module.body[0].kind else {
        panic!("expected for");
    };
    assert!(matches!(&target.kind, ExprKind::Tuple(items) if items.len() == 2));
    assert_eq!(orelse.len(), 1);
}

#[test]
fn test_while_with_break() {
    parse_ok("while True:\n    if done():\n        break\n");
}

#[test]
fn test_inline_block() {
    let module = parse_ok("if x: y = 1\n");
    let StmtKind::If { body, .. } = &module.body[0].kind else {
        panic!("expected if");
    };
    assert_eq!(body.len(), 1);
}

#[test]
fn test_def_with_defaults_and_annotations() {
    let module = parse_ok("def f(a: int, b=2) -> int:\n    return a + b\n");
    let StmtKind::FunctionDef(def) = &module.body[0].kind else {
        panic!("expected def");
    };
    assert_eq!(def.params.len(), 2);
    assert!(def.params[0].default.is_none());
    assert_eq!(
        def.params[1].default.as_ref().map(|d| &d.kind),
        Some(&ExprKind::Int(2))
    );
}

#[test]
fn test_try_except_else() {
    let module = parse_ok(
        "try:\n    risky()\nexcept ValueError as e:\n    log(e)\nexcept:\n    pass\nelse:\n    ok()\n",
    );
    let StmtKind::Try {
        handlers, orelse, ..
    } = &module.body[0].kind
    else {
        panic!("expected try");
    };
    assert_eq!(handlers.len(), 2);
    assert_eq!(handlers[0].name.as_ref().map(|n| n.name.as_str()), Some("e"));
    assert!(handlers[1].kind.is_none());
    assert_eq!(orelse.len(), 1);
}

#[test]
fn test_raise_assert_del_global() {
    let module = parse_ok(
        "def f():\n    global g\n    assert g, 'msg'\n    del g[0]\n    raise ValueError('x')\n",
    );
    let StmtKind::FunctionDef(def) = &module.body[0].kind else {
        panic!("expected def");
    };
    assert!(matches!(def.body[0].kind, StmtKind::Global(_)));
    assert!(matches!(def.body[1].kind, StmtKind::Assert { msg: Some(_), .. }));
    assert!(matches!(def.body[2].kind, StmtKind::Del(_)));
    assert!(matches!(def.body[3].kind, StmtKind::Raise(Some(_))));
}

#[test]
fn test_imports() {
    let module = parse_ok("import math\nimport random as r\nfrom helpers import (a, b as c,)\n");
    assert!(matches!(&module.body[0].kind, StmtKind::Import(names) if names.len() == 1));
    let StmtKind::Import(names) = &module.body[1].kind else {
        panic!("expected import");
    };
    assert_eq!(names[0].bound_name().name, "r");
    let StmtKind::ImportFrom { module: m, names } = &module.body[2].kind else {
        panic!("expected from-import");
    };
    assert_eq!(m.name, "helpers");
    assert_eq!(names.len(), 2);
    assert_eq!(names[1].bound_name().name, "c");
}

// ─────────────────────────────────────────────────────────────────────
// Expressions
// ─────────────────────────────────────────────────────────────────────

#[test]
fn test_precedence_mul_over_add() {
    let e = expr("1 + 2 * 3\n");
    let ExprKind::Binary { op, right, .. } = &e.kind else {
        panic!("expected binary");
    };
    assert_eq!(*op, BinOp::Add);
    assert!(matches!(right.kind, ExprKind::Binary { op: BinOp::Mul, .. }));
}

#[test]
fn test_power_is_right_associative() {
    let e = expr("2 ** 3 ** 2\n");
    let ExprKind::Binary { op, right, .. } = &e.kind else {
        panic!("expected binary");
    };
    assert_eq!(*op, BinOp::Pow);
    assert!(matches!(right.kind, ExprKind::Binary { op: BinOp::Pow, .. }));
}

#[test]
fn test_unary_minus_binds_looser_than_power() {
    let e = expr("-x ** 2\n");
    let ExprKind::Unary { op, operand } = &e.kind else {
        panic!("expected unary");
    };
    assert_eq!(*op, UnaryOp::Neg);
    assert!(matches!(operand.kind, ExprKind::Binary { op: BinOp::Pow, .. }));
}

#[test]
fn test_negative_literal_folds() {
    assert_eq!(expr("-5\n").kind, ExprKind::Int(-5));
    assert_eq!(expr("-2.5\n").kind, ExprKind::Float(-2.5));
}

#[test]
fn test_comparison_chain() {
    let e = expr("a < b <= c\n");
    let ExprKind::Compare { ops, .. } = &e.kind else {
        panic!("expected compare");
    };
    assert_eq!(ops.len(), 2);
    assert_eq!(ops[0].0, CmpOp::Lt);
    assert_eq!(ops[1].0, CmpOp::LtE);
}

#[test]
fn test_two_word_comparisons() {
    let e = expr("a not in b\n");
    assert!(matches!(&e.kind, ExprKind::Compare { ops, .. } if ops[0].0 == CmpOp::NotIn));
    let e = expr("a is not None\n");
    assert!(matches!(&e.kind, ExprKind::Compare { ops, .. } if ops[0].0 == CmpOp::IsNot));
}

#[test]
fn test_bool_ops_and_not() {
    let e = expr("a or b and not c\n");
    let ExprKind::BoolOp { op, values } = &e.kind else {
        panic!("expected bool op");
    };
    assert_eq!(*op, BoolOp::Or);
    assert_eq!(name(&values[0]), "a");
    assert!(matches!(values[1].kind, ExprKind::BoolOp { op: BoolOp::And, .. }));
}

#[test]
fn test_conditional_expression() {
    let e = expr("x if c else y\n");
    let ExprKind::IfExp { test, body, orelse } = &e.kind else {
        panic!("expected if-exp");
    };
    assert_eq!(name(test), "c");
    assert_eq!(name(body), "x");
    assert_eq!(name(orelse), "y");
}

#[test]
fn test_lambda() {
    let e = expr("lambda a, b=1: a + b\n");
    let ExprKind::Lambda { params, .. } = &e.kind else {
        panic!("expected lambda");
    };
    assert_eq!(params.len(), 2);
}

#[test]
fn test_postfix_chain() {
    let e = expr("obj.items()[0](1, 2)\n");
    let ExprKind::Call { func, args } = &e.kind else {
        panic!("expected call");
    };
    assert_eq!(args.len(), 2);
    assert!(matches!(func.kind, ExprKind::Subscript { .. }));
}

#[test]
fn test_slices() {
    let e = expr("xs[1:]\n");
    let ExprKind::Subscript { index, .. } = &e.kind else {
        panic!("expected subscript");
    };
    assert!(matches!(
        index.kind,
        ExprKind::Slice {
            lower: Some(_),
            upper: None,
            step: None
        }
    ));
    let e = expr("xs[::-1]\n");
    let ExprKind::Subscript { index, .. } = &e.kind else {
        panic!("expected subscript");
    };
    assert!(matches!(
        index.kind,
        ExprKind::Slice {
            lower: None,
            upper: None,
            step: Some(_)
        }
    ));
}

#[test]
fn test_tuple_index() {
    let e = expr("grid[x, y]\n");
    let ExprKind::Subscript { index, .. } = &e.kind else {
        panic!("expected subscript");
    };
    assert!(matches!(&index.kind, ExprKind::Tuple(items) if items.len() == 2));
}

#[test]
fn test_displays() {
    assert!(matches!(expr("()\n").kind, ExprKind::Tuple(ref v) if v.is_empty()));
    assert!(matches!(expr("(1,)\n").kind, ExprKind::Tuple(ref v) if v.len() == 1));
    assert_eq!(expr("(1)\n").kind, ExprKind::Int(1));
    assert!(matches!(expr("[1, 2,]\n").kind, ExprKind::List(ref v) if v.len() == 2));
    assert!(matches!(expr("{}\n").kind, ExprKind::Dict(ref v) if v.is_empty()));
    assert!(matches!(expr("{1: 'a', 2: 'b'}\n").kind, ExprKind::Dict(ref v) if v.len() == 2));
    assert!(matches!(expr("{1, 2}\n").kind, ExprKind::Set(ref v) if v.len() == 2));
}

#[test]
fn test_adjacent_strings_concatenate() {
    assert_eq!(expr("'ab' 'cd'\n").kind, ExprKind::Str("abcd".into()));
}

#[test]
fn test_fstring_parts() {
    let e = expr("f'at {x:>3} and {y}!'\n");
    let ExprKind::FString(parts) = &e.kind else {
        panic!("expected f-string");
    };
    assert_eq!(parts.len(), 5);
    assert_eq!(parts[0], FStringPart::Text("at ".into()));
    assert!(matches!(&parts[1], FStringPart::Field { spec: Some(s), .. } if s == ">3"));
    assert!(matches!(&parts[3], FStringPart::Field { spec: None, .. }));
    assert_eq!(parts[4], FStringPart::Text("!".into()));
}

// ─────────────────────────────────────────────────────────────────────
// Restricted names & imports
// ─────────────────────────────────────────────────────────────────────

#[test]
fn test_underscore_name_rejected() {
    assert_eq!(error_codes("_x = 1\n"), vec![ErrorCode::RESTRICTED_NAME]);
    assert_eq!(error_codes("log(__builtins__)\n"), vec![ErrorCode::RESTRICTED_NAME]);
}

#[test]
fn test_underscore_name_suggestion() {
    let result = parse("_secret = 1\n");
    assert_eq!(
        result.errors.errors[0].suggestion.as_deref(),
        Some("Rename to 'secret'")
    );
}

#[test]
fn test_underscore_attribute_rejected() {
    assert_eq!(
        error_codes("x = ().__class__\n"),
        vec![ErrorCode::RESTRICTED_ATTRIBUTE]
    );
}

#[test]
fn test_underscore_def_and_param_rejected() {
    assert_eq!(
        error_codes("def _f(_a):\n    pass\n"),
        vec![ErrorCode::RESTRICTED_NAME, ErrorCode::RESTRICTED_NAME]
    );
}

#[test]
fn test_relative_import_rejected() {
    let result = parse("from .sibling import x\n");
    assert_eq!(result.errors.errors[0].code, ErrorCode::RELATIVE_IMPORT);
    assert_eq!(result.errors.errors[0].message, "No relative imports (yet).");
}

#[test]
fn test_star_import_rejected() {
    assert_eq!(error_codes("from math import *\n"), vec![ErrorCode::STAR_IMPORT]);
}

// ─────────────────────────────────────────────────────────────────────
// Control-flow placement & unsupported syntax
// ─────────────────────────────────────────────────────────────────────

#[test]
fn test_break_outside_loop() {
    assert_eq!(error_codes("break\n"), vec![ErrorCode::BREAK_OUTSIDE_LOOP]);
}

#[test]
fn test_break_in_def_inside_loop() {
    assert_eq!(
        error_codes("while x:\n    def f():\n        continue\n"),
        vec![ErrorCode::CONTINUE_OUTSIDE_LOOP]
    );
}

#[test]
fn test_return_outside_function() {
    assert_eq!(error_codes("return 1\n"), vec![ErrorCode::RETURN_OUTSIDE_FUNCTION]);
}

#[test]
fn test_reserved_words_unsupported() {
    assert_eq!(
        error_codes("class A:\n    pass\n"),
        vec![ErrorCode::UNSUPPORTED_SYNTAX]
    );
    assert!(error_codes("with f as g:\n    pass\n").contains(&ErrorCode::UNSUPPORTED_SYNTAX));
}

#[test]
fn test_finally_unsupported() {
    assert!(error_codes("try:\n    a()\nfinally:\n    b()\n").contains(&ErrorCode::UNSUPPORTED_SYNTAX));
}

#[test]
fn test_comprehension_unsupported() {
    assert_eq!(
        error_codes("xs = [x for x in ys]\n"),
        vec![ErrorCode::UNSUPPORTED_SYNTAX]
    );
}

#[test]
fn test_keyword_arguments_unsupported() {
    assert_eq!(error_codes("f(a=1)\n"), vec![ErrorCode::UNSUPPORTED_SYNTAX]);
}

#[test]
fn test_star_args_unsupported() {
    assert_eq!(error_codes("f(*xs)\n"), vec![ErrorCode::UNSUPPORTED_SYNTAX]);
}

#[test]
fn test_raise_from_unsupported() {
    assert_eq!(
        error_codes("raise ValueError() from None\n"),
        vec![ErrorCode::UNSUPPORTED_SYNTAX]
    );
}

#[test]
fn test_invalid_assign_target() {
    assert_eq!(error_codes("f() = 1\n"), vec![ErrorCode::INVALID_ASSIGN_TARGET]);
    assert_eq!(error_codes("1 += 1\n"), vec![ErrorCode::INVALID_ASSIGN_TARGET]);
}

#[test]
fn test_expression_nesting_limit() {
    let src = format!("x = {}1{}\n", "(".repeat(100), ")".repeat(100));
    assert!(error_codes(&src).contains(&ErrorCode::NESTING_TOO_DEEP));
}

#[test]
fn test_unary_and_power_chains_hit_the_nesting_limit() {
    for src in [
        format!("x = {}1\n", "-".repeat(100_000)),
        format!("x = {}1\n", "+".repeat(100_000)),
        format!("x = {}y\n", "not ".repeat(100_000)),
        format!("x = {}2\n", "2 ** ".repeat(100_000)),
    ] {
        assert!(error_codes(&src).contains(&ErrorCode::NESTING_TOO_DEEP));
    }
    assert!(!parse("x = - - - 1\ny = 2 ** -2 ** 3\nz = not not y\n").errors.has_errors());
}

#[test]
fn test_long_operator_chains_are_bounded() {
    let sum = format!("x = 1{}\n", " + 1".repeat(5_000));
    assert!(error_codes(&sum).contains(&ErrorCode::NESTING_TOO_DEEP));
    let calls = format!("x = f{}\n", "()".repeat(5_000));
    assert!(error_codes(&calls).contains(&ErrorCode::NESTING_TOO_DEEP));
    let modest = format!("x = 1{}\n", " + 1".repeat(200));
    assert!(!parse(&modest).errors.has_errors());
}

#[test]
fn test_non_default_after_default() {
    assert_eq!(
        error_codes("def f(a=1, b):\n    pass\n"),
        vec![ErrorCode::UNEXPECTED_TOKEN]
    );
}

// ─────────────────────────────────────────────────────────────────────
// Error recovery & determinism
// ─────────────────────────────────────────────────────────────────────

#[test]
fn test_error_recovery_reports_each_line() {
    let result = parse("_a = 1\nb = )\n_c = 3\n");
    assert_eq!(result.errors.total_errors, 3);
}

#[test]
fn test_recovery_keeps_later_statements() {
    let result = parse("x = )\ny = 2\n");
    let module = result.module.expect("module");
    assert!(module
        .body
        .iter()
        .any(|s| matches!(&s.kind, StmtKind::Assign { targets, .. } if name(&targets[0]) == "y")));
}

#[test]
fn test_parse_source_merges_lex_errors() {
    let sf = SourceFile::new("bot", "x = $\n_y = 1\n");
    let errors = parse_source(&sf).expect_err("should fail");
    assert!(errors.total_errors >= 2);
}

#[test]
fn test_parser_determinism_100_iterations() {
    let src = "def turn():\n    x, y = get_location()\n    if x > 3 and y < 2:\n        move(Direction.SOUTH)\n";
    let first = parse_ok(src);
    for i in 0..100 {
        assert_eq!(first, parse_ok(src), "Determinism failure at iteration {i}");
    }
}
