use diag::DiagKind;
use parse::*;

#[test]
fn if_else_chain() {
    let src = "void f() { if (a) { x = 1; } else if (b) { x = 2; } else { x = 3; } }";
    let prog = parse_source(src).unwrap();
    match &prog.functions[0].body[0].kind {
        StmtKind::If { else_branch, .. } => {
            let eb = else_branch.as_ref().unwrap();
            assert!(matches!(eb[0].kind, StmtKind::If { .. }));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn while_loop_with_break_continue() {
    let src = "void f() { while (1) { if (done) break; continue; } }";
    let prog = parse_source(src).unwrap();
    match &prog.functions[0].body[0].kind {
        StmtKind::While { body, .. } => {
            assert!(matches!(body[0].kind, StmtKind::If { .. }));
            assert!(matches!(body[1].kind, StmtKind::Continue));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn for_with_declaration_initializer() {
    let src = "void f() { for (int i = 0; i < 10; i++) { total += i; } }";
    let prog = parse_source(src).unwrap();
    match &prog.functions[0].body[0].kind {
        StmtKind::For { init, cond, post, .. } => {
            assert!(matches!(init.as_ref().unwrap().kind, StmtKind::Decl { .. }));
            assert!(cond.is_some());
            assert!(post.is_some());
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn for_with_all_parts_empty() {
    let src = "void f() { for (;;) { break; } }";
    let prog = parse_source(src).unwrap();
    match &prog.functions[0].body[0].kind {
        StmtKind::For { init, cond, post, .. } => {
            assert!(init.is_none());
            assert!(cond.is_none());
            assert!(post.is_none());
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn single_statement_bodies_without_braces() {
    let src = "void f() { if (a) x = 1; else x = 2; while (a) x--; }";
    assert!(parse_source(src).is_ok());
}

#[test]
fn unexpected_token_reports_position() {
    let err = parse_source("void f() { int = 3; }").unwrap_err();
    assert_eq!(err.kind, DiagKind::ParseUnexpectedToken);
    assert_eq!(err.line, 1);
    assert!(err.message.contains("expected"));
}

#[test]
fn missing_semicolon_is_an_error() {
    let err = parse_source("void f() { x = 1 }").unwrap_err();
    assert_eq!(err.kind, DiagKind::ParseUnexpectedToken);
}

#[test]
fn missing_close_brace_is_an_error() {
    let err = parse_source("void f() { x = 1;").unwrap_err();
    assert_eq!(err.kind, DiagKind::ParseUnexpectedToken);
}
