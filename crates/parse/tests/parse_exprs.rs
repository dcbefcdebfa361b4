use parse::*;

fn expr_of(src: &str) -> Expr {
    let prog = parse_source(&format!("void f() {{ {}; }}", src)).unwrap();
    match &prog.functions[0].body[0].kind {
        StmtKind::ExprStmt(e) => e.clone(),
        other => panic!("expected expression statement, got {:?}", other),
    }
}

#[test]
fn multiplication_binds_tighter_than_addition() {
    let e = expr_of("x = 2 + 3 * 4");
    match e.kind {
        ExprKind::Assign { value, .. } => match value.kind {
            ExprKind::Binary { op: BinaryOp::Add, rhs, .. } => {
                assert!(matches!(rhs.kind, ExprKind::Binary { op: BinaryOp::Mul, .. }));
            }
            other => panic!("expected add at top, got {:?}", other),
        },
        other => panic!("expected assignment, got {:?}", other),
    }
}

#[test]
fn assignment_is_right_associative() {
    let e = expr_of("a = b = 1");
    match e.kind {
        ExprKind::Assign { value, .. } => {
            assert!(matches!(value.kind, ExprKind::Assign { .. }));
        }
        other => panic!("expected assignment, got {:?}", other),
    }
}

#[test]
fn compound_assignment_maps_to_binop() {
    let e = expr_of("x <<= 2");
    assert!(matches!(e.kind, ExprKind::AssignOp { op: BinaryOp::Shl, .. }));
    let e = expr_of("x &= mask");
    assert!(matches!(e.kind, ExprKind::AssignOp { op: BinaryOp::BitAnd, .. }));
}

#[test]
fn logical_or_is_lower_than_and() {
    let e = expr_of("r = a || b && c");
    match e.kind {
        ExprKind::Assign { value, .. } => match value.kind {
            ExprKind::Binary { op: BinaryOp::LOr, rhs, .. } => {
                assert!(matches!(rhs.kind, ExprKind::Binary { op: BinaryOp::LAnd, .. }));
            }
            other => panic!("expected || at top, got {:?}", other),
        },
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn bitwise_precedence_chain() {
    // a | b ^ c & d parses as a | (b ^ (c & d))
    let e = expr_of("r = a | b ^ c & d");
    match e.kind {
        ExprKind::Assign { value, .. } => match value.kind {
            ExprKind::Binary { op: BinaryOp::BitOr, rhs, .. } => match rhs.kind {
                ExprKind::Binary { op: BinaryOp::BitXor, rhs, .. } => {
                    assert!(matches!(rhs.kind, ExprKind::Binary { op: BinaryOp::BitAnd, .. }));
                }
                other => panic!("expected ^ under |, got {:?}", other),
            },
            other => panic!("expected | at top, got {:?}", other),
        },
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn unary_and_postfix_forms() {
    assert!(matches!(
        expr_of("-x").kind,
        ExprKind::Unary { op: UnaryOp::Minus, .. }
    ));
    assert!(matches!(
        expr_of("~x").kind,
        ExprKind::Unary { op: UnaryOp::BitNot, .. }
    ));
    assert!(matches!(
        expr_of("!x").kind,
        ExprKind::Unary { op: UnaryOp::LogicalNot, .. }
    ));
    assert!(matches!(
        expr_of("&x").kind,
        ExprKind::Unary { op: UnaryOp::AddrOf, .. }
    ));
    assert!(matches!(
        expr_of("*p").kind,
        ExprKind::Unary { op: UnaryOp::Deref, .. }
    ));
    assert!(matches!(
        expr_of("++i").kind,
        ExprKind::IncDec { pre: true, inc: true, .. }
    ));
    assert!(matches!(
        expr_of("i++").kind,
        ExprKind::IncDec { pre: false, inc: true, .. }
    ));
}

#[test]
fn member_access_and_arrow() {
    assert!(matches!(
        expr_of("s.field").kind,
        ExprKind::Member { arrow: false, .. }
    ));
    assert!(matches!(
        expr_of("p->field").kind,
        ExprKind::Member { arrow: true, .. }
    ));
}

#[test]
fn indexing_chains_with_member_access() {
    let e = expr_of("rows[2].len");
    match e.kind {
        ExprKind::Member { base, field, arrow } => {
            assert_eq!(field, "len");
            assert!(!arrow);
            assert!(matches!(base.kind, ExprKind::Index { .. }));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn sizeof_type_and_expr_forms() {
    assert!(matches!(expr_of("x = sizeof(int)").kind,
        ExprKind::Assign { ref value, .. } if matches!(value.kind, ExprKind::SizeofType(Type::Int))));
    assert!(matches!(expr_of("x = sizeof(y)").kind,
        ExprKind::Assign { ref value, .. } if matches!(value.kind, ExprKind::SizeofExpr(_))));
    assert!(matches!(expr_of("x = sizeof(struct Point)").kind,
        ExprKind::Assign { ref value, .. } if matches!(value.kind, ExprKind::SizeofType(Type::Struct(_)))));
}

#[test]
fn cast_expression() {
    let e = expr_of("p = (int*)raw");
    match e.kind {
        ExprKind::Assign { value, .. } => match value.kind {
            ExprKind::Cast { ty, .. } => assert_eq!(ty, Type::pointer_to(Type::Int)),
            other => panic!("expected cast, got {:?}", other),
        },
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn parenthesized_identifier_is_not_a_cast() {
    let e = expr_of("(x)");
    assert!(matches!(e.kind, ExprKind::Ident(ref s) if s == "x"));
}

#[test]
fn call_with_arguments() {
    let e = expr_of("HW_GPIO_SET(13, 1)");
    match e.kind {
        ExprKind::Call { callee, args } => {
            assert_eq!(callee, "HW_GPIO_SET");
            assert_eq!(args.len(), 2);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn send_and_recv_forms() {
    assert!(matches!(expr_of("q.send(v)").kind, ExprKind::Send { .. }));
    match expr_of("q.recv()").kind {
        ExprKind::Recv { timeout, .. } => assert!(timeout.is_none()),
        other => panic!("unexpected {:?}", other),
    }
    match expr_of("q.recv(timeout: 500)").kind {
        ExprKind::Recv { timeout, .. } => {
            let t = timeout.unwrap();
            assert!(matches!(t.kind, ExprKind::Literal(Literal::Int(500))));
        }
        other => panic!("unexpected {:?}", other),
    }
    match expr_of("q.recv(250)").kind {
        ExprKind::Recv { timeout, .. } => assert!(timeout.is_some()),
        other => panic!("unexpected {:?}", other),
    }
}
