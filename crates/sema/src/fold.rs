//! AST-level constant folding, dead-branch elimination, and algebraic
//! identities. Runs between analysis and code generation; the output is a
//! program with the same meaning and fewer runtime operations.

use parse::ast::*;

/// Evaluate an integer constant expression. Used for array sizes, shift
/// amounts, task attributes, and global initializers.
pub fn eval_const_int(e: &Expr) -> Option<i64> {
    match &e.kind {
        ExprKind::Literal(Literal::Int(v)) => Some(*v),
        ExprKind::Literal(Literal::Char(c)) => Some(*c as i64),
        ExprKind::Literal(Literal::Bool(b)) => Some(*b as i64),
        ExprKind::Unary { op, expr } => {
            let v = eval_const_int(expr)?;
            match op {
                UnaryOp::Plus => Some(v),
                UnaryOp::Minus => Some(v.wrapping_neg()),
                UnaryOp::BitNot => Some(!v),
                UnaryOp::LogicalNot => Some((v == 0) as i64),
                _ => None,
            }
        }
        ExprKind::Binary { op, lhs, rhs } => {
            let a = eval_const_int(lhs)?;
            let b = eval_const_int(rhs)?;
            eval_int_binop(*op, a, b)
        }
        ExprKind::Cast { ty: Type::Int, expr } => eval_const_int(expr),
        _ => None,
    }
}

/// Evaluate a float constant expression (literals with optional sign).
pub fn eval_const_float(e: &Expr) -> Option<f64> {
    match &e.kind {
        ExprKind::Literal(Literal::Float(v)) => Some(*v),
        ExprKind::Unary {
            op: UnaryOp::Minus,
            expr,
        } => eval_const_float(expr).map(|v| -v),
        ExprKind::Unary {
            op: UnaryOp::Plus,
            expr,
        } => eval_const_float(expr),
        _ => None,
    }
}

fn eval_int_binop(op: BinaryOp, a: i64, b: i64) -> Option<i64> {
    Some(match op {
        BinaryOp::Add => a.wrapping_add(b),
        BinaryOp::Sub => a.wrapping_sub(b),
        BinaryOp::Mul => a.wrapping_mul(b),
        BinaryOp::Div => {
            if b == 0 {
                return None;
            }
            a.wrapping_div(b)
        }
        BinaryOp::Mod => {
            if b == 0 {
                return None;
            }
            a.wrapping_rem(b)
        }
        BinaryOp::Shl => a.wrapping_shl((b as u32) & 31),
        BinaryOp::Shr => a.wrapping_shr((b as u32) & 31),
        BinaryOp::BitAnd => a & b,
        BinaryOp::BitOr => a | b,
        BinaryOp::BitXor => a ^ b,
        BinaryOp::LAnd => ((a != 0) && (b != 0)) as i64,
        BinaryOp::LOr => ((a != 0) || (b != 0)) as i64,
        BinaryOp::Lt => (a < b) as i64,
        BinaryOp::Le => (a <= b) as i64,
        BinaryOp::Gt => (a > b) as i64,
        BinaryOp::Ge => (a >= b) as i64,
        BinaryOp::Eq => (a == b) as i64,
        BinaryOp::Ne => (a != b) as i64,
    })
}

/// True when evaluating the expression can have no side effects, so it may
/// be dropped by an algebraic identity.
fn is_pure(e: &Expr) -> bool {
    match &e.kind {
        ExprKind::Literal(_) | ExprKind::Ident(_) | ExprKind::SizeofType(_) => true,
        ExprKind::Unary { expr, .. } => is_pure(expr),
        ExprKind::Binary { lhs, rhs, .. } => is_pure(lhs) && is_pure(rhs),
        ExprKind::Cast { expr, .. } => is_pure(expr),
        ExprKind::SizeofExpr(inner) => is_pure(inner),
        ExprKind::Index { base, index } => is_pure(base) && is_pure(index),
        ExprKind::Member { base, .. } => is_pure(base),
        _ => false,
    }
}

fn int_lit(v: i64, span: Span) -> Expr {
    Expr::new(ExprKind::Literal(Literal::Int(v)), span)
}

fn bool_lit(v: bool, span: Span) -> Expr {
    Expr::new(ExprKind::Literal(Literal::Bool(v)), span)
}

fn as_int_literal(e: &Expr) -> Option<i64> {
    match &e.kind {
        ExprKind::Literal(Literal::Int(v)) => Some(*v),
        ExprKind::Literal(Literal::Char(c)) => Some(*c as i64),
        ExprKind::Literal(Literal::Bool(b)) => Some(*b as i64),
        _ => None,
    }
}

fn as_float_literal(e: &Expr) -> Option<f64> {
    match &e.kind {
        ExprKind::Literal(Literal::Float(v)) => Some(*v),
        _ => None,
    }
}

/// True/false as a condition, when statically known.
pub fn const_truth(e: &Expr) -> Option<bool> {
    if let Some(v) = as_int_literal(e) {
        return Some(v != 0);
    }
    as_float_literal(e).map(|v| v != 0.0)
}

pub fn fold_program(prog: Program) -> Program {
    Program {
        records: prog.records,
        messages: prog.messages,
        globals: prog
            .globals
            .into_iter()
            .map(|g| Global {
                init: g.init.map(fold_expr),
                ..g
            })
            .collect(),
        functions: prog
            .functions
            .into_iter()
            .map(|f| Function {
                body: fold_stmts(f.body),
                ..f
            })
            .collect(),
    }
}

fn fold_stmts(stmts: Vec<Stmt>) -> Vec<Stmt> {
    stmts.into_iter().filter_map(fold_stmt).collect()
}

fn fold_stmt(stmt: Stmt) -> Option<Stmt> {
    let span = stmt.span;
    let kind = match stmt.kind {
        StmtKind::Block(body) => StmtKind::Block(fold_stmts(body)),
        StmtKind::If {
            cond,
            then_branch,
            else_branch,
        } => {
            let cond = fold_expr(cond);
            let then_branch = fold_stmts(then_branch);
            let else_branch = else_branch.map(fold_stmts);
            match const_truth(&cond) {
                Some(true) => StmtKind::Block(then_branch),
                Some(false) => StmtKind::Block(else_branch.unwrap_or_default()),
                None => StmtKind::If {
                    cond,
                    then_branch,
                    else_branch,
                },
            }
        }
        StmtKind::While { cond, body } => {
            let cond = fold_expr(cond);
            let body = fold_stmts(body);
            if const_truth(&cond) == Some(false) {
                return None;
            }
            StmtKind::While { cond, body }
        }
        StmtKind::For {
            init,
            cond,
            post,
            body,
        } => StmtKind::For {
            init: init.and_then(|s| fold_stmt(*s)).map(Box::new),
            cond: cond.map(fold_expr),
            post: post.map(fold_expr),
            body: fold_stmts(body),
        },
        StmtKind::Return(e) => StmtKind::Return(e.map(fold_expr)),
        StmtKind::Decl {
            name,
            ty,
            array_size,
            init,
            is_const,
        } => StmtKind::Decl {
            name,
            ty,
            array_size: array_size.map(fold_expr),
            init: init.map(fold_expr),
            is_const,
        },
        StmtKind::ExprStmt(e) => StmtKind::ExprStmt(fold_expr(e)),
        other @ (StmtKind::Break | StmtKind::Continue) => other,
    };
    Some(Stmt::new(kind, span))
}

pub fn fold_expr(e: Expr) -> Expr {
    let span = e.span;
    match e.kind {
        ExprKind::Unary { op, expr } => {
            let inner = fold_expr(*expr);
            if let Some(v) = as_int_literal(&inner) {
                match op {
                    UnaryOp::Plus => return int_lit(v, span),
                    UnaryOp::Minus => return int_lit(v.wrapping_neg(), span),
                    UnaryOp::BitNot => return int_lit(!v, span),
                    UnaryOp::LogicalNot => return bool_lit(v == 0, span),
                    _ => {}
                }
            }
            if let Some(v) = as_float_literal(&inner) {
                match op {
                    UnaryOp::Plus => return Expr::new(ExprKind::Literal(Literal::Float(v)), span),
                    UnaryOp::Minus => {
                        return Expr::new(ExprKind::Literal(Literal::Float(-v)), span);
                    }
                    _ => {}
                }
            }
            Expr::new(
                ExprKind::Unary {
                    op,
                    expr: Box::new(inner),
                },
                span,
            )
        }
        ExprKind::Binary { op, lhs, rhs } => {
            let lhs = fold_expr(*lhs);
            let rhs = fold_expr(*rhs);
            fold_binary(op, lhs, rhs, span)
        }
        ExprKind::Assign { target, value } => Expr::new(
            ExprKind::Assign {
                target: Box::new(fold_expr(*target)),
                value: Box::new(fold_expr(*value)),
            },
            span,
        ),
        ExprKind::AssignOp { op, target, value } => Expr::new(
            ExprKind::AssignOp {
                op,
                target: Box::new(fold_expr(*target)),
                value: Box::new(fold_expr(*value)),
            },
            span,
        ),
        ExprKind::IncDec { pre, inc, target } => Expr::new(
            ExprKind::IncDec {
                pre,
                inc,
                target: Box::new(fold_expr(*target)),
            },
            span,
        ),
        ExprKind::Cast { ty, expr } => {
            let inner = fold_expr(*expr);
            if ty == Type::Int {
                if let Some(v) = as_int_literal(&inner) {
                    return int_lit(v, span);
                }
            }
            Expr::new(
                ExprKind::Cast {
                    ty,
                    expr: Box::new(inner),
                },
                span,
            )
        }
        ExprKind::Call { callee, args } => Expr::new(
            ExprKind::Call {
                callee,
                args: args.into_iter().map(fold_expr).collect(),
            },
            span,
        ),
        ExprKind::Index { base, index } => Expr::new(
            ExprKind::Index {
                base: Box::new(fold_expr(*base)),
                index: Box::new(fold_expr(*index)),
            },
            span,
        ),
        ExprKind::Member { base, field, arrow } => Expr::new(
            ExprKind::Member {
                base: Box::new(fold_expr(*base)),
                field,
                arrow,
            },
            span,
        ),
        ExprKind::ArrayLit(items) => Expr::new(
            ExprKind::ArrayLit(items.into_iter().map(fold_expr).collect()),
            span,
        ),
        ExprKind::Send { queue, value } => Expr::new(
            ExprKind::Send {
                queue: Box::new(fold_expr(*queue)),
                value: Box::new(fold_expr(*value)),
            },
            span,
        ),
        ExprKind::Recv { queue, timeout } => Expr::new(
            ExprKind::Recv {
                queue: Box::new(fold_expr(*queue)),
                timeout: timeout.map(|t| Box::new(fold_expr(*t))),
            },
            span,
        ),
        other => Expr::new(other, span),
    }
}

fn fold_binary(op: BinaryOp, lhs: Expr, rhs: Expr, span: Span) -> Expr {
    use BinaryOp::*;

    // Both sides constant: evaluate now.
    if let (Some(a), Some(b)) = (as_int_literal(&lhs), as_int_literal(&rhs)) {
        if let Some(v) = eval_int_binop(op, a, b) {
            return match op {
                Lt | Le | Gt | Ge | Eq | Ne | LAnd | LOr => bool_lit(v != 0, span),
                _ => int_lit(v, span),
            };
        }
    }
    if let (Some(a), Some(b)) = (as_float_literal(&lhs), as_float_literal(&rhs)) {
        match op {
            Add => return Expr::new(ExprKind::Literal(Literal::Float(a + b)), span),
            Sub => return Expr::new(ExprKind::Literal(Literal::Float(a - b)), span),
            Mul => return Expr::new(ExprKind::Literal(Literal::Float(a * b)), span),
            Div if b != 0.0 => {
                return Expr::new(ExprKind::Literal(Literal::Float(a / b)), span);
            }
            Lt => return bool_lit(a < b, span),
            Le => return bool_lit(a <= b, span),
            Gt => return bool_lit(a > b, span),
            Ge => return bool_lit(a >= b, span),
            Eq => return bool_lit(a == b, span),
            Ne => return bool_lit(a != b, span),
            _ => {}
        }
    }

    // Short-circuit operators with a known left side never evaluate the
    // right side, so the fold is safe regardless of purity.
    if op == LAnd {
        match as_int_literal(&lhs) {
            Some(0) => return bool_lit(false, span),
            Some(_) => return rhs,
            None => {}
        }
    }
    if op == LOr {
        match as_int_literal(&lhs) {
            Some(0) => return rhs,
            Some(_) => return bool_lit(true, span),
            None => {}
        }
    }

    // Algebraic identities; dropping a side requires it to be pure.
    let l = as_int_literal(&lhs);
    let r = as_int_literal(&rhs);
    match (op, l, r) {
        (Add, _, Some(0)) | (Sub, _, Some(0)) | (Shl, _, Some(0)) | (Shr, _, Some(0)) => {
            return lhs;
        }
        (Add, Some(0), _) => return rhs,
        (Mul, _, Some(1)) | (Div, _, Some(1)) => return lhs,
        (Mul, Some(1), _) => return rhs,
        (Mul, _, Some(0)) if is_pure(&lhs) => return int_lit(0, span),
        (Mul, Some(0), _) if is_pure(&rhs) => return int_lit(0, span),
        (BitAnd, _, Some(0)) if is_pure(&lhs) => return int_lit(0, span),
        (BitAnd, Some(0), _) if is_pure(&rhs) => return int_lit(0, span),
        (BitOr, _, Some(0)) | (BitXor, _, Some(0)) => return lhs,
        (BitOr, Some(0), _) | (BitXor, Some(0), _) => return rhs,
        _ => {}
    }

    Expr::new(
        ExprKind::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        },
        span,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use parse::parse_source;

    fn fold_first_init(src: &str) -> Expr {
        let prog = fold_program(parse_source(src).unwrap());
        prog.globals[0].init.clone().unwrap()
    }

    #[test]
    fn arithmetic_folds() {
        let e = fold_first_init("int x = 2 + 3 * 4;");
        assert!(matches!(e.kind, ExprKind::Literal(Literal::Int(14))));
    }

    #[test]
    fn hex_and_shift_folds() {
        let e = fold_first_init("int x = 1 << 4;");
        assert!(matches!(e.kind, ExprKind::Literal(Literal::Int(16))));
    }

    #[test]
    fn division_by_zero_is_left_alone() {
        let e = fold_first_init("int x = 1 / 0;");
        assert!(matches!(e.kind, ExprKind::Binary { .. }));
    }

    #[test]
    fn dead_if_branch_is_removed() {
        let prog = fold_program(
            parse_source("void f() { if (false) { bad(); } else { good(); } }").unwrap(),
        );
        match &prog.functions[0].body[0].kind {
            StmtKind::Block(body) => match &body[0].kind {
                StmtKind::ExprStmt(e) => {
                    assert!(matches!(e.kind, ExprKind::Call { ref callee, .. } if callee == "good"));
                }
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("expected folded block, got {:?}", other),
        }
    }

    #[test]
    fn while_false_disappears() {
        let prog = fold_program(parse_source("void f() { while (0) { spin(); } done(); }").unwrap());
        assert_eq!(prog.functions[0].body.len(), 1);
    }

    #[test]
    fn identity_add_zero() {
        let prog = fold_program(parse_source("void f(int x) { int y = x + 0; }").unwrap());
        match &prog.functions[0].body[0].kind {
            StmtKind::Decl { init, .. } => {
                assert!(matches!(init.as_ref().unwrap().kind, ExprKind::Ident(_)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn impure_side_is_not_dropped() {
        let prog = fold_program(parse_source("void f() { int y = g() * 0; }").unwrap());
        match &prog.functions[0].body[0].kind {
            StmtKind::Decl { init, .. } => {
                assert!(matches!(init.as_ref().unwrap().kind, ExprKind::Binary { .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn const_logic_short_circuits() {
        let e = fold_first_init("bool x = true && false;");
        assert!(matches!(e.kind, ExprKind::Literal(Literal::Bool(false))));
        let e = fold_first_init("bool y = false || true;");
        assert!(matches!(e.kind, ExprKind::Literal(Literal::Bool(true))));
    }
}
