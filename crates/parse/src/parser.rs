use diag::{Diag, DiagKind, Result};
use lex::{Keyword as Kw, LiteralKind, Punctuator as P, Span, Token, TokenKind as K};

use crate::ast::*;

pub struct Parser {
    toks: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn new(toks: Vec<Token>) -> Self {
        Self { toks, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.toks.get(self.pos)
    }
    fn peek_kind(&self) -> Option<K> {
        self.peek().map(|t| t.kind.clone())
    }
    fn peek_kind_n(&self, n: usize) -> Option<K> {
        self.toks.get(self.pos + n).map(|t| t.kind.clone())
    }

    fn cur_span(&self) -> Span {
        match self.toks.get(self.pos) {
            Some(t) => t.span,
            None => self.toks.last().map(|t| t.span).unwrap_or(Span::new(1, 1)),
        }
    }

    fn unexpected(&self, expected: &str) -> Diag {
        let span = self.cur_span();
        let got = match self.peek() {
            Some(t) => format!("`{}`", t.lexeme),
            None => "end of input".to_string(),
        };
        Diag::new(
            DiagKind::ParseUnexpectedToken,
            span.line,
            span.col,
            format!("expected {}, got {}", expected, got),
        )
    }

    fn expect_punct(&mut self, p: P) -> Result<()> {
        match self.peek_kind() {
            Some(K::Punct(pp)) if pp == p => {
                self.pos += 1;
                Ok(())
            }
            _ => Err(self.unexpected(&format!("{:?}", p))),
        }
    }

    fn consume_punct(&mut self, p: P) -> bool {
        if let Some(K::Punct(pp)) = self.peek_kind() {
            if pp == p {
                self.pos += 1;
                return true;
            }
        }
        false
    }

    fn consume_keyword(&mut self, kw: Kw) -> bool {
        if let Some(K::Keyword(k)) = self.peek_kind() {
            if k == kw {
                self.pos += 1;
                return true;
            }
        }
        false
    }

    fn expect_ident(&mut self) -> Result<String> {
        match self.peek_kind() {
            Some(K::Identifier(s)) => {
                self.pos += 1;
                Ok(s)
            }
            _ => Err(self.unexpected("identifier")),
        }
    }

    fn expect_int_literal(&mut self) -> Result<(i64, Span)> {
        let span = self.cur_span();
        match self.peek_kind() {
            Some(K::Literal(LiteralKind::Int(v))) => {
                self.pos += 1;
                Ok((v, span))
            }
            _ => Err(self.unexpected("integer literal")),
        }
    }

    fn peek_is_type_keyword(&self) -> bool {
        matches!(
            self.peek_kind(),
            Some(K::Keyword(
                Kw::Int | Kw::Float | Kw::Char | Kw::Bool | Kw::Void | Kw::Struct | Kw::Union
            ))
        )
    }

    /// `struct`/`union` followed by a brace (directly or after a tag) opens
    /// a record definition rather than a type usage.
    fn peek_is_record_def(&self) -> bool {
        if !matches!(self.peek_kind(), Some(K::Keyword(Kw::Struct | Kw::Union))) {
            return false;
        }
        match self.peek_kind_n(1) {
            Some(K::Punct(P::LBrace)) => true,
            Some(K::Identifier(_)) => matches!(self.peek_kind_n(2), Some(K::Punct(P::LBrace))),
            _ => false,
        }
    }

    fn parse_type(&mut self) -> Result<Type> {
        let mut ty = match self.peek_kind() {
            Some(K::Keyword(Kw::Int)) => {
                self.pos += 1;
                Type::Int
            }
            Some(K::Keyword(Kw::Float)) => {
                self.pos += 1;
                Type::Float
            }
            Some(K::Keyword(Kw::Char)) => {
                self.pos += 1;
                Type::Char
            }
            Some(K::Keyword(Kw::Bool)) => {
                self.pos += 1;
                Type::Bool
            }
            Some(K::Keyword(Kw::Void)) => {
                self.pos += 1;
                Type::Void
            }
            Some(K::Keyword(Kw::Struct)) => {
                self.pos += 1;
                Type::Struct(self.expect_ident()?)
            }
            Some(K::Keyword(Kw::Union)) => {
                self.pos += 1;
                Type::Union(self.expect_ident()?)
            }
            Some(K::Identifier(s)) => {
                self.pos += 1;
                Type::Named(s)
            }
            _ => return Err(self.unexpected("type")),
        };
        while self.consume_punct(P::Star) {
            ty = Type::pointer_to(ty);
        }
        Ok(ty)
    }

    // ---------------- top level ----------------

    pub fn parse_program(&mut self) -> Result<Program> {
        let mut prog = Program::default();
        while let Some(tok) = self.peek() {
            if matches!(tok.kind, K::Punct(P::Semicolon)) {
                self.pos += 1;
                continue;
            }
            self.parse_top_level(&mut prog)?;
        }
        Ok(prog)
    }

    fn parse_top_level(&mut self, prog: &mut Program) -> Result<()> {
        if self.peek_is_record_def() {
            let rec = self.parse_record_decl(prog)?;
            prog.records.push(rec);
            return Ok(());
        }
        if matches!(self.peek_kind(), Some(K::Keyword(Kw::Message))) {
            let md = self.parse_message_decl()?;
            prog.messages.push(md);
            return Ok(());
        }

        let span = self.cur_span();
        let mut is_const = false;
        loop {
            if self.consume_keyword(Kw::Const) {
                is_const = true;
                continue;
            }
            if self.consume_keyword(Kw::Static) {
                continue;
            }
            break;
        }
        let ty = self.parse_type()?;
        let name = self.expect_ident()?;

        if self.consume_punct(P::LParen) {
            let params = self.parse_params()?;
            let body = self.parse_block()?;
            prog.functions.push(Function {
                name,
                ret_type: ty,
                params,
                body,
                span,
            });
            return Ok(());
        }

        let array_size = self.parse_array_suffix()?;
        let init = if self.consume_punct(P::Assign) {
            Some(self.parse_initializer()?)
        } else {
            None
        };
        self.expect_punct(P::Semicolon)?;
        prog.globals.push(Global {
            name,
            ty,
            array_size,
            init,
            is_const,
            span,
        });
        Ok(())
    }

    fn parse_array_suffix(&mut self) -> Result<Option<Expr>> {
        if self.consume_punct(P::LBracket) {
            let e = self.parse_expr()?;
            self.expect_punct(P::RBracket)?;
            Ok(Some(e))
        } else {
            Ok(None)
        }
    }

    fn parse_record_decl(&mut self, prog: &mut Program) -> Result<RecordDecl> {
        let span = self.cur_span();
        let kind = if self.consume_keyword(Kw::Struct) {
            RecordKind::Struct
        } else if self.consume_keyword(Kw::Union) {
            RecordKind::Union
        } else {
            return Err(self.unexpected("struct or union"));
        };
        let name = match self.peek_kind() {
            Some(K::Identifier(s)) => {
                self.pos += 1;
                s
            }
            _ => String::new(),
        };
        self.expect_punct(P::LBrace)?;
        let mut fields = Vec::new();
        while !self.consume_punct(P::RBrace) {
            if self.peek().is_none() {
                return Err(self.unexpected("field or `}`"));
            }
            let fspan = self.cur_span();
            if self.peek_is_record_def() {
                let rec = self.parse_record_decl(prog)?;
                if rec.name.is_empty() {
                    fields.push(FieldDecl::Anonymous {
                        kind: rec.kind,
                        fields: rec.fields,
                        span: fspan,
                    });
                } else {
                    // Tagged nested definition: hoist to program scope.
                    prog.records.push(rec);
                }
                continue;
            }
            let ty = self.parse_type()?;
            let name = self.expect_ident()?;
            let array_size = self.parse_array_suffix()?;
            let bit_width = if self.consume_punct(P::Colon) {
                Some(self.expect_int_literal()?)
            } else {
                None
            };
            let default = if self.consume_punct(P::Assign) {
                Some(self.parse_initializer()?)
            } else {
                None
            };
            self.expect_punct(P::Semicolon)?;
            fields.push(FieldDecl::Field {
                name,
                ty,
                array_size,
                bit_width,
                default,
                span: fspan,
            });
        }
        let _ = self.consume_punct(P::Semicolon);
        Ok(RecordDecl {
            kind,
            name,
            fields,
            span,
        })
    }

    fn parse_message_decl(&mut self) -> Result<MessageDecl> {
        let span = self.cur_span();
        if !self.consume_keyword(Kw::Message) {
            return Err(self.unexpected("message"));
        }
        self.expect_punct(P::Lt)?;
        let elem = self.parse_type()?;
        self.expect_punct(P::Gt)?;
        let name = self.expect_ident()?;
        self.expect_punct(P::Semicolon)?;
        Ok(MessageDecl { name, elem, span })
    }

    fn parse_params(&mut self) -> Result<Vec<Param>> {
        if self.consume_punct(P::RParen) {
            return Ok(vec![]);
        }
        if matches!(self.peek_kind(), Some(K::Keyword(Kw::Void)))
            && matches!(self.peek_kind_n(1), Some(K::Punct(P::RParen)))
        {
            self.pos += 2;
            return Ok(vec![]);
        }
        let mut params = Vec::new();
        loop {
            let ty = self.parse_type()?;
            let name = self.expect_ident()?;
            params.push(Param { name, ty });
            if self.consume_punct(P::Comma) {
                continue;
            }
            self.expect_punct(P::RParen)?;
            break;
        }
        Ok(params)
    }

    // ---------------- statements ----------------

    fn parse_block(&mut self) -> Result<Vec<Stmt>> {
        self.expect_punct(P::LBrace)?;
        let mut items = Vec::new();
        while !self.consume_punct(P::RBrace) {
            if self.peek().is_none() {
                return Err(self.unexpected("statement or `}`"));
            }
            items.push(self.parse_stmt()?);
        }
        Ok(items)
    }

    fn parse_stmt_or_block(&mut self) -> Result<Vec<Stmt>> {
        if matches!(self.peek_kind(), Some(K::Punct(P::LBrace))) {
            self.parse_block()
        } else {
            Ok(vec![self.parse_stmt()?])
        }
    }

    fn parse_stmt(&mut self) -> Result<Stmt> {
        let span = self.cur_span();
        if matches!(self.peek_kind(), Some(K::Punct(P::LBrace))) {
            return Ok(Stmt::new(StmtKind::Block(self.parse_block()?), span));
        }
        if self.consume_keyword(Kw::Return) {
            let e = if matches!(self.peek_kind(), Some(K::Punct(P::Semicolon))) {
                None
            } else {
                Some(self.parse_expr()?)
            };
            self.expect_punct(P::Semicolon)?;
            return Ok(Stmt::new(StmtKind::Return(e), span));
        }
        if self.consume_keyword(Kw::If) {
            self.expect_punct(P::LParen)?;
            let cond = self.parse_expr()?;
            self.expect_punct(P::RParen)?;
            let then_branch = self.parse_stmt_or_block()?;
            let else_branch = if self.consume_keyword(Kw::Else) {
                Some(self.parse_stmt_or_block()?)
            } else {
                None
            };
            return Ok(Stmt::new(
                StmtKind::If {
                    cond,
                    then_branch,
                    else_branch,
                },
                span,
            ));
        }
        if self.consume_keyword(Kw::While) {
            self.expect_punct(P::LParen)?;
            let cond = self.parse_expr()?;
            self.expect_punct(P::RParen)?;
            let body = self.parse_stmt_or_block()?;
            return Ok(Stmt::new(StmtKind::While { cond, body }, span));
        }
        if self.consume_keyword(Kw::For) {
            self.expect_punct(P::LParen)?;
            let init = if self.consume_punct(P::Semicolon) {
                None
            } else {
                Some(Box::new(self.parse_decl_or_expr_stmt()?))
            };
            let cond = if matches!(self.peek_kind(), Some(K::Punct(P::Semicolon))) {
                None
            } else {
                Some(self.parse_expr()?)
            };
            self.expect_punct(P::Semicolon)?;
            let post = if matches!(self.peek_kind(), Some(K::Punct(P::RParen))) {
                None
            } else {
                Some(self.parse_expr()?)
            };
            self.expect_punct(P::RParen)?;
            let body = self.parse_stmt_or_block()?;
            return Ok(Stmt::new(
                StmtKind::For {
                    init,
                    cond,
                    post,
                    body,
                },
                span,
            ));
        }
        if self.consume_keyword(Kw::Break) {
            self.expect_punct(P::Semicolon)?;
            return Ok(Stmt::new(StmtKind::Break, span));
        }
        if self.consume_keyword(Kw::Continue) {
            self.expect_punct(P::Semicolon)?;
            return Ok(Stmt::new(StmtKind::Continue, span));
        }
        self.parse_decl_or_expr_stmt()
    }

    /// Declaration or expression statement, consuming the trailing `;`.
    /// Also serves as the `for` initializer.
    fn parse_decl_or_expr_stmt(&mut self) -> Result<Stmt> {
        let span = self.cur_span();
        let save = self.pos;
        let mut is_const = false;
        loop {
            if self.consume_keyword(Kw::Const) {
                is_const = true;
                continue;
            }
            if self.consume_keyword(Kw::Static) {
                continue;
            }
            break;
        }
        let is_decl = if self.peek_is_type_keyword() {
            true
        } else if matches!(self.peek_kind(), Some(K::Identifier(_))) {
            // IDENT ('*')* IDENT reads as a declaration with a named type.
            let mut i = 1usize;
            while matches!(self.peek_kind_n(i), Some(K::Punct(P::Star))) {
                i += 1;
            }
            matches!(self.peek_kind_n(i), Some(K::Identifier(_)))
        } else {
            false
        };
        if is_decl {
            let ty = self.parse_type()?;
            let name = self.expect_ident()?;
            let array_size = self.parse_array_suffix()?;
            let init = if self.consume_punct(P::Assign) {
                Some(self.parse_initializer()?)
            } else {
                None
            };
            self.expect_punct(P::Semicolon)?;
            return Ok(Stmt::new(
                StmtKind::Decl {
                    name,
                    ty,
                    array_size,
                    init,
                    is_const,
                },
                span,
            ));
        }
        self.pos = save;
        let e = self.parse_expr()?;
        self.expect_punct(P::Semicolon)?;
        Ok(Stmt::new(StmtKind::ExprStmt(e), span))
    }

    // ---------------- expressions ----------------

    fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_assignment()
    }

    fn punct_to_assign_binop(p: &P) -> Option<BinaryOp> {
        Some(match p {
            P::PlusAssign => BinaryOp::Add,
            P::MinusAssign => BinaryOp::Sub,
            P::StarAssign => BinaryOp::Mul,
            P::SlashAssign => BinaryOp::Div,
            P::PercentAssign => BinaryOp::Mod,
            P::AndAssign => BinaryOp::BitAnd,
            P::OrAssign => BinaryOp::BitOr,
            P::XorAssign => BinaryOp::BitXor,
            P::ShlAssign => BinaryOp::Shl,
            P::ShrAssign => BinaryOp::Shr,
            _ => return None,
        })
    }

    fn parse_assignment(&mut self) -> Result<Expr> {
        let span = self.cur_span();
        let lhs = self.parse_logical_or()?;
        match self.peek_kind() {
            Some(K::Punct(P::Assign)) => {
                self.pos += 1;
                let rhs = self.parse_assignment()?;
                Ok(Expr::new(
                    ExprKind::Assign {
                        target: Box::new(lhs),
                        value: Box::new(rhs),
                    },
                    span,
                ))
            }
            Some(K::Punct(ref p)) => match Self::punct_to_assign_binop(p) {
                Some(op) => {
                    self.pos += 1;
                    let rhs = self.parse_assignment()?;
                    Ok(Expr::new(
                        ExprKind::AssignOp {
                            op,
                            target: Box::new(lhs),
                            value: Box::new(rhs),
                        },
                        span,
                    ))
                }
                None => Ok(lhs),
            },
            _ => Ok(lhs),
        }
    }

    fn bin(span: Span, op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::new(
            ExprKind::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            span,
        )
    }

    fn parse_logical_or(&mut self) -> Result<Expr> {
        let span = self.cur_span();
        let mut lhs = self.parse_logical_and()?;
        while self.consume_punct(P::OrOr) {
            let rhs = self.parse_logical_and()?;
            lhs = Self::bin(span, BinaryOp::LOr, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_logical_and(&mut self) -> Result<Expr> {
        let span = self.cur_span();
        let mut lhs = self.parse_bitor()?;
        while self.consume_punct(P::AndAnd) {
            let rhs = self.parse_bitor()?;
            lhs = Self::bin(span, BinaryOp::LAnd, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_bitor(&mut self) -> Result<Expr> {
        let span = self.cur_span();
        let mut lhs = self.parse_bitxor()?;
        while self.consume_punct(P::Pipe) {
            let rhs = self.parse_bitxor()?;
            lhs = Self::bin(span, BinaryOp::BitOr, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_bitxor(&mut self) -> Result<Expr> {
        let span = self.cur_span();
        let mut lhs = self.parse_bitand()?;
        while self.consume_punct(P::Caret) {
            let rhs = self.parse_bitand()?;
            lhs = Self::bin(span, BinaryOp::BitXor, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_bitand(&mut self) -> Result<Expr> {
        let span = self.cur_span();
        let mut lhs = self.parse_equality()?;
        while self.consume_punct(P::Amp) {
            let rhs = self.parse_equality()?;
            lhs = Self::bin(span, BinaryOp::BitAnd, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_equality(&mut self) -> Result<Expr> {
        let span = self.cur_span();
        let mut lhs = self.parse_relational()?;
        loop {
            match self.peek_kind() {
                Some(K::Punct(P::Eq)) => {
                    self.pos += 1;
                    let rhs = self.parse_relational()?;
                    lhs = Self::bin(span, BinaryOp::Eq, lhs, rhs);
                }
                Some(K::Punct(P::Ne)) => {
                    self.pos += 1;
                    let rhs = self.parse_relational()?;
                    lhs = Self::bin(span, BinaryOp::Ne, lhs, rhs);
                }
                _ => break,
            }
        }
        Ok(lhs)
    }

    fn parse_relational(&mut self) -> Result<Expr> {
        let span = self.cur_span();
        let mut lhs = self.parse_shift()?;
        loop {
            let op = match self.peek_kind() {
                Some(K::Punct(P::Lt)) => BinaryOp::Lt,
                Some(K::Punct(P::Le)) => BinaryOp::Le,
                Some(K::Punct(P::Gt)) => BinaryOp::Gt,
                Some(K::Punct(P::Ge)) => BinaryOp::Ge,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_shift()?;
            lhs = Self::bin(span, op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_shift(&mut self) -> Result<Expr> {
        let span = self.cur_span();
        let mut lhs = self.parse_add_sub()?;
        loop {
            let op = match self.peek_kind() {
                Some(K::Punct(P::Shl)) => BinaryOp::Shl,
                Some(K::Punct(P::Shr)) => BinaryOp::Shr,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_add_sub()?;
            lhs = Self::bin(span, op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_add_sub(&mut self) -> Result<Expr> {
        let span = self.cur_span();
        let mut lhs = self.parse_mul_div_mod()?;
        loop {
            let op = match self.peek_kind() {
                Some(K::Punct(P::Plus)) => BinaryOp::Add,
                Some(K::Punct(P::Minus)) => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_mul_div_mod()?;
            lhs = Self::bin(span, op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_mul_div_mod(&mut self) -> Result<Expr> {
        let span = self.cur_span();
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek_kind() {
                Some(K::Punct(P::Star)) => BinaryOp::Mul,
                Some(K::Punct(P::Slash)) => BinaryOp::Div,
                Some(K::Punct(P::Percent)) => BinaryOp::Mod,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_unary()?;
            lhs = Self::bin(span, op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        let span = self.cur_span();
        if matches!(self.peek_kind(), Some(K::Keyword(Kw::Sizeof))) {
            self.pos += 1;
            self.expect_punct(P::LParen)?;
            let named_ptr = matches!(self.peek_kind(), Some(K::Identifier(_)))
                && matches!(self.peek_kind_n(1), Some(K::Punct(P::Star)));
            if self.peek_is_type_keyword() || named_ptr {
                let ty = self.parse_type()?;
                self.expect_punct(P::RParen)?;
                return Ok(Expr::new(ExprKind::SizeofType(ty), span));
            }
            let e = self.parse_expr()?;
            self.expect_punct(P::RParen)?;
            return Ok(Expr::new(ExprKind::SizeofExpr(Box::new(e)), span));
        }
        if matches!(self.peek_kind(), Some(K::Punct(P::LParen))) {
            let next_is_type = match self.peek_kind_n(1) {
                Some(K::Keyword(kw)) => matches!(
                    kw,
                    Kw::Int | Kw::Float | Kw::Char | Kw::Bool | Kw::Void | Kw::Struct | Kw::Union
                ),
                // `(Name*)` reads as a cast; a bare `(name)` stays an expression.
                Some(K::Identifier(_)) => matches!(self.peek_kind_n(2), Some(K::Punct(P::Star))),
                _ => false,
            };
            if next_is_type {
                self.pos += 1;
                let ty = self.parse_type()?;
                self.expect_punct(P::RParen)?;
                let e = self.parse_unary()?;
                return Ok(Expr::new(
                    ExprKind::Cast {
                        ty,
                        expr: Box::new(e),
                    },
                    span,
                ));
            }
        }
        let unary = |p: &mut Self, op: UnaryOp| -> Result<Expr> {
            p.pos += 1;
            let e = p.parse_unary()?;
            Ok(Expr::new(
                ExprKind::Unary {
                    op,
                    expr: Box::new(e),
                },
                span,
            ))
        };
        match self.peek_kind() {
            Some(K::Punct(P::Inc)) => {
                self.pos += 1;
                let target = self.parse_unary()?;
                Ok(Expr::new(
                    ExprKind::IncDec {
                        pre: true,
                        inc: true,
                        target: Box::new(target),
                    },
                    span,
                ))
            }
            Some(K::Punct(P::Dec)) => {
                self.pos += 1;
                let target = self.parse_unary()?;
                Ok(Expr::new(
                    ExprKind::IncDec {
                        pre: true,
                        inc: false,
                        target: Box::new(target),
                    },
                    span,
                ))
            }
            Some(K::Punct(P::Plus)) => unary(self, UnaryOp::Plus),
            Some(K::Punct(P::Minus)) => unary(self, UnaryOp::Minus),
            Some(K::Punct(P::Tilde)) => unary(self, UnaryOp::BitNot),
            Some(K::Punct(P::Bang)) => unary(self, UnaryOp::LogicalNot),
            Some(K::Punct(P::Amp)) => unary(self, UnaryOp::AddrOf),
            Some(K::Punct(P::Star)) => unary(self, UnaryOp::Deref),
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr> {
        let span = self.cur_span();
        let mut e = self.parse_primary()?;
        loop {
            match self.peek_kind() {
                Some(K::Punct(P::LParen)) => {
                    self.pos += 1;
                    e = self.finish_call(e, span)?;
                }
                Some(K::Punct(P::LBracket)) => {
                    self.pos += 1;
                    let idx = self.parse_expr()?;
                    self.expect_punct(P::RBracket)?;
                    e = Expr::new(
                        ExprKind::Index {
                            base: Box::new(e),
                            index: Box::new(idx),
                        },
                        span,
                    );
                }
                Some(K::Punct(P::Dot)) => {
                    self.pos += 1;
                    let field = self.expect_ident()?;
                    e = Expr::new(
                        ExprKind::Member {
                            base: Box::new(e),
                            field,
                            arrow: false,
                        },
                        span,
                    );
                }
                Some(K::Punct(P::Arrow)) => {
                    self.pos += 1;
                    let field = self.expect_ident()?;
                    e = Expr::new(
                        ExprKind::Member {
                            base: Box::new(e),
                            field,
                            arrow: true,
                        },
                        span,
                    );
                }
                Some(K::Punct(P::Inc)) => {
                    self.pos += 1;
                    e = Expr::new(
                        ExprKind::IncDec {
                            pre: false,
                            inc: true,
                            target: Box::new(e),
                        },
                        span,
                    );
                }
                Some(K::Punct(P::Dec)) => {
                    self.pos += 1;
                    e = Expr::new(
                        ExprKind::IncDec {
                            pre: false,
                            inc: false,
                            target: Box::new(e),
                        },
                        span,
                    );
                }
                _ => break,
            }
        }
        Ok(e)
    }

    /// Called with the opening `(` already consumed. Dispatches plain calls
    /// and the `q.send(..)` / `q.recv(..)` channel forms.
    fn finish_call(&mut self, callee: Expr, span: Span) -> Result<Expr> {
        match callee.kind {
            ExprKind::Ident(name) => {
                let mut args = Vec::new();
                if !self.consume_punct(P::RParen) {
                    loop {
                        args.push(self.parse_assignment()?);
                        if self.consume_punct(P::Comma) {
                            continue;
                        }
                        self.expect_punct(P::RParen)?;
                        break;
                    }
                }
                Ok(Expr::new(ExprKind::Call { callee: name, args }, span))
            }
            ExprKind::Member {
                base,
                field,
                arrow: false,
            } if field == "send" => {
                let value = self.parse_assignment()?;
                self.expect_punct(P::RParen)?;
                Ok(Expr::new(
                    ExprKind::Send {
                        queue: base,
                        value: Box::new(value),
                    },
                    span,
                ))
            }
            ExprKind::Member {
                base,
                field,
                arrow: false,
            } if field == "recv" => {
                let timeout = if self.consume_punct(P::RParen) {
                    None
                } else {
                    if matches!(self.peek_kind(), Some(K::Identifier(ref s)) if s == "timeout")
                        && matches!(self.peek_kind_n(1), Some(K::Punct(P::Colon)))
                    {
                        self.pos += 2;
                    }
                    let e = self.parse_assignment()?;
                    self.expect_punct(P::RParen)?;
                    Some(Box::new(e))
                };
                Ok(Expr::new(
                    ExprKind::Recv {
                        queue: base,
                        timeout,
                    },
                    span,
                ))
            }
            _ => Err(Diag::new(
                DiagKind::ParseUnexpectedToken,
                span.line,
                span.col,
                "expression is not callable",
            )),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let span = self.cur_span();
        match self.peek_kind() {
            Some(K::Literal(l)) => {
                self.pos += 1;
                let lit = match l {
                    LiteralKind::Int(v) => Literal::Int(v),
                    LiteralKind::Float(v) => Literal::Float(v),
                    LiteralKind::Char(v) => Literal::Char(v),
                    LiteralKind::Str(s) => Literal::Str(s),
                    LiteralKind::Bool(b) => Literal::Bool(b),
                };
                Ok(Expr::new(ExprKind::Literal(lit), span))
            }
            Some(K::Identifier(s)) => {
                self.pos += 1;
                Ok(Expr::new(ExprKind::Ident(s), span))
            }
            Some(K::Punct(P::LParen)) => {
                self.pos += 1;
                let e = self.parse_expr()?;
                self.expect_punct(P::RParen)?;
                Ok(e)
            }
            _ => Err(self.unexpected("expression")),
        }
    }

    /// `{ e, e, ... }` array literal or a plain expression.
    fn parse_initializer(&mut self) -> Result<Expr> {
        let span = self.cur_span();
        if self.consume_punct(P::LBrace) {
            let mut items = Vec::new();
            if !self.consume_punct(P::RBrace) {
                loop {
                    items.push(self.parse_initializer()?);
                    if self.consume_punct(P::Comma) {
                        if self.consume_punct(P::RBrace) {
                            break;
                        }
                        continue;
                    }
                    self.expect_punct(P::RBrace)?;
                    break;
                }
            }
            return Ok(Expr::new(ExprKind::ArrayLit(items), span));
        }
        self.parse_assignment()
    }
}

/// Parse a lexed token stream into a translation unit.
pub fn parse_program(tokens: Vec<Token>) -> Result<Program> {
    Parser::new(tokens).parse_program()
}

/// Lex and parse in one step.
pub fn parse_source(src: &str) -> Result<Program> {
    let toks = lex::lex(src)?;
    parse_program(toks)
}
