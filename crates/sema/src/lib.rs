//! Semantic analysis: name resolution, type checking, layout computation,
//! and address assignment.
//!
//! `analyze` walks the program in declaration order and produces an
//! `Analysis` the bytecode generator consumes: the read-only layout table,
//! global addresses, function ids and frame sizes, and message channel ids.

pub mod fold;
pub mod layout;

pub use layout::{
    alignof_type, build_layouts, sizeof_type, FieldDescriptor, LayoutTable, StructLayout,
};

use diag::{Diag, DiagKind, Result};
use fold::eval_const_int;
use parse::ast::*;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionInfo {
    pub name: String,
    pub id: usize,
    pub ret_type: Type,
    pub params: Vec<Param>,
    /// Frame slots: parameters first, then every local declaration.
    pub frame_size: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GlobalInfo {
    pub name: String,
    pub ty: Type,
    pub address: i64,
    pub is_const: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageInfo {
    pub name: String,
    pub id: usize,
    pub elem: Type,
}

#[derive(Debug, Clone)]
pub struct Analysis {
    pub layouts: LayoutTable,
    pub globals: Vec<GlobalInfo>,
    pub functions: Vec<FunctionInfo>,
    pub messages: Vec<MessageInfo>,
}

/// Built-in intrinsics lowered directly to opcodes: argument count and
/// result type. `StartTask`, `DBG_PRINT`, and `DBG_PRINTF` have bespoke
/// checking and are not listed here.
pub fn builtin_signature(name: &str) -> Option<(usize, Type)> {
    Some(match name {
        "RTOS_DELAY_MS" => (1, Type::Void),
        "RTOS_YIELD" => (0, Type::Void),
        "RTOS_SUSPEND_TASK" | "RTOS_RESUME_TASK" | "RTOS_DELETE_TASK" => (1, Type::Void),
        "RTOS_SEMAPHORE_CREATE" => (0, Type::Int),
        "RTOS_SEMAPHORE_TAKE" => (2, Type::Int),
        "RTOS_SEMAPHORE_GIVE" => (1, Type::Void),
        "HW_GPIO_INIT" | "HW_GPIO_SET" => (2, Type::Void),
        "HW_GPIO_GET" => (1, Type::Int),
        "HW_TIMER_INIT" => (3, Type::Void),
        "HW_TIMER_START" | "HW_TIMER_STOP" => (1, Type::Void),
        "HW_TIMER_SET_PWM_DUTY" => (2, Type::Void),
        "HW_ADC_INIT" => (1, Type::Void),
        "HW_ADC_READ" => (1, Type::Int),
        "HW_UART_WRITE" => (2, Type::Void),
        "HW_SPI_TRANSFER" => (3, Type::Int),
        "HW_I2C_WRITE" => (2, Type::Void),
        "HW_I2C_READ" => (2, Type::Int),
        "DBG_BREAKPOINT" => (0, Type::Void),
        _ => return None,
    })
}

pub fn is_intrinsic_name(name: &str) -> bool {
    matches!(name, "StartTask" | "DBG_PRINT" | "DBG_PRINTF") || builtin_signature(name).is_some()
}

fn is_numeric(ty: &Type) -> bool {
    matches!(ty, Type::Int | Type::Float | Type::Char | Type::Bool)
}

fn is_int_like(ty: &Type) -> bool {
    matches!(ty, Type::Int | Type::Char | Type::Bool)
}

fn is_condition(ty: &Type) -> bool {
    is_numeric(ty) || matches!(ty, Type::Pointer(_))
}

struct LocalSym {
    ty: Type,
    is_const: bool,
}

struct Analyzer {
    layouts: LayoutTable,
    globals: Vec<GlobalInfo>,
    global_index: HashMap<String, usize>,
    functions: Vec<FunctionInfo>,
    function_index: HashMap<String, usize>,
    messages: Vec<MessageInfo>,
    message_index: HashMap<String, usize>,
    scopes: Vec<HashMap<String, LocalSym>>,
    current_ret: Type,
    local_slots: usize,
    loop_depth: usize,
}

pub fn analyze(prog: &Program) -> Result<Analysis> {
    let layouts = build_layouts(&prog.records)?;
    let mut a = Analyzer {
        layouts,
        globals: Vec::new(),
        global_index: HashMap::new(),
        functions: Vec::new(),
        function_index: HashMap::new(),
        messages: Vec::new(),
        message_index: HashMap::new(),
        scopes: Vec::new(),
        current_ret: Type::Void,
        local_slots: 0,
        loop_depth: 0,
    };
    a.collect_messages(prog)?;
    a.collect_globals(prog)?;
    a.collect_functions(prog)?;
    for f in &prog.functions {
        a.check_function(f)?;
    }
    Ok(Analysis {
        layouts: a.layouts,
        globals: a.globals,
        functions: a.functions,
        messages: a.messages,
    })
}

impl Analyzer {
    fn err(kind: DiagKind, span: Span, message: impl Into<String>) -> Diag {
        Diag::new(kind, span.line, span.col, message)
    }

    fn check_fresh_name(&self, name: &str, span: Span) -> Result<()> {
        if is_intrinsic_name(name) {
            return Err(Self::err(
                DiagKind::DuplicateDefinition,
                span,
                format!("{} is a reserved intrinsic name", name),
            ));
        }
        if self.global_index.contains_key(name)
            || self.function_index.contains_key(name)
            || self.message_index.contains_key(name)
        {
            return Err(Self::err(
                DiagKind::DuplicateDefinition,
                span,
                format!("duplicate definition of {}", name),
            ));
        }
        Ok(())
    }

    fn resolve_type(&self, ty: &Type, span: Span) -> Result<Type> {
        Ok(match ty {
            Type::Named(n) => match self.layouts.get(n).map(|l| l.kind) {
                Some(RecordKind::Struct) => Type::Struct(n.clone()),
                Some(RecordKind::Union) => Type::Union(n.clone()),
                None => {
                    return Err(Self::err(
                        DiagKind::UndefinedSymbol,
                        span,
                        format!("unknown type name: {}", n),
                    ));
                }
            },
            Type::Struct(n) | Type::Union(n) => {
                if !self.layouts.contains(n) {
                    return Err(Self::err(
                        DiagKind::UndefinedSymbol,
                        span,
                        format!("unknown struct or union: {}", n),
                    ));
                }
                ty.clone()
            }
            Type::Pointer(inner) => Type::Pointer(Box::new(self.resolve_type(inner, span)?)),
            Type::Array(inner, n) => Type::Array(Box::new(self.resolve_type(inner, span)?), *n),
            Type::Message(inner) => Type::Message(Box::new(self.resolve_type(inner, span)?)),
            other => other.clone(),
        })
    }

    /// Resolve a declared type together with its optional `[N]` suffix.
    fn decl_type(&self, ty: &Type, array_size: &Option<Expr>, span: Span) -> Result<Type> {
        let resolved = self.resolve_type(ty, span)?;
        match array_size {
            None => Ok(resolved),
            Some(e) => {
                let n = eval_const_int(e).ok_or_else(|| {
                    Self::err(
                        DiagKind::ArraySizeNotConstant,
                        span,
                        "array size is not a constant expression",
                    )
                })?;
                if n <= 0 {
                    return Err(Self::err(
                        DiagKind::ArraySizeNotConstant,
                        span,
                        format!("array size must be positive, got {}", n),
                    ));
                }
                Ok(Type::Array(Box::new(resolved), n as usize))
            }
        }
    }

    fn assignable(&self, dst: &Type, src: &Type) -> bool {
        if dst == src {
            return true;
        }
        match (dst, src) {
            (d, s) if is_numeric(d) && is_numeric(s) => true,
            (Type::Pointer(a), Type::Pointer(b)) => {
                **a == Type::Void || **b == Type::Void || a == b
            }
            (Type::Pointer(a), Type::Array(b, _)) => a == b,
            _ => false,
        }
    }

    // ---------------- declaration collection ----------------

    fn collect_messages(&mut self, prog: &Program) -> Result<()> {
        for m in &prog.messages {
            self.check_fresh_name(&m.name, m.span)?;
            let elem = self.resolve_type(&m.elem, m.span)?;
            let id = self.messages.len();
            self.message_index.insert(m.name.clone(), id);
            self.messages.push(MessageInfo {
                name: m.name.clone(),
                id,
                elem,
            });
        }
        Ok(())
    }

    fn collect_globals(&mut self, prog: &Program) -> Result<()> {
        for g in &prog.globals {
            self.check_fresh_name(&g.name, g.span)?;
            let ty = self.decl_type(&g.ty, &g.array_size, g.span)?;
            if ty == Type::Void {
                return Err(Self::err(
                    DiagKind::TypeMismatch,
                    g.span,
                    format!("global {} cannot have void type", g.name),
                ));
            }
            if let Some(init) = &g.init {
                self.check_const_initializer(&ty, init, g.span)?;
            }
            let address = self.globals.len() as i64;
            self.global_index.insert(g.name.clone(), self.globals.len());
            self.globals.push(GlobalInfo {
                name: g.name.clone(),
                ty,
                address,
                is_const: g.is_const,
            });
        }
        Ok(())
    }

    fn check_const_initializer(&self, ty: &Type, init: &Expr, span: Span) -> Result<()> {
        match (ty, &init.kind) {
            (t, _) if is_numeric(t) => {
                let const_ok =
                    eval_const_int(init).is_some() || fold::eval_const_float(init).is_some();
                if !const_ok {
                    return Err(Self::err(
                        DiagKind::TypeMismatch,
                        span,
                        "global initializer is not a constant expression",
                    ));
                }
                Ok(())
            }
            (Type::Pointer(inner), ExprKind::Literal(Literal::Str(_)))
                if **inner == Type::Char =>
            {
                Ok(())
            }
            (Type::Pointer(_), _) if eval_const_int(init) == Some(0) => Ok(()),
            (Type::Array(elem, n), ExprKind::ArrayLit(items)) => {
                if items.len() > *n {
                    return Err(Self::err(
                        DiagKind::TypeMismatch,
                        span,
                        format!("too many initializers: array holds {}, got {}", n, items.len()),
                    ));
                }
                for it in items {
                    self.check_const_initializer(elem, it, span)?;
                }
                Ok(())
            }
            (Type::Struct(name), ExprKind::ArrayLit(items)) => {
                let layout = self.layouts.get(name).expect("layout exists");
                if items.len() > layout.fields.len() {
                    return Err(Self::err(
                        DiagKind::TypeMismatch,
                        span,
                        format!("too many initializers for struct {}", name),
                    ));
                }
                for it in items {
                    if eval_const_int(it).is_none() && fold::eval_const_float(it).is_none() {
                        return Err(Self::err(
                            DiagKind::TypeMismatch,
                            span,
                            "global initializer is not a constant expression",
                        ));
                    }
                }
                Ok(())
            }
            _ => Err(Self::err(
                DiagKind::TypeMismatch,
                span,
                "unsupported global initializer",
            )),
        }
    }

    fn collect_functions(&mut self, prog: &Program) -> Result<()> {
        for f in &prog.functions {
            self.check_fresh_name(&f.name, f.span)?;
            let ret_type = self.resolve_type(&f.ret_type, f.span)?;
            let mut params = Vec::with_capacity(f.params.len());
            for p in &f.params {
                let ty = self.resolve_type(&p.ty, f.span)?;
                params.push(Param {
                    name: p.name.clone(),
                    ty,
                });
            }
            let id = self.functions.len();
            self.function_index.insert(f.name.clone(), id);
            self.functions.push(FunctionInfo {
                name: f.name.clone(),
                id,
                ret_type,
                params,
                frame_size: 0,
            });
        }
        if !self.function_index.contains_key("main") {
            return Err(Diag::new(
                DiagKind::UndefinedSymbol,
                1,
                1,
                "program has no main function",
            ));
        }
        Ok(())
    }

    // ---------------- function bodies ----------------

    fn push_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }
    fn pop_scope(&mut self) {
        let _ = self.scopes.pop();
    }

    fn insert_local(&mut self, name: &str, ty: Type, is_const: bool, span: Span) -> Result<()> {
        let scope = self.scopes.last_mut().expect("inside a scope");
        if scope.contains_key(name) {
            return Err(Self::err(
                DiagKind::DuplicateDefinition,
                span,
                format!("duplicate definition of {} in this scope", name),
            ));
        }
        scope.insert(name.to_string(), LocalSym { ty, is_const });
        Ok(())
    }

    fn lookup_local(&self, name: &str) -> Option<&LocalSym> {
        self.scopes.iter().rev().find_map(|s| s.get(name))
    }

    fn check_function(&mut self, f: &Function) -> Result<()> {
        let info = self.functions[self.function_index[f.name.as_str()]].clone();
        self.current_ret = info.ret_type.clone();
        self.local_slots = info.params.len();
        self.push_scope();
        for p in &info.params {
            self.insert_local(&p.name, p.ty.clone(), false, f.span)?;
        }
        self.check_block(&f.body)?;
        self.pop_scope();
        let idx = self.function_index[f.name.as_str()];
        self.functions[idx].frame_size = self.local_slots;
        Ok(())
    }

    fn check_block(&mut self, body: &[Stmt]) -> Result<()> {
        self.push_scope();
        for s in body {
            self.check_stmt(s)?;
        }
        self.pop_scope();
        Ok(())
    }

    fn check_cond(&mut self, cond: &Expr) -> Result<()> {
        let t = self.type_expr(cond)?;
        if !is_condition(&t) {
            return Err(Self::err(
                DiagKind::TypeMismatch,
                cond.span,
                format!("condition must be numeric, bool, or pointer, got {:?}", t),
            ));
        }
        Ok(())
    }

    fn check_stmt(&mut self, s: &Stmt) -> Result<()> {
        match &s.kind {
            StmtKind::Block(body) => self.check_block(body),
            StmtKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                self.check_cond(cond)?;
                self.check_block(then_branch)?;
                if let Some(eb) = else_branch {
                    self.check_block(eb)?;
                }
                Ok(())
            }
            StmtKind::While { cond, body } => {
                self.check_cond(cond)?;
                self.loop_depth += 1;
                let r = self.check_block(body);
                self.loop_depth -= 1;
                r
            }
            StmtKind::For {
                init,
                cond,
                post,
                body,
            } => {
                self.push_scope();
                if let Some(i) = init {
                    self.check_stmt(i)?;
                }
                if let Some(c) = cond {
                    self.check_cond(c)?;
                }
                if let Some(p) = post {
                    let _ = self.type_expr(p)?;
                }
                self.loop_depth += 1;
                let r = self.check_block(body);
                self.loop_depth -= 1;
                self.pop_scope();
                r
            }
            StmtKind::Break | StmtKind::Continue => {
                if self.loop_depth == 0 {
                    return Err(Self::err(
                        DiagKind::TypeMismatch,
                        s.span,
                        "break or continue outside of a loop",
                    ));
                }
                Ok(())
            }
            StmtKind::Return(e) => match (e, self.current_ret.clone()) {
                (None, Type::Void) => Ok(()),
                (None, ret) => Err(Self::err(
                    DiagKind::TypeMismatch,
                    s.span,
                    format!("return without value in function returning {:?}", ret),
                )),
                (Some(e), Type::Void) => Err(Self::err(
                    DiagKind::TypeMismatch,
                    e.span,
                    "return with value in void function",
                )),
                (Some(e), ret) => {
                    let t = self.type_expr(e)?;
                    if !self.assignable(&ret, &t) {
                        return Err(Self::err(
                            DiagKind::TypeMismatch,
                            e.span,
                            format!("cannot return {:?} from function returning {:?}", t, ret),
                        ));
                    }
                    Ok(())
                }
            },
            StmtKind::Decl {
                name,
                ty,
                array_size,
                init,
                is_const,
            } => {
                let ty = self.decl_type(ty, array_size, s.span)?;
                if ty == Type::Void {
                    return Err(Self::err(
                        DiagKind::TypeMismatch,
                        s.span,
                        format!("variable {} cannot have void type", name),
                    ));
                }
                if let Some(init) = init {
                    self.check_initializer(&ty, init)?;
                }
                self.insert_local(name, ty, *is_const, s.span)?;
                self.local_slots += 1;
                Ok(())
            }
            StmtKind::ExprStmt(e) => {
                let _ = self.type_expr(e)?;
                Ok(())
            }
        }
    }

    fn check_initializer(&mut self, ty: &Type, init: &Expr) -> Result<()> {
        match (ty, &init.kind) {
            (Type::Array(elem, n), ExprKind::ArrayLit(items)) => {
                if items.len() > *n {
                    return Err(Self::err(
                        DiagKind::TypeMismatch,
                        init.span,
                        format!("too many initializers: array holds {}, got {}", n, items.len()),
                    ));
                }
                for it in items {
                    self.check_initializer(elem, it)?;
                }
                Ok(())
            }
            (Type::Array(_, _), _) => Err(Self::err(
                DiagKind::TypeMismatch,
                init.span,
                "array initializer must be a braced list",
            )),
            (Type::Struct(name), ExprKind::ArrayLit(items)) => {
                let field_count = self
                    .layouts
                    .get(name)
                    .map(|l| l.fields.len())
                    .unwrap_or(0);
                if items.len() > field_count {
                    return Err(Self::err(
                        DiagKind::TypeMismatch,
                        init.span,
                        format!("too many initializers for struct {}", name),
                    ));
                }
                for it in items {
                    let _ = self.type_expr(it)?;
                }
                Ok(())
            }
            (_, ExprKind::ArrayLit(_)) => Err(Self::err(
                DiagKind::TypeMismatch,
                init.span,
                "braced initializer on a scalar",
            )),
            _ => {
                let t = self.type_expr(init)?;
                if !self.assignable(ty, &t) {
                    return Err(Self::err(
                        DiagKind::TypeMismatch,
                        init.span,
                        format!("cannot initialize {:?} from {:?}", ty, t),
                    ));
                }
                Ok(())
            }
        }
    }

    // ---------------- expressions ----------------

    fn type_expr(&mut self, e: &Expr) -> Result<Type> {
        match &e.kind {
            ExprKind::Literal(l) => Ok(match l {
                Literal::Int(_) => Type::Int,
                Literal::Float(_) => Type::Float,
                Literal::Char(_) => Type::Char,
                Literal::Bool(_) => Type::Bool,
                Literal::Str(_) => Type::pointer_to(Type::Char),
            }),
            ExprKind::Ident(name) => self.ident_type(name, e.span),
            ExprKind::Unary { op, expr } => self.unary_type(*op, expr, e.span),
            ExprKind::Binary { op, lhs, rhs } => self.binary_type(*op, lhs, rhs, e.span),
            ExprKind::Assign { target, value } => {
                let t = self.check_assign_target(target)?;
                let v = self.type_expr(value)?;
                if !self.assignable(&t, &v) {
                    return Err(Self::err(
                        DiagKind::TypeMismatch,
                        e.span,
                        format!("cannot assign {:?} to {:?}", v, t),
                    ));
                }
                Ok(t)
            }
            ExprKind::AssignOp { op, target, value } => {
                let t = self.check_assign_target(target)?;
                let v = self.type_expr(value)?;
                match op {
                    BinaryOp::Shl | BinaryOp::Shr => {
                        if !is_int_like(&t) || eval_const_int(value).is_none() {
                            return Err(Self::err(
                                DiagKind::TypeMismatch,
                                e.span,
                                "shift amount must be a constant integer expression",
                            ));
                        }
                    }
                    BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
                        if !is_numeric(&t) || !is_numeric(&v) {
                            return Err(Self::err(
                                DiagKind::TypeMismatch,
                                e.span,
                                format!("invalid compound assignment between {:?} and {:?}", t, v),
                            ));
                        }
                    }
                    _ => {
                        if !is_int_like(&t) || !is_int_like(&v) {
                            return Err(Self::err(
                                DiagKind::TypeMismatch,
                                e.span,
                                format!("invalid compound assignment between {:?} and {:?}", t, v),
                            ));
                        }
                    }
                }
                Ok(t)
            }
            ExprKind::IncDec { target, .. } => {
                let t = self.check_assign_target(target)?;
                if !is_numeric(&t) {
                    return Err(Self::err(
                        DiagKind::TypeMismatch,
                        e.span,
                        format!("++/-- requires a numeric operand, got {:?}", t),
                    ));
                }
                Ok(t)
            }
            ExprKind::Cast { ty, expr } => {
                let from = self.type_expr(expr)?;
                let to = self.resolve_type(ty, e.span)?;
                let ok = (is_numeric(&from) && is_numeric(&to))
                    || (matches!(from, Type::Pointer(_)) && matches!(to, Type::Pointer(_)))
                    || (matches!(from, Type::Pointer(_)) && is_int_like(&to))
                    || (is_int_like(&from) && matches!(to, Type::Pointer(_)))
                    || from == to;
                if !ok {
                    return Err(Self::err(
                        DiagKind::TypeMismatch,
                        e.span,
                        format!("invalid cast from {:?} to {:?}", from, to),
                    ));
                }
                Ok(to)
            }
            ExprKind::SizeofType(ty) => {
                let _ = self.resolve_type(ty, e.span)?;
                Ok(Type::Int)
            }
            ExprKind::SizeofExpr(inner) => {
                // `sizeof(Name)` where Name is a record reads as a type.
                if let ExprKind::Ident(n) = &inner.kind {
                    if self.lookup_local(n).is_none()
                        && !self.global_index.contains_key(n)
                        && self.layouts.contains(n)
                    {
                        return Ok(Type::Int);
                    }
                }
                let _ = self.type_expr(inner)?;
                Ok(Type::Int)
            }
            ExprKind::Call { callee, args } => self.call_type(callee, args, e.span),
            ExprKind::Index { base, index } => {
                let bt = self.type_expr(base)?;
                let it = self.type_expr(index)?;
                if !is_int_like(&it) {
                    return Err(Self::err(
                        DiagKind::TypeMismatch,
                        index.span,
                        format!("array index must be an integer, got {:?}", it),
                    ));
                }
                match bt {
                    Type::Array(elem, _) | Type::Pointer(elem) => Ok(*elem),
                    other => Err(Self::err(
                        DiagKind::TypeMismatch,
                        base.span,
                        format!("cannot index into {:?}", other),
                    )),
                }
            }
            ExprKind::Member { base, field, arrow } => self.member_type(base, field, *arrow, e.span),
            ExprKind::ArrayLit(_) => Err(Self::err(
                DiagKind::TypeMismatch,
                e.span,
                "array literal is only allowed as an initializer",
            )),
            ExprKind::Send { queue, value } => {
                let qt = self.type_expr(queue)?;
                let elem = match qt {
                    Type::Message(elem) => *elem,
                    other => {
                        return Err(Self::err(
                            DiagKind::TypeMismatch,
                            queue.span,
                            format!("send on non-channel type {:?}", other),
                        ));
                    }
                };
                let vt = self.type_expr(value)?;
                if !self.assignable(&elem, &vt) {
                    return Err(Self::err(
                        DiagKind::TypeMismatch,
                        value.span,
                        format!("cannot send {:?} on channel of {:?}", vt, elem),
                    ));
                }
                Ok(Type::Void)
            }
            ExprKind::Recv { queue, timeout } => {
                let qt = self.type_expr(queue)?;
                let elem = match qt {
                    Type::Message(elem) => *elem,
                    other => {
                        return Err(Self::err(
                            DiagKind::TypeMismatch,
                            queue.span,
                            format!("recv on non-channel type {:?}", other),
                        ));
                    }
                };
                if let Some(t) = timeout {
                    let tt = self.type_expr(t)?;
                    if !is_int_like(&tt) {
                        return Err(Self::err(
                            DiagKind::TypeMismatch,
                            t.span,
                            format!("recv timeout must be an integer, got {:?}", tt),
                        ));
                    }
                }
                Ok(elem)
            }
        }
    }

    fn ident_type(&self, name: &str, span: Span) -> Result<Type> {
        if let Some(sym) = self.lookup_local(name) {
            return Ok(sym.ty.clone());
        }
        if let Some(&idx) = self.global_index.get(name) {
            return Ok(self.globals[idx].ty.clone());
        }
        if let Some(&idx) = self.message_index.get(name) {
            return Ok(Type::Message(Box::new(self.messages[idx].elem.clone())));
        }
        if self.function_index.contains_key(name) {
            return Err(Self::err(
                DiagKind::TypeMismatch,
                span,
                format!("function {} used as a value", name),
            ));
        }
        Err(Self::err(
            DiagKind::UndefinedSymbol,
            span,
            format!("use of undefined symbol: {}", name),
        ))
    }

    fn unary_type(&mut self, op: UnaryOp, expr: &Expr, span: Span) -> Result<Type> {
        match op {
            UnaryOp::Plus | UnaryOp::Minus => {
                let t = self.type_expr(expr)?;
                if !is_numeric(&t) {
                    return Err(Self::err(
                        DiagKind::TypeMismatch,
                        span,
                        format!("unary +/- requires a numeric operand, got {:?}", t),
                    ));
                }
                Ok(if t == Type::Float { Type::Float } else { Type::Int })
            }
            UnaryOp::BitNot => {
                let t = self.type_expr(expr)?;
                if !is_int_like(&t) {
                    return Err(Self::err(
                        DiagKind::TypeMismatch,
                        span,
                        format!("~ requires an integer operand, got {:?}", t),
                    ));
                }
                Ok(Type::Int)
            }
            UnaryOp::LogicalNot => {
                let t = self.type_expr(expr)?;
                if !is_condition(&t) {
                    return Err(Self::err(
                        DiagKind::TypeMismatch,
                        span,
                        format!("! requires a numeric, bool, or pointer operand, got {:?}", t),
                    ));
                }
                Ok(Type::Bool)
            }
            UnaryOp::AddrOf => {
                let t = self.check_place(expr)?;
                Ok(Type::pointer_to(t))
            }
            UnaryOp::Deref => {
                let t = self.type_expr(expr)?;
                match t {
                    Type::Pointer(inner) => Ok(*inner),
                    other => Err(Self::err(
                        DiagKind::TypeMismatch,
                        span,
                        format!("cannot dereference {:?}", other),
                    )),
                }
            }
        }
    }

    fn binary_type(&mut self, op: BinaryOp, lhs: &Expr, rhs: &Expr, span: Span) -> Result<Type> {
        use BinaryOp::*;
        let lt = self.type_expr(lhs)?;
        let rt = self.type_expr(rhs)?;
        match op {
            Add | Sub | Mul | Div | Mod => {
                if !is_numeric(&lt) || !is_numeric(&rt) {
                    return Err(Self::err(
                        DiagKind::TypeMismatch,
                        span,
                        format!("invalid arithmetic between {:?} and {:?}", lt, rt),
                    ));
                }
                if op == Mod && (lt == Type::Float || rt == Type::Float) {
                    return Err(Self::err(
                        DiagKind::TypeMismatch,
                        span,
                        "% requires integer operands",
                    ));
                }
                if lt == Type::Float || rt == Type::Float {
                    Ok(Type::Float)
                } else {
                    Ok(Type::Int)
                }
            }
            Shl | Shr => {
                if !is_int_like(&lt) || !is_int_like(&rt) {
                    return Err(Self::err(
                        DiagKind::TypeMismatch,
                        span,
                        format!("invalid shift between {:?} and {:?}", lt, rt),
                    ));
                }
                // The VM has no shift opcodes: shift-by-constant lowers to a
                // power-of-two multiply or divide.
                if eval_const_int(rhs).is_none() {
                    return Err(Self::err(
                        DiagKind::TypeMismatch,
                        rhs.span,
                        "shift amount must be a constant integer expression",
                    ));
                }
                Ok(Type::Int)
            }
            BitAnd | BitOr | BitXor => {
                if !is_int_like(&lt) || !is_int_like(&rt) {
                    return Err(Self::err(
                        DiagKind::TypeMismatch,
                        span,
                        format!("invalid bitwise operation between {:?} and {:?}", lt, rt),
                    ));
                }
                Ok(Type::Int)
            }
            LAnd | LOr => {
                if !is_condition(&lt) || !is_condition(&rt) {
                    return Err(Self::err(
                        DiagKind::TypeMismatch,
                        span,
                        format!("invalid logical operation between {:?} and {:?}", lt, rt),
                    ));
                }
                Ok(Type::Bool)
            }
            Lt | Le | Gt | Ge => {
                let ok = (is_numeric(&lt) && is_numeric(&rt))
                    || (matches!(lt, Type::Pointer(_)) && matches!(rt, Type::Pointer(_)));
                if !ok {
                    return Err(Self::err(
                        DiagKind::TypeMismatch,
                        span,
                        format!("invalid comparison between {:?} and {:?}", lt, rt),
                    ));
                }
                Ok(Type::Bool)
            }
            Eq | Ne => {
                let ok = (is_numeric(&lt) && is_numeric(&rt))
                    || (matches!(lt, Type::Pointer(_)) && matches!(rt, Type::Pointer(_)));
                if !ok {
                    return Err(Self::err(
                        DiagKind::TypeMismatch,
                        span,
                        format!("invalid equality between {:?} and {:?}", lt, rt),
                    ));
                }
                Ok(Type::Bool)
            }
        }
    }

    /// An addressable place: variable, deref, element, or member.
    fn check_place(&mut self, e: &Expr) -> Result<Type> {
        match &e.kind {
            ExprKind::Ident(name) => match self.ident_type(name, e.span)? {
                Type::Message(_) => Err(Self::err(
                    DiagKind::NonLValueAssignment,
                    e.span,
                    "message channel is not an addressable value",
                )),
                t => Ok(t),
            },
            ExprKind::Unary {
                op: UnaryOp::Deref,
                expr,
            } => {
                let t = self.type_expr(expr)?;
                match t {
                    Type::Pointer(inner) => Ok(*inner),
                    other => Err(Self::err(
                        DiagKind::TypeMismatch,
                        e.span,
                        format!("cannot dereference {:?}", other),
                    )),
                }
            }
            ExprKind::Index { .. } | ExprKind::Member { .. } => self.type_expr(e),
            _ => Err(Self::err(
                DiagKind::NonLValueAssignment,
                e.span,
                "expression is not addressable",
            )),
        }
    }

    /// A place that may be written through: rejects const symbols.
    fn check_assign_target(&mut self, target: &Expr) -> Result<Type> {
        if let ExprKind::Ident(name) = &target.kind {
            let is_const = self
                .lookup_local(name)
                .map(|s| s.is_const)
                .or_else(|| self.global_index.get(name).map(|&i| self.globals[i].is_const));
            if is_const == Some(true) {
                return Err(Self::err(
                    DiagKind::ConstAssignment,
                    target.span,
                    format!("cannot assign to const {}", name),
                ));
            }
        }
        self.check_place(target).map_err(|d| {
            if d.kind == DiagKind::NonLValueAssignment {
                Diag::new(
                    DiagKind::NonLValueAssignment,
                    target.span.line,
                    target.span.col,
                    "left-hand side of assignment is not an lvalue",
                )
            } else {
                d
            }
        })
    }

    fn member_type(&mut self, base: &Expr, field: &str, arrow: bool, span: Span) -> Result<Type> {
        let bt = self.type_expr(base)?;
        let record = match (arrow, bt) {
            (false, Type::Struct(n)) | (false, Type::Union(n)) => n,
            (true, Type::Pointer(inner)) => match *inner {
                Type::Struct(n) | Type::Union(n) => n,
                other => {
                    return Err(Self::err(
                        DiagKind::TypeMismatch,
                        span,
                        format!("-> applied to pointer to {:?}", other),
                    ));
                }
            },
            (false, other) => {
                return Err(Self::err(
                    DiagKind::TypeMismatch,
                    span,
                    format!(". applied to non-struct value of type {:?}", other),
                ));
            }
            (true, other) => {
                return Err(Self::err(
                    DiagKind::TypeMismatch,
                    span,
                    format!("-> applied to non-pointer value of type {:?}", other),
                ));
            }
        };
        match self.layouts.resolve_field(&record, field) {
            Some(fd) => Ok(fd.ty),
            None => Err(Self::err(
                DiagKind::FieldNotFound,
                span,
                format!("no field {} in {}", field, record),
            )),
        }
    }

    fn call_type(&mut self, callee: &str, args: &[Expr], span: Span) -> Result<Type> {
        if callee == "StartTask" {
            return self.start_task_type(args, span);
        }
        if callee == "DBG_PRINT" {
            if args.len() != 1 {
                return Err(Self::err(
                    DiagKind::ArityMismatch,
                    span,
                    format!("DBG_PRINT takes 1 argument, got {}", args.len()),
                ));
            }
            if !matches!(args[0].kind, ExprKind::Literal(Literal::Str(_))) {
                return Err(Self::err(
                    DiagKind::TypeMismatch,
                    args[0].span,
                    "DBG_PRINT requires a string literal",
                ));
            }
            return Ok(Type::Void);
        }
        if callee == "DBG_PRINTF" {
            if args.is_empty() {
                return Err(Self::err(
                    DiagKind::ArityMismatch,
                    span,
                    "DBG_PRINTF requires a format string",
                ));
            }
            if !matches!(args[0].kind, ExprKind::Literal(Literal::Str(_))) {
                return Err(Self::err(
                    DiagKind::TypeMismatch,
                    args[0].span,
                    "DBG_PRINTF requires a string literal format",
                ));
            }
            for a in &args[1..] {
                let t = self.type_expr(a)?;
                if !is_condition(&t) {
                    return Err(Self::err(
                        DiagKind::TypeMismatch,
                        a.span,
                        format!("cannot format value of type {:?}", t),
                    ));
                }
            }
            return Ok(Type::Void);
        }
        if let Some((argc, ret)) = builtin_signature(callee) {
            if args.len() != argc {
                return Err(Self::err(
                    DiagKind::ArityMismatch,
                    span,
                    format!("{} takes {} arguments, got {}", callee, argc, args.len()),
                ));
            }
            for a in args {
                let t = self.type_expr(a)?;
                if !is_condition(&t) {
                    return Err(Self::err(
                        DiagKind::TypeMismatch,
                        a.span,
                        format!("invalid intrinsic argument of type {:?}", t),
                    ));
                }
            }
            return Ok(ret);
        }
        let idx = match self.function_index.get(callee) {
            Some(&idx) => idx,
            None => {
                return Err(Self::err(
                    DiagKind::UndefinedSymbol,
                    span,
                    format!("call to undefined function: {}", callee),
                ));
            }
        };
        let info = self.functions[idx].clone();
        if args.len() != info.params.len() {
            return Err(Self::err(
                DiagKind::ArityMismatch,
                span,
                format!(
                    "{} takes {} arguments, got {}",
                    callee,
                    info.params.len(),
                    args.len()
                ),
            ));
        }
        for (a, p) in args.iter().zip(&info.params) {
            let t = self.type_expr(a)?;
            if !self.assignable(&p.ty, &t) {
                return Err(Self::err(
                    DiagKind::TypeMismatch,
                    a.span,
                    format!(
                        "argument {} of {}: expected {:?}, got {:?}",
                        p.name, callee, p.ty, t
                    ),
                ));
            }
        }
        Ok(info.ret_type)
    }

    /// `StartTask(stack_size, core, priority, task_id, fn)`: the first four
    /// arguments must be integer constants, the last a function name.
    fn start_task_type(&mut self, args: &[Expr], span: Span) -> Result<Type> {
        if args.len() != 5 {
            return Err(Self::err(
                DiagKind::ArityMismatch,
                span,
                format!("StartTask takes 5 arguments, got {}", args.len()),
            ));
        }
        for (i, a) in args[..4].iter().enumerate() {
            if eval_const_int(a).is_none() {
                return Err(Self::err(
                    DiagKind::TypeMismatch,
                    a.span,
                    format!("StartTask argument {} must be an integer constant", i + 1),
                ));
            }
        }
        match &args[4].kind {
            ExprKind::Ident(n) if self.function_index.contains_key(n) => Ok(Type::Void),
            ExprKind::Ident(n) => Err(Self::err(
                DiagKind::UndefinedSymbol,
                args[4].span,
                format!("StartTask target {} is not a function", n),
            )),
            _ => Err(Self::err(
                DiagKind::TypeMismatch,
                args[4].span,
                "StartTask target must be a function name",
            )),
        }
    }
}
