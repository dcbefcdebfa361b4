//! Bytecode generation: a single AST walk that emits stack-machine
//! instructions into an instruction buffer, interning constants and strings
//! as it goes and back-patching forward branches.
//!
//! Address model (shared with the VM): globals occupy slot addresses from 0
//! in declaration order; frame slots live at `LOCAL_BASE + slot`. A slot
//! holds a scalar value, a pointer, or the base address of an aggregate
//! allocated by `ALLOC_ARRAY` / `ALLOC_STRUCT`.

pub mod opcode;

pub use opcode::{disassemble, BytecodeProgram, Constant, Instruction, Mode, Opcode};

use diag::{Diag, DiagKind, Result};
use parse::ast::{
    self, BinaryOp, Expr, ExprKind, FieldDecl, Literal, RecordKind, Span, Stmt, StmtKind, Type,
    UnaryOp,
};
use sema::fold::{const_truth, eval_const_float, eval_const_int};
use sema::{builtin_signature, sizeof_type, Analysis, FieldDescriptor};
use std::collections::HashMap;

/// Frame-slot addresses are biased into their own region of the VM address
/// space; the VM applies the call-depth separation at runtime.
pub const LOCAL_BASE: i64 = 20000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ConstKey {
    I32(i32),
    U32(u32),
    F32(u32),
    Ptr(u32),
}

fn const_key(c: Constant) -> ConstKey {
    match c {
        Constant::I32(v) => ConstKey::I32(v),
        Constant::U32(v) => ConstKey::U32(v),
        Constant::F32(v) => ConstKey::F32(v.to_bits()),
        Constant::Ptr(v) => ConstKey::Ptr(v),
    }
}

#[derive(Clone)]
struct LocalVar {
    slot: usize,
    ty: Type,
}

struct LoopCtx {
    break_patches: Vec<usize>,
    continue_patches: Vec<usize>,
    continue_addr: Option<i64>,
}

/// A resolved `.`/`->` access: the field descriptor relative to its record,
/// plus the variable slot and cumulative offset when the base is static.
struct MemberAccess {
    fd: FieldDescriptor,
    static_base: Option<(i64, usize)>,
}

pub fn generate(prog: &ast::Program, analysis: &Analysis, mode: Mode) -> Result<BytecodeProgram> {
    let mut g = Generator::new(analysis, mode);
    g.collect_defaults(prog);
    g.emit_prelude(prog)?;
    for f in &prog.functions {
        g.emit_function(f)?;
    }
    g.apply_fn_addr_patches()?;
    Ok(g.finish())
}

struct Generator<'a> {
    analysis: &'a Analysis,
    mode: Mode,
    code: Vec<Instruction>,
    constants: Vec<Constant>,
    const_index: HashMap<ConstKey, usize>,
    strings: Vec<String>,
    string_index: HashMap<String, usize>,
    functions: Vec<(String, u32)>,
    symbols: Vec<(String, u32)>,
    function_index: HashMap<String, usize>,
    global_index: HashMap<String, usize>,
    message_index: HashMap<String, usize>,
    /// record name -> flattened (field, default value) pairs.
    defaults: HashMap<String, Vec<(String, Expr)>>,
    /// (instruction, operand slot, function id) resolved to entry addresses
    /// once every function has been emitted.
    fn_addr_patches: Vec<(usize, usize, usize)>,
    // per-function state
    scopes: Vec<HashMap<String, LocalVar>>,
    next_slot: usize,
    scratch_slot: Option<usize>,
    loops: Vec<LoopCtx>,
    cur: Span,
}

impl<'a> Generator<'a> {
    fn new(analysis: &'a Analysis, mode: Mode) -> Self {
        let function_index = analysis
            .functions
            .iter()
            .map(|f| (f.name.clone(), f.id))
            .collect();
        let global_index = analysis
            .globals
            .iter()
            .enumerate()
            .map(|(i, g)| (g.name.clone(), i))
            .collect();
        let message_index = analysis
            .messages
            .iter()
            .map(|m| (m.name.clone(), m.id))
            .collect();
        let functions = analysis
            .functions
            .iter()
            .map(|f| (f.name.clone(), 0u32))
            .collect();
        Self {
            analysis,
            mode,
            code: Vec::new(),
            constants: Vec::new(),
            const_index: HashMap::new(),
            strings: Vec::new(),
            string_index: HashMap::new(),
            functions,
            symbols: Vec::new(),
            function_index,
            global_index,
            message_index,
            defaults: HashMap::new(),
            fn_addr_patches: Vec::new(),
            scopes: Vec::new(),
            next_slot: 0,
            scratch_slot: None,
            loops: Vec::new(),
            cur: Span::new(1, 1),
        }
    }

    fn err(&self, kind: DiagKind, msg: impl Into<String>) -> Diag {
        Diag::new(kind, self.cur.line, self.cur.col, msg)
    }

    // ---------------- emission primitives ----------------

    fn emit(&mut self, opcode: Opcode, operands: Vec<i64>) -> usize {
        let mut ins = Instruction::new(opcode, operands);
        if self.mode == Mode::Debug {
            ins.line = self.cur.line;
            ins.col = self.cur.col;
        }
        self.code.push(ins);
        self.code.len() - 1
    }

    fn pc(&self) -> i64 {
        self.code.len() as i64
    }

    fn patch_jump(&mut self, idx: usize, target: i64) -> Result<()> {
        if target < 0 || target > u32::MAX as i64 {
            return Err(self.err(
                DiagKind::CodegenBranchTooFar,
                format!("branch target {} out of range", target),
            ));
        }
        self.code[idx].operands[0] = target;
        Ok(())
    }

    fn add_const(&mut self, c: Constant) -> i64 {
        let key = const_key(c);
        if let Some(&i) = self.const_index.get(&key) {
            return i as i64;
        }
        self.constants.push(c);
        let i = self.constants.len() - 1;
        self.const_index.insert(key, i);
        i as i64
    }

    fn add_string(&mut self, s: &str) -> i64 {
        if let Some(&i) = self.string_index.get(s) {
            return i as i64;
        }
        self.strings.push(s.to_string());
        let i = self.strings.len() - 1;
        self.string_index.insert(s.to_string(), i);
        i as i64
    }

    fn emit_load_int(&mut self, v: i64) {
        let id = self.add_const(Constant::I32(v as i32));
        self.emit(Opcode::LoadConst, vec![id]);
    }

    // ---------------- scopes and variables ----------------

    fn push_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }
    fn pop_scope(&mut self) {
        let _ = self.scopes.pop();
    }

    fn declare_local(&mut self, name: &str, ty: Type) -> i64 {
        let slot = self.next_slot;
        self.next_slot += 1;
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), LocalVar { slot, ty });
        }
        LOCAL_BASE + slot as i64
    }

    fn scratch_addr(&mut self) -> i64 {
        let slot = match self.scratch_slot {
            Some(s) => s,
            None => {
                let s = self.next_slot;
                self.next_slot += 1;
                self.scratch_slot = Some(s);
                s
            }
        };
        LOCAL_BASE + slot as i64
    }

    fn lookup_var(&self, name: &str) -> Option<(i64, Type)> {
        for scope in self.scopes.iter().rev() {
            if let Some(v) = scope.get(name) {
                return Some((LOCAL_BASE + v.slot as i64, v.ty.clone()));
            }
        }
        let &idx = self.global_index.get(name)?;
        let g = &self.analysis.globals[idx];
        Some((g.address, g.ty.clone()))
    }

    // ---------------- types ----------------

    fn resolve_ast_type(&self, ty: &Type) -> Result<Type> {
        Ok(match ty {
            Type::Named(n) => match self.analysis.layouts.get(n).map(|l| l.kind) {
                Some(RecordKind::Struct) => Type::Struct(n.clone()),
                Some(RecordKind::Union) => Type::Union(n.clone()),
                None => {
                    return Err(self.err(
                        DiagKind::UndefinedSymbol,
                        format!("unknown type name: {}", n),
                    ));
                }
            },
            Type::Pointer(inner) => Type::Pointer(Box::new(self.resolve_ast_type(inner)?)),
            Type::Array(inner, n) => Type::Array(Box::new(self.resolve_ast_type(inner)?), *n),
            other => other.clone(),
        })
    }

    fn size_of(&self, ty: &Type) -> i64 {
        sizeof_type(ty, &self.analysis.layouts) as i64
    }

    fn record_name_of(&self, ty: &Type, arrow: bool) -> Result<String> {
        let t = if arrow {
            match ty {
                Type::Pointer(inner) => inner.as_ref(),
                other => {
                    return Err(self.err(
                        DiagKind::TypeMismatch,
                        format!("-> applied to non-pointer {:?}", other),
                    ));
                }
            }
        } else {
            ty
        };
        match t {
            Type::Struct(n) | Type::Union(n) => Ok(n.clone()),
            other => Err(self.err(
                DiagKind::TypeMismatch,
                format!("member access on non-record {:?}", other),
            )),
        }
    }

    fn type_of(&self, e: &Expr) -> Result<Type> {
        Ok(match &e.kind {
            ExprKind::Literal(l) => match l {
                Literal::Int(_) => Type::Int,
                Literal::Float(_) => Type::Float,
                Literal::Char(_) => Type::Char,
                Literal::Bool(_) => Type::Bool,
                Literal::Str(_) => Type::pointer_to(Type::Char),
            },
            ExprKind::Ident(n) => {
                if let Some((_, ty)) = self.lookup_var(n) {
                    ty
                } else if let Some(&idx) = self.message_index.get(n) {
                    Type::Message(Box::new(self.analysis.messages[idx].elem.clone()))
                } else {
                    return Err(self.err(
                        DiagKind::UndefinedSymbol,
                        format!("use of undefined symbol: {}", n),
                    ));
                }
            }
            ExprKind::Unary { op, expr } => match op {
                UnaryOp::Plus | UnaryOp::Minus => {
                    if self.type_of(expr)? == Type::Float {
                        Type::Float
                    } else {
                        Type::Int
                    }
                }
                UnaryOp::BitNot => Type::Int,
                UnaryOp::LogicalNot => Type::Bool,
                UnaryOp::AddrOf => Type::pointer_to(self.type_of(expr)?),
                UnaryOp::Deref => match self.type_of(expr)? {
                    Type::Pointer(inner) => *inner,
                    other => {
                        return Err(self.err(
                            DiagKind::TypeMismatch,
                            format!("cannot dereference {:?}", other),
                        ));
                    }
                },
            },
            ExprKind::Binary { op, lhs, rhs } => match op {
                BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
                    if self.type_of(lhs)? == Type::Float || self.type_of(rhs)? == Type::Float {
                        Type::Float
                    } else {
                        Type::Int
                    }
                }
                BinaryOp::Mod
                | BinaryOp::Shl
                | BinaryOp::Shr
                | BinaryOp::BitAnd
                | BinaryOp::BitOr
                | BinaryOp::BitXor => Type::Int,
                _ => Type::Bool,
            },
            ExprKind::Assign { target, .. }
            | ExprKind::AssignOp { target, .. }
            | ExprKind::IncDec { target, .. } => self.type_of(target)?,
            ExprKind::Cast { ty, .. } => self.resolve_ast_type(ty)?,
            ExprKind::SizeofType(_) | ExprKind::SizeofExpr(_) => Type::Int,
            ExprKind::Call { callee, args: _ } => {
                if callee == "StartTask" || callee == "DBG_PRINT" || callee == "DBG_PRINTF" {
                    Type::Void
                } else if let Some((_, ret)) = builtin_signature(callee) {
                    ret
                } else if let Some(&id) = self.function_index.get(callee.as_str()) {
                    self.analysis.functions[id].ret_type.clone()
                } else {
                    return Err(self.err(
                        DiagKind::UndefinedSymbol,
                        format!("call to undefined function: {}", callee),
                    ));
                }
            }
            ExprKind::Index { base, .. } => match self.type_of(base)? {
                Type::Array(elem, _) | Type::Pointer(elem) => *elem,
                other => {
                    return Err(self.err(
                        DiagKind::TypeMismatch,
                        format!("cannot index into {:?}", other),
                    ));
                }
            },
            ExprKind::Member { base, field, arrow } => {
                let record = self.record_name_of(&self.type_of(base)?, *arrow)?;
                self.analysis
                    .layouts
                    .resolve_field(&record, field)
                    .map(|fd| fd.ty)
                    .ok_or_else(|| {
                        self.err(
                            DiagKind::FieldNotFound,
                            format!("no field {} in {}", field, record),
                        )
                    })?
            }
            ExprKind::ArrayLit(_) => {
                return Err(self.err(
                    DiagKind::TypeMismatch,
                    "array literal is only allowed as an initializer",
                ));
            }
            ExprKind::Send { .. } => Type::Void,
            ExprKind::Recv { queue, .. } => match self.type_of(queue)? {
                Type::Message(elem) => *elem,
                other => {
                    return Err(self.err(
                        DiagKind::TypeMismatch,
                        format!("recv on non-channel {:?}", other),
                    ));
                }
            },
        })
    }

    // ---------------- member and place resolution ----------------

    fn resolve_member(&self, base: &Expr, field: &str, arrow: bool) -> Result<MemberAccess> {
        let record = self.record_name_of(&self.type_of(base)?, arrow)?;
        let fd = self
            .analysis
            .layouts
            .resolve_field(&record, field)
            .ok_or_else(|| {
                self.err(
                    DiagKind::FieldNotFound,
                    format!("no field {} in {}", field, record),
                )
            })?;
        Ok(MemberAccess {
            static_base: self.static_struct_base(base, arrow),
            fd,
        })
    }

    /// When the record a member access touches bottoms out at a variable
    /// slot, return `(slot address, cumulative offset of the record)` so the
    /// access can be a single struct-member instruction.
    fn static_struct_base(&self, base: &Expr, arrow: bool) -> Option<(i64, usize)> {
        if arrow {
            if let ExprKind::Ident(n) = &base.kind {
                let (addr, _) = self.lookup_var(n)?;
                return Some((addr, 0));
            }
            return None;
        }
        match &base.kind {
            ExprKind::Ident(n) => {
                let (addr, _) = self.lookup_var(n)?;
                Some((addr, 0))
            }
            ExprKind::Unary {
                op: UnaryOp::Deref,
                expr,
            } => {
                if let ExprKind::Ident(n) = &expr.kind {
                    let (addr, _) = self.lookup_var(n)?;
                    Some((addr, 0))
                } else {
                    None
                }
            }
            ExprKind::Member {
                base: inner,
                field,
                arrow: inner_arrow,
            } => {
                let ma = self.resolve_member(inner, field, *inner_arrow).ok()?;
                if ma.fd.is_bit_field() {
                    return None;
                }
                match ma.fd.ty {
                    Type::Struct(_) | Type::Union(_) => {
                        let (addr, bias) = ma.static_base?;
                        Some((addr, bias + ma.fd.byte_offset))
                    }
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// Push the base address of the record a member access goes through.
    fn emit_record_base_address(&mut self, base: &Expr, arrow: bool) -> Result<()> {
        if arrow {
            let _ = self.emit_expr(base)?;
            Ok(())
        } else {
            self.emit_place_address(base)
        }
    }

    /// Push the address of the storage behind an lvalue expression. For
    /// aggregates this is the aggregate's base address; for scalars the
    /// address of the variable slot itself.
    fn emit_place_address(&mut self, e: &Expr) -> Result<()> {
        match &e.kind {
            ExprKind::Ident(n) => {
                let (addr, ty) = self.lookup_var(n).ok_or_else(|| {
                    self.err(
                        DiagKind::UndefinedSymbol,
                        format!("use of undefined symbol: {}", n),
                    )
                })?;
                match ty {
                    Type::Struct(_) | Type::Union(_) | Type::Array(_, _) => {
                        self.emit(Opcode::LoadVar, vec![addr]);
                    }
                    _ => {
                        self.emit(Opcode::LoadAddr, vec![addr]);
                    }
                }
                Ok(())
            }
            ExprKind::Unary {
                op: UnaryOp::Deref,
                expr,
            } => {
                let _ = self.emit_expr(expr)?;
                Ok(())
            }
            ExprKind::Index { base, index } => {
                let _ = self.emit_array_elem_address(base, index)?;
                Ok(())
            }
            ExprKind::Member { base, field, arrow } => {
                let ma = self.resolve_member(base, field, *arrow)?;
                if ma.fd.is_bit_field() {
                    return Err(self.err(
                        DiagKind::TypeMismatch,
                        format!("cannot take the address of bit-field {}", field),
                    ));
                }
                match ma.static_base {
                    Some((addr, bias)) => {
                        self.emit(Opcode::LoadVar, vec![addr]);
                        let off = (bias + ma.fd.byte_offset) as i64;
                        if off != 0 {
                            self.emit_load_int(off);
                            self.emit(Opcode::Add, vec![]);
                        }
                    }
                    None => {
                        self.emit_record_base_address(base, *arrow)?;
                        if ma.fd.byte_offset != 0 {
                            self.emit_load_int(ma.fd.byte_offset as i64);
                            self.emit(Opcode::Add, vec![]);
                        }
                    }
                }
                Ok(())
            }
            _ => Err(self.err(
                DiagKind::NonLValueAssignment,
                "expression is not addressable",
            )),
        }
    }

    /// Push the address of `base[index]`.
    fn emit_array_elem_address(&mut self, base: &Expr, index: &Expr) -> Result<Type> {
        let bt = self.type_of(base)?;
        let elem = match bt {
            Type::Array(elem, _) => {
                self.emit_place_address(base)?;
                *elem
            }
            Type::Pointer(elem) => {
                let _ = self.emit_expr(base)?;
                *elem
            }
            other => {
                return Err(self.err(
                    DiagKind::TypeMismatch,
                    format!("cannot index into {:?}", other),
                ));
            }
        };
        let _ = self.emit_expr(index)?;
        let es = self.size_of(&elem);
        if es != 1 {
            self.emit_load_int(es);
            self.emit(Opcode::Mul, vec![]);
        }
        self.emit(Opcode::Add, vec![]);
        Ok(elem)
    }

    /// Is `base` an array variable usable with the array-element opcodes?
    fn array_var_base(&self, base: &Expr) -> Option<(i64, i64)> {
        if let ExprKind::Ident(n) = &base.kind {
            if let Some((addr, Type::Array(elem, _))) = self.lookup_var(n) {
                return Some((addr, self.size_of(&elem)));
            }
        }
        None
    }

    /// Push the value of an lvalue expression.
    fn emit_load_place(&mut self, e: &Expr) -> Result<Type> {
        match &e.kind {
            ExprKind::Ident(n) => {
                let (addr, ty) = self.lookup_var(n).ok_or_else(|| {
                    self.err(
                        DiagKind::UndefinedSymbol,
                        format!("use of undefined symbol: {}", n),
                    )
                })?;
                self.emit(Opcode::LoadVar, vec![addr]);
                Ok(ty)
            }
            ExprKind::Unary {
                op: UnaryOp::Deref,
                expr,
            } => {
                let pt = self.emit_expr(expr)?;
                self.emit(Opcode::LoadDeref, vec![]);
                match pt {
                    Type::Pointer(inner) => Ok(*inner),
                    other => Err(self.err(
                        DiagKind::TypeMismatch,
                        format!("cannot dereference {:?}", other),
                    )),
                }
            }
            ExprKind::Index { base, index } => {
                if let Some((addr, es)) = self.array_var_base(base) {
                    let _ = self.emit_expr(index)?;
                    self.emit(Opcode::LoadArrayElem, vec![addr, es]);
                    return self.type_of(e);
                }
                let elem = self.emit_array_elem_address(base, index)?;
                self.emit(Opcode::LoadDeref, vec![]);
                Ok(elem)
            }
            ExprKind::Member { base, field, arrow } => {
                let ma = self.resolve_member(base, field, *arrow)?;
                match ma.static_base {
                    Some((addr, bias)) => {
                        let off = (bias + ma.fd.byte_offset) as i64;
                        if ma.fd.is_bit_field() {
                            self.emit(
                                Opcode::LoadStructMemberBit,
                                vec![addr, off, ma.fd.bit_offset as i64, ma.fd.bit_width as i64],
                            );
                        } else {
                            self.emit(Opcode::LoadStructMember, vec![addr, off]);
                        }
                    }
                    None => {
                        if ma.fd.is_bit_field() {
                            return Err(self.err(
                                DiagKind::TypeMismatch,
                                format!("bit-field {} requires a named base", field),
                            ));
                        }
                        self.emit_record_base_address(base, *arrow)?;
                        if ma.fd.byte_offset != 0 {
                            self.emit_load_int(ma.fd.byte_offset as i64);
                            self.emit(Opcode::Add, vec![]);
                        }
                        self.emit(Opcode::LoadDeref, vec![]);
                    }
                }
                Ok(ma.fd.ty)
            }
            _ => Err(self.err(DiagKind::NonLValueAssignment, "expression has no storage")),
        }
    }

    /// Store the value on top of the stack into an lvalue expression.
    fn emit_store_place(&mut self, e: &Expr) -> Result<()> {
        match &e.kind {
            ExprKind::Ident(n) => {
                let (addr, _) = self.lookup_var(n).ok_or_else(|| {
                    self.err(
                        DiagKind::UndefinedSymbol,
                        format!("use of undefined symbol: {}", n),
                    )
                })?;
                self.emit(Opcode::StoreVar, vec![addr]);
                Ok(())
            }
            ExprKind::Unary {
                op: UnaryOp::Deref,
                expr,
            } => {
                let _ = self.emit_expr(expr)?;
                self.emit(Opcode::StoreDeref, vec![]);
                Ok(())
            }
            ExprKind::Index { base, index } => {
                if let Some((addr, es)) = self.array_var_base(base) {
                    let _ = self.emit_expr(index)?;
                    self.emit(Opcode::StoreArrayElem, vec![addr, es]);
                    return Ok(());
                }
                let _ = self.emit_array_elem_address(base, index)?;
                self.emit(Opcode::StoreDeref, vec![]);
                Ok(())
            }
            ExprKind::Member { base, field, arrow } => {
                let ma = self.resolve_member(base, field, *arrow)?;
                match ma.static_base {
                    Some((addr, bias)) => {
                        let off = (bias + ma.fd.byte_offset) as i64;
                        if ma.fd.is_bit_field() {
                            self.emit(
                                Opcode::StoreStructMemberBit,
                                vec![addr, off, ma.fd.bit_offset as i64, ma.fd.bit_width as i64],
                            );
                        } else {
                            self.emit(Opcode::StoreStructMember, vec![addr, off]);
                        }
                        Ok(())
                    }
                    None => {
                        if ma.fd.is_bit_field() {
                            return Err(self.err(
                                DiagKind::TypeMismatch,
                                format!("bit-field {} requires a named base", field),
                            ));
                        }
                        self.emit_record_base_address(base, *arrow)?;
                        if ma.fd.byte_offset != 0 {
                            self.emit_load_int(ma.fd.byte_offset as i64);
                            self.emit(Opcode::Add, vec![]);
                        }
                        self.emit(Opcode::StoreDeref, vec![]);
                        Ok(())
                    }
                }
            }
            _ => Err(self.err(
                DiagKind::NonLValueAssignment,
                "left-hand side of assignment is not an lvalue",
            )),
        }
    }

    // ---------------- expressions ----------------

    fn emit_expr(&mut self, e: &Expr) -> Result<Type> {
        self.cur = e.span;
        match &e.kind {
            ExprKind::Literal(l) => {
                match l {
                    Literal::Int(v) => {
                        let id = self.add_const(Constant::I32(*v as i32));
                        self.emit(Opcode::LoadConst, vec![id]);
                    }
                    Literal::Float(v) => {
                        let id = self.add_const(Constant::F32(*v as f32));
                        self.emit(Opcode::LoadConst, vec![id]);
                    }
                    Literal::Char(c) => {
                        let id = self.add_const(Constant::I32(*c as i32));
                        self.emit(Opcode::LoadConst, vec![id]);
                    }
                    Literal::Bool(b) => {
                        let id = self.add_const(Constant::I32(*b as i32));
                        self.emit(Opcode::LoadConst, vec![id]);
                    }
                    Literal::Str(s) => {
                        let sid = self.add_string(s);
                        let id = self.add_const(Constant::Ptr(sid as u32));
                        self.emit(Opcode::LoadConst, vec![id]);
                    }
                }
                self.type_of(e)
            }
            ExprKind::Ident(_)
            | ExprKind::Index { .. }
            | ExprKind::Member { .. } => self.emit_load_place(e),
            ExprKind::Unary { op, expr } => match op {
                UnaryOp::Plus => self.emit_expr(expr),
                UnaryOp::Minus => {
                    let t = self.type_of(expr)?;
                    if t == Type::Float {
                        let id = self.add_const(Constant::F32(0.0));
                        self.emit(Opcode::LoadConst, vec![id]);
                    } else {
                        self.emit_load_int(0);
                    }
                    let _ = self.emit_expr(expr)?;
                    self.emit(Opcode::Sub, vec![]);
                    Ok(t)
                }
                UnaryOp::BitNot => {
                    let _ = self.emit_expr(expr)?;
                    self.emit_load_int(-1);
                    self.emit(Opcode::Xor, vec![]);
                    Ok(Type::Int)
                }
                UnaryOp::LogicalNot => {
                    let _ = self.emit_expr(expr)?;
                    self.emit(Opcode::Not, vec![]);
                    Ok(Type::Bool)
                }
                UnaryOp::AddrOf => {
                    self.emit_place_address(expr)?;
                    Ok(Type::pointer_to(self.type_of(expr)?))
                }
                UnaryOp::Deref => self.emit_load_place(e),
            },
            ExprKind::Binary { op, lhs, rhs } => self.emit_binary(*op, lhs, rhs),
            ExprKind::Assign { target, value } => self.emit_assign(target, value, true),
            ExprKind::AssignOp { op, target, value } => {
                self.emit_assign_op(*op, target, value, true)
            }
            ExprKind::IncDec { pre, inc, target } => self.emit_incdec(*pre, *inc, target, true),
            ExprKind::Cast { ty, expr } => {
                let _ = self.emit_expr(expr)?;
                self.resolve_ast_type(ty)
            }
            ExprKind::SizeofType(ty) => {
                let t = self.resolve_ast_type(ty)?;
                let size = self.size_of(&t);
                self.emit_load_int(size);
                Ok(Type::Int)
            }
            ExprKind::SizeofExpr(inner) => {
                // `sizeof(Name)` where Name is a record reads as a type.
                if let ExprKind::Ident(n) = &inner.kind {
                    if self.lookup_var(n).is_none() {
                        if let Some(l) = self.analysis.layouts.get(n) {
                            let size = l.size as i64;
                            self.emit_load_int(size);
                            return Ok(Type::Int);
                        }
                    }
                }
                let t = self.type_of(inner)?;
                let size = self.size_of(&t);
                self.emit_load_int(size);
                Ok(Type::Int)
            }
            ExprKind::Call { callee, args } => self.emit_call(callee, args),
            ExprKind::ArrayLit(_) => Err(self.err(
                DiagKind::TypeMismatch,
                "array literal is only allowed as an initializer",
            )),
            ExprKind::Send { queue, value } => {
                let id = self.message_id(queue)?;
                let _ = self.emit_expr(value)?;
                self.emit(Opcode::MsgSend, vec![id]);
                Ok(Type::Void)
            }
            ExprKind::Recv { queue, timeout } => {
                let id = self.message_id(queue)?;
                match timeout {
                    Some(t) => {
                        let _ = self.emit_expr(t)?;
                    }
                    None => self.emit_load_int(-1),
                }
                self.emit(Opcode::MsgRecv, vec![id]);
                self.type_of(e)
            }
        }
    }

    fn message_id(&self, queue: &Expr) -> Result<i64> {
        if let ExprKind::Ident(n) = &queue.kind {
            if let Some(&id) = self.message_index.get(n) {
                return Ok(id as i64);
            }
        }
        Err(self.err(
            DiagKind::TypeMismatch,
            "send/recv requires a named message channel",
        ))
    }

    fn emit_binary(&mut self, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> Result<Type> {
        use BinaryOp::*;
        match op {
            LAnd => {
                let _ = self.emit_expr(lhs)?;
                let jf1 = self.emit(Opcode::JumpIfFalse, vec![-1]);
                let _ = self.emit_expr(rhs)?;
                let jf2 = self.emit(Opcode::JumpIfFalse, vec![-1]);
                self.emit_load_int(1);
                let jend = self.emit(Opcode::Jump, vec![-1]);
                let false_pc = self.pc();
                self.patch_jump(jf1, false_pc)?;
                self.patch_jump(jf2, false_pc)?;
                self.emit_load_int(0);
                let end_pc = self.pc();
                self.patch_jump(jend, end_pc)?;
                Ok(Type::Bool)
            }
            LOr => {
                let _ = self.emit_expr(lhs)?;
                let jt1 = self.emit(Opcode::JumpIfTrue, vec![-1]);
                let _ = self.emit_expr(rhs)?;
                let jt2 = self.emit(Opcode::JumpIfTrue, vec![-1]);
                self.emit_load_int(0);
                let jend = self.emit(Opcode::Jump, vec![-1]);
                let true_pc = self.pc();
                self.patch_jump(jt1, true_pc)?;
                self.patch_jump(jt2, true_pc)?;
                self.emit_load_int(1);
                let end_pc = self.pc();
                self.patch_jump(jend, end_pc)?;
                Ok(Type::Bool)
            }
            Shl | Shr => {
                // No shift opcodes in the VM: multiply or divide by 2^k.
                let k = eval_const_int(rhs).ok_or_else(|| {
                    self.err(
                        DiagKind::TypeMismatch,
                        "shift amount must be a constant integer expression",
                    )
                })?;
                let _ = self.emit_expr(lhs)?;
                self.emit_load_int(1i64 << (k & 31));
                self.emit(
                    if op == Shl { Opcode::Mul } else { Opcode::Div },
                    vec![],
                );
                Ok(Type::Int)
            }
            _ => {
                let lt = self.emit_expr(lhs)?;
                let rt = self.emit_expr(rhs)?;
                let opcode = match op {
                    Add => Opcode::Add,
                    Sub => Opcode::Sub,
                    Mul => Opcode::Mul,
                    Div => Opcode::Div,
                    Mod => Opcode::Mod,
                    BitAnd => Opcode::And,
                    BitOr => Opcode::Or,
                    BitXor => Opcode::Xor,
                    Lt => Opcode::Lt,
                    Le => Opcode::Lte,
                    Gt => Opcode::Gt,
                    Ge => Opcode::Gte,
                    Eq => Opcode::Eq,
                    Ne => Opcode::Neq,
                    LAnd | LOr | Shl | Shr => unreachable!("handled above"),
                };
                self.emit(opcode, vec![]);
                Ok(match op {
                    Add | Sub | Mul | Div => {
                        if lt == Type::Float || rt == Type::Float {
                            Type::Float
                        } else {
                            Type::Int
                        }
                    }
                    Mod | BitAnd | BitOr | BitXor => Type::Int,
                    _ => Type::Bool,
                })
            }
        }
    }

    fn emit_assign(&mut self, target: &Expr, value: &Expr, want_value: bool) -> Result<Type> {
        let _ = self.emit_expr(value)?;
        self.emit_store_place(target)?;
        if want_value {
            self.emit_load_place(target)
        } else {
            self.type_of(target)
        }
    }

    fn emit_assign_op(
        &mut self,
        op: BinaryOp,
        target: &Expr,
        value: &Expr,
        want_value: bool,
    ) -> Result<Type> {
        let _ = self.emit_load_place(target)?;
        match op {
            BinaryOp::Shl | BinaryOp::Shr => {
                let k = eval_const_int(value).ok_or_else(|| {
                    self.err(
                        DiagKind::TypeMismatch,
                        "shift amount must be a constant integer expression",
                    )
                })?;
                self.emit_load_int(1i64 << (k & 31));
                self.emit(
                    if op == BinaryOp::Shl {
                        Opcode::Mul
                    } else {
                        Opcode::Div
                    },
                    vec![],
                );
            }
            _ => {
                let _ = self.emit_expr(value)?;
                let opcode = match op {
                    BinaryOp::Add => Opcode::Add,
                    BinaryOp::Sub => Opcode::Sub,
                    BinaryOp::Mul => Opcode::Mul,
                    BinaryOp::Div => Opcode::Div,
                    BinaryOp::Mod => Opcode::Mod,
                    BinaryOp::BitAnd => Opcode::And,
                    BinaryOp::BitOr => Opcode::Or,
                    BinaryOp::BitXor => Opcode::Xor,
                    _ => {
                        return Err(self.err(
                            DiagKind::TypeMismatch,
                            format!("invalid compound assignment operator {:?}", op),
                        ));
                    }
                };
                self.emit(opcode, vec![]);
            }
        }
        self.emit_store_place(target)?;
        if want_value {
            self.emit_load_place(target)
        } else {
            self.type_of(target)
        }
    }

    fn emit_incdec(
        &mut self,
        pre: bool,
        inc: bool,
        target: &Expr,
        want_value: bool,
    ) -> Result<Type> {
        // Postfix value semantics need the old value first.
        if !pre && want_value {
            let _ = self.emit_load_place(target)?;
        }
        let _ = self.emit_load_place(target)?;
        self.emit_load_int(1);
        self.emit(if inc { Opcode::Add } else { Opcode::Sub }, vec![]);
        self.emit_store_place(target)?;
        if pre && want_value {
            let _ = self.emit_load_place(target)?;
        }
        self.type_of(target)
    }

    fn emit_call(&mut self, callee: &str, args: &[Expr]) -> Result<Type> {
        if callee == "StartTask" {
            return self.emit_start_task(args);
        }
        if callee == "DBG_PRINT" {
            let sid = match args.first().map(|a| &a.kind) {
                Some(ExprKind::Literal(Literal::Str(s))) => self.add_string(s),
                _ => {
                    return Err(self.err(
                        DiagKind::TypeMismatch,
                        "DBG_PRINT requires a string literal",
                    ));
                }
            };
            self.emit(Opcode::Print, vec![sid]);
            return Ok(Type::Void);
        }
        if callee == "DBG_PRINTF" {
            let sid = match args.first().map(|a| &a.kind) {
                Some(ExprKind::Literal(Literal::Str(s))) => self.add_string(s),
                _ => {
                    return Err(self.err(
                        DiagKind::TypeMismatch,
                        "DBG_PRINTF requires a string literal format",
                    ));
                }
            };
            for a in &args[1..] {
                let _ = self.emit_expr(a)?;
            }
            self.emit(Opcode::Printf, vec![sid, (args.len() - 1) as i64]);
            return Ok(Type::Void);
        }
        if let Some(opcode) = builtin_opcode(callee) {
            for a in args {
                let _ = self.emit_expr(a)?;
            }
            self.emit(opcode, vec![]);
            let (_, ret) = builtin_signature(callee).ok_or_else(|| {
                self.err(
                    DiagKind::UndefinedSymbol,
                    format!("unknown intrinsic: {}", callee),
                )
            })?;
            return Ok(ret);
        }
        let id = *self.function_index.get(callee).ok_or_else(|| {
            self.err(
                DiagKind::UndefinedSymbol,
                format!("call to undefined function: {}", callee),
            )
        })?;
        for a in args {
            let _ = self.emit_expr(a)?;
        }
        self.emit(Opcode::Call, vec![id as i64, args.len() as i64]);
        Ok(self.analysis.functions[id].ret_type.clone())
    }

    /// `StartTask(stack, core, priority, task_id, fn)` lowers to a single
    /// `RTOS_CREATE_TASK` with five immediate operands; the function operand
    /// is the entry address, patched once all functions are placed.
    fn emit_start_task(&mut self, args: &[Expr]) -> Result<Type> {
        if args.len() != 5 {
            return Err(self.err(
                DiagKind::ArityMismatch,
                format!("StartTask takes 5 arguments, got {}", args.len()),
            ));
        }
        let mut operands = Vec::with_capacity(5);
        for a in &args[..4] {
            let v = eval_const_int(a).ok_or_else(|| {
                self.err(
                    DiagKind::TypeMismatch,
                    "StartTask attributes must be integer constants",
                )
            })?;
            operands.push(v);
        }
        let fn_id = match &args[4].kind {
            ExprKind::Ident(n) => *self.function_index.get(n).ok_or_else(|| {
                self.err(
                    DiagKind::UndefinedSymbol,
                    format!("StartTask target {} is not a function", n),
                )
            })?,
            _ => {
                return Err(self.err(
                    DiagKind::TypeMismatch,
                    "StartTask target must be a function name",
                ));
            }
        };
        operands.push(0);
        let idx = self.emit(Opcode::RtosCreateTask, operands);
        self.fn_addr_patches.push((idx, 4, fn_id));
        Ok(Type::Void)
    }

    fn emit_expr_stmt(&mut self, e: &Expr) -> Result<()> {
        self.cur = e.span;
        let ty = match &e.kind {
            ExprKind::Assign { target, value } => self.emit_assign(target, value, false)?,
            ExprKind::AssignOp { op, target, value } => {
                self.emit_assign_op(*op, target, value, false)?
            }
            ExprKind::IncDec { pre, inc, target } => {
                self.emit_incdec(*pre, *inc, target, false)?
            }
            _ => self.emit_expr(e)?,
        };
        // Nothing may be left on the operand stack between statements; park
        // unused values in the scratch slot.
        let leaves_value = !matches!(
            e.kind,
            ExprKind::Assign { .. } | ExprKind::AssignOp { .. } | ExprKind::IncDec { .. }
        );
        if leaves_value && ty != Type::Void {
            let addr = self.scratch_addr();
            self.emit(Opcode::StoreVar, vec![addr]);
        }
        Ok(())
    }

    // ---------------- statements ----------------

    fn emit_stmt(&mut self, s: &Stmt) -> Result<()> {
        self.cur = s.span;
        match &s.kind {
            StmtKind::Block(body) => {
                self.push_scope();
                for st in body {
                    self.emit_stmt(st)?;
                }
                self.pop_scope();
                Ok(())
            }
            StmtKind::Decl {
                name,
                ty,
                array_size,
                init,
                ..
            } => self.emit_local_decl(name, ty, array_size, init, s.span),
            StmtKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                match const_truth(cond) {
                    Some(true) => return self.emit_stmts_scoped(then_branch),
                    Some(false) => {
                        if let Some(eb) = else_branch {
                            return self.emit_stmts_scoped(eb);
                        }
                        return Ok(());
                    }
                    None => {}
                }
                let _ = self.emit_expr(cond)?;
                let jf = self.emit(Opcode::JumpIfFalse, vec![-1]);
                self.emit_stmts_scoped(then_branch)?;
                match else_branch {
                    Some(eb) => {
                        let jend = self.emit(Opcode::Jump, vec![-1]);
                        let else_pc = self.pc();
                        self.patch_jump(jf, else_pc)?;
                        self.emit_stmts_scoped(eb)?;
                        let end_pc = self.pc();
                        self.patch_jump(jend, end_pc)?;
                    }
                    None => {
                        let end_pc = self.pc();
                        self.patch_jump(jf, end_pc)?;
                    }
                }
                Ok(())
            }
            StmtKind::While { cond, body } => {
                let start = self.pc();
                let jf = if const_truth(cond) == Some(true) {
                    None
                } else {
                    let _ = self.emit_expr(cond)?;
                    Some(self.emit(Opcode::JumpIfFalse, vec![-1]))
                };
                self.loops.push(LoopCtx {
                    break_patches: Vec::new(),
                    continue_patches: Vec::new(),
                    continue_addr: Some(start),
                });
                self.emit_stmts_scoped(body)?;
                self.emit(Opcode::Jump, vec![start]);
                let end = self.pc();
                if let Some(jf) = jf {
                    self.patch_jump(jf, end)?;
                }
                let ctx = self.loops.pop().ok_or_else(|| {
                    self.err(DiagKind::CodegenBranchTooFar, "loop context underflow")
                })?;
                for b in ctx.break_patches {
                    self.patch_jump(b, end)?;
                }
                Ok(())
            }
            StmtKind::For {
                init,
                cond,
                post,
                body,
            } => {
                self.push_scope();
                if let Some(i) = init {
                    self.emit_stmt(i)?;
                }
                let start = self.pc();
                let jf = match cond {
                    Some(c) if const_truth(c) != Some(true) => {
                        let _ = self.emit_expr(c)?;
                        Some(self.emit(Opcode::JumpIfFalse, vec![-1]))
                    }
                    _ => None,
                };
                self.loops.push(LoopCtx {
                    break_patches: Vec::new(),
                    continue_patches: Vec::new(),
                    continue_addr: None,
                });
                self.emit_stmts_scoped(body)?;
                let post_pc = self.pc();
                if let Some(p) = post {
                    self.emit_expr_stmt(p)?;
                }
                self.emit(Opcode::Jump, vec![start]);
                let end = self.pc();
                if let Some(jf) = jf {
                    self.patch_jump(jf, end)?;
                }
                let ctx = self.loops.pop().ok_or_else(|| {
                    self.err(DiagKind::CodegenBranchTooFar, "loop context underflow")
                })?;
                for c in ctx.continue_patches {
                    self.patch_jump(c, post_pc)?;
                }
                for b in ctx.break_patches {
                    self.patch_jump(b, end)?;
                }
                self.pop_scope();
                Ok(())
            }
            StmtKind::Break => {
                let idx = self.emit(Opcode::Jump, vec![-1]);
                match self.loops.last_mut() {
                    Some(ctx) => {
                        ctx.break_patches.push(idx);
                        Ok(())
                    }
                    None => Err(self.err(DiagKind::TypeMismatch, "break outside of a loop")),
                }
            }
            StmtKind::Continue => {
                let target = self.loops.last().map(|ctx| ctx.continue_addr);
                match target {
                    Some(Some(addr)) => {
                        self.emit(Opcode::Jump, vec![addr]);
                        Ok(())
                    }
                    Some(None) => {
                        let idx = self.emit(Opcode::Jump, vec![-1]);
                        if let Some(ctx) = self.loops.last_mut() {
                            ctx.continue_patches.push(idx);
                        }
                        Ok(())
                    }
                    None => Err(self.err(DiagKind::TypeMismatch, "continue outside of a loop")),
                }
            }
            StmtKind::Return(e) => {
                if let Some(e) = e {
                    let _ = self.emit_expr(e)?;
                }
                self.emit(Opcode::FreeFrame, vec![]);
                self.emit(Opcode::Ret, vec![]);
                Ok(())
            }
            StmtKind::ExprStmt(e) => self.emit_expr_stmt(e),
        }
    }

    fn emit_stmts_scoped(&mut self, body: &[Stmt]) -> Result<()> {
        self.push_scope();
        for st in body {
            self.emit_stmt(st)?;
        }
        self.pop_scope();
        Ok(())
    }

    fn emit_local_decl(
        &mut self,
        name: &str,
        ty: &Type,
        array_size: &Option<Expr>,
        init: &Option<Expr>,
        span: Span,
    ) -> Result<()> {
        self.cur = span;
        let mut rty = self.resolve_ast_type(ty)?;
        if let Some(size_expr) = array_size {
            let n = eval_const_int(size_expr).ok_or_else(|| {
                self.err(
                    DiagKind::ArraySizeNotConstant,
                    "array size is not a constant expression",
                )
            })?;
            rty = Type::Array(Box::new(rty), n as usize);
        }
        let addr = self.declare_local(name, rty.clone());
        self.emit_storage_init(addr, &rty, init)
    }

    /// Allocate and initialize the storage behind a freshly declared
    /// variable slot. Shared by locals and the global prelude.
    fn emit_storage_init(&mut self, addr: i64, ty: &Type, init: &Option<Expr>) -> Result<()> {
        match ty {
            Type::Array(elem, n) => {
                let es = self.size_of(elem);
                self.emit(Opcode::AllocArray, vec![es, *n as i64]);
                self.emit(Opcode::StoreVar, vec![addr]);
                if let Some(init) = init {
                    let items = match &init.kind {
                        ExprKind::ArrayLit(items) => items.clone(),
                        _ => {
                            return Err(self.err(
                                DiagKind::TypeMismatch,
                                "array initializer must be a braced list",
                            ));
                        }
                    };
                    for (i, item) in items.iter().enumerate() {
                        let _ = self.emit_expr(item)?;
                        self.emit_load_int(i as i64);
                        self.emit(Opcode::StoreArrayElem, vec![addr, es]);
                    }
                }
                Ok(())
            }
            Type::Struct(record) | Type::Union(record) => {
                let size = self.size_of(ty);
                self.emit(Opcode::AllocStruct, vec![size]);
                self.emit(Opcode::StoreVar, vec![addr]);
                let defaults = self.defaults.get(record.as_str()).cloned().unwrap_or_default();
                for (fname, dexpr) in &defaults {
                    let fd = self
                        .analysis
                        .layouts
                        .resolve_field(record, fname)
                        .ok_or_else(|| {
                            self.err(
                                DiagKind::FieldNotFound,
                                format!("no field {} in {}", fname, record),
                            )
                        })?;
                    let _ = self.emit_expr(dexpr)?;
                    self.emit_field_store(addr, &fd);
                }
                if let Some(init) = init {
                    let items = match &init.kind {
                        ExprKind::ArrayLit(items) => items.clone(),
                        _ => {
                            return Err(self.err(
                                DiagKind::TypeMismatch,
                                "struct initializer must be a braced list",
                            ));
                        }
                    };
                    let layout = self.analysis.layouts.get(record).cloned().ok_or_else(|| {
                        self.err(
                            DiagKind::UndefinedSymbol,
                            format!("unknown struct or union: {}", record),
                        )
                    })?;
                    for (item, fd) in items.iter().zip(layout.fields.iter()) {
                        let _ = self.emit_expr(item)?;
                        self.emit_field_store(addr, fd);
                    }
                }
                Ok(())
            }
            _ => {
                if let Some(init) = init {
                    let _ = self.emit_expr(init)?;
                    self.emit(Opcode::StoreVar, vec![addr]);
                }
                Ok(())
            }
        }
    }

    fn emit_field_store(&mut self, base_addr: i64, fd: &FieldDescriptor) {
        if fd.is_bit_field() {
            self.emit(
                Opcode::StoreStructMemberBit,
                vec![
                    base_addr,
                    fd.byte_offset as i64,
                    fd.bit_offset as i64,
                    fd.bit_width as i64,
                ],
            );
        } else {
            self.emit(Opcode::StoreStructMember, vec![base_addr, fd.byte_offset as i64]);
        }
    }

    // ---------------- top level ----------------

    fn collect_defaults(&mut self, prog: &ast::Program) {
        for r in &prog.records {
            let mut pairs = Vec::new();
            collect_field_defaults(&r.fields, &mut pairs);
            if !pairs.is_empty() {
                self.defaults.insert(r.name.clone(), pairs);
            }
        }
    }

    /// Startup prelude: declare globals and channels, then enter `main`.
    fn emit_prelude(&mut self, prog: &ast::Program) -> Result<()> {
        for (g, info) in prog.globals.iter().zip(&self.analysis.globals.to_vec()) {
            self.cur = g.span;
            let is_const = info.is_const as i64;
            match &info.ty {
                Type::Array(_, _) | Type::Struct(_) | Type::Union(_) => {
                    self.emit(Opcode::GlobalVarDeclare, vec![info.address, -1, is_const]);
                    self.emit_storage_init(info.address, &info.ty, &g.init)?;
                }
                ty => {
                    let cid = match &g.init {
                        None => match ty {
                            Type::Float => self.add_const(Constant::F32(0.0)),
                            _ => self.add_const(Constant::I32(0)),
                        },
                        Some(e) => {
                            if let Some(v) = eval_const_int(e) {
                                self.add_const(Constant::I32(v as i32))
                            } else if let Some(v) = eval_const_float(e) {
                                self.add_const(Constant::F32(v as f32))
                            } else if let ExprKind::Literal(Literal::Str(s)) = &e.kind {
                                let sid = self.add_string(s);
                                self.add_const(Constant::Ptr(sid as u32))
                            } else {
                                return Err(self.err(
                                    DiagKind::TypeMismatch,
                                    "global initializer is not a constant expression",
                                ));
                            }
                        }
                    };
                    self.emit(Opcode::GlobalVarDeclare, vec![info.address, cid, is_const]);
                }
            }
            if self.mode == Mode::Debug {
                self.symbols.push((info.name.clone(), info.address as u32));
            }
        }
        for m in &self.analysis.messages.to_vec() {
            let elem_size = self.size_of(&m.elem);
            self.emit(Opcode::MsgDeclare, vec![m.id as i64, elem_size]);
        }
        let main_id = *self.function_index.get("main").ok_or_else(|| {
            self.err(DiagKind::UndefinedSymbol, "program has no main function")
        })?;
        self.emit(Opcode::Call, vec![main_id as i64, 0]);
        self.emit(Opcode::Halt, vec![]);
        Ok(())
    }

    fn emit_function(&mut self, f: &ast::Function) -> Result<()> {
        let id = *self.function_index.get(f.name.as_str()).ok_or_else(|| {
            self.err(
                DiagKind::UndefinedSymbol,
                format!("unknown function: {}", f.name),
            )
        })?;
        self.cur = f.span;
        self.functions[id].1 = self.pc() as u32;
        if self.mode == Mode::Debug {
            let sid = self.add_string(&format!("function {}", f.name));
            self.emit(Opcode::Comment, vec![sid]);
        }
        self.scopes = vec![HashMap::new()];
        self.next_slot = 0;
        self.scratch_slot = None;
        self.loops.clear();

        let params = self.analysis.functions[id].params.clone();
        for p in &params {
            let _ = self.declare_local(&p.name, p.ty.clone());
        }
        let alloc_idx = self.emit(Opcode::AllocFrame, vec![0]);
        for st in &f.body {
            self.emit_stmt(st)?;
        }
        if !matches!(self.code.last().map(|i| i.opcode), Some(Opcode::Ret)) {
            self.emit(Opcode::FreeFrame, vec![]);
            self.emit(Opcode::Ret, vec![]);
        }
        // The analyzer assigned the frame slots; `next_slot` only exceeds
        // its count when the scratch slot was reserved.
        let frame = self.analysis.functions[id].frame_size.max(self.next_slot);
        self.code[alloc_idx].operands[0] = frame as i64;
        self.scopes.clear();
        Ok(())
    }

    fn apply_fn_addr_patches(&mut self) -> Result<()> {
        for (idx, operand, fn_id) in self.fn_addr_patches.clone() {
            let addr = self.functions[fn_id].1 as i64;
            self.code[idx].operands[operand] = addr;
        }
        Ok(())
    }

    fn finish(self) -> BytecodeProgram {
        BytecodeProgram {
            mode: self.mode,
            instructions: self.code,
            constants: self.constants,
            strings: self.strings,
            functions: self.functions,
            symbols: self.symbols,
        }
    }
}

fn collect_field_defaults(fields: &[FieldDecl], out: &mut Vec<(String, Expr)>) {
    for f in fields {
        match f {
            FieldDecl::Field {
                name,
                default: Some(d),
                ..
            } => out.push((name.clone(), d.clone())),
            FieldDecl::Field { .. } => {}
            FieldDecl::Anonymous { fields, .. } => collect_field_defaults(fields, out),
        }
    }
}

fn builtin_opcode(name: &str) -> Option<Opcode> {
    Some(match name {
        "RTOS_DELAY_MS" => Opcode::RtosDelayMs,
        "RTOS_YIELD" => Opcode::RtosYield,
        "RTOS_SUSPEND_TASK" => Opcode::RtosSuspendTask,
        "RTOS_RESUME_TASK" => Opcode::RtosResumeTask,
        "RTOS_DELETE_TASK" => Opcode::RtosDeleteTask,
        "RTOS_SEMAPHORE_CREATE" => Opcode::RtosSemaphoreCreate,
        "RTOS_SEMAPHORE_TAKE" => Opcode::RtosSemaphoreTake,
        "RTOS_SEMAPHORE_GIVE" => Opcode::RtosSemaphoreGive,
        "HW_GPIO_INIT" => Opcode::HwGpioInit,
        "HW_GPIO_SET" => Opcode::HwGpioSet,
        "HW_GPIO_GET" => Opcode::HwGpioGet,
        "HW_TIMER_INIT" => Opcode::HwTimerInit,
        "HW_TIMER_START" => Opcode::HwTimerStart,
        "HW_TIMER_STOP" => Opcode::HwTimerStop,
        "HW_TIMER_SET_PWM_DUTY" => Opcode::HwTimerSetPwmDuty,
        "HW_ADC_INIT" => Opcode::HwAdcInit,
        "HW_ADC_READ" => Opcode::HwAdcRead,
        "HW_UART_WRITE" => Opcode::HwUartWrite,
        "HW_SPI_TRANSFER" => Opcode::HwSpiTransfer,
        "HW_I2C_WRITE" => Opcode::HwI2cWrite,
        "HW_I2C_READ" => Opcode::HwI2cRead,
        "DBG_BREAKPOINT" => Opcode::DbgBreakpoint,
        _ => return None,
    })
}
