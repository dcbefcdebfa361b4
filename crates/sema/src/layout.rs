//! Record layout computation.
//!
//! Layouts are built once, after parsing, and shared read-only with the
//! bytecode generator. Registration is two-phase: every record name is known
//! before any layout is filled, so pointer fields may reference records
//! declared later; a non-pointer containment cycle is `CircularType`.

use crate::fold::eval_const_int;
use diag::{Diag, DiagKind, Result};
use parse::ast::{FieldDecl, RecordDecl, RecordKind, Span, Type};
use std::collections::HashMap;

pub const SIZEOF_CHAR: usize = 1;
pub const SIZEOF_BOOL: usize = 1;
pub const SIZEOF_INT: usize = 4;
pub const SIZEOF_FLOAT: usize = 4;
pub const SIZEOF_PTR: usize = 8;

/// Bit-fields pack into 32-bit storage units.
pub const STORAGE_UNIT_BITS: u32 = 32;
const STORAGE_UNIT_BYTES: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub ty: Type,
    pub byte_offset: usize,
    pub bit_offset: u32,
    /// 0 for a plain field.
    pub bit_width: u32,
    pub from_anonymous: bool,
}

impl FieldDescriptor {
    pub fn is_bit_field(&self) -> bool {
        self.bit_width > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructLayout {
    pub name: String,
    pub kind: RecordKind,
    pub size: usize,
    pub align: usize,
    pub fields: Vec<FieldDescriptor>,
    /// First-field-is-struct inheritance: the base record at offset 0.
    pub base: Option<String>,
}

impl StructLayout {
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct LayoutTable {
    layouts: HashMap<String, StructLayout>,
    order: Vec<String>,
}

impl LayoutTable {
    pub fn get(&self, name: &str) -> Option<&StructLayout> {
        self.layouts.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.layouts.contains_key(name)
    }

    /// Record names in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|s| s.as_str())
    }

    /// Resolve a field by name, walking the inheritance chain (the base
    /// sub-object sits at offset 0, so offsets carry over unchanged).
    pub fn resolve_field(&self, record: &str, field: &str) -> Option<FieldDescriptor> {
        let mut cur = record;
        loop {
            let layout = self.layouts.get(cur)?;
            if let Some(f) = layout.field(field) {
                return Some(f.clone());
            }
            cur = layout.base.as_deref()?;
        }
    }
}

pub fn sizeof_type(ty: &Type, layouts: &LayoutTable) -> usize {
    match ty {
        Type::Char => SIZEOF_CHAR,
        Type::Bool => SIZEOF_BOOL,
        Type::Int => SIZEOF_INT,
        Type::Float => SIZEOF_FLOAT,
        Type::Void => 0,
        Type::Pointer(_) => SIZEOF_PTR,
        Type::Array(elem, n) => n.saturating_mul(sizeof_type(elem, layouts)),
        Type::Struct(name) | Type::Union(name) | Type::Named(name) => {
            layouts.get(name).map(|l| l.size).unwrap_or(0)
        }
        Type::Message(_) => 0,
    }
}

pub fn alignof_type(ty: &Type, layouts: &LayoutTable) -> usize {
    match ty {
        Type::Char | Type::Bool => 1,
        Type::Int | Type::Float => 4,
        Type::Void => 1,
        Type::Pointer(_) => SIZEOF_PTR,
        Type::Array(elem, _) => alignof_type(elem, layouts),
        Type::Struct(name) | Type::Union(name) | Type::Named(name) => {
            layouts.get(name).map(|l| l.align).unwrap_or(1)
        }
        Type::Message(_) => 1,
    }
}

fn round_up(x: usize, a: usize) -> usize {
    if a == 0 {
        x
    } else {
        x.div_ceil(a) * a
    }
}

struct LayoutBuilder<'a> {
    decls: HashMap<String, &'a RecordDecl>,
    done: HashMap<String, StructLayout>,
    in_progress: Vec<String>,
}

impl<'a> LayoutBuilder<'a> {
    fn layout_of(&mut self, name: &str, span: Span) -> Result<StructLayout> {
        if let Some(l) = self.done.get(name) {
            return Ok(l.clone());
        }
        if self.in_progress.iter().any(|n| n == name) {
            return Err(Diag::new(
                DiagKind::CircularType,
                span.line,
                span.col,
                format!("record {} contains itself by value", name),
            ));
        }
        let decl = *self.decls.get(name).ok_or_else(|| {
            Diag::new(
                DiagKind::UndefinedSymbol,
                span.line,
                span.col,
                format!("unknown struct or union: {}", name),
            )
        })?;
        self.in_progress.push(name.to_string());
        let layout = self.build_record(decl.kind, &decl.name, &decl.fields, decl.span)?;
        self.in_progress.pop();
        self.done.insert(name.to_string(), layout.clone());
        Ok(layout)
    }

    /// Map `Named` references to their record kind; leaves everything else
    /// structurally intact so downstream passes see concrete types.
    fn resolve_type(&self, ty: &Type, span: Span) -> Result<Type> {
        Ok(match ty {
            Type::Named(n) => match self.decls.get(n).map(|d| d.kind) {
                Some(RecordKind::Struct) => Type::Struct(n.clone()),
                Some(RecordKind::Union) => Type::Union(n.clone()),
                None => {
                    return Err(Diag::new(
                        DiagKind::UndefinedSymbol,
                        span.line,
                        span.col,
                        format!("unknown type name: {}", n),
                    ));
                }
            },
            Type::Pointer(inner) => Type::Pointer(Box::new(self.resolve_type(inner, span)?)),
            Type::Array(inner, n) => Type::Array(Box::new(self.resolve_type(inner, span)?), *n),
            other => other.clone(),
        })
    }

    fn size_align_of(&mut self, ty: &Type, span: Span) -> Result<(usize, usize)> {
        Ok(match ty {
            Type::Char | Type::Bool => (1, 1),
            Type::Int | Type::Float => (4, 4),
            Type::Pointer(_) => (SIZEOF_PTR, SIZEOF_PTR),
            Type::Array(elem, n) => {
                let (s, a) = self.size_align_of(elem, span)?;
                (n.saturating_mul(s), a)
            }
            Type::Struct(name) | Type::Union(name) => {
                let l = self.layout_of(name, span)?;
                (l.size, l.align)
            }
            Type::Void | Type::Message(_) | Type::Named(_) => {
                return Err(Diag::new(
                    DiagKind::TypeMismatch,
                    span.line,
                    span.col,
                    format!("type {:?} cannot be used as a field", ty),
                ));
            }
        })
    }

    fn field_type(&mut self, ty: &Type, array_size: &Option<parse::ast::Expr>, span: Span) -> Result<Type> {
        let resolved = self.resolve_type(ty, span)?;
        match array_size {
            None => Ok(resolved),
            Some(e) => {
                let n = eval_const_int(e).ok_or_else(|| {
                    Diag::new(
                        DiagKind::ArraySizeNotConstant,
                        span.line,
                        span.col,
                        "array size is not a constant expression",
                    )
                })?;
                if n <= 0 {
                    return Err(Diag::new(
                        DiagKind::ArraySizeNotConstant,
                        span.line,
                        span.col,
                        format!("array size must be positive, got {}", n),
                    ));
                }
                Ok(Type::Array(Box::new(resolved), n as usize))
            }
        }
    }

    fn build_record(
        &mut self,
        kind: RecordKind,
        name: &str,
        fields: &[FieldDecl],
        span: Span,
    ) -> Result<StructLayout> {
        let layout = match kind {
            RecordKind::Struct => self.build_struct(name, fields, span)?,
            RecordKind::Union => self.build_union(name, fields, span)?,
        };
        for (i, f) in layout.fields.iter().enumerate() {
            for g in &layout.fields[i + 1..] {
                if f.name == g.name {
                    return Err(Diag::new(
                        DiagKind::DuplicateDefinition,
                        span.line,
                        span.col,
                        format!("duplicate field {} in {}", f.name, name),
                    ));
                }
            }
        }
        Ok(layout)
    }

    fn build_struct(&mut self, name: &str, fields: &[FieldDecl], span: Span) -> Result<StructLayout> {
        let mut out: Vec<FieldDescriptor> = Vec::new();
        let mut offset = 0usize;
        let mut align = 1usize;
        // Start of the open bit-field storage unit, with bits consumed so far.
        let mut unit: Option<(usize, u32)> = None;
        let mut base: Option<String> = None;
        let mut first_plain_field = true;

        for field in fields {
            match field {
                FieldDecl::Field {
                    name: fname,
                    ty,
                    array_size,
                    bit_width: Some((width, wspan)),
                    ..
                } => {
                    if array_size.is_some() {
                        return Err(Diag::new(
                            DiagKind::BadBitFieldWidth,
                            wspan.line,
                            wspan.col,
                            "bit-field cannot be an array",
                        ));
                    }
                    let rty = self.resolve_type(ty, *wspan)?;
                    if rty != Type::Int {
                        return Err(Diag::new(
                            DiagKind::TypeMismatch,
                            wspan.line,
                            wspan.col,
                            format!("bit-field {} must have int type", fname),
                        ));
                    }
                    let w = *width;
                    if w < 1 || w > STORAGE_UNIT_BITS as i64 {
                        return Err(Diag::new(
                            DiagKind::BadBitFieldWidth,
                            wspan.line,
                            wspan.col,
                            format!("bit-field width {} not in 1..=32", w),
                        ));
                    }
                    let w = w as u32;
                    let (unit_start, bits_used) = match unit {
                        Some((start, used)) if used + w <= STORAGE_UNIT_BITS => (start, used),
                        _ => {
                            let start = round_up(offset, STORAGE_UNIT_BYTES);
                            offset = start + STORAGE_UNIT_BYTES;
                            align = align.max(STORAGE_UNIT_BYTES);
                            (start, 0)
                        }
                    };
                    out.push(FieldDescriptor {
                        name: fname.clone(),
                        ty: rty,
                        byte_offset: unit_start,
                        bit_offset: bits_used,
                        bit_width: w,
                        from_anonymous: false,
                    });
                    unit = Some((unit_start, bits_used + w));
                    first_plain_field = false;
                }
                FieldDecl::Field {
                    name: fname,
                    ty,
                    array_size,
                    bit_width: None,
                    span: fspan,
                    ..
                } => {
                    unit = None;
                    let fty = self.field_type(ty, array_size, *fspan)?;
                    let (s, a) = self.size_align_of(&fty, *fspan)?;
                    offset = round_up(offset, a);
                    if first_plain_field && offset == 0 {
                        if let Type::Struct(b) = &fty {
                            base = Some(b.clone());
                        }
                    }
                    out.push(FieldDescriptor {
                        name: fname.clone(),
                        ty: fty,
                        byte_offset: offset,
                        bit_offset: 0,
                        bit_width: 0,
                        from_anonymous: false,
                    });
                    offset += s;
                    align = align.max(a);
                    first_plain_field = false;
                }
                FieldDecl::Anonymous {
                    kind,
                    fields: inner,
                    span: aspan,
                } => {
                    unit = None;
                    let sub = self.build_record(*kind, "", inner, *aspan)?;
                    offset = round_up(offset, sub.align);
                    for f in &sub.fields {
                        out.push(FieldDescriptor {
                            name: f.name.clone(),
                            ty: f.ty.clone(),
                            byte_offset: offset + f.byte_offset,
                            bit_offset: f.bit_offset,
                            bit_width: f.bit_width,
                            from_anonymous: true,
                        });
                    }
                    offset += sub.size;
                    align = align.max(sub.align);
                    first_plain_field = false;
                }
            }
        }

        let size = round_up(offset, align);
        let _ = span;
        Ok(StructLayout {
            name: name.to_string(),
            kind: RecordKind::Struct,
            size,
            align,
            fields: out,
            base,
        })
    }

    fn build_union(&mut self, name: &str, fields: &[FieldDecl], span: Span) -> Result<StructLayout> {
        let mut out: Vec<FieldDescriptor> = Vec::new();
        let mut size = 0usize;
        let mut align = 1usize;

        for field in fields {
            match field {
                FieldDecl::Field {
                    name: fname,
                    ty,
                    array_size,
                    bit_width,
                    span: fspan,
                    ..
                } => {
                    let (fty, s, a, width) = match bit_width {
                        Some((w, wspan)) => {
                            if *w < 1 || *w > STORAGE_UNIT_BITS as i64 {
                                return Err(Diag::new(
                                    DiagKind::BadBitFieldWidth,
                                    wspan.line,
                                    wspan.col,
                                    format!("bit-field width {} not in 1..=32", w),
                                ));
                            }
                            (Type::Int, STORAGE_UNIT_BYTES, STORAGE_UNIT_BYTES, *w as u32)
                        }
                        None => {
                            let fty = self.field_type(ty, array_size, *fspan)?;
                            let (s, a) = self.size_align_of(&fty, *fspan)?;
                            (fty, s, a, 0)
                        }
                    };
                    out.push(FieldDescriptor {
                        name: fname.clone(),
                        ty: fty,
                        byte_offset: 0,
                        bit_offset: 0,
                        bit_width: width,
                        from_anonymous: false,
                    });
                    size = size.max(s);
                    align = align.max(a);
                }
                FieldDecl::Anonymous {
                    kind,
                    fields: inner,
                    span: aspan,
                } => {
                    let sub = self.build_record(*kind, "", inner, *aspan)?;
                    for f in &sub.fields {
                        out.push(FieldDescriptor {
                            name: f.name.clone(),
                            ty: f.ty.clone(),
                            byte_offset: f.byte_offset,
                            bit_offset: f.bit_offset,
                            bit_width: f.bit_width,
                            from_anonymous: true,
                        });
                    }
                    size = size.max(sub.size);
                    align = align.max(sub.align);
                }
            }
        }

        let size = round_up(size, align);
        let _ = span;
        Ok(StructLayout {
            name: name.to_string(),
            kind: RecordKind::Union,
            size,
            align,
            fields: out,
            base: None,
        })
    }
}

/// Build layouts for every named record in declaration order.
pub fn build_layouts(records: &[RecordDecl]) -> Result<LayoutTable> {
    let mut decls: HashMap<String, &RecordDecl> = HashMap::new();
    for r in records {
        if r.name.is_empty() {
            continue;
        }
        if decls.insert(r.name.clone(), r).is_some() {
            return Err(Diag::new(
                DiagKind::DuplicateDefinition,
                r.span.line,
                r.span.col,
                format!("duplicate struct or union definition: {}", r.name),
            ));
        }
    }

    let mut builder = LayoutBuilder {
        decls,
        done: HashMap::new(),
        in_progress: Vec::new(),
    };

    let mut table = LayoutTable::default();
    for r in records {
        if r.name.is_empty() {
            continue;
        }
        let layout = builder.layout_of(&r.name, r.span)?;
        if !table.layouts.contains_key(&r.name) {
            table.order.push(r.name.clone());
            table.layouts.insert(r.name.clone(), layout);
        }
    }
    Ok(table)
}
