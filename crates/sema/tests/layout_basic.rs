use parse::parse_source;
use sema::{build_layouts, sizeof_type};

// char then int: int aligns to 4, struct size 8, align 4.
#[test]
fn struct_char_then_int_layout() {
    let src = "struct S { char c; int v; };";
    let prog = parse_source(src).unwrap();
    let table = build_layouts(&prog.records).unwrap();
    let s = table.get("S").expect("layout");

    let c = s.field("c").unwrap();
    let v = s.field("v").unwrap();
    assert_eq!(c.byte_offset, 0);
    assert_eq!(v.byte_offset, 4);
    assert_eq!(s.size, 8);
    assert_eq!(s.align, 4);
}

// Pointer members force 8-byte alignment.
#[test]
fn struct_int_then_pointer_layout() {
    let src = "struct S { int a; int *p; int b; };";
    let prog = parse_source(src).unwrap();
    let table = build_layouts(&prog.records).unwrap();
    let s = table.get("S").unwrap();

    assert_eq!(s.field("a").unwrap().byte_offset, 0);
    assert_eq!(s.field("p").unwrap().byte_offset, 8);
    assert_eq!(s.field("b").unwrap().byte_offset, 16);
    assert_eq!(s.align, 8);
    assert_eq!(s.size, 24);
}

// Every field fits inside the struct.
#[test]
fn field_extents_stay_inside_struct() {
    let src = "struct S { char c; int v : 5; int w : 30; float f; char buf[3]; int *p; };";
    let prog = parse_source(src).unwrap();
    let table = build_layouts(&prog.records).unwrap();
    let s = table.get("S").unwrap();
    for f in &s.fields {
        let end = f.byte_offset
            + (f.bit_offset as usize + f.bit_width as usize).div_ceil(8).max(1);
        assert!(end <= s.size, "field {} spills out of the struct", f.name);
    }
}

#[test]
fn array_field_spans_element_count() {
    let src = "struct S { char tag; int data[4]; };";
    let prog = parse_source(src).unwrap();
    let table = build_layouts(&prog.records).unwrap();
    let s = table.get("S").unwrap();
    assert_eq!(s.field("data").unwrap().byte_offset, 4);
    assert_eq!(s.size, 20);
}

#[test]
fn union_size_is_max_of_alternatives_and_offsets_zero() {
    let src = "union U { int word; char bytes[7]; float real; };";
    let prog = parse_source(src).unwrap();
    let table = build_layouts(&prog.records).unwrap();
    let u = table.get("U").unwrap();
    assert_eq!(u.size, 8, "7 bytes rounded to int alignment");
    for f in &u.fields {
        assert_eq!(f.byte_offset, 0, "union alternative {} not at 0", f.name);
    }
}

#[test]
fn nested_struct_field_uses_inner_layout() {
    let src = "struct Inner { int a; int b; }; struct Outer { char c; struct Inner i; };";
    let prog = parse_source(src).unwrap();
    let table = build_layouts(&prog.records).unwrap();
    let outer = table.get("Outer").unwrap();
    assert_eq!(outer.field("i").unwrap().byte_offset, 4);
    assert_eq!(outer.size, 12);
}

#[test]
fn sizeof_matches_layout_totals() {
    use parse::ast::Type;
    let src = "struct Inner { int a; int b; }; struct Outer { char c; struct Inner i; };";
    let prog = parse_source(src).unwrap();
    let table = build_layouts(&prog.records).unwrap();
    assert_eq!(sizeof_type(&Type::Struct("Outer".into()), &table), 12);
    assert_eq!(
        sizeof_type(&Type::Array(Box::new(Type::Struct("Inner".into())), 3), &table),
        24
    );
    assert_eq!(sizeof_type(&Type::pointer_to(Type::Int), &table), 8);
    assert_eq!(sizeof_type(&Type::Char, &table), 1);
    assert_eq!(sizeof_type(&Type::Bool, &table), 1);
}

// First-field-is-struct inheritance: D is-a B, sub-object at offset 0.
#[test]
fn first_field_struct_records_base() {
    let src = "struct B { int id; }; struct D { struct B base; int extra; };";
    let prog = parse_source(src).unwrap();
    let table = build_layouts(&prog.records).unwrap();
    let d = table.get("D").unwrap();
    assert_eq!(d.base.as_deref(), Some("B"));
    assert_eq!(d.field("base").unwrap().byte_offset, 0);

    // Fields of the base resolve through the derived record.
    let inherited = table.resolve_field("D", "id").unwrap();
    assert_eq!(inherited.byte_offset, 0);
}

#[test]
fn pointer_cycles_are_fine() {
    let src = "struct A { struct B *b; }; struct B { struct A *a; };";
    let prog = parse_source(src).unwrap();
    let table = build_layouts(&prog.records).unwrap();
    assert_eq!(table.get("A").unwrap().size, 8);
    assert_eq!(table.get("B").unwrap().size, 8);
}
