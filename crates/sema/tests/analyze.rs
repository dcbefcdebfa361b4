use diag::DiagKind;
use parse::parse_source;
use sema::analyze;

fn analyze_err(src: &str) -> diag::Diag {
    let prog = parse_source(src).unwrap();
    analyze(&prog).unwrap_err()
}

fn analyze_ok(src: &str) -> sema::Analysis {
    let prog = parse_source(src).unwrap();
    analyze(&prog).unwrap()
}

#[test]
fn duplicate_global_reports_second_occurrence() {
    let err = analyze_err("int x;\nint x;\nvoid main(){}");
    assert_eq!(err.kind, DiagKind::DuplicateDefinition);
    assert_eq!(err.line, 2);
    assert_eq!(err.col, 1);
}

#[test]
fn duplicate_local_in_same_scope() {
    let err = analyze_err("void main(){ int a; int a; }");
    assert_eq!(err.kind, DiagKind::DuplicateDefinition);
}

#[test]
fn shadowing_in_inner_block_is_allowed() {
    analyze_ok("void main(){ int a = 1; { int a = 2; a = 3; } a = 4; }");
}

#[test]
fn undefined_symbol() {
    let err = analyze_err("void main(){ x = 1; }");
    assert_eq!(err.kind, DiagKind::UndefinedSymbol);
}

#[test]
fn undefined_function_call() {
    let err = analyze_err("void main(){ missing(); }");
    assert_eq!(err.kind, DiagKind::UndefinedSymbol);
}

#[test]
fn const_assignment_is_rejected() {
    let err = analyze_err("const int MAX = 10;\nvoid main(){ MAX = 11; }");
    assert_eq!(err.kind, DiagKind::ConstAssignment);
}

#[test]
fn local_const_assignment_is_rejected() {
    let err = analyze_err("void main(){ const int k = 1; k = 2; }");
    assert_eq!(err.kind, DiagKind::ConstAssignment);
}

#[test]
fn non_lvalue_assignment_is_rejected() {
    let err = analyze_err("void main(){ 1 = 2; }");
    assert_eq!(err.kind, DiagKind::NonLValueAssignment);
}

#[test]
fn type_mismatch_pointer_from_int() {
    let err = analyze_err("void main(){ int *p; p = 5; }");
    assert_eq!(err.kind, DiagKind::TypeMismatch);
}

#[test]
fn explicit_cast_allows_pointer_from_int() {
    analyze_ok("void main(){ int *p; p = (int*)5; }");
}

#[test]
fn field_not_found() {
    let err = analyze_err("struct P { int x; };\nvoid main(){ struct P p; p.z = 1; }");
    assert_eq!(err.kind, DiagKind::FieldNotFound);
}

#[test]
fn arity_mismatch_on_user_function() {
    let err = analyze_err("int f(int a){ return a; }\nvoid main(){ f(1, 2); }");
    assert_eq!(err.kind, DiagKind::ArityMismatch);
}

#[test]
fn arity_mismatch_on_intrinsic() {
    let err = analyze_err("void main(){ RTOS_DELAY_MS(); }");
    assert_eq!(err.kind, DiagKind::ArityMismatch);
}

#[test]
fn array_size_must_be_constant() {
    let err = analyze_err("void main(){ int n = 4; int buf[n]; }");
    assert_eq!(err.kind, DiagKind::ArraySizeNotConstant);
}

#[test]
fn macro_expanded_array_size_is_fine() {
    // After preprocessing, N is a literal; a constant expression also works.
    analyze_ok("void main(){ int buf[2 * 4]; buf[0] = 1; }");
}

#[test]
fn deref_of_non_pointer() {
    let err = analyze_err("void main(){ int a = 1; int b = *a; }");
    assert_eq!(err.kind, DiagKind::TypeMismatch);
}

#[test]
fn send_type_must_match_channel() {
    let err = analyze_err("struct P { int x; };\nmessage<int> Q;\nvoid main(){ struct P p; Q.send(p); }");
    assert_eq!(err.kind, DiagKind::TypeMismatch);
}

#[test]
fn recv_timeout_must_be_integer() {
    let err = analyze_err("message<int> Q;\nvoid main(){ int x = Q.recv(timeout: 1.5); }");
    assert_eq!(err.kind, DiagKind::TypeMismatch);
}

#[test]
fn send_recv_on_channels_type_check() {
    analyze_ok(
        "message<int> Q;\nvoid main(){ Q.send(3); int x = Q.recv(); int y = Q.recv(timeout: 10); }",
    );
}

#[test]
fn intrinsic_names_cannot_be_redefined() {
    let err = analyze_err("int RTOS_YIELD;\nvoid main(){}");
    assert_eq!(err.kind, DiagKind::DuplicateDefinition);
    let err = analyze_err("void StartTask(){}\nvoid main(){}");
    assert_eq!(err.kind, DiagKind::DuplicateDefinition);
}

#[test]
fn missing_main_is_an_error() {
    let err = analyze_err("void helper(){}");
    assert_eq!(err.kind, DiagKind::UndefinedSymbol);
    assert!(err.message.contains("main"));
}

#[test]
fn start_task_requires_constant_attributes_and_function() {
    analyze_ok("void run(){}\nvoid main(){ StartTask(1024, 0, 2, 1, run); }");

    let err = analyze_err("void run(){}\nvoid main(){ int s = 1024; StartTask(s, 0, 2, 1, run); }");
    assert_eq!(err.kind, DiagKind::TypeMismatch);

    let err = analyze_err("void main(){ StartTask(1024, 0, 2, 1, nothere); }");
    assert_eq!(err.kind, DiagKind::UndefinedSymbol);

    let err = analyze_err("void run(){}\nvoid main(){ StartTask(1024, 0, 2, run); }");
    assert_eq!(err.kind, DiagKind::ArityMismatch);
}

#[test]
fn break_outside_loop_is_rejected() {
    let err = analyze_err("void main(){ break; }");
    assert_eq!(err.kind, DiagKind::TypeMismatch);
}

#[test]
fn return_types_are_checked() {
    let err = analyze_err("int f(){ return; }\nvoid main(){ f(); }");
    assert_eq!(err.kind, DiagKind::TypeMismatch);
    let err = analyze_err("void f(){ return 1; }\nvoid main(){ f(); }");
    assert_eq!(err.kind, DiagKind::TypeMismatch);
}

#[test]
fn shift_amount_must_be_constant() {
    let err = analyze_err("void main(){ int a = 1; int b = 2; int c = a << b; }");
    assert_eq!(err.kind, DiagKind::TypeMismatch);
}

#[test]
fn addresses_and_ids_follow_declaration_order() {
    let a = analyze_ok(
        "int first;\nint second;\nmessage<int> Q1;\nmessage<float> Q2;\nvoid helper(){}\nvoid main(){ helper(); }",
    );
    assert_eq!(a.globals[0].name, "first");
    assert_eq!(a.globals[0].address, 0);
    assert_eq!(a.globals[1].address, 1);
    assert_eq!(a.messages[0].id, 0);
    assert_eq!(a.messages[1].id, 1);
    assert_eq!(a.functions[0].name, "helper");
    assert_eq!(a.functions[0].id, 0);
    assert_eq!(a.functions[1].name, "main");
    assert_eq!(a.functions[1].id, 1);
}

#[test]
fn frame_size_counts_params_and_locals() {
    let a = analyze_ok("int f(int a, int b){ int c = a; { int d = b; } return c; }\nvoid main(){ f(1, 2); }");
    let f = &a.functions[0];
    assert_eq!(f.frame_size, 4, "two params plus two locals");
}

#[test]
fn condition_accepts_numeric_bool_and_pointer() {
    analyze_ok(
        "void main(){ int i = 1; float f = 1.5; bool b = true; int *p = &i; if (i) {} if (f) {} if (b) {} if (p) {} while (i && b) { break; } }",
    );
}

#[test]
fn mixed_numeric_widening_is_implicit() {
    analyze_ok("void main(){ char c = 'a'; int i = c; float f = i + c; bool ok = i; }");
}

#[test]
fn sizeof_forms_type_check() {
    analyze_ok(
        "struct P { int x; int y; };\nvoid main(){ int a = sizeof(int); int b = sizeof(struct P); struct P p; int c = sizeof(p); int d = sizeof(P); }",
    );
}
