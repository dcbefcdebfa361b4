use diag::DiagKind;
use lex::lex;

#[test]
fn unterminated_string_is_reported() {
    let err = lex("char *s = \"oops;\n").unwrap_err();
    assert_eq!(err.kind, DiagKind::LexUnterminatedLiteral);
    assert_eq!(err.line, 1);
    assert_eq!(err.col, 11);
}

#[test]
fn unterminated_char_is_reported() {
    let err = lex("char c = 'a\n").unwrap_err();
    assert_eq!(err.kind, DiagKind::LexUnterminatedLiteral);
}

#[test]
fn hex_without_digits_is_bad_number() {
    let err = lex("int x = 0x;").unwrap_err();
    assert_eq!(err.kind, DiagKind::LexBadNumber);
}

#[test]
fn number_with_trailing_letters_is_bad_number() {
    let err = lex("int x = 12ab;").unwrap_err();
    assert_eq!(err.kind, DiagKind::LexBadNumber);
}

#[test]
fn float_exponent_without_digits_is_bad_number() {
    let err = lex("float f = 1.5e;").unwrap_err();
    assert_eq!(err.kind, DiagKind::LexBadNumber);
}

#[test]
fn unknown_character_is_reported() {
    let err = lex("int x = 1 @ 2;").unwrap_err();
    assert_eq!(err.kind, DiagKind::LexBadChar);
    assert_eq!(err.col, 11);
}

#[test]
fn unknown_escape_is_bad_char() {
    let err = lex("char c = '\\q';").unwrap_err();
    assert_eq!(err.kind, DiagKind::LexBadChar);
}
