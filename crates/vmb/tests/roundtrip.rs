use codegen::{generate, BytecodeProgram, Mode};
use vmb::{read_image, write_image};

fn compile(src: &str, mode: Mode) -> BytecodeProgram {
    let prog = parse::parse_source(src).expect("parse");
    let analysis = sema::analyze(&prog).expect("analyze");
    let folded = sema::fold::fold_program(prog);
    generate(&folded, &analysis, mode).expect("codegen")
}

const SAMPLE: &str = "\
struct State { int mode : 4; int level : 8; };
message<int> Q;
int ticks = 0;
void worker(){ while (1) { int v = Q.recv(timeout: 100); ticks += v; RTOS_YIELD(); } }
void main(){ DBG_PRINT(\"up\"); StartTask(512, 0, 1, 1, worker); }";

#[test]
fn release_roundtrip_reproduces_program() {
    let prog = compile(SAMPLE, Mode::Release);
    let bytes = write_image(&prog).unwrap();
    let back = read_image(&bytes).unwrap();
    assert_eq!(back, prog);
}

#[test]
fn debug_roundtrip_keeps_positions_and_symbols() {
    let prog = compile(SAMPLE, Mode::Debug);
    let bytes = write_image(&prog).unwrap();
    let back = read_image(&bytes).unwrap();
    assert_eq!(back, prog);
    assert!(back.instructions.iter().any(|i| i.line > 0));
    assert_eq!(back.symbols.len(), 1);
    assert_eq!(back.symbols[0].0, "ticks");
}

#[test]
fn release_mode_is_deterministic() {
    let a = write_image(&compile(SAMPLE, Mode::Release)).unwrap();
    let b = write_image(&compile(SAMPLE, Mode::Release)).unwrap();
    assert_eq!(a, b);
}

#[test]
fn header_counts_match_pools() {
    let prog = compile(SAMPLE, Mode::Release);
    let bytes = write_image(&prog).unwrap();
    assert_eq!(&bytes[0..4], b"RTMC");
    let field = |i: usize| u32::from_le_bytes(bytes[i..i + 4].try_into().unwrap());
    assert_eq!(field(4), 1, "version");
    assert_eq!(field(8), 0, "release mode word");
    assert_eq!(field(12) as usize, prog.instructions.len());
    assert_eq!(field(16) as usize, prog.constants.len());
    assert_eq!(field(20) as usize, prog.strings.len());
    assert_eq!(field(24) as usize, prog.functions.len());
    assert_eq!(field(28), 0, "no symbols in release");
}

#[test]
fn corrupted_body_fails_checksum() {
    let prog = compile(SAMPLE, Mode::Release);
    let mut bytes = write_image(&prog).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    let err = read_image(&bytes).unwrap_err();
    assert!(err.to_string().contains("checksum"), "{}", err);
}

#[test]
fn truncated_image_is_rejected() {
    let prog = compile(SAMPLE, Mode::Release);
    let bytes = write_image(&prog).unwrap();
    let err = read_image(&bytes[..bytes.len() / 2]).unwrap_err();
    assert!(!err.to_string().is_empty());
}

#[test]
fn bad_magic_is_rejected() {
    let err = read_image(b"NOPE\x00\x00\x00\x00").unwrap_err();
    assert!(err.to_string().contains("magic"), "{}", err);
}
