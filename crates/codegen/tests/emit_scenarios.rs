use codegen::{generate, BytecodeProgram, Constant, Mode, Opcode, LOCAL_BASE};

fn compile(src: &str, mode: Mode) -> BytecodeProgram {
    let prog = parse::parse_source(src).expect("parse");
    let analysis = sema::analyze(&prog).expect("analyze");
    let folded = sema::fold::fold_program(prog);
    generate(&folded, &analysis, mode).expect("codegen")
}

fn const_i32(prog: &BytecodeProgram, id: i64) -> i32 {
    match prog.constants[id as usize] {
        Constant::I32(v) => v,
        other => panic!("expected i32 constant, got {:?}", other),
    }
}

// LED blink: one RTOS_CREATE_TASK with immediate attributes and the task
// entry address; the loop closes with a jump to an earlier address.
#[test]
fn led_blink_task_creation_and_loop() {
    let src = "\
void run(){ HW_GPIO_INIT(13,1); while(1){ HW_GPIO_SET(13,1); RTOS_DELAY_MS(500); HW_GPIO_SET(13,0); RTOS_DELAY_MS(500);} }
void main(){ StartTask(1024,0,2,1,run); }";
    let prog = compile(src, Mode::Release);

    let creates: Vec<_> = prog
        .instructions
        .iter()
        .filter(|i| i.opcode == Opcode::RtosCreateTask)
        .collect();
    assert_eq!(creates.len(), 1);
    let ops = &creates[0].operands;
    assert_eq!(&ops[..4], &[1024, 0, 2, 1]);
    let run_addr = prog.functions.iter().find(|(n, _)| n == "run").unwrap().1;
    assert_eq!(ops[4], run_addr as i64);

    // The while(1) body ends in a jump back before the first HW_GPIO_SET.
    let first_set = prog
        .instructions
        .iter()
        .position(|i| i.opcode == Opcode::HwGpioSet)
        .unwrap();
    let back_jump = prog
        .instructions
        .iter()
        .enumerate()
        .find(|(i, ins)| ins.opcode == Opcode::Jump && ins.operands[0] <= *i as i64)
        .expect("loop jump");
    assert!(
        back_jump.1.operands[0] <= first_set as i64,
        "loop target {} not before first HW_GPIO_SET at {}",
        back_jump.1.operands[0],
        first_set
    );
}

// recv lowers to a timeout push then MSG_RECV; no argument means -1.
#[test]
fn recv_timeout_shapes() {
    let src = "\
message<int> Q;
void main(){ int x = Q.recv(timeout: 500); int y = Q.recv(); }";
    let prog = compile(src, Mode::Release);

    let recv_sites: Vec<usize> = prog
        .instructions
        .iter()
        .enumerate()
        .filter(|(_, i)| i.opcode == Opcode::MsgRecv)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(recv_sites.len(), 2);

    for (site, expected) in recv_sites.iter().zip([500, -1]) {
        let prev = &prog.instructions[site - 1];
        assert_eq!(prev.opcode, Opcode::LoadConst);
        assert_eq!(const_i32(&prog, prev.operands[0]), expected);
        assert_eq!(prog.instructions[*site].operands, vec![0]);
        let next = &prog.instructions[site + 1];
        assert_eq!(next.opcode, Opcode::StoreVar);
    }
}

// Pointer init uses LOAD_ADDR; a double deref issues two LOAD_DEREFs.
#[test]
fn pointer_chain_uses_load_addr_and_two_derefs() {
    let src = "void main(){ int a=10; int *p=&a; int **pp=&p; int r=**pp; }";
    let prog = compile(src, Mode::Release);

    let load_addrs: Vec<_> = prog
        .instructions
        .iter()
        .filter(|i| i.opcode == Opcode::LoadAddr)
        .collect();
    assert_eq!(load_addrs.len(), 2, "one for &a, one for &p");
    assert_eq!(load_addrs[0].operands[0], LOCAL_BASE);
    assert_eq!(load_addrs[1].operands[0], LOCAL_BASE + 1);

    let derefs: Vec<usize> = prog
        .instructions
        .iter()
        .enumerate()
        .filter(|(_, i)| i.opcode == Opcode::LoadDeref)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(derefs.len(), 2);
    assert_eq!(derefs[1], derefs[0] + 1, "derefs are back to back");
}

// Globals and channels are declared before main runs.
#[test]
fn prelude_declares_globals_and_channels() {
    let src = "\
int counter = 5;
const int LIMIT = 10;
message<int> Events;
void main(){ counter = LIMIT; }";
    let prog = compile(src, Mode::Release);

    let g0 = &prog.instructions[0];
    assert_eq!(g0.opcode, Opcode::GlobalVarDeclare);
    assert_eq!(g0.operands[0], 0);
    assert_eq!(const_i32(&prog, g0.operands[1]), 5);
    assert_eq!(g0.operands[2], 0);

    let g1 = &prog.instructions[1];
    assert_eq!(g1.opcode, Opcode::GlobalVarDeclare);
    assert_eq!(g1.operands[0], 1);
    assert_eq!(const_i32(&prog, g1.operands[1]), 10);
    assert_eq!(g1.operands[2], 1);

    let m = &prog.instructions[2];
    assert_eq!(m.opcode, Opcode::MsgDeclare);
    assert_eq!(m.operands, vec![0, 4]);

    let call = &prog.instructions[3];
    assert_eq!(call.opcode, Opcode::Call);
    assert_eq!(prog.instructions[4].opcode, Opcode::Halt);
}

// Calls push arguments left to right; frames are allocated and torn down.
#[test]
fn call_and_frame_shape() {
    let src = "int add(int a, int b){ return a + b; } void main(){ int r = add(1, 2); }";
    let prog = compile(src, Mode::Release);

    let add_id = prog.functions.iter().position(|(n, _)| n == "add").unwrap();
    let add_addr = prog.functions[add_id].1 as usize;
    assert_eq!(prog.instructions[add_addr].opcode, Opcode::AllocFrame);
    assert_eq!(prog.instructions[add_addr].operands, vec![2]);

    let call_site = prog
        .instructions
        .iter()
        .position(|i| i.opcode == Opcode::Call && i.operands[0] == add_id as i64)
        .unwrap();
    assert_eq!(prog.instructions[call_site].operands[1], 2);
    assert_eq!(prog.instructions[call_site - 1].opcode, Opcode::LoadConst);
    assert_eq!(const_i32(&prog, prog.instructions[call_site - 1].operands[0]), 2);
    assert_eq!(const_i32(&prog, prog.instructions[call_site - 2].operands[0]), 1);

    // Every RET is preceded by FREE_FRAME.
    for (i, ins) in prog.instructions.iter().enumerate() {
        if ins.opcode == Opcode::Ret {
            assert_eq!(prog.instructions[i - 1].opcode, Opcode::FreeFrame);
        }
    }
}

// Debug output interns the text and counts the formatted arguments.
#[test]
fn print_and_printf_emission() {
    let src = "void main(){ int v = 7; DBG_PRINT(\"boot\"); DBG_PRINTF(\"v={}\", v); }";
    let prog = compile(src, Mode::Release);

    let print = prog
        .instructions
        .iter()
        .find(|i| i.opcode == Opcode::Print)
        .unwrap();
    assert_eq!(prog.strings[print.operands[0] as usize], "boot");

    let printf = prog
        .instructions
        .iter()
        .find(|i| i.opcode == Opcode::Printf)
        .unwrap();
    assert_eq!(prog.strings[printf.operands[0] as usize], "v={}");
    assert_eq!(printf.operands[1], 1);
}

// Short-circuit && jumps over the right operand.
#[test]
fn logical_and_short_circuits() {
    let src = "void main(){ int a = 1; int b = 2; if (a && b) { a = 3; } }";
    let prog = compile(src, Mode::Release);
    let jumps = prog
        .instructions
        .iter()
        .filter(|i| i.opcode == Opcode::JumpIfFalse)
        .count();
    // Two from the && lowering, one from the if itself.
    assert_eq!(jumps, 3);
}

// Bit-field stores carry (base, byte offset, bit offset, width).
#[test]
fn bit_field_store_operands() {
    let src = "\
struct Halves { int lo : 16; int hi : 16; };
void main(){ struct Halves h; h.hi = 3; }";
    let prog = compile(src, Mode::Release);
    let store = prog
        .instructions
        .iter()
        .find(|i| i.opcode == Opcode::StoreStructMemberBit)
        .unwrap();
    assert_eq!(store.operands, vec![LOCAL_BASE, 0, 16, 16]);
}

// Struct member access resolves offsets at compile time.
#[test]
fn struct_member_offsets_are_immediate() {
    let src = "\
struct Point { int x; int y; };
void main(){ struct Point p; p.y = 9; int v = p.y; }";
    let prog = compile(src, Mode::Release);
    let store = prog
        .instructions
        .iter()
        .find(|i| i.opcode == Opcode::StoreStructMember)
        .unwrap();
    assert_eq!(store.operands, vec![LOCAL_BASE, 4]);
    let load = prog
        .instructions
        .iter()
        .find(|i| i.opcode == Opcode::LoadStructMember)
        .unwrap();
    assert_eq!(load.operands, vec![LOCAL_BASE, 4]);
}

// Arrays allocate element storage and index through the dedicated opcodes.
#[test]
fn array_alloc_and_element_access() {
    let src = "void main(){ int buf[4]; buf[2] = 5; int v = buf[2]; }";
    let prog = compile(src, Mode::Release);

    let alloc = prog
        .instructions
        .iter()
        .find(|i| i.opcode == Opcode::AllocArray)
        .unwrap();
    assert_eq!(alloc.operands, vec![4, 4]);

    let store = prog
        .instructions
        .iter()
        .find(|i| i.opcode == Opcode::StoreArrayElem)
        .unwrap();
    assert_eq!(store.operands, vec![LOCAL_BASE, 4]);
    let load = prog
        .instructions
        .iter()
        .find(|i| i.opcode == Opcode::LoadArrayElem)
        .unwrap();
    assert_eq!(load.operands, vec![LOCAL_BASE, 4]);
}

// Arrow access through a pointer variable stays a single instruction.
#[test]
fn arrow_access_uses_struct_member_opcode() {
    let src = "\
struct Point { int x; int y; };
void main(){ struct Point p; struct Point *q; q = &p; q->y = 4; }";
    let prog = compile(src, Mode::Release);
    let store = prog
        .instructions
        .iter()
        .filter(|i| i.opcode == Opcode::StoreStructMember)
        .last()
        .unwrap();
    assert_eq!(store.operands, vec![LOCAL_BASE + 1, 4]);
}

// Release strips positions; debug keeps them and adds COMMENT markers.
#[test]
fn debug_mode_keeps_positions_and_comments() {
    let src = "void main(){ int x = 1; }";
    let release = compile(src, Mode::Release);
    let debug = compile(src, Mode::Debug);

    assert!(release.instructions.iter().all(|i| i.line == 0 && i.col == 0));
    assert!(release
        .instructions
        .iter()
        .all(|i| i.opcode != Opcode::Comment));
    assert!(debug.instructions.iter().any(|i| i.opcode == Opcode::Comment));
    assert!(debug.instructions.iter().any(|i| i.line > 0));
}

// Shifts lower to power-of-two multiply/divide.
#[test]
fn shifts_lower_to_mul_div() {
    let src = "void main(){ int x = 3; int y = x << 2; int z = x >> 1; }";
    let prog = compile(src, Mode::Release);
    let mul = prog
        .instructions
        .iter()
        .position(|i| i.opcode == Opcode::Mul)
        .unwrap();
    assert_eq!(
        const_i32(&prog, prog.instructions[mul - 1].operands[0]),
        4
    );
    let div = prog
        .instructions
        .iter()
        .position(|i| i.opcode == Opcode::Div)
        .unwrap();
    assert_eq!(
        const_i32(&prog, prog.instructions[div - 1].operands[0]),
        2
    );
}
