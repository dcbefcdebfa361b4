//! The RT-Micro-C virtual machine instruction set and program container.
//!
//! Opcode values are the byte written to the image; the order here is the
//! wire encoding and must not be rearranged.

use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    // Control
    Jump = 0,
    JumpIfTrue,
    JumpIfFalse,
    Call,
    Ret,
    Halt,
    Nop,
    Comment,
    // Data
    LoadConst,
    LoadVar,
    StoreVar,
    LoadStructMember,
    StoreStructMember,
    LoadStructMemberBit,
    StoreStructMemberBit,
    LoadAddr,
    LoadDeref,
    StoreDeref,
    // Memory
    AllocVar,
    FreeVar,
    AllocStruct,
    AllocFrame,
    FreeFrame,
    AllocArray,
    LoadArrayElem,
    StoreArrayElem,
    /// operands: global address, constant id of the initial value (-1 for
    /// aggregates initialized by the prelude), const flag.
    GlobalVarDeclare,
    // Arithmetic / logic
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    And,
    Or,
    Not,
    Xor,
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    // RTOS
    RtosCreateTask,
    RtosDeleteTask,
    RtosDelayMs,
    RtosYield,
    RtosSuspendTask,
    RtosResumeTask,
    RtosSemaphoreCreate,
    RtosSemaphoreTake,
    RtosSemaphoreGive,
    // Messaging
    /// operands: message id, element size in bytes.
    MsgDeclare,
    MsgSend,
    MsgRecv,
    // Hardware
    HwGpioInit,
    HwGpioSet,
    HwGpioGet,
    HwTimerInit,
    HwTimerStart,
    HwTimerStop,
    HwTimerSetPwmDuty,
    HwAdcInit,
    HwAdcRead,
    HwUartWrite,
    HwSpiTransfer,
    HwI2cWrite,
    HwI2cRead,
    // Debug
    Print,
    Printf,
    DbgBreakpoint,
    Syscall,
}

impl Opcode {
    pub fn mnemonic(self) -> &'static str {
        use Opcode::*;
        match self {
            Jump => "JUMP",
            JumpIfTrue => "JUMPIF_TRUE",
            JumpIfFalse => "JUMPIF_FALSE",
            Call => "CALL",
            Ret => "RET",
            Halt => "HALT",
            Nop => "NOP",
            Comment => "COMMENT",
            LoadConst => "LOAD_CONST",
            LoadVar => "LOAD_VAR",
            StoreVar => "STORE_VAR",
            LoadStructMember => "LOAD_STRUCT_MEMBER",
            StoreStructMember => "STORE_STRUCT_MEMBER",
            LoadStructMemberBit => "LOAD_STRUCT_MEMBER_BIT",
            StoreStructMemberBit => "STORE_STRUCT_MEMBER_BIT",
            LoadAddr => "LOAD_ADDR",
            LoadDeref => "LOAD_DEREF",
            StoreDeref => "STORE_DEREF",
            AllocVar => "ALLOC_VAR",
            FreeVar => "FREE_VAR",
            AllocStruct => "ALLOC_STRUCT",
            AllocFrame => "ALLOC_FRAME",
            FreeFrame => "FREE_FRAME",
            AllocArray => "ALLOC_ARRAY",
            LoadArrayElem => "LOAD_ARRAY_ELEM",
            StoreArrayElem => "STORE_ARRAY_ELEM",
            GlobalVarDeclare => "GLOBAL_VAR_DECLARE",
            Add => "ADD",
            Sub => "SUB",
            Mul => "MUL",
            Div => "DIV",
            Mod => "MOD",
            And => "AND",
            Or => "OR",
            Not => "NOT",
            Xor => "XOR",
            Eq => "EQ",
            Neq => "NEQ",
            Lt => "LT",
            Lte => "LTE",
            Gt => "GT",
            Gte => "GTE",
            RtosCreateTask => "RTOS_CREATE_TASK",
            RtosDeleteTask => "RTOS_DELETE_TASK",
            RtosDelayMs => "RTOS_DELAY_MS",
            RtosYield => "RTOS_YIELD",
            RtosSuspendTask => "RTOS_SUSPEND_TASK",
            RtosResumeTask => "RTOS_RESUME_TASK",
            RtosSemaphoreCreate => "RTOS_SEMAPHORE_CREATE",
            RtosSemaphoreTake => "RTOS_SEMAPHORE_TAKE",
            RtosSemaphoreGive => "RTOS_SEMAPHORE_GIVE",
            MsgDeclare => "MSG_DECLARE",
            MsgSend => "MSG_SEND",
            MsgRecv => "MSG_RECV",
            HwGpioInit => "HW_GPIO_INIT",
            HwGpioSet => "HW_GPIO_SET",
            HwGpioGet => "HW_GPIO_GET",
            HwTimerInit => "HW_TIMER_INIT",
            HwTimerStart => "HW_TIMER_START",
            HwTimerStop => "HW_TIMER_STOP",
            HwTimerSetPwmDuty => "HW_TIMER_SET_PWM_DUTY",
            HwAdcInit => "HW_ADC_INIT",
            HwAdcRead => "HW_ADC_READ",
            HwUartWrite => "HW_UART_WRITE",
            HwSpiTransfer => "HW_SPI_TRANSFER",
            HwI2cWrite => "HW_I2C_WRITE",
            HwI2cRead => "HW_I2C_READ",
            Print => "PRINT",
            Printf => "PRINTF",
            DbgBreakpoint => "DBG_BREAKPOINT",
            Syscall => "SYSCALL",
        }
    }
}

/// Constant pool entry: a tag byte plus four little-endian value bytes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Constant {
    I32(i32),
    U32(u32),
    F32(f32),
    /// Index into the string pool, pushed as a pointer-typed value.
    Ptr(u32),
}

impl Constant {
    pub fn tag(self) -> u8 {
        match self {
            Constant::I32(_) => 0,
            Constant::U32(_) => 1,
            Constant::F32(_) => 2,
            Constant::Ptr(_) => 3,
        }
    }

    pub fn value_bytes(self) -> [u8; 4] {
        match self {
            Constant::I32(v) => v.to_le_bytes(),
            Constant::U32(v) => v.to_le_bytes(),
            Constant::F32(v) => v.to_le_bytes(),
            Constant::Ptr(v) => v.to_le_bytes(),
        }
    }

    pub fn from_tag(tag: u8, bytes: [u8; 4]) -> Option<Constant> {
        Some(match tag {
            0 => Constant::I32(i32::from_le_bytes(bytes)),
            1 => Constant::U32(u32::from_le_bytes(bytes)),
            2 => Constant::F32(f32::from_le_bytes(bytes)),
            3 => Constant::Ptr(u32::from_le_bytes(bytes)),
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub operands: Vec<i64>,
    pub line: u32,
    pub col: u32,
}

impl Instruction {
    pub fn new(opcode: Opcode, operands: Vec<i64>) -> Self {
        Self {
            opcode,
            operands,
            line: 0,
            col: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Release,
    Debug,
}

impl Mode {
    pub fn as_u32(self) -> u32 {
        match self {
            Mode::Release => 0,
            Mode::Debug => 1,
        }
    }
}

/// The in-memory program image: what the serializer writes and the reader
/// reconstructs.
#[derive(Debug, Clone, PartialEq)]
pub struct BytecodeProgram {
    pub mode: Mode,
    pub instructions: Vec<Instruction>,
    pub constants: Vec<Constant>,
    pub strings: Vec<String>,
    /// (name, entry address), indexed by function id.
    pub functions: Vec<(String, u32)>,
    /// (name, global address); debug images only.
    pub symbols: Vec<(String, u32)>,
}

/// Human-readable listing, for `--verbose` output and tests.
pub fn disassemble(prog: &BytecodeProgram) -> String {
    use std::fmt::Write as _;
    let mut out = String::new();
    let _ = writeln!(out, "; mode: {:?}", prog.mode);
    for (i, c) in prog.constants.iter().enumerate() {
        let _ = writeln!(out, "; const {}: {:?}", i, c);
    }
    for (i, s) in prog.strings.iter().enumerate() {
        let _ = writeln!(out, "; string {}: {:?}", i, s);
    }
    for (id, (name, addr)) in prog.functions.iter().enumerate() {
        let _ = writeln!(out, "; fn {} {} @ {}", id, name, addr);
    }
    for (i, ins) in prog.instructions.iter().enumerate() {
        let ops = ins
            .operands
            .iter()
            .map(|o| o.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let _ = writeln!(out, "{:4}: {} {}", i, ins.opcode.mnemonic(), ops);
    }
    out
}
