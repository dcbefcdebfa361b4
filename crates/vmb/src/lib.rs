//! The `.vmb` binary container.
//!
//! Little-endian throughout. Layout:
//!
//! ```text
//! header:
//!   magic           : 4 bytes  'R' 'T' 'M' 'C'
//!   version         : u32 = 1
//!   mode            : u32      (0 = release, 1 = debug)
//!   instruction_cnt : u32
//!   constant_cnt    : u32
//!   string_cnt      : u32
//!   function_cnt    : u32
//!   symbol_cnt      : u32
//!   checksum        : u32      CRC-32 of everything after the header
//! instructions[]    : opcode u8, operand_count u8, operands i64 each,
//!                     then line u32 + col u32 in debug mode
//! constants[]       : tag u8, 4 value bytes
//! strings[]         : length u16, bytes
//! functions[]       : name_len u8, name, address u32
//! symbols[]         : name_len u8, name, address u32   (debug only)
//! ```

use codegen::{BytecodeProgram, Constant, Instruction, Mode, Opcode};
use thiserror::Error;

pub const MAGIC: [u8; 4] = *b"RTMC";
pub const VERSION: u32 = 1;

const HEADER_LEN: usize = 4 + 8 * 4;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("not a vmb image: bad magic")]
    BadMagic,
    #[error("unsupported vmb version: {0}")]
    UnsupportedVersion(u32),
    #[error("invalid mode word: {0}")]
    InvalidMode(u32),
    #[error("vmb checksum mismatch")]
    ChecksumMismatch,
    #[error("truncated vmb image")]
    Truncated,
    #[error("invalid opcode byte: {0}")]
    InvalidOpcode(u8),
    #[error("invalid constant tag: {0}")]
    InvalidConstantTag(u8),
    #[error("instruction has too many operands")]
    TooManyOperands,
    #[error("name too long: {0}")]
    NameTooLong(String),
    #[error("string too long for the pool")]
    StringTooLong,
    #[error("string pool entry is not UTF-8")]
    BadUtf8(#[from] std::string::FromUtf8Error),
}

pub type Result<T> = std::result::Result<T, ImageError>;

/// Serialize a program image to bytes.
pub fn write_image(prog: &BytecodeProgram) -> Result<Vec<u8>> {
    let debug = prog.mode == Mode::Debug;
    let mut body = Vec::new();

    for ins in &prog.instructions {
        body.push(u8::from(ins.opcode));
        let count =
            u8::try_from(ins.operands.len()).map_err(|_| ImageError::TooManyOperands)?;
        body.push(count);
        for op in &ins.operands {
            body.extend_from_slice(&op.to_le_bytes());
        }
        if debug {
            body.extend_from_slice(&ins.line.to_le_bytes());
            body.extend_from_slice(&ins.col.to_le_bytes());
        }
    }

    for c in &prog.constants {
        body.push(c.tag());
        body.extend_from_slice(&c.value_bytes());
    }

    for s in &prog.strings {
        let bytes = s.as_bytes();
        let len = u16::try_from(bytes.len()).map_err(|_| ImageError::StringTooLong)?;
        body.extend_from_slice(&len.to_le_bytes());
        body.extend_from_slice(bytes);
    }

    for (name, address) in &prog.functions {
        write_named_entry(&mut body, name, *address)?;
    }

    let symbols: &[(String, u32)] = if debug { &prog.symbols } else { &[] };
    for (name, address) in symbols {
        write_named_entry(&mut body, name, *address)?;
    }

    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&prog.mode.as_u32().to_le_bytes());
    out.extend_from_slice(&(prog.instructions.len() as u32).to_le_bytes());
    out.extend_from_slice(&(prog.constants.len() as u32).to_le_bytes());
    out.extend_from_slice(&(prog.strings.len() as u32).to_le_bytes());
    out.extend_from_slice(&(prog.functions.len() as u32).to_le_bytes());
    out.extend_from_slice(&(symbols.len() as u32).to_le_bytes());
    out.extend_from_slice(&crc32(&body).to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

fn write_named_entry(body: &mut Vec<u8>, name: &str, address: u32) -> Result<()> {
    let bytes = name.as_bytes();
    let len =
        u8::try_from(bytes.len()).map_err(|_| ImageError::NameTooLong(name.to_string()))?;
    body.push(len);
    body.extend_from_slice(bytes);
    body.extend_from_slice(&address.to_le_bytes());
    Ok(())
}

/// Read an image back, validating magic, version, and checksum.
pub fn read_image(bytes: &[u8]) -> Result<BytecodeProgram> {
    let mut r = Reader { bytes, pos: 0 };

    let magic = r.take(4)?;
    if magic != MAGIC {
        return Err(ImageError::BadMagic);
    }
    let version = r.u32()?;
    if version != VERSION {
        return Err(ImageError::UnsupportedVersion(version));
    }
    let mode = match r.u32()? {
        0 => Mode::Release,
        1 => Mode::Debug,
        other => return Err(ImageError::InvalidMode(other)),
    };
    let instruction_cnt = r.u32()? as usize;
    let constant_cnt = r.u32()? as usize;
    let string_cnt = r.u32()? as usize;
    let function_cnt = r.u32()? as usize;
    let symbol_cnt = r.u32()? as usize;
    let checksum = r.u32()?;

    let body = &bytes[r.pos..];
    if crc32(body) != checksum {
        return Err(ImageError::ChecksumMismatch);
    }
    let debug = mode == Mode::Debug;

    let mut instructions = Vec::with_capacity(instruction_cnt);
    for _ in 0..instruction_cnt {
        let opcode_byte = r.u8()?;
        let opcode =
            Opcode::try_from(opcode_byte).map_err(|_| ImageError::InvalidOpcode(opcode_byte))?;
        let count = r.u8()? as usize;
        let mut operands = Vec::with_capacity(count);
        for _ in 0..count {
            operands.push(r.i64()?);
        }
        let mut ins = Instruction::new(opcode, operands);
        if debug {
            ins.line = r.u32()?;
            ins.col = r.u32()?;
        }
        instructions.push(ins);
    }

    let mut constants = Vec::with_capacity(constant_cnt);
    for _ in 0..constant_cnt {
        let tag = r.u8()?;
        let mut value = [0u8; 4];
        value.copy_from_slice(r.take(4)?);
        let c = Constant::from_tag(tag, value).ok_or(ImageError::InvalidConstantTag(tag))?;
        constants.push(c);
    }

    let mut strings = Vec::with_capacity(string_cnt);
    for _ in 0..string_cnt {
        let len = r.u16()? as usize;
        let raw = r.take(len)?;
        strings.push(String::from_utf8(raw.to_vec())?);
    }

    let mut functions = Vec::with_capacity(function_cnt);
    for _ in 0..function_cnt {
        functions.push(read_named_entry(&mut r)?);
    }
    let mut symbols = Vec::with_capacity(symbol_cnt);
    for _ in 0..symbol_cnt {
        symbols.push(read_named_entry(&mut r)?);
    }

    Ok(BytecodeProgram {
        mode,
        instructions,
        constants,
        strings,
        functions,
        symbols,
    })
}

fn read_named_entry(r: &mut Reader<'_>) -> Result<(String, u32)> {
    let len = r.u8()? as usize;
    let raw = r.take(len)?;
    let name = String::from_utf8(raw.to_vec())?;
    let address = r.u32()?;
    Ok((name, address))
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(ImageError::Truncated);
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }
    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }
    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }
    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
    fn i64(&mut self) -> Result<i64> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(i64::from_le_bytes(raw))
    }
}

/// Reflected CRC-32 (polynomial 0xEDB88320), as used by zip and friends.
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &b in data {
        crc ^= b as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_known_vectors() {
        assert_eq!(crc32(b""), 0);
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }
}
