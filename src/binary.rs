use crate::instruction::{Instruction, Opcode, OperandLayout};
use crate::program::{Constant, Function, Program};
use crate::types::Ty;

pub const MAGIC: u32 = 0x4330_3A29;
pub const VERSION: u32 = 1;

/// Failures while parsing a `.o` file. Decoding validates everything the VM
/// relies on: magic, version, constant kinds, opcode bytes, name indices.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecodeError {
    UnexpectedEof,
    BadMagic(u32),
    BadVersion(u32),
    BadConstantKind(u8),
    BadOpcode(u8),
    BadUtf8,
    BadNameConstant(u16),
    TrailingBytes(usize),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::UnexpectedEof => write!(f, "file ends in the middle of a record"),
            DecodeError::BadMagic(m) => {
                write!(f, "bad magic 0x{:08X} (expected 0x{:08X})", m, MAGIC)
            }
            DecodeError::BadVersion(v) => write!(f, "unsupported format version {}", v),
            DecodeError::BadConstantKind(k) => write!(f, "unknown constant kind {}", k),
            DecodeError::BadOpcode(op) => write!(f, "unknown opcode 0x{:02X}", op),
            DecodeError::BadUtf8 => write!(f, "string constant is not valid UTF-8"),
            DecodeError::BadNameConstant(i) => {
                write!(f, "function name index {} is not a string constant", i)
            }
            DecodeError::TrailingBytes(n) => write!(f, "{} trailing byte(s) after the last function", n),
        }
    }
}

impl std::error::Error for DecodeError {}

// --- Encoding ---

pub fn encode(program: &Program) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC.to_be_bytes());
    out.extend_from_slice(&VERSION.to_be_bytes());

    out.extend_from_slice(&(program.constants.len() as u16).to_be_bytes());
    for constant in &program.constants {
        out.push(constant.kind_tag());
        match constant {
            Constant::S(s) => {
                out.extend_from_slice(&(s.len() as u16).to_be_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            Constant::I(v) => out.extend_from_slice(&v.to_be_bytes()),
            Constant::D(v) => out.extend_from_slice(&v.to_bits().to_be_bytes()),
        }
    }

    out.extend_from_slice(&(program.start.len() as u16).to_be_bytes());
    for ins in &program.start {
        encode_instruction(ins, &mut out);
    }

    out.extend_from_slice(&(program.functions.len() as u16).to_be_bytes());
    for func in &program.functions {
        out.extend_from_slice(&func.name_const.to_be_bytes());
        out.extend_from_slice(&func.param_slots.to_be_bytes());
        out.extend_from_slice(&func.level.to_be_bytes());
        out.extend_from_slice(&(func.ins.len() as u16).to_be_bytes());
        for ins in &func.ins {
            encode_instruction(ins, &mut out);
        }
    }
    out
}

fn encode_instruction(ins: &Instruction, out: &mut Vec<u8>) {
    out.push(ins.op as u8);
    match ins.op.layout() {
        OperandLayout::None => {}
        OperandLayout::I8 => out.push(ins.x as i8 as u8),
        OperandLayout::I32 => out.extend_from_slice(&ins.x.to_be_bytes()),
        OperandLayout::U16 => out.extend_from_slice(&(ins.x as u16).to_be_bytes()),
        OperandLayout::U16I32 => {
            out.extend_from_slice(&(ins.x as u16).to_be_bytes());
            out.extend_from_slice(&ins.y.to_be_bytes());
        }
    }
}

// --- Decoding ---

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.pos + n > self.bytes.len() {
            return Err(DecodeError::UnexpectedEof);
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn f64(&mut self) -> Result<f64, DecodeError> {
        Ok(f64::from_bits(u64::from_be_bytes(
            self.take(8)?.try_into().unwrap(),
        )))
    }
}

pub fn decode(bytes: &[u8]) -> Result<Program, DecodeError> {
    let mut cur = Cursor { bytes, pos: 0 };

    let magic = cur.u32()?;
    if magic != MAGIC {
        return Err(DecodeError::BadMagic(magic));
    }
    let version = cur.u32()?;
    if version != VERSION {
        return Err(DecodeError::BadVersion(version));
    }

    let const_count = cur.u16()?;
    let mut constants = Vec::with_capacity(const_count as usize);
    for _ in 0..const_count {
        let kind = cur.u8()?;
        constants.push(match kind {
            0 => {
                let len = cur.u16()? as usize;
                let text = std::str::from_utf8(cur.take(len)?)
                    .map_err(|_| DecodeError::BadUtf8)?;
                Constant::S(text.to_string())
            }
            1 => Constant::I(cur.i32()?),
            2 => Constant::D(cur.f64()?),
            other => return Err(DecodeError::BadConstantKind(other)),
        });
    }

    let start_count = cur.u16()?;
    let mut start = Vec::with_capacity(start_count as usize);
    for _ in 0..start_count {
        start.push(decode_instruction(&mut cur)?);
    }

    let func_count = cur.u16()?;
    let mut functions = Vec::with_capacity(func_count as usize);
    for index in 0..func_count {
        let name_const = cur.u16()?;
        let param_slots = cur.u16()?;
        let level = cur.u16()?;
        let name = match constants.get(name_const as usize) {
            Some(Constant::S(s)) => s.clone(),
            _ => return Err(DecodeError::BadNameConstant(name_const)),
        };
        let ins_count = cur.u16()?;
        let mut ins = Vec::with_capacity(ins_count as usize);
        for _ in 0..ins_count {
            ins.push(decode_instruction(&mut cur)?);
        }
        // The signature is not part of the wire format; the VM only needs
        // the header fields and the name.
        functions.push(Function {
            name_const,
            name,
            index,
            return_ty: Ty::Void,
            params: Vec::new(),
            param_slots,
            level,
            ins,
        });
    }

    if cur.pos != bytes.len() {
        return Err(DecodeError::TrailingBytes(bytes.len() - cur.pos));
    }

    Ok(Program {
        constants,
        start,
        functions,
    })
}

fn decode_instruction(cur: &mut Cursor<'_>) -> Result<Instruction, DecodeError> {
    let byte = cur.u8()?;
    let op = Opcode::from_byte(byte).ok_or(DecodeError::BadOpcode(byte))?;
    let (x, y) = match op.layout() {
        OperandLayout::None => (0, 0),
        OperandLayout::I8 => (cur.u8()? as i8 as i32, 0),
        OperandLayout::I32 => (cur.i32()?, 0),
        OperandLayout::U16 => (cur.u16()? as i32, 0),
        OperandLayout::U16I32 => (cur.u16()? as i32, cur.i32()?),
    };
    Ok(Instruction { op, x, y })
}
