//! Bytecode decoding into a tuple stream (§4.1).
//!
//! This is the first stage of the per-method pipeline: a flat byte sequence
//! goes in, an ordered list of [`Tuple`] values comes out, one per
//! instruction, with program counters preserved so branch targets can be
//! resolved later against the same pc space.

use crate::classfile::{ConstantPool, Descriptor};
use crate::common::Id;
use crate::error::CompileError;
use crate::opcode::{ArithOp, CmpOp, Opcode};

/// The payload carried by a decoded instruction, if any.
#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    None,
    IntLiteral(i32),
    Local(u8),
    BranchTarget(u32),
    StaticCall { name: Id, descriptor: Descriptor },
}

/// One decoded bytecode instruction.
#[derive(Clone, Debug, PartialEq)]
pub struct Tuple {
    pub pc: u32,
    pub opcode: Opcode,
    pub operand: Operand,
}

impl Tuple {
    /// The pc immediately following this tuple, i.e. where a fall-through
    /// successor begins.
    pub fn next_pc(&self) -> u32 {
        self.pc + 1 + self.opcode.operand_len() as u32
    }

    /// The branch target this tuple jumps to, if it is any kind of branch.
    pub fn branch_target(&self) -> Option<u32> {
        match &self.operand {
            Operand::BranchTarget(t) => Some(*t),
            _ => None,
        }
    }

    pub fn is_unconditional_branch(&self) -> bool {
        matches!(self.opcode, Opcode::Goto)
    }

    pub fn is_conditional_branch(&self) -> bool {
        matches!(self.opcode, Opcode::IfICmp(_) | Opcode::IfZ(_))
    }

    pub fn is_return(&self) -> bool {
        matches!(self.opcode, Opcode::Return | Opcode::IReturn)
    }

    pub fn is_terminator(&self) -> bool {
        self.is_unconditional_branch() || self.is_conditional_branch() || self.is_return()
    }
}

fn read_u8(code: &[u8], pc: u32, method: Id) -> Result<u8, CompileError> {
    code.get(pc as usize)
        .copied()
        .ok_or_else(|| CompileError::MalformedBytecode {
            method,
            pc,
            detail: "truncated operand".into(),
        })
}

fn read_u16(code: &[u8], pc: u32, method: Id) -> Result<u16, CompileError> {
    let hi = read_u8(code, pc, method)? as u16;
    let lo = read_u8(code, pc + 1, method)? as u16;
    Ok((hi << 8) | lo)
}

fn read_i16(code: &[u8], pc: u32, method: Id) -> Result<i16, CompileError> {
    Ok(read_u16(code, pc, method)? as i16)
}

/// Decode a method's raw code into an ordered tuple stream.
pub fn decode(
    method: Id,
    code: &[u8],
    constants: &ConstantPool,
) -> Result<Vec<Tuple>, CompileError> {
    let mut tuples = Vec::new();
    let mut pc: u32 = 0;

    while (pc as usize) < code.len() {
        let byte = code[pc as usize];
        let (opcode, operand) = decode_one(method, code, pc, byte, constants)?;
        tuples.push(Tuple { pc, opcode, operand });
        pc += 1 + opcode.operand_len() as u32;
    }

    Ok(tuples)
}

fn decode_one(
    method: Id,
    code: &[u8],
    pc: u32,
    byte: u8,
    constants: &ConstantPool,
) -> Result<(Opcode, Operand), CompileError> {
    let malformed = |detail: &str| CompileError::MalformedBytecode {
        method,
        pc,
        detail: detail.to_string(),
    };

    Ok(match byte {
        0x00 => (Opcode::IConst0, Operand::None),
        0x01 => (Opcode::IConst1, Operand::None),
        0x02 => {
            let index = read_u8(code, pc + 1, method)?;
            let value = constants.integer(index as u16).ok_or_else(|| {
                malformed(&format!("constant pool index {index} is not an integer"))
            })?;
            (Opcode::Ldc, Operand::IntLiteral(value))
        }
        0x03 => {
            let index = read_u8(code, pc + 1, method)?;
            (Opcode::ILoad, Operand::Local(index))
        }
        0x04 => {
            let index = read_u8(code, pc + 1, method)?;
            (Opcode::IStore, Operand::Local(index))
        }
        0x05 => (Opcode::IArith(ArithOp::Add), Operand::None),
        0x06 => (Opcode::IArith(ArithOp::Sub), Operand::None),
        0x07 => (Opcode::IArith(ArithOp::Mul), Operand::None),
        0x08 => (Opcode::IArith(ArithOp::Div), Operand::None),
        0x09 => (Opcode::IArith(ArithOp::Rem), Operand::None),
        0x0a => (Opcode::INeg, Operand::None),
        0x0b => (Opcode::Dup, Operand::None),
        0x0c => (Opcode::Pop, Operand::None),
        0x0d => {
            let index = read_u16(code, pc + 1, method)?;
            let (name, descriptor) = constants
                .method_ref(index)
                .ok_or_else(|| malformed(&format!("constant pool index {index} is not a method")))?;
            (
                Opcode::InvokeStatic,
                Operand::StaticCall { name, descriptor: descriptor.clone() },
            )
        }
        0x10..=0x15 => {
            let cmp = match byte {
                0x10 => CmpOp::Eq,
                0x11 => CmpOp::Ne,
                0x12 => CmpOp::Lt,
                0x13 => CmpOp::Le,
                0x14 => CmpOp::Gt,
                0x15 => CmpOp::Ge,
                _ => unreachable!(),
            };
            let disp = read_i16(code, pc + 1, method)?;
            let target = (pc as i64 + disp as i64) as u32;
            (Opcode::IfICmp(cmp), Operand::BranchTarget(target))
        }
        0x16 => {
            let disp = read_i16(code, pc + 1, method)?;
            let target = (pc as i64 + disp as i64) as u32;
            (Opcode::IfZ(CmpOp::Eq), Operand::BranchTarget(target))
        }
        0x17 => {
            let disp = read_i16(code, pc + 1, method)?;
            let target = (pc as i64 + disp as i64) as u32;
            (Opcode::IfZ(CmpOp::Ne), Operand::BranchTarget(target))
        }
        0x18 => {
            let disp = read_i16(code, pc + 1, method)?;
            let target = (pc as i64 + disp as i64) as u32;
            (Opcode::Goto, Operand::BranchTarget(target))
        }
        0x19 => (Opcode::Return, Operand::None),
        0x1a => (Opcode::IReturn, Operand::None),
        other => {
            return Err(CompileError::MalformedBytecode {
                method,
                pc,
                detail: format!("unknown opcode byte {other:#04x}"),
            })
        }
    })
}
