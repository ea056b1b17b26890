//! Abstract bytecode opcodes recognized by the tuple decoder.
//!
//! These are mnemonic names, not the numeric byte values of any concrete
//! class-file format; §4.1 only specifies the instruction *shapes* the
//! decoder must recognize, not a byte encoding, so this module picks a
//! contiguous `u8` numbering of its own.

use derive_more::Display;

/// Integer arithmetic operators, shared by the bytecode decoder, HIR, and LIR.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum ArithOp {
    #[display("add")]
    Add,
    #[display("sub")]
    Sub,
    #[display("mul")]
    Mul,
    #[display("div")]
    Div,
    #[display("rem")]
    Rem,
}

/// The comparison kinds used by both `IF_ICMPxx` and the unary zero-compare
/// branches after rewriting (§4.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum CmpOp {
    #[display("eq")]
    Eq,
    #[display("ne")]
    Ne,
    #[display("lt")]
    Lt,
    #[display("le")]
    Le,
    #[display("gt")]
    Gt,
    #[display("ge")]
    Ge,
}

impl CmpOp {
    pub fn negate(self) -> CmpOp {
        match self {
            CmpOp::Eq => CmpOp::Ne,
            CmpOp::Ne => CmpOp::Eq,
            CmpOp::Lt => CmpOp::Ge,
            CmpOp::Le => CmpOp::Gt,
            CmpOp::Gt => CmpOp::Le,
            CmpOp::Ge => CmpOp::Lt,
        }
    }
}

/// Opcode mnemonics, one per recognized bytecode shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum Opcode {
    /// Push the literal 0.
    #[display("iconst_0")]
    IConst0,
    /// Push the literal 1.
    #[display("iconst_1")]
    IConst1,
    /// Push a pool-indexed 32-bit integer constant.
    #[display("ldc")]
    Ldc,
    /// Push the value of local variable `index`.
    #[display("iload")]
    ILoad,
    /// Pop into local variable `index`.
    #[display("istore")]
    IStore,
    /// Pop two, push `lhs op rhs`.
    #[display("iarith")]
    IArith(ArithOp),
    /// Pop one, push its arithmetic negation.
    #[display("ineg")]
    INeg,
    /// Duplicate the top of the operand stack.
    #[display("dup")]
    Dup,
    /// Discard the top of the operand stack.
    #[display("pop")]
    Pop,
    /// Invoke a static method named in the constant pool.
    #[display("invokestatic")]
    InvokeStatic,
    /// Pop two, branch on a signed comparison.
    #[display("if_icmp")]
    IfICmp(CmpOp),
    /// Pop one, branch if it compares to zero per `Eq`/`Ne`.
    #[display("ifz")]
    IfZ(CmpOp),
    /// Unconditional branch.
    #[display("goto")]
    Goto,
    /// Return with no value.
    #[display("return")]
    Return,
    /// Pop one and return it.
    #[display("ireturn")]
    IReturn,
}

impl Opcode {
    /// Number of operand bytes this opcode's tuple consumes, beyond the
    /// single opcode byte itself.
    pub fn operand_len(self) -> usize {
        match self {
            Opcode::IConst0
            | Opcode::IConst1
            | Opcode::IArith(_)
            | Opcode::INeg
            | Opcode::Dup
            | Opcode::Pop
            | Opcode::Return
            | Opcode::IReturn => 0,
            Opcode::ILoad | Opcode::IStore | Opcode::Ldc => 1,
            Opcode::InvokeStatic => 2,
            Opcode::IfICmp(_) | Opcode::IfZ(_) | Opcode::Goto => 2,
        }
    }
}
