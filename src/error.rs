//! Error kinds produced by the compilation pipeline.

use thiserror::Error;

use crate::common::Id;

/// Everything that can go wrong while compiling one method.
///
/// Every variant formats (via [`std::fmt::Display`]) to the bare message the
/// caller prefixes with `"Error: "` before writing it to stderr.
#[derive(Debug, Error)]
pub enum CompileError {
    /// An opcode byte the decoder doesn't recognize, a truncated operand, or
    /// a constant-pool index outside the pool's bounds.
    #[error("malformed bytecode in {method} at pc {pc}: {detail}")]
    MalformedBytecode {
        method: Id,
        pc: u32,
        detail: String,
    },

    /// A branch displacement landed on a byte offset that is not a tuple leader.
    #[error("unreachable target in {method}: branch to pc {target} is not a leader")]
    UnreachableTarget { method: Id, target: u32 },

    /// The interference graph referenced a neighbor id with no node, so
    /// coloring cannot proceed.
    #[error("register allocation failed in {method}: {detail}")]
    AllocationFailure { method: Id, detail: String },

    /// Reading the class file or writing the assembly output failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CompileError>;
