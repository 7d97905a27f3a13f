//! Table-driven x86/x86-64 instruction decoder.
//!
//! Only instructions that trap out of hardware execution (MMIO, port I/O,
//! control-register and descriptor-table accesses) ever reach this decoder, so
//! the tables cover the general-purpose integer set plus x87 decode. SSE/AVX
//! encodings are rejected with [`DecodeError::DecodeFailed`].

#![forbid(unsafe_code)]

mod command;
mod decoder;
mod inst;
mod tables;
mod x87;

pub use command::Command;
pub use decoder::{decode, DecodeError, MAX_INST_LEN};
pub use inst::{
    CpuMode, DecodedInstruction, FlagsMask, FpuInfo, MemoryOffset, MemoryOperand, ModRm, Operand,
    OperandKind, Prefixes, Register, RepPrefix, RexPrefix, SegReg,
};
