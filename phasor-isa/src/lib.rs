//! Atomic types of the Phasor virtual machine: runtime values, the opcode
//! enumeration and the fixed-shape instruction encoding.
//!
//! This crate has no notion of a program, a call stack or an execution loop —
//! those live in `phasor-vm`. It only describes the vocabulary instructions
//! are built from.

#![warn(missing_docs)]
#![deny(unused_must_use)]

mod instruction;
mod opcode;
mod panic_reason;
mod value;

pub use instruction::Instruction;
pub use opcode::Opcode;
pub use panic_reason::PanicReason;
pub use value::{Value, ValueKind};

/// Number of general-purpose registers in each call frame.
pub const REGISTER_COUNT: usize = 32;

/// A register index, `0..REGISTER_COUNT`.
pub type RegisterId = u8;
