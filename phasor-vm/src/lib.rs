//! The Phasor bytecode toolchain: an AST-to-bytecode code generator, a
//! versioned binary container format, a diff-friendly textual IR, a
//! stack/register virtual machine, and a multi-instance module runtime.
//!
//! This crate has no lexer or parser; [`ast`] describes the tree shape the
//! code generator expects to receive from one.

#![warn(missing_docs)]
#![deny(unused_must_use)]

pub mod ast;
pub mod bytecode;
pub mod codec;
pub mod codegen;
pub mod consts;
pub mod error;
pub mod interpreter;
pub mod modules;

pub use phasor_isa::{Instruction, Opcode, PanicReason, Value, ValueKind, REGISTER_COUNT};

pub mod prelude {
    //! Commonly imported items.
    pub use crate::bytecode::Bytecode;
    pub use crate::codegen::Generator;
    pub use crate::error::{LoadError, RuntimeError};
    pub use crate::interpreter::{InstanceHandle, Vm};
    pub use crate::modules::{Manifest, ModuleRuntime};
    pub use phasor_isa::{Instruction, Opcode, PanicReason, Value};
}
