//! Bytecode serialization: a load-fast binary container and a diff-friendly
//! textual form covering the same information.

pub mod binary;
pub mod text;
