//! The fixed-shape instruction encoding: one opcode plus five signed
//! operands.
//!
//! A single shape is used for every opcode rather than a per-opcode struct,
//! matching the way the binary and textual codecs serialize instructions
//! uniformly; unused operand slots are simply left zero.

use crate::Opcode;

/// One bytecode instruction: an [`Opcode`] and its (up to five) operands.
///
/// Operand meaning depends on the opcode — see the per-variant docs on
/// [`Opcode`]. Stack opcodes typically use only `operand1` (an index into
/// the constant pool or variable table, or a jump target); register opcodes
/// use `operand1..operand3` as register indices and sometimes `operand4` as
/// an immediate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    /// The operation to perform.
    pub opcode: Opcode,
    /// First operand.
    pub operand1: i32,
    /// Second operand.
    pub operand2: i32,
    /// Third operand.
    pub operand3: i32,
    /// Fourth operand.
    pub operand4: i32,
    /// Fifth operand.
    pub operand5: i32,
}

impl Instruction {
    /// Creates an instruction with every operand set to zero.
    pub fn new(opcode: Opcode) -> Self {
        Self { opcode, operand1: 0, operand2: 0, operand3: 0, operand4: 0, operand5: 0 }
    }

    /// Creates an instruction with a single operand set.
    pub fn with_operand(opcode: Opcode, operand1: i32) -> Self {
        Self { operand1, ..Self::new(opcode) }
    }

    /// Creates an instruction with two operands set.
    pub fn with_operands2(opcode: Opcode, operand1: i32, operand2: i32) -> Self {
        Self { operand1, operand2, ..Self::new(opcode) }
    }

    /// Creates an instruction with three operands set.
    pub fn with_operands3(opcode: Opcode, operand1: i32, operand2: i32, operand3: i32) -> Self {
        Self { operand1, operand2, operand3, ..Self::new(opcode) }
    }

    /// All five operands as an array, in declaration order.
    pub fn operands(&self) -> [i32; 5] {
        [self.operand1, self.operand2, self.operand3, self.operand4, self.operand5]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_operands_default_to_zero() {
        let instr = Instruction::with_operand(Opcode::Jump, 7);
        assert_eq!(instr.operands(), [7, 0, 0, 0, 0]);
    }
}
