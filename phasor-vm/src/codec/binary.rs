//! The `.phsb` binary container: a CRC32-checked, tag-sectioned encoding of
//! a [`Bytecode`], optimised to load fast rather than to diff well — see
//! [`crate::codec::text`] for the diff-friendly counterpart.

use std::collections::BTreeMap;

use phasor_isa::{Instruction, Opcode, Value};

use crate::bytecode::Bytecode;
use crate::consts::{BINARY_MAGIC, BINARY_VERSION};
use crate::error::{LoadError, LoadResult};

const TAG_CONSTANTS: u8 = 0x01;
const TAG_VARIABLES: u8 = 0x02;
const TAG_INSTRUCTIONS: u8 = 0x03;
const TAG_FUNCTIONS: u8 = 0x04;

const CONST_NULL: u8 = 0;
const CONST_BOOL: u8 = 1;
const CONST_INT: u8 = 2;
const CONST_FLOAT: u8 = 3;
const CONST_STRING: u8 = 4;

/// Encodes `bytecode` as a `.phsb` byte stream.
///
/// Struct and array constants cannot be represented in this format; the
/// caller should use [`crate::codec::text`] for bytecode that declares
/// structs, or avoid emitting struct/array constants directly (struct
/// *instances* are always created at runtime via `NEW_STRUCT`, so this only
/// bites a front end that tries to pre-compute one into the pool).
pub fn encode(bytecode: &Bytecode) -> LoadResult<Vec<u8>> {
    let mut body = Vec::new();
    write_constants(&mut body, &bytecode.constants)?;
    write_variables(&mut body, &bytecode.variables, bytecode.next_var_index);
    write_functions(&mut body, &bytecode.function_entries);
    write_instructions(&mut body, &bytecode.instructions);

    let mut checksum = crc32fast::Hasher::new();
    checksum.update(&body);
    let crc = checksum.finalize();

    let mut out = Vec::with_capacity(16 + body.len());
    out.extend_from_slice(&BINARY_MAGIC.to_le_bytes());
    out.extend_from_slice(&BINARY_VERSION.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // flags, reserved
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decodes a `.phsb` byte stream, verifying its magic, version and CRC32
/// before trusting any of the payload.
///
/// The struct table is always empty in the result: the binary format has no
/// struct section (see [`crate::codec::text`]), and function parameter
/// counts are not persisted either — callers that load a binary container
/// directly must trust call-site argument counts, same as the format this
/// was distilled from.
pub fn decode(bytes: &[u8]) -> LoadResult<Bytecode> {
    if bytes.len() < 16 {
        return Err(LoadError::UnexpectedEndOfInput);
    }
    let magic = read_u32(bytes, 0)?;
    if magic != BINARY_MAGIC {
        return Err(LoadError::BadMagic { expected: BINARY_MAGIC, found: magic });
    }
    let version = read_u32(bytes, 4)?;
    if version != BINARY_VERSION {
        return Err(LoadError::UnsupportedVersion(version));
    }
    let expected_crc = read_u32(bytes, 12)?;
    let body = &bytes[16..];
    let mut checksum = crc32fast::Hasher::new();
    checksum.update(body);
    if checksum.finalize() != expected_crc {
        return Err(LoadError::ChecksumMismatch);
    }

    let mut bytecode = Bytecode::new();
    let mut cursor = 0usize;
    let mut seen = [false; 4];
    while cursor < body.len() {
        let tag = *body.get(cursor).ok_or(LoadError::UnexpectedEndOfInput)?;
        cursor += 1;
        match tag {
            TAG_CONSTANTS => {
                seen[0] = true;
                cursor = read_constants(body, cursor, &mut bytecode.constants)?;
            }
            TAG_VARIABLES => {
                seen[1] = true;
                cursor = read_variables(body, cursor, &mut bytecode.variables, &mut bytecode.next_var_index)?;
            }
            TAG_INSTRUCTIONS => {
                seen[2] = true;
                cursor = read_instructions(body, cursor, &mut bytecode.instructions)?;
            }
            TAG_FUNCTIONS => {
                seen[3] = true;
                cursor = read_functions(body, cursor, &mut bytecode.function_entries)?;
            }
            other => return Err(LoadError::UnknownSectionTag(other)),
        }
    }
    Ok(bytecode)
}

fn write_constants(out: &mut Vec<u8>, constants: &[Value]) -> LoadResult<()> {
    out.push(TAG_CONSTANTS);
    out.extend_from_slice(&(constants.len() as u32).to_le_bytes());
    for value in constants {
        match value {
            Value::Null => out.push(CONST_NULL),
            Value::Bool(b) => {
                out.push(CONST_BOOL);
                out.push(*b as u8);
            }
            Value::Int(i) => {
                out.push(CONST_INT);
                out.extend_from_slice(&i.to_le_bytes());
            }
            Value::Float(f) => {
                out.push(CONST_FLOAT);
                out.extend_from_slice(&f.to_le_bytes());
            }
            Value::String(s) => {
                out.push(CONST_STRING);
                write_string(out, s);
            }
            Value::Struct(_) | Value::Array(_) => return Err(LoadError::UnencodableConstant),
        }
    }
    Ok(())
}

fn write_variables(out: &mut Vec<u8>, variables: &BTreeMap<String, u32>, next_var_index: u32) {
    out.push(TAG_VARIABLES);
    out.extend_from_slice(&(variables.len() as u32).to_le_bytes());
    out.extend_from_slice(&next_var_index.to_le_bytes());
    for (name, slot) in variables {
        write_string(out, name);
        out.extend_from_slice(&slot.to_le_bytes());
    }
}

fn write_functions(out: &mut Vec<u8>, functions: &BTreeMap<String, u32>) {
    out.push(TAG_FUNCTIONS);
    out.extend_from_slice(&(functions.len() as u32).to_le_bytes());
    for (name, entry) in functions {
        write_string(out, name);
        out.extend_from_slice(&entry.to_le_bytes());
    }
}

fn write_instructions(out: &mut Vec<u8>, instructions: &[Instruction]) {
    out.push(TAG_INSTRUCTIONS);
    out.extend_from_slice(&(instructions.len() as u32).to_le_bytes());
    for instr in instructions {
        out.push(instr.opcode as u8);
        for operand in instr.operands() {
            out.extend_from_slice(&operand.to_le_bytes());
        }
    }
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u16).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn read_u32(bytes: &[u8], at: usize) -> LoadResult<u32> {
    bytes
        .get(at..at + 4)
        .and_then(|s| s.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or(LoadError::UnexpectedEndOfInput)
}

fn read_i32(bytes: &[u8], at: usize) -> LoadResult<i32> {
    bytes
        .get(at..at + 4)
        .and_then(|s| s.try_into().ok())
        .map(i32::from_le_bytes)
        .ok_or(LoadError::UnexpectedEndOfInput)
}

fn read_string(bytes: &[u8], at: usize) -> LoadResult<(String, usize)> {
    let len = bytes
        .get(at..at + 2)
        .and_then(|s| s.try_into().ok())
        .map(u16::from_le_bytes)
        .ok_or(LoadError::UnexpectedEndOfInput)? as usize;
    let start = at + 2;
    let raw = bytes.get(start..start + len).ok_or(LoadError::UnexpectedEndOfInput)?;
    let s = String::from_utf8(raw.to_vec()).map_err(|_| LoadError::MalformedSyntax {
        line: 0,
        detail: "constant string is not valid UTF-8".to_owned(),
    })?;
    Ok((s, start + len))
}

fn read_constants(bytes: &[u8], mut at: usize, out: &mut Vec<Value>) -> LoadResult<usize> {
    let count = read_u32(bytes, at)?;
    at += 4;
    for _ in 0..count {
        let tag = *bytes.get(at).ok_or(LoadError::UnexpectedEndOfInput)?;
        at += 1;
        let value = match tag {
            CONST_NULL => Value::Null,
            CONST_BOOL => {
                let b = *bytes.get(at).ok_or(LoadError::UnexpectedEndOfInput)?;
                at += 1;
                Value::Bool(b != 0)
            }
            CONST_INT => {
                let raw: [u8; 8] = bytes.get(at..at + 8).and_then(|s| s.try_into().ok()).ok_or(LoadError::UnexpectedEndOfInput)?;
                at += 8;
                Value::Int(i64::from_le_bytes(raw))
            }
            CONST_FLOAT => {
                let raw: [u8; 8] = bytes.get(at..at + 8).and_then(|s| s.try_into().ok()).ok_or(LoadError::UnexpectedEndOfInput)?;
                at += 8;
                Value::Float(f64::from_le_bytes(raw))
            }
            CONST_STRING => {
                let (s, next) = read_string(bytes, at)?;
                at = next;
                Value::String(s)
            }
            other => return Err(LoadError::UnknownConstantTag(other)),
        };
        out.push(value);
    }
    Ok(at)
}

fn read_variables(bytes: &[u8], mut at: usize, out: &mut BTreeMap<String, u32>, next_var_index: &mut u32) -> LoadResult<usize> {
    let count = read_u32(bytes, at)?;
    at += 4;
    *next_var_index = read_u32(bytes, at)?;
    at += 4;
    for _ in 0..count {
        let (name, next) = read_string(bytes, at)?;
        at = next;
        let slot = read_u32(bytes, at)?;
        at += 4;
        out.insert(name, slot);
    }
    Ok(at)
}

fn read_functions(bytes: &[u8], mut at: usize, out: &mut BTreeMap<String, u32>) -> LoadResult<usize> {
    let count = read_u32(bytes, at)?;
    at += 4;
    for _ in 0..count {
        let (name, next) = read_string(bytes, at)?;
        at = next;
        let entry = read_u32(bytes, at)?;
        at += 4;
        out.insert(name, entry);
    }
    Ok(at)
}

fn read_instructions(bytes: &[u8], mut at: usize, out: &mut Vec<Instruction>) -> LoadResult<usize> {
    let count = read_u32(bytes, at)?;
    at += 4;
    for _ in 0..count {
        let tag = *bytes.get(at).ok_or(LoadError::UnexpectedEndOfInput)?;
        at += 1;
        let opcode = opcode_from_u8(tag)?;
        let mut operands = [0i32; 5];
        for operand in &mut operands {
            *operand = read_i32(bytes, at)?;
            at += 4;
        }
        out.push(Instruction {
            opcode,
            operand1: operands[0],
            operand2: operands[1],
            operand3: operands[2],
            operand4: operands[3],
            operand5: operands[4],
        });
    }
    Ok(at)
}

fn opcode_from_u8(tag: u8) -> LoadResult<Opcode> {
    use strum::IntoEnumIterator;
    Opcode::iter().nth(tag as usize).ok_or(LoadError::UnknownSectionTag(tag))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Bytecode {
        let mut bc = Bytecode::new();
        bc.intern_constant(Value::Int(42));
        bc.intern_constant(Value::String("hi".to_owned()));
        bc.intern_variable("x");
        bc.emit(Instruction::with_operand(Opcode::PushConst, 0));
        bc.emit(Instruction::with_operand(Opcode::StoreVar, 0));
        bc.function_entries.insert("main".to_owned(), 0);
        bc
    }

    #[test]
    fn round_trips_through_encode_and_decode() {
        let bc = sample();
        let bytes = encode(&bc).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.constants, bc.constants);
        assert_eq!(decoded.variables, bc.variables);
        assert_eq!(decoded.next_var_index, bc.next_var_index);
        assert_eq!(decoded.instructions, bc.instructions);
        assert_eq!(decoded.function_entries, bc.function_entries);
    }

    #[test]
    fn flipping_a_payload_byte_fails_the_checksum() {
        let bc = sample();
        let mut bytes = encode(&bc).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(matches!(decode(&bytes), Err(LoadError::ChecksumMismatch)));
    }

    #[test]
    fn bad_magic_is_rejected_before_checksum() {
        let bc = sample();
        let mut bytes = encode(&bc).unwrap();
        bytes[0] = 0;
        assert!(matches!(decode(&bytes), Err(LoadError::BadMagic { .. })));
    }

    #[test]
    fn struct_constants_cannot_be_encoded() {
        let mut bc = Bytecode::new();
        bc.intern_constant(Value::new_struct("Point"));
        assert!(matches!(encode(&bc), Err(LoadError::UnencodableConstant)));
    }
}
