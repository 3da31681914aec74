//! The `.phir` textual IR: a line-oriented rendering of a [`Bytecode`]
//! intended to diff cleanly in version control, at the cost of being slower
//! to parse back than [`crate::codec::binary`].
//!
//! Round-tripping bytecode -> text -> bytecode preserves every field except
//! comments; comments are write-only decoration, never consulted on read.

use std::fmt::Write as _;

use phasor_isa::{Instruction, Opcode, Value};

use crate::bytecode::{Bytecode, StructEntry};
use crate::error::{LoadError, LoadResult};

/// Renders `bytecode` as `.phir` text.
///
/// `comment` controls whether instructions get a trailing `; const[..]=...`
/// / `var=...` / `func=...` annotation resolving their operands back to
/// source-level names — purely cosmetic, stripped again on the next parse.
pub fn encode(bytecode: &Bytecode, annotate: bool) -> String {
    let mut out = String::new();

    writeln!(out, ".CONSTANTS {}", bytecode.constants.len()).unwrap();
    for value in &bytecode.constants {
        writeln!(out, "{}", encode_constant(value)).unwrap();
    }

    writeln!(out, ".VARIABLES {} {}", bytecode.variables.len(), bytecode.next_var_index).unwrap();
    for (name, slot) in &bytecode.variables {
        writeln!(out, "{name} {slot}").unwrap();
    }

    writeln!(out, ".FUNCTIONS {}", bytecode.function_entries.len()).unwrap();
    for (name, entry) in &bytecode.function_entries {
        let params = bytecode.function_param_counts.get(name).copied().unwrap_or(0);
        writeln!(out, "{name} {entry} {params}").unwrap();
    }

    writeln!(out, ".STRUCTS {}", bytecode.structs.len()).unwrap();
    for s in &bytecode.structs {
        write!(out, "{} {}", s.name, s.first_const_index).unwrap();
        for field in &s.field_names {
            write!(out, " {field}").unwrap();
        }
        writeln!(out).unwrap();
    }

    writeln!(out, ".INSTRUCTIONS {}", bytecode.instructions.len()).unwrap();
    for instr in &bytecode.instructions {
        writeln!(out, "{}", encode_instruction(instr, bytecode, annotate)).unwrap();
    }

    out
}

/// Parses `.phir` text back into a [`Bytecode`]. Comments (`; ...`) are
/// skipped; blank lines between sections are tolerated.
pub fn decode(text: &str) -> LoadResult<Bytecode> {
    let all: Vec<(usize, &str)> = text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()).collect();
    let mut lines = Lines { rows: all, cursor: 0 };
    let mut bytecode = Bytecode::new();

    let n_constants = expect_directive(&mut lines, ".CONSTANTS", 1)?[0];
    for _ in 0..n_constants {
        let (no, line) = next_line(&mut lines)?;
        bytecode.constants.push(decode_constant(line, no)?);
    }

    let var_header = expect_directive(&mut lines, ".VARIABLES", 2)?;
    for _ in 0..var_header[0] {
        let (no, line) = next_line(&mut lines)?;
        let (name, slot) = split_two(line, no)?;
        let slot: u32 = slot.parse().map_err(|_| syntax(no, "variable slot is not an integer"))?;
        bytecode.variables.insert(name.to_owned(), slot);
    }
    bytecode.next_var_index = var_header[1];

    let n_functions = expect_directive(&mut lines, ".FUNCTIONS", 1)?[0];
    for _ in 0..n_functions {
        let (no, line) = next_line(&mut lines)?;
        let mut parts = line.split_whitespace();
        let name = parts.next().ok_or_else(|| syntax(no, "missing function name"))?;
        let entry: u32 = parts
            .next()
            .ok_or_else(|| syntax(no, "missing function entry index"))?
            .parse()
            .map_err(|_| syntax(no, "function entry index is not an integer"))?;
        let params: u32 = parts
            .next()
            .ok_or_else(|| syntax(no, "missing function parameter count"))?
            .parse()
            .map_err(|_| syntax(no, "function parameter count is not an integer"))?;
        bytecode.function_entries.insert(name.to_owned(), entry);
        bytecode.function_param_counts.insert(name.to_owned(), params);
    }

    let n_structs = expect_directive(&mut lines, ".STRUCTS", 1)?[0];
    for _ in 0..n_structs {
        let (no, line) = next_line(&mut lines)?;
        let mut parts = line.split_whitespace();
        let name = parts.next().ok_or_else(|| syntax(no, "missing struct name"))?.to_owned();
        let first_const_index: u32 = parts
            .next()
            .ok_or_else(|| syntax(no, "missing struct constant base index"))?
            .parse()
            .map_err(|_| syntax(no, "struct constant base index is not an integer"))?;
        let field_names: Vec<String> = parts.map(|f| f.to_owned()).collect();
        let index = bytecode.structs.len() as u32;
        bytecode.struct_indices.insert(name.clone(), index);
        bytecode.structs.push(StructEntry { name, field_names, first_const_index });
    }

    let n_instructions = expect_directive(&mut lines, ".INSTRUCTIONS", 1)?[0];
    for _ in 0..n_instructions {
        let (no, line) = next_line(&mut lines)?;
        bytecode.instructions.push(decode_instruction(line, no)?);
    }

    Ok(bytecode)
}

fn encode_constant(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_owned(),
        Value::Bool(b) => format!("BOOL {b}"),
        Value::Int(i) => format!("INT {i}"),
        Value::Float(f) => format!("FLOAT {f}"),
        Value::String(s) => format!("STRING \"{}\"", escape(s)),
        Value::Struct(_) | Value::Array(_) => "NULL".to_owned(),
    }
}

fn decode_constant(line: &str, no: usize) -> LoadResult<Value> {
    let (tag, rest) = line.split_once(' ').unwrap_or((line, ""));
    match tag {
        "NULL" => Ok(Value::Null),
        "BOOL" => rest.trim().parse::<bool>().map(Value::Bool).map_err(|_| syntax(no, "invalid BOOL constant")),
        "INT" => rest.trim().parse::<i64>().map(Value::Int).map_err(|_| syntax(no, "invalid INT constant")),
        "FLOAT" => rest.trim().parse::<f64>().map(Value::Float).map_err(|_| syntax(no, "invalid FLOAT constant")),
        "STRING" => {
            let inner = rest.trim();
            let inner = inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')).ok_or_else(|| syntax(no, "unterminated STRING constant"))?;
            Ok(Value::String(unescape(inner)))
        }
        other => Err(syntax(no, format!("unknown constant keyword `{other}`"))),
    }
}

fn encode_instruction(instr: &Instruction, bytecode: &Bytecode, annotate: bool) -> String {
    let operands = instr.operands();
    let rendered: Vec<String> = operands
        .iter()
        .map(|&o| if instr.opcode.is_register_form() { format!("r{o}") } else { o.to_string() })
        .collect();
    let mut line = format!("{} {}", instr.opcode, rendered.join(", "));
    if annotate {
        if let Some(note) = annotate_instruction(instr, bytecode) {
            let _ = write!(line, " ; {note}");
        }
    }
    line
}

fn annotate_instruction(instr: &Instruction, bytecode: &Bytecode) -> Option<String> {
    use Opcode::*;
    match instr.opcode {
        PushConst | LoadConstR => {
            let value = bytecode.constants.get(instr.operand1 as usize)?;
            Some(format!("const[{}]={:?}", instr.operand1, value))
        }
        StoreVar | LoadVar | StoreVarR | LoadVarR => {
            let slot = if instr.opcode.is_register_form() { instr.operand2 } else { instr.operand1 };
            let name = bytecode.variables.iter().find(|(_, &s)| s as i32 == slot).map(|(n, _)| n.as_str())?;
            Some(format!("var={name}"))
        }
        Call | CallNative => {
            let name = bytecode.constants.get(instr.operand1 as usize)?.as_string();
            Some(format!("func={name}"))
        }
        _ => None,
    }
}

fn decode_instruction(line: &str, no: usize) -> LoadResult<Instruction> {
    let line = line.split(';').next().unwrap_or(line).trim();
    let (mnemonic, rest) = line.split_once(' ').unwrap_or((line, ""));
    let opcode = opcode_from_mnemonic(mnemonic).ok_or_else(|| syntax(no, format!("unknown opcode `{mnemonic}`")))?;
    let mut operands = [0i32; 5];
    for (i, token) in rest.split(',').map(str::trim).filter(|t| !t.is_empty()).enumerate() {
        if i >= 5 {
            return Err(syntax(no, "instruction has more than five operands"));
        }
        let token = token.strip_prefix('r').unwrap_or(token);
        operands[i] = token.parse().map_err(|_| syntax(no, format!("operand `{token}` is not an integer")))?;
    }
    Ok(Instruction {
        opcode,
        operand1: operands[0],
        operand2: operands[1],
        operand3: operands[2],
        operand4: operands[3],
        operand5: operands[4],
    })
}

fn opcode_from_mnemonic(token: &str) -> Option<Opcode> {
    use strum::IntoEnumIterator;
    Opcode::iter().find(|op| op.to_string() == token)
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

/// Non-blank source lines with their original 1-based line numbers, cursored
/// one at a time by the section readers above.
struct Lines<'a> {
    rows: Vec<(usize, &'a str)>,
    cursor: usize,
}

fn next_line<'a>(lines: &mut Lines<'a>) -> LoadResult<(usize, &'a str)> {
    let (i, l) = lines.rows.get(lines.cursor).copied().ok_or(LoadError::UnexpectedEndOfInput)?;
    lines.cursor += 1;
    Ok((i + 1, l.trim()))
}

fn expect_directive(lines: &mut Lines<'_>, name: &str, arity: usize) -> LoadResult<Vec<u32>> {
    let (no, line) = next_line(lines)?;
    let mut parts = line.split_whitespace();
    let tag = parts.next().ok_or_else(|| syntax(no, format!("expected `{name}` directive")))?;
    if tag != name {
        return Err(syntax(no, format!("expected `{name}` directive, found `{tag}`")));
    }
    let values: Vec<u32> = parts.filter_map(|p| p.parse().ok()).collect();
    if values.len() != arity {
        return Err(syntax(no, format!("`{name}` expects {arity} numeric argument(s)")));
    }
    Ok(values)
}

fn split_two<'a>(line: &'a str, no: usize) -> LoadResult<(&'a str, &'a str)> {
    line.rsplit_once(' ').map(|(a, b)| (a.trim(), b.trim())).ok_or_else(|| syntax(no, "expected two space-separated fields"))
}

fn syntax(line: usize, detail: impl Into<String>) -> LoadError {
    LoadError::MalformedSyntax { line, detail: detail.into() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phasor_isa::Opcode;

    fn sample() -> Bytecode {
        let mut bc = Bytecode::new();
        bc.intern_constant(Value::Int(7));
        bc.intern_constant(Value::String("hi\nthere".to_owned()));
        bc.intern_variable("count");
        bc.declare_struct("Point", vec!["x".into(), "y".into()]);
        bc.emit(Instruction::with_operand(Opcode::PushConst, 0));
        bc.emit(Instruction::with_operands2(Opcode::LoadConstR, 1, 0));
        bc.function_entries.insert("main".to_owned(), 0);
        bc.function_param_counts.insert("main".to_owned(), 0);
        bc
    }

    #[test]
    fn round_trips_through_encode_and_decode() {
        let bc = sample();
        let text = encode(&bc, true);
        let decoded = decode(&text).unwrap();
        assert_eq!(decoded, bc);
    }

    #[test]
    fn escapes_survive_a_round_trip() {
        let mut bc = Bytecode::new();
        bc.intern_constant(Value::String("a\\b\"c\td\ne".to_owned()));
        let text = encode(&bc, false);
        let decoded = decode(&text).unwrap();
        assert_eq!(decoded.constants, bc.constants);
    }

    #[test]
    fn annotations_do_not_affect_decoded_content() {
        let bc = sample();
        let annotated = decode(&encode(&bc, true)).unwrap();
        let bare = decode(&encode(&bc, false)).unwrap();
        assert_eq!(annotated, bare);
    }
}
