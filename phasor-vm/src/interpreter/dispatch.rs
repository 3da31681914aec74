//! The per-instruction dispatch loop.
//!
//! Each instruction handler returns a [`Step`] rather than throwing: the
//! outer loop in [`run`] acts on the tag instead of relying on a thrown
//! sentinel to unwind the call stack.

use std::io::Write;
use std::process::Command;

use phasor_isa::{Instruction, Opcode, PanicReason, Value};

use crate::error::{Result, RuntimeError};

use super::{Frame, InstanceHandle, Vm};

/// The outcome of executing a single instruction.
enum Step {
    /// Keep fetching at the frame's (possibly just-updated) PC.
    Continue,
    /// The instance has finished executing; stop the loop cleanly.
    Halt,
}

fn fault(reason: PanicReason, message: impl Into<String>) -> RuntimeError {
    RuntimeError::fault(reason, message)
}

fn pop(frame: &mut Frame) -> Result<Value> {
    frame.pop().ok_or_else(|| fault(PanicReason::StackUnderflow, "pop from empty stack"))
}

/// Runs `handle`'s dispatch loop to completion.
pub(super) fn run(vm: &mut Vm, handle: InstanceHandle) -> Result<()> {
    loop {
        let opcode_and_pc = {
            let instance = vm
                .instance(handle)
                .ok_or_else(|| fault(PanicReason::UnknownFunction, "no such instance"))?;
            let frame = instance.active_frame();
            let pc = frame.pc as usize;
            let instructions = &instance.bytecode().instructions;
            if pc >= instructions.len() {
                return Err(fault(PanicReason::InvalidJumpTarget, "program counter ran off the end of the instruction stream"));
            }
            instructions[pc]
        };

        {
            let instance = vm.instance_mut(handle).expect("checked above");
            instance.active_frame_mut().pc += 1;
        }

        match step(vm, handle, opcode_and_pc)? {
            Step::Continue => {}
            Step::Halt => return Ok(()),
        }
    }
}

#[tracing::instrument(name = "instruction", skip(vm), fields(opcode = %instr.opcode))]
fn step(vm: &mut Vm, handle: InstanceHandle, instr: Instruction) -> Result<Step> {
    use Opcode::*;

    macro_rules! frame {
        () => {
            vm.instance_mut(handle).expect("instance alive during dispatch").active_frame_mut()
        };
    }

    macro_rules! bin_int {
        ($op:expr) => {{
            let f = frame!();
            let b = pop(f)?;
            let a = pop(f)?;
            let result = $op(&a, &b)?;
            f.push(result);
        }};
    }

    macro_rules! bin_float {
        ($op:ident) => {{
            let f = frame!();
            let b = pop(f)?.as_float();
            let a = pop(f)?.as_float();
            f.push(Value::Float(a.$op(b)));
        }};
    }

    match instr.opcode {
        PushConst => {
            let value = constant_at(vm, handle, instr.operand1)?;
            frame!().push(value);
        }
        Pop => {
            pop(frame!())?;
        }

        IAdd => bin_int!(Value::add),
        ISubtract => bin_int!(Value::sub),
        IMultiply => bin_int!(Value::mul),
        IDivide => bin_int!(Value::div),
        IModulo => bin_int!(Value::rem),

        FlAdd => {
            let f = frame!();
            let b = pop(f)?.as_float();
            let a = pop(f)?.as_float();
            f.push(Value::Float(a + b));
        }
        FlSubtract => {
            let f = frame!();
            let b = pop(f)?.as_float();
            let a = pop(f)?.as_float();
            f.push(Value::Float(a - b));
        }
        FlMultiply => {
            let f = frame!();
            let b = pop(f)?.as_float();
            let a = pop(f)?.as_float();
            f.push(Value::Float(a * b));
        }
        FlDivide => {
            let f = frame!();
            let b = pop(f)?.as_float();
            let a = pop(f)?.as_float();
            f.push(Value::Float(a / b));
        }
        FlModulo => {
            let f = frame!();
            let b = pop(f)?.as_float();
            let a = pop(f)?.as_float();
            f.push(Value::Float(a % b));
        }
        Sqrt => unary_math(frame!(), f64::sqrt)?,
        Log => unary_math(frame!(), f64::ln)?,
        Exp => unary_math(frame!(), f64::exp)?,
        Sin => unary_math(frame!(), f64::sin)?,
        Cos => unary_math(frame!(), f64::cos)?,
        Tan => unary_math(frame!(), f64::tan)?,
        Pow => bin_float!(powf),

        Negate => {
            let f = frame!();
            let a = pop(f)?;
            f.push(a.neg());
        }
        Not => {
            let f = frame!();
            let a = pop(f)?;
            f.push(Value::Bool(!a.is_truthy()));
        }

        IAnd | FlAnd => {
            let f = frame!();
            let b = pop(f)?;
            let a = pop(f)?;
            f.push(Value::Bool(a.is_truthy() && b.is_truthy()));
        }
        IOr | FlOr => {
            let f = frame!();
            let b = pop(f)?;
            let a = pop(f)?;
            f.push(Value::Bool(a.is_truthy() || b.is_truthy()));
        }

        IEqual | FlEqual => {
            let f = frame!();
            let b = pop(f)?;
            let a = pop(f)?;
            f.push(Value::Bool(a.values_equal(&b)));
        }
        INotEqual | FlNotEqual => {
            let f = frame!();
            let b = pop(f)?;
            let a = pop(f)?;
            f.push(Value::Bool(!a.values_equal(&b)));
        }
        ILessThan | FlLessThan => compare(frame!(), std::cmp::Ordering::is_lt)?,
        IGreaterThan | FlGreaterThan => compare(frame!(), std::cmp::Ordering::is_gt)?,
        ILessEqual | FlLessEqual => compare(frame!(), std::cmp::Ordering::is_le)?,
        IGreaterEqual | FlGreaterEqual => compare(frame!(), std::cmp::Ordering::is_ge)?,

        Jump | JumpBack => {
            frame!().pc = instr.operand1 as u32;
        }
        JumpIfFalse => {
            let f = frame!();
            let cond = pop(f)?;
            if !cond.is_truthy() {
                f.pc = instr.operand1 as u32;
            }
        }
        JumpIfTrue => {
            let f = frame!();
            let cond = pop(f)?;
            if cond.is_truthy() {
                f.pc = instr.operand1 as u32;
            }
        }

        StoreVar => {
            let f = frame!();
            let value = pop(f)?;
            store_local(f, instr.operand1, value)?;
        }
        LoadVar => {
            let f = frame!();
            let value = load_local(f, instr.operand1)?;
            f.push(value);
        }

        Print => {
            let value = pop(frame!())?;
            print!("{}", value.to_display_string());
            std::io::stdout().flush().ok();
        }
        PrintError => {
            let value = pop(frame!())?;
            eprint!("{}", value.to_display_string());
        }
        ReadLine => {
            let mut line = String::new();
            std::io::stdin()
                .read_line(&mut line)
                .map_err(|_| fault(PanicReason::InputStreamClosed, "failed to read a line from stdin"))?;
            if line.ends_with('\n') {
                line.pop();
                if line.ends_with('\r') {
                    line.pop();
                }
            }
            frame!().push(Value::String(line));
        }
        Import => {
            // Unused: module loading is manifest-driven (see `crate::modules`).
            // Retained as a shorthand for the installed import handler.
            let path = constant_at(vm, handle, instr.operand1)?.as_string();
            let handler = vm.import_handler.clone().ok_or_else(|| {
                fault(PanicReason::ModuleManifestInvalid, "no import handler installed")
            })?;
            handler(&path, vm)?;
        }
        Halt => {
            vm.instance_mut(handle).expect("instance alive during dispatch").alive = false;
            return Ok(Step::Halt);
        }
        CallNative => return call_native(vm, handle, instr),
        Call => return call_user(vm, handle, instr),
        Return => return do_return(vm, handle),
        System | SystemOut | SystemErr => {
            let cmd = constant_at(vm, handle, instr.operand1)?.as_string();
            run_shell(frame!(), instr.opcode, &cmd, None)?;
        }

        TrueLit => frame!().push(Value::Bool(true)),
        FalseLit => frame!().push(Value::Bool(false)),
        NullLit => frame!().push(Value::Null),

        Len => {
            let f = frame!();
            let s = pop(f)?.as_string();
            f.push(Value::Int(s.len() as i64));
        }
        CharAt => {
            let f = frame!();
            let index = pop(f)?.as_int();
            let s = pop(f)?.as_string();
            f.push(char_at(&s, index));
        }
        Substr => {
            let f = frame!();
            let len = pop(f)?.as_int();
            let start = pop(f)?.as_int();
            let s = pop(f)?.as_string();
            f.push(substr(&s, start, len));
        }

        NewStruct => {
            let name = constant_at(vm, handle, instr.operand1)?.as_string();
            frame!().push(Value::new_struct(name));
        }
        GetField => {
            let f = frame!();
            let obj = pop(f)?;
            let field = pop(f)?.as_string();
            f.push(get_field(&obj, &field)?);
        }
        SetField => {
            let f = frame!();
            let obj = pop(f)?;
            let field = pop(f)?.as_string();
            let value = pop(f)?;
            set_field(&obj, &field, value)?;
            f.push(obj);
        }
        NewStructInstanceStatic => {
            let value = new_struct_instance_static(vm, handle, instr.operand1)?;
            frame!().push(value);
        }
        GetFieldStatic => {
            let field = static_field_name(vm, handle, instr.operand1, instr.operand2)?;
            let f = frame!();
            let obj = pop(f)?;
            f.push(get_field(&obj, &field)?);
        }
        SetFieldStatic => {
            let field = static_field_name(vm, handle, instr.operand1, instr.operand2)?;
            let f = frame!();
            let obj = pop(f)?;
            let value = pop(f)?;
            set_field(&obj, &field, value)?;
        }

        // Register data movement.
        Mov => {
            let f = frame!();
            let v = f[instr.operand2 as u8].clone();
            f[instr.operand1 as u8] = v;
        }
        LoadConstR => {
            let value = constant_at(vm, handle, instr.operand2)?;
            frame!()[instr.operand1 as u8] = value;
        }
        LoadVarR => {
            let f = frame!();
            let value = load_local(f, instr.operand2)?;
            f[instr.operand1 as u8] = value;
        }
        StoreVarR => {
            let f = frame!();
            let value = f[instr.operand1 as u8].clone();
            store_local(f, instr.operand2, value)?;
        }
        PushR => {
            let f = frame!();
            let v = f[instr.operand1 as u8].clone();
            f.push(v);
        }
        Push2R => {
            let f = frame!();
            let a = f[instr.operand1 as u8].clone();
            let b = f[instr.operand2 as u8].clone();
            f.push(a);
            f.push(b);
        }
        PopR => {
            let f = frame!();
            let v = pop(f)?;
            f[instr.operand1 as u8] = v;
        }
        Pop2R => {
            let f = frame!();
            let b = pop(f)?;
            let a = pop(f)?;
            f[instr.operand1 as u8] = a;
            f[instr.operand2 as u8] = b;
        }

        IAddR | ISubR | IMulR | IDivR | IModR => reg_int_arith(frame!(), instr)?,
        FlAddR | FlSubR | FlMulR | FlDivR | FlModR => reg_float_arith(frame!(), instr),
        SqrtR | LogR | ExpR | SinR | CosR | TanR => reg_unary_math(frame!(), instr),
        PowR => {
            let f = frame!();
            let b = f[instr.operand3 as u8].as_float();
            let a = f[instr.operand2 as u8].as_float();
            f[instr.operand1 as u8] = Value::Float(a.powf(b));
        }

        IAndR | FlAndR => {
            let f = frame!();
            let result = f[instr.operand2 as u8].is_truthy() && f[instr.operand3 as u8].is_truthy();
            f[instr.operand1 as u8] = Value::Bool(result);
        }
        IOrR | FlOrR => {
            let f = frame!();
            let result = f[instr.operand2 as u8].is_truthy() || f[instr.operand3 as u8].is_truthy();
            f[instr.operand1 as u8] = Value::Bool(result);
        }
        IEqR | FlEqR => {
            let f = frame!();
            let result = f[instr.operand2 as u8].values_equal(&f[instr.operand3 as u8]);
            f[instr.operand1 as u8] = Value::Bool(result);
        }
        INeR | FlNeR => {
            let f = frame!();
            let result = !f[instr.operand2 as u8].values_equal(&f[instr.operand3 as u8]);
            f[instr.operand1 as u8] = Value::Bool(result);
        }
        ILtR | FlLtR => reg_compare(frame!(), instr, std::cmp::Ordering::is_lt),
        IGtR | FlGtR => reg_compare(frame!(), instr, std::cmp::Ordering::is_gt),
        ILeR | FlLeR => reg_compare(frame!(), instr, std::cmp::Ordering::is_le),
        IGeR | FlGeR => reg_compare(frame!(), instr, std::cmp::Ordering::is_ge),

        NegR => {
            let f = frame!();
            let v = f[instr.operand2 as u8].neg();
            f[instr.operand1 as u8] = v;
        }
        NotR => {
            let f = frame!();
            let v = Value::Bool(!f[instr.operand2 as u8].is_truthy());
            f[instr.operand1 as u8] = v;
        }

        PrintR => {
            let f = frame!();
            print!("{}", f[instr.operand1 as u8].to_display_string());
            std::io::stdout().flush().ok();
        }
        PrintErrorR => {
            let f = frame!();
            eprint!("{}", f[instr.operand1 as u8].to_display_string());
        }
        ReadLineR => {
            let mut line = String::new();
            std::io::stdin()
                .read_line(&mut line)
                .map_err(|_| fault(PanicReason::InputStreamClosed, "failed to read a line from stdin"))?;
            if line.ends_with('\n') {
                line.pop();
            }
            frame!()[instr.operand1 as u8] = Value::String(line);
        }
        SystemR => {
            let f = frame!();
            let cmd = f[instr.operand1 as u8].as_string();
            run_shell(f, Opcode::System, &cmd, None)?;
        }
        SystemOutR => {
            let f = frame!();
            let cmd = f[instr.operand1 as u8].as_string();
            let dest = instr.operand2 as u8;
            run_shell(f, Opcode::SystemOut, &cmd, Some(dest))?;
        }
        SystemErrR => {
            let f = frame!();
            let cmd = f[instr.operand1 as u8].as_string();
            let dest = instr.operand2 as u8;
            run_shell(f, Opcode::SystemErr, &cmd, Some(dest))?;
        }
    }

    Ok(Step::Continue)
}

fn unary_math(frame: &mut Frame, f: impl Fn(f64) -> f64) -> Result<()> {
    let a = pop(frame)?.as_float();
    frame.push(Value::Float(f(a)));
    Ok(())
}

fn compare(frame: &mut Frame, test: impl Fn(std::cmp::Ordering) -> bool) -> Result<()> {
    let b = pop(frame)?;
    let a = pop(frame)?;
    let ordering = a
        .partial_compare(&b)
        .ok_or_else(|| fault(PanicReason::TypeMismatch, "values are not ordered"))?;
    frame.push(Value::Bool(test(ordering)));
    Ok(())
}

fn reg_compare(frame: &mut Frame, instr: Instruction, test: impl Fn(std::cmp::Ordering) -> bool) {
    let a = &frame[instr.operand2 as u8];
    let b = &frame[instr.operand3 as u8];
    let result = a.partial_compare(b).map(test).unwrap_or(false);
    frame[instr.operand1 as u8] = Value::Bool(result);
}

fn reg_int_arith(frame: &mut Frame, instr: Instruction) -> Result<()> {
    let a = frame[instr.operand2 as u8].clone();
    let b = frame[instr.operand3 as u8].clone();
    let result = match instr.opcode {
        Opcode::IAddR => a.add(&b),
        Opcode::ISubR => a.sub(&b),
        Opcode::IMulR => a.mul(&b),
        Opcode::IDivR => a.div(&b),
        Opcode::IModR => a.rem(&b),
        _ => unreachable!(),
    }?;
    frame[instr.operand1 as u8] = result;
    Ok(())
}

fn reg_float_arith(frame: &mut Frame, instr: Instruction) {
    let a = frame[instr.operand2 as u8].as_float();
    let b = frame[instr.operand3 as u8].as_float();
    let result = match instr.opcode {
        Opcode::FlAddR => a + b,
        Opcode::FlSubR => a - b,
        Opcode::FlMulR => a * b,
        Opcode::FlDivR => a / b,
        Opcode::FlModR => a % b,
        _ => unreachable!(),
    };
    frame[instr.operand1 as u8] = Value::Float(result);
}

fn reg_unary_math(frame: &mut Frame, instr: Instruction) {
    let a = frame[instr.operand2 as u8].as_float();
    let result = match instr.opcode {
        Opcode::SqrtR => a.sqrt(),
        Opcode::LogR => a.ln(),
        Opcode::ExpR => a.exp(),
        Opcode::SinR => a.sin(),
        Opcode::CosR => a.cos(),
        Opcode::TanR => a.tan(),
        _ => unreachable!(),
    };
    frame[instr.operand1 as u8] = Value::Float(result);
}

fn char_at(s: &str, index: i64) -> Value {
    if index < 0 {
        return Value::String(String::new());
    }
    match s.as_bytes().get(index as usize) {
        Some(&byte) => Value::String((byte as char).to_string()),
        None => Value::String(String::new()),
    }
}

fn substr(s: &str, start: i64, len: i64) -> Value {
    if start < 0 || start as usize >= s.len() {
        return Value::String(String::new());
    }
    let start = start as usize;
    let end = if len < 0 { start } else { (start + len as usize).min(s.len()) };
    Value::String(s.get(start..end).unwrap_or_default().to_owned())
}

fn get_field(obj: &Value, field: &str) -> Result<Value> {
    match obj {
        Value::Struct(cell) => Ok(cell.borrow().fields.get(field).cloned().unwrap_or(Value::Null)),
        _ => Err(fault(PanicReason::TypeMismatch, "GET_FIELD on a non-struct value")),
    }
}

fn set_field(obj: &Value, field: &str, value: Value) -> Result<()> {
    match obj {
        Value::Struct(cell) => {
            cell.borrow_mut().fields.insert(field.to_owned(), value);
            Ok(())
        }
        _ => Err(fault(PanicReason::TypeMismatch, "SET_FIELD on a non-struct value")),
    }
}

fn constant_at(vm: &Vm, handle: InstanceHandle, index: i32) -> Result<Value> {
    let instance = vm.instance(handle).expect("instance alive during dispatch");
    instance
        .bytecode()
        .constants
        .get(index as usize)
        .cloned()
        .ok_or_else(|| fault(PanicReason::InvalidConstantIndex, format!("constant index {index} out of range")))
}

fn load_local(frame: &Frame, index: i32) -> Result<Value> {
    frame
        .locals
        .get(index as usize)
        .cloned()
        .ok_or_else(|| fault(PanicReason::InvalidVariableIndex, format!("variable slot {index} out of range")))
}

fn store_local(frame: &mut Frame, index: i32, value: Value) -> Result<()> {
    let slot = frame
        .locals
        .get_mut(index as usize)
        .ok_or_else(|| fault(PanicReason::InvalidVariableIndex, format!("variable slot {index} out of range")))?;
    *slot = value;
    Ok(())
}

fn static_field_name(vm: &Vm, handle: InstanceHandle, struct_index: i32, field_offset: i32) -> Result<String> {
    let instance = vm.instance(handle).expect("instance alive during dispatch");
    let entry = instance
        .bytecode()
        .structs
        .get(struct_index as usize)
        .ok_or_else(|| fault(PanicReason::InvalidStructIndex, "struct index out of range"))?;
    entry
        .field_names
        .get(field_offset as usize)
        .cloned()
        .ok_or_else(|| fault(PanicReason::InvalidFieldOffset, "field offset out of range"))
}

fn new_struct_instance_static(vm: &Vm, handle: InstanceHandle, struct_index: i32) -> Result<Value> {
    let instance = vm.instance(handle).expect("instance alive during dispatch");
    let bytecode = instance.bytecode();
    let entry = bytecode
        .structs
        .get(struct_index as usize)
        .ok_or_else(|| fault(PanicReason::InvalidStructIndex, "struct index out of range"))?;
    let value = Value::new_struct(entry.name.clone());
    if let Value::Struct(cell) = &value {
        let mut instance_fields = cell.borrow_mut();
        for (i, name) in entry.field_names.iter().enumerate() {
            let const_index = entry.first_const_index as usize + i;
            let default = bytecode.constants.get(const_index).cloned().unwrap_or(Value::Null);
            instance_fields.fields.insert(name.clone(), default);
        }
    }
    Ok(value)
}

fn run_shell(frame: &mut Frame, opcode: Opcode, command: &str, dest: Option<u8>) -> Result<()> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .output()
        .map_err(|e| fault(PanicReason::ProcessSpawnFailed, e.to_string()))?;
    let value = match opcode {
        Opcode::SystemOut => Value::String(String::from_utf8_lossy(&output.stdout).into_owned()),
        Opcode::SystemErr => Value::String(String::from_utf8_lossy(&output.stderr).into_owned()),
        _ => Value::Int(output.status.code().unwrap_or(-1) as i64),
    };
    match dest {
        Some(reg) => frame[reg] = value,
        None => frame.push(value),
    }
    Ok(())
}

/// `CALL c`: pops the callee's declared parameter count of arguments
/// (reversed into declaration order), pushes a new frame, and jumps to the
/// function's entry instruction.
fn call_user(vm: &mut Vm, handle: InstanceHandle, instr: Instruction) -> Result<Step> {
    let instance = vm.instance(handle).expect("instance alive during dispatch");
    let name = instance
        .bytecode()
        .constants
        .get(instr.operand1 as usize)
        .cloned()
        .ok_or_else(|| fault(PanicReason::InvalidConstantIndex, "constant index out of range"))?
        .as_string();
    let bytecode = instance.bytecode.clone();
    let entry = *bytecode
        .function_entries
        .get(&name)
        .ok_or_else(|| fault(PanicReason::UnknownFunction, format!("unknown function `{name}`")))?;
    let param_count =
        *bytecode.function_param_counts.get(&name).ok_or_else(|| {
            fault(PanicReason::UnknownFunction, format!("unknown function `{name}`"))
        })?;

    let instance = vm.instance_mut(handle).expect("instance alive during dispatch");
    let caller_pc = instance.active_frame().pc;
    let caller = instance.active_frame_mut();
    // `pop` yields arguments last-declared-first; `process_results` lets the
    // reversal ride along with the fallible pops instead of collecting twice.
    let args: Vec<Value> = itertools::process_results((0..param_count).map(|_| pop(caller)), |popped| {
        popped.collect::<Vec<_>>().into_iter().rev().collect()
    })?;

    let locals = vec![Value::Null; bytecode.next_var_index as usize];
    let mut new_frame = Frame::new(locals, InstanceHandle::NULL, caller_pc);
    for value in args {
        new_frame.push(value);
    }
    new_frame.pc = entry;
    instance.push_frame(new_frame)?;
    Ok(Step::Continue)
}

/// `CALL_NATIVE c`: pops an explicit argument count then that many
/// arguments, invokes the registered host function, and pushes its result.
fn call_native(vm: &mut Vm, handle: InstanceHandle, instr: Instruction) -> Result<Step> {
    let name = constant_at(vm, handle, instr.operand1)?.as_string();
    let instance = vm.instance_mut(handle).expect("instance alive during dispatch");
    let frame = instance.active_frame_mut();
    let arg_count = pop(frame)?.as_int();
    if arg_count < 0 {
        return Err(fault(PanicReason::ArityMismatch, "negative argument count"));
    }
    let args: Vec<Value> = itertools::process_results((0..arg_count).map(|_| pop(frame)), |popped| {
        popped.collect::<Vec<_>>().into_iter().rev().collect()
    })?;

    let f = vm
        .natives
        .get(&name)
        .cloned()
        .ok_or_else(|| fault(PanicReason::NativeFunctionNotFound, format!("no native function `{name}`")))?;
    let result = f(&args, vm)?;

    let instance = vm.instance_mut(handle).expect("instance alive during dispatch");
    instance.active_frame_mut().push(result);
    Ok(Step::Continue)
}

/// `RETURN`: pops one optional return value, pops the frame. Returning from
/// the bottom frame is a clean halt, not an error.
fn do_return(vm: &mut Vm, handle: InstanceHandle) -> Result<Step> {
    let instance = vm.instance_mut(handle).expect("instance alive during dispatch");
    let finished = instance.active_frame_mut();
    let return_value = finished.pop();

    if instance.call_stack.len() == 1 {
        instance.pop_frame();
        instance.alive = false;
        return Ok(Step::Halt);
    }

    let finished = instance.pop_frame();
    let caller = instance.active_frame_mut();
    caller.pc = finished.return_pc;
    if let Some(value) = return_value {
        caller.push(value);
    }
    Ok(Step::Continue)
}

/// Calls a function by name on an instance that is not currently inside its
/// own dispatch loop — the entry point for the module runtime's
/// `callTrans`/`callExtern` and for invoking a module's exported functions
/// after its top-level script has already run to a `HALT`.
///
/// Unlike `run`, this returns as soon as the pushed frame itself returns
/// rather than running until the instance's bottom frame does, so the
/// instance stays callable afterwards.
pub(super) fn call_function(vm: &mut Vm, handle: InstanceHandle, name: &str, args: Vec<Value>) -> Result<Value> {
    let instance = vm.instance(handle).ok_or_else(|| fault(PanicReason::UnknownFunction, "no such instance"))?;
    let bytecode = instance.bytecode.clone();
    let entry = *bytecode
        .function_entries
        .get(name)
        .ok_or_else(|| fault(PanicReason::UnknownFunction, format!("unknown function `{name}`")))?;
    let param_count = *bytecode
        .function_param_counts
        .get(name)
        .ok_or_else(|| fault(PanicReason::UnknownFunction, format!("unknown function `{name}`")))?;
    if args.len() != param_count as usize {
        return Err(fault(
            PanicReason::ArityMismatch,
            format!("`{name}` expects {param_count} arguments, got {}", args.len()),
        ));
    }

    let instance = vm.instance_mut(handle).expect("checked above");
    let base_depth = instance.call_stack.len();
    // `do_return` restores the pc it finds here onto whichever frame this
    // instruction was sitting below; since that frame didn't actually call
    // us, save and put back its real pc once our own frame is done.
    let base_pc = instance.active_frame().pc;
    let locals = vec![Value::Null; bytecode.next_var_index as usize];
    let mut frame = Frame::new(locals, InstanceHandle::NULL, 0);
    frame.pc = entry;
    for value in args {
        frame.push(value);
    }
    instance.push_frame(frame)?;

    let outcome = run_until_depth(vm, handle, base_depth);

    let instance = vm.instance_mut(handle).expect("checked above");
    // Whether we returned cleanly or faulted partway through, the frames
    // this call pushed must not outlive it — a fault here must leave the
    // instance exactly as callable as it was before this call started.
    instance.call_stack.truncate(base_depth);
    let frame = instance.active_frame_mut();
    frame.pc = base_pc;

    match outcome? {
        Some(value) => Ok(value),
        None => Ok(frame.pop().unwrap_or(Value::Null)),
    }
}

/// Drives the fetch-execute loop until `handle`'s call stack unwinds back
/// to `base_depth`. Returns `Some(Value::Null)` if a `HALT` inside the
/// called function stopped the instance outright (there is no frame left
/// to read a result from in that case), `None` if the call returned
/// normally (the caller reads the result off the top of the stack itself).
fn run_until_depth(vm: &mut Vm, handle: InstanceHandle, base_depth: usize) -> Result<Option<Value>> {
    loop {
        let instr = {
            let instance = vm.instance(handle).expect("instance alive during call");
            let frame = instance.active_frame();
            let pc = frame.pc as usize;
            let instructions = &instance.bytecode().instructions;
            if pc >= instructions.len() {
                return Err(fault(PanicReason::InvalidJumpTarget, "program counter ran off the end of the instruction stream"));
            }
            instructions[pc]
        };
        {
            let instance = vm.instance_mut(handle).expect("checked above");
            instance.active_frame_mut().pc += 1;
        }
        if let Step::Halt = step(vm, handle, instr)? {
            return Ok(Some(Value::Null));
        }

        let instance = vm.instance(handle).expect("instance alive during call");
        if instance.call_stack.len() == base_depth {
            return Ok(None);
        }
    }
}
