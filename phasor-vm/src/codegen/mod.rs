//! Lowers an [`ast::Program`](crate::ast::Program) into a [`Bytecode`].
//!
//! The generator is a single forward pass with two patch-up mechanisms:
//! back-patched jumps (loop/conditional targets aren't known until the body
//! has been laid out) and a bump-and-free register allocator scoped to one
//! expression at a time. Nothing here executes bytecode — see
//! [`crate::interpreter`] for that.

mod registers;

use std::collections::HashMap;

use phasor_isa::{Instruction, Opcode, RegisterId, Value, ValueKind};

use crate::ast::{BinaryOp, Expr, FieldDecl, Param, PostfixOp, Program, Stmt, SwitchCase, TypeNode, UnaryOp};
use crate::bytecode::Bytecode;

use registers::RegisterAllocator;

/// A diagnostic raised while generating code. The generator does not run
/// bytecode, so these are always compile-time issues: unknown identifiers,
/// arity mismatches, or register-allocator exhaustion in a deeply nested
/// expression.
pub type GenResult<T> = Result<T, String>;

struct LoopContext {
    break_jumps: Vec<u32>,
    continue_jumps: Vec<u32>,
}

/// Lowers ASTs to [`Bytecode`]. A single generator can be invoked
/// incrementally: [`Generator::resume`] seeds the variable table and slot
/// cursor from a previous run's output so a REPL's line N can still refer
/// to line N-1's variables by the same slot.
pub struct Generator {
    bytecode: Bytecode,
    /// Best-known static type for each identifier, used only to choose
    /// between integer- and float-specialised opcodes; never consulted by
    /// the interpreter.
    types: HashMap<String, ValueKind>,
    regs: RegisterAllocator,
    loops: Vec<LoopContext>,
}

impl Default for Generator {
    fn default() -> Self {
        Self::new()
    }
}

impl Generator {
    /// A fresh generator with an empty bytecode container.
    pub fn new() -> Self {
        Self { bytecode: Bytecode::new(), types: HashMap::new(), regs: RegisterAllocator::new(), loops: Vec::new() }
    }

    /// A generator seeded with a prior run's variable table, so previously
    /// declared identifiers keep their slot across incremental invocations.
    pub fn resume(variables: std::collections::BTreeMap<String, u32>, next_var_index: u32) -> Self {
        let mut bytecode = Bytecode::new();
        bytecode.variables = variables;
        bytecode.next_var_index = next_var_index;
        Self { bytecode, types: HashMap::new(), regs: RegisterAllocator::new(), loops: Vec::new() }
    }

    /// Lowers `program`, consuming the generator and returning the finished
    /// container.
    pub fn generate(mut self, program: &Program) -> GenResult<Bytecode> {
        for stmt in &program.statements {
            self.lower_stmt(stmt)?;
        }
        self.emit0(Opcode::Halt);
        Ok(self.bytecode)
    }

    // ---- statements ----------------------------------------------------

    fn lower_stmt(&mut self, stmt: &Stmt) -> GenResult<()> {
        match stmt {
            Stmt::VarDecl(name, init) => {
                let reg = match init {
                    Some(expr) => self.lower_expr(expr)?,
                    None => {
                        let r = self.regs.alloc()?;
                        let c = self.bytecode.intern_constant(Value::Null);
                        self.emit_load_const(r, c);
                        r
                    }
                };
                let slot = self.bytecode.intern_variable(name);
                self.emit3(Opcode::StoreVarR, reg as i32, slot_operand(slot), 0);
                self.regs.free(reg);
            }
            Stmt::ExprStmt(expr) => {
                let reg = self.lower_expr(expr)?;
                self.regs.free(reg);
            }
            Stmt::Print(expr) => {
                let reg = self.lower_expr(expr)?;
                self.emit1(Opcode::PushR, reg as i32);
                self.emit0(Opcode::Print);
                self.regs.free(reg);
            }
            Stmt::Import(path) => {
                let c = self.bytecode.intern_constant(Value::String(path.clone()));
                self.emit1(Opcode::Import, c as i32);
            }
            Stmt::Export(inner) => self.lower_stmt(inner)?,
            Stmt::Block(stmts) | Stmt::UnsafeBlock(stmts) => {
                for s in stmts {
                    self.lower_stmt(s)?;
                }
            }
            Stmt::If { cond, then, else_ } => self.lower_if(cond, then, else_.as_deref())?,
            Stmt::While { cond, body } => self.lower_while(cond, body)?,
            Stmt::For { init, cond, incr, body } => self.lower_for(init.as_deref(), cond.as_ref(), incr.as_ref(), body)?,
            Stmt::Switch { value, cases, default } => self.lower_switch(value, cases, default.as_deref())?,
            Stmt::Return(value) => {
                match value {
                    Some(expr) => {
                        let reg = self.lower_expr(expr)?;
                        self.emit1(Opcode::PushR, reg as i32);
                        self.regs.free(reg);
                    }
                    None => {
                        let r = self.regs.alloc()?;
                        let c = self.bytecode.intern_constant(Value::Null);
                        self.emit_load_const(r, c);
                        self.emit1(Opcode::PushR, r as i32);
                        self.regs.free(r);
                    }
                }
                self.emit0(Opcode::Return);
            }
            Stmt::Break => {
                let idx = self.emit1(Opcode::Jump, 0);
                let ctx = self.loops.last_mut().ok_or("`break` outside a loop")?;
                ctx.break_jumps.push(idx);
            }
            Stmt::Continue => {
                let idx = self.emit1(Opcode::Jump, 0);
                let ctx = self.loops.last_mut().ok_or("`continue` outside a loop")?;
                ctx.continue_jumps.push(idx);
            }
            Stmt::FunctionDecl { name, params, ret: _, body } => self.lower_function(name, params, body)?,
            Stmt::StructDecl { name, fields } => self.lower_struct_decl(name, fields),
        }
        Ok(())
    }

    fn lower_if(&mut self, cond: &Expr, then: &[Stmt], else_: Option<&[Stmt]>) -> GenResult<()> {
        let cond_reg = self.lower_expr(cond)?;
        self.emit1(Opcode::PushR, cond_reg as i32);
        self.regs.free(cond_reg);
        let jump_to_else = self.emit1(Opcode::JumpIfFalse, 0);
        for stmt in then {
            self.lower_stmt(stmt)?;
        }
        let jump_to_end = self.emit1(Opcode::Jump, 0);
        self.patch_jump(jump_to_else);
        if let Some(else_body) = else_ {
            for stmt in else_body {
                self.lower_stmt(stmt)?;
            }
        }
        self.patch_jump(jump_to_end);
        Ok(())
    }

    fn lower_while(&mut self, cond: &Expr, body: &[Stmt]) -> GenResult<()> {
        let start = self.bytecode.next_instruction_index();
        let cond_reg = self.lower_expr(cond)?;
        self.emit1(Opcode::PushR, cond_reg as i32);
        self.regs.free(cond_reg);
        let jump_to_end = self.emit1(Opcode::JumpIfFalse, 0);

        self.loops.push(LoopContext { break_jumps: Vec::new(), continue_jumps: Vec::new() });
        for stmt in body {
            self.lower_stmt(stmt)?;
        }
        let ctx = self.loops.pop().expect("pushed above");
        for idx in ctx.continue_jumps {
            self.patch_jump_to(idx, start);
        }
        self.emit1(Opcode::JumpBack, start as i32);
        self.patch_jump(jump_to_end);
        for idx in ctx.break_jumps {
            self.patch_jump(idx);
        }
        Ok(())
    }

    fn lower_for(
        &mut self,
        init: Option<&Stmt>,
        cond: Option<&Expr>,
        incr: Option<&Expr>,
        body: &[Stmt],
    ) -> GenResult<()> {
        if let Some(init) = init {
            self.lower_stmt(init)?;
        }
        let start = self.bytecode.next_instruction_index();
        let jump_to_end = match cond {
            Some(cond) => {
                let reg = self.lower_expr(cond)?;
                self.emit1(Opcode::PushR, reg as i32);
                self.regs.free(reg);
                Some(self.emit1(Opcode::JumpIfFalse, 0))
            }
            None => None,
        };

        self.loops.push(LoopContext { break_jumps: Vec::new(), continue_jumps: Vec::new() });
        for stmt in body {
            self.lower_stmt(stmt)?;
        }
        let ctx = self.loops.pop().expect("pushed above");
        let continue_target = self.bytecode.next_instruction_index();
        for idx in ctx.continue_jumps {
            self.patch_jump_to(idx, continue_target);
        }
        if let Some(incr) = incr {
            let reg = self.lower_expr(incr)?;
            self.regs.free(reg);
        }
        self.emit1(Opcode::JumpBack, start as i32);
        if let Some(idx) = jump_to_end {
            self.patch_jump(idx);
        }
        for idx in ctx.break_jumps {
            self.patch_jump(idx);
        }
        Ok(())
    }

    fn lower_switch(&mut self, value: &Expr, cases: &[SwitchCase], default: Option<&[Stmt]>) -> GenResult<()> {
        let disc_reg = self.lower_expr(value)?;
        let mut end_jumps = Vec::new();
        for case in cases {
            let case_reg = self.lower_expr(&case.value)?;
            let cmp_reg = self.regs.alloc()?;
            self.emit_rrr(Opcode::IEqR, cmp_reg, disc_reg, case_reg);
            self.emit1(Opcode::PushR, cmp_reg as i32);
            self.regs.free(cmp_reg);
            self.regs.free(case_reg);
            let skip = self.emit1(Opcode::JumpIfFalse, 0);
            for stmt in &case.body {
                self.lower_stmt(stmt)?;
            }
            end_jumps.push(self.emit1(Opcode::Jump, 0));
            self.patch_jump(skip);
        }
        if let Some(default_body) = default {
            for stmt in default_body {
                self.lower_stmt(stmt)?;
            }
        }
        for idx in end_jumps {
            self.patch_jump(idx);
        }
        self.regs.free(disc_reg);
        Ok(())
    }

    fn lower_function(&mut self, name: &str, params: &[Param], body: &[Stmt]) -> GenResult<()> {
        let skip = self.emit1(Opcode::Jump, 0);
        let entry = self.bytecode.next_instruction_index();
        self.bytecode.function_entries.insert(name.to_owned(), entry);
        self.bytecode.function_param_counts.insert(name.to_owned(), params.len() as u32);

        // Parameters arrive on the stack in declaration order (the caller
        // popped them in reverse and re-pushed them that way); store them
        // into their slots in reverse so the last `POP_R` lands the first
        // parameter.
        for param in params.iter().rev() {
            let slot = self.bytecode.intern_variable(&param.name);
            self.types.insert(param.name.clone(), type_hint(&param.ty));
            let reg = self.regs.alloc()?;
            self.emit1(Opcode::PopR, reg as i32);
            self.emit3(Opcode::StoreVarR, reg as i32, slot_operand(slot), 0);
            self.regs.free(reg);
        }
        for stmt in body {
            self.lower_stmt(stmt)?;
        }
        // Every path returns: guarantee a trailing `null; return`.
        let r = self.regs.alloc()?;
        let c = self.bytecode.intern_constant(Value::Null);
        self.emit_load_const(r, c);
        self.emit1(Opcode::PushR, r as i32);
        self.regs.free(r);
        self.emit0(Opcode::Return);

        self.patch_jump(skip);
        Ok(())
    }

    fn lower_struct_decl(&mut self, name: &str, fields: &[FieldDecl]) {
        let field_names = fields.iter().map(|f| f.name.clone()).collect();
        self.bytecode.declare_struct(name, field_names);
    }

    // ---- expressions -----------------------------------------------------

    /// Lowers `expr`, returning the register holding its value. Callers
    /// must eventually `self.regs.free` the returned register once they're
    /// done with it.
    fn lower_expr(&mut self, expr: &Expr) -> GenResult<RegisterId> {
        match expr {
            Expr::Number(text) => self.lower_number_literal(text),
            Expr::Str(s) => {
                let r = self.regs.alloc()?;
                let c = self.bytecode.intern_constant(Value::String(s.clone()));
                self.emit_load_const(r, c);
                Ok(r)
            }
            Expr::Bool(b) => {
                let r = self.regs.alloc()?;
                let c = self.bytecode.intern_constant(Value::Bool(*b));
                self.emit_load_const(r, c);
                Ok(r)
            }
            Expr::Null => {
                let r = self.regs.alloc()?;
                let c = self.bytecode.intern_constant(Value::Null);
                self.emit_load_const(r, c);
                Ok(r)
            }
            Expr::Ident(name) => {
                let slot = self.bytecode.intern_variable(name);
                let r = self.regs.alloc()?;
                self.emit3(Opcode::LoadVarR, r as i32, slot_operand(slot), 0);
                Ok(r)
            }
            Expr::Unary(op, inner) => self.lower_unary(*op, inner),
            Expr::Postfix(inner, op) => self.lower_postfix(inner, *op),
            Expr::Binary(op, lhs, rhs) => self.lower_binary(*op, lhs, rhs),
            Expr::Call(name, args) => self.lower_call(name, args),
            Expr::ArrayAccess(arr, index) => self.lower_native2("array_get", arr, index),
            Expr::ArrayLiteral(elems) => self.lower_array_literal(elems),
            Expr::FieldAccess(obj, field) => self.lower_get_field(obj, field),
            Expr::StructInstance(name, inits) => self.lower_struct_instance(name, inits),
            Expr::Assign(lvalue, value) => self.lower_assign(lvalue, value),
        }
    }

    fn lower_number_literal(&mut self, text: &str) -> GenResult<RegisterId> {
        let r = self.regs.alloc()?;
        let value = if let Ok(i) = text.parse::<i64>() {
            Value::Int(i)
        } else {
            let f: f64 = text.parse().map_err(|_| format!("invalid number literal `{text}`"))?;
            Value::Float(f)
        };
        let c = self.bytecode.intern_constant(value);
        self.emit_load_const(r, c);
        Ok(r)
    }

    fn lower_unary(&mut self, op: UnaryOp, inner: &Expr) -> GenResult<RegisterId> {
        match op {
            UnaryOp::Ref | UnaryOp::Deref => self.lower_expr(inner),
            UnaryOp::Neg => {
                let src = self.lower_expr(inner)?;
                let dst = self.regs.alloc()?;
                self.emit2(Opcode::NegR, dst, src);
                self.regs.free(src);
                Ok(dst)
            }
            UnaryOp::Not => {
                let src = self.lower_expr(inner)?;
                let dst = self.regs.alloc()?;
                self.emit2(Opcode::NotR, dst, src);
                self.regs.free(src);
                Ok(dst)
            }
        }
    }

    fn lower_postfix(&mut self, inner: &Expr, op: PostfixOp) -> GenResult<RegisterId> {
        let Expr::Ident(name) = inner else {
            return Err("`++`/`--` require an identifier operand".to_owned());
        };
        let slot = self.bytecode.intern_variable(name);
        let original = self.regs.alloc()?;
        self.emit3(Opcode::LoadVarR, original as i32, slot_operand(slot), 0);

        let one = self.regs.alloc()?;
        let c = self.bytecode.intern_constant(Value::Int(1));
        self.emit_load_const(one, c);

        let updated = self.regs.alloc()?;
        let arith = match op {
            PostfixOp::Inc => Opcode::IAddR,
            PostfixOp::Dec => Opcode::ISubR,
        };
        self.emit_rrr(arith, updated, original, one);
        self.emit3(Opcode::StoreVarR, updated as i32, slot_operand(slot), 0);
        self.regs.free(one);
        self.regs.free(updated);
        Ok(original)
    }

    fn lower_binary(&mut self, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> GenResult<RegisterId> {
        if matches!(op, BinaryOp::And | BinaryOp::Or) {
            return self.lower_short_circuit(op, lhs, rhs);
        }
        if let (Some(folded_lhs), Some(folded_rhs)) = (literal_value(lhs), literal_value(rhs)) {
            if let Some(folded) = fold_binary(op, &folded_lhs, &folded_rhs) {
                let r = self.regs.alloc()?;
                let c = self.bytecode.intern_constant(folded);
                self.emit_load_const(r, c);
                return Ok(r);
            }
        }

        let lhs_kind = self.infer_kind(lhs);
        let rhs_kind = self.infer_kind(rhs);
        let use_float = matches!(lhs_kind, Some(ValueKind::Float)) || matches!(rhs_kind, Some(ValueKind::Float));

        let l = self.lower_expr(lhs)?;
        let r = self.lower_expr(rhs)?;
        let dst = self.regs.alloc()?;
        let opcode = binary_opcode(op, use_float);
        self.emit_rrr(opcode, dst, l, r);
        self.regs.free(l);
        self.regs.free(r);
        Ok(dst)
    }

    fn lower_short_circuit(&mut self, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> GenResult<RegisterId> {
        let lhs_reg = self.lower_expr(lhs)?;
        self.emit1(Opcode::PushR, lhs_reg as i32);
        self.regs.free(lhs_reg);

        let shortcut_jump = match op {
            BinaryOp::And => self.emit1(Opcode::JumpIfFalse, 0),
            BinaryOp::Or => self.emit1(Opcode::JumpIfTrue, 0),
            _ => unreachable!("caller only invokes this for And/Or"),
        };

        let rhs_reg = self.lower_expr(rhs)?;
        self.emit1(Opcode::PushR, rhs_reg as i32);
        self.regs.free(rhs_reg);
        let to_end = self.emit1(Opcode::Jump, 0);

        self.patch_jump(shortcut_jump);
        let shortcut_value = matches!(op, BinaryOp::Or);
        if shortcut_value {
            self.emit0(Opcode::TrueLit);
        } else {
            self.emit0(Opcode::FalseLit);
        }
        self.patch_jump(to_end);

        let result = self.regs.alloc()?;
        self.emit1(Opcode::PopR, result as i32);
        Ok(result)
    }

    fn lower_call(&mut self, name: &str, args: &[Expr]) -> GenResult<RegisterId> {
        if let Some(special) = self.lower_builtin_call(name, args)? {
            return Ok(special);
        }
        if self.bytecode.function_entries.contains_key(name) {
            let expected = *self.bytecode.function_param_counts.get(name).unwrap();
            if expected as usize != args.len() {
                return Err(format!(
                    "function `{name}` takes {expected} argument(s) but {} were supplied",
                    args.len()
                ));
            }
            for arg in args {
                let reg = self.lower_expr(arg)?;
                self.emit1(Opcode::PushR, reg as i32);
                self.regs.free(reg);
            }
            let c = self.bytecode.intern_constant(Value::String(name.to_owned()));
            self.emit1(Opcode::Call, c as i32);
        } else {
            for arg in args {
                let reg = self.lower_expr(arg)?;
                self.emit1(Opcode::PushR, reg as i32);
                self.regs.free(reg);
            }
            let count_const = self.bytecode.intern_constant(Value::Int(args.len() as i64));
            self.emit1(Opcode::PushConst, count_const as i32);
            let c = self.bytecode.intern_constant(Value::String(name.to_owned()));
            self.emit1(Opcode::CallNative, c as i32);
        }
        let result = self.regs.alloc()?;
        self.emit1(Opcode::PopR, result as i32);
        Ok(result)
    }

    /// Recognises source-level calls the generator lowers to a dedicated
    /// opcode instead of a native-function dispatch.
    fn lower_builtin_call(&mut self, name: &str, args: &[Expr]) -> GenResult<Option<RegisterId>> {
        match (name, args) {
            ("len", [s]) => {
                let reg = self.lower_expr(s)?;
                self.emit1(Opcode::PushR, reg as i32);
                self.regs.free(reg);
                self.emit0(Opcode::Len);
                let result = self.regs.alloc()?;
                self.emit1(Opcode::PopR, result as i32);
                Ok(Some(result))
            }
            ("char_at", [s, i]) => Ok(Some(self.lower_char_at(s, i)?)),
            ("substr", [s, start, Expr::Number(n)]) if n == "1" => Ok(Some(self.lower_char_at(s, start)?)),
            ("substr", [s, start, len]) => {
                let s_reg = self.lower_expr(s)?;
                let start_reg = self.lower_expr(start)?;
                let len_reg = self.lower_expr(len)?;
                self.emit1(Opcode::PushR, s_reg as i32);
                self.emit1(Opcode::PushR, start_reg as i32);
                self.emit1(Opcode::PushR, len_reg as i32);
                self.regs.free(s_reg);
                self.regs.free(start_reg);
                self.regs.free(len_reg);
                self.emit0(Opcode::Substr);
                let result = self.regs.alloc()?;
                self.emit1(Opcode::PopR, result as i32);
                Ok(Some(result))
            }
            ("starts_with", [Expr::Str(a), Expr::Str(b)]) => {
                let r = self.regs.alloc()?;
                let c = self.bytecode.intern_constant(Value::Bool(a.starts_with(b.as_str())));
                self.emit_load_const(r, c);
                Ok(Some(r))
            }
            ("ends_with", [Expr::Str(a), Expr::Str(b)]) => {
                let r = self.regs.alloc()?;
                let c = self.bytecode.intern_constant(Value::Bool(a.ends_with(b.as_str())));
                self.emit_load_const(r, c);
                Ok(Some(r))
            }
            _ => Ok(None),
        }
    }

    fn lower_char_at(&mut self, s: &Expr, index: &Expr) -> GenResult<RegisterId> {
        // CHAR_AT pops index, then the string.
        let index_reg = self.lower_expr(index)?;
        let s_reg = self.lower_expr(s)?;
        self.emit1(Opcode::PushR, s_reg as i32);
        self.emit1(Opcode::PushR, index_reg as i32);
        self.regs.free(s_reg);
        self.regs.free(index_reg);
        self.emit0(Opcode::CharAt);
        let result = self.regs.alloc()?;
        self.emit1(Opcode::PopR, result as i32);
        Ok(result)
    }

    /// Lowers a two-argument expression to a `CALL_NATIVE name(a, b)`; used
    /// for operations the ISA has no dedicated opcode for (arrays).
    fn lower_native2(&mut self, name: &str, a: &Expr, b: &Expr) -> GenResult<RegisterId> {
        let a_reg = self.lower_expr(a)?;
        let b_reg = self.lower_expr(b)?;
        self.emit1(Opcode::PushR, a_reg as i32);
        self.emit1(Opcode::PushR, b_reg as i32);
        self.regs.free(a_reg);
        self.regs.free(b_reg);
        let count_const = self.bytecode.intern_constant(Value::Int(2));
        self.emit1(Opcode::PushConst, count_const as i32);
        let c = self.bytecode.intern_constant(Value::String(name.to_owned()));
        self.emit1(Opcode::CallNative, c as i32);
        let result = self.regs.alloc()?;
        self.emit1(Opcode::PopR, result as i32);
        Ok(result)
    }

    fn lower_array_literal(&mut self, elems: &[Expr]) -> GenResult<RegisterId> {
        for elem in elems {
            let reg = self.lower_expr(elem)?;
            self.emit1(Opcode::PushR, reg as i32);
            self.regs.free(reg);
        }
        let count_const = self.bytecode.intern_constant(Value::Int(elems.len() as i64));
        self.emit1(Opcode::PushConst, count_const as i32);
        let c = self.bytecode.intern_constant(Value::String("array_new".to_owned()));
        self.emit1(Opcode::CallNative, c as i32);
        let result = self.regs.alloc()?;
        self.emit1(Opcode::PopR, result as i32);
        Ok(result)
    }

    fn lower_get_field(&mut self, obj: &Expr, field: &str) -> GenResult<RegisterId> {
        let obj_reg = self.lower_expr(obj)?;
        let field_const = self.bytecode.intern_constant(Value::String(field.to_owned()));
        // GET_FIELD pops struct then field name: push field name first.
        self.emit1(Opcode::PushConst, field_const as i32);
        self.emit1(Opcode::PushR, obj_reg as i32);
        self.regs.free(obj_reg);
        self.emit0(Opcode::GetField);
        let result = self.regs.alloc()?;
        self.emit1(Opcode::PopR, result as i32);
        Ok(result)
    }

    fn lower_struct_instance(&mut self, name: &str, inits: &[(String, Expr)]) -> GenResult<RegisterId> {
        let result = self.regs.alloc()?;
        if let Some(&struct_index) = self.bytecode.struct_indices.get(name) {
            self.emit1(Opcode::NewStructInstanceStatic, struct_index as i32);
            self.emit1(Opcode::PopR, result as i32);
            for (field, expr) in inits {
                let value_reg = self.lower_expr(expr)?;
                let offset = self.bytecode.structs[struct_index as usize].field_offset(field);
                match offset {
                    Some(offset) => {
                        self.emit1(Opcode::PushR, value_reg as i32);
                        self.emit1(Opcode::PushR, result as i32);
                        self.emit3(Opcode::SetFieldStatic, struct_index as i32, offset as i32, 0);
                    }
                    None => {
                        let field_const = self.bytecode.intern_constant(Value::String(field.clone()));
                        // SET_FIELD pops struct, then field name, then value: push in
                        // the reverse order so the value ends up on top.
                        self.emit1(Opcode::PushR, result as i32);
                        self.emit1(Opcode::PushConst, field_const as i32);
                        self.emit1(Opcode::PushR, value_reg as i32);
                        self.emit0(Opcode::SetField);
                        self.emit1(Opcode::PopR, result as i32);
                    }
                }
                self.regs.free(value_reg);
            }
        } else {
            let name_const = self.bytecode.intern_constant(Value::String(name.to_owned()));
            self.emit1(Opcode::NewStruct, name_const as i32);
            self.emit1(Opcode::PopR, result as i32);
            for (field, expr) in inits {
                let value_reg = self.lower_expr(expr)?;
                let field_const = self.bytecode.intern_constant(Value::String(field.clone()));
                self.emit1(Opcode::PushR, result as i32);
                self.emit1(Opcode::PushConst, field_const as i32);
                self.emit1(Opcode::PushR, value_reg as i32);
                self.emit0(Opcode::SetField);
                self.emit1(Opcode::PopR, result as i32);
                self.regs.free(value_reg);
            }
        }
        Ok(result)
    }

    fn lower_assign(&mut self, lvalue: &Expr, value: &Expr) -> GenResult<RegisterId> {
        match lvalue {
            Expr::Ident(name) => {
                let value_reg = self.lower_expr(value)?;
                let slot = self.bytecode.intern_variable(name);
                self.emit3(Opcode::StoreVarR, value_reg as i32, slot_operand(slot), 0);
                Ok(value_reg)
            }
            Expr::FieldAccess(obj, field) => {
                let value_reg = self.lower_expr(value)?;
                let obj_reg = self.lower_expr(obj)?;
                let field_const = self.bytecode.intern_constant(Value::String(field.clone()));
                self.emit1(Opcode::PushR, obj_reg as i32);
                self.emit1(Opcode::PushConst, field_const as i32);
                self.emit1(Opcode::PushR, value_reg as i32);
                self.regs.free(obj_reg);
                self.emit0(Opcode::SetField);
                // SET_FIELD re-pushes the struct, not the assigned value.
                self.emit1(Opcode::PopR, value_reg as i32);
                Ok(value_reg)
            }
            Expr::ArrayAccess(arr, index) => {
                let value_reg = self.lower_expr(value)?;
                let arr_reg = self.lower_expr(arr)?;
                let index_reg = self.lower_expr(index)?;
                self.emit1(Opcode::PushR, arr_reg as i32);
                self.emit1(Opcode::PushR, index_reg as i32);
                self.emit1(Opcode::PushR, value_reg as i32);
                self.regs.free(arr_reg);
                self.regs.free(index_reg);
                let count_const = self.bytecode.intern_constant(Value::Int(3));
                self.emit1(Opcode::PushConst, count_const as i32);
                let c = self.bytecode.intern_constant(Value::String("array_set".to_owned()));
                self.emit1(Opcode::CallNative, c as i32);
                self.emit1(Opcode::PopR, value_reg as i32);
                Ok(value_reg)
            }
            _ => Err("invalid assignment target".to_owned()),
        }
    }

    fn infer_kind(&mut self, expr: &Expr) -> Option<ValueKind> {
        match expr {
            Expr::Number(text) => {
                if text.parse::<i64>().is_ok() {
                    Some(ValueKind::Int)
                } else {
                    Some(ValueKind::Float)
                }
            }
            Expr::Str(_) => Some(ValueKind::String),
            Expr::Bool(_) => Some(ValueKind::Bool),
            Expr::Null => Some(ValueKind::Null),
            Expr::Ident(name) => self.types.get(name).copied(),
            _ => None,
        }
    }

    // ---- emission helpers ------------------------------------------------

    fn emit0(&mut self, opcode: Opcode) -> u32 {
        self.bytecode.emit(Instruction::new(opcode))
    }

    fn emit1(&mut self, opcode: Opcode, operand1: i32) -> u32 {
        self.bytecode.emit(Instruction::with_operand(opcode, operand1))
    }

    fn emit2(&mut self, opcode: Opcode, operand1: RegisterId, operand2: RegisterId) -> u32 {
        self.bytecode.emit(Instruction::with_operands2(opcode, operand1 as i32, operand2 as i32))
    }

    /// Raw three-operand emit; callers cast registers to `i32` themselves so
    /// this works uniformly for register-register-register forms and
    /// register-plus-immediate forms (e.g. `STORE_VAR_R`, `SET_FIELD_STATIC`).
    fn emit3(&mut self, opcode: Opcode, operand1: i32, operand2: i32, operand3: i32) -> u32 {
        self.bytecode.emit(Instruction::with_operands3(opcode, operand1, operand2, operand3))
    }

    fn emit_rrr(&mut self, opcode: Opcode, a: RegisterId, b: RegisterId, c: RegisterId) -> u32 {
        self.emit3(opcode, a as i32, b as i32, c as i32)
    }

    fn emit_load_const(&mut self, reg: RegisterId, const_index: u32) -> u32 {
        self.bytecode.emit(Instruction::with_operands2(Opcode::LoadConstR, reg as i32, const_index as i32))
    }

    fn patch_jump(&mut self, instr_index: u32) {
        let target = self.bytecode.next_instruction_index();
        self.patch_jump_to(instr_index, target);
    }

    fn patch_jump_to(&mut self, instr_index: u32, target: u32) {
        self.bytecode.instructions[instr_index as usize].operand1 = target as i32;
    }
}

fn slot_operand(slot: u32) -> i32 {
    slot as i32
}

fn type_hint(ty: &TypeNode) -> ValueKind {
    match ty {
        TypeNode::Int => ValueKind::Int,
        TypeNode::Float => ValueKind::Float,
        TypeNode::Bool => ValueKind::Bool,
        TypeNode::String => ValueKind::String,
        TypeNode::Named(_) => ValueKind::Struct,
    }
}

fn literal_value(expr: &Expr) -> Option<Value> {
    match expr {
        Expr::Number(text) => {
            if let Ok(i) = text.parse::<i64>() {
                Some(Value::Int(i))
            } else {
                text.parse::<f64>().ok().map(Value::Float)
            }
        }
        Expr::Str(s) => Some(Value::String(s.clone())),
        Expr::Bool(b) => Some(Value::Bool(*b)),
        Expr::Null => Some(Value::Null),
        _ => None,
    }
}

fn fold_binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Option<Value> {
    match op {
        BinaryOp::Add => lhs.add(rhs).ok(),
        BinaryOp::Sub => lhs.sub(rhs).ok(),
        BinaryOp::Mul => lhs.mul(rhs).ok(),
        BinaryOp::Div => lhs.div(rhs).ok(),
        BinaryOp::Mod => lhs.rem(rhs).ok(),
        BinaryOp::Eq => Some(Value::Bool(lhs.values_equal(rhs))),
        BinaryOp::Ne => Some(Value::Bool(!lhs.values_equal(rhs))),
        BinaryOp::Lt => lhs.partial_compare(rhs).map(|o| Value::Bool(o.is_lt())),
        BinaryOp::Gt => lhs.partial_compare(rhs).map(|o| Value::Bool(o.is_gt())),
        BinaryOp::Le => lhs.partial_compare(rhs).map(|o| Value::Bool(o.is_le())),
        BinaryOp::Ge => lhs.partial_compare(rhs).map(|o| Value::Bool(o.is_ge())),
        BinaryOp::And | BinaryOp::Or => None,
    }
}

fn binary_opcode(op: BinaryOp, use_float: bool) -> Opcode {
    use BinaryOp::*;
    match (op, use_float) {
        (Add, false) => Opcode::IAddR,
        (Add, true) => Opcode::FlAddR,
        (Sub, false) => Opcode::ISubR,
        (Sub, true) => Opcode::FlSubR,
        (Mul, false) => Opcode::IMulR,
        (Mul, true) => Opcode::FlMulR,
        (Div, false) => Opcode::IDivR,
        (Div, true) => Opcode::FlDivR,
        (Mod, false) => Opcode::IModR,
        (Mod, true) => Opcode::FlModR,
        (Eq, false) => Opcode::IEqR,
        (Eq, true) => Opcode::FlEqR,
        (Ne, false) => Opcode::INeR,
        (Ne, true) => Opcode::FlNeR,
        (Lt, false) => Opcode::ILtR,
        (Lt, true) => Opcode::FlLtR,
        (Gt, false) => Opcode::IGtR,
        (Gt, true) => Opcode::FlGtR,
        (Le, false) => Opcode::ILeR,
        (Le, true) => Opcode::FlLeR,
        (Ge, false) => Opcode::IGeR,
        (Ge, true) => Opcode::FlGeR,
        (And, _) | (Or, _) => unreachable!("short-circuit ops are lowered separately"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Stmt;

    fn num(s: &str) -> Expr {
        Expr::Number(s.to_owned())
    }

    #[test]
    fn constant_folds_pure_literal_arithmetic() {
        let program = Program {
            statements: vec![Stmt::Print(Expr::Binary(
                BinaryOp::Add,
                Box::new(num("1")),
                Box::new(Expr::Binary(BinaryOp::Mul, Box::new(num("2")), Box::new(num("3")))),
            ))],
        };
        let bytecode = Generator::new().generate(&program).unwrap();
        let pushes = bytecode
            .instructions
            .iter()
            .filter(|i| matches!(i.opcode, Opcode::LoadConstR | Opcode::PushConst))
            .count();
        assert_eq!(pushes, 1, "a fully literal expression should fold to a single constant load");
        assert!(bytecode.constants.contains(&Value::Int(7)));
    }

    #[test]
    fn variable_slots_are_stable_across_a_function_body() {
        let program = Program {
            statements: vec![
                Stmt::VarDecl("x".into(), Some(num("1"))),
                Stmt::ExprStmt(Expr::Assign(Box::new(Expr::Ident("x".into())), Box::new(num("2")))),
            ],
        };
        let bytecode = Generator::new().generate(&program).unwrap();
        assert_eq!(bytecode.variables.get("x"), Some(&0));
        assert_eq!(bytecode.next_var_index, 1);
    }

    #[test]
    fn short_circuit_and_emits_a_conditional_jump() {
        let program = Program {
            statements: vec![Stmt::ExprStmt(Expr::Binary(
                BinaryOp::And,
                Box::new(Expr::Bool(false)),
                Box::new(Expr::Bool(true)),
            ))],
        };
        let bytecode = Generator::new().generate(&program).unwrap();
        assert!(bytecode.instructions.iter().any(|i| i.opcode == Opcode::JumpIfFalse));
    }
}
