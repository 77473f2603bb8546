//! Lowers the simplified syntax tree to bytecode.
//!
//! Grounded on `axiom/src/compiler.rs`'s `RegAlloc`/`GlobalTable`/`Compiler`
//! shape, alloc_temp/free_temp, and break-patch lists, generalized to a
//! unified name-stack/frame-pointer model: one signed-byte `Loc` addresses
//! both locals (non-negative, offsets from the frame pointer) and registers
//! (negative, scratch slots below it), rather than a separate
//! always-non-negative register file.

use crate::ast::{BinaryOp, LogicalOp, Node, UnaryOp};
use crate::bytecode::{Loc, Op, Writer, HEADER_LEN};
use crate::errors::IonError;
use std::collections::HashMap;
use tracing::debug;

/// A host function's compile-time-checkable signature: argument count is
/// checked against `min_args`/`max_args` at compile time.
#[derive(Clone, Copy)]
pub struct HostSignature {
    pub group: u16,
    pub fid: u16,
    pub min_args: i32,
    /// `-1` means unbounded.
    pub max_args: i32,
}

struct FuncScope {
    /// Index into `names` where this function's own locals begin.
    frame_pointer: usize,
    /// Current depth of allocated registers (0 = none reserved).
    reg_depth: u8,
    /// High-water mark of `reg_depth`, the `N` the function's `Reg N`
    /// preamble must reserve.
    reg_max: u8,
    /// Bytecode offset of the `Reg` opcode's immediate byte, patched once
    /// `reg_max` is final.
    reg_patch_at: u32,
}

struct LoopScope {
    /// Name-stack size to restore to (via `Pop`/`PopN`) on `break`/`continue`.
    unwind_names: usize,
    /// Jump-target offset `continue` should resolve to once known. `for`
    /// loops don't know this until the step clause is compiled, so
    /// `continue` jumps are queued in `continue_fixups` instead when this is
    /// `None`.
    continue_target: Option<u32>,
    break_fixups: Vec<u32>,
    continue_fixups: Vec<u32>,
}

pub struct Compiler {
    writer: Writer,
    /// The name stack: one entry per interned local/temporary name
    /// currently visible, partitioned per function by `FuncScope::frame_pointer`.
    names: Vec<String>,
    funcs: Vec<FuncScope>,
    loops: Vec<LoopScope>,
    var_decl_allowed: Vec<bool>,
    /// Global script-function name -> its location in the root frame.
    functions: HashMap<String, Loc>,
    host_functions: HashMap<String, HostSignature>,
    /// Swapped in during a declare-only pre-pass so emitted bytes are
    /// discarded while name/register bookkeeping still happens for real.
    suppressed: Option<Writer>,
}

const MAX_REGISTERS: u8 = 127;

impl Compiler {
    pub fn new(host_functions: HashMap<String, HostSignature>) -> Self {
        Compiler {
            writer: Writer::new(),
            names: Vec::new(),
            funcs: vec![FuncScope { frame_pointer: 0, reg_depth: 0, reg_max: 0, reg_patch_at: 0 }],
            loops: Vec::new(),
            var_decl_allowed: vec![false],
            functions: HashMap::new(),
            host_functions,
            suppressed: None,
        }
    }

    pub fn compile_program(mut self, program: &Node) -> Result<Vec<u8>, IonError> {
        let reg_placeholder_at = self.emit_op_return_offset(&Op::Reg(0));
        self.funcs[0].reg_patch_at = reg_placeholder_at;

        match program {
            Node::Block { statements, .. } => {
                for stmt in statements {
                    self.compile_statement(stmt)?;
                }
            }
            other => self.compile_statement(other)?,
        }
        self.emit(&Op::ReturnNil);
        self.patch_reg_preamble(0);
        let bytecode = self.writer.finish();
        debug!(
            "compiled program: {} bytes, {} names interned, root registers {}",
            bytecode.len(),
            self.names.len(),
            self.funcs[0].reg_max
        );
        Ok(bytecode)
    }

    // ------------------------------------------------------------------
    // emission helpers (honor the declare-only suppression flag)
    // ------------------------------------------------------------------

    fn emit(&mut self, op: &Op) {
        let target = self.suppressed.as_mut().unwrap_or(&mut self.writer);
        target.emit(op);
    }

    fn emit_op_return_offset(&mut self, op: &Op) -> u32 {
        let target = self.suppressed.as_mut().unwrap_or(&mut self.writer);
        let at = target.current_offset() + 1; // +1 to skip the tag byte
        target.emit(op);
        at
    }

    fn current_offset(&self) -> u32 {
        self.suppressed.as_ref().unwrap_or(&self.writer).current_offset()
    }

    /// Emits `JumpCond { loc, target: 0 }` and returns the offset of the
    /// `target` field specifically (tag byte + `loc` byte precede it, unlike
    /// `Jump`'s immediate which sits right after its tag).
    fn emit_jump_cond(&mut self, loc: Loc) -> u32 {
        let target_offset = self.current_offset() + 2;
        self.emit(&Op::JumpCond { loc, target: 0 });
        target_offset
    }

    fn patch_jump(&mut self, at: u32, target: u32) {
        let absolute_target = target + HEADER_LEN as u32;
        self.suppressed
            .as_mut()
            .unwrap_or(&mut self.writer)
            .patch_u32(at, absolute_target);
    }

    fn patch_reg_preamble(&mut self, func_index: usize) {
        let (at, n) = {
            let f = &self.funcs[func_index];
            (f.reg_patch_at, f.reg_max)
        };
        self.writer.patch_u8(at, n);
    }

    fn var_decl_allowed(&self) -> bool {
        *self.var_decl_allowed.last().unwrap()
    }

    // ------------------------------------------------------------------
    // name stack / registers
    // ------------------------------------------------------------------

    fn current_func(&mut self) -> &mut FuncScope {
        self.funcs.last_mut().unwrap()
    }

    fn frame_pointer(&self) -> usize {
        self.funcs.last().unwrap().frame_pointer
    }

    fn find_local(&self, name: &str) -> Option<Loc> {
        let fp = self.frame_pointer();
        self.names[fp..]
            .iter()
            .position(|n| n == name)
            .map(|i| i as Loc)
    }

    fn declare_local(&mut self, name: impl Into<String>) -> Loc {
        let fp = self.frame_pointer();
        self.names.push(name.into());
        (self.names.len() - 1 - fp) as Loc
    }

    fn pop_locals_to(&mut self, line: u32, names_len: usize) {
        let _ = line;
        let fp = self.frame_pointer();
        let current = self.names.len();
        if current > names_len {
            let n = (current - names_len) as u8;
            if n == 1 {
                self.emit(&Op::Pop);
            } else {
                self.emit(&Op::PopN(n));
            }
            self.names.truncate(names_len);
        }
        let _ = fp;
    }

    fn alloc_temp(&mut self) -> Loc {
        let f = self.current_func();
        f.reg_depth += 1;
        if f.reg_depth > f.reg_max {
            f.reg_max = f.reg_depth;
        }
        if f.reg_depth > MAX_REGISTERS {
            // caught by callers via `alloc_temp_checked`; this path only
            // runs when a caller skipped the check, which should not happen.
        }
        -(f.reg_depth as i32) as Loc
    }

    fn alloc_temp_checked(&mut self, line: u32) -> Result<Loc, IonError> {
        if self.current_func().reg_depth >= MAX_REGISTERS {
            return Err(self.semantic_error(
                line,
                "function requires more registers than the 127 scratch slots a location byte can address",
            ));
        }
        Ok(self.alloc_temp())
    }

    fn free_temp(&mut self, loc: Loc) {
        if loc < 0 {
            let depth = (-loc) as u8;
            let f = self.current_func();
            if depth == f.reg_depth {
                f.reg_depth -= 1;
            }
        }
    }

    fn semantic_error(&self, line: u32, message: impl Into<String>) -> IonError {
        IonError::semantic(
            crate::errors::Pos { line, column: 0, offset: 0 },
            message,
            "",
        )
    }

    // ------------------------------------------------------------------
    // literal interning
    // ------------------------------------------------------------------

    fn intern_number(&mut self, value: f64) -> Loc {
        let key = crate::value::format_number_for_interning(value);
        if let Some(loc) = self.find_local(&key) {
            return loc;
        }
        let loc = self.declare_local(key);
        self.emit(&Op::PushN(value));
        loc
    }

    fn intern_string(&mut self, value: &str) -> Loc {
        let key = format!("${value}");
        if let Some(loc) = self.find_local(&key) {
            return loc;
        }
        let loc = self.declare_local(key);
        self.emit(&Op::PushS(value.to_string()));
        loc
    }

    fn intern_bool(&mut self, value: bool) -> Loc {
        let key = value.to_string();
        if let Some(loc) = self.find_local(&key) {
            return loc;
        }
        let loc = self.declare_local(key);
        self.emit(&Op::PushB(value));
        loc
    }

    fn intern_nil(&mut self, line: u32) -> Result<Loc, IonError> {
        let loc = self.alloc_temp_checked(line)?;
        self.emit(&Op::StoreAtNil(loc));
        Ok(loc)
    }

    // ------------------------------------------------------------------
    // statements
    // ------------------------------------------------------------------

    fn compile_statement(&mut self, node: &Node) -> Result<(), IonError> {
        match node {
            Node::ExprStmt { expr, .. } => {
                let loc = self.compile_expr(expr)?;
                self.free_temp(loc);
                Ok(())
            }
            Node::Block { statements, .. } => self.compile_block(statements),
            Node::If { cond, then_branch, else_branch, line } => {
                self.compile_if(cond, then_branch, else_branch.as_deref(), *line)
            }
            Node::While { cond, body, line } => self.compile_while(cond, body, *line),
            Node::For { init, cond, step, body, line } => {
                self.compile_for(init.as_deref(), cond.as_deref(), step.as_deref(), body, *line)
            }
            Node::FunctionDef { name, params, body, line } => {
                self.compile_function_def(name, params, body, *line)
            }
            Node::Return { value, line } => {
                match value {
                    Some(expr) => {
                        let loc = self.compile_expr(expr)?;
                        self.emit(&Op::Return(loc));
                        self.free_temp(loc);
                    }
                    None => self.emit(&Op::ReturnNil),
                }
                let _ = line;
                Ok(())
            }
            Node::Break { line } => {
                let loop_idx = self.loops.len().checked_sub(1).ok_or_else(|| {
                    self.semantic_error(*line, "'break' outside of a loop")
                })?;
                let unwind = self.loops[loop_idx].unwind_names;
                self.pop_locals_to(*line, unwind);
                let at = self.emit_op_return_offset(&Op::Jump(0));
                self.loops[loop_idx].break_fixups.push(at);
                Ok(())
            }
            Node::Continue { line } => {
                let loop_idx = self.loops.len().checked_sub(1).ok_or_else(|| {
                    self.semantic_error(*line, "'continue' outside of a loop")
                })?;
                let unwind = self.loops[loop_idx].unwind_names;
                self.pop_locals_to(*line, unwind);
                match self.loops[loop_idx].continue_target {
                    Some(target) => {
                        let at = self.emit_op_return_offset(&Op::Jump(0));
                        self.patch_jump(at, target);
                    }
                    None => {
                        let at = self.emit_op_return_offset(&Op::Jump(0));
                        self.loops[loop_idx].continue_fixups.push(at);
                    }
                }
                Ok(())
            }
            other => {
                let loc = self.compile_expr(other)?;
                self.free_temp(loc);
                Ok(())
            }
        }
    }

    fn compile_block(&mut self, statements: &[Node]) -> Result<(), IonError> {
        let saved = self.names.len();
        for stmt in statements {
            self.compile_statement(stmt)?;
        }
        self.pop_locals_to(0, saved);
        Ok(())
    }

    fn compile_if(
        &mut self,
        cond: &Node,
        then_branch: &Node,
        else_branch: Option<&Node>,
        line: u32,
    ) -> Result<(), IonError> {
        let cond_loc = self.compile_expr(cond)?;
        let jump_to_else = self.emit_jump_cond(cond_loc);
        self.free_temp(cond_loc);
        self.compile_statement(then_branch)?;
        if let Some(else_branch) = else_branch {
            let jump_to_end = self.emit_op_return_offset(&Op::Jump(0));
            let else_at = self.current_offset();
            self.patch_jump(jump_to_else, else_at);
            self.compile_statement(else_branch)?;
            let end_at = self.current_offset();
            self.patch_jump(jump_to_end, end_at);
        } else {
            let end_at = self.current_offset();
            self.patch_jump(jump_to_else, end_at);
        }
        let _ = line;
        Ok(())
    }

    fn compile_while(&mut self, cond: &Node, body: &Node, line: u32) -> Result<(), IonError> {
        let saved_names = self.names.len();

        // Declare-only pre-pass: register any names the condition would
        // declare so they keep a stable location across every iteration.
        let dummy = std::mem::replace(&mut self.suppressed, Some(Writer::new()));
        let prepass = self.compile_expr(cond);
        self.suppressed = dummy;
        prepass?;

        let loop_start = self.current_offset();
        self.loops.push(LoopScope {
            unwind_names: saved_names,
            continue_target: Some(loop_start),
            break_fixups: Vec::new(),
            continue_fixups: Vec::new(),
        });

        let cond_loc = self.compile_expr(cond)?;
        let exit_jump = self.emit_jump_cond(cond_loc);
        self.free_temp(cond_loc);
        self.compile_statement(body)?;
        let back_at = self.emit_op_return_offset(&Op::Jump(0));
        self.patch_jump(back_at, loop_start);
        let end_at = self.current_offset();
        self.patch_jump(exit_jump, end_at);

        let scope = self.loops.pop().unwrap();
        for fixup in scope.break_fixups {
            self.patch_jump(fixup, end_at);
        }
        self.pop_locals_to(line, saved_names);
        Ok(())
    }

    fn compile_for(
        &mut self,
        init: Option<&Node>,
        cond: Option<&Node>,
        step: Option<&Node>,
        body: &Node,
        line: u32,
    ) -> Result<(), IonError> {
        let saved_names = self.names.len();
        if let Some(init) = init {
            let loc = self.compile_expr(init)?;
            self.free_temp(loc);
        }

        if let Some(cond) = cond {
            let dummy = std::mem::replace(&mut self.suppressed, Some(Writer::new()));
            let prepass = self.compile_expr(cond);
            self.suppressed = dummy;
            prepass?;
        }

        let loop_start = self.current_offset();
        self.loops.push(LoopScope {
            unwind_names: saved_names,
            continue_target: None,
            break_fixups: Vec::new(),
            continue_fixups: Vec::new(),
        });

        let exit_jump = if let Some(cond) = cond {
            let cond_loc = self.compile_expr(cond)?;
            let at = self.emit_jump_cond(cond_loc);
            self.free_temp(cond_loc);
            Some(at)
        } else {
            None
        };

        self.compile_statement(body)?;

        let step_start = self.current_offset();
        if let Some(step) = step {
            let loc = self.compile_expr(step)?;
            self.free_temp(loc);
        }
        let back_at = self.emit_op_return_offset(&Op::Jump(0));
        self.patch_jump(back_at, loop_start);
        let end_at = self.current_offset();
        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump, end_at);
        }

        let scope = self.loops.pop().unwrap();
        for fixup in scope.continue_fixups {
            self.patch_jump(fixup, step_start);
        }
        for fixup in scope.break_fixups {
            self.patch_jump(fixup, end_at);
        }
        self.pop_locals_to(line, saved_names);
        Ok(())
    }

    fn compile_function_def(
        &mut self,
        name: &str,
        params: &[String],
        body: &Node,
        line: u32,
    ) -> Result<(), IonError> {
        // The binding is a local in the enclosing frame; patched with the
        // entry/arity/register count once the body is compiled.
        let binding_loc = self.declare_local(name.to_string());
        if self.funcs.len() == 1 {
            self.functions.insert(name.to_string(), binding_loc);
        }
        let binding_at = self.emit_op_return_offset(&Op::StoreAtFunction {
            loc: binding_loc,
            entry: 0,
            n_args: params.len() as u8,
            n_regs: 0,
        });

        let skip_body = self.emit_op_return_offset(&Op::Jump(0));
        let entry = self.current_offset();

        let reg_patch_at = self.emit_op_return_offset(&Op::Reg(0));
        self.funcs.push(FuncScope {
            frame_pointer: self.names.len(),
            reg_depth: 0,
            reg_max: 0,
            reg_patch_at,
        });
        for param in params {
            self.declare_local(param.clone());
        }
        self.var_decl_allowed.push(false);
        let result = self.compile_statement(body);
        self.var_decl_allowed.pop();
        self.emit(&Op::ReturnNil);
        let func_index = self.funcs.len() - 1;
        self.patch_reg_preamble(func_index);
        let func = self.funcs.pop().unwrap();
        self.names.truncate(func.frame_pointer);
        result?;

        let after = self.current_offset();
        self.patch_jump(skip_body, after);

        self.patch_function_entry(binding_at, entry, params.len() as u8, func.reg_max);
        let _ = line;
        Ok(())
    }

    fn patch_function_entry(&mut self, at: u32, entry: u32, n_args: u8, n_regs: u8) {
        // `at` points at the start of `StoreAtFunction`'s `loc` byte; entry
        // follows it (1 byte loc, then 4-byte entry, then n_args, n_regs).
        let entry_at = at + 1;
        let absolute_entry = entry + HEADER_LEN as u32;
        self.writer.patch_u32(entry_at, absolute_entry);
        self.writer.patch_u8(entry_at + 4, n_args);
        self.writer.patch_u8(entry_at + 5, n_regs);
    }

    // ------------------------------------------------------------------
    // expressions — return the Loc holding the result
    // ------------------------------------------------------------------

    fn compile_expr(&mut self, node: &Node) -> Result<Loc, IonError> {
        match node {
            Node::Nil { line } => self.intern_nil(*line),
            Node::Number { value, .. } => Ok(self.intern_number(*value)),
            Node::String { value, .. } => Ok(self.intern_string(value)),
            Node::Boolean { value, .. } => Ok(self.intern_bool(*value)),
            Node::Identifier { name, line } => self.compile_identifier(name, *line),
            Node::List { items, line } => self.compile_list(items, *line),
            Node::Dictionary { entries, line } => self.compile_dictionary(entries, *line),
            Node::Unary { op, operand, line } => self.compile_unary(*op, operand, *line),
            Node::Binary { op, left, right, line } => self.compile_binary(*op, left, right, *line),
            Node::Logical { op, left, right, line } => self.compile_logical(*op, left, right, *line),
            Node::Assign { target, value, line } => self.compile_assign(target, value, *line),
            Node::Index { container, index, line } => self.compile_index_get(container, index, *line),
            Node::Call { callee, args, line } => self.compile_call(callee, args, *line),
            other => Err(self.semantic_error(other.line(), "expression cannot appear here")),
        }
    }

    fn compile_identifier(&mut self, name: &str, line: u32) -> Result<Loc, IonError> {
        if let Some(loc) = self.find_local(name) {
            return Ok(loc);
        }
        if self.var_decl_allowed() {
            Ok(self.declare_local(name.to_string()))
        } else {
            Err(self.semantic_error(line, format!("undefined variable {name:?}")))
        }
    }

    fn compile_list(&mut self, items: &[Node], line: u32) -> Result<Loc, IonError> {
        let list_loc = self.alloc_temp_checked(line)?;
        self.emit(&Op::ListNew(list_loc));
        for item in items {
            let v = self.compile_expr(item)?;
            self.emit(&Op::ListAdd { list: list_loc, value: v });
            self.free_temp(v);
        }
        Ok(list_loc)
    }

    fn compile_dictionary(&mut self, entries: &[(Node, Node)], line: u32) -> Result<Loc, IonError> {
        let dict_loc = self.alloc_temp_checked(line)?;
        self.emit(&Op::DictionaryNew(dict_loc));
        for (key, value) in entries {
            let k = self.compile_expr(key)?;
            let v = self.compile_expr(value)?;
            self.emit(&Op::DictionaryAdd { dict: dict_loc, key: k, value: v });
            self.free_temp(v);
            self.free_temp(k);
        }
        Ok(dict_loc)
    }

    fn compile_unary(&mut self, op: UnaryOp, operand: &Node, line: u32) -> Result<Loc, IonError> {
        let a = self.compile_expr(operand)?;
        match op {
            UnaryOp::Not => {
                let dst = self.alloc_temp_checked(line)?;
                self.emit(&Op::Not { dst, a });
                self.free_temp(a);
                Ok(dst)
            }
            UnaryOp::Negate => {
                // `-x` lowers to `0 - x`; no dedicated negate opcode exists
                // in the emitted instruction set.
                let zero = self.intern_number(0.0);
                let dst = self.alloc_temp_checked(line)?;
                self.emit(&Op::Sub(dst, zero, a));
                self.free_temp(a);
                Ok(dst)
            }
        }
    }

    fn compile_binary(
        &mut self,
        op: BinaryOp,
        left: &Node,
        right: &Node,
        line: u32,
    ) -> Result<Loc, IonError> {
        let a = self.compile_expr(left)?;
        let b = self.compile_expr(right)?;
        let dst = self.alloc_temp_checked(line)?;
        let ctor: fn(Loc, Loc, Loc) -> Op = match op {
            BinaryOp::Add => Op::Add,
            BinaryOp::Sub => Op::Sub,
            BinaryOp::Mul => Op::Mul,
            BinaryOp::Div => Op::Div,
            BinaryOp::Eq => Op::Eq,
            BinaryOp::Neq => Op::Neq,
            BinaryOp::Lt => Op::Ls,
            BinaryOp::Le => Op::Lse,
            BinaryOp::Gt => Op::Gr,
            BinaryOp::Ge => Op::Gre,
        };
        self.emit(&ctor(dst, a, b));
        self.free_temp(b);
        self.free_temp(a);
        Ok(dst)
    }

    /// `and`/`or` are short-circuiting (operands coerce via truthiness, and
    /// real-world scripts rely on short-circuit for guard
    /// idioms), so they lower to a jump rather than the unconditional
    /// `And`/`Or` opcodes — those opcodes back the simplifier's folded
    /// constant-operand case and the `!`/non-short-circuit boolean algebra,
    /// not this operator.
    fn compile_logical(
        &mut self,
        op: LogicalOp,
        left: &Node,
        right: &Node,
        line: u32,
    ) -> Result<Loc, IonError> {
        let dst = self.alloc_temp_checked(line)?;
        let a = self.compile_expr(left)?;
        self.emit(&Op::Move { dst, src: a });
        self.free_temp(a);
        let short_circuit_jump = match op {
            LogicalOp::And => self.emit_jump_cond(dst),
            LogicalOp::Or => {
                let negated = self.alloc_temp_checked(line)?;
                self.emit(&Op::Not { dst: negated, a: dst });
                let at = self.emit_jump_cond(negated);
                self.free_temp(negated);
                at
            }
        };
        let b = self.compile_expr(right)?;
        self.emit(&Op::Move { dst, src: b });
        self.free_temp(b);
        let end = self.current_offset();
        self.patch_jump(short_circuit_jump, end);
        Ok(dst)
    }

    fn compile_assign(&mut self, target: &Node, value: &Node, line: u32) -> Result<Loc, IonError> {
        match target {
            Node::Identifier { name, .. } => {
                self.var_decl_allowed.push(true);
                let loc = self.compile_identifier(name, line);
                self.var_decl_allowed.pop();
                let loc = loc?;
                let v = self.compile_expr(value)?;
                if v != loc {
                    self.emit(&Op::Move { dst: loc, src: v });
                    self.free_temp(v);
                }
                Ok(loc)
            }
            Node::Index { container, index, .. } => {
                let container_loc = self.compile_expr(container)?;
                let index_loc = self.compile_expr(index)?;
                let value_loc = self.compile_expr(value)?;
                self.emit(&Op::Set { value: value_loc, container: container_loc, index: index_loc });
                self.free_temp(index_loc);
                self.free_temp(container_loc);
                Ok(value_loc)
            }
            other => Err(self.semantic_error(other.line(), "invalid assignment target")),
        }
    }

    fn compile_index_get(&mut self, container: &Node, index: &Node, line: u32) -> Result<Loc, IonError> {
        let container_loc = self.compile_expr(container)?;
        let index_loc = self.compile_expr(index)?;
        let dst = self.alloc_temp_checked(line)?;
        self.emit(&Op::Get { dst, container: container_loc, index: index_loc });
        self.free_temp(index_loc);
        self.free_temp(container_loc);
        Ok(dst)
    }

    /// Resolves the callee in order: (a) local, (b) previously-defined
    /// global script function, (c) registered host function.
    fn compile_call(&mut self, callee: &str, args: &[Node], line: u32) -> Result<Loc, IonError> {
        if let Some(loc) = self.find_local(callee) {
            return self.compile_script_call(loc, args, line, false);
        }
        if let Some(&loc) = self.functions.get(callee) {
            return self.compile_script_call(loc, args, line, true);
        }
        if let Some(sig) = self.host_functions.get(callee).copied() {
            return self.compile_host_call(sig, args, line);
        }
        Err(self.semantic_error(line, format!("call to undefined function {callee:?}")))
    }

    fn compile_script_call(
        &mut self,
        callee_loc: Loc,
        args: &[Node],
        line: u32,
        global: bool,
    ) -> Result<Loc, IonError> {
        if global {
            self.emit(&Op::PrepareCallGlobal(callee_loc));
        } else {
            self.emit(&Op::PrepareCallLocal(callee_loc));
        }
        let mut arg_locs = Vec::with_capacity(args.len());
        for arg in args {
            let loc = self.compile_expr(arg)?;
            self.emit(&Op::PushVal(loc));
            arg_locs.push(loc);
        }
        if global {
            self.emit(&Op::CallScriptGlobal { loc: callee_loc, n_args: args.len() as u8 });
        } else {
            self.emit(&Op::CallScriptLocal { loc: callee_loc, n_args: args.len() as u8 });
        }
        for loc in arg_locs.into_iter().rev() {
            self.free_temp(loc);
        }
        self.alloc_temp_checked(line).map(|dst| {
            self.emit(&Op::PopTo(dst));
            dst
        })
    }

    fn compile_host_call(&mut self, sig: HostSignature, args: &[Node], line: u32) -> Result<Loc, IonError> {
        let n = args.len() as i32;
        if n < sig.min_args || (sig.max_args >= 0 && n > sig.max_args) {
            return Err(self.semantic_error(
                line,
                format!(
                    "wrong number of arguments: expected {}..{}, got {n}",
                    sig.min_args,
                    if sig.max_args < 0 { "unbounded".to_string() } else { sig.max_args.to_string() }
                ),
            ));
        }
        let mut arg_locs = Vec::with_capacity(args.len());
        for arg in args {
            let loc = self.compile_expr(arg)?;
            self.emit(&Op::PushVal(loc));
            arg_locs.push(loc);
        }
        self.emit(&Op::CallHost { group: sig.group, fid: sig.fid, n_args: args.len() as u8 });
        for loc in arg_locs.into_iter().rev() {
            self.free_temp(loc);
        }
        let dst = self.alloc_temp_checked(line)?;
        self.emit(&Op::PopTo(dst));
        Ok(dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    fn compile(src: &str) -> Vec<u8> {
        let tree = Parser::new(src).unwrap().parse_program().unwrap();
        Compiler::new(HashMap::new()).compile_program(&tree).unwrap()
    }

    #[test]
    fn program_starts_with_header() {
        let bytes = compile("x = 1");
        assert_eq!(&bytes[0..4], &193_687u32.to_be_bytes());
        assert_eq!(&bytes[4..8], &1u32.to_be_bytes());
    }

    #[test]
    fn register_reuse_bounded_for_long_additive_chain() {
        let bytes = compile("a = 1 + 2 + 3 + 4 + 5");
        // byte 12 is the tag for the root Reg op, byte 13 its N immediate.
        assert_eq!(bytes[12], 1, "expected Reg opcode tag at program start");
        assert!(bytes[13] <= 2, "expected N <= 2, got {}", bytes[13]);
    }

    #[test]
    fn undefined_variable_read_is_semantic_error() {
        let tree = Parser::new("x = y").unwrap().parse_program().unwrap();
        assert!(Compiler::new(HashMap::new()).compile_program(&tree).is_err());
    }

    #[test]
    fn assignment_to_undeclared_name_declares_it() {
        let tree = Parser::new("y = 1").unwrap().parse_program().unwrap();
        assert!(Compiler::new(HashMap::new()).compile_program(&tree).is_ok());
    }
}
