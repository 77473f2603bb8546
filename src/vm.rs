//! Stack-based bytecode interpreter.
//!
//! Grounded on `axiom/src/vm.rs`'s `FlatVM`/`VMState`/`StackFrame`
//! fetch-execute loop and cooperative pause/resume, generalized from an
//! always-register-file addressing mode to the unified `Loc`-addressed
//! locals+registers used here, and from its `BinOp`/`UnOp` dispatch table to
//! `bytecode::Op`.

use crate::bytecode::{Loc, Op, Reader, HEADER_LEN};
use crate::errors::IonError;
use crate::value::{ScriptFunction, Value};
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{debug, trace};

/// Where execution currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Finished,
    Running,
    /// A `CallHost` is in flight; the host must call `return_value` on the
    /// active `CallManager` exactly once before resuming.
    WaitingForReturn,
    /// Suspended by `pause()`; resumes on the next `go_on()`.
    Paused,
}

struct ActivationRecord {
    return_cursor: usize,
    /// Index into `stack` where this frame's locals/registers begin.
    base: usize,
    /// `stack.len()` snapshot to truncate back to if the callee returns
    /// through an error unwind.
    stack_size_at_call: usize,
}

/// Signature of a host function reachable from script: receives the
/// arguments pushed by the call site and a text sink for `print`-like
/// output, returns the value to hand back to the script.
pub type HostFn = Rc<dyn Fn(&mut CallManager) -> Result<(), IonError>>;

/// The view a host callback gets into the values passed at a `CallHost` site,
/// and the single slot it must fill with a return value — `return_value`
/// is expected to be called exactly once.
pub struct CallManager<'a> {
    args: &'a [Value],
    result: Option<Value>,
    pub sink: &'a mut dyn std::io::Write,
    pub globals: &'a mut HashMap<String, Value>,
}

impl<'a> CallManager<'a> {
    pub fn args(&self) -> &[Value] {
        self.args
    }

    pub fn arg(&self, index: usize) -> Result<&Value, IonError> {
        self.args
            .get(index)
            .ok_or_else(|| IonError::runtime(format!("missing argument {index}")))
    }

    pub fn return_value(&mut self, value: Value) {
        self.result = Some(value);
    }
}

const DEFAULT_MAX_CALL_DEPTH: usize = 256;

/// Executes one compiled program.
pub struct Vm {
    bytes: Vec<u8>,
    cursor: usize,
    /// Combined locals+registers+operand stack: any `Loc` indexes
    /// `stack[frame.base + loc]` under ordinary signed arithmetic, so
    /// non-negative locs address locals at/above the base and negative locs
    /// address registers in the region reserved just below it.
    stack: Vec<Value>,
    /// The explicit push/pop operand stack used by the call protocol,
    /// separate from the locals/registers array.
    operands: Vec<Value>,
    frames: Vec<ActivationRecord>,
    state: RunState,
    host_functions: HashMap<(u16, u16), HostFn>,
    max_call_depth: usize,
    /// Name -> Value map reachable only through the host ABI and the
    /// `post`/`get` built-ins, never through ordinary identifier lookup.
    globals: HashMap<String, Value>,
    /// Mirrors `IonConf::trace_opcodes`; emits a trace event per step when
    /// set. Off by default since per-opcode tracing dominates runtime.
    trace_opcodes: bool,
}

impl Vm {
    pub fn new(bytecode: Vec<u8>) -> Result<Self, IonError> {
        let mut reader = Reader::new(&bytecode);
        reader.read_header()?;
        let mut cursor = reader.cursor();

        // The compiler always emits the root program's own `Reg N` preamble
        // as the very first instruction. Consume it here and reserve its
        // register region below the root frame's base, the same way
        // `call_script`/`call_script_function` reserve a callee's registers
        // before pushing its locals — there is no call site to do it for
        // the root frame, so `new` plays that role once, up front.
        let mut stack = Vec::new();
        let mut base = 0usize;
        let mut peek = Reader::new(&bytecode);
        peek.seek(cursor);
        if let Ok(Op::Reg(n)) = peek.read_op() {
            stack.resize(n as usize, Value::Nil);
            base = n as usize;
            cursor = peek.cursor();
        }

        Ok(Vm {
            bytes: bytecode,
            cursor,
            stack,
            operands: Vec::new(),
            frames: vec![ActivationRecord { return_cursor: 0, base, stack_size_at_call: 0 }],
            state: RunState::Running,
            host_functions: HashMap::new(),
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            globals: HashMap::new(),
            trace_opcodes: false,
        })
    }

    pub fn set_trace_opcodes(&mut self, enabled: bool) {
        self.trace_opcodes = enabled;
    }

    /// Host-side global write.
    pub fn post(&mut self, name: impl Into<String>, value: Value) {
        self.globals.insert(name.into(), value);
    }

    /// Host-side global read; errors if `name` was never
    /// `post`ed, unlike the in-script `get(name)` built-in which returns nil.
    pub fn get_global(&self, name: &str) -> Result<Value, IonError> {
        self.globals
            .get(name)
            .cloned()
            .ok_or_else(|| IonError::UndefinedGlobal(name.to_string()))
    }

    pub fn has_global(&self, name: &str) -> bool {
        self.globals.contains_key(name)
    }

    pub fn undefine(&mut self, name: &str) {
        self.globals.remove(name);
    }

    pub fn set_max_call_depth(&mut self, depth: usize) {
        self.max_call_depth = depth;
    }

    pub fn register_host_function(
        &mut self,
        group: u16,
        fid: u16,
        f: HostFn,
    ) {
        self.host_functions.insert((group, fid), f);
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn pause(&mut self) {
        if self.state == RunState::Running {
            debug!("vm paused at cursor {}", self.cursor);
            self.state = RunState::Paused;
        }
    }

    pub fn go_on(&mut self) {
        if self.state == RunState::Paused {
            debug!("vm resumed at cursor {}", self.cursor);
            self.state = RunState::Running;
        }
    }

    fn base(&self) -> usize {
        self.frames.last().unwrap().base
    }

    /// Locals (non-negative `loc`) and registers (negative `loc`) share one
    /// formula: `base + loc` under ordinary signed arithmetic. Registers
    /// therefore live in the reserved region just below `base`, which
    /// `call_script`/`call_script_function` allocate before pushing locals.
    fn slot(&self, loc: Loc) -> usize {
        (self.base() as i64 + loc as i64) as usize
    }

    fn ensure_slot(&mut self, index: usize) {
        if index >= self.stack.len() {
            self.stack.resize(index + 1, Value::Nil);
        }
    }

    fn read_loc(&self, loc: Loc) -> Value {
        let idx = self.slot(loc);
        self.stack.get(idx).cloned().unwrap_or(Value::Nil)
    }

    fn write_loc(&mut self, loc: Loc, value: Value) {
        let idx = self.slot(loc);
        self.ensure_slot(idx);
        self.stack[idx] = value;
    }

    /// Runs until `Finished`, `WaitingForReturn`, or `Paused`.
    /// A host callback that wants to re-enter the interpreter (for a script
    /// callback argument) calls `call_script_function` instead of driving
    /// this loop directly.
    pub fn run(&mut self, sink: &mut dyn std::io::Write) -> Result<(), IonError> {
        self.state = RunState::Running;
        while self.state == RunState::Running {
            self.step(sink)?;
        }
        Ok(())
    }

    fn fetch(&mut self) -> Result<Op, IonError> {
        let mut reader = Reader::new(&self.bytes);
        reader.seek(self.cursor);
        let op = reader.read_op()?;
        self.cursor = reader.cursor();
        Ok(op)
    }

    fn step(&mut self, sink: &mut dyn std::io::Write) -> Result<(), IonError> {
        if self.cursor >= self.bytes.len() {
            self.state = RunState::Finished;
            return Ok(());
        }
        let op = self.fetch()?;
        if self.trace_opcodes {
            trace!("{:?}", op);
        }
        match op {
            Op::Nop => {}
            Op::Reg(_) => {
                // A no-op at runtime: the compiler uses this opcode purely
                // to mark the size of a function's register file for
                // disassembly. The call site already reserved that many
                // slots below the frame base from `ScriptFunction::register_count`.
            }
            Op::Push => {
                self.operands.push(Value::Nil);
            }
            Op::PushVal(loc) => {
                self.operands.push(self.read_loc(loc));
            }
            Op::Pop => {
                let idx = self.stack.len().saturating_sub(1);
                self.stack.truncate(idx);
            }
            Op::PopN(n) => {
                let new_len = self.stack.len().saturating_sub(n as usize);
                self.stack.truncate(new_len);
            }
            Op::PopTo(loc) => {
                let v = self.operands.pop().unwrap_or(Value::Nil);
                self.write_loc(loc, v);
            }
            Op::StoreAtNil(loc) => self.write_loc(loc, Value::Nil),
            Op::StoreAtFunction { loc, entry, n_args, n_regs } => {
                self.write_loc(
                    loc,
                    Value::ScriptFunction(ScriptFunction {
                        entry_index: entry as usize,
                        arg_count: n_args,
                        register_count: n_regs,
                    }),
                );
            }
            Op::PushN(n) => self.operands.push(Value::Number(n)),
            Op::PushS(ref s) => self.operands.push(Value::string(s.clone())),
            Op::PushB(b) => self.operands.push(Value::Boolean(b)),
            Op::Move { dst, src } => {
                let v = self.read_loc(src);
                self.write_loc(dst, v);
            }
            Op::Add(dst, a, b) => self.binop(dst, a, b, |x, y| x.add(y))?,
            Op::Sub(dst, a, b) => self.binop(dst, a, b, |x, y| x.sub(y))?,
            Op::Mul(dst, a, b) => self.binop(dst, a, b, |x, y| x.mul(y))?,
            Op::Div(dst, a, b) => self.binop(dst, a, b, |x, y| x.div(y))?,
            Op::And(dst, a, b) => {
                let (x, y) = (self.read_loc(a), self.read_loc(b));
                self.write_loc(dst, Value::Boolean(x.is_truthy() && y.is_truthy()));
            }
            Op::Or(dst, a, b) => {
                let (x, y) = (self.read_loc(a), self.read_loc(b));
                self.write_loc(dst, Value::Boolean(x.is_truthy() || y.is_truthy()));
            }
            Op::Eq(dst, a, b) => {
                let (x, y) = (self.read_loc(a), self.read_loc(b));
                self.write_loc(dst, Value::Boolean(x.equals(&y)));
            }
            Op::Neq(dst, a, b) => {
                let (x, y) = (self.read_loc(a), self.read_loc(b));
                self.write_loc(dst, Value::Boolean(!x.equals(&y)));
            }
            Op::Gr(dst, a, b) => self.binop_bool(dst, a, b, |x, y| x.greater_than(y))?,
            Op::Gre(dst, a, b) => self.binop_bool(dst, a, b, |x, y| x.greater_equal(y))?,
            Op::Ls(dst, a, b) => self.binop_bool(dst, a, b, |x, y| x.less_than(y))?,
            Op::Lse(dst, a, b) => self.binop_bool(dst, a, b, |x, y| x.less_equal(y))?,
            Op::Not { dst, a } => {
                let v = self.read_loc(a);
                self.write_loc(dst, Value::Boolean(!v.is_truthy()));
            }
            Op::Jump(target) => self.cursor = target as usize,
            Op::JumpCond { loc, target } => {
                if !self.read_loc(loc).is_truthy() {
                    self.cursor = target as usize;
                }
            }
            Op::Return(loc) => {
                let v = self.read_loc(loc);
                self.do_return(v)?;
            }
            Op::ReturnNil => self.do_return(Value::Nil)?,
            Op::PrepareCallGlobal(_) | Op::PrepareCallLocal(_) => {
                // Register reservation is purely a compile-time bookkeeping
                // device (see DESIGN.md); nothing to do at runtime.
            }
            Op::CallScriptGlobal { loc, n_args } => self.call_script(loc, n_args)?,
            Op::CallScriptLocal { loc, n_args } => self.call_script(loc, n_args)?,
            Op::CallHost { group, fid, n_args } => {
                self.call_host(group, fid, n_args, sink)?;
            }
            Op::ListNew(loc) => self.write_loc(loc, Value::list(Vec::new())),
            Op::ListAdd { list, value } => {
                let v = self.read_loc(value);
                match self.read_loc(list) {
                    Value::List(l) => l.write().push(v),
                    other => {
                        return Err(IonError::runtime(format!(
                            "cannot append to a {}",
                            other.type_name()
                        )))
                    }
                }
            }
            Op::DictionaryNew(loc) => self.write_loc(loc, Value::dict_new()),
            Op::DictionaryAdd { dict, key, value } => {
                let (k, v) = (self.read_loc(key), self.read_loc(value));
                match self.read_loc(dict) {
                    Value::Dictionary(d) => {
                        d.write().insert(k.dictionary_key(), (k, v));
                    }
                    other => {
                        return Err(IonError::runtime(format!(
                            "cannot insert into a {}",
                            other.type_name()
                        )))
                    }
                }
            }
            Op::Get { dst, container, index } => {
                let value = self.index_get(&self.read_loc(container), &self.read_loc(index))?;
                self.write_loc(dst, value);
            }
            Op::Set { value, container, index } => {
                let (v, idx) = (self.read_loc(value), self.read_loc(index));
                self.index_set(&self.read_loc(container), &idx, v)?;
            }
        }
        if self.state == RunState::Running && self.cursor >= self.bytes.len() {
            self.state = RunState::Finished;
        }
        Ok(())
    }

    fn binop(
        &mut self,
        dst: Loc,
        a: Loc,
        b: Loc,
        f: impl Fn(&Value, &Value) -> Result<Value, IonError>,
    ) -> Result<(), IonError> {
        let (x, y) = (self.read_loc(a), self.read_loc(b));
        let v = f(&x, &y)?;
        self.write_loc(dst, v);
        Ok(())
    }

    fn binop_bool(
        &mut self,
        dst: Loc,
        a: Loc,
        b: Loc,
        f: impl Fn(&Value, &Value) -> Result<bool, IonError>,
    ) -> Result<(), IonError> {
        let (x, y) = (self.read_loc(a), self.read_loc(b));
        let v = f(&x, &y)?;
        self.write_loc(dst, Value::Boolean(v));
        Ok(())
    }

    fn index_get(&self, container: &Value, index: &Value) -> Result<Value, IonError> {
        match container {
            Value::List(l) => {
                let i = index.assert_is_positive_integer()? as usize;
                Ok(l.read().get(i).cloned().unwrap_or(Value::Nil))
            }
            Value::Dictionary(d) => {
                let key = index.dictionary_key();
                Ok(d.read().get(&key).map(|(_, v)| v.clone()).unwrap_or(Value::Nil))
            }
            Value::String(s) => {
                let i = index.assert_is_positive_integer()? as usize;
                Ok(s.chars().nth(i).map(|c| Value::string(c.to_string())).unwrap_or(Value::Nil))
            }
            other => Err(IonError::runtime(format!("cannot index a {}", other.type_name()))),
        }
    }

    fn index_set(&self, container: &Value, index: &Value, value: Value) -> Result<(), IonError> {
        match container {
            Value::List(l) => {
                let i = index.assert_is_positive_integer()? as usize;
                let mut items = l.write();
                if i >= items.len() {
                    items.resize(i + 1, Value::Nil);
                }
                items[i] = value;
                Ok(())
            }
            Value::Dictionary(d) => {
                let key = index.dictionary_key();
                d.write().insert(key, (index.clone(), value));
                Ok(())
            }
            other => Err(IonError::runtime(format!("cannot index-assign a {}", other.type_name()))),
        }
    }

    // ------------------------------------------------------------------
    // call protocol
    // ------------------------------------------------------------------

    fn call_script(&mut self, loc: Loc, n_args: u8) -> Result<(), IonError> {
        let callee = self.read_loc(loc);
        let Value::ScriptFunction(f) = callee else {
            return Err(IonError::runtime(format!(
                "cannot call a {}",
                callee.type_name()
            )));
        };
        if f.arg_count != n_args {
            return Err(IonError::runtime(format!(
                "wrong number of arguments: expected {}, got {n_args}",
                f.arg_count
            )));
        }
        if self.frames.len() >= self.max_call_depth {
            return Err(IonError::runtime("call stack exceeded maximum depth"));
        }
        debug!("calling script function at entry {} with {} args, depth now {}", f.entry_index, n_args, self.frames.len() + 1);
        let mut args = Vec::with_capacity(n_args as usize);
        for _ in 0..n_args {
            args.push(self.operands.pop().unwrap_or(Value::Nil));
        }
        args.reverse();

        let stack_size_at_call = self.stack.len();
        self.stack.resize(stack_size_at_call + f.register_count as usize, Value::Nil);
        let new_base = self.stack.len();
        self.stack.extend(args);

        self.frames.push(ActivationRecord {
            return_cursor: self.cursor,
            base: new_base,
            stack_size_at_call,
        });
        self.cursor = f.entry_index;
        Ok(())
    }

    fn do_return(&mut self, value: Value) -> Result<(), IonError> {
        let frame = self
            .frames
            .pop()
            .ok_or_else(|| IonError::runtime("return with no active call frame"))?;
        debug!("returning to cursor {}, depth now {}", frame.return_cursor, self.frames.len());
        self.stack.truncate(frame.stack_size_at_call);
        self.operands.push(value);
        if self.frames.is_empty() {
            // The root program's own closing `ReturnNil` popped its last
            // frame: there is no caller to resume, the program is done.
            self.state = RunState::Finished;
        } else {
            self.cursor = frame.return_cursor;
        }
        Ok(())
    }

    fn call_host(
        &mut self,
        group: u16,
        fid: u16,
        n_args: u8,
        sink: &mut dyn std::io::Write,
    ) -> Result<(), IonError> {
        let mut args = Vec::with_capacity(n_args as usize);
        for _ in 0..n_args {
            args.push(self.operands.pop().unwrap_or(Value::Nil));
        }
        args.reverse();

        debug!("dispatching host function ({}, {}) with {} args", group, fid, n_args);
        self.state = RunState::WaitingForReturn;
        let result = {
            let Vm { host_functions, globals, .. } = self;
            let f = host_functions.get(&(group, fid)).ok_or_else(|| {
                IonError::runtime(format!("no host function registered for ({group}, {fid})"))
            })?;
            let mut manager = CallManager { args: &args, result: None, sink, globals };
            f(&mut manager)?;
            manager.result.unwrap_or(Value::Nil)
        };
        self.state = RunState::Running;
        self.operands.push(result);
        Ok(())
    }

    /// Re-enters the interpreter to invoke a script function from a host
    /// callback, running to completion of that one call and returning its
    /// result.
    pub fn call_script_function(
        &mut self,
        function: ScriptFunction,
        args: Vec<Value>,
        sink: &mut dyn std::io::Write,
    ) -> Result<Value, IonError> {
        if function.arg_count as usize != args.len() {
            return Err(IonError::runtime(format!(
                "wrong number of arguments: expected {}, got {}",
                function.arg_count,
                args.len()
            )));
        }
        let saved_cursor = self.cursor;
        let depth_before = self.frames.len();

        let stack_size_at_call = self.stack.len();
        self.stack.resize(stack_size_at_call + function.register_count as usize, Value::Nil);
        let new_base = self.stack.len();
        self.stack.extend(args);
        self.frames.push(ActivationRecord {
            return_cursor: self.bytes.len(),
            base: new_base,
            stack_size_at_call,
        });
        self.cursor = function.entry_index;

        let saved_state = self.state;
        self.state = RunState::Running;
        while self.frames.len() > depth_before {
            self.step(sink)?;
            if self.state == RunState::Finished {
                break;
            }
        }
        self.state = saved_state;
        self.cursor = saved_cursor;
        self.operands.pop().map(Ok).unwrap_or(Ok(Value::Nil))
    }
}

/// Absolute bytecode offset of the first instruction after the header,
/// exposed for callers that need to seed a fresh `Vm`'s cursor manually
/// (tests, disassembly tools).
pub fn entry_cursor() -> usize {
    HEADER_LEN
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Compiler;
    use crate::parser::Parser;
    use std::collections::HashMap as Map;

    fn run(src: &str) -> String {
        let tree = Parser::new(src).unwrap().parse_program().unwrap();
        let bytes = Compiler::new(Map::new()).compile_program(&tree).unwrap();
        let mut vm = Vm::new(bytes).unwrap();
        let mut out = Vec::new();
        vm.run(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn arithmetic_runs_to_completion() {
        run("x = 1 + 2 + 3");
    }

    #[test]
    fn while_loop_terminates() {
        run("i = 0 while i < 5 i = i + 1 end");
    }

    #[test]
    fn list_index_assignment() {
        run("a = [1, 2, 3] a[0] = 9");
    }
}
