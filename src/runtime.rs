//! Host-facing embedding surface.
//!
//! Grounded on `axiom/src/runtime.rs`'s driver (compile, load, run, expose
//! globals), generalized to this engine's compiler/VM split and its
//! `post`/`get` global-variable model instead of direct global-table
//! mutation.

use crate::compiler::{Compiler, HostSignature};
use crate::conf::IonConf;
use crate::errors::IonError;
use crate::parser::Parser;
use crate::value::Value;
use crate::vm::{CallManager, HostFn, Vm};
use std::collections::HashMap;
use std::io::Write;
use std::rc::Rc;

const BUILTIN_GROUP: u16 = 0;

/// One entry in a host function group: its script-visible name, compile-time
/// checked arity, and implementation.
pub struct HostEntry {
    pub name: &'static str,
    pub min_args: i32,
    pub max_args: i32,
    pub f: HostFn,
}

pub fn host_entry(
    name: &'static str,
    min_args: i32,
    max_args: i32,
    f: impl Fn(&mut CallManager) -> Result<(), IonError> + 'static,
) -> HostEntry {
    HostEntry { name, min_args, max_args, f: Rc::new(f) }
}

/// Owns the compile-time host-function signature table and the matching
/// runtime implementations, and drives one script program end to end:
/// function registration, global variable read/write, compilation.
pub struct Runtime {
    signatures: HashMap<String, HostSignature>,
    impls: HashMap<(u16, u16), HostFn>,
    next_group: u16,
    vm: Option<Vm>,
    max_call_depth: usize,
    trace_opcodes: bool,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    /// Builds a `Runtime` with `IonConf::load()` defaults:
    /// `~/.config/ionscript/conf.toml` if present, else built-in defaults.
    pub fn new() -> Self {
        Self::with_conf(IonConf::load())
    }

    pub fn with_conf(conf: IonConf) -> Self {
        let mut runtime = Runtime {
            signatures: HashMap::new(),
            impls: HashMap::new(),
            next_group: BUILTIN_GROUP + 1,
            vm: None,
            max_call_depth: conf.max_call_depth(),
            trace_opcodes: conf.trace_opcodes(),
        };
        runtime.register_host_function_group(builtins());
        runtime
    }

    pub fn set_max_call_depth(&mut self, depth: usize) {
        self.max_call_depth = depth;
    }

    pub fn set_trace_opcodes(&mut self, enabled: bool) {
        self.trace_opcodes = enabled;
    }

    /// Registers a batch of host functions under a fresh group id, returning
    /// that id.
    pub fn register_host_function_group(&mut self, entries: Vec<HostEntry>) -> u16 {
        let group = self.next_group;
        self.next_group += 1;
        for (fid, entry) in entries.into_iter().enumerate() {
            let fid = fid as u16;
            self.signatures.insert(
                entry.name.to_string(),
                HostSignature { group, fid, min_args: entry.min_args, max_args: entry.max_args },
            );
            self.impls.insert((group, fid), entry.f);
        }
        group
    }

    /// Registers, or overrides, a single host function at an explicit
    /// `group_id`/`function_id` pair instead of the sequential ids
    /// `register_host_function_group` assigns a whole batch. Lets a host
    /// add a function to a group it already registered, or replace one
    /// function's implementation without touching the rest of the group.
    ///
    /// `max_args` of `-2` means "same as `min_args`" (fixed arity); `-1`
    /// means unbounded.
    pub fn set_function(
        &mut self,
        name: impl Into<String>,
        group_id: u16,
        function_id: u16,
        min_args: i32,
        max_args: i32,
        f: impl Fn(&mut CallManager) -> Result<(), IonError> + 'static,
    ) {
        let max_args = if max_args == -2 { min_args } else { max_args };
        self.signatures.insert(
            name.into(),
            HostSignature { group: group_id, fid: function_id, min_args, max_args },
        );
        self.impls.insert((group_id, function_id), Rc::new(f));
        if group_id >= self.next_group {
            self.next_group = group_id + 1;
        }
    }

    /// Compiles `source` to bytecode without loading it into a VM.
    pub fn compile(&self, source: &str) -> Result<Vec<u8>, IonError> {
        let tree = Parser::new(source)?.parse_program()?;
        Compiler::new(self.signatures.clone()).compile_program(&tree)
    }

    /// Compiles `source` and loads the result as the active program. Host
    /// function implementations are shared (`Rc`-cloned) into the fresh VM,
    /// so a `Runtime` can `compile_into` more than once without losing them;
    /// globals are NOT carried over, since a freshly compiled program gets a
    /// fresh VM with its own global-variable map.
    pub fn compile_into(&mut self, source: &str) -> Result<(), IonError> {
        let bytecode = self.compile(source)?;
        let mut vm = Vm::new(bytecode)?;
        vm.set_max_call_depth(self.max_call_depth);
        vm.set_trace_opcodes(self.trace_opcodes);
        for (&(group, fid), f) in &self.impls {
            vm.register_host_function(group, fid, Rc::clone(f));
        }
        self.vm = Some(vm);
        Ok(())
    }

    /// Runs the currently loaded program to completion.
    pub fn run(&mut self, sink: &mut dyn Write) -> Result<(), IonError> {
        self.active_vm_mut()?.run(sink)
    }

    /// Convenience: compile then run in one call.
    pub fn compile_and_run(&mut self, source: &str, sink: &mut dyn Write) -> Result<(), IonError> {
        self.compile_into(source)?;
        self.run(sink)
    }

    pub fn post(&mut self, name: impl Into<String>, value: Value) -> Result<(), IonError> {
        self.active_vm_mut()?.post(name, value);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Value, IonError> {
        self.active_vm()?.get_global(name)
    }

    pub fn has_global(&self, name: &str) -> Result<bool, IonError> {
        Ok(self.active_vm()?.has_global(name))
    }

    pub fn undefine(&mut self, name: &str) -> Result<(), IonError> {
        self.active_vm_mut()?.undefine(name);
        Ok(())
    }

    /// Re-enters the interpreter to invoke a `Value::ScriptFunction` obtained
    /// from script via `post`.
    pub fn call_script_function(
        &mut self,
        function: &Value,
        args: Vec<Value>,
        sink: &mut dyn Write,
    ) -> Result<Value, IonError> {
        let Value::ScriptFunction(f) = function else {
            return Err(IonError::runtime(format!(
                "cannot call a {} as a script function",
                function.type_name()
            )));
        };
        self.active_vm_mut()?.call_script_function(*f, args, sink)
    }

    fn active_vm(&self) -> Result<&Vm, IonError> {
        self.vm.as_ref().ok_or_else(|| IonError::runtime("no program compiled into this runtime"))
    }

    fn active_vm_mut(&mut self) -> Result<&mut Vm, IonError> {
        self.vm.as_mut().ok_or_else(|| IonError::runtime("no program compiled into this runtime"))
    }
}

fn arg_display(v: &Value) -> String {
    v.to_display()
}

fn builtins() -> Vec<HostEntry> {
    vec![
        host_entry("print", 0, -1, |m| {
            let rendered: Vec<String> = m.args().iter().map(arg_display).collect();
            let _ = writeln!(m.sink, "{}", rendered.join(" "));
            m.return_value(Value::Nil);
            Ok(())
        }),
        host_entry("post", 2, 2, |m| {
            let name = m.arg(0)?.to_display();
            let value = m.arg(1)?.clone();
            m.globals.insert(name, value);
            m.return_value(Value::Nil);
            Ok(())
        }),
        host_entry("get", 1, 1, |m| {
            let name = m.arg(0)?.to_display();
            let value = m.globals.get(&name).cloned().unwrap_or(Value::Nil);
            m.return_value(value);
            Ok(())
        }),
        host_entry("len", 1, 1, |m| {
            let n = match m.arg(0)? {
                Value::String(s) => s.chars().count(),
                Value::List(l) => l.read().len(),
                Value::Dictionary(d) => d.read().len(),
                other => {
                    return Err(IonError::runtime(format!(
                        "len() expects a string, list, or dictionary, got {}",
                        other.type_name()
                    )))
                }
            };
            m.return_value(Value::Number(n as f64));
            Ok(())
        }),
        host_entry("append", 2, 2, |m| {
            match m.arg(0)? {
                Value::List(l) => l.write().push(m.arg(1)?.clone()),
                other => {
                    return Err(IonError::runtime(format!(
                        "append() expects a list, got {}",
                        other.type_name()
                    )))
                }
            }
            m.return_value(Value::Nil);
            Ok(())
        }),
        host_entry("remove", 2, 2, |m| {
            let index = m.arg(1)?.assert_is_positive_integer()? as usize;
            match m.arg(0)? {
                Value::List(l) => {
                    let mut items = l.write();
                    if index < items.len() {
                        items.remove(index);
                    }
                }
                other => {
                    return Err(IonError::runtime(format!(
                        "remove() expects a list, got {}",
                        other.type_name()
                    )))
                }
            }
            m.return_value(Value::Nil);
            Ok(())
        }),
        host_entry("assert", 1, 2, |m| {
            if !m.arg(0)?.is_truthy() {
                let message = m
                    .args()
                    .get(1)
                    .map(arg_display)
                    .unwrap_or_else(|| "assertion failed".to_string());
                return Err(IonError::runtime(message));
            }
            m.return_value(Value::Nil);
            Ok(())
        }),
        host_entry("dump", 0, 0, |m| {
            let _ = writeln!(m.sink, "<vm state: {} globals>", m.globals.len());
            m.return_value(Value::Nil);
            Ok(())
        }),
        host_entry("str", 1, 1, |m| {
            m.return_value(Value::string(arg_display(m.arg(0)?)));
            Ok(())
        }),
        host_entry("join", 1, -1, |m| {
            let sep = arg_display(m.arg(0)?);
            let parts: Vec<String> = match m.args().get(1) {
                Some(Value::List(l)) if m.args().len() == 2 => {
                    l.read().iter().map(arg_display).collect()
                }
                _ => m.args()[1..].iter().map(arg_display).collect(),
            };
            m.return_value(Value::string(parts.join(&sep)));
            Ok(())
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn print_writes_space_joined_newline_terminated_line() {
        let mut rt = Runtime::new();
        let mut out = Vec::new();
        rt.compile_and_run("print(1 + 2)", &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "3\n");
    }

    #[test]
    fn post_and_get_round_trip_a_global() {
        let mut rt = Runtime::new();
        let mut out = Vec::new();
        rt.compile_and_run("nil", &mut out).unwrap();
        rt.post("seen", Value::Number(7.0)).unwrap();
        assert_eq!(rt.get("seen").unwrap().to_display(), "7");
    }

    #[test]
    fn get_of_unset_global_is_undefined_global_error() {
        let mut rt = Runtime::new();
        let mut out = Vec::new();
        rt.compile_and_run("nil", &mut out).unwrap();
        assert!(matches!(rt.get("missing"), Err(IonError::UndefinedGlobal(_))));
    }

    #[test]
    fn list_append_and_len_builtins() {
        let mut rt = Runtime::new();
        let mut out = Vec::new();
        rt.compile_and_run(
            "a = [] a.append(1) a.append(2) print(len(a))",
            &mut out,
        )
        .unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "2\n");
    }
}
