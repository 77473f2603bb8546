//! The tagged dynamic value type.

use crate::errors::IonError;
use parking_lot::RwLock;
use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

/// How the engine relates to a [`HostObject`]'s payload lifetime.
#[derive(Clone)]
pub enum Ownership {
    /// The engine never frees this payload; the host owns it.
    Borrowed,
    /// The engine reference-counts the payload and frees it via `deleter`
    /// when the last `Value` holding it is dropped.
    OwnedShared { deleter: Arc<dyn Fn() + Send + Sync> },
}

/// A host value wrapped for passage through the script value system.
///
/// Identity for equality purposes is the payload pointer, not the `type_tag`
/// (two HostObjects are equal iff they share the same payload identity).
#[derive(Clone)]
pub struct HostObject {
    pub type_tag: Rc<str>,
    payload: Rc<Cell<*const ()>>,
    pub ownership: Ownership,
}

impl HostObject {
    pub fn borrowed(type_tag: impl Into<Rc<str>>, payload: *const ()) -> Self {
        HostObject {
            type_tag: type_tag.into(),
            payload: Rc::new(Cell::new(payload)),
            ownership: Ownership::Borrowed,
        }
    }

    pub fn owned_shared(
        type_tag: impl Into<Rc<str>>,
        payload: *const (),
        deleter: Arc<dyn Fn() + Send + Sync>,
    ) -> Self {
        HostObject {
            type_tag: type_tag.into(),
            payload: Rc::new(Cell::new(payload)),
            ownership: Ownership::OwnedShared { deleter },
        }
    }

    pub fn payload_identity(&self) -> *const () {
        self.payload.get()
    }

    pub fn is_null(&self) -> bool {
        self.payload.get().is_null()
    }
}

impl fmt::Debug for HostObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostObject({})", self.type_tag)
    }
}

impl Drop for HostObject {
    fn drop(&mut self) {
        if Rc::strong_count(&self.payload) == 1 {
            if let Ownership::OwnedShared { deleter } = &self.ownership {
                deleter();
            }
        }
    }
}

/// A compiled script function: where it starts, how many arguments it
/// takes, and how many registers its frame preamble must reserve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptFunction {
    pub entry_index: usize,
    pub arg_count: u8,
    pub register_count: u8,
}

/// A shared, ordered list of values. `Rc<RwLock<..>>` gives the
/// shared-ownership, single-threaded-mutation semantics lists and
/// dictionaries need (copying a `Value::List` bumps the `Rc` count, not a
/// deep copy).
pub type SharedList = Rc<RwLock<Vec<Value>>>;

/// A shared dictionary. Ordering is not the insertion order of a hash map:
/// enumeration order is defined by lexicographic comparison of each key's
/// own `to_string` rendering, so the backing store is a `BTreeMap` keyed on
/// that rendering rather than a `HashMap`.
pub type SharedDict = Rc<RwLock<BTreeMap<String, (Value, Value)>>>;

#[derive(Clone)]
pub enum Value {
    Nil,
    Boolean(bool),
    Number(f64),
    String(Rc<str>),
    List(SharedList),
    Dictionary(SharedDict),
    ScriptFunction(ScriptFunction),
    HostObject(HostObject),
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "Nil"),
            Value::Boolean(b) => write!(f, "Boolean({b})"),
            Value::Number(n) => write!(f, "Number({n})"),
            Value::String(s) => write!(f, "String({s:?})"),
            Value::List(_) => write!(f, "List([..])"),
            Value::Dictionary(_) => write!(f, "Dictionary({{..}})"),
            Value::ScriptFunction(sf) => write!(f, "ScriptFunction({sf:?})"),
            Value::HostObject(h) => write!(f, "{h:?}"),
        }
    }
}

impl Value {
    pub fn string(s: impl Into<Rc<str>>) -> Self {
        Value::String(s.into())
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Rc::new(RwLock::new(items)))
    }

    pub fn dict_new() -> Self {
        Value::Dictionary(Rc::new(RwLock::new(BTreeMap::new())))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Boolean(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Dictionary(_) => "dictionary",
            Value::ScriptFunction(_) => "function",
            Value::HostObject(_) => "object",
        }
    }

    /// Truthiness rule: `Nil`→false; `Boolean`→its value;
    /// `Number`→`!=0`; `String`/`List`/`Dictionary`→non-empty;
    /// `ScriptFunction`→true; `HostObject`→non-null.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Nil => false,
            Value::Boolean(b) => *b,
            Value::Number(n) => *n != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::List(l) => !l.read().is_empty(),
            Value::Dictionary(d) => !d.read().is_empty(),
            Value::ScriptFunction(_) => true,
            Value::HostObject(h) => !h.is_null(),
        }
    }

    /// A `Number` is an integer iff truncating to `i32` round-trips exactly.
    pub fn is_integer(n: f64) -> bool {
        n.is_finite() && (n as i32) as f64 == n
    }

    pub fn is_positive_integer(n: f64) -> bool {
        Value::is_integer(n) && n >= 0.0
    }

    pub fn assert_type_mask(&self, allowed: &[&str]) -> Result<(), IonError> {
        if allowed.contains(&self.type_name()) {
            Ok(())
        } else {
            Err(IonError::runtime(format!(
                "expected one of {:?}, got {}",
                allowed,
                self.type_name()
            )))
        }
    }

    pub fn assert_is_integer(&self) -> Result<f64, IonError> {
        match self {
            Value::Number(n) if Value::is_integer(*n) => Ok(*n),
            Value::Number(n) => Err(IonError::runtime(format!("{n} is not an integer"))),
            other => Err(IonError::runtime(format!(
                "expected a number, got {}",
                other.type_name()
            ))),
        }
    }

    pub fn assert_is_positive_integer(&self) -> Result<f64, IonError> {
        let n = self.assert_is_integer()?;
        if n >= 0.0 {
            Ok(n)
        } else {
            Err(IonError::runtime(format!("{n} is not a positive integer")))
        }
    }

    /// Canonical rendering, used by `print`/`str`/dictionary key ordering.
    /// NOT quoted for strings; see `to_display_quoted` for the quoted form
    /// nested containers use for their string elements.
    pub fn to_display(&self) -> String {
        match self {
            Value::Nil => "nil".to_string(),
            Value::Boolean(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::String(s) => s.to_string(),
            Value::List(l) => {
                let items = l.read();
                let parts: Vec<String> = items.iter().map(Value::to_display_quoted).collect();
                format!("[{}]", parts.join(", "))
            }
            Value::Dictionary(d) => {
                let entries = d.read();
                let parts: Vec<String> = entries
                    .values()
                    .map(|(k, v)| format!("{}: {}", k.to_display_quoted(), v.to_display_quoted()))
                    .collect();
                format!("{{{}}}", parts.join(", "))
            }
            Value::ScriptFunction(sf) => format!("<function at {}>", sf.entry_index),
            Value::HostObject(h) => {
                let managed = matches!(h.ownership, Ownership::OwnedShared { .. });
                format!(
                    "<{}object {} at {:p}>",
                    if managed { "managed " } else { "" },
                    h.type_tag,
                    h.payload_identity()
                )
            }
        }
    }

    /// Like `to_display` but strings render quoted; used for list/dict
    /// element rendering.
    fn to_display_quoted(&self) -> String {
        match self {
            Value::String(s) => format!("{s:?}"),
            other => other.to_display(),
        }
    }

    /// The key a value would occupy in a `Dictionary`: its own `to_display`
    /// rendering. This deliberately conflates `"1"` and `1`.
    pub fn dictionary_key(&self) -> String {
        self.to_display()
    }
}

/// Exposes the canonical number rendering for the compiler's literal-interning
/// table, so `1` and `1.0` intern to the same slot.
pub fn format_number_for_interning(n: f64) -> String {
    format_number(n)
}

fn format_number(n: f64) -> String {
    if n == n.trunc() && n.is_finite() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

fn kind_mismatch(op: &str, a: &Value, b: &Value) -> IonError {
    IonError::runtime(format!(
        "cannot {op} a {} with a {}",
        a.type_name(),
        b.type_name()
    ))
}

impl Value {
    pub fn add(&self, other: &Value) -> Result<Value, IonError> {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a + b)),
            (Value::String(a), Value::String(b)) => {
                Ok(Value::string(format!("{a}{b}")))
            }
            (Value::List(a), Value::List(b)) => {
                let mut items = a.read().clone();
                items.extend(b.read().iter().cloned());
                Ok(Value::list(items))
            }
            _ => Err(kind_mismatch("add", self, other)),
        }
    }

    pub fn sub(&self, other: &Value) -> Result<Value, IonError> {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a - b)),
            _ => Err(kind_mismatch("subtract", self, other)),
        }
    }

    pub fn mul(&self, other: &Value) -> Result<Value, IonError> {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a * b)),
            (Value::String(s), Value::Number(n)) | (Value::Number(n), Value::String(s))
                if Value::is_positive_integer(*n) =>
            {
                Ok(Value::string(s.repeat(*n as usize)))
            }
            (Value::List(l), Value::Number(n)) | (Value::Number(n), Value::List(l))
                if Value::is_positive_integer(*n) =>
            {
                let base = l.read();
                let mut out = Vec::with_capacity(base.len() * (*n as usize));
                for _ in 0..(*n as usize) {
                    out.extend(base.iter().cloned());
                }
                Ok(Value::list(out))
            }
            _ => Err(kind_mismatch("multiply", self, other)),
        }
    }

    pub fn div(&self, other: &Value) -> Result<Value, IonError> {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => {
                if *b == 0.0 {
                    Err(IonError::runtime("division by zero"))
                } else {
                    Ok(Value::Number(a / b))
                }
            }
            _ => Err(kind_mismatch("divide", self, other)),
        }
    }

    pub fn equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Nil, _) | (_, Value::Nil) => false,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                let (a, b) = (a.read(), b.read());
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.equals(y))
            }
            (Value::Dictionary(a), Value::Dictionary(b)) => {
                let (a, b) = (a.read(), b.read());
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, (_, v))| b.get(k).is_some_and(|(_, v2)| v.equals(v2)))
            }
            (Value::HostObject(a), Value::HostObject(b)) => {
                a.payload_identity() == b.payload_identity()
            }
            _ => false,
        }
    }

    pub fn less_than(&self, other: &Value) -> Result<bool, IonError> {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => Ok(a < b),
            (Value::String(a), Value::String(b)) => Ok(a < b),
            _ => Err(kind_mismatch("compare", self, other)),
        }
    }

    pub fn less_equal(&self, other: &Value) -> Result<bool, IonError> {
        Ok(self.less_than(other)? || self.equals(other))
    }

    pub fn greater_than(&self, other: &Value) -> Result<bool, IonError> {
        other.less_than(self)
    }

    pub fn greater_equal(&self, other: &Value) -> Result<bool, IonError> {
        other.less_equal(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness() {
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::Number(0.0).is_truthy());
        assert!(!Value::string("").is_truthy());
        assert!(!Value::list(vec![]).is_truthy());
        assert!(!Value::dict_new().is_truthy());
        assert!(Value::Number(1.0).is_truthy());
        assert!(Value::Boolean(true).is_truthy());
    }

    #[test]
    fn add_concatenates_strings_and_lists() {
        let a = Value::string("foo");
        let b = Value::string("bar");
        assert_eq!(a.add(&b).unwrap().to_display(), "foobar");

        let l1 = Value::list(vec![Value::Number(1.0)]);
        let l2 = Value::list(vec![Value::Number(2.0)]);
        assert_eq!(l1.add(&l2).unwrap().to_display(), "[1, 2]");
    }

    #[test]
    fn mul_repeats_string_and_list_by_nonnegative_integer() {
        let s = Value::string("ab");
        assert_eq!(s.mul(&Value::Number(3.0)).unwrap().to_display(), "ababab");
    }

    #[test]
    fn division_by_zero_is_runtime_error() {
        assert!(Value::Number(1.0).div(&Value::Number(0.0)).is_err());
    }

    #[test]
    fn equality_across_kinds_is_false() {
        assert!(!Value::Number(1.0).equals(&Value::string("1")));
        assert!(Value::Nil.equals(&Value::Nil));
    }

    #[test]
    fn list_display_quotes_string_elements() {
        let l = Value::list(vec![Value::string("a"), Value::Number(1.0)]);
        assert_eq!(l.to_display(), "[\"a\", 1]");
    }
}
