//! Runtime values.
//!
//! Containers share through `Rc`: assigning a list binds the same list,
//! exactly like the scripting language expects. Values are single-threaded
//! by construction; one session runs on one thread.

use std::cell::RefCell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use indexmap::{IndexMap, IndexSet};
use malthusia_codegen::{CodeUnit, Constant};

use crate::cost::CostShape;
use crate::error::{ExcKind, Exception, RaiseError, VmResult};
use crate::format::repr;
use crate::methods::MethodDef;
use crate::vm::Vm;

/// A module's (or the capability set's) name bindings.
pub type Namespace = Rc<RefCell<IndexMap<String, Value>>>;

/// Host implementation of a callable.
pub type NativeFn = Rc<dyn Fn(&mut Vm, Vec<Value>) -> VmResult<Value>>;

#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    List(Rc<RefCell<Vec<Value>>>),
    Tuple(Rc<Vec<Value>>),
    Dict(Rc<RefCell<IndexMap<Key, Value>>>),
    Set(Rc<RefCell<IndexSet<Key>>>),
    Range(RangeValue),
    Slice(Rc<SliceValue>),
    Iter(Rc<RefCell<IterState>>),
    Function(Rc<Function>),
    Builtin(Rc<Builtin>),
    /// A built-in method bound to its receiver (`xs.append` without a call).
    Method(Rc<BoundMethod>),
    /// A built-in method expecting its receiver as the first argument.
    UnboundMethod(&'static MethodDef),
    /// A callable reached through redirected method lookup; ignores the
    /// receiver slot it is called with.
    Detached(Rc<Value>),
    Module(Rc<Module>),
    Type(TypeKind),
    ExcType(ExcKind),
    Exception(Rc<Exception>),
    Code(Rc<CodeUnit>),
    /// Placeholder `LOAD_METHOD` pushes when the callable needs no receiver.
    Null,
}

impl Value {
    pub fn str(s: &str) -> Self {
        Value::Str(Rc::from(s))
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn tuple(items: Vec<Value>) -> Self {
        Value::Tuple(Rc::new(items))
    }

    pub fn dict(entries: IndexMap<Key, Value>) -> Self {
        Value::Dict(Rc::new(RefCell::new(entries)))
    }

    pub fn set(items: IndexSet<Key>) -> Self {
        Value::Set(Rc::new(RefCell::new(items)))
    }

    pub fn iter(state: IterState) -> Self {
        Value::Iter(Rc::new(RefCell::new(state)))
    }

    pub fn from_constant(constant: &Constant) -> Self {
        match constant {
            Constant::None => Value::None,
            Constant::Bool(b) => Value::Bool(*b),
            Constant::Int(i) => Value::Int(*i),
            Constant::Float(f) => Value::Float(*f),
            Constant::Str(s) => Value::str(s),
            Constant::Tuple(items) => Value::tuple(items.iter().map(Value::from_constant).collect()),
            Constant::Code(unit) => Value::Code(Rc::clone(unit)),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::Set(_) => "set",
            Value::Range(_) => "range",
            Value::Slice(_) => "slice",
            Value::Iter(_) => "iterator",
            Value::Function(_) => "function",
            Value::Builtin(_) | Value::Method(_) | Value::Detached(_) => {
                "builtin_function_or_method"
            }
            Value::UnboundMethod(_) => "method_descriptor",
            Value::Module(_) => "module",
            Value::Type(_) | Value::ExcType(_) => "type",
            Value::Exception(e) => e.kind.name(),
            Value::Code(_) => "code",
            Value::Null => "NULL",
        }
    }

    /// The value `type(x)` returns.
    pub fn type_of(&self) -> Value {
        let kind = match self {
            Value::None => TypeKind::NoneType,
            Value::Bool(_) => TypeKind::Bool,
            Value::Int(_) => TypeKind::Int,
            Value::Float(_) => TypeKind::Float,
            Value::Str(_) => TypeKind::Str,
            Value::List(_) => TypeKind::List,
            Value::Tuple(_) => TypeKind::Tuple,
            Value::Dict(_) => TypeKind::Dict,
            Value::Set(_) => TypeKind::Set,
            Value::Range(_) => TypeKind::Range,
            Value::Exception(e) => return Value::ExcType(e.kind),
            Value::Type(_) | Value::ExcType(_) => TypeKind::Type,
            Value::Function(_) => TypeKind::Function,
            Value::Module(_) => TypeKind::Module,
            _ => TypeKind::Builtin,
        };
        Value::Type(kind)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Bool(b) => Some(*b as i64 as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_callable(&self) -> bool {
        matches!(
            self,
            Value::Function(_)
                | Value::Builtin(_)
                | Value::Method(_)
                | Value::UnboundMethod(_)
                | Value::Detached(_)
                | Value::Type(_)
                | Value::ExcType(_)
        )
    }

    /// Identity, as `is` sees it.
    pub fn is(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => Rc::ptr_eq(a, b) || a == b,
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
            (Value::Tuple(a), Value::Tuple(b)) => Rc::ptr_eq(a, b),
            (Value::Dict(a), Value::Dict(b)) => Rc::ptr_eq(a, b),
            (Value::Set(a), Value::Set(b)) => Rc::ptr_eq(a, b),
            (Value::Range(a), Value::Range(b)) => a == b,
            (Value::Iter(a), Value::Iter(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => Rc::ptr_eq(a, b),
            (Value::Method(a), Value::Method(b)) => Rc::ptr_eq(a, b),
            (Value::UnboundMethod(a), Value::UnboundMethod(b)) => std::ptr::eq(*a, *b),
            (Value::Module(a), Value::Module(b)) => Rc::ptr_eq(a, b),
            (Value::Type(a), Value::Type(b)) => a == b,
            (Value::ExcType(a), Value::ExcType(b)) => a == b,
            (Value::Exception(a), Value::Exception(b)) => Rc::ptr_eq(a, b),
            (Value::Code(a), Value::Code(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&repr(self))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::str(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(Rc::from(s))
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Types
// ══════════════════════════════════════════════════════════════════════════════

/// Built-in classes reachable as values (`int`, `list`, `type(x)`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKind {
    NoneType,
    Bool,
    Int,
    Float,
    Str,
    List,
    Tuple,
    Dict,
    Set,
    Range,
    Function,
    Builtin,
    Module,
    Type,
}

impl TypeKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::NoneType => "NoneType",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::Str => "str",
            Self::List => "list",
            Self::Tuple => "tuple",
            Self::Dict => "dict",
            Self::Set => "set",
            Self::Range => "range",
            Self::Function => "function",
            Self::Builtin => "builtin_function_or_method",
            Self::Module => "module",
            Self::Type => "type",
        }
    }

    /// `isinstance(value, self)`.
    pub fn contains(self, value: &Value) -> bool {
        match (self, value) {
            (Self::Int, Value::Bool(_)) => true,
            _ => match value.type_of() {
                Value::Type(kind) => kind == self,
                _ => false,
            },
        }
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Callables
// ══════════════════════════════════════════════════════════════════════════════

/// A user-defined function: a code unit closed over its module's globals.
pub struct Function {
    pub code: Rc<CodeUnit>,
    pub globals: Namespace,
    /// Module the function was defined in.
    pub module: Rc<str>,
    /// Defaults for the trailing parameters.
    pub defaults: Vec<Value>,
}

/// Who provided a host callable; decides metering and argument checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinKind {
    /// A primitive from the safe set, cost-wrapped by the cost model.
    Primitive,
    /// Provided by the game; never metered, arguments validated.
    Game,
    /// Called by injected instrumentation; never metered.
    Artifact,
}

pub struct Builtin {
    pub name: String,
    pub kind: BuiltinKind,
    pub cost: Option<CostShape>,
    pub func: NativeFn,
}

impl Builtin {
    pub fn primitive(
        name: &str,
        cost: Option<CostShape>,
        func: impl Fn(&mut Vm, Vec<Value>) -> VmResult<Value> + 'static,
    ) -> Value {
        Self::make(name, BuiltinKind::Primitive, cost, func)
    }

    pub fn game(name: &str, func: impl Fn(&mut Vm, Vec<Value>) -> VmResult<Value> + 'static) -> Value {
        Self::make(name, BuiltinKind::Game, None, func)
    }

    pub fn artifact(name: &str, func: impl Fn(&mut Vm, Vec<Value>) -> VmResult<Value> + 'static) -> Value {
        Self::make(name, BuiltinKind::Artifact, None, func)
    }

    fn make(
        name: &str,
        kind: BuiltinKind,
        cost: Option<CostShape>,
        func: impl Fn(&mut Vm, Vec<Value>) -> VmResult<Value> + 'static,
    ) -> Value {
        Value::Builtin(Rc::new(Builtin {
            name: name.to_string(),
            kind,
            cost,
            func: Rc::new(func),
        }))
    }
}

pub struct BoundMethod {
    pub receiver: Value,
    pub def: &'static MethodDef,
}

/// An imported module: its own namespace, read-only to importers.
pub struct Module {
    pub name: String,
    pub namespace: Namespace,
}

impl Module {
    pub fn new(name: &str, namespace: Namespace) -> Value {
        Value::Module(Rc::new(Module {
            name: name.to_string(),
            namespace,
        }))
    }

    /// A module from a fixed list of bindings.
    pub fn from_entries(name: &str, entries: impl IntoIterator<Item = (String, Value)>) -> Value {
        Self::new(name, Rc::new(RefCell::new(entries.into_iter().collect())))
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.namespace.borrow().get(name).cloned()
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Ranges, Slices, Iterators
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeValue {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

impl RangeValue {
    pub fn len(&self) -> usize {
        let (start, stop, step) = (self.start as i128, self.stop as i128, self.step as i128);
        let n = if step > 0 && start < stop {
            (stop - start + step - 1) / step
        } else if step < 0 && start > stop {
            (start - stop - step - 1) / -step
        } else {
            0
        };
        n.min(usize::MAX as i128) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<i64> {
        (index < self.len()).then(|| self.start + self.step * index as i64)
    }

    pub fn contains(&self, value: i64) -> bool {
        let in_bounds = if self.step > 0 {
            self.start <= value && value < self.stop
        } else {
            self.stop < value && value <= self.start
        };
        in_bounds && (value as i128 - self.start as i128) % self.step as i128 == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceValue {
    pub start: Option<i64>,
    pub stop: Option<i64>,
    pub step: Option<i64>,
}

impl SliceValue {
    /// Concrete `(start, stop, step)` for a sequence of length `len`.
    pub fn indices(&self, len: usize) -> VmResult<(i64, i64, i64)> {
        let len = len as i64;
        let step = self.step.unwrap_or(1);
        if step == 0 {
            return Err(RaiseError::value_error("slice step cannot be zero"));
        }
        let (lower, upper) = if step < 0 { (-1, len - 1) } else { (0, len) };
        let clamp = |bound: Option<i64>, default: i64| match bound {
            None => default,
            Some(i) if i < 0 => (i + len).max(lower),
            Some(i) => i.min(upper),
        };
        let start = clamp(self.start, if step < 0 { upper } else { lower });
        let stop = clamp(self.stop, if step < 0 { lower } else { upper });
        Ok((start, stop, step))
    }

    /// Number of positions selected from a sequence of length `len`.
    pub fn count(&self, len: usize) -> VmResult<usize> {
        let (start, stop, step) = self.indices(len)?;
        let span = if step > 0 { stop - start } else { start - stop };
        if span <= 0 {
            return Ok(0);
        }
        let step = step.unsigned_abs() as i64;
        Ok(((span + step - 1) / step) as usize)
    }

    /// Positions selected from a sequence of length `len`.
    pub fn positions(&self, len: usize) -> VmResult<Vec<usize>> {
        let (start, stop, step) = self.indices(len)?;
        let mut out = Vec::new();
        let mut i = start;
        while (step > 0 && i < stop) || (step < 0 && i > stop) {
            out.push(i as usize);
            i += step;
        }
        Ok(out)
    }
}

/// Iteration state behind an iterator value.
pub enum IterState {
    /// Live list: sees appends made during iteration.
    List {
        items: Rc<RefCell<Vec<Value>>>,
        index: usize,
    },
    /// Snapshot of a tuple, string, dict or set.
    Items { items: Vec<Value>, index: usize },
    Range { next: i64, remaining: usize, step: i64 },
    Enumerate { inner: Box<IterState>, count: i64 },
    Zip(Vec<IterState>),
    /// Another iterator value, advanced in place.
    Shared(Rc<RefCell<IterState>>),
}

impl IterState {
    pub fn items(items: Vec<Value>) -> Self {
        IterState::Items { items, index: 0 }
    }

    pub fn range(range: RangeValue) -> Self {
        IterState::Range {
            next: range.start,
            remaining: range.len(),
            step: range.step,
        }
    }

    pub fn next_value(&mut self) -> Option<Value> {
        match self {
            IterState::List { items, index } => {
                let value = items.borrow().get(*index).cloned()?;
                *index += 1;
                Some(value)
            }
            IterState::Items { items, index } => {
                let value = items.get(*index).cloned()?;
                *index += 1;
                Some(value)
            }
            IterState::Range {
                next,
                remaining,
                step,
            } => {
                if *remaining == 0 {
                    return None;
                }
                let value = *next;
                *remaining -= 1;
                *next = next.wrapping_add(*step);
                Some(Value::Int(value))
            }
            IterState::Enumerate { inner, count } => {
                let value = inner.next_value()?;
                let pair = Value::tuple(vec![Value::Int(*count), value]);
                *count += 1;
                Some(pair)
            }
            IterState::Zip(iters) => {
                if iters.is_empty() {
                    return None;
                }
                let mut row = Vec::with_capacity(iters.len());
                for iter in iters.iter_mut() {
                    row.push(iter.next_value()?);
                }
                Some(Value::tuple(row))
            }
            IterState::Shared(inner) => inner.borrow_mut().next_value(),
        }
    }

    /// Elements left, when cheaply known.
    pub fn remaining_hint(&self) -> Option<usize> {
        match self {
            IterState::List { items, index } => Some(items.borrow().len().saturating_sub(*index)),
            IterState::Items { items, index } => Some(items.len().saturating_sub(*index)),
            IterState::Range { remaining, .. } => Some(*remaining),
            IterState::Enumerate { inner, .. } => inner.remaining_hint(),
            IterState::Zip(iters) => iters.iter().map(IterState::remaining_hint).min().flatten(),
            IterState::Shared(inner) => inner.borrow().remaining_hint(),
        }
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Hashable Keys
// ══════════════════════════════════════════════════════════════════════════════

/// A value usable as a dict key or set member.
///
/// Numeric keys compare across types: `1`, `1.0` and `True` are the same key.
#[derive(Clone)]
pub struct Key(Value);

impl Key {
    pub fn new(value: Value) -> VmResult<Key> {
        if is_hashable(&value) {
            Ok(Key(value))
        } else {
            Err(RaiseError::type_error(format!(
                "unhashable type: '{}'",
                value.type_name()
            )))
        }
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&repr(&self.0))
    }
}

fn is_hashable(value: &Value) -> bool {
    match value {
        Value::None
        | Value::Bool(_)
        | Value::Int(_)
        | Value::Float(_)
        | Value::Str(_)
        | Value::Range(_)
        | Value::Type(_)
        | Value::ExcType(_) => true,
        Value::Tuple(items) => items.iter().all(is_hashable),
        _ => false,
    }
}

/// Integral floats hash like the equal int.
fn integral(value: &Value) -> Option<i64> {
    match value {
        Value::Bool(b) => Some(*b as i64),
        Value::Int(i) => Some(*i),
        Value::Float(f) if f.fract() == 0.0 && f.abs() < 9.0e18 => Some(*f as i64),
        _ => None,
    }
}

fn hash_value<H: Hasher>(value: &Value, state: &mut H) {
    if let Some(i) = integral(value) {
        0u8.hash(state);
        i.hash(state);
        return;
    }
    match value {
        Value::None => 1u8.hash(state),
        Value::Float(f) => {
            2u8.hash(state);
            f.to_bits().hash(state);
        }
        Value::Str(s) => {
            3u8.hash(state);
            s.hash(state);
        }
        Value::Tuple(items) => {
            4u8.hash(state);
            items.len().hash(state);
            for item in items.iter() {
                hash_value(item, state);
            }
        }
        Value::Range(r) => {
            5u8.hash(state);
            (r.start, r.stop, r.step).hash(state);
        }
        Value::Type(kind) => {
            6u8.hash(state);
            kind.hash(state);
        }
        Value::ExcType(kind) => {
            7u8.hash(state);
            kind.hash(state);
        }
        _ => 8u8.hash(state),
    }
}

fn keys_equal(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (integral(a), integral(b)) {
        return x == y;
    }
    match (a, b) {
        (Value::None, Value::None) => true,
        (Value::Float(x), Value::Float(y)) => x == y,
        (Value::Float(_), _) | (_, Value::Float(_)) => false,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Tuple(x), Value::Tuple(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(p, q)| keys_equal(p, q))
        }
        (Value::Range(x), Value::Range(y)) => x == y,
        (Value::Type(x), Value::Type(y)) => x == y,
        (Value::ExcType(x), Value::ExcType(y)) => x == y,
        _ => false,
    }
}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        hash_value(&self.0, state);
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        keys_equal(&self.0, &other.0)
    }
}

impl Eq for Key {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_keys_unify() {
        let mut set = IndexSet::new();
        set.insert(Key::new(Value::Int(1)).unwrap());
        assert!(set.contains(&Key::new(Value::Float(1.0)).unwrap()));
        assert!(set.contains(&Key::new(Value::Bool(true)).unwrap()));
        assert!(!set.contains(&Key::new(Value::Float(1.5)).unwrap()));
    }

    #[test]
    fn containers_are_unhashable() {
        assert!(Key::new(Value::list(vec![])).is_err());
        let nested = Value::tuple(vec![Value::Int(1), Value::list(vec![])]);
        assert!(Key::new(nested).is_err());
        assert!(Key::new(Value::tuple(vec![Value::str("a"), Value::None])).is_ok());
    }

    #[test]
    fn range_length_and_membership() {
        let r = RangeValue { start: 0, stop: 10, step: 3 };
        assert_eq!(r.len(), 4);
        assert!(r.contains(9));
        assert!(!r.contains(10));
        let down = RangeValue { start: 5, stop: -1, step: -2 };
        assert_eq!(down.len(), 3);
        assert_eq!(down.get(2), Some(1));
        assert!(RangeValue { start: 3, stop: 3, step: 1 }.is_empty());
    }

    #[test]
    fn slice_indices_follow_sequence_rules() {
        let s = SliceValue { start: None, stop: None, step: Some(-1) };
        assert_eq!(s.positions(3).unwrap(), vec![2, 1, 0]);
        let s = SliceValue { start: Some(-2), stop: None, step: None };
        assert_eq!(s.positions(5).unwrap(), vec![3, 4]);
        let s = SliceValue { start: Some(1), stop: Some(100), step: Some(2) };
        assert_eq!(s.positions(6).unwrap(), vec![1, 3, 5]);
        let s = SliceValue { start: None, stop: None, step: Some(0) };
        assert!(s.positions(3).is_err());
    }

    #[test]
    fn zip_stops_at_shortest() {
        let mut zip = IterState::Zip(vec![
            IterState::items(vec![Value::Int(1), Value::Int(2)]),
            IterState::range(RangeValue { start: 0, stop: 10, step: 1 }),
        ]);
        assert!(zip.next_value().is_some());
        assert!(zip.next_value().is_some());
        assert!(zip.next_value().is_none());
    }
}
