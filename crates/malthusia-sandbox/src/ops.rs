//! Value semantics: truthiness, arithmetic, comparison, subscripts and
//! iteration.
//!
//! Integers are 64-bit; results that do not fit raise `OverflowError`.
//! Anything that materializes a container checks the element ceiling
//! first and raises the fatal `MemoryError` above it.

use std::cmp::Ordering;
use std::rc::Rc;

use indexmap::{IndexMap, IndexSet};

use crate::error::{FatalKind, RaiseError, VmResult};
use crate::format::repr;
use crate::value::{IterState, Key, SliceValue, Value};

/// Most elements one operation may materialize.
pub const MAX_ELEMENTS: usize = 1 << 20;

/// Deepest container nesting compared structurally.
const MAX_COMPARE_DEPTH: usize = 200;

/// Arithmetic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arith {
    Add,
    Sub,
    Mul,
    TrueDiv,
    FloorDiv,
    Mod,
    Pow,
}

impl Arith {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::TrueDiv => "/",
            Self::FloorDiv => "//",
            Self::Mod => "%",
            Self::Pow => "** or pow()",
        }
    }
}

pub fn ensure_materializable(count: usize) -> VmResult<()> {
    if count > MAX_ELEMENTS {
        Err(RaiseError::fatal(
            FatalKind::MemoryError,
            format!("cannot materialize {count} elements (limit {MAX_ELEMENTS})"),
        ))
    } else {
        Ok(())
    }
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::None | Value::Null => false,
        Value::Bool(b) => *b,
        Value::Int(i) => *i != 0,
        Value::Float(f) => *f != 0.0,
        Value::Str(s) => !s.is_empty(),
        Value::List(items) => !items.borrow().is_empty(),
        Value::Tuple(items) => !items.is_empty(),
        Value::Dict(map) => !map.borrow().is_empty(),
        Value::Set(set) => !set.borrow().is_empty(),
        Value::Range(r) => !r.is_empty(),
        _ => true,
    }
}

/// `len(value)`, for sized values.
pub fn len_of(value: &Value) -> Option<usize> {
    Some(match value {
        Value::Str(s) => s.chars().count(),
        Value::List(items) => items.borrow().len(),
        Value::Tuple(items) => items.len(),
        Value::Dict(map) => map.borrow().len(),
        Value::Set(set) => set.borrow().len(),
        Value::Range(r) => r.len(),
        _ => return None,
    })
}

// ══════════════════════════════════════════════════════════════════════════════
// Arithmetic
// ══════════════════════════════════════════════════════════════════════════════

enum Num {
    Int(i64),
    Float(f64),
}

fn num(value: &Value) -> Option<Num> {
    match value {
        Value::Bool(b) => Some(Num::Int(*b as i64)),
        Value::Int(i) => Some(Num::Int(*i)),
        Value::Float(f) => Some(Num::Float(*f)),
        _ => None,
    }
}

fn unsupported(op: Arith, a: &Value, b: &Value) -> RaiseError {
    RaiseError::type_error(format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        op.symbol(),
        a.type_name(),
        b.type_name()
    ))
}

fn overflow() -> RaiseError {
    RaiseError::overflow("integer result out of range")
}

fn checked(result: Option<i64>) -> VmResult<Value> {
    result.map(Value::Int).ok_or_else(overflow)
}

pub fn binary(op: Arith, a: &Value, b: &Value) -> VmResult<Value> {
    if let (Some(x), Some(y)) = (num(a), num(b)) {
        return numeric(op, x, y);
    }
    match (op, a, b) {
        (Arith::Add, Value::Str(x), Value::Str(y)) => {
            ensure_materializable(x.len().saturating_add(y.len()))?;
            Ok(Value::from(format!("{x}{y}")))
        }
        (Arith::Add, Value::List(x), Value::List(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            ensure_materializable(x.len().saturating_add(y.len()))?;
            Ok(Value::list(x.iter().chain(y.iter()).cloned().collect()))
        }
        (Arith::Add, Value::Tuple(x), Value::Tuple(y)) => {
            ensure_materializable(x.len() + y.len())?;
            Ok(Value::tuple(x.iter().chain(y.iter()).cloned().collect()))
        }
        (Arith::Sub, Value::Set(x), Value::Set(y)) => {
            let y = y.borrow();
            Ok(Value::set(x.borrow().iter().filter(|k| !y.contains(*k)).cloned().collect()))
        }
        (Arith::Mul, seq, Value::Int(_) | Value::Bool(_)) if is_sequence(seq) => repeat(seq, b),
        (Arith::Mul, Value::Int(_) | Value::Bool(_), seq) if is_sequence(seq) => repeat(seq, a),
        _ => Err(unsupported(op, a, b)),
    }
}

fn is_sequence(value: &Value) -> bool {
    matches!(value, Value::Str(_) | Value::List(_) | Value::Tuple(_))
}

fn repeat(seq: &Value, count: &Value) -> VmResult<Value> {
    let n = count.as_int().unwrap_or(0).max(0) as usize;
    let unit = len_of(seq).unwrap_or(0);
    ensure_materializable(unit.saturating_mul(n))?;
    Ok(match seq {
        Value::Str(s) => Value::from(s.repeat(n)),
        Value::List(items) => {
            let items = items.borrow();
            Value::list(items.iter().cloned().cycle().take(items.len() * n).collect())
        }
        Value::Tuple(items) => Value::tuple(items.iter().cloned().cycle().take(items.len() * n).collect()),
        _ => Value::None,
    })
}

fn numeric(op: Arith, a: Num, b: Num) -> VmResult<Value> {
    match (a, b) {
        (Num::Int(x), Num::Int(y)) => int_op(op, x, y),
        (x, y) => {
            let x = match x {
                Num::Int(i) => i as f64,
                Num::Float(f) => f,
            };
            let y = match y {
                Num::Int(i) => i as f64,
                Num::Float(f) => f,
            };
            float_op(op, x, y)
        }
    }
}

fn int_op(op: Arith, x: i64, y: i64) -> VmResult<Value> {
    match op {
        Arith::Add => checked(x.checked_add(y)),
        Arith::Sub => checked(x.checked_sub(y)),
        Arith::Mul => checked(x.checked_mul(y)),
        Arith::TrueDiv => {
            if y == 0 {
                return Err(RaiseError::zero_division("division by zero"));
            }
            Ok(Value::Float(x as f64 / y as f64))
        }
        Arith::FloorDiv => {
            if y == 0 {
                return Err(RaiseError::zero_division("integer division or modulo by zero"));
            }
            let q = x.checked_div(y).ok_or_else(overflow)?;
            Ok(Value::Int(if x % y != 0 && ((x < 0) != (y < 0)) { q - 1 } else { q }))
        }
        Arith::Mod => {
            if y == 0 {
                return Err(RaiseError::zero_division("integer division or modulo by zero"));
            }
            let r = x.checked_rem(y).unwrap_or(0);
            Ok(Value::Int(if r != 0 && ((r < 0) != (y < 0)) { r + y } else { r }))
        }
        Arith::Pow => {
            if y < 0 {
                if x == 0 {
                    return Err(RaiseError::zero_division(
                        "0.0 cannot be raised to a negative power",
                    ));
                }
                return Ok(Value::Float((x as f64).powf(y as f64)));
            }
            let exp = u32::try_from(y).map_err(|_| overflow())?;
            checked(x.checked_pow(exp))
        }
    }
}

fn float_op(op: Arith, x: f64, y: f64) -> VmResult<Value> {
    let zero = || RaiseError::zero_division("float division by zero");
    Ok(Value::Float(match op {
        Arith::Add => x + y,
        Arith::Sub => x - y,
        Arith::Mul => x * y,
        Arith::TrueDiv => {
            if y == 0.0 {
                return Err(zero());
            }
            x / y
        }
        Arith::FloorDiv => {
            if y == 0.0 {
                return Err(zero());
            }
            (x / y).floor()
        }
        Arith::Mod => {
            if y == 0.0 {
                return Err(RaiseError::zero_division("float modulo"));
            }
            let r = x % y;
            if r != 0.0 && ((r < 0.0) != (y < 0.0)) {
                r + y
            } else {
                r
            }
        }
        Arith::Pow => {
            if x == 0.0 && y < 0.0 {
                return Err(RaiseError::zero_division(
                    "0.0 cannot be raised to a negative power",
                ));
            }
            x.powf(y)
        }
    }))
}

pub fn negate(value: &Value) -> VmResult<Value> {
    match value {
        Value::Bool(b) => Ok(Value::Int(-(*b as i64))),
        Value::Int(i) => checked(i.checked_neg()),
        Value::Float(f) => Ok(Value::Float(-f)),
        _ => Err(RaiseError::type_error(format!(
            "bad operand type for unary -: '{}'",
            value.type_name()
        ))),
    }
}

pub fn positive(value: &Value) -> VmResult<Value> {
    match value {
        Value::Bool(b) => Ok(Value::Int(*b as i64)),
        Value::Int(_) | Value::Float(_) => Ok(value.clone()),
        _ => Err(RaiseError::type_error(format!(
            "bad operand type for unary +: '{}'",
            value.type_name()
        ))),
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Comparison
// ══════════════════════════════════════════════════════════════════════════════

fn too_deep() -> RaiseError {
    RaiseError::fatal(
        FatalKind::RecursionError,
        "maximum recursion depth exceeded in comparison",
    )
}

pub fn equals(a: &Value, b: &Value) -> VmResult<bool> {
    equals_at(a, b, 0)
}

fn equals_at(a: &Value, b: &Value, depth: usize) -> VmResult<bool> {
    if depth > MAX_COMPARE_DEPTH {
        return Err(too_deep());
    }
    if let (Some(x), Some(y)) = (num(a), num(b)) {
        return Ok(match (x, y) {
            (Num::Int(x), Num::Int(y)) => x == y,
            (Num::Int(x), Num::Float(y)) | (Num::Float(y), Num::Int(x)) => x as f64 == y,
            (Num::Float(x), Num::Float(y)) => x == y,
        });
    }
    let seq_eq = |x: &[Value], y: &[Value]| -> VmResult<bool> {
        if x.len() != y.len() {
            return Ok(false);
        }
        for (p, q) in x.iter().zip(y) {
            if !equals_at(p, q, depth + 1)? {
                return Ok(false);
            }
        }
        Ok(true)
    };
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => Ok(x == y),
        (Value::List(x), Value::List(y)) => {
            if Rc::ptr_eq(x, y) {
                return Ok(true);
            }
            seq_eq(&x.borrow(), &y.borrow())
        }
        (Value::Tuple(x), Value::Tuple(y)) => seq_eq(x, y),
        (Value::Dict(x), Value::Dict(y)) => {
            if Rc::ptr_eq(x, y) {
                return Ok(true);
            }
            let (x, y) = (x.borrow(), y.borrow());
            if x.len() != y.len() {
                return Ok(false);
            }
            for (k, v) in x.iter() {
                match y.get(k) {
                    Some(w) if equals_at(v, w, depth + 1)? => {}
                    _ => return Ok(false),
                }
            }
            Ok(true)
        }
        (Value::Set(x), Value::Set(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            Ok(x.len() == y.len() && x.iter().all(|k| y.contains(k)))
        }
        (Value::Range(x), Value::Range(y)) => {
            Ok(x.len() == y.len() && (x.is_empty() || (x.start == y.start && (x.len() == 1 || x.step == y.step))))
        }
        (Value::Slice(x), Value::Slice(y)) => Ok(x == y),
        _ => Ok(a.is(b)),
    }
}

/// Ordering for `<`-style comparisons; `None` when unordered (NaN).
pub fn partial_order(a: &Value, b: &Value) -> VmResult<Option<Ordering>> {
    order_at(a, b, 0)
}

fn order_at(a: &Value, b: &Value, depth: usize) -> VmResult<Option<Ordering>> {
    if depth > MAX_COMPARE_DEPTH {
        return Err(too_deep());
    }
    if let (Some(x), Some(y)) = (num(a), num(b)) {
        return Ok(match (x, y) {
            (Num::Int(x), Num::Int(y)) => Some(x.cmp(&y)),
            (Num::Int(x), Num::Float(y)) => (x as f64).partial_cmp(&y),
            (Num::Float(x), Num::Int(y)) => x.partial_cmp(&(y as f64)),
            (Num::Float(x), Num::Float(y)) => x.partial_cmp(&y),
        });
    }
    let seq_order = |x: &[Value], y: &[Value]| -> VmResult<Option<Ordering>> {
        for (p, q) in x.iter().zip(y) {
            if !equals_at(p, q, depth + 1)? {
                return order_at(p, q, depth + 1);
            }
        }
        Ok(Some(x.len().cmp(&y.len())))
    };
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => Ok(Some(x.cmp(y))),
        (Value::List(x), Value::List(y)) => {
            let (x, y) = (x.borrow().clone(), y.borrow().clone());
            seq_order(&x, &y)
        }
        (Value::Tuple(x), Value::Tuple(y)) => seq_order(x, y),
        (Value::Set(x), Value::Set(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            let sub = x.iter().all(|k| y.contains(k));
            let sup = y.iter().all(|k| x.contains(k));
            Ok(match (sub, sup) {
                (true, true) => Some(Ordering::Equal),
                (true, false) => Some(Ordering::Less),
                (false, true) => Some(Ordering::Greater),
                (false, false) => None,
            })
        }
        _ => Err(RaiseError::type_error(format!(
            "'<' not supported between instances of '{}' and '{}'",
            a.type_name(),
            b.type_name()
        ))),
    }
}

/// `item in container`.
pub fn contains(container: &Value, item: &Value) -> VmResult<bool> {
    match container {
        Value::Str(s) => match item {
            Value::Str(needle) => Ok(s.contains(&**needle)),
            _ => Err(RaiseError::type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                item.type_name()
            ))),
        },
        Value::List(items) => {
            let items = items.borrow().clone();
            any_equal(&items, item)
        }
        Value::Tuple(items) => any_equal(items, item),
        Value::Dict(map) => Ok(map.borrow().contains_key(&Key::new(item.clone())?)),
        Value::Set(set) => Ok(set.borrow().contains(&Key::new(item.clone())?)),
        Value::Range(r) => Ok(match item {
            Value::Int(_) | Value::Bool(_) => r.contains(item.as_int().unwrap_or(0)),
            Value::Float(f) if f.fract() == 0.0 => r.contains(*f as i64),
            _ => false,
        }),
        _ => Err(RaiseError::type_error(format!(
            "argument of type '{}' is not iterable",
            container.type_name()
        ))),
    }
}

fn any_equal(items: &[Value], item: &Value) -> VmResult<bool> {
    for candidate in items {
        if equals(candidate, item)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Stable merge sort with a fallible comparison.
pub fn sort_values(items: &mut Vec<Value>) -> VmResult<()> {
    if items.len() < 2 {
        return Ok(());
    }
    let right = items.split_off(items.len() / 2);
    let mut left = std::mem::take(items);
    let mut right = right;
    sort_values(&mut left)?;
    sort_values(&mut right)?;
    items.reserve(left.len() + right.len());
    let mut left = left.into_iter().peekable();
    let mut right = right.into_iter().peekable();
    while let (Some(l), Some(r)) = (left.peek(), right.peek()) {
        let take_right = partial_order(r, l)? == Some(Ordering::Less);
        let next = if take_right { right.next() } else { left.next() };
        items.extend(next);
    }
    items.extend(left);
    items.extend(right);
    Ok(())
}

// ══════════════════════════════════════════════════════════════════════════════
// Subscripts
// ══════════════════════════════════════════════════════════════════════════════

fn index_position(index: &Value, len: usize, what: &str) -> VmResult<usize> {
    let i = index.as_int().ok_or_else(|| {
        RaiseError::type_error(format!(
            "{what} indices must be integers or slices, not {}",
            index.type_name()
        ))
    })?;
    let resolved = if i < 0 { i + len as i64 } else { i };
    if resolved < 0 || resolved >= len as i64 {
        return Err(RaiseError::index_error(format!("{what} index out of range")));
    }
    Ok(resolved as usize)
}

pub fn get_item(container: &Value, index: &Value) -> VmResult<Value> {
    match (container, index) {
        (Value::List(items), Value::Slice(slice)) => {
            let items = items.borrow();
            Ok(Value::list(select(&items, slice)?))
        }
        (Value::List(items), _) => {
            let items = items.borrow();
            Ok(items[index_position(index, items.len(), "list")?].clone())
        }
        (Value::Tuple(items), Value::Slice(slice)) => Ok(Value::tuple(select(items, slice)?)),
        (Value::Tuple(items), _) => Ok(items[index_position(index, items.len(), "tuple")?].clone()),
        (Value::Str(s), Value::Slice(slice)) => {
            let chars: Vec<char> = s.chars().collect();
            let picked: String = slice.positions(chars.len())?.into_iter().map(|i| chars[i]).collect();
            Ok(Value::from(picked))
        }
        (Value::Str(s), _) => {
            let len = s.chars().count();
            let i = index_position(index, len, "string")?;
            Ok(Value::from(s.chars().nth(i).map(String::from).unwrap_or_default()))
        }
        (Value::Range(r), Value::Slice(slice)) => Ok(Value::list(
            slice
                .positions(r.len())?
                .into_iter()
                .filter_map(|i| r.get(i).map(Value::Int))
                .collect(),
        )),
        (Value::Range(r), _) => {
            let i = index_position(index, r.len(), "range object")?;
            Ok(r.get(i).map(Value::Int).unwrap_or(Value::None))
        }
        (Value::Dict(map), _) => {
            let key = Key::new(index.clone())?;
            map.borrow()
                .get(&key)
                .cloned()
                .ok_or_else(|| RaiseError::key_error(index.clone()))
        }
        _ => Err(RaiseError::type_error(format!(
            "'{}' object is not subscriptable",
            container.type_name()
        ))),
    }
}

fn select(items: &[Value], slice: &SliceValue) -> VmResult<Vec<Value>> {
    Ok(slice
        .positions(items.len())?
        .into_iter()
        .map(|i| items[i].clone())
        .collect())
}

pub fn set_item(container: &Value, index: &Value, value: Value) -> VmResult<()> {
    match container {
        Value::List(items) => {
            if let Value::Slice(slice) = index {
                return assign_slice(container, slice, value);
            }
            let mut items = items.borrow_mut();
            let i = index_position(index, items.len(), "list assignment")?;
            items[i] = value;
            Ok(())
        }
        Value::Dict(map) => {
            map.borrow_mut().insert(Key::new(index.clone())?, value);
            Ok(())
        }
        _ => Err(RaiseError::type_error(format!(
            "'{}' object does not support item assignment",
            container.type_name()
        ))),
    }
}

/// `xs[a:b] = values` for step-1 slices.
fn assign_slice(container: &Value, slice: &SliceValue, value: Value) -> VmResult<()> {
    let Value::List(items) = container else {
        return Ok(());
    };
    let replacement = collect(&value)?;
    let mut items = items.borrow_mut();
    let (start, stop, step) = slice.indices(items.len())?;
    if step != 1 {
        return Err(RaiseError::value_error("extended slice assignment is not supported"));
    }
    let start = start.max(0) as usize;
    let stop = (stop.max(start as i64) as usize).min(items.len());
    ensure_materializable(items.len() - (stop - start) + replacement.len())?;
    items.splice(start..stop, replacement);
    Ok(())
}

pub fn del_item(container: &Value, index: &Value) -> VmResult<()> {
    match container {
        Value::List(items) => {
            let mut items = items.borrow_mut();
            if let Value::Slice(slice) = index {
                let doomed = slice.positions(items.len())?;
                let mut i = 0;
                items.retain(|_| {
                    let keep = !doomed.contains(&i);
                    i += 1;
                    keep
                });
                return Ok(());
            }
            let i = index_position(index, items.len(), "list assignment")?;
            items.remove(i);
            Ok(())
        }
        Value::Dict(map) => {
            let key = Key::new(index.clone())?;
            map.borrow_mut()
                .shift_remove(&key)
                .map(|_| ())
                .ok_or_else(|| RaiseError::key_error(index.clone()))
        }
        _ => Err(RaiseError::type_error(format!(
            "'{}' object doesn't support item deletion",
            container.type_name()
        ))),
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Iteration
// ══════════════════════════════════════════════════════════════════════════════

/// Iteration state for `iter(value)`.
pub fn iterate(value: &Value) -> VmResult<IterState> {
    Ok(match value {
        Value::List(items) => IterState::List {
            items: Rc::clone(items),
            index: 0,
        },
        Value::Tuple(items) => IterState::items(items.to_vec()),
        Value::Str(s) => IterState::items(s.chars().map(|c| Value::from(c.to_string())).collect()),
        Value::Dict(map) => IterState::items(map.borrow().keys().map(|k| k.value().clone()).collect()),
        Value::Set(set) => IterState::items(set.borrow().iter().map(|k| k.value().clone()).collect()),
        Value::Range(r) => IterState::range(*r),
        Value::Iter(state) => IterState::Shared(Rc::clone(state)),
        _ => {
            return Err(RaiseError::type_error(format!(
                "'{}' object is not iterable",
                value.type_name()
            )))
        }
    })
}

/// Materialize every element of an iterable.
pub fn collect(value: &Value) -> VmResult<Vec<Value>> {
    if let Value::List(items) = value {
        return Ok(items.borrow().clone());
    }
    if let Value::Tuple(items) = value {
        return Ok(items.to_vec());
    }
    let mut state = iterate(value)?;
    if let Some(hint) = state.remaining_hint() {
        ensure_materializable(hint)?;
    }
    let mut out = Vec::new();
    while let Some(item) = state.next_value() {
        out.push(item);
        ensure_materializable(out.len())?;
    }
    Ok(out)
}

/// Build a set from any iterable.
pub fn collect_set(value: &Value) -> VmResult<IndexSet<Key>> {
    collect(value)?.into_iter().map(Key::new).collect()
}

/// Build a dict from a dict or an iterable of pairs.
pub fn collect_dict(value: &Value) -> VmResult<IndexMap<Key, Value>> {
    if let Value::Dict(map) = value {
        return Ok(map.borrow().clone());
    }
    let mut out = IndexMap::new();
    for pair in collect(value)? {
        let items = collect(&pair)?;
        let [key, value] = <[Value; 2]>::try_from(items).map_err(|items| {
            RaiseError::value_error(format!(
                "dictionary update sequence element has length {}; 2 is required",
                items.len()
            ))
        })?;
        out.insert(Key::new(key)?, value);
    }
    Ok(out)
}

/// A `KeyError`-style description of a missing key.
pub fn describe_key(key: &Value) -> String {
    repr(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExcKind;
    use crate::value::RangeValue;

    fn ints(values: &[i64]) -> Value {
        Value::list(values.iter().map(|&i| Value::Int(i)).collect())
    }

    #[test]
    fn floor_division_and_modulo_round_down() {
        assert!(matches!(binary(Arith::FloorDiv, &Value::Int(-7), &Value::Int(2)).unwrap(), Value::Int(-4)));
        assert!(matches!(binary(Arith::Mod, &Value::Int(-7), &Value::Int(2)).unwrap(), Value::Int(1)));
        assert!(matches!(binary(Arith::Mod, &Value::Int(7), &Value::Int(-2)).unwrap(), Value::Int(-1)));
        let err = binary(Arith::FloorDiv, &Value::Int(1), &Value::Int(0)).unwrap_err();
        assert_eq!(err.kind(), ExcKind::ZeroDivisionError);
    }

    #[test]
    fn integer_overflow_raises() {
        let err = binary(Arith::Mul, &Value::Int(i64::MAX), &Value::Int(2)).unwrap_err();
        assert_eq!(err.kind(), ExcKind::OverflowError);
        let err = binary(Arith::Pow, &Value::Int(10), &Value::Int(40)).unwrap_err();
        assert_eq!(err.kind(), ExcKind::OverflowError);
    }

    #[test]
    fn mixed_arithmetic_promotes() {
        assert!(matches!(binary(Arith::Add, &Value::Int(1), &Value::Float(0.5)).unwrap(), Value::Float(f) if f == 1.5));
        assert!(matches!(binary(Arith::TrueDiv, &Value::Int(1), &Value::Int(4)).unwrap(), Value::Float(f) if f == 0.25));
        assert!(matches!(binary(Arith::Add, &Value::Bool(true), &Value::Int(1)).unwrap(), Value::Int(2)));
    }

    #[test]
    fn sequence_repeat_checks_ceiling() {
        let out = binary(Arith::Mul, &ints(&[1, 2]), &Value::Int(3)).unwrap();
        assert_eq!(len_of(&out), Some(6));
        let err = binary(Arith::Mul, &Value::str("ab"), &Value::Int(1 << 40)).unwrap_err();
        assert_eq!(err.fatal_kind(), Some(FatalKind::MemoryError));
    }

    #[test]
    fn mismatched_operands_are_type_errors() {
        let err = binary(Arith::Add, &Value::Int(1), &Value::str("a")).unwrap_err();
        assert_eq!(err.kind(), ExcKind::TypeError);
        assert!(err.to_string().contains("'int' and 'str'"));
    }

    #[test]
    fn structural_equality() {
        assert!(equals(&ints(&[1, 2]), &ints(&[1, 2])).unwrap());
        assert!(equals(&Value::Int(1), &Value::Float(1.0)).unwrap());
        assert!(!equals(&Value::str("1"), &Value::Int(1)).unwrap());
        assert!(!equals(&ints(&[1]), &Value::tuple(vec![Value::Int(1)])).unwrap());
    }

    #[test]
    fn ordering_is_lexicographic() {
        assert_eq!(partial_order(&ints(&[1, 2]), &ints(&[1, 3])).unwrap(), Some(Ordering::Less));
        assert_eq!(partial_order(&ints(&[1, 2]), &ints(&[1])).unwrap(), Some(Ordering::Greater));
        assert_eq!(partial_order(&Value::Float(f64::NAN), &Value::Int(1)).unwrap(), None);
        assert!(partial_order(&Value::Int(1), &Value::str("a")).is_err());
    }

    #[test]
    fn sort_is_stable_and_fallible() {
        let mut items = vec![Value::Int(3), Value::Float(1.0), Value::Int(1), Value::Int(2)];
        sort_values(&mut items).unwrap();
        assert!(matches!(items[0], Value::Float(_)));
        assert!(matches!(items[1], Value::Int(1)));
        let mut mixed = vec![Value::Int(1), Value::str("a")];
        assert!(sort_values(&mut mixed).is_err());
    }

    #[test]
    fn subscripts() {
        let xs = ints(&[10, 20, 30]);
        assert!(matches!(get_item(&xs, &Value::Int(-1)).unwrap(), Value::Int(30)));
        assert_eq!(get_item(&xs, &Value::Int(3)).unwrap_err().kind(), ExcKind::IndexError);
        let slice = Value::Slice(Rc::new(SliceValue { start: Some(1), stop: None, step: None }));
        assert_eq!(len_of(&get_item(&xs, &slice).unwrap()), Some(2));
        assert_eq!(crate::format::to_str(&get_item(&Value::str("héllo"), &Value::Int(1)).unwrap()), "é");
        set_item(&xs, &Value::Int(0), Value::Int(5)).unwrap();
        assert!(matches!(get_item(&xs, &Value::Int(0)).unwrap(), Value::Int(5)));
        del_item(&xs, &Value::Int(0)).unwrap();
        assert_eq!(len_of(&xs), Some(2));
        assert_eq!(set_item(&Value::tuple(vec![]), &Value::Int(0), Value::None).unwrap_err().kind(), ExcKind::TypeError);
    }

    #[test]
    fn membership() {
        assert!(contains(&Value::str("hello"), &Value::str("ell")).unwrap());
        assert!(contains(&ints(&[1, 2]), &Value::Float(2.0)).unwrap());
        let r = Value::Range(RangeValue { start: 0, stop: 10, step: 2 });
        assert!(contains(&r, &Value::Int(4)).unwrap());
        assert!(!contains(&r, &Value::Int(5)).unwrap());
        assert!(contains(&Value::Int(1), &Value::Int(1)).is_err());
    }

    #[test]
    fn collect_refuses_huge_ranges() {
        let r = Value::Range(RangeValue { start: 0, stop: i64::MAX, step: 1 });
        assert_eq!(collect(&r).unwrap_err().fatal_kind(), Some(FatalKind::MemoryError));
    }

    #[test]
    fn dict_from_pairs() {
        let pairs = Value::list(vec![Value::tuple(vec![Value::str("a"), Value::Int(1)])]);
        assert_eq!(collect_dict(&pairs).unwrap().len(), 1);
        let bad = Value::list(vec![Value::tuple(vec![Value::Int(1)])]);
        assert_eq!(collect_dict(&bad).unwrap_err().kind(), ExcKind::ValueError);
    }
}
