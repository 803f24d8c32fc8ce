//! Approximate byte size of a program's persistent state.
//!
//! Sizes follow a compact tagged serialization of the value graph: one tag
//! byte per value, length prefixes, raw payloads. A container reachable
//! twice is counted once; later references cost a fixed back-reference.

use std::collections::HashSet;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::value::{IterState, Value};

const BACK_REFERENCE: usize = 5;

/// Measured size of a namespace's bindings.
pub fn bytes_usage(bindings: &IndexMap<String, Value>) -> usize {
    let mut seen = HashSet::new();
    2 + bindings
        .iter()
        .map(|(name, value)| str_size(name) + measure(value, &mut seen))
        .sum::<usize>()
}

/// Measured size of one value.
pub fn value_size(value: &Value) -> usize {
    measure(value, &mut HashSet::new())
}

fn int_size(i: i64) -> usize {
    if i32::try_from(i).is_ok() {
        5
    } else {
        let bits = 64 - i.unsigned_abs().leading_zeros() as usize;
        5 + 2 * bits.div_ceil(15)
    }
}

fn str_size(s: &str) -> usize {
    if s.is_ascii() && s.len() < 256 {
        2 + s.len()
    } else {
        5 + s.len()
    }
}

fn first_visit<T: ?Sized>(rc: &Rc<T>, seen: &mut HashSet<usize>) -> bool {
    seen.insert(Rc::as_ptr(rc) as *const () as usize)
}

fn measure(value: &Value, seen: &mut HashSet<usize>) -> usize {
    match value {
        Value::None | Value::Null | Value::Bool(_) => 1,
        Value::Int(i) => int_size(*i),
        Value::Float(_) => 9,
        Value::Str(s) => str_size(s),
        Value::List(items) => {
            if !first_visit(items, seen) {
                return BACK_REFERENCE;
            }
            let items = items.borrow();
            5 + items.iter().map(|v| measure(v, seen)).sum::<usize>()
        }
        Value::Iter(state) => {
            if !first_visit(state, seen) {
                return BACK_REFERENCE;
            }
            5 + measure_iter(&state.borrow(), seen)
        }
        Value::Tuple(items) => {
            if !first_visit(items, seen) {
                return BACK_REFERENCE;
            }
            let header = if items.len() < 256 { 2 } else { 5 };
            header + items.iter().map(|v| measure(v, seen)).sum::<usize>()
        }
        Value::Set(set) => {
            if !first_visit(set, seen) {
                return BACK_REFERENCE;
            }
            let set = set.borrow();
            5 + set.iter().map(|k| measure(k.value(), seen)).sum::<usize>()
        }
        Value::Dict(map) => {
            if !first_visit(map, seen) {
                return BACK_REFERENCE;
            }
            let map = map.borrow();
            2 + map
                .iter()
                .map(|(k, v)| measure(k.value(), seen) + measure(v, seen))
                .sum::<usize>()
        }
        Value::Range(r) => {
            let widest = int_size(r.start).max(int_size(r.stop));
            5usize.saturating_add(r.len().saturating_mul(widest))
        }
        Value::Module(module) => {
            if !first_visit(module, seen) {
                return BACK_REFERENCE;
            }
            let namespace = module.namespace.borrow();
            2 + namespace
                .iter()
                .map(|(name, v)| str_size(name) + measure(v, seen))
                .sum::<usize>()
        }
        Value::Function(f) => {
            if !first_visit(f, seen) {
                return BACK_REFERENCE;
            }
            2 + f.defaults.iter().map(|v| measure(v, seen)).sum::<usize>()
        }
        Value::Exception(e) => {
            if !first_visit(e, seen) {
                return BACK_REFERENCE;
            }
            2 + e.args.iter().map(|v| measure(v, seen)).sum::<usize>()
        }
        Value::Method(bound) => {
            if !first_visit(bound, seen) {
                return BACK_REFERENCE;
            }
            5 + measure(&bound.receiver, seen)
        }
        Value::Detached(inner) => {
            if !first_visit(inner, seen) {
                return BACK_REFERENCE;
            }
            measure(inner, seen)
        }
        Value::Builtin(_)
        | Value::UnboundMethod(_)
        | Value::Type(_)
        | Value::ExcType(_)
        | Value::Slice(_)
        | Value::Code(_) => 5,
    }
}

/// What an iterator keeps alive: its backing list or snapshot.
fn measure_iter(state: &IterState, seen: &mut HashSet<usize>) -> usize {
    match state {
        IterState::List { items, .. } => {
            if !first_visit(items, seen) {
                return BACK_REFERENCE;
            }
            5 + items.borrow().iter().map(|v| measure(v, seen)).sum::<usize>()
        }
        IterState::Items { items, .. } => 5 + items.iter().map(|v| measure(v, seen)).sum::<usize>(),
        IterState::Range { .. } => 0,
        IterState::Enumerate { inner, .. } => measure_iter(inner, seen),
        IterState::Zip(parts) => parts.iter().map(|part| measure_iter(part, seen)).sum(),
        IterState::Shared(shared) => {
            if !first_visit(shared, seen) {
                return BACK_REFERENCE;
            }
            measure_iter(&shared.borrow(), seen)
        }
    }
}
