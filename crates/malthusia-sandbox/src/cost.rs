//! Cost model: a closed table from operation to cost shape.
//!
//! Formulas return fractional costs; the charge is the value truncated
//! toward zero. Non-finite and negative results charge nothing.

use crate::ops::len_of;
use crate::value::{TypeKind, Value};

/// How an operation's cost is derived from its inputs or output.
#[derive(Clone, Copy)]
pub enum CostShape {
    Constant(u64),
    /// From the first argument (for methods: the receiver).
    OneArg(fn(&Value) -> f64),
    /// From the first two arguments (for methods: receiver and argument).
    TwoArgs(fn(&Value, &Value) -> f64),
    /// From the returned value; charged after the call.
    Output(fn(&Value) -> f64),
    /// From the first argument before the call, then from the output.
    InputOutput(fn(&Value) -> f64, fn(&Value) -> f64),
}

impl CostShape {
    /// Charge due before the call runs.
    pub fn before(&self, first: Option<&Value>, second: Option<&Value>) -> u64 {
        match (self, first, second) {
            (CostShape::Constant(n), _, _) => *n,
            (CostShape::OneArg(f), Some(a), _) => truncate(f(a)),
            (CostShape::TwoArgs(f), Some(a), Some(b)) => truncate(f(a, b)),
            (CostShape::InputOutput(f, _), Some(a), _) => truncate(f(a)),
            _ => 0,
        }
    }

    /// Charge due once the call has returned `output`.
    pub fn after(&self, output: &Value) -> u64 {
        match self {
            CostShape::Output(f) | CostShape::InputOutput(_, f) => truncate(f(output)),
            _ => 0,
        }
    }

    pub fn charges_after(&self) -> bool {
        matches!(self, CostShape::Output(_) | CostShape::InputOutput(..))
    }
}

fn truncate(cost: f64) -> u64 {
    if cost.is_finite() && cost > 0.0 {
        cost as u64
    } else {
        0
    }
}

/// Element count of a sized value, else 1.
fn size(value: &Value) -> f64 {
    len_of(value).unwrap_or(1) as f64
}

/// `ln(|x| + 1)` of a number, or of a sized value's length.
fn log_mag(value: &Value) -> f64 {
    let x = value.as_float().unwrap_or_else(|| size(value));
    (x.abs() + 1.0).ln()
}

fn log_size(value: &Value) -> f64 {
    (size(value) + 1.0).ln()
}

fn sort_cost(value: &Value) -> f64 {
    let n = size(value);
    n * (n + 3.0).ln().floor()
}

fn super_linear(value: &Value) -> f64 {
    let n = value.as_float().map(f64::abs).unwrap_or(0.0);
    n * (n + 1.0).ln()
}

fn radix_output(value: &Value) -> f64 {
    let Some(text) = value.as_str() else {
        return 0.0;
    };
    let digits = text.trim_start_matches('-');
    let (radix, body) = match digits.get(..2) {
        Some("0x") => (16, &digits[2..]),
        Some("0o") => (8, &digits[2..]),
        _ => (10, digits),
    };
    u64::from_str_radix(body, radix).map(|n| n as f64).unwrap_or(f64::MAX)
}

// ══════════════════════════════════════════════════════════════════════════════
// Tables
// ══════════════════════════════════════════════════════════════════════════════

/// Cost of a primitive in the capability namespace; `None` is free.
pub fn builtin_cost(name: &str) -> Option<CostShape> {
    Some(match name {
        "abs" | "chr" | "isinstance" | "ord" | "enumerate" | "zip" | "reversed" | "type" => {
            CostShape::Constant(1)
        }
        "divmod" => CostShape::TwoArgs(|a, b| (log_mag(a) + log_mag(b)) / 4.0),
        "hex" => CostShape::Output(|out| (radix_output(out) + 1.0).ln() / 4.0),
        "oct" => CostShape::Output(|out| (radix_output(out) + 1.0).ln()),
        "len" => CostShape::Output(log_mag),
        "pow" => CostShape::TwoArgs(|base, exp| log_mag(exp) + log_mag(base) / 4.0),
        "repr" => CostShape::Output(|out| size(out) / 4.0),
        "round" => CostShape::OneArg(|x| log_mag(x) / 4.0),
        "sorted" => CostShape::OneArg(sort_cost),
        "all" | "any" | "max" | "min" | "sum" => CostShape::OneArg(size),
        _ => return None,
    })
}

/// Cost of calling a built-in type as a conversion (`list(x)`, `str(x)`).
pub fn conversion_cost(kind: TypeKind) -> CostShape {
    match kind {
        TypeKind::List | TypeKind::Tuple | TypeKind::Dict | TypeKind::Set | TypeKind::Str => {
            CostShape::Output(size)
        }
        _ => CostShape::Constant(1),
    }
}

/// Cost of a built-in method; the receiver is the first cost argument.
pub fn method_cost(owner: &str, name: &str) -> CostShape {
    match (owner, name) {
        ("list", "append" | "pop" | "clear") => CostShape::Constant(1),
        ("list", "insert" | "remove" | "index" | "count" | "reverse" | "copy") => {
            CostShape::OneArg(size)
        }
        ("list", "extend") => CostShape::TwoArgs(|_, other| size(other)),
        ("list", "sort") => CostShape::OneArg(sort_cost),

        ("str", "replace") => CostShape::InputOutput(size, size),
        ("str", "join") => CostShape::TwoArgs(|sep, parts| size(parts) * (size(sep) + 1.0)),
        ("str", "startswith" | "endswith") => CostShape::TwoArgs(|_, affix| size(affix)),
        ("str", _) => CostShape::OneArg(size),

        ("dict", "get" | "pop" | "setdefault") => CostShape::OneArg(log_size),
        ("dict", "keys" | "values" | "items" | "copy") => CostShape::OneArg(size),
        ("dict", "update") => CostShape::TwoArgs(|_, other| size(other)),

        ("set", "add" | "remove" | "discard") => CostShape::OneArg(log_size),
        (
            "set",
            "union" | "intersection" | "difference" | "symmetric_difference" | "issubset"
            | "issuperset",
        ) => CostShape::TwoArgs(|a, b| log_size(a) + log_size(b)),
        ("set", "copy") => CostShape::OneArg(size),

        ("tuple", "index" | "count") => CostShape::OneArg(size),

        _ => CostShape::Constant(1),
    }
}

/// Cost of a host-module function; `None` is free.
pub fn module_cost(module: &str, name: &str) -> Option<CostShape> {
    Some(match (module, name) {
        ("math", "factorial") => CostShape::OneArg(super_linear),
        ("math", "comb" | "perm") => CostShape::TwoArgs(|n, k| super_linear(n) + log_mag(k)),
        ("math", "gcd") => CostShape::TwoArgs(|a, b| log_mag(a) + log_mag(b)),
        ("random", "shuffle") => CostShape::OneArg(size),
        ("math" | "random", _) => CostShape::Constant(1),
        _ => return None,
    })
}

/// Charge for `a * b`, computed before the multiplication materializes.
pub fn multiply_cost(a: &Value, b: &Value) -> u64 {
    let count = |v: &Value| match v {
        Value::Int(_) | Value::Bool(_) => v.as_int(),
        _ => None,
    };
    let sized = |v: &Value| match v {
        Value::Str(_) | Value::List(_) | Value::Tuple(_) => len_of(v),
        _ => None,
    };
    match (a, b) {
        _ if sized(a).is_some() && count(b).is_some() => {
            sized(a).unwrap_or(0).saturating_mul(count(b).unwrap_or(0).max(0) as usize) as u64
        }
        _ if count(a).is_some() && sized(b).is_some() => {
            sized(b).unwrap_or(0).saturating_mul(count(a).unwrap_or(0).max(0) as usize) as u64
        }
        (Value::Int(_) | Value::Bool(_) | Value::Float(_), Value::Int(_) | Value::Bool(_) | Value::Float(_)) => {
            truncate(log_mag(a) + log_mag(b))
        }
        _ => (len_of(a).unwrap_or(0) + len_of(b).unwrap_or(0)) as u64,
    }
}

/// Charge for `a + b` and `a += b` on sequences: both operands are copied.
pub fn concat_cost(a: &Value, b: &Value) -> u64 {
    match a {
        Value::Str(_) | Value::List(_) | Value::Tuple(_) => {
            len_of(a).unwrap_or(0).saturating_add(len_of(b).unwrap_or(0)) as u64
        }
        _ => 0,
    }
}

/// Charge for `item in container`: a scan for sequences, a hash probe
/// for dicts and sets, arithmetic for ranges.
pub fn contains_cost(container: &Value) -> u64 {
    match container {
        Value::Str(_) | Value::List(_) | Value::Tuple(_) => size(container) as u64,
        Value::Dict(_) | Value::Set(_) => truncate(log_size(container)),
        _ => 0,
    }
}

/// Formatted text is charged by its length once rendered.
pub fn format_cost() -> CostShape {
    CostShape::Output(size)
}
