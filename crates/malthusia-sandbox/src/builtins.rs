//! The capability namespace: the only names a program can reach besides
//! its own globals.
//!
//! Holds the safe primitive set (each cost-wrapped from
//! [`crate::cost::builtin_cost`]), the built-in types, the ordinary
//! exception types, the fatal types under their internal names, and the
//! instrumentation artifacts. Game methods are added by the session.

use std::cmp::Ordering;
use std::rc::Rc;

use indexmap::IndexMap;
use malthusia_codegen::{CHECKPOINT_NAME, MULTIPLY_NAME, REDIRECT_NAME};

use crate::cost::builtin_cost;
use crate::error::{ExcKind, Exception, FatalKind, RaiseError, VmResult};
use crate::format::{repr, to_str};
use crate::methods::arity;
use crate::ops::{
    binary, collect, collect_dict, collect_set, iterate, len_of, partial_order, sort_values,
    truthy, Arith,
};
use crate::value::{Builtin, IterState, RangeValue, TypeKind, Value};

/// Build a fresh capability namespace.
pub fn capability_namespace() -> IndexMap<String, Value> {
    let mut ns = IndexMap::new();

    for kind in [
        TypeKind::Bool,
        TypeKind::Int,
        TypeKind::Float,
        TypeKind::Str,
        TypeKind::List,
        TypeKind::Tuple,
        TypeKind::Dict,
        TypeKind::Set,
        TypeKind::Range,
        TypeKind::Type,
    ] {
        ns.insert(kind.name().to_string(), Value::Type(kind));
    }

    let primitives: [(&str, fn(Vec<Value>) -> VmResult<Value>); 20] = [
        ("abs", abs),
        ("all", all),
        ("any", any),
        ("chr", chr),
        ("divmod", divmod),
        ("enumerate", enumerate),
        ("hex", hex),
        ("isinstance", isinstance),
        ("len", len),
        ("max", max),
        ("min", min),
        ("oct", oct),
        ("ord", ord),
        ("pow", pow),
        ("repr", repr_builtin),
        ("reversed", reversed),
        ("round", round),
        ("sorted", sorted),
        ("sum", sum),
        ("zip", zip),
    ];
    for (name, func) in primitives {
        ns.insert(
            name.to_string(),
            Builtin::primitive(name, builtin_cost(name), move |_, args| func(args)),
        );
    }
    ns.insert(
        "print".to_string(),
        Builtin::primitive("print", None, |_, _| {
            Err(RaiseError::new(
                ExcKind::SyntaxError,
                "print() is not allowed. Please use log() instead.",
            ))
        }),
    );

    for kind in ExcKind::ORDINARY {
        ns.insert(kind.name().to_string(), Value::ExcType(kind));
    }
    for kind in FatalKind::ALL {
        ns.insert(kind.internal_name().to_string(), Value::ExcType(ExcKind::Fatal(kind)));
    }

    ns.insert(
        CHECKPOINT_NAME.to_string(),
        Builtin::artifact(CHECKPOINT_NAME, |vm, _| {
            vm.checkpoint()?;
            Ok(Value::None)
        }),
    );
    ns.insert(
        REDIRECT_NAME.to_string(),
        Builtin::artifact(REDIRECT_NAME, |vm, args| match args.as_slice() {
            [obj, Value::Str(name)] => vm.redirect_method(obj, name),
            _ => Err(RaiseError::fatal(FatalKind::SystemError, "malformed method redirect")),
        }),
    );
    ns.insert(
        MULTIPLY_NAME.to_string(),
        Builtin::artifact(MULTIPLY_NAME, |vm, args| match args.as_slice() {
            [a, b] => {
                vm.charge_multiply(a, b)?;
                Ok(Value::None)
            }
            _ => Err(RaiseError::fatal(FatalKind::SystemError, "malformed multiply charge")),
        }),
    );
    ns
}

// ══════════════════════════════════════════════════════════════════════════════
// Argument Helpers
// ══════════════════════════════════════════════════════════════════════════════

pub(crate) fn int_arg(name: &str, value: &Value) -> VmResult<i64> {
    value.as_int().ok_or_else(|| {
        RaiseError::type_error(format!(
            "{name}(): '{}' object cannot be interpreted as an integer",
            value.type_name()
        ))
    })
}

pub(crate) fn float_arg(name: &str, value: &Value) -> VmResult<f64> {
    value.as_float().ok_or_else(|| {
        RaiseError::type_error(format!(
            "{name}(): must be real number, not {}",
            value.type_name()
        ))
    })
}

/// A float converted to an integer, as `int()` and `round()` do.
pub(crate) fn float_to_int(f: f64) -> VmResult<i64> {
    if f.is_nan() {
        return Err(RaiseError::value_error("cannot convert float NaN to integer"));
    }
    if f.is_infinite() {
        return Err(RaiseError::overflow("cannot convert float infinity to integer"));
    }
    let t = f.trunc();
    if t < i64::MIN as f64 || t >= i64::MAX as f64 {
        return Err(RaiseError::overflow("integer result out of range"));
    }
    Ok(t as i64)
}

// ══════════════════════════════════════════════════════════════════════════════
// Primitives
// ══════════════════════════════════════════════════════════════════════════════

fn abs(args: Vec<Value>) -> VmResult<Value> {
    arity("abs", &args, 1, 1)?;
    match &args[0] {
        Value::Float(f) => Ok(Value::Float(f.abs())),
        v @ (Value::Int(_) | Value::Bool(_)) => v
            .as_int()
            .and_then(i64::checked_abs)
            .map(Value::Int)
            .ok_or_else(|| RaiseError::overflow("integer result out of range")),
        v => Err(RaiseError::type_error(format!(
            "bad operand type for abs(): '{}'",
            v.type_name()
        ))),
    }
}

fn all(args: Vec<Value>) -> VmResult<Value> {
    arity("all", &args, 1, 1)?;
    let mut iter = iterate(&args[0])?;
    while let Some(item) = iter.next_value() {
        if !truthy(&item) {
            return Ok(Value::Bool(false));
        }
    }
    Ok(Value::Bool(true))
}

fn any(args: Vec<Value>) -> VmResult<Value> {
    arity("any", &args, 1, 1)?;
    let mut iter = iterate(&args[0])?;
    while let Some(item) = iter.next_value() {
        if truthy(&item) {
            return Ok(Value::Bool(true));
        }
    }
    Ok(Value::Bool(false))
}

fn chr(args: Vec<Value>) -> VmResult<Value> {
    arity("chr", &args, 1, 1)?;
    let code = int_arg("chr", &args[0])?;
    u32::try_from(code)
        .ok()
        .and_then(char::from_u32)
        .map(|c| Value::from(c.to_string()))
        .ok_or_else(|| RaiseError::value_error("chr() arg not in range(0x110000)"))
}

fn divmod(args: Vec<Value>) -> VmResult<Value> {
    arity("divmod", &args, 2, 2)?;
    let q = binary(Arith::FloorDiv, &args[0], &args[1])?;
    let r = binary(Arith::Mod, &args[0], &args[1])?;
    Ok(Value::tuple(vec![q, r]))
}

fn enumerate(args: Vec<Value>) -> VmResult<Value> {
    arity("enumerate", &args, 1, 2)?;
    let count = match args.get(1) {
        Some(start) => int_arg("enumerate", start)?,
        None => 0,
    };
    Ok(Value::iter(IterState::Enumerate {
        inner: Box::new(iterate(&args[0])?),
        count,
    }))
}

fn radix(name: &str, args: &[Value], prefix: &str, render: fn(u64) -> String) -> VmResult<Value> {
    arity(name, args, 1, 1)?;
    let n = int_arg(name, &args[0])?;
    let sign = if n < 0 { "-" } else { "" };
    Ok(Value::from(format!("{sign}{prefix}{}", render(n.unsigned_abs()))))
}

fn hex(args: Vec<Value>) -> VmResult<Value> {
    radix("hex", &args, "0x", |n| format!("{n:x}"))
}

fn oct(args: Vec<Value>) -> VmResult<Value> {
    radix("oct", &args, "0o", |n| format!("{n:o}"))
}

/// `isinstance(value, cls)` where `cls` may be a tuple of classes.
pub(crate) fn is_instance(value: &Value, class: &Value) -> VmResult<bool> {
    match class {
        Value::Type(kind) => Ok(kind.contains(value)),
        Value::ExcType(kind) => Ok(matches!(value, Value::Exception(e) if e.kind.is_subclass_of(*kind))),
        Value::Tuple(classes) => {
            for class in classes.iter() {
                if is_instance(value, class)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => Err(RaiseError::type_error(
            "isinstance() arg 2 must be a type or tuple of types",
        )),
    }
}

fn isinstance(args: Vec<Value>) -> VmResult<Value> {
    arity("isinstance", &args, 2, 2)?;
    Ok(Value::Bool(is_instance(&args[0], &args[1])?))
}

fn len(args: Vec<Value>) -> VmResult<Value> {
    arity("len", &args, 1, 1)?;
    len_of(&args[0]).map(|n| Value::Int(n as i64)).ok_or_else(|| {
        RaiseError::type_error(format!(
            "object of type '{}' has no len()",
            args[0].type_name()
        ))
    })
}

fn extreme(name: &str, args: Vec<Value>, wanted: Ordering) -> VmResult<Value> {
    if args.is_empty() {
        return Err(RaiseError::type_error(format!(
            "{name} expected at least 1 argument, got 0"
        )));
    }
    let items = if args.len() == 1 { collect(&args[0])? } else { args };
    let mut best: Option<Value> = None;
    for item in items {
        best = Some(match best {
            Some(current) if partial_order(&item, &current)? != Some(wanted) => current,
            _ => item,
        });
    }
    best.ok_or_else(|| RaiseError::value_error(format!("{name}() arg is an empty sequence")))
}

fn max(args: Vec<Value>) -> VmResult<Value> {
    extreme("max", args, Ordering::Greater)
}

fn min(args: Vec<Value>) -> VmResult<Value> {
    extreme("min", args, Ordering::Less)
}

fn ord(args: Vec<Value>) -> VmResult<Value> {
    arity("ord", &args, 1, 1)?;
    let Value::Str(s) = &args[0] else {
        return Err(RaiseError::type_error(format!(
            "ord() expected string of length 1, but {} found",
            args[0].type_name()
        )));
    };
    let mut chars = s.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Ok(Value::Int(c as i64)),
        _ => Err(RaiseError::type_error(format!(
            "ord() expected a character, but string of length {} found",
            s.chars().count()
        ))),
    }
}

fn pow(args: Vec<Value>) -> VmResult<Value> {
    arity("pow", &args, 2, 2)?;
    binary(Arith::Pow, &args[0], &args[1])
}

fn repr_builtin(args: Vec<Value>) -> VmResult<Value> {
    arity("repr", &args, 1, 1)?;
    Ok(Value::from(repr(&args[0])))
}

fn reversed(args: Vec<Value>) -> VmResult<Value> {
    arity("reversed", &args, 1, 1)?;
    if !matches!(
        args[0],
        Value::List(_) | Value::Tuple(_) | Value::Str(_) | Value::Range(_)
    ) {
        return Err(RaiseError::type_error(format!(
            "'{}' object is not reversible",
            args[0].type_name()
        )));
    }
    let mut items = collect(&args[0])?;
    items.reverse();
    Ok(Value::iter(IterState::items(items)))
}

fn round(args: Vec<Value>) -> VmResult<Value> {
    arity("round", &args, 1, 2)?;
    let digits = match args.get(1) {
        None | Some(Value::None) => None,
        Some(d) => Some(int_arg("round", d)?),
    };
    match (&args[0], digits) {
        (v @ (Value::Int(_) | Value::Bool(_)), None) => Ok(Value::Int(v.as_int().unwrap_or(0))),
        (v @ (Value::Int(_) | Value::Bool(_)), Some(d)) => {
            let n = v.as_int().unwrap_or(0);
            if d >= 0 {
                return Ok(Value::Int(n));
            }
            let unit = 10i64.checked_pow(d.unsigned_abs().min(19) as u32).unwrap_or(i64::MAX);
            let rounded = (n as f64 / unit as f64).round_ties_even() * unit as f64;
            Ok(Value::Int(float_to_int(rounded)?))
        }
        (Value::Float(f), None) => Ok(Value::Int(float_to_int(f.round_ties_even())?)),
        (Value::Float(f), Some(d)) => {
            let scale = 10f64.powi(d.clamp(-308, 308) as i32);
            let rounded = (f * scale).round_ties_even() / scale;
            Ok(Value::Float(if rounded.is_finite() { rounded } else { *f }))
        }
        (v, _) => Err(RaiseError::type_error(format!(
            "type {} doesn't define __round__ method",
            v.type_name()
        ))),
    }
}

fn sorted(args: Vec<Value>) -> VmResult<Value> {
    arity("sorted", &args, 1, 1)?;
    let mut items = collect(&args[0])?;
    sort_values(&mut items)?;
    Ok(Value::list(items))
}

fn sum(args: Vec<Value>) -> VmResult<Value> {
    arity("sum", &args, 1, 2)?;
    let mut total = args.get(1).cloned().unwrap_or(Value::Int(0));
    if matches!(total, Value::Str(_)) {
        return Err(RaiseError::type_error(
            "sum() can't sum strings [use ''.join(seq) instead]",
        ));
    }
    let mut iter = iterate(&args[0])?;
    while let Some(item) = iter.next_value() {
        total = binary(Arith::Add, &total, &item)?;
    }
    Ok(total)
}

fn zip(args: Vec<Value>) -> VmResult<Value> {
    let iters = args.iter().map(iterate).collect::<VmResult<Vec<_>>>()?;
    Ok(Value::iter(IterState::Zip(iters)))
}

// ══════════════════════════════════════════════════════════════════════════════
// Type Conversions
// ══════════════════════════════════════════════════════════════════════════════

/// Call a built-in type: `int("3")`, `list(range(3))`, `type(x)`.
pub fn convert(kind: TypeKind, args: Vec<Value>) -> VmResult<Value> {
    let name = kind.name();
    match kind {
        TypeKind::Bool => {
            arity(name, &args, 0, 1)?;
            Ok(Value::Bool(args.first().is_some_and(truthy)))
        }
        TypeKind::Int => {
            arity(name, &args, 0, 2)?;
            match args.as_slice() {
                [] => Ok(Value::Int(0)),
                [v] => to_int(v),
                [Value::Str(s), base] => {
                    let base = int_arg(name, base)?;
                    let radix = u32::try_from(base)
                        .ok()
                        .filter(|b| (2..=36).contains(b))
                        .ok_or_else(|| RaiseError::value_error("int() base must be >= 2 and <= 36"))?;
                    parse_int(s, radix)
                }
                _ => Err(RaiseError::type_error(
                    "int() can't convert non-string with explicit base",
                )),
            }
        }
        TypeKind::Float => {
            arity(name, &args, 0, 1)?;
            match args.first() {
                None => Ok(Value::Float(0.0)),
                Some(Value::Str(s)) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| {
                    RaiseError::value_error(format!("could not convert string to float: {}", repr(&args[0])))
                }),
                Some(v) => v.as_float().map(Value::Float).ok_or_else(|| {
                    RaiseError::type_error(format!(
                        "float() argument must be a string or a number, not '{}'",
                        v.type_name()
                    ))
                }),
            }
        }
        TypeKind::Str => {
            arity(name, &args, 0, 1)?;
            Ok(Value::from(args.first().map(to_str).unwrap_or_default()))
        }
        TypeKind::List => {
            arity(name, &args, 0, 1)?;
            Ok(Value::list(match args.first() {
                Some(v) => collect(v)?,
                None => Vec::new(),
            }))
        }
        TypeKind::Tuple => {
            arity(name, &args, 0, 1)?;
            Ok(Value::tuple(match args.first() {
                Some(v) => collect(v)?,
                None => Vec::new(),
            }))
        }
        TypeKind::Set => {
            arity(name, &args, 0, 1)?;
            Ok(Value::set(match args.first() {
                Some(v) => collect_set(v)?,
                None => Default::default(),
            }))
        }
        TypeKind::Dict => {
            arity(name, &args, 0, 1)?;
            Ok(Value::dict(match args.first() {
                Some(v) => collect_dict(v)?,
                None => Default::default(),
            }))
        }
        TypeKind::Range => {
            arity(name, &args, 1, 3)?;
            let ints = args
                .iter()
                .map(|v| int_arg(name, v))
                .collect::<VmResult<Vec<_>>>()?;
            let (start, stop, step) = match ints.as_slice() {
                [stop] => (0, *stop, 1),
                [start, stop] => (*start, *stop, 1),
                [start, stop, step] => (*start, *stop, *step),
                _ => (0, 0, 1),
            };
            if step == 0 {
                return Err(RaiseError::value_error("range() arg 3 must not be zero"));
            }
            Ok(Value::Range(RangeValue { start, stop, step }))
        }
        TypeKind::Type => {
            arity(name, &args, 1, 1)?;
            Ok(args[0].type_of())
        }
        TypeKind::NoneType | TypeKind::Function | TypeKind::Builtin | TypeKind::Module => Err(
            RaiseError::type_error(format!("cannot create '{name}' instances")),
        ),
    }
}

fn to_int(value: &Value) -> VmResult<Value> {
    match value {
        Value::Int(_) | Value::Bool(_) => Ok(Value::Int(value.as_int().unwrap_or(0))),
        Value::Float(f) => Ok(Value::Int(float_to_int(*f)?)),
        Value::Str(s) => parse_int(s, 10),
        other => Err(RaiseError::type_error(format!(
            "int() argument must be a string or a number, not '{}'",
            other.type_name()
        ))),
    }
}

fn parse_int(text: &str, radix: u32) -> VmResult<Value> {
    let cleaned: String = text.trim().chars().filter(|c| *c != '_').collect();
    i64::from_str_radix(&cleaned, radix).map(Value::Int).map_err(|_| {
        RaiseError::value_error(format!(
            "invalid literal for int() with base {radix}: {}",
            repr(&Value::str(text))
        ))
    })
}

/// Construct an exception value from an exception type.
pub fn instantiate(kind: ExcKind, args: Vec<Value>) -> Value {
    Value::Exception(Rc::new(Exception::new(kind, args)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: Vec<Value>) -> VmResult<Value> {
        let primitives: &[(&str, fn(Vec<Value>) -> VmResult<Value>)] = &[
            ("abs", abs),
            ("chr", chr),
            ("divmod", divmod),
            ("hex", hex),
            ("max", max),
            ("min", min),
            ("ord", ord),
            ("round", round),
            ("sorted", sorted),
            ("sum", sum),
        ];
        let (_, func) = primitives.iter().find(|(n, _)| *n == name).unwrap();
        func(args)
    }

    #[test]
    fn namespace_exposes_public_names_only() {
        let ns = capability_namespace();
        for name in ["abs", "len", "range", "ValueError", "Exception", "print", "set"] {
            assert!(ns.contains_key(name), "missing {name}");
        }
        for name in ["OutOfBudget", "MemoryError", "open", "eval", "__import__"] {
            assert!(!ns.contains_key(name), "unexpected {name}");
        }
        for name in malthusia_codegen::GUARDED_EXCEPTIONS {
            assert!(ns.contains_key(*name));
        }
        assert!(ns.contains_key(CHECKPOINT_NAME));
    }

    #[test]
    fn numeric_primitives() {
        assert!(matches!(call("abs", vec![Value::Int(-4)]).unwrap(), Value::Int(4)));
        assert!(call("abs", vec![Value::Int(i64::MIN)]).is_err());
        assert_eq!(repr(&call("divmod", vec![Value::Int(-7), Value::Int(2)]).unwrap()), "(-4, 1)");
        assert_eq!(to_str(&call("hex", vec![Value::Int(-255)]).unwrap()), "-0xff");
        assert!(matches!(call("round", vec![Value::Float(2.5)]).unwrap(), Value::Int(2)));
        assert!(matches!(call("round", vec![Value::Float(3.5)]).unwrap(), Value::Int(4)));
        assert!(matches!(call("round", vec![Value::Int(1250), Value::Int(-2)]).unwrap(), Value::Int(1200)));
    }

    #[test]
    fn sequence_primitives() {
        let xs = Value::list(vec![Value::Int(3), Value::Int(1), Value::Int(2)]);
        assert!(matches!(call("max", vec![xs.clone()]).unwrap(), Value::Int(3)));
        assert!(matches!(call("min", vec![Value::Int(5), Value::Int(4)]).unwrap(), Value::Int(4)));
        assert!(matches!(call("sum", vec![xs.clone()]).unwrap(), Value::Int(6)));
        assert_eq!(repr(&call("sorted", vec![xs]).unwrap()), "[1, 2, 3]");
        assert!(call("max", vec![Value::list(vec![])]).is_err());
        assert_eq!(to_str(&call("chr", vec![Value::Int(97)]).unwrap()), "a");
        assert!(matches!(call("ord", vec![Value::str("a")]).unwrap(), Value::Int(97)));
        assert!(call("ord", vec![Value::str("ab")]).is_err());
    }

    #[test]
    fn conversions() {
        assert!(matches!(convert(TypeKind::Int, vec![Value::str(" 42 ")]).unwrap(), Value::Int(42)));
        assert!(matches!(convert(TypeKind::Int, vec![Value::str("ff"), Value::Int(16)]).unwrap(), Value::Int(255)));
        assert_eq!(convert(TypeKind::Int, vec![Value::str("x")]).unwrap_err().kind(), ExcKind::ValueError);
        assert!(matches!(convert(TypeKind::Int, vec![Value::Float(-2.7)]).unwrap(), Value::Int(-2)));
        assert_eq!(to_str(&convert(TypeKind::Str, vec![Value::Float(1.0)]).unwrap()), "1.0");
        assert_eq!(repr(&convert(TypeKind::List, vec![Value::str("ab")]).unwrap()), "['a', 'b']");
        assert_eq!(
            convert(TypeKind::Range, vec![Value::Int(0), Value::Int(5), Value::Int(0)]).unwrap_err().kind(),
            ExcKind::ValueError
        );
        assert!(matches!(convert(TypeKind::Type, vec![Value::Int(1)]).unwrap(), Value::Type(TypeKind::Int)));
    }

    #[test]
    fn isinstance_checks() {
        assert!(is_instance(&Value::Bool(true), &Value::Type(TypeKind::Int)).unwrap());
        let exc = instantiate(ExcKind::KeyError, vec![]);
        assert!(is_instance(&exc, &Value::ExcType(ExcKind::LookupError)).unwrap());
        let classes = Value::tuple(vec![Value::Type(TypeKind::Str), Value::Type(TypeKind::Float)]);
        assert!(is_instance(&Value::Float(1.0), &classes).unwrap());
        assert!(is_instance(&Value::Int(1), &Value::Int(1)).is_err());
    }
}
