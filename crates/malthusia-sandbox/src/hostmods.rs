//! Read-only host modules every program may import: `math` and `random`.

use std::cell::RefCell;
use std::rc::Rc;

use crate::builtins::{float_arg, float_to_int, int_arg};
use crate::cost::module_cost;
use crate::error::{RaiseError, VmResult};
use crate::methods::arity;
use crate::ops::collect;
use crate::rng::RngStream;
use crate::value::{Builtin, Module, Value};

type HostFn = fn(Vec<Value>) -> VmResult<Value>;

fn function(module: &str, name: &str, func: HostFn) -> (String, Value) {
    (
        name.to_string(),
        Builtin::primitive(name, module_cost(module, name), move |_, args| func(args)),
    )
}

// ══════════════════════════════════════════════════════════════════════════════
// math
// ══════════════════════════════════════════════════════════════════════════════

pub fn math_module() -> Value {
    let functions: [(&str, HostFn); 14] = [
        ("sqrt", math::sqrt),
        ("floor", math::floor),
        ("ceil", math::ceil),
        ("fabs", math::fabs),
        ("log", math::log),
        ("exp", math::exp),
        ("sin", math::sin),
        ("cos", math::cos),
        ("atan2", math::atan2),
        ("hypot", math::hypot),
        ("gcd", math::gcd),
        ("factorial", math::factorial),
        ("comb", math::comb),
        ("perm", math::perm),
    ];
    let mut entries: Vec<(String, Value)> = functions
        .into_iter()
        .map(|(name, func)| function("math", name, func))
        .collect();
    entries.push(("pi".into(), Value::Float(std::f64::consts::PI)));
    entries.push(("e".into(), Value::Float(std::f64::consts::E)));
    entries.push(("inf".into(), Value::Float(f64::INFINITY)));
    Module::from_entries("math", entries)
}

mod math {
    use super::*;

    fn domain_error() -> RaiseError {
        RaiseError::value_error("math domain error")
    }

    fn unary(name: &str, args: &[Value], f: fn(f64) -> f64) -> VmResult<Value> {
        arity(name, args, 1, 1)?;
        let x = float_arg(name, &args[0])?;
        let y = f(x);
        if y.is_nan() && !x.is_nan() {
            return Err(domain_error());
        }
        if y.is_infinite() && x.is_finite() {
            return Err(RaiseError::overflow("math range error"));
        }
        Ok(Value::Float(y))
    }

    pub fn sqrt(args: Vec<Value>) -> VmResult<Value> {
        unary("sqrt", &args, f64::sqrt)
    }

    pub fn fabs(args: Vec<Value>) -> VmResult<Value> {
        unary("fabs", &args, f64::abs)
    }

    pub fn exp(args: Vec<Value>) -> VmResult<Value> {
        unary("exp", &args, f64::exp)
    }

    pub fn sin(args: Vec<Value>) -> VmResult<Value> {
        unary("sin", &args, f64::sin)
    }

    pub fn cos(args: Vec<Value>) -> VmResult<Value> {
        unary("cos", &args, f64::cos)
    }

    fn rounding(name: &str, args: &[Value], f: fn(f64) -> f64) -> VmResult<Value> {
        arity(name, args, 1, 1)?;
        match &args[0] {
            v @ (Value::Int(_) | Value::Bool(_)) => Ok(Value::Int(v.as_int().unwrap_or(0))),
            v => Ok(Value::Int(float_to_int(f(float_arg(name, v)?))?)),
        }
    }

    pub fn floor(args: Vec<Value>) -> VmResult<Value> {
        rounding("floor", &args, f64::floor)
    }

    pub fn ceil(args: Vec<Value>) -> VmResult<Value> {
        rounding("ceil", &args, f64::ceil)
    }

    pub fn log(args: Vec<Value>) -> VmResult<Value> {
        arity("log", &args, 1, 2)?;
        let x = float_arg("log", &args[0])?;
        if x <= 0.0 {
            return Err(domain_error());
        }
        match args.get(1) {
            None => Ok(Value::Float(x.ln())),
            Some(base) => {
                let base = float_arg("log", base)?;
                if base <= 0.0 || base == 1.0 {
                    return Err(domain_error());
                }
                Ok(Value::Float(x.ln() / base.ln()))
            }
        }
    }

    pub fn atan2(args: Vec<Value>) -> VmResult<Value> {
        arity("atan2", &args, 2, 2)?;
        Ok(Value::Float(float_arg("atan2", &args[0])?.atan2(float_arg("atan2", &args[1])?)))
    }

    pub fn hypot(args: Vec<Value>) -> VmResult<Value> {
        arity("hypot", &args, 2, 2)?;
        Ok(Value::Float(float_arg("hypot", &args[0])?.hypot(float_arg("hypot", &args[1])?)))
    }

    pub fn gcd(args: Vec<Value>) -> VmResult<Value> {
        arity("gcd", &args, 2, 2)?;
        let (mut a, mut b) = (
            int_arg("gcd", &args[0])?.unsigned_abs(),
            int_arg("gcd", &args[1])?.unsigned_abs(),
        );
        while b != 0 {
            (a, b) = (b, a % b);
        }
        i64::try_from(a)
            .map(Value::Int)
            .map_err(|_| RaiseError::overflow("integer result out of range"))
    }

    fn non_negative(name: &str, value: &Value) -> VmResult<u64> {
        let n = int_arg(name, value)?;
        u64::try_from(n)
            .map_err(|_| RaiseError::value_error(format!("{name}() not defined for negative values")))
    }

    fn checked(result: Option<u128>) -> VmResult<Value> {
        result
            .and_then(|n| i64::try_from(n).ok())
            .map(Value::Int)
            .ok_or_else(|| RaiseError::overflow("integer result out of range"))
    }

    pub fn factorial(args: Vec<Value>) -> VmResult<Value> {
        arity("factorial", &args, 1, 1)?;
        let n = non_negative("factorial", &args[0])?;
        let mut acc: Option<u128> = Some(1);
        for i in 2..=n as u128 {
            acc = acc.and_then(|a| a.checked_mul(i)).filter(|a| *a <= i64::MAX as u128);
            if acc.is_none() {
                break;
            }
        }
        checked(acc)
    }

    /// `n! / (n-k)!`, stopping as soon as the result leaves `i64`.
    fn falling(n: u64, k: u64) -> Option<u128> {
        let mut acc: u128 = 1;
        for i in 0..k {
            acc = acc.checked_mul((n - i) as u128)?;
            if acc > i64::MAX as u128 {
                return None;
            }
        }
        Some(acc)
    }

    pub fn perm(args: Vec<Value>) -> VmResult<Value> {
        arity("perm", &args, 2, 2)?;
        let n = non_negative("perm", &args[0])?;
        let k = non_negative("perm", &args[1])?;
        if k > n {
            return Ok(Value::Int(0));
        }
        checked(falling(n, k))
    }

    pub fn comb(args: Vec<Value>) -> VmResult<Value> {
        arity("comb", &args, 2, 2)?;
        let n = non_negative("comb", &args[0])?;
        let k = non_negative("comb", &args[1])?;
        if k > n {
            return Ok(Value::Int(0));
        }
        let k = k.min(n - k);
        let mut acc: u128 = 1;
        for i in 0..k {
            // acc * (n - i) / (i + 1) stays integral at every step
            acc = match acc.checked_mul((n - i) as u128) {
                Some(v) => v / (i as u128 + 1),
                None => return checked(None),
            };
            if acc > i64::MAX as u128 {
                return checked(None);
            }
        }
        checked(Some(acc))
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// random
// ══════════════════════════════════════════════════════════════════════════════

/// The `random` module, drawing from a stream seeded by the host.
///
/// Programs may reseed it, but only with an explicit seed: reseeding from
/// the clock would make a session irreproducible.
pub fn random_module(seed: u64) -> Value {
    let state = Rc::new(RefCell::new(RngStream::new(seed)));
    let bind = |name: &str, func: fn(&RefCell<RngStream>, Vec<Value>) -> VmResult<Value>| {
        let state = Rc::clone(&state);
        (
            name.to_string(),
            Builtin::primitive(name, module_cost("random", name), move |_, args| func(&state, args)),
        )
    };
    let entries = vec![
        bind("seed", random::seed),
        bind("randint", random::randint),
        bind("random", random::random),
        bind("choice", random::choice),
        bind("shuffle", random::shuffle),
    ];
    Module::from_entries("random", entries)
}

mod random {
    use super::*;

    pub fn seed(state: &RefCell<RngStream>, args: Vec<Value>) -> VmResult<Value> {
        arity("seed", &args, 0, 1)?;
        match args.first() {
            None | Some(Value::None) => Err(RaiseError::value_error(
                "random.seed() requires an explicit seed",
            )),
            Some(v) => {
                let n = int_arg("seed", v)?;
                *state.borrow_mut() = RngStream::new(n as u64);
                Ok(Value::None)
            }
        }
    }

    pub fn randint(state: &RefCell<RngStream>, args: Vec<Value>) -> VmResult<Value> {
        arity("randint", &args, 2, 2)?;
        let a = int_arg("randint", &args[0])?;
        let b = int_arg("randint", &args[1])?;
        if a > b {
            return Err(RaiseError::value_error(format!(
                "empty range for randrange() ({a}, {}, {})",
                b as i128 + 1,
                b as i128 + 1 - a as i128
            )));
        }
        Ok(Value::Int(state.borrow_mut().int_range(a, b)))
    }

    pub fn random(state: &RefCell<RngStream>, args: Vec<Value>) -> VmResult<Value> {
        arity("random", &args, 0, 0)?;
        Ok(Value::Float(state.borrow_mut().uniform()))
    }

    pub fn choice(state: &RefCell<RngStream>, args: Vec<Value>) -> VmResult<Value> {
        arity("choice", &args, 1, 1)?;
        let items = collect(&args[0])?;
        if items.is_empty() {
            return Err(RaiseError::index_error("Cannot choose from an empty sequence"));
        }
        let i = state.borrow_mut().index(items.len());
        Ok(items[i].clone())
    }

    pub fn shuffle(state: &RefCell<RngStream>, args: Vec<Value>) -> VmResult<Value> {
        arity("shuffle", &args, 1, 1)?;
        let Value::List(items) = &args[0] else {
            return Err(RaiseError::type_error(format!(
                "shuffle() argument must be a list, not {}",
                args[0].type_name()
            )));
        };
        let mut items = items.borrow_mut();
        let mut rng = state.borrow_mut();
        for i in (1..items.len()).rev() {
            let j = rng.index(i + 1);
            items.swap(i, j);
        }
        Ok(Value::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExcKind;
    use crate::format::repr;

    fn math(name: &str, args: Vec<Value>) -> VmResult<Value> {
        let Value::Module(module) = math_module() else { unreachable!() };
        let Some(Value::Builtin(b)) = module.get(name) else { panic!("no math.{name}") };
        let mut vm = crate::vm::Vm::for_tests();
        (b.func)(&mut vm, args)
    }

    #[test]
    fn math_functions() {
        assert!(matches!(math("sqrt", vec![Value::Int(9)]).unwrap(), Value::Float(f) if f == 3.0));
        assert_eq!(math("sqrt", vec![Value::Int(-1)]).unwrap_err().kind(), ExcKind::ValueError);
        assert!(matches!(math("floor", vec![Value::Float(-1.5)]).unwrap(), Value::Int(-2)));
        assert!(matches!(math("gcd", vec![Value::Int(12), Value::Int(-18)]).unwrap(), Value::Int(6)));
        assert!(matches!(math("factorial", vec![Value::Int(5)]).unwrap(), Value::Int(120)));
        assert_eq!(math("factorial", vec![Value::Int(30)]).unwrap_err().kind(), ExcKind::OverflowError);
        assert!(matches!(math("comb", vec![Value::Int(5), Value::Int(2)]).unwrap(), Value::Int(10)));
        assert!(matches!(math("perm", vec![Value::Int(5), Value::Int(2)]).unwrap(), Value::Int(20)));
        assert_eq!(math("log", vec![Value::Int(0)]).unwrap_err().kind(), ExcKind::ValueError);
    }

    #[test]
    fn random_requires_explicit_seed_and_is_deterministic() {
        let draw = |seed: u64| {
            let Value::Module(module) = random_module(seed) else { unreachable!() };
            let Some(Value::Builtin(randint)) = module.get("randint") else { unreachable!() };
            let Some(Value::Builtin(reseed)) = module.get("seed") else { unreachable!() };
            let mut vm = crate::vm::Vm::for_tests();
            let err = (reseed.func)(&mut vm, vec![]).unwrap_err();
            assert_eq!(err.kind(), ExcKind::ValueError);
            (0..10)
                .map(|_| repr(&(randint.func)(&mut vm, vec![Value::Int(1), Value::Int(6)]).unwrap()))
                .collect::<Vec<_>>()
        };
        for _ in 0..100 {
            assert_eq!(draw(1337), draw(1337));
        }
        assert_ne!(draw(1), draw(2));
    }
}
