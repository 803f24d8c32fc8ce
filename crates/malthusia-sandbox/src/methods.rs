//! Methods of the built-in container and string types.
//!
//! Each type has a static table; lookups return `&'static MethodDef`, so a
//! resolved method is a plain pointer the VM can bind or call directly.
//! Costs live in [`crate::cost::method_cost`], keyed by `owner` and `name`.

use indexmap::IndexSet;

use crate::error::{FatalKind, RaiseError, VmResult};
use crate::format::{repr, to_str};
use crate::ops::{collect, collect_dict, collect_set, ensure_materializable, equals, sort_values};
use crate::value::{Key, Value};

pub type MethodFn = fn(&Value, Vec<Value>) -> VmResult<Value>;

pub struct MethodDef {
    pub name: &'static str,
    /// Type name of the receiver (`"list"`, `"str"`, ...).
    pub owner: &'static str,
    pub func: MethodFn,
}

/// The method `name` of `receiver`'s type, if it has one.
pub fn lookup(receiver: &Value, name: &str) -> Option<&'static MethodDef> {
    table_for(receiver)?.iter().find(|def| def.name == name)
}

fn table_for(receiver: &Value) -> Option<&'static [MethodDef]> {
    Some(match receiver {
        Value::List(_) => LIST_METHODS,
        Value::Str(_) => STR_METHODS,
        Value::Dict(_) => DICT_METHODS,
        Value::Set(_) => SET_METHODS,
        Value::Tuple(_) => TUPLE_METHODS,
        _ => return None,
    })
}

/// Call `def` on `receiver`, checking the receiver has the right type.
pub fn invoke(def: &'static MethodDef, receiver: &Value, args: Vec<Value>) -> VmResult<Value> {
    if receiver.type_name() != def.owner {
        return Err(RaiseError::type_error(format!(
            "descriptor '{}' for '{}' objects doesn't apply to a '{}' object",
            def.name,
            def.owner,
            receiver.type_name()
        )));
    }
    (def.func)(receiver, args)
}

pub(crate) fn arity(name: &str, args: &[Value], min: usize, max: usize) -> VmResult<()> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            format!("exactly {min}")
        } else {
            format!("from {min} to {max}")
        };
        return Err(RaiseError::type_error(format!(
            "{name}() takes {expected} arguments ({} given)",
            args.len()
        )));
    }
    Ok(())
}

fn wrong_receiver(owner: &str, receiver: &Value) -> RaiseError {
    RaiseError::fatal(
        FatalKind::SystemError,
        format!("{owner} method bound to a '{}' receiver", receiver.type_name()),
    )
}

fn str_arg<'a>(name: &str, value: &'a Value) -> VmResult<&'a str> {
    value.as_str().ok_or_else(|| {
        RaiseError::type_error(format!(
            "{name}() argument must be str, not {}",
            value.type_name()
        ))
    })
}

macro_rules! method_table {
    ($table:ident, $owner:literal, [$($name:literal => $func:path,)*]) => {
        static $table: &[MethodDef] = &[
            $(MethodDef { name: $name, owner: $owner, func: $func },)*
        ];
    };
}

// ══════════════════════════════════════════════════════════════════════════════
// list
// ══════════════════════════════════════════════════════════════════════════════

method_table!(LIST_METHODS, "list", [
    "append" => list::append,
    "extend" => list::extend,
    "pop" => list::pop,
    "insert" => list::insert,
    "remove" => list::remove,
    "index" => list::index,
    "count" => list::count,
    "sort" => list::sort,
    "reverse" => list::reverse,
    "copy" => list::copy,
    "clear" => list::clear,
]);

mod list {
    use super::*;

    fn items(receiver: &Value) -> VmResult<&std::rc::Rc<std::cell::RefCell<Vec<Value>>>> {
        match receiver {
            Value::List(items) => Ok(items),
            _ => Err(wrong_receiver("list", receiver)),
        }
    }

    pub fn append(receiver: &Value, args: Vec<Value>) -> VmResult<Value> {
        arity("append", &args, 1, 1)?;
        let mut items = items(receiver)?.borrow_mut();
        ensure_materializable(items.len() + 1)?;
        items.extend(args);
        Ok(Value::None)
    }

    pub fn extend(receiver: &Value, args: Vec<Value>) -> VmResult<Value> {
        arity("extend", &args, 1, 1)?;
        let extra = collect(&args[0])?;
        let mut items = items(receiver)?.borrow_mut();
        ensure_materializable(items.len() + extra.len())?;
        items.extend(extra);
        Ok(Value::None)
    }

    pub fn pop(receiver: &Value, args: Vec<Value>) -> VmResult<Value> {
        arity("pop", &args, 0, 1)?;
        let mut items = items(receiver)?.borrow_mut();
        if items.is_empty() {
            return Err(RaiseError::index_error("pop from empty list"));
        }
        let len = items.len() as i64;
        let index = match args.first() {
            Some(v) => v.as_int().ok_or_else(|| {
                RaiseError::type_error(format!("'{}' object cannot be interpreted as an integer", v.type_name()))
            })?,
            None => len - 1,
        };
        let index = if index < 0 { index + len } else { index };
        if !(0..len).contains(&index) {
            return Err(RaiseError::index_error("pop index out of range"));
        }
        Ok(items.remove(index as usize))
    }

    pub fn insert(receiver: &Value, mut args: Vec<Value>) -> VmResult<Value> {
        arity("insert", &args, 2, 2)?;
        let value = args.pop().unwrap_or(Value::None);
        let index = args[0].as_int().ok_or_else(|| {
            RaiseError::type_error(format!("'{}' object cannot be interpreted as an integer", args[0].type_name()))
        })?;
        let mut items = items(receiver)?.borrow_mut();
        ensure_materializable(items.len() + 1)?;
        let len = items.len() as i64;
        let at = if index < 0 { (index + len).max(0) } else { index.min(len) };
        items.insert(at as usize, value);
        Ok(Value::None)
    }

    fn position(items: &[Value], needle: &Value) -> VmResult<Option<usize>> {
        for (i, item) in items.iter().enumerate() {
            if equals(item, needle)? {
                return Ok(Some(i));
            }
        }
        Ok(None)
    }

    pub fn remove(receiver: &Value, args: Vec<Value>) -> VmResult<Value> {
        arity("remove", &args, 1, 1)?;
        let snapshot = items(receiver)?.borrow().clone();
        match position(&snapshot, &args[0])? {
            Some(i) => {
                items(receiver)?.borrow_mut().remove(i);
                Ok(Value::None)
            }
            None => Err(RaiseError::value_error("list.remove(x): x not in list")),
        }
    }

    pub fn index(receiver: &Value, args: Vec<Value>) -> VmResult<Value> {
        arity("index", &args, 1, 1)?;
        let snapshot = items(receiver)?.borrow().clone();
        position(&snapshot, &args[0])?
            .map(|i| Value::Int(i as i64))
            .ok_or_else(|| RaiseError::value_error(format!("{} is not in list", repr(&args[0]))))
    }

    pub fn count(receiver: &Value, args: Vec<Value>) -> VmResult<Value> {
        arity("count", &args, 1, 1)?;
        let snapshot = items(receiver)?.borrow().clone();
        let mut n = 0;
        for item in &snapshot {
            if equals(item, &args[0])? {
                n += 1;
            }
        }
        Ok(Value::Int(n))
    }

    pub fn sort(receiver: &Value, args: Vec<Value>) -> VmResult<Value> {
        arity("sort", &args, 0, 0)?;
        let mut sorted = items(receiver)?.borrow().clone();
        sort_values(&mut sorted)?;
        *items(receiver)?.borrow_mut() = sorted;
        Ok(Value::None)
    }

    pub fn reverse(receiver: &Value, args: Vec<Value>) -> VmResult<Value> {
        arity("reverse", &args, 0, 0)?;
        items(receiver)?.borrow_mut().reverse();
        Ok(Value::None)
    }

    pub fn copy(receiver: &Value, args: Vec<Value>) -> VmResult<Value> {
        arity("copy", &args, 0, 0)?;
        Ok(Value::list(items(receiver)?.borrow().clone()))
    }

    pub fn clear(receiver: &Value, args: Vec<Value>) -> VmResult<Value> {
        arity("clear", &args, 0, 0)?;
        items(receiver)?.borrow_mut().clear();
        Ok(Value::None)
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// str
// ══════════════════════════════════════════════════════════════════════════════

method_table!(STR_METHODS, "str", [
    "upper" => string::upper,
    "lower" => string::lower,
    "strip" => string::strip,
    "lstrip" => string::lstrip,
    "rstrip" => string::rstrip,
    "split" => string::split,
    "join" => string::join,
    "replace" => string::replace,
    "startswith" => string::startswith,
    "endswith" => string::endswith,
    "find" => string::find,
    "count" => string::count,
    "isdigit" => string::isdigit,
    "isalpha" => string::isalpha,
]);

mod string {
    use super::*;

    fn text(receiver: &Value) -> &str {
        receiver.as_str().unwrap_or_default()
    }

    pub fn upper(receiver: &Value, args: Vec<Value>) -> VmResult<Value> {
        arity("upper", &args, 0, 0)?;
        Ok(Value::from(text(receiver).to_uppercase()))
    }

    pub fn lower(receiver: &Value, args: Vec<Value>) -> VmResult<Value> {
        arity("lower", &args, 0, 0)?;
        Ok(Value::from(text(receiver).to_lowercase()))
    }

    fn trim_with(
        name: &str,
        receiver: &Value,
        args: &[Value],
        default: fn(&str) -> &str,
        custom: fn(&str, &[char]) -> String,
    ) -> VmResult<Value> {
        arity(name, args, 0, 1)?;
        match args.first() {
            None | Some(Value::None) => Ok(Value::str(default(text(receiver)))),
            Some(chars) => {
                let chars: Vec<char> = str_arg(name, chars)?.chars().collect();
                Ok(Value::from(custom(text(receiver), &chars)))
            }
        }
    }

    pub fn strip(receiver: &Value, args: Vec<Value>) -> VmResult<Value> {
        trim_with("strip", receiver, &args, str::trim, |s, c| s.trim_matches(c).to_string())
    }

    pub fn lstrip(receiver: &Value, args: Vec<Value>) -> VmResult<Value> {
        trim_with("lstrip", receiver, &args, str::trim_start, |s, c| {
            s.trim_start_matches(c).to_string()
        })
    }

    pub fn rstrip(receiver: &Value, args: Vec<Value>) -> VmResult<Value> {
        trim_with("rstrip", receiver, &args, str::trim_end, |s, c| {
            s.trim_end_matches(c).to_string()
        })
    }

    pub fn split(receiver: &Value, args: Vec<Value>) -> VmResult<Value> {
        arity("split", &args, 0, 1)?;
        let s = text(receiver);
        let parts: Vec<Value> = match args.first() {
            None | Some(Value::None) => s.split_whitespace().map(Value::str).collect(),
            Some(sep) => {
                let sep = str_arg("split", sep)?;
                if sep.is_empty() {
                    return Err(RaiseError::value_error("empty separator"));
                }
                s.split(sep).map(Value::str).collect()
            }
        };
        Ok(Value::list(parts))
    }

    pub fn join(receiver: &Value, args: Vec<Value>) -> VmResult<Value> {
        arity("join", &args, 1, 1)?;
        let mut parts = Vec::new();
        for (i, item) in collect(&args[0])?.iter().enumerate() {
            match item {
                Value::Str(s) => parts.push(s.to_string()),
                other => {
                    return Err(RaiseError::type_error(format!(
                        "sequence item {i}: expected str instance, {} found",
                        other.type_name()
                    )))
                }
            }
        }
        let sep = text(receiver);
        let total = parts.iter().map(String::len).sum::<usize>() + sep.len() * parts.len();
        ensure_materializable(total)?;
        Ok(Value::from(parts.join(sep)))
    }

    pub fn replace(receiver: &Value, args: Vec<Value>) -> VmResult<Value> {
        arity("replace", &args, 2, 2)?;
        let old = str_arg("replace", &args[0])?;
        let new = str_arg("replace", &args[1])?;
        let s = text(receiver);
        let hits = if old.is_empty() { s.chars().count() + 1 } else { s.matches(old).count() };
        ensure_materializable(s.len().saturating_add(hits.saturating_mul(new.len())))?;
        Ok(Value::from(s.replace(old, new)))
    }

    pub fn startswith(receiver: &Value, args: Vec<Value>) -> VmResult<Value> {
        arity("startswith", &args, 1, 1)?;
        Ok(Value::Bool(text(receiver).starts_with(str_arg("startswith", &args[0])?)))
    }

    pub fn endswith(receiver: &Value, args: Vec<Value>) -> VmResult<Value> {
        arity("endswith", &args, 1, 1)?;
        Ok(Value::Bool(text(receiver).ends_with(str_arg("endswith", &args[0])?)))
    }

    pub fn find(receiver: &Value, args: Vec<Value>) -> VmResult<Value> {
        arity("find", &args, 1, 1)?;
        let s = text(receiver);
        Ok(Value::Int(match s.find(str_arg("find", &args[0])?) {
            Some(byte) => s[..byte].chars().count() as i64,
            None => -1,
        }))
    }

    pub fn count(receiver: &Value, args: Vec<Value>) -> VmResult<Value> {
        arity("count", &args, 1, 1)?;
        let s = text(receiver);
        let needle = str_arg("count", &args[0])?;
        let n = if needle.is_empty() { s.chars().count() + 1 } else { s.matches(needle).count() };
        Ok(Value::Int(n as i64))
    }

    pub fn isdigit(receiver: &Value, args: Vec<Value>) -> VmResult<Value> {
        arity("isdigit", &args, 0, 0)?;
        let s = text(receiver);
        Ok(Value::Bool(!s.is_empty() && s.chars().all(|c| c.is_ascii_digit())))
    }

    pub fn isalpha(receiver: &Value, args: Vec<Value>) -> VmResult<Value> {
        arity("isalpha", &args, 0, 0)?;
        let s = text(receiver);
        Ok(Value::Bool(!s.is_empty() && s.chars().all(char::is_alphabetic)))
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// dict
// ══════════════════════════════════════════════════════════════════════════════

method_table!(DICT_METHODS, "dict", [
    "keys" => dict::keys,
    "values" => dict::values,
    "items" => dict::items,
    "get" => dict::get,
    "pop" => dict::pop,
    "update" => dict::update,
    "setdefault" => dict::setdefault,
    "copy" => dict::copy,
    "clear" => dict::clear,
]);

mod dict {
    use super::*;
    use indexmap::IndexMap;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn map(receiver: &Value) -> VmResult<&Rc<RefCell<IndexMap<Key, Value>>>> {
        match receiver {
            Value::Dict(map) => Ok(map),
            _ => Err(wrong_receiver("dict", receiver)),
        }
    }

    pub fn keys(receiver: &Value, args: Vec<Value>) -> VmResult<Value> {
        arity("keys", &args, 0, 0)?;
        Ok(Value::list(map(receiver)?.borrow().keys().map(|k| k.value().clone()).collect()))
    }

    pub fn values(receiver: &Value, args: Vec<Value>) -> VmResult<Value> {
        arity("values", &args, 0, 0)?;
        Ok(Value::list(map(receiver)?.borrow().values().cloned().collect()))
    }

    pub fn items(receiver: &Value, args: Vec<Value>) -> VmResult<Value> {
        arity("items", &args, 0, 0)?;
        Ok(Value::list(
            map(receiver)?
                .borrow()
                .iter()
                .map(|(k, v)| Value::tuple(vec![k.value().clone(), v.clone()]))
                .collect(),
        ))
    }

    pub fn get(receiver: &Value, args: Vec<Value>) -> VmResult<Value> {
        arity("get", &args, 1, 2)?;
        let key = Key::new(args[0].clone())?;
        let found = map(receiver)?.borrow().get(&key).cloned();
        Ok(found.or_else(|| args.get(1).cloned()).unwrap_or(Value::None))
    }

    pub fn pop(receiver: &Value, args: Vec<Value>) -> VmResult<Value> {
        arity("pop", &args, 1, 2)?;
        let key = Key::new(args[0].clone())?;
        let removed = map(receiver)?.borrow_mut().shift_remove(&key);
        match (removed, args.get(1)) {
            (Some(v), _) => Ok(v),
            (None, Some(default)) => Ok(default.clone()),
            (None, None) => Err(RaiseError::key_error(args[0].clone())),
        }
    }

    pub fn update(receiver: &Value, args: Vec<Value>) -> VmResult<Value> {
        arity("update", &args, 1, 1)?;
        let entries = collect_dict(&args[0])?;
        let mut target = map(receiver)?.borrow_mut();
        ensure_materializable(target.len() + entries.len())?;
        target.extend(entries);
        Ok(Value::None)
    }

    pub fn setdefault(receiver: &Value, args: Vec<Value>) -> VmResult<Value> {
        arity("setdefault", &args, 1, 2)?;
        let key = Key::new(args[0].clone())?;
        let default = args.get(1).cloned().unwrap_or(Value::None);
        Ok(map(receiver)?.borrow_mut().entry(key).or_insert(default).clone())
    }

    pub fn copy(receiver: &Value, args: Vec<Value>) -> VmResult<Value> {
        arity("copy", &args, 0, 0)?;
        Ok(Value::dict(map(receiver)?.borrow().clone()))
    }

    pub fn clear(receiver: &Value, args: Vec<Value>) -> VmResult<Value> {
        arity("clear", &args, 0, 0)?;
        map(receiver)?.borrow_mut().clear();
        Ok(Value::None)
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// set
// ══════════════════════════════════════════════════════════════════════════════

method_table!(SET_METHODS, "set", [
    "add" => set::add,
    "remove" => set::remove,
    "discard" => set::discard,
    "union" => set::union,
    "intersection" => set::intersection,
    "difference" => set::difference,
    "symmetric_difference" => set::symmetric_difference,
    "issubset" => set::issubset,
    "issuperset" => set::issuperset,
    "copy" => set::copy,
    "clear" => set::clear,
]);

mod set {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn members(receiver: &Value) -> VmResult<&Rc<RefCell<IndexSet<Key>>>> {
        match receiver {
            Value::Set(set) => Ok(set),
            _ => Err(wrong_receiver("set", receiver)),
        }
    }

    pub fn add(receiver: &Value, args: Vec<Value>) -> VmResult<Value> {
        arity("add", &args, 1, 1)?;
        let key = Key::new(args[0].clone())?;
        let mut set = members(receiver)?.borrow_mut();
        ensure_materializable(set.len() + 1)?;
        set.insert(key);
        Ok(Value::None)
    }

    pub fn remove(receiver: &Value, args: Vec<Value>) -> VmResult<Value> {
        arity("remove", &args, 1, 1)?;
        let key = Key::new(args[0].clone())?;
        if members(receiver)?.borrow_mut().shift_remove(&key) {
            Ok(Value::None)
        } else {
            Err(RaiseError::key_error(args[0].clone()))
        }
    }

    pub fn discard(receiver: &Value, args: Vec<Value>) -> VmResult<Value> {
        arity("discard", &args, 1, 1)?;
        let key = Key::new(args[0].clone())?;
        members(receiver)?.borrow_mut().shift_remove(&key);
        Ok(Value::None)
    }

    fn with_other(
        name: &str,
        receiver: &Value,
        args: &[Value],
        combine: fn(&IndexSet<Key>, &IndexSet<Key>) -> Value,
    ) -> VmResult<Value> {
        arity(name, args, 1, 1)?;
        let other = collect_set(&args[0])?;
        let mine = members(receiver)?.borrow();
        Ok(combine(&mine, &other))
    }

    pub fn union(receiver: &Value, args: Vec<Value>) -> VmResult<Value> {
        with_other("union", receiver, &args, |a, b| Value::set(a.union(b).cloned().collect()))
    }

    pub fn intersection(receiver: &Value, args: Vec<Value>) -> VmResult<Value> {
        with_other("intersection", receiver, &args, |a, b| {
            Value::set(a.intersection(b).cloned().collect())
        })
    }

    pub fn difference(receiver: &Value, args: Vec<Value>) -> VmResult<Value> {
        with_other("difference", receiver, &args, |a, b| {
            Value::set(a.difference(b).cloned().collect())
        })
    }

    pub fn symmetric_difference(receiver: &Value, args: Vec<Value>) -> VmResult<Value> {
        with_other("symmetric_difference", receiver, &args, |a, b| {
            Value::set(a.symmetric_difference(b).cloned().collect())
        })
    }

    pub fn issubset(receiver: &Value, args: Vec<Value>) -> VmResult<Value> {
        with_other("issubset", receiver, &args, |a, b| Value::Bool(a.is_subset(b)))
    }

    pub fn issuperset(receiver: &Value, args: Vec<Value>) -> VmResult<Value> {
        with_other("issuperset", receiver, &args, |a, b| Value::Bool(a.is_superset(b)))
    }

    pub fn copy(receiver: &Value, args: Vec<Value>) -> VmResult<Value> {
        arity("copy", &args, 0, 0)?;
        Ok(Value::set(members(receiver)?.borrow().clone()))
    }

    pub fn clear(receiver: &Value, args: Vec<Value>) -> VmResult<Value> {
        arity("clear", &args, 0, 0)?;
        members(receiver)?.borrow_mut().clear();
        Ok(Value::None)
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// tuple
// ══════════════════════════════════════════════════════════════════════════════

method_table!(TUPLE_METHODS, "tuple", [
    "index" => tuple::index,
    "count" => tuple::count,
]);

mod tuple {
    use super::*;

    fn items(receiver: &Value) -> &[Value] {
        match receiver {
            Value::Tuple(items) => items.as_slice(),
            _ => &[],
        }
    }

    pub fn index(receiver: &Value, args: Vec<Value>) -> VmResult<Value> {
        arity("index", &args, 1, 1)?;
        for (i, item) in items(receiver).iter().enumerate() {
            if equals(item, &args[0])? {
                return Ok(Value::Int(i as i64));
            }
        }
        Err(RaiseError::value_error("tuple.index(x): x not in tuple"))
    }

    pub fn count(receiver: &Value, args: Vec<Value>) -> VmResult<Value> {
        arity("count", &args, 1, 1)?;
        let mut n = 0;
        for item in items(receiver) {
            if equals(item, &args[0])? {
                n += 1;
            }
        }
        Ok(Value::Int(n))
    }
}

/// Every method name of a type, for error messages and tests.
pub fn names_of(receiver: &Value) -> Vec<&'static str> {
    table_for(receiver)
        .map(|t| t.iter().map(|d| d.name).collect())
        .unwrap_or_default()
}

/// `str()` of each element, joined; used by the `log` game method.
pub fn join_str(values: &[Value], sep: &str) -> String {
    values.iter().map(to_str).collect::<Vec<_>>().join(sep)
}
