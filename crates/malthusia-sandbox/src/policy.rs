//! Capability checks.
//!
//! Every attribute, item and assignment-target resolution the VM performs
//! on behalf of a program passes through one of these functions.

use crate::error::{RaiseError, VmResult};
use crate::value::{BuiltinKind, Value};

fn is_private(name: &str) -> bool {
    name.starts_with('_')
}

/// Attribute reads: `_`-prefixed names do not exist.
pub fn check_attribute(owner: &Value, name: &str) -> VmResult<()> {
    if is_private(name) {
        return Err(RaiseError::attribute_error(format!(
            "'{}' object has no attribute '{name}'",
            owner.type_name()
        )));
    }
    Ok(())
}

/// Subscript keys: a string key beginning with `_` is refused outright.
pub fn check_item_key(key: &Value) -> VmResult<()> {
    match key {
        Value::Str(s) if is_private(s) => Err(RaiseError::runtime_error(
            "Cannot access attributes that begin with \"_\".",
        )),
        _ => Ok(()),
    }
}

/// Assignment targets: modules, functions and game methods are read-only.
pub fn check_writable(target: &Value) -> VmResult<()> {
    match target {
        Value::Module(_) => Err(RaiseError::runtime_error("Can't write to modules.")),
        Value::Builtin(b) if b.kind == BuiltinKind::Game => {
            Err(RaiseError::runtime_error(format!("Can't write to {}", b.name)))
        }
        Value::Function(_)
        | Value::Builtin(_)
        | Value::Method(_)
        | Value::UnboundMethod(_)
        | Value::Detached(_) => Err(RaiseError::runtime_error("Can't write to functions.")),
        _ => Ok(()),
    }
}

/// Arguments handed to a game method: user-defined and internal kinds are
/// refused.
pub fn check_game_args(args: &[Value]) -> VmResult<()> {
    for (i, arg) in args.iter().enumerate() {
        if matches!(
            arg,
            Value::Function(_)
                | Value::Module(_)
                | Value::Builtin(_)
                | Value::Method(_)
                | Value::UnboundMethod(_)
                | Value::Detached(_)
                | Value::Iter(_)
                | Value::Code(_)
        ) {
            return Err(RaiseError::type_error(format!(
                "arguments are invalid; argument {i} has type {} which is user-defined and possibly dangerous",
                arg.type_name()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExcKind;
    use crate::value::{Builtin, Module};

    #[test]
    fn private_names_are_refused() {
        let err = check_attribute(&Value::Int(1), "__class__").unwrap_err();
        assert_eq!(err.kind(), ExcKind::AttributeError);
        assert!(check_attribute(&Value::Int(1), "real").is_ok());

        let err = check_item_key(&Value::str("_secret")).unwrap_err();
        assert_eq!(err.kind(), ExcKind::RuntimeError);
        assert!(check_item_key(&Value::str("public")).is_ok());
        assert!(check_item_key(&Value::Int(0)).is_ok());
    }

    #[test]
    fn read_only_targets() {
        let module = Module::from_entries("m", Vec::new());
        assert_eq!(check_writable(&module).unwrap_err().to_string(), "RuntimeError: Can't write to modules.");
        let game = Builtin::game("move", |_, _| Ok(Value::None));
        assert_eq!(check_writable(&game).unwrap_err().to_string(), "RuntimeError: Can't write to move");
        let prim = Builtin::primitive("abs", None, |_, _| Ok(Value::None));
        assert!(check_writable(&prim).unwrap_err().to_string().contains("functions"));
        assert!(check_writable(&Value::list(vec![])).is_ok());
    }

    #[test]
    fn game_arguments_reject_callables() {
        let prim = Builtin::primitive("abs", None, |_, _| Ok(Value::None));
        let err = check_game_args(&[Value::Int(1), prim]).unwrap_err();
        assert!(err.to_string().contains("argument 1"));
        assert!(check_game_args(&[Value::Int(1), Value::str("N")]).is_ok());
    }
}
