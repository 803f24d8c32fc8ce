//! The compiled program unit and its constant pool.

use std::rc::Rc;

/// A value stored in a unit's constant pool.
#[derive(Debug, Clone)]
pub enum Constant {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tuple(Vec<Constant>),
    /// A nested unit: the body of a `def` or `lambda`.
    Code(Rc<CodeUnit>),
}

impl Constant {
    /// Identity used for pool deduplication.
    ///
    /// Stricter than value equality: `1`, `1.0` and `True` stay distinct,
    /// as do `0.0` and `-0.0`.
    pub fn same_as(&self, other: &Constant) -> bool {
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Tuple(a), Self::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_as(y))
            }
            (Self::Code(a), Self::Code(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Element or character count, for the literal size ceiling.
    pub fn size(&self) -> usize {
        match self {
            Self::Str(s) => s.chars().count(),
            Self::Tuple(items) => items.len(),
            _ => 0,
        }
    }

    /// Short rendering used by the disassembler.
    pub fn repr(&self) -> String {
        match self {
            Self::None => "None".into(),
            Self::Bool(true) => "True".into(),
            Self::Bool(false) => "False".into(),
            Self::Int(v) => v.to_string(),
            Self::Float(v) => format!("{v:?}"),
            Self::Str(s) => format!("{s:?}"),
            Self::Tuple(items) => {
                let inner: Vec<String> = items.iter().map(Constant::repr).collect();
                if inner.len() == 1 {
                    format!("({},)", inner[0])
                } else {
                    format!("({})", inner.join(", "))
                }
            }
            Self::Code(unit) => format!("<code {}>", unit.name),
        }
    }
}

impl PartialEq for Constant {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Code(a), Self::Code(b)) => a == b,
            (Self::Tuple(a), Self::Tuple(b)) => a == b,
            _ => self.same_as(other),
        }
    }
}

/// Whether a unit is a module body or a function body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    /// Top-level code; names resolve through `LOAD_NAME`/`STORE_NAME`.
    Module,
    /// A `def` or `lambda` body with fast locals.
    Function,
}

/// An immutable compiled program unit.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeUnit {
    pub name: String,
    /// Source file (bundle entry) the unit was compiled from.
    pub filename: String,
    pub kind: UnitKind,
    /// Number of positional parameters; they occupy the first `varnames`.
    pub argcount: u32,
    /// Fast-local names.
    pub varnames: Vec<String>,
    /// Names used by global, attribute and import instructions.
    pub names: Vec<String>,
    pub consts: Vec<Constant>,
    /// Encoded instruction words.
    pub code: Vec<u8>,
    pub first_line: u32,
    /// `(byte_delta, line_delta)` pairs; see [`crate::linetable`].
    pub lnotab: Vec<u8>,
    pub max_stack: u32,
}

impl CodeUnit {
    /// Index of `value` in the constant pool, appending it if absent.
    pub fn add_const(&mut self, value: Constant) -> u32 {
        intern_const(&mut self.consts, value)
    }

    /// Index of `name` in the name table, appending it if absent.
    pub fn add_name(&mut self, name: &str) -> u32 {
        intern_name(&mut self.names, name)
    }

    /// Nested units in constant-pool order.
    pub fn children(&self) -> impl Iterator<Item = &Rc<CodeUnit>> {
        self.consts.iter().filter_map(|c| match c {
            Constant::Code(unit) => Some(unit),
            _ => None,
        })
    }

    /// Number of instruction words, including `EXTENDED_ARG` prefixes.
    pub fn word_count(&self) -> usize {
        self.code.len() / 2
    }
}

pub(crate) fn intern_const(pool: &mut Vec<Constant>, value: Constant) -> u32 {
    if let Some(i) = pool.iter().position(|c| c.same_as(&value)) {
        return i as u32;
    }
    pool.push(value);
    (pool.len() - 1) as u32
}

pub(crate) fn intern_name(table: &mut Vec<String>, name: &str) -> u32 {
    if let Some(i) = table.iter().position(|n| n == name) {
        return i as u32;
    }
    table.push(name.to_string());
    (table.len() - 1) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_keeps_numeric_kinds_apart() {
        let mut pool = Vec::new();
        assert_eq!(intern_const(&mut pool, Constant::Int(1)), 0);
        assert_eq!(intern_const(&mut pool, Constant::Float(1.0)), 1);
        assert_eq!(intern_const(&mut pool, Constant::Bool(true)), 2);
        assert_eq!(intern_const(&mut pool, Constant::Int(1)), 0);
        assert_eq!(intern_const(&mut pool, Constant::Float(-0.0)), 3);
        assert_eq!(intern_const(&mut pool, Constant::Float(0.0)), 4);
    }

    #[test]
    fn names_are_interned() {
        let mut names = vec!["a".to_string()];
        assert_eq!(intern_name(&mut names, "b"), 1);
        assert_eq!(intern_name(&mut names, "a"), 0);
        assert_eq!(names.len(), 2);
    }

    #[test]
    fn tuple_repr() {
        let t = Constant::Tuple(vec![Constant::Int(1)]);
        assert_eq!(t.repr(), "(1,)");
        let t = Constant::Tuple(vec![Constant::Str("a".into()), Constant::None]);
        assert_eq!(t.repr(), "(\"a\", None)");
    }
}
