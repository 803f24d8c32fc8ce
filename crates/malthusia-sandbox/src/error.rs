//! Runtime error types.
//!
//! Three layers:
//! - [`ExcKind`] / [`Exception`]: exception values a program can raise and
//!   catch. Every exception type is built in; programs cannot declare new
//!   ones.
//! - [`FatalKind`]: the closed set of conditions that must always unwind to
//!   the caller of [`Session::run`](crate::Session::run). They are ordinary
//!   exception kinds inside the VM, installed only under `_`-prefixed names
//!   that programs cannot spell.
//! - [`SessionError`]: what a turn reports to the simulation.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::format::to_str;
use crate::value::Value;

// ══════════════════════════════════════════════════════════════════════════════
// Fatal Conditions
// ══════════════════════════════════════════════════════════════════════════════

/// Conditions that always propagate out of a session run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FatalKind {
    /// The budget counter reached zero.
    OutOfBudget,
    /// Call depth exceeded `max_call_depth`.
    RecursionError,
    /// A single materialization exceeded the element ceiling.
    MemoryError,
    /// The host set the interrupt flag.
    Interrupt,
    /// A VM invariant was violated.
    SystemError,
}

impl FatalKind {
    /// In the order the instrumentation pass guards them.
    pub const ALL: [FatalKind; 5] = [
        FatalKind::OutOfBudget,
        FatalKind::RecursionError,
        FatalKind::MemoryError,
        FatalKind::Interrupt,
        FatalKind::SystemError,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::OutOfBudget => "OutOfBudget",
            Self::RecursionError => "RecursionError",
            Self::MemoryError => "MemoryError",
            Self::Interrupt => "Interrupt",
            Self::SystemError => "SystemError",
        }
    }

    /// Name under which the type is installed in the capability namespace.
    pub fn internal_name(self) -> &'static str {
        match self {
            Self::OutOfBudget => "_OutOfBudget",
            Self::RecursionError => "_RecursionError",
            Self::MemoryError => "_MemoryError",
            Self::Interrupt => "_Interrupt",
            Self::SystemError => "_SystemError",
        }
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Exception Types
// ══════════════════════════════════════════════════════════════════════════════

/// Every exception type known to the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExcKind {
    BaseException,
    Exception,
    ArithmeticError,
    ZeroDivisionError,
    OverflowError,
    LookupError,
    IndexError,
    KeyError,
    TypeError,
    ValueError,
    NameError,
    AttributeError,
    ImportError,
    RuntimeError,
    NotImplementedError,
    AssertionError,
    StopIteration,
    SyntaxError,
    /// Raised by game methods for rule violations (moving twice, etc.).
    RobotError,
    /// Raised by game methods for invalid game queries.
    GameError,
    Fatal(FatalKind),
}

impl ExcKind {
    /// Types installed under their plain names.
    pub const ORDINARY: [ExcKind; 20] = [
        ExcKind::BaseException,
        ExcKind::Exception,
        ExcKind::ArithmeticError,
        ExcKind::ZeroDivisionError,
        ExcKind::OverflowError,
        ExcKind::LookupError,
        ExcKind::IndexError,
        ExcKind::KeyError,
        ExcKind::TypeError,
        ExcKind::ValueError,
        ExcKind::NameError,
        ExcKind::AttributeError,
        ExcKind::ImportError,
        ExcKind::RuntimeError,
        ExcKind::NotImplementedError,
        ExcKind::AssertionError,
        ExcKind::StopIteration,
        ExcKind::SyntaxError,
        ExcKind::RobotError,
        ExcKind::GameError,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::BaseException => "BaseException",
            Self::Exception => "Exception",
            Self::ArithmeticError => "ArithmeticError",
            Self::ZeroDivisionError => "ZeroDivisionError",
            Self::OverflowError => "OverflowError",
            Self::LookupError => "LookupError",
            Self::IndexError => "IndexError",
            Self::KeyError => "KeyError",
            Self::TypeError => "TypeError",
            Self::ValueError => "ValueError",
            Self::NameError => "NameError",
            Self::AttributeError => "AttributeError",
            Self::ImportError => "ImportError",
            Self::RuntimeError => "RuntimeError",
            Self::NotImplementedError => "NotImplementedError",
            Self::AssertionError => "AssertionError",
            Self::StopIteration => "StopIteration",
            Self::SyntaxError => "SyntaxError",
            Self::RobotError => "RobotError",
            Self::GameError => "GameError",
            Self::Fatal(kind) => kind.name(),
        }
    }

    /// Direct base type; `None` only for `BaseException`.
    pub fn base(self) -> Option<ExcKind> {
        Some(match self {
            Self::BaseException => return None,
            Self::Exception => Self::BaseException,
            Self::ZeroDivisionError | Self::OverflowError => Self::ArithmeticError,
            Self::IndexError | Self::KeyError => Self::LookupError,
            Self::NotImplementedError => Self::RuntimeError,
            Self::Fatal(FatalKind::RecursionError) => Self::RuntimeError,
            _ => Self::Exception,
        })
    }

    pub fn is_subclass_of(self, other: ExcKind) -> bool {
        let mut current = Some(self);
        while let Some(kind) = current {
            if kind == other {
                return true;
            }
            current = kind.base();
        }
        false
    }

    pub fn fatal(self) -> Option<FatalKind> {
        match self {
            Self::Fatal(kind) => Some(kind),
            _ => None,
        }
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Exception Values
// ══════════════════════════════════════════════════════════════════════════════

/// One frame of a traceback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    pub module: String,
    pub unit: String,
    pub line: u32,
}

/// A raised or constructed exception.
#[derive(Debug)]
pub struct Exception {
    pub kind: ExcKind,
    pub args: Vec<Value>,
    /// Frames the exception unwound through, innermost first.
    pub traceback: RefCell<Vec<TraceEntry>>,
}

impl Exception {
    pub fn new(kind: ExcKind, args: Vec<Value>) -> Self {
        Self {
            kind,
            args,
            traceback: RefCell::new(Vec::new()),
        }
    }

    pub fn message(&self) -> String {
        match self.args.as_slice() {
            [] => String::new(),
            [single] => to_str(single),
            many => to_str(&Value::tuple(many.to_vec())),
        }
    }

    /// Python-style report: the last `limit` frames, outermost first.
    pub fn render_traceback(&self, limit: usize) -> String {
        let frames = self.traceback.borrow();
        let mut out = String::from("Traceback (most recent call last):\n");
        for entry in frames.iter().take(limit).rev() {
            out.push_str(&format!(
                "  File \"{}\", line {}, in {}\n",
                entry.module, entry.line, entry.unit
            ));
        }
        out.push_str(&self.to_string());
        out
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = self.message();
        if message.is_empty() {
            f.write_str(self.kind.name())
        } else {
            write!(f, "{}: {}", self.kind.name(), message)
        }
    }
}

/// An exception unwinding through the VM.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct RaiseError(pub Rc<Exception>);

/// Result alias for VM operations.
pub type VmResult<T> = Result<T, RaiseError>;

macro_rules! raise_constructors {
    ($($fn_name:ident => $kind:ident,)*) => {
        impl RaiseError {
            $(
                pub fn $fn_name(message: impl Into<String>) -> Self {
                    Self::new(ExcKind::$kind, message)
                }
            )*
        }
    };
}

raise_constructors! {
    type_error => TypeError,
    value_error => ValueError,
    index_error => IndexError,
    name_error => NameError,
    attribute_error => AttributeError,
    import_error => ImportError,
    runtime_error => RuntimeError,
    zero_division => ZeroDivisionError,
    overflow => OverflowError,
}

impl RaiseError {
    pub fn new(kind: ExcKind, message: impl Into<String>) -> Self {
        let message: String = message.into();
        Self(Rc::new(Exception::new(kind, vec![Value::str(&message)])))
    }

    pub fn fatal(kind: FatalKind, message: impl Into<String>) -> Self {
        Self::new(ExcKind::Fatal(kind), message)
    }

    /// `KeyError` carries the missing key itself.
    pub fn key_error(key: Value) -> Self {
        Self(Rc::new(Exception::new(ExcKind::KeyError, vec![key])))
    }

    pub fn kind(&self) -> ExcKind {
        self.0.kind
    }

    pub fn fatal_kind(&self) -> Option<FatalKind> {
        self.0.kind.fatal()
    }

    pub fn exception(&self) -> &Rc<Exception> {
        &self.0
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Session Errors
// ══════════════════════════════════════════════════════════════════════════════

/// Failure of one [`Session::run`](crate::Session::run).
///
/// Everything except [`SessionError::MissingTurnFunction`] means the
/// session must be torn down.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("out of budget: {0}")]
    OutOfBudget(String),

    #[error(
        "out of memory: robot uses {used} bytes in round-persistent memory, more than the allowed {limit} bytes"
    )]
    MemoryLimit { used: usize, limit: usize },

    #[error("failed to initialize robot: {0}")]
    InitFailed(String),

    #[error("couldn't find turn function")]
    MissingTurnFunction,

    #[error("session has been killed")]
    Killed,

    #[error("fatal {}: {message}", kind.name())]
    Fatal { kind: FatalKind, message: String },
}

impl SessionError {
    pub(crate) fn from_fatal(err: &RaiseError) -> Self {
        let message = err.exception().message();
        match err.fatal_kind() {
            Some(FatalKind::OutOfBudget) => Self::OutOfBudget(message),
            Some(kind) => Self::Fatal { kind, message },
            None => Self::Fatal {
                kind: FatalKind::SystemError,
                message: err.to_string(),
            },
        }
    }

    /// Whether the session may keep running after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::MissingTurnFunction)
    }
}

/// Result alias for session operations.
pub type SessionResult<T> = Result<T, SessionError>;
