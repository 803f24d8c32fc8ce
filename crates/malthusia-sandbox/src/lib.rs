//! Malthusia sandbox: runs instrumented robot programs under a budget.
//!
//! # Architecture
//!
//! ```text
//! ProgramContainer ──Session::builder──▶ Session ──run()──▶ Vm ──▶ Meter
//!                                                           │
//!                                   capability namespace ◀──┤
//!                                   policy checks ◀─────────┤
//!                                   host modules ◀──────────┘
//! ```
//!
//! The [`Vm`] executes compiled units. Instrumented code calls back into it
//! through three artifacts installed in the capability namespace: the
//! per-instruction checkpoint, the method-lookup redirect and the
//! multiply charge. Everything else a program can reach (builtins, value
//! methods, `math`, `random`, game methods) is listed explicitly; there is
//! no ambient authority to fall back on.
//!
//! Costs come from the closed [`cost`] table. Budget exhaustion, runaway
//! recursion, oversized materializations, host interrupts and VM invariant
//! violations are [`FatalKind`]s: they always unwind out of
//! [`Session::run`].

pub mod builtins;
pub mod cost;
pub mod error;
pub mod format;
pub mod hostmods;
pub mod imports;
pub mod memory;
pub mod meter;
pub mod methods;
pub mod ops;
pub mod policy;
pub mod rng;
pub mod session;
pub mod value;
pub mod vm;

pub use error::{
    ExcKind, Exception, FatalKind, RaiseError, SessionError, SessionResult, TraceEntry, VmResult,
};
pub use format::{repr, to_str};
pub use memory::bytes_usage;
pub use rng::RngStream;
pub use session::{RuntimeConfig, Session, SessionBuilder, Sink, TRACEBACK_LIMIT, TURN_FUNCTION};
pub use value::{Builtin, Module, TypeKind, Value};
pub use vm::{InterruptHandle, Vm};
