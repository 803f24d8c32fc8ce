//! Malthusia code generator and metering instrumentation.
//!
//! # Architecture
//!
//! ```text
//! AST ──compiler──▶ CodeUnit ──instrument──▶ CodeUnit ──persist──▶ bytes
//! ```
//!
//! A [`CodeUnit`] is an immutable program unit: an encoded instruction
//! stream of two-byte words, a deduplicated constant pool (nested function
//! bodies are `Constant::Code`), a name table, fast-local names, a line
//! table and the maximum operand-stack depth.
//!
//! All rewriting goes through the [`editor`]: the stream is decoded into
//! an [`InstrList`] whose jumps point at stable instruction ids, edited,
//! then re-assembled with offsets and `EXTENDED_ARG` widening computed to a
//! fixpoint.
//!
//! The [`instrument`] pass is the sandbox's first line of defence: after it
//! runs, every original instruction charges the budget before executing,
//! and no exception handler can observe a fatal condition.

pub mod compiler;
pub mod disasm;
pub mod editor;
pub mod error;
pub mod instrument;
pub mod linetable;
pub mod opcode;
pub mod persist;
pub mod unit;

pub use compiler::compile_module;
pub use disasm::disassemble;
pub use editor::{Instr, InstrId, InstrList, Origin};
pub use error::{CodegenError, CodegenResult, InstrumentError, InstrumentResult};
pub use instrument::{
    instrument, InstrumentOptions, CHECKPOINT_NAME, GUARDED_EXCEPTIONS, MULTIPLY_NAME,
    REDIRECT_NAME,
};
pub use opcode::{Comparison, Opcode};
pub use persist::{decode_unit, encode_unit};
pub use unit::{CodeUnit, Constant, UnitKind};
