//! Malthusia compiler: orchestrates the full compilation pipeline.
//!
//! ```text
//! bundle text → Bundle → strip stub imports → Lexer → Parser → Codegen
//!             → Instrument → ProgramContainer → bytes (sha256-sealed)
//! ```

pub mod bundle;
pub mod container;
pub mod error;
pub mod pipeline;
pub mod stubs;

pub use bundle::{Bundle, BundleFile};
pub use container::{ProgramContainer, ENTRY_MODULE};
pub use error::{CompilerError, CompilerResult};
pub use pipeline::{compile_bundle, compile_bundle_text, compile_source, compile_to_result, CompileResult};
pub use stubs::strip_stub_imports;
