//! Compilation feedback — run verifiers, classify errors by category.
//!
//! Feeds the QA Loop Engine's repair step: a stage's raw failures are
//! parsed into [`ParsedError`] and classified into an [`ErrorCategory`]
//! before being handed to a coder runner's `fix_issues`.

pub mod compiler;
pub mod error_parser;

pub use compiler::{CargoOutput, CompileResult, Compiler};
pub use error_parser::{ErrorCategory, ErrorSummary, ParsedError, RustcErrorParser};
