//! Verifier reporting — structured gate results and classified failures.
//!
//! A stage (build, lint, test, review) runs its own gate and records the
//! outcome here; this module only shapes and aggregates the report, it
//! does not run the gates itself.
//!
//! # Error classification
//!
//! Failures are classified into categories using rustc JSON output (no
//! LLM involved): borrow checker (E0502, E0505, E0382), lifetimes
//! (E0106, E0495, E0621), trait bounds (E0277, E0599), type mismatch
//! (E0308, E0271), async/Send, module/visibility (E0603, E0412), macros.

pub mod report;

pub use report::{FailureSignal, GateOutcome, GateResult, VerifierReport};
