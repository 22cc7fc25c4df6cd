//! shadediff: automatic differentiation for a shading-language compiler.
//!
//! The crate holds the compiler's mid-level IR ([`mir`]) and the pass that
//! extends a module with forward-mode (`fwd_diff`) and reverse-mode
//! (`bwd_diff`) derivatives of the functions requested from it. Parsing,
//! type checking and target emission live outside this crate; they build
//! the module this pass consumes and emit the module it produces.

pub mod mir;

pub use mir::ad::{ADConfig, ADMode, ADPassReport, ADTransformer, Diagnostic, DiagnosticKind, DiffRequest};
