//! Automatic Differentiation Transformation
//!
//! AD is a compile-time transformation over MIR: every requested
//! `fwd_diff(f)` / `bwd_diff(f)` becomes a call to a derived function that
//! lives in the same module and is expressed in the same IR, so later
//! stages never need to know differentiation happened.
//!
//! Supported modes:
//! - Forward mode: propagate tangents alongside primals (`f_fwd_diff`)
//! - Reverse mode: replay the primal, then backpropagate adjoints (`f_bwd_diff`)
//!
//! # Example
//!
//! ```text
//! @differentiable
//! fn shade(albedo: float3, light: float3) -> float {
//!     sum(albedo * light)
//! }
//!
//! // The pass generates:
//! // - shade_fwd_diff(DiffPair<float3>, DiffPair<float3>) -> DiffPair<float>
//! // - shade_bwd_diff(DiffPair<float3>, DiffPair<float3>, float)
//! //       -> (DiffPair<float3>, DiffPair<float3>)
//! ```
//!
//! Pipeline per entry point: [`callgraph`] runs [`activity`] on every
//! function the entry point reaches and orders them callees first;
//! [`forward`] or [`reverse`] transform each; [`transform`] registers the
//! results and rewrites the call sites through [`pairing`]. Differential
//! types come from the module's [`witness::WitnessCache`].

pub mod activity;
pub mod callgraph;
pub mod diagnostics;
pub mod forward;
pub mod pairing;
pub mod reverse;
pub mod transform;
pub mod witness;

pub use activity::{ActivityAnalysis, ActivityResult, OpClass};
pub use callgraph::{build_worklist, WorkItem, Worklist};
pub use diagnostics::{
    CallSite, Diagnostic, DiagnosticKind, DiagnosticNote, DiagnosticSink, DiffError, Severity, SourceLocation,
};
pub use forward::ForwardModeTransform;
pub use reverse::ReverseModeTransform;
pub use transform::{ADConfig, ADMode, ADPassReport, ADStats, ADTransformer, DiffRequest};
pub use witness::{DifferentialWitness, WitnessCache, WitnessKind};
