//! AD Transformation Entry Point
//!
//! Drives the whole pass over a module: collects `fwd_diff`/`bwd_diff`
//! requests, builds one worklist per requested entry point, transforms every
//! function on it, registers the results and finally rewrites the call sites.
//!
//! # Usage
//!
//! ```text
//! let report = ADTransformer::new(ADConfig::default()).run(&mut module);
//! if report.diagnostics.has_errors() { ... }
//! ```
//!
//! Entry points are independent: each one works on its own reachable
//! subgraph and only shares the module's witness cache, so they run on
//! scoped worker threads when `parallel` is set. A failing entry point is
//! reported and dropped; the others still register.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::time::Instant;

use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};

use super::callgraph::{build_worklist, Worklist};
use super::diagnostics::{CallSite, Diagnostic, DiagnosticKind, DiagnosticSink, DiffError, SourceLocation};
use super::forward::ForwardModeTransform;
use super::pairing::{call_site_requests, derived_name, requirement_key, rewrite_call_sites, supports_mode};
use super::reverse::ReverseModeTransform;
use crate::mir::function::MirFunction;
use crate::mir::inst::Operation;
use crate::mir::module::MirModule;

/// AD computation mode
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ADMode {
    /// Forward mode: propagate tangents alongside primals
    Forward,

    /// Reverse mode: backpropagate adjoints from the output to the inputs
    Reverse,
}

impl fmt::Display for ADMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ADMode::Forward => write!(f, "fwd_diff"),
            ADMode::Reverse => write!(f, "bwd_diff"),
        }
    }
}

/// A differentiation requested outside the IR, e.g. by the driver
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffRequest {
    pub function: String,
    pub mode: ADMode,
}

impl DiffRequest {
    pub fn new(function: &str, mode: ADMode) -> Self {
        Self {
            function: function.to_string(),
            mode,
        }
    }
}

/// Configuration for AD transformation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ADConfig {
    /// Longest call chain (and deepest type nesting) the pass expands
    pub max_depth: usize,

    /// Transform independent entry points on worker threads
    pub parallel: bool,

    /// Report calls that receive varying arguments but have no derivative
    pub warn_nondiff_calls: bool,

    /// Run `MirFunction::validate` on every derived function
    pub validate_output: bool,

    /// Requests in addition to the module's `fwd_diff`/`bwd_diff` sites
    pub requests: Vec<DiffRequest>,
}

impl Default for ADConfig {
    fn default() -> Self {
        Self {
            max_depth: 64,
            parallel: true,
            warn_nondiff_calls: true,
            validate_output: true,
            requests: Vec::new(),
        }
    }
}

impl ADConfig {
    /// Parse a driver-supplied JSON config; missing keys take defaults
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

/// Statistics collected during one pass run
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ADStats {
    /// Requested (function, mode) entry points
    pub entry_points: usize,

    /// Entry points that failed and were dropped
    pub failed_entry_points: usize,

    /// Derived functions added to the module
    pub functions_transformed: usize,

    /// Instructions in the source functions that were transformed
    pub original_instructions: usize,

    /// Instructions in the derived functions
    pub transformed_instructions: usize,

    /// Active values across all transformed functions
    pub active_values: usize,

    /// `CheckpointPush` sites emitted into reverse-mode functions
    pub checkpoint_sites: usize,

    /// Witness helpers (`zero`/`add`) registered
    pub witness_helpers: usize,

    /// `fwd_diff`/`bwd_diff` sites rewritten into calls
    pub call_sites_rewritten: usize,

    /// Wall time of the transform phase (microseconds)
    pub transform_time_us: u64,
}

/// Outcome of a pass run
#[derive(Clone, Debug, Default)]
pub struct ADPassReport {
    pub diagnostics: DiagnosticSink,

    /// Derived functions registered by this run, in registration order
    pub registered: Vec<String>,

    /// Requests that resolved to a derivative function
    pub resolved: BTreeMap<(String, ADMode), String>,

    pub stats: ADStats,
}

impl ADPassReport {
    pub fn is_ok(&self) -> bool {
        !self.diagnostics.has_errors()
    }

    /// Derivative registered for a request, if it succeeded
    pub fn derivative_of(&self, function: &str, mode: ADMode) -> Option<&str> {
        self.resolved
            .get(&(function.to_string(), mode))
            .map(String::as_str)
    }
}

/// Everything one entry point produced
struct EntryOutcome {
    entry: String,
    mode: ADMode,
    functions: Vec<MirFunction>,
    warnings: Vec<Diagnostic>,
    error: Option<Diagnostic>,
    original_instructions: usize,
    active_values: usize,
}

impl EntryOutcome {
    fn new(entry: &str, mode: ADMode) -> Self {
        Self {
            entry: entry.to_string(),
            mode,
            functions: Vec::new(),
            warnings: Vec::new(),
            error: None,
            original_instructions: 0,
            active_values: 0,
        }
    }
}

/// Main AD transformer
pub struct ADTransformer {
    /// Configuration
    config: ADConfig,
}

impl ADTransformer {
    /// Create a new AD transformer with the given configuration
    pub fn new(config: ADConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ADConfig {
        &self.config
    }

    /// Every requested (function, mode), with the site that asked for it
    fn collect_requests(&self, module: &MirModule) -> BTreeMap<(String, ADMode), CallSite> {
        let mut requests = call_site_requests(module);
        for req in &self.config.requests {
            requests
                .entry((req.function.clone(), req.mode))
                .or_insert_with(|| CallSite::new("<config>", &req.function, None));
        }
        requests
    }

    /// Run the pass over `module`, extending it in place
    pub fn run(&self, module: &mut MirModule) -> ADPassReport {
        let mut report = ADPassReport::default();
        let requests = self.collect_requests(module);
        report.stats.entry_points = requests.len();
        if requests.is_empty() {
            debug!("{}: no differentiation requests", module.name);
            return report;
        }
        info!(
            "{}: differentiating {} entry point(s){}",
            module.name,
            requests.len(),
            if self.config.parallel { " in parallel" } else { "" }
        );

        let started = Instant::now();
        let outcomes = {
            let shared: &MirModule = module;
            if self.config.parallel && requests.len() > 1 {
                self.run_parallel(shared, &requests)
            } else {
                requests
                    .iter()
                    .map(|((f, mode), site)| self.differentiate_entry(shared, f, *mode, site.clone()))
                    .collect()
            }
        };
        report.stats.transform_time_us = started.elapsed().as_micros() as u64;

        self.register(module, outcomes, &mut report);

        report.stats.call_sites_rewritten = rewrite_call_sites(module, &resolved_map(&report));
        info!(
            "{}: registered {} derived function(s), {} error(s)",
            module.name,
            report.registered.len(),
            report.diagnostics.errors().count()
        );
        report
    }

    fn run_parallel(
        &self,
        module: &MirModule,
        requests: &BTreeMap<(String, ADMode), CallSite>,
    ) -> Vec<EntryOutcome> {
        std::thread::scope(|scope| {
            let handles: Vec<_> = requests
                .iter()
                .map(|((f, mode), site)| {
                    let handle = scope.spawn(move || self.differentiate_entry(module, f, *mode, site.clone()));
                    (f, *mode, handle)
                })
                .collect();

            handles
                .into_iter()
                .map(|(f, mode, handle)| {
                    handle.join().unwrap_or_else(|_| {
                        let mut outcome = EntryOutcome::new(f, mode);
                        outcome.error = Some(Diagnostic::from_error(&DiffError::Internal(format!(
                            "worker differentiating `{}` panicked",
                            f
                        ))));
                        outcome
                    })
                })
                .collect()
        })
    }

    /// Build the worklist of one entry point and transform every item on it
    fn differentiate_entry(&self, module: &MirModule, entry: &str, mode: ADMode, site: CallSite) -> EntryOutcome {
        let mut outcome = EntryOutcome::new(entry, mode);
        let worklist: Worklist = match build_worklist(module, site, mode, self.config.max_depth) {
            Ok(wl) => wl,
            Err(diag) => {
                outcome.error = Some(diag);
                return outcome;
            }
        };
        debug!("{} {}: {} function(s) to transform", mode, entry, worklist.items.len());
        outcome.warnings = worklist.warnings;

        for item in &worklist.items {
            let Some(source) = module.get_function(&item.function) else {
                outcome.error = Some(
                    Diagnostic::from_error(&DiffError::Internal(format!("`{}` vanished", item.function)))
                        .with_call_chain(&item.chain),
                );
                return outcome;
            };
            trace!("{} {}: transforming {}", mode, entry, source.name);
            let result = match mode {
                ADMode::Forward => {
                    ForwardModeTransform::new(source, module, &item.activity, self.config.max_depth).transform()
                }
                ADMode::Reverse => {
                    ReverseModeTransform::new(source, module, &item.activity, self.config.max_depth).transform()
                }
            };
            let derived = match result {
                Ok(f) => f,
                Err(e) => {
                    let here = SourceLocation::new(&source.name, source.span);
                    let mut diag = Diagnostic::from_error(&e.at(here.clone()));
                    diag.primary.get_or_insert(here);
                    outcome.error = Some(diag.with_definition(module).with_call_chain(&item.chain));
                    return outcome;
                }
            };
            if self.config.validate_output {
                if let Err(e) = derived.validate() {
                    let err = DiffError::Internal(format!("derived `{}` is malformed: {}", derived.name, e));
                    outcome.error = Some(Diagnostic::from_error(&err).with_call_chain(&item.chain));
                    return outcome;
                }
            }
            outcome.original_instructions += instruction_count(source);
            outcome.active_values += item.activity.active.len();
            outcome.functions.push(derived);
        }
        outcome
    }

    /// Add the outcomes to the module in request order
    fn register(&self, module: &mut MirModule, outcomes: Vec<EntryOutcome>, report: &mut ADPassReport) {
        for outcome in outcomes {
            let warnings = outcome
                .warnings
                .into_iter()
                .filter(|w| self.config.warn_nondiff_calls || w.kind != DiagnosticKind::NonDifferentiableCall);
            report.diagnostics.extend(warnings);

            if let Some(err) = outcome.error {
                warn!("{} of `{}` failed: {}", outcome.mode, outcome.entry, err.message);
                report.stats.failed_entry_points += 1;
                report.diagnostics.push(err);
                continue;
            }

            report.stats.original_instructions += outcome.original_instructions;
            report.stats.active_values += outcome.active_values;
            for func in outcome.functions {
                if module.has_function(&func.name) {
                    trace!("{} already registered", func.name);
                    continue;
                }
                report.stats.functions_transformed += 1;
                report.stats.transformed_instructions += instruction_count(&func);
                report.stats.checkpoint_sites += count_ops(&func, |op| matches!(op, Operation::CheckpointPush { .. }));
                report.registered.push(func.name.clone());
                module.add_function(func);
            }

            let target = derived_name(module, &outcome.entry, outcome.mode);
            if module.has_function(&target) {
                report.resolved.insert((outcome.entry, outcome.mode), target);
            } else {
                report.diagnostics.push(Diagnostic::from_error(&DiffError::Internal(format!(
                    "derivative `{}` of `{}` is not defined",
                    target, outcome.entry
                ))));
                report.stats.failed_entry_points += 1;
            }
        }

        // types and helpers the witnesses refer to
        for ty in module.witness_cache.derived_types() {
            if module.get_type(&ty.name).is_none() {
                module.add_type(ty);
            }
        }
        for helper in module.witness_cache.helper_functions() {
            if !module.has_function(&helper.name) {
                report.stats.witness_helpers += 1;
                module.add_function(helper);
            }
        }

        register_table_entries(module);
    }
}

/// Add `req.fwd_diff` / `req.bwd_diff` entries for every table whose
/// implementation now has a derivative, so dynamic dispatch can find it
fn register_table_entries(module: &mut MirModule) {
    let mut additions = Vec::new();
    for table in &module.witness_tables {
        for (requirement, function) in &table.entries {
            let Some(func) = module.get_function(function) else {
                continue;
            };
            for mode in [ADMode::Forward, ADMode::Reverse] {
                let key = requirement_key(requirement, mode);
                if table.entries.contains_key(&key) || !supports_mode(func, mode) {
                    continue;
                }
                let target = derived_name(module, function, mode);
                if module.has_function(&target) {
                    additions.push((table.name.clone(), key, target));
                }
            }
        }
    }
    let mut seen = HashSet::new();
    for (table, key, target) in additions {
        if !seen.insert((table.clone(), key.clone())) {
            continue;
        }
        if let Some(t) = module.get_witness_table_mut(&table) {
            trace!("{}: {} -> {}", table, key, target);
            t.entries.insert(key, target);
        }
    }
}

fn instruction_count(func: &MirFunction) -> usize {
    func.blocks.iter().map(|b| b.instructions.len()).sum()
}

fn count_ops(func: &MirFunction, pred: impl Fn(&Operation) -> bool) -> usize {
    func.blocks
        .iter()
        .flat_map(|b| &b.instructions)
        .filter(|i| pred(&i.op))
        .count()
}

/// Convenience for drivers that only need the derivative names
pub fn resolved_map(report: &ADPassReport) -> HashMap<(String, ADMode), String> {
    report.resolved.clone().into_iter().collect()
}
