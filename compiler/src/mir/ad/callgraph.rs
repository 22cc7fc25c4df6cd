//! Differentiation call graph
//!
//! Starting from one requested function, walks the active calls of every
//! function that must be transformed and orders them callees first. The
//! walk is an explicit stack with grey/black colouring, so deep call chains
//! cost heap, not host stack, and a grey re-entry is exactly a cycle.

use std::collections::HashMap;

use log::{debug, trace};

use super::activity::{ActivityAnalysis, ActivityResult};
use super::diagnostics::{CallSite, Diagnostic, DiffError, SourceLocation};
use super::pairing::{callee_targets, custom_derivative, supports_mode};
use super::transform::ADMode;
use crate::mir::function::MirFunction;
use crate::mir::module::MirModule;
use crate::mir::value::Span;

/// One function to transform, with the chain that made it necessary
#[derive(Clone, Debug)]
pub struct WorkItem {
    pub function: String,
    pub activity: ActivityResult,
    /// Request first, then each call down to this function
    pub chain: Vec<CallSite>,
}

/// Functions to transform for one entry point, callees first
#[derive(Clone, Debug)]
pub struct Worklist {
    pub entry: String,
    pub mode: ADMode,
    pub items: Vec<WorkItem>,
    pub warnings: Vec<Diagnostic>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Color {
    Grey,
    Black,
}

struct Frame {
    name: String,
    activity: ActivityResult,
    callees: Vec<(String, Option<Span>)>,
    next: usize,
}

/// Build the worklist for `request.callee` in `mode`
pub fn build_worklist(
    module: &MirModule,
    request: CallSite,
    mode: ADMode,
    max_depth: usize,
) -> Result<Worklist, Diagnostic> {
    let entry = request.callee.clone();
    let mut chain = vec![request];
    let fail = |err: DiffError, chain: &[CallSite]| {
        Diagnostic::from_error(&err)
            .with_definition(module)
            .with_call_chain(chain)
    };

    let mut worklist = Worklist {
        entry: entry.clone(),
        mode,
        items: Vec::new(),
        warnings: Vec::new(),
    };

    let request_loc = SourceLocation::new(&chain[0].caller, chain[0].span);
    let func = eligible(module, &entry, mode, request_loc).map_err(|e| fail(e, &chain))?;
    if custom_derivative(func, mode).is_some() {
        debug!("{} has a user-supplied derivative, nothing to transform", entry);
        return Ok(worklist);
    }

    let mut colors: HashMap<String, Color> = HashMap::new();
    let mut stack: Vec<Frame> = Vec::new();

    let activity = analyze(module, &entry, mode, max_depth).map_err(|e| fail(e, &chain))?;
    colors.insert(entry.clone(), Color::Grey);
    stack.push(frame(module, &entry, activity));

    while let Some(top) = stack.last_mut() {
        if top.next >= top.callees.len() {
            let Some(done) = stack.pop() else { break };
            colors.insert(done.name.clone(), Color::Black);
            trace!("worklist {}: {} ready", entry, done.name);
            worklist.warnings.extend(done.activity.warnings.iter().cloned());
            worklist.items.push(WorkItem {
                function: done.name,
                activity: done.activity,
                chain: chain.clone(),
            });
            chain.pop();
            continue;
        }

        let (callee, span) = top.callees[top.next].clone();
        top.next += 1;
        let caller = top.name.clone();
        let site_loc = SourceLocation::new(&caller, span);

        match colors.get(&callee) {
            Some(Color::Black) => continue,
            Some(Color::Grey) => {
                let start = stack.iter().position(|f| f.name == callee).unwrap_or(0);
                let mut cycle: Vec<String> = stack[start..].iter().map(|f| f.name.clone()).collect();
                cycle.push(callee.clone());
                chain.push(CallSite::new(&caller, &callee, span));
                return Err(fail(
                    DiffError::RecursionUnsupported {
                        cycle,
                        location: site_loc,
                    },
                    &chain,
                ));
            }
            None => {}
        }

        chain.push(CallSite::new(&caller, &callee, span));
        if stack.len() >= max_depth {
            return Err(fail(
                DiffError::ExpansionTooDeep {
                    limit: max_depth,
                    at: callee,
                    location: Some(site_loc),
                },
                &chain,
            ));
        }

        let func = eligible(module, &callee, mode, site_loc).map_err(|e| fail(e, &chain))?;
        if custom_derivative(func, mode).is_some() {
            colors.insert(callee, Color::Black);
            chain.pop();
            continue;
        }

        let activity = analyze(module, &callee, mode, max_depth).map_err(|e| fail(e, &chain))?;
        colors.insert(callee.clone(), Color::Grey);
        stack.push(frame(module, &callee, activity));
    }

    debug!(
        "worklist for {} ({:?}): {}",
        entry,
        mode,
        worklist
            .items
            .iter()
            .map(|i| i.function.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(worklist)
}

fn eligible<'m>(
    module: &'m MirModule,
    name: &str,
    mode: ADMode,
    location: SourceLocation,
) -> Result<&'m MirFunction, DiffError> {
    let func = module.get_function(name).ok_or_else(|| DiffError::NonDifferentiableOperation {
        op: format!("call to undefined function `{}`", name),
        location: location.clone(),
    })?;
    if !supports_mode(func, mode) {
        let what = match mode {
            ADMode::Forward => "forward",
            ADMode::Reverse => "backward",
        };
        return Err(DiffError::NonDifferentiableOperation {
            op: format!("call to `{}`, which is not marked {}-differentiable", name, what),
            location,
        });
    }
    if func.is_declaration() && custom_derivative(func, mode).is_none() {
        return Err(DiffError::NonDifferentiableOperation {
            op: format!("call to `{}`, which has no body to differentiate", name),
            location,
        });
    }
    Ok(func)
}

fn analyze(
    module: &MirModule,
    name: &str,
    mode: ADMode,
    max_depth: usize,
) -> Result<ActivityResult, DiffError> {
    let func = module
        .get_function(name)
        .ok_or_else(|| DiffError::Internal(format!("function `{}` vanished", name)))?;
    ActivityAnalysis::new(func, module, mode, max_depth).analyze()
}

fn frame(module: &MirModule, name: &str, activity: ActivityResult) -> Frame {
    let mut callees = Vec::new();
    for (callee, span) in &activity.active_calls {
        for target in callee_targets(module, callee) {
            callees.push((target, *span));
        }
    }
    Frame {
        name: name.to_string(),
        activity,
        callees,
        next: 0,
    }
}
