//! DiffPair calling convention and call-site rewriting
//!
//! A differentiable parameter of type `T` travels as `DiffPair<T, D(T)>`.
//! Derived functions get deterministic names:
//!
//! ```text
//! f_fwd_diff(DiffPair<X0>, .., Xk) -> DiffPair<Y>
//! f_bwd_diff(DiffPair<X0>, .., Xk, d_out: D(Y)) -> (DiffPair<X0>, ..)
//! ```
//!
//! Non-differentiable parameters (ints, resources, `no_diff` structs) are
//! passed unchanged. The backward function returns one pair per
//! differentiable parameter, carrying the primal and its gradient.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use log::debug;

use super::diagnostics::{CallSite, DiffError, SourceLocation};
use super::transform::ADMode;
use super::witness::DifferentialWitness;
use crate::mir::function::{FunctionSignature, MirFunction};
use crate::mir::inst::{Callee, Operation};
use crate::mir::module::MirModule;
use crate::mir::types::MirType;

pub fn fwd_name(function: &str) -> String {
    format!("{}_fwd_diff", function)
}

pub fn bwd_name(function: &str) -> String {
    format!("{}_bwd_diff", function)
}

/// User-supplied derivative for a mode, if any
pub fn custom_derivative(func: &MirFunction, mode: ADMode) -> Option<&str> {
    match mode {
        ADMode::Forward => func.attributes.custom_fwd.as_deref(),
        ADMode::Reverse => func.attributes.custom_bwd.as_deref(),
    }
}

/// Name under which the derivative of `function` is registered
pub fn derived_name(module: &MirModule, function: &str, mode: ADMode) -> String {
    if let Some(custom) = module
        .get_function(function)
        .and_then(|f| custom_derivative(f, mode))
    {
        return custom.to_string();
    }
    match mode {
        ADMode::Forward => fwd_name(function),
        ADMode::Reverse => bwd_name(function),
    }
}

/// Witness-table key under which a requirement's derivative is registered
pub fn requirement_key(requirement: &str, mode: ADMode) -> String {
    match mode {
        ADMode::Forward => format!("{}.fwd_diff", requirement),
        ADMode::Reverse => format!("{}.bwd_diff", requirement),
    }
}

/// `DiffPair<T, D(T)>` for differentiable types, `T` otherwise
pub fn pair_type(ty: &MirType, witness: Option<&DifferentialWitness>) -> MirType {
    match witness {
        Some(w) => MirType::pair(ty.clone(), w.differential.clone()),
        None => ty.clone(),
    }
}

/// Does this function carry a derivative for `mode`, either by marker or by
/// a user-supplied derivative
pub fn supports_mode(func: &MirFunction, mode: ADMode) -> bool {
    if custom_derivative(func, mode).is_some() {
        return true;
    }
    match (func.attributes.differentiable, mode) {
        (Some(m), ADMode::Forward) => m.allows_forward(),
        (Some(m), ADMode::Reverse) => m.allows_reverse(),
        (None, _) => false,
    }
}

/// Functions a call may reach. Dynamic calls reach every implementation of
/// the requirement in tables for the interface.
pub fn callee_targets(module: &MirModule, callee: &Callee) -> Vec<String> {
    match callee {
        Callee::Direct(name) => vec![name.clone()],
        Callee::Witness { table, requirement } => module
            .get_witness_table(table)
            .and_then(|t| t.lookup(requirement))
            .map(|f| vec![f.to_string()])
            .unwrap_or_default(),
        Callee::Dynamic {
            interface,
            requirement,
            ..
        } => {
            let mut targets: Vec<String> = module
                .tables_for_interface(interface)
                .filter_map(|t| t.lookup(requirement))
                .map(str::to_string)
                .collect();
            targets.dedup();
            targets
        }
    }
}

/// Witnesses of a function's parameters and return type
#[derive(Clone, Debug)]
pub struct SignatureWitnesses {
    pub params: Vec<Option<Arc<DifferentialWitness>>>,
    pub ret: Option<Arc<DifferentialWitness>>,
}

impl SignatureWitnesses {
    pub fn resolve(
        func: &MirFunction,
        module: &MirModule,
        max_depth: usize,
    ) -> Result<Self, DiffError> {
        let loc = || SourceLocation::new(&func.name, func.span);
        let cache = &module.witness_cache;
        let params = func
            .signature
            .params
            .iter()
            .map(|ty| cache.synthesize(ty, module, max_depth).map_err(|e| e.at(loc())))
            .collect::<Result<Vec<_>, _>>()?;
        let ret = cache
            .synthesize(&func.signature.return_type, module, max_depth)
            .map_err(|e| e.at(loc()))?;
        Ok(Self { params, ret })
    }

    pub fn is_differentiable(&self, param: usize) -> bool {
        self.params.get(param).map_or(false, |w| w.is_some())
    }
}

pub fn forward_signature(func: &MirFunction, sw: &SignatureWitnesses) -> FunctionSignature {
    let params = func
        .signature
        .params
        .iter()
        .zip(&sw.params)
        .map(|(ty, w)| pair_type(ty, w.as_deref()))
        .collect();
    let ret = pair_type(&func.signature.return_type, sw.ret.as_deref());
    FunctionSignature::new(params, ret).with_names(
        func.signature
            .param_names
            .iter()
            .zip(&sw.params)
            .map(|(n, w)| if w.is_some() { format!("dp_{}", n) } else { n.clone() })
            .collect(),
    )
}

pub fn reverse_signature(func: &MirFunction, sw: &SignatureWitnesses) -> FunctionSignature {
    let mut params: Vec<MirType> = func
        .signature
        .params
        .iter()
        .zip(&sw.params)
        .map(|(ty, w)| pair_type(ty, w.as_deref()))
        .collect();
    let mut names: Vec<String> = func
        .signature
        .param_names
        .iter()
        .zip(&sw.params)
        .map(|(n, w)| if w.is_some() { format!("dp_{}", n) } else { n.clone() })
        .collect();
    if let Some(r) = &sw.ret {
        params.push(r.differential.clone());
        names.push("d_out".to_string());
    }
    FunctionSignature::new(params, reverse_result_type(func, sw)).with_names(names)
}

/// `(DiffPair<Xi, D(Xi)>, ..)` over the differentiable parameters
pub fn reverse_result_type(func: &MirFunction, sw: &SignatureWitnesses) -> MirType {
    MirType::tuple(
        func.signature
            .params
            .iter()
            .zip(&sw.params)
            .filter_map(|(ty, w)| w.as_deref().map(|w| pair_type(ty, Some(w))))
            .collect(),
    )
}

/// `fwd_diff`/`bwd_diff` sites in the module, first site per request
pub fn call_site_requests(module: &MirModule) -> BTreeMap<(String, ADMode), CallSite> {
    let mut requests = BTreeMap::new();
    for func in &module.functions {
        for block in &func.blocks {
            for inst in &block.instructions {
                let (function, mode) = match &inst.op {
                    Operation::FwdDiff { function, .. } => (function, ADMode::Forward),
                    Operation::BwdDiff { function, .. } => (function, ADMode::Reverse),
                    _ => continue,
                };
                requests
                    .entry((function.clone(), mode))
                    .or_insert_with(|| CallSite::new(&func.name, function, inst.span));
            }
        }
    }
    requests
}

/// Replace resolved `fwd_diff`/`bwd_diff` operators with direct calls.
/// Returns the number of rewritten sites.
pub fn rewrite_call_sites(
    module: &mut MirModule,
    resolved: &HashMap<(String, ADMode), String>,
) -> usize {
    let mut rewritten = 0;
    for func in &mut module.functions {
        for block in &mut func.blocks {
            for inst in &mut block.instructions {
                let key = match &inst.op {
                    Operation::FwdDiff { function, .. } => (function.clone(), ADMode::Forward),
                    Operation::BwdDiff { function, .. } => (function.clone(), ADMode::Reverse),
                    _ => continue,
                };
                let Some(target) = resolved.get(&key) else {
                    continue;
                };
                let args = match &inst.op {
                    Operation::FwdDiff { args, .. } | Operation::BwdDiff { args, .. } => args.clone(),
                    _ => continue,
                };
                debug!("rewriting {}({}) in {} -> {}", inst.op.name(), key.0, func.name, target);
                inst.op = Operation::Call {
                    callee: Callee::Direct(target.clone()),
                    args,
                    ret_ty: inst.ty.clone(),
                    no_diff: false,
                };
                rewritten += 1;
            }
        }
    }
    rewritten
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::block::Terminator;
    use crate::mir::function::DiffMode;
    use crate::mir::module::{ModuleBuilder, WitnessTable};

    fn sample() -> MirModule {
        let mut mb = ModuleBuilder::new("t");
        mb.differentiable(
            "scale",
            DiffMode::Both,
            FunctionSignature::new(vec![MirType::F32, MirType::I32], MirType::F32)
                .with_names(vec!["x".into(), "n".into()]),
            |f| {
                let x = f.param(0).unwrap();
                f.terminate(Terminator::Return { value: Some(x) });
            },
        );
        mb.function(
            "main",
            FunctionSignature::new(vec![MirType::pair(MirType::F32, MirType::F32)], MirType::pair(MirType::F32, MirType::F32)),
            |f| {
                let p = f.param(0).unwrap();
                let n = f.const_int(2);
                let r = f.push_op(
                    Operation::FwdDiff {
                        function: "scale".into(),
                        args: vec![p, n],
                    },
                    MirType::pair(MirType::F32, MirType::F32),
                );
                f.terminate(Terminator::Return { value: Some(r) });
            },
        );
        mb.witness_table(WitnessTable::new("A_I", "I").with_entry("eval", "a"));
        mb.witness_table(WitnessTable::new("B_I", "I").with_entry("eval", "b"));
        mb.build()
    }

    #[test]
    fn test_derived_signatures() {
        let module = sample();
        let f = module.get_function("scale").unwrap();
        let sw = SignatureWitnesses::resolve(f, &module, 64).unwrap();
        assert!(sw.is_differentiable(0));
        assert!(!sw.is_differentiable(1));

        let fwd = forward_signature(f, &sw);
        assert_eq!(fwd.params[0], MirType::pair(MirType::F32, MirType::F32));
        assert_eq!(fwd.params[1], MirType::I32);
        assert_eq!(fwd.param_names[0], "dp_x");
        assert_eq!(fwd.return_type, MirType::pair(MirType::F32, MirType::F32));

        let bwd = reverse_signature(f, &sw);
        assert_eq!(bwd.params.len(), 3);
        assert_eq!(bwd.param_names[2], "d_out");
        assert_eq!(
            bwd.return_type,
            MirType::tuple(vec![MirType::pair(MirType::F32, MirType::F32)])
        );
    }

    #[test]
    fn test_names_and_custom_override() {
        let mut module = sample();
        assert_eq!(derived_name(&module, "scale", ADMode::Forward), "scale_fwd_diff");
        if let Some(f) = module.get_function_mut("scale") {
            f.attributes.custom_bwd = Some("scale_grad".into());
        }
        assert_eq!(derived_name(&module, "scale", ADMode::Reverse), "scale_grad");
        assert_eq!(requirement_key("eval", ADMode::Reverse), "eval.bwd_diff");
    }

    #[test]
    fn test_dynamic_targets() {
        let module = sample();
        let callee = Callee::Dynamic {
            witness: crate::mir::value::ValueId(0),
            interface: "I".into(),
            requirement: "eval".into(),
        };
        assert_eq!(callee_targets(&module, &callee), vec!["a", "b"]);
    }

    #[test]
    fn test_rewrite_call_sites() {
        let mut module = sample();
        let requests = call_site_requests(&module);
        let site = &requests[&("scale".to_string(), ADMode::Forward)];
        assert_eq!(site.caller, "main");

        let mut resolved = HashMap::new();
        resolved.insert(("scale".to_string(), ADMode::Forward), "scale_fwd_diff".to_string());
        assert_eq!(rewrite_call_sites(&mut module, &resolved), 1);
        assert!(call_site_requests(&module).is_empty());

        let main = module.get_function("main").unwrap();
        assert!(matches!(
            &main.blocks[0].instructions[1].op,
            Operation::Call { callee: Callee::Direct(name), .. } if name == "scale_fwd_diff"
        ));
    }
}
