//! Activity Analysis for Automatic Differentiation
//!
//! Determines which values are "active" - meaning they:
//! 1. Depend on differentiable parameters (varying sweep)
//! 2. Affect the returned value through derivative-carrying paths (useful sweep)
//!
//! A value is active iff it's in both sets (varying ∩ useful). Validation is
//! demand-driven: an operation without a derivative rule is only an error
//! when it actually sits on an active path.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::trace;

use super::diagnostics::{Diagnostic, DiagnosticKind, DiffError, SourceLocation};
use super::pairing::{callee_targets, supports_mode, SignatureWitnesses};
use super::transform::ADMode;
use super::witness::{DifferentialWitness, DropReason, WitnessKind};
use crate::mir::block::Terminator;
use crate::mir::function::MirFunction;
use crate::mir::inst::{Callee, Instruction, Operation};
use crate::mir::module::MirModule;
use crate::mir::types::MirType;
use crate::mir::value::{Span, ValueId};

/// How an operation contributes to derivatives
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpClass {
    /// Contributes additively; no primal values needed
    Linear,
    /// Local derivative depends on checkpointed primal operands
    Nonlinear,
    /// Branches and switches
    Control,
    /// No derivative rule
    Opaque,
    /// Result carries no differential
    Constant,
}

/// Classify an operation for differentiation in `mode`
pub fn classify(op: &Operation, module: &MirModule, mode: ADMode) -> OpClass {
    match op {
        Operation::FAdd { .. }
        | Operation::FSub { .. }
        | Operation::FNeg { .. }
        | Operation::Aggregate { .. }
        | Operation::ExtractField { .. }
        | Operation::InsertField { .. }
        | Operation::Swizzle { .. }
        | Operation::Splat { .. }
        | Operation::Sum { .. }
        | Operation::FConvert { .. } => OpClass::Linear,

        Operation::FMul { .. }
        | Operation::FDiv { .. }
        | Operation::Sqrt { .. }
        | Operation::Exp { .. }
        | Operation::Log { .. }
        | Operation::Sin { .. }
        | Operation::Cos { .. }
        | Operation::Tanh { .. }
        | Operation::Pow { .. }
        | Operation::Abs { .. }
        | Operation::FMin { .. }
        | Operation::FMax { .. }
        | Operation::Select { .. }
        | Operation::ExtractElement { .. }
        | Operation::InsertElement { .. } => OpClass::Nonlinear,

        Operation::Call {
            callee, no_diff, ..
        } => {
            if !*no_diff && is_differentiable_call(module, callee, mode) {
                OpClass::Nonlinear
            } else {
                OpClass::Constant
            }
        }

        Operation::Bitcast { .. }
        | Operation::And { .. }
        | Operation::Or { .. }
        | Operation::Xor { .. }
        | Operation::Shl { .. }
        | Operation::LShr { .. }
        | Operation::VecShuffle { .. }
        | Operation::ResourceStore { .. }
        | Operation::LocalSet { .. }
        | Operation::CheckpointPush { .. }
        | Operation::FwdDiff { .. }
        | Operation::BwdDiff { .. } => OpClass::Opaque,

        Operation::ConstInt { .. }
        | Operation::ConstFloat { .. }
        | Operation::ConstBool { .. }
        | Operation::ZeroInit { .. }
        | Operation::WitnessRef { .. }
        | Operation::IAdd { .. }
        | Operation::ISub { .. }
        | Operation::IMul { .. }
        | Operation::ICmp { .. }
        | Operation::FCmp { .. }
        | Operation::Sign { .. }
        | Operation::Floor { .. }
        | Operation::SIToFP { .. }
        | Operation::FPToSI { .. }
        | Operation::MakePair { .. }
        | Operation::PairPrimal { .. }
        | Operation::PairDiff { .. }
        | Operation::ResourceLoad { .. }
        | Operation::LocalGet { .. }
        | Operation::CheckpointPop => OpClass::Constant,
    }
}

pub fn classify_terminator(term: &Terminator) -> OpClass {
    match term {
        Terminator::Branch { .. } | Terminator::Switch { .. } => OpClass::Control,
        Terminator::Goto { .. } | Terminator::Return { .. } => OpClass::Linear,
        Terminator::Unreachable => OpClass::Constant,
    }
}

/// A call is differentiable if any function it may reach carries a
/// derivative for the mode
pub fn is_differentiable_call(module: &MirModule, callee: &Callee, mode: ADMode) -> bool {
    callee_targets(module, callee)
        .iter()
        .filter_map(|name| module.get_function(name))
        .any(|f| supports_mode(f, mode))
}

/// Primal operands the pullback of an operation reads, in push order
pub fn checkpoint_operands(op: &Operation) -> Vec<ValueId> {
    let raw = match op {
        Operation::FMul { lhs, rhs }
        | Operation::FDiv { lhs, rhs }
        | Operation::FMin { lhs, rhs }
        | Operation::FMax { lhs, rhs }
        | Operation::Pow {
            base: lhs,
            exp: rhs,
        } => vec![*lhs, *rhs],

        Operation::Sqrt { operand }
        | Operation::Exp { operand }
        | Operation::Log { operand }
        | Operation::Sin { operand }
        | Operation::Cos { operand }
        | Operation::Tanh { operand }
        | Operation::Abs { operand } => vec![*operand],

        Operation::Select { cond, .. } => vec![*cond],
        Operation::ExtractElement { index, .. } | Operation::InsertElement { index, .. } => {
            vec![*index]
        }
        Operation::Call { .. } => op.operands(),
        _ => vec![],
    };

    let mut seen = HashSet::new();
    raw.into_iter().filter(|v| seen.insert(*v)).collect()
}

/// Result of activity analysis
#[derive(Clone, Debug)]
pub struct ActivityResult {
    /// Values that depend on differentiable parameters
    pub varying: HashSet<ValueId>,
    /// Values that affect the output through derivative-carrying operations
    pub useful: HashSet<ValueId>,
    /// varying ∩ useful
    pub active: HashSet<ValueId>,
    /// Witness of every active value's type
    pub witnesses: HashMap<ValueId, Arc<DifferentialWitness>>,
    /// Witnesses of the signature
    pub signature: SignatureWitnesses,
    /// Parameters with a differential in the derived signature
    pub diff_params: Vec<usize>,
    /// Parameters whose differential reaches the output
    pub active_params: Vec<usize>,
    /// Differentiable calls with an active result
    pub active_calls: Vec<(Callee, Option<Span>)>,
    pub warnings: Vec<Diagnostic>,
}

impl ActivityResult {
    pub fn is_active(&self, value: ValueId) -> bool {
        self.active.contains(&value)
    }

    pub fn witness(&self, value: ValueId) -> Option<&Arc<DifferentialWitness>> {
        self.witnesses.get(&value)
    }
}

/// Activity analyzer for AD
pub struct ActivityAnalysis<'a> {
    func: &'a MirFunction,
    module: &'a MirModule,
    mode: ADMode,
    max_depth: usize,
    types: HashMap<ValueId, MirType>,
    memo: HashMap<MirType, Option<Arc<DifferentialWitness>>>,
    /// Values whose type failed witness synthesis, reported only if useful
    blocked: HashMap<ValueId, DiffError>,
}

impl<'a> ActivityAnalysis<'a> {
    pub fn new(func: &'a MirFunction, module: &'a MirModule, mode: ADMode, max_depth: usize) -> Self {
        Self {
            func,
            module,
            mode,
            max_depth,
            types: func.value_types(),
            memo: HashMap::new(),
            blocked: HashMap::new(),
        }
    }

    /// Run activity analysis and validate every active path
    pub fn analyze(mut self) -> Result<ActivityResult, DiffError> {
        let signature = SignatureWitnesses::resolve(self.func, self.module, self.max_depth)?;
        let diff_params: Vec<usize> = (0..signature.params.len())
            .filter(|&i| signature.is_differentiable(i))
            .collect();

        let varying = self.varying_sweep(&diff_params)?;
        let useful = self.useful_sweep();
        let active: HashSet<ValueId> = varying.intersection(&useful).copied().collect();

        let mut result = ActivityResult {
            witnesses: HashMap::new(),
            active_params: Vec::new(),
            active_calls: Vec::new(),
            warnings: Vec::new(),
            diff_params,
            signature,
            varying,
            useful,
            active,
        };

        self.validate(&mut result)?;

        let params = self.func.param_values();
        result.active_params = result
            .diff_params
            .iter()
            .copied()
            .filter(|&i| params.get(i).map_or(false, |p| result.active.contains(p)))
            .collect();

        let mut active: Vec<ValueId> = result.active.iter().copied().collect();
        active.sort();
        for v in active {
            let ty = self.type_of(v)?;
            if let Some(w) = self.witness_for(&ty)? {
                result.witnesses.insert(v, w);
            }
        }

        trace!(
            "activity of {}: {} varying, {} useful, {} active",
            self.func.name,
            result.varying.len(),
            result.useful.len(),
            result.active.len()
        );
        Ok(result)
    }

    fn type_of(&self, value: ValueId) -> Result<MirType, DiffError> {
        self.types
            .get(&value)
            .cloned()
            .ok_or_else(|| DiffError::Internal(format!("{} has no type in {}", value, self.func.name)))
    }

    fn witness_for(&mut self, ty: &MirType) -> Result<Option<Arc<DifferentialWitness>>, DiffError> {
        if let Some(hit) = self.memo.get(ty) {
            return Ok(hit.clone());
        }
        let w = self
            .module
            .witness_cache
            .synthesize(ty, self.module, self.max_depth)?;
        self.memo.insert(ty.clone(), w.clone());
        Ok(w)
    }

    fn location(&self, span: Option<Span>) -> SourceLocation {
        SourceLocation::new(&self.func.name, span)
    }

    /// Forward sweep: mark values that depend on differentiable parameters
    fn varying_sweep(&mut self, diff_params: &[usize]) -> Result<HashSet<ValueId>, DiffError> {
        let mut varying = HashSet::new();
        let params = self.func.param_values();
        for &i in diff_params {
            if let Some(p) = params.get(i) {
                varying.insert(*p);
            }
        }

        let func = self.func;
        let mut changed = true;
        while changed {
            changed = false;

            for block in &func.blocks {
                for inst in &block.instructions {
                    let Some(result) = inst.result else {
                        continue;
                    };
                    if varying.contains(&result) || self.blocked.contains_key(&result) {
                        continue;
                    }
                    if self.propagates_varying(inst, result, &varying)? {
                        varying.insert(result);
                        changed = true;
                    }
                }

                for (succ, args) in block.terminator.edges() {
                    let Some(target) = func.block(succ) else {
                        continue;
                    };
                    for (param, arg) in target.params.iter().zip(args) {
                        if !varying.contains(arg) || varying.contains(&param.value) {
                            continue;
                        }
                        if self.accepts_differential(param.value, &param.ty, None)? {
                            varying.insert(param.value);
                            changed = true;
                        }
                    }
                }
            }
        }

        Ok(varying)
    }

    fn propagates_varying(
        &mut self,
        inst: &Instruction,
        result: ValueId,
        varying: &HashSet<ValueId>,
    ) -> Result<bool, DiffError> {
        let class = classify(&inst.op, self.module, self.mode);
        if matches!(class, OpClass::Constant | OpClass::Opaque) {
            return Ok(false);
        }
        if !inst.op.operands().iter().any(|v| varying.contains(v)) {
            return Ok(false);
        }

        match &inst.op {
            // a dropped field carries nothing out of or into the aggregate
            Operation::ExtractField { aggregate, index } => {
                let agg_ty = self.type_of(*aggregate)?;
                if self.is_dropped_field(&agg_ty, *index)? {
                    return Ok(false);
                }
            }
            Operation::InsertField {
                aggregate,
                index,
                value,
            } if !varying.contains(aggregate) && varying.contains(value) => {
                if self.is_dropped_field(&inst.ty, *index)? {
                    return Ok(false);
                }
            }
            _ => {}
        }

        self.accepts_differential(result, &inst.ty, inst.span)
    }

    /// Field `index` of `agg_ty` has no slot in the aggregate's differential
    fn is_dropped_field(&mut self, agg_ty: &MirType, index: usize) -> Result<bool, DiffError> {
        Ok(self
            .witness_for(agg_ty)?
            .and_then(|w| w.field_slot(index).map(|slot| slot.slot.is_none()))
            .unwrap_or(false))
    }

    /// Whether a value of this type can carry a differential. Witness
    /// failures are deferred until the value turns out to be useful.
    fn accepts_differential(
        &mut self,
        value: ValueId,
        ty: &MirType,
        span: Option<Span>,
    ) -> Result<bool, DiffError> {
        match self.witness_for(ty) {
            Ok(w) => Ok(w.is_some()),
            Err(DiffError::Internal(msg)) => Err(DiffError::Internal(msg)),
            Err(e) => {
                let loc = self.location(span);
                self.blocked.insert(value, e.at(loc));
                Ok(false)
            }
        }
    }

    /// Backward sweep: mark values that affect outputs
    fn useful_sweep(&mut self) -> HashSet<ValueId> {
        let func = self.func;
        let mut useful = HashSet::new();

        for block in &func.blocks {
            if let Terminator::Return { value: Some(v) } = &block.terminator {
                useful.insert(*v);
            }
            // stores and other effects are where opaque uses surface
            for inst in &block.instructions {
                if inst.result.is_none() && inst.op.has_side_effects() {
                    useful.extend(inst.op.operands());
                }
            }
        }

        let mut changed = true;
        while changed {
            changed = false;

            for block in func.blocks.iter().rev() {
                for (succ, args) in block.terminator.edges() {
                    let Some(target) = func.block(succ) else {
                        continue;
                    };
                    for (param, arg) in target.params.iter().zip(args) {
                        if useful.contains(&param.value) && useful.insert(*arg) {
                            changed = true;
                        }
                    }
                }

                for inst in block.instructions.iter().rev() {
                    let Some(result) = inst.result else {
                        continue;
                    };
                    if !useful.contains(&result)
                        || classify(&inst.op, self.module, self.mode) == OpClass::Constant
                    {
                        continue;
                    }
                    let skip = self.dropped_operand(inst);
                    for op in inst.op.operands() {
                        if Some(op) != skip && useful.insert(op) {
                            changed = true;
                        }
                    }
                }
            }
        }

        useful
    }

    /// Operand whose differential cannot reach the result because it goes
    /// through a dropped field. Witness failures leave it to `validate`.
    fn dropped_operand(&mut self, inst: &Instruction) -> Option<ValueId> {
        match &inst.op {
            Operation::ExtractField { aggregate, index } => {
                let agg_ty = self.type_of(*aggregate).ok()?;
                self.is_dropped_field(&agg_ty, *index)
                    .unwrap_or(false)
                    .then_some(*aggregate)
            }
            Operation::InsertField { index, value, .. } => {
                let agg_ty = inst.ty.clone();
                self.is_dropped_field(&agg_ty, *index)
                    .unwrap_or(false)
                    .then_some(*value)
            }
            _ => None,
        }
    }

    fn validate(&mut self, result: &mut ActivityResult) -> Result<(), DiffError> {
        let func = self.func;
        for block in &func.blocks {
            for param in &block.params {
                if result.useful.contains(&param.value) {
                    if let Some(err) = self.blocked.remove(&param.value) {
                        return Err(err);
                    }
                }
            }

            for inst in &block.instructions {
                let loc = self.location(inst.span);
                let any_varying = inst.op.operands().iter().any(|v| result.varying.contains(v));
                let result_useful = inst.result.map_or(true, |r| result.useful.contains(&r));

                if let Some(r) = inst.result {
                    if result.useful.contains(&r) {
                        if let Some(err) = self.blocked.remove(&r) {
                            return Err(err);
                        }
                    }
                }

                match classify(&inst.op, self.module, self.mode) {
                    OpClass::Opaque if any_varying && result_useful => {
                        return Err(DiffError::NonDifferentiableOperation {
                            op: inst.op.name().to_string(),
                            location: loc,
                        });
                    }
                    OpClass::Constant => {
                        if let Operation::Call {
                            callee,
                            no_diff: false,
                            ..
                        } = &inst.op
                        {
                            if any_varying {
                                result.warnings.push(Diagnostic::warning(
                                    DiagnosticKind::NonDifferentiableCall,
                                    loc.clone(),
                                    format!(
                                        "call to `{}` receives varying arguments but has no derivative; its result is treated as constant",
                                        callee_label(callee)
                                    ),
                                ));
                            }
                        }
                    }
                    OpClass::Nonlinear => {
                        if let (Operation::Call { callee, .. }, Some(r)) = (&inst.op, inst.result) {
                            if result.active.contains(&r) {
                                result.active_calls.push((callee.clone(), inst.span));
                            }
                        }
                    }
                    _ => {}
                }

                if result_useful && any_varying {
                    self.check_aggregate_access(inst, result, loc)?;
                }
            }
        }
        Ok(())
    }

    /// Reads through dropped fields and user-declared differentials
    fn check_aggregate_access(
        &mut self,
        inst: &Instruction,
        result: &ActivityResult,
        loc: SourceLocation,
    ) -> Result<(), DiffError> {
        let (agg_ty, index) = match &inst.op {
            Operation::ExtractField { aggregate, index } if result.varying.contains(aggregate) => {
                (self.type_of(*aggregate)?, Some(*index))
            }
            Operation::InsertField { .. } | Operation::Aggregate { .. } => (inst.ty.clone(), None),
            _ => return Ok(()),
        };
        let Some(w) = self.witness_for(&agg_ty)? else {
            return Ok(());
        };

        match (&w.kind, index) {
            (WitnessKind::Declared, _) => Err(DiffError::MissingDifferentialWitness {
                ty: agg_ty.clone(),
                reason: format!(
                    "`{}` declares its own differential `{}`; its fields cannot be differentiated individually",
                    agg_ty, w.differential
                ),
                location: Some(loc),
            }),
            (WitnessKind::Product { fields }, Some(index)) => match fields.get(index) {
                Some(slot) => match &slot.dropped {
                    Some(DropReason::NoWitness(reason)) => Err(DiffError::MissingDifferentialWitness {
                        ty: agg_ty.component_type(index).unwrap_or(MirType::Void),
                        reason: format!("field `{}` of `{}` was dropped: {}", slot.name, agg_ty, reason),
                        location: Some(loc),
                    }),
                    _ => Ok(()),
                },
                None => Err(DiffError::Internal(format!("field {} out of range for {}", index, agg_ty))),
            },
            _ => Ok(()),
        }
    }
}

pub(crate) fn callee_label(callee: &Callee) -> String {
    match callee {
        Callee::Direct(name) => name.clone(),
        Callee::Witness { table, requirement } => format!("{}.{}", table, requirement),
        Callee::Dynamic {
            interface,
            requirement,
            ..
        } => format!("{}.{}", interface, requirement),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::function::{DiffMode, FunctionSignature};
    use crate::mir::module::{DiffConformance, ModuleBuilder};
    use crate::mir::types::{ResourceKind, StructField};

    fn analyze(module: &MirModule, name: &str) -> Result<ActivityResult, DiffError> {
        let func = module.get_function(name).unwrap();
        ActivityAnalysis::new(func, module, ADMode::Reverse, 64).analyze()
    }

    #[test]
    fn test_activity_simple_function() {
        // f(x, y) = x * y + x
        let mut mb = ModuleBuilder::new("t");
        mb.differentiable(
            "mul_add",
            DiffMode::Both,
            FunctionSignature::new(vec![MirType::F32, MirType::F32], MirType::F32),
            |f| {
                let x = f.param(0).unwrap();
                let y = f.param(1).unwrap();
                let xy = f.push_op(Operation::FMul { lhs: x, rhs: y }, MirType::F32);
                let r = f.push_op(Operation::FAdd { lhs: xy, rhs: x }, MirType::F32);
                f.terminate(Terminator::Return { value: Some(r) });
            },
        );
        let module = mb.build();
        let result = analyze(&module, "mul_add").unwrap();

        assert_eq!(result.active.len(), 4);
        assert_eq!(result.active_params, vec![0, 1]);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_activity_with_constant() {
        // f(x, n) = x * 2.0, n unused and not differentiable
        let mut mb = ModuleBuilder::new("t");
        mb.differentiable(
            "scale",
            DiffMode::Both,
            FunctionSignature::new(vec![MirType::F32, MirType::I32], MirType::F32),
            |f| {
                let x = f.param(0).unwrap();
                let two = f.const_float(2.0, MirType::F32);
                let r = f.push_op(Operation::FMul { lhs: x, rhs: two }, MirType::F32);
                f.terminate(Terminator::Return { value: Some(r) });
            },
        );
        let module = mb.build();
        let result = analyze(&module, "scale").unwrap();
        let func = module.get_function("scale").unwrap();
        let two = func.blocks[0].instructions[0].result.unwrap();

        assert_eq!(result.diff_params, vec![0]);
        assert!(result.useful.contains(&two));
        assert!(!result.varying.contains(&two));
        assert!(!result.is_active(two));
    }

    #[test]
    fn test_activity_dead_code() {
        // f(x, y) = x (y is unused)
        let mut mb = ModuleBuilder::new("t");
        mb.differentiable(
            "first",
            DiffMode::Both,
            FunctionSignature::new(vec![MirType::F32, MirType::F32], MirType::F32),
            |f| {
                let x = f.param(0).unwrap();
                f.terminate(Terminator::Return { value: Some(x) });
            },
        );
        let module = mb.build();
        let result = analyze(&module, "first").unwrap();
        assert_eq!(result.diff_params, vec![0, 1]);
        assert_eq!(result.active_params, vec![0]);
    }

    #[test]
    fn test_opaque_on_active_path_is_rejected() {
        let v3 = MirType::vector(MirType::F32, 3);
        let mut mb = ModuleBuilder::new("t");
        mb.differentiable(
            "shuffled",
            DiffMode::Both,
            FunctionSignature::new(vec![v3.clone()], v3.clone()),
            |f| {
                let v = f.param(0).unwrap();
                let s = f.push_op(
                    Operation::VecShuffle {
                        vec1: v,
                        vec2: v,
                        mask: vec![2, 1, 0],
                    },
                    v3.clone(),
                );
                f.terminate(Terminator::Return { value: Some(s) });
            },
        );
        let module = mb.build();
        let err = analyze(&module, "shuffled").unwrap_err();
        assert!(matches!(err, DiffError::NonDifferentiableOperation { ref op, .. } if op == "shuffle"));
    }

    #[test]
    fn test_opaque_off_active_path_is_accepted() {
        // the shuffled value only feeds a dead computation
        let v3 = MirType::vector(MirType::F32, 3);
        let mut mb = ModuleBuilder::new("t");
        mb.differentiable(
            "partly",
            DiffMode::Both,
            FunctionSignature::new(vec![v3.clone()], v3.clone()),
            |f| {
                let v = f.param(0).unwrap();
                f.push_op(
                    Operation::VecShuffle {
                        vec1: v,
                        vec2: v,
                        mask: vec![2, 1, 0],
                    },
                    v3.clone(),
                );
                f.terminate(Terminator::Return { value: Some(v) });
            },
        );
        let module = mb.build();
        assert!(analyze(&module, "partly").is_ok());
    }

    #[test]
    fn test_resource_store_of_varying_value() {
        let buf = MirType::resource(ResourceKind::RWBuffer, MirType::F32);
        let mut mb = ModuleBuilder::new("t");
        mb.differentiable(
            "store",
            DiffMode::Both,
            FunctionSignature::new(vec![MirType::F32, buf], MirType::F32),
            |f| {
                let x = f.param(0).unwrap();
                let b = f.param(1).unwrap();
                let i = f.const_int(0);
                f.push_void(Operation::ResourceStore {
                    resource: b,
                    index: i,
                    value: x,
                });
                f.terminate(Terminator::Return { value: Some(x) });
            },
        );
        let module = mb.build();
        let err = analyze(&module, "store").unwrap_err();
        assert_eq!(err.kind(), DiagnosticKind::NonDifferentiableOperation);
    }

    #[test]
    fn test_no_diff_field_is_constant() {
        let vertex = MirType::structure(
            "Vertex",
            vec![
                StructField::new("color", MirType::F32),
                StructField::no_diff("density", MirType::F32),
            ],
        );
        let mut mb = ModuleBuilder::new("t");
        mb.differentiable(
            "density",
            DiffMode::Both,
            FunctionSignature::new(vec![vertex.clone()], MirType::F32),
            |f| {
                let v = f.param(0).unwrap();
                let d = f.push_op(Operation::ExtractField { aggregate: v, index: 1 }, MirType::F32);
                f.terminate(Terminator::Return { value: Some(d) });
            },
        );
        let module = mb.build();
        let result = analyze(&module, "density").unwrap();
        assert!(result.active_params.is_empty());
        assert!(result.active.is_empty());
        assert!(result.witnesses.is_empty());
    }

    #[test]
    fn test_value_stored_into_no_diff_field_is_inactive() {
        let vertex = MirType::structure(
            "Vertex",
            vec![
                StructField::new("color", MirType::F32),
                StructField::no_diff("density", MirType::F32),
            ],
        );
        let mut mb = ModuleBuilder::new("t");
        mb.differentiable(
            "pack",
            DiffMode::Both,
            FunctionSignature::new(vec![MirType::F32, MirType::F32], vertex.clone()),
            |f| {
                let c = f.param(0).unwrap();
                let d = f.param(1).unwrap();
                let z = f.push_op(Operation::ZeroInit { ty: vertex.clone() }, vertex.clone());
                let with_color = f.push_op(
                    Operation::InsertField {
                        aggregate: z,
                        index: 0,
                        value: c,
                    },
                    vertex.clone(),
                );
                let scaled = f.push_op(Operation::FMul { lhs: d, rhs: d }, MirType::F32);
                let v = f.push_op(
                    Operation::InsertField {
                        aggregate: with_color,
                        index: 1,
                        value: scaled,
                    },
                    vertex.clone(),
                );
                f.terminate(Terminator::Return { value: Some(v) });
            },
        );
        let module = mb.build();
        let result = analyze(&module, "pack").unwrap();
        assert_eq!(result.active_params, vec![0]);
        let func = module.get_function("pack").unwrap();
        let density = func.param_values()[1];
        assert!(result.varying.contains(&density));
        assert!(!result.useful.contains(&density));
        assert!(!result.is_active(density));
    }

    #[test]
    fn test_declared_differential_field_access() {
        let light = MirType::structure("Light", vec![StructField::new("i", MirType::F32)]);
        let mut mb = ModuleBuilder::new("t");
        mb.conforming_type(
            "Light",
            light.clone(),
            DiffConformance {
                differential: MirType::F32,
                zero_fn: "light_zero".into(),
                add_fn: "light_add".into(),
            },
        );
        mb.function("light_zero", FunctionSignature::new(vec![], MirType::F32), |f| {
            let z = f.const_float(0.0, MirType::F32);
            f.terminate(Terminator::Return { value: Some(z) });
        });
        mb.function(
            "light_add",
            FunctionSignature::new(vec![MirType::F32, MirType::F32], MirType::F32),
            |f| {
                let (a, b) = (f.param(0).unwrap(), f.param(1).unwrap());
                let s = f.push_op(Operation::FAdd { lhs: a, rhs: b }, MirType::F32);
                f.terminate(Terminator::Return { value: Some(s) });
            },
        );
        mb.differentiable(
            "intensity",
            DiffMode::Both,
            FunctionSignature::new(vec![light], MirType::F32),
            |f| {
                let l = f.param(0).unwrap();
                let i = f.push_op(Operation::ExtractField { aggregate: l, index: 0 }, MirType::F32);
                f.terminate(Terminator::Return { value: Some(i) });
            },
        );
        let module = mb.build();
        let err = analyze(&module, "intensity").unwrap_err();
        assert_eq!(err.kind(), DiagnosticKind::MissingDifferentialWitness);
    }

    #[test]
    fn test_unmarked_call_warns_and_is_constant() {
        let mut mb = ModuleBuilder::new("t");
        mb.function(
            "helper",
            FunctionSignature::new(vec![MirType::F32], MirType::F32),
            |f| {
                let x = f.param(0).unwrap();
                f.terminate(Terminator::Return { value: Some(x) });
            },
        );
        mb.differentiable(
            "caller",
            DiffMode::Both,
            FunctionSignature::new(vec![MirType::F32], MirType::F32),
            |f| {
                let x = f.param(0).unwrap();
                let h = f.push_op(
                    Operation::Call {
                        callee: Callee::Direct("helper".into()),
                        args: vec![x],
                        ret_ty: MirType::F32,
                        no_diff: false,
                    },
                    MirType::F32,
                );
                let r = f.push_op(Operation::FMul { lhs: x, rhs: h }, MirType::F32);
                f.terminate(Terminator::Return { value: Some(r) });
            },
        );
        let module = mb.build();
        let result = analyze(&module, "caller").unwrap();
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].kind, DiagnosticKind::NonDifferentiableCall);
        assert!(result.active_calls.is_empty());
    }

    #[test]
    fn test_loop_carried_activity() {
        // acc flows around a loop through block params
        let mut mb = ModuleBuilder::new("t");
        mb.differentiable(
            "looped",
            DiffMode::Both,
            FunctionSignature::new(vec![MirType::F32], MirType::F32),
            |f| {
                let x = f.param(0).unwrap();
                let zero = f.const_float(0.0, MirType::F32);
                let i0 = f.const_int(0);
                let header = f.create_named_block("header");
                let exit = f.create_named_block("exit");
                f.terminate(Terminator::Goto {
                    target: header,
                    args: vec![zero, i0],
                });

                f.switch_to(header);
                let acc = f.block_param(MirType::F32);
                let i = f.block_param(MirType::I32);
                let next = f.push_op(Operation::FAdd { lhs: acc, rhs: x }, MirType::F32);
                let one = f.const_int(1);
                let i1 = f.push_op(Operation::IAdd { lhs: i, rhs: one }, MirType::I32);
                let n = f.const_int(3);
                let c = f.push_op(
                    Operation::ICmp {
                        pred: crate::mir::inst::IntPredicate::Slt,
                        lhs: i1,
                        rhs: n,
                    },
                    MirType::Bool,
                );
                f.terminate(Terminator::Branch {
                    cond: c,
                    then_block: header,
                    then_args: vec![next, i1],
                    else_block: exit,
                    else_args: vec![next],
                });

                f.switch_to(exit);
                let out = f.block_param(MirType::F32);
                f.terminate(Terminator::Return { value: Some(out) });
            },
        );
        let module = mb.build();
        let result = analyze(&module, "looped").unwrap();
        let func = module.get_function("looped").unwrap();
        let acc = func.blocks[1].params[0].value;
        let counter = func.blocks[1].params[1].value;

        assert!(result.is_active(acc));
        assert!(!result.varying.contains(&counter));
        assert_eq!(result.active_params, vec![0]);
    }

    #[test]
    fn test_checkpoint_operands_dedupe() {
        let x = ValueId(0);
        assert_eq!(checkpoint_operands(&Operation::FMul { lhs: x, rhs: x }), vec![x]);
        assert!(checkpoint_operands(&Operation::FAdd { lhs: x, rhs: x }).is_empty());
    }
}
