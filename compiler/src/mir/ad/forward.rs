//! Forward-Mode Automatic Differentiation
//!
//! Forward mode propagates tangent values alongside primal values. For each
//! active value x we compute (x, ẋ) in one sweep, so no checkpointing is
//! needed. Block parameters that carry an active value get a tangent
//! parameter next to them, which is how loop-carried tangents travel.
//!
//! ```text
//! f(x: f32, n: i32) -> f32
//!   =>
//! f_fwd_diff(dp_x: DiffPair<f32, f32>, n: i32) -> DiffPair<f32, f32>
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, trace};

use super::activity::ActivityResult;
use super::diagnostics::DiffError;
use super::pairing::{derived_name, forward_signature, pair_type, requirement_key, SignatureWitnesses};
use super::transform::ADMode;
use super::witness::{emit_zero, DifferentialWitness, WitnessKind};
use crate::mir::block::{BasicBlock, Terminator};
use crate::mir::function::{FunctionBuilder, MirFunction};
use crate::mir::inst::{Callee, FloatPredicate, Instruction, Operation};
use crate::mir::module::MirModule;
use crate::mir::types::MirType;
use crate::mir::value::{BlockId, ValueId};

/// Forward-mode AD transformer
pub struct ForwardModeTransform<'a> {
    /// Original function
    source: &'a MirFunction,
    module: &'a MirModule,
    /// Activity analysis result
    activity: &'a ActivityResult,
    max_depth: usize,
    b: FunctionBuilder,
    types: HashMap<ValueId, MirType>,
    /// Source value to its primal in the new function
    primals: HashMap<ValueId, ValueId>,
    /// Source value to its tangent in the new function
    tangents: HashMap<ValueId, ValueId>,
    blocks: HashMap<BlockId, BlockId>,
}

impl<'a> ForwardModeTransform<'a> {
    pub fn new(
        source: &'a MirFunction,
        module: &'a MirModule,
        activity: &'a ActivityResult,
        max_depth: usize,
    ) -> Self {
        let name = derived_name(module, &source.name, ADMode::Forward);
        let mut b = FunctionBuilder::new(&name, forward_signature(source, &activity.signature));
        b.attributes_mut().derived_from = Some(source.name.clone());
        for local in &source.locals {
            b.add_local(&local.name, local.ty.clone());
        }
        Self {
            source,
            module,
            activity,
            max_depth,
            b,
            types: source.value_types(),
            primals: HashMap::new(),
            tangents: HashMap::new(),
            blocks: HashMap::new(),
        }
    }

    /// Build the tangent-propagating function
    pub fn transform(mut self) -> Result<MirFunction, DiffError> {
        debug!("forward-differentiating {}", self.source.name);
        self.source
            .validate()
            .map_err(|e| DiffError::malformed(&self.source.name, e))?;
        let order = self.source.reverse_post_order();

        // every block exists up front so back edges can target them
        for id in &order {
            let block = self.block(*id)?;
            let new_id = if id.is_entry() {
                BlockId::ENTRY
            } else {
                match &block.name {
                    Some(name) => self.b.create_named_block(name),
                    None => self.b.create_block(),
                }
            };
            self.blocks.insert(*id, new_id);
            if id.is_entry() {
                continue;
            }
            for param in &block.params {
                let p = self.b.block_param_on(new_id, param.ty.clone());
                self.primals.insert(param.value, p);
            }
            for param in &block.params {
                if let Some(w) = self.activity.witness(param.value) {
                    let t = self.b.block_param_on(new_id, w.differential.clone());
                    self.tangents.insert(param.value, t);
                }
            }
        }

        self.b.switch_to(BlockId::ENTRY);
        self.split_entry_pairs()?;

        for id in order {
            let new_id = self.mapped_block(id)?;
            self.b.switch_to(new_id);
            let block = self.block(id)?;
            for inst in &block.instructions {
                self.b.set_span(inst.span);
                self.instruction(inst)?;
            }
            self.b.set_span(None);
            self.terminator(&block.terminator)?;
        }

        Ok(self.b.build())
    }

    fn block(&self, id: BlockId) -> Result<&'a BasicBlock, DiffError> {
        let source: &'a MirFunction = self.source;
        source
            .block(id)
            .ok_or_else(|| DiffError::Internal(format!("{} missing from {}", id, self.source.name)))
    }

    fn mapped_block(&self, id: BlockId) -> Result<BlockId, DiffError> {
        self.blocks
            .get(&id)
            .copied()
            .ok_or_else(|| DiffError::Internal(format!("no forward block for {}", id)))
    }

    fn split_entry_pairs(&mut self) -> Result<(), DiffError> {
        let params = self.source.param_values();
        for (i, src) in params.into_iter().enumerate() {
            let new_param = self
                .b
                .param(i)
                .ok_or_else(|| DiffError::Internal(format!("missing parameter {}", i)))?;
            match self.activity.signature.params.get(i).and_then(|w| w.clone()) {
                Some(w) => {
                    let ty = self.source.signature.params[i].clone();
                    let primal = self.b.push_op(Operation::PairPrimal { pair: new_param }, ty);
                    self.primals.insert(src, primal);
                    if self.activity.is_active(src) {
                        let t = self
                            .b
                            .push_op(Operation::PairDiff { pair: new_param }, w.differential.clone());
                        self.tangents.insert(src, t);
                    }
                }
                None => {
                    self.primals.insert(src, new_param);
                }
            }
        }
        Ok(())
    }

    fn p(&self, v: ValueId) -> Result<ValueId, DiffError> {
        self.primals
            .get(&v)
            .copied()
            .ok_or_else(|| DiffError::Internal(format!("{} used before definition in {}", v, self.source.name)))
    }

    fn ty(&self, v: ValueId) -> Result<MirType, DiffError> {
        self.types
            .get(&v)
            .cloned()
            .ok_or_else(|| DiffError::Internal(format!("{} has no type", v)))
    }

    fn witness_of_type(&self, ty: &MirType) -> Result<Arc<DifferentialWitness>, DiffError> {
        self.module
            .witness_cache
            .synthesize(ty, self.module, self.max_depth)?
            .ok_or_else(|| DiffError::Internal(format!("{} has no differential", ty)))
    }

    /// Tangent of a source value, `zero()` if it is inactive
    fn t(&mut self, v: ValueId) -> Result<ValueId, DiffError> {
        if let Some(t) = self.tangents.get(&v) {
            return Ok(*t);
        }
        let w = self.witness_of_type(&self.ty(v)?)?;
        Ok(emit_zero(&mut self.b, &w))
    }

    fn t_with(&mut self, v: ValueId, w: &DifferentialWitness) -> ValueId {
        match self.tangents.get(&v) {
            Some(t) => *t,
            None => emit_zero(&mut self.b, w),
        }
    }

    fn is_active(&self, v: ValueId) -> bool {
        self.tangents.contains_key(&v)
    }

    fn instruction(&mut self, inst: &Instruction) -> Result<(), DiffError> {
        let active = inst.result.and_then(|r| self.activity.witness(r).cloned().map(|w| (r, w)));

        if let (Operation::Call { .. }, Some((r, w))) = (&inst.op, &active) {
            return self.call(inst, *r, w);
        }

        // primal copy
        let mut op = inst.op.clone();
        let mut missing = None;
        op.map_operands(|v| match self.primals.get(&v) {
            Some(p) => *p,
            None => {
                missing = Some(v);
                v
            }
        });
        if let Some(v) = missing {
            return Err(DiffError::Internal(format!("{} used before definition in {}", v, self.source.name)));
        }
        match inst.result {
            Some(r) => {
                let new = self.b.push_op(op, inst.ty.clone());
                self.primals.insert(r, new);
            }
            None => self.b.push_void(op),
        }

        if let Some((r, w)) = active {
            let t = self.tangent(inst, r, &w)?;
            trace!("{}: tangent of {} is {}", self.source.name, r, t);
            self.tangents.insert(r, t);
        }
        Ok(())
    }

    fn tangent(
        &mut self,
        inst: &Instruction,
        r: ValueId,
        w: &Arc<DifferentialWitness>,
    ) -> Result<ValueId, DiffError> {
        let d = w.differential.clone();
        let ty = inst.ty.clone();
        let pr = self.p(r)?;

        let t = match &inst.op {
            Operation::FAdd { lhs, rhs } => match (self.is_active(*lhs), self.is_active(*rhs)) {
                (true, false) => self.t(*lhs)?,
                (false, true) => self.t(*rhs)?,
                _ => {
                    let (a, b) = (self.t(*lhs)?, self.t(*rhs)?);
                    self.b.push_op(Operation::FAdd { lhs: a, rhs: b }, d)
                }
            },
            Operation::FSub { lhs, rhs } => match (self.is_active(*lhs), self.is_active(*rhs)) {
                (true, false) => self.t(*lhs)?,
                (false, true) => {
                    let b = self.t(*rhs)?;
                    self.b.push_op(Operation::FNeg { operand: b }, d)
                }
                _ => {
                    let (a, b) = (self.t(*lhs)?, self.t(*rhs)?);
                    self.b.push_op(Operation::FSub { lhs: a, rhs: b }, d)
                }
            },
            Operation::FNeg { operand } => {
                let a = self.t(*operand)?;
                self.b.push_op(Operation::FNeg { operand: a }, d)
            }

            // d(a*b) = da*b + a*db
            Operation::FMul { lhs, rhs } => {
                let (pa, pb) = (self.p(*lhs)?, self.p(*rhs)?);
                let mut terms = Vec::new();
                if self.is_active(*lhs) {
                    let ta = self.t(*lhs)?;
                    terms.push(self.b.push_op(Operation::FMul { lhs: ta, rhs: pb }, d.clone()));
                }
                if self.is_active(*rhs) {
                    let tb = self.t(*rhs)?;
                    terms.push(self.b.push_op(Operation::FMul { lhs: pa, rhs: tb }, d.clone()));
                }
                self.sum_terms(terms, w)
            }

            // d(a/b) = (da - r*db) / b
            Operation::FDiv { lhs, rhs } => {
                let pb = self.p(*rhs)?;
                let numer = match (self.is_active(*lhs), self.is_active(*rhs)) {
                    (true, false) => self.t(*lhs)?,
                    (a_active, _) => {
                        let tb = self.t(*rhs)?;
                        let rdb = self.b.push_op(Operation::FMul { lhs: pr, rhs: tb }, d.clone());
                        if a_active {
                            let ta = self.t(*lhs)?;
                            self.b.push_op(Operation::FSub { lhs: ta, rhs: rdb }, d.clone())
                        } else {
                            self.b.push_op(Operation::FNeg { operand: rdb }, d.clone())
                        }
                    }
                };
                self.b.push_op(Operation::FDiv { lhs: numer, rhs: pb }, d)
            }

            // d sqrt(a) = 0.5 * da / r
            Operation::Sqrt { operand } => {
                let ta = self.t(*operand)?;
                let half = self.b.const_float(0.5, ty);
                let scaled = self.b.push_op(Operation::FMul { lhs: half, rhs: ta }, d.clone());
                self.b.push_op(Operation::FDiv { lhs: scaled, rhs: pr }, d)
            }
            Operation::Exp { operand } => {
                let ta = self.t(*operand)?;
                self.b.push_op(Operation::FMul { lhs: pr, rhs: ta }, d)
            }
            Operation::Log { operand } => {
                let (ta, pa) = (self.t(*operand)?, self.p(*operand)?);
                self.b.push_op(Operation::FDiv { lhs: ta, rhs: pa }, d)
            }
            Operation::Sin { operand } => {
                let (ta, pa) = (self.t(*operand)?, self.p(*operand)?);
                let c = self.b.push_op(Operation::Cos { operand: pa }, ty);
                self.b.push_op(Operation::FMul { lhs: c, rhs: ta }, d)
            }
            Operation::Cos { operand } => {
                let (ta, pa) = (self.t(*operand)?, self.p(*operand)?);
                let s = self.b.push_op(Operation::Sin { operand: pa }, ty);
                let m = self.b.push_op(Operation::FMul { lhs: s, rhs: ta }, d.clone());
                self.b.push_op(Operation::FNeg { operand: m }, d)
            }
            // d tanh(a) = (1 - r^2) da
            Operation::Tanh { operand } => {
                let ta = self.t(*operand)?;
                let one = self.b.const_float(1.0, ty.clone());
                let r2 = self.b.push_op(Operation::FMul { lhs: pr, rhs: pr }, ty.clone());
                let k = self.b.push_op(Operation::FSub { lhs: one, rhs: r2 }, ty);
                self.b.push_op(Operation::FMul { lhs: k, rhs: ta }, d)
            }
            // d b^e = e b^(e-1) db + r ln(b) de
            Operation::Pow { base, exp } => {
                let (pb, pe) = (self.p(*base)?, self.p(*exp)?);
                let mut terms = Vec::new();
                if self.is_active(*base) {
                    let tb = self.t(*base)?;
                    let one = self.b.const_float(1.0, ty.clone());
                    let em1 = self.b.push_op(Operation::FSub { lhs: pe, rhs: one }, ty.clone());
                    let pw = self.b.push_op(Operation::Pow { base: pb, exp: em1 }, ty.clone());
                    let k = self.b.push_op(Operation::FMul { lhs: pe, rhs: pw }, ty.clone());
                    terms.push(self.b.push_op(Operation::FMul { lhs: k, rhs: tb }, d.clone()));
                }
                if self.is_active(*exp) {
                    let te = self.t(*exp)?;
                    let ln = self.b.push_op(Operation::Log { operand: pb }, ty.clone());
                    let k = self.b.push_op(Operation::FMul { lhs: pr, rhs: ln }, ty.clone());
                    terms.push(self.b.push_op(Operation::FMul { lhs: k, rhs: te }, d.clone()));
                }
                self.sum_terms(terms, w)
            }
            Operation::Abs { operand } => {
                let (ta, pa) = (self.t(*operand)?, self.p(*operand)?);
                let s = self.b.push_op(Operation::Sign { operand: pa }, ty);
                self.b.push_op(Operation::FMul { lhs: s, rhs: ta }, d)
            }
            Operation::FMin { lhs, rhs } | Operation::FMax { lhs, rhs } => {
                let pred = if matches!(inst.op, Operation::FMin { .. }) {
                    FloatPredicate::OLt
                } else {
                    FloatPredicate::OGt
                };
                let (pa, pb) = (self.p(*lhs)?, self.p(*rhs)?);
                let (ta, tb) = (self.t(*lhs)?, self.t(*rhs)?);
                let c = self.b.push_op(
                    Operation::FCmp {
                        pred,
                        lhs: pa,
                        rhs: pb,
                    },
                    ty.bool_like(),
                );
                self.b.push_op(
                    Operation::Select {
                        cond: c,
                        then_val: ta,
                        else_val: tb,
                    },
                    d,
                )
            }
            Operation::Select {
                cond,
                then_val,
                else_val,
            } => {
                let c = self.p(*cond)?;
                let (tt, te) = (self.t(*then_val)?, self.t(*else_val)?);
                self.b.push_op(
                    Operation::Select {
                        cond: c,
                        then_val: tt,
                        else_val: te,
                    },
                    d,
                )
            }

            Operation::Splat { scalar } => {
                let ts = self.t(*scalar)?;
                self.b.push_op(Operation::Splat { scalar: ts }, d)
            }
            Operation::Sum { operand } => {
                let ta = self.t(*operand)?;
                self.b.push_op(Operation::Sum { operand: ta }, d)
            }
            Operation::FConvert { operand, .. } => {
                let ta = self.t(*operand)?;
                self.b.push_op(
                    Operation::FConvert {
                        operand: ta,
                        to: d.clone(),
                    },
                    d,
                )
            }
            Operation::Swizzle { vector, lanes } => {
                let tv = self.t(*vector)?;
                self.b.push_op(
                    Operation::Swizzle {
                        vector: tv,
                        lanes: lanes.clone(),
                    },
                    d,
                )
            }

            Operation::Aggregate { elements } => {
                let parts = match &w.kind {
                    WitnessKind::Product { fields } => {
                        let mut parts = Vec::new();
                        for (e, slot) in elements.iter().zip(fields) {
                            if let (Some(_), Some(fw)) = (slot.slot, &slot.witness) {
                                parts.push(self.t_with(*e, fw));
                            }
                        }
                        parts
                    }
                    _ => elements.iter().map(|e| self.t(*e)).collect::<Result<Vec<_>, _>>()?,
                };
                self.b.push_op(Operation::Aggregate { elements: parts }, d)
            }
            Operation::ExtractField { aggregate, index } => {
                let slot = self.slot_in(*aggregate, *index)?;
                let ta = self.t(*aggregate)?;
                self.b.push_op(
                    Operation::ExtractField {
                        aggregate: ta,
                        index: slot,
                    },
                    d,
                )
            }
            Operation::InsertField {
                aggregate,
                index,
                value,
            } => {
                let ta = self.t(*aggregate)?;
                match w.slot_of(*index) {
                    Some(slot) => {
                        let tv = self.t(*value)?;
                        self.b.push_op(
                            Operation::InsertField {
                                aggregate: ta,
                                index: slot,
                                value: tv,
                            },
                            d,
                        )
                    }
                    None => ta,
                }
            }
            Operation::ExtractElement { aggregate, index } => {
                let (ta, pi) = (self.t(*aggregate)?, self.p(*index)?);
                self.b.push_op(
                    Operation::ExtractElement {
                        aggregate: ta,
                        index: pi,
                    },
                    d,
                )
            }
            Operation::InsertElement {
                aggregate,
                index,
                value,
            } => {
                let (ta, pi, tv) = (self.t(*aggregate)?, self.p(*index)?, self.t(*value)?);
                self.b.push_op(
                    Operation::InsertElement {
                        aggregate: ta,
                        index: pi,
                        value: tv,
                    },
                    d,
                )
            }

            other => {
                return Err(DiffError::Internal(format!(
                    "no forward rule for active `{}` in {}",
                    other.name(),
                    self.source.name
                )))
            }
        };
        Ok(t)
    }

    /// Index of a component of an active aggregate in its differential
    fn slot_in(&self, aggregate: ValueId, index: usize) -> Result<usize, DiffError> {
        let w = self
            .activity
            .witness(aggregate)
            .ok_or_else(|| DiffError::Internal(format!("{} has no witness", aggregate)))?;
        w.slot_of(index).ok_or_else(|| DiffError::Internal(format!("component {} of {} has no differential", index, w.primal)))
    }

    fn sum_terms(&mut self, terms: Vec<ValueId>, w: &DifferentialWitness) -> ValueId {
        let mut iter = terms.into_iter();
        let Some(first) = iter.next() else {
            return emit_zero(&mut self.b, w);
        };
        iter.fold(first, |acc, t| {
            self.b
                .push_op(Operation::FAdd { lhs: acc, rhs: t }, w.differential.clone())
        })
    }

    /// Active call: invoke the callee's forward derivative on pairs
    fn call(&mut self, inst: &Instruction, r: ValueId, w: &Arc<DifferentialWitness>) -> Result<(), DiffError> {
        let Operation::Call { callee, args, .. } = &inst.op else {
            return Err(DiffError::Internal("expected a call".into()));
        };
        let (target_fn, new_callee) = self.resolve_callee(callee)?;
        let callee_sw = SignatureWitnesses::resolve(target_fn, self.module, self.max_depth)?;

        let mut new_args = Vec::with_capacity(args.len());
        for (i, arg) in args.iter().enumerate() {
            let pa = self.p(*arg)?;
            match callee_sw.params.get(i).and_then(|w| w.clone()) {
                Some(pw) => {
                    let ta = self.t_with(*arg, &pw);
                    let ty = pair_type(&target_fn.signature.params[i], Some(&*pw));
                    new_args.push(self.b.push_op(
                        Operation::MakePair {
                            primal: pa,
                            differential: ta,
                        },
                        ty,
                    ));
                }
                None => new_args.push(pa),
            }
        }

        let ret_ty = pair_type(&inst.ty, callee_sw.ret.as_deref());
        let pair = self.b.push_op(
            Operation::Call {
                callee: new_callee,
                args: new_args,
                ret_ty: ret_ty.clone(),
                no_diff: false,
            },
            ret_ty,
        );
        let primal = self.b.push_op(Operation::PairPrimal { pair }, inst.ty.clone());
        let tangent = self.b.push_op(Operation::PairDiff { pair }, w.differential.clone());
        self.primals.insert(r, primal);
        self.tangents.insert(r, tangent);
        Ok(())
    }

    /// Function whose signature governs the call, and the derived callee
    fn resolve_callee(&self, callee: &Callee) -> Result<(&'a MirFunction, Callee), DiffError> {
        let module: &'a MirModule = self.module;
        let lookup = |name: &str| {
            module
                .get_function(name)
                .ok_or_else(|| DiffError::Internal(format!("callee `{}` not found", name)))
        };
        match callee {
            Callee::Direct(name) => Ok((
                lookup(name)?,
                Callee::Direct(derived_name(self.module, name, ADMode::Forward)),
            )),
            Callee::Witness { table, requirement } => {
                let name = self
                    .module
                    .get_witness_table(table)
                    .and_then(|t| t.lookup(requirement))
                    .ok_or_else(|| DiffError::Internal(format!("`{}` has no `{}`", table, requirement)))?;
                Ok((
                    lookup(name)?,
                    Callee::Direct(derived_name(self.module, name, ADMode::Forward)),
                ))
            }
            Callee::Dynamic {
                witness,
                interface,
                requirement,
            } => {
                let first = super::pairing::callee_targets(self.module, callee)
                    .into_iter()
                    .next()
                    .ok_or_else(|| DiffError::Internal(format!("no implementation of {}.{}", interface, requirement)))?;
                Ok((
                    lookup(&first)?,
                    Callee::Dynamic {
                        witness: self.p(*witness)?,
                        interface: interface.clone(),
                        requirement: requirement_key(requirement, ADMode::Forward),
                    },
                ))
            }
        }
    }

    fn terminator(&mut self, term: &Terminator) -> Result<(), DiffError> {
        let new_term = match term {
            Terminator::Goto { target, args } => {
                let (target, args) = self.edge(*target, args)?;
                Terminator::Goto { target, args }
            }
            Terminator::Branch {
                cond,
                then_block,
                then_args,
                else_block,
                else_args,
            } => {
                let cond = self.p(*cond)?;
                let (then_block, then_args) = self.edge(*then_block, then_args)?;
                let (else_block, else_args) = self.edge(*else_block, else_args)?;
                Terminator::Branch {
                    cond,
                    then_block,
                    then_args,
                    else_block,
                    else_args,
                }
            }
            Terminator::Switch {
                value,
                default,
                default_args,
                cases,
            } => {
                let value = self.p(*value)?;
                let (default, default_args) = self.edge(*default, default_args)?;
                let mut new_cases = Vec::with_capacity(cases.len());
                for (k, target, args) in cases {
                    let (t, a) = self.edge(*target, args)?;
                    new_cases.push((*k, t, a));
                }
                Terminator::Switch {
                    value,
                    default,
                    default_args,
                    cases: new_cases,
                }
            }
            Terminator::Return { value: Some(v) } => {
                let pv = self.p(*v)?;
                match self.activity.signature.ret.clone() {
                    Some(rw) => {
                        let tv = self.t_with(*v, &rw);
                        let ty = pair_type(&self.source.signature.return_type, Some(&*rw));
                        let pair = self.b.push_op(
                            Operation::MakePair {
                                primal: pv,
                                differential: tv,
                            },
                            ty,
                        );
                        Terminator::Return { value: Some(pair) }
                    }
                    None => Terminator::Return { value: Some(pv) },
                }
            }
            Terminator::Return { value: None } => Terminator::Return { value: None },
            Terminator::Unreachable => Terminator::Unreachable,
        };
        self.b.terminate(new_term);
        Ok(())
    }

    /// Primal arguments, then tangents for the target's active parameters
    fn edge(&mut self, target: BlockId, args: &[ValueId]) -> Result<(BlockId, Vec<ValueId>), DiffError> {
        let new_target = self.mapped_block(target)?;
        let block = self.block(target)?;
        let mut new_args = args.iter().map(|a| self.p(*a)).collect::<Result<Vec<_>, _>>()?;
        for (param, arg) in block.params.iter().zip(args) {
            if let Some(w) = self.activity.witness(param.value).cloned() {
                new_args.push(self.t_with(*arg, &w));
            }
        }
        Ok((new_target, new_args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::ad::activity::ActivityAnalysis;
    use crate::mir::function::{DiffMode, FunctionSignature};
    use crate::mir::interp::{Interpreter, Value};
    use crate::mir::module::ModuleBuilder;
    use crate::mir::types::StructField;

    fn approx_eq(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    fn differentiate(mut module: MirModule, name: &str) -> MirModule {
        let func = module.get_function(name).unwrap().clone();
        let activity = ActivityAnalysis::new(&func, &module, ADMode::Forward, 64)
            .analyze()
            .unwrap();
        let derived = ForwardModeTransform::new(&func, &module, &activity, 64)
            .transform()
            .unwrap();
        derived.validate().unwrap();
        for helper in module.witness_cache.helper_functions() {
            if !module.has_function(&helper.name) {
                module.add_function(helper);
            }
        }
        module.add_function(derived);
        module
    }

    fn tangent_of(module: &MirModule, name: &str, args: Vec<Value>) -> Value {
        let mut interp = Interpreter::new(module);
        let out = interp.call(name, args).unwrap();
        out.field(1).cloned().unwrap()
    }

    #[test]
    fn test_product_rule() {
        // f(x, y) = x * y
        let mut mb = ModuleBuilder::new("t");
        mb.differentiable(
            "mul",
            DiffMode::Both,
            FunctionSignature::new(vec![MirType::F32, MirType::F32], MirType::F32),
            |f| {
                let x = f.param(0).unwrap();
                let y = f.param(1).unwrap();
                let r = f.push_op(Operation::FMul { lhs: x, rhs: y }, MirType::F32);
                f.terminate(Terminator::Return { value: Some(r) });
            },
        );
        let module = differentiate(mb.build(), "mul");

        let args = vec![
            Value::pair(Value::Float(3.0), Value::Float(1.0)),
            Value::pair(Value::Float(4.0), Value::Float(0.0)),
        ];
        let dy = tangent_of(&module, "mul_fwd_diff", args);
        assert!(approx_eq(dy.as_float().unwrap(), 4.0));
    }

    #[test]
    fn test_transcendental_chain() {
        // f(x) = sin(exp(x))
        let mut mb = ModuleBuilder::new("t");
        mb.differentiable(
            "sinexp",
            DiffMode::Both,
            FunctionSignature::new(vec![MirType::F64], MirType::F64),
            |f| {
                let x = f.param(0).unwrap();
                let e = f.push_op(Operation::Exp { operand: x }, MirType::F64);
                let s = f.push_op(Operation::Sin { operand: e }, MirType::F64);
                f.terminate(Terminator::Return { value: Some(s) });
            },
        );
        let module = differentiate(mb.build(), "sinexp");

        let x = 0.3f64;
        let dy = tangent_of(
            &module,
            "sinexp_fwd_diff",
            vec![Value::pair(Value::Float(x), Value::Float(1.0))],
        );
        assert!(approx_eq(dy.as_float().unwrap(), x.exp().cos() * x.exp()));
    }

    #[test]
    fn test_constant_inputs_give_zero_tangent() {
        // f(x, n) = x * sitofp(n); the int parameter stays a plain value
        let mut mb = ModuleBuilder::new("t");
        mb.differentiable(
            "scaled",
            DiffMode::Both,
            FunctionSignature::new(vec![MirType::F32, MirType::I32], MirType::F32),
            |f| {
                let x = f.param(0).unwrap();
                let n = f.param(1).unwrap();
                let nf = f.push_op(
                    Operation::SIToFP {
                        operand: n,
                        to: MirType::F32,
                    },
                    MirType::F32,
                );
                let r = f.push_op(Operation::FMul { lhs: x, rhs: nf }, MirType::F32);
                f.terminate(Terminator::Return { value: Some(r) });
            },
        );
        let module = differentiate(mb.build(), "scaled");
        let derived = module.get_function("scaled_fwd_diff").unwrap();
        assert_eq!(derived.signature.params[1], MirType::I32);

        let dy = tangent_of(
            &module,
            "scaled_fwd_diff",
            vec![Value::pair(Value::Float(2.0), Value::Float(0.0)), Value::Int(5)],
        );
        assert_eq!(dy.as_float(), Some(0.0));
    }

    #[test]
    fn test_struct_tangent_skips_no_diff_field() {
        let vertex = MirType::structure(
            "Vertex",
            vec![
                StructField::new("color", MirType::F32),
                StructField::no_diff("density", MirType::F32),
            ],
        );
        let mut mb = ModuleBuilder::new("t");
        mb.differentiable(
            "shade",
            DiffMode::Both,
            FunctionSignature::new(vec![vertex.clone()], MirType::F32),
            |f| {
                let v = f.param(0).unwrap();
                let c = f.push_op(Operation::ExtractField { aggregate: v, index: 0 }, MirType::F32);
                let d = f.push_op(Operation::ExtractField { aggregate: v, index: 1 }, MirType::F32);
                let r = f.push_op(Operation::FMul { lhs: c, rhs: d }, MirType::F32);
                f.terminate(Terminator::Return { value: Some(r) });
            },
        );
        let module = differentiate(mb.build(), "shade");

        let primal = Value::Aggregate(vec![Value::Float(0.5), Value::Float(3.0)]);
        let tangent = Value::Aggregate(vec![Value::Float(1.0)]);
        let dy = tangent_of(&module, "shade_fwd_diff", vec![Value::pair(primal, tangent)]);
        assert!(approx_eq(dy.as_float().unwrap(), 3.0));
    }
}
