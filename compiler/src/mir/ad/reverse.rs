//! Reverse-Mode Automatic Differentiation
//!
//! Reverse mode computes gradients by backpropagating adjoint values.
//!
//! # Algorithm
//!
//! 1. Primal replay: re-run the original blocks. Every active nonlinear
//!    instruction pushes the primal operands its adjoint rule reads onto the
//!    checkpoint log. At the end of each block the branch selector (when an
//!    edge carries active block arguments) and the block's index are pushed.
//! 2. Pullback: `pb_dispatch` pops a block index and jumps to that block's
//!    adjoint. Terminator adjoints run first (the popped selector picks the
//!    reverse edge), then instruction adjoints in reverse order, then control
//!    returns to `pb_dispatch` until the entry block's adjoint is done.
//!
//! Loops need no trip counter: every iteration leaves its block indices on
//! the log, so the pullback replays exactly the iterations that ran.
//!
//! # Accumulators
//!
//! Every active value owns a local slot holding its adjoint. Uses add into
//! it through the type's `add()`; once the defining instruction has been
//! processed the slot is reset to `zero()`, so a loop body sees fresh
//! per-iteration adjoints while values from outside the loop keep summing.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, trace};

use super::activity::{checkpoint_operands, classify, ActivityResult, OpClass};
use super::diagnostics::DiffError;
use super::pairing::{
    callee_targets, derived_name, pair_type, requirement_key, reverse_result_type, reverse_signature,
    SignatureWitnesses,
};
use super::transform::ADMode;
use super::witness::{emit_add, emit_zero, DifferentialWitness};
use crate::mir::block::{BasicBlock, Terminator};
use crate::mir::function::{FunctionBuilder, MirFunction};
use crate::mir::inst::{Callee, FloatPredicate, Instruction, Operation};
use crate::mir::module::MirModule;
use crate::mir::types::MirType;
use crate::mir::value::{BlockId, ValueId};

/// Reverse-mode AD transformer
pub struct ReverseModeTransform<'a> {
    /// Original function
    source: &'a MirFunction,
    module: &'a MirModule,
    /// Activity analysis result
    activity: &'a ActivityResult,
    max_depth: usize,
    b: FunctionBuilder,
    types: HashMap<ValueId, MirType>,
    /// Source value to its replayed primal
    primals: HashMap<ValueId, ValueId>,
    /// Adjoint slot of every active value
    adjoints: HashMap<ValueId, usize>,
    replay: HashMap<BlockId, BlockId>,
    heads: HashMap<BlockId, BlockId>,
    bodies: HashMap<BlockId, BlockId>,
    dispatch: BlockId,
    exit: BlockId,
    d_out: Option<ValueId>,
}

impl<'a> ReverseModeTransform<'a> {
    pub fn new(
        source: &'a MirFunction,
        module: &'a MirModule,
        activity: &'a ActivityResult,
        max_depth: usize,
    ) -> Self {
        let name = derived_name(module, &source.name, ADMode::Reverse);
        let mut b = FunctionBuilder::new(&name, reverse_signature(source, &activity.signature));
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
            adjoints: HashMap::new(),
            replay: HashMap::new(),
            heads: HashMap::new(),
            bodies: HashMap::new(),
            dispatch: BlockId::ENTRY,
            exit: BlockId::ENTRY,
            d_out: None,
        }
    }

    /// Build the replay + pullback function
    pub fn transform(mut self) -> Result<MirFunction, DiffError> {
        debug!("reverse-differentiating {}", self.source.name);
        self.source
            .validate()
            .map_err(|e| DiffError::malformed(&self.source.name, e))?;

        let order = self.source.reverse_post_order();
        for id in &order {
            let block = self.block(*id)?;
            let label = block_label(block);
            let replay = if id.is_entry() {
                BlockId::ENTRY
            } else {
                let r = self.b.create_named_block(&label);
                for param in &block.params {
                    let p = self.b.block_param_on(r, param.ty.clone());
                    self.primals.insert(param.value, p);
                }
                r
            };
            self.replay.insert(*id, replay);
        }
        self.dispatch = self.b.create_named_block("pb_dispatch");
        let trap = self.b.create_named_block("pb_trap");
        for id in &order {
            let label = block_label(self.block(*id)?);
            let head = self.b.create_named_block(&format!("pb_{}", label));
            let body = self.b.create_named_block(&format!("pb_{}_body", label));
            self.heads.insert(*id, head);
            self.bodies.insert(*id, body);
        }
        self.exit = self.b.create_named_block("pb_exit");

        self.b.switch_to(BlockId::ENTRY);
        self.prologue()?;

        for id in &order {
            self.replay_block(*id)?;
        }

        // pb_dispatch: pop the next block to reverse
        self.b.switch_to(self.dispatch);
        let idx = self.b.push_op(Operation::CheckpointPop, MirType::I32);
        let cases = order
            .iter()
            .map(|id| Ok((block_index(*id), self.mapped(&self.heads, *id)?, vec![])))
            .collect::<Result<Vec<_>, DiffError>>()?;
        self.b.terminate(Terminator::Switch {
            value: idx,
            default: trap,
            default_args: vec![],
            cases,
        });
        self.b.switch_to(trap);
        self.b.terminate(Terminator::Unreachable);

        for id in &order {
            self.adjoint_head(*id)?;
            self.adjoint_body(*id)?;
        }

        self.epilogue()?;
        Ok(self.b.build())
    }

    fn block(&self, id: BlockId) -> Result<&'a BasicBlock, DiffError> {
        let source: &'a MirFunction = self.source;
        source
            .block(id)
            .ok_or_else(|| DiffError::Internal(format!("{} missing from {}", id, source.name)))
    }

    fn mapped(&self, map: &HashMap<BlockId, BlockId>, id: BlockId) -> Result<BlockId, DiffError> {
        map.get(&id)
            .copied()
            .ok_or_else(|| DiffError::Internal(format!("no reverse block for {}", id)))
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

    fn witness(&self, v: ValueId) -> Result<Arc<DifferentialWitness>, DiffError> {
        self.activity
            .witness(v)
            .cloned()
            .ok_or_else(|| DiffError::Internal(format!("active {} has no witness", v)))
    }

    fn is_active(&self, v: ValueId) -> bool {
        self.adjoints.contains_key(&v)
    }

    // =========================================================================
    // PRIMAL REPLAY
    // =========================================================================

    /// Split parameter pairs, bind `d_out`, zero every adjoint slot
    fn prologue(&mut self) -> Result<(), DiffError> {
        let params = self.source.param_values();
        for (i, src) in params.iter().enumerate() {
            let new_param = self
                .b
                .param(i)
                .ok_or_else(|| DiffError::Internal(format!("missing parameter {}", i)))?;
            let primal = if self.activity.signature.is_differentiable(i) {
                let ty = self.source.signature.params[i].clone();
                self.b.push_op(Operation::PairPrimal { pair: new_param }, ty)
            } else {
                new_param
            };
            self.primals.insert(*src, primal);
        }
        if self.activity.signature.ret.is_some() {
            self.d_out = self.b.param(params.len());
        }

        let mut active: Vec<ValueId> = self.activity.witnesses.keys().copied().collect();
        active.sort();
        for v in active {
            let w = self.witness(v)?;
            let slot = self.b.add_local(&format!("adj_{}", v), w.differential.clone());
            let z = emit_zero(&mut self.b, &w);
            self.b.push_void(Operation::LocalSet { local: slot, value: z });
            self.adjoints.insert(v, slot);
        }
        Ok(())
    }

    fn push_checkpoint(&mut self, value: ValueId) {
        self.b.push_void(Operation::CheckpointPush { value });
    }

    fn replay_block(&mut self, id: BlockId) -> Result<(), DiffError> {
        let block = self.block(id)?;
        let target = self.mapped(&self.replay, id)?;
        self.b.switch_to(target);

        for inst in &block.instructions {
            self.b.set_span(inst.span);
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

            if self.needs_pullback(inst) == Some(OpClass::Nonlinear) {
                for v in checkpoint_operands(&inst.op) {
                    let pv = self.p(v)?;
                    self.push_checkpoint(pv);
                }
            }
        }
        self.b.set_span(None);

        let term = &block.terminator;
        if let Some(sel) = term.selector() {
            if self.edges_carry_adjoints(term)? {
                let ps = self.p(sel)?;
                self.push_checkpoint(ps);
            }
        }
        let idx = self.b.const_int(block_index(id));
        self.push_checkpoint(idx);

        let new_term = match term {
            Terminator::Return { .. } => Terminator::Goto {
                target: self.dispatch,
                args: vec![],
            },
            Terminator::Unreachable => Terminator::Unreachable,
            other => {
                let mut t = other.clone();
                let mut missing = None;
                t.map_operands(|v| match self.primals.get(&v) {
                    Some(p) => *p,
                    None => {
                        missing = Some(v);
                        v
                    }
                });
                if let Some(v) = missing {
                    return Err(DiffError::Internal(format!("{} used before definition", v)));
                }
                retarget(&mut t, &self.replay)?;
                t
            }
        };
        self.b.terminate(new_term);
        Ok(())
    }

    /// Class of an instruction whose result is active, if it needs a pullback
    fn needs_pullback(&self, inst: &Instruction) -> Option<OpClass> {
        let r = inst.result?;
        if !self.is_active(r) {
            return None;
        }
        Some(classify(&inst.op, self.module, ADMode::Reverse))
    }

    fn edges_carry_adjoints(&self, term: &Terminator) -> Result<bool, DiffError> {
        for (succ, _) in term.edges() {
            if self.block(succ)?.params.iter().any(|p| self.is_active(p.value)) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // =========================================================================
    // PULLBACK
    // =========================================================================

    fn adjoint_head(&mut self, id: BlockId) -> Result<(), DiffError> {
        let block = self.block(id)?;
        let head = self.mapped(&self.heads, id)?;
        let body = self.mapped(&self.bodies, id)?;
        self.b.switch_to(head);

        let to_body = Terminator::Goto {
            target: body,
            args: vec![],
        };
        match &block.terminator {
            Terminator::Return { value: Some(v) } => {
                if let (true, Some(d_out)) = (self.is_active(*v), self.d_out) {
                    self.accumulate(*v, d_out)?;
                }
                self.b.terminate(to_body);
            }
            Terminator::Goto { target, args } => {
                self.transfer(*target, args)?;
                self.b.terminate(to_body);
            }
            term @ (Terminator::Branch { .. } | Terminator::Switch { .. }) => {
                if !self.edges_carry_adjoints(term)? {
                    self.b.terminate(to_body);
                    return Ok(());
                }
                let sel_ty = match term.selector() {
                    Some(sel) => self.ty(sel)?,
                    None => MirType::Bool,
                };
                let sel = self.b.push_op(Operation::CheckpointPop, sel_ty);
                let label = block_label(block);

                let mut edge_blocks = Vec::new();
                for (k, (succ, args)) in term.edges().into_iter().enumerate() {
                    let e = self.b.create_named_block(&format!("pb_{}_edge{}", label, k));
                    self.b.switch_to(e);
                    self.transfer(succ, args)?;
                    self.b.terminate(Terminator::Goto {
                        target: body,
                        args: vec![],
                    });
                    edge_blocks.push(e);
                }

                self.b.switch_to(head);
                let reversed = match term {
                    Terminator::Branch { .. } => Terminator::Branch {
                        cond: sel,
                        then_block: edge_blocks[0],
                        then_args: vec![],
                        else_block: edge_blocks[1],
                        else_args: vec![],
                    },
                    Terminator::Switch { cases, .. } => Terminator::Switch {
                        value: sel,
                        default: edge_blocks[0],
                        default_args: vec![],
                        cases: cases
                            .iter()
                            .zip(&edge_blocks[1..])
                            .map(|((k, _, _), e)| (*k, *e, vec![]))
                            .collect(),
                    },
                    _ => unreachable!("matched branch or switch above"),
                };
                self.b.terminate(reversed);
            }
            Terminator::Return { value: None } | Terminator::Unreachable => {
                self.b.terminate(to_body);
            }
        }
        Ok(())
    }

    /// Move the adjoints of `target`'s parameters onto the edge arguments
    fn transfer(&mut self, target: BlockId, args: &[ValueId]) -> Result<(), DiffError> {
        let block = self.block(target)?;
        for (param, arg) in block.params.iter().zip(args) {
            let Some(&slot) = self.adjoints.get(&param.value) else {
                continue;
            };
            let w = self.witness(param.value)?;
            let g = self.b.push_op(Operation::LocalGet { local: slot }, w.differential.clone());
            if self.is_active(*arg) {
                self.accumulate(*arg, g)?;
            }
            let z = emit_zero(&mut self.b, &w);
            self.b.push_void(Operation::LocalSet { local: slot, value: z });
        }
        Ok(())
    }

    fn adjoint_body(&mut self, id: BlockId) -> Result<(), DiffError> {
        let block = self.block(id)?;
        let body = self.mapped(&self.bodies, id)?;
        self.b.switch_to(body);

        for inst in block.instructions.iter().rev() {
            let Some(class) = self.needs_pullback(inst) else {
                continue;
            };
            let Some(r) = inst.result else { continue };
            self.b.set_span(inst.span);

            let mut saved = HashMap::new();
            if class == OpClass::Nonlinear {
                for v in checkpoint_operands(&inst.op).into_iter().rev() {
                    let ty = self.ty(v)?;
                    saved.insert(v, self.b.push_op(Operation::CheckpointPop, ty));
                }
            }

            let w = self.witness(r)?;
            let slot = self.adjoints[&r];
            let g = self.b.push_op(Operation::LocalGet { local: slot }, w.differential.clone());
            trace!("{}: pullback of {} ({})", self.source.name, r, inst.op.name());
            self.pullback(inst, &w, g, &saved)?;

            let z = emit_zero(&mut self.b, &w);
            self.b.push_void(Operation::LocalSet { local: slot, value: z });
        }
        self.b.set_span(None);

        let next = if id.is_entry() { self.exit } else { self.dispatch };
        self.b.terminate(Terminator::Goto {
            target: next,
            args: vec![],
        });
        Ok(())
    }

    /// `adj[v] += contribution`, through the witness `add()`
    fn accumulate(&mut self, v: ValueId, contribution: ValueId) -> Result<(), DiffError> {
        let Some(&slot) = self.adjoints.get(&v) else {
            return Ok(());
        };
        let w = self.witness(v)?;
        let found = self
            .b
            .type_of(contribution)
            .cloned()
            .ok_or_else(|| DiffError::Internal(format!("untyped contribution {}", contribution)))?;
        if found != w.differential {
            return Err(DiffError::TypeMismatchInPullback {
                function: self.source.name.clone(),
                expected: w.differential.clone(),
                found,
            });
        }
        let cur = self.b.push_op(Operation::LocalGet { local: slot }, w.differential.clone());
        let sum = emit_add(&mut self.b, &w, cur, contribution);
        self.b.push_void(Operation::LocalSet { local: slot, value: sum });
        Ok(())
    }

    /// `adj[aggregate][index] += contribution` without materialising a zero aggregate
    fn accumulate_component(
        &mut self,
        aggregate: ValueId,
        slot_index: Result<usize, ValueId>,
        component: &DifferentialWitness,
        contribution: ValueId,
    ) -> Result<(), DiffError> {
        let Some(&slot) = self.adjoints.get(&aggregate) else {
            return Ok(());
        };
        let w = self.witness(aggregate)?;
        let found = self.b.type_of(contribution).cloned().unwrap_or(MirType::Void);
        if found != component.differential {
            return Err(DiffError::TypeMismatchInPullback {
                function: self.source.name.clone(),
                expected: component.differential.clone(),
                found,
            });
        }
        let d = w.differential.clone();
        let cd = component.differential.clone();
        let cur = self.b.push_op(Operation::LocalGet { local: slot }, d.clone());
        let new = match slot_index {
            Ok(index) => {
                let old = self.b.push_op(Operation::ExtractField { aggregate: cur, index }, cd);
                let sum = emit_add(&mut self.b, component, old, contribution);
                self.b.push_op(
                    Operation::InsertField {
                        aggregate: cur,
                        index,
                        value: sum,
                    },
                    d,
                )
            }
            Err(index) => {
                let old = self.b.push_op(Operation::ExtractElement { aggregate: cur, index }, cd);
                let sum = emit_add(&mut self.b, component, old, contribution);
                self.b.push_op(
                    Operation::InsertElement {
                        aggregate: cur,
                        index,
                        value: sum,
                    },
                    d,
                )
            }
        };
        self.b.push_void(Operation::LocalSet { local: slot, value: new });
        Ok(())
    }

    fn float_const(&mut self, value: f64, ty: &MirType) -> ValueId {
        self.b.const_float(value, ty.clone())
    }

    fn push(&mut self, op: Operation, ty: &MirType) -> ValueId {
        self.b.push_op(op, ty.clone())
    }

    /// Adjoint rule: transpose of the forward rule
    fn pullback(
        &mut self,
        inst: &Instruction,
        w: &Arc<DifferentialWitness>,
        g: ValueId,
        saved: &HashMap<ValueId, ValueId>,
    ) -> Result<(), DiffError> {
        let s = |v: &ValueId| {
            saved
                .get(v)
                .copied()
                .ok_or_else(|| DiffError::Internal(format!("{} was not checkpointed", v)))
        };
        let d = w.differential.clone();
        let ty = inst.ty.clone();

        match &inst.op {
            Operation::FAdd { lhs, rhs } => {
                self.accumulate(*lhs, g)?;
                self.accumulate(*rhs, g)?;
            }
            Operation::FSub { lhs, rhs } => {
                self.accumulate(*lhs, g)?;
                if self.is_active(*rhs) {
                    let n = self.push(Operation::FNeg { operand: g }, &d);
                    self.accumulate(*rhs, n)?;
                }
            }
            Operation::FNeg { operand } => {
                let n = self.push(Operation::FNeg { operand: g }, &d);
                self.accumulate(*operand, n)?;
            }

            // y = a*b: da += g*b, db += g*a
            Operation::FMul { lhs, rhs } => {
                let (a, b) = (s(lhs)?, s(rhs)?);
                if self.is_active(*lhs) {
                    let c = self.push(Operation::FMul { lhs: g, rhs: b }, &d);
                    self.accumulate(*lhs, c)?;
                }
                if self.is_active(*rhs) {
                    let c = self.push(Operation::FMul { lhs: g, rhs: a }, &d);
                    self.accumulate(*rhs, c)?;
                }
            }
            // y = a/b: da += g/b, db += -g*a/b^2
            Operation::FDiv { lhs, rhs } => {
                let (a, b) = (s(lhs)?, s(rhs)?);
                if self.is_active(*lhs) {
                    let c = self.push(Operation::FDiv { lhs: g, rhs: b }, &d);
                    self.accumulate(*lhs, c)?;
                }
                if self.is_active(*rhs) {
                    let ga = self.push(Operation::FMul { lhs: g, rhs: a }, &d);
                    let b2 = self.push(Operation::FMul { lhs: b, rhs: b }, &ty);
                    let q = self.push(Operation::FDiv { lhs: ga, rhs: b2 }, &d);
                    let c = self.push(Operation::FNeg { operand: q }, &d);
                    self.accumulate(*rhs, c)?;
                }
            }
            Operation::Sqrt { operand } => {
                let a = s(operand)?;
                let r = self.push(Operation::Sqrt { operand: a }, &ty);
                let half = self.float_const(0.5, &ty);
                let k = self.push(Operation::FDiv { lhs: half, rhs: r }, &ty);
                let c = self.push(Operation::FMul { lhs: g, rhs: k }, &d);
                self.accumulate(*operand, c)?;
            }
            Operation::Exp { operand } => {
                let a = s(operand)?;
                let r = self.push(Operation::Exp { operand: a }, &ty);
                let c = self.push(Operation::FMul { lhs: g, rhs: r }, &d);
                self.accumulate(*operand, c)?;
            }
            Operation::Log { operand } => {
                let a = s(operand)?;
                let c = self.push(Operation::FDiv { lhs: g, rhs: a }, &d);
                self.accumulate(*operand, c)?;
            }
            Operation::Sin { operand } => {
                let a = s(operand)?;
                let k = self.push(Operation::Cos { operand: a }, &ty);
                let c = self.push(Operation::FMul { lhs: g, rhs: k }, &d);
                self.accumulate(*operand, c)?;
            }
            Operation::Cos { operand } => {
                let a = s(operand)?;
                let k = self.push(Operation::Sin { operand: a }, &ty);
                let m = self.push(Operation::FMul { lhs: g, rhs: k }, &d);
                let c = self.push(Operation::FNeg { operand: m }, &d);
                self.accumulate(*operand, c)?;
            }
            Operation::Tanh { operand } => {
                let a = s(operand)?;
                let t = self.push(Operation::Tanh { operand: a }, &ty);
                let t2 = self.push(Operation::FMul { lhs: t, rhs: t }, &ty);
                let one = self.float_const(1.0, &ty);
                let k = self.push(Operation::FSub { lhs: one, rhs: t2 }, &ty);
                let c = self.push(Operation::FMul { lhs: g, rhs: k }, &d);
                self.accumulate(*operand, c)?;
            }
            // y = b^e: db += g*e*b^(e-1), de += g*y*ln(b)
            Operation::Pow { base, exp } => {
                let (b, e) = (s(base)?, s(exp)?);
                if self.is_active(*base) {
                    let one = self.float_const(1.0, &ty);
                    let em1 = self.push(Operation::FSub { lhs: e, rhs: one }, &ty);
                    let pw = self.push(Operation::Pow { base: b, exp: em1 }, &ty);
                    let k = self.push(Operation::FMul { lhs: e, rhs: pw }, &ty);
                    let c = self.push(Operation::FMul { lhs: g, rhs: k }, &d);
                    self.accumulate(*base, c)?;
                }
                if self.is_active(*exp) {
                    let r = self.push(Operation::Pow { base: b, exp: e }, &ty);
                    let ln = self.push(Operation::Log { operand: b }, &ty);
                    let k = self.push(Operation::FMul { lhs: r, rhs: ln }, &ty);
                    let c = self.push(Operation::FMul { lhs: g, rhs: k }, &d);
                    self.accumulate(*exp, c)?;
                }
            }
            Operation::Abs { operand } => {
                let a = s(operand)?;
                let k = self.push(Operation::Sign { operand: a }, &ty);
                let c = self.push(Operation::FMul { lhs: g, rhs: k }, &d);
                self.accumulate(*operand, c)?;
            }
            Operation::FMin { lhs, rhs } | Operation::FMax { lhs, rhs } => {
                let pred = if matches!(inst.op, Operation::FMin { .. }) {
                    FloatPredicate::OLt
                } else {
                    FloatPredicate::OGt
                };
                let (a, b) = (s(lhs)?, s(rhs)?);
                let c = self.push(
                    Operation::FCmp {
                        pred,
                        lhs: a,
                        rhs: b,
                    },
                    &ty.bool_like(),
                );
                self.routed(c, g, *lhs, *rhs, w)?;
            }
            Operation::Select {
                cond,
                then_val,
                else_val,
            } => {
                let c = s(cond)?;
                self.routed(c, g, *then_val, *else_val, w)?;
            }

            Operation::Splat { scalar } => {
                let ws = self.witness(*scalar)?;
                let c = self.push(Operation::Sum { operand: g }, &ws.differential);
                self.accumulate(*scalar, c)?;
            }
            Operation::Sum { operand } => {
                let wo = self.witness(*operand)?;
                let c = self.push(Operation::Splat { scalar: g }, &wo.differential);
                self.accumulate(*operand, c)?;
            }
            Operation::FConvert { operand, .. } => {
                let wo = self.witness(*operand)?;
                let c = self.push(
                    Operation::FConvert {
                        operand: g,
                        to: wo.differential.clone(),
                    },
                    &wo.differential,
                );
                self.accumulate(*operand, c)?;
            }
            // scatter each output lane back to the lane it was read from
            Operation::Swizzle { vector, lanes } => {
                if self.is_active(*vector) {
                    let wv = self.witness(*vector)?;
                    let lane_w = wv
                        .component(0)
                        .cloned()
                        .ok_or_else(|| DiffError::Internal(format!("swizzle of {}", wv.primal)))?;
                    for (j, lane) in lanes.iter().enumerate() {
                        let e = self.push(Operation::ExtractField { aggregate: g, index: j }, &lane_w.differential);
                        self.accumulate_component(*vector, Ok(*lane as usize), &lane_w, e)?;
                    }
                }
            }

            Operation::Aggregate { elements } => {
                for (i, e) in elements.iter().enumerate() {
                    if !self.is_active(*e) {
                        continue;
                    }
                    let Some(slot) = w.slot_of(i) else {
                        continue;
                    };
                    let we = self.witness(*e)?;
                    let c = self.push(Operation::ExtractField { aggregate: g, index: slot }, &we.differential);
                    self.accumulate(*e, c)?;
                }
            }
            Operation::ExtractField { aggregate, index } => {
                let wa = self.witness(*aggregate)?;
                let slot = wa.slot_of(*index)
                    .ok_or_else(|| DiffError::Internal(format!("component {} of {} is dropped", index, wa.primal)))?;
                let comp = wa
                    .component(*index)
                    .cloned()
                    .ok_or_else(|| DiffError::Internal(format!("component {} of {}", index, wa.primal)))?;
                self.accumulate_component(*aggregate, Ok(slot), &comp, g)?;
            }
            Operation::InsertField {
                aggregate,
                index,
                value,
            } => match (w.slot_of(*index), w.component(*index).cloned()) {
                (Some(slot), Some(comp)) => {
                    if self.is_active(*value) {
                        let c = self.push(Operation::ExtractField { aggregate: g, index: slot }, &comp.differential);
                        self.accumulate(*value, c)?;
                    }
                    if self.is_active(*aggregate) {
                        let z = emit_zero(&mut self.b, &comp);
                        let c = self.push(
                            Operation::InsertField {
                                aggregate: g,
                                index: slot,
                                value: z,
                            },
                            &d,
                        );
                        self.accumulate(*aggregate, c)?;
                    }
                }
                _ => self.accumulate(*aggregate, g)?,
            },
            Operation::ExtractElement { aggregate, index } => {
                let i = s(index)?;
                let wa = self.witness(*aggregate)?;
                let comp = wa
                    .component(0)
                    .cloned()
                    .ok_or_else(|| DiffError::Internal(format!("dynamic index into {}", wa.primal)))?;
                self.accumulate_component(*aggregate, Err(i), &comp, g)?;
            }
            Operation::InsertElement {
                aggregate,
                index,
                value,
            } => {
                let i = s(index)?;
                let comp = w
                    .component(0)
                    .cloned()
                    .ok_or_else(|| DiffError::Internal(format!("dynamic index into {}", w.primal)))?;
                if self.is_active(*value) {
                    let c = self.push(Operation::ExtractElement { aggregate: g, index: i }, &comp.differential);
                    self.accumulate(*value, c)?;
                }
                if self.is_active(*aggregate) {
                    let z = emit_zero(&mut self.b, &comp);
                    let c = self.push(
                        Operation::InsertElement {
                            aggregate: g,
                            index: i,
                            value: z,
                        },
                        &d,
                    );
                    self.accumulate(*aggregate, c)?;
                }
            }

            Operation::Call { callee, args, .. } => self.call_pullback(inst, callee, args, g, saved)?,

            other => {
                return Err(DiffError::Internal(format!(
                    "no adjoint rule for active `{}` in {}",
                    other.name(),
                    self.source.name
                )))
            }
        }
        Ok(())
    }

    /// `g` goes to `a` where `cond` holds and to `b` elsewhere
    fn routed(
        &mut self,
        cond: ValueId,
        g: ValueId,
        a: ValueId,
        b: ValueId,
        w: &DifferentialWitness,
    ) -> Result<(), DiffError> {
        let z = emit_zero(&mut self.b, w);
        if self.is_active(a) {
            let c = self.push(
                Operation::Select {
                    cond,
                    then_val: g,
                    else_val: z,
                },
                &w.differential,
            );
            self.accumulate(a, c)?;
        }
        if self.is_active(b) {
            let c = self.push(
                Operation::Select {
                    cond,
                    then_val: z,
                    else_val: g,
                },
                &w.differential,
            );
            self.accumulate(b, c)?;
        }
        Ok(())
    }

    /// Call the callee's backward derivative with zero-seeded pairs and
    /// scatter the returned gradients onto the arguments
    fn call_pullback(
        &mut self,
        inst: &Instruction,
        callee: &Callee,
        args: &[ValueId],
        g: ValueId,
        saved: &HashMap<ValueId, ValueId>,
    ) -> Result<(), DiffError> {
        let s = |v: &ValueId| {
            saved
                .get(v)
                .copied()
                .ok_or_else(|| DiffError::Internal(format!("{} was not checkpointed", v)))
        };
        let module: &'a MirModule = self.module;
        let target_name = callee_targets(module, callee)
            .into_iter()
            .next()
            .ok_or_else(|| DiffError::Internal(format!("call in {} has no target", self.source.name)))?;
        let target = module
            .get_function(&target_name)
            .ok_or_else(|| DiffError::Internal(format!("callee `{}` not found", target_name)))?;
        let sw = SignatureWitnesses::resolve(target, module, self.max_depth)?;

        let new_callee = match callee {
            Callee::Direct(_) | Callee::Witness { .. } => {
                Callee::Direct(derived_name(module, &target_name, ADMode::Reverse))
            }
            Callee::Dynamic {
                witness,
                interface,
                requirement,
            } => Callee::Dynamic {
                witness: s(witness)?,
                interface: interface.clone(),
                requirement: requirement_key(requirement, ADMode::Reverse),
            },
        };

        let mut call_args = Vec::with_capacity(args.len() + 1);
        for (i, arg) in args.iter().enumerate() {
            let pa = s(arg)?;
            match sw.params.get(i).and_then(|w| w.clone()) {
                Some(pw) => {
                    let z = emit_zero(&mut self.b, &pw);
                    let ty = pair_type(&target.signature.params[i], Some(&*pw));
                    call_args.push(self.push(
                        Operation::MakePair {
                            primal: pa,
                            differential: z,
                        },
                        &ty,
                    ));
                }
                None => call_args.push(pa),
            }
        }
        if sw.ret.is_some() {
            call_args.push(g);
        }

        // a user-supplied derivative is trusted for its declared result only
        let ret_ty = match &new_callee {
            Callee::Direct(name) => module
                .get_function(name)
                .map(|f| f.signature.return_type.clone())
                .unwrap_or_else(|| reverse_result_type(target, &sw)),
            _ => reverse_result_type(target, &sw),
        };
        let grads = self.push(
            Operation::Call {
                callee: new_callee,
                args: call_args,
                ret_ty: ret_ty.clone(),
                no_diff: false,
            },
            &ret_ty,
        );
        trace!("{}: pullback through {} for {:?}", self.source.name, target_name, inst.result);

        let mut k = 0;
        for (i, arg) in args.iter().enumerate() {
            let Some(pw) = sw.params.get(i).and_then(|w| w.clone()) else {
                continue;
            };
            let pty = match &ret_ty {
                MirType::Tuple { elements } => elements.get(k).cloned(),
                _ => None,
            }
            .unwrap_or_else(|| pair_type(&target.signature.params[i], Some(&*pw)));
            let dty = match &pty {
                MirType::DiffPair { differential, .. } => (**differential).clone(),
                other => other.clone(),
            };
            if self.is_active(*arg) {
                let pair = self.push(Operation::ExtractField { aggregate: grads, index: k }, &pty);
                let dx = self.push(Operation::PairDiff { pair }, &dty);
                self.accumulate(*arg, dx)?;
            }
            k += 1;
        }
        Ok(())
    }

    /// Pack `(DiffPair<Xi, dXi>, ..)` and return
    fn epilogue(&mut self) -> Result<(), DiffError> {
        self.b.switch_to(self.exit);
        let params = self.source.param_values();
        let mut pairs = Vec::new();
        for (i, src) in params.iter().enumerate() {
            let Some(w) = self.activity.signature.params.get(i).and_then(|w| w.clone()) else {
                continue;
            };
            let primal = self.p(*src)?;
            let grad = if self.activity.active_params.contains(&i) {
                let slot = *self
                    .adjoints
                    .get(src)
                    .ok_or_else(|| DiffError::Internal(format!("active parameter {} has no adjoint", i)))?;
                self.push(Operation::LocalGet { local: slot }, &w.differential)
            } else {
                emit_zero(&mut self.b, &w)
            };
            let ty = pair_type(&self.source.signature.params[i], Some(&*w));
            pairs.push(self.push(
                Operation::MakePair {
                    primal,
                    differential: grad,
                },
                &ty,
            ));
        }
        let ret_ty = reverse_result_type(self.source, &self.activity.signature);
        let out = self.push(Operation::Aggregate { elements: pairs }, &ret_ty);
        self.b.terminate(Terminator::Return { value: Some(out) });
        Ok(())
    }
}

fn block_label(block: &BasicBlock) -> String {
    match &block.name {
        Some(name) => name.clone(),
        None => format!("bb{}", block.id.0),
    }
}

/// Value recorded on the log to identify a block
fn block_index(id: BlockId) -> i64 {
    i64::from(id.0)
}

fn retarget(term: &mut Terminator, map: &HashMap<BlockId, BlockId>) -> Result<(), DiffError> {
    let look = |b: &mut BlockId| -> Result<(), DiffError> {
        *b = *map
            .get(b)
            .ok_or_else(|| DiffError::Internal(format!("edge to unreplayed {}", b)))?;
        Ok(())
    };
    match term {
        Terminator::Goto { target, .. } => look(target),
        Terminator::Branch {
            then_block,
            else_block,
            ..
        } => {
            look(then_block)?;
            look(else_block)
        }
        Terminator::Switch { default, cases, .. } => {
            look(default)?;
            for (_, target, _) in cases.iter_mut() {
                look(target)?;
            }
            Ok(())
        }
        Terminator::Return { .. } | Terminator::Unreachable => Ok(()),
    }
}
