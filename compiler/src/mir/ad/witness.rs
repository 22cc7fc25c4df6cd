//! Differential type synthesis
//!
//! Every type reachable from a differentiable signature gets a
//! [`DifferentialWitness`]: its differential type plus `zero()` and `add()`.
//! Witnesses are synthesized structurally and memoized per structural type
//! in a [`WitnessCache`] owned by the module, so two occurrences of the same
//! concrete type always resolve to the same `Arc`.
//!
//! | Primal                    | Differential                      | zero / add         |
//! |---------------------------|-----------------------------------|--------------------|
//! | `f32`, `f64`              | same                              | intrinsic          |
//! | `vec<T,N>`, `mat<T,R,C>`  | same (float elements only)        | intrinsic          |
//! | `[T; N]`                  | `[D(T); N]`                       | intrinsic or helper|
//! | struct with conformance   | the declared type                 | declared functions |
//! | other struct, tuple       | `S.Differential` / tuple of D(fi) | helpers            |
//! | int, bool, resource, ...  | none (constant)                   |                    |

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use log::{debug, trace};

use super::diagnostics::DiffError;
use crate::mir::block::Terminator;
use crate::mir::function::{FunctionBuilder, FunctionSignature, MirFunction};
use crate::mir::inst::{Callee, Operation};
use crate::mir::module::{MirModule, TypeDef};
use crate::mir::types::{MirType, StructField};
use crate::mir::value::ValueId;

/// How a witness operation is realised
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WitnessOp {
    /// `ZeroInit` for zero, componentwise `FAdd` for add
    Intrinsic,
    /// Call to a function in the module
    Function(String),
}

/// Why a product component has no slot in the differential
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// Marked `no_diff`
    NoDiff,
    /// The component type carries no derivative (int, bool, resource, ...)
    Constant,
    /// The component type should be differentiable but has no witness
    NoWitness(String),
}

/// One component of a struct or tuple
#[derive(Clone, Debug)]
pub struct FieldSlot {
    pub name: String,
    /// Index in the differential aggregate
    pub slot: Option<usize>,
    pub witness: Option<Arc<DifferentialWitness>>,
    pub dropped: Option<DropReason>,
}

#[derive(Clone, Debug)]
pub enum WitnessKind {
    Scalar,
    /// Vector lanes or matrix rows share one component witness
    Componentwise { component: Arc<DifferentialWitness> },
    Array { element: Arc<DifferentialWitness> },
    /// Auto-derived struct or tuple
    Product { fields: Vec<FieldSlot> },
    /// User-declared conformance
    Declared,
}

/// A type's differential and its `zero()`/`add()` operations
#[derive(Debug)]
pub struct DifferentialWitness {
    /// Unique per cache; equal ids mean the same witness
    pub id: u32,
    pub primal: MirType,
    pub differential: MirType,
    pub kind: WitnessKind,
    pub zero: WitnessOp,
    pub add: WitnessOp,
}

impl DifferentialWitness {
    /// Slot of a product component in the differential, if it has one
    pub fn field_slot(&self, index: usize) -> Option<&FieldSlot> {
        match &self.kind {
            WitnessKind::Product { fields } => fields.get(index),
            _ => None,
        }
    }

    /// Position of component `index` inside the differential, if it has one
    pub fn slot_of(&self, index: usize) -> Option<usize> {
        match &self.kind {
            WitnessKind::Product { fields } => fields.get(index).and_then(|f| f.slot),
            WitnessKind::Componentwise { .. } | WitnessKind::Array { .. } => Some(index),
            WitnessKind::Scalar | WitnessKind::Declared => None,
        }
    }

    /// Witness of the value found at a constant index of this type
    pub fn component(&self, index: usize) -> Option<&Arc<DifferentialWitness>> {
        match &self.kind {
            WitnessKind::Componentwise { component } => Some(component),
            WitnessKind::Array { element } => Some(element),
            WitnessKind::Product { fields } => fields.get(index).and_then(|f| f.witness.as_ref()),
            WitnessKind::Scalar | WitnessKind::Declared => None,
        }
    }

    pub fn is_product(&self) -> bool {
        matches!(self.kind, WitnessKind::Product { .. })
    }
}

type Entry = Option<Arc<DifferentialWitness>>;

/// Module-owned, concurrently shared witness memo
#[derive(Debug, Default)]
pub struct WitnessCache {
    entries: RwLock<HashMap<MirType, Entry>>,
    helper_functions: Mutex<Vec<MirFunction>>,
    derived_types: Mutex<Vec<TypeDef>>,
    next_id: AtomicU32,
}

/// Helpers produced while synthesizing one witness
#[derive(Default)]
struct Synthesized {
    functions: Vec<MirFunction>,
    types: Vec<TypeDef>,
}

impl WitnessCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached types, including constant ones
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached result for a type, without synthesizing
    pub fn lookup(&self, ty: &MirType) -> Option<Entry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(ty)
            .cloned()
    }

    /// Witness for `ty`. `Ok(None)` means the type is a constant for
    /// differentiation purposes.
    pub fn synthesize(
        &self,
        ty: &MirType,
        module: &MirModule,
        max_depth: usize,
    ) -> Result<Entry, DiffError> {
        self.synthesize_at(ty, module, 0, max_depth)
    }

    fn synthesize_at(
        &self,
        ty: &MirType,
        module: &MirModule,
        depth: usize,
        max_depth: usize,
    ) -> Result<Entry, DiffError> {
        if let Some(hit) = self.lookup(ty) {
            return Ok(hit);
        }
        if depth > max_depth {
            return Err(DiffError::ExpansionTooDeep {
                limit: max_depth,
                at: format!("differential of {}", ty),
                location: None,
            });
        }

        let mut extra = Synthesized::default();
        let built = self.build(ty, module, depth, max_depth, &mut extra)?;

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = entries.get(ty) {
            // another thread won the race; its helpers are already queued
            return Ok(existing.clone());
        }
        entries.insert(ty.clone(), built.clone());
        drop(entries);

        if let Some(w) = &built {
            debug!("witness #{} for {} -> {}", w.id, ty, w.differential);
        }
        self.helper_functions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(extra.functions);
        self.derived_types
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(extra.types);
        Ok(built)
    }

    fn make(
        &self,
        primal: &MirType,
        differential: MirType,
        kind: WitnessKind,
        zero: WitnessOp,
        add: WitnessOp,
    ) -> Arc<DifferentialWitness> {
        Arc::new(DifferentialWitness {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            primal: primal.clone(),
            differential,
            kind,
            zero,
            add,
        })
    }

    fn build(
        &self,
        ty: &MirType,
        module: &MirModule,
        depth: usize,
        max_depth: usize,
        extra: &mut Synthesized,
    ) -> Result<Entry, DiffError> {
        trace!("synthesizing differential of {}", ty);
        match ty {
            MirType::F32 | MirType::F64 => Ok(Some(self.make(
                ty,
                ty.clone(),
                WitnessKind::Scalar,
                WitnessOp::Intrinsic,
                WitnessOp::Intrinsic,
            ))),

            MirType::Vector { element, .. } | MirType::Matrix { element, .. } => {
                if !element.is_float() {
                    return Ok(None);
                }
                let component_ty = ty.component_type(0).ok_or_else(|| {
                    DiffError::Internal(format!("empty composite type {}", ty))
                })?;
                let component = self
                    .synthesize_at(&component_ty, module, depth + 1, max_depth)?
                    .ok_or_else(|| DiffError::Internal(format!("float composite {} has constant components", ty)))?;
                Ok(Some(self.make(
                    ty,
                    ty.clone(),
                    WitnessKind::Componentwise { component },
                    WitnessOp::Intrinsic,
                    WitnessOp::Intrinsic,
                )))
            }

            MirType::Array { element, size } => {
                let Some(elem) = self.synthesize_at(element, module, depth + 1, max_depth)? else {
                    return Ok(None);
                };
                let differential = MirType::array(elem.differential.clone(), *size);
                let zero = match elem.zero {
                    WitnessOp::Intrinsic => WitnessOp::Intrinsic,
                    WitnessOp::Function(_) => {
                        let name = zero_helper_name(ty);
                        extra.functions.push(array_zero_helper(&name, &differential, &elem, *size));
                        WitnessOp::Function(name)
                    }
                };
                let add = match elem.add {
                    WitnessOp::Intrinsic => WitnessOp::Intrinsic,
                    WitnessOp::Function(_) => {
                        let name = add_helper_name(ty);
                        extra.functions.push(array_add_helper(&name, &differential, &elem, *size));
                        WitnessOp::Function(name)
                    }
                };
                Ok(Some(self.make(
                    ty,
                    differential,
                    WitnessKind::Array { element: elem },
                    zero,
                    add,
                )))
            }

            MirType::Struct { name, fields } => {
                if let Some(conf) = module.conformance_for(ty) {
                    return self.declared(ty, name, conf, module).map(Some);
                }
                let components: Vec<(String, MirType, bool)> = fields
                    .iter()
                    .map(|f| (f.name.clone(), f.ty.clone(), f.no_diff))
                    .collect();
                self.product(ty, Some(name.as_str()), &components, module, depth, max_depth, extra)
            }

            MirType::Tuple { elements } => {
                let components: Vec<(String, MirType, bool)> = elements
                    .iter()
                    .enumerate()
                    .map(|(i, t)| (i.to_string(), t.clone(), false))
                    .collect();
                self.product(ty, None, &components, module, depth, max_depth, extra)
            }

            MirType::Void
            | MirType::Bool
            | MirType::I32
            | MirType::U32
            | MirType::DiffPair { .. }
            | MirType::Resource { .. }
            | MirType::Witness { .. } => Ok(None),
        }
    }

    fn declared(
        &self,
        ty: &MirType,
        name: &str,
        conf: &crate::mir::module::DiffConformance,
        module: &MirModule,
    ) -> Result<Arc<DifferentialWitness>, DiffError> {
        let missing = |reason: String| DiffError::MissingDifferentialWitness {
            ty: ty.clone(),
            reason,
            location: None,
        };

        let zero = module
            .get_function(&conf.zero_fn)
            .ok_or_else(|| missing(format!("declared zero `{}` of `{}` does not exist", conf.zero_fn, name)))?;
        if !zero.signature.params.is_empty() || zero.signature.return_type != conf.differential {
            return Err(missing(format!(
                "declared zero `{}` must have type () -> {}",
                conf.zero_fn, conf.differential
            )));
        }

        let add = module
            .get_function(&conf.add_fn)
            .ok_or_else(|| missing(format!("declared add `{}` of `{}` does not exist", conf.add_fn, name)))?;
        let d = &conf.differential;
        if add.signature.params != [d.clone(), d.clone()] || &add.signature.return_type != d {
            return Err(missing(format!(
                "declared add `{}` must have type ({}, {}) -> {}",
                conf.add_fn, d, d, d
            )));
        }

        Ok(self.make(
            ty,
            conf.differential.clone(),
            WitnessKind::Declared,
            WitnessOp::Function(conf.zero_fn.clone()),
            WitnessOp::Function(conf.add_fn.clone()),
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn product(
        &self,
        ty: &MirType,
        struct_name: Option<&str>,
        components: &[(String, MirType, bool)],
        module: &MirModule,
        depth: usize,
        max_depth: usize,
        extra: &mut Synthesized,
    ) -> Result<Entry, DiffError> {
        let mut slots = Vec::with_capacity(components.len());
        let mut diff_fields = Vec::new();

        for (name, field_ty, no_diff) in components {
            let (witness, dropped) = if *no_diff {
                (None, Some(DropReason::NoDiff))
            } else {
                match self.synthesize_at(field_ty, module, depth + 1, max_depth) {
                    Ok(Some(w)) => (Some(w), None),
                    Ok(None) => (None, Some(DropReason::Constant)),
                    Err(DiffError::MissingDifferentialWitness { reason, .. }) => {
                        (None, Some(DropReason::NoWitness(reason)))
                    }
                    Err(e) => return Err(e),
                }
            };
            let slot = witness.as_ref().map(|w| {
                diff_fields.push((name.clone(), w.differential.clone()));
                diff_fields.len() - 1
            });
            slots.push(FieldSlot {
                name: name.clone(),
                slot,
                witness,
                dropped,
            });
        }

        if diff_fields.is_empty() {
            return Ok(None);
        }

        let differential = match struct_name {
            Some(name) => {
                let d_name = format!("{}.Differential", name);
                let d_ty = MirType::structure(
                    &d_name,
                    diff_fields
                        .iter()
                        .map(|(n, t)| StructField::new(n, t.clone()))
                        .collect(),
                );
                extra.types.push(TypeDef::new(&d_name, d_ty.clone()));
                d_ty
            }
            None => MirType::tuple(diff_fields.iter().map(|(_, t)| t.clone()).collect()),
        };

        let sub: Vec<Arc<DifferentialWitness>> =
            slots.iter().filter_map(|s| s.witness.clone()).collect();

        let zero = if sub.iter().all(|w| w.zero == WitnessOp::Intrinsic) {
            WitnessOp::Intrinsic
        } else {
            let name = zero_helper_name(ty);
            extra.functions.push(product_zero_helper(&name, &differential, &sub));
            WitnessOp::Function(name)
        };
        let add_name = add_helper_name(ty);
        extra.functions.push(product_add_helper(&add_name, &differential, &sub));

        Ok(Some(self.make(
            ty,
            differential,
            WitnessKind::Product { fields: slots },
            zero,
            WitnessOp::Function(add_name),
        )))
    }

    /// Every `zero`/`add` helper synthesized so far. Registration skips
    /// names the module already has, so this can be replayed.
    pub fn helper_functions(&self) -> Vec<MirFunction> {
        self.helper_functions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Every derived differential struct synthesized so far
    pub fn derived_types(&self) -> Vec<TypeDef> {
        self.derived_types
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub fn zero_helper_name(ty: &MirType) -> String {
    format!("__dzero_{}", ty.mangle())
}

pub fn add_helper_name(ty: &MirType) -> String {
    format!("__dadd_{}", ty.mangle())
}

// =============================================================================
// EMISSION
// =============================================================================

/// Emit `zero()` of a witness at the builder's insertion point
pub fn emit_zero(b: &mut FunctionBuilder, w: &DifferentialWitness) -> ValueId {
    match &w.zero {
        WitnessOp::Intrinsic => b.push_op(
            Operation::ZeroInit {
                ty: w.differential.clone(),
            },
            w.differential.clone(),
        ),
        WitnessOp::Function(name) => b.push_op(
            Operation::Call {
                callee: Callee::Direct(name.clone()),
                args: vec![],
                ret_ty: w.differential.clone(),
                no_diff: true,
            },
            w.differential.clone(),
        ),
    }
}

/// Emit `add(lhs, rhs)` of a witness at the builder's insertion point
pub fn emit_add(b: &mut FunctionBuilder, w: &DifferentialWitness, lhs: ValueId, rhs: ValueId) -> ValueId {
    match &w.add {
        WitnessOp::Intrinsic => b.push_op(Operation::FAdd { lhs, rhs }, w.differential.clone()),
        WitnessOp::Function(name) => b.push_op(
            Operation::Call {
                callee: Callee::Direct(name.clone()),
                args: vec![lhs, rhs],
                ret_ty: w.differential.clone(),
                no_diff: true,
            },
            w.differential.clone(),
        ),
    }
}

fn product_zero_helper(name: &str, differential: &MirType, fields: &[Arc<DifferentialWitness>]) -> MirFunction {
    let mut b = FunctionBuilder::new(name, FunctionSignature::new(vec![], differential.clone()));
    let parts: Vec<ValueId> = fields.iter().map(|w| emit_zero(&mut b, w)).collect();
    let agg = b.push_op(Operation::Aggregate { elements: parts }, differential.clone());
    b.terminate(Terminator::Return { value: Some(agg) });
    b.build()
}

fn product_add_helper(name: &str, differential: &MirType, fields: &[Arc<DifferentialWitness>]) -> MirFunction {
    let sig = FunctionSignature::new(vec![differential.clone(), differential.clone()], differential.clone())
        .with_names(vec!["a".into(), "b".into()]);
    let mut b = FunctionBuilder::new(name, sig);
    let (a, c) = (b.param(0), b.param(1));
    let (Some(a), Some(c)) = (a, c) else {
        return b.build();
    };
    let mut parts = Vec::with_capacity(fields.len());
    for (i, w) in fields.iter().enumerate() {
        let x = b.push_op(Operation::ExtractField { aggregate: a, index: i }, w.differential.clone());
        let y = b.push_op(Operation::ExtractField { aggregate: c, index: i }, w.differential.clone());
        parts.push(emit_add(&mut b, w, x, y));
    }
    let agg = b.push_op(Operation::Aggregate { elements: parts }, differential.clone());
    b.terminate(Terminator::Return { value: Some(agg) });
    b.build()
}

fn array_zero_helper(name: &str, differential: &MirType, elem: &DifferentialWitness, size: usize) -> MirFunction {
    let mut b = FunctionBuilder::new(name, FunctionSignature::new(vec![], differential.clone()));
    let z = emit_zero(&mut b, elem);
    let agg = b.push_op(
        Operation::Aggregate {
            elements: vec![z; size],
        },
        differential.clone(),
    );
    b.terminate(Terminator::Return { value: Some(agg) });
    b.build()
}

fn array_add_helper(name: &str, differential: &MirType, elem: &DifferentialWitness, size: usize) -> MirFunction {
    let sig = FunctionSignature::new(vec![differential.clone(), differential.clone()], differential.clone())
        .with_names(vec!["a".into(), "b".into()]);
    let mut b = FunctionBuilder::new(name, sig);
    let (Some(a), Some(c)) = (b.param(0), b.param(1)) else {
        return b.build();
    };
    let mut acc = a;
    for i in 0..size {
        let x = b.push_op(Operation::ExtractField { aggregate: a, index: i }, elem.differential.clone());
        let y = b.push_op(Operation::ExtractField { aggregate: c, index: i }, elem.differential.clone());
        let s = emit_add(&mut b, elem, x, y);
        acc = b.push_op(
            Operation::InsertField {
                aggregate: acc,
                index: i,
                value: s,
            },
            differential.clone(),
        );
    }
    b.terminate(Terminator::Return { value: Some(acc) });
    b.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::module::{DiffConformance, ModuleBuilder};
    use crate::mir::types::ResourceKind;

    const DEPTH: usize = 64;

    fn vertex() -> MirType {
        MirType::structure(
            "Vertex",
            vec![
                StructField::new("color", MirType::vector(MirType::F32, 3)),
                StructField::no_diff("density", MirType::F32),
                StructField::new("id", MirType::I32),
            ],
        )
    }

    #[test]
    fn test_scalar_and_componentwise() {
        let module = MirModule::new("t");
        let cache = WitnessCache::new();

        let w = cache.synthesize(&MirType::F32, &module, DEPTH).unwrap().unwrap();
        assert_eq!(w.differential, MirType::F32);
        assert_eq!(w.zero, WitnessOp::Intrinsic);

        let m = MirType::matrix(MirType::F32, 2, 2);
        let wm = cache.synthesize(&m, &module, DEPTH).unwrap().unwrap();
        assert_eq!(wm.differential, m);
        assert!(matches!(wm.kind, WitnessKind::Componentwise { .. }));
    }

    #[test]
    fn test_identity_memoization() {
        let module = MirModule::new("t");
        let cache = WitnessCache::new();
        let a = cache
            .synthesize(&MirType::vector(MirType::F32, 3), &module, DEPTH)
            .unwrap()
            .unwrap();
        let b = cache
            .synthesize(&MirType::vector(MirType::F32, 3), &module, DEPTH)
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn test_constants_have_no_witness() {
        let module = MirModule::new("t");
        let cache = WitnessCache::new();
        for ty in [
            MirType::I32,
            MirType::Bool,
            MirType::vector(MirType::I32, 4),
            MirType::resource(ResourceKind::RWBuffer, MirType::F32),
        ] {
            assert!(cache.synthesize(&ty, &module, DEPTH).unwrap().is_none(), "{}", ty);
        }
        // negative results are cached too
        assert_eq!(cache.lookup(&MirType::I32).map(|e| e.is_none()), Some(true));
    }

    #[test]
    fn test_derived_struct_drops_fields() {
        let module = MirModule::new("t");
        let cache = WitnessCache::new();
        let w = cache.synthesize(&vertex(), &module, DEPTH).unwrap().unwrap();

        match &w.differential {
            MirType::Struct { name, fields } => {
                assert_eq!(name, "Vertex.Differential");
                assert_eq!(fields.len(), 1);
                assert_eq!(fields[0].name, "color");
            }
            other => panic!("unexpected differential {}", other),
        }
        assert_eq!(w.field_slot(0).and_then(|s| s.slot), Some(0));
        assert_eq!(w.field_slot(1).and_then(|s| s.dropped.clone()), Some(DropReason::NoDiff));
        assert_eq!(w.field_slot(2).and_then(|s| s.dropped.clone()), Some(DropReason::Constant));

        let helpers = cache.helper_functions();
        assert!(helpers.iter().any(|f| f.name == add_helper_name(&vertex())));
        assert!(helpers.iter().all(|f| f.validate().is_ok()));
        assert_eq!(cache.derived_types().len(), 1);
    }

    #[test]
    fn test_struct_with_only_constants_is_constant() {
        let module = MirModule::new("t");
        let cache = WitnessCache::new();
        let ty = MirType::structure(
            "Handle",
            vec![
                StructField::new("index", MirType::U32),
                StructField::new("buf", MirType::resource(ResourceKind::Buffer, MirType::F32)),
            ],
        );
        assert!(cache.synthesize(&ty, &module, DEPTH).unwrap().is_none());
    }

    #[test]
    fn test_declared_conformance() {
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
        let module = mb.build();
        let cache = WitnessCache::new();
        let w = cache.synthesize(&light, &module, DEPTH).unwrap().unwrap();
        assert!(matches!(w.kind, WitnessKind::Declared));
        assert_eq!(w.add, WitnessOp::Function("light_add".into()));
    }

    #[test]
    fn test_broken_conformance_is_missing_witness() {
        let light = MirType::structure("Light", vec![StructField::new("i", MirType::F32)]);
        let mut mb = ModuleBuilder::new("t");
        mb.conforming_type(
            "Light",
            light.clone(),
            DiffConformance {
                differential: MirType::F32,
                zero_fn: "nope".into(),
                add_fn: "nope_add".into(),
            },
        );
        let module = mb.build();
        let cache = WitnessCache::new();
        let err = cache.synthesize(&light, &module, DEPTH).unwrap_err();
        assert!(matches!(err, DiffError::MissingDifferentialWitness { .. }));

        // a struct embedding it drops the field with the reason recorded
        let outer = MirType::structure(
            "Scene",
            vec![
                StructField::new("light", light),
                StructField::new("exposure", MirType::F32),
            ],
        );
        let w = cache.synthesize(&outer, &module, DEPTH).unwrap().unwrap();
        assert!(matches!(
            w.field_slot(0).and_then(|s| s.dropped.clone()),
            Some(DropReason::NoWitness(_))
        ));
        assert_eq!(w.field_slot(1).and_then(|s| s.slot), Some(0));
    }

    #[test]
    fn test_array_of_structs_uses_helpers() {
        let module = MirModule::new("t");
        let cache = WitnessCache::new();
        let ty = MirType::array(vertex(), 4);
        let w = cache.synthesize(&ty, &module, DEPTH).unwrap().unwrap();
        assert_eq!(w.add, WitnessOp::Function(add_helper_name(&ty)));
        // zero of the element is intrinsic, so the array's is too
        assert_eq!(w.zero, WitnessOp::Intrinsic);

        let floats = MirType::array(MirType::F32, 4);
        let wf = cache.synthesize(&floats, &module, DEPTH).unwrap().unwrap();
        assert_eq!(wf.add, WitnessOp::Intrinsic);
    }

    #[test]
    fn test_depth_bound() {
        let module = MirModule::new("t");
        let cache = WitnessCache::new();
        let mut ty = MirType::F32;
        for _ in 0..10 {
            ty = MirType::array(ty, 2);
        }
        let err = cache.synthesize(&ty, &module, 4).unwrap_err();
        assert!(matches!(err, DiffError::ExpansionTooDeep { limit: 4, .. }));
    }

    #[test]
    fn test_concurrent_synthesis_shares_instance() {
        let module = MirModule::new("t");
        let cache = WitnessCache::new();
        let ty = MirType::array(vertex(), 8);

        let ids: Vec<u32> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| cache.synthesize(&ty, &module, DEPTH).unwrap().unwrap().id))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(ids.windows(2).all(|w| w[0] == w[1]));

        let helpers = cache.helper_functions();
        let add_name = add_helper_name(&ty);
        assert_eq!(helpers.iter().filter(|f| f.name == add_name).count(), 1);
    }
}
