//! Reference evaluator for MIR
//!
//! Executes MIR functions directly. Used by the test suite to check derived
//! functions numerically and by drivers for constant evaluation. Floats are
//! evaluated in double precision regardless of their declared width.
//!
//! Each call frame owns its own checkpoint log. A frame that returns with
//! records still on the log, pops an empty log, or pops a record of the
//! wrong type is an error, so a successful run of a reverse-mode function
//! proves its pushes and pops were balanced and in stack order.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use log::trace;

use super::block::Terminator;
use super::function::MirFunction;
use super::inst::{Callee, FloatPredicate, Instruction, IntPredicate, Operation};
use super::module::MirModule;
use super::types::MirType;
use super::value::{BlockId, ValueId};

/// Runtime value
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    /// Struct fields, tuple/array elements, vector lanes, matrix rows, or
    /// the (primal, differential) halves of a pair
    Aggregate(Vec<Value>),
    /// Shared buffer contents
    Resource(Rc<RefCell<Vec<Value>>>),
    /// Witness table, by name
    Witness(String),
    Void,
}

impl Value {
    pub fn floats(values: &[f64]) -> Value {
        Value::Aggregate(values.iter().map(|v| Value::Float(*v)).collect())
    }

    pub fn matrix(rows: &[&[f64]]) -> Value {
        Value::Aggregate(rows.iter().map(|r| Value::floats(r)).collect())
    }

    pub fn pair(primal: Value, differential: Value) -> Value {
        Value::Aggregate(vec![primal, differential])
    }

    pub fn resource(contents: Vec<Value>) -> Value {
        Value::Resource(Rc::new(RefCell::new(contents)))
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn field(&self, idx: usize) -> Option<&Value> {
        match self {
            Value::Aggregate(items) => items.get(idx),
            _ => None,
        }
    }

    /// Every float leaf, depth first
    pub fn flatten_floats(&self) -> Vec<f64> {
        let mut out = Vec::new();
        self.collect_floats(&mut out);
        out
    }

    fn collect_floats(&self, out: &mut Vec<f64>) {
        match self {
            Value::Float(x) => out.push(*x),
            Value::Aggregate(items) => items.iter().for_each(|i| i.collect_floats(out)),
            _ => {}
        }
    }

    /// Zero value of a type
    pub fn zero(ty: &MirType) -> Value {
        Value::filled(ty, &mut std::iter::repeat(0.0))
    }

    /// Build a value of `ty`, taking float leaves from `source` in depth-first
    /// order. Non-float leaves are zero.
    pub fn filled(ty: &MirType, source: &mut dyn Iterator<Item = f64>) -> Value {
        match ty {
            MirType::F32 | MirType::F64 => Value::Float(source.next().unwrap_or(0.0)),
            MirType::I32 | MirType::U32 => Value::Int(0),
            MirType::Bool => Value::Bool(false),
            MirType::Void | MirType::Resource { .. } | MirType::Witness { .. } => Value::Void,
            MirType::Vector { element, size } | MirType::Array { element, size } => {
                Value::Aggregate((0..*size).map(|_| Value::filled(element, source)).collect())
            }
            MirType::Matrix {
                element, rows, cols,
            } => Value::Aggregate(
                (0..*rows)
                    .map(|_| {
                        Value::Aggregate((0..*cols).map(|_| Value::filled(element, source)).collect())
                    })
                    .collect(),
            ),
            MirType::Struct { fields, .. } => {
                Value::Aggregate(fields.iter().map(|f| Value::filled(&f.ty, source)).collect())
            }
            MirType::Tuple { elements } => {
                Value::Aggregate(elements.iter().map(|e| Value::filled(e, source)).collect())
            }
            MirType::DiffPair {
                primal,
                differential,
            } => {
                let p = Value::filled(primal, source);
                let d = Value::filled(differential, source);
                Value::pair(p, d)
            }
        }
    }

    /// Broadcast a scalar to every leaf position of `ty`
    fn splat(ty: &MirType, scalar: &Value) -> Value {
        match ty {
            MirType::Vector { element, size } | MirType::Array { element, size } => {
                Value::Aggregate((0..*size).map(|_| Value::splat(element, scalar)).collect())
            }
            MirType::Matrix {
                element, rows, cols,
            } => Value::Aggregate(
                (0..*rows)
                    .map(|_| Value::Aggregate((0..*cols).map(|_| Value::splat(element, scalar)).collect()))
                    .collect(),
            ),
            _ => scalar.clone(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(x) => write!(f, "{}", x),
            Value::Float(x) => write!(f, "{}", x),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Aggregate(items) => {
                write!(f, "{{")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "}}")
            }
            Value::Resource(r) => write!(f, "<resource[{}]>", r.borrow().len()),
            Value::Witness(name) => write!(f, "<witness {}>", name),
            Value::Void => write!(f, "void"),
        }
    }
}

/// Evaluation error
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum InterpError {
    #[error("unknown function `{0}`")]
    UnknownFunction(String),

    #[error("`{function}` expects {expected} arguments, got {found}")]
    ArgumentCount {
        function: String,
        expected: usize,
        found: usize,
    },

    #[error("use of undefined value {0}")]
    UndefinedValue(ValueId),

    #[error("type error: {0}")]
    TypeError(String),

    #[error("index {index} out of bounds for length {len}")]
    IndexOutOfBounds { index: i64, len: usize },

    #[error("witness table `{table}` has no entry for `{requirement}`")]
    MissingWitnessEntry { table: String, requirement: String },

    #[error("`{0}` was not rewritten by the differentiation pass")]
    UnresolvedDerivative(String),

    #[error("checkpoint pop in `{0}` with an empty log")]
    CheckpointUnderflow(String),

    #[error("checkpoint pop in `{function}` expected {expected}, found record of {found}")]
    CheckpointTypeMismatch {
        function: String,
        expected: MirType,
        found: MirType,
    },

    #[error("`{function}` returned with {remaining} checkpoints left on its log")]
    UnbalancedCheckpoints { function: String, remaining: usize },

    #[error("reached unreachable terminator in `{function}` at {block}")]
    Unreachable { function: String, block: BlockId },

    #[error("evaluation exceeded {0} steps")]
    StepLimit(u64),

    #[error("call depth exceeded {0}")]
    CallDepth(usize),
}

/// Counters collected during evaluation
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InterpStats {
    pub steps: u64,
    pub calls: u64,
    pub checkpoint_pushes: u64,
    pub checkpoint_pops: u64,
    /// Deepest checkpoint log seen in any frame
    pub max_log_depth: usize,
}

const MAX_CALL_DEPTH: usize = 256;

type EvalResult<T> = Result<T, InterpError>;

/// MIR interpreter over one module
pub struct Interpreter<'m> {
    module: &'m MirModule,
    stats: InterpStats,
    step_limit: u64,
}

/// Per-call mutable state
struct Frame<'f> {
    function: &'f MirFunction,
    types: HashMap<ValueId, MirType>,
    env: HashMap<ValueId, Value>,
    locals: Vec<Value>,
    log: Vec<(MirType, Value)>,
}

impl<'f> Frame<'f> {
    fn get(&self, v: ValueId) -> EvalResult<&Value> {
        self.env.get(&v).ok_or(InterpError::UndefinedValue(v))
    }
}

impl<'m> Interpreter<'m> {
    pub fn new(module: &'m MirModule) -> Self {
        Self {
            module,
            stats: InterpStats::default(),
            step_limit: 10_000_000,
        }
    }

    pub fn with_step_limit(mut self, limit: u64) -> Self {
        self.step_limit = limit;
        self
    }

    pub fn stats(&self) -> &InterpStats {
        &self.stats
    }

    /// Call a function by name
    pub fn call(&mut self, name: &str, args: Vec<Value>) -> EvalResult<Value> {
        self.call_at_depth(name, args, 0)
    }

    fn call_at_depth(&mut self, name: &str, args: Vec<Value>, depth: usize) -> EvalResult<Value> {
        if depth > MAX_CALL_DEPTH {
            return Err(InterpError::CallDepth(MAX_CALL_DEPTH));
        }
        let module = self.module;
        let function = module
            .get_function(name)
            .filter(|f| !f.is_declaration())
            .ok_or_else(|| InterpError::UnknownFunction(name.to_string()))?;
        if function.signature.params.len() != args.len() {
            return Err(InterpError::ArgumentCount {
                function: name.to_string(),
                expected: function.signature.params.len(),
                found: args.len(),
            });
        }
        self.stats.calls += 1;
        trace!("interp: call {}", name);
        self.run(function, args, depth)
    }

    fn run(&mut self, function: &'m MirFunction, args: Vec<Value>, depth: usize) -> EvalResult<Value> {
        let mut frame = Frame {
            function,
            types: function.value_types(),
            env: HashMap::new(),
            locals: function.locals.iter().map(|l| Value::zero(&l.ty)).collect(),
            log: Vec::new(),
        };

        let mut block_id = BlockId::ENTRY;
        let mut incoming = args;

        loop {
            let block = function
                .block(block_id)
                .ok_or_else(|| InterpError::TypeError(format!("missing block {}", block_id)))?;

            if block.params.len() != incoming.len() {
                return Err(InterpError::TypeError(format!(
                    "{} expects {} block arguments, got {}",
                    block_id,
                    block.params.len(),
                    incoming.len()
                )));
            }
            for (param, value) in block.params.iter().zip(incoming.drain(..)) {
                frame.env.insert(param.value, value);
            }

            for inst in &block.instructions {
                self.stats.steps += 1;
                if self.stats.steps > self.step_limit {
                    return Err(InterpError::StepLimit(self.step_limit));
                }
                let value = self.eval(&mut frame, inst, depth)?;
                if let Some(result) = inst.result {
                    frame.env.insert(result, value);
                }
            }

            let (target, args) = match &block.terminator {
                Terminator::Goto { target, args } => (*target, args.as_slice()),
                Terminator::Branch {
                    cond,
                    then_block,
                    then_args,
                    else_block,
                    else_args,
                } => {
                    let taken = frame
                        .get(*cond)?
                        .as_bool()
                        .ok_or_else(|| InterpError::TypeError("branch on non-bool".into()))?;
                    if taken {
                        (*then_block, then_args.as_slice())
                    } else {
                        (*else_block, else_args.as_slice())
                    }
                }
                Terminator::Switch {
                    value,
                    default,
                    default_args,
                    cases,
                } => {
                    let selector = frame
                        .get(*value)?
                        .as_int()
                        .ok_or_else(|| InterpError::TypeError("switch on non-int".into()))?;
                    cases
                        .iter()
                        .find(|(k, _, _)| *k == selector)
                        .map(|(_, t, a)| (*t, a.as_slice()))
                        .unwrap_or((*default, default_args.as_slice()))
                }
                Terminator::Return { value } => {
                    if !frame.log.is_empty() {
                        return Err(InterpError::UnbalancedCheckpoints {
                            function: function.name.clone(),
                            remaining: frame.log.len(),
                        });
                    }
                    return match value {
                        Some(v) => Ok(frame.get(*v)?.clone()),
                        None => Ok(Value::Void),
                    };
                }
                Terminator::Unreachable => {
                    return Err(InterpError::Unreachable {
                        function: function.name.clone(),
                        block: block_id,
                    })
                }
            };

            incoming = args
                .iter()
                .map(|a| frame.get(*a).cloned())
                .collect::<EvalResult<Vec<_>>>()?;
            block_id = target;
        }
    }

    fn eval(&mut self, frame: &mut Frame<'m>, inst: &Instruction, depth: usize) -> EvalResult<Value> {
        let get = |v: &ValueId| frame.get(*v).cloned();

        match &inst.op {
            Operation::ConstInt { value, .. } => Ok(Value::Int(*value)),
            Operation::ConstFloat { value, ty } => Ok(Value::splat(ty, &Value::Float(*value))),
            Operation::ConstBool { value } => Ok(Value::Bool(*value)),
            Operation::ZeroInit { ty } => Ok(Value::zero(ty)),
            Operation::WitnessRef { table } => Ok(Value::Witness(table.clone())),

            Operation::IAdd { lhs, rhs } => int_bin(&get(lhs)?, &get(rhs)?, |a, b| a.wrapping_add(b)),
            Operation::ISub { lhs, rhs } => int_bin(&get(lhs)?, &get(rhs)?, |a, b| a.wrapping_sub(b)),
            Operation::IMul { lhs, rhs } => int_bin(&get(lhs)?, &get(rhs)?, |a, b| a.wrapping_mul(b)),
            Operation::ICmp { pred, lhs, rhs } => {
                let pred = *pred;
                zip_leaves(&get(lhs)?, &get(rhs)?, &|a, b| {
                    let (a, b) = (expect_int(a)?, expect_int(b)?);
                    Ok(Value::Bool(match pred {
                        IntPredicate::Eq => a == b,
                        IntPredicate::Ne => a != b,
                        IntPredicate::Slt => a < b,
                        IntPredicate::Sle => a <= b,
                        IntPredicate::Sgt => a > b,
                        IntPredicate::Sge => a >= b,
                    }))
                })
            }

            Operation::FAdd { lhs, rhs } => float_bin(&get(lhs)?, &get(rhs)?, |a, b| a + b),
            Operation::FSub { lhs, rhs } => float_bin(&get(lhs)?, &get(rhs)?, |a, b| a - b),
            Operation::FMul { lhs, rhs } => float_bin(&get(lhs)?, &get(rhs)?, |a, b| a * b),
            Operation::FDiv { lhs, rhs } => float_bin(&get(lhs)?, &get(rhs)?, |a, b| a / b),
            Operation::Pow { base, exp } => float_bin(&get(base)?, &get(exp)?, f64::powf),
            Operation::FMin { lhs, rhs } => float_bin(&get(lhs)?, &get(rhs)?, f64::min),
            Operation::FMax { lhs, rhs } => float_bin(&get(lhs)?, &get(rhs)?, f64::max),
            Operation::FNeg { operand } => float_un(&get(operand)?, |x| -x),
            Operation::Sqrt { operand } => float_un(&get(operand)?, f64::sqrt),
            Operation::Exp { operand } => float_un(&get(operand)?, f64::exp),
            Operation::Log { operand } => float_un(&get(operand)?, f64::ln),
            Operation::Sin { operand } => float_un(&get(operand)?, f64::sin),
            Operation::Cos { operand } => float_un(&get(operand)?, f64::cos),
            Operation::Tanh { operand } => float_un(&get(operand)?, f64::tanh),
            Operation::Abs { operand } => float_un(&get(operand)?, f64::abs),
            Operation::Floor { operand } => float_un(&get(operand)?, f64::floor),
            Operation::Sign { operand } => float_un(&get(operand)?, |x| {
                if x > 0.0 {
                    1.0
                } else if x < 0.0 {
                    -1.0
                } else {
                    0.0
                }
            }),
            Operation::FCmp { pred, lhs, rhs } => {
                let pred = *pred;
                zip_leaves(&get(lhs)?, &get(rhs)?, &|a, b| {
                    let (a, b) = (expect_float(a)?, expect_float(b)?);
                    Ok(Value::Bool(match pred {
                        FloatPredicate::OEq => a == b,
                        FloatPredicate::ONe => a != b && !a.is_nan() && !b.is_nan(),
                        FloatPredicate::OLt => a < b,
                        FloatPredicate::OLe => a <= b,
                        FloatPredicate::OGt => a > b,
                        FloatPredicate::OGe => a >= b,
                    }))
                })
            }
            Operation::Select {
                cond,
                then_val,
                else_val,
            } => select(&get(cond)?, &get(then_val)?, &get(else_val)?),
            Operation::Splat { scalar } => Ok(Value::splat(&inst.ty, &get(scalar)?)),
            Operation::Sum { operand } => {
                Ok(Value::Float(get(operand)?.flatten_floats().iter().sum()))
            }

            Operation::SIToFP { operand, .. } => {
                map_leaves(&get(operand)?, &|v| Ok(Value::Float(expect_int(v)? as f64)))
            }
            Operation::FPToSI { operand, .. } => {
                map_leaves(&get(operand)?, &|v| Ok(Value::Int(expect_float(v)?.trunc() as i64)))
            }
            Operation::FConvert { operand, .. } => Ok(get(operand)?),
            Operation::Bitcast { operand, to } => {
                let to_float = to.scalar_type().is_float();
                map_leaves(&get(operand)?, &|v| match (v, to_float) {
                    (Value::Float(x), false) => Ok(Value::Int((*x as f32).to_bits() as i64)),
                    (Value::Int(i), true) => Ok(Value::Float(f32::from_bits(*i as u32) as f64)),
                    (other, _) => Ok(other.clone()),
                })
            }

            Operation::And { lhs, rhs } => int_bin(&get(lhs)?, &get(rhs)?, |a, b| a & b),
            Operation::Or { lhs, rhs } => int_bin(&get(lhs)?, &get(rhs)?, |a, b| a | b),
            Operation::Xor { lhs, rhs } => int_bin(&get(lhs)?, &get(rhs)?, |a, b| a ^ b),
            Operation::Shl { lhs, rhs } => {
                int_bin(&get(lhs)?, &get(rhs)?, |a, b| ((a as u32) << (b as u32 & 31)) as i64)
            }
            Operation::LShr { lhs, rhs } => {
                int_bin(&get(lhs)?, &get(rhs)?, |a, b| ((a as u32) >> (b as u32 & 31)) as i64)
            }

            Operation::Aggregate { elements } => Ok(Value::Aggregate(
                elements.iter().map(get).collect::<EvalResult<Vec<_>>>()?,
            )),
            Operation::ExtractField { aggregate, index } => component(&get(aggregate)?, *index as i64),
            Operation::InsertField {
                aggregate,
                index,
                value,
            } => replace_component(get(aggregate)?, *index as i64, get(value)?),
            Operation::ExtractElement { aggregate, index } => {
                let idx = expect_int(&get(index)?)?;
                component(&get(aggregate)?, idx)
            }
            Operation::InsertElement {
                aggregate,
                index,
                value,
            } => {
                let idx = expect_int(&get(index)?)?;
                replace_component(get(aggregate)?, idx, get(value)?)
            }
            Operation::Swizzle { vector, lanes } => {
                let v = get(vector)?;
                let picked = lanes
                    .iter()
                    .map(|l| component(&v, *l as i64))
                    .collect::<EvalResult<Vec<_>>>()?;
                Ok(Value::Aggregate(picked))
            }
            Operation::VecShuffle { vec1, vec2, mask } => {
                let mut lanes = match get(vec1)? {
                    Value::Aggregate(items) => items,
                    other => vec![other],
                };
                match get(vec2)? {
                    Value::Aggregate(items) => lanes.extend(items),
                    other => lanes.push(other),
                }
                let joined = Value::Aggregate(lanes);
                let picked = mask
                    .iter()
                    .map(|m| component(&joined, *m as i64))
                    .collect::<EvalResult<Vec<_>>>()?;
                Ok(Value::Aggregate(picked))
            }

            Operation::MakePair {
                primal,
                differential,
            } => Ok(Value::pair(get(primal)?, get(differential)?)),
            Operation::PairPrimal { pair } => component(&get(pair)?, 0),
            Operation::PairDiff { pair } => component(&get(pair)?, 1),

            Operation::ResourceLoad { resource, index } => {
                let idx = expect_int(&get(index)?)?;
                match get(resource)? {
                    Value::Resource(buf) => {
                        let buf = buf.borrow();
                        buf.get(usize::try_from(idx).unwrap_or(usize::MAX))
                            .cloned()
                            .ok_or(InterpError::IndexOutOfBounds {
                                index: idx,
                                len: buf.len(),
                            })
                    }
                    other => Err(InterpError::TypeError(format!("load from {}", other))),
                }
            }
            Operation::ResourceStore {
                resource,
                index,
                value,
            } => {
                let idx = expect_int(&get(index)?)?;
                let value = get(value)?;
                match get(resource)? {
                    Value::Resource(buf) => {
                        let mut buf = buf.borrow_mut();
                        let len = buf.len();
                        let slot = buf
                            .get_mut(usize::try_from(idx).unwrap_or(usize::MAX))
                            .ok_or(InterpError::IndexOutOfBounds { index: idx, len })?;
                        *slot = value;
                        Ok(Value::Void)
                    }
                    other => Err(InterpError::TypeError(format!("store to {}", other))),
                }
            }

            Operation::Call { callee, args, .. } => {
                let target = self.resolve_callee(frame, callee)?;
                let args = args.iter().map(get).collect::<EvalResult<Vec<_>>>()?;
                self.call_at_depth(&target, args, depth + 1)
            }
            Operation::FwdDiff { function, .. } => {
                Err(InterpError::UnresolvedDerivative(format!("fwd_diff({})", function)))
            }
            Operation::BwdDiff { function, .. } => {
                Err(InterpError::UnresolvedDerivative(format!("bwd_diff({})", function)))
            }

            Operation::LocalGet { local } => frame
                .locals
                .get(*local)
                .cloned()
                .ok_or_else(|| InterpError::TypeError(format!("no local {}", local))),
            Operation::LocalSet { local, value } => {
                let value = get(value)?;
                let slot = frame
                    .locals
                    .get_mut(*local)
                    .ok_or_else(|| InterpError::TypeError(format!("no local {}", local)))?;
                *slot = value;
                Ok(Value::Void)
            }

            Operation::CheckpointPush { value } => {
                let v = get(value)?;
                let ty = frame
                    .types
                    .get(value)
                    .cloned()
                    .ok_or(InterpError::UndefinedValue(*value))?;
                frame.log.push((ty, v));
                self.stats.checkpoint_pushes += 1;
                self.stats.max_log_depth = self.stats.max_log_depth.max(frame.log.len());
                Ok(Value::Void)
            }
            Operation::CheckpointPop => {
                let (ty, v) = frame
                    .log
                    .pop()
                    .ok_or_else(|| InterpError::CheckpointUnderflow(frame.function.name.clone()))?;
                if ty != inst.ty {
                    return Err(InterpError::CheckpointTypeMismatch {
                        function: frame.function.name.clone(),
                        expected: inst.ty.clone(),
                        found: ty,
                    });
                }
                self.stats.checkpoint_pops += 1;
                Ok(v)
            }
        }
    }

    fn resolve_callee(&self, frame: &Frame<'_>, callee: &Callee) -> EvalResult<String> {
        let lookup = |table: &str, requirement: &str| {
            self.module
                .get_witness_table(table)
                .and_then(|t| t.lookup(requirement))
                .map(str::to_string)
                .ok_or_else(|| InterpError::MissingWitnessEntry {
                    table: table.to_string(),
                    requirement: requirement.to_string(),
                })
        };

        match callee {
            Callee::Direct(name) => Ok(name.clone()),
            Callee::Witness { table, requirement } => lookup(table, requirement),
            Callee::Dynamic {
                witness,
                requirement,
                ..
            } => match frame.get(*witness)? {
                Value::Witness(table) => lookup(table, requirement),
                other => Err(InterpError::TypeError(format!(
                    "dynamic call through {}",
                    other
                ))),
            },
        }
    }
}

// =============================================================================
// LEAF-WISE HELPERS
// =============================================================================

fn expect_float(v: &Value) -> EvalResult<f64> {
    v.as_float()
        .ok_or_else(|| InterpError::TypeError(format!("expected float, found {}", v)))
}

fn expect_int(v: &Value) -> EvalResult<i64> {
    v.as_int()
        .ok_or_else(|| InterpError::TypeError(format!("expected int, found {}", v)))
}

fn map_leaves(v: &Value, f: &dyn Fn(&Value) -> EvalResult<Value>) -> EvalResult<Value> {
    match v {
        Value::Aggregate(items) => items
            .iter()
            .map(|i| map_leaves(i, f))
            .collect::<EvalResult<Vec<_>>>()
            .map(Value::Aggregate),
        leaf => f(leaf),
    }
}

fn zip_leaves(
    a: &Value,
    b: &Value,
    f: &dyn Fn(&Value, &Value) -> EvalResult<Value>,
) -> EvalResult<Value> {
    match (a, b) {
        (Value::Aggregate(xs), Value::Aggregate(ys)) if xs.len() == ys.len() => xs
            .iter()
            .zip(ys)
            .map(|(x, y)| zip_leaves(x, y, f))
            .collect::<EvalResult<Vec<_>>>()
            .map(Value::Aggregate),
        (Value::Aggregate(_), _) | (_, Value::Aggregate(_)) => Err(InterpError::TypeError(
            format!("shape mismatch between {} and {}", a, b),
        )),
        _ => f(a, b),
    }
}

fn float_un(v: &Value, f: impl Fn(f64) -> f64) -> EvalResult<Value> {
    map_leaves(v, &|x| Ok(Value::Float(f(expect_float(x)?))))
}

fn float_bin(a: &Value, b: &Value, f: impl Fn(f64, f64) -> f64) -> EvalResult<Value> {
    zip_leaves(a, b, &|x, y| Ok(Value::Float(f(expect_float(x)?, expect_float(y)?))))
}

fn int_bin(a: &Value, b: &Value, f: impl Fn(i64, i64) -> i64) -> EvalResult<Value> {
    zip_leaves(a, b, &|x, y| match (x, y) {
        (Value::Bool(p), Value::Bool(q)) => {
            Ok(Value::Bool(f(*p as i64, *q as i64) != 0))
        }
        _ => Ok(Value::Int(f(expect_int(x)?, expect_int(y)?))),
    })
}

fn select(cond: &Value, then_val: &Value, else_val: &Value) -> EvalResult<Value> {
    match (cond, then_val, else_val) {
        (Value::Bool(c), t, e) => Ok(if *c { t.clone() } else { e.clone() }),
        (Value::Aggregate(cs), Value::Aggregate(ts), Value::Aggregate(es))
            if cs.len() == ts.len() && ts.len() == es.len() =>
        {
            cs.iter()
                .zip(ts)
                .zip(es)
                .map(|((c, t), e)| select(c, t, e))
                .collect::<EvalResult<Vec<_>>>()
                .map(Value::Aggregate)
        }
        _ => Err(InterpError::TypeError(format!("select on {}", cond))),
    }
}

fn component(v: &Value, idx: i64) -> EvalResult<Value> {
    match v {
        Value::Aggregate(items) => usize::try_from(idx)
            .ok()
            .and_then(|i| items.get(i))
            .cloned()
            .ok_or(InterpError::IndexOutOfBounds {
                index: idx,
                len: items.len(),
            }),
        other => Err(InterpError::TypeError(format!("index into {}", other))),
    }
}

fn replace_component(v: Value, idx: i64, value: Value) -> EvalResult<Value> {
    match v {
        Value::Aggregate(mut items) => {
            let len = items.len();
            let slot = usize::try_from(idx)
                .ok()
                .and_then(|i| items.get_mut(i))
                .ok_or(InterpError::IndexOutOfBounds { index: idx, len })?;
            *slot = value;
            Ok(Value::Aggregate(items))
        }
        other => Err(InterpError::TypeError(format!("index into {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::function::FunctionSignature;
    use crate::mir::module::{ModuleBuilder, WitnessTable};

    fn vec3() -> MirType {
        MirType::vector(MirType::F32, 3)
    }

    #[test]
    fn test_componentwise_arithmetic() {
        let mut mb = ModuleBuilder::new("t");
        mb.function(
            "f",
            FunctionSignature::new(vec![vec3(), MirType::F32], MirType::F32),
            |f| {
                let v = f.param(0).unwrap();
                let s = f.param(1).unwrap();
                let splat = f.push_op(Operation::Splat { scalar: s }, vec3());
                let prod = f.push_op(Operation::FMul { lhs: v, rhs: splat }, vec3());
                let total = f.push_op(Operation::Sum { operand: prod }, MirType::F32);
                f.terminate(Terminator::Return { value: Some(total) });
            },
        );
        let module = mb.build();
        let out = Interpreter::new(&module)
            .call("f", vec![Value::floats(&[1.0, 2.0, 3.0]), Value::Float(2.0)])
            .unwrap();
        assert_eq!(out, Value::Float(12.0));
    }

    #[test]
    fn test_loop_with_block_params() {
        // sum of 0..n as floats
        let mut mb = ModuleBuilder::new("t");
        mb.function(
            "tri",
            FunctionSignature::new(vec![MirType::I32], MirType::F32),
            |f| {
                let n = f.param(0).unwrap();
                let header = f.create_block();
                let body = f.create_block();
                let exit = f.create_block();
                let zero_i = f.const_int(0);
                let zero_f = f.const_float(0.0, MirType::F32);
                f.terminate(Terminator::Goto {
                    target: header,
                    args: vec![zero_i, zero_f],
                });

                f.switch_to(header);
                let i = f.block_param(MirType::I32);
                let acc = f.block_param(MirType::F32);
                let cond = f.push_op(
                    Operation::ICmp {
                        pred: IntPredicate::Slt,
                        lhs: i,
                        rhs: n,
                    },
                    MirType::Bool,
                );
                f.terminate(Terminator::Branch {
                    cond,
                    then_block: body,
                    then_args: vec![],
                    else_block: exit,
                    else_args: vec![acc],
                });

                f.switch_to(body);
                let fi = f.push_op(
                    Operation::SIToFP {
                        operand: i,
                        to: MirType::F32,
                    },
                    MirType::F32,
                );
                let next_acc = f.push_op(Operation::FAdd { lhs: acc, rhs: fi }, MirType::F32);
                let one = f.const_int(1);
                let next_i = f.push_op(Operation::IAdd { lhs: i, rhs: one }, MirType::I32);
                f.terminate(Terminator::Goto {
                    target: header,
                    args: vec![next_i, next_acc],
                });

                f.switch_to(exit);
                let r = f.block_param(MirType::F32);
                f.terminate(Terminator::Return { value: Some(r) });
            },
        );
        let module = mb.build();
        let out = Interpreter::new(&module).call("tri", vec![Value::Int(5)]).unwrap();
        assert_eq!(out, Value::Float(10.0));
    }

    #[test]
    fn test_checkpoint_balance_is_enforced() {
        let mut mb = ModuleBuilder::new("t");
        mb.function(
            "leaky",
            FunctionSignature::new(vec![MirType::F32], MirType::F32),
            |f| {
                let x = f.param(0).unwrap();
                f.push_void(Operation::CheckpointPush { value: x });
                f.terminate(Terminator::Return { value: Some(x) });
            },
        );
        mb.function(
            "mismatched",
            FunctionSignature::new(vec![MirType::F32], MirType::I32),
            |f| {
                let x = f.param(0).unwrap();
                f.push_void(Operation::CheckpointPush { value: x });
                let y = f.push_op(Operation::CheckpointPop, MirType::I32);
                f.terminate(Terminator::Return { value: Some(y) });
            },
        );
        mb.function(
            "balanced",
            FunctionSignature::new(vec![MirType::F32], MirType::F32),
            |f| {
                let x = f.param(0).unwrap();
                f.push_void(Operation::CheckpointPush { value: x });
                let y = f.push_op(Operation::CheckpointPop, MirType::F32);
                f.terminate(Terminator::Return { value: Some(y) });
            },
        );
        let module = mb.build();
        let mut interp = Interpreter::new(&module);

        assert!(matches!(
            interp.call("leaky", vec![Value::Float(1.0)]),
            Err(InterpError::UnbalancedCheckpoints { remaining: 1, .. })
        ));
        assert!(matches!(
            interp.call("mismatched", vec![Value::Float(1.0)]),
            Err(InterpError::CheckpointTypeMismatch { .. })
        ));
        assert_eq!(
            interp.call("balanced", vec![Value::Float(3.0)]).unwrap(),
            Value::Float(3.0)
        );
    }

    #[test]
    fn test_dynamic_dispatch_through_witness_value() {
        let mut mb = ModuleBuilder::new("t");
        mb.function(
            "double",
            FunctionSignature::new(vec![MirType::F32], MirType::F32),
            |f| {
                let x = f.param(0).unwrap();
                let y = f.push_op(Operation::FAdd { lhs: x, rhs: x }, MirType::F32);
                f.terminate(Terminator::Return { value: Some(y) });
            },
        );
        mb.witness_table(WitnessTable::new("Doubler_IScale", "IScale").with_entry("apply", "double"));
        mb.function(
            "apply",
            FunctionSignature::new(vec![MirType::witness("IScale"), MirType::F32], MirType::F32),
            |f| {
                let w = f.param(0).unwrap();
                let x = f.param(1).unwrap();
                let y = f.push_op(
                    Operation::Call {
                        callee: Callee::Dynamic {
                            witness: w,
                            interface: "IScale".into(),
                            requirement: "apply".into(),
                        },
                        args: vec![x],
                        ret_ty: MirType::F32,
                        no_diff: false,
                    },
                    MirType::F32,
                );
                f.terminate(Terminator::Return { value: Some(y) });
            },
        );
        let module = mb.build();
        let out = Interpreter::new(&module)
            .call(
                "apply",
                vec![Value::Witness("Doubler_IScale".into()), Value::Float(4.0)],
            )
            .unwrap();
        assert_eq!(out, Value::Float(8.0));
    }

    #[test]
    fn test_filled_and_flatten() {
        let ty = MirType::tuple(vec![MirType::matrix(MirType::F32, 2, 2), MirType::I32, MirType::F32]);
        let v = Value::filled(&ty, &mut (1..).map(|i| i as f64));
        assert_eq!(v.flatten_floats(), vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(v.field(1), Some(&Value::Int(0)));
    }
}
