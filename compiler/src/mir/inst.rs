//! MIR Instructions (SSA Form)
//!
//! Defines all MIR operations, organized by category:
//! - Constants
//! - Integer arithmetic
//! - Componentwise floating-point arithmetic and intrinsics
//! - Conversions and bit operations
//! - Aggregate operations
//! - Differential pairs
//! - Resources
//! - Calls and differentiation operators
//! - Mutable slots and the checkpoint log

use super::types::*;
use super::value::*;

/// A MIR instruction
#[derive(Clone, Debug)]
pub struct Instruction {
    /// Result value (None for void operations like stores)
    pub result: Option<ValueId>,
    /// The operation
    pub op: Operation,
    /// Result type
    pub ty: MirType,
    /// Source location
    pub span: Option<Span>,
}

impl Instruction {
    pub fn new(op: Operation, ty: MirType) -> Self {
        Self {
            result: None,
            op,
            ty,
            span: None,
        }
    }

    pub fn with_result(mut self, result: ValueId) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Check if this instruction has side effects
    pub fn has_side_effects(&self) -> bool {
        self.op.has_side_effects()
    }

    /// Get all value operands used by this instruction
    pub fn operands(&self) -> Vec<ValueId> {
        self.op.operands()
    }
}

/// MIR operations
///
/// Float operations are componentwise: applied to a vector, matrix or array
/// they act on every scalar leaf, and a scalar operand mixed with a
/// composite one is not allowed (use [`Operation::Splat`]).
#[derive(Clone, Debug)]
pub enum Operation {
    // =========================================================================
    // CONSTANTS
    // =========================================================================
    /// Integer constant
    ConstInt { value: i64, ty: MirType },

    /// Floating-point constant (splatted across composite types)
    ConstFloat { value: f64, ty: MirType },

    /// Boolean constant
    ConstBool { value: bool },

    /// Zero-initialized value of any type
    ZeroInit { ty: MirType },

    /// Reference to a named witness table
    WitnessRef { table: String },

    // =========================================================================
    // INTEGER ARITHMETIC
    // =========================================================================
    IAdd { lhs: ValueId, rhs: ValueId },
    ISub { lhs: ValueId, rhs: ValueId },
    IMul { lhs: ValueId, rhs: ValueId },
    ICmp {
        pred: IntPredicate,
        lhs: ValueId,
        rhs: ValueId,
    },

    // =========================================================================
    // FLOATING-POINT ARITHMETIC
    // =========================================================================
    FAdd { lhs: ValueId, rhs: ValueId },
    FSub { lhs: ValueId, rhs: ValueId },
    FMul { lhs: ValueId, rhs: ValueId },
    FDiv { lhs: ValueId, rhs: ValueId },
    FNeg { operand: ValueId },

    Sqrt { operand: ValueId },
    Exp { operand: ValueId },
    Log { operand: ValueId },
    Sin { operand: ValueId },
    Cos { operand: ValueId },
    Tanh { operand: ValueId },
    Pow { base: ValueId, exp: ValueId },
    Abs { operand: ValueId },
    Sign { operand: ValueId },
    Floor { operand: ValueId },
    FMin { lhs: ValueId, rhs: ValueId },
    FMax { lhs: ValueId, rhs: ValueId },

    /// Componentwise comparison, producing bools of the same shape
    FCmp {
        pred: FloatPredicate,
        lhs: ValueId,
        rhs: ValueId,
    },

    /// Select with a scalar or componentwise condition
    Select {
        cond: ValueId,
        then_val: ValueId,
        else_val: ValueId,
    },

    /// Broadcast a scalar to the instruction's composite type
    Splat { scalar: ValueId },

    /// Sum of all scalar leaves
    Sum { operand: ValueId },

    // =========================================================================
    // CONVERSIONS
    // =========================================================================
    SIToFP { operand: ValueId, to: MirType },
    FPToSI { operand: ValueId, to: MirType },
    /// Float precision change (f32 <-> f64)
    FConvert { operand: ValueId, to: MirType },
    /// Reinterpret bits
    Bitcast { operand: ValueId, to: MirType },

    // =========================================================================
    // BITWISE
    // =========================================================================
    And { lhs: ValueId, rhs: ValueId },
    Or { lhs: ValueId, rhs: ValueId },
    Xor { lhs: ValueId, rhs: ValueId },
    Shl { lhs: ValueId, rhs: ValueId },
    LShr { lhs: ValueId, rhs: ValueId },

    // =========================================================================
    // AGGREGATES
    // =========================================================================
    /// Build a struct, tuple, vector, matrix (from rows) or array
    Aggregate { elements: Vec<ValueId> },

    /// Extract at a constant index
    ExtractField { aggregate: ValueId, index: usize },

    /// Replace at a constant index
    InsertField {
        aggregate: ValueId,
        index: usize,
        value: ValueId,
    },

    /// Extract at a dynamic integer index
    ExtractElement { aggregate: ValueId, index: ValueId },

    /// Replace at a dynamic integer index
    InsertElement {
        aggregate: ValueId,
        index: ValueId,
        value: ValueId,
    },

    /// Reorder lanes of one vector (`v.zyx`)
    Swizzle { vector: ValueId, lanes: Vec<u32> },

    /// Lane shuffle across two vectors by raw mask. No derivative rule.
    VecShuffle {
        vec1: ValueId,
        vec2: ValueId,
        mask: Vec<u32>,
    },

    // =========================================================================
    // DIFFERENTIAL PAIRS
    // =========================================================================
    /// `diffPair(primal, differential)`
    MakePair {
        primal: ValueId,
        differential: ValueId,
    },
    PairPrimal { pair: ValueId },
    PairDiff { pair: ValueId },

    // =========================================================================
    // RESOURCES
    // =========================================================================
    ResourceLoad { resource: ValueId, index: ValueId },
    ResourceStore {
        resource: ValueId,
        index: ValueId,
        value: ValueId,
    },

    // =========================================================================
    // CALLS
    // =========================================================================
    Call {
        callee: Callee,
        args: Vec<ValueId>,
        ret_ty: MirType,
        /// Per-call `no_diff`: the result is treated as a constant
        no_diff: bool,
    },

    /// `fwd_diff(f)(args...)`, replaced by a direct call after the AD pass
    FwdDiff { function: String, args: Vec<ValueId> },

    /// `bwd_diff(f)(args...)`, replaced by a direct call after the AD pass
    BwdDiff { function: String, args: Vec<ValueId> },

    // =========================================================================
    // MUTABLE SLOTS
    // =========================================================================
    /// Read a function-local slot
    LocalGet { local: usize },

    /// Write a function-local slot
    LocalSet { local: usize, value: ValueId },

    // =========================================================================
    // CHECKPOINT LOG
    // =========================================================================
    /// Record a value on the function's checkpoint log
    CheckpointPush { value: ValueId },

    /// Take the most recent record; its type is the instruction type
    CheckpointPop,
}

impl Operation {
    /// Check if operation has side effects
    pub fn has_side_effects(&self) -> bool {
        matches!(
            self,
            Operation::ResourceStore { .. }
                | Operation::Call { .. }
                | Operation::FwdDiff { .. }
                | Operation::BwdDiff { .. }
                | Operation::LocalSet { .. }
                | Operation::CheckpointPush { .. }
                | Operation::CheckpointPop
        )
    }

    /// Get all value operands
    pub fn operands(&self) -> Vec<ValueId> {
        match self {
            Operation::ConstInt { .. }
            | Operation::ConstFloat { .. }
            | Operation::ConstBool { .. }
            | Operation::ZeroInit { .. }
            | Operation::WitnessRef { .. }
            | Operation::LocalGet { .. }
            | Operation::CheckpointPop => vec![],

            Operation::FNeg { operand }
            | Operation::Sqrt { operand }
            | Operation::Exp { operand }
            | Operation::Log { operand }
            | Operation::Sin { operand }
            | Operation::Cos { operand }
            | Operation::Tanh { operand }
            | Operation::Abs { operand }
            | Operation::Sign { operand }
            | Operation::Floor { operand }
            | Operation::Sum { operand }
            | Operation::SIToFP { operand, .. }
            | Operation::FPToSI { operand, .. }
            | Operation::FConvert { operand, .. }
            | Operation::Bitcast { operand, .. }
            | Operation::Splat { scalar: operand }
            | Operation::ExtractField {
                aggregate: operand,
                ..
            }
            | Operation::Swizzle {
                vector: operand, ..
            }
            | Operation::PairPrimal { pair: operand }
            | Operation::PairDiff { pair: operand }
            | Operation::LocalSet { value: operand, .. }
            | Operation::CheckpointPush { value: operand } => vec![*operand],

            Operation::IAdd { lhs, rhs }
            | Operation::ISub { lhs, rhs }
            | Operation::IMul { lhs, rhs }
            | Operation::ICmp { lhs, rhs, .. }
            | Operation::FAdd { lhs, rhs }
            | Operation::FSub { lhs, rhs }
            | Operation::FMul { lhs, rhs }
            | Operation::FDiv { lhs, rhs }
            | Operation::Pow {
                base: lhs,
                exp: rhs,
            }
            | Operation::FMin { lhs, rhs }
            | Operation::FMax { lhs, rhs }
            | Operation::FCmp { lhs, rhs, .. }
            | Operation::And { lhs, rhs }
            | Operation::Or { lhs, rhs }
            | Operation::Xor { lhs, rhs }
            | Operation::Shl { lhs, rhs }
            | Operation::LShr { lhs, rhs }
            | Operation::InsertField {
                aggregate: lhs,
                value: rhs,
                ..
            }
            | Operation::ExtractElement {
                aggregate: lhs,
                index: rhs,
            }
            | Operation::VecShuffle {
                vec1: lhs,
                vec2: rhs,
                ..
            }
            | Operation::MakePair {
                primal: lhs,
                differential: rhs,
            }
            | Operation::ResourceLoad {
                resource: lhs,
                index: rhs,
            } => vec![*lhs, *rhs],

            Operation::Select {
                cond: a,
                then_val: b,
                else_val: c,
            }
            | Operation::InsertElement {
                aggregate: a,
                index: b,
                value: c,
            }
            | Operation::ResourceStore {
                resource: a,
                index: b,
                value: c,
            } => vec![*a, *b, *c],

            Operation::Aggregate { elements } => elements.clone(),
            Operation::Call { callee, args, .. } => {
                let mut ops = Vec::with_capacity(args.len() + 1);
                if let Callee::Dynamic { witness, .. } = callee {
                    ops.push(*witness);
                }
                ops.extend(args.iter().copied());
                ops
            }
            Operation::FwdDiff { args, .. } | Operation::BwdDiff { args, .. } => args.clone(),
        }
    }

    /// Rewrite every value operand through `f`
    pub fn map_operands(&mut self, mut f: impl FnMut(ValueId) -> ValueId) {
        match self {
            Operation::ConstInt { .. }
            | Operation::ConstFloat { .. }
            | Operation::ConstBool { .. }
            | Operation::ZeroInit { .. }
            | Operation::WitnessRef { .. }
            | Operation::LocalGet { .. }
            | Operation::CheckpointPop => {}

            Operation::FNeg { operand }
            | Operation::Sqrt { operand }
            | Operation::Exp { operand }
            | Operation::Log { operand }
            | Operation::Sin { operand }
            | Operation::Cos { operand }
            | Operation::Tanh { operand }
            | Operation::Abs { operand }
            | Operation::Sign { operand }
            | Operation::Floor { operand }
            | Operation::Sum { operand }
            | Operation::SIToFP { operand, .. }
            | Operation::FPToSI { operand, .. }
            | Operation::FConvert { operand, .. }
            | Operation::Bitcast { operand, .. }
            | Operation::Splat { scalar: operand }
            | Operation::ExtractField {
                aggregate: operand,
                ..
            }
            | Operation::Swizzle {
                vector: operand, ..
            }
            | Operation::PairPrimal { pair: operand }
            | Operation::PairDiff { pair: operand }
            | Operation::LocalSet { value: operand, .. }
            | Operation::CheckpointPush { value: operand } => *operand = f(*operand),

            Operation::IAdd { lhs, rhs }
            | Operation::ISub { lhs, rhs }
            | Operation::IMul { lhs, rhs }
            | Operation::ICmp { lhs, rhs, .. }
            | Operation::FAdd { lhs, rhs }
            | Operation::FSub { lhs, rhs }
            | Operation::FMul { lhs, rhs }
            | Operation::FDiv { lhs, rhs }
            | Operation::Pow {
                base: lhs,
                exp: rhs,
            }
            | Operation::FMin { lhs, rhs }
            | Operation::FMax { lhs, rhs }
            | Operation::FCmp { lhs, rhs, .. }
            | Operation::And { lhs, rhs }
            | Operation::Or { lhs, rhs }
            | Operation::Xor { lhs, rhs }
            | Operation::Shl { lhs, rhs }
            | Operation::LShr { lhs, rhs }
            | Operation::InsertField {
                aggregate: lhs,
                value: rhs,
                ..
            }
            | Operation::ExtractElement {
                aggregate: lhs,
                index: rhs,
            }
            | Operation::VecShuffle {
                vec1: lhs,
                vec2: rhs,
                ..
            }
            | Operation::MakePair {
                primal: lhs,
                differential: rhs,
            }
            | Operation::ResourceLoad {
                resource: lhs,
                index: rhs,
            } => {
                *lhs = f(*lhs);
                *rhs = f(*rhs);
            }

            Operation::Select {
                cond: a,
                then_val: b,
                else_val: c,
            }
            | Operation::InsertElement {
                aggregate: a,
                index: b,
                value: c,
            }
            | Operation::ResourceStore {
                resource: a,
                index: b,
                value: c,
            } => {
                *a = f(*a);
                *b = f(*b);
                *c = f(*c);
            }

            Operation::Aggregate { elements } => {
                for e in elements.iter_mut() {
                    *e = f(*e);
                }
            }
            Operation::Call { callee, args, .. } => {
                if let Callee::Dynamic { witness, .. } = callee {
                    *witness = f(*witness);
                }
                for a in args.iter_mut() {
                    *a = f(*a);
                }
            }
            Operation::FwdDiff { args, .. } | Operation::BwdDiff { args, .. } => {
                for a in args.iter_mut() {
                    *a = f(*a);
                }
            }
        }
    }

    /// Mnemonic used by the printer and in diagnostics
    pub fn name(&self) -> &'static str {
        match self {
            Operation::ConstInt { .. } => "const.i",
            Operation::ConstFloat { .. } => "const.f",
            Operation::ConstBool { .. } => "const.b",
            Operation::ZeroInit { .. } => "zeroinit",
            Operation::WitnessRef { .. } => "witness_ref",
            Operation::IAdd { .. } => "iadd",
            Operation::ISub { .. } => "isub",
            Operation::IMul { .. } => "imul",
            Operation::ICmp { .. } => "icmp",
            Operation::FAdd { .. } => "fadd",
            Operation::FSub { .. } => "fsub",
            Operation::FMul { .. } => "fmul",
            Operation::FDiv { .. } => "fdiv",
            Operation::FNeg { .. } => "fneg",
            Operation::Sqrt { .. } => "sqrt",
            Operation::Exp { .. } => "exp",
            Operation::Log { .. } => "log",
            Operation::Sin { .. } => "sin",
            Operation::Cos { .. } => "cos",
            Operation::Tanh { .. } => "tanh",
            Operation::Pow { .. } => "pow",
            Operation::Abs { .. } => "abs",
            Operation::Sign { .. } => "sign",
            Operation::Floor { .. } => "floor",
            Operation::FMin { .. } => "fmin",
            Operation::FMax { .. } => "fmax",
            Operation::FCmp { .. } => "fcmp",
            Operation::Select { .. } => "select",
            Operation::Splat { .. } => "splat",
            Operation::Sum { .. } => "sum",
            Operation::SIToFP { .. } => "sitofp",
            Operation::FPToSI { .. } => "fptosi",
            Operation::FConvert { .. } => "fconvert",
            Operation::Bitcast { .. } => "bitcast",
            Operation::And { .. } => "and",
            Operation::Or { .. } => "or",
            Operation::Xor { .. } => "xor",
            Operation::Shl { .. } => "shl",
            Operation::LShr { .. } => "lshr",
            Operation::Aggregate { .. } => "aggregate",
            Operation::ExtractField { .. } => "extract_field",
            Operation::InsertField { .. } => "insert_field",
            Operation::ExtractElement { .. } => "extract_element",
            Operation::InsertElement { .. } => "insert_element",
            Operation::Swizzle { .. } => "swizzle",
            Operation::VecShuffle { .. } => "shuffle",
            Operation::MakePair { .. } => "make_pair",
            Operation::PairPrimal { .. } => "pair_primal",
            Operation::PairDiff { .. } => "pair_diff",
            Operation::ResourceLoad { .. } => "load",
            Operation::ResourceStore { .. } => "store",
            Operation::Call { .. } => "call",
            Operation::FwdDiff { .. } => "fwd_diff",
            Operation::BwdDiff { .. } => "bwd_diff",
            Operation::LocalGet { .. } => "local.get",
            Operation::LocalSet { .. } => "local.set",
            Operation::CheckpointPush { .. } => "checkpoint.push",
            Operation::CheckpointPop => "checkpoint.pop",
        }
    }
}

/// Call target
#[derive(Clone, Debug, PartialEq)]
pub enum Callee {
    /// Direct function call
    Direct(String),
    /// Static lookup in a named witness table
    Witness { table: String, requirement: String },
    /// Lookup through a witness table value known only at run time
    Dynamic {
        witness: ValueId,
        interface: String,
        requirement: String,
    },
}

/// Integer comparison predicate
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IntPredicate {
    Eq,
    Ne,
    Slt, // Signed less than
    Sle, // Signed less than or equal
    Sgt, // Signed greater than
    Sge, // Signed greater than or equal
}

/// Floating-point comparison predicate (ordered: false if NaN)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FloatPredicate {
    OEq,
    ONe,
    OLt,
    OLe,
    OGt,
    OGe,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operands_include_dynamic_witness() {
        let op = Operation::Call {
            callee: Callee::Dynamic {
                witness: ValueId(7),
                interface: "IShade".into(),
                requirement: "eval".into(),
            },
            args: vec![ValueId(1), ValueId(2)],
            ret_ty: MirType::F32,
            no_diff: false,
        };
        assert_eq!(op.operands(), vec![ValueId(7), ValueId(1), ValueId(2)]);
    }

    #[test]
    fn test_map_operands() {
        let mut op = Operation::Select {
            cond: ValueId(0),
            then_val: ValueId(1),
            else_val: ValueId(2),
        };
        op.map_operands(|v| ValueId(v.0 + 10));
        assert_eq!(op.operands(), vec![ValueId(10), ValueId(11), ValueId(12)]);
    }

    #[test]
    fn test_side_effects() {
        assert!(Operation::CheckpointPop.has_side_effects());
        assert!(Operation::ResourceStore {
            resource: ValueId(0),
            index: ValueId(1),
            value: ValueId(2)
        }
        .has_side_effects());
        assert!(!Operation::FAdd {
            lhs: ValueId(0),
            rhs: ValueId(1)
        }
        .has_side_effects());
    }
}
