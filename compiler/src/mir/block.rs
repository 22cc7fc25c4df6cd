//! MIR Basic Blocks and Terminators
//!
//! Basic blocks are sequences of instructions with a single entry point
//! and a terminator that defines control flow to successor blocks. Values
//! flowing across edges are passed as block arguments; there are no phi nodes.

use super::inst::*;
use super::types::*;
use super::value::*;

/// A basic block in MIR
#[derive(Clone, Debug)]
pub struct BasicBlock {
    /// Block identifier
    pub id: BlockId,
    /// Block parameters (instead of phi nodes)
    pub params: Vec<BlockParam>,
    /// Instructions in the block
    pub instructions: Vec<Instruction>,
    /// Block terminator (defines successors)
    pub terminator: Terminator,
    /// Debug name (optional)
    pub name: Option<String>,
}

impl BasicBlock {
    /// Create a new basic block
    pub fn new(id: BlockId) -> Self {
        Self {
            id,
            params: Vec::new(),
            instructions: Vec::new(),
            terminator: Terminator::Unreachable,
            name: None,
        }
    }

    /// Create a new basic block with a name
    pub fn with_name(id: BlockId, name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Self::new(id)
        }
    }

    /// Add a block parameter
    pub fn add_param(&mut self, value: ValueId, ty: MirType) {
        self.params.push(BlockParam { value, ty });
    }

    /// Add an instruction to the block
    pub fn push(&mut self, inst: Instruction) {
        self.instructions.push(inst);
    }

    /// Set the terminator
    pub fn terminate(&mut self, terminator: Terminator) {
        self.terminator = terminator;
    }

    /// Get successor block IDs
    pub fn successors(&self) -> Vec<BlockId> {
        self.terminator.successors()
    }

    /// Check if block is empty (no instructions)
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Get the number of instructions
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Get all values defined in this block
    pub fn defined_values(&self) -> Vec<ValueId> {
        let mut values: Vec<ValueId> = self.params.iter().map(|p| p.value).collect();
        for inst in &self.instructions {
            if let Some(result) = inst.result {
                values.push(result);
            }
        }
        values
    }

    /// Get all values used in this block
    pub fn used_values(&self) -> Vec<ValueId> {
        let mut values = Vec::new();
        for inst in &self.instructions {
            values.extend(inst.operands());
        }
        values.extend(self.terminator.operands());
        values
    }
}

/// Block parameter (used instead of phi nodes)
#[derive(Clone, Debug)]
pub struct BlockParam {
    /// Value ID for this parameter
    pub value: ValueId,
    /// Type of the parameter
    pub ty: MirType,
}

impl BlockParam {
    pub fn new(value: ValueId, ty: MirType) -> Self {
        Self { value, ty }
    }
}

/// Block terminator - defines control flow to successors
#[derive(Clone, Debug)]
pub enum Terminator {
    /// Unconditional jump
    Goto { target: BlockId, args: Vec<ValueId> },

    /// Conditional branch on a bool
    Branch {
        cond: ValueId,
        then_block: BlockId,
        then_args: Vec<ValueId>,
        else_block: BlockId,
        else_args: Vec<ValueId>,
    },

    /// Multi-way switch on an integer
    Switch {
        value: ValueId,
        /// Default target
        default: BlockId,
        default_args: Vec<ValueId>,
        /// (discriminant, target, args)
        cases: Vec<(i64, BlockId, Vec<ValueId>)>,
    },

    /// Return from function
    Return { value: Option<ValueId> },

    /// Unreachable (traps if reached)
    Unreachable,
}

impl Terminator {
    /// Get all successor blocks
    pub fn successors(&self) -> Vec<BlockId> {
        self.edges().into_iter().map(|(b, _)| b).collect()
    }

    /// Outgoing edges with the arguments passed along each
    pub fn edges(&self) -> Vec<(BlockId, &[ValueId])> {
        match self {
            Terminator::Goto { target, args } => vec![(*target, args.as_slice())],
            Terminator::Branch {
                then_block,
                then_args,
                else_block,
                else_args,
                ..
            } => vec![
                (*then_block, then_args.as_slice()),
                (*else_block, else_args.as_slice()),
            ],
            Terminator::Switch {
                default,
                default_args,
                cases,
                ..
            } => {
                let mut edges = vec![(*default, default_args.as_slice())];
                for (_, target, args) in cases {
                    edges.push((*target, args.as_slice()));
                }
                edges
            }
            Terminator::Return { .. } | Terminator::Unreachable => vec![],
        }
    }

    /// Value the terminator selects on, if any
    pub fn selector(&self) -> Option<ValueId> {
        match self {
            Terminator::Branch { cond, .. } => Some(*cond),
            Terminator::Switch { value, .. } => Some(*value),
            _ => None,
        }
    }

    /// Get all operands used by the terminator
    pub fn operands(&self) -> Vec<ValueId> {
        let mut ops = Vec::new();
        if let Some(sel) = self.selector() {
            ops.push(sel);
        }
        for (_, args) in self.edges() {
            ops.extend_from_slice(args);
        }
        if let Terminator::Return { value: Some(v) } = self {
            ops.push(*v);
        }
        ops
    }

    /// Rewrite every value operand through `f`
    pub fn map_operands(&mut self, mut f: impl FnMut(ValueId) -> ValueId) {
        let map_all = |args: &mut Vec<ValueId>, f: &mut dyn FnMut(ValueId) -> ValueId| {
            for a in args.iter_mut() {
                *a = f(*a);
            }
        };
        match self {
            Terminator::Goto { args, .. } => map_all(args, &mut f),
            Terminator::Branch {
                cond,
                then_args,
                else_args,
                ..
            } => {
                *cond = f(*cond);
                map_all(then_args, &mut f);
                map_all(else_args, &mut f);
            }
            Terminator::Switch {
                value,
                default_args,
                cases,
                ..
            } => {
                *value = f(*value);
                map_all(default_args, &mut f);
                for (_, _, args) in cases.iter_mut() {
                    map_all(args, &mut f);
                }
            }
            Terminator::Return { value: Some(v) } => *v = f(*v),
            Terminator::Return { value: None } | Terminator::Unreachable => {}
        }
    }

    /// Check if this is a return
    pub fn is_return(&self) -> bool {
        matches!(self, Terminator::Return { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_block_creation() {
        let mut block = BasicBlock::with_name(BlockId(0), "entry");
        assert!(block.is_empty());
        assert_eq!(block.name.as_deref(), Some("entry"));

        block.add_param(ValueId(0), MirType::F32);
        block.push(
            Instruction::new(
                Operation::FAdd {
                    lhs: ValueId(0),
                    rhs: ValueId(0),
                },
                MirType::F32,
            )
            .with_result(ValueId(1)),
        );
        block.terminate(Terminator::Return {
            value: Some(ValueId(1)),
        });

        assert_eq!(block.len(), 1);
        assert_eq!(block.defined_values(), vec![ValueId(0), ValueId(1)]);
        assert_eq!(
            block.used_values(),
            vec![ValueId(0), ValueId(0), ValueId(1)]
        );
        assert!(block.terminator.is_return());
    }

    #[test]
    fn test_terminator_edges() {
        let br = Terminator::Branch {
            cond: ValueId(0),
            then_block: BlockId(1),
            then_args: vec![ValueId(2)],
            else_block: BlockId(2),
            else_args: vec![],
        };
        assert_eq!(br.successors(), vec![BlockId(1), BlockId(2)]);
        assert_eq!(br.selector(), Some(ValueId(0)));
        assert_eq!(br.operands(), vec![ValueId(0), ValueId(2)]);
    }

    #[test]
    fn test_switch_terminator() {
        let mut sw = Terminator::Switch {
            value: ValueId(0),
            default: BlockId(3),
            default_args: vec![],
            cases: vec![(0, BlockId(1), vec![ValueId(5)]), (1, BlockId(2), vec![])],
        };
        assert_eq!(sw.successors(), vec![BlockId(3), BlockId(1), BlockId(2)]);

        sw.map_operands(|v| ValueId(v.0 + 1));
        assert_eq!(sw.operands(), vec![ValueId(1), ValueId(6)]);
    }
}
