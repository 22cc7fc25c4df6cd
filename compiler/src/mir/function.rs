//! MIR Functions
//!
//! MIR functions contain the CFG of basic blocks representing the function body,
//! plus the differentiability markers the front end attached to them.

use std::collections::{HashMap, HashSet};

use super::block::*;
use super::inst::{Instruction, Operation};
use super::types::*;
use super::value::*;

/// A MIR function
#[derive(Clone, Debug)]
pub struct MirFunction {
    /// Function name
    pub name: String,
    /// Function signature
    pub signature: FunctionSignature,
    /// Basic blocks (CFG), entry first
    pub blocks: Vec<BasicBlock>,
    /// Mutable local slots
    pub locals: Vec<LocalDecl>,
    /// Attributes
    pub attributes: FunctionAttributes,
    /// Location of the definition
    pub span: Option<Span>,
}

impl MirFunction {
    /// Create a new function
    pub fn new(name: &str, signature: FunctionSignature) -> Self {
        Self {
            name: name.to_string(),
            signature,
            blocks: Vec::new(),
            locals: Vec::new(),
            attributes: FunctionAttributes::default(),
            span: None,
        }
    }

    /// Add a basic block
    pub fn add_block(&mut self, block: BasicBlock) -> BlockId {
        let id = block.id;
        self.blocks.push(block);
        id
    }

    /// Add a local slot
    pub fn add_local(&mut self, decl: LocalDecl) -> usize {
        let idx = self.locals.len();
        self.locals.push(decl);
        idx
    }

    /// Get the entry block
    pub fn entry_block(&self) -> Option<&BasicBlock> {
        self.blocks.first()
    }

    /// Get a block by ID
    pub fn block(&self, id: BlockId) -> Option<&BasicBlock> {
        self.blocks.iter().find(|b| b.id == id)
    }

    /// Get a block mutably by ID
    pub fn block_mut(&mut self, id: BlockId) -> Option<&mut BasicBlock> {
        self.blocks.iter_mut().find(|b| b.id == id)
    }

    /// Number of blocks
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Is this function a declaration only (no body)?
    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn return_type(&self) -> &MirType {
        &self.signature.return_type
    }

    pub fn param_types(&self) -> &[MirType] {
        &self.signature.params
    }

    /// Parameter values of the entry block
    pub fn param_values(&self) -> Vec<ValueId> {
        self.entry_block()
            .map(|b| b.params.iter().map(|p| p.value).collect())
            .unwrap_or_default()
    }

    /// Type of every value defined in the function
    pub fn value_types(&self) -> HashMap<ValueId, MirType> {
        let mut types = HashMap::new();
        for block in &self.blocks {
            for p in &block.params {
                types.insert(p.value, p.ty.clone());
            }
            for inst in &block.instructions {
                if let Some(r) = inst.result {
                    types.insert(r, inst.ty.clone());
                }
            }
        }
        types
    }

    /// One past the highest value id in use
    pub fn next_value_id(&self) -> u32 {
        self.blocks
            .iter()
            .flat_map(|b| b.defined_values())
            .map(|v| v.0 + 1)
            .max()
            .unwrap_or(0)
    }

    /// Compute predecessor map
    pub fn predecessors(&self) -> HashMap<BlockId, Vec<BlockId>> {
        let mut preds: HashMap<BlockId, Vec<BlockId>> = HashMap::new();

        for block in &self.blocks {
            preds.entry(block.id).or_default();
        }

        for block in &self.blocks {
            for succ in block.successors() {
                preds.entry(succ).or_default().push(block.id);
            }
        }

        preds
    }

    /// Blocks reachable from entry, in reverse post-order
    pub fn reverse_post_order(&self) -> Vec<BlockId> {
        let Some(entry) = self.entry_block() else {
            return Vec::new();
        };

        let mut visited = HashSet::new();
        let mut post = Vec::new();
        // (block, next successor index)
        let mut stack: Vec<(BlockId, usize)> = vec![(entry.id, 0)];
        visited.insert(entry.id);

        while let Some((id, idx)) = stack.pop() {
            let succs = self.block(id).map(|b| b.successors()).unwrap_or_default();
            if idx < succs.len() {
                stack.push((id, idx + 1));
                let next = succs[idx];
                if visited.insert(next) {
                    stack.push((next, 0));
                }
            } else {
                post.push(id);
            }
        }

        post.reverse();
        post
    }

    /// Check that the function is well-formed SSA
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.blocks.is_empty() {
            return Err(ValidationError::EmptyFunction);
        }

        let entry = &self.blocks[0];
        if entry.id != BlockId::ENTRY {
            return Err(ValidationError::InvalidEntryBlock);
        }
        let entry_types: Vec<&MirType> = entry.params.iter().map(|p| &p.ty).collect();
        if entry_types.len() != self.signature.params.len()
            || entry_types
                .iter()
                .zip(&self.signature.params)
                .any(|(a, b)| *a != b)
        {
            return Err(ValidationError::SignatureMismatch);
        }

        let mut defined = HashSet::new();
        for block in &self.blocks {
            for v in block.defined_values() {
                if !defined.insert(v) {
                    return Err(ValidationError::MultipleDefinition(v));
                }
            }
        }

        for block in &self.blocks {
            for v in block.used_values() {
                if !defined.contains(&v) {
                    return Err(ValidationError::UndefinedValue(v));
                }
            }

            for inst in &block.instructions {
                let local = match &inst.op {
                    Operation::LocalGet { local } | Operation::LocalSet { local, .. } => {
                        Some(*local)
                    }
                    _ => None,
                };
                if let Some(local) = local {
                    if local >= self.locals.len() {
                        return Err(ValidationError::InvalidLocal(local));
                    }
                }
            }

            for (succ, args) in block.terminator.edges() {
                if succ == BlockId::ENTRY {
                    return Err(ValidationError::EntryHasPredecessor(block.id));
                }
                let target = self
                    .block(succ)
                    .ok_or(ValidationError::InvalidBlockReference(succ))?;
                if target.params.len() != args.len() {
                    return Err(ValidationError::ArgumentCount {
                        block: succ,
                        expected: target.params.len(),
                        found: args.len(),
                    });
                }
            }

            if let Terminator::Return { value } = &block.terminator {
                let returns_value = !matches!(self.signature.return_type, MirType::Void);
                if value.is_some() != returns_value {
                    return Err(ValidationError::ReturnMismatch(block.id));
                }
            }
        }

        Ok(())
    }
}

/// Function signature
#[derive(Clone, Debug, PartialEq)]
pub struct FunctionSignature {
    /// Parameter types
    pub params: Vec<MirType>,
    /// Parameter names (for debug info)
    pub param_names: Vec<String>,
    /// Return type
    pub return_type: MirType,
}

impl FunctionSignature {
    pub fn new(params: Vec<MirType>, return_type: MirType) -> Self {
        let param_names = (0..params.len()).map(|i| format!("arg{}", i)).collect();
        Self {
            params,
            param_names,
            return_type,
        }
    }

    pub fn with_names(mut self, names: Vec<String>) -> Self {
        self.param_names = names;
        self
    }

    /// Get arity (number of parameters)
    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

/// Mutable local slot declaration
#[derive(Clone, Debug)]
pub struct LocalDecl {
    /// Slot name (for debug info)
    pub name: String,
    /// Type
    pub ty: MirType,
    /// Source location
    pub span: Option<Span>,
}

impl LocalDecl {
    pub fn new(name: &str, ty: MirType) -> Self {
        Self {
            name: name.to_string(),
            ty,
            span: None,
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }
}

/// Differentiability marker on a function
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DiffMode {
    /// Forward mode only
    Forward,
    /// Reverse mode only
    Reverse,
    /// Both modes (`[Differentiable]`)
    Both,
}

impl DiffMode {
    pub fn allows_forward(&self) -> bool {
        matches!(self, DiffMode::Forward | DiffMode::Both)
    }

    pub fn allows_reverse(&self) -> bool {
        matches!(self, DiffMode::Reverse | DiffMode::Both)
    }
}

/// Function attributes
#[derive(Clone, Debug, Default)]
pub struct FunctionAttributes {
    /// Differentiability marker, if any
    pub differentiable: Option<DiffMode>,
    /// User-supplied forward derivative
    pub custom_fwd: Option<String>,
    /// User-supplied backward derivative
    pub custom_bwd: Option<String>,
    /// Set on functions synthesized by the differentiation pass
    pub derived_from: Option<String>,
}

/// Validation error
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("function has no basic blocks")]
    EmptyFunction,

    #[error("entry block must have ID 0")]
    InvalidEntryBlock,

    #[error("entry block parameters do not match the signature")]
    SignatureMismatch,

    #[error("{0} branches back to the entry block")]
    EntryHasPredecessor(BlockId),

    #[error("reference to undefined block {0}")]
    InvalidBlockReference(BlockId),

    #[error("reference to undefined value {0}")]
    UndefinedValue(ValueId),

    #[error("value {0} defined more than once")]
    MultipleDefinition(ValueId),

    #[error("reference to undeclared local {0}")]
    InvalidLocal(usize),

    #[error("edge to {block} passes {found} arguments, expected {expected}")]
    ArgumentCount {
        block: BlockId,
        expected: usize,
        found: usize,
    },

    #[error("return in {0} does not match the return type")]
    ReturnMismatch(BlockId),
}

/// Builder for constructing MIR functions
pub struct FunctionBuilder {
    function: MirFunction,
    value_gen: ValueIdGen,
    block_gen: BlockIdGen,
    current_block: Option<BlockId>,
    value_types: HashMap<ValueId, MirType>,
    span: Option<Span>,
}

impl FunctionBuilder {
    pub fn new(name: &str, signature: FunctionSignature) -> Self {
        let mut function = MirFunction::new(name, signature);
        let mut block_gen = BlockIdGen::new();
        let mut value_gen = ValueIdGen::new();
        let mut value_types = HashMap::new();

        // Create entry block with parameters
        let entry_id = block_gen.next();
        let mut entry = BasicBlock::with_name(entry_id, "entry");

        for ty in &function.signature.params {
            let param_id = value_gen.next();
            entry.add_param(param_id, ty.clone());
            value_types.insert(param_id, ty.clone());
        }

        function.add_block(entry);

        Self {
            function,
            value_gen,
            block_gen,
            current_block: Some(entry_id),
            value_types,
            span: None,
        }
    }

    /// Create a new basic block
    pub fn create_block(&mut self) -> BlockId {
        let id = self.block_gen.next();
        self.function.add_block(BasicBlock::new(id));
        id
    }

    /// Create a new basic block with a name
    pub fn create_named_block(&mut self, name: &str) -> BlockId {
        let id = self.block_gen.next();
        self.function.add_block(BasicBlock::with_name(id, name));
        id
    }

    /// Switch to a different block
    pub fn switch_to(&mut self, block: BlockId) {
        self.current_block = Some(block);
    }

    /// Get current block
    pub fn current_block(&self) -> Option<BlockId> {
        self.current_block
    }

    /// Source span attached to instructions pushed from now on
    pub fn set_span(&mut self, span: Option<Span>) {
        self.span = span;
    }

    /// Source span of the function definition itself
    pub fn set_function_span(&mut self, span: Span) {
        self.function.span = Some(span);
    }

    /// Mark the function with attributes
    pub fn attributes_mut(&mut self) -> &mut FunctionAttributes {
        &mut self.function.attributes
    }

    /// Add a parameter to the current block
    pub fn block_param(&mut self, ty: MirType) -> ValueId {
        match self.current_block {
            Some(block) => self.block_param_on(block, ty),
            None => self.value_gen.next(),
        }
    }

    /// Add a parameter to a specific block
    pub fn block_param_on(&mut self, block: BlockId, ty: MirType) -> ValueId {
        let value = self.value_gen.next();
        self.value_types.insert(value, ty.clone());
        if let Some(b) = self.function.block_mut(block) {
            b.add_param(value, ty);
        }
        value
    }

    /// Add an instruction to current block
    pub fn push_op(&mut self, op: Operation, ty: MirType) -> ValueId {
        let result = self.value_gen.next();
        self.value_types.insert(result, ty.clone());
        let mut inst = Instruction::new(op, ty).with_result(result);
        inst.span = self.span;
        self.push_inst(inst);
        result
    }

    /// Add a void instruction
    pub fn push_void(&mut self, op: Operation) {
        let mut inst = Instruction::new(op, MirType::Void);
        inst.span = self.span;
        self.push_inst(inst);
    }

    fn push_inst(&mut self, inst: Instruction) {
        if let Some(block_id) = self.current_block {
            if let Some(block) = self.function.block_mut(block_id) {
                block.push(inst);
            }
        }
    }

    /// Float constant of any float-shaped type
    pub fn const_float(&mut self, value: f64, ty: MirType) -> ValueId {
        self.push_op(
            Operation::ConstFloat {
                value,
                ty: ty.clone(),
            },
            ty,
        )
    }

    pub fn const_int(&mut self, value: i64) -> ValueId {
        self.push_op(
            Operation::ConstInt {
                value,
                ty: MirType::I32,
            },
            MirType::I32,
        )
    }

    /// Terminate current block
    pub fn terminate(&mut self, terminator: Terminator) {
        if let Some(block_id) = self.current_block {
            if let Some(block) = self.function.block_mut(block_id) {
                block.terminate(terminator);
            }
        }
    }

    /// Add a local slot
    pub fn add_local(&mut self, name: &str, ty: MirType) -> usize {
        self.function.add_local(LocalDecl::new(name, ty))
    }

    /// Type of a local slot
    pub fn local_type(&self, local: usize) -> Option<&MirType> {
        self.function.locals.get(local).map(|l| &l.ty)
    }

    /// Get function parameter value
    pub fn param(&self, idx: usize) -> Option<ValueId> {
        self.function
            .entry_block()
            .and_then(|b| b.params.get(idx))
            .map(|p| p.value)
    }

    /// Type of a value created through this builder
    pub fn type_of(&self, value: ValueId) -> Option<&MirType> {
        self.value_types.get(&value)
    }

    /// Finish building and return the function
    pub fn build(self) -> MirFunction {
        self.function
    }

    /// Build with validation
    pub fn build_validated(self) -> Result<MirFunction, ValidationError> {
        self.function.validate()?;
        Ok(self.function)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::inst::Operation;

    #[test]
    fn test_function_builder() {
        let sig = FunctionSignature::new(vec![MirType::F32, MirType::F32], MirType::F32);
        let mut builder = FunctionBuilder::new("add", sig);

        let x = builder.param(0).unwrap();
        let y = builder.param(1).unwrap();
        let sum = builder.push_op(Operation::FAdd { lhs: x, rhs: y }, MirType::F32);
        builder.terminate(Terminator::Return { value: Some(sum) });

        assert_eq!(builder.type_of(sum), Some(&MirType::F32));
        let func = builder.build_validated().unwrap();
        assert_eq!(func.num_blocks(), 1);
        assert_eq!(func.next_value_id(), 3);
        assert_eq!(func.value_types()[&sum], MirType::F32);
    }

    #[test]
    fn test_function_with_branches() {
        let sig = FunctionSignature::new(vec![MirType::Bool], MirType::I32);
        let mut builder = FunctionBuilder::new("conditional", sig);

        let cond = builder.param(0).unwrap();
        let then_block = builder.create_named_block("then");
        let else_block = builder.create_named_block("else");
        let merge_block = builder.create_named_block("merge");

        builder.terminate(Terminator::Branch {
            cond,
            then_block,
            then_args: vec![],
            else_block,
            else_args: vec![],
        });

        builder.switch_to(then_block);
        let then_val = builder.const_int(1);
        builder.terminate(Terminator::Goto {
            target: merge_block,
            args: vec![then_val],
        });

        builder.switch_to(else_block);
        let else_val = builder.const_int(0);
        builder.terminate(Terminator::Goto {
            target: merge_block,
            args: vec![else_val],
        });

        builder.switch_to(merge_block);
        let result = builder.block_param(MirType::I32);
        builder.terminate(Terminator::Return {
            value: Some(result),
        });

        let func = builder.build_validated().unwrap();
        assert_eq!(func.num_blocks(), 4);

        let rpo = func.reverse_post_order();
        assert_eq!(rpo.first(), Some(&BlockId::ENTRY));
        assert_eq!(rpo.last(), Some(&merge_block));
        assert_eq!(rpo.len(), 4);
    }

    #[test]
    fn test_validation_catches_bad_edges() {
        let sig = FunctionSignature::new(vec![], MirType::Void);
        let mut builder = FunctionBuilder::new("bad", sig);
        let target = builder.create_block();
        builder.switch_to(target);
        builder.block_param(MirType::F32);
        builder.terminate(Terminator::Return { value: None });
        builder.switch_to(BlockId::ENTRY);
        builder.terminate(Terminator::Goto {
            target,
            args: vec![],
        });

        assert_eq!(
            builder.build_validated().unwrap_err(),
            ValidationError::ArgumentCount {
                block: target,
                expected: 1,
                found: 0
            }
        );
    }

    #[test]
    fn test_validation_rejects_edge_into_entry() {
        let sig = FunctionSignature::new(vec![MirType::F32], MirType::F32);
        let mut builder = FunctionBuilder::new("spin", sig);
        let x = builder.param(0).unwrap();
        let body = builder.create_block();
        builder.terminate(Terminator::Goto {
            target: body,
            args: vec![],
        });
        builder.switch_to(body);
        builder.terminate(Terminator::Goto {
            target: BlockId::ENTRY,
            args: vec![x],
        });

        assert_eq!(
            builder.build_validated().unwrap_err(),
            ValidationError::EntryHasPredecessor(body)
        );
    }

    #[test]
    fn test_validation_catches_undefined_value() {
        let sig = FunctionSignature::new(vec![], MirType::F32);
        let mut builder = FunctionBuilder::new("undef", sig);
        builder.terminate(Terminator::Return {
            value: Some(ValueId(99)),
        });
        assert_eq!(
            builder.build_validated().unwrap_err(),
            ValidationError::UndefinedValue(ValueId(99))
        );
    }

    #[test]
    fn test_predecessors() {
        let sig = FunctionSignature::new(vec![], MirType::Void);
        let mut builder = FunctionBuilder::new("test", sig);

        let bb1 = builder.create_block();
        let bb2 = builder.create_block();

        let cond = builder.push_op(Operation::ConstBool { value: true }, MirType::Bool);
        builder.terminate(Terminator::Branch {
            cond,
            then_block: bb1,
            then_args: vec![],
            else_block: bb2,
            else_args: vec![],
        });

        builder.switch_to(bb1);
        builder.terminate(Terminator::Return { value: None });
        builder.switch_to(bb2);
        builder.terminate(Terminator::Return { value: None });

        let func = builder.build();
        let preds = func.predecessors();

        assert!(preds[&BlockId::ENTRY].is_empty());
        assert_eq!(preds[&bb1], vec![BlockId::ENTRY]);
        assert_eq!(preds[&bb2], vec![BlockId::ENTRY]);
    }

    #[test]
    fn test_diff_mode() {
        assert!(DiffMode::Both.allows_forward());
        assert!(DiffMode::Both.allows_reverse());
        assert!(!DiffMode::Forward.allows_reverse());
        assert!(!DiffMode::Reverse.allows_forward());
    }
}
