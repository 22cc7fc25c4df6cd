//! Shading-language Intermediate Representation (MIR)
//!
//! MIR is the fully type-checked, generics-resolved representation the
//! differentiation pass consumes and extends. It is designed for:
//!
//! - **Structural types**: vectors, matrices, arrays and structs compare by
//!   shape, so differential witnesses can be cached per type
//! - **Explicit dispatch**: interface calls go through witness tables, never
//!   through host-language dynamic dispatch
//! - **Transformability**: every derived function is plain MIR, so later
//!   legalization and emission need no awareness of differentiation
//!
//! # Module Structure
//!
//! - [`types`]: Structural type system
//! - [`value`]: Value and block identifiers for SSA form
//! - [`inst`]: SSA-form instructions
//! - [`block`]: Basic blocks and terminators
//! - [`function`]: Function definitions with CFG and differentiability markers
//! - [`module`]: Module structure with type definitions and witness tables
//! - [`interp`]: Reference evaluator
//! - [`ad`]: The automatic differentiation pass
//!
//! # Example
//!
//! ```rust
//! use shadediff::mir::*;
//!
//! let mut builder = ModuleBuilder::new("example");
//!
//! builder.differentiable(
//!     "mul",
//!     DiffMode::Both,
//!     FunctionSignature::new(vec![MirType::F32, MirType::F32], MirType::F32),
//!     |f| {
//!         let x = f.param(0).unwrap();
//!         let y = f.param(1).unwrap();
//!         let p = f.push_op(Operation::FMul { lhs: x, rhs: y }, MirType::F32);
//!         f.terminate(Terminator::Return { value: Some(p) });
//!     },
//! );
//!
//! let mut module = builder.build();
//! let report = ADTransformer::new(ADConfig {
//!     requests: vec![DiffRequest::new("mul", ADMode::Reverse)],
//!     ..ADConfig::default()
//! })
//! .run(&mut module);
//! assert!(report.is_ok());
//! assert!(module.has_function("mul_bwd_diff"));
//! ```
//!
//! # SSA Form
//!
//! Each value is defined exactly once. Instead of phi nodes, MIR uses block
//! parameters:
//!
//! ```text
//! bb0:
//!   v2 = fcmp ogt v0, v1 : bool
//!   br v2, bb1(v0), bb1(v1)
//!
//! bb1(v3: f32):  // Block parameter instead of phi
//!   ret v3
//! ```

pub mod ad;
pub mod block;
pub mod function;
pub mod inst;
pub mod interp;
pub mod module;
pub mod types;
pub mod value;

// Re-export commonly used types
pub use ad::{ADConfig, ADMode, ADPassReport, ADTransformer, DiffRequest};
pub use block::{BasicBlock, BlockParam, Terminator};
pub use function::{
    DiffMode, FunctionAttributes, FunctionBuilder, FunctionSignature, LocalDecl, MirFunction, ValidationError,
};
pub use inst::{Callee, FloatPredicate, Instruction, IntPredicate, Operation};
pub use interp::{InterpError, Interpreter, Value};
pub use module::{DiffConformance, MirModule, ModuleBuilder, TypeDef, WitnessTable};
pub use types::{MirType, ResourceKind, StructField};
pub use value::{BlockId, BlockIdGen, Span, ValueId, ValueIdGen};

/// MIR version
pub const MIR_VERSION: &str = "0.1.0";

/// Check if a MIR module is well-formed
pub fn validate_module(module: &MirModule) -> Result<(), Vec<(String, ValidationError)>> {
    module.validate()
}

/// Pretty-print a MIR module
pub fn print_module(module: &MirModule) -> String {
    let mut output = String::new();

    output.push_str(&format!("; MIR Module: {}\n", module.name));
    output.push_str(&format!("; Version: {}\n\n", MIR_VERSION));

    if !module.types.is_empty() {
        output.push_str("; Type Definitions\n");
        for type_def in &module.types {
            output.push_str(&format!("type {} = {}", type_def.name, type_def.ty));
            if let Some(conf) = &type_def.conformance {
                output.push_str(&format!(
                    " : Differentiable<{}, zero = @{}, add = @{}>",
                    conf.differential, conf.zero_fn, conf.add_fn
                ));
            }
            output.push('\n');
        }
        output.push('\n');
    }

    if !module.witness_tables.is_empty() {
        output.push_str("; Witness Tables\n");
        for table in &module.witness_tables {
            output.push_str(&format!("witness {} : {} {{\n", table.name, table.interface));
            for (requirement, function) in &table.entries {
                output.push_str(&format!("  {} = @{}\n", requirement, function));
            }
            output.push_str("}\n");
        }
        output.push('\n');
    }

    for func in &module.functions {
        output.push_str(&print_function(func));
        output.push('\n');
    }

    output
}

/// Pretty-print a MIR function
pub fn print_function(func: &MirFunction) -> String {
    let mut output = String::new();

    if let Some(mode) = func.attributes.differentiable {
        output.push_str(&format!("[differentiable({:?})]\n", mode).to_lowercase());
    }
    if let Some(source) = &func.attributes.derived_from {
        output.push_str(&format!("; derived from @{}\n", source));
    }

    let params: Vec<String> = func
        .signature
        .params
        .iter()
        .enumerate()
        .map(|(i, ty)| match func.signature.param_names.get(i) {
            Some(name) => format!("{}: {}", name, ty),
            None => ty.to_string(),
        })
        .collect();

    if func.is_declaration() {
        output.push_str(&format!(
            "declare @{}({}) -> {}\n",
            func.name,
            params.join(", "),
            func.signature.return_type
        ));
        return output;
    }

    output.push_str(&format!(
        "fn @{}({}) -> {} {{\n",
        func.name,
        params.join(", "),
        func.signature.return_type
    ));
    for (i, local) in func.locals.iter().enumerate() {
        output.push_str(&format!("  local ${} {}: {}\n", i, local.name, local.ty));
    }

    for block in &func.blocks {
        output.push_str(&print_block(block));
    }

    output.push_str("}\n");
    output
}

/// Pretty-print a basic block
pub fn print_block(block: &BasicBlock) -> String {
    let mut output = String::new();

    let default_name = format!("bb{}", block.id.0);
    let name = block.name.as_deref().unwrap_or(&default_name);

    if block.params.is_empty() {
        output.push_str(&format!("  {}:\n", name));
    } else {
        let params: Vec<String> = block
            .params
            .iter()
            .map(|p| format!("{}: {}", p.value, p.ty))
            .collect();
        output.push_str(&format!("  {}({}):\n", name, params.join(", ")));
    }

    for inst in &block.instructions {
        output.push_str(&format!("    {}\n", print_instruction(inst)));
    }

    output.push_str(&format!("    {}\n", print_terminator(&block.terminator)));

    output
}

/// Pretty-print an instruction
pub fn print_instruction(inst: &Instruction) -> String {
    match inst.result {
        Some(v) => format!("{} = {} : {}", v, print_operation(&inst.op), inst.ty),
        None => print_operation(&inst.op),
    }
}

fn list(values: &[ValueId]) -> String {
    values
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn print_callee(callee: &Callee) -> String {
    match callee {
        Callee::Direct(name) => format!("@{}", name),
        Callee::Witness { table, requirement } => format!("{}.{}", table, requirement),
        Callee::Dynamic {
            witness,
            interface,
            requirement,
        } => format!("{}<{}>.{}", witness, interface, requirement),
    }
}

/// Pretty-print an operation
pub fn print_operation(op: &Operation) -> String {
    let name = op.name();
    match op {
        Operation::ConstInt { value, .. } => format!("const {}", value),
        Operation::ConstFloat { value, .. } => format!("const {:?}", value),
        Operation::ConstBool { value } => format!("const {}", value),
        Operation::ZeroInit { ty } => format!("zeroinit {}", ty),
        Operation::WitnessRef { table } => format!("witness_ref {}", table),
        Operation::ICmp { pred, lhs, rhs } => format!("icmp {:?} {}, {}", pred, lhs, rhs).to_lowercase(),
        Operation::FCmp { pred, lhs, rhs } => format!("fcmp {:?} {}, {}", pred, lhs, rhs).to_lowercase(),
        Operation::SIToFP { operand, to }
        | Operation::FPToSI { operand, to }
        | Operation::FConvert { operand, to }
        | Operation::Bitcast { operand, to } => format!("{} {} to {}", name, operand, to),
        Operation::ExtractField { aggregate, index } => format!("{} {}, {}", name, aggregate, index),
        Operation::InsertField {
            aggregate,
            index,
            value,
        } => format!("{} {}, {}, {}", name, aggregate, index, value),
        Operation::Swizzle { vector, lanes } => {
            const LANES: [char; 4] = ['x', 'y', 'z', 'w'];
            let mask: String = lanes
                .iter()
                .map(|l| LANES.get(*l as usize).copied().unwrap_or('?'))
                .collect();
            format!("swizzle {}.{}", vector, mask)
        }
        Operation::VecShuffle { vec1, vec2, mask } => format!("shuffle {}, {}, {:?}", vec1, vec2, mask),
        Operation::Call {
            callee,
            args,
            no_diff,
            ..
        } => {
            let prefix = if *no_diff { "no_diff " } else { "" };
            format!("{}call {}({})", prefix, print_callee(callee), list(args))
        }
        Operation::FwdDiff { function, args } | Operation::BwdDiff { function, args } => {
            format!("{}(@{})({})", name, function, list(args))
        }
        Operation::LocalGet { local } => format!("local.get ${}", local),
        Operation::LocalSet { local, value } => format!("local.set ${}, {}", local, value),
        Operation::CheckpointPop => name.to_string(),
        other => format!("{} {}", name, list(&other.operands())),
    }
}

/// Pretty-print a terminator
pub fn print_terminator(term: &Terminator) -> String {
    let edge = |target: &BlockId, args: &[ValueId]| {
        if args.is_empty() {
            target.to_string()
        } else {
            format!("{}({})", target, list(args))
        }
    };
    match term {
        Terminator::Goto { target, args } => format!("goto {}", edge(target, args)),
        Terminator::Branch {
            cond,
            then_block,
            then_args,
            else_block,
            else_args,
        } => format!(
            "br {}, {}, {}",
            cond,
            edge(then_block, then_args),
            edge(else_block, else_args)
        ),
        Terminator::Switch {
            value,
            default,
            default_args,
            cases,
        } => {
            let arms: Vec<String> = cases
                .iter()
                .map(|(k, target, args)| format!("{} => {}", k, edge(target, args)))
                .collect();
            format!(
                "switch {} [{}], default {}",
                value,
                arms.join(", "),
                edge(default, default_args)
            )
        }
        Terminator::Return { value: Some(v) } => format!("ret {}", v),
        Terminator::Return { value: None } => "ret void".to_string(),
        Terminator::Unreachable => "unreachable".to_string(),
    }
}
