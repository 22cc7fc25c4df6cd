//! MIR construction, validation, printing and evaluation through the public API

use shadediff::mir::*;

fn vec2() -> MirType {
    MirType::vector(MirType::F32, 2)
}

/// shade(mode, x) = switch mode { 0 => x, 1 => x * x, _ => -x }
fn switch_module() -> MirModule {
    let mut mb = ModuleBuilder::new("switch");
    mb.function(
        "shade",
        FunctionSignature::new(vec![MirType::I32, MirType::F32], MirType::F32).with_names(vec![
            "mode".to_string(),
            "x".to_string(),
        ]),
        |f| {
            let mode = f.param(0).unwrap();
            let x = f.param(1).unwrap();
            let square = f.create_named_block("square");
            let negate = f.create_named_block("negate");
            let join = f.create_named_block("join");
            f.terminate(Terminator::Switch {
                value: mode,
                default: negate,
                default_args: vec![],
                cases: vec![(0, join, vec![x]), (1, square, vec![])],
            });

            f.switch_to(square);
            let sq = f.push_op(Operation::FMul { lhs: x, rhs: x }, MirType::F32);
            f.terminate(Terminator::Goto {
                target: join,
                args: vec![sq],
            });

            f.switch_to(negate);
            let neg = f.push_op(Operation::FNeg { operand: x }, MirType::F32);
            f.terminate(Terminator::Goto {
                target: join,
                args: vec![neg],
            });

            f.switch_to(join);
            let r = f.block_param(MirType::F32);
            f.terminate(Terminator::Return { value: Some(r) });
        },
    );
    mb.build()
}

#[test]
fn test_switch_selects_case_and_default() {
    let module = switch_module();
    assert!(validate_module(&module).is_ok());

    let mut interp = Interpreter::new(&module);
    for (mode, expected) in [(0, 3.0), (1, 9.0), (7, -3.0)] {
        let out = interp.call("shade", vec![Value::Int(mode), Value::Float(3.0)]).unwrap();
        assert_eq!(out, Value::Float(expected), "mode {}", mode);
    }
    assert_eq!(interp.stats().calls, 3);
}

#[test]
fn test_resource_store_is_visible_to_caller() {
    let buffer = MirType::resource(ResourceKind::RWBuffer, vec2());
    let mut mb = ModuleBuilder::new("buffers");
    mb.function(
        "scale_slot",
        FunctionSignature::new(vec![buffer.clone(), MirType::I32], MirType::Void),
        |f| {
            let buf = f.param(0).unwrap();
            let idx = f.param(1).unwrap();
            let v = f.push_op(
                Operation::ResourceLoad {
                    resource: buf,
                    index: idx,
                },
                vec2(),
            );
            let two = f.const_float(2.0, vec2());
            let scaled = f.push_op(Operation::FMul { lhs: v, rhs: two }, vec2());
            f.push_void(Operation::ResourceStore {
                resource: buf,
                index: idx,
                value: scaled,
            });
            f.terminate(Terminator::Return { value: None });
        },
    );
    let module = mb.build();

    let contents = Value::resource(vec![Value::floats(&[1.0, 2.0]), Value::floats(&[3.0, 4.0])]);
    let mut interp = Interpreter::new(&module);
    interp
        .call("scale_slot", vec![contents.clone(), Value::Int(1)])
        .unwrap();
    match &contents {
        Value::Resource(buf) => {
            let buf = buf.borrow();
            assert_eq!(buf[0], Value::floats(&[1.0, 2.0]));
            assert_eq!(buf[1], Value::floats(&[6.0, 8.0]));
        }
        other => panic!("expected a resource, got {:?}", other),
    }

    let err = interp
        .call("scale_slot", vec![contents, Value::Int(5)])
        .unwrap_err();
    assert_eq!(err, InterpError::IndexOutOfBounds { index: 5, len: 2 });
}

#[test]
fn test_locals_hold_values_across_blocks() {
    let mut mb = ModuleBuilder::new("locals");
    mb.function(
        "stash",
        FunctionSignature::new(vec![MirType::F32], MirType::F32),
        |f| {
            let slot = f.add_local("tmp", MirType::F32);
            let x = f.param(0).unwrap();
            let y = f.push_op(Operation::FAdd { lhs: x, rhs: x }, MirType::F32);
            f.push_void(Operation::LocalSet { local: slot, value: y });
            let next = f.create_block();
            f.terminate(Terminator::Goto {
                target: next,
                args: vec![],
            });
            f.switch_to(next);
            let r = f.push_op(Operation::LocalGet { local: slot }, MirType::F32);
            f.terminate(Terminator::Return { value: Some(r) });
        },
    );
    let module = mb.build();
    let text = print_module(&module);
    assert!(text.contains("local $0 tmp: f32"), "{}", text);
    assert_eq!(
        Interpreter::new(&module).call("stash", vec![Value::Float(1.25)]),
        Ok(Value::Float(2.5))
    );
}

#[test]
fn test_unresolved_derivative_is_an_error() {
    let mut mb = ModuleBuilder::new("pending");
    mb.differentiable(
        "sq",
        DiffMode::Forward,
        FunctionSignature::new(vec![MirType::F32], MirType::F32),
        |f| {
            let x = f.param(0).unwrap();
            let r = f.push_op(Operation::FMul { lhs: x, rhs: x }, MirType::F32);
            f.terminate(Terminator::Return { value: Some(r) });
        },
    );
    let pair = MirType::pair(MirType::F32, MirType::F32);
    mb.function("main", FunctionSignature::new(vec![pair.clone()], pair.clone()), |f| {
        let p = f.param(0).unwrap();
        let r = f.push_op(
            Operation::FwdDiff {
                function: "sq".to_string(),
                args: vec![p],
            },
            pair.clone(),
        );
        f.terminate(Terminator::Return { value: Some(r) });
    });
    let module = mb.build();

    let arg = Value::pair(Value::Float(2.0), Value::Float(1.0));
    let err = Interpreter::new(&module).call("main", vec![arg]).unwrap_err();
    assert_eq!(err, InterpError::UnresolvedDerivative("fwd_diff(sq)".to_string()));
    assert!(err.to_string().contains("not rewritten"));
}

#[test]
fn test_step_limit_stops_runaway_loop() {
    let mut mb = ModuleBuilder::new("spin");
    mb.function("spin", FunctionSignature::new(vec![MirType::F32], MirType::F32), |f| {
        let x = f.param(0).unwrap();
        let body = f.create_named_block("body");
        f.terminate(Terminator::Goto {
            target: body,
            args: vec![x],
        });
        f.switch_to(body);
        let acc = f.block_param(MirType::F32);
        let next = f.push_op(Operation::FAdd { lhs: acc, rhs: acc }, MirType::F32);
        f.terminate(Terminator::Goto {
            target: body,
            args: vec![next],
        });
    });
    let module = mb.build();

    let err = Interpreter::new(&module)
        .with_step_limit(100)
        .call("spin", vec![Value::Float(1.0)])
        .unwrap_err();
    assert_eq!(err, InterpError::StepLimit(100));
}

#[test]
fn test_validation_reports_bad_edges() {
    let mut b = FunctionBuilder::new("broken", FunctionSignature::new(vec![MirType::F32], MirType::F32));
    let x = b.param(0).unwrap();
    let target = b.create_block();
    b.terminate(Terminator::Goto {
        target,
        args: vec![x],
    });
    b.switch_to(target);
    b.terminate(Terminator::Return { value: Some(x) });
    let mut module = MirModule::new("broken");
    module.add_function(b.build());

    let errors = validate_module(&module).unwrap_err();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, "broken");
    assert!(matches!(
        errors[0].1,
        ValidationError::ArgumentCount {
            expected: 0,
            found: 1,
            ..
        }
    ));

    let mut b = FunctionBuilder::new("dangling", FunctionSignature::new(vec![], MirType::Void));
    b.terminate(Terminator::Goto {
        target: BlockId(9),
        args: vec![],
    });
    assert_eq!(
        b.build_validated().unwrap_err(),
        ValidationError::InvalidBlockReference(BlockId(9))
    );
}

#[test]
fn test_print_module_lists_types_and_tables() {
    let mut mb = ModuleBuilder::new("printing");
    mb.type_def(
        "Light",
        MirType::structure(
            "Light",
            vec![
                StructField::new("color", MirType::vector(MirType::F32, 3)),
                StructField::no_diff("kind", MirType::I32),
            ],
        ),
    );
    mb.witness_table(WitnessTable::new("Point_Light", "ILight").with_entry("eval", "point_eval"));
    let module = mb.build();

    let text = print_module(&module);
    assert!(text.starts_with("; MIR Module: printing\n"));
    assert!(text.contains(&format!("; Version: {}", MIR_VERSION)));
    assert!(text.contains("type Light = "));
    assert!(text.contains("witness Point_Light : ILight {"));
    assert!(text.contains("  eval = @point_eval"));
}
