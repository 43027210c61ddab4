use super::*;
use crate::ir::{
    verify::verify_module, FuncId, FuncRef, Function, InstKind, Module, ModuleBuilder, Operand,
    Terminator,
};
use crate::language::parser::parse_program;
use crate::runtime::{Interpreter, RunOutcome, Value};

fn compile_source(source: &str) -> Module {
    let program = parse_program(source).expect("parse");
    let mut builder = ModuleBuilder::new("tests");
    compile_program(&mut builder, &program).expect("compile");
    builder.finish()
}

fn function<'m>(module: &'m Module, name: &str) -> &'m Function {
    module
        .function_by_name(name)
        .map(|(_, func)| func)
        .unwrap_or_else(|| panic!("no function `{name}`"))
}

const RESCUE_RETRY: &str = r#"
def m {
  set tries = 0
  begin {
    incr tries
    raise Flaky
  } rescue Flaky {
    if tries < 3 { retry }
  } ensure {
    puts "done"
  }
  return tries
}
"#;

#[test]
fn construct_emits_every_protocol_block() {
    let module = compile_source(RESCUE_RETRY);
    let method = function(&module, "m");
    for name in [
        "exception-entry",
        "exception-body-return",
        "exception-body-continue",
        "exception-ensure",
        "exception-return",
        "exception-continue",
    ] {
        assert!(method.block_by_name(name).is_some(), "missing block {name}");
    }
    assert!(verify_module(&module).is_ok());
}

#[test]
fn region_functions_follow_the_body_id_layout() {
    let module = compile_source(RESCUE_RETRY);
    for name in ["m$begin1", "m$rescue1", "m$ensure1"] {
        function(&module, name);
    }
    assert!(module.function_by_name("m$else1").is_none());

    // the missing else is replaced by the do-nothing runtime callee
    let method = function(&module, "m");
    let stand_in = method.instructions().any(|(_, inst)| {
        matches!(
            inst.kind,
            InstKind::Select {
                else_value: Operand::Func(FuncRef::Runtime(RuntimeFn::BlockReturnUndef)),
                ..
            }
        )
    });
    assert!(stand_in);
}

#[test]
fn exception_storage_is_allocated_in_the_initializer() {
    let module = compile_source(RESCUE_RETRY);
    let method = function(&module, "m");
    let allocas: Vec<_> = method
        .instructions()
        .filter(|(_, inst)| matches!(inst.kind, InstKind::Alloca))
        .map(|(block, _)| block)
        .collect();
    // line number slot plus the captured exception slot
    assert_eq!(allocas.len(), 2);
    assert!(allocas.iter().all(|block| *block == method.init));
}

#[test]
fn retry_branches_back_to_the_entry_block() {
    let module = compile_source(RESCUE_RETRY);
    let method = function(&module, "m");
    let entry = method.block_by_name("exception-entry").unwrap();
    let ensure = method.block_by_name("exception-ensure").unwrap();

    let retry_edges: Vec<_> = method
        .blocks
        .iter()
        .filter(|block| {
            matches!(
                block.terminator,
                Some(Terminator::CondBr { then_block, else_block, .. })
                    if then_block == entry && else_block == ensure
            )
        })
        .collect();
    assert_eq!(retry_edges.len(), 1);
    assert_eq!(retry_edges[0].name, "exception-body-continue");
}

#[test]
fn body_and_handler_run_guarded_but_ensure_does_not() {
    let module = compile_source(RESCUE_RETRY);
    let method = function(&module, "m");
    let (ensure_id, _) = module.function_by_name("m$ensure1").unwrap();

    let tries = method
        .calls()
        .filter(|(callee, _)| *callee == FuncRef::Runtime(RuntimeFn::Try))
        .count();
    assert_eq!(tries, 2);

    let direct_ensure_calls = method
        .calls()
        .filter(|(callee, _)| *callee == FuncRef::Ir(ensure_id))
        .count();
    // once on the early-return path and once on the normal path
    assert_eq!(direct_ensure_calls, 2);
}

#[test]
fn rescue_clauses_clear_the_exception_variable() {
    let module = compile_source(RESCUE_RETRY);
    let handlers = function(&module, "m$rescue1");
    let body = handlers.block_by_name("rescue.body").unwrap();
    let clears = handlers.blocks[body.index()].insts.iter().any(|inst| {
        matches!(
            inst.kind,
            InstKind::LocalSet {
                value: Operand::Const(crate::ir::Constant::Nil),
                ..
            }
        )
    });
    assert!(clears);
}

#[test]
fn nested_constructs_verify() {
    let module = compile_source(
        r#"
        def outer {
          begin {
            begin {
              raise Inner
            } rescue Inner => e {
              raise Outer, "wrapped"
            } else {
              puts "unreachable"
            }
          } rescue Outer {
            puts $!
          }
          begin {
            return 1
          } ensure {
            puts "second"
          }
        }
        "#,
    );
    assert!(verify_module(&module).is_ok(), "{module}");
    function(&module, "outer$begin5");
    function(&module, "outer$else5");
    // two constructs in one function get distinct entry blocks
    let method = function(&module, "outer");
    assert!(method
        .blocks
        .iter()
        .filter(|block| block.name.starts_with("exception-entry"))
        .nth(1)
        .is_some());
}

#[test]
fn retry_outside_a_rescue_clause_is_rejected() {
    let program = parse_program("def m {\n  begin {\n    retry\n  } rescue { }\n}").unwrap();
    let mut builder = ModuleBuilder::new("tests");
    let err = compile_program(&mut builder, &program).unwrap_err();
    assert!(matches!(err, CompileError::RetryOutsideRescue { .. }));
    assert_eq!(err.span().map(|span| span.start), Some(22));
}

#[test]
fn lowering_reports_missing_and_mistyped_regions() {
    let mut builder = ModuleBuilder::new("tests");
    let mut ctx = EmitterContext::<ModuleBuilder>::new();
    let scope = RegionId(0);
    let regions = ExceptionRegions::from_body(RegionId(1));
    assert_eq!(regions.handlers, RegionId(2));
    assert_eq!(regions.ensure, RegionId(3));
    assert_eq!(regions.else_region, RegionId(4));

    let method = builder.add_function("m").unwrap();
    let init = builder.init_block(method).unwrap();
    builder.position_before_terminator(init);
    let line_ptr = builder.build_alloca("lineno").unwrap();
    ctx.define_region(scope, FunctionType::Method, method, init, line_ptr);

    let body = builder.add_function("m$begin1").unwrap();
    let body_init = builder.init_block(body).unwrap();
    ctx.define_region(regions.body, FunctionType::Body, body, body_init, line_ptr);

    let entry = builder.entry_block(method).unwrap();
    builder.position_at_end(entry);
    // the early-return path needs the ensure region before any handler lookup
    let err = emit_exception_handlers(&mut builder, &ctx, scope, regions, LocalId(0)).unwrap_err();
    assert_eq!(err, LowerError::UnknownRegion(regions.ensure));

    ctx.mark_unused(regions.handlers);
    ctx.mark_unused(regions.else_region);
    ctx.mark_unused(regions.ensure);
    let fresh = builder.append_block(method, "second-attempt").unwrap();
    builder.position_at_end(fresh);
    let err = emit_exception_handlers(&mut builder, &ctx, scope, regions, LocalId(0)).unwrap_err();
    assert_eq!(
        err,
        LowerError::RegionKind {
            id: regions.handlers,
            expected: FunctionType::Handlers,
            found: FunctionType::Unused,
        }
    );
}

fn define_stub(
    builder: &mut ModuleBuilder,
    ctx: &mut EmitterContext<ModuleBuilder>,
    name: &str,
    id: RegionId,
    kind: FunctionType,
) -> FuncId {
    let function = builder.add_function(name).unwrap();
    let init = builder.init_block(function).unwrap();
    builder.position_before_terminator(init);
    let line_ptr = builder.build_alloca("lineno").unwrap();
    let entry = builder.entry_block(function).unwrap();
    builder.position_at_end(entry);
    if kind != FunctionType::Method {
        let undef = builder.literal(Literal::Undef).unwrap();
        builder.build_return(undef).unwrap();
    }
    ctx.define_region(id, kind, function, init, line_ptr);
    function
}

#[test]
fn explicit_region_ids_need_not_follow_the_body_layout() {
    let mut builder = ModuleBuilder::new("tests");
    let mut ctx = EmitterContext::<ModuleBuilder>::new();
    let scope = RegionId(0);
    let regions = ExceptionRegions::new(RegionId(10), RegionId(20), RegionId(30), RegionId(40));
    assert_ne!(regions, ExceptionRegions::from_body(RegionId(10)));

    let method = define_stub(&mut builder, &mut ctx, "m", scope, FunctionType::Method);
    let body = define_stub(&mut builder, &mut ctx, "body", regions.body, FunctionType::Body);
    let handlers = define_stub(
        &mut builder,
        &mut ctx,
        "handlers",
        regions.handlers,
        FunctionType::Handlers,
    );
    ctx.mark_unused(regions.else_region);
    ctx.mark_unused(regions.ensure);

    let entry = builder.entry_block(method).unwrap();
    builder.position_at_end(entry);
    emit_exception_handlers(&mut builder, &ctx, scope, regions, LocalId(0)).unwrap();
    let nil = builder.literal(Literal::Nil).unwrap();
    builder.build_return(nil).unwrap();
    let module = builder.finish();
    verify_module(&module).unwrap();

    let lowered = function(&module, "m");
    let guarded: Vec<_> = lowered
        .calls()
        .filter(|(callee, _)| *callee == FuncRef::Runtime(RuntimeFn::Try))
        .map(|(_, args)| args[0])
        .collect();
    assert_eq!(guarded[0], Operand::Func(FuncRef::Ir(body)));
    assert!(lowered.instructions().any(|(_, inst)| matches!(
        inst.kind,
        InstKind::Select {
            then_value: Operand::Func(FuncRef::Ir(id)),
            ..
        } if id == handlers
    )));

    let report = Interpreter::new(&module).run_method("m").unwrap();
    assert_eq!(report.outcome, RunOutcome::Returned(Value::Nil));
}
