use crate::{
    ir::{verify::verify_module, Constant, InstKind, Module, Operand},
    language::{compiler::lower_program, parser::parse_program},
    runtime::{AmbientCell, Interpreter, RunOutcome, RunReport, Value},
};

fn lower(source: &str) -> Module {
    let program = parse_program(source).expect("parse");
    let module = lower_program(&program, "scenario").expect("lower");
    verify_module(&module).expect("verify");
    module
}

fn run_with(source: &str, previous: Value) -> RunReport {
    let module = lower(source);
    let mut interp = Interpreter::with_ambient(&module, AmbientCell::with_pending(previous));
    interp.run_method("m").expect("run")
}

fn run(source: &str) -> RunReport {
    run_with(source, Value::Nil)
}

fn raised_class(report: &RunReport) -> String {
    match &report.outcome {
        RunOutcome::Raised(value) => value
            .as_exception()
            .map(|exception| exception.class.clone())
            .unwrap_or_else(|| panic!("raised a non-exception {value:?}")),
        other => panic!("expected a raise, got {other:?}"),
    }
}

fn is_same(a: &Value, b: &Value) -> bool {
    matches!((a, b), (Value::Exception(_), Value::Exception(_)) if a == b)
}

const NO_EXCEPTION: &str = r#"
def m {
  begin {
    puts "body"
  } rescue {
    puts "handler"
  } else {
    puts "else"
  } ensure {
    puts $!
  }
  return 7
}
"#;

#[test]
fn body_without_raise_runs_else_and_keeps_ambient() {
    let report = run(NO_EXCEPTION);
    assert_eq!(report.output, ["body", "else", "nil"]);
    assert_eq!(report.outcome, RunOutcome::Returned(Value::Int(7)));
    assert!(report.final_errinfo.is_nil());
}

#[test]
fn pending_error_is_reraised_after_ensure_falls_through() {
    let previous = Value::exception("Pending", None);
    let report = run_with(NO_EXCEPTION, previous.clone());
    // ensure observes the restored error, and falling through re-raises it
    assert_eq!(report.output, ["body", "else", "Pending"]);
    match &report.outcome {
        RunOutcome::Raised(value) => assert!(is_same(value, &previous)),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(is_same(&report.final_errinfo, &previous));
}

const CAUGHT_WITH_RETURN: &str = r#"
def m {
  begin {
    raise Boom, "kaboom"
  } rescue Boom => e {
    puts e
    puts $!
    return 5
  } ensure {
    puts $!
  }
  puts "not reached"
}
"#;

#[test]
fn caught_exception_yields_handler_result_and_previous_ambient() {
    let report = run(CAUGHT_WITH_RETURN);
    assert_eq!(report.output, ["kaboom", "kaboom", "nil"]);
    assert_eq!(report.outcome, RunOutcome::Returned(Value::Int(5)));
    assert!(report.final_errinfo.is_nil());

    let previous = Value::exception("Pending", None);
    let report = run_with(CAUGHT_WITH_RETURN, previous.clone());
    assert_eq!(report.output, ["kaboom", "kaboom", "Pending"]);
    assert_eq!(report.outcome, RunOutcome::Returned(Value::Int(5)));
    assert!(is_same(&report.final_errinfo, &previous));
}

#[test]
fn handler_error_takes_precedence_over_body_error() {
    let report = run(
        r#"
        def m {
          begin {
            raise First
          } rescue First {
            raise Second, "from handler"
          } ensure {
            puts $!
          }
        }
        "#,
    );
    assert_eq!(report.output, ["from handler"]);
    assert_eq!(raised_class(&report), "Second");
    assert_eq!(
        report.final_errinfo.as_exception().map(|e| e.class.as_str()),
        Some("Second")
    );
}

#[test]
fn unmatched_body_error_surfaces_after_ensure() {
    let report = run(
        r#"
        def m {
          begin {
            raise Boom
          } rescue Other {
            puts "wrong clause"
          } ensure {
            puts $!
          }
          puts "not reached"
        }
        "#,
    );
    assert_eq!(report.output, ["Boom"]);
    assert_eq!(raised_class(&report), "Boom");
}

const RETRY_LOOP: &str = r#"
def m {
  set tries = 0
  begin {
    incr tries
    puts tries
    if tries < LIMIT {
      raise Flaky
    }
  } rescue Flaky {
    retry
  }
  return tries
}
"#;

fn retry_loop(limit: i64) -> RunReport {
    run(&RETRY_LOOP.replace("LIMIT", &limit.to_string()))
}

#[test]
fn retry_reruns_the_body_once_per_sentinel() {
    let report = retry_loop(3);
    assert_eq!(report.output, ["1", "2", "3"]);
    assert_eq!(report.outcome, RunOutcome::Returned(Value::Int(3)));
    assert!(report.final_errinfo.is_nil());
}

#[test]
fn retry_does_not_grow_the_stack() {
    let short = retry_loop(2);
    let long = retry_loop(300);
    assert_eq!(long.outcome, RunOutcome::Returned(Value::Int(300)));
    assert!(long.stats.allocas > short.stats.allocas);
    assert_eq!(long.stats.peak_slots, short.stats.peak_slots);
}

#[test]
fn retry_restarts_from_a_cleared_exception_variable() {
    let source = r#"
        def m {
          set tries = 0
          begin {
            incr tries
            if tries < 2 {
              raise Flaky
            }
          } rescue Flaky {
            puts "rescued"
            retry
          } else {
            puts "else"
          } ensure {
            puts "ensure"
          }
          return tries
        }
    "#;
    let report = run(source);
    assert_eq!(report.output, ["rescued", "else", "ensure"]);
    assert_eq!(report.outcome, RunOutcome::Returned(Value::Int(2)));

    let module = lower(source);
    let (_, method) = module.function_by_name("m").unwrap();
    let entry = method.block_by_name("exception-entry").unwrap();
    assert!(matches!(
        method.blocks[entry.index()].insts.first().map(|inst| &inst.kind),
        Some(InstKind::LocalSet {
            value: Operand::Const(Constant::Nil),
            ..
        })
    ));
}

#[test]
fn ensure_return_overrides_early_return() {
    let source = r#"
        def m {
          begin {
            return 1
          } ensure {
            puts $!
            return 2
          }
        }
    "#;
    let report = run(source);
    assert_eq!(report.output, ["nil"]);
    assert_eq!(report.outcome, RunOutcome::Returned(Value::Int(2)));

    let previous = Value::exception("Pending", None);
    let report = run_with(source, previous.clone());
    assert_eq!(report.output, ["Pending"]);
    assert_eq!(report.outcome, RunOutcome::Returned(Value::Int(2)));
    assert!(is_same(&report.final_errinfo, &previous));
}

#[test]
fn early_return_without_ensure_keeps_the_body_value() {
    let report = run(
        r#"
        def m {
          begin {
            return "early"
          } rescue {
            puts "handler"
          }
          return "late"
        }
        "#,
    );
    assert!(report.output.is_empty());
    assert_eq!(report.outcome, RunOutcome::Returned(Value::Str("early".into())));
}

#[test]
fn handled_error_with_falling_ensure_continues_normally() {
    let report = run(
        r#"
        def m {
          begin {
            raise Boom
          } rescue Boom {
            puts "handled"
          } ensure {
            puts "ensure"
          }
          return "after"
        }
        "#,
    );
    assert_eq!(report.output, ["handled", "ensure"]);
    assert_eq!(report.outcome, RunOutcome::Returned(Value::Str("after".into())));
    assert!(report.final_errinfo.is_nil());
}

#[test]
fn ensure_errors_propagate_uncaught() {
    let report = run(
        r#"
        def m {
          begin {
            raise Boom
          } rescue Boom {
            puts "handled"
          } ensure {
            raise Cleanup
          }
        }
        "#,
    );
    assert_eq!(report.output, ["handled"]);
    assert_eq!(raised_class(&report), "Cleanup");

    let report = run(
        r#"
        def m {
          begin {
            return 1
          } ensure {
            raise Cleanup
          }
        }
        "#,
    );
    assert_eq!(raised_class(&report), "Cleanup");
}

#[test]
fn nested_constructs_restore_the_ambient_error() {
    let report = run(
        r#"
        def m {
          begin {
            begin {
              raise Inner
            } rescue Inner {
              puts $!
            }
            puts $!
            raise Outer
          } rescue Outer {
            puts $!
          }
          puts $!
        }
        "#,
    );
    assert_eq!(report.output, ["Inner", "nil", "Outer", "nil"]);
    assert_eq!(report.outcome, RunOutcome::Returned(Value::Nil));
}

#[test]
fn multi_class_and_catch_all_clauses() {
    let report = run(
        r#"
        def m {
          begin {
            raise IOError
          } rescue Timeout, IOError => e {
            puts e
          }
          begin {
            raise Anything
          } rescue StandardError {
            puts "catch-all"
          }
          begin {
            raise Whatever
          } rescue {
            puts "bare"
          }
        }
        "#,
    );
    assert_eq!(report.output, ["IOError", "catch-all", "bare"]);
    assert_eq!(report.outcome, RunOutcome::Returned(Value::Nil));
}

#[test]
fn raised_exceptions_record_their_line() {
    let report = run("def m {\n  puts 1\n  raise Late\n}");
    match &report.outcome {
        RunOutcome::Raised(value) => assert_eq!(value.as_exception().map(|e| e.line), Some(3)),
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[test]
fn ensure_return_swallows_the_handler_error() {
    let report = run(
        r#"
        def m {
          begin {
            raise First
          } rescue First {
            raise Second
          } ensure {
            return 9
          }
        }
        "#,
    );
    assert_eq!(report.outcome, RunOutcome::Returned(Value::Int(9)));
    assert_eq!(
        report.final_errinfo.as_exception().map(|e| e.class.as_str()),
        Some("Second")
    );
}

#[test]
fn else_error_takes_precedence() {
    let report = run(
        r#"
        def m {
          begin {
            puts "body"
          } rescue {
            puts "handler"
          } else {
            raise FromElse
          } ensure {
            puts $!
          }
          puts "not reached"
        }
        "#,
    );
    assert_eq!(report.output, ["body", "FromElse"]);
    assert_eq!(raised_class(&report), "FromElse");
}

#[test]
fn each_attempt_reinstalls_the_ambient_error() {
    fn ambient_writes(limit: i64) -> u64 {
        let module = lower(&RETRY_LOOP.replace("LIMIT", &limit.to_string()));
        let mut interp = Interpreter::new(&module);
        interp.run_method("m").expect("run");
        interp.ambient().writes()
    }
    let two = ambient_writes(2);
    let three = ambient_writes(3);
    assert!(two > 0);
    assert!(three > two);
}
