use clap::{Parser, Subcommand};
use exlower::{
    config::{EmitTarget, RunConfig},
    diagnostics::{
        emit_compile_error, emit_syntax_error, report_io_error, report_runtime_error,
        report_verify_errors,
    },
    ir::{verify::verify_module, Module},
    language::{ast::Program, compiler::lower_program, parser::parse_program},
    runtime::{AmbientCell, Interpreter, RunOutcome, Value},
};
use std::{
    fs,
    path::{Path, PathBuf},
    process::ExitCode,
};

#[derive(Parser)]
#[command(
    name = "exlower",
    version,
    about = "Lower begin/rescue/else/ensure regions to guarded control flow"
)]
struct Cli {
    /// Enable debug logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the lowered module
    Lower {
        path: PathBuf,
        /// Output format: `ir` or `llvm` (defaults to $EXLOWER_EMIT, then `ir`)
        #[arg(long)]
        emit: Option<String>,
    },
    /// Lower and execute a method in the interpreter
    Run {
        path: PathBuf,
        /// Method to run (defaults to the first one defined)
        #[arg(long)]
        method: Option<String>,
        /// Exception class pending before the method starts
        #[arg(long)]
        previous: Option<String>,
        /// Step limit (defaults to $EXLOWER_MAX_STEPS)
        #[arg(long)]
        max_steps: Option<u64>,
    },
    /// Parse, lower and verify without running
    Check { path: PathBuf },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_module("exlower", level)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false)
        .init();

    let ok = match cli.command {
        Command::Lower { path, emit } => lower(&path, emit),
        Command::Run {
            path,
            method,
            previous,
            max_steps,
        } => run(&path, method, previous, max_steps),
        Command::Check { path } => check(&path),
    };
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn load(path: &Path) -> Option<(String, Program)> {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            report_io_error(path, &err);
            return None;
        }
    };
    match parse_program(&source) {
        Ok(program) => Some((source, program)),
        Err(err) => {
            emit_syntax_error(path, &source, err);
            None
        }
    }
}

fn module_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "main".to_string())
}

fn lower_verified(path: &Path, source: &str, program: &Program) -> Option<Module> {
    let module = match lower_program(program, &module_name(path)) {
        Ok(module) => module,
        Err(err) => {
            emit_compile_error(path, source, &err);
            return None;
        }
    };
    if let Err(errors) = verify_module(&module) {
        report_verify_errors(&errors);
        return None;
    }
    Some(module)
}

fn lower(path: &Path, emit: Option<String>) -> bool {
    let target = match EmitTarget::from_flag_or_env(emit) {
        Ok(target) => target,
        Err(err) => {
            eprintln!("{err}");
            return false;
        }
    };
    let Some((source, program)) = load(path) else {
        return false;
    };
    match target {
        EmitTarget::Ir => match lower_verified(path, &source, &program) {
            Some(module) => {
                print!("{module}");
                true
            }
            None => false,
        },
        EmitTarget::Llvm => emit_llvm(path, &source, &program),
    }
}

#[cfg(feature = "llvm")]
fn emit_llvm(path: &Path, source: &str, program: &Program) -> bool {
    match exlower::backend::emit_llvm(program, &module_name(path)) {
        Ok(text) => {
            print!("{text}");
            true
        }
        Err(err) => {
            emit_compile_error(path, source, &err);
            false
        }
    }
}

#[cfg(not(feature = "llvm"))]
fn emit_llvm(_path: &Path, _source: &str, _program: &Program) -> bool {
    eprintln!("LLVM output needs a build with `--features llvm`");
    false
}

fn run(
    path: &Path,
    method: Option<String>,
    previous: Option<String>,
    max_steps: Option<u64>,
) -> bool {
    let config = match RunConfig::from_flag_or_env(max_steps) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            return false;
        }
    };
    let Some((source, program)) = load(path) else {
        return false;
    };
    let Some(method) = method.or_else(|| program.methods.first().map(|m| m.name.clone())) else {
        eprintln!("{} defines no methods", path.display());
        return false;
    };
    let Some(module) = lower_verified(path, &source, &program) else {
        return false;
    };

    let interpreter = match previous {
        Some(class) => {
            let pending = AmbientCell::with_pending(Value::exception(class, None));
            Interpreter::with_ambient(&module, pending)
        }
        None => Interpreter::new(&module),
    };
    let mut interpreter = interpreter.with_max_steps(config.max_steps);
    match interpreter.run_method(&method) {
        Ok(report) => {
            for line in &report.output {
                println!("{line}");
            }
            log::debug!(
                "{} steps, {} calls, peak {} slots, {} ambient writes",
                report.stats.steps,
                report.stats.calls,
                report.stats.peak_slots,
                interpreter.ambient().writes()
            );
            match report.outcome {
                RunOutcome::Returned(value) => {
                    println!("=> {}", value.inspect());
                    true
                }
                RunOutcome::Raised(exception) => {
                    eprintln!("uncaught exception {}", exception.inspect());
                    false
                }
            }
        }
        Err(err) => {
            report_runtime_error(&err);
            false
        }
    }
}

fn check(path: &Path) -> bool {
    let Some((source, program)) = load(path) else {
        return false;
    };
    match lower_verified(path, &source, &program) {
        Some(module) => {
            println!(
                "{}: {} methods, {} functions",
                path.display(),
                program.methods.len(),
                module.functions.len()
            );
            true
        }
        None => false,
    }
}
