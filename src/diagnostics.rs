use crate::{
    ir::verify::VerifyError, language::compiler::CompileError, language::errors::SyntaxError,
    runtime::error::RuntimeError,
};
use miette::{Diagnostic, NamedSource, Report, SourceSpan};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
#[error("{message}")]
pub struct SyntaxDiagnostic {
    #[source_code]
    src: NamedSource,
    #[label("{label}")]
    span: SourceSpan,
    #[help]
    help: Option<String>,
    message: String,
    label: String,
}

impl SyntaxDiagnostic {
    pub fn from_error(src: NamedSource, err: SyntaxError) -> Self {
        Self {
            src,
            span: err.to_source_span(),
            help: err.help.clone(),
            message: err.message.clone(),
            label: err.label,
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
#[error("{message}")]
#[diagnostic(code(exlower::compile))]
pub struct CompileDiagnostic {
    #[source_code]
    src: NamedSource,
    #[label("used here")]
    span: Option<SourceSpan>,
    #[help]
    help: Option<String>,
    message: String,
}

impl CompileDiagnostic {
    pub fn from_error(src: NamedSource, err: &CompileError) -> Self {
        let help = match err {
            CompileError::RetryOutsideRescue { .. } => {
                Some("`retry` restarts a `begin` body and is only valid in a rescue clause".into())
            }
            _ => None,
        };
        Self {
            src,
            span: err.span().map(SourceSpan::from),
            help,
            message: err.to_string(),
        }
    }
}

fn named_source(path: &Path, source: &str) -> NamedSource {
    NamedSource::new(path.display().to_string(), source.to_string())
}

pub fn emit_syntax_error(path: &Path, source: &str, err: SyntaxError) {
    let diagnostic = SyntaxDiagnostic::from_error(named_source(path, source), err);
    eprintln!("{:?}", Report::new(diagnostic));
}

pub fn emit_compile_error(path: &Path, source: &str, err: &CompileError) {
    let diagnostic = CompileDiagnostic::from_error(named_source(path, source), err);
    eprintln!("{:?}", Report::new(diagnostic));
}

pub fn report_verify_errors(errors: &[VerifyError]) {
    for error in errors {
        eprintln!("IR verification failed: {}", error);
    }
}

pub fn report_runtime_error(error: &RuntimeError) {
    eprintln!("Runtime error: {}", error);
}

pub fn report_io_error(path: &Path, error: &std::io::Error) {
    eprintln!("Failed to access {}: {}", path.display(), error);
}
