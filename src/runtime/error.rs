use crate::runtime::value::Value;
use thiserror::Error;

pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A language-level raise unwinding towards the nearest `rt_try`.
    #[error("uncaught exception {}", .exception.inspect())]
    Raised { exception: Value },
    #[error("Unknown function `{name}`")]
    UnknownFunction { name: String },
    #[error("Type mismatch: {message}")]
    TypeMismatch { message: String },
    #[error("Function `{name}` expected {expected} arguments but received {received}")]
    ArityMismatch {
        name: String,
        expected: usize,
        received: usize,
    },
    #[error("Invalid IR in `{function}`: {message}")]
    InvalidIr { function: String, message: String },
    #[error("Step limit of {limit} exceeded")]
    StepLimit { limit: u64 },
}

impl RuntimeError {
    pub fn type_mismatch(expected: &str, found: &Value) -> Self {
        RuntimeError::TypeMismatch {
            message: format!("expected {expected}, found {}", found.type_name()),
        }
    }
}
