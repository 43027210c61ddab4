pub mod abi;
pub mod ambient;
pub mod environment;
pub mod error;
pub mod interpreter;
pub mod value;

pub use ambient::{AmbientCell, AmbientErrors};
pub use interpreter::{ExecStats, Interpreter, RunOutcome, RunReport};
pub use value::Value;
