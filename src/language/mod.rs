pub mod ast;
pub mod compiler;
pub mod errors;
pub mod parser;
pub mod span;
