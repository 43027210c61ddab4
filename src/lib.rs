pub mod config;
pub mod diagnostics;
pub mod ir;
pub mod language;
pub mod runtime;

#[cfg(feature = "llvm")]
pub mod backend;

#[cfg(test)]
mod tests;
