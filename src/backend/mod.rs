pub mod llvm;

pub use llvm::{emit_llvm, LlvmBuilder};
