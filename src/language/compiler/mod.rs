use crate::{
    ir::{BuildError, Callee, IntPredicate, IrBuilder, Literal, LocalId, Module, ModuleBuilder},
    language::{ast::*, span::Span},
    runtime::abi::RuntimeFn,
};
use log::debug;
use std::collections::HashMap;
use thiserror::Error;

mod context;
mod emit;
mod exceptions;

#[cfg(test)]
mod tests;

pub use context::{DefinedRegion, EmitterContext, ExceptionRegions, FunctionType, RegionId};
pub use exceptions::emit_exception_handlers;

pub type LowerResult<T> = Result<T, LowerError>;
pub type CompileResult<T> = Result<T, CompileError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LowerError {
    #[error("unknown {0}")]
    UnknownRegion(RegionId),
    #[error("{0} is unused and has no function")]
    UnusedRegion(RegionId),
    #[error("{id} is a {found} region, expected {expected}")]
    RegionKind {
        id: RegionId,
        expected: FunctionType,
        found: FunctionType,
    },
    #[error(transparent)]
    Build(#[from] BuildError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("`retry` used outside of a rescue clause")]
    RetryOutsideRescue { span: Span },
    #[error(transparent)]
    Lower(#[from] LowerError),
    #[error(transparent)]
    Build(#[from] BuildError),
}

impl CompileError {
    pub fn span(&self) -> Option<Span> {
        match self {
            CompileError::RetryOutsideRescue { span } => Some(*span),
            _ => None,
        }
    }
}

/// Compiles every method of `program` into `builder`.
pub fn compile_program<B: IrBuilder>(builder: &mut B, program: &Program) -> CompileResult<()> {
    for method in &program.methods {
        Compiler::new(&mut *builder, &method.name).compile_method(method)?;
    }
    Ok(())
}

/// Compiles `program` into a fresh in-crate IR module.
pub fn lower_program(program: &Program, name: &str) -> CompileResult<Module> {
    let mut builder = ModuleBuilder::new(name);
    compile_program(&mut builder, program)?;
    Ok(builder.finish())
}

/// The function currently receiving instructions.
struct FunctionScope<B: IrBuilder> {
    region: RegionId,
    function: B::Function,
    kind: FunctionType,
    line_ptr: B::Value,
}

/// Compiles one method and the region functions of its `begin` constructs.
pub struct Compiler<'b, B: IrBuilder> {
    builder: &'b mut B,
    ctx: EmitterContext<B>,
    method: String,
    locals: HashMap<String, LocalId>,
    next_local: u32,
    next_region: u32,
}

impl<'b, B: IrBuilder> Compiler<'b, B> {
    pub fn new(builder: &'b mut B, method: &str) -> Self {
        Self {
            builder,
            ctx: EmitterContext::new(),
            method: method.to_string(),
            locals: HashMap::new(),
            next_local: 0,
            next_region: 0,
        }
    }

    pub fn compile_method(&mut self, method: &MethodDef) -> CompileResult<()> {
        debug!("compiling method `{}`", method.name);
        let region = self.alloc_regions(1);
        let scope = self.open_function(&method.name, region, FunctionType::Method)?;
        self.emit_block(&scope, &method.body, false)?;
        self.finish_function(&scope)
    }

    fn alloc_regions(&mut self, count: u32) -> RegionId {
        let id = RegionId(self.next_region);
        self.next_region += count;
        id
    }

    fn local(&mut self, name: &str) -> LocalId {
        if let Some(id) = self.locals.get(name) {
            return *id;
        }
        let id = self.fresh_local();
        self.locals.insert(name.to_string(), id);
        id
    }

    /// A closure slot no source name can refer to.
    fn fresh_local(&mut self) -> LocalId {
        let id = LocalId(self.next_local);
        self.next_local += 1;
        id
    }

    fn open_function(
        &mut self,
        name: &str,
        region: RegionId,
        kind: FunctionType,
    ) -> CompileResult<FunctionScope<B>> {
        let function = self.builder.add_function(name)?;
        let init = self.builder.init_block(function)?;
        self.builder.position_before_terminator(init);
        let line_ptr = self.builder.build_alloca("lineno")?;
        let zero = self.builder.literal(Literal::Int(0))?;
        self.builder.build_store(line_ptr, zero)?;
        let entry = self.builder.entry_block(function)?;
        self.builder.position_at_end(entry);
        self.ctx.define_region(region, kind, function, init, line_ptr);
        Ok(FunctionScope {
            region,
            function,
            kind,
            line_ptr,
        })
    }

    /// Methods fall through to `nil`; regions fall through to `undef`, which
    /// the exception lowering reads as "no early return".
    fn finish_function(&mut self, scope: &FunctionScope<B>) -> CompileResult<()> {
        if !self.builder.is_terminated() {
            let value = match scope.kind {
                FunctionType::Method => Literal::Nil,
                _ => Literal::Undef,
            };
            let value = self.builder.literal(value)?;
            self.builder.build_return(value)?;
        }
        Ok(())
    }
}
