use super::{
    BlockId, Constant, FuncId, FuncRef, Inst, InstKind, IntPredicate, Literal, LocalId, Module,
    Operand, Terminator, PARAM_COUNT,
};
use crate::runtime::abi::{AbiType, RuntimeFn};
use std::fmt;
use thiserror::Error;

pub type BuildResult<T> = Result<T, BuildError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("builder has no insertion point")]
    NoInsertPoint,
    #[error("block `{block}` of `{function}` already has a terminator")]
    Terminated { function: String, block: String },
    #[error("unknown function `{0}`")]
    UnknownFunction(String),
    #[error("unknown block in `{0}`")]
    UnknownBlock(String),
    #[error("call to `{0}` produces no value")]
    VoidCall(String),
    #[error("backend error: {0}")]
    Backend(String),
}

/// What a call instruction targets: a compiled function or a runtime symbol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Callee<F> {
    Function(F),
    Runtime(RuntimeFn),
}

/// The instruction-emission seam the lowering passes are written against.
///
/// Values are untyped from the caller's point of view; backends pick machine
/// types from the [`RuntimeFn`] ABI table and the operation itself.
pub trait IrBuilder {
    type Value: Copy + fmt::Debug;
    type Block: Copy + PartialEq + fmt::Debug;
    type Function: Copy + PartialEq + fmt::Debug;

    /// Declares a function with the `(pc, closure, cfp)` signature. The new
    /// function already has an initializer block branching to its entry block.
    fn add_function(&mut self, name: &str) -> BuildResult<Self::Function>;
    fn init_block(&self, function: Self::Function) -> BuildResult<Self::Block>;
    fn entry_block(&self, function: Self::Function) -> BuildResult<Self::Block>;
    fn params(&self, function: Self::Function) -> BuildResult<[Self::Value; PARAM_COUNT]>;
    fn append_block(&mut self, function: Self::Function, name: &str)
        -> BuildResult<Self::Block>;

    fn insert_block(&self) -> Option<Self::Block>;
    fn position_at_end(&mut self, block: Self::Block);
    /// Positions before `block`'s terminator, or at its end if it has none.
    fn position_before_terminator(&mut self, block: Self::Block);
    /// Whether the current insertion block already ends in a terminator.
    fn is_terminated(&self) -> bool;

    fn build_alloca(&mut self, name: &str) -> BuildResult<Self::Value>;
    fn build_load(&mut self, ptr: Self::Value, name: &str) -> BuildResult<Self::Value>;
    fn build_store(&mut self, ptr: Self::Value, value: Self::Value) -> BuildResult<()>;
    fn build_call(
        &mut self,
        callee: Callee<Self::Function>,
        args: &[Self::Value],
        name: &str,
    ) -> BuildResult<Option<Self::Value>>;
    fn build_icmp(
        &mut self,
        pred: IntPredicate,
        lhs: Self::Value,
        rhs: Self::Value,
        name: &str,
    ) -> BuildResult<Self::Value>;
    fn build_and(&mut self, lhs: Self::Value, rhs: Self::Value, name: &str)
        -> BuildResult<Self::Value>;
    fn build_select(
        &mut self,
        cond: Self::Value,
        then_value: Self::Value,
        else_value: Self::Value,
        name: &str,
    ) -> BuildResult<Self::Value>;
    fn build_local_get(&mut self, local: LocalId, name: &str) -> BuildResult<Self::Value>;
    fn build_local_set(&mut self, local: LocalId, value: Self::Value) -> BuildResult<()>;

    fn build_br(&mut self, target: Self::Block) -> BuildResult<()>;
    fn build_cond_br(
        &mut self,
        cond: Self::Value,
        then_block: Self::Block,
        else_block: Self::Block,
    ) -> BuildResult<()>;
    fn build_return(&mut self, value: Self::Value) -> BuildResult<()>;
    fn build_unreachable(&mut self) -> BuildResult<()>;

    fn literal(&mut self, literal: Literal) -> BuildResult<Self::Value>;
    fn const_str(&mut self, text: &str) -> BuildResult<Self::Value>;
    /// The address of `callee`, for passing to `rt_try` or selecting between.
    fn callee_value(&mut self, callee: Callee<Self::Function>) -> BuildResult<Self::Value>;

    fn save_insert_point(&self) -> Option<Self::Block> {
        self.insert_block()
    }

    fn restore_insert_point(&mut self, saved: Option<Self::Block>) {
        if let Some(block) = saved {
            self.position_at_end(block);
        }
    }

    /// Calls `callee` and requires it to produce a value.
    fn build_value_call(
        &mut self,
        callee: Callee<Self::Function>,
        args: &[Self::Value],
        name: &str,
    ) -> BuildResult<Self::Value> {
        self.build_call(callee, args, name)?.ok_or_else(|| {
            BuildError::VoidCall(match callee {
                Callee::Function(_) => name.to_string(),
                Callee::Runtime(rt) => rt.symbol().to_string(),
            })
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockRef {
    pub func: FuncId,
    pub block: BlockId,
}

#[derive(Clone, Copy, Debug)]
struct Position {
    at: BlockRef,
    before_terminator: bool,
}

/// Builds an in-memory [`Module`].
#[derive(Debug)]
pub struct ModuleBuilder {
    module: Module,
    position: Option<Position>,
}

impl ModuleBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            module: Module::new(name),
            position: None,
        }
    }

    pub fn finish(self) -> Module {
        self.module
    }

    fn function_name(&self, id: FuncId) -> String {
        self.module
            .function(id)
            .map(|func| func.name.clone())
            .unwrap_or_else(|| format!("#{}", id.0))
    }

    fn push_inst(&mut self, kind: InstKind, name: Option<&str>) -> BuildResult<Operand> {
        let position = self.position.ok_or(BuildError::NoInsertPoint)?;
        let function_name = self.function_name(position.at.func);
        let func = self
            .module
            .function_mut(position.at.func)
            .ok_or_else(|| BuildError::UnknownFunction(function_name.clone()))?;
        let result = name.map(|name| func.fresh_value(name));
        let block = func
            .block_mut(position.at.block)
            .ok_or_else(|| BuildError::UnknownBlock(function_name.clone()))?;
        if block.terminator.is_some() && !position.before_terminator {
            return Err(BuildError::Terminated {
                function: function_name,
                block: block.name.clone(),
            });
        }
        block.insts.push(Inst { result, kind });
        Ok(result.map(Operand::Value).unwrap_or(Operand::Const(Constant::Nil)))
    }

    fn terminate(&mut self, terminator: Terminator) -> BuildResult<()> {
        let position = self.position.ok_or(BuildError::NoInsertPoint)?;
        let function_name = self.function_name(position.at.func);
        let block = self
            .module
            .function_mut(position.at.func)
            .and_then(|func| func.block_mut(position.at.block))
            .ok_or_else(|| BuildError::UnknownBlock(function_name.clone()))?;
        if block.terminator.is_some() {
            return Err(BuildError::Terminated {
                function: function_name,
                block: block.name.clone(),
            });
        }
        block.terminator = Some(terminator);
        Ok(())
    }

    fn current_function(&self) -> BuildResult<FuncId> {
        self.position
            .map(|position| position.at.func)
            .ok_or(BuildError::NoInsertPoint)
    }

    fn block_in_current(&self, block: BlockRef) -> BuildResult<BlockId> {
        let current = self.current_function()?;
        if block.func != current {
            return Err(BuildError::UnknownBlock(self.function_name(current)));
        }
        Ok(block.block)
    }

    fn existing_function(&self, id: FuncId) -> BuildResult<&super::Function> {
        self.module
            .function(id)
            .ok_or_else(|| BuildError::UnknownFunction(format!("#{}", id.0)))
    }
}

impl IrBuilder for ModuleBuilder {
    type Value = Operand;
    type Block = BlockRef;
    type Function = FuncId;

    fn add_function(&mut self, name: &str) -> BuildResult<FuncId> {
        Ok(self.module.add_function(name))
    }

    fn init_block(&self, function: FuncId) -> BuildResult<BlockRef> {
        let func = self.existing_function(function)?;
        Ok(BlockRef {
            func: function,
            block: func.init,
        })
    }

    fn entry_block(&self, function: FuncId) -> BuildResult<BlockRef> {
        let func = self.existing_function(function)?;
        Ok(BlockRef {
            func: function,
            block: func.entry,
        })
    }

    fn params(&self, function: FuncId) -> BuildResult<[Operand; PARAM_COUNT]> {
        let func = self.existing_function(function)?;
        Ok(func.params().map(Operand::Value))
    }

    fn append_block(&mut self, function: FuncId, name: &str) -> BuildResult<BlockRef> {
        let func = self
            .module
            .function_mut(function)
            .ok_or_else(|| BuildError::UnknownFunction(format!("#{}", function.0)))?;
        Ok(BlockRef {
            func: function,
            block: func.append_block(name),
        })
    }

    fn insert_block(&self) -> Option<BlockRef> {
        self.position.map(|position| position.at)
    }

    fn position_at_end(&mut self, block: BlockRef) {
        self.position = Some(Position {
            at: block,
            before_terminator: false,
        });
    }

    fn position_before_terminator(&mut self, block: BlockRef) {
        self.position = Some(Position {
            at: block,
            before_terminator: true,
        });
    }

    fn is_terminated(&self) -> bool {
        self.position
            .and_then(|position| {
                self.module
                    .function(position.at.func)
                    .and_then(|func| func.block(position.at.block))
            })
            .map(|block| block.terminator.is_some())
            .unwrap_or(false)
    }

    fn build_alloca(&mut self, name: &str) -> BuildResult<Operand> {
        self.push_inst(InstKind::Alloca, Some(name))
    }

    fn build_load(&mut self, ptr: Operand, name: &str) -> BuildResult<Operand> {
        self.push_inst(InstKind::Load { ptr }, Some(name))
    }

    fn build_store(&mut self, ptr: Operand, value: Operand) -> BuildResult<()> {
        self.push_inst(InstKind::Store { ptr, value }, None)
            .map(|_| ())
    }

    fn build_call(
        &mut self,
        callee: Callee<FuncId>,
        args: &[Operand],
        name: &str,
    ) -> BuildResult<Option<Operand>> {
        let (callee, produces_value) = match callee {
            Callee::Function(id) => (FuncRef::Ir(id), true),
            Callee::Runtime(rt) => (FuncRef::Runtime(rt), rt.returns() != AbiType::Void),
        };
        let kind = InstKind::Call {
            callee,
            args: args.to_vec(),
        };
        if produces_value {
            self.push_inst(kind, Some(name)).map(Some)
        } else {
            self.push_inst(kind, None).map(|_| None)
        }
    }

    fn build_icmp(
        &mut self,
        pred: IntPredicate,
        lhs: Operand,
        rhs: Operand,
        name: &str,
    ) -> BuildResult<Operand> {
        self.push_inst(InstKind::ICmp { pred, lhs, rhs }, Some(name))
    }

    fn build_and(&mut self, lhs: Operand, rhs: Operand, name: &str) -> BuildResult<Operand> {
        self.push_inst(InstKind::And { lhs, rhs }, Some(name))
    }

    fn build_select(
        &mut self,
        cond: Operand,
        then_value: Operand,
        else_value: Operand,
        name: &str,
    ) -> BuildResult<Operand> {
        self.push_inst(
            InstKind::Select {
                cond,
                then_value,
                else_value,
            },
            Some(name),
        )
    }

    fn build_local_get(&mut self, local: LocalId, name: &str) -> BuildResult<Operand> {
        self.push_inst(InstKind::LocalGet { local }, Some(name))
    }

    fn build_local_set(&mut self, local: LocalId, value: Operand) -> BuildResult<()> {
        self.push_inst(InstKind::LocalSet { local, value }, None)
            .map(|_| ())
    }

    fn build_br(&mut self, target: BlockRef) -> BuildResult<()> {
        let target = self.block_in_current(target)?;
        self.terminate(Terminator::Br(target))
    }

    fn build_cond_br(
        &mut self,
        cond: Operand,
        then_block: BlockRef,
        else_block: BlockRef,
    ) -> BuildResult<()> {
        let then_block = self.block_in_current(then_block)?;
        let else_block = self.block_in_current(else_block)?;
        self.terminate(Terminator::CondBr {
            cond,
            then_block,
            else_block,
        })
    }

    fn build_return(&mut self, value: Operand) -> BuildResult<()> {
        self.terminate(Terminator::Ret(value))
    }

    fn build_unreachable(&mut self) -> BuildResult<()> {
        self.terminate(Terminator::Unreachable)
    }

    fn literal(&mut self, literal: Literal) -> BuildResult<Operand> {
        Ok(Operand::Const(literal.into()))
    }

    fn const_str(&mut self, text: &str) -> BuildResult<Operand> {
        Ok(Operand::Const(Constant::Str(self.module.intern(text))))
    }

    fn callee_value(&mut self, callee: Callee<FuncId>) -> BuildResult<Operand> {
        Ok(Operand::Func(match callee {
            Callee::Function(id) => FuncRef::Ir(id),
            Callee::Runtime(rt) => FuncRef::Runtime(rt),
        }))
    }
}
