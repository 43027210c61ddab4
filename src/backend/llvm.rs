//! `IrBuilder` over inkwell. Every runtime value is an `i64`; the closure
//! parameter points at an `i64` array indexed by local id.

use crate::ir::{
    BuildError, BuildResult, Callee, IntPredicate, IrBuilder, Literal, LocalId, PARAM_COUNT,
};
use crate::language::{ast::Program, compiler::compile_program, compiler::CompileError};
use crate::runtime::abi::{AbiType, RuntimeFn};
use inkwell::{
    basic_block::BasicBlock,
    builder::{Builder, BuilderError},
    context::Context,
    module::{Linkage, Module},
    types::{BasicMetadataTypeEnum, FunctionType},
    values::{
        AnyValue, BasicMetadataValueEnum, BasicValue, BasicValueEnum, FunctionValue, IntValue,
    },
    AddressSpace, IntPredicate as LlvmPredicate,
};

pub const NIL_BITS: u64 = 0x08;
pub const UNDEF_BITS: u64 = 0x34;
pub const RETRY_BITS: u64 = 0x3c;

fn backend(err: BuilderError) -> BuildError {
    BuildError::Backend(err.to_string())
}

pub struct LlvmBuilder<'ctx> {
    context: &'ctx Context,
    module: Module<'ctx>,
    builder: Builder<'ctx>,
    strings: u32,
}

impl<'ctx> LlvmBuilder<'ctx> {
    pub fn new(context: &'ctx Context, name: &str) -> Self {
        Self {
            context,
            module: context.create_module(name),
            builder: context.create_builder(),
            strings: 0,
        }
    }

    /// Declares every runtime entry point, used or not.
    pub fn declare_runtime(&self) {
        for rt in RuntimeFn::ALL {
            self.runtime_function(rt);
        }
    }

    pub fn verify(&self) -> BuildResult<()> {
        self.module
            .verify()
            .map_err(|msg| BuildError::Backend(msg.to_string()))
    }

    pub fn print_to_string(&self) -> String {
        self.module.print_to_string().to_string()
    }

    fn context_fn_type(&self) -> FunctionType<'ctx> {
        let i64_type = self.context.i64_type();
        let ptr_type = self.context.ptr_type(AddressSpace::default());
        i64_type.fn_type(&[i64_type.into(), ptr_type.into(), i64_type.into()], false)
    }

    fn runtime_function(&self, rt: RuntimeFn) -> FunctionValue<'ctx> {
        if let Some(function) = self.module.get_function(rt.symbol()) {
            return function;
        }
        let params: Vec<BasicMetadataTypeEnum> = rt
            .params()
            .iter()
            .map(|ty| match ty {
                AbiType::Ptr => self.context.ptr_type(AddressSpace::default()).into(),
                AbiType::Bool => self.context.bool_type().into(),
                AbiType::Value | AbiType::Void => self.context.i64_type().into(),
            })
            .collect();
        let fn_type = match rt.returns() {
            AbiType::Void => self.context.void_type().fn_type(&params, false),
            AbiType::Bool => self.context.bool_type().fn_type(&params, false),
            AbiType::Ptr => self
                .context
                .ptr_type(AddressSpace::default())
                .fn_type(&params, false),
            AbiType::Value => self.context.i64_type().fn_type(&params, false),
        };
        self.module
            .add_function(rt.symbol(), fn_type, Some(Linkage::External))
    }

    fn int(&self, value: BasicValueEnum<'ctx>) -> BuildResult<IntValue<'ctx>> {
        match value {
            BasicValueEnum::IntValue(value) => Ok(value),
            BasicValueEnum::PointerValue(ptr) => self
                .builder
                .build_ptr_to_int(ptr, self.context.i64_type(), "addr")
                .map_err(backend),
            other => Err(BuildError::Backend(format!(
                "expected an integer value, found {:?}",
                other.get_type()
            ))),
        }
    }

    /// Conditions are `i1`; wider integers are tested against zero.
    fn truthy(&self, value: BasicValueEnum<'ctx>) -> BuildResult<IntValue<'ctx>> {
        let value = self.int(value)?;
        if value.get_type().get_bit_width() == 1 {
            return Ok(value);
        }
        let zero = value.get_type().const_zero();
        self.builder
            .build_int_compare(LlvmPredicate::NE, value, zero, "truthy")
            .map_err(backend)
    }

    fn local_ptr(&self, local: LocalId) -> BuildResult<inkwell::values::PointerValue<'ctx>> {
        let function = self.current_function()?;
        let closure = function
            .get_nth_param(1)
            .ok_or_else(|| BuildError::UnknownFunction(function_name(function)))?
            .into_pointer_value();
        let i64_type = self.context.i64_type();
        let index = i64_type.const_int(u64::from(local.0), false);
        // SAFETY: closure storage holds one slot per local of the method.
        unsafe {
            self.builder
                .build_in_bounds_gep(i64_type, closure, &[index], "local")
                .map_err(backend)
        }
    }

    fn current_function(&self) -> BuildResult<FunctionValue<'ctx>> {
        self.builder
            .get_insert_block()
            .and_then(|block| block.get_parent())
            .ok_or(BuildError::NoInsertPoint)
    }

    fn coerce_args(
        &self,
        function: FunctionValue<'ctx>,
        args: &[BasicValueEnum<'ctx>],
    ) -> BuildResult<Vec<BasicMetadataValueEnum<'ctx>>> {
        let params = function.get_type().get_param_types();
        args.iter()
            .zip(params.iter().map(Some).chain(std::iter::repeat(None)))
            .map(|(arg, param)| match (arg, param) {
                (BasicValueEnum::PointerValue(ptr), Some(ty)) if ty.is_int_type() => self
                    .builder
                    .build_ptr_to_int(*ptr, ty.into_int_type(), "arg")
                    .map(Into::into)
                    .map_err(backend),
                _ => Ok((*arg).into()),
            })
            .collect()
    }
}

fn function_name(function: FunctionValue<'_>) -> String {
    function.get_name().to_string_lossy().into_owned()
}

impl<'ctx> IrBuilder for LlvmBuilder<'ctx> {
    type Value = BasicValueEnum<'ctx>;
    type Block = BasicBlock<'ctx>;
    type Function = FunctionValue<'ctx>;

    fn add_function(&mut self, name: &str) -> BuildResult<FunctionValue<'ctx>> {
        let function = self.module.add_function(name, self.context_fn_type(), None);
        for (param, name) in function.get_param_iter().zip(crate::ir::PARAM_NAMES) {
            param.set_name(name);
        }
        let init = self.context.append_basic_block(function, "init");
        let entry = self.context.append_basic_block(function, "entry");
        let saved = self.builder.get_insert_block();
        self.builder.position_at_end(init);
        self.builder
            .build_unconditional_branch(entry)
            .map_err(backend)?;
        if let Some(block) = saved {
            self.builder.position_at_end(block);
        }
        Ok(function)
    }

    fn init_block(&self, function: FunctionValue<'ctx>) -> BuildResult<BasicBlock<'ctx>> {
        function
            .get_first_basic_block()
            .ok_or_else(|| BuildError::UnknownBlock(function_name(function)))
    }

    fn entry_block(&self, function: FunctionValue<'ctx>) -> BuildResult<BasicBlock<'ctx>> {
        self.init_block(function)?
            .get_next_basic_block()
            .ok_or_else(|| BuildError::UnknownBlock(function_name(function)))
    }

    fn params(
        &self,
        function: FunctionValue<'ctx>,
    ) -> BuildResult<[BasicValueEnum<'ctx>; PARAM_COUNT]> {
        let param = |idx| {
            function
                .get_nth_param(idx)
                .ok_or_else(|| BuildError::UnknownFunction(function_name(function)))
        };
        Ok([param(0)?, param(1)?, param(2)?])
    }

    fn append_block(
        &mut self,
        function: FunctionValue<'ctx>,
        name: &str,
    ) -> BuildResult<BasicBlock<'ctx>> {
        Ok(self.context.append_basic_block(function, name))
    }

    fn insert_block(&self) -> Option<BasicBlock<'ctx>> {
        self.builder.get_insert_block()
    }

    fn position_at_end(&mut self, block: BasicBlock<'ctx>) {
        self.builder.position_at_end(block);
    }

    fn position_before_terminator(&mut self, block: BasicBlock<'ctx>) {
        match block.get_terminator() {
            Some(terminator) => self.builder.position_before(&terminator),
            None => self.builder.position_at_end(block),
        }
    }

    fn is_terminated(&self) -> bool {
        self.builder
            .get_insert_block()
            .and_then(|block| block.get_terminator())
            .is_some()
    }

    fn build_alloca(&mut self, name: &str) -> BuildResult<BasicValueEnum<'ctx>> {
        self.builder
            .build_alloca(self.context.i64_type(), name)
            .map(Into::into)
            .map_err(backend)
    }

    fn build_load(
        &mut self,
        ptr: BasicValueEnum<'ctx>,
        name: &str,
    ) -> BuildResult<BasicValueEnum<'ctx>> {
        self.builder
            .build_load(self.context.i64_type(), ptr.into_pointer_value(), name)
            .map_err(backend)
    }

    fn build_store(
        &mut self,
        ptr: BasicValueEnum<'ctx>,
        value: BasicValueEnum<'ctx>,
    ) -> BuildResult<()> {
        let value = self.int(value)?;
        self.builder
            .build_store(ptr.into_pointer_value(), value)
            .map(|_| ())
            .map_err(backend)
    }

    fn build_call(
        &mut self,
        callee: Callee<FunctionValue<'ctx>>,
        args: &[BasicValueEnum<'ctx>],
        name: &str,
    ) -> BuildResult<Option<BasicValueEnum<'ctx>>> {
        let function = match callee {
            Callee::Function(function) => function,
            Callee::Runtime(rt) => self.runtime_function(rt),
        };
        let args = self.coerce_args(function, args)?;
        let call = self
            .builder
            .build_call(function, &args, name)
            .map_err(backend)?;
        if function.get_type().get_return_type().is_none() {
            return Ok(None);
        }
        BasicValueEnum::try_from(call.as_any_value_enum())
            .map(Some)
            .map_err(|_| BuildError::VoidCall(function_name(function)))
    }

    fn build_icmp(
        &mut self,
        pred: IntPredicate,
        lhs: BasicValueEnum<'ctx>,
        rhs: BasicValueEnum<'ctx>,
        name: &str,
    ) -> BuildResult<BasicValueEnum<'ctx>> {
        let pred = match pred {
            IntPredicate::Eq => LlvmPredicate::EQ,
            IntPredicate::Ne => LlvmPredicate::NE,
            IntPredicate::Slt => LlvmPredicate::SLT,
            IntPredicate::Sle => LlvmPredicate::SLE,
            IntPredicate::Sgt => LlvmPredicate::SGT,
            IntPredicate::Sge => LlvmPredicate::SGE,
        };
        let (lhs, rhs) = (self.int(lhs)?, self.int(rhs)?);
        self.builder
            .build_int_compare(pred, lhs, rhs, name)
            .map(Into::into)
            .map_err(backend)
    }

    fn build_and(
        &mut self,
        lhs: BasicValueEnum<'ctx>,
        rhs: BasicValueEnum<'ctx>,
        name: &str,
    ) -> BuildResult<BasicValueEnum<'ctx>> {
        let (lhs, rhs) = (self.truthy(lhs)?, self.truthy(rhs)?);
        self.builder
            .build_and(lhs, rhs, name)
            .map(Into::into)
            .map_err(backend)
    }

    fn build_select(
        &mut self,
        cond: BasicValueEnum<'ctx>,
        then_value: BasicValueEnum<'ctx>,
        else_value: BasicValueEnum<'ctx>,
        name: &str,
    ) -> BuildResult<BasicValueEnum<'ctx>> {
        let cond = self.truthy(cond)?;
        self.builder
            .build_select(cond, then_value, else_value, name)
            .map_err(backend)
    }

    fn build_local_get(&mut self, local: LocalId, name: &str) -> BuildResult<BasicValueEnum<'ctx>> {
        let ptr = self.local_ptr(local)?;
        self.builder
            .build_load(self.context.i64_type(), ptr, name)
            .map_err(backend)
    }

    fn build_local_set(&mut self, local: LocalId, value: BasicValueEnum<'ctx>) -> BuildResult<()> {
        let ptr = self.local_ptr(local)?;
        let value = self.int(value)?;
        self.builder
            .build_store(ptr, value)
            .map(|_| ())
            .map_err(backend)
    }

    fn build_br(&mut self, target: BasicBlock<'ctx>) -> BuildResult<()> {
        self.builder
            .build_unconditional_branch(target)
            .map(|_| ())
            .map_err(backend)
    }

    fn build_cond_br(
        &mut self,
        cond: BasicValueEnum<'ctx>,
        then_block: BasicBlock<'ctx>,
        else_block: BasicBlock<'ctx>,
    ) -> BuildResult<()> {
        let cond = self.truthy(cond)?;
        self.builder
            .build_conditional_branch(cond, then_block, else_block)
            .map(|_| ())
            .map_err(backend)
    }

    fn build_return(&mut self, value: BasicValueEnum<'ctx>) -> BuildResult<()> {
        let value = self.int(value)?;
        self.builder
            .build_return(Some(&value as &dyn BasicValue))
            .map(|_| ())
            .map_err(backend)
    }

    fn build_unreachable(&mut self) -> BuildResult<()> {
        self.builder
            .build_unreachable()
            .map(|_| ())
            .map_err(backend)
    }

    fn literal(&mut self, literal: Literal) -> BuildResult<BasicValueEnum<'ctx>> {
        let i64_type = self.context.i64_type();
        let bits = match literal {
            Literal::Nil => NIL_BITS,
            Literal::Undef => UNDEF_BITS,
            Literal::Retry => RETRY_BITS,
            // fixnum tagging keeps every integer odd and clear of the sentinels
            Literal::Int(value) => ((value as u64) << 1) | 1,
        };
        Ok(i64_type.const_int(bits, false).into())
    }

    fn const_str(&mut self, text: &str) -> BuildResult<BasicValueEnum<'ctx>> {
        let name = format!("str.{}", self.strings);
        self.strings += 1;
        let global = self
            .builder
            .build_global_string_ptr(text, &name)
            .map_err(backend)?;
        Ok(global
            .as_pointer_value()
            .const_to_int(self.context.i64_type())
            .into())
    }

    fn callee_value(
        &mut self,
        callee: Callee<FunctionValue<'ctx>>,
    ) -> BuildResult<BasicValueEnum<'ctx>> {
        let function = match callee {
            Callee::Function(function) => function,
            Callee::Runtime(rt) => self.runtime_function(rt),
        };
        Ok(function.as_global_value().as_pointer_value().into())
    }
}

/// Lowers `program` to textual LLVM IR.
pub fn emit_llvm(program: &Program, name: &str) -> Result<String, CompileError> {
    let context = Context::create();
    let mut builder = LlvmBuilder::new(&context, name);
    builder.declare_runtime();
    compile_program(&mut builder, program)?;
    builder.verify()?;
    Ok(builder.print_to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::parser::parse_program;

    #[test]
    fn lowers_a_construct_to_valid_llvm() {
        let program = parse_program(concat!(
            "def m {\n",
            "  begin {\n    raise Boom\n  } rescue Boom {\n    retry\n  }",
            " ensure {\n    puts 1\n  }\n",
            "}",
        ))
        .unwrap();
        let text = emit_llvm(&program, "t").unwrap();
        assert!(text.contains("declare i64 @rt_try(ptr, i64, ptr, i64, i64, ptr)"));
        assert!(text.contains("exception-entry:"));
        assert!(text.contains("@m$rescue1("));
        assert!(text.contains("declare i64 @rt_int_add(i64, i64)"));
    }
}
