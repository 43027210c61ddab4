//! Lowering of one `begin/rescue/else/ensure` construct.
//!
//! The four regions are already compiled into functions. This pass stitches
//! them together inside the enclosing function: the body and the selected
//! handler run through `rt_try`, which turns a raise into a value written to
//! an out-slot, and the ambient error (`$!`) is saved and restored around
//! them. A handler returning the retry sentinel loops back to
//! `exception-entry`.

use super::context::{EmitterContext, ExceptionRegions, FunctionType, RegionId};
use super::{LowerError, LowerResult};
use crate::ir::{Callee, IntPredicate, IrBuilder, Literal, LocalId, PARAM_COUNT};
use crate::runtime::abi::RuntimeFn;
use log::debug;

struct ExceptionState<'c, B: IrBuilder> {
    ctx: &'c EmitterContext<B>,
    regions: ExceptionRegions,
    exception_value: LocalId,
    function: B::Function,
    params: [B::Value; PARAM_COUNT],
    line_ptr: B::Value,
    exception_result_ptr: B::Value,
    previous_exception: B::Value,
    exception_entry: B::Block,
}

impl<'c, B: IrBuilder> ExceptionState<'c, B> {
    /// Region setup. The out-slot goes in the initializer block so a retry
    /// loop reuses it instead of growing the frame.
    fn setup(
        builder: &mut B,
        ctx: &'c EmitterContext<B>,
        scope: RegionId,
        regions: ExceptionRegions,
        exception_value: LocalId,
    ) -> LowerResult<Self> {
        let function = ctx.function(scope)?;
        let params = builder.params(function)?;
        let line_ptr = ctx.line_number_ptr(scope)?;

        let saved = builder.save_insert_point();
        builder.position_before_terminator(ctx.function_initializer(scope)?);
        let exception_result_ptr = builder.build_alloca("exceptionResult")?;
        builder.restore_insert_point(saved);

        let previous_exception = builder.build_value_call(
            Callee::Runtime(RuntimeFn::ErrInfo),
            &[],
            "previousException",
        )?;

        let exception_entry = builder.append_block(function, "exception-entry")?;
        builder.build_br(exception_entry)?;
        builder.position_at_end(exception_entry);
        let nil = builder.literal(Literal::Nil)?;
        builder.build_local_set(exception_value, nil)?;

        Ok(Self {
            ctx,
            regions,
            exception_value,
            function,
            params,
            line_ptr,
            exception_result_ptr,
            previous_exception,
            exception_entry,
        })
    }

    fn expect_region(
        &self,
        id: RegionId,
        allowed: &[FunctionType],
    ) -> LowerResult<Callee<B::Function>> {
        let found = self.ctx.region_type(id)?;
        if !allowed.contains(&found) {
            return Err(LowerError::RegionKind {
                id,
                expected: allowed[0],
                found,
            });
        }
        self.ctx.region_function(id)
    }

    fn get_body(&self) -> LowerResult<Callee<B::Function>> {
        self.expect_region(self.regions.body, &[FunctionType::Body])
    }

    fn get_handlers(&self) -> LowerResult<Callee<B::Function>> {
        self.expect_region(self.regions.handlers, &[FunctionType::Handlers])
    }

    fn get_else(&self) -> LowerResult<Callee<B::Function>> {
        self.expect_region(
            self.regions.else_region,
            &[FunctionType::Else, FunctionType::Unused],
        )
    }

    fn get_ensure(&self) -> LowerResult<Callee<B::Function>> {
        self.expect_region(
            self.regions.ensure,
            &[FunctionType::Ensure, FunctionType::Unused],
        )
    }

    /// Invokes `callee` through `rt_try` with `error_context` installed as the
    /// pending error. Returns the call result and the out-slot holding the
    /// captured exception (nil when nothing was raised).
    fn guarded_invoke(
        &self,
        builder: &mut B,
        callee: B::Value,
        error_context: B::Value,
        name: &str,
    ) -> LowerResult<(B::Value, B::Value)> {
        let pc = builder.build_load(self.line_ptr, "pc")?;
        let [_, closure, cfp] = self.params;
        let result = builder.build_value_call(
            Callee::Runtime(RuntimeFn::Try),
            &[
                callee,
                pc,
                closure,
                cfp,
                error_context,
                self.exception_result_ptr,
            ],
            name,
        )?;
        Ok((result, self.exception_result_ptr))
    }

    /// Calls the ensure region directly. Its raises are not caught here. A
    /// real return value overrides `in_flight`.
    fn run_ensure(&self, builder: &mut B, in_flight: B::Value) -> LowerResult<B::Value> {
        let ensure = self.get_ensure()?;
        let pc = builder.build_load(self.line_ptr, "pc")?;
        let [_, closure, cfp] = self.params;
        let ensure_result = builder.build_value_call(ensure, &[pc, closure, cfp], "ensureResult")?;
        let undef = builder.literal(Literal::Undef)?;
        let ensure_returned =
            builder.build_icmp(IntPredicate::Ne, ensure_result, undef, "ensureReturned")?;
        Ok(builder.build_select(ensure_returned, ensure_result, in_flight, "ensureValue")?)
    }

    /// Runs the body. An early return runs ensure and leaves the enclosing
    /// function; otherwise the captured exception is stored in the
    /// construct's exception variable and returned.
    fn run_body(&self, builder: &mut B) -> LowerResult<B::Value> {
        let body = self.get_body()?;
        let body = builder.callee_value(body)?;
        let (body_result, exception_result_ptr) =
            self.guarded_invoke(builder, body, self.previous_exception, "bodyResult")?;

        let undef = builder.literal(Literal::Undef)?;
        let body_returned =
            builder.build_icmp(IntPredicate::Ne, body_result, undef, "bodyReturned")?;
        let early_return = builder.append_block(self.function, "exception-body-return")?;
        let continue_block = builder.append_block(self.function, "exception-body-continue")?;
        builder.build_cond_br(body_returned, early_return, continue_block)?;

        builder.position_at_end(early_return);
        builder.build_call(
            Callee::Runtime(RuntimeFn::SetErrInfo),
            &[self.previous_exception],
            "",
        )?;
        let value = self.run_ensure(builder, body_result)?;
        builder.build_return(value)?;

        builder.position_at_end(continue_block);
        let exception = builder.build_load(exception_result_ptr, "exceptionValue")?;
        builder.build_local_set(self.exception_value, exception)?;
        Ok(exception)
    }

    /// The error that is pending once the handler or else region finished:
    /// the handler's own error, else the body error if no clause cleared it,
    /// else the error pending before the construct.
    fn determine_post_rescue_exception_context(
        &self,
        builder: &mut B,
        handler_exception: B::Value,
    ) -> LowerResult<B::Value> {
        let nil = builder.literal(Literal::Nil)?;
        let handler_raised =
            builder.build_icmp(IntPredicate::Ne, handler_exception, nil, "handlerRaised")?;
        let exception = builder.build_local_get(self.exception_value, "exceptionValue")?;
        let not_handled =
            builder.build_icmp(IntPredicate::Ne, exception, nil, "exceptionNotHandled")?;
        let unhandled_or_previous = builder.build_select(
            not_handled,
            exception,
            self.previous_exception,
            "unhandledOrPrevious",
        )?;
        Ok(builder.build_select(
            handler_raised,
            handler_exception,
            unhandled_or_previous,
            "exceptionContext",
        )?)
    }

    fn run_rescue_else_ensure(&self, builder: &mut B, body_exception: B::Value) -> LowerResult<()> {
        let nil = builder.literal(Literal::Nil)?;
        let exception_raised =
            builder.build_icmp(IntPredicate::Ne, body_exception, nil, "exceptionRaised")?;

        let handlers = self.get_handlers()?;
        let handlers = builder.callee_value(handlers)?;
        let else_region = self.get_else()?;
        let else_region = builder.callee_value(else_region)?;
        let handler = builder.build_select(exception_raised, handlers, else_region, "handler")?;

        let (handler_result, exception_result_ptr) =
            self.guarded_invoke(builder, handler, body_exception, "handlerResult")?;
        let handler_exception = builder.build_load(exception_result_ptr, "handlerException")?;
        let exception_context =
            self.determine_post_rescue_exception_context(builder, handler_exception)?;
        builder.build_call(
            Callee::Runtime(RuntimeFn::SetErrInfo),
            &[exception_context],
            "",
        )?;

        // A retry sentinel means the handler raised nothing, so the context
        // just installed is `previousException` again.
        let retry = builder.literal(Literal::Retry)?;
        let is_retry = builder.build_icmp(IntPredicate::Eq, handler_result, retry, "isRetry")?;
        let should_retry = builder.build_and(exception_raised, is_retry, "shouldRetry")?;
        let ensure_block = builder.append_block(self.function, "exception-ensure")?;
        builder.build_cond_br(should_retry, self.exception_entry, ensure_block)?;

        builder.position_at_end(ensure_block);
        let value = self.run_ensure(builder, handler_result)?;
        let undef = builder.literal(Literal::Undef)?;
        let returned = builder.build_icmp(IntPredicate::Ne, value, undef, "returnValue")?;
        let return_block = builder.append_block(self.function, "exception-return")?;
        let continue_block = builder.append_block(self.function, "exception-continue")?;
        builder.build_cond_br(returned, return_block, continue_block)?;

        builder.position_at_end(return_block);
        builder.build_return(value)?;

        builder.position_at_end(continue_block);
        builder.build_call(
            Callee::Runtime(RuntimeFn::RaiseIfNotNil),
            &[exception_context],
            "",
        )?;
        Ok(())
    }

    fn raise_unhandled_exception(&self, builder: &mut B) -> LowerResult<()> {
        let exception = builder.build_local_get(self.exception_value, "exceptionValue")?;
        builder.build_call(Callee::Runtime(RuntimeFn::RaiseIfNotNil), &[exception], "")?;
        Ok(())
    }
}

/// Lowers one exception construct into the function of `scope`, at the
/// builder's current insertion point. On return the builder is positioned in
/// `exception-continue`, where code following the construct goes.
pub fn emit_exception_handlers<B: IrBuilder>(
    builder: &mut B,
    ctx: &EmitterContext<B>,
    scope: RegionId,
    regions: ExceptionRegions,
    exception_value: LocalId,
) -> LowerResult<()> {
    debug!(
        "lowering exception construct at {} into {scope}",
        regions.body
    );
    let state = ExceptionState::setup(builder, ctx, scope, regions, exception_value)?;
    let body_exception = state.run_body(builder)?;
    state.run_rescue_else_ensure(builder, body_exception)?;
    state.raise_unhandled_exception(builder)?;
    Ok(())
}
