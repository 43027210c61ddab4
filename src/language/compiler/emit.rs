use super::*;

impl<'b, B: IrBuilder> Compiler<'b, B> {
    pub(super) fn emit_block(
        &mut self,
        scope: &FunctionScope<B>,
        statements: &[Stmt],
        in_rescue: bool,
    ) -> CompileResult<()> {
        for statement in statements {
            self.emit_statement(scope, statement, in_rescue)?;
        }
        Ok(())
    }

    fn emit_statement(
        &mut self,
        scope: &FunctionScope<B>,
        statement: &Stmt,
        in_rescue: bool,
    ) -> CompileResult<()> {
        let line = self.builder.literal(Literal::Int(i64::from(statement.line)))?;
        self.builder.build_store(scope.line_ptr, line)?;

        match &statement.kind {
            StmtKind::Puts(expr) => {
                let value = self.emit_expression(expr)?;
                self.builder
                    .build_call(Callee::Runtime(RuntimeFn::Puts), &[value], "")?;
            }
            StmtKind::Set { name, value } => {
                let value = self.emit_expression(value)?;
                let local = self.local(name);
                self.builder.build_local_set(local, value)?;
            }
            StmtKind::Incr(name) => {
                let local = self.local(name);
                let current = self.builder.build_local_get(local, name)?;
                let one = self.builder.literal(Literal::Int(1))?;
                let next = self.builder.build_value_call(
                    Callee::Runtime(RuntimeFn::IntAdd),
                    &[current, one],
                    name,
                )?;
                self.builder.build_local_set(local, next)?;
            }
            StmtKind::Raise { class, message } => {
                let pc = self.builder.build_load(scope.line_ptr, "pc")?;
                let class = self.builder.const_str(class)?;
                let message = self.builder.const_str(message.as_deref().unwrap_or(""))?;
                self.builder
                    .build_call(Callee::Runtime(RuntimeFn::Raise), &[pc, class, message], "")?;
                self.builder.build_unreachable()?;
                self.open_dead_block(scope, "after.raise")?;
            }
            StmtKind::Return(value) => {
                let value = match value {
                    Some(expr) => self.emit_expression(expr)?,
                    None => self.builder.literal(Literal::Nil)?,
                };
                self.builder.build_return(value)?;
                self.open_dead_block(scope, "after.return")?;
            }
            StmtKind::Retry => {
                if !in_rescue {
                    return Err(CompileError::RetryOutsideRescue {
                        span: statement.span,
                    });
                }
                let retry = self.builder.literal(Literal::Retry)?;
                self.builder.build_return(retry)?;
                self.open_dead_block(scope, "after.retry")?;
            }
            StmtKind::If(stmt) => self.emit_if(scope, stmt, in_rescue)?,
            StmtKind::Begin(begin) => self.emit_begin(scope, begin)?,
        }
        Ok(())
    }

    fn emit_expression(&mut self, expr: &Expr) -> CompileResult<B::Value> {
        let value = match expr {
            Expr::Nil => self.builder.literal(Literal::Nil)?,
            Expr::Int(value) => self.builder.literal(Literal::Int(*value))?,
            Expr::Str(text) => self.builder.const_str(text)?,
            Expr::Var(name) => {
                let local = self.local(name);
                self.builder.build_local_get(local, name)?
            }
            Expr::ErrInfo => {
                self.builder
                    .build_value_call(Callee::Runtime(RuntimeFn::ErrInfo), &[], "errinfo")?
            }
        };
        Ok(value)
    }

    fn emit_if(
        &mut self,
        scope: &FunctionScope<B>,
        stmt: &IfStmt,
        in_rescue: bool,
    ) -> CompileResult<()> {
        let lhs = self.emit_expression(&stmt.lhs)?;
        let rhs = self.emit_expression(&stmt.rhs)?;
        let pred = match stmt.op {
            CmpOp::Eq => IntPredicate::Eq,
            CmpOp::Ne => IntPredicate::Ne,
            CmpOp::Lt => IntPredicate::Slt,
            CmpOp::Le => IntPredicate::Sle,
            CmpOp::Gt => IntPredicate::Sgt,
            CmpOp::Ge => IntPredicate::Sge,
        };
        let cond = self.builder.build_icmp(pred, lhs, rhs, "cond")?;

        let then_block = self.builder.append_block(scope.function, "if.then")?;
        let else_block = match stmt.else_body {
            Some(_) => Some(self.builder.append_block(scope.function, "if.else")?),
            None => None,
        };
        let end_block = self.builder.append_block(scope.function, "if.end")?;
        self.builder
            .build_cond_br(cond, then_block, else_block.unwrap_or(end_block))?;

        self.builder.position_at_end(then_block);
        self.emit_block(scope, &stmt.then_body, in_rescue)?;
        if !self.builder.is_terminated() {
            self.builder.build_br(end_block)?;
        }
        if let (Some(block), Some(body)) = (else_block, &stmt.else_body) {
            self.builder.position_at_end(block);
            self.emit_block(scope, body, in_rescue)?;
            if !self.builder.is_terminated() {
                self.builder.build_br(end_block)?;
            }
        }
        self.builder.position_at_end(end_block);
        Ok(())
    }

    /// Compiles the four region functions of `begin` and then lowers the
    /// construct itself into the enclosing function.
    fn emit_begin(&mut self, scope: &FunctionScope<B>, begin: &BeginBlock) -> CompileResult<()> {
        let regions = ExceptionRegions::from_body(self.alloc_regions(ExceptionRegions::SPAN));
        let exception_value = self.fresh_local();
        let index = regions.body.0;
        let saved = self.builder.save_insert_point();

        let name = format!("{}$begin{index}", self.method);
        let body = self.open_function(&name, regions.body, FunctionType::Body)?;
        self.emit_block(&body, &begin.body, false)?;
        self.finish_function(&body)?;

        let name = format!("{}$rescue{index}", self.method);
        let handlers = self.open_function(&name, regions.handlers, FunctionType::Handlers)?;
        self.emit_rescue_clauses(&handlers, &begin.rescues, exception_value)?;
        self.finish_function(&handlers)?;

        self.emit_optional_region(
            "else",
            index,
            regions.else_region,
            FunctionType::Else,
            begin.else_body.as_deref(),
        )?;
        self.emit_optional_region(
            "ensure",
            index,
            regions.ensure,
            FunctionType::Ensure,
            begin.ensure_body.as_deref(),
        )?;

        self.builder.restore_insert_point(saved);
        emit_exception_handlers(
            &mut *self.builder,
            &self.ctx,
            scope.region,
            regions,
            exception_value,
        )?;
        Ok(())
    }

    fn emit_optional_region(
        &mut self,
        label: &str,
        index: u32,
        region: RegionId,
        kind: FunctionType,
        body: Option<&[Stmt]>,
    ) -> CompileResult<()> {
        let Some(body) = body else {
            self.ctx.mark_unused(region);
            return Ok(());
        };
        let name = format!("{}${label}{index}", self.method);
        let scope = self.open_function(&name, region, kind)?;
        self.emit_block(&scope, body, false)?;
        self.finish_function(&scope)
    }

    /// Tests each clause in order. A matching clause binds the exception,
    /// clears the construct's exception variable and runs its body; when no
    /// clause matches the variable stays set.
    fn emit_rescue_clauses(
        &mut self,
        scope: &FunctionScope<B>,
        clauses: &[RescueClause],
        exception_value: LocalId,
    ) -> CompileResult<()> {
        for clause in clauses {
            let exception = self
                .builder
                .build_local_get(exception_value, "exception")?;
            let body_block = self.builder.append_block(scope.function, "rescue.body")?;
            let next_block = self.builder.append_block(scope.function, "rescue.next")?;

            match clause.classes.split_last() {
                None => self.builder.build_br(body_block)?,
                Some((last, leading)) => {
                    for class in leading {
                        let matches = self.emit_isa(exception, class)?;
                        let test_next = self.builder.append_block(scope.function, "rescue.test")?;
                        self.builder.build_cond_br(matches, body_block, test_next)?;
                        self.builder.position_at_end(test_next);
                    }
                    let matches = self.emit_isa(exception, last)?;
                    self.builder.build_cond_br(matches, body_block, next_block)?;
                }
            }

            self.builder.position_at_end(body_block);
            if let Some(binding) = &clause.binding {
                let local = self.local(binding);
                self.builder.build_local_set(local, exception)?;
            }
            let nil = self.builder.literal(Literal::Nil)?;
            self.builder.build_local_set(exception_value, nil)?;
            self.emit_block(scope, &clause.body, true)?;
            if !self.builder.is_terminated() {
                let undef = self.builder.literal(Literal::Undef)?;
                self.builder.build_return(undef)?;
            }

            self.builder.position_at_end(next_block);
        }
        Ok(())
    }

    fn emit_isa(&mut self, exception: B::Value, class: &str) -> CompileResult<B::Value> {
        let class = self.builder.const_str(class)?;
        Ok(self.builder.build_value_call(
            Callee::Runtime(RuntimeFn::IsA),
            &[exception, class],
            "matches",
        )?)
    }

    /// Code after a `return`, `raise` or `retry` goes into a fresh block no
    /// edge reaches.
    fn open_dead_block(&mut self, scope: &FunctionScope<B>, name: &str) -> CompileResult<()> {
        let block = self.builder.append_block(scope.function, name)?;
        self.builder.position_at_end(block);
        Ok(())
    }
}
