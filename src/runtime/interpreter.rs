use crate::ir::{
    Constant, FuncId, FuncRef, Function, InstKind, IntPredicate, Module, Operand, Terminator,
    PARAM_COUNT,
};
use crate::runtime::{
    abi::RuntimeFn,
    ambient::{AmbientCell, AmbientErrors},
    environment::{Environment, SlotStack},
    error::{RuntimeError, RuntimeResult},
    value::{Exception, Value},
};
use log::{debug, trace};
use std::rc::Rc;

pub const DEFAULT_MAX_STEPS: u64 = 1_000_000;

/// How a method activation ended.
#[derive(Clone, Debug, PartialEq)]
pub enum RunOutcome {
    Returned(Value),
    Raised(Value),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExecStats {
    pub steps: u64,
    pub calls: u64,
    /// Number of `alloca` instructions executed.
    pub allocas: u64,
    /// Largest number of stack slots live at once.
    pub peak_slots: usize,
}

#[derive(Clone, Debug)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub output: Vec<String>,
    pub final_errinfo: Value,
    pub stats: ExecStats,
}

struct Frame {
    values: Vec<Option<Value>>,
}

/// Executes lowered IR against an [`AmbientErrors`] implementation.
pub struct Interpreter<'m, A: AmbientErrors = AmbientCell> {
    module: &'m Module,
    ambient: A,
    envs: Vec<Environment>,
    slots: SlotStack,
    output: Vec<String>,
    steps: u64,
    calls: u64,
    max_steps: u64,
}

impl<'m> Interpreter<'m, AmbientCell> {
    pub fn new(module: &'m Module) -> Self {
        Self::with_ambient(module, AmbientCell::new())
    }
}

impl<'m, A: AmbientErrors> Interpreter<'m, A> {
    pub fn with_ambient(module: &'m Module, ambient: A) -> Self {
        Self {
            module,
            ambient,
            envs: Vec::new(),
            slots: SlotStack::default(),
            output: Vec::new(),
            steps: 0,
            calls: 0,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn ambient(&self) -> &A {
        &self.ambient
    }

    pub fn stats(&self) -> ExecStats {
        ExecStats {
            steps: self.steps,
            calls: self.calls,
            allocas: self.slots.allocations(),
            peak_slots: self.slots.peak(),
        }
    }

    /// Runs the method `name` in a fresh closure environment.
    pub fn run_method(&mut self, name: &str) -> RuntimeResult<RunReport> {
        let (id, _) =
            self.module
                .function_by_name(name)
                .ok_or_else(|| RuntimeError::UnknownFunction {
                    name: name.to_string(),
                })?;
        self.envs.push(Environment::new());
        let env = Value::Env(self.envs.len() - 1);
        debug!("running `{name}`");

        let outcome = match self.call_function(id, [Value::Int(0), env, Value::Int(0)]) {
            Ok(value) if value.is_undef() => RunOutcome::Returned(Value::Nil),
            Ok(value) => RunOutcome::Returned(value),
            Err(RuntimeError::Raised { exception }) => RunOutcome::Raised(exception),
            Err(err) => return Err(err),
        };
        Ok(RunReport {
            outcome,
            output: std::mem::take(&mut self.output),
            final_errinfo: self.ambient.errinfo(),
            stats: self.stats(),
        })
    }

    pub fn call_function(
        &mut self,
        id: FuncId,
        args: [Value; PARAM_COUNT],
    ) -> RuntimeResult<Value> {
        let module = self.module;
        let func = module
            .function(id)
            .ok_or_else(|| RuntimeError::UnknownFunction {
                name: format!("#{}", id.index()),
            })?;
        self.calls += 1;
        trace!("call @{}", func.name);

        let mark = self.slots.mark();
        let result = self.execute(func, args);
        self.slots.release_to(mark);
        result
    }

    fn execute(&mut self, func: &'m Function, args: [Value; PARAM_COUNT]) -> RuntimeResult<Value> {
        let mut frame = Frame {
            values: vec![None; func.value_count()],
        };
        for (slot, arg) in frame.values.iter_mut().zip(args) {
            *slot = Some(arg);
        }

        let mut current = func.init;
        loop {
            let block = func.block(current).ok_or_else(|| invalid(func, "missing block"))?;
            for inst in &block.insts {
                self.tick()?;
                let value = self.eval_inst(func, &frame, &inst.kind)?;
                if let Some(result) = inst.result {
                    frame.values[result.index()] = Some(value);
                }
            }
            self.tick()?;
            match block.terminator {
                Some(Terminator::Br(target)) => current = target,
                Some(Terminator::CondBr {
                    cond,
                    then_block,
                    else_block,
                }) => {
                    current = if self.bool_operand(func, &frame, cond)? {
                        then_block
                    } else {
                        else_block
                    };
                }
                Some(Terminator::Ret(value)) => return self.operand(func, &frame, value),
                Some(Terminator::Unreachable) => {
                    return Err(invalid(func, "reached an unreachable terminator"))
                }
                None => return Err(invalid(func, "fell off an unterminated block")),
            }
        }
    }

    fn tick(&mut self) -> RuntimeResult<()> {
        self.steps += 1;
        if self.steps > self.max_steps {
            return Err(RuntimeError::StepLimit {
                limit: self.max_steps,
            });
        }
        Ok(())
    }

    fn eval_inst(
        &mut self,
        func: &Function,
        frame: &Frame,
        kind: &InstKind,
    ) -> RuntimeResult<Value> {
        match kind {
            InstKind::Alloca => Ok(Value::Ptr(self.slots.alloc())),
            InstKind::Load { ptr } => {
                let slot = self.ptr_operand(func, frame, *ptr)?;
                self.slots
                    .get(slot)
                    .cloned()
                    .ok_or_else(|| invalid(func, "load from a released slot"))
            }
            InstKind::Store { ptr, value } => {
                let slot = self.ptr_operand(func, frame, *ptr)?;
                let value = self.operand(func, frame, *value)?;
                if !self.slots.set(slot, value) {
                    return Err(invalid(func, "store to a released slot"));
                }
                Ok(Value::Nil)
            }
            InstKind::Call { callee, args } => {
                let args = args
                    .iter()
                    .map(|arg| self.operand(func, frame, *arg))
                    .collect::<RuntimeResult<Vec<_>>>()?;
                self.call(*callee, args)
            }
            InstKind::ICmp { pred, lhs, rhs } => {
                let lhs = self.operand(func, frame, *lhs)?;
                let rhs = self.operand(func, frame, *rhs)?;
                compare(*pred, &lhs, &rhs).map(Value::Bool)
            }
            InstKind::And { lhs, rhs } => {
                let lhs = self.bool_operand(func, frame, *lhs)?;
                let rhs = self.bool_operand(func, frame, *rhs)?;
                Ok(Value::Bool(lhs && rhs))
            }
            InstKind::Select {
                cond,
                then_value,
                else_value,
            } => {
                let picked = if self.bool_operand(func, frame, *cond)? {
                    *then_value
                } else {
                    *else_value
                };
                self.operand(func, frame, picked)
            }
            InstKind::LocalGet { local } => {
                let env = self.env_index(func, frame)?;
                Ok(self.envs[env].get(*local))
            }
            InstKind::LocalSet { local, value } => {
                let env = self.env_index(func, frame)?;
                let value = self.operand(func, frame, *value)?;
                self.envs[env].set(*local, value);
                Ok(Value::Nil)
            }
        }
    }

    fn operand(&self, func: &Function, frame: &Frame, operand: Operand) -> RuntimeResult<Value> {
        match operand {
            Operand::Value(id) => frame
                .values
                .get(id.index())
                .cloned()
                .flatten()
                .ok_or_else(|| invalid(func, "use of a value before its definition")),
            Operand::Const(constant) => Ok(match constant {
                Constant::Nil => Value::Nil,
                Constant::Undef => Value::Undef,
                Constant::Retry => Value::Retry,
                Constant::True => Value::Bool(true),
                Constant::False => Value::Bool(false),
                Constant::Int(value) => Value::Int(value),
                Constant::Str(id) => Value::Str(Rc::from(self.module.string(id))),
            }),
            Operand::Func(callee) => Ok(Value::Func(callee)),
        }
    }

    fn bool_operand(
        &self,
        func: &Function,
        frame: &Frame,
        operand: Operand,
    ) -> RuntimeResult<bool> {
        match self.operand(func, frame, operand)? {
            Value::Bool(value) => Ok(value),
            other => Err(RuntimeError::type_mismatch("bool", &other)),
        }
    }

    fn ptr_operand(
        &self,
        func: &Function,
        frame: &Frame,
        operand: Operand,
    ) -> RuntimeResult<usize> {
        match self.operand(func, frame, operand)? {
            Value::Ptr(slot) => Ok(slot),
            other => Err(RuntimeError::type_mismatch("pointer", &other)),
        }
    }

    fn env_index(&self, func: &Function, frame: &Frame) -> RuntimeResult<usize> {
        let [_, closure, _] = func.params();
        match self.operand(func, frame, Operand::Value(closure))? {
            Value::Env(env) if env < self.envs.len() => Ok(env),
            other => Err(RuntimeError::type_mismatch("closure", &other)),
        }
    }

    fn call(&mut self, callee: FuncRef, args: Vec<Value>) -> RuntimeResult<Value> {
        match callee {
            FuncRef::Ir(id) => {
                let args = context_args(self.module, callee, args)?;
                self.call_function(id, args)
            }
            FuncRef::Runtime(rt) => self.call_runtime(rt, args),
        }
    }

    fn call_runtime(&mut self, rt: RuntimeFn, args: Vec<Value>) -> RuntimeResult<Value> {
        if args.len() != rt.arity() {
            return Err(RuntimeError::ArityMismatch {
                name: rt.symbol().to_string(),
                expected: rt.arity(),
                received: args.len(),
            });
        }
        self.calls += 1;
        trace!("call {}({})", rt.symbol(), args.len());
        let mut args = args.into_iter();
        let mut next = || args.next().unwrap_or(Value::Nil);

        match rt {
            RuntimeFn::Try => {
                let (callee, pc, closure, cfp, context, out) =
                    (next(), next(), next(), next(), next(), next());
                let callee = match callee {
                    Value::Func(callee) => callee,
                    other => return Err(RuntimeError::type_mismatch("function", &other)),
                };
                let out = match out {
                    Value::Ptr(out) => out,
                    other => return Err(RuntimeError::type_mismatch("pointer", &other)),
                };
                self.ambient.set_errinfo(context);
                let (result, captured) = match self.call(callee, vec![pc, closure, cfp]) {
                    Ok(value) => (value, Value::Nil),
                    Err(RuntimeError::Raised { exception }) => (Value::Undef, exception),
                    Err(err) => return Err(err),
                };
                if !self.slots.set(out, captured) {
                    return Err(RuntimeError::InvalidIr {
                        function: rt.symbol().to_string(),
                        message: "exception out-slot was released".into(),
                    });
                }
                Ok(result)
            }
            RuntimeFn::ErrInfo => Ok(self.ambient.errinfo()),
            RuntimeFn::SetErrInfo => {
                self.ambient.set_errinfo(next());
                Ok(Value::Nil)
            }
            RuntimeFn::RaiseIfNotNil => match next() {
                Value::Nil => Ok(Value::Nil),
                exception => self.raise(exception),
            },
            RuntimeFn::BlockReturnUndef => Ok(Value::Undef),
            RuntimeFn::Raise => {
                let (pc, class, message) = (next(), next(), next());
                let line = match pc {
                    Value::Int(line) => line,
                    _ => 0,
                };
                let class = match class {
                    Value::Str(class) => class.to_string(),
                    other => return Err(RuntimeError::type_mismatch("string", &other)),
                };
                let message = match message {
                    Value::Str(text) if !text.is_empty() => Some(text.to_string()),
                    _ => None,
                };
                let exception = Value::Exception(Rc::new(Exception::new(class, message, line)));
                self.raise(exception)
            }
            RuntimeFn::IsA => {
                let (exception, class) = (next(), next());
                let class = match class {
                    Value::Str(class) => class,
                    other => return Err(RuntimeError::type_mismatch("string", &other)),
                };
                Ok(Value::Bool(
                    exception
                        .as_exception()
                        .map(|exception| exception.is_a(&class))
                        .unwrap_or(false),
                ))
            }
            RuntimeFn::Puts => {
                let value = next();
                debug!("puts {}", value.inspect());
                self.output.push(value.to_string());
                Ok(Value::Nil)
            }
            RuntimeFn::IntAdd => match (next(), next()) {
                (Value::Int(lhs), Value::Int(rhs)) => Ok(Value::Int(lhs.wrapping_add(rhs))),
                (Value::Int(_), other) | (other, _) => {
                    Err(RuntimeError::type_mismatch("int", &other))
                }
            },
        }
    }

    /// Raising installs the error as ambient, like the host runtime does.
    fn raise(&mut self, exception: Value) -> RuntimeResult<Value> {
        trace!("raise {}", exception.inspect());
        self.ambient.set_errinfo(exception.clone());
        Err(RuntimeError::Raised { exception })
    }
}

fn context_args(
    module: &Module,
    callee: FuncRef,
    args: Vec<Value>,
) -> RuntimeResult<[Value; PARAM_COUNT]> {
    let received = args.len();
    <[Value; PARAM_COUNT]>::try_from(args).map_err(|_| RuntimeError::ArityMismatch {
        name: match callee {
            FuncRef::Ir(id) => module
                .function(id)
                .map(|func| func.name.clone())
                .unwrap_or_default(),
            FuncRef::Runtime(rt) => rt.symbol().to_string(),
        },
        expected: PARAM_COUNT,
        received,
    })
}

fn compare(pred: IntPredicate, lhs: &Value, rhs: &Value) -> RuntimeResult<bool> {
    match pred {
        IntPredicate::Eq => Ok(lhs == rhs),
        IntPredicate::Ne => Ok(lhs != rhs),
        ordering => {
            let (Value::Int(lhs), Value::Int(rhs)) = (lhs, rhs) else {
                let culprit = if matches!(lhs, Value::Int(_)) { rhs } else { lhs };
                return Err(RuntimeError::type_mismatch("int", culprit));
            };
            Ok(match ordering {
                IntPredicate::Slt => lhs < rhs,
                IntPredicate::Sle => lhs <= rhs,
                IntPredicate::Sgt => lhs > rhs,
                _ => lhs >= rhs,
            })
        }
    }
}

fn invalid(func: &Function, message: &str) -> RuntimeError {
    RuntimeError::InvalidIr {
        function: func.name.clone(),
        message: message.to_string(),
    }
}
