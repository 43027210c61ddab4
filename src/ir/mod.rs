//! A small LLVM-flavoured IR that lowered exception regions are emitted into.
//!
//! Every function takes the same three context parameters `(pc, closure, cfp)`
//! and owns an initializer block that runs once per activation before
//! branching to the entry block. Stack slots (`alloca`) belong in the
//! initializer block; see [`verify`].

use crate::runtime::abi::RuntimeFn;
use std::collections::HashMap;
use std::fmt;

pub mod builder;
pub mod verify;

pub use builder::{BuildError, BuildResult, Callee, IrBuilder, ModuleBuilder};

/// Number of context parameters every IR function receives.
pub const PARAM_COUNT: usize = 3;
pub const PARAM_NAMES: [&str; PARAM_COUNT] = ["pc", "closure", "cfp"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(pub(crate) u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub(crate) u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub(crate) u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StrId(pub(crate) u32);

/// Index of a variable in a method's closure storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(pub u32);

impl FuncId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl ValueId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Literal values a builder can materialize without any runtime call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Literal {
    /// "no exception"
    Nil,
    /// "no value produced"
    Undef,
    /// the distinguished `retry` return value
    Retry,
    Int(i64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Constant {
    Nil,
    Undef,
    Retry,
    True,
    False,
    Int(i64),
    Str(StrId),
}

impl From<Literal> for Constant {
    fn from(literal: Literal) -> Self {
        match literal {
            Literal::Nil => Constant::Nil,
            Literal::Undef => Constant::Undef,
            Literal::Retry => Constant::Retry,
            Literal::Int(value) => Constant::Int(value),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FuncRef {
    Ir(FuncId),
    Runtime(RuntimeFn),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operand {
    Value(ValueId),
    Const(Constant),
    Func(FuncRef),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntPredicate {
    Eq,
    Ne,
    Slt,
    Sle,
    Sgt,
    Sge,
}

impl IntPredicate {
    pub fn mnemonic(self) -> &'static str {
        match self {
            IntPredicate::Eq => "eq",
            IntPredicate::Ne => "ne",
            IntPredicate::Slt => "slt",
            IntPredicate::Sle => "sle",
            IntPredicate::Sgt => "sgt",
            IntPredicate::Sge => "sge",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum InstKind {
    Alloca,
    Load { ptr: Operand },
    Store { ptr: Operand, value: Operand },
    Call { callee: FuncRef, args: Vec<Operand> },
    ICmp { pred: IntPredicate, lhs: Operand, rhs: Operand },
    And { lhs: Operand, rhs: Operand },
    Select { cond: Operand, then_value: Operand, else_value: Operand },
    LocalGet { local: LocalId },
    LocalSet { local: LocalId, value: Operand },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Inst {
    pub result: Option<ValueId>,
    pub kind: InstKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Terminator {
    Br(BlockId),
    CondBr {
        cond: Operand,
        then_block: BlockId,
        else_block: BlockId,
    },
    Ret(Operand),
    Unreachable,
}

impl Terminator {
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Br(target) => vec![*target],
            Terminator::CondBr {
                then_block,
                else_block,
                ..
            } => vec![*then_block, *else_block],
            Terminator::Ret(_) | Terminator::Unreachable => Vec::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Block {
    pub name: String,
    pub insts: Vec<Inst>,
    pub terminator: Option<Terminator>,
}

impl Block {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            insts: Vec::new(),
            terminator: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Function {
    pub name: String,
    pub blocks: Vec<Block>,
    pub init: BlockId,
    pub entry: BlockId,
    value_names: Vec<String>,
}

impl Function {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        let mut init = Block::new("init");
        init.terminator = Some(Terminator::Br(BlockId(1)));
        Self {
            name: name.into(),
            blocks: vec![init, Block::new("entry")],
            init: BlockId(0),
            entry: BlockId(1),
            value_names: PARAM_NAMES.iter().map(|name| name.to_string()).collect(),
        }
    }

    pub fn params(&self) -> [ValueId; PARAM_COUNT] {
        [ValueId(0), ValueId(1), ValueId(2)]
    }

    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(id.index())
    }

    pub(crate) fn block_mut(&mut self, id: BlockId) -> Option<&mut Block> {
        self.blocks.get_mut(id.index())
    }

    pub fn value_count(&self) -> usize {
        self.value_names.len()
    }

    pub fn value_name(&self, id: ValueId) -> &str {
        self.value_names
            .get(id.index())
            .map(String::as_str)
            .unwrap_or("")
    }

    pub(crate) fn append_block(&mut self, name: &str) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        let name = if self.block_by_name(name).is_some() {
            format!("{name}.{}", id.0)
        } else {
            name.to_string()
        };
        self.blocks.push(Block::new(name));
        id
    }

    pub(crate) fn fresh_value(&mut self, name: &str) -> ValueId {
        let id = ValueId(self.value_names.len() as u32);
        self.value_names.push(name.to_string());
        id
    }

    pub fn instructions(&self) -> impl Iterator<Item = (BlockId, &Inst)> {
        self.blocks.iter().enumerate().flat_map(|(idx, block)| {
            block
                .insts
                .iter()
                .map(move |inst| (BlockId(idx as u32), inst))
        })
    }

    /// Calls made by this function, in block order.
    pub fn calls(&self) -> impl Iterator<Item = (FuncRef, &[Operand])> {
        self.instructions().filter_map(|(_, inst)| match &inst.kind {
            InstKind::Call { callee, args } => Some((*callee, args.as_slice())),
            _ => None,
        })
    }

    pub fn block_by_name(&self, name: &str) -> Option<BlockId> {
        self.blocks
            .iter()
            .position(|block| block.name == name)
            .map(|idx| BlockId(idx as u32))
    }
}

#[derive(Clone, Debug, Default)]
pub struct Module {
    pub name: String,
    pub functions: Vec<Function>,
    strings: Vec<String>,
    string_ids: HashMap<String, StrId>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn function(&self, id: FuncId) -> Option<&Function> {
        self.functions.get(id.index())
    }

    pub(crate) fn function_mut(&mut self, id: FuncId) -> Option<&mut Function> {
        self.functions.get_mut(id.index())
    }

    pub fn function_by_name(&self, name: &str) -> Option<(FuncId, &Function)> {
        self.functions
            .iter()
            .enumerate()
            .find(|(_, func)| func.name == name)
            .map(|(idx, func)| (FuncId(idx as u32), func))
    }

    pub(crate) fn add_function(&mut self, name: &str) -> FuncId {
        let id = FuncId(self.functions.len() as u32);
        self.functions.push(Function::new(name));
        id
    }

    pub fn intern(&mut self, text: &str) -> StrId {
        if let Some(id) = self.string_ids.get(text) {
            return *id;
        }
        let id = StrId(self.strings.len() as u32);
        self.strings.push(text.to_string());
        self.string_ids.insert(text.to_string(), id);
        id
    }

    pub fn string(&self, id: StrId) -> &str {
        self.strings
            .get(id.0 as usize)
            .map(String::as_str)
            .unwrap_or("")
    }

    fn callee_name(&self, callee: FuncRef) -> &str {
        match callee {
            FuncRef::Ir(id) => self
                .function(id)
                .map(|func| func.name.as_str())
                .unwrap_or("<unknown>"),
            FuncRef::Runtime(rt) => rt.symbol(),
        }
    }
}

struct OperandDisplay<'a> {
    module: &'a Module,
    func: &'a Function,
    operand: Operand,
}

impl fmt::Display for OperandDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operand {
            Operand::Value(id) => write_value(f, self.func, id),
            Operand::Const(constant) => match constant {
                Constant::Nil => write!(f, "nil"),
                Constant::Undef => write!(f, "undef"),
                Constant::Retry => write!(f, "retry"),
                Constant::True => write!(f, "true"),
                Constant::False => write!(f, "false"),
                Constant::Int(value) => write!(f, "{value}"),
                Constant::Str(id) => write!(f, "{:?}", self.module.string(id)),
            },
            Operand::Func(callee) => write!(f, "@{}", self.module.callee_name(callee)),
        }
    }
}

fn write_value(f: &mut fmt::Formatter<'_>, func: &Function, id: ValueId) -> fmt::Result {
    let name = func.value_name(id);
    if id.index() < PARAM_COUNT {
        write!(f, "%{name}")
    } else if name.is_empty() {
        write!(f, "%{}", id.0)
    } else {
        write!(f, "%{name}.{}", id.0)
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "; module {}", self.name)?;
        for func in &self.functions {
            writeln!(f)?;
            write_function(f, self, func)?;
        }
        Ok(())
    }
}

fn write_function(f: &mut fmt::Formatter<'_>, module: &Module, func: &Function) -> fmt::Result {
    let op = |operand| OperandDisplay {
        module,
        func,
        operand,
    };
    writeln!(f, "define @{}(%pc, %closure, %cfp) {{", func.name)?;
    for block in &func.blocks {
        writeln!(f, "{}:", block.name)?;
        for inst in &block.insts {
            write!(f, "  ")?;
            if let Some(result) = inst.result {
                write_value(f, func, result)?;
                write!(f, " = ")?;
            }
            match &inst.kind {
                InstKind::Alloca => write!(f, "alloca")?,
                InstKind::Load { ptr } => write!(f, "load {}", op(*ptr))?,
                InstKind::Store { ptr, value } => write!(f, "store {}, {}", op(*ptr), op(*value))?,
                InstKind::Call { callee, args } => {
                    write!(f, "call @{}(", module.callee_name(*callee))?;
                    for (idx, arg) in args.iter().enumerate() {
                        if idx > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{}", op(*arg))?;
                    }
                    write!(f, ")")?;
                }
                InstKind::ICmp { pred, lhs, rhs } => {
                    write!(f, "icmp {} {}, {}", pred.mnemonic(), op(*lhs), op(*rhs))?
                }
                InstKind::And { lhs, rhs } => write!(f, "and {}, {}", op(*lhs), op(*rhs))?,
                InstKind::Select {
                    cond,
                    then_value,
                    else_value,
                } => write!(
                    f,
                    "select {}, {}, {}",
                    op(*cond),
                    op(*then_value),
                    op(*else_value)
                )?,
                InstKind::LocalGet { local } => write!(f, "local.get ${}", local.0)?,
                InstKind::LocalSet { local, value } => {
                    write!(f, "local.set ${}, {}", local.0, op(*value))?
                }
            }
            writeln!(f)?;
        }
        let block_name = |id: BlockId| {
            func.block(id)
                .map(|block| block.name.as_str())
                .unwrap_or("<missing>")
        };
        match &block.terminator {
            Some(Terminator::Br(target)) => writeln!(f, "  br {}", block_name(*target))?,
            Some(Terminator::CondBr {
                cond,
                then_block,
                else_block,
            }) => writeln!(
                f,
                "  condbr {}, {}, {}",
                op(*cond),
                block_name(*then_block),
                block_name(*else_block)
            )?,
            Some(Terminator::Ret(value)) => writeln!(f, "  ret {}", op(*value))?,
            Some(Terminator::Unreachable) => writeln!(f, "  unreachable")?,
            None => writeln!(f, "  ; <unterminated>")?,
        }
    }
    writeln!(f, "}}")
}
