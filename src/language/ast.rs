use crate::language::span::Span;

#[derive(Clone, Debug, Default)]
pub struct Program {
    pub methods: Vec<MethodDef>,
}

impl Program {
    pub fn method(&self, name: &str) -> Option<&MethodDef> {
        self.methods.iter().find(|method| method.name == name)
    }
}

#[derive(Clone, Debug)]
pub struct MethodDef {
    pub name: String,
    pub body: Vec<Stmt>,
    pub span: Span,
}

#[derive(Clone, Debug)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
    pub line: u32,
}

#[derive(Clone, Debug)]
pub enum StmtKind {
    Puts(Expr),
    Set { name: String, value: Expr },
    Incr(String),
    Raise {
        class: String,
        message: Option<String>,
    },
    Return(Option<Expr>),
    Retry,
    If(IfStmt),
    Begin(BeginBlock),
}

#[derive(Clone, Debug)]
pub enum Expr {
    Nil,
    Int(i64),
    Str(String),
    Var(String),
    /// `$!`, the ambient pending error
    ErrInfo,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    pub fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }
}

#[derive(Clone, Debug)]
pub struct IfStmt {
    pub lhs: Expr,
    pub op: CmpOp,
    pub rhs: Expr,
    pub then_body: Vec<Stmt>,
    pub else_body: Option<Vec<Stmt>>,
}

/// `begin { .. } rescue .. { .. } else { .. } ensure { .. }`
#[derive(Clone, Debug)]
pub struct BeginBlock {
    pub body: Vec<Stmt>,
    pub rescues: Vec<RescueClause>,
    pub else_body: Option<Vec<Stmt>>,
    pub ensure_body: Option<Vec<Stmt>>,
}

#[derive(Clone, Debug)]
pub struct RescueClause {
    /// Empty for a bare `rescue`, which matches any exception.
    pub classes: Vec<String>,
    pub binding: Option<String>,
    pub body: Vec<Stmt>,
    pub span: Span,
}
