#![forbid(unsafe_code)]

//! Typed tree handed to the lock-discipline pass by the upstream front end.
//!
//! Every expression may carry the static type resolved upstream; class
//! declarations carry the lock mode and per-method constness the checker
//! consults. The builder methods at the bottom keep hand-written trees short.

use miette::SourceSpan;
use serde::{Deserialize, Serialize};

pub type Span = SourceSpan;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spanned<T> {
    pub span: Span,
    pub node: T,
}

impl<T> Spanned<T> {
    pub fn new(span: Span, node: T) -> Self {
        Self { span, node }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Spanned<U> {
        Spanned {
            span: self.span,
            node: f(self.node),
        }
    }
}

pub fn span(start: usize, len: usize) -> Span {
    SourceSpan::new(start.into(), len)
}

pub fn span_between(start: usize, end: usize) -> Span {
    debug_assert!(end >= start);
    span(start, end - start)
}

pub type Ident = Spanned<String>;

pub fn ident(name: impl Into<String>) -> Ident {
    Spanned::new(span(0, 0), name.into())
}

/// Lock discipline of a lockable class, fixed when the class is defined.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    /// No checking; the caller is responsible.
    #[default]
    NoLock,
    /// Every access must be covered by an enclosing lock.
    CheckLock,
    /// Unguarded accesses get a minimal-scope lock inserted.
    AutoLock,
}

impl LockMode {
    pub fn display(&self) -> &'static str {
        match self {
            LockMode::NoLock => "nolock",
            LockMode::CheckLock => "checklock",
            LockMode::AutoLock => "autolock",
        }
    }
}

/// Shared (read) or exclusive (write) acquisition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockKind {
    Read,
    Write,
}

impl LockKind {
    pub fn display(&self) -> &'static str {
        match self {
            LockKind::Read => "read",
            LockKind::Write => "write",
        }
    }

    /// Keyword of the explicit lock block (`with rlocked x:` / `with wlocked x:`).
    pub fn keyword(&self) -> &'static str {
        match self {
            LockKind::Read => "rlocked",
            LockKind::Write => "wlocked",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Qualifier {
    #[default]
    Plain,
    /// Read-only reference.
    Const,
    /// Reference whose every member access locks the object for the access.
    Locked,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeRef {
    pub span: Span,
    pub name: Ident,
    #[serde(default)]
    pub qualifier: Qualifier,
    /// Reference to the activated proxy of `name` rather than the object itself.
    #[serde(default)]
    pub activated: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Program {
    #[serde(default)]
    pub classes: Vec<ClassDef>,
    #[serde(default)]
    pub functions: Vec<FnDef>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClassDef {
    pub span: Span,
    pub name: Ident,
    /// `None` falls back to the checker's configured default.
    #[serde(default)]
    pub lock_mode: Option<LockMode>,
    #[serde(default)]
    pub activable: bool,
    #[serde(default)]
    pub bases: Vec<Ident>,
    #[serde(default)]
    pub fields: Vec<FieldDef>,
    #[serde(default)]
    pub methods: Vec<MethodDef>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub span: Span,
    pub name: Ident,
    pub ty: TypeRef,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MethodDef {
    pub span: Span,
    pub name: Ident,
    #[serde(default)]
    pub is_const: bool,
    #[serde(default)]
    pub is_static: bool,
    #[serde(default)]
    pub params: Vec<Param>,
    #[serde(default)]
    pub ret: Option<TypeRef>,
    #[serde(default)]
    pub body: Option<Block>,
}

impl MethodDef {
    pub fn required_params(&self) -> impl Iterator<Item = &Param> {
        self.params.iter().filter(|p| p.default.is_none())
    }

    pub fn optional_params(&self) -> impl Iterator<Item = &Param> {
        self.params.iter().filter(|p| p.default.is_some())
    }

    pub fn has_optional_params(&self) -> bool {
        self.params.iter().any(|p| p.default.is_some())
    }

    /// Constructors, destructors and allocation hooks.
    pub fn is_special(&self) -> bool {
        matches!(
            self.name.node.as_str(),
            "__init__" | "__new__" | "__dealloc__" | "__del__" | "__alloc__"
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub span: Span,
    pub name: Ident,
    pub ty: TypeRef,
    /// Present for optional arguments.
    #[serde(default)]
    pub default: Option<Expr>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FnDef {
    pub span: Span,
    pub name: Ident,
    #[serde(default)]
    pub params: Vec<Param>,
    #[serde(default)]
    pub ret: Option<TypeRef>,
    pub body: Block,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub span: Span,
    pub stmts: Vec<Stmt>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    Let(LetStmt),
    Assign(AssignStmt),
    Del(DelStmt),
    If(IfStmt),
    While(WhileStmt),
    For(ForStmt),
    With(WithStmt),
    Locked(LockedStmt),
    Try(TryStmt),
    Return(ReturnStmt),
    Expr(Expr),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LetStmt {
    pub span: Span,
    pub name: Ident,
    pub ty: TypeRef,
    #[serde(default)]
    pub init: Option<Expr>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssignStmt {
    pub span: Span,
    pub target: Expr,
    pub value: Expr,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DelStmt {
    pub span: Span,
    pub target: Expr,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IfStmt {
    pub span: Span,
    pub cond: Expr,
    pub then_block: Block,
    #[serde(default)]
    pub else_block: Option<Block>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WhileStmt {
    pub span: Span,
    pub cond: Expr,
    pub body: Block,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ForStmt {
    pub span: Span,
    pub target: Ident,
    #[serde(default)]
    pub target_ty: Option<TypeRef>,
    pub iter: Expr,
    pub body: Block,
}

/// `with <context> as <target>:` over an ordinary context manager.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WithStmt {
    pub span: Span,
    pub context: Expr,
    #[serde(default)]
    pub target: Option<Ident>,
    #[serde(default)]
    pub target_ty: Option<TypeRef>,
    pub body: Block,
}

/// `with rlocked x:` / `with wlocked x:`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LockedStmt {
    pub span: Span,
    pub kind: LockKind,
    pub target: Expr,
    pub body: Block,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TryStmt {
    pub span: Span,
    pub body: Block,
    #[serde(default)]
    pub handlers: Vec<ExceptHandler>,
    #[serde(default)]
    pub finally: Option<Block>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExceptHandler {
    pub span: Span,
    #[serde(default)]
    pub ty: Option<TypeRef>,
    #[serde(default)]
    pub name: Option<Ident>,
    pub body: Block,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReturnStmt {
    pub span: Span,
    #[serde(default)]
    pub value: Option<Expr>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Expr {
    pub span: Span,
    /// Static type resolved upstream, when known.
    #[serde(default)]
    pub ty: Option<TypeRef>,
    pub kind: ExprKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ExprKind {
    Name(Ident),
    IntLit(i64),
    BoolLit(bool),
    StringLit(String),
    NoneLit,
    Attribute {
        base: Box<Expr>,
        attr: Ident,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Subscript {
        base: Box<Expr>,
        index: Box<Expr>,
    },
    Binary {
        left: Box<Expr>,
        op: BinOp,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    /// `activate(obj)`: the activated proxy of a lockable object.
    Activate(Box<Expr>),
    /// Inserted by the checker: a temporary holding a locked view of `object`
    /// for the duration of the enclosing statement.
    Locked {
        kind: LockKind,
        object: Box<Expr>,
    },
    /// Inserted by the reifier: a method call on an activated proxy turned
    /// into a queued message.
    Send {
        target: Box<Expr>,
        class: String,
        method: Ident,
        message: String,
        sync: Option<Box<Expr>>,
        args: Vec<Expr>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Not,
    Invert,
}

impl UnaryOp {
    pub fn method_name(&self) -> Option<&'static str> {
        match self {
            UnaryOp::Neg => Some("__neg__"),
            UnaryOp::Invert => Some("__invert__"),
            UnaryOp::Not => None,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            UnaryOp::Neg => "-",
            UnaryOp::Not => "!",
            UnaryOp::Invert => "~",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,

    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,

    And,
    Or,
}

impl BinOp {
    pub fn method_name(&self) -> Option<&'static str> {
        Some(match self {
            BinOp::Add => "__add__",
            BinOp::Sub => "__sub__",
            BinOp::Mul => "__mul__",
            BinOp::Div => "__truediv__",
            BinOp::Mod => "__mod__",
            BinOp::Eq => "__eq__",
            BinOp::Ne => "__ne__",
            BinOp::Lt => "__lt__",
            BinOp::Gt => "__gt__",
            BinOp::Le => "__le__",
            BinOp::Ge => "__ge__",
            BinOp::And | BinOp::Or => return None,
        })
    }

    /// Method looked up on the right operand when the left one has none.
    pub fn reflected_name(&self) -> Option<&'static str> {
        Some(match self {
            BinOp::Add => "__radd__",
            BinOp::Sub => "__rsub__",
            BinOp::Mul => "__rmul__",
            BinOp::Div => "__rtruediv__",
            BinOp::Mod => "__rmod__",
            BinOp::Eq => "__eq__",
            BinOp::Ne => "__ne__",
            BinOp::Lt => "__gt__",
            BinOp::Gt => "__lt__",
            BinOp::Le => "__ge__",
            BinOp::Ge => "__le__",
            BinOp::And | BinOp::Or => return None,
        })
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Gt => ">",
            BinOp::Le => "<=",
            BinOp::Ge => ">=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        }
    }
}

// ---- builders -------------------------------------------------------------

impl TypeRef {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            span: span(0, 0),
            name: ident(name),
            qualifier: Qualifier::Plain,
            activated: false,
        }
    }

    pub fn constant(mut self) -> Self {
        self.qualifier = Qualifier::Const;
        self
    }

    pub fn locked(mut self) -> Self {
        self.qualifier = Qualifier::Locked;
        self
    }

    pub fn activated(mut self) -> Self {
        self.activated = true;
        self
    }

    pub fn is_const(&self) -> bool {
        self.qualifier == Qualifier::Const
    }

    pub fn is_locked(&self) -> bool {
        self.qualifier == Qualifier::Locked
    }

    pub fn class_name(&self) -> &str {
        &self.name.node
    }
}

impl Expr {
    pub fn new(span: Span, kind: ExprKind) -> Self {
        Self { span, ty: None, kind }
    }

    pub fn name(name: impl Into<String>) -> Self {
        Self::new(span(0, 0), ExprKind::Name(ident(name)))
    }

    pub fn int(value: i64) -> Self {
        Self::new(span(0, 0), ExprKind::IntLit(value))
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self::new(span(0, 0), ExprKind::StringLit(value.into()))
    }

    pub fn none() -> Self {
        Self::new(span(0, 0), ExprKind::NoneLit)
    }

    pub fn at(mut self, start: usize, len: usize) -> Self {
        self.span = span(start, len);
        self
    }

    pub fn typed(mut self, ty: TypeRef) -> Self {
        self.ty = Some(ty);
        self
    }

    pub fn attr(self, attr: impl Into<String>) -> Self {
        let span = self.span;
        Self::new(
            span,
            ExprKind::Attribute {
                base: Box::new(self),
                attr: Spanned::new(span, attr.into()),
            },
        )
    }

    pub fn call(self, args: Vec<Expr>) -> Self {
        let span = self.span;
        Self::new(
            span,
            ExprKind::Call {
                callee: Box::new(self),
                args,
            },
        )
    }

    pub fn index(self, index: Expr) -> Self {
        let span = self.span;
        Self::new(
            span,
            ExprKind::Subscript {
                base: Box::new(self),
                index: Box::new(index),
            },
        )
    }

    pub fn binary(self, op: BinOp, right: Expr) -> Self {
        let span = self.span;
        Self::new(
            span,
            ExprKind::Binary {
                left: Box::new(self),
                op,
                right: Box::new(right),
            },
        )
    }

    pub fn unary(op: UnaryOp, expr: Expr) -> Self {
        let span = expr.span;
        Self::new(
            span,
            ExprKind::Unary {
                op,
                expr: Box::new(expr),
            },
        )
    }

    pub fn activate(self) -> Self {
        let span = self.span;
        Self::new(span, ExprKind::Activate(Box::new(self)))
    }

    pub fn as_name(&self) -> Option<&str> {
        match &self.kind {
            ExprKind::Name(id) => Some(id.node.as_str()),
            _ => None,
        }
    }
}

impl Block {
    pub fn new(stmts: Vec<Stmt>) -> Self {
        Self {
            span: span(0, 0),
            stmts,
        }
    }
}

impl Stmt {
    pub fn span(&self) -> Span {
        match self {
            Stmt::Let(s) => s.span,
            Stmt::Assign(s) => s.span,
            Stmt::Del(s) => s.span,
            Stmt::If(s) => s.span,
            Stmt::While(s) => s.span,
            Stmt::For(s) => s.span,
            Stmt::With(s) => s.span,
            Stmt::Locked(s) => s.span,
            Stmt::Try(s) => s.span,
            Stmt::Return(s) => s.span,
            Stmt::Expr(e) => e.span,
        }
    }

    pub fn let_(name: impl Into<String>, ty: TypeRef, init: Option<Expr>) -> Self {
        Stmt::Let(LetStmt {
            span: init.as_ref().map(|e| e.span).unwrap_or(span(0, 0)),
            name: ident(name),
            ty,
            init,
        })
    }

    pub fn assign(target: Expr, value: Expr) -> Self {
        Stmt::Assign(AssignStmt {
            span: target.span,
            target,
            value,
        })
    }

    pub fn del(target: Expr) -> Self {
        Stmt::Del(DelStmt {
            span: target.span,
            target,
        })
    }

    pub fn expr(expr: Expr) -> Self {
        Stmt::Expr(expr)
    }

    pub fn ret(value: Option<Expr>) -> Self {
        Stmt::Return(ReturnStmt {
            span: value.as_ref().map(|e| e.span).unwrap_or(span(0, 0)),
            value,
        })
    }

    pub fn locked(kind: LockKind, target: Expr, body: Vec<Stmt>) -> Self {
        Stmt::Locked(LockedStmt {
            span: target.span,
            kind,
            target,
            body: Block::new(body),
        })
    }

    pub fn for_(target: impl Into<String>, iter: Expr, body: Vec<Stmt>) -> Self {
        Stmt::For(ForStmt {
            span: iter.span,
            target: ident(target),
            target_ty: None,
            iter,
            body: Block::new(body),
        })
    }
}

impl Param {
    pub fn new(name: impl Into<String>, ty: TypeRef) -> Self {
        Self {
            span: span(0, 0),
            name: ident(name),
            ty,
            default: None,
        }
    }

    pub fn optional(mut self, default: Expr) -> Self {
        self.default = Some(default);
        self
    }
}

impl FieldDef {
    pub fn new(name: impl Into<String>, ty: TypeRef) -> Self {
        Self {
            span: span(0, 0),
            name: ident(name),
            ty,
        }
    }
}

impl MethodDef {
    pub fn new(name: impl Into<String>, params: Vec<Param>, ret: Option<TypeRef>) -> Self {
        Self {
            span: span(0, 0),
            name: ident(name),
            is_const: false,
            is_static: false,
            params,
            ret,
            body: None,
        }
    }

    pub fn constant(mut self) -> Self {
        self.is_const = true;
        self
    }

    pub fn static_(mut self) -> Self {
        self.is_static = true;
        self
    }

    pub fn with_body(mut self, stmts: Vec<Stmt>) -> Self {
        self.body = Some(Block::new(stmts));
        self
    }
}

impl ClassDef {
    pub fn new(name: impl Into<String>, lock_mode: LockMode) -> Self {
        Self {
            span: span(0, 0),
            name: ident(name),
            lock_mode: Some(lock_mode),
            activable: false,
            bases: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
        }
    }

    pub fn activable(mut self) -> Self {
        self.activable = true;
        self
    }

    pub fn base(mut self, name: impl Into<String>) -> Self {
        self.bases.push(ident(name));
        self
    }

    pub fn field(mut self, name: impl Into<String>, ty: TypeRef) -> Self {
        self.fields.push(FieldDef::new(name, ty));
        self
    }

    pub fn method(mut self, method: MethodDef) -> Self {
        self.methods.push(method);
        self
    }
}

impl FnDef {
    pub fn new(name: impl Into<String>, params: Vec<Param>, body: Vec<Stmt>) -> Self {
        Self {
            span: span(0, 0),
            name: ident(name),
            params,
            ret: None,
            body: Block::new(body),
        }
    }
}
