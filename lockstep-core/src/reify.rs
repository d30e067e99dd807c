#![forbid(unsafe_code)]

//! Message reification.
//!
//! For every activable class each eligible method gets a [`MessagePlan`]:
//! the shape of the message type a call on the activated proxy turns into.
//! Calls on proxies in function and method bodies are rewritten into
//! `ExprKind::Send` nodes that name the message type. Every lockable class
//! also gets [`WrapperPlan`]s describing how dynamic callers reach its fields
//! and methods.

use std::collections::HashMap;

use lockstep_ast::{
    Block, ClassDef, Expr, ExprKind, LockKind, LockMode, MethodDef, Param, Program, Stmt, TypeRef,
};
use serde::Serialize;
use tracing::debug;

use crate::types::ClassTable;

/// How a method's return value is delivered to the result sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReturnCategory {
    Void,
    Int,
    /// Reference to a lockable object.
    Pointer,
    Generic,
}

impl ReturnCategory {
    pub fn of(ret: Option<&TypeRef>, table: &ClassTable) -> Self {
        let Some(ty) = ret else {
            return ReturnCategory::Void;
        };
        match ty.class_name() {
            "void" => ReturnCategory::Void,
            "int" | "long" | "short" | "char" | "bint" | "bool" | "size_t" => ReturnCategory::Int,
            name if table.class(name).is_some() => ReturnCategory::Pointer,
            _ => ReturnCategory::Generic,
        }
    }
}

/// One argument captured by a message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CapturedArg {
    pub name: String,
    pub ty: String,
    /// Lock taken on the argument during activation; `None` for values that
    /// are not lockable objects.
    pub lock: Option<LockKind>,
    /// Carried in the optional-argument record.
    pub optional: bool,
}

impl CapturedArg {
    /// Lockable arguments are retained for the message's lifetime.
    pub fn is_retained(&self) -> bool {
        self.lock.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MessagePlan {
    pub class: String,
    pub method: String,
    pub message_type: String,
    pub target_lock: LockKind,
    /// Required arguments first, then optional ones, each in declaration order.
    pub args: Vec<CapturedArg>,
    pub ret: ReturnCategory,
}

impl MessagePlan {
    fn new(class: &str, method: &MethodDef, table: &ClassTable) -> Self {
        let capture = |p: &Param, optional: bool| CapturedArg {
            name: p.name.node.clone(),
            ty: p.ty.class_name().to_string(),
            lock: table
                .is_lockable(&p.ty)
                .then(|| lock_for_constness(p.ty.is_const())),
            optional,
        };
        let args = method
            .required_params()
            .map(|p| capture(p, false))
            .chain(method.optional_params().map(|p| capture(p, true)))
            .collect();
        MessagePlan {
            class: class.to_string(),
            method: method.name.node.clone(),
            message_type: message_type_name(class, &method.name.node),
            target_lock: lock_for_constness(method.is_const),
            args,
            ret: ReturnCategory::of(method.ret.as_ref(), table),
        }
    }

    /// Locks taken during activation, in acquisition order: the target,
    /// then every lockable argument.
    pub fn acquisition_order(&self) -> Vec<(&str, LockKind)> {
        std::iter::once(("self", self.target_lock))
            .chain(
                self.args
                    .iter()
                    .filter_map(|a| a.lock.map(|l| (a.name.as_str(), l))),
            )
            .collect()
    }
}

pub fn message_type_name(class: &str, method: &str) -> String {
    format!("{class}_{method}_message")
}

fn lock_for_constness(is_const: bool) -> LockKind {
    if is_const { LockKind::Read } else { LockKind::Write }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum WrapperKind {
    Getter { field: String },
    Setter { field: String },
    Method { method: String, is_static: bool },
}

/// Access path a dynamic caller uses for one member of a lockable class.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WrapperPlan {
    pub class: String,
    pub wrapper: WrapperKind,
    /// Lock held around the forwarded access, if any.
    pub lock: Option<LockKind>,
}

fn wrapper_plans(class: &ClassDef, mode: LockMode, table: &ClassTable) -> Vec<WrapperPlan> {
    let checked = mode == LockMode::CheckLock;
    let plan = |wrapper, lock: LockKind, applies: bool| WrapperPlan {
        class: class.name.node.clone(),
        wrapper,
        lock: (checked && applies).then_some(lock),
    };
    let mut out = Vec::new();
    for field in &class.fields {
        out.push(plan(
            WrapperKind::Getter {
                field: field.name.node.clone(),
            },
            LockKind::Read,
            true,
        ));
        out.push(plan(
            WrapperKind::Setter {
                field: field.name.node.clone(),
            },
            LockKind::Write,
            true,
        ));
    }
    for m in table.methods_of(&class.name.node) {
        if m.is_special() || m.has_optional_params() {
            continue;
        }
        out.push(plan(
            WrapperKind::Method {
                method: m.name.node.clone(),
                is_static: m.is_static,
            },
            lock_for_constness(m.is_const),
            !m.is_static,
        ));
    }
    out
}

/// Messages and wrappers synthesized for one program.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ProgramPlan {
    pub messages: Vec<MessagePlan>,
    pub wrappers: Vec<WrapperPlan>,
}

impl ProgramPlan {
    pub fn message(&self, class: &str, method: &str) -> Option<&MessagePlan> {
        self.messages
            .iter()
            .find(|m| m.class == class && m.method == method)
    }

    pub fn messages_for<'a>(&'a self, class: &'a str) -> impl Iterator<Item = &'a MessagePlan> {
        self.messages.iter().filter(move |m| m.class == class)
    }
}

pub struct MessageReifier<'a> {
    table: &'a ClassTable,
}

impl<'a> MessageReifier<'a> {
    pub fn new(table: &'a ClassTable) -> Self {
        Self { table }
    }

    pub fn plan(&self, program: &Program) -> ProgramPlan {
        let mut plan = ProgramPlan::default();
        for class in &program.classes {
            let name = class.name.node.as_str();
            if let Some(info) = self.table.class(name) {
                plan.wrappers
                    .extend(wrapper_plans(class, info.lock_mode, self.table));
            }
            if !class.activable {
                continue;
            }
            for m in self.table.methods_of(name) {
                if m.is_static || m.is_special() {
                    continue;
                }
                let message = MessagePlan::new(name, m, self.table);
                debug!(
                    class = name,
                    method = %message.method,
                    message_type = %message.message_type,
                    args = message.args.len(),
                    "synthesized message"
                );
                plan.messages.push(message);
            }
        }
        plan
    }

    /// Turn calls on activated proxies into message sends. The first call
    /// argument is the sync handle (`None` for no sync). Returns the number
    /// of rewritten calls.
    pub fn rewrite(&self, program: &mut Program, plan: &ProgramPlan) -> usize {
        let mut count = 0;
        for f in &mut program.functions {
            let mut rw = SendRewriter::new(plan);
            for p in &f.params {
                rw.declare(&p.name.node, p.ty.clone());
            }
            rw.block(&mut f.body);
            count += rw.count;
        }
        for class in &mut program.classes {
            let class_name = class.name.node.clone();
            for m in &mut class.methods {
                let Some(body) = &mut m.body else {
                    continue;
                };
                let mut rw = SendRewriter::new(plan);
                if !m.is_static {
                    rw.declare("self", TypeRef::named(class_name.clone()));
                }
                for p in &m.params {
                    rw.declare(&p.name.node, p.ty.clone());
                }
                rw.block(body);
                count += rw.count;
            }
        }
        count
    }
}

struct SendRewriter<'p> {
    plan: &'p ProgramPlan,
    scopes: Vec<HashMap<String, TypeRef>>,
    count: usize,
}

impl<'p> SendRewriter<'p> {
    fn new(plan: &'p ProgramPlan) -> Self {
        Self {
            plan,
            scopes: vec![HashMap::new()],
            count: 0,
        }
    }

    fn declare(&mut self, name: &str, ty: TypeRef) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), ty);
        }
    }

    fn type_of(&self, expr: &Expr) -> Option<TypeRef> {
        if let Some(ty) = &expr.ty {
            return Some(ty.clone());
        }
        match &expr.kind {
            ExprKind::Name(id) => self
                .scopes
                .iter()
                .rev()
                .find_map(|s| s.get(&id.node))
                .cloned(),
            ExprKind::Activate(inner) => self.type_of(inner).map(TypeRef::activated),
            ExprKind::Locked { object, .. } => self.type_of(object),
            _ => None,
        }
    }

    fn block(&mut self, block: &mut Block) {
        self.scopes.push(HashMap::new());
        for stmt in &mut block.stmts {
            self.stmt(stmt);
        }
        self.scopes.pop();
    }

    fn stmt(&mut self, stmt: &mut Stmt) {
        match stmt {
            Stmt::Let(s) => {
                if let Some(init) = &mut s.init {
                    self.expr(init);
                }
                self.declare(&s.name.node, s.ty.clone());
            }
            Stmt::Assign(s) => {
                self.expr(&mut s.value);
                self.expr(&mut s.target);
            }
            Stmt::Del(s) => self.expr(&mut s.target),
            Stmt::If(s) => {
                self.expr(&mut s.cond);
                self.block(&mut s.then_block);
                if let Some(b) = &mut s.else_block {
                    self.block(b);
                }
            }
            Stmt::While(s) => {
                self.expr(&mut s.cond);
                self.block(&mut s.body);
            }
            Stmt::For(s) => {
                self.expr(&mut s.iter);
                self.scopes.push(HashMap::new());
                if let Some(ty) = &s.target_ty {
                    self.declare(&s.target.node, ty.clone());
                }
                self.block(&mut s.body);
                self.scopes.pop();
            }
            Stmt::With(s) => {
                self.expr(&mut s.context);
                self.scopes.push(HashMap::new());
                if let (Some(t), Some(ty)) = (&s.target, &s.target_ty) {
                    self.declare(&t.node, ty.clone());
                }
                self.block(&mut s.body);
                self.scopes.pop();
            }
            Stmt::Locked(s) => {
                self.expr(&mut s.target);
                self.block(&mut s.body);
            }
            Stmt::Try(s) => {
                self.block(&mut s.body);
                for h in &mut s.handlers {
                    self.block(&mut h.body);
                }
                if let Some(f) = &mut s.finally {
                    self.block(f);
                }
            }
            Stmt::Return(s) => {
                if let Some(v) = &mut s.value {
                    self.expr(v);
                }
            }
            Stmt::Expr(e) => self.expr(e),
        }
    }

    fn expr(&mut self, expr: &mut Expr) {
        match &mut expr.kind {
            ExprKind::Name(_)
            | ExprKind::IntLit(_)
            | ExprKind::BoolLit(_)
            | ExprKind::StringLit(_)
            | ExprKind::NoneLit => {}
            ExprKind::Attribute { base, .. } => self.expr(base),
            ExprKind::Call { callee, args } => {
                self.expr(callee);
                for a in args.iter_mut() {
                    self.expr(a);
                }
            }
            ExprKind::Subscript { base, index } => {
                self.expr(base);
                self.expr(index);
            }
            ExprKind::Binary { left, right, .. } => {
                self.expr(left);
                self.expr(right);
            }
            ExprKind::Unary { expr: inner, .. } | ExprKind::Activate(inner) => self.expr(inner),
            ExprKind::Locked { object, .. } => self.expr(object),
            ExprKind::Send {
                target, sync, args, ..
            } => {
                self.expr(target);
                if let Some(s) = sync {
                    self.expr(s);
                }
                for a in args.iter_mut() {
                    self.expr(a);
                }
            }
        }
        self.try_send(expr);
    }

    fn try_send(&mut self, expr: &mut Expr) {
        let ExprKind::Call { callee, .. } = &expr.kind else {
            return;
        };
        let ExprKind::Attribute { base, attr } = &callee.kind else {
            return;
        };
        let Some(ty) = self.type_of(base).filter(|t| t.activated) else {
            return;
        };
        let Some(message) = self.plan.message(ty.class_name(), &attr.node) else {
            return;
        };
        let message_type = message.message_type.clone();
        let class = message.class.clone();

        let span = expr.span;
        let ty = expr.ty.take();
        let old = std::mem::replace(&mut expr.kind, ExprKind::NoneLit);
        let ExprKind::Call { callee, args } = old else {
            return;
        };
        let ExprKind::Attribute { base, attr } = callee.kind else {
            return;
        };
        let mut args = args.into_iter();
        let sync = args
            .next()
            .filter(|s| !matches!(s.kind, ExprKind::NoneLit))
            .map(Box::new);
        *expr = Expr {
            span,
            ty,
            kind: ExprKind::Send {
                target: base,
                class,
                method: attr,
                message: message_type,
                sync,
                args: args.collect(),
            },
        };
        self.count += 1;
    }
}

/// Plan messages and wrappers for `program` and rewrite its proxy calls.
pub fn reify_program(program: &mut Program, table: &ClassTable) -> ProgramPlan {
    let reifier = MessageReifier::new(table);
    let plan = reifier.plan(program);
    let sends = reifier.rewrite(program, &plan);
    debug!(
        messages = plan.messages.len(),
        wrappers = plan.wrappers.len(),
        sends,
        "reification finished"
    );
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep_ast::{ClassDef, FnDef, Param};

    fn program() -> Program {
        Program {
            classes: vec![
                ClassDef::new("Account", LockMode::CheckLock)
                    .activable()
                    .field("balance", TypeRef::named("int"))
                    .method(MethodDef::new("__init__", vec![], None))
                    .method(
                        MethodDef::new("get", vec![], Some(TypeRef::named("int"))).constant(),
                    )
                    .method(MethodDef::new(
                        "transfer",
                        vec![
                            Param::new("to", TypeRef::named("Account")),
                            Param::new("amount", TypeRef::named("int")),
                            Param::new("audit", TypeRef::named("Account").constant())
                                .optional(Expr::none()),
                        ],
                        None,
                    ))
                    .method(MethodDef::new("zero", vec![], None).static_()),
            ],
            functions: vec![],
        }
    }

    #[test]
    fn only_eligible_methods_get_messages() {
        let prog = program();
        let table = ClassTable::new(&prog, LockMode::NoLock);
        let plan = MessageReifier::new(&table).plan(&prog);
        let names: Vec<&str> = plan.messages.iter().map(|m| m.method.as_str()).collect();
        assert_eq!(names, vec!["get", "transfer"]);
        assert_eq!(plan.messages[0].message_type, "Account_get_message");
        assert_eq!(plan.messages[0].ret, ReturnCategory::Int);
    }

    #[test]
    fn acquisition_order_is_target_then_lockable_args() {
        let prog = program();
        let table = ClassTable::new(&prog, LockMode::NoLock);
        let plan = MessageReifier::new(&table).plan(&prog);
        let transfer = plan.message("Account", "transfer").unwrap();
        assert_eq!(
            transfer.acquisition_order(),
            vec![
                ("self", LockKind::Write),
                ("to", LockKind::Write),
                ("audit", LockKind::Read),
            ]
        );
        assert!(transfer.args[2].optional);
        assert!(!transfer.args[1].is_retained());
    }

    #[test]
    fn checklock_wrappers_lock_by_constness() {
        let prog = program();
        let table = ClassTable::new(&prog, LockMode::NoLock);
        let plan = MessageReifier::new(&table).plan(&prog);
        let lock_of = |w: &WrapperKind| plan.wrappers.iter().find(|p| &p.wrapper == w).map(|p| p.lock);
        assert_eq!(
            lock_of(&WrapperKind::Getter { field: "balance".into() }),
            Some(Some(LockKind::Read))
        );
        assert_eq!(
            lock_of(&WrapperKind::Setter { field: "balance".into() }),
            Some(Some(LockKind::Write))
        );
        assert_eq!(
            lock_of(&WrapperKind::Method { method: "zero".into(), is_static: true }),
            Some(None)
        );
        // optional arguments and constructors have no wrapper
        assert_eq!(
            lock_of(&WrapperKind::Method { method: "transfer".into(), is_static: false }),
            None
        );
        assert_eq!(
            lock_of(&WrapperKind::Method { method: "__init__".into(), is_static: false }),
            None
        );
    }

    #[test]
    fn proxy_calls_become_sends() {
        let mut prog = program();
        prog.functions.push(FnDef::new(
            "main",
            vec![Param::new("acct", TypeRef::named("Account").activated())],
            vec![Stmt::expr(
                Expr::name("acct")
                    .attr("transfer")
                    .call(vec![Expr::none(), Expr::name("other"), Expr::int(5)]),
            )],
        ));
        let table = ClassTable::new(&prog, LockMode::NoLock);
        let plan = reify_program(&mut prog, &table);
        let Stmt::Expr(e) = &prog.functions[0].body.stmts[0] else {
            panic!("expected expression statement");
        };
        match &e.kind {
            ExprKind::Send {
                message, sync, args, ..
            } => {
                assert_eq!(message, "Account_transfer_message");
                assert!(sync.is_none());
                assert_eq!(args.len(), 2);
            }
            other => panic!("expected send, got {other:?}"),
        }
        assert_eq!(plan.messages.len(), 2);
    }
}
