#![forbid(unsafe_code)]

//! Lock-discipline pass.
//!
//! Every function and method body is walked with its own [`AccessContext`]
//! and [`LockStateTracker`], so bodies are checked in parallel. An access to
//! a lockable object that needs a lock the body does not hold is either
//! reported (`checklock`), rewritten into a scoped lock (`autolock` or a
//! `locked`-qualified reference) or ignored (`nolock`).

use std::collections::HashMap;

use lockstep_ast::{
    AssignStmt, BinOp, Block, DelStmt, Expr, ExprKind, FnDef, Ident, LockKind, LockMode,
    LockedStmt, MethodDef, Param, Program, Stmt, TypeRef,
};
use rayon::prelude::*;
use tracing::{debug, trace};

use crate::access::{AccessContext, AccessKind};
use crate::config::CheckerConfig;
use crate::error::{CheckFailed, LockDiagnostic, UNNAMED_REFERENCE};
use crate::insertion::{InsertedLock, coerce_to_locked};
use crate::lock_state::{BindingId, LockStateTracker};
use crate::types::ClassTable;

/// A program that passed the check, with every inserted lock recorded.
#[derive(Clone, Debug)]
pub struct CheckedProgram {
    pub program: Program,
    pub inserted: Vec<InsertedLock>,
}

pub struct LockChecker<'a> {
    table: &'a ClassTable,
    config: &'a CheckerConfig,
}

impl<'a> LockChecker<'a> {
    pub fn new(table: &'a ClassTable, config: &'a CheckerConfig) -> Self {
        Self { table, config }
    }

    /// Check and rewrite every body in `program`.
    ///
    /// Diagnostics from all bodies are collected before failing, ordered by
    /// source position.
    pub fn check(&self, mut program: Program) -> Result<CheckedProgram, CheckFailed> {
        let mut outcomes: Vec<BodyOutcome> = program
            .functions
            .par_iter_mut()
            .map(|f| {
                let mut body = BodyChecker::new(self.table);
                body.check_function(f);
                body.finish()
            })
            .collect();

        let per_class: Vec<Vec<BodyOutcome>> = program
            .classes
            .par_iter_mut()
            .map(|class| {
                let class_name = class.name.node.clone();
                class
                    .methods
                    .iter_mut()
                    .map(|m| {
                        let mut body = BodyChecker::new(self.table);
                        body.check_method(&class_name, m);
                        body.finish()
                    })
                    .collect()
            })
            .collect();
        outcomes.extend(per_class.into_iter().flatten());

        let mut diagnostics = Vec::new();
        let mut inserted = Vec::new();
        for outcome in outcomes {
            diagnostics.extend(outcome.diagnostics);
            inserted.extend(outcome.inserted);
        }
        diagnostics.sort_by_key(|d| (d.span.offset(), d.span.len()));
        inserted.sort_by_key(|l| (l.span.offset(), l.span.len()));
        if self.config.max_diagnostics > 0 {
            diagnostics.truncate(self.config.max_diagnostics);
        }

        debug!(
            functions = program.functions.len(),
            classes = program.classes.len(),
            inserted = inserted.len(),
            errors = diagnostics.len(),
            "lock discipline check finished"
        );

        if !diagnostics.is_empty() {
            return Err(CheckFailed { diagnostics });
        }
        Ok(CheckedProgram { program, inserted })
    }
}

struct BodyOutcome {
    diagnostics: Vec<LockDiagnostic>,
    inserted: Vec<InsertedLock>,
}

#[derive(Clone, Debug)]
struct Binding {
    id: BindingId,
    ty: Option<TypeRef>,
}

/// Which element method a subscript goes through.
#[derive(Clone, Copy, Debug)]
enum ItemAccess {
    Get,
    Set,
    Del,
}

impl ItemAccess {
    fn method_name(self) -> &'static str {
        match self {
            ItemAccess::Get => "__getitem__",
            ItemAccess::Set => "__setitem__",
            ItemAccess::Del => "__delitem__",
        }
    }

    /// Access on the container when the element method is not const (or
    /// could not be resolved).
    fn mutating(self, resolved: bool) -> AccessKind {
        match self {
            ItemAccess::Get if !resolved => AccessKind::Read,
            ItemAccess::Get | ItemAccess::Set => AccessKind::Write,
            ItemAccess::Del => AccessKind::Delete,
        }
    }
}

struct BodyChecker<'a> {
    table: &'a ClassTable,
    access: AccessContext,
    locks: LockStateTracker,
    scopes: Vec<HashMap<String, Binding>>,
    next_id: u32,
    diagnostics: Vec<LockDiagnostic>,
    inserted: Vec<InsertedLock>,
}

impl<'a> BodyChecker<'a> {
    fn new(table: &'a ClassTable) -> Self {
        Self {
            table,
            access: AccessContext::default(),
            locks: LockStateTracker::new(),
            scopes: vec![HashMap::new()],
            next_id: 0,
            diagnostics: Vec::new(),
            inserted: Vec::new(),
        }
    }

    fn finish(self) -> BodyOutcome {
        BodyOutcome {
            diagnostics: self.diagnostics,
            inserted: self.inserted,
        }
    }

    fn check_function(&mut self, f: &mut FnDef) {
        trace!(function = %f.name.node, "checking function");
        self.enter_params(&f.params);
        self.visit_block(&mut f.body);
    }

    fn check_method(&mut self, class: &str, m: &mut MethodDef) {
        let Some(body) = &mut m.body else {
            return;
        };
        trace!(class, method = %m.name.node, "checking method");
        if !m.is_static {
            let mut ty = TypeRef::named(class);
            if m.is_const {
                ty = ty.constant();
            }
            let id = self.declare(&lockstep_ast::ident("self"), Some(ty));
            self.locks
                .assume_held(id, AccessKind::for_constness(m.is_const).required_lock());
        }
        self.enter_params(&m.params);
        self.visit_block(body);
    }

    /// The caller holds the lock each lockable parameter promises.
    fn enter_params(&mut self, params: &[Param]) {
        for p in params {
            let id = self.declare(&p.name, Some(p.ty.clone()));
            if self.table.is_lockable(&p.ty) {
                self.locks
                    .assume_held(id, AccessKind::for_constness(p.ty.is_const()).required_lock());
            }
        }
    }

    // ---- scopes -------------------------------------------------------------

    fn declare(&mut self, name: &Ident, ty: Option<TypeRef>) -> BindingId {
        let id = BindingId(self.next_id);
        self.next_id += 1;
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.node.clone(), Binding { id, ty });
        }
        id
    }

    fn lookup(&self, name: &str) -> Option<&Binding> {
        self.scopes.iter().rev().find_map(|s| s.get(name))
    }

    fn report(&mut self, diagnostic: LockDiagnostic) {
        trace!(code = diagnostic.kind.code(), binding = %diagnostic.binding, "lock violation");
        self.diagnostics.push(diagnostic);
    }

    fn check_rebind(&mut self, name: &Ident) {
        let locked = self
            .lookup(&name.node)
            .is_some_and(|b| self.locks.is_locked(b.id));
        if locked {
            self.report(LockDiagnostic::rebind_locked(&name.node, name.span));
        }
    }

    // ---- types --------------------------------------------------------------

    fn type_of(&self, expr: &Expr) -> Option<TypeRef> {
        if let Some(ty) = &expr.ty {
            return Some(ty.clone());
        }
        match &expr.kind {
            ExprKind::Name(id) => self.lookup(&id.node).and_then(|b| b.ty.clone()),
            ExprKind::Attribute { base, attr } => {
                let base_ty = self.type_of(base)?;
                self.table
                    .lookup_field(base_ty.class_name(), &attr.node)
                    .map(|f| f.ty.clone())
            }
            ExprKind::Call { callee, .. } => match &callee.kind {
                ExprKind::Attribute { base, attr } => self.method_on(base, &attr.node)?.ret.clone(),
                ExprKind::Name(id) if self.lookup(&id.node).is_none() => {
                    if let Some(f) = self.table.function(&id.node) {
                        f.ret.clone()
                    } else if self.table.class(&id.node).is_some() {
                        Some(TypeRef::named(id.node.clone()))
                    } else {
                        None
                    }
                }
                _ => None,
            },
            ExprKind::Subscript { base, .. } => self.method_on(base, "__getitem__")?.ret.clone(),
            ExprKind::Binary { left, op, right } => {
                self.binary_method(left, *op, right).and_then(|(m, _)| m.ret.clone())
            }
            ExprKind::Unary { op, expr } => self.method_on(expr, op.method_name()?)?.ret.clone(),
            ExprKind::Activate(inner) => self.type_of(inner).map(TypeRef::activated),
            ExprKind::Locked { object, .. } => self.type_of(object),
            _ => None,
        }
    }

    /// Method `name` on the class of `receiver`. Proxies have no callable
    /// methods of their own here; their calls become messages.
    fn method_on(&self, receiver: &Expr, name: &str) -> Option<&'a MethodDef> {
        let ty = self.type_of(receiver)?;
        if ty.activated {
            return None;
        }
        self.table.lookup_method(ty.class_name(), name)
    }

    /// Operator method for `left op right`, falling back to the reflected
    /// method on the right operand. The flag is true for the reflected form.
    fn binary_method(&self, left: &Expr, op: BinOp, right: &Expr) -> Option<(&'a MethodDef, bool)> {
        if let Some(m) = op.method_name().and_then(|n| self.method_on(left, n)) {
            return Some((m, false));
        }
        op.reflected_name()
            .and_then(|n| self.method_on(right, n))
            .map(|m| (m, true))
    }

    fn param_access(&self, method: &MethodDef, index: usize) -> Option<AccessKind> {
        method
            .params
            .get(index)
            .filter(|p| self.table.is_lockable(&p.ty))
            .map(|p| AccessKind::for_constness(p.ty.is_const()))
    }

    fn callable_params(&self, name: &str) -> &'a [Param] {
        if let Some(f) = self.table.function(name) {
            return &f.params;
        }
        match self.table.lookup_method(name, "__init__") {
            Some(init) => &init.params,
            None => &[],
        }
    }

    // ---- statements ---------------------------------------------------------

    fn visit_block(&mut self, block: &mut Block) {
        self.visit_scoped(block, None);
    }

    /// Visit `block` in a fresh scope, optionally binding one name in it first.
    fn visit_scoped(&mut self, block: &mut Block, binding: Option<(&Ident, Option<TypeRef>)>) {
        self.scopes.push(HashMap::new());
        if let Some((name, ty)) = binding {
            self.check_rebind(name);
            self.declare(name, ty);
        }
        for stmt in &mut block.stmts {
            self.visit_stmt(stmt);
        }
        self.scopes.pop();
    }

    fn visit_stmt(&mut self, stmt: &mut Stmt) {
        match stmt {
            Stmt::Let(s) => {
                if let Some(init) = &mut s.init {
                    self.visit_with(init, None);
                }
                self.check_rebind(&s.name);
                self.declare(&s.name, Some(s.ty.clone()));
            }
            Stmt::Assign(s) => self.visit_assign(s),
            Stmt::Del(s) => self.visit_del(s),
            Stmt::If(s) => {
                self.visit_with(&mut s.cond, None);
                self.visit_block(&mut s.then_block);
                if let Some(b) = &mut s.else_block {
                    self.visit_block(b);
                }
            }
            Stmt::While(s) => {
                self.visit_with(&mut s.cond, None);
                self.visit_block(&mut s.body);
            }
            Stmt::For(s) => {
                self.visit_with(&mut s.iter, Some(AccessKind::Read));
                let ty = s.target_ty.clone();
                self.visit_scoped(&mut s.body, Some((&s.target, ty)));
            }
            Stmt::With(s) => {
                let enter = self.method_on(&s.context, "__enter__");
                let access = enter.map(|m| AccessKind::for_constness(m.is_const));
                self.visit_with(&mut s.context, access);
                let binding = s.target.as_ref().map(|t| {
                    let ty = s.target_ty.clone().or_else(|| enter.and_then(|m| m.ret.clone()));
                    (t, ty)
                });
                self.visit_scoped(&mut s.body, binding);
            }
            Stmt::Locked(s) => self.visit_lock_block(s),
            Stmt::Try(s) => {
                self.visit_block(&mut s.body);
                for h in &mut s.handlers {
                    let binding = h.name.as_ref().map(|n| (n, h.ty.clone()));
                    self.visit_scoped(&mut h.body, binding);
                }
                if let Some(f) = &mut s.finally {
                    self.visit_block(f);
                }
            }
            Stmt::Return(s) => {
                if let Some(v) = &mut s.value {
                    self.visit_with(v, None);
                }
            }
            Stmt::Expr(e) => self.visit_with(e, None),
        }
    }

    fn visit_assign(&mut self, s: &mut AssignStmt) {
        match &mut s.target.kind {
            ExprKind::Name(id) => {
                self.visit_with(&mut s.value, None);
                if self.lookup(&id.node).is_some() {
                    self.check_rebind(id);
                } else {
                    let ty = s.target.ty.clone().or_else(|| self.type_of(&s.value));
                    self.declare(id, ty);
                }
            }
            ExprKind::Attribute { base, .. } => {
                self.visit_with(&mut s.value, None);
                self.visit_with(base, Some(AccessKind::Write));
            }
            ExprKind::Subscript { base, index } => {
                let setter = self.visit_subscript(base, index, ItemAccess::Set);
                let value_access = setter.and_then(|m| self.param_access(m, 1));
                self.visit_with(&mut s.value, value_access);
            }
            _ => {
                self.visit_with(&mut s.value, None);
                self.visit_with(&mut s.target, None);
            }
        }
    }

    fn visit_del(&mut self, s: &mut DelStmt) {
        match &mut s.target.kind {
            ExprKind::Name(id) => {
                let locked = self
                    .lookup(&id.node)
                    .is_some_and(|b| self.locks.is_locked(b.id));
                if locked {
                    self.report(LockDiagnostic::delete_locked(&id.node, id.span));
                }
            }
            ExprKind::Attribute { base, .. } => self.visit_with(base, Some(AccessKind::Delete)),
            ExprKind::Subscript { base, index } => {
                self.visit_subscript(base, index, ItemAccess::Del);
            }
            _ => self.visit_with(&mut s.target, None),
        }
    }

    fn visit_lock_block(&mut self, s: &mut LockedStmt) {
        let scope = match &s.target.kind {
            ExprKind::Name(id) => {
                let binding = self.lookup(&id.node).cloned();
                let ty = binding
                    .as_ref()
                    .and_then(|b| b.ty.clone())
                    .or_else(|| s.target.ty.clone());
                match (binding, ty) {
                    (Some(b), Some(ty)) if self.table.is_lockable(&ty) => {
                        trace!(binding = %id.node, kind = s.kind.display(), "entering lock block");
                        Some(self.locks.enter(b.id, s.kind))
                    }
                    _ => {
                        let name = id.node.clone();
                        self.report(LockDiagnostic::lock_non_lockable(&name, s.kind, s.target.span));
                        None
                    }
                }
            }
            _ => {
                self.report(LockDiagnostic::lock_unnamed(s.kind, s.target.span));
                self.visit_with(&mut s.target, None);
                None
            }
        };
        self.visit_block(&mut s.body);
        if let Some(scope) = scope {
            self.locks.exit(scope);
        }
    }

    // ---- expressions --------------------------------------------------------

    fn visit_with(&mut self, expr: &mut Expr, access: Option<AccessKind>) {
        let prev = self.access.enter(access);
        self.visit_expr(expr);
        self.access.restore(prev);
    }

    fn visit_expr(&mut self, expr: &mut Expr) {
        let access = self.access.current();
        match &mut expr.kind {
            ExprKind::Name(_)
            | ExprKind::IntLit(_)
            | ExprKind::BoolLit(_)
            | ExprKind::StringLit(_)
            | ExprKind::NoneLit => {}
            // Loading a field reads the object holding it.
            ExprKind::Attribute { base, .. } => self.visit_with(base, Some(AccessKind::Read)),
            ExprKind::Call { callee, args } => self.visit_call(callee, args),
            ExprKind::Subscript { base, index } => {
                self.visit_subscript(base, index, ItemAccess::Get);
            }
            ExprKind::Binary { left, op, right } => {
                let (l, r) = match self.binary_method(left, *op, right) {
                    Some((m, false)) => (
                        Some(AccessKind::for_constness(m.is_const)),
                        self.param_access(m, 0),
                    ),
                    Some((m, true)) => (
                        self.param_access(m, 0),
                        Some(AccessKind::for_constness(m.is_const)),
                    ),
                    None => (None, None),
                };
                self.visit_with(left, l);
                self.visit_with(right, r);
            }
            ExprKind::Unary { op, expr: operand } => {
                let recv = op
                    .method_name()
                    .and_then(|n| self.method_on(operand, n))
                    .map(|m| AccessKind::for_constness(m.is_const));
                self.visit_with(operand, recv);
            }
            // Activation only copies the reference.
            ExprKind::Activate(inner) => self.visit_with(inner, None),
            ExprKind::Locked { .. } | ExprKind::Send { .. } => return,
        }
        if let Some(kind) = access {
            self.require(expr, kind);
        }
    }

    fn visit_call(&mut self, callee: &mut Expr, args: &mut [Expr]) {
        match &mut callee.kind {
            ExprKind::Attribute { base, attr } => {
                let receiver = self.type_of(base);
                let method = receiver
                    .as_ref()
                    .filter(|t| !t.activated)
                    .and_then(|t| self.table.lookup_method(t.class_name(), &attr.node));
                match method {
                    Some(m) => {
                        let recv = (!m.is_static).then(|| AccessKind::for_constness(m.is_const));
                        self.visit_with(base, recv);
                        self.visit_args(args, &m.params);
                    }
                    None => {
                        // Calls on a proxy retain their arguments without
                        // touching them. Unresolved methods are treated as
                        // mutating.
                        let recv = match &receiver {
                            Some(t) if !t.activated => Some(AccessKind::Write),
                            _ => None,
                        };
                        self.visit_with(base, recv);
                        self.visit_args(args, &[]);
                    }
                }
            }
            ExprKind::Name(id) if self.lookup(&id.node).is_none() => {
                let params = self.callable_params(&id.node);
                self.visit_args(args, params);
            }
            _ => {
                self.visit_with(callee, None);
                self.visit_args(args, &[]);
            }
        }
    }

    fn visit_args(&mut self, args: &mut [Expr], params: &[Param]) {
        for (i, arg) in args.iter_mut().enumerate() {
            let access = params
                .get(i)
                .filter(|p| self.table.is_lockable(&p.ty))
                .map(|p| AccessKind::for_constness(p.ty.is_const()));
            self.visit_with(arg, access);
        }
    }

    fn visit_subscript(
        &mut self,
        base: &mut Expr,
        index: &mut Expr,
        item: ItemAccess,
    ) -> Option<&'a MethodDef> {
        let method = self.method_on(base, item.method_name());
        let recv = match method {
            Some(m) if m.is_const => AccessKind::Read,
            Some(_) => item.mutating(true),
            None => item.mutating(false),
        };
        let index_access = method.and_then(|m| self.param_access(m, 0));
        self.visit_with(base, Some(recv));
        self.visit_with(index, index_access);
        method
    }

    /// Enforce `kind` on the object `expr` evaluates to.
    fn require(&mut self, expr: &mut Expr, kind: AccessKind) {
        let lock = kind.required_lock();
        let (name, held, ty) = match &expr.kind {
            ExprKind::Name(id) => {
                let Some(binding) = self.lookup(&id.node) else {
                    return;
                };
                let held = self.locks.satisfies(binding.id, lock);
                let ty = binding.ty.clone().or_else(|| expr.ty.clone());
                (id.node.clone(), held, ty)
            }
            ExprKind::Locked { .. } | ExprKind::Send { .. } | ExprKind::Activate(_) => return,
            _ => (UNNAMED_REFERENCE.to_string(), false, self.type_of(expr)),
        };
        if held {
            return;
        }
        let Some(ty) = ty else {
            return;
        };
        let Some(mode) = self.table.lock_mode_of(&ty) else {
            return;
        };
        if ty.is_locked() {
            self.insert_lock(expr, lock, name);
            return;
        }
        match mode {
            LockMode::NoLock => {}
            LockMode::CheckLock => self.report(LockDiagnostic::unlocked(&name, lock, expr.span)),
            LockMode::AutoLock => self.insert_lock(expr, lock, name),
        }
    }

    fn insert_lock(&mut self, expr: &mut Expr, kind: LockKind, binding: String) {
        trace!(binding = %binding, kind = kind.display(), "inserting scoped lock");
        coerce_to_locked(expr, kind);
        self.inserted.push(InsertedLock {
            binding,
            kind,
            span: expr.span,
        });
    }
}

/// Check `program` with a class table built from its own declarations.
pub fn check_program(program: Program, config: &CheckerConfig) -> Result<CheckedProgram, CheckFailed> {
    let table = ClassTable::new(&program, config.default_lock_mode);
    LockChecker::new(&table, config).check(program)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep_ast::{ClassDef, FnDef, MethodDef, Param, Stmt};

    fn counter(mode: LockMode) -> ClassDef {
        ClassDef::new("Counter", mode)
            .field("value", TypeRef::named("int"))
            .method(MethodDef::new("get", vec![], Some(TypeRef::named("int"))).constant())
            .method(MethodDef::new("bump", vec![], None))
    }

    fn run(mode: LockMode, body: Vec<Stmt>) -> Result<CheckedProgram, CheckFailed> {
        let program = Program {
            classes: vec![counter(mode)],
            functions: vec![FnDef::new("main", vec![], body)],
        };
        check_program(program, &CheckerConfig::default())
    }

    fn fresh_counter() -> Stmt {
        Stmt::let_(
            "c",
            TypeRef::named("Counter"),
            Some(Expr::name("Counter").call(vec![])),
        )
    }

    #[test]
    fn const_call_needs_only_a_read_lock() {
        let err = run(
            LockMode::CheckLock,
            vec![
                fresh_counter(),
                Stmt::expr(Expr::name("c").at(10, 1).attr("get").call(vec![])),
            ],
        )
        .unwrap_err();
        assert_eq!(err.diagnostics.len(), 1);
        assert_eq!(err.diagnostics[0].required, Some(LockKind::Read));

        let ok = run(
            LockMode::CheckLock,
            vec![
                fresh_counter(),
                Stmt::locked(
                    LockKind::Read,
                    Expr::name("c"),
                    vec![Stmt::expr(Expr::name("c").attr("get").call(vec![]))],
                ),
            ],
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn read_lock_does_not_permit_mutating_call() {
        let err = run(
            LockMode::CheckLock,
            vec![
                fresh_counter(),
                Stmt::locked(
                    LockKind::Read,
                    Expr::name("c"),
                    vec![Stmt::expr(Expr::name("c").attr("bump").call(vec![]))],
                ),
            ],
        )
        .unwrap_err();
        assert_eq!(err.diagnostics[0].required, Some(LockKind::Write));
    }

    #[test]
    fn autolock_wraps_receiver() {
        let checked = run(
            LockMode::AutoLock,
            vec![
                fresh_counter(),
                Stmt::expr(Expr::name("c").attr("bump").call(vec![])),
            ],
        )
        .unwrap();
        assert_eq!(checked.inserted.len(), 1);
        assert_eq!(checked.inserted[0].binding, "c");
        assert_eq!(checked.inserted[0].kind, LockKind::Write);
    }

    #[test]
    fn nolock_is_silent() {
        let checked = run(
            LockMode::NoLock,
            vec![
                fresh_counter(),
                Stmt::assign(Expr::name("c").attr("value"), Expr::int(1)),
            ],
        )
        .unwrap();
        assert!(checked.inserted.is_empty());
    }

    #[test]
    fn method_receiver_is_held() {
        let class = counter(LockMode::CheckLock).method(
            MethodDef::new("reset", vec![], None).with_body(vec![Stmt::assign(
                Expr::name("self").attr("value"),
                Expr::int(0),
            )]),
        );
        let program = Program {
            classes: vec![class],
            functions: vec![],
        };
        assert!(check_program(program, &CheckerConfig::default()).is_ok());
    }

    #[test]
    fn const_method_receiver_is_only_read_locked() {
        let class = counter(LockMode::CheckLock).method(
            MethodDef::new("peek", vec![], None)
                .constant()
                .with_body(vec![Stmt::assign(
                    Expr::name("self").attr("value"),
                    Expr::int(0),
                )]),
        );
        let program = Program {
            classes: vec![class],
            functions: vec![],
        };
        let err = check_program(program, &CheckerConfig::default()).unwrap_err();
        assert_eq!(err.diagnostics[0].binding, "self");
    }

    #[test]
    fn static_method_has_no_receiver_access() {
        let class = counter(LockMode::CheckLock)
            .method(MethodDef::new("make", vec![], None).static_());
        let program = Program {
            classes: vec![class],
            functions: vec![FnDef::new(
                "main",
                vec![],
                vec![
                    fresh_counter(),
                    Stmt::expr(Expr::name("c").attr("make").call(vec![])),
                ],
            )],
        };
        assert!(check_program(program, &CheckerConfig::default()).is_ok());
    }

    #[test]
    fn max_diagnostics_truncates() {
        let program = Program {
            classes: vec![counter(LockMode::CheckLock)],
            functions: vec![FnDef::new(
                "main",
                vec![Param::new("n", TypeRef::named("int"))],
                vec![
                    fresh_counter(),
                    Stmt::assign(Expr::name("c").at(1, 1).attr("value"), Expr::int(1)),
                    Stmt::assign(Expr::name("c").at(2, 1).attr("value"), Expr::int(2)),
                    Stmt::assign(Expr::name("c").at(3, 1).attr("value"), Expr::int(3)),
                ],
            )],
        };
        let config = CheckerConfig {
            max_diagnostics: 2,
            ..CheckerConfig::default()
        };
        let err = check_program(program, &config).unwrap_err();
        assert_eq!(err.diagnostics.len(), 2);
        assert_eq!(err.diagnostics[0].span.offset(), 1);
    }
}
