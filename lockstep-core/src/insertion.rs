//! Scoped lock insertion.
//!
//! An access that needs a lock it does not provably hold is rewritten into an
//! `ExprKind::Locked` node: a temporary holding a locked view of the object
//! that lives until the end of the enclosing statement. Backends bind each
//! such node to a scoped guard, so release happens on every exit path.

use lockstep_ast::{Expr, ExprKind, LockKind, Span, Stmt};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InsertedLock {
    pub binding: String,
    pub kind: LockKind,
    pub span: Span,
}

/// Wrap `expr` in a locked temporary. Wrapping an already-locked node only
/// strengthens its lock.
pub fn coerce_to_locked(expr: &mut Expr, kind: LockKind) {
    if let ExprKind::Locked { kind: existing, .. } = &mut expr.kind {
        if kind == LockKind::Write {
            *existing = LockKind::Write;
        }
        return;
    }
    let span = expr.span;
    let ty = expr.ty.clone();
    let inner = std::mem::replace(expr, Expr::new(span, ExprKind::NoneLit));
    *expr = Expr {
        span,
        ty,
        kind: ExprKind::Locked {
            kind,
            object: Box::new(inner),
        },
    };
}

/// Locked nodes under `expr`, innermost first so a temporary is always bound
/// before any temporary whose object mentions it.
pub fn collect_locked<'a>(expr: &'a Expr, out: &mut Vec<&'a Expr>) {
    match &expr.kind {
        ExprKind::Name(_)
        | ExprKind::IntLit(_)
        | ExprKind::BoolLit(_)
        | ExprKind::StringLit(_)
        | ExprKind::NoneLit => {}
        ExprKind::Attribute { base, .. } => collect_locked(base, out),
        ExprKind::Call { callee, args } => {
            collect_locked(callee, out);
            for a in args {
                collect_locked(a, out);
            }
        }
        ExprKind::Subscript { base, index } => {
            collect_locked(base, out);
            collect_locked(index, out);
        }
        ExprKind::Binary { left, right, .. } => {
            collect_locked(left, out);
            collect_locked(right, out);
        }
        ExprKind::Unary { expr: inner, .. } => collect_locked(inner, out),
        ExprKind::Activate(inner) => collect_locked(inner, out),
        ExprKind::Locked { object, .. } => {
            collect_locked(object, out);
            out.push(expr);
        }
        ExprKind::Send {
            target, sync, args, ..
        } => {
            collect_locked(target, out);
            if let Some(s) = sync {
                collect_locked(s, out);
            }
            for a in args {
                collect_locked(a, out);
            }
        }
    }
}

/// Expressions evaluated by the statement itself, excluding nested blocks.
pub fn statement_exprs(stmt: &Stmt) -> Vec<&Expr> {
    match stmt {
        Stmt::Let(s) => s.init.iter().collect(),
        Stmt::Assign(s) => vec![&s.value, &s.target],
        Stmt::Del(s) => vec![&s.target],
        Stmt::If(s) => vec![&s.cond],
        Stmt::While(s) => vec![&s.cond],
        Stmt::For(s) => vec![&s.iter],
        Stmt::With(s) => vec![&s.context],
        Stmt::Locked(s) => vec![&s.target],
        Stmt::Try(_) => Vec::new(),
        Stmt::Return(s) => s.value.iter().collect(),
        Stmt::Expr(e) => vec![e],
    }
}

pub fn statement_locks(stmt: &Stmt) -> Vec<&Expr> {
    let mut out = Vec::new();
    for e in statement_exprs(stmt) {
        collect_locked(e, &mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coercion_wraps_once_and_strengthens() {
        let mut e = Expr::name("q");
        coerce_to_locked(&mut e, LockKind::Read);
        coerce_to_locked(&mut e, LockKind::Write);
        match &e.kind {
            ExprKind::Locked { kind, object } => {
                assert_eq!(*kind, LockKind::Write);
                assert_eq!(object.as_name(), Some("q"));
            }
            other => panic!("expected locked node, got {other:?}"),
        }
    }

    #[test]
    fn collection_is_innermost_first() {
        let mut inner = Expr::name("a");
        coerce_to_locked(&mut inner, LockKind::Read);
        let mut outer = inner.attr("b");
        coerce_to_locked(&mut outer, LockKind::Write);
        let stmt = Stmt::expr(outer.attr("c"));
        let locks = statement_locks(&stmt);
        assert_eq!(locks.len(), 2);
        assert!(matches!(
            locks[0].kind,
            ExprKind::Locked {
                kind: LockKind::Read,
                ..
            }
        ));
        assert!(matches!(
            locks[1].kind,
            ExprKind::Locked {
                kind: LockKind::Write,
                ..
            }
        ));
    }
}
