#![forbid(unsafe_code)]

use std::collections::HashMap;

use lockstep_ast::LockKind;

/// Identity of one declared binding within a checked function body.
/// Shadowing declarations get distinct ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindingId(pub u32);

/// How many enclosing lock scopes currently hold a lock on a binding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LockState {
    pub read_depth: u32,
    pub write_depth: u32,
}

impl LockState {
    pub fn is_locked(&self) -> bool {
        self.read_depth > 0 || self.write_depth > 0
    }

    /// A read is covered by either lock; a write only by a write lock.
    pub fn satisfies(&self, kind: LockKind) -> bool {
        match kind {
            LockKind::Read => self.is_locked(),
            LockKind::Write => self.write_depth > 0,
        }
    }

    fn incremented(self, kind: LockKind) -> Self {
        match kind {
            LockKind::Read => LockState {
                read_depth: self.read_depth + 1,
                ..self
            },
            LockKind::Write => LockState {
                write_depth: self.write_depth + 1,
                ..self
            },
        }
    }
}

/// Handle for one entered lock scope. Must be passed back to
/// [`LockStateTracker::exit`] in LIFO order.
#[must_use = "a lock scope must be exited to restore the outer state"]
#[derive(Debug)]
pub struct LockScope {
    id: BindingId,
    prior: LockState,
}

/// Per-binding lock counters, owned by a single checker invocation.
#[derive(Clone, Debug, Default)]
pub struct LockStateTracker {
    states: HashMap<BindingId, LockState>,
}

impl LockStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, id: BindingId) -> LockState {
        self.states.get(&id).copied().unwrap_or_default()
    }

    pub fn is_locked(&self, id: BindingId) -> bool {
        self.state(id).is_locked()
    }

    pub fn satisfies(&self, id: BindingId, kind: LockKind) -> bool {
        self.state(id).satisfies(kind)
    }

    /// Enter a lock scope on `id`. Nesting only adds to the outer counters.
    pub fn enter(&mut self, id: BindingId, kind: LockKind) -> LockScope {
        let prior = self.state(id);
        self.states.insert(id, prior.incremented(kind));
        LockScope { id, prior }
    }

    /// Leave a scope, restoring exactly the counters seen on entry.
    pub fn exit(&mut self, scope: LockScope) {
        if scope.prior == LockState::default() {
            self.states.remove(&scope.id);
        } else {
            self.states.insert(scope.id, scope.prior);
        }
    }

    /// Mark a binding as locked for the rest of the body, e.g. a parameter
    /// whose lock the caller already holds.
    pub fn assume_held(&mut self, id: BindingId, kind: LockKind) {
        let state = self.state(id).incremented(kind);
        self.states.insert(id, state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn read_is_covered_by_write_lock() {
        let mut t = LockStateTracker::new();
        let id = BindingId(0);
        assert!(!t.satisfies(id, LockKind::Read));
        let s = t.enter(id, LockKind::Write);
        assert!(t.satisfies(id, LockKind::Read));
        assert!(t.satisfies(id, LockKind::Write));
        t.exit(s);
        assert!(!t.is_locked(id));
    }

    #[test]
    fn read_lock_does_not_cover_write() {
        let mut t = LockStateTracker::new();
        let id = BindingId(1);
        let s = t.enter(id, LockKind::Read);
        assert!(!t.satisfies(id, LockKind::Write));
        t.exit(s);
    }

    #[test]
    fn nesting_is_additive() {
        let mut t = LockStateTracker::new();
        let id = BindingId(2);
        let outer = t.enter(id, LockKind::Write);
        let inner = t.enter(id, LockKind::Read);
        assert_eq!(
            t.state(id),
            LockState {
                read_depth: 1,
                write_depth: 1
            }
        );
        t.exit(inner);
        assert_eq!(t.state(id).write_depth, 1);
        assert_eq!(t.state(id).read_depth, 0);
        t.exit(outer);
        assert_eq!(t.state(id), LockState::default());
    }

    #[test]
    fn assumed_locks_persist() {
        let mut t = LockStateTracker::new();
        t.assume_held(BindingId(3), LockKind::Read);
        assert!(t.satisfies(BindingId(3), LockKind::Read));
        assert!(!t.satisfies(BindingId(4), LockKind::Read));
    }

    fn lock_kind() -> impl Strategy<Value = LockKind> {
        prop_oneof![Just(LockKind::Read), Just(LockKind::Write)]
    }

    proptest! {
        #[test]
        fn enter_then_exit_restores_every_counter(
            ops in prop::collection::vec((0u32..4, lock_kind()), 0..32)
        ) {
            let mut t = LockStateTracker::new();
            let before: Vec<LockState> = (0..4).map(|i| t.state(BindingId(i))).collect();
            let mut scopes = Vec::new();
            let mut snapshots = Vec::new();
            for (id, kind) in &ops {
                snapshots.push((0..4).map(|i| t.state(BindingId(i))).collect::<Vec<_>>());
                scopes.push(t.enter(BindingId(*id), *kind));
            }
            while let Some(scope) = scopes.pop() {
                t.exit(scope);
                let expected = snapshots.pop().unwrap();
                let now: Vec<LockState> = (0..4).map(|i| t.state(BindingId(i))).collect();
                prop_assert_eq!(now, expected);
            }
            let after: Vec<LockState> = (0..4).map(|i| t.state(BindingId(i))).collect();
            prop_assert_eq!(after, before);
        }
    }
}
