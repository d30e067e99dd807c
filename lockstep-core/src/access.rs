use lockstep_ast::LockKind;

/// How a sub-expression's object is used by its parent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccessKind {
    Read,
    Write,
    Delete,
}

impl AccessKind {
    /// Lock that covers this access.
    pub fn required_lock(&self) -> LockKind {
        match self {
            AccessKind::Read => LockKind::Read,
            AccessKind::Write | AccessKind::Delete => LockKind::Write,
        }
    }

    /// Access implied by passing an object to a parameter (or receiver)
    /// of the given constness.
    pub fn for_constness(is_const: bool) -> Self {
        if is_const {
            AccessKind::Read
        } else {
            AccessKind::Write
        }
    }

    pub fn display(&self) -> &'static str {
        match self {
            AccessKind::Read => "read",
            AccessKind::Write => "write",
            AccessKind::Delete => "delete",
        }
    }
}

/// Access the expression currently being visited undergoes.
///
/// `None` means the value is only copied around (bound, returned, passed
/// to something that does not touch it), which needs no lock.
#[derive(Clone, Copy, Debug, Default)]
pub struct AccessContext {
    current: Option<AccessKind>,
}

impl AccessContext {
    pub fn current(&self) -> Option<AccessKind> {
        self.current
    }

    /// Switch to `kind` and hand back the previous state for [`restore`](Self::restore).
    pub fn enter(&mut self, kind: Option<AccessKind>) -> Option<AccessKind> {
        std::mem::replace(&mut self.current, kind)
    }

    pub fn restore(&mut self, prev: Option<AccessKind>) {
        self.current = prev;
    }
}
