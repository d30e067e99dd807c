#![forbid(unsafe_code)]
#![allow(unused_assignments)]

use lockstep_ast::{LockKind, Span};
use miette::Diagnostic;
use thiserror::Error;

/// Name used in diagnostics when the accessed object is not a plain binding.
pub const UNNAMED_REFERENCE: &str = "this expression";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LockErrorKind {
    /// Read of a `checklock` object without a read or write lock held.
    UnlockedRead,
    /// Write or delete on a `checklock` object without a write lock held.
    UnlockedWrite,
    RebindLockedName,
    DeleteLockedName,
    /// Lock block over something that is not a plain name.
    LockUnnamedReference,
    /// Lock block over a value whose type is not a lockable class.
    LockNonLockableReference,
}

impl LockErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            LockErrorKind::UnlockedRead => "lockstep::unlocked_read",
            LockErrorKind::UnlockedWrite => "lockstep::unlocked_write",
            LockErrorKind::RebindLockedName => "lockstep::rebind_locked_name",
            LockErrorKind::DeleteLockedName => "lockstep::delete_locked_name",
            LockErrorKind::LockUnnamedReference => "lockstep::lock_unnamed_reference",
            LockErrorKind::LockNonLockableReference => "lockstep::lock_non_lockable_reference",
        }
    }
}

/// One lock-discipline violation at a specific access.
#[derive(Clone, Debug, Error)]
#[error("{message}")]
pub struct LockDiagnostic {
    pub kind: LockErrorKind,
    /// Offending binding, or [`UNNAMED_REFERENCE`].
    pub binding: String,
    /// Lock that would have made the access legal, when one applies.
    pub required: Option<LockKind>,
    pub message: String,
    pub span: Span,
}

impl Diagnostic for LockDiagnostic {
    fn code<'a>(&'a self) -> Option<Box<dyn std::fmt::Display + 'a>> {
        Some(Box::new(self.kind.code()))
    }

    fn labels(&self) -> Option<Box<dyn Iterator<Item = miette::LabeledSpan> + '_>> {
        let label = match self.required {
            Some(kind) => format!("needs a {} lock", kind.display()),
            None => "here".to_string(),
        };
        Some(Box::new(std::iter::once(miette::LabeledSpan::new_with_span(
            Some(label),
            self.span,
        ))))
    }

    fn help<'a>(&'a self) -> Option<Box<dyn std::fmt::Display + 'a>> {
        let help = match (self.kind, self.required) {
            (LockErrorKind::UnlockedRead | LockErrorKind::UnlockedWrite, Some(kind))
                if self.binding != UNNAMED_REFERENCE =>
            {
                format!("wrap the access in `with {} {}:`", kind.keyword(), self.binding)
            }
            (LockErrorKind::UnlockedRead | LockErrorKind::UnlockedWrite, _) => {
                "bind the object to a name and lock that name".to_string()
            }
            (LockErrorKind::RebindLockedName | LockErrorKind::DeleteLockedName, _) => {
                "leave the lock block before rebinding or deleting the name".to_string()
            }
            (LockErrorKind::LockUnnamedReference, _) => {
                "only plain names can be locked".to_string()
            }
            (LockErrorKind::LockNonLockableReference, _) => {
                "only instances of lockable classes carry a lock".to_string()
            }
        };
        Some(Box::new(help))
    }
}

impl LockDiagnostic {
    pub fn unlocked(binding: &str, required: LockKind, span: Span) -> Self {
        let kind = match required {
            LockKind::Read => LockErrorKind::UnlockedRead,
            LockKind::Write => LockErrorKind::UnlockedWrite,
        };
        Self {
            kind,
            binding: binding.to_string(),
            required: Some(required),
            message: format!(
                "reference '{}' is not correctly locked in this expression ({} lock required)",
                binding,
                required.display()
            ),
            span,
        }
    }

    pub fn rebind_locked(binding: &str, span: Span) -> Self {
        Self {
            kind: LockErrorKind::RebindLockedName,
            binding: binding.to_string(),
            required: None,
            message: format!("cannot rebind '{binding}' while it is locked"),
            span,
        }
    }

    pub fn delete_locked(binding: &str, span: Span) -> Self {
        Self {
            kind: LockErrorKind::DeleteLockedName,
            binding: binding.to_string(),
            required: None,
            message: format!("cannot delete '{binding}' while it is locked"),
            span,
        }
    }

    pub fn lock_unnamed(kind: LockKind, span: Span) -> Self {
        Self {
            kind: LockErrorKind::LockUnnamedReference,
            binding: UNNAMED_REFERENCE.to_string(),
            required: Some(kind),
            message: format!("cannot {}-lock an unnamed reference", kind.display()),
            span,
        }
    }

    pub fn lock_non_lockable(binding: &str, kind: LockKind, span: Span) -> Self {
        Self {
            kind: LockErrorKind::LockNonLockableReference,
            binding: binding.to_string(),
            required: Some(kind),
            message: format!(
                "cannot {}-lock '{}': its type is not a lockable class",
                kind.display(),
                binding
            ),
            span,
        }
    }
}

/// The pass found violations; nothing may be generated from this tree.
#[derive(Debug, Error, Diagnostic)]
#[error("lock discipline check failed with {} error(s)", diagnostics.len())]
#[diagnostic(code(lockstep::check))]
pub struct CheckFailed {
    #[related]
    pub diagnostics: Vec<LockDiagnostic>,
}

impl CheckFailed {
    pub fn count(&self, kind: LockErrorKind) -> usize {
        self.diagnostics.iter().filter(|d| d.kind == kind).count()
    }
}
