#![forbid(unsafe_code)]

mod access;
mod checker;
mod config;
mod error;
mod insertion;
mod lock_state;
mod reify;
mod types;

pub use access::{AccessContext, AccessKind};
pub use checker::{CheckedProgram, LockChecker, check_program};
pub use config::CheckerConfig;
pub use error::{CheckFailed, LockDiagnostic, LockErrorKind, UNNAMED_REFERENCE};
pub use insertion::{InsertedLock, coerce_to_locked, collect_locked, statement_exprs, statement_locks};
pub use lock_state::{BindingId, LockScope, LockState, LockStateTracker};
pub use reify::{
    CapturedArg, MessagePlan, MessageReifier, ProgramPlan, ReturnCategory, WrapperKind,
    WrapperPlan, message_type_name, reify_program,
};
pub use types::{ClassInfo, ClassTable, FnSig};

/// A checked, rewritten program together with its message and wrapper plans.
#[derive(Clone, Debug)]
pub struct Lowered {
    pub checked: CheckedProgram,
    pub plan: ProgramPlan,
}

/// Run the lock-discipline pass, then reify proxy calls into messages.
pub fn lower(program: lockstep_ast::Program, config: &CheckerConfig) -> Result<Lowered, CheckFailed> {
    let table = ClassTable::new(&program, config.default_lock_mode);
    let mut checked = LockChecker::new(&table, config).check(program)?;
    let plan = reify_program(&mut checked.program, &table);
    Ok(Lowered { checked, plan })
}
