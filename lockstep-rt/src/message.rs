//! Reified method calls and the activation protocol.
//!
//! A message owns a reference to its target, a copy of every argument
//! (lockable arguments retained), an optional sync handle and an optional
//! result sink. Activating it never blocks on the objects it touches: every
//! lock is try-acquired, and the first failure releases whatever was taken
//! and defers the message.

use std::marker::PhantomData;

use tracing::{trace, warn};

use crate::object::{AccessMode, Lockable, ObjId, ObjRef, ReadGuard, RefCounted, WriteGuard};
use crate::result::{IntoResult, ResultHandle};
use crate::sync::SyncHandle;

/// Outcome of one activation attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Activation {
    /// The method ran and the result was delivered.
    Activated,
    /// A lock was busy. The message is untouched and may be retried.
    Deferred,
    /// The message will never run and should be dropped.
    Abandoned,
}

pub trait Message: Send {
    fn activate(&mut self) -> Activation;
}

// ---- arguments --------------------------------------------------------------

/// Captured call arguments that can be locked all at once.
pub trait MessageArgs: Send + 'static {
    /// What the invoked method receives: guards for lockable arguments,
    /// copies for plain values.
    type Locked;

    /// Try-lock every lockable argument in declaration order. On failure the
    /// locks taken so far are released in reverse order and `None` returned.
    fn try_lock(&self) -> Option<Self::Locked>;

    /// Release what `try_lock` took, in reverse order.
    fn release(locked: Self::Locked);

    fn lock_set(&self, out: &mut Vec<(ObjId, AccessMode)>);
}

/// Argument passed to a const parameter: read-locked during activation.
#[derive(Clone, Debug)]
pub struct ReadArg<T>(pub ObjRef<T>);

/// Argument passed to a non-const parameter: write-locked during activation.
#[derive(Clone, Debug)]
pub struct WriteArg<T>(pub ObjRef<T>);

/// Argument that is not a lockable object.
#[derive(Clone, Debug)]
pub struct Plain<V>(pub V);

impl<T: Send + Sync + 'static> MessageArgs for ReadArg<T> {
    type Locked = ReadGuard<T>;

    fn try_lock(&self) -> Option<Self::Locked> {
        self.0.try_read_lock()
    }

    fn release(locked: Self::Locked) {
        drop(locked);
    }

    fn lock_set(&self, out: &mut Vec<(ObjId, AccessMode)>) {
        out.push((self.0.id(), AccessMode::Shared));
    }
}

impl<T: Send + Sync + 'static> MessageArgs for WriteArg<T> {
    type Locked = WriteGuard<T>;

    fn try_lock(&self) -> Option<Self::Locked> {
        self.0.try_write_lock()
    }

    fn release(locked: Self::Locked) {
        drop(locked);
    }

    fn lock_set(&self, out: &mut Vec<(ObjId, AccessMode)>) {
        out.push((self.0.id(), AccessMode::Exclusive));
    }
}

impl<V: Clone + Send + 'static> MessageArgs for Plain<V> {
    type Locked = V;

    fn try_lock(&self) -> Option<V> {
        Some(self.0.clone())
    }

    fn release(_locked: V) {}

    fn lock_set(&self, _out: &mut Vec<(ObjId, AccessMode)>) {}
}

/// Optional-argument record: absent arguments lock nothing.
impl<A: MessageArgs> MessageArgs for Option<A> {
    type Locked = Option<A::Locked>;

    fn try_lock(&self) -> Option<Self::Locked> {
        match self {
            Some(a) => a.try_lock().map(Some),
            None => Some(None),
        }
    }

    fn release(locked: Self::Locked) {
        if let Some(l) = locked {
            A::release(l);
        }
    }

    fn lock_set(&self, out: &mut Vec<(ObjId, AccessMode)>) {
        if let Some(a) = self {
            a.lock_set(out);
        }
    }
}

impl MessageArgs for () {
    type Locked = ();

    fn try_lock(&self) -> Option<()> {
        Some(())
    }

    fn release(_locked: ()) {}

    fn lock_set(&self, _out: &mut Vec<(ObjId, AccessMode)>) {}
}

macro_rules! release_in_reverse {
    () => {};
    ($first:ident $($rest:ident)*) => {
        release_in_reverse!($($rest)*);
        $first::release($first);
    };
}

// Guards bound earlier in the body drop in reverse order when a later
// `?` returns early.
macro_rules! tuple_args {
    ($($name:ident : $idx:tt),+) => {
        impl<$($name: MessageArgs),+> MessageArgs for ($($name,)+) {
            type Locked = ($($name::Locked,)+);

            #[allow(non_snake_case)]
            fn try_lock(&self) -> Option<Self::Locked> {
                $(let $name = self.$idx.try_lock()?;)+
                Some(($($name,)+))
            }

            #[allow(non_snake_case)]
            fn release(locked: Self::Locked) {
                let ($($name,)+) = locked;
                release_in_reverse!($($name)+);
            }

            fn lock_set(&self, out: &mut Vec<(ObjId, AccessMode)>) {
                $(self.$idx.lock_set(out);)+
            }
        }
    };
}

tuple_args!(A: 0);
tuple_args!(A: 0, B: 1);
tuple_args!(A: 0, B: 1, C: 2);
tuple_args!(A: 0, B: 1, C: 2, D: 3);
tuple_args!(A: 0, B: 1, C: 2, D: 3, E: 4);
tuple_args!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);

// ---- target access ----------------------------------------------------------

/// How the target object is locked: by method constness.
pub trait TargetAccess<T>: Send + 'static {
    type Guard;
    const MODE: AccessMode;

    fn try_acquire(target: &ObjRef<T>) -> Option<Self::Guard>;
}

/// Const method: the target is read-locked.
#[derive(Debug)]
pub struct ReadTarget;

/// Mutating method: the target is write-locked.
#[derive(Debug)]
pub struct WriteTarget;

impl<T: Send + Sync + 'static> TargetAccess<T> for ReadTarget {
    type Guard = ReadGuard<T>;
    const MODE: AccessMode = AccessMode::Shared;

    fn try_acquire(target: &ObjRef<T>) -> Option<ReadGuard<T>> {
        target.try_read_lock()
    }
}

impl<T: Send + Sync + 'static> TargetAccess<T> for WriteTarget {
    type Guard = WriteGuard<T>;
    const MODE: AccessMode = AccessMode::Exclusive;

    fn try_acquire(target: &ObjRef<T>) -> Option<WriteGuard<T>> {
        target.try_write_lock()
    }
}

// ---- messages ---------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MessageState {
    Pending,
    Activated,
    Abandoned,
}

/// One reified method call on a `T`.
pub struct MethodMessage<T, M, A, F, R> {
    target: ObjRef<T>,
    sync: Option<SyncHandle>,
    result: Option<ResultHandle>,
    args: A,
    call: Option<F>,
    state: MessageState,
    /// The same object is needed twice and at least once exclusively.
    self_conflict: bool,
    _marker: PhantomData<fn() -> (M, R)>,
}

impl<T, A, F, R> MethodMessage<T, WriteTarget, A, F, R>
where
    T: Send + Sync + 'static,
    A: MessageArgs,
    F: FnOnce(&mut WriteGuard<T>, &mut A::Locked) -> R + Send + 'static,
    R: IntoResult,
{
    /// Message for a mutating method.
    pub fn writing(
        target: &ObjRef<T>,
        sync: Option<SyncHandle>,
        result: Option<ResultHandle>,
        args: A,
        call: F,
    ) -> Self {
        Self::build(target, sync, result, args, call)
    }
}

impl<T, A, F, R> MethodMessage<T, ReadTarget, A, F, R>
where
    T: Send + Sync + 'static,
    A: MessageArgs,
    F: FnOnce(&mut ReadGuard<T>, &mut A::Locked) -> R + Send + 'static,
    R: IntoResult,
{
    /// Message for a const method.
    pub fn reading(
        target: &ObjRef<T>,
        sync: Option<SyncHandle>,
        result: Option<ResultHandle>,
        args: A,
        call: F,
    ) -> Self {
        Self::build(target, sync, result, args, call)
    }
}

impl<T, M, A, F, R> MethodMessage<T, M, A, F, R>
where
    T: Send + Sync + 'static,
    M: TargetAccess<T>,
    A: MessageArgs,
    F: FnOnce(&mut M::Guard, &mut A::Locked) -> R + Send + 'static,
    R: IntoResult,
{
    fn build(
        target: &ObjRef<T>,
        sync: Option<SyncHandle>,
        result: Option<ResultHandle>,
        args: A,
        call: F,
    ) -> Self {
        let mut locks = vec![(target.id(), M::MODE)];
        args.lock_set(&mut locks);
        let self_conflict = conflicting(&locks);
        if self_conflict {
            warn!(
                object = ?target.id(),
                "message needs the same object twice with an exclusive lock and can never run"
            );
        }
        Self {
            target: target.retain(),
            sync,
            result,
            args,
            call: Some(call),
            state: MessageState::Pending,
            self_conflict,
            _marker: PhantomData,
        }
    }

    pub fn target(&self) -> &ObjRef<T> {
        &self.target
    }

    pub fn result(&self) -> Option<&ResultHandle> {
        self.result.as_ref()
    }

    pub fn is_activated(&self) -> bool {
        self.state == MessageState::Activated
    }

    /// Admission check against the sync handle, without blocking.
    fn admission(&self) -> Option<Activation> {
        let sync = self.sync.as_ref()?;
        let Some(guard) = sync.try_read_lock() else {
            trace!(object = ?self.target.id(), "sync busy, deferring");
            return Some(Activation::Deferred);
        };
        if guard.is_activable() {
            None
        } else {
            trace!(object = ?self.target.id(), "sync no longer activable, abandoning");
            Some(Activation::Abandoned)
        }
    }
}

impl<T, M, A, F, R> MethodMessage<T, M, A, F, R> {
    /// A message that will never run no longer counts as activity on its
    /// sync object.
    fn abandon(&mut self) -> Activation {
        if let Some(sync) = &self.sync {
            sync.write_lock().remove_activity();
        }
        self.call = None;
        self.state = MessageState::Abandoned;
        Activation::Abandoned
    }
}

fn conflicting(locks: &[(ObjId, AccessMode)]) -> bool {
    locks.iter().enumerate().any(|(i, (id, mode))| {
        locks[i + 1..].iter().any(|(other, other_mode)| {
            other == id
                && (*mode == AccessMode::Exclusive || *other_mode == AccessMode::Exclusive)
        })
    })
}

impl<T, M, A, F, R> Message for MethodMessage<T, M, A, F, R>
where
    T: Send + Sync + 'static,
    M: TargetAccess<T>,
    A: MessageArgs,
    F: FnOnce(&mut M::Guard, &mut A::Locked) -> R + Send + 'static,
    R: IntoResult,
{
    fn activate(&mut self) -> Activation {
        match self.state {
            MessageState::Activated => return Activation::Activated,
            MessageState::Abandoned => return Activation::Abandoned,
            MessageState::Pending => {}
        }
        if self.self_conflict {
            return self.abandon();
        }
        match self.admission() {
            Some(Activation::Abandoned) => return self.abandon(),
            Some(outcome) => return outcome,
            None => {}
        }

        let Some(mut target) = M::try_acquire(&self.target) else {
            trace!(object = ?self.target.id(), "target busy, deferring");
            return Activation::Deferred;
        };
        let Some(mut locked) = self.args.try_lock() else {
            drop(target);
            trace!(object = ?self.target.id(), "argument busy, deferring");
            return Activation::Deferred;
        };
        let Some(call) = self.call.take() else {
            return self.abandon();
        };

        let ret = call(&mut target, &mut locked);
        A::release(locked);
        drop(target);

        if let (Some(result), Some(value)) = (&self.result, ret.into_result()) {
            result.write_lock().push(value);
        }
        if let Some(sync) = &self.sync {
            sync.write_lock().remove_activity();
        }
        self.state = MessageState::Activated;
        Activation::Activated
    }
}
