#![forbid(unsafe_code)]

//! Runtime for activable objects.
//!
//! Objects are reference counted and carry their own read/write lock.
//! Method calls on an activated proxy become messages in a queue; draining
//! the queue activates each message with non-blocking, all-or-nothing lock
//! acquisition, so two messages that need the same objects in opposite
//! orders can never deadlock.

mod activable;
mod error;
mod message;
mod object;
mod queue;
mod result;
mod scheduler;
mod sync;

pub use activable::{Activable, Activated};
pub use error::RuntimeError;
pub use message::{
    Activation, Message, MessageArgs, MethodMessage, Plain, ReadArg, ReadTarget, TargetAccess,
    WriteArg, WriteTarget,
};
pub use object::{AccessMode, Lockable, ObjId, ObjRef, ReadGuard, RefCounted, WriteGuard};
pub use queue::{DrainReport, FifoQueue, MessageQueue, QueueHandle};
pub use result::{
    AnyValue, IntoResult, OneShotResult, ResultFactory, ResultHandle, ResultSink, ResultValue,
    Value, one_shot_factory, one_shot_result, result_handle,
};
pub use scheduler::{RunReport, Scheduler};
pub use sync::{ActivityCounter, SyncHandle, SyncObject, sync_handle};
