//! Reference-counted lockable objects.
//!
//! Every object owns its own read/write lock; there is no global lock.
//! Guards are owned (they keep the object alive), so a message can hold
//! them across the method it invokes.

use std::sync::Arc;

use lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};

pub type ReadGuard<T> = ArcRwLockReadGuard<RawRwLock, T>;
pub type WriteGuard<T> = ArcRwLockWriteGuard<RawRwLock, T>;

/// Shared or exclusive acquisition of an object's lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccessMode {
    Shared,
    Exclusive,
}

impl AccessMode {
    pub fn for_constness(is_const: bool) -> Self {
        if is_const {
            AccessMode::Shared
        } else {
            AccessMode::Exclusive
        }
    }
}

/// Identity of an object, stable for its lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjId(usize);

/// Atomic reference counting.
pub trait RefCounted: Sized {
    /// Hand out one more reference to the same object.
    fn retain(&self) -> Self;

    /// Give this reference up.
    fn release(self) {
        drop(self);
    }

    fn ref_count(&self) -> usize;
}

/// Blocking and non-blocking read/write locking of one object.
pub trait Lockable {
    type Target: ?Sized;

    fn read_lock(&self) -> ReadGuard<Self::Target>;
    fn write_lock(&self) -> WriteGuard<Self::Target>;
    fn try_read_lock(&self) -> Option<ReadGuard<Self::Target>>;
    fn try_write_lock(&self) -> Option<WriteGuard<Self::Target>>;
    fn id(&self) -> ObjId;
}

/// Reference to a shared, lockable object of type `T`.
pub struct ObjRef<T: ?Sized> {
    inner: Arc<RwLock<T>>,
}

impl<T> ObjRef<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(RwLock::new(value)),
        }
    }
}

impl<T: ?Sized> ObjRef<T> {
    /// Wrap an existing cell, e.g. one unsized to a trait object.
    pub fn from_arc(inner: Arc<RwLock<T>>) -> Self {
        Self { inner }
    }

    pub(crate) fn arc(&self) -> &Arc<RwLock<T>> {
        &self.inner
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: ?Sized> Clone for ObjRef<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: ?Sized> RefCounted for ObjRef<T> {
    fn retain(&self) -> Self {
        self.clone()
    }

    fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl<T: ?Sized> Lockable for ObjRef<T> {
    type Target = T;

    fn read_lock(&self) -> ReadGuard<T> {
        self.inner.read_arc()
    }

    fn write_lock(&self) -> WriteGuard<T> {
        self.inner.write_arc()
    }

    fn try_read_lock(&self) -> Option<ReadGuard<T>> {
        self.inner.try_read_arc()
    }

    fn try_write_lock(&self) -> Option<WriteGuard<T>> {
        self.inner.try_write_arc()
    }

    fn id(&self) -> ObjId {
        ObjId(Arc::as_ptr(&self.inner) as *const () as usize)
    }
}

impl<T: ?Sized + std::fmt::Debug> std::fmt::Debug for ObjRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner.try_read() {
            Some(value) => f.debug_tuple("ObjRef").field(&&*value).finish(),
            None => f.write_str("ObjRef(<locked>)"),
        }
    }
}
