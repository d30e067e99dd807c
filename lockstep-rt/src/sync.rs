use std::sync::Arc;

use parking_lot::RwLock;

use crate::object::ObjRef;

/// Synchronization object shared by the messages of one logical activity.
///
/// Queries run under the object's read lock, updates under its write lock.
pub trait SyncObject: Send + Sync {
    /// Whether pending messages may still run. `false` abandons them.
    fn is_activable(&self) -> bool;
    fn is_completed(&self) -> bool;
    /// A message was enqueued.
    fn insert_activity(&mut self);
    /// A message ran to completion.
    fn remove_activity(&mut self);
}

pub type SyncHandle = ObjRef<dyn SyncObject>;

pub fn sync_handle<S: SyncObject + 'static>(sync: S) -> SyncHandle {
    let inner: Arc<RwLock<dyn SyncObject>> = Arc::new(RwLock::new(sync));
    ObjRef::from_arc(inner)
}

impl<S: SyncObject + 'static> From<&ObjRef<S>> for SyncHandle {
    /// View a concrete sync object through the sync interface. Both handles
    /// share one object and one lock.
    fn from(obj: &ObjRef<S>) -> Self {
        let inner: Arc<RwLock<dyn SyncObject>> = obj.arc().clone();
        ObjRef::from_arc(inner)
    }
}

/// Counts in-flight messages and can be cancelled.
#[derive(Clone, Debug, Default)]
pub struct ActivityCounter {
    pending: usize,
    cancelled: bool,
}

impl ActivityCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abandon every message that has not started yet.
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn pending(&self) -> usize {
        self.pending
    }
}

impl SyncObject for ActivityCounter {
    fn is_activable(&self) -> bool {
        !self.cancelled
    }

    fn is_completed(&self) -> bool {
        self.pending == 0
    }

    fn insert_activity(&mut self) {
        self.pending += 1;
    }

    fn remove_activity(&mut self) {
        self.pending = self.pending.saturating_sub(1);
    }
}
