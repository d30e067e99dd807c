use std::sync::{Arc, OnceLock};

use tracing::debug;

use crate::message::{MessageArgs, MethodMessage};
use crate::object::{Lockable, ObjRef, ReadGuard, RefCounted, WriteGuard};
use crate::queue::{FifoQueue, QueueHandle};
use crate::result::{IntoResult, ResultFactory, ResultHandle, one_shot_factory};
use crate::sync::SyncHandle;

/// A lockable object that can hand out an activated proxy.
///
/// The proxy is created on first activation and shared afterwards: every
/// later `activate` returns another reference to the same proxy.
pub struct Activable<T> {
    object: ObjRef<T>,
    queue: QueueHandle,
    result_factory: ResultFactory,
    proxy: OnceLock<Arc<Activated<T>>>,
}

impl<T: Send + Sync + 'static> Activable<T> {
    pub fn new(value: T) -> Self {
        Self::from_object(ObjRef::new(value))
    }

    /// Wrap an existing object with a private FIFO queue and one-shot results.
    pub fn from_object(object: ObjRef<T>) -> Self {
        Self {
            object,
            queue: FifoQueue::handle(),
            result_factory: one_shot_factory(),
            proxy: OnceLock::new(),
        }
    }

    pub fn with_queue(mut self, queue: QueueHandle) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_result_factory(mut self, factory: ResultFactory) -> Self {
        self.result_factory = factory;
        self
    }

    pub fn object(&self) -> &ObjRef<T> {
        &self.object
    }

    /// The default queue messages go to.
    pub fn queue(&self) -> &QueueHandle {
        &self.queue
    }

    pub fn is_activated(&self) -> bool {
        self.proxy.get().is_some()
    }

    /// Get the proxy, creating it on first use. `queue` and `result_factory`
    /// only take effect for the call that creates it.
    pub fn activate(
        &self,
        sync: Option<SyncHandle>,
        queue: Option<QueueHandle>,
        result_factory: Option<ResultFactory>,
    ) -> Arc<Activated<T>> {
        let proxy = self.proxy.get_or_init(|| {
            debug!(object = ?self.object.id(), "creating activated proxy");
            Arc::new(Activated {
                object: self.object.retain(),
                queue: queue.unwrap_or_else(|| Arc::clone(&self.queue)),
                result_factory: result_factory.unwrap_or_else(|| Arc::clone(&self.result_factory)),
                sync,
            })
        });
        Arc::clone(proxy)
    }
}

/// Proxy that turns method calls into queued messages.
pub struct Activated<T> {
    object: ObjRef<T>,
    queue: QueueHandle,
    result_factory: ResultFactory,
    /// Used for sends that do not name their own sync handle.
    sync: Option<SyncHandle>,
}

impl<T: Send + Sync + 'static> Activated<T> {
    pub fn object(&self) -> &ObjRef<T> {
        &self.object
    }

    pub fn queue(&self) -> &QueueHandle {
        &self.queue
    }

    /// Queue a call to a mutating method. Returns the sink its result will
    /// be delivered to.
    pub fn send_mut<A, F, R>(&self, sync: Option<SyncHandle>, args: A, call: F) -> ResultHandle
    where
        A: MessageArgs,
        F: FnOnce(&mut WriteGuard<T>, &mut A::Locked) -> R + Send + 'static,
        R: IntoResult + 'static,
    {
        let sync = self.enter_sync(sync);
        let result = (self.result_factory)();
        let message = MethodMessage::writing(&self.object, sync, Some(result.clone()), args, call);
        self.queue.push(Box::new(message));
        result
    }

    /// Queue a call to a const method.
    pub fn send_const<A, F, R>(&self, sync: Option<SyncHandle>, args: A, call: F) -> ResultHandle
    where
        A: MessageArgs,
        F: FnOnce(&mut ReadGuard<T>, &mut A::Locked) -> R + Send + 'static,
        R: IntoResult + 'static,
    {
        let sync = self.enter_sync(sync);
        let result = (self.result_factory)();
        let message = MethodMessage::reading(&self.object, sync, Some(result.clone()), args, call);
        self.queue.push(Box::new(message));
        result
    }

    fn enter_sync(&self, sync: Option<SyncHandle>) -> Option<SyncHandle> {
        let sync = sync.or_else(|| self.sync.clone());
        if let Some(s) = &sync {
            s.write_lock().insert_activity();
        }
        sync
    }
}
