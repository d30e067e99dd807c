use std::collections::VecDeque;
use std::ops::AddAssign;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::trace;

use crate::message::{Activation, Message};

/// Counts from one or more drain cycles.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub activated: usize,
    pub abandoned: usize,
    pub deferred: usize,
}

impl DrainReport {
    pub fn is_empty(&self) -> bool {
        self.activated == 0 && self.abandoned == 0 && self.deferred == 0
    }

    /// Messages that left the queue.
    pub fn retired(&self) -> usize {
        self.activated + self.abandoned
    }
}

impl AddAssign for DrainReport {
    fn add_assign(&mut self, rhs: Self) {
        self.activated += rhs.activated;
        self.abandoned += rhs.abandoned;
        self.deferred += rhs.deferred;
    }
}

/// Pending messages for one or more objects.
pub trait MessageQueue: Send + Sync {
    fn push(&self, message: Box<dyn Message>);

    /// One drain cycle: try every message once. Activated and abandoned
    /// messages are dropped, deferred ones stay queued.
    fn activate(&self) -> DrainReport;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub type QueueHandle = Arc<dyn MessageQueue>;

/// FIFO queue. Messages deferred during a drain keep their place ahead of
/// messages pushed while the drain ran.
#[derive(Default)]
pub struct FifoQueue {
    messages: Mutex<VecDeque<Box<dyn Message>>>,
    len: AtomicUsize,
}

impl FifoQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle() -> QueueHandle {
        Arc::new(Self::new())
    }
}

impl MessageQueue for FifoQueue {
    fn push(&self, message: Box<dyn Message>) {
        let mut messages = self.messages.lock();
        messages.push_back(message);
        self.len.fetch_add(1, Ordering::AcqRel);
    }

    fn activate(&self) -> DrainReport {
        // Messages run without the queue lock held, so they may push.
        let batch = std::mem::take(&mut *self.messages.lock());
        let mut report = DrainReport::default();
        let mut kept = VecDeque::new();
        for mut message in batch {
            match message.activate() {
                Activation::Activated => report.activated += 1,
                Activation::Abandoned => report.abandoned += 1,
                Activation::Deferred => {
                    report.deferred += 1;
                    kept.push_back(message);
                }
            }
        }

        let mut messages = self.messages.lock();
        let pushed_meanwhile = std::mem::replace(&mut *messages, kept);
        messages.extend(pushed_meanwhile);
        self.len.fetch_sub(report.retired(), Ordering::AcqRel);
        drop(messages);

        if !report.is_empty() {
            trace!(
                activated = report.activated,
                abandoned = report.abandoned,
                deferred = report.deferred,
                "queue drained"
            );
        }
        report
    }

    fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }
}
