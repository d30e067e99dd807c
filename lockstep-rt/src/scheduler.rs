use rayon::prelude::*;
use tracing::debug;

use crate::queue::{DrainReport, QueueHandle};

/// Drives a set of queues. Deferred messages are retried once per cycle.
#[derive(Default)]
pub struct Scheduler {
    queues: Vec<QueueHandle>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunReport {
    pub cycles: usize,
    pub totals: DrainReport,
    /// Every queue was empty when the run stopped.
    pub idle: bool,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_queue(&mut self, queue: QueueHandle) {
        self.queues.push(queue);
    }

    pub fn pending(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }

    /// Drain every queue once, queues in parallel.
    pub fn drain_once(&self) -> DrainReport {
        self.queues
            .par_iter()
            .map(|q| q.activate())
            .reduce(DrainReport::default, |mut a, b| {
                a += b;
                a
            })
    }

    /// Drain until every queue is empty or `max_cycles` cycles have run.
    pub fn run_until_idle(&self, max_cycles: usize) -> RunReport {
        let mut run = RunReport::default();
        while run.cycles < max_cycles {
            if self.pending() == 0 {
                break;
            }
            let report = self.drain_once();
            run.cycles += 1;
            run.totals += report;
            if report.retired() == 0 {
                std::thread::yield_now();
            }
        }
        run.idle = self.pending() == 0;
        debug!(
            cycles = run.cycles,
            activated = run.totals.activated,
            abandoned = run.totals.abandoned,
            deferred = run.totals.deferred,
            idle = run.idle,
            "scheduler run finished"
        );
        run
    }
}
