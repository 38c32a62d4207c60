// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The process-wide singleton that owns every worker thread and implements
//! `minLoadSchedule`.

use std::sync::{Arc, OnceLock};

use crate::error::Closed;
use crate::worker::{Worker, WorkerId, WorkerStats};

static DISPATCHER: OnceLock<Dispatcher> = OnceLock::new();

/// Owns the fixed-size pool of [`Worker`] threads for the lifetime of the
/// process. There is exactly one `Dispatcher`; [`Dispatcher::init`] creates
/// it, [`Dispatcher::get`] is how every awaiter and `spawn` call reaches it.
pub struct Dispatcher {
    workers: Vec<Arc<Worker>>,
}

impl Dispatcher {
    /// Initializes the process-wide dispatcher with `num_workers` threads.
    ///
    /// # Errors
    ///
    /// Returns [`Closed`] if the dispatcher has already been initialized.
    ///
    /// # Panics
    ///
    /// Panics if a worker's reactor (and thus its OS-level poller) fails to
    /// initialize, or if spawning a worker's OS thread fails.
    pub fn init(num_workers: usize) -> Result<(), Closed> {
        assert!(num_workers > 0, "a dispatcher needs at least one worker");

        let workers = (0..num_workers)
            .map(|id| Worker::new(id).expect("failed to initialize worker reactor"))
            .collect::<Vec<_>>();
        for worker in &workers {
            worker.start();
        }

        let result = DISPATCHER
            .set(Dispatcher { workers })
            .map_err(|_| Closed(()));
        if result.is_ok() {
            tracing::info!(num_workers, "dispatcher initialized");
        }
        result
    }

    /// Returns the process-wide dispatcher.
    ///
    /// # Panics
    ///
    /// Panics if [`Dispatcher::init`] has not been called yet.
    #[must_use]
    pub fn get() -> &'static Dispatcher {
        DISPATCHER
            .get()
            .expect("Dispatcher::init must run before spawning tasks or awaiting I/O")
    }

    /// Selects a worker for `hint`, applying `minLoadSchedule` when `hint` is
    /// [`WorkerId::Any`]: the first worker with zero load wins outright;
    /// otherwise the lowest-id worker among those tied for minimum load.
    pub(crate) fn pick(&self, hint: WorkerId) -> Arc<Worker> {
        match hint {
            WorkerId::Id(id) => self
                .workers
                .get(id)
                .unwrap_or_else(|| panic!("no worker with id {id}"))
                .clone(),
            WorkerId::Any => {
                let mut best = &self.workers[0];
                let mut best_load = best.load();
                if best_load == 0 {
                    return best.clone();
                }
                for worker in &self.workers[1..] {
                    let load = worker.load();
                    if load == 0 {
                        return worker.clone();
                    }
                    if load < best_load {
                        best = worker;
                        best_load = load;
                    }
                }
                best.clone()
            }
        }
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// A point-in-time snapshot of every worker's scheduling counters,
    /// including what share of all scheduling across the process each
    /// worker accounts for.
    #[must_use]
    pub fn dump_stats(&self) -> Vec<DispatcherStats> {
        let snapshots: Vec<WorkerStats> = self.workers.iter().map(|w| w.stats()).collect();
        let global_scheduled: u64 = snapshots.iter().map(|s| s.total_scheduled).sum();

        let stats: Vec<DispatcherStats> = snapshots
            .into_iter()
            .map(|worker| {
                #[allow(
                    clippy::cast_precision_loss,
                    reason = "stats are a coarse diagnostic, not used for scheduling decisions"
                )]
                let percent_of_global_scheduled = if global_scheduled == 0 {
                    0.0
                } else {
                    (worker.total_scheduled as f64 / global_scheduled as f64) * 100.0
                };
                DispatcherStats {
                    worker,
                    percent_of_global_scheduled,
                }
            })
            .collect();

        for s in &stats {
            tracing::info!(
                worker = s.worker.id,
                inflight = s.worker.inflight,
                max_inflight = s.worker.max_inflight,
                total_scheduled = s.worker.total_scheduled,
                max_polled = s.worker.max_polled,
                percent_of_global_scheduled = s.percent_of_global_scheduled,
                "dump_stats"
            );
        }
        stats
    }

    /// Signals every worker to stop once its current tick finishes and
    /// blocks until all of their threads have joined.
    ///
    /// Only useful in tests and the demo binary's shutdown path: once torn
    /// down, the dispatcher cannot be re-initialized (it is a `OnceLock`).
    pub fn shutdown(&self) {
        tracing::info!(num_workers = self.workers.len(), "dispatcher shutting down");
        for worker in &self.workers {
            worker.abort();
        }
    }
}

/// One worker's stats plus its share of all tasks/awaiters scheduled
/// process-wide, as returned by [`Dispatcher::dump_stats`].
#[derive(Copy, Clone, Debug)]
pub struct DispatcherStats {
    pub worker: WorkerStats,
    pub percent_of_global_scheduled: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker_with_load(id: usize, load: usize) -> Arc<Worker> {
        let worker = Worker::new(id).expect("failed to create worker reactor for test");
        for _ in 0..load {
            worker.inflight_enter();
        }
        worker
    }

    #[test]
    fn picks_the_first_zero_load_worker_outright() {
        let dispatcher = Dispatcher {
            workers: vec![
                worker_with_load(0, 3),
                worker_with_load(1, 0),
                worker_with_load(2, 0),
            ],
        };
        assert_eq!(dispatcher.pick(WorkerId::Any).id(), 1);
    }

    #[test]
    fn breaks_ties_by_lowest_id_when_none_are_idle() {
        let dispatcher = Dispatcher {
            workers: vec![
                worker_with_load(0, 5),
                worker_with_load(1, 2),
                worker_with_load(2, 2),
            ],
        };
        assert_eq!(dispatcher.pick(WorkerId::Any).id(), 1);
    }

    #[test]
    fn honors_an_explicit_worker_id_hint() {
        let dispatcher = Dispatcher {
            workers: vec![worker_with_load(0, 0), worker_with_load(1, 0)],
        };
        assert_eq!(dispatcher.pick(WorkerId::Id(1)).id(), 1);
    }
}
