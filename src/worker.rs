// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The per-thread scheduling unit: a reactor loop, a timer list, and a
//! handoff queue, all owned by a single OS thread.

use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use mio::event::Source;
use mio::Waker;

use crate::io::IoWaitShared;
use crate::reactor::{Direction, Event, Poller};
use crate::task::TaskNode;
use crate::time::{TimeSource, NEVER};

/// Identifies an entry in a [`Worker`]'s [`TimerList`]. Unique for the
/// lifetime of the worker: the second field disambiguates timers that share
/// a millisecond-resolution deadline.
pub type TimerKey = (i64, u64);

/// The awaiter a timer entry wakes once its deadline elapses.
pub(crate) enum TimerTarget {
    Io(Arc<IoWaitShared>),
    Sleep(Arc<crate::time::SleepShared>),
    /// A target with no awaiter behind it, for exercising `TimerList`'s
    /// ordering in isolation without fabricating a real `IoWaitShared`.
    #[cfg(test)]
    Noop,
}

impl TimerTarget {
    fn expire(&self) {
        match self {
            TimerTarget::Io(shared) => shared.expire(),
            TimerTarget::Sleep(shared) => shared.fire(),
            #[cfg(test)]
            TimerTarget::Noop => {}
        }
    }
}

/// A deadline-ordered list of pending timers.
///
/// The source this is ported from keeps an intrusive, doubly-linked list
/// sorted by deadline so expiry and cancellation are both O(1). We keep a
/// `BTreeMap` keyed by `(deadline, sequence)` instead: insert and erase are
/// O(log n), which is a deliberate simplification given the absence of an
/// intrusive-list crate in this workspace whose API could be verified
/// against this use case. Every operation named for the `TimerList`
/// contract (`insert`, `erase`, `peek_deadline`, `expire`) is still present.
#[derive(Default)]
struct TimerList {
    entries: BTreeMap<TimerKey, TimerTarget>,
    seq: u64,
}

impl TimerList {
    fn insert(&mut self, deadline: i64, target: TimerTarget) -> TimerKey {
        let seq = self.seq;
        self.seq += 1;
        let key = (deadline, seq);
        self.entries.insert(key, target);
        key
    }

    fn erase(&mut self, key: TimerKey) {
        self.entries.remove(&key);
    }

    fn peek_deadline(&self) -> Option<i64> {
        self.entries.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Removes and fires every timer whose deadline is `<= now`.
    fn expire(&mut self, now: i64) {
        loop {
            let Some((&key, _)) = self.entries.range(..=(now, u64::MAX)).next() else {
                break;
            };
            let target = self.entries.remove(&key).expect("just peeked this key");
            target.expire();
        }
    }
}

#[cfg(test)]
mod timer_list_tests {
    use super::*;

    #[test]
    fn orders_by_deadline_not_insertion() {
        let mut list = TimerList::default();
        let late = list.insert(300, TimerTarget::Noop);
        let early = list.insert(100, TimerTarget::Noop);
        let mid = list.insert(200, TimerTarget::Noop);
        assert_eq!(list.peek_deadline(), Some(100));

        list.erase(early);
        assert_eq!(list.peek_deadline(), Some(200));

        list.erase(mid);
        list.erase(late);
        assert_eq!(list.peek_deadline(), None);
    }

    #[test]
    fn ties_broken_by_insertion_order() {
        let mut list = TimerList::default();
        let first = list.insert(100, TimerTarget::Noop);
        let second = list.insert(100, TimerTarget::Noop);
        assert_eq!(first.1, 0);
        assert_eq!(second.1, 1);
        assert_eq!(list.peek_deadline(), Some(100));

        list.erase(first);
        assert_eq!(list.peek_deadline(), Some(100));
        list.erase(second);
        assert_eq!(list.peek_deadline(), None);
    }

    #[test]
    fn expire_only_fires_entries_at_or_before_now() {
        let mut list = TimerList::default();
        list.insert(50, TimerTarget::Noop);
        list.insert(100, TimerTarget::Noop);
        list.insert(150, TimerTarget::Noop);

        list.expire(100);
        assert_eq!(list.peek_deadline(), Some(150));

        list.expire(150);
        assert_eq!(list.peek_deadline(), None);
    }

    #[test]
    fn erase_is_a_no_op_for_an_unknown_key() {
        let mut list = TimerList::default();
        list.erase((0, 0));
        assert_eq!(list.peek_deadline(), None);
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
enum State {
    Created = 0,
    Starting = 1,
    Active = 2,
    Stopping = 3,
    Joined = 4,
}

/// A `WorkerId` names either a specific worker thread or "whichever the
/// dispatcher's load-balancing policy picks". Resolves the naming
/// inconsistency between "affinity hint" and "thread id" in the source this
/// is ported from: both concepts are the same `WorkerId`, just with `Any`
/// left unresolved until [`crate::dispatcher::Dispatcher::pick`] runs.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum WorkerId {
    #[default]
    Any,
    Id(usize),
}

/// One scheduler thread: owns a [`Poller`], a [`TimerList`], and the
/// lock-free handoff queue other threads push runnable tasks and wake
/// callbacks through.
pub struct Worker {
    id: usize,
    clock: TimeSource,
    tasks: mpsc_queue::MpscQueue<TaskNode>,
    poller: Mutex<Poller>,
    waker: Arc<Waker>,
    timers: Mutex<TimerList>,
    signaling: AtomicBool,
    state: AtomicU8,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
    inflight: AtomicUsize,
    max_inflight: AtomicUsize,
    total_scheduled: AtomicU64,
    total_polled: AtomicU64,
    max_batch: AtomicUsize,
}

/// Batch size passed to the underlying [`mio::Events`] buffer.
const EVENTS_CAPACITY: usize = 1024;

/// Upper bound on how long the reactor blocks with no pending timers, so a
/// worker that's otherwise fully idle still wakes up periodically to notice
/// process-wide shutdown.
const IDLE_POLL: Duration = Duration::from_secs(1);

impl Worker {
    pub(crate) fn new(id: usize) -> io::Result<Arc<Self>> {
        let poller = Poller::new(EVENTS_CAPACITY)?;
        let waker = poller.waker();
        Ok(Arc::new(Self {
            id,
            clock: TimeSource::new(),
            tasks: mpsc_queue::MpscQueue::new(),
            poller: Mutex::new(poller),
            waker,
            timers: Mutex::new(TimerList::default()),
            signaling: AtomicBool::new(false),
            state: AtomicU8::new(State::Created as u8),
            thread: Mutex::new(None),
            inflight: AtomicUsize::new(0),
            max_inflight: AtomicUsize::new(0),
            total_scheduled: AtomicU64::new(0),
            total_polled: AtomicU64::new(0),
            max_batch: AtomicUsize::new(0),
        }))
    }

    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    #[must_use]
    pub fn clock(&self) -> TimeSource {
        self.clock
    }

    /// This worker's current load, used by [`crate::dispatcher::Dispatcher`]'s
    /// `minLoadSchedule` tie-break. Approximated as the number of tasks
    /// currently scheduled or polling.
    #[must_use]
    pub fn load(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    /// Starts the worker's OS thread. Idempotent: calling this on an
    /// already-started worker is a no-op.
    ///
    /// # Panics
    ///
    /// Panics if spawning the OS thread fails.
    pub(crate) fn start(self: &Arc<Self>) {
        if self
            .state
            .compare_exchange(
                State::Created as u8,
                State::Starting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }

        let this = self.clone();
        let handle = thread::Builder::new()
            .name(format!("iorun-worker-{}", self.id))
            .spawn(move || this.run())
            .expect("failed to spawn worker thread");
        *self.thread.lock().unwrap() = Some(handle);
    }

    /// Signals the worker to stop after its current tick and blocks until
    /// its thread has joined.
    pub(crate) fn abort(&self) {
        self.state.store(State::Stopping as u8, Ordering::Release);
        self.wake_reactor();
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.state.store(State::Joined as u8, Ordering::Release);
    }

    fn run(self: Arc<Self>) {
        self.state.store(State::Active as u8, Ordering::Release);
        let span = tracing::debug_span!("worker", id = self.id);
        let _enter = span.enter();
        tracing::debug!("worker started");

        loop {
            let timeout = self.next_timeout();

            let events = match self.poller.lock().unwrap().wait(timeout) {
                Ok(events) => events,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    tracing::error!(%err, "poller wait failed");
                    continue;
                }
            };
            self.max_batch.fetch_max(events.len(), Ordering::Relaxed);

            if self.state.load(Ordering::Acquire) == State::Stopping as u8 {
                tracing::debug!("stop requested, shutting down");
                break;
            }

            self.signaling.store(false, Ordering::Release);
            self.drain_handoff();

            for event in events {
                match event {
                    Event::Wake => {}
                    Event::Io { cookie, flags } => cookie.fire(flags),
                }
            }

            self.timers.lock().unwrap().expire(self.clock.now_ms());
        }

        tracing::debug!("worker stopped");
    }

    fn next_timeout(&self) -> Option<Duration> {
        let deadline = self.timers.lock().unwrap().peek_deadline();
        match deadline {
            Some(NEVER) | None => Some(IDLE_POLL),
            Some(deadline) => {
                let now = self.clock.now_ms();
                let remaining = (deadline - now).max(0);
                #[allow(
                    clippy::cast_sign_loss,
                    reason = "remaining is clamped to >= 0 above"
                )]
                Some(Duration::from_millis(remaining as u64).min(IDLE_POLL))
            }
        }
    }

    fn drain_handoff(self: &Arc<Self>) {
        // The worker's own thread is the queue's only consumer, so a plain
        // `dequeue` (which waits out transient inconsistent states via
        // backoff, but never blocks on a concurrent consumer) is enough.
        while let Some(task) = self.tasks.dequeue() {
            self.total_polled.fetch_add(1, Ordering::Relaxed);
            TaskNode::run(task);
            self.inflight_leave();
        }
    }

    /// Pushes `task` onto this worker's handoff queue and wakes its reactor
    /// if it's currently blocked in [`Poller::wait`].
    pub(crate) fn schedule(self: &Arc<Self>, task: Arc<TaskNode>) {
        self.inflight_enter();
        self.total_scheduled.fetch_add(1, Ordering::Relaxed);
        self.tasks.enqueue(task);
        self.wake_reactor();
    }

    /// Accounts for a handoff, IoWait, or Sleep entering this worker's
    /// `inflight` count. Call exactly once per entry into SCHEDULED.
    pub(crate) fn inflight_enter(&self) {
        let prev = self.inflight.fetch_add(1, Ordering::AcqRel);
        self.max_inflight.fetch_max(prev + 1, Ordering::Relaxed);
    }

    /// Reverses [`Worker::inflight_enter`] on a terminal transition out of
    /// SCHEDULED (fired, expired, or abandoned).
    pub(crate) fn inflight_leave(&self) {
        self.inflight.fetch_sub(1, Ordering::AcqRel);
    }

    /// Coalesced cross-thread wake: only the first waiter after a reactor
    /// goes back to sleep needs to actually hit the wake descriptor.
    fn wake_reactor(&self) {
        if !self.signaling.swap(true, Ordering::AcqRel) {
            if let Err(err) = self.waker.wake() {
                tracing::warn!(%err, "failed to wake worker reactor");
            }
        }
    }

    /// Installs (or upgrades) interest in `dir`-readiness for `source`,
    /// tagged with `cookie`.
    pub(crate) fn register_io<S: Source + std::os::fd::AsRawFd>(
        &self,
        source: &mut S,
        dir: Direction,
        cookie: Arc<IoWaitShared>,
    ) -> io::Result<usize> {
        let key = self.poller.lock().unwrap().register(source, dir, cookie)?;
        tracing::debug!(worker = self.id, key, ?dir, "registered io wait");
        Ok(key)
    }

    /// Drops the poller bookkeeping for a registration. See
    /// [`Poller::forget`] for why this doesn't need the original socket.
    pub(crate) fn unregister_io(&self, key: usize) {
        tracing::debug!(worker = self.id, key, "unregistered io wait");
        self.poller.lock().unwrap().forget(key);
    }

    pub(crate) fn insert_timer(&self, deadline: i64, target: TimerTarget) -> TimerKey {
        let key = self.timers.lock().unwrap().insert(deadline, target);
        tracing::debug!(worker = self.id, deadline, "registered timer");
        // A newly-inserted deadline may be sooner than whatever `wait` is
        // currently blocked on; nudge the reactor so it recomputes its timeout.
        self.wake_reactor();
        key
    }

    pub(crate) fn cancel_timer(&self, key: TimerKey) {
        tracing::debug!(worker = self.id, "cancelled timer");
        self.timers.lock().unwrap().erase(key);
    }

    /// A snapshot of this worker's lifetime scheduling counters, for
    /// [`crate::dispatcher::Dispatcher::dump_stats`].
    #[must_use]
    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            id: self.id,
            inflight: self.inflight.load(Ordering::Relaxed),
            max_inflight: self.max_inflight.load(Ordering::Relaxed),
            total_scheduled: self.total_scheduled.load(Ordering::Relaxed),
            total_polled: self.total_polled.load(Ordering::Relaxed),
            max_polled: self.max_batch.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time counters for one worker, returned by [`Worker::stats`].
#[derive(Copy, Clone, Debug)]
pub struct WorkerStats {
    pub id: usize,
    pub inflight: usize,
    pub max_inflight: usize,
    pub total_scheduled: u64,
    pub total_polled: u64,
    /// Largest readiness-event batch [`Poller::wait`] has returned in one
    /// reactor loop iteration.
    pub max_polled: usize,
}
