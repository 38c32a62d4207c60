// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The scheduler's monotonic clock and the [`Sleep`] awaiter built on top of it.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::Instant;

use crate::error::AwaitError;
use crate::worker::{TimerKey, TimerTarget, Worker};
use crate::WorkerId;

/// Sentinel deadline meaning "never expires".
pub const NEVER: i64 = i64::MAX;

const CREATED: u8 = 0;
const SCHEDULED: u8 = 1;
const FIRED: u8 = 2;
const ABANDONED: u8 = 3;

/// A monotonic millisecond clock.
///
/// All timer and I/O deadlines in this crate are absolute millisecond values
/// relative to an arbitrary epoch fixed the first time a `TimeSource` is created;
/// no wall-clock time is ever consulted.
#[derive(Copy, Clone, Debug)]
pub struct TimeSource {
    epoch: Instant,
}

impl TimeSource {
    /// Creates a new clock whose epoch is "now".
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Returns the current time in milliseconds since this clock's epoch.
    #[must_use]
    pub fn now_ms(&self) -> i64 {
        // Truncation only matters after ~292 million years of uptime.
        #[allow(clippy::cast_possible_wrap, reason = "bounded by process lifetime")]
        let ms = self.epoch.elapsed().as_millis() as i64;
        ms
    }

    /// Returns an absolute deadline `timeout_ms` milliseconds from now, or
    /// [`NEVER`] if `timeout_ms` is `None`.
    #[must_use]
    pub fn deadline(&self, timeout_ms: Option<i64>) -> i64 {
        match timeout_ms {
            Some(ms) => self.now_ms().saturating_add(ms),
            None => NEVER,
        }
    }
}

impl Default for TimeSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared state for a pending [`Sleep`], registered with exactly one [`Worker`]'s
/// timer list while `SCHEDULED`.
pub(crate) struct SleepShared {
    state: AtomicU8,
    waker: Mutex<Option<Waker>>,
    deadline: i64,
    worker: Arc<Worker>,
    timer_key: Mutex<Option<TimerKey>>,
}

impl SleepShared {
    /// Fires the sleep, waking its continuation. Called by the owning worker's
    /// reactor loop when the timer expires.
    pub(crate) fn fire(self: &Arc<Self>) {
        if self
            .state
            .compare_exchange(SCHEDULED, FIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::trace!("sleep fired");
            self.worker.inflight_leave();
            self.wake();
        }
    }

    /// Cancels the sleep. Called from any thread; idempotent.
    pub(crate) fn abandon(self: &Arc<Self>) {
        if self
            .state
            .compare_exchange(SCHEDULED, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::debug!("sleep abandoned");
            self.worker.inflight_leave();
            if let Some(key) = self.timer_key.lock().unwrap().take() {
                self.worker.cancel_timer(key);
            }
            self.wake();
        }
    }

    fn wake(&self) {
        if let Some(waker) = self.waker.lock().unwrap().take() {
            waker.wake();
        }
    }
}

/// A future that completes once a deadline elapses, or is cancelled.
///
/// Created by [`crate::spawn_sleep`] / [`Worker::sleep`]. Mirrors the source's
/// `Delay`/`Timer` awaiter: `CREATED` until first polled, `SCHEDULED` while
/// registered with a worker's timer list, and terminal (`FIRED`/`ABANDONED`)
/// exactly once.
pub struct Sleep {
    shared: Option<Arc<SleepShared>>,
    duration_ms: i64,
    hint: WorkerId,
}

/// Suspends the calling task for `duration_ms` milliseconds, scheduled on
/// the worker [`crate::dispatcher::Dispatcher::pick`] selects for `hint`.
///
/// Mirrors the source's `Delay`/`Timer` awaiter.
#[must_use]
pub fn sleep(duration_ms: i64, hint: WorkerId) -> Sleep {
    Sleep::new(duration_ms, hint)
}

impl Sleep {
    pub(crate) fn new(duration_ms: i64, hint: WorkerId) -> Self {
        Self {
            shared: None,
            duration_ms,
            hint,
        }
    }

    /// Returns a [`SleepHandle`] that can be used to [`cancel`](SleepHandle::cancel)
    /// this sleep from another task, once it has been polled at least once.
    #[must_use]
    pub fn handle(&self) -> Option<SleepHandle> {
        self.shared.clone().map(SleepHandle)
    }
}

/// A cancellation handle for a [`Sleep`] that has already been polled once.
#[derive(Clone)]
pub struct SleepHandle(Arc<SleepShared>);

impl SleepHandle {
    /// Attempts to cancel the sleep. Best-effort and always safe to call,
    /// including after the sleep has already fired.
    pub fn cancel(&self) {
        self.0.abandon();
    }
}

impl Future for Sleep {
    type Output = Result<(), AwaitError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.shared.is_none() {
            let worker = crate::dispatcher::Dispatcher::get().pick(self.hint);
            let deadline = worker.clock().deadline(Some(self.duration_ms));
            let shared = Arc::new(SleepShared {
                state: AtomicU8::new(CREATED),
                waker: Mutex::new(Some(cx.waker().clone())),
                deadline,
                worker: worker.clone(),
                timer_key: Mutex::new(None),
            });
            shared.state.store(SCHEDULED, Ordering::Release);
            worker.inflight_enter();
            let key = worker.insert_timer(deadline, TimerTarget::Sleep(shared.clone()));
            *shared.timer_key.lock().unwrap() = Some(key);
            self.shared = Some(shared);
            return Poll::Pending;
        }

        let shared = self.shared.as_ref().unwrap();
        match shared.state.load(Ordering::Acquire) {
            SCHEDULED => {
                *shared.waker.lock().unwrap() = Some(cx.waker().clone());
                Poll::Pending
            }
            FIRED => Poll::Ready(Ok(())),
            ABANDONED => Poll::Ready(Err(AwaitError::Abandoned)),
            _ => unreachable!("Sleep observed an invalid state"),
        }
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(shared) = &self.shared {
            // Moving/dropping a SCHEDULED awaiter is a bug in the source this
            // is ported from; here we make it safe instead of aborting, since
            // `Sleep` is a normal droppable Rust value that may be cancelled
            // mid-flight (e.g. a `select!` losing a race).
            shared.abandon();
        }
    }
}
