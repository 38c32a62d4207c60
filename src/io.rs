// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The `IoWait` awaiter: a future that completes once a registered file
//! descriptor becomes ready, times out, errors, or is cancelled.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use std::os::fd::AsRawFd;

use mio::event::Source;

use crate::error::AwaitError;
use crate::reactor::{Direction, Readiness};
use crate::worker::{TimerKey, TimerTarget, Worker};
use crate::WorkerId;

const CREATED: u8 = 0;
const SCHEDULED: u8 = 1;
const FIRED: u8 = 2;
const ERROR: u8 = 3;
const TIMEOUT: u8 = 4;
const ABANDONED: u8 = 5;

/// Shared state for a pending [`IoWait`]. While `SCHEDULED`, exactly one
/// worker (the one whose id is `worker.id()`) holds a registration pointing
/// back at this value, and will perform exactly one CAS out of `SCHEDULED`.
pub(crate) struct IoWaitShared {
    state: AtomicU8,
    waker: Mutex<Option<Waker>>,
    dir: Direction,
    deadline: i64,
    worker: Arc<Worker>,
    poller_key: Mutex<Option<usize>>,
    timer_key: Mutex<Option<TimerKey>>,
    error: Mutex<Option<io::Error>>,
}

impl IoWaitShared {
    pub(crate) fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    pub(crate) fn direction(&self) -> Direction {
        self.dir
    }

    /// Called by the owning worker's reactor loop when a readiness event
    /// fires for this registration.
    pub(crate) fn fire(self: &Arc<Self>, flags: Readiness) {
        let target = if flags.is_error() { ERROR } else { FIRED };
        if self
            .state
            .compare_exchange(SCHEDULED, target, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if target == ERROR {
                let err = io::Error::from(io::ErrorKind::ConnectionReset);
                tracing::error!(%err, "io wait fired with an error condition");
                *self.error.lock().unwrap() = Some(err);
            } else {
                tracing::trace!(?flags, "io wait fired");
            }
            self.worker.inflight_leave();
            self.detach_timer();
            self.wake();
        }
    }

    /// Called by the owning worker's reactor loop when this entry's timer expires.
    pub(crate) fn expire(self: &Arc<Self>) {
        if self
            .state
            .compare_exchange(SCHEDULED, TIMEOUT, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::trace!("io wait timed out");
            self.worker.inflight_leave();
            self.unregister_poller();
            self.wake();
        }
    }

    /// Cancels the wait. Safe from any thread; idempotent.
    pub(crate) fn abandon(self: &Arc<Self>) {
        if self
            .state
            .compare_exchange(SCHEDULED, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::debug!("io wait abandoned");
            self.worker.inflight_leave();
            self.detach_timer();
            self.unregister_poller();
            self.wake();
        }
    }

    fn detach_timer(&self) {
        if let Some(key) = self.timer_key.lock().unwrap().take() {
            self.worker.cancel_timer(key);
        }
    }

    fn unregister_poller(&self) {
        if let Some(key) = self.poller_key.lock().unwrap().take() {
            self.worker.unregister_io(key);
        }
    }

    fn wake(&self) {
        if let Some(waker) = self.waker.lock().unwrap().take() {
            waker.wake();
        }
    }
}

/// A future that completes once `source` becomes ready for `dir`, the
/// deadline elapses, or the wait is cancelled.
///
/// Mirrors the source's `fdwait`/`Event` awaiter. `IoWait` borrows the socket
/// for the duration of the wait so that registration and the socket's
/// lifetime cannot get out of sync; socket wrapper types in [`crate::net`]
/// build their `send`/`receive`/`accept`/`connect` operations on top of it.
pub struct IoWait<'s, S> {
    source: &'s mut S,
    dir: Direction,
    deadline: i64,
    hint: WorkerId,
    shared: Option<Arc<IoWaitShared>>,
}

impl<'s, S: Source + AsRawFd> IoWait<'s, S> {
    pub(crate) fn new(source: &'s mut S, dir: Direction, deadline: i64, hint: WorkerId) -> Self {
        Self {
            source,
            dir,
            deadline,
            hint,
            shared: None,
        }
    }
}

impl<S: Source + AsRawFd> Future for IoWait<'_, S> {
    type Output = Result<(), AwaitError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if this.shared.is_none() {
            let worker = crate::dispatcher::Dispatcher::get().pick(this.hint);
            let shared = Arc::new(IoWaitShared {
                state: AtomicU8::new(CREATED),
                waker: Mutex::new(Some(cx.waker().clone())),
                dir: this.dir,
                deadline: this.deadline,
                worker: worker.clone(),
                poller_key: Mutex::new(None),
                timer_key: Mutex::new(None),
                error: Mutex::new(None),
            });

            let key = match worker.register_io(this.source, this.dir, shared.clone()) {
                Ok(key) => key,
                Err(err) => return Poll::Ready(Err(AwaitError::Io(err))),
            };
            *shared.poller_key.lock().unwrap() = Some(key);
            shared.state.store(SCHEDULED, Ordering::Release);
            worker.inflight_enter();

            if this.deadline < crate::time::NEVER {
                let timer_key = worker.insert_timer(this.deadline, TimerTarget::Io(shared.clone()));
                *shared.timer_key.lock().unwrap() = Some(timer_key);
            }

            this.shared = Some(shared);
            return Poll::Pending;
        }

        let shared = this.shared.as_ref().unwrap();
        match shared.state.load(Ordering::Acquire) {
            SCHEDULED => {
                *shared.waker.lock().unwrap() = Some(cx.waker().clone());
                Poll::Pending
            }
            FIRED => Poll::Ready(Ok(())),
            ERROR => {
                let err = shared
                    .error
                    .lock()
                    .unwrap()
                    .take()
                    .unwrap_or_else(|| io::Error::from(io::ErrorKind::Other));
                Poll::Ready(Err(AwaitError::Io(err)))
            }
            TIMEOUT => Poll::Ready(Err(AwaitError::Timeout)),
            ABANDONED => Poll::Ready(Err(AwaitError::Abandoned)),
            _ => unreachable!("IoWait observed an invalid state"),
        }
    }
}

impl<S> Drop for IoWait<'_, S> {
    fn drop(&mut self) {
        if let Some(shared) = &self.shared {
            shared.abandon();
        }
    }
}
