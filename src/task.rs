// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Spawned tasks: the type-erased queue node every worker's handoff queue
//! carries, and the typed [`JoinHandle`]/[`AsyncScope`] surface built on it.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};

use mpsc_queue::{Linked, Links};

use crate::error::JoinError;
use crate::worker::{Worker, WorkerId};

/// The type-erased queue node carried by a [`Worker`]'s handoff queue.
///
/// Every spawned future is boxed down to `dyn Future<Output = ()> + Send`;
/// the typed result (if any) is communicated out-of-band through a
/// [`JoinShared<T>`] captured by the wrapping future itself, so `TaskNode`
/// never needs to be generic over the spawned future's output type.
pub(crate) struct TaskNode {
    links: Links<TaskNode>,
    future: Mutex<Option<Pin<Box<dyn Future<Output = ()> + Send>>>>,
    scheduled: AtomicBool,
    worker: Mutex<Option<Arc<Worker>>>,
}

impl Default for TaskNode {
    fn default() -> Self {
        Self {
            links: Links::new(),
            future: Mutex::new(None),
            scheduled: AtomicBool::new(false),
            worker: Mutex::new(None),
        }
    }
}

// Safety: `TaskNode` is only ever handled through `Arc`, and its only
// non-atomic fields are behind `Mutex`.
unsafe impl Linked for TaskNode {
    type Handle = Arc<TaskNode>;

    fn into_ptr(handle: Arc<TaskNode>) -> NonNull<TaskNode> {
        // Safety: `Arc::into_raw` never returns a null pointer.
        unsafe { NonNull::new_unchecked(Arc::into_raw(handle).cast_mut()) }
    }

    unsafe fn from_ptr(ptr: NonNull<TaskNode>) -> Arc<TaskNode> {
        // Safety: caller guarantees `ptr` came from a prior `into_ptr` call.
        unsafe { Arc::from_raw(ptr.as_ptr()) }
    }

    unsafe fn links(target: NonNull<TaskNode>) -> NonNull<Links<TaskNode>> {
        // Safety: `links` is a field of `TaskNode`, so offsetting to it never
        // produces a null pointer.
        let links = ptr::addr_of_mut!((*target.as_ptr()).links);
        unsafe { NonNull::new_unchecked(links) }
    }
}

impl Wake for TaskNode {
    fn wake(self: Arc<Self>) {
        Self::wake_by_ref(&self);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        // Only one outstanding schedule per task at a time: a wake that
        // arrives while the task is already queued (or being polled, which
        // clears the flag only once `run` starts) just needs to know a
        // re-poll is owed, not to enqueue a second time.
        if !self.scheduled.swap(true, Ordering::AcqRel) {
            if let Some(worker) = self.worker.lock().unwrap().clone() {
                worker.schedule(self.clone());
            }
        }
    }
}

impl TaskNode {
    /// Runs one poll of `task`. Called only from the owning worker's reactor
    /// loop, which is this queue's sole consumer.
    pub(crate) fn run(task: Arc<TaskNode>) {
        task.scheduled.store(false, Ordering::Release);

        let Some(mut future) = task.future.lock().unwrap().take() else {
            // Already completed (or being run concurrently, which can't
            // happen given single-consumer drainage); nothing to do.
            return;
        };

        let waker = Waker::from(task.clone());
        let mut cx = Context::from_waker(&waker);

        match future.as_mut().poll(&mut cx) {
            Poll::Ready(()) => {}
            Poll::Pending => *task.future.lock().unwrap() = Some(future),
        }
    }
}

/// Polls `inner`, converting a panic into `Err` instead of unwinding through
/// the worker's reactor loop.
struct CatchUnwind<F>(F);

impl<F: Future> Future for CatchUnwind<F> {
    type Output = Result<F::Output, Box<dyn Any + Send + 'static>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Safety: we only ever access `inner` through its own `Pin`, never move it.
        let inner = unsafe { self.map_unchecked_mut(|s| &mut s.0) };
        match std::panic::catch_unwind(AssertUnwindSafe(|| inner.poll(cx))) {
            Ok(Poll::Ready(value)) => Poll::Ready(Ok(value)),
            Ok(Poll::Pending) => Poll::Pending,
            Err(payload) => Poll::Ready(Err(payload)),
        }
    }
}

struct JoinShared<T> {
    result: Mutex<Option<Result<T, JoinError>>>,
    waker: Mutex<Option<Waker>>,
}

impl<T> JoinShared<T> {
    fn new() -> Self {
        Self {
            result: Mutex::new(None),
            waker: Mutex::new(None),
        }
    }

    fn complete(&self, result: Result<T, JoinError>) {
        let mut slot = self.result.lock().unwrap();
        if slot.is_some() {
            return;
        }
        *slot = Some(result);
        drop(slot);
        if let Some(waker) = self.waker.lock().unwrap().take() {
            waker.wake();
        }
    }
}

/// Fires [`JoinError::Closed`] if the wrapping future is dropped before it
/// reaches its own completion line, e.g. because the dispatcher tore down
/// and abandoned every still-pending task future.
struct CompleteOnDrop<T> {
    shared: Arc<JoinShared<T>>,
    armed: bool,
}

impl<T> Drop for CompleteOnDrop<T> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.complete(Err(JoinError::Closed));
        }
    }
}

/// A handle to a spawned task's eventual output.
///
/// Dropping a `JoinHandle` detaches the task: it keeps running to completion
/// on its worker, its output is simply discarded instead of delivered.
pub struct JoinHandle<T> {
    shared: Arc<JoinShared<T>>,
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.shared.result.lock().unwrap();
        if let Some(result) = slot.take() {
            return Poll::Ready(result);
        }
        *self.shared.waker.lock().unwrap() = Some(cx.waker().clone());
        Poll::Pending
    }
}

fn spawn_inner<F>(future: F, hint: WorkerId) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let worker = crate::dispatcher::Dispatcher::get().pick(hint);
    let shared = Arc::new(JoinShared::new());

    let wrapped = {
        let shared = shared.clone();
        async move {
            let mut guard = CompleteOnDrop {
                shared: shared.clone(),
                armed: true,
            };
            let outcome = CatchUnwind(future)
                .await
                .map_err(|_payload| JoinError::Panicked);
            guard.armed = false;
            shared.complete(outcome);
        }
    };

    let node = Arc::new(TaskNode {
        links: Links::new(),
        future: Mutex::new(Some(Box::pin(wrapped))),
        scheduled: AtomicBool::new(true),
        worker: Mutex::new(Some(worker.clone())),
    });
    worker.schedule(node);

    JoinHandle { shared }
}

/// Spawns `future` onto the dispatcher, returning a [`JoinHandle`] that
/// resolves to its output.
///
/// Mirrors the source's joinable `task<T, Joinable>`: the future starts
/// running immediately (on the worker [`crate::dispatcher::Dispatcher::pick`]
/// selects for `hint`), independent of whether the returned handle is ever
/// polled.
pub fn spawn<F>(future: F, hint: WorkerId) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    spawn_inner(future, hint)
}

/// Spawns `future` onto the dispatcher without a way to observe its output.
///
/// Mirrors the source's non-joinable `task<T>`: equivalent to
/// `spawn(future, hint)` with the [`JoinHandle`] immediately dropped.
pub fn spawn_detached<F>(future: F, hint: WorkerId)
where
    F: Future<Output = ()> + Send + 'static,
{
    drop(spawn_inner(future, hint));
}

/// A structured-concurrency scope: every task spawned through it is joined
/// before the scope itself is considered finished.
///
/// Unlike a bare [`JoinHandle`], whose drop silently detaches, dropping an
/// `AsyncScope` with unjoined children is exactly the "destructor observes a
/// still-pending awaiter" situation the source this is ported from treats as
/// fatal — and it's kept fatal here, because at the scope boundary (unlike
/// at a single `IoWait`/`Sleep` awaiter) there is no `Arc`-shared reactor
/// state keeping the children alive correctly after an ungoverned drop.
/// Call [`AsyncScope::join_all`] before a scope goes out of `async fn`
/// scope.
#[derive(Default)]
pub struct AsyncScope {
    children: Vec<JoinHandle<()>>,
    joined: bool,
}

impl AsyncScope {
    #[must_use]
    pub fn new() -> Self {
        Self {
            children: Vec::new(),
            joined: false,
        }
    }

    /// Spawns `future` as a child of this scope.
    pub fn spawn<F>(&mut self, future: F, hint: WorkerId)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.children.push(spawn_inner(future, hint));
    }

    /// Awaits every child spawned into this scope. Panics propagated from a
    /// child are swallowed into a logged warning; the scope always resolves
    /// once every child has terminated one way or another.
    pub async fn join_all(mut self) {
        for child in self.children.drain(..) {
            if let Err(err) = child.await {
                tracing::warn!(%err, "task in scope did not complete cleanly");
            }
        }
        self.joined = true;
    }
}

impl Drop for AsyncScope {
    fn drop(&mut self) {
        assert!(
            self.joined || self.children.is_empty(),
            "AsyncScope dropped with unjoined children; call join_all() first"
        );
    }
}
