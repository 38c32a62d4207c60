// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The per-worker readiness multiplexer.
//!
//! Wraps [`mio::Poll`] with an integrated wake descriptor ([`mio::Waker`]) and a
//! slab of registered interests, matching the `ReadinessPoller` contract: the
//! wake descriptor is just another low-numbered token, and `register`/`unregister`
//! are modify-in-place so re-registering an fd never fails with "already
//! registered".

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};

use crate::io::IoWaitShared;

/// Reserved token identifying the wake descriptor; never reused for a real fd.
const WAKE_TOKEN: Token = Token(usize::MAX);

/// Direction of readiness a [`crate::io::IoWait`] is waiting for.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    fn interest(self) -> Interest {
        match self {
            Direction::Read => Interest::READABLE,
            Direction::Write => Interest::WRITABLE,
        }
    }
}

bitflags::bitflags! {
    /// Readiness flags as reported by the poller for a single registration.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct Readiness: u8 {
        const READY_IN  = 0b0001;
        const READY_OUT = 0b0010;
        const HUP       = 0b0100;
        const ERR       = 0b1000;
    }
}

impl Readiness {
    /// `HUP`/`ERR` map to the logical `ERROR` terminal state for a waiting `IoWait`.
    pub(crate) fn is_error(self) -> bool {
        self.intersects(Readiness::HUP | Readiness::ERR)
    }
}

/// One readiness event reported by [`Poller::wait`].
pub(crate) enum Event {
    /// The wake descriptor fired; drain it and re-check the handoff queue.
    Wake,
    /// An I/O interest fired; the cookie identifies which [`IoWaitShared`].
    Io {
        cookie: Arc<IoWaitShared>,
        flags: Readiness,
    },
}

/// Per-worker readiness multiplexer. Not `Send`/`Sync`: lives entirely on the
/// owning worker's OS thread, except for [`Poller::waker`] which is cloned out
/// for remote threads to call [`Waker::wake`].
pub(crate) struct Poller {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    registrations: slab::Slab<(RawFd, Arc<IoWaitShared>)>,
    by_fd: HashMap<RawFd, usize>,
}

impl Poller {
    pub(crate) fn new(max_batch: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        Ok(Self {
            poll,
            events: Events::with_capacity(max_batch),
            waker,
            registrations: slab::Slab::new(),
            by_fd: HashMap::new(),
        })
    }

    /// A cheap, thread-safe handle that can interrupt [`Poller::wait`] from
    /// any thread. This is the "wake descriptor" of the source.
    pub(crate) fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    /// Installs (or upgrades) interest in `dir`-readiness for `source`, tagged
    /// with `cookie`. Returns the slab key used to [`Poller::forget`] later.
    ///
    /// A second `register` call on an fd that is already registered modifies
    /// the existing interest in place (mio's `register` errors on a duplicate
    /// fd; `reregister` is what the `ReadinessPoller` contract calls "upgrade
    /// rather than fail").
    pub(crate) fn register<S: Source + AsRawFd>(
        &mut self,
        source: &mut S,
        dir: Direction,
        cookie: Arc<IoWaitShared>,
    ) -> io::Result<usize> {
        let fd = source.as_raw_fd();
        if let Some(&key) = self.by_fd.get(&fd) {
            tracing::warn!(fd, "fd already registered, upgrading interest instead of failing");
            self.registrations[key] = (fd, cookie);
            self.poll
                .registry()
                .reregister(source, Token(key), dir.interest())?;
            return Ok(key);
        }

        let key = self.registrations.insert((fd, cookie));
        // Safety: `key` fits in a `usize`, and tokens are only ever compared,
        // never arithmetically manipulated.
        let token = Token(key);
        if let Err(err) = self.poll.registry().register(source, token, dir.interest()) {
            self.registrations.remove(key);
            return Err(err);
        }
        self.by_fd.insert(fd, key);
        Ok(key)
    }

    /// Drops the bookkeeping for a registration installed by [`Poller::register`].
    /// Idempotent: forgetting an already-forgotten key is a no-op.
    ///
    /// This does not call `Registry::deregister`: the socket types in
    /// [`crate::net`] close their fd on drop, and the OS removes a closed fd
    /// from every epoll interest list automatically. Callers that cancel a
    /// registration while still holding the live socket (rather than
    /// dropping it) only need this to stop stale events from being
    /// attributed to a reused slab slot.
    pub(crate) fn forget(&mut self, key: usize) {
        if self.registrations.contains(key) {
            let (fd, _) = self.registrations.remove(key);
            self.by_fd.remove(&fd);
        }
    }

    /// Blocks up to `timeout` for readiness events. `timeout == None` blocks
    /// indefinitely; `Some(Duration::ZERO)` polls without blocking.
    pub(crate) fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Event>> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(err) => return Err(err),
        }

        let mut out = Vec::with_capacity(self.events.iter().count());
        for ev in self.events.iter() {
            if ev.token() == WAKE_TOKEN {
                out.push(Event::Wake);
                continue;
            }

            let key = ev.token().0;
            if let Some((_, cookie)) = self.registrations.get(key) {
                let mut flags = Readiness::empty();
                flags.set(Readiness::READY_IN, ev.is_readable());
                flags.set(Readiness::READY_OUT, ev.is_writable());
                flags.set(
                    Readiness::HUP,
                    ev.is_read_closed() || ev.is_write_closed(),
                );
                flags.set(Readiness::ERR, ev.is_error());
                out.push(Event::Io {
                    cookie: cookie.clone(),
                    flags,
                });
            }
        }
        Ok(out)
    }
}
