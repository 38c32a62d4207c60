// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt;
use std::io;

/// Why a pending [`crate::io::IoWait`] or [`crate::time::Sleep`] was woken up.
#[derive(Debug)]
pub enum AwaitError {
    /// The poller or socket syscall reported an I/O error.
    Io(io::Error),
    /// The deadline passed before the event occurred.
    Timeout,
    /// The awaiter was cancelled from another task.
    Abandoned,
}

impl fmt::Display for AwaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AwaitError::Io(err) => write!(f, "I/O error: {err}"),
            AwaitError::Timeout => f.write_str("timed out"),
            AwaitError::Abandoned => f.write_str("cancelled"),
        }
    }
}

impl std::error::Error for AwaitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AwaitError::Io(err) => Some(err),
            AwaitError::Timeout | AwaitError::Abandoned => None,
        }
    }
}

impl From<io::Error> for AwaitError {
    fn from(err: io::Error) -> Self {
        AwaitError::Io(err)
    }
}

/// Returned by [`crate::task::JoinHandle::join`] / `.await`.
#[derive(Debug)]
pub enum JoinError {
    /// The task's future panicked while it was being polled.
    Panicked,
    /// The dispatcher was torn down before the task completed.
    Closed,
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinError::Panicked => f.write_str("task panicked"),
            JoinError::Closed => f.write_str("dispatcher was shut down"),
        }
    }
}

impl std::error::Error for JoinError {}

/// Returned by [`crate::Dispatcher::init`] when the dispatcher is already initialized,
/// or by worker-registration calls once the owning worker has begun shutting down.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Closed(pub(crate) ());

impl fmt::Display for Closed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("scheduler is closed")
    }
}

impl std::error::Error for Closed {}
