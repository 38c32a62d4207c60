// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Non-blocking TCP built on [`crate::io::IoWait`].
//!
//! `TcpListener` and `TcpSocket` own their file descriptor (closed on
//! `Drop`, same as the source this is ported from) and never block: every
//! operation that would otherwise return `EAGAIN`/`EWOULDBLOCK` instead
//! awaits readiness through the owning worker's reactor.

use std::io::{self, Read, Write};
use std::net::SocketAddr;

use crate::error::AwaitError;
use crate::io::IoWait;
use crate::reactor::Direction;
use crate::time::NEVER;
use crate::worker::WorkerId;

/// A non-blocking TCP connection.
pub struct TcpSocket {
    inner: mio::net::TcpStream,
    hint: WorkerId,
}

impl TcpSocket {
    fn new(inner: mio::net::TcpStream) -> Self {
        Self {
            inner,
            hint: WorkerId::Any,
        }
    }

    /// Pins this socket's future I/O to a specific worker, e.g. to keep an
    /// accepted connection on the same thread that accepted it.
    pub fn bind_to_thread(&mut self, id: usize) {
        self.hint = WorkerId::Id(id);
    }

    #[must_use]
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    #[must_use]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Connects to `addr`, awaiting write-readiness (the non-blocking
    /// connect's completion signal) up to `timeout_ms`.
    ///
    /// # Errors
    ///
    /// Returns [`AwaitError::Timeout`] if the connection does not complete
    /// in time, or [`AwaitError::Io`] if the connect itself fails.
    pub async fn connect(addr: SocketAddr, timeout_ms: Option<i64>, hint: WorkerId) -> Result<Self, AwaitError> {
        let stream = mio::net::TcpStream::connect(addr)?;
        let mut socket = Self { inner: stream, hint };

        let worker = crate::dispatcher::Dispatcher::get().pick(hint);
        let deadline = worker.clock().deadline(timeout_ms);
        IoWait::new(&mut socket.inner, Direction::Write, deadline, hint).await?;

        match socket.inner.take_error()? {
            Some(err) => {
                tracing::error!(%err, %addr, "connect failed");
                Err(AwaitError::Io(err))
            }
            None => Ok(socket),
        }
    }

    /// Performs a single `read`, awaiting read-readiness on `EWOULDBLOCK`.
    ///
    /// # Errors
    ///
    /// See [`crate::io::IoWait`]'s possible outcomes.
    pub async fn receive(&mut self, buf: &mut [u8], timeout_ms: Option<i64>) -> Result<usize, AwaitError> {
        let deadline = self.deadline(timeout_ms);
        loop {
            match self.inner.read(buf) {
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    IoWait::new(&mut self.inner, Direction::Read, deadline, self.hint).await?;
                }
                Err(err) => {
                    tracing::error!(%err, "receive failed");
                    return Err(AwaitError::Io(err));
                }
            }
        }
    }

    /// Performs a single `write`, awaiting write-readiness on `EWOULDBLOCK`.
    ///
    /// # Errors
    ///
    /// See [`crate::io::IoWait`]'s possible outcomes.
    pub async fn send(&mut self, buf: &[u8], timeout_ms: Option<i64>) -> Result<usize, AwaitError> {
        let deadline = self.deadline(timeout_ms);
        loop {
            match self.inner.write(buf) {
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    IoWait::new(&mut self.inner, Direction::Write, deadline, self.hint).await?;
                }
                Err(err) => {
                    tracing::error!(%err, "send failed");
                    return Err(AwaitError::Io(err));
                }
            }
        }
    }

    /// Repeats [`TcpSocket::receive`] until `buf` is completely filled, the
    /// peer closes the connection (short read), or an error/timeout occurs.
    ///
    /// # Errors
    ///
    /// See [`crate::io::IoWait`]'s possible outcomes.
    pub async fn receive_all(&mut self, mut buf: &mut [u8], timeout_ms: Option<i64>) -> Result<usize, AwaitError> {
        let total = buf.len();
        while !buf.is_empty() {
            let n = self.receive(buf, timeout_ms).await?;
            if n == 0 {
                break;
            }
            buf = &mut buf[n..];
        }
        Ok(total - buf.len())
    }

    /// Repeats [`TcpSocket::send`] until all of `buf` has been written, or an
    /// error/timeout occurs.
    ///
    /// # Errors
    ///
    /// See [`crate::io::IoWait`]'s possible outcomes.
    pub async fn send_all(&mut self, mut buf: &[u8], timeout_ms: Option<i64>) -> Result<(), AwaitError> {
        while !buf.is_empty() {
            let n = self.send(buf, timeout_ms).await?;
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Shuts down the connection but keeps the fd open. Unlike `Drop`, this
    /// doesn't release the fd itself.
    pub fn close(&mut self) -> io::Result<()> {
        self.inner.shutdown(std::net::Shutdown::Both)
    }

    fn deadline(&self, timeout_ms: Option<i64>) -> i64 {
        match timeout_ms {
            Some(_) => crate::dispatcher::Dispatcher::get()
                .pick(self.hint)
                .clock()
                .deadline(timeout_ms),
            None => NEVER,
        }
    }
}

/// A non-blocking TCP listener.
pub struct TcpListener {
    inner: mio::net::TcpListener,
    hint: WorkerId,
}

impl TcpListener {
    /// Binds and starts listening on `addr`.
    ///
    /// # Errors
    ///
    /// Returns any error the underlying `bind`/`listen` syscalls produce.
    pub fn listen(addr: SocketAddr) -> io::Result<Self> {
        Ok(Self {
            inner: mio::net::TcpListener::bind(addr)?,
            hint: WorkerId::Any,
        })
    }

    /// Pins the listener's own accept-readiness wait to a specific worker.
    pub fn bind_to_thread(&mut self, id: usize) {
        self.hint = WorkerId::Id(id);
    }

    #[must_use]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Accepts one connection, awaiting read-readiness on `EWOULDBLOCK`.
    ///
    /// `hint` picks which worker the *accepted* socket's future I/O runs on;
    /// defaults to the listener's own affinity when `None`.
    ///
    /// # Errors
    ///
    /// See [`crate::io::IoWait`]'s possible outcomes.
    pub async fn accept(
        &mut self,
        timeout_ms: Option<i64>,
        hint: Option<WorkerId>,
    ) -> Result<(TcpSocket, SocketAddr), AwaitError> {
        let worker = crate::dispatcher::Dispatcher::get().pick(self.hint);
        let deadline = worker.clock().deadline(timeout_ms);
        loop {
            match self.inner.accept() {
                Ok((stream, peer)) => {
                    let mut socket = TcpSocket::new(stream);
                    socket.hint = hint.unwrap_or(self.hint);
                    return Ok((socket, peer));
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    IoWait::new(&mut self.inner, Direction::Read, deadline, self.hint).await?;
                }
                Err(err) => {
                    tracing::error!(%err, "accept failed");
                    return Err(AwaitError::Io(err));
                }
            }
        }
    }
}
