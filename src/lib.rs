// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A multi-threaded, coroutine-oriented I/O scheduler for network services.
//!
//! A fixed pool of worker threads, each running a tight reactor loop over an
//! OS readiness multiplexer, a deadline-ordered timer list, and a lock-free
//! handoff queue of runnable tasks. [`spawn`] and [`spawn_detached`] put
//! `Future`s onto the pool; [`net::TcpListener`]/[`net::TcpSocket`] and
//! [`time::Sleep`] are the awaiters that actually suspend a task until the
//! worker's reactor has something for it.
//!
//! ```no_run
//! use iorun::{dispatcher::Dispatcher, net::TcpListener, task, worker::WorkerId};
//!
//! Dispatcher::init(4).unwrap();
//!
//! task::spawn_detached(async move {
//!     let mut listener = TcpListener::listen("127.0.0.1:7070".parse().unwrap()).unwrap();
//!     loop {
//!         let Ok((mut socket, _peer)) = listener.accept(None, None).await else {
//!             break;
//!         };
//!         task::spawn_detached(async move {
//!             let mut buf = [0u8; 1024];
//!             while let Ok(n) = socket.receive(&mut buf, None).await {
//!                 if n == 0 || socket.send_all(&buf[..n], None).await.is_err() {
//!                     break;
//!                 }
//!             }
//!         }, WorkerId::Any);
//!     }
//! }, WorkerId::Any);
//! ```

pub mod dispatcher;
pub mod error;
pub mod io;
pub mod net;
mod reactor;
pub mod task;
pub mod time;
pub mod worker;

pub use error::{AwaitError, Closed, JoinError};
pub use task::{spawn, spawn_detached, AsyncScope, JoinHandle};
pub use worker::WorkerId;
