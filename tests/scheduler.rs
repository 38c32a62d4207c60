// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::net::SocketAddr;

use iorun::dispatcher::Dispatcher;
use iorun::error::AwaitError;
use iorun::net::{TcpListener, TcpSocket};
use iorun::time::sleep;
use iorun::worker::WorkerId;
use iorun::{spawn, spawn_detached};

/// All tests in this binary share one process, and therefore one
/// `Dispatcher` singleton; only the first call actually initializes it.
fn ensure_dispatcher() {
    let _ = Dispatcher::init(4);
}

#[test]
fn echo_round_trip() {
    tracing_subscriber::fmt::try_init().ok();
    ensure_dispatcher();

    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let server = spawn(
        async move {
            let mut listener = TcpListener::listen(addr).unwrap();
            let bound = listener.local_addr().unwrap();
            (bound, listener)
        },
        WorkerId::Any,
    );

    let (bound, mut listener) = block_on(server).unwrap();

    let accepted = spawn(
        async move {
            let (mut socket, _peer) = listener.accept(Some(5_000), None).await.unwrap();
            let mut buf = [0u8; 5];
            socket.receive_all(&mut buf, Some(5_000)).await.unwrap();
            socket.send_all(&buf, Some(5_000)).await.unwrap();
        },
        WorkerId::Any,
    );

    let client = spawn(
        async move {
            let mut socket = TcpSocket::connect(bound, Some(5_000), WorkerId::Any)
                .await
                .unwrap();
            socket.send_all(b"hello", Some(5_000)).await.unwrap();
            let mut buf = [0u8; 5];
            socket.receive_all(&mut buf, Some(5_000)).await.unwrap();
            buf
        },
        WorkerId::Any,
    );

    block_on(accepted).unwrap();
    let echoed = block_on(client).unwrap();
    assert_eq!(&echoed, b"hello");
}

#[test]
fn connect_times_out_on_an_unresponsive_peer() {
    tracing_subscriber::fmt::try_init().ok();
    ensure_dispatcher();

    // Bind a listener that never accepts: the connect should complete (TCP
    // handshakes finish even without an `accept` call), so to exercise a
    // genuine timeout we point at a backlog-exhausted/filtered address
    // instead: a port nothing is listening on yet, but firewalled to drop
    // SYNs, isn't available in a portable test. We instead verify the
    // timeout plumbing directly against `receive`, which blocks on data
    // that will never arrive.
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();

    let server = spawn(
        async move {
            let mut listener = TcpListener::listen(addr).unwrap();
            let bound = listener.local_addr().unwrap();
            let accept = spawn(
                async move {
                    let (socket, _peer) = listener.accept(Some(5_000), None).await.unwrap();
                    socket
                },
                WorkerId::Any,
            );
            (bound, accept)
        },
        WorkerId::Any,
    );
    let (bound, accept) = block_on(server).unwrap();

    let client = spawn(
        async move { TcpSocket::connect(bound, Some(5_000), WorkerId::Any).await },
        WorkerId::Any,
    );
    let mut client_socket = block_on(client).unwrap().unwrap();
    let mut server_socket = block_on(accept).unwrap();

    let result = block_on(spawn(
        async move {
            let mut buf = [0u8; 1];
            server_socket.receive(&mut buf, Some(200)).await
        },
        WorkerId::Any,
    ))
    .unwrap();

    assert!(matches!(result, Err(AwaitError::Timeout)));
    drop(client_socket);
}

#[test]
fn sleep_can_be_cancelled_before_it_fires() {
    tracing_subscriber::fmt::try_init().ok();
    ensure_dispatcher();

    let outcome = block_on(spawn(
        async move {
            let mut pending = Box::pin(sleep(60_000, WorkerId::Any));
            let handle = pending.handle();
            // Poll once so the sleep registers with a worker's timer list.
            let woken = futures_poll_once(pending.as_mut());
            assert!(woken.is_none(), "a 60s sleep should not fire immediately");
            handle.unwrap().cancel();
            pending.await
        },
        WorkerId::Any,
    ))
    .unwrap();

    assert!(matches!(outcome, Err(AwaitError::Abandoned)));
}

#[test]
fn many_clients_survive_concurrent_round_trips() {
    tracing_subscriber::fmt::try_init().ok();
    ensure_dispatcher();

    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let bound = block_on(spawn(
        async move {
            let mut listener = TcpListener::listen(addr).unwrap();
            let bound = listener.local_addr().unwrap();
            spawn_detached(
                async move {
                    loop {
                        let Ok((mut socket, _peer)) = listener.accept(None, None).await else {
                            break;
                        };
                        spawn_detached(
                            async move {
                                let mut buf = [0u8; 4];
                                while let Ok(n) = socket.receive(&mut buf, None).await {
                                    if n == 0 || socket.send_all(&buf[..n], None).await.is_err() {
                                        break;
                                    }
                                }
                            },
                            WorkerId::Any,
                        );
                    }
                },
                WorkerId::Any,
            );
            bound
        },
        WorkerId::Any,
    ))
    .unwrap();

    const CLIENTS: usize = 50;
    const ROUNDS: usize = 5;

    let handles: Vec<_> = (0..CLIENTS)
        .map(|_| {
            spawn(
                async move {
                    let mut socket = TcpSocket::connect(bound, Some(5_000), WorkerId::Any)
                        .await
                        .unwrap();
                    for _ in 0..ROUNDS {
                        socket.send_all(b"ping", Some(5_000)).await.unwrap();
                        let mut buf = [0u8; 4];
                        socket.receive_all(&mut buf, Some(5_000)).await.unwrap();
                        assert_eq!(&buf, b"ping");
                    }
                },
                WorkerId::Any,
            )
        })
        .collect();

    for handle in handles {
        block_on(handle).unwrap();
    }
}

/// A minimal, single-future `block_on` for tests: parks the thread until the
/// future completes, using a `Waker` that unparks it.
fn block_on<F: std::future::Future>(future: F) -> F::Output {
    use std::sync::Arc;
    use std::task::{Context, Wake, Waker};

    struct ThreadWaker(std::thread::Thread);
    impl Wake for ThreadWaker {
        fn wake(self: Arc<Self>) {
            self.0.unpark();
        }
        fn wake_by_ref(self: &Arc<Self>) {
            self.0.unpark();
        }
    }

    let mut future = std::pin::pin!(future);
    let waker = Waker::from(Arc::new(ThreadWaker(std::thread::current())));
    let mut cx = Context::from_waker(&waker);
    loop {
        if let std::task::Poll::Ready(value) = future.as_mut().poll(&mut cx) {
            return value;
        }
        std::thread::park();
    }
}

/// Polls `future` exactly once with a no-op waker, returning `Some` only if
/// it was immediately ready.
fn futures_poll_once<F: std::future::Future>(future: std::pin::Pin<&mut F>) -> Option<F::Output> {
    use std::task::{RawWaker, RawWakerVTable, Waker};

    fn noop(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    fn noop_unit(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(noop, noop_unit, noop_unit, noop_unit);

    // Safety: the no-op vtable never dereferences the data pointer.
    let waker = unsafe { Waker::from_raw(noop(std::ptr::null())) };
    let mut cx = std::task::Context::from_waker(&waker);
    match future.poll(&mut cx) {
        std::task::Poll::Ready(value) => Some(value),
        std::task::Poll::Pending => None,
    }
}
