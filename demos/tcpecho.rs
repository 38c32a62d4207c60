// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A small echo server/client demo driving the scheduler end to end.
//!
//! ```text
//! tcpecho server [--workers N] [--addr ADDR]
//! tcpecho client [--workers N] [--addr ADDR] [--connections N] [--rounds N]
//! ```

use std::net::SocketAddr;

use iorun::dispatcher::Dispatcher;
use iorun::net::{TcpListener, TcpSocket};
use iorun::task;
use iorun::time::sleep;
use iorun::worker::WorkerId;

struct Args {
    workers: usize,
    addr: SocketAddr,
    connections: usize,
    rounds: usize,
}

fn parse_args() -> (String, Args) {
    let mut argv = std::env::args().skip(1);
    let role = argv.next().unwrap_or_else(|| {
        eprintln!("usage: tcpecho <server|client> [--workers N] [--addr ADDR] [--connections N] [--rounds N]");
        std::process::exit(2);
    });

    let mut args = Args {
        workers: 4,
        addr: "127.0.0.1:7070".parse().unwrap(),
        connections: 100,
        rounds: 10,
    };

    let rest: Vec<String> = argv.collect();
    let mut i = 0;
    while i < rest.len() {
        match rest[i].as_str() {
            "--workers" => {
                args.workers = rest[i + 1].parse().expect("--workers takes an integer");
                i += 2;
            }
            "--addr" => {
                args.addr = rest[i + 1].parse().expect("--addr takes a socket address");
                i += 2;
            }
            "--connections" => {
                args.connections = rest[i + 1].parse().expect("--connections takes an integer");
                i += 2;
            }
            "--rounds" => {
                args.rounds = rest[i + 1].parse().expect("--rounds takes an integer");
                i += 2;
            }
            other => {
                eprintln!("unrecognized argument: {other}");
                std::process::exit(2);
            }
        }
    }

    (role, args)
}

fn main() {
    tracing_subscriber::fmt::init();
    let (role, args) = parse_args();

    Dispatcher::init(args.workers).expect("dispatcher already initialized");
    tracing::info!(workers = args.workers, addr = %args.addr, "dispatcher started");

    match role.as_str() {
        "server" => run_server(args),
        "client" => run_client(args),
        other => {
            eprintln!("unknown role {other:?}, expected \"server\" or \"client\"");
            std::process::exit(2);
        }
    }
}

fn run_server(args: Args) {
    task::spawn_detached(
        async move {
            let mut listener = TcpListener::listen(args.addr).expect("bind failed");
            tracing::info!(addr = %listener.local_addr().unwrap(), "listening");

            let mut next_worker = 0usize;
            loop {
                let Ok((mut socket, peer)) = listener.accept(None, Some(WorkerId::Id(next_worker))).await else {
                    break;
                };
                next_worker = (next_worker + 1) % args.workers;
                tracing::debug!(%peer, "accepted connection");

                task::spawn_detached(
                    async move {
                        let mut buf = [0u8; 4096];
                        loop {
                            match socket.receive(&mut buf, None).await {
                                Ok(0) | Err(_) => break,
                                Ok(n) => {
                                    if socket.send_all(&buf[..n], None).await.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                    },
                    WorkerId::Any,
                );
            }
        },
        WorkerId::Any,
    );

    task::spawn_detached(report_stats_forever(), WorkerId::Any);

    std::thread::park();
}

fn run_client(args: Args) {
    let mut handles = Vec::with_capacity(args.connections);
    for _ in 0..args.connections {
        handles.push(task::spawn(
            run_one_client(args.addr, args.rounds),
            WorkerId::Any,
        ));
    }

    task::spawn_detached(
        async move {
            for handle in handles {
                let _ = handle.await;
            }
            std::process::exit(0);
        },
        WorkerId::Any,
    );

    std::thread::park();
}

async fn run_one_client(addr: SocketAddr, rounds: usize) {
    let connect = TcpSocket::connect(addr, Some(5_000), WorkerId::Any).await;
    let Ok(mut socket) = connect else {
        tracing::warn!("connect failed");
        return;
    };

    let payload = b"ping";
    let mut buf = [0u8; 4];
    for round in 0..rounds {
        if socket.send_all(payload, Some(1_000)).await.is_err() {
            tracing::warn!(round, "send failed");
            return;
        }
        if socket.receive_all(&mut buf, Some(1_000)).await.is_err() {
            tracing::warn!(round, "receive failed");
            return;
        }
    }
}

async fn report_stats_forever() {
    loop {
        let _ = sleep(5_000, WorkerId::Any).await;
        for stats in Dispatcher::get().dump_stats() {
            tracing::info!(
                worker = stats.worker.id,
                inflight = stats.worker.inflight,
                max_inflight = stats.worker.max_inflight,
                total_scheduled = stats.worker.total_scheduled,
                total_polled = stats.worker.total_polled,
                max_polled = stats.worker.max_polled,
                percent_of_global_scheduled = stats.percent_of_global_scheduled,
                "worker stats"
            );
        }
    }
}

