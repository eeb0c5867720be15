// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Test fixtures: a one-reactor/one-processor runtime and a mock UDP name
//! server answering through a user closure on its own OS thread.

use crate::config::TaskProcessorConfig;
use crate::dns::wire::{self, Question};
use crate::exec::TaskProcessor;
use crate::reactor::{Reactor, ReactorHandle};
use crate::task::{FramePool, FramePoolConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

pub(crate) struct TestRuntime {
    pub(crate) reactor: ReactorHandle,
    pub(crate) processor: TaskProcessor,
    _owner: Reactor,
}

impl Drop for TestRuntime {
    fn drop(&mut self) {
        self.processor.stop();
        self.processor.join();
        // the reactor stops when `_owner` drops
    }
}

pub(crate) fn fixture() -> TestRuntime {
    fixture_with_pool(FramePool::new(FramePoolConfig::default()))
}

pub(crate) fn fixture_with_pool(pool: Arc<FramePool>) -> TestRuntime {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let owner = Reactor::new(0).expect("failed to start test reactor");
    let reactor = owner.handle();
    let processor = TaskProcessor::build(
        &TaskProcessorConfig {
            name: "test-proc".to_owned(),
            worker_threads: 2,
            blocking: false,
        },
        pool,
        reactor.clone(),
    )
    .expect("failed to start test processor");

    TestRuntime {
        reactor,
        processor,
        _owner: owner,
    }
}

/// How the mock fails a query: answer `SERVFAIL`, or stay silent and let
/// the client's query timeout fire.
#[derive(Debug, Clone, Copy)]
pub(crate) enum MockFailure {
    ServFail,
    NoReply,
}

type Handler = dyn Fn(&Question) -> Result<Vec<wire::Answer>, MockFailure> + Send + Sync;

/// A name server double: binds an OS UDP socket on loopback and answers
/// every query through the handler closure, off any reactor.
pub(crate) struct DnsServerMock {
    addr: SocketAddr,
    queries: Arc<AtomicUsize>,
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl DnsServerMock {
    pub(crate) fn new(
        handler: impl Fn(&Question) -> Result<Vec<wire::Answer>, MockFailure>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        let socket =
            std::net::UdpSocket::bind("127.0.0.1:0").expect("failed to bind mock name server");
        socket
            .set_read_timeout(Some(Duration::from_millis(20)))
            .expect("failed to set mock read timeout");
        let addr = socket.local_addr().expect("mock has no local addr");

        let queries = Arc::new(AtomicUsize::new(0));
        let stop = Arc::new(AtomicBool::new(false));

        let handler: Arc<Handler> = Arc::new(handler);
        let queries2 = Arc::clone(&queries);
        let stop2 = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name("dns-server-mock".to_owned())
            .spawn(move || {
                let mut buf = [0u8; 4096];
                while !stop2.load(Ordering::Acquire) {
                    let (len, peer) = match socket.recv_from(&mut buf) {
                        Ok(received) => received,
                        Err(err)
                            if err.kind() == std::io::ErrorKind::WouldBlock
                                || err.kind() == std::io::ErrorKind::TimedOut =>
                        {
                            continue;
                        }
                        Err(_) => break,
                    };

                    let Ok((id, question)) = wire::parse_query(&buf[..len]) else {
                        continue;
                    };
                    queries2.fetch_add(1, Ordering::SeqCst);

                    let (rcode, answers) = match handler(&question) {
                        Ok(answers) => (wire::RCODE_NOERROR, answers),
                        Err(MockFailure::ServFail) => (wire::RCODE_SERVFAIL, Vec::new()),
                        Err(MockFailure::NoReply) => continue,
                    };
                    let Ok(response) = wire::encode_response(id, &question, rcode, &answers)
                    else {
                        continue;
                    };
                    let _ = socket.send_to(&response, peer);
                }
            })
            .expect("failed to spawn mock name server thread");

        Self {
            addr,
            queries,
            stop,
            thread: Some(thread),
        }
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Queries the mock has answered (any rcode).
    pub(crate) fn queries_handled(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

impl Drop for DnsServerMock {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
