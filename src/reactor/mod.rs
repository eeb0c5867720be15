// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The event reactor: one OS thread per reactor driving a `mio` poller over
//! registered sources plus a deadline min-heap.
//!
//! Readiness never executes user code on the reactor thread — it only wakes
//! the waiting task, which is then re-queued on the task's own processor.

mod time;

use crate::error::Error;
use crate::task::TaskCell;
use bitflags::bitflags;
use mio::event::Source;
use mio::{Events, Interest, Poll, Token};
use parking_lot::Mutex;
use slab::Slab;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll as TaskPoll, Waker};
use std::time::Instant;

pub use time::{Sleep, Timeout};

/// Token reserved for the reactor's own wakeup channel.
const WAKE_TOKEN: Token = Token(usize::MAX);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct Readiness: u8 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Read,
    Write,
}

impl Direction {
    fn as_readiness(self) -> Readiness {
        match self {
            Direction::Read => Readiness::READABLE,
            Direction::Write => Readiness::WRITABLE,
        }
    }
}

#[derive(Debug, Default)]
struct SourceEntry {
    readiness: Readiness,
    reader: Option<Waker>,
    writer: Option<Waker>,
}

impl Default for Readiness {
    fn default() -> Self {
        Readiness::empty()
    }
}

pub(crate) struct State {
    sources: Slab<SourceEntry>,
    timers: time::TimerQueue,
}

pub(crate) struct Shared {
    registry: mio::Registry,
    waker: mio::Waker,
    state: Mutex<State>,
    stop: AtomicBool,
}

/// Cheap handle to a reactor; everything callers need to register sources
/// and arm timers.
#[derive(Clone)]
pub struct ReactorHandle {
    shared: Arc<Shared>,
}

/// One event-loop thread. Owns its registrations for its whole lifetime.
pub struct Reactor {
    handle: ReactorHandle,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Reactor {
    pub fn new(index: usize) -> Result<Self, Error> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = mio::Waker::new(poll.registry(), WAKE_TOKEN)?;

        let shared = Arc::new(Shared {
            registry,
            waker,
            state: Mutex::new(State {
                sources: Slab::new(),
                timers: time::TimerQueue::new(),
            }),
            stop: AtomicBool::new(false),
        });

        let shared2 = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name(format!("reactor-{index}"))
            .spawn(move || reactor_main(poll, shared2))
            .map_err(Error::NetworkFailure)?;

        Ok(Self {
            handle: ReactorHandle { shared },
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }

    /// Stop the poll loop and join the reactor thread.
    pub fn stop(&mut self) {
        self.handle.shared.stop.store(true, Ordering::Release);
        let _ = self.handle.shared.waker.wake();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.handle.shared.state.lock();
        f.debug_struct("Reactor")
            .field("sources", &state.sources.len())
            .field("timers", &state.timers.len())
            .finish()
    }
}

fn reactor_main(mut poll: Poll, shared: Arc<Shared>) {
    let mut events = Events::with_capacity(1024);

    loop {
        if shared.stop.load(Ordering::Acquire) {
            break;
        }

        let timeout = shared.fire_due_timers();

        match poll.poll(&mut events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                tracing::error!("reactor poll failed: {err}");
                break;
            }
        }

        for event in events.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }
            shared.dispatch(event);
        }
    }
}

// === impl Shared ===

impl Shared {
    /// Fire every timer whose deadline passed; returns the poll timeout until
    /// the next armed deadline.
    fn fire_due_timers(&self) -> Option<std::time::Duration> {
        let now = Instant::now();
        let (due, next) = {
            let mut state = self.state.lock();
            (state.timers.take_due(now), state.timers.next_deadline())
        };
        for target in due {
            match target {
                time::TimerTarget::Wake(Some(waker)) => waker.wake(),
                time::TimerTarget::Wake(None) => {}
                time::TimerTarget::CancelTask(weak, id) => {
                    if let Some(cell) = weak.upgrade()
                        && cell.id() == id
                    {
                        tracing::trace!(task = %id, "deadline timer fired");
                        cell.cancel_with(true);
                    }
                }
            }
        }
        next.map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    fn dispatch(&self, event: &mio::event::Event) {
        let key = event.token().0;
        let (reader, writer) = {
            let mut state = self.state.lock();
            let Some(entry) = state.sources.get_mut(key) else {
                // deregistered while the event was in flight
                return;
            };
            let mut reader = None;
            let mut writer = None;
            if event.is_readable() || event.is_read_closed() {
                entry.readiness |= Readiness::READABLE;
                reader = entry.reader.take();
            }
            if event.is_writable() || event.is_write_closed() {
                entry.readiness |= Readiness::WRITABLE;
                writer = entry.writer.take();
            }
            (reader, writer)
        };
        if let Some(waker) = reader {
            waker.wake();
        }
        if let Some(waker) = writer {
            waker.wake();
        }
    }

    pub(crate) fn state(&self) -> &Mutex<State> {
        &self.state
    }

    pub(crate) fn wake_poller(&self) {
        let _ = self.waker.wake();
    }
}

// === impl ReactorHandle ===

impl ReactorHandle {
    /// Suspend for `duration`; wakes early with an error on cancellation.
    pub fn sleep(&self, duration: std::time::Duration) -> Sleep {
        self.sleep_until(Instant::now() + duration)
    }

    /// Suspend until `deadline`.
    pub fn sleep_until(&self, deadline: Instant) -> Sleep {
        Sleep::new(Arc::clone(&self.shared), deadline)
    }

    /// Require `future` to complete before `duration` elapses; resolves to
    /// [`Error::Deadline`] otherwise.
    pub fn timeout<F>(&self, duration: std::time::Duration, future: F) -> Timeout<F::IntoFuture>
    where
        F: IntoFuture,
    {
        Timeout::new(self.sleep(duration), future.into_future())
    }

    /// Arm a timer that cancels `task` with the `Deadline` tag. A task that
    /// completes earlier leaves a stale weak entry behind, which fires into
    /// nothing.
    pub(crate) fn arm_cancel_at(
        &self,
        task: Weak<TaskCell>,
        id: crate::task::Id,
        deadline: Instant,
    ) {
        let mut state = self.shared.state.lock();
        state
            .timers
            .insert(deadline, time::TimerTarget::CancelTask(task, id));
        drop(state);
        self.shared.wake_poller();
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl std::fmt::Debug for ReactorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactorHandle").finish_non_exhaustive()
    }
}

// === async source adapter ===

/// Owns a `mio` source registered with one reactor and exposes readiness as
/// cancellation-aware futures.
pub(crate) struct Async<S: Source> {
    source: S,
    key: usize,
    shared: Arc<Shared>,
}

impl<S: Source> Async<S> {
    pub(crate) fn new(handle: &ReactorHandle, mut source: S) -> Result<Self, Error> {
        let shared = Arc::clone(&handle.shared);
        let key = {
            let mut state = shared.state.lock();
            state.sources.insert(SourceEntry::default())
        };
        let registered = shared.registry.register(
            &mut source,
            Token(key),
            Interest::READABLE | Interest::WRITABLE,
        );
        if let Err(err) = registered {
            shared.state.lock().sources.remove(key);
            return Err(err.into());
        }
        Ok(Self {
            source,
            key,
            shared,
        })
    }

    pub(crate) fn source(&self) -> &S {
        &self.source
    }

    pub(crate) fn readiness(&self, direction: Direction) -> ReadinessFuture<'_, S> {
        ReadinessFuture {
            this: self,
            direction,
        }
    }
}

impl<S: Source> Drop for Async<S> {
    fn drop(&mut self) {
        let _ = self.shared.registry.deregister(&mut self.source);
        let mut state = self.shared.state.lock();
        if state.sources.contains(self.key) {
            state.sources.remove(self.key);
        }
    }
}

#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub(crate) struct ReadinessFuture<'a, S: Source> {
    this: &'a Async<S>,
    direction: Direction,
}

impl<S: Source> Future for ReadinessFuture<'_, S> {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> TaskPoll<Self::Output> {
        if let Some(err) = crate::task::pending_cancellation() {
            return TaskPoll::Ready(Err(err));
        }

        let bit = self.direction.as_readiness();
        let mut state = self.this.shared.state.lock();
        let entry = state
            .sources
            .get_mut(self.this.key)
            .expect("readiness polled after deregistration");
        if entry.readiness.contains(bit) {
            entry.readiness.remove(bit);
            return TaskPoll::Ready(Ok(()));
        }
        let slot = match self.direction {
            Direction::Read => &mut entry.reader,
            Direction::Write => &mut entry.writer,
        };
        *slot = Some(cx.waker().clone());
        TaskPoll::Pending
    }
}

// === UDP ===

/// Asynchronous UDP socket bound to one reactor.
pub struct UdpSocket {
    inner: Async<mio::net::UdpSocket>,
}

impl UdpSocket {
    pub fn bind(handle: &ReactorHandle, addr: std::net::SocketAddr) -> Result<Self, Error> {
        let socket = mio::net::UdpSocket::bind(addr)?;
        Ok(Self {
            inner: Async::new(handle, socket)?,
        })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr, Error> {
        Ok(self.inner.source().local_addr()?)
    }

    pub async fn send_to(
        &self,
        buf: &[u8],
        target: std::net::SocketAddr,
    ) -> Result<usize, Error> {
        loop {
            match self.inner.source().send_to(buf, target) {
                Ok(sent) => return Ok(sent),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    self.inner.readiness(Direction::Write).await?;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub async fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> Result<(usize, std::net::SocketAddr), Error> {
        loop {
            match self.inner.source().recv_from(buf) {
                Ok(received) => return Ok(received),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    self.inner.readiness(Direction::Read).await?;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

impl std::fmt::Debug for UdpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpSocket")
            .field("local_addr", &self.inner.source().local_addr().ok())
            .finish()
    }
}

// === reactor pool ===

/// The configured set of event-loop threads, handed out round-robin.
pub struct ReactorPool {
    reactors: Vec<Reactor>,
    next: AtomicUsize,
}

impl ReactorPool {
    pub fn new(threads: usize) -> Result<Self, Error> {
        let reactors = (0..threads.max(1))
            .map(Reactor::new)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            reactors,
            next: AtomicUsize::new(0),
        })
    }

    pub fn handle(&self) -> ReactorHandle {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.reactors.len();
        self.reactors[index].handle()
    }

    pub fn stop_all(&mut self) {
        for reactor in &mut self.reactors {
            reactor.stop();
        }
    }
}

impl std::fmt::Debug for ReactorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactorPool")
            .field("threads", &self.reactors.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::block_on;
    use crate::test_util::fixture;
    use std::net::{Ipv4Addr, SocketAddr};

    fn loopback() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
    }

    #[test]
    fn udp_round_trip_through_the_reactor() {
        let rt = fixture();
        let a = UdpSocket::bind(&rt.reactor, loopback()).unwrap();
        let b = UdpSocket::bind(&rt.reactor, loopback()).unwrap();
        let addr_b = b.local_addr().unwrap();

        let handle = rt
            .processor
            .spawn(async move {
                a.send_to(b"ping", addr_b).await.unwrap();
                let mut buf = [0u8; 16];
                let (len, from) = b.recv_from(&mut buf).await.unwrap();
                (buf[..len].to_vec(), from)
            })
            .unwrap();

        let (payload, _from) = block_on(handle).unwrap();
        assert_eq!(payload, b"ping");
    }

    #[test]
    fn reactor_pool_round_robins_handles() {
        let mut pool = ReactorPool::new(2).unwrap();
        let a = pool.handle();
        let b = pool.handle();
        let c = pool.handle();
        assert!(!Arc::ptr_eq(a.shared(), b.shared()));
        assert!(Arc::ptr_eq(a.shared(), c.shared()));
        pool.stop_all();
    }
}
