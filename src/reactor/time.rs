// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Deadline timers.
//!
//! Timers are reactor state: a slab of entries plus a min-heap keyed by
//! deadline. The reactor derives its poll timeout from the heap top and fires
//! due entries before every poll. Cancelled timers are removed from the slab
//! only — their heap nodes go stale and are skipped by sequence check when
//! they surface.

use crate::error::Error;
use crate::reactor::Shared;
use crate::task::TaskCell;
use pin_project::pin_project;
use slab::Slab;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};
use std::time::Instant;

#[derive(Debug)]
pub(crate) enum TimerTarget {
    /// Wake a parked future (a `Sleep`).
    Wake(Option<Waker>),
    /// Cancel a task with the `Deadline` tag. The id guards against the
    /// task's frame having been recycled by the time the timer fires.
    CancelTask(Weak<TaskCell>, crate::task::Id),
}

#[derive(Debug)]
struct TimerEntry {
    seq: u64,
    deadline: Instant,
    target: TimerTarget,
}

#[derive(Debug)]
pub(crate) struct TimerQueue {
    entries: Slab<TimerEntry>,
    heap: BinaryHeap<Reverse<(Instant, usize, u64)>>,
    next_seq: u64,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self {
            entries: Slab::new(),
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn insert(&mut self, deadline: Instant, target: TimerTarget) -> (usize, u64) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let key = self.entries.insert(TimerEntry {
            seq,
            deadline,
            target,
        });
        self.heap.push(Reverse((deadline, key, seq)));
        (key, seq)
    }

    fn is_live(&self, key: usize, seq: u64) -> bool {
        self.entries.get(key).is_some_and(|entry| entry.seq == seq)
    }

    fn store_waker(&mut self, key: usize, seq: u64, waker: Waker) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) if entry.seq == seq => {
                entry.target = TimerTarget::Wake(Some(waker));
                true
            }
            _ => false,
        }
    }

    fn remove(&mut self, key: usize, seq: u64) {
        if self.is_live(key, seq) {
            // the heap node goes stale and is skipped on surfacing
            self.entries.remove(key);
        }
    }

    /// Pop every entry whose deadline is at or before `now`.
    pub(crate) fn take_due(&mut self, now: Instant) -> Vec<TimerTarget> {
        let mut due = Vec::new();
        while let Some(Reverse((deadline, key, seq))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            if self.is_live(key, seq) {
                due.push(self.entries.remove(key).target);
            }
        }
        due
    }

    /// The nearest live deadline, skimming stale heap nodes off the top.
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, key, seq))) = self.heap.peek().copied() {
            if self.is_live(key, seq) {
                return Some(deadline);
            }
            self.heap.pop();
        }
        None
    }
}

/// Future returned by [`ReactorHandle::sleep`](crate::reactor::ReactorHandle::sleep)
/// and [`ReactorHandle::sleep_until`](crate::reactor::ReactorHandle::sleep_until).
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Sleep {
    shared: Arc<Shared>,
    deadline: Instant,
    registration: Option<(usize, u64)>,
}

impl Sleep {
    pub(crate) fn new(shared: Arc<Shared>, deadline: Instant) -> Self {
        Self {
            shared,
            deadline,
            registration: None,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

impl Future for Sleep {
    type Output = Result<(), Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(err) = crate::task::pending_cancellation() {
            return Poll::Ready(Err(err));
        }

        let mut state = self.shared.state().lock();
        match self.registration {
            None => {
                if self.deadline <= Instant::now() {
                    return Poll::Ready(Ok(()));
                }
                let registration = state
                    .timers
                    .insert(self.deadline, TimerTarget::Wake(Some(cx.waker().clone())));
                drop(state);
                self.registration = Some(registration);
                // the poller may be sleeping past our deadline; recompute
                self.shared.wake_poller();
                Poll::Pending
            }
            Some((key, seq)) => {
                if state.timers.store_waker(key, seq, cx.waker().clone()) {
                    Poll::Pending
                } else {
                    // fired and removed
                    Poll::Ready(Ok(()))
                }
            }
        }
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some((key, seq)) = self.registration.take() {
            self.shared.state().lock().timers.remove(key, seq);
        }
    }
}

impl std::fmt::Debug for Sleep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sleep")
            .field("deadline", &self.deadline)
            .field("registered", &self.registration.is_some())
            .finish()
    }
}

/// Future returned by [`ReactorHandle::timeout`](crate::reactor::ReactorHandle::timeout).
#[pin_project]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Timeout<F> {
    #[pin]
    sleep: Sleep,
    #[pin]
    future: F,
}

impl<F> Timeout<F> {
    pub(crate) fn new(sleep: Sleep, future: F) -> Self {
        Self { sleep, future }
    }

    /// Consumes this timeout, returning the underlying future.
    pub fn into_inner(self) -> F {
        self.future
    }
}

impl<F: Future> Future for Timeout<F> {
    type Output = Result<F::Output, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        if let Poll::Ready(value) = this.future.poll(cx) {
            return Poll::Ready(Ok(value));
        }

        match this.sleep.poll(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Err(Error::Deadline)),
            Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::block_on;
    use crate::test_util::fixture;
    use std::time::Duration;

    #[test]
    fn sleep_completes_after_its_duration() {
        let rt = fixture();
        let reactor = rt.reactor.clone();
        let handle = rt
            .processor
            .spawn(async move {
                let begin = Instant::now();
                reactor.sleep(Duration::from_millis(50)).await.unwrap();
                begin.elapsed()
            })
            .unwrap();
        let elapsed = block_on(handle).unwrap();
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(500), "wake latency too high");
    }

    #[test]
    fn many_sleepers_complete_promptly() {
        let rt = fixture();
        let begin = Instant::now();
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let reactor = rt.reactor.clone();
                rt.processor
                    .spawn(async move { reactor.sleep(Duration::from_millis(30)).await })
                    .unwrap()
            })
            .collect();
        for handle in handles {
            block_on(handle).unwrap().unwrap();
        }
        let elapsed = begin.elapsed();
        assert!(elapsed >= Duration::from_millis(30));
        // all sleepers run concurrently; epsilon covers scheduler wake latency
        assert!(elapsed < Duration::from_millis(600), "took {elapsed:?}");
    }

    #[test]
    fn timeout_fires_on_slow_futures() {
        let rt = fixture();
        let reactor = rt.reactor.clone();
        let handle = rt
            .processor
            .spawn(async move {
                let slow = reactor.sleep(Duration::from_secs(10));
                reactor.timeout(Duration::from_millis(20), slow).await
            })
            .unwrap();
        assert!(matches!(block_on(handle).unwrap(), Err(Error::Deadline)));
    }

    #[test]
    fn timeout_passes_fast_futures_through() {
        let rt = fixture();
        let reactor = rt.reactor.clone();
        let handle = rt
            .processor
            .spawn(async move {
                let fast = reactor.sleep(Duration::from_millis(5));
                reactor.timeout(Duration::from_secs(10), fast).await
            })
            .unwrap();
        assert!(matches!(block_on(handle).unwrap(), Ok(Ok(()))));
    }

    #[test]
    fn deadline_timer_cancels_the_task() {
        let rt = fixture();
        let reactor = rt.reactor.clone();
        let handle = rt
            .processor
            .spawn(async move {
                loop {
                    if let Err(err) = reactor.sleep(Duration::from_millis(5)).await {
                        return Err::<(), Error>(err);
                    }
                }
            })
            .unwrap();
        handle.cancel_at(&rt.reactor, Instant::now() + Duration::from_millis(30));
        let result = block_on(handle).unwrap();
        assert!(matches!(result, Err(Error::Deadline)));
    }
}
