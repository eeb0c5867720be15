// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Worker-thread parking.
//!
//! A [`ParkingLot`] is shared by the worker threads of one task processor.
//! Workers park when they run out of work; enqueuing a task unparks one of
//! them. Wakeups are counted, so an unpark that races a worker on its way to
//! sleep is never lost: the worker consumes the pending signal instead of
//! blocking.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::Waker;
use std::thread::Thread;

#[derive(Debug, Default)]
pub(crate) struct ParkingLot {
    state: Mutex<LotState>,
    cv: Condvar,
}

#[derive(Debug, Default)]
struct LotState {
    sleeping: usize,
    signals: usize,
}

impl ParkingLot {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Park the calling worker while `should_sleep` holds and no wake signal
    /// is pending. `should_sleep` is evaluated under the lot lock, so any
    /// enqueue that happened before the matching [`Self::unpark_one`] is
    /// visible to it.
    pub(crate) fn park_if(&self, should_sleep: impl Fn() -> bool) {
        let mut state = self.state.lock();
        if state.signals > 0 {
            state.signals -= 1;
            return;
        }
        if !should_sleep() {
            return;
        }
        state.sleeping += 1;
        loop {
            self.cv.wait(&mut state);
            if state.signals > 0 {
                state.signals -= 1;
                break;
            }
            if !should_sleep() {
                break;
            }
        }
        state.sleeping -= 1;
    }

    pub(crate) fn unpark_one(&self) {
        let mut state = self.state.lock();
        if state.sleeping > state.signals {
            state.signals += 1;
            self.cv.notify_one();
        }
    }

    pub(crate) fn unpark_all(&self) {
        let state = self.state.lock();
        drop(state);
        self.cv.notify_all();
    }

    pub(crate) fn num_parked(&self) -> usize {
        self.state.lock().sleeping
    }
}

/// Wakes a plain OS thread blocked in [`std::thread::park`]; backs
/// [`crate::exec::block_on`] on non-worker threads.
#[derive(Debug)]
pub(crate) struct ThreadUnparker {
    thread: Thread,
    notified: AtomicBool,
}

impl ThreadUnparker {
    pub(crate) fn for_current() -> Arc<Self> {
        Arc::new(Self {
            thread: std::thread::current(),
            notified: AtomicBool::new(false),
        })
    }

    pub(crate) fn waker(self: &Arc<Self>) -> Waker {
        futures::task::waker(Arc::clone(self))
    }

    /// Park the owning thread until a wake arrives. Consumes the wake token.
    pub(crate) fn park(&self) {
        while !self.notified.swap(false, Ordering::Acquire) {
            std::thread::park();
        }
    }
}

impl futures::task::ArcWake for ThreadUnparker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.notified.store(true, Ordering::Release);
        arc_self.thread.unpark();
    }
}

static_assertions::assert_impl_all!(ThreadUnparker: Send, Sync);
