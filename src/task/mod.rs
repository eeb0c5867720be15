// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The task harness.
//!
//! A task is an erased future inside a reference-counted [`TaskCell`] with an
//! atomic state machine deciding when the cell is (re-)enqueued on its owning
//! processor. The state machine guarantees at-most-one enqueue per wake burst
//! and exactly-once completion:
//!
//! ```text
//!           wake                     poll -> Pending
//!  Idle ----------> Queued -> Running ---------------> Idle
//!                      ^         | \----> Notified --> Queued (requeue)
//!                      |         |  poll -> Ready
//!                      +---------+-------------------> Complete
//! ```
//!
//! Cancellation is edge-triggered and cooperative: [`TaskCell::cancel_with`]
//! latches a reason and wakes the task; every suspension point in the crate
//! calls [`pending_cancellation`] on poll and resolves to the latched error.

mod id;
mod join;
mod pool;

use crate::error::Error;
use crate::exec::ProcInner;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::task::{Context, Poll};

pub use id::Id;
pub use join::JoinHandle;
pub use pool::{FramePool, FramePoolConfig};

pub(crate) const STATE_IDLE: u8 = 0;
pub(crate) const STATE_QUEUED: u8 = 1;
pub(crate) const STATE_RUNNING: u8 = 2;
pub(crate) const STATE_NOTIFIED: u8 = 3;
pub(crate) const STATE_COMPLETE: u8 = 4;

const CANCEL_NONE: u8 = 0;
const CANCEL_REQUESTED: u8 = 1;
const CANCEL_DEADLINE: u8 = 2;

pub(crate) const NO_REGISTRY_KEY: usize = usize::MAX;

/// One task frame: the erased future plus the scheduling state.
///
/// Frames are fixed-shape so the pool can recycle a completed frame for any
/// later spawn; see [`FramePool`].
pub(crate) struct TaskCell {
    id: AtomicU64,
    state: AtomicU8,
    cancel: AtomicU8,
    /// Key into the owning processor's task registry, [`NO_REGISTRY_KEY`]
    /// while unregistered.
    pub(crate) registry_key: AtomicUsize,
    future: Mutex<Option<BoxFuture<'static, ()>>>,
    processor: Mutex<Option<Arc<ProcInner>>>,
}

impl std::fmt::Debug for TaskCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskCell")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("cancel", &self.cancel)
            .field("registry_key", &self.registry_key)
            .finish_non_exhaustive()
    }
}

static_assertions::assert_impl_all!(TaskCell: Send, Sync);

impl TaskCell {
    pub(crate) fn blank() -> Self {
        Self {
            id: AtomicU64::new(0),
            state: AtomicU8::new(STATE_COMPLETE),
            cancel: AtomicU8::new(CANCEL_NONE),
            registry_key: AtomicUsize::new(NO_REGISTRY_KEY),
            future: Mutex::new(None),
            processor: Mutex::new(None),
        }
    }

    /// Arm a (fresh or recycled) frame for a new spawn. The cell leaves in
    /// `Queued` state; the caller must hand it to the processor's run queue.
    pub(crate) fn rearm(&self, id: Id, future: BoxFuture<'static, ()>, processor: Arc<ProcInner>) {
        self.id.store(id.as_u64(), Ordering::Relaxed);
        self.cancel.store(CANCEL_NONE, Ordering::Relaxed);
        self.registry_key.store(NO_REGISTRY_KEY, Ordering::Relaxed);
        *self.future.lock() = Some(future);
        *self.processor.lock() = Some(processor);
        self.state.store(STATE_QUEUED, Ordering::Release);
    }

    /// Drop everything the frame borrowed from its previous task.
    pub(crate) fn clear(&self) {
        *self.future.lock() = None;
        *self.processor.lock() = None;
    }

    pub(crate) fn id(&self) -> Id {
        Id::from_u64(self.id.load(Ordering::Relaxed))
    }

    pub(crate) fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.state() == STATE_COMPLETE
    }

    pub(crate) fn processor(&self) -> Option<Arc<ProcInner>> {
        self.processor.lock().clone()
    }

    /// Latch a cancellation reason (first one wins) and wake the task so it
    /// observes the flag at its next suspension point.
    pub(crate) fn cancel_with(self: &Arc<Self>, deadline: bool) {
        let reason = if deadline { CANCEL_DEADLINE } else { CANCEL_REQUESTED };
        let _ = self.cancel.compare_exchange(
            CANCEL_NONE,
            reason,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.wake_task();
    }

    pub(crate) fn cancellation(&self) -> Option<Error> {
        match self.cancel.load(Ordering::Acquire) {
            CANCEL_REQUESTED => Some(Error::Cancelled),
            CANCEL_DEADLINE => Some(Error::Deadline),
            _ => None,
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire) != CANCEL_NONE
    }

    /// Transition for a wake: enqueue if idle, mark notified if mid-poll,
    /// otherwise nothing to do.
    pub(crate) fn wake_task(self: &Arc<Self>) {
        loop {
            match self.state.load(Ordering::Acquire) {
                STATE_IDLE => {
                    if self
                        .state
                        .compare_exchange(
                            STATE_IDLE,
                            STATE_QUEUED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        self.enqueue();
                        return;
                    }
                }
                STATE_RUNNING => {
                    if self
                        .state
                        .compare_exchange(
                            STATE_RUNNING,
                            STATE_NOTIFIED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return;
                    }
                }
                // Queued and Notified wakes coalesce; Complete wakes are stale.
                _ => return,
            }
        }
    }

    fn enqueue(self: &Arc<Self>) {
        if let Some(proc) = self.processor() {
            proc.schedule(Arc::clone(self));
        } else {
            // The owning processor is gone; the task can never run again.
            tracing::debug!(task = %self.id(), "woke a task whose processor is gone");
            self.shut_down();
        }
    }

    /// Poll the task once. Returns `true` when the task reached `Complete`
    /// and its frame may be recycled.
    ///
    /// Must only be called with the cell in `Queued` state, from a worker
    /// thread of the owning processor.
    pub(crate) fn run(self: &Arc<Self>) -> bool {
        if self
            .state
            .compare_exchange(
                STATE_QUEUED,
                STATE_RUNNING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            // Shut down while sitting in the queue.
            return true;
        }

        let _current = CurrentGuard::enter(self);
        let waker = futures::task::waker_ref(self);
        let mut cx = Context::from_waker(&waker);

        let poll = {
            let mut slot = self.future.lock();
            match slot.as_mut() {
                Some(future) => {
                    let poll = future.as_mut().poll(&mut cx);
                    if poll.is_ready() {
                        *slot = None;
                    }
                    poll
                }
                None => Poll::Ready(()),
            }
        };

        match poll {
            Poll::Ready(()) => {
                self.state.store(STATE_COMPLETE, Ordering::Release);
                true
            }
            Poll::Pending => {
                match self.state.compare_exchange(
                    STATE_RUNNING,
                    STATE_IDLE,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => false,
                    Err(_) => {
                        // A wake arrived during the poll; requeue ourselves.
                        self.state.store(STATE_QUEUED, Ordering::Release);
                        self.enqueue();
                        false
                    }
                }
            }
        }
    }

    /// Terminal transition for a task that will never be polled (again):
    /// drops the future, which completes the result slot with `Cancelled`.
    pub(crate) fn shut_down(&self) {
        let future = self.future.lock().take();
        drop(future);
        let _ = self.cancel.compare_exchange(
            CANCEL_NONE,
            CANCEL_REQUESTED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.state.store(STATE_COMPLETE, Ordering::Release);
    }
}

impl futures::task::ArcWake for TaskCell {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.wake_task();
    }
}

// === current-task context ===

thread_local! {
    static CURRENT: RefCell<Option<Arc<TaskCell>>> = const { RefCell::new(None) };
}

/// Restores the previous current-task pointer on drop, so nested polls on the
/// same worker (e.g. `block_on` inside tests) stay balanced.
pub(crate) struct CurrentGuard {
    prev: Option<Arc<TaskCell>>,
}

impl CurrentGuard {
    fn enter(cell: &Arc<TaskCell>) -> Self {
        let prev = CURRENT.with(|c| c.replace(Some(Arc::clone(cell))));
        Self { prev }
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        CURRENT.with(|c| {
            *c.borrow_mut() = self.prev.take();
        });
    }
}

pub(crate) fn current_cell() -> Option<Arc<TaskCell>> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Handle to the task the calling code runs inside of.
#[derive(Clone)]
pub struct CurrentTask {
    cell: Arc<TaskCell>,
}

impl CurrentTask {
    pub fn id(&self) -> Id {
        self.cell.id()
    }

    /// Request cooperative cancellation of this task.
    pub fn cancel(&self) {
        self.cell.cancel_with(false);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cell.is_cancelled()
    }
}

/// The task the caller is running inside of, `None` on non-worker threads and
/// outside of task polls.
pub fn current() -> Option<CurrentTask> {
    current_cell().map(|cell| CurrentTask { cell })
}

/// The latched cancellation error of the current task, if any. Suspension
/// points call this on every poll.
pub(crate) fn pending_cancellation() -> Option<Error> {
    current_cell().and_then(|cell| cell.cancellation())
}

/// Explicit cancellation point: `Err` once the current task is cancelled.
pub fn cancellation_point() -> Result<(), Error> {
    match pending_cancellation() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Yields the worker to the next ready task; completes on the following poll.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

#[derive(Debug)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = Result<(), Error>;

    fn poll(mut self: std::pin::Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(err) = pending_cancellation() {
            return Poll::Ready(Err(err));
        }
        if self.yielded {
            Poll::Ready(Ok(()))
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
