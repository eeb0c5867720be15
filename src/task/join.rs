// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::Error;
use crate::task::{Id, TaskCell, pending_cancellation};
use futures::channel::oneshot;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

/// Owned handle to a spawned task.
///
/// There is exactly one joiner: awaiting consumes the handle, and the result
/// slot is readable exactly once. Dropping the handle without awaiting or
/// [`detach`](Self::detach)ing cancels the task.
///
/// Awaiting is itself a suspension point: it observes the *caller's*
/// cancellation, not just the joined task's completion.
#[must_use = "dropping a JoinHandle cancels the task; call `.detach()` to let it run"]
pub struct JoinHandle<T> {
    /// The frame may be recycled for a later task; `id` tells this handle's
    /// task apart from whatever lives in the frame now.
    id: Id,
    cell: Weak<TaskCell>,
    rx: oneshot::Receiver<Result<T, Error>>,
    detached: bool,
    /// Cleared for the blocking bridge, which defers the caller's
    /// cancellation until the blocking call has returned.
    check_caller_cancellation: bool,
}

impl<T> JoinHandle<T> {
    pub(crate) fn new(
        id: Id,
        cell: Weak<TaskCell>,
        rx: oneshot::Receiver<Result<T, Error>>,
    ) -> Self {
        Self {
            id,
            cell,
            rx,
            detached: false,
            check_caller_cancellation: true,
        }
    }

    /// The frame, provided it still hosts *this* task.
    fn cell_if_current(&self) -> Option<Arc<TaskCell>> {
        self.cell.upgrade().filter(|cell| cell.id() == self.id)
    }

    /// Request cooperative cancellation of the task.
    pub fn cancel(&self) {
        if let Some(cell) = self.cell_if_current() {
            cell.cancel_with(false);
        }
    }

    /// Whether the task has reached a terminal state.
    pub fn is_finished(&self) -> bool {
        match self.cell_if_current() {
            Some(cell) => cell.is_complete(),
            // The frame is gone or hosts another task; ours is certainly over.
            None => true,
        }
    }

    /// Let the task run to completion on its own; the result is discarded.
    pub fn detach(mut self) {
        self.detached = true;
    }

    /// Arm a reactor timer that cancels the task with the `Deadline` tag if
    /// it is still running at `deadline`.
    pub fn cancel_at(&self, reactor: &crate::reactor::ReactorHandle, deadline: std::time::Instant) {
        reactor.arm_cancel_at(self.cell.clone(), self.id, deadline);
    }

    pub(crate) fn without_caller_cancellation(mut self) -> Self {
        self.check_caller_cancellation = false;
        self
    }

    /// The error to report when the result slot was dropped unfilled: the
    /// task was torn down before completing, either by explicit cancellation
    /// or by a deadline.
    fn torn_down_error(&self) -> Error {
        match self.cell_if_current().and_then(|cell| cell.cancellation()) {
            Some(err) => err,
            None => Error::Cancelled,
        }
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.check_caller_cancellation
            && let Some(err) = pending_cancellation()
        {
            return Poll::Ready(Err(err));
        }

        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => {
                self.detached = true;
                Poll::Ready(result)
            }
            Poll::Ready(Err(oneshot::Canceled)) => {
                self.detached = true;
                Poll::Ready(Err(self.torn_down_error()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for JoinHandle<T> {
    fn drop(&mut self) {
        if !self.detached && !self.is_finished() {
            self.cancel();
        }
    }
}

impl<T> std::fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinHandle")
            .field("task", &self.id)
            .field("detached", &self.detached)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::block_on;
    use crate::test_util::fixture;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn join_returns_the_value() {
        let rt = fixture();
        let handle = rt.processor.spawn(async { 41 + 1 }).unwrap();
        assert_eq!(block_on(handle).unwrap(), 42);
    }

    #[test]
    fn dropping_the_joiner_cancels_the_task() {
        let rt = fixture();
        let observed = Arc::new(AtomicBool::new(false));
        let observed2 = Arc::clone(&observed);
        let reactor = rt.reactor.clone();

        let handle = rt
            .processor
            .spawn(async move {
                loop {
                    if reactor.sleep(Duration::from_millis(5)).await.is_err() {
                        observed2.store(true, Ordering::Release);
                        return;
                    }
                }
            })
            .unwrap();

        // let it reach the sleep at least once
        std::thread::sleep(Duration::from_millis(20));
        drop(handle);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !observed.load(Ordering::Acquire) {
            assert!(std::time::Instant::now() < deadline, "cancellation not observed");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn detached_task_completes_without_a_joiner() {
        let rt = fixture();
        let done = Arc::new(AtomicBool::new(false));
        let done2 = Arc::clone(&done);

        rt.processor
            .spawn(async move {
                done2.store(true, Ordering::Release);
            })
            .unwrap()
            .detach();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !done.load(Ordering::Acquire) {
            assert!(std::time::Instant::now() < deadline, "detached task never ran");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn cancel_before_first_poll_reports_cancelled() {
        let rt = fixture();
        let handle = rt
            .processor
            .spawn(async {
                crate::task::yield_now().await?;
                Ok::<_, crate::Error>(())
            })
            .unwrap();
        handle.cancel();
        // whichever way the race goes, the join must resolve; a cancelled
        // task that already ran resolves Ok(Err(Cancelled)) instead
        match block_on(handle) {
            Ok(Err(err)) | Err(err) => assert!(err.is_cancellation()),
            Ok(Ok(())) => {} // task won the race outright
        }
    }
}
