// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Task processors: named pools of worker threads executing tasks.
//!
//! Intake is a single FIFO injector per processor, so queued tasks are
//! observed in arrival order. Each worker keeps a local deque it fills in
//! batches from the injector; when both run dry it steals half a batch from a
//! random sibling *of the same processor* — a task pinned to processor P only
//! ever runs on P's workers. Out of work entirely, the worker parks on the
//! processor's parking lot.

use crate::config::TaskProcessorConfig;
use crate::error::Error;
use crate::park::{ParkingLot, ThreadUnparker};
use crate::reactor::ReactorHandle;
use crate::task::{FramePool, Id, JoinHandle, NO_REGISTRY_KEY, TaskCell, panic_message};
use crossbeam::deque::{Injector, Steal, Stealer, Worker};
use futures::FutureExt;
use futures::channel::oneshot;
use parking_lot::Mutex;
use slab::Slab;
use std::cell::RefCell;
use std::panic::AssertUnwindSafe;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

pub(crate) struct ProcInner {
    name: String,
    blocking: bool,
    injector: Injector<Arc<TaskCell>>,
    stealers: Vec<Stealer<Arc<TaskCell>>>,
    lot: ParkingLot,
    stop: AtomicBool,
    frame_pool: Arc<FramePool>,
    reactor: ReactorHandle,
    /// Weak handles to every live task, for shutdown cancellation.
    tasks: Mutex<Slab<Weak<TaskCell>>>,
    live: AtomicUsize,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

thread_local! {
    static CURRENT_PROC: RefCell<Option<Arc<ProcInner>>> = const { RefCell::new(None) };
}

/// A named pool of worker threads executing coroutine-style tasks.
///
/// Cheap to clone; all clones refer to the same pool.
#[derive(Clone)]
pub struct TaskProcessor {
    inner: Arc<ProcInner>,
}

impl TaskProcessor {
    /// Spin up the processor's worker threads.
    pub fn build(
        config: &TaskProcessorConfig,
        frame_pool: Arc<FramePool>,
        reactor: ReactorHandle,
    ) -> Result<Self, Error> {
        let worker_count = config.worker_threads.max(1);
        let workers: Vec<Worker<Arc<TaskCell>>> =
            (0..worker_count).map(|_| Worker::new_fifo()).collect();
        let stealers = workers.iter().map(Worker::stealer).collect();

        let inner = Arc::new(ProcInner {
            name: config.name.clone(),
            blocking: config.blocking,
            injector: Injector::new(),
            stealers,
            lot: ParkingLot::new(),
            stop: AtomicBool::new(false),
            frame_pool,
            reactor,
            tasks: Mutex::new(Slab::new()),
            live: AtomicUsize::new(0),
            threads: Mutex::new(Vec::with_capacity(worker_count)),
        });

        for (index, local) in workers.into_iter().enumerate() {
            let inner2 = Arc::clone(&inner);
            let spawned = std::thread::Builder::new()
                .name(format!("{}-{index}", config.name))
                .spawn(move || worker_main(inner2, index, local));
            match spawned {
                Ok(thread) => inner.threads.lock().push(thread),
                Err(err) => {
                    // unwind the workers that did start, or they park on
                    // `inner` forever
                    inner.stop.store(true, Ordering::Release);
                    inner.lot.unpark_all();
                    let threads = std::mem::take(&mut *inner.threads.lock());
                    for thread in threads {
                        let _ = thread.join();
                    }
                    return Err(Error::NetworkFailure(err));
                }
            }
        }

        Ok(Self { inner })
    }

    /// The processor on whose worker the caller runs; `None` off-worker.
    pub fn current() -> Option<TaskProcessor> {
        CURRENT_PROC.with(|p| p.borrow().clone().map(|inner| TaskProcessor { inner }))
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether this processor is configured for blocking workloads.
    pub fn is_blocking(&self) -> bool {
        self.inner.blocking
    }

    pub fn reactor(&self) -> &ReactorHandle {
        &self.inner.reactor
    }

    pub fn frame_pool(&self) -> &Arc<FramePool> {
        &self.inner.frame_pool
    }

    /// Enqueue a new task; returns a joinable handle.
    ///
    /// # Errors
    ///
    /// [`Error::ResourceExhausted`] when the frame pool is at capacity,
    /// [`Error::Cancelled`] when the processor is shutting down.
    pub fn spawn<F>(&self, future: F) -> Result<JoinHandle<F::Output>, Error>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.spawn_on(future)
    }

    /// Enqueue a task whose result is discarded; panics are logged.
    pub fn spawn_detached<F>(&self, future: F) -> Result<(), Error>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let name = self.inner.name.clone();
        let detached = async move {
            if let Err(payload) = AssertUnwindSafe(future).catch_unwind().await {
                tracing::error!(
                    processor = %name,
                    "detached task panicked: {}",
                    panic_message(payload.as_ref()),
                );
            }
        };
        self.inner.spawn_on(detached)?.detach();
        Ok(())
    }

    /// Tasks currently live on this processor (queued, running or suspended).
    pub fn live_tasks(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }

    /// Cooperatively cancel every live task.
    pub fn cancel_all(&self) {
        let cells: Vec<Arc<TaskCell>> = {
            let tasks = self.inner.tasks.lock();
            tasks.iter().filter_map(|(_, weak)| weak.upgrade()).collect()
        };
        for cell in cells {
            cell.cancel_with(false);
        }
    }

    /// Busy-wait (with millisecond naps) until no task is live or the
    /// deadline passes. Returns whether the processor drained.
    pub fn wait_idle(&self, deadline: Instant) -> bool {
        loop {
            if self.live_tasks() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Signal workers to finish their current task and exit. Tasks still in
    /// the queues complete their result slots with `Cancelled`.
    pub fn stop(&self) {
        self.inner.stop.store(true, Ordering::Release);
        self.inner.lot.unpark_all();
    }

    /// Join the worker threads. Must be preceded by [`Self::stop`].
    pub fn join(&self) {
        let threads = std::mem::take(&mut *self.inner.threads.lock());
        for thread in threads {
            let _ = thread.join();
        }
    }
}

impl std::fmt::Debug for TaskProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskProcessor")
            .field("name", &self.inner.name)
            .field("workers", &self.inner.stealers.len())
            .field("blocking", &self.inner.blocking)
            .field("live_tasks", &self.live_tasks())
            .finish()
    }
}

// === impl ProcInner ===

impl ProcInner {
    pub(crate) fn spawn_on<F>(self: &Arc<Self>, future: F) -> Result<JoinHandle<F::Output>, Error>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.stop.load(Ordering::Acquire) {
            return Err(Error::Cancelled);
        }

        let cell = self.frame_pool.acquire()?;
        let (tx, rx) = oneshot::channel();

        let wrapped = async move {
            let result = AssertUnwindSafe(future).catch_unwind().await;
            let outcome =
                result.map_err(|payload| Error::Panicked(panic_message(payload.as_ref())));
            let _ = tx.send(outcome);
        };

        let id = Id::next();
        cell.rearm(id, Box::pin(wrapped), Arc::clone(self));

        let key = self.tasks.lock().insert(Arc::downgrade(&cell));
        cell.registry_key.store(key, Ordering::Relaxed);
        self.live.fetch_add(1, Ordering::AcqRel);

        let handle = JoinHandle::new(id, Arc::downgrade(&cell), rx);
        self.schedule(cell);
        Ok(handle)
    }

    /// Push a runnable task onto the processor's intake and wake a worker.
    pub(crate) fn schedule(self: &Arc<Self>, cell: Arc<TaskCell>) {
        if self.stop.load(Ordering::Acquire) {
            self.retire_cell(cell);
            return;
        }
        self.injector.push(cell);
        self.lot.unpark_one();
    }

    fn deregister(&self, cell: &TaskCell) {
        let key = cell.registry_key.swap(NO_REGISTRY_KEY, Ordering::Relaxed);
        if key != NO_REGISTRY_KEY {
            self.tasks.lock().try_remove(key);
            self.live.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Tear a task down without running it and recycle its frame.
    fn retire_cell(&self, cell: Arc<TaskCell>) {
        self.deregister(&cell);
        cell.shut_down();
        self.frame_pool.release(cell);
    }
}

// === worker loop ===

fn worker_main(inner: Arc<ProcInner>, index: usize, local: Worker<Arc<TaskCell>>) {
    let _span = tracing::debug_span!("worker", processor = %inner.name, index).entered();
    CURRENT_PROC.with(|p| *p.borrow_mut() = Some(Arc::clone(&inner)));
    let mut rng = fastrand::Rng::new();

    loop {
        while let Some(cell) = next_task(&inner, index, &local, &mut rng) {
            run_cell(&inner, cell);
            if inner.stop.load(Ordering::Acquire) {
                break;
            }
        }

        if inner.stop.load(Ordering::Acquire) {
            break;
        }

        inner
            .lot
            .park_if(|| inner.injector.is_empty() && !inner.stop.load(Ordering::Acquire));
    }

    tracing::debug!("stop signal received, shutting down");

    // Drain what is left so every queued task resolves its joiner.
    while let Some(cell) = local.pop() {
        inner.retire_cell(cell);
    }
    loop {
        match inner.injector.steal() {
            Steal::Success(cell) => inner.retire_cell(cell),
            Steal::Empty => break,
            Steal::Retry => continue,
        }
    }

    CURRENT_PROC.with(|p| *p.borrow_mut() = None);
}

fn next_task(
    inner: &ProcInner,
    index: usize,
    local: &Worker<Arc<TaskCell>>,
    rng: &mut fastrand::Rng,
) -> Option<Arc<TaskCell>> {
    if let Some(cell) = local.pop() {
        return Some(cell);
    }

    loop {
        match inner.injector.steal_batch_and_pop(local) {
            Steal::Success(cell) => return Some(cell),
            Steal::Empty => break,
            Steal::Retry => continue,
        }
    }

    // Nothing queued: try to steal from a random sibling.
    let num_workers = inner.stealers.len();
    if num_workers <= 1 {
        return None;
    }
    let start = rng.usize(..num_workers);
    for offset in 0..num_workers {
        let victim = (start + offset) % num_workers;
        if victim == index {
            continue;
        }
        loop {
            match inner.stealers[victim].steal_batch_and_pop(local) {
                Steal::Success(cell) => return Some(cell),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }
    }

    None
}

fn run_cell(inner: &Arc<ProcInner>, cell: Arc<TaskCell>) {
    let completed = cell.run();
    if completed {
        inner.deregister(&cell);
        inner.frame_pool.release(cell);
    }
}

// === blocking bridge ===

/// Execute `f` on a processor configured for blocking workloads; the calling
/// task suspends until the closure returns.
///
/// The caller's cancellation is deliberately *not* observed while the closure
/// runs — a blocking call cannot be interrupted cooperatively — so the bridge
/// resolves with the closure's result and leaves the cancellation to the
/// caller's next suspension point.
///
/// # Errors
///
/// [`Error::Invariant`] when `blocking` is a regular processor; spawn errors
/// as for [`TaskProcessor::spawn`].
pub async fn blocking_bridge<T, F>(blocking: &TaskProcessor, f: F) -> Result<T, Error>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    if !blocking.is_blocking() {
        return Err(Error::Invariant(
            "blocking_bridge requires a blocking task processor",
        ));
    }
    let handle = blocking.spawn(async move { f() })?;
    handle.without_caller_cancellation().await
}

// === block_on ===

/// Drive a future to completion on the calling (non-worker) thread, parking
/// between polls. The main entry point for tests and the manager to wait on
/// work running on the processors.
pub fn block_on<F: Future>(future: F) -> F::Output {
    let unparker = ThreadUnparker::for_current();
    let waker = unparker.waker();
    let mut cx = Context::from_waker(&waker);
    let mut future = pin!(future);

    loop {
        if let Poll::Ready(value) = future.as_mut().poll(&mut cx) {
            return value;
        }
        unparker.park();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::FramePoolConfig;
    use crate::test_util::fixture;
    use std::collections::HashSet;

    #[test]
    fn spawn_runs_on_a_named_worker() {
        let rt = fixture();
        let handle = rt
            .processor
            .spawn(async {
                let name = std::thread::current().name().map(str::to_owned);
                let proc = TaskProcessor::current().map(|p| p.name().to_owned());
                (name, proc)
            })
            .unwrap();
        let (thread_name, proc_name) = block_on(handle).unwrap();
        assert!(thread_name.unwrap().starts_with("test-proc-"));
        assert_eq!(proc_name.as_deref(), Some("test-proc"));
    }

    #[test]
    fn many_tasks_complete_across_workers() {
        let rt = fixture();
        let handles: Vec<_> = (0..64)
            .map(|i| {
                rt.processor
                    .spawn(async move {
                        crate::task::yield_now().await.unwrap();
                        i
                    })
                    .unwrap()
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            seen.insert(block_on(handle).unwrap());
        }
        assert_eq!(seen.len(), 64);
    }

    #[test]
    fn result_slot_completes_exactly_once() {
        let rt = fixture();
        let handle = rt.processor.spawn(async { 5usize }).unwrap();
        // the handle is the single joiner; consuming it consumes the slot
        assert_eq!(block_on(handle).unwrap(), 5);
    }

    #[test]
    fn blocking_bridge_runs_off_the_calling_processor() {
        let rt = fixture();
        let blocking = TaskProcessor::build(
            &TaskProcessorConfig {
                name: "fs-proc".to_owned(),
                worker_threads: 1,
                blocking: true,
            },
            FramePool::new(FramePoolConfig::default()),
            rt.reactor.clone(),
        )
        .unwrap();

        let blocking2 = blocking.clone();
        let handle = rt
            .processor
            .spawn(async move {
                blocking_bridge(&blocking2, || {
                    std::thread::sleep(Duration::from_millis(10));
                    std::thread::current().name().map(str::to_owned)
                })
                .await
                .unwrap()
            })
            .unwrap();

        let ran_on = block_on(handle).unwrap().unwrap();
        assert!(ran_on.starts_with("fs-proc-"));

        blocking.stop();
        blocking.join();
    }

    #[test]
    fn bridge_to_regular_processor_is_rejected() {
        let rt = fixture();
        let proc = rt.processor.clone();
        let handle = rt
            .processor
            .spawn(async move { blocking_bridge(&proc, || 1).await })
            .unwrap();
        assert!(matches!(
            block_on(handle).unwrap(),
            Err(Error::Invariant(_))
        ));
    }

    #[test]
    fn stopped_processor_rejects_spawns_and_drains_queues() {
        let rt = fixture();
        rt.processor.stop();
        rt.processor.join();
        assert!(matches!(
            rt.processor.spawn(async {}),
            Err(Error::Cancelled)
        ));
    }
}
