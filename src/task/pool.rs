// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Bounded recycling of task frames.
//!
//! With native `async`, the recyclable unit of a spawn is the frame: the
//! erased future slot plus the scheduling state word. The pool bounds how
//! many frames may be live at once (`max_frames`) and keeps a cache of
//! completed frames (`idle_limit`) so short-lived spawns reuse a warm
//! allocation instead of hitting the allocator.

use crate::error::Error;
use crate::task::TaskCell;
use crossbeam::queue::SegQueue;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone, Copy)]
pub struct FramePoolConfig {
    /// Hard cap on concurrently live tasks across all processors sharing the
    /// pool; spawns beyond it fail with [`Error::ResourceExhausted`].
    pub max_frames: usize,
    /// High-water mark of cached idle frames; surplus frames are freed on
    /// release.
    pub idle_limit: usize,
}

impl Default for FramePoolConfig {
    fn default() -> Self {
        Self {
            max_frames: 4096,
            idle_limit: 256,
        }
    }
}

pub struct FramePool {
    config: FramePoolConfig,
    live: AtomicUsize,
    idle: SegQueue<Arc<TaskCell>>,
    recycled: AtomicUsize,
}

impl FramePool {
    pub fn new(config: FramePoolConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            live: AtomicUsize::new(0),
            idle: SegQueue::new(),
            recycled: AtomicUsize::new(0),
        })
    }

    /// Take a frame for a new spawn, recycled if a warm one is available.
    pub(crate) fn acquire(&self) -> Result<Arc<TaskCell>, Error> {
        let mut live = self.live.load(Ordering::Relaxed);
        loop {
            if live >= self.config.max_frames {
                return Err(Error::ResourceExhausted("task frames"));
            }
            match self.live.compare_exchange_weak(
                live,
                live + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => live = observed,
            }
        }

        while let Some(cell) = self.idle.pop() {
            // A stale waker clone may still reference the frame; such frames
            // cannot be rearmed and are simply dropped.
            if Arc::strong_count(&cell) == 1 {
                self.recycled.fetch_add(1, Ordering::Relaxed);
                return Ok(cell);
            }
        }

        Ok(Arc::new(TaskCell::blank()))
    }

    /// Return a completed frame. Frames still referenced by wakers, and
    /// frames past the idle high-water mark, are dropped instead of cached.
    pub(crate) fn release(&self, cell: Arc<TaskCell>) {
        let prev = self.live.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "frame released twice");

        if self.idle.len() < self.config.idle_limit && Arc::strong_count(&cell) == 1 {
            cell.clear();
            self.idle.push(cell);
        }
    }

    /// Frames currently armed with a task.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Frames sitting warm in the cache.
    pub fn idle(&self) -> usize {
        self.idle.len()
    }

    #[cfg(test)]
    pub(crate) fn recycled(&self) -> usize {
        self.recycled.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for FramePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramePool")
            .field("max_frames", &self.config.max_frames)
            .field("idle_limit", &self.config.idle_limit)
            .field("live", &self.live())
            .field("idle", &self.idle())
            .finish()
    }
}
