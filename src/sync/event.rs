// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Typed broadcast to named subscribers.
//!
//! Publishing never runs callbacks synchronously: each subscriber has a
//! private event queue and a drain task spawned onto *its* processor, so one
//! subscriber's publish order is preserved and a slow subscriber backs up
//! only itself. Callback panics are trapped and logged.

use crate::exec::TaskProcessor;
use crate::task::panic_message;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct SubscriberQueue<E> {
    events: Mutex<QueueState<E>>,
}

struct QueueState<E> {
    events: VecDeque<E>,
    /// A drain task is live on the subscriber's processor.
    draining: bool,
    /// The subscriber scope dropped; discard what is left.
    closed: bool,
}

struct Subscriber<E> {
    id: u64,
    name: String,
    processor: TaskProcessor,
    callback: Callback<E>,
    queue: Arc<SubscriberQueue<E>>,
}

struct Inner<E> {
    name: &'static str,
    next_id: AtomicU64,
    subscribers: Mutex<Vec<Subscriber<E>>>,
}

/// Fan-out of typed events to named subscribers, each invoked on its own
/// task processor.
pub struct AsyncEventChannel<E> {
    inner: Arc<Inner<E>>,
}

impl<E> AsyncEventChannel<E>
where
    E: Clone + Send + Sync + 'static,
{
    /// `name` identifies the channel in logs.
    pub fn new(name: &'static str) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                next_id: AtomicU64::new(1),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register a subscriber. Names must be unique per channel; the returned
    /// scope unsubscribes on drop.
    ///
    /// # Panics
    ///
    /// Panics if `name` is already subscribed — duplicate subscriber names
    /// are a wiring bug, not a runtime condition.
    pub fn subscribe(
        &self,
        name: impl Into<String>,
        processor: &TaskProcessor,
        callback: impl Fn(&E) + Send + Sync + 'static,
    ) -> SubscriberScope<E> {
        self.subscribe_impl(name.into(), processor, Arc::new(callback), |_| {})
    }

    /// Subscribe and synchronously observe the current state first.
    ///
    /// `init` runs under the channel's subscriber lock *before* the
    /// subscriber is inserted, and `publish` takes the same lock — so the
    /// subscriber sees either the initial state or every subsequent event,
    /// never a gap. Pair `init` with an [`crate::sync::Rcu`] snapshot of the
    /// published state.
    pub fn update_and_listen(
        &self,
        name: impl Into<String>,
        processor: &TaskProcessor,
        callback: impl Fn(&E) + Send + Sync + 'static,
        init: impl FnOnce(&dyn Fn(&E)),
    ) -> SubscriberScope<E> {
        let callback: Callback<E> = Arc::new(callback);
        let callback2 = Arc::clone(&callback);
        self.subscribe_impl(name.into(), processor, callback, move |_| {
            init(&*callback2);
        })
    }

    fn subscribe_impl(
        &self,
        name: String,
        processor: &TaskProcessor,
        callback: Callback<E>,
        init: impl FnOnce(&Inner<E>),
    ) -> SubscriberScope<E> {
        let mut subscribers = self.inner.subscribers.lock();
        assert!(
            subscribers.iter().all(|sub| sub.name != name),
            "duplicate subscriber {name:?} on channel {:?}",
            self.inner.name,
        );

        init(&self.inner);

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        subscribers.push(Subscriber {
            id,
            name,
            processor: processor.clone(),
            callback,
            queue: Arc::new(SubscriberQueue {
                events: Mutex::new(QueueState {
                    events: VecDeque::new(),
                    draining: false,
                    closed: false,
                }),
            }),
        });
        drop(subscribers);

        SubscriberScope {
            channel: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Deliver `event` to every current subscriber, at most once each, on
    /// the subscriber's own processor.
    pub fn publish(&self, event: &E) {
        let subscribers = self.inner.subscribers.lock();
        for sub in subscribers.iter() {
            let spawn_drain = {
                let mut queue = sub.queue.events.lock();
                if queue.closed {
                    continue;
                }
                queue.events.push_back(event.clone());
                if queue.draining {
                    false
                } else {
                    queue.draining = true;
                    true
                }
            };

            if spawn_drain {
                let drain = DrainTask {
                    channel_name: self.inner.name,
                    subscriber_name: sub.name.clone(),
                    callback: Arc::clone(&sub.callback),
                    queue: Arc::clone(&sub.queue),
                };
                if let Err(err) = sub.processor.spawn_detached(async move { drain.run() }) {
                    tracing::error!(
                        channel = self.inner.name,
                        subscriber = %sub.name,
                        "failed to spawn event delivery task: {err}",
                    );
                    sub.queue.events.lock().draining = false;
                }
            }
        }
    }

    /// Current number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }
}

impl<E> std::fmt::Debug for AsyncEventChannel<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncEventChannel")
            .field("name", &self.inner.name)
            .field("subscribers", &self.inner.subscribers.lock().len())
            .finish()
    }
}

struct DrainTask<E> {
    channel_name: &'static str,
    subscriber_name: String,
    callback: Callback<E>,
    queue: Arc<SubscriberQueue<E>>,
}

impl<E> DrainTask<E> {
    /// Deliver queued events in order until the queue runs dry; the
    /// `draining` flag is cleared under the queue lock so a concurrent
    /// publish either sees it set or spawns the next drain itself.
    fn run(&self) {
        loop {
            let event = {
                let mut queue = self.queue.events.lock();
                if queue.closed {
                    queue.events.clear();
                    queue.draining = false;
                    return;
                }
                match queue.events.pop_front() {
                    Some(event) => event,
                    None => {
                        queue.draining = false;
                        return;
                    }
                }
            };

            let result = std::panic::catch_unwind(AssertUnwindSafe(|| (self.callback)(&event)));
            if let Err(payload) = result {
                tracing::error!(
                    channel = self.channel_name,
                    subscriber = %self.subscriber_name,
                    "event subscriber panicked: {}",
                    panic_message(payload.as_ref()),
                );
            }
        }
    }
}

/// Removes its subscriber from the channel on drop.
#[must_use = "dropping the scope unsubscribes immediately"]
pub struct SubscriberScope<E> {
    channel: Weak<Inner<E>>,
    id: u64,
}

impl<E> SubscriberScope<E> {
    /// Remove the subscription now instead of at drop.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl<E> Drop for SubscriberScope<E> {
    fn drop(&mut self) {
        let Some(inner) = self.channel.upgrade() else {
            return;
        };
        let mut subscribers = inner.subscribers.lock();
        if let Some(index) = subscribers.iter().position(|sub| sub.id == self.id) {
            let sub = subscribers.swap_remove(index);
            sub.queue.events.lock().closed = true;
        }
    }
}

impl<E> std::fmt::Debug for SubscriberScope<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberScope").field("id", &self.id).finish()
    }
}
