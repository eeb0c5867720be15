// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Read-mostly concurrent value with hazard-pointer reclamation.
//!
//! [`Rcu<T>`] keeps one current value behind an atomic pointer. Readers take
//! wait-free snapshots protected by hazard pointers; a writer mutates a
//! *copy* and commits it by swapping the pointer. The displaced value is
//! retired and freed once no hazard pointer references it — immediately if
//! unobserved, otherwise on a later commit or at variable drop.
//!
//! Hazard slots live in a process-wide registry with a lock-free free list.
//! A slot is claimed per snapshot and cleared when the snapshot drops, so a
//! slot can never vouch for a variable whose snapshots are gone; recreating a
//! variable in the same storage is safe (snapshots borrow the variable, which
//! the borrow checker enforces).

use crossbeam::queue::SegQueue;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard};
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, Ordering};

// === hazard-pointer registry ===

struct HazardSlot {
    protected: AtomicPtr<()>,
}

struct HazardRegistry {
    /// Every slot ever created, for writer scans.
    slots: Mutex<Vec<&'static HazardSlot>>,
    /// Slots not currently guarding a snapshot.
    free: SegQueue<&'static HazardSlot>,
}

static REGISTRY: Lazy<HazardRegistry> = Lazy::new(|| HazardRegistry {
    slots: Mutex::new(Vec::new()),
    free: SegQueue::new(),
});

impl HazardRegistry {
    fn acquire(&self) -> &'static HazardSlot {
        if let Some(slot) = self.free.pop() {
            return slot;
        }
        // Slots are leaked deliberately: the registry scans them for the
        // lifetime of the process and their count is bounded by the peak
        // number of concurrent snapshots.
        let slot: &'static HazardSlot = Box::leak(Box::new(HazardSlot {
            protected: AtomicPtr::new(std::ptr::null_mut()),
        }));
        self.slots.lock().push(slot);
        slot
    }

    fn release(&self, slot: &'static HazardSlot) {
        slot.protected.store(std::ptr::null_mut(), Ordering::SeqCst);
        self.free.push(slot);
    }

    fn is_protected(&self, ptr: *mut ()) -> bool {
        self.slots
            .lock()
            .iter()
            .any(|slot| slot.protected.load(Ordering::SeqCst) == ptr)
    }
}

// === Rcu ===

/// A read-mostly value: wait-free snapshots, copy-and-commit writes.
pub struct Rcu<T> {
    current: AtomicPtr<T>,
    /// Retired predecessors still awaiting reclamation. The mutex doubles as
    /// the writer lock: it is held from `start_write` until commit or drop.
    writer: Mutex<Vec<*mut T>>,
}

// Safety: `Rcu` hands out `&T` to many threads (Sync required) and moves `T`
// across threads on assign/drop (Send required). The raw pointers in the
// retire list are uniquely owned by the variable.
unsafe impl<T: Send + Sync> Send for Rcu<T> {}
// Safety: see above.
unsafe impl<T: Send + Sync> Sync for Rcu<T> {}

impl<T> Rcu<T> {
    pub fn new(value: T) -> Self {
        Self {
            current: AtomicPtr::new(Box::into_raw(Box::new(value))),
            writer: Mutex::new(Vec::new()),
        }
    }

    /// Take an owning read-side snapshot of the current value.
    ///
    /// Never suspends and never blocks on writers. The snapshot pins its
    /// value: holding one across long waits is legal but delays reclamation.
    pub fn read(&self) -> ReadPtr<'_, T> {
        let slot = REGISTRY.acquire();
        loop {
            let ptr = self.current.load(Ordering::SeqCst);
            slot.protected.store(ptr.cast(), Ordering::SeqCst);
            // Validate: if the pointer moved on between the load and the
            // hazard publication, the retiree may already be freed; retry.
            if self.current.load(Ordering::SeqCst) == ptr {
                // Safety: the hazard slot now protects `ptr` from
                // reclamation, and the validate load proves it was still
                // current after publication.
                let ptr = unsafe { NonNull::new_unchecked(ptr) };
                return ReadPtr {
                    ptr,
                    slot,
                    _variable: PhantomData,
                };
            }
        }
    }

    /// Replace the current value outright. Unlike [`Rcu::start_write`] this
    /// needs no `Clone` bound.
    pub fn assign(&self, value: T) {
        let mut retired = self.writer.lock();
        self.replace_locked(Box::into_raw(Box::new(value)), &mut retired);
    }

    fn replace_locked(&self, new: *mut T, retired: &mut Vec<*mut T>) {
        let old = self.current.swap(new, Ordering::SeqCst);
        retired.push(old);
        Self::scan(retired);
    }

    /// Free every retired value no hazard pointer vouches for; keep the rest
    /// for the next scan.
    fn scan(retired: &mut Vec<*mut T>) {
        retired.retain(|&ptr| {
            if REGISTRY.is_protected(ptr.cast()) {
                true
            } else {
                // Safety: the pointer came out of `Box::into_raw` on commit,
                // was swapped out of `current` exactly once, and no snapshot
                // references it.
                drop(unsafe { Box::from_raw(ptr) });
                false
            }
        });
    }
}

impl<T: Clone> Rcu<T> {
    /// Begin a write: clones the current value into a private copy. The
    /// writer lock is held until the returned pointer commits or drops, so
    /// writers serialize. Dropping without commit discards the copy with no
    /// observable effect.
    pub fn start_write(&self) -> WritePtr<'_, T> {
        let retired = self.writer.lock();
        // Safety: the writer lock is held, so the current value cannot be
        // retired (let alone freed) while we clone it.
        let copy = unsafe { (*self.current.load(Ordering::SeqCst)).clone() };
        WritePtr {
            variable: self,
            retired,
            copy: Some(Box::new(copy)),
        }
    }

    /// A fresh owned clone of the current value.
    pub fn read_copy(&self) -> T {
        self.read().clone()
    }
}

impl<T: Default> Default for Rcu<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> Drop for Rcu<T> {
    fn drop(&mut self) {
        // No snapshot can outlive the variable (they borrow it), so both the
        // retire list and the current value are exclusively ours.
        for ptr in self.writer.get_mut().drain(..) {
            // Safety: uniquely owned, see above.
            drop(unsafe { Box::from_raw(ptr) });
        }
        // Safety: uniquely owned, see above.
        drop(unsafe { Box::from_raw(*self.current.get_mut()) });
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Rcu<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Rcu").field(&*self.read()).finish()
    }
}

// === ReadPtr ===

/// An owning read-side snapshot; prevents reclamation of its value for its
/// lifetime.
pub struct ReadPtr<'a, T> {
    ptr: NonNull<T>,
    slot: &'static HazardSlot,
    _variable: PhantomData<&'a Rcu<T>>,
}

// Safety: a snapshot only hands out `&T`.
unsafe impl<T: Sync> Send for ReadPtr<'_, T> {}
// Safety: see above.
unsafe impl<T: Sync> Sync for ReadPtr<'_, T> {}

impl<T> Deref for ReadPtr<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the hazard slot keeps the value alive while the snapshot
        // exists.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> Drop for ReadPtr<'_, T> {
    fn drop(&mut self) {
        REGISTRY.release(self.slot);
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for ReadPtr<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ReadPtr").field(&**self).finish()
    }
}

// === WritePtr ===

/// A private, mutable copy of the value. Invisible to readers until
/// [`WritePtr::commit`]; discarded without effect on drop.
pub struct WritePtr<'a, T: Clone> {
    variable: &'a Rcu<T>,
    retired: MutexGuard<'a, Vec<*mut T>>,
    copy: Option<Box<T>>,
}

impl<T: Clone> WritePtr<'_, T> {
    /// Atomically publish the copy and retire the displaced value.
    pub fn commit(mut self) {
        let new = self
            .copy
            .take()
            .expect("write copy is present until commit");
        let old = self.variable.current.swap(Box::into_raw(new), Ordering::SeqCst);
        self.retired.push(old);
        Rcu::scan(&mut self.retired);
    }
}

impl<T: Clone> Deref for WritePtr<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.copy.as_ref().expect("write copy is present until commit")
    }
}

impl<T: Clone> DerefMut for WritePtr<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.copy.as_mut().expect("write copy is present until commit")
    }
}
