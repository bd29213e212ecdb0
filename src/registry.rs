// Copyright 2024 The onefile-stm authors
// SPDX-License-Identifier: Apache-2.0

//! Assignment of small, dense thread ids to the threads that call into an
//! [`crate::stm::Stm`] instance (the reference implementation's
//! `ThreadRegistry`/`ThreadCheckInCheckOut`).
//!
//! Every write-set, operation-announcement array and Hazard-Eras era slot
//! is indexed by thread id rather than by `std::thread::Id`, which is why
//! ids need to be small, dense, and reused once a thread drops out.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{Result, StmError};

/// Wait-free (bounded by `max_threads`) assignment of thread ids.
///
/// `register` scans for a free slot and claims it with a single CAS;
/// `deregister` is a population-oblivious release store. `max_active`
/// tracks the high-water mark of ids ever handed out, which is what the
/// write-set/transform machinery iterates up to rather than the full
/// configured capacity.
pub(crate) struct ThreadRegistry {
    used: Vec<AtomicBool>,
    max_tid: AtomicUsize,
}

impl ThreadRegistry {
    pub(crate) fn new(max_threads: usize) -> Self {
        let mut used = Vec::with_capacity(max_threads);
        used.resize_with(max_threads, || AtomicBool::new(false));
        Self { used, max_tid: AtomicUsize::new(0) }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.used.len()
    }

    /// Claims the lowest free slot.
    pub(crate) fn register(&self) -> Result<usize> {
        for (tid, slot) in self.used.iter().enumerate() {
            if slot.load(Ordering::Acquire) {
                continue;
            }
            if slot
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            let mut cur = self.max_tid.load(Ordering::Acquire);
            while cur <= tid {
                match self.max_tid.compare_exchange(
                    cur,
                    tid + 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(observed) => cur = observed,
                }
            }
            return Ok(tid);
        }
        Err(StmError::ThreadRegistryFull)
    }

    pub(crate) fn deregister(&self, tid: usize) {
        self.used[tid].store(false, Ordering::Release);
    }

    /// One past the highest thread id ever assigned; the bound the
    /// write-set/transform machinery iterates to.
    pub(crate) fn max_active(&self) -> usize {
        self.max_tid.load(Ordering::Acquire)
    }
}

/// A thread's membership in one [`crate::stm::Stm`] instance's registry,
/// automatically deregistered when the owning thread exits (the
/// `ThreadCheckInCheckOut` destructor in the reference implementation).
///
/// Holds a strong `Arc` to the registry it registered with, rather than a
/// raw back-reference, so the registry is guaranteed to still be alive
/// when this slot's `Drop` runs even if the owning [`crate::stm::Stm`]
/// itself was already dropped on another thread.
struct ThreadSlot {
    tid: usize,
    registry: Arc<ThreadRegistry>,
}

impl Drop for ThreadSlot {
    fn drop(&mut self) {
        self.registry.deregister(self.tid);
    }
}

thread_local! {
    // Keyed by the owning registry's `Arc` identity rather than caching a
    // single tid, because a single OS thread may call into more than one
    // `Stm` instance over its lifetime — something the reference
    // implementation's single `gOFWF` global never has to account for,
    // but which Rust test harnesses and thread pools make routine.
    static SLOTS: RefCell<HashMap<usize, ThreadSlot>> = RefCell::new(HashMap::new());
}

/// Returns the calling thread's id within `registry`, assigning one (and
/// registering a deregister-on-exit slot) the first time this thread
/// calls in.
pub(crate) fn thread_id(registry: &Arc<ThreadRegistry>) -> Result<usize> {
    let key = Arc::as_ptr(registry) as usize;
    SLOTS.with(|slots| {
        if let Some(slot) = slots.borrow().get(&key) {
            return Ok(slot.tid);
        }
        let tid = registry.register()?;
        slots.borrow_mut().insert(key, ThreadSlot { tid, registry: Arc::clone(registry) });
        Ok(tid)
    })
}

/// Drops this thread's cached membership in `registry`'s registry, if
/// any, deregistering it. Exposed for tests; in normal operation the
/// `Drop` impl on [`ThreadSlot`] above handles process/thread exit.
#[cfg(test)]
pub(crate) fn forget_thread(registry: &Arc<ThreadRegistry>) -> Option<usize> {
    let key = Arc::as_ptr(registry) as usize;
    SLOTS.with(|slots| slots.borrow_mut().remove(&key)).map(|s| s.tid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_distinct_ids() {
        let reg = ThreadRegistry::new(4);
        let a = reg.register().unwrap();
        let b = reg.register().unwrap();
        assert_ne!(a, b);
        assert_eq!(reg.max_active(), 2);
    }

    #[test]
    fn exhaustion_returns_error() {
        let reg = ThreadRegistry::new(2);
        reg.register().unwrap();
        reg.register().unwrap();
        assert_eq!(reg.register().unwrap_err(), StmError::ThreadRegistryFull);
    }

    #[test]
    fn deregister_frees_slot_for_reuse() {
        let reg = ThreadRegistry::new(1);
        let tid = reg.register().unwrap();
        reg.deregister(tid);
        assert_eq!(reg.register().unwrap(), tid);
    }

    #[test]
    fn thread_local_id_is_stable_and_reusable_across_registries() {
        let reg_a = Arc::new(ThreadRegistry::new(4));
        let reg_b = Arc::new(ThreadRegistry::new(4));

        let tid_a = thread_id(&reg_a).unwrap();
        let tid_a_again = thread_id(&reg_a).unwrap();
        assert_eq!(tid_a, tid_a_again);

        let tid_b = thread_id(&reg_b).unwrap();
        assert_eq!(tid_b, 0);

        forget_thread(&reg_a);
        reg_a.deregister(tid_a);
    }

    #[test]
    fn thread_exit_deregisters_the_slot() {
        let reg = Arc::new(ThreadRegistry::new(1));
        let reg_for_thread = Arc::clone(&reg);
        std::thread::spawn(move || {
            thread_id(&reg_for_thread).unwrap();
        })
        .join()
        .unwrap();
        // the slot above is released on thread exit, so a fresh thread can
        // still obtain a registration from a registry of capacity 1.
        let tid = reg.register().unwrap();
        assert_eq!(tid, 0);
    }
}
