// Copyright 2024 The onefile-stm authors
// SPDX-License-Identifier: Apache-2.0

//! Transactional allocation and retirement (`tmNew`/`tmDelete` in the
//! reference implementation).
//!
//! A transaction can't call `Box::new`/`drop` directly: if the
//! transaction later aborts, any object it allocated must be undone, and
//! any object it frees must stay alive until no other thread's Hazard
//! Eras era can still observe it. [`Deletable`] and [`Retirable`] are the
//! Rust counterparts of the reference implementation's `Deletable`
//! struct and `tmbase`-tagged retire-log entry: a type-erased drop-glue
//! pointer bundled with the raw object pointer, so `OpData`'s logs don't
//! need to be generic over every type ever allocated inside a
//! transaction.
//!
//! [`TmBox<T>`] is the Rust counterpart of `tmbase`: every transactional
//! allocation carries its `birth_era` alongside the value, the way the
//! reference implementation's tracked objects inherit `tmbase`'s
//! `newEra_`/`delEra_` pair. The reference implementation hands back a
//! bare `T*` and recovers the embedded header through pointer arithmetic
//! on every delete; `TmBox<T>` keeps the same one-allocation-per-object
//! shape but exposes it as a typed smart pointer (the same shape
//! `Box`/`Arc` already use for a header-plus-value allocation) instead of
//! relying on unchecked pointer arithmetic at every call site.

use std::ops::{Deref, DerefMut};

/// A transactional heap allocation: its `birth_era` plus the value.
pub struct TmBox<T> {
    birth_era: u64,
    value: T,
}

impl<T> TmBox<T> {
    pub(crate) fn birth_era(boxed: *const TmBox<T>) -> u64 {
        unsafe { (*boxed).birth_era }
    }
}

impl<T> Deref for TmBox<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for TmBox<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

/// A pending allocation, undone by calling `reclaim` if the transaction
/// that made it aborts. Mirrors `struct Deletable { void* obj; void
/// (*reclaim)(void*); }`.
pub(crate) struct Deletable {
    ptr: *mut (),
    drop_glue: unsafe fn(*mut ()),
}

impl Deletable {
    /// # Safety
    /// `ptr` must be a live `Box<TmBox<T>>` pointer not aliased
    /// elsewhere.
    pub(crate) unsafe fn new<T>(ptr: *mut TmBox<T>) -> Self {
        unsafe fn drop_glue<T>(ptr: *mut ()) {
            drop(unsafe { Box::from_raw(ptr as *mut TmBox<T>) });
        }
        Self { ptr: ptr as *mut (), drop_glue: drop_glue::<T> }
    }

    pub(crate) fn reclaim(self) {
        unsafe { (self.drop_glue)(self.ptr) }
    }
}

// SAFETY: `Deletable` only ever holds a uniquely-owned heap pointer; it
// is only ever touched by the thread that logged it, before the
// transaction has published any pointer derived from it.
unsafe impl Send for Deletable {}

/// An object a committed transaction has asked to retire, queued for
/// Hazard-Eras reclamation rather than freed immediately. Mirrors
/// `tmbase`'s `newEra_`/`delEra_` pair attached to a type-erased pointer.
pub(crate) struct Retirable {
    ptr: *mut (),
    drop_glue: unsafe fn(*mut ()),
    pub(crate) birth_era: u64,
    pub(crate) death_era: u64,
}

impl Retirable {
    /// # Safety
    /// `ptr` must be a live, uniquely-owned `Box<TmBox<T>>` pointer (or,
    /// when `drop_glue` is supplied by [`Retirable::for_closure`], a live
    /// boxed [`crate::stm::TransFunc`]); no other thread may read through
    /// it once `death_era` has passed.
    pub(crate) unsafe fn new<T>(ptr: *mut TmBox<T>, birth_era: u64) -> Self {
        unsafe fn drop_glue<T>(ptr: *mut ()) {
            drop(unsafe { Box::from_raw(ptr as *mut TmBox<T>) });
        }
        Self { ptr: ptr as *mut (), drop_glue: drop_glue::<T>, birth_era, death_era: 0 }
    }

    /// # Safety
    /// `drop_glue` must be a valid drop function for whatever `ptr`
    /// actually points to.
    pub(crate) unsafe fn from_raw_parts(
        ptr: *mut (),
        drop_glue: unsafe fn(*mut ()),
        birth_era: u64,
    ) -> Self {
        Self { ptr, drop_glue, birth_era, death_era: 0 }
    }

    pub(crate) fn reclaim(self) {
        unsafe { (self.drop_glue)(self.ptr) }
    }
}

unsafe impl Send for Retirable {}

/// Allocates `value` on the heap with a `birth_era` header. Outside of
/// any call site that logs the returned [`Deletable`], this is
/// equivalent to `Box::into_raw(Box::new(TmBox { birth_era, value }))`.
pub(crate) fn alloc_tm_box<T>(value: T, birth_era: u64) -> *mut TmBox<T> {
    Box::into_raw(Box::new(TmBox { birth_era, value }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deletable_drops_the_underlying_box() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        struct DropFlag(Arc<AtomicBool>);
        impl Drop for DropFlag {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let flag = Arc::new(AtomicBool::new(false));
        let ptr = alloc_tm_box(DropFlag(flag.clone()), 1);
        let deletable = unsafe { Deletable::new(ptr) };
        assert!(!flag.load(Ordering::SeqCst));
        deletable.reclaim();
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn tm_box_derefs_to_value() {
        let ptr = alloc_tm_box(41, 1);
        unsafe {
            assert_eq!(**ptr, 41);
            (*ptr).birth_era;
            drop(Box::from_raw(ptr));
        }
    }
}
