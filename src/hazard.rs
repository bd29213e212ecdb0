// Copyright 2024 The onefile-stm authors
// SPDX-License-Identifier: Apache-2.0

//! Era-based deferred reclamation (the reference implementation's
//! `HazardErasOF`), specialized for the STM: the global era is the `seq`
//! half of `curTx` rather than an independent epoch counter.

use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;

use crate::alloc::Retirable;

const NO_ERA: u64 = 0;

/// One thread's retired-object queues plus its published era.
struct ThreadSlot {
    era: AtomicU64,
    retired_objects: Vec<Retirable>,
    retired_closures: Vec<Retirable>,
}

impl ThreadSlot {
    fn new() -> Self {
        Self { era: AtomicU64::new(NO_ERA), retired_objects: Vec::new(), retired_closures: Vec::new() }
    }
}

/// Hazard-Eras reclaimer shared by all threads transacting against one
/// [`crate::stm::Stm`] instance.
///
/// Cleaning is purely local: a thread only ever frees objects that it
/// itself retired, scanning every other thread's published era to decide
/// whether it is safe to do so. This keeps the retired lists free of
/// cross-thread contention.
pub(crate) struct HazardEras {
    slots: Vec<ThreadSlot>,
    reclaim_threshold: usize,
}

impl HazardEras {
    pub(crate) fn new(max_threads: usize, reclaim_threshold: usize) -> Self {
        let mut slots = Vec::with_capacity(max_threads);
        slots.resize_with(max_threads, ThreadSlot::new);
        Self { slots, reclaim_threshold }
    }

    /// Publishes `era` as the era this thread is about to read objects
    /// from. Acts as the acquire fence ordering subsequent pointer loads.
    pub(crate) fn protect(&self, era: u64, tid: usize) {
        self.slots[tid].era.store(era, Ordering::Release);
    }

    pub(crate) fn clear(&self, tid: usize) {
        self.slots[tid].era.store(NO_ERA, Ordering::Release);
    }

    pub(crate) fn retire_object(&mut self, retirable: Retirable, tid: usize) {
        self.slots[tid].retired_objects.push(retirable);
    }

    pub(crate) fn retire_closure(&mut self, retirable: Retirable, tid: usize) {
        debug!("tid={tid}: retiring transaction closure for deferred reclamation");
        self.slots[tid].retired_closures.push(retirable);
    }

    fn can_delete(&self, current_era: u64, birth_era: u64, death_era: u64, except: usize) -> bool {
        if death_era == current_era {
            return false;
        }
        for (i, slot) in self.slots.iter().enumerate() {
            if i == except {
                continue;
            }
            let era = slot.era.load(Ordering::Acquire);
            if era == NO_ERA || era < birth_era || era > death_era {
                continue;
            }
            return false;
        }
        true
    }

    /// Scans this thread's retired lists, freeing every object whose
    /// `[birth_era, death_era]` interval no longer intersects any
    /// published era. Cheap to call often: it no-ops below
    /// `reclaim_threshold` entries.
    pub(crate) fn clean(&mut self, current_era: u64, tid: usize) {
        if self.slots[tid].retired_objects.len() >= self.reclaim_threshold {
            let mut i = 0;
            while i < self.slots[tid].retired_objects.len() {
                let (birth, death) = {
                    let r = &self.slots[tid].retired_objects[i];
                    (r.birth_era, r.death_era)
                };
                if self.can_delete(current_era, birth, death, tid) {
                    let retirable = self.slots[tid].retired_objects.swap_remove(i);
                    retirable.reclaim();
                } else {
                    i += 1;
                }
            }
        }
        if self.slots[tid].retired_closures.len() >= self.reclaim_threshold {
            let mut i = 0;
            while i < self.slots[tid].retired_closures.len() {
                let (birth, death) = {
                    let r = &self.slots[tid].retired_closures[i];
                    (r.birth_era, r.death_era)
                };
                if self.can_delete(current_era, birth, death, tid) {
                    let retirable = self.slots[tid].retired_closures.swap_remove(i);
                    debug!("tid={tid}: freeing a retired transaction closure");
                    retirable.reclaim();
                } else {
                    i += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe fn dummy_retirable(birth: u64, death: u64) -> Retirable {
        let ptr = crate::alloc::alloc_tm_box(0u8, birth);
        let mut r = unsafe { Retirable::new(ptr, birth) };
        r.death_era = death;
        r
    }

    #[test]
    fn not_reclaimed_while_era_protected() {
        let mut he = HazardEras::new(2, 0);
        he.protect(5, 1);
        let r = unsafe { dummy_retirable(3, 6) };
        he.retire_object(r, 0);
        he.clean(10, 0);
        assert_eq!(he.slots[0].retired_objects.len(), 1);
    }

    #[test]
    fn reclaimed_once_no_era_covers_it() {
        let mut he = HazardEras::new(2, 0);
        he.clear(1);
        let r = unsafe { dummy_retirable(3, 6) };
        he.retire_object(r, 0);
        he.clean(10, 0);
        assert_eq!(he.slots[0].retired_objects.len(), 0);
    }

    #[test]
    fn never_reclaims_current_era() {
        let mut he = HazardEras::new(1, 0);
        let r = unsafe { dummy_retirable(3, 7) };
        he.retire_object(r, 0);
        he.clean(7, 0);
        assert_eq!(he.slots[0].retired_objects.len(), 1);
    }
}
