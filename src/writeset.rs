// Copyright 2024 The onefile-stm authors
// SPDX-License-Identifier: Apache-2.0

//! Per-thread redo log of buffered stores (the reference implementation's
//! `WriteSet`/`WriteSetEntry`), with an intrusive hash index so lookups
//! stay cheap once a transaction has touched many cells.

use std::collections::HashMap;

use crate::cell::RawCell;
use crate::error::{Result, StmError};

struct Entry {
    addr: usize,
    val: u64,
}

/// A thread's buffered stores for the transaction currently in flight.
///
/// Below `array_lookup_threshold` entries, lookups and duplicate-address
/// checks do a linear scan of `log` (cheap and cache-friendly for small
/// transactions); beyond it, an address-keyed index is consulted instead.
/// Kept per-thread and reused across attempts by truncating rather than
/// reallocating.
pub(crate) struct WriteSet {
    log: Vec<Entry>,
    index: HashMap<usize, usize>,
    max_stores: usize,
    array_lookup_threshold: usize,
}

/// Each helper starts applying at `tid * APPLY_STRIDE mod numStores`
/// rather than at offset zero, so concurrently helping threads spread
/// out over the log instead of contending on the same prefix. Kept
/// verbatim from the reference implementation, which does not explain
/// why `8` specifically was chosen.
pub(crate) const APPLY_STRIDE: usize = 8;

impl WriteSet {
    pub(crate) fn new(max_stores: usize, array_lookup_threshold: usize) -> Self {
        Self { log: Vec::new(), index: HashMap::new(), max_stores, array_lookup_threshold }
    }

    pub(crate) fn len(&self) -> usize {
        self.log.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.log.clear();
        self.index.clear();
    }

    fn using_index(&self) -> bool {
        self.log.len() >= self.array_lookup_threshold
    }

    /// Adds a new store or overwrites an existing one for the same
    /// address, so the log only ever records the last writer.
    pub(crate) fn add_or_replace(&mut self, addr: usize, val: u64) -> Result<()> {
        if self.using_index() {
            if let Some(&idx) = self.index.get(&addr) {
                self.log[idx].val = val;
                return Ok(());
            }
        } else {
            for entry in self.log.iter_mut() {
                if entry.addr == addr {
                    entry.val = val;
                    return Ok(());
                }
            }
        }
        if self.log.len() >= self.max_stores {
            return Err(StmError::CapacityExceeded("write-set"));
        }
        let idx = self.log.len();
        self.log.push(Entry { addr, val });
        // Once past the threshold, every entry needs to be indexed,
        // including ones recorded back when lookups were still linear.
        if self.log.len() == self.array_lookup_threshold {
            self.index = self.log.iter().enumerate().map(|(i, e)| (e.addr, i)).collect();
        } else if self.using_index() {
            self.index.insert(addr, idx);
        }
        Ok(())
    }

    /// Returns the buffered value for `addr`, if this write-set has one.
    pub(crate) fn lookup(&self, addr: usize) -> Option<u64> {
        if self.using_index() {
            self.index.get(&addr).map(|&idx| self.log[idx].val)
        } else {
            self.log.iter().find(|e| e.addr == addr).map(|e| e.val)
        }
    }

    /// Overwrites `self` with a value-copy of `other`'s log, used when a
    /// helper takes a snapshot of the thread it is about to help apply.
    /// The index is rebuilt rather than copied, since helpers apply the
    /// log linearly and never need to look entries up by address.
    pub(crate) fn copy_from(&mut self, other: &WriteSet) {
        self.log.clear();
        self.log.extend(other.log.iter().map(|e| Entry { addr: e.addr, val: e.val }));
        self.index.clear();
    }

    /// Applies every buffered store as a `(old_val, old_seq) -> (new_val,
    /// seq)` compare-and-swap, skipping entries some other thread has
    /// already applied (their cell's `seq` is no longer behind `seq`).
    ///
    /// # Safety
    /// Every `addr` in the log must be the address of a live [`RawCell`]
    /// for the duration of this call — guaranteed by the caller having
    /// published a Hazard Era covering this transaction before copying
    /// the write-set (see [`crate::stm::Stm::help_apply`]).
    pub(crate) unsafe fn apply(&self, seq: u64, tid: usize) {
        let n = self.log.len();
        if n == 0 {
            return;
        }
        for i in 0..n {
            let entry = &self.log[(tid.wrapping_mul(APPLY_STRIDE) + i) % n];
            let cell = unsafe { &*(entry.addr as *const RawCell) };
            let (old_val, old_seq) = cell.load_pair();
            if old_seq < seq {
                let _ = cell_compare_exchange(cell, (old_val, old_seq), (entry.val, seq));
            }
        }
    }
}

fn cell_compare_exchange(cell: &RawCell, current: (u64, u64), new: (u64, u64)) -> bool {
    cell.compare_exchange(current, new)
}
