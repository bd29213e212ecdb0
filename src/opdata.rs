// Copyright 2024 The onefile-stm authors
// SPDX-License-Identifier: Apache-2.0

//! Per-thread transaction state (the reference implementation's `OpData`)
//! plus the allocation/retire logs a transaction accumulates.
//!
//! `OpData` splits into two halves with different sharing rules, mirroring
//! the reference implementation's comment that `request` is the only
//! field a helper touches: [`OpDataOwned`] (snapshot, nested-call depth,
//! allocation/retire logs) is read and written only by the thread that
//! owns this slot, while the `request` sequence number is a genuinely
//! shared atomic CASed by helpers closing out the owner's operation.

use crate::alloc::{Deletable, Retirable};
use crate::error::{Result, StmError};

/// The owner-only half of a thread's `OpData` slot.
pub(crate) struct OpDataOwned {
    /// The `curTx` snapshot this thread observed when it began its
    /// current attempt.
    pub(crate) cur_tx: u64,
    /// Depth of nested `update_tx`/`read_tx` calls on this thread; `> 0`
    /// means the current call is nested and runs its closure inline
    /// without announcing a new operation.
    pub(crate) nested_trans: u64,
    retires: Vec<Retirable>,
    allocs: Vec<Deletable>,
    max_retires: usize,
    max_allocs: usize,
}

impl OpDataOwned {
    pub(crate) fn new(max_allocs: usize, max_retires: usize) -> Self {
        Self {
            cur_tx: 0,
            nested_trans: 0,
            retires: Vec::new(),
            allocs: Vec::new(),
            max_retires,
            max_allocs,
        }
    }

    pub(crate) fn push_alloc(&mut self, deletable: Deletable) -> Result<()> {
        if self.allocs.len() >= self.max_allocs {
            return Err(StmError::CapacityExceeded("allocation log"));
        }
        self.allocs.push(deletable);
        Ok(())
    }

    pub(crate) fn push_retire(&mut self, retirable: Retirable) -> Result<()> {
        if self.retires.len() >= self.max_retires {
            return Err(StmError::CapacityExceeded("retire log"));
        }
        self.retires.push(retirable);
        Ok(())
    }

    /// Undoes every allocation recorded so far (a failed transaction
    /// attempt), then clears the log.
    pub(crate) fn rollback_allocs(&mut self) {
        for deletable in self.allocs.drain(..) {
            deletable.reclaim();
        }
    }

    /// Clears the allocation log of a transaction that just committed,
    /// without freeing anything: the logged objects are now live, owned
    /// by the committed transaction, and referenced by published cells.
    /// Mirrors the reference implementation's `commitTx`, which resets
    /// `numAllocs = 0` and leaves the allocations untouched; only the
    /// abort path actually frees them.
    pub(crate) fn forget_allocs(&mut self) {
        self.allocs.clear();
    }

    pub(crate) fn num_retires(&self) -> usize {
        self.retires.len()
    }

    /// Drains the retire log, returning its entries to the caller so they
    /// can be handed to the Hazard-Eras retired list. Only called once a
    /// transaction has committed.
    pub(crate) fn drain_retires(&mut self) -> std::vec::Drain<'_, Retirable> {
        self.retires.drain(..)
    }

    /// Discards the retire log of an attempt that never published
    /// (aborted, or superseded by a helper). The logged objects'
    /// destructors already ran when `tmDelete`/`tmFree` were called, and
    /// since the attempt never committed no other thread could have
    /// observed them, so — unlike the committed path — it's safe to free
    /// their storage immediately instead of routing it through Hazard
    /// Eras.
    pub(crate) fn discard_retires(&mut self) {
        for retirable in self.retires.drain(..) {
            retirable.reclaim();
        }
    }
}
