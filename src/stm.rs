// Copyright 2024 The onefile-stm authors
// SPDX-License-Identifier: Apache-2.0

//! The transaction coordinator (the reference implementation's
//! `OneFileWF` class): the DCAS-sequenced global state machine that ties
//! together the write-set, the operation/result announcement arrays, and
//! Hazard-Eras reclamation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::trace;

use crate::alloc::{self, Deletable, Retirable, TmBox};
#[cfg(test)]
use crate::cell::Cell;
use crate::cell::{self, ActiveTransaction, CellValue, RawCell};
use crate::config::StmConfig;
use crate::hazard::HazardEras;
use crate::opdata::OpDataOwned;
use crate::registry::{self, ThreadRegistry};
use crate::writeset::WriteSet;

/// A boxed, repeatedly-invocable transaction body, thin-pointer tracked
/// through the operation array exactly like the reference
/// implementation's `TransFunc` (a `std::function` wrapper with an
/// attached era pair) — a concrete struct rather than a trait object, so
/// its pointer fits in the same 64-bit cell every other announced value
/// does.
pub(crate) struct TransFunc {
    func: Box<dyn Fn() -> u64 + Send + Sync>,
}

fn seqidx2trans(seq: u64, idx: usize) -> u64 {
    (seq << 10) | (idx as u64)
}

fn trans2seq(trans: u64) -> u64 {
    trans >> 10
}

fn trans2idx(trans: u64) -> usize {
    (trans & 0x3FF) as usize
}

/// The published active transaction for one `update_tx`/`read_tx` call
/// (or for a helper running inside the committer's own speculative
/// attempt). Implements [`ActiveTransaction`] so `Cell::load`/`store`
/// calls made by the user's closure are intercepted transparently.
struct RunningTx<'a> {
    stm: &'a Stm,
    tid: usize,
    snapshot_seq: u64,
    read_only: std::cell::Cell<bool>,
}

impl ActiveTransaction for RunningTx<'_> {
    fn tid(&self) -> usize {
        self.tid
    }

    fn snapshot_seq(&self) -> u64 {
        self.snapshot_seq
    }

    fn is_read_only(&self) -> bool {
        self.read_only.get()
    }

    fn lookup_write(&self, addr: usize) -> Option<u64> {
        self.stm.write_sets[self.tid].lock().unwrap().lookup(addr)
    }

    fn record_write(&self, addr: usize, value: u64) {
        self.read_only.set(false);
        if let Err(err) = self.stm.write_sets[self.tid].lock().unwrap().add_or_replace(addr, value) {
            panic!("{err}");
        }
    }
}

/// A wait-free software transactional memory instance.
///
/// Construct one with [`Stm::new`] and share it (typically via [`std::sync::Arc`])
/// with every thread that will call [`Stm::update_tx`]/[`Stm::read_tx`].
/// `Stm` is intentionally not a hidden process-wide global: callers own
/// the instance and decide its lifetime, the same way the reference
/// implementation's `RLU<T>`-equivalent is an explicit value rather than
/// a static constructed on first touch.
pub struct Stm {
    config: StmConfig,
    registry: Arc<ThreadRegistry>,
    cur_tx: AtomicU64,
    operations: Vec<RawCell>,
    results: Vec<RawCell>,
    op_requests: Vec<AtomicU64>,
    write_sets: Vec<Mutex<WriteSet>>,
    op_data: Vec<Mutex<OpDataOwned>>,
    hazard: Mutex<HazardEras>,
}

// SAFETY: every field is either a plain atomic, a `Mutex`-guarded value,
// or (for `operations`/`results`) a raw-pointer-sized cell accessed only
// through the same acquire/release discipline `Cell<T>` itself uses.
unsafe impl Send for Stm {}
unsafe impl Sync for Stm {}

impl Stm {
    /// Creates a new, empty STM instance from `config`.
    pub fn new(config: StmConfig) -> Self {
        let max_threads = config.max_threads;
        let mut operations = Vec::with_capacity(max_threads);
        let mut results = Vec::with_capacity(max_threads);
        let mut op_requests = Vec::with_capacity(max_threads);
        let mut write_sets = Vec::with_capacity(max_threads);
        let mut op_data = Vec::with_capacity(max_threads);
        for _ in 0..max_threads {
            operations.push(RawCell::new(0, 0));
            results.push(RawCell::new(0, 1));
            op_requests.push(AtomicU64::new(0));
            write_sets.push(Mutex::new(WriteSet::new(config.max_stores, config.array_lookup_threshold)));
            op_data.push(Mutex::new(OpDataOwned::new(config.tx_max_allocs, config.tx_max_retires)));
        }
        Self {
            registry: Arc::new(ThreadRegistry::new(max_threads)),
            cur_tx: AtomicU64::new(seqidx2trans(1, 0)),
            operations,
            results,
            op_requests,
            write_sets,
            op_data,
            hazard: Mutex::new(HazardEras::new(max_threads, config.reclaim_threshold)),
            config,
        }
    }

    /// Creates a new, empty STM instance using [`StmConfig::default`].
    pub fn with_defaults() -> Self {
        Self::new(StmConfig::default())
    }

    pub fn config(&self) -> &StmConfig {
        &self.config
    }

    fn tid(&self) -> usize {
        registry::thread_id(&self.registry).unwrap_or_else(|err| panic!("{err}"))
    }

    /// Runs `f` as a read-write transaction, retrying internally until it
    /// commits (either by this thread or by a helper), and returns its
    /// result.
    pub fn update_tx<R: CellValue, F: Fn() -> R + Send + Sync + 'static>(&self, f: F) -> R {
        let tid = self.tid();
        if self.is_nested(tid) {
            return f();
        }
        let func: Box<dyn Fn() -> u64 + Send + Sync> = Box::new(move || f().to_raw());
        let func_ptr = Box::into_raw(Box::new(TransFunc { func }));
        self.inner_update_tx(tid, func_ptr);
        let (raw, _) = self.results[tid].load_pair();
        unsafe { R::from_raw(raw) }
    }

    /// Runs `f` as a read-only transaction. After [`StmConfig::max_read_tries`]
    /// failed snapshot attempts it falls through to [`Stm::update_tx`] so
    /// progress remains bounded even under persistent contention.
    pub fn read_tx<R: CellValue, F: Fn() -> R + Send + Sync + 'static>(&self, f: F) -> R {
        let tid = self.tid();
        if self.is_nested(tid) {
            return f();
        }
        self.bump_nested(tid, 1);
        self.write_sets[tid].lock().unwrap().clear();
        {
            let mut opd = self.op_data[tid].lock().unwrap();
            opd.rollback_allocs();
            opd.discard_retires();
        }
        for _ in 0..self.config.max_read_tries {
            let snapshot = self.cur_tx.load(Ordering::Acquire);
            self.help_apply(snapshot, tid);
            self.hazard.lock().unwrap().protect(trans2seq(snapshot), tid);
            self.write_sets[tid].lock().unwrap().clear();
            if snapshot != self.cur_tx.load(Ordering::Acquire) {
                continue;
            }
            let active = RunningTx { stm: self, tid, snapshot_seq: trans2seq(snapshot), read_only: std::cell::Cell::new(true) };
            match cell::catch_abort(|| cell::with_active_transaction(&active, &f)) {
                Some(retval) => {
                    self.bump_nested(tid, -1);
                    self.hazard.lock().unwrap().clear(tid);
                    return retval;
                }
                None => continue,
            }
        }
        self.bump_nested(tid, -1);
        self.update_tx(f)
    }

    fn is_nested(&self, tid: usize) -> bool {
        self.op_data[tid].lock().unwrap().nested_trans > 0
    }

    fn bump_nested(&self, tid: usize, delta: i64) {
        let mut opd = self.op_data[tid].lock().unwrap();
        opd.nested_trans = (opd.nested_trans as i64 + delta) as u64;
    }

    /// Allocates `value` as part of the currently running transaction (if
    /// any), logging it so it can be rolled back if the attempt aborts.
    pub fn tm_new<T>(&self, value: T) -> *mut TmBox<T> {
        let era = trans2seq(self.cur_tx.load(Ordering::Acquire));
        let ptr = alloc::alloc_tm_box(value, era);
        if let Some(active) = cell::active_transaction() {
            let mut opd = self.op_data[active.tid()].lock().unwrap();
            if let Err(err) = opd.push_alloc(unsafe { Deletable::new(ptr) }) {
                panic!("{err}");
            }
        }
        ptr
    }

    /// Logs `ptr` for retirement. The value is dropped once no other
    /// thread's Hazard Era can still observe it, or immediately if the
    /// current attempt never commits.
    pub fn tm_delete<T>(&self, ptr: *mut TmBox<T>) {
        if ptr.is_null() {
            return;
        }
        let birth_era = TmBox::birth_era(ptr);
        match cell::active_transaction() {
            None => drop(unsafe { Box::from_raw(ptr) }),
            Some(active) => {
                let mut opd = self.op_data[active.tid()].lock().unwrap();
                if let Err(err) = opd.push_retire(unsafe { Retirable::new(ptr, birth_era) }) {
                    panic!("{err}");
                }
            }
        }
    }

    fn inner_update_tx(&self, tid: usize, func_ptr: *mut TransFunc) {
        self.bump_nested(tid, 1);
        let first_era = trans2seq(self.cur_tx.load(Ordering::Acquire));
        let result_seq = self.results[tid].seq();
        self.operations[tid].raw_store(func_ptr as u64, result_seq);

        // Bounded inner retry: the announce/help/transform/commit cycle
        // is attempted a small fixed number of times, not spun
        // unboundedly. This bound (together with the number of threads
        // that can be helped in one pass) is what makes the algorithm
        // wait-free rather than merely lock-free.
        const MAX_ATTEMPTS: usize = 4;
        for _ in 0..MAX_ATTEMPTS {
            {
                let mut opd = self.op_data[tid].lock().unwrap();
                opd.rollback_allocs();
                opd.discard_retires();
            }
            self.write_sets[tid].lock().unwrap().clear();
            let snapshot = self.cur_tx.load(Ordering::Acquire);
            self.op_data[tid].lock().unwrap().cur_tx = snapshot;

            if self.results[tid].seq() > self.operations[tid].seq() {
                break;
            }
            self.help_apply(snapshot, tid);
            self.write_sets[tid].lock().unwrap().clear();
            self.hazard.lock().unwrap().protect(trans2seq(snapshot), tid);
            if snapshot != self.cur_tx.load(Ordering::Acquire) {
                continue;
            }

            let active = RunningTx { stm: self, tid, snapshot_seq: trans2seq(snapshot), read_only: std::cell::Cell::new(true) };
            let transformed = cell::catch_abort(|| {
                cell::with_active_transaction(&active, || self.transform_all(&active, snapshot))
            });
            match transformed {
                Some(true) => {}
                _ => continue,
            }
            if self.commit(tid, snapshot) {
                break;
            }
        }

        self.op_data[tid].lock().unwrap().rollback_allocs();
        self.hazard.lock().unwrap().clear(tid);
        self.retire_my_func(tid, func_ptr, first_era);
        self.bump_nested(tid, -1);
    }

    /// Replays every thread's currently-announced, not-yet-completed
    /// operation inside the committer's own tentative transaction, so
    /// that one commit DCAS publishes all of them at once. Returns
    /// `false` if `curTx` changed underneath us, meaning the snapshot is
    /// stale and the whole attempt must restart.
    fn transform_all(&self, active: &RunningTx<'_>, snapshot: u64) -> bool {
        for i in 0..self.registry.max_active() {
            let (op_ptr, op_seq) = match self.operations[i].raw_load() {
                Some(pair) => pair,
                None => continue,
            };
            let (_res_val, res_seq) = match self.results[i].raw_load() {
                Some(pair) => pair,
                None => continue,
            };
            if res_seq > op_seq || op_ptr == 0 {
                continue;
            }
            if snapshot != self.cur_tx.load(Ordering::Acquire) {
                return false;
            }
            let txfunc = unsafe { &*(op_ptr as *const TransFunc) };
            let result = (txfunc.func)();
            active.record_write(self.results[i].addr(), result);
        }
        true
    }

    /// Attempts to publish this thread's write-set (commit the
    /// transaction) via a single DCAS on `cur_tx`, then applies it.
    fn commit(&self, tid: usize, snapshot: u64) -> bool {
        let num_stores = self.write_sets[tid].lock().unwrap().len();
        let num_retires = self.op_data[tid].lock().unwrap().num_retires();
        if num_stores == 0 && num_retires == 0 {
            return true;
        }
        if snapshot != self.cur_tx.load(Ordering::Acquire) {
            return false;
        }
        let seq = trans2seq(snapshot);
        let new_tx = seqidx2trans(seq + 1, tid);
        self.op_requests[tid].store(new_tx, Ordering::Release);
        trace!("tid={tid}: attempting commit DCAS to seq={}", seq + 1);
        if self
            .cur_tx
            .compare_exchange(snapshot, new_tx, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            trace!("tid={tid}: commit DCAS lost");
            return false;
        }
        self.help_apply(new_tx, tid);
        self.retire_retires_from_log(tid);
        self.op_data[tid].lock().unwrap().forget_allocs();
        trace!("tid={tid}: committed seq={} with {num_stores} stores", seq + 1);
        true
    }

    /// Applies the write-set published by `trans2idx(lcur_tx)`, copying
    /// it first if it belongs to another thread. Wait-free
    /// population-oblivious: every call either applies the log or
    /// discovers someone else already has.
    fn help_apply(&self, lcur_tx: u64, tid: usize) {
        let idx = trans2idx(lcur_tx);
        let seq = trans2seq(lcur_tx);
        if lcur_tx != self.op_requests[idx].load(Ordering::Acquire) {
            return;
        }
        if idx != tid {
            {
                let src = self.write_sets[idx].lock().unwrap();
                let mut dst = self.write_sets[tid].lock().unwrap();
                dst.copy_from(&src);
            }
            self.hazard.lock().unwrap().protect(seq, tid);
            if lcur_tx != self.cur_tx.load(Ordering::Acquire) {
                return;
            }
            if self.op_requests[idx].load(Ordering::Acquire) != lcur_tx {
                return;
            }
            log::debug!("tid={tid}: helping apply write-set of thread {idx}");
        }
        unsafe {
            self.write_sets[tid].lock().unwrap().apply(seq, tid);
        }
        let new_req = seqidx2trans(seq + 1, idx);
        if idx == tid {
            self.op_requests[idx].store(new_req, Ordering::Release);
        } else {
            let _ = self.op_requests[idx].compare_exchange(
                lcur_tx,
                new_req,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }

    fn retire_retires_from_log(&self, tid: usize) {
        let lseq = trans2seq(self.cur_tx.load(Ordering::Acquire));
        let mut opd = self.op_data[tid].lock().unwrap();
        let mut hazard = self.hazard.lock().unwrap();
        for mut retirable in opd.drain_retires() {
            retirable.death_era = lseq;
            hazard.retire_object(retirable, tid);
        }
        hazard.clean(lseq, tid);
    }

    fn retire_my_func(&self, tid: usize, func_ptr: *mut TransFunc, first_era: u64) {
        let death_era = trans2seq(self.cur_tx.load(Ordering::Acquire)) + 1;
        unsafe fn drop_transfunc(ptr: *mut ()) {
            drop(unsafe { Box::from_raw(ptr as *mut TransFunc) });
        }
        let mut retirable = unsafe {
            Retirable::from_raw_parts(func_ptr as *mut (), drop_transfunc, first_era)
        };
        retirable.death_era = death_era;
        self.hazard.lock().unwrap().retire_closure(retirable, tid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_threaded_update_and_read() {
        use std::sync::Arc;
        let stm = Stm::with_defaults();
        let counter = Arc::new(Cell::new(0u64));
        {
            let counter = Arc::clone(&counter);
            stm.update_tx(move || counter.store(counter.load() + 1));
        }
        {
            let counter = Arc::clone(&counter);
            stm.update_tx(move || counter.store(counter.load() + 1));
        }
        let seen = {
            let counter = Arc::clone(&counter);
            stm.read_tx(move || counter.load())
        };
        assert_eq!(seen, 2);
    }

    #[test]
    fn nested_update_tx_runs_inline() {
        use std::sync::Arc;
        let stm = Arc::new(Stm::with_defaults());
        let counter = Arc::new(Cell::new(0u64));
        {
            let stm_inner = Arc::clone(&stm);
            let counter_outer = Arc::clone(&counter);
            let counter_inner = Arc::clone(&counter);
            stm.update_tx(move || {
                counter_outer.store(1);
                stm_inner.update_tx({
                    let counter_inner = Arc::clone(&counter_inner);
                    move || counter_inner.store(counter_inner.load() + 1)
                });
            });
        }
        let counter = Arc::clone(&counter);
        assert_eq!(stm.read_tx(move || counter.load()), 2);
    }

    #[test]
    fn concurrent_increments_are_linearizable() {
        use std::sync::Arc;
        let stm = Arc::new(Stm::with_defaults());
        let counter = Arc::new(Cell::new(0u64));
        std::thread::scope(|s| {
            for _ in 0..8 {
                let stm = Arc::clone(&stm);
                let counter = Arc::clone(&counter);
                s.spawn(move || {
                    for _ in 0..200 {
                        let counter = Arc::clone(&counter);
                        stm.update_tx(move || counter.store(counter.load() + 1));
                    }
                });
            }
        });
        assert_eq!(counter.load(), 1600);
    }

    #[test]
    fn tm_new_and_tm_delete_round_trip() {
        use std::sync::Arc;
        let stm = Arc::new(Stm::with_defaults());
        let ptr_addr = {
            let stm_inner = Arc::clone(&stm);
            stm.update_tx(move || stm_inner.tm_new(123u64) as usize)
        };
        let ptr = ptr_addr as *mut TmBox<u64>;
        assert_eq!(unsafe { **ptr }, 123);
        let stm_inner = Arc::clone(&stm);
        stm.update_tx(move || stm_inner.tm_delete(ptr_addr as *mut TmBox<u64>));
    }
}
