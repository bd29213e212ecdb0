// Copyright 2024 The onefile-stm authors
// SPDX-License-Identifier: Apache-2.0

//! `Cell<T>`, the transactional memory location (the `tmtype<T>` of the
//! reference implementation).
//!
//! A [`Cell<T>`] reads and writes like a plain field. Inside a running
//! transaction, [`Cell::load`] consults the calling thread's write-set
//! first and validates the read against the transaction's snapshot;
//! [`Cell::store`] buffers the write in the write-set instead of touching
//! memory directly. Outside a transaction both operate directly on the
//! backing value.

use std::any::Any;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crossbeam_utils::atomic::AtomicCell;

/// Private marker panicked through the stack to unwind out of an
/// arbitrarily deep, arbitrarily-typed user closure the moment a stale
/// snapshot is observed. Mirrors the reference implementation's
/// `throw AbortedTxException` / `catch (AbortedTx&)`, which is the only
/// mechanism available for aborting out of a closure of type
/// `Fn() -> R` for an unconstrained `R` without changing its signature.
///
/// Never exposed outside [`crate::stm`]: [`crate::stm::Stm::update_tx`]
/// and [`crate::stm::Stm::read_tx`] are the only places that catch it.
pub(crate) struct AbortedTx;

/// Runs `body`, catching an [`AbortedTx`] panic and turning it into
/// `None`. A panic that is not `AbortedTx` (a genuine bug in user code)
/// is resumed so it propagates to the caller unchanged.
pub(crate) fn catch_abort<R>(body: impl FnOnce() -> R) -> Option<R> {
    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(val) => Some(val),
        Err(payload) => {
            if payload.is::<AbortedTx>() {
                None
            } else {
                std::panic::resume_unwind(payload)
            }
        }
    }
}

/// Raises the internal abort signal. Only ever called from [`Cell::load`]
/// and [`Cell::store`] while a transaction is active on this thread.
fn abort_current_tx() -> ! {
    std::panic::panic_any(AbortedTx)
}

/// Per-thread handle into the running `Stm` instance, published by
/// [`crate::stm::Stm::update_tx`]/`read_tx` for the duration of the
/// closure and consulted by every [`Cell::load`]/[`Cell::store`] call.
///
/// `Cell<T>` cannot reach the coordinator through a generic parameter
/// (it has to be usable as a plain struct field, unaware of which `Stm`
/// instance owns it), so the active transaction is threaded through
/// thread-local state instead, the same role the reference
/// implementation's `thread_local OpData* tl_opdata` plays.
pub(crate) trait ActiveTransaction {
    /// The id of the thread running this transaction, used by
    /// `Stm::tm_new`/`tm_delete` to find the right allocation/retire log.
    fn tid(&self) -> usize;
    /// The transaction's snapshot sequence number (`trans2seq(curTx)` in
    /// the reference implementation).
    fn snapshot_seq(&self) -> u64;
    /// Whether no `Cell::store` has happened yet on this thread's current
    /// transaction (the read-only fast path).
    fn is_read_only(&self) -> bool;
    /// Look up `addr` in this thread's write-set, returning the buffered
    /// value if present.
    fn lookup_write(&self, addr: usize) -> Option<u64>;
    /// Buffer a write to `addr` in this thread's write-set.
    fn record_write(&self, addr: usize, value: u64);
}

thread_local! {
    static ACTIVE: std::cell::Cell<Option<*const dyn ActiveTransaction>> =
        std::cell::Cell::new(None);
}

/// Publishes `tx` as the active transaction for the duration of `body`.
/// Restores the previous value (`None` outside nested helping) on the
/// way out, including when `body` unwinds.
pub(crate) fn with_active_transaction<R>(
    tx: &dyn ActiveTransaction,
    body: impl FnOnce() -> R,
) -> R {
    // SAFETY: the erased `'static` pointer is only ever read while `tx` is
    // still alive, since `Restore` clears it (back to `previous`) before
    // `with_active_transaction` returns.
    let static_tx: &'static dyn ActiveTransaction = unsafe { std::mem::transmute(tx) };
    let ptr: *const dyn ActiveTransaction = static_tx;
    let previous = ACTIVE.with(|cell| cell.replace(Some(ptr)));
    struct Restore(Option<*const dyn ActiveTransaction>);
    impl Drop for Restore {
        fn drop(&mut self) {
            ACTIVE.with(|cell| cell.set(self.0));
        }
    }
    let _restore = Restore(previous);
    body()
}

pub(crate) fn active_transaction<'a>() -> Option<&'a dyn ActiveTransaction> {
    ACTIVE.with(|cell| cell.get()).map(|ptr| unsafe { &*ptr })
}

/// Conversion between a logical cell value and the `u64` the coordinator
/// actually stores, mirroring the reference implementation's blanket
/// `(uint64_t)` casts ("T is typically a pointer to a node, but it can be
/// integers or other stuff, as long as it fits in 64 bits").
pub trait CellValue: Copy {
    fn to_raw(self) -> u64;
    /// # Safety
    /// `raw` must have been produced by [`CellValue::to_raw`] on a value
    /// of this same type.
    unsafe fn from_raw(raw: u64) -> Self;
}

macro_rules! impl_cell_value_int {
    ($($t:ty),*) => {
        $(impl CellValue for $t {
            fn to_raw(self) -> u64 { self as u64 }
            unsafe fn from_raw(raw: u64) -> Self { raw as $t }
        })*
    };
}
impl_cell_value_int!(u64, i64, u32, i32, usize, isize);

impl CellValue for bool {
    fn to_raw(self) -> u64 {
        self as u64
    }
    unsafe fn from_raw(raw: u64) -> Self {
        raw != 0
    }
}

/// Lets a void-returning closure be used directly with `update_tx`/
/// `read_tx`, the way the reference implementation's `void`-returning
/// `updateTx` overload wraps the body as `[func]{ func(); return 0; }`
/// instead of requiring every caller to return a dummy value.
impl CellValue for () {
    fn to_raw(self) -> u64 {
        0
    }
    unsafe fn from_raw(_raw: u64) -> Self {}
}

impl<T> CellValue for *const T {
    fn to_raw(self) -> u64 {
        self as u64
    }
    unsafe fn from_raw(raw: u64) -> Self {
        raw as *const T
    }
}

impl<T> CellValue for *mut T {
    fn to_raw(self) -> u64 {
        self as u64
    }
    unsafe fn from_raw(raw: u64) -> Self {
        raw as *mut T
    }
}

/// The `(val, seq)` pair backing a [`Cell<T>`], addressed by its memory
/// address when helping threads copy or replay each other's write-sets.
/// A `crossbeam_utils::atomic::AtomicCell<(u64, u64)>` gives this struct a
/// genuine single-word-sized atomic read/write of both fields together,
/// standing in for the reference implementation's 128-bit `DCAS`
/// read/write pair and its `alignas(16)`/`alignas(8)` field layout.
#[repr(align(16))]
pub(crate) struct RawCell {
    inner: AtomicCell<(u64, u64)>,
}

impl RawCell {
    pub(crate) fn new(value: u64, seq: u64) -> Self {
        debug_assert!(AtomicCell::<(u64, u64)>::is_lock_free());
        Self { inner: AtomicCell::new((value, seq)) }
    }

    pub(crate) fn addr(&self) -> usize {
        self as *const Self as usize
    }

    /// `isolated_store`: relaxed, unsynchronized initialization, valid
    /// only before the cell is shared with other threads.
    pub(crate) fn isolated_store(&self, value: u64) {
        self.inner.store((value, self.inner.load().1));
    }

    /// `pload`'s raw half: an acquire read of both fields.
    pub(crate) fn load_pair(&self) -> (u64, u64) {
        self.inner.load()
    }

    pub(crate) fn seq(&self) -> u64 {
        self.inner.load().1
    }

    /// `rawLoad`: used only by the write-set/transform machinery, not by
    /// user-facing loads. Returns `None` if the two halves it observed
    /// were torn by a concurrent writer (re-read and retry).
    pub(crate) fn raw_load(&self) -> Option<(u64, u64)> {
        let first = self.inner.load();
        let second = self.inner.load();
        if first.1 == second.1 {
            Some(first)
        } else {
            None
        }
    }

    /// `rawStore`: used only by the coordinator's apply/transform phase.
    pub(crate) fn raw_store(&self, value: u64, seq: u64) {
        self.inner.store((value, seq));
    }

    /// The `DCAS` of the apply phase: succeeds only if the cell still
    /// holds `current`.
    pub(crate) fn compare_exchange(&self, current: (u64, u64), new: (u64, u64)) -> bool {
        self.inner.compare_exchange(current, new).is_ok()
    }
}

/// A transactional memory location holding a value of type `T`.
///
/// Usable as a plain struct field; reads and writes automatically
/// participate in whatever transaction (if any) is active on the calling
/// thread.
pub struct Cell<T: CellValue> {
    raw: RawCell,
    _marker: PhantomData<T>,
}

// SAFETY: all access goes through the atomic `RawCell`; `T: CellValue`
// values are `Copy` words, not borrowed data.
unsafe impl<T: CellValue> Send for Cell<T> {}
unsafe impl<T: CellValue> Sync for Cell<T> {}

impl<T: CellValue> Cell<T> {
    /// Creates a cell outside of any transaction. Equivalent to the
    /// reference implementation's `tmtype(T initVal)` constructor, which
    /// calls `isolated_store`.
    pub fn new(initial: T) -> Self {
        let raw = RawCell::new(initial.to_raw(), 1);
        Self { raw, _marker: PhantomData }
    }

    pub(crate) fn raw(&self) -> &RawCell {
        &self.raw
    }

    /// Reads the current value.
    ///
    /// Outside a transaction this is a plain atomic load. Inside one, the
    /// read is validated against the transaction's snapshot: if the
    /// cell's sequence number is newer than the snapshot, the calling
    /// thread's transaction is stale and this call aborts it (unwinding
    /// back to the coordinator, which retries). Once validated, a
    /// read-write transaction's own buffered write (if any) is returned
    /// instead of the committed value, so a transaction always sees its
    /// own writes.
    pub fn load(&self) -> T {
        let (value, seq) = self.raw.load_pair();
        let tx = match active_transaction() {
            None => return unsafe { T::from_raw(value) },
            Some(tx) => tx,
        };
        if seq > tx.snapshot_seq() {
            abort_current_tx();
        }
        if tx.is_read_only() {
            return unsafe { T::from_raw(value) };
        }
        match tx.lookup_write(self.raw.addr()) {
            Some(buffered) => unsafe { T::from_raw(buffered) },
            None => unsafe { T::from_raw(value) },
        }
    }

    /// Writes a new value.
    ///
    /// Outside a transaction this stores directly. Inside one the write
    /// is only buffered in the calling thread's write-set; it becomes
    /// visible to other threads only if and when the transaction
    /// commits. No validation happens here: the reference implementation
    /// notes the value isn't dereferenced on store, so a stale write can
    /// be safely buffered and discarded if the transaction later aborts.
    pub fn store(&self, value: T) {
        match active_transaction() {
            None => self.raw.isolated_store(value.to_raw()),
            Some(tx) => tx.record_write(self.raw.addr(), value.to_raw()),
        }
    }
}

impl<T: CellValue + std::fmt::Debug> std::fmt::Debug for Cell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cell").field("value", &self.load()).finish()
    }
}

/// Drains `payload` back into an [`AbortedTx`] check; used by the
/// coordinator when it needs to tell an unwind carrying arbitrary data
/// apart from a transaction abort without downcasting twice.
pub(crate) fn is_aborted_tx(payload: &(dyn Any + Send)) -> bool {
    payload.is::<AbortedTx>()
}
