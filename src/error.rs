// Copyright 2024 The onefile-stm authors
// SPDX-License-Identifier: Apache-2.0

//! Error types surfaced by the STM to callers.
//!
//! `AbortedTx`, the internal control-flow signal raised when a transaction
//! observes a stale snapshot, is deliberately **not** in this enum: it never
//! escapes the coordinator (see [`crate::stm`]) and is recovered locally by
//! retrying the transaction body.

use thiserror::Error as DeriveError;

/// Global result type returned by the public transaction entry points.
pub type Result<T> = core::result::Result<T, StmError>;

#[derive(Debug, DeriveError, PartialEq, Eq, Clone)]
pub enum StmError {
    /// A write-set, allocation-log, or retire-log would have overflowed its
    /// configured capacity. The transaction is too large for the configured
    /// bounds; the caller must raise the bound or split the transaction.
    #[error("transaction capacity exceeded: {0}")]
    CapacityExceeded(&'static str),

    /// More than `max_threads` concurrent threads attempted to register
    /// with the thread registry.
    #[error("thread registry is full")]
    ThreadRegistryFull,

    /// A null or otherwise disallowed argument was passed to an API that
    /// does not accept it.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}
