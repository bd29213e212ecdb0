// Copyright 2024 The onefile-stm authors
// SPDX-License-Identifier: Apache-2.0

//! # onefile-stm
//!
//! A wait-free software transactional memory runtime with integrated
//! Hazard-Eras memory reclamation, adapted from the single-file OneFile
//! wait-free STM algorithm.
//!
//! ```
//! use onefile_stm::{Cell, Stm};
//!
//! let stm = Stm::with_defaults();
//! let counter = Cell::new(0u64);
//! stm.update_tx(|| counter.store(counter.load() + 1));
//! assert_eq!(stm.read_tx(|| counter.load()), 1);
//! ```
#![allow(clippy::type_complexity)]

mod alloc;
mod cell;
mod config;
mod error;
mod hazard;
mod opdata;
mod registry;
mod stm;
mod writeset;

pub use alloc::TmBox;
pub use cell::{Cell, CellValue};
pub use config::{StmConfig, StmConfigBuilder};
pub use error::{Result, StmError};
pub use stm::Stm;
