// Copyright 2024 The onefile-stm authors
// SPDX-License-Identifier: Apache-2.0

//! Boundary constants and runtime configuration for an [`crate::stm::Stm`]
//! instance. The defaults reproduce the `REGISTRY_MAX_THREADS` /
//! `TX_MAX_STORES` / ... constants of the original OneFile implementation.

use crate::error::{Result, StmError};

/// Tunable limits for a [`crate::stm::Stm`] instance.
///
/// Constructed with [`StmConfig::builder`]; [`StmConfig::default`]
/// reproduces the reference defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StmConfig {
    /// Maximum number of threads that may concurrently hold a registry id.
    pub max_threads: usize,
    /// Maximum number of stores recorded in a single transaction's write-set.
    pub max_stores: usize,
    /// Number of buckets in the write-set's intrusive hash index.
    pub hash_buckets: usize,
    /// Below this many stores, write-set lookups use a linear scan instead
    /// of the hash index.
    pub array_lookup_threshold: usize,
    /// Maximum number of `tmNew`/`tmMalloc` calls recorded per transaction.
    pub tx_max_allocs: usize,
    /// Maximum number of `tmDelete`/`tmFree` calls recorded per transaction.
    pub tx_max_retires: usize,
    /// Number of failed snapshot attempts `readTx` tolerates before falling
    /// through to `updateTx`.
    pub max_read_tries: usize,
    /// Minimum size a thread's retired list must reach before
    /// `HazardEras::clean` scans it (named `R` in the Hazard Pointers/Eras
    /// literature).
    pub reclaim_threshold: usize,
}

impl Default for StmConfig {
    fn default() -> Self {
        Self {
            max_threads: 128,
            max_stores: 40 * 1024,
            hash_buckets: 1024,
            array_lookup_threshold: 30,
            tx_max_allocs: 10 * 1024,
            tx_max_retires: 10 * 1024,
            max_read_tries: 4,
            reclaim_threshold: 0,
        }
    }
}

impl StmConfig {
    /// Starts building a configuration from the reference defaults.
    pub fn builder() -> StmConfigBuilder {
        StmConfigBuilder { cfg: Self::default() }
    }

    fn validate(&self) -> Result<()> {
        if self.max_threads == 0 {
            return Err(StmError::InvalidArgument("max_threads must be non-zero"));
        }
        // The thread id is packed into the low 10 bits of the transaction
        // identifier; more threads than that cannot be addressed
        // regardless of configuration.
        if self.max_threads > (1 << 10) {
            return Err(StmError::InvalidArgument("max_threads exceeds the 10-bit thread-id field"));
        }
        if self.max_stores == 0 {
            return Err(StmError::InvalidArgument("max_stores must be non-zero"));
        }
        if self.hash_buckets == 0 {
            return Err(StmError::InvalidArgument("hash_buckets must be non-zero"));
        }
        if self.array_lookup_threshold > self.max_stores {
            return Err(StmError::InvalidArgument(
                "array_lookup_threshold must not exceed max_stores",
            ));
        }
        if self.tx_max_allocs == 0 {
            return Err(StmError::InvalidArgument("tx_max_allocs must be non-zero"));
        }
        if self.tx_max_retires == 0 {
            return Err(StmError::InvalidArgument("tx_max_retires must be non-zero"));
        }
        if self.max_read_tries == 0 {
            return Err(StmError::InvalidArgument("max_read_tries must be non-zero"));
        }
        Ok(())
    }
}

/// Builder for [`StmConfig`]. Starts from [`StmConfig::default`] and
/// overrides individual fields.
pub struct StmConfigBuilder {
    cfg: StmConfig,
}

impl StmConfigBuilder {
    pub fn max_threads(mut self, v: usize) -> Self {
        self.cfg.max_threads = v;
        self
    }

    pub fn max_stores(mut self, v: usize) -> Self {
        self.cfg.max_stores = v;
        self
    }

    pub fn hash_buckets(mut self, v: usize) -> Self {
        self.cfg.hash_buckets = v;
        self
    }

    pub fn array_lookup_threshold(mut self, v: usize) -> Self {
        self.cfg.array_lookup_threshold = v;
        self
    }

    pub fn tx_max_allocs(mut self, v: usize) -> Self {
        self.cfg.tx_max_allocs = v;
        self
    }

    pub fn tx_max_retires(mut self, v: usize) -> Self {
        self.cfg.tx_max_retires = v;
        self
    }

    pub fn max_read_tries(mut self, v: usize) -> Self {
        self.cfg.max_read_tries = v;
        self
    }

    pub fn reclaim_threshold(mut self, v: usize) -> Self {
        self.cfg.reclaim_threshold = v;
        self
    }

    /// Validates the configuration and returns it.
    pub fn build(self) -> Result<StmConfig> {
        self.cfg.validate()?;
        Ok(self.cfg)
    }
}
