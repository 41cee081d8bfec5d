//! Engine configuration that downstream crates can serialize/deserialize.

use std::time::Duration;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default lower bound on rows per batch handed to consumers.
    pub min_batch: usize,

    /// Default upper bound on rows per batch handed to consumers.
    pub max_batch: usize,

    /// Delay before the first return opportunity of queue-backed BIts.
    pub min_wait_ms: u64,

    /// Max time a queue-backed BIt accumulates before returning an undersized batch.
    pub max_wait_ms: u64,

    /// Queue slots a merge reserves per source. The queue holds at most
    /// `sources * merge_slots_per_source` ready batches.
    pub merge_slots_per_source: usize,

    /// Capacity (in batches) of single-producer hand-off queues (bind scatter).
    pub queue_capacity_batches: usize,

    /// Bound sub-queries drained concurrently per left batch by client-side bind.
    pub bind_concurrency: usize,

    /// Initial row capacity of strong (exact) DISTINCT tables.
    pub strong_dedup_initial_capacity: usize,

    /// Row count at which strong DISTINCT tables stop inserting.
    pub strong_dedup_max_entries: usize,

    /// Slots of weak (lossy) DISTINCT tables.
    pub weak_dedup_capacity: usize,

    /// Rows tracked by cross-source dedup on multi-bind fan-out. Zero disables it
    /// unless DISTINCT is requested by the caller.
    pub cross_dedup_capacity: usize,

    /// Max batches retained by a recycling pool.
    pub pool_max_batches: usize,

    /// Byte budget shared by everything a recycling pool retains.
    pub pool_budget_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_batch: 1,
            max_batch: 1024,
            min_wait_ms: 0,
            max_wait_ms: 50,
            merge_slots_per_source: 1,
            queue_capacity_batches: 4,
            bind_concurrency: 4,
            strong_dedup_initial_capacity: 1024,
            strong_dedup_max_entries: i32::MAX as usize,
            weak_dedup_capacity: 1 << 16,
            cross_dedup_capacity: 0,
            pool_max_batches: 64,
            pool_budget_bytes: 32 * 1024 * 1024, // 32 MiB default
        }
    }
}

static GLOBAL: Lazy<EngineConfig> = Lazy::new(EngineConfig::from_env);

impl EngineConfig {
    /// Process-wide defaults, resolved from the environment on first use.
    pub fn global() -> &'static EngineConfig {
        &GLOBAL
    }

    /// Create a config from environment variables, falling back to defaults.
    ///
    /// Environment variables:
    /// - `FEDQ_MIN_BATCH` / `FEDQ_MAX_BATCH`: batch row bounds
    /// - `FEDQ_MIN_WAIT_MS` / `FEDQ_MAX_WAIT_MS`: batch assembly wait bounds
    /// - `FEDQ_MERGE_SLOTS_PER_SOURCE`: merge queue depth per source
    /// - `FEDQ_QUEUE_CAPACITY_BATCHES`: hand-off queue depth
    /// - `FEDQ_BIND_CONCURRENCY`: concurrent bound sub-queries
    /// - `FEDQ_STRONG_DEDUP_INITIAL_CAPACITY` / `FEDQ_STRONG_DEDUP_MAX_ENTRIES`
    /// - `FEDQ_WEAK_DEDUP_CAPACITY` / `FEDQ_CROSS_DEDUP_CAPACITY`
    /// - `FEDQ_POOL_MAX_BATCHES` / `FEDQ_POOL_BUDGET_BYTES`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        env_usize("FEDQ_MIN_BATCH", &mut cfg.min_batch);
        env_usize("FEDQ_MAX_BATCH", &mut cfg.max_batch);
        env_u64("FEDQ_MIN_WAIT_MS", &mut cfg.min_wait_ms);
        env_u64("FEDQ_MAX_WAIT_MS", &mut cfg.max_wait_ms);
        env_usize("FEDQ_MERGE_SLOTS_PER_SOURCE", &mut cfg.merge_slots_per_source);
        env_usize("FEDQ_QUEUE_CAPACITY_BATCHES", &mut cfg.queue_capacity_batches);
        env_usize("FEDQ_BIND_CONCURRENCY", &mut cfg.bind_concurrency);
        env_usize(
            "FEDQ_STRONG_DEDUP_INITIAL_CAPACITY",
            &mut cfg.strong_dedup_initial_capacity,
        );
        env_usize("FEDQ_STRONG_DEDUP_MAX_ENTRIES", &mut cfg.strong_dedup_max_entries);
        env_usize("FEDQ_WEAK_DEDUP_CAPACITY", &mut cfg.weak_dedup_capacity);
        env_usize("FEDQ_CROSS_DEDUP_CAPACITY", &mut cfg.cross_dedup_capacity);
        env_usize("FEDQ_POOL_MAX_BATCHES", &mut cfg.pool_max_batches);
        env_usize("FEDQ_POOL_BUDGET_BYTES", &mut cfg.pool_budget_bytes);

        cfg
    }

    /// Reject combinations no BIt could honour.
    pub fn validate(&self) -> Result<()> {
        if self.min_batch == 0 || self.max_batch == 0 {
            return Err(Error::Config("batch bounds must be positive".into()));
        }
        if self.min_batch > self.max_batch {
            return Err(Error::Config(format!(
                "min_batch {} exceeds max_batch {}",
                self.min_batch, self.max_batch
            )));
        }
        if self.min_wait_ms > self.max_wait_ms {
            return Err(Error::Config(format!(
                "min_wait_ms {} exceeds max_wait_ms {}",
                self.min_wait_ms, self.max_wait_ms
            )));
        }
        if self.merge_slots_per_source == 0 || self.queue_capacity_batches == 0 {
            return Err(Error::Config("queue depths must be positive".into()));
        }
        if self.bind_concurrency == 0 {
            return Err(Error::Config("bind_concurrency must be positive".into()));
        }
        Ok(())
    }

    pub fn min_wait(&self) -> Duration {
        Duration::from_millis(self.min_wait_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

fn env_usize(key: &str, slot: &mut usize) {
    if let Ok(s) = std::env::var(key) {
        if let Ok(v) = s.parse::<usize>() {
            *slot = v;
        }
    }
}

fn env_u64(key: &str, slot: &mut u64) {
    if let Ok(s) = std::env::var(key) {
        if let Ok(v) = s.parse::<u64>() {
            *slot = v;
        }
    }
}
