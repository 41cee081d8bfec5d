//! Bounded batch recycling pool.
//!
//! A pool retains at most `max_batches` batches and at most the budget's
//! capacity in `approx_bytes`. Every retained batch carries the guard that
//! accounts for it, so taking a batch out releases its bytes.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use fedq_core::budget::MemoryBudget;
use fedq_core::config::EngineConfig;
use fedq_core::Batch;

use crate::guard::{BudgetGuardImpl, MemoryBudgetImpl};
use crate::tracking::PeakTracker;

struct Pooled<B> {
    batch: B,
    _guard: BudgetGuardImpl,
}

pub struct BatchPool<B: Batch> {
    slots: Mutex<Vec<Pooled<B>>>,
    max_batches: usize,
    budget: MemoryBudgetImpl,
    peak: PeakTracker,
    rejected: AtomicU64,
}

impl<B: Batch> BatchPool<B> {
    pub fn new(max_batches: usize, budget_bytes: usize) -> Self {
        Self {
            slots: Mutex::new(Vec::with_capacity(max_batches.min(64))),
            max_batches,
            budget: MemoryBudgetImpl::new(budget_bytes),
            peak: PeakTracker::new(),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self::new(cfg.pool_max_batches, cfg.pool_budget_bytes)
    }

    /// Retain `batch` for reuse. Returns false, dropping the batch, when the
    /// pool is full or the byte budget cannot cover it.
    pub fn offer(&self, batch: B) -> bool {
        if self.max_batches == 0 {
            return self.reject(batch, "disabled");
        }
        let Some(guard) = self.budget.try_acquire(batch.approx_bytes(), "batch-pool") else {
            return self.reject(batch, "over budget");
        };
        {
            let mut slots = self.slots.lock();
            if slots.len() >= self.max_batches {
                drop(slots);
                drop(guard);
                return self.reject(batch, "full");
            }
            slots.push(Pooled {
                batch,
                _guard: guard,
            });
        }
        self.peak.record_used(self.budget.used_bytes());
        true
    }

    /// A pooled batch cleared to `cols` columns with room for `rows` rows.
    pub fn take(&self, rows: usize, cols: usize) -> Option<B> {
        let pooled = self.slots.lock().pop()?;
        let mut batch = pooled.batch;
        batch.clear(cols);
        batch.reserve(rows);
        Some(batch)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_batches(&self) -> usize {
        self.max_batches
    }

    pub fn budget(&self) -> &MemoryBudgetImpl {
        &self.budget
    }

    /// Highest number of pooled bytes observed.
    pub fn peak_bytes(&self) -> usize {
        self.peak.peak()
    }

    /// Batches refused so far.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    fn reject(&self, batch: B, reason: &'static str) -> bool {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "tracing")]
        tracing::trace!(reason, bytes = batch.approx_bytes(), "batch pool rejected batch");
        #[cfg(not(feature = "tracing"))]
        let _ = reason;
        drop(batch);
        false
    }
}

impl<B: Batch> fmt::Debug for BatchPool<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchPool")
            .field("len", &self.len())
            .field("max_batches", &self.max_batches)
            .field("budget", &self.budget)
            .finish()
    }
}
