//! Abstract memory budget interfaces.
//!
//! The concrete implementation lives in `fedq-mem`. Only traits live here so
//! batch representations can report sizes without pulling the pool logic.

/// A guard returned by a memory budget when bytes are acquired.
///
/// It must be RAII (releases on Drop) and `Send`: pooled batches carry their
/// guard across threads together with the batch.
pub trait BudgetGuard: Send {
    /// Number of bytes currently accounted for by this guard.
    fn bytes(&self) -> usize;
    /// Debug tag for metrics/tracing.
    fn tag(&self) -> &'static str {
        "guard"
    }
}

/// A handle representing a byte-cap enforcer.
///
/// Recycling pools call `try_acquire` before retaining a batch. `None` means
/// the batch must be dropped instead.
pub trait MemoryBudget: Send + Sync + 'static {
    type Guard: BudgetGuard;

    /// Attempt to acquire `bytes` from the live budget. Returns a guard on success.
    fn try_acquire(&self, bytes: usize, tag: &'static str) -> Option<Self::Guard>;

    /// Total configured capacity (bytes).
    fn capacity_bytes(&self) -> usize;

    /// Approximate currently used bytes (advisory; not a correctness API).
    fn used_bytes(&self) -> usize;

    fn available_bytes(&self) -> usize {
        self.capacity_bytes().saturating_sub(self.used_bytes())
    }
}
