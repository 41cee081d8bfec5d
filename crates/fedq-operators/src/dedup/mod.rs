//! Concurrent row sets enforcing DISTINCT.
//!
//! `is_duplicate` tests and inserts in one step. A `true` answer is never
//! spurious: the row is (or was) present, and for the cross-source variant it
//! was emitted by a different source. The variants differ in how many
//! duplicates they may miss:
//!
//! - `StrongDedup`: none.
//! - `WeakDedup`: rows evicted by collisions, or skipped under contention.
//! - `WeakCrossSourceDedup`: repeats from the same source are never
//!   duplicates; evictions and races may miss cross-source repeats.

mod cross;
mod strong;
mod weak;

pub use cross::WeakCrossSourceDedup;
pub use strong::StrongDedup;
pub use weak::WeakDedup;

use fedq_core::config::EngineConfig;
use fedq_core::{Batch, BatchType, Projector};

pub trait Dedup<B: Batch>: Send + Sync {
    /// True when `batch[row]` was seen before; inserts it otherwise.
    fn is_duplicate(&self, batch: &B, row: usize, source: usize) -> bool;

    /// Rows the table is sized for.
    fn capacity(&self) -> usize;

    /// Rows currently held. Approximate for the weak variants.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop duplicate rows of `batch` in place, survivors compacted to the
    /// front in order. With a projector, rows are projected first and
    /// distinctness applies to the projected rows.
    fn filter(&self, batch: &mut B, source: usize, projector: Option<&Projector>) {
        if let Some(p) = projector {
            p.project(batch);
        }
        let keep: Vec<bool> = (0..batch.rows())
            .map(|r| !self.is_duplicate(batch, r, source))
            .collect();
        if keep.iter().any(|k| !k) {
            batch.retain_mask(&keep);
        }
    }
}

/// The closed set of dedup engines.
pub enum AnyDedup<T: BatchType> {
    Strong(StrongDedup<T>),
    Weak(WeakDedup<T>),
    WeakCrossSource(WeakCrossSourceDedup<T>),
}

impl<T: BatchType> AnyDedup<T> {
    pub fn strong(ty: &T, cols: usize, cfg: &EngineConfig) -> Self {
        AnyDedup::Strong(StrongDedup::new(
            ty,
            cols,
            cfg.strong_dedup_initial_capacity,
            cfg.strong_dedup_max_entries,
        ))
    }

    pub fn weak(ty: &T, cols: usize, capacity: usize) -> Self {
        AnyDedup::Weak(WeakDedup::new(ty, cols, capacity))
    }

    pub fn cross_source(ty: &T, cols: usize, capacity: usize) -> Self {
        AnyDedup::WeakCrossSource(WeakCrossSourceDedup::new(ty, cols, capacity))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AnyDedup::Strong(_) => "strong",
            AnyDedup::Weak(_) => "weak",
            AnyDedup::WeakCrossSource(_) => "weak-cross-source",
        }
    }
}

impl<T: BatchType> Dedup<T::Batch> for AnyDedup<T> {
    fn is_duplicate(&self, batch: &T::Batch, row: usize, source: usize) -> bool {
        match self {
            AnyDedup::Strong(d) => d.is_duplicate(batch, row, source),
            AnyDedup::Weak(d) => d.is_duplicate(batch, row, source),
            AnyDedup::WeakCrossSource(d) => d.is_duplicate(batch, row, source),
        }
    }

    fn capacity(&self) -> usize {
        match self {
            AnyDedup::Strong(d) => d.capacity(),
            AnyDedup::Weak(d) => d.capacity(),
            AnyDedup::WeakCrossSource(d) => d.capacity(),
        }
    }

    fn len(&self) -> usize {
        match self {
            AnyDedup::Strong(d) => d.len(),
            AnyDedup::Weak(d) => d.len(),
            AnyDedup::WeakCrossSource(d) => d.len(),
        }
    }
}

/// Set bit `i` of a fixed atomic bitset. Returns the previous value.
pub(crate) fn set_bit(bits: &[std::sync::atomic::AtomicU64], i: usize) -> bool {
    let mask = 1u64 << (i % 64);
    bits[i / 64].fetch_or(mask, std::sync::atomic::Ordering::AcqRel) & mask != 0
}

pub(crate) fn test_bit(bits: &[std::sync::atomic::AtomicU64], i: usize) -> bool {
    let mask = 1u64 << (i % 64);
    bits[i / 64].load(std::sync::atomic::Ordering::Acquire) & mask != 0
}

pub(crate) fn bitset(bits: usize) -> Box<[std::sync::atomic::AtomicU64]> {
    (0..bits.div_ceil(64))
        .map(|_| std::sync::atomic::AtomicU64::new(0))
        .collect()
}

#[cfg(test)]
pub(crate) mod test_rows {
    use fedq_core::term::int;
    use fedq_core::TermBatch;
    use fedq_mem::TermBatchType;

    pub fn ty() -> TermBatchType {
        TermBatchType::new(0, 0)
    }

    pub fn ints(values: impl IntoIterator<Item = i64>) -> TermBatch {
        TermBatch::of_rows(1, values.into_iter().map(|i| vec![Some(int(i))]))
    }
}
