//! Per-batch transformations run by Concat/Merge before a batch is handed
//! on. In a Merge they run on the worker thread of the batch's source.

use std::marker::PhantomData;
use std::sync::Arc;

use fedq_core::{Batch, BatchType, Projector};

use crate::dedup::{AnyDedup, Dedup};

pub trait BatchProcessor<B: Batch>: Send + Sync {
    /// Transform `batch`, produced by source `source`, in place. Batches left
    /// empty are not forwarded.
    fn process(&self, batch: &mut B, source: usize);
}

/// One projector for every source, or one per source index.
fn pick(projectors: &[Projector], source: usize) -> Option<&Projector> {
    match projectors {
        [] => None,
        [only] => Some(only),
        many => many.get(source),
    }
}

/// Removes duplicate rows through a shared dedup table.
pub struct DedupProcessor<T: BatchType> {
    dedup: Arc<AnyDedup<T>>,
    projectors: Vec<Projector>,
}

impl<T: BatchType> DedupProcessor<T> {
    pub fn new(dedup: Arc<AnyDedup<T>>) -> Self {
        Self {
            dedup,
            projectors: Vec::new(),
        }
    }

    /// Project every batch before testing.
    pub fn with_projector(mut self, projector: Projector) -> Self {
        self.projectors = vec![projector];
        self
    }

    /// Project batches of source `i` with `projectors[i]` before testing.
    pub fn per_source(mut self, projectors: Vec<Projector>) -> Self {
        self.projectors = projectors;
        self
    }

    pub fn dedup(&self) -> &Arc<AnyDedup<T>> {
        &self.dedup
    }
}

impl<T: BatchType> BatchProcessor<T::Batch> for DedupProcessor<T> {
    fn process(&self, batch: &mut T::Batch, source: usize) {
        self.dedup
            .filter(batch, source, pick(&self.projectors, source));
    }
}

/// Reorders columns, per source when sources disagree on their layout.
pub struct ProjectProcessor {
    projectors: Vec<Projector>,
}

impl ProjectProcessor {
    pub fn new(projector: Projector) -> Self {
        Self {
            projectors: vec![projector],
        }
    }

    pub fn per_source(projectors: Vec<Projector>) -> Self {
        Self { projectors }
    }
}

impl<B: Batch> BatchProcessor<B> for ProjectProcessor {
    fn process(&self, batch: &mut B, source: usize) {
        if let Some(p) = pick(&self.projectors, source) {
            p.project(batch);
        }
    }
}

/// Keeps rows for which the predicate holds.
pub struct RowFilter<B, F> {
    keep: F,
    _batch: PhantomData<fn(&B)>,
}

impl<B: Batch, F: Fn(&B, usize) -> bool + Send + Sync> RowFilter<B, F> {
    pub fn new(keep: F) -> Self {
        Self {
            keep,
            _batch: PhantomData,
        }
    }
}

impl<B: Batch, F: Fn(&B, usize) -> bool + Send + Sync> BatchProcessor<B> for RowFilter<B, F> {
    fn process(&self, batch: &mut B, _source: usize) {
        let keep: Vec<bool> = (0..batch.rows()).map(|r| (self.keep)(batch, r)).collect();
        if keep.iter().any(|k| !k) {
            batch.retain_mask(&keep);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedq_core::term::int;
    use fedq_core::{TermBatch, Vars};

    #[test]
    fn row_filter_compacts_in_order() {
        let f = RowFilter::new(|b: &TermBatch, r| b.get(r, 0) != Some(int(2)));
        let mut batch = TermBatch::of_rows(1, (1..=4).map(|i| vec![Some(int(i))]));
        f.process(&mut batch, 0);
        assert_eq!(
            batch.to_rows(),
            vec![vec![Some(int(1))], vec![Some(int(3))], vec![Some(int(4))]]
        );
    }

    #[test]
    fn per_source_projection() {
        let out = Vars::of(["x", "y"]);
        let p = ProjectProcessor::per_source(vec![
            Projector::new(&out, &Vars::of(["x", "y"])),
            Projector::new(&out, &Vars::of(["y", "x"])),
        ]);
        let mut batch = TermBatch::of_rows(2, vec![vec![Some(int(2)), Some(int(1))]]);
        p.process(&mut batch, 1);
        assert_eq!(batch.to_rows(), vec![vec![Some(int(1)), Some(int(2))]]);
    }
}
