//! Concrete `BatchType` factories backed by a shared recycling pool.
//!
//! Clones share one pool, so a batch recycled by a consumer thread is handed
//! out again to whichever producer creates next.

use std::sync::Arc;

use fedq_core::config::EngineConfig;
use fedq_core::dict::TermDict;
use fedq_core::{BatchType, IdBatch, TermBatch};

use crate::pool::BatchPool;

#[derive(Debug, Clone)]
pub struct TermBatchType {
    pool: Arc<BatchPool<TermBatch>>,
}

impl TermBatchType {
    pub fn new(max_batches: usize, budget_bytes: usize) -> Self {
        Self {
            pool: Arc::new(BatchPool::new(max_batches, budget_bytes)),
        }
    }

    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            pool: Arc::new(BatchPool::from_config(cfg)),
        }
    }

    pub fn pool(&self) -> &BatchPool<TermBatch> {
        &self.pool
    }
}

impl Default for TermBatchType {
    fn default() -> Self {
        Self::from_config(EngineConfig::global())
    }
}

impl BatchType for TermBatchType {
    type Batch = TermBatch;

    fn name(&self) -> &'static str {
        "term"
    }

    fn create(&self, rows: usize, cols: usize) -> TermBatch {
        self.pool
            .take(rows, cols)
            .unwrap_or_else(|| TermBatch::new(rows, cols))
    }

    fn recycle(&self, batch: TermBatch) -> bool {
        self.pool.offer(batch)
    }
}

/// Factory for batches of ids interned in one shared dictionary.
#[derive(Debug, Clone)]
pub struct IdBatchType {
    dict: Arc<TermDict>,
    pool: Arc<BatchPool<IdBatch>>,
}

impl IdBatchType {
    pub fn new(dict: Arc<TermDict>, cfg: &EngineConfig) -> Self {
        Self {
            dict,
            pool: Arc::new(BatchPool::from_config(cfg)),
        }
    }

    pub fn dict(&self) -> &Arc<TermDict> {
        &self.dict
    }

    pub fn pool(&self) -> &BatchPool<IdBatch> {
        &self.pool
    }
}

impl Default for IdBatchType {
    fn default() -> Self {
        Self::new(Arc::new(TermDict::new()), EngineConfig::global())
    }
}

impl BatchType for IdBatchType {
    type Batch = IdBatch;

    fn name(&self) -> &'static str {
        "id"
    }

    fn create(&self, rows: usize, cols: usize) -> IdBatch {
        self.pool
            .take(rows, cols)
            .unwrap_or_else(|| IdBatch::new(Arc::clone(&self.dict), rows, cols))
    }

    /// Batches of a foreign dictionary are refused so `create` never hands out
    /// ids that this type cannot resolve.
    fn recycle(&self, batch: IdBatch) -> bool {
        if !Arc::ptr_eq(batch.dict(), &self.dict) {
            return false;
        }
        self.pool.offer(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedq_core::term::{int, iri};
    use fedq_core::Batch;

    #[test]
    fn created_batches_are_recycled() {
        let ty = TermBatchType::new(4, usize::MAX);
        let mut b = ty.create(8, 2);
        b.begin_put();
        b.put_term(0, Some(&int(1)));
        b.commit_put();
        assert!(ty.recycle(b));
        assert_eq!(ty.pool().len(), 1);

        let again = ty.create(1, 3);
        assert_eq!(again.rows(), 0);
        assert_eq!(again.cols(), 3);
        assert!(ty.pool().is_empty());
    }

    #[test]
    fn id_type_converts_and_rejects_foreign_batches() {
        let ty = IdBatchType::new(Arc::new(TermDict::new()), &EngineConfig::default());
        let src = TermBatch::of_rows(2, vec![vec![Some(iri("http://e/a")), None]]);
        let ids = ty.convert(&src);
        assert_eq!(ids.rows(), 1);
        assert_eq!(ids.get(0, 0), Some(iri("http://e/a")));
        assert_eq!(ids.get(0, 1), None);

        let foreign = IdBatch::new(Arc::new(TermDict::new()), 1, 1);
        assert!(!ty.recycle(foreign));
        assert!(ty.recycle(ids));
    }
}
