//! Byte budget and recycling pool tests

mod test_data_gen;

use std::sync::Arc;
use std::thread;

use fedq_core::budget::{BudgetGuard, MemoryBudget};
use fedq_core::config::EngineConfig;
use fedq_core::{Batch, BatchType, TermBatch};
use fedq_mem::{BatchPool, MemoryBudgetImpl, TermBatchType};
use test_data_gen::ints;

#[test]
fn test_budget_acquire_release() {
    let budget = MemoryBudgetImpl::new(1024 * 1024);
    assert_eq!(budget.used_bytes(), 0);

    let guard = budget
        .try_acquire(100 * 1024, "test")
        .expect("Acquire failed");
    assert_eq!(budget.used_bytes(), 100 * 1024);
    assert_eq!(guard.bytes(), 100 * 1024);
    assert_eq!(guard.tag(), "test");

    drop(guard);
    assert_eq!(budget.used_bytes(), 0);
}

#[test]
fn test_budget_exhaustion() {
    let budget = MemoryBudgetImpl::new(500 * 1024);
    let first = budget
        .try_acquire(400 * 1024, "test")
        .expect("First acquire failed");
    assert!(budget.try_acquire(200 * 1024, "test").is_none());
    assert_eq!(budget.used_bytes(), 400 * 1024);
    assert_eq!(budget.available_bytes(), 100 * 1024);

    drop(first);
    let second = budget
        .try_acquire(200 * 1024, "test")
        .expect("Acquire after release failed");
    assert_eq!(budget.used_bytes(), 200 * 1024);
    drop(second);
}

#[test]
fn test_budget_zero_size_allocation() {
    let budget = MemoryBudgetImpl::new(0);
    let guard = budget.try_acquire(0, "test").expect("zero bytes always fit");
    assert_eq!(guard.bytes(), 0);
    assert_eq!(budget.used_bytes(), 0);
}

#[test]
fn test_budget_concurrent_access() {
    let budget = Arc::new(MemoryBudgetImpl::new(1024 * 1024));
    let handles: Vec<_> = (0..10)
        .map(|_| {
            let budget = Arc::clone(&budget);
            thread::spawn(move || {
                for _ in 0..100 {
                    if let Some(guard) = budget.try_acquire(200 * 1024, "test") {
                        assert!(budget.used_bytes() <= 1024 * 1024);
                        drop(guard);
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().expect("Thread panicked");
    }
    assert_eq!(budget.used_bytes(), 0);
    let full = budget
        .try_acquire(1024 * 1024, "test")
        .expect("Should be able to acquire full budget");
    drop(full);
}

#[test]
fn test_pool_holds_bytes_while_batches_are_pooled() {
    let pool = BatchPool::<TermBatch>::new(8, 1 << 20);
    let batch = ints(0..64);
    let bytes = batch.approx_bytes();
    assert!(pool.offer(batch));
    assert_eq!(pool.budget().used_bytes(), bytes);
    assert_eq!(pool.peak_bytes(), bytes);

    let taken = pool.take(4, 3).expect("pooled batch");
    assert_eq!(taken.cols(), 3);
    assert!(taken.is_empty());
    assert_eq!(pool.budget().used_bytes(), 0);
    assert_eq!(pool.peak_bytes(), bytes);
}

#[test]
fn test_pool_rejects_over_budget() {
    let big = ints(0..1_000);
    let pool = BatchPool::<TermBatch>::new(8, big.approx_bytes() - 1);
    assert!(!pool.offer(big));
    assert!(pool.is_empty());
    assert_eq!(pool.rejected(), 1);
    assert_eq!(pool.budget().used_bytes(), 0);
}

#[test]
fn test_disabled_pool_from_config() {
    let cfg = EngineConfig {
        pool_max_batches: 0,
        ..EngineConfig::default()
    };
    let ty = TermBatchType::from_config(&cfg);
    assert!(!ty.recycle(ints([1])));
    assert!(ty.pool().is_empty());
    assert_eq!(ty.pool().max_batches(), 0);
}

#[test]
fn test_concurrent_recycling_respects_limits() {
    let ty = TermBatchType::new(16, 64 * 1024);
    let handles: Vec<_> = (0..8)
        .map(|t| {
            let ty = ty.clone();
            thread::spawn(move || {
                for i in 0..50 {
                    let b = ty.create(32, 2);
                    drop(b);
                    ty.recycle(ints([t * 100 + i]));
                    assert!(ty.pool().len() <= 16);
                    assert!(ty.pool().budget().used_bytes() <= 64 * 1024);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().expect("Thread panicked");
    }
    while ty.pool().take(1, 1).is_some() {}
    assert_eq!(ty.pool().budget().used_bytes(), 0);
}
