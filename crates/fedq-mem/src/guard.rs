//! Byte budget and its RAII guards.
//!
//! Pools acquire a guard before retaining a batch; dropping the guard (when
//! the batch leaves the pool) returns the bytes.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use fedq_core::budget::{BudgetGuard, MemoryBudget};

struct BudgetInner {
    capacity: usize,
    used: AtomicUsize,
}

impl BudgetInner {
    fn try_acquire(&self, bytes: usize) -> bool {
        let mut cur = self.used.load(Ordering::Relaxed);
        loop {
            let next = cur.saturating_add(bytes);
            if next > self.capacity {
                return false;
            }
            match self
                .used
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(observed) => cur = observed,
            }
        }
    }

    fn release(&self, bytes: usize) {
        let prev = self.used.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(prev >= bytes, "budget released more than acquired");
    }
}

/// Lock-free byte budget shared by clones.
#[derive(Clone)]
pub struct MemoryBudgetImpl {
    inner: Arc<BudgetInner>,
}

impl MemoryBudgetImpl {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            inner: Arc::new(BudgetInner {
                capacity: capacity_bytes,
                used: AtomicUsize::new(0),
            }),
        }
    }

    fn guard(&self, bytes: usize, tag: &'static str) -> BudgetGuardImpl {
        BudgetGuardImpl {
            inner: Arc::clone(&self.inner),
            bytes,
            tag,
        }
    }
}

impl fmt::Debug for MemoryBudgetImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBudgetImpl")
            .field("capacity", &self.inner.capacity)
            .field("used", &self.inner.used.load(Ordering::Relaxed))
            .finish()
    }
}

impl MemoryBudget for MemoryBudgetImpl {
    type Guard = BudgetGuardImpl;

    fn try_acquire(&self, bytes: usize, tag: &'static str) -> Option<Self::Guard> {
        if bytes == 0 || self.inner.try_acquire(bytes) {
            Some(self.guard(bytes, tag))
        } else {
            None
        }
    }

    fn capacity_bytes(&self) -> usize {
        self.inner.capacity
    }

    fn used_bytes(&self) -> usize {
        self.inner.used.load(Ordering::Relaxed)
    }
}

/// Accounts for `bytes` until dropped.
pub struct BudgetGuardImpl {
    inner: Arc<BudgetInner>,
    bytes: usize,
    tag: &'static str,
}

impl BudgetGuardImpl {
    /// Grow or shrink the accounted size. Shrinking always succeeds; growing
    /// fails without side effects when the budget cannot cover the delta.
    pub fn try_resize(&mut self, new_bytes: usize) -> bool {
        if new_bytes <= self.bytes {
            self.inner.release(self.bytes - new_bytes);
            self.bytes = new_bytes;
            return true;
        }
        if self.inner.try_acquire(new_bytes - self.bytes) {
            self.bytes = new_bytes;
            true
        } else {
            false
        }
    }
}

impl Drop for BudgetGuardImpl {
    fn drop(&mut self) {
        if self.bytes > 0 {
            self.inner.release(self.bytes);
            self.bytes = 0;
        }
    }
}

impl BudgetGuard for BudgetGuardImpl {
    fn bytes(&self) -> usize {
        self.bytes
    }

    fn tag(&self) -> &'static str {
        self.tag
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_release_on_drop() {
        let budget = MemoryBudgetImpl::new(100);
        let a = budget.try_acquire(60, "a").expect("fits");
        assert!(budget.try_acquire(50, "b").is_none());
        assert_eq!(budget.used_bytes(), 60);
        drop(a);
        assert_eq!(budget.used_bytes(), 0);
        assert!(budget.try_acquire(100, "c").is_some());
    }

    #[test]
    fn resize_respects_capacity() {
        let budget = MemoryBudgetImpl::new(100);
        let mut g = budget.try_acquire(10, "g").expect("fits");
        assert!(g.try_resize(90));
        assert!(!g.try_resize(120));
        assert_eq!(g.bytes(), 90);
        assert!(g.try_resize(5));
        assert_eq!(budget.used_bytes(), 5);
    }
}
