//! Synchronous in-memory source BIts. They never block, so wait bounds are
//! no-ops for them.

use std::collections::VecDeque;
use std::marker::PhantomData;

use fedq_core::{Batch, BatchType, Error, Result, Vars};

use crate::bit::{BIt, BatchLimits, Terminal};
use crate::queue::fill;

/// A BIt that is exhausted from the start.
pub struct EmptyBIt<B> {
    vars: Vars,
    limits: BatchLimits,
    terminal: Terminal,
    _batch: PhantomData<fn() -> B>,
}

impl<B: Batch> EmptyBIt<B> {
    pub fn new(vars: Vars) -> Self {
        Self {
            vars,
            limits: BatchLimits::default(),
            terminal: Terminal::default(),
            _batch: PhantomData,
        }
    }
}

impl<B: Batch> BIt<B> for EmptyBIt<B> {
    fn vars(&self) -> &Vars {
        &self.vars
    }

    fn limits(&self) -> BatchLimits {
        self.limits
    }

    fn set_limits(&mut self, limits: BatchLimits) -> Result<()> {
        limits.validate()?;
        self.limits = limits;
        Ok(())
    }

    fn next_batch(&mut self, _recycled: Option<B>) -> Result<Option<B>> {
        if let Some(done) = self.terminal.check() {
            return done;
        }
        self.terminal.exhaust();
        Ok(None)
    }

    fn recycle(&mut self, _batch: B) -> bool {
        false
    }

    fn close(&mut self) -> Result<()> {
        self.terminal.close();
        Ok(())
    }
}

/// Pre-materialized batches, re-chunked to the current limits.
pub struct BatchesBIt<T: BatchType> {
    ty: T,
    vars: Vars,
    limits: BatchLimits,
    ready: VecDeque<T::Batch>,
    terminal: Terminal,
}

impl<T: BatchType> BatchesBIt<T> {
    pub fn new(ty: T, vars: Vars, batches: impl IntoIterator<Item = T::Batch>) -> Self {
        let ready = batches.into_iter().filter(|b| !b.is_empty()).collect();
        Self {
            ty,
            vars,
            limits: BatchLimits::default(),
            ready,
            terminal: Terminal::default(),
        }
    }

    /// Rows not yet delivered.
    pub fn remaining_rows(&self) -> usize {
        self.ready.iter().map(Batch::rows).sum()
    }
}

impl<T: BatchType> BIt<T::Batch> for BatchesBIt<T> {
    fn vars(&self) -> &Vars {
        &self.vars
    }

    fn limits(&self) -> BatchLimits {
        self.limits
    }

    fn set_limits(&mut self, limits: BatchLimits) -> Result<()> {
        limits.validate()?;
        self.limits = limits;
        Ok(())
    }

    fn next_batch(&mut self, recycled: Option<T::Batch>) -> Result<Option<T::Batch>> {
        if let Some(r) = recycled {
            self.ty.recycle(r);
        }
        if let Some(done) = self.terminal.check() {
            return done;
        }
        let mut acc = None;
        fill(&mut acc, &mut self.ready, self.limits.max_batch);
        if acc.is_none() {
            self.terminal.exhaust();
        }
        Ok(acc)
    }

    fn recycle(&mut self, batch: T::Batch) -> bool {
        self.ty.recycle(batch)
    }

    fn close(&mut self) -> Result<()> {
        if self.terminal.close() {
            for b in self.ready.drain(..) {
                self.ty.recycle(b);
            }
        }
        Ok(())
    }
}

/// Fails on the first `next_batch`.
pub struct ErrorBIt<B> {
    vars: Vars,
    limits: BatchLimits,
    error: Error,
    terminal: Terminal,
    _batch: PhantomData<fn() -> B>,
}

impl<B: Batch> ErrorBIt<B> {
    pub fn new(vars: Vars, error: Error) -> Self {
        Self {
            vars,
            limits: BatchLimits::default(),
            error,
            terminal: Terminal::default(),
            _batch: PhantomData,
        }
    }
}

impl<B: Batch> BIt<B> for ErrorBIt<B> {
    fn vars(&self) -> &Vars {
        &self.vars
    }

    fn limits(&self) -> BatchLimits {
        self.limits
    }

    fn set_limits(&mut self, limits: BatchLimits) -> Result<()> {
        limits.validate()?;
        self.limits = limits;
        Ok(())
    }

    fn next_batch(&mut self, _recycled: Option<B>) -> Result<Option<B>> {
        if let Some(done) = self.terminal.check() {
            return done;
        }
        Err(self.terminal.fail(self.error.clone()))
    }

    fn recycle(&mut self, _batch: B) -> bool {
        false
    }

    fn close(&mut self) -> Result<()> {
        self.terminal.close();
        Ok(())
    }
}

/// Yields the rows of `rows`, then fails with `error`.
pub struct FailingBIt<T: BatchType> {
    rows: BatchesBIt<T>,
    error: Error,
    terminal: Terminal,
}

impl<T: BatchType> FailingBIt<T> {
    pub fn new(ty: T, vars: Vars, rows: T::Batch, error: Error) -> Self {
        Self {
            rows: BatchesBIt::new(ty, vars, [rows]),
            error,
            terminal: Terminal::default(),
        }
    }
}

impl<T: BatchType> BIt<T::Batch> for FailingBIt<T> {
    fn vars(&self) -> &Vars {
        self.rows.vars()
    }

    fn limits(&self) -> BatchLimits {
        self.rows.limits()
    }

    fn set_limits(&mut self, limits: BatchLimits) -> Result<()> {
        self.rows.set_limits(limits)
    }

    fn next_batch(&mut self, recycled: Option<T::Batch>) -> Result<Option<T::Batch>> {
        if let Some(done) = self.terminal.check() {
            return done;
        }
        match self.rows.next_batch(recycled)? {
            Some(b) => Ok(Some(b)),
            None => Err(self.terminal.fail(self.error.clone())),
        }
    }

    fn recycle(&mut self, batch: T::Batch) -> bool {
        self.rows.recycle(batch)
    }

    fn close(&mut self) -> Result<()> {
        self.terminal.close();
        self.rows.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bit::BItExt;
    use fedq_core::term::int;
    use fedq_core::TermBatch;
    use fedq_mem::TermBatchType;

    fn ty() -> TermBatchType {
        TermBatchType::new(8, usize::MAX)
    }

    fn ints(values: std::ops::Range<i64>) -> TermBatch {
        TermBatch::of_rows(1, values.map(|i| vec![Some(int(i))]))
    }

    #[test]
    fn batches_are_rechunked_to_limits() {
        let bit = BatchesBIt::new(ty(), Vars::of(["x"]), [ints(0..3), ints(3..4), ints(4..9)]);
        let mut bit = bit.min_batch(1).unwrap().max_batch(4).unwrap();
        let mut sizes = Vec::new();
        while let Some(b) = bit.next_batch(None).unwrap() {
            sizes.push(b.rows());
        }
        assert_eq!(sizes, vec![4, 4, 1]);
        assert!(bit.next_batch(None).unwrap().is_none());
    }

    #[test]
    fn close_before_exhaustion_reports_cancelled() {
        let mut bit = BatchesBIt::new(ty(), Vars::of(["x"]), [ints(0..3)]);
        bit.close().unwrap();
        bit.close().unwrap();
        assert!(matches!(bit.next_batch(None), Err(Error::Cancelled)));

        let mut bit: EmptyBIt<TermBatch> = EmptyBIt::new(Vars::of(["x"]));
        assert!(bit.next_batch(None).unwrap().is_none());
        bit.close().unwrap();
        assert!(bit.next_batch(None).unwrap().is_none());
    }

    #[test]
    fn failing_bit_yields_rows_then_repeats_its_error() {
        let mut bit = FailingBIt::new(ty(), Vars::of(["x"]), ints(0..2), Error::upstream("down"));
        assert_eq!(bit.next_batch(None).unwrap().unwrap().rows(), 2);
        for _ in 0..3 {
            match bit.next_batch(None) {
                Err(Error::Source(m)) => assert_eq!(m, "down"),
                other => panic!("unexpected {other:?}"),
            }
        }
        bit.close().unwrap();
        assert!(matches!(bit.next_batch(None), Err(Error::Source(_))));
    }

    #[test]
    fn invalid_limits_are_rejected() {
        let bit = BatchesBIt::new(ty(), Vars::of(["x"]), [ints(0..1)]);
        let bit = bit.max_batch(2).unwrap();
        assert!(matches!(bit.min_batch(3), Err(Error::Protocol(_))));
    }
}
