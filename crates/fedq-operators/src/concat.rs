//! Sequential composition: source 0 is drained fully before source 1.
//!
//! Output batches keep filling toward `min_batch` across source boundaries,
//! so total row order is preserved but batch boundaries are not.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use fedq_core::{Batch, BatchType, CloseErrors, Projector, Result, Vars};

use crate::bit::{delegate_bit, BIt, BatchLimits, Interrupt, InterruptCell, Terminal};
use crate::dedup::AnyDedup;
use crate::processor::{BatchProcessor, DedupProcessor};

type Source<B> = Box<dyn BIt<B>>;

pub struct ConcatBIt<T: BatchType> {
    ty: T,
    vars: Vars,
    limits: BatchLimits,
    current: Option<(usize, Source<T::Batch>)>,
    pending: VecDeque<Source<T::Batch>>,
    next_index: usize,
    processor: Option<Arc<dyn BatchProcessor<T::Batch>>>,
    carry: Option<T::Batch>,
    interrupts: Arc<InterruptCell>,
    close_errors: CloseErrors,
    terminal: Terminal,
}

impl<T: BatchType> ConcatBIt<T> {
    pub fn new(ty: T, vars: Vars, sources: Vec<Source<T::Batch>>) -> Self {
        let interrupts = Arc::new(InterruptCell::new());
        for s in &sources {
            if let Some(h) = s.interrupt_handle() {
                interrupts.register(h);
            }
        }
        Self {
            ty,
            vars,
            limits: BatchLimits::default(),
            current: None,
            pending: sources.into(),
            next_index: 0,
            processor: None,
            carry: None,
            interrupts,
            close_errors: CloseErrors::new(),
            terminal: Terminal::default(),
        }
    }

    /// Run `processor` on every source batch; `vars` must then describe the
    /// processor's output.
    pub fn with_processor(mut self, processor: Arc<dyn BatchProcessor<T::Batch>>) -> Self {
        self.processor = Some(processor);
        self
    }

    /// Close the current source and move to the next one.
    fn advance(&mut self) -> bool {
        if let Some((_, mut done)) = self.current.take() {
            self.close_errors.record(done.close());
        }
        match self.pending.pop_front() {
            Some(next) => {
                self.current = Some((self.next_index, next));
                self.next_index += 1;
                true
            }
            None => false,
        }
    }
}

impl<T: BatchType> BIt<T::Batch> for ConcatBIt<T> {
    fn vars(&self) -> &Vars {
        &self.vars
    }

    fn limits(&self) -> BatchLimits {
        self.limits
    }

    fn set_limits(&mut self, limits: BatchLimits) -> Result<()> {
        limits.validate()?;
        self.limits = limits;
        if let Some((_, cur)) = self.current.as_mut() {
            cur.set_limits(limits)?;
        }
        for s in self.pending.iter_mut() {
            s.set_limits(limits)?;
        }
        Ok(())
    }

    fn next_batch(&mut self, recycled: Option<T::Batch>) -> Result<Option<T::Batch>> {
        if self.carry.is_none() {
            if let Some(done) = self.terminal.check() {
                if let Some(r) = recycled {
                    self.ty.recycle(r);
                }
                return done;
            }
        }
        let mut recycled = recycled;
        let mut acc = self.carry.take();
        let deadline = Instant::now() + self.limits.max_wait;

        while self.terminal.is_open() {
            let held = acc.as_ref().map_or(0, Batch::rows);
            if held >= self.limits.min_batch || (held > 0 && Instant::now() >= deadline) {
                break;
            }
            let Some((index, cur)) = self.current.as_mut() else {
                if !self.advance() {
                    self.terminal.exhaust();
                }
                continue;
            };
            match cur.next_batch(recycled.take()) {
                Ok(Some(mut batch)) => {
                    if let Some(p) = &self.processor {
                        p.process(&mut batch, *index);
                    }
                    if batch.is_empty() {
                        recycled = Some(batch);
                        continue;
                    }
                    match acc.as_mut() {
                        Some(held) => held.append(batch),
                        None => acc = Some(batch),
                    }
                }
                Ok(None) => {
                    if !self.advance() {
                        self.terminal.exhaust();
                    }
                }
                Err(e) => {
                    let e = self.terminal.fail(e);
                    if acc.is_none() {
                        return Err(e);
                    }
                }
            }
        }

        if let Some(r) = recycled {
            self.ty.recycle(r);
        }
        if let Some(held) = acc.as_mut() {
            if held.rows() > self.limits.max_batch {
                self.carry = Some(held.split_off(self.limits.max_batch));
            }
        }
        Ok(acc)
    }

    fn recycle(&mut self, batch: T::Batch) -> bool {
        match self.current.as_mut() {
            Some((_, cur)) => cur.recycle(batch),
            None => self.ty.recycle(batch),
        }
    }

    fn interrupt_handle(&self) -> Option<Arc<dyn Interrupt>> {
        let cell: Arc<dyn Interrupt> = self.interrupts.clone();
        Some(cell)
    }

    fn close(&mut self) -> Result<()> {
        if self.terminal.close() {
            if let Some(c) = self.carry.take() {
                self.ty.recycle(c);
            }
            if let Some((_, mut cur)) = self.current.take() {
                self.close_errors.record(cur.close());
            }
            for mut s in self.pending.drain(..) {
                self.close_errors.record(s.close());
            }
        }
        std::mem::take(&mut self.close_errors).finish()
    }
}

impl<T: BatchType> Drop for ConcatBIt<T> {
    fn drop(&mut self) {
        if let Err(_e) = self.close() {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %_e, "concat close failed on drop");
        }
    }
}

/// Concat whose rows pass through a shared dedup table.
pub struct DedupConcatBIt<T: BatchType> {
    inner: ConcatBIt<T>,
    dedup: Arc<AnyDedup<T>>,
}

impl<T: BatchType> DedupConcatBIt<T> {
    /// `projector`, when given, maps source rows to the output layout before
    /// dedup; output vars are then the projector's.
    pub fn new(
        ty: T,
        vars: Vars,
        sources: Vec<Source<T::Batch>>,
        dedup: Arc<AnyDedup<T>>,
        projector: Option<Projector>,
    ) -> Self {
        let mut processor = DedupProcessor::new(Arc::clone(&dedup));
        let vars = match projector {
            Some(p) => {
                let out = p.out_vars().clone();
                processor = processor.with_projector(p);
                out
            }
            None => vars,
        };
        let inner = ConcatBIt::new(ty, vars, sources).with_processor(Arc::new(processor));
        Self { inner, dedup }
    }

    pub fn dedup(&self) -> &Arc<AnyDedup<T>> {
        &self.dedup
    }
}

delegate_bit!(DedupConcatBIt, inner);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bit::BItExt;
    use crate::source::{BatchesBIt, FailingBIt};
    use fedq_core::term::int;
    use fedq_core::{Error, TermBatch};
    use fedq_mem::TermBatchType;

    fn ty() -> TermBatchType {
        TermBatchType::new(8, usize::MAX)
    }

    fn ints(values: &[i64]) -> TermBatch {
        TermBatch::of_rows(1, values.iter().map(|&i| vec![Some(int(i))]))
    }

    fn source(values: &[i64]) -> Source<TermBatch> {
        Box::new(BatchesBIt::new(ty(), Vars::of(["x"]), [ints(values)]))
    }

    fn drain(bit: &mut dyn BIt<TermBatch>) -> Vec<Vec<i64>> {
        let mut out = Vec::new();
        while let Some(b) = bit.next_batch(None).unwrap() {
            out.push(
                (0..b.rows())
                    .map(|r| match b.get(r, 0) {
                        Some(fedq_core::term::Term::Literal(l)) => l.value().parse().unwrap(),
                        other => panic!("unexpected {other:?}"),
                    })
                    .collect(),
            );
        }
        out
    }

    #[test]
    fn fills_across_source_boundaries() {
        let bit = ConcatBIt::new(ty(), Vars::of(["x"]), vec![source(&[1, 2]), source(&[3, 4])]);
        let mut bit = bit.min_batch(3).unwrap().max_batch(3).unwrap();
        assert_eq!(drain(&mut bit), vec![vec![1, 2, 3], vec![4]]);
        assert!(bit.next_batch(None).unwrap().is_none());
    }

    #[test]
    fn rows_before_a_failure_are_delivered_first() {
        let failing = FailingBIt::new(ty(), Vars::of(["x"]), ints(&[3]), Error::upstream("gone"));
        let mut bit = ConcatBIt::new(
            ty(),
            Vars::of(["x"]),
            vec![source(&[1, 2]), Box::new(failing), source(&[9])],
        )
        .min_batch(10)
        .unwrap();
        assert_eq!(bit.next_batch(None).unwrap().unwrap().rows(), 3);
        assert!(matches!(bit.next_batch(None), Err(Error::Source(_))));
        assert!(matches!(bit.next_batch(None), Err(Error::Source(_))));
        bit.close().unwrap();
    }

    #[test]
    fn dedup_concat_filters_across_sources() {
        let ty = ty();
        let dedup = Arc::new(AnyDedup::strong(&ty, 1, &fedq_core::config::EngineConfig::default()));
        let mut bit = DedupConcatBIt::new(
            ty,
            Vars::of(["x"]),
            vec![source(&[1, 2, 1]), source(&[2, 3])],
            dedup,
            None,
        );
        let rows: Vec<i64> = drain(&mut bit).into_iter().flatten().collect();
        assert_eq!(rows, vec![1, 2, 3]);
    }
}
