//! Concurrent composition: one named worker thread per source feeding a
//! shared bounded queue.
//!
//! Rows of one source keep their order; sources interleave freely. The
//! first source error ends the queue, after which batches already queued are
//! still delivered before the error. Closing ends the queue with
//! `Error::Cancelled`, interrupts every source and waits until all workers
//! exited; workers close their own source and `close` aggregates those
//! failures.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use fedq_core::config::EngineConfig;
use fedq_core::{Batch, BatchType, CloseErrors, Error, Projector, Result, Vars};

use crate::bit::{delegate_bit, BIt, BatchLimits, Interrupt, InterruptCell, Terminal};
use crate::dedup::AnyDedup;
use crate::processor::{BatchProcessor, DedupProcessor};
use crate::queue::BatchQueue;

type Source<B> = Box<dyn BIt<B>>;

struct Shared<B: Batch> {
    queue: BatchQueue<B>,
    /// One recycled batch per source, picked up by its worker.
    recycle_slots: Vec<Mutex<Option<B>>>,
    close_errors: Mutex<CloseErrors>,
    sources: InterruptCell,
}

impl<B: Batch> Interrupt for Shared<B> {
    fn interrupt(&self) {
        self.queue.end(Err(Error::Cancelled));
        self.sources.interrupt();
    }
}

pub struct MergeBIt<T: BatchType> {
    ty: T,
    vars: Vars,
    limits: BatchLimits,
    shared: Arc<Shared<T::Batch>>,
    pending: Vec<Source<T::Batch>>,
    processor: Option<Arc<dyn BatchProcessor<T::Batch>>>,
    workers: Vec<JoinHandle<()>>,
    started: bool,
    next_recycle: usize,
    terminal: Terminal,
}

impl<T: BatchType> MergeBIt<T> {
    pub fn new(ty: T, vars: Vars, sources: Vec<Source<T::Batch>>) -> Self {
        Self::with_config(ty, vars, sources, EngineConfig::global())
    }

    /// The queue holds at most `merge_slots_per_source * sources` batches.
    pub fn with_config(ty: T, vars: Vars, sources: Vec<Source<T::Batch>>, cfg: &EngineConfig) -> Self {
        let n = sources.len();
        let max_ready = cfg.merge_slots_per_source.saturating_mul(n).max(1);
        let shared = Arc::new(Shared {
            queue: BatchQueue::new(max_ready, n),
            recycle_slots: (0..n).map(|_| Mutex::new(None)).collect(),
            close_errors: Mutex::new(CloseErrors::new()),
            sources: InterruptCell::new(),
        });
        Self {
            ty,
            vars,
            limits: BatchLimits::from_config(cfg),
            shared,
            pending: sources,
            processor: None,
            workers: Vec::with_capacity(n),
            started: false,
            next_recycle: 0,
            terminal: Terminal::default(),
        }
    }

    /// Run `processor` on every source batch, on the source's worker thread.
    pub fn with_processor(mut self, processor: Arc<dyn BatchProcessor<T::Batch>>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn sources(&self) -> usize {
        self.shared.recycle_slots.len()
    }

    fn start(&mut self) {
        self.started = true;
        for (index, source) in self.pending.drain(..).enumerate() {
            if let Some(h) = source.interrupt_handle() {
                self.shared.sources.register(h);
            }
            let shared = Arc::clone(&self.shared);
            let processor = self.processor.clone();
            let ty = self.ty.clone();
            let spawned = thread::Builder::new()
                .name(format!("fedq-merge-{index}"))
                .spawn(move || run_source(index, source, &shared, processor.as_deref(), &ty));
            match spawned {
                Ok(handle) => self.workers.push(handle),
                Err(e) => self
                    .shared
                    .queue
                    .producer_done(Err(Error::Invariant(format!("spawn merge worker: {e}")))),
            }
        }
    }
}

/// Calls `producer_done` even if the worker unwinds.
struct ProducerGuard<'a, B: Batch> {
    queue: &'a BatchQueue<B>,
    result: Option<Result<()>>,
}

impl<B: Batch> Drop for ProducerGuard<'_, B> {
    fn drop(&mut self) {
        let result = self
            .result
            .take()
            .unwrap_or_else(|| Err(Error::Invariant("merge worker panicked".into())));
        self.queue.producer_done(result);
    }
}

fn run_source<T: BatchType>(
    index: usize,
    mut source: Source<T::Batch>,
    shared: &Shared<T::Batch>,
    processor: Option<&dyn BatchProcessor<T::Batch>>,
    ty: &T,
) {
    let mut guard = ProducerGuard {
        queue: &shared.queue,
        result: None,
    };
    #[cfg(feature = "tracing")]
    tracing::trace!(source = index, "merge worker started");

    let result = loop {
        if shared.queue.is_ended() {
            break Ok(());
        }
        let recycled = shared.recycle_slots[index].lock().take();
        match source.next_batch(recycled) {
            Ok(Some(mut batch)) => {
                if let Some(p) = processor {
                    p.process(&mut batch, index);
                }
                if batch.is_empty() {
                    ty.recycle(batch);
                    continue;
                }
                if shared.queue.offer(batch).is_err() {
                    break Ok(());
                }
            }
            Ok(None) => break Ok(()),
            Err(e) => {
                #[cfg(feature = "tracing")]
                if !e.is_cancelled() {
                    tracing::debug!(source = index, error = %e, "merge source failed");
                }
                break Err(e);
            }
        }
    };

    if let Err(e) = source.close() {
        shared.close_errors.lock().push(e);
    }
    if let Some(b) = shared.recycle_slots[index].lock().take() {
        ty.recycle(b);
    }
    #[cfg(feature = "tracing")]
    tracing::trace!(source = index, ok = result.is_ok(), "merge worker stopped");
    guard.result = Some(result);
}

impl<T: BatchType> BIt<T::Batch> for MergeBIt<T> {
    fn vars(&self) -> &Vars {
        &self.vars
    }

    fn limits(&self) -> BatchLimits {
        self.limits
    }

    fn set_limits(&mut self, limits: BatchLimits) -> Result<()> {
        limits.validate()?;
        self.limits = limits;
        for s in self.pending.iter_mut() {
            s.set_limits(limits)?;
        }
        Ok(())
    }

    fn next_batch(&mut self, recycled: Option<T::Batch>) -> Result<Option<T::Batch>> {
        if let Some(r) = recycled {
            self.recycle(r);
        }
        if let Some(done) = self.terminal.check() {
            return done;
        }
        if !self.started {
            self.start();
        }
        match self.shared.queue.take(&self.limits) {
            Ok(Some(b)) => Ok(Some(b)),
            Ok(None) => {
                self.terminal.exhaust();
                Ok(None)
            }
            Err(e) => Err(self.terminal.fail(e)),
        }
    }

    /// Offer `batch` to the recycle slots of two sources in round-robin
    /// order, then to the batch type's pool.
    fn recycle(&mut self, batch: T::Batch) -> bool {
        let n = self.shared.recycle_slots.len();
        if n > 0 && self.started && !self.shared.queue.is_ended() {
            let first = self.next_recycle % n;
            self.next_recycle = self.next_recycle.wrapping_add(1);
            for k in [first, (first + 1) % n] {
                let mut slot = self.shared.recycle_slots[k].lock();
                if slot.is_none() {
                    *slot = Some(batch);
                    return true;
                }
            }
        }
        self.ty.recycle(batch)
    }

    fn interrupt_handle(&self) -> Option<Arc<dyn Interrupt>> {
        let shared: Arc<dyn Interrupt> = self.shared.clone();
        Some(shared)
    }

    fn close(&mut self) -> Result<()> {
        if !self.terminal.close() {
            return Ok(());
        }
        let mut errors = CloseErrors::new();
        if self.started {
            self.shared.interrupt();
            self.shared.queue.wait_stopped();
            for handle in self.workers.drain(..) {
                if handle.join().is_err() {
                    errors.push(Error::Invariant("merge worker panicked".into()));
                }
            }
        } else {
            self.shared.queue.end(Err(Error::Cancelled));
            for mut s in self.pending.drain(..) {
                errors.record(s.close());
            }
        }
        for b in self.shared.queue.drain_ready() {
            self.ty.recycle(b);
        }
        for slot in &self.shared.recycle_slots {
            if let Some(b) = slot.lock().take() {
                self.ty.recycle(b);
            }
        }
        errors.absorb(std::mem::take(&mut *self.shared.close_errors.lock()));
        errors.finish()
    }
}

impl<T: BatchType> Drop for MergeBIt<T> {
    fn drop(&mut self) {
        if let Err(_e) = self.close() {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %_e, "merge close failed on drop");
        }
    }
}

/// Merge whose rows pass through a shared dedup table on the worker threads.
pub struct DedupMergeBIt<T: BatchType> {
    inner: MergeBIt<T>,
    dedup: Arc<AnyDedup<T>>,
}

impl<T: BatchType> DedupMergeBIt<T> {
    /// `projectors` (none, one for all sources, or one per source) map source
    /// rows to `vars` before dedup.
    pub fn new(
        ty: T,
        vars: Vars,
        sources: Vec<Source<T::Batch>>,
        dedup: Arc<AnyDedup<T>>,
        projectors: Vec<Projector>,
    ) -> Self {
        Self::with_config(ty, vars, sources, dedup, projectors, EngineConfig::global())
    }

    pub fn with_config(
        ty: T,
        vars: Vars,
        sources: Vec<Source<T::Batch>>,
        dedup: Arc<AnyDedup<T>>,
        projectors: Vec<Projector>,
        cfg: &EngineConfig,
    ) -> Self {
        let processor = DedupProcessor::new(Arc::clone(&dedup)).per_source(projectors);
        let inner = MergeBIt::with_config(ty, vars, sources, cfg).with_processor(Arc::new(processor));
        Self { inner, dedup }
    }

    pub fn dedup(&self) -> &Arc<AnyDedup<T>> {
        &self.dedup
    }
}

delegate_bit!(DedupMergeBIt, inner);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{BatchesBIt, FailingBIt};
    use fedq_core::term::int;
    use fedq_core::TermBatch;
    use fedq_mem::TermBatchType;

    fn ty() -> TermBatchType {
        TermBatchType::new(8, usize::MAX)
    }

    fn ints(values: &[i64]) -> TermBatch {
        TermBatch::of_rows(1, values.iter().map(|&i| vec![Some(int(i))]))
    }

    #[test]
    fn zero_sources_are_exhausted() {
        let mut m = MergeBIt::new(ty(), Vars::of(["x"]), Vec::new());
        assert!(m.next_batch(None).unwrap().is_none());
        m.close().unwrap();
    }

    #[test]
    fn error_after_buffered_rows_and_close_returns() {
        let a = BatchesBIt::new(ty(), Vars::of(["x"]), [ints(&[1, 2, 3])]);
        let b = FailingBIt::new(ty(), Vars::of(["x"]), ints(&[1]), Error::upstream("b failed"));
        let mut m = MergeBIt::new(ty(), Vars::of(["x"]), vec![Box::new(a), Box::new(b)]);
        let mut rows = 0;
        let err = loop {
            match m.next_batch(None) {
                Ok(Some(batch)) => rows += batch.rows(),
                Ok(None) => panic!("merge must surface the failure"),
                Err(e) => break e,
            }
        };
        assert!(matches!(err.root(), Error::Source(msg) if msg == "b failed"));
        assert!(rows >= 1 && rows <= 4);
        assert!(matches!(m.next_batch(None), Err(Error::Source(_))));
        m.close().unwrap();
    }

    #[test]
    fn close_before_start_closes_sources() {
        let a = BatchesBIt::new(ty(), Vars::of(["x"]), [ints(&[1])]);
        let mut m = MergeBIt::new(ty(), Vars::of(["x"]), vec![Box::new(a)]);
        m.close().unwrap();
        assert!(matches!(m.next_batch(None), Err(Error::Cancelled)));
    }
}
