//! Strategy selection for bind joins.
//!
//! A right operand that is a query against a binding-aware source is joined
//! server side: the left rows stream to the source once instead of one
//! query per row. A union of such queries is joined by scattering the left
//! rows to every branch and merging the branch outputs (JOIN only).
//! Everything else falls back to `PlanBindingBIt`.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use fedq_core::binding::Binding;
use fedq_core::{Batch, BatchType, CloseErrors, Error, Projector, Result, Vars};
use fedq_operators::{
    queue_bit, AnyDedup, BIt, BatchLimits, DedupMergeBIt, Interrupt, InterruptCell, MergeBIt,
    ProjectProcessor, QueueSender,
};

use crate::bind::{BindType, PlanBindingBIt};
use crate::metrics::{CountingBIt, JoinCounter, JoinMetrics};
use crate::plan::{ExecContext, Plan, PlanOp, TriplePattern};
use crate::source::Source;

const LEFT_COUNTERS: &[JoinCounter] = &[JoinCounter::LeftRows];
const QUERY_COUNTERS: &[JoinCounter] = &[JoinCounter::BoundQueries];
const RIGHT_COUNTERS: &[JoinCounter] = &[JoinCounter::RightRows, JoinCounter::EmittedRows];

pub struct NativeBind;

impl NativeBind {
    /// Bind `left` with every operand in turn, preferring server-side bind.
    /// Operand `i` of the slice is reported as join operand `i + 1`.
    pub fn prefer_native<T: BatchType>(
        ctx: &ExecContext<T>,
        left: Box<dyn BIt<T::Batch>>,
        operands: &[Arc<Plan<T>>],
        bind_type: BindType,
        binding: Option<&dyn Binding>,
        dedup: bool,
    ) -> Result<Box<dyn BIt<T::Batch>>> {
        let mut left = left;
        for (i, right) in operands.iter().enumerate() {
            let operand = i + 1;
            left = match binding {
                None => match Self::native_leaf(right) {
                    Some((source, triples)) => {
                        Self::single_bind(ctx, left, operand, source, triples, right, bind_type)?
                    }
                    None => match Self::native_union(right, bind_type) {
                        Some(leaves) => {
                            Self::multi_bind(ctx, left, operand, &leaves, right.public_vars(), dedup)?
                        }
                        None => Self::client_bind(ctx, left, operand, right, bind_type, binding),
                    },
                },
                Some(_) => Self::client_bind(ctx, left, operand, right, bind_type, binding),
            };
        }
        Ok(left)
    }

    fn native_leaf<T: BatchType>(plan: &Plan<T>) -> Option<(&Arc<dyn Source<T>>, &[TriplePattern])> {
        match plan.op() {
            PlanOp::Query { source, triples } if source.uses_binding_aware_protocol() => {
                Some((source, triples.as_slice()))
            }
            _ => None,
        }
    }

    /// Leaves of a union whose every operand is a binding-aware query.
    fn native_union<T: BatchType>(plan: &Plan<T>, bind_type: BindType) -> Option<Vec<&Plan<T>>> {
        if bind_type != BindType::Join {
            return None;
        }
        let PlanOp::Union(ops) = plan.op() else {
            return None;
        };
        if ops.is_empty() {
            return None;
        }
        ops.iter()
            .map(|op| Self::native_leaf(op).map(|_| op.as_ref()))
            .collect()
    }

    fn client_bind<T: BatchType>(
        ctx: &ExecContext<T>,
        left: Box<dyn BIt<T::Batch>>,
        operand: usize,
        right: &Arc<Plan<T>>,
        bind_type: BindType,
        binding: Option<&dyn Binding>,
    ) -> Box<dyn BIt<T::Batch>> {
        let stats = ctx.join_metrics(operand, "client");
        Box::new(PlanBindingBIt::new(
            ctx,
            left,
            Arc::clone(right),
            bind_type,
            binding,
            stats,
        ))
    }

    fn single_bind<T: BatchType>(
        ctx: &ExecContext<T>,
        left: Box<dyn BIt<T::Batch>>,
        operand: usize,
        source: &Arc<dyn Source<T>>,
        triples: &[TriplePattern],
        right: &Plan<T>,
        bind_type: BindType,
    ) -> Result<Box<dyn BIt<T::Batch>>> {
        let stats = ctx.join_metrics(operand, "native");
        #[cfg(feature = "tracing")]
        tracing::debug!(source = source.name(), %bind_type, operand, "native bind");
        let left = counted(left, stats.as_ref(), LEFT_COUNTERS, QUERY_COUNTERS);
        let bound = source
            .bind(&ctx.ty, triples, right.public_vars(), left, bind_type)
            .map_err(|e| e.context(format!("bind {}", source.name())))?;
        Ok(counted(bound, stats.as_ref(), RIGHT_COUNTERS, &[]))
    }

    fn multi_bind<T: BatchType>(
        ctx: &ExecContext<T>,
        left: Box<dyn BIt<T::Batch>>,
        operand: usize,
        leaves: &[&Plan<T>],
        union_vars: &Vars,
        dedup: bool,
    ) -> Result<Box<dyn BIt<T::Batch>>> {
        let stats = ctx.join_metrics(operand, "multi-native");
        #[cfg(feature = "tracing")]
        tracing::debug!(branches = leaves.len(), operand, "multi-source native bind");
        let left = counted(left, stats.as_ref(), LEFT_COUNTERS, QUERY_COUNTERS);
        let left_vars = left.vars().clone();
        let out_vars = left_vars.union(union_vars);
        let capacity = ctx.cfg.queue_capacity_batches.max(1);

        let mut senders = Vec::with_capacity(leaves.len());
        let mut branches = Vec::with_capacity(leaves.len());
        for leaf in leaves {
            let Some((source, triples)) = Self::native_leaf(leaf) else {
                return Err(Error::Invariant("multi-bind leaf is not a native query".into()));
            };
            let (tx, rx) = queue_bit(ctx.ty.clone(), left_vars.clone(), capacity);
            let bound = source
                .bind(&ctx.ty, triples, leaf.public_vars(), Box::new(rx), BindType::Join)
                .map_err(|e| e.context(format!("bind {}", source.name())))?;
            senders.push(tx);
            branches.push(bound);
        }

        let projectors: Vec<Projector> = branches
            .iter()
            .map(|b| ctx.ty.projector(&out_vars, b.vars()))
            .collect();
        let cross = ctx.cfg.cross_dedup_capacity;
        let merged: Box<dyn BIt<T::Batch>> = if dedup || cross > 0 {
            let capacity = if cross > 0 {
                cross
            } else {
                ctx.cfg.weak_dedup_capacity
            };
            let table = AnyDedup::cross_source(&ctx.ty, out_vars.len(), capacity);
            Box::new(DedupMergeBIt::with_config(
                ctx.ty.clone(),
                out_vars,
                branches,
                Arc::new(table),
                projectors,
                &ctx.cfg,
            ))
        } else {
            let merge = MergeBIt::with_config(ctx.ty.clone(), out_vars, branches, &ctx.cfg);
            Box::new(merge.with_processor(Arc::new(ProjectProcessor::per_source(projectors))))
        };
        let merged = counted(merged, stats.as_ref(), RIGHT_COUNTERS, &[]);
        Ok(Box::new(MultiBindBIt::new(ctx.ty.clone(), merged, left, senders)))
    }
}

fn counted<B: Batch>(
    bit: Box<dyn BIt<B>>,
    stats: Option<&Arc<JoinMetrics>>,
    rows: &'static [JoinCounter],
    batches: &'static [JoinCounter],
) -> Box<dyn BIt<B>> {
    match stats {
        Some(s) => Box::new(CountingBIt::new(bit, Arc::clone(s), rows, batches)),
        None => bit,
    }
}

struct Scatter<B: Batch> {
    left: Box<dyn BIt<B>>,
    senders: Vec<QueueSender<B>>,
}

/// Feeds every left batch to each branch of a multi-source bind.
///
/// The scatter thread starts with the first `next_batch`. Each branch gets
/// its own copy of a left batch except the last one, which receives the
/// original.
pub struct MultiBindBIt<T: BatchType> {
    ty: T,
    inner: Box<dyn BIt<T::Batch>>,
    pending: Option<Scatter<T::Batch>>,
    left_interrupt: Option<Arc<dyn Interrupt>>,
    scatter: Option<JoinHandle<()>>,
    close_errors: Arc<Mutex<CloseErrors>>,
    interrupts: Arc<InterruptCell>,
    closed: bool,
}

impl<T: BatchType> MultiBindBIt<T> {
    fn new(
        ty: T,
        inner: Box<dyn BIt<T::Batch>>,
        left: Box<dyn BIt<T::Batch>>,
        senders: Vec<QueueSender<T::Batch>>,
    ) -> Self {
        let interrupts = Arc::new(InterruptCell::new());
        let left_interrupt = left.interrupt_handle();
        if let Some(h) = inner.interrupt_handle() {
            interrupts.register(h);
        }
        if let Some(h) = &left_interrupt {
            interrupts.register(Arc::clone(h));
        }
        Self {
            ty,
            inner,
            pending: Some(Scatter { left, senders }),
            left_interrupt,
            scatter: None,
            close_errors: Arc::new(Mutex::new(CloseErrors::new())),
            interrupts,
            closed: false,
        }
    }

    fn start(&mut self, job: Scatter<T::Batch>) {
        let ty = self.ty.clone();
        let errors = Arc::clone(&self.close_errors);
        let spawned = thread::Builder::new()
            .name("fedq-scatter".into())
            .spawn(move || scatter(&ty, job, &errors));
        match spawned {
            Ok(handle) => self.scatter = Some(handle),
            // the dropped senders fail their branches
            Err(e) => self
                .close_errors
                .lock()
                .push(Error::Invariant(format!("spawn scatter thread: {e}"))),
        }
    }
}

fn scatter<T: BatchType>(ty: &T, mut job: Scatter<T::Batch>, errors: &Mutex<CloseErrors>) {
    let failure = loop {
        let batch = match job.left.next_batch(None) {
            Ok(Some(b)) => b,
            Ok(None) => break None,
            Err(e) => break Some(e),
        };
        let Some((last, rest)) = job.senders.split_last() else {
            break None;
        };
        let copied = rest.iter().all(|tx| {
            let mut copy = ty.create(batch.rows(), batch.cols());
            copy.put(&batch);
            tx.offer(copy).is_ok()
        });
        if !copied || last.offer(batch).is_err() {
            // consumer side closed
            break None;
        }
    };
    errors.lock().record(job.left.close());
    #[cfg(feature = "tracing")]
    tracing::debug!(failed = failure.is_some(), "scatter stopped");
    for tx in job.senders.iter_mut() {
        tx.complete(failure.clone());
    }
}

impl<T: BatchType> BIt<T::Batch> for MultiBindBIt<T> {
    fn vars(&self) -> &Vars {
        self.inner.vars()
    }

    fn limits(&self) -> BatchLimits {
        self.inner.limits()
    }

    fn set_limits(&mut self, limits: BatchLimits) -> Result<()> {
        self.inner.set_limits(limits)
    }

    fn next_batch(&mut self, recycled: Option<T::Batch>) -> Result<Option<T::Batch>> {
        if let Some(job) = self.pending.take() {
            self.start(job);
        }
        self.inner.next_batch(recycled)
    }

    fn recycle(&mut self, batch: T::Batch) -> bool {
        self.inner.recycle(batch)
    }

    fn interrupt_handle(&self) -> Option<Arc<dyn Interrupt>> {
        let cell: Arc<dyn Interrupt> = self.interrupts.clone();
        Some(cell)
    }

    fn close(&mut self) -> Result<()> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        let mut errors = CloseErrors::new();
        errors.record(self.inner.close());
        if let Some(h) = &self.left_interrupt {
            h.interrupt();
        }
        if let Some(mut job) = self.pending.take() {
            errors.record(job.left.close());
            for tx in job.senders.iter_mut() {
                tx.complete(Some(Error::Cancelled));
            }
        }
        if let Some(handle) = self.scatter.take() {
            if handle.join().is_err() {
                errors.push(Error::Invariant("scatter thread panicked".into()));
            }
        }
        errors.absorb(std::mem::take(&mut *self.close_errors.lock()));
        errors.finish()
    }
}

impl<T: BatchType> Drop for MultiBindBIt<T> {
    fn drop(&mut self) {
        if let Err(_e) = self.close() {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %_e, "multi-bind close failed on drop");
        }
    }
}
