//! Client-side bind joins.
//!
//! `PlanBindingBIt` pulls one left batch at a time. Every row of it becomes a
//! `BoundRowBIt`, which executes the right operand with the row as binding
//! and combines the two according to the `BindType`. The bound rows of one
//! left batch are drained through a Concat, or through a Merge of
//! `bind_concurrency` Concat stripes.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use fedq_core::binding::{ArrayBinding, BatchBinding, Binding};
use fedq_core::{Batch, BatchType, CloseErrors, Merger, Result, Vars};
use fedq_operators::{BIt, BatchLimits, ConcatBIt, Interrupt, InterruptCell, MergeBIt, Terminal};

use crate::metrics::{JoinCounter, JoinMetrics};
use crate::plan::{ExecContext, Plan};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindType {
    Join,
    LeftJoin,
    Exists,
    NotExists,
    Minus,
}

impl BindType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BindType::Join => "Join",
            BindType::LeftJoin => "LeftJoin",
            BindType::Exists => "Exists",
            BindType::NotExists => "NotExists",
            BindType::Minus => "Minus",
        }
    }

    /// Output vars of binding rows over `left` into an operand over `right`.
    pub fn out_vars(&self, left: &Vars, right: &Vars) -> Vars {
        match self {
            BindType::Join | BindType::LeftJoin => left.union(right),
            BindType::Exists | BindType::NotExists | BindType::Minus => left.clone(),
        }
    }

    /// Filters keep or drop left rows; the first right row decides.
    pub fn is_filter(&self) -> bool {
        matches!(self, BindType::Exists | BindType::NotExists | BindType::Minus)
    }
}

impl fmt::Display for BindType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Combines one left row with the right rows it matched.
///
/// `layout` is the column layout of the left batches handed in; it may carry
/// more vars than the left operand publishes (outer bindings).
pub(crate) struct RowJoiner {
    bind_type: BindType,
    merger: Merger,
    out_vars: Vars,
    /// Layout columns of vars the left operand shares with the right one.
    shared: Vec<usize>,
}

impl RowJoiner {
    pub(crate) fn new<T: BatchType>(
        ty: &T,
        bind_type: BindType,
        left: &Vars,
        layout: &Vars,
        right: &Vars,
    ) -> Self {
        let out_vars = bind_type.out_vars(left, right);
        let merger = ty.merger(&out_vars, layout, right);
        let shared = left
            .intersection(right)
            .iter()
            .filter_map(|v| layout.index_of(v))
            .collect();
        Self {
            bind_type,
            merger,
            out_vars,
            shared,
        }
    }

    pub(crate) fn out_vars(&self) -> &Vars {
        &self.out_vars
    }

    pub(crate) fn bind_type(&self) -> BindType {
        self.bind_type
    }

    /// False for a MINUS row that binds none of the shared vars: no right
    /// row can share a bound var with it, so it is kept without a query.
    pub(crate) fn needs_query<B: Batch>(&self, left: &B, row: usize) -> bool {
        self.bind_type != BindType::Minus || self.shared.iter().any(|&c| left.get(row, c).is_some())
    }

    /// Output rows for right rows matched by `left[row]`.
    pub(crate) fn matched<B: Batch>(&self, out: &mut B, left: &B, row: usize, right: &B) {
        if matches!(self.bind_type, BindType::Join | BindType::LeftJoin) {
            self.merger.merge(out, left, row, right);
        }
    }

    /// Output for `left[row]` once its right side ended after `matches` rows.
    pub(crate) fn finish<B: Batch>(&self, out: &mut B, left: &B, row: usize, matches: usize) {
        let emit = match self.bind_type {
            BindType::Join => false,
            BindType::LeftJoin | BindType::NotExists | BindType::Minus => matches == 0,
            BindType::Exists => matches > 0,
        };
        if emit {
            self.merger.merge_unmatched(out, left, row);
        }
    }
}

/// Right operand executed for one left row.
struct BoundRowBIt<T: BatchType> {
    ctx: ExecContext<T>,
    right: Arc<Plan<T>>,
    binding: Option<BatchBinding<T::Batch>>,
    joiner: Arc<RowJoiner>,
    stats: Option<Arc<JoinMetrics>>,
    inner: Option<Box<dyn BIt<T::Batch>>>,
    matches: usize,
    interrupts: Arc<InterruptCell>,
    limits: BatchLimits,
    close_errors: CloseErrors,
    terminal: Terminal,
}

impl<T: BatchType> BoundRowBIt<T> {
    fn count(&self, counter: JoinCounter, n: usize) {
        if let Some(s) = &self.stats {
            s.add(counter, n as u64);
        }
    }

    /// Close the right side and emit what the row yields after `matches`
    /// right rows. The BIt is exhausted afterwards.
    fn finish_row(&mut self, recycled: Option<T::Batch>) -> Result<Option<T::Batch>> {
        if let Some(mut inner) = self.inner.take() {
            self.close_errors.record(inner.close());
        }
        self.terminal.exhaust();
        let Some(binding) = self.binding.as_ref() else {
            return Ok(None);
        };
        let mut out = self
            .ctx
            .ty
            .reuse(recycled, 1, self.joiner.out_vars().len());
        self.joiner.finish(&mut out, binding.batch(), 0, self.matches);
        if out.is_empty() {
            self.ctx.ty.recycle(out);
            return Ok(None);
        }
        Ok(Some(out))
    }

    fn start(&mut self) -> Result<()> {
        let Some(binding) = self.binding.as_ref() else {
            return Ok(());
        };
        self.count(JoinCounter::BoundQueries, 1);
        let mut bit = self.right.execute_in(&self.ctx, Some(binding), false)?;
        bit.set_limits(self.limits)?;
        if let Some(h) = bit.interrupt_handle() {
            self.interrupts.register(h);
        }
        self.inner = Some(bit);
        Ok(())
    }
}

impl<T: BatchType> BIt<T::Batch> for BoundRowBIt<T> {
    fn vars(&self) -> &Vars {
        self.joiner.out_vars()
    }

    fn limits(&self) -> BatchLimits {
        self.limits
    }

    fn set_limits(&mut self, limits: BatchLimits) -> Result<()> {
        limits.validate()?;
        self.limits = limits;
        if let Some(inner) = self.inner.as_mut() {
            inner.set_limits(limits)?;
        }
        Ok(())
    }

    fn next_batch(&mut self, recycled: Option<T::Batch>) -> Result<Option<T::Batch>> {
        if let Some(done) = self.terminal.check() {
            if let Some(r) = recycled {
                self.ctx.ty.recycle(r);
            }
            return done;
        }
        if self.inner.is_none() {
            let needs_query = match self.binding.as_ref() {
                Some(b) => self.joiner.needs_query(b.batch(), 0),
                None => false,
            };
            if !needs_query {
                return self.finish_row(recycled);
            }
            if let Err(e) = self.start() {
                return Err(self.terminal.fail(e));
            }
        }
        let mut recycled = recycled;
        loop {
            let Some(inner) = self.inner.as_mut() else {
                return self.finish_row(recycled);
            };
            match inner.next_batch(None) {
                Ok(Some(right)) => {
                    self.matches += right.rows();
                    if let Some(s) = &self.stats {
                        s.add(JoinCounter::RightRows, right.rows() as u64);
                    }
                    if self.joiner.bind_type().is_filter() {
                        inner.recycle(right);
                        return self.finish_row(recycled);
                    }
                    let Some(binding) = self.binding.as_ref() else {
                        inner.recycle(right);
                        return self.finish_row(recycled);
                    };
                    let mut out =
                        self.ctx
                            .ty
                            .reuse(recycled.take(), right.rows(), self.joiner.out_vars().len());
                    self.joiner.matched(&mut out, binding.batch(), 0, &right);
                    inner.recycle(right);
                    if !out.is_empty() {
                        return Ok(Some(out));
                    }
                    recycled = Some(out);
                }
                Ok(None) => return self.finish_row(recycled),
                Err(e) => return Err(self.terminal.fail(e)),
            }
        }
    }

    fn recycle(&mut self, batch: T::Batch) -> bool {
        self.ctx.ty.recycle(batch)
    }

    fn interrupt_handle(&self) -> Option<Arc<dyn Interrupt>> {
        let cell: Arc<dyn Interrupt> = self.interrupts.clone();
        Some(cell)
    }

    fn close(&mut self) -> Result<()> {
        if self.terminal.close() {
            if let Some(mut inner) = self.inner.take() {
                self.close_errors.record(inner.close());
            }
            if let Some(b) = self.binding.take() {
                self.ctx.ty.recycle(b.into_batch());
            }
        }
        std::mem::take(&mut self.close_errors).finish()
    }
}

impl<T: BatchType> Drop for BoundRowBIt<T> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Interrupts the left input and whichever bound composite is running.
struct BindInterrupt {
    fired: AtomicBool,
    left: Option<Arc<dyn Interrupt>>,
    current: Mutex<Option<Arc<dyn Interrupt>>>,
}

impl BindInterrupt {
    fn set_current(&self, handle: Option<Arc<dyn Interrupt>>) {
        let mut current = self.current.lock();
        *current = handle;
        if self.fired.load(Ordering::SeqCst) {
            if let Some(h) = current.as_ref() {
                h.interrupt();
            }
        }
    }
}

impl Interrupt for BindInterrupt {
    fn interrupt(&self) {
        self.fired.store(true, Ordering::SeqCst);
        if let Some(l) = &self.left {
            l.interrupt();
        }
        let current = self.current.lock().clone();
        if let Some(c) = current {
            c.interrupt();
        }
    }
}

/// Generic bind join: re-executes the right operand for every left row.
pub struct PlanBindingBIt<T: BatchType> {
    ctx: ExecContext<T>,
    left: Box<dyn BIt<T::Batch>>,
    right: Arc<Plan<T>>,
    joiner: Arc<RowJoiner>,
    /// Layout of the per-row bindings: left vars, then outer-only vars.
    bind_vars: Vars,
    outer: Option<ArrayBinding>,
    stats: Option<Arc<JoinMetrics>>,
    current: Option<Box<dyn BIt<T::Batch>>>,
    interrupt: Arc<BindInterrupt>,
    limits: BatchLimits,
    close_errors: CloseErrors,
    terminal: Terminal,
}

impl<T: BatchType> PlanBindingBIt<T> {
    /// `outer` is the binding the whole join runs under; its values reach
    /// the right operand along with each left row.
    pub fn new(
        ctx: &ExecContext<T>,
        left: Box<dyn BIt<T::Batch>>,
        right: Arc<Plan<T>>,
        bind_type: BindType,
        outer: Option<&dyn Binding>,
        stats: Option<Arc<JoinMetrics>>,
    ) -> Self {
        let bind_vars = match outer {
            Some(b) => left.vars().union(b.vars()),
            None => left.vars().clone(),
        };
        let joiner = RowJoiner::new(
            &ctx.ty,
            bind_type,
            left.vars(),
            &bind_vars,
            right.public_vars(),
        );
        let interrupt = Arc::new(BindInterrupt {
            fired: AtomicBool::new(false),
            left: left.interrupt_handle(),
            current: Mutex::new(None),
        });
        Self {
            ctx: ctx.clone(),
            limits: left.limits(),
            left,
            right,
            joiner: Arc::new(joiner),
            bind_vars,
            outer: outer.map(ArrayBinding::copy_of),
            stats,
            current: None,
            interrupt,
            close_errors: CloseErrors::new(),
            terminal: Terminal::default(),
        }
    }

    fn bound_row(&self, batch: &T::Batch, row: usize) -> BoundRowBIt<T> {
        let mut single = self.ctx.ty.create_singleton(self.bind_vars.len());
        match &self.outer {
            None => single.put_row(batch, row),
            Some(outer) => {
                let left_vars = self.left.vars();
                single.begin_put();
                for (c, v) in self.bind_vars.iter().enumerate() {
                    let t = left_vars
                        .index_of(v)
                        .and_then(|lc| batch.get(row, lc))
                        .or_else(|| outer.get(v));
                    single.put_term(c, t.as_ref());
                }
                single.commit_put();
            }
        }
        BoundRowBIt {
            ctx: self.ctx.clone(),
            right: Arc::clone(&self.right),
            binding: Some(BatchBinding::new(self.bind_vars.clone(), single)),
            joiner: Arc::clone(&self.joiner),
            stats: self.stats.clone(),
            inner: None,
            matches: 0,
            interrupts: Arc::new(InterruptCell::new()),
            limits: self.limits,
            close_errors: CloseErrors::new(),
            terminal: Terminal::default(),
        }
    }

    /// One composite BIt draining the bound rows of `batch`.
    fn bind_rows(&self, batch: &T::Batch) -> Result<Box<dyn BIt<T::Batch>>> {
        let rows = batch.rows();
        let out = self.joiner.out_vars().clone();
        let bound: Vec<Box<dyn BIt<T::Batch>>> = (0..rows)
            .map(|r| Box::new(self.bound_row(batch, r)) as Box<dyn BIt<T::Batch>>)
            .collect();
        let stripes = self.ctx.cfg.bind_concurrency.min(rows).max(1);
        let mut bit: Box<dyn BIt<T::Batch>> = if stripes == 1 {
            Box::new(ConcatBIt::new(self.ctx.ty.clone(), out, bound))
        } else {
            let mut groups: Vec<Vec<Box<dyn BIt<T::Batch>>>> =
                (0..stripes).map(|_| Vec::new()).collect();
            for (i, b) in bound.into_iter().enumerate() {
                groups[i % stripes].push(b);
            }
            let concats = groups
                .into_iter()
                .map(|g| {
                    Box::new(ConcatBIt::new(self.ctx.ty.clone(), out.clone(), g))
                        as Box<dyn BIt<T::Batch>>
                })
                .collect();
            Box::new(MergeBIt::with_config(
                self.ctx.ty.clone(),
                out,
                concats,
                &self.ctx.cfg,
            ))
        };
        bit.set_limits(self.limits)?;
        Ok(bit)
    }
}

impl<T: BatchType> BIt<T::Batch> for PlanBindingBIt<T> {
    fn vars(&self) -> &Vars {
        self.joiner.out_vars()
    }

    fn limits(&self) -> BatchLimits {
        self.limits
    }

    fn set_limits(&mut self, limits: BatchLimits) -> Result<()> {
        limits.validate()?;
        self.limits = limits;
        if let Some(cur) = self.current.as_mut() {
            cur.set_limits(limits)?;
        }
        Ok(())
    }

    fn next_batch(&mut self, recycled: Option<T::Batch>) -> Result<Option<T::Batch>> {
        if let Some(done) = self.terminal.check() {
            if let Some(r) = recycled {
                self.ctx.ty.recycle(r);
            }
            return done;
        }
        let mut recycled = recycled;
        loop {
            if let Some(cur) = self.current.as_mut() {
                match cur.next_batch(recycled.take()) {
                    Ok(Some(b)) => {
                        if let Some(s) = &self.stats {
                            s.add(JoinCounter::EmittedRows, b.rows() as u64);
                        }
                        return Ok(Some(b));
                    }
                    Ok(None) => {
                        if let Some(mut done) = self.current.take() {
                            self.close_errors.record(done.close());
                        }
                        self.interrupt.set_current(None);
                    }
                    Err(e) => return Err(self.terminal.fail(e)),
                }
                continue;
            }
            match self.left.next_batch(None) {
                Ok(Some(batch)) => {
                    if let Some(s) = &self.stats {
                        s.add(JoinCounter::LeftRows, batch.rows() as u64);
                    }
                    let bound = self.bind_rows(&batch);
                    self.left.recycle(batch);
                    match bound {
                        Ok(bit) => {
                            self.interrupt.set_current(bit.interrupt_handle());
                            self.current = Some(bit);
                        }
                        Err(e) => return Err(self.terminal.fail(e)),
                    }
                }
                Ok(None) => {
                    self.terminal.exhaust();
                    if let Some(r) = recycled {
                        self.ctx.ty.recycle(r);
                    }
                    return Ok(None);
                }
                Err(e) => return Err(self.terminal.fail(e)),
            }
        }
    }

    fn recycle(&mut self, batch: T::Batch) -> bool {
        match self.current.as_mut() {
            Some(cur) => cur.recycle(batch),
            None => self.ctx.ty.recycle(batch),
        }
    }

    fn interrupt_handle(&self) -> Option<Arc<dyn Interrupt>> {
        let handle: Arc<dyn Interrupt> = self.interrupt.clone();
        Some(handle)
    }

    fn close(&mut self) -> Result<()> {
        if self.terminal.close() {
            if let Some(mut cur) = self.current.take() {
                self.close_errors.record(cur.close());
            }
            self.close_errors.record(self.left.close());
        }
        std::mem::take(&mut self.close_errors).finish()
    }
}

impl<T: BatchType> Drop for PlanBindingBIt<T> {
    fn drop(&mut self) {
        if let Err(_e) = self.close() {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %_e, "bind close failed on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedq_core::term::int;
    use fedq_core::TermBatch;
    use fedq_mem::TermBatchType;

    fn row(values: &[Option<i64>]) -> TermBatch {
        TermBatch::of_rows(values.len(), [values.iter().map(|v| v.map(int)).collect::<Vec<_>>()])
    }

    fn joiner(bind_type: BindType) -> RowJoiner {
        let left = Vars::of(["x", "y"]);
        RowJoiner::new(&TermBatchType::new(0, 0), bind_type, &left, &left, &Vars::of(["y", "z"]))
    }

    #[test]
    fn left_join_pads_unmatched_rows() {
        let j = joiner(BindType::LeftJoin);
        assert_eq!(j.out_vars(), &Vars::of(["x", "y", "z"]));
        let left = row(&[Some(1), Some(2)]);
        let mut out = TermBatch::new(1, 3);
        j.finish(&mut out, &left, 0, 0);
        assert_eq!(out.to_rows(), vec![vec![Some(int(1)), Some(int(2)), None]]);
    }

    #[test]
    fn join_merges_shared_vars() {
        let j = joiner(BindType::Join);
        let left = row(&[Some(1), None]);
        let right = TermBatch::of_rows(2, [vec![Some(int(7)), Some(int(8))]]);
        let mut out = TermBatch::new(1, 3);
        j.matched(&mut out, &left, 0, &right);
        j.finish(&mut out, &left, 0, 1);
        assert_eq!(out.to_rows(), vec![vec![Some(int(1)), Some(int(7)), Some(int(8))]]);
    }

    #[test]
    fn filters_decide_on_match_count() {
        let left = row(&[Some(1), Some(2)]);
        for (bt, matches, kept) in [
            (BindType::Exists, 1, true),
            (BindType::Exists, 0, false),
            (BindType::NotExists, 0, true),
            (BindType::NotExists, 3, false),
            (BindType::Minus, 2, false),
        ] {
            let j = joiner(bt);
            let mut out = TermBatch::new(1, 2);
            j.finish(&mut out, &left, 0, matches);
            assert_eq!(out.rows() == 1, kept, "{bt} with {matches} matches");
        }
    }

    #[test]
    fn minus_without_shared_bound_var_skips_the_query() {
        let j = joiner(BindType::Minus);
        assert!(!j.needs_query(&row(&[Some(1), None]), 0));
        assert!(j.needs_query(&row(&[None, Some(2)]), 0));
        assert!(joiner(BindType::Exists).needs_query(&row(&[Some(1), None]), 0));
    }
}
