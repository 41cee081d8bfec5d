//! Solution modifiers: projection, DISTINCT, OFFSET and LIMIT.

use std::fmt;

use fedq_core::{Batch, BatchType, CloseErrors, Projector, Result, Vars};
use fedq_operators::{BIt, BatchLimits, Dedup, Interrupt, StrongDedup, Terminal};

use crate::plan::ExecContext;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Modifier {
    pub distinct: bool,
    /// Output vars; `None` keeps the input layout.
    pub projection: Option<Vars>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl Modifier {
    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn project(mut self, vars: Vars) -> Self {
        self.projection = Some(vars);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}

impl fmt::Display for Modifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.distinct {
            parts.push("distinct".to_string());
        }
        if let Some(p) = &self.projection {
            parts.push(format!("project {p}"));
        }
        if self.offset > 0 {
            parts.push(format!("offset {}", self.offset));
        }
        if let Some(l) = self.limit {
            parts.push(format!("limit {l}"));
        }
        f.write_str(&parts.join(" "))
    }
}

pub struct ModifierBIt<T: BatchType> {
    ty: T,
    input: Box<dyn BIt<T::Batch>>,
    vars: Vars,
    /// `None` when the input layout already matches.
    projector: Option<Projector>,
    distinct: Option<StrongDedup<T>>,
    skip: usize,
    remaining: Option<usize>,
    close_errors: CloseErrors,
    terminal: Terminal,
}

impl<T: BatchType> ModifierBIt<T> {
    pub fn new(ctx: &ExecContext<T>, input: Box<dyn BIt<T::Batch>>, modifier: &Modifier) -> Self {
        let vars = modifier
            .projection
            .clone()
            .unwrap_or_else(|| input.vars().clone());
        let projector = Some(ctx.ty.projector(&vars, input.vars())).filter(|p| !p.is_identity());
        let distinct = modifier.distinct.then(|| {
            StrongDedup::new(
                &ctx.ty,
                vars.len(),
                ctx.cfg.strong_dedup_initial_capacity,
                ctx.cfg.strong_dedup_max_entries,
            )
        });
        Self {
            ty: ctx.ty.clone(),
            input,
            vars,
            projector,
            distinct,
            skip: modifier.offset,
            remaining: modifier.limit,
            close_errors: CloseErrors::new(),
            terminal: Terminal::default(),
        }
    }

    /// LIMIT reached: release the input now instead of at `close`.
    fn stop_early(&mut self) {
        self.close_errors.record(self.input.close());
        self.terminal.exhaust();
        #[cfg(feature = "tracing")]
        tracing::trace!("limit reached, input closed");
    }

    fn apply(&mut self, batch: &mut T::Batch) {
        match (&self.distinct, &self.projector) {
            (Some(d), p) => d.filter(batch, 0, p.as_ref()),
            (None, Some(p)) => p.project(batch),
            (None, None) => {}
        }
        if self.skip > 0 {
            let n = self.skip.min(batch.rows());
            let rest = batch.split_off(n);
            self.skip -= n;
            let skipped = std::mem::replace(batch, rest);
            self.input.recycle(skipped);
        }
        if let Some(rem) = self.remaining.as_mut() {
            if batch.rows() >= *rem {
                batch.truncate(*rem);
                *rem = 0;
            } else {
                *rem -= batch.rows();
            }
        }
    }
}

impl<T: BatchType> BIt<T::Batch> for ModifierBIt<T> {
    fn vars(&self) -> &Vars {
        &self.vars
    }

    fn limits(&self) -> BatchLimits {
        self.input.limits()
    }

    fn set_limits(&mut self, limits: BatchLimits) -> Result<()> {
        self.input.set_limits(limits)
    }

    fn next_batch(&mut self, recycled: Option<T::Batch>) -> Result<Option<T::Batch>> {
        let mut recycled = recycled;
        loop {
            if let Some(done) = self.terminal.check() {
                if let Some(r) = recycled {
                    self.ty.recycle(r);
                }
                return done;
            }
            if self.remaining == Some(0) {
                self.stop_early();
                continue;
            }
            let mut batch = match self.input.next_batch(recycled.take()) {
                Ok(Some(b)) => b,
                Ok(None) => {
                    self.terminal.exhaust();
                    return Ok(None);
                }
                Err(e) => return Err(self.terminal.fail(e)),
            };
            self.apply(&mut batch);
            if batch.is_empty() {
                recycled = Some(batch);
                continue;
            }
            return Ok(Some(batch));
        }
    }

    fn recycle(&mut self, batch: T::Batch) -> bool {
        self.input.recycle(batch)
    }

    fn interrupt_handle(&self) -> Option<std::sync::Arc<dyn Interrupt>> {
        self.input.interrupt_handle()
    }

    fn close(&mut self) -> Result<()> {
        if self.terminal.close() {
            self.close_errors.record(self.input.close());
        }
        std::mem::take(&mut self.close_errors).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use fedq_core::config::EngineConfig;
    use fedq_core::term::int;
    use fedq_core::TermBatch;
    use fedq_mem::TermBatchType;
    use fedq_operators::{collect_all, BatchesBIt};

    fn ctx() -> ExecContext<TermBatchType> {
        ExecContext::new(TermBatchType::new(0, 0), Arc::new(EngineConfig::default()))
    }

    fn input(batches: &[&[(i64, i64)]]) -> Box<dyn BIt<TermBatch>> {
        let batches: Vec<TermBatch> = batches
            .iter()
            .map(|rows| TermBatch::of_rows(2, rows.iter().map(|&(a, b)| vec![Some(int(a)), Some(int(b))])))
            .collect();
        Box::new(BatchesBIt::new(TermBatchType::new(0, 0), Vars::of(["x", "y"]), batches))
    }

    fn xs(batch: &TermBatch) -> Vec<i64> {
        batch
            .to_rows()
            .into_iter()
            .map(|r| match &r[0] {
                Some(fedq_core::term::Term::Literal(l)) => l.value().parse().unwrap(),
                other => panic!("unexpected {other:?}"),
            })
            .collect()
    }

    #[test]
    fn projected_distinct_with_offset_and_limit() {
        let ctx = ctx();
        let m = Modifier::default()
            .project(Vars::of(["x"]))
            .distinct()
            .offset(1)
            .limit(2);
        let mut bit = ModifierBIt::new(&ctx, input(&[&[(1, 1), (1, 2), (2, 1)], &[(3, 0), (2, 2), (4, 0)]]), &m);
        assert_eq!(bit.vars(), &Vars::of(["x"]));
        let rows = collect_all(&ctx.ty, &mut bit).unwrap();
        assert_eq!(xs(&rows), vec![2, 3]);
    }

    #[test]
    fn zero_limit_is_exhausted_immediately() {
        let ctx = ctx();
        let mut bit = ModifierBIt::new(&ctx, input(&[&[(1, 1)]]), &Modifier::default().limit(0));
        assert!(bit.next_batch(None).unwrap().is_none());
        assert!(bit.next_batch(None).unwrap().is_none());
        bit.close().unwrap();
    }

    #[test]
    fn display_lists_active_parts() {
        let m = Modifier::default().distinct().limit(3);
        assert_eq!(m.to_string(), "distinct limit 3");
        assert!(Modifier::default().is_noop());
    }
}
