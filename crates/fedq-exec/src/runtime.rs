//! Runtime: compile a `Plan` into a BIt tree and meter its execution.
//!
//! Every execution gets a `Metrics` accumulator keyed by the plan id and a
//! stable hash of the plan's rendering. The report reaches the engine's
//! listeners once the root BIt is exhausted, fails, or is closed.

use std::sync::Arc;

use fedq_core::binding::Binding;
use fedq_core::config::EngineConfig;
use fedq_core::hash::hash_str;
use fedq_core::{BatchType, Result};
use fedq_operators::collect_all;

use crate::metrics::{Metrics, MetricsBIt, MetricsListener, Outcome};
use crate::plan::{ExecContext, Plan};

/// Engine owns the batch type, the configuration, and the report listeners.
pub struct Engine<T: BatchType> {
    ty: T,
    cfg: Arc<EngineConfig>,
    listeners: Vec<Arc<dyn MetricsListener>>,
}

impl<T: BatchType> Engine<T> {
    pub fn new(ty: T, cfg: EngineConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            ty,
            cfg: Arc::new(cfg),
            listeners: Vec::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn batch_type(&self) -> &T {
        &self.ty
    }

    pub fn add_listener(&mut self, listener: Arc<dyn MetricsListener>) {
        self.listeners.push(listener);
    }

    pub fn execute(&self, plan: &Plan<T>) -> Result<MetricsBIt<T::Batch>> {
        self.execute_with(plan, None, false)
    }

    /// Execute `plan` under an optional outer `binding`.
    pub fn execute_with(
        &self,
        plan: &Plan<T>,
        binding: Option<&dyn Binding>,
        dedup: bool,
    ) -> Result<MetricsBIt<T::Batch>> {
        let plan_hash = hash_str(&plan.to_string());
        let metrics = Arc::new(Metrics::new(plan.id(), plan_hash, self.listeners.clone()));
        let ctx = ExecContext::new(self.ty.clone(), Arc::clone(&self.cfg)).with_metrics(Arc::clone(&metrics));

        #[cfg(feature = "tracing")]
        tracing::debug!(plan = %plan.id(), hash = %plan_hash, kind = ?plan.kind(), "execute");

        match plan.execute_in(&ctx, binding, dedup) {
            Ok(root) => Ok(MetricsBIt::new(root, metrics)),
            Err(e) => {
                metrics.finish(Outcome::Failed(&e));
                Err(e)
            }
        }
    }

    /// Execute and drain into one batch.
    pub fn collect(&self, plan: &Plan<T>) -> Result<T::Batch> {
        let mut root = self.execute(plan)?;
        collect_all(&self.ty, &mut root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ReportCollector;
    use crate::plan::TriplePattern;
    use crate::source::{MemorySource, Source};
    use fedq_core::term::{iri, var};
    use fedq_core::{Batch, Error};
    use fedq_mem::TermBatchType;
    use fedq_operators::BIt;

    fn engine() -> (Engine<TermBatchType>, Arc<ReportCollector>) {
        let mut engine = Engine::new(TermBatchType::default(), EngineConfig::default()).unwrap();
        let collector = Arc::new(ReportCollector::new());
        engine.add_listener(collector.clone());
        (engine, collector)
    }

    fn source() -> Arc<dyn Source<TermBatchType>> {
        Arc::new(MemorySource::new(
            "s",
            [
                [iri("a"), iri("p"), iri("b")],
                [iri("b"), iri("p"), iri("c")],
            ],
        ))
    }

    #[test]
    fn rejects_invalid_config() {
        let cfg = EngineConfig {
            min_batch: 10,
            max_batch: 5,
            ..EngineConfig::default()
        };
        assert!(matches!(
            Engine::new(TermBatchType::default(), cfg),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn collect_reports_rows_and_joins() {
        let (engine, collector) = engine();
        let plan = Plan::join([
            Plan::query(source(), vec![TriplePattern::new(var("x"), iri("p"), var("y"))]),
            Plan::query(source(), vec![TriplePattern::new(var("y"), iri("p"), var("z"))]),
        ]);
        let rows = engine.collect(&plan).unwrap();
        assert_eq!(rows.rows(), 1);

        let reports = collector.reports();
        assert_eq!(reports.len(), 1);
        let report = &reports[0];
        assert_eq!(report.plan_id, plan.id());
        assert_eq!(report.rows, 1);
        assert!(report.error.is_none());
        assert_eq!(report.joins.len(), 1);
        assert_eq!(report.joins[0].strategy, "client");
        assert_eq!(report.joins[0].left_rows, 2);
        assert_eq!(report.joins[0].emitted_rows, 1);
    }

    #[test]
    fn closing_early_reports_cancellation() {
        let (engine, collector) = engine();
        let plan = Plan::query(source(), vec![TriplePattern::new(var("x"), iri("p"), var("y"))]);
        let mut root = engine.execute(&plan).unwrap();
        root.close().unwrap();
        let reports = collector.reports();
        assert!(reports[0].cancelled);
        assert!(reports[0].error.is_none());
    }
}
