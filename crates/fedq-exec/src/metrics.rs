//! Execution metrics.
//!
//! Purely observational: a `Metrics` accumulator is attached to one plan
//! execution, updated for every batch the root delivers, and finalized once
//! into an `ExecutionReport` handed to every registered listener. Nothing
//! here feeds back into execution.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use fedq_core::hash::Hash256;
use fedq_core::id::PlanId;
use fedq_core::report::{ExecutionReport, JoinReport};
use fedq_core::{Batch, Error, Result, Vars};
use fedq_operators::{BIt, BatchLimits, Interrupt};

#[cfg(feature = "tracing")]
pub fn emit_span(event: &str, key_values: &[(&str, String)]) {
    let span = tracing::span!(tracing::Level::TRACE, "fedq", event);
    let _entered = span.enter();
    for (k, v) in key_values {
        tracing::trace!(%event, %k, %v, "metric");
    }
}

#[cfg(not(feature = "tracing"))]
pub fn emit_span(_event: &str, _key_values: &[(&str, String)]) {}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinCounter {
    LeftRows,
    BoundQueries,
    RightRows,
    EmittedRows,
}

/// Counters of one join operand, updated from whichever thread runs it.
#[derive(Debug)]
pub struct JoinMetrics {
    operand: usize,
    strategy: &'static str,
    left_rows: AtomicU64,
    bound_queries: AtomicU64,
    right_rows: AtomicU64,
    emitted_rows: AtomicU64,
}

impl JoinMetrics {
    pub fn new(operand: usize, strategy: &'static str) -> Self {
        Self {
            operand,
            strategy,
            left_rows: AtomicU64::new(0),
            bound_queries: AtomicU64::new(0),
            right_rows: AtomicU64::new(0),
            emitted_rows: AtomicU64::new(0),
        }
    }

    fn cell(&self, counter: JoinCounter) -> &AtomicU64 {
        match counter {
            JoinCounter::LeftRows => &self.left_rows,
            JoinCounter::BoundQueries => &self.bound_queries,
            JoinCounter::RightRows => &self.right_rows,
            JoinCounter::EmittedRows => &self.emitted_rows,
        }
    }

    pub fn add(&self, counter: JoinCounter, n: u64) {
        self.cell(counter).fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, counter: JoinCounter) -> u64 {
        self.cell(counter).load(Ordering::Relaxed)
    }

    pub fn strategy(&self) -> &'static str {
        self.strategy
    }

    pub fn report(&self) -> JoinReport {
        JoinReport {
            operand: self.operand,
            strategy: self.strategy.to_string(),
            left_rows: self.get(JoinCounter::LeftRows),
            bound_queries: self.get(JoinCounter::BoundQueries),
            right_rows: self.get(JoinCounter::RightRows),
            emitted_rows: self.get(JoinCounter::EmittedRows),
        }
    }
}

/// Receives the report of every completed execution.
pub trait MetricsListener: Send + Sync {
    fn on_complete(&self, report: &ExecutionReport);
}

/// How an execution ended.
#[derive(Debug, Clone, Copy)]
pub enum Outcome<'a> {
    Exhausted,
    Failed(&'a Error),
    Cancelled,
}

struct MetricsState {
    /// `None` once finalized.
    report: Option<ExecutionReport>,
    started: Instant,
    last: Option<Instant>,
}

pub struct Metrics {
    state: Mutex<MetricsState>,
    joins: Mutex<Vec<Arc<JoinMetrics>>>,
    listeners: Vec<Arc<dyn MetricsListener>>,
}

impl Metrics {
    pub fn new(plan_id: PlanId, plan_hash: Hash256, listeners: Vec<Arc<dyn MetricsListener>>) -> Self {
        Self {
            state: Mutex::new(MetricsState {
                report: Some(ExecutionReport::new(plan_id, plan_hash, now_millis())),
                started: Instant::now(),
                last: None,
            }),
            joins: Mutex::new(Vec::new()),
            listeners,
        }
    }

    /// Register statistics for a join operand.
    pub fn join(&self, operand: usize, strategy: &'static str) -> Arc<JoinMetrics> {
        let stats = Arc::new(JoinMetrics::new(operand, strategy));
        self.joins.lock().push(Arc::clone(&stats));
        stats
    }

    pub fn record_batch(&self, rows: usize) {
        let now = Instant::now();
        let mut st = self.state.lock();
        let started = st.started;
        let since_last = now.duration_since(st.last.unwrap_or(started));
        st.last = Some(now);
        let Some(report) = st.report.as_mut() else {
            return;
        };
        if report.first_row_us.is_none() && rows > 0 {
            report.first_row_us = Some(now.duration_since(started).as_micros() as u64);
        }
        report.rows += rows as u64;
        report.batches += 1;
        report.batch_rows.record(rows as u64);
        report.batch_latency_us.record(since_last.as_micros() as u64);
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().report.is_none()
    }

    /// Finalize and notify listeners. Only the first call has an effect.
    pub fn finish(&self, outcome: Outcome<'_>) -> Option<ExecutionReport> {
        let mut report = self.state.lock().report.take()?;
        report.joins = self.joins.lock().iter().map(|j| j.report()).collect();
        match outcome {
            Outcome::Exhausted => {}
            Outcome::Cancelled => report.cancelled = true,
            Outcome::Failed(e) if e.is_cancelled() => report.cancelled = true,
            Outcome::Failed(e) => report.error = Some(e.to_string()),
        }
        let report = report.finish(now_millis());
        emit_span(
            "execution_complete",
            &[
                ("plan", report.plan_id.to_string()),
                ("rows", report.rows.to_string()),
                ("batches", report.batches.to_string()),
                ("cancelled", report.cancelled.to_string()),
            ],
        );
        for l in &self.listeners {
            l.on_complete(&report);
        }
        Some(report)
    }
}

/// Root wrapper feeding a `Metrics` accumulator.
pub struct MetricsBIt<B: Batch> {
    inner: Box<dyn BIt<B>>,
    metrics: Arc<Metrics>,
}

impl<B: Batch> MetricsBIt<B> {
    pub fn new(inner: Box<dyn BIt<B>>, metrics: Arc<Metrics>) -> Self {
        Self { inner, metrics }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }
}

impl<B: Batch> BIt<B> for MetricsBIt<B> {
    fn vars(&self) -> &Vars {
        self.inner.vars()
    }

    fn limits(&self) -> BatchLimits {
        self.inner.limits()
    }

    fn set_limits(&mut self, limits: BatchLimits) -> Result<()> {
        self.inner.set_limits(limits)
    }

    fn next_batch(&mut self, recycled: Option<B>) -> Result<Option<B>> {
        match self.inner.next_batch(recycled) {
            Ok(Some(b)) => {
                self.metrics.record_batch(b.rows());
                Ok(Some(b))
            }
            Ok(None) => {
                self.metrics.finish(Outcome::Exhausted);
                Ok(None)
            }
            Err(e) => {
                self.metrics.finish(Outcome::Failed(&e));
                Err(e)
            }
        }
    }

    fn recycle(&mut self, batch: B) -> bool {
        self.inner.recycle(batch)
    }

    fn interrupt_handle(&self) -> Option<Arc<dyn Interrupt>> {
        self.inner.interrupt_handle()
    }

    fn close(&mut self) -> Result<()> {
        let closed = self.inner.close();
        self.metrics.finish(Outcome::Cancelled);
        closed
    }
}

impl<B: Batch> Drop for MetricsBIt<B> {
    fn drop(&mut self) {
        if let Err(_e) = self.close() {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %_e, "execution close failed on drop");
        }
    }
}

/// Counts rows (and optionally batches) flowing through a join edge.
pub struct CountingBIt<B: Batch> {
    inner: Box<dyn BIt<B>>,
    stats: Arc<JoinMetrics>,
    rows: &'static [JoinCounter],
    batches: &'static [JoinCounter],
}

impl<B: Batch> CountingBIt<B> {
    pub fn new(
        inner: Box<dyn BIt<B>>,
        stats: Arc<JoinMetrics>,
        rows: &'static [JoinCounter],
        batches: &'static [JoinCounter],
    ) -> Self {
        Self {
            inner,
            stats,
            rows,
            batches,
        }
    }
}

impl<B: Batch> BIt<B> for CountingBIt<B> {
    fn vars(&self) -> &Vars {
        self.inner.vars()
    }

    fn limits(&self) -> BatchLimits {
        self.inner.limits()
    }

    fn set_limits(&mut self, limits: BatchLimits) -> Result<()> {
        self.inner.set_limits(limits)
    }

    fn next_batch(&mut self, recycled: Option<B>) -> Result<Option<B>> {
        let out = self.inner.next_batch(recycled)?;
        if let Some(b) = &out {
            for c in self.rows {
                self.stats.add(*c, b.rows() as u64);
            }
            for c in self.batches {
                self.stats.add(*c, 1);
            }
        }
        Ok(out)
    }

    fn recycle(&mut self, batch: B) -> bool {
        self.inner.recycle(batch)
    }

    fn interrupt_handle(&self) -> Option<Arc<dyn Interrupt>> {
        self.inner.interrupt_handle()
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}

/// Keeps every report; handy for tests and embedding applications.
#[derive(Default)]
pub struct ReportCollector {
    reports: Mutex<Vec<ExecutionReport>>,
}

impl ReportCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<ExecutionReport> {
        self.reports.lock().clone()
    }
}

impl MetricsListener for ReportCollector {
    fn on_complete(&self, report: &ExecutionReport) {
        self.reports.lock().push(report.clone());
    }
}

/// Emits each report as JSON through `emit_span`.
pub struct LogListener;

impl MetricsListener for LogListener {
    fn on_complete(&self, report: &ExecutionReport) {
        match serde_json::to_string(report) {
            Ok(json) => emit_span("execution_report", &[("report", json)]),
            Err(e) => emit_span("execution_report", &[("error", e.to_string())]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedq_core::hash::hash_str;

    #[test]
    fn finish_runs_once_and_notifies() {
        let collector = Arc::new(ReportCollector::new());
        let m = Metrics::new(PlanId::new(7), hash_str("p"), vec![collector.clone() as Arc<dyn MetricsListener>]);
        let j = m.join(1, "client");
        j.add(JoinCounter::LeftRows, 3);
        m.record_batch(2);
        m.record_batch(5);
        let report = m.finish(Outcome::Exhausted).unwrap();
        assert!(m.finish(Outcome::Cancelled).is_none());
        assert!(m.is_finished());
        assert_eq!(report.rows, 7);
        assert_eq!(report.batches, 2);
        assert_eq!(report.batch_rows.max, 5);
        assert!(report.first_row_us.is_some());
        assert_eq!(report.joins[0].left_rows, 3);
        assert!(!report.cancelled);
        assert_eq!(collector.reports().len(), 1);
    }

    #[test]
    fn cancellation_is_not_reported_as_failure() {
        let m = Metrics::new(PlanId::new(1), hash_str("p"), Vec::new());
        let e = Error::Cancelled.context("merge");
        let report = m.finish(Outcome::Failed(&e)).unwrap();
        assert!(report.cancelled);
        assert!(report.error.is_none());
    }

    #[test]
    fn log_listener_sits_beside_other_listeners() {
        let collector = Arc::new(ReportCollector::new());
        let listeners: Vec<Arc<dyn MetricsListener>> = vec![Arc::new(LogListener), collector.clone()];
        let m = Metrics::new(PlanId::new(3), hash_str("p"), listeners);
        m.record_batch(1);
        emit_span("batch", &[("rows", "1".to_string())]);
        m.finish(Outcome::Exhausted).unwrap();
        assert_eq!(collector.reports()[0].rows, 1);
    }
}
