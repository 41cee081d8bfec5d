//! Immutable execution report handed to metrics listeners once a plan
//! execution completes.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::hash::Hash256;
use crate::id::PlanId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

/// Power-of-two bucketed histogram. Bucket `i` counts values in `[2^(i-1), 2^i)`,
/// bucket 0 counts zeros.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Histogram {
    pub buckets: Vec<u64>,
    pub count: u64,
    pub sum: u64,
    pub max: u64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self {
            buckets: vec![0; 65],
            count: 0,
            sum: 0,
            max: 0,
        }
    }
}

impl Histogram {
    pub fn record(&mut self, value: u64) {
        let bucket = (u64::BITS - value.leading_zeros()) as usize;
        self.buckets[bucket] += 1;
        self.count += 1;
        self.sum = self.sum.saturating_add(value);
        self.max = self.max.max(value);
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum as f64 / self.count as f64
        }
    }
}

/// Per-operand statistics of one join.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinReport {
    /// Operand index within the join plan (1 for the first right operand).
    pub operand: usize,
    /// "native", "multi-native" or "client".
    pub strategy: String,
    pub left_rows: u64,
    pub bound_queries: u64,
    pub right_rows: u64,
    pub emitted_rows: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub id: ExecutionId,

    pub plan_id: PlanId,

    /// Stable digest of the plan rendering.
    pub plan_hash: Hash256,

    /// Engine version string for provenance.
    pub engine_version: String,

    pub rows: u64,
    pub batches: u64,

    /// Rows per delivered batch.
    pub batch_rows: Histogram,

    /// Microseconds between consecutive deliveries.
    pub batch_latency_us: Histogram,

    pub first_row_us: Option<u64>,

    pub joins: Vec<JoinReport>,

    /// Terminal error, if the execution failed.
    pub error: Option<String>,

    /// True when the consumer closed the execution before exhaustion.
    pub cancelled: bool,

    /// Milliseconds since Unix epoch (UTC).
    pub started_ms: u64,
    pub finished_ms: u64,
}

impl ExecutionReport {
    pub fn new(plan_id: PlanId, plan_hash: Hash256, started_ms: u64) -> Self {
        Self {
            id: ExecutionId::new(),
            plan_id,
            plan_hash,
            engine_version: crate::VERSION.to_string(),
            rows: 0,
            batches: 0,
            batch_rows: Histogram::default(),
            batch_latency_us: Histogram::default(),
            first_row_us: None,
            joins: Vec::new(),
            error: None,
            cancelled: false,
            started_ms,
            finished_ms: started_ms,
        }
    }

    pub fn finish(mut self, finished_ms: u64) -> Self {
        self.finished_ms = finished_ms;
        self
    }
}
