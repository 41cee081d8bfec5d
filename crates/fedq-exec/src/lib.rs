#![forbid(unsafe_code)]
//! fedq-exec: plan execution, bind joins, and metrics.
//!
//! A `Plan` compiles into a tree of BIts from `fedq-operators`. Joins run as
//! bind joins: native (server side) when the right operand is a query on a
//! binding-aware source, client side otherwise. The `Engine` wraps each
//! execution root so that one `ExecutionReport` reaches its listeners.

pub mod bind;
pub mod metrics;
pub mod modifier;
pub mod native;
pub mod plan;
pub mod runtime;
pub mod source;

pub use bind::{BindType, PlanBindingBIt};
pub use metrics::{
    CountingBIt, JoinCounter, JoinMetrics, LogListener, Metrics, MetricsBIt, MetricsListener,
    Outcome, ReportCollector,
};
pub use modifier::{Modifier, ModifierBIt};
pub use native::{MultiBindBIt, NativeBind};
pub use plan::{bind_all, ExecContext, Plan, PlanKind, PlanOp, TermPattern, TriplePattern};
pub use runtime::Engine;
pub use source::{Estimator, MemorySource, NativeBindBIt, Source};
