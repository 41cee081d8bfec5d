//! Convenient re-exports for downstream crates.

pub use crate::batch::{equals_same_vars, Batch, BatchType, Merger, Projector};
pub use crate::binding::{ArrayBinding, BatchBinding, Binding, BindingMut, RowBinding};
pub use crate::config::EngineConfig;
pub use crate::dict::TermDict;
pub use crate::error::{CloseErrors, Error, Result};
pub use crate::id::{PlanId, SourceId};
pub use crate::id_batch::IdBatch;
pub use crate::report::{ExecutionId, ExecutionReport, Histogram, JoinReport};
pub use crate::term::{Term, Variable};
pub use crate::term_batch::TermBatch;
pub use crate::vars::{MutableVars, Vars};
