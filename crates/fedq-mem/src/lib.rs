#![forbid(unsafe_code)]
//! fedq-mem: byte budgeting and batch recycling.
//!
//! Concrete implementations of the budget interfaces from
//! `fedq-core::budget`, the bounded `BatchPool` every `BatchType` recycles
//! into, and the two factories handed to operators: `TermBatchType` and
//! `IdBatchType`.

pub mod batch_type;
pub mod guard;
pub mod pool;
pub mod tracking;

pub use batch_type::{IdBatchType, TermBatchType};
pub use guard::{BudgetGuardImpl, MemoryBudgetImpl};
pub use pool::BatchPool;
pub use tracking::PeakTracker;
