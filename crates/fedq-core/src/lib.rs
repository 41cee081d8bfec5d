#![forbid(unsafe_code)]
//! fedq-core: shared vocabulary of the fedq execution core.
//!
//! Terms, `Vars`, the `Batch`/`BatchType` contracts with their two
//! representations, bindings, budgets, errors and configuration. No threads,
//! pools or I/O live here; `fedq-mem` and `fedq-operators` build on these.

pub mod batch;
pub mod binding;
pub mod budget;
pub mod config;
pub mod dict;
pub mod error;
pub mod hash;
pub mod id;
pub mod id_batch;
pub mod prelude;
pub mod report;
pub mod term;
pub mod term_batch;
pub mod vars;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use batch::{equals_same_vars, Batch, BatchType, Merger, Projector};
pub use error::{CloseErrors, Error, Result};
pub use id_batch::IdBatch;
pub use term_batch::TermBatch;
pub use vars::{MutableVars, Vars};
