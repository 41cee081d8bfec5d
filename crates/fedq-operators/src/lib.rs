#![forbid(unsafe_code)]
//! fedq-operators: the batched iterator protocol and its composition
//! operators.
//!
//! Design intent:
//! - Pull-based, synchronous `BIt`s; concurrency only where a Merge (or a
//!   bind scatter in `fedq-exec`) spawns one worker thread per source.
//! - Batches move by value: producer -> queue -> consumer -> pool.
//! - Dedup tables are the only structures mutated concurrently.

pub mod bit;
pub mod concat;
pub mod dedup;
pub mod merge;
pub mod processor;
pub mod queue;
pub mod source;

pub use bit::{collect_all, BIt, BItExt, BatchLimits, Interrupt, InterruptCell, Terminal};
pub use concat::{ConcatBIt, DedupConcatBIt};
pub use dedup::{AnyDedup, Dedup, StrongDedup, WeakCrossSourceDedup, WeakDedup};
pub use merge::{DedupMergeBIt, MergeBIt};
pub use processor::{BatchProcessor, DedupProcessor, ProjectProcessor, RowFilter};
pub use queue::{queue_bit, BatchQueue, QueueBIt, QueueSender};
pub use source::{BatchesBIt, EmptyBIt, ErrorBIt, FailingBIt};
