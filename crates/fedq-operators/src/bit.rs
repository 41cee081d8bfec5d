//! The batched iterator (`BIt`) contract.
//!
//! A `BIt` is pulled with `next_batch`, which returns `Ok(None)` on
//! exhaustion. Non-final batches are never empty. Size and wait bounds are
//! negotiated through `BatchLimits`:
//!
//! - a batch holds at least `min_batch` rows unless the source is exhausted,
//!   `max_wait` elapsed with at least one row held, or `max_batch` rows were
//!   collected;
//! - `min_wait` delays the first return opportunity of queue-backed BIts.
//!
//! Once terminated a `BIt` keeps answering the same way: `Ok(None)` after
//! exhaustion, the captured error after a failure, `Error::Cancelled` after
//! a caller `close` that came before exhaustion.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use fedq_core::config::EngineConfig;
use fedq_core::{Batch, BatchType, Error, Result, Vars};

/// Size and wait bounds for batch assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub min_batch: usize,
    pub max_batch: usize,
    pub min_wait: Duration,
    pub max_wait: Duration,
}

impl BatchLimits {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            min_batch: cfg.min_batch,
            max_batch: cfg.max_batch,
            min_wait: cfg.min_wait(),
            max_wait: cfg.max_wait(),
        }
    }

    /// Reject bounds no BIt could honour.
    pub fn validate(&self) -> Result<()> {
        if self.min_batch == 0 {
            return Err(Error::protocol("min_batch must be at least 1"));
        }
        if self.max_batch == 0 {
            return Err(Error::protocol("max_batch must be at least 1"));
        }
        if self.min_batch > self.max_batch {
            return Err(Error::protocol(format!(
                "min_batch {} exceeds max_batch {}",
                self.min_batch, self.max_batch
            )));
        }
        if self.min_wait > self.max_wait {
            return Err(Error::protocol(format!(
                "min_wait {:?} exceeds max_wait {:?}",
                self.min_wait, self.max_wait
            )));
        }
        Ok(())
    }

    /// Limits that return every row as soon as it is available.
    pub fn eager(max_batch: usize) -> Self {
        Self {
            min_batch: 1,
            max_batch,
            min_wait: Duration::ZERO,
            max_wait: Duration::ZERO,
        }
    }
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self::from_config(EngineConfig::global())
    }
}

/// Wakes a thread parked inside a `BIt`. Triggering it terminates the BIt
/// with `Error::Cancelled` from the parked thread's point of view.
pub trait Interrupt: Send + Sync {
    fn interrupt(&self);
}

/// Fan-out interrupt whose targets may be registered late. A target
/// registered after the cell fired is interrupted immediately.
#[derive(Default)]
pub struct InterruptCell {
    state: Mutex<(bool, Vec<Arc<dyn Interrupt>>)>,
}

impl InterruptCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, target: Arc<dyn Interrupt>) {
        let mut st = self.state.lock();
        if st.0 {
            drop(st);
            target.interrupt();
        } else {
            st.1.push(target);
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.state.lock().0
    }
}

impl Interrupt for InterruptCell {
    fn interrupt(&self) {
        let targets = {
            let mut st = self.state.lock();
            st.0 = true;
            std::mem::take(&mut st.1)
        };
        for t in targets {
            t.interrupt();
        }
    }
}

pub trait BIt<B: Batch>: Send {
    /// Output column layout.
    fn vars(&self) -> &Vars;

    fn limits(&self) -> BatchLimits;

    /// Replace the limits. Wrappers forward them to children that have not
    /// started yet.
    fn set_limits(&mut self, limits: BatchLimits) -> Result<()>;

    /// Next batch, `Ok(None)` on exhaustion. `recycled` is a consumed batch
    /// the BIt may reuse as scratch.
    fn next_batch(&mut self, recycled: Option<B>) -> Result<Option<B>>;

    /// Hand a consumed batch back. Returns false when nothing retained it.
    fn recycle(&mut self, batch: B) -> bool;

    fn interrupt_handle(&self) -> Option<Arc<dyn Interrupt>> {
        None
    }

    /// Idempotent. Releases children; close-time failures are aggregated.
    fn close(&mut self) -> Result<()>;
}

impl<B: Batch> BIt<B> for Box<dyn BIt<B>> {
    fn vars(&self) -> &Vars {
        (**self).vars()
    }

    fn limits(&self) -> BatchLimits {
        (**self).limits()
    }

    fn set_limits(&mut self, limits: BatchLimits) -> Result<()> {
        (**self).set_limits(limits)
    }

    fn next_batch(&mut self, recycled: Option<B>) -> Result<Option<B>> {
        (**self).next_batch(recycled)
    }

    fn recycle(&mut self, batch: B) -> bool {
        (**self).recycle(batch)
    }

    fn interrupt_handle(&self) -> Option<Arc<dyn Interrupt>> {
        (**self).interrupt_handle()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Fluent by-value limit setters.
pub trait BItExt<B: Batch>: BIt<B> + Sized {
    fn min_batch(mut self, rows: usize) -> Result<Self> {
        let limits = BatchLimits {
            min_batch: rows,
            ..self.limits()
        };
        self.set_limits(limits)?;
        Ok(self)
    }

    fn max_batch(mut self, rows: usize) -> Result<Self> {
        let limits = BatchLimits {
            max_batch: rows,
            ..self.limits()
        };
        self.set_limits(limits)?;
        Ok(self)
    }

    fn min_wait(mut self, wait: Duration) -> Result<Self> {
        let limits = BatchLimits {
            min_wait: wait,
            ..self.limits()
        };
        self.set_limits(limits)?;
        Ok(self)
    }

    fn max_wait(mut self, wait: Duration) -> Result<Self> {
        let limits = BatchLimits {
            max_wait: wait,
            ..self.limits()
        };
        self.set_limits(limits)?;
        Ok(self)
    }

    fn boxed(self) -> Box<dyn BIt<B>>
    where
        Self: 'static,
    {
        Box::new(self)
    }
}

impl<B: Batch, I: BIt<B>> BItExt<B> for I {}

#[derive(Debug, Clone, Default)]
enum State {
    #[default]
    Open,
    Exhausted,
    Failed(Error),
    Cancelled,
}

/// Terminal state bookkeeping shared by every BIt implementation.
#[derive(Debug, Clone, Default)]
pub struct Terminal {
    state: State,
    closed: bool,
}

impl Terminal {
    pub fn is_open(&self) -> bool {
        matches!(self.state, State::Open)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// The answer `next_batch` must give once terminated; `None` while open.
    pub fn check<B>(&self) -> Option<Result<Option<B>>> {
        match &self.state {
            State::Open => None,
            State::Exhausted => Some(Ok(None)),
            State::Failed(e) => Some(Err(e.clone())),
            State::Cancelled => Some(Err(Error::Cancelled)),
        }
    }

    pub fn exhaust(&mut self) {
        if self.is_open() {
            self.state = State::Exhausted;
        }
    }

    /// Record `err` (first failure wins) and return the error to surface.
    pub fn fail(&mut self, err: Error) -> Error {
        if self.is_open() {
            self.state = State::Failed(err.clone());
        }
        err
    }

    /// Mark closed by the caller. Returns true on the first call only, which
    /// is when children must be closed. A BIt that already terminated keeps
    /// its answer.
    pub fn close(&mut self) -> bool {
        if self.is_open() {
            self.state = State::Cancelled;
        }
        !std::mem::replace(&mut self.closed, true)
    }
}

/// Drain `bit` into one batch and close it.
pub fn collect_all<T: BatchType>(ty: &T, bit: &mut dyn BIt<T::Batch>) -> Result<T::Batch> {
    let mut out = ty.create(0, bit.vars().len());
    let drained = loop {
        match bit.next_batch(None) {
            Ok(Some(b)) => out.append(b),
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };
    let closed = bit.close();
    drained?;
    closed?;
    Ok(out)
}

/// Implement `BIt` for a newtype over another `BatchType`-generic BIt.
macro_rules! delegate_bit {
    ($outer:ident, $field:ident) => {
        impl<T: ::fedq_core::BatchType> $crate::bit::BIt<T::Batch> for $outer<T> {
            fn vars(&self) -> &::fedq_core::Vars {
                $crate::bit::BIt::vars(&self.$field)
            }

            fn limits(&self) -> $crate::bit::BatchLimits {
                $crate::bit::BIt::limits(&self.$field)
            }

            fn set_limits(&mut self, limits: $crate::bit::BatchLimits) -> ::fedq_core::Result<()> {
                $crate::bit::BIt::set_limits(&mut self.$field, limits)
            }

            fn next_batch(
                &mut self,
                recycled: Option<T::Batch>,
            ) -> ::fedq_core::Result<Option<T::Batch>> {
                $crate::bit::BIt::next_batch(&mut self.$field, recycled)
            }

            fn recycle(&mut self, batch: T::Batch) -> bool {
                $crate::bit::BIt::recycle(&mut self.$field, batch)
            }

            fn interrupt_handle(&self) -> Option<::std::sync::Arc<dyn $crate::bit::Interrupt>> {
                $crate::bit::BIt::interrupt_handle(&self.$field)
            }

            fn close(&mut self) -> ::fedq_core::Result<()> {
                $crate::bit::BIt::close(&mut self.$field)
            }
        }
    };
}
pub(crate) use delegate_bit;
