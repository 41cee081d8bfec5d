//! Strongly-typed identifiers used across the engine.
//!
//! Operators and metrics should *not* pass raw integers around for these.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! new_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Ord, PartialOrd,
        )]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(v: u64) -> Self {
                Self(v)
            }
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

new_id!(PlanId);
new_id!(SourceId);

static NEXT_PLAN: AtomicU64 = AtomicU64::new(1);
static NEXT_SOURCE: AtomicU64 = AtomicU64::new(1);

impl PlanId {
    /// Process-local counter; plans built in one run get distinct ids.
    pub fn next() -> Self {
        Self(NEXT_PLAN.fetch_add(1, Ordering::Relaxed))
    }
}

impl SourceId {
    pub fn next() -> Self {
        Self(NEXT_SOURCE.fetch_add(1, Ordering::Relaxed))
    }
}
