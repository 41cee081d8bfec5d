//! Hashing helpers: fast row hashing for dedup tables and stable digests for
//! execution reports.

use std::fmt;
use std::hash::{Hash, Hasher};

use blake3::Hasher as Blake3;
use rustc_hash::FxHasher;

use crate::term::Term;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Hash256(pub [u8; 32]);

/// Lowercase hex on display.
impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.iter().try_for_each(|b| write!(f, "{b:02x}"))
    }
}

pub fn hash_bytes(bytes: &[u8]) -> Hash256 {
    let mut h = Blake3::new();
    h.update(bytes);
    let out = h.finalize();
    Hash256(out.into())
}

/// Stable digest of a plan's textual rendering.
pub fn hash_str(s: &str) -> Hash256 {
    hash_bytes(s.as_bytes())
}

/// Row hasher used by every batch representation.
///
/// Unbound cells hash as a distinct marker so `(None, x)` and `(x, None)` differ.
#[derive(Default)]
pub struct RowHasher(FxHasher);

impl RowHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn term(&mut self, term: Option<&Term>) {
        match term {
            None => 0u8.hash(&mut self.0),
            Some(t) => {
                1u8.hash(&mut self.0);
                t.hash(&mut self.0);
            }
        }
    }

    pub fn finish(&self) -> u64 {
        // Fx leaves the low bits weak for small inputs; fold the high half in
        // because tables index with the low bits.
        let h = self.0.finish();
        h ^ (h >> 32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_digest_displays_as_lowercase_hex() {
        let a = hash_str("join(query(people), query(names))");
        let shown = a.to_string();
        assert_eq!(shown.len(), 64);
        assert!(shown.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')));
        assert_eq!(shown, hash_str("join(query(people), query(names))").to_string());
        assert_ne!(shown, hash_str("union(query(people))").to_string());
    }

    #[test]
    fn unbound_cells_keep_their_position() {
        let x: Term = crate::term::int(1);
        let mut a = RowHasher::new();
        a.term(None);
        a.term(Some(&x));
        let mut b = RowHasher::new();
        b.term(Some(&x));
        b.term(None);
        assert_ne!(a.finish(), b.finish());
    }
}
