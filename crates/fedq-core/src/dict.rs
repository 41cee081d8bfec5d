//! Store-local term dictionary backing `IdBatch`.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::term::Term;

/// Id reserved for "unbound".
pub const UNBOUND_ID: u64 = 0;

#[derive(Default)]
struct DictInner {
    ids: FxHashMap<Term, u64>,
    terms: Vec<Term>,
}

/// Concurrent interning dictionary. Ids are dense and start at 1.
#[derive(Default)]
pub struct TermDict {
    inner: RwLock<DictInner>,
}

impl TermDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, term: &Term) -> Option<u64> {
        self.inner.read().ids.get(term).copied()
    }

    /// Id of `term`, assigning a new one on first sight.
    pub fn intern(&self, term: &Term) -> u64 {
        if let Some(id) = self.lookup(term) {
            return id;
        }
        let mut inner = self.inner.write();
        if let Some(&id) = inner.ids.get(term) {
            return id;
        }
        inner.terms.push(term.clone());
        let id = inner.terms.len() as u64;
        inner.ids.insert(term.clone(), id);
        id
    }

    pub fn resolve(&self, id: u64) -> Option<Term> {
        if id == UNBOUND_ID {
            return None;
        }
        self.inner.read().terms.get((id - 1) as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for TermDict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TermDict").field("len", &self.len()).finish()
    }
}
