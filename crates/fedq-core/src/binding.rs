//! Variable-to-term mappings used to instantiate bound sub-queries.
//!
//! All representations share one contract: lookup by position or variable,
//! and equality/hashing by value (`binding_eq` / `binding_hash`), so a
//! batch-backed binding equals an array-backed one holding the same terms.

use std::fmt;
use std::hash::{Hash, Hasher};

use crate::batch::Batch;
use crate::hash::RowHasher;
use crate::term::{Term, Variable};
use crate::vars::Vars;

pub trait Binding {
    fn vars(&self) -> &Vars;

    fn get_at(&self, i: usize) -> Option<Term>;

    fn get(&self, var: &Variable) -> Option<Term> {
        self.vars().index_of(var).and_then(|i| self.get_at(i))
    }

    /// True when at least one var is bound.
    fn any_bound(&self) -> bool {
        (0..self.vars().len()).any(|i| self.get_at(i).is_some())
    }
}

pub trait BindingMut: Binding {
    fn set_at(&mut self, i: usize, term: Option<Term>);

    /// Returns false when `var` is not part of this binding.
    fn set(&mut self, var: &Variable, term: Option<Term>) -> bool {
        match self.vars().index_of(var) {
            Some(i) => {
                self.set_at(i, term);
                true
            }
            None => false,
        }
    }

    fn clear(&mut self);
}

/// Value equality: same vars in the same order and the same terms.
pub fn binding_eq(a: &dyn Binding, b: &dyn Binding) -> bool {
    a.vars() == b.vars() && (0..a.vars().len()).all(|i| a.get_at(i) == b.get_at(i))
}

pub fn binding_hash(b: &dyn Binding) -> u64 {
    let mut h = RowHasher::new();
    for i in 0..b.vars().len() {
        h.term(b.get_at(i).as_ref());
    }
    h.finish()
}

/// Binding backed by its own term array.
#[derive(Clone)]
pub struct ArrayBinding {
    vars: Vars,
    terms: Vec<Option<Term>>,
}

impl ArrayBinding {
    pub fn new(vars: Vars) -> Self {
        let terms = vec![None; vars.len()];
        Self { vars, terms }
    }

    pub fn with_terms(vars: Vars, terms: Vec<Option<Term>>) -> Self {
        assert_eq!(vars.len(), terms.len(), "one term per var");
        Self { vars, terms }
    }

    /// Copy of any other binding.
    pub fn copy_of(other: &dyn Binding) -> Self {
        let vars = other.vars().clone();
        let terms = (0..vars.len()).map(|i| other.get_at(i)).collect();
        Self { vars, terms }
    }
}

impl Binding for ArrayBinding {
    fn vars(&self) -> &Vars {
        &self.vars
    }

    fn get_at(&self, i: usize) -> Option<Term> {
        self.terms.get(i).cloned().flatten()
    }
}

impl BindingMut for ArrayBinding {
    fn set_at(&mut self, i: usize, term: Option<Term>) {
        self.terms[i] = term;
    }

    fn clear(&mut self) {
        self.terms.iter_mut().for_each(|t| *t = None);
    }
}

/// Binding over one row of an owned batch. The bind runtime moves a left row
/// here instead of copying it term by term.
pub struct BatchBinding<B: Batch> {
    vars: Vars,
    batch: B,
    row: usize,
}

impl<B: Batch> BatchBinding<B> {
    pub fn new(vars: Vars, batch: B) -> Self {
        debug_assert_eq!(vars.len(), batch.cols());
        Self {
            vars,
            batch,
            row: 0,
        }
    }

    pub fn set_row(&mut self, row: usize) {
        debug_assert!(row < self.batch.rows());
        self.row = row;
    }

    pub fn row(&self) -> usize {
        self.row
    }

    pub fn batch(&self) -> &B {
        &self.batch
    }

    pub fn into_batch(self) -> B {
        self.batch
    }
}

impl<B: Batch> Binding for BatchBinding<B> {
    fn vars(&self) -> &Vars {
        &self.vars
    }

    fn get_at(&self, i: usize) -> Option<Term> {
        if i >= self.batch.cols() || self.row >= self.batch.rows() {
            return None;
        }
        self.batch.get(self.row, i)
    }
}

/// Borrowed view over a row of any batch.
pub struct RowBinding<'a, B: Batch> {
    vars: &'a Vars,
    batch: &'a B,
    row: usize,
}

impl<'a, B: Batch> RowBinding<'a, B> {
    pub fn new(vars: &'a Vars, batch: &'a B, row: usize) -> Self {
        Self { vars, batch, row }
    }
}

impl<B: Batch> Binding for RowBinding<'_, B> {
    fn vars(&self) -> &Vars {
        self.vars
    }

    fn get_at(&self, i: usize) -> Option<Term> {
        if i >= self.batch.cols() {
            return None;
        }
        self.batch.get(self.row, i)
    }
}

macro_rules! value_semantics {
    ($ty:ty $(, $gen:ident)?) => {
        impl$(<$gen: Batch>)? PartialEq for $ty {
            fn eq(&self, other: &Self) -> bool {
                binding_eq(self, other)
            }
        }

        impl$(<$gen: Batch>)? Eq for $ty {}

        impl$(<$gen: Batch>)? Hash for $ty {
            fn hash<H: Hasher>(&self, state: &mut H) {
                state.write_u64(binding_hash(self));
            }
        }

        impl$(<$gen: Batch>)? fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let mut m = f.debug_map();
                for (i, v) in self.vars().iter().enumerate() {
                    m.entry(&v.as_str(), &self.get_at(i));
                }
                m.finish()
            }
        }
    };
}

value_semantics!(ArrayBinding);
value_semantics!(BatchBinding<B>, B);
