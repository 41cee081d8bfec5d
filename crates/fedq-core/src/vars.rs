//! Ordered, deduplicated variable lists. They define the column semantics of
//! every batch.

use std::fmt;
use std::sync::Arc;

use crate::term::Variable;

/// Immutable variable list. Cloning shares storage.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Vars {
    vars: Arc<[Variable]>,
}

impl Vars {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from names, keeping the first occurrence of duplicates.
    pub fn of<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        names
            .into_iter()
            .map(|n| Variable::new_unchecked(n))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn get(&self, i: usize) -> Option<&Variable> {
        self.vars.get(i)
    }

    pub fn index_of(&self, var: &Variable) -> Option<usize> {
        self.vars.iter().position(|v| v == var)
    }

    pub fn index_of_name(&self, name: &str) -> Option<usize> {
        self.vars.iter().position(|v| v.as_str() == name)
    }

    pub fn contains(&self, var: &Variable) -> bool {
        self.index_of(var).is_some()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Variable> {
        self.vars.iter()
    }

    pub fn as_slice(&self) -> &[Variable] {
        &self.vars
    }

    /// `self` followed by the vars of `other` not already present.
    pub fn union(&self, other: &Vars) -> Vars {
        if other.iter().all(|v| self.contains(v)) {
            return self.clone();
        }
        self.iter().chain(other.iter()).cloned().collect()
    }

    /// Vars of `self` (in `self` order) also present in `other`.
    pub fn intersection(&self, other: &Vars) -> Vars {
        self.iter().filter(|v| other.contains(v)).cloned().collect()
    }

    /// Vars of `self` absent from `other`.
    pub fn minus(&self, other: &Vars) -> Vars {
        self.iter().filter(|v| !other.contains(v)).cloned().collect()
    }

    pub fn intersects(&self, other: &Vars) -> bool {
        self.iter().any(|v| other.contains(v))
    }

    pub fn to_mutable(&self) -> MutableVars {
        MutableVars {
            vars: self.vars.to_vec(),
        }
    }
}

impl FromIterator<Variable> for Vars {
    fn from_iter<T: IntoIterator<Item = Variable>>(iter: T) -> Self {
        let mut out = MutableVars::new();
        for v in iter {
            out.add(v);
        }
        out.freeze()
    }
}

impl<'a> IntoIterator for &'a Vars {
    type Item = &'a Variable;
    type IntoIter = std::slice::Iter<'a, Variable>;

    fn into_iter(self) -> Self::IntoIter {
        self.vars.iter()
    }
}

impl fmt::Display for Vars {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, v) in self.vars.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{v}")?;
        }
        f.write_str("]")
    }
}

impl fmt::Debug for Vars {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Explicitly mutable builder; `freeze` produces the shared immutable form.
#[derive(Debug, Clone, Default)]
pub struct MutableVars {
    vars: Vec<Variable>,
}

impl MutableVars {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when `var` was already present.
    pub fn add(&mut self, var: Variable) -> bool {
        if self.vars.contains(&var) {
            return false;
        }
        self.vars.push(var);
        true
    }

    pub fn add_all<'a>(&mut self, vars: impl IntoIterator<Item = &'a Variable>) -> bool {
        let mut changed = false;
        for v in vars {
            changed |= self.add(v.clone());
        }
        changed
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn freeze(self) -> Vars {
        Vars {
            vars: self.vars.into(),
        }
    }
}
