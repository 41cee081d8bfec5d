//! Source and estimator contracts, plus an in-memory source.
//!
//! Remote endpoints, stores and wire clients live outside this crate; they
//! reach the engine only through `Source`. `MemorySource` evaluates basic
//! graph patterns over a fixed triple set and can act as a binding-aware
//! endpoint, which makes it the reference for native bind.

use std::sync::Arc;
use std::time::Instant;

use fedq_core::binding::{Binding, RowBinding};
use fedq_core::id::SourceId;
use fedq_core::term::Term;
use fedq_core::{Batch, BatchType, Error, Result, Vars};
use fedq_operators::{BIt, BatchLimits, BatchesBIt, Interrupt, Terminal};

use crate::bind::{BindType, RowJoiner};
use crate::plan::{bind_all, TermPattern, TriplePattern};

pub trait Source<T: BatchType>: Send + Sync {
    fn name(&self) -> &str;

    /// Evaluate `triples` (already bound) into rows over `vars`. Vars that
    /// no triple binds take their value from `binding`.
    fn query(
        &self,
        ty: &T,
        triples: &[TriplePattern],
        vars: &Vars,
        binding: Option<&dyn Binding>,
    ) -> Result<Box<dyn BIt<T::Batch>>>;

    /// True when `bind` joins server side.
    fn uses_binding_aware_protocol(&self) -> bool {
        false
    }

    /// Join every row of `bindings` with `triples` server side. The output
    /// layout is `bind_type.out_vars(bindings.vars(), vars)`.
    fn bind(
        &self,
        _ty: &T,
        _triples: &[TriplePattern],
        _vars: &Vars,
        _bindings: Box<dyn BIt<T::Batch>>,
        _bind_type: BindType,
    ) -> Result<Box<dyn BIt<T::Batch>>> {
        Err(Error::protocol(format!(
            "source {} has no binding-aware protocol",
            self.name()
        )))
    }
}

/// Cardinality estimates for planners.
pub trait Estimator {
    /// Matching triples for `triple` under `binding`, saturating at
    /// `i32::MAX`.
    fn estimate(&self, triple: &TriplePattern, binding: Option<&dyn Binding>) -> u32;
}

type Store = Arc<[[Term; 3]]>;

pub struct MemorySource {
    id: SourceId,
    name: String,
    store: Store,
    binding_aware: bool,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, triples: impl IntoIterator<Item = [Term; 3]>) -> Self {
        Self {
            id: SourceId::next(),
            name: name.into(),
            store: triples.into_iter().collect(),
            binding_aware: false,
        }
    }

    /// Advertise (and serve) server-side bind.
    pub fn binding_aware(mut self, enabled: bool) -> Self {
        self.binding_aware = enabled;
        self
    }

    pub fn id(&self) -> SourceId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

impl<T: BatchType> Source<T> for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn query(
        &self,
        ty: &T,
        triples: &[TriplePattern],
        vars: &Vars,
        binding: Option<&dyn Binding>,
    ) -> Result<Box<dyn BIt<T::Batch>>> {
        let rows = evaluate(ty, &self.store, triples, vars, binding);
        #[cfg(feature = "tracing")]
        tracing::trace!(source = %self.name, rows = rows.rows(), "memory query");
        Ok(Box::new(BatchesBIt::new(ty.clone(), vars.clone(), [rows])))
    }

    fn uses_binding_aware_protocol(&self) -> bool {
        self.binding_aware
    }

    fn bind(
        &self,
        ty: &T,
        triples: &[TriplePattern],
        vars: &Vars,
        bindings: Box<dyn BIt<T::Batch>>,
        bind_type: BindType,
    ) -> Result<Box<dyn BIt<T::Batch>>> {
        if !self.binding_aware {
            return Err(Error::protocol(format!(
                "source {} has no binding-aware protocol",
                self.name
            )));
        }
        Ok(Box::new(NativeBindBIt::new(
            ty.clone(),
            Arc::clone(&self.store),
            triples.to_vec(),
            vars.clone(),
            bindings,
            bind_type,
        )))
    }
}

impl Estimator for MemorySource {
    fn estimate(&self, triple: &TriplePattern, binding: Option<&dyn Binding>) -> u32 {
        let bound = bind_all(std::slice::from_ref(triple), binding);
        let scope: Vars = bound[0].vars().cloned().collect();
        let count = self
            .store
            .iter()
            .filter(|t| unify_triple(&bound[0], t, &scope, &mut vec![None; scope.len()]))
            .count();
        count.min(i32::MAX as usize) as u32
    }
}

fn unify(pattern: &TermPattern, term: &Term, scope: &Vars, solution: &mut [Option<Term>]) -> bool {
    match pattern {
        TermPattern::Term(t) => t == term,
        TermPattern::Var(v) => {
            let Some(i) = scope.index_of(v) else {
                return false;
            };
            match &solution[i] {
                Some(bound) => bound == term,
                None => {
                    solution[i] = Some(term.clone());
                    true
                }
            }
        }
    }
}

fn unify_triple(
    pattern: &TriplePattern,
    triple: &[Term; 3],
    scope: &Vars,
    solution: &mut [Option<Term>],
) -> bool {
    pattern
        .positions()
        .into_iter()
        .zip(triple)
        .all(|(p, t)| unify(p, t, scope, solution))
}

/// Nested-loop BGP evaluation; rows come out over `vars`.
fn evaluate<T: BatchType>(
    ty: &T,
    store: &[[Term; 3]],
    triples: &[TriplePattern],
    vars: &Vars,
    binding: Option<&dyn Binding>,
) -> T::Batch {
    let scope: Vars = triples.iter().flat_map(|t| t.vars()).cloned().collect();
    let mut solutions: Vec<Vec<Option<Term>>> = vec![vec![None; scope.len()]];
    for pattern in triples {
        let mut next = Vec::new();
        for sol in &solutions {
            for triple in store {
                let mut candidate = sol.clone();
                if unify_triple(pattern, triple, &scope, &mut candidate) {
                    next.push(candidate);
                }
            }
        }
        solutions = next;
        if solutions.is_empty() {
            break;
        }
    }

    let mut out = ty.create(solutions.len(), vars.len());
    for sol in &solutions {
        out.begin_put();
        for (c, v) in vars.iter().enumerate() {
            let t = match scope.index_of(v) {
                Some(i) => sol[i].clone(),
                None => binding.and_then(|b| b.get(v)),
            };
            out.put_term(c, t.as_ref());
        }
        out.commit_put();
    }
    out
}

/// Server-side bind over a `MemorySource` store.
pub struct NativeBindBIt<T: BatchType> {
    ty: T,
    store: Store,
    triples: Vec<TriplePattern>,
    right_vars: Vars,
    left: Box<dyn BIt<T::Batch>>,
    joiner: RowJoiner,
    carry: Option<T::Batch>,
    limits: BatchLimits,
    terminal: Terminal,
}

impl<T: BatchType> NativeBindBIt<T> {
    fn new(
        ty: T,
        store: Store,
        triples: Vec<TriplePattern>,
        right_vars: Vars,
        left: Box<dyn BIt<T::Batch>>,
        bind_type: BindType,
    ) -> Self {
        let joiner = RowJoiner::new(&ty, bind_type, left.vars(), left.vars(), &right_vars);
        Self {
            limits: left.limits(),
            ty,
            store,
            triples,
            right_vars,
            left,
            joiner,
            carry: None,
            terminal: Terminal::default(),
        }
    }

    fn join_batch(&self, out: &mut T::Batch, batch: &T::Batch) {
        let left_vars = self.left.vars();
        for r in 0..batch.rows() {
            if !self.joiner.needs_query(batch, r) {
                self.joiner.finish(out, batch, r, 0);
                continue;
            }
            let binding = RowBinding::new(left_vars, batch, r);
            let bound = bind_all(&self.triples, Some(&binding));
            let right = evaluate(&self.ty, &self.store, &bound, &self.right_vars, Some(&binding));
            self.joiner.matched(out, batch, r, &right);
            self.joiner.finish(out, batch, r, right.rows());
            self.ty.recycle(right);
        }
    }
}

impl<T: BatchType> BIt<T::Batch> for NativeBindBIt<T> {
    fn vars(&self) -> &Vars {
        self.joiner.out_vars()
    }

    fn limits(&self) -> BatchLimits {
        self.limits
    }

    fn set_limits(&mut self, limits: BatchLimits) -> Result<()> {
        limits.validate()?;
        self.limits = limits;
        self.left.set_limits(limits)
    }

    fn next_batch(&mut self, recycled: Option<T::Batch>) -> Result<Option<T::Batch>> {
        if let Some(r) = recycled {
            self.ty.recycle(r);
        }
        if self.carry.is_none() {
            if let Some(done) = self.terminal.check() {
                return done;
            }
        }
        let mut out = self.carry.take();
        let deadline = Instant::now() + self.limits.max_wait;
        while self.terminal.is_open() {
            let held = out.as_ref().map_or(0, Batch::rows);
            if held >= self.limits.min_batch || (held > 0 && Instant::now() >= deadline) {
                break;
            }
            match self.left.next_batch(None) {
                Ok(Some(batch)) => {
                    let cols = self.joiner.out_vars().len();
                    let acc = out.get_or_insert_with(|| self.ty.create(batch.rows(), cols));
                    self.join_batch(acc, &batch);
                    self.left.recycle(batch);
                }
                Ok(None) => self.terminal.exhaust(),
                Err(e) => {
                    self.terminal.fail(e);
                }
            }
        }
        match out {
            Some(mut b) if !b.is_empty() => {
                if b.rows() > self.limits.max_batch {
                    self.carry = Some(b.split_off(self.limits.max_batch));
                }
                Ok(Some(b))
            }
            other => {
                if let Some(empty) = other {
                    self.ty.recycle(empty);
                }
                self.terminal.check().unwrap_or(Ok(None))
            }
        }
    }

    fn recycle(&mut self, batch: T::Batch) -> bool {
        self.ty.recycle(batch)
    }

    fn interrupt_handle(&self) -> Option<Arc<dyn Interrupt>> {
        self.left.interrupt_handle()
    }

    fn close(&mut self) -> Result<()> {
        if self.terminal.close() {
            if let Some(c) = self.carry.take() {
                self.ty.recycle(c);
            }
        }
        self.left.close()
    }
}
