//! Plan trees and their compilation into BIt pipelines.
//!
//! A `Plan` is built by an external planner; this crate only needs the
//! operator kind, the operands and the variable sets. `execute` turns the
//! tree into BIts: leaves query their source, unions merge concurrently,
//! joins go through `NativeBind::prefer_native`.

use std::fmt;
use std::sync::Arc;

use fedq_core::binding::Binding;
use fedq_core::config::EngineConfig;
use fedq_core::id::PlanId;
use fedq_core::term::{Term, Variable};
use fedq_core::{Batch, BatchType, Error, Projector, Result, TermBatch, Vars};
use fedq_operators::{
    AnyDedup, BIt, BatchLimits, BatchesBIt, DedupConcatBIt, DedupMergeBIt, MergeBIt,
    ProjectProcessor,
};

use crate::bind::BindType;
use crate::metrics::{JoinMetrics, Metrics};
use crate::modifier::{Modifier, ModifierBIt};
use crate::native::NativeBind;
use crate::source::Source;

/// One position of a triple pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TermPattern {
    Var(Variable),
    Term(Term),
}

impl TermPattern {
    pub fn as_var(&self) -> Option<&Variable> {
        match self {
            TermPattern::Var(v) => Some(v),
            TermPattern::Term(_) => None,
        }
    }

    fn bind(&self, binding: &dyn Binding) -> TermPattern {
        match self {
            TermPattern::Var(v) => match binding.get(v) {
                Some(t) => TermPattern::Term(t),
                None => self.clone(),
            },
            TermPattern::Term(_) => self.clone(),
        }
    }
}

impl From<Variable> for TermPattern {
    fn from(v: Variable) -> Self {
        TermPattern::Var(v)
    }
}

impl From<Term> for TermPattern {
    fn from(t: Term) -> Self {
        TermPattern::Term(t)
    }
}

impl fmt::Display for TermPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TermPattern::Var(v) => write!(f, "{v}"),
            TermPattern::Term(t) => write!(f, "{t}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TriplePattern {
    pub subject: TermPattern,
    pub predicate: TermPattern,
    pub object: TermPattern,
}

impl TriplePattern {
    pub fn new(
        subject: impl Into<TermPattern>,
        predicate: impl Into<TermPattern>,
        object: impl Into<TermPattern>,
    ) -> Self {
        Self {
            subject: subject.into(),
            predicate: predicate.into(),
            object: object.into(),
        }
    }

    pub fn positions(&self) -> [&TermPattern; 3] {
        [&self.subject, &self.predicate, &self.object]
    }

    pub fn vars(&self) -> impl Iterator<Item = &Variable> {
        self.positions().into_iter().filter_map(TermPattern::as_var)
    }

    /// Replace every var bound in `binding` by its term.
    pub fn bind(&self, binding: &dyn Binding) -> Self {
        Self {
            subject: self.subject.bind(binding),
            predicate: self.predicate.bind(binding),
            object: self.object.bind(binding),
        }
    }
}

impl fmt::Display for TriplePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.subject, self.predicate, self.object)
    }
}

pub fn bind_all(triples: &[TriplePattern], binding: Option<&dyn Binding>) -> Vec<TriplePattern> {
    match binding {
        Some(b) => triples.iter().map(|t| t.bind(b)).collect(),
        None => triples.to_vec(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlanKind {
    Query,
    Join,
    Union,
    LeftJoin,
    Exists,
    NotExists,
    Minus,
    Modifier,
    Values,
}

pub enum PlanOp<T: BatchType> {
    /// Basic graph pattern evaluated by one source.
    Query {
        source: Arc<dyn Source<T>>,
        triples: Vec<TriplePattern>,
    },
    Join(Vec<Arc<Plan<T>>>),
    Union(Vec<Arc<Plan<T>>>),
    /// LEFT JOIN, EXISTS, NOT EXISTS or MINUS of `right` against `left`.
    Binary {
        bind_type: BindType,
        left: Arc<Plan<T>>,
        right: Arc<Plan<T>>,
    },
    Modifier {
        input: Arc<Plan<T>>,
        modifier: Modifier,
    },
    /// Inline rows over the plan's public vars.
    Values { rows: TermBatch },
}

pub struct Plan<T: BatchType> {
    id: PlanId,
    op: PlanOp<T>,
    public_vars: Vars,
    all_vars: Vars,
}

fn fold_vars<'a>(vars: impl IntoIterator<Item = &'a Vars>) -> Vars {
    vars.into_iter().fold(Vars::empty(), |acc, v| acc.union(v))
}

impl<T: BatchType> Plan<T> {
    fn new(op: PlanOp<T>, public_vars: Vars, all_vars: Vars) -> Self {
        Self {
            id: PlanId::next(),
            op,
            public_vars,
            all_vars,
        }
    }

    pub fn query(source: Arc<dyn Source<T>>, triples: Vec<TriplePattern>) -> Self {
        let vars: Vars = triples.iter().flat_map(|t| t.vars()).cloned().collect();
        Self::new(PlanOp::Query { source, triples }, vars.clone(), vars)
    }

    pub fn join(operands: impl IntoIterator<Item = Plan<T>>) -> Self {
        let ops: Vec<Arc<Plan<T>>> = operands.into_iter().map(Arc::new).collect();
        let public = fold_vars(ops.iter().map(|p| &p.public_vars));
        let all = fold_vars(ops.iter().map(|p| &p.all_vars));
        Self::new(PlanOp::Join(ops), public, all)
    }

    pub fn union(operands: impl IntoIterator<Item = Plan<T>>) -> Self {
        let ops: Vec<Arc<Plan<T>>> = operands.into_iter().map(Arc::new).collect();
        let public = fold_vars(ops.iter().map(|p| &p.public_vars));
        let all = fold_vars(ops.iter().map(|p| &p.all_vars));
        Self::new(PlanOp::Union(ops), public, all)
    }

    fn binary(bind_type: BindType, left: Plan<T>, right: Plan<T>) -> Self {
        let public = bind_type.out_vars(&left.public_vars, &right.public_vars);
        let all = left.all_vars.union(&right.all_vars);
        let op = PlanOp::Binary {
            bind_type,
            left: Arc::new(left),
            right: Arc::new(right),
        };
        Self::new(op, public, all)
    }

    pub fn left_join(left: Plan<T>, right: Plan<T>) -> Self {
        Self::binary(BindType::LeftJoin, left, right)
    }

    pub fn exists(left: Plan<T>, right: Plan<T>) -> Self {
        Self::binary(BindType::Exists, left, right)
    }

    pub fn not_exists(left: Plan<T>, right: Plan<T>) -> Self {
        Self::binary(BindType::NotExists, left, right)
    }

    pub fn minus(left: Plan<T>, right: Plan<T>) -> Self {
        Self::binary(BindType::Minus, left, right)
    }

    pub fn modifier(input: Plan<T>, modifier: Modifier) -> Self {
        let public = modifier
            .projection
            .clone()
            .unwrap_or_else(|| input.public_vars.clone());
        let all = input.all_vars.union(&public);
        let op = PlanOp::Modifier {
            input: Arc::new(input),
            modifier,
        };
        Self::new(op, public, all)
    }

    pub fn values(vars: Vars, rows: impl IntoIterator<Item = Vec<Option<Term>>>) -> Self {
        let rows = TermBatch::of_rows(vars.len(), rows);
        Self::new(PlanOp::Values { rows }, vars.clone(), vars)
    }

    pub fn id(&self) -> PlanId {
        self.id
    }

    pub fn op(&self) -> &PlanOp<T> {
        &self.op
    }

    pub fn kind(&self) -> PlanKind {
        match &self.op {
            PlanOp::Query { .. } => PlanKind::Query,
            PlanOp::Join(_) => PlanKind::Join,
            PlanOp::Union(_) => PlanKind::Union,
            PlanOp::Binary { bind_type, .. } => match bind_type {
                BindType::Join => PlanKind::Join,
                BindType::LeftJoin => PlanKind::LeftJoin,
                BindType::Exists => PlanKind::Exists,
                BindType::NotExists => PlanKind::NotExists,
                BindType::Minus => PlanKind::Minus,
            },
            PlanOp::Modifier { .. } => PlanKind::Modifier,
            PlanOp::Values { .. } => PlanKind::Values,
        }
    }

    pub fn operands(&self) -> Vec<&Arc<Plan<T>>> {
        match &self.op {
            PlanOp::Query { .. } | PlanOp::Values { .. } => Vec::new(),
            PlanOp::Join(ops) | PlanOp::Union(ops) => ops.iter().collect(),
            PlanOp::Binary { left, right, .. } => vec![left, right],
            PlanOp::Modifier { input, .. } => vec![input],
        }
    }

    /// Output column layout.
    pub fn public_vars(&self) -> &Vars {
        &self.public_vars
    }

    /// Every var mentioned anywhere in the tree.
    pub fn all_vars(&self) -> &Vars {
        &self.all_vars
    }

    /// Compile into a BIt using the process-wide configuration.
    ///
    /// With a `binding`, every bound var is substituted before a source sees
    /// the query, and output rows carry the bound values. `dedup` asks for
    /// duplicate suppression where it is cheap; exact DISTINCT is a
    /// `Modifier`.
    pub fn execute(
        &self,
        ty: &T,
        binding: Option<&dyn Binding>,
        dedup: bool,
    ) -> Result<Box<dyn BIt<T::Batch>>> {
        let ctx = ExecContext::new(ty.clone(), Arc::new(EngineConfig::global().clone()));
        self.execute_in(&ctx, binding, dedup)
    }

    pub fn execute_in(
        &self,
        ctx: &ExecContext<T>,
        binding: Option<&dyn Binding>,
        dedup: bool,
    ) -> Result<Box<dyn BIt<T::Batch>>> {
        let mut bit = match &self.op {
            PlanOp::Query { source, triples } => {
                let bound = bind_all(triples, binding);
                let bit = source
                    .query(&ctx.ty, &bound, &self.public_vars, binding)
                    .map_err(|e| e.context(format!("query {}", source.name())))?;
                if dedup {
                    let table = AnyDedup::weak(
                        &ctx.ty,
                        self.public_vars.len(),
                        ctx.cfg.weak_dedup_capacity,
                    );
                    Box::new(DedupConcatBIt::new(
                        ctx.ty.clone(),
                        self.public_vars.clone(),
                        vec![bit],
                        Arc::new(table),
                        None,
                    ))
                } else {
                    bit
                }
            }
            PlanOp::Union(ops) => self.execute_union(ctx, ops, binding, dedup)?,
            PlanOp::Join(ops) => {
                let Some((first, rest)) = ops.split_first() else {
                    return Err(Error::protocol("join without operands"));
                };
                let left = first.execute_in(ctx, binding, false)?;
                NativeBind::prefer_native(ctx, left, rest, BindType::Join, binding, dedup)?
            }
            PlanOp::Binary {
                bind_type,
                left,
                right,
            } => {
                let left = left.execute_in(ctx, binding, false)?;
                NativeBind::prefer_native(
                    ctx,
                    left,
                    std::slice::from_ref(right),
                    *bind_type,
                    binding,
                    dedup,
                )?
            }
            PlanOp::Modifier { input, modifier } => {
                let input = input.execute_in(ctx, binding, modifier.distinct)?;
                Box::new(ModifierBIt::new(ctx, input, modifier))
            }
            PlanOp::Values { rows } => Box::new(BatchesBIt::new(
                ctx.ty.clone(),
                self.public_vars.clone(),
                [self.values_batch(&ctx.ty, rows, binding)],
            )),
        };
        bit.set_limits(ctx.limits())?;
        Ok(bit)
    }

    fn execute_union(
        &self,
        ctx: &ExecContext<T>,
        ops: &[Arc<Plan<T>>],
        binding: Option<&dyn Binding>,
        dedup: bool,
    ) -> Result<Box<dyn BIt<T::Batch>>> {
        let sources = ops
            .iter()
            .map(|p| p.execute_in(ctx, binding, dedup))
            .collect::<Result<Vec<_>>>()?;
        let projectors: Vec<Projector> = sources
            .iter()
            .map(|s| ctx.ty.projector(&self.public_vars, s.vars()))
            .collect();
        let vars = self.public_vars.clone();
        if dedup {
            let table = AnyDedup::strong(&ctx.ty, vars.len(), &ctx.cfg);
            return Ok(Box::new(DedupMergeBIt::with_config(
                ctx.ty.clone(),
                vars,
                sources,
                Arc::new(table),
                projectors,
                &ctx.cfg,
            )));
        }
        let merge = MergeBIt::with_config(ctx.ty.clone(), vars, sources, &ctx.cfg);
        if projectors.iter().all(Projector::is_identity) {
            Ok(Box::new(merge))
        } else {
            let project = ProjectProcessor::per_source(projectors);
            Ok(Box::new(merge.with_processor(Arc::new(project))))
        }
    }

    /// Rows compatible with `binding`, unbound cells filled from it.
    fn values_batch(&self, ty: &T, rows: &TermBatch, binding: Option<&dyn Binding>) -> T::Batch {
        let vars = &self.public_vars;
        let mut out = ty.create(rows.rows(), vars.len());
        'rows: for r in 0..rows.rows() {
            if let Some(b) = binding {
                for (c, v) in vars.iter().enumerate() {
                    if let (Some(have), Some(want)) = (rows.term(r, c), b.get(v)) {
                        if *have != want {
                            continue 'rows;
                        }
                    }
                }
            }
            out.begin_put();
            for (c, v) in vars.iter().enumerate() {
                let t = rows
                    .term(r, c)
                    .cloned()
                    .or_else(|| binding.and_then(|b| b.get(v)));
                out.put_term(c, t.as_ref());
            }
            out.commit_put();
        }
        out
    }
}

impl<T: BatchType> fmt::Display for Plan<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list<T: BatchType>(f: &mut fmt::Formatter<'_>, name: &str, ops: &[&Arc<Plan<T>>]) -> fmt::Result {
            write!(f, "{name}(")?;
            for (i, op) in ops.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{op}")?;
            }
            f.write_str(")")
        }
        match &self.op {
            PlanOp::Query { source, triples } => {
                write!(f, "Query[{}]{{", source.name())?;
                for (i, t) in triples.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" .")?;
                    }
                    write!(f, " {t}")?;
                }
                f.write_str(" }")
            }
            PlanOp::Join(_) => list(f, "Join", &self.operands()),
            PlanOp::Union(_) => list(f, "Union", &self.operands()),
            PlanOp::Binary { bind_type, .. } => list(f, bind_type.as_str(), &self.operands()),
            PlanOp::Modifier { input, modifier } => write!(f, "Modifier[{modifier}]({input})"),
            PlanOp::Values { rows } => write!(f, "Values[{}]({} rows)", self.public_vars, rows.rows()),
        }
    }
}

/// What a plan execution shares across its operators.
#[derive(Clone)]
pub struct ExecContext<T: BatchType> {
    pub ty: T,
    pub cfg: Arc<EngineConfig>,
    pub metrics: Option<Arc<Metrics>>,
}

impl<T: BatchType> ExecContext<T> {
    pub fn new(ty: T, cfg: Arc<EngineConfig>) -> Self {
        Self {
            ty,
            cfg,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn limits(&self) -> BatchLimits {
        BatchLimits::from_config(&self.cfg)
    }

    /// Register statistics for one join operand, when metered.
    pub fn join_metrics(&self, operand: usize, strategy: &'static str) -> Option<Arc<JoinMetrics>> {
        self.metrics.as_ref().map(|m| m.join(operand, strategy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use fedq_core::term::{iri, var};
    use fedq_mem::TermBatchType;

    fn source() -> Arc<dyn Source<TermBatchType>> {
        Arc::new(MemorySource::new("s", [[iri("a"), iri("p"), iri("b")]]))
    }

    #[test]
    fn vars_follow_operand_order() {
        let q1: Plan<TermBatchType> = Plan::query(
            source(),
            vec![TriplePattern::new(var("x"), iri("p"), var("y"))],
        );
        let q2 = Plan::query(
            source(),
            vec![TriplePattern::new(var("y"), iri("q"), var("z"))],
        );
        let join = Plan::join([q1, q2]);
        assert_eq!(join.public_vars(), &Vars::of(["x", "y", "z"]));
        assert_eq!(join.kind(), PlanKind::Join);
        assert_eq!(join.operands().len(), 2);
    }

    #[test]
    fn exists_keeps_left_vars_public() {
        let l: Plan<TermBatchType> = Plan::values(Vars::of(["x"]), vec![vec![Some(iri("a"))]]);
        let r = Plan::query(source(), vec![TriplePattern::new(var("x"), iri("p"), var("y"))]);
        let p = Plan::exists(l, r);
        assert_eq!(p.public_vars(), &Vars::of(["x"]));
        assert_eq!(p.all_vars(), &Vars::of(["x", "y"]));
        assert_eq!(p.kind(), PlanKind::Exists);
    }

    #[test]
    fn display_is_stable() {
        let q: Plan<TermBatchType> =
            Plan::query(source(), vec![TriplePattern::new(var("x"), iri("p"), var("y"))]);
        assert_eq!(q.to_string(), "Query[s]{ ?x <p> ?y }");
    }
}
