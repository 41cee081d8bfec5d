//! Shared fixtures for the workspace tests.
#![allow(dead_code)]

use std::sync::Arc;

use fedq_core::term::{iri, int, Term};
use fedq_core::{Batch, BatchType, TermBatch, Vars};
use fedq_exec::{MemorySource, Source};
use fedq_mem::TermBatchType;
use fedq_operators::{BIt, BatchesBIt};

pub fn term_type() -> TermBatchType {
    TermBatchType::new(16, 1 << 20)
}

/// One-column batch of integer literals.
pub fn ints(values: impl IntoIterator<Item = i64>) -> TermBatch {
    TermBatch::of_rows(1, values.into_iter().map(|i| vec![Some(int(i))]))
}

/// Integer value of a cell produced by `int`.
pub fn int_at<B: Batch>(batch: &B, row: usize, col: usize) -> Option<i64> {
    match batch.get(row, col)? {
        Term::Literal(l) => l.value().parse().ok(),
        _ => None,
    }
}

pub fn column<B: Batch>(batch: &B, col: usize) -> Vec<i64> {
    (0..batch.rows()).filter_map(|r| int_at(batch, r, col)).collect()
}

/// A source over `x` emitting `values` split into batches of `chunk` rows.
pub fn int_source(ty: &TermBatchType, values: &[i64], chunk: usize) -> Box<dyn BIt<TermBatch>> {
    let batches: Vec<TermBatch> = values.chunks(chunk.max(1)).map(|c| ints(c.iter().copied())).collect();
    Box::new(BatchesBIt::new(ty.clone(), Vars::of(["x"]), batches))
}

/// Drain a BIt without closing it.
pub fn drain(bit: &mut dyn BIt<TermBatch>) -> fedq_core::Result<Vec<TermBatch>> {
    let mut out = Vec::new();
    while let Some(b) = bit.next_batch(None)? {
        out.push(b);
    }
    Ok(out)
}

pub fn rows_sorted<B: Batch>(ty: &TermBatchType, batch: &B) -> Vec<Vec<Option<Term>>> {
    let converted: TermBatch = ty.convert(batch);
    let mut rows = converted.to_rows();
    rows.sort_by_key(|r| format!("{r:?}"));
    rows
}

/// A small social graph: `person` type triples, names, and `knows` edges.
pub fn social_triples(people: usize) -> Vec<[Term; 3]> {
    let mut triples = Vec::new();
    for i in 0..people {
        let p = iri(format!("http://example.org/p{i}"));
        triples.push([p.clone(), iri("http://example.org/type"), iri("http://example.org/Person")]);
        if i % 2 == 0 {
            triples.push([p.clone(), iri("http://example.org/name"), fedq_core::term::lit(format!("P{i}"))]);
        }
        triples.push([p, iri("http://example.org/knows"), iri(format!("http://example.org/p{}", (i + 1) % people))]);
    }
    triples
}

pub fn memory_source(name: &str, triples: Vec<[Term; 3]>, binding_aware: bool) -> Arc<dyn Source<TermBatchType>> {
    Arc::new(MemorySource::new(name, triples).binding_aware(binding_aware))
}

pub fn ex(local: &str) -> Term {
    iri(format!("http://example.org/{local}"))
}
