use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use fedq_core::config::EngineConfig;
use fedq_core::term::{int, iri, var};
use fedq_core::{Batch, TermBatch, Vars};
use fedq_exec::{Engine, MemorySource, Plan, Source, TriplePattern};
use fedq_mem::TermBatchType;
use fedq_operators::{
    collect_all, AnyDedup, BIt, BatchesBIt, Dedup, DedupMergeBIt, MergeBIt, StrongDedup, WeakDedup,
};

fn make_batch(rows: usize, distinct: i64) -> TermBatch {
    TermBatch::of_rows(
        2,
        (0..rows as i64).map(|i| vec![Some(int(i % distinct)), Some(int((i * 7) % distinct))]),
    )
}

fn bench_dedup_tables(c: &mut Criterion) {
    let ty = TermBatchType::new(64, 32 << 20);
    let batch = make_batch(4096, 1024);
    let mut group = c.benchmark_group("dedup");
    group.bench_function("strong", |b| {
        b.iter(|| {
            let d = StrongDedup::new(&ty, 2, 1024, usize::MAX);
            (0..batch.rows()).filter(|&r| !d.is_duplicate(&batch, r, 0)).count()
        })
    });
    group.bench_function("weak", |b| {
        b.iter(|| {
            let d = WeakDedup::new(&ty, 2, 1 << 12);
            (0..batch.rows()).filter(|&r| !d.is_duplicate(&batch, r, 0)).count()
        })
    });
    group.finish();
}

fn sources(ty: &TermBatchType, n: usize) -> Vec<Box<dyn BIt<TermBatch>>> {
    (0..n)
        .map(|_| {
            let chunks: Vec<TermBatch> = (0..16).map(|_| make_batch(256, 512)).collect();
            Box::new(BatchesBIt::new(ty.clone(), Vars::of(["x", "y"]), chunks)) as Box<dyn BIt<TermBatch>>
        })
        .collect()
}

fn bench_merge(c: &mut Criterion) {
    let ty = TermBatchType::new(64, 32 << 20);
    let mut group = c.benchmark_group("merge");
    for n in [1usize, 4, 8] {
        group.bench_with_input(BenchmarkId::new("plain", n), &n, |b, &n| {
            b.iter(|| {
                let mut merge = MergeBIt::new(ty.clone(), Vars::of(["x", "y"]), sources(&ty, n));
                collect_all(&ty, &mut merge).map(|all| all.rows()).unwrap_or(0)
            })
        });
        group.bench_with_input(BenchmarkId::new("distinct", n), &n, |b, &n| {
            b.iter(|| {
                let table = Arc::new(AnyDedup::strong(&ty, 2, &EngineConfig::default()));
                let mut merge =
                    DedupMergeBIt::new(ty.clone(), Vars::of(["x", "y"]), sources(&ty, n), table, Vec::new());
                collect_all(&ty, &mut merge).map(|all| all.rows()).unwrap_or(0)
            })
        });
    }
    group.finish();
}

fn bench_bind_join(c: &mut Criterion) {
    let ex = |s: String| iri(&format!("http://example.org/{s}"));
    let triples: Vec<_> = (0..256)
        .flat_map(|i| {
            [
                [ex(format!("p{i}")), ex("type".into()), ex("Person".into())],
                [ex(format!("p{i}")), ex("age".into()), int(i % 90)],
            ]
        })
        .collect();
    let engine = match Engine::new(TermBatchType::default(), EngineConfig::default()) {
        Ok(e) => e,
        Err(e) => panic!("default config rejected: {e}"),
    };
    let mut group = c.benchmark_group("bind_join");
    for native in [false, true] {
        let left: Arc<dyn Source<TermBatchType>> =
            Arc::new(MemorySource::new("people", triples.clone()).binding_aware(native));
        let right: Arc<dyn Source<TermBatchType>> =
            Arc::new(MemorySource::new("ages", triples.clone()).binding_aware(native));
        let plan = Plan::join([
            Plan::query(left, vec![TriplePattern::new(var("p"), ex("type".into()), ex("Person".into()))]),
            Plan::query(right, vec![TriplePattern::new(var("p"), ex("age".into()), var("a"))]),
        ]);
        let name = if native { "native" } else { "client" };
        group.bench_function(name, |b| {
            b.iter(|| engine.collect(&plan).map(|all| all.rows()).unwrap_or(0))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_dedup_tables, bench_merge, bench_bind_join);
criterion_main!(benches);
