//! Dedup engines on their own and inside Merge/Concat

mod test_data_gen;

use std::collections::HashSet;
use std::sync::Arc;

use fedq_core::config::EngineConfig;
use fedq_core::{Batch, Projector, TermBatch, Vars};
use fedq_operators::{
    collect_all, AnyDedup, BIt, Dedup, DedupConcatBIt, DedupMergeBIt, StrongDedup,
    WeakCrossSourceDedup, WeakDedup,
};
use proptest::prelude::*;
use test_data_gen::{column, int_source, ints, term_type};

#[test]
fn test_strong_dedup_merge_is_exact_across_sources() {
    let ty = term_type();
    let sources: Vec<Box<dyn BIt<TermBatch>>> = (0..4)
        .map(|s| {
            let values: Vec<i64> = (0..500).map(|i| (i * (s + 1)) % 300).collect();
            int_source(&ty, &values, 37)
        })
        .collect();
    let table = Arc::new(AnyDedup::strong(&ty, 1, &EngineConfig::default()));
    let mut merge = DedupMergeBIt::new(ty.clone(), Vars::of(["x"]), sources, Arc::clone(&table), Vec::new());
    let all = collect_all(&ty, &mut merge).unwrap();
    let out = column(&all, 0);
    let distinct: HashSet<i64> = out.iter().copied().collect();
    assert_eq!(distinct.len(), out.len(), "strong dedup let a duplicate through");
    assert_eq!(distinct, (0..300).collect::<HashSet<_>>());
    assert_eq!(table.len(), 300);
}

#[test]
fn test_dedup_merge_projects_before_comparing() {
    let ty = term_type();
    let xy = TermBatch::of_rows(
        2,
        [
            vec![Some(fedq_core::term::int(1)), Some(fedq_core::term::int(10))],
            vec![Some(fedq_core::term::int(1)), Some(fedq_core::term::int(11))],
        ],
    );
    let left: Box<dyn BIt<TermBatch>> = Box::new(fedq_operators::BatchesBIt::new(
        ty.clone(),
        Vars::of(["x", "y"]),
        [xy],
    ));
    let right = int_source(&ty, &[1, 2], 1);
    let out = Vars::of(["x"]);
    let projectors = vec![
        Projector::new(&out, &Vars::of(["x", "y"])),
        Projector::new(&out, &Vars::of(["x"])),
    ];
    let table = Arc::new(AnyDedup::strong(&ty, 1, &EngineConfig::default()));
    let mut merge = DedupMergeBIt::new(ty.clone(), out, vec![left, right], table, projectors);
    let all = collect_all(&ty, &mut merge).unwrap();
    let mut got = column(&all, 0);
    got.sort_unstable();
    assert_eq!(got, vec![1, 2]);
}

#[test]
fn test_dedup_concat_filters_across_sources() {
    let ty = term_type();
    let sources = vec![int_source(&ty, &[1, 2, 3], 2), int_source(&ty, &[3, 2, 4], 2)];
    let table = Arc::new(AnyDedup::strong(&ty, 1, &EngineConfig::default()));
    let mut concat = DedupConcatBIt::new(ty.clone(), Vars::of(["x"]), sources, table, None);
    let all = collect_all(&ty, &mut concat).unwrap();
    assert_eq!(column(&all, 0), vec![1, 2, 3, 4]);
}

#[test]
fn test_cross_source_keeps_repeats_of_one_source() {
    let ty = term_type();
    let d = WeakCrossSourceDedup::new(&ty, 1, 64);
    let b = ints([5, 5, 6]);
    assert!(!d.is_duplicate(&b, 0, 0));
    assert!(!d.is_duplicate(&b, 1, 0));
    assert!(d.is_duplicate(&b, 0, 1));
    assert!(!d.is_duplicate(&b, 2, 1));
    assert!(d.is_duplicate(&b, 2, 2));
}

#[test]
fn test_cross_source_indexes_fold_modulo_64() {
    let ty = term_type();
    let d = WeakCrossSourceDedup::new(&ty, 1, 64);
    let b = ints([9]);
    assert!(!d.is_duplicate(&b, 0, 3));
    assert!(!d.is_duplicate(&b, 0, 67));
    assert!(d.is_duplicate(&b, 0, 4));
}

#[test]
fn test_saturated_strong_dedup_admits_unseen_rows() {
    let ty = term_type();
    let d = StrongDedup::new(&ty, 1, 16, 2);
    let b = ints([1, 2, 3, 3, 1]);
    let got: Vec<bool> = (0..b.rows()).map(|r| d.is_duplicate(&b, r, 0)).collect();
    assert_eq!(got, vec![false, false, false, false, true]);
    assert!(d.is_saturated());
    assert_eq!(d.len(), 2);
}

#[test]
fn test_strong_dedup_is_exact_under_concurrency() {
    let ty = term_type();
    let d = Arc::new(StrongDedup::new(&ty, 1, 16, usize::MAX));
    let initial = d.capacity();
    // Far more rows than the table starts with, so every stripe rehashes
    // while other threads are reading it.
    let batch = Arc::new(ints(0..20_000));
    let handles: Vec<_> = (0..8)
        .map(|s| {
            let d = Arc::clone(&d);
            let batch = Arc::clone(&batch);
            std::thread::spawn(move || {
                // Alternate directions so threads meet in the middle.
                let order: Vec<usize> = if s % 2 == 0 {
                    (0..batch.rows()).collect()
                } else {
                    (0..batch.rows()).rev().collect()
                };
                order
                    .into_iter()
                    .filter(|&r| !d.is_duplicate(&batch, r, s))
                    .count()
            })
        })
        .collect();
    let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(admitted, 20_000);
    assert_eq!(d.len(), 20_000);
    assert!(d.capacity() > initial);
    assert!((0..batch.rows()).all(|r| d.is_duplicate(&batch, r, 0)));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_weak_dedup_never_drops_unique_rows(values in prop::collection::vec(0i64..50, 0..200), cap in 1usize..64) {
        let ty = term_type();
        let d = WeakDedup::new(&ty, 1, cap);
        let b = ints(values.iter().copied());
        let mut seen = HashSet::new();
        for r in 0..b.rows() {
            let first = seen.insert(values[r]);
            if d.is_duplicate(&b, r, 0) {
                prop_assert!(!first, "first occurrence of {} flagged", values[r]);
            }
        }
    }

    #[test]
    fn prop_filter_matches_first_occurrences(values in prop::collection::vec(0i64..30, 0..120)) {
        let ty = term_type();
        let d = StrongDedup::new(&ty, 1, 16, usize::MAX);
        let mut b = ints(values.iter().copied());
        d.filter(&mut b, 0, None);
        let mut seen = HashSet::new();
        let expected: Vec<i64> = values.into_iter().filter(|v| seen.insert(*v)).collect();
        prop_assert_eq!(column(&b, 0), expected);
    }
}
