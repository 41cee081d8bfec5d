//! Cross-source dedup for multi-source fan-out.
//!
//! A row is a duplicate only when a different source already emitted it.
//! Buckets hold 8 slots; each slot keeps a row, its hash and a 64-bit mask of
//! the sources that emitted it (source indexes fold modulo 64).
//!
//! Lookup scans the published slot hashes without locking, then takes the
//! bucket lock and re-checks each candidate's generation: a slot overwritten
//! since the scan is skipped. Two racing sources may both insert the same
//! row and both see "not duplicate".

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use fedq_core::{Batch, BatchType};

use super::Dedup;

const SLOTS: usize = 8;

struct Entry<B> {
    hash: u64,
    sources: u64,
    row: B,
}

struct Slots<B> {
    entries: [Option<Entry<B>>; SLOTS],
    victim: usize,
}

struct Bucket<B> {
    /// `hash | 1` of the entry in each slot; 0 while empty.
    tags: [AtomicU64; SLOTS],
    generations: [AtomicU64; SLOTS],
    slots: Mutex<Slots<B>>,
}

impl<B> Bucket<B> {
    fn new() -> Self {
        Self {
            tags: std::array::from_fn(|_| AtomicU64::new(0)),
            generations: std::array::from_fn(|_| AtomicU64::new(0)),
            slots: Mutex::new(Slots {
                entries: std::array::from_fn(|_| None),
                victim: 0,
            }),
        }
    }
}

pub struct WeakCrossSourceDedup<T: BatchType> {
    ty: T,
    cols: usize,
    buckets: Box<[Bucket<T::Batch>]>,
    occupied: AtomicUsize,
}

impl<T: BatchType> WeakCrossSourceDedup<T> {
    pub fn new(ty: &T, cols: usize, capacity: usize) -> Self {
        let buckets = capacity.div_ceil(SLOTS).max(1).next_power_of_two();
        Self {
            ty: ty.clone(),
            cols,
            buckets: (0..buckets).map(|_| Bucket::new()).collect(),
            occupied: AtomicUsize::new(0),
        }
    }
}

impl<T: BatchType> Dedup<T::Batch> for WeakCrossSourceDedup<T> {
    fn is_duplicate(&self, batch: &T::Batch, row: usize, source: usize) -> bool {
        let hash = batch.hash_row(row);
        let tag = hash | 1;
        let bit = 1u64 << (source % 64);
        let bucket = &self.buckets[hash as usize & (self.buckets.len() - 1)];

        let mut candidates = [None; SLOTS];
        for (i, c) in candidates.iter_mut().enumerate() {
            if bucket.tags[i].load(Ordering::Acquire) == tag {
                *c = Some(bucket.generations[i].load(Ordering::Acquire));
            }
        }

        let mut slots = bucket.slots.lock();
        for (i, seen) in candidates.iter().enumerate() {
            let Some(generation) = *seen else { continue };
            if bucket.generations[i].load(Ordering::Acquire) != generation {
                continue;
            }
            if let Some(e) = slots.entries[i].as_mut() {
                if e.hash == hash && e.row.equals_row(0, batch, row) {
                    if e.sources & !bit != 0 {
                        return true;
                    }
                    e.sources |= bit;
                    return false;
                }
            }
        }

        let i = match slots.entries.iter().position(Option::is_none) {
            Some(empty) => empty,
            None => {
                let v = slots.victim;
                slots.victim = (v + 1) % SLOTS;
                v
            }
        };
        match slots.entries[i].as_mut() {
            Some(e) => {
                e.hash = hash;
                e.sources = bit;
                e.row.clear(self.cols);
                e.row.put_row(batch, row);
            }
            None => {
                let mut single = self.ty.create_singleton(self.cols);
                single.put_row(batch, row);
                slots.entries[i] = Some(Entry {
                    hash,
                    sources: bit,
                    row: single,
                });
                self.occupied.fetch_add(1, Ordering::Relaxed);
            }
        }
        bucket.generations[i].fetch_add(1, Ordering::AcqRel);
        bucket.tags[i].store(tag, Ordering::Release);
        false
    }

    fn capacity(&self) -> usize {
        self.buckets.len() * SLOTS
    }

    fn len(&self) -> usize {
        self.occupied.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_rows::{ints, ty};
    use super::*;

    #[test]
    fn same_source_repeats_are_not_duplicates() {
        let d = WeakCrossSourceDedup::new(&ty(), 1, 1024);
        let batch = ints([7, 7, 7]);
        for r in 0..3 {
            assert!(!d.is_duplicate(&batch, r, 3));
        }
        assert_eq!(d.len(), 1);
    }

    #[test]
    fn any_other_source_sees_a_duplicate() {
        let d = WeakCrossSourceDedup::new(&ty(), 1, 1024);
        let batch = ints(0..100);
        for r in 0..batch.rows() {
            assert!(!d.is_duplicate(&batch, r, 0));
        }
        for src in 1..5 {
            for r in 0..batch.rows() {
                assert!(d.is_duplicate(&batch, r, src), "row {r} source {src}");
            }
        }
        // The first source keeps seeing its own rows as fresh.
        assert!(!d.is_duplicate(&batch, 0, 0));
    }

    #[test]
    fn sources_fold_modulo_64() {
        let d = WeakCrossSourceDedup::new(&ty(), 1, 64);
        let batch = ints([1]);
        assert!(!d.is_duplicate(&batch, 0, 2));
        assert!(!d.is_duplicate(&batch, 0, 66));
        assert!(d.is_duplicate(&batch, 0, 3));
    }

    #[test]
    fn full_bucket_evicts_round_robin() {
        let d = WeakCrossSourceDedup::new(&ty(), 1, SLOTS);
        let batch = ints(0..(SLOTS as i64 + 1));
        for r in 0..batch.rows() {
            assert!(!d.is_duplicate(&batch, r, 0));
        }
        assert_eq!(d.len(), SLOTS);
        // Row 0 was evicted by the ninth insert; another source no longer sees it.
        assert!(!d.is_duplicate(&batch, 0, 1));
        assert!(d.is_duplicate(&batch, SLOTS, 1));
    }
}
