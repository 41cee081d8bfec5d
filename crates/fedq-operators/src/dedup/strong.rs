//! Exact dedup: a hash table split into lock stripes over append-only row
//! arenas.
//!
//! The top hash bits pick a stripe, the low bits a bucket inside it. Each
//! stripe has its own read/write lock, so inserts of rows in different
//! stripes never wait on each other. The fast path only tries the stripe's
//! read lock and never blocks; a miss or a busy stripe falls through to the
//! write lock, which re-validates before inserting. Every bucket carries a 64-bit
//! hint word with one bit set per stored hash, rebuilt on rehash, which lets a
//! lookup reject most absent rows without comparing any of them.
//!
//! Tuning constants: 16 stripes; a stripe rehashes at 75% of
//! `buckets * bucket_capacity`; bucket capacity starts at 8 and doubles on
//! each rehash once the table holds more than 2^15 buckets. Past
//! `max_entries` rows nothing is inserted and unseen rows are reported as not
//! duplicate.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::RwLock;

use fedq_core::{Batch, BatchType};

use super::Dedup;

const STRIPE_BITS: u32 = 4;
const STRIPES: usize = 1 << STRIPE_BITS;
const INITIAL_BUCKET_CAPACITY: usize = 8;
const BUCKET_DOUBLING_THRESHOLD: usize = 1 << 15;
const MIN_BUCKETS: usize = 4;

fn stripe_of(hash: u64) -> usize {
    (hash >> (64 - STRIPE_BITS)) as usize
}

fn hint_of(hash: u64) -> u64 {
    1 << ((hash >> 32) & 63)
}

#[derive(Default)]
struct Bucket {
    hint: u64,
    hashes: Vec<u64>,
    rows: Vec<u32>,
}

impl Bucket {
    fn push(&mut self, hash: u64, row: u32) {
        self.hint |= hint_of(hash);
        self.hashes.push(hash);
        self.rows.push(row);
    }
}

struct Stripe<B> {
    arena: B,
    buckets: Vec<Bucket>,
    bucket_capacity: usize,
}

impl<B: Batch> Stripe<B> {
    fn bucket(&self, hash: u64) -> &Bucket {
        &self.buckets[hash as usize & (self.buckets.len() - 1)]
    }

    fn contains(&self, hash: u64, batch: &B, row: usize) -> bool {
        let bucket = self.bucket(hash);
        if bucket.hint & hint_of(hash) == 0 {
            return false;
        }
        bucket
            .hashes
            .iter()
            .zip(&bucket.rows)
            .any(|(&h, &r)| h == hash && self.arena.equals_row(r as usize, batch, row))
    }

    fn insert(&mut self, hash: u64, batch: &B, row: usize) {
        let idx = self.arena.rows() as u32;
        self.arena.put_row(batch, row);
        let mask = self.buckets.len() - 1;
        self.buckets[hash as usize & mask].push(hash, idx);
        if self.arena.rows() * 4 > self.buckets.len() * self.bucket_capacity * 3 {
            self.rehash();
        }
    }

    fn rehash(&mut self) {
        let len = self.buckets.len() * 2;
        if len * STRIPES > BUCKET_DOUBLING_THRESHOLD {
            self.bucket_capacity *= 2;
        }
        let mut buckets: Vec<Bucket> = (0..len).map(|_| Bucket::default()).collect();
        for old in self.buckets.drain(..) {
            for (h, r) in old.hashes.into_iter().zip(old.rows) {
                buckets[h as usize & (len - 1)].push(h, r);
            }
        }
        self.buckets = buckets;
    }

    fn capacity(&self) -> usize {
        self.buckets.len() * self.bucket_capacity
    }
}

pub struct StrongDedup<T: BatchType> {
    stripes: Box<[RwLock<Stripe<T::Batch>>]>,
    max_entries: usize,
    len: AtomicUsize,
    saturated: AtomicBool,
}

impl<T: BatchType> StrongDedup<T> {
    pub fn new(ty: &T, cols: usize, initial_capacity: usize, max_entries: usize) -> Self {
        let per_stripe = initial_capacity.div_ceil(STRIPES);
        let buckets = (per_stripe / INITIAL_BUCKET_CAPACITY)
            .next_power_of_two()
            .max(MIN_BUCKETS);
        let stripes = (0..STRIPES)
            .map(|_| {
                RwLock::new(Stripe {
                    arena: ty.create(per_stripe.min(1 << 12), cols),
                    buckets: (0..buckets).map(|_| Bucket::default()).collect(),
                    bucket_capacity: INITIAL_BUCKET_CAPACITY,
                })
            })
            .collect();
        Self {
            stripes,
            max_entries: max_entries.min(u32::MAX as usize),
            len: AtomicUsize::new(0),
            saturated: AtomicBool::new(false),
        }
    }

    pub fn is_saturated(&self) -> bool {
        self.saturated.load(Ordering::Acquire)
    }

    /// Claim room for one more row. Fails once `max_entries` rows are held.
    fn reserve(&self) -> bool {
        self.len
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_entries).then_some(n + 1)
            })
            .is_ok()
    }
}

impl<T: BatchType> Dedup<T::Batch> for StrongDedup<T> {
    fn is_duplicate(&self, batch: &T::Batch, row: usize, _source: usize) -> bool {
        let hash = batch.hash_row(row);
        let stripe = &self.stripes[stripe_of(hash)];
        if stripe.try_read().is_some_and(|s| s.contains(hash, batch, row)) {
            return true;
        }
        if self.is_saturated() {
            return false;
        }

        let mut stripe = stripe.write();
        if stripe.contains(hash, batch, row) {
            return true;
        }
        if !self.reserve() {
            if !self.saturated.swap(true, Ordering::AcqRel) {
                #[cfg(feature = "tracing")]
                tracing::warn!(entries = self.max_entries, "strong dedup saturated");
            }
            return false;
        }
        stripe.insert(hash, batch, row);
        false
    }

    fn capacity(&self) -> usize {
        self.stripes.iter().map(|s| s.read().capacity()).sum()
    }

    fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    use super::super::test_rows::{ints, ty};
    use super::*;
    use fedq_mem::TermBatchType;

    #[test]
    fn exact_over_repeats() {
        let d = StrongDedup::new(&ty(), 1, 16, usize::MAX);
        let batch = ints([1, 2, 3, 1, 2, 4, 3, 3]);
        let got: Vec<bool> = (0..batch.rows()).map(|r| d.is_duplicate(&batch, r, 0)).collect();
        assert_eq!(got, vec![false, false, false, true, true, false, true, true]);
        assert_eq!(d.len(), 4);
    }

    #[test]
    fn rehash_keeps_every_row() {
        let d = StrongDedup::new(&ty(), 1, 16, usize::MAX);
        let initial = d.capacity();
        let batch = ints(0..5_000);
        for r in 0..batch.rows() {
            assert!(!d.is_duplicate(&batch, r, 0));
        }
        assert!(d.capacity() > initial);
        for r in 0..batch.rows() {
            assert!(d.is_duplicate(&batch, r, 1));
        }
        assert_eq!(d.len(), 5_000);
    }

    #[test]
    fn hint_words_follow_rehash() {
        let d = StrongDedup::new(&ty(), 1, 16, usize::MAX);
        let batch = ints(0..20_000);
        for r in 0..batch.rows() {
            d.is_duplicate(&batch, r, 0);
        }
        let mut held = 0;
        for stripe in d.stripes.iter() {
            let stripe = stripe.read();
            assert!(stripe.buckets.len() > MIN_BUCKETS);
            for bucket in &stripe.buckets {
                let expect = bucket.hashes.iter().fold(0, |acc, &h| acc | hint_of(h));
                assert_eq!(bucket.hint, expect);
                held += bucket.rows.len();
            }
        }
        assert_eq!(held, 20_000);
        let absent = ints(20_000..20_100);
        let rejected = (0..absent.rows())
            .filter(|&r| {
                let hash = absent.hash_row(r);
                let stripe = d.stripes[stripe_of(hash)].read();
                stripe.bucket(hash).hint & hint_of(hash) == 0
            })
            .count();
        assert!(rejected > 50, "{rejected} of 100 absent rows rejected by hints");
    }

    #[test]
    fn saturation_stops_inserting() {
        let d = StrongDedup::new(&ty(), 1, 16, 3);
        let batch = ints([1, 2, 3, 4, 4, 1]);
        let got: Vec<bool> = (0..batch.rows()).map(|r| d.is_duplicate(&batch, r, 0)).collect();
        assert_eq!(got, vec![false, false, false, false, false, true]);
        assert!(d.is_saturated());
        assert_eq!(d.len(), 3);
    }

    #[test]
    fn concurrent_inserts_report_each_row_new_once() {
        let d: Arc<StrongDedup<TermBatchType>> = Arc::new(StrongDedup::new(&ty(), 1, 16, usize::MAX));
        let fresh = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let d = Arc::clone(&d);
                let fresh = Arc::clone(&fresh);
                thread::spawn(move || {
                    // Every row is submitted by two threads.
                    let batch = ints((0..2_000).filter(|i| i % 4 != t && (i + 1) % 4 != t));
                    for r in 0..batch.rows() {
                        if !d.is_duplicate(&batch, r, t as usize) {
                            fresh.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(fresh.load(Ordering::Relaxed), 2_000);
        assert_eq!(d.len(), 2_000);
    }
}
