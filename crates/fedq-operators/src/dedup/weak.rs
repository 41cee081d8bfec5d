//! Lossy dedup: one row per slot plus a membership bitset.
//!
//! Slots are only ever `try_lock`ed, so callers never block: under
//! contention the row is neither compared nor inserted, and colliding rows
//! evict each other. Both cases yield false negatives. A `true` answer always
//! comes from an equality check against the stored row.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use fedq_core::{Batch, BatchType};

use super::{bitset, set_bit, test_bit, Dedup};

/// Membership bits per slot.
const BITS_PER_SLOT: usize = 8;

struct Slot<B> {
    hash: u64,
    row: B,
}

pub struct WeakDedup<T: BatchType> {
    ty: T,
    cols: usize,
    slots: Box<[Mutex<Option<Slot<T::Batch>>>]>,
    members: Box<[AtomicU64]>,
    member_mask: usize,
    occupied: AtomicUsize,
}

impl<T: BatchType> WeakDedup<T> {
    pub fn new(ty: &T, cols: usize, capacity: usize) -> Self {
        let slots = capacity.max(1).next_power_of_two();
        let member_bits = slots * BITS_PER_SLOT;
        Self {
            ty: ty.clone(),
            cols,
            slots: (0..slots).map(|_| Mutex::new(None)).collect(),
            members: bitset(member_bits),
            member_mask: member_bits - 1,
            occupied: AtomicUsize::new(0),
        }
    }

    fn member_bit(&self, hash: u64) -> usize {
        hash.rotate_right(29) as usize & self.member_mask
    }
}

impl<T: BatchType> Dedup<T::Batch> for WeakDedup<T> {
    fn is_duplicate(&self, batch: &T::Batch, row: usize, _source: usize) -> bool {
        let hash = batch.hash_row(row);
        let bit = self.member_bit(hash);
        let Some(mut slot) = self.slots[hash as usize & (self.slots.len() - 1)].try_lock() else {
            return false;
        };
        if test_bit(&self.members, bit) {
            if let Some(s) = slot.as_ref() {
                if s.hash == hash && s.row.equals_row(0, batch, row) {
                    return true;
                }
            }
        }
        match slot.as_mut() {
            Some(s) => {
                s.hash = hash;
                s.row.clear(self.cols);
                s.row.put_row(batch, row);
            }
            None => {
                let mut single = self.ty.create_singleton(self.cols);
                single.put_row(batch, row);
                *slot = Some(Slot { hash, row: single });
                self.occupied.fetch_add(1, Ordering::Relaxed);
            }
        }
        set_bit(&self.members, bit);
        false
    }

    fn capacity(&self) -> usize {
        self.slots.len()
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
    fn never_reports_unseen_rows() {
        let d = WeakDedup::new(&ty(), 1, 64);
        let batch = ints(0..10_000);
        for r in 0..batch.rows() {
            assert!(!d.is_duplicate(&batch, r, 0), "row {r}");
        }
        assert!(d.len() <= d.capacity());
    }

    #[test]
    fn repeat_misses_stay_bounded_with_headroom() {
        // Capacity 4x the distinct rows: misses are evictions by later rows.
        let distinct = 1_024;
        let d = WeakDedup::new(&ty(), 1, distinct * 4);
        let batch = ints(0..distinct as i64);
        for r in 0..batch.rows() {
            d.is_duplicate(&batch, r, 0);
        }
        let missed = (0..batch.rows())
            .filter(|&r| !d.is_duplicate(&batch, r, 0))
            .count();
        assert!(missed * 100 < distinct * 30, "missed {missed} of {distinct}");
    }

    #[test]
    fn contended_slot_reports_not_duplicate() {
        let d = WeakDedup::new(&ty(), 1, 1);
        let batch = ints([5]);
        assert!(!d.is_duplicate(&batch, 0, 0));
        let _held = d.slots[0].lock();
        assert!(!d.is_duplicate(&batch, 0, 0));
    }
}
