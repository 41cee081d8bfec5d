//! Batch and BatchType contracts.
//!
//! A batch is an owned, reusable buffer of rows over a fixed column count.
//! Ownership moves producer → queue → consumer → pool; nothing here is shared
//! between threads without such a hand-off.
//!
//! Writes are staged: `begin_put` → `put_term`* → `commit_put`. Until the
//! commit, `rows()` and `get` do not see the staged row.

use std::fmt;

use rustc_hash::FxHashMap;

use crate::term::Term;
use crate::vars::Vars;

pub trait Batch: Send + Sync + fmt::Debug + Sized + 'static {
    fn rows(&self) -> usize;

    fn cols(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.rows() == 0
    }

    /// Owned copy of one cell; `None` is unbound.
    fn get(&self, row: usize, col: usize) -> Option<Term>;

    /// Drop all rows (and any staged row) and switch to `cols` columns.
    fn clear(&mut self, cols: usize);

    fn reserve(&mut self, additional_rows: usize);

    fn begin_put(&mut self);

    fn put_term(&mut self, col: usize, term: Option<&Term>);

    fn commit_put(&mut self);

    /// Discard a staged row.
    fn abort_put(&mut self);

    /// Copy row `row` of `src` (same representation) to the end of `self`.
    fn put_row(&mut self, src: &Self, row: usize);

    /// Copy one row from another representation.
    fn put_row_converting<O: Batch>(&mut self, src: &O, row: usize) {
        debug_assert_eq!(src.cols(), self.cols());
        self.begin_put();
        for c in 0..self.cols() {
            let t = src.get(row, c);
            self.put_term(c, t.as_ref());
        }
        self.commit_put();
    }

    /// Copy all rows of another representation.
    fn put_converting<O: Batch>(&mut self, src: &O) {
        self.reserve(src.rows());
        for r in 0..src.rows() {
            self.put_row_converting(src, r);
        }
    }

    /// Copy all rows of `src` to the end of `self`.
    fn put(&mut self, src: &Self) {
        self.reserve(src.rows());
        for r in 0..src.rows() {
            self.put_row(src, r);
        }
    }

    /// Move all rows of `other` to the end of `self`. When `self` is empty the
    /// storage of `other` is taken over without copying rows.
    fn append(&mut self, other: Self);

    /// Split off rows `[at, rows)` into a new batch.
    fn split_off(&mut self, at: usize) -> Self;

    fn truncate(&mut self, rows: usize);

    /// Keep rows whose `keep` flag is set, compacted to the front in order.
    fn retain_mask(&mut self, keep: &[bool]);

    /// Reorder columns in place: output column `i` takes input column
    /// `columns[i]`, or unbound for `None`. Safe when an input column feeds
    /// several outputs or moves left/right.
    fn project(&mut self, columns: &[Option<usize>]);

    /// Append row `row` of `self`, projected by `columns`, to `dst`.
    fn project_row_into(&self, row: usize, dst: &mut Self, columns: &[Option<usize>]) {
        dst.begin_put();
        for (out, src) in columns.iter().enumerate() {
            let t = src.and_then(|c| self.get(row, c));
            dst.put_term(out, t.as_ref());
        }
        dst.commit_put();
    }

    /// Hash of one row, consistent with `equals_row` within one representation.
    fn hash_row(&self, row: usize) -> u64;

    fn equals_row(&self, row: usize, other: &Self, other_row: usize) -> bool;

    /// Rough heap footprint, used by recycling pools.
    fn approx_bytes(&self) -> usize;
}

/// Factory and strategy object bound to one batch representation.
pub trait BatchType: Clone + Send + Sync + 'static {
    type Batch: Batch;

    fn name(&self) -> &'static str;

    /// New empty batch with room for `rows` rows, possibly recycled.
    fn create(&self, rows: usize, cols: usize) -> Self::Batch;

    fn create_singleton(&self, cols: usize) -> Self::Batch {
        self.create(1, cols)
    }

    /// Hand `batch` to the pool. Returns false when the pool refused it; the
    /// batch is dropped in that case.
    fn recycle(&self, batch: Self::Batch) -> bool;

    /// `recycled` cleared to `cols` columns, or a fresh batch.
    fn reuse(&self, recycled: Option<Self::Batch>, rows: usize, cols: usize) -> Self::Batch {
        match recycled {
            Some(mut b) => {
                b.clear(cols);
                b.reserve(rows);
                b
            }
            None => self.create(rows, cols),
        }
    }

    fn convert<O: Batch>(&self, src: &O) -> Self::Batch {
        let mut b = self.create(src.rows(), src.cols());
        b.put_converting(src);
        b
    }

    fn projector(&self, out: &Vars, input: &Vars) -> Projector {
        Projector::new(out, input)
    }

    fn merger(&self, out: &Vars, left: &Vars, right: &Vars) -> Merger {
        Merger::new(out, left, right)
    }
}

/// Column mapping from one `Vars` layout to another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projector {
    columns: Vec<Option<usize>>,
    input_cols: usize,
    out_vars: Vars,
}

impl Projector {
    pub fn new(out: &Vars, input: &Vars) -> Self {
        Self {
            columns: out.iter().map(|v| input.index_of(v)).collect(),
            input_cols: input.len(),
            out_vars: out.clone(),
        }
    }

    pub fn columns(&self) -> &[Option<usize>] {
        &self.columns
    }

    pub fn out_vars(&self) -> &Vars {
        &self.out_vars
    }

    /// True when projecting would not change any row.
    pub fn is_identity(&self) -> bool {
        self.columns.len() == self.input_cols
            && self.columns.iter().enumerate().all(|(i, c)| *c == Some(i))
    }

    pub fn project<B: Batch>(&self, batch: &mut B) {
        if !self.is_identity() {
            batch.project(&self.columns);
        }
    }

    pub fn project_row_into<B: Batch>(&self, src: &B, row: usize, dst: &mut B) {
        src.project_row_into(row, dst, &self.columns);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MergeCol {
    Left(usize),
    Right(usize),
    /// Shared var: left value unless the left row leaves it unbound.
    Both(usize, usize),
    Unbound,
}

/// Column mapping producing join output rows from a left row and right rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Merger {
    columns: Vec<MergeCol>,
    out_vars: Vars,
}

impl Merger {
    pub fn new(out: &Vars, left: &Vars, right: &Vars) -> Self {
        let columns = out
            .iter()
            .map(|v| match (left.index_of(v), right.index_of(v)) {
                (Some(l), Some(r)) => MergeCol::Both(l, r),
                (Some(l), None) => MergeCol::Left(l),
                (None, Some(r)) => MergeCol::Right(r),
                (None, None) => MergeCol::Unbound,
            })
            .collect();
        Self {
            columns,
            out_vars: out.clone(),
        }
    }

    pub fn out_vars(&self) -> &Vars {
        &self.out_vars
    }

    /// Append one output row per row of `right`.
    pub fn merge<L: Batch, R: Batch, O: Batch>(&self, out: &mut O, left: &L, lrow: usize, right: &R) {
        out.reserve(right.rows());
        for rrow in 0..right.rows() {
            out.begin_put();
            for (c, col) in self.columns.iter().enumerate() {
                let t = match *col {
                    MergeCol::Left(l) => left.get(lrow, l),
                    MergeCol::Right(r) => right.get(rrow, r),
                    MergeCol::Both(l, r) => left.get(lrow, l).or_else(|| right.get(rrow, r)),
                    MergeCol::Unbound => None,
                };
                out.put_term(c, t.as_ref());
            }
            out.commit_put();
        }
    }

    /// Append the left row padded with unbound right-only columns.
    pub fn merge_unmatched<L: Batch, O: Batch>(&self, out: &mut O, left: &L, lrow: usize) {
        out.begin_put();
        for (c, col) in self.columns.iter().enumerate() {
            let t = match *col {
                MergeCol::Left(l) | MergeCol::Both(l, _) => left.get(lrow, l),
                MergeCol::Right(_) | MergeCol::Unbound => None,
            };
            out.put_term(c, t.as_ref());
        }
        out.commit_put();
    }
}

/// Order-insensitive row multiset equality of two batches of equal width.
pub fn equals_same_vars<B: Batch>(a: &B, b: &B) -> bool {
    if a.cols() != b.cols() || a.rows() != b.rows() {
        return false;
    }
    let mut pending: FxHashMap<u64, Vec<usize>> = FxHashMap::default();
    for r in 0..b.rows() {
        pending.entry(b.hash_row(r)).or_default().push(r);
    }
    for r in 0..a.rows() {
        let Some(candidates) = pending.get_mut(&a.hash_row(r)) else {
            return false;
        };
        match candidates.iter().position(|&o| a.equals_row(r, b, o)) {
            Some(pos) => {
                candidates.swap_remove(pos);
            }
            None => return false,
        }
    }
    true
}
