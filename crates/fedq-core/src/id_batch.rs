//! Store-local id batch representation: rows of dictionary ids.
//!
//! Rows sharing a dictionary compare by id; across dictionaries they compare
//! and hash by resolved term. Conversions to/from other representations go
//! through `put_converting`.

use std::sync::Arc;

use crate::batch::Batch;
use crate::dict::{TermDict, UNBOUND_ID};
use crate::hash::RowHasher;
use crate::term::Term;

#[derive(Debug, Clone)]
pub struct IdBatch {
    dict: Arc<TermDict>,
    cols: usize,
    rows: usize,
    ids: Vec<u64>,
    staged: Vec<u64>,
    staging: bool,
}

impl IdBatch {
    pub fn new(dict: Arc<TermDict>, rows: usize, cols: usize) -> Self {
        Self {
            dict,
            cols,
            rows: 0,
            ids: Vec::with_capacity(rows * cols),
            staged: Vec::new(),
            staging: false,
        }
    }

    pub fn dict(&self) -> &Arc<TermDict> {
        &self.dict
    }

    pub fn id(&self, row: usize, col: usize) -> u64 {
        self.ids[row * self.cols + col]
    }

    fn row_ids(&self, row: usize) -> &[u64] {
        &self.ids[row * self.cols..(row + 1) * self.cols]
    }

    fn same_dict(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.dict, &other.dict)
    }

    /// Id of `term` in this batch's dictionary. `IdBatch` sources translate
    /// terms at the store boundary, so interning happens here.
    fn encode(&self, term: Option<&Term>) -> u64 {
        term.map_or(UNBOUND_ID, |t| self.dict.intern(t))
    }
}

impl PartialEq for IdBatch {
    fn eq(&self, other: &Self) -> bool {
        if self.cols != other.cols || self.rows != other.rows {
            return false;
        }
        if self.same_dict(other) {
            return self.ids == other.ids;
        }
        (0..self.rows).all(|r| (0..self.cols).all(|c| self.get(r, c) == other.get(r, c)))
    }
}

impl Batch for IdBatch {
    fn rows(&self) -> usize {
        self.rows
    }

    fn cols(&self) -> usize {
        self.cols
    }

    fn get(&self, row: usize, col: usize) -> Option<Term> {
        self.dict.resolve(self.id(row, col))
    }

    fn clear(&mut self, cols: usize) {
        self.cols = cols;
        self.rows = 0;
        self.ids.clear();
        self.staging = false;
    }

    fn reserve(&mut self, additional_rows: usize) {
        self.ids.reserve(additional_rows * self.cols);
    }

    fn begin_put(&mut self) {
        self.staged.clear();
        self.staged.resize(self.cols, UNBOUND_ID);
        self.staging = true;
    }

    fn put_term(&mut self, col: usize, term: Option<&Term>) {
        debug_assert!(self.staging, "put_term without begin_put");
        self.staged[col] = self.encode(term);
    }

    fn commit_put(&mut self) {
        if self.staging {
            self.ids.append(&mut self.staged);
            self.rows += 1;
            self.staging = false;
        }
    }

    fn abort_put(&mut self) {
        self.staging = false;
    }

    fn put_row(&mut self, src: &Self, row: usize) {
        debug_assert_eq!(src.cols, self.cols);
        if self.same_dict(src) {
            self.ids.extend_from_slice(src.row_ids(row));
            self.rows += 1;
        } else {
            self.put_row_converting(src, row);
        }
    }

    fn append(&mut self, mut other: Self) {
        debug_assert_eq!(other.cols, self.cols);
        if !self.same_dict(&other) {
            self.put_converting(&other);
            return;
        }
        if self.rows == 0 {
            std::mem::swap(&mut self.ids, &mut other.ids);
            self.rows = other.rows;
        } else {
            self.ids.append(&mut other.ids);
            self.rows += other.rows;
        }
    }

    fn split_off(&mut self, at: usize) -> Self {
        let at = at.min(self.rows);
        let tail = self.ids.split_off(at * self.cols);
        let tail_rows = self.rows - at;
        self.rows = at;
        Self {
            dict: Arc::clone(&self.dict),
            cols: self.cols,
            rows: tail_rows,
            ids: tail,
            staged: Vec::new(),
            staging: false,
        }
    }

    fn truncate(&mut self, rows: usize) {
        if rows < self.rows {
            self.ids.truncate(rows * self.cols);
            self.rows = rows;
        }
    }

    fn retain_mask(&mut self, keep: &[bool]) {
        let cols = self.cols;
        let mut out = 0;
        for r in 0..self.rows {
            if !keep.get(r).copied().unwrap_or(false) {
                continue;
            }
            if out != r {
                self.ids.copy_within(r * cols..(r + 1) * cols, out * cols);
            }
            out += 1;
        }
        self.truncate(out);
    }

    fn project(&mut self, columns: &[Option<usize>]) {
        let in_cols = self.cols;
        let mut projected = Vec::with_capacity(self.rows * columns.len());
        for r in 0..self.rows {
            let row = &self.ids[r * in_cols..(r + 1) * in_cols];
            projected.extend(columns.iter().map(|c| c.map_or(UNBOUND_ID, |c| row[c])));
        }
        self.ids = projected;
        self.cols = columns.len();
    }

    fn project_row_into(&self, row: usize, dst: &mut Self, columns: &[Option<usize>]) {
        if !self.same_dict(dst) {
            dst.begin_put();
            for (out, src) in columns.iter().enumerate() {
                let t = src.and_then(|c| self.get(row, c));
                dst.put_term(out, t.as_ref());
            }
            dst.commit_put();
            return;
        }
        let src = self.row_ids(row);
        dst.ids
            .extend(columns.iter().map(|c| c.map_or(UNBOUND_ID, |c| src[c])));
        dst.rows += 1;
    }

    /// Hashes the resolved terms, so rows from different dictionaries that
    /// `equals_row` accepts land on the same hash.
    fn hash_row(&self, row: usize) -> u64 {
        let mut h = RowHasher::new();
        for c in 0..self.cols {
            h.term(self.get(row, c).as_ref());
        }
        h.finish()
    }

    fn equals_row(&self, row: usize, other: &Self, other_row: usize) -> bool {
        if self.cols != other.cols {
            return false;
        }
        if self.same_dict(other) {
            return self.row_ids(row) == other.row_ids(other_row);
        }
        (0..self.cols).all(|c| self.get(row, c) == other.get(other_row, c))
    }

    fn approx_bytes(&self) -> usize {
        self.ids.capacity() * std::mem::size_of::<u64>()
    }
}
