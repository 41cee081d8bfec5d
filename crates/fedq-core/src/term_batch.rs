//! Plain-term batch representation: flat row-major `Option<Term>` cells.

use crate::batch::Batch;
use crate::hash::RowHasher;
use crate::term::Term;

#[derive(Debug, Clone, Default)]
pub struct TermBatch {
    cols: usize,
    rows: usize,
    terms: Vec<Option<Term>>,
    /// Staged row; valid while `staging` is set.
    staged: Vec<Option<Term>>,
    staging: bool,
}

impl TermBatch {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            cols,
            rows: 0,
            terms: Vec::with_capacity(rows * cols),
            staged: Vec::new(),
            staging: false,
        }
    }

    /// Build from rows of equal width. Used by sources and tests.
    pub fn of_rows<I, R>(cols: usize, rows: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: IntoIterator<Item = Option<Term>>,
    {
        let mut b = Self::new(0, cols);
        for row in rows {
            let start = b.terms.len();
            b.terms.extend(row);
            assert_eq!(b.terms.len() - start, cols, "row width must equal cols");
            b.rows += 1;
        }
        b
    }

    pub fn row(&self, row: usize) -> &[Option<Term>] {
        &self.terms[row * self.cols..(row + 1) * self.cols]
    }

    pub fn term(&self, row: usize, col: usize) -> Option<&Term> {
        self.terms[row * self.cols + col].as_ref()
    }

    /// Rows as owned vectors, in order.
    pub fn to_rows(&self) -> Vec<Vec<Option<Term>>> {
        (0..self.rows).map(|r| self.row(r).to_vec()).collect()
    }
}

impl PartialEq for TermBatch {
    fn eq(&self, other: &Self) -> bool {
        self.cols == other.cols && self.rows == other.rows && self.terms == other.terms
    }
}

impl Eq for TermBatch {}

impl Batch for TermBatch {
    fn rows(&self) -> usize {
        self.rows
    }

    fn cols(&self) -> usize {
        self.cols
    }

    fn get(&self, row: usize, col: usize) -> Option<Term> {
        self.term(row, col).cloned()
    }

    fn clear(&mut self, cols: usize) {
        self.cols = cols;
        self.rows = 0;
        self.terms.clear();
        self.staging = false;
    }

    fn reserve(&mut self, additional_rows: usize) {
        self.terms.reserve(additional_rows * self.cols);
    }

    fn begin_put(&mut self) {
        self.staged.clear();
        self.staged.resize(self.cols, None);
        self.staging = true;
    }

    fn put_term(&mut self, col: usize, term: Option<&Term>) {
        debug_assert!(self.staging, "put_term without begin_put");
        self.staged[col] = term.cloned();
    }

    fn commit_put(&mut self) {
        if self.staging {
            self.terms.append(&mut self.staged);
            self.rows += 1;
            self.staging = false;
        }
    }

    fn abort_put(&mut self) {
        self.staging = false;
    }

    fn put_row(&mut self, src: &Self, row: usize) {
        debug_assert_eq!(src.cols, self.cols);
        self.terms.extend_from_slice(src.row(row));
        self.rows += 1;
    }

    fn put(&mut self, src: &Self) {
        debug_assert_eq!(src.cols, self.cols);
        self.terms.extend_from_slice(&src.terms);
        self.rows += src.rows;
    }

    fn append(&mut self, mut other: Self) {
        debug_assert_eq!(other.cols, self.cols);
        if self.rows == 0 {
            std::mem::swap(&mut self.terms, &mut other.terms);
            self.rows = other.rows;
        } else {
            self.terms.append(&mut other.terms);
            self.rows += other.rows;
        }
    }

    fn split_off(&mut self, at: usize) -> Self {
        let at = at.min(self.rows);
        let tail = self.terms.split_off(at * self.cols);
        let tail_rows = self.rows - at;
        self.rows = at;
        Self {
            cols: self.cols,
            rows: tail_rows,
            terms: tail,
            staged: Vec::new(),
            staging: false,
        }
    }

    fn truncate(&mut self, rows: usize) {
        if rows < self.rows {
            self.terms.truncate(rows * self.cols);
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
                for c in 0..cols {
                    let t = self.terms[r * cols + c].take();
                    self.terms[out * cols + c] = t;
                }
            }
            out += 1;
        }
        self.truncate(out);
    }

    fn project(&mut self, columns: &[Option<usize>]) {
        let in_cols = self.cols;
        let out_cols = columns.len();
        let mut projected = Vec::with_capacity(self.rows * out_cols);
        for r in 0..self.rows {
            let row = &self.terms[r * in_cols..(r + 1) * in_cols];
            projected.extend(columns.iter().map(|c| c.and_then(|c| row[c].clone())));
        }
        self.terms = projected;
        self.cols = out_cols;
    }

    fn project_row_into(&self, row: usize, dst: &mut Self, columns: &[Option<usize>]) {
        debug_assert_eq!(dst.cols, columns.len());
        let src = self.row(row);
        dst.terms
            .extend(columns.iter().map(|c| c.and_then(|c| src[c].clone())));
        dst.rows += 1;
    }

    fn hash_row(&self, row: usize) -> u64 {
        let mut h = RowHasher::new();
        for t in self.row(row) {
            h.term(t.as_ref());
        }
        h.finish()
    }

    fn equals_row(&self, row: usize, other: &Self, other_row: usize) -> bool {
        self.cols == other.cols && self.row(row) == other.row(other_row)
    }

    fn approx_bytes(&self) -> usize {
        // cells plus an average inline payload per term
        self.terms.capacity() * (std::mem::size_of::<Option<Term>>() + 16)
    }
}
