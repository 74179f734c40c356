//! Read-only views of assembled column blocks.

use std::marker::PhantomData;
use std::ops::{Deref, Range};

use crate::debug_invariants::DebugInvariants;
use crate::ga_error::GaError;
use crate::global::element::Element;

/// One column block of the calling process's row block, viewed in place.
///
/// The view holds shared guards on the local storage; no data is copied.
/// Destroying the sparse array requires dropping every view first.
pub struct ColumnBlock<T, S> {
    pub(crate) g_data: S,
    pub(crate) g_i: S,
    pub(crate) g_j: S,
    pub(crate) blkidx: usize,
    pub(crate) rows: Range<usize>,
    pub(crate) cols: Range<usize>,
    pub(crate) ptr_offset: usize,
    pub(crate) offset: usize,
    pub(crate) len: usize,
    pub(crate) _marker: PhantomData<T>,
}

impl<T: Element, S: Deref<Target = [u8]>> ColumnBlock<T, S> {
    /// Global column-block id.
    pub fn block_index(&self) -> usize {
        self.blkidx
    }

    /// Global rows covered by the block.
    pub fn row_range(&self) -> Range<usize> {
        self.rows.clone()
    }

    /// Global columns the block may contain.
    pub fn column_range(&self) -> Range<usize> {
        self.cols.clone()
    }

    /// Number of stored elements.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// CSR row pointers, `nrows + 1` entries relative to the block start.
    /// Entries of local row `r` sit at `row_pointers()[r]..row_pointers()[r + 1]`.
    pub fn row_pointers(&self) -> &[i64] {
        let all: &[i64] = bytemuck::cast_slice(&*self.g_i);
        &all[self.ptr_offset..self.ptr_offset + self.rows.len() + 1]
    }

    /// Global column index of every element.
    pub fn columns(&self) -> &[i64] {
        let all: &[i64] = bytemuck::cast_slice(&*self.g_j);
        &all[self.offset..self.offset + self.len]
    }

    pub fn values(&self) -> &[T] {
        let all: &[T] = bytemuck::cast_slice(&*self.g_data);
        &all[self.offset..self.offset + self.len]
    }

    /// Columns and values of global row `row`; `None` outside the row block.
    pub fn row(&self, row: usize) -> Option<(&[i64], &[T])> {
        if !self.rows.contains(&row) {
            return None;
        }
        let r = row - self.rows.start;
        let ptr = self.row_pointers();
        let span = ptr[r] as usize..ptr[r + 1] as usize;
        Some((&self.columns()[span.clone()], &self.values()[span]))
    }

    /// `(global row, global column, value)` of every element, row by row.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, &T)> + '_ {
        let ptr = self.row_pointers();
        let cols = self.columns();
        let vals = self.values();
        self.rows.clone().enumerate().flat_map(move |(r, row)| {
            (ptr[r] as usize..ptr[r + 1] as usize).map(move |k| (row, cols[k] as usize, &vals[k]))
        })
    }
}

impl<T: Element, S: Deref<Target = [u8]>> DebugInvariants for ColumnBlock<T, S> {
    fn validate_invariants(&self) -> Result<(), GaError> {
        let bad = |reason: String| GaError::InvalidDistribution {
            op: "access_column_block",
            reason,
        };
        let ptr = self.row_pointers();
        if ptr.first() != Some(&0) {
            return Err(bad(format!("block {} row pointers do not start at 0", self.blkidx)));
        }
        if ptr.windows(2).any(|w| w[0] > w[1]) {
            return Err(bad(format!("block {} row pointers decrease", self.blkidx)));
        }
        if ptr.last().copied() != Some(self.len as i64) {
            return Err(bad(format!(
                "block {} row pointers end at {:?}, expected {}",
                self.blkidx,
                ptr.last(),
                self.len
            )));
        }
        if let Some(&c) = self
            .columns()
            .iter()
            .find(|&&c| c < 0 || !self.cols.contains(&(c as usize)))
        {
            return Err(bad(format!(
                "block {} holds column {c} outside {:?}",
                self.blkidx, self.cols
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes<T: bytemuck::Pod>(v: &[T]) -> Vec<u8> {
        bytemuck::cast_slice::<T, u8>(v).to_vec()
    }

    // views need 8-byte aligned storage
    struct Aligned(Vec<u64>, usize);

    impl Deref for Aligned {
        type Target = [u8];
        fn deref(&self) -> &[u8] {
            &bytemuck::cast_slice::<u64, u8>(&self.0)[..self.1]
        }
    }

    fn aligned(b: Vec<u8>) -> Aligned {
        let mut words = vec![0u64; b.len().div_ceil(8)];
        bytemuck::cast_slice_mut::<u64, u8>(&mut words)[..b.len()].copy_from_slice(&b);
        Aligned(words, b.len())
    }

    fn block() -> ColumnBlock<f64, Aligned> {
        // rows 4..6, one block at directory position 1 (stride 3)
        ColumnBlock {
            g_data: aligned(bytes(&[9.0f64, 1.0, 2.0, 3.0])),
            g_i: aligned(bytes(&[0i64, 1, 1, 0, 2, 3])),
            g_j: aligned(bytes(&[0i64, 4, 6, 5])),
            blkidx: 2,
            rows: 4..6,
            cols: 4..8,
            ptr_offset: 3,
            offset: 1,
            len: 3,
            _marker: PhantomData,
        }
    }

    #[test]
    fn rows_and_iteration() {
        let b = block();
        assert_eq!(b.row_pointers(), &[0, 2, 3]);
        assert_eq!(b.row(4), Some((&[4i64, 6][..], &[1.0, 2.0][..])));
        assert_eq!(b.row(5), Some((&[5i64][..], &[3.0][..])));
        assert_eq!(b.row(3), None);
        let all: Vec<_> = b.iter().map(|(r, c, v)| (r, c, *v)).collect();
        assert_eq!(all, vec![(4, 4, 1.0), (4, 6, 2.0), (5, 5, 3.0)]);
        b.validate_invariants().unwrap();
    }

    #[test]
    fn invariants_flag_foreign_columns() {
        let mut b = block();
        b.cols = 4..6;
        assert!(b.validate_invariants().is_err());
    }
}
