//! Per-process accumulation of `(i, j, value)` triples ahead of assembly.

use crate::global::element::{Element, ElementType};

/// Three parallel buffers of row indices, column indices and raw values.
///
/// Capacity follows an exact doubling law: when `len() == capacity()` the
/// next push doubles the capacity of all three buffers at once.
#[derive(Clone, Debug)]
pub struct TripleBuffer {
    idx: Vec<usize>,
    jdx: Vec<usize>,
    val: Vec<u8>,
    elem_size: usize,
    maxval: usize,
}

impl TripleBuffer {
    pub fn new(ty: ElementType, capacity: usize) -> Self {
        let maxval = capacity.max(1);
        let elem_size = ty.size();
        Self {
            idx: Vec::with_capacity(maxval),
            jdx: Vec::with_capacity(maxval),
            val: Vec::with_capacity(maxval * elem_size),
            elem_size,
            maxval,
        }
    }

    /// Number of stored triples.
    pub fn len(&self) -> usize {
        self.idx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.idx.is_empty()
    }

    /// Triples that fit before the next doubling.
    pub fn capacity(&self) -> usize {
        self.maxval
    }

    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    pub fn push<T: Element>(&mut self, i: usize, j: usize, value: T) {
        self.push_bytes(i, j, bytemuck::bytes_of(&value));
    }

    /// Append one triple whose value is given as `elem_size` raw bytes.
    pub(crate) fn push_bytes(&mut self, i: usize, j: usize, value: &[u8]) {
        debug_assert_eq!(value.len(), self.elem_size);
        if self.len() == self.maxval {
            self.grow();
        }
        self.idx.push(i);
        self.jdx.push(j);
        self.val.extend_from_slice(value);
    }

    fn grow(&mut self) {
        self.maxval *= 2;
        let n = self.len();
        self.idx.reserve_exact(self.maxval - n);
        self.jdx.reserve_exact(self.maxval - n);
        self.val.reserve_exact((self.maxval - n) * self.elem_size);
    }

    pub fn rows(&self) -> &[usize] {
        &self.idx
    }

    pub fn columns(&self) -> &[usize] {
        &self.jdx
    }

    /// Raw bytes of the `k`-th value.
    pub fn value_bytes(&self, k: usize) -> &[u8] {
        &self.val[k * self.elem_size..(k + 1) * self.elem_size]
    }

    /// Typed view of the `k`-th value.
    pub fn value<T: Element>(&self, k: usize) -> T {
        bytemuck::pod_read_unaligned(self.value_bytes(k))
    }
}
