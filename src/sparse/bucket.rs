//! Bucket lists stored as a head array plus one `next` link per element.
//!
//! Building is a single pass with no per-insertion allocation. Elements are
//! linked in reverse, so walking a bucket yields its members in ascending
//! element order.

const NIL: usize = usize::MAX;

#[derive(Clone, Debug)]
pub(crate) struct BucketList {
    head: Vec<usize>,
    next: Vec<usize>,
    counts: Vec<usize>,
}

impl BucketList {
    /// Bucket element `k` into `keys[k]`. Every key must be below `nbuckets`.
    pub(crate) fn new(nbuckets: usize, keys: &[usize]) -> Self {
        let mut head = vec![NIL; nbuckets];
        let mut next = vec![NIL; keys.len()];
        let mut counts = vec![0; nbuckets];
        for (k, &b) in keys.iter().enumerate().rev() {
            next[k] = head[b];
            head[b] = k;
            counts[b] += 1;
        }
        Self { head, next, counts }
    }

    pub(crate) fn counts(&self) -> &[usize] {
        &self.counts
    }

    /// Members of bucket `b`, ascending.
    pub(crate) fn iter(&self, b: usize) -> BucketIter<'_> {
        BucketIter {
            next: &self.next,
            cur: self.head[b],
        }
    }
}

pub(crate) struct BucketIter<'a> {
    next: &'a [usize],
    cur: usize,
}

impl Iterator for BucketIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.cur == NIL {
            return None;
        }
        let k = self.cur;
        self.cur = self.next[k];
        Some(k)
    }
}
