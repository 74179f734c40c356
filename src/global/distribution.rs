//! Ownership of index ranges by processes.
//!
//! Two layers live here:
//!
//! * the closed-form calculator ([`block_range`], [`Binning`]) that every
//!   process evaluates independently, with no communication, and
//! * [`Distribution`], the per-axis block boundary map (`mapc`) of a
//!   distributed array, either computed from a process grid or supplied
//!   explicitly as an irregular map.
//!
//! Ranges are half-open. An empty range (`lo == hi`) is valid and means the
//! process owns nothing along that axis.

use std::ops::Range;

use itertools::Itertools;

use crate::config::Binning;
use crate::debug_invariants::DebugInvariants;
use crate::ga_error::GaError;

/// Maximum number of array axes.
pub const MAX_DIM: usize = 7;

/// Balanced block of `rank` when `[0, dim)` is split over `nproc` processes:
/// `dim*rank/nproc .. dim*(rank+1)/nproc`, the last rank absorbing the
/// remainder.
pub fn block_range(dim: usize, nproc: usize, rank: usize) -> Range<usize> {
    let nproc = nproc.max(1);
    let scaled = |r: usize| ((dim as u128 * r as u128) / nproc as u128) as usize;
    let lo = scaled(rank).min(dim);
    let hi = if rank + 1 >= nproc {
        dim
    } else {
        scaled(rank + 1)
    };
    lo..hi.max(lo)
}

impl Binning {
    /// Process owning global index `index` of an axis of length `dim`.
    pub fn owner(self, index: usize, dim: usize, nproc: usize) -> usize {
        let nproc = nproc.max(1);
        match self {
            Binning::Balanced => {
                if dim == 0 {
                    return 0;
                }
                let p = ((index as u128 + 1) * nproc as u128 - 1) / dim as u128;
                (p as usize).min(nproc - 1)
            }
            Binning::Strided => (index / nproc).min(nproc - 1),
        }
    }

    /// Range of indices owned by `rank`. Consistent with [`Binning::owner`].
    pub fn range(self, dim: usize, nproc: usize, rank: usize) -> Range<usize> {
        let nproc = nproc.max(1);
        match self {
            Binning::Balanced => block_range(dim, nproc, rank),
            Binning::Strided => {
                let lo = rank.saturating_mul(nproc).min(dim);
                let hi = if rank + 1 >= nproc {
                    dim
                } else {
                    (rank + 1).saturating_mul(nproc).min(dim)
                };
                lo..hi.max(lo)
            }
        }
    }
}

/// Number of blocks per axis when `nproc` processes tile an array of
/// extents `dims`. Prime factors of `nproc` go, largest first, to the axis
/// with the most elements per block that can still be split.
pub fn process_grid(dims: &[usize], nproc: usize) -> Vec<usize> {
    process_grid_chunked(dims, &[], nproc)
}

/// [`process_grid`] where no block along axis `a` may be shorter than
/// `chunk[a]`. Missing or zero entries impose no minimum.
pub fn process_grid_chunked(dims: &[usize], chunk: &[usize], nproc: usize) -> Vec<usize> {
    let mut grid = vec![1usize; dims.len()];
    if dims.is_empty() {
        return grid;
    }
    let max_blocks: Vec<usize> = dims
        .iter()
        .enumerate()
        .map(|(a, &d)| d / chunk.get(a).copied().unwrap_or(1).max(1))
        .collect();
    for f in prime_factors(nproc.max(1)).into_iter().rev() {
        let best = (0..dims.len())
            .filter(|&a| grid[a] * f <= max_blocks[a])
            .max_by(|&a, &b| {
                let ra = dims[a] as u128 * grid[b] as u128;
                let rb = dims[b] as u128 * grid[a] as u128;
                ra.cmp(&rb).then(b.cmp(&a))
            });
        if let Some(a) = best {
            grid[a] *= f;
        }
    }
    grid
}

fn prime_factors(mut n: usize) -> Vec<usize> {
    let mut out = Vec::new();
    let mut p = 2;
    while p * p <= n {
        while n % p == 0 {
            out.push(p);
            n /= p;
        }
        p += 1;
    }
    if n > 1 {
        out.push(n);
    }
    out
}

/// Rectangular index patch, half-open along every axis.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Patch {
    pub lo: Vec<usize>,
    pub hi: Vec<usize>,
}

impl Patch {
    pub fn new(lo: Vec<usize>, hi: Vec<usize>) -> Self {
        Self { lo, hi }
    }

    /// One-dimensional patch.
    pub fn span(r: Range<usize>) -> Self {
        Self::new(vec![r.start], vec![r.end])
    }

    pub fn ndim(&self) -> usize {
        self.lo.len()
    }

    pub fn extents(&self) -> Vec<usize> {
        self.lo
            .iter()
            .zip(&self.hi)
            .map(|(&l, &h)| h.saturating_sub(l))
            .collect()
    }

    /// Number of elements.
    pub fn volume(&self) -> usize {
        self.extents().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.volume() == 0
    }

    pub fn contains(&self, subscript: &[usize]) -> bool {
        subscript.len() == self.ndim()
            && subscript
                .iter()
                .zip(self.lo.iter().zip(&self.hi))
                .all(|(&s, (&l, &h))| l <= s && s < h)
    }

    /// Overlap of two patches of equal rank, `None` if empty.
    pub fn intersect(&self, other: &Patch) -> Option<Patch> {
        let lo: Vec<usize> = self.lo.iter().zip(&other.lo).map(|(a, b)| *a.max(b)).collect();
        let hi: Vec<usize> = self.hi.iter().zip(&other.hi).map(|(a, b)| *a.min(b)).collect();
        let p = Patch::new(lo, hi);
        (!p.is_empty()).then_some(p)
    }

    /// Column-major (first axis fastest) offset of `subscript` inside the patch.
    pub fn offset_of(&self, subscript: &[usize]) -> usize {
        let mut offset = 0;
        let mut stride = 1;
        for ((&s, &l), e) in subscript.iter().zip(&self.lo).zip(self.extents()) {
            offset += (s - l) * stride;
            stride *= e;
        }
        offset
    }

    /// Visit every contiguous run along the first axis, passing the
    /// subscript of the run's first element.
    pub fn for_each_run(&self, mut f: impl FnMut(&[usize])) {
        if self.is_empty() {
            return;
        }
        let mut cursor = self.lo.clone();
        loop {
            f(&cursor);
            let mut axis = 1;
            loop {
                if axis >= cursor.len() {
                    return;
                }
                cursor[axis] += 1;
                if cursor[axis] < self.hi[axis] {
                    break;
                }
                cursor[axis] = self.lo[axis];
                axis += 1;
            }
        }
    }
}

/// Block boundary map of a distributed array.
///
/// `bounds[a]` holds `nblocks[a] + 1` non-decreasing offsets starting at 0 and
/// ending at `dims[a]`. Block coordinates map to processes column-major, so
/// processes `>= nblocks()` own no data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Distribution {
    dims: Vec<usize>,
    bounds: Vec<Vec<usize>>,
}

impl Distribution {
    /// Default distribution over `nproc` processes.
    pub fn regular(dims: &[usize], nproc: usize) -> Self {
        Self::chunked(dims, &[], nproc)
    }

    /// Regular distribution whose blocks are at least `chunk[a]` long on
    /// every axis `a` (as long as the axis itself is).
    pub fn chunked(dims: &[usize], chunk: &[usize], nproc: usize) -> Self {
        let grid = process_grid_chunked(dims, chunk, nproc);
        let bounds = dims
            .iter()
            .zip(&grid)
            .map(|(&d, &nb)| {
                (0..nb)
                    .map(|b| block_range(d, nb, b).start)
                    .chain(std::iter::once(d))
                    .collect()
            })
            .collect();
        Self {
            dims: dims.to_vec(),
            bounds,
        }
    }

    /// Explicit distribution. `map` concatenates the block start offsets of
    /// every axis (`nblocks[a]` entries each, first entry 0). Empty blocks are
    /// allowed; a block may not start past the end of its axis.
    pub fn irregular(
        dims: &[usize],
        map: &[usize],
        nblocks: &[usize],
        nproc: usize,
    ) -> Result<Self, GaError> {
        const OP: &str = "set_irregular_distribution";
        let bad = |reason: String| GaError::InvalidDistribution { op: OP, reason };
        if nblocks.len() != dims.len() {
            return Err(bad(format!(
                "{} block counts for {} axes",
                nblocks.len(),
                dims.len()
            )));
        }
        let total: usize = nblocks.iter().sum();
        if map.len() != total {
            return Err(bad(format!("map has {} entries, expected {total}", map.len())));
        }
        if nblocks.iter().product::<usize>() > nproc.max(1) {
            return Err(bad(format!("more blocks than the {nproc} processes")));
        }
        let mut bounds = Vec::with_capacity(dims.len());
        let mut rest = map;
        for (axis, (&d, &nb)) in dims.iter().zip(nblocks).enumerate() {
            if nb == 0 {
                return Err(bad(format!("axis {axis} has no blocks")));
            }
            let (starts, tail) = rest.split_at(nb);
            rest = tail;
            if starts[0] != 0 {
                return Err(bad(format!("axis {axis} does not start at 0")));
            }
            if !starts.iter().tuple_windows().all(|(a, b)| a <= b) {
                return Err(bad(format!("axis {axis} boundaries decrease")));
            }
            if starts.iter().any(|&s| s > d) {
                return Err(bad(format!("axis {axis} boundary beyond extent {d}")));
            }
            bounds.push(starts.iter().copied().chain(std::iter::once(d)).collect());
        }
        Ok(Self {
            dims: dims.to_vec(),
            bounds,
        })
    }

    /// One-dimensional distribution with `counts[p]` elements on process `p`.
    pub fn from_counts(counts: &[usize]) -> Self {
        let mut bounds = Vec::with_capacity(counts.len() + 1);
        let mut acc = 0;
        bounds.push(0);
        for &c in counts {
            acc += c;
            bounds.push(acc);
        }
        Self {
            dims: vec![acc],
            bounds: vec![bounds],
        }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Boundary offsets of `axis` (`nblocks + 1` entries).
    pub fn bounds(&self, axis: usize) -> &[usize] {
        &self.bounds[axis]
    }

    pub fn nblocks_per_axis(&self) -> Vec<usize> {
        self.bounds.iter().map(|b| b.len() - 1).collect()
    }

    /// Number of processes that own a block.
    pub fn nblocks(&self) -> usize {
        self.nblocks_per_axis().iter().product()
    }

    fn block_coords(&self, proc: usize) -> Option<Vec<usize>> {
        if proc >= self.nblocks() {
            return None;
        }
        let mut rest = proc;
        Some(
            self.nblocks_per_axis()
                .iter()
                .map(|&nb| {
                    let c = rest % nb;
                    rest /= nb;
                    c
                })
                .collect(),
        )
    }

    fn proc_of(&self, coords: &[usize]) -> usize {
        let mut proc = 0;
        let mut stride = 1;
        for (&c, nb) in coords.iter().zip(self.nblocks_per_axis()) {
            proc += c * stride;
            stride *= nb;
        }
        proc
    }

    /// Patch owned by `proc`; `None` if it owns no block.
    pub fn patch(&self, proc: usize) -> Option<Patch> {
        let coords = self.block_coords(proc)?;
        let (lo, hi) = coords
            .iter()
            .zip(&self.bounds)
            .map(|(&c, b)| (b[c], b[c + 1]))
            .unzip();
        Some(Patch::new(lo, hi))
    }

    /// Number of elements stored on `proc`.
    pub fn local_len(&self, proc: usize) -> usize {
        self.patch(proc).map_or(0, |p| p.volume())
    }

    /// Process owning `subscript` (assumed inside the array).
    pub fn owner(&self, subscript: &[usize]) -> usize {
        let coords: Vec<usize> = subscript
            .iter()
            .zip(&self.bounds)
            .map(|(&s, b)| b.partition_point(|&x| x <= s).saturating_sub(1).min(b.len() - 2))
            .collect();
        self.proc_of(&coords)
    }

    /// Processes whose blocks intersect `patch`, with the intersection.
    pub fn owners_of(&self, patch: &Patch) -> Vec<(usize, Patch)> {
        (0..self.nblocks())
            .filter_map(|proc| {
                let block = self.patch(proc)?;
                block.intersect(patch).map(|overlap| (proc, overlap))
            })
            .collect()
    }
}

impl DebugInvariants for Distribution {
    fn validate_invariants(&self) -> Result<(), GaError> {
        for (axis, (b, &d)) in self.bounds.iter().zip(&self.dims).enumerate() {
            let ok = b.first() == Some(&0)
                && b.last() == Some(&d)
                && b.iter().tuple_windows().all(|(x, y)| x <= y);
            if !ok {
                return Err(GaError::InvalidDistribution {
                    op: "validate",
                    reason: format!("axis {axis} bounds {b:?} do not partition [0, {d})"),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_range_matches_closed_form() {
        assert_eq!(block_range(8, 4, 0), 0..2);
        assert_eq!(block_range(8, 4, 3), 6..8);
        assert_eq!(block_range(10, 3, 0), 0..3);
        assert_eq!(block_range(10, 3, 1), 3..6);
        assert_eq!(block_range(10, 3, 2), 6..10);
    }

    #[test]
    fn small_dim_yields_empty_ranges() {
        let ranges: Vec<_> = (0..4).map(|p| block_range(2, 4, p)).collect();
        assert_eq!(ranges, vec![0..0, 0..1, 1..1, 1..2]);
        assert!(ranges.iter().all(|r| r.start <= r.end));
    }

    #[test]
    fn balanced_owner_inverts_range() {
        for (dim, nproc) in [(8, 4), (10, 3), (3, 4), (1, 5), (97, 7)] {
            for i in 0..dim {
                let p = Binning::Balanced.owner(i, dim, nproc);
                assert!(
                    Binning::Balanced.range(dim, nproc, p).contains(&i),
                    "dim={dim} nproc={nproc} i={i} p={p}"
                );
            }
        }
    }

    #[test]
    fn strided_rule_clamps_to_last_rank() {
        assert_eq!(Binning::Strided.owner(7, 8, 4), 1);
        assert_eq!(Binning::Strided.owner(100, 120, 4), 3);
        assert_eq!(Binning::Strided.range(8, 4, 1), 4..8);
        assert_eq!(Binning::Strided.range(8, 4, 2), 8..8);
        assert_eq!(Binning::Strided.range(120, 4, 3), 12..120);
    }

    #[test]
    fn process_grid_uses_all_ranks_when_possible() {
        assert_eq!(process_grid(&[100], 4), vec![4]);
        assert_eq!(process_grid(&[10, 10], 4), vec![2, 2]);
        assert_eq!(process_grid(&[100, 2], 6), vec![6, 1]);
        assert_eq!(process_grid(&[2], 4), vec![2]);
    }

    #[test]
    fn chunk_bounds_the_block_count() {
        assert_eq!(process_grid_chunked(&[100], &[30], 4), vec![2]);
        assert_eq!(process_grid_chunked(&[10, 10], &[10, 0], 4), vec![1, 4]);
        assert_eq!(process_grid_chunked(&[5], &[9], 4), vec![1]);
        let d = Distribution::chunked(&[100], &[30], 4);
        assert_eq!(d.nblocks(), 2);
        assert_eq!(d.local_len(0), 50);
        assert_eq!(d.local_len(3), 0);
    }

    #[test]
    fn irregular_map_validation() {
        let d = Distribution::irregular(&[10], &[0, 3, 3], &[3], 3).unwrap();
        assert_eq!(d.patch(1), Some(Patch::span(3..3)));
        assert_eq!(d.owner(&[3]), 2);
        assert!(Distribution::irregular(&[10], &[1, 3], &[2], 2).is_err());
        assert!(Distribution::irregular(&[10], &[0, 5, 4], &[3], 3).is_err());
        assert!(Distribution::irregular(&[10], &[0, 5], &[2], 1).is_err());
        assert!(Distribution::irregular(&[10], &[0, 11], &[2], 2).is_err());
    }

    #[test]
    fn two_dimensional_patches_and_owners() {
        let d = Distribution::irregular(&[4, 6], &[0, 2, 0, 3], &[2, 2], 4).unwrap();
        assert_eq!(d.patch(0), Some(Patch::new(vec![0, 0], vec![2, 3])));
        assert_eq!(d.patch(1), Some(Patch::new(vec![2, 0], vec![4, 3])));
        assert_eq!(d.patch(2), Some(Patch::new(vec![0, 3], vec![2, 6])));
        assert_eq!(d.owner(&[3, 5]), 3);
        assert_eq!(d.local_len(3), 6);
        d.validate_invariants().unwrap();

        let p = Patch::new(vec![1, 2], vec![3, 4]);
        let owners: Vec<usize> = d.owners_of(&p).into_iter().map(|(o, _)| o).collect();
        assert_eq!(owners, vec![0, 1, 2, 3]);
    }

    #[test]
    fn runs_walk_column_major() {
        let p = Patch::new(vec![1, 0, 2], vec![3, 2, 4]);
        let mut starts = Vec::new();
        p.for_each_run(|s| starts.push(s.to_vec()));
        assert_eq!(
            starts,
            vec![vec![1, 0, 2], vec![1, 1, 2], vec![1, 0, 3], vec![1, 1, 3]]
        );
        assert_eq!(p.offset_of(&[2, 1, 3]), 1 + 2 + 4);
    }

    #[test]
    fn from_counts_prefix_sums() {
        let d = Distribution::from_counts(&[2, 0, 3]);
        assert_eq!(d.dims(), &[5]);
        assert_eq!(d.bounds(0), &[0, 2, 2, 5]);
        assert_eq!(d.patch(2), Some(Patch::span(2..5)));
    }
}
