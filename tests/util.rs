#![allow(dead_code)]
use ga_sparse::prelude::*;

/// `(row, column, value)` as seen through the column-block accessor.
pub type Triple = (usize, usize, f64);

/// Dense and sparse registries for one rank.
pub fn registries(comm: ThreadComm, config: GaConfig) -> (GlobalArrays<ThreadComm>, SparseArrays) {
    let ga = GlobalArrays::new(comm, config);
    let sp = SparseArrays::new(&ga);
    (ga, sp)
}

/// Every element of the calling rank's row block, gathered from all of its
/// column blocks.
pub fn local_triples(
    sp: &SparseArrays,
    h: SparseHandle,
    ga: &GlobalArrays<ThreadComm>,
) -> Vec<Triple> {
    let mut out = Vec::new();
    for icol in 0..ga.nproc() {
        if let Some(block) = sp.access_column_block::<f64, _>(h, icol, ga).unwrap() {
            out.extend(block.iter().map(|(r, c, v)| (r, c, *v)));
        }
    }
    out
}

/// Sort triples into a canonical order for comparison.
pub fn sorted(mut v: Vec<Triple>) -> Vec<Triple> {
    v.sort_by_key(|&(r, c, x)| (r, c, x.to_bits()));
    v
}

/// Assert vec is a permutation of another vec (order-agnostic).
pub fn assert_permutation<T: Ord + Copy + std::fmt::Debug>(got: &[T], want: &[T]) {
    let mut a = got.to_vec();
    a.sort_unstable();
    let mut b = want.to_vec();
    b.sort_unstable();
    assert_eq!(a, b, "not a permutation\n got={:?}\nwant={:?}", got, want);
}
