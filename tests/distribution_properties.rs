use ga_sparse::config::Binning;
use ga_sparse::global::distribution::{Distribution, block_range};
use ga_sparse::DebugInvariants;
use proptest::prelude::*;

proptest! {
    #[test]
    fn block_ranges_partition_the_axis(dim in 1usize..500, nproc in 1usize..40) {
        let mut next = 0;
        for p in 0..nproc {
            let r = block_range(dim, nproc, p);
            prop_assert_eq!(r.start, next);
            prop_assert!(r.start <= r.end);
            next = r.end;
        }
        prop_assert_eq!(next, dim);
    }

    #[test]
    fn owner_agrees_with_range(dim in 1usize..300, nproc in 1usize..20, strided in any::<bool>()) {
        let rule = if strided { Binning::Strided } else { Binning::Balanced };
        let mut covered = 0;
        for p in 0..nproc {
            let r = rule.range(dim, nproc, p);
            covered += r.len();
            for i in r {
                prop_assert_eq!(rule.owner(i, dim, nproc), p);
            }
        }
        prop_assert_eq!(covered, dim);
    }

    #[test]
    fn regular_blocks_tile_the_array(
        dims in prop::collection::vec(1usize..12, 1..4),
        nproc in 1usize..9,
    ) {
        let d = Distribution::regular(&dims, nproc);
        prop_assert!(d.validate_invariants().is_ok());
        prop_assert!(d.nblocks() <= nproc);
        let total: usize = (0..nproc).map(|p| d.local_len(p)).sum();
        prop_assert_eq!(total, dims.iter().product::<usize>());
        let corner = vec![0; dims.len()];
        prop_assert_eq!(d.owner(&corner), 0);
        let last: Vec<usize> = dims.iter().map(|&x| x - 1).collect();
        let owner = d.owner(&last);
        prop_assert!(d.patch(owner).is_some_and(|p| p.contains(&last)));
    }
}
