mod util;

use ga_sparse::prelude::*;
use proptest::prelude::*;
use util::{Triple, local_triples, registries, sorted};

fn triples(max_dim: usize) -> impl Strategy<Value = (usize, usize, Vec<Triple>)> {
    (1..max_dim, 1..max_dim).prop_flat_map(|(idim, jdim)| {
        let triple = (0..idim, 0..jdim, -1000i32..1000).prop_map(|(i, j, v)| (i, j, v as f64));
        (Just(idim), Just(jdim), prop::collection::vec(triple, 0..60))
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn assembly_preserves_every_triple(
        (idim, jdim, input) in triples(12),
        nproc in 1usize..5,
        initial_capacity in 1usize..8,
        strided in any::<bool>(),
    ) {
        let cfg = GaConfig {
            initial_capacity,
            binning: if strided { Binning::Strided } else { Binning::Balanced },
            ..Default::default()
        };
        let out = launch(WorldConfig::new(nproc), |comm| {
            let (mut ga, mut sp) = registries(comm, cfg.clone());
            let me = ga.rank();
            let h = sp.create::<f64>(idim, jdim).unwrap();
            for &(i, j, v) in input.iter().skip(me).step_by(nproc) {
                sp.add_element(h, i, j, v).unwrap();
            }
            let ok = sp.assemble(h, &mut ga).unwrap();
            let rows = sp.local_rows(h).unwrap();
            let got = local_triples(&sp, h, &ga);
            let in_rows = got.iter().all(|&(r, _, _)| rows.contains(&r));
            sp.destroy(h, &mut ga).unwrap();
            (ok && in_rows && ga.is_empty(), got)
        });
        prop_assert!(out.iter().all(|(fine, _)| *fine));
        let got: Vec<Triple> = out.into_iter().flat_map(|(_, g)| g).collect();
        prop_assert_eq!(sorted(got), sorted(input));
    }
}
