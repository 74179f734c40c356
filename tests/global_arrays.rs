mod util;

use ga_sparse::prelude::*;
use util::assert_permutation;

fn value(i: usize, j: usize) -> f64 {
    (i + 10 * j) as f64
}

#[test]
fn put_get_two_dimensional_across_ranks() {
    let out = launch(WorldConfig::new(4), |comm| {
        let mut ga = GlobalArrays::new(comm, GaConfig::default());
        let h = ga.create_handle().unwrap();
        ga.set_data(h, &[6, 4], ElementType::Double).unwrap();
        assert!(ga.allocate(h).unwrap());
        if ga.rank() == 0 {
            let whole = Patch::new(vec![0, 0], vec![6, 4]);
            let mut buf = Vec::new();
            for j in 0..4 {
                for i in 0..6 {
                    buf.push(value(i, j));
                }
            }
            ga.put(h, &whole, &buf).unwrap();
        }
        ga.comm().barrier();

        let mut mid = vec![0.0; 8];
        ga.get(h, &Patch::new(vec![1, 1], vec![5, 3]), &mut mid).unwrap();

        let local = ga.distribution(h, ga.rank()).unwrap().unwrap();
        let view = ga.access_local::<f64>(h).unwrap().to_vec();
        let mut expected = Vec::new();
        for j in local.lo[1]..local.hi[1] {
            for i in local.lo[0]..local.hi[0] {
                expected.push(value(i, j));
            }
        }
        assert_eq!(view, expected);
        assert_eq!(ga.locate(h, &[local.lo[0], local.lo[1]]).unwrap(), ga.rank());
        ga.destroy(h).unwrap();
        mid
    });
    let want: Vec<f64> = (1..3)
        .flat_map(|j| (1..5).map(move |i| value(i, j)))
        .collect();
    assert!(out.iter().all(|mid| *mid == want));
}

#[test]
fn irregular_distribution_owns_declared_blocks() {
    let out = launch(WorldConfig::new(2), |comm| {
        let mut ga = GlobalArrays::new(comm, GaConfig::default());
        let h = ga.create_handle().unwrap();
        ga.set_data(h, &[5], ElementType::Int).unwrap();
        ga.set_irregular_distribution(h, &[0, 2], &[2]).unwrap();
        assert!(ga.allocate(h).unwrap());
        let owners: Vec<usize> = (0..5).map(|i| ga.locate(h, &[i]).unwrap()).collect();
        let mine = ga.distribution(h, ga.rank()).unwrap();
        let len = ga.access_local::<i32>(h).unwrap().len();
        ga.destroy(h).unwrap();
        (owners, mine, len)
    });
    assert_eq!(out[0].0, vec![0, 0, 1, 1, 1]);
    assert_eq!(out[0].1, Some(Patch::span(0..2)));
    assert_eq!(out[1].1, Some(Patch::span(2..5)));
    assert_eq!((out[0].2, out[1].2), (2, 3));
}

#[test]
fn malformed_irregular_maps_are_rejected() {
    let mut ga = GlobalArrays::new(ThreadComm::serial(), GaConfig::default());
    let h = ga.create_handle().unwrap();
    ga.set_data(h, &[5], ElementType::Int).unwrap();
    assert!(matches!(
        ga.set_irregular_distribution(h, &[1], &[1]),
        Err(GaError::InvalidDistribution { .. })
    ));
    assert!(matches!(
        ga.set_irregular_distribution(h, &[0, 2], &[2]),
        Err(GaError::InvalidDistribution { .. })
    ));
}

#[test]
fn read_inc_claims_are_disjoint() {
    let out = launch(WorldConfig::new(4), |comm| {
        let mut ga = GlobalArrays::new(comm, GaConfig::default());
        let h = ga.create_handle().unwrap();
        ga.set_data(h, &[1], ElementType::Long).unwrap();
        assert!(ga.allocate(h).unwrap());
        ga.zero(h).unwrap();
        let claims: Vec<i64> = (0..10).map(|_| ga.read_inc(h, &[0], 2).unwrap()).collect();
        ga.comm().barrier();
        let mut total = [0i64];
        ga.get(h, &Patch::span(0..1), &mut total).unwrap();
        ga.destroy(h).unwrap();
        (claims, total[0])
    });
    let claims: Vec<i64> = out.iter().flat_map(|(c, _)| c.clone()).collect();
    let want: Vec<i64> = (0..40).map(|k| 2 * k).collect();
    assert_permutation(&claims, &want);
    assert!(out.iter().all(|(_, t)| *t == 80));
}

#[test]
fn zero_clears_every_block() {
    let out = launch(WorldConfig::new(3), |comm| {
        let mut ga = GlobalArrays::new(comm, GaConfig::default());
        let h = ga.create_handle().unwrap();
        ga.set_data(h, &[7], ElementType::Long).unwrap();
        assert!(ga.allocate(h).unwrap());
        ga.access_local::<i64>(h).unwrap().fill(9);
        ga.comm().barrier();
        ga.zero(h).unwrap();
        let mut all = [1i64; 7];
        ga.get(h, &Patch::span(0..7), &mut all).unwrap();
        ga.comm().barrier();
        ga.destroy(h).unwrap();
        all
    });
    assert!(out.iter().all(|a| a.iter().all(|&x| x == 0)));
}

#[test]
fn terminate_releases_everything() {
    let mut ga = GlobalArrays::new(ThreadComm::serial(), GaConfig::default());
    for n in 1..4 {
        let h = ga.create_handle().unwrap();
        ga.set_data(h, &[n], ElementType::Float).unwrap();
        ga.allocate(h).unwrap();
    }
    ga.create_handle().unwrap();
    assert_eq!(ga.len(), 4);
    assert!(ga.terminate().unwrap());
    assert!(ga.is_empty());
    assert_eq!(ga.comm().exposed_bytes(), 0);
}
