use ga_sparse::prelude::*;

fn payload(i: usize) -> Vec<u8> {
    format!("element-{i}").into_bytes()
}

#[test]
fn every_rank_dereferences_every_element() {
    let out = launch(WorldConfig::new(3), |comm| {
        let mut ga = GlobalArrays::new(comm, GaConfig::default());
        let mut gp = PointerArrays::new(&ga);
        let h = gp.create_handle(&mut ga).unwrap();
        gp.set_dimensions(h, &[7], &mut ga).unwrap();
        gp.allocate(h, &mut ga).unwrap();

        let mine = gp.distribution(h, ga.rank(), &ga).unwrap().unwrap();
        let mut allocs = Vec::new();
        for i in mine.lo[0]..mine.hi[0] {
            let bytes = payload(i);
            let alloc = gp.malloc(bytes.len(), &ga).unwrap();
            gp.access_allocation(&alloc, &ga)
                .unwrap()
                .copy_from_slice(&bytes);
            gp.assign_local_element(h, &[i], &alloc, &ga).unwrap();
            allocs.push(alloc);
        }
        ga.comm().barrier();

        let read: Vec<Vec<u8>> = (0..7).map(|i| gp.read_element(h, &[i], &ga).unwrap()).collect();
        let total = gp.total_size(h, &ga).unwrap();
        let owner_of_6 = gp.get_descriptor(h, &[6], &ga).unwrap().owner;
        ga.comm().barrier();

        for (i, alloc) in (mine.lo[0]..mine.hi[0]).zip(&allocs) {
            let d = gp.free_local_element(h, &[i], &ga).unwrap();
            assert_eq!(d, alloc.descriptor());
            gp.free(d, &ga).unwrap();
        }
        assert!(gp.destroy(h, &mut ga).unwrap());
        (read, total, owner_of_6)
    });
    let want_total: usize = (0..7).map(|i| payload(i).len()).sum();
    for (read, total, owner) in out {
        assert_eq!(read, (0..7).map(payload).collect::<Vec<_>>());
        assert_eq!(total, want_total);
        assert_eq!(owner, 2);
    }
}

#[test]
fn non_local_assignment_is_out_of_bounds() {
    let out = launch(WorldConfig::new(2), |comm| {
        let mut ga = GlobalArrays::new(comm, GaConfig::default());
        let mut gp = PointerArrays::new(&ga);
        let h = gp.create_handle(&mut ga).unwrap();
        gp.set_dimensions(h, &[4], &mut ga).unwrap();
        gp.allocate(h, &mut ga).unwrap();
        let alloc = gp.malloc(8, &ga).unwrap();
        let foreign = if ga.rank() == 0 { 3 } else { 0 };
        let err = gp.assign_local_element(h, &[foreign], &alloc, &ga);
        let freed = gp.free_local_element(h, &[foreign], &ga).is_err();
        gp.terminate(&mut ga).unwrap();
        (
            matches!(err, Err(GaError::OutOfBounds { .. })),
            freed,
            ga.comm().exposed_bytes(),
        )
    });
    assert!(out.iter().all(|&(oob, freed, bytes)| oob && freed && bytes == 0));
}

#[test]
fn allocation_failure_is_reported_everywhere() {
    let out = launch(WorldConfig::new(2).with_memory_limit(64), |comm| {
        let mut ga = GlobalArrays::new(comm, GaConfig::default());
        let mut gp = PointerArrays::new(&ga);
        let h = gp.create_handle(&mut ga).unwrap();
        gp.set_dimensions(h, &[2], &mut ga).unwrap();
        let small = gp.allocate(h, &mut ga).is_ok();
        gp.destroy(h, &mut ga).unwrap();

        let h = gp.create_handle(&mut ga).unwrap();
        gp.set_dimensions(h, &[8], &mut ga).unwrap();
        let big = gp.allocate(h, &mut ga);
        gp.destroy(h, &mut ga).unwrap();
        (small, matches!(big, Err(GaError::AllocationFailure { .. })))
    });
    assert_eq!(out, vec![(true, true), (true, true)]);
}
