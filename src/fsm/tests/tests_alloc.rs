//! Allocation, free, coalescing, and reservation on a fixed-size FSM.

#[cfg(test)]
mod tests {
    use crate::fsm::tests::helpers::*;
    use crate::fsm::{Extent, FreeSpaceManager, FsmError, pages_for};

    #[test]
    fn pages_for_rounds_up_and_never_returns_zero() {
        assert_eq!(pages_for(0, PAGE), 1);
        assert_eq!(pages_for(1, PAGE), 1);
        assert_eq!(pages_for(PAGE, PAGE), 1);
        assert_eq!(pages_for(PAGE + 1, PAGE), 2);
    }

    #[test]
    fn allocate_from_fresh_space_starts_at_page_zero() {
        let backing = MemBacking::default();
        let fsm = FreeSpaceManager::new(PAGE, 16, 8, 2);

        let a = fsm.allocate(100, &backing).unwrap();
        let b = fsm.allocate(2 * PAGE, &backing).unwrap();

        assert_eq!(a, Extent::new(0, 1));
        assert_eq!(b, Extent::new(1, 2));
        assert_eq!(backing.resize_count(), 0);
        fsm.check_invariants().unwrap();
    }

    #[test]
    fn best_fit_prefers_smallest_sufficient_hole() {
        let backing = MemBacking::default();
        let fsm = FreeSpaceManager::new(PAGE, 32, 8, 2);

        // Layout: [a:4][b:1][c:2][d:1][rest free]
        let a = fsm.allocate(4 * PAGE, &backing).unwrap();
        let _b = fsm.allocate(PAGE, &backing).unwrap();
        let c = fsm.allocate(2 * PAGE, &backing).unwrap();
        let _d = fsm.allocate(PAGE, &backing).unwrap();
        fsm.free(a).unwrap();
        fsm.free(c).unwrap();

        // Holes: 4 pages at 0, 2 pages at 5, tail. A 2-page request takes the 2-page hole.
        let e = fsm.allocate(2 * PAGE, &backing).unwrap();
        assert_eq!(e, c);

        // A 3-page request takes the 4-page hole, leaving one free page behind.
        let f = fsm.allocate(3 * PAGE, &backing).unwrap();
        assert_eq!(f, Extent::new(0, 3));
        fsm.check_invariants().unwrap();
    }

    #[test]
    fn free_coalesces_with_both_neighbours() {
        let backing = MemBacking::default();
        let fsm = FreeSpaceManager::new(PAGE, 3, 8, 2);

        let a = fsm.allocate(PAGE, &backing).unwrap();
        let b = fsm.allocate(PAGE, &backing).unwrap();
        let c = fsm.allocate(PAGE, &backing).unwrap();
        assert_eq!(fsm.stats().unwrap().free_pages, 0);

        fsm.free(a).unwrap();
        fsm.free(c).unwrap();
        assert_eq!(fsm.stats().unwrap().free_extents, 2);

        fsm.free(b).unwrap();
        let stats = fsm.stats().unwrap();
        assert_eq!(stats.free_extents, 1);
        assert_eq!(stats.largest_free_extent, 3);
        fsm.check_invariants().unwrap();
    }

    #[test]
    fn double_free_is_rejected() {
        let backing = MemBacking::default();
        let fsm = FreeSpaceManager::new(PAGE, 8, 8, 2);
        let a = fsm.allocate(PAGE, &backing).unwrap();
        fsm.free(a).unwrap();

        let err = fsm.free(a).unwrap_err();
        assert!(matches!(err, FsmError::DoubleFree(e) if e == a));
        fsm.check_invariants().unwrap();
    }

    #[test]
    fn free_outside_file_is_rejected() {
        let fsm = FreeSpaceManager::new(PAGE, 8, 8, 2);
        let err = fsm.free(Extent::new(6, 4)).unwrap_err();
        assert!(matches!(err, FsmError::OutOfRange { total_pages: 8, .. }));
    }

    #[test]
    fn reserve_splits_free_run() {
        let backing = MemBacking::default();
        let fsm = FreeSpaceManager::new(PAGE, 10, 8, 2);
        fsm.reserve(Extent::new(3, 2)).unwrap();

        assert!(fsm.is_allocated(Extent::new(3, 2)).unwrap());
        assert_eq!(fsm.stats().unwrap().free_extents, 2);

        // Best fit: 3-page hole before the reservation fits exactly.
        let a = fsm.allocate(3 * PAGE, &backing).unwrap();
        assert_eq!(a, Extent::new(0, 3));
        fsm.check_invariants().unwrap();
    }

    #[test]
    fn reserve_of_allocated_range_is_rejected() {
        let fsm = FreeSpaceManager::new(PAGE, 10, 8, 2);
        fsm.reserve(Extent::new(0, 4)).unwrap();
        let err = fsm.reserve(Extent::new(2, 4)).unwrap_err();
        assert!(matches!(err, FsmError::AlreadyAllocated(_)));
        fsm.check_invariants().unwrap();
    }

    #[test]
    fn snapshot_restore_rebuilds_same_free_runs() {
        let backing = MemBacking::default();
        let fsm = FreeSpaceManager::new(PAGE, 70, 8, 2);
        let mut kept = Vec::new();
        for i in 0..10 {
            let e = fsm.allocate((i % 3 + 1) * PAGE, &backing).unwrap();
            if i % 2 == 0 {
                fsm.free(e).unwrap();
            } else {
                kept.push(e);
            }
        }

        let snapshot = fsm.snapshot().unwrap();
        let mut sealed = Vec::new();
        snapshot.seal_into(&mut sealed).unwrap();
        assert_eq!(
            sealed.len() as u64,
            crate::fsm::FreeMapSnapshot::sealed_len(snapshot.total_pages)
        );

        let decoded = crate::fsm::FreeMapSnapshot::unseal(&sealed).unwrap();
        let restored = FreeSpaceManager::restore(PAGE, &decoded, 8, 2).unwrap();

        assert_eq!(restored.stats().unwrap(), fsm.stats().unwrap());
        for e in kept {
            assert!(restored.is_allocated(e).unwrap());
        }
        restored.check_invariants().unwrap();
    }

    #[test]
    fn unseal_detects_flipped_bit() {
        let fsm = FreeSpaceManager::new(PAGE, 64, 8, 2);
        let mut sealed = Vec::new();
        fsm.snapshot().unwrap().seal_into(&mut sealed).unwrap();
        sealed[10] ^= 0x01;

        let err = crate::fsm::FreeMapSnapshot::unseal(&sealed).unwrap_err();
        assert!(matches!(err, FsmError::ChecksumMismatch));
    }

    #[test]
    fn restore_rejects_bits_past_end() {
        let snapshot = crate::fsm::FreeMapSnapshot {
            total_pages: 10,
            last_extension: 0,
            words: vec![1 << 12],
        };
        let err = FreeSpaceManager::restore(PAGE, &snapshot, 8, 2).unwrap_err();
        assert!(matches!(err, FsmError::InvalidMap(_)));
    }
}
