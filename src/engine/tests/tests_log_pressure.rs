//! Log region pressure: forced checkpoints and relocation.

#[cfg(test)]
mod tests {
    use crate::engine::tests::helpers::*;
    use tempfile::TempDir;

    #[test]
    fn full_log_forces_checkpoints() {
        let tmp = TempDir::new().unwrap();
        let engine = open(tmp.path(), small_log_config());
        let base = engine.stats().unwrap().checkpoints;

        for i in 0..40 {
            put(&engine, &format!("k{i:02}"), &payload(i, 1024));
            engine.flush().unwrap();
        }

        let stats = engine.stats().unwrap();
        assert!(stats.checkpoints >= base + 2, "got {stats:?}");
        assert_eq!(stats.log_capacity, 16 * 1024, "groups fit, no relocation");
        for i in 0..40 {
            assert_eq!(get(&engine, &format!("k{i:02}")), payload(i, 1024));
        }
        engine.simulate_crash();
        drop(engine);

        let engine = open(tmp.path(), small_log_config());
        assert_eq!(engine.stats().unwrap().blocks, 40);
        for i in 0..40 {
            assert_eq!(get(&engine, &format!("k{i:02}")), payload(i, 1024));
        }
        engine.check_fsm_invariants().unwrap();
    }

    /// # Scenario
    /// One batch larger than the whole log region.
    ///
    /// # Expected behavior
    /// The log moves to a larger extent, the batch commits, and it is
    /// recovered from the new location after a crash.
    #[test]
    fn oversized_batch_relocates_log() {
        let tmp = TempDir::new().unwrap();
        {
            let engine = open(tmp.path(), small_log_config());
            engine.begin_batch().unwrap();
            for i in 0..30 {
                put(&engine, &format!("b{i:02}"), &payload(i, 1024));
            }
            engine.end_batch().unwrap();

            let stats = engine.stats().unwrap();
            assert!(stats.log_capacity >= 32 * 1024, "got {stats:?}");
            assert!(stats.log_used > 30 * 1024);
            engine.check_fsm_invariants().unwrap();
            engine.simulate_crash();
        }

        let engine = open(tmp.path(), small_log_config());
        let stats = engine.stats().unwrap();
        assert_eq!(stats.recovered_groups, 1);
        assert!(stats.log_capacity >= 32 * 1024);
        for i in 0..30 {
            assert_eq!(get(&engine, &format!("b{i:02}")), payload(i, 1024));
        }
        engine.check_fsm_invariants().unwrap();
    }

    #[test]
    fn single_block_larger_than_log() {
        let tmp = TempDir::new().unwrap();
        let engine = open(tmp.path(), small_log_config());

        put(&engine, "huge", &payload(7, 100_000));
        engine.flush().unwrap();
        assert!(engine.stats().unwrap().log_capacity > 100_000);
        engine.close().unwrap();

        let engine = open(tmp.path(), small_log_config());
        assert_eq!(get(&engine, "huge"), payload(7, 100_000));
    }
}
