//! Fail-fast behavior once a flush could not complete.

#[cfg(test)]
mod tests {
    use crate::engine::tests::helpers::*;
    use crate::engine::{CancelToken, EngineError};
    use crate::fsm::FsmError;
    use tempfile::TempDir;

    /// # Scenario
    /// A flush fails before its group reaches the log.
    ///
    /// # Expected behavior
    /// Every later call reports the failure, close does too, and reopening
    /// shows the last successfully flushed state.
    #[test]
    fn failed_flush_stops_the_engine() {
        let tmp = TempDir::new().unwrap();
        {
            let engine = open(tmp.path(), manual_config());
            put(&engine, "safe", b"1");
            engine.flush().unwrap();

            put(&engine, "lost", b"2");
            engine.inject_flush_failure();
            assert!(matches!(engine.flush(), Err(EngineError::Io(_))));

            let none = CancelToken::none();
            assert!(matches!(engine.read("safe", &none), Err(EngineError::Failed(_))));
            assert!(matches!(
                engine.write("x", b"y".to_vec(), &none),
                Err(EngineError::Failed(_))
            ));
            assert!(matches!(engine.checkpoint(), Err(EngineError::Failed(_))));
            match engine.close() {
                Err(EngineError::Failed(reason)) => assert!(reason.contains("injected")),
                other => panic!("expected Failed, got {other:?}"),
            }
            assert!(matches!(engine.flush(), Err(EngineError::Closed)));
        }

        let engine = open(tmp.path(), manual_config());
        assert_eq!(get(&engine, "safe"), b"1");
        assert!(!engine.contains("lost").unwrap());
    }

    #[test]
    fn stats_stay_available_after_failure() {
        let tmp = TempDir::new().unwrap();
        let engine = open(tmp.path(), manual_config());
        put(&engine, "a", b"1");
        engine.inject_flush_failure();
        assert!(engine.flush().is_err());

        let stats = engine.stats().unwrap();
        assert_eq!(stats.batch.accumulating, 0);
        assert_eq!(stats.batch.in_flight, 0);
    }

    /// # Scenario
    /// The disk refuses to grow while a flush needs a larger file.
    ///
    /// # Expected behavior
    /// The flush fails with out-of-space before its group is logged: the log
    /// tail does not move, and a reopen replays only the earlier group and
    /// serves its block.
    #[test]
    fn out_of_space_fails_flush_before_logging() {
        let tmp = TempDir::new().unwrap();
        {
            let engine = open(tmp.path(), manual_config());
            put(&engine, "safe", &payload(1, 5000));
            engine.flush().unwrap();
            let log_used = engine.stats().unwrap().log_used;

            engine.refuse_growth(true);
            put(&engine, "big", &payload(2, 100 * 1024));
            match engine.flush() {
                Err(EngineError::Fsm(FsmError::OutOfSpace { .. })) => {}
                other => panic!("expected OutOfSpace, got {other:?}"),
            }
            assert_eq!(engine.stats().unwrap().log_used, log_used);
            engine.check_fsm_invariants().unwrap();
            engine.simulate_crash();
        }

        let engine = open(tmp.path(), manual_config());
        assert_eq!(engine.stats().unwrap().recovered_groups, 1);
        assert_eq!(get(&engine, "safe"), payload(1, 5000));
        assert!(!engine.contains("big").unwrap());
        engine.check_fsm_invariants().unwrap();
    }
}
