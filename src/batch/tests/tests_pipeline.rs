//! Accumulate → flush hand-off and read precedence.

#[cfg(test)]
mod tests {
    use crate::batch::{BatchPhase, Batcher, Pending, PendingOp};
    use crate::wal::framed_len;
    use std::time::Duration;

    fn put(bytes: &[u8]) -> PendingOp {
        PendingOp::Put(bytes.to_vec())
    }

    #[test]
    fn phases_follow_the_pipeline() {
        let batcher = Batcher::new(100, 1 << 20);
        assert_eq!(batcher.phase().unwrap(), BatchPhase::Empty);

        batcher.stage("a".into(), put(b"1")).unwrap();
        assert_eq!(batcher.phase().unwrap(), BatchPhase::Accumulating);

        let set = batcher.take_for_flush().unwrap().unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(batcher.phase().unwrap(), BatchPhase::Flushing);

        // Producers keep going during the flush.
        batcher.stage("b".into(), put(b"2")).unwrap();
        assert_eq!(batcher.stats().unwrap().accumulating, 1);
        assert_eq!(batcher.phase().unwrap(), BatchPhase::Flushing);

        batcher.finish_flush().unwrap();
        assert_eq!(batcher.phase().unwrap(), BatchPhase::Accumulating);
    }

    #[test]
    fn nothing_to_flush() {
        let batcher = Batcher::new(10, 1024);
        assert!(batcher.take_for_flush().unwrap().is_none());
        assert!(!batcher.due_by_age(Duration::ZERO).unwrap());
    }

    #[test]
    fn overlapping_flush_is_an_error() {
        let batcher = Batcher::new(10, 1024);
        batcher.stage("a".into(), put(b"1")).unwrap();
        let _set = batcher.take_for_flush().unwrap();
        batcher.stage("b".into(), put(b"2")).unwrap();
        assert!(batcher.take_for_flush().is_err());
    }

    #[test]
    fn record_threshold_reports_due() {
        let batcher = Batcher::new(3, 1 << 20);
        assert!(!batcher.stage("a".into(), put(b"x")).unwrap());
        assert!(!batcher.stage("b".into(), put(b"x")).unwrap());
        // Same name again: still two records.
        assert!(!batcher.stage("b".into(), put(b"y")).unwrap());
        assert!(batcher.stage("c".into(), put(b"x")).unwrap());
    }

    #[test]
    fn byte_threshold_reports_due() {
        let limit = framed_len(1, 100) * 2;
        let batcher = Batcher::new(1000, limit);
        assert!(!batcher.stage("a".into(), put(&[0; 100])).unwrap());
        assert!(batcher.stage("b".into(), put(&[0; 100])).unwrap());
    }

    #[test]
    fn replaced_writes_do_not_count_twice() {
        let batcher = Batcher::new(1000, 1 << 20);
        batcher.stage("a".into(), put(&[0; 100])).unwrap();
        batcher.stage("a".into(), PendingOp::Delete).unwrap();
        let set = batcher.take_for_flush().unwrap().unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.log_bytes(), framed_len(1, 0));
        assert_eq!(set.writes()[0].op, PendingOp::Delete);
    }

    #[test]
    fn newest_buffer_wins_on_read() {
        let batcher = Batcher::new(100, 1 << 20);
        batcher.stage("k".into(), put(b"old")).unwrap();
        let _set = batcher.take_for_flush().unwrap();
        assert_eq!(batcher.lookup("k").unwrap(), Pending::Present(b"old".to_vec()));

        batcher.stage("k".into(), PendingOp::Delete).unwrap();
        assert_eq!(batcher.lookup("k").unwrap(), Pending::Deleted);

        batcher.begin().unwrap();
        batcher.stage("k".into(), put(b"batch")).unwrap();
        assert_eq!(batcher.lookup("k").unwrap(), Pending::Present(b"batch".to_vec()));

        assert_eq!(batcher.lookup("other").unwrap(), Pending::Unknown);
    }

    #[test]
    fn overlay_lists_oldest_first() {
        let batcher = Batcher::new(100, 1 << 20);
        batcher.stage("t:1".into(), put(b"a")).unwrap();
        let _set = batcher.take_for_flush().unwrap();
        batcher.stage("t:1".into(), PendingOp::Delete).unwrap();
        batcher.stage("u:1".into(), put(b"b")).unwrap();

        let overlay = batcher.overlay("t:").unwrap();
        assert_eq!(
            overlay,
            vec![("t:1".to_string(), true), ("t:1".to_string(), false)]
        );
    }

    #[test]
    fn age_trigger() {
        let batcher = Batcher::new(100, 1 << 20);
        batcher.stage("a".into(), put(b"1")).unwrap();
        assert!(batcher.due_by_age(Duration::ZERO).unwrap());
        assert!(!batcher.due_by_age(Duration::from_secs(3600)).unwrap());
        let _ = batcher.take_for_flush().unwrap();
        assert!(!batcher.due_by_age(Duration::ZERO).unwrap());
    }
}
