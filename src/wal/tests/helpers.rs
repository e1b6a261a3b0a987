use crate::wal::{LogRecord, frame_into};
use tracing_subscriber::EnvFilter;

pub const MAX_RECORD: usize = 1 << 20;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Frames `records` back to back.
pub fn frames(records: &[LogRecord]) -> Vec<u8> {
    let mut buf = Vec::new();
    for record in records {
        frame_into(record, &mut buf).unwrap();
    }
    buf
}

/// `put` records for `names` starting at `seq`, closed by a commit.
pub fn group(seq: u64, names: &[&str]) -> Vec<LogRecord> {
    let mut out: Vec<LogRecord> = names
        .iter()
        .enumerate()
        .map(|(i, name)| LogRecord::put(seq + i as u64, *name, name.as_bytes().repeat(3)))
        .collect();
    out.push(LogRecord::commit(seq + names.len() as u64));
    out
}
