use crate::engine::{CancelToken, Engine, EngineConfig};
use crate::wal::RetryPolicy;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times; only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Config that never flushes or checkpoints on its own: tests drive both.
pub fn manual_config() -> EngineConfig {
    init_tracing();
    EngineConfig {
        page_size: 4096,
        initial_extension_pages: 16,
        growth_factor: 2,
        log_region_size: 256 * 1024,
        max_block_size: 1024 * 1024,
        flush_max_records: 100_000,
        flush_max_bytes: 64 * 1024 * 1024,
        flush_interval: Duration::from_secs(3600),
        checkpoint_dirty_threshold: 1_000_000,
        checkpoint_interval: Duration::from_secs(3600),
        retry: RetryPolicy {
            retries: 2,
            backoff: Duration::from_millis(1),
        },
    }
}

/// Tiny log region so that flushes regularly hit log pressure.
pub fn small_log_config() -> EngineConfig {
    EngineConfig {
        log_region_size: 4 * 4096,
        ..manual_config()
    }
}

pub fn vault_path(dir: &Path) -> PathBuf {
    dir.join("vault.bv")
}

pub fn open(dir: &Path, config: EngineConfig) -> Engine {
    Engine::open(vault_path(dir), config).expect("open")
}

pub fn put(engine: &Engine, name: &str, bytes: &[u8]) {
    engine
        .write(name, bytes.to_vec(), &CancelToken::none())
        .expect("write");
}

pub fn get(engine: &Engine, name: &str) -> Vec<u8> {
    engine.read(name, &CancelToken::none()).expect("read")
}

pub fn del(engine: &Engine, name: &str) {
    engine.delete(name, &CancelToken::none()).expect("delete");
}

/// Deterministic payload for block `i`.
pub fn payload(i: usize, len: usize) -> Vec<u8> {
    (0..len).map(|j| ((i * 31 + j * 7) % 251) as u8).collect()
}

/// XORs one byte of the vault file in place.
pub fn flip_byte(dir: &Path, offset: u64) {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(vault_path(dir))
        .unwrap();
    let mut byte = [0u8; 1];
    file.read_exact_at(&mut byte, offset).unwrap();
    byte[0] ^= 0xFF;
    file.write_all_at(&byte, offset).unwrap();
    file.sync_all().unwrap();
}
