use crate::{IndexKey, Vault, VaultConfig};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Vault without a background thread; writes become durable on flush.
pub fn open_vault(dir: &Path) -> Arc<Vault> {
    init_tracing();
    let config = VaultConfig {
        background_flush: false,
        initial_extension_pages: 16,
        log_region_size: 256 * 1024,
        ..VaultConfig::default()
    };
    Arc::new(Vault::open(dir.join("tables.bv"), config).unwrap())
}

/// Row layout used by the tests: `"<age>|<name>"`.
pub fn person(age: i64, name: &str) -> Vec<u8> {
    format!("{age}|{name}").into_bytes()
}

pub fn age_of(row: &[u8]) -> Option<IndexKey> {
    let text = std::str::from_utf8(row).ok()?;
    let (age, _) = text.split_once('|')?;
    age.parse().ok().map(IndexKey::Int)
}

pub fn name_of(row: &[u8]) -> Option<IndexKey> {
    let text = std::str::from_utf8(row).ok()?;
    let (_, name) = text.split_once('|')?;
    (!name.is_empty()).then(|| IndexKey::from(name))
}
