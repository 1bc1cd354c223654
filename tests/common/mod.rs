//! Shared test utilities and fixtures
//!
//! Common infrastructure for integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use harbor_lsp::PoolConfig;
use harbor_types::ResolvedServer;

/// Pool timings small enough that failure paths finish in well under a second.
pub fn fast_pool_config() -> PoolConfig {
    PoolConfig {
        request_timeout_ms: 300,
        startup_grace_ms: 50,
        initialize_settle_ms: 0,
        open_settle_ms: 0,
        diagnostics_settle_ms: 0,
        graceful_stop_ms: 300,
        forced_stop_ms: 300,
        ..PoolConfig::default()
    }
}

pub fn server(id: &str, command: &[&str]) -> ResolvedServer {
    ResolvedServer::new(id, command.iter().map(|s| (*s).to_string()).collect())
        .expect("test command is not empty")
}

/// Write `contents` to `dir/name`, creating parent directories.
pub fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create parent dirs");
    }
    std::fs::write(&path, contents).expect("write fixture");
    path
}
