//! Pool behavior against real child processes.

use std::time::{Duration, Instant};

use harbor_lsp::{LspError, PoolConfig, PoolStats, ServerPool, SpawnError};
use tempfile::tempdir;

use crate::common::{fast_pool_config, server};

#[tokio::test]
async fn empty_pool_operations_are_harmless() {
    let pool = ServerPool::new(fast_pool_config());
    let dir = tempdir().unwrap();
    let ts = server("ts", &["typescript-language-server", "--stdio"]);

    pool.release_client(dir.path(), &ts);
    assert_eq!(pool.ref_count(dir.path(), &ts), None);
    assert!(!pool.is_server_initializing(dir.path(), &ts));
    assert_eq!(pool.cleanup_temp_directory_clients().await, 0);
    pool.stop_all().await;
    assert_eq!(pool.stats(), PoolStats::default());
}

#[tokio::test]
async fn nonexistent_root_is_rejected_before_spawn() {
    let pool = ServerPool::new(fast_pool_config());
    let dir = tempdir().unwrap();
    let missing = dir.path().join("gone");

    let err = pool
        .get_client(&missing, &server("ts", &["harbor-no-such-server"]))
        .await
        .unwrap_err();
    assert!(
        matches!(err, LspError::Spawn(SpawnError::InvalidCwd { .. })),
        "{err:?}"
    );
    assert_eq!(pool.stats().entries, 0);
}

#[tokio::test]
async fn missing_binary_is_reported_and_purged() {
    let pool = ServerPool::new(fast_pool_config());
    let dir = tempdir().unwrap();
    let ghost = server("ghost", &["harbor-no-such-server-binary", "--stdio"]);

    let err = pool.get_client(dir.path(), &ghost).await.unwrap_err();
    match err {
        LspError::Spawn(SpawnError::BinaryNotFound { binary, .. }) => {
            assert_eq!(binary, "harbor-no-such-server-binary");
        }
        other => panic!("expected BinaryNotFound, got {other:?}"),
    }
    assert_eq!(pool.stats().entries, 0);
}

#[cfg(unix)]
#[tokio::test]
async fn server_that_exits_at_startup_reports_exit_code() {
    let config = PoolConfig {
        startup_grace_ms: 1_000,
        ..fast_pool_config()
    };
    let pool = ServerPool::new(config);
    let dir = tempdir().unwrap();
    let crashy = server("crashy", &["sh", "-c", "echo 'no config' >&2; exit 3"]);

    let err = pool.get_client(dir.path(), &crashy).await.unwrap_err();
    match err {
        LspError::Spawn(SpawnError::ExitedImmediately { code, stderr, .. }) => {
            assert_eq!(code, Some(3));
            assert_eq!(stderr, vec!["no config".to_string()]);
        }
        other => panic!("expected ExitedImmediately, got {other:?}"),
    }
    assert_eq!(pool.stats().entries, 0);
}

#[cfg(unix)]
#[tokio::test]
async fn silent_server_fails_initialization_within_timeout() {
    let config = fast_pool_config();
    let pool = ServerPool::new(config);
    let dir = tempdir().unwrap();
    let mute = server("mute", &["sh", "-c", "cat > /dev/null"]);

    let started = Instant::now();
    let err = pool.get_client(dir.path(), &mute).await.unwrap_err();
    assert!(
        matches!(err, LspError::Initialization { .. }),
        "{err:?}"
    );
    assert!(err.to_string().contains("timed out"), "{err}");

    let bound = config.request_timeout()
        + config.startup_grace()
        + config.graceful_stop()
        + config.forced_stop()
        + Duration::from_secs(2);
    assert!(started.elapsed() < bound, "took {:?}", started.elapsed());
    assert_eq!(pool.stats().entries, 0);
}
