//! Process-exit cleanup for pooled language servers.
//!
//! [`ExitHooks::install`] arranges for children to be reclaimed when the host
//! goes away: a panic hook and the guard's `Drop` hard-kill synchronously,
//! and a signal task stops everything gracefully before exiting.

use tokio::task::JoinHandle;

use crate::pool::ServerPool;

/// Guard returned by [`ExitHooks::install`]. Keep it alive for the lifetime
/// of the program; dropping it force-kills every pooled server.
pub struct ExitHooks {
    pool: ServerPool,
    signal_task: JoinHandle<()>,
}

impl ExitHooks {
    /// Install the panic hook and the SIGINT/SIGTERM handler for `pool`.
    ///
    /// Install once per process. Each call chains another panic hook in
    /// front of the previous one; the hook holds the pool weakly, so a hook
    /// left behind by a dropped guard does nothing.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn install(pool: &ServerPool) -> Self {
        let panic_pool = pool.downgrade();
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if let Some(pool) = panic_pool.upgrade() {
                pool.force_kill_all();
            }
            previous(info);
        }));

        let signal_pool = pool.clone();
        let signal_task = tokio::spawn(async move {
            let Some(signal) = wait_for_signal().await else {
                tracing::warn!("could not install signal handlers; servers are reclaimed on exit only");
                return;
            };
            let code = shutdown_on_signal(&signal_pool, signal).await;
            std::process::exit(code);
        });

        Self {
            pool: pool.clone(),
            signal_task,
        }
    }
}

impl Drop for ExitHooks {
    fn drop(&mut self) {
        self.signal_task.abort();
        self.pool.force_kill_all();
    }
}

/// Stop every pooled server after `signal` and return the exit code the
/// process should report for it.
pub(crate) async fn shutdown_on_signal(pool: &ServerPool, signal: i32) -> i32 {
    tracing::info!(signal, "received signal; stopping language servers");
    pool.stop_all().await;
    128 + signal
}

#[cfg(unix)]
async fn wait_for_signal() -> Option<i32> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt()).ok()?;
    let mut terminate = signal(SignalKind::terminate()).ok()?;
    tokio::select! {
        _ = interrupt.recv() => Some(libc::SIGINT),
        _ = terminate.recv() => Some(libc::SIGTERM),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Option<i32> {
    tokio::signal::ctrl_c().await.ok()?;
    // Ctrl-C maps to SIGINT's conventional number.
    Some(2)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use harbor_types::ResolvedServer;

    use super::*;
    use crate::testing::FakeLauncher;
    use crate::transport::{KillSignal, Launcher};
    use crate::types::PoolConfig;

    fn fake_pool(fake: &FakeLauncher) -> ServerPool {
        let config = PoolConfig {
            startup_grace_ms: 10,
            initialize_settle_ms: 0,
            graceful_stop_ms: 200,
            forced_stop_ms: 200,
            ..PoolConfig::default()
        };
        ServerPool::with_launcher(config, Launcher::Fake(fake.clone()))
    }

    fn server() -> ResolvedServer {
        ResolvedServer::new("ts", vec!["fake-ls".into()]).unwrap()
    }

    #[tokio::test]
    async fn test_dropping_guard_kills_pooled_servers() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeLauncher::new().ignoring_terminate();
        let pool = fake_pool(&fake);
        let server = server();
        let client = pool.get_client(dir.path(), &server).await.unwrap();

        let hooks = ExitHooks::install(&pool);
        assert!(client.is_alive());
        drop(hooks);

        for _ in 0..100 {
            if !client.is_alive() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!client.is_alive());
        assert_eq!(fake.signals(), vec![KillSignal::Kill]);
    }

    #[tokio::test]
    async fn test_signal_shutdown_stops_every_server() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let fake = FakeLauncher::new();
        let pool = fake_pool(&fake);
        let server = server();
        let first = pool.get_client(a.path(), &server).await.unwrap();
        let second = pool.get_client(b.path(), &server).await.unwrap();

        let code = shutdown_on_signal(&pool, 15).await;
        assert_eq!(code, 143);
        assert_eq!(pool.stats().entries, 0);
        assert!(!first.is_alive());
        assert!(!second.is_alive());
        assert_eq!(fake.count_of("shutdown"), 2);
    }

    #[tokio::test]
    async fn test_dropped_guard_releases_pool() {
        let pool = fake_pool(&FakeLauncher::new());
        let weak = pool.downgrade();

        let hooks = ExitHooks::install(&pool);
        drop(hooks);
        drop(pool);

        // The aborted signal task lets go of its clone on its next poll.
        for _ in 0..100 {
            if weak.upgrade().is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(weak.upgrade().is_none());
    }
}
