//! Process-wide cache of language server sessions.
//!
//! Sessions are keyed by `"{root}::{server id}"` using the root exactly as the
//! caller spelled it. Entries are reference counted by acquire/release and
//! reclaimed by an idle sweep, by liveness checks on the next acquire, or by
//! [`ServerPool::stop_all`].
//!
//! Concurrent acquisitions of a key that is still initializing coalesce on a
//! single shared future, so at most one process exists per key.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError, Weak};
use std::time::Instant;

use futures_util::future::{BoxFuture, FutureExt, Shared, join_all};
use harbor_types::{PoolKey, ResolvedServer};
use tokio::task::{AbortHandle, JoinHandle};

use crate::client::LspClient;
use crate::error::LspError;
use crate::transport::{Launcher, SpawnBackend};
use crate::types::{PoolConfig, PoolStats};

type InitFuture = Shared<BoxFuture<'static, Result<(), LspError>>>;

struct InFlightInit {
    future: InitFuture,
    abort: AbortHandle,
    since: Instant,
}

struct ManagedEntry {
    client: Arc<LspClient>,
    last_used_at: Instant,
    ref_count: usize,
    init: Option<InFlightInit>,
}

impl ManagedEntry {
    fn is_initializing(&self) -> bool {
        self.init.is_some()
    }

    fn is_evictable(&self) -> bool {
        self.ref_count == 0 && !self.is_initializing()
    }
}

struct PoolInner {
    config: PoolConfig,
    launcher: Launcher,
    entries: Mutex<HashMap<PoolKey, ManagedEntry>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl PoolInner {
    fn entries(&self) -> MutexGuard<'_, HashMap<PoolKey, ManagedEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the outcome of an initialization task, if its entry is still ours.
    fn finish_init(&self, key: &PoolKey, client: &Arc<LspClient>, succeeded: bool) {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(key) else {
            return;
        };
        if !Arc::ptr_eq(&entry.client, client) {
            return;
        }
        if succeeded {
            entry.init = None;
            entry.last_used_at = Instant::now();
        } else {
            entries.remove(key);
        }
    }

    /// Remove and return idle entries older than the idle timeout as of `now`.
    fn take_idle(&self, now: Instant) -> Vec<(PoolKey, Arc<LspClient>)> {
        let idle_timeout = self.config.idle_timeout();
        let mut entries = self.entries();
        let expired: Vec<PoolKey> = entries
            .iter()
            .filter(|(_, entry)| {
                entry.is_evictable()
                    && now.saturating_duration_since(entry.last_used_at) > idle_timeout
            })
            .map(|(key, _)| key.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|key| entries.remove(&key).map(|entry| (key, entry.client)))
            .collect()
    }
}

/// Cloneable handle to a shared pool of language server sessions.
#[derive(Clone)]
pub struct ServerPool {
    inner: Arc<PoolInner>,
}

impl ServerPool {
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        let backend = SpawnBackend::from_preference(config.spawn_backend);
        Self::with_launcher(config, Launcher::Backend(backend))
    }

    pub(crate) fn with_launcher(config: PoolConfig, launcher: Launcher) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                launcher,
                entries: Mutex::new(HashMap::new()),
                sweeper: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Acquire a ready client for `server` in `root`, spawning one if needed.
    ///
    /// Each successful call must be paired with [`ServerPool::release_client`].
    pub async fn get_client(
        &self,
        root: &Path,
        server: &ResolvedServer,
    ) -> Result<Arc<LspClient>, LspError> {
        let key = pool_key(root, server);
        if !is_normal_form(root) {
            tracing::debug!(root = %root.display(), "pool root is not normalized; it keys a separate entry");
        }

        loop {
            let step = self.evaluate(&key, root, server);
            match step {
                Step::Ready(client) => return Ok(client),
                Step::Discard(client) => {
                    client.stop().await;
                }
                Step::Await { client, init } => match init.await {
                    Ok(()) => {
                        if self.claim(&key, &client) {
                            return Ok(client);
                        }
                    }
                    Err(e) => {
                        tracing::debug!(%key, "coalesced initialization failed: {e}");
                        let removed = self.remove_if_same(&key, &client);
                        if removed {
                            client.stop().await;
                        }
                    }
                },
                Step::Built { client, init } => {
                    init.await?;
                    if self.claim(&key, &client) {
                        return Ok(client);
                    }
                }
            }
        }
    }

    /// Decide what to do for `key` with the table locked; never awaits.
    fn evaluate(&self, key: &PoolKey, root: &Path, server: &ResolvedServer) -> Step {
        let stale_after = self.inner.config.stale_init_after();
        let mut entries = self.inner.entries();

        if let Some(entry) = entries.get_mut(key) {
            if let Some(init) = &entry.init {
                if init.since.elapsed() > stale_after {
                    init.abort.abort();
                    let stale = LspError::StaleInitialization {
                        key: key.to_string(),
                        after: stale_after,
                    };
                    tracing::warn!(%key, "{stale}; discarding");
                    let client = entry.client.clone();
                    entries.remove(key);
                    return Step::Discard(client);
                }
                return Step::Await {
                    client: entry.client.clone(),
                    init: init.future.clone(),
                };
            }

            if entry.client.is_alive() {
                entry.ref_count += 1;
                entry.last_used_at = Instant::now();
                tracing::debug!(%key, ref_count = entry.ref_count, "reusing language server");
                return Step::Ready(entry.client.clone());
            }

            tracing::info!(%key, "language server is dead; replacing");
            let client = entry.client.clone();
            entries.remove(key);
            return Step::Discard(client);
        }

        // Unreferenced until the caller claims it, so a dropped caller leaks nothing.
        let (client, init) = self.insert_building(&mut entries, key, root, server, 0);
        drop(entries);
        self.ensure_sweeper();
        Step::Built { client, init }
    }

    /// Insert a new initializing entry and launch its start+initialize task.
    fn insert_building(
        &self,
        entries: &mut HashMap<PoolKey, ManagedEntry>,
        key: &PoolKey,
        root: &Path,
        server: &ResolvedServer,
        ref_count: usize,
    ) -> (Arc<LspClient>, InitFuture) {
        let client = Arc::new(LspClient::with_launcher(
            root.to_path_buf(),
            server.clone(),
            self.inner.config,
            self.inner.launcher.clone(),
        ));

        let task_client = client.clone();
        let task_key = key.clone();
        let pool = Arc::downgrade(&self.inner);
        let task: JoinHandle<Result<(), LspError>> = tokio::spawn(async move {
            let result = match task_client.start().await {
                Ok(()) => task_client.initialize().await,
                Err(e) => Err(e),
            };
            if let Some(pool) = pool.upgrade() {
                pool.finish_init(&task_key, &task_client, result.is_ok());
            }
            if let Err(e) = &result {
                tracing::warn!(key = %task_key, "failed to start language server: {e}");
                task_client.stop().await;
            }
            result
        });

        let abort = task.abort_handle();
        let server_id = server.id().to_string();
        let future = async move {
            match task.await {
                Ok(result) => result,
                Err(join) => Err(LspError::Initialization {
                    server: server_id,
                    message: if join.is_cancelled() {
                        "initialization was abandoned".to_string()
                    } else {
                        "initialization task panicked".to_string()
                    },
                }),
            }
        }
        .boxed()
        .shared();

        entries.insert(
            key.clone(),
            ManagedEntry {
                client: client.clone(),
                last_used_at: Instant::now(),
                ref_count,
                init: Some(InFlightInit {
                    future: future.clone(),
                    abort,
                    since: Instant::now(),
                }),
            },
        );
        tracing::info!(%key, ref_count, "starting language server");
        (client, future)
    }

    /// Take a reference on `client` if it still owns the entry for `key`.
    ///
    /// Runs with no await point between the check and the increment.
    fn claim(&self, key: &PoolKey, client: &Arc<LspClient>) -> bool {
        let mut entries = self.inner.entries();
        let Some(entry) = entries
            .get_mut(key)
            .filter(|entry| Arc::ptr_eq(&entry.client, client))
        else {
            return false;
        };
        entry.ref_count += 1;
        entry.last_used_at = Instant::now();
        tracing::debug!(%key, ref_count = entry.ref_count, "acquired language server");
        true
    }

    fn remove_if_same(&self, key: &PoolKey, client: &Arc<LspClient>) -> bool {
        let mut entries = self.inner.entries();
        if entries
            .get(key)
            .is_some_and(|entry| Arc::ptr_eq(&entry.client, client))
        {
            entries.remove(key);
            return true;
        }
        false
    }

    /// Start a server in the background without holding a reference to it.
    ///
    /// No-op when an entry for the key already exists. Failures only log.
    pub fn warmup_client(&self, root: &Path, server: &ResolvedServer) {
        let key = pool_key(root, server);
        let mut entries = self.inner.entries();
        if entries.contains_key(&key) {
            return;
        }
        let _ = self.insert_building(&mut entries, &key, root, server, 0);
        drop(entries);
        self.ensure_sweeper();
    }

    /// Give back a client obtained from [`ServerPool::get_client`].
    ///
    /// Never stops the server; idle entries are reclaimed by the sweep.
    pub fn release_client(&self, root: &Path, server: &ResolvedServer) {
        let key = pool_key(root, server);
        let mut entries = self.inner.entries();
        if let Some(entry) = entries.get_mut(&key) {
            entry.ref_count = entry.ref_count.saturating_sub(1);
            entry.last_used_at = Instant::now();
            tracing::debug!(%key, ref_count = entry.ref_count, "released language server");
        }
    }

    #[must_use]
    pub fn is_server_initializing(&self, root: &Path, server: &ResolvedServer) -> bool {
        self.inner
            .entries()
            .get(&pool_key(root, server))
            .is_some_and(ManagedEntry::is_initializing)
    }

    #[must_use]
    pub fn ref_count(&self, root: &Path, server: &ResolvedServer) -> Option<usize> {
        self.inner
            .entries()
            .get(&pool_key(root, server))
            .map(|entry| entry.ref_count)
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let entries = self.inner.entries();
        PoolStats {
            entries: entries.len(),
            initializing: entries.values().filter(|e| e.is_initializing()).count(),
            referenced: entries.values().filter(|e| e.ref_count > 0).count(),
        }
    }

    fn ensure_sweeper(&self) {
        let mut sweeper = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if sweeper.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let pool = Arc::downgrade(&self.inner);
        let interval = self.inner.config.sweep_interval();
        *sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = Weak::upgrade(&pool) else {
                    return;
                };
                sweep(&inner, Instant::now()).await;
            }
        }));
    }

    /// Evict idle entries as of `now`. Returns how many were stopped.
    pub(crate) async fn sweep_idle_at(&self, now: Instant) -> usize {
        sweep(&self.inner, now).await
    }

    /// Stop idle sessions whose workspace root is a scratch directory.
    ///
    /// Referenced and initializing entries are left alone.
    pub async fn cleanup_temp_directory_clients(&self) -> usize {
        let temp_dir = std::env::temp_dir();
        let victims: Vec<(PoolKey, Arc<LspClient>)> = {
            let mut entries = self.inner.entries();
            let keys: Vec<PoolKey> = entries
                .iter()
                .filter(|(_, entry)| {
                    entry.is_evictable() && is_temp_root(entry.client.root(), &temp_dir)
                })
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| entries.remove(&key).map(|entry| (key, entry.client)))
                .collect()
        };

        let count = victims.len();
        for (key, _) in &victims {
            tracing::info!(%key, "stopping language server rooted in a temp directory");
        }
        join_all(victims.iter().map(|(_, client)| client.stop())).await;
        count
    }

    /// Stop every session concurrently and halt the idle sweep.
    pub async fn stop_all(&self) {
        if let Some(handle) = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }

        let drained: Vec<(PoolKey, ManagedEntry)> = self.inner.entries().drain().collect();
        if drained.is_empty() {
            return;
        }
        tracing::info!(count = drained.len(), "stopping all language servers");
        for (_, entry) in &drained {
            if let Some(init) = &entry.init {
                init.abort.abort();
            }
        }
        join_all(drained.iter().map(|(_, entry)| entry.client.stop())).await;
    }

    /// Hard-kill every child without waiting or blocking.
    ///
    /// For panic and teardown paths. If the table is locked elsewhere the
    /// call gives up rather than wait.
    pub fn force_kill_all(&self) {
        let entries = match self.inner.entries.try_lock() {
            Ok(entries) => entries,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return,
        };
        for entry in entries.values() {
            if let Some(init) = &entry.init {
                init.abort.abort();
            }
            entry.client.force_kill();
        }
    }
}

/// Non-owning reference to a [`ServerPool`], for hooks that may outlive it.
#[derive(Clone)]
pub(crate) struct WeakServerPool(Weak<PoolInner>);

impl WeakServerPool {
    pub(crate) fn upgrade(&self) -> Option<ServerPool> {
        self.0.upgrade().map(|inner| ServerPool { inner })
    }
}

impl ServerPool {
    pub(crate) fn downgrade(&self) -> WeakServerPool {
        WeakServerPool(Arc::downgrade(&self.inner))
    }
}

impl std::fmt::Debug for ServerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerPool")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

enum Step {
    Ready(Arc<LspClient>),
    Discard(Arc<LspClient>),
    Await {
        client: Arc<LspClient>,
        init: InitFuture,
    },
    Built {
        client: Arc<LspClient>,
        init: InitFuture,
    },
}

async fn sweep(inner: &PoolInner, now: Instant) -> usize {
    let idle = inner.take_idle(now);
    if idle.is_empty() {
        return 0;
    }
    for (key, _) in &idle {
        tracing::info!(%key, "evicting idle language server");
    }
    join_all(idle.iter().map(|(_, client)| client.stop())).await;
    idle.len()
}

fn pool_key(root: &Path, server: &ResolvedServer) -> PoolKey {
    PoolKey::new(&root.to_string_lossy(), server.id())
}

/// Absolute, no `.`/`..` segments, no trailing separator.
fn is_normal_form(root: &Path) -> bool {
    let rebuilt: PathBuf = root.components().collect();
    root.is_absolute()
        && rebuilt.as_os_str() == root.as_os_str()
        && !root
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::CurDir))
}

/// Whether `root` looks like a scratch directory.
fn is_temp_root(root: &Path, temp_dir: &Path) -> bool {
    if root.starts_with(temp_dir) {
        return true;
    }
    if root.to_string_lossy().contains("/var/folders/") {
        return true;
    }
    root.components().any(|c| match c {
        Component::Normal(name) => name
            .to_str()
            .is_some_and(|n| n.eq_ignore_ascii_case("tmp") || n.eq_ignore_ascii_case("temp")),
        _ => false,
    })
}
