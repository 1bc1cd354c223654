//! Public configuration and status types.
//!
//! [`PoolConfig`] is deserialized from the `[pool]` table of the Harbor config
//! file; every field is optional and defaults to the production timings.

use std::time::Duration;

use serde::Deserialize;

/// Which process-spawn primitive to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpawnBackendPreference {
    /// Pick by platform (`tokio` everywhere except Windows).
    #[default]
    Auto,
    Tokio,
    Blocking,
}

/// Timings and limits for the server pool and its sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Per-request response timeout.
    pub request_timeout_ms: u64,
    /// A process that exits within this window after spawn is a spawn failure.
    pub startup_grace_ms: u64,
    /// Pause after the handshake before the session is usable.
    pub initialize_settle_ms: u64,
    /// Pause after the first `didOpen` of a document.
    pub open_settle_ms: u64,
    /// Pause before pulling diagnostics.
    pub diagnostics_settle_ms: u64,
    /// Time allowed for exit after terminate during `stop()`.
    pub graceful_stop_ms: u64,
    /// Time allowed for exit after kill during `stop()`.
    pub forced_stop_ms: u64,
    /// Initializations older than this are discarded as hung.
    pub stale_init_secs: u64,
    /// Unreferenced entries idle longer than this are evicted.
    pub idle_timeout_secs: u64,
    /// Idle sweep tick.
    pub sweep_interval_secs: u64,
    pub spawn_backend: SpawnBackendPreference,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 15_000,
            startup_grace_ms: 100,
            initialize_settle_ms: 300,
            open_settle_ms: 1_000,
            diagnostics_settle_ms: 500,
            graceful_stop_ms: 5_000,
            forced_stop_ms: 1_000,
            stale_init_secs: 60,
            idle_timeout_secs: 300,
            sweep_interval_secs: 60,
            spawn_backend: SpawnBackendPreference::Auto,
        }
    }
}

impl PoolConfig {
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    #[must_use]
    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    #[must_use]
    pub fn initialize_settle(&self) -> Duration {
        Duration::from_millis(self.initialize_settle_ms)
    }

    #[must_use]
    pub fn open_settle(&self) -> Duration {
        Duration::from_millis(self.open_settle_ms)
    }

    #[must_use]
    pub fn diagnostics_settle(&self) -> Duration {
        Duration::from_millis(self.diagnostics_settle_ms)
    }

    #[must_use]
    pub fn graceful_stop(&self) -> Duration {
        Duration::from_millis(self.graceful_stop_ms)
    }

    #[must_use]
    pub fn forced_stop(&self) -> Duration {
        Duration::from_millis(self.forced_stop_ms)
    }

    #[must_use]
    pub fn stale_init_after(&self) -> Duration {
        Duration::from_secs(self.stale_init_secs)
    }

    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Sweep tick, never zero so the interval timer stays valid.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Lifecycle of one language server session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Unstarted,
    Starting,
    Initializing,
    Ready,
    Stopped,
}

impl ClientState {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Unstarted => "unstarted",
            Self::Starting => "starting",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Stopped => "stopped",
        }
    }
}

/// Point-in-time counts over the pool's entry table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub entries: usize,
    pub initializing: usize,
    pub referenced: usize,
}
