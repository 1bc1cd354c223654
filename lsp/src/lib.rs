//! Pooled language server sessions.
//!
//! [`ServerPool`] hands out [`LspClient`]s keyed by workspace root and server
//! identity, spawning servers on demand and reclaiming idle ones.

pub mod codec;
pub mod diagnostics;
pub mod transport;
pub mod types;

pub(crate) mod connection;
pub(crate) mod protocol;

mod client;
mod error;
mod hooks;
mod pool;

#[cfg(test)]
mod testing;

pub use client::LspClient;
pub use diagnostics::{Diagnostic, DiagnosticSeverity};
pub use error::{LspError, SpawnError};
pub use hooks::ExitHooks;
pub use pool::ServerPool;
pub use protocol::language_id_for_path;
pub use transport::{KillSignal, ProcessExit, ProcessHandle, SpawnBackend, SpawnOptions};
pub use types::{ClientState, PoolConfig, PoolStats, SpawnBackendPreference};
