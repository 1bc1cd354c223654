//! Core domain types for Harbor.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! The resolver layer produces [`ResolvedServer`]s; the pool keys sessions by [`PoolKey`].

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Resolved server
// ============================================================================

#[derive(Debug, Error)]
#[error("server '{id}' has an empty command line")]
pub struct EmptyCommandError {
    id: String,
}

/// A fully resolved language server launch description.
///
/// Produced by an external resolver for one workspace root. The pool treats it
/// as immutable input and never discovers servers on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedServer {
    id: String,
    command: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    initialization: Option<serde_json::Value>,
    #[serde(default)]
    settings: Option<serde_json::Value>,
}

impl ResolvedServer {
    /// Construct a server description. The command must contain at least the binary.
    pub fn new(id: impl Into<String>, command: Vec<String>) -> Result<Self, EmptyCommandError> {
        let id = id.into();
        if command.first().is_none_or(|bin| bin.trim().is_empty()) {
            return Err(EmptyCommandError { id });
        }
        Ok(Self {
            id,
            command,
            env: BTreeMap::new(),
            initialization: None,
            settings: None,
        })
    }

    #[must_use]
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    #[must_use]
    pub fn with_initialization(mut self, options: serde_json::Value) -> Self {
        self.initialization = Some(options);
        self
    }

    #[must_use]
    pub fn with_settings(mut self, settings: serde_json::Value) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Server identity (e.g. "ts", "rust").
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Full argument vector; the first element is the executable.
    #[must_use]
    pub fn command(&self) -> &[String] {
        &self.command
    }

    #[must_use]
    pub fn binary(&self) -> &str {
        self.command.first().map_or("", String::as_str)
    }

    #[must_use]
    pub fn args(&self) -> &[String] {
        self.command.get(1..).unwrap_or_default()
    }

    /// Environment overrides applied on top of the sanitized inherited environment.
    #[must_use]
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// `initializationOptions` sent in the handshake.
    #[must_use]
    pub fn initialization(&self) -> Option<&serde_json::Value> {
        self.initialization.as_ref()
    }

    /// Settings table used to answer `workspace/configuration`.
    #[must_use]
    pub fn settings(&self) -> Option<&serde_json::Value> {
        self.settings.as_ref()
    }
}

// ============================================================================
// Pool key
// ============================================================================

/// Cache key for one pooled session: `"{root}::{server id}"`.
///
/// Built from the raw root string. Two spellings of the same directory
/// (trailing slash, `..` segments, symlinks) produce two distinct keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolKey(String);

impl PoolKey {
    #[must_use]
    pub fn new(root: &str, server_id: &str) -> Self {
        Self(format!("{root}::{server_id}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Environment hygiene
// ============================================================================

/// Environment variable patterns that must never leak into child processes.
///
/// Patterns support a leading and/or trailing `*` wildcard and are matched
/// case-insensitively.
pub const ENV_SECRET_DENYLIST: &[&str] = &[
    "*_API_KEY",
    "*_APIKEY",
    "*_SECRET",
    "*_SECRET_KEY",
    "*_TOKEN",
    "*_PASSWORD",
    "*_CREDENTIAL*",
    "AWS_*",
    "ANTHROPIC_*",
    "OPENAI_*",
    "GITHUB_TOKEN",
];

/// Minimal glob matcher for env var denylist patterns.
/// Handles `*_SUFFIX`, `PREFIX_*`, `*_INFIX*`, and exact match.
fn env_glob_matches(pattern: &str, key_upper: &str) -> bool {
    let pat = pattern.to_uppercase();
    match (pat.starts_with('*'), pat.ends_with('*')) {
        (true, true) if pat.len() >= 2 => key_upper.contains(&pat[1..pat.len() - 1]),
        (true, _) => key_upper.ends_with(&pat[1..]),
        (false, true) => key_upper.starts_with(&pat[..pat.len() - 1]),
        (false, false) => key_upper == pat,
    }
}

/// Whether an inherited environment variable should be stripped before spawning.
#[must_use]
pub fn is_secret_env_var(key: &str) -> bool {
    let upper = key.to_uppercase();
    ENV_SECRET_DENYLIST
        .iter()
        .any(|pat| env_glob_matches(pat, &upper))
}
