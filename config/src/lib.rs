//! Harbor configuration: pool timings and language server definitions.
//!
//! Loaded from `~/.harbor/config.toml`, or from the path in `HARBOR_CONFIG`.

mod resolver;

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use harbor_lsp::PoolConfig;
use harbor_types::{EmptyCommandError, ResolvedServer};
use serde::Deserialize;

pub use resolver::ServerResolver;

/// Environment variable that overrides the config file location.
pub const CONFIG_PATH_ENV: &str = "HARBOR_CONFIG";

#[derive(Debug, Default, Deserialize)]
pub struct HarborConfig {
    pub pool: Option<PoolConfig>,
    /// Language servers keyed by identity (e.g. `ts`).
    #[serde(default)]
    pub servers: BTreeMap<String, ServerSettings>,
}

/// One `[servers.<id>]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    /// Executable followed by its arguments.
    pub command: Vec<String>,
    /// File extensions this server handles, without the dot.
    #[serde(default)]
    pub extensions: Vec<String>,
    /// Files or directories that mark a workspace root.
    #[serde(default)]
    pub root_markers: Vec<String>,
    /// Environment overrides; `${VAR}` references are expanded.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Sent as `initializationOptions`.
    pub initialization: Option<serde_json::Value>,
    /// Answers `workspace/configuration`.
    pub settings: Option<serde_json::Value>,
}

impl ServerSettings {
    fn builtin(command: &[&str], extensions: &[&str], root_markers: &[&str]) -> Self {
        let owned = |items: &[&str]| items.iter().map(|s| (*s).to_string()).collect();
        Self {
            command: owned(command),
            extensions: owned(extensions),
            root_markers: owned(root_markers),
            env: BTreeMap::new(),
            initialization: None,
            settings: None,
        }
    }

    /// Build the immutable server description handed to the pool.
    pub fn to_resolved(&self, id: &str) -> Result<ResolvedServer, EmptyCommandError> {
        let env = self
            .env
            .iter()
            .map(|(key, value)| (key.clone(), expand_env_vars(value)))
            .collect();
        let mut server = ResolvedServer::new(id, self.command.clone())?.with_env(env);
        if let Some(options) = &self.initialization {
            server = server.with_initialization(options.clone());
        }
        if let Some(settings) = &self.settings {
            server = server.with_settings(settings.clone());
        }
        Ok(server)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

/// Replace `${VAR}` with the variable's value (empty when unset).
///
/// An unterminated `${` is kept literally.
#[must_use]
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            break;
        };
        out.push_str(&rest[..start]);
        let var = &after[..end];
        if !var.is_empty() {
            out.push_str(&env::var(var).unwrap_or_default());
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

impl HarborConfig {
    /// Load from the default location. `Ok(None)` when no file exists.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        match config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(None),
        }
    }

    pub fn load_from(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        match toml::from_str(&content) {
            Ok(config) => Ok(Some(config)),
            Err(err) => {
                tracing::warn!("Failed to parse config at {:?}: {}", path, err);
                Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }

    #[must_use]
    pub fn path() -> Option<PathBuf> {
        config_path()
    }

    #[must_use]
    pub fn pool_config(&self) -> PoolConfig {
        self.pool.unwrap_or_default()
    }

    /// Configured servers, or the built-in table when none are configured.
    #[must_use]
    pub fn effective_servers(&self) -> BTreeMap<String, ServerSettings> {
        if self.servers.is_empty() {
            builtin_servers()
        } else {
            self.servers.clone()
        }
    }
}

fn builtin_servers() -> BTreeMap<String, ServerSettings> {
    BTreeMap::from([
        (
            "go".to_string(),
            ServerSettings::builtin(&["gopls"], &["go"], &["go.mod", "go.work"]),
        ),
        (
            "python".to_string(),
            ServerSettings::builtin(
                &["pyright-langserver", "--stdio"],
                &["py", "pyi"],
                &["pyproject.toml", "setup.py", "requirements.txt"],
            ),
        ),
        (
            "rust".to_string(),
            ServerSettings::builtin(&["rust-analyzer"], &["rs"], &["Cargo.toml"]),
        ),
        (
            "ts".to_string(),
            ServerSettings::builtin(
                &["typescript-language-server", "--stdio"],
                &["ts", "tsx", "js", "jsx", "mjs", "cjs"],
                &["tsconfig.json", "jsconfig.json", "package.json"],
            ),
        ),
    ])
}

/// `~/.harbor`, home of the default config file and the log directory.
#[must_use]
pub fn data_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".harbor"))
}

fn config_path() -> Option<PathBuf> {
    if let Some(path) = env::var_os(CONFIG_PATH_ENV).filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(path));
    }
    data_dir().map(|dir| dir.join("config.toml"))
}
