//! Error taxonomy for spawning, handshaking with, and querying language servers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Failures that happen before a session ever speaks the protocol.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SpawnError {
    #[error("invalid working directory {}: {reason}", path.display())]
    InvalidCwd { path: PathBuf, reason: String },

    #[error("empty command line")]
    EmptyCommand,

    #[error("language server binary '{binary}' not found in PATH. {hint}")]
    BinaryNotFound { binary: String, hint: String },

    #[error("failed to spawn '{binary}'")]
    Io {
        binary: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("'{binary}' exited immediately (code {code:?}){}", format_tail(stderr))]
    ExitedImmediately {
        binary: String,
        code: Option<i32>,
        stderr: Vec<String>,
    },
}

/// Errors surfaced by [`crate::LspClient`] operations and [`crate::ServerPool::get_client`].
///
/// `Clone` so that callers coalesced onto one in-flight initialization can
/// share the same outcome.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LspError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("initialization of '{server}' failed: {message}")]
    Initialization { server: String, message: String },

    #[error("LSP request '{method}' timed out after {}ms{}", timeout.as_millis(), format_tail(stderr_tail))]
    RequestTimeout {
        method: String,
        timeout: Duration,
        stderr_tail: Vec<String>,
    },

    #[error("LSP request '{method}' failed ({code}): {message}{}", format_tail(stderr_tail))]
    RequestFailed {
        method: String,
        code: i64,
        message: String,
        stderr_tail: Vec<String>,
    },

    #[error("language server process has exited; cannot send '{method}'")]
    ProcessExited { method: String },

    /// Internal recovery signal only; logged and replaced by a fresh attempt.
    #[error("initialization of '{key}' exceeded {}s", after.as_secs())]
    StaleInitialization { key: String, after: Duration },

    #[error("path must be absolute: {}", path.display())]
    InvalidPath { path: PathBuf },

    #[error("failed to read {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },
}

impl LspError {
    /// JSON-RPC `MethodNotFound`.
    pub(crate) const METHOD_NOT_FOUND: i64 = -32601;

    /// Whether the server rejected the method as unsupported.
    #[must_use]
    pub fn is_method_not_found(&self) -> bool {
        matches!(self, Self::RequestFailed { code, .. } if *code == Self::METHOD_NOT_FOUND)
    }
}

fn format_tail(lines: &[String]) -> String {
    if lines.is_empty() {
        String::new()
    } else {
        format!("\nrecent stderr:\n{}", lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_embeds_stderr_tail() {
        let err = LspError::RequestTimeout {
            method: "textDocument/definition".into(),
            timeout: Duration::from_secs(15),
            stderr_tail: vec!["panic: index out of range".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("textDocument/definition"));
        assert!(msg.contains("15000ms"));
        assert!(msg.contains("panic: index out of range"));
    }

    #[test]
    fn timeout_message_without_stderr_has_no_trailer() {
        let err = LspError::RequestTimeout {
            method: "initialize".into(),
            timeout: Duration::from_millis(250),
            stderr_tail: vec![],
        };
        assert_eq!(err.to_string(), "LSP request 'initialize' timed out after 250ms");
    }

    #[test]
    fn method_not_found_detection() {
        let err = LspError::RequestFailed {
            method: "textDocument/diagnostic".into(),
            code: -32601,
            message: "Unhandled method".into(),
            stderr_tail: vec![],
        };
        assert!(err.is_method_not_found());
        assert!(!LspError::ProcessExited { method: "x".into() }.is_method_not_found());
    }

    #[test]
    fn binary_not_found_names_binary_and_hint() {
        let err = SpawnError::BinaryNotFound {
            binary: "pyright-langserver".into(),
            hint: "Install it with `npm i -g pyright`.".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("pyright-langserver"));
        assert!(msg.contains("npm i -g pyright"));
    }
}
