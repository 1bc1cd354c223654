//! Typed, read-only view over raw diagnostic payloads.
//!
//! Operations return the server's JSON untouched; this module is for callers
//! that want to render or count diagnostics.

use std::path::Path;

/// LSP diagnostic severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DiagnosticSeverity {
    Error = 1,
    Warning = 2,
    Information = 3,
    Hint = 4,
}

impl DiagnosticSeverity {
    /// Convert from LSP numeric severity (1=Error, 2=Warning, 3=Info, 4=Hint).
    ///
    /// Returns `None` for values outside the LSP-defined range.
    #[must_use]
    pub fn from_lsp(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::Error),
            2 => Some(Self::Warning),
            3 => Some(Self::Information),
            4 => Some(Self::Hint),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        self == Self::Error
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Information => "info",
            Self::Hint => "hint",
        }
    }
}

/// One diagnostic, positioned at its range start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    severity: DiagnosticSeverity,
    message: String,
    /// 0-indexed line number.
    line: u32,
    /// 0-indexed column.
    col: u32,
    source: String,
}

impl Diagnostic {
    /// Parse one LSP `Diagnostic` object.
    ///
    /// A missing severity is treated as an error, as the protocol leaves it to
    /// the client; a missing source becomes `"unknown"`. Returns `None` when
    /// there is no message or no usable range.
    #[must_use]
    pub fn from_lsp(raw: &serde_json::Value) -> Option<Self> {
        let message = raw.get("message")?.as_str()?.to_string();
        let start = raw.get("range")?.get("start")?;
        let line = u32::try_from(start.get("line")?.as_u64()?).ok()?;
        let col = u32::try_from(start.get("character")?.as_u64()?).ok()?;
        let severity = raw
            .get("severity")
            .and_then(serde_json::Value::as_u64)
            .and_then(DiagnosticSeverity::from_lsp)
            .unwrap_or(DiagnosticSeverity::Error);
        let source = raw
            .get("source")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        Some(Self {
            severity,
            message,
            line,
            col,
            source,
        })
    }

    #[must_use]
    pub fn severity(&self) -> DiagnosticSeverity {
        self.severity
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 0-indexed line number.
    #[must_use]
    pub fn line(&self) -> u32 {
        self.line
    }

    /// 0-indexed column.
    #[must_use]
    pub fn col(&self) -> u32 {
        self.col
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Format as `path:line:col: severity: [source] message` (1-indexed for display).
    #[must_use]
    pub fn display_with_path(&self, path: &Path) -> String {
        format!(
            "{}:{}:{}: {}: [{}] {}",
            path.display(),
            self.line + 1,
            self.col + 1,
            self.severity.label(),
            self.source,
            self.message,
        )
    }
}

/// Extract diagnostics from a document report (`{"kind": "full", "items": [...]}`)
/// or a bare array, skipping malformed entries. Sorted by position.
#[must_use]
pub fn parse_report(report: &serde_json::Value) -> Vec<Diagnostic> {
    let items = report
        .get("items")
        .unwrap_or(report)
        .as_array()
        .map_or(&[][..], Vec::as_slice);
    let mut diagnostics: Vec<Diagnostic> = items.iter().filter_map(Diagnostic::from_lsp).collect();
    diagnostics.sort_by_key(|d| (d.line, d.col, d.severity));
    diagnostics
}
