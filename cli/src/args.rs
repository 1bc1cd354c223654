//! Command-line interface for the one-shot query driver.

use std::path::{Path, PathBuf};

use clap::{ArgAction, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "harbor")]
#[command(about = "Query a language server through the shared server pool")]
#[command(after_help = "Lines are 1-indexed; characters are 0-indexed columns.")]
pub struct Cli {
    /// Print diagnostics as `path:line:col:` lines instead of JSON
    #[arg(long, global = true)]
    pub human: bool,

    #[command(subcommand)]
    pub operation: Operation,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Operation {
    /// Go to the definition of the symbol at a position
    Definition {
        file: PathBuf,
        line: u32,
        character: u32,
    },
    /// Find references to the symbol at a position
    References {
        file: PathBuf,
        line: u32,
        character: u32,
        /// Include the declaration itself
        #[arg(action = ArgAction::Set, default_value_t = true)]
        include_declaration: bool,
    },
    /// List the symbols declared in a file
    Symbols { file: PathBuf },
    /// Search symbols across the file's workspace
    WorkspaceSymbols {
        file: PathBuf,
        /// Symbol name filter; empty matches everything
        query: Option<String>,
    },
    /// Report diagnostics for a file
    Diagnostics { file: PathBuf },
    /// Check whether the symbol at a position can be renamed
    PrepareRename {
        file: PathBuf,
        line: u32,
        character: u32,
    },
    /// Compute the edits that rename the symbol at a position
    Rename {
        file: PathBuf,
        line: u32,
        character: u32,
        new_name: String,
    },
}

impl Operation {
    /// The file that selects the server and workspace root.
    #[must_use]
    pub fn file(&self) -> &Path {
        match self {
            Self::Definition { file, .. }
            | Self::References { file, .. }
            | Self::Symbols { file }
            | Self::WorkspaceSymbols { file, .. }
            | Self::Diagnostics { file }
            | Self::PrepareRename { file, .. }
            | Self::Rename { file, .. } => file,
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    fn parse_str(line: &str) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("harbor").chain(line.split_whitespace()))
    }

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_position_operations() {
        let cli = parse_str("definition src/a.ts 12 4").unwrap();
        assert_eq!(
            cli.operation,
            Operation::Definition {
                file: PathBuf::from("src/a.ts"),
                line: 12,
                character: 4
            }
        );
        assert_eq!(cli.operation.file(), Path::new("src/a.ts"));
        assert!(!cli.human);
    }

    #[test]
    fn references_include_declaration_defaults_to_true() {
        let cli = parse_str("references a.ts 1 0").unwrap();
        assert!(matches!(
            cli.operation,
            Operation::References {
                include_declaration: true,
                ..
            }
        ));
        let cli = parse_str("references a.ts 1 0 false").unwrap();
        assert!(matches!(
            cli.operation,
            Operation::References {
                include_declaration: false,
                ..
            }
        ));
        assert!(parse_str("references a.ts 1 0 maybe").is_err());
    }

    #[test]
    fn rename_requires_new_name() {
        assert!(parse_str("rename a.ts 3 2").is_err());
        let cli = parse_str("rename a.ts 3 2 fresh").unwrap();
        assert_eq!(
            cli.operation,
            Operation::Rename {
                file: PathBuf::from("a.ts"),
                line: 3,
                character: 2,
                new_name: "fresh".into()
            }
        );
    }

    #[test]
    fn human_flag_before_or_after_operation() {
        let cli = parse_str("--human diagnostics a.ts").unwrap();
        assert!(cli.human);
        let cli = parse_str("diagnostics --human a.ts").unwrap();
        assert!(cli.human);
        assert_eq!(
            cli.operation,
            Operation::Diagnostics {
                file: PathBuf::from("a.ts")
            }
        );
    }

    #[test]
    fn workspace_symbols_query_is_optional() {
        let cli = parse_str("workspace-symbols a.ts").unwrap();
        assert!(matches!(cli.operation, Operation::WorkspaceSymbols { query: None, .. }));
        let cli = parse_str("workspace-symbols a.ts Widget").unwrap();
        assert!(matches!(
            cli.operation,
            Operation::WorkspaceSymbols { query: Some(ref q), .. } if q == "Widget"
        ));
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse_str("").is_err());
        assert!(parse_str("definition").is_err());
        assert!(parse_str("definition a.ts x 1").is_err());
        assert!(parse_str("definition a.ts 1").is_err());
        assert!(parse_str("definition a.ts -1 0").is_err());
        assert!(parse_str("hover a.ts 1 1").is_err());
        assert!(parse_str("symbols a.ts --verbose").is_err());
    }
}
