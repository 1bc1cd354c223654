//! Harbor CLI - one-shot language server queries through the server pool.
//!
//! ```text
//! main() -> resolve server + root -> ServerPool::get_client -> operation
//!                                         |
//!                                         v
//!                          print JSON -> release -> stop_all
//! ```
//!
//! Logs go to `~/.harbor/logs/harbor.log`; stdout carries only results.

mod args;

use std::{
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use args::{Cli, Operation};
use harbor_config::{HarborConfig, ServerResolver};
use harbor_lsp::{ExitHooks, LspClient, ServerPool, diagnostics};

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (log_file, init_warnings) = open_harbor_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // No log file: stay silent rather than mix logs into the JSON on stdout.
    tracing_subscriber::registry().with(env_filter).init();
}

fn open_harbor_log_file() -> (Option<(PathBuf, std::fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in harbor_log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&candidate)
        {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn harbor_log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    // Primary: ~/.harbor/logs/harbor.log
    if let Some(data_dir) = harbor_config::data_dir() {
        candidates.push(data_dir.join("logs").join("harbor.log"));
    }

    // Fallback: ./.harbor/logs/harbor.log
    candidates.push(PathBuf::from(".harbor").join("logs").join("harbor.log"));

    candidates
}

async fn run_operation(
    client: &LspClient,
    operation: &Operation,
    file: &Path,
) -> Result<serde_json::Value, harbor_lsp::LspError> {
    match operation {
        Operation::Definition {
            line, character, ..
        } => client.definition(file, *line, *character).await,
        Operation::References {
            line,
            character,
            include_declaration,
            ..
        } => {
            client
                .references(file, *line, *character, *include_declaration)
                .await
        }
        Operation::Symbols { .. } => client.document_symbols(file).await,
        Operation::WorkspaceSymbols { query, .. } => {
            client
                .workspace_symbols(query.as_deref().unwrap_or_default())
                .await
        }
        Operation::Diagnostics { .. } => client.diagnostics(file).await,
        Operation::PrepareRename {
            line, character, ..
        } => client.prepare_rename(file, *line, *character).await,
        Operation::Rename {
            line,
            character,
            new_name,
            ..
        } => client.rename(file, *line, *character, new_name).await,
    }
}

fn print_result(cli: &Cli, file: &Path, value: &serde_json::Value) -> Result<()> {
    if cli.human && matches!(cli.operation, Operation::Diagnostics { .. }) {
        for diagnostic in diagnostics::parse_report(value) {
            println!("{}", diagnostic.display_with_path(file));
        }
        return Ok(());
    }
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serializing result")?
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = match HarborConfig::load() {
        Ok(Some(config)) => config,
        Ok(None) => {
            tracing::info!(path = ?HarborConfig::path(), "no config file; using built-in servers");
            HarborConfig::default()
        }
        Err(err) => {
            eprintln!("warning: {err}; using defaults");
            HarborConfig::default()
        }
    };

    let requested = cli.operation.file();
    let file = std::path::absolute(requested)
        .with_context(|| format!("resolving {}", requested.display()))?;
    let resolver = ServerResolver::new(&config);
    let (root, server) = resolver
        .resolve(&file)
        .with_context(|| format!("no language server configured for {}", file.display()))?;
    tracing::info!(
        server = %server.id(),
        binary = server.binary(),
        args = ?server.args(),
        root = %root.display(),
        "running query"
    );

    let pool = ServerPool::new(config.pool_config());
    let _hooks = ExitHooks::install(&pool);

    let outcome = match pool.get_client(&root, &server).await {
        Ok(client) => {
            let result = run_operation(&client, &cli.operation, &file).await;
            pool.release_client(&root, &server);
            result
        }
        Err(err) => Err(err),
    };
    pool.stop_all().await;

    let value = outcome.with_context(|| format!("{} query failed", server.id()))?;
    print_result(&cli, &file, &value)
}
