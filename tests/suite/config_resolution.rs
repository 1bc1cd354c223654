//! Config file → resolver → pool inputs, through the public API only.

use harbor_config::{ConfigError, HarborConfig, ServerResolver};
use harbor_lsp::SpawnBackendPreference;
use tempfile::tempdir;

use crate::common::write_file;

const CONFIG: &str = r#"
[pool]
request_timeout_ms = 5000
idle_timeout_secs = 120
spawn_backend = "tokio"

[servers.ts]
command = ["typescript-language-server", "--stdio"]
extensions = ["ts", "tsx"]
root_markers = ["tsconfig.json", "package.json"]
settings = { typescript = { format = { enable = true } } }

[servers.python]
command = ["pyright-langserver", "--stdio"]
extensions = ["py"]
root_markers = ["pyproject.toml"]
"#;

#[test]
fn configured_servers_resolve_to_marker_roots() {
    let dir = tempdir().unwrap();
    let config_path = write_file(dir.path(), "config.toml", CONFIG);
    let web = dir.path().join("web");
    write_file(&web, "package.json", "{}");
    let file = write_file(&web, "src/app/main.tsx", "export {}\n");

    let config = HarborConfig::load_from(&config_path).unwrap().unwrap();
    let resolver = ServerResolver::new(&config);

    let (root, server) = resolver.resolve(&file).unwrap();
    assert_eq!(root, web);
    assert_eq!(server.id(), "ts");
    assert_eq!(server.command(), ["typescript-language-server", "--stdio"]);
    assert_eq!(
        server.settings().unwrap()["typescript"]["format"]["enable"],
        true
    );

    assert!(resolver.resolve(&dir.path().join("notes.md")).is_none());
}

#[test]
fn pool_table_overrides_only_named_fields() {
    let dir = tempdir().unwrap();
    let config_path = write_file(dir.path(), "config.toml", CONFIG);

    let pool = HarborConfig::load_from(&config_path)
        .unwrap()
        .unwrap()
        .pool_config();
    assert_eq!(pool.request_timeout_ms, 5000);
    assert_eq!(pool.idle_timeout_secs, 120);
    assert_eq!(pool.spawn_backend, SpawnBackendPreference::Tokio);
    assert_eq!(pool.stale_init_secs, 60);
    assert_eq!(pool.graceful_stop_ms, 5000);
}

#[test]
fn missing_config_uses_builtin_servers() {
    let config = HarborConfig::default();
    let resolver = ServerResolver::new(&config);
    let dir = tempdir().unwrap();
    let file = write_file(dir.path(), "lib.rs", "fn main() {}\n");

    let (root, server) = resolver.resolve(&file).unwrap();
    assert_eq!(server.id(), "rust");
    assert_eq!(root, dir.path());
}

#[test]
fn unreadable_config_reports_its_path() {
    let dir = tempdir().unwrap();
    let config_path = write_file(dir.path(), "config.toml", "[pool\n");

    match HarborConfig::load_from(&config_path) {
        Err(err @ ConfigError::Parse { .. }) => assert_eq!(err.path(), config_path),
        other => panic!("expected parse error, got {other:?}"),
    }
}
