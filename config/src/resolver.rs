//! Map a file to the server that handles it and the workspace root it lives in.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use harbor_types::ResolvedServer;

use crate::{HarborConfig, ServerSettings};

struct Candidate {
    server: ResolvedServer,
    root_markers: Vec<String>,
}

pub struct ServerResolver {
    servers: BTreeMap<String, Candidate>,
    /// Maps file extension (e.g. "ts") → server id (e.g. "ts").
    extension_map: HashMap<String, String>,
}

fn normalize_extension(ext: &str) -> String {
    ext.trim_start_matches('.').to_ascii_lowercase()
}

/// Build extension → server id map. Overlaps go to the alphabetically first server.
fn build_extension_map(servers: &BTreeMap<String, ServerSettings>) -> HashMap<String, String> {
    let mut extension_map = HashMap::new();
    for (name, settings) in servers {
        for ext in settings.extensions.iter().map(|e| normalize_extension(e)) {
            if let Some(existing) = extension_map.get(&ext) {
                tracing::warn!(
                    "Multiple language servers configured for extension '{ext}': '{existing}' and '{name}'. Using '{existing}'."
                );
                continue;
            }
            extension_map.insert(ext, name.clone());
        }
    }
    extension_map
}

impl ServerResolver {
    #[must_use]
    pub fn new(config: &HarborConfig) -> Self {
        Self::from_servers(&config.effective_servers())
    }

    /// Servers with an empty command are skipped with a warning.
    #[must_use]
    pub fn from_servers(settings: &BTreeMap<String, ServerSettings>) -> Self {
        let mut usable = BTreeMap::new();
        let mut servers = BTreeMap::new();
        for (id, entry) in settings {
            match entry.to_resolved(id) {
                Ok(server) => {
                    usable.insert(id.clone(), entry.clone());
                    servers.insert(
                        id.clone(),
                        Candidate {
                            server,
                            root_markers: entry.root_markers.clone(),
                        },
                    );
                }
                Err(e) => tracing::warn!("Skipping language server '{id}': {e}"),
            }
        }
        Self {
            extension_map: build_extension_map(&usable),
            servers,
        }
    }

    /// Server id that handles `path`, by extension.
    #[must_use]
    pub fn server_id_for(&self, path: &Path) -> Option<&str> {
        let ext = normalize_extension(path.extension()?.to_str()?);
        self.extension_map.get(&ext).map(String::as_str)
    }

    /// Workspace root and server for `path`, or `None` when no server handles it.
    ///
    /// The root is the nearest ancestor containing one of the server's root
    /// markers, else the file's own directory.
    #[must_use]
    pub fn resolve(&self, path: &Path) -> Option<(PathBuf, ResolvedServer)> {
        let id = self.server_id_for(path)?;
        let candidate = self.servers.get(id)?;
        let start = path.parent()?;
        let root = find_root(start, &candidate.root_markers).unwrap_or_else(|| start.to_path_buf());
        Some((root, candidate.server.clone()))
    }
}

fn find_root(start: &Path, markers: &[String]) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| markers.iter().any(|marker| dir.join(marker).exists()))
        .map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(command: &[&str], extensions: &[&str], markers: &[&str]) -> ServerSettings {
        ServerSettings::builtin(command, extensions, markers)
    }

    #[test]
    fn overlapping_extensions_go_to_first_server_alphabetically() {
        let servers = BTreeMap::from([
            ("vtsls".to_string(), settings(&["vtsls"], &["ts"], &[])),
            ("deno".to_string(), settings(&["deno", "lsp"], &["ts", "js"], &[])),
        ]);
        let resolver = ServerResolver::from_servers(&servers);
        assert_eq!(resolver.server_id_for(Path::new("/a/b.ts")), Some("deno"));
        assert_eq!(resolver.server_id_for(Path::new("/a/b.JS")), Some("deno"));
        assert_eq!(resolver.server_id_for(Path::new("/a/b.rs")), None);
        assert_eq!(resolver.server_id_for(Path::new("/a/Makefile")), None);
    }

    #[test]
    fn dotted_extensions_are_normalized() {
        let servers = BTreeMap::from([("py".to_string(), settings(&["pylsp"], &[".py"], &[]))]);
        let resolver = ServerResolver::from_servers(&servers);
        assert_eq!(resolver.server_id_for(Path::new("x.py")), Some("py"));
    }

    #[test]
    fn empty_commands_are_skipped() {
        let servers = BTreeMap::from([
            ("broken".to_string(), settings(&[], &["ts"], &[])),
            ("ts".to_string(), settings(&["tsls"], &["ts"], &[])),
        ]);
        let resolver = ServerResolver::from_servers(&servers);
        assert_eq!(resolver.server_id_for(Path::new("a.ts")), Some("ts"));
        let (_, server) = resolver.resolve(Path::new("/repo/a.ts")).unwrap();
        assert_eq!(server.id(), "ts");
    }

    #[test]
    fn root_is_nearest_marker_ancestor() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("project");
        let nested = project.join("src").join("deep");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(project.join("package.json"), "{}").unwrap();
        let file = nested.join("index.ts");
        std::fs::write(&file, "").unwrap();

        let servers = BTreeMap::from([(
            "ts".to_string(),
            settings(&["tsls", "--stdio"], &["ts"], &["tsconfig.json", "package.json"]),
        )]);
        let (root, server) = ServerResolver::from_servers(&servers).resolve(&file).unwrap();
        assert_eq!(root, project);
        assert_eq!(server.id(), "ts");
        assert_eq!(server.args(), ["--stdio".to_string()]);
    }

    #[test]
    fn root_falls_back_to_file_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("lonely.ts");
        std::fs::write(&file, "").unwrap();

        let servers = BTreeMap::from([(
            "ts".to_string(),
            settings(&["tsls"], &["ts"], &["harbor-marker-that-does-not-exist"]),
        )]);
        let (root, _) = ServerResolver::from_servers(&servers).resolve(&file).unwrap();
        assert_eq!(root, dir.path());
    }
}
