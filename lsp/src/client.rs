//! One workspace-scoped language server session.
//!
//! An [`LspClient`] owns the server process, its protocol connection, and the
//! per-document synchronization state. Every operation takes `&self` so the
//! pool can hand the same client to several callers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use harbor_types::ResolvedServer;
use tokio::task::JoinHandle;

use crate::connection::{self, Connection, SessionShared, STDERR_TAIL_LINES};
use crate::error::{LspError, SpawnError};
use crate::protocol;
use crate::transport::{KillSignal, Launcher, ProcessHandle, SpawnBackend, SpawnOptions, missing_pipe};
use crate::types::{ClientState, PoolConfig};

#[derive(Debug)]
struct DocumentState {
    version: i32,
    text: String,
}

/// LSP lines are 0-indexed; callers speak 1-indexed editor lines.
fn to_protocol_line(line: u32) -> u32 {
    line.saturating_sub(1)
}

pub struct LspClient {
    root: PathBuf,
    server: ResolvedServer,
    config: PoolConfig,
    launcher: Launcher,
    shared: Arc<SessionShared>,
    state: Mutex<ClientState>,
    process: Mutex<Option<Arc<ProcessHandle>>>,
    connection: Mutex<Option<Arc<Connection>>>,
    stderr_task: Mutex<Option<JoinHandle<()>>>,
    capabilities: Mutex<Option<serde_json::Value>>,
    /// Held across sync notifications so one document's versions stay ordered.
    documents: tokio::sync::Mutex<HashMap<PathBuf, DocumentState>>,
}

impl LspClient {
    #[must_use]
    pub fn new(root: PathBuf, server: ResolvedServer, config: PoolConfig) -> Self {
        let backend = SpawnBackend::from_preference(config.spawn_backend);
        Self::with_launcher(root, server, config, Launcher::Backend(backend))
    }

    pub(crate) fn with_launcher(
        root: PathBuf,
        server: ResolvedServer,
        config: PoolConfig,
        launcher: Launcher,
    ) -> Self {
        Self {
            root,
            server,
            config,
            launcher,
            shared: Arc::new(SessionShared::default()),
            state: Mutex::new(ClientState::Unstarted),
            process: Mutex::new(None),
            connection: Mutex::new(None),
            stderr_task: Mutex::new(None),
            capabilities: Mutex::new(None),
            documents: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn server_id(&self) -> &str {
        self.server.id()
    }

    #[must_use]
    pub fn state(&self) -> ClientState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ClientState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
        tracing::debug!(server = %self.server.id(), state = state.label(), "client state changed");
    }

    /// The most recent `n` lines the server wrote to stderr.
    #[must_use]
    pub fn stderr_tail(&self, n: usize) -> Vec<String> {
        self.shared.stderr_tail(n)
    }

    /// Capabilities returned by the server's `initialize` response.
    #[must_use]
    pub fn capabilities(&self) -> Option<serde_json::Value> {
        self.capabilities
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Diagnostics most recently pushed for `path`, if any.
    #[must_use]
    pub fn cached_diagnostics(&self, path: &Path) -> Option<serde_json::Value> {
        let uri = protocol::path_to_file_uri(path).ok()?;
        self.shared.diagnostics_for(uri.as_str())
    }

    fn process(&self) -> Option<Arc<ProcessHandle>> {
        self.process
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn connection(&self, method: &str) -> Result<Arc<Connection>, LspError> {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| LspError::ProcessExited {
                method: method.to_string(),
            })
    }

    /// Spawn the server in the workspace root and wire up its streams.
    pub async fn start(&self) -> Result<(), LspError> {
        self.set_state(ClientState::Starting);
        match self.spawn_session().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.set_state(ClientState::Stopped);
                Err(e.into())
            }
        }
    }

    async fn spawn_session(&self) -> Result<(), SpawnError> {
        let options = SpawnOptions {
            cwd: &self.root,
            env: self.server.env(),
        };
        let mut process = self.launcher.launch(self.server.command(), &options)?;
        let binary = process.binary().to_string();

        let stdin = process
            .take_stdin()
            .ok_or_else(|| missing_pipe(&binary, "stdin"))?;
        let stdout = process
            .take_stdout()
            .ok_or_else(|| missing_pipe(&binary, "stdout"))?;
        let stderr = process
            .take_stderr()
            .ok_or_else(|| missing_pipe(&binary, "stderr"))?;

        let mut stderr_task = connection::spawn_stderr_capture(
            self.server.id().to_string(),
            stderr,
            self.shared.clone(),
        );

        tokio::time::sleep(self.config.startup_grace()).await;
        if let Some(exit) = process.exit_status() {
            // The pipe closes with the process; let the capture finish reading.
            if tokio::time::timeout(self.config.startup_grace(), &mut stderr_task)
                .await
                .is_err()
            {
                stderr_task.abort();
            }
            tracing::warn!(server = %self.server.id(), code = ?exit.code, "language server exited during startup");
            return Err(SpawnError::ExitedImmediately {
                binary,
                code: exit.code,
                stderr: self.shared.stderr_tail(STDERR_TAIL_LINES),
            });
        }

        let connection = Connection::start(
            self.server.id().to_string(),
            stdin,
            stdout,
            self.shared.clone(),
            self.server.settings().cloned(),
            self.config.request_timeout(),
        );

        tracing::info!(
            server = %self.server.id(),
            root = %self.root.display(),
            pid = ?process.pid(),
            "language server spawned"
        );
        *self.process.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(process));
        *self.connection.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(connection));
        *self.stderr_task.lock().unwrap_or_else(PoisonError::into_inner) = Some(stderr_task);
        Ok(())
    }

    /// Run the `initialize` / `initialized` handshake.
    pub async fn initialize(&self) -> Result<(), LspError> {
        self.set_state(ClientState::Initializing);
        match self.handshake().await {
            Ok(()) => {
                self.set_state(ClientState::Ready);
                tracing::info!(server = %self.server.id(), root = %self.root.display(), "language server initialized");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(server = %self.server.id(), "initialization failed: {e}");
                Err(LspError::Initialization {
                    server: self.server.id().to_string(),
                    message: e.to_string(),
                })
            }
        }
    }

    async fn handshake(&self) -> Result<(), LspError> {
        let conn = self.connection("initialize")?;
        let root_uri =
            protocol::path_to_file_uri(&self.root).map_err(|_| LspError::InvalidPath {
                path: self.root.clone(),
            })?;

        let params = protocol::initialize_params(root_uri.as_str(), self.server.initialization());
        let response = conn.send_request("initialize", Some(params)).await?;
        let capabilities = response
            .get("capabilities")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}));
        *self.capabilities.lock().unwrap_or_else(PoisonError::into_inner) = Some(capabilities);

        conn.send_notification("initialized", Some(serde_json::json!({})))
            .await?;
        conn.send_notification(
            "workspace/didChangeConfiguration",
            Some(protocol::did_change_configuration_params(self.server.settings())),
        )
        .await?;

        tokio::time::sleep(self.config.initialize_settle()).await;
        Ok(())
    }

    /// Make the server's view of `path` match the file on disk.
    pub async fn open_file(&self, path: &Path) -> Result<(), LspError> {
        self.sync_document(path).await.map(|_| ())
    }

    /// Sync `path` and return its URI.
    ///
    /// First reference opens the full text at version 1. Later calls are a
    /// no-op when the text is unchanged, otherwise a full-text change at the
    /// next version followed by a save.
    async fn sync_document(&self, path: &Path) -> Result<String, LspError> {
        if !path.is_absolute() {
            return Err(LspError::InvalidPath {
                path: path.to_path_buf(),
            });
        }
        let uri = protocol::path_to_file_uri(path)
            .map_err(|_| LspError::InvalidPath {
                path: path.to_path_buf(),
            })?
            .to_string();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| LspError::Io {
                path: path.to_path_buf(),
                source: Arc::new(e),
            })?;
        let conn = self.connection("textDocument/didOpen")?;

        let mut documents = self.documents.lock().await;
        match documents.get_mut(path) {
            None => {
                let language_id = protocol::language_id_for_path(path);
                conn.send_notification(
                    "textDocument/didOpen",
                    Some(protocol::did_open_params(&uri, language_id, 1, &text)),
                )
                .await?;
                documents.insert(path.to_path_buf(), DocumentState { version: 1, text });
                drop(documents);
                tracing::debug!(server = %self.server.id(), uri, "opened document");
                tokio::time::sleep(self.config.open_settle()).await;
            }
            Some(doc) if doc.text == text => {}
            Some(doc) => {
                let version = doc.version + 1;
                conn.send_notification(
                    "textDocument/didChange",
                    Some(protocol::did_change_params(&uri, version, &text)),
                )
                .await?;
                conn.send_notification(
                    "textDocument/didSave",
                    Some(protocol::did_save_params(&uri, &text)),
                )
                .await?;
                doc.version = version;
                doc.text = text;
                tracing::debug!(server = %self.server.id(), uri, version, "resynced document");
            }
        }
        Ok(uri)
    }

    async fn request(
        &self,
        method: &'static str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, LspError> {
        self.connection(method)?
            .send_request(method, Some(params))
            .await
    }

    /// `line` is 1-indexed, `character` is the 0-indexed protocol column.
    pub async fn definition(
        &self,
        path: &Path,
        line: u32,
        character: u32,
    ) -> Result<serde_json::Value, LspError> {
        let uri = self.sync_document(path).await?;
        self.request(
            "textDocument/definition",
            protocol::position_params(&uri, to_protocol_line(line), character),
        )
        .await
    }

    pub async fn references(
        &self,
        path: &Path,
        line: u32,
        character: u32,
        include_declaration: bool,
    ) -> Result<serde_json::Value, LspError> {
        let uri = self.sync_document(path).await?;
        self.request(
            "textDocument/references",
            protocol::references_params(&uri, to_protocol_line(line), character, include_declaration),
        )
        .await
    }

    /// References including the declaration itself.
    pub async fn references_default(
        &self,
        path: &Path,
        line: u32,
        character: u32,
    ) -> Result<serde_json::Value, LspError> {
        self.references(path, line, character, true).await
    }

    pub async fn document_symbols(&self, path: &Path) -> Result<serde_json::Value, LspError> {
        let uri = self.sync_document(path).await?;
        self.request(
            "textDocument/documentSymbol",
            protocol::text_document_params(&uri),
        )
        .await
    }

    pub async fn workspace_symbols(&self, query: &str) -> Result<serde_json::Value, LspError> {
        self.request("workspace/symbol", serde_json::json!({ "query": query }))
            .await
    }

    /// Pull diagnostics for `path`, falling back to the pushed cache when the
    /// server has no pull support.
    ///
    /// The fallback has the shape of a full document diagnostic report:
    /// `{"kind": "full", "items": [...]}`.
    pub async fn diagnostics(&self, path: &Path) -> Result<serde_json::Value, LspError> {
        let uri = self.sync_document(path).await?;
        tokio::time::sleep(self.config.diagnostics_settle()).await;

        if !self.supports_pull_diagnostics() {
            return Ok(self.cached_report(&uri));
        }
        match self
            .request("textDocument/diagnostic", protocol::text_document_params(&uri))
            .await
        {
            Err(e) if e.is_method_not_found() => {
                tracing::debug!(server = %self.server.id(), "pull diagnostics unsupported; using pushed cache");
                Ok(self.cached_report(&uri))
            }
            other => other,
        }
    }

    fn supports_pull_diagnostics(&self) -> bool {
        self.capabilities
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(|caps| caps.get("diagnosticProvider"))
            .is_some_and(|provider| !provider.is_null() && provider != &serde_json::Value::Bool(false))
    }

    fn cached_report(&self, uri: &str) -> serde_json::Value {
        serde_json::json!({
            "kind": "full",
            "items": self.shared.diagnostics_for(uri).unwrap_or_else(|| serde_json::json!([])),
        })
    }

    pub async fn prepare_rename(
        &self,
        path: &Path,
        line: u32,
        character: u32,
    ) -> Result<serde_json::Value, LspError> {
        let uri = self.sync_document(path).await?;
        self.request(
            "textDocument/prepareRename",
            protocol::position_params(&uri, to_protocol_line(line), character),
        )
        .await
    }

    /// Returns the server's `WorkspaceEdit`; nothing is applied locally.
    pub async fn rename(
        &self,
        path: &Path,
        line: u32,
        character: u32,
        new_name: &str,
    ) -> Result<serde_json::Value, LspError> {
        let uri = self.sync_document(path).await?;
        self.request(
            "textDocument/rename",
            protocol::rename_params(&uri, to_protocol_line(line), character, new_name),
        )
        .await
    }

    /// Process running and connection open.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.process()
            .is_some_and(|process| !process.has_exited() && !self.shared.is_closed())
    }

    /// Hard-kill without waiting. Safe to call from synchronous contexts.
    pub fn force_kill(&self) {
        if let Some(process) = self.process() {
            process.kill(KillSignal::Kill);
        }
    }

    /// Shut the session down, escalating to a hard kill if the server lingers.
    ///
    /// Bounded by the graceful and forced stop windows; never fails.
    pub async fn stop(&self) {
        let connection = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let process = self
            .process
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let graceful_deadline = tokio::time::Instant::now() + self.config.graceful_stop();

        if let Some(conn) = connection {
            if !self.shared.is_closed() {
                let _ = tokio::time::timeout_at(graceful_deadline, conn.send_request("shutdown", None)).await;
                let _ = conn.send_notification("exit", None).await;
            }
            conn.dispose().await;
        }

        if let Some(process) = process
            && !process.has_exited()
        {
            process.kill(KillSignal::Terminate);
            if tokio::time::timeout_at(graceful_deadline, process.wait())
                .await
                .is_err()
            {
                tracing::warn!(server = %self.server.id(), "language server ignored terminate; killing");
                process.kill(KillSignal::Kill);
                if tokio::time::timeout(self.config.forced_stop(), process.wait())
                    .await
                    .is_err()
                {
                    tracing::warn!(server = %self.server.id(), pid = ?process.pid(), "language server still running after kill");
                }
            }
        }

        if let Some(task) = self
            .stderr_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        self.shared.mark_closed();
        self.shared.clear_diagnostics();
        self.documents.lock().await.clear();
        self.set_state(ClientState::Stopped);
        tracing::info!(server = %self.server.id(), root = %self.root.display(), "language server stopped");
    }

    #[cfg(test)]
    pub(crate) async fn document_version(&self, path: &Path) -> Option<i32> {
        self.documents.lock().await.get(path).map(|doc| doc.version)
    }
}

impl std::fmt::Debug for LspClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LspClient")
            .field("server", &self.server.id())
            .field("root", &self.root)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
