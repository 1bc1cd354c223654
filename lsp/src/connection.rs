//! Protocol connection: framed JSON-RPC over a server's stdin/stdout.
//!
//! A writer task owns stdin and serializes frames in submission order. A
//! reader task owns stdout, routes responses to pending requests by id,
//! answers server-initiated requests, and records pushed diagnostics.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::codec::{FrameReader, FrameWriter};
use crate::error::LspError;
use crate::protocol::{self, Notification, Request};
use crate::transport::{BoxedReader, BoxedWriter};

const WRITER_CHANNEL_CAPACITY: usize = 64;

/// Lines of stderr retained per session.
pub(crate) const STDERR_BUFFER_LINES: usize = 100;

/// Lines of stderr attached to request errors.
pub(crate) const STDERR_TAIL_LINES: usize = 5;

/// Time allowed for queued frames to drain when the connection is disposed.
const DISPOSE_FLUSH_TIMEOUT: Duration = Duration::from_millis(200);

type PendingMap = Arc<tokio::sync::Mutex<HashMap<u64, oneshot::Sender<serde_json::Value>>>>;

pub(crate) enum WriterCommand {
    Send(serde_json::Value),
    Shutdown,
}

enum IncomingFrame {
    Response {
        id: u64,
        body: serde_json::Value,
    },
    ServerRequest {
        id: serde_json::Value,
        method: String,
        params: Option<serde_json::Value>,
    },
    Notification {
        method: String,
        params: Option<serde_json::Value>,
    },
}

fn parse_incoming(frame: &serde_json::Value) -> Option<IncomingFrame> {
    let id = frame.get("id");
    let method = frame
        .get("method")
        .and_then(|m| m.as_str())
        .map(String::from);
    let has_result_or_error = frame.get("result").is_some() || frame.get("error").is_some();

    match (id, method, has_result_or_error) {
        (Some(id_val), None, true) => Some(IncomingFrame::Response {
            id: id_val.as_u64()?,
            body: frame.clone(),
        }),
        (Some(id_val), Some(method), _) => Some(IncomingFrame::ServerRequest {
            id: id_val.clone(),
            method,
            params: frame.get("params").cloned(),
        }),
        (None, Some(method), _) => Some(IncomingFrame::Notification {
            method,
            params: frame.get("params").cloned(),
        }),
        _ => None,
    }
}

/// State shared between a session and its I/O tasks.
#[derive(Debug, Default)]
pub(crate) struct SessionShared {
    closed: AtomicBool,
    /// URI → raw `diagnostics` array from the latest `publishDiagnostics`.
    diagnostics: Mutex<HashMap<String, serde_json::Value>>,
    stderr: Mutex<VecDeque<String>>,
}

impl SessionShared {
    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn push_stderr(&self, line: String) {
        let mut buf = self.stderr.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if buf.len() == STDERR_BUFFER_LINES {
            buf.pop_front();
        }
        buf.push_back(line);
    }

    pub fn stderr_tail(&self, n: usize) -> Vec<String> {
        let buf = self.stderr.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        buf.iter().skip(buf.len().saturating_sub(n)).cloned().collect()
    }

    /// Replace (never merge) the cached diagnostics for `uri`.
    pub fn publish_diagnostics(&self, uri: String, items: serde_json::Value) {
        self.diagnostics
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(uri, items);
    }

    pub fn diagnostics_for(&self, uri: &str) -> Option<serde_json::Value> {
        self.diagnostics
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(uri)
            .cloned()
    }

    pub fn clear_diagnostics(&self) {
        self.diagnostics
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
    }
}

/// Answer a `workspace/configuration` request from the settings table.
///
/// Each item's `section` is a dotted path into `settings`; a missing section
/// yields the whole table, an unknown one yields `null`.
fn configuration_response(
    params: Option<&serde_json::Value>,
    settings: Option<&serde_json::Value>,
) -> serde_json::Value {
    let items = params
        .and_then(|p| p.get("items"))
        .and_then(serde_json::Value::as_array)
        .map_or(&[][..], Vec::as_slice);

    let answers = items
        .iter()
        .map(|item| {
            let Some(settings) = settings else {
                return serde_json::Value::Null;
            };
            match item.get("section").and_then(serde_json::Value::as_str) {
                None | Some("") => settings.clone(),
                Some(section) => section
                    .split('.')
                    .try_fold(settings, |node, key| node.get(key))
                    .cloned()
                    .unwrap_or(serde_json::Value::Null),
            }
        })
        .collect();
    serde_json::Value::Array(answers)
}

/// Framed request/response channel to one server process.
pub(crate) struct Connection {
    name: String,
    writer_tx: mpsc::Sender<WriterCommand>,
    next_id: AtomicU64,
    pending: PendingMap,
    shared: Arc<SessionShared>,
    request_timeout: Duration,
    reader_handle: JoinHandle<()>,
    writer_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    pub fn start(
        name: String,
        stdin: BoxedWriter,
        stdout: BoxedReader,
        shared: Arc<SessionShared>,
        settings: Option<serde_json::Value>,
        request_timeout: Duration,
    ) -> Self {
        let pending: PendingMap = Arc::new(tokio::sync::Mutex::new(HashMap::new()));

        let (writer_tx, mut writer_rx) = mpsc::channel::<WriterCommand>(WRITER_CHANNEL_CAPACITY);
        let writer_name = name.clone();
        let writer_handle = tokio::spawn(async move {
            let mut writer = FrameWriter::new(stdin);
            while let Some(cmd) = writer_rx.recv().await {
                match cmd {
                    WriterCommand::Send(frame) => {
                        if let Err(e) = writer.write_frame(&frame).await {
                            tracing::warn!(server = %writer_name, "LSP write error: {e:#}");
                            break;
                        }
                    }
                    WriterCommand::Shutdown => {
                        let _ = writer.close().await;
                        break;
                    }
                }
            }
        });

        let reader_pending = pending.clone();
        let reader_shared = shared.clone();
        let reader_writer_tx = writer_tx.clone();
        let reader_name = name.clone();
        let reader_handle = tokio::spawn(async move {
            let mut reader = FrameReader::new(stdout);
            loop {
                match reader.read_frame().await {
                    Ok(Some(frame)) => {
                        Self::dispatch_frame(
                            &frame,
                            &reader_pending,
                            &reader_shared,
                            &reader_writer_tx,
                            settings.as_ref(),
                            &reader_name,
                        )
                        .await;
                    }
                    Ok(None) => {
                        tracing::info!(server = %reader_name, "LSP server closed stdout");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(server = %reader_name, "LSP reader error: {e:#}");
                        break;
                    }
                }
            }
            // Fail pending requests fast instead of letting them time out.
            reader_shared.mark_closed();
            reader_pending.lock().await.clear();
        });

        Self {
            name,
            writer_tx,
            next_id: AtomicU64::new(1),
            pending,
            shared,
            request_timeout,
            reader_handle,
            writer_handle: Mutex::new(Some(writer_handle)),
        }
    }

    async fn dispatch_frame(
        frame: &serde_json::Value,
        pending: &tokio::sync::Mutex<HashMap<u64, oneshot::Sender<serde_json::Value>>>,
        shared: &SessionShared,
        writer_tx: &mpsc::Sender<WriterCommand>,
        settings: Option<&serde_json::Value>,
        server_name: &str,
    ) {
        let Some(incoming) = parse_incoming(frame) else {
            tracing::trace!("Ignoring malformed JSON-RPC frame from '{server_name}'");
            return;
        };

        match incoming {
            IncomingFrame::Response { id, body } => {
                let sender = pending.lock().await.remove(&id);
                if let Some(tx) = sender {
                    let _ = tx.send(body);
                } else {
                    tracing::debug!("LSP '{server_name}' answered unknown or expired request {id}");
                }
            }
            IncomingFrame::ServerRequest { id, method, params } => {
                let response = match method.as_str() {
                    "workspace/configuration" => protocol::response_ok(
                        &id,
                        configuration_response(params.as_ref(), settings),
                    ),
                    "client/registerCapability"
                    | "client/unregisterCapability"
                    | "window/workDoneProgress/create"
                    | "window/showMessageRequest" => {
                        protocol::response_ok(&id, serde_json::Value::Null)
                    }
                    "workspace/applyEdit" => protocol::response_ok(
                        &id,
                        serde_json::json!({
                            "applied": false,
                            "failureReason": "edits are returned to the caller, not applied"
                        }),
                    ),
                    _ => {
                        tracing::debug!(
                            "LSP '{server_name}' sent request: {method}; replying method not found"
                        );
                        protocol::response_error(
                            &id,
                            LspError::METHOD_NOT_FOUND,
                            &format!("Method not found: {method}"),
                        )
                    }
                };
                let _ = writer_tx.send(WriterCommand::Send(response)).await;
            }
            IncomingFrame::Notification { method, params } => match method.as_str() {
                "textDocument/publishDiagnostics" => {
                    let Some(params) = params else { return };
                    let Some(uri) = params.get("uri").and_then(serde_json::Value::as_str) else {
                        tracing::debug!("publishDiagnostics from '{server_name}' without uri");
                        return;
                    };
                    let items = params
                        .get("diagnostics")
                        .cloned()
                        .unwrap_or_else(|| serde_json::json!([]));
                    shared.publish_diagnostics(uri.to_string(), items);
                }
                _ => {
                    tracing::trace!("Ignoring notification from '{server_name}': {method}");
                }
            },
        }
    }

    /// Send a request and wait for its response `result`.
    pub async fn send_request(
        &self,
        method: &'static str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, LspError> {
        if self.shared.is_closed() {
            return Err(LspError::ProcessExited {
                method: method.to_string(),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        // The reader marks closed before it clears the table; recheck so a
        // slot inserted after that clear cannot wait out the full timeout.
        if self.shared.is_closed() {
            self.pending.lock().await.remove(&id);
            return Err(LspError::ProcessExited {
                method: method.to_string(),
            });
        }

        let frame = serde_json::to_value(Request::new(id, method, params)).unwrap_or_default();
        if self
            .writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .is_err()
        {
            self.pending.lock().await.remove(&id);
            return Err(LspError::ProcessExited {
                method: method.to_string(),
            });
        }

        let response = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(LspError::ProcessExited {
                    method: method.to_string(),
                });
            }
            Err(_) => {
                // Drop the slot so a late reply is ignored and the map doesn't grow.
                self.pending.lock().await.remove(&id);
                tracing::warn!(server = %self.name, method, "LSP request timed out");
                return Err(LspError::RequestTimeout {
                    method: method.to_string(),
                    timeout: self.request_timeout,
                    stderr_tail: self.shared.stderr_tail(STDERR_TAIL_LINES),
                });
            }
        };

        if let Some(error) = response.get("error") {
            return Err(LspError::RequestFailed {
                method: method.to_string(),
                code: error["code"].as_i64().unwrap_or_default(),
                message: error["message"]
                    .as_str()
                    .unwrap_or("unknown error")
                    .to_string(),
                stderr_tail: self.shared.stderr_tail(STDERR_TAIL_LINES),
            });
        }

        Ok(response
            .get("result")
            .cloned()
            .unwrap_or(serde_json::Value::Null))
    }

    /// Send a one-way message. Silently dropped once the server is gone.
    pub async fn send_notification(
        &self,
        method: &'static str,
        params: Option<serde_json::Value>,
    ) -> Result<(), LspError> {
        if self.shared.is_closed() {
            return Ok(());
        }
        let frame = serde_json::to_value(Notification::new(method, params)).unwrap_or_default();
        if self.writer_tx.send(WriterCommand::Send(frame)).await.is_err() {
            tracing::debug!(server = %self.name, method, "writer closed; notification dropped");
        }
        Ok(())
    }

    /// Flush queued frames briefly, then tear down both I/O tasks.
    pub async fn dispose(&self) {
        let _ = self.writer_tx.try_send(WriterCommand::Shutdown);
        let writer = self
            .writer_handle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(mut handle) = writer
            && tokio::time::timeout(DISPOSE_FLUSH_TIMEOUT, &mut handle)
                .await
                .is_err()
        {
            handle.abort();
        }
        self.reader_handle.abort();
        self.shared.mark_closed();
        self.pending.lock().await.clear();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader_handle.abort();
        if let Some(handle) = self
            .writer_handle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

/// Drain a server's stderr into the session ring buffer.
pub(crate) fn spawn_stderr_capture(
    name: String,
    stderr: BoxedReader,
    shared: Arc<SessionShared>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    tracing::debug!(target: "harbor_lsp::stderr", server = %name, "{line}");
                    shared.push_stderr(line);
                }
                Ok(None) | Err(_) => break,
            }
        }
    })
}
