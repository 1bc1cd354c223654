//! In-memory language server for client and pool tests.
//!
//! [`FakeLauncher`] hands out [`ProcessHandle`]s backed by duplex pipes and a
//! task that speaks just enough LSP to exercise the session lifecycle. Every
//! received method and every delivered signal is recorded.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, watch};

use crate::codec::{FrameReader, FrameWriter};
use crate::error::SpawnError;
use crate::transport::{KillSignal, ProcessExit, ProcessHandle};

const PIPE_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone, Default)]
struct Behavior {
    ignore_terminate: bool,
    silent_methods: HashSet<&'static str>,
    pull_diagnostics: bool,
    push_diagnostics_on_open: bool,
    exit_immediately: Option<i32>,
    fail_initialize: bool,
    initialize_delay: Duration,
}

#[derive(Default)]
struct Inner {
    behavior: Behavior,
    spawns: AtomicUsize,
    methods: Mutex<Vec<String>>,
    signals: Mutex<Vec<KillSignal>>,
    controls: Mutex<Vec<mpsc::UnboundedSender<KillSignal>>>,
}

#[derive(Clone, Default)]
pub(crate) struct FakeLauncher {
    inner: Arc<Inner>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_behavior(self, f: impl FnOnce(&mut Behavior)) -> Self {
        let mut behavior = self.inner.behavior.clone();
        f(&mut behavior);
        Self {
            inner: Arc::new(Inner {
                behavior,
                ..Inner::default()
            }),
        }
    }

    /// Survive SIGTERM, closed stdin, and `exit`; only a hard kill ends it.
    pub fn ignoring_terminate(self) -> Self {
        self.with_behavior(|b| b.ignore_terminate = true)
    }

    pub fn never_replying_to(self, method: &'static str) -> Self {
        self.with_behavior(|b| {
            b.silent_methods.insert(method);
        })
    }

    pub fn with_pull_diagnostics(self) -> Self {
        self.with_behavior(|b| b.pull_diagnostics = true)
    }

    pub fn pushing_diagnostics_on_open(self) -> Self {
        self.with_behavior(|b| b.push_diagnostics_on_open = true)
    }

    pub fn exiting_immediately(self, code: i32) -> Self {
        self.with_behavior(|b| b.exit_immediately = Some(code))
    }

    pub fn failing_initialize(self) -> Self {
        self.with_behavior(|b| b.fail_initialize = true)
    }

    pub fn with_initialize_delay(self, delay: Duration) -> Self {
        self.with_behavior(|b| b.initialize_delay = delay)
    }

    pub fn spawn_count(&self) -> usize {
        self.inner.spawns.load(Ordering::SeqCst)
    }

    /// Every method received so far, across all spawned servers, in order.
    pub fn methods(&self) -> Vec<String> {
        self.inner.methods.lock().unwrap().clone()
    }

    pub fn count_of(&self, method: &str) -> usize {
        self.methods().iter().filter(|m| *m == method).count()
    }

    pub fn signals(&self) -> Vec<KillSignal> {
        self.inner.signals.lock().unwrap().clone()
    }

    /// Hard-kill every server launched so far, as if they crashed.
    pub fn crash_all(&self) {
        for control in self.inner.controls.lock().unwrap().iter() {
            let _ = control.send(KillSignal::Kill);
        }
    }

    pub fn launch(&self, command: &[String]) -> Result<ProcessHandle, SpawnError> {
        let binary = command.first().ok_or(SpawnError::EmptyCommand)?.clone();
        self.inner.spawns.fetch_add(1, Ordering::SeqCst);

        let (client_stdin, server_stdin) = tokio::io::duplex(PIPE_BYTES);
        let (server_stdout, client_stdout) = tokio::io::duplex(PIPE_BYTES);
        let (server_stderr, client_stderr) = tokio::io::duplex(PIPE_BYTES);
        let (exit_tx, exit_rx) = watch::channel(None);
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        self.inner.controls.lock().unwrap().push(control_tx.clone());
        tokio::spawn(serve(
            self.inner.clone(),
            Streams {
                stdin: server_stdin,
                stdout: server_stdout,
                stderr: server_stderr,
            },
            exit_tx,
            control_rx,
        ));

        Ok(ProcessHandle::from_parts(
            None,
            binary,
            (
                Box::pin(client_stdin),
                Box::pin(client_stdout),
                Box::pin(client_stderr),
            ),
            exit_rx,
            control_tx,
        ))
    }
}

struct Streams {
    stdin: DuplexStream,
    stdout: DuplexStream,
    stderr: DuplexStream,
}

async fn serve(
    inner: Arc<Inner>,
    streams: Streams,
    exit_tx: watch::Sender<Option<ProcessExit>>,
    mut control_rx: mpsc::UnboundedReceiver<KillSignal>,
) {
    let Streams {
        stdin,
        stdout,
        mut stderr,
    } = streams;
    let behavior = &inner.behavior;

    if let Some(code) = behavior.exit_immediately {
        let _ = stderr.write_all(b"fatal: cannot start\n").await;
        drop(stderr);
        exit_tx.send_replace(Some(ProcessExit { code: Some(code) }));
        return;
    }
    let _ = stderr.write_all(b"fake server ready\n").await;

    let mut reader = FrameReader::new(stdin);
    let mut writer = FrameWriter::new(stdout);
    let mut stdin_open = true;
    // A slow `initialize` reply must not stop us from reacting to signals.
    let mut delayed_reply: Option<serde_json::Value> = None;
    let delay = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(delay);

    let code = loop {
        tokio::select! {
            () = &mut delay, if delayed_reply.is_some() => {
                if let Some(reply) = delayed_reply.take()
                    && writer.write_frame(&reply).await.is_err()
                {
                    break Some(0);
                }
            }
            frame = reader.read_frame(), if stdin_open => {
                let Ok(Some(frame)) = frame else {
                    if behavior.ignore_terminate {
                        stdin_open = false;
                        continue;
                    }
                    break Some(0);
                };
                let method = frame["method"].as_str().unwrap_or_default().to_string();
                if method.is_empty() {
                    // Response to one of our own requests; nothing to do.
                    continue;
                }
                inner.methods.lock().unwrap().push(method.clone());

                if method == "exit" {
                    if behavior.ignore_terminate {
                        continue;
                    }
                    break Some(0);
                }
                if method == "textDocument/didOpen" && behavior.push_diagnostics_on_open {
                    let uri = frame["params"]["textDocument"]["uri"].clone();
                    let push = serde_json::json!({
                        "jsonrpc": "2.0",
                        "method": "textDocument/publishDiagnostics",
                        "params": {
                            "uri": uri,
                            "diagnostics": [{
                                "range": {
                                    "start": { "line": 0, "character": 4 },
                                    "end": { "line": 0, "character": 9 }
                                },
                                "severity": 1,
                                "source": "fake",
                                "message": "pushed problem"
                            }]
                        }
                    });
                    let _ = writer.write_frame(&push).await;
                }

                let Some(id) = frame.get("id").cloned() else { continue };
                if behavior.silent_methods.contains(method.as_str()) {
                    continue;
                }
                let reply = reply_for(behavior, &id, &method, &frame);
                if method == "initialize" && !behavior.initialize_delay.is_zero() {
                    delay.as_mut().reset(tokio::time::Instant::now() + behavior.initialize_delay);
                    delayed_reply = Some(reply);
                    continue;
                }
                if writer.write_frame(&reply).await.is_err() {
                    break Some(0);
                }
            }
            signal = control_rx.recv() => {
                let Some(signal) = signal else { break None };
                inner.signals.lock().unwrap().push(signal);
                match signal {
                    KillSignal::Terminate if behavior.ignore_terminate => {}
                    KillSignal::Terminate | KillSignal::Kill => break None,
                }
            }
        }
    };

    drop(writer);
    drop(stderr);
    exit_tx.send_replace(Some(ProcessExit { code }));
}

fn reply_for(
    behavior: &Behavior,
    id: &serde_json::Value,
    method: &str,
    frame: &serde_json::Value,
) -> serde_json::Value {
    match method {
        "initialize" => {
            if behavior.fail_initialize {
                return serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": { "code": -32603, "message": "cannot initialize" }
                });
            }
            let mut capabilities = serde_json::json!({
                "textDocumentSync": 1,
                "definitionProvider": true,
                "referencesProvider": true,
                "renameProvider": { "prepareProvider": true }
            });
            if behavior.pull_diagnostics {
                capabilities["diagnosticProvider"] =
                    serde_json::json!({ "interFileDependencies": false, "workspaceDiagnostics": false });
            }
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": { "capabilities": capabilities, "serverInfo": { "name": "fake" } }
            })
        }
        "shutdown" => serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": null }),
        "textDocument/diagnostic" if !behavior.pull_diagnostics => serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": -32601, "message": "Unhandled method textDocument/diagnostic" }
        }),
        "textDocument/diagnostic" => serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": { "kind": "full", "items": [{ "message": "pulled problem" }] }
        }),
        // Echo the request so tests can inspect exactly what was sent.
        _ => serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": { "method": method, "params": frame["params"] }
        }),
    }
}
