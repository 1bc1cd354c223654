//! Process transport: spawns a language server and exposes a uniform handle.
//!
//! Two spawn primitives sit behind [`ProcessHandle`]:
//!
//! - [`SpawnBackend::Tokio`]: `tokio::process`, used everywhere except Windows.
//! - [`SpawnBackend::Blocking`]: `std::process` with bridging threads, used on
//!   Windows where the async pipe primitive has been unreliable for long-lived
//!   stdio servers. It pre-resolves the binary on `PATH` so a missing server
//!   produces an actionable error rather than a bare OS error.
//!
//! The backend is chosen once ([`SpawnBackend::detect`]), never per call.
//! A supervisor task owns the child; exit status is published once through a
//! watch channel and kill requests travel over an mpsc channel, so the handle
//! can be shared by reference.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::io::{Read, Write};
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};

use crate::error::SpawnError;
use crate::types::SpawnBackendPreference;

pub type BoxedReader = Pin<Box<dyn AsyncRead + Send + Sync>>;
pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send + Sync>>;

const BLOCKING_POLL_INTERVAL: Duration = Duration::from_millis(25);
const BRIDGE_CHUNK_BYTES: usize = 8 * 1024;
const BRIDGE_PIPE_BYTES: usize = 64 * 1024;

/// Signal delivered by [`ProcessHandle::kill`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSignal {
    /// SIGTERM on Unix; falls back to a hard kill elsewhere.
    Terminate,
    /// SIGKILL / TerminateProcess.
    Kill,
}

/// Final status of a child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, `None` when terminated by a signal or when unknown.
    pub code: Option<i32>,
}

impl From<std::process::ExitStatus> for ProcessExit {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

/// Working directory and environment overrides for a spawn.
#[derive(Debug, Clone, Copy)]
pub struct SpawnOptions<'a> {
    pub cwd: &'a Path,
    pub env: &'a BTreeMap<String, String>,
}

/// Confirm `path` exists and is a directory.
///
/// Must run before any spawn: handing a missing cwd to the platform spawn
/// primitive is not guaranteed to fail cleanly.
pub fn validate_cwd(path: &Path) -> Result<(), SpawnError> {
    let invalid = |reason: String| SpawnError::InvalidCwd {
        path: path.to_path_buf(),
        reason,
    };
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(invalid("not a directory".to_string())),
        Err(e) => Err(invalid(e.to_string())),
    }
}

/// Process-spawn primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnBackend {
    Tokio,
    Blocking,
}

impl SpawnBackend {
    /// Platform default.
    #[must_use]
    pub fn detect() -> Self {
        if cfg!(windows) {
            Self::Blocking
        } else {
            Self::Tokio
        }
    }

    #[must_use]
    pub fn from_preference(preference: SpawnBackendPreference) -> Self {
        match preference {
            SpawnBackendPreference::Auto => Self::detect(),
            SpawnBackendPreference::Tokio => Self::Tokio,
            SpawnBackendPreference::Blocking => Self::Blocking,
        }
    }
}

/// Spawn `command` (binary followed by arguments) with piped stdio.
///
/// Must be called from within a Tokio runtime.
pub fn spawn(
    backend: SpawnBackend,
    command: &[String],
    options: &SpawnOptions<'_>,
) -> Result<ProcessHandle, SpawnError> {
    validate_cwd(options.cwd)?;
    let (binary, args) = command.split_first().ok_or(SpawnError::EmptyCommand)?;
    match backend {
        SpawnBackend::Tokio => spawn_tokio(binary, args, options),
        SpawnBackend::Blocking => spawn_blocking(binary, args, options),
    }
}

/// Uniform handle over a spawned server process.
pub struct ProcessHandle {
    pid: Option<u32>,
    binary: String,
    stdin: Option<BoxedWriter>,
    stdout: Option<BoxedReader>,
    stderr: Option<BoxedReader>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
    control_tx: mpsc::UnboundedSender<KillSignal>,
}

impl ProcessHandle {
    pub(crate) fn from_parts(
        pid: Option<u32>,
        binary: String,
        stdio: (BoxedWriter, BoxedReader, BoxedReader),
        exit_rx: watch::Receiver<Option<ProcessExit>>,
        control_tx: mpsc::UnboundedSender<KillSignal>,
    ) -> Self {
        let (stdin, stdout, stderr) = stdio;
        Self {
            pid,
            binary,
            stdin: Some(stdin),
            stdout: Some(stdout),
            stderr: Some(stderr),
            exit_rx,
            control_tx,
        }
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    #[must_use]
    pub fn binary(&self) -> &str {
        &self.binary
    }

    pub fn take_stdin(&mut self) -> Option<BoxedWriter> {
        self.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<BoxedReader> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<BoxedReader> {
        self.stderr.take()
    }

    /// Exit status if the process has already exited.
    #[must_use]
    pub fn exit_status(&self) -> Option<ProcessExit> {
        *self.exit_rx.borrow()
    }

    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.exit_status().is_some()
    }

    /// Wait for exit. Every caller observes the same status.
    pub async fn wait(&self) -> ProcessExit {
        let mut rx = self.exit_rx.clone();
        match rx.wait_for(Option::is_some).await.map(|exit| *exit) {
            Ok(Some(exit)) => exit,
            // Supervisor gone without publishing: the child is unreachable either way.
            _ => ProcessExit { code: None },
        }
    }

    /// Deliver a signal. No-op once the process has exited.
    ///
    /// A hard kill of a real child is delivered before this returns, so it
    /// works from panic hooks and from threads whose runtime has stopped
    /// polling. The supervisor still gets the request and reaps the child.
    pub fn kill(&self, signal: KillSignal) {
        if self.has_exited() {
            return;
        }
        if signal == KillSignal::Kill {
            send_signal(self.pid, KillSignal::Kill);
        }
        let _ = self.control_tx.send(signal);
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        // std::process::Child has no kill-on-drop; both backends get one here.
        self.kill(KillSignal::Kill);
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("binary", &self.binary)
            .field("exit", &self.exit_status())
            .finish_non_exhaustive()
    }
}

/// How a client obtains its process. Production code always goes through a
/// [`SpawnBackend`]; tests substitute an in-memory server.
#[derive(Clone)]
pub(crate) enum Launcher {
    Backend(SpawnBackend),
    #[cfg(test)]
    Fake(crate::testing::FakeLauncher),
}

impl Launcher {
    pub(crate) fn launch(
        &self,
        command: &[String],
        options: &SpawnOptions<'_>,
    ) -> Result<ProcessHandle, SpawnError> {
        match self {
            Self::Backend(backend) => spawn(*backend, command, options),
            #[cfg(test)]
            Self::Fake(fake) => {
                validate_cwd(options.cwd)?;
                fake.launch(command)
            }
        }
    }
}

fn base_command(program: &OsStr, args: &[String], options: &SpawnOptions<'_>) -> std::process::Command {
    let mut cmd = std::process::Command::new(program);
    cmd.args(args)
        .current_dir(options.cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    for (key, _) in std::env::vars_os() {
        if key
            .to_str()
            .is_some_and(harbor_types::is_secret_env_var)
        {
            cmd.env_remove(&key);
        }
    }
    cmd.envs(options.env);
    cmd
}

fn spawn_io_error(binary: &str, err: std::io::Error) -> SpawnError {
    if err.kind() == std::io::ErrorKind::NotFound {
        SpawnError::BinaryNotFound {
            binary: binary.to_string(),
            hint: install_hint(binary),
        }
    } else {
        SpawnError::Io {
            binary: binary.to_string(),
            source: Arc::new(err),
        }
    }
}

pub(crate) fn missing_pipe(binary: &str, which: &str) -> SpawnError {
    SpawnError::Io {
        binary: binary.to_string(),
        source: Arc::new(std::io::Error::other(format!("no {which} from child"))),
    }
}

fn install_hint(binary: &str) -> String {
    let name = Path::new(binary)
        .file_stem()
        .and_then(OsStr::to_str)
        .unwrap_or(binary);
    let hint = match name {
        "typescript-language-server" => {
            "Install it with `npm install -g typescript-language-server typescript`."
        }
        "pyright-langserver" | "pyright" | "basedpyright-langserver" => {
            "Install it with `npm install -g pyright`."
        }
        "rust-analyzer" => "Install it with `rustup component add rust-analyzer`.",
        "gopls" => "Install it with `go install golang.org/x/tools/gopls@latest`.",
        "clangd" => "Install clangd from your system package manager or an LLVM release.",
        "vscode-json-language-server"
        | "vscode-css-language-server"
        | "vscode-html-language-server"
        | "vscode-eslint-language-server" => {
            "Install it with `npm install -g vscode-langservers-extracted`."
        }
        _ => "Install it or add its directory to PATH.",
    };
    hint.to_string()
}

// ============================================================================
// Tokio backend
// ============================================================================

fn spawn_tokio(
    binary: &str,
    args: &[String],
    options: &SpawnOptions<'_>,
) -> Result<ProcessHandle, SpawnError> {
    let mut cmd = tokio::process::Command::from(base_command(OsStr::new(binary), args, options));
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| spawn_io_error(binary, e))?;
    let stdin = child.stdin.take().ok_or_else(|| missing_pipe(binary, "stdin"))?;
    let stdout = child.stdout.take().ok_or_else(|| missing_pipe(binary, "stdout"))?;
    let stderr = child.stderr.take().ok_or_else(|| missing_pipe(binary, "stderr"))?;
    let pid = child.id();

    let (exit_tx, exit_rx) = watch::channel(None);
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    tokio::spawn(supervise_tokio(child, exit_tx, control_rx));

    tracing::debug!(binary, pid, "spawned language server (tokio)");
    Ok(ProcessHandle::from_parts(
        pid,
        binary.to_string(),
        (Box::pin(stdin), Box::pin(stdout), Box::pin(stderr)),
        exit_rx,
        control_tx,
    ))
}

async fn supervise_tokio(
    mut child: tokio::process::Child,
    exit_tx: watch::Sender<Option<ProcessExit>>,
    mut control_rx: mpsc::UnboundedReceiver<KillSignal>,
) {
    let mut control_open = true;
    loop {
        tokio::select! {
            status = child.wait() => {
                let exit = status.map_or_else(
                    |e| {
                        tracing::warn!("waiting on language server failed: {e}");
                        ProcessExit { code: None }
                    },
                    ProcessExit::from,
                );
                exit_tx.send_replace(Some(exit));
                return;
            }
            signal = control_rx.recv(), if control_open => match signal {
                Some(KillSignal::Terminate) => {
                    if !send_signal(child.id(), KillSignal::Terminate) {
                        let _ = child.start_kill();
                    }
                }
                Some(KillSignal::Kill) => {
                    let _ = child.start_kill();
                }
                None => {
                    // Handle dropped.
                    control_open = false;
                    let _ = child.start_kill();
                }
            }
        }
    }
}

/// Signal `pid` directly. Returns false when there is no pid to signal or
/// the platform has no signal delivery, leaving the caller to fall back.
#[cfg(unix)]
fn send_signal(pid: Option<u32>, signal: KillSignal) -> bool {
    let Some(pid) = pid.and_then(|p| libc::pid_t::try_from(p).ok()) else {
        return false;
    };
    let signo = match signal {
        KillSignal::Terminate => libc::SIGTERM,
        KillSignal::Kill => libc::SIGKILL,
    };
    // SAFETY: kill(2) has no memory-safety preconditions. Callers only get
    // here before the exit is published, so the pid is still our child or
    // was reaped an instant ago.
    unsafe { libc::kill(pid, signo) == 0 }
}

#[cfg(not(unix))]
fn send_signal(_pid: Option<u32>, _signal: KillSignal) -> bool {
    false
}

// ============================================================================
// Blocking backend
// ============================================================================

fn spawn_blocking(
    binary: &str,
    args: &[String],
    options: &SpawnOptions<'_>,
) -> Result<ProcessHandle, SpawnError> {
    let resolved = which::which(binary).map_err(|_| SpawnError::BinaryNotFound {
        binary: binary.to_string(),
        hint: install_hint(binary),
    })?;

    let mut child = base_command(resolved.as_os_str(), args, options)
        .spawn()
        .map_err(|e| spawn_io_error(binary, e))?;
    let stdin = child.stdin.take().ok_or_else(|| missing_pipe(binary, "stdin"))?;
    let stdout = child.stdout.take().ok_or_else(|| missing_pipe(binary, "stdout"))?;
    let stderr = child.stderr.take().ok_or_else(|| missing_pipe(binary, "stderr"))?;
    let pid = child.id();

    let runtime = Handle::current();
    let io_err = |e: std::io::Error| SpawnError::Io {
        binary: binary.to_string(),
        source: Arc::new(e),
    };
    let stdin = bridge_writer(stdin, runtime.clone(), "harbor-lsp-stdin").map_err(io_err)?;
    let stdout = bridge_reader(stdout, runtime.clone(), "harbor-lsp-stdout").map_err(io_err)?;
    let stderr = bridge_reader(stderr, runtime, "harbor-lsp-stderr").map_err(io_err)?;

    let (exit_tx, exit_rx) = watch::channel(None);
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    tokio::spawn(supervise_blocking(child, exit_tx, control_rx));

    tracing::debug!(binary, pid, "spawned language server (blocking)");
    Ok(ProcessHandle::from_parts(
        Some(pid),
        binary.to_string(),
        (stdin, stdout, stderr),
        exit_rx,
        control_tx,
    ))
}

/// Pump a blocking reader into an in-memory async pipe on a dedicated thread.
fn bridge_reader<R: Read + Send + 'static>(
    mut source: R,
    runtime: Handle,
    name: &str,
) -> std::io::Result<BoxedReader> {
    let (mut tx, rx) = tokio::io::duplex(BRIDGE_PIPE_BYTES);
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let mut buf = vec![0u8; BRIDGE_CHUNK_BYTES];
            loop {
                match source.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if runtime.block_on(tx.write_all(&buf[..n])).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(_) => break,
                }
            }
            // Dropping `tx` delivers EOF to the async side.
        })?;
    Ok(Box::pin(rx))
}

/// Pump an in-memory async pipe into a blocking writer on a dedicated thread.
fn bridge_writer<W: Write + Send + 'static>(
    mut sink: W,
    runtime: Handle,
    name: &str,
) -> std::io::Result<BoxedWriter> {
    let (tx, mut rx) = tokio::io::duplex(BRIDGE_PIPE_BYTES);
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let mut buf = vec![0u8; BRIDGE_CHUNK_BYTES];
            loop {
                match runtime.block_on(rx.read(&mut buf)) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if sink.write_all(&buf[..n]).and_then(|()| sink.flush()).is_err() {
                            break;
                        }
                    }
                }
            }
            // Dropping `sink` closes the child's stdin.
        })?;
    Ok(Box::pin(tx))
}

async fn supervise_blocking(
    mut child: std::process::Child,
    exit_tx: watch::Sender<Option<ProcessExit>>,
    mut control_rx: mpsc::UnboundedReceiver<KillSignal>,
) {
    let mut ticker = tokio::time::interval(BLOCKING_POLL_INTERVAL);
    let mut control_open = true;
    loop {
        tokio::select! {
            _ = ticker.tick() => match child.try_wait() {
                Ok(Some(status)) => {
                    exit_tx.send_replace(Some(status.into()));
                    return;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("polling language server exit failed: {e}");
                    exit_tx.send_replace(Some(ProcessExit { code: None }));
                    return;
                }
            },
            signal = control_rx.recv(), if control_open => match signal {
                Some(KillSignal::Terminate) => {
                    if !send_signal(Some(child.id()), KillSignal::Terminate) {
                        let _ = child.kill();
                    }
                }
                Some(KillSignal::Kill) => {
                    let _ = child.kill();
                }
                None => {
                    control_open = false;
                    let _ = child.kill();
                }
            }
        }
    }
}
