//! Newline-delimited JSON framing over a sidecar's standard streams.

use std::{
    process::Stdio,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, Command},
    sync::{oneshot, watch},
};

use crate::{lock_or_recover, RpcError, SidecarLaunch};

const MAX_TEXT_FILE_BUSY_RETRIES: u32 = 5;
const TEXT_FILE_BUSY_ERRNO: i32 = 26;
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);
const SHUTDOWN_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Receiver for inbound transport events.
///
/// Callbacks run on the transport's background tasks and must not block.
pub trait TransportHandler: Send + Sync + 'static {
    /// One complete stdout line that parsed as JSON.
    fn on_line(&self, frame: Value);

    /// Process termination. Invoked exactly once per transport, after stdout
    /// has been drained.
    fn on_exit(&self, exit_code: Option<i32>);

    fn on_diagnostic(&self, diagnostic: TransportDiagnostic) {
        let _ = diagnostic;
    }
}

/// Non-fatal observations routed to the diagnostic sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportDiagnostic {
    InvalidJson { line: String, detail: String },
    Stderr { line: String },
}

/// One spawned sidecar process and its stdio framing.
pub struct RpcTransport {
    server: String,
    pid: Option<u32>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    closed: Arc<AtomicBool>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
    exit: watch::Receiver<Option<Option<i32>>>,
}

impl std::fmt::Debug for RpcTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcTransport")
            .field("server", &self.server)
            .field("pid", &self.pid)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl RpcTransport {
    /// Starts the sidecar and its reader, stderr, and exit supervisor tasks.
    pub async fn spawn(
        launch: &SidecarLaunch,
        handler: Arc<dyn TransportHandler>,
    ) -> Result<Self, RpcError> {
        let server = launch.server.clone();
        if !launch.program.is_file() {
            return Err(RpcError::Spawn {
                server,
                detail: format!("executable not found at {}", launch.program.display()),
            });
        }

        let mut command = Command::new(&launch.program);
        command
            .args(&launch.args)
            .envs(&launch.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = launch.cwd.as_ref() {
            command.current_dir(cwd);
        }
        let mut child = spawn_with_text_file_busy_retry(&mut command, &server).await?;
        let pid = child.id();

        let missing_pipe = |name: &str| RpcError::Spawn {
            server: server.clone(),
            detail: format!("failed to open {name} pipe"),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;

        tracing::debug!(server = %server, pid = ?pid, program = %launch.program.display(), "sidecar spawned");

        let reader = tokio::spawn(read_stdout_lines(
            server.clone(),
            stdout,
            Arc::clone(&handler),
        ));
        tokio::spawn(forward_stderr_lines(
            server.clone(),
            stderr,
            Arc::clone(&handler),
        ));

        let closed = Arc::new(AtomicBool::new(false));
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(supervise_exit(
            server.clone(),
            child,
            kill_rx,
            reader,
            Arc::clone(&closed),
            handler,
            exit_tx,
        ));

        Ok(Self {
            server,
            pid,
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            closed,
            kill: Mutex::new(Some(kill_tx)),
            exit: exit_rx,
        })
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Writes one frame followed by a newline under the stdin lock.
    pub async fn write_line(&self, line: &str) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(self.closed_error());
        };
        let mut frame = String::with_capacity(line.len() + 1);
        frame.push_str(line.trim_end_matches(['\r', '\n']));
        frame.push('\n');
        let written = async {
            stdin.write_all(frame.as_bytes()).await?;
            stdin.flush().await
        }
        .await;
        written.map_err(|error| {
            if self.is_closed() || error.kind() == std::io::ErrorKind::BrokenPipe {
                self.closed_error()
            } else {
                RpcError::Write {
                    server: self.server.clone(),
                    detail: error.to_string(),
                }
            }
        })
    }

    pub async fn write_frame(&self, frame: &Value) -> Result<(), RpcError> {
        let line = serde_json::to_string(frame).map_err(|error| RpcError::Write {
            server: self.server.clone(),
            detail: format!("failed to encode frame: {error}"),
        })?;
        self.write_line(&line).await
    }

    /// Closes stdin, kills the process, and waits for the exit notification.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.stdin.lock().await.take();
        if let Some(kill) = lock_or_recover(&self.kill).take() {
            let _ = kill.send(());
        }
        let mut exit = self.exit.clone();
        let waited =
            tokio::time::timeout(SHUTDOWN_WAIT_TIMEOUT, exit.wait_for(Option::is_some)).await;
        if waited.is_err() {
            tracing::warn!(server = %self.server, "sidecar did not report exit after shutdown");
        }
    }

    /// Exit code once the process has terminated; `Some(None)` means killed by signal.
    pub fn exit_status(&self) -> Option<Option<i32>> {
        *self.exit.borrow()
    }

    fn closed_error(&self) -> RpcError {
        RpcError::Closed {
            server: self.server.clone(),
        }
    }
}

async fn spawn_with_text_file_busy_retry(
    command: &mut Command,
    server: &str,
) -> Result<Child, RpcError> {
    let mut attempt = 0;
    loop {
        match command.spawn() {
            Ok(child) => return Ok(child),
            Err(error)
                if error.raw_os_error() == Some(TEXT_FILE_BUSY_ERRNO)
                    && attempt < MAX_TEXT_FILE_BUSY_RETRIES =>
            {
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
            Err(error) => {
                return Err(RpcError::Spawn {
                    server: server.to_string(),
                    detail: error.to_string(),
                })
            }
        }
    }
}

async fn read_stdout_lines<R>(server: String, stdout: R, handler: Arc<dyn TransportHandler>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stdout);
    let mut buffer = Vec::new();
    loop {
        buffer.clear();
        match reader.read_until(b'\n', &mut buffer).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buffer);
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(trimmed) {
                    Ok(frame) => handler.on_line(frame),
                    Err(error) => {
                        tracing::warn!(server = %server, error = %error, "sidecar emitted a non-json line");
                        handler.on_diagnostic(TransportDiagnostic::InvalidJson {
                            line: trimmed.to_string(),
                            detail: error.to_string(),
                        });
                    }
                }
            }
            Err(error) => {
                tracing::warn!(server = %server, error = %error, "sidecar stdout read failed");
                break;
            }
        }
    }
}

async fn forward_stderr_lines<R>(server: String, stderr: R, handler: Arc<dyn TransportHandler>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stderr);
    let mut buffer = Vec::new();
    loop {
        buffer.clear();
        match reader.read_until(b'\n', &mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buffer).trim_end().to_string();
                if line.is_empty() {
                    continue;
                }
                tracing::debug!(server = %server, line = %line, "sidecar stderr");
                handler.on_diagnostic(TransportDiagnostic::Stderr { line });
            }
        }
    }
}

async fn supervise_exit(
    server: String,
    mut child: Child,
    kill: oneshot::Receiver<()>,
    reader: tokio::task::JoinHandle<()>,
    closed: Arc<AtomicBool>,
    handler: Arc<dyn TransportHandler>,
    exit: watch::Sender<Option<Option<i32>>>,
) {
    // A dropped kill sender means the transport itself was dropped.
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill => {
            let _ = child.start_kill();
            child.wait().await
        }
    };
    closed.store(true, Ordering::SeqCst);
    let exit_code = match status {
        Ok(status) => status.code(),
        Err(error) => {
            tracing::warn!(server = %server, error = %error, "failed to wait for sidecar exit");
            None
        }
    };
    if tokio::time::timeout(READER_DRAIN_TIMEOUT, reader)
        .await
        .is_err()
    {
        tracing::warn!(server = %server, "sidecar stdout still open after exit");
    }
    tracing::debug!(server = %server, exit_code = ?exit_code, "sidecar exited");
    handler.on_exit(exit_code);
    let _ = exit.send(Some(exit_code));
}
