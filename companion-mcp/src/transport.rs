//! Newline-delimited JSON-RPC 2.0 over a child process's stdio.
//!
//! Requests carry monotonically increasing ids and park a oneshot
//! continuation in a pending map; the stdout reader resolves them as frames
//! arrive, so any number of requests may be in flight. Timeouts reject only
//! their own awaiter and late responses are dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::debug;

use companion_core::config::ToolServerConfig;

use crate::protocol::{IncomingFrame, JsonRpcNotification, JsonRpcRequest};
use crate::ToolServerError;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const TERM_GRACE: Duration = Duration::from_secs(3);
const STDERR_KEEP: usize = 10_000;
const STDERR_COMPACT_AT: usize = 20_000;

/// Receives notifications (frames with a method and no id).
pub type NotificationHandler = Box<dyn Fn(&str, Option<&Value>) + Send + Sync>;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, ToolServerError>>>>>;

enum KillRequest {
    Terminate,
    Kill,
}

#[derive(Debug)]
pub struct StdioTransport {
    name: String,
    next_id: AtomicU64,
    stdin: Mutex<Option<ChildStdin>>,
    pending: PendingMap,
    stderr_ring: Arc<Mutex<String>>,
    kill_tx: mpsc::UnboundedSender<KillRequest>,
    exit_rx: watch::Receiver<Option<i64>>,
    closed: AtomicBool,
    request_timeout: Duration,
}

impl StdioTransport {
    /// Spawn the configured child and wire up its streams. Spawn failures
    /// (command not found, permission) surface here directly.
    pub fn spawn(
        name: &str,
        config: &ToolServerConfig,
        request_timeout: Duration,
        notification_handler: Option<NotificationHandler>,
    ) -> Result<Self, ToolServerError> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);
        // Declared env is merged over the daemon's own environment.
        for (key, value) in &config.env {
            cmd.env(key, value);
        }
        if let Some(cwd) = config.cwd.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            cmd.current_dir(cwd);
        }
        cmd.stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = cmd.spawn().map_err(|err| {
            ToolServerError::SpawnFailed(format!("failed to spawn '{}': {err}", config.command))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ToolServerError::SpawnFailed("failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ToolServerError::SpawnFailed("failed to capture stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ToolServerError::SpawnFailed("failed to capture stderr".into()))?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let stderr_ring = Arc::new(Mutex::new(String::new()));
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();

        tokio::spawn(read_frames(
            name.to_string(),
            stdout,
            Arc::clone(&pending),
            notification_handler,
        ));
        tokio::spawn(read_stderr(stderr, Arc::clone(&stderr_ring)));
        // The monitor holds its own sender so the kill channel never closes
        // underneath the select loop.
        tokio::spawn(monitor_child(
            name.to_string(),
            child,
            kill_rx,
            kill_tx.clone(),
            exit_tx,
            Arc::clone(&pending),
        ));

        Ok(Self {
            name: name.to_string(),
            next_id: AtomicU64::new(1),
            stdin: Mutex::new(Some(stdin)),
            pending,
            stderr_ring,
            kill_tx,
            exit_rx,
            closed: AtomicBool::new(false),
            request_timeout,
        })
    }

    /// Send a request and await its response. On timeout the pending entry is
    /// removed so a late response is dropped by the reader.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, ToolServerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ToolServerError::Closed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let frame = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;
        if let Err(err) = self.write_line(&frame).await {
            self.pending.lock().await.remove(&id);
            return Err(err);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ToolServerError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(ToolServerError::Timeout)
            }
        }
    }

    /// Fire-and-forget notification.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ToolServerError> {
        let frame = serde_json::to_string(&JsonRpcNotification::new(method, params))?;
        self.write_line(&frame).await
    }

    async fn write_line(&self, line: &str) -> Result<(), ToolServerError> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(ToolServerError::Closed)?;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|err| ToolServerError::Transport(format!("stdin write failed: {err}")))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|err| ToolServerError::Transport(format!("stdin write failed: {err}")))?;
        stdin
            .flush()
            .await
            .map_err(|err| ToolServerError::Transport(format!("stdin flush failed: {err}")))?;
        Ok(())
    }

    /// Idempotent teardown: reject pending requests, close stdin, terminate
    /// the child and escalate to a kill after a grace period.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(server = %self.name, "closing tool server transport");
        {
            let mut pending = self.pending.lock().await;
            for (_, tx) in pending.drain() {
                let _ = tx.send(Err(ToolServerError::Closed));
            }
        }
        self.stdin.lock().await.take();

        if self.exit_rx.borrow().is_some() {
            return;
        }
        let _ = self.kill_tx.send(KillRequest::Terminate);
        let mut exit_rx = self.exit_rx.clone();
        let kill_tx = self.kill_tx.clone();
        tokio::spawn(async move {
            let exited = tokio::time::timeout(TERM_GRACE, async {
                while exit_rx.borrow().is_none() {
                    if exit_rx.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await;
            if exited.is_err() {
                let _ = kill_tx.send(KillRequest::Kill);
            }
        });
    }

    /// Exit code once the child has gone away; `None` while it is running.
    pub fn exit_code(&self) -> Option<i64> {
        *self.exit_rx.borrow()
    }

    /// Resolves with the exit code when the child exits.
    pub async fn wait_exit(&self) -> i64 {
        let mut rx = self.exit_rx.clone();
        loop {
            if let Some(code) = *rx.borrow() {
                return code;
            }
            if rx.changed().await.is_err() {
                return -1;
            }
        }
    }

    /// Tail of the child's stderr, for diagnostics.
    pub async fn stderr_tail(&self) -> String {
        self.stderr_ring.lock().await.clone()
    }
}

async fn read_frames(
    name: String,
    stdout: tokio::process::ChildStdout,
    pending: PendingMap,
    notification_handler: Option<NotificationHandler>,
) {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Ok(frame) = serde_json::from_str::<IncomingFrame>(trimmed) else {
            // Children sometimes log to stdout; non-frames are dropped.
            debug!(server = %name, line = trimmed, "ignoring non-JSON-RPC line");
            continue;
        };
        if let Some(id) = frame.id {
            if frame.result.is_none() && frame.error.is_none() {
                continue;
            }
            let Some(tx) = pending.lock().await.remove(&id) else {
                debug!(server = %name, id, "late or unmatched response dropped");
                continue;
            };
            let outcome = match frame.error {
                Some(error) => Err(ToolServerError::Rpc {
                    code: error.code,
                    message: error.message,
                    data: error.data,
                }),
                None => Ok(frame.result.unwrap_or(Value::Null)),
            };
            let _ = tx.send(outcome);
        } else if let Some(method) = frame.method {
            match &notification_handler {
                Some(handler) => handler(&method, frame.params.as_ref()),
                None => debug!(server = %name, method, "notification dropped (no handler)"),
            }
        }
    }
}

async fn read_stderr(stderr: tokio::process::ChildStderr, ring: Arc<Mutex<String>>) {
    let mut reader = BufReader::new(stderr);
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let mut buffer = ring.lock().await;
                buffer.push_str(&String::from_utf8_lossy(&chunk[..n]));
                if buffer.len() > STDERR_COMPACT_AT {
                    let cut = buffer.len() - STDERR_KEEP;
                    let boundary = (cut..buffer.len())
                        .find(|&i| buffer.is_char_boundary(i))
                        .unwrap_or(buffer.len());
                    buffer.drain(..boundary);
                }
            }
        }
    }
}

async fn monitor_child(
    name: String,
    mut child: Child,
    mut kill_rx: mpsc::UnboundedReceiver<KillRequest>,
    keep_alive: mpsc::UnboundedSender<KillRequest>,
    exit_tx: watch::Sender<Option<i64>>,
    pending: PendingMap,
) {
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            request = kill_rx.recv() => match request {
                Some(KillRequest::Terminate) => terminate_child(&mut child),
                Some(KillRequest::Kill) | None => {
                    let _ = child.start_kill();
                }
            },
        }
    };
    drop(keep_alive);
    let code = match status {
        Ok(status) => status.code().map(i64::from).unwrap_or(-1),
        Err(_) => -1,
    };
    debug!(server = %name, code, "tool server exited");
    {
        let mut pending = pending.lock().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(ToolServerError::Transport(
                "tool server exited".into(),
            )));
        }
    }
    let _ = exit_tx.send(Some(code));
}

#[cfg(unix)]
fn terminate_child(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match child.id() {
        Some(pid) => {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
        None => {
            let _ = child.start_kill();
        }
    }
}

#[cfg(not(unix))]
fn terminate_child(child: &mut Child) {
    let _ = child.start_kill();
}
