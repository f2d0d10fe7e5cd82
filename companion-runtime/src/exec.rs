//! One-shot command execution with bounded output capture and timeout
//! escalation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::ring::OutputRing;
use crate::shell::{graceful_kill, pump_stream, shell_command};

#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: String,
    pub cwd: PathBuf,
    pub timeout_ms: u64,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecResult {
    pub ok: bool,
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration_ms: i64,
}

/// Run a literal command string through the user shell, collecting stdout and
/// stderr into tail-retaining rings. On timeout the child receives a
/// terminate, then a kill after the grace period, and `timed_out` is set.
pub async fn run_command(request: ExecRequest) -> ExecResult {
    let started = Instant::now();
    let mut cmd = shell_command(&request.command);
    cmd.current_dir(&request.cwd);
    for (key, value) in &request.env {
        cmd.env(key, value);
    }
    cmd.stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            return ExecResult {
                ok: false,
                exit_code: -1,
                stdout: String::new(),
                stderr: err.to_string(),
                timed_out: false,
                duration_ms: started.elapsed().as_millis() as i64,
            };
        }
    };

    let stdout_ring = Arc::new(Mutex::new(OutputRing::default()));
    let stderr_ring = Arc::new(Mutex::new(OutputRing::default()));
    let stdout_task = child
        .stdout
        .take()
        .map(|stream| tokio::spawn(pump_stream(stream, Arc::clone(&stdout_ring))));
    let stderr_task = child
        .stderr
        .take()
        .map(|stream| tokio::spawn(pump_stream(stream, Arc::clone(&stderr_ring))));

    let timeout = std::time::Duration::from_millis(request.timeout_ms);
    let mut timed_out = false;
    let exit_code = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => status.code().map(i64::from).unwrap_or(-1),
        Ok(Err(err)) => {
            debug!(error = %err, "wait on exec child failed");
            -1
        }
        Err(_) => {
            timed_out = true;
            graceful_kill(&mut child).await;
            -1
        }
    };

    if let Some(task) = stdout_task {
        let _ = task.await;
    }
    if let Some(task) = stderr_task {
        let _ = task.await;
    }

    let stdout = stdout_ring.lock().await.as_str().to_string();
    let stderr = stderr_ring.lock().await.as_str().to_string();
    ExecResult {
        ok: !timed_out && exit_code == 0,
        exit_code,
        stdout,
        stderr,
        timed_out,
        duration_ms: started.elapsed().as_millis() as i64,
    }
}
