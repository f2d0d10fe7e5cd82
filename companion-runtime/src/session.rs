//! Long-lived interactive shell sessions: spawn, stdin writes and key
//! injection, bounded output capture, exit fan-out, and background pruning.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use companion_core::ids::new_id;
use companion_core::time::now_ms;

use crate::events::{EventLog, SessionEvent};
use crate::ring::OutputRing;
use crate::shell::{pump_stream, shell_command, KILL_GRACE};
use crate::RuntimeError;

const LIST_LIMIT_DEFAULT: usize = 50;
const LIST_LIMIT_MAX: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Exited,
}

impl SessionStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "exited" => Some(Self::Exited),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSelector {
    Stdout,
    Stderr,
    Both,
}

impl StreamSelector {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stdout" => Some(Self::Stdout),
            "stderr" => Some(Self::Stderr),
            "both" => Some(Self::Both),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionRequest {
    /// Pre-allocated session id; callers that correlate the session with
    /// other records can reserve the id before the child exists. Generated
    /// when absent.
    pub id: Option<String>,
    pub command: String,
    pub cwd: PathBuf,
    pub timeout_ms: u64,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: String,
    pub command: String,
    pub cwd: String,
    pub status: SessionStatus,
    pub timed_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    pub started_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    pub stdout_chars: usize,
    pub stderr_chars: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPage {
    pub sessions: Vec<SessionSnapshot>,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogSlice {
    pub output: String,
    pub total: usize,
    pub next_offset: usize,
    pub has_more: bool,
}

#[derive(Debug)]
pub enum SessionLog {
    Single(LogSlice),
    Both { stdout: LogSlice, stderr: LogSlice },
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_sessions: usize,
    pub exited_ttl: Duration,
    pub prune_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 200,
            exited_ttl: Duration::from_secs(3600),
            prune_interval: Duration::from_secs(60),
        }
    }
}

enum SessionSignal {
    Terminate,
    Kill,
}

type ExitListener = Arc<dyn Fn(&SessionSnapshot) + Send + Sync>;

struct SessionRecord {
    id: String,
    command: String,
    cwd: PathBuf,
    status: SessionStatus,
    stdout: Arc<Mutex<OutputRing>>,
    stderr: Arc<Mutex<OutputRing>>,
    timed_out: bool,
    exit_code: Option<i64>,
    started_at: i64,
    finished_at: Option<i64>,
    stdin: Option<ChildStdin>,
    pid: Option<u32>,
    kill_tx: mpsc::UnboundedSender<SessionSignal>,
}

impl SessionRecord {
    fn sort_key(&self) -> i64 {
        self.finished_at.unwrap_or(self.started_at)
    }
}

struct Inner {
    sessions: Mutex<HashMap<String, SessionRecord>>,
    events: Mutex<EventLog>,
    listeners: Mutex<Vec<ExitListener>>,
    config: SessionConfig,
    pruner: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: Mutex::new(HashMap::new()),
                events: Mutex::new(EventLog::default()),
                listeners: Mutex::new(Vec::new()),
                config,
                pruner: Mutex::new(None),
            }),
        }
    }

    /// Exit listeners receive the final snapshot of every session; panics in
    /// a listener are contained.
    pub async fn add_exit_listener(&self, listener: impl Fn(&SessionSnapshot) + Send + Sync + 'static) {
        self.inner.listeners.lock().await.push(Arc::new(listener));
    }

    pub async fn clear_exit_listeners(&self) {
        self.inner.listeners.lock().await.clear();
    }

    /// Spawn a session. A spawn failure still yields a (finalized) session
    /// record with exit code −1 and the error on stderr.
    pub async fn start_session(&self, request: SessionRequest) -> SessionSnapshot {
        prune(&self.inner).await;

        let id = request.id.clone().filter(|id| !id.is_empty()).unwrap_or_else(new_id);
        let started_at = now_ms();
        let stdout_ring = Arc::new(Mutex::new(OutputRing::default()));
        let stderr_ring = Arc::new(Mutex::new(OutputRing::default()));
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();

        let mut cmd = shell_command(&request.command);
        cmd.current_dir(&request.cwd);
        for (key, value) in &request.env {
            cmd.env(key, value);
        }
        cmd.stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        match cmd.spawn() {
            Ok(mut child) => {
                let stdin = child.stdin.take();
                if let Some(stream) = child.stdout.take() {
                    tokio::spawn(pump_stream(stream, Arc::clone(&stdout_ring)));
                }
                if let Some(stream) = child.stderr.take() {
                    tokio::spawn(pump_stream(stream, Arc::clone(&stderr_ring)));
                }
                let pid = child.id();
                let record = SessionRecord {
                    id: id.clone(),
                    command: request.command,
                    cwd: request.cwd,
                    status: SessionStatus::Running,
                    stdout: stdout_ring,
                    stderr: stderr_ring,
                    timed_out: false,
                    exit_code: None,
                    started_at,
                    finished_at: None,
                    stdin,
                    pid,
                    kill_tx,
                };
                let keep_alive = record.kill_tx.clone();
                let snapshot = snapshot_of(&record).await;
                self.inner.sessions.lock().await.insert(id.clone(), record);
                debug!(session = %id, pid = ?pid, "session started");

                let inner = Arc::clone(&self.inner);
                let timeout = Duration::from_millis(request.timeout_ms.max(1));
                tokio::spawn(wait_session(inner, id, child, kill_rx, keep_alive, timeout));
                snapshot
            }
            Err(err) => {
                stderr_ring.lock().await.push(&err.to_string());
                let record = SessionRecord {
                    id: id.clone(),
                    command: request.command,
                    cwd: request.cwd,
                    status: SessionStatus::Running,
                    stdout: stdout_ring,
                    stderr: stderr_ring,
                    timed_out: false,
                    exit_code: None,
                    started_at,
                    finished_at: None,
                    stdin: None,
                    pid: None,
                    kill_tx,
                };
                self.inner.sessions.lock().await.insert(id.clone(), record);
                warn!(session = %id, error = %err, "session spawn failed");
                finalize(&self.inner, &id, -1, false).await;
                self.get_session(&id).await.unwrap_or(SessionSnapshot {
                    id,
                    command: String::new(),
                    cwd: String::new(),
                    status: SessionStatus::Exited,
                    timed_out: false,
                    exit_code: Some(-1),
                    started_at,
                    finished_at: Some(started_at),
                    duration_ms: Some(0),
                    stdout_chars: 0,
                    stderr_chars: 0,
                })
            }
        }
    }

    pub async fn get_session(&self, id: &str) -> Option<SessionSnapshot> {
        let sessions = self.inner.sessions.lock().await;
        match sessions.get(id) {
            Some(record) => Some(snapshot_of(record).await),
            None => None,
        }
    }

    /// Write UTF-8 text to the session's stdin, appending a newline when
    /// `submit` is set.
    pub async fn write_to_session(
        &self,
        id: &str,
        text: &str,
        submit: bool,
    ) -> Result<(), RuntimeError> {
        let mut sessions = self.inner.sessions.lock().await;
        let record = sessions
            .get_mut(id)
            .ok_or_else(|| RuntimeError::SessionNotFound(id.to_string()))?;
        if record.status != SessionStatus::Running {
            return Err(RuntimeError::NotRunning(id.to_string()));
        }
        let stdin = record
            .stdin
            .as_mut()
            .ok_or_else(|| RuntimeError::StdinClosed(id.to_string()))?;
        stdin.write_all(text.as_bytes()).await?;
        if submit {
            stdin.write_all(b"\n").await?;
        }
        stdin.flush().await?;
        Ok(())
    }

    /// Inject a control key: `ctrl-c`/`ctrl-z` deliver signals, `ctrl-d`
    /// closes stdin, `enter`/`tab`/`escape` write the corresponding byte.
    pub async fn send_keys(&self, id: &str, key: &str) -> Result<(), RuntimeError> {
        let normalized = key.trim().to_lowercase();
        match normalized.as_str() {
            "ctrl-c" => self.signal_session(id, SessionInterrupt::Interrupt).await,
            "ctrl-z" => self.signal_session(id, SessionInterrupt::Stop).await,
            "ctrl-d" => {
                let mut sessions = self.inner.sessions.lock().await;
                let record = sessions
                    .get_mut(id)
                    .ok_or_else(|| RuntimeError::SessionNotFound(id.to_string()))?;
                if record.status != SessionStatus::Running {
                    return Err(RuntimeError::NotRunning(id.to_string()));
                }
                record.stdin = None;
                Ok(())
            }
            "enter" => self.write_to_session(id, "\n", false).await,
            "tab" => self.write_to_session(id, "\t", false).await,
            "escape" | "esc" => self.write_to_session(id, "\x1b", false).await,
            _ => Err(RuntimeError::UnknownKey(key.to_string())),
        }
    }

    async fn signal_session(&self, id: &str, kind: SessionInterrupt) -> Result<(), RuntimeError> {
        let sessions = self.inner.sessions.lock().await;
        let record = sessions
            .get(id)
            .ok_or_else(|| RuntimeError::SessionNotFound(id.to_string()))?;
        if record.status != SessionStatus::Running {
            return Err(RuntimeError::NotRunning(id.to_string()));
        }
        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            let pid = record
                .pid
                .ok_or_else(|| RuntimeError::NotRunning(id.to_string()))?;
            let signal = match kind {
                SessionInterrupt::Interrupt => Signal::SIGINT,
                SessionInterrupt::Stop => Signal::SIGTSTP,
            };
            let _ = killpg(Pid::from_raw(pid as i32), signal);
            Ok(())
        }
        #[cfg(not(unix))]
        {
            let _ = (record, kind);
            Err(RuntimeError::SignalsUnsupported)
        }
    }

    /// Terminate a session, escalating to a kill after the grace period;
    /// `force` kills immediately. Stopping an exited session is a no-op.
    pub async fn stop_session(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        let sessions = self.inner.sessions.lock().await;
        let record = sessions
            .get(id)
            .ok_or_else(|| RuntimeError::SessionNotFound(id.to_string()))?;
        if record.status == SessionStatus::Exited {
            return Ok(());
        }
        let signal = if force {
            SessionSignal::Kill
        } else {
            SessionSignal::Terminate
        };
        let _ = record.kill_tx.send(signal);
        Ok(())
    }

    /// Light snapshots, most recent first (`finished_at` when set, else
    /// `started_at`, descending).
    pub async fn list_sessions(
        &self,
        status: Option<SessionStatus>,
        offset: usize,
        limit: Option<usize>,
    ) -> SessionPage {
        let limit = limit.unwrap_or(LIST_LIMIT_DEFAULT).clamp(1, LIST_LIMIT_MAX);
        let sessions = self.inner.sessions.lock().await;
        let mut matched: Vec<&SessionRecord> = sessions
            .values()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .collect();
        matched.sort_by_key(|r| std::cmp::Reverse((r.sort_key(), r.started_at)));
        let total = matched.len();
        let mut page = Vec::new();
        for record in matched.into_iter().skip(offset).take(limit) {
            page.push(snapshot_of(record).await);
        }
        let has_more = offset.min(total) + page.len() < total;
        SessionPage {
            sessions: page,
            total,
            offset,
            limit,
            has_more,
        }
    }

    /// Exact character slice of one or both output streams.
    pub async fn session_log(
        &self,
        id: &str,
        stream: StreamSelector,
        offset: usize,
        limit: usize,
    ) -> Result<SessionLog, RuntimeError> {
        let sessions = self.inner.sessions.lock().await;
        let record = sessions
            .get(id)
            .ok_or_else(|| RuntimeError::SessionNotFound(id.to_string()))?;
        let slice_of = |ring: &OutputRing| {
            let (output, total, next_offset, has_more) = ring.slice(offset, limit);
            LogSlice {
                output,
                total,
                next_offset,
                has_more,
            }
        };
        match stream {
            StreamSelector::Stdout => {
                let ring = record.stdout.lock().await;
                Ok(SessionLog::Single(slice_of(&ring)))
            }
            StreamSelector::Stderr => {
                let ring = record.stderr.lock().await;
                Ok(SessionLog::Single(slice_of(&ring)))
            }
            StreamSelector::Both => {
                let stdout = slice_of(&*record.stdout.lock().await);
                let stderr = slice_of(&*record.stderr.lock().await);
                Ok(SessionLog::Both { stdout, stderr })
            }
        }
    }

    pub async fn events_after(&self, after: u64, limit: usize) -> Vec<SessionEvent> {
        self.inner.events.lock().await.list_after(after, limit)
    }

    pub async fn latest_event_cursor(&self) -> u64 {
        self.inner.events.lock().await.latest_cursor()
    }

    /// Remove exited sessions past the TTL and enforce the session cap,
    /// oldest first; also runs before every new session.
    pub async fn prune_now(&self) {
        prune(&self.inner).await;
    }

    /// Arm the periodic pruner.
    pub async fn start_pruner(&self) {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(inner.config.prune_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                prune(&inner).await;
            }
        });
        if let Some(previous) = self.inner.pruner.lock().await.replace(handle) {
            previous.abort();
        }
    }

    /// Stop the pruner and kill every live session.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.inner.pruner.lock().await.take() {
            handle.abort();
        }
        let sessions = self.inner.sessions.lock().await;
        for record in sessions.values() {
            if record.status == SessionStatus::Running {
                let _ = record.kill_tx.send(SessionSignal::Kill);
            }
        }
    }
}

enum SessionInterrupt {
    Interrupt,
    Stop,
}

async fn snapshot_of(record: &SessionRecord) -> SessionSnapshot {
    let stdout_chars = record.stdout.lock().await.char_len();
    let stderr_chars = record.stderr.lock().await.char_len();
    SessionSnapshot {
        id: record.id.clone(),
        command: record.command.clone(),
        cwd: record.cwd.to_string_lossy().into_owned(),
        status: record.status,
        timed_out: record.timed_out,
        exit_code: record.exit_code,
        started_at: record.started_at,
        finished_at: record.finished_at,
        duration_ms: record
            .finished_at
            .map(|end| (end - record.started_at).max(0)),
        stdout_chars,
        stderr_chars,
    }
}

async fn prune(inner: &Arc<Inner>) {
    let now = now_ms();
    let ttl = inner.config.exited_ttl.as_millis() as i64;
    let mut sessions = inner.sessions.lock().await;
    sessions.retain(|_, record| {
        !(record.status == SessionStatus::Exited
            && record.finished_at.is_some_and(|finished| now - finished >= ttl))
    });
    if sessions.len() > inner.config.max_sessions {
        let mut by_age: Vec<(String, i64)> = sessions
            .iter()
            .map(|(id, record)| (id.clone(), record.sort_key()))
            .collect();
        by_age.sort_by_key(|(_, at)| *at);
        let excess = sessions.len() - inner.config.max_sessions;
        for (id, _) in by_age.into_iter().take(excess) {
            if let Some(record) = sessions.remove(&id) {
                if record.status == SessionStatus::Running {
                    let _ = record.kill_tx.send(SessionSignal::Kill);
                }
            }
        }
    }
}

fn far_future() -> tokio::time::Instant {
    tokio::time::Instant::now() + Duration::from_secs(86_400 * 365)
}

async fn wait_session(
    inner: Arc<Inner>,
    id: String,
    mut child: Child,
    mut kill_rx: mpsc::UnboundedReceiver<SessionSignal>,
    keep_alive: mpsc::UnboundedSender<SessionSignal>,
    timeout: Duration,
) {
    let mut timed_out = false;
    let mut escalating = false;
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let status = loop {
        tokio::select! {
            status = child.wait() => break status.ok(),
            () = &mut deadline => {
                if escalating {
                    force_kill(&mut child).await;
                    deadline.as_mut().reset(far_future());
                } else {
                    timed_out = true;
                    escalating = true;
                    terminate(&mut child);
                    deadline.as_mut().reset(tokio::time::Instant::now() + KILL_GRACE);
                }
            }
            request = kill_rx.recv() => match request {
                Some(SessionSignal::Terminate) => {
                    if !escalating {
                        escalating = true;
                        terminate(&mut child);
                        deadline.as_mut().reset(tokio::time::Instant::now() + KILL_GRACE);
                    }
                }
                Some(SessionSignal::Kill) | None => force_kill(&mut child).await,
            },
        }
    };
    drop(keep_alive);

    let exit_code = status.and_then(|s| s.code()).map(i64::from).unwrap_or(-1);
    finalize(&inner, &id, exit_code, timed_out).await;
}

fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        crate::shell::signal_group(child, nix::sys::signal::Signal::SIGTERM);
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }
}

async fn force_kill(child: &mut Child) {
    #[cfg(unix)]
    {
        crate::shell::signal_group(child, nix::sys::signal::Signal::SIGKILL);
    }
    let _ = child.start_kill();
}

/// Finalize once: set the exit summary, append a `session_exited` event and
/// fan out to listeners. A second call for the same session is a no-op.
async fn finalize(inner: &Arc<Inner>, id: &str, exit_code: i64, timed_out: bool) {
    let snapshot = {
        let mut sessions = inner.sessions.lock().await;
        let Some(record) = sessions.get_mut(id) else {
            return;
        };
        if record.status == SessionStatus::Exited {
            return;
        }
        record.status = SessionStatus::Exited;
        record.exit_code = Some(exit_code);
        record.timed_out = record.timed_out || timed_out;
        record.finished_at = Some(now_ms());
        record.stdin = None;
        snapshot_of(record).await
    };

    {
        let mut events = inner.events.lock().await;
        events.append(SessionEvent {
            cursor: 0,
            event: "session_exited".into(),
            session_id: snapshot.id.clone(),
            command: snapshot.command.clone(),
            cwd: snapshot.cwd.clone(),
            timed_out: snapshot.timed_out,
            exit_code: snapshot.exit_code.unwrap_or(-1),
            started_at: snapshot.started_at,
            finished_at: snapshot.finished_at.unwrap_or(snapshot.started_at),
            duration_ms: snapshot.duration_ms.unwrap_or(0),
        });
    }

    let listeners = inner.listeners.lock().await.clone();
    for listener in listeners {
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| listener(&snapshot)));
        if outcome.is_err() {
            warn!(session = %id, "exit listener panicked");
        }
    }
    debug!(session = %id, exit_code, timed_out, "session finalized");
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn manager() -> SessionManager {
        SessionManager::new(SessionConfig::default())
    }

    fn request(command: &str, timeout_ms: u64) -> SessionRequest {
        SessionRequest {
            id: None,
            command: command.into(),
            cwd: std::env::temp_dir(),
            timeout_ms,
            env: HashMap::new(),
        }
    }

    async fn wait_until<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if check().await {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        })
        .await
        .expect("condition within deadline");
    }

    #[tokio::test]
    async fn interactive_session_echoes_stdin_and_exits_on_interrupt() {
        let manager = manager();
        let baseline = manager.latest_event_cursor().await;
        let session = manager.start_session(request("cat", 60_000)).await;
        assert_eq!(session.status, SessionStatus::Running);

        manager
            .write_to_session(&session.id, "hello", true)
            .await
            .expect("write");

        let id = session.id.clone();
        let mgr = manager.clone();
        wait_until(|| {
            let mgr = mgr.clone();
            let id = id.clone();
            async move {
                match mgr
                    .session_log(&id, StreamSelector::Stdout, 0, 100)
                    .await
                {
                    Ok(SessionLog::Single(slice)) => slice.output.contains("hello\n"),
                    _ => false,
                }
            }
        })
        .await;

        manager.send_keys(&session.id, "ctrl-c").await.expect("keys");
        let mgr = manager.clone();
        let id = session.id.clone();
        wait_until(|| {
            let mgr = mgr.clone();
            let id = id.clone();
            async move {
                mgr.get_session(&id)
                    .await
                    .is_some_and(|s| s.status == SessionStatus::Exited)
            }
        })
        .await;

        let events = manager.events_after(baseline, 100).await;
        let exit = events
            .iter()
            .find(|e| e.session_id == session.id)
            .expect("session_exited event");
        assert_eq!(exit.event, "session_exited");
        assert!(exit.cursor > baseline);
        assert!(exit.duration_ms >= 0);
    }

    #[tokio::test]
    async fn log_paging_returns_exact_slices() {
        let manager = manager();
        let session = manager
            .start_session(request(
                "printf 0123456789; printf abcdefghij >&2",
                10_000,
            ))
            .await;

        let mgr = manager.clone();
        let id = session.id.clone();
        wait_until(|| {
            let mgr = mgr.clone();
            let id = id.clone();
            async move {
                mgr.get_session(&id)
                    .await
                    .is_some_and(|s| s.status == SessionStatus::Exited)
            }
        })
        .await;

        match manager
            .session_log(&session.id, StreamSelector::Stdout, 2, 4)
            .await
            .expect("log")
        {
            SessionLog::Single(slice) => {
                assert_eq!(slice.output, "2345");
                assert_eq!(slice.total, 10);
                assert_eq!(slice.next_offset, 6);
                assert!(slice.has_more);
            }
            other => panic!("expected single slice, got {other:?}"),
        }

        match manager
            .session_log(&session.id, StreamSelector::Both, 3, 4)
            .await
            .expect("log")
        {
            SessionLog::Both { stdout, stderr } => {
                assert_eq!(stdout.output, "3456");
                assert_eq!(stderr.output, "defg");
            }
            other => panic!("expected both slices, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn session_timeout_terminates_and_flags() {
        let manager = manager();
        let session = manager.start_session(request("sleep 30", 200)).await;

        let mgr = manager.clone();
        let id = session.id.clone();
        wait_until(|| {
            let mgr = mgr.clone();
            let id = id.clone();
            async move {
                mgr.get_session(&id)
                    .await
                    .is_some_and(|s| s.status == SessionStatus::Exited)
            }
        })
        .await;

        let done = manager.get_session(&session.id).await.expect("session");
        assert!(done.timed_out);
        assert_eq!(done.exit_code, Some(-1));
        assert!(done.finished_at.is_some());
    }

    #[tokio::test]
    async fn force_stop_kills_immediately_and_is_idempotent() {
        let manager = manager();
        let session = manager.start_session(request("sleep 30", 60_000)).await;

        manager.stop_session(&session.id, true).await.expect("stop");
        let mgr = manager.clone();
        let id = session.id.clone();
        wait_until(|| {
            let mgr = mgr.clone();
            let id = id.clone();
            async move {
                mgr.get_session(&id)
                    .await
                    .is_some_and(|s| s.status == SessionStatus::Exited)
            }
        })
        .await;

        // Stopping an exited session is a no-op, not an error.
        manager.stop_session(&session.id, false).await.expect("stop again");
        let done = manager.get_session(&session.id).await.expect("session");
        assert!(!done.timed_out, "explicit stop is not a timeout");
    }

    #[tokio::test]
    async fn writes_to_exited_sessions_fail() {
        let manager = manager();
        let session = manager.start_session(request("true", 10_000)).await;
        let mgr = manager.clone();
        let id = session.id.clone();
        wait_until(|| {
            let mgr = mgr.clone();
            let id = id.clone();
            async move {
                mgr.get_session(&id)
                    .await
                    .is_some_and(|s| s.status == SessionStatus::Exited)
            }
        })
        .await;

        let err = manager
            .write_to_session(&session.id, "late", true)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::NotRunning(_)));

        let err = manager.send_keys(&session.id, "wiggle").await.unwrap_err();
        assert!(matches!(err, RuntimeError::UnknownKey(_)));
    }

    #[tokio::test]
    async fn ctrl_d_closes_stdin_and_lets_cat_finish() {
        let manager = manager();
        let session = manager.start_session(request("cat", 60_000)).await;
        manager
            .write_to_session(&session.id, "bye", true)
            .await
            .expect("write");
        manager.send_keys(&session.id, "ctrl-d").await.expect("ctrl-d");

        let mgr = manager.clone();
        let id = session.id.clone();
        wait_until(|| {
            let mgr = mgr.clone();
            let id = id.clone();
            async move {
                mgr.get_session(&id)
                    .await
                    .is_some_and(|s| s.status == SessionStatus::Exited && s.exit_code == Some(0))
            }
        })
        .await;

        let err = manager
            .write_to_session(&session.id, "more", false)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::NotRunning(_)));
    }

    #[tokio::test]
    async fn spawn_error_finalizes_with_negative_exit() {
        let manager = manager();
        let session = manager
            .start_session(SessionRequest {
                id: None,
                command: "true".into(),
                cwd: PathBuf::from("/definitely/not/a/dir"),
                timeout_ms: 1_000,
                env: HashMap::new(),
            })
            .await;
        assert_eq!(session.status, SessionStatus::Exited);
        assert_eq!(session.exit_code, Some(-1));

        match manager
            .session_log(&session.id, StreamSelector::Stderr, 0, 500)
            .await
            .expect("log")
        {
            SessionLog::Single(slice) => assert!(!slice.output.is_empty()),
            other => panic!("expected stderr slice, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn pruner_enforces_ttl_and_cap() {
        let manager = SessionManager::new(SessionConfig {
            max_sessions: 1,
            exited_ttl: Duration::from_millis(0),
            prune_interval: Duration::from_secs(60),
        });
        let a = manager.start_session(request("true", 10_000)).await;
        let mgr = manager.clone();
        let id = a.id.clone();
        wait_until(|| {
            let mgr = mgr.clone();
            let id = id.clone();
            async move {
                mgr.get_session(&id)
                    .await
                    .is_some_and(|s| s.status == SessionStatus::Exited)
            }
        })
        .await;

        // TTL of zero: the exited session is pruned on the next pass.
        manager.prune_now().await;
        assert!(manager.get_session(&a.id).await.is_none());
    }

    #[tokio::test]
    async fn list_sessions_sorts_and_pages() {
        let manager = manager();
        let first = manager.start_session(request("true", 10_000)).await;
        let mgr = manager.clone();
        let id = first.id.clone();
        wait_until(|| {
            let mgr = mgr.clone();
            let id = id.clone();
            async move {
                mgr.get_session(&id)
                    .await
                    .is_some_and(|s| s.status == SessionStatus::Exited)
            }
        })
        .await;
        let second = manager.start_session(request("sleep 5", 30_000)).await;

        let page = manager.list_sessions(None, 0, None).await;
        assert_eq!(page.total, 2);
        assert!(!page.has_more);

        let running = manager
            .list_sessions(Some(SessionStatus::Running), 0, None)
            .await;
        assert_eq!(running.total, 1);
        assert_eq!(running.sessions[0].id, second.id);

        let paged = manager.list_sessions(None, 1, Some(1)).await;
        assert_eq!(paged.sessions.len(), 1);
        assert!(!paged.has_more);

        manager.stop_session(&second.id, true).await.expect("stop");
    }
}
