//! Shell selection and child-process signalling shared by one-shot exec and
//! interactive sessions.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::ring::OutputRing;

/// Grace period between terminate and kill.
pub const KILL_GRACE: Duration = Duration::from_secs(3);

/// Build the user-shell invocation for a literal command string:
/// `$SHELL -lc <cmd>` (fallback `/bin/bash`) on Unix, `cmd.exe /d /s /c` on
/// Windows. The child is placed in its own process group so signals reach
/// the whole pipeline.
pub fn shell_command(command: &str) -> Command {
    #[cfg(unix)]
    {
        let shell = std::env::var("SHELL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "/bin/bash".to_string());
        let mut cmd = Command::new(shell);
        cmd.arg("-lc").arg(command);
        cmd.process_group(0);
        cmd
    }
    #[cfg(not(unix))]
    {
        let mut cmd = Command::new("cmd.exe");
        cmd.args(["/d", "/s", "/c", command]);
        cmd
    }
}

#[cfg(unix)]
pub fn signal_group(child: &Child, signal: nix::sys::signal::Signal) {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        let _ = killpg(Pid::from_raw(pid as i32), signal);
    }
}

/// Terminate politely, escalating to a kill after [`KILL_GRACE`]. Reaps the
/// child before returning.
pub async fn graceful_kill(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::Signal;

        signal_group(child, Signal::SIGTERM);
        tokio::select! {
            _ = tokio::time::sleep(KILL_GRACE) => {
                signal_group(child, Signal::SIGKILL);
                let _ = child.kill().await;
            }
            _ = child.wait() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.kill().await;
    }
}

/// Fold a child stream into a shared output ring, chunk by chunk.
pub async fn pump_stream<R>(mut reader: R, ring: Arc<Mutex<OutputRing>>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let text = String::from_utf8_lossy(&chunk[..n]).into_owned();
                ring.lock().await.push(&text);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[tokio::test]
    async fn shell_command_runs_through_a_login_shell() {
        let mut cmd = shell_command("printf ok");
        cmd.stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null());
        let output = cmd.output().await.expect("run");
        assert_eq!(String::from_utf8_lossy(&output.stdout), "ok");
    }
}
