//! §4.7.2: subprocess supervision.
//!
//! Spawns the agent CLI the way `claude_code/cli_client.rs` spawns the
//! Claude CLI binary (`Command::new`, piped stdio, `AsyncWriteExt` to
//! stdin), generalized to deliver the prompt via a temp file and to race
//! the child's exit against a context-threshold preemption signal, through
//! a `tokio::select!` shaped like `monitoring/mod.rs`'s collection loop.

use std::io::Write as _;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};

use crate::constants::SUBPROCESS_GRACE_PERIOD_SECS;
use crate::events::{AlertLevel, Event, EventBus, TrackerEvent};
use crate::{AppError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    Complete,
    Threshold,
    Error(String),
}

pub struct SessionOutput {
    pub exit_reason: ExitReason,
    pub stdout: String,
    pub stderr: String,
}

/// Guards against double-killing a child across the grace-period retry.
struct KillGuard {
    killed: AtomicBool,
}

impl KillGuard {
    fn new() -> Self {
        Self { killed: AtomicBool::new(false) }
    }

    fn should_kill(&self) -> bool {
        !self.killed.swap(true, Ordering::SeqCst)
    }
}

pub struct SubprocessSupervisor {
    agent_binary: String,
    context_threshold: f64,
}

impl SubprocessSupervisor {
    pub fn new(agent_binary: impl Into<String>, context_threshold: f64) -> Self {
        Self { agent_binary: agent_binary.into(), context_threshold }
    }

    /// Runs one agent session: writes `prompt` to a temp file, spawns the
    /// agent CLI with the project as its working directory, tees
    /// stdout/stderr to a per-session log file, and races the child's exit
    /// against threshold-crossing events scoped to `project_path`.
    pub async fn run_session(
        &self,
        prompt: &str,
        project_path: &std::path::Path,
        log_path: &std::path::Path,
        events: &EventBus,
    ) -> Result<SessionOutput> {
        let mut prompt_file = tempfile::NamedTempFile::new().map_err(AppError::Io)?;
        prompt_file.write_all(prompt.as_bytes()).map_err(AppError::Io)?;
        prompt_file.flush().map_err(AppError::Io)?;
        let prompt_path: PathBuf = prompt_file.path().to_path_buf();

        let mut command = Command::new(&self.agent_binary);
        command
            .current_dir(project_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|e| {
            AppError::Subprocess(format!("failed to spawn agent CLI {}: {e}", self.agent_binary))
        })?;

        if let Some(stdin) = child.stdin.as_mut() {
            let prompt_bytes = tokio::fs::read(&prompt_path).await?;
            stdin.write_all(&prompt_bytes).await.map_err(|e| {
                AppError::Subprocess(format!("failed to write prompt to agent stdin: {e}"))
            })?;
            stdin.flush().await.map_err(|e| AppError::Subprocess(format!("failed to flush agent stdin: {e}")))?;
        }

        let mut log_file = tokio::fs::File::create(log_path).await?;
        let kill_guard = Arc::new(KillGuard::new());
        let mut rx = events.subscribe();

        let exit_reason = loop {
            tokio::select! {
                status = child.wait() => {
                    let status = status.map_err(|e| AppError::Subprocess(format!("waiting on agent CLI failed: {e}")))?;
                    if status.success() {
                        break ExitReason::Complete;
                    }
                    break ExitReason::Error(format!("agent CLI exited with status {status}"));
                }
                event = rx.recv() => {
                    match event {
                        Ok(Event::Tracker(TrackerEvent::Threshold { level, project_path: event_project, utilization, .. })) => {
                            let project_matches =
                                event_project == crate::context_tracker::sanitize_project_path(project_path);
                            let crossed = matches!(level, AlertLevel::Warning | AlertLevel::Critical | AlertLevel::Emergency);
                            if project_matches && crossed && utilization >= self.context_threshold {
                                terminate(&mut child, &kill_guard).await;
                                break ExitReason::Threshold;
                            }
                        }
                        Ok(_) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => continue,
                    }
                }
            }
        };

        // Drain whatever output is available; never block supervision on it.
        let mut stdout = String::new();
        let mut stderr = String::new();
        if let Some(mut out) = child.stdout.take() {
            let _ = out.read_to_string(&mut stdout).await;
        }
        if let Some(mut err) = child.stderr.take() {
            let _ = err.read_to_string(&mut stderr).await;
        }
        log_file.write_all(stdout.as_bytes()).await?;
        log_file.write_all(stderr.as_bytes()).await?;
        log_file.flush().await?;

        // Unsubscribe happens implicitly on drop of `rx`; make it explicit
        // here so a reader does not need to infer it from scope.
        drop(rx);

        Ok(SessionOutput { exit_reason, stdout, stderr })
    }
}

/// Graceful termination first (SIGTERM), then a bounded grace period before
/// force-kill (SIGKILL). Idempotent: a second call on an already-terminated
/// guard is a no-op.
async fn terminate(child: &mut Child, guard: &Arc<KillGuard>) {
    if !guard.should_kill() {
        return;
    }

    if let Some(pid) = child.id() {
        #[cfg(unix)]
        {
            let nix_pid = nix::unistd::Pid::from_raw(pid as i32);
            let _ = nix::sys::signal::kill(nix_pid, nix::sys::signal::Signal::SIGTERM);
        }
    }

    let grace = Duration::from_secs(SUBPROCESS_GRACE_PERIOD_SECS);
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kill_guard_only_triggers_once() {
        let guard = KillGuard::new();
        assert!(guard.should_kill());
        assert!(!guard.should_kill());
    }
}
