//! Supervision of one agent session.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::backend::{AgentBackend, LaunchContext};
use super::signal;
use crate::domain::{PatcherError, Result, SessionReport, SessionState, TerminationReason};
use crate::obs;

pub const STDOUT_LOG: &str = "agent_stdout.log";
pub const STDERR_LOG: &str = "agent_stderr.log";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Wall-clock limit; `None` runs until the agent exits.
    pub deadline: Option<Duration>,
    /// Time between SIGTERM and SIGKILL.
    pub grace: Duration,
    /// Terminate the agent once a submission is accepted.
    pub stop_on_submission: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            deadline: None,
            grace: Duration::from_secs(2),
            stop_on_submission: true,
        }
    }
}

impl SupervisorConfig {
    /// `deadline_secs == 0` means no deadline.
    pub fn new(deadline_secs: u64, grace_ms: u64, stop_on_submission: bool) -> Self {
        Self {
            deadline: (deadline_secs > 0).then(|| Duration::from_secs(deadline_secs)),
            grace: Duration::from_millis(grace_ms),
            stop_on_submission,
        }
    }
}

/// Runs the agent process and drives it to a terminal [`SessionState`].
pub struct AgentSupervisor {
    backend: Arc<dyn AgentBackend>,
    config: SupervisorConfig,
    state: SessionState,
}

impl AgentSupervisor {
    pub fn new(backend: Arc<dyn AgentBackend>, config: SupervisorConfig) -> Self {
        Self {
            backend,
            config,
            state: SessionState::NotStarted,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn advance(&mut self, next: SessionState) -> Result<()> {
        self.state = self.state.transition(next)?;
        Ok(())
    }

    /// Run one session to completion.
    ///
    /// `abort` terminates the agent as `Killed`. `submitted` is cancelled by
    /// the watcher on acceptance; with `stop_on_submission` it ends the
    /// session early as `Completed`.
    pub async fn run(
        &mut self,
        ctx: &LaunchContext<'_>,
        abort: &CancellationToken,
        submitted: &CancellationToken,
    ) -> Result<SessionReport> {
        let agent = self.backend.name().to_string();
        let command = self.backend.command(ctx);

        tokio::fs::create_dir_all(ctx.work_dir).await?;
        let stdout_log = ctx.work_dir.join(STDOUT_LOG);
        let stderr_log = ctx.work_dir.join(STDERR_LOG);
        let stdout = tokio::fs::File::create(&stdout_log).await?.into_std().await;
        let stderr = tokio::fs::File::create(&stderr_log).await?.into_std().await;

        // Fails unless NotStarted; a supervisor runs exactly one session.
        self.advance(SessionState::Running)?;
        let started_at = Utc::now();

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(ctx.source_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                self.state = SessionState::Crashed;
                PatcherError::AgentLaunch {
                    agent: agent.clone(),
                    reason: format!("{}: {e}", command.program),
                }
            })?;

        let pid = child.id();
        let deadline_secs = self.config.deadline.map(|d| d.as_secs());
        obs::emit_agent_started(&agent, pid, deadline_secs);

        let deadline = self.config.deadline;
        let stop_on_submission = self.config.stop_on_submission;
        let exited = tokio::select! {
            biased;
            _ = submitted.cancelled(), if stop_on_submission => {
                Err(TerminationReason::SubmissionAccepted)
            }
            _ = abort.cancelled() => Err(TerminationReason::Abort),
            status = child.wait() => Ok(status?),
            _ = sleep_or_forever(deadline) => Err(TerminationReason::Deadline),
        };

        let (status, termination, forced_kill) = match exited {
            Ok(status) => {
                // Helpers the agent left behind in its group.
                if let Some(pid) = pid {
                    let _ = signal::kill_group(pid);
                }
                (status, None, false)
            }
            Err(reason) => {
                obs::emit_agent_terminating(&agent, reason);
                let (status, forced) = self.terminate(&mut child, pid).await?;
                (status, Some(reason), forced)
            }
        };

        let exit_code = status.code();
        let final_state = classify(termination, exit_code, submitted.is_cancelled());
        self.advance(final_state)?;
        obs::emit_agent_finished(&agent, final_state, exit_code, forced_kill);

        if final_state == SessionState::Crashed {
            warn!(
                event = "agent.crashed",
                agent = %agent,
                exit_code = ?exit_code,
                stderr_log = %stderr_log.display(),
            );
        }

        Ok(SessionReport {
            agent,
            state: final_state,
            exit_code,
            termination,
            forced_kill,
            started_at,
            ended_at: Utc::now(),
            deadline_secs,
            stdout_log,
            stderr_log,
        })
    }

    /// SIGTERM the group, wait out the grace interval, then SIGKILL.
    async fn terminate(&self, child: &mut Child, pid: Option<u32>) -> Result<(ExitStatus, bool)> {
        let Some(pid) = pid else {
            // Already reaped.
            return Ok((child.wait().await?, false));
        };

        signal::terminate_group(pid)?;
        match tokio::time::timeout(self.config.grace, child.wait()).await {
            Ok(status) => {
                let _ = signal::kill_group(pid);
                Ok((status?, false))
            }
            Err(_) => {
                info!(event = "agent.force_kill", pid = pid, grace_ms = self.config.grace.as_millis() as u64);
                signal::kill_group(pid)?;
                Ok((child.wait().await?, true))
            }
        }
    }
}

async fn sleep_or_forever(deadline: Option<Duration>) {
    match deadline {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

/// Terminal state for a finished session.
///
/// An accepted submission makes the session `Completed` whatever the exit
/// code or deadline. Only an operator abort overrides it.
pub fn classify(
    termination: Option<TerminationReason>,
    exit_code: Option<i32>,
    accepted: bool,
) -> SessionState {
    match termination {
        Some(TerminationReason::Abort) => SessionState::Killed,
        _ if accepted => SessionState::Completed,
        Some(TerminationReason::Deadline) => SessionState::TimedOut,
        Some(TerminationReason::SubmissionAccepted) => SessionState::Completed,
        None if exit_code == Some(0) => SessionState::Completed,
        None => SessionState::Crashed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_natural_exits() {
        assert_eq!(classify(None, Some(0), false), SessionState::Completed);
        assert_eq!(classify(None, Some(1), false), SessionState::Crashed);
        // Killed by a signal nobody here sent.
        assert_eq!(classify(None, None, false), SessionState::Crashed);
        assert_eq!(classify(None, Some(1), true), SessionState::Completed);
    }

    #[test]
    fn classify_supervisor_terminations() {
        assert_eq!(
            classify(Some(TerminationReason::Deadline), None, false),
            SessionState::TimedOut
        );
        assert_eq!(
            classify(Some(TerminationReason::Deadline), None, true),
            SessionState::Completed
        );
        assert_eq!(
            classify(Some(TerminationReason::Abort), None, true),
            SessionState::Killed
        );
        assert_eq!(
            classify(Some(TerminationReason::Abort), Some(0), false),
            SessionState::Killed
        );
        assert_eq!(
            classify(Some(TerminationReason::SubmissionAccepted), None, true),
            SessionState::Completed
        );
    }

    #[test]
    fn zero_deadline_means_none() {
        assert_eq!(SupervisorConfig::new(0, 2000, true).deadline, None);
        assert_eq!(
            SupervisorConfig::new(5, 10, false).deadline,
            Some(Duration::from_secs(5))
        );
    }
}
