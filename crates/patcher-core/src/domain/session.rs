//! Agent session lifecycle.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{PatcherError, Result};

/// Lifecycle of one supervised agent process.
///
/// `NotStarted -> Running -> {Completed, TimedOut, Killed, Crashed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    NotStarted,
    Running,
    /// Exited 0, or a submission was accepted (whatever the exit code).
    Completed,
    /// Wall-clock deadline elapsed; the process group was terminated.
    TimedOut,
    /// Terminated by the supervisor for a reason other than timeout.
    Killed,
    /// Exited non-zero (or died from a foreign signal) on its own.
    Crashed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed
                | SessionState::TimedOut
                | SessionState::Killed
                | SessionState::Crashed
        )
    }

    pub fn can_transition_to(&self, next: SessionState) -> bool {
        match (self, next) {
            (SessionState::NotStarted, SessionState::Running) => true,
            (SessionState::Running, next) => next.is_terminal(),
            _ => false,
        }
    }

    /// Validated transition.
    pub fn transition(self, next: SessionState) -> Result<SessionState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(PatcherError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }
}

/// Why the supervisor signalled the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Deadline,
    Abort,
    SubmissionAccepted,
}

/// Final report for one agent session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionReport {
    pub agent: String,
    pub state: SessionState,
    /// Raw exit code; `None` when the process died from a signal.
    pub exit_code: Option<i32>,
    pub termination: Option<TerminationReason>,
    /// SIGKILL was needed after the grace interval.
    pub forced_kill: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub deadline_secs: Option<u64>,
    pub stdout_log: PathBuf,
    pub stderr_log: PathBuf,
}

impl SessionReport {
    pub fn duration_ms(&self) -> u64 {
        (self.ended_at - self.started_at).num_milliseconds().max(0) as u64
    }
}
